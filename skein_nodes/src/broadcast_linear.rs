//! The broadcast linear-function node: `x ↦ a·x + b` along one axis.

use std::any::Any;

use skein_model::{ArchiveReader, ArchiveWriter, ModelError, Node, NodeIo, PortSpec};
use skein_value::{EmitError, FunctionEmitter, MemoryLayout, Tensor};

use crate::codegen::{for_each_index, load_at, store_at, tensor_from_f64, values_f64};

/// Applies a per-channel scale and shift along a broadcast axis: for an
/// element at index `i`, the output is `a[i[axis]] * x + b[i[axis]]`.
///
/// Chains of these nodes along the same axis fuse into one: the pass
/// composes the coefficient pairs with [`BroadcastLinearNode::fuse_after`].
#[derive(Clone)]
pub struct BroadcastLinearNode {
    scale: Tensor,
    bias: Tensor,
    axis: usize,
    input_shape: Vec<usize>,
}

impl BroadcastLinearNode {
    /// A linear node over canonical tensors of `input_shape`, broadcasting
    /// `scale`/`bias` (one-dimensional, of the axis's length) along `axis`.
    pub fn new(
        scale: Tensor,
        bias: Tensor,
        axis: usize,
        input_shape: &[usize],
    ) -> Result<Self, ModelError> {
        if scale.element_type() != bias.element_type() {
            return Err(ModelError::TypeMismatch {
                node: None,
                expected: scale.element_type(),
                actual: bias.element_type(),
            });
        }
        if axis >= input_shape.len() {
            return Err(ModelError::InvalidGraph(format!(
                "broadcast axis {axis} out of range for rank {}",
                input_shape.len()
            )));
        }
        let channels = input_shape[axis];
        if scale.layout().active_count() != channels || bias.layout().active_count() != channels {
            return Err(ModelError::ShapeMismatch {
                node: None,
                detail: format!(
                    "coefficients must have {channels} elements for axis {axis}"
                ),
            });
        }
        Ok(Self {
            scale,
            bias,
            axis,
            input_shape: input_shape.to_vec(),
        })
    }

    /// The scale coefficients.
    pub fn scale(&self) -> &Tensor {
        &self.scale
    }

    /// The shift coefficients.
    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    /// The broadcast axis.
    pub fn axis(&self) -> usize {
        self.axis
    }

    /// The declared input shape.
    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    /// Composes this node with a node applied after it: the result computes
    /// `next(self(x))`, with coefficients `(a₂·a₁, a₂·b₁ + b₂)`. Both nodes
    /// must broadcast along the same axis over the same shape.
    pub fn fuse_after(&self, next: &BroadcastLinearNode) -> Result<BroadcastLinearNode, ModelError> {
        if self.axis != next.axis || self.input_shape != next.input_shape {
            return Err(ModelError::InvalidGraph(
                "only linear nodes over the same broadcast axis fuse".to_owned(),
            ));
        }
        let ty = self.scale.element_type();
        let (a1, b1) = (values_f64(&self.scale)?, values_f64(&self.bias)?);
        let (a2, b2) = (values_f64(&next.scale)?, values_f64(&next.bias)?);
        let channels = a1.len();
        let mut scale = Vec::with_capacity(channels);
        let mut bias = Vec::with_capacity(channels);
        for c in 0..channels {
            scale.push(a2[c] * a1[c]);
            bias.push(a2[c] * b1[c] + b2[c]);
        }
        BroadcastLinearNode::new(
            tensor_from_f64(ty, &[channels], &scale),
            tensor_from_f64(ty, &[channels], &bias),
            self.axis,
            &self.input_shape,
        )
    }

    pub(crate) fn from_archive(reader: &ArchiveReader<'_>) -> Result<Box<dyn Node>, ModelError> {
        let scale: Tensor = reader.get("scale")?;
        let bias: Tensor = reader.get("bias")?;
        let axis: usize = reader.get("axis")?;
        let input_shape: Vec<usize> = reader.get("input_shape")?;
        Ok(Box::new(Self::new(scale, bias, axis, &input_shape)?))
    }
}

impl Node for BroadcastLinearNode {
    fn type_name(&self) -> &'static str {
        "broadcast_linear"
    }

    fn output_specs(&self) -> Vec<PortSpec> {
        vec![PortSpec {
            ty: self.scale.element_type(),
            layout: MemoryLayout::canonical(&self.input_shape),
        }]
    }

    fn validate_inputs(&self, inputs: &[PortSpec]) -> Result<(), ModelError> {
        match inputs {
            [one] if one.ty == self.scale.element_type()
                && one.layout.active() == self.input_shape.as_slice() => Ok(()),
            [one] if one.ty != self.scale.element_type() => Err(ModelError::TypeMismatch {
                node: None,
                expected: self.scale.element_type(),
                actual: one.ty,
            }),
            [_] => Err(ModelError::ShapeMismatch {
                node: None,
                detail: "input disagrees with the declared broadcast shape".to_owned(),
            }),
            _ => Err(ModelError::InvalidGraph(
                "broadcast linear nodes take one input".to_owned(),
            )),
        }
    }

    fn clone_box(&self) -> Box<dyn Node> {
        Box::new(self.clone())
    }

    fn is_compilable(&self) -> bool {
        true
    }

    fn compile(&self, fx: &mut FunctionEmitter<'_>, io: &NodeIo) -> Result<(), EmitError> {
        let scale = fx
            .module()
            .add_constant("linear_scale", self.scale.buffer().clone());
        let bias = fx
            .module()
            .add_constant("linear_bias", self.bias.buffer().clone());
        let scale = fx.global_ref(scale);
        let bias = fx.global_ref(bias);
        let axis = self.axis;
        for_each_index(fx, &self.input_shape.clone(), &mut |fx, indices| {
            let x = load_at(fx, &io.inputs[0], indices)?;
            let channel = indices[axis];
            let a = fx.load(scale, channel)?;
            let b = fx.load(bias, channel)?;
            let scaled = fx.mul(a, x)?;
            let value = fx.add(scaled, b)?;
            store_at(fx, &io.outputs[0], indices, value)
        })
    }

    fn compute(
        &self,
        inputs: &[&Tensor],
        _state: Option<&mut Tensor>,
    ) -> Result<Vec<Tensor>, ModelError> {
        let a = values_f64(&self.scale)?;
        let b = values_f64(&self.bias)?;
        let ty = self.scale.element_type();
        let mut out = Vec::with_capacity(inputs[0].layout().active_count());
        for index in inputs[0].layout().active_indices() {
            let x = inputs[0].get(&index).as_f64().ok_or_else(|| {
                ModelError::InvalidGraph("arithmetic on a boolean tensor".to_owned())
            })?;
            let c = index[self.axis];
            out.push(a[c] * x + b[c]);
        }
        Ok(vec![tensor_from_f64(ty, &self.input_shape, &out)])
    }

    fn archive(&self, writer: &mut ArchiveWriter) {
        writer.set("scale", &self.scale);
        writer.set("bias", &self.bias);
        writer.set("axis", self.axis);
        writer.set("input_shape", &self.input_shape);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_value::ElementType;

    fn linear(scale: Vec<f32>, bias: Vec<f32>) -> BroadcastLinearNode {
        let shape = vec![scale.len()];
        BroadcastLinearNode::new(
            Tensor::from_vec(scale),
            Tensor::from_vec(bias),
            0,
            &shape,
        )
        .unwrap()
    }

    #[test]
    fn applies_scale_and_shift() {
        let node = linear(vec![2.0; 4], vec![1.0; 4]);
        let input = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0]);
        let out = node.compute(&[&input], None).unwrap();
        assert_eq!(Some(vec![3.0f32, 5.0, 7.0, 9.0]), out[0].to_vec::<f32>());
    }

    #[test]
    fn fusion_composes_coefficients() {
        let first = linear(vec![2.0; 4], vec![1.0; 4]);
        let second = linear(vec![3.0; 4], vec![0.0; 4]);
        let fused = first.fuse_after(&second).unwrap();
        assert_eq!(Some(vec![6.0f32; 4]), fused.scale().to_vec::<f32>());
        assert_eq!(Some(vec![3.0f32; 4]), fused.bias().to_vec::<f32>());

        let input = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0]);
        let out = fused.compute(&[&input], None).unwrap();
        assert_eq!(Some(vec![9.0f32, 15.0, 21.0, 27.0]), out[0].to_vec::<f32>());
    }

    #[test]
    fn mismatched_axes_do_not_fuse() {
        let a = BroadcastLinearNode::new(
            Tensor::from_vec(vec![1.0f32, 1.0]),
            Tensor::from_vec(vec![0.0f32, 0.0]),
            0,
            &[2, 2],
        )
        .unwrap();
        let b = BroadcastLinearNode::new(
            Tensor::from_vec(vec![1.0f32, 1.0]),
            Tensor::from_vec(vec![0.0f32, 0.0]),
            1,
            &[2, 2],
        )
        .unwrap();
        assert!(a.fuse_after(&b).is_err());
        let _ = ElementType::F32;
    }
}
