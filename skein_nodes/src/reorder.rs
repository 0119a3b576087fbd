//! The reorder-data node: permutes logical dimensions.

use std::any::Any;

use skein_model::{ArchiveReader, ArchiveWriter, ModelError, Node, NodeIo, PortSpec};
use skein_value::{DimensionOrder, EmitError, FunctionEmitter, Scalar, Tensor};

use crate::codegen::{for_each_index, load_at, store_at};

/// Transposes its input: output dimension `d` is input dimension
/// `permutation[d]`, and the result is stored canonically.
///
/// Consecutive reorders compose ([`ReorderDataNode::compose_after`]); a
/// reorder whose effective permutation is the identity over equivalent
/// layouts does nothing, and the reorder-elision pass removes it.
#[derive(Clone)]
pub struct ReorderDataNode {
    input_spec: PortSpec,
    permutation: DimensionOrder,
}

impl ReorderDataNode {
    /// A reorder over inputs of `input_spec` by the given permutation.
    pub fn new(input_spec: PortSpec, permutation: DimensionOrder) -> Result<Self, ModelError> {
        if permutation.rank() != input_spec.layout.rank() {
            return Err(ModelError::ShapeMismatch {
                node: None,
                detail: format!(
                    "permutation of rank {} over input of rank {}",
                    permutation.rank(),
                    input_spec.layout.rank()
                ),
            });
        }
        Ok(Self {
            input_spec,
            permutation,
        })
    }

    /// The permutation applied.
    pub fn permutation(&self) -> &DimensionOrder {
        &self.permutation
    }

    /// The declared input spec.
    pub fn input_spec(&self) -> &PortSpec {
        &self.input_spec
    }

    /// True if this reorder maps equivalent layouts onto themselves (its
    /// permutation is the identity).
    pub fn is_identity(&self) -> bool {
        self.permutation.is_identity()
    }

    /// The single reorder equivalent to applying `self` and then `next`.
    pub fn compose_after(&self, next: &ReorderDataNode) -> Result<ReorderDataNode, ModelError> {
        ReorderDataNode::new(
            self.input_spec.clone(),
            self.permutation.then(next.permutation()),
        )
    }

    fn output_shape(&self) -> Vec<usize> {
        self.permutation.permute(self.input_spec.layout.active())
    }

    pub(crate) fn from_archive(reader: &ArchiveReader<'_>) -> Result<Box<dyn Node>, ModelError> {
        let input_spec: PortSpec = reader.get("input_spec")?;
        let permutation: Vec<usize> = reader.get("permutation")?;
        Ok(Box::new(Self::new(
            input_spec,
            DimensionOrder::new(permutation)?,
        )?))
    }
}

impl Node for ReorderDataNode {
    fn type_name(&self) -> &'static str {
        "reorder_data"
    }

    fn output_specs(&self) -> Vec<PortSpec> {
        vec![PortSpec::shaped(self.input_spec.ty, &self.output_shape())]
    }

    fn validate_inputs(&self, inputs: &[PortSpec]) -> Result<(), ModelError> {
        match inputs {
            [one] if one.ty == self.input_spec.ty
                && one.layout.active() == self.input_spec.layout.active() => Ok(()),
            [one] if one.ty != self.input_spec.ty => Err(ModelError::TypeMismatch {
                node: None,
                expected: self.input_spec.ty,
                actual: one.ty,
            }),
            [_] => Err(ModelError::ShapeMismatch {
                node: None,
                detail: "input disagrees with the declared reorder shape".to_owned(),
            }),
            _ => Err(ModelError::InvalidGraph("reorder takes one input".to_owned())),
        }
    }

    fn clone_box(&self) -> Box<dyn Node> {
        Box::new(self.clone())
    }

    fn is_compilable(&self) -> bool {
        true
    }

    fn compile(&self, fx: &mut FunctionEmitter<'_>, io: &NodeIo) -> Result<(), EmitError> {
        let shape = self.output_shape();
        let perm = self.permutation.clone();
        let rank = shape.len();
        for_each_index(fx, &shape, &mut |fx, out_index| {
            // in[k] = out[position of k in the permutation]
            let mut in_index = vec![out_index[0]; rank];
            for (pos, &dim) in perm.as_slice().iter().enumerate() {
                in_index[dim] = out_index[pos];
            }
            let value = load_at(fx, &io.inputs[0], &in_index)?;
            store_at(fx, &io.outputs[0], out_index, value)
        })
    }

    fn compute(
        &self,
        inputs: &[&Tensor],
        _state: Option<&mut Tensor>,
    ) -> Result<Vec<Tensor>, ModelError> {
        let shape = self.output_shape();
        let mut out = Tensor::zeros(
            self.input_spec.ty,
            skein_value::MemoryLayout::canonical(&shape),
        );
        let rank = shape.len();
        for out_index in out.layout().active_indices().collect::<Vec<_>>() {
            let mut in_index = vec![0usize; rank];
            for (pos, &dim) in self.permutation.as_slice().iter().enumerate() {
                in_index[dim] = out_index[pos];
            }
            let value: Scalar = inputs[0].get(&in_index);
            out.set(&out_index, value);
        }
        Ok(vec![out])
    }

    fn archive(&self, writer: &mut ArchiveWriter) {
        writer.set("input_spec", &self.input_spec);
        writer.set("permutation", self.permutation.as_slice());
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_value::ElementType;

    #[test]
    fn transposes_a_matrix() {
        let spec = PortSpec::shaped(ElementType::I32, &[2, 3]);
        let node =
            ReorderDataNode::new(spec, DimensionOrder::new(vec![1, 0]).unwrap()).unwrap();
        let mut input = Tensor::zeros(ElementType::I32, skein_value::MemoryLayout::canonical(&[2, 3]));
        input.fill_from(&[1, 2, 3, 4, 5, 6]).unwrap();
        let out = node.compute(&[&input], None).unwrap();
        assert_eq!(&[3, 2], out[0].layout().active());
        assert_eq!(Some(vec![1, 4, 2, 5, 3, 6]), out[0].to_vec::<i32>());
    }

    #[test]
    fn inverse_permutations_compose_to_identity() {
        let spec = PortSpec::shaped(ElementType::F32, &[2, 3, 4]);
        let first =
            ReorderDataNode::new(spec.clone(), DimensionOrder::new(vec![2, 0, 1]).unwrap())
                .unwrap();
        let second = ReorderDataNode::new(
            PortSpec::shaped(ElementType::F32, &[4, 2, 3]),
            DimensionOrder::new(vec![1, 2, 0]).unwrap(),
        )
        .unwrap();
        let composed = first.compose_after(&second).unwrap();
        assert!(composed.is_identity());
    }
}
