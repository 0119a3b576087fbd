//! Windowing nodes: multiply a frame by a fixed window function.

use std::any::Any;

use serde::{Deserialize, Serialize};

use skein_model::{
    ArchiveReader, ArchiveWriter, ModelError, Node, PortSpec, RefineContext,
};
use skein_value::{ElementType, Tensor};

use crate::codegen::{tensor_from_f64, values_f64};
use crate::constant::ConstantNode;
use crate::elementwise::{BinaryElementwiseNode, ElementwiseOp};

/// The supported window functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowKind {
    /// Hamming window: `0.54 - 0.46·cos(2πn/(N-1))`.
    Hamming,
    /// Hann window: `0.5·(1 - cos(2πn/(N-1)))`.
    Hann,
}

/// Computes the window coefficients for a frame of `size` samples.
pub fn window_values(kind: WindowKind, size: usize) -> Vec<f64> {
    if size == 1 {
        return vec![1.0];
    }
    let denom = (size - 1) as f64;
    (0..size)
        .map(|n| {
            let phase = (2.0 * std::f64::consts::PI * n as f64 / denom).cos();
            match kind {
                WindowKind::Hamming => 0.54 - 0.46 * phase,
                WindowKind::Hann => 0.5 * (1.0 - phase),
            }
        })
        .collect()
}

/// Multiplies its input frame by a window function.
///
/// The node is not compilable itself; it refines into a constant node
/// holding the window coefficients and an elementwise multiply.
#[derive(Clone)]
pub struct WindowNode {
    kind: WindowKind,
    ty: ElementType,
    size: usize,
}

impl WindowNode {
    /// A window node over frames of `size` samples.
    pub fn new(kind: WindowKind, ty: ElementType, size: usize) -> Self {
        Self { kind, ty, size }
    }

    /// The window function.
    pub fn kind(&self) -> WindowKind {
        self.kind
    }

    pub(crate) fn from_archive(reader: &ArchiveReader<'_>) -> Result<Box<dyn Node>, ModelError> {
        let kind: WindowKind = reader.get("kind")?;
        let ty: ElementType = reader.get("type")?;
        let size: usize = reader.get("size")?;
        Ok(Box::new(Self { kind, ty, size }))
    }
}

impl Node for WindowNode {
    fn type_name(&self) -> &'static str {
        "window"
    }

    fn output_specs(&self) -> Vec<PortSpec> {
        vec![PortSpec::vector(self.ty, self.size)]
    }

    fn validate_inputs(&self, inputs: &[PortSpec]) -> Result<(), ModelError> {
        match inputs {
            [one] if one.ty == self.ty && one.active_count() == self.size => Ok(()),
            [_] => Err(ModelError::ShapeMismatch {
                node: None,
                detail: format!("window expects a {}-sample frame", self.size),
            }),
            _ => Err(ModelError::InvalidGraph("window takes one input".to_owned())),
        }
    }

    fn clone_box(&self) -> Box<dyn Node> {
        Box::new(self.clone())
    }

    fn refine(&self, ctx: &mut RefineContext<'_>) -> Result<bool, ModelError> {
        let coefficients = tensor_from_f64(
            self.ty,
            &[self.size],
            &window_values(self.kind, self.size),
        );
        let window = ctx.add_node(ConstantNode::new(coefficients), &[])?;
        let product = ctx.add_node(
            BinaryElementwiseNode::new(ElementwiseOp::Multiply, self.ty, &[self.size]),
            &[ctx.input(0), skein_model::OutputPortRef { node: window, port: 0 }],
        )?;
        ctx.map_output(0, skein_model::OutputPortRef { node: product, port: 0 });
        Ok(true)
    }

    fn compute(
        &self,
        inputs: &[&Tensor],
        _state: Option<&mut Tensor>,
    ) -> Result<Vec<Tensor>, ModelError> {
        let x = values_f64(inputs[0])?;
        let w = window_values(self.kind, self.size);
        let out: Vec<f64> = x.iter().zip(&w).map(|(a, b)| a * b).collect();
        Ok(vec![tensor_from_f64(self.ty, &[self.size], &out)])
    }

    fn archive(&self, writer: &mut ArchiveWriter) {
        writer.set("kind", self.kind);
        writer.set("type", self.ty);
        writer.set("size", self.size);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hamming_endpoints_and_symmetry() {
        let w = window_values(WindowKind::Hamming, 5);
        assert!((w[0] - 0.08).abs() < 1e-12);
        assert!((w[4] - 0.08).abs() < 1e-12);
        assert!((w[2] - 1.0).abs() < 1e-12);
        assert!((w[1] - w[3]).abs() < 1e-12);
    }

    #[test]
    fn hann_endpoints_are_zero() {
        let w = window_values(WindowKind::Hann, 4);
        assert!(w[0].abs() < 1e-12);
        assert!(w[3].abs() < 1e-12);
    }

    #[test]
    fn window_scales_the_frame() {
        let node = WindowNode::new(WindowKind::Hann, ElementType::F64, 3);
        let input = Tensor::from_vec(vec![2.0f64, 2.0, 2.0]);
        let out = node.compute(&[&input], None).unwrap();
        let values = out[0].to_vec::<f64>().unwrap();
        assert!((values[0]).abs() < 1e-12);
        assert!((values[1] - 2.0).abs() < 1e-12);
        assert!((values[2]).abs() < 1e-12);
    }
}
