//! Extremal-value nodes: min/max with the winning index.

use std::any::Any;

use serde::{Deserialize, Serialize};

use skein_model::{ArchiveReader, ArchiveWriter, ModelError, Node, NodeIo, PortSpec};
use skein_value::{ElementType, EmitError, FunctionEmitter, Scalar, Tensor};

use crate::codegen::{load_at, store_at, values_f64};

/// Which extremum to track.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtremalMode {
    /// Smallest element.
    Min,
    /// Largest element.
    Max,
}

/// Scans a vector for its extremal element. Two outputs: the value, and the
/// index at which it first occurs.
#[derive(Clone)]
pub struct ExtremalValueNode {
    mode: ExtremalMode,
    ty: ElementType,
    input_len: usize,
}

impl ExtremalValueNode {
    /// An extremal scan over vectors of `input_len` elements.
    pub fn new(mode: ExtremalMode, ty: ElementType, input_len: usize) -> Self {
        Self {
            mode,
            ty,
            input_len,
        }
    }

    pub(crate) fn from_archive(reader: &ArchiveReader<'_>) -> Result<Box<dyn Node>, ModelError> {
        Ok(Box::new(Self {
            mode: reader.get("mode")?,
            ty: reader.get("type")?,
            input_len: reader.get("input_len")?,
        }))
    }
}

impl Node for ExtremalValueNode {
    fn type_name(&self) -> &'static str {
        "extremal_value"
    }

    fn output_specs(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::vector(self.ty, 1),
            PortSpec::vector(ElementType::I64, 1),
        ]
    }

    fn validate_inputs(&self, inputs: &[PortSpec]) -> Result<(), ModelError> {
        match inputs {
            [one] if one.ty == self.ty
                && one.layout.rank() == 1
                && one.active_count() == self.input_len
                && self.input_len > 0 => Ok(()),
            [_] => Err(ModelError::ShapeMismatch {
                node: None,
                detail: "extremal scan expects a non-empty vector".to_owned(),
            }),
            _ => Err(ModelError::InvalidGraph("extremal scan takes one input".to_owned())),
        }
    }

    fn clone_box(&self) -> Box<dyn Node> {
        Box::new(self.clone())
    }

    fn is_compilable(&self) -> bool {
        true
    }

    fn compile(&self, fx: &mut FunctionEmitter<'_>, io: &NodeIo) -> Result<(), EmitError> {
        let zero = fx.literal_index(0);
        let seed = load_at(fx, &io.inputs[0], &[zero])?;
        store_at(fx, &io.outputs[0], &[zero], seed)?;
        store_at(fx, &io.outputs[1], &[zero], zero)?;

        let mode = self.mode;
        fx.for_range(1, self.input_len as i64, |fx, i| {
            let zero = fx.literal_index(0);
            let candidate = load_at(fx, &io.inputs[0], &[i])?;
            let best = load_at(fx, &io.outputs[0], &[zero])?;
            let wins = match mode {
                ExtremalMode::Min => fx.lt(candidate, best)?,
                ExtremalMode::Max => fx.gt(candidate, best)?,
            };
            fx.if_then(wins, |fx| {
                let zero = fx.literal_index(0);
                store_at(fx, &io.outputs[0], &[zero], candidate)?;
                store_at(fx, &io.outputs[1], &[zero], i)
            })
        })
    }

    fn compute(
        &self,
        inputs: &[&Tensor],
        _state: Option<&mut Tensor>,
    ) -> Result<Vec<Tensor>, ModelError> {
        let values = values_f64(inputs[0])?;
        let mut best = values[0];
        let mut best_index = 0usize;
        for (i, &v) in values.iter().enumerate().skip(1) {
            let wins = match self.mode {
                ExtremalMode::Min => v < best,
                ExtremalMode::Max => v > best,
            };
            if wins {
                best = v;
                best_index = i;
            }
        }
        let mut value = Tensor::zeros(self.ty, skein_value::MemoryLayout::vector(1));
        value.set(&[0], Scalar::from_f64(self.ty, best).expect("numeric element type"));
        Ok(vec![value, Tensor::from_vec(vec![best_index as i64])])
    }

    fn archive(&self, writer: &mut ArchiveWriter) {
        writer.set("mode", self.mode);
        writer.set("type", self.ty);
        writer.set("input_len", self.input_len);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_the_argmax() {
        let node = ExtremalValueNode::new(ExtremalMode::Max, ElementType::F32, 4);
        let input = Tensor::from_vec(vec![0.25f32, 4.0, 1.0, 4.0]);
        let out = node.compute(&[&input], None).unwrap();
        assert_eq!(Some(vec![4.0f32]), out[0].to_vec::<f32>());
        assert_eq!(Some(vec![1i64]), out[1].to_vec::<i64>());
    }
}
