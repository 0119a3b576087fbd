//! Simple forest predictors: sums of threshold stumps.

use std::any::Any;

use serde::{Deserialize, Serialize};

use skein_model::{
    ArchiveReader, ArchiveWriter, ModelError, Node, OutputPortRef, PortSpec, RefineContext,
};
use skein_value::{ElementType, Tensor};

use crate::codegen::tensor_from_f64;
use crate::constant::ConstantNode;
use crate::elementwise::{BinaryElementwiseNode, ElementwiseOp};
use crate::selector::ValueSelectorNode;
use crate::threshold::SingleElementThresholdNode;

/// One depth-one decision tree: test a feature against a threshold, emit
/// one of two values.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Stump {
    /// The feature index tested.
    pub feature: usize,
    /// The decision threshold.
    pub threshold: f64,
    /// Emitted when the feature does not exceed the threshold.
    pub low: f64,
    /// Emitted when the feature exceeds the threshold.
    pub high: f64,
}

/// A forest of stumps over a feature vector; the prediction is the sum of
/// the stump outputs. Refines into threshold, selector, constant, and add
/// nodes.
#[derive(Clone)]
pub struct SimpleForestNode {
    stumps: Vec<Stump>,
    ty: ElementType,
    input_len: usize,
}

impl SimpleForestNode {
    /// A forest over feature vectors of `input_len` elements.
    pub fn new(ty: ElementType, input_len: usize, stumps: Vec<Stump>) -> Result<Self, ModelError> {
        for stump in &stumps {
            if stump.feature >= input_len {
                return Err(ModelError::InvalidGraph(format!(
                    "stump feature {} out of range {}",
                    stump.feature, input_len
                )));
            }
        }
        Ok(Self {
            stumps,
            ty,
            input_len,
        })
    }

    /// The forest's stumps.
    pub fn stumps(&self) -> &[Stump] {
        &self.stumps
    }

    pub(crate) fn from_archive(reader: &ArchiveReader<'_>) -> Result<Box<dyn Node>, ModelError> {
        let ty: ElementType = reader.get("type")?;
        let input_len: usize = reader.get("input_len")?;
        let stumps: Vec<Stump> = reader.get("stumps")?;
        Ok(Box::new(Self::new(ty, input_len, stumps)?))
    }
}

impl Node for SimpleForestNode {
    fn type_name(&self) -> &'static str {
        "simple_forest"
    }

    fn output_specs(&self) -> Vec<PortSpec> {
        vec![PortSpec::vector(self.ty, 1)]
    }

    fn validate_inputs(&self, inputs: &[PortSpec]) -> Result<(), ModelError> {
        match inputs {
            [one] if one.ty == self.ty && one.active_count() == self.input_len => Ok(()),
            [_] => Err(ModelError::ShapeMismatch {
                node: None,
                detail: format!("forest expects {} features", self.input_len),
            }),
            _ => Err(ModelError::InvalidGraph("forest takes one input".to_owned())),
        }
    }

    fn clone_box(&self) -> Box<dyn Node> {
        Box::new(self.clone())
    }

    fn refine(&self, ctx: &mut RefineContext<'_>) -> Result<bool, ModelError> {
        let scalar = |value: f64| tensor_from_f64(self.ty, &[1], &[value]);
        let mut total: Option<OutputPortRef> = None;
        for stump in &self.stumps {
            let decision = ctx.add_node(
                SingleElementThresholdNode::new(
                    stump.feature,
                    stump.threshold,
                    self.ty,
                    self.input_len,
                ),
                &[ctx.input(0)],
            )?;
            let high = ctx.add_node(ConstantNode::new(scalar(stump.high)), &[])?;
            let low = ctx.add_node(ConstantNode::new(scalar(stump.low)), &[])?;
            let selected = ctx.add_node(
                ValueSelectorNode::new(self.ty, &[1]),
                &[
                    OutputPortRef { node: decision, port: 0 },
                    OutputPortRef { node: high, port: 0 },
                    OutputPortRef { node: low, port: 0 },
                ],
            )?;
            let selected = OutputPortRef { node: selected, port: 0 };
            total = Some(match total {
                None => selected,
                Some(prior) => {
                    let sum = ctx.add_node(
                        BinaryElementwiseNode::new(ElementwiseOp::Add, self.ty, &[1]),
                        &[prior, selected],
                    )?;
                    OutputPortRef { node: sum, port: 0 }
                }
            });
        }
        let total = match total {
            Some(port) => port,
            // An empty forest predicts zero.
            None => {
                let zero = ctx.add_node(ConstantNode::new(scalar(0.0)), &[])?;
                OutputPortRef { node: zero, port: 0 }
            }
        };
        ctx.map_output(0, total);
        Ok(true)
    }

    fn compute(
        &self,
        inputs: &[&Tensor],
        _state: Option<&mut Tensor>,
    ) -> Result<Vec<Tensor>, ModelError> {
        let mut total = 0.0;
        for stump in &self.stumps {
            let x = inputs[0].get(&[stump.feature]).as_f64().ok_or_else(|| {
                ModelError::InvalidGraph("forest over a boolean tensor".to_owned())
            })?;
            total += if x > stump.threshold { stump.high } else { stump.low };
        }
        Ok(vec![tensor_from_f64(self.ty, &[1], &[total])])
    }

    fn archive(&self, writer: &mut ArchiveWriter) {
        writer.set("type", self.ty);
        writer.set("input_len", self.input_len);
        writer.set("stumps", &self.stumps);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sums_stump_votes() {
        let node = SimpleForestNode::new(
            ElementType::F64,
            2,
            vec![
                Stump { feature: 0, threshold: 0.5, low: -1.0, high: 1.0 },
                Stump { feature: 1, threshold: 0.0, low: 0.0, high: 2.0 },
            ],
        )
        .unwrap();
        let input = Tensor::from_vec(vec![0.75f64, -3.0]);
        let out = node.compute(&[&input], None).unwrap();
        assert_eq!(Some(vec![1.0f64]), out[0].to_vec::<f64>());
    }
}
