//! The single-element threshold rule.

use std::any::Any;

use skein_model::{ArchiveReader, ArchiveWriter, ModelError, Node, NodeIo, PortSpec};
use skein_value::{ElementType, EmitError, FunctionEmitter, Scalar, Tensor};

/// Emits `true` iff one element of the input exceeds a threshold. The
/// decision rule of tree-predictor stumps.
#[derive(Clone)]
pub struct SingleElementThresholdNode {
    index: usize,
    threshold: f64,
    ty: ElementType,
    input_len: usize,
}

impl SingleElementThresholdNode {
    /// A rule testing `input[index] > threshold` over vectors of
    /// `input_len` elements.
    pub fn new(index: usize, threshold: f64, ty: ElementType, input_len: usize) -> Self {
        Self {
            index,
            threshold,
            ty,
            input_len,
        }
    }

    pub(crate) fn from_archive(reader: &ArchiveReader<'_>) -> Result<Box<dyn Node>, ModelError> {
        Ok(Box::new(Self {
            index: reader.get("index")?,
            threshold: reader.get("threshold")?,
            ty: reader.get("type")?,
            input_len: reader.get("input_len")?,
        }))
    }
}

impl Node for SingleElementThresholdNode {
    fn type_name(&self) -> &'static str {
        "single_element_threshold"
    }

    fn output_specs(&self) -> Vec<PortSpec> {
        vec![PortSpec::vector(ElementType::Bool, 1)]
    }

    fn validate_inputs(&self, inputs: &[PortSpec]) -> Result<(), ModelError> {
        match inputs {
            [one] if one.ty == self.ty && one.active_count() == self.input_len => {
                if self.index < self.input_len {
                    Ok(())
                } else {
                    Err(ModelError::InvalidGraph(format!(
                        "threshold index {} out of range {}",
                        self.index, self.input_len
                    )))
                }
            }
            [_] => Err(ModelError::ShapeMismatch {
                node: None,
                detail: "threshold input disagrees with its declared shape".to_owned(),
            }),
            _ => Err(ModelError::InvalidGraph("threshold takes one input".to_owned())),
        }
    }

    fn clone_box(&self) -> Box<dyn Node> {
        Box::new(self.clone())
    }

    fn is_compilable(&self) -> bool {
        true
    }

    fn compile(&self, fx: &mut FunctionEmitter<'_>, io: &NodeIo) -> Result<(), EmitError> {
        let element = fx.literal_index(self.index as i64);
        let x = crate::codegen::load_at(fx, &io.inputs[0], &[element])?;
        let threshold = fx.literal(
            Scalar::from_f64(self.ty, self.threshold).ok_or_else(|| EmitError::TypeMismatch {
                operation: "literal",
                detail: "threshold over a boolean input".to_owned(),
            })?,
        );
        let decision = fx.gt(x, threshold)?;
        let zero = fx.literal_index(0);
        crate::codegen::store_at(fx, &io.outputs[0], &[zero], decision)
    }

    fn compute(
        &self,
        inputs: &[&Tensor],
        _state: Option<&mut Tensor>,
    ) -> Result<Vec<Tensor>, ModelError> {
        let x = inputs[0].get(&[self.index]).as_f64().ok_or_else(|| {
            ModelError::InvalidGraph("threshold over a boolean tensor".to_owned())
        })?;
        Ok(vec![Tensor::from_vec(vec![x > self.threshold])])
    }

    fn archive(&self, writer: &mut ArchiveWriter) {
        writer.set("index", self.index);
        writer.set("threshold", self.threshold);
        writer.set("type", self.ty);
        writer.set("input_len", self.input_len);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
