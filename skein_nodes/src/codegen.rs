//! Shared emission and reference-computation helpers for the node library.

use skein_model::ModelError;
use skein_value::loopnests::{ViewBinding, emit_layout_offset};
use skein_value::{ElementType, EmitError, FunctionEmitter, Scalar, Tensor, ValueId};

/// Emits nested loops over a rectangular active region, handing the body
/// the index handles, innermost last.
pub(crate) fn for_each_index(
    fx: &mut FunctionEmitter<'_>,
    shape: &[usize],
    body: &mut dyn FnMut(&mut FunctionEmitter<'_>, &[ValueId]) -> Result<(), EmitError>,
) -> Result<(), EmitError> {
    fn rec(
        fx: &mut FunctionEmitter<'_>,
        shape: &[usize],
        indices: &mut Vec<ValueId>,
        body: &mut dyn FnMut(&mut FunctionEmitter<'_>, &[ValueId]) -> Result<(), EmitError>,
    ) -> Result<(), EmitError> {
        let d = indices.len();
        if d == shape.len() {
            return body(fx, indices);
        }
        fx.for_range(0, shape[d] as i64, |fx, v| {
            indices.push(v);
            let result = rec(fx, shape, indices, body);
            indices.pop();
            result
        })
    }
    rec(fx, shape, &mut Vec::new(), body)
}

/// Loads the element of a bound view at the given logical indices.
pub(crate) fn load_at(
    fx: &mut FunctionEmitter<'_>,
    view: &ViewBinding,
    indices: &[ValueId],
) -> Result<ValueId, EmitError> {
    let offset = emit_layout_offset(fx, &view.layout, indices)?;
    fx.load(view.ptr, offset)
}

/// Stores into the element of a bound view at the given logical indices.
pub(crate) fn store_at(
    fx: &mut FunctionEmitter<'_>,
    view: &ViewBinding,
    indices: &[ValueId],
    value: ValueId,
) -> Result<(), EmitError> {
    let offset = emit_layout_offset(fx, &view.layout, indices)?;
    fx.store(view.ptr, offset, value)
}

/// The active values of a numeric tensor, widened to `f64`, in logical
/// row-major order.
pub(crate) fn values_f64(tensor: &Tensor) -> Result<Vec<f64>, ModelError> {
    let mut out = Vec::with_capacity(tensor.layout().active_count());
    for index in tensor.layout().active_indices() {
        let value = tensor.get(&index).as_f64().ok_or_else(|| {
            ModelError::InvalidGraph("arithmetic on a boolean tensor".to_owned())
        })?;
        out.push(value);
    }
    Ok(out)
}

/// A canonical tensor of the given shape from widened values.
pub(crate) fn tensor_from_f64(
    ty: ElementType,
    shape: &[usize],
    values: &[f64],
) -> Tensor {
    let mut tensor = Tensor::zeros(ty, skein_value::MemoryLayout::canonical(shape));
    let indices: Vec<_> = tensor.layout().active_indices().collect();
    for (index, &value) in indices.into_iter().zip(values) {
        tensor.set(&index, Scalar::from_f64(ty, value).expect("numeric element type"));
    }
    tensor
}
