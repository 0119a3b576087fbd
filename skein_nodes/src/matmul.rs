//! The matrix–vector product code node.
//!
//! Compiles through the loop-nest layer: a tiled, partially unrolled
//! schedule with the operand vector staged through a caching provider.

use std::any::Any;

use skein_model::{ArchiveReader, ArchiveWriter, ModelError, Node, NodeIo, PortSpec};
use skein_value::loopnests::{CacheSpec, CopyIn, Kernel, LoopNest};
use skein_value::{ElementType, EmitError, FunctionEmitter, Scalar, Tensor};

use crate::codegen::{tensor_from_f64, values_f64};

const ROW_TILE: i64 = 4;
const COL_UNROLL: i64 = 4;

/// Computes `out = A · x` for a matrix `A` of `rows × cols` and a vector
/// `x` of `cols` elements.
#[derive(Clone)]
pub struct MatrixVectorProductNode {
    rows: usize,
    cols: usize,
    ty: ElementType,
}

impl MatrixVectorProductNode {
    /// A product over a `rows × cols` matrix.
    pub fn new(ty: ElementType, rows: usize, cols: usize) -> Self {
        Self { rows, cols, ty }
    }

    pub(crate) fn from_archive(reader: &ArchiveReader<'_>) -> Result<Box<dyn Node>, ModelError> {
        Ok(Box::new(Self {
            rows: reader.get("rows")?,
            cols: reader.get("cols")?,
            ty: reader.get("type")?,
        }))
    }
}

impl Node for MatrixVectorProductNode {
    fn type_name(&self) -> &'static str {
        "matrix_vector_product"
    }

    fn output_specs(&self) -> Vec<PortSpec> {
        vec![PortSpec::vector(self.ty, self.rows)]
    }

    fn validate_inputs(&self, inputs: &[PortSpec]) -> Result<(), ModelError> {
        let [matrix, vector] = inputs else {
            return Err(ModelError::InvalidGraph(
                "matrix-vector product takes a matrix and a vector".to_owned(),
            ));
        };
        if matrix.ty != self.ty || vector.ty != self.ty {
            return Err(ModelError::TypeMismatch {
                node: None,
                expected: self.ty,
                actual: if matrix.ty != self.ty { matrix.ty } else { vector.ty },
            });
        }
        if matrix.layout.active() != [self.rows, self.cols].as_slice() {
            return Err(ModelError::ShapeMismatch {
                node: None,
                detail: format!("matrix must be {}x{}", self.rows, self.cols),
            });
        }
        if vector.active_count() != self.cols {
            return Err(ModelError::ShapeMismatch {
                node: None,
                detail: format!("vector must have {} elements", self.cols),
            });
        }
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn Node> {
        Box::new(self.clone())
    }

    fn is_compilable(&self) -> bool {
        true
    }

    fn compile(&self, fx: &mut FunctionEmitter<'_>, io: &NodeIo) -> Result<(), EmitError> {
        let ty = self.ty;
        let mut nest = LoopNest::new();
        nest.set_scratch_limit(io.scratch_limit);
        let i = nest.index("i", 0, self.rows as i64);
        let j = nest.index("j", 0, self.cols as i64);
        let matrix = nest.using("matrix");
        let vector = nest.using("vector");
        let out = nest.using("out");

        nest.add_kernel(
            Kernel::new("clear_row")
                .args(&[out])
                .indices(&[i.clone()])
                .define(move |fx, ctx| {
                    let zero = fx.literal(Scalar::zero(ty));
                    ctx.view(0).store(fx, &[ctx.index(0)], zero)
                }),
        );
        nest.add_kernel(
            Kernel::new("accumulate")
                .args(&[matrix, vector, out])
                .indices(&[i.clone(), j.clone()])
                .define(|fx, ctx| {
                    let (i, j) = (ctx.index(0), ctx.index(1));
                    let a = ctx.view(0).load(fx, &[i, j])?;
                    let x = ctx.view(1).load(fx, &[j])?;
                    let product = fx.mul(a, x)?;
                    let acc = ctx.view(2).load(fx, &[i])?;
                    let sum = fx.add(acc, product)?;
                    ctx.view(2).store(fx, &[i], sum)
                }),
        );

        let mut schedule = nest.schedule();
        let (i_outer, _i_inner) = schedule.split(&i, ROW_TILE)?;
        if self.cols as i64 > COL_UNROLL {
            schedule.unroll_by(&j, COL_UNROLL)?;
        }
        // Stage the whole operand vector once per row tile.
        schedule.cache(
            &CopyIn,
            CacheSpec::new(vector, vec![j], vec![self.cols]).at(vec![i_outer]),
        )?;

        nest.emit(
            fx,
            &[
                io.inputs[0].clone(),
                io.inputs[1].clone(),
                io.outputs[0].clone(),
            ],
        )
    }

    fn compute(
        &self,
        inputs: &[&Tensor],
        _state: Option<&mut Tensor>,
    ) -> Result<Vec<Tensor>, ModelError> {
        let a = values_f64(inputs[0])?;
        let x = values_f64(inputs[1])?;
        let mut out = vec![0.0; self.rows];
        for (r, slot) in out.iter_mut().enumerate() {
            *slot = (0..self.cols).map(|c| a[r * self.cols + c] * x[c]).sum();
        }
        Ok(vec![tensor_from_f64(self.ty, &[self.rows], &out)])
    }

    fn archive(&self, writer: &mut ArchiveWriter) {
        writer.set("rows", self.rows);
        writer.set("cols", self.cols);
        writer.set("type", self.ty);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplies_matrix_by_vector() {
        let node = MatrixVectorProductNode::new(ElementType::F32, 2, 3);
        let mut matrix = Tensor::zeros(
            ElementType::F32,
            skein_value::MemoryLayout::canonical(&[2, 3]),
        );
        matrix.fill_from(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let vector = Tensor::from_vec(vec![1.0f32, 0.5, 2.0]);
        let out = node.compute(&[&matrix, &vector], None).unwrap();
        assert_eq!(Some(vec![8.0f32, 18.5]), out[0].to_vec::<f32>());
    }
}
