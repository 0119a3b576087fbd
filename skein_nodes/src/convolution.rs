//! The two-dimensional convolution node.

use std::any::Any;

use serde::{Deserialize, Serialize};

use skein_model::{ArchiveReader, ArchiveWriter, ModelError, Node, NodeIo, PortSpec};
use skein_value::loopnests::{Kernel, LoopNest};
use skein_value::{ElementType, EmitError, FunctionEmitter, Scalar, Tensor};

use crate::codegen::{tensor_from_f64, values_f64};

/// The convolution algorithms a node can be annotated with. `Automatic`
/// leaves the choice to the convolution-method pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvolutionMethod {
    /// Resolved by the convolution-method pass.
    #[default]
    Automatic,
    /// Diagonal-major evaluation.
    Diagonal,
    /// Straightforward nested loops.
    Simple,
    /// Winograd fast convolution.
    Winograd,
    /// Nested loops with the filter loops fully unrolled.
    Unrolled,
}

/// Valid (no-padding) 2-D convolution of a single-channel image with a
/// filter supplied on the second input.
///
/// The annotated method selects the emitted schedule. Diagonal and winograd
/// lower through the simple schedule: the geometry conditions the original
/// algorithms depend on are not modeled here.
#[derive(Clone)]
pub struct ConvolutionNode {
    image: [usize; 2],
    filter: [usize; 2],
    method: ConvolutionMethod,
    ty: ElementType,
}

impl ConvolutionNode {
    /// A convolution of `image` (h × w) with `filter` (kh × kw).
    pub fn new(ty: ElementType, image: [usize; 2], filter: [usize; 2]) -> Result<Self, ModelError> {
        if filter[0] == 0 || filter[1] == 0 || filter[0] > image[0] || filter[1] > image[1] {
            return Err(ModelError::ShapeMismatch {
                node: None,
                detail: format!("filter {filter:?} does not fit image {image:?}"),
            });
        }
        Ok(Self {
            image,
            filter,
            method: ConvolutionMethod::Automatic,
            ty,
        })
    }

    /// The annotated method.
    pub fn method(&self) -> ConvolutionMethod {
        self.method
    }

    /// The filter geometry (kh × kw).
    pub fn filter_shape(&self) -> [usize; 2] {
        self.filter
    }

    /// The same node annotated with a method.
    pub fn with_method(&self, method: ConvolutionMethod) -> Self {
        Self {
            method,
            ..self.clone()
        }
    }

    fn output_shape(&self) -> [usize; 2] {
        [
            self.image[0] - self.filter[0] + 1,
            self.image[1] - self.filter[1] + 1,
        ]
    }

    pub(crate) fn from_archive(reader: &ArchiveReader<'_>) -> Result<Box<dyn Node>, ModelError> {
        let ty: ElementType = reader.get("type")?;
        let image: [usize; 2] = reader.get("image")?;
        let filter: [usize; 2] = reader.get("filter")?;
        let method: ConvolutionMethod = reader.get("method")?;
        Ok(Box::new(Self::new(ty, image, filter)?.with_method(method)))
    }
}

impl Node for ConvolutionNode {
    fn type_name(&self) -> &'static str {
        "convolution"
    }

    fn output_specs(&self) -> Vec<PortSpec> {
        vec![PortSpec::shaped(self.ty, &self.output_shape())]
    }

    fn validate_inputs(&self, inputs: &[PortSpec]) -> Result<(), ModelError> {
        let [image, filter] = inputs else {
            return Err(ModelError::InvalidGraph(
                "convolution takes an image and a filter".to_owned(),
            ));
        };
        if image.ty != self.ty || filter.ty != self.ty {
            return Err(ModelError::TypeMismatch {
                node: None,
                expected: self.ty,
                actual: if image.ty != self.ty { image.ty } else { filter.ty },
            });
        }
        if image.layout.active() != self.image.as_slice()
            || filter.layout.active() != self.filter.as_slice()
        {
            return Err(ModelError::ShapeMismatch {
                node: None,
                detail: "convolution operands disagree with the declared geometry".to_owned(),
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
        let [oh, ow] = self.output_shape();
        let mut nest = LoopNest::new();
        let oy = nest.index("oy", 0, oh as i64);
        let ox = nest.index("ox", 0, ow as i64);
        let ky = nest.index("ky", 0, self.filter[0] as i64);
        let kx = nest.index("kx", 0, self.filter[1] as i64);
        let image = nest.using("image");
        let filter = nest.using("filter");
        let out = nest.using("out");

        nest.add_kernel(
            Kernel::new("clear_pixel")
                .args(&[out])
                .indices(&[oy.clone(), ox.clone()])
                .define(move |fx, ctx| {
                    let zero = fx.literal(Scalar::zero(ty));
                    ctx.view(0)
                        .store(fx, &[ctx.index(0), ctx.index(1)], zero)
                }),
        );
        nest.add_kernel(
            Kernel::new("accumulate_tap")
                .args(&[image, filter, out])
                .indices(&[oy.clone(), ox.clone(), ky.clone(), kx.clone()])
                .define(|fx, ctx| {
                    let (oy, ox) = (ctx.index(0), ctx.index(1));
                    let (ky, kx) = (ctx.index(2), ctx.index(3));
                    let iy = fx.add(oy, ky)?;
                    let ix = fx.add(ox, kx)?;
                    let pixel = ctx.view(0).load(fx, &[iy, ix])?;
                    let tap = ctx.view(1).load(fx, &[ky, kx])?;
                    let product = fx.mul(pixel, tap)?;
                    let acc = ctx.view(2).load(fx, &[oy, ox])?;
                    let sum = fx.add(acc, product)?;
                    ctx.view(2).store(fx, &[oy, ox], sum)
                }),
        );

        if matches!(self.method, ConvolutionMethod::Unrolled) {
            let mut schedule = nest.schedule();
            schedule.unroll(&ky)?;
            schedule.unroll(&kx)?;
        }

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
        let image = values_f64(inputs[0])?;
        let filter = values_f64(inputs[1])?;
        let [oh, ow] = self.output_shape();
        let w = self.image[1];
        let mut out = vec![0.0; oh * ow];
        for oy in 0..oh {
            for ox in 0..ow {
                let mut acc = 0.0;
                for ky in 0..self.filter[0] {
                    for kx in 0..self.filter[1] {
                        acc += image[(oy + ky) * w + (ox + kx)]
                            * filter[ky * self.filter[1] + kx];
                    }
                }
                out[oy * ow + ox] = acc;
            }
        }
        Ok(vec![tensor_from_f64(self.ty, &[oh, ow], &out)])
    }

    fn archive(&self, writer: &mut ArchiveWriter) {
        writer.set("type", self.ty);
        writer.set("image", self.image);
        writer.set("filter", self.filter);
        writer.set("method", self.method);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_value::MemoryLayout;

    #[test]
    fn convolves_a_small_image() {
        let node = ConvolutionNode::new(ElementType::F64, [3, 3], [2, 2]).unwrap();
        let mut image = Tensor::zeros(ElementType::F64, MemoryLayout::canonical(&[3, 3]));
        image
            .fill_from(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0])
            .unwrap();
        let mut filter = Tensor::zeros(ElementType::F64, MemoryLayout::canonical(&[2, 2]));
        filter.fill_from(&[1.0, 0.0, 0.0, 1.0]).unwrap();
        let out = node.compute(&[&image, &filter], None).unwrap();
        // Each output is image[y][x] + image[y+1][x+1].
        assert_eq!(Some(vec![6.0, 8.0, 12.0, 14.0]), out[0].to_vec::<f64>());
    }

    #[test]
    fn method_annotation_is_preserved() {
        let node = ConvolutionNode::new(ElementType::F32, [4, 4], [3, 3]).unwrap();
        assert_eq!(ConvolutionMethod::Automatic, node.method());
        let annotated = node.with_method(ConvolutionMethod::Unrolled);
        assert_eq!(ConvolutionMethod::Unrolled, annotated.method());
    }
}
