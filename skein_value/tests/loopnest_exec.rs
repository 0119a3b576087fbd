//! End-to-end loop-nest tests: build a nest, lower it into a module, execute
//! with the interpreter backend, and check the observable buffer state.

use skein_value::backend::interp::InterpArtifact;
use skein_value::loopnests::{
    BlastCopy, CacheExtras, CacheSpec, CopyInCopyOut, Kernel, LoopNest, ViewBinding,
    ZeroInReduceOut, first, index_equals, last,
};
use skein_value::{
    Buffer, EmitError, FunctionDeclaration, GlobalId, MemoryLayout, Module, Scalar,
};

fn try_execute(
    nest: &LoopNest,
    buffers: Vec<(Buffer, MemoryLayout)>,
) -> Result<Vec<Buffer>, EmitError> {
    let mut module = Module::new();
    let ids: Vec<GlobalId> = buffers
        .iter()
        .enumerate()
        .map(|(k, (buffer, _))| {
            module.add_global(&format!("arg{k}"), buffer.element_type(), buffer.len())
        })
        .collect();
    module.define(FunctionDeclaration::new("run").undecorated(), |fx| {
        let bindings: Vec<ViewBinding> = ids
            .iter()
            .zip(&buffers)
            .map(|(&id, (_, layout))| ViewBinding {
                ptr: fx.global_ref(id),
                layout: layout.clone(),
            })
            .collect();
        nest.emit(fx, &bindings)?;
        fx.ret(None)
    })?;

    let mut artifact = InterpArtifact::new(module);
    for (&id, (buffer, _)) in ids.iter().zip(&buffers) {
        *artifact.global_mut(id).unwrap() = buffer.clone();
    }
    artifact.call("run", &[]).unwrap();
    Ok(ids.iter().map(|&id| artifact.global(id).clone()).collect())
}

fn execute(nest: &LoopNest, buffers: Vec<(Buffer, MemoryLayout)>) -> Vec<Buffer> {
    try_execute(nest, buffers).unwrap()
}

/// `split(i, k)` fires the same iteration points as the unsplit loop; the
/// two boundary iterations of the partial tile fire exactly once each.
#[test]
fn split_preserves_iteration_points() {
    let mut nest = LoopNest::new();
    let i = nest.index("i", 0, 10);
    let out = nest.using("out");
    nest.add_kernel(
        Kernel::new("bump")
            .args(&[out])
            .indices(&[i.clone()])
            .define(|fx, ctx| {
                let idx = ctx.index(0);
                let current = ctx.view(0).load(fx, &[idx])?;
                let one = fx.literal(Scalar::I32(1));
                let next = fx.add(current, one)?;
                ctx.view(0).store(fx, &[idx], next)
            }),
    );
    nest.schedule().split(&i, 4).unwrap();

    let result = execute(
        &nest,
        vec![(Buffer::zeros(skein_value::ElementType::I32, 10), MemoryLayout::vector(10))],
    );
    assert_eq!(Some(vec![1i32; 10]), result[0].to_vec::<i32>());
}

/// Reordering loops changes the schedule, not the set of points.
#[test]
fn reordered_loops_cover_the_same_points() {
    let mut nest = LoopNest::new();
    let i = nest.index("i", 0, 3);
    let j = nest.index("j", 0, 4);
    let out = nest.using("out");
    nest.add_kernel(
        Kernel::new("mark")
            .args(&[out])
            .indices(&[i.clone(), j.clone()])
            .define(|fx, ctx| {
                let (i, j) = (ctx.index(0), ctx.index(1));
                let ten = fx.literal(Scalar::I64(10));
                let row = fx.mul(i, ten)?;
                let code = fx.add(row, j)?;
                let code = fx.cast(code, skein_value::ElementType::I32)?;
                ctx.view(0).store(fx, &[i, j], code)
            }),
    );
    nest.schedule().set_order(&[j.clone(), i.clone()]).unwrap();

    let result = execute(
        &nest,
        vec![(
            Buffer::zeros(skein_value::ElementType::I32, 12),
            MemoryLayout::canonical(&[3, 4]),
        )],
    );
    let expected: Vec<i32> = (0..3).flat_map(|i| (0..4).map(move |j| i * 10 + j)).collect();
    assert_eq!(Some(expected), result[0].to_vec::<i32>());
}

/// Unrolled loops produce the same result as rolled ones.
#[test]
fn unroll_is_transparent() {
    let mut nest = LoopNest::new();
    let i = nest.index("i", 0, 8);
    let out = nest.using("out");
    nest.add_kernel(
        Kernel::new("square")
            .args(&[out])
            .indices(&[i.clone()])
            .define(|fx, ctx| {
                let idx = ctx.index(0);
                let sq = fx.mul(idx, idx)?;
                let sq = fx.cast(sq, skein_value::ElementType::I64)?;
                ctx.view(0).store(fx, &[idx], sq)
            }),
    );
    nest.schedule().unroll_by(&i, 4).unwrap();

    let result = execute(
        &nest,
        vec![(Buffer::zeros(skein_value::ElementType::I64, 8), MemoryLayout::vector(8))],
    );
    let expected: Vec<i64> = (0..8).map(|i| i * i).collect();
    assert_eq!(Some(expected), result[0].to_vec::<i64>());
}

/// Predicates gate kernel firings: `first(i) or i == 3`.
#[test]
fn predicates_filter_firings() {
    let mut nest = LoopNest::new();
    let i = nest.index("i", 0, 6);
    let out = nest.using("out");
    let kernel = Kernel::new("mark")
        .args(&[out])
        .indices(&[i.clone()])
        .define(|fx, ctx| {
            let idx = ctx.index(0);
            let one = fx.literal(Scalar::I32(1));
            ctx.view(0).store(fx, &[idx], one)
        });
    nest.add_kernel_with(
        kernel,
        Some(first(&i).or(index_equals(&i, 3))),
        Default::default(),
    );

    let result = execute(
        &nest,
        vec![(Buffer::zeros(skein_value::ElementType::I32, 6), MemoryLayout::vector(6))],
    );
    assert_eq!(Some(vec![1, 0, 0, 1, 0, 0]), result[0].to_vec::<i32>());
}

/// `last` evaluates against the clamped extent inside a boundary tile.
#[test]
fn last_predicate_sees_the_boundary_tile() {
    let mut nest = LoopNest::new();
    let i = nest.index("i", 0, 10);
    let out = nest.using("out");
    let kernel = Kernel::new("mark")
        .args(&[out])
        .indices(&[i.clone()])
        .define(|fx, ctx| {
            let idx = ctx.index(0);
            let one = fx.literal(Scalar::I32(1));
            ctx.view(0).store(fx, &[idx], one)
        });
    let (_outer, inner) = nest.schedule().split(&i, 4).unwrap();
    nest.add_kernel_with(kernel, Some(last(&inner)), Default::default());

    let result = execute(
        &nest,
        vec![(Buffer::zeros(skein_value::ElementType::I32, 10), MemoryLayout::vector(10))],
    );
    // Full tiles end at 3 and 7; the boundary tile holds {8, 9} and ends at 9.
    assert_eq!(
        Some(vec![0, 0, 0, 1, 0, 0, 0, 1, 0, 1]),
        result[0].to_vec::<i32>()
    );
}

/// A parallelized loop writes each element exactly once.
#[test]
fn parallel_chunks_cover_the_range() {
    let mut nest = LoopNest::new();
    let i = nest.index("i", 0, 10);
    let out = nest.using("out");
    nest.add_kernel(
        Kernel::new("ident")
            .args(&[out])
            .indices(&[i.clone()])
            .define(|fx, ctx| {
                let idx = ctx.index(0);
                ctx.view(0).store(fx, &[idx], idx)
            }),
    );
    nest.schedule().parallelize_by(&i, 3).unwrap();

    let result = execute(
        &nest,
        vec![(Buffer::zeros(skein_value::ElementType::I64, 10), MemoryLayout::vector(10))],
    );
    let expected: Vec<i64> = (0..10).collect();
    assert_eq!(Some(expected), result[0].to_vec::<i64>());
}

/// The observable state after a CopyInCopyOut-cached nest equals the state
/// without caching.
#[test]
fn copy_in_copy_out_is_transparent() {
    let build = |cached: bool| {
        let mut nest = LoopNest::new();
        let i = nest.index("i", 0, 10);
        let data = nest.using("data");
        nest.add_kernel(
            Kernel::new("double")
                .args(&[data])
                .indices(&[i.clone()])
                .define(|fx, ctx| {
                    let idx = ctx.index(0);
                    let x = ctx.view(0).load(fx, &[idx])?;
                    let two = fx.literal(Scalar::F32(2.0));
                    let doubled = fx.mul(x, two)?;
                    ctx.view(0).store(fx, &[idx], doubled)
                }),
        );
        let mut schedule = nest.schedule();
        let (outer, _inner) = schedule.split(&i, 4).unwrap();
        if cached {
            schedule
                .cache(
                    &CopyInCopyOut,
                    CacheSpec::new(data, vec![i.clone()], vec![4]).at(vec![outer]),
                )
                .unwrap();
        }
        nest
    };
    let input: Vec<f32> = (0..10).map(|x| x as f32 + 0.5).collect();
    let buffers = || vec![(Buffer::from_vec(input.clone()), MemoryLayout::vector(10))];

    let plain = execute(&build(false), buffers());
    let cached = execute(&build(true), buffers());
    assert_eq!(plain[0], cached[0]);
    assert_eq!(
        Some(input.iter().map(|x| x * 2.0).collect::<Vec<f32>>()),
        cached[0].to_vec::<f32>()
    );
}

/// ZeroInReduceOut sums the scratch into the view, preserving whatever the
/// view already held.
#[test]
fn zero_in_reduce_out_accumulates() {
    let mut nest = LoopNest::new();
    let i = nest.index("i", 0, 7);
    let input = nest.using("input");
    let out = nest.using("out");
    nest.add_kernel(
        Kernel::new("axpy")
            .args(&[input, out])
            .indices(&[i.clone()])
            .define(|fx, ctx| {
                let idx = ctx.index(0);
                let x = ctx.view(0).load(fx, &[idx])?;
                let two = fx.literal(Scalar::F32(2.0));
                let scaled = fx.mul(x, two)?;
                let acc = ctx.view(1).load(fx, &[idx])?;
                let sum = fx.add(acc, scaled)?;
                ctx.view(1).store(fx, &[idx], sum)
            }),
    );
    let mut schedule = nest.schedule();
    let (outer, _inner) = schedule.split(&i, 3).unwrap();
    schedule
        .cache(
            &ZeroInReduceOut,
            CacheSpec::new(out, vec![i.clone()], vec![3]).at(vec![outer]),
        )
        .unwrap();

    let input_values: Vec<f32> = (0..7).map(|x| x as f32).collect();
    let base = vec![10.0f32; 7];
    let result = execute(
        &nest,
        vec![
            (Buffer::from_vec(input_values.clone()), MemoryLayout::vector(7)),
            (Buffer::from_vec(base), MemoryLayout::vector(7)),
        ],
    );
    let expected: Vec<f32> = input_values.iter().map(|x| 10.0 + 2.0 * x).collect();
    assert_eq!(Some(expected), result[1].to_vec::<f32>());
}

/// BLAS-style packing round-trips element values exactly.
#[test]
fn blast_copy_packs_transparently() {
    let mut nest = LoopNest::new();
    let t = nest.index("t", 0, 1);
    let i = nest.index("i", 0, 3);
    let j = nest.index("j", 0, 10);
    let a = nest.using("a");
    let out = nest.using("out");
    nest.add_kernel(
        Kernel::new("copy")
            .args(&[a, out])
            .indices(&[i.clone(), j.clone()])
            .define(|fx, ctx| {
                let (i, j) = (ctx.index(0), ctx.index(1));
                let x = ctx.view(0).load(fx, &[i, j])?;
                ctx.view(1).store(fx, &[i, j], x)
            }),
    );
    nest.schedule()
        .cache(
            &BlastCopy,
            CacheSpec::new(a, vec![i.clone(), j.clone()], vec![3, 10])
                .at(vec![t])
                .extras(CacheExtras {
                    vector_width: Some(4),
                    ..Default::default()
                }),
        )
        .unwrap();

    let values: Vec<f32> = (0..30).map(|x| x as f32 * 1.25).collect();
    let layout = MemoryLayout::canonical(&[3, 10]);
    let result = execute(
        &nest,
        vec![
            (Buffer::from_vec(values.clone()), layout.clone()),
            (Buffer::zeros(skein_value::ElementType::F32, 30), layout),
        ],
    );
    assert_eq!(Some(values), result[1].to_vec::<f32>());
}

/// Scratch requests beyond the configured cap fail at lowering time.
#[test]
fn scratch_cap_is_enforced() {
    let mut nest = LoopNest::new();
    let i = nest.index("i", 0, 64);
    let data = nest.using("data");
    nest.add_kernel(
        Kernel::new("noop")
            .args(&[data])
            .indices(&[i.clone()])
            .define(|fx, ctx| {
                let idx = ctx.index(0);
                let x = ctx.view(0).load(fx, &[idx])?;
                ctx.view(0).store(fx, &[idx], x)
            }),
    );
    let mut schedule = nest.schedule();
    let (outer, _inner) = schedule.split(&i, 32).unwrap();
    schedule
        .cache(
            &CopyInCopyOut,
            CacheSpec::new(data, vec![i.clone()], vec![32]).at(vec![outer]),
        )
        .unwrap();
    nest.set_scratch_limit(Some(64));

    let result = try_execute(
        &nest,
        vec![(Buffer::zeros(skein_value::ElementType::F32, 64), MemoryLayout::vector(64))],
    );
    assert!(matches!(result, Err(EmitError::ScratchExhausted { .. })));
}
