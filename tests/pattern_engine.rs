//! Pattern-engine behavior against the recording dummy backend: compile
//! caching, staleness, argument layout, batching and the Reduce loop.

use motif::driver::dummy::{Dummy, DummyContext, RecordedArg};
use motif::driver::Context;
use motif::{Dimensions, Direction, Error, Map, ParamKind, Pattern, Reduce};

fn context() -> DummyContext {
    let _ = env_logger::builder().is_test(true).try_init();
    DummyContext::init().expect("dummy context")
}

#[test]
fn identical_dims_compile_once() {
    let ctx = context();
    let mut data = [0.0f32; 64];
    let mut map = Map::<Dummy>::new(&ctx, "v[x] = v[x] + 1.0f;");
    map.set_parameter_pointer("v", data.as_mut_ptr(), 64, Direction::InOut)
        .unwrap();

    let dims = Dimensions::new(64, 0, 0);
    map.run(&dims).unwrap();
    map.run(&dims).unwrap();

    let recorder = ctx.recorder();
    assert_eq!(recorder.compile_count(), 1);
    assert_eq!(recorder.launch_count(), 2);
}

#[test]
fn run_compiled_reuses_the_previous_dims() {
    let ctx = context();
    let mut data = [0.0f32; 48];
    let mut map = Map::<Dummy>::new(&ctx, "v[x] = v[x] + 1.0f;");
    map.set_parameter_pointer("v", data.as_mut_ptr(), 48, Direction::InOut)
        .unwrap();

    map.run(&Dimensions::new(48, 0, 0)).unwrap();
    map.run_compiled().unwrap();

    let recorder = ctx.recorder();
    assert_eq!(recorder.compile_count(), 1);
    let launches = recorder.launches();
    assert_eq!(launches.len(), 2);
    assert_eq!(launches[1].dims, Dimensions::new(48, 0, 0));
}

#[test]
fn run_compiled_requires_a_previous_run() {
    let ctx = context();
    let mut data = [0.0f32; 8];
    let mut map = Map::<Dummy>::new(&ctx, "v[x] = v[x] + 1.0f;");
    map.set_parameter_pointer("v", data.as_mut_ptr(), 8, Direction::InOut)
        .unwrap();

    let err = map.run_compiled();
    assert!(matches!(err, Err(Error::Native { .. })));
    assert_eq!(ctx.recorder().launch_count(), 0);
}

#[test]
fn changed_dims_force_a_recompile() {
    let ctx = context();
    let mut data = [0.0f32; 128];
    let mut map = Map::<Dummy>::new(&ctx, "v[x] = v[x] + 1.0f;");
    map.set_parameter_pointer("v", data.as_mut_ptr(), 128, Direction::InOut)
        .unwrap();

    map.run(&Dimensions::new(64, 0, 0)).unwrap();
    map.run(&Dimensions::new(128, 0, 0)).unwrap();

    assert_eq!(ctx.recorder().compile_count(), 2);
}

#[test]
fn source_edits_invalidate_the_cache() {
    let ctx = context();
    let mut data = [0.0f32; 32];
    let dims = Dimensions::new(32, 0, 0);
    let mut map = Map::<Dummy>::new(&ctx, "v[x] = SCALE * v[x];");
    map.set_parameter_pointer("v", data.as_mut_ptr(), 32, Direction::InOut)
        .unwrap();
    map.add_extra_kernel_code("#define SCALE 2");
    map.run(&dims).unwrap();

    map.add_extra_kernel_code("\n#define UNUSED 1");
    assert!(map.is_stale());
    map.run(&dims).unwrap();

    map.set_std_var_names(["i".into(), "j".into(), "k".into()]);
    map.run(&dims).unwrap();

    assert_eq!(ctx.recorder().compile_count(), 3);
    let sources: Vec<String> = ctx
        .recorder()
        .compiles()
        .iter()
        .map(|c| c.source.clone())
        .collect();
    assert!(sources[2].contains("motif_max_i"));
}

#[test]
fn batch_toggle_is_the_only_batch_staleness() {
    let ctx = context();
    let mut chunk_a = [0.0f32; 16];
    let mut chunk_b = [0.0f32; 16];
    let chunks = [chunk_a.as_mut_ptr(), chunk_b.as_mut_ptr()];
    let dims = Dimensions::new(16, 0, 0);

    let mut map = Map::<Dummy>::new(&ctx, "v[x] = v[x] + 1.0f;");
    map.set_batched_pointer("v", &chunks, 16, Direction::InOut)
        .unwrap();
    map.set_batch_size(2);
    map.run(&dims).unwrap();

    // A different non-zero batch size keeps the kernel.
    map.set_batch_size(1);
    map.run(&dims).unwrap();
    assert_eq!(ctx.recorder().compile_count(), 1);

    // Toggling batching off changes the signature.
    map.set_batch_size(0);
    assert!(map.is_stale());
}

#[test]
fn device_switch_discards_the_kernel() {
    let ctx = context();
    let mut data = [0.0f32; 16];
    let dims = Dimensions::new(16, 0, 0);
    let mut map = Map::<Dummy>::new(&ctx, "v[x] = v[x] + 1.0f;");
    map.set_parameter_pointer("v", data.as_mut_ptr(), 16, Direction::InOut)
        .unwrap();
    map.run(&dims).unwrap();

    map.set_gpu_index(1);
    map.run(&dims).unwrap();

    let compiles = ctx.recorder().compiles();
    assert_eq!(compiles.len(), 2);
    assert_eq!(compiles[0].device, 0);
    assert_eq!(compiles[1].device, 1);
}

#[test]
fn same_shape_rebind_keeps_the_kernel() {
    let ctx = context();
    let mut first = [0.0f32; 16];
    let mut second = [1.0f32; 16];
    let dims = Dimensions::new(16, 0, 0);
    let mut map = Map::<Dummy>::new(&ctx, "v[x] = v[x] + 1.0f;");
    map.set_parameter_pointer("v", first.as_mut_ptr(), 16, Direction::InOut)
        .unwrap();
    map.run(&dims).unwrap();

    map.set_parameter_pointer("v", second.as_mut_ptr(), 16, Direction::InOut)
        .unwrap();
    assert!(!map.is_stale());
    map.run(&dims).unwrap();

    assert_eq!(ctx.recorder().compile_count(), 1);
    assert_eq!(ctx.recorder().launch_count(), 2);
}

#[test]
fn placeholder_must_be_bound_before_running() {
    let ctx = context();
    let mut map = Map::<Dummy>::new(&ctx, "a[x] = 0.0f;");
    map.set_parameter_placeholder::<f32>("a", ParamKind::Pointer, Direction::Out, false);

    let err = map.run(&Dimensions::new(8, 0, 0));
    assert!(matches!(err, Err(Error::IncompleteParameter(name)) if name == "a"));
    // Compilation happened; only the launch was refused.
    assert_eq!(ctx.recorder().compile_count(), 1);
    assert_eq!(ctx.recorder().launch_count(), 0);
}

#[test]
fn arguments_follow_declaration_order() {
    let ctx = context();
    let mut a = [0.0f64; 20];
    let mut b = [0.0f64; 20];
    let mut map = Map::<Dummy>::new(&ctx, "b[x] = a[x] * scale;");
    map.set_parameter_value("scale", 3i32);
    map.set_parameter_pointer("a", a.as_mut_ptr(), 20, Direction::In)
        .unwrap();
    map.set_parameter_pointer("b", b.as_mut_ptr(), 20, Direction::Out)
        .unwrap();

    map.run(&Dimensions::new(20, 0, 0)).unwrap();

    let launches = ctx.recorder().launches();
    assert_eq!(
        launches[0].args,
        vec![
            RecordedArg::Value(20u64.to_ne_bytes().to_vec()),
            RecordedArg::Value(3i32.to_ne_bytes().to_vec()),
            RecordedArg::Memory { size: 160 },
            RecordedArg::Memory { size: 160 },
        ]
    );
    assert_eq!(launches[0].block, [20, 1, 1]);
}

#[test]
fn batched_launch_scales_the_iteration_space() {
    let ctx = context();
    let mut chunk_a = [0.0f64; 8];
    let mut chunk_b = [0.0f64; 8];
    let mut chunk_c = [0.0f64; 8];
    let chunks = [chunk_a.as_mut_ptr(), chunk_b.as_mut_ptr(), chunk_c.as_mut_ptr()];

    let mut map = Map::<Dummy>::new(&ctx, "v[x] = v[x] * 2.0;");
    map.set_batched_pointer("v", &chunks, 8, Direction::InOut)
        .unwrap();
    map.set_batch_size(3);
    map.run(&Dimensions::new(8, 0, 0)).unwrap();

    let launches = ctx.recorder().launches();
    // Per-instance extent as the argument, scaled extent as the launch.
    assert_eq!(
        launches[0].args,
        vec![
            RecordedArg::Value(8u64.to_ne_bytes().to_vec()),
            RecordedArg::Value(3u32.to_ne_bytes().to_vec()),
            RecordedArg::Chunked {
                chunks: 3,
                chunk_size: 64
            },
        ]
    );
    assert_eq!(launches[0].dims, Dimensions::new(24, 0, 0));
    assert_eq!(launches[0].block, [24, 1, 1]);

    let source = &ctx.recorder().compiles()[0].source;
    assert!(source.contains("unsigned int motif_batch_size"));
    assert!(source.contains("motif_batched_v"));
}

#[test]
fn batch_size_cannot_exceed_the_chunks() {
    let ctx = context();
    let mut chunk = [0.0f64; 8];
    let chunks = [chunk.as_mut_ptr()];
    let mut map = Map::<Dummy>::new(&ctx, "v[x] = v[x];");
    map.set_batched_pointer("v", &chunks, 8, Direction::InOut)
        .unwrap();
    map.set_batch_size(2);

    let err = map.run(&Dimensions::new(8, 0, 0));
    assert!(matches!(err, Err(Error::Native { .. })));
    assert_eq!(ctx.recorder().launch_count(), 0);
}

#[test]
fn reduce_runs_passes_until_one_block_remains() {
    let ctx = context();
    let mut data = [1.0f64; 2048];
    let mut total = [0.0f64; 1];
    let mut reduce = Reduce::<Dummy>::new(&ctx, "v", "+", "total");
    reduce
        .set_parameter_pointer("v", data.as_mut_ptr(), 2048, Direction::In)
        .unwrap();
    reduce
        .set_parameter_pointer("total", total.as_mut_ptr(), 1, Direction::Out)
        .unwrap();

    reduce.run(&Dimensions::new(2048, 0, 0)).unwrap();

    let recorder = ctx.recorder();
    assert_eq!(recorder.compile_count(), 1);
    let launches = recorder.launches();
    assert_eq!(launches.len(), 2);
    assert_eq!(launches[0].dims, Dimensions::new(2048, 0, 0));
    assert_eq!(launches[1].dims, Dimensions::new(2, 0, 0));
    // One shared slot per thread of a full block.
    assert_eq!(launches[0].shared_bytes, 1024 * 8);
    // Second pass folds the two partial totals.
    assert_eq!(
        launches[1].args[0],
        RecordedArg::Value(2u64.to_ne_bytes().to_vec())
    );
    assert_eq!(launches[1].args[1], RecordedArg::Memory { size: 16 });
}

#[test]
fn reduce_axis_count_survives_extent_changes() {
    let ctx = context();
    let mut data = [1.0f64; 2048];
    let mut total = [0.0f64; 1];
    let mut reduce = Reduce::<Dummy>::new(&ctx, "v", "+", "total");
    reduce
        .set_parameter_pointer("v", data.as_mut_ptr(), 2048, Direction::In)
        .unwrap();
    reduce
        .set_parameter_pointer("total", total.as_mut_ptr(), 1, Direction::Out)
        .unwrap();

    reduce.run(&Dimensions::new(2048, 0, 0)).unwrap();
    reduce.run(&Dimensions::new(512, 0, 0)).unwrap();

    // The multi-pass kernel is extent-agnostic along its single axis.
    assert_eq!(ctx.recorder().compile_count(), 1);
}

#[test]
fn reduce_rejects_unsupported_shapes_before_launching() {
    let ctx = context();
    let mut data = [1.0f64; 64];
    let mut total = [0.0f64; 1];
    let mut reduce = Reduce::<Dummy>::new(&ctx, "v", "+", "total");
    reduce
        .set_parameter_pointer("v", data.as_mut_ptr(), 64, Direction::In)
        .unwrap();
    reduce
        .set_parameter_pointer("total", total.as_mut_ptr(), 1, Direction::Out)
        .unwrap();

    let err = reduce.run(&Dimensions::new(8, 8, 0));
    assert!(matches!(err, Err(Error::UnsupportedDimensions(_))));

    reduce.set_batch_size(2);
    let err = reduce.run(&Dimensions::new(64, 0, 0));
    assert!(matches!(err, Err(Error::BatchingUnsupported(_))));

    assert_eq!(ctx.recorder().launch_count(), 0);
}

#[test]
fn clones_share_the_compiled_program() {
    let ctx = context();
    let mut data = [0.0f32; 32];
    let dims = Dimensions::new(32, 0, 0);
    let mut map = Map::<Dummy>::new(&ctx, "v[x] = v[x] + 1.0f;");
    map.set_parameter_pointer("v", data.as_mut_ptr(), 32, Direction::InOut)
        .unwrap();
    map.run(&dims).unwrap();

    let mut clone = map.try_clone().unwrap();
    clone.run(&dims).unwrap();

    assert_eq!(ctx.recorder().compile_count(), 1);
    assert_eq!(ctx.recorder().launch_count(), 2);
}

#[test]
fn removed_parameters_leave_the_signature() {
    let ctx = context();
    let mut a = [0.0f32; 16];
    let mut b = [0.0f32; 16];
    let dims = Dimensions::new(16, 0, 0);
    let mut map = Map::<Dummy>::new(&ctx, "a[x] = a[x];");
    map.set_parameter_pointer("a", a.as_mut_ptr(), 16, Direction::InOut)
        .unwrap();
    map.set_parameter_pointer("b", b.as_mut_ptr(), 16, Direction::In)
        .unwrap();
    map.run(&dims).unwrap();

    map.remove_parameter("b");
    assert!(map.is_stale());
    map.run(&dims).unwrap();

    let compiles = ctx.recorder().compiles();
    assert_eq!(compiles.len(), 2);
    assert!(compiles[0].source.contains("float* b"));
    assert!(!compiles[1].source.contains("float* b"));
}
