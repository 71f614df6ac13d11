//! End-to-end pattern runs on a real OpenCL device. Every test returns
//! early when no device is present.
#![cfg(feature = "opencl")]

use motif::driver::opencl::{OpenCl, OpenClRuntime};
use motif::driver::Context;
use motif::{Dimensions, Direction, Map, Pattern, PatternComposition, Reduce};

fn runtime() -> Option<OpenClRuntime> {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = match OpenClRuntime::init() {
        Ok(ctx) => ctx,
        Err(err) => {
            println!("OpenCL unavailable, skipping test: {err}");
            return None;
        }
    };
    if ctx.device_count() == 0 {
        println!("no OpenCL device, skipping test");
        return None;
    }
    Some(ctx)
}

#[test]
fn map_adds_two_vectors() {
    let Some(ctx) = runtime() else { return };
    const N: usize = 1024;
    let mut a: Vec<f32> = (0..N).map(|v| v as f32).collect();
    let b: Vec<f32> = (0..N).map(|v| (v * 2) as f32).collect();

    let mut map = Map::<OpenCl>::new(&ctx, "a[x] = a[x] + b[x];");
    map.set_parameter_pointer("a", a.as_mut_ptr(), N, Direction::InOut)
        .unwrap();
    map.set_parameter_pointer("b", b.as_ptr() as *mut f32, N, Direction::In)
        .unwrap();
    map.run(&Dimensions::new(N, 0, 0)).unwrap();

    for (i, v) in a.iter().enumerate() {
        assert_eq!(*v, (i * 3) as f32, "mismatch at {i}");
    }
}

#[test]
fn map_honors_a_min_bound() {
    let Some(ctx) = runtime() else { return };
    const N: usize = 256;
    let mut v = vec![0i32; N];

    let mut map = Map::<OpenCl>::new(&ctx, "v[x] = 1;");
    map.set_parameter_pointer("v", v.as_mut_ptr(), N, Direction::InOut)
        .unwrap();
    let dims = Dimensions::with_bounds(
        motif::SingleDimension::with_min(N, 16),
        Default::default(),
        Default::default(),
    );
    map.run(&dims).unwrap();

    assert!(v[..16].iter().all(|&e| e == 0));
    assert!(v[16..].iter().all(|&e| e == 1));
}

#[test]
fn reduce_sums_a_power_of_two_extent() {
    let Some(ctx) = runtime() else { return };
    const N: usize = 1024;
    let mut data: Vec<f64> = (0..N).map(|v| v as f64).collect();
    let mut total = [0.0f64];

    let mut reduce = Reduce::<OpenCl>::new(&ctx, "v", "+", "total");
    reduce
        .set_parameter_pointer("v", data.as_mut_ptr(), N, Direction::In)
        .unwrap();
    reduce
        .set_parameter_pointer("total", total.as_mut_ptr(), 1, Direction::Out)
        .unwrap();
    reduce.run(&Dimensions::new(N, 0, 0)).unwrap();

    let expected = (N * (N - 1) / 2) as f64;
    assert_eq!(total[0], expected);
}

#[test]
fn reduce_sums_an_odd_extent() {
    let Some(ctx) = runtime() else { return };
    const N: usize = 1000;
    let mut data: Vec<f64> = (0..N).map(|v| v as f64).collect();
    let mut total = [0.0f64];

    let mut reduce = Reduce::<OpenCl>::new(&ctx, "v", "+", "total");
    reduce
        .set_parameter_pointer("v", data.as_mut_ptr(), N, Direction::In)
        .unwrap();
    reduce
        .set_parameter_pointer("total", total.as_mut_ptr(), 1, Direction::Out)
        .unwrap();
    reduce.run(&Dimensions::new(N, 0, 0)).unwrap();

    assert_eq!(total[0], (N * (N - 1) / 2) as f64);
}

#[test]
fn reduce_folds_a_seed_output() {
    let Some(ctx) = runtime() else { return };
    const N: usize = 512;
    let mut data = vec![1.0f64; N];
    let mut total = [100.0f64];

    let mut reduce = Reduce::<OpenCl>::new(&ctx, "v", "+", "total");
    reduce
        .set_parameter_pointer("v", data.as_mut_ptr(), N, Direction::In)
        .unwrap();
    reduce
        .set_parameter_pointer("total", total.as_mut_ptr(), 1, Direction::InOut)
        .unwrap();
    reduce.run(&Dimensions::new(N, 0, 0)).unwrap();

    assert_eq!(total[0], N as f64 + 100.0);
}

#[test]
fn reduce_product_matches_a_sequential_fold() {
    let Some(ctx) = runtime() else { return };
    const N: usize = 64;
    let mut data: Vec<f64> = (0..N).map(|v| 1.0 + (v as f64) / 64.0).collect();
    let mut total = [0.0f64];
    let expected: f64 = data.iter().product();

    let mut reduce = Reduce::<OpenCl>::new(&ctx, "v", "*", "total");
    reduce
        .set_parameter_pointer("v", data.as_mut_ptr(), N, Direction::In)
        .unwrap();
    reduce
        .set_parameter_pointer("total", total.as_mut_ptr(), 1, Direction::Out)
        .unwrap();
    reduce.run(&Dimensions::new(N, 0, 0)).unwrap();

    assert!((total[0] - expected).abs() < 1e-9);
}

#[test]
fn reduce_min_and_max_find_the_extremes() {
    let Some(ctx) = runtime() else { return };
    const N: usize = 777;
    let mut data: Vec<f64> = (0..N).map(|v| ((v * 37) % N) as f64 - 50.0).collect();
    let expected_min = data.iter().cloned().fold(f64::INFINITY, f64::min);
    let expected_max = data.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    let mut smallest = [f64::INFINITY];
    let mut reduce = Reduce::<OpenCl>::new(&ctx, "v", "min", "smallest");
    reduce
        .set_parameter_pointer("v", data.as_mut_ptr(), N, Direction::In)
        .unwrap();
    reduce
        .set_parameter_pointer("smallest", smallest.as_mut_ptr(), 1, Direction::Out)
        .unwrap();
    reduce.run(&Dimensions::new(N, 0, 0)).unwrap();
    assert_eq!(smallest[0], expected_min);

    let mut largest = [f64::NEG_INFINITY];
    let mut reduce = Reduce::<OpenCl>::new(&ctx, "v", "max", "largest");
    reduce
        .set_parameter_pointer("v", data.as_mut_ptr(), N, Direction::In)
        .unwrap();
    reduce
        .set_parameter_pointer("largest", largest.as_mut_ptr(), 1, Direction::Out)
        .unwrap();
    reduce.run(&Dimensions::new(N, 0, 0)).unwrap();
    assert_eq!(largest[0], expected_max);
}

#[test]
fn batched_map_equals_sequential_launches() {
    let Some(ctx) = runtime() else { return };
    const N: usize = 128;
    const BATCH: usize = 3;
    let mut batches: Vec<Vec<f32>> = (0..BATCH)
        .map(|b| (0..N).map(|v| (b * N + v) as f32).collect())
        .collect();
    let chunks: Vec<*mut f32> = batches.iter_mut().map(|b| b.as_mut_ptr()).collect();

    let mut map = Map::<OpenCl>::new(&ctx, "v[x] = v[x] * 3.0f;");
    map.set_batched_pointer("v", &chunks, N, Direction::InOut)
        .unwrap();
    map.set_batch_size(BATCH);
    map.run(&Dimensions::new(N, 0, 0)).unwrap();

    for (b, batch) in batches.iter().enumerate() {
        for (i, v) in batch.iter().enumerate() {
            assert_eq!(*v, ((b * N + i) * 3) as f32, "batch {b}, index {i}");
        }
    }
}

#[test]
fn composition_runs_members_in_order() {
    let Some(ctx) = runtime() else { return };
    const N: usize = 256;
    let mut v = vec![1.0f64; N];
    let mut total = [0.0f64];

    let mut scale = Map::<OpenCl>::new(&ctx, "v[x] = v[x] * 2.0;");
    scale
        .set_parameter_pointer("v", v.as_mut_ptr(), N, Direction::InOut)
        .unwrap();

    let mut sum = Reduce::<OpenCl>::new(&ctx, "v", "+", "total");
    sum.set_parameter_pointer("v", v.as_mut_ptr(), N, Direction::In)
        .unwrap();
    sum.set_parameter_pointer("total", total.as_mut_ptr(), 1, Direction::Out)
        .unwrap();

    let mut comp = PatternComposition::new();
    comp.add(scale);
    comp.add(sum);
    comp.run(&Dimensions::new(N, 0, 0)).unwrap();

    assert_eq!(total[0], (N * 2) as f64);
}

#[test]
fn extra_kernel_code_reaches_the_compiler() {
    let Some(ctx) = runtime() else { return };
    const N: usize = 64;
    let mut v = vec![2.0f32; N];

    let mut map = Map::<OpenCl>::new(&ctx, "v[x] = SQ(v[x]);");
    map.add_extra_kernel_code(
        "MOTIF_DEVICE_MACRO_BEGIN SQ(a) ((a)*(a)) MOTIF_DEVICE_MACRO_END",
    );
    map.set_parameter_pointer("v", v.as_mut_ptr(), N, Direction::InOut)
        .unwrap();
    map.run(&Dimensions::new(N, 0, 0)).unwrap();

    assert!(v.iter().all(|&e| e == 4.0));
}
