//! End-to-end tests against a real Vulkan device.
//!
//! Run with `cargo test -p vkcompute -- --ignored` on a machine with a
//! Vulkan driver (lavapipe is enough).

use std::time::{Duration, Instant};

use vkcompute::memory::HOST_ACCESSIBLE;
use vkcompute::{
    await_completion, kernels, AllocationStrategy, BatchRunner, ComputeConfig, ComputeError,
    ComputePipeline, DescriptorLayout, DescriptorPool, DeviceContext, ErrorKind, Fence,
    ResourceAllocator,
};

fn context() -> DeviceContext {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    DeviceContext::create(&ComputeConfig::default()).expect("Vulkan device")
}

#[test]
#[ignore = "requires a Vulkan device - run with --ignored on GPU machine"]
fn all_strategies_double_every_element() {
    let ctx = context();
    let mut runner = BatchRunner::new(
        &ctx,
        &kernels::sum_kernel_bytes(),
        kernels::ENTRY_POINT,
        1,
        Duration::from_secs(5),
    )
    .unwrap();

    let input: Vec<i32> = (0..4096).map(|i| i * 3 - 2048).collect();
    let mut outputs = Vec::new();
    for strategy in AllocationStrategy::ALL {
        let out = runner.run(strategy, &input).unwrap();
        assert_eq!(out.report.workgroups, 4096 / kernels::WORKGROUP_SIZE);
        for (i, (a, b)) in input.iter().zip(&out.values).enumerate() {
            assert_eq!(*b, a + a, "{strategy} element {i}");
        }
        outputs.push(out.values);
    }
    assert!(outputs.windows(2).all(|w| w[0] == w[1]));
}

#[test]
#[ignore = "requires a Vulkan device - run with --ignored on GPU machine"]
fn partial_workgroup_is_padded() {
    let ctx = context();
    let config = ComputeConfig::default();
    let mut runner =
        BatchRunner::with_config(&ctx, &config, &kernels::sum_kernel_bytes(), kernels::ENTRY_POINT)
            .unwrap();
    let input: Vec<i32> = (1..=100).collect();
    let out = runner.run(AllocationStrategy::SingleBuffer, &input).unwrap();
    assert_eq!(out.values.len(), 100);
    assert_eq!(out.values[99], 200);
    assert_eq!(out.report.workgroups, 2);
}

#[test]
#[ignore = "requires a Vulkan device - run with --ignored on GPU machine"]
fn pool_exhaustion_leaves_budget_unchanged() {
    let ctx = context();
    let layout = DescriptorLayout::create(&ctx, kernels::SLOT_COUNT).unwrap();
    let mut pool = DescriptorPool::create(&ctx, 1, &layout).unwrap();

    let _set = pool.allocate_set(&ctx, &layout).unwrap();
    let before = *pool.budget();
    let err = pool.allocate_set(&ctx, &layout).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AllocationFailure);
    assert_eq!(*pool.budget(), before);

    pool.destroy(&ctx);
    layout.destroy(&ctx);
}

#[test]
#[ignore = "requires a Vulkan device - run with --ignored on GPU machine"]
fn unsubmitted_fence_times_out() {
    let ctx = context();
    let fence = Fence::new(ctx.device()).unwrap();
    let timeout = Duration::from_millis(100);
    let started = Instant::now();
    let err = await_completion(&fence, timeout).unwrap_err();
    assert!(matches!(err, ComputeError::SubmissionTimeout { .. }));
    assert!(started.elapsed() >= timeout);
    assert!(started.elapsed() < timeout + Duration::from_secs(1));
}

#[test]
#[ignore = "requires a Vulkan device - run with --ignored on GPU machine"]
fn allocator_rejects_misuse() {
    let ctx = context();
    let allocator = ResourceAllocator::new(&ctx);
    let requirements = allocator.buffer_requirements(1024).unwrap();
    let memory_type = allocator.select_memory_type(&requirements).unwrap();
    let flags = ctx.memory_properties().memory_types[memory_type as usize].property_flags;
    assert!(flags.contains(HOST_ACCESSIBLE));

    let mut allocation = allocator.allocate(requirements.size * 2, &requirements).unwrap();
    if requirements.alignment > 1 {
        let err = allocator.create_buffer(1024, &allocation, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUsage);
    }
    let err = allocator.create_buffer(1024, &allocation, requirements.size * 2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidUsage);

    let mut buffer = allocator.create_buffer(1024, &allocation, 0).unwrap();
    let first = allocator.map(&mut allocation).unwrap().as_ptr();
    let again = allocator.map(&mut allocation).unwrap().as_ptr();
    assert_eq!(first, again);

    allocator.free(&mut buffer, &mut allocation).unwrap();
    let err = allocator.free(&mut buffer, &mut allocation).unwrap_err();
    assert!(matches!(err, ComputeError::AlreadyReleased(_)));
}

#[test]
#[ignore = "requires a Vulkan device - run with --ignored on GPU machine"]
fn rebinding_a_slot_replaces_the_buffer() {
    let ctx = context();
    let allocator = ResourceAllocator::new(&ctx);
    let layout = DescriptorLayout::create(&ctx, 2).unwrap();
    let mut pool = DescriptorPool::create(&ctx, 1, &layout).unwrap();
    let mut set = pool.allocate_set(&ctx, &layout).unwrap();

    let requirements = allocator.buffer_requirements(256).unwrap();
    let mut alloc_a = allocator.allocate(requirements.size, &requirements).unwrap();
    let mut alloc_b = allocator.allocate(requirements.size, &requirements).unwrap();
    let mut a = allocator.create_buffer(256, &alloc_a, 0).unwrap();
    let mut b = allocator.create_buffer(256, &alloc_b, 0).unwrap();

    set.bind(&ctx, 0, &a).unwrap();
    set.bind(&ctx, 0, &b).unwrap();
    assert_eq!(set.binding(0), Some(b.handle()));
    assert_eq!(set.bind(&ctx, 2, &a).unwrap_err().kind(), ErrorKind::InvalidUsage);

    allocator.free(&mut a, &mut alloc_a).unwrap();
    assert_eq!(set.bind(&ctx, 1, &a).unwrap_err().kind(), ErrorKind::InvalidUsage);
    allocator.free(&mut b, &mut alloc_b).unwrap();
    pool.destroy(&ctx);
    layout.destroy(&ctx);
}

#[test]
#[ignore = "requires a Vulkan device - run with --ignored on GPU machine"]
fn pipeline_rejects_unknown_entry_point_and_rebuilds() {
    let ctx = context();
    let layout = DescriptorLayout::create(&ctx, 2).unwrap();
    let bytes = kernels::sum_kernel_bytes();

    let err = ComputePipeline::build(&ctx, &bytes, "sum", &layout).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ShaderLoad);
    let err = ComputePipeline::build(&ctx, &bytes[..bytes.len() - 2], "main", &layout).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ShaderLoad);

    let pipeline = ComputePipeline::build(&ctx, &bytes, "main", &layout).unwrap();
    assert_eq!(pipeline.workgroup_size(), [kernels::WORKGROUP_SIZE, 1, 1]);
    let pipeline = pipeline.rebuild(&ctx, &bytes, "main", &layout).unwrap();
    pipeline.destroy(&ctx);
    layout.destroy(&ctx);
}
