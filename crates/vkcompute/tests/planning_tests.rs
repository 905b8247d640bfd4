//! Device-free tests over the public planning and inspection API.

use ash::vk;
use proptest::prelude::*;
use vkcompute::config::{REDHAT_VENDOR_ID, VIRTIO_GPU_DEVICE_ID};
use vkcompute::memory::HOST_ACCESSIBLE;
use vkcompute::{
    choose_device, find_compute_queue_family, find_memory_type, kernels, plan_layout,
    workgroup_count, AllocationStrategy, DeviceCriteria, DeviceIdentity, ErrorKind, PoolBudget,
    SelectionReason, SpirvModule,
};

fn device(index: usize, vendor_id: u32, device_id: u32) -> DeviceIdentity {
    DeviceIdentity {
        index,
        name: format!("gpu{index}"),
        vendor_id,
        device_id,
        device_type: vk::PhysicalDeviceType::INTEGRATED_GPU,
    }
}

#[test]
fn non_strict_without_match_selects_first_device() {
    let devices = [device(0, 0x8086, 0x46a6), device(1, 0x10de, 0x2684)];
    let criteria = DeviceCriteria::default();
    assert_eq!(choose_device(&devices, &criteria).unwrap(), (0, SelectionReason::Fallback));
}

#[test]
fn strict_with_match_selects_virtio_gpu() {
    let devices = [device(0, 0x8086, 0x46a6), device(1, REDHAT_VENDOR_ID, VIRTIO_GPU_DEVICE_ID)];
    let criteria = DeviceCriteria { strict: true, ..Default::default() };
    assert_eq!(choose_device(&devices, &criteria).unwrap(), (1, SelectionReason::PreferredMatch));
}

#[test]
fn graphics_family_listed_first_resolves_to_compute_family() {
    let families = [
        vk::QueueFamilyProperties {
            queue_flags: vk::QueueFlags::GRAPHICS,
            queue_count: 1,
            ..Default::default()
        },
        vk::QueueFamilyProperties {
            queue_flags: vk::QueueFlags::COMPUTE,
            queue_count: 1,
            ..Default::default()
        },
    ];
    assert_eq!(find_compute_queue_family(&families).unwrap(), 1);
}

#[test]
fn first_type_with_one_bit_is_not_selected() {
    let mut props =
        vk::PhysicalDeviceMemoryProperties { memory_type_count: 2, ..Default::default() };
    props.memory_types[0].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    props.memory_types[1].property_flags = HOST_ACCESSIBLE | vk::MemoryPropertyFlags::DEVICE_LOCAL;
    assert_eq!(find_memory_type(&props, 0b11, HOST_ACCESSIBLE).unwrap(), 1);

    let err = find_memory_type(&props, 0b01, HOST_ACCESSIBLE).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoSuitableMemoryType);
}

#[test]
fn pool_budget_exhaustion_is_allocation_failure() {
    let mut budget = PoolBudget::new(3);
    for _ in 0..3 {
        budget.try_reserve().unwrap();
    }
    let before = budget;
    assert_eq!(budget.try_reserve().unwrap_err().kind(), ErrorKind::AllocationFailure);
    assert_eq!(budget, before);
}

#[test]
fn embedded_kernel_matches_its_constants() {
    let module = SpirvModule::parse(&kernels::sum_kernel_bytes()).unwrap();
    let ep = module.compute_entry_point(kernels::ENTRY_POINT).unwrap();
    assert_eq!(ep.workgroup_size_x(), Some(kernels::WORKGROUP_SIZE));
    assert_eq!(module.version(), (1, 0));
}

#[test]
fn shared_layout_for_kernel_buffers() {
    let req = vk::MemoryRequirements { size: 4096, alignment: 256, memory_type_bits: 1 };
    let layout = plan_layout(AllocationStrategy::SharedAllocation, 4096, &req).unwrap();
    assert_eq!(layout.output().offset, 4096);
    assert_eq!(layout.allocation_sizes(), &[8192]);
}

#[test]
fn every_planned_layout_has_input_and_output() {
    let req = vk::MemoryRequirements { size: 256, alignment: 64, memory_type_bits: 1 };
    for strategy in AllocationStrategy::ALL {
        let layout = plan_layout(strategy, 256, &req).unwrap();
        assert_eq!(layout.strategy(), strategy);
        assert!(!layout.buffers().is_empty());
        for placement in [layout.input(), layout.output()] {
            assert!(placement.allocation < layout.allocation_sizes().len());
            let end = placement.offset + layout.buffer_size();
            assert!(end <= layout.allocation_sizes()[placement.allocation]);
        }
    }
}

proptest! {
    #[test]
    fn prop_workgroups_for_kernel_never_zero(elements in 1u64..1 << 32) {
        let groups = workgroup_count(elements, kernels::WORKGROUP_SIZE).unwrap();
        prop_assert!(groups >= 1);
        prop_assert!(u64::from(groups) * u64::from(kernels::WORKGROUP_SIZE) >= elements);
    }
}
