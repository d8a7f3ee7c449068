//! Shared memory allocator tests

mod common;

use common::assert_no_leak;
use qpuforge::backend::mailbox::ffi::{TAG_ALLOCATE_MEMORY, TAG_LOCK_MEMORY, TAG_RELEASE_MEMORY};
use qpuforge::backend::simulated::{Fault, SimulatedDevice};
use qpuforge::backend::{CacheOp, CachePolicy, FirmwareChannel, MemFlags};
use qpuforge::memory::Allocator;
use qpuforge::{QpuForgeError, Runtime, RuntimeConfig, Subsystem};

fn memory_runtime(device: &SimulatedDevice) -> Runtime {
    let mut rt = Runtime::new(device.platform(), device.kernel_library(), RuntimeConfig::default())
        .unwrap();
    rt.init_subsystem(Subsystem::Memory).unwrap();
    rt
}

fn close(mut rt: Runtime) {
    rt.finalize_subsystem(Subsystem::Memory).unwrap();
    rt.shutdown().unwrap();
}

#[test]
fn test_allocations_are_aligned_and_disjoint() {
    let device = SimulatedDevice::new();
    let mut rt = memory_runtime(&device);

    let requests = [(4, 4), (100, 16), (4096, 4096), (12345, 256), (64, 65536), (8000, 8)];
    let buffers: Vec<_> = requests
        .iter()
        .map(|&(size, align)| rt.allocate(size, align).unwrap())
        .collect();

    for (buffer, &(size, align)) in buffers.iter().zip(&requests) {
        assert_eq!(buffer.len(), size);
        assert_eq!(buffer.as_ptr() as usize % align, 0);
        // The bus address follows the host address within the page
        assert_eq!(buffer.bus_address() as usize % 4096, buffer.as_ptr() as usize % 4096);
        assert_eq!(rt.resolve_bus_address(buffer.as_ptr()).unwrap(), buffer.bus_address());
    }

    let mut cpu: Vec<_> = buffers
        .iter()
        .map(|b| (b.as_ptr() as usize, b.as_ptr() as usize + b.len()))
        .collect();
    let mut bus: Vec<_> = buffers
        .iter()
        .map(|b| (b.bus_address() as usize, b.bus_address() as usize + b.len()))
        .collect();
    cpu.sort_unstable();
    bus.sort_unstable();
    for ranges in [&cpu, &bus] {
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "overlap: {:?}", pair);
        }
    }
    assert_eq!(rt.allocations().count(), requests.len());
    rt.dump_allocated();

    for buffer in buffers {
        rt.free(buffer).unwrap();
    }
    assert_eq!(rt.stats().live_allocations, 0);
    close(rt);
    assert_no_leak(&device);
}

#[test]
fn test_interior_pointers_resolve() {
    let device = SimulatedDevice::new();
    let mut rt = memory_runtime(&device);
    let buffer = rt.allocate(1000, 64).unwrap();

    let base = buffer.bus_address();
    // SAFETY: offsets stay inside the 1000-byte buffer
    let (mid, last) = unsafe { (buffer.as_ptr().add(500), buffer.as_ptr().add(999)) };
    assert_eq!(rt.resolve_bus_address(mid).unwrap(), base + 500);
    assert_eq!(rt.resolve_bus_address(last).unwrap(), base + 999);

    // One past the end belongs to no allocation
    // SAFETY: one-past-the-end pointers may be formed
    let end = unsafe { buffer.as_ptr().add(1000) };
    let err = rt.resolve_bus_address(end).unwrap_err();
    assert!(matches!(err, QpuForgeError::UnknownPointer { .. }));

    let host = vec![0u8; 16];
    let err = rt.resolve_bus_address(host.as_ptr()).unwrap_err();
    assert!(matches!(err, QpuForgeError::UnknownPointer { .. }));

    rt.cache_maintenance(mid, 400, CacheOp::Clean).unwrap();
    let err = rt.cache_maintenance(mid, 501, CacheOp::Invalidate).unwrap_err();
    assert!(matches!(err, QpuForgeError::UnknownPointer { operation: "cache maintenance", .. }));

    rt.free(buffer).unwrap();
    close(rt);
}

#[test]
fn test_double_free_is_reported() {
    let device = SimulatedDevice::new();
    let mut firmware = FirmwareChannel::new(Box::new(device.clone()));
    firmware.open().unwrap();
    let mut allocator = Allocator::new(Box::new(device.clone()), MemFlags::DIRECT, CachePolicy::Cached);
    allocator.open().unwrap();

    let buffer = allocator.allocate(&mut firmware, 256, 16).unwrap();
    let ptr = buffer.as_ptr();
    allocator.free(&mut firmware, buffer).unwrap();
    assert_eq!(device.stats().releases, 1);

    let err = allocator.free_ptr(&mut firmware, ptr).unwrap_err();
    assert!(matches!(err, QpuForgeError::UnknownPointer { operation: "free", .. }));
    assert_eq!(device.stats().releases, 1);

    allocator.close(&mut firmware).unwrap();
    firmware.close().unwrap();
    assert_no_leak(&device);
}

#[test]
fn test_bad_requests_rejected() {
    let device = SimulatedDevice::new();
    let mut rt = memory_runtime(&device);

    let err = rt.allocate(0, 16).unwrap_err();
    assert!(matches!(err, QpuForgeError::InvalidParameter { param: "size", .. }));
    let err = rt.allocate(64, 24).unwrap_err();
    assert!(matches!(err, QpuForgeError::InvalidParameter { param: "alignment", .. }));
    assert_eq!(device.stats().allocations, 0);

    close(rt);
}

#[test]
fn test_firmware_failures_leave_nothing_behind() {
    let device = SimulatedDevice::with_capacity(1 << 20);
    let mut rt = memory_runtime(&device);

    let err = rt.allocate(2 << 20, 4096).unwrap_err();
    assert!(matches!(err, QpuForgeError::AllocationFailed(_)));

    device.inject_fault(TAG_ALLOCATE_MEMORY, Fault::Return(0));
    let err = rt.allocate(4096, 4096).unwrap_err();
    assert!(matches!(err, QpuForgeError::AllocationFailed(_)));

    // Lock failure releases the handle it got
    device.inject_fault(TAG_LOCK_MEMORY, Fault::Return(0));
    let err = rt.allocate(4096, 4096).unwrap_err();
    assert!(matches!(err, QpuForgeError::AllocationFailed(_)));
    assert_eq!(device.stats().live_blocks, 0);
    assert_eq!(rt.stats().live_allocations, 0);

    // Faults are one-shot
    let buffer = rt.allocate(4096, 4096).unwrap();
    rt.free(buffer).unwrap();
    close(rt);
    assert_no_leak(&device);
}

#[test]
fn test_failed_cleanup_keeps_the_original_error() {
    let device = SimulatedDevice::new();
    let mut rt = memory_runtime(&device);

    device.inject_fault(TAG_LOCK_MEMORY, Fault::Return(0));
    device.inject_fault(TAG_RELEASE_MEMORY, Fault::Status(0x8000_0001));
    match rt.allocate(4096, 4096).unwrap_err() {
        QpuForgeError::AllocationFailed(msg) => assert!(msg.contains("locking"), "{}", msg),
        other => panic!("expected AllocationFailed, got {:?}", other),
    }
    // The firmware kept the handle it failed to release
    assert_eq!(device.stats().live_blocks, 1);
    assert_eq!(rt.stats().live_allocations, 0);

    let buffer = rt.allocate(4096, 4096).unwrap();
    rt.free(buffer).unwrap();
    close(rt);
}

#[test]
fn test_resolve_after_free_fails() {
    let device = SimulatedDevice::new();
    let mut rt = memory_runtime(&device);

    let buffer = rt.allocate(8192, 4096).unwrap();
    let ptr = buffer.as_ptr();
    let interior = ptr.wrapping_add(100);
    assert_eq!(rt.resolve_bus_address(ptr).unwrap(), buffer.bus_address());
    rt.free(buffer).unwrap();

    for p in [ptr, interior] {
        let err = rt.resolve_bus_address(p).unwrap_err();
        assert!(matches!(
            err,
            QpuForgeError::UnknownPointer { operation: "resolve", .. }
        ));
    }
    close(rt);
    assert_no_leak(&device);
}

#[test]
fn test_memory_close_reclaims_leaked_buffers() {
    let device = SimulatedDevice::new();
    let mut rt = memory_runtime(&device);
    let _leaked = rt.allocate(4096, 4096).unwrap();
    assert_eq!(device.stats().live_blocks, 1);
    close(rt);
    assert_no_leak(&device);
}

#[test]
fn test_uncached_policy_is_recorded() {
    let device = SimulatedDevice::new();
    let mut rt = memory_runtime(&device);
    let buffer = rt.allocate_with_policy(512, 64, CachePolicy::Uncached).unwrap();
    assert_eq!(buffer.cache_policy(), CachePolicy::Uncached);
    let record = rt.allocations().next().unwrap();
    assert_eq!(record.cache_policy(), CachePolicy::Uncached);
    assert_eq!(record.bus_address, buffer.bus_address());
    rt.free(buffer).unwrap();
    close(rt);
}
