//! Reference-counted subsystem lifecycle

mod common;

use common::assert_no_leak;
use qpuforge::backend::simulated::{SimEvent, SimulatedDevice};
use qpuforge::{QpuForgeError, Runtime, RuntimeConfig, Subsystem, TimeoutPolicy};

fn bare_runtime(device: &SimulatedDevice) -> Runtime {
    Runtime::new(device.platform(), device.kernel_library(), RuntimeConfig::default()).unwrap()
}

#[test]
fn test_nested_init_touches_device_once() {
    let device = SimulatedDevice::new();
    let mut rt = bare_runtime(&device);

    for _ in 0..3 {
        rt.init_subsystem(Subsystem::Launcher).unwrap();
    }
    assert_eq!(rt.ref_count(Subsystem::Launcher), 3);
    assert_eq!(rt.ref_count(Subsystem::Memory), 1);
    assert_eq!(rt.ref_count(Subsystem::Mailbox), 1);
    let stats = device.stats();
    assert_eq!(stats.qpu_enables, 1);
    // The launch control block
    assert_eq!(stats.allocations, 1);

    for remaining in [2, 1] {
        rt.finalize_subsystem(Subsystem::Launcher).unwrap();
        assert_eq!(rt.ref_count(Subsystem::Launcher), remaining);
        assert!(device.qpu_enabled());
    }
    rt.finalize_subsystem(Subsystem::Launcher).unwrap();
    assert_eq!(device.stats().qpu_disables, 1);
    assert_eq!(rt.ref_count(Subsystem::Mailbox), 0);
    assert!(!device.mailbox_open());

    let err = rt.finalize_subsystem(Subsystem::Launcher).unwrap_err();
    assert!(matches!(err, QpuForgeError::RefCountUnderflow("launcher")));
    assert!(err.is_lifecycle_error());

    rt.shutdown().unwrap();
    assert_no_leak(&device);
}

#[test]
fn test_dependencies_come_up_in_order() {
    let device = SimulatedDevice::new();
    let mut rt = bare_runtime(&device);
    rt.init_subsystem(Subsystem::Launcher).unwrap();

    let events = device.events();
    let position = |wanted: &SimEvent| events.iter().position(|e| e == wanted).unwrap();
    assert!(position(&SimEvent::MailboxOpened) < position(&SimEvent::MemoryOpened));
    assert_eq!(device.stats().qpu_enables, 1);

    device.clear_events();
    rt.finalize_subsystem(Subsystem::Launcher).unwrap();
    let events = device.events();
    let position = |wanted: &SimEvent| events.iter().position(|e| e == wanted).unwrap();
    assert!(position(&SimEvent::MemoryClosed) < position(&SimEvent::MailboxClosed));
    rt.shutdown().unwrap();
}

#[test]
fn test_kernel_family_init_is_host_only() {
    let device = SimulatedDevice::new();
    let mut rt = bare_runtime(&device);
    rt.init_subsystem(Subsystem::Gemm).unwrap();
    rt.init_subsystem(Subsystem::Abs).unwrap();
    assert!(device.events().is_empty());
    assert!(!device.mailbox_open());

    rt.finalize_subsystem(Subsystem::Gemm).unwrap();
    rt.finalize_subsystem(Subsystem::Abs).unwrap();
    rt.shutdown().unwrap();
}

#[test]
fn test_shutdown_reports_unbalanced_counts() {
    let device = SimulatedDevice::new();
    let mut rt =
        Runtime::open(device.platform(), device.kernel_library(), RuntimeConfig::default()).unwrap();
    rt.init_subsystem(Subsystem::Gemm).unwrap();
    assert_eq!(rt.ref_count(Subsystem::Gemm), 2);

    match rt.shutdown() {
        Err(QpuForgeError::Unbalanced(detail)) => assert_eq!(detail, "gemm=1"),
        other => panic!("expected Unbalanced, got {:?}", other),
    }
    // Device side still fully released
    assert_no_leak(&device);
}

#[test]
fn test_reopen_after_shutdown() {
    let device = SimulatedDevice::new();
    for _ in 0..2 {
        let rt = Runtime::open(device.platform(), device.kernel_library(), RuntimeConfig::default())
            .unwrap();
        rt.shutdown().unwrap();
        assert_no_leak(&device);
    }
    let stats = device.stats();
    assert_eq!(stats.qpu_enables, 2);
    assert_eq!(stats.qpu_disables, 2);
    assert_eq!(stats.allocations, stats.releases);
}

#[test]
fn test_invalid_config_rejected() {
    let device = SimulatedDevice::new();
    let config = RuntimeConfig::default().with_timeouts(TimeoutPolicy {
        parallel_ms: 0,
        single_unit_ms: 1_000,
    });
    let err = Runtime::new(device.platform(), device.kernel_library(), config).unwrap_err();
    assert!(matches!(err, QpuForgeError::InvalidParameter { param: "timeouts", .. }));

    let config = RuntimeConfig {
        control_alignment: 24,
        ..RuntimeConfig::default()
    };
    assert!(Runtime::new(device.platform(), device.kernel_library(), config).is_err());
    assert!(device.events().is_empty());
}

#[test]
fn test_enable_failure_unwinds_launcher() {
    use qpuforge::backend::mailbox::ffi::TAG_SET_ENABLE_QPU;
    use qpuforge::backend::simulated::Fault;

    let device = SimulatedDevice::new();
    let mut rt = bare_runtime(&device);
    device.inject_fault(TAG_SET_ENABLE_QPU, Fault::Status(0x8000_0001));

    let err = rt.init_subsystem(Subsystem::Main).unwrap_err();
    assert!(err.is_protocol_error());
    for subsystem in Subsystem::ALL {
        assert_eq!(rt.ref_count(subsystem), 0, "{}", subsystem);
    }
    assert!(!device.mailbox_open());
    assert!(!device.memory_open());

    // A later attempt succeeds
    rt.init_subsystem(Subsystem::Main).unwrap();
    rt.shutdown().unwrap();
    assert_no_leak(&device);
}
