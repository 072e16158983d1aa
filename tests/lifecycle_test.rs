use std::sync::Arc;

use crossgc::{
    Bridge, BridgeConfig, BridgeError, GuestRuntime, GuestValue, HostCell, HostHandle, platform,
};

#[test]
fn test_drop_tears_down() {
    let host = HostCell::new("kept by host");
    let (runtime, handle) = {
        let bridge = Bridge::initialize(BridgeConfig::default()).unwrap();
        let value = bridge.heap().alloc(GuestValue::object()).unwrap();
        let handle = bridge
            .register_value(HostHandle::new(host.clone()), value)
            .unwrap();

        (Arc::clone(bridge.runtime()), handle)
    };

    assert!(runtime.is_shut_down());
    assert!(handle.is_released());
    assert_eq!(Arc::strong_count(&host), 1);
}

#[test]
fn test_shutdown_then_drop_is_single_teardown() {
    let bridge = Bridge::initialize(BridgeConfig::default()).unwrap();
    let global = bridge.context().global_handle().clone();

    bridge.shutdown();
    assert!(global.is_released());

    // Second teardown (from Drop) must not fault
    drop(bridge);
    assert!(!global.release());
}

#[test]
fn test_platform_initialized_once() {
    let _first = Bridge::initialize(BridgeConfig::default().with_helper_threads(3)).unwrap();
    let size = platform::helper_threads().unwrap();

    // Later configs do not resize the process-wide pool
    let _second = Bridge::initialize(BridgeConfig::default().with_helper_threads(size + 5)).unwrap();
    assert_eq!(platform::helper_threads(), Some(size));
}

#[test]
fn test_one_dispatch_hook_per_runtime() {
    let runtime = GuestRuntime::new(&BridgeConfig::default());
    let first = Bridge::attach(Arc::clone(&runtime), &BridgeConfig::default()).unwrap();

    let second = Bridge::attach(Arc::clone(&runtime), &BridgeConfig::default());
    assert!(matches!(second, Err(BridgeError::AlreadyInitialized)));

    first.shutdown();
    assert!(runtime.is_shut_down());

    let late = Bridge::attach(runtime, &BridgeConfig::default());
    assert!(matches!(late, Err(BridgeError::ShutDown)));
}
