use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use rasterfx::{
    Capabilities, CapabilityProbe, CapabilityQuery, Precision, SoftwareContextFactory,
    capability_probe,
};

struct CountingQuery {
    calls: Arc<AtomicUsize>,
}

impl CapabilityQuery for CountingQuery {
    fn query(&self) -> Option<Capabilities> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Some(Capabilities {
            max_texture_size: 8192,
            precision: Some(Precision::Medium),
        })
    }
}

#[test]
fn probing_is_idempotent() {
    let calls = Arc::new(AtomicUsize::new(0));
    let probe = CapabilityProbe::new(CountingQuery {
        calls: calls.clone(),
    });

    let first = (probe.max_texture_size(), probe.precision());
    for _ in 0..10 {
        assert_eq!((probe.max_texture_size(), probe.precision()), first);
        assert!(probe.is_supported(8192));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn probe_is_shared_across_threads() {
    let calls = Arc::new(AtomicUsize::new(0));
    let probe = Arc::new(CapabilityProbe::new(CountingQuery {
        calls: calls.clone(),
    }));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let probe = probe.clone();
            std::thread::spawn(move || probe.max_texture_size())
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), Some(8192));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn absent_capability_is_not_an_error() {
    let probe = CapabilityProbe::from_factory(SoftwareContextFactory::unavailable());
    assert_eq!(probe.max_texture_size(), None);
    assert_eq!(probe.precision(), None);
    for size in [0, 1, 2048, u32::MAX] {
        assert!(!probe.is_supported(size));
    }
}

#[test]
fn global_probe_is_a_singleton() {
    let a = capability_probe();
    let b = capability_probe();
    assert!(std::ptr::eq(a, b));
    assert_eq!(a.capabilities(), b.capabilities());
    if cfg!(not(feature = "gpu")) {
        assert_eq!(a.capabilities(), None);
    }
}
