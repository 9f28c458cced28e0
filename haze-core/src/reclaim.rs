use std::sync::Arc;

use candle_core::Device;
use tracing::warn;

/// Seam for returning accelerator memory after an inference pass. The
/// production implementation talks to the compute device; tests substitute
/// a recording double.
pub trait ReclaimMemory: Send + Sync {
    fn reclaim(&self);
}

/// Reclaims device memory by synchronizing the device, so buffers freed by
/// dropped tensors are actually returned before the response leaves the
/// worker. Dropping the per-request tensors is the general reclaim; there
/// is no separate collector pass to trigger.
pub struct DeviceReclaim {
    device: Device,
}

impl DeviceReclaim {
    pub fn new(device: Device) -> Self {
        Self { device }
    }
}

impl ReclaimMemory for DeviceReclaim {
    fn reclaim(&self) {
        if let Err(err) = self.device.synchronize() {
            warn!(?err, "failed to synchronize device during memory reclaim");
        }
    }
}

/// Runs the reclaim exactly once when dropped, whichever way the scope is
/// left: normal return, early error return, or unwinding.
pub struct ReclaimGuard {
    reclaimer: Arc<dyn ReclaimMemory>,
}

impl ReclaimGuard {
    pub fn new(reclaimer: Arc<dyn ReclaimMemory>) -> Self {
        Self { reclaimer }
    }
}

impl Drop for ReclaimGuard {
    fn drop(&mut self) {
        self.reclaimer.reclaim();
    }
}

#[cfg(test)]
mod tests {
    use std::panic::AssertUnwindSafe;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct RecordingReclaim(AtomicUsize);

    impl ReclaimMemory for RecordingReclaim {
        fn reclaim(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn guard_reclaims_once_on_drop() {
        let recorder = Arc::new(RecordingReclaim::default());
        {
            let _guard = ReclaimGuard::new(recorder.clone());
            assert_eq!(recorder.0.load(Ordering::SeqCst), 0);
        }
        assert_eq!(recorder.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guard_reclaims_on_unwind() {
        let recorder = Arc::new(RecordingReclaim::default());
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let _guard = ReclaimGuard::new(recorder.clone());
            panic!("inference blew up");
        }));
        assert!(result.is_err());
        assert_eq!(recorder.0.load(Ordering::SeqCst), 1);
    }
}
