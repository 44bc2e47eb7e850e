//! Access hook registry and device synchronization seam
//!
//! Every `get`/`cast`/`clear` on a [`SyncedArray`](crate::SyncedArray)
//! reports through an [`AccessHook`] before touching residency state. The
//! hook holds at most one observer; the scheduler arms it for the duration
//! of an iteration and disarms it around its own executor steps so that
//! transfers it issues are not recorded as graph accesses.

use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::Result;
use crate::tensor::{Context, Dtype, SyncedArrayRef};

/// Kind of array access reported to the hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// Materialize a copy, keeping others valid
    Get,
    /// Convert to a single copy
    Cast,
    /// Release all copies
    Clear,
}

/// Receiver of array access notifications
pub trait AccessObserver: Send + Sync {
    /// Called on every access of an array whose hook this observer is
    /// installed in
    fn on_access(
        &self,
        array: &SyncedArrayRef,
        kind: AccessKind,
        dtype: Dtype,
        ctx: &Context,
        write_only: bool,
    ) -> Result<()>;
}

/// Single-slot registry of the active access observer
///
/// The slot holds a `Weak` so installing an observer never extends its
/// lifetime; an expired observer behaves like an empty slot.
pub struct AccessHook {
    slot: RwLock<Option<Weak<dyn AccessObserver>>>,
}

impl AccessHook {
    /// Create an empty hook registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self { slot: RwLock::new(None) })
    }

    /// The process-wide default registry
    ///
    /// Runtimes with a single training loop can share this slot the way the
    /// arrays of one graph share a callback; multiple independent loops
    /// should create their own registries instead.
    pub fn global() -> Arc<Self> {
        static GLOBAL: Lazy<Arc<AccessHook>> = Lazy::new(AccessHook::new);
        GLOBAL.clone()
    }

    /// Install `observer`, replacing any previous one
    pub fn set(&self, observer: Weak<dyn AccessObserver>) {
        *self.slot.write() = Some(observer);
    }

    /// Remove the installed observer
    pub fn clear(&self) {
        *self.slot.write() = None;
    }

    /// True when an observer is installed and alive
    pub fn is_armed(&self) -> bool {
        self.slot
            .read()
            .as_ref()
            .is_some_and(|w| w.strong_count() > 0)
    }

    /// Report one access to the installed observer, if any
    ///
    /// The slot lock is released before the observer runs, so an observer
    /// may arm or disarm the hook from inside the callback.
    pub fn emit(
        &self,
        array: &SyncedArrayRef,
        kind: AccessKind,
        dtype: Dtype,
        ctx: &Context,
        write_only: bool,
    ) -> Result<()> {
        let observer = self.slot.read().clone();
        if let Some(observer) = observer.and_then(|w| w.upgrade()) {
            observer.on_access(array, kind, dtype, ctx, write_only)?;
        }
        Ok(())
    }
}

/// Device-runtime synchronization capability
///
/// The scheduler calls this once per iteration, after its final wait pass,
/// so the host never mutates buffers an outstanding async copy still reads.
pub trait DeviceSynchronizer: Send + Sync {
    /// Block until all device work targeting `ctx` has completed
    fn synchronize(&self, ctx: &Context);
}

/// Synchronizer for runtimes with no asynchronous device work
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSynchronizer;

impl DeviceSynchronizer for NullSynchronizer {
    fn synchronize(&self, _ctx: &Context) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{AsyncFlags, SyncedArray};
    use parking_lot::Mutex;

    struct Recorder {
        seen: Mutex<Vec<(AccessKind, Dtype)>>,
    }

    impl AccessObserver for Recorder {
        fn on_access(
            &self,
            _array: &SyncedArrayRef,
            kind: AccessKind,
            dtype: Dtype,
            _ctx: &Context,
            _write_only: bool,
        ) -> Result<()> {
            self.seen.lock().push((kind, dtype));
            Ok(())
        }
    }

    fn observe(hook: &AccessHook, recorder: &Arc<Recorder>) {
        let recorder_dyn: Arc<dyn AccessObserver> = recorder.clone();
        let observer: Weak<dyn AccessObserver> = Arc::downgrade(&recorder_dyn);
        hook.set(observer);
    }

    #[test]
    fn test_emit_reaches_observer() {
        let hook = AccessHook::new();
        let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        observe(&hook, &recorder);
        assert!(hook.is_armed());

        let a = SyncedArray::new(hook.clone(), 8);
        a.get(Dtype::Float32, &Context::new("CudaCachedArray"), AsyncFlags::NONE)
            .unwrap();
        a.clear().unwrap();

        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, AccessKind::Get);
        assert_eq!(seen[1].0, AccessKind::Clear);
    }

    #[test]
    fn test_disarmed_hook_is_silent() {
        let hook = AccessHook::new();
        let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        observe(&hook, &recorder);
        hook.clear();
        assert!(!hook.is_armed());

        let a = SyncedArray::new(hook, 8);
        a.get(Dtype::Float32, &Context::new("CudaCachedArray"), AsyncFlags::NONE)
            .unwrap();
        assert!(recorder.seen.lock().is_empty());
    }

    #[test]
    fn test_dropped_observer_behaves_like_empty_slot() {
        let hook = AccessHook::new();
        {
            let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
            observe(&hook, &recorder);
        }
        assert!(!hook.is_armed());

        let a = SyncedArray::new(hook, 8);
        assert!(a
            .get(Dtype::Float32, &Context::new("CudaCachedArray"), AsyncFlags::NONE)
            .is_ok());
    }
}
