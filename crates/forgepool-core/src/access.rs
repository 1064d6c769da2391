use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::clock::now_millis;
use crate::record::BackendRecord;
use crate::wake::Waker;

/// A scoped resource representing one reserved generation slot on a backend
/// (spec §4.5). Acquisition atomically incremented `usages`; dropping (or
/// explicitly calling [`BackendAccess::release`]) decrements it and signals
/// the scheduler. Double-release is a no-op, matching the teacher's RAII
/// `Permit` in `backend/admission.rs`, generalized to also wake the
/// scheduler on release rather than just returning a semaphore slot.
pub struct BackendAccess {
    record: Arc<BackendRecord>,
    waker: Waker,
    released: AtomicBool,
}

impl BackendAccess {
    /// Only constructed by the scheduler after a successful
    /// `BackendRecord::try_acquire`.
    pub(crate) fn new(record: Arc<BackendRecord>, waker: Waker) -> Self {
        Self {
            record,
            waker,
            released: AtomicBool::new(false),
        }
    }

    pub fn backend_id(&self) -> forgepool_types::BackendId {
        self.record.id
    }

    pub fn driver(&self) -> &Arc<dyn crate::driver::BackendDriver> {
        &self.record.driver
    }

    /// Release this slot. Guaranteed on every exit path (success, error,
    /// cancel) since `Drop` also calls this; explicit calls are a no-op the
    /// second time.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.record.release(now_millis());
        self.waker.wake();
    }
}

impl Drop for BackendAccess {
    fn drop(&mut self) {
        self.release();
    }
}
