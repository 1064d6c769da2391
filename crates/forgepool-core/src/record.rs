use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use forgepool_types::{BackendId, BackendStatus, BackendTypeDescriptor};
use tokio::sync::RwLock;

use crate::driver::BackendDriver;

/// Per-backend mutable state (spec §3 "Backend Record").
///
/// Follows the teacher's admission-control pattern of exposing state through
/// atomics/flags that many parties inspect concurrently
/// ([`crate::driver`]/`admission.rs`'s `Permit`), rather than hiding
/// everything behind a single lock: only `status`, `current_model_name` and
/// configuration (`title`/`settings_raw`/`enabled`) need a lock, because they
/// change together and must be observed consistently (invariant 4).
pub struct BackendRecord {
    pub id: BackendId,
    pub back_type: BackendTypeDescriptor,
    pub driver: Arc<dyn BackendDriver>,

    /// Non-negative count of currently-acquired generation slots (invariant 1).
    usages: AtomicU32,
    /// Driver-declared upper bound on concurrent generations.
    max_usages: AtomicU32,
    /// When true, no new acquisition may succeed (clean-shutdown drain, or an
    /// admin-initiated edit/delete in progress).
    reserved: AtomicBool,
    /// When true, the scheduler has committed this backend to an imminent
    /// model load; no new acquisition may increment `usages` (invariant 3).
    reserve_model_load: AtomicBool,
    /// Monotonic edit counter, bumped by `editById`.
    mod_count: AtomicU64,
    /// Wall-clock-ish monotonic timestamp (millis since an arbitrary epoch),
    /// updated on claim and release; used for LRU tie-breaking (§4.4.1).
    time_last_release: AtomicI64,
    /// Number of init attempts so far.
    init_attempts: AtomicU32,

    /// Guards the fields that must change together: status, resident model
    /// name, title, raw settings, and the enabled flag (invariant 4).
    mutable: RwLock<MutableState>,
}

#[derive(Debug, Clone)]
struct MutableState {
    status: BackendStatus,
    current_model_name: Option<String>,
    title: String,
    settings_raw: serde_json::Value,
    enabled: bool,
}

impl BackendRecord {
    pub fn new(
        id: BackendId,
        back_type: BackendTypeDescriptor,
        driver: Arc<dyn BackendDriver>,
        title: String,
        settings_raw: serde_json::Value,
        enabled: bool,
        now_millis: i64,
    ) -> Self {
        let status = if enabled {
            BackendStatus::Waiting
        } else {
            BackendStatus::Disabled
        };
        Self {
            id,
            back_type,
            driver,
            usages: AtomicU32::new(0),
            max_usages: AtomicU32::new(1),
            reserved: AtomicBool::new(false),
            reserve_model_load: AtomicBool::new(false),
            mod_count: AtomicU64::new(0),
            time_last_release: AtomicI64::new(now_millis),
            init_attempts: AtomicU32::new(0),
            mutable: RwLock::new(MutableState {
                status,
                current_model_name: None,
                title,
                settings_raw,
                enabled,
            }),
        }
    }

    pub fn usages(&self) -> u32 {
        self.usages.load(Ordering::SeqCst)
    }

    pub fn max_usages(&self) -> u32 {
        self.max_usages.load(Ordering::SeqCst)
    }

    pub fn set_max_usages(&self, n: u32) {
        self.max_usages.store(n, Ordering::SeqCst);
    }

    pub fn reserved(&self) -> bool {
        self.reserved.load(Ordering::SeqCst)
    }

    pub fn set_reserved(&self, v: bool) {
        self.reserved.store(v, Ordering::SeqCst);
    }

    pub fn reserve_model_load(&self) -> bool {
        self.reserve_model_load.load(Ordering::SeqCst)
    }

    pub fn set_reserve_model_load(&self, v: bool) {
        self.reserve_model_load.store(v, Ordering::SeqCst);
    }

    pub fn mod_count(&self) -> u64 {
        self.mod_count.load(Ordering::SeqCst)
    }

    pub fn bump_mod_count(&self) -> u64 {
        self.mod_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn time_last_release(&self) -> i64 {
        self.time_last_release.load(Ordering::SeqCst)
    }

    pub fn touch_time_last_release(&self, now_millis: i64) {
        self.time_last_release.store(now_millis, Ordering::SeqCst);
    }

    pub fn init_attempts(&self) -> u32 {
        self.init_attempts.load(Ordering::SeqCst)
    }

    pub fn bump_init_attempts(&self) -> u32 {
        self.init_attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn status(&self) -> BackendStatus {
        self.mutable.read().await.status
    }

    pub async fn set_status(&self, status: BackendStatus) {
        self.mutable.write().await.status = status;
    }

    pub async fn current_model_name(&self) -> Option<String> {
        self.mutable.read().await.current_model_name.clone()
    }

    /// Set the resident model name. Callers must only call this while
    /// `reserve_model_load = true && usages == 0` (invariant 4); this method
    /// does not itself enforce that, matching the driver/registry split
    /// where the scheduler owns the commitment and the record just stores it.
    pub async fn set_current_model_name(&self, model: Option<String>) {
        self.mutable.write().await.current_model_name = model;
    }

    pub async fn title(&self) -> String {
        self.mutable.read().await.title.clone()
    }

    pub async fn settings_raw(&self) -> serde_json::Value {
        self.mutable.read().await.settings_raw.clone()
    }

    pub async fn enabled(&self) -> bool {
        self.mutable.read().await.enabled
    }

    pub async fn replace_config(&self, title: Option<String>, settings_raw: serde_json::Value) {
        let mut guard = self.mutable.write().await;
        if let Some(title) = title {
            guard.title = title;
        }
        guard.settings_raw = settings_raw;
    }

    /// `true` iff `(reserveModelLoad ∨ usages ≥ maxUsages) ∧ status = RUNNING`
    /// (invariant 2).
    pub async fn in_use(&self) -> bool {
        (self.reserve_model_load() || self.usages() >= self.max_usages())
            && matches!(self.status().await, BackendStatus::Running)
    }

    /// Atomically increment `usages` if doing so keeps the invariants:
    /// `reserve_model_load` is clear, `reserved` is clear, status is
    /// `Running`, and `usages < max_usages`. Returns `true` on success.
    pub async fn try_acquire(&self, now_millis: i64) -> bool {
        if self.reserved() || self.reserve_model_load() {
            return false;
        }
        if !matches!(self.status().await, BackendStatus::Running) {
            return false;
        }
        loop {
            let current = self.usages.load(Ordering::SeqCst);
            if current >= self.max_usages() {
                return false;
            }
            if self
                .usages
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.touch_time_last_release(now_millis);
                return true;
            }
        }
    }

    /// Decrement `usages`, saturating at zero (double-release is a no-op per
    /// spec §4.5).
    pub fn release(&self, now_millis: i64) {
        let _ = self
            .usages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |u| {
                if u == 0 {
                    None
                } else {
                    Some(u - 1)
                }
            });
        self.touch_time_last_release(now_millis);
    }
}

impl std::fmt::Debug for BackendRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRecord")
            .field("id", &self.id)
            .field("usages", &self.usages())
            .field("max_usages", &self.max_usages())
            .field("reserved", &self.reserved())
            .field("reserve_model_load", &self.reserve_model_load())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverCapabilities, GenerateOutcome, InitError};
    use async_trait::async_trait;

    struct NullDriver;

    #[async_trait]
    impl BackendDriver for NullDriver {
        async fn init(&self) -> Result<DriverCapabilities, InitError> {
            Ok(DriverCapabilities::default())
        }
        async fn shutdown_now(&self) {}
        async fn load_model(&self, _model: &str) -> bool {
            true
        }
        async fn generate_live(
            &self,
            _input: serde_json::Value,
            _batch_id: u64,
            _on_event: &mut (dyn FnMut(crate::driver::GenerationEvent) + Send),
        ) -> Result<(), GenerateOutcome> {
            Ok(())
        }
        fn can_load_models(&self) -> bool {
            true
        }
    }

    fn test_record(id: i64) -> BackendRecord {
        let record = BackendRecord::new(
            BackendId(id),
            BackendTypeDescriptor {
                id: "test".into(),
                display_name: "Test".into(),
                settings_schema: vec![],
                fast_load: true,
            },
            Arc::new(NullDriver),
            "test".into(),
            serde_json::json!({}),
            true,
            0,
        );
        record
    }

    #[tokio::test]
    async fn usage_bound_respected() {
        let record = test_record(0);
        record.set_status(BackendStatus::Running).await;
        record.set_max_usages(1);
        assert!(record.try_acquire(1).await);
        assert!(!record.try_acquire(2).await, "second acquire must fail at max_usages");
        assert_eq!(record.usages(), 1);
        record.release(3);
        assert_eq!(record.usages(), 0);
        record.release(4);
        assert_eq!(record.usages(), 0, "double release is a no-op");
    }

    #[tokio::test]
    async fn reservation_blocks_acquisition() {
        let record = test_record(1);
        record.set_status(BackendStatus::Running).await;
        record.set_reserve_model_load(true);
        assert!(!record.try_acquire(1).await);
        record.set_reserve_model_load(false);
        assert!(record.try_acquire(2).await);
    }

    #[tokio::test]
    async fn disabled_or_not_running_refuses_acquisition() {
        let record = test_record(2);
        assert!(!record.try_acquire(1).await, "Waiting status is not acquirable");
    }
}
