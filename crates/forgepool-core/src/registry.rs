use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use forgepool_types::{BackendId, BackendStatus, BackendTypeDescriptor, RuntimeError};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};

use crate::clock::now_millis;
use crate::driver::BackendDriver;
use crate::record::BackendRecord;
use crate::wake::Waker;

/// Produces a driver instance for one backend type from user-supplied
/// settings. The registry holds one factory per registered type, the way
/// the teacher's engine modules each expose a constructor for their backend
/// (`engine::ggml::diffusion::backend`, `engine::ggml::llama::backend`).
pub trait BackendFactory: Send + Sync {
    fn descriptor(&self) -> BackendTypeDescriptor;
    fn create(&self, settings: &serde_json::Value) -> Arc<dyn BackendDriver>;
}

/// On-disk shape of one entry in the persisted registry file (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedBackend {
    #[serde(rename = "type")]
    pub type_id: String,
    pub title: String,
    pub enabled: bool,
    pub settings: serde_json::Value,
}

/// Tunables that don't belong in the env-coupled server config (spec §4.3,
/// §4.4, §5); kept plain so `forgepool-core` stays usable as a library
/// independent of how a binary wires up its environment.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_backend_init_attempts: u32,
    pub max_timeout_minutes: u64,
    pub per_request_timeout_minutes: u64,
    /// Switchable per Design Notes Open Question #2: fail every open request
    /// on registry-wide stagnation (`true`, the literal spec §4.4 behavior)
    /// or only requests whose individual deadline has passed (`false`).
    pub fail_all_on_stagnation: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_backend_init_attempts: 5,
            max_timeout_minutes: 10,
            per_request_timeout_minutes: 5,
            fail_all_on_stagnation: true,
        }
    }
}

/// Owns the set of backend records; assigns IDs; persists/restores
/// configuration; broadcasts refresh events (spec §4.2).
pub struct BackendRegistry {
    records: DashMap<BackendId, Arc<BackendRecord>>,
    factories: DashMap<String, Arc<dyn BackendFactory>>,
    next_real_id: AtomicI64,
    next_nonreal_id: AtomicI64,
    save_lock: Mutex<()>,
    config_path: Mutex<Option<PathBuf>>,
    shutting_down: AtomicBool,
    pub config: RegistryConfig,

    init_tx: mpsc::UnboundedSender<BackendId>,
    init_rx: Mutex<Option<mpsc::UnboundedReceiver<BackendId>>>,

    model_refresh_tx: watch::Sender<u64>,
    pub(crate) waker: Waker,
}

impl BackendRegistry {
    /// `waker` is shared with the [`crate::scheduler::SchedulerLoop`] that
    /// will run against this registry, so that record/init state changes
    /// wake the scheduler's tick loop promptly (spec §4.4 step 4). Use
    /// [`crate::wake::Waker::new`] to create a `(Waker, WakeListener)` pair
    /// and hand the listener to `SchedulerLoop::spawn`.
    pub fn new(config: RegistryConfig, waker: Waker) -> Arc<Self> {
        let (init_tx, init_rx) = mpsc::unbounded_channel();
        let (model_refresh_tx, _) = watch::channel(0);
        Arc::new(Self {
            records: DashMap::new(),
            factories: DashMap::new(),
            next_real_id: AtomicI64::new(0),
            next_nonreal_id: AtomicI64::new(-1),
            save_lock: Mutex::new(()),
            config_path: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            config,
            init_tx,
            init_rx: Mutex::new(Some(init_rx)),
            model_refresh_tx,
            waker,
        })
    }

    pub fn register_type(&self, factory: Arc<dyn BackendFactory>) {
        self.factories.insert(factory.descriptor().id, factory);
    }

    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    pub fn subscribe_model_refresh(&self) -> watch::Receiver<u64> {
        self.model_refresh_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn get(&self, id: BackendId) -> Option<Arc<BackendRecord>> {
        self.records.get(&id).map(|r| r.clone())
    }

    pub fn all(&self) -> Vec<Arc<BackendRecord>> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    /// Snapshot of records whose driver is `type_id`, `status = RUNNING`, and
    /// `reserved = false` (spec §4.2 `runningBackendsOf`).
    pub async fn running_backends_of(&self, type_id: &str) -> Vec<Arc<BackendRecord>> {
        let mut out = Vec::new();
        for r in self.records.iter() {
            let record = r.value().clone();
            if record.back_type.id == type_id
                && !record.reserved()
                && matches!(record.status().await, BackendStatus::Running)
            {
                out.push(record);
            }
        }
        out
    }

    /// Model name → ids of every backend currently resident with it.
    /// Recomputed on demand, never cached, per spec §5 "derivable state".
    pub async fn loaded_models(&self) -> HashMap<String, Vec<BackendId>> {
        let mut out: HashMap<String, Vec<BackendId>> = HashMap::new();
        for r in self.records.iter() {
            let record = r.value().clone();
            if let Some(model) = record.current_model_name().await {
                out.entry(model).or_default().push(record.id);
            }
        }
        out
    }

    fn factory_for(&self, type_id: &str) -> Result<Arc<dyn BackendFactory>, RuntimeError> {
        self.factories
            .get(type_id)
            .map(|f| f.clone())
            .ok_or_else(|| RuntimeError::ConfigRefused {
                backend_id: BackendId(-1),
                message: format!("unknown backend type {type_id}"),
            })
    }

    fn insert_record(
        &self,
        id: BackendId,
        type_id: &str,
        title: String,
        settings: serde_json::Value,
        enabled: bool,
    ) -> Result<Arc<BackendRecord>, RuntimeError> {
        let factory = self.factory_for(type_id)?;
        let descriptor = factory.descriptor();
        let driver = factory.create(&settings);
        let record = Arc::new(BackendRecord::new(
            id,
            descriptor,
            driver,
            title,
            settings,
            enabled,
            now_millis(),
        ));
        self.records.insert(id, record.clone());
        Ok(record)
    }

    /// `add(type, config) -> Record` (spec §4.2): assign fresh id, create
    /// record WAITING, enqueue initialization, mark config dirty.
    pub async fn add(
        &self,
        type_id: &str,
        title: String,
        settings: serde_json::Value,
        enabled: bool,
    ) -> Result<Arc<BackendRecord>, RuntimeError> {
        let id = BackendId(self.next_real_id.fetch_add(1, Ordering::SeqCst));
        let record = self.insert_record(id, type_id, title, settings, enabled)?;
        self.enqueue_init(record.clone());
        self.save_best_effort().await;
        Ok(record)
    }

    /// `addNonreal(type, config) -> Record` (spec §4.2): negative id, never
    /// persisted.
    pub async fn add_nonreal(
        &self,
        type_id: &str,
        title: String,
        settings: serde_json::Value,
    ) -> Result<Arc<BackendRecord>, RuntimeError> {
        let id = BackendId(self.next_nonreal_id.fetch_sub(1, Ordering::SeqCst));
        let record = self.insert_record(id, type_id, title, settings, true)?;
        self.enqueue_init(record.clone());
        Ok(record)
    }

    /// A real, reachable cancellation escape hatch for [`Self::clean_shutdown`]:
    /// fires after `max_timeout_minutes` so a backend stuck mid-generation
    /// can't wedge a delete/edit/reload/shutdown call forever (spec §4.2
    /// "Clean-shutdown", §5 "waiting for usages -> 0 with a cancellation
    /// escape hatch").
    fn drain_timeout(&self) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        let timeout = Duration::from_secs(self.config.max_timeout_minutes * 60);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(true);
        });
        rx
    }

    /// Set `reserved = true`, wait until `usages = 0` (or cancellation), then
    /// call `shutdownNow()` (spec §4.2 "Clean-shutdown").
    async fn clean_shutdown(&self, record: &Arc<BackendRecord>, cancel: &mut watch::Receiver<bool>) {
        record.set_reserved(true);
        loop {
            if record.usages() == 0 {
                break;
            }
            if *cancel.borrow() {
                warn!(backend_id = %record.id, "clean shutdown cancelled while draining");
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                _ = cancel.changed() => {}
            }
        }
        record.driver.shutdown_now().await;
    }

    /// `deleteById(id) -> bool` (spec §4.2): shut down cleanly then remove.
    pub async fn delete_by_id(&self, id: BackendId) -> Result<bool, RuntimeError> {
        let record = match self.get(id) {
            Some(r) => r,
            None => return Ok(false),
        };
        let mut cancel = self.drain_timeout();
        self.clean_shutdown(&record, &mut cancel).await;
        self.records.remove(&id);
        self.save_best_effort().await;
        self.waker.wake();
        Ok(true)
    }

    /// `editById(id, newConfig, title?) -> Record` (spec §4.2): shut down
    /// cleanly, replace settings, bump `modCount`, re-enqueue init.
    pub async fn edit_by_id(
        &self,
        id: BackendId,
        new_settings: serde_json::Value,
        title: Option<String>,
    ) -> Result<Arc<BackendRecord>, RuntimeError> {
        let record = self.get(id).ok_or(RuntimeError::BackendNotFound(id))?;
        let mut cancel = self.drain_timeout();
        self.clean_shutdown(&record, &mut cancel).await;
        record.replace_config(title, new_settings).await;
        record.bump_mod_count();
        record.set_reserved(false);
        self.enqueue_init(record.clone());
        self.save_best_effort().await;
        Ok(record)
    }

    /// `reloadAll()` (spec §4.2): sequence clean-shutdown + re-init for
    /// every record.
    pub async fn reload_all(&self) {
        let ids: Vec<BackendId> = self.records.iter().map(|r| *r.key()).collect();
        for id in ids {
            if let Some(record) = self.get(id) {
                let mut cancel = self.drain_timeout();
                self.clean_shutdown(&record, &mut cancel).await;
                record.set_reserved(false);
                self.enqueue_init(record.clone());
            }
        }
    }

    /// Cooperative teardown of the whole registry: reserve and drain every
    /// record. Idempotent (Testable Properties, "Idempotent shutdown").
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let ids: Vec<BackendId> = self.records.iter().map(|r| *r.key()).collect();
        for id in ids {
            if let Some(record) = self.get(id) {
                let mut cancel = self.drain_timeout();
                self.clean_shutdown(&record, &mut cancel).await;
            }
        }
        self.waker.wake();
    }

    fn enqueue_init(&self, record: Arc<BackendRecord>) {
        if record.back_type.fast_load {
            // Fast-load backends bypass the queue and initialize inline on
            // the adding thread (spec §4.3 "canLoadFast").
            let registry_waker = self.waker.clone();
            let model_refresh_tx = self.model_refresh_tx.clone();
            let max_attempts = self.config.max_backend_init_attempts;
            tokio::spawn(async move {
                run_init_attempt(record, max_attempts, &registry_waker, &model_refresh_tx).await;
            });
        } else {
            let _ = self.init_tx.send(record.id);
        }
    }

    /// Background task that drains the init queue, retrying with bounded
    /// attempts (spec §4.3). Spawned once by the owning binary after
    /// `Arc<BackendRegistry>` is constructed.
    pub fn spawn_init_worker(self: &Arc<Self>) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut rx = registry
                .init_rx
                .lock()
                .await
                .take()
                .expect("init worker spawned more than once");
            loop {
                tokio::select! {
                    maybe_id = rx.recv() => {
                        match maybe_id {
                            Some(id) => {
                                if let Some(record) = registry.get(id) {
                                    run_init_attempt(
                                        record,
                                        registry.config.max_backend_init_attempts,
                                        &registry.waker,
                                        &registry.model_refresh_tx,
                                    )
                                    .await;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                }
            }
        });
    }

    /// `load()` (spec §4.2): read persisted configuration; create a record
    /// per entry with ids reserved so the next fresh id exceeds the maximum
    /// loaded id.
    pub async fn load(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        *self.config_path.lock().await = Some(path.to_path_buf());
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no persisted registry file, starting empty");
                return;
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to read registry file, starting empty");
                return;
            }
        };

        let parsed: HashMap<String, PersistedBackend> = match toml::from_str(&contents) {
            Ok(p) => p,
            Err(e) => {
                // Parse failure: file is left in place, registry starts
                // empty (spec §6).
                error!(path = %path.display(), error = %e, "failed to parse registry file, leaving it untouched");
                return;
            }
        };

        let mut max_id: i64 = -1;
        for (key, entry) in parsed {
            let id_num: i64 = match key.parse() {
                Ok(n) => n,
                Err(_) => {
                    warn!(key = %key, "skipping non-numeric registry key");
                    continue;
                }
            };
            if !self.factories.contains_key(&entry.type_id) {
                warn!(type_id = %entry.type_id, id = id_num, "skipping unknown backend type");
                continue;
            }
            let id = BackendId(id_num);
            max_id = max_id.max(id_num);
            match self.insert_record(id, &entry.type_id, entry.title, entry.settings, entry.enabled) {
                Ok(record) => self.enqueue_init(record),
                Err(e) => warn!(id = id_num, error = %e, "failed to construct backend from persisted entry"),
            }
        }
        self.next_real_id.store(max_id + 1, Ordering::SeqCst);
    }

    /// `save()` (spec §4.2): persist only real records, serialized keyed by
    /// id, writes serialized under the save lock.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), RuntimeError> {
        let _guard = self.save_lock.lock().await;
        let mut out: HashMap<String, PersistedBackend> = HashMap::new();
        for r in self.records.iter() {
            let record = r.value();
            if !record.id.is_real() {
                continue;
            }
            out.insert(
                record.id.to_string(),
                PersistedBackend {
                    type_id: record.back_type.id.clone(),
                    title: record.title().await,
                    enabled: record.enabled().await,
                    settings: record.settings_raw().await,
                },
            );
        }
        let rendered = toml::to_string_pretty(&out).map_err(|e| RuntimeError::RegistryFileWrite {
            path: path.as_ref().display().to_string(),
            message: e.to_string(),
        })?;
        tokio::fs::write(path.as_ref(), rendered)
            .await
            .map_err(|e| RuntimeError::RegistryFileWrite {
                path: path.as_ref().display().to_string(),
                message: e.to_string(),
            })
    }

    async fn save_best_effort(&self) {
        let path = self.config_path.lock().await.clone();
        if let Some(path) = path {
            if let Err(e) = self.save(&path).await {
                error!(error = %e, "failed to persist registry file");
            }
        }
    }
}

async fn run_init_attempt(
    record: Arc<BackendRecord>,
    max_attempts: u32,
    waker: &Waker,
    model_refresh_tx: &watch::Sender<u64>,
) {
    if !record.enabled().await {
        record.set_status(BackendStatus::Disabled).await;
        return;
    }
    loop {
        record.set_status(BackendStatus::Loading).await;
        let attempt = record.bump_init_attempts();
        match record.driver.init().await {
            Ok(caps) => {
                record.set_max_usages(caps.max_usages.max(1));
                record.set_status(BackendStatus::Running).await;
                info!(backend_id = %record.id, "backend initialized");
                model_refresh_tx.send_modify(|n| *n = n.wrapping_add(1));
                waker.wake();
                return;
            }
            Err(crate::driver::InitError::Refused(message)) => {
                error!(backend_id = %record.id, %message, "backend configuration refused");
                record.set_status(BackendStatus::Errored).await;
                waker.wake();
                return;
            }
            Err(crate::driver::InitError::Transient(message)) => {
                if attempt < max_attempts {
                    warn!(backend_id = %record.id, attempt, %message, "transient init failure, retrying");
                    record.set_status(BackendStatus::Waiting).await;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                let hint = translate_init_failure(&message);
                error!(backend_id = %record.id, attempt, hint, "backend init exhausted retries");
                record.set_status(BackendStatus::Errored).await;
                waker.wake();
                return;
            }
        }
    }
}

/// Unwrap aggregate errors to their innermost cause and translate common
/// low-level failures into a user-friendly hint (spec §4.3 step 5).
fn translate_init_failure(message: &str) -> String {
    if message.to_lowercase().contains("connection refused") {
        "the backend process does not appear to be listening; check that it started correctly"
            .to_string()
    } else {
        message.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverCapabilities, GenerateOutcome, InitError};
    use async_trait::async_trait;

    struct EchoDriver {
        fail_times: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl BackendDriver for EchoDriver {
        async fn init(&self) -> Result<DriverCapabilities, InitError> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(InitError::Transient("not ready".into()));
            }
            Ok(DriverCapabilities {
                can_load_models: true,
                max_usages: 1,
                ..Default::default()
            })
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

    struct EchoFactory {
        fail_times: u32,
    }

    impl BackendFactory for EchoFactory {
        fn descriptor(&self) -> BackendTypeDescriptor {
            BackendTypeDescriptor {
                id: "echo".into(),
                display_name: "Echo".into(),
                settings_schema: vec![],
                fast_load: false,
            }
        }
        fn create(&self, _settings: &serde_json::Value) -> Arc<dyn BackendDriver> {
            Arc::new(EchoDriver {
                fail_times: std::sync::atomic::AtomicU32::new(self.fail_times),
            })
        }
    }

    #[tokio::test]
    async fn add_enqueues_init_and_reaches_running() {
        let registry = BackendRegistry::new(RegistryConfig::default(), Waker::new().0);
        registry.register_type(Arc::new(EchoFactory { fail_times: 0 }));
        registry.spawn_init_worker();
        let record = registry
            .add("echo", "t1".into(), serde_json::json!({}), true)
            .await
            .unwrap();

        for _ in 0..50 {
            if matches!(record.status().await, BackendStatus::Running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(matches!(record.status().await, BackendStatus::Running));
    }

    #[tokio::test]
    async fn unknown_type_is_refused() {
        let registry = BackendRegistry::new(RegistryConfig::default(), Waker::new().0);
        let err = registry
            .add("nope", "t1".into(), serde_json::json!({}), true)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ConfigRefused { .. }));
    }

    #[tokio::test]
    async fn nonreal_ids_are_negative_and_excluded_from_save() {
        let registry = BackendRegistry::new(RegistryConfig::default(), Waker::new().0);
        registry.register_type(Arc::new(EchoFactory { fail_times: 0 }));
        let record = registry
            .add_nonreal("echo", "ephemeral".into(), serde_json::json!({}))
            .await
            .unwrap();
        assert!(!record.id.is_real());

        let dir = std::env::temp_dir().join(format!("forgepool-test-{}", now_millis()));
        registry.save(&dir).await.unwrap();
        let contents = tokio::fs::read_to_string(&dir).await.unwrap();
        assert!(!contents.contains("ephemeral"));
        let _ = tokio::fs::remove_file(&dir).await;
    }
}
