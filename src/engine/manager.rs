use super::{Device, EngineKind, Lifecycle};
use crate::config::ServerConfig;
use crate::imaging::{HttpImageExplainer, HttpImageGenerator, ImageExplainer, ImageGenerator};
use crate::llm::{ChatModel, OllamaClient};
use crate::speech::{HttpSynthesizer, Synthesizer, Transcriber, WhisperClient};
use crate::{ParleyError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Process-wide release behaviour shared by all slots
#[derive(Debug)]
pub struct ReleasePolicy {
    low_resource: AtomicBool,
    load_timeout: Duration,
}

impl ReleasePolicy {
    pub fn new(low_resource: bool, load_timeout: Duration) -> Self {
        Self {
            low_resource: AtomicBool::new(low_resource),
            load_timeout,
        }
    }

    pub fn low_resource(&self) -> bool {
        self.low_resource.load(Ordering::SeqCst)
    }

    pub fn set_low_resource(&self, enabled: bool) {
        self.low_resource.store(enabled, Ordering::SeqCst);
    }

    pub fn load_timeout(&self) -> Duration {
        self.load_timeout
    }

    fn unloads_on_release(&self, kind: EngineKind) -> bool {
        self.low_resource() && kind.unloads_under_low_resource()
    }
}

/// Read-only snapshot of one engine slot
#[derive(Clone, Debug, Serialize)]
pub struct EngineStatus {
    pub kind: EngineKind,
    pub name: Option<String>,
    pub enabled: bool,
    pub loaded: bool,
    pub loading: bool,
    pub device: Option<Device>,
    pub memory_estimate_mb: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub active_leases: usize,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct SlotState {
    loaded: bool,
    loading: bool,
    unloading: bool,
    memory_mb: u64,
    last_used: Option<DateTime<Utc>>,
    leases: usize,
    last_error: Option<String>,
}

/// Clears the `loading` flag even when the load future is dropped mid-way
struct LoadingFlag<'a>(&'a RwLock<SlotState>);

impl Drop for LoadingFlag<'_> {
    fn drop(&mut self) {
        self.0.write().loading = false;
    }
}

/// One lifecycle-managed engine.
///
/// Load and unload transitions are serialized by a per-slot async mutex; the
/// bookkeeping sits behind a sync lock that is never held across an await, so
/// [`EngineSlot::status`] can be called at any time, including mid-load.
pub struct EngineSlot<E: ?Sized + Lifecycle + 'static> {
    kind: EngineKind,
    engine: RwLock<Option<Arc<E>>>,
    transition: tokio::sync::Mutex<()>,
    state: RwLock<SlotState>,
    policy: Arc<ReleasePolicy>,
}

impl<E: ?Sized + Lifecycle + 'static> EngineSlot<E> {
    pub fn new(kind: EngineKind, engine: Option<Arc<E>>, policy: Arc<ReleasePolicy>) -> Self {
        Self {
            kind,
            engine: RwLock::new(engine),
            transition: tokio::sync::Mutex::new(()),
            state: RwLock::new(SlotState::default()),
            policy,
        }
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.engine.read().is_some()
    }

    /// The configured engine, without loading it or taking a lease. For
    /// metadata queries such as listing models or voices.
    pub fn engine(&self) -> Result<Arc<E>> {
        self.current()
    }

    fn current(&self) -> Result<Arc<E>> {
        self.engine.read().clone().ok_or_else(|| {
            ParleyError::EngineUnavailable(format!("{} engine is not configured", self.kind))
        })
    }

    /// Take a lease on the engine, loading it first if needed.
    ///
    /// Concurrent callers for an unloaded slot wait on the same transition lock,
    /// so only the first performs the load and the rest reuse it.
    pub async fn acquire(self: &Arc<Self>) -> Result<EngineLease<E>> {
        let engine = self.current()?;

        if self.try_lease_loaded() {
            return Ok(EngineLease::new(self.clone(), engine));
        }

        let _transition = self.transition.lock().await;
        // The engine may have been swapped or loaded while we waited
        let engine = self.current()?;
        if self.try_lease_loaded() {
            return Ok(EngineLease::new(self.clone(), engine));
        }

        self.load_locked(&engine).await?;
        self.state.write().leases += 1;
        Ok(EngineLease::new(self.clone(), engine))
    }

    fn try_lease_loaded(&self) -> bool {
        let mut state = self.state.write();
        if state.loaded && !state.unloading {
            state.leases += 1;
            true
        } else {
            false
        }
    }

    /// Caller must hold the transition lock.
    async fn load_locked(&self, engine: &Arc<E>) -> Result<()> {
        self.state.write().loading = true;
        let _flag = LoadingFlag(&self.state);

        let timeout = self.policy.load_timeout();
        info!("Loading {} engine '{}'", self.kind, engine.name());

        let result = match tokio::time::timeout(timeout, engine.load()).await {
            Ok(Ok(memory_mb)) => Ok(memory_mb),
            Ok(Err(e)) => Err(ParleyError::EngineLoadError(format!("{}: {}", self.kind, e))),
            Err(_) => Err(ParleyError::EngineLoadError(format!(
                "{}: load timed out after {}s",
                self.kind,
                timeout.as_secs()
            ))),
        };

        let mut state = self.state.write();
        match result {
            Ok(memory_mb) => {
                state.loaded = true;
                state.memory_mb = memory_mb;
                state.last_error = None;
                info!("{} engine loaded (~{} MB)", self.kind, memory_mb);
                Ok(())
            }
            Err(e) => {
                warn!("{}", e);
                state.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Load without taking a lease
    pub async fn preload(&self) -> Result<()> {
        let _transition = self.transition.lock().await;
        let engine = self.current()?;
        if self.state.read().loaded {
            return Ok(());
        }
        self.load_locked(&engine).await
    }

    /// Give back one lease.
    ///
    /// Under the low-resource policy the last lease on an image engine unloads it.
    pub async fn release(&self) {
        let should_unload = {
            let mut state = self.state.write();
            state.leases = state.leases.saturating_sub(1);
            state.last_used = Some(Utc::now());
            state.leases == 0 && state.loaded && self.policy.unloads_on_release(self.kind)
        };

        if should_unload {
            debug!("Low-resource policy: unloading {} after use", self.kind);
            self.unload_idle().await;
        }
    }

    /// Unload if no leases are outstanding. Returns whether the engine is now unloaded.
    async fn unload_idle(&self) -> bool {
        let _transition = self.transition.lock().await;
        {
            let mut state = self.state.write();
            if !state.loaded {
                return true;
            }
            if state.leases > 0 {
                debug!("{} still has {} lease(s), keeping it loaded", self.kind, state.leases);
                return false;
            }
            state.unloading = true;
        }

        let Ok(engine) = self.current() else {
            let mut state = self.state.write();
            state.unloading = false;
            state.loaded = false;
            return true;
        };

        let result = engine.unload().await;
        let mut state = self.state.write();
        state.unloading = false;
        match result {
            Ok(()) => {
                state.loaded = false;
                state.memory_mb = 0;
                info!("{} engine unloaded", self.kind);
                true
            }
            Err(e) => {
                // Stays loaded; the next release retries
                warn!("Failed to unload {} engine: {}", self.kind, e);
                state.last_error = Some(e.to_string());
                false
            }
        }
    }

    /// Explicit unload, ignoring the release policy
    pub async fn unload(&self) -> Result<bool> {
        self.current()?;
        Ok(self.unload_idle().await)
    }

    /// Swap the backing engine, unloading the old one when nobody holds it
    pub async fn replace(&self, engine: Arc<E>) {
        let _transition = self.transition.lock().await;
        let previous = self.engine.write().replace(engine);

        let (loaded, leases) = {
            let state = self.state.read();
            (state.loaded, state.leases)
        };
        if let Some(previous) = previous {
            if loaded && leases == 0 {
                if let Err(e) = previous.unload().await {
                    warn!("Failed to unload previous {} engine: {}", self.kind, e);
                }
            } else if loaded {
                warn!(
                    "Replacing {} engine while {} lease(s) are active; leaving it loaded",
                    self.kind, leases
                );
            }
        }

        let mut state = self.state.write();
        state.loaded = false;
        state.memory_mb = 0;
        state.last_error = None;
    }

    /// Non-blocking snapshot
    pub fn status(&self) -> EngineStatus {
        let engine = self.engine.read().clone();
        let state = self.state.read();
        EngineStatus {
            kind: self.kind,
            name: engine.as_ref().map(|e| e.name()),
            enabled: engine.is_some(),
            loaded: state.loaded,
            loading: state.loading,
            device: engine.as_ref().map(|e| e.device()),
            memory_estimate_mb: state.memory_mb,
            last_used: state.last_used,
            active_leases: state.leases,
            last_error: state.last_error.clone(),
        }
    }
}

/// A borrowed engine. Hand it back with [`EngineLease::release`]; a lease that is
/// dropped instead is released on a background task.
pub struct EngineLease<E: ?Sized + Lifecycle + 'static> {
    slot: Arc<EngineSlot<E>>,
    engine: Arc<E>,
    released: bool,
}

impl<E: ?Sized + Lifecycle + 'static> EngineLease<E> {
    fn new(slot: Arc<EngineSlot<E>>, engine: Arc<E>) -> Self {
        Self {
            slot,
            engine,
            released: false,
        }
    }

    pub fn kind(&self) -> EngineKind {
        self.slot.kind
    }

    pub async fn release(mut self) {
        self.released = true;
        let slot = self.slot.clone();
        drop(self);
        slot.release().await;
    }
}

impl<E: ?Sized + Lifecycle + 'static> Deref for EngineLease<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.engine
    }
}

impl<E: ?Sized + Lifecycle + 'static> Drop for EngineLease<E> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let slot = self.slot.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { slot.release().await });
            }
            Err(_) => {
                let mut state = slot.state.write();
                state.leases = state.leases.saturating_sub(1);
                state.last_used = Some(Utc::now());
            }
        }
    }
}

/// The concrete engines the manager is built from
pub struct EngineSet {
    pub stt: Arc<dyn Transcriber>,
    /// Named TTS variants; the first is used unless `default_tts` names another
    pub tts: Vec<(String, Arc<dyn Synthesizer>)>,
    pub default_tts: Option<String>,
    pub llm: Arc<dyn ChatModel>,
    pub image_generator: Option<Arc<dyn ImageGenerator>>,
    pub image_explainer: Option<Arc<dyn ImageExplainer>>,
}

impl EngineSet {
    /// HTTP clients for every configured service
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let stt: Arc<dyn Transcriber> = Arc::new(WhisperClient::new(&config.stt)?);
        let llm: Arc<dyn ChatModel> = Arc::new(OllamaClient::new(&config.llm)?);

        let mut tts = Vec::with_capacity(config.tts.engines.len());
        for variant in &config.tts.engines {
            let engine: Arc<dyn Synthesizer> =
                Arc::new(HttpSynthesizer::new(variant, config.output_sample_rate)?);
            tts.push((variant.name.clone(), engine));
        }

        let image_generator: Option<Arc<dyn ImageGenerator>> = if config.image_generator.enabled {
            Some(Arc::new(HttpImageGenerator::new(&config.image_generator)?))
        } else {
            None
        };
        let image_explainer: Option<Arc<dyn ImageExplainer>> = if config.image_explainer.enabled {
            Some(Arc::new(HttpImageExplainer::new(&config.image_explainer)?))
        } else {
            None
        };

        Ok(Self {
            stt,
            tts,
            default_tts: Some(config.tts.default_engine.clone()),
            llm,
            image_generator,
            image_explainer,
        })
    }
}

/// Owns one slot per engine kind
pub struct EngineManager {
    policy: Arc<ReleasePolicy>,
    stt: Arc<EngineSlot<dyn Transcriber>>,
    tts: Arc<EngineSlot<dyn Synthesizer>>,
    llm: Arc<EngineSlot<dyn ChatModel>>,
    image_generator: Arc<EngineSlot<dyn ImageGenerator>>,
    image_explainer: Arc<EngineSlot<dyn ImageExplainer>>,
    tts_variants: BTreeMap<String, Arc<dyn Synthesizer>>,
    active_tts: RwLock<String>,
}

impl EngineManager {
    pub fn new(engines: EngineSet, policy: ReleasePolicy) -> Result<Self> {
        let policy = Arc::new(policy);

        let (first_name, _) = engines.tts.first().ok_or_else(|| {
            ParleyError::ConfigError("At least one TTS engine must be provided".into())
        })?;
        let active_name = engines.default_tts.clone().unwrap_or_else(|| first_name.clone());

        let tts_variants: BTreeMap<String, Arc<dyn Synthesizer>> = engines
            .tts
            .into_iter()
            .map(|(name, engine)| (name.to_ascii_lowercase(), engine))
            .collect();
        let active_name = active_name.to_ascii_lowercase();
        let active_tts = tts_variants.get(&active_name).cloned().ok_or_else(|| {
            ParleyError::ConfigError(format!("TTS engine '{}' is not configured", active_name))
        })?;

        info!(
            "Engine manager ready (low-resource: {}, load timeout: {}s)",
            policy.low_resource(),
            policy.load_timeout().as_secs()
        );

        Ok(Self {
            stt: Arc::new(EngineSlot::new(EngineKind::Stt, Some(engines.stt), policy.clone())),
            tts: Arc::new(EngineSlot::new(EngineKind::Tts, Some(active_tts), policy.clone())),
            llm: Arc::new(EngineSlot::new(EngineKind::Llm, Some(engines.llm), policy.clone())),
            image_generator: Arc::new(EngineSlot::new(
                EngineKind::ImageGenerator,
                engines.image_generator,
                policy.clone(),
            )),
            image_explainer: Arc::new(EngineSlot::new(
                EngineKind::ImageExplainer,
                engines.image_explainer,
                policy.clone(),
            )),
            policy,
            tts_variants,
            active_tts: RwLock::new(active_name),
        })
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let policy = ReleasePolicy::new(config.low_resource_mode, config.engine_load_timeout());
        Self::new(EngineSet::from_config(config)?, policy)
    }

    pub fn policy(&self) -> &ReleasePolicy {
        &self.policy
    }

    pub fn stt(&self) -> &Arc<EngineSlot<dyn Transcriber>> {
        &self.stt
    }

    pub fn tts(&self) -> &Arc<EngineSlot<dyn Synthesizer>> {
        &self.tts
    }

    pub fn llm(&self) -> &Arc<EngineSlot<dyn ChatModel>> {
        &self.llm
    }

    pub fn image_generator(&self) -> &Arc<EngineSlot<dyn ImageGenerator>> {
        &self.image_generator
    }

    pub fn image_explainer(&self) -> &Arc<EngineSlot<dyn ImageExplainer>> {
        &self.image_explainer
    }

    pub fn image_generation_available(&self) -> bool {
        self.image_generator.is_enabled()
    }

    pub fn status(&self, kind: EngineKind) -> EngineStatus {
        match kind {
            EngineKind::Stt => self.stt.status(),
            EngineKind::Tts => self.tts.status(),
            EngineKind::Llm => self.llm.status(),
            EngineKind::ImageGenerator => self.image_generator.status(),
            EngineKind::ImageExplainer => self.image_explainer.status(),
        }
    }

    pub fn snapshot(&self) -> Vec<EngineStatus> {
        EngineKind::ALL.iter().map(|kind| self.status(*kind)).collect()
    }

    pub async fn preload(&self, kind: EngineKind) -> Result<()> {
        match kind {
            EngineKind::Stt => self.stt.preload().await,
            EngineKind::Tts => self.tts.preload().await,
            EngineKind::Llm => self.llm.preload().await,
            EngineKind::ImageGenerator => self.image_generator.preload().await,
            EngineKind::ImageExplainer => self.image_explainer.preload().await,
        }
    }

    /// Returns false when the engine is still leased and was left loaded
    pub async fn unload(&self, kind: EngineKind) -> Result<bool> {
        match kind {
            EngineKind::Stt => self.stt.unload().await,
            EngineKind::Tts => self.tts.unload().await,
            EngineKind::Llm => self.llm.unload().await,
            EngineKind::ImageGenerator => self.image_generator.unload().await,
            EngineKind::ImageExplainer => self.image_explainer.unload().await,
        }
    }

    pub fn tts_engine_names(&self) -> Vec<String> {
        self.tts_variants.keys().cloned().collect()
    }

    pub fn active_tts_engine(&self) -> String {
        self.active_tts.read().clone()
    }

    /// Switch the TTS slot to another configured variant
    pub async fn switch_tts(&self, name: &str) -> Result<String> {
        let key = name.to_ascii_lowercase();
        let engine = self.tts_variants.get(&key).cloned().ok_or_else(|| {
            ParleyError::ConfigError(format!("Unknown TTS engine: {}", name))
        })?;

        if *self.active_tts.read() == key {
            return Ok(key);
        }

        self.tts.replace(engine).await;
        *self.active_tts.write() = key.clone();
        info!("Switched TTS engine to {}", key);
        Ok(key)
    }

    /// Unload everything at shutdown
    pub async fn shutdown(&self) {
        for kind in EngineKind::ALL {
            match self.unload(kind).await {
                Ok(true) | Err(ParleyError::EngineUnavailable(_)) => {}
                Ok(false) => warn!("{} engine still in use at shutdown", kind),
                Err(e) => warn!("Failed to unload {} at shutdown: {}", kind, e),
            }
        }
    }
}
