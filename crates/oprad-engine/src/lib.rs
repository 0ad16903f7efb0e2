//! Discovery engine orchestration: the polling loop, per-record analysis
//! tasks and the observable state surface.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use oprad_core::{view, Opportunity, Profile, RunState, Source, ViewOptions};
use oprad_inference::{CollaboratorError, GeminiClient, GeminiConfig, DEFAULT_BASE_URL, DEFAULT_MODEL};
use oprad_storage::{FileKeyValueStore, KeyValueStore, StateStore};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

pub mod analysis;
pub mod discovery;
pub mod pipeline;

pub use analysis::{AnalysisManager, AnalysisOutcome};
pub use discovery::{DiscoveryController, IterationStats, LoopTiming};
pub use pipeline::{
    AnalysisPipeline, Analyzer, Discovery, InferenceContext, ProfileDraft, ProfileExtractor,
    SynthesisPipeline, Synthesizer,
};

pub const CRATE_NAME: &str = "oprad-engine";

pub const DEFAULT_DOMAIN_HINTS: &[&str] = &[
    "e-commerce operations",
    "B2B SaaS tooling",
    "creator economy",
    "local service businesses",
    "AI workflow automation",
    "developer tools",
];

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error("synthesis output did not match the opportunity shape: {0}")]
    SynthesisParse(String),
    #[error("spy report output did not match the expected shape: {0}")]
    ValuationParse(String),
    #[error("profile output did not match the expected shape: {0}")]
    ProfileParse(String),
    #[error("unknown opportunity `{0}`")]
    UnknownOpportunity(String),
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Revision counter bumped on every observable change.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: Arc<watch::Sender<u64>>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn bump(&self) {
        self.tx.send_modify(|revision| *revision = revision.wrapping_add(1));
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded, ordered progress log. Oldest entries drop first once full.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    entries: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
    notifier: Option<Notifier>,
}

impl ActivityLog {
    pub fn new(capacity: usize, notifier: Option<Notifier>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            notifier,
        }
    }

    pub fn push(&self, message: impl Into<String>) {
        let message = message.into();
        info!(target: "oprad::activity", "{message}");
        {
            let mut entries = lock(&self.entries);
            entries.push_back(message);
            while entries.len() > self.capacity {
                entries.pop_front();
            }
        }
        if let Some(notifier) = &self.notifier {
            notifier.bump();
        }
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.entries).iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub api_key: Option<String>,
    pub gemini_base_url: String,
    pub synthesis_model: String,
    pub research_model: String,
    pub data_dir: PathBuf,
    pub timing: LoopTiming,
    pub http_timeout: Option<Duration>,
    pub discovery_log_capacity: usize,
    pub analysis_log_capacity: usize,
    pub domain_hints: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            gemini_base_url: DEFAULT_BASE_URL.to_string(),
            synthesis_model: DEFAULT_MODEL.to_string(),
            research_model: DEFAULT_MODEL.to_string(),
            data_dir: PathBuf::from("./data"),
            timing: LoopTiming::default(),
            http_timeout: None,
            discovery_log_capacity: 200,
            analysis_log_capacity: 50,
            domain_hints: DEFAULT_DOMAIN_HINTS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let synthesis_model =
            std::env::var("OPRAD_MODEL").unwrap_or_else(|_| defaults.synthesis_model.clone());
        Self {
            api_key: std::env::var("GEMINI_API_KEY")
                .or_else(|_| std::env::var("API_KEY"))
                .ok()
                .filter(|key| !key.trim().is_empty()),
            gemini_base_url: std::env::var("OPRAD_GEMINI_BASE_URL")
                .unwrap_or(defaults.gemini_base_url),
            research_model: std::env::var("OPRAD_RESEARCH_MODEL")
                .unwrap_or_else(|_| synthesis_model.clone()),
            synthesis_model,
            data_dir: std::env::var("OPRAD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            timing: LoopTiming {
                iteration_delay: env_secs("OPRAD_ITERATION_DELAY_SECS")
                    .unwrap_or(defaults.timing.iteration_delay),
                retry_delay: env_secs("OPRAD_RETRY_DELAY_SECS")
                    .unwrap_or(defaults.timing.retry_delay),
            },
            http_timeout: env_secs("OPRAD_HTTP_TIMEOUT_SECS"),
            discovery_log_capacity: env_usize("OPRAD_DISCOVERY_LOG_CAP")
                .unwrap_or(defaults.discovery_log_capacity),
            analysis_log_capacity: env_usize("OPRAD_ANALYSIS_LOG_CAP")
                .unwrap_or(defaults.analysis_log_capacity),
            domain_hints: defaults.domain_hints,
        }
    }

    pub fn open_store(&self) -> Result<Arc<StateStore>> {
        let kv: Arc<dyn KeyValueStore> = Arc::new(FileKeyValueStore::open(&self.data_dir)?);
        Ok(Arc::new(StateStore::open(kv)))
    }

    pub fn inference_context(&self) -> Result<Arc<InferenceContext>> {
        let api_key = self
            .api_key
            .clone()
            .context("GEMINI_API_KEY (or API_KEY) must be set")?;
        let client = GeminiClient::new(GeminiConfig {
            base_url: self.gemini_base_url.clone(),
            timeout: self.http_timeout,
            ..GeminiConfig::new(api_key)
        })?;
        Ok(Arc::new(
            InferenceContext::new(Arc::new(client), self.synthesis_model.clone())
                .with_research_model(self.research_model.clone()),
        ))
    }
}

/// Load a profile from a `.json` file, or YAML otherwise.
pub fn load_profile_file(path: impl AsRef<Path>) -> Result<Profile> {
    let path = path.as_ref();
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    } else {
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Point-in-time copy of everything an observer may read.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub opportunities: Vec<Opportunity>,
    pub sources: Vec<Source>,
    pub run_state: RunState,
    pub discovery_log: Vec<String>,
    pub analysis_logs: BTreeMap<String, Vec<String>>,
    pub in_flight: Vec<String>,
    pub stats: IterationStats,
}

pub struct Engine {
    store: Arc<StateStore>,
    profile: Arc<RwLock<Profile>>,
    discovery: DiscoveryController,
    analysis: AnalysisManager,
    notifier: Notifier,
}

impl Engine {
    /// Wire the engine with the stock pipelines.
    pub fn new(
        config: &EngineConfig,
        store: Arc<StateStore>,
        ctx: Arc<InferenceContext>,
        profile: Profile,
    ) -> Self {
        let synthesizer = Arc::new(SynthesisPipeline::new(
            ctx.clone(),
            config.domain_hints.clone(),
        ));
        let analyzer = Arc::new(AnalysisPipeline::new(ctx));
        Self::with_pipelines(config, store, synthesizer, analyzer, profile)
    }

    pub fn with_pipelines(
        config: &EngineConfig,
        store: Arc<StateStore>,
        synthesizer: Arc<dyn Synthesizer>,
        analyzer: Arc<dyn Analyzer>,
        profile: Profile,
    ) -> Self {
        let notifier = Notifier::new();
        let profile = Arc::new(RwLock::new(profile));
        let discovery_log = ActivityLog::new(config.discovery_log_capacity, Some(notifier.clone()));
        let discovery = DiscoveryController::new(
            store.clone(),
            synthesizer,
            profile.clone(),
            discovery_log,
            config.timing,
        );
        let analysis = AnalysisManager::new(
            store.clone(),
            analyzer,
            config.analysis_log_capacity,
            notifier.clone(),
        );
        Self {
            store,
            profile,
            discovery,
            analysis,
            notifier,
        }
    }

    /// Build from environment-derived config: file-backed store, Gemini client.
    pub fn from_config(config: &EngineConfig, profile: Profile) -> Result<Self> {
        let store = config.open_store()?;
        let ctx = config.inference_context()?;
        Ok(Self::new(config, store, ctx, profile))
    }

    pub fn start(&self) -> bool {
        self.discovery.start()
    }

    pub fn stop(&self) -> bool {
        self.discovery.stop()
    }

    pub fn analyze(&self, id: &str) -> Option<JoinHandle<AnalysisOutcome>> {
        self.analysis.analyze(id)
    }

    pub fn run_state(&self) -> RunState {
        self.store.run_state()
    }

    /// Takes effect from the next discovery iteration.
    pub fn set_profile(&self, profile: Profile) {
        *self
            .profile
            .write()
            .unwrap_or_else(PoisonError::into_inner) = profile;
        self.notifier.bump();
    }

    pub fn profile(&self) -> Profile {
        self.profile
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Clear both collections and the logs of finished analyses.
    pub fn reset(&self) {
        self.store.reset();
        self.discovery.log().clear();
        self.analysis.clear_logs();
        self.notifier.bump();
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn ranked(&self, options: ViewOptions) -> Vec<Opportunity> {
        view(&self.store.opportunities(), options)
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notifier.subscribe()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            opportunities: self.store.opportunities(),
            sources: self.store.sources(),
            run_state: self.store.run_state(),
            discovery_log: self.discovery.log().entries(),
            analysis_logs: self.analysis.logs(),
            in_flight: self.analysis.in_flight(),
            stats: self.discovery.stats(),
        }
    }
}
