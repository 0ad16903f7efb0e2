//! Durable key-value persistence and the write-through state store.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use oprad_core::{Opportunity, Profile, RunState, Source, SpyReport};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "oprad-storage";

pub const OPPORTUNITIES_KEY: &str = "discovered_opportunities";
pub const SOURCES_KEY: &str = "discovered_sources";
pub const PROFILE_KEY: &str = "user_profile";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error on key `{key}`: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding value for key `{key}`: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid key `{0}`")]
    InvalidKey(String),
}

/// Synchronous byte store scoped to the running client.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError>;
}

/// One file per key under a data directory.
///
/// Reads and writes use blocking `std::fs` calls and run on the caller's
/// thread, inside the state store's lock when called from it. Values are a
/// few kilobytes of JSON, so each call is short; the temp file is not
/// fsynced before the rename.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    root: PathBuf,
}

impl FileKeyValueStore {
    pub fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating data directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, PersistenceError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(PersistenceError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(format!("{key}.json")))
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PersistenceError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    /// Replaces the value atomically: write a temp file next to the target and
    /// rename it over.
    fn set(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError> {
        let path = self.path_for(key)?;
        let io_err = |source| PersistenceError::Io {
            key: key.to_string(),
            source,
        };

        let temp_path = self
            .root
            .join(format!(".{key}.{}.tmp", Uuid::new_v4().simple()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .map_err(io_err)?;
        let written = file.write_all(value);
        drop(file);

        if let Err(err) = written.and_then(|_| fs::rename(&temp_path, &path)) {
            let _ = fs::remove_file(&temp_path);
            return Err(io_err(err));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed raw bytes, bypassing any encoding.
    pub fn with_entry(self, key: &str, value: impl Into<Vec<u8>>) -> Self {
        lock(&self.entries).insert(key.to_string(), value.into());
        self
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError> {
        lock(&self.entries).insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What happened to each collection while loading persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadReport {
    pub opportunities: LoadStatus,
    pub sources: LoadStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadStatus {
    #[default]
    Missing,
    Loaded(usize),
    /// Stored bytes were unreadable or unparseable and were ignored.
    Discarded,
}

#[derive(Debug, Default)]
struct Collections {
    opportunities: Vec<Opportunity>,
    sources: Vec<Source>,
    run_state: RunState,
}

/// Ordered opportunity and source collections, newest first, written through
/// to the key-value store on every mutation.
pub struct StateStore {
    kv: Arc<dyn KeyValueStore>,
    state: Mutex<Collections>,
    load_report: LoadReport,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("load_report", &self.load_report)
            .finish()
    }
}

impl StateStore {
    /// Reload both collections. Each one loads or fails on its own; run state
    /// always starts idle.
    pub fn open(kv: Arc<dyn KeyValueStore>) -> Self {
        let (opportunities, opportunities_status) =
            load_collection::<Opportunity>(kv.as_ref(), OPPORTUNITIES_KEY);
        let (sources, sources_status) = load_collection::<Source>(kv.as_ref(), SOURCES_KEY);
        Self {
            kv,
            state: Mutex::new(Collections {
                opportunities,
                sources,
                run_state: RunState::Idle,
            }),
            load_report: LoadReport {
                opportunities: opportunities_status,
                sources: sources_status,
            },
        }
    }

    pub fn load_report(&self) -> LoadReport {
        self.load_report
    }

    pub fn opportunities(&self) -> Vec<Opportunity> {
        lock(&self.state).opportunities.clone()
    }

    pub fn sources(&self) -> Vec<Source> {
        lock(&self.state).sources.clone()
    }

    pub fn titles(&self) -> Vec<String> {
        lock(&self.state)
            .opportunities
            .iter()
            .map(|opportunity| opportunity.title.clone())
            .collect()
    }

    pub fn opportunity(&self, id: &str) -> Option<Opportunity> {
        lock(&self.state)
            .opportunities
            .iter()
            .find(|opportunity| opportunity.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).opportunities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn run_state(&self) -> RunState {
        lock(&self.state).run_state
    }

    pub fn set_run_state(&self, run_state: RunState) {
        lock(&self.state).run_state = run_state;
    }

    pub fn prepend_opportunity(&self, opportunity: Opportunity) {
        let mut state = lock(&self.state);
        state.opportunities.insert(0, opportunity);
        self.persist(OPPORTUNITIES_KEY, &state.opportunities);
    }

    /// Returns false when a source with the same uri is already stored.
    pub fn prepend_source(&self, source: Source) -> bool {
        let mut state = lock(&self.state);
        if state.sources.iter().any(|existing| existing.uri == source.uri) {
            return false;
        }
        state.sources.insert(0, source);
        self.persist(SOURCES_KEY, &state.sources);
        true
    }

    /// Replace the spy report on the matching record, leaving every other
    /// field and the collection order alone. Returns false for an unknown id.
    pub fn attach_spy_report(&self, id: &str, report: SpyReport) -> bool {
        let mut state = lock(&self.state);
        let Some(target) = state
            .opportunities
            .iter_mut()
            .find(|opportunity| opportunity.id == id)
        else {
            return false;
        };
        target.spy_report = Some(report);
        self.persist(OPPORTUNITIES_KEY, &state.opportunities);
        true
    }

    /// Clear both collections.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        state.opportunities.clear();
        state.sources.clear();
        self.persist(OPPORTUNITIES_KEY, &state.opportunities);
        self.persist(SOURCES_KEY, &state.sources);
    }

    pub fn load_profile(&self) -> Option<Profile> {
        let bytes = match self.kv.get(PROFILE_KEY) {
            Ok(bytes) => bytes?,
            Err(err) => {
                warn!(key = PROFILE_KEY, error = %err, "reading saved profile failed");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(profile) => Some(profile),
            Err(err) => {
                warn!(key = PROFILE_KEY, error = %err, "ignoring invalid saved profile");
                None
            }
        }
    }

    pub fn save_profile(&self, profile: &Profile) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec(profile).map_err(|source| PersistenceError::Encode {
            key: PROFILE_KEY.to_string(),
            source,
        })?;
        self.kv.set(PROFILE_KEY, &bytes)
    }

    /// Failed writes are logged; the in-memory state stays authoritative.
    fn persist<T: Serialize>(&self, key: &str, items: &[T]) {
        let result = serde_json::to_vec(items)
            .map_err(|source| PersistenceError::Encode {
                key: key.to_string(),
                source,
            })
            .and_then(|bytes| self.kv.set(key, &bytes));
        match result {
            Ok(()) => debug!(key, items = items.len(), "persisted collection"),
            Err(err) => warn!(key, error = %err, "persisting collection failed"),
        }
    }
}

fn load_collection<T: DeserializeOwned>(kv: &dyn KeyValueStore, key: &str) -> (Vec<T>, LoadStatus) {
    let bytes = match kv.get(key) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return (Vec::new(), LoadStatus::Missing),
        Err(err) => {
            warn!(key, error = %err, "reading persisted collection failed; starting empty");
            return (Vec::new(), LoadStatus::Discarded);
        }
    };
    match serde_json::from_slice::<Vec<T>>(&bytes) {
        Ok(items) => {
            let count = items.len();
            (items, LoadStatus::Loaded(count))
        }
        Err(err) => {
            warn!(key, error = %err, "discarding corrupted persisted collection");
            (Vec::new(), LoadStatus::Discarded)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oprad_core::{OpportunityDraft, OpportunityType, Valuation};
    use tempfile::tempdir;

    fn mk(id: &str, title: &str) -> Opportunity {
        Opportunity::with_id(
            id,
            OpportunityDraft {
                title: title.to_string(),
                kind: OpportunityType::Freelance,
                description: "desc".into(),
                match_score: 75,
                match_reasoning: "fits".into(),
                estimated_value: "$50/hr".into(),
                platform: "Upwork".into(),
                action_plan: vec!["pitch".into()],
                tech_stack_recommendation: vec!["Rust".into()],
                learning_bridge: None,
            },
        )
    }

    fn report(angle: &str) -> SpyReport {
        SpyReport {
            competitors: vec!["Acme".into()],
            market_status: "Crowded".into(),
            competitor_weaknesses: vec!["slow support".into()],
            winning_angle: angle.into(),
            valuation: Some(Valuation {
                estimated_effort_hours: 20,
                projected_revenue: "$800/mo".into(),
                dollar_per_hour: 40.0,
                rationale: "800 / 20".into(),
            }),
        }
    }

    #[test]
    fn corrupt_opportunities_do_not_affect_sources() {
        let sources = serde_json::to_vec(&vec![Source {
            title: "Indie Hackers".into(),
            uri: "https://example.com/ih".into(),
        }])
        .expect("encode sources");
        let kv = MemoryKeyValueStore::new()
            .with_entry(OPPORTUNITIES_KEY, b"{not json".to_vec())
            .with_entry(SOURCES_KEY, sources);

        let store = StateStore::open(Arc::new(kv));
        assert!(store.opportunities().is_empty());
        assert_eq!(store.sources().len(), 1);
        assert_eq!(store.load_report().opportunities, LoadStatus::Discarded);
        assert_eq!(store.load_report().sources, LoadStatus::Loaded(1));
        assert_eq!(store.run_state(), RunState::Idle);
    }

    #[test]
    fn mutations_write_through_and_survive_reopen() {
        let dir = tempdir().expect("tempdir");
        let kv: Arc<dyn KeyValueStore> =
            Arc::new(FileKeyValueStore::open(dir.path()).expect("open kv"));

        let store = StateStore::open(kv.clone());
        store.prepend_opportunity(mk("op-1", "X"));
        store.prepend_opportunity(mk("op-2", "Y"));
        assert!(store.prepend_source(Source {
            title: "a".into(),
            uri: "https://a".into()
        }));
        store.set_run_state(RunState::Running);

        let reopened = StateStore::open(kv);
        let ids: Vec<_> = reopened.opportunities().into_iter().map(|o| o.id).collect();
        assert_eq!(ids, vec!["op-2", "op-1"]);
        assert_eq!(reopened.sources().len(), 1);
        assert_eq!(reopened.run_state(), RunState::Idle);
    }

    #[test]
    fn sources_deduplicate_by_uri() {
        let store = StateStore::open(Arc::new(MemoryKeyValueStore::new()));
        assert!(store.prepend_source(Source {
            title: "first".into(),
            uri: "https://same".into()
        }));
        assert!(!store.prepend_source(Source {
            title: "second".into(),
            uri: "https://same".into()
        }));
        assert!(store.prepend_source(Source {
            title: "other".into(),
            uri: "https://other".into()
        }));
        let uris: Vec<_> = store.sources().into_iter().map(|s| s.uri).collect();
        assert_eq!(uris, vec!["https://other", "https://same"]);
    }

    #[test]
    fn spy_report_merge_replaces_wholesale_in_place() {
        let store = StateStore::open(Arc::new(MemoryKeyValueStore::new()));
        store.prepend_opportunity(mk("op-1", "X"));
        store.prepend_opportunity(mk("op-2", "Y"));
        let sibling_before = store.opportunity("op-2").expect("op-2");

        assert!(store.attach_spy_report("op-1", report("first angle")));
        assert!(store.attach_spy_report("op-1", report("second angle")));
        assert!(!store.attach_spy_report("op-missing", report("nope")));

        let all = store.opportunities();
        assert_eq!(all[0], sibling_before);
        assert_eq!(all[1].id, "op-1");
        assert_eq!(
            all[1].spy_report.as_ref().map(|r| r.winning_angle.as_str()),
            Some("second angle")
        );
        assert_eq!(all[1].title, "X");
    }

    #[test]
    fn reset_clears_both_collections_on_disk() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let store = StateStore::open(kv.clone());
        store.prepend_opportunity(mk("op-1", "X"));
        store.prepend_source(Source {
            title: "a".into(),
            uri: "https://a".into(),
        });
        store.reset();

        let reopened = StateStore::open(kv);
        assert!(reopened.is_empty());
        assert!(reopened.sources().is_empty());
        assert_eq!(reopened.load_report().opportunities, LoadStatus::Loaded(0));
    }

    #[test]
    fn profile_round_trips_and_ignores_garbage() {
        let kv = Arc::new(MemoryKeyValueStore::new().with_entry(PROFILE_KEY, b"garbage".to_vec()));
        let store = StateStore::open(kv);
        assert!(store.load_profile().is_none());

        let profile = Profile {
            name: "Sam".into(),
            core_skills: "React, Python".into(),
            ..Profile::default()
        };
        store.save_profile(&profile).expect("save profile");
        assert_eq!(store.load_profile(), Some(profile));
    }

    #[test]
    fn file_store_rejects_path_like_keys() {
        let dir = tempdir().expect("tempdir");
        let kv = FileKeyValueStore::open(dir.path()).expect("open kv");
        assert!(matches!(
            kv.set("../escape", b"x"),
            Err(PersistenceError::InvalidKey(_))
        ));
        assert_eq!(kv.get("absent").expect("get"), None);
        kv.set("present", b"[1]").expect("set");
        assert_eq!(kv.get("present").expect("get"), Some(b"[1]".to_vec()));
    }

    /// Reads nothing, refuses every write.
    struct ReadOnlyStore;

    impl KeyValueStore for ReadOnlyStore {
        fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
            Ok(None)
        }

        fn set(&self, key: &str, _value: &[u8]) -> Result<(), PersistenceError> {
            Err(PersistenceError::Io {
                key: key.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            })
        }
    }

    #[test]
    fn failed_writes_keep_the_in_memory_mutation() {
        let store = StateStore::open(Arc::new(ReadOnlyStore));
        store.prepend_opportunity(mk("op-1", "Order Sync Bot"));
        assert!(store.prepend_source(Source {
            title: "Reddit".into(),
            uri: "https://example.com/r".into(),
        }));
        assert!(store.attach_spy_report("op-1", report("flat pricing")));

        let stored = store.opportunity("op-1").expect("op-1");
        assert_eq!(store.titles(), vec!["Order Sync Bot"]);
        assert_eq!(
            stored.spy_report.map(|r| r.winning_angle).as_deref(),
            Some("flat pricing")
        );
        assert_eq!(store.sources().len(), 1);
    }

    #[test]
    fn corrupt_sources_do_not_affect_opportunities() {
        let opportunities = serde_json::to_vec(&vec![mk("op-1", "Resume Roaster")])
            .expect("encode opportunities");
        let kv = MemoryKeyValueStore::new()
            .with_entry(OPPORTUNITIES_KEY, opportunities)
            .with_entry(SOURCES_KEY, b"[{\"title\": 3}]".to_vec());

        let store = StateStore::open(Arc::new(kv));
        assert_eq!(store.titles(), vec!["Resume Roaster"]);
        assert!(store.sources().is_empty());
        assert_eq!(store.load_report().opportunities, LoadStatus::Loaded(1));
        assert_eq!(store.load_report().sources, LoadStatus::Discarded);
    }
}
