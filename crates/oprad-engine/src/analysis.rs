//! On-demand competitor analysis, at most one in flight per opportunity id.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use oprad_storage::StateStore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::pipeline::Analyzer;
use crate::{lock, ActivityLog, Notifier, PipelineError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisOutcome {
    /// The spy report replaced whatever the record carried before.
    Merged,
    /// The record was left untouched.
    Failed(String),
}

struct AnalysisShared {
    store: Arc<StateStore>,
    analyzer: Arc<dyn Analyzer>,
    in_flight: Mutex<HashSet<String>>,
    logs: Mutex<HashMap<String, ActivityLog>>,
    log_capacity: usize,
    notifier: Notifier,
}

pub struct AnalysisManager {
    shared: Arc<AnalysisShared>,
}

/// Removes the id from the in-flight set when the task ends, however it ends.
struct InFlightGuard {
    shared: Arc<AnalysisShared>,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.shared.in_flight).remove(&self.id);
        self.shared.notifier.bump();
    }
}

impl AnalysisManager {
    pub fn new(
        store: Arc<StateStore>,
        analyzer: Arc<dyn Analyzer>,
        log_capacity: usize,
        notifier: Notifier,
    ) -> Self {
        Self {
            shared: Arc::new(AnalysisShared {
                store,
                analyzer,
                in_flight: Mutex::new(HashSet::new()),
                logs: Mutex::new(HashMap::new()),
                log_capacity,
                notifier,
            }),
        }
    }

    /// Starts an analysis for `id`. Returns `None` without doing anything when
    /// one is already running for that id; duplicate requests are dropped, not
    /// queued. Dropping the returned handle does not cancel the task.
    pub fn analyze(&self, id: &str) -> Option<JoinHandle<AnalysisOutcome>> {
        if !lock(&self.shared.in_flight).insert(id.to_string()) {
            debug!(opportunity_id = id, "analysis already in flight");
            return None;
        }
        let guard = InFlightGuard {
            shared: self.shared.clone(),
            id: id.to_string(),
        };

        let log = ActivityLog::new(self.shared.log_capacity, Some(self.shared.notifier.clone()));
        lock(&self.shared.logs).insert(id.to_string(), log.clone());

        let shared = self.shared.clone();
        Some(tokio::spawn(async move {
            let outcome = shared.run(&guard.id, &log).await;
            drop(guard);
            outcome
        }))
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        lock(&self.shared.in_flight).contains(id)
    }

    pub fn in_flight(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.shared.in_flight).iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Latest log for `id`, kept after the task finishes.
    pub fn log_for(&self, id: &str) -> Option<Vec<String>> {
        lock(&self.shared.logs).get(id).map(ActivityLog::entries)
    }

    pub fn logs(&self) -> BTreeMap<String, Vec<String>> {
        lock(&self.shared.logs)
            .iter()
            .map(|(id, log)| (id.clone(), log.entries()))
            .collect()
    }

    pub fn clear_logs(&self) {
        let in_flight = lock(&self.shared.in_flight).clone();
        lock(&self.shared.logs).retain(|id, _| in_flight.contains(id));
    }
}

impl AnalysisShared {
    async fn run(&self, id: &str, log: &ActivityLog) -> AnalysisOutcome {
        let Some(opportunity) = self.store.opportunity(id) else {
            let err = PipelineError::UnknownOpportunity(id.to_string());
            log.push(format!("Analysis aborted: {err}."));
            return AnalysisOutcome::Failed(err.to_string());
        };

        match self.analyzer.analyze(&opportunity, log).await {
            Ok(report) => {
                let dollar_per_hour = report.valuation.as_ref().map(|v| v.dollar_per_hour);
                if self.store.attach_spy_report(id, report) {
                    info!(opportunity_id = id, ?dollar_per_hour, "spy report merged");
                    log.push("Spy report attached.");
                    AnalysisOutcome::Merged
                } else {
                    warn!(opportunity_id = id, "opportunity vanished before merge");
                    log.push("Opportunity no longer exists; report discarded.");
                    AnalysisOutcome::Failed("opportunity removed before merge".to_string())
                }
            }
            Err(err) => {
                warn!(opportunity_id = id, error = %err, "analysis failed");
                log.push(format!("Analysis failed: {err}."));
                AnalysisOutcome::Failed(err.to_string())
            }
        }
    }
}
