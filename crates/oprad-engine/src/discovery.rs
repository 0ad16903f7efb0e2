//! Discovery loop: repeatedly synthesizes one opportunity and commits it.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use oprad_core::{Profile, RunState};
use oprad_storage::StateStore;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pipeline::Synthesizer;
use crate::{lock, ActivityLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopTiming {
    /// Wait after a successful iteration.
    pub iteration_delay: Duration,
    /// Wait after a failed iteration.
    pub retry_delay: Duration,
}

impl Default for LoopTiming {
    fn default() -> Self {
        Self {
            iteration_delay: Duration::from_secs(4),
            retry_delay: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IterationStats {
    pub iterations: u64,
    pub successes: u64,
    pub failures: u64,
}

struct LoopShared {
    store: Arc<StateStore>,
    synthesizer: Arc<dyn Synthesizer>,
    profile: Arc<RwLock<Profile>>,
    log: ActivityLog,
    timing: LoopTiming,
    stats: Mutex<IterationStats>,
}

struct LoopHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Owns the start/stop lifecycle of the discovery loop. At most one
/// iteration runs at a time, across restarts too.
pub struct DiscoveryController {
    shared: Arc<LoopShared>,
    handle: Mutex<Option<LoopHandle>>,
    /// Task of the last stopped loop, possibly still finishing an iteration.
    stopped: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryController {
    pub fn new(
        store: Arc<StateStore>,
        synthesizer: Arc<dyn Synthesizer>,
        profile: Arc<RwLock<Profile>>,
        log: ActivityLog,
        timing: LoopTiming,
    ) -> Self {
        Self {
            shared: Arc::new(LoopShared {
                store,
                synthesizer,
                profile,
                log,
                timing,
                stats: Mutex::new(IterationStats::default()),
            }),
            handle: Mutex::new(None),
            stopped: Mutex::new(None),
        }
    }

    /// Returns false when the loop was already running. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut handle = lock(&self.handle);
        if handle.is_some() {
            debug!("discovery loop already running");
            return false;
        }

        self.shared.store.set_run_state(RunState::Running);
        self.shared.log.push("Discovery engine started.");

        let previous = lock(&self.stopped).take();
        let cancel = CancellationToken::new();
        let join = tokio::spawn(run_loop(self.shared.clone(), cancel.clone(), previous));
        *handle = Some(LoopHandle { cancel, join });
        true
    }

    /// Cancels the wait before the next iteration. An iteration already in
    /// flight runs to completion and still commits its result; a later
    /// `start()` waits for it before iterating.
    pub fn stop(&self) -> bool {
        let Some(handle) = lock(&self.handle).take() else {
            return false;
        };
        handle.cancel.cancel();
        *lock(&self.stopped) = Some(handle.join);
        self.shared.store.set_run_state(RunState::Idle);
        self.shared.log.push("Discovery engine stopped.");
        true
    }

    pub fn is_running(&self) -> bool {
        lock(&self.handle).is_some()
    }

    pub fn stats(&self) -> IterationStats {
        *lock(&self.shared.stats)
    }

    pub fn log(&self) -> &ActivityLog {
        &self.shared.log
    }
}

impl Drop for DiscoveryController {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.handle).take() {
            handle.cancel.cancel();
        }
    }
}

async fn run_loop(
    shared: Arc<LoopShared>,
    cancel: CancellationToken,
    previous: Option<JoinHandle<()>>,
) {
    if let Some(previous) = previous {
        debug!("waiting for the previous loop's iteration to finish");
        if let Err(err) = previous.await {
            warn!(error = %err, "previous discovery loop ended abnormally");
        }
    }
    while !cancel.is_cancelled() {
        let delay = shared.run_iteration().await;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!("discovery loop exited");
}

impl LoopShared {
    /// Runs one iteration and returns how long to wait before the next one.
    async fn run_iteration(&self) -> Duration {
        let iteration = {
            let mut stats = lock(&self.stats);
            stats.iterations += 1;
            stats.iterations
        };
        let profile = self
            .profile
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        // Fresh read: earlier iterations or a reset may have changed the titles.
        let existing_titles = self.store.titles();
        self.log.push(format!(
            "Iteration {iteration}: scanning for new opportunities ({} already known).",
            existing_titles.len()
        ));

        match self
            .synthesizer
            .synthesize(&profile, &existing_titles, &self.log)
            .await
        {
            Ok(discovery) => {
                let opportunity = discovery.opportunity;
                info!(
                    iteration,
                    opportunity_id = %opportunity.id,
                    match_score = opportunity.match_score,
                    "discovered opportunity"
                );
                let summary = format!(
                    "Found \"{}\" ({}, {}% match).",
                    opportunity.title, opportunity.kind, opportunity.match_score
                );
                self.store.prepend_opportunity(opportunity);
                if let Some(source) = discovery.source {
                    self.store.prepend_source(source);
                }
                lock(&self.stats).successes += 1;
                self.log.push(summary);
                self.timing.iteration_delay
            }
            Err(err) => {
                let delay = self.timing.retry_delay;
                warn!(iteration, error = %err, delay_secs = delay.as_secs(), "discovery iteration failed");
                lock(&self.stats).failures += 1;
                self.log.push(format!(
                    "Iteration {iteration} failed: {err}. Retrying in {}s.",
                    delay.as_secs()
                ));
                delay
            }
        }
    }
}
