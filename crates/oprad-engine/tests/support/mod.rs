#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use oprad_core::{
    Opportunity, OpportunityDraft, OpportunityType, Profile, Source, SpyReport, Valuation,
};
use oprad_engine::{
    ActivityLog, Analyzer, Discovery, EngineConfig, LoopTiming, PipelineError, Synthesizer,
};
use oprad_inference::{CollaboratorError, InferenceClient, InferenceRequest, InferenceResponse};
use oprad_storage::{KeyValueStore, MemoryKeyValueStore, StateStore};
use tokio::sync::Semaphore;

pub fn profile() -> Profile {
    Profile {
        name: "Ada".into(),
        background: "Final year CS student".into(),
        core_skills: "Python, React".into(),
        tech_stack: "Next.js, Supabase".into(),
        resources: "4 hours/day".into(),
        interests: "automation".into(),
        platform_target: String::new(),
    }
}

pub fn config() -> EngineConfig {
    EngineConfig {
        timing: LoopTiming {
            iteration_delay: Duration::from_secs(4),
            retry_delay: Duration::from_secs(15),
        },
        ..EngineConfig::default()
    }
}

pub fn memory_store() -> (Arc<dyn KeyValueStore>, Arc<StateStore>) {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
    let store = Arc::new(StateStore::open(kv.clone()));
    (kv, store)
}

pub fn draft(title: &str, score: u8) -> OpportunityDraft {
    OpportunityDraft {
        title: title.to_string(),
        kind: OpportunityType::MicroSaas,
        description: format!("{title} description"),
        match_score: score,
        match_reasoning: "skills line up".into(),
        estimated_value: "$500/mo".into(),
        platform: "Gumroad".into(),
        action_plan: vec!["Build".into(), "Launch".into()],
        tech_stack_recommendation: vec!["Next.js".into()],
        learning_bridge: None,
    }
}

pub fn opportunity(id: &str, title: &str, score: u8) -> Opportunity {
    Opportunity::with_id(id, draft(title, score))
}

pub fn spy_report(dollar_per_hour: f64) -> SpyReport {
    SpyReport {
        competitors: vec!["Zapier".into(), "Make".into()],
        market_status: "Crowded at the top, thin in the niche".into(),
        competitor_weaknesses: vec!["Pricing jumps".into()],
        winning_angle: "Flat pricing for solo merchants".into(),
        valuation: Some(Valuation {
            estimated_effort_hours: 25,
            projected_revenue: "$1000 fixed".into(),
            dollar_per_hour,
            rationale: "1000 / 25".into(),
        }),
    }
}

/// Poll `cond` while letting paused time advance.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..20_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached");
}

pub fn text(body: impl Into<String>) -> Result<InferenceResponse, String> {
    Ok(InferenceResponse {
        text: body.into(),
        citations: vec![],
    })
}

pub fn cited(body: impl Into<String>, uri: &str) -> Result<InferenceResponse, String> {
    Ok(InferenceResponse {
        text: body.into(),
        citations: vec![Source {
            title: format!("source for {uri}"),
            uri: uri.to_string(),
        }],
    })
}

/// Replays canned responses in order and records every request.
#[derive(Default)]
pub struct ScriptedClient {
    steps: Mutex<VecDeque<Result<InferenceResponse, String>>>,
    requests: Mutex<Vec<InferenceRequest>>,
}

impl ScriptedClient {
    pub fn new(steps: Vec<Result<InferenceResponse, String>>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<InferenceRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceClient for ScriptedClient {
    async fn generate(
        &self,
        request: &InferenceRequest,
    ) -> Result<InferenceResponse, CollaboratorError> {
        self.requests.lock().unwrap().push(request.clone());
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Ok(response)) => Ok(response),
            Some(Err(body)) => Err(CollaboratorError::HttpStatus { status: 503, body }),
            None => Err(CollaboratorError::HttpStatus {
                status: 503,
                body: "script exhausted".into(),
            }),
        }
    }
}

/// Succeeds or fails per scripted outcome, titling successes `t1`, `t2`, ...
/// by call number.
pub struct ScriptedSynthesizer {
    outcomes: Mutex<VecDeque<bool>>,
    exhausted: bool,
    seen_titles: Mutex<Vec<Vec<String>>>,
}

impl ScriptedSynthesizer {
    pub fn new(outcomes: Vec<bool>, exhausted: bool) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            exhausted,
            seen_titles: Mutex::new(Vec::new()),
        }
    }

    pub fn always_ok() -> Self {
        Self::new(vec![], true)
    }

    pub fn calls(&self) -> usize {
        self.seen_titles.lock().unwrap().len()
    }

    pub fn seen_titles(&self) -> Vec<Vec<String>> {
        self.seen_titles.lock().unwrap().clone()
    }
}

#[async_trait]
impl Synthesizer for ScriptedSynthesizer {
    async fn synthesize(
        &self,
        _profile: &Profile,
        existing_titles: &[String],
        _log: &ActivityLog,
    ) -> Result<Discovery, PipelineError> {
        let call = {
            let mut seen = self.seen_titles.lock().unwrap();
            seen.push(existing_titles.to_vec());
            seen.len()
        };
        let ok = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.exhausted);
        if ok {
            Ok(Discovery {
                opportunity: Opportunity::from_draft(draft(&format!("t{call}"), 70)),
                source: None,
            })
        } else {
            Err(PipelineError::SynthesisParse(format!("call {call} scripted to fail")))
        }
    }
}

/// Blocks each call until the test releases a permit.
pub struct GatedSynthesizer {
    pub gate: Semaphore,
    calls: AtomicUsize,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

impl GatedSynthesizer {
    pub fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most calls ever in progress at the same moment.
    pub fn peak_running(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Synthesizer for GatedSynthesizer {
    async fn synthesize(
        &self,
        _profile: &Profile,
        _existing_titles: &[String],
        _log: &ActivityLog,
    ) -> Result<Discovery, PipelineError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(running, Ordering::SeqCst);
        self.gate.acquire().await.unwrap().forget();
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(Discovery {
            opportunity: Opportunity::from_draft(draft(&format!("gated {call}"), 65)),
            source: Some(Source {
                title: "example".into(),
                uri: "https://example.com/gated".into(),
            }),
        })
    }
}

/// Returns `report` (or an error when `None`) once a permit is available.
pub struct GatedAnalyzer {
    pub gate: Semaphore,
    calls: AtomicUsize,
    report: Option<SpyReport>,
}

impl GatedAnalyzer {
    pub fn new(permits: usize, report: Option<SpyReport>) -> Self {
        Self {
            gate: Semaphore::new(permits),
            calls: AtomicUsize::new(0),
            report,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Analyzer for GatedAnalyzer {
    async fn analyze(
        &self,
        opportunity: &Opportunity,
        log: &ActivityLog,
    ) -> Result<SpyReport, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        log.push(format!("analyzing {}", opportunity.id));
        self.gate.acquire().await.unwrap().forget();
        self.report
            .clone()
            .ok_or_else(|| PipelineError::ValuationParse("scripted failure".into()))
    }
}
