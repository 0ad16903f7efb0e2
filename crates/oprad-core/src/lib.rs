//! Core domain model and ranking views for Opportunity Radar.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "oprad-core";

/// Caller-owned description of the person opportunities are tailored to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub background: String,
    pub core_skills: String,
    pub tech_stack: String,
    pub resources: String,
    pub interests: String,
    /// Comma separated platform filter. Empty means unrestricted.
    #[serde(default)]
    pub platform_target: String,
}

impl Profile {
    pub fn platform_filter(&self) -> Option<&str> {
        let trimmed = self.platform_target.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpportunityType {
    Freelance,
    #[serde(rename = "Micro-SaaS")]
    MicroSaas,
    DigitalProduct,
    #[serde(rename = "Automation/MMO")]
    AutomationMmo,
}

impl OpportunityType {
    pub const ALL: [OpportunityType; 4] = [
        OpportunityType::Freelance,
        OpportunityType::MicroSaas,
        OpportunityType::DigitalProduct,
        OpportunityType::AutomationMmo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OpportunityType::Freelance => "Freelance",
            OpportunityType::MicroSaas => "Micro-SaaS",
            OpportunityType::DigitalProduct => "DigitalProduct",
            OpportunityType::AutomationMmo => "Automation/MMO",
        }
    }

    /// Buildable products, as opposed to service work.
    pub fn is_product(&self) -> bool {
        matches!(self, OpportunityType::MicroSaas | OpportunityType::DigitalProduct)
    }
}

impl fmt::Display for OpportunityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningBridge {
    pub missing_skill: String,
    pub analogy: String,
    pub hours_to_learn: u32,
    pub curriculum: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Valuation {
    pub estimated_effort_hours: u32,
    pub projected_revenue: String,
    pub dollar_per_hour: f64,
    pub rationale: String,
}

/// Competitive analysis and ROI estimate attached to one opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpyReport {
    pub competitors: Vec<String>,
    pub market_status: String,
    pub competitor_weaknesses: Vec<String>,
    pub winning_angle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valuation: Option<Valuation>,
}

/// Web page cited by a grounded research call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source {
    pub title: String,
    pub uri: String,
}

/// Structured synthesis output before an id is assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityDraft {
    pub title: String,
    #[serde(rename = "type")]
    pub kind: OpportunityType,
    pub description: String,
    pub match_score: u8,
    pub match_reasoning: String,
    #[serde(default)]
    pub estimated_value: String,
    #[serde(default)]
    pub platform: String,
    pub action_plan: Vec<String>,
    pub tech_stack_recommendation: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_bridge: Option<LearningBridge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: OpportunityType,
    pub description: String,
    pub match_score: u8,
    pub match_reasoning: String,
    #[serde(default)]
    pub estimated_value: String,
    #[serde(default)]
    pub platform: String,
    pub action_plan: Vec<String>,
    pub tech_stack_recommendation: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_bridge: Option<LearningBridge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spy_report: Option<SpyReport>,
}

impl Opportunity {
    /// Promote a validated draft, minting a fresh id.
    pub fn from_draft(draft: OpportunityDraft) -> Self {
        Self::with_id(new_opportunity_id(), draft)
    }

    pub fn with_id(id: impl Into<String>, draft: OpportunityDraft) -> Self {
        Self {
            id: id.into(),
            title: draft.title,
            kind: draft.kind,
            description: draft.description,
            match_score: draft.match_score,
            match_reasoning: draft.match_reasoning,
            estimated_value: draft.estimated_value,
            platform: draft.platform,
            action_plan: draft.action_plan,
            tech_stack_recommendation: draft.tech_stack_recommendation,
            learning_bridge: draft.learning_bridge,
            spy_report: None,
        }
    }

    /// ROI in dollars per hour when a valuation exists.
    pub fn dollar_per_hour(&self) -> Option<f64> {
        self.spy_report
            .as_ref()
            .and_then(|report| report.valuation.as_ref())
            .map(|valuation| valuation.dollar_per_hour)
            .filter(|value| !value.is_nan())
    }
}

/// Mint an opportunity id: millisecond timestamp plus a random suffix, so ids
/// minted within the same clock tick still differ.
pub fn new_opportunity_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("op-{}-{}", Utc::now().timestamp_millis(), &suffix[..12])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RunState {
    #[default]
    Idle,
    Running,
}

impl RunState {
    pub fn is_running(&self) -> bool {
        matches!(self, RunState::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortMode {
    #[default]
    MatchScore,
    Roi,
}

impl FromStr for SortMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "match" | "match_score" | "score" => Ok(SortMode::MatchScore),
            "roi" | "dollar_per_hour" => Ok(SortMode::Roi),
            other => Err(format!("unknown sort mode `{other}` (expected `match` or `roi`)")),
        }
    }
}

fn by_match_score(a: &Opportunity, b: &Opportunity) -> Ordering {
    b.match_score.cmp(&a.match_score)
}

/// Explicit fallback for an absent valuation. Also folds -0.0 into 0.0 so the
/// zero check and `total_cmp` agree.
fn roi_or_zero(opportunity: &Opportunity) -> f64 {
    match opportunity.dollar_per_hour() {
        Some(value) if value != 0.0 => value,
        _ => 0.0,
    }
}

/// When both sides are zero the match score decides instead.
fn by_roi(a: &Opportunity, b: &Opportunity) -> Ordering {
    let roi_a = roi_or_zero(a);
    let roi_b = roi_or_zero(b);
    if roi_a == 0.0 && roi_b == 0.0 {
        return by_match_score(a, b);
    }
    roi_b.total_cmp(&roi_a)
}

/// Sorted copy of the collection. The sort is stable, so ties keep insertion
/// order.
pub fn rank(opportunities: &[Opportunity], mode: SortMode) -> Vec<Opportunity> {
    let mut sorted = opportunities.to_vec();
    match mode {
        SortMode::MatchScore => sorted.sort_by(by_match_score),
        SortMode::Roi => sorted.sort_by(by_roi),
    }
    sorted
}

/// Product-only view. Filters an already ranked list without reordering it.
pub fn product_lab(ranked: &[Opportunity]) -> Vec<Opportunity> {
    ranked
        .iter()
        .filter(|opportunity| opportunity.kind.is_product())
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViewOptions {
    pub sort: SortMode,
    pub products_only: bool,
}

pub fn view(opportunities: &[Opportunity], options: ViewOptions) -> Vec<Opportunity> {
    let ranked = rank(opportunities, options.sort);
    if options.products_only {
        product_lab(&ranked)
    } else {
        ranked
    }
}
