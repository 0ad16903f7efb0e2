//! Two-stage inference pipelines: grounded research followed by structured
//! synthesis.

use std::sync::Arc;

use async_trait::async_trait;
use oprad_core::{Opportunity, OpportunityDraft, OpportunityType, Profile, Source, SpyReport};
use oprad_inference::{InferenceClient, InferenceRequest, SchemaDescriptor};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{ActivityLog, PipelineError};

pub const DEFAULT_PLATFORMS: &str =
    "Upwork, Freelancer, Toptal, Indie Hackers, Gumroad, Micro-SaaS marketplaces";

const STRATEGIST_INSTRUCTION: &str = "You are an expert technical career strategist. You look for \
the overlap between what the user is good at, what they enjoy and what the market pays for, and \
you encourage learning a missing skill when the reward is high.";

/// Built once at startup and shared by every pipeline.
pub struct InferenceContext {
    pub client: Arc<dyn InferenceClient>,
    pub research_model: String,
    pub synthesis_model: String,
}

impl InferenceContext {
    pub fn new(client: Arc<dyn InferenceClient>, model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            client,
            research_model: model.clone(),
            synthesis_model: model,
        }
    }

    pub fn with_research_model(mut self, model: impl Into<String>) -> Self {
        self.research_model = model.into();
        self
    }
}

/// One synthesis invocation's result.
#[derive(Debug, Clone, PartialEq)]
pub struct Discovery {
    pub opportunity: Opportunity,
    pub source: Option<Source>,
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(
        &self,
        profile: &Profile,
        existing_titles: &[String],
        log: &ActivityLog,
    ) -> Result<Discovery, PipelineError>;
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(
        &self,
        opportunity: &Opportunity,
        log: &ActivityLog,
    ) -> Result<SpyReport, PipelineError>;
}

pub struct SynthesisPipeline {
    ctx: Arc<InferenceContext>,
    domain_hints: Vec<String>,
}

impl SynthesisPipeline {
    pub fn new(ctx: Arc<InferenceContext>, domain_hints: Vec<String>) -> Self {
        Self { ctx, domain_hints }
    }
}

#[async_trait]
impl Synthesizer for SynthesisPipeline {
    async fn synthesize(
        &self,
        profile: &Profile,
        existing_titles: &[String],
        log: &ActivityLog,
    ) -> Result<Discovery, PipelineError> {
        log.push("Researching live market demand...");
        let research = self
            .ctx
            .client
            .generate(
                &InferenceRequest::new(
                    &self.ctx.research_model,
                    research_prompt(profile, existing_titles, &self.domain_hints),
                )
                .grounded(),
            )
            .await?;
        let source = research.first_citation().cloned();
        log.push(format!(
            "Research complete ({} citations). Synthesizing opportunity...",
            research.citations.len()
        ));

        let structured = self
            .ctx
            .client
            .generate(
                &InferenceRequest::new(
                    &self.ctx.synthesis_model,
                    synthesis_prompt(profile, &research.text),
                )
                .with_system_instruction(STRATEGIST_INSTRUCTION)
                .with_schema(opportunity_schema()),
            )
            .await?;
        let draft = parse_opportunity_draft(&structured.text)?;

        Ok(Discovery {
            opportunity: Opportunity::from_draft(draft),
            source,
        })
    }
}

pub struct AnalysisPipeline {
    ctx: Arc<InferenceContext>,
}

impl AnalysisPipeline {
    pub fn new(ctx: Arc<InferenceContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Analyzer for AnalysisPipeline {
    async fn analyze(
        &self,
        opportunity: &Opportunity,
        log: &ActivityLog,
    ) -> Result<SpyReport, PipelineError> {
        log.push(format!(
            "Searching competitors and pricing for \"{}\"...",
            opportunity.title
        ));
        let research = self
            .ctx
            .client
            .generate(
                &InferenceRequest::new(&self.ctx.research_model, competitor_prompt(opportunity))
                    .grounded(),
            )
            .await?;
        log.push("Competitor research complete. Valuing the opportunity...");

        let structured = self
            .ctx
            .client
            .generate(
                &InferenceRequest::new(
                    &self.ctx.synthesis_model,
                    valuation_prompt(opportunity, &research.text),
                )
                .with_schema(spy_report_schema()),
            )
            .await?;
        parse_spy_report(&structured.text)
    }
}

/// Partial profile pulled out of free text. Missing fields stay `None`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileDraft {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub background: Option<String>,
    #[serde(default)]
    pub core_skills: Option<String>,
    #[serde(default)]
    pub tech_stack: Option<String>,
    #[serde(default)]
    pub resources: Option<String>,
    #[serde(default)]
    pub interests: Option<String>,
    #[serde(default)]
    pub platform_target: Option<String>,
}

impl ProfileDraft {
    /// Overlay extracted values on top of `base`.
    pub fn merge_into(self, mut base: Profile) -> Profile {
        let fields = [
            (self.name, &mut base.name),
            (self.background, &mut base.background),
            (self.core_skills, &mut base.core_skills),
            (self.tech_stack, &mut base.tech_stack),
            (self.resources, &mut base.resources),
            (self.interests, &mut base.interests),
            (self.platform_target, &mut base.platform_target),
        ];
        for (value, slot) in fields {
            if let Some(value) = value {
                *slot = value.trim().to_string();
            }
        }
        base
    }
}

/// Free-text to profile helper. The discovery loop never depends on it.
pub struct ProfileExtractor {
    ctx: Arc<InferenceContext>,
}

impl ProfileExtractor {
    pub fn new(ctx: Arc<InferenceContext>) -> Self {
        Self { ctx }
    }

    pub async fn extract(&self, text: &str) -> Result<ProfileDraft, PipelineError> {
        let response = self
            .ctx
            .client
            .generate(
                &InferenceRequest::new(&self.ctx.synthesis_model, profile_prompt(text))
                    .with_schema(profile_schema()),
            )
            .await?;
        parse_structured(&response.text).map_err(PipelineError::ProfileParse)
    }
}

pub fn research_prompt(profile: &Profile, existing_titles: &[String], domain_hints: &[String]) -> String {
    let platforms = profile.platform_filter().unwrap_or(DEFAULT_PLATFORMS);
    let exclusions = if existing_titles.is_empty() {
        "- (none yet)".to_string()
    } else {
        existing_titles
            .iter()
            .map(|title| format!("- {title}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let industries = if domain_hints.is_empty() {
        "any industry with paying demand".to_string()
    } else {
        domain_hints.join(", ")
    };

    format!(
        "Analyze current market demand for a developer with this profile:\n\
         - Background: {background}\n\
         - Skills: {skills}\n\
         - Tech stack: {stack}\n\
         - Interests: {interests}\n\
         - Available resources: {resources}\n\
         - Target platforms: {platforms}\n\
         - Industries worth scanning: {industries}\n\n\
         Find ONE specific, high-value opportunity (a freelance gig, a micro-SaaS idea, a digital \
         product or an automation play) that businesses are paying to solve right now. Prefer either \
         a near-perfect skill match or a stretch opportunity where the user covers roughly 70% of \
         the required skills and the pay justifies learning the rest.\n\n\
         Do NOT repeat any of these already discovered opportunities:\n{exclusions}",
        background = profile.background,
        skills = profile.core_skills,
        stack = profile.tech_stack,
        interests = profile.interests,
        resources = profile.resources,
    )
}

pub fn synthesis_prompt(profile: &Profile, research: &str) -> String {
    let profile_json = serde_json::to_string_pretty(profile).unwrap_or_default();
    format!(
        "You are the talent manager of a developer named {name}.\n\n\
         USER PROFILE:\n{profile_json}\n\n\
         MARKET RESEARCH:\n{research}\n\n\
         Turn the research into exactly one personalized opportunity.\n\
         Rules:\n\
         1. matchScore is the percentage of required skills the user already has (0-100).\n\
         2. If matchScore is between 60 and 80 and the opportunity is high value, fill \
         learningBridge with the missing skill and a short crash course. Otherwise omit it.\n\
         3. actionPlan must be concrete, ordered steps.",
        name = profile.name,
    )
}

pub fn competitor_prompt(opportunity: &Opportunity) -> String {
    format!(
        "Idea: \"{title}\" ({description}).\nTarget platform: {platform}.\n\n\
         Perform competitive and pricing research:\n\
         1. Find existing competitors or alternatives (search engines, Reddit, Product Hunt).\n\
         2. Find PRICING for similar offers (subscriptions, hourly rates, fixed project fees).\n\
         3. Find user complaints that reveal competitor weaknesses.",
        title = opportunity.title,
        description = opportunity.description,
        platform = opportunity.platform,
    )
}

pub fn valuation_prompt(opportunity: &Opportunity, research: &str) -> String {
    format!(
        "You are a niche analyst and valuation expert.\n\n\
         IDEA: {title}\n\
         RECOMMENDED STACK: {stack}\n\
         MARKET RESEARCH:\n{research}\n\n\
         Find a winning angle against the competitors and calculate ROI:\n\
         - estimatedEffortHours: realistic hours for a skilled developer using the stack.\n\
         - projectedRevenue: conservative estimate based on competitor pricing.\n\
         - dollarPerHour: projected revenue divided by effort hours.",
        title = opportunity.title,
        stack = opportunity.tech_stack_recommendation.join(", "),
    )
}

pub fn profile_prompt(text: &str) -> String {
    format!(
        "Extract a developer profile from the text below.\n\n\
         TEXT:\n\"{text}\"\n\n\
         Instructions:\n\
         - Fill name, background, coreSkills, techStack, resources and interests.\n\
         - platformTarget: only platforms explicitly mentioned (Upwork, Fiverr, ...). If none are \
         mentioned return an empty string.\n\
         - Summarize values as short comma separated lists."
    )
}

pub fn opportunity_schema() -> SchemaDescriptor {
    let kinds: Vec<&str> = OpportunityType::ALL.iter().map(|kind| kind.as_str()).collect();
    SchemaDescriptor::new(json!({
        "type": "OBJECT",
        "properties": {
            "title": { "type": "STRING" },
            "type": { "type": "STRING", "enum": kinds },
            "description": { "type": "STRING" },
            "matchScore": { "type": "INTEGER", "description": "Percentage match 0-100 against the user profile" },
            "matchReasoning": { "type": "STRING", "description": "Why this fits the user's specific skills" },
            "estimatedValue": { "type": "STRING", "description": "E.g. $50/hr or $500/mo" },
            "platform": { "type": "STRING" },
            "actionPlan": { "type": "ARRAY", "items": { "type": "STRING" } },
            "techStackRecommendation": { "type": "ARRAY", "items": { "type": "STRING" } },
            "learningBridge": {
                "type": "OBJECT",
                "nullable": true,
                "description": "Only when matchScore is 60-80 and a high value skill is missing",
                "properties": {
                    "missingSkill": { "type": "STRING" },
                    "analogy": { "type": "STRING" },
                    "hoursToLearn": { "type": "INTEGER" },
                    "curriculum": { "type": "ARRAY", "items": { "type": "STRING" } }
                },
                "required": ["missingSkill", "analogy", "hoursToLearn", "curriculum"]
            }
        },
        "required": [
            "title", "type", "description", "matchScore", "matchReasoning",
            "estimatedValue", "platform", "actionPlan", "techStackRecommendation"
        ]
    }))
}

pub fn spy_report_schema() -> SchemaDescriptor {
    SchemaDescriptor::new(json!({
        "type": "OBJECT",
        "properties": {
            "competitors": { "type": "ARRAY", "items": { "type": "STRING" } },
            "marketStatus": { "type": "STRING", "description": "Summary of market saturation" },
            "competitorWeaknesses": { "type": "ARRAY", "items": { "type": "STRING" } },
            "winningAngle": { "type": "STRING" },
            "valuation": {
                "type": "OBJECT",
                "properties": {
                    "estimatedEffortHours": { "type": "INTEGER" },
                    "projectedRevenue": { "type": "STRING" },
                    "dollarPerHour": { "type": "NUMBER" },
                    "rationale": { "type": "STRING" }
                },
                "required": ["estimatedEffortHours", "projectedRevenue", "dollarPerHour", "rationale"]
            }
        },
        "required": ["competitors", "marketStatus", "competitorWeaknesses", "winningAngle", "valuation"]
    }))
}

pub fn profile_schema() -> SchemaDescriptor {
    SchemaDescriptor::new(json!({
        "type": "OBJECT",
        "properties": {
            "name": { "type": "STRING" },
            "background": { "type": "STRING" },
            "coreSkills": { "type": "STRING" },
            "techStack": { "type": "STRING" },
            "resources": { "type": "STRING" },
            "interests": { "type": "STRING" },
            "platformTarget": { "type": "STRING" }
        }
    }))
}

/// Models sometimes wrap JSON in markdown fences even in JSON mode.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn parse_structured<T: DeserializeOwned>(text: &str) -> Result<T, String> {
    serde_json::from_str(strip_code_fence(text)).map_err(|err| err.to_string())
}

pub fn parse_opportunity_draft(text: &str) -> Result<OpportunityDraft, PipelineError> {
    let draft: OpportunityDraft = parse_structured(text).map_err(PipelineError::SynthesisParse)?;
    if draft.title.trim().is_empty() {
        return Err(PipelineError::SynthesisParse("title is empty".to_string()));
    }
    if draft.match_score > 100 {
        return Err(PipelineError::SynthesisParse(format!(
            "matchScore {} is outside 0-100",
            draft.match_score
        )));
    }
    Ok(draft)
}

pub fn parse_spy_report(text: &str) -> Result<SpyReport, PipelineError> {
    let report: SpyReport = parse_structured(text).map_err(PipelineError::ValuationParse)?;
    if let Some(valuation) = &report.valuation {
        if !valuation.dollar_per_hour.is_finite() || valuation.dollar_per_hour < 0.0 {
            return Err(PipelineError::ValuationParse(format!(
                "dollarPerHour {} is not a usable rate",
                valuation.dollar_per_hour
            )));
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> Profile {
        Profile {
            name: "Ada".into(),
            background: "4th year CS student".into(),
            core_skills: "Python, copywriting".into(),
            tech_stack: "Next.js, Supabase".into(),
            resources: "4 hours/day, $0 budget".into(),
            interests: "automation".into(),
            platform_target: String::new(),
        }
    }

    const DRAFT_JSON: &str = r#"{
        "title": "Notion Template Pack",
        "type": "DigitalProduct",
        "description": "Planning templates for freelancers",
        "matchScore": 88,
        "matchReasoning": "Copywriting plus product sense",
        "estimatedValue": "$300/mo",
        "platform": "Gumroad",
        "actionPlan": ["Draft five templates", "Launch on Gumroad"],
        "techStackRecommendation": ["Notion"]
    }"#;

    #[test]
    fn research_prompt_lists_exclusions_and_default_platforms() {
        let titles = vec!["Shopify Order Sync Bot".to_string(), "Resume Roaster".to_string()];
        let prompt = research_prompt(&profile(), &titles, &["fintech".to_string()]);
        assert!(prompt.contains("- Shopify Order Sync Bot\n- Resume Roaster"));
        assert!(prompt.contains(DEFAULT_PLATFORMS));
        assert!(prompt.contains("Industries worth scanning: fintech"));
    }

    #[test]
    fn research_prompt_honours_platform_filter() {
        let mut p = profile();
        p.platform_target = " Fiverr ".into();
        let prompt = research_prompt(&p, &[], &[]);
        assert!(prompt.contains("Target platforms: Fiverr\n"));
        assert!(prompt.contains("(none yet)"));
    }

    #[test]
    fn draft_parses_with_and_without_fences() {
        let plain = parse_opportunity_draft(DRAFT_JSON).expect("plain");
        let fenced = parse_opportunity_draft(&format!("```json\n{DRAFT_JSON}\n```")).expect("fenced");
        assert_eq!(plain, fenced);
        assert_eq!(plain.kind, OpportunityType::DigitalProduct);
        assert!(plain.learning_bridge.is_none());
    }

    #[test]
    fn out_of_range_score_is_a_parse_error() {
        let text = DRAFT_JSON.replace("\"matchScore\": 88", "\"matchScore\": 140");
        assert!(matches!(
            parse_opportunity_draft(&text),
            Err(PipelineError::SynthesisParse(_))
        ));
        assert!(matches!(
            parse_opportunity_draft("I could not find anything"),
            Err(PipelineError::SynthesisParse(_))
        ));
    }

    #[test]
    fn spy_report_rejects_negative_rate() {
        let text = r#"{"competitors":[],"marketStatus":"Saturated","competitorWeaknesses":[],
            "winningAngle":"niche down","valuation":{"estimatedEffortHours":10,
            "projectedRevenue":"$0","dollarPerHour":-3.5,"rationale":"loss"}}"#;
        assert!(matches!(
            parse_spy_report(text),
            Err(PipelineError::ValuationParse(_))
        ));
    }

    #[test]
    fn profile_draft_overlays_only_present_fields() {
        let draft: ProfileDraft = parse_structured(
            r#"{"name":" Grace ","coreSkills":"COBOL","platformTarget":""}"#,
        )
        .expect("draft");
        let merged = draft.merge_into(profile());
        assert_eq!(merged.name, "Grace");
        assert_eq!(merged.core_skills, "COBOL");
        assert_eq!(merged.tech_stack, "Next.js, Supabase");
        assert_eq!(merged.platform_target, "");
    }

    #[test]
    fn opportunity_schema_enumerates_all_types() {
        let schema = opportunity_schema();
        let kinds = schema.as_json()["properties"]["type"]["enum"]
            .as_array()
            .expect("enum")
            .len();
        assert_eq!(kinds, OpportunityType::ALL.len());
    }
}
