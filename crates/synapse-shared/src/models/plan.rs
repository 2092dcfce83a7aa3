//! # Strategy Plans
//!
//! A `StrategyPlan` decomposes a complex task into ordered stages. Each stage
//! is either a single step (sequential) or a list of steps executed in
//! parallel. Steps are static definitions; runtime progress lives in
//! [`crate::models::task::TaskState`].
//!
//! Plans arrive from callers as JSON and are accepted without interpretation
//! beyond the shape here plus the structural checks in the orchestrator
//! (unique step ids, no forward or intra-stage data references).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default retry budget for peer-delegated steps when the plan omits one
fn default_max_retries() -> u32 {
    2
}

/// Default base delay between peer-step retries, in seconds
fn default_retry_delay_seconds() -> u64 {
    2
}

/// Kinds of locally executed steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalStepKind {
    /// Invoke a registered tool by name
    LocalTool,
    /// Invoke a model backend (`llm:<model_id>`) with a prompt
    LocalLlm,
    /// Chunk a text input and apply the inner operation to each chunk
    LocalChunkProcess,
}

/// A step executed in-process through the tool dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStepSpec {
    /// Unique within the plan
    pub step_id: String,
    pub kind: LocalStepKind,
    /// Tool name, or model id for `local_llm`
    pub target: String,
    /// Literal parameters, merged under the resolved input mapping
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Step ids this step reads results from; must live in earlier stages
    #[serde(default)]
    pub input_sources: Vec<String>,
    /// Parameter name -> literal or templated string (see the input resolver)
    #[serde(default)]
    pub input_mapping: Map<String, Value>,
}

/// A step delegated to a remote peer over the federation protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStepSpec {
    /// Unique within the plan
    pub step_id: String,
    /// Capability the peer must advertise
    pub capability_id: String,
    /// Pin a specific peer; otherwise the registry resolves one
    #[serde(default)]
    pub target_ai_id: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub input_sources: Vec<String>,
    #[serde(default)]
    pub input_mapping: Map<String, Value>,
    /// Retries after the first dispatch; total dispatches are `1 + max_retries`
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay; actual delay is `base * 2^attempt`, capped
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
}

/// One step of a plan, local or peer-delegated
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step_type", rename_all = "snake_case")]
pub enum StepSpec {
    Local(LocalStepSpec),
    Hsp(PeerStepSpec),
}

impl StepSpec {
    pub fn step_id(&self) -> &str {
        match self {
            StepSpec::Local(s) => &s.step_id,
            StepSpec::Hsp(s) => &s.step_id,
        }
    }

    pub fn input_sources(&self) -> &[String] {
        match self {
            StepSpec::Local(s) => &s.input_sources,
            StepSpec::Hsp(s) => &s.input_sources,
        }
    }

    pub fn input_mapping(&self) -> &Map<String, Value> {
        match self {
            StepSpec::Local(s) => &s.input_mapping,
            StepSpec::Hsp(s) => &s.input_mapping,
        }
    }
}

/// One element of a plan's stage sequence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Stage {
    /// A single sequential step
    Single(StepSpec),
    /// Steps dispatched together; the stage joins when all are terminal
    Parallel(Vec<StepSpec>),
}

impl Stage {
    /// Steps of this stage in plan order
    pub fn steps(&self) -> Vec<&StepSpec> {
        match self {
            Stage::Single(step) => vec![step],
            Stage::Parallel(steps) => steps.iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Stage::Single(_) => 1,
            Stage::Parallel(steps) => steps.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A staged decomposition of a complex task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyPlan {
    pub plan_id: String,
    pub name: String,
    pub stages: Vec<Stage>,
    /// For a parallel final stage, the step whose result is the task result.
    /// Absent, the task result is an ordered map of the final steps' results.
    #[serde(default)]
    pub output_step_id: Option<String>,
}

impl StrategyPlan {
    /// Build the trivial one-stage plan used when a caller submits no plan:
    /// a single `local_llm` step fed the original input as its prompt.
    pub fn trivial_llm_plan(model_id: &str) -> Self {
        let mut input_mapping = Map::new();
        input_mapping.insert(
            "prompt".to_string(),
            Value::String("{$original_input}".to_string()),
        );

        StrategyPlan {
            plan_id: format!("plan-{}", uuid::Uuid::new_v4()),
            name: "trivial_llm".to_string(),
            stages: vec![Stage::Single(StepSpec::Local(LocalStepSpec {
                step_id: "step0".to_string(),
                kind: LocalStepKind::LocalLlm,
                target: model_id.to_string(),
                parameters: Map::new(),
                input_sources: Vec::new(),
                input_mapping,
            }))],
            output_step_id: None,
        }
    }

    /// All step ids in plan order
    pub fn step_ids(&self) -> Vec<&str> {
        self.stages
            .iter()
            .flat_map(|stage| stage.steps())
            .map(|s| s.step_id())
            .collect()
    }
}
