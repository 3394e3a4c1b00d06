use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TxError;
use crate::ids::{RunId, TaskId, WorkerId};

pub type Metadata = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Backlog,
    Ready,
    Planning,
    Active,
    Review,
    Done,
    Cancelled,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Ready => "ready",
            Self::Planning => "planning",
            Self::Active => "active",
            Self::Review => "review",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }

    /// Statuses in which a task may be picked up for execution.
    pub fn is_workable(&self) -> bool {
        matches!(self, Self::Backlog | Self::Ready | Self::Planning)
    }

    /// Allowed transitions; `done` is terminal.
    pub fn can_transition(&self, to: Status) -> bool {
        use Status::*;
        match self {
            Backlog => matches!(to, Ready | Planning | Active | Cancelled),
            Ready => matches!(to, Planning | Active | Cancelled),
            Planning => matches!(to, Ready | Active | Cancelled),
            Active => matches!(to, Review | Done | Ready | Cancelled),
            Review => matches!(to, Active | Done | Cancelled),
            Cancelled => matches!(to, Backlog),
            Done => false,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = TxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backlog" => Ok(Self::Backlog),
            "ready" => Ok(Self::Ready),
            "planning" => Ok(Self::Planning),
            "active" => Ok(Self::Active),
            "review" => Ok(Self::Review),
            "done" => Ok(Self::Done),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TxError::InvalidEnum {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssigneeType {
    Human,
    Agent,
}

impl AssigneeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Agent => "agent",
        }
    }
}

impl std::fmt::Display for AssigneeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AssigneeType {
    type Err = TxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(Self::Human),
            "agent" => Ok(Self::Agent),
            other => Err(TxError::InvalidEnum {
                field: "assignee_type",
                value: other.to_string(),
            }),
        }
    }
}

pub const DEFAULT_TASK_SCORE: i64 = 500;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<TaskId>,
    pub score: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_type: Option<AssigneeType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dependency {
    pub blocker_id: TaskId,
    pub blocked_id: TaskId,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Learnings
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningSource {
    #[default]
    Manual,
    Run,
    Compaction,
}

impl LearningSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Run => "run",
            Self::Compaction => "compaction",
        }
    }
}

impl std::fmt::Display for LearningSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LearningSource {
    type Err = TxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "run" => Ok(Self::Run),
            "compaction" => Ok(Self::Compaction),
            other => Err(TxError::InvalidEnum {
                field: "source_type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Learning {
    pub id: i64,
    pub content: String,
    pub source_type: LearningSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub usage_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome_score: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileLearning {
    pub id: i64,
    pub file_pattern: String,
    pub note: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Anchors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorType {
    Glob,
    Hash,
    Symbol,
    LineRange,
}

impl AnchorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Glob => "glob",
            Self::Hash => "hash",
            Self::Symbol => "symbol",
            Self::LineRange => "line_range",
        }
    }
}

impl std::fmt::Display for AnchorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AnchorType {
    type Err = TxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "glob" => Ok(Self::Glob),
            "hash" => Ok(Self::Hash),
            "symbol" => Ok(Self::Symbol),
            "line_range" => Ok(Self::LineRange),
            other => Err(TxError::InvalidEnum {
                field: "anchor_type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorStatus {
    #[default]
    Valid,
    Drifted,
    Invalid,
}

impl AnchorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Drifted => "drifted",
            Self::Invalid => "invalid",
        }
    }
}

impl std::fmt::Display for AnchorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AnchorStatus {
    type Err = TxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "valid" => Ok(Self::Valid),
            "drifted" => Ok(Self::Drifted),
            "invalid" => Ok(Self::Invalid),
            other => Err(TxError::InvalidEnum {
                field: "anchor_status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Anchor {
    pub id: i64,
    pub learning_id: i64,
    pub anchor_type: AnchorType,
    pub anchor_value: String,
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_fqname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_start: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_end: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub status: AnchorStatus,
    pub pinned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Outcome category of a single anchor verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorAction {
    Unchanged,
    SelfHealed,
    Drifted,
    Invalidated,
}

impl AnchorAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::SelfHealed => "self_healed",
            Self::Drifted => "drifted",
            Self::Invalidated => "invalidated",
        }
    }
}

impl std::fmt::Display for AnchorAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who (or what) initiated a verification pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectedBy {
    #[default]
    Manual,
    Periodic,
    GitHook,
}

impl DetectedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Periodic => "periodic",
            Self::GitHook => "git_hook",
        }
    }
}

impl std::fmt::Display for DetectedBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DetectedBy {
    type Err = TxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "periodic" => Ok(Self::Periodic),
            "git_hook" => Ok(Self::GitHook),
            other => Err(TxError::InvalidEnum {
                field: "detected_by",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AnchorInvalidation {
    pub id: i64,
    pub anchor_id: i64,
    pub old_status: AnchorStatus,
    pub new_status: AnchorStatus,
    pub detected_by: DetectedBy,
    pub reason: String,
    pub detected_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

/// Typed relation between two entities. The edge vocabulary is open
/// (SIMILAR_TO, ANCHORED_TO, DERIVED_FROM, IMPORTS, ...), so the type is
/// carried as text rather than an enum.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge {
    pub id: i64,
    pub edge_type: String,
    pub source_type: String,
    pub source_id: String,
    pub target_type: String,
    pub target_id: String,
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalidated_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Docs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocKind {
    Overview,
    Prd,
    Design,
}

impl DocKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overview => "overview",
            Self::Prd => "prd",
            Self::Design => "design",
        }
    }
}

impl std::fmt::Display for DocKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DocKind {
    type Err = TxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "overview" => Ok(Self::Overview),
            "prd" => Ok(Self::Prd),
            "design" => Ok(Self::Design),
            other => Err(TxError::InvalidEnum {
                field: "doc_kind",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocStatus {
    #[default]
    Changing,
    Locked,
}

impl DocStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Changing => "changing",
            Self::Locked => "locked",
        }
    }
}

impl std::fmt::Display for DocStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DocStatus {
    type Err = TxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "changing" => Ok(Self::Changing),
            "locked" => Ok(Self::Locked),
            other => Err(TxError::InvalidEnum {
                field: "doc_status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Doc {
    pub id: i64,
    pub hash: String,
    pub kind: DocKind,
    pub name: String,
    pub title: String,
    pub version: i64,
    pub status: DocStatus,
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_doc_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocLinkType {
    OverviewToPrd,
    OverviewToDesign,
    PrdToDesign,
    DesignPatch,
}

impl DocLinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OverviewToPrd => "overview_to_prd",
            Self::OverviewToDesign => "overview_to_design",
            Self::PrdToDesign => "prd_to_design",
            Self::DesignPatch => "design_patch",
        }
    }
}

impl std::fmt::Display for DocLinkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DocLinkType {
    type Err = TxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "overview_to_prd" => Ok(Self::OverviewToPrd),
            "overview_to_design" => Ok(Self::OverviewToDesign),
            "prd_to_design" => Ok(Self::PrdToDesign),
            "design_patch" => Ok(Self::DesignPatch),
            other => Err(TxError::InvalidEnum {
                field: "link_type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DocLink {
    pub id: i64,
    pub from_doc_id: i64,
    pub to_doc_id: i64,
    pub link_type: DocLinkType,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskDocRelation {
    Implements,
    References,
}

impl TaskDocRelation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Implements => "implements",
            Self::References => "references",
        }
    }
}

impl std::fmt::Display for TaskDocRelation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskDocRelation {
    type Err = TxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "implements" => Ok(Self::Implements),
            "references" => Ok(Self::References),
            other => Err(TxError::InvalidEnum {
                field: "relation",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskDocLink {
    pub id: i64,
    pub task_id: TaskId,
    pub doc_id: i64,
    pub relation: TaskDocRelation,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Invariants
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Enforcement {
    IntegrationTest,
    Linter,
    LlmAsJudge,
}

impl Enforcement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IntegrationTest => "integration_test",
            Self::Linter => "linter",
            Self::LlmAsJudge => "llm_as_judge",
        }
    }
}

impl std::fmt::Display for Enforcement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Enforcement {
    type Err = TxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "integration_test" => Ok(Self::IntegrationTest),
            "linter" => Ok(Self::Linter),
            "llm_as_judge" => Ok(Self::LlmAsJudge),
            other => Err(TxError::InvalidEnum {
                field: "enforcement",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvariantStatus {
    #[default]
    Active,
    Deprecated,
}

impl InvariantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Deprecated => "deprecated",
        }
    }
}

impl std::fmt::Display for InvariantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InvariantStatus {
    type Err = TxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "deprecated" => Ok(Self::Deprecated),
            other => Err(TxError::InvalidEnum {
                field: "invariant_status",
                value: other.to_string(),
            }),
        }
    }
}

/// Check that an invariant id matches `INV-[A-Z0-9-]+`.
pub fn validate_invariant_id(id: &str) -> bool {
    let Some(rest) = id.strip_prefix("INV-") else {
        return false;
    };
    !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'-')
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Invariant {
    pub id: String,
    pub rule: String,
    pub enforcement: Enforcement,
    pub doc_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsystem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lint_rule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_ref: Option<String>,
    pub status: InvariantStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InvariantCheck {
    pub id: i64,
    pub invariant_id: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub checked_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = TxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TxError::InvalidEnum {
                field: "run_status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_injected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

// ---------------------------------------------------------------------------
// Workers & claims
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Starting,
    Idle,
    Busy,
    Stopping,
    Dead,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Stopping => "stopping",
            Self::Dead => "dead",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = TxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "stopping" => Ok(Self::Stopping),
            "dead" => Ok(Self::Dead),
            other => Err(TxError::InvalidEnum {
                field: "worker_status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    pub hostname: String,
    pub pid: u32,
    pub capabilities: Vec<String>,
    pub status: WorkerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<TaskId>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    #[default]
    Active,
    Released,
    Expired,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Released => "released",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ClaimStatus {
    type Err = TxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "released" => Ok(Self::Released),
            "expired" => Ok(Self::Expired),
            other => Err(TxError::InvalidEnum {
                field: "claim_status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskClaim {
    pub id: i64,
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub claimed_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
    pub renewed_count: i64,
    pub status: ClaimStatus,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Event {
    pub id: i64,
    pub event_type: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&Status::Backlog).unwrap();
        assert_eq!(json, r#""backlog""#);
        let back: Status = serde_json::from_str(r#""cancelled""#).unwrap();
        assert_eq!(back, Status::Cancelled);
    }

    #[test]
    fn done_is_terminal() {
        for to in [
            Status::Backlog,
            Status::Ready,
            Status::Planning,
            Status::Active,
            Status::Review,
            Status::Cancelled,
        ] {
            assert!(!Status::Done.can_transition(to));
        }
    }

    #[test]
    fn cancelled_only_returns_to_backlog() {
        assert!(Status::Cancelled.can_transition(Status::Backlog));
        assert!(!Status::Cancelled.can_transition(Status::Active));
        assert!(!Status::Cancelled.can_transition(Status::Done));
    }

    #[test]
    fn active_may_step_back_to_ready() {
        assert!(Status::Active.can_transition(Status::Ready));
        assert!(!Status::Active.can_transition(Status::Backlog));
        assert!(!Status::Active.can_transition(Status::Planning));
    }

    #[test]
    fn workable_statuses() {
        assert!(Status::Backlog.is_workable());
        assert!(Status::Ready.is_workable());
        assert!(Status::Planning.is_workable());
        assert!(!Status::Active.is_workable());
        assert!(!Status::Done.is_workable());
    }

    #[test]
    fn invariant_id_pattern() {
        assert!(validate_invariant_id("INV-ORD-1"));
        assert!(validate_invariant_id("INV-42"));
        assert!(!validate_invariant_id("INV-"));
        assert!(!validate_invariant_id("inv-sync"));
        assert!(!validate_invariant_id("INV-lower"));
        assert!(!validate_invariant_id("ORD-1"));
    }

    #[test]
    fn task_round_trips_json() {
        let now = Utc::now();
        let task = Task {
            id: "tx-0011aabb".parse().unwrap(),
            title: "Port the sync codec".into(),
            description: "JSONL with LWW merge".into(),
            status: Status::Backlog,
            parent_id: None,
            score: DEFAULT_TASK_SCORE,
            assignee_type: Some(AssigneeType::Agent),
            assignee_id: Some("agent-7".into()),
            assigned_at: Some(now),
            assigned_by: Some("cli".into()),
            created_at: now,
            updated_at: now,
            completed_at: None,
            metadata: Metadata::new(),
        };
        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back, task);
        assert!(!json.contains("completed_at"));
    }
}
