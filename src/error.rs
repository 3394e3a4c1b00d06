use thiserror::Error;

use crate::ids::TaskId;

#[derive(Debug, Error)]
pub enum TxError {
    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("run '{0}' not found")]
    RunNotFound(String),

    #[error("learning {0} not found")]
    LearningNotFound(i64),

    #[error("file learning {0} not found")]
    FileLearningNotFound(i64),

    #[error("anchor {0} not found")]
    AnchorNotFound(i64),

    #[error("doc '{0}' not found")]
    DocNotFound(String),

    #[error("worker '{0}' not found")]
    WorkerNotFound(String),

    #[error("invariant '{0}' not found")]
    InvariantNotFound(String),

    #[error("task title cannot be empty")]
    EmptyTitle,

    #[error("invalid status transition: {0} -> {1}")]
    InvalidTransition(String, String),

    #[error("invalid {field} value '{value}'")]
    InvalidEnum { field: &'static str, value: String },

    #[error("dependency cycle: {blocker} -> {blocked} would close a loop")]
    CircularDependency { blocker: TaskId, blocked: TaskId },

    #[error("task {0} is referenced by other tasks; remove dependents first")]
    TaskInUse(TaskId),

    #[error("parent task {0} not found")]
    ParentNotFound(TaskId),

    #[error("path '{0}' escapes the project root")]
    PathOutsideRoot(String),

    #[error("invalid invariant id '{0}' (expected INV-[A-Z0-9-]+)")]
    InvalidInvariantId(String),

    #[error("doc '{name}' is locked (version {version})")]
    DocLocked { name: String, version: i64 },

    #[error("doc '{name}' must be locked before versioning")]
    DocNotLocked { name: String },

    #[error("anchor {id}: {reason}")]
    InvalidAnchor { id: i64, reason: String },

    #[error("task {task} is claimed by worker '{holder}' until {expires_at}")]
    ClaimConflict {
        task: TaskId,
        holder: String,
        expires_at: String,
    },

    #[error("no active claim on task {0} held by worker '{1}'")]
    ClaimNotHeld(TaskId, String),

    #[error("claim on task {0} reached the renewal cap")]
    RenewalCapExceeded(TaskId),

    #[error("{0} backend unavailable")]
    ServiceUnavailable(&'static str),

    #[error("could not allocate a fresh task id after {0} attempts")]
    IdExhausted(u32),

    #[error("migration {version} failed: {message}")]
    Migration { version: i64, message: String },

    #[error("locked by another process: {0}")]
    Locked(String),

    #[error("invalid cursor '{0}'")]
    InvalidCursor(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

/// Coarse grouping used by the API boundary to pick a wire tag and status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    ClaimConflict,
    ServiceUnavailable,
    Database,
    Io,
}

impl TxError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::TaskNotFound(_) => "task_not_found",
            Self::RunNotFound(_) => "run_not_found",
            Self::LearningNotFound(_) => "learning_not_found",
            Self::FileLearningNotFound(_) => "file_learning_not_found",
            Self::AnchorNotFound(_) => "anchor_not_found",
            Self::DocNotFound(_) => "doc_not_found",
            Self::WorkerNotFound(_) => "worker_not_found",
            Self::InvariantNotFound(_) => "invariant_not_found",
            Self::EmptyTitle => "empty_title",
            Self::InvalidTransition(_, _) => "invalid_transition",
            Self::InvalidEnum { .. } => "invalid_enum",
            Self::CircularDependency { .. } => "circular_dependency",
            Self::TaskInUse(_) => "task_in_use",
            Self::ParentNotFound(_) => "parent_not_found",
            Self::PathOutsideRoot(_) => "path_outside_root",
            Self::InvalidInvariantId(_) => "invalid_invariant_id",
            Self::DocLocked { .. } => "doc_locked",
            Self::DocNotLocked { .. } => "doc_not_locked",
            Self::InvalidAnchor { .. } => "invalid_anchor",
            Self::ClaimConflict { .. } => "claim_conflict",
            Self::ClaimNotHeld(_, _) => "claim_not_held",
            Self::RenewalCapExceeded(_) => "renewal_cap_exceeded",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::IdExhausted(_) => "id_exhausted",
            Self::Migration { .. } => "migration_failed",
            Self::Locked(_) => "locked",
            Self::InvalidCursor(_) => "invalid_cursor",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Yaml(_) => "yaml_error",
            Self::Db(_) => "db_error",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TaskNotFound(_)
            | Self::RunNotFound(_)
            | Self::LearningNotFound(_)
            | Self::FileLearningNotFound(_)
            | Self::AnchorNotFound(_)
            | Self::DocNotFound(_)
            | Self::WorkerNotFound(_)
            | Self::InvariantNotFound(_) => ErrorKind::NotFound,
            Self::EmptyTitle
            | Self::InvalidTransition(_, _)
            | Self::InvalidEnum { .. }
            | Self::CircularDependency { .. }
            | Self::TaskInUse(_)
            | Self::ParentNotFound(_)
            | Self::PathOutsideRoot(_)
            | Self::InvalidInvariantId(_)
            | Self::DocLocked { .. }
            | Self::DocNotLocked { .. }
            | Self::InvalidAnchor { .. }
            | Self::ClaimNotHeld(_, _)
            | Self::RenewalCapExceeded(_)
            | Self::InvalidCursor(_)
            | Self::Config(_) => ErrorKind::Validation,
            Self::ClaimConflict { .. } => ErrorKind::ClaimConflict,
            Self::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            Self::IdExhausted(_) | Self::Migration { .. } | Self::Db(_) => ErrorKind::Database,
            Self::Locked(_) | Self::Io(_) | Self::Json(_) | Self::Yaml(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, TxError>;
