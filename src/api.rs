use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{ErrorKind, TxError};
use crate::ids::{RunId, TaskId};
use crate::model::{Run, Task};
use crate::store::runs::RunPage;
use crate::store::tasks::TaskPage;

pub const MAX_PAGE_LIMIT: usize = 100;
pub const DEFAULT_PAGE_LIMIT: usize = 20;

/// Wire-level error tags; serialized as `_tag` exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorTag {
    NotFound,
    BadRequest,
    Unauthorized,
    Forbidden,
    ServiceUnavailable,
    InternalError,
}

impl ErrorTag {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::ServiceUnavailable => 503,
            Self::InternalError => 500,
        }
    }
}

/// Uniform API error payload `{_tag, message}`.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    #[serde(rename = "_tag")]
    pub tag: ErrorTag,
    pub message: String,
}

impl ApiError {
    pub fn unauthorized() -> Self {
        Self {
            tag: ErrorTag::Unauthorized,
            message: "Unauthorized".to_string(),
        }
    }

    pub fn forbidden() -> Self {
        Self {
            tag: ErrorTag::Forbidden,
            message: "Forbidden".to_string(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            tag: ErrorTag::BadRequest,
            message: message.into(),
        }
    }

    pub fn http_status(&self) -> u16 {
        self.tag.http_status()
    }
}

/// Internal tagged errors to the wire shape. Database/IO and anything
/// unclassified are redacted; the concrete error is logged, not leaked.
impl From<TxError> for ApiError {
    fn from(err: TxError) -> Self {
        let tag = match err.kind() {
            ErrorKind::NotFound => ErrorTag::NotFound,
            ErrorKind::Validation | ErrorKind::ClaimConflict => ErrorTag::BadRequest,
            ErrorKind::ServiceUnavailable => ErrorTag::ServiceUnavailable,
            ErrorKind::Database | ErrorKind::Io => ErrorTag::InternalError,
        };
        let message = match tag {
            ErrorTag::InternalError => {
                tracing::error!(code = err.code(), error = %err, "internal error");
                "Internal server error".to_string()
            }
            _ => err.to_string(),
        };
        Self { tag, message }
    }
}

/// Shared-secret auth: enabled iff the configured key is non-empty. Health
/// endpoints skip this check at the HTTP layer.
pub fn authorize(configured: Option<&str>, presented: Option<&str>) -> Result<(), ApiError> {
    match configured {
        None | Some("") => Ok(()),
        Some(expected) if presented == Some(expected) => Ok(()),
        Some(_) => Err(ApiError::unauthorized()),
    }
}

pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
}

// ---------------------------------------------------------------------------
// Cursors
// ---------------------------------------------------------------------------

/// Task cursor: `"{score}:{taskId}"`, for the (score DESC, id ASC) ordering.
pub fn encode_task_cursor(score: i64, id: &TaskId) -> String {
    format!("{score}:{id}")
}

pub fn decode_task_cursor(cursor: &str) -> Result<(i64, TaskId), TxError> {
    let (score, id) = cursor
        .split_once(':')
        .ok_or_else(|| TxError::InvalidCursor(cursor.to_string()))?;
    let score: i64 = score
        .parse()
        .map_err(|_| TxError::InvalidCursor(cursor.to_string()))?;
    let id: TaskId = id
        .parse()
        .map_err(|_| TxError::InvalidCursor(cursor.to_string()))?;
    Ok((score, id))
}

/// Run cursor: `"{startedAtISO}:{runId}"`. The timestamp itself contains
/// colons, so the run id is split off the tail.
pub fn encode_run_cursor(started_at: DateTime<Utc>, id: &RunId) -> String {
    format!("{}:{id}", crate::store::fmt_dt(started_at))
}

pub fn decode_run_cursor(cursor: &str) -> Result<(DateTime<Utc>, RunId), TxError> {
    let (ts, id) = cursor
        .rsplit_once(':')
        .ok_or_else(|| TxError::InvalidCursor(cursor.to_string()))?;
    let started_at = DateTime::parse_from_rfc3339(ts)
        .map_err(|_| TxError::InvalidCursor(cursor.to_string()))?
        .with_timezone(&Utc);
    let id: RunId = id
        .parse()
        .map_err(|_| TxError::InvalidCursor(cursor.to_string()))?;
    Ok((started_at, id))
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<Task>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub has_more: bool,
    pub total: i64,
    pub summary: HashMap<String, i64>,
}

impl TaskListResponse {
    pub fn from_page(page: TaskPage, summary: HashMap<String, i64>) -> Self {
        let next_cursor = page
            .next
            .as_ref()
            .map(|(score, id)| encode_task_cursor(*score, id));
        Self {
            tasks: page.tasks,
            next_cursor,
            has_more: page.has_more,
            total: page.total,
            summary,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunListResponse {
    pub runs: Vec<Run>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub has_more: bool,
    pub total: i64,
}

impl RunListResponse {
    pub fn from_page(page: RunPage) -> Self {
        let next_cursor = page
            .next
            .as_ref()
            .map(|(started_at, id)| encode_run_cursor(*started_at, id));
        Self {
            runs: page.runs,
            next_cursor,
            has_more: page.has_more,
            total: page.total,
        }
    }
}

/// `GET /api/tasks/:id`: the task plus its graph neighborhood.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDetailResponse {
    pub task: Task,
    pub blockers: Vec<Task>,
    pub blocked: Vec<Task>,
    pub children: Vec<Task>,
}

impl From<crate::store::tasks::TaskNeighborhood> for TaskDetailResponse {
    fn from(hood: crate::store::tasks::TaskNeighborhood) -> Self {
        Self {
            task: hood.task,
            blockers: hood.blockers,
            blocked: hood.blocked,
            children: hood.children,
        }
    }
}
