use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::error::{Result, TxError};
use crate::ids::TaskId;
use crate::model::{AssigneeType, DEFAULT_TASK_SCORE, Dependency, Metadata, Status, Task};
use crate::store::{
    Store, fmt_dt, metadata_to_string, now_rfc3339, parse_dt, parse_dt_opt, parse_metadata,
};

const ID_ALLOC_ATTEMPTS: u32 = 16;

#[derive(Debug, Default, Clone)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub parent_id: Option<TaskId>,
    pub score: Option<i64>,
    pub metadata: Metadata,
}

#[derive(Debug, Default, Clone)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<Status>,
    pub score: Option<i64>,
    pub parent_id: Option<Option<TaskId>>,
    pub assignee_type: Option<Option<AssigneeType>>,
    pub assignee_id: Option<Option<String>>,
    pub assigned_by: Option<String>,
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Default, Clone)]
pub struct TaskFilter {
    pub status: Option<Status>,
    pub search: Option<String>,
}

/// One page of the score-ordered task listing. The cursor key is
/// `(score DESC, id ASC)`; `next` carries the last row's key.
#[derive(Debug, Clone)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub has_more: bool,
    pub total: i64,
    pub next: Option<(i64, TaskId)>,
}

/// A task plus its immediate graph neighborhood.
#[derive(Debug, Clone)]
pub struct TaskNeighborhood {
    pub task: Task,
    pub blockers: Vec<Task>,
    pub blocked: Vec<Task>,
    pub children: Vec<Task>,
}

impl Store {
    pub fn create_task(&self, new: NewTask) -> Result<Task> {
        let title = new.title.trim().to_string();
        if title.is_empty() {
            return Err(TxError::EmptyTitle);
        }

        let task = self.transaction(|conn| {
            if let Some(parent) = &new.parent_id
                && get_task_tx(conn, parent)?.is_none()
            {
                return Err(TxError::ParentNotFound(parent.clone()));
            }

            let id = allocate_task_id(conn)?;
            let now = now_rfc3339();
            conn.execute(
                "INSERT INTO tasks (id, title, description, status, parent_id, score,
                                    created_at, updated_at, metadata)
                 VALUES (?1, ?2, ?3, 'backlog', ?4, ?5, ?6, ?6, ?7)",
                params![
                    id,
                    title,
                    new.description,
                    new.parent_id,
                    new.score.unwrap_or(DEFAULT_TASK_SCORE),
                    now,
                    metadata_to_string(&new.metadata),
                ],
            )?;
            require_task_tx(conn, &id)
        })?;
        self.notify_mutation();
        Ok(task)
    }

    pub fn get_task(&self, id: &TaskId) -> Result<Task> {
        self.read(|conn| require_task_tx(conn, id))
    }

    pub fn update_task(&self, id: &TaskId, update: TaskUpdate) -> Result<Task> {
        let task = self.transaction(|conn| {
            let current = require_task_tx(conn, id)?;
            let now = Utc::now();

            if let Some(title) = &update.title {
                let title = title.trim();
                if title.is_empty() {
                    return Err(TxError::EmptyTitle);
                }
                conn.execute(
                    "UPDATE tasks SET title = ?2 WHERE id = ?1",
                    params![id, title],
                )?;
            }
            if let Some(description) = &update.description {
                conn.execute(
                    "UPDATE tasks SET description = ?2 WHERE id = ?1",
                    params![id, description],
                )?;
            }
            if let Some(status) = update.status {
                apply_status_tx(conn, &current, status, now)?;
            }
            if let Some(score) = update.score {
                conn.execute(
                    "UPDATE tasks SET score = ?2 WHERE id = ?1",
                    params![id, score],
                )?;
            }
            if let Some(parent) = &update.parent_id {
                if let Some(parent_id) = parent {
                    if get_task_tx(conn, parent_id)?.is_none() {
                        return Err(TxError::ParentNotFound(parent_id.clone()));
                    }
                }
                conn.execute(
                    "UPDATE tasks SET parent_id = ?2 WHERE id = ?1",
                    params![id, parent],
                )?;
            }
            if let Some(assignee_type) = &update.assignee_type {
                conn.execute(
                    "UPDATE tasks SET assignee_type = ?2 WHERE id = ?1",
                    params![id, assignee_type.map(|a| a.as_str())],
                )?;
            }
            if let Some(assignee_id) = &update.assignee_id {
                let assigned_at = assignee_id.as_ref().map(|_| fmt_dt(now));
                conn.execute(
                    "UPDATE tasks SET assignee_id = ?2, assigned_at = ?3, assigned_by = ?4
                     WHERE id = ?1",
                    params![id, assignee_id, assigned_at, update.assigned_by],
                )?;
            }
            if let Some(metadata) = &update.metadata {
                conn.execute(
                    "UPDATE tasks SET metadata = ?2 WHERE id = ?1",
                    params![id, metadata_to_string(metadata)],
                )?;
            }

            conn.execute(
                "UPDATE tasks SET updated_at = ?2 WHERE id = ?1",
                params![id, fmt_dt(now)],
            )?;
            require_task_tx(conn, id)
        })?;
        self.notify_mutation();
        Ok(task)
    }

    /// Delete a task. Refused while other tasks depend on it or list it as
    /// parent; the task's own blocker rows cascade.
    pub fn delete_task(&self, id: &TaskId) -> Result<()> {
        self.transaction(|conn| {
            require_task_tx(conn, id)?;

            let dependents: i64 = conn.query_row(
                "SELECT COUNT(*) FROM dependencies WHERE blocker_id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            let children: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tasks WHERE parent_id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            if dependents > 0 || children > 0 {
                return Err(TxError::TaskInUse(id.clone()));
            }

            conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
            Ok(())
        })?;
        self.notify_mutation();
        Ok(())
    }

    pub fn list_tasks(
        &self,
        filter: &TaskFilter,
        cursor: Option<(i64, TaskId)>,
        limit: usize,
    ) -> Result<TaskPage> {
        self.read(|conn| {
            let mut conditions: Vec<String> = Vec::new();
            let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
            let mut idx = 1;

            if let Some(status) = filter.status {
                conditions.push(format!("status = ?{idx}"));
                values.push(Box::new(status.as_str().to_string()));
                idx += 1;
            }
            if let Some(search) = &filter.search {
                let needle = format!("%{}%", search);
                conditions.push(format!("(title LIKE ?{idx} OR description LIKE ?{})", idx + 1));
                values.push(Box::new(needle.clone()));
                values.push(Box::new(needle));
                idx += 2;
            }

            let base_where = if conditions.is_empty() {
                String::new()
            } else {
                format!(" WHERE {}", conditions.join(" AND "))
            };

            let total: i64 = {
                let sql = format!("SELECT COUNT(*) FROM tasks{base_where}");
                let params_slice: Vec<&dyn rusqlite::types::ToSql> =
                    values.iter().map(|p| p.as_ref()).collect();
                conn.query_row(&sql, params_slice.as_slice(), |row| row.get(0))?
            };

            if let Some((score, id)) = &cursor {
                conditions.push(format!(
                    "(score < ?{idx} OR (score = ?{idx} AND id > ?{}))",
                    idx + 1
                ));
                values.push(Box::new(*score));
                values.push(Box::new(id.as_str().to_string()));
            }

            let where_clause = if conditions.is_empty() {
                String::new()
            } else {
                format!(" WHERE {}", conditions.join(" AND "))
            };
            let sql = format!(
                "SELECT {TASK_COLUMNS} FROM tasks{where_clause}
                 ORDER BY score DESC, id ASC LIMIT {}",
                limit + 1
            );
            let params_slice: Vec<&dyn rusqlite::types::ToSql> =
                values.iter().map(|p| p.as_ref()).collect();

            let mut stmt = conn.prepare_cached(&sql)?;
            let mut tasks: Vec<Task> = stmt
                .query_map(params_slice.as_slice(), read_task)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let has_more = tasks.len() > limit;
            tasks.truncate(limit);
            let next = if has_more {
                tasks.last().map(|t| (t.score, t.id.clone()))
            } else {
                None
            };

            Ok(TaskPage {
                tasks,
                has_more,
                total,
                next,
            })
        })
    }

    /// Tasks in a workable status whose blockers are all done.
    pub fn ready_tasks(&self) -> Result<Vec<Task>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks t
                 WHERE t.status IN ('backlog', 'ready', 'planning')
                   AND NOT EXISTS (
                     SELECT 1 FROM dependencies d
                     JOIN tasks b ON b.id = d.blocker_id
                     WHERE d.blocked_id = t.id AND b.status != 'done'
                   )
                 ORDER BY t.score DESC, t.id ASC"
            ))?;
            let tasks = stmt
                .query_map([], read_task)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
    }

    pub fn task_neighborhood(&self, id: &TaskId) -> Result<TaskNeighborhood> {
        self.read(|conn| {
            let task = require_task_tx(conn, id)?;

            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE id IN (SELECT blocker_id FROM dependencies WHERE blocked_id = ?1)
                 ORDER BY id"
            ))?;
            let blockers = stmt
                .query_map(params![id], read_task)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE id IN (SELECT blocked_id FROM dependencies WHERE blocker_id = ?1)
                 ORDER BY id"
            ))?;
            let blocked = stmt
                .query_map(params![id], read_task)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE parent_id = ?1 ORDER BY id"
            ))?;
            let children = stmt
                .query_map(params![id], read_task)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(TaskNeighborhood {
                task,
                blockers,
                blocked,
                children,
            })
        })
    }

    /// Counts per status over all live tasks.
    pub fn status_counts(&self) -> Result<HashMap<String, i64>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut counts = HashMap::new();
            for row in rows {
                let (status, count) = row?;
                counts.insert(status, count);
            }
            Ok(counts)
        })
    }

    // -----------------------------------------------------------------------
    // Dependencies
    // -----------------------------------------------------------------------

    pub fn add_dependency(&self, blocker: &TaskId, blocked: &TaskId) -> Result<Dependency> {
        let dep = self.transaction(|conn| {
            require_task_tx(conn, blocker)?;
            require_task_tx(conn, blocked)?;

            if blocker == blocked || dependency_closes_cycle(conn, blocker, blocked)? {
                return Err(TxError::CircularDependency {
                    blocker: blocker.clone(),
                    blocked: blocked.clone(),
                });
            }

            let now = now_rfc3339();
            conn.execute(
                "INSERT OR IGNORE INTO dependencies (blocker_id, blocked_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![blocker, blocked, now],
            )?;

            Ok(Dependency {
                blocker_id: blocker.clone(),
                blocked_id: blocked.clone(),
                created_at: parse_dt(&now),
            })
        })?;
        self.notify_mutation();
        Ok(dep)
    }

    pub fn remove_dependency(&self, blocker: &TaskId, blocked: &TaskId) -> Result<()> {
        self.transaction(|conn| {
            conn.execute(
                "DELETE FROM dependencies WHERE blocker_id = ?1 AND blocked_id = ?2",
                params![blocker, blocked],
            )?;
            Ok(())
        })?;
        self.notify_mutation();
        Ok(())
    }

    /// Blockers of `id` (tasks it depends on).
    pub fn blockers_of(&self, id: &TaskId) -> Result<Vec<Task>> {
        Ok(self.task_neighborhood(id)?.blockers)
    }

    /// All dependency rows, ordered by (blocker, blocked) for stable export.
    pub fn all_dependencies(&self) -> Result<Vec<Dependency>> {
        self.read(|conn| all_dependencies_tx(conn))
    }

    /// All live tasks ordered by id, for stable export.
    pub fn all_tasks(&self) -> Result<Vec<Task>> {
        self.read(|conn| all_tasks_tx(conn))
    }

    pub fn task_count(&self) -> Result<i64> {
        self.read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?))
    }

    /// A task is ready when it is workable and every blocker is done.
    pub fn is_ready(&self, id: &TaskId) -> Result<bool> {
        self.read(|conn| {
            let task = require_task_tx(conn, id)?;
            if !task.status.is_workable() {
                return Ok(false);
            }
            let unfinished: i64 = conn.query_row(
                "SELECT COUNT(*) FROM dependencies d
                 JOIN tasks b ON b.id = d.blocker_id
                 WHERE d.blocked_id = ?1 AND b.status != 'done'",
                params![id],
                |row| row.get(0),
            )?;
            Ok(unfinished == 0)
        })
    }
}

// ---------------------------------------------------------------------------
// Row-level helpers shared with the sync codec (same-transaction reuse)
// ---------------------------------------------------------------------------

pub(crate) const TASK_COLUMNS: &str = "id, title, description, status, parent_id, score, \
     assignee_type, assignee_id, assigned_at, assigned_by, \
     created_at, updated_at, completed_at, metadata";

pub(crate) fn read_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(3)?;
    let assignee_type: Option<String> = row.get(6)?;
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: status.parse().unwrap_or_default(),
        parent_id: row.get(4)?,
        score: row.get(5)?,
        assignee_type: assignee_type.and_then(|s| s.parse::<AssigneeType>().ok()),
        assignee_id: row.get(7)?,
        assigned_at: parse_dt_opt(row.get(8)?),
        assigned_by: row.get(9)?,
        created_at: parse_dt(&row.get::<_, String>(10)?),
        updated_at: parse_dt(&row.get::<_, String>(11)?),
        completed_at: parse_dt_opt(row.get(12)?),
        metadata: parse_metadata(&row.get::<_, String>(13)?),
    })
}

pub(crate) fn get_task_tx(conn: &Connection, id: &TaskId) -> Result<Option<Task>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))?;
    let task = stmt.query_row(params![id], read_task).optional()?;
    Ok(task)
}

pub(crate) fn require_task_tx(conn: &Connection, id: &TaskId) -> Result<Task> {
    get_task_tx(conn, id)?.ok_or_else(|| TxError::TaskNotFound(id.clone()))
}

pub(crate) fn all_tasks_tx(conn: &Connection) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY id ASC"))?;
    let tasks = stmt
        .query_map([], read_task)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(tasks)
}

pub(crate) fn all_dependencies_tx(conn: &Connection) -> Result<Vec<Dependency>> {
    let mut stmt = conn.prepare_cached(
        "SELECT blocker_id, blocked_id, created_at FROM dependencies
         ORDER BY blocker_id ASC, blocked_id ASC",
    )?;
    let deps = stmt
        .query_map([], |row| {
            Ok(Dependency {
                blocker_id: row.get(0)?,
                blocked_id: row.get(1)?,
                created_at: parse_dt(&row.get::<_, String>(2)?),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(deps)
}

/// Full upsert used by the sync import path: bypasses the state machine and
/// writes timestamps as carried by the operation.
pub(crate) fn upsert_task_tx(conn: &Connection, task: &Task) -> Result<()> {
    conn.execute(
        "INSERT INTO tasks (id, title, description, status, parent_id, score,
                            assignee_type, assignee_id, assigned_at, assigned_by,
                            created_at, updated_at, completed_at, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(id) DO UPDATE SET
            title = ?2, description = ?3, status = ?4, parent_id = ?5, score = ?6,
            assignee_type = ?7, assignee_id = ?8, assigned_at = ?9, assigned_by = ?10,
            created_at = ?11, updated_at = ?12, completed_at = ?13, metadata = ?14",
        params![
            task.id,
            task.title,
            task.description,
            task.status.as_str(),
            task.parent_id,
            task.score,
            task.assignee_type.map(|a| a.as_str()),
            task.assignee_id,
            task.assigned_at.map(fmt_dt),
            task.assigned_by,
            fmt_dt(task.created_at),
            fmt_dt(task.updated_at),
            task.completed_at.map(fmt_dt),
            metadata_to_string(&task.metadata),
        ],
    )?;
    Ok(())
}

pub(crate) fn delete_task_tx(conn: &Connection, id: &TaskId) -> Result<bool> {
    let changes = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
    Ok(changes > 0)
}

pub(crate) fn upsert_dependency_tx(conn: &Connection, dep: &Dependency) -> Result<()> {
    conn.execute(
        "INSERT INTO dependencies (blocker_id, blocked_id, created_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(blocker_id, blocked_id) DO UPDATE SET created_at = ?3",
        params![dep.blocker_id, dep.blocked_id, fmt_dt(dep.created_at)],
    )?;
    Ok(())
}

pub(crate) fn delete_dependency_tx(
    conn: &Connection,
    blocker: &TaskId,
    blocked: &TaskId,
) -> Result<bool> {
    let changes = conn.execute(
        "DELETE FROM dependencies WHERE blocker_id = ?1 AND blocked_id = ?2",
        params![blocker, blocked],
    )?;
    Ok(changes > 0)
}

fn allocate_task_id(conn: &Connection) -> Result<TaskId> {
    for _ in 0..ID_ALLOC_ATTEMPTS {
        let id = TaskId::generate().map_err(|e| TxError::Config(e.to_string()))?;
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Ok(id);
        }
    }
    Err(TxError::IdExhausted(ID_ALLOC_ATTEMPTS))
}

fn apply_status_tx(
    conn: &Connection,
    current: &Task,
    status: Status,
    now: DateTime<Utc>,
) -> Result<()> {
    if status == current.status {
        return Ok(());
    }
    if !current.status.can_transition(status) {
        return Err(TxError::InvalidTransition(
            current.status.to_string(),
            status.to_string(),
        ));
    }
    let completed_at = if status == Status::Done {
        Some(fmt_dt(now))
    } else {
        None
    };
    conn.execute(
        "UPDATE tasks SET status = ?2, completed_at = ?3 WHERE id = ?1",
        params![current.id, status.as_str(), completed_at],
    )?;
    Ok(())
}

/// Iterative BFS from `blocked` over blocks-edges. Reaching `blocker` means
/// the new edge would close a loop.
fn dependency_closes_cycle(conn: &Connection, blocker: &TaskId, blocked: &TaskId) -> Result<bool> {
    let mut stmt = conn.prepare_cached("SELECT blocked_id FROM dependencies WHERE blocker_id = ?1")?;
    let mut visited: HashSet<TaskId> = HashSet::new();
    let mut queue: VecDeque<TaskId> = VecDeque::new();
    queue.push_back(blocked.clone());

    while let Some(current) = queue.pop_front() {
        if &current == blocker {
            return Ok(true);
        }
        if !visited.insert(current.clone()) {
            continue;
        }
        let next: Vec<TaskId> = stmt
            .query_map(params![current], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        queue.extend(next);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_memory().unwrap()
    }

    fn quick_task(store: &Store, title: &str) -> Task {
        store
            .create_task(NewTask {
                title: title.into(),
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn create_assigns_prefixed_id_and_defaults() {
        let store = store();
        let task = quick_task(&store, "First");
        assert!(task.id.as_str().starts_with("tx-"));
        assert_eq!(task.status, Status::Backlog);
        assert_eq!(task.score, DEFAULT_TASK_SCORE);
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn create_rejects_empty_title() {
        let store = store();
        let err = store
            .create_task(NewTask {
                title: "   ".into(),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.code(), "empty_title");
    }

    #[test]
    fn create_rejects_missing_parent() {
        let store = store();
        let ghost: TaskId = "tx-deadbeef".parse().unwrap();
        let err = store
            .create_task(NewTask {
                title: "Child".into(),
                parent_id: Some(ghost),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.code(), "parent_not_found");
    }

    #[test]
    fn status_walks_the_state_machine() {
        let store = store();
        let task = quick_task(&store, "t1");

        let task = store
            .update_task(
                &task.id,
                TaskUpdate {
                    status: Some(Status::Active),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(task.status, Status::Active);

        let task = store
            .update_task(
                &task.id,
                TaskUpdate {
                    status: Some(Status::Done),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(task.status, Status::Done);
        assert!(task.completed_at.is_some());

        let err = store
            .update_task(
                &task.id,
                TaskUpdate {
                    status: Some(Status::Backlog),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), "invalid_transition");
    }

    #[test]
    fn completed_at_set_exactly_on_done() {
        let store = store();
        let task = quick_task(&store, "t");
        let task = store
            .update_task(
                &task.id,
                TaskUpdate {
                    status: Some(Status::Active),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(task.completed_at.is_none());

        let task = store
            .update_task(
                &task.id,
                TaskUpdate {
                    status: Some(Status::Review),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(task.completed_at.is_none());

        let task = store
            .update_task(
                &task.id,
                TaskUpdate {
                    status: Some(Status::Done),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn cycle_insertion_rejected() {
        let store = store();
        let a = quick_task(&store, "A");
        let b = quick_task(&store, "B");

        store.add_dependency(&a.id, &b.id).unwrap();
        let err = store.add_dependency(&b.id, &a.id).unwrap_err();
        assert_eq!(err.code(), "circular_dependency");
    }

    #[test]
    fn transitive_cycle_rejected() {
        let store = store();
        let a = quick_task(&store, "A");
        let b = quick_task(&store, "B");
        let c = quick_task(&store, "C");

        store.add_dependency(&a.id, &b.id).unwrap();
        store.add_dependency(&b.id, &c.id).unwrap();
        let err = store.add_dependency(&c.id, &a.id).unwrap_err();
        assert_eq!(err.code(), "circular_dependency");
    }

    #[test]
    fn self_dependency_rejected() {
        let store = store();
        let a = quick_task(&store, "A");
        let err = store.add_dependency(&a.id, &a.id).unwrap_err();
        assert_eq!(err.code(), "circular_dependency");
    }

    #[test]
    fn delete_refused_while_dependents_exist() {
        let store = store();
        let a = quick_task(&store, "A");
        let b = quick_task(&store, "B");
        store.add_dependency(&a.id, &b.id).unwrap();

        let err = store.delete_task(&a.id).unwrap_err();
        assert_eq!(err.code(), "task_in_use");

        store.remove_dependency(&a.id, &b.id).unwrap();
        store.delete_task(&a.id).unwrap();
        assert!(store.get_task(&a.id).is_err());
    }

    #[test]
    fn delete_cascades_own_blocker_rows() {
        let store = store();
        let a = quick_task(&store, "A");
        let b = quick_task(&store, "B");
        store.add_dependency(&a.id, &b.id).unwrap();

        // b depends on a; deleting b is fine and removes the dep row.
        store.delete_task(&b.id).unwrap();
        assert!(store.all_dependencies().unwrap().is_empty());
    }

    #[test]
    fn ready_requires_all_blockers_done() {
        let store = store();
        let blocker = quick_task(&store, "blocker");
        let blocked = quick_task(&store, "blocked");
        store.add_dependency(&blocker.id, &blocked.id).unwrap();

        assert!(!store.is_ready(&blocked.id).unwrap());
        let ready_ids: Vec<_> = store.ready_tasks().unwrap().into_iter().map(|t| t.id).collect();
        assert!(ready_ids.contains(&blocker.id));
        assert!(!ready_ids.contains(&blocked.id));

        store
            .update_task(
                &blocker.id,
                TaskUpdate {
                    status: Some(Status::Active),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .update_task(
                &blocker.id,
                TaskUpdate {
                    status: Some(Status::Done),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(store.is_ready(&blocked.id).unwrap());
    }

    #[test]
    fn list_pages_by_score_then_id() {
        let store = store();
        for i in 0..5 {
            store
                .create_task(NewTask {
                    title: format!("task {i}"),
                    score: Some(100 * i),
                    ..Default::default()
                })
                .unwrap();
        }

        let first = store.list_tasks(&TaskFilter::default(), None, 2).unwrap();
        assert_eq!(first.tasks.len(), 2);
        assert!(first.has_more);
        assert_eq!(first.total, 5);
        assert_eq!(first.tasks[0].score, 400);

        let cursor = first.next.clone().unwrap();
        let second = store
            .list_tasks(&TaskFilter::default(), Some(cursor), 2)
            .unwrap();
        assert_eq!(second.tasks.len(), 2);
        assert!(second.tasks[0].score <= first.tasks[1].score);

        let cursor = second.next.clone().unwrap();
        let third = store
            .list_tasks(&TaskFilter::default(), Some(cursor), 2)
            .unwrap();
        assert_eq!(third.tasks.len(), 1);
        assert!(!third.has_more);
        assert!(third.next.is_none());
    }

    #[test]
    fn equal_scores_page_by_id_ascending() {
        let store = store();
        for i in 0..4 {
            store
                .create_task(NewTask {
                    title: format!("tied {i}"),
                    ..Default::default()
                })
                .unwrap();
        }

        let first = store.list_tasks(&TaskFilter::default(), None, 2).unwrap();
        let cursor = first.next.clone().unwrap();
        let second = store
            .list_tasks(&TaskFilter::default(), Some(cursor), 2)
            .unwrap();

        let mut seen: Vec<String> = first
            .tasks
            .iter()
            .chain(second.tasks.iter())
            .map(|t| t.id.as_str().to_string())
            .collect();
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen.len(), 4);
        seen.dedup();
        assert_eq!(seen.len(), 4, "pagination must not repeat rows");
        assert_eq!(seen, sorted, "equal scores pages in id order");
    }

    #[test]
    fn list_filters_by_status_and_search() {
        let store = store();
        let a = quick_task(&store, "searchable alpha");
        quick_task(&store, "other beta");
        store
            .update_task(
                &a.id,
                TaskUpdate {
                    status: Some(Status::Active),
                    ..Default::default()
                },
            )
            .unwrap();

        let page = store
            .list_tasks(
                &TaskFilter {
                    status: Some(Status::Active),
                    search: None,
                },
                None,
                20,
            )
            .unwrap();
        assert_eq!(page.tasks.len(), 1);
        assert_eq!(page.tasks[0].id, a.id);

        let page = store
            .list_tasks(
                &TaskFilter {
                    status: None,
                    search: Some("alpha".into()),
                },
                None,
                20,
            )
            .unwrap();
        assert_eq!(page.tasks.len(), 1);
        assert_eq!(page.tasks[0].id, a.id);
    }

    #[test]
    fn neighborhood_collects_relations() {
        let store = store();
        let parent = quick_task(&store, "parent");
        let child = store
            .create_task(NewTask {
                title: "child".into(),
                parent_id: Some(parent.id.clone()),
                ..Default::default()
            })
            .unwrap();
        let blocker = quick_task(&store, "blocker");
        store.add_dependency(&blocker.id, &parent.id).unwrap();
        let downstream = quick_task(&store, "downstream");
        store.add_dependency(&parent.id, &downstream.id).unwrap();

        let hood = store.task_neighborhood(&parent.id).unwrap();
        assert_eq!(hood.task.id, parent.id);
        assert_eq!(hood.blockers.len(), 1);
        assert_eq!(hood.blockers[0].id, blocker.id);
        assert_eq!(hood.blocked.len(), 1);
        assert_eq!(hood.blocked[0].id, downstream.id);
        assert_eq!(hood.children.len(), 1);
        assert_eq!(hood.children[0].id, child.id);
    }

    #[test]
    fn update_assignment_records_timestamps() {
        let store = store();
        let task = quick_task(&store, "assignable");
        let task = store
            .update_task(
                &task.id,
                TaskUpdate {
                    assignee_type: Some(Some(AssigneeType::Agent)),
                    assignee_id: Some(Some("agent-9".into())),
                    assigned_by: Some("dashboard".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(task.assignee_type, Some(AssigneeType::Agent));
        assert_eq!(task.assignee_id.as_deref(), Some("agent-9"));
        assert!(task.assigned_at.is_some());
        assert_eq!(task.assigned_by.as_deref(), Some("dashboard"));
    }
}
