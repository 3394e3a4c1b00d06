use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::error::{Result, TxError};
use crate::ids::TaskId;
use crate::model::{
    Doc, DocKind, DocLink, DocLinkType, DocStatus, Enforcement, Invariant, InvariantCheck,
    InvariantStatus, Metadata, TaskDocLink, TaskDocRelation, validate_invariant_id,
};
use crate::store::{Store, metadata_to_string, now_rfc3339, parse_dt, parse_dt_opt, parse_metadata};

#[derive(Debug, Clone)]
pub struct NewDocMeta {
    pub hash: String,
    pub kind: DocKind,
    pub name: String,
    pub title: String,
    pub version: i64,
    pub file_path: String,
    pub parent_doc_id: Option<i64>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone)]
pub struct InvariantSpec {
    pub id: String,
    pub rule: String,
    pub enforcement: Enforcement,
    pub subsystem: Option<String>,
    pub test_ref: Option<String>,
    pub lint_rule: Option<String>,
    pub prompt_ref: Option<String>,
}

impl Store {
    pub fn insert_doc_meta(&self, new: NewDocMeta) -> Result<Doc> {
        self.transaction(|conn| {
            conn.execute(
                "INSERT INTO docs (hash, kind, name, title, version, status, file_path,
                                   parent_doc_id, created_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'changing', ?6, ?7, ?8, ?9)",
                params![
                    new.hash,
                    new.kind.as_str(),
                    new.name,
                    new.title,
                    new.version,
                    new.file_path,
                    new.parent_doc_id,
                    now_rfc3339(),
                    metadata_to_string(&new.metadata),
                ],
            )?;
            let id = conn.last_insert_rowid();
            require_doc_tx(conn, id)
        })
    }

    pub fn get_doc(&self, id: i64) -> Result<Doc> {
        self.read(|conn| require_doc_tx(conn, id))
    }

    /// Latest version of a doc by name.
    pub fn get_doc_by_name(&self, name: &str) -> Result<Doc> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {DOC_COLUMNS} FROM docs WHERE name = ?1
                 ORDER BY version DESC LIMIT 1"
            ))?;
            stmt.query_row(params![name], read_doc)
                .optional()?
                .ok_or_else(|| TxError::DocNotFound(name.to_string()))
        })
    }

    pub fn list_docs(&self) -> Result<Vec<Doc>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {DOC_COLUMNS} FROM docs ORDER BY name, version"
            ))?;
            let rows = stmt
                .query_map([], read_doc)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn update_doc_meta(&self, id: i64, hash: &str, title: &str, metadata: &Metadata) -> Result<Doc> {
        self.transaction(|conn| {
            let changes = conn.execute(
                "UPDATE docs SET hash = ?2, title = ?3, metadata = ?4 WHERE id = ?1",
                params![id, hash, title, metadata_to_string(metadata)],
            )?;
            if changes == 0 {
                return Err(TxError::DocNotFound(id.to_string()));
            }
            require_doc_tx(conn, id)
        })
    }

    /// Lock a doc. Idempotent: locking a locked doc leaves `locked_at` as-is.
    pub fn lock_doc(&self, id: i64) -> Result<Doc> {
        self.transaction(|conn| {
            let doc = require_doc_tx(conn, id)?;
            if doc.status != DocStatus::Locked {
                conn.execute(
                    "UPDATE docs SET status = 'locked', locked_at = ?2 WHERE id = ?1",
                    params![id, now_rfc3339()],
                )?;
            }
            require_doc_tx(conn, id)
        })
    }

    pub fn create_doc_link(
        &self,
        from_doc_id: i64,
        to_doc_id: i64,
        link_type: DocLinkType,
    ) -> Result<DocLink> {
        self.transaction(|conn| {
            conn.execute(
                "INSERT INTO doc_links (from_doc_id, to_doc_id, link_type, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![from_doc_id, to_doc_id, link_type.as_str(), now_rfc3339()],
            )?;
            let id = conn.last_insert_rowid();
            let mut stmt = conn.prepare_cached(
                "SELECT id, from_doc_id, to_doc_id, link_type, created_at
                 FROM doc_links WHERE id = ?1",
            )?;
            Ok(stmt.query_row(params![id], read_doc_link)?)
        })
    }

    /// Links where the doc appears on either end.
    pub fn doc_links(&self, doc_id: i64) -> Result<Vec<DocLink>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, from_doc_id, to_doc_id, link_type, created_at
                 FROM doc_links WHERE from_doc_id = ?1 OR to_doc_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![doc_id], read_doc_link)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn link_task_doc(
        &self,
        task_id: &TaskId,
        doc_id: i64,
        relation: TaskDocRelation,
    ) -> Result<TaskDocLink> {
        self.transaction(|conn| {
            conn.execute(
                "INSERT INTO task_doc_links (task_id, doc_id, relation, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![task_id, doc_id, relation.as_str(), now_rfc3339()],
            )?;
            let id = conn.last_insert_rowid();
            let mut stmt = conn.prepare_cached(
                "SELECT id, task_id, doc_id, relation, created_at
                 FROM task_doc_links WHERE id = ?1",
            )?;
            Ok(stmt.query_row(params![id], read_task_doc_link)?)
        })
    }

    pub fn task_doc_links_for_doc(&self, doc_id: i64) -> Result<Vec<TaskDocLink>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, task_id, doc_id, relation, created_at
                 FROM task_doc_links WHERE doc_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![doc_id], read_task_doc_link)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -----------------------------------------------------------------------
    // Invariants
    // -----------------------------------------------------------------------

    /// Insert or replace an invariant by its stable id; re-upserting an
    /// existing id reactivates it.
    pub fn upsert_invariant(&self, doc_id: i64, spec: &InvariantSpec) -> Result<Invariant> {
        if !validate_invariant_id(&spec.id) {
            return Err(TxError::InvalidInvariantId(spec.id.clone()));
        }
        self.transaction(|conn| upsert_invariant_tx(conn, doc_id, spec))
    }

    /// Deprecate prior-active invariants of a doc that the latest sync did
    /// not mention. Rows are never deleted. Returns the deprecated count.
    pub fn deprecate_invariants_not_in(&self, doc_id: i64, keep_ids: &[String]) -> Result<usize> {
        self.transaction(|conn| deprecate_invariants_not_in_tx(conn, doc_id, keep_ids))
    }

    pub fn get_invariant(&self, id: &str) -> Result<Invariant> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {INVARIANT_COLUMNS} FROM invariants WHERE id = ?1"
            ))?;
            stmt.query_row(params![id], read_invariant)
                .optional()?
                .ok_or_else(|| TxError::InvariantNotFound(id.to_string()))
        })
    }

    pub fn invariants_for_doc(&self, doc_id: i64) -> Result<Vec<Invariant>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {INVARIANT_COLUMNS} FROM invariants WHERE doc_id = ?1 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map(params![doc_id], read_invariant)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn record_invariant_check(
        &self,
        invariant_id: &str,
        passed: bool,
        details: Option<&str>,
        duration_ms: Option<i64>,
    ) -> Result<InvariantCheck> {
        self.transaction(|conn| {
            conn.execute(
                "INSERT INTO invariant_checks (invariant_id, passed, details, checked_at, duration_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![invariant_id, passed, details, now_rfc3339(), duration_ms],
            )?;
            let id = conn.last_insert_rowid();
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {CHECK_COLUMNS} FROM invariant_checks WHERE id = ?1"
            ))?;
            Ok(stmt.query_row(params![id], read_check)?)
        })
    }

    pub fn last_invariant_check(&self, invariant_id: &str) -> Result<Option<InvariantCheck>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {CHECK_COLUMNS} FROM invariant_checks
                 WHERE invariant_id = ?1 ORDER BY id DESC LIMIT 1"
            ))?;
            Ok(stmt.query_row(params![invariant_id], read_check).optional()?)
        })
    }
}

pub(crate) fn upsert_invariant_tx(
    conn: &Connection,
    doc_id: i64,
    spec: &InvariantSpec,
) -> Result<Invariant> {
    conn.execute(
        "INSERT INTO invariants (id, rule, enforcement, doc_id, subsystem, test_ref,
                                 lint_rule, prompt_ref, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'active', ?9)
         ON CONFLICT(id) DO UPDATE SET
            rule = ?2, enforcement = ?3, doc_id = ?4, subsystem = ?5, test_ref = ?6,
            lint_rule = ?7, prompt_ref = ?8, status = 'active'",
        params![
            spec.id,
            spec.rule,
            spec.enforcement.as_str(),
            doc_id,
            spec.subsystem,
            spec.test_ref,
            spec.lint_rule,
            spec.prompt_ref,
            now_rfc3339(),
        ],
    )?;
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {INVARIANT_COLUMNS} FROM invariants WHERE id = ?1"
    ))?;
    Ok(stmt.query_row(params![spec.id], read_invariant)?)
}

pub(crate) fn deprecate_invariants_not_in_tx(
    conn: &Connection,
    doc_id: i64,
    keep_ids: &[String],
) -> Result<usize> {
    let mut stmt =
        conn.prepare_cached("SELECT id FROM invariants WHERE doc_id = ?1 AND status = 'active'")?;
    let active: Vec<String> = stmt
        .query_map(params![doc_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut deprecated = 0;
    for id in active {
        if !keep_ids.contains(&id) {
            conn.execute(
                "UPDATE invariants SET status = 'deprecated' WHERE id = ?1",
                params![id],
            )?;
            deprecated += 1;
        }
    }
    Ok(deprecated)
}

const DOC_COLUMNS: &str = "id, hash, kind, name, title, version, status, file_path, \
     parent_doc_id, created_at, locked_at, metadata";

const INVARIANT_COLUMNS: &str = "id, rule, enforcement, doc_id, subsystem, test_ref, \
     lint_rule, prompt_ref, status, created_at";

const CHECK_COLUMNS: &str = "id, invariant_id, passed, details, checked_at, duration_ms";

fn read_doc(row: &Row<'_>) -> rusqlite::Result<Doc> {
    let kind: String = row.get(2)?;
    let status: String = row.get(6)?;
    Ok(Doc {
        id: row.get(0)?,
        hash: row.get(1)?,
        kind: kind.parse().unwrap_or(DocKind::Design),
        name: row.get(3)?,
        title: row.get(4)?,
        version: row.get(5)?,
        status: status.parse().unwrap_or_default(),
        file_path: row.get(7)?,
        parent_doc_id: row.get(8)?,
        created_at: parse_dt(&row.get::<_, String>(9)?),
        locked_at: parse_dt_opt(row.get(10)?),
        metadata: parse_metadata(&row.get::<_, String>(11)?),
    })
}

fn read_doc_link(row: &Row<'_>) -> rusqlite::Result<DocLink> {
    let link_type: String = row.get(3)?;
    Ok(DocLink {
        id: row.get(0)?,
        from_doc_id: row.get(1)?,
        to_doc_id: row.get(2)?,
        link_type: link_type.parse().unwrap_or(DocLinkType::DesignPatch),
        created_at: parse_dt(&row.get::<_, String>(4)?),
    })
}

fn read_task_doc_link(row: &Row<'_>) -> rusqlite::Result<TaskDocLink> {
    let relation: String = row.get(3)?;
    Ok(TaskDocLink {
        id: row.get(0)?,
        task_id: row.get(1)?,
        doc_id: row.get(2)?,
        relation: relation.parse().unwrap_or(TaskDocRelation::References),
        created_at: parse_dt(&row.get::<_, String>(4)?),
    })
}

fn read_invariant(row: &Row<'_>) -> rusqlite::Result<Invariant> {
    let enforcement: String = row.get(2)?;
    let status: String = row.get(8)?;
    Ok(Invariant {
        id: row.get(0)?,
        rule: row.get(1)?,
        enforcement: enforcement.parse().unwrap_or(Enforcement::IntegrationTest),
        doc_id: row.get(3)?,
        subsystem: row.get(4)?,
        test_ref: row.get(5)?,
        lint_rule: row.get(6)?,
        prompt_ref: row.get(7)?,
        status: status.parse::<InvariantStatus>().unwrap_or_default(),
        created_at: parse_dt(&row.get::<_, String>(9)?),
    })
}

fn read_check(row: &Row<'_>) -> rusqlite::Result<InvariantCheck> {
    Ok(InvariantCheck {
        id: row.get(0)?,
        invariant_id: row.get(1)?,
        passed: row.get(2)?,
        details: row.get(3)?,
        checked_at: parse_dt(&row.get::<_, String>(4)?),
        duration_ms: row.get(5)?,
    })
}

fn require_doc_tx(conn: &Connection, id: i64) -> Result<Doc> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {DOC_COLUMNS} FROM docs WHERE id = ?1"))?;
    stmt.query_row(params![id], read_doc)
        .optional()?
        .ok_or_else(|| TxError::DocNotFound(id.to_string()))
}
