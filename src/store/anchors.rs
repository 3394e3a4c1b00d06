use globset::Glob;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::error::{Result, TxError};
use crate::model::{
    Anchor, AnchorInvalidation, AnchorStatus, AnchorType, DetectedBy, Edge, Metadata,
};
use crate::store::{
    Store, fmt_dt, metadata_to_string, now_rfc3339, parse_dt, parse_dt_opt, parse_metadata,
};

#[derive(Debug, Clone)]
pub struct NewAnchor {
    pub learning_id: i64,
    pub anchor_type: AnchorType,
    pub anchor_value: String,
    pub file_path: String,
    pub symbol_fqname: Option<String>,
    pub line_start: Option<i64>,
    pub line_end: Option<i64>,
    pub content_hash: Option<String>,
    pub pinned: bool,
}

impl NewAnchor {
    /// Shape invariants per anchor type.
    fn validate(&self) -> Result<()> {
        match self.anchor_type {
            AnchorType::Hash if self.content_hash.is_none() => Err(TxError::InvalidAnchor {
                id: 0,
                reason: "hash anchors require content_hash".into(),
            }),
            AnchorType::Symbol if self.symbol_fqname.is_none() => Err(TxError::InvalidAnchor {
                id: 0,
                reason: "symbol anchors require symbol_fqname".into(),
            }),
            AnchorType::LineRange => match (self.line_start, self.line_end) {
                (Some(start), Some(end)) if start <= end => Ok(()),
                _ => Err(TxError::InvalidAnchor {
                    id: 0,
                    reason: "line_range anchors require line_start <= line_end".into(),
                }),
            },
            _ => Ok(()),
        }
    }
}

impl Store {
    pub fn create_anchor(&self, new: NewAnchor) -> Result<Anchor> {
        new.validate()?;
        self.transaction(|conn| {
            conn.execute(
                "INSERT INTO anchors (learning_id, anchor_type, anchor_value, file_path,
                                      symbol_fqname, line_start, line_end, content_hash,
                                      status, pinned, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'valid', ?9, ?10)",
                params![
                    new.learning_id,
                    new.anchor_type.as_str(),
                    new.anchor_value,
                    new.file_path,
                    new.symbol_fqname,
                    new.line_start,
                    new.line_end,
                    new.content_hash,
                    new.pinned,
                    now_rfc3339(),
                ],
            )?;
            let id = conn.last_insert_rowid();
            require_anchor_tx(conn, id)
        })
    }

    pub fn get_anchor(&self, id: i64) -> Result<Anchor> {
        self.read(|conn| require_anchor_tx(conn, id))
    }

    pub fn delete_anchor(&self, id: i64) -> Result<()> {
        self.transaction(|conn| {
            let changes = conn.execute("DELETE FROM anchors WHERE id = ?1", params![id])?;
            if changes == 0 {
                return Err(TxError::AnchorNotFound(id));
            }
            Ok(())
        })
    }

    pub fn set_anchor_pinned(&self, id: i64, pinned: bool) -> Result<()> {
        self.transaction(|conn| {
            let changes = conn.execute(
                "UPDATE anchors SET pinned = ?2 WHERE id = ?1",
                params![id, pinned],
            )?;
            if changes == 0 {
                return Err(TxError::AnchorNotFound(id));
            }
            Ok(())
        })
    }

    pub fn list_anchors(&self) -> Result<Vec<Anchor>> {
        self.read(|conn| {
            let mut stmt =
                conn.prepare_cached(&format!("SELECT {ANCHOR_COLUMNS} FROM anchors ORDER BY id"))?;
            let rows = stmt
                .query_map([], read_anchor)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn anchors_for_learning(&self, learning_id: i64) -> Result<Vec<Anchor>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {ANCHOR_COLUMNS} FROM anchors WHERE learning_id = ?1 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map(params![learning_id], read_anchor)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// All anchor ids, optionally excluding pinned anchors.
    pub fn anchor_ids(&self, skip_pinned: bool) -> Result<Vec<i64>> {
        self.read(|conn| {
            let sql = if skip_pinned {
                "SELECT id FROM anchors WHERE pinned = 0 ORDER BY id"
            } else {
                "SELECT id FROM anchors ORDER BY id"
            };
            let mut stmt = conn.prepare_cached(sql)?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<i64>, _>>()?;
            Ok(ids)
        })
    }

    /// Anchor ids whose `file_path` matches the glob pattern.
    pub fn anchor_ids_matching_glob(&self, pattern: &str, skip_pinned: bool) -> Result<Vec<i64>> {
        let matcher = Glob::new(pattern)
            .map_err(|e| TxError::Config(format!("invalid glob '{pattern}': {e}")))?
            .compile_matcher();
        let anchors = self.list_anchors()?;
        Ok(anchors
            .into_iter()
            .filter(|a| !(skip_pinned && a.pinned))
            .filter(|a| matcher.is_match(&a.file_path))
            .map(|a| a.id)
            .collect())
    }

    /// Anchor ids whose `file_path` equals any of the given paths.
    pub fn anchor_ids_for_paths(&self, paths: &[String], skip_pinned: bool) -> Result<Vec<i64>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let anchors = self.list_anchors()?;
        Ok(anchors
            .into_iter()
            .filter(|a| !(skip_pinned && a.pinned))
            .filter(|a| paths.iter().any(|p| p == &a.file_path))
            .map(|a| a.id)
            .collect())
    }

    /// Persist a verification outcome: new status, `verified_at = now`, and
    /// one invalidation-log entry recording the transition.
    pub fn record_anchor_verification(
        &self,
        id: i64,
        old_status: AnchorStatus,
        new_status: AnchorStatus,
        detected_by: DetectedBy,
        reason: &str,
    ) -> Result<()> {
        self.transaction(|conn| {
            let now = now_rfc3339();
            let changes = conn.execute(
                "UPDATE anchors SET status = ?2, verified_at = ?3 WHERE id = ?1",
                params![id, new_status.as_str(), now],
            )?;
            if changes == 0 {
                return Err(TxError::AnchorNotFound(id));
            }
            conn.execute(
                "INSERT INTO anchor_invalidations
                   (anchor_id, old_status, new_status, detected_by, reason, detected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    old_status.as_str(),
                    new_status.as_str(),
                    detected_by.as_str(),
                    reason,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    pub fn anchor_invalidations(&self, anchor_id: i64) -> Result<Vec<AnchorInvalidation>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, anchor_id, old_status, new_status, detected_by, reason, detected_at
                 FROM anchor_invalidations WHERE anchor_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![anchor_id], |row| {
                    let old: String = row.get(2)?;
                    let new: String = row.get(3)?;
                    let by: String = row.get(4)?;
                    Ok(AnchorInvalidation {
                        id: row.get(0)?,
                        anchor_id: row.get(1)?,
                        old_status: old.parse().unwrap_or_default(),
                        new_status: new.parse().unwrap_or_default(),
                        detected_by: by.parse().unwrap_or_default(),
                        reason: row.get(5)?,
                        detected_at: parse_dt(&row.get::<_, String>(6)?),
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -----------------------------------------------------------------------
    // Edges
    // -----------------------------------------------------------------------

    pub fn create_edge(
        &self,
        edge_type: &str,
        source: (&str, &str),
        target: (&str, &str),
        weight: f64,
        metadata: Metadata,
    ) -> Result<Edge> {
        self.transaction(|conn| {
            conn.execute(
                "INSERT INTO edges (edge_type, source_type, source_id, target_type, target_id,
                                    weight, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    edge_type,
                    source.0,
                    source.1,
                    target.0,
                    target.1,
                    weight.clamp(0.0, 1.0),
                    metadata_to_string(&metadata),
                ],
            )?;
            let id = conn.last_insert_rowid();
            let mut stmt =
                conn.prepare_cached(&format!("SELECT {EDGE_COLUMNS} FROM edges WHERE id = ?1"))?;
            Ok(stmt.query_row(params![id], read_edge)?)
        })
    }

    pub fn invalidate_edge(&self, id: i64) -> Result<()> {
        self.transaction(|conn| {
            conn.execute(
                "UPDATE edges SET invalidated_at = ?2 WHERE id = ?1 AND invalidated_at IS NULL",
                params![id, now_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Live (non-invalidated) edges out of a source entity.
    pub fn edges_from(&self, source_type: &str, source_id: &str) -> Result<Vec<Edge>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {EDGE_COLUMNS} FROM edges
                 WHERE source_type = ?1 AND source_id = ?2 AND invalidated_at IS NULL
                 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map(params![source_type, source_id], read_edge)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

const ANCHOR_COLUMNS: &str = "id, learning_id, anchor_type, anchor_value, file_path, \
     symbol_fqname, line_start, line_end, content_hash, status, pinned, verified_at, created_at";

const EDGE_COLUMNS: &str = "id, edge_type, source_type, source_id, target_type, target_id, \
     weight, metadata, invalidated_at";

pub(crate) fn read_anchor(row: &Row<'_>) -> rusqlite::Result<Anchor> {
    let anchor_type: String = row.get(2)?;
    let status: String = row.get(9)?;
    Ok(Anchor {
        id: row.get(0)?,
        learning_id: row.get(1)?,
        anchor_type: anchor_type.parse().unwrap_or(AnchorType::Glob),
        anchor_value: row.get(3)?,
        file_path: row.get(4)?,
        symbol_fqname: row.get(5)?,
        line_start: row.get(6)?,
        line_end: row.get(7)?,
        content_hash: row.get(8)?,
        status: status.parse().unwrap_or_default(),
        pinned: row.get(10)?,
        verified_at: parse_dt_opt(row.get(11)?),
        created_at: parse_dt(&row.get::<_, String>(12)?),
    })
}

fn read_edge(row: &Row<'_>) -> rusqlite::Result<Edge> {
    Ok(Edge {
        id: row.get(0)?,
        edge_type: row.get(1)?,
        source_type: row.get(2)?,
        source_id: row.get(3)?,
        target_type: row.get(4)?,
        target_id: row.get(5)?,
        weight: row.get(6)?,
        metadata: parse_metadata(&row.get::<_, String>(7)?),
        invalidated_at: parse_dt_opt(row.get(8)?),
    })
}

pub(crate) fn require_anchor_tx(conn: &Connection, id: i64) -> Result<Anchor> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {ANCHOR_COLUMNS} FROM anchors WHERE id = ?1"))?;
    stmt.query_row(params![id], read_anchor)
        .optional()?
        .ok_or(TxError::AnchorNotFound(id))
}

/// Backdate `verified_at`, used by tests exercising the TTL boundary.
#[doc(hidden)]
pub fn backdate_verified_at(store: &Store, id: i64, stamp: chrono::DateTime<chrono::Utc>) -> Result<()> {
    store.transaction(|conn| {
        conn.execute(
            "UPDATE anchors SET verified_at = ?2 WHERE id = ?1",
            params![id, fmt_dt(stamp)],
        )?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::learnings::NewLearning;

    fn store_with_learning() -> (Store, i64) {
        let store = Store::open_memory().unwrap();
        let learning = store
            .create_learning(NewLearning {
                content: "anchored knowledge".into(),
                ..Default::default()
            })
            .unwrap();
        (store, learning.id)
    }

    fn glob_anchor(learning_id: i64, pattern: &str, file: &str) -> NewAnchor {
        NewAnchor {
            learning_id,
            anchor_type: AnchorType::Glob,
            anchor_value: pattern.into(),
            file_path: file.into(),
            symbol_fqname: None,
            line_start: None,
            line_end: None,
            content_hash: None,
            pinned: false,
        }
    }

    #[test]
    fn create_starts_valid_and_unverified() {
        let (store, lid) = store_with_learning();
        let anchor = store
            .create_anchor(glob_anchor(lid, "src/*.rs", "src/a.rs"))
            .unwrap();
        assert_eq!(anchor.status, AnchorStatus::Valid);
        assert!(anchor.verified_at.is_none());
        assert!(!anchor.pinned);
    }

    #[test]
    fn hash_anchor_requires_content_hash() {
        let (store, lid) = store_with_learning();
        let mut new = glob_anchor(lid, "x", "src/a.rs");
        new.anchor_type = AnchorType::Hash;
        let err = store.create_anchor(new).unwrap_err();
        assert_eq!(err.code(), "invalid_anchor");
    }

    #[test]
    fn line_range_requires_ordered_bounds() {
        let (store, lid) = store_with_learning();
        let mut new = glob_anchor(lid, "x", "src/a.rs");
        new.anchor_type = AnchorType::LineRange;
        new.line_start = Some(10);
        new.line_end = Some(5);
        let err = store.create_anchor(new).unwrap_err();
        assert_eq!(err.code(), "invalid_anchor");

        let mut new = glob_anchor(lid, "x", "src/a.rs");
        new.anchor_type = AnchorType::LineRange;
        new.line_start = Some(5);
        new.line_end = Some(5);
        store.create_anchor(new).unwrap();
    }

    #[test]
    fn symbol_anchor_requires_fqname() {
        let (store, lid) = store_with_learning();
        let mut new = glob_anchor(lid, "x", "src/a.rs");
        new.anchor_type = AnchorType::Symbol;
        let err = store.create_anchor(new).unwrap_err();
        assert_eq!(err.code(), "invalid_anchor");
    }

    #[test]
    fn verification_updates_status_and_log() {
        let (store, lid) = store_with_learning();
        let anchor = store
            .create_anchor(glob_anchor(lid, "src/*.rs", "src/a.rs"))
            .unwrap();

        store
            .record_anchor_verification(
                anchor.id,
                AnchorStatus::Valid,
                AnchorStatus::Invalid,
                DetectedBy::Periodic,
                "no files matched glob",
            )
            .unwrap();

        let read = store.get_anchor(anchor.id).unwrap();
        assert_eq!(read.status, AnchorStatus::Invalid);
        assert!(read.verified_at.is_some());

        let log = store.anchor_invalidations(anchor.id).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].old_status, AnchorStatus::Valid);
        assert_eq!(log[0].new_status, AnchorStatus::Invalid);
        assert_eq!(log[0].detected_by, DetectedBy::Periodic);
    }

    #[test]
    fn learning_delete_cascades_anchors() {
        let (store, lid) = store_with_learning();
        let anchor = store
            .create_anchor(glob_anchor(lid, "src/*.rs", "src/a.rs"))
            .unwrap();
        store.delete_learning(lid).unwrap();
        assert!(store.get_anchor(anchor.id).is_err());
    }

    #[test]
    fn id_selection_by_glob_and_paths() {
        let (store, lid) = store_with_learning();
        let a = store
            .create_anchor(glob_anchor(lid, "v", "src/store/tasks.rs"))
            .unwrap();
        let b = store
            .create_anchor(glob_anchor(lid, "v", "docs/design.md"))
            .unwrap();
        let mut pinned = glob_anchor(lid, "v", "src/store/mod.rs");
        pinned.pinned = true;
        let p = store.create_anchor(pinned).unwrap();

        let ids = store.anchor_ids_matching_glob("src/**/*.rs", false).unwrap();
        assert_eq!(ids, vec![a.id, p.id]);

        let ids = store.anchor_ids_matching_glob("src/**/*.rs", true).unwrap();
        assert_eq!(ids, vec![a.id]);

        let ids = store
            .anchor_ids_for_paths(&["docs/design.md".into()], false)
            .unwrap();
        assert_eq!(ids, vec![b.id]);

        assert_eq!(store.anchor_ids(false).unwrap().len(), 3);
        assert_eq!(store.anchor_ids(true).unwrap().len(), 2);
    }

    #[test]
    fn edges_exclude_invalidated() {
        let (store, lid) = store_with_learning();
        let lid_str = lid.to_string();
        let edge = store
            .create_edge(
                "SIMILAR_TO",
                ("learning", &lid_str),
                ("learning", "999"),
                0.8,
                Metadata::new(),
            )
            .unwrap();
        assert_eq!(edge.weight, 0.8);

        assert_eq!(store.edges_from("learning", &lid_str).unwrap().len(), 1);
        store.invalidate_edge(edge.id).unwrap();
        assert!(store.edges_from("learning", &lid_str).unwrap().is_empty());
    }

    #[test]
    fn edge_weight_clamped_to_unit_interval() {
        let (store, lid) = store_with_learning();
        let lid_str = lid.to_string();
        let edge = store
            .create_edge(
                "IMPORTS",
                ("learning", &lid_str),
                ("file", "src/lib.rs"),
                7.5,
                Metadata::new(),
            )
            .unwrap();
        assert_eq!(edge.weight, 1.0);
    }
}
