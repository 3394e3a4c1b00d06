use globset::Glob;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::error::{Result, TxError};
use crate::ids::TaskId;
use crate::model::{FileLearning, Learning, LearningSource};
use crate::store::{Store, now_rfc3339, parse_dt, parse_string_list, string_list_to_string};

#[derive(Debug, Default, Clone)]
pub struct NewLearning {
    pub content: String,
    pub source_type: LearningSource,
    pub source_ref: Option<String>,
    pub keywords: Vec<String>,
    pub category: Option<String>,
}

/// A BM25 candidate: the learning plus its raw (pre-normalization) score.
#[derive(Debug, Clone)]
pub struct Bm25Candidate {
    pub learning: Learning,
    pub raw_score: f64,
}

impl Store {
    pub fn create_learning(&self, new: NewLearning) -> Result<Learning> {
        let learning = self.transaction(|conn| {
            let mut keywords = new.keywords;
            keywords.retain(|k| !k.trim().is_empty());
            keywords.sort();
            keywords.dedup();

            conn.execute(
                "INSERT INTO learnings (content, source_type, source_ref, keywords, category,
                                        usage_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
                params![
                    new.content,
                    new.source_type.as_str(),
                    new.source_ref,
                    string_list_to_string(&keywords),
                    new.category,
                    now_rfc3339(),
                ],
            )?;
            let id = conn.last_insert_rowid();
            require_learning_tx(conn, id)
        })?;
        self.notify_mutation();
        Ok(learning)
    }

    pub fn get_learning(&self, id: i64) -> Result<Learning> {
        self.read(|conn| require_learning_tx(conn, id))
    }

    pub fn list_learnings(&self, limit: Option<usize>) -> Result<Vec<Learning>> {
        self.read(|conn| {
            let sql = match limit {
                Some(n) => format!("SELECT {LEARNING_COLUMNS} FROM learnings ORDER BY id DESC LIMIT {n}"),
                None => format!("SELECT {LEARNING_COLUMNS} FROM learnings ORDER BY id DESC"),
            };
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map([], read_learning)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn delete_learning(&self, id: i64) -> Result<()> {
        self.transaction(|conn| {
            let changes = conn.execute("DELETE FROM learnings WHERE id = ?1", params![id])?;
            if changes == 0 {
                return Err(TxError::LearningNotFound(id));
            }
            Ok(())
        })?;
        self.notify_mutation();
        Ok(())
    }

    pub fn update_learning_content(&self, id: i64, content: &str) -> Result<Learning> {
        let learning = self.transaction(|conn| {
            let changes = conn.execute(
                "UPDATE learnings SET content = ?2 WHERE id = ?1",
                params![id, content],
            )?;
            if changes == 0 {
                return Err(TxError::LearningNotFound(id));
            }
            require_learning_tx(conn, id)
        })?;
        self.notify_mutation();
        Ok(learning)
    }

    pub fn set_learning_embedding(&self, id: i64, embedding: &[f32]) -> Result<()> {
        self.transaction(|conn| {
            let changes = conn.execute(
                "UPDATE learnings SET embedding = ?2 WHERE id = ?1",
                params![id, encode_embedding(embedding)],
            )?;
            if changes == 0 {
                return Err(TxError::LearningNotFound(id));
            }
            Ok(())
        })
    }

    pub fn set_learning_outcome(&self, id: i64, outcome_score: f64) -> Result<()> {
        self.transaction(|conn| {
            let changes = conn.execute(
                "UPDATE learnings SET outcome_score = ?2 WHERE id = ?1",
                params![id, outcome_score.clamp(0.0, 1.0)],
            )?;
            if changes == 0 {
                return Err(TxError::LearningNotFound(id));
            }
            Ok(())
        })
    }

    pub fn increment_learning_usage(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.transaction(|conn| {
            let mut stmt =
                conn.prepare_cached("UPDATE learnings SET usage_count = usage_count + 1 WHERE id = ?1")?;
            for id in ids {
                stmt.execute(params![id])?;
            }
            Ok(())
        })
    }

    /// Learnings that still need an embedding; with `force_all`, every row.
    pub fn learnings_for_embedding(&self, force_all: bool) -> Result<Vec<Learning>> {
        self.read(|conn| {
            let sql = if force_all {
                format!("SELECT {LEARNING_COLUMNS} FROM learnings ORDER BY id")
            } else {
                format!("SELECT {LEARNING_COLUMNS} FROM learnings WHERE embedding IS NULL ORDER BY id")
            };
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map([], read_learning)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// (rows with an embedding, total rows).
    pub fn embedding_coverage(&self) -> Result<(i64, i64)> {
        self.read(|conn| {
            let with: i64 = conn.query_row(
                "SELECT COUNT(*) FROM learnings WHERE embedding IS NOT NULL",
                [],
                |row| row.get(0),
            )?;
            let total: i64 =
                conn.query_row("SELECT COUNT(*) FROM learnings", [], |row| row.get(0))?;
            Ok((with, total))
        })
    }

    pub fn learning_count(&self) -> Result<i64> {
        self.read(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM learnings", [], |row| row.get(0))?)
        })
    }

    /// Top-k BM25 matches from the FTS index, best first. Raw scores are
    /// positive (negated bm25(), which SQLite reports lower-is-better).
    pub fn bm25_candidates(&self, query: &str, k: usize) -> Result<Vec<Bm25Candidate>> {
        let Some(match_expr) = fts_match_expr(query) else {
            return Ok(Vec::new());
        };
        self.read(|conn| {
            let sql = format!(
                "SELECT {}, -bm25(learnings_fts) AS raw
                 FROM learnings_fts
                 JOIN learnings l ON l.id = learnings_fts.rowid
                 WHERE learnings_fts MATCH ?1
                 ORDER BY raw DESC
                 LIMIT {k}",
                learning_columns_prefixed("l")
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map(params![match_expr], |row| {
                    Ok(Bm25Candidate {
                        learning: read_learning(row)?,
                        raw_score: row.get(10)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -----------------------------------------------------------------------
    // File learnings
    // -----------------------------------------------------------------------

    pub fn create_file_learning(
        &self,
        file_pattern: &str,
        note: &str,
        task_id: Option<&TaskId>,
    ) -> Result<FileLearning> {
        self.transaction(|conn| {
            conn.execute(
                "INSERT INTO file_learnings (file_pattern, note, task_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![file_pattern, note, task_id, now_rfc3339()],
            )?;
            let id = conn.last_insert_rowid();
            require_file_learning_tx(conn, id)
        })
    }

    pub fn get_file_learning(&self, id: i64) -> Result<FileLearning> {
        self.read(|conn| require_file_learning_tx(conn, id))
    }

    pub fn delete_file_learning(&self, id: i64) -> Result<()> {
        self.transaction(|conn| {
            let changes = conn.execute("DELETE FROM file_learnings WHERE id = ?1", params![id])?;
            if changes == 0 {
                return Err(TxError::FileLearningNotFound(id));
            }
            Ok(())
        })
    }

    pub fn list_file_learnings(&self) -> Result<Vec<FileLearning>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, file_pattern, note, task_id, created_at
                 FROM file_learnings ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], read_file_learning)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// File learnings whose pattern matches `path`, by exact equality or glob.
    pub fn file_learnings_for_path(&self, path: &str) -> Result<Vec<FileLearning>> {
        let all = self.list_file_learnings()?;
        Ok(all
            .into_iter()
            .filter(|fl| {
                if fl.file_pattern == path {
                    return true;
                }
                Glob::new(&fl.file_pattern)
                    .map(|g| g.compile_matcher().is_match(path))
                    .unwrap_or(false)
            })
            .collect())
    }
}

const LEARNING_COLUMNS: &str = "id, content, source_type, source_ref, keywords, category, \
     embedding, usage_count, outcome_score, created_at";

fn learning_columns_prefixed(alias: &str) -> String {
    LEARNING_COLUMNS
        .split(", ")
        .map(|c| format!("{alias}.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn read_learning(row: &Row<'_>) -> rusqlite::Result<Learning> {
    let source: String = row.get(2)?;
    let embedding: Option<Vec<u8>> = row.get(6)?;
    Ok(Learning {
        id: row.get(0)?,
        content: row.get(1)?,
        source_type: source.parse().unwrap_or_default(),
        source_ref: row.get(3)?,
        keywords: parse_string_list(&row.get::<_, String>(4)?),
        category: row.get(5)?,
        embedding: embedding.as_deref().map(decode_embedding),
        usage_count: row.get(7)?,
        outcome_score: row.get(8)?,
        created_at: parse_dt(&row.get::<_, String>(9)?),
    })
}

fn read_file_learning(row: &Row<'_>) -> rusqlite::Result<FileLearning> {
    Ok(FileLearning {
        id: row.get(0)?,
        file_pattern: row.get(1)?,
        note: row.get(2)?,
        task_id: row.get(3)?,
        created_at: parse_dt(&row.get::<_, String>(4)?),
    })
}

fn require_learning_tx(conn: &Connection, id: i64) -> Result<Learning> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {LEARNING_COLUMNS} FROM learnings WHERE id = ?1"))?;
    stmt.query_row(params![id], read_learning)
        .optional()?
        .ok_or(TxError::LearningNotFound(id))
}

fn require_file_learning_tx(conn: &Connection, id: i64) -> Result<FileLearning> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, file_pattern, note, task_id, created_at FROM file_learnings WHERE id = ?1",
    )?;
    stmt.query_row(params![id], read_file_learning)
        .optional()?
        .ok_or(TxError::FileLearningNotFound(id))
}

/// Embeddings are stored as little-endian f32 bytes.
pub(crate) fn encode_embedding(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub(crate) fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Build an OR-of-phrases FTS5 match expression; tokens are quoted so user
/// input cannot inject FTS syntax. Punctuation-only tokens are dropped (they
/// tokenize to empty phrases). Returns None when nothing searchable remains.
fn fts_match_expr(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .filter(|t| t.chars().any(|c| c.is_alphanumeric()))
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_memory().unwrap()
    }

    fn learn(store: &Store, content: &str) -> Learning {
        store
            .create_learning(NewLearning {
                content: content.into(),
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn create_and_get() {
        let store = store();
        let learning = store
            .create_learning(NewLearning {
                content: "Prefer prepared statements".into(),
                source_type: LearningSource::Manual,
                keywords: vec!["sqlite".into(), "".into(), "sqlite".into()],
                category: Some("storage".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(learning.keywords, vec!["sqlite"]);
        assert_eq!(learning.usage_count, 0);
        assert!(learning.embedding.is_none());

        let read = store.get_learning(learning.id).unwrap();
        assert_eq!(read, learning);
    }

    #[test]
    fn delete_missing_fails() {
        let store = store();
        let err = store.delete_learning(404).unwrap_err();
        assert_eq!(err.code(), "learning_not_found");
    }

    #[test]
    fn fts_finds_by_content() {
        let store = store();
        learn(&store, "rename files atomically to avoid partial writes");
        learn(&store, "cosine similarity needs normalized vectors");

        let hits = store.bm25_candidates("atomically rename", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].learning.content.contains("atomically"));
        assert!(hits[0].raw_score.is_finite());
    }

    #[test]
    fn fts_tracks_updates_and_deletes() {
        let store = store();
        let l = learn(&store, "original searchable text");
        assert_eq!(store.bm25_candidates("searchable", 10).unwrap().len(), 1);

        store
            .update_learning_content(l.id, "completely different words")
            .unwrap();
        assert!(store.bm25_candidates("searchable", 10).unwrap().is_empty());
        assert_eq!(store.bm25_candidates("different", 10).unwrap().len(), 1);

        store.delete_learning(l.id).unwrap();
        assert!(store.bm25_candidates("different", 10).unwrap().is_empty());
    }

    #[test]
    fn fts_query_is_quoted_against_syntax() {
        let store = store();
        learn(&store, "plain content");
        // Would be FTS syntax errors if not quoted.
        assert!(store.bm25_candidates("AND OR NOT (", 10).unwrap().is_empty());
        assert!(store.bm25_candidates("   ", 10).unwrap().is_empty());
    }

    #[test]
    fn embedding_round_trips_as_le_bytes() {
        let store = store();
        let l = learn(&store, "embedded");
        store
            .set_learning_embedding(l.id, &[0.25, -1.0, 3.5])
            .unwrap();
        let read = store.get_learning(l.id).unwrap();
        assert_eq!(read.embedding, Some(vec![0.25, -1.0, 3.5]));
    }

    #[test]
    fn embedding_backlog_and_coverage() {
        let store = store();
        let a = learn(&store, "first");
        let _b = learn(&store, "second");
        store.set_learning_embedding(a.id, &[1.0]).unwrap();

        let missing = store.learnings_for_embedding(false).unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].content, "second");

        let all = store.learnings_for_embedding(true).unwrap();
        assert_eq!(all.len(), 2);

        assert_eq!(store.embedding_coverage().unwrap(), (1, 2));
    }

    #[test]
    fn usage_and_outcome_updates() {
        let store = store();
        let l = learn(&store, "used often");
        store.increment_learning_usage(&[l.id, l.id]).unwrap();
        assert_eq!(store.get_learning(l.id).unwrap().usage_count, 2);

        store.set_learning_outcome(l.id, 2.0).unwrap();
        assert_eq!(store.get_learning(l.id).unwrap().outcome_score, Some(1.0));
    }

    #[test]
    fn file_learnings_match_exact_and_glob() {
        let store = store();
        store
            .create_file_learning("src/store/tasks.rs", "exact note", None)
            .unwrap();
        store
            .create_file_learning("src/**/*.rs", "glob note", None)
            .unwrap();
        store
            .create_file_learning("docs/*.md", "unrelated", None)
            .unwrap();

        let hits = store.file_learnings_for_path("src/store/tasks.rs").unwrap();
        let notes: Vec<_> = hits.iter().map(|h| h.note.as_str()).collect();
        assert!(notes.contains(&"exact note"));
        assert!(notes.contains(&"glob note"));
        assert!(!notes.contains(&"unrelated"));
    }

    #[test]
    fn file_learning_delete_and_not_found() {
        let store = store();
        let fl = store.create_file_learning("a/b.rs", "note", None).unwrap();
        store.delete_file_learning(fl.id).unwrap();
        let err = store.get_file_learning(fl.id).unwrap_err();
        assert_eq!(err.code(), "file_learning_not_found");
    }
}
