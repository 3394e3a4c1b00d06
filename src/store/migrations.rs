/// Ordered schema migrations. Each entry is applied in its own transaction
/// and recorded in `schema_version`; the runner lives in `store::mod`.
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "001_schema_version",
        sql: "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
              );",
    },
    Migration {
        version: 2,
        name: "002_tasks",
        sql: "CREATE TABLE tasks (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'backlog',
                parent_id TEXT REFERENCES tasks(id),
                score INTEGER NOT NULL DEFAULT 500,
                assignee_type TEXT,
                assignee_id TEXT,
                assigned_at TEXT,
                assigned_by TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT,
                metadata TEXT NOT NULL DEFAULT '{}'
              );
              CREATE INDEX idx_tasks_status ON tasks(status);
              CREATE INDEX idx_tasks_parent ON tasks(parent_id);
              CREATE INDEX idx_tasks_page ON tasks(score DESC, id ASC);

              CREATE TABLE dependencies (
                blocker_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                blocked_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                created_at TEXT NOT NULL,
                PRIMARY KEY (blocker_id, blocked_id)
              );
              CREATE INDEX idx_dependencies_blocked ON dependencies(blocked_id);",
    },
    Migration {
        version: 3,
        name: "003_learnings",
        sql: "CREATE TABLE learnings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content TEXT NOT NULL,
                source_type TEXT NOT NULL DEFAULT 'manual',
                source_ref TEXT,
                keywords TEXT NOT NULL DEFAULT '[]',
                category TEXT,
                embedding BLOB,
                usage_count INTEGER NOT NULL DEFAULT 0,
                outcome_score REAL,
                created_at TEXT NOT NULL
              );

              CREATE VIRTUAL TABLE learnings_fts USING fts5(
                content,
                content='learnings',
                content_rowid='id'
              );

              CREATE TRIGGER learnings_fts_insert AFTER INSERT ON learnings BEGIN
                INSERT INTO learnings_fts(rowid, content) VALUES (new.id, new.content);
              END;
              CREATE TRIGGER learnings_fts_delete AFTER DELETE ON learnings BEGIN
                INSERT INTO learnings_fts(learnings_fts, rowid, content)
                VALUES ('delete', old.id, old.content);
              END;
              CREATE TRIGGER learnings_fts_update AFTER UPDATE OF content ON learnings BEGIN
                INSERT INTO learnings_fts(learnings_fts, rowid, content)
                VALUES ('delete', old.id, old.content);
                INSERT INTO learnings_fts(rowid, content) VALUES (new.id, new.content);
              END;

              CREATE TABLE file_learnings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_pattern TEXT NOT NULL,
                note TEXT NOT NULL,
                task_id TEXT REFERENCES tasks(id) ON DELETE SET NULL,
                created_at TEXT NOT NULL
              );

              CREATE TABLE config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
              );",
    },
    Migration {
        version: 4,
        name: "004_anchors",
        sql: "CREATE TABLE anchors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                learning_id INTEGER NOT NULL REFERENCES learnings(id) ON DELETE CASCADE,
                anchor_type TEXT NOT NULL,
                anchor_value TEXT NOT NULL,
                file_path TEXT NOT NULL,
                symbol_fqname TEXT,
                line_start INTEGER,
                line_end INTEGER,
                content_hash TEXT,
                status TEXT NOT NULL DEFAULT 'valid',
                pinned INTEGER NOT NULL DEFAULT 0,
                verified_at TEXT,
                created_at TEXT NOT NULL
              );
              CREATE INDEX idx_anchors_learning ON anchors(learning_id);
              CREATE INDEX idx_anchors_file ON anchors(file_path);

              CREATE TABLE anchor_invalidations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                anchor_id INTEGER NOT NULL REFERENCES anchors(id) ON DELETE CASCADE,
                old_status TEXT NOT NULL,
                new_status TEXT NOT NULL,
                detected_by TEXT NOT NULL,
                reason TEXT NOT NULL,
                detected_at TEXT NOT NULL
              );
              CREATE INDEX idx_anchor_invalidations_anchor
                ON anchor_invalidations(anchor_id);

              CREATE TABLE edges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                edge_type TEXT NOT NULL,
                source_type TEXT NOT NULL,
                source_id TEXT NOT NULL,
                target_type TEXT NOT NULL,
                target_id TEXT NOT NULL,
                weight REAL NOT NULL DEFAULT 1.0,
                metadata TEXT NOT NULL DEFAULT '{}',
                invalidated_at TEXT
              );
              CREATE INDEX idx_edges_source ON edges(source_type, source_id);
              CREATE INDEX idx_edges_target ON edges(target_type, target_id);",
    },
    Migration {
        version: 5,
        name: "005_docs",
        sql: "CREATE TABLE docs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hash TEXT NOT NULL,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                title TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'changing',
                file_path TEXT NOT NULL,
                parent_doc_id INTEGER REFERENCES docs(id),
                created_at TEXT NOT NULL,
                locked_at TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                UNIQUE (name, version)
              );

              CREATE TABLE doc_links (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_doc_id INTEGER NOT NULL REFERENCES docs(id) ON DELETE CASCADE,
                to_doc_id INTEGER NOT NULL REFERENCES docs(id) ON DELETE CASCADE,
                link_type TEXT NOT NULL,
                created_at TEXT NOT NULL
              );

              CREATE TABLE task_doc_links (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                doc_id INTEGER NOT NULL REFERENCES docs(id) ON DELETE CASCADE,
                relation TEXT NOT NULL,
                created_at TEXT NOT NULL
              );

              CREATE TABLE invariants (
                id TEXT PRIMARY KEY,
                rule TEXT NOT NULL,
                enforcement TEXT NOT NULL,
                doc_id INTEGER NOT NULL REFERENCES docs(id),
                subsystem TEXT,
                test_ref TEXT,
                lint_rule TEXT,
                prompt_ref TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL
              );

              CREATE TABLE invariant_checks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                invariant_id TEXT NOT NULL REFERENCES invariants(id),
                passed INTEGER NOT NULL,
                details TEXT,
                checked_at TEXT NOT NULL,
                duration_ms INTEGER
              );
              CREATE INDEX idx_invariant_checks_invariant
                ON invariant_checks(invariant_id, checked_at);",
    },
    Migration {
        version: 6,
        name: "006_runs_events",
        sql: "CREATE TABLE runs (
                id TEXT PRIMARY KEY,
                task_id TEXT REFERENCES tasks(id) ON DELETE SET NULL,
                agent TEXT NOT NULL,
                pid INTEGER,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                status TEXT NOT NULL DEFAULT 'running',
                exit_code INTEGER,
                transcript_path TEXT,
                stdout_path TEXT,
                stderr_path TEXT,
                context_injected INTEGER,
                summary TEXT,
                error_message TEXT,
                metadata TEXT NOT NULL DEFAULT '{}'
              );
              CREATE INDEX idx_runs_page ON runs(started_at DESC, id);
              CREATE INDEX idx_runs_task ON runs(task_id);

              CREATE TABLE events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                content TEXT NOT NULL,
                duration_ms REAL,
                run_id TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
              );
              CREATE INDEX idx_events_created ON events(created_at);",
    },
    Migration {
        version: 7,
        name: "007_workers",
        sql: "CREATE TABLE workers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                hostname TEXT NOT NULL,
                pid INTEGER NOT NULL,
                capabilities TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'starting',
                current_task_id TEXT,
                registered_at TEXT NOT NULL,
                last_heartbeat_at TEXT NOT NULL
              );

              CREATE TABLE task_claims (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                worker_id TEXT NOT NULL,
                claimed_at TEXT NOT NULL,
                lease_minutes INTEGER NOT NULL,
                lease_expires_at TEXT NOT NULL,
                renewed_count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'active'
              );
              CREATE UNIQUE INDEX idx_claims_one_active
                ON task_claims(task_id) WHERE status = 'active';
              CREATE INDEX idx_claims_worker ON task_claims(worker_id);",
    },
    Migration {
        version: 8,
        name: "008_sync_state",
        sql: "CREATE TABLE sync_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
              );",
    },
];
