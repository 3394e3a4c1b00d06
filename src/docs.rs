use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TxError};
use crate::ids::sha256_hex;
use crate::model::{
    Doc, DocKind, DocLink, DocLinkType, DocStatus, Enforcement, Metadata, validate_invariant_id,
};
use crate::store::Store;
use crate::store::docs::{InvariantSpec, NewDocMeta};

/// Active invariants unchecked for this long show up as drift.
pub const STALE_CHECK_AFTER_DAYS: i64 = 30;

/// Machine-readable YAML body of a doc. Unknown keys round-trip through
/// `extra` so hand-edited documents survive a rewrite.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DocBody {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invariants: Vec<InvariantDecl>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvariantDecl {
    pub id: String,
    pub rule: String,
    pub enforcement: Enforcement,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsystem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lint_rule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_ref: Option<String>,
}

impl From<&InvariantDecl> for InvariantSpec {
    fn from(decl: &InvariantDecl) -> Self {
        Self {
            id: decl.id.clone(),
            rule: decl.rule.clone(),
            enforcement: decl.enforcement,
            subsystem: decl.subsystem.clone(),
            test_ref: decl.test_ref.clone(),
            lint_rule: decl.lint_rule.clone(),
            prompt_ref: decl.prompt_ref.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriftWarning {
    DanglingTaskLink { task_id: String, doc_id: i64 },
    MissingTestRef { invariant_id: String, test_ref: String },
    StaleCheck { invariant_id: String, last_checked: Option<String> },
}

/// Docs are source-of-truth YAML on disk; the store carries metadata only.
pub struct DocService {
    store: Arc<Store>,
    docs_dir: PathBuf,
    project_root: PathBuf,
}

impl DocService {
    pub fn new(
        store: Arc<Store>,
        docs_dir: impl Into<PathBuf>,
        project_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            docs_dir: docs_dir.into(),
            project_root: project_root.into(),
        }
    }

    pub fn docs_dir(&self) -> &Path {
        &self.docs_dir
    }

    fn doc_path(&self, name: &str, version: i64) -> PathBuf {
        if version <= 1 {
            self.docs_dir.join(format!("{name}.yml"))
        } else {
            self.docs_dir.join(format!("{name}.v{version}.yml"))
        }
    }

    /// Create a new doc: validate, write the YAML body, insert metadata at
    /// version 1, and sync declared invariants.
    pub fn create(&self, kind: DocKind, name: &str, body: &DocBody) -> Result<Doc> {
        validate_doc_name(name)?;
        if body.title.trim().is_empty() {
            return Err(TxError::EmptyTitle);
        }
        validate_invariant_decls(&body.invariants)?;
        if self.store.get_doc_by_name(name).is_ok() {
            return Err(TxError::Config(format!("doc '{name}' already exists")));
        }

        let yaml = canonical_yaml(body)?;
        let path = self.doc_path(name, 1);
        write_doc_atomic(&path, yaml.as_bytes())?;

        let doc = self.store.insert_doc_meta(NewDocMeta {
            hash: sha256_hex(yaml.as_bytes()),
            kind,
            name: name.to_string(),
            title: body.title.clone(),
            version: 1,
            file_path: path.display().to_string(),
            parent_doc_id: None,
            metadata: Metadata::new(),
        })?;

        self.sync_invariants(doc.id, body)?;
        Ok(doc)
    }

    /// Read the latest version's metadata and parsed body.
    pub fn read(&self, name: &str) -> Result<(Doc, DocBody)> {
        let doc = self.store.get_doc_by_name(name)?;
        let raw = fs::read_to_string(&doc.file_path)?;
        let body: DocBody = serde_yaml::from_str(&raw)?;
        Ok((doc, body))
    }

    /// Rewrite a changing doc: locked docs are immutable. Invariants present
    /// in the new body are upserted; prior actives left out are deprecated.
    pub fn update(&self, name: &str, body: &DocBody) -> Result<Doc> {
        if body.title.trim().is_empty() {
            return Err(TxError::EmptyTitle);
        }
        validate_invariant_decls(&body.invariants)?;

        let doc = self.store.get_doc_by_name(name)?;
        if doc.status == DocStatus::Locked {
            return Err(TxError::DocLocked {
                name: name.to_string(),
                version: doc.version,
            });
        }

        let yaml = canonical_yaml(body)?;
        write_doc_atomic(Path::new(&doc.file_path), yaml.as_bytes())?;

        let updated = self.store.update_doc_meta(
            doc.id,
            &sha256_hex(yaml.as_bytes()),
            &body.title,
            &doc.metadata,
        )?;
        self.sync_invariants(doc.id, body)?;
        Ok(updated)
    }

    /// Lock the latest version. Idempotent.
    pub fn lock(&self, name: &str) -> Result<Doc> {
        let doc = self.store.get_doc_by_name(name)?;
        self.store.lock_doc(doc.id)
    }

    /// Copy the locked latest version into a new changing version with a
    /// version-suffixed file path.
    pub fn create_version(&self, name: &str) -> Result<Doc> {
        let prior = self.store.get_doc_by_name(name)?;
        if prior.status != DocStatus::Locked {
            return Err(TxError::DocNotLocked {
                name: name.to_string(),
            });
        }

        let raw = fs::read_to_string(&prior.file_path)?;
        let body: DocBody = serde_yaml::from_str(&raw)?;
        let yaml = canonical_yaml(&body)?;

        let version = prior.version + 1;
        let path = self.doc_path(name, version);
        write_doc_atomic(&path, yaml.as_bytes())?;

        self.store.insert_doc_meta(NewDocMeta {
            hash: sha256_hex(yaml.as_bytes()),
            kind: prior.kind,
            name: name.to_string(),
            title: prior.title.clone(),
            version,
            file_path: path.display().to_string(),
            parent_doc_id: prior.parent_doc_id,
            metadata: prior.metadata.clone(),
        })
    }

    /// Create a design patch: a `design` doc whose parent is the locked
    /// design, linked as `design_patch`.
    pub fn create_patch(&self, design_name: &str, patch_name: &str, body: &DocBody) -> Result<Doc> {
        let parent = self.store.get_doc_by_name(design_name)?;
        if parent.kind != DocKind::Design {
            return Err(TxError::InvalidEnum {
                field: "kind",
                value: parent.kind.to_string(),
            });
        }
        if parent.status != DocStatus::Locked {
            return Err(TxError::DocNotLocked {
                name: design_name.to_string(),
            });
        }

        validate_doc_name(patch_name)?;
        validate_invariant_decls(&body.invariants)?;
        let yaml = canonical_yaml(body)?;
        let path = self.doc_path(patch_name, 1);
        write_doc_atomic(&path, yaml.as_bytes())?;

        let patch = self.store.insert_doc_meta(NewDocMeta {
            hash: sha256_hex(yaml.as_bytes()),
            kind: DocKind::Design,
            name: patch_name.to_string(),
            title: body.title.clone(),
            version: 1,
            file_path: path.display().to_string(),
            parent_doc_id: Some(parent.id),
            metadata: Metadata::new(),
        })?;

        self.store
            .create_doc_link(parent.id, patch.id, DocLinkType::DesignPatch)?;
        self.sync_invariants(patch.id, body)?;
        Ok(patch)
    }

    /// Link two docs; without an explicit type the default derives from the
    /// pair of kinds.
    pub fn link_docs(
        &self,
        from_name: &str,
        to_name: &str,
        link_type: Option<DocLinkType>,
    ) -> Result<DocLink> {
        let from = self.store.get_doc_by_name(from_name)?;
        let to = self.store.get_doc_by_name(to_name)?;
        let link_type = match link_type {
            Some(t) => t,
            None => default_link_type(from.kind, to.kind)?,
        };
        self.store.create_doc_link(from.id, to.id, link_type)
    }

    fn sync_invariants(&self, doc_id: i64, body: &DocBody) -> Result<()> {
        for decl in &body.invariants {
            self.store.upsert_invariant(doc_id, &decl.into())?;
        }
        let keep: Vec<String> = body.invariants.iter().map(|d| d.id.clone()).collect();
        let deprecated = self.store.deprecate_invariants_not_in(doc_id, &keep)?;
        if deprecated > 0 {
            tracing::debug!(doc_id, deprecated, "deprecated invariants dropped from doc body");
        }
        Ok(())
    }

    /// Structured drift report for a doc: dangling task links, invariants
    /// whose test reference no longer exists, and stale or missing checks.
    pub fn detect_drift(&self, name: &str) -> Result<Vec<DriftWarning>> {
        let doc = self.store.get_doc_by_name(name)?;
        let mut warnings = Vec::new();

        for link in self.store.task_doc_links_for_doc(doc.id)? {
            if self.store.get_task(&link.task_id).is_err() {
                warnings.push(DriftWarning::DanglingTaskLink {
                    task_id: link.task_id.as_str().to_string(),
                    doc_id: doc.id,
                });
            }
        }

        let stale_cutoff = Utc::now() - Duration::days(STALE_CHECK_AFTER_DAYS);
        for invariant in self.store.invariants_for_doc(doc.id)? {
            if invariant.status != crate::model::InvariantStatus::Active {
                continue;
            }
            if let Some(test_ref) = &invariant.test_ref
                && !self.project_root.join(test_ref).exists()
            {
                warnings.push(DriftWarning::MissingTestRef {
                    invariant_id: invariant.id.clone(),
                    test_ref: test_ref.clone(),
                });
            }
            match self.store.last_invariant_check(&invariant.id)? {
                Some(check) if check.checked_at >= stale_cutoff => {}
                other => warnings.push(DriftWarning::StaleCheck {
                    invariant_id: invariant.id.clone(),
                    last_checked: other.map(|c| c.checked_at.to_rfc3339()),
                }),
            }
        }

        Ok(warnings)
    }

    /// Render Markdown views of one or all docs into `docs_dir/rendered/`.
    /// Stale numeric leftovers from earlier export schemes are removed;
    /// non-numeric sidecars are left untouched.
    pub fn render(&self, name: Option<&str>) -> Result<Vec<PathBuf>> {
        let rendered_dir = self.docs_dir.join("rendered");
        fs::create_dir_all(&rendered_dir)?;

        let docs = match name {
            Some(name) => vec![self.store.get_doc_by_name(name)?],
            None => {
                let mut all = self.store.list_docs()?;
                // Only the latest version of each name.
                all.sort_by(|a, b| a.name.cmp(&b.name).then(b.version.cmp(&a.version)));
                all.dedup_by(|a, b| a.name == b.name);
                all
            }
        };

        let mut written = Vec::with_capacity(docs.len());
        for doc in &docs {
            let raw = fs::read_to_string(&doc.file_path)?;
            let body: DocBody = serde_yaml::from_str(&raw)?;
            let markdown = render_markdown(doc, &body);
            let out = rendered_dir.join(format!("{}.md", doc.name));
            write_doc_atomic(&out, markdown.as_bytes())?;
            written.push(out);
        }

        if name.is_none() {
            let live_ids: Vec<String> =
                self.store.list_docs()?.iter().map(|d| d.id.to_string()).collect();
            for entry in fs::read_dir(&rendered_dir)? {
                let entry = entry?;
                let path = entry.path();
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let is_md = path.extension().and_then(|e| e.to_str()) == Some("md");
                let numeric = !stem.is_empty() && stem.bytes().all(|b| b.is_ascii_digit());
                if is_md && numeric && !live_ids.contains(&stem.to_string()) {
                    fs::remove_file(&path)?;
                }
            }
        }

        Ok(written)
    }
}

fn validate_doc_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if !valid {
        return Err(TxError::InvalidEnum {
            field: "doc_name",
            value: name.to_string(),
        });
    }
    Ok(())
}

fn validate_invariant_decls(decls: &[InvariantDecl]) -> Result<()> {
    for decl in decls {
        if !validate_invariant_id(&decl.id) {
            return Err(TxError::InvalidInvariantId(decl.id.clone()));
        }
    }
    Ok(())
}

fn default_link_type(from: DocKind, to: DocKind) -> Result<DocLinkType> {
    match (from, to) {
        (DocKind::Overview, DocKind::Prd) => Ok(DocLinkType::OverviewToPrd),
        (DocKind::Overview, DocKind::Design) => Ok(DocLinkType::OverviewToDesign),
        (DocKind::Prd, DocKind::Design) => Ok(DocLinkType::PrdToDesign),
        (DocKind::Design, DocKind::Design) => Ok(DocLinkType::DesignPatch),
        (from, to) => Err(TxError::InvalidEnum {
            field: "link_type",
            value: format!("{from}->{to}"),
        }),
    }
}

/// Hashing always goes over this canonical serialization, so formatting of
/// the on-disk file never shifts the content hash.
pub fn canonical_yaml(body: &DocBody) -> Result<String> {
    Ok(serde_yaml::to_string(body)?)
}

/// Stage-then-rename so readers never observe a partial doc.
fn write_doc_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent)?;

    let nonce = Uuid::new_v4();
    let staging = parent.join(format!(".{nonce}.staging"));
    fs::write(&staging, bytes)?;
    if let Err(err) = fs::rename(&staging, path) {
        let _ = fs::remove_file(&staging);
        return Err(err.into());
    }
    Ok(())
}

fn render_markdown(doc: &Doc, body: &DocBody) -> String {
    let mut out = String::new();
    out.push_str(&format!("# {}\n\n", body.title));
    out.push_str(&format!(
        "- kind: {}\n- version: {}\n- status: {}\n- hash: {}\n\n",
        doc.kind, doc.version, doc.status, doc.hash
    ));
    if let Some(summary) = &body.summary {
        out.push_str(summary);
        out.push_str("\n\n");
    }
    if let Some(content) = &body.content {
        out.push_str(content);
        out.push_str("\n\n");
    }
    if !body.invariants.is_empty() {
        out.push_str("## Invariants\n\n");
        for inv in &body.invariants {
            out.push_str(&format!("- **{}** ({}): {}\n", inv.id, inv.enforcement, inv.rule));
        }
    }
    out
}
