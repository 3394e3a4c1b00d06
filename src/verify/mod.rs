use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use globset::Glob;
use serde::Serialize;

use crate::error::{Result, TxError};
use crate::ids::sha256_hex;
use crate::model::{Anchor, AnchorAction, AnchorStatus, AnchorType, DetectedBy};
use crate::store::Store;

pub mod swarm;

pub use swarm::{SwarmOptions, SwarmReport, calculate_majority_vote};

/// Seconds an anchor verification stays fresh; `TX_ANCHOR_CACHE_TTL`.
pub const DEFAULT_ANCHOR_TTL_SECS: i64 = 3600;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VerificationResult {
    pub anchor_id: i64,
    pub action: AnchorAction,
    pub old_status: AnchorStatus,
    pub new_status: AnchorStatus,
    pub reason: String,
}

/// `get_with_verification` outcome: either a fresh cache hit (no filesystem
/// I/O) or the anchor after an on-demand verification.
#[derive(Debug, Clone, Serialize)]
pub struct CachedAnchor {
    pub anchor: Anchor,
    pub is_fresh: bool,
    pub was_verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationResult>,
}

/// Verifies anchors against the working tree under `base_dir`.
pub struct AnchorVerifier {
    store: Arc<Store>,
    base_dir: PathBuf,
    ttl_secs: i64,
}

impl AnchorVerifier {
    pub fn new(store: Arc<Store>, base_dir: impl Into<PathBuf>, ttl_secs: i64) -> Self {
        Self {
            store,
            base_dir: base_dir.into(),
            ttl_secs: ttl_secs.max(0),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }

    /// Verify one anchor now, persisting the outcome and appending to the
    /// invalidation log. Runs regardless of the pinned flag.
    pub fn verify(&self, id: i64, detected_by: DetectedBy) -> Result<VerificationResult> {
        let anchor = self.store.get_anchor(id)?;
        let (new_status, reason) = self.check(&anchor)?;
        let old_status = anchor.status;
        let action = classify(old_status, new_status);

        self.store
            .record_anchor_verification(id, old_status, new_status, detected_by, &reason)?;

        Ok(VerificationResult {
            anchor_id: id,
            action,
            old_status,
            new_status,
            reason,
        })
    }

    /// TTL-cached read: an anchor verified within the TTL is returned as-is
    /// with zero filesystem reads; `age >= TTL` is stale and re-verifies.
    pub fn get_with_verification(&self, id: i64) -> Result<CachedAnchor> {
        let anchor = self.store.get_anchor(id)?;

        if let Some(verified_at) = anchor.verified_at {
            let age = (Utc::now() - verified_at).num_seconds();
            if age < self.ttl_secs {
                return Ok(CachedAnchor {
                    anchor,
                    is_fresh: true,
                    was_verified: false,
                    verification: None,
                });
            }
        }

        let verification = self.verify(id, DetectedBy::Periodic)?;
        let anchor = self.store.get_anchor(id)?;
        Ok(CachedAnchor {
            anchor,
            is_fresh: false,
            was_verified: true,
            verification: Some(verification),
        })
    }

    /// Compute the anchor's current status against the filesystem.
    fn check(&self, anchor: &Anchor) -> Result<(AnchorStatus, String)> {
        match anchor.anchor_type {
            AnchorType::Glob => self.check_glob(anchor),
            AnchorType::LineRange => self.check_line_range(anchor),
            AnchorType::Hash => self.check_hash(anchor),
            AnchorType::Symbol => self.check_symbol(anchor),
        }
    }

    fn check_glob(&self, anchor: &Anchor) -> Result<(AnchorStatus, String)> {
        let matcher = Glob::new(&anchor.anchor_value)
            .map_err(|e| TxError::InvalidAnchor {
                id: anchor.id,
                reason: format!("invalid glob '{}': {e}", anchor.anchor_value),
            })?
            .compile_matcher();

        let mut matched = false;
        visit_files(&self.base_dir, &self.base_dir, &mut |rel| {
            if matcher.is_match(rel) {
                matched = true;
            }
        })?;

        if matched {
            Ok((AnchorStatus::Valid, format!("glob '{}' matched", anchor.anchor_value)))
        } else {
            Ok((
                AnchorStatus::Invalid,
                format!("glob '{}' matched no files", anchor.anchor_value),
            ))
        }
    }

    fn check_line_range(&self, anchor: &Anchor) -> Result<(AnchorStatus, String)> {
        let path = self.base_dir.join(&anchor.file_path);
        let Some(content) = read_if_exists(&path)? else {
            return Ok((
                AnchorStatus::Invalid,
                format!("file '{}' is missing", anchor.file_path),
            ));
        };
        let line_count = content.lines().count() as i64;
        let line_end = anchor.line_end.unwrap_or(0);
        if line_count >= line_end {
            Ok((AnchorStatus::Valid, format!("file has {line_count} lines")))
        } else {
            Ok((
                AnchorStatus::Drifted,
                format!("file shrank to {line_count} lines, range ends at {line_end}"),
            ))
        }
    }

    fn check_hash(&self, anchor: &Anchor) -> Result<(AnchorStatus, String)> {
        let path = self.base_dir.join(&anchor.file_path);
        let Some(content) = read_bytes_if_exists(&path)? else {
            return Ok((
                AnchorStatus::Invalid,
                format!("file '{}' is missing", anchor.file_path),
            ));
        };
        let current = sha256_hex(&content);
        if Some(current.as_str()) == anchor.content_hash.as_deref() {
            Ok((AnchorStatus::Valid, "content hash matches".to_string()))
        } else {
            Ok((
                AnchorStatus::Drifted,
                "content hash changed".to_string(),
            ))
        }
    }

    fn check_symbol(&self, anchor: &Anchor) -> Result<(AnchorStatus, String)> {
        let path = self.base_dir.join(&anchor.file_path);
        let Some(content) = read_if_exists(&path)? else {
            return Ok((
                AnchorStatus::Invalid,
                format!("file '{}' is missing", anchor.file_path),
            ));
        };
        let fqname = anchor.symbol_fqname.as_deref().unwrap_or("");
        if symbol_defined(&content, fqname) {
            Ok((AnchorStatus::Valid, format!("symbol '{fqname}' present")))
        } else {
            Ok((
                AnchorStatus::Drifted,
                format!("symbol '{fqname}' not found in file"),
            ))
        }
    }
}

/// Old/new status pair to the reported action. A previously degraded anchor
/// returning to valid is a self-heal.
fn classify(old: AnchorStatus, new: AnchorStatus) -> AnchorAction {
    if old == new {
        AnchorAction::Unchanged
    } else {
        match new {
            AnchorStatus::Valid => AnchorAction::SelfHealed,
            AnchorStatus::Drifted => AnchorAction::Drifted,
            AnchorStatus::Invalid => AnchorAction::Invalidated,
        }
    }
}

fn read_if_exists(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read_bytes_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Depth-first walk calling `f` with each file's path relative to `root`.
fn visit_files(root: &Path, dir: &Path, f: &mut impl FnMut(&Path)) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            visit_files(root, &path, f)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            f(rel);
        }
    }
    Ok(())
}

const DEFINITION_KEYWORDS: &[&str] = &[
    "fn", "struct", "enum", "trait", "impl", "mod", "const", "static", "type", "class", "def",
    "function", "interface", "let", "var", "export",
];

/// A symbol counts as defined when a line carries its final path segment as
/// a standalone identifier next to a definition keyword, or contains the
/// full fully-qualified name.
fn symbol_defined(content: &str, fqname: &str) -> bool {
    if fqname.is_empty() {
        return false;
    }
    let short = fqname
        .rsplit(|c| c == ':' || c == '.')
        .next()
        .unwrap_or(fqname);
    let qualified = short != fqname;

    for line in content.lines() {
        if qualified && line.contains(fqname) {
            return true;
        }
        let tokens: Vec<&str> = line
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|t| !t.is_empty())
            .collect();
        if let Some(pos) = tokens.iter().position(|t| *t == short)
            && pos > 0
            && DEFINITION_KEYWORDS.contains(&tokens[pos - 1])
        {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::anchors::{NewAnchor, backdate_verified_at};
    use crate::store::learnings::NewLearning;
    use chrono::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        store: Arc<Store>,
        learning_id: i64,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        fs::create_dir_all(root.join("src")).unwrap();
        let store = Arc::new(Store::open_memory().unwrap());
        let learning_id = store
            .create_learning(NewLearning {
                content: "verification fixture".into(),
                ..Default::default()
            })
            .unwrap()
            .id;
        Fixture {
            _dir: dir,
            root,
            store,
            learning_id,
        }
    }

    fn verifier(fx: &Fixture) -> AnchorVerifier {
        AnchorVerifier::new(Arc::clone(&fx.store), fx.root.clone(), DEFAULT_ANCHOR_TTL_SECS)
    }

    fn new_anchor(fx: &Fixture, anchor_type: AnchorType, value: &str, file: &str) -> NewAnchor {
        NewAnchor {
            learning_id: fx.learning_id,
            anchor_type,
            anchor_value: value.into(),
            file_path: file.into(),
            symbol_fqname: None,
            line_start: None,
            line_end: None,
            content_hash: None,
            pinned: false,
        }
    }

    #[test]
    fn glob_anchor_drift_cycle() {
        let fx = fixture();
        let v = verifier(&fx);
        fs::write(fx.root.join("src/a.rs"), "fn main() {}\n").unwrap();

        let anchor = fx
            .store
            .create_anchor(new_anchor(&fx, AnchorType::Glob, "src/*.rs", "src/a.rs"))
            .unwrap();

        let r = v.verify(anchor.id, DetectedBy::Manual).unwrap();
        assert_eq!(r.action, AnchorAction::Unchanged);
        assert_eq!(r.new_status, AnchorStatus::Valid);

        fs::remove_file(fx.root.join("src/a.rs")).unwrap();
        let r = v.verify(anchor.id, DetectedBy::Manual).unwrap();
        assert_eq!(r.action, AnchorAction::Invalidated);
        assert_eq!(r.new_status, AnchorStatus::Invalid);

        fs::write(fx.root.join("src/a.rs"), "fn main() {}\n").unwrap();
        let r = v.verify(anchor.id, DetectedBy::Manual).unwrap();
        assert_eq!(r.action, AnchorAction::SelfHealed);
        assert_eq!(r.new_status, AnchorStatus::Valid);

        // Three verifications, three log entries.
        assert_eq!(fx.store.anchor_invalidations(anchor.id).unwrap().len(), 3);
    }

    #[test]
    fn line_range_shrink_is_drift() {
        let fx = fixture();
        let v = verifier(&fx);
        fs::write(fx.root.join("src/long.rs"), "a\nb\nc\nd\ne\n").unwrap();

        let mut new = new_anchor(&fx, AnchorType::LineRange, "1-4", "src/long.rs");
        new.line_start = Some(1);
        new.line_end = Some(4);
        let anchor = fx.store.create_anchor(new).unwrap();

        let r = v.verify(anchor.id, DetectedBy::Manual).unwrap();
        assert_eq!(r.new_status, AnchorStatus::Valid);

        fs::write(fx.root.join("src/long.rs"), "a\nb\n").unwrap();
        let r = v.verify(anchor.id, DetectedBy::Manual).unwrap();
        assert_eq!(r.new_status, AnchorStatus::Drifted);
        assert_eq!(r.action, AnchorAction::Drifted);

        fs::remove_file(fx.root.join("src/long.rs")).unwrap();
        let r = v.verify(anchor.id, DetectedBy::Manual).unwrap();
        assert_eq!(r.new_status, AnchorStatus::Invalid);
    }

    #[test]
    fn hash_anchor_detects_edits() {
        let fx = fixture();
        let v = verifier(&fx);
        let body = b"original contents\n";
        fs::write(fx.root.join("src/h.rs"), body).unwrap();

        let mut new = new_anchor(&fx, AnchorType::Hash, "content", "src/h.rs");
        new.content_hash = Some(sha256_hex(body));
        let anchor = fx.store.create_anchor(new).unwrap();

        let r = v.verify(anchor.id, DetectedBy::Manual).unwrap();
        assert_eq!(r.new_status, AnchorStatus::Valid);

        fs::write(fx.root.join("src/h.rs"), b"edited contents\n").unwrap();
        let r = v.verify(anchor.id, DetectedBy::Manual).unwrap();
        assert_eq!(r.new_status, AnchorStatus::Drifted);

        fs::remove_file(fx.root.join("src/h.rs")).unwrap();
        let r = v.verify(anchor.id, DetectedBy::Manual).unwrap();
        assert_eq!(r.new_status, AnchorStatus::Invalid);
    }

    #[test]
    fn symbol_anchor_scans_definitions() {
        let fx = fixture();
        let v = verifier(&fx);
        fs::write(
            fx.root.join("src/sym.rs"),
            "pub fn export_tasks() {}\nstruct Codec;\n",
        )
        .unwrap();

        let mut new = new_anchor(&fx, AnchorType::Symbol, "sym::export_tasks", "src/sym.rs");
        new.symbol_fqname = Some("sync::export_tasks".into());
        let anchor = fx.store.create_anchor(new).unwrap();

        let r = v.verify(anchor.id, DetectedBy::Manual).unwrap();
        assert_eq!(r.new_status, AnchorStatus::Valid);

        fs::write(fx.root.join("src/sym.rs"), "pub fn renamed() {}\n").unwrap();
        let r = v.verify(anchor.id, DetectedBy::Manual).unwrap();
        assert_eq!(r.new_status, AnchorStatus::Drifted);
    }

    #[test]
    fn ttl_cache_returns_fresh_without_io() {
        let fx = fixture();
        let v = verifier(&fx);
        fs::write(fx.root.join("src/a.rs"), "x\n").unwrap();
        let anchor = fx
            .store
            .create_anchor(new_anchor(&fx, AnchorType::Glob, "src/*.rs", "src/a.rs"))
            .unwrap();

        // Never verified: first read verifies.
        let cached = v.get_with_verification(anchor.id).unwrap();
        assert!(!cached.is_fresh);
        assert!(cached.was_verified);

        // Delete the file; a fresh cache hit must NOT notice.
        fs::remove_file(fx.root.join("src/a.rs")).unwrap();
        let cached = v.get_with_verification(anchor.id).unwrap();
        assert!(cached.is_fresh);
        assert!(!cached.was_verified);
        assert_eq!(cached.anchor.status, AnchorStatus::Valid);
        assert!(cached.verification.is_none());
    }

    #[test]
    fn ttl_boundary_age_equal_ttl_is_stale() {
        let fx = fixture();
        let v = AnchorVerifier::new(Arc::clone(&fx.store), fx.root.clone(), 60);
        fs::write(fx.root.join("src/a.rs"), "x\n").unwrap();
        let anchor = fx
            .store
            .create_anchor(new_anchor(&fx, AnchorType::Glob, "src/*.rs", "src/a.rs"))
            .unwrap();
        v.verify(anchor.id, DetectedBy::Manual).unwrap();

        // Exactly TTL seconds old: stale, re-verifies.
        backdate_verified_at(&fx.store, anchor.id, Utc::now() - Duration::seconds(60)).unwrap();
        let cached = v.get_with_verification(anchor.id).unwrap();
        assert!(!cached.is_fresh);
        assert!(cached.was_verified);

        // Just under TTL: fresh.
        backdate_verified_at(&fx.store, anchor.id, Utc::now() - Duration::seconds(30)).unwrap();
        let cached = v.get_with_verification(anchor.id).unwrap();
        assert!(cached.is_fresh);
    }

    #[test]
    fn classify_covers_the_action_table() {
        use AnchorStatus::*;
        assert_eq!(classify(Valid, Valid), AnchorAction::Unchanged);
        assert_eq!(classify(Invalid, Invalid), AnchorAction::Unchanged);
        assert_eq!(classify(Drifted, Valid), AnchorAction::SelfHealed);
        assert_eq!(classify(Invalid, Valid), AnchorAction::SelfHealed);
        assert_eq!(classify(Valid, Drifted), AnchorAction::Drifted);
        assert_eq!(classify(Invalid, Drifted), AnchorAction::Drifted);
        assert_eq!(classify(Valid, Invalid), AnchorAction::Invalidated);
        assert_eq!(classify(Drifted, Invalid), AnchorAction::Invalidated);
    }

    #[test]
    fn symbol_matcher_heuristics() {
        let content = "pub fn alpha() {}\nclass Beta:\nlet gamma = 1;\n";
        assert!(symbol_defined(content, "mod::alpha"));
        assert!(symbol_defined(content, "pkg.Beta"));
        assert!(symbol_defined(content, "gamma"));
        assert!(!symbol_defined(content, "mod::delta"));
        assert!(!symbol_defined("alpha used here", "alpha"));
        assert!(!symbol_defined(content, ""));
    }
}
