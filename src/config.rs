use std::fs;
use std::path::{Path, PathBuf};

use toml_edit::{DocumentMut, value};

use crate::error::{Result, TxError};
use crate::model::AssigneeType;

pub const DEFAULT_DB_PATH: &str = ".tx/tasks.db";
pub const DEFAULT_JSONL_PATH: &str = ".tx/tasks.jsonl";
pub const DEFAULT_DOCS_DIR: &str = ".tx/docs";
pub const DEFAULT_CONFIG_PATH: &str = ".tx/config.toml";

/// `.tx/config.toml`, edited in place: unknown keys, comments, and section
/// ordering of untouched regions survive a rewrite.
pub struct TxConfig {
    doc: DocumentMut,
    path: PathBuf,
}

impl TxConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let doc = match fs::read_to_string(path) {
            Ok(raw) => raw
                .parse::<DocumentMut>()
                .map_err(|e| TxError::Config(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => DocumentMut::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            doc,
            path: path.to_path_buf(),
        })
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, self.doc.to_string())?;
        Ok(())
    }

    fn get_str(&self, section: &str, key: &str) -> Option<String> {
        self.doc
            .get(section)?
            .get(key)?
            .as_str()
            .map(str::to_string)
    }

    fn get_int(&self, section: &str, key: &str) -> Option<i64> {
        self.doc.get(section)?.get(key)?.as_integer()
    }

    fn set_str(&mut self, section: &str, key: &str, val: &str) {
        self.doc[section][key] = value(val);
    }

    /// Directory for doc YAML.
    pub fn docs_path(&self) -> Option<String> {
        self.get_str("docs", "path")
    }

    pub fn set_docs_path(&mut self, path: &str) {
        self.set_str("docs", "path", path);
    }

    pub fn cycles_scan_prompt(&self) -> Option<String> {
        self.get_str("cycles", "scan_prompt")
    }

    pub fn cycles_agents(&self) -> Option<i64> {
        self.get_int("cycles", "agents")
    }

    pub fn cycles_model(&self) -> Option<String> {
        self.get_str("cycles", "model")
    }

    /// Default assignment type for dashboard-created tasks. Note the key
    /// spelling: `default_task_assigment_type` is the recognized name.
    /// Invalid values fall back to `human`.
    pub fn dashboard_default_assignment(&self) -> AssigneeType {
        self.get_str("dashboard", "default_task_assigment_type")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(AssigneeType::Human)
    }

    pub fn set_dashboard_default_assignment(&mut self, assignee: AssigneeType) {
        self.set_str("dashboard", "default_task_assigment_type", assignee.as_str());
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Default CORS allow-list when `TX_API_CORS_ORIGIN` is unset; `*` is only
/// honored when explicit.
pub fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".to_string(),
        "http://localhost:5173".to_string(),
        "http://127.0.0.1:3000".to_string(),
        "http://127.0.0.1:5173".to_string(),
    ]
}

/// Snapshot of the `TX_*` environment, taken once at startup.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub db_path: PathBuf,
    pub api_port: u16,
    pub api_host: String,
    pub api_key: Option<String>,
    pub cors_origins: Vec<String>,
    pub cors_credentials: bool,
    pub anchor_cache_ttl_secs: i64,
    pub embeddings_enabled: bool,
    pub llm_cache_dir: Option<PathBuf>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            api_port: 8439,
            api_host: "127.0.0.1".to_string(),
            api_key: None,
            cors_origins: default_cors_origins(),
            cors_credentials: false,
            anchor_cache_ttl_secs: crate::verify::DEFAULT_ANCHOR_TTL_SECS,
            embeddings_enabled: false,
            llm_cache_dir: None,
        }
    }
}

impl EnvConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(path) = env_nonempty("TX_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(port) = env_nonempty("TX_API_PORT").and_then(|v| v.parse().ok()) {
            config.api_port = port;
        }
        if let Some(host) = env_nonempty("TX_API_HOST") {
            config.api_host = host;
        }
        config.api_key = env_nonempty("TX_API_KEY");
        if let Some(origins) = env_nonempty("TX_API_CORS_ORIGIN") {
            config.cors_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        config.cors_credentials = env_nonempty("TX_API_CORS_CREDENTIALS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if let Some(ttl) = env_nonempty("TX_ANCHOR_CACHE_TTL").and_then(|v| v.parse().ok()) {
            config.anchor_cache_ttl_secs = ttl;
        }
        config.embeddings_enabled = env_nonempty("TX_EMBEDDINGS").as_deref() == Some("1");
        config.llm_cache_dir = env_nonempty("TX_LLM_CACHE_DIR").map(PathBuf::from);

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("config.toml");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn missing_file_yields_empty_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = TxConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.docs_path(), None);
        assert_eq!(config.dashboard_default_assignment(), AssigneeType::Human);
    }

    #[test]
    fn recognized_keys_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"[docs]
path = "design/docs"

[cycles]
scan_prompt = "scan for drift"
agents = 6
model = "big-model"

[dashboard]
default_task_assigment_type = "agent"
"#,
        );
        let config = TxConfig::load(&path).unwrap();
        assert_eq!(config.docs_path().as_deref(), Some("design/docs"));
        assert_eq!(config.cycles_scan_prompt().as_deref(), Some("scan for drift"));
        assert_eq!(config.cycles_agents(), Some(6));
        assert_eq!(config.cycles_model().as_deref(), Some("big-model"));
        assert_eq!(config.dashboard_default_assignment(), AssigneeType::Agent);
    }

    #[test]
    fn invalid_assignment_type_falls_back_to_human() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "[dashboard]\ndefault_task_assigment_type = \"robot\"\n",
        );
        let config = TxConfig::load(&path).unwrap();
        assert_eq!(config.dashboard_default_assignment(), AssigneeType::Human);
    }

    #[test]
    fn unknown_keys_and_comments_survive_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"# top-level comment
[docs]
path = "docs"

[experimental]
# do not remove
fancy_feature = true
"#,
        );

        let mut config = TxConfig::load(&path).unwrap();
        config.set_docs_path("elsewhere");
        config.save().unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("# top-level comment"));
        assert!(raw.contains("# do not remove"));
        assert!(raw.contains("fancy_feature = true"));
        assert!(raw.contains("elsewhere"));
    }

    #[test]
    fn env_defaults_without_variables() {
        let config = EnvConfig::default();
        assert_eq!(config.db_path, PathBuf::from(DEFAULT_DB_PATH));
        assert!(!config.embeddings_enabled);
        assert_eq!(config.anchor_cache_ttl_secs, 3600);
        assert!(config.cors_origins.iter().all(|o| o.contains("localhost") || o.contains("127.0.0.1")));
        assert!(!config.cors_origins.contains(&"*".to_string()));
    }
}
