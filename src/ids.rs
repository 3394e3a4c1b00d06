use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Canonical task identifier: `tx-` followed by 8 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdParseError {
    #[error("id is empty")]
    Empty,
    #[error("id '{0}' is missing the '{1}' prefix")]
    MissingPrefix(String, &'static str),
    #[error("id '{0}' has the wrong length (expected {1} hex chars)")]
    InvalidLength(String, usize),
    #[error("id '{0}' contains non-hex characters")]
    InvalidCharacter(String),
    #[error("random source failure: {0}")]
    RandomSource(String),
}

fn validate_hex_id(
    value: &str,
    prefix: &'static str,
    hex_len: usize,
) -> Result<String, IdParseError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(IdParseError::Empty);
    }
    let Some(hex) = trimmed.strip_prefix(prefix) else {
        return Err(IdParseError::MissingPrefix(trimmed.to_string(), prefix));
    };
    if hex.len() != hex_len {
        return Err(IdParseError::InvalidLength(trimmed.to_string(), hex_len));
    }
    if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(IdParseError::InvalidCharacter(trimmed.to_string()));
    }
    Ok(format!("{prefix}{}", hex.to_ascii_lowercase()))
}

fn random_hex(len: usize) -> Result<String, IdParseError> {
    let mut bytes = vec![0_u8; len.div_ceil(2)];
    getrandom::fill(&mut bytes).map_err(|e| IdParseError::RandomSource(e.to_string()))?;
    let mut out = String::with_capacity(len);
    for b in &bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out.truncate(len);
    Ok(out)
}

impl TaskId {
    pub const PREFIX: &'static str = "tx-";
    pub const HEX_LEN: usize = 8;

    /// Generate a fresh task ID using OS-backed CSPRNG entropy.
    pub fn generate() -> Result<Self, IdParseError> {
        Ok(Self(format!("{}{}", Self::PREFIX, random_hex(Self::HEX_LEN)?)))
    }

    /// Test hook: build an ID from fixed hex digits.
    pub fn from_hex(hex: &str) -> Result<Self, IdParseError> {
        format!("{}{hex}", Self::PREFIX).parse()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(validate_hex_id(s, Self::PREFIX, Self::HEX_LEN)?))
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl From<TaskId> for String {
    fn from(value: TaskId) -> Self {
        value.0
    }
}

impl Serialize for TaskId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl ToSql for TaskId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.as_str()))
    }
}

impl FromSql for TaskId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        text.parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Run identifier: `run-` followed by 12 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunId(String);

impl RunId {
    pub const PREFIX: &'static str = "run-";
    pub const HEX_LEN: usize = 12;

    pub fn generate() -> Result<Self, IdParseError> {
        Ok(Self(format!("{}{}", Self::PREFIX, random_hex(Self::HEX_LEN)?)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(validate_hex_id(s, Self::PREFIX, Self::HEX_LEN)?))
    }
}

impl Serialize for RunId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RunId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Worker identifier: `worker-` followed by 8 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    pub const PREFIX: &'static str = "worker-";
    pub const HEX_LEN: usize = 8;

    pub fn generate() -> Result<Self, IdParseError> {
        Ok(Self(format!("{}{}", Self::PREFIX, random_hex(Self::HEX_LEN)?)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkerId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(validate_hex_id(s, Self::PREFIX, Self::HEX_LEN)?))
    }
}

impl Serialize for WorkerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for WorkerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Lowercase hex SHA-256 of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Deterministic fixture identifier: first 8 hex chars of
/// `sha256("fixture-seed:" + name)`.
pub fn fixture_id(name: &str) -> String {
    let digest = sha256_hex(format!("fixture-seed:{name}").as_bytes());
    digest[..8].to_string()
}

/// Dedup key for a JSONL line: SHA-256 over the exact line bytes.
pub fn line_hash(line: &[u8]) -> String {
    sha256_hex(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_round_trips() {
        let id = TaskId::generate().unwrap();
        assert!(id.as_str().starts_with("tx-"));
        assert_eq!(id.as_str().len(), 3 + TaskId::HEX_LEN);

        let parsed: TaskId = id.as_str().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn task_id_normalizes_case() {
        let id: TaskId = "tx-AABBCCDD".parse().unwrap();
        assert_eq!(id.as_str(), "tx-aabbccdd");
    }

    #[test]
    fn task_id_rejects_bad_input() {
        assert!("".parse::<TaskId>().is_err());
        assert!("aabbccdd".parse::<TaskId>().is_err());
        assert!("tx-aabbccd".parse::<TaskId>().is_err());
        assert!("tx-aabbccddx".parse::<TaskId>().is_err());
        assert!("tx-zzzzzzzz".parse::<TaskId>().is_err());
    }

    #[test]
    fn task_id_serde_round_trips() {
        let id: TaskId = "tx-12345678".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#""tx-12345678""#);
        let back: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn run_and_worker_ids_have_expected_shape() {
        let run = RunId::generate().unwrap();
        assert!(run.as_str().starts_with("run-"));
        assert_eq!(run.as_str().len(), 4 + RunId::HEX_LEN);

        let worker = WorkerId::generate().unwrap();
        assert!(worker.as_str().starts_with("worker-"));
        assert_eq!(worker.as_str().len(), 7 + WorkerId::HEX_LEN);
    }

    #[test]
    fn fixture_ids_are_deterministic() {
        let a = fixture_id("alpha");
        let b = fixture_id("alpha");
        let c = fixture_id("beta");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 8);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn line_hash_distinguishes_byte_content() {
        assert_ne!(line_hash(b"a"), line_hash(b"b"));
        assert_eq!(line_hash(b"same"), line_hash(b"same"));
    }
}
