//! Core domain model for the trips ETL runner: job specs, run requests and the error taxonomy.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown job type `{0}`")]
    UnknownJobType(String),
    #[error("missing configuration key `{0}`")]
    MissingKey(String),
    #[error("configuration key `{key}` must be {expected}")]
    WrongShape { key: String, expected: &'static str },
    #[error("invalid {kind} spec: {message}")]
    InvalidSpec { kind: String, message: String },
    #[error("`{0}` is not a valid SQL identifier")]
    UnsafeIdentifier(String),
    #[error("`{field}` value `{value}` is not an allowed file path")]
    UnsafePath { field: String, value: String },
    #[error("parsing pipeline configuration: {0}")]
    Parse(String),
    #[error("reading {path}: {message}")]
    Read { path: String, message: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message} (statement: {statement})")]
pub struct DatabaseError {
    pub statement: String,
    pub message: String,
}

impl DatabaseError {
    pub fn new(statement: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AlertDeliveryError {
    #[error("alert transport returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("alert transport failed: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("post action statement #{index} failed: {source}")]
    PostAction { index: usize, source: DatabaseError },
    #[error("alert delivery failed: {0}")]
    AlertDelivery(#[from] AlertDeliveryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub full_load: bool,
    #[serde(default)]
    pub init_db: bool,
}

/// Schema-qualified table reference. Both parts are validated identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "TableDef", into = "TableDef")]
pub struct Table {
    schema_name: String,
    table_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableDef {
    schema_name: String,
    table_name: String,
}

impl TryFrom<TableDef> for Table {
    type Error = ConfigError;

    fn try_from(def: TableDef) -> Result<Self, Self::Error> {
        Table::new(def.schema_name, def.table_name)
    }
}

impl From<Table> for TableDef {
    fn from(table: Table) -> Self {
        Self {
            schema_name: table.schema_name,
            table_name: table.table_name,
        }
    }
}

impl Table {
    pub fn new(schema_name: impl Into<String>, table_name: impl Into<String>) -> Result<Self, ConfigError> {
        let schema_name = schema_name.into();
        let table_name = table_name.into();
        for part in [&schema_name, &table_name] {
            if !is_sql_identifier(part) {
                return Err(ConfigError::UnsafeIdentifier(part.clone()));
            }
        }
        Ok(Self {
            schema_name,
            table_name,
        })
    }

    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.table_name)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema_name, self.table_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlFragments {
    #[serde(default)]
    pub pre_action: Option<String>,
    #[serde(default)]
    pub clean_action: Option<String>,
    pub action: String,
    #[serde(default)]
    pub post_action: Option<String>,
}

impl SqlFragments {
    /// Main statement for this run: `clean_action + action` under full load, `action` otherwise.
    pub fn main_action(&self, full_load: bool) -> Cow<'_, str> {
        compose_action(self.clean_action.as_deref(), &self.action, full_load)
    }

    pub fn post_statements(&self) -> Vec<&str> {
        self.post_action
            .as_deref()
            .map(split_statements)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionSpec {
    pub landing_file: String,
    pub table_target: Table,
    #[serde(flatten)]
    pub sql: SqlFragments,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformSpec {
    pub table_source: Table,
    pub table_target: Table,
    #[serde(flatten)]
    pub sql: SqlFragments,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSpec {
    pub query: String,
    #[serde(default)]
    pub params: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    Ingestion,
    Transform,
    Report,
    Bootstrap,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Ingestion => "Ingestion",
            JobKind::Transform => "Transform",
            JobKind::Report => "Report",
            JobKind::Bootstrap => "Bootstrap",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Ingestion" => Ok(JobKind::Ingestion),
            "Transform" => Ok(JobKind::Transform),
            "Report" => Ok(JobKind::Report),
            "Bootstrap" => Ok(JobKind::Bootstrap),
            other => Err(ConfigError::UnknownJobType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobSpec {
    Ingestion(IngestionSpec),
    Transform(TransformSpec),
    Report(ReportSpec),
    Bootstrap,
}

impl JobSpec {
    pub fn from_config(kind: JobKind, raw: &YamlValue) -> Result<Self, ConfigError> {
        let spec = match kind {
            JobKind::Ingestion => JobSpec::Ingestion(decode_section(kind, raw)?),
            JobKind::Transform => JobSpec::Transform(decode_section(kind, raw)?),
            JobKind::Report => JobSpec::Report(decode_section(kind, raw)?),
            JobKind::Bootstrap => JobSpec::Bootstrap,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn kind(&self) -> JobKind {
        match self {
            JobSpec::Ingestion(_) => JobKind::Ingestion,
            JobSpec::Transform(_) => JobKind::Transform,
            JobSpec::Report(_) => JobKind::Report,
            JobSpec::Bootstrap => JobKind::Bootstrap,
        }
    }

    pub fn fragments(&self) -> Option<&SqlFragments> {
        match self {
            JobSpec::Ingestion(spec) => Some(&spec.sql),
            JobSpec::Transform(spec) => Some(&spec.sql),
            JobSpec::Report(_) | JobSpec::Bootstrap => None,
        }
    }

    pub fn table_target(&self) -> Option<&Table> {
        match self {
            JobSpec::Ingestion(spec) => Some(&spec.table_target),
            JobSpec::Transform(spec) => Some(&spec.table_target),
            JobSpec::Report(_) | JobSpec::Bootstrap => None,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| ConfigError::InvalidSpec {
            kind: self.kind().to_string(),
            message: message.to_string(),
        };
        match self {
            JobSpec::Ingestion(spec) => {
                if !is_safe_path(&spec.landing_file) {
                    return Err(ConfigError::UnsafePath {
                        field: "landing_file".into(),
                        value: spec.landing_file.clone(),
                    });
                }
                if spec.sql.action.trim().is_empty() {
                    return Err(invalid("`action` must not be empty"));
                }
            }
            JobSpec::Transform(spec) => {
                if spec.sql.action.trim().is_empty() {
                    return Err(invalid("`action` must not be empty"));
                }
            }
            JobSpec::Report(spec) => {
                if spec.query.trim().is_empty() {
                    return Err(invalid("`query` must not be empty"));
                }
            }
            JobSpec::Bootstrap => {}
        }
        Ok(())
    }
}

fn decode_section<T: DeserializeOwned>(kind: JobKind, raw: &YamlValue) -> Result<T, ConfigError> {
    serde_yaml::from_value(raw.clone()).map_err(|err| ConfigError::InvalidSpec {
        kind: kind.to_string(),
        message: err.to_string(),
    })
}

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    sections: serde_yaml::Mapping,
}

impl PipelineConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let value: YamlValue =
            serde_yaml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))?;
        match value {
            YamlValue::Mapping(sections) => Ok(Self { sections }),
            _ => Err(ConfigError::Parse(
                "top level of the pipeline configuration must be a mapping".into(),
            )),
        }
    }

    pub fn section(&self, key: &str) -> Result<&YamlValue, ConfigError> {
        self.sections
            .get(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
    }

    pub fn ingestion(&self) -> Result<&YamlValue, ConfigError> {
        self.section("ingestion")
    }

    pub fn transform_tables(&self) -> Result<&[YamlValue], ConfigError> {
        self.section("transform")?
            .as_sequence()
            .map(Vec::as_slice)
            .ok_or_else(|| ConfigError::WrongShape {
                key: "transform".into(),
                expected: "a sequence of job sections",
            })
    }

    pub fn report(&self, key: &str) -> Result<&YamlValue, ConfigError> {
        self.section(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Success,
    Error,
}

/// One-way notification channel for terminal pipeline outcomes.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, title: &str, message: &str, severity: Severity) -> Result<(), AlertDeliveryError>;
}

pub fn compose_action<'a>(clean_action: Option<&'a str>, action: &'a str, full_load: bool) -> Cow<'a, str> {
    match clean_action {
        Some(clean) if full_load => Cow::Owned(format!("{clean}{action}")),
        _ => Cow::Borrowed(action),
    }
}

/// Split a `;`-separated script, keeping order and dropping blank segments.
pub fn split_statements(script: &str) -> Vec<&str> {
    script
        .split(';')
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
        .collect()
}

pub fn is_sql_identifier(candidate: &str) -> bool {
    let mut chars = candidate.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    candidate.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

pub fn is_safe_path(candidate: &str) -> bool {
    !candidate.is_empty()
        && !candidate.contains("..")
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-'))
}
