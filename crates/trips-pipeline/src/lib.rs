//! Job lifecycle engine and pipeline orchestration for the trips runner.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use trips_core::{
    AlertSink, ConfigError, JobKind, JobSpec, PipelineConfig, PipelineError, RunRequest, Severity,
};
use trips_storage::{DatabaseSettings, PgGateway, QueryParams, SlackWebhookSink, SqlGateway};

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub const REGION_REPORT_KEY: &str = "weekly_average_report_region";
pub const BOUNDING_BOX_REPORT_KEY: &str = "weekly_average_report_bounding_box";

#[derive(Debug, Clone)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub slack_webhook_url: Option<String>,
    pub alert_timeout_secs: u64,
    pub config_file: PathBuf,
    pub ddl_file: PathBuf,
    pub web_port: u16,
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = DatabaseSettings::default();
        Self {
            database: DatabaseSettings {
                url: database_url_from_env(),
                max_connections: std::env::var("TRIPS_DB_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.max_connections),
                ..defaults
            },
            slack_webhook_url: std::env::var("SLACK_WEBHOOK_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            alert_timeout_secs: std::env::var("TRIPS_ALERT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            config_file: std::env::var("TRIPS_CONFIG_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("config/pipeline_params.yaml")),
            ddl_file: std::env::var("TRIPS_DDL_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("config/init_ddl.sql")),
            web_port: std::env::var("TRIPS_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }
}

fn database_url_from_env() -> String {
    if let Ok(url) = std::env::var("DATABASE_URL") {
        return url;
    }
    let var = |name: &str, default: &str| std::env::var(name).unwrap_or_else(|_| default.to_string());
    format!(
        "postgres://{}:{}@{}:{}/{}",
        var("POSTGRES_USER", "postgres"),
        var("POSTGRES_PASSWORD", "postgres"),
        var("POSTGRES_HOST", "localhost"),
        var("POSTGRES_PORT", "5432"),
        var("POSTGRES_DB", "trips"),
    )
}

/// Where a text input (pipeline YAML, DDL script) comes from. Re-read on every use.
#[derive(Debug, Clone)]
pub enum TextSource {
    File(PathBuf),
    Inline(String),
}

impl TextSource {
    pub async fn read(&self) -> Result<String, ConfigError> {
        match self {
            TextSource::Inline(text) => Ok(text.clone()),
            TextSource::File(path) => fs::read_to_string(path).await.map_err(|err| ConfigError::Read {
                path: path.display().to_string(),
                message: err.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    InitDb,
    PreAction,
    MainAction,
    PostAction,
    Completed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Created => "created",
            JobState::InitDb => "init_db",
            JobState::PreAction => "pre_action",
            JobState::MainAction => "action",
            JobState::PostAction => "post_action",
            JobState::Completed => "completed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    spec: JobSpec,
    params: QueryParams,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        let params = match &spec {
            JobSpec::Ingestion(s) => QueryParams::new()
                .with_path("landing_file", &s.landing_file)
                .with_table("table_target", &s.table_target),
            JobSpec::Transform(s) => QueryParams::new()
                .with_table("table_source", &s.table_source)
                .with_table("table_target", &s.table_target),
            JobSpec::Report(s) => QueryParams::from_values(s.params.clone()),
            JobSpec::Bootstrap => QueryParams::new(),
        };
        Self { spec, params }
    }

    pub fn kind(&self) -> JobKind {
        self.spec.kind()
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub fn params(&self) -> &QueryParams {
        &self.params
    }

    pub async fn init_db(&self, gateway: &dyn SqlGateway, ddl_script: &str) -> Result<(), PipelineError> {
        info!(job = %self.kind(), "initializing database schema");
        gateway.execute(ddl_script, &QueryParams::new()).await?;
        Ok(())
    }

    pub async fn run_pre_action(&self, gateway: &dyn SqlGateway) -> Result<(), PipelineError> {
        let pre_action = self
            .spec
            .fragments()
            .and_then(|f| f.pre_action.as_deref())
            .filter(|sql| !sql.trim().is_empty());
        if let Some(sql) = pre_action {
            info!(job = %self.kind(), "running pre_action");
            gateway.execute(sql, &self.params).await?;
        }
        Ok(())
    }

    pub async fn run_action(&self, gateway: &dyn SqlGateway, full_load: bool) -> Result<Option<u64>, PipelineError> {
        let statement = match &self.spec {
            JobSpec::Ingestion(s) => s.sql.main_action(full_load),
            JobSpec::Transform(s) => s.sql.main_action(full_load),
            JobSpec::Report(s) => Cow::Borrowed(s.query.as_str()),
            JobSpec::Bootstrap => return Ok(None),
        };
        let outcome = gateway.execute(&statement, &self.params).await?;
        Ok(outcome.affected_rows)
    }

    pub async fn run_post_action(&self, gateway: &dyn SqlGateway) -> Result<(), PipelineError> {
        let Some(fragments) = self.spec.fragments() else {
            return Ok(());
        };
        let statements = fragments.post_statements();
        if statements.is_empty() {
            return Ok(());
        }
        info!(job = %self.kind(), statements = statements.len(), "running post_action");
        for (index, statement) in statements.into_iter().enumerate() {
            gateway
                .execute(statement, &self.params)
                .await
                .map_err(|source| PipelineError::PostAction { index, source })?;
        }
        Ok(())
    }

    pub async fn run_report(&self, gateway: &dyn SqlGateway) -> Result<Vec<Vec<JsonValue>>, PipelineError> {
        let JobSpec::Report(spec) = &self.spec else {
            return Err(ConfigError::InvalidSpec {
                kind: self.kind().to_string(),
                message: "only Report jobs produce rows".into(),
            }
            .into());
        };
        let outcome = gateway.execute(&spec.query, &self.params).await?;
        Ok(outcome.rows.unwrap_or_default())
    }
}

pub fn dispatch(job_type: &str, raw: &YamlValue) -> Result<Job, ConfigError> {
    let kind: JobKind = job_type.parse()?;
    Ok(Job::new(JobSpec::from_config(kind, raw)?))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutcome {
    pub kind: JobKind,
    pub table_target: Option<String>,
    pub affected_rows: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub correlation_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub schema_initialized: bool,
    pub jobs: Vec<JobOutcome>,
}

impl RunSummary {
    fn start(correlation_id: &str) -> Self {
        let now = Utc::now();
        Self {
            correlation_id: correlation_id.to_string(),
            started_at: now,
            finished_at: now,
            schema_initialized: false,
            jobs: Vec::new(),
        }
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }

    pub fn total_affected_rows(&self) -> u64 {
        self.jobs.iter().filter_map(|job| job.affected_rows).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AverageRow {
    #[serde(rename = "AVG value")]
    pub avg_value: JsonValue,
}

impl AverageRow {
    /// Sentinel meaning "the query ran and matched nothing".
    pub fn empty() -> Self {
        Self {
            avg_value: JsonValue::String(String::new()),
        }
    }
}

pub fn average_rows(rows: Vec<Vec<JsonValue>>) -> Vec<AverageRow> {
    if rows.is_empty() {
        return vec![AverageRow::empty()];
    }
    rows.into_iter()
        .map(|row| AverageRow {
            avg_value: row.into_iter().next().unwrap_or(JsonValue::Null),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Ingest,
    Transform,
    RunAll,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Ingest => "ingestion",
            Stage::Transform => "transform",
            Stage::RunAll => "ingestion & transform",
        }
    }
}

pub struct PipelineRunner {
    gateway: Arc<dyn SqlGateway>,
    alerts: Option<Arc<dyn AlertSink>>,
    config: TextSource,
    ddl: TextSource,
}

impl PipelineRunner {
    pub fn new(gateway: Arc<dyn SqlGateway>, config: TextSource, ddl: TextSource) -> Self {
        Self {
            gateway,
            alerts: None,
            config,
            ddl,
        }
    }

    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(sink);
        self
    }

    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let gateway = PgGateway::connect_lazy(&settings.database).context("creating database gateway")?;
        let runner = Self::new(
            Arc::new(gateway),
            TextSource::File(settings.config_file.clone()),
            TextSource::File(settings.ddl_file.clone()),
        );
        match &settings.slack_webhook_url {
            Some(url) => {
                let sink = SlackWebhookSink::new(url.clone(), Duration::from_secs(settings.alert_timeout_secs))
                    .context("creating slack alert sink")?;
                Ok(runner.with_alert_sink(Arc::new(sink)))
            }
            None => Ok(runner),
        }
    }

    pub async fn load_config(&self) -> Result<PipelineConfig, PipelineError> {
        let text = self.config.read().await?;
        Ok(PipelineConfig::from_yaml_str(&text)?)
    }

    pub async fn init_db(&self) -> Result<(), PipelineError> {
        let job = dispatch(JobKind::Bootstrap.as_str(), &YamlValue::Null)?;
        let script = self.ddl.read().await?;
        job.init_db(self.gateway.as_ref(), &script).await
    }

    /// Drive one job through its lifecycle and apply the alerting policy:
    /// failures always alert, successes alert only for ingestion.
    pub async fn run_process(
        &self,
        job_type: &str,
        request: RunRequest,
        raw_spec: &YamlValue,
        correlation_id: &str,
    ) -> Result<JobOutcome, PipelineError> {
        let label = job_type.to_ascii_lowercase();
        info!(correlation_id, job_type, "executing {job_type}");

        match self.drive(job_type, request, raw_spec).await {
            Ok(outcome) => {
                info!(correlation_id, rows_affected = ?outcome.affected_rows, "number of rows affected");
                if outcome.kind == JobKind::Ingestion {
                    let message = format!("*Process ID*: {correlation_id}\n\n*Status*: {label} executed successfully");
                    self.alert(&label, &message, Severity::Success).await;
                }
                Ok(outcome)
            }
            Err(err) => {
                self.alert_failure(&label, correlation_id, &err).await;
                Err(err)
            }
        }
    }

    async fn drive(&self, job_type: &str, request: RunRequest, raw_spec: &YamlValue) -> Result<JobOutcome, PipelineError> {
        let job = dispatch(job_type, raw_spec)?;
        if job.kind() == JobKind::Bootstrap {
            return Err(ConfigError::InvalidSpec {
                kind: job.kind().to_string(),
                message: "bootstrap jobs only run through init_db".into(),
            }
            .into());
        }
        let gateway = self.gateway.as_ref();
        let mut state = JobState::Created;

        let result = async {
            if request.init_db {
                state = JobState::InitDb;
                let script = self.ddl.read().await?;
                job.init_db(gateway, &script).await?;
            }
            state = JobState::PreAction;
            job.run_pre_action(gateway).await?;
            state = JobState::MainAction;
            let affected_rows = job.run_action(gateway, request.full_load).await?;
            state = JobState::PostAction;
            job.run_post_action(gateway).await?;
            state = JobState::Completed;
            Ok::<_, PipelineError>(affected_rows)
        }
        .await;

        match result {
            Ok(affected_rows) => Ok(JobOutcome {
                kind: job.kind(),
                table_target: job.spec().table_target().map(|t| t.qualified_name()),
                affected_rows,
            }),
            Err(err) => {
                error!(job = %job.kind(), phase = %state, error = %err, "job failed");
                Err(err)
            }
        }
    }

    async fn alert(&self, label: &str, message: &str, severity: Severity) {
        let Some(sink) = &self.alerts else {
            return;
        };
        let title = format!("Trips {label}");
        if let Err(err) = sink.notify(&title, message, severity).await {
            let err = PipelineError::from(err);
            warn!(error = %err, "alert not delivered");
        }
    }

    async fn alert_failure(&self, label: &str, correlation_id: &str, err: &PipelineError) {
        let message = format!("*Process ID*: {correlation_id}\n\n*Status*: Error processing {label}: {err}");
        self.alert(label, &message, Severity::Error).await;
    }

    // Stage-level steps that fail before any job runs still alert.
    async fn alerting<T>(&self, label: &str, correlation_id: &str, result: Result<T, PipelineError>) -> Result<T, PipelineError> {
        if let Err(err) = &result {
            error!(correlation_id, stage = label, error = %err, "stage failed before dispatch");
            self.alert_failure(label, correlation_id, err).await;
        }
        result
    }

    pub async fn ingest_all(&self, request: RunRequest, correlation_id: &str) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary::start(correlation_id);
        let label = Stage::Ingest.label();
        let config = self.alerting(label, correlation_id, self.load_config().await).await?;
        let section = self
            .alerting(label, correlation_id, config.ingestion().map_err(PipelineError::from))
            .await?;
        let outcome = self
            .run_process(JobKind::Ingestion.as_str(), request, section, correlation_id)
            .await?;
        summary.jobs.push(outcome);
        Ok(summary.finish())
    }

    pub async fn transform_all(&self, request: RunRequest, correlation_id: &str) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary::start(correlation_id);
        let label = Stage::Transform.label();
        let config = self.alerting(label, correlation_id, self.load_config().await).await?;
        let tables = self
            .alerting(label, correlation_id, config.transform_tables().map_err(PipelineError::from))
            .await?;
        for table in tables {
            let outcome = self
                .run_process(JobKind::Transform.as_str(), request, table, correlation_id)
                .await?;
            summary.jobs.push(outcome);
        }
        Ok(summary.finish())
    }

    pub async fn run_all(&self, request: RunRequest, correlation_id: &str) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary::start(correlation_id);
        if request.init_db {
            let label = JobKind::Bootstrap.as_str().to_ascii_lowercase();
            self.alerting(&label, correlation_id, self.init_db().await).await?;
            summary.schema_initialized = true;
        }
        let staged = RunRequest {
            init_db: false,
            ..request
        };
        summary.jobs.extend(self.ingest_all(staged, correlation_id).await?.jobs);
        summary.jobs.extend(self.transform_all(staged, correlation_id).await?.jobs);
        Ok(summary.finish())
    }

    pub async fn run_stage(&self, stage: Stage, request: RunRequest, correlation_id: &str) -> Result<RunSummary, PipelineError> {
        match stage {
            Stage::Ingest => self.ingest_all(request, correlation_id).await,
            Stage::Transform => self.transform_all(request, correlation_id).await,
            Stage::RunAll => self.run_all(request, correlation_id).await,
        }
    }

    pub async fn weekly_average(
        &self,
        report_key: &str,
        params: BTreeMap<String, JsonValue>,
    ) -> Result<Vec<AverageRow>, PipelineError> {
        let config = self.load_config().await?;
        let mut raw = config.report(report_key)?.clone();
        let YamlValue::Mapping(section) = &mut raw else {
            return Err(ConfigError::WrongShape {
                key: report_key.to_string(),
                expected: "a mapping",
            }
            .into());
        };
        let params_value = serde_yaml::to_value(&params).map_err(|err| ConfigError::InvalidSpec {
            kind: JobKind::Report.to_string(),
            message: err.to_string(),
        })?;
        section.insert(YamlValue::from("params"), params_value);

        info!(report_key, ?params, "calculating weekly average trips");
        let job = dispatch(JobKind::Report.as_str(), &raw)?;
        let rows = job.run_report(self.gateway.as_ref()).await?;
        Ok(average_rows(rows))
    }
}

pub fn correlation_id_at(at: DateTime<Utc>) -> String {
    let stamp = format!("{}.{:06}", at.timestamp(), at.timestamp_subsec_micros());
    let mut hasher = Sha256::new();
    hasher.update(stamp.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

pub fn new_correlation_id() -> String {
    correlation_id_at(Utc::now())
}

#[derive(Debug)]
pub struct DetachedRun {
    pub correlation_id: String,
    pub handle: JoinHandle<()>,
}

/// Spawn `stage` without a return channel; the alert sink is the only outcome signal.
pub fn spawn_detached(runner: Arc<PipelineRunner>, stage: Stage, request: RunRequest) -> DetachedRun {
    let correlation_id = new_correlation_id();
    let task_id = correlation_id.clone();
    let handle = tokio::spawn(async move {
        match runner.run_stage(stage, request, &task_id).await {
            Ok(summary) => info!(
                correlation_id = %task_id,
                stage = stage.label(),
                jobs = summary.jobs.len(),
                rows_affected = summary.total_affected_rows(),
                "detached run finished"
            ),
            Err(err) => error!(correlation_id = %task_id, stage = stage.label(), error = %err, "detached run failed"),
        }
    });
    DetachedRun { correlation_id, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingAlertSink, RecordingGateway};
    use serde_json::json;
    use trips_core::DatabaseError;

    const DDL: &str = "CREATE SCHEMA IF NOT EXISTS raw;\nCREATE SCHEMA IF NOT EXISTS dw;\n";

    const CONFIG: &str = r#"
ingestion:
  landing_file: /data/trips.csv
  table_target: {schema_name: raw, table_name: trips}
  pre_action: "DELETE FROM raw.load_log WHERE target = :table_target"
  clean_action: "TRUNCATE TABLE {table_target};"
  action: "COPY {table_target} FROM '{landing_file}' CSV HEADER"
  post_action: "VACUUM ANALYZE {table_target}; ; ANALYZE raw.load_log;  "
transform:
  - table_source: {schema_name: raw, table_name: trips}
    table_target: {schema_name: dw, table_name: regions}
    clean_action: "DELETE FROM {table_target};"
    action: "INSERT INTO {table_target} (name) SELECT DISTINCT region FROM {table_source}"
  - table_source: {schema_name: raw, table_name: trips}
    table_target: {schema_name: dw, table_name: datasources}
    action: "INSERT INTO {table_target} (name) SELECT DISTINCT datasource FROM {table_source}"
  - table_source: {schema_name: raw, table_name: trips}
    table_target: {schema_name: dw, table_name: trips}
    action: "INSERT INTO {table_target} SELECT * FROM {table_source}"
weekly_average_report_region:
  query: "SELECT AVG(trips) FROM dw.weekly_trips WHERE region = :region"
"#;

    fn runner(gateway: Arc<RecordingGateway>) -> PipelineRunner {
        PipelineRunner::new(
            gateway,
            TextSource::Inline(CONFIG.to_string()),
            TextSource::Inline(DDL.to_string()),
        )
    }

    fn alerted_runner(gateway: Arc<RecordingGateway>, sink: Arc<RecordingAlertSink>) -> PipelineRunner {
        runner(gateway).with_alert_sink(sink)
    }

    fn section(key: &str) -> YamlValue {
        PipelineConfig::from_yaml_str(CONFIG)
            .unwrap()
            .section(key)
            .unwrap()
            .clone()
    }

    fn full_load() -> RunRequest {
        RunRequest {
            full_load: true,
            init_db: false,
        }
    }

    #[tokio::test]
    async fn full_load_runs_clean_and_action_as_one_statement() {
        let gateway = Arc::new(RecordingGateway::new());
        let outcome = runner(gateway.clone())
            .run_process("Ingestion", full_load(), &section("ingestion"), "cid")
            .await
            .unwrap();

        assert_eq!(outcome.table_target.as_deref(), Some("raw.trips"));
        assert_eq!(
            gateway.statements(),
            vec![
                "DELETE FROM raw.load_log WHERE target = $1".to_string(),
                "TRUNCATE TABLE raw.trips;COPY raw.trips FROM '/data/trips.csv' CSV HEADER".to_string(),
                "VACUUM ANALYZE raw.trips".to_string(),
                "ANALYZE raw.load_log".to_string(),
            ]
        );
        assert_eq!(gateway.executed()[0].binds, vec![json!("raw.trips")]);
    }

    #[tokio::test]
    async fn incremental_load_runs_only_action() {
        let gateway = Arc::new(RecordingGateway::new());
        runner(gateway.clone())
            .run_process("Ingestion", RunRequest::default(), &section("ingestion"), "cid")
            .await
            .unwrap();

        let statements = gateway.statements();
        assert_eq!(statements[1], "COPY raw.trips FROM '/data/trips.csv' CSV HEADER");
        assert!(statements.iter().all(|s| !s.contains("TRUNCATE")));
    }

    #[tokio::test]
    async fn full_load_without_clean_action_runs_only_action() {
        let gateway = Arc::new(RecordingGateway::new());
        let tables = PipelineConfig::from_yaml_str(CONFIG).unwrap().transform_tables().unwrap().to_vec();
        runner(gateway.clone())
            .run_process("Transform", full_load(), &tables[1], "cid")
            .await
            .unwrap();

        assert_eq!(
            gateway.statements(),
            vec!["INSERT INTO dw.datasources (name) SELECT DISTINCT datasource FROM raw.trips".to_string()]
        );
    }

    #[tokio::test]
    async fn post_action_blank_segments_never_reach_the_gateway() {
        let gateway = RecordingGateway::new();
        let raw: YamlValue = serde_yaml::from_str(
            r#"
table_source: {schema_name: raw, table_name: trips}
table_target: {schema_name: dw, table_name: trips}
action: "SELECT 1"
post_action: "A; ; B;  "
"#,
        )
        .unwrap();
        let job = dispatch("Transform", &raw).unwrap();
        job.run_post_action(&gateway).await.unwrap();

        assert_eq!(gateway.statements(), vec!["A".to_string(), "B".to_string()]);
    }

    #[tokio::test]
    async fn post_action_failure_stops_remaining_statements() {
        let gateway = RecordingGateway::new().fail_on("B");
        let raw: YamlValue = serde_yaml::from_str(
            r#"
table_source: {schema_name: raw, table_name: trips}
table_target: {schema_name: dw, table_name: trips}
action: "SELECT 1"
post_action: "A; B; C"
"#,
        )
        .unwrap();
        let job = dispatch("Transform", &raw).unwrap();
        let err = job.run_post_action(&gateway).await.unwrap_err();

        assert!(matches!(err, PipelineError::PostAction { index: 1, .. }));
        assert_eq!(gateway.statements(), vec!["A".to_string(), "B".to_string()]);
    }

    #[tokio::test]
    async fn weekly_average_without_rows_returns_sentinel() {
        let gateway = Arc::new(RecordingGateway::new().respond_with_rows("AVG(trips)", vec![]));
        let rows = runner(gateway.clone())
            .weekly_average(REGION_REPORT_KEY, BTreeMap::from([("region".to_string(), json!("Prague"))]))
            .await
            .unwrap();

        assert_eq!(serde_json::to_value(&rows).unwrap(), json!([{"AVG value": ""}]));
        assert_eq!(gateway.executed()[0].binds, vec![json!("Prague")]);
    }

    #[tokio::test]
    async fn weekly_average_maps_first_column() {
        let gateway = Arc::new(
            RecordingGateway::new().respond_with_rows("AVG(trips)", vec![vec![json!(3.5)], vec![json!(4.0)]]),
        );
        let rows = runner(gateway)
            .weekly_average(REGION_REPORT_KEY, BTreeMap::from([("region".to_string(), json!("Turin"))]))
            .await
            .unwrap();

        assert_eq!(
            serde_json::to_value(&rows).unwrap(),
            json!([{"AVG value": 3.5}, {"AVG value": 4.0}])
        );
    }

    #[tokio::test]
    async fn weekly_average_unknown_report_key_is_config_error() {
        let gateway = Arc::new(RecordingGateway::new());
        let err = runner(gateway.clone())
            .weekly_average(BOUNDING_BOX_REPORT_KEY, BTreeMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Config(ConfigError::MissingKey(_))));
        assert!(gateway.statements().is_empty());
    }

    #[tokio::test]
    async fn ingestion_success_alerts_once_transform_success_stays_silent() {
        let gateway = Arc::new(RecordingGateway::new());
        let sink = Arc::new(RecordingAlertSink::new());
        let runner = alerted_runner(gateway, sink.clone());

        runner.ingest_all(RunRequest::default(), "cid-ingest").await.unwrap();
        let alerts = sink.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Success);
        assert_eq!(alerts[0].title, "Trips ingestion");
        assert!(alerts[0].message.contains("cid-ingest"));

        runner.transform_all(RunRequest::default(), "cid-transform").await.unwrap();
        assert_eq!(sink.alerts().len(), 1);
    }

    #[tokio::test]
    async fn failing_action_alerts_and_skips_post_action() {
        let gateway = Arc::new(RecordingGateway::new().fail_on("COPY raw.trips"));
        let sink = Arc::new(RecordingAlertSink::new());
        let err = alerted_runner(gateway.clone(), sink.clone())
            .run_process("Ingestion", RunRequest::default(), &section("ingestion"), "cid-42")
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Database(DatabaseError { .. })));
        let alerts = sink.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Error);
        assert!(alerts[0].message.contains("cid-42"));
        assert!(alerts[0].message.contains("simulated backend failure"));
        assert!(gateway.statements().iter().all(|s| !s.contains("ANALYZE")));
    }

    #[tokio::test]
    async fn failure_without_alert_sink_still_propagates() {
        let gateway = Arc::new(RecordingGateway::new().fail_on("COPY raw.trips"));
        let result = runner(gateway)
            .run_process("Ingestion", RunRequest::default(), &section("ingestion"), "cid")
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn alert_delivery_failure_does_not_change_outcome() {
        let gateway = Arc::new(RecordingGateway::new());
        let sink = Arc::new(RecordingAlertSink::failing());
        let summary = alerted_runner(gateway, sink.clone())
            .ingest_all(RunRequest::default(), "cid")
            .await
            .unwrap();

        assert_eq!(summary.jobs.len(), 1);
        assert_eq!(sink.alerts().len(), 1);
    }

    #[tokio::test]
    async fn run_all_bootstraps_then_ingests_then_transforms_in_order() {
        let gateway = Arc::new(RecordingGateway::new());
        let summary = runner(gateway.clone())
            .run_all(RunRequest { full_load: false, init_db: true }, "cid")
            .await
            .unwrap();

        assert!(summary.schema_initialized);
        let targets: Vec<_> = summary.jobs.iter().map(|j| j.table_target.clone().unwrap()).collect();
        assert_eq!(targets, vec!["raw.trips", "dw.regions", "dw.datasources", "dw.trips"]);

        let statements = gateway.statements();
        assert_eq!(statements[0], DDL);
        assert_eq!(statements.iter().filter(|s| s.as_str() == DDL).count(), 1);
        assert!(statements[2].starts_with("COPY raw.trips"));
        assert!(statements[5].starts_with("INSERT INTO dw.regions"));
        assert!(statements[6].starts_with("INSERT INTO dw.datasources"));
        assert!(statements[7].starts_with("INSERT INTO dw.trips"));
    }

    #[tokio::test]
    async fn transform_failure_stops_the_sequence() {
        let gateway = Arc::new(RecordingGateway::new().fail_on("INSERT INTO dw.datasources"));
        let sink = Arc::new(RecordingAlertSink::new());
        let err = alerted_runner(gateway.clone(), sink.clone())
            .run_all(RunRequest { full_load: false, init_db: true }, "cid-7")
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Database(_)));
        assert!(gateway.statements().iter().all(|s| !s.contains("INSERT INTO dw.trips")));
        let alerts = sink.alerts();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].severity, Severity::Success);
        assert_eq!(alerts[1].severity, Severity::Error);
        assert_eq!(alerts[1].title, "Trips transform");
    }

    #[tokio::test]
    async fn unknown_job_type_fails_before_any_statement() {
        let gateway = Arc::new(RecordingGateway::new());
        let err = runner(gateway.clone())
            .run_process("Exporter", full_load(), &section("ingestion"), "cid")
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Config(ConfigError::UnknownJobType(_))));
        assert!(gateway.statements().is_empty());
    }

    #[tokio::test]
    async fn init_db_flag_runs_script_before_pre_action() {
        let gateway = Arc::new(RecordingGateway::new());
        runner(gateway.clone())
            .run_process(
                "Ingestion",
                RunRequest { full_load: false, init_db: true },
                &section("ingestion"),
                "cid",
            )
            .await
            .unwrap();

        let statements = gateway.statements();
        assert_eq!(statements[0], DDL);
        assert!(statements[1].starts_with("DELETE FROM raw.load_log"));
    }

    #[tokio::test]
    async fn config_is_read_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_path = dir.path().join("pipeline_params.yaml");
        let ddl_path = dir.path().join("init_ddl.sql");
        std::fs::write(&config_path, CONFIG).unwrap();
        std::fs::write(&ddl_path, DDL).unwrap();

        let gateway = Arc::new(RecordingGateway::new());
        let runner = PipelineRunner::new(
            gateway.clone(),
            TextSource::File(config_path),
            TextSource::File(ddl_path),
        );
        runner.init_db().await.unwrap();
        runner.transform_all(RunRequest::default(), "cid").await.unwrap();
        assert_eq!(gateway.statements().len(), 4);
    }

    #[tokio::test]
    async fn missing_config_file_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = PipelineRunner::new(
            Arc::new(RecordingGateway::new()),
            TextSource::File(dir.path().join("absent.yaml")),
            TextSource::Inline(DDL.to_string()),
        );
        let err = runner.ingest_all(RunRequest::default(), "cid").await.unwrap_err();
        assert!(matches!(err, PipelineError::Config(ConfigError::Read { .. })));
    }

    #[tokio::test]
    async fn missing_config_file_alerts_before_any_job() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = Arc::new(RecordingAlertSink::new());
        let gateway = Arc::new(RecordingGateway::new());
        let runner = PipelineRunner::new(
            gateway.clone(),
            TextSource::File(dir.path().join("absent.yaml")),
            TextSource::Inline(DDL.to_string()),
        )
        .with_alert_sink(sink.clone());

        runner.transform_all(RunRequest::default(), "cid-cfg").await.unwrap_err();
        let alerts = sink.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Error);
        assert_eq!(alerts[0].title, "Trips transform");
        assert!(alerts[0].message.contains("cid-cfg"));
        assert!(gateway.statements().is_empty());
    }

    #[tokio::test]
    async fn missing_ingestion_section_alerts() {
        let sink = Arc::new(RecordingAlertSink::new());
        let runner = PipelineRunner::new(
            Arc::new(RecordingGateway::new()),
            TextSource::Inline("transform: []\n".to_string()),
            TextSource::Inline(DDL.to_string()),
        )
        .with_alert_sink(sink.clone());

        let err = runner.ingest_all(RunRequest::default(), "cid").await.unwrap_err();
        assert!(matches!(err, PipelineError::Config(ConfigError::MissingKey(_))));
        assert_eq!(sink.alerts().len(), 1);
        assert_eq!(sink.alerts()[0].title, "Trips ingestion");
    }

    #[tokio::test]
    async fn run_all_bootstrap_failure_alerts_and_stops() {
        let gateway = Arc::new(RecordingGateway::new().fail_on("CREATE SCHEMA"));
        let sink = Arc::new(RecordingAlertSink::new());
        alerted_runner(gateway.clone(), sink.clone())
            .run_all(RunRequest { full_load: false, init_db: true }, "cid-boot")
            .await
            .unwrap_err();

        let alerts = sink.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].title, "Trips bootstrap");
        assert_eq!(gateway.statements().len(), 1);
    }

    #[tokio::test]
    async fn bootstrap_is_rejected_as_a_process() {
        let gateway = Arc::new(RecordingGateway::new());
        let sink = Arc::new(RecordingAlertSink::new());
        let err = alerted_runner(gateway.clone(), sink.clone())
            .run_process("Bootstrap", RunRequest::default(), &YamlValue::Null, "cid")
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Config(ConfigError::InvalidSpec { .. })));
        assert!(gateway.statements().is_empty());
        assert_eq!(sink.alerts()[0].severity, Severity::Error);
    }

    #[tokio::test]
    async fn detached_run_reports_only_through_alerts() {
        let gateway = Arc::new(RecordingGateway::new());
        let sink = Arc::new(RecordingAlertSink::new());
        let runner = Arc::new(alerted_runner(gateway, sink.clone()));

        let run = spawn_detached(runner, Stage::Ingest, RunRequest::default());
        assert_eq!(run.correlation_id.len(), 32);
        run.handle.await.unwrap();

        let alerts = sink.alerts();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].message.contains(&run.correlation_id));
    }

    #[test]
    fn correlation_id_is_a_stable_timestamp_digest() {
        let at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00.123456Z")
            .expect("ts")
            .with_timezone(&Utc);
        let id = correlation_id_at(at);
        assert_eq!(id, correlation_id_at(at));
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, correlation_id_at(at + chrono::Duration::microseconds(1)));
    }

    #[test]
    fn shipped_pipeline_config_dispatches() {
        let config = PipelineConfig::from_yaml_str(include_str!("../../../config/pipeline_params.yaml"))
            .expect("shipped config parses");
        dispatch("Ingestion", config.ingestion().unwrap()).unwrap();
        for table in config.transform_tables().unwrap() {
            dispatch("Transform", table).unwrap();
        }
        for key in [REGION_REPORT_KEY, BOUNDING_BOX_REPORT_KEY] {
            assert_eq!(dispatch("Report", config.report(key).unwrap()).unwrap().kind(), JobKind::Report);
        }
    }

    #[test]
    fn bootstrap_job_dispatches_without_config() {
        let job = dispatch("Bootstrap", &YamlValue::Null).unwrap();
        assert_eq!(job.kind(), JobKind::Bootstrap);
        assert!(job.params().value("table_target").is_none());
    }
}
