//! In-memory gateway and alert sink used by tests across the workspace.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use trips_core::{AlertDeliveryError, AlertSink, DatabaseError, Severity};
use trips_storage::{render_template, QueryOutcome, QueryParams, SqlGateway};

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    pub template: String,
    pub sql: String,
    pub binds: Vec<JsonValue>,
}

/// Records every call and renders it the same way the Postgres gateway does.
#[derive(Debug, Default)]
pub struct RecordingGateway {
    calls: Mutex<Vec<ExecutedStatement>>,
    failures: Vec<String>,
    responses: Vec<(String, Vec<Vec<JsonValue>>)>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any statement whose rendered SQL contains `needle`.
    pub fn fail_on(mut self, needle: impl Into<String>) -> Self {
        self.failures.push(needle.into());
        self
    }

    pub fn respond_with_rows(mut self, needle: impl Into<String>, rows: Vec<Vec<JsonValue>>) -> Self {
        self.responses.push((needle.into(), rows));
        self
    }

    pub fn executed(&self) -> Vec<ExecutedStatement> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn statements(&self) -> Vec<String> {
        self.executed().into_iter().map(|call| call.sql).collect()
    }
}

#[async_trait]
impl SqlGateway for RecordingGateway {
    async fn execute(&self, template: &str, params: &QueryParams) -> Result<QueryOutcome, DatabaseError> {
        let rendered =
            render_template(template, params).map_err(|message| DatabaseError::new(template, message))?;
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(ExecutedStatement {
                template: template.to_string(),
                sql: rendered.sql.clone(),
                binds: rendered.binds.clone(),
            });
        }

        if self.failures.iter().any(|needle| rendered.sql.contains(needle.as_str())) {
            return Err(DatabaseError::new(rendered.sql, "simulated backend failure"));
        }
        if let Some((_, rows)) = self
            .responses
            .iter()
            .find(|(needle, _)| rendered.sql.contains(needle.as_str()))
        {
            return Ok(QueryOutcome::with_rows(rows.clone()));
        }
        Ok(QueryOutcome::affected(1))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentAlert {
    pub title: String,
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<SentAlert>>,
    failing: bool,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            alerts: Mutex::new(Vec::new()),
            failing: true,
        }
    }

    pub fn alerts(&self) -> Vec<SentAlert> {
        self.alerts.lock().map(|alerts| alerts.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn notify(&self, title: &str, message: &str, severity: Severity) -> Result<(), AlertDeliveryError> {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(SentAlert {
                title: title.to_string(),
                message: message.to_string(),
                severity,
            });
        }
        if self.failing {
            return Err(AlertDeliveryError::Status {
                status: 500,
                body: "simulated webhook failure".into(),
            });
        }
        Ok(())
    }
}
