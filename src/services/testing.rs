//! In-process engines and factories for service tests.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::api::middleware::AppError;
use crate::models::{detect_dialect, Dialect, ResultColumn, SuggestedQuery};
use crate::services::database::{Engine, EngineFactory, RowSet};
use crate::services::llm_service::{GeneratedSql, SqlGenerator, SuggestionRequest};

#[derive(Clone)]
pub(crate) enum Scripted {
    Rows(RowSet),
    Fail(String),
    Hang,
    /// Answer after a delay
    Slow(std::time::Duration, RowSet),
}

pub(crate) fn rows(columns: &[&str], data: Vec<Vec<Value>>) -> RowSet {
    RowSet {
        columns: columns
            .iter()
            .map(|name| ResultColumn {
                name: name.to_string(),
                data_type: "TEXT".to_string(),
            })
            .collect(),
        rows: data,
    }
}

/// Engine answering from a script keyed by SQL substrings.
pub(crate) struct FakeEngine {
    pub serial: usize,
    dialect: Dialect,
    script: Mutex<Vec<(String, Scripted)>>,
    calls: Mutex<Vec<String>>,
    ping_error: Option<String>,
    closed: AtomicBool,
}

impl FakeEngine {
    pub fn new(dialect: Dialect) -> Self {
        Self::with_serial(dialect, 0)
    }

    fn with_serial(dialect: Dialect, serial: usize) -> Self {
        Self {
            serial,
            dialect,
            script: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            ping_error: None,
            closed: AtomicBool::new(false),
        }
    }

    pub fn on(self, needle: &str, response: Scripted) -> Self {
        self.script
            .lock()
            .unwrap()
            .push((needle.to_string(), response));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Engine for FakeEngine {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn fetch(&self, sql: &str) -> Result<RowSet, AppError> {
        self.calls.lock().unwrap().push(sql.to_string());
        let response = self
            .script
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| sql.contains(needle.as_str()))
            .map(|(_, response)| response.clone());

        match response {
            Some(Scripted::Rows(row_set)) => Ok(row_set),
            Some(Scripted::Fail(details)) => Err(AppError::ExecutionFailed { details }),
            Some(Scripted::Hang) => std::future::pending().await,
            Some(Scripted::Slow(delay, row_set)) => {
                tokio::time::sleep(delay).await;
                Ok(row_set)
            }
            None => Ok(RowSet::default()),
        }
    }

    async fn ping(&self) -> Result<(), AppError> {
        match &self.ping_error {
            Some(details) => Err(AppError::ExecutionFailed {
                details: details.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Counts engine creations. URLs containing `unreachable` produce engines whose
/// ping fails, `broken` fails creation, and `slow` waits for `release_slow`.
#[derive(Default)]
pub(crate) struct FakeFactory {
    created: AtomicUsize,
    engines: Mutex<Vec<Arc<FakeEngine>>>,
    by_url: Mutex<HashMap<String, usize>>,
    slow_gate: Notify,
    script: Mutex<Vec<(String, Scripted)>>,
}

impl FakeFactory {
    /// Script applied to every engine this factory creates.
    pub fn on(self, needle: &str, response: Scripted) -> Self {
        self.script
            .lock()
            .unwrap()
            .push((needle.to_string(), response));
        self
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn engines(&self) -> Vec<Arc<FakeEngine>> {
        self.engines.lock().unwrap().clone()
    }

    pub fn connects_for(&self, url: &str) -> usize {
        self.by_url.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn release_slow(&self) {
        self.slow_gate.notify_waiters();
    }
}

#[async_trait::async_trait]
impl EngineFactory for FakeFactory {
    async fn connect(&self, driver_url: &str) -> Result<Arc<dyn Engine>, AppError> {
        *self
            .by_url
            .lock()
            .unwrap()
            .entry(driver_url.to_string())
            .or_insert(0) += 1;

        if driver_url.contains("slow") {
            self.slow_gate.notified().await;
        }
        if driver_url.contains("broken") {
            return Err(AppError::ConnectionTestFailed {
                details: "driver refused to start".to_string(),
            });
        }

        let serial = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let dialect = detect_dialect(driver_url).unwrap_or(Dialect::Sqlite);
        let mut engine = FakeEngine::with_serial(dialect, serial);
        for (needle, response) in self.script.lock().unwrap().iter() {
            engine = engine.on(needle, response.clone());
        }
        if driver_url.contains("unreachable") {
            engine.ping_error = Some(format!("could not reach {}", driver_url));
        }

        let engine = Arc::new(engine);
        self.engines.lock().unwrap().push(engine.clone());
        Ok(engine)
    }
}

/// Generator returning a fixed completion and remembering the context it got.
pub(crate) struct FakeGenerator {
    sql: String,
    suggestions: Vec<SuggestedQuery>,
    contexts: Mutex<Vec<String>>,
    recent: Mutex<Vec<Vec<String>>>,
}

impl FakeGenerator {
    pub fn returning(sql: &str) -> Self {
        Self {
            sql: sql.to_string(),
            suggestions: Vec::new(),
            contexts: Mutex::new(Vec::new()),
            recent: Mutex::new(Vec::new()),
        }
    }

    /// Suggestions answered verbatim, as `(description, sql)` pairs.
    pub fn suggesting(mut self, pairs: &[(&str, &str)]) -> Self {
        self.suggestions = pairs
            .iter()
            .map(|(description, sql)| SuggestedQuery {
                description: description.to_string(),
                sql: sql.to_string(),
            })
            .collect();
        self
    }

    /// History inputs passed to each `suggest` call.
    pub fn recent_seen(&self) -> Vec<Vec<String>> {
        self.recent.lock().unwrap().clone()
    }

    pub fn contexts(&self) -> Vec<String> {
        self.contexts.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl SqlGenerator for FakeGenerator {
    async fn generate(
        &self,
        _prompt: &str,
        schema_context: &str,
        _dialect: Dialect,
    ) -> Result<GeneratedSql, AppError> {
        self.contexts.lock().unwrap().push(schema_context.to_string());
        Ok(GeneratedSql {
            sql: self.sql.clone(),
            explanation: Some("fixed answer".to_string()),
        })
    }

    async fn suggest(&self, request: &SuggestionRequest<'_>) -> Result<Vec<SuggestedQuery>, AppError> {
        self.contexts
            .lock()
            .unwrap()
            .push(request.schema_context.to_string());
        self.recent.lock().unwrap().push(request.recent.to_vec());
        Ok(self.suggestions.clone())
    }
}
