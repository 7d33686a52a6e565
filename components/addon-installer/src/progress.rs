use crate::error::ErrorKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    InProgress,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }
}

/// One report to the sink. Unset fields leave the stored value unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub description: Option<String>,
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub summary: Option<Value>,
    pub error_kind: Option<ErrorKind>,
}

impl ProgressUpdate {
    pub fn description(description: impl Into<String>) -> Self {
        ProgressUpdate {
            description: Some(description.into()),
            ..Default::default()
        }
    }

    pub fn progress(progress: u8) -> Self {
        ProgressUpdate {
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_summary(mut self, summary: Value) -> Self {
        self.summary = Some(summary);
        self
    }

    pub fn with_error_kind(mut self, kind: ErrorKind) -> Self {
        self.error_kind = Some(kind);
        self
    }
}

/// Receives job progress. Fire-and-forget: the pipeline never reads it back.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, job_id: &str, update: ProgressUpdate);
}

pub struct LogProgressSink;

#[async_trait]
impl ProgressSink for LogProgressSink {
    async fn report(&self, job_id: &str, update: ProgressUpdate) {
        match update.status {
            Some(JobStatus::Failed) => error!(
                "[{}] failed: {}",
                job_id,
                update.description.as_deref().unwrap_or("")
            ),
            _ => info!(
                "[{}] {:?} {}{}",
                job_id,
                update.status,
                update.description.as_deref().unwrap_or(""),
                update
                    .progress
                    .map(|p| format!(" ({}%)", p))
                    .unwrap_or_default()
            ),
        }
    }
}

/// Forwards each update to every inner sink, in order.
pub struct FanoutProgressSink {
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl FanoutProgressSink {
    pub fn new(sinks: Vec<Arc<dyn ProgressSink>>) -> Self {
        FanoutProgressSink { sinks }
    }
}

#[async_trait]
impl ProgressSink for FanoutProgressSink {
    async fn report(&self, job_id: &str, update: ProgressUpdate) {
        for sink in &self.sinks {
            sink.report(job_id, update.clone()).await;
        }
    }
}

/// Latest merged state of a job, as a poller would see it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub description: String,
    pub status: Option<JobStatus>,
    pub progress: u8,
    pub summary: Option<Value>,
    pub error_kind: Option<ErrorKind>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<String, JobRecord>,
    history: HashMap<String, Vec<ProgressUpdate>>,
}

/// Keeps every update in memory. Used by the command line front end and by
/// tests to poll job outcome.
///
/// Nothing is dropped on its own. Long-lived owners call `remove` once a
/// job's terminal state has been read.
#[derive(Default)]
pub struct MemoryProgressSink {
    state: Mutex<MemoryState>,
}

impl MemoryProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, job_id: &str) -> Option<JobRecord> {
        let state = self.state.lock().unwrap();
        state.records.get(job_id).cloned()
    }

    pub fn history(&self, job_id: &str) -> Vec<ProgressUpdate> {
        let state = self.state.lock().unwrap();
        state.history.get(job_id).cloned().unwrap_or_default()
    }

    /// Forgets a job, returning its last record.
    pub fn remove(&self, job_id: &str) -> Option<JobRecord> {
        let mut state = self.state.lock().unwrap();
        state.history.remove(job_id);
        state.records.remove(job_id)
    }

    /// Forgets every job that reached `finished` or `failed`.
    pub fn remove_terminal(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let done: Vec<String> = state
            .records
            .values()
            .filter(|r| r.status.map_or(false, |s| s.is_terminal()))
            .map(|r| r.job_id.clone())
            .collect();
        for job_id in &done {
            state.records.remove(job_id);
            state.history.remove(job_id);
        }
        done.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ProgressSink for MemoryProgressSink {
    async fn report(&self, job_id: &str, update: ProgressUpdate) {
        debug!("[{}] progress update: {:?}", job_id, update);
        let mut state = self.state.lock().unwrap();
        let record = state
            .records
            .entry(job_id.to_string())
            .or_insert_with(|| JobRecord {
                job_id: job_id.to_string(),
                description: String::new(),
                status: None,
                progress: 0,
                summary: None,
                error_kind: None,
                updated_at: Utc::now(),
            });
        if let Some(description) = &update.description {
            record.description = description.clone();
        }
        if let Some(status) = update.status {
            record.status = Some(status);
        }
        if let Some(progress) = update.progress {
            record.progress = progress;
        }
        if let Some(summary) = &update.summary {
            record.summary = Some(summary.clone());
        }
        if let Some(kind) = update.error_kind {
            record.error_kind = Some(kind);
        }
        record.updated_at = Utc::now();

        state
            .history
            .entry(job_id.to_string())
            .or_default()
            .push(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_sink_merges_updates() {
        let sink = MemoryProgressSink::new();
        sink.report(
            "job-1",
            ProgressUpdate::description("Downloading").with_status(JobStatus::InProgress),
        )
        .await;
        sink.report("job-1", ProgressUpdate::progress(20)).await;
        sink.report(
            "job-1",
            ProgressUpdate::description("Installed")
                .with_status(JobStatus::Finished)
                .with_summary(json!({"name": "a"})),
        )
        .await;

        let record = sink.get("job-1").unwrap();
        assert_eq!(record.description, "Installed");
        assert_eq!(record.status, Some(JobStatus::Finished));
        assert_eq!(record.progress, 20);
        assert_eq!(record.summary, Some(json!({"name": "a"})));
        assert_eq!(sink.history("job-1").len(), 3);

        assert!(sink.get("job-2").is_none());
        assert!(sink.history("job-2").is_empty());
    }

    #[tokio::test]
    async fn test_remove_evicts_jobs() {
        let sink = MemoryProgressSink::new();
        sink.report("done", ProgressUpdate::default().with_status(JobStatus::Finished))
            .await;
        sink.report("bad", ProgressUpdate::default().with_status(JobStatus::Failed))
            .await;
        sink.report("busy", ProgressUpdate::progress(10)).await;
        assert_eq!(sink.len(), 3);

        assert_eq!(sink.remove("busy").unwrap().progress, 10);
        assert!(sink.remove("busy").is_none());
        assert!(sink.history("busy").is_empty());

        sink.report("busy", ProgressUpdate::default().with_status(JobStatus::InProgress))
            .await;
        assert_eq!(sink.remove_terminal(), 2);
        assert!(sink.get("done").is_none());
        assert!(sink.history("bad").is_empty());
        assert!(sink.get("busy").is_some());
        assert!(!sink.is_empty());
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_sink() {
        let first = Arc::new(MemoryProgressSink::new());
        let second = Arc::new(MemoryProgressSink::new());
        let sinks: Vec<Arc<dyn ProgressSink>> =
            vec![Arc::new(LogProgressSink), first.clone(), second.clone()];
        let fanout = FanoutProgressSink::new(sinks);
        fanout
            .report("job", ProgressUpdate::description("Downloading").with_progress(5))
            .await;
        fanout
            .report(
                "job",
                ProgressUpdate::description("oops").with_status(JobStatus::Failed),
            )
            .await;

        for sink in [&first, &second] {
            let record = sink.get("job").unwrap();
            assert_eq!(record.description, "oops");
            assert_eq!(record.status, Some(JobStatus::Failed));
            assert_eq!(record.progress, 5);
            assert_eq!(sink.history("job").len(), 2);
        }
    }

    #[tokio::test]
    async fn test_log_sink_accepts_every_status() {
        let sink = LogProgressSink;
        sink.report("job", ProgressUpdate::progress(30)).await;
        sink.report(
            "job",
            ProgressUpdate::description("done").with_status(JobStatus::Finished),
        )
        .await;
        sink.report(
            "job",
            ProgressUpdate::description("bad").with_status(JobStatus::Failed),
        )
        .await;
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&JobStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
    }
}
