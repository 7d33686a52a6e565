use crate::error::*;
use crate::progress::*;
use log::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveSource {
    Url(String),
    LocalArchive(PathBuf),
}

impl fmt::Display for ArchiveSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveSource::Url(url) => write!(f, "{}", url),
            ArchiveSource::LocalArchive(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Fetching,
    Parsing,
    Unpacking,
    Installing,
    Done,
    Failed,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Done | JobPhase::Failed)
    }
}

/// One install attempt. Lives only as long as the install call.
#[derive(Debug, Clone)]
pub struct InstallJob {
    pub job_id: String,
    pub source: ArchiveSource,
    pub phase: JobPhase,
    pub bytes_total: u64,
    pub bytes_done: u64,
}

impl InstallJob {
    /// Local archives are already on disk and start at `Parsing`.
    pub fn new(job_id: &str, source: ArchiveSource) -> Self {
        let phase = match source {
            ArchiveSource::Url(_) => JobPhase::Fetching,
            ArchiveSource::LocalArchive(_) => JobPhase::Parsing,
        };
        InstallJob {
            job_id: job_id.to_string(),
            source,
            phase,
            bytes_total: 0,
            bytes_done: 0,
        }
    }

    /// Moves strictly forward. `Failed` is reachable from any non-terminal phase.
    pub fn advance(&mut self, next: JobPhase) -> AddonResult<()> {
        if self.phase.is_terminal() || next <= self.phase {
            return Err(AddonError::JobStateError(format!(
                "job {} cannot move from {:?} to {:?}",
                self.job_id, self.phase, next
            )));
        }
        if next != JobPhase::Failed && next as u8 != self.phase as u8 + 1 {
            return Err(AddonError::JobStateError(format!(
                "job {} cannot skip from {:?} to {:?}",
                self.job_id, self.phase, next
            )));
        }
        info!("job {}: {:?} -> {:?}", self.job_id, self.phase, next);
        self.phase = next;
        Ok(())
    }

    pub fn fail(&mut self) {
        if !self.phase.is_terminal() {
            info!("job {}: {:?} -> Failed", self.job_id, self.phase);
            self.phase = JobPhase::Failed;
        }
    }
}

/// Per-job handle on the sink. Progress values never go backwards.
pub struct JobReporter {
    sink: Arc<dyn ProgressSink>,
    job_id: String,
    last_progress: u8,
}

impl JobReporter {
    pub fn new(sink: Arc<dyn ProgressSink>, job_id: &str) -> Self {
        JobReporter {
            sink,
            job_id: job_id.to_string(),
            last_progress: 0,
        }
    }

    pub async fn report(&mut self, mut update: ProgressUpdate) {
        if let Some(progress) = update.progress {
            let progress = progress.min(100);
            if progress < self.last_progress {
                update.progress = None;
                if update == ProgressUpdate::default() {
                    return;
                }
            } else {
                self.last_progress = progress;
                update.progress = Some(progress);
            }
        }
        self.sink.report(&self.job_id, update).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_job_walks_all_phases() {
        let mut job = InstallJob::new("j1", ArchiveSource::Url("http://x/a.zip".to_string()));
        assert_eq!(job.phase, JobPhase::Fetching);
        for phase in [
            JobPhase::Parsing,
            JobPhase::Unpacking,
            JobPhase::Installing,
            JobPhase::Done,
        ] {
            job.advance(phase).unwrap();
        }
        assert!(job.advance(JobPhase::Failed).is_err());
        job.fail();
        assert_eq!(job.phase, JobPhase::Done);
    }

    #[test]
    fn test_local_job_skips_fetching() {
        let mut job = InstallJob::new("j2", ArchiveSource::LocalArchive(PathBuf::from("/a.zip")));
        assert_eq!(job.phase, JobPhase::Parsing);
        assert!(job.advance(JobPhase::Fetching).is_err());
    }

    #[test]
    fn test_no_revisit_or_skip() {
        let mut job = InstallJob::new("j3", ArchiveSource::Url("http://x/a.zip".to_string()));
        job.advance(JobPhase::Parsing).unwrap();
        assert!(job.advance(JobPhase::Parsing).is_err());
        assert!(job.advance(JobPhase::Fetching).is_err());
        assert!(job.advance(JobPhase::Installing).is_err());
        job.advance(JobPhase::Failed).unwrap();
        assert!(job.advance(JobPhase::Unpacking).is_err());
    }

    #[tokio::test]
    async fn test_reporter_progress_is_monotonic() {
        let sink = Arc::new(MemoryProgressSink::new());
        let mut reporter = JobReporter::new(sink.clone(), "j4");
        reporter.report(ProgressUpdate::progress(30)).await;
        reporter.report(ProgressUpdate::progress(10)).await;
        reporter
            .report(ProgressUpdate::description("still going").with_progress(20))
            .await;
        reporter.report(ProgressUpdate::progress(250)).await;

        let history = sink.history("j4");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].progress, Some(30));
        assert_eq!(history[1].progress, None);
        assert_eq!(history[1].description.as_deref(), Some("still going"));
        assert_eq!(history[2].progress, Some(100));
        assert_eq!(sink.get("j4").unwrap().progress, 100);
    }
}
