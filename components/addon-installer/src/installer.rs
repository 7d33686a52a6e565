use crate::archive::AddonArchive;
use crate::config::InstallerConfig;
use crate::downloader::{DownloadedArchive, Downloader};
use crate::error::*;
use crate::job::*;
use crate::manifest::{ManifestParser, PackageDescriptor};
use crate::progress::*;
use crate::unpacker::{UnpackStage, Unpacker};
use crate::version_util::VersionUtil;
use crate::worker_pool::WorkerPool;
use log::*;
use semver::Version;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const PARSED_PROGRESS: u8 = 50;
const PLACING_PROGRESS: u8 = 75;
const DONE_PROGRESS: u8 = 100;

#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub descriptor: PackageDescriptor,
    pub target: PathBuf,
    pub sha256: Option<String>,
}

/// Entry point for the triggering layer. Install calls return nothing: every
/// state change, including failure, goes to the progress sink.
pub struct AddonInstaller {
    config: InstallerConfig,
    platform_version: Version,
    downloader: Downloader,
    unpacker: Unpacker,
    pool: WorkerPool,
    sink: Arc<dyn ProgressSink>,
}

impl AddonInstaller {
    pub fn new(config: InstallerConfig, sink: Arc<dyn ProgressSink>) -> AddonResult<Self> {
        let pool = WorkerPool::new(config.unpack_workers);
        Self::with_worker_pool(config, sink, pool)
    }

    /// Lets several installers share one pool of blocking workers.
    pub fn with_worker_pool(
        config: InstallerConfig,
        sink: Arc<dyn ProgressSink>,
        pool: WorkerPool,
    ) -> AddonResult<Self> {
        let platform_version = config.platform_version()?;
        let downloader = Downloader::new(config.http_timeout(), config.progress_interval())?;
        let unpacker = Unpacker::new(config.install_root.clone());
        info!(
            "addon installer ready, root:{}, platform:{}, workers:{}",
            config.install_root.display(),
            platform_version,
            pool.size()
        );
        Ok(AddonInstaller {
            config,
            platform_version,
            downloader,
            unpacker,
            pool,
            sink,
        })
    }

    pub fn install_root(&self) -> &Path {
        &self.config.install_root
    }

    pub fn platform_version(&self) -> &Version {
        &self.platform_version
    }

    pub async fn install_from_url(&self, job_id: &str, url: &str) {
        self.install_from_url_with_checksum(job_id, url, None).await
    }

    pub async fn install_from_url_with_checksum(
        &self,
        job_id: &str,
        url: &str,
        checksum: Option<&str>,
    ) {
        let mut job = InstallJob::new(job_id, ArchiveSource::Url(url.to_string()));
        let mut reporter = JobReporter::new(self.sink.clone(), job_id);
        reporter
            .report(
                ProgressUpdate::description(format!("Downloading addon from URL {}", url))
                    .with_status(JobStatus::InProgress),
            )
            .await;

        match self.run_url_job(&mut job, &mut reporter, url, checksum).await {
            Ok((outcome, downloaded)) => {
                self.finish(&mut job, &mut reporter, &outcome).await;
                if let Err(err) = close_download(downloaded) {
                    warn!("job {}: {}", job.job_id, err);
                }
            }
            Err(err) => self.fail(&mut job, &mut reporter, err).await,
        }
    }

    pub async fn install_from_local_archive(&self, job_id: &str, path: &Path) {
        let mut job = InstallJob::new(job_id, ArchiveSource::LocalArchive(path.to_path_buf()));
        let mut reporter = JobReporter::new(self.sink.clone(), job_id);
        reporter
            .report(
                ProgressUpdate::description(format!("Installing addon from {}", path.display()))
                    .with_status(JobStatus::InProgress),
            )
            .await;

        match self
            .install_archive(&mut job, &mut reporter, path.to_path_buf(), None)
            .await
        {
            Ok(outcome) => {
                self.finish(&mut job, &mut reporter, &outcome).await;
                if !self.config.keep_local_archive {
                    if let Err(err) = remove_archive(path).await {
                        warn!("job {}: {}", job.job_id, err);
                    }
                }
            }
            Err(err) => self.fail(&mut job, &mut reporter, err).await,
        }
    }

    /// Runs the install on the scheduler in the background.
    pub fn spawn_install(self: &Arc<Self>, job_id: &str, source: ArchiveSource) -> JoinHandle<()> {
        let installer = self.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            match source {
                ArchiveSource::Url(url) => installer.install_from_url(&job_id, &url).await,
                ArchiveSource::LocalArchive(path) => {
                    installer.install_from_local_archive(&job_id, &path).await
                }
            }
        })
    }

    async fn run_url_job(
        &self,
        job: &mut InstallJob,
        reporter: &mut JobReporter,
        url: &str,
        checksum: Option<&str>,
    ) -> AddonResult<(InstallOutcome, DownloadedArchive)> {
        let downloaded = self
            .downloader
            .fetch(url, self.install_root(), checksum, job, reporter)
            .await?;
        job.advance(JobPhase::Parsing)?;

        let outcome = self
            .install_archive(
                job,
                reporter,
                downloaded.path().to_path_buf(),
                Some(downloaded.sha256.clone()),
            )
            .await?;
        Ok((outcome, downloaded))
    }

    /// Parsing through installing, for an archive that is on local disk.
    async fn install_archive(
        &self,
        job: &mut InstallJob,
        reporter: &mut JobReporter,
        archive_path: PathBuf,
        sha256: Option<String>,
    ) -> AddonResult<InstallOutcome> {
        let platform = self.platform_version.clone();
        let (archive, descriptor) = self
            .pool
            .run(move || {
                let archive = AddonArchive::open(&archive_path)?;
                let descriptor = ManifestParser::parse_archive(&archive)?;
                VersionUtil::check_compatible(&platform, &descriptor)?;
                Ok((archive, descriptor))
            })
            .await?;

        reporter
            .report(
                ProgressUpdate::description(format!("Installing addon {}", descriptor.label()))
                    .with_status(JobStatus::InProgress)
                    .with_progress(PARSED_PROGRESS)
                    .with_summary(json!({
                        "descriptor": descriptor,
                        "source": job.source,
                    })),
            )
            .await;

        job.advance(JobPhase::Unpacking)?;
        reporter
            .report(ProgressUpdate::description(format!(
                "Unpacking addon {}",
                descriptor.label()
            )))
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let unpacker = self.unpacker.clone();
        let unit_descriptor = descriptor.clone();
        let unit = self
            .pool
            .run(move || unpacker.unpack(&archive, &unit_descriptor, Some(&tx)));

        let label = descriptor.label();
        let stages = async {
            while let Some(stage) = rx.recv().await {
                if stage == UnpackStage::Placing && job.phase == JobPhase::Unpacking {
                    job.advance(JobPhase::Installing)?;
                    reporter
                        .report(
                            ProgressUpdate::description(format!("Placing addon {}", label))
                                .with_progress(PLACING_PROGRESS),
                        )
                        .await;
                }
            }
            Ok::<(), AddonError>(())
        };

        let (target, staged) = tokio::join!(unit, stages);
        let target = target?;
        staged?;
        if job.phase == JobPhase::Unpacking {
            job.advance(JobPhase::Installing)?;
        }

        Ok(InstallOutcome {
            descriptor,
            target,
            sha256,
        })
    }

    async fn finish(&self, job: &mut InstallJob, reporter: &mut JobReporter, outcome: &InstallOutcome) {
        if let Err(err) = job.advance(JobPhase::Done) {
            return self.fail(job, reporter, err).await;
        }

        let descriptor = &outcome.descriptor;
        info!(
            "job {}: addon {} installed to {}",
            job.job_id,
            descriptor.label(),
            outcome.target.display()
        );
        reporter
            .report(
                ProgressUpdate::description(format!("Addon {} installed", descriptor.label()))
                    .with_status(JobStatus::Finished)
                    .with_progress(DONE_PROGRESS)
                    .with_summary(json!({
                        "name": descriptor.name,
                        "version": descriptor.version,
                        "packaging_kind": descriptor.packaging_kind,
                        "path": outcome.target,
                        "source": job.source,
                        "sha256": outcome.sha256,
                    })),
            )
            .await;
    }

    async fn fail(&self, job: &mut InstallJob, reporter: &mut JobReporter, err: AddonError) {
        let phase = job.phase;
        let kind = err.kind();
        error!("job {} failed during {:?}: {}", job.job_id, phase, err);
        job.fail();
        reporter
            .report(
                ProgressUpdate::description(format!("Error while installing addon: {}", err))
                    .with_status(JobStatus::Failed)
                    .with_error_kind(kind)
                    .with_summary(json!({
                        "source": job.source,
                        "phase": phase,
                        "retryable": kind.is_retryable(),
                    })),
            )
            .await;
    }
}

fn close_download(downloaded: DownloadedArchive) -> CleanupResult {
    let path = downloaded.path().display().to_string();
    downloaded
        .file
        .close()
        .map_err(|source| CleanupError { path, source })
}

async fn remove_archive(path: &Path) -> CleanupResult {
    tokio::fs::remove_file(path)
        .await
        .map_err(|source| CleanupError {
            path: path.display().to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_util::*;
    use tempfile::TempDir;

    struct Fixture {
        work: TempDir,
        root: PathBuf,
        sink: Arc<MemoryProgressSink>,
    }

    impl Fixture {
        fn new() -> Self {
            let work = TempDir::new().unwrap();
            let root = work.path().join("addons");
            Fixture {
                work,
                root,
                sink: Arc::new(MemoryProgressSink::new()),
            }
        }

        fn installer(&self, platform_version: &str) -> AddonInstaller {
            let mut config = InstallerConfig::new(self.root.clone());
            config.platform_version = platform_version.to_string();
            AddonInstaller::new(config, self.sink.clone()).unwrap()
        }

        fn tvpaint_zip(&self, file_name: &str) -> PathBuf {
            let path = self.work.path().join(file_name);
            write_zip(
                &path,
                &[
                    ("manifest.json", r#"{"name":"tvpaint","version":"1.0.0"}"#, 0o644),
                    ("addon/__init__.py", "tvpaint", 0o644),
                ],
            );
            path
        }
    }

    #[tokio::test]
    async fn test_local_install_succeeds() {
        let fx = Fixture::new();
        let archive = fx.tvpaint_zip("tvpaint.zip");
        fx.installer("1.1.0")
            .install_from_local_archive("job-1", &archive)
            .await;

        let record = fx.sink.get("job-1").unwrap();
        assert_eq!(record.status, Some(JobStatus::Finished));
        assert_eq!(record.progress, 100);
        assert_eq!(record.description, "Addon tvpaint 1.0.0 installed");
        let summary = record.summary.unwrap();
        assert_eq!(summary["name"], "tvpaint");
        assert_eq!(summary["version"], "1.0.0");

        assert!(fx.root.join("tvpaint/1.0.0/__init__.py").is_file());
        // the consumed archive is removed after success
        assert!(!archive.exists());
    }

    #[tokio::test]
    async fn test_local_report_sequence() {
        let fx = Fixture::new();
        let archive = fx.tvpaint_zip("tvpaint.zip");
        fx.installer("1.1.0")
            .install_from_local_archive("job-seq", &archive)
            .await;

        let descriptions: Vec<String> = fx
            .sink
            .history("job-seq")
            .into_iter()
            .filter_map(|u| u.description)
            .collect();
        assert_eq!(
            descriptions,
            vec![
                format!("Installing addon from {}", archive.display()),
                "Installing addon tvpaint 1.0.0".to_string(),
                "Unpacking addon tvpaint 1.0.0".to_string(),
                "Placing addon tvpaint 1.0.0".to_string(),
                "Addon tvpaint 1.0.0 installed".to_string(),
            ]
        );

        let progress: Vec<u8> = fx
            .sink
            .history("job-seq")
            .into_iter()
            .filter_map(|u| u.progress)
            .collect();
        assert_eq!(progress, vec![50, 75, 100]);
    }

    #[tokio::test]
    async fn test_incompatible_platform_creates_nothing() {
        let fx = Fixture::new();
        let archive = fx.tvpaint_zip("tvpaint.zip");
        fx.installer("1.3.0")
            .install_from_local_archive("job-2", &archive)
            .await;

        assert_eq!(fx.installer("1.3.0").platform_version(), &Version::new(1, 3, 0));
        let record = fx.sink.get("job-2").unwrap();
        assert_eq!(record.status, Some(JobStatus::Failed));
        assert_eq!(record.error_kind, Some(ErrorKind::UnsupportedPackage));
        assert!(!fx.root.join("tvpaint").exists());
        // failed local installs keep the caller's file
        assert!(archive.exists());
    }

    #[tokio::test]
    async fn test_keep_local_archive() {
        let fx = Fixture::new();
        let archive = fx.tvpaint_zip("tvpaint.zip");
        let mut config = InstallerConfig::new(fx.root.clone());
        config.keep_local_archive = true;
        let installer = AddonInstaller::new(config, fx.sink.clone()).unwrap();
        installer.install_from_local_archive("job-keep", &archive).await;

        assert_eq!(
            fx.sink.get("job-keep").unwrap().status,
            Some(JobStatus::Finished)
        );
        assert!(archive.exists());
    }

    #[tokio::test]
    async fn test_missing_local_archive_fails() {
        let fx = Fixture::new();
        let missing = fx.work.path().join("missing.zip");
        fx.installer("1.1.0")
            .install_from_local_archive("job-3", &missing)
            .await;
        let record = fx.sink.get("job-3").unwrap();
        assert_eq!(record.status, Some(JobStatus::Failed));
        assert_eq!(record.error_kind, Some(ErrorKind::Filesystem));
    }

    #[tokio::test]
    async fn test_bad_platform_version_rejected() {
        let fx = Fixture::new();
        let mut config = InstallerConfig::new(fx.root.clone());
        config.platform_version = "latest".to_string();
        assert!(AddonInstaller::new(config, fx.sink.clone()).is_err());
    }

    #[tokio::test]
    async fn test_spawn_install_runs_concurrently() {
        let fx = Fixture::new();
        let installer = Arc::new(fx.installer("1.1.0"));
        let mut handles = Vec::new();
        for i in 0..3 {
            let path = fx.work.path().join(format!("pkg-{}.zip", i));
            let yaml = format!("name: pkg{}\nversion: 0.{}.0\n", i, i);
            write_zip(&path, &[("package.yaml", yaml.as_str(), 0o644)]);
            handles.push(
                installer.spawn_install(&format!("job-{}", i), ArchiveSource::LocalArchive(path)),
            );
        }
        for handle in handles {
            handle.await.unwrap();
        }
        for i in 0..3 {
            let record = fx.sink.get(&format!("job-{}", i)).unwrap();
            assert_eq!(record.status, Some(JobStatus::Finished), "{:?}", record);
            assert!(fx
                .root
                .join(format!("pkg{}", i))
                .join(format!("0.{}.0", i))
                .join("package.yaml")
                .is_file());
        }
    }
}
