use crate::error::*;
use crate::job::{InstallJob, JobReporter};
use crate::progress::ProgressUpdate;
use futures_util::StreamExt;
use log::*;
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

/// Downloading owns the first half of the job's progress range.
pub const DOWNLOAD_PROGRESS_SHARE: u64 = 50;

/// A fetched archive. The scratch file is deleted when this value is dropped
/// unless it is closed explicitly first.
#[derive(Debug)]
pub struct DownloadedArchive {
    pub file: NamedTempFile,
    pub sha256: String,
}

impl DownloadedArchive {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
    progress_interval: Duration,
}

impl Downloader {
    pub fn new(timeout: Duration, progress_interval: Duration) -> AddonResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AddonError::ConfigError(format!("build http client failed: {}", e)))?;
        Ok(Downloader {
            client,
            progress_interval,
        })
    }

    /// Streams `url` into a scratch file inside `scratch_dir`.
    ///
    /// Percentages (scaled into 0..=50) are reported at most once per
    /// progress interval, and only when the server sent a content length.
    pub async fn fetch(
        &self,
        url: &str,
        scratch_dir: &Path,
        expected_sha256: Option<&str>,
        job: &mut InstallJob,
        reporter: &mut JobReporter,
    ) -> AddonResult<DownloadedArchive> {
        let expected_sha256 = expected_sha256.map(normalize_checksum).transpose()?;

        tokio::fs::create_dir_all(scratch_dir)
            .await
            .map_err(|e| AddonError::fs(scratch_dir, e))?;
        let scratch = tempfile::Builder::new()
            .prefix(".download-")
            .suffix(".part")
            .tempfile_in(scratch_dir)
            .map_err(|e| AddonError::fs(scratch_dir, e))?;

        let response = self.client.get(url).send().await.map_err(|e| {
            error!("Failed to send request to {}: {}", url, e);
            AddonError::transfer(url, format!("Failed to send request: {}", e))
        })?;

        if !response.status().is_success() {
            error!("Failed to download {}: HTTP {}", url, response.status());
            return Err(AddonError::transfer(
                url,
                format!("HTTP {}", response.status()),
            ));
        }

        let bytes_total = response.content_length().filter(|len| *len > 0);
        job.bytes_total = bytes_total.unwrap_or(0);
        job.bytes_done = 0;

        let std_file = scratch
            .as_file()
            .try_clone()
            .map_err(|e| AddonError::fs(scratch.path(), e))?;
        let mut file = tokio::fs::File::from_std(std_file);
        let mut hasher = Sha256::new();
        let mut last_report: Option<Instant> = None;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| {
                error!("Stream error from {}: {}", url, e);
                AddonError::transfer(url, format!("Stream error: {}", e))
            })?;
            file.write_all(&bytes)
                .await
                .map_err(|e| AddonError::fs(scratch.path(), e))?;
            hasher.update(&bytes);
            job.bytes_done += bytes.len() as u64;

            if let Some(total) = bytes_total {
                let due = last_report.map_or(true, |at| at.elapsed() >= self.progress_interval);
                if due {
                    reporter
                        .report(ProgressUpdate::progress(download_progress(
                            job.bytes_done,
                            total,
                        )))
                        .await;
                    last_report = Some(Instant::now());
                }
            }
        }
        file.flush()
            .await
            .map_err(|e| AddonError::fs(scratch.path(), e))?;
        drop(file);

        let sha256 = hex::encode(hasher.finalize());
        if let Some(expected) = expected_sha256 {
            if expected != sha256 {
                return Err(AddonError::transfer(
                    url,
                    format!("checksum mismatch: expected {}, got {}", expected, sha256),
                ));
            }
        }

        info!(
            "Download {} to {} success, {} bytes, sha256:{}",
            url,
            scratch.path().display(),
            job.bytes_done,
            sha256
        );
        Ok(DownloadedArchive {
            file: scratch,
            sha256,
        })
    }
}

fn download_progress(done: u64, total: u64) -> u8 {
    let percent = (done.saturating_mul(100) / total).min(100);
    (percent * DOWNLOAD_PROGRESS_SHARE / 100) as u8
}

/// Accepts `sha256:<hex>` or bare hex, returns lowercase hex.
pub fn normalize_checksum(checksum: &str) -> AddonResult<String> {
    let hex_part = checksum
        .trim()
        .strip_prefix("sha256:")
        .unwrap_or(checksum.trim())
        .to_ascii_lowercase();
    if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AddonError::ConfigError(format!(
            "invalid sha256 checksum: {}",
            checksum
        )));
    }
    Ok(hex_part)
}
