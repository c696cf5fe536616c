//! FTP fetcher: list once, then bounded-parallel one-shot downloads.
//!
//! Every file downloads over a fresh control connection so one slow or
//! wedged transfer cannot head-of-line block the rest. Only the initial
//! directory listing is fatal; per-file failures are retried with linear
//! backoff and then reported alongside the successes.

use anyhow::{Context, Result};
use futures::io::AsyncReadExt;
use futures::stream::{self, StreamExt};
use globset::{Glob, GlobMatcher};
use partsync_protocol::types::FtpConfig;
use partsync_protocol::SyncError;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use suppaftp::async_native_tls::TlsConnector;
use suppaftp::list::File as ListEntry;
use suppaftp::types::FileType;
use suppaftp::{AsyncFtpStream, AsyncNativeTlsConnector, AsyncNativeTlsFtpStream};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// A file we managed to pull down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub name: String,
    pub size: u64,
    pub path: PathBuf,
}

/// A file that failed all its attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedFile {
    pub name: String,
    pub reason: String,
}

/// Outcome of one fetch stage.
#[derive(Debug, Default)]
pub struct FetchReport {
    pub downloaded: Vec<DownloadedFile>,
    pub failed: Vec<FailedFile>,
    pub bytes: u64,
    pub elapsed: Duration,
}

pub struct FtpFetcher {
    config: FtpConfig,
    parallel: usize,
    retries: u32,
    timeout: Duration,
}

/// One control connection, plain or implicit-TLS.
enum Session {
    Plain(AsyncFtpStream),
    Secure(AsyncNativeTlsFtpStream),
}

impl FtpFetcher {
    pub fn new(config: FtpConfig, parallel: usize, retries: u32, timeout: Duration) -> Self {
        Self {
            config,
            parallel: parallel.max(1),
            retries: retries.max(1),
            timeout,
        }
    }

    /// List the remote directory, then download every glob match into
    /// `dest_dir`. Fails only if the listing itself fails.
    pub async fn fetch_all(&self, dest_dir: &Path) -> Result<FetchReport> {
        let started = Instant::now();
        tokio::fs::create_dir_all(dest_dir).await?;

        let matcher = glob_matcher(&self.config.file_glob)?;
        let entries = self
            .list_remote()
            .await
            .map_err(|e| SyncError::Transport(format!("FTP listing failed: {e:#}")))?;

        let wanted: Vec<RemoteFile> = entries
            .into_iter()
            .filter(|f| matcher.is_match(&f.name))
            .collect();
        info!(
            host = %self.config.host,
            files = wanted.len(),
            glob = %self.config.file_glob,
            "remote listing complete"
        );

        let results: Vec<Result<DownloadedFile, FailedFile>> =
            stream::iter(wanted.into_iter().map(|file| {
                let dest = dest_dir.join(&file.name);
                self.download_with_retry(file, dest)
            }))
            .buffer_unordered(self.parallel)
            .collect()
            .await;

        let mut report = FetchReport {
            elapsed: started.elapsed(),
            ..Default::default()
        };
        for result in results {
            match result {
                Ok(file) => {
                    report.bytes += file.size;
                    report.downloaded.push(file);
                }
                Err(failure) => report.failed.push(failure),
            }
        }
        report.elapsed = started.elapsed();

        info!(
            downloaded = report.downloaded.len(),
            failed = report.failed.len(),
            bytes = report.bytes,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "fetch stage done"
        );
        Ok(report)
    }

    /// One connection to list the directory; closed before downloads start.
    async fn list_remote(&self) -> Result<Vec<RemoteFile>> {
        let mut session = self.connect().await?;
        let lines = session.list().await?;
        session.quit().await;

        let mut files = Vec::new();
        for line in &lines {
            match ListEntry::try_from(line.as_str()) {
                Ok(entry) if entry.is_file() => files.push(RemoteFile {
                    name: entry.name().to_string(),
                    size: entry.size() as u64,
                }),
                Ok(_) => {}
                Err(e) => debug!(line = %line, error = %e, "unparseable listing line"),
            }
        }
        Ok(files)
    }

    async fn download_with_retry(
        &self,
        file: RemoteFile,
        dest: PathBuf,
    ) -> Result<DownloadedFile, FailedFile> {
        let mut last_error = String::new();

        for attempt in 1..=self.retries {
            match tokio::time::timeout(self.timeout, self.fetch_one(&file.name, &dest)).await {
                Ok(Ok(bytes)) => {
                    debug!(file = %file.name, bytes, attempt, "downloaded");
                    return Ok(DownloadedFile {
                        name: file.name,
                        size: bytes,
                        path: dest,
                    });
                }
                Ok(Err(e)) => last_error = format!("{e:#}"),
                Err(_) => {
                    last_error = format!("timed out after {}s", self.timeout.as_secs())
                }
            }

            warn!(file = %file.name, attempt, error = %last_error, "download attempt failed");
            if attempt < self.retries {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
        }

        // A failed file leaves nothing behind.
        let _ = tokio::fs::remove_file(&dest).await;
        Err(FailedFile {
            name: file.name,
            reason: last_error,
        })
    }

    /// One-shot download over a fresh connection. Truncates any partial
    /// file from a previous attempt.
    async fn fetch_one(&self, name: &str, dest: &Path) -> Result<u64> {
        let mut session = self.connect().await?;

        let mut out = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("Failed to create {}", dest.display()))?;

        let bytes = session.download_to(name, &mut out).await?;
        out.flush().await?;
        session.quit().await;
        Ok(bytes)
    }

    async fn connect(&self) -> Result<Session> {
        let addr = format!("{}:{}", self.config.host, self.config.port);

        let mut session = if self.config.secure {
            let connector = AsyncNativeTlsConnector::from(TlsConnector::new());
            let ftp = AsyncNativeTlsFtpStream::connect_secure_implicit(
                addr.as_str(),
                connector,
                &self.config.host,
            )
            .await
            .with_context(|| format!("FTPS connect to {} failed", addr))?;
            Session::Secure(ftp)
        } else {
            let ftp = AsyncFtpStream::connect(addr.as_str())
                .await
                .with_context(|| format!("FTP connect to {} failed", addr))?;
            Session::Plain(ftp)
        };

        session.login(&self.config.user, &self.config.password).await?;
        if !self.config.remote_path.is_empty() {
            session.cwd(&self.config.remote_path).await?;
        }
        session.binary().await?;
        Ok(session)
    }
}

impl Session {
    async fn login(&mut self, user: &str, password: &str) -> Result<()> {
        match self {
            Session::Plain(ftp) => ftp.login(user, password).await?,
            Session::Secure(ftp) => ftp.login(user, password).await?,
        }
        Ok(())
    }

    async fn cwd(&mut self, path: &str) -> Result<()> {
        match self {
            Session::Plain(ftp) => ftp.cwd(path).await?,
            Session::Secure(ftp) => ftp.cwd(path).await?,
        }
        Ok(())
    }

    async fn binary(&mut self) -> Result<()> {
        match self {
            Session::Plain(ftp) => ftp.transfer_type(FileType::Binary).await?,
            Session::Secure(ftp) => ftp.transfer_type(FileType::Binary).await?,
        }
        Ok(())
    }

    async fn list(&mut self) -> Result<Vec<String>> {
        let lines = match self {
            Session::Plain(ftp) => ftp.list(None).await?,
            Session::Secure(ftp) => ftp.list(None).await?,
        };
        Ok(lines)
    }

    async fn download_to(&mut self, name: &str, out: &mut tokio::fs::File) -> Result<u64> {
        match self {
            Session::Plain(ftp) => {
                let mut stream = ftp.retr_as_stream(name).await?;
                let bytes = copy_to_file(&mut stream, out).await?;
                ftp.finalize_retr_stream(stream).await?;
                Ok(bytes)
            }
            Session::Secure(ftp) => {
                let mut stream = ftp.retr_as_stream(name).await?;
                let bytes = copy_to_file(&mut stream, out).await?;
                ftp.finalize_retr_stream(stream).await?;
                Ok(bytes)
            }
        }
    }

    /// Best-effort close; servers that drop the connection first are fine.
    async fn quit(&mut self) {
        let result = match self {
            Session::Plain(ftp) => ftp.quit().await,
            Session::Secure(ftp) => ftp.quit().await,
        };
        if let Err(e) = result {
            debug!(error = %e, "FTP quit failed");
        }
    }
}

#[derive(Debug, Clone)]
struct RemoteFile {
    name: String,
    size: u64,
}

/// Linear backoff: 1s, 2s, 3s, ...
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(partsync_protocol::defaults::FTP_BACKOFF_SECS * attempt as u64)
}

fn glob_matcher(pattern: &str) -> Result<GlobMatcher> {
    let pattern = if pattern.is_empty() {
        partsync_protocol::defaults::DEFAULT_FILE_GLOB
    } else {
        pattern
    };
    Ok(Glob::new(pattern)
        .map_err(|e| SyncError::Config(format!("bad file glob '{}': {}", pattern, e)))?
        .compile_matcher())
}

async fn copy_to_file<R>(reader: &mut R, out: &mut tokio::fs::File) -> Result<u64>
where
    R: futures::io::AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_filters_csv_by_default() {
        let matcher = glob_matcher("").unwrap();
        assert!(matcher.is_match("parts_DS1_part01.csv"));
        assert!(!matcher.is_match("readme.txt"));

        let matcher = glob_matcher("parts_*.csv").unwrap();
        assert!(matcher.is_match("parts_DS1_part01.csv"));
        assert!(!matcher.is_match("inventory.csv"));
    }

    #[test]
    fn bad_glob_is_a_config_error() {
        let err = glob_matcher("parts[").unwrap_err();
        assert!(err.to_string().contains("bad file glob"));
    }

    #[test]
    fn backoff_is_linear_in_attempts() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(3));
    }
}
