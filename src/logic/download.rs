//! Direct artifact download for the dependency fallback path
//!
//! Only used when every package source failed. The artifact is streamed into
//! a temp file next to its destination and renamed once complete, so a
//! partially downloaded installer is never executed.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::Write;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default timeout for a whole artifact download
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Temp file a download streams into: `<file>.partial` beside `dest`
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(".partial");
    dest.with_file_name(name)
}

/// Fetches a remote artifact to a local path
pub trait ArtifactFetcher: Send + Sync {
    /// Download `uri` to `dest`, returning the number of bytes written
    fn fetch(&self, uri: &str, dest: &Path) -> Result<u64>;
}

/// `ArtifactFetcher` over a blocking reqwest client
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build download client")?;
        Ok(Self { client })
    }
}

impl ArtifactFetcher for HttpFetcher {
    fn fetch(&self, uri: &str, dest: &Path) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create download directory {:?}", parent))?;
        }

        let mut response = self
            .client
            .get(uri)
            .send()
            .with_context(|| format!("Failed to request {}", uri))?
            .error_for_status()
            .with_context(|| format!("Download of {} was refused", uri))?;

        let partial = partial_path(dest);
        let bytes = stream_to(&mut response, &partial, uri)
            .and_then(|bytes| {
                fs::rename(&partial, dest)
                    .with_context(|| format!("Failed to move download into place at {:?}", dest))?;
                Ok(bytes)
            })
            .inspect_err(|_| {
                if let Err(e) = fs::remove_file(&partial) {
                    tracing::debug!("No partial download to remove at {:?}: {}", partial, e);
                }
            })?;

        tracing::info!("Downloaded {} ({} bytes) to {:?}", uri, bytes, dest);
        Ok(bytes)
    }
}

fn stream_to(response: &mut reqwest::blocking::Response, partial: &Path, uri: &str) -> Result<u64> {
    let mut file =
        File::create(partial).with_context(|| format!("Failed to create {:?}", partial))?;
    let bytes = response
        .copy_to(&mut file)
        .with_context(|| format!("Failed while downloading {}", uri))?;
    file.flush()?;
    file.sync_all()
        .with_context(|| format!("Failed to flush {:?}", partial))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use tempfile::TempDir;

    /// Serve one response that announces `length` bytes and sends `body`
    fn serve_once(length: usize, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 0 && line != "\r\n" {
                line.clear();
            }
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                length
            );
            stream.write_all(head.as_bytes()).unwrap();
            stream.write_all(body).unwrap();
        });
        format!("http://{}/tool.msi", addr)
    }

    #[test]
    fn test_partial_path_keeps_the_full_file_name() {
        assert_eq!(
            partial_path(Path::new("/tmp/dl/tool.msi")),
            PathBuf::from("/tmp/dl/tool.msi.partial")
        );
        assert_ne!(
            partial_path(Path::new("tool.msi")),
            partial_path(Path::new("tool.exe"))
        );
    }

    #[test]
    fn test_complete_download_is_moved_into_place() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("tool.msi");
        let uri = serve_once(5, b"hello");

        let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
        assert_eq!(fetcher.fetch(&uri, &dest).unwrap(), 5);
        assert_eq!(fs::read(&dest).unwrap(), b"hello");
        assert!(!partial_path(&dest).exists());
    }

    #[test]
    fn test_truncated_download_leaves_no_files() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("tool.msi");
        let uri = serve_once(1000, b"only a few bytes");

        let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
        assert!(fetcher.fetch(&uri, &dest).is_err());
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[test]
    fn test_unreachable_host_is_error_and_leaves_nothing() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("tool.msi");
        let fetcher = HttpFetcher::new(Duration::from_secs(2)).unwrap();
        assert!(fetcher.fetch("http://127.0.0.1:9/tool.msi", &dest).is_err());
        assert!(!dest.exists());
    }
}
