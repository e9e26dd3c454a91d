//! Turns a task's source reference into a readable local file.
//!
//! Remote sources are downloaded into the scratch directory and removed again
//! when the returned [`LocalSource`] is dropped, whatever the outcome of the
//! processing that used it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::{Client, Url};
use tokio_retry::RetryIf;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

static DOWNLOAD_RETRIES: usize = 2;
// Delays of 2^n * RETRY_FACTOR ms: 100ms, then 200ms.
static RETRY_FACTOR: u64 = 50;

pub fn parse_remote(reference: &str) -> Option<Url> {
  Url::parse(reference)
    .ok()
    .filter(|url| matches!(url.scheme(), "http" | "https"))
}

/// Base name without extension, and the lowercased extension with its dot.
pub fn split_name(path: &Path) -> (String, String) {
  let name = path
    .file_stem()
    .map(|s| s.to_string_lossy().into_owned())
    .filter(|s| !s.is_empty())
    .unwrap_or_else(|| "image".to_string());
  let extension = path
    .extension()
    .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
    .unwrap_or_default();
  (name, extension)
}

/// A downloaded file that is deleted on drop.
#[derive(Debug)]
pub struct TempArtifact {
  path: PathBuf,
}

impl TempArtifact {
  fn new(path: PathBuf) -> Self {
    Self { path }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl Drop for TempArtifact {
  fn drop(&mut self) {
    match std::fs::remove_file(&self.path) {
      Ok(()) => debug!("Removed temporary file {}", self.path.display()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => warn!("Failed to delete temporary file {}: {}", self.path.display(), e),
    }
  }
}

#[derive(Debug)]
pub struct LocalSource {
  pub path: PathBuf,
  pub name: String,
  pub extension: String,
  _temp: Option<TempArtifact>,
}

#[derive(Debug, Clone)]
pub struct SourceFetcher {
  client: Client,
  temp_dir: PathBuf,
  timeout: Duration,
}

impl SourceFetcher {
  pub fn new(temp_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
    let client = Client::builder()
      .user_agent(concat!("imgq/", env!("CARGO_PKG_VERSION")))
      .timeout(timeout)
      .build()
      .unwrap_or_default();
    Self {
      client,
      temp_dir: temp_dir.into(),
      timeout,
    }
  }

  pub async fn resolve(&self, reference: &str) -> Result<LocalSource> {
    let source = match parse_remote(reference) {
      Some(url) => {
        let temp = self.download(&url).await?;
        let (name, extension) = split_name(Path::new(url.path()));
        LocalSource {
          path: temp.path().to_path_buf(),
          name,
          extension,
          _temp: Some(temp),
        }
      }
      None => {
        let path = PathBuf::from(reference);
        let (name, extension) = split_name(&path);
        LocalSource {
          path,
          name,
          extension,
          _temp: None,
        }
      }
    };

    if !tokio::fs::try_exists(&source.path).await.unwrap_or(false) {
      return Err(Error::SourceNotFound(source.path.display().to_string()));
    }
    Ok(source)
  }

  async fn download(&self, url: &Url) -> Result<TempArtifact> {
    tokio::fs::create_dir_all(&self.temp_dir).await?;
    let (_, extension) = split_name(Path::new(url.path()));
    let temp = TempArtifact::new(self.temp_dir.join(format!("temp_{}{}", Uuid::new_v4(), extension)));

    let strategy = ExponentialBackoff::from_millis(2).factor(RETRY_FACTOR).take(DOWNLOAD_RETRIES);
    let bytes = RetryIf::spawn(strategy, move || self.fetch_once(url), Error::is_transient_download).await?;

    tokio::fs::write(temp.path(), &bytes).await?;
    info!("Downloaded {} ({} bytes) to {}", url, bytes.len(), temp.path().display());
    Ok(temp)
  }

  async fn fetch_once(&self, url: &Url) -> Result<Vec<u8>> {
    let request = async {
      let response = self.client.get(url.clone()).send().await?.error_for_status()?;
      let body = response.bytes().await?;
      Ok::<_, reqwest::Error>(body.to_vec())
    };

    match tokio::time::timeout(self.timeout, request).await {
      Err(_) => Err(self.timed_out(url)),
      Ok(Err(e)) if e.is_timeout() => Err(self.timed_out(url)),
      Ok(Err(e)) => {
        let transient = !e.status().is_some_and(|s| s.is_client_error());
        warn!("Download of {} failed (transient: {}): {}", url, transient, e);
        Err(Error::DownloadFailed {
          url: url.to_string(),
          reason: e.to_string(),
          transient,
        })
      }
      Ok(Ok(bytes)) => Ok(bytes),
    }
  }

  fn timed_out(&self, url: &Url) -> Error {
    Error::DownloadTimeout {
      url: url.to_string(),
      after: self.timeout,
    }
  }
}
