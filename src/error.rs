use std::time::Duration;

use uuid::Uuid;

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
  #[error("Image file not found: {0}")]
  SourceNotFound(String),

  #[error("Invalid image: {0}")]
  InvalidImage(String),

  #[error("Download of {url} timed out after {}s", .after.as_secs())]
  DownloadTimeout { url: String, after: Duration },

  #[error("Download of {url} failed: {reason}")]
  DownloadFailed {
    url: String,
    reason: String,
    transient: bool,
  },

  #[error("Task not found: {0}")]
  TaskNotFound(Uuid),

  /// Raised when the store refuses a multi-record atomic commit. Handled by
  /// the consistency coordinator and never recorded on a task.
  #[error("Atomic commit unavailable: {0}")]
  TransactionUnsupported(String),

  #[error("Task {0} was completed by another run")]
  Superseded(Uuid),

  #[error("Persistence failure: {0}")]
  PersistenceFailure(StoreError),

  #[error("Invalid input: {0}")]
  InvalidInput(String),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}

impl Error {
  pub fn is_transient_download(&self) -> bool {
    matches!(self, Error::DownloadFailed { transient: true, .. })
  }
}

impl From<StoreError> for Error {
  fn from(err: StoreError) -> Self {
    match err {
      StoreError::TransactionUnsupported(reason) => Error::TransactionUnsupported(reason),
      StoreError::Superseded(task_id) => Error::Superseded(task_id),
      other => Error::PersistenceFailure(other),
    }
  }
}
