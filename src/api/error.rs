use thiserror::Error;

/// A failed request against the CMMS backend.
///
/// Every variant means "request failed" to the reconciler; the split only
/// matters for what the caller shows the user.
#[derive(Debug, Error)]
pub enum RemoteError {
  #[error("network error: {0}")]
  Network(#[from] reqwest::Error),

  #[error("server returned {status}: {body}")]
  Status { status: u16, body: String },

  #[error("invalid request url: {0}")]
  Url(#[from] url::ParseError),

  #[error("failed to decode response: {0}")]
  Decode(String),
}

impl RemoteError {
  /// HTTP status code, when the server answered at all.
  pub fn status(&self) -> Option<u16> {
    match self {
      RemoteError::Status { status, .. } => Some(*status),
      RemoteError::Network(e) => e.status().map(|s| s.as_u16()),
      _ => None,
    }
  }
}
