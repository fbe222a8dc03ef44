use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong on a replication session.
///
/// A clean end of stream is not an error: `ReplicationStream::recv` returns
/// `None` for it instead.
#[derive(Debug, Error)]
pub enum Error {
  /// The server deviated from the documented protocol grammar. Fatal for
  /// the frame and for the session.
  #[error("protocol error: {0}")]
  Protocol(String),

  /// An ErrorResponse from the backend, with its SQLSTATE code.
  #[error("server error {code}: {message}")]
  Backend { code: String, message: String },

  /// A decode ran past the end of the frame. A protocol deviation in its
  /// own right, kept separate so tests can pin down truncation.
  #[error("unexpected end of input while reading {0}")]
  Truncated(&'static str),

  #[error("invalid lsn {0:?}, expected H/L hex format")]
  InvalidLsn(String),

  /// A tuple message referenced a relation oid the server never announced.
  #[error("unknown relation oid {0}")]
  UnknownRelation(u32),

  #[error("{0} is not supported")]
  Unsupported(String),

  #[error(transparent)]
  Io(#[from] io::Error),
}

impl Error {
  pub(crate) fn protocol(message: impl Into<String>) -> Self {
    Self::Protocol(message.into())
  }

  pub(crate) fn unsupported(what: impl Into<String>) -> Self {
    Self::Unsupported(what.into())
  }
}
