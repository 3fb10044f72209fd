use crate::codec;
use std::{error::Error as StdError, io};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("IO error: {0}")]
  Io(#[from] io::Error),
  #[error("codec error: {0}")]
  Codec(#[from] codec::Error),
  #[error("connection is not open")]
  NotOpen,
  #[error("channel is not open")]
  ChannelNotOpen,
  #[error("channel is closed")]
  ChannelClosed,
  #[error("no live channel with id {0}")]
  UnknownChannel(i32),
  #[error("no handler registered for sample kind {0:#018x}")]
  UnknownSample(u64),
  #[error("restriction ack {acked} does not match any request (local restriction is {local})")]
  InconsistentRestriction { local: bool, acked: bool },
  #[error("channel {0}: important action was never acknowledged")]
  Unacknowledged(i32),
  #[error("endpoint is closed")]
  EndpointClosed,
  #[error("User error: {0}")]
  User(Box<dyn StdError + Send + Sync>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
  pub fn custom<T>(err: T) -> Error
  where
    T: StdError + Send + Sync + 'static,
  {
    Error::User(Box::new(err))
  }

  pub fn downcast<T>(&self) -> Option<&T>
  where
    T: StdError + Send + Sync + 'static,
  {
    match self {
      Error::User(err) => err.downcast_ref(),
      _ => None,
    }
  }
}

/// Why a channel left the open state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
  /// The channel was closed on this side via `.close()`, either directly
  /// or because its connection was closed.
  Normal,
  /// The remote side sent a `channel_close`.
  Remote,
  /// The connection's transport failed or reached end-of-stream, or an
  /// important action ran out of resends, so the channel can no longer be
  /// reached.
  Transport,
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn lower_level_errors_convert() {
    fn frame() -> Result<()> {
      Err(codec::Error::TooLarge("frame"))?
    }
    fn transport() -> Result<()> {
      Err(io::Error::from(io::ErrorKind::BrokenPipe))?
    }
    assert!(matches!(frame(), Err(Error::Codec(codec::Error::TooLarge("frame")))));
    assert!(matches!(transport(), Err(Error::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe));
    assert_eq!(
      frame().unwrap_err().to_string(),
      "codec error: maximum frame size exceeded"
    );
  }

  #[test]
  fn downcast_custom_error() {
    #[derive(Debug, Clone, Copy, PartialEq, Error)]
    #[error("{info}")]
    struct ErrorData {
      info: &'static str,
    }

    let input = ErrorData { info: "test" };
    let err = Error::custom(input);
    assert_eq!(err.downcast::<ErrorData>(), Some(&input));
    assert!(Error::NotOpen.downcast::<ErrorData>().is_none());
  }

  #[test]
  fn inconsistent_restriction_names_both_flags() {
    let err = Error::InconsistentRestriction { local: false, acked: true };
    assert_eq!(
      err.to_string(),
      "restriction ack true does not match any request (local restriction is false)"
    );
  }
}
