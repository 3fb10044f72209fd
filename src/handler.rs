use crate::{channel::Channel, error::Error};
use std::borrow::Cow;

pub enum Decision {
  Accept,
  Reject(Option<Cow<'static, str>>),
}

/// Connection-level application callbacks.
///
/// Methods are invoked from the connection's decode loop, so they must not
/// block on that connection's inbound traffic.
pub trait Handler: Send + Sync {
  /// Called when the remote side proposes a new channel, with the channel
  /// as it would be registered locally.
  ///
  /// Returning `Reject(...)` answers the request negatively; the channel is
  /// then dropped without ever being registered.
  #[allow(unused_variables)]
  fn on_channel_request(&self, channel: &Channel) -> Decision {
    Decision::Accept
  }
  /// Called on the initiating side when the remote side rejected a channel.
  /// The channel stays in the ready state until it is closed.
  fn on_channel_rejected(&self, channel: &Channel) {
    log::info!("channel {} was rejected by the remote side", channel.local_id());
  }
  /// Called for protocol errors that do not affect the rest of the connection,
  /// such as messages addressed to unknown channels or undecodable samples.
  fn on_error(&self, error: Error) {
    log::warn!("{}", error);
  }
}

impl<F> Handler for F
where
  F: Fn(&Channel) -> Decision + Send + Sync,
{
  fn on_channel_request(&self, channel: &Channel) -> Decision {
    self(channel)
  }
}

/// Accepts every channel request.
pub struct AcceptAll;

impl Handler for AcceptAll {}
