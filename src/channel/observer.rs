use super::Channel;
use crate::{detail::lock, error::Reason};
use std::{mem, sync::Arc};

type OpenedFn = Box<dyn FnOnce(&Channel) + Send>;
type ClosedFn = Box<dyn FnOnce(&Channel, Reason) + Send>;
type RestrictionFn = Arc<dyn Fn(&Channel) + Send + Sync>;
type RestrictionAcceptFn = Arc<dyn Fn(&Channel) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
  /// Created, handshake not completed.
  Ready,
  Open,
  Closed(Reason),
}

/// Handshake state together with the observers waiting on it.
///
/// State changes and subscriptions happen under the same lock, so an observer
/// either sees the transition or is replayed on subscription, never both.
pub(crate) struct Lifecycle {
  state: State,
  opened: Vec<OpenedFn>,
  closed: Vec<ClosedFn>,
  restriction: Vec<RestrictionFn>,
  restriction_accept: Option<RestrictionAcceptFn>,
}

impl Default for Lifecycle {
  fn default() -> Self {
    Self {
      state: State::Ready,
      opened: Vec::new(),
      closed: Vec::new(),
      restriction: Vec::new(),
      restriction_accept: None,
    }
  }
}

impl Lifecycle {
  pub fn state(&self) -> State {
    self.state
  }
}

impl Channel {
  /// Call `f` once the channel is open. If it already is, `f` runs
  /// immediately, before this returns.
  pub fn on_opened<F>(&self, f: F)
  where
    F: FnOnce(&Channel) + Send + 'static,
  {
    let mut lifecycle = lock(&self.inner.lifecycle);
    let state = lifecycle.state;
    match state {
      State::Open => {
        drop(lifecycle);
        f(self)
      }
      State::Ready => lifecycle.opened.push(Box::new(f)),
      // will never open
      State::Closed(_) => {}
    }
  }

  /// Call `f` once the channel is closed. If it already is, `f` runs
  /// immediately, before this returns.
  pub fn on_closed<F>(&self, f: F)
  where
    F: FnOnce(&Channel, Reason) + Send + 'static,
  {
    let mut lifecycle = lock(&self.inner.lifecycle);
    let state = lifecycle.state;
    match state {
      State::Closed(reason) => {
        drop(lifecycle);
        f(self, reason)
      }
      _ => lifecycle.closed.push(Box::new(f)),
    }
  }

  /// Call `f` every time the restriction state of the channel changes.
  ///
  /// If both sides have already agreed on restriction, `f` also runs
  /// immediately, before this returns.
  pub fn on_restriction_update<F>(&self, f: F)
  where
    F: Fn(&Channel) + Send + Sync + 'static,
  {
    let f: RestrictionFn = Arc::new(f);
    let mut lifecycle = lock(&self.inner.lifecycle);
    if matches!(lifecycle.state, State::Closed(_)) {
      return;
    }
    lifecycle.restriction.push(f.clone());
    drop(lifecycle);
    if self.is_restricted() {
      f(self)
    }
  }

  /// Decide whether restriction requests from the remote side are granted.
  ///
  /// Without a predicate every request is denied.
  pub fn set_restriction_accept<F>(&self, f: F)
  where
    F: Fn(&Channel) -> bool + Send + Sync + 'static,
  {
    lock(&self.inner.lifecycle).restriction_accept = Some(Arc::new(f));
  }

  pub(crate) fn accepts_restriction(&self) -> bool {
    let accept = lock(&self.inner.lifecycle).restriction_accept.clone();
    match accept {
      Some(accept) => accept(self),
      None => false,
    }
  }

  pub(crate) fn notify_restriction_update(&self) {
    let observers = lock(&self.inner.lifecycle).restriction.clone();
    for observer in observers {
      observer(self)
    }
  }

  /// Complete the handshake. Returns `false` if the channel was not ready.
  pub(crate) fn mark_open(&self) -> bool {
    let mut lifecycle = lock(&self.inner.lifecycle);
    if lifecycle.state != State::Ready {
      return false;
    }
    lifecycle.state = State::Open;
    let observers = mem::take(&mut lifecycle.opened);
    drop(lifecycle);

    log::info!("channel {} open (remote {})", self.local_id(), self.remote_id());
    for observer in observers {
      observer(self)
    }
    true
  }

  /// Move to the closed state and fire the closed observers exactly once.
  /// Returns `false` if the channel was already closed.
  pub(crate) fn mark_closed(&self, reason: Reason) -> bool {
    let mut lifecycle = lock(&self.inner.lifecycle);
    if matches!(lifecycle.state, State::Closed(_)) {
      return false;
    }
    lifecycle.state = State::Closed(reason);
    let observers = mem::take(&mut lifecycle.closed);
    lifecycle.opened.clear();
    lifecycle.restriction.clear();
    lifecycle.restriction_accept = None;
    drop(lifecycle);

    let pending = self.abandon_important();
    log::info!(
      "channel {} closed ({:?}), {} important actions abandoned, last seqno {}",
      self.local_id(),
      reason,
      pending,
      self.current_seqno()
    );
    for observer in observers {
      observer(self, reason)
    }
    true
  }
}
