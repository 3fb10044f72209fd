use super::{important::Pending, Channel};
use crate::{
  detail::lock,
  error::{Error, Result},
};

/// Restriction flags of one channel. The channel is restricted only while
/// both sides agree.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Restriction {
  /// What this side asked for (or granted).
  pub local: bool,
  /// What the remote side confirmed.
  pub remote: bool,
}

impl Restriction {
  pub fn is_restricted(&self) -> bool {
    self.local && self.remote
  }

  /// Apply a restriction requested by the remote side and granted (or not)
  /// by this side. Both flags take the granted value at once.
  ///
  /// Returns whether the effective restriction changed.
  pub fn grant(&mut self, granted: bool) -> bool {
    let before = self.is_restricted();
    self.local = granted;
    self.remote = granted;
    before != self.is_restricted()
  }

  /// Answer a remote request for `want`, where `granted` was decided while
  /// the local flag was `seen`.
  ///
  /// If this side asked for a different restriction since, its request
  /// stands: the flags are kept and the answer follows the local wish.
  /// Returns the answer and whether the effective restriction changed.
  pub fn answer(&mut self, seen: bool, want: bool, granted: bool) -> (bool, bool) {
    if self.local != seen {
      return (want && self.local, false);
    }
    (granted, self.grant(granted))
  }

  /// Apply the remote side's answer to a request made by this side.
  pub fn acked(&mut self, acked: bool) -> Result<()> {
    if self.local == acked {
      self.remote = acked;
      Ok(())
    } else if self.local {
      // remote side denied the restriction
      self.local = false;
      self.remote = false;
      Ok(())
    } else {
      Err(Error::InconsistentRestriction { local: self.local, acked })
    }
  }
}

impl Channel {
  /// Whether both sides currently agree that the channel is restricted.
  pub fn is_restricted(&self) -> bool {
    lock(&self.inner.restrict).is_restricted()
  }

  /// Ask the remote side to enter (`true`) or leave (`false`) restricted mode.
  ///
  /// Does nothing if this side already asked for `want`. The request takes the
  /// channel's important slot, so it is queued behind any in-flight important
  /// sample. [`Channel::on_restriction_update`] fires when the remote side
  /// answers.
  pub fn request_restriction(&self, want: bool) -> Result<()> {
    self.ensure_open()?;
    if lock(&self.inner.restrict).local == want {
      return Ok(());
    }
    let conn = self.conn()?;
    let mut state = lock(&self.inner.important);
    if state.is_busy() {
      state.enqueue(Pending::Restrict(want));
      return Ok(());
    }
    self.transmit(&conn, &mut state, Pending::Restrict(want)).map(|_| ())
  }

  /// Set the local flag ahead of sending a request. Returns `false` if it
  /// already had that value.
  pub(crate) fn set_local_restriction(&self, want: bool) -> bool {
    let mut restriction = lock(&self.inner.restrict);
    if restriction.local == want {
      return false;
    }
    restriction.local = want;
    true
  }

  /// Handle a `channel_restrict_request` from the remote side and answer it.
  pub(crate) fn restriction_requested(&self, want: bool) -> Result<()> {
    let local = lock(&self.inner.restrict).local;
    let granted = if want && !local { self.accepts_restriction() } else { want };
    let (granted, changed) = lock(&self.inner.restrict).answer(local, want, granted);
    if changed {
      self.notify_restriction_update();
    }
    self.conn()?.send_restrict_ack(self, granted)
  }

  /// Handle a `channel_restrict_ack`. The ack frees the important slot
  /// whatever its outcome.
  ///
  /// An ack while no restriction request is in flight answers a resent
  /// request that was already settled. It is only checked for consistency.
  pub(crate) fn restriction_acked(&self, acked: bool) -> Result<()> {
    let answered = self.is_restriction_in_flight();
    let result = lock(&self.inner.restrict).acked(acked);
    if !answered {
      log::debug!("channel {}: restriction ack {} with no request in flight", self.local_id(), acked);
      return result;
    }
    if result.is_ok() {
      self.notify_restriction_update();
    }
    self.release_important();
    result
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn grant_reports_effective_changes_only() {
    let mut r = Restriction::default();
    assert!(r.grant(true));
    assert!(r.is_restricted());
    assert!(!r.grant(true));
    assert!(r.grant(false));
    assert_eq!(r, Restriction::default());
  }

  #[test]
  fn local_request_made_while_deciding_stands() {
    let mut r = Restriction::default();
    // the application asks for a restriction while a remote request for
    // the same is being decided, and the decision was a refusal
    r.local = true;
    assert_eq!(r.answer(false, true, false), (true, false));
    assert_eq!(r, Restriction { local: true, remote: false });
    r.acked(true).unwrap();
    assert!(r.is_restricted());

    let mut r = Restriction { local: true, remote: true };
    r.local = false;
    assert_eq!(r.answer(true, true, true), (false, false));
    assert!(!r.local);
  }

  #[test]
  fn unchanged_local_flag_is_granted() {
    let mut r = Restriction::default();
    assert_eq!(r.answer(false, true, true), (true, true));
    assert!(r.is_restricted());
  }

  #[test]
  fn matching_ack_completes_agreement() {
    let mut r = Restriction { local: true, remote: false };
    r.acked(true).unwrap();
    assert!(r.is_restricted());

    let mut r = Restriction { local: false, remote: true };
    r.acked(false).unwrap();
    assert_eq!(r, Restriction::default());
  }

  #[test]
  fn denied_request_clears_both_flags() {
    let mut r = Restriction { local: true, remote: false };
    r.acked(false).unwrap();
    assert_eq!(r, Restriction::default());
  }

  #[test]
  fn unexpected_ack_is_inconsistent() {
    let mut r = Restriction::default();
    match r.acked(true) {
      Err(Error::InconsistentRestriction { local, acked }) => {
        assert!(!local);
        assert!(acked);
      }
      other => panic!("expected an inconsistency, got {:?}", other),
    }
    assert_eq!(r, Restriction::default());
  }
}
