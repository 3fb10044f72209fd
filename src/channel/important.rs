use super::Channel;
use crate::{
  connection::Connection,
  detail::lock,
  error::{Error, Result},
  seq::SeqNo,
};
use std::{
  collections::VecDeque,
  time::{Duration, Instant},
};

/// An important action waiting for the in-flight one to be acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Pending {
  /// Send an important data sample.
  Data(Vec<u8>),
  /// Change the local restriction state and ask the remote side to agree.
  Restrict(bool),
}

/// What went out for the in-flight action, as it is sent again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Sent {
  Data(SeqNo, Vec<u8>),
  Restrict(bool),
}

struct Inflight {
  sent: Sent,
  sent_at: Instant,
  resends: u32,
}

/// Important delivery state of a channel.
///
/// At most one important action is in flight; every other action waits in
/// `queue` in submission order. `queue` is only ever non-empty while an
/// action is in flight.
#[derive(Default)]
pub(crate) struct Important {
  queue: VecDeque<Pending>,
  inflight: Option<Inflight>,
  /// Sequence number of the last important sample sent.
  current: SeqNo,
}

impl Important {
  pub fn is_busy(&self) -> bool {
    self.inflight.is_some()
  }

  pub fn enqueue(&mut self, action: Pending) {
    debug_assert!(self.is_busy());
    self.queue.push_back(action)
  }

  fn is_sample_in_flight(&self, seqno: SeqNo) -> bool {
    matches!(&self.inflight, Some(Inflight { sent: Sent::Data(s, _), .. }) if *s == seqno)
  }

  fn is_restriction_in_flight(&self) -> bool {
    matches!(&self.inflight, Some(Inflight { sent: Sent::Restrict(_), .. }))
  }
}

impl Channel {
  /// Send `payload` to the remote side.
  ///
  /// Samples that are not important go out immediately with sequence number 0.
  /// Important samples are numbered and sent one at a time: while an earlier
  /// important action waits for its ack, the sample is queued and this call
  /// returns without blocking.
  pub fn write(&self, payload: Vec<u8>, important: bool) -> Result<()> {
    self.ensure_open()?;
    let conn = self.conn()?;
    if !important {
      return conn.send_data_sample(self, payload, SeqNo::NONE);
    }

    let mut state = lock(&self.inner.important);
    if state.is_busy() {
      state.enqueue(Pending::Data(payload));
      return Ok(());
    }
    self.transmit(&conn, &mut state, Pending::Data(payload)).map(|_| ())
  }

  /// Number of important actions waiting behind the in-flight one.
  pub fn pending_important(&self) -> usize {
    lock(&self.inner.important).queue.len()
  }

  /// Whether an important action is waiting for its acknowledgement.
  pub fn is_important_busy(&self) -> bool {
    lock(&self.inner.important).is_busy()
  }

  pub(crate) fn current_seqno(&self) -> SeqNo {
    lock(&self.inner.important).current
  }

  /// Make `action` the in-flight important action.
  ///
  /// The sequence number is allocated here, at transmission time, so the
  /// remote side sees numbers in send order. Returns `Ok(false)` if the
  /// action turned out to be a no-op and nothing was sent.
  pub(crate) fn transmit(
    &self,
    conn: &Connection,
    state: &mut Important,
    action: Pending,
  ) -> Result<bool> {
    let sent = match action {
      Pending::Data(payload) => Sent::Data(state.current.advance(), payload),
      Pending::Restrict(want) => {
        if !self.set_local_restriction(want) {
          return Ok(false);
        }
        Sent::Restrict(want)
      }
    };
    match self.send_important(conn, &sent) {
      Ok(()) => {
        state.inflight = Some(Inflight { sent, sent_at: Instant::now(), resends: 0 });
        Ok(true)
      }
      Err(e) => {
        // nothing is in flight if the send failed
        state.inflight = None;
        Err(e)
      }
    }
  }

  fn send_important(&self, conn: &Connection, sent: &Sent) -> Result<()> {
    match sent {
      Sent::Data(seqno, payload) => conn.send_data_sample(self, payload.clone(), *seqno),
      Sent::Restrict(want) => conn.request_restriction(self, *want),
    }
  }

  /// Send the in-flight action again, with the same sequence number, if it
  /// has waited `interval` for its ack.
  ///
  /// Fails with [`Error::Unacknowledged`] once the action was already sent
  /// again `limit` times.
  pub(crate) fn resend_due(
    &self,
    conn: &Connection,
    now: Instant,
    interval: Duration,
    limit: u32,
  ) -> Result<()> {
    let mut state = lock(&self.inner.important);
    let inflight = match state.inflight.as_mut() {
      Some(inflight) => inflight,
      None => return Ok(()),
    };
    if now.saturating_duration_since(inflight.sent_at) < interval {
      return Ok(());
    }
    if inflight.resends >= limit {
      return Err(Error::Unacknowledged(self.local_id()));
    }
    inflight.resends += 1;
    inflight.sent_at = now;
    match &inflight.sent {
      Sent::Data(seqno, _) => log::debug!(
        "channel {}: resending sample {} ({}/{})",
        self.local_id(),
        seqno,
        inflight.resends,
        limit
      ),
      Sent::Restrict(want) => log::debug!(
        "channel {}: resending restriction request {} ({}/{})",
        self.local_id(),
        want,
        inflight.resends,
        limit
      ),
    }
    self.send_important(conn, &inflight.sent)
  }

  /// The in-flight important action was acknowledged: start the next queued
  /// one, or mark the channel idle if there is none.
  pub(crate) fn release_important(&self) {
    let mut state = lock(&self.inner.important);
    self.drain(&mut state)
  }

  pub(crate) fn is_restriction_in_flight(&self) -> bool {
    lock(&self.inner.important).is_restriction_in_flight()
  }

  fn drain(&self, state: &mut Important) {
    state.inflight = None;
    let conn = match self.conn() {
      Ok(conn) => conn,
      Err(_) => {
        state.queue.clear();
        return;
      }
    };
    while let Some(action) = state.queue.pop_front() {
      match self.transmit(&conn, state, action) {
        Ok(true) => return,
        Ok(false) => continue,
        Err(e) => {
          log::warn!("channel {}: dropping queued important action: {}", self.local_id(), e)
        }
      }
    }
  }

  /// Handle an `ack` for `seqno`. Acks for anything but the in-flight sample
  /// are ignored.
  pub(crate) fn acked(&self, seqno: SeqNo) {
    let mut state = lock(&self.inner.important);
    if state.is_sample_in_flight(seqno) {
      self.drain(&mut state)
    } else {
      log::debug!(
        "channel {}: ignoring ack {} (current {}, busy {})",
        self.local_id(),
        seqno,
        state.current,
        state.is_busy()
      );
    }
  }

  /// Drop the in-flight action and every queued one. Returns how many were
  /// queued.
  pub(crate) fn abandon_important(&self) -> usize {
    let mut state = lock(&self.inner.important);
    state.inflight = None;
    let pending = state.queue.len();
    state.queue.clear();
    pending
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  fn in_flight(sent: Sent) -> Important {
    Important {
      inflight: Some(Inflight { sent, sent_at: Instant::now(), resends: 0 }),
      ..Important::default()
    }
  }

  #[test]
  fn queue_only_grows_while_busy() {
    assert!(!Important::default().is_busy());
    let mut state = in_flight(Sent::Restrict(true));
    state.enqueue(Pending::Data(vec![1]));
    state.enqueue(Pending::Restrict(false));
    assert_eq!(
      state.queue.iter().cloned().collect::<Vec<_>>(),
      vec![Pending::Data(vec![1]), Pending::Restrict(false)]
    );
  }

  #[test]
  fn only_the_in_flight_sample_matches_an_ack() {
    let state = in_flight(Sent::Data(SeqNo::new(3), vec![]));
    assert!(state.is_sample_in_flight(SeqNo::new(3)));
    assert!(!state.is_sample_in_flight(SeqNo::new(2)));
    assert!(!state.is_restriction_in_flight());

    // a restriction request is not completed by a sample ack
    let state = in_flight(Sent::Restrict(true));
    assert!(!state.is_sample_in_flight(state.current));
    assert!(state.is_restriction_in_flight());
  }
}
