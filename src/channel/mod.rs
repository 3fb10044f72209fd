//! A logical duplex endpoint multiplexed over a [`Connection`].
//!
//! Lock layout, one instance per channel:
//! - `lifecycle`: handshake state and observers
//! - `important`: the queue of pending important actions and the in-flight one
//! - `restrict`: the local/remote restriction flags
//! - `inbound`: the last acknowledged remote sequence number
//!
//! `important` may be held while taking `restrict`, never the other way
//! around, and no lock is held while user callbacks run.

pub(crate) mod important;
pub(crate) mod observer;
pub(crate) mod restrict;

use crate::{
  connection::{self, Connection},
  detail::{lock, read, write},
  error::{Error, Result},
  message::UNKNOWN_ID,
  sample::{self, Registry, Sample},
  seq::SeqNo,
};
use std::{
  fmt,
  sync::{
    atomic::{AtomicI32, Ordering},
    Arc, Mutex, RwLock, Weak,
  },
};

use important::Important;
use observer::Lifecycle;
use restrict::Restriction;

pub use observer::State;

#[derive(Clone)]
pub struct Channel {
  inner: Arc<Inner>,
}

static_assertions::assert_impl_all!(Channel: Send, Sync, Clone);

struct Inner {
  conn: Weak<connection::Shared>,
  local_id: AtomicI32,
  remote_id: AtomicI32,
  lifecycle: Mutex<Lifecycle>,
  important: Mutex<Important>,
  restrict: Mutex<Restriction>,
  inbound: Mutex<SeqNo>,
  samples: RwLock<Registry>,
}

impl Channel {
  /// Create a channel on `conn` in the ready state. Call [`Channel::open`]
  /// to start the handshake.
  pub fn new(conn: &Connection) -> Self {
    Self::with_ids(conn, UNKNOWN_ID, UNKNOWN_ID)
  }

  pub(crate) fn with_ids(conn: &Connection, local_id: i32, remote_id: i32) -> Self {
    Self {
      inner: Arc::new(Inner {
        conn: conn.downgrade(),
        local_id: AtomicI32::new(local_id),
        remote_id: AtomicI32::new(remote_id),
        lifecycle: Mutex::new(Lifecycle::default()),
        important: Mutex::new(Important::default()),
        restrict: Mutex::new(Restriction::default()),
        inbound: Mutex::new(SeqNo::NONE),
        samples: RwLock::new(Registry::default()),
      }),
    }
  }

  /// Id of this end of the channel, unique among the connection's live channels.
  ///
  /// [`UNKNOWN_ID`] until the channel is opened.
  pub fn local_id(&self) -> i32 {
    self.inner.local_id.load(Ordering::Acquire)
  }

  /// Id the remote side assigned to this channel, or [`UNKNOWN_ID`].
  pub fn remote_id(&self) -> i32 {
    self.inner.remote_id.load(Ordering::Acquire)
  }

  pub(crate) fn set_local_id(&self, id: i32) {
    self.inner.local_id.store(id, Ordering::Release)
  }

  pub(crate) fn set_remote_id(&self, id: i32) {
    self.inner.remote_id.store(id, Ordering::Release)
  }

  /// The connection this channel is multiplexed over, if it still exists.
  pub fn connection(&self) -> Option<Connection> {
    self.inner.conn.upgrade().map(Connection::from_shared)
  }

  fn conn(&self) -> Result<Connection> {
    self.connection().ok_or(Error::NotOpen)
  }

  pub fn state(&self) -> State {
    lock(&self.inner.lifecycle).state()
  }

  pub fn is_open(&self) -> bool {
    self.state() == State::Open
  }

  pub fn is_closed(&self) -> bool {
    matches!(self.state(), State::Closed(_))
  }

  fn ensure_open(&self) -> Result<()> {
    match self.state() {
      State::Open => Ok(()),
      State::Ready => Err(Error::ChannelNotOpen),
      State::Closed(_) => Err(Error::ChannelClosed),
    }
  }

  /// Start the three-way handshake. The channel becomes open once the
  /// remote side accepts it; see [`Channel::on_opened`].
  pub fn open(&self) -> Result<()> {
    self.conn()?.open_channel(self)
  }

  /// Close the channel on both sides.
  ///
  /// Closing a channel whose handshake has not completed abandons it.
  pub fn close(&self) -> Result<()> {
    if self.is_closed() {
      return Ok(());
    }
    let result = match self.connection() {
      Some(conn) => conn.close_channel(self),
      None => Ok(()),
    };
    self.mark_closed(crate::error::Reason::Normal);
    result
  }

  /// Register `handler` for samples of type `S` arriving on this channel.
  pub fn register<S, F>(&self, handler: F)
  where
    S: Sample,
    F: Fn(&Channel, S) + Send + Sync + 'static,
  {
    write(&self.inner.samples).register::<S, F>(handler)
  }

  /// Encode `sample` and send it. Important samples are delivered reliably
  /// and in order; see [`Channel::write`].
  pub fn send<S: Sample>(&self, sample: &S, important: bool) -> Result<()> {
    self.write(sample::encode(sample), important)
  }

  /// Handle an inbound `data_sample`.
  ///
  /// Important samples are dispatched once. A repeat of an already
  /// acknowledged sequence number is not dispatched again, but acknowledged
  /// again, since it means the first ack was lost.
  pub(crate) fn receive(&self, payload: &[u8], seqno: SeqNo) -> Result<()> {
    if !self.is_open() {
      log::debug!("channel {}: dropping sample, channel is not open", self.local_id());
      return Ok(());
    }
    if !seqno.is_none() {
      let mut remote = lock(&self.inner.inbound);
      if !seqno.is_newer_than(*remote) {
        log::debug!(
          "channel {}: repeated sample {} (last {}), acknowledging again",
          self.local_id(),
          seqno,
          *remote
        );
        drop(remote);
        return self.conn()?.send_ack(self, seqno);
      }
      *remote = seqno;
    }

    let dispatched = self.dispatch(payload);
    if !seqno.is_none() {
      self.conn()?.send_ack(self, seqno)?;
    }
    dispatched
  }

  fn dispatch(&self, payload: &[u8]) -> Result<()> {
    let (dispatch, mut body) = read(&self.inner.samples).resolve(payload)?;
    dispatch(self, &mut body)?;
    Ok(())
  }
}

impl PartialEq for Channel {
  fn eq(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }
}

impl Eq for Channel {}

impl fmt::Debug for Channel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Channel")
      .field("local_id", &self.local_id())
      .field("remote_id", &self.remote_id())
      .field("state", &self.state())
      .finish()
  }
}
