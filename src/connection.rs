use crate::{
  channel::Channel,
  detail::lock,
  error::{Error, Reason, Result},
  handler::{Decision, Handler},
  message::{self, Message, UNKNOWN_ID},
  seq::SeqNo,
};
use indexmap::IndexMap;
use std::{
  io::{self, Read, Write},
  net::TcpStream,
  sync::{Arc, Mutex, Weak},
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
  /// Bound to a transport, protocol not active yet.
  Init,
  Open,
  /// Closed locally, or the transport ended cleanly.
  Closed,
  /// The transport failed.
  Error,
}

#[derive(Debug, Clone)]
pub struct Config {
  /// Frames announcing a larger body are treated as corrupted framing.
  pub max_frame_len: usize,
  /// How long an important action waits for its ack before it is sent
  /// again. `None` never resends, which suits transports that do not lose
  /// frames, such as TCP or a [`pipe`](crate::stream::pipe).
  pub resend_interval: Option<Duration>,
  /// Resends of one important action before its channel is given up and
  /// closed with [`Reason::Transport`].
  pub max_resends: u32,
}

impl Default for Config {
  fn default() -> Self {
    Self { max_frame_len: 1 << 20, resend_interval: None, max_resends: 10 }
  }
}

/// Live channels, keyed by local id.
struct ChannelTable {
  live: IndexMap<i32, Channel>,
  next_id: i32,
}

impl ChannelTable {
  fn new() -> Self {
    Self { live: IndexMap::new(), next_id: 0 }
  }

  /// Next id that no live channel uses. Ids increase monotonically and are
  /// only handed out again after wrapping around, once they are free.
  fn allocate(&mut self) -> i32 {
    loop {
      let id = self.next_id;
      self.next_id = if id == i32::MAX { 0 } else { id + 1 };
      if !self.live.contains_key(&id) {
        return id;
      }
    }
  }
}

pub(crate) struct Shared {
  state: Mutex<State>,
  writer: Mutex<Box<dyn Write + Send>>,
  reader: Mutex<Option<Box<dyn Read + Send>>>,
  channels: Mutex<ChannelTable>,
  handler: Box<dyn Handler>,
  config: Config,
}

/// One transport carrying the control protocol for any number of channels.
///
/// `Connection` is a cheap handle; clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
  shared: Arc<Shared>,
}

static_assertions::assert_impl_all!(Connection: Send, Sync, Clone);

impl Connection {
  /// Bind a connection to a transport with default configuration.
  pub fn new<W, R, H>(writer: W, reader: R, handler: H) -> Self
  where
    W: Write + Send + 'static,
    R: Read + Send + 'static,
    H: Handler + 'static,
  {
    Self::new_with(Config::default(), writer, reader, handler)
  }

  /// Bind a connection to a transport with custom configuration.
  pub fn new_with<W, R, H>(config: Config, writer: W, reader: R, handler: H) -> Self
  where
    W: Write + Send + 'static,
    R: Read + Send + 'static,
    H: Handler + 'static,
  {
    Self {
      shared: Arc::new(Shared {
        state: Mutex::new(State::Init),
        writer: Mutex::new(Box::new(writer)),
        reader: Mutex::new(Some(Box::new(reader))),
        channels: Mutex::new(ChannelTable::new()),
        handler: Box::new(handler),
        config,
      }),
    }
  }

  /// Bind a connection to both directions of a TCP stream.
  pub fn from_tcp<H: Handler + 'static>(stream: TcpStream, handler: H) -> Result<Self> {
    stream.set_nodelay(true)?;
    let reader = stream.try_clone()?;
    Ok(Self::new(stream, reader, handler))
  }

  pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
    Self { shared }
  }

  pub(crate) fn downgrade(&self) -> Weak<Shared> {
    Arc::downgrade(&self.shared)
  }

  pub fn state(&self) -> State {
    *lock(&self.shared.state)
  }

  /// Activate the protocol. Control messages are only sent and accepted
  /// while the connection is open.
  pub fn open(&self) -> Result<()> {
    let mut state = lock(&self.shared.state);
    match *state {
      State::Init => {
        *state = State::Open;
        log::info!("connection open");
        Ok(())
      }
      State::Open => Ok(()),
      State::Closed | State::Error => Err(Error::NotOpen),
    }
  }

  /// Close every live channel, then the connection.
  ///
  /// A decode loop blocked on the transport is not interrupted; it ends
  /// when the transport does.
  pub fn close(&self) {
    let channels = self.take_channels();
    for chan in channels {
      if let Err(e) = self.send_close(&chan) {
        log::debug!("channel {}: could not send close: {}", chan.local_id(), e);
      }
      chan.mark_closed(Reason::Normal);
    }
    let mut state = lock(&self.shared.state);
    if *state != State::Error {
      *state = State::Closed;
    }
    log::info!("connection closed");
  }

  /// Look up a live channel by its local id.
  pub fn channel(&self, id: i32) -> Option<Channel> {
    lock(&self.shared.channels).live.get(&id).cloned()
  }

  /// All live channels, in the order they were registered.
  pub fn channels(&self) -> Vec<Channel> {
    lock(&self.shared.channels).live.values().cloned().collect()
  }

  /// Run the decode loop on the calling thread: read control messages from
  /// the transport and dispatch them until the transport ends.
  ///
  /// Errors that only concern one message are passed to
  /// [`Handler::on_error`] and the loop continues. A transport error or
  /// corrupted framing ends the loop, and every live channel is closed with
  /// [`Reason::Transport`].
  ///
  /// If [`Config::resend_interval`] is set, a resend thread runs alongside
  /// the loop until the connection is no longer open.
  pub fn run(&self) -> Result<()> {
    if self.state() != State::Open {
      return Err(Error::NotOpen);
    }
    let mut reader = match lock(&self.shared.reader).take() {
      Some(reader) => reader,
      None => {
        return Err(io::Error::new(io::ErrorKind::Other, "decode loop is already running").into())
      }
    };
    if let Some(interval) = self.shared.config.resend_interval {
      self.spawn_resender(interval);
    }

    loop {
      match message::read_frame(&mut reader, self.shared.config.max_frame_len) {
        Ok(Some(msg)) => {
          if self.state() != State::Open {
            log::debug!("connection closed, leaving decode loop");
            return Ok(());
          }
          if let Err(e) = self.handle(msg) {
            self.shared.handler.on_error(e);
          }
        }
        Ok(None) => {
          log::info!("transport ended");
          self.fail(State::Closed);
          return Ok(());
        }
        Err(e) => {
          if self.state() == State::Closed {
            return Ok(());
          }
          log::error!("decode loop failed: {}", e);
          self.fail(State::Error);
          return Err(e);
        }
      }
    }
  }

  /// Run the decode loop on a new thread.
  pub fn spawn(&self) -> JoinHandle<Result<()>> {
    let conn = self.clone();
    thread::spawn(move || conn.run())
  }

  fn spawn_resender(&self, interval: Duration) {
    let shared = self.downgrade();
    let limit = self.shared.config.max_resends;
    let tick = (interval / 2).max(Duration::from_millis(1));
    thread::spawn(move || loop {
      thread::sleep(tick);
      let conn = match shared.upgrade() {
        Some(shared) => Connection::from_shared(shared),
        None => return,
      };
      if conn.state() != State::Open {
        log::debug!("connection no longer open, stopping resends");
        return;
      }
      conn.resend_overdue(Instant::now(), interval, limit);
    });
  }

  /// Send every important action that waited `interval` for its ack again.
  /// A channel whose action was already resent `limit` times is closed with
  /// [`Reason::Transport`].
  fn resend_overdue(&self, now: Instant, interval: Duration, limit: u32) {
    for chan in self.channels() {
      match chan.resend_due(self, now, interval, limit) {
        Ok(()) => {}
        Err(e @ Error::Unacknowledged(_)) => {
          log::warn!("{}, closing", e);
          if let Err(e) = self.close_channel(&chan) {
            log::debug!("channel {}: could not send close: {}", chan.local_id(), e);
          }
          chan.mark_closed(Reason::Transport);
          self.shared.handler.on_error(e);
        }
        Err(e) => self.shared.handler.on_error(e),
      }
    }
  }

  /// The transport is gone: drop every channel without sending anything.
  fn fail(&self, to: State) {
    {
      let mut state = lock(&self.shared.state);
      if *state == State::Open || *state == State::Init {
        *state = to;
      }
    }
    for chan in self.take_channels() {
      chan.mark_closed(Reason::Transport);
    }
  }

  fn take_channels(&self) -> Vec<Channel> {
    let mut table = lock(&self.shared.channels);
    table.live.drain(..).map(|(_, chan)| chan).collect()
  }

  fn lookup(&self, id: i32) -> Result<Channel> {
    self.channel(id).ok_or(Error::UnknownChannel(id))
  }

  fn send(&self, msg: Message) -> Result<()> {
    if self.state() != State::Open {
      return Err(Error::NotOpen);
    }
    let mut writer = lock(&self.shared.writer);
    message::write_frame(&mut *writer, &msg)?;
    Ok(())
  }

  /// Dispatch one inbound control message.
  pub(crate) fn handle(&self, msg: Message) -> Result<()> {
    if self.state() != State::Open {
      log::debug!("dropping {:?}, connection is not open", msg.kind());
      return Ok(());
    }
    log::trace!("<- {:?}", msg);
    match msg {
      Message::ChannelRequest(req) => {
        let id = lock(&self.shared.channels).allocate();
        let chan = Channel::with_ids(self, id, req.source_id);
        let accepted = match self.shared.handler.on_channel_request(&chan) {
          Decision::Accept => true,
          Decision::Reject(reason) => {
            log::info!(
              "rejected channel request from {} ({})",
              req.source_id,
              reason.as_deref().unwrap_or("no reason")
            );
            false
          }
        };
        if accepted {
          lock(&self.shared.channels).live.insert(id, chan);
        }
        self.send(Message::ChannelResponse(message::ChannelResponse {
          dest_id: req.source_id,
          source_id: id,
          accepted,
        }))
      }
      Message::ChannelResponse(res) => {
        let chan = self.lookup(res.dest_id)?;
        if !res.accepted {
          self.shared.handler.on_channel_rejected(&chan);
          return Ok(());
        }
        chan.set_remote_id(res.source_id);
        self.send(Message::ChannelAck(message::ChannelAck {
          dest_id: res.source_id,
          source_id: chan.local_id(),
          ack: true,
        }))?;
        chan.mark_open();
        Ok(())
      }
      Message::ChannelAck(ack) => {
        let chan = self.lookup(ack.dest_id)?;
        if ack.ack {
          chan.mark_open();
        } else {
          log::debug!("channel {}: negative handshake ack", chan.local_id());
        }
        Ok(())
      }
      Message::ChannelClose(close) => {
        let removed = lock(&self.shared.channels).live.shift_remove(&close.dest_id);
        match removed {
          Some(chan) => {
            chan.mark_closed(Reason::Remote);
          }
          None => log::debug!("ignoring close for unknown channel {}", close.dest_id),
        }
        Ok(())
      }
      Message::DataSample(sample) => {
        let chan = self.lookup(sample.dest_id)?;
        let seqno = if sample.important { SeqNo::new(sample.seqno) } else { SeqNo::NONE };
        chan.receive(&sample.payload, seqno)
      }
      Message::Ack(ack) => {
        self.lookup(ack.dest_id)?.acked(SeqNo::new(ack.seqno));
        Ok(())
      }
      Message::RestrictRequest(req) => self.lookup(req.dest_id)?.restriction_requested(req.restricted),
      Message::RestrictAck(ack) => self.lookup(ack.dest_id)?.restriction_acked(ack.restricted),
    }
  }

  /// Register `chan` under a fresh local id and send it a `channel_request`.
  pub(crate) fn open_channel(&self, chan: &Channel) -> Result<()> {
    if chan.local_id() != UNKNOWN_ID || !matches!(chan.state(), crate::channel::State::Ready) {
      log::warn!("channel {}: open called twice", chan.local_id());
      return Ok(());
    }
    if self.state() != State::Open {
      return Err(Error::NotOpen);
    }
    let id = {
      let mut table = lock(&self.shared.channels);
      let id = table.allocate();
      chan.set_local_id(id);
      table.live.insert(id, chan.clone());
      id
    };
    let sent = self.send(Message::ChannelRequest(message::ChannelRequest {
      dest_id: UNKNOWN_ID,
      source_id: id,
    }));
    if sent.is_err() {
      lock(&self.shared.channels).live.shift_remove(&id);
    }
    sent
  }

  /// Remove `chan` from the live set and tell the remote side.
  pub(crate) fn close_channel(&self, chan: &Channel) -> Result<()> {
    lock(&self.shared.channels).live.shift_remove(&chan.local_id());
    self.send_close(chan)
  }

  fn send_close(&self, chan: &Channel) -> Result<()> {
    if chan.remote_id() == UNKNOWN_ID {
      // handshake never got an answer, nobody to tell
      return Ok(());
    }
    self.send(Message::ChannelClose(message::ChannelClose {
      dest_id: chan.remote_id(),
      source_id: chan.local_id(),
    }))
  }

  pub(crate) fn send_data_sample(&self, chan: &Channel, payload: Vec<u8>, seqno: SeqNo) -> Result<()> {
    self.send(Message::DataSample(message::DataSample {
      dest_id: chan.remote_id(),
      source_id: chan.local_id(),
      important: !seqno.is_none(),
      seqno: seqno.get(),
      payload,
    }))
  }

  pub(crate) fn send_ack(&self, chan: &Channel, seqno: SeqNo) -> Result<()> {
    self.send(Message::Ack(message::Ack {
      dest_id: chan.remote_id(),
      source_id: chan.local_id(),
      seqno: seqno.get(),
    }))
  }

  pub(crate) fn request_restriction(&self, chan: &Channel, restricted: bool) -> Result<()> {
    log::debug!("channel {}: requesting restriction {}", chan.local_id(), restricted);
    self.send(Message::RestrictRequest(message::RestrictRequest {
      dest_id: chan.remote_id(),
      source_id: chan.local_id(),
      restricted,
    }))
  }

  pub(crate) fn send_restrict_ack(&self, chan: &Channel, restricted: bool) -> Result<()> {
    self.send(Message::RestrictAck(message::RestrictAck {
      dest_id: chan.remote_id(),
      source_id: chan.local_id(),
      restricted,
    }))
  }
}
