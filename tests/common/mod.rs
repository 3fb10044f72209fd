#![allow(dead_code)]

use crossbeam::channel::{self, Receiver, Sender};
use muxline::{
  connection,
  message::{self, Message},
  stream::{pipe, InputStream, PipeWriter},
  Channel, Connection, Error, Handler,
};
use std::{
  io::Write,
  thread,
  time::{Duration, Instant},
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_logger() {
  let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll `condition` until it holds, failing the test after [`TIMEOUT`].
pub fn eventually(mut condition: impl FnMut() -> bool) {
  let deadline = Instant::now() + TIMEOUT;
  while !condition() {
    assert!(Instant::now() < deadline, "condition not met within {:?}", TIMEOUT);
    thread::sleep(Duration::from_millis(1));
  }
}

/// Receive one event, failing the test after [`TIMEOUT`].
pub fn next<T>(rx: &Receiver<T>) -> T {
  rx.recv_timeout(TIMEOUT).expect("no event within timeout")
}

/// Assert that nothing else arrives for a short while.
pub fn quiet<T: std::fmt::Debug>(rx: &Receiver<T>) {
  if let Ok(event) = rx.recv_timeout(Duration::from_millis(50)) {
    panic!("unexpected event {:?}", event);
  }
}

/// Two open connections joined by in-memory pipes, decode loops running.
pub struct Link {
  pub a: Connection,
  pub b: Connection,
  /// Inbound side of `a`; closing it ends `a`'s transport.
  pub a_in: InputStream,
  pub b_in: InputStream,
}

pub fn link<A, B>(a: A, b: B) -> Link
where
  A: Handler + 'static,
  B: Handler + 'static,
{
  let (a_out, b_in) = pipe();
  let (b_out, a_in) = pipe();
  let link = Link {
    a: Connection::new(a_out, a_in.clone(), a),
    b: Connection::new(b_out, b_in.clone(), b),
    a_in,
    b_in,
  };
  link.a.open().unwrap();
  link.b.open().unwrap();
  link.a.spawn();
  link.b.spawn();
  link
}

/// Open a channel from `conn` and wait until its handshake completes.
pub fn open_channel(conn: &Connection) -> Channel {
  let chan = Channel::new(conn);
  let (tx, rx) = channel::bounded(1);
  chan.on_opened(move |_| tx.send(()).unwrap());
  chan.open().unwrap();
  next(&rx);
  chan
}

/// Handler that reports everything it sees over channels.
pub struct Recorder {
  pub requests: Sender<Channel>,
  pub rejected: Sender<Channel>,
  pub errors: Sender<Error>,
  pub accept: bool,
}

pub struct Events {
  pub requests: Receiver<Channel>,
  pub rejected: Receiver<Channel>,
  pub errors: Receiver<Error>,
}

impl Recorder {
  pub fn new(accept: bool) -> (Self, Events) {
    let (requests, requests_rx) = channel::unbounded();
    let (rejected, rejected_rx) = channel::unbounded();
    let (errors, errors_rx) = channel::unbounded();
    (
      Recorder { requests, rejected, errors, accept },
      Events { requests: requests_rx, rejected: rejected_rx, errors: errors_rx },
    )
  }
}

impl Handler for Recorder {
  fn on_channel_request(&self, channel: &Channel) -> muxline::Decision {
    let _ = self.requests.send(channel.clone());
    if self.accept {
      muxline::Decision::Accept
    } else {
      muxline::Decision::Reject(Some("not accepting".into()))
    }
  }

  fn on_channel_rejected(&self, channel: &Channel) {
    let _ = self.rejected.send(channel.clone());
  }

  fn on_error(&self, error: Error) {
    let _ = self.errors.send(error);
  }
}

/// A peer speaking raw frames, for driving one [`Connection`] by hand.
pub struct Raw {
  pub writer: PipeWriter,
  pub reader: InputStream,
}

impl Raw {
  /// Bind `handler` to a new connection whose remote side is the returned
  /// raw peer.
  pub fn connect<H: Handler + 'static>(handler: H) -> (Connection, Raw) {
    Self::connect_with(connection::Config::default(), handler)
  }

  pub fn connect_with<H: Handler + 'static>(config: connection::Config, handler: H) -> (Connection, Raw) {
    let (writer, conn_in) = pipe();
    let (conn_out, reader) = pipe();
    let conn = Connection::new_with(config, conn_out, conn_in, handler);
    conn.open().unwrap();
    conn.spawn();
    (conn, Raw { writer, reader })
  }

  pub fn send(&mut self, msg: Message) {
    message::write_frame(&mut self.writer, &msg).unwrap();
    self.writer.flush().unwrap();
  }

  pub fn recv(&mut self) -> Message {
    message::read_frame(&mut self.reader, 1 << 20).unwrap().expect("stream ended")
  }

  /// Assert that the connection sent nothing else for a short while.
  pub fn quiet(&self) {
    thread::sleep(Duration::from_millis(50));
    assert_eq!(self.reader.available(), 0, "unexpected frame from the connection");
  }
}
