//! Many ordered byte streams over one UDP socket, one pair per remote address.

use crate::{
  connection::{self, Connection},
  detail::lock,
  error::{Error, Result},
  handler::Handler,
  socket::Socket,
  stream::{InputStream, OutputStream, COMPACT_THRESHOLD},
};
use indexmap::IndexMap;
use mio::{net::UdpSocket, Events, Interest, Poll, Registry, Token};
use std::{
  io,
  net::SocketAddr,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
  },
  thread::{self, JoinHandle},
  time::Duration,
};

pub struct Config {
  /// Passed on to every [`InputStream`] the endpoint creates.
  pub compact_threshold: usize,
  /// How long the read loop waits for a datagram before checking whether the
  /// endpoint was closed.
  pub poll_timeout: Duration,
  /// Datagrams longer than this are truncated.
  pub recv_buffer_len: usize,
  pub events_capacity: usize,
  /// Used for every [`Connection`] built by [`Endpoint::connection`].
  /// Resends are on by default.
  pub connection: connection::Config,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      compact_threshold: COMPACT_THRESHOLD,
      poll_timeout: Duration::from_millis(50),
      // enough to hold the maximum size of a UDP datagram
      recv_buffer_len: 1 << 16,
      events_capacity: 128,
      connection: connection::Config {
        resend_interval: Some(Duration::from_millis(100)),
        ..connection::Config::default()
      },
    }
  }
}

type AcceptFn = Arc<dyn Fn(&Endpoint, SocketAddr) + Send + Sync>;

struct Shared {
  local_addr: SocketAddr,
  /// `None` once the endpoint is closed.
  socket: Mutex<Option<Arc<UdpSocket>>>,
  registry: Registry,
  poll: Mutex<Option<Poll>>,
  inputs: Mutex<IndexMap<SocketAddr, InputStream>>,
  outputs: Mutex<IndexMap<SocketAddr, OutputStream>>,
  accept: Mutex<Option<AcceptFn>>,
  closed: AtomicBool,
  config: Config,
}

/// One bound UDP socket, demultiplexed by source address.
///
/// The read loop ([`Endpoint::run`] or [`Endpoint::spawn`]) appends every
/// datagram to the input stream of its sender. A datagram from an address
/// without an input stream first fires the accept callback, which may create
/// one, for example by building a [`Connection`] with
/// [`Endpoint::connection`].
///
/// `Endpoint` is a cheap handle; clones refer to the same socket. The socket
/// stays bound until [`Endpoint::close`] is called, even if handles or
/// streams outlive that.
#[derive(Clone)]
pub struct Endpoint {
  shared: Arc<Shared>,
}

static_assertions::assert_impl_all!(Endpoint: Send, Sync, Clone);

impl Endpoint {
  const SOCKET: Token = Token(0);

  /// Bind the endpoint on `addr` with default configuration.
  pub fn bind(addr: SocketAddr) -> Result<Self> {
    Self::bind_with(Config::default(), addr)
  }

  /// Bind the endpoint on `addr` with custom configuration.
  pub fn bind_with(config: Config, addr: SocketAddr) -> Result<Self> {
    let mut socket = UdpSocket::bind(addr)?;
    let poll = Poll::new()?;
    poll.registry().register(&mut socket, Self::SOCKET, Interest::READABLE)?;
    let registry = poll.registry().try_clone()?;
    let local_addr = socket.local_addr()?;
    log::info!("endpoint bound on {}", local_addr);
    Ok(Self {
      shared: Arc::new(Shared {
        local_addr,
        socket: Mutex::new(Some(Arc::new(socket))),
        registry,
        poll: Mutex::new(Some(poll)),
        inputs: Mutex::new(IndexMap::new()),
        outputs: Mutex::new(IndexMap::new()),
        accept: Mutex::new(None),
        closed: AtomicBool::new(false),
        config,
      }),
    })
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.shared.local_addr
  }

  pub fn is_closed(&self) -> bool {
    self.shared.closed.load(Ordering::Acquire)
  }

  /// Call `f` whenever a datagram arrives from an address that has no input
  /// stream yet. Replaces any previous callback.
  ///
  /// `f` runs on the read loop thread, before the datagram is delivered.
  pub fn on_accept<F>(&self, f: F)
  where
    F: Fn(&Endpoint, SocketAddr) + Send + Sync + 'static,
  {
    *lock(&self.shared.accept) = Some(Arc::new(f));
  }

  /// The output stream bound to `remote`, created on first use.
  pub fn output_stream(&self, remote: SocketAddr) -> Result<OutputStream> {
    let mut outputs = lock(&self.shared.outputs);
    if self.is_closed() {
      return Err(Error::EndpointClosed);
    }
    let socket = lock(&self.shared.socket).clone().ok_or(Error::EndpointClosed)?;
    let stream = outputs
      .entry(remote)
      .or_insert_with(|| OutputStream::new(socket, remote));
    Ok(stream.clone())
  }

  /// The input stream receiving datagrams from `remote`, created on first use.
  pub fn input_stream(&self, remote: SocketAddr) -> Result<InputStream> {
    let mut inputs = lock(&self.shared.inputs);
    if self.is_closed() {
      return Err(Error::EndpointClosed);
    }
    let threshold = self.shared.config.compact_threshold;
    let stream = inputs
      .entry(remote)
      .or_insert_with(|| InputStream::with_threshold(threshold));
    Ok(stream.clone())
  }

  /// Bind a [`Connection`] to the stream pair of `remote`, configured by
  /// [`Config::connection`].
  ///
  /// The connection still has to be opened and its decode loop started.
  pub fn connection<H: Handler + 'static>(&self, remote: SocketAddr, handler: H) -> Result<Connection> {
    let output = self.output_stream(remote)?;
    let input = self.input_stream(remote)?;
    let config = self.shared.config.connection.clone();
    Ok(Connection::new_with(config, output, input, handler))
  }

  /// Close every stream, stop the read loop and release the socket.
  ///
  /// Blocked readers of an input stream see end-of-stream, and further
  /// writes to an output stream fail.
  pub fn close(&self) {
    let mut inputs = lock(&self.shared.inputs);
    let mut outputs = lock(&self.shared.outputs);
    if self.shared.closed.swap(true, Ordering::AcqRel) {
      return;
    }
    for (_, stream) in inputs.drain(..) {
      stream.close();
    }
    for (_, stream) in outputs.drain(..) {
      stream.close();
    }
    drop((inputs, outputs));

    let socket = lock(&self.shared.socket).take();
    // a send or receive in progress still holds the socket, it is closed
    // when that finishes
    if let Some(Ok(mut socket)) = socket.map(Arc::try_unwrap) {
      if let Err(e) = self.shared.registry.deregister(&mut socket) {
        log::debug!("could not deregister socket: {}", e);
      }
    }
    log::info!("endpoint on {} closed", self.shared.local_addr);
  }

  /// Run the read loop on the calling thread until the endpoint is closed or
  /// the socket fails. A socket failure closes the endpoint.
  pub fn run(&self) -> Result<()> {
    let mut poll = match lock(&self.shared.poll).take() {
      Some(poll) => poll,
      None => {
        return Err(io::Error::new(io::ErrorKind::Other, "read loop is already running").into())
      }
    };
    let mut events = Events::with_capacity(self.shared.config.events_capacity);
    let mut buffer = vec![0u8; self.shared.config.recv_buffer_len];

    while !self.is_closed() {
      if let Err(e) = poll.poll(&mut events, Some(self.shared.config.poll_timeout)) {
        if e.kind() == io::ErrorKind::Interrupted {
          continue;
        }
        return Err(self.fail(e));
      }
      for event in events.iter() {
        match event.token() {
          Self::SOCKET => {
            if let Err(e) = self.recv_some(&mut buffer) {
              return Err(self.fail(e));
            }
          }
          token => log::debug!("ignoring event for unknown token {:?}", token),
        }
      }
    }
    log::debug!("read loop on {} stopped", self.shared.local_addr);
    Ok(())
  }

  /// Run the read loop on a new thread.
  pub fn spawn(&self) -> JoinHandle<Result<()>> {
    let endpoint = self.clone();
    thread::spawn(move || endpoint.run())
  }

  fn fail(&self, e: io::Error) -> Error {
    log::error!("read loop on {} failed: {}", self.shared.local_addr, e);
    self.close();
    e.into()
  }

  /// Receive datagrams until the socket returns `WouldBlock`.
  fn recv_some(&self, buffer: &mut [u8]) -> io::Result<()> {
    let socket = match lock(&self.shared.socket).clone() {
      Some(socket) => socket,
      None => return Ok(()),
    };
    loop {
      let (size, addr) = match Socket::recv_from(&*socket, buffer) {
        Ok(received) => received,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
        Err(e) => return Err(e),
      };
      self.deliver(addr, &buffer[..size]);
    }
  }

  fn deliver(&self, addr: SocketAddr, datagram: &[u8]) {
    let known = lock(&self.shared.inputs).get(&addr).cloned();
    let stream = match known {
      Some(stream) => Some(stream),
      None => {
        let accept = lock(&self.shared.accept).clone();
        if let Some(accept) = accept {
          log::debug!("new peer {}", addr);
          accept(self, addr);
        }
        lock(&self.shared.inputs).get(&addr).cloned()
      }
    };
    match stream {
      Some(stream) => stream.append(datagram),
      None => log::debug!("dropping {} bytes from unaccepted peer {}", datagram.len(), addr),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use std::{io::Read, net::UdpSocket as StdUdpSocket};

  fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
  }

  #[test]
  fn streams_are_created_once_per_address() {
    let endpoint = Endpoint::bind(localhost()).unwrap();
    let remote: SocketAddr = "127.0.0.1:5555".parse().unwrap();
    let a = endpoint.input_stream(remote).unwrap();
    let b = endpoint.input_stream(remote).unwrap();
    a.append(b"x");
    assert_eq!(b.available(), 1);
    assert_eq!(endpoint.output_stream(remote).unwrap().remote_addr(), remote);
    endpoint.close();
  }

  #[test]
  fn closed_endpoint_refuses_streams() {
    let endpoint = Endpoint::bind(localhost()).unwrap();
    let remote: SocketAddr = "127.0.0.1:5555".parse().unwrap();
    let input = endpoint.input_stream(remote).unwrap();
    endpoint.close();
    assert!(input.is_closed());
    assert!(matches!(endpoint.input_stream(remote), Err(Error::EndpointClosed)));
    assert!(matches!(endpoint.output_stream(remote), Err(Error::EndpointClosed)));
  }

  #[test]
  fn accept_fires_before_delivery() {
    let endpoint = Endpoint::bind(localhost()).unwrap();
    let (tx, rx) = crossbeam::channel::unbounded();
    endpoint.on_accept(move |endpoint, addr| {
      tx.send(addr).unwrap();
      endpoint.input_stream(addr).unwrap();
    });
    let reader = endpoint.spawn();

    let peer = StdUdpSocket::bind(localhost()).unwrap();
    peer.send_to(b"ping", endpoint.local_addr()).unwrap();
    peer.send_to(b"pong", endpoint.local_addr()).unwrap();

    let addr = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(addr, peer.local_addr().unwrap());
    let mut buf = [0u8; 8];
    endpoint.input_stream(addr).unwrap().read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"pingpong");
    // one accept per address
    assert!(rx.try_recv().is_err());

    endpoint.close();
    reader.join().unwrap().unwrap();
  }

  #[test]
  fn close_releases_the_address() {
    let endpoint = Endpoint::bind(localhost()).unwrap();
    let addr = endpoint.local_addr();
    let output = endpoint.output_stream("127.0.0.1:5555".parse().unwrap()).unwrap();
    let reader = endpoint.spawn();

    endpoint.close();
    reader.join().unwrap().unwrap();
    // the handles are still alive, the socket is not
    assert!(output.is_closed());
    let rebound = StdUdpSocket::bind(addr).unwrap();
    assert_eq!(rebound.local_addr().unwrap(), addr);
    drop((endpoint, output));
  }

  #[test]
  fn read_loop_runs_once() {
    let endpoint = Endpoint::bind(localhost()).unwrap();
    let reader = endpoint.spawn();
    while lock(&endpoint.shared.poll).is_some() {
      thread::sleep(Duration::from_millis(1));
    }
    assert!(matches!(endpoint.run(), Err(Error::Io(_))));
    endpoint.close();
    reader.join().unwrap().unwrap();
  }
}
