//! Byte streams standing in for a socket when many peers share one datagram
//! socket.
//!
//! [`InputStream`] is a blocking buffer that the endpoint read loop appends
//! datagrams to. [`OutputStream`] collects writes and sends them as a single
//! datagram on flush. [`pipe`] connects a writer directly to an
//! [`InputStream`], which gives an in-memory transport.

use crate::{
  detail::lock,
  socket::{self, Socket},
};
use std::{
  fmt,
  io::{self, Read, Write},
  net::SocketAddr,
  sync::{Arc, Condvar, Mutex},
};

/// Buffered bytes are compacted once this many are held.
pub const COMPACT_THRESHOLD: usize = 256;

struct Buffer {
  data: Vec<u8>,
  /// Bytes before `pos` were already read.
  pos: usize,
  closed: bool,
}

impl Buffer {
  fn available(&self) -> usize {
    self.data.len() - self.pos
  }
}

struct Inner {
  buffer: Mutex<Buffer>,
  readable: Condvar,
  threshold: usize,
}

/// The receiving half of a virtual stream.
///
/// Reads block until the whole destination buffer can be filled, or the
/// stream is closed. After closing, buffered bytes can still be read and
/// then every read returns `0`.
#[derive(Clone)]
pub struct InputStream {
  inner: Arc<Inner>,
}

impl InputStream {
  pub fn new() -> Self {
    Self::with_threshold(COMPACT_THRESHOLD)
  }

  pub fn with_threshold(threshold: usize) -> Self {
    Self {
      inner: Arc::new(Inner {
        buffer: Mutex::new(Buffer { data: Vec::new(), pos: 0, closed: false }),
        readable: Condvar::new(),
        threshold,
      }),
    }
  }

  /// Append `bytes` and wake every blocked reader.
  ///
  /// Once the buffer holds `threshold` bytes, the prefix that was already
  /// read is discarded first. Unread bytes are never dropped.
  pub fn append(&self, bytes: &[u8]) {
    let mut buffer = lock(&self.inner.buffer);
    if buffer.closed {
      log::debug!("dropping {} bytes appended to a closed stream", bytes.len());
      return;
    }
    if buffer.data.len() >= self.inner.threshold && buffer.pos > 0 {
      let pos = buffer.pos;
      buffer.data.drain(..pos);
      buffer.pos = 0;
    }
    buffer.data.extend_from_slice(bytes);
    drop(buffer);
    self.inner.readable.notify_all();
  }

  /// Mark the end of the stream and wake every blocked reader.
  pub fn close(&self) {
    lock(&self.inner.buffer).closed = true;
    self.inner.readable.notify_all();
  }

  pub fn is_closed(&self) -> bool {
    lock(&self.inner.buffer).closed
  }

  /// Number of bytes that can be read without blocking.
  pub fn available(&self) -> usize {
    lock(&self.inner.buffer).available()
  }

  fn read_into(&self, out: &mut [u8]) -> io::Result<usize> {
    if out.is_empty() {
      return Ok(0);
    }
    let mut buffer = lock(&self.inner.buffer);
    while buffer.available() < out.len() && !buffer.closed {
      buffer = self
        .inner
        .readable
        .wait(buffer)
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    }
    let n = out.len().min(buffer.available());
    let start = buffer.pos;
    out[..n].copy_from_slice(&buffer.data[start..start + n]);
    buffer.pos += n;
    Ok(n)
  }

  #[cfg(test)]
  fn retained(&self) -> usize {
    lock(&self.inner.buffer).data.len()
  }
}

impl Default for InputStream {
  fn default() -> Self {
    Self::new()
  }
}

impl Read for InputStream {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    self.read_into(buf)
  }
}

impl Read for &InputStream {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    self.read_into(buf)
  }
}

impl fmt::Debug for InputStream {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let buffer = lock(&self.inner.buffer);
    f.debug_struct("InputStream")
      .field("available", &buffer.available())
      .field("closed", &buffer.closed)
      .finish()
  }
}

struct Outbound {
  remote: SocketAddr,
  /// `None` once closed.
  socket: Mutex<Option<Arc<dyn Socket>>>,
  buffer: Mutex<Vec<u8>>,
}

/// The sending half of a virtual stream, bound to one remote address.
///
/// Writes are buffered; [`Write::flush`] sends everything written since the
/// last flush as exactly one datagram.
#[derive(Clone)]
pub struct OutputStream {
  inner: Arc<Outbound>,
}

impl OutputStream {
  pub fn new(socket: Arc<dyn Socket>, remote: SocketAddr) -> Self {
    Self {
      inner: Arc::new(Outbound {
        remote,
        socket: Mutex::new(Some(socket)),
        buffer: Mutex::new(Vec::new()),
      }),
    }
  }

  pub fn remote_addr(&self) -> SocketAddr {
    self.inner.remote
  }

  /// Fail every further write or flush and let go of the socket. Unflushed
  /// bytes are discarded.
  pub fn close(&self) {
    *lock(&self.inner.socket) = None;
    lock(&self.inner.buffer).clear();
  }

  pub fn is_closed(&self) -> bool {
    lock(&self.inner.socket).is_none()
  }

  fn socket(&self) -> io::Result<Arc<dyn Socket>> {
    lock(&self.inner.socket)
      .clone()
      .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "output stream is closed"))
  }
}

impl Write for OutputStream {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.socket()?;
    lock(&self.inner.buffer).extend_from_slice(buf);
    Ok(buf.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    let target = self.socket()?;
    let mut buffer = lock(&self.inner.buffer);
    if buffer.is_empty() {
      return Ok(());
    }
    // a datagram that failed to send is dropped, never prepended to the next
    let result = socket::send_datagram(&*target, &buffer, self.inner.remote);
    buffer.clear();
    result
  }
}

impl fmt::Debug for OutputStream {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("OutputStream")
      .field("remote", &self.inner.remote)
      .field("closed", &self.is_closed())
      .finish()
  }
}

/// Writing half of a [`pipe`]. Dropping it closes the stream.
pub struct PipeWriter {
  stream: InputStream,
}

impl Write for PipeWriter {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    if self.stream.is_closed() {
      return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe is closed"));
    }
    self.stream.append(buf);
    Ok(buf.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

impl Drop for PipeWriter {
  fn drop(&mut self) {
    self.stream.close()
  }
}

/// An in-memory byte stream: bytes written to the [`PipeWriter`] are read
/// from the [`InputStream`].
pub fn pipe() -> (PipeWriter, InputStream) {
  let stream = InputStream::new();
  (PipeWriter { stream: stream.clone() }, stream)
}
