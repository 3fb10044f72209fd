use std::{io, net::SocketAddr, thread};

pub trait Socket: Send + Sync {
  fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
  fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

impl Socket for mio::net::UdpSocket {
  fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
    self.send_to(buf, target)
  }

  fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    self.recv_from(buf)
  }
}

impl Socket for std::net::UdpSocket {
  fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
    self.send_to(buf, target)
  }

  fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    self.recv_from(buf)
  }
}

/// Send `buf` as one datagram, retrying while a non-blocking socket reports
/// that its send buffer is full.
pub fn send_datagram<S: Socket + ?Sized>(socket: &S, buf: &[u8], target: SocketAddr) -> io::Result<()> {
  loop {
    match socket.send_to(buf, target) {
      Ok(n) if n == buf.len() => return Ok(()),
      Ok(n) => {
        return Err(io::Error::new(
          io::ErrorKind::WriteZero,
          format!("datagram truncated ({} of {} bytes sent)", n, buf.len()),
        ))
      }
      Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
        thread::yield_now()
      }
      Err(e) => return Err(e),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use std::sync::Mutex;

  /// Fails with `WouldBlock` a fixed number of times before accepting.
  struct Congested {
    remaining: Mutex<usize>,
    sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
  }

  impl Socket for Congested {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
      let mut remaining = self.remaining.lock().unwrap();
      if *remaining > 0 {
        *remaining -= 1;
        return Err(io::ErrorKind::WouldBlock.into());
      }
      self.sent.lock().unwrap().push((buf.to_vec(), target));
      Ok(buf.len())
    }

    fn recv_from(&self, _: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
      Err(io::ErrorKind::WouldBlock.into())
    }
  }

  #[test]
  fn would_block_is_retried() {
    let socket = Congested { remaining: Mutex::new(3), sent: Mutex::new(Vec::new()) };
    let target: SocketAddr = "127.0.0.1:9000".parse().unwrap();
    send_datagram(&socket, b"hello", target).unwrap();
    assert_eq!(*socket.sent.lock().unwrap(), vec![(b"hello".to_vec(), target)]);
    assert_eq!(*socket.remaining.lock().unwrap(), 0);
  }
}
