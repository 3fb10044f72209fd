mod common;

use common::*;
use crossbeam::channel;
use muxline::{connection, AcceptAll, Channel, Connection, Decision, Reason};
use pretty_assertions::assert_eq;
use std::{
  net::{Shutdown, TcpListener, TcpStream},
  thread,
};

#[test]
fn echo_over_tcp() {
  init_logger();
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let addr = listener.local_addr().unwrap();

  let server = thread::spawn(move || {
    let (stream, _) = listener.accept().unwrap();
    let conn = Connection::from_tcp(stream, |chan: &Channel| {
      chan.register(|chan: &Channel, msg: String| {
        chan.send(&msg.to_uppercase(), true).unwrap();
      });
      Decision::Accept
    })
    .unwrap();
    conn.open().unwrap();
    conn.run()
  });

  let stream = TcpStream::connect(addr).unwrap();
  let conn = Connection::from_tcp(stream.try_clone().unwrap(), AcceptAll).unwrap();
  conn.open().unwrap();
  let decode = conn.spawn();

  let (tx, rx) = channel::unbounded();
  let chan = Channel::new(&conn);
  chan.register(move |_: &Channel, msg: String| tx.send(msg).unwrap());
  let (closed_tx, closed_rx) = channel::bounded(1);
  chan.on_closed(move |_, reason| closed_tx.send(reason).unwrap());
  chan.open().unwrap();
  eventually(|| chan.is_open());

  for word in ["one", "two", "three"] {
    chan.send(&word.to_string(), true).unwrap();
  }
  assert_eq!(next(&rx), "ONE");
  assert_eq!(next(&rx), "TWO");
  assert_eq!(next(&rx), "THREE");

  chan.close().unwrap();
  assert_eq!(next(&closed_rx), Reason::Normal);

  // closing a connection leaves the transport to its owner, and shutting
  // the socket down ends both decode loops cleanly
  conn.close();
  assert_eq!(conn.state(), connection::State::Closed);
  stream.shutdown(Shutdown::Both).unwrap();
  server.join().unwrap().unwrap();
  decode.join().unwrap().unwrap();
}

#[test]
fn peer_disconnect_closes_channels() {
  init_logger();
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let addr = listener.local_addr().unwrap();
  let (opened_tx, opened_rx) = channel::bounded(1);

  let server = thread::spawn(move || {
    let (stream, _) = listener.accept().unwrap();
    let conn = Connection::from_tcp(stream, AcceptAll).unwrap();
    conn.open().unwrap();
    let decode = conn.spawn();
    let chan = Channel::new(&conn);
    chan.on_opened(move |_| opened_tx.send(()).unwrap());
    chan.open().unwrap();
    (conn, chan, decode)
  });

  let client = TcpStream::connect(addr).unwrap();
  let conn = Connection::from_tcp(client.try_clone().unwrap(), AcceptAll).unwrap();
  conn.open().unwrap();
  conn.spawn();
  next(&opened_rx);
  let (server_conn, chan, decode) = server.join().unwrap();

  client.shutdown(Shutdown::Both).unwrap();
  decode.join().unwrap().unwrap();
  assert_eq!(chan.state(), muxline::channel::State::Closed(Reason::Transport));
  assert_eq!(server_conn.state(), connection::State::Closed);
}
