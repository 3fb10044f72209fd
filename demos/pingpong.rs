use anyhow::Result;
use crossbeam::channel;
use muxline::{AcceptAll, Channel, Decision, Endpoint};
use std::time::Duration;

const ROUNDS: i32 = 10;

fn init_log() -> Result<()> {
  // default RUST_LOG=info
  std::env::set_var(
    "RUST_LOG",
    std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
  );
  Ok(env_logger::try_init()?)
}

/// Every accepted channel answers ping `n` with pong `n + 1`, and agrees to
/// any restriction.
fn pong(chan: &Channel) -> Decision {
  chan.set_restriction_accept(|chan| {
    log::info!("[server] granting restriction on channel {}", chan.local_id());
    true
  });
  chan.register(|chan: &Channel, n: i32| {
    log::info!("[server] ping {}", n);
    if let Err(e) = chan.send(&(n + 1), true) {
      log::warn!("[server] could not answer: {}", e);
    }
  });
  Decision::Accept
}

fn main() -> Result<()> {
  init_log()?;

  let server = Endpoint::bind("127.0.0.1:0".parse()?)?;
  server.on_accept(|endpoint, addr| {
    log::info!("[server] new peer {}", addr);
    match endpoint.connection(addr, pong) {
      Ok(conn) => {
        if conn.open().is_ok() {
          conn.spawn();
        }
      }
      Err(e) => log::warn!("[server] could not accept {}: {}", addr, e),
    }
  });
  let server_loop = server.spawn();
  log::info!("[server] listening on {}", server.local_addr());

  let client = Endpoint::bind("127.0.0.1:0".parse()?)?;
  let client_loop = client.spawn();
  let conn = client.connection(server.local_addr(), AcceptAll)?;
  conn.open()?;
  conn.spawn();

  let (done, finished) = channel::bounded(1);
  let chan = Channel::new(&conn);
  chan.register(move |chan: &Channel, n: i32| {
    log::info!("[client] pong {}", n);
    if n >= ROUNDS {
      let _ = done.send(());
    } else if let Err(e) = chan.send(&(n + 1), true) {
      log::warn!("[client] could not answer: {}", e);
    }
  });
  chan.on_restriction_update(|chan| {
    log::info!("[client] channel restricted: {}", chan.is_restricted());
  });
  chan.on_opened(|chan| {
    log::info!("[client] channel {} open, starting", chan.local_id());
    let started = chan.request_restriction(true).and_then(|_| chan.send(&0i32, true));
    if let Err(e) = started {
      log::warn!("[client] could not start: {}", e);
    }
  });
  chan.open()?;

  finished.recv_timeout(Duration::from_secs(5))?;
  chan.request_restriction(false)?;
  chan.close()?;
  conn.close();

  client.close();
  server.close();
  client_loop.join().map_err(|_| anyhow::anyhow!("client read loop panicked"))??;
  server_loop.join().map_err(|_| anyhow::anyhow!("server read loop panicked"))??;
  Ok(())
}
