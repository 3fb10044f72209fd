//! Many logical channels multiplexed over one transport.
//!
//! A [`Connection`] owns one byte-stream transport (a TCP stream, an
//! in-memory [`pipe`](stream::pipe), or a per-peer virtual stream pair from an
//! [`Endpoint`]) and runs the control protocol for every [`Channel`] on it:
//! a three-way open handshake, close, reliable in-order delivery of
//! "important" samples, and negotiation of a two-sided restriction flag.
//! On transports that may lose frames, important actions are resent until
//! acknowledged; see [`connection::Config::resend_interval`].
//!
//! ```no_run
//! use muxline::{AcceptAll, Channel, Connection};
//! use std::net::TcpStream;
//!
//! # fn main() -> muxline::Result<()> {
//! let conn = Connection::from_tcp(TcpStream::connect("127.0.0.1:9000")?, AcceptAll)?;
//! conn.open()?;
//! conn.spawn();
//!
//! let chan = Channel::new(&conn);
//! chan.register(|_: &Channel, msg: String| println!("received {}", msg));
//! chan.on_opened(|chan| {
//!   let _ = chan.send(&String::from("hello"), true);
//! });
//! chan.open()?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod codec;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod message;
pub mod sample;
pub mod seq;
pub mod socket;
pub mod stream;

mod detail;

pub use channel::Channel;
pub use connection::Connection;
pub use endpoint::Endpoint;
pub use error::{Error, Reason, Result};
pub use handler::{AcceptAll, Decision, Handler};
pub use sample::{Sample, SampleKind};
pub use seq::SeqNo;
