//! Control messages exchanged between two connections, and the frame format
//! that carries them over a byte stream.
//!
//! Every message is sent as one frame:
//! ```text
//! [ body_len : u32 ][ kind : u8 ][ fields ... ]
//! ```
//! where `body_len` counts the kind byte and the fields.

use crate::{
  codec::{self, Decode, Encode},
  error::{Error, Result},
};
use bytes::{BufMut, BytesMut};
use std::io::{self, Read, Write};

/// Channel id used in `dest_id` when the peer's id is not known yet.
pub const UNKNOWN_ID: i32 = -1;

const FRAME_HEADER_LEN: usize = std::mem::size_of::<u32>();

macro_rules! record {
  ($(#[$meta:meta])* $name:ident { $($field:ident : $ty:ty),* $(,)? }) => {
    $(#[$meta])*
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct $name {
      $(pub $field: $ty,)*
    }

    impl Encode for $name {
      fn encode<B: BufMut>(&self, buf: &mut B) {
        $(self.$field.encode(buf);)*
      }
    }

    impl Decode for $name {
      fn decode<B: bytes::Buf>(buf: &mut B) -> codec::Result<Self> {
        $(let $field = <$ty>::decode(buf)?;)*
        Ok(Self { $($field,)* })
      }
    }
  };
}

record!(
  /// Proposes a new channel. `dest_id` is always [`UNKNOWN_ID`].
  ChannelRequest { dest_id: i32, source_id: i32 }
);
record!(
  /// Accepts or rejects a [`ChannelRequest`].
  ChannelResponse { dest_id: i32, source_id: i32, accepted: bool }
);
record!(
  /// Final step of the three-way handshake, sent by the initiator.
  ChannelAck { dest_id: i32, source_id: i32, ack: bool }
);
record!(ChannelClose { dest_id: i32, source_id: i32 });
record!(
  /// Application payload. `seqno` is 0 for samples that are not important.
  DataSample { dest_id: i32, source_id: i32, important: bool, seqno: u32, payload: Vec<u8> }
);
record!(
  /// Acknowledges the important [`DataSample`] carrying `seqno`.
  Ack { dest_id: i32, source_id: i32, seqno: u32 }
);
record!(RestrictRequest { dest_id: i32, source_id: i32, restricted: bool });
record!(RestrictAck { dest_id: i32, source_id: i32, restricted: bool });

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
  ChannelRequest = 1,
  ChannelResponse = 2,
  ChannelAck = 3,
  ChannelClose = 4,
  DataSample = 5,
  Ack = 6,
  RestrictRequest = 7,
  RestrictAck = 8,
}

impl TryFrom<u8> for Kind {
  type Error = codec::Error;

  fn try_from(value: u8) -> codec::Result<Self> {
    Ok(match value {
      1 => Kind::ChannelRequest,
      2 => Kind::ChannelResponse,
      3 => Kind::ChannelAck,
      4 => Kind::ChannelClose,
      5 => Kind::DataSample,
      6 => Kind::Ack,
      7 => Kind::RestrictRequest,
      8 => Kind::RestrictAck,
      _ => return Err(codec::Error::InvalidKind("message")),
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
  ChannelRequest(ChannelRequest),
  ChannelResponse(ChannelResponse),
  ChannelAck(ChannelAck),
  ChannelClose(ChannelClose),
  DataSample(DataSample),
  Ack(Ack),
  RestrictRequest(RestrictRequest),
  RestrictAck(RestrictAck),
}

impl Message {
  pub fn kind(&self) -> Kind {
    match self {
      Message::ChannelRequest(_) => Kind::ChannelRequest,
      Message::ChannelResponse(_) => Kind::ChannelResponse,
      Message::ChannelAck(_) => Kind::ChannelAck,
      Message::ChannelClose(_) => Kind::ChannelClose,
      Message::DataSample(_) => Kind::DataSample,
      Message::Ack(_) => Kind::Ack,
      Message::RestrictRequest(_) => Kind::RestrictRequest,
      Message::RestrictAck(_) => Kind::RestrictAck,
    }
  }

  /// The local channel id of the receiver this message is addressed to.
  pub fn dest_id(&self) -> i32 {
    match self {
      Message::ChannelRequest(m) => m.dest_id,
      Message::ChannelResponse(m) => m.dest_id,
      Message::ChannelAck(m) => m.dest_id,
      Message::ChannelClose(m) => m.dest_id,
      Message::DataSample(m) => m.dest_id,
      Message::Ack(m) => m.dest_id,
      Message::RestrictRequest(m) => m.dest_id,
      Message::RestrictAck(m) => m.dest_id,
    }
  }
}

impl Encode for Message {
  fn encode<B: BufMut>(&self, buf: &mut B) {
    (self.kind() as u8).encode(buf);
    match self {
      Message::ChannelRequest(m) => m.encode(buf),
      Message::ChannelResponse(m) => m.encode(buf),
      Message::ChannelAck(m) => m.encode(buf),
      Message::ChannelClose(m) => m.encode(buf),
      Message::DataSample(m) => m.encode(buf),
      Message::Ack(m) => m.encode(buf),
      Message::RestrictRequest(m) => m.encode(buf),
      Message::RestrictAck(m) => m.encode(buf),
    }
  }
}

impl Decode for Message {
  fn decode<B: bytes::Buf>(buf: &mut B) -> codec::Result<Self> {
    Ok(match Kind::try_from(u8::decode(buf)?)? {
      Kind::ChannelRequest => Message::ChannelRequest(Decode::decode(buf)?),
      Kind::ChannelResponse => Message::ChannelResponse(Decode::decode(buf)?),
      Kind::ChannelAck => Message::ChannelAck(Decode::decode(buf)?),
      Kind::ChannelClose => Message::ChannelClose(Decode::decode(buf)?),
      Kind::DataSample => Message::DataSample(Decode::decode(buf)?),
      Kind::Ack => Message::Ack(Decode::decode(buf)?),
      Kind::RestrictRequest => Message::RestrictRequest(Decode::decode(buf)?),
      Kind::RestrictAck => Message::RestrictAck(Decode::decode(buf)?),
    })
  }
}

/// Serialize `msg` as one frame and hand it to `writer` with a single
/// `write_all` followed by `flush`.
///
/// Over a virtual output stream this makes every message exactly one datagram.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, msg: &Message) -> io::Result<()> {
  let mut body = BytesMut::with_capacity(32);
  msg.encode(&mut body);
  let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
  (body.len() as u32).encode(&mut frame);
  frame.put(body);
  writer.write_all(&frame[..])?;
  writer.flush()
}

/// Read the next frame from `reader`.
///
/// Returns `Ok(None)` if the stream ended cleanly on a frame boundary.
/// A stream that ends inside a frame, a body larger than `max_len`, or a body
/// that does not decode are all errors, because the framing can no longer be
/// trusted after any of them.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R, max_len: usize) -> Result<Option<Message>> {
  let mut header = [0u8; FRAME_HEADER_LEN];
  let mut filled = 0;
  while filled < header.len() {
    match reader.read(&mut header[filled..]) {
      Ok(0) if filled == 0 => return Ok(None),
      Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
      Ok(n) => filled += n,
      Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
      Err(e) => return Err(e.into()),
    }
  }

  let len = u32::from_be_bytes(header) as usize;
  if len > max_len {
    return Err(Error::Codec(codec::Error::TooLarge("frame")));
  }
  let mut body = vec![0u8; len];
  reader.read_exact(&mut body[..])?;
  Ok(Some(Message::decode(&mut &body[..])?))
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn data_sample_layout() {
    let msg = Message::DataSample(DataSample {
      dest_id: 2,
      source_id: UNKNOWN_ID,
      important: true,
      seqno: 7,
      payload: vec![0xaa, 0xbb],
    });
    let mut buf = BytesMut::new();
    msg.encode(&mut buf);
    #[rustfmt::skip]
    let expected: &[u8] = &[
      5,                      // kind
      0, 0, 0, 2,             // dest_id
      0xff, 0xff, 0xff, 0xff, // source_id
      1,                      // important
      0, 0, 0, 7,             // seqno
      0, 0, 0, 2, 0xaa, 0xbb, // payload
    ];
    assert_eq!(&buf[..], expected);
    assert_eq!(Message::decode(&mut &buf[..]).unwrap(), msg);
  }

  #[test]
  fn frames_are_read_back_in_order() {
    let first = Message::ChannelRequest(ChannelRequest { dest_id: UNKNOWN_ID, source_id: 0 });
    let second = Message::RestrictAck(RestrictAck { dest_id: 3, source_id: 0, restricted: true });

    let mut stream = Vec::new();
    write_frame(&mut stream, &first).unwrap();
    write_frame(&mut stream, &second).unwrap();
    // kind + 2 ids
    assert_eq!(&stream[..4], &[0, 0, 0, 9]);

    let mut reader = &stream[..];
    assert_eq!(read_frame(&mut reader, 1024).unwrap(), Some(first));
    assert_eq!(read_frame(&mut reader, 1024).unwrap(), Some(second));
    assert_eq!(read_frame(&mut reader, 1024).unwrap(), None);
  }

  #[test]
  fn truncated_frame_is_an_error() {
    let msg = Message::ChannelClose(ChannelClose { dest_id: 1, source_id: 1 });
    let mut stream = Vec::new();
    write_frame(&mut stream, &msg).unwrap();
    stream.truncate(stream.len() - 1);

    match read_frame(&mut &stream[..], 1024) {
      Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
      other => panic!("expected eof, got {:?}", other),
    }
  }

  #[test]
  fn oversized_and_unknown_frames_are_rejected() {
    let stream = [0u8, 0, 1, 0];
    assert!(matches!(
      read_frame(&mut &stream[..], 255),
      Err(Error::Codec(codec::Error::TooLarge("frame")))
    ));

    let stream = [0u8, 0, 0, 1, 42];
    assert!(matches!(
      read_frame(&mut &stream[..], 255),
      Err(Error::Codec(codec::Error::InvalidKind("message")))
    ));
  }
}
