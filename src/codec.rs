use {
  bytes::{Buf, BufMut},
  thiserror::Error,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
  #[error("unexpected end of input")]
  UnexpectedEof,
  #[error("invalid {0} kind")]
  InvalidKind(&'static str),
  #[error("maximum {0} size exceeded")]
  TooLarge(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait Encode: Sized {
  /// Encode a value of `Self` into `buf`.
  fn encode<B: BufMut>(&self, buf: &mut B);
}

pub trait Decode: Sized {
  /// Decode a value of `Self` from `buf`.
  fn decode<B: Buf>(buf: &mut B) -> Result<Self>;
}

macro_rules! impl_for {
  ($ty:ident, $put:ident, $get:ident) => {
    impl Encode for $ty {
      fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.$put(*self)
      }
    }
    impl Decode for $ty {
      fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < std::mem::size_of::<Self>() {
          Err(Error::UnexpectedEof)
        } else {
          Ok(buf.$get())
        }
      }
    }
  };
}

impl_for!(u8, put_u8, get_u8);
impl_for!(u16, put_u16, get_u16);
impl_for!(u32, put_u32, get_u32);
impl_for!(u64, put_u64, get_u64);
impl_for!(i32, put_i32, get_i32);
impl_for!(i64, put_i64, get_i64);

impl Encode for bool {
  fn encode<B: BufMut>(&self, buf: &mut B) {
    buf.put_u8(*self as u8)
  }
}

impl Decode for bool {
  fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
    match u8::decode(buf)? {
      0 => Ok(false),
      1 => Ok(true),
      _ => Err(Error::InvalidKind("bool")),
    }
  }
}

/// Byte strings are encoded as a `u32` length followed by the raw bytes.
impl Encode for Vec<u8> {
  fn encode<B: BufMut>(&self, buf: &mut B) {
    (self.len() as u32).encode(buf);
    buf.put_slice(&self[..]);
  }
}

impl Decode for Vec<u8> {
  fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
    let len = u32::decode(buf)? as usize;
    if buf.remaining() < len {
      return Err(Error::UnexpectedEof);
    }
    let mut data = vec![0u8; len];
    buf.copy_to_slice(&mut data[..]);
    Ok(data)
  }
}

impl Encode for String {
  fn encode<B: BufMut>(&self, buf: &mut B) {
    (self.len() as u32).encode(buf);
    buf.put_slice(self.as_bytes());
  }
}

impl Decode for String {
  fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
    String::from_utf8(Vec::<u8>::decode(buf)?).map_err(|_| Error::InvalidKind("utf-8 string"))
  }
}
