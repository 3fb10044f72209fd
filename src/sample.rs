//! Typed application samples carried inside `data_sample` payloads.
//!
//! A payload is the sample's [`SampleKind`] followed by the sample's own
//! encoding. Each channel keeps a [`Registry`] mapping kinds to handlers, and
//! decoding a payload dispatches it to the handler registered for its kind.

use crate::{
  channel::Channel,
  codec::{self, Decode, Encode},
  error::{Error, Result},
};
use bytes::BytesMut;
use indexmap::IndexMap;
use std::sync::Arc;

/// Wire identifier of a sample type, derived from [`Sample::NAME`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleKind(pub u64);

impl SampleKind {
  /// 64-bit FNV-1a of `name`, so both peers derive the same kind without
  /// sharing anything but the name.
  pub const fn of(name: &str) -> Self {
    let bytes = name.as_bytes();
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    let mut i = 0;
    while i < bytes.len() {
      hash ^= bytes[i] as u64;
      hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
      i += 1;
    }
    SampleKind(hash)
  }
}

/// A record that can be sent over a [`Channel`].
pub trait Sample: Encode + Decode + Send + 'static {
  /// Name both peers use for this sample type.
  const NAME: &'static str;

  fn kind() -> SampleKind {
    SampleKind::of(Self::NAME)
  }
}

impl Sample for String {
  const NAME: &'static str = "string";
}

impl Sample for Vec<u8> {
  const NAME: &'static str = "bytes";
}

impl Sample for i32 {
  const NAME: &'static str = "int";
}

impl Sample for i64 {
  const NAME: &'static str = "long";
}

/// Serialize `sample` into a `data_sample` payload.
pub fn encode<S: Sample>(sample: &S) -> Vec<u8> {
  let mut buf = BytesMut::with_capacity(16);
  S::kind().0.encode(&mut buf);
  sample.encode(&mut buf);
  buf.to_vec()
}

type Dispatch = dyn Fn(&Channel, &mut &[u8]) -> codec::Result<()> + Send + Sync;

#[derive(Default)]
pub(crate) struct Registry {
  handlers: IndexMap<SampleKind, Arc<Dispatch>>,
}

impl Registry {
  /// Register `handler` for samples of type `S`, replacing any previous one.
  pub fn register<S, F>(&mut self, handler: F)
  where
    S: Sample,
    F: Fn(&Channel, S) + Send + Sync + 'static,
  {
    let dispatch = move |chan: &Channel, buf: &mut &[u8]| -> codec::Result<()> {
      let sample = S::decode(buf)?;
      handler(chan, sample);
      Ok(())
    };
    self.handlers.insert(S::kind(), Arc::new(dispatch));
  }

  /// Split `payload` into its handler and the remaining sample bytes.
  ///
  /// The handler is cloned out so it can run after the registry is unlocked.
  pub fn resolve<'a>(&self, payload: &'a [u8]) -> Result<(Arc<Dispatch>, &'a [u8])> {
    let mut buf = payload;
    let kind = SampleKind(u64::decode(&mut buf)?);
    match self.handlers.get(&kind) {
      Some(dispatch) => Ok((dispatch.clone(), buf)),
      None => Err(Error::UnknownSample(kind.0)),
    }
  }
}
