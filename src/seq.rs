/// Sequence number of an important data sample.
///
/// `0` is reserved to mean "not important", so allocation skips it when the
/// counter wraps around.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SeqNo(u32);

impl SeqNo {
  /// The "not important" sequence number.
  pub const NONE: SeqNo = SeqNo(0);

  pub const fn new(value: u32) -> Self {
    Self(value)
  }

  pub const fn get(self) -> u32 {
    self.0
  }

  pub const fn is_none(self) -> bool {
    self.0 == 0
  }

  /// The sequence number that follows `self`, skipping `0` on wraparound.
  pub const fn next(self) -> Self {
    match self.0.wrapping_add(1) {
      0 => SeqNo(1),
      n => SeqNo(n),
    }
  }

  /// Advance `self` and return the new value.
  pub fn advance(&mut self) -> Self {
    *self = self.next();
    *self
  }

  /// Whether `self` was issued after `other`, using serial number arithmetic
  /// so that the wrap from `u32::MAX` back to `1` still counts as newer.
  ///
  /// `NONE` is older than every issued sequence number.
  pub fn is_newer_than(self, other: SeqNo) -> bool {
    if other.is_none() {
      return !self.is_none();
    }
    if self.is_none() {
      return false;
    }
    // the skipped 0 makes the sequence space one shorter than `u32`
    let distance = self.0.wrapping_sub(other.0);
    let distance = if self.0 < other.0 { distance.wrapping_sub(1) } else { distance };
    distance != 0 && distance < (1 << 31)
  }
}

impl From<u32> for SeqNo {
  fn from(value: u32) -> Self {
    Self(value)
  }
}

impl std::fmt::Display for SeqNo {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[cfg(test)]
mod tests {
  use {super::*, pretty_assertions::assert_eq};

  #[test]
  fn allocation_skips_zero() {
    let mut seq = SeqNo::NONE;
    assert_eq!(seq.advance(), SeqNo(1));
    assert_eq!(seq.advance(), SeqNo(2));

    let mut seq = SeqNo(u32::MAX);
    assert_eq!(seq.advance(), SeqNo(1));
  }

  #[test]
  fn newer_is_monotonic() {
    assert!(SeqNo(2).is_newer_than(SeqNo(1)));
    assert!(!SeqNo(1).is_newer_than(SeqNo(1)));
    assert!(!SeqNo(1).is_newer_than(SeqNo(2)));
    assert!(SeqNo(1).is_newer_than(SeqNo::NONE));
    assert!(!SeqNo::NONE.is_newer_than(SeqNo(5)));
  }

  #[test]
  fn newer_across_wraparound() {
    let last = SeqNo(u32::MAX);
    let wrapped = last.next();
    assert!(wrapped.is_newer_than(last));
    assert!(!last.is_newer_than(wrapped));
    assert!(SeqNo(3).is_newer_than(SeqNo(u32::MAX - 3)));
  }
}
