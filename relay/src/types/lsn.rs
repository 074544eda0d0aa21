use std::fmt;
use std::str::FromStr;

use num_bigint::BigUint;
use thiserror::Error;

/// Size in bytes of a log sequence number as stored by the change log.
pub const LSN_SIZE: usize = 10;

/// Errors produced while decoding or encoding log sequence numbers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LsnError {
    #[error("expected a {LSN_SIZE} byte log sequence number, got {0} bytes")]
    InvalidLength(usize),

    #[error("log sequence number {0} does not fit in {LSN_SIZE} bytes")]
    Overflow(String),

    #[error("'{0}' is not a valid row label")]
    InvalidLabel(String),
}

/// Position in the change log.
///
/// The log exposes positions as fixed-size big-endian binaries; they are handled as arbitrary
/// precision integers so the next position can be computed, and rendered in decimal when used as
/// a row label.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(BigUint);

impl Lsn {
    pub fn new(value: BigUint) -> Self {
        Self(value)
    }

    /// Decodes a position from its binary representation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LsnError> {
        if bytes.len() != LSN_SIZE {
            return Err(LsnError::InvalidLength(bytes.len()));
        }

        Ok(Self(BigUint::from_bytes_be(bytes)))
    }

    /// Encodes the position in the binary representation used by the change log.
    pub fn to_bytes(&self) -> Result<[u8; LSN_SIZE], LsnError> {
        let raw = self.0.to_bytes_be();
        if raw.len() > LSN_SIZE {
            return Err(LsnError::Overflow(self.0.to_string()));
        }

        let mut bytes = [0u8; LSN_SIZE];
        bytes[LSN_SIZE - raw.len()..].copy_from_slice(&raw);

        Ok(bytes)
    }

    /// Returns the position immediately after this one.
    pub fn next(&self) -> Self {
        Self(&self.0 + 1u32)
    }

    pub fn as_biguint(&self) -> &BigUint {
        &self.0
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Self(BigUint::from(value))
    }
}

impl FromStr for Lsn {
    type Err = LsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<BigUint>()
            .map(Self)
            .map_err(|_| LsnError::InvalidLabel(s.to_string()))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_positions_render_as_decimal_labels() {
        let bytes = [0, 0, 0, 0x2a, 0, 0, 0x01, 0x10, 0, 0x03];
        let lsn = Lsn::from_bytes(&bytes).unwrap();

        assert_eq!(lsn.to_string(), "11821949039673347");
        assert_eq!(lsn.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn next_crosses_byte_boundaries() {
        let lsn = Lsn::from_bytes(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff]).unwrap();

        assert_eq!(
            lsn.next().to_bytes().unwrap(),
            [0, 0, 0, 0, 0, 0, 0, 0, 1, 0]
        );
    }

    #[test]
    fn labels_parse_and_compare_numerically() {
        let low: Lsn = "99".parse().unwrap();
        let high: Lsn = "100".parse().unwrap();

        assert!(low < high);
        assert_eq!(low.next(), high);
        assert_eq!(
            "abc".parse::<Lsn>().unwrap_err(),
            LsnError::InvalidLabel("abc".to_string())
        );
    }

    #[test]
    fn rejects_wrong_sizes() {
        assert_eq!(
            Lsn::from_bytes(&[1, 2, 3]).unwrap_err(),
            LsnError::InvalidLength(3)
        );

        let max = Lsn::from_bytes(&[0xff; LSN_SIZE]).unwrap();
        assert!(matches!(max.next().to_bytes(), Err(LsnError::Overflow(_))));
    }
}
