//! Arbitrary-precision proof-of-work amounts.

use dashu_int::UBig;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, ops::Add};

/// A non-negative amount of proof-of-work.
///
/// Used both for the contribution of a single header and for the
/// cumulative work from genesis to a header.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Work(UBig);

impl Work {
    pub fn new(value: UBig) -> Self {
        Self(value)
    }

    pub fn zero() -> Self {
        Self(UBig::ZERO)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == UBig::ZERO
    }

    /// Work represented by a compact (`nBits`) difficulty target.
    ///
    /// Computed as `2^256 / (target + 1)`. Returns zero work for a
    /// negative or zero target.
    pub fn from_compact_target(bits: u32) -> Self {
        let exponent = bits >> 24;
        let mantissa = bits & 0x007f_ffff;
        if bits & 0x0080_0000 != 0 || mantissa == 0 {
            return Self::zero();
        }

        let target = if exponent <= 3 {
            UBig::from(mantissa >> (8 * (3 - exponent)))
        } else {
            UBig::from(mantissa) << (8 * (exponent as usize - 3))
        };

        Self((UBig::ONE << 256) / (target + UBig::ONE))
    }

    pub fn to_be_bytes(&self) -> Vec<u8> {
        self.0.to_be_bytes().into_vec()
    }

    pub fn from_be_bytes(bytes: &[u8]) -> Self {
        Self(UBig::from_be_bytes(bytes))
    }

    pub fn as_ubig(&self) -> &UBig {
        &self.0
    }
}

impl Default for Work {
    fn default() -> Self {
        Self::zero()
    }
}

impl From<u64> for Work {
    fn from(value: u64) -> Self {
        Self(UBig::from(value))
    }
}

impl Add<&Work> for &Work {
    type Output = Work;

    fn add(self, rhs: &Work) -> Work {
        Work(&self.0 + &rhs.0)
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Work({})", self.0)
    }
}

impl fmt::Display for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Decimal strings keep JSON readable and avoid precision loss
impl Serialize for Work {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Work {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        s.parse::<UBig>().map(Self).map_err(serde::de::Error::custom)
    }
}

impl<C> minicbor::Encode<C> for Work {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.bytes(&self.to_be_bytes())?.ok()
    }
}

impl<'a, C> minicbor::Decode<'a, C> for Work {
    fn decode(
        d: &mut minicbor::Decoder<'a>,
        _ctx: &mut C,
    ) -> Result<Self, minicbor::decode::Error> {
        Ok(Self::from_be_bytes(d.bytes()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_difficulty_one_target() {
        // 0x1d00ffff is the maximum target; its work is 0x100010001
        let work = Work::from_compact_target(0x1d00ffff);
        assert_eq!(work, Work::from(0x1_0001_0001u64));
    }

    #[test]
    fn negative_or_empty_target_has_no_work() {
        assert!(Work::from_compact_target(0x1d800000).is_zero());
        assert!(Work::from_compact_target(0x1d000000).is_zero());
    }

    #[test]
    fn smaller_target_means_more_work() {
        let easy = Work::from_compact_target(0x1d00ffff);
        let hard = Work::from_compact_target(0x1b0404cb);
        assert!(hard > easy);
    }

    #[test]
    fn addition_and_byte_round_trip() {
        let a = Work::from(u64::MAX);
        let b = Work::from(1);
        let sum = &a + &b;
        assert_eq!(sum.to_be_bytes(), vec![1, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(Work::from_be_bytes(&sum.to_be_bytes()), sum);
    }

    #[test]
    fn serde_uses_decimal_strings() {
        let json = serde_json::to_string(&Work::from(42)).unwrap();
        assert_eq!(json, "\"42\"");
        let back: Work = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Work::from(42));
    }
}
