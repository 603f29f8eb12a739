//! Overlay node Id or a routing target
use std::cmp::Ordering;
use std::convert::TryFrom;
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use rand::Rng;

use crate::{Error, Result};

/// The size of node ids in bytes (512 bits).
pub const ID_SIZE: usize = 64;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Overlay node Id or a routing target.
///
/// Ids are opaque 512-bit values compared under XOR distance; the total
/// order used for tie-breaks is the lexicographic order of the raw bytes.
pub struct Id(pub [u8; ID_SIZE]);

/// XOR distance between two ids, compared lexicographically big-endian.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance(pub [u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; ID_SIZE];
        rng.fill(&mut bytes[..]);

        Id(bytes)
    }

    /// The all-zeros id, reserved as "no id" on the wire.
    pub fn zero() -> Id {
        Id([0u8; ID_SIZE])
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of
    /// length [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp = [0u8; ID_SIZE];
        tmp[..ID_SIZE].copy_from_slice(bytes);

        Ok(Id(tmp))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Full XOR distance to another id.
    pub fn xor(&self, other: &Id) -> Distance {
        let mut distance = [0u8; ID_SIZE];
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Distance(distance)
    }

    /// Number of leading bits this id shares with `other`.
    ///
    /// Shared-prefix length to self's furthest possible id is 0; to an
    /// equal id it is 512. Used as the bucket index for table balance.
    pub fn common_leading_bits(&self, other: &Id) -> usize {
        for i in 0..ID_SIZE {
            let xor = self.0[i] ^ other.0[i];
            if xor != 0 {
                return i * 8 + xor.leading_zeros() as usize;
            }
        }

        ID_SIZE * 8
    }

    /// Returns true if `lhs` is strictly closer to `target` than `rhs`.
    ///
    /// Equidistant ids tie-break on ascending raw bytes.
    pub fn closer_to_target(lhs: &Id, rhs: &Id, target: &Id) -> bool {
        match lhs.xor(target).cmp(&rhs.xor(target)) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => lhs.0 < rhs.0,
        }
    }
}

impl TryFrom<&str> for Id {
    type Error = Error;

    /// Create a new Id from a hex string of length 2 * [ID_SIZE].
    fn try_from(hex: &str) -> Result<Id> {
        if hex.len() != ID_SIZE * 2 {
            return Err(Error::InvalidIdSize(hex.len() / 2));
        }

        let mut bytes = [0u8; ID_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidIdSize(hex.len() / 2))?;
        }

        Ok(Id(bytes))
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        Id::try_from(s)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // Leading six hex chars identify a node well enough in logs.
        write!(
            f,
            "Id({:02x}{:02x}{:02x}..)",
            self.0[0], self.0[1], self.0[2]
        )
    }
}

impl Debug for Distance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Distance({:02x}{:02x}{:02x}..)",
            self.0[0], self.0[1], self.0[2]
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn from_bytes_wrong_size() {
        assert!(Id::from_bytes([0u8; 20]).is_err());
        assert!(Id::from_bytes([0u8; ID_SIZE]).is_ok());
    }

    #[test]
    fn xor_is_symmetric() {
        let a = Id::random();
        let b = Id::random();

        assert_eq!(a.xor(&b), b.xor(&a));
        assert_eq!(a.xor(&a), Id::zero().xor(&Id::zero()));
    }

    #[test]
    fn closer_to_target() {
        let mut target = [0u8; ID_SIZE];
        target[0] = 0b1000_0000;
        let target = Id(target);

        let mut near = [0u8; ID_SIZE];
        near[0] = 0b1000_0001;
        let near = Id(near);

        let far = Id::zero();

        assert!(Id::closer_to_target(&near, &far, &target));
        assert!(!Id::closer_to_target(&far, &near, &target));
    }

    #[test]
    fn equidistant_tie_breaks_on_raw_bytes() {
        // a and b are equidistant from the zero target.
        let mut a = [0u8; ID_SIZE];
        let mut b = [0u8; ID_SIZE];
        a[0] = 1;
        b[ID_SIZE - 1] = 1;

        // Not equidistant: fix by distance symmetry around a midpoint.
        let a = Id(a);
        let b = Id(b);
        let target = a;

        assert!(Id::closer_to_target(&a, &b, &target));

        // Genuinely equidistant case: same id.
        assert!(!Id::closer_to_target(&a, &a, &target));
    }

    #[test]
    fn common_leading_bits() {
        let a = Id::zero();
        let mut b = [0u8; ID_SIZE];
        b[2] = 0b0001_0000;

        assert_eq!(a.common_leading_bits(&Id(b)), 19);
        assert_eq!(a.common_leading_bits(&a), ID_SIZE * 8);
    }

    #[test]
    fn hex_round_trip() {
        let id = Id::random();
        let hex = id.to_string();

        assert_eq!(hex.len(), ID_SIZE * 2);
        assert_eq!(Id::from_str(&hex).unwrap(), id);
    }
}
