//! Interleaved-bit geohash keys.
//!
//! A `GeoHash` packs two quantized 32-bit coordinates into one 64-bit
//! value, x bits at even positions and y bits at odd positions, most
//! significant first. Keys sort lexicographically, so keys sharing a
//! prefix occupy one quadtree cell and sit adjacent in the index.

use std::fmt;
use std::str::FromStr;

use meridian_common::{MeridianError, Result};

/// A geohash at some precision.
///
/// `bits` is the number of (x, y) bit pairs encoded, in [0, 32]; bit
/// positions below `2 * bits` are always zero. Field order matters: the
/// derived ordering compares `value` first, which is the index key
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct GeoHash {
    value: u64,
    bits: u8,
}

/// Spreads the bits of `v` so bit i lands at position 2i.
#[inline]
fn spread(v: u32) -> u64 {
    let mut x = v as u64;
    x = (x | (x << 16)) & 0x0000_FFFF_0000_FFFF;
    x = (x | (x << 8)) & 0x00FF_00FF_00FF_00FF;
    x = (x | (x << 4)) & 0x0F0F_0F0F_0F0F_0F0F;
    x = (x | (x << 2)) & 0x3333_3333_3333_3333;
    x = (x | (x << 1)) & 0x5555_5555_5555_5555;
    x
}

/// Inverse of `spread`: collects the bits at even positions.
#[inline]
fn compact(v: u64) -> u32 {
    let mut x = v & 0x5555_5555_5555_5555;
    x = (x | (x >> 1)) & 0x3333_3333_3333_3333;
    x = (x | (x >> 2)) & 0x0F0F_0F0F_0F0F_0F0F;
    x = (x | (x >> 4)) & 0x00FF_00FF_00FF_00FF;
    x = (x | (x >> 8)) & 0x0000_FFFF_0000_FFFF;
    x = (x | (x >> 16)) & 0x0000_0000_FFFF_FFFF;
    x as u32
}

#[inline]
fn precision_mask(bits: u8) -> u64 {
    if bits == 0 {
        0
    } else {
        u64::MAX << (64 - 2 * bits as u32)
    }
}

impl GeoHash {
    /// The zero-precision hash naming the whole domain.
    pub fn unconstrained() -> Self {
        GeoHash { value: 0, bits: 0 }
    }

    /// Builds a hash from two quantized coordinates at the given precision.
    pub fn from_quantized(x: u32, y: u32, bits: u32) -> Self {
        debug_assert!(bits <= 32);
        let value = ((spread(x) << 1) | spread(y)) & precision_mask(bits as u8);
        GeoHash {
            value,
            bits: bits as u8,
        }
    }

    /// Recovers the quantized coordinates. Bits below the hash precision
    /// come back as zero, so the result names the cell's low corner.
    pub fn quantized(&self) -> (u32, u32) {
        (compact(self.value >> 1), compact(self.value))
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn bits(&self) -> u32 {
        self.bits as u32
    }

    /// True when the hash constrains the search at all (precision > 0).
    pub fn constrains(&self) -> bool {
        self.bits > 0
    }

    /// Drops the last bit pair, naming the enclosing quadtree cell.
    pub fn parent(&self) -> Self {
        if self.bits == 0 {
            return *self;
        }
        let bits = self.bits - 1;
        GeoHash {
            value: self.value & precision_mask(bits),
            bits,
        }
    }

    /// Moves `dx`/`dy` cells along each axis at the current precision.
    ///
    /// Coordinates wrap at the edge of the domain; callers that cannot
    /// handle a wrap must detect and reject it themselves.
    pub fn shifted(&self, dx: i32, dy: i32) -> Self {
        if self.bits == 0 {
            return *self;
        }
        let step = 1u32 << (32 - self.bits as u32);
        let slide = |c: u32, d: i32| -> u32 {
            if d >= 0 {
                c.wrapping_add(step.wrapping_mul(d as u32))
            } else {
                c.wrapping_sub(step.wrapping_mul(d.unsigned_abs()))
            }
        };
        let (x, y) = self.quantized();
        GeoHash::from_quantized(slide(x, dx), slide(y, dy), self.bits as u32)
    }

    /// Pure bitwise prefix test.
    pub fn has_prefix(&self, prefix: &GeoHash) -> bool {
        if prefix.bits == 0 {
            return true;
        }
        if self.bits < prefix.bits {
            return false;
        }
        (self.value ^ prefix.value) >> (64 - 2 * prefix.bits as u32) == 0
    }

    /// Longest common prefix of the two hashes.
    pub fn common_prefix(&self, other: &GeoHash) -> Self {
        let diff = self.value ^ other.value;
        let pairs = (diff.leading_zeros() / 2) as u8;
        let bits = pairs.min(self.bits).min(other.bits);
        GeoHash {
            value: self.value & precision_mask(bits),
            bits,
        }
    }

    /// The one-pair hash naming quadrant `q` (x bit high, y bit low).
    pub fn quadrant(q: u8) -> Self {
        debug_assert!(q < 4);
        GeoHash {
            value: (q as u64 & 0b11) << 62,
            bits: 1,
        }
    }

    /// Extends this hash with the bit pairs of `suffix`.
    pub fn append(&self, suffix: &GeoHash) -> Self {
        if self.bits >= 32 {
            return *self;
        }
        let bits = (self.bits + suffix.bits).min(32);
        let value = (self.value | (suffix.value >> (2 * self.bits as u32))) & precision_mask(bits);
        GeoHash { value, bits }
    }
}

impl fmt::Display for GeoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..(2 * self.bits as u32) {
            let bit = (self.value >> (63 - i)) & 1;
            write!(f, "{}", bit)?;
        }
        Ok(())
    }
}

impl FromStr for GeoHash {
    type Err = MeridianError;

    /// Parses the binary-string notation, e.g. `"1100"`.
    fn from_str(s: &str) -> Result<Self> {
        if s.len() % 2 != 0 || s.len() > 64 {
            return Err(MeridianError::InvalidGeometry(format!(
                "bad geohash string length: {}",
                s.len()
            )));
        }
        let mut value = 0u64;
        for (i, c) in s.chars().enumerate() {
            match c {
                '1' => value |= 1 << (63 - i as u32),
                '0' => {}
                _ => {
                    return Err(MeridianError::InvalidGeometry(format!(
                        "bad geohash character: {:?}",
                        c
                    )))
                }
            }
        }
        Ok(GeoHash {
            value,
            bits: (s.len() / 2) as u8,
        })
    }
}
