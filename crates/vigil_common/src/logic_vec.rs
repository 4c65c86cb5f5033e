//! Packed four-state port values.

use crate::logic::Logic;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of logic values packed per u64 word.
const VALUES_PER_WORD: u32 = 32;

/// The value of one port: a fixed-width vector of [`Logic`] bits.
///
/// Bits are packed two per value, 32 values per `u64` word, with index 0
/// being the least significant bit. The text form is MSB-first, e.g.
/// `"10XZ"`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicVec {
    width: u32,
    data: Vec<u64>,
}

/// Error returned when a port value string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseLogicVecError {
    /// The string was empty.
    #[error("empty port value")]
    Empty,
    /// The string contained a character other than 0, 1, x or z.
    #[error("invalid character '{ch}' at position {position} in port value")]
    InvalidChar {
        /// The offending character.
        ch: char,
        /// Zero-based character position from the left.
        position: usize,
    },
}

impl LogicVec {
    /// Creates a vector of the given width with every bit `Zero`.
    pub fn zeros(width: u32) -> Self {
        Self {
            width,
            data: vec![0; word_count(width)],
        }
    }

    /// Creates a vector of the given width with every bit `X`.
    pub fn unknown(width: u32) -> Self {
        Self::filled(width, Logic::X)
    }

    /// Creates a vector of the given width with every bit set to `value`.
    pub fn filled(width: u32, value: Logic) -> Self {
        let mut word = 0u64;
        for slot in 0..VALUES_PER_WORD {
            word |= (value as u64) << (slot * 2);
        }
        let mut v = Self {
            width,
            data: vec![word; word_count(width)],
        };
        v.clear_unused();
        v
    }

    /// Creates a single-bit vector.
    pub fn from_bool(value: bool) -> Self {
        Self::filled(1, Logic::from(value))
    }

    /// Creates a vector from the low `width` bits of `value`.
    pub fn from_u64(value: u64, width: u32) -> Self {
        let mut v = Self::zeros(width);
        for i in 0..width.min(64) {
            if (value >> i) & 1 != 0 {
                v.set(i, Logic::One);
            }
        }
        v
    }

    /// Returns the number of bits.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Returns the bit at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.width()`.
    pub fn get(&self, index: u32) -> Logic {
        assert!(
            index < self.width,
            "bit {index} out of range for width {}",
            self.width
        );
        let (word, shift) = locate(index);
        Logic::from_bits(self.data[word] >> shift)
    }

    /// Sets the bit at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.width()`.
    pub fn set(&mut self, index: u32, value: Logic) {
        assert!(
            index < self.width,
            "bit {index} out of range for width {}",
            self.width
        );
        let (word, shift) = locate(index);
        self.data[word] = (self.data[word] & !(0b11 << shift)) | ((value as u64) << shift);
    }

    /// Iterates over the bits from least to most significant.
    pub fn bits(&self) -> impl Iterator<Item = Logic> + '_ {
        (0..self.width).map(move |i| self.get(i))
    }

    /// Returns `true` when no bit is `X` or `Z`.
    pub fn is_known(&self) -> bool {
        self.bits().all(Logic::is_known)
    }

    /// Returns `true` when every bit is `One`.
    pub fn is_all_one(&self) -> bool {
        self.bits().all(|b| b == Logic::One)
    }

    /// Converts to an integer when every bit is known and the width fits.
    pub fn to_u64(&self) -> Option<u64> {
        if self.width > 64 {
            return None;
        }
        let mut result = 0u64;
        for (i, bit) in self.bits().enumerate() {
            match bit {
                Logic::Zero => {}
                Logic::One => result |= 1 << i,
                Logic::X | Logic::Z => return None,
            }
        }
        Some(result)
    }

    fn clear_unused(&mut self) {
        let used = self.width % VALUES_PER_WORD;
        if used != 0 {
            if let Some(last) = self.data.last_mut() {
                *last &= (1u64 << (used * 2)) - 1;
            }
        }
    }
}

impl FromStr for LogicVec {
    type Err = ParseLogicVecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let chars: Vec<char> = s.trim().chars().filter(|c| *c != '_').collect();
        if chars.is_empty() {
            return Err(ParseLogicVecError::Empty);
        }
        let mut v = Self::zeros(chars.len() as u32);
        for (position, ch) in chars.iter().enumerate() {
            let bit = Logic::from_char(*ch)
                .ok_or(ParseLogicVecError::InvalidChar { ch: *ch, position })?;
            v.set((chars.len() - 1 - position) as u32, bit);
        }
        Ok(v)
    }
}

impl fmt::Display for LogicVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in (0..self.width).rev() {
            write!(f, "{}", self.get(i))?;
        }
        Ok(())
    }
}

impl fmt::Debug for LogicVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogicVec({}'b{self})", self.width)
    }
}

fn locate(index: u32) -> (usize, u32) {
    (
        (index / VALUES_PER_WORD) as usize,
        (index % VALUES_PER_WORD) * 2,
    )
}

fn word_count(width: u32) -> usize {
    width.div_ceil(VALUES_PER_WORD) as usize
}
