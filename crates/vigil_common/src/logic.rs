//! Four-state logic values carried on design ports.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

/// One bit of a port value.
///
/// `X` is an unknown or uninitialized level and `Z` is an undriven
/// (high-impedance) level. The discriminants double as the 2-bit packed
/// encoding used by [`LogicVec`](crate::LogicVec).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum Logic {
    /// Driven low.
    Zero = 0,
    /// Driven high.
    One = 1,
    /// Unknown.
    X = 2,
    /// High-impedance.
    Z = 3,
}

impl Logic {
    /// Parses one character of a port value string.
    ///
    /// Accepts `0`, `1`, and either case of `x` and `z`.
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '0' => Some(Logic::Zero),
            '1' => Some(Logic::One),
            'x' | 'X' => Some(Logic::X),
            'z' | 'Z' => Some(Logic::Z),
            _ => None,
        }
    }

    /// Decodes the low two bits of a packed word.
    pub(crate) fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0 => Logic::Zero,
            1 => Logic::One,
            2 => Logic::X,
            _ => Logic::Z,
        }
    }

    /// Returns `true` for `Zero` and `One`.
    pub fn is_known(self) -> bool {
        matches!(self, Logic::Zero | Logic::One)
    }

    /// Returns the character used in port value strings.
    pub fn as_char(self) -> char {
        match self {
            Logic::Zero => '0',
            Logic::One => '1',
            Logic::X => 'X',
            Logic::Z => 'Z',
        }
    }
}

impl From<bool> for Logic {
    fn from(value: bool) -> Self {
        if value {
            Logic::One
        } else {
            Logic::Zero
        }
    }
}

impl fmt::Display for Logic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

// Resolution follows IEEE 1164: a dominating level wins, anything else
// involving X or Z resolves to X.
impl BitAnd for Logic {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        match (self, rhs) {
            (Logic::Zero, _) | (_, Logic::Zero) => Logic::Zero,
            (Logic::One, Logic::One) => Logic::One,
            _ => Logic::X,
        }
    }
}

impl BitOr for Logic {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        match (self, rhs) {
            (Logic::One, _) | (_, Logic::One) => Logic::One,
            (Logic::Zero, Logic::Zero) => Logic::Zero,
            _ => Logic::X,
        }
    }
}

impl Not for Logic {
    type Output = Self;

    fn not(self) -> Self {
        match self {
            Logic::Zero => Logic::One,
            Logic::One => Logic::Zero,
            Logic::X | Logic::Z => Logic::X,
        }
    }
}
