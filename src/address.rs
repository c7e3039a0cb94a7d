use core::cmp::Ordering;
use core::fmt;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use thiserror::Error;

/// Number of addressable sensors on one bus: `0-9`, `a-z`, `A-Z`.
pub const ADDRESS_SPACE: usize = 62;

const DIGITS: u8 = 10;
const LETTERS: u8 = 26;

const_assert_eq!(ADDRESS_SPACE, (DIGITS + LETTERS + LETTERS) as usize);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("'{0}' is not a valid sensor address")]
    InvalidCharacter(char),
    #[error("address field is empty")]
    Empty,
    #[error("address field '{0}' is longer than one character")]
    TooLong(alloc::string::String),
}

/// Single-character sensor address.
///
/// Ordering follows the discovery scan (`0-9`, then `a-z`, then `A-Z`) rather
/// than ASCII, where upper case would sort first.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "char", into = "char")]
pub struct SensorAddress(u8);

impl SensorAddress {
    pub fn new(c: char) -> Result<Self, AddressError> {
        if c.is_ascii_digit() || c.is_ascii_lowercase() || c.is_ascii_uppercase() {
            Ok(Self(c as u8))
        } else {
            Err(AddressError::InvalidCharacter(c))
        }
    }

    /// Parse a one-character field, as carried in configuration payloads.
    pub fn parse(field: &str) -> Result<Self, AddressError> {
        let field = field.trim();
        let mut chars = field.chars();
        match (chars.next(), chars.next()) {
            (None, _) => Err(AddressError::Empty),
            (Some(c), None) => Self::new(c),
            (Some(_), Some(_)) => Err(AddressError::TooLong(alloc::string::ToString::to_string(field))),
        }
    }

    /// Address at position `rank` in scan order.
    pub fn from_rank(rank: usize) -> Option<Self> {
        let rank = u8::try_from(rank).ok()?;
        let byte = if rank < DIGITS {
            b'0' + rank
        } else if rank < DIGITS + LETTERS {
            b'a' + (rank - DIGITS)
        } else if rank < DIGITS + 2 * LETTERS {
            b'A' + (rank - DIGITS - LETTERS)
        } else {
            return None;
        };
        Some(Self(byte))
    }

    /// Position in scan order, `0..ADDRESS_SPACE`.
    pub fn rank(self) -> usize {
        let b = self.0;
        let rank = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'z' => DIGITS + (b - b'a'),
            _ => DIGITS + LETTERS + (b - b'A'),
        };
        rank as usize
    }

    pub fn as_char(self) -> char {
        self.0 as char
    }

    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Every address in discovery scan order.
    pub fn scan_order() -> impl Iterator<Item = SensorAddress> {
        (0..ADDRESS_SPACE).filter_map(Self::from_rank)
    }
}

impl Ord for SensorAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for SensorAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl TryFrom<char> for SensorAddress {
    type Error = AddressError;

    fn try_from(c: char) -> Result<Self, Self::Error> {
        Self::new(c)
    }
}

impl From<SensorAddress> for char {
    fn from(address: SensorAddress) -> char {
        address.as_char()
    }
}

impl fmt::Display for SensorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

impl fmt::Debug for SensorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensorAddress('{}')", self.as_char())
    }
}
