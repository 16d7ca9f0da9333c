//! Global IDs — hierarchical addresses for remote objects, art, and forms.
//!
//! A GID has two or three numeric components. The canonical textual form
//! joins them with dashes: `"32-105"` or `"1-0-1329"`.
//!
//! Wire widths (big-endian):
//!   2-part  `a-b`    → a: u8, b: u16          (3 bytes)
//!   3-part  `a-b-c`  → a: u8, b: u8, c: u16   (4 bytes)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::atom::AtomError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gid {
    Two { domain: u8, id: u16 },
    Three { domain: u8, major: u8, id: u16 },
}

impl Gid {
    pub fn two(domain: u8, id: u16) -> Self {
        Gid::Two { domain, id }
    }

    pub fn three(domain: u8, major: u8, id: u16) -> Self {
        Gid::Three { domain, major, id }
    }

    /// Component tuple, widened for comparison and display.
    pub fn components(&self) -> Vec<u32> {
        match *self {
            Gid::Two { domain, id } => vec![domain as u32, id as u32],
            Gid::Three { domain, major, id } => vec![domain as u32, major as u32, id as u32],
        }
    }

    /// Encoded size on the wire.
    pub fn wire_len(&self) -> usize {
        match self {
            Gid::Two { .. } => 3,
            Gid::Three { .. } => 4,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            Gid::Two { domain, id } => {
                out.push(domain);
                out.extend_from_slice(&id.to_be_bytes());
            }
            Gid::Three { domain, major, id } => {
                out.push(domain);
                out.push(major);
                out.extend_from_slice(&id.to_be_bytes());
            }
        }
    }

    /// Decode from exactly 3 or 4 bytes.
    pub fn decode(data: &[u8]) -> Result<Self, AtomError> {
        match data {
            [domain, hi, lo] => Ok(Gid::Two {
                domain: *domain,
                id: u16::from_be_bytes([*hi, *lo]),
            }),
            [domain, major, hi, lo] => Ok(Gid::Three {
                domain: *domain,
                major: *major,
                id: u16::from_be_bytes([*hi, *lo]),
            }),
            other => Err(AtomError::Format(format!(
                "gid field must be 3 or 4 bytes, got {}",
                other.len()
            ))),
        }
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gid::Two { domain, id } => write!(f, "{domain}-{id}"),
            Gid::Three { domain, major, id } => write!(f, "{domain}-{major}-{id}"),
        }
    }
}

impl FromStr for Gid {
    type Err = AtomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || AtomError::Format(format!("invalid gid literal {s:?}"));
        let parts: Vec<&str> = s.trim().split('-').collect();
        let nums = parts
            .iter()
            .map(|p| {
                if p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(bad());
                }
                p.parse::<u32>().map_err(|_| bad())
            })
            .collect::<Result<Vec<u32>, _>>()?;

        match nums.as_slice() {
            [a, b] => Ok(Gid::Two {
                domain: u8::try_from(*a).map_err(|_| bad())?,
                id: u16::try_from(*b).map_err(|_| bad())?,
            }),
            [a, b, c] => Ok(Gid::Three {
                domain: u8::try_from(*a).map_err(|_| bad())?,
                major: u8::try_from(*b).map_err(|_| bad())?,
                id: u16::try_from(*c).map_err(|_| bad())?,
            }),
            _ => Err(bad()),
        }
    }
}

impl Serialize for Gid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Gid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
