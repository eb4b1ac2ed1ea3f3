use std::str::FromStr;

use derive_more::Display;
use thiserror::Error;

/// Unit used to size one virtual device slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum MemoryUnit {
    #[display("MiB")]
    MiB,
    #[display("GiB")]
    GiB,
}

#[derive(Debug, Error)]
#[error("unsupported memory unit: {0}")]
pub struct UnsupportedMemoryUnit(String);

impl FromStr for MemoryUnit {
    type Err = UnsupportedMemoryUnit;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MiB" => Ok(Self::MiB),
            "GiB" => Ok(Self::GiB),
            other => Err(UnsupportedMemoryUnit(other.to_string())),
        }
    }
}

impl MemoryUnit {
    /// Parses the unit, falling back to GiB with a warning.
    pub fn parse_or_default(value: &str) -> Self {
        value.parse().unwrap_or_else(|e| {
            tracing::warn!("{e}, use memory unit GiB as default");
            Self::GiB
        })
    }

    /// Converts a capacity in MiB into this unit, rounding down.
    pub fn convert(self, memory_mib: u64) -> u64 {
        match self {
            Self::MiB => memory_mib,
            Self::GiB => memory_mib / 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    #[test]
    fn parse_known_units() {
        assert_eq!("MiB".parse::<MemoryUnit>().unwrap(), MemoryUnit::MiB);
        assert_eq!("GiB".parse::<MemoryUnit>().unwrap(), MemoryUnit::GiB);
        assert!("gib".parse::<MemoryUnit>().is_err());
    }

    #[test]
    fn invalid_unit_defaults_to_gib() {
        assert_eq!(MemoryUnit::parse_or_default("KiB"), MemoryUnit::GiB);
        assert_eq!(MemoryUnit::parse_or_default("MiB"), MemoryUnit::MiB);
    }

    #[test]
    fn convert_floors_to_whole_units() {
        assert_eq!(MemoryUnit::MiB.convert(8000), 8000);
        assert_eq!(MemoryUnit::GiB.convert(8000), 7);
        assert_eq!(MemoryUnit::GiB.convert(1023), 0);
        assert_eq!(MemoryUnit::GiB.convert(16384), 16);
    }

    #[test]
    fn display_matches_flag_values() {
        assert_eq!(MemoryUnit::MiB.to_string(), "MiB");
        assert_eq!(MemoryUnit::GiB.to_string(), "GiB");
    }
}
