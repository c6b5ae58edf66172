//! Target chip definitions for the OnBright OBS38S00x family.
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// MCU family description, embedded from `devices/obs38s003.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Family {
    pub name: String,
    pub description: String,
    /// Chip type byte reported at config offset 0.
    pub chip_type: u8,
    pub variants: Vec<Chip>,
    /// Named configuration/fuse offsets.
    pub fuses: Vec<Fuse>,
    /// Config offsets holding the vendor's flash checksum.
    pub checksum_offsets: Vec<u8>,
}

/// One MCU variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chip {
    pub name: String,
    #[serde(deserialize_with = "parse_size")]
    pub flash_size: u32,
    pub block_size: u32,
}

/// A named configuration byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fuse {
    pub offset: u8,
    pub name: String,
}

impl Family {
    pub fn load() -> Result<Self> {
        Ok(serde_yaml::from_str(include_str!(
            "../devices/obs38s003.yaml"
        ))?)
    }

    /// Find the variant matching a chip-type readback.
    pub fn guess(&self, chip_type: u8) -> Option<&Chip> {
        if chip_type == self.chip_type {
            self.variants.first()
        } else {
            None
        }
    }
}

impl Chip {
    pub const fn block_count(&self) -> u32 {
        self.flash_size / self.block_size
    }
}

impl ::std::fmt::Display for Chip {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(
            f,
            "{} ({}KiB flash, {} x {}B blocks)",
            self.name,
            self.flash_size / 1024,
            self.block_count(),
            self.block_size,
        )
    }
}

fn parse_size<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let s: String = serde::Deserialize::deserialize(deserializer)?;
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(D::Error::custom)
    } else if let Some(kib) = s.strip_suffix("KiB").or_else(|| s.strip_suffix("K")) {
        kib.trim()
            .parse::<u32>()
            .map(|v| v * 1024)
            .map_err(D::Error::custom)
    } else {
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{BLOCK_COUNT, CHIP_TYPE_OBS38S003, FLASH_SIZE};

    #[test]
    fn family_table_loads() {
        let family = Family::load().unwrap();
        assert_eq!(family.chip_type, CHIP_TYPE_OBS38S003);
        assert_eq!(family.fuses.len(), 7);
        assert_eq!(family.checksum_offsets.len(), 4);

        let chip = family.guess(CHIP_TYPE_OBS38S003).unwrap();
        assert_eq!(chip.flash_size as usize, FLASH_SIZE);
        assert_eq!(chip.block_count() as usize, BLOCK_COUNT);
    }

    #[test]
    fn guess_rejects_unknown_chip_type() {
        let family = Family::load().unwrap();
        assert!(family.guess(0xff).is_none());
    }
}
