//! Firmware file formats.
//!
//! The programmer only consumes a flat byte image; this module turns
//! Intel-HEX (the usual SDCC `.ihx` output), plain hex dumps, and raw
//! binaries into one.
use std::str;
use std::{borrow::Cow, path::Path};

use anyhow::Result;

/// Pad value for address gaps between HEX records: erased flash reads
/// back as 0xFF.
const FILL_BYTE: u8 = 0xff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    PlainHex,
    IntelHex,
    Binary,
}

pub fn read_firmware_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let p = path.as_ref();
    let raw = std::fs::read(p)?;

    let format = guess_format(p, &raw);
    log::info!("Read {} as {:?} format", p.display(), format);
    match format {
        FirmwareFormat::PlainHex => Ok(hex::decode(
            raw.into_iter()
                .filter(|&c| c != b'\r' && c != b'\n')
                .collect::<Vec<u8>>(),
        )?),
        FirmwareFormat::IntelHex => read_ihex(str::from_utf8(&raw)?),
        FirmwareFormat::Binary => Ok(raw),
    }
}

pub fn guess_format(path: &Path, raw: &[u8]) -> FirmwareFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihx", "ihe", "h86", "hex", "a43", "a90"].contains(&&*ext) {
        return FirmwareFormat::IntelHex;
    }

    if raw.first() == Some(&b':')
        && raw
            .iter()
            .all(|&c| (c as char).is_ascii_hexdigit() || c == b':' || c == b'\n' || c == b'\r')
    {
        FirmwareFormat::IntelHex
    } else if raw
        .iter()
        .all(|&c| (c as char).is_ascii_hexdigit() || c == b'\n' || c == b'\r')
    {
        FirmwareFormat::PlainHex
    } else {
        FirmwareFormat::Binary
    }
}

/// Decode Intel-HEX records into a flat image based at address 0.
pub fn read_ihex(data: &str) -> Result<Vec<u8>> {
    use ihex::Record;

    let mut base_address = 0;

    let mut records = vec![];
    for record in ihex::Reader::new(data) {
        let record = record?;
        use Record::*;
        match record {
            Data { offset, value } => {
                let offset = base_address + offset as u32;

                records.push((offset, value.into()));
            }
            EndOfFile => (),
            ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            StartSegmentAddress { .. } => (),
            ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            StartLinearAddress(_) => (),
        };
    }
    merge_sections(records)
}

/// Merge (address, bytes) sections into one image based at 0, padding
/// gaps with [`FILL_BYTE`]. Flash addresses are absolute, so a section
/// starting past 0 keeps its offset.
fn merge_sections(mut sections: Vec<(u32, Cow<'_, [u8]>)>) -> Result<Vec<u8>> {
    anyhow::ensure!(!sections.is_empty(), "no data records in firmware file");
    sections.sort(); // order by start address

    let end_address = sections.last().unwrap().0 + sections.last().unwrap().1.len() as u32;

    let mut binary = vec![FILL_BYTE; end_address as usize];
    for (addr, sect) in sections {
        binary[addr as usize..addr as usize + sect.len()].copy_from_slice(&sect);
    }
    Ok(binary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_ihex_records() {
        // Two data records with a two-byte gap, then EOF.
        let src = ":0400000001020304F2\n:04000600AABBCCDDE8\n:00000001FF\n";
        let image = read_ihex(src).unwrap();
        assert_eq!(
            image,
            vec![0x01, 0x02, 0x03, 0x04, 0xff, 0xff, 0xaa, 0xbb, 0xcc, 0xdd]
        );
    }

    #[test]
    fn guesses_format_from_content() {
        let p = Path::new("firmware.bin");
        assert_eq!(
            guess_format(p, b":00000001FF\n"),
            FirmwareFormat::IntelHex
        );
        assert_eq!(guess_format(p, b"0102ab\n"), FirmwareFormat::PlainHex);
        assert_eq!(guess_format(p, &[0x02, 0x01, 0x00]), FirmwareFormat::Binary);
        assert_eq!(
            guess_format(Path::new("blink.ihx"), &[0x00]),
            FirmwareFormat::IntelHex
        );
    }
}
