//! Programming session logic.
//!
//! Sequences the protocol primitives the way the vendor tool does:
//! handshake, chip-type probe, erase, byte-wise write, verify readback,
//! reset. Retry and abort policy lives here, not in the protocol engine.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};

use crate::constants::{BLOCK_SIZE, CHIP_TYPE_OBS38S003};
use crate::device::{Chip, Family, Fuse};
use crate::protocol::Programmer;
use crate::transport::{SerialTransport, Transport};

pub struct Flashing<T: Transport> {
    programmer: Programmer<T>,
    family: Family,
    chip: Chip,
    /// Raw chip type readback from config offset 0.
    chip_type: u8,
}

impl Flashing<SerialTransport> {
    pub fn new_from_serial(port: Option<&str>) -> Result<Self> {
        let transport = match port {
            Some(port) => SerialTransport::open(port)?,
            None => SerialTransport::open_any()?,
        };
        Self::new(transport)
    }
}

impl<T: Transport> Flashing<T> {
    /// Handshake with the target and probe its chip type.
    ///
    /// An unexpected chip type is reported but not fatal: a part with a
    /// corrupted config area answers 0xFF until erased, and the session
    /// must stay usable to run that erase.
    pub fn new(transport: T) -> Result<Self> {
        let mut programmer = Programmer::new(transport);

        programmer
            .handshake()
            .context("handshake with target failed")?;
        log::info!("Handshake complete");

        let chip_type = programmer
            .read_chip_type()
            .context("chip type readback failed")?;

        let family = Family::load()?;
        let chip = match family.guess(chip_type) {
            Some(chip) => chip.clone(),
            None => {
                log::warn!(
                    "Chip type reported was 0x{:02x}, expected 0x{:02x}; \
                     assuming {} anyway (a full erase may recover the part)",
                    chip_type,
                    CHIP_TYPE_OBS38S003,
                    family.variants[0].name,
                );
                family.variants[0].clone()
            }
        };
        log::debug!("found chip: {}", chip);

        Ok(Flashing {
            programmer,
            family,
            chip,
            chip_type,
        })
    }

    pub fn dump_info(&self) -> Result<()> {
        log::info!("Chip: {}", self.chip);
        log::info!("Chip type byte: 0x{:02x}", self.chip_type);
        log::info!("Family: {} - {}", self.family.name, self.family.description);
        Ok(())
    }

    pub fn erase(&mut self) -> Result<()> {
        self.programmer.erase_chip().context("chip erase failed")?;
        log::info!("Chip erase successful");
        Ok(())
    }

    /// Erase the chip and program `image` from flash address 0.
    pub fn flash(&mut self, image: &[u8]) -> Result<()> {
        self.check_image_size(image)?;
        // Writes only clear bits of erased cells, so the erase is not
        // optional.
        self.erase()?;

        let pb = progress_bar(image.len(), "writing");
        for (nth, chunk) in image.chunks(BLOCK_SIZE).enumerate() {
            let start = (nth * BLOCK_SIZE) as u16;
            self.programmer
                .write_flash_block(start, chunk)
                .with_context(|| format!("flash write failed in block at {start:#06x}"))?;
            pb.inc(chunk.len() as u64);
        }
        pb.finish_and_clear();

        log::info!("Wrote {} bytes", image.len());
        Ok(())
    }

    /// Read back the programmed range and compare it against `image`.
    pub fn verify(&mut self, image: &[u8]) -> Result<()> {
        self.check_image_size(image)?;

        let pb = progress_bar(image.len(), "verifying");
        let mut buf = [0u8; BLOCK_SIZE];
        for (nth, chunk) in image.chunks(BLOCK_SIZE).enumerate() {
            let start = (nth * BLOCK_SIZE) as u16;
            let buf = &mut buf[..chunk.len()];
            self.programmer
                .read_flash_block(start, buf)
                .with_context(|| format!("flash read failed in block at {start:#06x}"))?;

            if let Some(offset) = buf.iter().zip(chunk.iter()).position(|(a, b)| a != b) {
                let address = start as usize + offset;
                anyhow::bail!(
                    "verify mismatch at {:#06x}: wrote 0x{:02x}, read 0x{:02x}",
                    address,
                    chunk[offset],
                    buf[offset],
                );
            }
            pb.inc(chunk.len() as u64);
        }
        pb.finish_and_clear();

        log::info!("Verified {} bytes", image.len());
        Ok(())
    }

    /// Read `length` flash bytes starting at `start`.
    pub fn dump(&mut self, start: u16, length: usize) -> Result<Vec<u8>> {
        let pb = progress_bar(length, "reading");
        let mut data = vec![0u8; length];
        for (nth, chunk) in data.chunks_mut(BLOCK_SIZE).enumerate() {
            let chunk_start = start + (nth * BLOCK_SIZE) as u16;
            self.programmer
                .read_flash_block(chunk_start, chunk)
                .with_context(|| format!("flash read failed in block at {chunk_start:#06x}"))?;
            pb.inc(chunk.len() as u64);
        }
        pb.finish_and_clear();
        Ok(data)
    }

    /// Read every named fuse of the family.
    pub fn dump_fuses(&mut self) -> Result<Vec<(Fuse, u8)>> {
        let fuses = self.family.fuses.clone();
        let mut values = Vec::with_capacity(fuses.len());
        for fuse in fuses {
            let value = self
                .programmer
                .read_config_byte(fuse.offset)
                .with_context(|| format!("reading fuse {} failed", fuse.name))?;
            values.push((fuse, value));
        }
        Ok(values)
    }

    /// Write one fuse and read it back to confirm.
    pub fn set_fuse(&mut self, offset: u8, value: u8) -> Result<()> {
        self.programmer
            .write_config_byte(offset, value)
            .context("fuse write failed")?;
        log::info!("Wrote configuration byte 0x{:02x} = 0x{:02x}", offset, value);

        let readback = self
            .programmer
            .read_config_byte(offset)
            .context("fuse readback failed")?;
        anyhow::ensure!(
            readback == value,
            "fuse readback mismatch: wrote 0x{:02x}, read 0x{:02x}",
            value,
            readback,
        );
        Ok(())
    }

    /// Request an MCU reset. The chip gives no acknowledge for this, so
    /// success cannot be confirmed from this side.
    pub fn reset(&mut self) {
        self.programmer.reset_mcu();
        log::info!("Reset requested (fire and forget)");
    }

    fn check_image_size(&self, image: &[u8]) -> Result<()> {
        anyhow::ensure!(
            image.len() <= self.chip.flash_size as usize,
            "image of {} bytes does not fit in {} bytes of flash",
            image.len(),
            self.chip.flash_size,
        );
        Ok(())
    }
}

fn progress_bar(len: usize, msg: &'static str) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::with_template("{msg:>10} [{bar:40.cyan/blue}] {bytes}/{total_bytes}")
            .unwrap()
            .progress_chars("=> "),
    );
    pb.set_message(msg);
    pb
}
