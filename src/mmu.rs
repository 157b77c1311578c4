//! Four-bank paged memory unit.
//!
//! The 64 KiB Z80 address space is carved into four fixed 16 KiB banks.
//! Three magic addresses inside every bank (`OACK`/`OREQ`/`OCHR`) implement
//! a console-out doorbell: a guest program toggles `OREQ` to signal that a
//! fresh character is waiting at `OCHR`.

use std::fs;
use std::path::Path;

use tracing::{debug, error};

use crate::error::{VmError, VmResult};

pub const BANK_SIZE: usize = 16 * 1024;
pub const BANK_COUNT: usize = 4;

const OACK: u16 = 0xFFFD;
const OREQ: u16 = 0xFFFE;
const OCHR: u16 = 0xFFFF;

/// A single 16 KiB bank of guest memory.
#[derive(Clone)]
pub struct MemoryBank {
    data: Box<[u8; BANK_SIZE]>,
}

impl MemoryBank {
    fn zeroed() -> Self {
        Self {
            data: Box::new([0u8; BANK_SIZE]),
        }
    }

    /// Read without triggering the doorbell; used by tests and diagnostics.
    pub fn peek(&self, offset: u16) -> u8 {
        self.data[offset as usize & (BANK_SIZE - 1)]
    }

    /// Write without triggering the doorbell; used by tests and diagnostics.
    pub fn poke(&mut self, offset: u16, v: u8) {
        self.data[offset as usize & (BANK_SIZE - 1)] = v;
    }
}

/// Decodes a 16-bit guest address into a bank index and in-bank offset.
pub fn decode_address(addr: u16) -> (usize, u16) {
    let bank = (addr >> 14) & 3;
    let offset = addr & 0x3FFF;
    (bank as usize, offset)
}

/// Owns the four banks composing the guest's address space and raises the
/// console-out doorbell on the VM's behalf.
pub struct Mmu {
    banks: [MemoryBank; BANK_COUNT],
}

impl Mmu {
    pub fn new() -> Self {
        Self {
            banks: [
                MemoryBank::zeroed(),
                MemoryBank::zeroed(),
                MemoryBank::zeroed(),
                MemoryBank::zeroed(),
            ],
        }
    }

    pub fn reset(&mut self) {
        for bank in &mut self.banks {
            *bank = MemoryBank::zeroed();
        }
    }

    /// Loads exactly [`BANK_SIZE`] bytes from `path` into bank `index`.
    pub fn load_bank(&mut self, path: impl AsRef<Path>, index: u8) -> VmResult<()> {
        let path = path.as_ref();
        let bank = self.bank_mut(index)?;
        let bytes = fs::read(path).map_err(|source| {
            error!(path = %path.display(), "failed to open bank image");
            VmError::Io {
                path: path.to_path_buf(),
                source,
            }
        })?;
        if bytes.len() != BANK_SIZE {
            error!(
                path = %path.display(),
                got = bytes.len(),
                want = BANK_SIZE,
                "bank image has the wrong size"
            );
            return Err(VmError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("expected {BANK_SIZE} bytes, got {}", bytes.len()),
                ),
            });
        }
        bank.data.copy_from_slice(&bytes);
        debug!(path = %path.display(), index, "loaded bank");
        Ok(())
    }

    /// Writes exactly [`BANK_SIZE`] bytes of bank `index` out to `path`.
    pub fn save_bank(&self, path: impl AsRef<Path>, index: u8) -> VmResult<()> {
        let path = path.as_ref();
        let bank = self.bank(index)?;
        fs::write(path, bank.data.as_slice()).map_err(|source| {
            error!(path = %path.display(), "failed to write bank image");
            VmError::Io {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    fn bank(&self, index: u8) -> VmResult<&MemoryBank> {
        self.banks
            .get(index as usize)
            .ok_or(VmError::BankIndex(index))
    }

    fn bank_mut(&mut self, index: u8) -> VmResult<&mut MemoryBank> {
        self.banks
            .get_mut(index as usize)
            .ok_or(VmError::BankIndex(index))
    }

    /// Bank-direct read; never fails.
    pub fn rd_byte(&self, addr: u16) -> u8 {
        let (bank, offset) = decode_address(addr);
        self.banks[bank].peek(offset)
    }

    /// Write that may trip the console-out doorbell at `OREQ`. Returns the
    /// character that must be forwarded to SIO#0, if the doorbell fired.
    pub fn wr_byte(&mut self, addr: u16, data: u8) -> Option<u8> {
        let (bank, offset) = decode_address(addr);
        if addr == OREQ {
            let current = self.banks[bank].peek(OREQ);
            if data != current {
                let ch = self.banks[bank].peek(OCHR);
                let ack = self.banks[bank].peek(OACK).wrapping_add(1);
                self.banks[bank].poke(OACK, ack);
                self.banks[bank].poke(OREQ, data);
                return Some(ch);
            }
            self.banks[bank].poke(OREQ, data);
            return None;
        }
        self.banks[bank].poke(offset, data);
        None
    }

    pub fn bank_ref(&self, index: u8) -> VmResult<&MemoryBank> {
        self.bank(index)
    }
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn address_decode_round_trips() {
        for addr in [0x0000u16, 0x3FFF, 0x4000, 0x7FFF, 0x8000, 0xBFFF, 0xC000, 0xFFFF] {
            let (bank, offset) = decode_address(addr);
            let rebuilt = ((bank as u16) << 14) | offset;
            assert_eq!(rebuilt, addr);
        }
    }

    #[test]
    fn doorbell_fires_on_token_change_only() {
        let mut mmu = Mmu::new();
        assert_eq!(mmu.wr_byte(OCHR, b'H'), None);
        // First token write (0 -> 1) changes the cell, so it always fires.
        let fired = mmu.wr_byte(OREQ, 1);
        assert_eq!(fired, Some(b'H'));
        assert_eq!(mmu.rd_byte(OACK), 1);
        // Writing the same token again must not fire a second time.
        assert_eq!(mmu.wr_byte(OREQ, 1), None);
    }

    #[test]
    fn load_bank_rejects_wrong_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.rom");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(&[0u8; 100]).unwrap();
        let mut mmu = Mmu::new();
        assert!(matches!(mmu.load_bank(&path, 0), Err(VmError::Io { .. })));
    }

    #[test]
    fn load_bank_rejects_missing_file() {
        let mut mmu = Mmu::new();
        assert!(matches!(
            mmu.load_bank("definitely-missing.rom", 0),
            Err(VmError::Io { .. })
        ));
    }

    #[test]
    fn load_bank_rejects_bad_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.rom");
        fs::write(&path, vec![0u8; BANK_SIZE]).unwrap();
        let mut mmu = Mmu::new();
        assert!(matches!(
            mmu.load_bank(&path, 4),
            Err(VmError::BankIndex(4))
        ));
    }

    #[test]
    fn bank_round_trip_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bank.rom");
        let mut original = vec![0u8; BANK_SIZE];
        for (i, b) in original.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        fs::write(&path, &original).unwrap();

        let mut mmu = Mmu::new();
        mmu.load_bank(&path, 1).unwrap();
        let out_path = dir.path().join("bank_out.rom");
        mmu.save_bank(&out_path, 1).unwrap();
        let saved = fs::read(&out_path).unwrap();
        assert_eq!(saved, original);
    }
}
