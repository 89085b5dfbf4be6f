//! Flash layout of the application processor and the operations the
//! bootloader needs from its flash controller

use std::ops::RangeInclusive;

use heapless::Vec as HVec;
use log::debug;

use crate::error::{Error, FlashFault, FlashOperation};

pub const MAX_BANKS: u8 = 2;
pub const SECTORS_PER_BANK: u8 = 8;
pub const FIRST_SECTOR: u8 = 0;
pub const LAST_SECTOR: u8 = MAX_BANKS * SECTORS_PER_BANK - 1;

/// Flash word of the application processor, in bytes
pub const AP_FLASH_WORD: usize = 32;

/// Flash word of the battery management board, in bytes
pub const BMS_FLASH_WORD: usize = 8;

/// Where application images are linked to start
pub const APPLICATION_START_ADDR: u32 = 0x0802_0400;

pub const FLASH_BASE: u32 = 0x0800_0000;
pub const SECTOR_SIZE: u32 = 128 * 1024;

/// A contiguous run of sectors within one bank
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FlashRegion {
    bank: u8,
    first_sector: u8,
    sector_count: u8,
}

impl FlashRegion {
    pub const BOOTLOADER: FlashRegion = FlashRegion::unchecked(1, 0, 1);
    pub const PROGRAM_BANK1: FlashRegion = FlashRegion::unchecked(1, 1, 7);
    pub const PROGRAM_BANK2: FlashRegion = FlashRegion::unchecked(2, 0, 7);
    pub const RESERVED: FlashRegion = FlashRegion::unchecked(2, 7, 1);

    const fn unchecked(bank: u8, first_sector: u8, sector_count: u8) -> Self {
        FlashRegion {
            bank,
            first_sector,
            sector_count,
        }
    }

    /// Create a region, checking it lies within a single bank
    pub fn new(bank: u8, first_sector: u8, sector_count: u8) -> Result<Self, Error> {
        let valid = (1..=MAX_BANKS).contains(&bank)
            && first_sector < SECTORS_PER_BANK
            && sector_count >= 1
            && first_sector + sector_count <= SECTORS_PER_BANK;

        if valid {
            Ok(Self::unchecked(bank, first_sector, sector_count))
        } else {
            Err(Error::InvalidRegion {
                bank,
                first_sector,
                sector_count,
            })
        }
    }

    pub fn bank(&self) -> u8 {
        self.bank
    }

    /// First sector, relative to the start of the bank
    pub fn first_sector(&self) -> u8 {
        self.first_sector
    }

    pub fn sector_count(&self) -> u8 {
        self.sector_count
    }

    /// Sectors covered, numbered across both banks
    pub fn sectors(&self) -> RangeInclusive<u8> {
        let first = (self.bank - 1) * SECTORS_PER_BANK + self.first_sector;
        first..=first + self.sector_count - 1
    }

    /// Absolute address range covered
    pub fn addresses(&self) -> std::ops::Range<u32> {
        let sectors = self.sectors();
        let start = FLASH_BASE + u32::from(*sectors.start()) * SECTOR_SIZE;
        start..start + u32::from(self.sector_count) * SECTOR_SIZE
    }
}

/// The erase calls needed to clear a range of sectors
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErasePlan {
    MassErase,
    Regions(HVec<FlashRegion, 2>),
}

impl ErasePlan {
    /// Plan the erase of sectors `start..=end`, numbered across both banks
    pub fn for_range(start: i64, end: i64) -> Result<Self, Error> {
        let last = i64::from(LAST_SECTOR);
        if start < 0 || start > end || end > last {
            return Err(Error::BadEraseRange { start, end });
        }

        if start == i64::from(FIRST_SECTOR) && end == last {
            return Ok(ErasePlan::MassErase);
        }

        // both are within 0..=15 here
        let (start, end) = (start as u8, end as u8);
        let mut regions = HVec::new();

        for bank in 1..=MAX_BANKS {
            let bank_first = (bank - 1) * SECTORS_PER_BANK;
            let bank_last = bank_first + SECTORS_PER_BANK - 1;
            if end < bank_first || start > bank_last {
                continue;
            }

            let first = start.max(bank_first);
            let last = end.min(bank_last);
            let region = FlashRegion::new(bank, first - bank_first, last - first + 1)?;
            regions.push(region).map_err(|_| Error::BadEraseRange {
                start: i64::from(start),
                end: i64::from(end),
            })?;
        }

        debug!("Erase {start}..={end}: {regions:?}");
        Ok(ErasePlan::Regions(regions))
    }
}

/// Driver for the on-chip flash controller
pub trait FlashController {
    fn unlock(&mut self) -> Result<(), FlashFault>;

    fn lock(&mut self) -> Result<(), FlashFault>;

    /// Erase every sector of every bank.
    fn mass_erase(&mut self) -> Result<(), FlashFault>;

    fn erase_region(&mut self, region: FlashRegion) -> Result<(), FlashFault>;

    /// Program one flash word at `address`.
    fn program_word(&mut self, address: u32, word: &[u8]) -> Result<(), FlashFault>;

    fn read_word(&self, address: u32) -> u32;
}

/// An in-memory flash with the geometry of the application processor
#[derive(Clone, Debug)]
pub struct SimulatedFlash {
    memory: Vec<u8>,
    word_size: usize,
    locked: bool,
    fail_program_at: Option<u32>,
    fail_erase: bool,
    mass_erases: usize,
    erased_regions: Vec<FlashRegion>,
}

impl SimulatedFlash {
    pub fn new(word_size: usize) -> Self {
        let size = (u32::from(MAX_BANKS) * u32::from(SECTORS_PER_BANK) * SECTOR_SIZE) as usize;
        SimulatedFlash {
            memory: vec![0xFF; size],
            word_size,
            locked: true,
            fail_program_at: None,
            fail_erase: false,
            mass_erases: 0,
            erased_regions: Vec::new(),
        }
    }

    /// Make programming the word at `address` fail.
    pub fn fail_program_at(&mut self, address: u32) {
        self.fail_program_at = Some(address);
    }

    /// Make every erase fail.
    pub fn fail_erase(&mut self) {
        self.fail_erase = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn mass_erases(&self) -> usize {
        self.mass_erases
    }

    /// Regions erased so far, in order
    pub fn erased_regions(&self) -> &[FlashRegion] {
        &self.erased_regions
    }

    /// Bytes of flash starting at `address`
    pub fn read(&self, address: u32, len: usize) -> &[u8] {
        let offset = address.saturating_sub(FLASH_BASE) as usize;
        let end = (offset + len).min(self.memory.len());
        &self.memory[offset.min(end)..end]
    }

    fn check_unlocked(&self, operation: FlashOperation) -> Result<(), FlashFault> {
        if self.locked {
            Err(FlashFault::new(operation, 0x01))
        } else {
            Ok(())
        }
    }
}

impl FlashController for SimulatedFlash {
    fn unlock(&mut self) -> Result<(), FlashFault> {
        self.locked = false;
        Ok(())
    }

    fn lock(&mut self) -> Result<(), FlashFault> {
        self.locked = true;
        Ok(())
    }

    fn mass_erase(&mut self) -> Result<(), FlashFault> {
        self.check_unlocked(FlashOperation::Erase)?;
        if self.fail_erase {
            return Err(FlashFault::new(FlashOperation::Erase, 0x20));
        }

        self.memory.fill(0xFF);
        self.mass_erases += 1;
        Ok(())
    }

    fn erase_region(&mut self, region: FlashRegion) -> Result<(), FlashFault> {
        self.check_unlocked(FlashOperation::Erase)?;
        if self.fail_erase {
            return Err(FlashFault::new(FlashOperation::Erase, 0x20));
        }

        let range = region.addresses();
        let start = (range.start - FLASH_BASE) as usize;
        let end = (range.end - FLASH_BASE) as usize;
        self.memory[start..end].fill(0xFF);
        self.erased_regions.push(region);
        Ok(())
    }

    fn program_word(&mut self, address: u32, word: &[u8]) -> Result<(), FlashFault> {
        self.check_unlocked(FlashOperation::Program)?;

        let offset = address.wrapping_sub(FLASH_BASE) as usize;
        let misaligned = word.len() != self.word_size || offset % self.word_size != 0;
        if self.fail_program_at == Some(address) || misaligned || offset + word.len() > self.memory.len() {
            return Err(FlashFault::new(FlashOperation::Program, 0x40));
        }

        let target = &mut self.memory[offset..offset + word.len()];
        // programming can only clear bits
        if target.iter().any(|b| *b != 0xFF) {
            return Err(FlashFault::new(FlashOperation::Program, 0x80));
        }

        target.copy_from_slice(word);
        Ok(())
    }

    fn read_word(&self, address: u32) -> u32 {
        let bytes = self.read(address, 4);
        match bytes {
            [a, b, c, d] => u32::from_le_bytes([*a, *b, *c, *d]),
            _ => u32::MAX,
        }
    }
}
