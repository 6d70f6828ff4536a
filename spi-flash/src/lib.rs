// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Blocking driver for SPI NOR flash chips speaking the common W25Q instruction set.
//!
//! The chip is brought up by [`SpiNorFlash::init`], which walks
//! `Disable -> Init -> PowerOn -> Ready` and can be called again to resume
//! from the last completed stage. Every read, program and erase is bounded by
//! the capacity reported in the JEDEC identity.

#![no_std]

mod fmt;

mod error;
mod timer;

pub use error::Error;
#[cfg(feature = "time-driver")]
pub use timer::SystemClock;
pub use timer::{Clock, Countdown};

use bitflags::bitflags;
use consts::{
    FLASH_BLOCK32_ERASE_TIMEOUT_MS, FLASH_BLOCK32_SIZE, FLASH_BLOCK64_ERASE_TIMEOUT_MS, FLASH_BLOCK64_SIZE,
    FLASH_CHIP_ERASE_TIMEOUT_MS, FLASH_PAGE_PROGRAM_TIMEOUT_MS, FLASH_PAGE_SIZE, FLASH_POWER_ON_TIMEOUT_MS,
    FLASH_RESET_DELAY_MS, FLASH_SECTOR_ERASE_TIMEOUT_MS, FLASH_SECTOR_SIZE, FLASH_WRITE_ENABLE_TIMEOUT_MS,
};
use embassy_time::Duration;
use embedded_hal::delay::DelayNs;
use embedded_hal::spi::{Operation, SpiDevice};
use embedded_storage::nor_flash::{ErrorType, NorFlash, ReadNorFlash};

/// Instruction opcodes.
pub mod opcode {
    pub const JEDEC_ID: u8 = 0x9F;
    pub const READ_STATUS: u8 = 0x05;
    pub const READ_DATA: u8 = 0x03;
    pub const WRITE_ENABLE: u8 = 0x06;
    pub const PAGE_PROGRAM: u8 = 0x02;
    pub const SECTOR_ERASE: u8 = 0x20;
    pub const BLOCK32_ERASE: u8 = 0x52;
    pub const BLOCK64_ERASE: u8 = 0xD8;
    pub const CHIP_ERASE: u8 = 0xC7;
    pub const ENABLE_RESET: u8 = 0x66;
    pub const RESET_DEVICE: u8 = 0x99;
}

/// Largest capacity exponent reachable with 3-byte addresses.
const MAX_CAPACITY_EXPONENT: u8 = 24;

bitflags! {
    /// Status register 1.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Status: u8 {
        /// Erase or program in progress
        const BUSY = 1 << 0;
        /// Write enable latch
        const WEL = 1 << 1;
    }
}

/// Initialization progress of the chip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChipState {
    Disable,
    /// Bus is up, the chip has not been reset yet
    Init,
    /// Chip reset and idle, identity not read yet
    PowerOn,
    Ready,
    /// An operation failed midway; only `init` is accepted
    Error,
}

/// JEDEC identity read during initialization.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Identity {
    pub vendor: u8,
    pub memory_type: u8,
    pub capacity_exponent: u8,
}

impl Identity {
    /// Chip size in bytes.
    pub fn capacity(&self) -> u32 {
        1 << self.capacity_exponent
    }
}

/// Erase granularities, smallest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EraseUnit {
    Sector,
    Block32,
    Block64,
    Chip,
}

impl EraseUnit {
    /// Largest block unit aligned to `address` that divides `remaining`.
    fn select(address: u32, remaining: u32) -> Self {
        [EraseUnit::Block64, EraseUnit::Block32]
            .into_iter()
            .find(|unit| address % unit.size() == 0 && remaining % unit.size() == 0)
            .unwrap_or(EraseUnit::Sector)
    }

    fn size(self) -> u32 {
        match self {
            EraseUnit::Sector => FLASH_SECTOR_SIZE,
            EraseUnit::Block32 => FLASH_BLOCK32_SIZE,
            EraseUnit::Block64 => FLASH_BLOCK64_SIZE,
            // Only ever issued for the whole chip.
            EraseUnit::Chip => u32::MAX,
        }
    }

    fn opcode(self) -> u8 {
        match self {
            EraseUnit::Sector => opcode::SECTOR_ERASE,
            EraseUnit::Block32 => opcode::BLOCK32_ERASE,
            EraseUnit::Block64 => opcode::BLOCK64_ERASE,
            EraseUnit::Chip => opcode::CHIP_ERASE,
        }
    }

    fn timeout(self) -> Duration {
        Duration::from_millis(match self {
            EraseUnit::Sector => FLASH_SECTOR_ERASE_TIMEOUT_MS,
            EraseUnit::Block32 => FLASH_BLOCK32_ERASE_TIMEOUT_MS,
            EraseUnit::Block64 => FLASH_BLOCK64_ERASE_TIMEOUT_MS,
            EraseUnit::Chip => FLASH_CHIP_ERASE_TIMEOUT_MS,
        })
    }
}

/// Opcode followed by a 24-bit big endian address.
fn addressed(opcode: u8, address: u32) -> [u8; 4] {
    [opcode, (address >> 16) as u8, (address >> 8) as u8, address as u8]
}

fn in_bounds(capacity: u32, address: u32, len: usize) -> bool {
    address as u64 + len as u64 <= capacity as u64
}

pub struct SpiNorFlash<SPI, D, C> {
    spi: SPI,
    delay: D,
    clock: C,
    state: ChipState,
    identity: Option<Identity>,
}

impl<SPI, D, C> SpiNorFlash<SPI, D, C>
where
    SPI: SpiDevice,
    D: DelayNs,
    C: Clock,
{
    pub fn new(spi: SPI, delay: D, clock: C) -> Self {
        Self {
            spi,
            delay,
            clock,
            state: ChipState::Disable,
            identity: None,
        }
    }

    pub fn state(&self) -> ChipState {
        self.state
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity
    }

    /// Capacity in bytes, zero until the identity was read.
    pub fn capacity(&self) -> u32 {
        self.identity.map(|id| id.capacity()).unwrap_or(0)
    }

    pub fn release(self) -> (SPI, D, C) {
        (self.spi, self.delay, self.clock)
    }

    /// Brings the chip up, resuming from the last completed stage.
    ///
    /// A faulted driver restarts at the reset stage.
    pub fn init(&mut self) -> Result<(), Error<SPI::Error>> {
        if self.state == ChipState::Error {
            self.enter(ChipState::Init);
        }

        if self.state == ChipState::Disable {
            // Empty transaction: the bus toggles chip select once.
            self.spi.transaction(&mut []).map_err(Error::Spi)?;
            self.enter(ChipState::Init);
        }

        if self.state == ChipState::Init {
            self.power_on()?;
            self.enter(ChipState::PowerOn);
        }

        if self.state == ChipState::PowerOn {
            let mut id = [0u8; 3];
            self.spi
                .transaction(&mut [Operation::Write(&[opcode::JEDEC_ID]), Operation::Read(&mut id)])
                .map_err(Error::Spi)?;
            let identity = Identity {
                vendor: id[0],
                memory_type: id[1],
                capacity_exponent: id[2],
            };
            if identity.capacity_exponent == 0 || identity.capacity_exponent > MAX_CAPACITY_EXPONENT {
                error!("Unusable flash identity {:#x} {:#x} {:#x}", id[0], id[1], id[2]);
                return Err(Error::InvalidIdentity);
            }
            info!(
                "Flash vendor {:#x} type {:#x}, {} bytes",
                identity.vendor,
                identity.memory_type,
                identity.capacity()
            );
            self.identity = Some(identity);
            self.enter(ChipState::Ready);
        }

        Ok(())
    }

    /// Reads `buf.len()` bytes starting at `address`.
    pub fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), Error<SPI::Error>> {
        let capacity = self.ready_capacity()?;
        if buf.is_empty() {
            return Ok(());
        }
        if !in_bounds(capacity, address, buf.len()) {
            return Err(Error::OutOfBounds);
        }

        let result = self.read_chunks(address, buf);
        self.settle(result)
    }

    /// Programs `data` at `address`, one page program per touched page.
    ///
    /// The target range must be erased beforehand.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Error<SPI::Error>> {
        let capacity = self.ready_capacity()?;
        if data.is_empty() {
            return Ok(());
        }
        if !in_bounds(capacity, address, data.len()) {
            return Err(Error::OutOfBounds);
        }

        let result = self.program_pages(address, data);
        self.settle(result)
    }

    /// Erases `size` bytes at `address`; both must be sector aligned.
    pub fn erase_range(&mut self, address: u32, size: u32) -> Result<(), Error<SPI::Error>> {
        let capacity = self.ready_capacity()?;
        if size == 0 {
            return Ok(());
        }
        if !in_bounds(capacity, address, size as usize) {
            return Err(Error::OutOfBounds);
        }
        if address % FLASH_SECTOR_SIZE != 0 || size % FLASH_SECTOR_SIZE != 0 {
            return Err(Error::NotAligned);
        }

        let result = self.erase_units(address, size, capacity);
        self.settle(result)
    }

    fn enter(&mut self, state: ChipState) {
        debug!("Flash state {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn ready_capacity(&self) -> Result<u32, Error<SPI::Error>> {
        match self.state {
            ChipState::Ready => Ok(self.capacity()),
            ChipState::Error => Err(Error::Faulted),
            _ => Err(Error::NotReady),
        }
    }

    /// Faults the driver when an operation failed midway.
    fn settle<T>(&mut self, result: Result<T, Error<SPI::Error>>) -> Result<T, Error<SPI::Error>> {
        if let Err(e) = &result {
            if e.is_io() {
                warn!("Flash transfer failed");
            } else if matches!(e, Error::Timeout) {
                warn!("Flash operation timed out");
            } else {
                warn!("Flash operation failed");
            }
            self.enter(ChipState::Error);
        }
        result
    }

    fn power_on(&mut self) -> Result<(), Error<SPI::Error>> {
        let countdown = Countdown::start(&self.clock, Duration::from_millis(FLASH_POWER_ON_TIMEOUT_MS));
        loop {
            let status = self.read_status()?;
            if !status.intersects(Status::BUSY | Status::WEL) {
                return Ok(());
            }
            if countdown.expired(&self.clock) {
                error!("Flash did not come out of reset");
                return Err(Error::Timeout);
            }
            self.command(&[opcode::ENABLE_RESET])?;
            self.command(&[opcode::RESET_DEVICE])?;
            self.delay.delay_ms(FLASH_RESET_DELAY_MS);
        }
    }

    fn read_chunks(&mut self, mut address: u32, buf: &mut [u8]) -> Result<(), Error<SPI::Error>> {
        for chunk in buf.chunks_mut(FLASH_SECTOR_SIZE as usize) {
            self.spi
                .transaction(&mut [
                    Operation::Write(&addressed(opcode::READ_DATA, address)),
                    Operation::Read(chunk),
                ])
                .map_err(Error::Spi)?;
            address += chunk.len() as u32;
        }
        Ok(())
    }

    fn program_pages(&mut self, mut address: u32, mut data: &[u8]) -> Result<(), Error<SPI::Error>> {
        while !data.is_empty() {
            // First chunk ends on the next page boundary.
            let room = (FLASH_PAGE_SIZE - address % FLASH_PAGE_SIZE) as usize;
            let (page, rest) = data.split_at(data.len().min(room));

            self.write_enable()?;
            self.spi
                .transaction(&mut [
                    Operation::Write(&addressed(opcode::PAGE_PROGRAM, address)),
                    Operation::Write(page),
                ])
                .map_err(Error::Spi)?;
            self.wait_idle(Duration::from_millis(FLASH_PAGE_PROGRAM_TIMEOUT_MS))?;

            address += page.len() as u32;
            data = rest;
        }
        Ok(())
    }

    fn erase_units(&mut self, mut address: u32, size: u32, capacity: u32) -> Result<(), Error<SPI::Error>> {
        if address == 0 && size == capacity {
            return self.erase_unit(EraseUnit::Chip, 0);
        }

        let end = address + size;
        while address < end {
            let unit = EraseUnit::select(address, end - address);
            self.erase_unit(unit, address)?;
            address += unit.size();
        }
        Ok(())
    }

    fn erase_unit(&mut self, unit: EraseUnit, address: u32) -> Result<(), Error<SPI::Error>> {
        trace!("Erase {:?} at {:#x}", unit, address);
        self.write_enable()?;
        match unit {
            EraseUnit::Chip => self.command(&[opcode::CHIP_ERASE])?,
            _ => self.command(&addressed(unit.opcode(), address))?,
        }
        self.wait_idle(unit.timeout())
    }

    fn write_enable(&mut self) -> Result<(), Error<SPI::Error>> {
        self.command(&[opcode::WRITE_ENABLE])?;
        let countdown = Countdown::start(&self.clock, Duration::from_millis(FLASH_WRITE_ENABLE_TIMEOUT_MS));
        loop {
            if self.read_status()?.contains(Status::WEL) {
                return Ok(());
            }
            if countdown.expired(&self.clock) {
                return Err(Error::Timeout);
            }
        }
    }

    fn wait_idle(&mut self, timeout: Duration) -> Result<(), Error<SPI::Error>> {
        let countdown = Countdown::start(&self.clock, timeout);
        loop {
            if !self.read_status()?.contains(Status::BUSY) {
                return Ok(());
            }
            if countdown.expired(&self.clock) {
                return Err(Error::Timeout);
            }
        }
    }

    fn read_status(&mut self) -> Result<Status, Error<SPI::Error>> {
        let mut status = [0u8; 1];
        self.spi
            .transaction(&mut [Operation::Write(&[opcode::READ_STATUS]), Operation::Read(&mut status)])
            .map_err(Error::Spi)?;
        Ok(Status::from_bits_retain(status[0]))
    }

    fn command(&mut self, bytes: &[u8]) -> Result<(), Error<SPI::Error>> {
        self.spi.write(bytes).map_err(Error::Spi)
    }
}

impl<SPI: SpiDevice, D, C> ErrorType for SpiNorFlash<SPI, D, C> {
    type Error = Error<SPI::Error>;
}

impl<SPI, D, C> ReadNorFlash for SpiNorFlash<SPI, D, C>
where
    SPI: SpiDevice,
    D: DelayNs,
    C: Clock,
{
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        SpiNorFlash::read(self, offset, bytes)
    }

    fn capacity(&self) -> usize {
        SpiNorFlash::capacity(self) as usize
    }
}

impl<SPI, D, C> NorFlash for SpiNorFlash<SPI, D, C>
where
    SPI: SpiDevice,
    D: DelayNs,
    C: Clock,
{
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = FLASH_SECTOR_SIZE as usize;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        let Some(size) = to.checked_sub(from) else {
            return Err(Error::OutOfBounds);
        };
        self.erase_range(from, size)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        SpiNorFlash::write(self, offset, bytes)
    }
}
