// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

#![allow(dead_code)]

use core::cell::{Cell, RefCell};
use embassy_time::Instant;
use embedded_hal::delay::DelayNs;
use embedded_hal::spi::{ErrorKind, ErrorType, Operation, SpiDevice};
use spi_flash::{opcode, Clock};
use std::rc::Rc;

pub const PAGE: usize = 256;

/// One instruction seen by the simulated chip, status reads excluded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cmd {
    pub opcode: u8,
    pub address: Option<u32>,
    /// Bytes read or programmed
    pub len: usize,
}

/// Behaviour of a W25Q class chip, enough to exercise the driver.
pub struct Chip {
    pub memory: Vec<u8>,
    pub jedec: [u8; 3],
    /// Status reports BUSY and WEL until a software reset
    pub dirty: bool,
    pub ignore_reset: bool,
    pub wel_stuck_low: bool,
    pub stuck_busy: bool,
    /// Status polls answered busy after each program or erase
    pub busy_polls: u32,
    pub fail_opcode: Option<u8>,
    pub log: Vec<Cmd>,
    pub resets: u32,
    wel: bool,
    busy: u32,
    reset_enabled: bool,
}

impl Chip {
    fn status(&mut self) -> u8 {
        if self.dirty {
            return 0x03;
        }
        let mut status = 0;
        if self.stuck_busy || self.busy > 0 {
            status |= 0x01;
            self.busy = self.busy.saturating_sub(1);
        }
        if self.wel {
            status |= 0x02;
        }
        status
    }

    fn erase(&mut self, address: u32, size: usize) {
        assert!(self.wel, "erase without write enable");
        let start = address as usize;
        assert_eq!(start % size, 0, "erase unit straddles its alignment");
        self.memory[start..start + size].fill(0xFF);
        self.wel = false;
        self.busy = self.busy_polls;
    }

    fn command(&mut self, cmd: &[u8]) -> Result<(), ErrorKind> {
        let address = address_of(cmd);
        match cmd[0] {
            opcode::WRITE_ENABLE => self.wel = !self.wel_stuck_low,
            opcode::ENABLE_RESET => self.reset_enabled = true,
            opcode::RESET_DEVICE => {
                if self.reset_enabled && !self.ignore_reset {
                    self.dirty = false;
                    self.wel = false;
                    self.busy = 0;
                }
                self.reset_enabled = false;
                self.resets += 1;
            }
            opcode::SECTOR_ERASE => self.erase(address.ok_or(ErrorKind::Other)?, 4 * 1024),
            opcode::BLOCK32_ERASE => self.erase(address.ok_or(ErrorKind::Other)?, 32 * 1024),
            opcode::BLOCK64_ERASE => self.erase(address.ok_or(ErrorKind::Other)?, 64 * 1024),
            opcode::CHIP_ERASE => {
                let size = self.memory.len();
                self.erase(0, size);
            }
            _ => return Err(ErrorKind::Other),
        }
        Ok(())
    }

    fn read(&mut self, cmd: &[u8], buf: &mut [u8]) -> Result<(), ErrorKind> {
        match cmd[0] {
            opcode::READ_STATUS => buf[0] = self.status(),
            opcode::JEDEC_ID => buf.copy_from_slice(&self.jedec),
            opcode::READ_DATA => {
                let start = address_of(cmd).ok_or(ErrorKind::Other)? as usize;
                buf.copy_from_slice(&self.memory[start..start + buf.len()]);
            }
            _ => return Err(ErrorKind::Other),
        }
        Ok(())
    }

    fn program(&mut self, cmd: &[u8], data: &[u8]) -> Result<(), ErrorKind> {
        if cmd[0] != opcode::PAGE_PROGRAM {
            return Err(ErrorKind::Other);
        }
        assert!(self.wel, "program without write enable");
        let start = address_of(cmd).ok_or(ErrorKind::Other)? as usize;
        assert!(start % PAGE + data.len() <= PAGE, "page program wraps");
        for (cell, byte) in self.memory[start..start + data.len()].iter_mut().zip(data) {
            *cell &= *byte;
        }
        self.wel = false;
        self.busy = self.busy_polls;
        Ok(())
    }
}

fn address_of(cmd: &[u8]) -> Option<u32> {
    (cmd.len() == 4).then(|| u32::from_be_bytes([0, cmd[1], cmd[2], cmd[3]]))
}

/// Shared handle to a simulated chip, one clone goes to the driver.
#[derive(Clone)]
pub struct SimChip(Rc<RefCell<Chip>>);

impl SimChip {
    /// Chip of `1 << exponent` bytes, erased and idle.
    pub fn new(exponent: u8) -> Self {
        Self(Rc::new(RefCell::new(Chip {
            memory: vec![0xFF; 1 << exponent],
            jedec: [0xEF, 0x40, exponent],
            dirty: false,
            ignore_reset: false,
            wel_stuck_low: false,
            stuck_busy: false,
            busy_polls: 1,
            fail_opcode: None,
            log: Vec::new(),
            resets: 0,
            wel: false,
            busy: 0,
            reset_enabled: false,
        })))
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Chip) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }

    pub fn take_log(&self) -> Vec<Cmd> {
        self.with(|chip| std::mem::take(&mut chip.log))
    }

    /// Logged instructions with the given opcode.
    pub fn commands(&self, opcode: u8) -> Vec<Cmd> {
        self.with(|chip| chip.log.iter().copied().filter(|c| c.opcode == opcode).collect())
    }
}

impl ErrorType for SimChip {
    type Error = ErrorKind;
}

impl SpiDevice for SimChip {
    fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), Self::Error> {
        let mut chip = self.0.borrow_mut();
        let (opcode, address, len) = match operations {
            [] => return Ok(()),
            [Operation::Write(cmd), ..] if chip.fail_opcode == Some(cmd[0]) => {
                return Err(ErrorKind::Other);
            }
            [Operation::Write(cmd)] => {
                chip.command(cmd)?;
                (cmd[0], address_of(cmd), 0)
            }
            [Operation::Write(cmd), Operation::Read(buf)] => {
                chip.read(cmd, buf)?;
                (cmd[0], address_of(cmd), buf.len())
            }
            [Operation::Write(cmd), Operation::Write(data)] => {
                chip.program(cmd, data)?;
                (cmd[0], address_of(cmd), data.len())
            }
            _ => return Err(ErrorKind::Other),
        };
        if opcode != opcode::READ_STATUS {
            chip.log.push(Cmd { opcode, address, len });
        }
        Ok(())
    }
}

pub struct NoDelay;

impl DelayNs for NoDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

/// Advances one millisecond every time it is read.
#[derive(Default)]
pub struct TickClock(Cell<u64>);

impl Clock for TickClock {
    fn now(&self) -> Instant {
        let now = self.0.get();
        self.0.set(now + 1);
        Instant::from_millis(now)
    }
}
