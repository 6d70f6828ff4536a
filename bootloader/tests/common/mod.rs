// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

#![allow(dead_code)]

use bootloader::{Bootloader, Channel, Clock, Config, Received};
use embassy_time::Instant;
use embedded_storage::nor_flash::{ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash};
use host_protocol::{validate_frame, FrameBuf, Message};
use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
    Erase { from: u32, to: u32 },
}

/// RAM backed NOR flash: writes can only clear bits, erases set whole units to `0xFF`.
pub struct MemFlash<const W: usize, const E: usize> {
    pub data: Vec<u8>,
    pub log: Vec<Op>,
    /// Writes accepted before every further write fails
    pub writes_left: Option<usize>,
    pub fail_erase: bool,
}

impl<const W: usize, const E: usize> MemFlash<W, E> {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0xFF; size],
            log: Vec::new(),
            writes_left: None,
            fail_erase: false,
        }
    }

    pub fn bytes(&self, offset: u32, len: usize) -> &[u8] {
        &self.data[offset as usize..offset as usize + len]
    }

    pub fn take_log(&mut self) -> Vec<Op> {
        std::mem::take(&mut self.log)
    }

    pub fn writes(&self) -> Vec<(u32, usize)> {
        self.log
            .iter()
            .filter_map(|op| match *op {
                Op::Write { offset, len } => Some((offset, len)),
                _ => None,
            })
            .collect()
    }

    pub fn erases(&self) -> Vec<(u32, u32)> {
        self.log
            .iter()
            .filter_map(|op| match *op {
                Op::Erase { from, to } => Some((from, to)),
                _ => None,
            })
            .collect()
    }
}

impl<const W: usize, const E: usize> ErrorType for MemFlash<W, E> {
    type Error = NorFlashErrorKind;
}

impl<const W: usize, const E: usize> ReadNorFlash for MemFlash<W, E> {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let start = offset as usize;
        if start + bytes.len() > self.data.len() {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        bytes.copy_from_slice(&self.data[start..start + bytes.len()]);
        self.log.push(Op::Read {
            offset,
            len: bytes.len(),
        });
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl<const W: usize, const E: usize> NorFlash for MemFlash<W, E> {
    const WRITE_SIZE: usize = W;
    const ERASE_SIZE: usize = E;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        let (from_, to_) = (from as usize, to as usize);
        if from_ > to_ || to_ > self.data.len() {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        if from_ % E != 0 || to_ % E != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        if self.fail_erase {
            return Err(NorFlashErrorKind::Other);
        }
        self.data[from_..to_].fill(0xFF);
        self.log.push(Op::Erase { from, to });
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let start = offset as usize;
        if start + bytes.len() > self.data.len() {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        if start % W != 0 || bytes.len() % W != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        match self.writes_left {
            Some(0) => return Err(NorFlashErrorKind::Other),
            Some(n) => self.writes_left = Some(n - 1),
            None => {}
        }
        for (cell, byte) in self.data[start..].iter_mut().zip(bytes) {
            *cell &= *byte;
        }
        self.log.push(Op::Write {
            offset,
            len: bytes.len(),
        });
        Ok(())
    }
}

/// Scripted host side of the link.
#[derive(Default)]
pub struct MockChannel {
    /// Chunks handed out one per receive call
    pub inbox: VecDeque<Vec<u8>>,
    pub sent: Vec<Vec<u8>>,
    pub fail_send: bool,
}

impl MockChannel {
    pub fn push(&mut self, msg: &Message<'_>) {
        self.inbox.push_back(encode(msg));
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.inbox.push_back(bytes.to_vec());
    }

    pub fn take_sent(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.sent)
    }
}

impl Channel for MockChannel {
    type Error = ();

    fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        if self.fail_send {
            return Err(());
        }
        self.sent.push(bytes.to_vec());
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<Received, Self::Error> {
        let Some(mut chunk) = self.inbox.pop_front() else {
            return Ok(Received::default());
        };
        let len = chunk.len().min(buf.len());
        buf[..len].copy_from_slice(&chunk[..len]);
        if len < chunk.len() {
            self.inbox.push_front(chunk.split_off(len));
        }
        Ok(Received {
            len,
            more: !self.inbox.is_empty(),
        })
    }
}

#[derive(Clone, Default)]
pub struct ManualClock(Rc<Cell<u64>>);

impl ManualClock {
    pub fn advance(&self, ms: u64) {
        self.0.set(self.0.get() + ms);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        Instant::from_millis(self.0.get())
    }
}

pub fn encode(msg: &Message<'_>) -> Vec<u8> {
    let mut buf = FrameBuf::new();
    msg.encode(&mut buf).unwrap();
    buf.to_vec()
}

/// Parses a frame sent by the bootloader.
pub fn decode(bytes: &[u8]) -> Message<'_> {
    let frame = validate_frame(bytes).unwrap();
    assert_eq!(frame.wire_len(), bytes.len());
    Message::decode(&frame).unwrap()
}

/// External flash covering the default partition table.
pub type ExtFlash = MemFlash<1, 4096>;
/// Program flash with a 4 byte write granularity, as on most MCUs.
pub type ProgramFlash = MemFlash<4, 2048>;
pub type Loader = Bootloader<MockChannel, ExtFlash, ProgramFlash, ManualClock>;

pub const EXT_FLASH_SIZE: usize = 0x10_0000;

pub fn setup() -> (Loader, ManualClock) {
    setup_with(Config::default())
}

pub fn setup_with(config: Config) -> (Loader, ManualClock) {
    let _ = pretty_env_logger::try_init();
    let program = ProgramFlash::new((config.app_offset + config.app_size) as usize);
    let clock = ManualClock::default();
    let mut loader = Bootloader::new(
        config,
        MockChannel::default(),
        ExtFlash::new(EXT_FLASH_SIZE),
        program,
        clock.clone(),
    );
    loader.init();
    (loader, clock)
}

/// Feeds `msg` and runs one tick, returning the frames sent in response.
pub fn exchange(loader: &mut Loader, msg: &Message<'_>) -> Vec<Vec<u8>> {
    loader.channel_mut().push(msg);
    loader.tick();
    loader.channel_mut().take_sent()
}

/// Single reply expected from the bootloader.
pub fn reply(loader: &mut Loader, msg: &Message<'_>) -> Vec<u8> {
    let mut sent = exchange(loader, msg);
    assert_eq!(sent.len(), 1, "expected exactly one reply");
    sent.remove(0)
}

pub fn handshake(loader: &mut Loader) {
    let hello = reply(loader, &Message::HostHello);
    assert_eq!(decode(&hello), Message::Hello);
}

/// Deterministic image contents.
pub fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}
