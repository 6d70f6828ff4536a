// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Byte channel between the bootloader and the host.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Outcome of a receive call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Received {
    /// Bytes copied into the caller's buffer
    pub len: usize,
    /// More bytes are pending, either still arriving or not yet copied
    pub more: bool,
}

/// Byte oriented send/receive primitive provided by the board.
pub trait Channel {
    type Error;

    /// Sends `bytes`, blocking until they are handed to the hardware.
    fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Copies pending bytes into `buf` without blocking.
    fn receive(&mut self, buf: &mut [u8]) -> Result<Received, Self::Error>;
}

const LISTENING: u8 = 0;
const COMPLETE: u8 = 1;
const FAULT: u8 = 2;

/// Reception failed in the interrupt, the bytes received so far were dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LineFault;

/// Receive buffer shared between the UART interrupt and the poll loop.
///
/// While listening, the interrupt is the only writer: it appends bytes and
/// finally marks the line complete (idle line) or faulted. Once complete,
/// the poll loop is the only writer until [`take`](Self::take) has drained
/// the bytes and hands the line back to the interrupt.
pub struct RxLine<const N: usize> {
    buf: UnsafeCell<[u8; N]>,
    len: AtomicUsize,
    /// Bytes already handed to the poll loop, only touched while complete
    read: AtomicUsize,
    state: AtomicU8,
}

// Safety: the buffer has a single writer at any time, selected by `state`.
unsafe impl<const N: usize> Sync for RxLine<N> {}

impl<const N: usize> Default for RxLine<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RxLine<N> {
    pub const fn new() -> Self {
        Self {
            buf: UnsafeCell::new([0; N]),
            len: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
            state: AtomicU8::new(LISTENING),
        }
    }

    /// Interrupt side: appends a received byte.
    ///
    /// Returns `false` when the byte was dropped because the poll loop still
    /// owns the buffer. A full buffer faults the line.
    pub fn push(&self, byte: u8) -> bool {
        if self.state.load(Ordering::Acquire) != LISTENING {
            return false;
        }
        let len = self.len.load(Ordering::Relaxed);
        if len >= N {
            self.state.store(FAULT, Ordering::Release);
            return false;
        }
        // SAFETY: only the interrupt writes while listening
        unsafe { (*self.buf.get())[len] = byte };
        self.len.store(len + 1, Ordering::Release);
        true
    }

    /// Interrupt side: the line went idle, hand the bytes to the poll loop.
    pub fn complete(&self) {
        if self.len.load(Ordering::Relaxed) > 0 {
            let _ = self
                .state
                .compare_exchange(LISTENING, COMPLETE, Ordering::AcqRel, Ordering::Relaxed);
        }
    }

    /// Interrupt side: framing or overrun error reported by the UART.
    pub fn fail(&self) {
        self.state.store(FAULT, Ordering::Release);
    }

    /// Poll side: copies a completed reception into `out`.
    ///
    /// The line returns to listening once every byte was taken.
    pub fn take(&self, out: &mut [u8]) -> Result<Received, LineFault> {
        match self.state.load(Ordering::Acquire) {
            COMPLETE => {}
            FAULT => {
                self.reopen();
                return Err(LineFault);
            }
            _ => {
                return Ok(Received {
                    len: 0,
                    more: self.len.load(Ordering::Relaxed) > 0,
                })
            }
        }

        let len = self.len.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Relaxed);
        let n = out.len().min(len - read);
        // SAFETY: the interrupt does not write while the line is complete
        let buf = unsafe { &*self.buf.get() };
        out[..n].copy_from_slice(&buf[read..read + n]);

        if read + n == len {
            self.reopen();
            Ok(Received { len: n, more: false })
        } else {
            self.read.store(read + n, Ordering::Relaxed);
            Ok(Received { len: n, more: true })
        }
    }

    fn reopen(&self) {
        self.read.store(0, Ordering::Relaxed);
        self.len.store(0, Ordering::Relaxed);
        self.state.store(LISTENING, Ordering::Release);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SerialError<E> {
    Tx(E),
    Rx(LineFault),
}

/// [`Channel`] over an [`RxLine`] filled by the UART interrupt and a blocking writer.
pub struct SerialChannel<'a, TX, const N: usize> {
    line: &'a RxLine<N>,
    tx: TX,
}

impl<'a, TX, const N: usize> SerialChannel<'a, TX, N>
where
    TX: embedded_io::Write,
{
    pub fn new(line: &'a RxLine<N>, tx: TX) -> Self {
        Self { line, tx }
    }

    pub fn tx(&self) -> &TX {
        &self.tx
    }
}

impl<TX, const N: usize> Channel for SerialChannel<'_, TX, N>
where
    TX: embedded_io::Write,
{
    type Error = SerialError<TX::Error>;

    fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        self.tx.write_all(bytes).map_err(SerialError::Tx)?;
        self.tx.flush().map_err(SerialError::Tx)
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<Received, Self::Error> {
        self.line.take(buf).map_err(SerialError::Rx)
    }
}
