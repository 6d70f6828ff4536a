// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Accumulates channel reads into complete frames.

use crate::transport::Channel;
use embassy_time::{Duration, Instant};
use heapless::Vec;
use host_protocol::declared_len;

pub struct Reassembler<const N: usize> {
    buf: Vec<u8, N>,
    timeout: Duration,
    /// Armed by the first byte of an incomplete frame
    deadline: Option<Instant>,
}

impl<const N: usize> Reassembler<N> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            buf: Vec::new(),
            timeout,
            deadline: None,
        }
    }

    /// Appends `bytes` received at `now`.
    pub fn feed(&mut self, bytes: &[u8], now: Instant) {
        if bytes.is_empty() {
            return;
        }
        let was_empty = self.buf.is_empty();
        if self.buf.extend_from_slice(bytes).is_err() {
            warn!("Receive buffer overflow, dropping {} bytes", self.buf.len() + bytes.len());
            self.clear();
            return;
        }
        self.appended(was_empty, now);
    }

    /// Receives straight from `channel` into the free part of the buffer.
    pub fn receive<CH: Channel>(&mut self, channel: &mut CH, now: Instant) -> Result<usize, CH::Error> {
        let start = self.buf.len();
        // Filling spare capacity cannot fail.
        let _ = self.buf.resize(N, 0);
        let received = channel.receive(&mut self.buf[start..]);
        let len = received.as_ref().map_or(0, |r| r.len);
        self.buf.truncate(start + len);
        received?;

        if len > 0 {
            self.appended(start == 0, now);
        }
        Ok(len)
    }

    fn appended(&mut self, was_empty: bool, now: Instant) {
        if was_empty {
            self.deadline = Some(now + self.timeout);
        }
        match declared_len(&self.buf) {
            Some(len) if len > N => {
                warn!("Frame of {} bytes exceeds receive buffer", len);
                self.clear();
            }
            Some(len) if self.buf.len() >= len => self.deadline = None,
            _ => {}
        }
    }

    /// A whole frame, as announced by its header, has been received.
    pub fn is_frame_complete(&self) -> bool {
        declared_len(&self.buf).is_some_and(|len| self.buf.len() >= len)
    }

    pub fn frame(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.deadline = None;
    }

    /// Checks the inactivity timer.
    ///
    /// On expiry the partial frame is dropped and the timer restarts, so an
    /// unresponsive host gets asked again once per timeout period.
    pub fn expired(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now > deadline => {
                self.buf.clear();
                self.deadline = Some(now + self.timeout);
                true
            }
            _ => false,
        }
    }
}
