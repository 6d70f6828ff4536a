// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::partition::{Partition, DEFAULT_PARTITIONS};
use consts::{APP_OFFSET, APP_SIZE, DEFAULT_BLOCK_SIZE, FRAME_TIMEOUT_MS, PROGRAM_FLASH_BASE, RAM_END, RAM_START};
use embassy_time::Duration;

/// Board description used by the bootloader at runtime.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    pub partitions: &'static [Partition],
    /// Block size proposed to the host
    pub block_size: u32,
    /// Inactivity window of a partially received frame
    pub frame_timeout: Duration,
    /// Address of program flash in the MCU address space
    pub program_base: u32,
    /// Application region, as an offset into program flash
    pub app_offset: u32,
    pub app_size: u32,
    /// Valid initial stack pointers lie in `ram_start + 1..=ram_end`
    pub ram_start: u32,
    pub ram_end: u32,
}

impl Config {
    /// Address of the application vector table.
    pub fn app_address(&self) -> u32 {
        self.program_base + self.app_offset
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            partitions: &DEFAULT_PARTITIONS,
            block_size: DEFAULT_BLOCK_SIZE,
            frame_timeout: Duration::from_millis(FRAME_TIMEOUT_MS),
            program_base: PROGRAM_FLASH_BASE,
            app_offset: APP_OFFSET,
            app_size: APP_SIZE,
            ram_start: RAM_START,
            ram_end: RAM_END,
        }
    }
}
