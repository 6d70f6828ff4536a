// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::config::Config;
use crate::error::{fault, FlashFault};
use embedded_storage::nor_flash::ReadNorFlash;

/// First two words of the application vector table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AppVectors {
    pub stack_pointer: u32,
    pub reset_vector: u32,
}

impl AppVectors {
    pub fn read<P: ReadNorFlash>(program: &mut P, config: &Config) -> Result<Self, FlashFault> {
        let mut words = [0u8; 8];
        program.read(config.app_offset, &mut words).map_err(fault)?;
        Ok(Self {
            stack_pointer: u32::from_le_bytes([words[0], words[1], words[2], words[3]]),
            reset_vector: u32::from_le_bytes([words[4], words[5], words[6], words[7]]),
        })
    }

    /// Stack pointer inside RAM and a Thumb reset vector inside the application region.
    pub fn is_valid(&self, config: &Config) -> bool {
        let sp_ok = self.stack_pointer > config.ram_start && self.stack_pointer <= config.ram_end;
        let entry = self.reset_vector & !1;
        let start = config.app_address();
        let rv_ok = self.reset_vector & 1 == 1 && entry >= start && entry - start < config.app_size;
        sp_ok && rv_ok
    }
}
