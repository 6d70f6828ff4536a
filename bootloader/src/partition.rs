// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! External flash partitions and the header stored at the start of each one.
//!
//! Header layout, little endian:
//!
//! | offset | size | field                    |
//! |--------|------|--------------------------|
//! | 0      | 2    | [`PARTITION_MAGIC`]      |
//! | 2      | 4    | image size in bytes      |
//! | 6      | 4    | flags, stored inverted   |
//!
//! NOR programming can only clear bits, so the flags word is stored
//! active-low: a freshly written header leaves it erased and completing the
//! download clears the `COMPLETE` bit in place.

use bitflags::bitflags;
use consts::{PARTITIONS, PARTITION_HEADER_RESERVED, PARTITION_MAGIC};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Partition {
    pub id: u8,
    /// Byte offset in external flash
    pub offset: u32,
    pub capacity: u32,
}

impl Partition {
    pub const fn new(id: u8, offset: u32, capacity: u32) -> Self {
        Self { id, offset, capacity }
    }

    /// Where image data starts, right after the header reservation.
    pub fn data_offset(&self) -> u32 {
        self.offset + PARTITION_HEADER_RESERVED
    }

    /// Largest image the partition can hold.
    pub fn max_image_size(&self) -> u32 {
        self.capacity.saturating_sub(PARTITION_HEADER_RESERVED)
    }
}

/// Partition table built from the board constants.
pub static DEFAULT_PARTITIONS: [Partition; PARTITIONS.len()] = {
    let mut table = [Partition::new(0, 0, 0); PARTITIONS.len()];
    let mut i = 0;
    while i < PARTITIONS.len() {
        let (id, offset, capacity) = PARTITIONS[i];
        table[i] = Partition::new(id, offset, capacity);
        i += 1;
    }
    table
};

/// Looks a partition up by id. The first matching entry wins.
pub fn find(table: &[Partition], id: u8) -> Option<&Partition> {
    table.iter().find(|partition| partition.id == id)
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PartitionFlags: u32 {
        /// Every block of the image was written
        const COMPLETE = 1 << 0;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartitionHeader {
    /// Declared image size
    pub size: u32,
    pub flags: PartitionFlags,
}

impl PartitionHeader {
    pub const SIZE: usize = 10;

    pub fn new(size: u32) -> Self {
        Self {
            size,
            flags: PartitionFlags::empty(),
        }
    }

    pub fn completed(self) -> Self {
        Self {
            flags: self.flags | PartitionFlags::COMPLETE,
            ..self
        }
    }

    pub fn is_complete(&self) -> bool {
        self.flags.contains(PartitionFlags::COMPLETE)
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..2].copy_from_slice(&PARTITION_MAGIC.to_le_bytes());
        bytes[2..6].copy_from_slice(&self.size.to_le_bytes());
        bytes[6..10].copy_from_slice(&(!self.flags.bits()).to_le_bytes());
        bytes
    }

    /// Parses a stored header, `None` when the sentinel does not match.
    pub fn decode(bytes: &[u8; Self::SIZE]) -> Option<Self> {
        if u16::from_le_bytes([bytes[0], bytes[1]]) != PARTITION_MAGIC {
            return None;
        }
        let size = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        let stored = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        Some(Self {
            size,
            flags: PartitionFlags::from_bits_retain(!stored),
        })
    }
}
