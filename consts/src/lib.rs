// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

#![no_std]

/// Size of one external flash partition (320 KiB).
/// Every partition starts with a header reservation followed by the image.
pub const PARTITION_SIZE: u32 = 0x50000;

/// Partition table of the external SPI flash as `(id, offset, capacity)`.
/// Three equally sized slots fill the first 960 KiB of the chip.
pub const PARTITIONS: [(u8, u32, u32); 3] = [
    (0, 0x00000, PARTITION_SIZE),
    (1, 0x50000, PARTITION_SIZE),
    (2, 0xA0000, PARTITION_SIZE),
];

/// Bytes reserved at the start of each partition for the partition header.
/// Image data is stored right after this reservation.
pub const PARTITION_HEADER_RESERVED: u32 = 256;

/// Sentinel stored in the first two bytes of a written partition.
pub const PARTITION_MAGIC: u16 = 0x2609;

/// Block size proposed to the host in a download parameter request.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Largest block the bootloader accepts in a single download block response.
pub const MAX_BLOCK_SIZE: u32 = 4096;

/// Size of the receive buffer shared with the UART interrupt.
pub const RX_BUFFER_SIZE: usize = 5120;

/// Inactivity window for a partially received frame before a retransmit is requested.
pub const FRAME_TIMEOUT_MS: u64 = 500;

/// Base address of the internal program flash in the MCU address space.
pub const PROGRAM_FLASH_BASE: u32 = 0x0800_0000;

/// Offset of the application region inside internal program flash.
/// On the STM32F4 reference board this is sector 8 (0x0808_0000).
pub const APP_OFFSET: u32 = 0x80000;

/// Size of the application region (sectors 8 to 11, 4 x 128 KiB).
pub const APP_SIZE: u32 = 0x80000;

/// On-chip RAM window used to sanity check an application's initial stack pointer.
pub const RAM_START: u32 = 0x2000_0000;
pub const RAM_END: u32 = 0x2002_0000;

/// SPI NOR geometry (W25Q64JV class devices).
pub const FLASH_PAGE_SIZE: u32 = 256;
pub const FLASH_SECTOR_SIZE: u32 = 4 * 1024;
pub const FLASH_BLOCK32_SIZE: u32 = 32 * 1024;
pub const FLASH_BLOCK64_SIZE: u32 = 64 * 1024;

/// Worst case operation times taken from the W25Q64JV datasheet, in milliseconds.
pub const FLASH_WRITE_ENABLE_TIMEOUT_MS: u64 = 15;
pub const FLASH_PAGE_PROGRAM_TIMEOUT_MS: u64 = 3;
pub const FLASH_SECTOR_ERASE_TIMEOUT_MS: u64 = 400;
pub const FLASH_BLOCK32_ERASE_TIMEOUT_MS: u64 = 1600;
pub const FLASH_BLOCK64_ERASE_TIMEOUT_MS: u64 = 2000;
pub const FLASH_CHIP_ERASE_TIMEOUT_MS: u64 = 100 * 1000;

/// Upper bound for the power-on reset loop of the flash driver.
pub const FLASH_POWER_ON_TIMEOUT_MS: u64 = 100;

/// Pause after a software reset; the chip needs 30us, 1ms is the smallest delay we issue.
pub const FLASH_RESET_DELAY_MS: u32 = 1;
