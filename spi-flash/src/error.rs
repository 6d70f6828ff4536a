// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use core::fmt;
use embedded_storage::nor_flash::{NorFlashError, NorFlashErrorKind};

/// Driver failures. `E` is the error of the underlying SPI device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error<E> {
    /// SPI transfer failed
    Spi(E),
    /// Busy or write enable latch did not settle in time
    Timeout,
    /// Called before [`init`](crate::SpiNorFlash::init) completed
    NotReady,
    /// A previous operation failed, the chip needs to be initialized again
    Faulted,
    /// Range exceeds the chip capacity
    OutOfBounds,
    /// Erase range is not sector aligned
    NotAligned,
    /// JEDEC identity reports an unusable capacity
    InvalidIdentity,
}

impl<E> Error<E> {
    /// True for failures of the transfer itself, as opposed to device timeouts or bad requests.
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Spi(_))
    }
}

impl<E: fmt::Debug> NorFlashError for Error<E> {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            Error::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            Error::NotAligned => NorFlashErrorKind::NotAligned,
            _ => NorFlashErrorKind::Other,
        }
    }
}

impl<E: fmt::Debug> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Spi(e) => write!(f, "SPI transfer failed: {e:?}"),
            Error::Timeout => write!(f, "Flash operation timed out"),
            Error::NotReady => write!(f, "Flash not initialized"),
            Error::Faulted => write!(f, "Flash faulted, reinitialization required"),
            Error::OutOfBounds => write!(f, "Address out of bounds"),
            Error::NotAligned => write!(f, "Address not aligned"),
            Error::InvalidIdentity => write!(f, "Invalid JEDEC identity"),
        }
    }
}
