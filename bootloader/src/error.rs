// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use core::fmt;
use embedded_storage::nor_flash::{NorFlashError, NorFlashErrorKind};
use host_protocol::{DownloadType, ErrorCode};

/// Flash failure reduced to what the storage traits expose.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashFault {
    NotAligned,
    OutOfBounds,
    Other,
}

impl From<NorFlashErrorKind> for FlashFault {
    fn from(kind: NorFlashErrorKind) -> Self {
        match kind {
            NorFlashErrorKind::NotAligned => FlashFault::NotAligned,
            NorFlashErrorKind::OutOfBounds => FlashFault::OutOfBounds,
            _ => FlashFault::Other,
        }
    }
}

pub(crate) fn fault<E: NorFlashError>(e: E) -> FlashFault {
    e.kind().into()
}

/// Request failures, reported to the host as error frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    HandshakeRequired,
    UnknownPartition,
    ImageTooLarge,
    EmptyImage,
    NoDownload,
    UnsupportedType(DownloadType),
    InvalidParameters,
    UnexpectedBlock { expected: u32, received: u32 },
    BlockSize,
    ImageOverflow,
    SizeMismatch,
    Erase(FlashFault),
    PrepareHeader(FlashFault),
    Write(FlashFault),
    UpdateHeader(FlashFault),
    /// Boot requested for an id missing from the table
    NoPartition,
    ReadPartition(FlashFault),
    InvalidPartition,
    IncompletePartition,
    AppTooLarge,
    ProgramErase(FlashFault),
    Program(FlashFault),
    Verify,
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::UnknownPartition => ErrorCode::Unknown,
            Error::ImageTooLarge
            | Error::EmptyImage
            | Error::BlockSize
            | Error::ImageOverflow
            | Error::SizeMismatch
            | Error::AppTooLarge => ErrorCode::Size,
            Error::UnsupportedType(_) | Error::InvalidParameters | Error::UnexpectedBlock { .. } => ErrorCode::Param,
            Error::HandshakeRequired
            | Error::NoDownload
            | Error::NoPartition
            | Error::ReadPartition(_)
            | Error::InvalidPartition
            | Error::IncompletePartition => ErrorCode::Invalid,
            Error::Erase(_)
            | Error::PrepareHeader(_)
            | Error::Write(_)
            | Error::UpdateHeader(_)
            | Error::ProgramErase(_)
            | Error::Program(_)
            | Error::Verify => ErrorCode::Fail,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Error::HandshakeRequired => "Host hello required",
            Error::UnknownPartition => "Not declared partition",
            Error::ImageTooLarge => "File does not fit in partition",
            Error::EmptyImage => "Empty image",
            Error::NoDownload => "No download in progress",
            Error::UnsupportedType(_) => "Unsupported download type",
            Error::InvalidParameters => "Invalid download parameters",
            Error::UnexpectedBlock { .. } => "Unexpected block number",
            Error::BlockSize => "Invalid block size",
            Error::ImageOverflow => "Block exceeds image size",
            Error::SizeMismatch => "Image size mismatch",
            Error::Erase(_) => "Error erasing partition",
            Error::PrepareHeader(_) => "Error preparing partition header",
            Error::Write(_) => "Error writing into flash",
            Error::UpdateHeader(_) => "Error updating partition header",
            Error::NoPartition => "Partition does not exist",
            Error::ReadPartition(_) => "Error reading SPI flash",
            Error::InvalidPartition => "Invalid partition requested",
            Error::IncompletePartition => "Incomplete partition requested",
            Error::AppTooLarge => "Image does not fit in application region",
            Error::ProgramErase(_) => "Can not erase MCU application partition",
            Error::Program(_) => "Error programming MCU flash",
            Error::Verify => "MCU flash verification failed",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnexpectedBlock { expected, received } => {
                write!(f, "{}: expected {expected}, received {received}", self.message())
            }
            _ => f.write_str(self.message()),
        }
    }
}
