// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host to bootloader communication protocol.
//! The host PC drives the update over a serial link and the MCU bootloader answers.
//!
//! Every frame on the wire has the same layout:
//!
//! | offset | size | field                              |
//! |--------|------|------------------------------------|
//! | 0      | 1    | magic, always [`MAGIC`]            |
//! | 1      | 1    | command id, see [`Command`]        |
//! | 2      | 2    | payload length, little endian      |
//! | 4      | n    | payload                            |
//!
//! All multi-byte payload fields are little endian.

#![no_std]

use core::fmt;
use heapless::Vec;


/// First byte of every frame.
pub const MAGIC: u8 = 0xAA;

/// Magic, command id and the two length bytes.
pub const HEADER_SIZE: usize = 4;

/// Largest data chunk carried by a single block response.
pub const MAX_DATA_SIZE: usize = 4096;

/// Block number and data size preceding the data of a block response.
pub const BLOCK_PREFIX_SIZE: usize = 8;

/// Largest payload any command can carry.
pub const MAX_PAYLOAD_SIZE: usize = BLOCK_PREFIX_SIZE + MAX_DATA_SIZE;

/// Largest frame, header included.
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// Output buffer able to hold any frame.
pub type FrameBuf = Vec<u8, MAX_FRAME_SIZE>;

/// Command identifiers, in wire order.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    /// Target announces itself
    Hello = 0,
    /// Host answers the announcement
    HostHello = 1,
    /// Host asks to download an image into a partition
    DownloadRequest = 2,
    /// Target proposes transfer parameters
    DownloadParamRequest = 3,
    /// Host confirms the transfer parameters
    DownloadParamResponse = 4,
    /// Target asks for a block
    DownloadBlockRequest = 5,
    /// Host sends a block
    DownloadBlockResponse = 6,
    /// Terminal acknowledgement of a transfer or boot request
    End = 7,
    /// Host asks the target to install and start a partition
    BootApp = 8,
    /// Host asks for the state of a partition
    PartitionInfoRequest = 9,
    /// Target describes a partition
    PartitionInfoResponse = 10,
    /// Either side reports a failure
    Error = 11,
    /// Target asks the host to send its last frame again
    Retransmit = 12,
}

/// Accepted payload lengths of a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Shape {
    Fixed(usize),
    /// Prefix followed by exactly `data_size` bytes
    Block,
    /// Code byte, message text and a NUL terminator
    Error,
}

impl Command {
    pub fn from_u8(id: u8) -> Option<Self> {
        Some(match id {
            0 => Self::Hello,
            1 => Self::HostHello,
            2 => Self::DownloadRequest,
            3 => Self::DownloadParamRequest,
            4 => Self::DownloadParamResponse,
            5 => Self::DownloadBlockRequest,
            6 => Self::DownloadBlockResponse,
            7 => Self::End,
            8 => Self::BootApp,
            9 => Self::PartitionInfoRequest,
            10 => Self::PartitionInfoResponse,
            11 => Self::Error,
            12 => Self::Retransmit,
            _ => return None,
        })
    }

    fn shape(self) -> Shape {
        match self {
            Self::Hello | Self::HostHello | Self::End | Self::Retransmit => Shape::Fixed(0),
            Self::DownloadRequest | Self::DownloadParamRequest => Shape::Fixed(5),
            Self::DownloadParamResponse => Shape::Fixed(9),
            Self::DownloadBlockRequest => Shape::Fixed(4),
            Self::BootApp | Self::PartitionInfoRequest => Shape::Fixed(1),
            Self::PartitionInfoResponse => Shape::Fixed(17),
            Self::DownloadBlockResponse => Shape::Block,
            Self::Error => Shape::Error,
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self, Error> {
        Self::from_u8(id).ok_or(Error::UnknownCommand(id))
    }
}

/// Status codes carried by error frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorCode {
    Ok,
    /// Buffer or memory exhausted
    Mem,
    /// Unknown command or partition
    Unknown,
    /// Parameter out of range
    Param,
    /// Missing data
    Null,
    /// Size mismatch
    Size,
    /// Request not valid in the current state
    Invalid,
    /// Storage failure
    Fail,
    /// Code outside the known table
    Other(u8),
}

impl From<u8> for ErrorCode {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::Mem,
            2 => Self::Unknown,
            3 => Self::Param,
            4 => Self::Null,
            5 => Self::Size,
            6 => Self::Invalid,
            7 => Self::Fail,
            other => Self::Other(other),
        }
    }
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Ok => 0,
            ErrorCode::Mem => 1,
            ErrorCode::Unknown => 2,
            ErrorCode::Param => 3,
            ErrorCode::Null => 4,
            ErrorCode::Size => 5,
            ErrorCode::Invalid => 6,
            ErrorCode::Fail => 7,
            ErrorCode::Other(other) => other,
        }
    }
}

/// Image encoding negotiated for a download.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DownloadType {
    /// Plain image bytes
    Raw,
    /// Reserved for compressed images, stored as received
    Compressed,
    Reserved(u8),
}

impl From<u8> for DownloadType {
    fn from(kind: u8) -> Self {
        match kind {
            0 => Self::Raw,
            1 => Self::Compressed,
            other => Self::Reserved(other),
        }
    }
}

impl From<DownloadType> for u8 {
    fn from(kind: DownloadType) -> Self {
        match kind {
            DownloadType::Raw => 0,
            DownloadType::Compressed => 1,
            DownloadType::Reserved(other) => other,
        }
    }
}

/// Partition description returned by a partition info request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PartitionInfo {
    pub partition: u8,
    /// Byte offset of the partition in external flash
    pub offset: u32,
    pub capacity: u32,
    /// Size recorded in the header, zero when no header was written
    pub image_size: u32,
    pub flags: u32,
}

/// Failures found while building or validating a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Nothing was received
    Empty,
    /// Fewer bytes than the header or the declared payload need
    Truncated { len: usize },
    BadMagic(u8),
    UnknownCommand(u8),
    /// The payload length does not fit the command
    PayloadLength { command: Command, len: usize },
    /// Payload fields are inconsistent, e.g. a missing NUL terminator
    InvalidPayload,
    /// The frame does not fit the output buffer
    Capacity,
}

impl Error {
    /// Code reported back to the peer for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Empty => ErrorCode::Null,
            Error::Truncated { .. } | Error::PayloadLength { .. } => ErrorCode::Size,
            Error::BadMagic(_) | Error::InvalidPayload => ErrorCode::Invalid,
            Error::UnknownCommand(_) => ErrorCode::Unknown,
            Error::Capacity => ErrorCode::Mem,
        }
    }

    /// Short text carried in the error frame sent back to the peer.
    pub fn message(&self) -> &'static str {
        match self {
            Error::Empty => "Empty frame",
            Error::Truncated { .. } => "Truncated frame",
            Error::BadMagic(_) => "Bad magic",
            Error::UnknownCommand(_) => "Unknown command",
            Error::PayloadLength { .. } => "Invalid payload length",
            Error::InvalidPayload => "Invalid payload",
            Error::Capacity => "Frame too large",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Empty => write!(f, "Empty frame"),
            Error::Truncated { len } => write!(f, "Truncated frame of {len} bytes"),
            Error::BadMagic(magic) => write!(f, "Bad magic {magic:#04x}"),
            Error::UnknownCommand(id) => write!(f, "Unknown command {id}"),
            Error::PayloadLength { command, len } => {
                write!(f, "Invalid payload length {len} for {command:?}")
            }
            Error::InvalidPayload => write!(f, "Invalid payload"),
            Error::Capacity => write!(f, "Frame too large"),
        }
    }
}

/// A validated frame borrowing its payload from the receive buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    command: Command,
    payload: &'a [u8],
}

impl<'a> Frame<'a> {
    pub fn command(&self) -> Command {
        self.command
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Number of bytes the frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Total frame length announced by a header, once enough bytes are available.
pub fn declared_len(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < HEADER_SIZE {
        return None;
    }
    Some(HEADER_SIZE + u16::from_le_bytes([bytes[2], bytes[3]]) as usize)
}

/// Serializes `command` with `payload` into `out`, replacing its contents.
pub fn build_frame(command: Command, payload: &[u8], out: &mut FrameBuf) -> Result<(), Error> {
    build_frame_parts(command, &[payload], out)
}

fn build_frame_parts(command: Command, parts: &[&[u8]], out: &mut FrameBuf) -> Result<(), Error> {
    out.clear();
    let len: usize = parts.iter().map(|part| part.len()).sum();
    let len = u16::try_from(len).map_err(|_| Error::Capacity)?;
    out.push(MAGIC).map_err(|_| Error::Capacity)?;
    out.push(command as u8).map_err(|_| Error::Capacity)?;
    out.extend_from_slice(&len.to_le_bytes())
        .map_err(|_| Error::Capacity)?;
    for part in parts {
        if out.extend_from_slice(part).is_err() {
            out.clear();
            return Err(Error::Capacity);
        }
    }
    Ok(())
}

/// Checks framing and payload shape of `bytes`.
///
/// Bytes past the declared payload length are ignored.
pub fn validate_frame(bytes: &[u8]) -> Result<Frame<'_>, Error> {
    if bytes.is_empty() {
        return Err(Error::Empty);
    }
    let total = declared_len(bytes).ok_or(Error::Truncated { len: bytes.len() })?;
    if bytes[0] != MAGIC {
        return Err(Error::BadMagic(bytes[0]));
    }
    let command = Command::try_from(bytes[1])?;
    let payload = bytes
        .get(HEADER_SIZE..total)
        .ok_or(Error::Truncated { len: bytes.len() })?;

    let len = payload.len();
    match command.shape() {
        Shape::Fixed(expected) if len != expected => {
            return Err(Error::PayloadLength { command, len });
        }
        Shape::Fixed(_) => {}
        Shape::Block => {
            if len < BLOCK_PREFIX_SIZE {
                return Err(Error::PayloadLength { command, len });
            }
            let data_size = le_u32(payload, 4) as usize;
            if len - BLOCK_PREFIX_SIZE != data_size {
                return Err(Error::PayloadLength { command, len });
            }
        }
        Shape::Error => {
            if len < 2 {
                return Err(Error::PayloadLength { command, len });
            }
            if payload[len - 1] != 0 {
                return Err(Error::InvalidPayload);
            }
        }
    }

    Ok(Frame { command, payload })
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Typed view of every frame in the protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Message<'a> {
    Hello,
    HostHello,
    DownloadRequest {
        partition: u8,
        binary_size: u32,
    },
    /// Target proposal: encoding and block size
    DownloadParamRequest {
        kind: DownloadType,
        block_size: u32,
    },
    /// Host decision: encoding, number of blocks and block size
    DownloadParamResponse {
        kind: DownloadType,
        total_blocks: u32,
        block_size: u32,
    },
    DownloadBlockRequest {
        block: u32,
    },
    DownloadBlockResponse {
        block: u32,
        data: &'a [u8],
    },
    End,
    BootApp {
        partition: u8,
    },
    PartitionInfoRequest {
        partition: u8,
    },
    PartitionInfoResponse(PartitionInfo),
    Error {
        code: ErrorCode,
        message: &'a str,
    },
    Retransmit,
}

impl<'a> Message<'a> {
    pub fn command(&self) -> Command {
        match self {
            Message::Hello => Command::Hello,
            Message::HostHello => Command::HostHello,
            Message::DownloadRequest { .. } => Command::DownloadRequest,
            Message::DownloadParamRequest { .. } => Command::DownloadParamRequest,
            Message::DownloadParamResponse { .. } => Command::DownloadParamResponse,
            Message::DownloadBlockRequest { .. } => Command::DownloadBlockRequest,
            Message::DownloadBlockResponse { .. } => Command::DownloadBlockResponse,
            Message::End => Command::End,
            Message::BootApp { .. } => Command::BootApp,
            Message::PartitionInfoRequest { .. } => Command::PartitionInfoRequest,
            Message::PartitionInfoResponse(_) => Command::PartitionInfoResponse,
            Message::Error { .. } => Command::Error,
            Message::Retransmit => Command::Retransmit,
        }
    }

    /// Decodes the payload of a validated frame.
    pub fn decode(frame: &Frame<'a>) -> Result<Self, Error> {
        let p = frame.payload;
        Ok(match frame.command {
            Command::Hello => Message::Hello,
            Command::HostHello => Message::HostHello,
            Command::DownloadRequest => Message::DownloadRequest {
                partition: p[0],
                binary_size: le_u32(p, 1),
            },
            Command::DownloadParamRequest => Message::DownloadParamRequest {
                kind: p[0].into(),
                block_size: le_u32(p, 1),
            },
            Command::DownloadParamResponse => Message::DownloadParamResponse {
                kind: p[0].into(),
                total_blocks: le_u32(p, 1),
                block_size: le_u32(p, 5),
            },
            Command::DownloadBlockRequest => Message::DownloadBlockRequest { block: le_u32(p, 0) },
            Command::DownloadBlockResponse => Message::DownloadBlockResponse {
                block: le_u32(p, 0),
                data: &p[BLOCK_PREFIX_SIZE..],
            },
            Command::End => Message::End,
            Command::BootApp => Message::BootApp { partition: p[0] },
            Command::PartitionInfoRequest => Message::PartitionInfoRequest { partition: p[0] },
            Command::PartitionInfoResponse => Message::PartitionInfoResponse(PartitionInfo {
                partition: p[0],
                offset: le_u32(p, 1),
                capacity: le_u32(p, 5),
                image_size: le_u32(p, 9),
                flags: le_u32(p, 13),
            }),
            Command::Error => Message::Error {
                code: p[0].into(),
                message: core::str::from_utf8(&p[1..p.len() - 1])
                    .map_err(|_| Error::InvalidPayload)?,
            },
            Command::Retransmit => Message::Retransmit,
        })
    }

    /// Serializes the message into `out`, replacing its contents.
    pub fn encode(&self, out: &mut FrameBuf) -> Result<(), Error> {
        let command = self.command();
        match *self {
            Message::Hello | Message::HostHello | Message::End | Message::Retransmit => {
                build_frame(command, &[], out)
            }
            Message::DownloadRequest {
                partition,
                binary_size,
            } => build_frame_parts(command, &[&[partition], &binary_size.to_le_bytes()], out),
            Message::DownloadParamRequest { kind, block_size } => {
                build_frame_parts(command, &[&[u8::from(kind)], &block_size.to_le_bytes()], out)
            }
            Message::DownloadParamResponse {
                kind,
                total_blocks,
                block_size,
            } => build_frame_parts(
                command,
                &[
                    &[u8::from(kind)],
                    &total_blocks.to_le_bytes(),
                    &block_size.to_le_bytes(),
                ],
                out,
            ),
            Message::DownloadBlockRequest { block } => {
                build_frame(command, &block.to_le_bytes(), out)
            }
            Message::DownloadBlockResponse { block, data } => {
                let data_size = u32::try_from(data.len()).map_err(|_| Error::Capacity)?;
                build_frame_parts(
                    command,
                    &[&block.to_le_bytes(), &data_size.to_le_bytes(), data],
                    out,
                )
            }
            Message::BootApp { partition } | Message::PartitionInfoRequest { partition } => {
                build_frame(command, &[partition], out)
            }
            Message::PartitionInfoResponse(info) => build_frame_parts(
                command,
                &[
                    &[info.partition],
                    &info.offset.to_le_bytes(),
                    &info.capacity.to_le_bytes(),
                    &info.image_size.to_le_bytes(),
                    &info.flags.to_le_bytes(),
                ],
                out,
            ),
            Message::Error { code, message } => {
                build_frame_parts(command, &[&[u8::from(code)], message.as_bytes(), &[0]], out)
            }
        }
    }
}
