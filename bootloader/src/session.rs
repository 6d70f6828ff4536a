// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Download and boot session driven by host requests.

use crate::config::Config;
use crate::error::{fault, Error, FlashFault};
use crate::partition::{self, Partition, PartitionHeader};
use consts::MAX_BLOCK_SIZE;
use embedded_storage::nor_flash::NorFlash;
use host_protocol::{Command, DownloadType, Message, PartitionInfo};

/// Program flash is copied in chunks of this size.
const COPY_CHUNK: usize = 256;

/// Largest write granularity supported when padding a short write.
const MAX_WRITE_SIZE: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    Disable,
    /// Waiting for the host handshake
    Init,
    Ready,
    /// Application installed, jump on the next tick
    Boot,
    /// No valid application, nothing left to do
    Halted,
}

/// Transfer state of an accepted download.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Transfer {
    pub partition: Partition,
    pub total_size: u32,
    pub block_size: u32,
    pub total_blocks: u32,
    /// Next block expected from the host
    pub next_block: u32,
    pub bytes_written: u32,
    pub kind: DownloadType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Download {
    /// Requested, waiting for the host to confirm the parameters
    Pending { partition: Partition, size: u32 },
    Active(Transfer),
}

pub struct Session {
    state: State,
    download: Option<Download>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub const fn new() -> Self {
        Self {
            state: State::Disable,
            download: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Active transfer, once the parameters were negotiated.
    pub fn transfer(&self) -> Option<&Transfer> {
        match &self.download {
            Some(Download::Active(transfer)) => Some(transfer),
            _ => None,
        }
    }

    pub fn has_download(&self) -> bool {
        self.download.is_some()
    }

    pub fn init(&mut self) {
        if self.state == State::Disable {
            self.enter(State::Init);
        }
    }

    pub(crate) fn halt(&mut self) {
        self.download = None;
        self.enter(State::Halted);
    }

    fn enter(&mut self, state: State) {
        debug!("Session {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Handles one request from the host, returning the reply to send.
    ///
    /// Errors are reported to the host as error frames by the caller.
    pub fn handle<F, P>(
        &mut self,
        config: &Config,
        msg: &Message<'_>,
        flash: &mut F,
        program: &mut P,
    ) -> Result<Option<Message<'static>>, Error>
    where
        F: NorFlash,
        P: NorFlash,
    {
        let command = msg.command();
        if !matches!(self.state, State::Init | State::Ready) {
            debug!("Ignoring {:?} in state {:?}", command, self.state);
            return Ok(None);
        }
        if !is_request(command) {
            warn!("Unexpected {:?} from host", command);
            return Ok(None);
        }

        match *msg {
            Message::HostHello => {
                if self.download.take().is_some() {
                    info!("Handshake restarted, dropping download");
                }
                self.enter(State::Ready);
                Ok(Some(Message::Hello))
            }
            _ if self.state == State::Init => Err(Error::HandshakeRequired),
            Message::DownloadRequest {
                partition,
                binary_size,
            } => self.request_download(config, partition, binary_size),
            Message::DownloadParamResponse {
                kind,
                total_blocks,
                block_size,
            } => self.start_download::<F>(kind, total_blocks, block_size, flash),
            Message::DownloadBlockResponse { block, data } => self.write_block(block, data, flash),
            Message::BootApp { partition } => self.install(config, partition, flash, program),
            Message::PartitionInfoRequest { partition } => partition_info(config, partition, flash).map(Some),
            _ => Ok(None),
        }
    }

    fn request_download(&mut self, config: &Config, id: u8, size: u32) -> Result<Option<Message<'static>>, Error> {
        if self.download.take().is_some() {
            info!("Previous download superseded");
        }
        let partition = *partition::find(config.partitions, id).ok_or(Error::UnknownPartition)?;
        if size == 0 {
            return Err(Error::EmptyImage);
        }
        if size > partition.max_image_size() {
            return Err(Error::ImageTooLarge);
        }

        info!("Download of {} bytes into partition {}", size, id);
        self.download = Some(Download::Pending { partition, size });
        Ok(Some(Message::DownloadParamRequest {
            kind: DownloadType::Raw,
            block_size: config.block_size,
        }))
    }

    fn start_download<F: NorFlash>(
        &mut self,
        kind: DownloadType,
        total_blocks: u32,
        block_size: u32,
        flash: &mut F,
    ) -> Result<Option<Message<'static>>, Error> {
        let Some(Download::Pending { partition, size }) = self.download else {
            return Err(Error::NoDownload);
        };
        if kind != DownloadType::Raw {
            return Err(Error::UnsupportedType(kind));
        }
        if block_size == 0
            || block_size > MAX_BLOCK_SIZE
            || block_size as usize % F::WRITE_SIZE != 0
            || total_blocks != size.div_ceil(block_size)
        {
            return Err(Error::InvalidParameters);
        }

        // From here on a failure drops the download.
        self.download = None;
        flash
            .erase(partition.offset, partition.offset + partition.capacity)
            .map_err(|e| Error::Erase(fault(e)))?;
        write_padded(flash, partition.offset, &PartitionHeader::new(size).encode()).map_err(Error::PrepareHeader)?;

        info!("Partition {} prepared, {} blocks of {} bytes", partition.id, total_blocks, block_size);
        self.download = Some(Download::Active(Transfer {
            partition,
            total_size: size,
            block_size,
            total_blocks,
            next_block: 0,
            bytes_written: 0,
            kind,
        }));
        Ok(Some(Message::DownloadBlockRequest { block: 0 }))
    }

    fn write_block<F: NorFlash>(
        &mut self,
        block: u32,
        data: &[u8],
        flash: &mut F,
    ) -> Result<Option<Message<'static>>, Error> {
        let Some(Download::Active(transfer)) = &mut self.download else {
            return Err(Error::NoDownload);
        };

        if block < transfer.next_block {
            debug!("Block {} replayed, requesting {}", block, transfer.next_block);
            return Ok(Some(Message::DownloadBlockRequest {
                block: transfer.next_block,
            }));
        }
        if block > transfer.next_block {
            return Err(Error::UnexpectedBlock {
                expected: transfer.next_block,
                received: block,
            });
        }

        let last = block + 1 == transfer.total_blocks;
        let len = data.len() as u32;
        if len == 0 || len > transfer.block_size || (!last && len != transfer.block_size) {
            return Err(Error::BlockSize);
        }
        let written = transfer.bytes_written + len;
        if written > transfer.total_size {
            return Err(Error::ImageOverflow);
        }
        if last && written != transfer.total_size {
            self.download = None;
            return Err(Error::SizeMismatch);
        }

        let offset = transfer.partition.data_offset() + transfer.bytes_written;
        write_padded(flash, offset, data).map_err(Error::Write)?;
        transfer.next_block += 1;
        transfer.bytes_written = written;
        info!("Block [{}/{}] written", transfer.next_block, transfer.total_blocks);

        if !last {
            return Ok(Some(Message::DownloadBlockRequest {
                block: transfer.next_block,
            }));
        }

        let partition = transfer.partition;
        let header = PartitionHeader::new(transfer.total_size).completed();
        self.download = None;
        write_padded(flash, partition.offset, &header.encode()).map_err(Error::UpdateHeader)?;
        info!("Partition {} complete", partition.id);
        Ok(Some(Message::End))
    }

    /// Copies a completed partition into the application region of program flash.
    ///
    /// A failure midway leaves the region partially written; a later boot
    /// request erases it again.
    fn install<F, P>(
        &mut self,
        config: &Config,
        id: u8,
        flash: &mut F,
        program: &mut P,
    ) -> Result<Option<Message<'static>>, Error>
    where
        F: NorFlash,
        P: NorFlash,
    {
        let partition = *partition::find(config.partitions, id).ok_or(Error::NoPartition)?;
        let header = read_header(flash, &partition)
            .map_err(Error::ReadPartition)?
            .ok_or(Error::InvalidPartition)?;
        if !header.is_complete() {
            return Err(Error::IncompletePartition);
        }
        if header.size > partition.max_image_size() {
            return Err(Error::InvalidPartition);
        }
        if header.size > config.app_size {
            return Err(Error::AppTooLarge);
        }

        info!("Installing partition {} ({} bytes)", id, header.size);
        program
            .erase(config.app_offset, config.app_offset + config.app_size)
            .map_err(|e| Error::ProgramErase(fault(e)))?;

        let mut chunk = [0u8; COPY_CHUNK];
        let mut check = [0u8; COPY_CHUNK];
        let mut copied = 0;
        while copied < header.size {
            let len = (header.size - copied).min(COPY_CHUNK as u32) as usize;
            let padded = len.next_multiple_of(P::WRITE_SIZE);
            if padded > COPY_CHUNK {
                return Err(Error::Program(FlashFault::NotAligned));
            }

            flash
                .read(partition.data_offset() + copied, &mut chunk[..len])
                .map_err(|e| Error::ReadPartition(fault(e)))?;
            chunk[len..padded].fill(0xFF);

            let address = config.app_offset + copied;
            program
                .write(address, &chunk[..padded])
                .map_err(|e| Error::Program(fault(e)))?;
            program
                .read(address, &mut check[..padded])
                .map_err(|e| Error::Program(fault(e)))?;
            if check[..padded] != chunk[..padded] {
                error!("Program flash mismatch at {:#x}", address);
                return Err(Error::Verify);
            }
            copied += len as u32;
        }

        info!("Application installed");
        self.download = None;
        self.enter(State::Boot);
        Ok(Some(Message::End))
    }
}

/// Commands a host may send to the bootloader.
fn is_request(command: Command) -> bool {
    matches!(
        command,
        Command::HostHello
            | Command::DownloadRequest
            | Command::DownloadParamResponse
            | Command::DownloadBlockResponse
            | Command::BootApp
            | Command::PartitionInfoRequest
    )
}

fn partition_info<F: NorFlash>(config: &Config, id: u8, flash: &mut F) -> Result<Message<'static>, Error> {
    let partition = *partition::find(config.partitions, id).ok_or(Error::UnknownPartition)?;
    let header = read_header(flash, &partition).map_err(Error::ReadPartition)?;
    let (image_size, flags) = header.map_or((0, 0), |h| (h.size, h.flags.bits()));
    Ok(Message::PartitionInfoResponse(PartitionInfo {
        partition: partition.id,
        offset: partition.offset,
        capacity: partition.capacity,
        image_size,
        flags,
    }))
}

fn read_header<F: NorFlash>(flash: &mut F, partition: &Partition) -> Result<Option<PartitionHeader>, FlashFault> {
    let mut bytes = [0u8; PartitionHeader::SIZE];
    flash.read(partition.offset, &mut bytes).map_err(fault)?;
    Ok(PartitionHeader::decode(&bytes))
}

/// Writes `data`, padding the tail with erased bytes up to the write granularity.
fn write_padded<F: NorFlash>(flash: &mut F, offset: u32, data: &[u8]) -> Result<(), FlashFault> {
    let (body, tail) = data.split_at(data.len() - data.len() % F::WRITE_SIZE);
    if !body.is_empty() {
        flash.write(offset, body).map_err(fault)?;
    }
    if !tail.is_empty() {
        if F::WRITE_SIZE > MAX_WRITE_SIZE {
            return Err(FlashFault::NotAligned);
        }
        let mut padded = [0xFF; MAX_WRITE_SIZE];
        padded[..tail.len()].copy_from_slice(tail);
        flash
            .write(offset + body.len() as u32, &padded[..F::WRITE_SIZE])
            .map_err(fault)?;
    }
    Ok(())
}
