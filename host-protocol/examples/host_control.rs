// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use clap::{Parser, Subcommand};
use host_protocol::{validate_frame, DownloadType, FrameBuf, Message, HEADER_SIZE, MAX_DATA_SIZE};
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Erasing a whole partition can take a while on slow chips.
const ERASE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Subcommand)]
enum Command {
    /// Perform the handshake only
    Hello,
    /// Download a binary into a partition
    Download {
        #[arg(short = 'n', long)]
        partition: u8,
        file: PathBuf,
    },
    /// Show the header of a partition
    Info {
        #[arg(short = 'n', long)]
        partition: u8,
    },
    /// Install a partition into program flash and start it
    Boot {
        #[arg(short = 'n', long)]
        partition: u8,
    },
}

#[derive(Debug, Parser)]
struct Args {
    #[arg(short, long)]
    list_ports: bool,
    #[arg(short, long, default_value_t = String::from("/dev/ttyUSB0"))]
    port: String,
    #[arg(short, long, default_value_t = 115200)]
    baudrate: u32,
    #[command(subcommand)]
    cmd: Option<Command>,
}

struct Link {
    serial: SerialStream,
    tx: FrameBuf,
    rx: Vec<u8>,
}

impl Link {
    async fn send(&mut self, msg: Message<'_>) -> Result<(), Box<dyn Error>> {
        msg.encode(&mut self.tx).map_err(|e| e.to_string())?;
        log::debug!(">> {:?}", msg.command());
        self.serial.write_all(&self.tx).await?;
        self.serial.flush().await?;
        Ok(())
    }

    /// Sends the last frame again, as requested by a retransmit.
    async fn resend(&mut self) -> Result<(), Box<dyn Error>> {
        log::warn!("Device asked for a retransmit");
        self.serial.write_all(&self.tx).await?;
        self.serial.flush().await?;
        Ok(())
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Message<'_>, Box<dyn Error>> {
        self.rx.resize(HEADER_SIZE, 0);
        tokio::time::timeout(timeout, self.serial.read_exact(&mut self.rx))
            .await
            .map_err(|_| "No response from device")??;
        let len = u16::from_le_bytes([self.rx[2], self.rx[3]]) as usize;
        self.rx.resize(HEADER_SIZE + len, 0);
        tokio::time::timeout(timeout, self.serial.read_exact(&mut self.rx[HEADER_SIZE..]))
            .await
            .map_err(|_| "Truncated response from device")??;

        let frame = validate_frame(&self.rx).map_err(|e| e.to_string())?;
        let msg = Message::decode(&frame).map_err(|e| e.to_string())?;
        log::debug!("<< {:?}", msg.command());
        Ok(msg)
    }

    async fn handshake(&mut self) -> Result<(), Box<dyn Error>> {
        self.send(Message::HostHello).await?;
        loop {
            match self.recv(RESPONSE_TIMEOUT).await? {
                Message::Hello => return Ok(()),
                Message::Retransmit => self.resend().await?,
                other => return Err(unexpected(&other)),
            }
        }
    }

    async fn download(&mut self, partition: u8, image: &[u8]) -> Result<(), Box<dyn Error>> {
        let binary_size = u32::try_from(image.len())?;
        self.send(Message::DownloadRequest {
            partition,
            binary_size,
        })
        .await?;

        let block_size = loop {
            match self.recv(RESPONSE_TIMEOUT).await? {
                Message::DownloadParamRequest { kind, block_size } => {
                    println!("Device proposes {kind:?} blocks of {block_size} bytes");
                    break block_size;
                }
                Message::Retransmit => self.resend().await?,
                other => return Err(unexpected(&other)),
            }
        };
        if block_size == 0 || block_size as usize > MAX_DATA_SIZE {
            return Err(format!("Unusable block size {block_size}").into());
        }

        let chunks: Vec<&[u8]> = image.chunks(block_size as usize).collect();
        self.send(Message::DownloadParamResponse {
            kind: DownloadType::Raw,
            total_blocks: u32::try_from(chunks.len())?,
            block_size,
        })
        .await?;

        let mut timeout = ERASE_TIMEOUT;
        loop {
            let block = match self.recv(timeout).await? {
                Message::DownloadBlockRequest { block } => block,
                Message::End => {
                    println!("Download complete");
                    return Ok(());
                }
                Message::Retransmit => {
                    self.resend().await?;
                    continue;
                }
                other => return Err(unexpected(&other)),
            };
            timeout = RESPONSE_TIMEOUT;

            let data = chunks
                .get(block as usize)
                .ok_or_else(|| format!("Device requested block {block} out of range"))?;
            println!("Sending block [{}/{}]", block + 1, chunks.len());
            self.send(Message::DownloadBlockResponse { block, data }).await?;
        }
    }

    async fn info(&mut self, partition: u8) -> Result<(), Box<dyn Error>> {
        self.send(Message::PartitionInfoRequest { partition }).await?;
        loop {
            match self.recv(RESPONSE_TIMEOUT).await? {
                Message::PartitionInfoResponse(info) => {
                    println!("Partition {}", info.partition);
                    println!("- offset:     {:#08x}", info.offset);
                    println!("- capacity:   {} bytes", info.capacity);
                    println!("- image size: {} bytes", info.image_size);
                    println!("- complete:   {}", info.flags & 1 != 0);
                    return Ok(());
                }
                Message::Retransmit => self.resend().await?,
                other => return Err(unexpected(&other)),
            }
        }
    }

    async fn boot(&mut self, partition: u8) -> Result<(), Box<dyn Error>> {
        self.send(Message::BootApp { partition }).await?;
        loop {
            match self.recv(ERASE_TIMEOUT).await? {
                Message::End => {
                    println!("Application installed, device is booting");
                    return Ok(());
                }
                Message::Retransmit => self.resend().await?,
                other => return Err(unexpected(&other)),
            }
        }
    }
}

fn unexpected(msg: &Message<'_>) -> Box<dyn Error> {
    match msg {
        Message::Error { code, message } => format!("Device error {code:?}: {message}").into(),
        other => format!("Unexpected response {:?}", other.command()).into(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    pretty_env_logger::init();

    let args = Args::parse();

    if args.list_ports {
        let ports = tokio_serial::available_ports()?;
        println!("List of available serial ports:");
        for port in ports {
            println!("- {}", port.port_name);
        }
        return Ok(());
    }

    let Some(cmd) = args.cmd else {
        println!("Choose a command to be sent.");
        return Ok(());
    };

    let serial = tokio_serial::new(&args.port, args.baudrate).open_native_async()?;
    let mut link = Link {
        serial,
        tx: FrameBuf::new(),
        rx: Vec::new(),
    };
    link.handshake().await?;

    match cmd {
        Command::Hello => println!("Device answered hello"),
        Command::Download { partition, file } => {
            let image = std::fs::read(&file)?;
            println!("Downloading {} ({} bytes) into partition {partition}", file.display(), image.len());
            link.download(partition, &image).await?;
        }
        Command::Info { partition } => link.info(partition).await?,
        Command::Boot { partition } => link.boot(partition).await?,
    }

    Ok(())
}
