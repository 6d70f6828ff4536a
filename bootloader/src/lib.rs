// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Serial driven bootloader.
//!
//! The host uploads an image into one of the external flash partitions, then
//! asks the bootloader to install a completed partition into program flash
//! and start it. Everything runs from [`Bootloader::tick`], called in a loop
//! by the board:
//!
//! ```ignore
//! let mut bootloader = Bootloader::new(Config::default(), channel, flash, program, SystemClock);
//! bootloader.init();
//! loop {
//!     if let Poll::Boot { vector_table, vectors } = bootloader.tick() {
//!         unsafe { jump_app::jump_to_app(vector_table, vectors) }
//!     }
//! }
//! ```

#![no_std]

mod fmt;

pub mod boot;
pub mod config;
pub mod error;
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod jump_app;
pub mod partition;
pub mod reassembly;
pub mod session;
pub mod transport;

pub use boot::AppVectors;
pub use config::Config;
pub use error::{Error, FlashFault};
pub use partition::{Partition, PartitionFlags, PartitionHeader};
pub use reassembly::Reassembler;
pub use session::{Session, State, Transfer};
pub use spi_flash::Clock;
pub use transport::{Channel, Received, RxLine, SerialChannel, SerialError};

use consts::RX_BUFFER_SIZE;
use embedded_storage::nor_flash::NorFlash;
use host_protocol::{validate_frame, Command, FrameBuf, Message};

/// Outcome of one [`Bootloader::tick`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Poll {
    /// Nothing was sent
    Idle,
    /// A frame went out to the host
    Sent(Command),
    /// The application is installed and valid, the caller jumps to it
    Boot { vector_table: u32, vectors: AppVectors },
    /// No valid application, the bootloader stopped serving the host
    Halted,
}

pub struct Bootloader<CH, F, P, C> {
    config: Config,
    channel: CH,
    /// External flash holding the partitions
    flash: F,
    /// MCU program flash, addressed from its base
    program: P,
    clock: C,
    rx: Reassembler<RX_BUFFER_SIZE>,
    session: Session,
    tx: FrameBuf,
}

impl<CH, F, P, C> Bootloader<CH, F, P, C>
where
    CH: Channel,
    F: NorFlash,
    P: NorFlash,
    C: Clock,
{
    pub fn new(config: Config, channel: CH, flash: F, program: P, clock: C) -> Self {
        Self {
            rx: Reassembler::new(config.frame_timeout),
            config,
            channel,
            flash,
            program,
            clock,
            session: Session::new(),
            tx: FrameBuf::new(),
        }
    }

    /// Starts listening for the host handshake.
    pub fn init(&mut self) {
        self.session.init();
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn channel(&self) -> &CH {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut CH {
        &mut self.channel
    }

    pub fn flash(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn program(&mut self) -> &mut P {
        &mut self.program
    }

    /// Runs one iteration of the poll loop.
    ///
    /// Receives whatever the channel has pending and handles at most one
    /// complete frame. A partial frame left idle for longer than the frame
    /// timeout is dropped and the host is asked to retransmit.
    pub fn tick(&mut self) -> Poll {
        match self.session.state() {
            State::Disable => return Poll::Idle,
            State::Halted => return Poll::Halted,
            State::Boot => return self.start_app(),
            State::Init | State::Ready => {}
        }

        let now = self.clock.now();
        if self.rx.receive(&mut self.channel, now).is_err() {
            warn!("Channel receive failed");
        }

        if self.rx.is_frame_complete() {
            let reply = self.dispatch();
            self.rx.clear();
            return match reply {
                Some(msg) => self.send(&msg),
                None => Poll::Idle,
            };
        }

        if self.rx.expired(now) {
            debug!("Frame timeout, requesting retransmit");
            return self.send(&Message::Retransmit);
        }
        Poll::Idle
    }

    /// Handles the frame held by the reassembler.
    fn dispatch(&mut self) -> Option<Message<'static>> {
        let msg = match validate_frame(self.rx.frame()).and_then(|frame| Message::decode(&frame)) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Invalid frame: {:?}", e);
                return Some(Message::Error {
                    code: e.code(),
                    message: e.message(),
                });
            }
        };

        let command = msg.command();
        debug!("Received {:?}", command);
        match self
            .session
            .handle(&self.config, &msg, &mut self.flash, &mut self.program)
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!("{:?} rejected: {:?}", command, e);
                Some(Message::Error {
                    code: e.code(),
                    message: e.message(),
                })
            }
        }
    }

    fn send(&mut self, msg: &Message<'_>) -> Poll {
        let command = msg.command();
        if let Err(e) = msg.encode(&mut self.tx) {
            error!("Cannot build {:?}: {:?}", command, e);
            return Poll::Idle;
        }
        if self.channel.send(&self.tx).is_err() {
            warn!("Failed to send {:?}", command);
            return Poll::Idle;
        }
        Poll::Sent(command)
    }

    fn start_app(&mut self) -> Poll {
        match AppVectors::read(&mut self.program, &self.config) {
            Ok(vectors) if vectors.is_valid(&self.config) => {
                info!(
                    "Starting application, sp {:#x} reset {:#x}",
                    vectors.stack_pointer, vectors.reset_vector
                );
                Poll::Boot {
                    vector_table: self.config.app_address(),
                    vectors,
                }
            }
            Ok(_) => {
                warn!("No application found");
                self.session.halt();
                Poll::Halted
            }
            Err(e) => {
                warn!("No application found: {:?}", e);
                self.session.halt();
                Poll::Halted
            }
        }
    }
}
