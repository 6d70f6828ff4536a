// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

mod common;

use bootloader::{Bootloader, Config, Poll, RxLine, SerialChannel, State};
use common::{decode, encode, handshake, setup, ExtFlash, ManualClock, MockChannel, ProgramFlash};
use host_protocol::{Command, ErrorCode, Message};

#[test]
fn frame_split_across_ticks() {
    let (mut loader, _clock) = setup();
    let frame = encode(&Message::HostHello);

    loader.channel_mut().push_bytes(&frame[..2]);
    assert_eq!(loader.tick(), Poll::Idle);
    loader.channel_mut().push_bytes(&frame[2..]);
    assert_eq!(loader.tick(), Poll::Sent(Command::Hello));
    assert_eq!(loader.session().state(), State::Ready);
}

#[test]
fn block_frame_split_in_chunks() {
    let (mut loader, _clock) = setup();
    handshake(&mut loader);
    loader.channel_mut().push(&Message::DownloadRequest {
        partition: 0,
        binary_size: 10,
    });
    loader.tick();
    loader.channel_mut().push(&Message::DownloadParamResponse {
        kind: host_protocol::DownloadType::Raw,
        total_blocks: 1,
        block_size: 4096,
    });
    loader.tick();
    loader.channel_mut().take_sent();

    let frame = encode(&Message::DownloadBlockResponse {
        block: 0,
        data: &[9; 10],
    });
    for chunk in frame.chunks(3) {
        loader.channel_mut().push_bytes(chunk);
    }
    let polls: Vec<_> = (0..frame.len().div_ceil(3)).map(|_| loader.tick()).collect();
    assert_eq!(polls.last(), Some(&Poll::Sent(Command::End)));
    assert!(polls[..polls.len() - 1].iter().all(|p| *p == Poll::Idle));
}

#[test]
fn retransmit_once_per_timeout() {
    let (mut loader, clock) = setup();
    // First 4 bytes of a 20 byte frame.
    loader.channel_mut().push_bytes(&[0xAA, 6, 16, 0]);
    assert_eq!(loader.tick(), Poll::Idle);

    clock.advance(500);
    assert_eq!(loader.tick(), Poll::Idle);
    clock.advance(1);
    assert_eq!(loader.tick(), Poll::Sent(Command::Retransmit));
    assert_eq!(decode(&loader.channel_mut().take_sent()[0]), Message::Retransmit);

    let mut retransmits = 0;
    for _ in 0..150 {
        clock.advance(10);
        if loader.tick() == Poll::Sent(Command::Retransmit) {
            retransmits += 1;
        }
    }
    // 1500 ms after the first request, one request per 500 ms window.
    assert_eq!(retransmits, 2);
    assert!(loader
        .channel_mut()
        .take_sent()
        .iter()
        .all(|frame| decode(frame) == Message::Retransmit));
}

#[test]
fn partial_frame_dropped_on_timeout() {
    let (mut loader, clock) = setup();
    let frame = encode(&Message::HostHello);
    loader.channel_mut().push_bytes(&frame[..3]);
    loader.tick();
    clock.advance(501);
    assert_eq!(loader.tick(), Poll::Sent(Command::Retransmit));

    // The stale bytes are gone, a fresh frame is parsed from scratch.
    loader.channel_mut().push_bytes(&frame);
    assert_eq!(loader.tick(), Poll::Sent(Command::Hello));
}

#[test]
fn no_timeout_without_traffic() {
    let (mut loader, clock) = setup();
    clock.advance(10_000);
    assert_eq!(loader.tick(), Poll::Idle);
    assert!(loader.channel().sent.is_empty());
}

#[test]
fn malformed_frames_are_answered() {
    let (mut loader, _clock) = setup();
    let cases: [(&[u8], ErrorCode, &str); 4] = [
        (&[0x55, 1, 0, 0], ErrorCode::Invalid, "Bad magic"),
        (&[0xAA, 0x40, 0, 0], ErrorCode::Unknown, "Unknown command"),
        (&[0xAA, 2, 1, 0, 7], ErrorCode::Size, "Invalid payload length"),
        (&[0xAA, 11, 1, 0, 0], ErrorCode::Size, "Invalid payload length"),
    ];
    for (bytes, code, message) in cases {
        loader.channel_mut().push_bytes(bytes);
        assert_eq!(loader.tick(), Poll::Sent(Command::Error));
        let sent = loader.channel_mut().take_sent();
        assert_eq!(decode(&sent[0]), Message::Error { code, message });
    }
    handshake(&mut loader);
}

#[test]
fn oversized_frame_is_discarded() {
    let (mut loader, clock) = setup();
    loader.channel_mut().push_bytes(&[0xAA, 6, 0xFF, 0xFF]);
    assert_eq!(loader.tick(), Poll::Idle);
    clock.advance(1000);
    assert_eq!(loader.tick(), Poll::Idle);
    assert!(loader.channel().sent.is_empty());
}

#[test]
fn send_failure_is_not_fatal() {
    let (mut loader, _clock) = setup();
    loader.channel_mut().fail_send = true;
    loader.channel_mut().push(&Message::HostHello);
    assert_eq!(loader.tick(), Poll::Idle);
    assert_eq!(loader.session().state(), State::Ready);
}

#[test]
fn disabled_until_init() {
    let config = Config::default();
    let mut loader = Bootloader::new(
        config,
        MockChannel::default(),
        ExtFlash::new(0x1000),
        ProgramFlash::new(0x1000),
        ManualClock::default(),
    );
    loader.channel_mut().push(&Message::HostHello);
    assert_eq!(loader.tick(), Poll::Idle);
    assert_eq!(loader.session().state(), State::Disable);
    assert_eq!(loader.channel().inbox.len(), 1);

    loader.init();
    assert_eq!(loader.tick(), Poll::Sent(Command::Hello));
}

/// Serial writer capturing everything sent.
#[derive(Default)]
struct Wire(Vec<u8>);

impl embedded_io::ErrorType for Wire {
    type Error = core::convert::Infallible;
}

impl embedded_io::Write for Wire {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[test]
fn serial_channel_end_to_end() {
    static LINE: RxLine<64> = RxLine::new();

    let channel = SerialChannel::new(&LINE, Wire::default());
    let mut loader = Bootloader::new(
        Config::default(),
        channel,
        ExtFlash::new(0x1000),
        ProgramFlash::new(0x1000),
        ManualClock::default(),
    );
    loader.init();

    // Interrupt side
    for byte in encode(&Message::HostHello) {
        assert!(LINE.push(byte));
    }
    assert_eq!(loader.tick(), Poll::Idle);
    LINE.complete();

    assert_eq!(loader.tick(), Poll::Sent(Command::Hello));
    assert_eq!(loader.channel().tx().0, encode(&Message::Hello));
}
