// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! In-memory fakes behind the engine's hardware traits, plus transfer
//! drivers shared by the integration tests.

#![allow(dead_code)]

use chirp_common::protocol::CRC32;
use chirp_common::{Command, PacketEncoding, Response, FLASH_SECTOR_SIZE, NORMAL_BOOT, START_MAGIC};
use chirp_ota::verify::SANITY_KEY_WORD;
use chirp_ota::{
    Clock, DeviceInfo, Flash, OtaEngine, OtaError, OtaUser, OtaUserId, RelayLink, RelayOp,
    Transport,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

pub const FIRMWARE_REGION_LEN: u32 = 64 * 1024;
pub const FIRMWARE_REGION_BASE: u32 = 0x0018_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashOp {
    Erase(OtaUserId, u32),
    Program(OtaUserId, u32, usize),
}

/// NOR-faithful flash: erase fills a sector with 0xFF, program can only
/// clear bits. Every mutation is recorded for sector-accounting tests.
pub struct MemFlash {
    regions: Vec<(OtaUserId, Vec<u8>)>,
    pub ops: Vec<FlashOp>,
}

impl MemFlash {
    pub fn new() -> Self {
        Self {
            regions: vec![
                (OtaUserId::Firmware, vec![0xFF; FIRMWARE_REGION_LEN as usize]),
                (OtaUserId::UpgradeLog, vec![0xFF; FLASH_SECTOR_SIZE as usize]),
                (OtaUserId::BootInfo, vec![0xFF; FLASH_SECTOR_SIZE as usize]),
            ],
            ops: Vec::new(),
        }
    }

    pub fn region_mut(&mut self, user: OtaUserId) -> &mut Vec<u8> {
        &mut self
            .regions
            .iter_mut()
            .find(|(id, _)| *id == user)
            .unwrap_or_else(|| panic!("no region for {user:?}"))
            .1
    }

    pub fn region(&self, user: OtaUserId) -> &[u8] {
        &self
            .regions
            .iter()
            .find(|(id, _)| *id == user)
            .unwrap_or_else(|| panic!("no region for {user:?}"))
            .1
    }

    pub fn erase_count(&self, user: OtaUserId, sector_offset: u32) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, FlashOp::Erase(u, o) if *u == user && *o == sector_offset))
            .count()
    }
}

#[derive(Clone)]
pub struct SharedFlash(pub Rc<RefCell<MemFlash>>);

impl SharedFlash {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(MemFlash::new())))
    }
}

impl Flash for SharedFlash {
    fn read(&mut self, user: OtaUserId, offset: u32, buf: &mut [u8]) -> Result<(), OtaError> {
        let flash = self.0.borrow();
        let region = flash.region(user);
        let start = offset as usize;
        let end = start + buf.len();
        if end > region.len() {
            return Err(OtaError::FlashBounds(offset));
        }
        buf.copy_from_slice(&region[start..end]);
        Ok(())
    }

    fn program(&mut self, user: OtaUserId, offset: u32, bytes: &[u8]) -> Result<(), OtaError> {
        let mut flash = self.0.borrow_mut();
        flash.ops.push(FlashOp::Program(user, offset, bytes.len()));
        let region = flash.region_mut(user);
        let start = offset as usize;
        let end = start + bytes.len();
        if end > region.len() {
            return Err(OtaError::FlashBounds(offset));
        }
        for (cell, byte) in region[start..end].iter_mut().zip(bytes) {
            *cell &= byte;
        }
        Ok(())
    }

    fn erase_sector(&mut self, user: OtaUserId, offset: u32) -> Result<(), OtaError> {
        assert_eq!(offset % FLASH_SECTOR_SIZE, 0, "unaligned erase");
        let mut flash = self.0.borrow_mut();
        flash.ops.push(FlashOp::Erase(user, offset));
        let region = flash.region_mut(user);
        let start = offset as usize;
        let end = start + FLASH_SECTOR_SIZE as usize;
        if end > region.len() {
            return Err(OtaError::FlashBounds(offset));
        }
        region[start..end].fill(0xFF);
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<(), OtaError> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct SharedTransport(pub Rc<RefCell<Vec<Vec<u8>>>>);

impl SharedTransport {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(Vec::new())))
    }

    pub fn drain_responses(&self) -> Vec<Response> {
        self.0
            .borrow_mut()
            .drain(..)
            .map(|wire| Response::decode(&wire).expect("sent frame must decode"))
            .collect()
    }

    /// The single response a command is expected to have produced.
    pub fn pop_response(&self) -> Response {
        let mut all = self.drain_responses();
        assert_eq!(all.len(), 1, "expected exactly one response: {all:?}");
        all.pop().unwrap()
    }
}

impl Transport for SharedTransport {
    fn transmit(&mut self, bytes: &[u8]) -> Result<(), OtaError> {
        self.0.borrow_mut().push(bytes.to_vec());
        Ok(())
    }
}

#[derive(Clone)]
pub struct SharedRelay(pub Rc<RefCell<Vec<(RelayOp, Vec<u8>)>>>);

impl SharedRelay {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(Vec::new())))
    }

    pub fn drain(&self) -> Vec<(RelayOp, Vec<u8>)> {
        self.0.borrow_mut().drain(..).collect()
    }
}

impl RelayLink for SharedRelay {
    fn send(&mut self, op: RelayOp, payload: &[u8]) -> Result<(), OtaError> {
        self.0.borrow_mut().push((op, payload.to_vec()));
        Ok(())
    }
}

#[derive(Clone)]
pub struct SharedClock(pub Rc<Cell<u64>>);

impl SharedClock {
    pub fn new() -> Self {
        Self(Rc::new(Cell::new(1_000)))
    }

    pub fn advance(&self, ms: u64) {
        self.0.set(self.0.get() + ms);
    }
}

impl Clock for SharedClock {
    fn now_ms(&self) -> u64 {
        self.0.get()
    }
}

pub type TestEngine = OtaEngine<SharedFlash, SharedTransport, SharedRelay, SharedClock>;

pub struct Harness {
    pub engine: TestEngine,
    pub flash: SharedFlash,
    pub transport: SharedTransport,
    pub relay: SharedRelay,
    pub clock: SharedClock,
}

pub fn device_info() -> DeviceInfo {
    DeviceInfo {
        sw_version: 0x0203,
        hw_version: 0x0001,
        device_type: 1,
        side: 1,
        left_fw: [2, 3, 0, 0],
        right_fw: [2, 3, 0, 1],
    }
}

pub fn harness() -> Harness {
    harness_with_flash(SharedFlash::new())
}

/// Rebuild a fresh engine over existing flash, as after a device reset.
pub fn harness_with_flash(flash: SharedFlash) -> Harness {
    let transport = SharedTransport::new();
    let relay = SharedRelay::new();
    let clock = SharedClock::new();
    let mut engine = OtaEngine::new(
        flash.clone(),
        transport.clone(),
        relay.clone(),
        clock.clone(),
        device_info(),
    );
    engine
        .register_user(OtaUser::new(
            OtaUserId::Firmware,
            FIRMWARE_REGION_BASE,
            FIRMWARE_REGION_LEN,
        ))
        .unwrap();
    Harness {
        engine,
        flash,
        transport,
        relay,
        clock,
    }
}

pub fn crc32(bytes: &[u8]) -> u32 {
    CRC32.checksum(bytes)
}

/// Whole-image CRC as the phone computes it: the boot-header word counts
/// as FF FF FF FF.
pub fn image_crc(image: &[u8]) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(&[0xFF; 4]);
    digest.update(&image[4..]);
    digest.finalize()
}

/// Deterministic pseudo-random firmware image in the current build format:
/// boot-header word up front, tail key word plus 8 hex CRC digits covering
/// everything before the digits.
pub fn make_image(len: usize) -> Vec<u8> {
    assert!(len >= 64, "image too small for the build-format trailer");
    let mut image: Vec<u8> = (0..len)
        .map(|i| {
            let x = (i as u32).wrapping_mul(2654435761).wrapping_add(0x9E37);
            (x >> ((i % 3) * 8)) as u8
        })
        .collect();
    image[..4].copy_from_slice(&NORMAL_BOOT.to_le_bytes());
    let key_at = len - SANITY_KEY_WORD.len() - 8;
    image[key_at..key_at + SANITY_KEY_WORD.len()].copy_from_slice(SANITY_KEY_WORD);
    let digits = format!("{:08x}", crc32(&image[..len - 8]));
    image[len - 8..].copy_from_slice(digits.as_bytes());
    image
}

/// Same generator without the trailer: a plain image in the old build
/// format, boot header only.
pub fn make_old_format_image(len: usize) -> Vec<u8> {
    let mut image: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    image[..4].copy_from_slice(&NORMAL_BOOT.to_le_bytes());
    image
}

/// Encode and deliver one command over the legacy wire (SPP by default).
pub fn send(engine: &mut TestEngine, cmd: &Command) {
    let wire = cmd.encode(PacketEncoding::Legacy).unwrap();
    engine.on_bytes_received(&wire, false).unwrap();
}

pub fn send_ble(engine: &mut TestEngine, cmd: &Command) {
    let wire = cmd.encode(PacketEncoding::Legacy).unwrap();
    engine.on_bytes_received(&wire, true).unwrap();
}

pub fn start_cmd(image: &[u8]) -> Command {
    Command::Start {
        magic: START_MAGIC,
        image_size: image.len() as u32,
        image_crc32: image_crc(image),
    }
}

pub fn config_cmd() -> Command {
    let cfg = chirp_common::FlowConfiguration::default().seal();
    Command::Config {
        fragment: heapless::Vec::from_slice(&cfg.to_bytes()).unwrap(),
    }
}

/// Drive `START` + `CONFIG`, asserting both are accepted.
pub fn begin_transfer(h: &mut Harness, image: &[u8]) {
    send(&mut h.engine, &start_cmd(image));
    assert!(matches!(
        h.transport.pop_response(),
        Response::StartRsp { .. }
    ));
    send(&mut h.engine, &config_cmd());
    assert_eq!(h.transport.pop_response(), Response::ConfigRsp { done: true });
}

/// Feed one segment's bytes as BLE data packets (no per-packet acks), then
/// verify it; returns the device's pass/fail.
pub fn send_segment(h: &mut Harness, segment: &[u8], expected_crc: u32) -> bool {
    for chunk in segment.chunks(128) {
        send_ble(
            &mut h.engine,
            &Command::Data {
                bytes: heapless::Vec::from_slice(chunk).unwrap(),
            },
        );
    }
    send(
        &mut h.engine,
        &Command::SegmentVerify {
            magic: START_MAGIC,
            segment_crc32: expected_crc,
        },
    );
    match h.transport.pop_response() {
        Response::SegmentVerifyRsp { pass } => pass,
        Response::ResultRsp { result } => {
            assert_ne!(result, 1, "unexpected plain-ok result for a segment");
            false
        }
        other => panic!("unexpected segment response {other:?}"),
    }
}

/// Full happy-path transfer in fixed-size segments, through GET_RESULT.
pub fn transfer_image(h: &mut Harness, image: &[u8], segment_len: usize) -> Response {
    begin_transfer(h, image);
    for segment in image.chunks(segment_len) {
        assert!(send_segment(h, segment, crc32(segment)));
    }
    send(&mut h.engine, &Command::GetResult);
    h.transport.pop_response()
}
