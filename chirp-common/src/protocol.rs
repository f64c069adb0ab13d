// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! OTA wire protocol shared between the earbuds and the phone-side tooling.
//!
//! Two packet encodings coexist on the same transport:
//! - **Legacy**: `[type: u8][payload]`, one transport delivery per packet.
//! - **TLV**: `[type: u8][len_rfu: u32 LE][payload]` where bits 0..10 of
//!   `len_rfu` carry the payload length. TLV packets survive arbitrary
//!   fragmentation and coalescing; see [`crate::queue::CommandQueue`].
//!
//! The payload layouts are identical in both encodings and must round-trip
//! bit-exact: the phone-side application is an external, fixed peer.

use crc::{Crc, CRC_32_ISO_HDLC};
use heapless::Vec;
use thiserror::Error;

/// CRC everywhere on this protocol is plain CRC-32 (ISO HDLC, the zlib one).
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

// --- Flash geometry and persisted-layout constants ---

pub const FLASH_SECTOR_SIZE: u32 = 4096;
pub const FLASH_PAGE_SIZE: u32 = 256;
/// Every confirmed segment boundary must sit on this alignment.
pub const MIN_SEGMENT_ALIGN: u32 = 256;

/// Magic carried by START/SEGMENT_VERIFY/GET_VERSION/IMAGE_APPLY commands.
pub const START_MAGIC: u32 = 0x5442_4553;

/// Boot info magic: boot the current image.
pub const NORMAL_BOOT: u32 = 0xBE57_EC1C;
/// Boot info magic: the bootloader must copy the staged image first.
pub const COPY_NEW_IMAGE: u32 = 0x5A5A_5A5A;
pub const BOOT_WORD_A: u32 = 0xAAAA_AAAA;
pub const BOOT_WORD_B: u32 = 0xBBBB_BBBB;

// --- Wire sizing ---

pub const LEGACY_HEADER_LEN: usize = 1;
/// Type byte plus the 32-bit length/reserved word.
pub const TLV_HEADER_LEN: usize = 5;
/// The TLV length field is 10 bits wide.
pub const MAX_TLV_PAYLOAD: usize = 1023;
/// A reassembled frame: type byte followed by the payload.
pub const MAX_FRAME_LEN: usize = LEGACY_HEADER_LEN + MAX_TLV_PAYLOAD;
/// An encoded packet including the largest header.
pub const MAX_WIRE_LEN: usize = TLV_HEADER_LEN + MAX_TLV_PAYLOAD;

/// Data packet payload cap on the BR/EDR (SPP) path.
pub const MAX_SPP_DATA_PAYLOAD: u16 = 512;
/// Data packet payload cap on the BLE path.
pub const MAX_BLE_DATA_PAYLOAD: u16 = 256;
pub const MAX_DATA_PAYLOAD: usize = MAX_SPP_DATA_PAYLOAD as usize;

pub const CHALLENGE_LEN: usize = 32;
pub const OTA_VERSION_LEN: usize = 4;
pub const FW_REV_LEN: usize = 4;
pub const NAME_LEN: usize = 32;
pub const BD_ADDR_LEN: usize = 6;

// --- Packet type codes (stable, bit-exact) ---

pub mod type_code {
    pub const START: u8 = 0x80;
    pub const START_RSP: u8 = 0x81;
    pub const SEGMENT_VERIFY: u8 = 0x82;
    pub const SEGMENT_VERIFY_RSP: u8 = 0x83;
    pub const RESULT_RSP: u8 = 0x84;
    pub const DATA: u8 = 0x85;
    pub const CONFIG: u8 = 0x86;
    pub const CONFIG_RSP: u8 = 0x87;
    pub const GET_RESULT: u8 = 0x88;
    pub const READ_FLASH: u8 = 0x89;
    pub const FLASH_CONTENT: u8 = 0x8A;
    pub const DATA_ACK: u8 = 0x8B;
    pub const RESUME_VERIFY: u8 = 0x8C;
    pub const RESUME_VERIFY_RSP: u8 = 0x8D;
    pub const GET_VERSION: u8 = 0x8E;
    pub const VERSION_RSP: u8 = 0x8F;
    pub const SIDE_SELECT: u8 = 0x90;
    pub const SIDE_SELECT_RSP: u8 = 0x91;
    pub const IMAGE_APPLY: u8 = 0x92;
    pub const IMAGE_APPLY_RSP: u8 = 0x93;
    pub const ROLE_SWITCH_RSP: u8 = 0x95;
    pub const SET_USER: u8 = 0x97;
    pub const SET_USER_RSP: u8 = 0x98;
    pub const GET_OTA_VERSION: u8 = 0x99;
    pub const GET_OTA_VERSION_RSP: u8 = 0x9A;
}

/// Numeric result codes carried by `RESULT_RSP`.
///
/// `0` and `1` are plain fail/pass; anything above is a specific error the
/// phone is expected to react to (restart, resume from scratch, ...).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OtaResult {
    Failed = 0,
    Ok = 1,
    ErrRecvSize = 2,
    ErrFlashOffset = 3,
    ErrSegVerify = 4,
    ErrBreakpoint = 5,
    ErrImageSize = 6,
}

impl From<OtaResult> for u8 {
    fn from(r: OtaResult) -> u8 {
        r as u8
    }
}

impl OtaResult {
    pub fn is_ok(code: u8) -> bool {
        code == OtaResult::Ok as u8
    }
}

/// Which of the two coexisting wire encodings a session speaks.
///
/// A session starts out legacy and is promoted to TLV for its lifetime the
/// first time a `GET_OTA_VERSION` command (TLV-only) is seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketEncoding {
    #[default]
    Legacy,
    Tlv,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    #[error("unknown packet type 0x{0:02x}")]
    UnknownType(u8),
    #[error("truncated packet")]
    Truncated,
    #[error("payload too long")]
    Oversize,
    #[error("reassembly queue full")]
    QueueFull,
}

// --- Commands (phone -> device) ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Begin a transfer: whole-image size and CRC32.
    Start {
        magic: u32,
        image_size: u32,
        image_crc32: u32,
    },
    /// Close the current segment and check its CRC32.
    SegmentVerify { magic: u32, segment_crc32: u32 },
    /// Raw image bytes.
    Data { bytes: Vec<u8, MAX_DATA_PAYLOAD> },
    /// A fragment of the flow configuration blob (may be split).
    Config { fragment: Vec<u8, { FlowConfiguration::WIRE_LEN }> },
    /// Ask for the whole-image verification result.
    GetResult,
    /// Start (or cancel) streaming back a flash range.
    ReadFlash { start: bool, addr: u32, len: u32 },
    /// Ask to resume a previous transfer at its persisted breakpoint.
    ResumeVerify {
        magic: u32,
        challenge: [u8; CHALLENGE_LEN],
        segment_size: u32,
        crc32: u32,
    },
    /// Query firmware revision info.
    GetVersion { magic: u32 },
    /// Select which earbud the update is addressed to.
    SideSelect { side: u8 },
    /// Permission to apply the verified image and reboot.
    ImageApply { magic: u32 },
    /// Select the OTA user for the following transfer (TLV dialect only).
    SetUser { user: u8 },
    /// Protocol version handshake (TLV dialect only).
    GetOtaVersion { version: [u8; OTA_VERSION_LEN] },
}

// --- Responses (device -> phone) ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    StartRsp {
        magic: u32,
        sw_version: u16,
        hw_version: u16,
        mtu: u16,
    },
    SegmentVerifyRsp {
        pass: bool,
    },
    ResultRsp {
        result: u8,
    },
    ConfigRsp {
        done: bool,
    },
    FlashContent {
        ok: bool,
        bytes: Vec<u8, MAX_DATA_PAYLOAD>,
    },
    DataAck,
    ResumeVerifyRsp {
        breakpoint: u32,
        challenge: [u8; CHALLENGE_LEN],
        crc32: u32,
    },
    VersionRsp {
        magic: u32,
        device_type: u8,
        left_fw: [u8; FW_REV_LEN],
        right_fw: [u8; FW_REV_LEN],
    },
    SideSelectRsp {
        success: bool,
    },
    ImageApplyRsp {
        success: bool,
    },
    RoleSwitchRsp,
    SetUserRsp {
        result: bool,
    },
    GetOtaVersionRsp {
        version: [u8; OTA_VERSION_LEN],
    },
}

/// CRC over (challenge ‖ segment_size) as carried by `RESUME_VERIFY`.
pub fn resume_request_crc(challenge: &[u8; CHALLENGE_LEN], segment_size: u32) -> u32 {
    let mut buf = [0u8; CHALLENGE_LEN + 4];
    buf[..CHALLENGE_LEN].copy_from_slice(challenge);
    buf[CHALLENGE_LEN..].copy_from_slice(&segment_size.to_le_bytes());
    CRC32.checksum(&buf)
}

/// CRC over (breakpoint ‖ challenge) as carried by `RESUME_VERIFY_RSP`.
pub fn resume_response_crc(breakpoint: u32, challenge: &[u8; CHALLENGE_LEN]) -> u32 {
    let mut buf = [0u8; 4 + CHALLENGE_LEN];
    buf[..4].copy_from_slice(&breakpoint.to_le_bytes());
    buf[4..].copy_from_slice(challenge);
    CRC32.checksum(&buf)
}

// --- Flow configuration blob ---

/// Transfer configuration sent with `CONFIG`, possibly split across several
/// packets. 93 bytes on the wire; the trailing CRC covers the first 89.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowConfiguration {
    pub length_of_following_data: u32,
    pub start_write_offset: u32,
    pub clear_user_data: bool,
    pub rename_bt: bool,
    pub rename_ble: bool,
    pub update_bt_addr: bool,
    pub update_ble_addr: bool,
    pub bt_name: [u8; NAME_LEN],
    pub ble_name: [u8; NAME_LEN],
    pub bt_addr: [u8; BD_ADDR_LEN],
    pub ble_addr: [u8; BD_ADDR_LEN],
    pub crc32: u32,
}

impl Default for FlowConfiguration {
    fn default() -> Self {
        Self {
            length_of_following_data: (Self::WIRE_LEN - 4) as u32,
            start_write_offset: 0,
            clear_user_data: true,
            rename_bt: false,
            rename_ble: false,
            update_bt_addr: false,
            update_ble_addr: false,
            bt_name: [0; NAME_LEN],
            ble_name: [0; NAME_LEN],
            bt_addr: [0; BD_ADDR_LEN],
            ble_addr: [0; BD_ADDR_LEN],
            crc32: 0,
        }
    }
}

impl FlowConfiguration {
    pub const WIRE_LEN: usize = 4 + 4 + 5 + 2 * NAME_LEN + 2 * BD_ADDR_LEN + 4;

    /// True once `buffered` bytes of an incoming blob are enough to parse it.
    /// The first 4 bytes announce how much follows them.
    pub fn is_complete(buffered: &[u8]) -> bool {
        if buffered.len() < 4 {
            return false;
        }
        let following = u32::from_le_bytes([buffered[0], buffered[1], buffered[2], buffered[3]]);
        (buffered.len() as u32) >= following.saturating_add(4)
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0..4].copy_from_slice(&self.length_of_following_data.to_le_bytes());
        out[4..8].copy_from_slice(&self.start_write_offset.to_le_bytes());
        out[8] = self.clear_user_data as u8;
        out[9] = self.rename_bt as u8;
        out[10] = self.rename_ble as u8;
        out[11] = self.update_bt_addr as u8;
        out[12] = self.update_ble_addr as u8;
        out[13..13 + NAME_LEN].copy_from_slice(&self.bt_name);
        out[45..45 + NAME_LEN].copy_from_slice(&self.ble_name);
        out[77..77 + BD_ADDR_LEN].copy_from_slice(&self.bt_addr);
        out[83..83 + BD_ADDR_LEN].copy_from_slice(&self.ble_addr);
        out[89..93].copy_from_slice(&self.crc32.to_le_bytes());
        out
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, DecodeError> {
        if raw.len() < Self::WIRE_LEN {
            return Err(DecodeError::Truncated);
        }
        let mut r = Reader::new(raw);
        Ok(Self {
            length_of_following_data: r.u32()?,
            start_write_offset: r.u32()?,
            clear_user_data: r.u8()? != 0,
            rename_bt: r.u8()? != 0,
            rename_ble: r.u8()? != 0,
            update_bt_addr: r.u8()? != 0,
            update_ble_addr: r.u8()? != 0,
            bt_name: r.array()?,
            ble_name: r.array()?,
            bt_addr: r.array()?,
            ble_addr: r.array()?,
            crc32: r.u32()?,
        })
    }

    /// CRC the receiver recomputes to validate the blob.
    pub fn computed_crc(&self) -> u32 {
        CRC32.checksum(&self.to_bytes()[..Self::WIRE_LEN - 4])
    }

    /// Fill in the trailing CRC (sender side).
    pub fn seal(mut self) -> Self {
        self.crc32 = self.computed_crc();
        self
    }
}

// --- Boot info sector (shared with the bootloader) ---

/// Persisted boot decision record, one per device, in its own flash sector.
///
/// Written once per successful apply; the bootloader reads it to decide
/// whether to copy the staged image over the running one. `boot_word`
/// alternates A/B across remap-based updates to double-buffer the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootInfo {
    pub magic: u32,
    pub image_size: u32,
    pub image_crc: u32,
    pub new_image_offset: u32,
    pub boot_word: u32,
}

impl BootInfo {
    pub const WIRE_LEN: usize = 20;

    pub fn normal() -> Self {
        Self {
            magic: NORMAL_BOOT,
            image_size: 0,
            image_crc: 0,
            new_image_offset: 0,
            boot_word: BOOT_WORD_A,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == NORMAL_BOOT || self.magic == COPY_NEW_IMAGE
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.image_size.to_le_bytes());
        out[8..12].copy_from_slice(&self.image_crc.to_le_bytes());
        out[12..16].copy_from_slice(&self.new_image_offset.to_le_bytes());
        out[16..20].copy_from_slice(&self.boot_word.to_le_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(raw);
        Ok(Self {
            magic: r.u32()?,
            image_size: r.u32()?,
            image_crc: r.u32()?,
            new_image_offset: r.u32()?,
            boot_word: r.u32()?,
        })
    }
}

// --- Encode / decode ---

pub type WireBuf = Vec<u8, MAX_WIRE_LEN>;

fn begin_packet(type_code: u8, encoding: PacketEncoding) -> WireBuf {
    let mut out = WireBuf::new();
    // capacity always suffices for a header
    let _ = out.push(type_code);
    if encoding == PacketEncoding::Tlv {
        let _ = out.extend_from_slice(&[0u8; 4]);
    }
    out
}

fn finish_packet(mut out: WireBuf, encoding: PacketEncoding) -> Result<WireBuf, DecodeError> {
    if encoding == PacketEncoding::Tlv {
        let payload_len = out.len() - TLV_HEADER_LEN;
        if payload_len > MAX_TLV_PAYLOAD {
            return Err(DecodeError::Oversize);
        }
        let len_rfu = (payload_len as u32) & 0x3FF;
        out[1..5].copy_from_slice(&len_rfu.to_le_bytes());
    }
    Ok(out)
}

fn put(out: &mut WireBuf, bytes: &[u8]) -> Result<(), DecodeError> {
    out.extend_from_slice(bytes).map_err(|_| DecodeError::Oversize)
}

fn put_u16(out: &mut WireBuf, v: u16) -> Result<(), DecodeError> {
    put(out, &v.to_le_bytes())
}

fn put_u32(out: &mut WireBuf, v: u32) -> Result<(), DecodeError> {
    put(out, &v.to_le_bytes())
}

struct Reader<'a> {
    rest: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(rest: &'a [u8]) -> Self {
        Self { rest }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.rest.len() < n {
            return Err(DecodeError::Truncated);
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn remaining(self) -> &'a [u8] {
        self.rest
    }
}

impl Command {
    pub fn type_code(&self) -> u8 {
        use type_code::*;
        match self {
            Command::Start { .. } => START,
            Command::SegmentVerify { .. } => SEGMENT_VERIFY,
            Command::Data { .. } => DATA,
            Command::Config { .. } => CONFIG,
            Command::GetResult => GET_RESULT,
            Command::ReadFlash { .. } => READ_FLASH,
            Command::ResumeVerify { .. } => RESUME_VERIFY,
            Command::GetVersion { .. } => GET_VERSION,
            Command::SideSelect { .. } => SIDE_SELECT,
            Command::ImageApply { .. } => IMAGE_APPLY,
            Command::SetUser { .. } => SET_USER,
            Command::GetOtaVersion { .. } => GET_OTA_VERSION,
        }
    }

    pub fn encode(&self, encoding: PacketEncoding) -> Result<WireBuf, DecodeError> {
        let mut out = begin_packet(self.type_code(), encoding);
        match self {
            Command::Start {
                magic,
                image_size,
                image_crc32,
            } => {
                put_u32(&mut out, *magic)?;
                put_u32(&mut out, *image_size)?;
                put_u32(&mut out, *image_crc32)?;
            }
            Command::SegmentVerify {
                magic,
                segment_crc32,
            } => {
                put_u32(&mut out, *magic)?;
                put_u32(&mut out, *segment_crc32)?;
            }
            Command::Data { bytes } => put(&mut out, bytes)?,
            Command::Config { fragment } => put(&mut out, fragment)?,
            Command::GetResult => {}
            Command::ReadFlash { start, addr, len } => {
                put(&mut out, &[*start as u8])?;
                put_u32(&mut out, *addr)?;
                put_u32(&mut out, *len)?;
            }
            Command::ResumeVerify {
                magic,
                challenge,
                segment_size,
                crc32,
            } => {
                put_u32(&mut out, *magic)?;
                put(&mut out, challenge)?;
                put_u32(&mut out, *segment_size)?;
                put_u32(&mut out, *crc32)?;
            }
            Command::GetVersion { magic } => put_u32(&mut out, *magic)?,
            Command::SideSelect { side } => put(&mut out, &[*side])?,
            Command::ImageApply { magic } => put_u32(&mut out, *magic)?,
            Command::SetUser { user } => put(&mut out, &[*user])?,
            Command::GetOtaVersion { version } => put(&mut out, version)?,
        }
        finish_packet(out, encoding)
    }

    /// Decode a reassembled frame (`[type][payload]`, TLV header stripped).
    pub fn decode(frame: &[u8]) -> Result<Command, DecodeError> {
        use type_code::*;
        let mut r = Reader::new(frame);
        let code = r.u8()?;
        let cmd = match code {
            START => Command::Start {
                magic: r.u32()?,
                image_size: r.u32()?,
                image_crc32: r.u32()?,
            },
            SEGMENT_VERIFY => Command::SegmentVerify {
                magic: r.u32()?,
                segment_crc32: r.u32()?,
            },
            DATA => Command::Data {
                bytes: Vec::from_slice(r.remaining()).map_err(|_| DecodeError::Oversize)?,
            },
            CONFIG => Command::Config {
                fragment: Vec::from_slice(r.remaining()).map_err(|_| DecodeError::Oversize)?,
            },
            GET_RESULT => Command::GetResult,
            READ_FLASH => Command::ReadFlash {
                start: r.u8()? != 0,
                addr: r.u32()?,
                len: r.u32()?,
            },
            RESUME_VERIFY => Command::ResumeVerify {
                magic: r.u32()?,
                challenge: r.array()?,
                segment_size: r.u32()?,
                crc32: r.u32()?,
            },
            GET_VERSION => Command::GetVersion { magic: r.u32()? },
            SIDE_SELECT => Command::SideSelect { side: r.u8()? },
            IMAGE_APPLY => Command::ImageApply { magic: r.u32()? },
            SET_USER => Command::SetUser { user: r.u8()? },
            GET_OTA_VERSION => Command::GetOtaVersion {
                version: r.array()?,
            },
            other => return Err(DecodeError::UnknownType(other)),
        };
        Ok(cmd)
    }
}

impl Response {
    pub fn type_code(&self) -> u8 {
        use type_code::*;
        match self {
            Response::StartRsp { .. } => START_RSP,
            Response::SegmentVerifyRsp { .. } => SEGMENT_VERIFY_RSP,
            Response::ResultRsp { .. } => RESULT_RSP,
            Response::ConfigRsp { .. } => CONFIG_RSP,
            Response::FlashContent { .. } => FLASH_CONTENT,
            Response::DataAck => DATA_ACK,
            Response::ResumeVerifyRsp { .. } => RESUME_VERIFY_RSP,
            Response::VersionRsp { .. } => VERSION_RSP,
            Response::SideSelectRsp { .. } => SIDE_SELECT_RSP,
            Response::ImageApplyRsp { .. } => IMAGE_APPLY_RSP,
            Response::RoleSwitchRsp => ROLE_SWITCH_RSP,
            Response::SetUserRsp { .. } => SET_USER_RSP,
            Response::GetOtaVersionRsp { .. } => GET_OTA_VERSION_RSP,
        }
    }

    pub fn encode(&self, encoding: PacketEncoding) -> Result<WireBuf, DecodeError> {
        let mut out = begin_packet(self.type_code(), encoding);
        match self {
            Response::StartRsp {
                magic,
                sw_version,
                hw_version,
                mtu,
            } => {
                put_u32(&mut out, *magic)?;
                put_u16(&mut out, *sw_version)?;
                put_u16(&mut out, *hw_version)?;
                put_u16(&mut out, *mtu)?;
            }
            Response::SegmentVerifyRsp { pass } => put(&mut out, &[*pass as u8])?,
            Response::ResultRsp { result } => put(&mut out, &[*result])?,
            Response::ConfigRsp { done } => put(&mut out, &[*done as u8])?,
            Response::FlashContent { ok, bytes } => {
                put(&mut out, &[*ok as u8])?;
                put(&mut out, bytes)?;
            }
            Response::DataAck => {}
            Response::ResumeVerifyRsp {
                breakpoint,
                challenge,
                crc32,
            } => {
                put_u32(&mut out, *breakpoint)?;
                put(&mut out, challenge)?;
                put_u32(&mut out, *crc32)?;
            }
            Response::VersionRsp {
                magic,
                device_type,
                left_fw,
                right_fw,
            } => {
                put_u32(&mut out, *magic)?;
                put(&mut out, &[*device_type])?;
                put(&mut out, left_fw)?;
                put(&mut out, right_fw)?;
            }
            Response::SideSelectRsp { success } => put(&mut out, &[*success as u8])?,
            Response::ImageApplyRsp { success } => put(&mut out, &[*success as u8])?,
            Response::RoleSwitchRsp => {}
            Response::SetUserRsp { result } => put(&mut out, &[*result as u8])?,
            Response::GetOtaVersionRsp { version } => put(&mut out, version)?,
        }
        finish_packet(out, encoding)
    }

    /// Decode a reassembled frame. Used by the phone-side tooling and tests.
    pub fn decode(frame: &[u8]) -> Result<Response, DecodeError> {
        use type_code::*;
        let mut r = Reader::new(frame);
        let code = r.u8()?;
        let rsp = match code {
            START_RSP => Response::StartRsp {
                magic: r.u32()?,
                sw_version: r.u16()?,
                hw_version: r.u16()?,
                mtu: r.u16()?,
            },
            SEGMENT_VERIFY_RSP => Response::SegmentVerifyRsp { pass: r.u8()? != 0 },
            RESULT_RSP => Response::ResultRsp { result: r.u8()? },
            CONFIG_RSP => Response::ConfigRsp { done: r.u8()? != 0 },
            FLASH_CONTENT => Response::FlashContent {
                ok: r.u8()? != 0,
                bytes: Vec::from_slice(r.remaining()).map_err(|_| DecodeError::Oversize)?,
            },
            DATA_ACK => Response::DataAck,
            RESUME_VERIFY_RSP => Response::ResumeVerifyRsp {
                breakpoint: r.u32()?,
                challenge: r.array()?,
                crc32: r.u32()?,
            },
            VERSION_RSP => Response::VersionRsp {
                magic: r.u32()?,
                device_type: r.u8()?,
                left_fw: r.array()?,
                right_fw: r.array()?,
            },
            SIDE_SELECT_RSP => Response::SideSelectRsp { success: r.u8()? != 0 },
            IMAGE_APPLY_RSP => Response::ImageApplyRsp { success: r.u8()? != 0 },
            ROLE_SWITCH_RSP => Response::RoleSwitchRsp,
            SET_USER_RSP => Response::SetUserRsp { result: r.u8()? != 0 },
            GET_OTA_VERSION_RSP => Response::GetOtaVersionRsp {
                version: r.array()?,
            },
            other => return Err(DecodeError::UnknownType(other)),
        };
        Ok(rsp)
    }
}
