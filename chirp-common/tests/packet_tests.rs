// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

use chirp_common::protocol::{
    resume_request_crc, resume_response_crc, type_code, DecodeError, MAX_DATA_PAYLOAD,
    TLV_HEADER_LEN,
};
use chirp_common::{
    BootInfo, Command, FlowConfiguration, OtaResult, PacketEncoding, Response, COPY_NEW_IMAGE,
    NORMAL_BOOT, START_MAGIC,
};
use heapless::Vec;
use pretty_assertions::assert_eq;

#[test]
fn start_command_legacy_layout_is_fixed() {
    let cmd = Command::Start {
        magic: START_MAGIC,
        image_size: 0x0004_0000,
        image_crc32: 0xDEAD_BEEF,
    };
    let wire = cmd.encode(PacketEncoding::Legacy).unwrap();
    assert_eq!(wire[0], type_code::START);
    assert_eq!(wire.len(), 13);
    assert_eq!(&wire[1..5], &START_MAGIC.to_le_bytes());
    assert_eq!(&wire[5..9], &0x0004_0000u32.to_le_bytes());
    assert_eq!(&wire[9..13], &0xDEAD_BEEFu32.to_le_bytes());
}

#[test]
fn tlv_header_carries_payload_length_in_low_bits() {
    let cmd = Command::GetVersion { magic: START_MAGIC };
    let wire = cmd.encode(PacketEncoding::Tlv).unwrap();
    assert_eq!(wire[0], type_code::GET_VERSION);
    let len_rfu = u32::from_le_bytes([wire[1], wire[2], wire[3], wire[4]]);
    assert_eq!(len_rfu & 0x3FF, 4);
    assert_eq!(wire.len(), TLV_HEADER_LEN + 4);
}

#[test]
fn tlv_and_legacy_payloads_are_identical() {
    let cmd = Command::ResumeVerify {
        magic: START_MAGIC,
        challenge: [0xA5; 32],
        segment_size: 4096,
        crc32: 0x1234_5678,
    };
    let legacy = cmd.encode(PacketEncoding::Legacy).unwrap();
    let tlv = cmd.encode(PacketEncoding::Tlv).unwrap();
    assert_eq!(legacy[0], tlv[0]);
    assert_eq!(&legacy[1..], &tlv[TLV_HEADER_LEN..]);
}

#[test]
fn command_roundtrip_through_frame() {
    let cases = [
        Command::Start {
            magic: START_MAGIC,
            image_size: 123_456,
            image_crc32: 42,
        },
        Command::SegmentVerify {
            magic: START_MAGIC,
            segment_crc32: 7,
        },
        Command::GetResult,
        Command::ReadFlash {
            start: true,
            addr: 0x1000,
            len: 512,
        },
        Command::GetVersion { magic: START_MAGIC },
        Command::SideSelect { side: 1 },
        Command::ImageApply { magic: START_MAGIC },
        Command::SetUser { user: 2 },
        Command::GetOtaVersion {
            version: [2, 0, 0, 1],
        },
    ];
    for cmd in cases {
        let wire = cmd.encode(PacketEncoding::Legacy).unwrap();
        assert_eq!(Command::decode(&wire).unwrap(), cmd);
    }
}

#[test]
fn response_roundtrip_through_frame() {
    let cases = [
        Response::StartRsp {
            magic: START_MAGIC,
            sw_version: 0x0102,
            hw_version: 0x0001,
            mtu: 512,
        },
        Response::SegmentVerifyRsp { pass: true },
        Response::ResultRsp {
            result: OtaResult::ErrSegVerify as u8,
        },
        Response::ConfigRsp { done: true },
        Response::DataAck,
        Response::ResumeVerifyRsp {
            breakpoint: 0x2000,
            challenge: [9; 32],
            crc32: 0xAB,
        },
        Response::VersionRsp {
            magic: START_MAGIC,
            device_type: 1,
            left_fw: [1, 2, 3, 4],
            right_fw: [1, 2, 3, 5],
        },
        Response::SideSelectRsp { success: false },
        Response::ImageApplyRsp { success: true },
        Response::RoleSwitchRsp,
        Response::SetUserRsp { result: true },
        Response::GetOtaVersionRsp {
            version: [2, 0, 0, 0],
        },
    ];
    for rsp in cases {
        let wire = rsp.encode(PacketEncoding::Legacy).unwrap();
        assert_eq!(Response::decode(&wire).unwrap(), rsp);
    }
}

#[test]
fn data_payload_survives_both_encodings() {
    let bytes: Vec<u8, MAX_DATA_PAYLOAD> =
        Vec::from_slice(&[0x55; MAX_DATA_PAYLOAD]).unwrap();
    let cmd = Command::Data {
        bytes: bytes.clone(),
    };
    let wire = cmd.encode(PacketEncoding::Tlv).unwrap();
    let len_rfu = u32::from_le_bytes([wire[1], wire[2], wire[3], wire[4]]);
    assert_eq!(len_rfu & 0x3FF, MAX_DATA_PAYLOAD as u32);
    assert_eq!(&wire[TLV_HEADER_LEN..], &bytes[..]);
}

#[test]
fn oversize_data_frame_is_rejected() {
    let mut frame = vec![type_code::DATA];
    frame.extend_from_slice(&[0u8; MAX_DATA_PAYLOAD + 1]);
    assert_eq!(Command::decode(&frame), Err(DecodeError::Oversize));
}

#[test]
fn unknown_and_truncated_frames_are_rejected() {
    assert_eq!(Command::decode(&[0x42]), Err(DecodeError::UnknownType(0x42)));
    assert_eq!(
        Command::decode(&[type_code::START, 1, 2]),
        Err(DecodeError::Truncated)
    );
    assert_eq!(Command::decode(&[]), Err(DecodeError::Truncated));
}

#[test]
fn resume_crcs_cover_the_documented_fields() {
    let challenge = [0x11u8; 32];
    // a different segment size must change the request CRC
    assert_ne!(
        resume_request_crc(&challenge, 4096),
        resume_request_crc(&challenge, 8192)
    );
    // a different breakpoint must change the response CRC
    assert_ne!(
        resume_response_crc(0, &challenge),
        resume_response_crc(0x1000, &challenge)
    );
}

#[test]
fn flow_configuration_roundtrips_and_seals() {
    let mut cfg = FlowConfiguration::default();
    cfg.length_of_following_data = (FlowConfiguration::WIRE_LEN - 4) as u32;
    cfg.start_write_offset = 0x0001_8000;
    cfg.rename_bt = true;
    cfg.bt_name[..5].copy_from_slice(b"Chirp");
    let cfg = cfg.seal();

    assert_eq!(cfg.crc32, cfg.computed_crc());
    let wire = cfg.to_bytes();
    assert_eq!(wire.len(), FlowConfiguration::WIRE_LEN);
    assert_eq!(FlowConfiguration::from_slice(&wire).unwrap(), cfg);
}

#[test]
fn flow_configuration_completeness_follows_leading_length() {
    let cfg = FlowConfiguration::default().seal();
    let wire = cfg.to_bytes();
    assert!(!FlowConfiguration::is_complete(&wire[..3]));
    assert!(!FlowConfiguration::is_complete(&wire[..wire.len() - 1]));
    assert!(FlowConfiguration::is_complete(&wire));
}

#[test]
fn corrupted_flow_configuration_fails_its_crc() {
    let cfg = FlowConfiguration::default().seal();
    let mut wire = cfg.to_bytes();
    wire[13] ^= 0x01; // flip one bit inside bt_name
    let parsed = FlowConfiguration::from_slice(&wire).unwrap();
    assert_ne!(parsed.crc32, parsed.computed_crc());
}

#[test]
fn boot_info_roundtrips_little_endian() {
    let info = BootInfo {
        magic: COPY_NEW_IMAGE,
        image_size: 0x0008_0000,
        image_crc: 0xCAFE_F00D,
        new_image_offset: 0x0018_0000,
        boot_word: chirp_common::BOOT_WORD_B,
    };
    let wire = info.to_bytes();
    assert_eq!(&wire[0..4], &COPY_NEW_IMAGE.to_le_bytes());
    assert_eq!(BootInfo::from_bytes(&wire).unwrap(), info);
    assert!(info.is_valid());
    assert!(BootInfo::normal().is_valid());
    assert_eq!(BootInfo::normal().magic, NORMAL_BOOT);
}

#[test]
fn boot_info_with_erased_magic_is_invalid() {
    let info = BootInfo::from_bytes(&[0xFF; BootInfo::WIRE_LEN]).unwrap();
    assert!(!info.is_valid());
}
