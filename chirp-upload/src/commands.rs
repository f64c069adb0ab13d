// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Command implementations for the OTA flow.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use crc::{Crc, CRC_32_ISO_HDLC};
use heapless::Vec as HVec;
use indicatif::{ProgressBar, ProgressStyle};

use chirp_common::protocol::{
    resume_request_crc, resume_response_crc, CHALLENGE_LEN, MAX_DATA_PAYLOAD,
};
use chirp_common::{Command, FlowConfiguration, NORMAL_BOOT, OtaResult, Response, START_MAGIC};
use chirp_ota::verify::{SANITY_KEY_WORD, SANITY_SCAN_WINDOW};
use chirp_ota::OTA_PROTOCOL_VERSION;

use crate::transport::Transport;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const SEGMENT_RETRIES: u32 = 3;

/// Switch the device to the TLV dialect and return its protocol version.
fn handshake(transport: &mut Transport) -> Result<[u8; 4]> {
    let response = transport.send_recv(&Command::GetOtaVersion {
        version: OTA_PROTOCOL_VERSION,
    })?;
    match response {
        Response::GetOtaVersionRsp { version } => Ok(version),
        _ => bail!("Unexpected handshake response: {:?}", response),
    }
}

fn describe_result(code: u8) -> &'static str {
    match code {
        c if c == OtaResult::Ok as u8 => "ok",
        c if c == OtaResult::ErrRecvSize as u8 => "device received more bytes than announced",
        c if c == OtaResult::ErrFlashOffset as u8 => "write offset outside the flash region",
        c if c == OtaResult::ErrSegVerify as u8 => "segment verification failed repeatedly",
        c if c == OtaResult::ErrBreakpoint as u8 => "persisted breakpoint is invalid",
        c if c == OtaResult::ErrImageSize as u8 => "image exceeds the device's flash region",
        _ => "transfer failed",
    }
}

/// Query firmware and OTA protocol versions.
pub fn version(transport: &mut Transport) -> Result<()> {
    let protocol = handshake(transport)?;
    println!(
        "OTA protocol: {}.{}.{}.{}",
        protocol[0], protocol[1], protocol[2], protocol[3]
    );

    let response = transport.send_recv(&Command::GetVersion { magic: START_MAGIC })?;
    match response {
        Response::VersionRsp {
            device_type,
            left_fw,
            right_fw,
            ..
        } => {
            println!("Device type:  {}", device_type);
            println!(
                "Left FW:      {}.{}.{}.{}",
                left_fw[0], left_fw[1], left_fw[2], left_fw[3]
            );
            println!(
                "Right FW:     {}.{}.{}.{}",
                right_fw[0], right_fw[1], right_fw[2], right_fw[3]
            );
        }
        _ => bail!("Unexpected response: {:?}", response),
    }
    Ok(())
}

/// The device challenge is cached next to the image so an interrupted
/// upload can prove it belongs to the same transfer attempt.
fn challenge_path(file: &Path) -> PathBuf {
    let mut path = file.to_path_buf();
    path.set_extension("resume");
    path
}

/// A throwaway challenge for the first contact with a device.
fn local_challenge() -> [u8; CHALLENGE_LEN] {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let mut state = nanos ^ 0x6368_6972;
    let mut out = [0u8; CHALLENGE_LEN];
    for chunk in out.chunks_exact_mut(4) {
        state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        chunk.copy_from_slice(&state.to_le_bytes());
    }
    out
}

/// Validate the build-time tail key word before burning airtime on a
/// transfer the device would fail at the end. Images without the key word
/// are the old format and get no local check.
fn check_sanity_key_word(firmware: &[u8]) -> Result<()> {
    let window = firmware.len().min(SANITY_SCAN_WINDOW as usize);
    let tail = &firmware[firmware.len() - window..];
    let Some(idx) = tail
        .windows(SANITY_KEY_WORD.len())
        .rposition(|w| w == SANITY_KEY_WORD)
    else {
        println!("note: image carries no tail CRC key word (old format)");
        return Ok(());
    };
    let digits_at = idx + SANITY_KEY_WORD.len();
    let digits = tail
        .get(digits_at..digits_at + 8)
        .context("Tail CRC key word is truncated")?;
    let text = std::str::from_utf8(digits).ok();
    let expected = text
        .and_then(|t| u32::from_str_radix(t, 16).ok())
        .context("Tail CRC digits are not valid hex")?;
    let covered = firmware.len() - window + digits_at;
    let actual = CRC32.checksum(&firmware[..covered]);
    if actual != expected {
        bail!(
            "Tail CRC 0x{:08x} does not match the image content (0x{:08x})",
            expected,
            actual
        );
    }
    Ok(())
}

/// Negotiate a breakpoint with the device; returns the offset to resume at.
fn negotiate_resume(transport: &mut Transport, file: &Path, segment_len: u32) -> Result<u32> {
    let cache = challenge_path(file);
    let challenge: [u8; CHALLENGE_LEN] = match fs::read(&cache) {
        Ok(bytes) if bytes.len() == CHALLENGE_LEN => bytes.try_into().unwrap(),
        _ => local_challenge(),
    };

    let response = transport.send_recv(&Command::ResumeVerify {
        magic: START_MAGIC,
        challenge,
        segment_size: segment_len,
        crc32: resume_request_crc(&challenge, segment_len),
    })?;
    let Response::ResumeVerifyRsp {
        breakpoint,
        challenge: device_challenge,
        crc32,
    } = response
    else {
        bail!("Unexpected resume response: {:?}", response);
    };
    if crc32 != resume_response_crc(breakpoint, &device_challenge) {
        bail!("Resume response failed its CRC check");
    }
    if breakpoint == u32::MAX {
        bail!("Device rejected the resume request as malformed");
    }

    fs::write(&cache, device_challenge)
        .with_context(|| format!("Failed to cache challenge at {}", cache.display()))?;
    if breakpoint > 0 {
        println!("Resuming previous transfer at byte {}", breakpoint);
    }
    Ok(breakpoint)
}

/// Upload a firmware image.
pub fn upload(
    transport: &mut Transport,
    file: &Path,
    user: u8,
    segment_len: u32,
    no_resume: bool,
) -> Result<()> {
    if segment_len == 0 || segment_len % 256 != 0 {
        bail!("Segment length must be a non-zero multiple of 256");
    }
    let firmware = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let size = firmware.len() as u32;

    let firmware_user = user == 0 || user == 2;
    let crc32 = if firmware_user {
        if firmware.len() < 4 || firmware[..4] != NORMAL_BOOT.to_le_bytes() {
            bail!("Image does not start with a boot header; the device would refuse it");
        }
        check_sanity_key_word(&firmware)?;
        // the device substitutes the boot-header word with erased flash
        let mut digest = CRC32.digest();
        digest.update(&[0xFF; 4]);
        digest.update(&firmware[4..]);
        digest.finalize()
    } else {
        CRC32.checksum(&firmware)
    };
    println!(
        "Image: {} ({} bytes, CRC32: 0x{:08x})",
        file.display(),
        size,
        crc32
    );

    handshake(transport)?;
    if user != 0 {
        match transport.send_recv(&Command::SetUser { user })? {
            Response::SetUserRsp { result: true } => {}
            Response::SetUserRsp { result: false } => bail!("Device refused user {}", user),
            other => bail!("Unexpected response: {:?}", other),
        }
    }

    let start_offset = if no_resume {
        0
    } else {
        negotiate_resume(transport, file, segment_len)?
    };

    let response = transport.send_recv(&Command::Start {
        magic: START_MAGIC,
        image_size: size,
        image_crc32: crc32,
    })?;
    let mtu = match response {
        Response::StartRsp { mtu, .. } => (mtu as usize).min(MAX_DATA_PAYLOAD),
        Response::ResultRsp { result } => bail!("Start rejected: {}", describe_result(result)),
        other => bail!("Unexpected response: {:?}", other),
    };

    let cfg = FlowConfiguration::default().seal();
    match transport.send_recv(&Command::Config {
        fragment: HVec::from_slice(&cfg.to_bytes()).unwrap(),
    })? {
        Response::ConfigRsp { done: true } => {}
        Response::ConfigRsp { done: false } => bail!("Device rejected the configuration"),
        Response::ResultRsp { result } => bail!("Config rejected: {}", describe_result(result)),
        other => bail!("Unexpected response: {:?}", other),
    }

    let pb = ProgressBar::new(size as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            )?
            .progress_chars("#>-"),
    );
    pb.set_position(start_offset as u64);

    let mut offset = start_offset as usize;
    while offset < firmware.len() {
        let end = (offset + segment_len as usize).min(firmware.len());
        let segment = &firmware[offset..end];
        let segment_crc = CRC32.checksum(segment);

        let mut attempts = 0;
        loop {
            for chunk in segment.chunks(mtu) {
                match transport.send_recv(&Command::Data {
                    bytes: HVec::from_slice(chunk).unwrap(),
                })? {
                    Response::DataAck => {}
                    Response::ResultRsp { result } => {
                        pb.abandon();
                        bail!("Data rejected at offset {}: {}", offset, describe_result(result));
                    }
                    other => {
                        pb.abandon();
                        bail!("Unexpected response at offset {}: {:?}", offset, other);
                    }
                }
            }
            match transport.send_recv_timeout(
                &Command::SegmentVerify {
                    magic: START_MAGIC,
                    segment_crc32: segment_crc,
                },
                10_000,
            )? {
                Response::SegmentVerifyRsp { pass: true } => break,
                Response::SegmentVerifyRsp { pass: false } => {
                    attempts += 1;
                    if attempts >= SEGMENT_RETRIES {
                        pb.abandon();
                        bail!("Segment at offset {} failed {} times", offset, attempts);
                    }
                    pb.println(format!("segment at offset {} failed, retrying", offset));
                }
                Response::ResultRsp { result } => {
                    pb.abandon();
                    bail!("Transfer aborted: {}", describe_result(result));
                }
                other => {
                    pb.abandon();
                    bail!("Unexpected response: {:?}", other);
                }
            }
        }
        offset = end;
        pb.set_position(offset as u64);
    }
    pb.finish_with_message("Transfer complete");

    print!("Verifying whole image... ");
    std::io::stdout().flush()?;
    match transport.send_recv_timeout(&Command::GetResult, 30_000)? {
        Response::ResultRsp { result } if result == OtaResult::Ok as u8 => println!("OK"),
        Response::ResultRsp { result } => bail!("{}", describe_result(result)),
        other => bail!("Unexpected response: {:?}", other),
    }

    // the transfer attempt is over, its challenge is useless now
    let _ = fs::remove_file(challenge_path(file));

    println!();
    println!("Image staged and verified on the device.");
    println!(
        "Use 'chirp-upload --port {} apply' to apply it and reboot.",
        transport.port_name()
    );
    Ok(())
}

/// Apply a fully verified image and reboot the device.
pub fn apply(transport: &mut Transport) -> Result<()> {
    handshake(transport)?;
    print!("Applying image... ");
    std::io::stdout().flush()?;

    match transport.send_recv_timeout(&Command::ImageApply { magic: START_MAGIC }, 10_000)? {
        Response::ImageApplyRsp { success: true } => {
            println!("OK");
            println!("Device is rebooting into the new image.");
        }
        Response::ImageApplyRsp { success: false } => {
            bail!("Device refused to apply (no verified image pending?)")
        }
        other => bail!("Unexpected response: {:?}", other),
    }
    Ok(())
}

/// Dump a range of the staged flash region to a file.
pub fn read_flash(transport: &mut Transport, addr: u32, len: u32, output: &Path) -> Result<()> {
    handshake(transport)?;
    transport.send(&Command::ReadFlash {
        start: true,
        addr,
        len,
    })?;

    let mut collected = Vec::with_capacity(len as usize);
    while (collected.len() as u32) < len {
        match transport.recv_timeout(5_000)? {
            Response::FlashContent { ok: true, bytes } => collected.extend_from_slice(&bytes),
            Response::FlashContent { ok: false, .. } => {
                bail!("Requested range lies outside the flash region")
            }
            other => bail!("Unexpected response: {:?}", other),
        }
    }

    fs::write(output, &collected)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Wrote {} bytes to {}", collected.len(), output.display());
    Ok(())
}
