// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Segment and whole-image verification.
//!
//! CRCs are always recomputed from flash, never trusted from RAM: the bytes
//! that matter are the ones that were actually burned.

use crate::error::OtaError;
use crate::hal::Flash;
use crate::users::OtaUserId;
use chirp_common::protocol::CRC32;

/// A segment may fail its CRC this many times before the log is invalidated
/// and the transfer is forced back to byte 0.
pub const SEGMENT_VERIFY_RETRIES: u8 = 3;

/// Key word the build step appends near a firmware image's tail, followed
/// by 8 hex digits of the CRC over everything before those digits. Images
/// without it are the old format and skip the sanity comparison.
pub const SANITY_KEY_WORD: &[u8; 17] = b"CRC32_OF_IMAGE=0x";
/// How far back from the image end the key word is searched for.
pub const SANITY_SCAN_WINDOW: u32 = 512;

const SCRATCH: usize = 256;

/// Consecutive-failure budget for one segment.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    left: u8,
}

impl RetryBudget {
    pub const fn new() -> Self {
        Self {
            left: SEGMENT_VERIFY_RETRIES,
        }
    }

    pub fn reset(&mut self) {
        self.left = SEGMENT_VERIFY_RETRIES;
    }

    /// Record a failure; returns true once the budget is exhausted.
    pub fn fail(&mut self) -> bool {
        self.left = self.left.saturating_sub(1);
        self.left == 0
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new()
    }
}

/// CRC32 over `len` flash bytes starting at region-relative `start`.
pub fn region_crc<F: Flash>(
    flash: &mut F,
    user: OtaUserId,
    start: u32,
    len: u32,
) -> Result<u32, OtaError> {
    flash.flush_pending()?;
    let mut digest = CRC32.digest();
    let mut scratch = [0u8; SCRATCH];
    let mut offset = start;
    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(SCRATCH as u32) as usize;
        flash.read(user, offset, &mut scratch[..chunk])?;
        digest.update(&scratch[..chunk]);
        offset += chunk as u32;
        remaining -= chunk as u32;
    }
    Ok(digest.finalize())
}

/// First word of the staged image, as flashed.
pub fn image_first_word<F: Flash>(
    flash: &mut F,
    user: OtaUserId,
    image_start: u32,
) -> Result<u32, OtaError> {
    flash.flush_pending()?;
    let mut word = [0u8; 4];
    flash.read(user, image_start, &mut word)?;
    Ok(u32::from_le_bytes(word))
}

/// Whole-image CRC per the staging convention: the boot-header word at the
/// image start is taken as FF FF FF FF no matter what the flash holds, and
/// the peer substitutes the same way on its side.
pub fn staged_image_crc<F: Flash>(
    flash: &mut F,
    user: OtaUserId,
    image_start: u32,
    image_size: u32,
) -> Result<u32, OtaError> {
    if image_size <= 4 {
        return region_crc(flash, user, image_start, image_size);
    }
    flash.flush_pending()?;
    let mut digest = CRC32.digest();
    digest.update(&[0xFF; 4]);
    let mut scratch = [0u8; SCRATCH];
    let mut offset = image_start + 4;
    let mut remaining = image_size - 4;
    while remaining > 0 {
        let chunk = remaining.min(SCRATCH as u32) as usize;
        flash.read(user, offset, &mut scratch[..chunk])?;
        digest.update(&scratch[..chunk]);
        offset += chunk as u32;
        remaining -= chunk as u32;
    }
    Ok(digest.finalize())
}

fn parse_hex_u32(digits: &[u8]) -> Option<u32> {
    let mut value = 0u32;
    for &b in digits {
        let d = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return None,
        };
        value = (value << 4) | d as u32;
    }
    Some(value)
}

/// Tail sanity check for firmware-class images: find [`SANITY_KEY_WORD`],
/// parse the 8 hex digits after it and compare against the CRC of the image
/// up to and including the key word. A missing key word passes (old image
/// format); a present but unparseable or mismatching one fails.
pub fn sanity_crc_ok<F: Flash>(
    flash: &mut F,
    user: OtaUserId,
    image_start: u32,
    image_size: u32,
) -> Result<bool, OtaError> {
    let window = image_size.min(SANITY_SCAN_WINDOW);
    if (window as usize) < SANITY_KEY_WORD.len() {
        return Ok(true);
    }
    flash.flush_pending()?;
    let mut tail = [0u8; SANITY_SCAN_WINDOW as usize];
    let tail = &mut tail[..window as usize];
    flash.read(user, image_start + image_size - window, tail)?;

    let Some(idx) = tail
        .windows(SANITY_KEY_WORD.len())
        .rposition(|w| w == SANITY_KEY_WORD)
    else {
        return Ok(true);
    };
    let digits_at = idx + SANITY_KEY_WORD.len();
    let Some(digits) = tail.get(digits_at..digits_at + 8) else {
        return Ok(false);
    };
    let Some(expected) = parse_hex_u32(digits) else {
        return Ok(false);
    };

    // everything before the digits themselves is covered
    let covered = image_size - window + digits_at as u32;
    let actual = region_crc(flash, user, image_start, covered)?;
    Ok(actual == expected)
}
