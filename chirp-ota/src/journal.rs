// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Resume/breakpoint store, persisted in the dedicated upgrade-log sector.
//!
//! Sector layout:
//! ```text
//! 0    challenge code          [u8; 32]
//! 32   total image size        u32 LE
//! 36   whole-image CRC32       u32 LE
//! 40.. checkpoint words        u32 LE, append-only, 0xFFFF_FFFF = free
//! ```
//! Checkpoints are cumulative received-byte counts, one per confirmed
//! segment, monotonically increasing up to the first erased word. When the
//! array is exhausted the head is carried over a full-sector erase and the
//! array restarts.

use crate::error::OtaError;
use crate::hal::Flash;
use crate::users::OtaUserId;
use chirp_common::protocol::CHALLENGE_LEN;
use chirp_common::FLASH_SECTOR_SIZE;

const LOG_USER: OtaUserId = OtaUserId::UpgradeLog;

pub const CHALLENGE_OFFSET: u32 = 0;
pub const TOTAL_SIZE_OFFSET: u32 = 32;
pub const IMAGE_CRC_OFFSET: u32 = 36;
pub const CHECKPOINTS_OFFSET: u32 = 40;
pub const ERASED_WORD: u32 = 0xFFFF_FFFF;

const CHECKPOINT_SLOTS: u32 = (FLASH_SECTOR_SIZE - CHECKPOINTS_OFFSET) / 4;
const HEADER_LEN: usize = CHECKPOINTS_OFFSET as usize;

/// A 32-byte challenge of all 0xFF means "never written".
fn challenge_present(challenge: &[u8; CHALLENGE_LEN]) -> bool {
    challenge.iter().any(|&b| b != 0xFF)
}

fn read_word<F: Flash>(flash: &mut F, offset: u32) -> Result<u32, OtaError> {
    let mut buf = [0u8; 4];
    flash.read(LOG_USER, offset, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Stateless accessor over the upgrade-log sector. All state lives in flash
/// so a power loss at any point leaves at worst one unprogrammed checkpoint.
pub struct UpgradeJournal;

impl UpgradeJournal {
    /// Persisted challenge, or `None` when the log carries no session.
    pub fn read_challenge<F: Flash>(
        flash: &mut F,
    ) -> Result<Option<[u8; CHALLENGE_LEN]>, OtaError> {
        let mut challenge = [0u8; CHALLENGE_LEN];
        flash.read(LOG_USER, CHALLENGE_OFFSET, &mut challenge)?;
        Ok(challenge_present(&challenge).then_some(challenge))
    }

    /// Persisted (total size, image CRC) header, `None` when unwritten.
    pub fn read_header<F: Flash>(flash: &mut F) -> Result<Option<(u32, u32)>, OtaError> {
        let total = read_word(flash, TOTAL_SIZE_OFFSET)?;
        let crc = read_word(flash, IMAGE_CRC_OFFSET)?;
        if total == ERASED_WORD && crc == ERASED_WORD {
            return Ok(None);
        }
        Ok(Some((total, crc)))
    }

    /// Start a fresh session log: erase the sector and program challenge and
    /// header in one pass. Any previous checkpoints are gone.
    pub fn write_session<F: Flash>(
        flash: &mut F,
        challenge: &[u8; CHALLENGE_LEN],
        total_size: u32,
        image_crc: u32,
    ) -> Result<(), OtaError> {
        flash.erase_sector(LOG_USER, 0)?;
        let mut head = [0xFFu8; HEADER_LEN];
        head[..CHALLENGE_LEN].copy_from_slice(challenge);
        head[TOTAL_SIZE_OFFSET as usize..TOTAL_SIZE_OFFSET as usize + 4]
            .copy_from_slice(&total_size.to_le_bytes());
        head[IMAGE_CRC_OFFSET as usize..IMAGE_CRC_OFFSET as usize + 4]
            .copy_from_slice(&image_crc.to_le_bytes());
        flash.program(LOG_USER, 0, &head)
    }

    /// Program the (total size, image CRC) header words. The cells must
    /// still be erased; a changed image goes through `invalidate` first.
    pub fn write_header<F: Flash>(
        flash: &mut F,
        total_size: u32,
        image_crc: u32,
    ) -> Result<(), OtaError> {
        flash.program(LOG_USER, TOTAL_SIZE_OFFSET, &total_size.to_le_bytes())?;
        flash.program(LOG_USER, IMAGE_CRC_OFFSET, &image_crc.to_le_bytes())
    }

    /// Persist a freshly generated challenge. The whole sector is recycled:
    /// a new challenge marks a new transfer attempt, so checkpoints and
    /// header of the old one are dropped with it.
    pub fn write_challenge<F: Flash>(
        flash: &mut F,
        challenge: &[u8; CHALLENGE_LEN],
    ) -> Result<(), OtaError> {
        flash.erase_sector(LOG_USER, 0)?;
        flash.program(LOG_USER, CHALLENGE_OFFSET, challenge)
    }

    /// Largest confirmed checkpoint, or `None` for an empty/corrupt log.
    ///
    /// Programmed words form a prefix of the array, so the first erased slot
    /// is found by binary search rather than a 4 KiB scan.
    pub fn latest_checkpoint<F: Flash>(flash: &mut F) -> Result<Option<u32>, OtaError> {
        let used = Self::used_slots(flash)?;
        if used == 0 {
            return Ok(None);
        }
        let latest = read_word(flash, CHECKPOINTS_OFFSET + (used - 1) * 4)?;
        Ok(Some(latest))
    }

    /// Append one confirmed checkpoint. When the array is exhausted the
    /// header survives a full-sector erase and the array restarts.
    pub fn append_checkpoint<F: Flash>(flash: &mut F, received: u32) -> Result<(), OtaError> {
        let used = Self::used_slots(flash)?;
        if used == CHECKPOINT_SLOTS {
            let mut head = [0u8; HEADER_LEN];
            flash.read(LOG_USER, 0, &mut head)?;
            flash.erase_sector(LOG_USER, 0)?;
            flash.program(LOG_USER, 0, &head)?;
            return flash.program(LOG_USER, CHECKPOINTS_OFFSET, &received.to_le_bytes());
        }
        flash.program(
            LOG_USER,
            CHECKPOINTS_OFFSET + used * 4,
            &received.to_le_bytes(),
        )
    }

    /// Erase the whole log. The next resume query sees `(0, None)`.
    pub fn invalidate<F: Flash>(flash: &mut F) -> Result<(), OtaError> {
        flash.erase_sector(LOG_USER, 0)
    }

    fn used_slots<F: Flash>(flash: &mut F) -> Result<u32, OtaError> {
        let mut lo = 0u32;
        let mut hi = CHECKPOINT_SLOTS;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if read_word(flash, CHECKPOINTS_OFFSET + mid * 4)? == ERASED_WORD {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo)
    }
}

/// Linear-congruential challenge generator, seeded from the millisecond
/// clock at the moment a mismatched resume forces a fresh code.
pub struct ChallengeLcg {
    state: u32,
}

impl ChallengeLcg {
    pub fn new(seed: u32) -> Self {
        Self { state: seed }
    }

    fn next(&mut self) -> u32 {
        self.state = self.state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        self.state
    }

    pub fn fill(&mut self, out: &mut [u8; CHALLENGE_LEN]) {
        for chunk in out.chunks_exact_mut(4) {
            chunk.copy_from_slice(&self.next().to_le_bytes());
        }
    }
}
