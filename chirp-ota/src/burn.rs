// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Flash write scheduler.
//!
//! Incoming image bytes are buffered into one sector-sized window and burned
//! in sector-shaped flushes: a "pre" chunk completing the sector containing
//! the target offset (no erase, those cells are still blank from the
//! previous flush), whole middle sectors (erase then program), and a partial
//! trailing chunk in a freshly erased sector. Each physical sector is erased
//! at most once per flush.

use crate::error::OtaError;
use crate::hal::Flash;
use crate::users::OtaUserId;
use chirp_common::FLASH_SECTOR_SIZE;

const SECTOR: usize = FLASH_SECTOR_SIZE as usize;

fn sector_floor(offset: u32) -> u32 {
    offset & !(FLASH_SECTOR_SIZE - 1)
}

pub struct FlashBurner {
    window: [u8; SECTOR],
    fill: usize,
    user: OtaUserId,
    region_len: u32,
}

impl FlashBurner {
    pub const fn new() -> Self {
        Self {
            window: [0; SECTOR],
            fill: 0,
            user: OtaUserId::Firmware,
            region_len: 0,
        }
    }

    /// Point the burner at a user region. Discards any buffered bytes.
    pub fn bind(&mut self, user: OtaUserId, region_len: u32) {
        self.user = user;
        self.region_len = region_len;
        self.fill = 0;
    }

    pub fn fill(&self) -> usize {
        self.fill
    }

    pub fn is_full(&self) -> bool {
        self.fill == SECTOR
    }

    /// Drop buffered, unflushed bytes (abort, rollback).
    pub fn discard(&mut self) {
        self.fill = 0;
    }

    /// Buffer bytes up to the window boundary; returns how many were taken.
    pub fn stage(&mut self, bytes: &[u8]) -> usize {
        let take = bytes.len().min(SECTOR - self.fill);
        self.window[self.fill..self.fill + take].copy_from_slice(&bytes[..take]);
        self.fill += take;
        take
    }

    /// Burn the buffered window at region-relative offset `at` and reset it.
    /// Returns the number of bytes written.
    pub fn flush<F: Flash>(&mut self, flash: &mut F, at: u32) -> Result<u32, OtaError> {
        let len = self.fill as u32;
        if len == 0 {
            return Ok(0);
        }
        if at.checked_add(len).map_or(true, |end| end > self.region_len) {
            return Err(OtaError::FlashBounds(at));
        }

        let mut offset = at;
        let mut rest = &self.window[..self.fill];

        // pre: complete the sector we are already inside
        let into_sector = (offset % FLASH_SECTOR_SIZE) as usize;
        if into_sector != 0 {
            let pre = rest.len().min(SECTOR - into_sector);
            flash.program(self.user, offset, &rest[..pre])?;
            offset += pre as u32;
            rest = &rest[pre..];
        }

        // middle and post: each starts a fresh sector
        while !rest.is_empty() {
            let chunk = rest.len().min(SECTOR);
            flash.erase_sector(self.user, offset)?;
            flash.program(self.user, offset, &rest[..chunk])?;
            offset += chunk as u32;
            rest = &rest[chunk..];
        }

        self.fill = 0;
        Ok(len)
    }

    /// Roll a failed segment back: erase the sectors covering
    /// `[checkpoint, high_water)` while preserving the confirmed bytes that
    /// share the checkpoint's sector, so the retransmission lands on blank
    /// cells again.
    pub fn rollback<F: Flash>(
        &mut self,
        flash: &mut F,
        checkpoint: u32,
        high_water: u32,
    ) -> Result<(), OtaError> {
        self.fill = 0;
        if high_water <= checkpoint {
            return Ok(());
        }
        if high_water > self.region_len {
            return Err(OtaError::FlashBounds(high_water));
        }

        let first = sector_floor(checkpoint);
        let head_len = (checkpoint - first) as usize;
        let mut head = [0u8; SECTOR];
        if head_len != 0 {
            flash.read(self.user, first, &mut head[..head_len])?;
        }

        let mut sector = first;
        while sector < high_water {
            flash.erase_sector(self.user, sector)?;
            sector += FLASH_SECTOR_SIZE;
        }

        if head_len != 0 {
            flash.program(self.user, first, &head[..head_len])?;
        }
        Ok(())
    }
}

impl Default for FlashBurner {
    fn default() -> Self {
        Self::new()
    }
}
