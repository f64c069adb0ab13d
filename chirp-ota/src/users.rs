// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! OTA user registry.
//!
//! Every subsystem that can be an OTA target registers once at boot with its
//! flash region and lifecycle hooks. Exactly one user is "current" per
//! session, selected by `SET_USER` (TLV dialect) or defaulting to firmware.

use crate::error::OtaError;
use heapless::Vec;

pub const MAX_USERS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum OtaUserId {
    Firmware = 0,
    LanguagePackage = 1,
    ComboFirmware = 2,
    UserDataPool = 3,
    // internal regions, never selectable from the wire
    BootInfo = 4,
    UpgradeLog = 5,
}

impl OtaUserId {
    /// Map a `SET_USER` code. Internal regions are not selectable.
    pub fn from_wire(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Firmware),
            1 => Some(Self::LanguagePackage),
            2 => Some(Self::ComboFirmware),
            3 => Some(Self::UserDataPool),
            _ => None,
        }
    }

    /// Firmware-class images get the boot-header and tail key-word checks on
    /// top of the whole-image CRC.
    pub fn is_firmware(self) -> bool {
        matches!(self, Self::Firmware | Self::ComboFirmware)
    }
}

/// Lifecycle notifications a user may register. All optional.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserHooks {
    /// A transfer for this user just entered `Configuring`.
    pub on_start: Option<fn()>,
    /// The whole image is staged and verified (offset, size).
    pub on_reception_done: Option<fn(u32, u32)>,
    /// The image is about to be applied on reboot (offset, size).
    pub on_apply: Option<fn(u32, u32)>,
}

#[derive(Debug, Clone, Copy)]
pub struct OtaUser {
    pub id: OtaUserId,
    /// Absolute flash address of the region start (for BootInfo records).
    pub region_base: u32,
    pub region_len: u32,
    pub hooks: UserHooks,
}

impl OtaUser {
    /// A registration without lifecycle hooks.
    pub const fn new(id: OtaUserId, region_base: u32, region_len: u32) -> Self {
        Self {
            id,
            region_base,
            region_len,
            hooks: UserHooks {
                on_start: None,
                on_reception_done: None,
                on_apply: None,
            },
        }
    }
}

#[derive(Default)]
pub struct UserRegistry {
    users: Vec<OtaUser, MAX_USERS>,
}

impl UserRegistry {
    pub const fn new() -> Self {
        Self { users: Vec::new() }
    }

    /// Register a user. Rejects duplicate ids and regions overlapping an
    /// existing registration; regions are how exclusive flash ownership is
    /// enforced, so an overlap is a wiring bug, not a runtime condition.
    pub fn register(&mut self, user: OtaUser) -> Result<(), OtaError> {
        if self.lookup(user.id).is_some() {
            return Err(OtaError::RegionOverlap);
        }
        let end = user.region_base.saturating_add(user.region_len);
        for existing in &self.users {
            let existing_end = existing.region_base.saturating_add(existing.region_len);
            if user.region_base < existing_end && existing.region_base < end {
                return Err(OtaError::RegionOverlap);
            }
        }
        self.users
            .push(user)
            .map_err(|_| OtaError::RegionOverlap)?;
        Ok(())
    }

    pub fn lookup(&self, id: OtaUserId) -> Option<&OtaUser> {
        self.users.iter().find(|u| u.id == id)
    }
}
