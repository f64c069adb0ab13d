// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

use chirp_common::protocol::DecodeError;
use thiserror::Error;

/// Engine-level failures.
///
/// Protocol-shaped problems (bad packets, out-of-sequence commands) never
/// surface here; those are answered on the wire with a result code and the
/// session carries on. `OtaError` is for the boundaries underneath the
/// session: flash, transports, the inter-chip link, and broken invariants.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OtaError {
    #[error("malformed packet: {0}")]
    Decode(#[from] DecodeError),

    #[error("flash operation failed")]
    Flash,

    #[error("offset 0x{0:08x} falls outside the active flash region")]
    FlashBounds(u32),

    #[error("transport write failed")]
    Transport,

    #[error("inter-chip relay send failed")]
    Relay,

    #[error("no user registered for code {0}")]
    UnknownUser(u8),

    #[error("flash region overlaps an existing registration")]
    RegionOverlap,

    #[error("relay mailbox awaits 0x{expected:02x}, got 0x{got:02x}")]
    MailboxMismatch { expected: u8, got: u8 },
}
