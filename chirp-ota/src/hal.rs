// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Hardware boundaries the engine is injected with.
//!
//! The engine never touches memory-mapped flash, BT stacks or the
//! inter-chip channel directly. Everything below is a trait implemented by
//! the firmware platform layer on target and by in-memory fakes in tests.

use crate::error::OtaError;
use crate::users::OtaUserId;

/// Flash access, addressed per registered user region.
///
/// Offsets are relative to the user's region base. Erase granularity is one
/// sector ([`chirp_common::FLASH_SECTOR_SIZE`]); `program` may span pages but
/// never an erase. Calls are synchronous and may block for milliseconds.
pub trait Flash {
    fn read(&mut self, user: OtaUserId, offset: u32, buf: &mut [u8]) -> Result<(), OtaError>;
    fn program(&mut self, user: OtaUserId, offset: u32, bytes: &[u8]) -> Result<(), OtaError>;
    fn erase_sector(&mut self, user: OtaUserId, offset: u32) -> Result<(), OtaError>;
    /// Drain any write-behind the driver keeps. Called before verify reads.
    fn flush_pending(&mut self) -> Result<(), OtaError>;
}

/// Outbound half of the phone-facing transport (BLE or SPP).
pub trait Transport {
    fn transmit(&mut self, bytes: &[u8]) -> Result<(), OtaError>;
}

/// Opcodes on the inter-chip channel between the two earbuds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum RelayOp {
    /// A phone command forwarded verbatim (payload = encoded packet).
    Packet = 0,
    /// A relayed verdict: `[rsp_type, code]`.
    Result = 1,
    /// A relayed breakpoint: `[breakpoint u32 LE, challenge[32]]`.
    Breakpoint = 2,
    /// Role-switch handshake, empty payload.
    RoleSwitch = 3,
}

/// Outbound half of the inter-chip channel.
pub trait RelayLink {
    fn send(&mut self, op: RelayOp, payload: &[u8]) -> Result<(), OtaError>;
}

/// Monotonic milliseconds, for relay timeouts, role-switch deferral and
/// challenge seeding.
pub trait Clock {
    fn now_ms(&self) -> u64;
}
