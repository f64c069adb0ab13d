// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Resumable OTA update engine for the Chirp dual-chip TWS audio SoC.
//!
//! The engine is hardware-agnostic: flash, the phone transport, the
//! inter-chip relay and the clock are injected as traits ([`hal`]), so the
//! whole thing runs unmodified against in-memory fakes in tests and against
//! the platform drivers on target.
//!
//! Component layering, bottom up:
//! - [`burn`] — sector-windowed flash write scheduling
//! - [`verify`] — segment / whole-image CRC checks and retry budget
//! - [`journal`] — persisted breakpoint log with challenge codes
//! - [`users`] — OTA target registry (firmware, language pack, ...)
//! - [`relay`] — master/slave verdict correlation
//! - [`session`] — the state machine tying it all together

#![cfg_attr(not(feature = "std"), no_std)]

pub mod burn;
pub mod error;
pub mod hal;
pub mod journal;
pub mod relay;
pub mod session;
pub mod users;
pub mod verify;

pub use error::OtaError;
pub use hal::{Clock, Flash, RelayLink, RelayOp, Transport};
pub use session::{
    transition_allowed, ChallengePolicy, DeviceInfo, OtaEngine, OtaSession, SessionState, TwsRole,
    OTA_PROTOCOL_VERSION,
};
pub use users::{OtaUser, OtaUserId, UserHooks, UserRegistry};
