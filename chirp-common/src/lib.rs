// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Common wire-protocol types for the Chirp TWS OTA engine.
//!
//! This crate supports both `no_std` (embedded) and `std` (host) environments:
//! - Default: `no_std` mode for the earbud firmware
//! - `std` feature: Enables `std` support for host tools
//! - `defmt` feature: Adds `defmt::Format` derives to public types

#![cfg_attr(not(feature = "std"), no_std)]

pub mod protocol;
pub mod queue;

// Re-export commonly used types
pub use protocol::{Command, DecodeError, FlowConfiguration, PacketEncoding, Response};
pub use protocol::{BootInfo, OtaResult};
pub use protocol::{
    BOOT_WORD_A, BOOT_WORD_B, COPY_NEW_IMAGE, FLASH_SECTOR_SIZE, MIN_SEGMENT_ALIGN, NORMAL_BOOT,
    START_MAGIC,
};
pub use queue::CommandQueue;
