// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Command-line interface definitions.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::commands;
use crate::transport::Transport;

/// Command-line arguments.
#[derive(Parser)]
#[command(name = "chirp-upload")]
#[command(about = "OTA upload tool for Chirp TWS devices")]
pub struct Cli {
    /// Serial port (e.g., /dev/ttyACM0)
    #[arg(short, long)]
    pub port: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Query firmware and OTA protocol versions
    Version,

    /// Upload a firmware image, resuming a previous attempt when possible
    Upload {
        /// Firmware binary file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// OTA user (0 = firmware, 1 = language pack, 2 = combo, 3 = user data)
        #[arg(short, long, default_value = "0")]
        user: u8,

        /// Bytes per verified segment (multiple of 256)
        #[arg(short, long, default_value = "4096")]
        segment_len: u32,

        /// Ignore any persisted breakpoint and restart from byte 0
        #[arg(long)]
        no_resume: bool,
    },

    /// Apply a fully verified image and reboot the device
    Apply,

    /// Dump a range of the staged flash region to a file
    ReadFlash {
        /// Start offset in hex, relative to the user region
        #[arg(value_name = "ADDR", value_parser = parse_hex_u32)]
        addr: u32,

        /// Number of bytes to read
        #[arg(value_name = "LEN", value_parser = parse_hex_u32)]
        len: u32,

        /// Output file
        #[arg(value_name = "OUTPUT")]
        output: PathBuf,
    },
}

/// Parse a hex string (with or without 0x prefix) into a u32.
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(s, 16).map_err(|e| format!("invalid hex value: {e}"))
}

/// Execute the parsed CLI command.
pub fn run(cli: Cli) -> Result<()> {
    let mut transport = Transport::new(&cli.port)?;

    match cli.command {
        Commands::Version => commands::version(&mut transport),
        Commands::Upload {
            file,
            user,
            segment_len,
            no_resume,
        } => commands::upload(&mut transport, &file, user, segment_len, no_resume),
        Commands::Apply => commands::apply(&mut transport),
        Commands::ReadFlash { addr, len, output } => {
            commands::read_flash(&mut transport, addr, len, &output)
        }
    }
}
