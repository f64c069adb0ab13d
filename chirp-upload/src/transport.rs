// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Serial transport speaking the TLV packet encoding.
//!
//! A raw serial stream has no packet boundaries, so the tool always runs
//! the TLV dialect: the very first command sent is `GET_OTA_VERSION`, which
//! also switches the device over.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serialport::SerialPort;

use chirp_common::{Command, CommandQueue, PacketEncoding, Response};

const DEFAULT_TIMEOUT_MS: u64 = 2_000;

pub struct Transport {
    port: Box<dyn SerialPort>,
    port_name: String,
    queue: CommandQueue,
}

impl Transport {
    pub fn new(port_name: &str) -> Result<Self> {
        let port = serialport::new(port_name, 115_200)
            .timeout(Duration::from_millis(100))
            .open()
            .with_context(|| format!("Failed to open {}", port_name))?;
        Ok(Self {
            port,
            port_name: port_name.to_string(),
            queue: CommandQueue::new(),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn send(&mut self, command: &Command) -> Result<()> {
        let wire = command
            .encode(PacketEncoding::Tlv)
            .context("Failed to encode command")?;
        self.port.write_all(&wire)?;
        self.port.flush()?;
        Ok(())
    }

    /// Block until one complete response frame arrives.
    pub fn recv_timeout(&mut self, timeout_ms: u64) -> Result<Response> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut buf = [0u8; 1024];
        loop {
            if let Some(frame) = self.queue.next_frame() {
                return Response::decode(&frame).context("Device sent an undecodable frame");
            }
            if Instant::now() >= deadline {
                bail!("Timed out waiting for a response from the device");
            }
            match self.port.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => self
                    .queue
                    .push(&buf[..n])
                    .context("Response reassembly queue overflow")?,
                Err(e) if e.kind() == ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn send_recv(&mut self, command: &Command) -> Result<Response> {
        self.send_recv_timeout(command, DEFAULT_TIMEOUT_MS)
    }

    pub fn send_recv_timeout(&mut self, command: &Command, timeout_ms: u64) -> Result<Response> {
        self.send(command)?;
        self.recv_timeout(timeout_ms)
    }
}
