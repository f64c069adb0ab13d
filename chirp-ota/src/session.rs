// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! The OTA session state machine and its surrounding engine.
//!
//! One [`OtaEngine`] exists per device, owning every mutable piece of the
//! transfer: session counters, the sector write window, the TLV reassembly
//! queue and the relay mailbox. It runs entirely on the callback that
//! delivers transport bytes; flash calls are synchronous and nothing here
//! is re-entrant.

use crate::burn::FlashBurner;
use crate::error::OtaError;
use crate::hal::{Clock, Flash, RelayLink, RelayOp, Transport};
use crate::journal::{ChallengeLcg, UpgradeJournal};
use crate::relay::{failure_response, RelayCoordinator, RoleSwitchGuard, Verdict};
use crate::users::{OtaUser, OtaUserId, UserRegistry};
use crate::verify::{image_first_word, region_crc, sanity_crc_ok, staged_image_crc, RetryBudget};
use chirp_common::protocol::{
    resume_request_crc, resume_response_crc, type_code, CHALLENGE_LEN, MAX_BLE_DATA_PAYLOAD,
    MAX_DATA_PAYLOAD, MAX_SPP_DATA_PAYLOAD,
};
use chirp_common::{
    BootInfo, Command, CommandQueue, FlowConfiguration, OtaResult, PacketEncoding, Response,
    BOOT_WORD_A, BOOT_WORD_B, COPY_NEW_IMAGE, MIN_SEGMENT_ALIGN, NORMAL_BOOT, START_MAGIC,
};
use heapless::Vec;

/// This engine's protocol revision, reported to `GET_OTA_VERSION`.
pub const OTA_PROTOCOL_VERSION: [u8; 4] = [2, 0, 0, 0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TwsRole {
    /// Single device, no peer: answers the phone alone.
    #[default]
    Freeman,
    /// Phone-facing side: processes locally, forwards to the slave,
    /// composes combined responses.
    Master,
    /// Peer-facing side: driven over the inter-chip channel only.
    Slave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionState {
    #[default]
    Idle,
    Configuring,
    Transferring,
    VerifyingSegment,
    VerifyingImage,
    Applying,
}

/// The legal state transitions. Everything may fall back to `Idle`.
pub fn transition_allowed(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;
    if to == Idle {
        return true;
    }
    matches!(
        (from, to),
        (Idle, Configuring)
            | (Configuring, Transferring)
            | (Transferring, VerifyingSegment)
            | (VerifyingSegment, Transferring)
            | (Transferring, VerifyingImage)
            | (VerifyingImage, Applying)
    )
}

/// Who generates a fresh challenge code when a resume request mismatches.
/// The protocol itself is symmetric; keeping this pluggable lets a product
/// pin generation to one side if its phone application expects that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChallengePolicy {
    /// Generate and persist a new code locally (default, symmetric).
    #[default]
    Generate,
    /// Never generate here; reply with the stored code (or zeroes) and
    /// breakpoint 0, leaving generation to the peer.
    Defer,
}

/// Static device identity reported over the wire.
#[derive(Debug, Clone, Copy)]
pub struct DeviceInfo {
    pub sw_version: u16,
    pub hw_version: u16,
    pub device_type: u8,
    /// 0 = both, 1 = left, 2 = right; `SIDE_SELECT` succeeds on a match.
    pub side: u8,
    pub left_fw: [u8; 4],
    pub right_fw: [u8; 4],
}

/// All mutable per-transfer state, reset on abort, apply or fatal error.
#[derive(Debug, Default)]
pub struct OtaSession {
    state: SessionState,
    encoding: PacketEncoding,
    via_ble: bool,
    current_user: Option<OtaUserId>,
    total_image_size: u32,
    image_crc32: u32,
    received: u32,
    /// Region-relative offset the next flush lands at.
    program_offset: u32,
    /// Region-relative offset the image starts at (`start_write_offset`).
    image_base: u32,
    segment_start_offset: u32,
    segment_start_received: u32,
    retries: RetryBudget,
    pending_apply: bool,
    /// Breakpoint accepted by `RESUME_VERIFY`, consumed by `CONFIG`.
    resume_received: Option<u32>,
    config_buf: Vec<u8, { FlowConfiguration::WIRE_LEN }>,
    config: Option<FlowConfiguration>,
}

impl OtaSession {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn encoding(&self) -> PacketEncoding {
        self.encoding
    }

    pub fn in_progress(&self) -> bool {
        self.state != SessionState::Idle
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn total_image_size(&self) -> u32 {
        self.total_image_size
    }

    pub fn pending_apply(&self) -> bool {
        self.pending_apply
    }

    pub fn configuration(&self) -> Option<&FlowConfiguration> {
        self.config.as_ref()
    }

    fn set_state(&mut self, to: SessionState) {
        if !transition_allowed(self.state, to) {
            log::warn!("illegal session transition {:?} -> {:?}", self.state, to);
        }
        self.state = to;
    }

    /// Back to `Idle`, keeping only what outlives a transfer: the wire
    /// encoding and the selected user.
    fn reset_transfer(&mut self) {
        let encoding = self.encoding;
        let current_user = self.current_user;
        let via_ble = self.via_ble;
        *self = OtaSession::default();
        self.encoding = encoding;
        self.current_user = current_user;
        self.via_ble = via_ble;
    }
}

/// Response types the master must pair with a slave verdict before
/// answering the phone.
fn correlated_rsp_type(cmd: &Command) -> Option<u8> {
    match cmd {
        Command::SegmentVerify { .. } => Some(type_code::SEGMENT_VERIFY_RSP),
        Command::GetResult => Some(type_code::RESULT_RSP),
        Command::ImageApply { .. } => Some(type_code::IMAGE_APPLY_RSP),
        Command::ResumeVerify { .. } => Some(type_code::RESUME_VERIFY_RSP),
        _ => None,
    }
}

fn verdict_of(rsp: &Response) -> Option<Verdict> {
    match rsp {
        Response::SegmentVerifyRsp { pass } => Some(Verdict::Code(*pass as u8)),
        Response::ResultRsp { result } => Some(Verdict::Code(*result)),
        Response::ImageApplyRsp { success } => Some(Verdict::Code(*success as u8)),
        Response::ResumeVerifyRsp {
            breakpoint,
            challenge,
            ..
        } => Some(Verdict::Breakpoint {
            breakpoint: *breakpoint,
            challenge: *challenge,
        }),
        _ => None,
    }
}

pub struct OtaEngine<F, T, R, C> {
    flash: F,
    transport: T,
    relay: R,
    clock: C,
    info: DeviceInfo,
    role: TwsRole,
    challenge_policy: ChallengePolicy,
    registry: UserRegistry,
    session: OtaSession,
    burner: FlashBurner,
    queue: CommandQueue,
    mailbox: RelayCoordinator,
    role_guard: RoleSwitchGuard,
    reboot_pending: bool,
}

impl<F, T, R, C> OtaEngine<F, T, R, C>
where
    F: Flash,
    T: Transport,
    R: RelayLink,
    C: Clock,
{
    pub fn new(flash: F, transport: T, relay: R, clock: C, info: DeviceInfo) -> Self {
        Self {
            flash,
            transport,
            relay,
            clock,
            info,
            role: TwsRole::default(),
            challenge_policy: ChallengePolicy::default(),
            registry: UserRegistry::new(),
            session: OtaSession::default(),
            burner: FlashBurner::new(),
            queue: CommandQueue::new(),
            mailbox: RelayCoordinator::new(),
            role_guard: RoleSwitchGuard::new(),
            reboot_pending: false,
        }
    }

    pub fn set_role(&mut self, role: TwsRole) {
        self.role = role;
    }

    pub fn role(&self) -> TwsRole {
        self.role
    }

    pub fn set_challenge_policy(&mut self, policy: ChallengePolicy) {
        self.challenge_policy = policy;
    }

    pub fn register_user(&mut self, user: OtaUser) -> Result<(), OtaError> {
        self.registry.register(user)
    }

    pub fn session(&self) -> &OtaSession {
        &self.session
    }

    /// Set after a successful apply; the platform layer reboots when it
    /// sees this.
    pub fn reboot_pending(&self) -> bool {
        self.reboot_pending
    }

    /// Drop every in-flight buffer and return to `Idle`. The breakpoint log
    /// is left untouched so the transfer stays resumable.
    pub fn abort(&mut self) {
        log::info!("ota session aborted at {} bytes", self.session.received);
        self.burner.discard();
        self.queue.clear();
        self.mailbox.clear();
        self.session.reset_transfer();
    }

    /// Inbound phone transport bytes, one reliable ordered delivery per call.
    pub fn on_bytes_received(&mut self, raw: &[u8], via_ble: bool) -> Result<(), OtaError> {
        self.session.via_ble = via_ble;
        match self.session.encoding {
            PacketEncoding::Legacy => {
                // GET_OTA_VERSION exists only in the TLV dialect; seeing its
                // type code promotes the session to TLV for its lifetime
                if raw.first() == Some(&type_code::GET_OTA_VERSION) {
                    log::info!("peer speaks TLV, switching encoding");
                    self.session.encoding = PacketEncoding::Tlv;
                    self.queue.clear();
                    self.absorb_tlv(raw)
                } else {
                    match Command::decode(raw) {
                        Ok(cmd) => self.dispatch_from_phone(cmd, raw),
                        Err(err) => {
                            log::warn!("dropping undecodable legacy packet: {}", err);
                            Ok(())
                        }
                    }
                }
            }
            PacketEncoding::Tlv => self.absorb_tlv(raw),
        }
    }

    fn absorb_tlv(&mut self, raw: &[u8]) -> Result<(), OtaError> {
        self.queue.push(raw)?;
        while let Some(frame) = self.queue.next_frame() {
            match Command::decode(&frame) {
                Ok(cmd) => self.dispatch_from_phone(cmd, &frame)?,
                Err(err) => log::warn!("dropping undecodable TLV frame: {}", err),
            }
        }
        Ok(())
    }

    /// Inbound inter-chip traffic.
    pub fn relay_on_received(&mut self, op: RelayOp, payload: &[u8]) -> Result<(), OtaError> {
        match op {
            RelayOp::Packet => self.on_relayed_packet(payload),
            RelayOp::Result => {
                if payload.len() < 2 {
                    log::warn!("short relay verdict, dropped");
                    return Ok(());
                }
                let composed = self
                    .mailbox
                    .offer_remote(payload[0], Verdict::Code(payload[1]))?;
                self.transmit_opt(composed)
            }
            RelayOp::Breakpoint => {
                if payload.len() < 4 + CHALLENGE_LEN {
                    log::warn!("short relay breakpoint, dropped");
                    return Ok(());
                }
                let breakpoint =
                    u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                let mut challenge = [0u8; CHALLENGE_LEN];
                challenge.copy_from_slice(&payload[4..4 + CHALLENGE_LEN]);
                let composed = self.mailbox.offer_remote(
                    type_code::RESUME_VERIFY_RSP,
                    Verdict::Breakpoint {
                        breakpoint,
                        challenge,
                    },
                )?;
                self.transmit_opt(composed)
            }
            RelayOp::RoleSwitch => {
                // peer initiated and already committed; mirror it
                self.role = match self.role {
                    TwsRole::Master => TwsRole::Slave,
                    TwsRole::Slave => TwsRole::Master,
                    TwsRole::Freeman => TwsRole::Freeman,
                };
                log::info!("role switched by peer, now {:?}", self.role);
                Ok(())
            }
        }
    }

    /// Periodic housekeeping: relay timeouts and deferred role switches.
    pub fn on_tick(&mut self) -> Result<(), OtaError> {
        let now = self.clock.now_ms();
        if let Some(rsp_type) = self.mailbox.take_expired(now) {
            log::warn!("slave verdict 0x{:02x} timed out", rsp_type);
            let rsp = failure_response(rsp_type, OtaResult::Failed as u8);
            self.transmit(&rsp)?;
        }
        if self.role_guard.poll(now)
            && (!self.session.in_progress() || self.role_guard.exhausted())
        {
            self.role_guard.cancel();
            self.perform_role_switch()?;
        }
        Ok(())
    }

    /// Locally initiated role switch. Deferred while a transfer is mid
    /// flight; after two timed retries it goes through regardless.
    pub fn request_role_switch(&mut self) -> Result<bool, OtaError> {
        if self.session.in_progress() {
            log::info!("role switch deferred, transfer in progress");
            self.role_guard.defer(self.clock.now_ms());
            return Ok(false);
        }
        self.perform_role_switch()?;
        Ok(true)
    }

    fn perform_role_switch(&mut self) -> Result<(), OtaError> {
        self.relay.send(RelayOp::RoleSwitch, &[])?;
        self.role = match self.role {
            TwsRole::Master => TwsRole::Slave,
            TwsRole::Slave => TwsRole::Master,
            TwsRole::Freeman => TwsRole::Freeman,
        };
        log::info!("role switch performed, now {:?}", self.role);
        if self.role != TwsRole::Slave {
            self.transmit(&Response::RoleSwitchRsp)?;
        }
        Ok(())
    }

    fn dispatch_from_phone(&mut self, cmd: Command, frame: &[u8]) -> Result<(), OtaError> {
        match self.role {
            TwsRole::Master => {
                let correlated = correlated_rsp_type(&cmd);
                if let Some(rsp_type) = correlated {
                    self.mailbox.begin(rsp_type, self.clock.now_ms());
                }
                self.relay.send(RelayOp::Packet, frame)?;
                let local = self.handle_command(cmd)?;
                match (correlated, local) {
                    (Some(_), Some(rsp)) => {
                        let verdict = verdict_of(&rsp).unwrap_or(Verdict::Code(0));
                        let composed = self.mailbox.offer_local(rsp, verdict)?;
                        self.transmit_opt(composed)
                    }
                    (Some(_), None) => {
                        // local side dropped the command; nothing to compose
                        self.mailbox.clear();
                        Ok(())
                    }
                    (None, Some(rsp)) => self.transmit(&rsp),
                    (None, None) => Ok(()),
                }
            }
            TwsRole::Freeman => {
                let rsp = self.handle_command(cmd)?;
                self.transmit_opt(rsp)
            }
            TwsRole::Slave => {
                // phones talk to the master; tolerate it but say so
                log::warn!("phone command on slave transport");
                let rsp = self.handle_command(cmd)?;
                self.transmit_opt(rsp)
            }
        }
    }

    fn on_relayed_packet(&mut self, frame: &[u8]) -> Result<(), OtaError> {
        let cmd = match Command::decode(frame) {
            Ok(cmd) => cmd,
            Err(err) => {
                log::warn!("dropping undecodable relayed frame: {}", err);
                return Ok(());
            }
        };
        let correlated = correlated_rsp_type(&cmd).is_some();
        let Some(rsp) = self.handle_command(cmd)? else {
            return Ok(());
        };
        if !correlated {
            // the master already answered the phone for these
            return Ok(());
        }
        match verdict_of(&rsp) {
            Some(Verdict::Code(code)) => self
                .relay
                .send(RelayOp::Result, &[rsp.type_code(), code]),
            Some(Verdict::Breakpoint {
                breakpoint,
                challenge,
            }) => {
                let mut payload = [0u8; 4 + CHALLENGE_LEN];
                payload[..4].copy_from_slice(&breakpoint.to_le_bytes());
                payload[4..].copy_from_slice(&challenge);
                self.relay.send(RelayOp::Breakpoint, &payload)
            }
            None => Ok(()),
        }
    }

    fn transmit(&mut self, rsp: &Response) -> Result<(), OtaError> {
        let wire = rsp.encode(self.session.encoding)?;
        self.transport.transmit(&wire)
    }

    fn transmit_opt(&mut self, rsp: Option<Response>) -> Result<(), OtaError> {
        match rsp {
            Some(rsp) => self.transmit(&rsp),
            None => Ok(()),
        }
    }

    /// Apply one command to this device's own session. Returns the response
    /// to route (phone or relay), or `None` for dropped/silent commands.
    fn handle_command(&mut self, cmd: Command) -> Result<Option<Response>, OtaError> {
        match cmd {
            Command::GetOtaVersion { version } => {
                log::debug!("peer ota protocol {:?}", version);
                self.session.encoding = PacketEncoding::Tlv;
                Ok(Some(Response::GetOtaVersionRsp {
                    version: OTA_PROTOCOL_VERSION,
                }))
            }
            Command::GetVersion { magic } => {
                if magic != START_MAGIC {
                    log::warn!("get-version with bad magic 0x{:08x}", magic);
                    return Ok(None);
                }
                Ok(Some(Response::VersionRsp {
                    magic: START_MAGIC,
                    device_type: self.info.device_type,
                    left_fw: self.info.left_fw,
                    right_fw: self.info.right_fw,
                }))
            }
            Command::SideSelect { side } => {
                let success = side == 0 || side == self.info.side;
                Ok(Some(Response::SideSelectRsp { success }))
            }
            Command::SetUser { user } => {
                let selected = OtaUserId::from_wire(user)
                    .filter(|id| self.registry.lookup(*id).is_some());
                if let Some(id) = selected {
                    self.session.current_user = Some(id);
                }
                Ok(Some(Response::SetUserRsp {
                    result: selected.is_some(),
                }))
            }
            Command::Start {
                magic,
                image_size,
                image_crc32,
            } => self.handle_start(magic, image_size, image_crc32),
            Command::Config { fragment } => self.handle_config(&fragment),
            Command::Data { bytes } => self.handle_data(&bytes),
            Command::SegmentVerify {
                magic,
                segment_crc32,
            } => self.handle_segment_verify(magic, segment_crc32),
            Command::GetResult => self.handle_get_result(),
            Command::ResumeVerify {
                magic,
                challenge,
                segment_size,
                crc32,
            } => self.handle_resume_verify(magic, challenge, segment_size, crc32),
            Command::ImageApply { magic } => self.handle_apply(magic),
            Command::ReadFlash { start, addr, len } => self.handle_read_flash(start, addr, len),
        }
    }

    fn current_user(&self) -> Option<OtaUser> {
        self.registry
            .lookup(self.session.current_user.unwrap_or(OtaUserId::Firmware))
            .copied()
    }

    fn handle_start(
        &mut self,
        magic: u32,
        image_size: u32,
        image_crc32: u32,
    ) -> Result<Option<Response>, OtaError> {
        if magic != START_MAGIC {
            log::warn!("start with bad magic 0x{:08x}", magic);
            return Ok(Some(Response::ResultRsp {
                result: OtaResult::Failed as u8,
            }));
        }
        let Some(user) = self.current_user() else {
            log::warn!("start without a registered user");
            return Ok(Some(Response::ResultRsp {
                result: OtaResult::Failed as u8,
            }));
        };
        if image_size == 0 || image_size > user.region_len {
            log::warn!(
                "image of {} bytes exceeds {} byte region",
                image_size,
                user.region_len
            );
            return Ok(Some(Response::ResultRsp {
                result: OtaResult::ErrImageSize as u8,
            }));
        }

        log::info!(
            "ota start: user {:?}, {} bytes, crc 0x{:08x}",
            user.id,
            image_size,
            image_crc32
        );
        let resume = self.session.resume_received;
        self.session.reset_transfer();
        self.session.resume_received = resume;
        self.session.current_user = Some(user.id);
        self.session.total_image_size = image_size;
        self.session.image_crc32 = image_crc32;
        self.burner.bind(user.id, user.region_len);
        self.session.set_state(SessionState::Configuring);

        // a changed image invalidates any persisted checkpoints
        match UpgradeJournal::read_header(&mut self.flash)? {
            Some((total, crc)) if total == image_size && crc == image_crc32 => {}
            Some(_) => {
                log::info!("image changed, dropping breakpoint log");
                UpgradeJournal::invalidate(&mut self.flash)?;
                UpgradeJournal::write_header(&mut self.flash, image_size, image_crc32)?;
                self.session.resume_received = None;
            }
            None => UpgradeJournal::write_header(&mut self.flash, image_size, image_crc32)?,
        }

        let mtu = if self.session.via_ble {
            MAX_BLE_DATA_PAYLOAD
        } else {
            MAX_SPP_DATA_PAYLOAD
        };
        Ok(Some(Response::StartRsp {
            magic: START_MAGIC,
            sw_version: self.info.sw_version,
            hw_version: self.info.hw_version,
            mtu,
        }))
    }

    fn handle_config(&mut self, fragment: &[u8]) -> Result<Option<Response>, OtaError> {
        if self.session.state() != SessionState::Configuring {
            log::warn!("config outside Configuring, dropped");
            return Ok(None);
        }
        if self
            .session
            .config_buf
            .extend_from_slice(fragment)
            .is_err()
        {
            log::warn!("configuration blob overflows its wire size");
            self.session.reset_transfer();
            return Ok(Some(Response::ConfigRsp { done: false }));
        }
        if !FlowConfiguration::is_complete(&self.session.config_buf) {
            return Ok(None);
        }

        let cfg = match FlowConfiguration::from_slice(&self.session.config_buf) {
            Ok(cfg) => cfg,
            Err(err) => {
                log::warn!("unparseable configuration: {}", err);
                self.session.reset_transfer();
                return Ok(Some(Response::ConfigRsp { done: false }));
            }
        };
        if cfg.crc32 != cfg.computed_crc() {
            log::warn!("configuration crc mismatch");
            self.session.reset_transfer();
            return Ok(Some(Response::ConfigRsp { done: false }));
        }

        let user = self.current_user().ok_or(OtaError::UnknownUser(0xFF))?;
        let image_end = cfg
            .start_write_offset
            .checked_add(self.session.total_image_size);
        if image_end.map_or(true, |end| end > user.region_len) {
            log::warn!("image does not fit behind start offset");
            self.session.reset_transfer();
            return Ok(Some(Response::ResultRsp {
                result: OtaResult::ErrImageSize as u8,
            }));
        }

        self.session.image_base = cfg.start_write_offset;
        if let Some(breakpoint) = self.session.resume_received.take() {
            if breakpoint > self.session.total_image_size {
                log::warn!("persisted breakpoint beyond image, invalidating");
                UpgradeJournal::invalidate(&mut self.flash)?;
                self.session.reset_transfer();
                return Ok(Some(Response::ResultRsp {
                    result: OtaResult::ErrBreakpoint as u8,
                }));
            }
            log::info!("resuming transfer at {} bytes", breakpoint);
            self.session.received = breakpoint;
        }
        self.session.program_offset = self.session.image_base + self.session.received;
        self.session.segment_start_offset = self.session.program_offset;
        self.session.segment_start_received = self.session.received;
        self.session.config = Some(cfg);
        self.session.set_state(SessionState::Transferring);
        if let Some(on_start) = user.hooks.on_start {
            on_start();
        }
        Ok(Some(Response::ConfigRsp { done: true }))
    }

    fn handle_data(&mut self, bytes: &[u8]) -> Result<Option<Response>, OtaError> {
        if self.session.state() != SessionState::Transferring {
            log::warn!("data outside Transferring");
            return Ok(Some(Response::ResultRsp {
                result: OtaResult::Failed as u8,
            }));
        }
        // reject before mutating anything
        if self.session.received == self.session.segment_start_received
            && self.session.program_offset % MIN_SEGMENT_ALIGN != 0
        {
            log::warn!(
                "segment starts at unaligned offset 0x{:08x}",
                self.session.program_offset
            );
            return Ok(Some(Response::ResultRsp {
                result: OtaResult::ErrFlashOffset as u8,
            }));
        }
        let new_received = self.session.received.saturating_add(bytes.len() as u32);
        if new_received > self.session.total_image_size {
            log::warn!(
                "received {} would exceed image size {}",
                new_received,
                self.session.total_image_size
            );
            return Ok(Some(Response::ResultRsp {
                result: OtaResult::ErrRecvSize as u8,
            }));
        }

        let mut rest = bytes;
        while !rest.is_empty() {
            let taken = self.burner.stage(rest);
            rest = &rest[taken..];
            if self.burner.is_full() {
                match self.burner.flush(&mut self.flash, self.session.program_offset) {
                    Ok(written) => self.session.program_offset += written,
                    Err(OtaError::FlashBounds(offset)) => {
                        log::warn!("write past region at 0x{:08x}", offset);
                        self.session.reset_transfer();
                        return Ok(Some(Response::ResultRsp {
                            result: OtaResult::ErrFlashOffset as u8,
                        }));
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        self.session.received = new_received;

        // SPP flow control wants an explicit ack; BLE relies on the link
        if self.session.via_ble {
            Ok(None)
        } else {
            Ok(Some(Response::DataAck))
        }
    }

    fn handle_segment_verify(
        &mut self,
        magic: u32,
        expected_crc32: u32,
    ) -> Result<Option<Response>, OtaError> {
        if self.session.state() != SessionState::Transferring || magic != START_MAGIC {
            log::warn!("segment verify dropped (state/magic)");
            return Ok(None);
        }
        self.session.set_state(SessionState::VerifyingSegment);

        let written = self
            .burner
            .flush(&mut self.flash, self.session.program_offset)?;
        self.session.program_offset += written;

        let user = self.current_user().ok_or(OtaError::UnknownUser(0xFF))?;
        let segment_len = self.session.program_offset - self.session.segment_start_offset;
        let actual = region_crc(
            &mut self.flash,
            user.id,
            self.session.segment_start_offset,
            segment_len,
        )?;

        if actual == expected_crc32 {
            UpgradeJournal::append_checkpoint(&mut self.flash, self.session.received)?;
            self.session.segment_start_offset = self.session.program_offset;
            self.session.segment_start_received = self.session.received;
            self.session.retries.reset();
            self.session.set_state(SessionState::Transferring);
            log::debug!("segment confirmed at {} bytes", self.session.received);
            return Ok(Some(Response::SegmentVerifyRsp { pass: true }));
        }

        log::warn!(
            "segment crc mismatch: got 0x{:08x}, expected 0x{:08x}",
            actual,
            expected_crc32
        );
        if self.session.retries.fail() {
            log::warn!("segment retries exhausted, forcing full restart");
            UpgradeJournal::invalidate(&mut self.flash)?;
            self.session.reset_transfer();
            return Ok(Some(Response::ResultRsp {
                result: OtaResult::ErrSegVerify as u8,
            }));
        }
        self.burner.rollback(
            &mut self.flash,
            self.session.segment_start_offset,
            self.session.program_offset,
        )?;
        self.session.program_offset = self.session.segment_start_offset;
        self.session.received = self.session.segment_start_received;
        self.session.set_state(SessionState::Transferring);
        Ok(Some(Response::SegmentVerifyRsp { pass: false }))
    }

    fn handle_get_result(&mut self) -> Result<Option<Response>, OtaError> {
        if self.session.state() != SessionState::Transferring
            || self.session.received != self.session.total_image_size
        {
            log::warn!(
                "get-result at {}/{} bytes, answering failure",
                self.session.received,
                self.session.total_image_size
            );
            return Ok(Some(Response::ResultRsp {
                result: OtaResult::Failed as u8,
            }));
        }
        let written = self
            .burner
            .flush(&mut self.flash, self.session.program_offset)?;
        self.session.program_offset += written;
        self.session.set_state(SessionState::VerifyingImage);

        let user = self.current_user().ok_or(OtaError::UnknownUser(0xFF))?;
        let pass = if user.id.is_firmware() {
            self.verify_firmware_image(user.id)?
        } else {
            let crc = region_crc(
                &mut self.flash,
                user.id,
                self.session.image_base,
                self.session.total_image_size,
            )?;
            if crc != self.session.image_crc32 {
                log::warn!(
                    "whole image crc 0x{:08x} != 0x{:08x}",
                    crc,
                    self.session.image_crc32
                );
            }
            crc == self.session.image_crc32
        };

        // transfer is over either way; the log has served its purpose
        UpgradeJournal::invalidate(&mut self.flash)?;

        if pass {
            log::info!("whole image verified, awaiting apply");
            self.session.pending_apply = true;
            self.session.set_state(SessionState::Applying);
            if let Some(done) = user.hooks.on_reception_done {
                done(
                    user.region_base + self.session.image_base,
                    self.session.total_image_size,
                );
            }
            Ok(Some(Response::ResultRsp {
                result: OtaResult::Ok as u8,
            }))
        } else {
            self.session.reset_transfer();
            Ok(Some(Response::ResultRsp {
                result: OtaResult::Failed as u8,
            }))
        }
    }

    /// Firmware images carry a boot-header word and, in the current image
    /// format, a tail key word with their own CRC. All three gates must hold.
    fn verify_firmware_image(&mut self, id: OtaUserId) -> Result<bool, OtaError> {
        let base = self.session.image_base;
        let size = self.session.total_image_size;

        let first = image_first_word(&mut self.flash, id, base)?;
        if first != NORMAL_BOOT {
            log::warn!("image first word 0x{:08x} is not a boot header", first);
            return Ok(false);
        }
        let crc = staged_image_crc(&mut self.flash, id, base, size)?;
        if crc != self.session.image_crc32 {
            log::warn!(
                "whole image crc 0x{:08x} != 0x{:08x}",
                crc,
                self.session.image_crc32
            );
            return Ok(false);
        }
        if !sanity_crc_ok(&mut self.flash, id, base, size)? {
            log::warn!("tail key word crc does not match the staged bytes");
            return Ok(false);
        }
        Ok(true)
    }

    fn handle_resume_verify(
        &mut self,
        magic: u32,
        peer_challenge: [u8; CHALLENGE_LEN],
        segment_size: u32,
        crc32: u32,
    ) -> Result<Option<Response>, OtaError> {
        if magic != START_MAGIC {
            log::warn!("resume verify with bad magic");
            return Ok(None);
        }
        // a structurally invalid request is rejected outright
        if crc32 != resume_request_crc(&peer_challenge, segment_size) {
            log::warn!("resume request crc invalid");
            let challenge = [0u8; CHALLENGE_LEN];
            return Ok(Some(Response::ResumeVerifyRsp {
                breakpoint: u32::MAX,
                crc32: resume_response_crc(u32::MAX, &challenge),
                challenge,
            }));
        }

        let mut stored = UpgradeJournal::read_challenge(&mut self.flash)?;
        let mut breakpoint =
            UpgradeJournal::latest_checkpoint(&mut self.flash)?.unwrap_or(0);
        if breakpoint % MIN_SEGMENT_ALIGN != 0 {
            log::warn!("corrupt breakpoint 0x{:08x}, dropping log", breakpoint);
            UpgradeJournal::invalidate(&mut self.flash)?;
            stored = None;
            breakpoint = 0;
        }

        if stored == Some(peer_challenge) && breakpoint > 0 {
            log::info!("resume accepted at {} bytes", breakpoint);
            self.session.resume_received = Some(breakpoint);
            return Ok(Some(Response::ResumeVerifyRsp {
                breakpoint,
                challenge: peer_challenge,
                crc32: resume_response_crc(breakpoint, &peer_challenge),
            }));
        }

        // unknown transfer attempt: force a restart from zero
        self.session.resume_received = None;
        let challenge = match self.challenge_policy {
            ChallengePolicy::Generate => {
                let mut fresh = [0u8; CHALLENGE_LEN];
                let seed = self.clock.now_ms() as u32 ^ 0x4F54_4121;
                ChallengeLcg::new(seed).fill(&mut fresh);
                UpgradeJournal::write_challenge(&mut self.flash, &fresh)?;
                log::info!("challenge mismatch, fresh code persisted");
                fresh
            }
            ChallengePolicy::Defer => stored.unwrap_or([0u8; CHALLENGE_LEN]),
        };
        Ok(Some(Response::ResumeVerifyRsp {
            breakpoint: 0,
            crc32: resume_response_crc(0, &challenge),
            challenge,
        }))
    }

    fn handle_apply(&mut self, magic: u32) -> Result<Option<Response>, OtaError> {
        if magic != START_MAGIC
            || self.session.state() != SessionState::Applying
            || !self.session.pending_apply
        {
            // refusing is an error on the wire, never a crash
            log::warn!("apply refused (state/magic)");
            return Ok(Some(Response::ImageApplyRsp { success: false }));
        }
        let user = self.current_user().ok_or(OtaError::UnknownUser(0xFF))?;

        let mut current = [0u8; BootInfo::WIRE_LEN];
        self.flash
            .read(OtaUserId::BootInfo, 0, &mut current)?;
        let current = BootInfo::from_bytes(&current)?;
        let boot_word = if current.is_valid() && current.boot_word == BOOT_WORD_A {
            BOOT_WORD_B
        } else {
            BOOT_WORD_A
        };

        let info = BootInfo {
            magic: COPY_NEW_IMAGE,
            image_size: self.session.total_image_size,
            image_crc: self.session.image_crc32,
            new_image_offset: user.region_base + self.session.image_base,
            boot_word,
        };
        self.flash.erase_sector(OtaUserId::BootInfo, 0)?;
        self.flash
            .program(OtaUserId::BootInfo, 0, &info.to_bytes())?;
        log::info!(
            "boot info written: {} bytes at 0x{:08x}, boot word 0x{:08x}",
            info.image_size,
            info.new_image_offset,
            info.boot_word
        );

        if let Some(on_apply) = user.hooks.on_apply {
            on_apply(info.new_image_offset, info.image_size);
        }
        self.session.reset_transfer();
        self.reboot_pending = true;
        Ok(Some(Response::ImageApplyRsp { success: true }))
    }

    fn handle_read_flash(
        &mut self,
        start: bool,
        addr: u32,
        len: u32,
    ) -> Result<Option<Response>, OtaError> {
        if !start {
            return Ok(None);
        }
        if self.role == TwsRole::Slave {
            // diagnostics stream straight to the phone; not relayable
            return Ok(None);
        }
        let Some(user) = self.current_user() else {
            return Ok(None);
        };
        if addr.checked_add(len).map_or(true, |end| end > user.region_len) {
            return Ok(Some(Response::FlashContent {
                ok: false,
                bytes: Vec::new(),
            }));
        }

        self.flash.flush_pending()?;
        let mut offset = addr;
        let mut remaining = len;
        let mut scratch = [0u8; MAX_DATA_PAYLOAD];
        while remaining > 0 {
            let chunk = remaining.min(MAX_DATA_PAYLOAD as u32) as usize;
            self.flash.read(user.id, offset, &mut scratch[..chunk])?;
            let rsp = Response::FlashContent {
                ok: true,
                bytes: Vec::from_slice(&scratch[..chunk]).unwrap_or_default(),
            };
            self.transmit(&rsp)?;
            offset += chunk as u32;
            remaining -= chunk as u32;
        }
        Ok(None)
    }
}
