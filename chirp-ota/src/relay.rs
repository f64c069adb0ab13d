// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Master-side correlation of relayed slave verdicts.
//!
//! The master answers the phone only once its own processing and the slave's
//! relayed result are both in. Correlation is a single-slot mailbox, not a
//! queue: exactly one relayed command may be outstanding, and a reply of a
//! different type is a protocol violation surfaced as a typed error.

use crate::error::OtaError;
use chirp_common::protocol::{resume_response_crc, type_code, CHALLENGE_LEN};
use chirp_common::{OtaResult, Response};

pub const RELAY_REPLY_TIMEOUT_MS: u64 = 5_000;
pub const ROLE_SWITCH_DEFER_MS: u64 = 200;
pub const ROLE_SWITCH_ATTEMPTS: u8 = 2;

/// Mailbox slot value meaning "nothing outstanding" in diagnostics.
pub const EMPTY_MAILBOX: u8 = 0xFF;

/// One side's outcome for a correlated command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Pass/fail or a numeric result code (1 = pass).
    Code(u8),
    /// Resume negotiation outcome.
    Breakpoint {
        breakpoint: u32,
        challenge: [u8; CHALLENGE_LEN],
    },
}

impl Verdict {
    fn passed(&self) -> bool {
        matches!(self, Verdict::Code(c) if OtaResult::is_ok(*c))
    }
}

struct PendingRelay {
    rsp_type: u8,
    local: Option<(Response, Verdict)>,
    remote: Option<Verdict>,
    deadline_ms: u64,
}

/// The wire response carrying a failed combined verdict of type `rsp_type`.
pub fn failure_response(rsp_type: u8, code: u8) -> Response {
    match rsp_type {
        type_code::SEGMENT_VERIFY_RSP => Response::SegmentVerifyRsp { pass: false },
        type_code::IMAGE_APPLY_RSP => Response::ImageApplyRsp { success: false },
        type_code::RESUME_VERIFY_RSP => {
            let challenge = [0u8; CHALLENGE_LEN];
            Response::ResumeVerifyRsp {
                breakpoint: u32::MAX,
                crc32: resume_response_crc(u32::MAX, &challenge),
                challenge,
            }
        }
        _ => Response::ResultRsp { result: code },
    }
}

#[derive(Default)]
pub struct RelayCoordinator {
    pending: Option<PendingRelay>,
}

impl RelayCoordinator {
    pub const fn new() -> Self {
        Self { pending: None }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn clear(&mut self) {
        self.pending = None;
    }

    /// Open the mailbox for a forwarded command expecting `rsp_type` back.
    /// A stale entry (slave never answered, timeout not yet hit) is dropped
    /// with a warning rather than wedging the session.
    pub fn begin(&mut self, rsp_type: u8, now_ms: u64) {
        if let Some(stale) = &self.pending {
            log::warn!(
                "relay mailbox still held 0x{:02x}, replacing with 0x{:02x}",
                stale.rsp_type,
                rsp_type
            );
        }
        self.pending = Some(PendingRelay {
            rsp_type,
            local: None,
            remote: None,
            deadline_ms: now_ms + RELAY_REPLY_TIMEOUT_MS,
        });
    }

    /// Record the master's own outcome. Returns the combined response once
    /// both sides are in.
    pub fn offer_local(
        &mut self,
        response: Response,
        verdict: Verdict,
    ) -> Result<Option<Response>, OtaError> {
        let pending = self.pending.as_mut().ok_or(OtaError::MailboxMismatch {
            expected: EMPTY_MAILBOX,
            got: response.type_code(),
        })?;
        pending.local = Some((response, verdict));
        Ok(self.try_compose())
    }

    /// Record the slave's relayed outcome. A verdict for a response type
    /// other than the outstanding one is an invariant violation.
    pub fn offer_remote(
        &mut self,
        rsp_type: u8,
        verdict: Verdict,
    ) -> Result<Option<Response>, OtaError> {
        let pending = self.pending.as_mut().ok_or(OtaError::MailboxMismatch {
            expected: EMPTY_MAILBOX,
            got: rsp_type,
        })?;
        if pending.rsp_type != rsp_type {
            return Err(OtaError::MailboxMismatch {
                expected: pending.rsp_type,
                got: rsp_type,
            });
        }
        pending.remote = Some(verdict);
        Ok(self.try_compose())
    }

    /// Reap a timed-out mailbox; returns the abandoned response type.
    pub fn take_expired(&mut self, now_ms: u64) -> Option<u8> {
        if let Some(pending) = &self.pending {
            if pending.remote.is_none() && now_ms >= pending.deadline_ms {
                let rsp_type = pending.rsp_type;
                self.pending = None;
                return Some(rsp_type);
            }
        }
        None
    }

    fn try_compose(&mut self) -> Option<Response> {
        let pending = self.pending.as_ref()?;
        let (local_rsp, local) = pending.local.as_ref()?;
        let remote = pending.remote.as_ref()?;
        let composed = compose(pending.rsp_type, local_rsp, local, remote);
        self.pending = None;
        Some(composed)
    }
}

fn compose(rsp_type: u8, local_rsp: &Response, local: &Verdict, remote: &Verdict) -> Response {
    match (local, remote) {
        (Verdict::Code(a), Verdict::Code(b)) => {
            if local.passed() && remote.passed() {
                return local_rsp.clone();
            }
            // forward a specific error code over a plain failure
            let code = if *a >= 2 {
                *a
            } else if *b >= 2 {
                *b
            } else {
                OtaResult::Failed as u8
            };
            failure_response(rsp_type, code)
        }
        (
            Verdict::Breakpoint {
                breakpoint: local_bp,
                challenge: local_ch,
            },
            Verdict::Breakpoint {
                breakpoint: remote_bp,
                challenge: remote_ch,
            },
        ) => {
            // both buds must agree on where to resume, otherwise restart
            let breakpoint = if local_bp == remote_bp && local_ch == remote_ch {
                *local_bp
            } else {
                0
            };
            Response::ResumeVerifyRsp {
                breakpoint,
                challenge: *local_ch,
                crc32: resume_response_crc(breakpoint, local_ch),
            }
        }
        _ => failure_response(rsp_type, OtaResult::Failed as u8),
    }
}

/// Deferral of role-switch requests while a transfer is mid-flight: two
/// timed attempts, after which the switch is permitted regardless.
pub struct RoleSwitchGuard {
    attempts_left: u8,
    fire_at_ms: Option<u64>,
}

impl RoleSwitchGuard {
    pub const fn new() -> Self {
        Self {
            attempts_left: 0,
            fire_at_ms: None,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.fire_at_ms.is_some()
    }

    pub fn defer(&mut self, now_ms: u64) {
        self.attempts_left = ROLE_SWITCH_ATTEMPTS;
        self.fire_at_ms = Some(now_ms + ROLE_SWITCH_DEFER_MS);
    }

    pub fn cancel(&mut self) {
        self.attempts_left = 0;
        self.fire_at_ms = None;
    }

    /// True when a deferred attempt is due; rearms itself until the attempt
    /// budget runs out.
    pub fn poll(&mut self, now_ms: u64) -> bool {
        match self.fire_at_ms {
            Some(at) if now_ms >= at => {
                self.attempts_left = self.attempts_left.saturating_sub(1);
                self.fire_at_ms = if self.attempts_left == 0 {
                    None
                } else {
                    Some(now_ms + ROLE_SWITCH_DEFER_MS)
                };
                true
            }
            _ => false,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.attempts_left == 0 && self.fire_at_ms.is_none()
    }
}

impl Default for RoleSwitchGuard {
    fn default() -> Self {
        Self::new()
    }
}
