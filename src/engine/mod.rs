// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Protocol engine seam between the bootstrap core and the CoAP wire format.
// Author: Lukas Bower

//! Protocol engine abstraction.
//!
//! The engine parses inbound datagrams into [`EngineEvent`]s, builds outbound bootstrap
//! requests and keeps whatever exchange state the wire protocol needs. The core only
//! sees sessions, URIs and verdicts.

pub mod coap;
mod lwm2m;

use std::io;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::connection::SessionId;
use crate::uri::Lwm2mUri;

pub use self::coap::{Code, CoapError};
pub use self::lwm2m::{CoapEngine, EXCHANGE_LIFETIME};

/// Engine failures.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Inbound datagram could not be decoded.
    #[error("malformed datagram: {0}")]
    Codec(#[from] CoapError),
    /// No transport peer exists for the session.
    #[error("session {0} has no peer")]
    UnknownSession(SessionId),
    /// An encoded request exceeds the datagram limit.
    #[error("message of {len} bytes exceeds the {max} byte packet limit")]
    PayloadTooLarge {
        /// Encoded size.
        len: usize,
        /// Packet limit.
        max: usize,
    },
    /// The transport refused the datagram.
    #[error("send to {session} failed: {source}")]
    Transport {
        /// Destination session.
        session: SessionId,
        /// Socket failure.
        source: io::Error,
    },
    /// The engine was closed.
    #[error("engine closed")]
    Closed,
}

/// Content format of a write payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentFormat(u16);

impl ContentFormat {
    /// OMA LwM2M TLV.
    pub const TLV: Self = Self(11542);

    /// Registered CoAP content-format number.
    #[must_use]
    pub const fn code(self) -> u16 {
        self.0
    }
}

/// Something the engine surfaced from an inbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A client asked to be bootstrapped.
    BootstrapRequest {
        /// Connection the request arrived on.
        session: SessionId,
        /// Endpoint client name from the request.
        name: String,
    },
    /// A client answered an outstanding bootstrap operation.
    Response {
        /// Connection the response arrived on.
        session: SessionId,
        /// Response code; 5.03 when the exchange was reset.
        code: Code,
        /// Target of the answered operation.
        uri: Option<Lwm2mUri>,
    },
}

impl EngineEvent {
    /// Session the event concerns.
    #[must_use]
    pub fn session(&self) -> SessionId {
        match self {
            Self::BootstrapRequest { session, .. } | Self::Response { session, .. } => *session,
        }
    }
}

/// How the core answers an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Bootstrap request accepted (2.04).
    Accept,
    /// Bootstrap request refused without a reply.
    Ignore,
    /// Bootstrap request could not be served (5.00).
    InternalError,
    /// Response consumed.
    NoError,
}

impl Verdict {
    /// Response code the engine replies with, if any.
    #[must_use]
    pub fn response_code(self) -> Option<Code> {
        match self {
            Self::Accept => Some(Code::CHANGED),
            Self::InternalError => Some(Code::INTERNAL_SERVER_ERROR),
            Self::Ignore | Self::NoError => None,
        }
    }
}

/// Datagram sink addressed by session.
pub trait Outbound {
    /// Transmit one datagram to the peer behind `session`.
    fn send(&mut self, session: SessionId, datagram: &[u8]) -> Result<(), EngineError>;
}

/// Wire protocol used by the bootstrap server.
pub trait ProtocolEngine {
    /// Advance timers. Returns how long the caller may sleep before the next step.
    fn step(&mut self, now: Instant) -> Result<Duration, EngineError>;

    /// Process one inbound datagram from `session`.
    fn handle_packet(
        &mut self,
        session: SessionId,
        datagram: &[u8],
        now: Instant,
        out: &mut dyn Outbound,
    ) -> Result<Option<EngineEvent>, EngineError>;

    /// Deliver the core's verdict for an event returned by [`Self::handle_packet`].
    fn answer(
        &mut self,
        event: &EngineEvent,
        verdict: Verdict,
        out: &mut dyn Outbound,
    ) -> Result<(), EngineError>;

    /// Send a bootstrap delete for `uri`.
    fn delete(
        &mut self,
        session: SessionId,
        uri: &Lwm2mUri,
        out: &mut dyn Outbound,
    ) -> Result<(), EngineError>;

    /// Send a bootstrap write of `payload` to `uri`.
    fn write(
        &mut self,
        session: SessionId,
        uri: &Lwm2mUri,
        format: ContentFormat,
        payload: &[u8],
        out: &mut dyn Outbound,
    ) -> Result<(), EngineError>;

    /// Send bootstrap finish.
    fn finish(&mut self, session: SessionId, out: &mut dyn Outbound) -> Result<(), EngineError>;

    /// Drop any state held for `session`.
    fn forget_session(&mut self, session: SessionId);

    /// Release all state; later steps fail with [`EngineError::Closed`].
    fn close(&mut self);
}
