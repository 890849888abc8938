// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: LwM2M bootstrap interface over CoAP: request intake and client operations.
// Author: Lukas Bower

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use super::coap::{Code, Message, MessageType};
use super::{ContentFormat, EngineError, EngineEvent, Outbound, ProtocolEngine, Verdict};
use crate::connection::SessionId;
use crate::uri::Lwm2mUri;

/// How long an unanswered request is remembered (RFC 7252 EXCHANGE_LIFETIME).
pub const EXCHANGE_LIFETIME: Duration = Duration::from_secs(247);

const BOOTSTRAP_PATH: &str = "bs";
const ENDPOINT_QUERY: &str = "ep=";
const TOKEN_LEN: usize = 4;

#[derive(Debug)]
struct Exchange {
    session: SessionId,
    message_id: u16,
    uri: Option<Lwm2mUri>,
    started: Instant,
}

#[derive(Debug)]
struct PendingRequest {
    message_id: u16,
    token: Vec<u8>,
    confirmable: bool,
}

/// CoAP engine serving the LwM2M bootstrap interface.
///
/// Requests sent to clients are confirmable and matched by token; a reset of an
/// outstanding request is reported as a 5.03 response. Nothing is retransmitted.
#[derive(Debug)]
pub struct CoapEngine {
    max_packet_size: usize,
    next_message_id: u16,
    next_token: u32,
    exchanges: HashMap<Vec<u8>, Exchange>,
    pending: HashMap<SessionId, PendingRequest>,
    now: Instant,
    closed: bool,
}

impl CoapEngine {
    /// Engine whose outbound datagrams never exceed `max_packet_size` bytes.
    #[must_use]
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size,
            next_message_id: 1,
            next_token: 1,
            exchanges: HashMap::new(),
            pending: HashMap::new(),
            now: Instant::now(),
            closed: false,
        }
    }

    /// Number of requests awaiting a client response.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.exchanges.len()
    }

    fn message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }

    fn token(&mut self) -> Vec<u8> {
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        token.to_be_bytes()[..TOKEN_LEN].to_vec()
    }

    fn transmit(
        &self,
        session: SessionId,
        message: &Message,
        out: &mut dyn Outbound,
    ) -> Result<(), EngineError> {
        let bytes = message.encode()?;
        if bytes.len() > self.max_packet_size {
            return Err(EngineError::PayloadTooLarge {
                len: bytes.len(),
                max: self.max_packet_size,
            });
        }
        trace!("{session} <- {}", hex::encode(&bytes));
        out.send(session, &bytes)
    }

    fn request(
        &mut self,
        session: SessionId,
        code: Code,
        uri: Option<Lwm2mUri>,
        out: &mut dyn Outbound,
        build: impl FnOnce(&mut Message),
    ) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        let message_id = self.message_id();
        let token = self.token();
        let mut message =
            Message::new(MessageType::Confirmable, code, message_id).with_token(token.clone());
        build(&mut message);
        self.transmit(session, &message, out)?;
        self.exchanges.insert(
            token,
            Exchange {
                session,
                message_id,
                uri,
                started: self.now,
            },
        );
        Ok(())
    }

    fn reply(
        &mut self,
        session: SessionId,
        request: &Message,
        code: Code,
        out: &mut dyn Outbound,
    ) -> Result<(), EngineError> {
        let (kind, message_id) = match request.kind {
            MessageType::Confirmable => (MessageType::Acknowledgement, request.message_id),
            _ => (MessageType::NonConfirmable, self.message_id()),
        };
        let response = Message::new(kind, code, message_id).with_token(request.token.clone());
        self.transmit(session, &response, out)
    }

    fn on_request(
        &mut self,
        session: SessionId,
        message: Message,
        out: &mut dyn Outbound,
    ) -> Result<Option<EngineEvent>, EngineError> {
        let path = message.uri_path();
        if message.code != Code::POST || path != [BOOTSTRAP_PATH] {
            debug!("{session}: no resource for {} /{}", message.code, path.join("/"));
            if message.kind == MessageType::Confirmable {
                self.reply(session, &message, Code::NOT_FOUND, out)?;
            }
            return Ok(None);
        }
        let name = message
            .uri_queries()
            .into_iter()
            .find_map(|query| query.strip_prefix(ENDPOINT_QUERY).map(str::to_owned))
            .filter(|name| !name.is_empty());
        let Some(name) = name else {
            warn!("{session}: bootstrap request without endpoint name");
            self.reply(session, &message, Code::BAD_REQUEST, out)?;
            return Ok(None);
        };
        self.pending.insert(
            session,
            PendingRequest {
                message_id: message.message_id,
                token: message.token,
                confirmable: message.kind == MessageType::Confirmable,
            },
        );
        Ok(Some(EngineEvent::BootstrapRequest { session, name }))
    }

    fn on_response(
        &mut self,
        session: SessionId,
        message: Message,
        out: &mut dyn Outbound,
    ) -> Result<Option<EngineEvent>, EngineError> {
        if message.kind == MessageType::Confirmable {
            self.transmit(session, &Message::empty_ack(message.message_id), out)?;
        }
        let matches = self
            .exchanges
            .get(&message.token)
            .is_some_and(|exchange| exchange.session == session);
        if !matches {
            debug!(
                "{session}: {} with unknown token {}",
                message.code,
                hex::encode(&message.token)
            );
            return Ok(None);
        }
        let uri = self.exchanges.remove(&message.token).and_then(|exchange| exchange.uri);
        Ok(Some(EngineEvent::Response {
            session,
            code: message.code,
            uri,
        }))
    }

    fn on_reset(&mut self, session: SessionId, message_id: u16) -> Option<EngineEvent> {
        let token = self
            .exchanges
            .iter()
            .find(|(_, exchange)| exchange.session == session && exchange.message_id == message_id)
            .map(|(token, _)| token.clone())?;
        let exchange = self.exchanges.remove(&token)?;
        debug!("{session}: request {message_id} reset by client");
        Some(EngineEvent::Response {
            session,
            code: Code::SERVICE_UNAVAILABLE,
            uri: exchange.uri,
        })
    }
}

impl ProtocolEngine for CoapEngine {
    fn step(&mut self, now: Instant) -> Result<Duration, EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        self.now = self.now.max(now);
        let now = self.now;
        self.exchanges.retain(|token, exchange| {
            let live = now.duration_since(exchange.started) < EXCHANGE_LIFETIME;
            if !live {
                debug!(
                    "{}: request {} ({}) expired unanswered",
                    exchange.session,
                    exchange.message_id,
                    hex::encode(token)
                );
            }
            live
        });
        let budget = self
            .exchanges
            .values()
            .map(|exchange| EXCHANGE_LIFETIME.saturating_sub(now.duration_since(exchange.started)))
            .min()
            .unwrap_or(EXCHANGE_LIFETIME);
        Ok(budget)
    }

    fn handle_packet(
        &mut self,
        session: SessionId,
        datagram: &[u8],
        now: Instant,
        out: &mut dyn Outbound,
    ) -> Result<Option<EngineEvent>, EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        self.now = self.now.max(now);
        let message = Message::decode(datagram)?;
        let kind = message.kind;
        match kind {
            MessageType::Reset => Ok(self.on_reset(session, message.message_id)),
            _ if message.code.is_request() => self.on_request(session, message, out),
            _ if message.code.is_response() => self.on_response(session, message, out),
            MessageType::Confirmable if message.code == Code::EMPTY => {
                // CoAP ping
                self.transmit(session, &Message::reset(message.message_id), out)?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn answer(
        &mut self,
        event: &EngineEvent,
        verdict: Verdict,
        out: &mut dyn Outbound,
    ) -> Result<(), EngineError> {
        let EngineEvent::BootstrapRequest { session, .. } = event else {
            return Ok(());
        };
        let Some(pending) = self.pending.remove(session) else {
            return Ok(());
        };
        let Some(code) = verdict.response_code() else {
            return Ok(());
        };
        let (kind, message_id) = if pending.confirmable {
            (MessageType::Acknowledgement, pending.message_id)
        } else {
            (MessageType::NonConfirmable, self.message_id())
        };
        let response = Message::new(kind, code, message_id).with_token(pending.token);
        self.transmit(*session, &response, out)
    }

    fn delete(
        &mut self,
        session: SessionId,
        uri: &Lwm2mUri,
        out: &mut dyn Outbound,
    ) -> Result<(), EngineError> {
        self.request(session, Code::DELETE, Some(*uri), out, |message| {
            for segment in uri.segments() {
                message.add_uri_path(&segment.to_string());
            }
        })
    }

    fn write(
        &mut self,
        session: SessionId,
        uri: &Lwm2mUri,
        format: ContentFormat,
        payload: &[u8],
        out: &mut dyn Outbound,
    ) -> Result<(), EngineError> {
        self.request(session, Code::PUT, Some(*uri), out, |message| {
            for segment in uri.segments() {
                message.add_uri_path(&segment.to_string());
            }
            message.set_content_format(format.code());
            message.payload = payload.to_vec();
        })
    }

    fn finish(&mut self, session: SessionId, out: &mut dyn Outbound) -> Result<(), EngineError> {
        self.request(session, Code::POST, None, out, |message| {
            message.add_uri_path(BOOTSTRAP_PATH);
        })
    }

    fn forget_session(&mut self, session: SessionId) {
        self.exchanges.retain(|_, exchange| exchange.session != session);
        self.pending.remove(&session);
    }

    fn close(&mut self) {
        self.exchanges.clear();
        self.pending.clear();
        self.closed = true;
    }
}
