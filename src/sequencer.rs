// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Drive endpoints through their bootstrap command lists and judge responses.
// Author: Lukas Bower

//! Command sequencer.
//!
//! Each endpoint has at most one command in flight. The sequencer turns engine events into
//! status transitions and, once per event-loop pass, sends the next command for every
//! endpoint that is ready.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::{BootstrapConfig, Command, ServerDescriptor};
use crate::connection::SessionId;
use crate::engine::{
    Code, ContentFormat, EngineError, EngineEvent, Outbound, ProtocolEngine, Verdict,
};
use crate::registry::{CommandStatus, Endpoint, EndpointRegistry};
use crate::uri::Lwm2mUri;

/// Decides what each endpoint sends next and how responses move it along.
#[derive(Debug, Clone)]
pub struct CommandSequencer {
    config: Arc<BootstrapConfig>,
    command_timeout: Option<Duration>,
}

impl CommandSequencer {
    /// Sequencer over `config` without a stall timeout.
    #[must_use]
    pub fn new(config: Arc<BootstrapConfig>) -> Self {
        Self {
            config,
            command_timeout: None,
        }
    }

    /// Fail endpoints whose in-flight command stays unanswered for `timeout`.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Shared configuration.
    #[must_use]
    pub fn config(&self) -> &Arc<BootstrapConfig> {
        &self.config
    }

    /// Apply an engine event to the registry and return the verdict for the engine.
    pub fn handle_event(&self, event: &EngineEvent, registry: &mut EndpointRegistry) -> Verdict {
        match event {
            EngineEvent::BootstrapRequest { session, name } => {
                self.on_bootstrap_request(*session, name, registry)
            }
            EngineEvent::Response { session, code, uri } => {
                self.on_response(*session, *code, uri.as_ref(), registry)
            }
        }
    }

    /// Start (or restart) a session for `name` if a profile matches.
    pub fn on_bootstrap_request(
        &self,
        session: SessionId,
        name: &str,
        registry: &mut EndpointRegistry,
    ) -> Verdict {
        let Some(profile) = self.config.profile_for(name) else {
            info!("{session}: bootstrap request from unknown endpoint '{name}' ignored");
            return Verdict::Ignore;
        };
        match registry.upsert(session, name, Arc::clone(profile)) {
            Ok(_) => {
                info!(
                    "{session}: bootstrap request from '{name}' ({} commands{})",
                    profile.commands().len(),
                    if profile.is_wildcard() { ", wildcard profile" } else { "" }
                );
                Verdict::Accept
            }
            Err(err) => {
                warn!("{session}: bootstrap request from '{name}' refused: {err}");
                Verdict::InternalError
            }
        }
    }

    /// Judge a client response against the endpoint's in-flight command.
    pub fn on_response(
        &self,
        session: SessionId,
        code: Code,
        uri: Option<&Lwm2mUri>,
        registry: &mut EndpointRegistry,
    ) -> Verdict {
        let Some(endpoint) = registry.find_mut(session) else {
            info!("{session}: response {code} from unknown session");
            return Verdict::NoError;
        };
        if endpoint.status() != CommandStatus::Sent {
            debug!(
                "{session}: stale response {code} while {:?}",
                endpoint.status()
            );
            return Verdict::NoError;
        }
        let expected = match endpoint.current_command() {
            Some(Command::Delete(_)) => Some(Code::DELETED),
            Some(Command::WriteSecurity(_) | Command::WriteServer(_)) => Some(Code::CHANGED),
            Some(Command::Finish) | None => None,
        };
        let target = uri.map_or_else(|| "-".to_owned(), ToString::to_string);
        match expected {
            Some(expected) if expected == code => {
                debug!("{session}: {target} answered {code}");
                endpoint.mark_ok();
            }
            Some(expected) => {
                warn!("{session}: {target} answered {code}, expected {expected}");
                endpoint.mark_failed();
            }
            None => {
                debug!("{session}: finish answered {code}");
                endpoint.mark_finish_answered();
            }
        }
        Verdict::NoError
    }

    /// Advance `endpoint` if its last command succeeded and send whatever is next.
    pub fn dispatch(
        &self,
        endpoint: &mut Endpoint,
        engine: &mut dyn ProtocolEngine,
        out: &mut dyn Outbound,
        now: Instant,
    ) {
        match endpoint.status() {
            CommandStatus::Ok => {
                endpoint.advance();
            }
            CommandStatus::New => {}
            CommandStatus::Sent | CommandStatus::Failed => return,
        }
        let Some(command) = endpoint.current_command().cloned() else {
            return;
        };
        let session = endpoint.session();
        let sent = match &command {
            Command::Delete(uri) => engine.delete(session, uri, out).map(|()| true),
            Command::WriteSecurity(server_id) => {
                let payload = self
                    .config
                    .server(*server_id)
                    .and_then(ServerDescriptor::security_payload);
                self.write(engine, out, session, Lwm2mUri::security(*server_id), payload)
            }
            Command::WriteServer(server_id) => {
                let payload = self
                    .config
                    .server(*server_id)
                    .and_then(ServerDescriptor::server_payload);
                self.write(engine, out, session, Lwm2mUri::server(*server_id), payload)
            }
            Command::Finish => engine.finish(session, out).map(|()| true),
        };
        match sent {
            Ok(true) => {
                debug!("{session}: sent {command}");
                endpoint.mark_sent(now);
            }
            Ok(false) => {
                warn!("{session}: {command} has no configured payload");
                endpoint.mark_failed();
            }
            Err(err) => {
                warn!("{session}: {command} failed: {err}");
                endpoint.mark_failed();
            }
        }
    }

    /// One dispatch pass over the whole registry.
    pub fn dispatch_all(
        &self,
        registry: &mut EndpointRegistry,
        engine: &mut dyn ProtocolEngine,
        out: &mut dyn Outbound,
        now: Instant,
    ) {
        for endpoint in registry.iter_mut() {
            self.dispatch(endpoint, engine, out, now);
        }
    }

    /// Fail endpoints whose in-flight command exceeded the stall timeout.
    pub fn expire_stalled(&self, registry: &mut EndpointRegistry, now: Instant) -> usize {
        let Some(timeout) = self.command_timeout else {
            return 0;
        };
        let mut expired = 0;
        for endpoint in registry.iter_mut() {
            let stalled = endpoint.status() == CommandStatus::Sent
                && endpoint
                    .sent_at()
                    .is_some_and(|sent| now.saturating_duration_since(sent) >= timeout);
            if stalled {
                warn!(
                    "{}: no response to command {} within {timeout:?}",
                    endpoint.session(),
                    endpoint.cursor()
                );
                endpoint.mark_failed();
                expired += 1;
            }
        }
        expired
    }

    /// Earliest instant at which [`Self::expire_stalled`] has work.
    #[must_use]
    pub fn next_deadline(&self, registry: &EndpointRegistry) -> Option<Instant> {
        let timeout = self.command_timeout?;
        registry
            .iter()
            .filter(|endpoint| endpoint.status() == CommandStatus::Sent)
            .filter_map(Endpoint::sent_at)
            .map(|sent| sent + timeout)
            .min()
    }

    fn write(
        &self,
        engine: &mut dyn ProtocolEngine,
        out: &mut dyn Outbound,
        session: SessionId,
        uri: Lwm2mUri,
        payload: Option<&[u8]>,
    ) -> Result<bool, EngineError> {
        match payload {
            Some(payload) => engine
                .write(session, &uri, ContentFormat::TLV, payload, out)
                .map(|()| true),
            None => Ok(false),
        }
    }
}
