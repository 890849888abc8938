// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Track active bootstrap sessions and their command cursors.
// Author: Lukas Bower

//! Endpoint registry holding one bootstrap session per connection.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};
use thiserror::Error;

use crate::config::{Command, EndpointProfile};
use crate::connection::SessionId;

/// Default bound on concurrently bootstrapping endpoints.
pub const DEFAULT_MAX_ENDPOINTS: usize = 1024;

/// Progress of the command at an endpoint's cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Not yet dispatched.
    New,
    /// Dispatched, awaiting the client's response.
    Sent,
    /// Acknowledged with the expected code; the cursor advances on the next pass.
    Ok,
    /// Terminal: the session is removed on the next reap.
    Failed,
}

/// Registry failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The registry holds its configured number of sessions.
    #[error("endpoint registry full ({capacity} sessions)")]
    Full {
        /// Configured capacity.
        capacity: usize,
    },
}

/// One endpoint being bootstrapped.
#[derive(Debug, Clone)]
pub struct Endpoint {
    session: SessionId,
    name: String,
    profile: Arc<EndpointProfile>,
    cursor: usize,
    status: CommandStatus,
    sent_at: Option<Instant>,
    finish_answered: bool,
}

impl Endpoint {
    /// Fresh endpoint positioned at the head of `profile`.
    #[must_use]
    pub fn new(session: SessionId, name: impl Into<String>, profile: Arc<EndpointProfile>) -> Self {
        Self {
            session,
            name: name.into(),
            profile,
            cursor: 0,
            status: CommandStatus::New,
            sent_at: None,
            finish_answered: false,
        }
    }

    /// Connection the endpoint registered from.
    #[must_use]
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Endpoint client name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Profile driving this session.
    #[must_use]
    pub fn profile(&self) -> &Arc<EndpointProfile> {
        &self.profile
    }

    /// Index of the current command.
    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Status of the current command.
    #[must_use]
    pub fn status(&self) -> CommandStatus {
        self.status
    }

    /// When the in-flight command was sent.
    #[must_use]
    pub fn sent_at(&self) -> Option<Instant> {
        self.sent_at
    }

    /// Command at the cursor; `None` once the profile is exhausted.
    #[must_use]
    pub fn current_command(&self) -> Option<&Command> {
        self.profile.commands().get(self.cursor)
    }

    /// Whether every command has been consumed.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.profile.commands().len()
    }

    /// Whether the next reap removes this endpoint.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.status == CommandStatus::Failed || self.is_exhausted()
    }

    /// Record a successful dispatch.
    pub fn mark_sent(&mut self, now: Instant) {
        self.status = CommandStatus::Sent;
        self.sent_at = Some(now);
    }

    /// Record the expected response for the in-flight command.
    pub fn mark_ok(&mut self) {
        if self.status == CommandStatus::Sent {
            self.status = CommandStatus::Ok;
            self.sent_at = None;
        }
    }

    /// Move to the terminal failure state.
    pub fn mark_failed(&mut self) {
        self.status = CommandStatus::Failed;
        self.sent_at = None;
    }

    /// Record the client's answer to Finish; the session ends on the next reap.
    pub fn mark_finish_answered(&mut self) {
        self.mark_failed();
        self.finish_answered = true;
    }

    /// Whether the client answered Finish.
    #[must_use]
    pub fn finish_answered(&self) -> bool {
        self.finish_answered
    }

    /// Step past an acknowledged command. Returns `false` unless the status was `Ok`.
    pub fn advance(&mut self) -> bool {
        if self.status != CommandStatus::Ok {
            return false;
        }
        self.cursor += 1;
        self.status = CommandStatus::New;
        true
    }
}

/// Active sessions, most recently registered first.
#[derive(Debug)]
pub struct EndpointRegistry {
    endpoints: VecDeque<Endpoint>,
    capacity: usize,
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENDPOINTS)
    }
}

impl EndpointRegistry {
    /// Registry admitting at most `capacity` sessions.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            endpoints: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Endpoint for `session`.
    #[must_use]
    pub fn find(&self, session: SessionId) -> Option<&Endpoint> {
        self.endpoints.iter().find(|ep| ep.session == session)
    }

    /// Mutable endpoint for `session`.
    pub fn find_mut(&mut self, session: SessionId) -> Option<&mut Endpoint> {
        self.endpoints.iter_mut().find(|ep| ep.session == session)
    }

    /// Start a session for `session`, discarding any previous one on the same connection.
    pub fn upsert(
        &mut self,
        session: SessionId,
        name: &str,
        profile: Arc<EndpointProfile>,
    ) -> Result<&mut Endpoint, RegistryError> {
        let replaced = match self.endpoints.iter().position(|ep| ep.session == session) {
            Some(index) => self.endpoints.remove(index),
            None => None,
        };
        if replaced.is_none() && self.endpoints.len() >= self.capacity {
            return Err(RegistryError::Full {
                capacity: self.capacity,
            });
        }
        if let Some(old) = replaced {
            debug!(
                "{session}: re-registration of '{}' discards cursor {}",
                old.name, old.cursor
            );
        }
        self.endpoints
            .push_front(Endpoint::new(session, name, profile));
        Ok(&mut self.endpoints[0])
    }

    /// Remove every finished or failed endpoint and return them in registry order.
    pub fn reap(&mut self) -> Vec<Endpoint> {
        if !self.endpoints.iter().any(Endpoint::is_finished) {
            return Vec::new();
        }
        let mut reaped = Vec::new();
        let mut survivors = VecDeque::with_capacity(self.endpoints.len());
        for endpoint in self.endpoints.drain(..) {
            if endpoint.is_finished() {
                reaped.push(endpoint);
            } else {
                survivors.push_back(endpoint);
            }
        }
        self.endpoints = survivors;
        for endpoint in &reaped {
            if endpoint.finish_answered {
                info!(
                    "{}: bootstrap of '{}' closed after finish",
                    endpoint.session, endpoint.name
                );
            } else if endpoint.status == CommandStatus::Failed {
                info!(
                    "{}: bootstrap of '{}' failed at command {}",
                    endpoint.session, endpoint.name, endpoint.cursor
                );
            } else {
                info!(
                    "{}: bootstrap of '{}' completed",
                    endpoint.session, endpoint.name
                );
            }
        }
        reaped
    }

    /// Drop every session regardless of state.
    pub fn destroy_all(&mut self) {
        if !self.endpoints.is_empty() {
            debug!("dropping {} endpoint sessions", self.endpoints.len());
        }
        self.endpoints.clear();
    }

    /// Sessions in registry order.
    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter()
    }

    /// Mutable sessions in registry order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Endpoint> {
        self.endpoints.iter_mut()
    }

    /// Number of sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Whether no session is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
