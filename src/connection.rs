// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Map inbound peer addresses to generation-checked session identities.
// Author: Lukas Bower

//! Connection table resolving UDP peers to [`SessionId`]s.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::debug;
use thiserror::Error;

/// Default bound on tracked peers.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Identity of a transport peer as seen by the protocol engine.
///
/// The id pairs a slot index with the slot's generation, so an id kept past
/// [`ConnectionTable::release`] never matches the peer that reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    index: u32,
    generation: u32,
}

impl SessionId {
    /// Construct an id from raw parts. Intended for engines and tests that manage their
    /// own sessions; ids produced by a [`ConnectionTable`] should be preferred.
    #[must_use]
    pub const fn from_parts(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation.
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Errors raised by the connection table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// No slot is available for a new peer.
    #[error("connection table full ({capacity} peers)")]
    TableFull {
        /// Configured capacity.
        capacity: usize,
    },
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    peer: Option<SocketAddr>,
    last_seen: Instant,
}

/// Known peers, keyed by exact socket address.
#[derive(Debug)]
pub struct ConnectionTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_addr: HashMap<SocketAddr, SessionId>,
    capacity: usize,
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_CONNECTIONS)
    }
}

impl ConnectionTable {
    /// Table tracking at most `capacity` peers at once.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_addr: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Return the session for `peer`, creating one on first contact, and mark it seen at `now`.
    pub fn resolve(&mut self, peer: SocketAddr, now: Instant) -> Result<SessionId, ConnectionError> {
        if let Some(session) = self.by_addr.get(&peer).copied() {
            if let Some(slot) = self.slots.get_mut(session.index as usize) {
                slot.last_seen = now;
            }
            return Ok(session);
        }
        if self.by_addr.len() >= self.capacity {
            return Err(ConnectionError::TableFull {
                capacity: self.capacity,
            });
        }
        let session = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.peer = Some(peer);
                slot.last_seen = now;
                SessionId::from_parts(index, slot.generation)
            }
            None => {
                let index = u32::try_from(self.slots.len()).map_err(|_| {
                    ConnectionError::TableFull {
                        capacity: self.capacity,
                    }
                })?;
                self.slots.push(Slot {
                    generation: 0,
                    peer: Some(peer),
                    last_seen: now,
                });
                SessionId::from_parts(index, 0)
            }
        };
        self.by_addr.insert(peer, session);
        debug!("new connection {session} from {peer}");
        Ok(session)
    }

    /// Peer address for a live session; `None` once the session was released.
    #[must_use]
    pub fn address_of(&self, session: SessionId) -> Option<SocketAddr> {
        let slot = self.slots.get(session.index as usize)?;
        if slot.generation != session.generation {
            return None;
        }
        slot.peer
    }

    /// When the peer behind a live session last sent a datagram.
    #[must_use]
    pub fn last_seen(&self, session: SessionId) -> Option<Instant> {
        let slot = self.slots.get(session.index as usize)?;
        (slot.generation == session.generation && slot.peer.is_some()).then_some(slot.last_seen)
    }

    /// Release every session silent for at least `idle` unless `in_use` claims it.
    pub fn release_idle(
        &mut self,
        now: Instant,
        idle: Duration,
        in_use: impl Fn(SessionId) -> bool,
    ) -> Vec<SessionId> {
        let stale: Vec<SessionId> = self
            .by_addr
            .values()
            .copied()
            .filter(|session| {
                self.last_seen(*session)
                    .is_some_and(|seen| now.saturating_duration_since(seen) >= idle)
            })
            .filter(|session| !in_use(*session))
            .collect();
        for session in &stale {
            self.release(*session);
        }
        stale
    }

    /// Forget a session and invalidate its id. Returns the released peer.
    pub fn release(&mut self, session: SessionId) -> Option<SocketAddr> {
        let slot = self.slots.get_mut(session.index as usize)?;
        if slot.generation != session.generation {
            return None;
        }
        let peer = slot.peer.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(session.index);
        self.by_addr.remove(&peer);
        debug!("released connection {session} ({peer})");
        Some(peer)
    }

    /// Number of tracked peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    /// Whether no peer is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    /// Drop every record.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.by_addr.clear();
    }
}
