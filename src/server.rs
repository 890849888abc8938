// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Single-threaded event loop multiplexing the UDP socket, console and signals.
// Author: Lukas Bower

//! Bootstrap server event loop.
//!
//! One `mio::Poll` waits on the UDP socket, stdin, SIGINT/SIGTERM and a waker used by
//! [`ShutdownHandle`]. Every iteration steps the engine, waits at most until its next
//! deadline, routes whatever became ready and then runs one reap and dispatch pass.
//! Peers without a bootstrap session are forgotten after [`DEFAULT_IDLE_RELEASE`] of silence.

use std::io::{self, ErrorKind, Write};
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use mio::net::UdpSocket;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use rustix::event::{PollFd, PollFlags};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_mio::v1_0::Signals;
use thiserror::Error;

use crate::config::BootstrapConfig;
use crate::connection::{ConnectionTable, SessionId, DEFAULT_MAX_CONNECTIONS};
use crate::console::{Console, ConsoleOutcome, MAX_LINE_LEN};
use crate::engine::{
    CoapEngine, EngineError, EngineEvent, Outbound, ProtocolEngine, Verdict,
};
use crate::registry::{EndpointRegistry, DEFAULT_MAX_ENDPOINTS};
use crate::sequencer::CommandSequencer;

/// Default UDP port of the bootstrap server.
pub const DEFAULT_PORT: u16 = 5685;
/// Largest datagram received or sent.
pub const MAX_PACKET_SIZE: usize = 1024;
/// Upper bound on a single poll wait.
pub const DEFAULT_WAIT_CEILING: Duration = Duration::from_secs(60);
/// Silence after which a connection with no bootstrap session is released (CoAP MAX_TRANSMIT_SPAN).
pub const DEFAULT_IDLE_RELEASE: Duration = Duration::from_secs(45);

const SOCKET: Token = Token(0);
const CONSOLE: Token = Token(1);
const SIGNALS: Token = Token(2);
const WAKER: Token = Token(3);
const EVENT_CAPACITY: usize = 64;

/// Fatal server failures.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The UDP socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Socket failure.
        source: io::Error,
    },
    /// Poll creation, registration or wait failed.
    #[error("poll failure: {0}")]
    Poll(io::Error),
    /// Signal handlers could not be installed.
    #[error("failed to install signal handlers: {0}")]
    Signals(io::Error),
    /// The protocol engine failed to step.
    #[error("protocol engine failure: {0}")]
    Engine(#[from] EngineError),
}

/// Runtime knobs for [`BootstrapServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address the UDP socket binds to.
    pub bind: SocketAddr,
    /// Longest single poll wait.
    pub wait_ceiling: Duration,
    /// Datagram size limit in both directions.
    pub max_packet_size: usize,
    /// Peer capacity of the connection table.
    pub max_connections: usize,
    /// Concurrent bootstrap sessions.
    pub max_endpoints: usize,
    /// Fail a session whose in-flight command stays unanswered this long.
    pub command_timeout: Option<Duration>,
    /// Release connections without a bootstrap session after this much silence.
    pub idle_release: Duration,
    /// Read operator commands from stdin.
    pub console: bool,
    /// Stop on SIGINT/SIGTERM.
    pub handle_signals: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            wait_ceiling: DEFAULT_WAIT_CEILING,
            max_packet_size: MAX_PACKET_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_endpoints: DEFAULT_MAX_ENDPOINTS,
            command_timeout: None,
            idle_release: DEFAULT_IDLE_RELEASE,
            console: true,
            handle_signals: true,
        }
    }
}

/// Requests loop exit from any thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    quit: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Ask the loop to stop; it exits at the top of its next iteration.
    pub fn shutdown(&self) -> io::Result<()> {
        self.quit.store(true, Ordering::SeqCst);
        self.waker.wake()
    }

    /// Whether shutdown was requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }
}

struct SocketOutbound<'a> {
    socket: &'a UdpSocket,
    connections: &'a ConnectionTable,
}

impl Outbound for SocketOutbound<'_> {
    fn send(&mut self, session: SessionId, datagram: &[u8]) -> Result<(), EngineError> {
        let peer = self
            .connections
            .address_of(session)
            .ok_or(EngineError::UnknownSession(session))?;
        match self.socket.send_to(datagram, peer) {
            Ok(sent) if sent == datagram.len() => Ok(()),
            Ok(sent) => Err(EngineError::Transport {
                session,
                source: io::Error::new(
                    ErrorKind::WriteZero,
                    format!("short send of {sent}/{} bytes", datagram.len()),
                ),
            }),
            Err(source) => Err(EngineError::Transport { session, source }),
        }
    }
}

/// LwM2M bootstrap server bound to one UDP socket.
pub struct BootstrapServer<E: ProtocolEngine = CoapEngine> {
    poll: Poll,
    socket: UdpSocket,
    local_addr: SocketAddr,
    connections: ConnectionTable,
    registry: EndpointRegistry,
    sequencer: CommandSequencer,
    engine: E,
    console: Option<Console>,
    signals: Option<Signals>,
    quit: Arc<AtomicBool>,
    waker: Arc<Waker>,
    wait_ceiling: Duration,
    idle_release: Duration,
    recv_buf: Vec<u8>,
}

impl BootstrapServer<CoapEngine> {
    /// Bind a server speaking CoAP with the given profiles.
    pub fn bind(config: ServerConfig, profiles: Arc<BootstrapConfig>) -> Result<Self, ServerError> {
        let engine = CoapEngine::new(config.max_packet_size);
        Self::with_engine(config, profiles, engine)
    }
}

impl<E: ProtocolEngine> BootstrapServer<E> {
    /// Bind a server driving `engine`.
    pub fn with_engine(
        config: ServerConfig,
        profiles: Arc<BootstrapConfig>,
        engine: E,
    ) -> Result<Self, ServerError> {
        let poll = Poll::new().map_err(ServerError::Poll)?;
        let mut socket = UdpSocket::bind(config.bind).map_err(|source| ServerError::Bind {
            addr: config.bind,
            source,
        })?;
        let local_addr = socket.local_addr().map_err(|source| ServerError::Bind {
            addr: config.bind,
            source,
        })?;
        poll.registry()
            .register(&mut socket, SOCKET, Interest::READABLE)
            .map_err(ServerError::Poll)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER).map_err(ServerError::Poll)?);

        let signals = if config.handle_signals {
            let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(ServerError::Signals)?;
            poll.registry()
                .register(&mut signals, SIGNALS, Interest::READABLE)
                .map_err(ServerError::Poll)?;
            Some(signals)
        } else {
            None
        };

        let console = if config.console {
            let stdin = io::stdin().as_raw_fd();
            match poll
                .registry()
                .register(&mut SourceFd(&stdin), CONSOLE, Interest::READABLE)
            {
                Ok(()) => Some(Console::new()),
                Err(err) => {
                    warn!("console disabled: stdin cannot be polled ({err})");
                    None
                }
            }
        } else {
            None
        };

        let sequencer = CommandSequencer::new(profiles).with_command_timeout(config.command_timeout);
        Ok(Self {
            poll,
            socket,
            local_addr,
            connections: ConnectionTable::with_capacity(config.max_connections),
            registry: EndpointRegistry::with_capacity(config.max_endpoints),
            sequencer,
            engine,
            console,
            signals,
            quit: Arc::new(AtomicBool::new(false)),
            waker,
            wait_ceiling: config.wait_ceiling,
            idle_release: config.idle_release,
            recv_buf: vec![0u8; config.max_packet_size],
        })
    }

    /// Address the socket is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle that stops [`Self::run`] from another thread.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            quit: Arc::clone(&self.quit),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Active bootstrap sessions.
    #[must_use]
    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    /// Peer connections currently tracked.
    #[must_use]
    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    /// Serve until quit is requested, then release every session.
    pub fn run(&mut self) -> Result<(), ServerError> {
        info!(
            "bootstrap server listening on {} ({} profiles, {} servers)",
            self.local_addr,
            self.sequencer.config().profiles().len(),
            self.sequencer.config().server_count()
        );
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        let result = self.serve(&mut events);
        if let Err(err) = &result {
            error!("event loop aborted: {err}");
        }
        self.shutdown();
        result
    }

    fn serve(&mut self, events: &mut Events) -> Result<(), ServerError> {
        while !self.quit.load(Ordering::SeqCst) {
            let now = Instant::now();
            let mut timeout = self.engine.step(now)?.min(self.wait_ceiling);
            if let Some(deadline) = self.sequencer.next_deadline(&self.registry) {
                timeout = timeout.min(deadline.saturating_duration_since(now));
            }

            if let Err(err) = self.poll.poll(events, Some(timeout)) {
                if err.kind() != ErrorKind::Interrupted {
                    return Err(ServerError::Poll(err));
                }
                events.clear();
            }

            for event in events.iter() {
                match event.token() {
                    SOCKET => self.drain_socket(),
                    CONSOLE => self.read_console(),
                    SIGNALS => self.drain_signals(),
                    WAKER => debug!("shutdown requested"),
                    token => trace!("spurious readiness for {token:?}"),
                }
            }

            self.sequence(Instant::now());
        }
        Ok(())
    }

    fn drain_socket(&mut self) {
        loop {
            match self.socket.recv_from(&mut self.recv_buf) {
                Ok((len, peer)) => self.on_datagram(len, peer),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("recv failed: {err}");
                    break;
                }
            }
        }
    }

    fn on_datagram(&mut self, len: usize, peer: SocketAddr) {
        let datagram = &self.recv_buf[..len];
        trace!("{len} bytes from {peer}: {}", hex::encode(datagram));
        let now = Instant::now();
        let session = match self.connections.resolve(peer, now) {
            Ok(session) => session,
            Err(err) => {
                warn!("dropping datagram from {peer}: {err}");
                return;
            }
        };
        let mut out = SocketOutbound {
            socket: &self.socket,
            connections: &self.connections,
        };
        let event = match self
            .engine
            .handle_packet(session, datagram, now, &mut out)
        {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(err) => {
                warn!("{session}: dropping datagram from {peer}: {err}");
                return;
            }
        };
        let verdict = self.sequencer.handle_event(&event, &mut self.registry);
        if let Err(err) = self.engine.answer(&event, verdict, &mut out) {
            warn!("{session}: failed to answer {verdict:?}: {err}");
        }
        if matches!(event, EngineEvent::BootstrapRequest { .. }) && verdict == Verdict::Accept {
            // responses to the replaced session's requests must not reach the new one
            self.engine.forget_session(session);
        }
    }

    fn read_console(&mut self) {
        let Some(console) = self.console.as_mut() else {
            return;
        };
        let stdin = io::stdin();
        let mut stdout = io::stdout().lock();
        let mut buf = [0u8; MAX_LINE_LEN];
        let mut eof = false;
        loop {
            match rustix::io::read(stdin.as_fd(), &mut buf) {
                Ok(0) => {
                    eof = true;
                    if console.finish(&mut stdout) == ConsoleOutcome::Quit {
                        self.quit.store(true, Ordering::SeqCst);
                    }
                    break;
                }
                Ok(read) => {
                    if console.feed(&buf[..read], &mut stdout) == ConsoleOutcome::Quit {
                        self.quit.store(true, Ordering::SeqCst);
                    }
                }
                Err(rustix::io::Errno::INTR) => continue,
                Err(rustix::io::Errno::AGAIN) => break,
                Err(err) => {
                    warn!("console read failed: {}", io::Error::from(err));
                    eof = true;
                    break;
                }
            }
            if !stdin_has_input(&stdin) {
                break;
            }
        }
        if let Err(err) = stdout.flush() {
            debug!("stdout flush failed: {err}");
        }
        if eof {
            self.close_console();
        }
    }

    fn close_console(&mut self) {
        if self.console.take().is_none() {
            return;
        }
        let stdin = io::stdin().as_raw_fd();
        if let Err(err) = self.poll.registry().deregister(&mut SourceFd(&stdin)) {
            debug!("console deregister failed: {err}");
        }
        info!("console closed");
    }

    fn drain_signals(&mut self) {
        let Some(signals) = self.signals.as_mut() else {
            return;
        };
        for signal in signals.pending() {
            info!("received signal {signal}, shutting down");
            self.quit.store(true, Ordering::SeqCst);
        }
    }

    fn sequence(&mut self, now: Instant) {
        self.sequencer.expire_stalled(&mut self.registry, now);
        for endpoint in self.registry.reap() {
            let session = endpoint.session();
            self.engine.forget_session(session);
            self.connections.release(session);
        }
        let registry = &self.registry;
        let idle = self
            .connections
            .release_idle(now, self.idle_release, |session| registry.find(session).is_some());
        for session in idle {
            debug!("{session}: idle connection released");
            self.engine.forget_session(session);
        }
        let mut out = SocketOutbound {
            socket: &self.socket,
            connections: &self.connections,
        };
        self.sequencer
            .dispatch_all(&mut self.registry, &mut self.engine, &mut out, now);
    }

    fn shutdown(&mut self) {
        self.engine.close();
        self.registry.destroy_all();
        self.connections.clear();
        self.close_console();
        if let Some(mut signals) = self.signals.take() {
            if let Err(err) = self.poll.registry().deregister(&mut signals) {
                debug!("signal deregister failed: {err}");
            }
        }
        info!("bootstrap server on {} stopped", self.local_addr);
    }
}

fn stdin_has_input(stdin: &io::Stdin) -> bool {
    let fd = stdin.as_fd();
    let mut fds = [PollFd::new(&fd, PollFlags::IN)];
    match rustix::event::poll(&mut fds, 0) {
        Ok(ready) => ready > 0 && fds[0].revents().contains(PollFlags::IN),
        Err(_) => false,
    }
}
