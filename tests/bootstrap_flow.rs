// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Sequencing scenarios driven through a recording protocol engine.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lwm2m_bootstrap::engine::Code;
use lwm2m_bootstrap::{
    BootstrapConfig, Command, CommandSequencer, CommandStatus, ContentFormat, EndpointProfile,
    EndpointRegistry, EngineError, EngineEvent, Lwm2mUri, Outbound, ProtocolEngine,
    ServerDescriptor, SessionId, Verdict,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Sent {
    Delete(SessionId, Lwm2mUri),
    Write(SessionId, Lwm2mUri, Vec<u8>),
    Finish(SessionId),
}

#[derive(Default)]
struct RecordingEngine {
    sent: Vec<Sent>,
    refuse_sends: bool,
}

impl RecordingEngine {
    fn record(&mut self, session: SessionId, sent: Sent) -> Result<(), EngineError> {
        if self.refuse_sends {
            return Err(EngineError::UnknownSession(session));
        }
        self.sent.push(sent);
        Ok(())
    }
}

impl ProtocolEngine for RecordingEngine {
    fn step(&mut self, _now: Instant) -> Result<Duration, EngineError> {
        Ok(Duration::from_secs(60))
    }

    fn handle_packet(
        &mut self,
        _session: SessionId,
        _datagram: &[u8],
        _now: Instant,
        _out: &mut dyn Outbound,
    ) -> Result<Option<EngineEvent>, EngineError> {
        Ok(None)
    }

    fn answer(
        &mut self,
        _event: &EngineEvent,
        _verdict: Verdict,
        _out: &mut dyn Outbound,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    fn delete(
        &mut self,
        session: SessionId,
        uri: &Lwm2mUri,
        _out: &mut dyn Outbound,
    ) -> Result<(), EngineError> {
        self.record(session, Sent::Delete(session, *uri))
    }

    fn write(
        &mut self,
        session: SessionId,
        uri: &Lwm2mUri,
        format: ContentFormat,
        payload: &[u8],
        _out: &mut dyn Outbound,
    ) -> Result<(), EngineError> {
        assert_eq!(format, ContentFormat::TLV);
        self.record(session, Sent::Write(session, *uri, payload.to_vec()))
    }

    fn finish(&mut self, session: SessionId, _out: &mut dyn Outbound) -> Result<(), EngineError> {
        self.record(session, Sent::Finish(session))
    }

    fn forget_session(&mut self, _session: SessionId) {}

    fn close(&mut self) {}
}

struct NoWire;

impl Outbound for NoWire {
    fn send(&mut self, _session: SessionId, _datagram: &[u8]) -> Result<(), EngineError> {
        Ok(())
    }
}

struct Harness {
    sequencer: CommandSequencer,
    registry: EndpointRegistry,
    engine: RecordingEngine,
}

impl Harness {
    fn new(profiles: Vec<EndpointProfile>) -> Self {
        let mut servers = BTreeMap::new();
        servers.insert(1, ServerDescriptor::new(vec![0xC8, 0x00], vec![0xC1, 0x01]));
        let config = BootstrapConfig::new(profiles, servers).expect("valid config");
        Self {
            sequencer: CommandSequencer::new(Arc::new(config)),
            registry: EndpointRegistry::default(),
            engine: RecordingEngine::default(),
        }
    }

    fn request(&mut self, session: SessionId, name: &str) -> Verdict {
        let event = EngineEvent::BootstrapRequest {
            session,
            name: name.to_owned(),
        };
        self.sequencer.handle_event(&event, &mut self.registry)
    }

    fn respond(&mut self, session: SessionId, code: Code) -> Verdict {
        let event = EngineEvent::Response {
            session,
            code,
            uri: None,
        };
        self.sequencer.handle_event(&event, &mut self.registry)
    }

    fn pass(&mut self) -> Vec<SessionId> {
        let reaped = self
            .registry
            .reap()
            .into_iter()
            .map(|endpoint| endpoint.session())
            .collect();
        self.sequencer
            .dispatch_all(&mut self.registry, &mut self.engine, &mut NoWire, Instant::now());
        reaped
    }

    fn status(&self, session: SessionId) -> Option<CommandStatus> {
        self.registry.find(session).map(|endpoint| endpoint.status())
    }
}

fn sid(index: u32) -> SessionId {
    SessionId::from_parts(index, 0)
}

fn full_profile(name: &str) -> EndpointProfile {
    EndpointProfile::named(
        name,
        vec![
            Command::Delete(Lwm2mUri::object(0)),
            Command::WriteSecurity(1),
            Command::WriteServer(1),
            Command::Finish,
        ],
    )
}

#[test]
fn full_sequence_runs_to_completion_and_is_reaped() {
    let mut harness = Harness::new(vec![full_profile("dev1")]);
    let dev = sid(1);
    assert_eq!(harness.request(dev, "dev1"), Verdict::Accept);

    let replies = [Code::DELETED, Code::CHANGED, Code::CHANGED, Code::CHANGED];
    for reply in replies {
        assert!(harness.pass().is_empty());
        assert_eq!(harness.status(dev), Some(CommandStatus::Sent));
        assert_eq!(harness.respond(dev, reply), Verdict::NoError);
    }
    assert!(harness.registry.find(dev).unwrap().finish_answered());
    assert_eq!(harness.pass(), vec![dev]);
    assert!(harness.registry.find(dev).is_none());
    assert!(harness.pass().is_empty());

    assert_eq!(
        harness.engine.sent,
        vec![
            Sent::Delete(dev, Lwm2mUri::object(0)),
            Sent::Write(dev, Lwm2mUri::security(1), vec![0xC8, 0x00]),
            Sent::Write(dev, Lwm2mUri::server(1), vec![0xC1, 0x01]),
            Sent::Finish(dev),
        ]
    );
}

#[test]
fn unknown_endpoint_without_wildcard_is_ignored() {
    let mut harness = Harness::new(vec![full_profile("dev1")]);
    assert_eq!(harness.request(sid(2), "unknown"), Verdict::Ignore);
    assert!(harness.registry.is_empty());
    harness.pass();
    assert!(harness.engine.sent.is_empty());
}

#[test]
fn wildcard_serves_unmatched_names_only() {
    let mut harness = Harness::new(vec![
        full_profile("dev1"),
        EndpointProfile::wildcard(vec![Command::Finish]),
    ]);
    assert_eq!(harness.request(sid(1), "dev1"), Verdict::Accept);
    assert_eq!(harness.request(sid(2), "other"), Verdict::Accept);
    harness.pass();
    assert!(harness
        .engine
        .sent
        .contains(&Sent::Delete(sid(1), Lwm2mUri::object(0))));
    assert!(harness.engine.sent.contains(&Sent::Finish(sid(2))));
}

#[test]
fn missing_server_descriptor_fails_without_sending() {
    let mut harness = Harness::new(vec![EndpointProfile::named(
        "dev3",
        vec![Command::WriteSecurity(5), Command::Finish],
    )]);
    harness.request(sid(3), "dev3");
    harness.pass();
    assert_eq!(harness.status(sid(3)), Some(CommandStatus::Failed));
    assert!(harness.engine.sent.is_empty());
    assert_eq!(harness.pass(), vec![sid(3)]);
    assert!(harness.registry.is_empty());
}

#[test]
fn reregistration_mid_sequence_restarts_and_ignores_late_response() {
    let mut harness = Harness::new(vec![full_profile("dev2")]);
    let dev = sid(4);
    harness.request(dev, "dev2");
    harness.pass();
    assert_eq!(harness.status(dev), Some(CommandStatus::Sent));

    assert_eq!(harness.request(dev, "dev2"), Verdict::Accept);
    let endpoint = harness.registry.find(dev).unwrap();
    assert_eq!(endpoint.status(), CommandStatus::New);
    assert_eq!(endpoint.cursor(), 0);
    assert_eq!(harness.registry.len(), 1);

    assert_eq!(harness.respond(dev, Code::DELETED), Verdict::NoError);
    assert_eq!(harness.status(dev), Some(CommandStatus::New));

    harness.pass();
    assert_eq!(harness.status(dev), Some(CommandStatus::Sent));
    assert_eq!(harness.engine.sent.len(), 2);
}

#[test]
fn unexpected_response_code_fails_endpoint() {
    let mut harness = Harness::new(vec![EndpointProfile::named(
        "dev5",
        vec![Command::WriteServer(1), Command::Finish],
    )]);
    harness.request(sid(5), "dev5");
    harness.pass();
    harness.respond(sid(5), Code::BAD_REQUEST);
    assert_eq!(harness.status(sid(5)), Some(CommandStatus::Failed));
    assert_eq!(harness.pass(), vec![sid(5)]);
    assert_eq!(harness.engine.sent.len(), 1);
}

#[test]
fn delete_answered_with_changed_is_a_failure() {
    let mut harness = Harness::new(vec![full_profile("dev6")]);
    harness.request(sid(6), "dev6");
    harness.pass();
    harness.respond(sid(6), Code::CHANGED);
    assert_eq!(harness.status(sid(6)), Some(CommandStatus::Failed));
}

#[test]
fn engine_send_error_fails_endpoint() {
    let mut harness = Harness::new(vec![full_profile("dev7")]);
    harness.engine.refuse_sends = true;
    harness.request(sid(7), "dev7");
    harness.pass();
    assert_eq!(harness.status(sid(7)), Some(CommandStatus::Failed));
}

#[test]
fn finish_that_cannot_be_sent_is_not_a_close() {
    let mut harness = Harness::new(vec![full_profile("dev8")]);
    let dev = sid(8);
    harness.request(dev, "dev8");
    for reply in [Code::DELETED, Code::CHANGED, Code::CHANGED] {
        harness.pass();
        harness.respond(dev, reply);
    }
    harness.engine.refuse_sends = true;
    assert!(harness.pass().is_empty());

    let endpoint = harness.registry.find(dev).unwrap();
    assert_eq!(endpoint.current_command(), Some(&Command::Finish));
    assert_eq!(endpoint.status(), CommandStatus::Failed);
    assert!(!endpoint.finish_answered());
    assert_eq!(harness.pass(), vec![dev]);
}

#[test]
fn responses_for_unknown_or_idle_sessions_are_harmless() {
    let mut harness = Harness::new(vec![full_profile("dev8")]);
    assert_eq!(harness.respond(sid(99), Code::DELETED), Verdict::NoError);
    harness.request(sid(8), "dev8");
    assert_eq!(harness.respond(sid(8), Code::DELETED), Verdict::NoError);
    assert_eq!(harness.status(sid(8)), Some(CommandStatus::New));
}

#[test]
fn full_registry_answers_internal_error() {
    let config = BootstrapConfig::new(
        vec![EndpointProfile::wildcard(vec![Command::Finish])],
        BTreeMap::new(),
    )
    .unwrap();
    let sequencer = CommandSequencer::new(Arc::new(config));
    let mut registry = EndpointRegistry::with_capacity(1);
    assert_eq!(
        sequencer.on_bootstrap_request(sid(1), "a", &mut registry),
        Verdict::Accept
    );
    assert_eq!(
        sequencer.on_bootstrap_request(sid(2), "b", &mut registry),
        Verdict::InternalError
    );
    assert_eq!(registry.len(), 1);
}

#[test]
fn stall_timeout_fails_unanswered_commands() {
    let config = BootstrapConfig::new(vec![full_profile("slow")], BTreeMap::new()).unwrap();
    let sequencer =
        CommandSequencer::new(Arc::new(config)).with_command_timeout(Some(Duration::from_secs(5)));
    let mut registry = EndpointRegistry::default();
    let mut engine = RecordingEngine::default();
    sequencer.on_bootstrap_request(sid(1), "slow", &mut registry);

    let start = Instant::now();
    sequencer.dispatch_all(&mut registry, &mut engine, &mut NoWire, start);
    assert_eq!(
        sequencer.next_deadline(&registry),
        Some(start + Duration::from_secs(5))
    );
    assert_eq!(sequencer.expire_stalled(&mut registry, start + Duration::from_secs(4)), 0);
    assert_eq!(sequencer.expire_stalled(&mut registry, start + Duration::from_secs(5)), 1);
    assert_eq!(
        registry.find(sid(1)).map(|endpoint| endpoint.status()),
        Some(CommandStatus::Failed)
    );
    assert!(sequencer.next_deadline(&registry).is_none());
}

#[test]
fn no_stall_timeout_by_default() {
    let config = BootstrapConfig::new(vec![full_profile("slow")], BTreeMap::new()).unwrap();
    let sequencer = CommandSequencer::new(Arc::new(config));
    let mut registry = EndpointRegistry::default();
    let mut engine = RecordingEngine::default();
    sequencer.on_bootstrap_request(sid(1), "slow", &mut registry);
    let start = Instant::now();
    sequencer.dispatch_all(&mut registry, &mut engine, &mut NoWire, start);
    assert!(sequencer.next_deadline(&registry).is_none());
    assert_eq!(
        sequencer.expire_stalled(&mut registry, start + Duration::from_secs(3600)),
        0
    );
}
