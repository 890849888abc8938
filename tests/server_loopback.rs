// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Drive a running bootstrap server over loopback UDP.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lwm2m_bootstrap::engine::coap::{Message, MessageType};
use lwm2m_bootstrap::engine::Code;
use lwm2m_bootstrap::{BootstrapConfig, BootstrapServer, ServerConfig, ShutdownHandle};

const PROFILE: &str = r#"
[[server]]
id = 1
security = "c8 00 01"

[[endpoint]]
name = "loop1"
commands = [
    { op = "delete", uri = "/0" },
    { op = "write_security", server = 1 },
    { op = "finish" },
]
"#;

fn start_server() -> (SocketAddr, ShutdownHandle, thread::JoinHandle<()>) {
    let profiles = Arc::new(BootstrapConfig::from_toml_str(PROFILE).unwrap());
    let config = ServerConfig {
        bind: SocketAddr::from(([127, 0, 0, 1], 0)),
        console: false,
        handle_signals: false,
        ..ServerConfig::default()
    };
    let (tx, rx) = mpsc::channel();
    let worker = thread::spawn(move || {
        let mut server = BootstrapServer::bind(config, profiles).expect("server binds");
        tx.send((server.local_addr(), server.shutdown_handle()))
            .expect("test thread waiting");
        server.run().expect("event loop exits cleanly");
    });
    let (addr, handle) = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("server started");
    (addr, handle, worker)
}

fn client() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    socket
}

fn recv(socket: &UdpSocket) -> Message {
    let mut buf = [0u8; 1024];
    let (len, _) = socket.recv_from(&mut buf).expect("server replied");
    Message::decode(&buf[..len]).expect("valid CoAP from server")
}

fn bootstrap_request(name: &str, message_id: u16) -> Vec<u8> {
    let mut request =
        Message::new(MessageType::Confirmable, Code::POST, message_id).with_token(vec![0x42]);
    request.add_uri_path("bs");
    request.add_uri_query(&format!("ep={name}"));
    request.encode().unwrap()
}

fn acknowledge(socket: &UdpSocket, server: SocketAddr, request: &Message, code: Code) {
    let ack = Message::new(MessageType::Acknowledgement, code, request.message_id)
        .with_token(request.token.clone());
    socket.send_to(&ack.encode().unwrap(), server).unwrap();
}

#[test]
fn client_is_walked_through_its_profile() {
    let (server, handle, worker) = start_server();
    let socket = client();

    socket
        .send_to(&bootstrap_request("loop1", 0x0010), server)
        .unwrap();
    let accepted = recv(&socket);
    assert_eq!(accepted.kind, MessageType::Acknowledgement);
    assert_eq!(accepted.code, Code::CHANGED);
    assert_eq!(accepted.message_id, 0x0010);

    let delete = recv(&socket);
    assert_eq!(delete.code, Code::DELETE);
    assert_eq!(delete.uri_path(), vec!["0".to_owned()]);
    acknowledge(&socket, server, &delete, Code::DELETED);

    let write = recv(&socket);
    assert_eq!(write.code, Code::PUT);
    assert_eq!(write.uri_path(), vec!["0".to_owned(), "1".to_owned()]);
    assert_eq!(write.content_format(), Some(11542));
    assert_eq!(write.payload, vec![0xC8, 0x00, 0x01]);
    acknowledge(&socket, server, &write, Code::CHANGED);

    let finish = recv(&socket);
    assert_eq!(finish.code, Code::POST);
    assert_eq!(finish.uri_path(), vec!["bs".to_owned()]);
    acknowledge(&socket, server, &finish, Code::CHANGED);

    handle.shutdown().unwrap();
    worker.join().expect("server thread");
}

#[test]
fn failed_write_stops_the_sequence() {
    let (server, handle, worker) = start_server();
    let socket = client();

    socket
        .send_to(&bootstrap_request("loop1", 0x0020), server)
        .unwrap();
    assert_eq!(recv(&socket).code, Code::CHANGED);
    let delete = recv(&socket);
    acknowledge(&socket, server, &delete, Code::NOT_FOUND);

    socket
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    let mut buf = [0u8; 1024];
    let err = socket.recv_from(&mut buf).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut));

    handle.shutdown().unwrap();
    worker.join().expect("server thread");
}

fn assert_silent(socket: &UdpSocket) {
    socket
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    let mut buf = [0u8; 1024];
    let err = socket.recv_from(&mut buf).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut));
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
}

#[test]
fn late_response_after_reregistration_is_dropped() {
    let (server, handle, worker) = start_server();
    let socket = client();

    socket
        .send_to(&bootstrap_request("loop1", 0x0040), server)
        .unwrap();
    assert_eq!(recv(&socket).code, Code::CHANGED);
    let replaced = recv(&socket);
    assert_eq!(replaced.code, Code::DELETE);

    socket
        .send_to(&bootstrap_request("loop1", 0x0041), server)
        .unwrap();
    let accepted = recv(&socket);
    assert_eq!(accepted.code, Code::CHANGED);
    assert_eq!(accepted.message_id, 0x0041);
    let restarted = recv(&socket);
    assert_eq!(restarted.code, Code::DELETE);
    assert_ne!(restarted.token, replaced.token);

    acknowledge(&socket, server, &replaced, Code::DELETED);
    assert_silent(&socket);

    acknowledge(&socket, server, &restarted, Code::DELETED);
    let write = recv(&socket);
    assert_eq!(write.code, Code::PUT);
    assert_eq!(write.uri_path(), vec!["0".to_owned(), "1".to_owned()]);

    handle.shutdown().unwrap();
    worker.join().expect("server thread");
}

#[test]
fn unknown_endpoint_gets_no_reply() {
    let (server, handle, worker) = start_server();
    let socket = client();
    socket
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    socket
        .send_to(&bootstrap_request("stranger", 0x0030), server)
        .unwrap();
    let mut buf = [0u8; 1024];
    let err = socket.recv_from(&mut buf).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut));

    handle.shutdown().unwrap();
    worker.join().expect("server thread");
}
