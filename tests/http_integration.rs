//! Full-stack scenarios driving `Server` end to end over a real TCP socket,
//! exercising accept, parse, respond, and (for register/login) the database
//! hook path with no pool configured.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use evhttpd::config::Config;
use evhttpd::server::Server;

fn spawn_server(root: &str) -> std::net::SocketAddr {
    let yaml = format!(
        "servers:\n  - host: 127.0.0.1\n    ports: [0]\n    server_name: default\n    root: {root}\n    default_server: true\nworker_count: 2\nidle_timeout_ms: 300\n"
    );
    let config = Config::from_str(&yaml).unwrap();
    let mut server = Server::new(config).unwrap();
    let addr = server.local_addr();
    thread::spawn(move || {
        let _ = server.run();
    });
    std::thread::sleep(Duration::from_millis(50));
    addr
}

fn roundtrip(addr: std::net::SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(request).unwrap();
    stream.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
    let mut received = Vec::new();
    let _ = stream.read_to_end(&mut received);
    String::from_utf8_lossy(&received).into_owned()
}

#[test]
fn get_root_normalizes_path_and_serves_index() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), b"<h1>hi</h1>").unwrap();
    let addr = spawn_server(dir.path().to_str().unwrap());

    let response = roundtrip(addr, b"GET / HTTP/1.1\r\nHost: default\r\nConnection: close\r\n\r\n");
    assert!(response.contains("200 OK"));
    assert!(response.contains("Content-type: text/html"));
    assert!(response.contains("<h1>hi</h1>"));
}

#[test]
fn missing_file_returns_canned_404() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_server(dir.path().to_str().unwrap());

    let response = roundtrip(addr, b"GET /nope.html HTTP/1.1\r\nHost: default\r\nConnection: close\r\n\r\n");
    assert!(response.contains("404 Not Found"));
}

#[test]
fn register_without_db_pool_redirects_to_error_page() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_server(dir.path().to_str().unwrap());

    // No trailing CRLF after the body: a real client's form POST ends at the
    // last body byte (Content-Length framing), not a line terminator.
    let body = "username=alice&password=pw";
    let request = format!(
        "POST /register.html HTTP/1.1\r\nHost: default\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let response = roundtrip(addr, request.as_bytes());
    // no db configured: verify_user always fails, so the request is
    // rewritten to /error.html and a 404 comes back (the page doesn't exist
    // under the test root).
    assert!(response.contains("404 Not Found"));
}

#[test]
fn keep_alive_connection_serves_two_requests() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.html"), b"A").unwrap();
    std::fs::write(dir.path().join("b.html"), b"B").unwrap();
    let addr = spawn_server(dir.path().to_str().unwrap());

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_millis(500))).unwrap();

    stream
        .write_all(b"GET /a.html HTTP/1.1\r\nHost: default\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let mut buf = [0u8; 4096];
    let n = stream.read(&mut buf).unwrap();
    let first = String::from_utf8_lossy(&buf[..n]);
    assert!(first.contains("200 OK"));
    assert!(first.ends_with('A'));

    stream
        .write_all(b"GET /b.html HTTP/1.1\r\nHost: default\r\nConnection: close\r\n\r\n")
        .unwrap();
    let mut second = Vec::new();
    let _ = stream.read_to_end(&mut second);
    let second = String::from_utf8_lossy(&second);
    assert!(second.contains("200 OK"));
    assert!(second.ends_with('B'));
}

#[test]
fn idle_connection_is_closed_by_the_timer() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_server(dir.path().to_str().unwrap());

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_millis(1000))).unwrap();
    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "idle connection should be closed by the server");
}
