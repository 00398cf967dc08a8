//! Helpers shared by the end-to-end tests

#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::Duration;

use sentinel_gateway::config::Config;
use sentinel_gateway::server::{Server, ShutdownHandle};

/// A gateway running on its own thread; stopped on drop.
pub struct Running {
    pub addr: SocketAddr,
    handle: ShutdownHandle,
    thread: Option<JoinHandle<io::Result<()>>>,
}

impl Drop for Running {
    fn drop(&mut self) {
        self.handle.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub fn start(yaml: &str) -> Running {
    let gateway = Config::from_yaml(yaml).unwrap().build().unwrap();
    let server = Server::bind(gateway).unwrap();
    let addr = server.local_addr();
    let handle = server.shutdown_handle();
    let thread = std::thread::spawn(move || server.run());
    Running {
        addr,
        handle,
        thread: Some(thread),
    }
}

/// A fresh, empty directory under the system temp dir.
pub fn docroot(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("sentinel-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Splits a byte stream into responses. `bodyless[i]` marks a response to HEAD.
pub fn parse_responses(mut bytes: &[u8], bodyless: &[bool]) -> Vec<Response> {
    let mut responses = Vec::new();
    let mut index = 0;
    while !bytes.is_empty() {
        let end = bytes
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("incomplete response head");
        let head = std::str::from_utf8(&bytes[..end]).unwrap();
        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap();
        let status = status_line.split(' ').nth(1).unwrap().parse().unwrap();
        let headers: Vec<(String, String)> = lines
            .map(|line| {
                let (name, value) = line.split_once(':').unwrap();
                (name.to_string(), value.trim().to_string())
            })
            .collect();

        let mut response = Response {
            status,
            headers,
            body: Vec::new(),
        };
        let length = if bodyless.get(index).copied().unwrap_or(false) {
            0
        } else {
            response
                .header("Content-Length")
                .map_or(0, |v| v.parse::<usize>().unwrap())
        };
        let body_start = end + 4;
        response.body = bytes[body_start..body_start + length].to_vec();
        bytes = &bytes[body_start + length..];
        responses.push(response);
        index += 1;
    }
    responses
}

/// Sends `request` and reads until the gateway closes the connection.
pub fn exchange(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream.write_all(request).unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).unwrap();
    reply
}

pub fn get(addr: SocketAddr, request: &str) -> Response {
    let bytes = exchange(addr, request.as_bytes());
    let head = request.starts_with("HEAD ");
    parse_responses(&bytes, &[head]).into_iter().next().expect("no response")
}

/// Same as [`exchange`] from async code.
pub async fn exchange_async(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut reply))
        .await
        .expect("gateway did not answer")
        .unwrap();
    reply
}

pub async fn get_async(addr: SocketAddr, request: &[u8]) -> Response {
    let bytes = exchange_async(addr, request).await;
    parse_responses(&bytes, &[request.starts_with(b"HEAD ")])
        .into_iter()
        .next()
        .expect("no response")
}
