//! End-to-end tests for the HTTP proxy and FastCGI handlers

mod common;

use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use common::{Running, docroot, get_async};
use sentinel_gateway::http::buffer::Buffer;
use sentinel_gateway::http::chunked;
use sentinel_gateway::proxy::fastcgi::{
    self, EndRequest, OVERLOADED, REQUEST_COMPLETE, REQUEST_ID, RecordSink, RecordType,
};

/// `n` bytes of lowercase letters.
fn pattern(n: usize) -> Vec<u8> {
    (0..n).map(|i| b'a' + (i % 26) as u8).collect()
}

fn find(data: &[u8], needle: &[u8]) -> Option<usize> {
    data.windows(needle.len()).position(|w| w == needle)
}

/// Reads one request head and its `Content-Length` body.
async fn read_request(stream: &mut TcpStream) -> Vec<u8> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        if let Some(end) = find(&data, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&data[..end]).to_ascii_lowercase();
            let length = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .map_or(0, |v| v.trim().parse::<usize>().unwrap());
            if data.len() >= end + 4 + length {
                return data;
            }
        }
        let n = stream.read(&mut buf).await.unwrap();
        if n == 0 {
            return data;
        }
        data.extend_from_slice(&buf[..n]);
    }
}

/// An HTTP backend answering every connection with `response`.
async fn http_backend(
    response: impl Into<Vec<u8>>,
) -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    let response: Arc<[u8]> = Arc::from(Into::<Vec<u8>>::into(response));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            let response = response.clone();
            tokio::spawn(async move {
                let request = read_request(&mut stream).await;
                let _ = tx.send(request);
                let _ = stream.write_all(&response).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    (addr, rx)
}

/// A port nothing listens on.
fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// A backend that takes one connection and hands the stream to `serve`.
async fn raw_backend<F, Fut>(serve: F) -> SocketAddr
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            serve(stream).await;
        }
    });
    addr
}

/// Makes closing `stream` send a reset instead of a FIN.
fn reset_on_close(stream: &TcpStream) {
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    // SAFETY: `linger` outlives the call and its size is passed alongside.
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const libc::linger as *const libc::c_void,
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    assert_eq!(rc, 0);
}

fn gateway(rules: &str) -> Running {
    gateway_with("", rules)
}

/// `general` holds indented lines of the `general:` section.
fn gateway_with(general: &str, rules: &str) -> Running {
    let root = docroot(&format!("proxy-{}", closed_port()));
    let yaml = format!(
        "listen_addr: \"127.0.0.1:0\"\n\
         general:\n  max_connections: 1024\n{}\
         hosts:\n  - name: localhost\n    root: \"{}\"\n    default: true\n    rules:\n{}",
        general,
        root.display(),
        rules
    );
    common::start(&yaml)
}

const GET_API: &[u8] = b"GET /api/x HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";

fn http_rule(backends: &[String]) -> String {
    let list = backends
        .iter()
        .map(|b| format!("\"{}\"", b))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"      - handler: http
        criterion: path
        values: [/api]
        backends: [{}]
"#,
        list
    )
}

#[tokio::test]
async fn test_proxies_get_request() {
    let (backend, mut requests) = http_backend(
        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Backend: one\r\nConnection: close\r\n\r\n\
          hello",
    )
    .await;
    let server = gateway(&http_rule(&[backend.to_string()]));

    let response = get_async(
        server.addr,
        b"GET /api/items?id=3 HTTP/1.1\r\nHost: localhost\r\nKeep-Alive: 300\r\n\
          Content-Length: 0\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "hello");
    assert_eq!(response.header("X-Backend"), Some("one"));
    assert_eq!(response.header("Server"), Some("Sentinel"));
    assert_eq!(response.header("Connection"), Some("close"));

    let request = String::from_utf8(requests.recv().await.unwrap()).unwrap();
    assert!(request.starts_with("GET /api/items?id=3 HTTP/1.1\r\n"), "{}", request);
    assert!(request.contains("Connection: close\r\n"));
    assert!(request.contains(&format!("Host: localhost:{}\r\n", server.addr.port())));
    assert!(!request.contains("Keep-Alive"));
    assert!(!request.contains("Content-Length"));
}

#[tokio::test]
async fn test_post_body_is_forwarded() {
    let (backend, mut requests) =
        http_backend(b"HTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok").await;
    let server = gateway(&http_rule(&[backend.to_string()]));

    let response = get_async(
        server.addr,
        b"POST /api/upload HTTP/1.1\r\nHost: localhost\r\nContent-Length: 11\r\n\
          Connection: close\r\n\r\nhello world",
    )
    .await;
    assert_eq!(response.status, 201);
    assert_eq!(response.text(), "ok");

    let request = String::from_utf8(requests.recv().await.unwrap()).unwrap();
    assert!(request.starts_with("POST /api/upload HTTP/1.1\r\n"));
    assert!(request.contains("Content-Length: 11\r\n"));
    assert!(request.ends_with("\r\n\r\nhello world"));
}

#[tokio::test]
async fn test_chunked_request_is_forwarded_with_length() {
    let (backend, mut requests) =
        http_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
    let server = gateway(&http_rule(&[backend.to_string()]));

    let response = get_async(
        server.addr,
        b"PUT /api/doc HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\
          Connection: close\r\n\r\n\
          5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
    )
    .await;
    assert_eq!(response.status, 200);

    let request = String::from_utf8(requests.recv().await.unwrap()).unwrap();
    assert!(request.contains("Content-Length: 11\r\n"), "{}", request);
    assert!(!request.contains("Transfer-Encoding"));
    assert!(request.ends_with("\r\n\r\nhello world"));
}

#[tokio::test]
async fn test_chunked_response_is_relayed_with_length() {
    let (backend, _requests) = http_backend(
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n\
          0\r\n\r\n",
    )
    .await;
    let server = gateway(&http_rule(&[backend.to_string()]));

    let response = get_async(
        server.addr,
        b"GET /api/x HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "abcde");
    assert_eq!(response.header("Content-Length"), Some("5"));
    assert_eq!(response.header("Transfer-Encoding"), None);
}

#[tokio::test]
async fn test_body_until_backend_closes() {
    let (backend, _requests) =
        http_backend(b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\nstreamed body").await;
    let server = gateway(&http_rule(&[backend.to_string()]));

    let response = get_async(
        server.addr,
        b"GET /api/stream HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "streamed body");
    assert_eq!(response.header("Content-Length"), Some("13"));
}

#[tokio::test]
async fn test_head_request_through_proxy() {
    let (backend, mut requests) =
        http_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\n\r\n").await;
    let server = gateway(&http_rule(&[backend.to_string()]));

    let bytes = common::exchange_async(
        server.addr,
        b"HEAD /api/big HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    let text = String::from_utf8(bytes).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.ends_with("\r\n\r\n"));

    let request = String::from_utf8(requests.recv().await.unwrap()).unwrap();
    assert!(request.starts_with("HEAD /api/big HTTP/1.1\r\n"));
}

#[tokio::test]
async fn test_invalid_backend_response_is_bad_gateway() {
    let (backend, _requests) = http_backend(b"garbage\r\n\r\n").await;
    let server = gateway(&http_rule(&[backend.to_string()]));

    let response = get_async(
        server.addr,
        b"GET /api/x HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(response.status, 502);
}

#[tokio::test]
async fn test_unreachable_backend_is_gateway_timeout() {
    let server = gateway(&http_rule(&[format!("127.0.0.1:{}", closed_port())]));
    let response = get_async(
        server.addr,
        b"GET /api/x HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(response.status, 504);
}

#[tokio::test]
async fn test_failed_backend_is_skipped() {
    let (backend, _requests) =
        http_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nup").await;
    let dead = format!("127.0.0.1:{}", closed_port());
    let server = gateway(&http_rule(&[dead, backend.to_string()]));

    let request = b"GET /api/x HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";
    // the first request may or may not notice the dead backend in time
    let first = get_async(server.addr, request).await;
    assert!(first.status == 200 || first.status == 504);

    for _ in 0..3 {
        let response = get_async(server.addr, request).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.text(), "up");
    }
}

#[tokio::test]
async fn test_other_paths_stay_local() {
    let (backend, _requests) = http_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
    let server = gateway(&http_rule(&[backend.to_string()]));

    // /apis is not under /api
    let response = get_async(
        server.addr,
        b"GET /apis HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(response.status, 404);
}

/// What a FastCGI application saw of one request.
#[derive(Debug, Default)]
struct FcgiRequest {
    params: Vec<u8>,
    stdin: Vec<u8>,
    stdin_done: bool,
}

impl FcgiRequest {
    fn param(&self, name: &str) -> Option<String> {
        fastcgi::decode_pairs(&self.params)
            .unwrap()
            .into_iter()
            .find(|(n, _)| n == name.as_bytes())
            .map(|(_, v)| String::from_utf8(v).unwrap())
    }
}

impl RecordSink for FcgiRequest {
    fn stdout(&mut self, _data: &[u8]) -> bool {
        false
    }

    fn end_request(&mut self, _end: EndRequest) -> bool {
        false
    }

    fn unexpected(&mut self, kind: RecordType, _request_id: u16, content: &[u8]) -> bool {
        match kind {
            RecordType::Params => self.params.extend_from_slice(content),
            RecordType::Stdin if content.is_empty() => self.stdin_done = true,
            RecordType::Stdin => self.stdin.extend_from_slice(content),
            _ => {}
        }
        true
    }
}

/// Reads records until the `Stdin` stream is closed.
async fn read_fcgi_request(stream: &mut TcpStream) -> Option<FcgiRequest> {
    let mut input = Buffer::new();
    let mut request = FcgiRequest::default();
    let mut buf = [0u8; 4096];
    while !request.stdin_done {
        let n = stream.read(&mut buf).await.unwrap();
        if n == 0 {
            return None;
        }
        input.append(&buf[..n]);
        fastcgi::parse_records(&mut input, &mut request).unwrap();
    }
    Some(request)
}

/// A FastCGI application answering every request with `stdout`.
async fn fcgi_backend(
    stdout: impl Into<Vec<u8>>,
    protocol_status: u8,
) -> (SocketAddr, mpsc::UnboundedReceiver<FcgiRequest>) {
    let stdout: Arc<[u8]> = Arc::from(Into::<Vec<u8>>::into(stdout));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            let stdout = stdout.clone();
            tokio::spawn(async move {
                let Some(request) = read_fcgi_request(&mut stream).await else {
                    return;
                };
                let _ = tx.send(request);

                let mut out = Buffer::new();
                fastcgi::stream(&mut out, RecordType::Stdout, REQUEST_ID, &stdout);
                fastcgi::end_stream(&mut out, RecordType::Stdout, REQUEST_ID);
                out.append(&[1, RecordType::EndRequest as u8, 0, 1, 0, 8, 0, 0]);
                out.append(&[0, 0, 0, 0, protocol_status, 0, 0, 0]);
                let _ = stream.write_all(out.as_slice()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    (addr, rx)
}

fn fcgi_rule(backend: SocketAddr) -> String {
    format!(
        r#"      - handler: fastcgi
        criterion: file_extension
        values: [php]
        backends: ["{}"]
"#,
        backend
    )
}

#[tokio::test]
async fn test_fastcgi_get() {
    let (backend, mut requests) = fcgi_backend(
        b"Status: 201 Created\r\nContent-Type: text/plain\r\nX-Powered-By: mock\r\n\r\n\
          hello from php",
        REQUEST_COMPLETE,
    )
    .await;
    let server = gateway(&fcgi_rule(backend));

    let response = get_async(
        server.addr,
        b"GET /app/index.php?x=1 HTTP/1.1\r\nHost: localhost\r\nUser-Agent: tester\r\n\
          Connection: close\r\n\r\n",
    )
    .await;
    assert_eq!(response.status, 201);
    assert_eq!(response.text(), "hello from php");
    assert_eq!(response.header("Content-Length"), Some("14"));
    assert_eq!(response.header("X-Powered-By"), Some("mock"));
    assert_eq!(response.header("Status"), None);

    let request = requests.recv().await.unwrap();
    assert_eq!(request.param("REQUEST_METHOD").as_deref(), Some("GET"));
    assert_eq!(request.param("QUERY_STRING").as_deref(), Some("x=1"));
    assert_eq!(request.param("SCRIPT_NAME").as_deref(), Some("/app/index.php"));
    assert_eq!(request.param("REQUEST_URI").as_deref(), Some("/app/index.php?x=1"));
    assert_eq!(request.param("SERVER_NAME").as_deref(), Some("localhost"));
    assert_eq!(request.param("HTTP_USER_AGENT").as_deref(), Some("tester"));
    assert!(request.param("SCRIPT_FILENAME").unwrap().ends_with("/app/index.php"));
    assert_eq!(request.param("CONTENT_LENGTH"), None);
    assert!(request.stdin.is_empty());
}

#[tokio::test]
async fn test_fastcgi_post_body_is_stdin() {
    let (backend, mut requests) =
        fcgi_backend(b"Content-Type: text/plain\r\n\r\nstored", REQUEST_COMPLETE).await;
    let server = gateway(&fcgi_rule(backend));

    let response = get_async(
        server.addr,
        b"POST /form.php HTTP/1.1\r\nHost: localhost\r\n\
          Content-Type: application/x-www-form-urlencoded\r\nContent-Length: 7\r\n\
          Connection: close\r\n\r\na=1&b=2",
    )
    .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "stored");

    let request = requests.recv().await.unwrap();
    assert_eq!(request.param("REQUEST_METHOD").as_deref(), Some("POST"));
    assert_eq!(request.param("CONTENT_LENGTH").as_deref(), Some("7"));
    assert_eq!(
        request.param("CONTENT_TYPE").as_deref(),
        Some("application/x-www-form-urlencoded")
    );
    assert_eq!(request.stdin, b"a=1&b=2");
}

#[tokio::test]
async fn test_fastcgi_overloaded_is_unavailable() {
    let (backend, _requests) = fcgi_backend(b"", OVERLOADED).await;
    let server = gateway(&fcgi_rule(backend));

    let response = get_async(
        server.addr,
        b"GET /busy.php HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(response.status, 503);
}

#[tokio::test]
async fn test_fastcgi_invalid_record_is_bad_gateway() {
    let backend = raw_backend(|mut stream| async move {
        if read_fcgi_request(&mut stream).await.is_some() {
            // version 9 is not FastCGI
            let _ = stream.write_all(&[9, 6, 0, 1, 0, 2, 0, 0, b'h', b'i']).await;
            tokio::time::sleep(Duration::from_secs(20)).await;
        }
    })
    .await;
    let server = gateway(&fcgi_rule(backend));

    let started = std::time::Instant::now();
    let response = get_async(
        server.addr,
        b"GET /index.php HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(response.status, 502);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_large_post_and_response_are_spooled() {
    let upload = pattern(200 * 1024);
    let download = pattern(300 * 1024);
    let mut reply =
        format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", download.len()).into_bytes();
    reply.extend_from_slice(&download);
    let (backend, mut requests) = http_backend(reply).await;
    let server = gateway(&http_rule(&[backend.to_string()]));

    let mut request = format!(
        "POST /api/upload HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\
         Connection: close\r\n\r\n",
        upload.len()
    )
    .into_bytes();
    request.extend_from_slice(&upload);
    let response = get_async(server.addr, &request).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body.len(), download.len());
    assert!(response.body == download);

    let forwarded = requests.recv().await.unwrap();
    let body_start = find(&forwarded, b"\r\n\r\n").unwrap() + 4;
    assert!(forwarded[body_start..] == upload[..]);
}

#[tokio::test]
async fn test_large_chunked_response_is_relayed() {
    let data = pattern(100 * 1024);
    let mut encoded = Buffer::new();
    chunked::encode(&data, 4000, &mut encoded);
    let mut reply = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
    reply.extend_from_slice(encoded.as_slice());
    let (backend, _requests) = http_backend(reply).await;
    let server = gateway(&http_rule(&[backend.to_string()]));

    let response = get_async(server.addr, GET_API).await;
    assert_eq!(response.status, 200);
    let length = data.len().to_string();
    assert_eq!(response.header("Content-Length"), Some(length.as_str()));
    assert!(response.body == data);
}

#[tokio::test]
async fn test_large_fastcgi_exchange() {
    let upload = pattern(120 * 1024);
    let output = pattern(150 * 1024);
    let mut stdout = b"Content-Type: text/plain\r\n\r\n".to_vec();
    stdout.extend_from_slice(&output);
    let (backend, mut requests) = fcgi_backend(stdout, REQUEST_COMPLETE).await;
    let server = gateway(&fcgi_rule(backend));

    let mut request = format!(
        "POST /big.php HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\
         Connection: close\r\n\r\n",
        upload.len()
    )
    .into_bytes();
    request.extend_from_slice(&upload);
    let response = get_async(server.addr, &request).await;
    assert_eq!(response.status, 200);
    assert!(response.body == output);

    let received = requests.recv().await.unwrap();
    let length = upload.len().to_string();
    assert_eq!(received.param("CONTENT_LENGTH").as_deref(), Some(length.as_str()));
    assert!(received.stdin == upload);
}

#[tokio::test]
async fn test_silent_backend_times_out() {
    let backend = raw_backend(|mut stream| async move {
        read_request(&mut stream).await;
        tokio::time::sleep(Duration::from_secs(20)).await;
    })
    .await;
    let server = gateway_with("  max_idle_time: 1\n", &http_rule(&[backend.to_string()]));

    let response = get_async(server.addr, GET_API).await;
    assert_eq!(response.status, 504);
}

#[tokio::test]
async fn test_stalled_unterminated_body_is_completed() {
    let backend = raw_backend(|mut stream| async move {
        read_request(&mut stream).await;
        let _ = stream.write_all(b"HTTP/1.0 200 OK\r\n\r\npartial").await;
        tokio::time::sleep(Duration::from_secs(20)).await;
    })
    .await;
    let server = gateway_with(
        "  max_idle_time_unknown_size_body: 1\n",
        &http_rule(&[backend.to_string()]),
    );

    let response = get_async(server.addr, GET_API).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "partial");
    assert_eq!(response.header("Content-Length"), Some("7"));
}

#[tokio::test]
async fn test_reset_during_unterminated_body_is_bad_gateway() {
    let backend = raw_backend(|mut stream| async move {
        read_request(&mut stream).await;
        let _ = stream.write_all(b"HTTP/1.0 200 OK\r\n\r\npartial").await;
        // let the gateway take in the head before the reset
        tokio::time::sleep(Duration::from_millis(300)).await;
        reset_on_close(&stream);
        drop(stream);
    })
    .await;
    let server = gateway(&http_rule(&[backend.to_string()]));

    let response = get_async(server.addr, GET_API).await;
    assert_eq!(response.status, 502);
}
