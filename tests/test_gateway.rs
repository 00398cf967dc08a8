//! End-to-end tests for the local file handler and request validation

mod common;

use std::fs;
use std::path::Path;

use common::{Running, docroot, exchange, get, parse_responses};

const HELLO: &str = "Hello, sentinel!\n";

fn serve(name: &str) -> (Running, std::path::PathBuf) {
    let root = docroot(name);
    fs::write(root.join("hello.txt"), HELLO).unwrap();
    fs::write(root.join("digits.txt"), "0123456789").unwrap();
    fs::create_dir(root.join("docs")).unwrap();
    fs::write(root.join("docs").join("index.html"), "<h1>docs</h1>").unwrap();
    fs::create_dir(root.join("files")).unwrap();
    fs::write(root.join("files").join("a.txt"), "a").unwrap();
    fs::create_dir(root.join("files").join("sub")).unwrap();

    let yaml = format!(
        r#"
listen_addr: "127.0.0.1:0"
hosts:
  - name: localhost
    aliases: [alias.test]
    root: "{root}"
    default: true
  - name: listing.test
    root: "{files}"
    dir_listing: true
"#,
        root = root.display(),
        files = root.join("files").display(),
    );
    (common::start(&yaml), root)
}

fn cleanup(root: &Path) {
    let _ = fs::remove_dir_all(root);
}

#[test]
fn test_serves_static_file() {
    let (server, root) = serve("static");
    let response = get(
        server.addr,
        "GET /hello.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );

    assert_eq!(response.status, 200);
    assert_eq!(response.text(), HELLO);
    assert_eq!(response.header("Content-Length"), Some("17"));
    assert_eq!(response.header("Content-Type"), Some("text/plain"));
    assert_eq!(response.header("Accept-Ranges"), Some("bytes"));
    assert_eq!(response.header("Connection"), Some("close"));
    assert_eq!(response.header("Server"), Some("Sentinel"));
    assert!(response.header("Last-Modified").is_some());
    assert!(response.header("Date").is_some());
    cleanup(&root);
}

#[test]
fn test_large_static_file() {
    let (server, root) = serve("large");
    let data: Vec<u8> = (0..256 * 1024).map(|i| b'a' + (i % 26) as u8).collect();
    fs::write(root.join("large.txt"), &data).unwrap();

    let response = get(
        server.addr,
        "GET /large.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(response.status, 200);
    assert_eq!(response.header("Content-Length"), Some("262144"));
    assert!(response.body == data);
    cleanup(&root);
}

#[test]
fn test_missing_file_is_not_found() {
    let (server, root) = serve("missing");
    let response = get(
        server.addr,
        "GET /nope.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(response.status, 404);
    assert!(response.text().contains("Not Found"));
    assert_eq!(response.header("Content-Type"), Some("text/html; charset=UTF-8"));
    cleanup(&root);
}

#[test]
fn test_directory_without_slash_redirects() {
    let (server, root) = serve("redirect");
    let response = get(
        server.addr,
        "GET /docs?x=1 HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(response.status, 301);
    let expected = format!("http://localhost:{}/docs/", server.addr.port());
    assert_eq!(response.header("Location"), Some(expected.as_str()));
    cleanup(&root);
}

#[test]
fn test_directory_serves_index_file() {
    let (server, root) = serve("index");
    let response = get(
        server.addr,
        "GET /docs/ HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "<h1>docs</h1>");
    assert_eq!(response.header("Content-Type"), Some("text/html"));
    cleanup(&root);
}

#[test]
fn test_directory_listing() {
    let (server, root) = serve("listing");
    let response = get(
        server.addr,
        "GET / HTTP/1.1\r\nHost: listing.test\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(response.status, 200);
    let page = response.text();
    assert!(page.contains("Index of /"));
    assert!(page.contains("a.txt"));
    assert!(page.contains("sub/"));

    // listing is off for the other host
    let response = get(
        server.addr,
        "GET /files/ HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(response.status, 404);
    cleanup(&root);
}

#[test]
fn test_single_range() {
    let (server, root) = serve("range");
    let response = get(
        server.addr,
        "GET /digits.txt HTTP/1.1\r\nHost: localhost\r\nRange: bytes=2-5\r\n\
         Connection: close\r\n\r\n",
    );
    assert_eq!(response.status, 206);
    assert_eq!(response.text(), "2345");
    assert_eq!(response.header("Content-Range"), Some("bytes 2-5/10"));

    let response = get(
        server.addr,
        "GET /digits.txt HTTP/1.1\r\nHost: localhost\r\nRange: bytes=-3\r\n\
         Connection: close\r\n\r\n",
    );
    assert_eq!(response.status, 206);
    assert_eq!(response.text(), "789");
    cleanup(&root);
}

#[test]
fn test_multiple_ranges() {
    let (server, root) = serve("multirange");
    let response = get(
        server.addr,
        "GET /digits.txt HTTP/1.1\r\nHost: localhost\r\nRange: bytes=0-1,8-9\r\n\
         Connection: close\r\n\r\n",
    );
    assert_eq!(response.status, 206);
    let content_type = response.header("Content-Type").unwrap();
    assert!(content_type.starts_with("multipart/byteranges; boundary="));

    let body = response.text();
    assert!(body.contains("Content-Range: bytes 0-1/10\r\n\r\n01"));
    assert!(body.contains("Content-Range: bytes 8-9/10\r\n\r\n89"));
    assert!(body.ends_with("--\r\n"));
    cleanup(&root);
}

#[test]
fn test_unsatisfiable_range() {
    let (server, root) = serve("badrange");
    let response = get(
        server.addr,
        "GET /digits.txt HTTP/1.1\r\nHost: localhost\r\nRange: bytes=20-30\r\n\
         Connection: close\r\n\r\n",
    );
    assert_eq!(response.status, 416);
    cleanup(&root);
}

#[test]
fn test_head_sends_no_body() {
    let (server, root) = serve("head");
    let bytes = exchange(
        server.addr,
        b"HEAD /hello.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    let text = String::from_utf8(bytes).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("Content-Length: 17\r\n"));
    assert!(text.ends_with("\r\n\r\n"));
    cleanup(&root);
}

#[test]
fn test_not_modified() {
    let (server, root) = serve("conditional");
    let response = get(
        server.addr,
        "GET /hello.txt HTTP/1.1\r\nHost: localhost\r\n\
         If-Modified-Since: Fri, 31 Dec 2100 23:59:59 GMT\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(response.status, 304);
    assert!(response.body.is_empty());
    assert!(response.header("Last-Modified").is_some());

    let response = get(
        server.addr,
        "GET /hello.txt HTTP/1.1\r\nHost: localhost\r\n\
         If-Modified-Since: Sun, 06 Nov 1994 08:49:37 GMT\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(response.status, 200);
    cleanup(&root);
}

#[test]
fn test_pipelined_keep_alive() {
    let (server, root) = serve("pipeline");
    let bytes = exchange(
        server.addr,
        b"GET /hello.txt HTTP/1.1\r\nHost: localhost\r\n\r\n\
          HEAD /digits.txt HTTP/1.1\r\nHost: alias.test\r\n\r\n\
          GET /digits.txt HTTP/1.1\r\nHost: LOCALHOST\r\nConnection: close\r\n\r\n",
    );
    let responses = parse_responses(&bytes, &[false, true, false]);
    assert_eq!(responses.len(), 3);
    assert_eq!(responses[0].text(), HELLO);
    assert_eq!(responses[0].header("Connection"), Some("Keep-Alive"));
    assert!(responses[1].body.is_empty());
    assert_eq!(responses[1].header("Content-Length"), Some("10"));
    assert_eq!(responses[2].text(), "0123456789");
    assert_eq!(responses[2].header("Connection"), Some("close"));
    cleanup(&root);
}

#[test]
fn test_http10_closes_by_default() {
    let (server, root) = serve("http10");
    // no Host header: the default host answers
    let response = get(server.addr, "GET /hello.txt HTTP/1.0\r\n\r\n");
    assert_eq!(response.status, 200);
    assert_eq!(response.header("Connection"), Some("close"));
    cleanup(&root);
}

#[test]
fn test_invalid_requests() {
    let (server, root) = serve("invalid");

    let response = get(server.addr, "GARBAGE\r\n\r\n");
    assert_eq!(response.status, 400);

    let response = get(server.addr, "GET /hello.txt HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert_eq!(response.status, 400, "HTTP/1.1 requires Host");

    let response = get(
        server.addr,
        "GET /hello.txt HTTP/1.1\r\nHost: unknown.test\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(response.status, 404);

    let response = get(
        server.addr,
        "GET /../secret HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(response.status, 403);

    let response = get(
        server.addr,
        "POST /hello.txt HTTP/1.1\r\nHost: localhost\r\nContent-Length: 2\r\n\
         Connection: close\r\n\r\nhi",
    );
    assert_eq!(response.status, 501);

    let wrong_port = format!(
        "GET /hello.txt HTTP/1.1\r\nHost: localhost:{}\r\nConnection: close\r\n\r\n",
        server.addr.port().wrapping_add(1)
    );
    assert_eq!(get(server.addr, &wrong_port).status, 404);
    cleanup(&root);
}
