//! Tests for FastCGI record framing and parsing

use sentinel_gateway::http::buffer::Buffer;
use sentinel_gateway::http::response::StatusCode;
use sentinel_gateway::proxy::fastcgi::{
    self, EndRequest, HEADER_LEN, MAX_CONTENT_LEN, Params, REQUEST_COMPLETE, REQUEST_ID, RecordSink,
    RecordType,
};
use sentinel_gateway::proxy::fcgi::parse_status;

/// Collects every record by type, with empty records counted as terminators.
#[derive(Default)]
struct Recorder {
    params: Vec<u8>,
    stdin: Vec<u8>,
    stdout: Vec<u8>,
    terminators: Vec<RecordType>,
    records: usize,
    end: Option<EndRequest>,
}

impl RecordSink for Recorder {
    fn stdout(&mut self, data: &[u8]) -> bool {
        self.records += 1;
        self.stdout.extend_from_slice(data);
        true
    }

    fn end_request(&mut self, end: EndRequest) -> bool {
        self.end = Some(end);
        true
    }

    fn unexpected(&mut self, kind: RecordType, request_id: u16, content: &[u8]) -> bool {
        assert_eq!(request_id, REQUEST_ID);
        self.records += 1;
        if content.is_empty() {
            self.terminators.push(kind);
            return true;
        }
        match kind {
            RecordType::Params => self.params.extend_from_slice(content),
            RecordType::Stdin => self.stdin.extend_from_slice(content),
            _ => return false,
        }
        true
    }
}

#[test]
fn test_params_round_trip() {
    let long_value = "v".repeat(300);
    let pairs: Vec<(&str, String)> = vec![
        ("SERVER_NAME", "example.com".to_string()),
        ("REQUEST_METHOD", "GET".to_string()),
        ("QUERY_STRING", String::new()),
        ("HTTP_COOKIE", long_value.clone()),
    ];

    let mut params = Params::new();
    for (name, value) in &pairs {
        params.add(name, value);
    }
    let mut out = Buffer::new();
    params.write(&mut out, REQUEST_ID);

    let mut recorder = Recorder::default();
    fastcgi::parse_records(&mut out, &mut recorder).unwrap();
    assert!(out.is_empty());
    assert_eq!(recorder.terminators, vec![RecordType::Params]);

    let decoded = fastcgi::decode_pairs(&recorder.params).unwrap();
    let expected: Vec<(Vec<u8>, Vec<u8>)> = pairs
        .iter()
        .map(|(n, v)| (n.as_bytes().to_vec(), v.as_bytes().to_vec()))
        .collect();
    assert_eq!(decoded, expected);
}

#[test]
fn test_long_value_uses_four_byte_length() {
    let mut encoded = Vec::new();
    fastcgi::encode_pair(&mut encoded, b"A", &[b'x'; 128]);
    assert_eq!(encoded[0], 1);
    assert_eq!(&encoded[1..5], &[0x80, 0, 0, 128]);
    assert_eq!(encoded.len(), 1 + 4 + 1 + 128);

    let mut short = Vec::new();
    fastcgi::encode_pair(&mut short, b"A", &[b'x'; 127]);
    assert_eq!(short[1], 127);
    assert_eq!(short.len(), 1 + 1 + 1 + 127);
}

#[test]
fn test_header_names_become_cgi_params() {
    let mut params = Params::new();
    params.add_header(b"User-Agent", b"curl");
    let decoded = fastcgi::decode_pairs(params.as_bytes()).unwrap();
    assert_eq!(decoded, vec![(b"HTTP_USER_AGENT".to_vec(), b"curl".to_vec())]);
}

#[test]
fn test_stdin_stream_longer_than_one_record() {
    let body: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
    let mut out = Buffer::new();
    fastcgi::stream(&mut out, RecordType::Stdin, REQUEST_ID, &body);
    fastcgi::end_stream(&mut out, RecordType::Stdin, REQUEST_ID);

    // three data records plus the terminator, each padded to eight bytes
    let padded = |n: usize| n.div_ceil(8) * 8;
    let expected_len = 2 * (HEADER_LEN + padded(MAX_CONTENT_LEN))
        + HEADER_LEN
        + padded(body.len() - 2 * MAX_CONTENT_LEN)
        + HEADER_LEN;
    assert_eq!(out.len(), expected_len);

    // feed it back in small reads
    let bytes = out.as_slice().to_vec();
    let mut input = Buffer::new();
    let mut recorder = Recorder::default();
    for piece in bytes.chunks(4000) {
        input.append(piece);
        fastcgi::parse_records(&mut input, &mut recorder).unwrap();
    }

    assert!(input.is_empty());
    assert_eq!(recorder.records, 4);
    assert_eq!(recorder.terminators, vec![RecordType::Stdin]);
    assert_eq!(recorder.stdin, body);
}

#[test]
fn test_begin_request_record() {
    let mut out = Buffer::new();
    fastcgi::begin_request(&mut out, REQUEST_ID, fastcgi::ROLE_RESPONDER, false);
    assert_eq!(
        out.as_slice(),
        &[1, RecordType::BeginRequest as u8, 0, 1, 0, 8, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0]
    );
}

#[test]
fn test_stdout_and_end_request() {
    let mut out = Buffer::new();
    fastcgi::stream(
        &mut out,
        RecordType::Stdout,
        REQUEST_ID,
        b"Content-Type: text/plain\r\n\r\nhi",
    );
    fastcgi::end_stream(&mut out, RecordType::Stdout, REQUEST_ID);
    out.append(&[1, RecordType::EndRequest as u8, 0, 1, 0, 8, 0, 0]);
    out.append(&[0, 0, 0, 7, REQUEST_COMPLETE, 0, 0, 0]);

    let mut recorder = Recorder::default();
    fastcgi::parse_records(&mut out, &mut recorder).unwrap();
    assert_eq!(recorder.stdout, b"Content-Type: text/plain\r\n\r\nhi");
    assert_eq!(
        recorder.end,
        Some(EndRequest {
            app_status: 7,
            protocol_status: REQUEST_COMPLETE
        })
    );
}

#[test]
fn test_cgi_status_header() {
    assert_eq!(parse_status(Some(b"302 Found")), Ok((302, b"Found".to_vec())));
    assert_eq!(parse_status(None), Ok((200, b"OK".to_vec())));
    assert_eq!(parse_status(Some(b"99 Low")), Err(StatusCode::BadGateway));
    assert_eq!(parse_status(Some(b"600 High")), Err(StatusCode::BadGateway));
}
