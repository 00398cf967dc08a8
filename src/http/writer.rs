//! Serialization of response heads and multipart framing.

use crate::http::buffer::Buffer;
use crate::http::headers::{HEADER_MAX_LINE_LEN, Header, Headers};
use crate::http::range::{ByteRange, RangeList};
use crate::http::response::{SERVER_NAME, StatusCode};

const HTTP_VERSION: &str = "HTTP/1.1";

/// Writes `HTTP/1.1 code reason\r\n`; an empty reason is left out.
pub fn status_line(out: &mut Buffer, code: u16, reason: &[u8]) {
    out.format(format_args!("{} {}", HTTP_VERSION, code));
    if !reason.is_empty() {
        out.push(b' ');
        out.append(reason);
    }
    out.append(b"\r\n");
}

/// Status line plus header block.
pub fn write_head(out: &mut Buffer, status: StatusCode, headers: &Headers) {
    status_line(out, status.as_u16(), status.reason_phrase().as_bytes());
    headers.serialize(out, HEADER_MAX_LINE_LEN);
}

/// Headers carried by every locally generated response.
pub fn common_headers(headers: &mut Headers, date: &str, keep_alive: bool) {
    headers.set(Header::Date, date);
    headers.set(Header::Connection, connection_value(keep_alive));
    headers.set(Header::Server, SERVER_NAME);
}

pub fn connection_value(keep_alive: bool) -> &'static str {
    if keep_alive { "Keep-Alive" } else { "close" }
}

/// `Content-Range` value for one range of a `size`-byte file.
pub fn content_range(range: &ByteRange, size: u64) -> String {
    format!("bytes {}-{}/{}", range.from, range.to, size)
}

/// Content type of a multipart response.
pub fn multipart_content_type(boundary: &str) -> String {
    format!("multipart/byteranges; boundary=\"{}\"", boundary)
}

/// Header preceding one part of a `multipart/byteranges` body.
pub fn part_header(
    out: &mut Buffer,
    boundary: &str,
    content_type: &str,
    range: &ByteRange,
    size: u64,
) {
    out.format(format_args!(
        "\r\n--{}\r\nContent-Type: {}\r\nContent-Range: {}\r\n\r\n",
        boundary,
        content_type,
        content_range(range, size)
    ));
}

pub fn multipart_footer(out: &mut Buffer, boundary: &str) {
    out.format(format_args!("\r\n--{}--\r\n", boundary));
}

/// Exact length of a multipart body.
pub fn multipart_length(ranges: &RangeList, boundary: &str, content_type: &str, size: u64) -> u64 {
    let mut scratch = Buffer::new();
    let mut total = 0u64;
    for range in ranges.iter() {
        scratch.clear();
        part_header(&mut scratch, boundary, content_type, range, size);
        total += scratch.len() as u64 + range.size();
    }
    scratch.clear();
    multipart_footer(&mut scratch, boundary);
    total + scratch.len() as u64
}
