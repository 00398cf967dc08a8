//! Per-host access log.
//!
//! The record format is a string with `$variable` references. It is parsed
//! once into tokens and replayed for every request.

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::net::SocketAddr;
use std::path::Path;

use thiserror::Error;

use crate::http::request::Version;

pub const COMMON_LOG_FORMAT: &str = "$remote_address - - [$timestamp] \
     \"$method $path HTTP/$http_version\" $status_code $response_body_size";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variable {
    Host,
    HttpVersion,
    Method,
    Path,
    RemoteAddress,
    RemotePort,
    ResponseBodySize,
    StatusCode,
    Timestamp,
    UserAgent,
}

const VARIABLES: [(&str, Variable); 10] = [
    ("host", Variable::Host),
    ("http_version", Variable::HttpVersion),
    ("method", Variable::Method),
    ("path", Variable::Path),
    ("remote_address", Variable::RemoteAddress),
    ("remote_port", Variable::RemotePort),
    ("response_body_size", Variable::ResponseBodySize),
    ("status_code", Variable::StatusCode),
    ("timestamp", Variable::Timestamp),
    ("user_agent", Variable::UserAgent),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Literal(String),
    Field(Variable),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown log variable ${0}")]
pub struct UnknownVariable(pub String);

/// Parses a format string. Unknown `$names` are an error.
pub fn parse_format(format: &str) -> Result<Vec<Token>, UnknownVariable> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut rest = format;

    while let Some(pos) = rest.find('$') {
        literal.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let name_len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        let name = &after[..name_len];

        // Longest known name that prefixes the identifier.
        let found = VARIABLES
            .iter()
            .filter(|(n, _)| name.starts_with(n))
            .max_by_key(|(n, _)| n.len());
        let Some(&(matched, variable)) = found else {
            return Err(UnknownVariable(name.to_string()));
        };

        if !literal.is_empty() {
            tokens.push(Token::Literal(std::mem::take(&mut literal)));
        }
        tokens.push(Token::Field(variable));
        rest = &after[matched.len()..];
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    Ok(tokens)
}

/// What gets logged about one request.
#[derive(Debug, Clone)]
pub struct AccessRecord<'a> {
    pub peer: SocketAddr,
    /// IMF-fixdate of the request, as sent in `Date`.
    pub date: &'a str,
    pub method: &'a str,
    pub host: &'a str,
    pub path: &'a [u8],
    pub version: Version,
    pub status: u16,
    pub body_size: u64,
    pub user_agent: Option<&'a [u8]>,
}

#[derive(Debug)]
enum Sink {
    File(BufWriter<File>),
    Tracing,
}

#[derive(Debug)]
pub struct AccessLog {
    tokens: Vec<Token>,
    sink: Sink,
    line: String,
}

impl AccessLog {
    /// Logs to a file, appending.
    pub fn to_file(path: &Path, tokens: Vec<Token>) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            tokens,
            sink: Sink::File(BufWriter::new(file)),
            line: String::new(),
        })
    }

    /// Logs as `tracing` events with target `access`.
    pub fn to_tracing(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            sink: Sink::Tracing,
            line: String::new(),
        }
    }

    pub fn render(&mut self, record: &AccessRecord<'_>) -> &str {
        self.line.clear();
        for token in &self.tokens {
            let line = &mut self.line;
            let _ = match token {
                Token::Literal(text) => {
                    line.push_str(text);
                    Ok(())
                }
                Token::Field(Variable::Host) => write!(line, "{}", record.host),
                Token::Field(Variable::HttpVersion) => {
                    write!(line, "{}.{}", record.version.major, record.version.minor)
                }
                Token::Field(Variable::Method) => write!(line, "{}", record.method),
                Token::Field(Variable::Path) => {
                    write!(line, "{}", String::from_utf8_lossy(record.path))
                }
                Token::Field(Variable::RemoteAddress) => write!(line, "{}", record.peer.ip()),
                Token::Field(Variable::RemotePort) => write!(line, "{}", record.peer.port()),
                Token::Field(Variable::ResponseBodySize) => write!(line, "{}", record.body_size),
                Token::Field(Variable::StatusCode) => write!(line, "{}", record.status),
                Token::Field(Variable::Timestamp) => write!(line, "{}", clf_timestamp(record.date)),
                Token::Field(Variable::UserAgent) => write!(
                    line,
                    "{}",
                    String::from_utf8_lossy(record.user_agent.unwrap_or(b"-"))
                ),
            };
        }
        &self.line
    }

    pub fn log(&mut self, record: &AccessRecord<'_>) {
        self.render(record);
        match &mut self.sink {
            Sink::File(writer) => {
                if let Err(e) = writeln!(writer, "{}", self.line) {
                    tracing::error!(error = %e, "Failed to write access log");
                }
            }
            Sink::Tracing => tracing::info!(target: "access", "{}", self.line),
        }
    }

    pub fn sync(&mut self) {
        if let Sink::File(writer) = &mut self.sink {
            if let Err(e) = writer.flush() {
                tracing::error!(error = %e, "Failed to flush access log");
            }
        }
    }
}

/// `Sun, 06 Nov 1994 08:49:37 GMT` becomes `06/Nov/1994:08:49:37 +0000`.
fn clf_timestamp(date: &str) -> String {
    let parts: Vec<&str> = date.split_whitespace().collect();
    match parts.as_slice() {
        [_, day, month, year, time, _] => format!("{}/{}/{}:{} +0000", day, month, year, time),
        _ => date.to_string(),
    }
}
