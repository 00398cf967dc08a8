//! Virtual hosts and routing rules.

use std::path::PathBuf;

use thiserror::Error;

use crate::http::access_log::AccessLog;
use crate::http::request::{Method, MethodSet, Request};
use crate::proxy::backend::BackendList;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Local,
    Http,
    FastCgi,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Criterion {
    /// Normalized path prefixes, matched on `/` boundaries.
    Path(Vec<Vec<u8>>),
    /// Extensions of the last path segment, matched case-sensitively.
    Extension(Vec<Vec<u8>>),
    Method(MethodSet),
}

impl Criterion {
    pub fn matches(&self, method: Option<Method>, path: &[u8], extension: Option<&[u8]>) -> bool {
        match self {
            Criterion::Path(prefixes) => prefixes.iter().any(|p| path_has_prefix(path, p)),
            Criterion::Extension(exts) => {
                extension.is_some_and(|ext| exts.iter().any(|e| e.as_slice() == ext))
            }
            Criterion::Method(set) => method.is_some_and(|m| set.contains(m)),
        }
    }
}

/// `/a/b` has prefixes `/`, `/a` and `/a/b`, but not `/a/bc`.
pub fn path_has_prefix(path: &[u8], prefix: &[u8]) -> bool {
    let prefix = prefix.strip_suffix(b"/").unwrap_or(prefix);
    if prefix.is_empty() {
        return true;
    }
    path.starts_with(prefix) && matches!(path.get(prefix.len()), None | Some(b'/'))
}

#[derive(Debug)]
pub struct Rule {
    pub handler: HandlerKind,
    pub criterion: Criterion,
    pub backends: BackendList,
}

#[derive(Debug)]
pub struct VirtualHost {
    pub name: String,
    pub aliases: Vec<String>,
    pub root: PathBuf,
    pub dir_listing: bool,
    pub log_requests: bool,
    pub access_log: Option<AccessLog>,
    pub rules: Vec<Rule>,
}

impl VirtualHost {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            root: root.into(),
            dir_listing: false,
            log_requests: false,
            access_log: None,
            rules: Vec::new(),
        }
    }

    /// Index of the first rule matching the request, in configuration order.
    pub fn find_rule(&self, request: &Request) -> Option<usize> {
        let path = request.url.path();
        let extension = request.url.extension();
        self.rules
            .iter()
            .position(|rule| rule.criterion.matches(request.method, path, extension))
    }

    /// Handler for the rule at `index`; no rule means the local handler.
    pub fn handler(&self, index: Option<usize>) -> HandlerKind {
        index
            .and_then(|i| self.rules.get(i))
            .map_or(HandlerKind::Local, |rule| rule.handler)
    }
}

/// All virtual hosts, indexed by lower-cased name and alias.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VirtualHostError {
    #[error("duplicate host name {0}")]
    DuplicateName(String),
    #[error("default host {0} out of range")]
    DefaultOutOfRange(usize),
}

#[derive(Debug, Default)]
pub struct VirtualHosts {
    hosts: Vec<VirtualHost>,
    index: Vec<(String, usize)>,
    default: Option<usize>,
}

impl VirtualHosts {
    /// Builds the index; fails on a name or alias used twice.
    pub fn new(hosts: Vec<VirtualHost>, default: Option<usize>) -> Result<Self, VirtualHostError> {
        let mut index = Vec::new();
        for (i, host) in hosts.iter().enumerate() {
            for name in std::iter::once(&host.name).chain(host.aliases.iter()) {
                index.push((name.to_ascii_lowercase(), i));
            }
        }
        index.sort();
        if let Some(pair) = index.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(VirtualHostError::DuplicateName(pair[0].0.clone()));
        }
        if let Some(d) = default.filter(|&d| d >= hosts.len()) {
            return Err(VirtualHostError::DefaultOutOfRange(d));
        }
        Ok(Self { hosts, index, default })
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Case-insensitive lookup by name or alias.
    pub fn lookup(&self, name: &str) -> Option<usize> {
        let name = name.to_ascii_lowercase();
        self.index
            .binary_search_by(|(n, _)| n.as_str().cmp(name.as_str()))
            .ok()
            .map(|i| self.index[i].1)
    }

    pub fn default_host(&self) -> Option<usize> {
        self.default
    }

    pub fn get(&self, index: usize) -> Option<&VirtualHost> {
        self.hosts.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut VirtualHost> {
        self.hosts.get_mut(index)
    }

    pub fn backends_mut(&mut self, host: usize, rule: usize) -> Option<&mut BackendList> {
        self.hosts
            .get_mut(host)
            .and_then(|h| h.rules.get_mut(rule))
            .map(|r| &mut r.backends)
    }

    /// Flushes every file access log.
    pub fn sync_logs(&mut self) {
        for host in &mut self.hosts {
            if let Some(log) = host.access_log.as_mut() {
                log.sync();
            }
        }
    }
}
