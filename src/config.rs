//! Gateway configuration.
//!
//! The configuration is a YAML file named by `SENTINEL_CONFIG`; without one
//! the gateway serves the current directory as `localhost`. `LISTEN`
//! overrides the listening address either way.

use std::collections::HashSet;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;
use tracing::info;

use crate::http::access_log::{self, AccessLog, COMMON_LOG_FORMAT};
use crate::http::mime::MimeTypes;
use crate::http::request::{Method, MethodSet};
use crate::http::vhost::{Criterion, HandlerKind, Rule, VirtualHost, VirtualHosts};
use crate::proxy::backend::{Backend, BackendList};
use crate::server::tmpfiles::TempFiles;
use crate::server::{Gateway, Settings};

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub general: General,
    pub hosts: Vec<HostConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            general: General::default(),
            hosts: vec![HostConfig {
                name: "localhost".to_string(),
                aliases: Vec::new(),
                root: PathBuf::from("."),
                default: true,
                dir_listing: false,
                log_requests: false,
                access_log: None,
                access_log_format: None,
                rules: Vec::new(),
            }],
        }
    }
}

/// Loop-wide settings. Times are in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct General {
    pub max_connections: usize,
    pub max_idle_time: u64,
    pub max_idle_time_unknown_size_body: u64,
    /// KiB.
    pub max_payload_in_memory: usize,
    pub payload_directory: PathBuf,
    pub max_spare_files: usize,
    pub backend_retry_interval: u64,
    pub log_level: String,
    pub log_sync_interval: u64,
    pub index_files: Vec<String>,
    pub mime_types: Option<PathBuf>,
}

impl Default for General {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            max_idle_time: 30,
            max_idle_time_unknown_size_body: 3,
            max_payload_in_memory: 4,
            payload_directory: std::env::temp_dir(),
            max_spare_files: 32,
            backend_retry_interval: 300,
            log_level: "error".to_string(),
            log_sync_interval: 30,
            index_files: vec!["index.html".to_string()],
            mime_types: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub root: PathBuf,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub dir_listing: bool,
    #[serde(default)]
    pub log_requests: bool,
    #[serde(default)]
    pub access_log: Option<PathBuf>,
    #[serde(default)]
    pub access_log_format: Option<String>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerConfig {
    Local,
    Http,
    Fastcgi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionConfig {
    Path,
    FileExtension,
    Method,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub handler: HandlerConfig,
    pub criterion: CriterionConfig,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub backends: Vec<String>,
    /// Overrides `general.backend_retry_interval`.
    #[serde(default)]
    pub retry_interval: Option<u64>,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var("SENTINEL_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        if let Ok(addr) = std::env::var("LISTEN") {
            config.listen_addr = addr;
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read configuration file {}", path.display()))?;
        Self::from_yaml(&text)
            .with_context(|| format!("invalid configuration file {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(text).context("malformed YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let general = &self.general;
        check_range("max_payload_in_memory", general.max_payload_in_memory as u64, 1, 64)?;
        check_range("backend_retry_interval", general.backend_retry_interval, 1, 3600)?;
        check_range("max_connections", general.max_connections as u64, 1, u32::MAX as u64)?;
        check_range("max_idle_time", general.max_idle_time, 1, 86400)?;
        check_range(
            "max_idle_time_unknown_size_body",
            general.max_idle_time_unknown_size_body,
            1,
            86400,
        )?;
        check_range("log_sync_interval", general.log_sync_interval, 1, 86400)?;

        if self.hosts.iter().filter(|h| h.default).count() > 1 {
            bail!("more than one default host");
        }

        let mut names = HashSet::new();
        for host in &self.hosts {
            for name in std::iter::once(&host.name).chain(host.aliases.iter()) {
                if name.is_empty() {
                    bail!("empty host name");
                }
                if !names.insert(name.to_ascii_lowercase()) {
                    bail!("duplicate host name or alias {}", name);
                }
            }
            for rule in &host.rules {
                validate_rule(&host.name, rule)?;
            }
        }
        Ok(())
    }

    /// Resolves addresses and builds the runtime structures.
    pub fn build(&self) -> anyhow::Result<Gateway> {
        self.validate()?;
        let listen = resolve(&self.listen_addr)
            .with_context(|| format!("invalid listen address {}", self.listen_addr))?;

        let general = &self.general;
        let settings = Settings {
            max_connections: general.max_connections,
            max_idle_time: Duration::from_secs(general.max_idle_time),
            max_idle_time_unknown_size_body: Duration::from_secs(
                general.max_idle_time_unknown_size_body,
            ),
            max_payload_in_memory: general.max_payload_in_memory * 1024,
            log_sync_interval: Duration::from_secs(general.log_sync_interval),
            index_files: general.index_files.clone(),
            max_bytes_per_call: None,
        };

        let mut hosts = Vec::with_capacity(self.hosts.len());
        let mut default = None;
        for (index, host) in self.hosts.iter().enumerate() {
            if host.default {
                default = Some(index);
            }
            hosts.push(build_host(host, general.backend_retry_interval)?);
        }
        let hosts = VirtualHosts::new(hosts, default)?;

        let mut mime = MimeTypes::new();
        if let Some(path) = &general.mime_types {
            let count = mime
                .load(path)
                .with_context(|| format!("cannot read MIME types from {}", path.display()))?;
            info!(count, path = %path.display(), "Loaded MIME types");
        }

        Ok(Gateway {
            listen,
            settings,
            hosts,
            mime,
            tmpfiles: TempFiles::new(&general.payload_directory, general.max_spare_files),
        })
    }
}

fn check_range(name: &str, value: u64, min: u64, max: u64) -> anyhow::Result<()> {
    if value < min || value > max {
        bail!("{} must be within {}..={}, got {}", name, min, max, value);
    }
    Ok(())
}

fn validate_rule(host: &str, rule: &RuleConfig) -> anyhow::Result<()> {
    if rule.values.is_empty() {
        bail!("host {}: rule without values", host);
    }
    match rule.criterion {
        CriterionConfig::Path => {
            if let Some(path) = rule.values.iter().find(|p| !p.starts_with('/')) {
                bail!("host {}: path {} must start with /", host, path);
            }
        }
        CriterionConfig::Method => {
            let unknown = rule
                .values
                .iter()
                .find(|m| Method::from_bytes(m.as_bytes()).is_none());
            if let Some(name) = unknown {
                bail!("host {}: unknown method {}", host, name);
            }
        }
        CriterionConfig::FileExtension => {}
    }
    if let Some(retry) = rule.retry_interval {
        check_range("retry_interval", retry, 1, 3600)?;
    }

    if rule.handler == HandlerConfig::Local {
        return Ok(());
    }
    if rule.backends.is_empty() {
        bail!("host {}: {:?} rule without backends", host, rule.handler);
    }
    for backend in &rule.backends {
        parse_backend(backend, rule.handler).with_context(|| format!("host {}", host))?;
    }
    Ok(())
}

/// Splits a backend into host and port. `http://` URLs are accepted.
pub fn parse_backend(value: &str, handler: HandlerConfig) -> anyhow::Result<(String, u16)> {
    if value.contains("://") {
        let url = url::Url::parse(value).with_context(|| format!("invalid backend URL {}", value))?;
        if url.scheme() != "http" {
            bail!("backend {} must use http", value);
        }
        let host = url.host_str().with_context(|| format!("backend {} has no host", value))?;
        let port = url.port_or_known_default().unwrap_or(80);
        return Ok((host.trim_start_matches('[').trim_end_matches(']').to_string(), port));
    }

    match value.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port: u16 = port
                .parse()
                .ok()
                .filter(|&p| p != 0)
                .with_context(|| format!("invalid port in backend {}", value))?;
            Ok((host.trim_start_matches('[').trim_end_matches(']').to_string(), port))
        }
        Some(_) => bail!("backend {} has no host", value),
        None if handler == HandlerConfig::Fastcgi => {
            bail!("fastcgi backend {} requires a port", value)
        }
        None => Ok((value.to_string(), 80)),
    }
}

fn resolve(addr: &str) -> anyhow::Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .with_context(|| format!("{} did not resolve", addr))
}

fn build_host(config: &HostConfig, default_retry: u64) -> anyhow::Result<VirtualHost> {
    let mut host = VirtualHost::new(&config.name, &config.root);
    host.aliases = config.aliases.clone();
    host.dir_listing = config.dir_listing;
    host.log_requests = config.log_requests;

    if config.log_requests {
        let format = config.access_log_format.as_deref().unwrap_or(COMMON_LOG_FORMAT);
        let tokens = access_log::parse_format(format)
            .with_context(|| format!("host {}: invalid access_log_format", config.name))?;
        host.access_log = Some(match &config.access_log {
            Some(path) => AccessLog::to_file(path, tokens)
                .with_context(|| format!("cannot open access log {}", path.display()))?,
            None => AccessLog::to_tracing(tokens),
        });
    }

    for rule in &config.rules {
        host.rules.push(build_rule(rule, default_retry)?);
    }
    Ok(host)
}

fn build_rule(config: &RuleConfig, default_retry: u64) -> anyhow::Result<Rule> {
    let criterion = match config.criterion {
        CriterionConfig::Path => {
            Criterion::Path(config.values.iter().map(|v| v.as_bytes().to_vec()).collect())
        }
        CriterionConfig::FileExtension => {
            Criterion::Extension(config.values.iter().map(|v| v.as_bytes().to_vec()).collect())
        }
        CriterionConfig::Method => {
            let mut set = MethodSet::default();
            for name in &config.values {
                let method = Method::from_bytes(name.as_bytes())
                    .with_context(|| format!("unknown method {}", name))?;
                set.insert(method);
            }
            Criterion::Method(set)
        }
    };
    let handler = match config.handler {
        HandlerConfig::Local => HandlerKind::Local,
        HandlerConfig::Http => HandlerKind::Http,
        HandlerConfig::Fastcgi => HandlerKind::FastCgi,
    };

    let mut backends = Vec::with_capacity(config.backends.len());
    if handler != HandlerKind::Local {
        for value in &config.backends {
            let (host, port) = parse_backend(value, config.handler)?;
            let addr = (host.as_str(), port)
                .to_socket_addrs()
                .with_context(|| format!("cannot resolve backend {}", value))?
                .next()
                .with_context(|| format!("backend {} did not resolve", value))?;
            backends.push(Backend::new(format!("{}:{}", host, port), addr));
        }
    }
    let retry = Duration::from_secs(config.retry_interval.unwrap_or(default_retry));

    Ok(Rule {
        handler,
        criterion,
        backends: BackendList::new(backends, retry),
    })
}
