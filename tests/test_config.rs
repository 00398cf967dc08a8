//! Tests for configuration loading, validation and building

use std::time::Duration;

use sentinel_gateway::config::{Config, DEFAULT_LISTEN_ADDR, HandlerConfig, parse_backend};
use sentinel_gateway::http::vhost::HandlerKind;

const SITE: &str = r#"
listen_addr: "127.0.0.1:0"
general:
  max_payload_in_memory: 8
  backend_retry_interval: 10
  index_files: [index.html, index.htm]
hosts:
  - name: example.com
    aliases: [www.example.com]
    root: /srv/www
    default: true
    rules:
      - handler: fastcgi
        criterion: file_extension
        values: [php]
        backends: ["127.0.0.1:9000"]
      - handler: http
        criterion: path
        values: [/api]
        backends: ["http://127.0.0.1:8081", "127.0.0.1:8082"]
        retry_interval: 5
  - name: static.example.com
    root: /srv/static
    dir_listing: true
"#;

fn with_host_rule(rule: &str) -> String {
    format!(
        "hosts:\n  - name: a\n    root: /tmp\n    rules:\n{}",
        rule.lines().map(|l| format!("      {}\n", l)).collect::<String>()
    )
}

fn error_of(yaml: &str) -> String {
    format!("{:#}", Config::from_yaml(yaml).unwrap_err())
}

#[test]
fn test_config_environment() {
    // one test so the variables are not raced by parallel tests
    unsafe {
        std::env::remove_var("SENTINEL_CONFIG");
        std::env::remove_var("LISTEN");
    }
    let cfg = Config::load().unwrap();
    assert_eq!(cfg.listen_addr, DEFAULT_LISTEN_ADDR);
    assert_eq!(cfg.hosts.len(), 1);
    assert!(cfg.hosts[0].default);

    unsafe {
        std::env::set_var("LISTEN", "0.0.0.0:3000");
    }
    let cfg = Config::load().unwrap();
    assert_eq!(cfg.listen_addr, "0.0.0.0:3000");

    let path = std::env::temp_dir().join(format!("sentinel-config-{}.yaml", std::process::id()));
    std::fs::write(&path, SITE).unwrap();
    unsafe {
        std::env::set_var("SENTINEL_CONFIG", &path);
    }
    let cfg = Config::load().unwrap();
    // LISTEN still wins over the file
    assert_eq!(cfg.listen_addr, "0.0.0.0:3000");
    assert_eq!(cfg.hosts.len(), 2);

    unsafe {
        std::env::set_var("SENTINEL_CONFIG", "/nonexistent/sentinel.yaml");
    }
    assert!(Config::load().is_err());

    unsafe {
        std::env::remove_var("SENTINEL_CONFIG");
        std::env::remove_var("LISTEN");
    }
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_config_clone() {
    let cfg1 = Config::from_yaml(SITE).unwrap();
    let cfg2 = cfg1.clone();
    assert_eq!(cfg1.listen_addr, cfg2.listen_addr);
    assert_eq!(cfg1.hosts.len(), cfg2.hosts.len());
}

#[test]
fn test_config_defaults_fill_missing_fields() {
    let cfg = Config::from_yaml("hosts:\n  - name: a\n    root: /tmp\n").unwrap();
    assert_eq!(cfg.listen_addr, DEFAULT_LISTEN_ADDR);
    assert_eq!(cfg.general.max_connections, 1024);
    assert_eq!(cfg.general.max_idle_time, 30);
    assert_eq!(cfg.general.max_payload_in_memory, 4);
    assert_eq!(cfg.general.backend_retry_interval, 300);
    assert_eq!(cfg.general.index_files, vec!["index.html"]);
    assert!(!cfg.hosts[0].default);
    assert!(cfg.hosts[0].rules.is_empty());
}

#[test]
fn test_config_rejects_out_of_range_settings() {
    let zero = error_of("general:\n  max_payload_in_memory: 0\n");
    assert!(zero.contains("max_payload_in_memory"), "{}", zero);
    let large = error_of("general:\n  max_payload_in_memory: 65\n");
    assert!(large.contains("max_payload_in_memory"), "{}", large);
    let retry = error_of("general:\n  backend_retry_interval: 4000\n");
    assert!(retry.contains("backend_retry_interval"), "{}", retry);
}

#[test]
fn test_config_rejects_two_default_hosts() {
    let yaml = concat!(
        "hosts:\n",
        "  - name: a\n    root: /a\n    default: true\n",
        "  - name: b\n    root: /b\n    default: true\n",
    );
    assert!(error_of(yaml).contains("default"));
}

#[test]
fn test_config_rejects_duplicate_names() {
    let yaml = concat!(
        "hosts:\n",
        "  - name: a.com\n    root: /a\n",
        "  - name: b.com\n    aliases: [A.COM]\n    root: /b\n",
    );
    assert!(error_of(yaml).contains("duplicate"));
}

#[test]
fn test_config_rejects_bad_rules() {
    let relative = with_host_rule(
        "- handler: http\n  criterion: path\n  values: [api]\n  backends: [\"127.0.0.1:80\"]",
    );
    assert!(error_of(&relative).contains("must start with /"));

    let method = with_host_rule("- handler: local\n  criterion: method\n  values: [FETCH]");
    assert!(error_of(&method).contains("unknown method"));

    let no_values = with_host_rule("- handler: local\n  criterion: path");
    assert!(error_of(&no_values).contains("without values"));

    let no_backends = with_host_rule("- handler: http\n  criterion: path\n  values: [/api]");
    assert!(error_of(&no_backends).contains("without backends"));

    let fcgi_port = with_host_rule(
        "- handler: fastcgi\n  criterion: file_extension\n  values: [php]\n  backends: [localhost]",
    );
    assert!(error_of(&fcgi_port).contains("requires a port"));

    let unknown_handler = with_host_rule("- handler: cgi\n  criterion: path\n  values: [/]");
    assert!(Config::from_yaml(&unknown_handler).is_err());
}

#[test]
fn test_parse_backend_forms() {
    assert_eq!(
        parse_backend("127.0.0.1:9000", HandlerConfig::Fastcgi).unwrap(),
        ("127.0.0.1".to_string(), 9000)
    );
    assert_eq!(
        parse_backend("app.internal", HandlerConfig::Http).unwrap(),
        ("app.internal".to_string(), 80)
    );
    assert_eq!(
        parse_backend("http://app.internal:8081/", HandlerConfig::Http).unwrap(),
        ("app.internal".to_string(), 8081)
    );
    assert_eq!(
        parse_backend("http://app.internal", HandlerConfig::Http).unwrap(),
        ("app.internal".to_string(), 80)
    );
    assert_eq!(
        parse_backend("[::1]:8080", HandlerConfig::Http).unwrap(),
        ("::1".to_string(), 8080)
    );
    assert!(parse_backend("https://app.internal", HandlerConfig::Http).is_err());
    assert!(parse_backend("app.internal:0", HandlerConfig::Http).is_err());
    assert!(parse_backend(":80", HandlerConfig::Http).is_err());
    assert!(parse_backend("app.internal", HandlerConfig::Fastcgi).is_err());
}

#[test]
fn test_config_build() {
    let gateway = Config::from_yaml(SITE).unwrap().build().unwrap();

    assert_eq!(gateway.listen.port(), 0);
    assert_eq!(gateway.settings.max_payload_in_memory, 8 * 1024);
    assert_eq!(gateway.settings.index_files, vec!["index.html", "index.htm"]);

    let hosts = &gateway.hosts;
    assert_eq!(hosts.len(), 2);
    assert_eq!(hosts.default_host(), Some(0));
    assert_eq!(hosts.lookup("WWW.example.com"), Some(0));
    assert_eq!(hosts.lookup("static.example.com"), Some(1));
    assert_eq!(hosts.lookup("other.example.com"), None);

    let main = hosts.get(0).unwrap();
    assert_eq!(main.rules.len(), 2);
    assert_eq!(main.rules[0].handler, HandlerKind::FastCgi);
    assert_eq!(main.rules[0].backends.retry_interval(), Duration::from_secs(10));
    assert_eq!(main.rules[1].handler, HandlerKind::Http);
    assert_eq!(main.rules[1].backends.len(), 2);
    assert_eq!(main.rules[1].backends.retry_interval(), Duration::from_secs(5));
    assert_eq!(main.rules[1].backends.get(0).unwrap().addr.port(), 8081);

    let statics = hosts.get(1).unwrap();
    assert!(statics.dir_listing);
    assert!(statics.access_log.is_none());
}
