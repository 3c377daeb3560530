use conduit_domain::config::{ClientConfig, TransportKind, TransportSpec};

#[test]
fn default_options() {
    let config = ClientConfig::default();
    assert_eq!(config.options.request_timeout_ms, 60_000);
    assert_eq!(config.options.init_retries, 2);
    assert_eq!(config.options.protocol_version, "2024-11-05");
    assert_eq!(config.options.client_name, "conduit");
}

#[test]
fn toml_server_table_parses() {
    let toml_str = r#"
[servers.filesystem]
transport = "process"
command = "npx"
args = ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]

[servers.filesystem.env]
NODE_ENV = "production"

[servers.remote]
transport = "stream"
url = "http://localhost:8080/sse"
headers = { Authorization = "Bearer abc" }
expect_capabilities = ["tools"]
"#;
    let config = ClientConfig::from_toml_str(toml_str).unwrap();
    assert_eq!(config.servers.len(), 2);
    assert_eq!(config.servers["filesystem"].kind(), TransportKind::Process);
    assert_eq!(config.servers["remote"].kind(), TransportKind::Stream);
    assert_eq!(config.servers["remote"].expect_capabilities, vec!["tools"]);
    match &config.servers["filesystem"].transport {
        TransportSpec::Process { env, .. } => assert_eq!(env["NODE_ENV"], "production"),
        other => panic!("unexpected transport {other:?}"),
    }
}

#[test]
fn options_override_partial() {
    let toml_str = r#"
[options]
request_timeout_ms = 1500
benign_exit_codes = [0, 1, 143]
"#;
    let config = ClientConfig::from_toml_str(toml_str).unwrap();
    assert_eq!(config.options.request_timeout_ms, 1500);
    assert!(config.options.is_benign_exit(Some(1), None));
    // Untouched fields keep their defaults.
    assert_eq!(config.options.init_timeout_ms, 30_000);
}

#[test]
fn load_picks_format_by_extension() {
    let dir = tempfile::tempdir().unwrap();

    let json_path = dir.path().join("mcp.json");
    std::fs::write(
        &json_path,
        r#"{ "servers": { "echo": { "transport": "process", "command": "cat" } } }"#,
    )
    .unwrap();
    let config = ClientConfig::load(&json_path).unwrap();
    assert!(config.servers.contains_key("echo"));

    let toml_path = dir.path().join("mcp.toml");
    std::fs::write(&toml_path, "[servers.echo]\ntransport = \"process\"\ncommand = \"cat\"\n").unwrap();
    let config = ClientConfig::load(&toml_path).unwrap();
    assert!(config.servers.contains_key("echo"));

    let yaml_path = dir.path().join("mcp.yaml");
    std::fs::write(&yaml_path, "servers: {}").unwrap();
    assert!(ClientConfig::load(&yaml_path).is_err());
}
