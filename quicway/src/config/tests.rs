use super::*;

fn valid_config() -> ServerConfig {
    let dir = std::env::temp_dir();
    let cert = dir.join("quicway-test-cert.pem");
    let key = dir.join("quicway-test-key.pem");
    std::fs::write(&cert, "test").unwrap();
    std::fs::write(&key, "test").unwrap();

    let mut config = ServerConfig::default();
    config.secrets.token_secret = "token-secret-0123456789abcdef0123456".to_string();
    config.secrets.connection_id_secret = "connection-id-secret-0123456789abcdef".to_string();
    config.tls.cert_path = Some(cert);
    config.tls.key_path = Some(key);
    config.tls.alpn = vec!["h3".to_string()];
    config
}

#[test]
fn default_config_fails_validation() {
    // Secrets and TLS material are mandatory.
    let errors = ServerConfig::default().validate().unwrap_err();
    assert!(errors.iter().any(|e| e.contains("token_secret")));
    assert!(errors.iter().any(|e| e.contains("cert_path")));
}

#[test]
fn valid_config_passes() {
    assert!(valid_config().validate().is_ok());
}

#[test]
fn short_secrets_are_rejected() {
    let mut config = valid_config();
    config.secrets.token_secret = "too-short".to_string();
    let errors = config.validate().unwrap_err();
    assert!(errors.iter().any(|e| e.contains("at least 32")));
}

#[test]
fn identical_secrets_are_rejected() {
    let mut config = valid_config();
    config.secrets.connection_id_secret = config.secrets.token_secret.clone();
    let errors = config.validate().unwrap_err();
    assert!(errors.iter().any(|e| e.contains("must differ")));
}

#[test]
fn zero_pool_sizes_are_rejected() {
    let mut config = valid_config();
    config.pools.socket_pool_size = 0;
    config.pools.dispatcher_pool_size = 0;
    let errors = config.validate().unwrap_err();
    assert!(errors.iter().any(|e| e.contains("socket_pool_size")));
    assert!(errors.iter().any(|e| e.contains("dispatcher_pool_size")));
}

#[test]
fn tiny_channels_are_rejected() {
    let mut config = valid_config();
    config.channels.dispatcher_regular_capacity = 8;
    let errors = config.validate().unwrap_err();
    assert!(errors
        .iter()
        .any(|e| e.contains("dispatcher_regular_capacity")));
}

#[test]
fn invalid_host_is_rejected() {
    let mut config = valid_config();
    config.server.host = "not-an-ip".to_string();
    assert!(config.validate().is_err());
    assert!(config.bind_addr().is_err());
}

#[test]
fn bind_addr_combines_host_and_port() {
    let mut config = valid_config();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 4444;
    assert_eq!(
        config.bind_addr().unwrap(),
        "127.0.0.1:4444".parse().unwrap()
    );
}

#[test]
fn config_roundtrips_through_toml() {
    let config = ServerConfig::default();
    let serialized = toml::to_string_pretty(&config).unwrap();
    let parsed: ServerConfig = toml::from_str(&serialized).unwrap();
    assert_eq!(parsed.server.port, config.server.port);
    assert_eq!(
        parsed.pools.dispatcher_pool_size,
        config.pools.dispatcher_pool_size
    );
    assert_eq!(
        parsed.transport.initial_max_data,
        config.transport.initial_max_data
    );
}

#[test]
fn partial_toml_uses_defaults() {
    let parsed: ServerConfig = toml::from_str(
        r#"
        [server]
        port = 9999

        [transport]
        enable_dgram = false
        "#,
    )
    .unwrap();
    assert_eq!(parsed.server.port, 9999);
    assert_eq!(parsed.server.host, "0.0.0.0");
    assert!(!parsed.transport.enable_dgram);
    assert_eq!(parsed.channels.sender_capacity, 4096);
}
