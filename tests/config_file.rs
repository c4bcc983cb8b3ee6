//! Configuration files on disk: the generated starter file loads back, and a
//! hand-written file with channel keys produces the expected key ring entries.
use meshgate::config::Config;
use std::io::Write;
use tempfile::{tempdir, NamedTempFile};

#[tokio::test]
async fn starter_file_loads_and_validates() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    let path = path.to_str().unwrap();

    Config::create_default(path).await.unwrap();
    let config = Config::load(path).await.unwrap();
    config.validate().unwrap();
    assert_eq!(config.devices[0].name, "base");
    assert_eq!(config.session.command_timeout_secs, 15);
    assert!(config.channel_keys().unwrap().is_empty());
}

#[tokio::test]
async fn channels_and_mqtt_sections_are_read() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[server]
bind = "0.0.0.0:9000"

[[devices]]
name = "base"
host = "127.0.0.1"
port = 4500

[[devices]]
name = "roof"
host = "10.0.0.7"

[[channels]]
name = "Ops"
psk = "ICEiIyQlJicoKSorLC0uLw=="

[[channels]]
name = "Open"
psk = "AA=="

[mqtt]
enabled = true
root_topic = "msh/EU_868"
gateway_id = "!00000009"
"#
    )
    .unwrap();

    let config = Config::load(file.path().to_str().unwrap()).await.unwrap();
    config.validate().unwrap();
    assert_eq!(config.devices.len(), 2);
    assert_eq!(config.devices[1].port, 4403);

    // the unencrypted channel contributes no key
    let keys = config.channel_keys().unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].name, "Ops");

    let mqtt = config.mqtt_settings();
    assert_eq!(mqtt.root_topic, "msh/EU_868");
    assert_eq!(mqtt.gateway_node, 9);
}

#[tokio::test]
async fn missing_file_is_an_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    let err = Config::load(path.to_str().unwrap()).await.unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

#[tokio::test]
async fn shipped_example_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config.example.toml");
    let config = Config::load(path).await.unwrap();
    config.validate().unwrap();
    assert_eq!(config.session.reconnect_interval_secs, Some(30));
    assert!(!config.mqtt.enabled);
}
