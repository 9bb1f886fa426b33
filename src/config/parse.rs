use super::types::Config;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to open config file '{}': {}", path.display(), e),
        ))
    })?;
    let config: Config = serde_yaml::from_str(&contents)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.broker.address.is_empty() {
        return Err(ConfigError::Validation("broker.address is required".into()));
    }
    if config.broker.pool_size == 0 {
        return Err(ConfigError::Validation("broker.pool_size must be > 0".into()));
    }

    if let Some(ship) = &config.ship {
        if ship.batch_limit == 0 {
            return Err(ConfigError::Validation("ship.batch_limit must be > 0".into()));
        }
        if ship.files.is_empty() && ship.watch.is_none() {
            return Err(ConfigError::Validation(
                "ship requires at least one file or a watch directory".into(),
            ));
        }
        if let Some(watch) = &ship.watch {
            if let Some(pattern) = &watch.name_pattern {
                regex::Regex::new(pattern).map_err(|e| {
                    ConfigError::Validation(format!("ship.watch.name_pattern: {}", e))
                })?;
            }
        }
    }

    if let Some(stream) = &config.stream {
        if stream.batch_limit == 0 {
            return Err(ConfigError::Validation("stream.batch_limit must be > 0".into()));
        }
        if stream.udp_listen.is_none() && stream.tcp_listen.is_none() {
            return Err(ConfigError::Validation(
                "stream requires at least one of udp_listen or tcp_listen".into(),
            ));
        }
    }

    if let Some(forward) = &config.forward {
        if forward.topic.is_empty() || forward.channel.is_empty() {
            return Err(ConfigError::Validation(
                "forward.topic and forward.channel are required".into(),
            ));
        }
        if forward.max_in_flight == 0 {
            return Err(ConfigError::Validation(
                "forward.max_in_flight must be > 0".into(),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn load(yaml: &str) -> Result<Config, ConfigError> {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file.flush().unwrap();
        load_config(file.path())
    }

    #[test]
    fn minimal_ship_config() {
        let config = load(
            r#"
broker:
  address: 127.0.0.1:4150
ship:
  files:
    app: /var/log/app.log
"#,
        )
        .unwrap();

        assert_eq!(config.broker.pool_size, 5);
        let ship = config.ship.unwrap();
        assert_eq!(ship.batch_limit, 100);
        assert_eq!(ship.checkpoint_interval.as_secs(), 1);
        assert_eq!(
            ship.files.get("app").unwrap(),
            &std::path::PathBuf::from("/var/log/app.log")
        );
    }

    #[test]
    fn stream_config_with_filter() {
        let config = load(
            r#"
broker:
  address: 127.0.0.1:4150
  pool_size: 3
stream:
  topic: netlogs
  udp_listen: 0.0.0.0:1514
  tcp_listen: 0.0.0.0:1514
  filter:
    address: 127.0.0.1:8500
    key_prefix: logship/rules
    token: secret
"#,
        )
        .unwrap();

        let stream = config.stream.unwrap();
        assert_eq!(stream.batch_limit, 20);
        let filter = stream.filter.unwrap();
        assert_eq!(filter.refresh_interval.as_secs(), 600);
        assert_eq!(filter.key_prefix, "logship/rules");
    }

    #[test]
    fn forward_defaults() {
        let config = load(
            r#"
broker:
  address: 127.0.0.1:4161
forward:
  topic: netlogs
  listen: 0.0.0.0:1514
"#,
        )
        .unwrap();

        let forward = config.forward.unwrap();
        assert_eq!(forward.channel, "logship");
        assert_eq!(forward.max_in_flight, 200);
    }

    #[test]
    fn durations_accept_humantime() {
        let config = load(
            r#"
broker:
  address: 127.0.0.1:4150
ship:
  files:
    app: /var/log/app.log
  poll_interval: 500ms
  checkpoint_interval: 5s
"#,
        )
        .unwrap();

        let ship = config.ship.unwrap();
        assert_eq!(ship.poll_interval.as_millis(), 500);
        assert_eq!(ship.checkpoint_interval.as_secs(), 5);
    }

    #[test]
    fn empty_ship_section_is_rejected() {
        let result = load(
            r#"
broker:
  address: 127.0.0.1:4150
ship: {}
"#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn stream_without_listeners_is_rejected() {
        let result = load(
            r#"
broker:
  address: 127.0.0.1:4150
stream:
  topic: netlogs
"#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn bad_watch_pattern_is_rejected() {
        let result = load(
            r#"
broker:
  address: 127.0.0.1:4150
ship:
  watch:
    dir: /var/log/pods
    topic: pods
    name_pattern: "[unclosed"
"#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn missing_broker_address_fails_parsing() {
        let result = load("ship:\n  files:\n    app: /var/log/app.log\n");
        assert!(matches!(result, Err(ConfigError::YamlParse(_))));
    }
}
