use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG_PATH: &str = "./pushpop.toml";

/// pushpop relay server
///
/// Every setting is optional here so that only flags (or their env vars)
/// actually given override the TOML file.
#[derive(Parser, Serialize, Clone, Debug, Default)]
#[command(name = "pushpop-server", version, about = "Channel-based WebSocket pub/sub relay")]
pub struct Cli {
    /// Port to listen on (serves both /ws and /trigger) [default: 8945]
    #[arg(long, env = "PUSHPOP_PORT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long, env = "PUSHPOP_BIND_ADDRESS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "PUSHPOP_JSON_LOGS")]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub json_logs: bool,

    /// Log filter used when RUST_LOG is not set [default: pushpop_server=info]
    #[arg(long, env = "PUSHPOP_LOG_FILTER")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_filter: Option<String>,

    /// Path to TOML config file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    #[serde(skip)]
    pub config: String,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip)]
    pub generate_config: bool,
}

/// Resolved server settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,
    pub json_logs: bool,
    pub log_filter: String,

    /// TOML file the settings were read from
    #[serde(skip)]
    pub config: String,

    #[serde(skip)]
    pub generate_config: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8945,
            bind_address: "0.0.0.0".to_string(),
            json_logs: false,
            log_filter: "pushpop_server=info".to_string(),
            config: DEFAULT_CONFIG_PATH.to_string(),
            generate_config: false,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (PUSHPOP_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        Self::from_cli(&Cli::parse())
    }

    pub fn from_cli(cli: &Cli) -> Result<Self, figment::Error> {
        let mut config: Config = Self::figment(cli).extract()?;
        config.config = cli.config.clone();
        config.generate_config = cli.generate_config;
        Ok(config)
    }

    fn figment(cli: &Cli) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&cli.config))
            .merge(Env::prefixed("PUSHPOP_"))
            .merge(Serialized::defaults(cli))
    }

    /// Socket address string to bind, e.g. `0.0.0.0:8945`.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# pushpop relay server configuration
# Place this file at ./pushpop.toml or specify with --config <path>
# All settings can be overridden via environment variables (PUSHPOP_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port for both /ws and /trigger (default: 8945)
# port = 8945

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Log filter used when RUST_LOG is unset
# log_filter = "pushpop_server=info"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_listen_on_fixed_port() {
        let config = Config::default();
        assert_eq!(config.listen_addr(), "0.0.0.0:8945");
        assert!(!config.json_logs);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        Jail::expect_with(|_jail| {
            let cli = Cli::parse_from(["pushpop-server", "--config", "absent.toml"]);
            let config = Config::from_cli(&cli)?;
            assert_eq!(config.listen_addr(), "0.0.0.0:8945");
            assert_eq!(config.log_filter, "pushpop_server=info");
            Ok(())
        });
    }

    #[test]
    fn test_toml_file_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "pushpop.toml",
                r#"
                port = 9100
                bind_address = "127.0.0.1"
                json_logs = true
                "#,
            )?;

            let cli = Cli::parse_from(["pushpop-server", "--config", "pushpop.toml"]);
            let config = Config::from_cli(&cli)?;
            assert_eq!(config.listen_addr(), "127.0.0.1:9100");
            assert!(config.json_logs);
            assert_eq!(config.log_filter, "pushpop_server=info");
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_toml() {
        Jail::expect_with(|jail| {
            jail.create_file("pushpop.toml", "port = 9100\nbind_address = \"127.0.0.1\"")?;
            jail.set_env("PUSHPOP_PORT", "9200");

            let cli = Cli::parse_from(["pushpop-server", "--config", "pushpop.toml"]);
            let config = Config::from_cli(&cli)?;
            assert_eq!(config.listen_addr(), "127.0.0.1:9200");
            Ok(())
        });
    }

    #[test]
    fn test_cli_overrides_toml() {
        Jail::expect_with(|jail| {
            jail.create_file("pushpop.toml", "port = 9100\nlog_filter = \"debug\"")?;

            let cli = Cli::parse_from([
                "pushpop-server",
                "--config",
                "pushpop.toml",
                "--port",
                "9300",
                "--bind-address",
                "127.0.0.1",
            ]);
            let config = Config::from_cli(&cli)?;
            assert_eq!(config.listen_addr(), "127.0.0.1:9300");
            assert_eq!(config.log_filter, "debug");
            assert_eq!(config.config, "pushpop.toml");
            Ok(())
        });
    }

    #[test]
    fn test_template_parses_as_toml() {
        let template = generate_config_template();
        let parsed: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(&template))
            .extract()
            .unwrap();
        assert_eq!(parsed.listen_addr(), "0.0.0.0:8945");
        assert_eq!(parsed.log_filter, "pushpop_server=info");
    }
}
