use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{load_fusion_config, parse_endpoint, ConfigError, PilotConfig};
use crate::credentials::CredentialConfig;
use crate::fusion::FusionConfig;
use crate::telemetry::logging::{LogConfig, LogLevel};
use crate::transfer::{DeletePolicy, RetryPolicy, TransferConfig};
use pilot_proto::MAX_SYNC_KEYS;

#[derive(Parser, Debug)]
#[command(
    name = "pilot",
    about = "Remote-control session and screenshot sync client",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "PILOT_ENDPOINT",
        value_name = "URL",
        help = "wss:// URL of the control server"
    )]
    pub endpoint: String,

    #[arg(
        long,
        env = "PILOT_USERNAME",
        help = "User label; lowercased into every object key"
    )]
    pub username: String,

    #[command(flatten)]
    pub credentials: CredentialArgs,

    #[arg(long = "heartbeat-secs", env = "PILOT_HEARTBEAT_SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,

    #[arg(
        long = "connect-timeout-secs",
        env = "PILOT_CONNECT_TIMEOUT_SECS",
        default_value_t = 15
    )]
    pub connect_timeout_secs: u64,

    #[arg(long = "tick-rate", env = "PILOT_TICK_RATE", default_value_t = 60, help = "Owner loop frequency in Hz")]
    pub tick_rate: u32,

    #[arg(
        long = "data-dir",
        env = "PILOT_DATA_DIR",
        value_name = "DIR",
        default_value = "pilot-data",
        help = "Screenshots live under <DIR>/screenshots"
    )]
    pub data_dir: PathBuf,

    #[command(flatten)]
    pub input: InputArgs,

    #[command(flatten)]
    pub transfer: TransferArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Args, Debug, Clone)]
pub struct CredentialArgs {
    #[arg(
        long = "bundle",
        env = "PILOT_BUNDLE",
        value_name = "PATH",
        help = "PKCS#12 client identity"
    )]
    pub bundle: PathBuf,

    #[arg(
        long = "bundle-passphrase",
        env = "PILOT_BUNDLE_PASSPHRASE",
        default_value = "",
        hide_env_values = true,
        hide_default_value = true
    )]
    pub passphrase: String,

    #[arg(
        long = "trusted-root",
        env = "PILOT_TRUSTED_ROOT",
        value_name = "PATH",
        help = "Extra PEM or DER root certificate for the server chain"
    )]
    pub trusted_root: Option<PathBuf>,

    #[arg(
        long = "pin",
        env = "PILOT_SERVER_PINS",
        value_name = "SHA256",
        value_delimiter = ',',
        help = "SHA-256 fingerprint the server leaf certificate must match (repeatable)"
    )]
    pub pins: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct InputArgs {
    #[arg(long, env = "PILOT_SENSITIVITY", default_value_t = 1.0)]
    pub sensitivity: f32,

    #[arg(
        long,
        env = "PILOT_DISCRETE",
        help = "Treat motion packets as sparse gestures instead of a stream"
    )]
    pub discrete: bool,

    #[arg(
        long = "fusion-config",
        env = "PILOT_FUSION_CONFIG",
        value_name = "TOML",
        help = "Override fusion tuning from a TOML file"
    )]
    pub fusion_config: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct TransferArgs {
    #[arg(long = "max-attempts", env = "PILOT_MAX_ATTEMPTS", default_value_t = 4)]
    pub max_attempts: u32,

    #[arg(long = "retry-delay-ms", env = "PILOT_RETRY_DELAY_MS", default_value_t = 1000)]
    pub retry_delay_ms: u64,

    #[arg(long = "http-timeout-secs", env = "PILOT_HTTP_TIMEOUT_SECS", default_value_t = 30)]
    pub http_timeout_secs: u64,

    #[arg(
        long = "sync-key-cap",
        env = "PILOT_SYNC_KEY_CAP",
        default_value_t = MAX_SYNC_KEYS
    )]
    pub sync_key_cap: usize,

    #[arg(
        long = "delete-policy",
        value_enum,
        env = "PILOT_DELETE_POLICY",
        default_value_t = DeletePolicy::Strict
    )]
    pub delete_policy: DeletePolicy,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "PILOT_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "PILOT_LOG_FILE",
        help = "Write logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Connect and run the control loop until interrupted (default)
    Run,
    /// Store a JPEG as a capture stamped now and upload it
    Upload {
        #[arg(value_name = "JPEG")]
        path: PathBuf,
    },
    /// Delete a capture remotely, then locally
    Delete {
        #[arg(value_name = "EPOCH_MILLIS")]
        timestamp: i64,
    },
    /// Reconcile local captures with the object store
    Sync,
}

impl Cli {
    pub fn subcommand(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}

impl TryFrom<&Cli> for PilotConfig {
    type Error = ConfigError;

    fn try_from(cli: &Cli) -> Result<Self, Self::Error> {
        let fusion = match &cli.input.fusion_config {
            Some(path) => load_fusion_config(path)?,
            None => FusionConfig::default(),
        };
        let config = PilotConfig {
            endpoint: parse_endpoint(&cli.endpoint)?,
            username: cli.username.clone(),
            credentials: CredentialConfig {
                bundle: cli.credentials.bundle.clone(),
                passphrase: cli.credentials.passphrase.clone(),
                trusted_root: cli.credentials.trusted_root.clone(),
                pins: cli.credentials.pins.clone(),
            },
            heartbeat: Duration::from_secs(cli.heartbeat_secs),
            connect_timeout: Duration::from_secs(cli.connect_timeout_secs),
            tick_rate: cli.tick_rate,
            data_dir: cli.data_dir.clone(),
            sensitivity: cli.input.sensitivity,
            discrete: cli.input.discrete,
            transfer: TransferConfig {
                retry: RetryPolicy {
                    max_attempts: cli.transfer.max_attempts,
                    delay: Duration::from_millis(cli.transfer.retry_delay_ms),
                },
                sync_key_cap: cli.transfer.sync_key_cap.min(MAX_SYNC_KEYS),
                delete_policy: cli.transfer.delete_policy,
            },
            http_timeout: Duration::from_secs(cli.transfer.http_timeout_secs),
            fusion,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: [&str; 7] = [
        "pilot",
        "--endpoint",
        "wss://control.example/ws",
        "--username",
        "Alice",
        "--bundle",
        "client.p12",
    ];

    fn parse(extra: &[&str]) -> Cli {
        Cli::try_parse_from(BASE.iter().chain(extra.iter())).unwrap()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cli = parse(&[]);
        assert_eq!(cli.subcommand(), Command::Run);
        let config = PilotConfig::try_from(&cli).unwrap();
        assert_eq!(config.heartbeat, Duration::from_secs(30));
        assert_eq!(config.tick_rate, 60);
        assert_eq!(config.transfer.retry, RetryPolicy::default());
        assert_eq!(config.transfer.delete_policy, DeletePolicy::Strict);
        assert_eq!(config.transfer.sync_key_cap, MAX_SYNC_KEYS);
        assert_eq!(config.http_timeout, Duration::from_secs(30));
        assert_eq!(config.fusion, FusionConfig::default());
    }

    #[test]
    fn subcommands_and_overrides_parse() {
        let cli = parse(&[
            "--delete-policy",
            "missing-ok",
            "--pin",
            "aa:bb,cc",
            "--discrete",
            "delete",
            "1700000000000",
        ]);
        assert_eq!(
            cli.subcommand(),
            Command::Delete {
                timestamp: 1_700_000_000_000
            }
        );
        assert_eq!(cli.credentials.pins, vec!["aa:bb".to_string(), "cc".to_string()]);
        let config = PilotConfig::try_from(&cli).unwrap();
        assert_eq!(config.transfer.delete_policy, DeletePolicy::MissingOk);
        assert!(config.discrete);
    }

    #[test]
    fn insecure_endpoint_is_a_config_error() {
        let cli = Cli::try_parse_from([
            "pilot",
            "--endpoint",
            "ws://control.example/ws",
            "--username",
            "a",
            "--bundle",
            "b.p12",
        ])
        .unwrap();
        assert!(matches!(
            PilotConfig::try_from(&cli),
            Err(ConfigError::InsecureEndpoint(_))
        ));
    }
}
