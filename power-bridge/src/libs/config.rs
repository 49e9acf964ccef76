//! Program configurations.

use std::env;

use clap::{Arg, ArgMatches, Command, value_parser};
use serde::Deserialize;

/// Configuration file object.
#[derive(Default, Deserialize)]
pub struct Config {
    /// Serial port device path such as `/dev/ttyUSB0` or `COM1`.
    #[serde(rename = "devPath")]
    pub dev_path: Option<String>,
    #[serde(rename = "baudRate")]
    pub baud_rate: Option<u32>,
    /// Database root URL such as `https://<db>.firebasedatabase.app/`.
    #[serde(rename = "databaseUrl")]
    pub database_url: Option<String>,
    /// Web API key for anonymous sign-up.
    #[serde(rename = "apiKey")]
    pub api_key: Option<String>,
    /// Static database credential. Takes precedence over `apiKey`.
    #[serde(rename = "authToken")]
    pub auth_token: Option<String>,
    #[serde(rename = "monitoringPath")]
    pub monitoring_path: Option<String>,
    #[serde(rename = "commandPath")]
    pub command_path: Option<String>,
    /// Telemetry poll interval in milliseconds.
    #[serde(rename = "pollInterval")]
    pub poll_interval: Option<u64>,
    /// Command stream timeout in milliseconds.
    #[serde(rename = "streamTimeout")]
    pub stream_timeout: Option<u64>,
}

pub const DEF_DEV_PATH: &'static str = "/dev/ttyUSB0";
pub const DEF_BAUD_RATE: u32 = 9600;
pub const DEF_DATABASE_URL: &'static str = "http://localhost:9000/";
pub const DEF_MONITORING_PATH: &'static str = "monitoring";
pub const DEF_COMMAND_PATH: &'static str = "monitoring/command";
pub const DEF_POLL_INTERVAL: u64 = 1000;
pub const DEF_STREAM_TIMEOUT: u64 = 60000;
pub const MIN_POLL_INTERVAL: u64 = 100;
pub const MAX_POLL_INTERVAL: u64 = 60000;
pub const MIN_STREAM_TIMEOUT: u64 = 1000;

/// To register Clap arguments.
pub fn reg_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("power-bridge.dev-path")
            .long("power-bridge.dev-path")
            .help("Device path such as `/dev/ttyUSB0` or `COM1`")
            .num_args(1),
    )
    .arg(
        Arg::new("power-bridge.baud-rate")
            .long("power-bridge.baud-rate")
            .help("Serial baud rate")
            .num_args(1)
            .value_parser(value_parser!(u32)),
    )
    .arg(
        Arg::new("power-bridge.database-url")
            .long("power-bridge.database-url")
            .help("Realtime database root URL")
            .num_args(1),
    )
    .arg(
        Arg::new("power-bridge.api-key")
            .long("power-bridge.api-key")
            .help("Web API key for anonymous sign-up")
            .num_args(1),
    )
    .arg(
        Arg::new("power-bridge.auth-token")
            .long("power-bridge.auth-token")
            .help("Static database credential")
            .num_args(1),
    )
    .arg(
        Arg::new("power-bridge.monitoring-path")
            .long("power-bridge.monitoring-path")
            .help("Database path of telemetry records")
            .num_args(1),
    )
    .arg(
        Arg::new("power-bridge.command-path")
            .long("power-bridge.command-path")
            .help("Database path of the command slot")
            .num_args(1),
    )
    .arg(
        Arg::new("power-bridge.poll-interval")
            .long("power-bridge.poll-interval")
            .help("Telemetry poll interval (ms). 100~60000")
            .num_args(1)
            .value_parser(value_parser!(u64).range(MIN_POLL_INTERVAL..=MAX_POLL_INTERVAL)),
    )
    .arg(
        Arg::new("power-bridge.stream-timeout")
            .long("power-bridge.stream-timeout")
            .help("Command stream timeout (ms). At least 1000")
            .num_args(1)
            .value_parser(value_parser!(u64).range(MIN_STREAM_TIMEOUT..)),
    )
}

/// To read input arguments from command-line arguments and environment variables.
///
/// This function will call [`apply_default()`] to fill missing values so you do not need call it
/// again.
pub fn read_args(args: &ArgMatches) -> Config {
    apply_default(&Config {
        dev_path: read_string(args, "power-bridge.dev-path", "POWER_BRIDGE_DEV_PATH"),
        baud_rate: match args.get_one::<u32>("power-bridge.baud-rate") {
            None => match env::var("POWER_BRIDGE_BAUD_RATE") {
                Err(_) => None,
                Ok(v) => v.parse::<u32>().ok(),
            },
            Some(v) => Some(*v),
        },
        database_url: read_string(args, "power-bridge.database-url", "POWER_BRIDGE_DATABASE_URL"),
        api_key: read_string(args, "power-bridge.api-key", "POWER_BRIDGE_API_KEY"),
        auth_token: read_string(args, "power-bridge.auth-token", "POWER_BRIDGE_AUTH_TOKEN"),
        monitoring_path: read_string(
            args,
            "power-bridge.monitoring-path",
            "POWER_BRIDGE_MONITORING_PATH",
        ),
        command_path: read_string(args, "power-bridge.command-path", "POWER_BRIDGE_COMMAND_PATH"),
        poll_interval: read_u64(args, "power-bridge.poll-interval", "POWER_BRIDGE_POLL_INTERVAL"),
        stream_timeout: read_u64(
            args,
            "power-bridge.stream-timeout",
            "POWER_BRIDGE_STREAM_TIMEOUT",
        ),
    })
}

/// Fill missing configuration with default values.
pub fn apply_default(config: &Config) -> Config {
    Config {
        dev_path: match config.dev_path.as_ref() {
            None => Some(DEF_DEV_PATH.to_string()),
            Some(path) => Some(path.clone()),
        },
        baud_rate: match config.baud_rate {
            None => Some(DEF_BAUD_RATE),
            Some(rate) => Some(rate),
        },
        database_url: match config.database_url.as_ref() {
            None => Some(DEF_DATABASE_URL.to_string()),
            Some(url) => Some(url.clone()),
        },
        api_key: config.api_key.clone(),
        auth_token: config.auth_token.clone(),
        monitoring_path: match config.monitoring_path.as_ref() {
            None => Some(DEF_MONITORING_PATH.to_string()),
            Some(path) => Some(path.clone()),
        },
        command_path: match config.command_path.as_ref() {
            None => Some(DEF_COMMAND_PATH.to_string()),
            Some(path) => Some(path.clone()),
        },
        poll_interval: match config.poll_interval {
            None => Some(DEF_POLL_INTERVAL),
            Some(interval) => Some(interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)),
        },
        stream_timeout: match config.stream_timeout {
            None => Some(DEF_STREAM_TIMEOUT),
            Some(timeout) => Some(timeout.max(MIN_STREAM_TIMEOUT)),
        },
    }
}

fn read_string(args: &ArgMatches, arg: &str, env_name: &str) -> Option<String> {
    match args.get_one::<String>(arg) {
        None => match env::var(env_name) {
            Err(_) => None,
            Ok(v) => Some(v),
        },
        Some(v) => Some(v.clone()),
    }
}

fn read_u64(args: &ArgMatches, arg: &str, env_name: &str) -> Option<u64> {
    match args.get_one::<u64>(arg) {
        None => match env::var(env_name) {
            Err(_) => None,
            Ok(v) => v.parse::<u64>().ok(),
        },
        Some(v) => Some(*v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(argv: &[&str]) -> ArgMatches {
        reg_args(Command::new("power-bridge")).get_matches_from(argv)
    }

    #[test]
    fn defaults() {
        let conf = apply_default(&Config::default());
        assert_eq!(conf.dev_path.as_deref(), Some(DEF_DEV_PATH));
        assert_eq!(conf.baud_rate, Some(DEF_BAUD_RATE));
        assert_eq!(conf.database_url.as_deref(), Some(DEF_DATABASE_URL));
        assert_eq!(conf.api_key, None);
        assert_eq!(conf.auth_token, None);
        assert_eq!(conf.monitoring_path.as_deref(), Some("monitoring"));
        assert_eq!(conf.command_path.as_deref(), Some("monitoring/command"));
        assert_eq!(conf.poll_interval, Some(1000));
        assert_eq!(conf.stream_timeout, Some(DEF_STREAM_TIMEOUT));
    }

    #[test]
    fn clamp_poll_interval() {
        let conf = apply_default(&Config {
            poll_interval: Some(5),
            ..Default::default()
        });
        assert_eq!(conf.poll_interval, Some(MIN_POLL_INTERVAL));
    }

    #[test]
    fn clamp_stream_timeout() {
        let conf = apply_default(&Config {
            stream_timeout: Some(0),
            ..Default::default()
        });
        assert_eq!(conf.stream_timeout, Some(MIN_STREAM_TIMEOUT));

        let conf: Config = json5::from_str("{ streamTimeout: 10 }").unwrap();
        assert_eq!(apply_default(&conf).stream_timeout, Some(MIN_STREAM_TIMEOUT));

        let conf = apply_default(&Config {
            stream_timeout: Some(5000),
            ..Default::default()
        });
        assert_eq!(conf.stream_timeout, Some(5000));
    }

    #[test]
    fn command_line_args() {
        let args = matches(&[
            "power-bridge",
            "--power-bridge.dev-path",
            "/dev/ttyS1",
            "--power-bridge.baud-rate",
            "115200",
            "--power-bridge.poll-interval",
            "500",
            "--power-bridge.command-path",
            "home/command",
        ]);
        let conf = read_args(&args);
        assert_eq!(conf.dev_path.as_deref(), Some("/dev/ttyS1"));
        assert_eq!(conf.baud_rate, Some(115200));
        assert_eq!(conf.poll_interval, Some(500));
        assert_eq!(conf.command_path.as_deref(), Some("home/command"));
    }

    #[test]
    fn reject_out_of_range_interval() {
        let result = reg_args(Command::new("power-bridge")).try_get_matches_from(&[
            "power-bridge",
            "--power-bridge.poll-interval",
            "10",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn config_file() {
        let conf: Config = json5::from_str(
            r#"{
                devPath: "COM3",
                databaseUrl: "https://demo.firebasedatabase.app/",
                apiKey: "key",
                pollInterval: 2000,
            }"#,
        )
        .unwrap();
        let conf = apply_default(&conf);
        assert_eq!(conf.dev_path.as_deref(), Some("COM3"));
        assert_eq!(conf.api_key.as_deref(), Some("key"));
        assert_eq!(conf.poll_interval, Some(2000));
        assert_eq!(conf.baud_rate, Some(DEF_BAUD_RATE));
    }
}
