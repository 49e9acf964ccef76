use std::{error::Error as StdError, fs, sync::Arc, time::Duration};

use clap::{Arg as ClapArg, Command};
use log::{self, error, info};
use serde::Deserialize;
use sylvia_iot_sdk::util::logger;
use tokio;

use power_bridge::libs::{
    self,
    bridge_task::{BridgeTask, Options as TaskOptions},
    config::Config,
    rtdb::{Options as RtdbOptions, RtdbClient},
    serial_link::{Options as SerialOptions, SerialLink},
};

#[derive(Deserialize)]
struct AppConfig {
    log: logger::Config,
    #[serde(rename = "powerBridge")]
    power_bridge: Config,
}

const PROJ_NAME: &'static str = env!("CARGO_PKG_NAME");
const PROJ_VER: &'static str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> std::io::Result<()> {
    const FN_NAME: &'static str = "main";

    let conf = match init_config() {
        Err(e) => {
            let conf = &logger::Config {
                ..Default::default()
            };
            logger::init(PROJ_NAME, &conf);
            error!("[{}] read config error: {}", FN_NAME, e);
            return Ok(());
        }
        Ok(conf) => conf,
    };

    logger::init(PROJ_NAME, &conf.log);

    let bridge_conf = libs::config::apply_default(&conf.power_bridge);
    let opts = RtdbOptions {
        database_url: bridge_conf.database_url.unwrap_or_default(),
        api_key: bridge_conf.api_key,
        auth_token: bridge_conf.auth_token,
        stream_timeout: Duration::from_millis(
            bridge_conf
                .stream_timeout
                .unwrap_or(libs::config::DEF_STREAM_TIMEOUT),
        ),
    };
    let store = match RtdbClient::new(opts) {
        Err(e) => {
            error!("[{}] new database client error: {}", FN_NAME, e);
            return Ok(());
        }
        Ok(store) => Arc::new(store),
    };

    let (link, lines) = SerialLink::new(SerialOptions {
        dev_path: bridge_conf.dev_path.unwrap_or_default(),
        baud_rate: bridge_conf
            .baud_rate
            .unwrap_or(libs::config::DEF_BAUD_RATE),
    });

    let opts = TaskOptions {
        store,
        sink: Arc::new(link),
        lines,
        monitoring_path: bridge_conf.monitoring_path.unwrap_or_default(),
        command_path: bridge_conf.command_path.unwrap_or_default(),
        poll_interval: bridge_conf
            .poll_interval
            .unwrap_or(libs::config::DEF_POLL_INTERVAL),
    };
    let _task = BridgeTask::new(opts);
    info!("[{}] {} {} started", FN_NAME, PROJ_NAME, PROJ_VER);
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await
    }
}

fn init_config() -> Result<AppConfig, Box<dyn StdError>> {
    let mut args = Command::new(PROJ_NAME).version(PROJ_VER).arg(
        ClapArg::new("file")
            .short('f')
            .long("file")
            .help("config file")
            .num_args(1),
    );
    args = logger::reg_args(args);
    args = libs::config::reg_args(args);
    let args = args.get_matches();

    if let Some(v) = args.get_one::<String>("file") {
        let conf_str = fs::read_to_string(v)?;
        return Ok(json5::from_str(conf_str.as_str())?);
    }

    Ok(AppConfig {
        log: logger::read_args(&args),
        power_bridge: libs::config::read_args(&args),
    })
}
