//! The `certwardd` binary.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;

use certward::constants::CERTWARD_DEFAULT_CONFIG_FILE;
use certward::daemon::config::Config;
use certward::daemon::start::start_certward_daemon;

#[derive(Parser)]
#[command(
    version,
    about = "Message-driven TLS certificate lifecycle daemon"
)]
struct Options {
    /// Override the path to the config file
    #[arg(
        short = 'c',
        long = "config",
        value_name = "path",
        default_value = CERTWARD_DEFAULT_CONFIG_FILE
    )]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let options = Options::parse();

    let config = match Config::create(&options.config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };

    if let Err(e) = config.init_logging() {
        eprintln!("{e}");
        process::exit(1);
    }

    if let Err(e) = start_certward_daemon(config).await {
        log::error!("{e}");
        process::exit(1);
    }
}
