use std::env;
use std::process::ExitCode;
use log::info;
use ble_session::{init_logging, run};
use ble_session::error::{error_report, AppRunError, ConfigError};

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = init_logging() {
        eprintln!("Failed to initialize logger: {}", err);
    }
    info!(concat!("ble-session ", env!("CARGO_PKG_VERSION")));

    match run(env::args()).await {
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            error_report("Unable to start", &"This application has already been started");
            ExitCode::FAILURE
        },
        Err(err @ AppRunError::BridgeStartup { .. }) => {
            error_report("Bluetooth is not available on this machine", &err);
            ExitCode::FAILURE
        },
        Err(err) => {
            error_report("Unexpected error", &err);
            ExitCode::FAILURE
        },
        Ok(_) => ExitCode::SUCCESS,
    }
}
