use tracing::{error, info};

fn main() {
    let exit_code = match run() {
        Ok(()) => {
            info!(event = "daemon.stop_completed");
            0
        }
        Err(e) => {
            error!(event = "daemon.start_failed", error = %e);
            eprintln!("weft-daemon: {}", e);
            1
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = weft_daemon::load_daemon_config()?;

    weft_daemon::init_logging(config.log_json);
    info!(
        event = "daemon.start_started",
        pid = std::process::id(),
        socket = %config.socket_path.display(),
    );

    let rt = tokio::runtime::Runtime::new().map_err(|e| {
        error!(event = "daemon.runtime_init_failed", error = %e);
        e
    })?;

    rt.block_on(async {
        weft_daemon::run_server(config).await.map_err(|e| {
            error!(event = "daemon.server_failed", error = %e);
            e
        })
    })?;

    Ok(())
}
