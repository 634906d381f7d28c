//! logecho server binary.
//!
//! Startup order: configuration, logging, bind, optional daemonization,
//! listen, then the async runtime. Exits 0 on clean shutdown and 1 on any
//! setup failure.

use logecho::config::Config;
use logecho::daemon::{self, Fork};
use logecho::error::{Result, ServerError};
use logecho::logging;
use logecho::server::{self, Server};
use logecho::shutdown::{self, Shutdown};
use std::process::ExitCode;
use tracing::{error, info};

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("logecho: {e}");
            return ExitCode::FAILURE;
        }
    };

    logging::init(&config.log_level, config.syslog);

    let code = match run(config.clone()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Fatal error");
            if config.syslog {
                eprintln!("logecho: {e}");
            }
            ExitCode::FAILURE
        }
    };

    logging::close(config.syslog);
    code
}

fn run(config: Config) -> Result<()> {
    info!(
        listen = %config.listen,
        mode = ?config.mode,
        daemon = config.daemon,
        data_file = %config.data_file.display(),
        "Starting logecho server"
    );

    let socket = server::bind(config.listen)?;

    if config.daemon && daemon::daemonize().map_err(ServerError::Daemonize)? == Fork::Parent {
        return Ok(());
    }

    let listener = server::listen(socket, config.backlog)?;

    // The runtime is only built once any forking is done.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(ServerError::Runtime)?;

    runtime.block_on(async {
        let shutdown = Shutdown::new();
        let signals = shutdown::listen_for_signals(shutdown.clone())?;

        let server = Server::new(&config, shutdown);
        let result = server.run(listener).await;

        signals.abort();
        info!("Server stopped");
        result
    })
}
