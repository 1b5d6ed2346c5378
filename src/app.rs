use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cli::{Command, StartOptions};
use crate::logging;
use crate::service::{ProcessRunner, Runner, Service};
use crate::version;

pub fn run(command: Command) -> Result<i32> {
    match command {
        Command::ShowVersion => {
            println!("{}", version::describe());
            Ok(0)
        }
        Command::Start(options) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to build async runtime")?;
            Ok(runtime.block_on(start(options)))
        }
    }
}

async fn start(options: StartOptions) -> i32 {
    logging::init(options.verbose);
    info!("Starting {}", version::describe());

    let root = CancellationToken::new();
    tokio::spawn(cancel_on_signal(root.clone()));

    let runner: Arc<dyn Runner> = Arc::new(ProcessRunner::new(
        options.executable,
        options.server_args,
    ));
    let result = match Service::new(options.config, runner, &root) {
        Ok(service) => service.run().await,
        Err(err) => Err(err),
    };
    match result {
        Ok(()) => 0,
        Err(err) => {
            error!(kind = err.kind(), "{}", err);
            err.exit_code()
        }
    }
}

/// Cancels `root` on the first SIGINT or SIGTERM.
async fn cancel_on_signal(root: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut term, mut int) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(err), _) | (_, Err(err)) => {
                error!("Cannot install signal handlers: {}", err);
                return;
            }
        };
        tokio::select! {
            _ = term.recv() => info!("Received SIGTERM"),
            _ = int.recv() => info!("Received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl-C: {}", err);
            return;
        }
        info!("Received Ctrl-C");
    }
    root.cancel();
}
