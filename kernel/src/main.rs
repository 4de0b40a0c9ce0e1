//! `vatvisor` launcher.
//!
//! Loads settings, installs logging and starts a supervision tree with the
//! bindings worker and one engine worker beneath it. The argument is
//! imported when it names a `.js` module and evaluated as source otherwise.
//! The tree shuts down once every port has closed, or on Ctrl-C.

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};
use vatvisor_kernel::bindings::run_bindings_worker;
use vatvisor_kernel::driver::Driver;
use vatvisor_kernel::engine::EngineLauncher;
use vatvisor_kernel::infrastructure::{config::Settings, telemetry::TelemetryBuilder};
use vatvisor_kernel::message::Id;
use vatvisor_kernel::supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::new().context("Failed to load configuration")?;

    TelemetryBuilder::new(env!("CARGO_PKG_NAME"))
        .with_settings(&settings.telemetry)
        .init()?;

    let Some(target) = std::env::args().nth(1) else {
        anyhow::bail!("usage: vatvisor <module.js | source>");
    };

    let launcher = EngineLauncher::from_settings(&settings).context("Failed to prepare engine")?;

    info!(engine = ?settings.engine.kind, "vatvisor starting");
    let supervisor = Supervisor::new(settings.debug);
    supervisor.start();

    let bindings = supervisor.spawn(Id::SUPERVISOR, run_bindings_worker);
    let vat = supervisor.spawn(bindings, move |ctx| launcher.run(ctx));
    let driver = Driver::new(supervisor.clone());

    let run = async {
        let outcome = if target.ends_with(".js") {
            driver.import(vat, &target).await
        } else {
            driver.evaluate(vat, &target).await
        };
        match &outcome {
            Ok(_) => info!(worker = %vat, "Entry point completed"),
            Err(e) => error!(worker = %vat, error = %e, "Entry point failed"),
        }
        driver.shutdown().await;
        outcome
    };

    tokio::select! {
        outcome = run => {
            outcome?;
        }
        () = shutdown_signal() => {
            info!("Shutdown signal received, stopping workers...");
            supervisor.stop();
            supervisor.wait().await;
        }
    }

    info!("vatvisor shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
