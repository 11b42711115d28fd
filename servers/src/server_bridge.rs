use anyhow::Result;
use tokio::signal;

mod bridge_logic;
use bridge_logic::{bridge, config, logger};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config();
    let settings = config.into_settings()?;
    logger::setup_logging(&settings.log_dir, &settings.log_level)?;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let mut bridge_handle = tokio::spawn(bridge::run(settings, shutdown_tx.subscribe()));
    let mut bridge_done = false;

    // Wait for a shutdown signal, or for the bridge to stop on its own
    // (fatal startup errors end the process)
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut term_signal = signal::unix::signal(signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
                term_signal.recv().await;
                log::info!("SIGTERM received, initiating shutdown.");
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
        result = &mut bridge_handle => {
            bridge_done = true;
            report(result);
        }
    }

    if !bridge_done {
        // Tell the bridge to tear down and wait for it
        let _ = shutdown_tx.send(());
        report(bridge_handle.await);
    }

    log::info!("Shutdown complete.");
    Ok(())
}

fn report(result: std::result::Result<Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => log::error!("Bridge failed: {:#}", err),
        Err(err) => log::error!("Bridge task panicked: {}", err),
    }
}
