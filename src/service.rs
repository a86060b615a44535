use std::{future::Future, path::PathBuf, sync::Arc};

use eyre::{Context, Result};
use tokio::sync::watch;

use crate::{
    chain::{ChainClient, VaultClient},
    config::{FileConfig, Settings},
    keeper::Keeper,
    scheduler::{CronTrigger, Scheduler},
};

#[cfg(unix)]
fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = int.recv() => {},
            _ = term.recv() => {},
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    Ok(async {
        let _ = tokio::signal::ctrl_c().await;
    })
}

/// Runs `fut` to completion unless shutdown is signalled first.
async fn unless_stopped<F: Future>(fut: F, stop: &mut watch::Receiver<bool>) -> Option<F::Output> {
    if *stop.borrow() {
        return None;
    }
    tokio::select! {
        out = fut => Some(out),
        Ok(()) = stop.changed() => None,
    }
}

/// Resolves config, connects, and runs the harvest loop until a shutdown signal
/// or a fatal error. Every error returned here ends the process.
pub async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let file = match &config_path {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    if let Err(e) = dotenvy::from_path(file.dotenv_path()) {
        log::warn!("{} not loaded: {e}", file.dotenv_path());
    }

    let (settings, signer) = Settings::from_env(&file)?;

    let stop = shutdown_signal().wrap_err("failed to install signal handlers")?;
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        stop.await;
        log::info!("Shutdown signal received, stopping keeper");
        let _ = stop_tx.send(true);
    });
    let mut startup_stop = stop_rx.clone();

    let client = VaultClient::connect(settings.rpc_endpoint.clone(), signer);
    let Some(chain_id) = unless_stopped(client.chain_id(), &mut startup_stop).await else {
        return Ok(());
    };
    let chain_id = chain_id.wrap_err("failed to get network ID")?;
    let cfg = Arc::new(settings.into_config(chain_id));

    let keeper = Arc::new(Keeper::new(Arc::clone(&cfg), client));
    if unless_stopped(keeper.report_startup(), &mut startup_stop).await.is_none() {
        log::info!("Keeper stopped before the first tick");
        return Ok(());
    }

    log::info!("Keeper running with schedule: {}", cfg.schedule_expr);
    let trigger = CronTrigger::new(cfg.schedule.clone());
    Scheduler::new(keeper, trigger, stop_rx).run().await?;

    log::info!("Keeper stopped");
    Ok(())
}
