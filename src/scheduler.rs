use std::sync::Arc;

use cron::Schedule;
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::sleep,
};

use crate::error::KeeperError;

/// Work run on every tick. Only fatal conditions may be returned as errors.
#[async_trait::async_trait]
pub trait TickHandler: Send + Sync + 'static {
    async fn on_tick(&self, shutdown: watch::Receiver<bool>) -> Result<(), KeeperError>;
}

/// Source of tick instants.
#[async_trait::async_trait]
pub trait Trigger: Send {
    /// Resolves when the next tick is due. Returns false once no more ticks will come.
    async fn wait_next(&mut self) -> bool;
}

/// Fires on every upcoming instant of a cron schedule, evaluated in UTC.
pub struct CronTrigger {
    schedule: Schedule,
}

impl CronTrigger {
    pub fn new(schedule: Schedule) -> Self {
        Self { schedule }
    }
}

#[async_trait::async_trait]
impl Trigger for CronTrigger {
    async fn wait_next(&mut self) -> bool {
        let Some(next) = self.schedule.upcoming(chrono::Utc).next() else {
            return false;
        };
        if let Ok(wait) = (next - chrono::Utc::now()).to_std() {
            sleep(wait).await;
        }
        true
    }
}

/// Runs a startup tick, then one tick per trigger fire. A fire that lands while
/// the previous tick is still running is dropped, never queued.
pub struct Scheduler<H, T> {
    handler: Arc<H>,
    trigger: T,
    shutdown: watch::Receiver<bool>,
    busy: Arc<Mutex<()>>,
}

impl<H: TickHandler, T: Trigger> Scheduler<H, T> {
    pub fn new(handler: Arc<H>, trigger: T, shutdown: watch::Receiver<bool>) -> Self {
        Self { handler, trigger, shutdown, busy: Default::default() }
    }

    /// Runs until shutdown, an exhausted trigger, or a fatal tick error.
    pub async fn run(mut self) -> Result<(), KeeperError> {
        {
            let _busy = self.busy.lock().await;
            self.handler.on_tick(self.shutdown.clone()).await?;
        }

        let (fatal_tx, mut fatal_rx) = mpsc::channel::<KeeperError>(1);
        let mut in_flight: Option<JoinHandle<()>> = None;

        while !*self.shutdown.borrow() {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                Some(e) = fatal_rx.recv() => {
                    log::error!("Stopping scheduler: {e}");
                    return Err(e);
                }
                more = self.trigger.wait_next() => {
                    if !more {
                        log::warn!("Schedule has no upcoming ticks, stopping");
                        break;
                    }
                    let Ok(permit) = self.busy.clone().try_lock_owned() else {
                        log::warn!("Previous tick still running, dropping this one");
                        continue;
                    };
                    if let Some(prev) = in_flight.take() {
                        reap(prev).await;
                    }
                    let handler = Arc::clone(&self.handler);
                    let shutdown = self.shutdown.clone();
                    let fatal = fatal_tx.clone();
                    in_flight = Some(tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = handler.on_tick(shutdown).await {
                            let _ = fatal.send(e).await;
                        }
                    }));
                }
            }
        }

        if let Some(task) = in_flight {
            reap(task).await;
        }
        match fatal_rx.try_recv() {
            Ok(e) => Err(e),
            Err(_) => Ok(()),
        }
    }
}

/// Collects a finished tick task. A panicked tick is logged; the next one starts fresh.
async fn reap(task: JoinHandle<()>) {
    if let Err(e) = task.await {
        log::error!("Tick task aborted: {e}");
    }
}
