use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::WorkerRegistry;
use crate::automatic::Reconciler;
use crate::config::HarvestConfig;
use crate::scheduler::{unlock_stuck_schedulers, EndpointScheduler, RunOutcome};
use crate::HarvestContext;

/// Cadence of the periodic loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchIntervals {
    pub tick: Duration,
    pub sweep: Duration,
    pub reconcile: Duration,
}

impl DispatchIntervals {
    /// Tick and sweep from `scheduler`, reconcile from `automatic`.
    pub fn from_config(config: &HarvestConfig) -> Self {
        Self {
            tick: Duration::from_secs(config.scheduler.tick_interval_secs),
            sweep: Duration::from_secs(config.scheduler.sweep_interval_secs),
            reconcile: Duration::from_secs(config.automatic.reconcile_interval_secs),
        }
    }
}

/// Removes an endpoint from the running set when its task ends.
struct Running {
    set: Arc<Mutex<HashSet<String>>>,
    url: String,
}

impl Drop for Running {
    fn drop(&mut self) {
        self.set.lock().remove(&self.url);
    }
}

/// Drives endpoint workers from periodic ticks and wake-up requests.
pub struct Dispatcher {
    ctx: HarvestContext,
    registry: Arc<WorkerRegistry>,
    intervals: DispatchIntervals,
    running: Arc<Mutex<HashSet<String>>>,
    tasks: JoinSet<()>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("instance", &self.registry.instance())
            .field("intervals", &self.intervals)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Dispatcher whose endpoint workers register in `registry`.
    ///
    /// The same registry should be given to any sweep run in this process,
    /// so that dead local workers are recognized.
    pub fn new(
        ctx: HarvestContext,
        registry: Arc<WorkerRegistry>,
        intervals: DispatchIntervals,
    ) -> Self {
        Self {
            ctx,
            registry,
            intervals,
            running: Arc::new(Mutex::new(HashSet::new())),
            tasks: JoinSet::new(),
        }
    }

    /// Run until `shutdown` flips, then wait for endpoint tasks to finish their current run.
    pub async fn run(
        mut self,
        mut wake: mpsc::UnboundedReceiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(self.intervals.tick);
        let mut sweep = tokio::time::interval(self.intervals.sweep);
        let mut reconcile = tokio::time::interval(self.intervals.reconcile);
        for interval in [&mut tick, &mut sweep, &mut reconcile] {
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        info!(instance = self.registry.instance(), "Dispatcher started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => self.dispatch_due(&shutdown).await,
                Some(url) = wake.recv() => self.spawn_endpoint(url, &shutdown),
                _ = sweep.tick() => self.sweep().await,
                _ = reconcile.tick() => self.reconcile().await,
            }
        }

        info!(running = self.tasks.len(), "Dispatcher stopping");
        while self.tasks.join_next().await.is_some() {}
        let leaked = self.registry.live_count();
        if leaked > 0 {
            warn!(leaked, "Worker tokens still registered after shutdown");
        }
        info!("Dispatcher stopped");
    }

    async fn dispatch_due(&mut self, shutdown: &watch::Receiver<bool>) {
        while self.tasks.try_join_next().is_some() {}

        match self.ctx.store.due_endpoints(self.ctx.clock.now()).await {
            Ok(urls) => {
                for url in urls {
                    self.spawn_endpoint(url, shutdown);
                }
            }
            Err(err) => error!(error = %err, "Failed to list endpoints with due work"),
        }
    }

    fn spawn_endpoint(&mut self, url: String, shutdown: &watch::Receiver<bool>) {
        if !self.running.lock().insert(url.clone()) {
            debug!(url, "Endpoint already running in this process");
            return;
        }
        let running = Running {
            set: Arc::clone(&self.running),
            url: url.clone(),
        };
        self.tasks.spawn(endpoint_loop(
            self.ctx.clone(),
            Arc::clone(&self.registry),
            url,
            self.intervals.tick,
            shutdown.clone(),
            running,
        ));
    }

    async fn sweep(&self) {
        match unlock_stuck_schedulers(&self.ctx, self.registry.as_ref()).await {
            Ok(0) => {}
            Ok(unlocked) => info!(unlocked, "Stuck schedulers released"),
            Err(err) => error!(error = %err, "Stuck scheduler sweep failed"),
        }
    }

    async fn reconcile(&self) {
        if let Err(err) = Reconciler::new(self.ctx.clone())
            .reconcile_for_next_month()
            .await
        {
            error!(error = %err, "Automatic reconciliation failed");
        }
    }
}

/// Keep running one endpoint until it has nothing left to do now.
async fn endpoint_loop(
    ctx: HarvestContext,
    registry: Arc<WorkerRegistry>,
    url: String,
    max_wait: Duration,
    mut shutdown: watch::Receiver<bool>,
    _running: Running,
) {
    let worker = registry.register();
    let scheduler = EndpointScheduler::new(ctx.clone(), url.as_str());

    loop {
        if *shutdown.borrow() {
            break;
        }
        match scheduler.run_next(worker.token()).await {
            Ok(outcome) if !outcome.should_rearm() => break,
            Ok(RunOutcome::Processed) => {}
            Ok(_) => {
                let wait = wait_for_endpoint(&ctx, &url, max_wait).await;
                tokio::select! {
                    () = tokio::time::sleep(wait) => {}
                    _ = shutdown.changed() => break,
                }
            }
            Err(err) => {
                warn!(url, worker_token = worker.token(), error = %err, "Endpoint run failed");
                break;
            }
        }
    }
    debug!(url, "Endpoint worker finished");
}

/// Time until the endpoint is ready, clamped to `[1s, max_wait]`.
async fn wait_for_endpoint(ctx: &HarvestContext, url: &str, max_wait: Duration) -> Duration {
    let floor = Duration::from_secs(1).min(max_wait);
    let until_ready = match ctx.store.scheduler(url).await {
        Ok(Some(scheduler)) => (scheduler.when_ready - ctx.clock.now())
            .to_std()
            .unwrap_or_default(),
        _ => max_wait,
    };
    until_ready.clamp(floor, max_wait)
}
