//! The long-running dispatcher: periodic ticks, wake-ups and shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use common::{fixture, Backend, Fixture, DR, TR};
use usage_harvest::harvest::HarvestPlanner;
use usage_harvest::model::{HarvestId, Priority};
use usage_harvest::runtime::{DispatchIntervals, Dispatcher, WorkerRegistry};

async fn wait_until_finished(fx: &Fixture, harvest_id: HarvestId) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let intentions = fx.intentions(harvest_id).await;
            if intentions.iter().all(|i| i.is_processed()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("intentions were not processed in time");
}

#[tokio::test]
async fn test_tick_runs_due_endpoints() {
    for backend in Backend::ALL {
        let fx = fixture(backend).await;
        let harvest = fx
            .plan(vec![fx.january(1, TR), fx.january(3, DR)], Priority::Normal)
            .await;

        let (_wake_tx, wake_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let intervals = DispatchIntervals {
            tick: Duration::from_millis(50),
            sweep: Duration::from_secs(3600),
            reconcile: Duration::from_secs(3600),
        };
        let registry = WorkerRegistry::new();
        let dispatcher = Dispatcher::new(fx.ctx.clone(), Arc::clone(&registry), intervals);
        let handle = tokio::spawn(dispatcher.run(wake_rx, shutdown_rx));

        wait_until_finished(&fx, harvest.id).await;
        assert_eq!(fx.client.calls(), 2);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(registry.live_count(), 0, "workers retire on shutdown");
    }
}

#[tokio::test]
async fn test_wake_starts_endpoint_between_ticks() {
    for backend in Backend::ALL {
        let fx = fixture(backend).await;
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let intervals = DispatchIntervals {
            tick: Duration::from_secs(3600),
            sweep: Duration::from_secs(3600),
            reconcile: Duration::from_secs(3600),
        };
        let dispatcher = Dispatcher::new(fx.ctx.clone(), WorkerRegistry::new(), intervals);
        let handle = tokio::spawn(dispatcher.run(wake_rx, shutdown_rx));

        let planner = HarvestPlanner::new(fx.ctx.clone(), Arc::new(wake_tx));
        let harvest = planner
            .plan(vec![fx.january(2, TR)], None, Priority::Now, Some("admin"))
            .await
            .unwrap();

        wait_until_finished(&fx, harvest.id).await;
        assert_eq!(fx.client.calls(), 1);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
