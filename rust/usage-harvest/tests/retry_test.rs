//! Retry chains: backoff, limits, lineage accounting and duplicate collapsing.

mod common;

use chrono::Duration;

use common::{date, fixture, Backend, Reply, DR, TR, URL_A};
use usage_harvest::clock::Clock;
use usage_harvest::intention::{IntentionProcessor, ProcessOutcome};
use usage_harvest::model::{
    CredentialId, ErrorCode, HarvestStats, IntentionStatus, NewIntention, Outcome, Priority,
    RetryCounters,
};
use usage_harvest::scheduler::{EndpointScheduler, RunOutcome};
use usage_harvest::store::{Claim, Completion};
use usage_harvest::HarvestError;

#[tokio::test]
async fn test_service_busy_backoff_doubles_until_ceiling() {
    for backend in Backend::ALL {
        let fx = fixture(backend).await;
        let harvest = fx.plan(vec![fx.january(1, TR)], Priority::Normal).await;
        fx.client.always(Reply::Error("1010"));
        let scheduler = EndpointScheduler::new(fx.ctx.clone(), URL_A);

        let mut delays = Vec::new();
        for _ in 0..6 {
            let now = fx.clock.now();
            assert_eq!(scheduler.run_next("worker").await.unwrap(), RunOutcome::Processed);
            let ready = fx.when_ready(URL_A).await;
            delays.push(ready - now);
            fx.advance_to(ready);
        }

        let hours: Vec<i64> = delays.iter().map(Duration::num_hours).collect();
        assert_eq!(hours, vec![1, 2, 4, 8, 16, 32]);
        assert!(delays.windows(2).all(|pair| pair[1] >= pair[0]));

        // The sixth backoff exceeds the one-day ceiling: the lineage stops.
        let intentions = fx.intentions(harvest.id).await;
        assert_eq!(intentions.len(), 6);
        assert!(intentions.iter().all(|i| i.is_processed()));
        assert_eq!(intentions[5].retry.service_busy, 5);
        assert_eq!(scheduler.run_next("worker").await.unwrap(), RunOutcome::Idle);
        assert_eq!(fx.client.calls(), 6);
    }
}

#[tokio::test]
async fn test_transient_counters_are_independent() {
    for backend in Backend::ALL {
        let fx = fixture(backend).await;
        let t0 = fx.clock.now();
        let harvest = fx.plan(vec![fx.january(1, TR)], Priority::Normal).await;
        fx.client.push([Reply::Error("1000"), Reply::Error("1010")]);
        let scheduler = EndpointScheduler::new(fx.ctx.clone(), URL_A);

        assert_eq!(scheduler.run_next("worker").await.unwrap(), RunOutcome::Processed);
        assert_eq!(fx.when_ready(URL_A).await, t0 + Duration::hours(1));
        fx.advance_to(fx.when_ready(URL_A).await);

        let t1 = fx.clock.now();
        assert_eq!(scheduler.run_next("worker").await.unwrap(), RunOutcome::Processed);
        assert_eq!(fx.when_ready(URL_A).await, t1 + Duration::hours(1));

        let intentions = fx.intentions(harvest.id).await;
        assert_eq!(intentions.len(), 3);
        assert_eq!(
            intentions[2].retry,
            RetryCounters {
                data_not_ready: 0,
                service_not_available: 1,
                service_busy: 1,
            }
        );
    }
}

#[tokio::test]
async fn test_data_not_ready_gives_up_after_max_retries() {
    for backend in Backend::ALL {
        let fx = fixture(backend).await;
        let harvest = fx.plan(vec![fx.january(1, TR)], Priority::Normal).await;
        fx.client.always(Reply::Error("1011"));
        let scheduler = EndpointScheduler::new(fx.ctx.clone(), URL_A);

        for call in 1..=6 {
            let now = fx.clock.now();
            assert_eq!(scheduler.run_next("worker").await.unwrap(), RunOutcome::Processed);
            let intentions = fx.intentions(harvest.id).await;
            if call < 6 {
                assert_eq!(intentions.len(), call + 1);
                let successor = &intentions[call];
                assert_eq!(successor.not_before, now + Duration::days(1));
                fx.advance_to(successor.not_before);
            } else {
                assert_eq!(intentions.len(), 6, "sixth call must not spawn a successor");
            }
        }

        let intentions = fx.intentions(harvest.id).await;
        assert_eq!(intentions[5].retry.data_not_ready, 5);
        assert_eq!(intentions[5].error_code, Some(ErrorCode::new("1011")));
        assert_eq!(scheduler.run_next("worker").await.unwrap(), RunOutcome::Idle);

        // Data availability never throttles the endpoint beyond the cooldown.
        assert!(fx.when_ready(URL_A).await <= fx.clock.now() + Duration::seconds(5));
    }
}

#[tokio::test]
async fn test_no_data_stops_after_grace_window() {
    for backend in Backend::ALL {
        let fx = fixture(backend).await;
        let february =
            NewIntention::new(CredentialId(1), TR, date(2024, 2, 1), date(2024, 2, 29)).unwrap();
        let harvest = fx.plan(vec![february], Priority::Normal).await;
        fx.client.always(Reply::Error("3030"));
        let scheduler = EndpointScheduler::new(fx.ctx.clone(), URL_A);

        assert_eq!(scheduler.run_next("worker").await.unwrap(), RunOutcome::Processed);
        let intentions = fx.intentions(harvest.id).await;
        assert_eq!(intentions.len(), 2);
        assert_eq!(intentions[1].retry.data_not_ready, 1);

        // 45 days after 2024-02-29 is 2024-04-14; a retry a day later is too late.
        fx.advance_to(date(2024, 4, 14).and_hms_opt(0, 0, 0).unwrap().and_utc());
        assert_eq!(scheduler.run_next("worker").await.unwrap(), RunOutcome::Processed);
        assert_eq!(fx.intentions(harvest.id).await.len(), 2);
    }
}

#[tokio::test]
async fn test_no_data_for_old_period_is_not_retried() {
    for backend in Backend::ALL {
        let fx = fixture(backend).await;
        let old = NewIntention::new(CredentialId(1), DR, date(2023, 11, 1), date(2023, 11, 30))
            .unwrap();
        let harvest = fx.plan(vec![old], Priority::Normal).await;
        fx.client.push([Reply::Error("3030")]);

        let scheduler = EndpointScheduler::new(fx.ctx.clone(), URL_A);
        assert_eq!(scheduler.run_next("worker").await.unwrap(), RunOutcome::Processed);
        let intentions = fx.intentions(harvest.id).await;
        assert_eq!(intentions.len(), 1);
        assert_eq!(intentions[0].status, IntentionStatus::Error);
    }
}

#[tokio::test]
async fn test_lineage_counts_once_in_stats() {
    for backend in Backend::ALL {
        let fx = fixture(backend).await;
        let harvest = fx.plan(vec![fx.january(1, TR)], Priority::Normal).await;
        fx.client.push([Reply::Error("1011"), Reply::Error("1011"), Reply::Error("1011")]);
        let scheduler = EndpointScheduler::new(fx.ctx.clone(), URL_A);
        let planner = fx.planner();

        for _ in 0..4 {
            let stats = planner.stats(harvest.id).await.unwrap();
            assert_eq!(stats.total, 1);
            assert_eq!(stats.planned, 1);

            assert_eq!(scheduler.run_next("worker").await.unwrap(), RunOutcome::Processed);
            let next = fx
                .intentions(harvest.id)
                .await
                .into_iter()
                .filter(|i| !i.is_processed())
                .map(|i| i.not_before)
                .min();
            if let Some(next) = next {
                fx.advance_to(next);
            }
        }

        let intentions = fx.intentions(harvest.id).await;
        assert_eq!(intentions.len(), 4);
        let lineage = intentions[0].id;
        assert!(intentions.iter().all(|i| i.lineage() == lineage));

        let stats = planner.stats(harvest.id).await.unwrap();
        assert_eq!(
            stats,
            HarvestStats {
                total: 1,
                finished: 1,
                planned: 0,
                succeeded: 1,
                failed: 0,
                broken: 0,
                duplicate: 0,
            }
        );
    }
}

#[tokio::test]
async fn test_success_collapses_unclaimed_duplicates() {
    for backend in Backend::ALL {
        let fx = fixture(backend).await;
        let first = fx.plan(vec![fx.january(1, TR)], Priority::Normal).await;
        let second = fx.plan(vec![fx.january(1, TR)], Priority::Normal).await;
        let scheduler = EndpointScheduler::new(fx.ctx.clone(), URL_A);

        assert_eq!(scheduler.run_next("worker").await.unwrap(), RunOutcome::Processed);
        let original = &fx.intentions(first.id).await[0];
        let duplicate = &fx.intentions(second.id).await[0];
        assert_eq!(original.status, IntentionStatus::Success);
        assert_eq!(duplicate.status, IntentionStatus::Duplicate);
        assert_eq!(duplicate.duplicate_of, Some(original.id));
        assert!(duplicate.is_processed());

        fx.clock.advance(Duration::seconds(10));
        assert_eq!(scheduler.run_next("worker").await.unwrap(), RunOutcome::Idle);
        assert_eq!(fx.client.calls(), 1);

        let stats = fx.planner().stats(second.id).await.unwrap();
        assert_eq!(stats.duplicate, 1);
        assert_eq!(stats.finished, 1);
    }
}

#[tokio::test]
async fn test_claimed_duplicate_skips_its_request() {
    for backend in Backend::ALL {
        let fx = fixture(backend).await;
        let harvest = fx
            .plan(vec![fx.january(2, DR), fx.january(2, DR)], Priority::Normal)
            .await;
        let intentions = fx.intentions(harvest.id).await;
        let (held, other) = (&intentions[0], &intentions[1]);

        let Claim::Claimed(claimed) = fx
            .ctx
            .store
            .claim_next(URL_A, "stale-worker", fx.clock.now())
            .await
            .unwrap()
        else {
            panic!("expected a claim");
        };
        assert_eq!(claimed.id, held.id);

        let processor = IntentionProcessor::new(fx.ctx.clone());
        assert_eq!(
            processor.process(other).await.unwrap(),
            ProcessOutcome::Success { duplicates: 1 }
        );

        let pending = fx.ctx.store.intention(held.id).await.unwrap().unwrap();
        assert_eq!(pending.duplicate_of, Some(other.id));
        assert!(!pending.is_processed(), "claimed siblings are left to their worker");

        assert_eq!(
            processor.process(&claimed).await.unwrap(),
            ProcessOutcome::Duplicate
        );
        assert_eq!(fx.client.calls(), 1);
        let finished = fx.ctx.store.intention(held.id).await.unwrap().unwrap();
        assert_eq!(finished.status, IntentionStatus::Duplicate);
    }
}

#[tokio::test]
async fn test_failure_does_not_collapse_duplicates() {
    for backend in Backend::ALL {
        let fx = fixture(backend).await;
        let harvest = fx
            .plan(vec![fx.january(1, TR), fx.january(1, TR)], Priority::Normal)
            .await;
        fx.client.push([Reply::Error("2000")]);
        let scheduler = EndpointScheduler::new(fx.ctx.clone(), URL_A);

        assert_eq!(scheduler.run_next("worker").await.unwrap(), RunOutcome::Processed);
        fx.clock.advance(Duration::seconds(6));
        assert_eq!(scheduler.run_next("worker").await.unwrap(), RunOutcome::Processed);

        let intentions = fx.intentions(harvest.id).await;
        assert_eq!(intentions.len(), 2, "a final error spawns no retry");
        assert_eq!(intentions[0].status, IntentionStatus::Error);
        assert_eq!(intentions[1].status, IntentionStatus::Success);
        assert_eq!(intentions[1].duplicate_of, None);
        assert_eq!(fx.client.calls(), 2);
    }
}

#[tokio::test]
async fn test_processing_twice_is_a_no_op() {
    for backend in Backend::ALL {
        let fx = fixture(backend).await;
        let harvest = fx.plan(vec![fx.january(1, TR)], Priority::Normal).await;
        let intention = fx.intentions(harvest.id).await.remove(0);

        let processor = IntentionProcessor::new(fx.ctx.clone());
        assert!(matches!(
            processor.process(&intention).await.unwrap(),
            ProcessOutcome::Success { .. }
        ));
        assert_eq!(
            processor.process(&intention).await.unwrap(),
            ProcessOutcome::AlreadyProcessed
        );
        assert_eq!(fx.client.calls(), 1);
    }
}

#[tokio::test]
async fn test_failed_completion_leaves_intention_planned() {
    for backend in Backend::ALL {
        let fx = fixture(backend).await;
        let harvest = fx.plan(vec![fx.january(1, TR)], Priority::Normal).await;
        let intention = fx.intentions(harvest.id).await.remove(0);
        let ready_before = fx.when_ready(URL_A).await;
        let failure = Outcome {
            status: IntentionStatus::Error,
            error_code: Some(ErrorCode::new("1011")),
            attempt_id: None,
        };

        let mut completion = Completion::new(failure.clone());
        completion.throttle = Some((URL_A.to_string(), ready_before + Duration::hours(1)));
        completion.successor = Some(NewIntention {
            start_date: date(2024, 1, 31),
            end_date: date(2024, 1, 1),
            retry_id: Some(intention.id),
            ..fx.january(1, TR)
        });
        let err = fx
            .ctx
            .store
            .complete_intention(intention.id, completion, fx.clock.now())
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::InvalidDateRange { .. }));

        let mut completion = Completion::new(failure);
        completion.throttle = Some(("https://unknown.example".to_string(), fx.clock.now()));
        assert!(fx
            .ctx
            .store
            .complete_intention(intention.id, completion, fx.clock.now())
            .await
            .is_err());

        let intentions = fx.intentions(harvest.id).await;
        assert_eq!(intentions.len(), 1);
        assert!(!intentions[0].is_processed());
        assert_eq!(intentions[0].status, IntentionStatus::Planned);
        assert_eq!(intentions[0].retry_id, None);
        assert_eq!(fx.when_ready(URL_A).await, ready_before);

        let processor = IntentionProcessor::new(fx.ctx.clone());
        assert!(matches!(
            processor.process(&intentions[0]).await.unwrap(),
            ProcessOutcome::Success { .. }
        ));
    }
}
