//! Shared fixtures for the integration tests.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use tempfile::NamedTempFile;

use usage_harvest::client::{FetchResponse, ReportClient};
use usage_harvest::clock::ManualClock;
use usage_harvest::harvest::HarvestPlanner;
use usage_harvest::model::{
    Credential, CredentialId, CredentialReport, FetchIntention, Harvest, HarvestId,
    NewIntention, OrganizationId, Priority, ReportType, ReportTypeId,
};
use usage_harvest::outbox::NullWake;
use usage_harvest::store::{InMemoryStore, SqliteStore};
use usage_harvest::{HarvestContext, HarvestError, Result};

pub const URL_A: &str = "https://sushi.provider-a.example.org/counter/r5";
pub const URL_B: &str = "https://sushi.provider-b.example.org/counter/r5";

pub const TR: ReportTypeId = ReportTypeId(1);
pub const DR: ReportTypeId = ReportTypeId(2);

/// Which store implementation a fixture runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Sqlite,
}

impl Backend {
    pub const ALL: [Backend; 2] = [Backend::Memory, Backend::Sqlite];
}

/// What the scripted provider answers to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Data,
    Error(&'static str),
    /// The client itself fails, without a provider answer.
    Fail,
}

/// Report client answering from a script and recording concurrency.
#[derive(Debug)]
pub struct ScriptedClient {
    script: Mutex<VecDeque<Reply>>,
    fallback: Mutex<Reply>,
    delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Reply::Data),
            delay: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Queue replies, consumed in order before the fallback is used.
    pub fn push(&self, replies: impl IntoIterator<Item = Reply>) {
        self.script.lock().extend(replies);
    }

    /// Reply used once the script is exhausted.
    pub fn always(&self, reply: Reply) {
        *self.fallback.lock() = reply;
    }

    /// Hold every request for `delay` of real time.
    pub fn slow(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self) -> Reply {
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().clone())
    }
}

#[async_trait]
impl ReportClient for ScriptedClient {
    async fn fetch(
        &self,
        credential: &Credential,
        report_type: &ReportType,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<FetchResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let reply = self.next_reply();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match reply {
            Reply::Data => Ok(FetchResponse::success(serde_json::json!({
                "Report_Header": { "Report_ID": report_type.code },
                "Report_Items": [],
                "credential": credential.id,
                "begin_date": start_date,
                "end_date": end_date,
            }))),
            Reply::Error(code) => Ok(FetchResponse::error(code)),
            Reply::Fail => Err(HarvestError::Other(anyhow::anyhow!(
                "connection reset by peer"
            ))),
        }
    }
}

/// A context wired to a manual clock and a scripted client.
pub struct Fixture {
    pub ctx: HarvestContext,
    pub clock: Arc<ManualClock>,
    pub client: Arc<ScriptedClient>,
    _db: Option<NamedTempFile>,
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

/// 2024-03-15 10:00:00 UTC
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap()
}

pub async fn fixture(backend: Backend) -> Fixture {
    let clock = Arc::new(ManualClock::new(start_time()));
    let client = Arc::new(ScriptedClient::new());
    let (ctx, db) = match backend {
        Backend::Memory => (
            HarvestContext::new(
                Arc::new(InMemoryStore::new()),
                client.clone(),
                clock.clone(),
            ),
            None,
        ),
        Backend::Sqlite => {
            let temp_file = NamedTempFile::new().unwrap();
            let store = SqliteStore::open(temp_file.path()).await.unwrap();
            (
                HarvestContext::new(Arc::new(store), client.clone(), clock.clone()),
                Some(temp_file),
            )
        }
    };

    let fixture = Fixture {
        ctx,
        clock,
        client,
        _db: db,
    };
    fixture.seed().await;
    fixture
}

impl Fixture {
    /// Two report types, credentials 1 and 2 on endpoint A, credential 3 on
    /// endpoint B. Every credential is mapped to both report types.
    async fn seed(&self) {
        let store = &self.ctx.store;
        store
            .put_report_type(ReportType {
                id: TR,
                code: "TR".to_string(),
            })
            .await
            .unwrap();
        store
            .put_report_type(ReportType {
                id: DR,
                code: "DR".to_string(),
            })
            .await
            .unwrap();

        for (id, organization, url) in [(1, 1, URL_A), (2, 1, URL_A), (3, 2, URL_B)] {
            self.put_credential(id, organization, url, true, false).await;
            for report_type_id in [TR, DR] {
                self.map(id, report_type_id, true, false).await;
            }
        }
    }

    pub async fn put_credential(
        &self,
        id: i64,
        organization: i64,
        url: &str,
        enabled: bool,
        broken: bool,
    ) {
        self.ctx
            .store
            .put_credential(Credential {
                id: CredentialId(id),
                organization_id: OrganizationId(organization),
                url: url.to_string(),
                enabled,
                broken,
                params: [("customer_id".to_string(), format!("cust-{id}"))]
                    .into_iter()
                    .collect(),
            })
            .await
            .unwrap();
    }

    pub async fn map(&self, credential: i64, report_type_id: ReportTypeId, enabled: bool, broken: bool) {
        self.ctx
            .store
            .put_credential_report(CredentialReport {
                credential_id: CredentialId(credential),
                report_type_id,
                enabled,
                broken,
            })
            .await
            .unwrap();
    }

    /// January 2024 for `credential` and `report_type_id`.
    pub fn january(&self, credential: i64, report_type_id: ReportTypeId) -> NewIntention {
        NewIntention::new(
            CredentialId(credential),
            report_type_id,
            date(2024, 1, 1),
            date(2024, 1, 31),
        )
        .unwrap()
    }

    pub fn planner(&self) -> HarvestPlanner {
        HarvestPlanner::new(self.ctx.clone(), Arc::new(NullWake))
    }

    pub async fn plan(&self, intentions: Vec<NewIntention>, priority: Priority) -> Harvest {
        self.planner()
            .plan(intentions, None, priority, Some("tester"))
            .await
            .unwrap()
    }

    /// Intentions of a harvest ordered by id.
    pub async fn intentions(&self, harvest_id: HarvestId) -> Vec<FetchIntention> {
        let mut intentions = self.ctx.store.harvest_intentions(harvest_id).await.unwrap();
        intentions.sort_by_key(|i| i.id);
        intentions
    }

    pub async fn when_ready(&self, url: &str) -> DateTime<Utc> {
        self.ctx
            .store
            .scheduler(url)
            .await
            .unwrap()
            .unwrap()
            .when_ready
    }

    /// Move the clock to `at` unless it is already later.
    pub fn advance_to(&self, at: DateTime<Utc>) {
        use usage_harvest::clock::Clock;
        if at > self.clock.now() {
            self.clock.set(at);
        }
    }
}
