//! 测试替身：来源客户端与动作执行器

use crate::reconcile::error::ExternalError;
use crate::reconcile::traits::{ActionExecutor, ActionOutcome, Candidate, ExternalRecord, SourceClient};
use crate::storage::entity::return_record;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

pub fn external(receipt_id: &str, status: &str) -> ExternalRecord {
    ExternalRecord {
        external_receipt_id: receipt_id.to_string(),
        external_order_id: format!("O-{}", receipt_id),
        product_name: "Case A".to_string(),
        receiver_name: "Kim".to_string(),
        receiver_phone: "010-5555-1234".to_string(),
        source_status: status.to_string(),
        source_created_at: Some(Utc::now() - ChronoDuration::minutes(10)),
        source_updated_at: None,
    }
}

pub fn kim_candidate(handle: &str) -> Candidate {
    Candidate {
        handle: handle.to_string(),
        receiver_name: "Kim".to_string(),
        receiver_phone_suffix: "1234".to_string(),
        product_name: "Case A".to_string(),
    }
}

/// 可阻塞的闸门：hold 之后调用方会挂起，直到 release
#[derive(Default)]
struct Gate {
    blocker: Mutex<Option<Arc<Semaphore>>>,
}

impl Gate {
    fn hold(&self) {
        *self.blocker.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    fn release(&self) {
        if let Some(s) = self.blocker.lock().unwrap().take() {
            s.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    async fn pass(&self) {
        let blocker = self.blocker.lock().unwrap().clone();
        if let Some(s) = blocker {
            let _ = s.acquire().await;
        }
    }
}

#[derive(Default)]
pub struct FakeSource {
    records: Mutex<Vec<ExternalRecord>>,
    error: Mutex<Option<ExternalError>>,
    gate: Gate,
    pub calls: AtomicUsize,
}

impl FakeSource {
    pub fn new(records: Vec<ExternalRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            ..Default::default()
        }
    }

    pub fn set_records(&self, records: Vec<ExternalRecord>) {
        *self.records.lock().unwrap() = records;
        *self.error.lock().unwrap() = None;
    }

    pub fn fail_with(&self, err: ExternalError) {
        *self.error.lock().unwrap() = Some(err);
    }

    pub fn hold(&self) {
        self.gate.hold();
    }

    pub fn release(&self) {
        self.gate.release();
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceClient for FakeSource {
    async fn fetch(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<ExternalRecord>, ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.gate.pass().await;
        if let Some(e) = self.error.lock().unwrap().clone() {
            return Err(e);
        }
        Ok(self.records.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeExecutor {
    candidates: Mutex<Vec<Candidate>>,
    search_error: Mutex<Option<ExternalError>>,
    act_script: Mutex<VecDeque<Result<ActionOutcome, ExternalError>>>,
    act_delay: Mutex<Option<Duration>>,
    gate: Gate,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub searches: AtomicUsize,
    pub acts: Mutex<Vec<(String, String)>>,
}

impl FakeExecutor {
    pub fn with_candidates(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates: Mutex::new(candidates),
            ..Default::default()
        }
    }

    pub fn set_candidates(&self, candidates: Vec<Candidate>) {
        *self.candidates.lock().unwrap() = candidates;
    }

    pub fn fail_search(&self, err: Option<ExternalError>) {
        *self.search_error.lock().unwrap() = err;
    }

    /// 依次返回的 act 结果；用完后默认成功
    pub fn script_acts(&self, results: Vec<Result<ActionOutcome, ExternalError>>) {
        *self.act_script.lock().unwrap() = results.into();
    }

    pub fn set_act_delay(&self, delay: Duration) {
        *self.act_delay.lock().unwrap() = Some(delay);
    }

    pub fn hold(&self) {
        self.gate.hold();
    }

    pub fn release(&self) {
        self.gate.release();
    }

    pub fn act_count(&self) -> usize {
        self.acts.lock().unwrap().len()
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ActionExecutor for FakeExecutor {
    async fn search(&self, query: &str) -> Result<Vec<Candidate>, ExternalError> {
        self.enter();
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.gate.pass().await;
        let result = match self.search_error.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(self
                .candidates
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.product_name.contains(query) || query.contains(&c.product_name))
                .cloned()
                .collect()),
        };
        self.leave();
        result
    }

    async fn act(
        &self,
        handle: &str,
        record: &return_record::Model,
    ) -> Result<ActionOutcome, ExternalError> {
        self.enter();
        let delay = *self.act_delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        self.acts
            .lock()
            .unwrap()
            .push((handle.to_string(), record.external_receipt_id.clone()));
        let next = self.act_script.lock().unwrap().pop_front();
        self.leave();
        next.unwrap_or_else(|| Ok(ActionOutcome::ok()))
    }
}
