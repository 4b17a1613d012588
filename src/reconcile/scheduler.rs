use crate::reconcile::collector::Collector;
use crate::reconcile::error::EngineError;
use crate::reconcile::model::{CollectSummary, JobName, ProcessSummary, RunTrigger};
use crate::reconcile::processor::Processor;
use crate::reconcile::shutdown::{ShutdownHandle, ShutdownSignal};
use crate::storage::repository::ConfigRepository;
use chrono::{DateTime, TimeZone, Utc};
use log::{error, info, warn};
use rand::Rng;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// 读取配置失败时的重试间隔
const CONFIG_RETRY_INTERVAL: Duration = Duration::from_secs(60);
/// 任务停用时复查配置的最长间隔
const DISABLED_RECHECK_INTERVAL: Duration = Duration::from_secs(60);

/// 某个任务当前的运行状态快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRun {
    pub job_name: JobName,
    pub started_at: Option<DateTime<Utc>>,
    pub is_running: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub shutdown_timeout: Duration,
    /// 每次调度间隔额外加上 [0, tick_jitter] 的随机抖动
    pub tick_jitter: Duration,
}

#[derive(Default)]
struct JobSlot {
    running: AtomicBool,
    started_at: AtomicI64,
}

/// 单飞（single-flight）守卫，drop 时释放运行标记；任务被 abort 时同样会释放
struct RunGuard {
    inner: Arc<Inner>,
    job: JobName,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let slot = self.inner.slot(self.job);
        slot.started_at.store(0, Ordering::Release);
        slot.running.store(false, Ordering::Release);
    }
}

struct Inner {
    db: Arc<DatabaseConnection>,
    collector: Arc<Collector>,
    processor: Arc<Processor>,
    collect_slot: JobSlot,
    process_slot: JobSlot,
    shutdown: ShutdownHandle,
    settings: SchedulerSettings,
    runs: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn slot(&self, job: JobName) -> &JobSlot {
        match job {
            JobName::Collect => &self.collect_slot,
            JobName::Process => &self.process_slot,
        }
    }

    fn try_acquire(self: &Arc<Self>, job: JobName) -> Option<RunGuard> {
        let slot = self.slot(job);
        slot.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        slot.started_at
            .store(Utc::now().timestamp(), Ordering::Release);
        Some(RunGuard {
            inner: self.clone(),
            job,
        })
    }

    fn is_stopping(&self) -> bool {
        self.shutdown.signal().is_triggered()
    }

    /// 登记到 runs 中执行，stop() 会等待它结束；停止中则拒绝
    fn spawn_tracked<F>(&self, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut runs = self.runs.lock().unwrap_or_else(|p| p.into_inner());
        // 与 stop() 的检查在同一把锁下，保证 stop 之后不会再冒出新任务
        if self.is_stopping() {
            return false;
        }
        runs.retain(|h| !h.is_finished());
        runs.push(tokio::spawn(fut));
        true
    }

    fn spawn_run(self: &Arc<Self>, guard: RunGuard, trigger: RunTrigger) -> bool {
        let inner = self.clone();
        self.spawn_tracked(async move {
            inner.execute(guard, trigger).await;
        })
    }

    async fn execute(&self, guard: RunGuard, trigger: RunTrigger) {
        let signal = self.shutdown.signal();
        match guard.job {
            JobName::Collect => {
                if let Err(e) = self.collector.run(trigger, &signal).await {
                    error!("✗ 采集任务失败 ({}): {}", trigger.as_str(), e);
                }
            }
            JobName::Process => match self.processor.run(trigger, &signal).await {
                Ok(summary) => {
                    if let Some(reason) = summary.aborted {
                        error!("✗ 处理任务中止 ({}): {}", trigger.as_str(), reason);
                    }
                }
                Err(e) => error!("✗ 处理任务失败 ({}): {}", trigger.as_str(), e),
            },
        }
        drop(guard);
    }

    fn take_runs(&self) -> Vec<JoinHandle<()>> {
        let mut runs = self.runs.lock().unwrap_or_else(|p| p.into_inner());
        std::mem::take(&mut *runs)
    }
}

/// 定时调度采集与处理两个任务。
///
/// 每个任务一个 tick 循环，每次 tick 重新读取配置；同一任务同时最多运行一个实例，
/// 忙时跳过本次调度而不是排队。
pub struct Scheduler {
    inner: Arc<Inner>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        db: Arc<DatabaseConnection>,
        collector: Arc<Collector>,
        processor: Arc<Processor>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                collector,
                processor,
                collect_slot: JobSlot::default(),
                process_slot: JobSlot::default(),
                shutdown: ShutdownHandle::new(),
                settings,
                runs: Mutex::new(Vec::new()),
            }),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// 启动两个 tick 循环；重复调用无效
    pub fn start(&self) {
        let mut loops = self.loops.lock().unwrap_or_else(|p| p.into_inner());
        if !loops.is_empty() {
            warn!("调度器已在运行");
            return;
        }
        self.inner.shutdown.reset();
        for job in JobName::ALL {
            let inner = self.inner.clone();
            loops.push(tokio::spawn(tick_loop(inner, job)));
        }
        info!("✓ 调度器已启动");
    }

    /// 手动触发一次运行。任务正忙或正在停止时返回 false，否则异步执行并返回 true。
    /// 手动触发不受 enabled 开关约束。
    pub fn trigger(&self, job: JobName) -> bool {
        let Some(guard) = self.inner.try_acquire(job) else {
            info!("{} 任务正在运行，忽略手动触发", job);
            return false;
        };
        if !self.inner.spawn_run(guard, RunTrigger::Manual) {
            warn!("调度器正在停止，忽略手动触发 {}", job);
            return false;
        }
        info!("已触发 {} 任务", job);
        true
    }

    /// 采集指定窗口并等待结果，占用采集任务的单飞标记
    pub async fn collect_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<CollectSummary, EngineError> {
        self.run_inline(JobName::Collect, move |inner, signal| async move {
            inner.collector.collect_until(start, end, &signal).await
        })
        .await
    }

    /// 处理一批并等待结果，占用处理任务的单飞标记
    pub async fn process_now(&self) -> Result<ProcessSummary, EngineError> {
        self.run_inline(JobName::Process, |inner, signal| async move {
            inner.processor.run(RunTrigger::Manual, &signal).await
        })
        .await
    }

    /// 同步等待结果的运行同样登记到 runs，stop() 会等它结束或将其中止
    async fn run_inline<T, F, Fut>(&self, job: JobName, job_fn: F) -> Result<T, EngineError>
    where
        F: FnOnce(Arc<Inner>, ShutdownSignal) -> Fut,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
        T: Send + 'static,
    {
        if self.inner.is_stopping() {
            return Err(EngineError::Stopping);
        }
        let guard = self.inner.try_acquire(job).ok_or(EngineError::Busy(job))?;
        let fut = job_fn(self.inner.clone(), self.inner.shutdown.signal());
        let (tx, rx) = oneshot::channel();
        let accepted = self.inner.spawn_tracked(async move {
            let result = fut.await;
            drop(guard);
            let _ = tx.send(result);
        });
        if !accepted {
            return Err(EngineError::Stopping);
        }
        // 运行被强制中止时发送端随任务一起丢弃
        rx.await.unwrap_or(Err(EngineError::Stopping))
    }

    pub fn job_runs(&self) -> Vec<JobRun> {
        JobName::ALL
            .iter()
            .map(|&job| {
                let slot = self.inner.slot(job);
                let is_running = slot.running.load(Ordering::Acquire);
                let ts = slot.started_at.load(Ordering::Acquire);
                JobRun {
                    job_name: job,
                    started_at: if is_running && ts > 0 {
                        Utc.timestamp_opt(ts, 0).single()
                    } else {
                        None
                    },
                    is_running,
                }
            })
            .collect()
    }

    pub fn is_running(&self, job: JobName) -> bool {
        self.inner.slot(job).running.load(Ordering::Acquire)
    }

    /// 发出停止信号并等待进行中的运行结束；超过 shutdown_timeout 则强制中止。
    /// 返回是否干净停止。
    pub async fn stop(&self) -> bool {
        self.inner.shutdown.trigger();

        let mut handles = {
            let mut loops = self.loops.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *loops)
        };
        handles.extend(self.inner.take_runs());
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        let timeout = self.inner.settings.shutdown_timeout;
        match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
            Ok(_) => {
                info!("✓ 调度器已停止");
                true
            }
            Err(_) => {
                for a in aborts {
                    a.abort();
                }
                error!(
                    "✗ 停止超时 ({:?})，强制中止仍在运行的任务，可能残留 processing 记录",
                    timeout
                );
                false
            }
        }
    }
}

async fn tick_loop(inner: Arc<Inner>, job: JobName) {
    let mut signal = inner.shutdown.signal();
    loop {
        if signal.is_triggered() {
            break;
        }

        let (_, interval) = tick(&inner, job).await;
        let wait = interval + jitter(inner.settings.tick_jitter);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = signal.triggered() => break,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickOutcome {
    Spawned,
    Busy,
    Inactive,
    Stopping,
    ConfigUnavailable,
}

/// 一次调度：重新读取配置，按需启动运行，返回结果和距下次调度的间隔
async fn tick(inner: &Arc<Inner>, job: JobName) -> (TickOutcome, Duration) {
    let cfg = match ConfigRepository::load_or_init(&inner.db).await {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("✗ 读取配置失败，{} 调度延后: {}", job, e);
            return (TickOutcome::ConfigUnavailable, CONFIG_RETRY_INTERVAL);
        }
    };
    let interval = cfg.interval(job);
    if !cfg.job_active(job) {
        // 停用期间缩短复查间隔，重新启用后尽快生效
        return (TickOutcome::Inactive, interval.min(DISABLED_RECHECK_INTERVAL));
    }

    let outcome = match inner.try_acquire(job) {
        Some(guard) => {
            if inner.spawn_run(guard, RunTrigger::Scheduled) {
                TickOutcome::Spawned
            } else {
                TickOutcome::Stopping
            }
        }
        None => {
            info!("{} 任务仍在运行，跳过本次调度", job);
            TickOutcome::Busy
        }
    };
    (outcome, interval)
}

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::collector::CollectorSettings;
    use crate::reconcile::error::ExternalError;
    use crate::reconcile::executor::SerializedExecutor;
    use crate::reconcile::matcher::Matcher;
    use crate::reconcile::model::{ConfigPatch, EngineConfig};
    use crate::reconcile::testing::{external, kim_candidate, FakeExecutor, FakeSource};
    use crate::storage::memory_db;
    use crate::storage::repository::JobRunRepository;

    struct Harness {
        db: Arc<DatabaseConnection>,
        source: Arc<FakeSource>,
        executor: Arc<FakeExecutor>,
        scheduler: Arc<Scheduler>,
    }

    async fn harness(shutdown_timeout: Duration) -> Harness {
        let db = Arc::new(memory_db().await);
        let source = Arc::new(FakeSource::new(vec![external("R1", "RETURNS_UNCHECKED")]));
        let executor = Arc::new(FakeExecutor::with_candidates(vec![kim_candidate("pay-1")]));
        let collector = Arc::new(Collector::new(
            db.clone(),
            source.clone(),
            CollectorSettings {
                overlap: Duration::from_secs(60),
                initial_lookback: Duration::from_secs(3600),
                call_timeout: Duration::from_secs(5),
            },
        ));
        let processor = Arc::new(Processor::new(
            db.clone(),
            Arc::new(SerializedExecutor::new(
                executor.clone(),
                Duration::from_secs(5),
            )),
            Matcher::default(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            db.clone(),
            collector,
            processor,
            SchedulerSettings {
                shutdown_timeout,
                tick_jitter: Duration::ZERO,
            },
        ));
        Harness {
            db,
            source,
            executor,
            scheduler,
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn concurrent_trigger_runs_job_once() {
        let h = harness(Duration::from_secs(5)).await;
        h.source.hold();

        assert!(h.scheduler.trigger(JobName::Collect));
        assert!(!h.scheduler.trigger(JobName::Collect));
        wait_until(|| h.source.call_count() == 1).await;
        assert!(!h.scheduler.trigger(JobName::Collect));

        let runs = h.scheduler.job_runs();
        let collect = runs.iter().find(|r| r.job_name == JobName::Collect).unwrap();
        assert!(collect.is_running);
        assert!(collect.started_at.is_some());

        h.source.release();
        wait_until(|| !h.scheduler.is_running(JobName::Collect)).await;
        assert_eq!(h.source.call_count(), 1);

        // 运行结束后可以再次触发
        assert!(h.scheduler.trigger(JobName::Collect));
        wait_until(|| h.source.call_count() == 2).await;
        wait_until(|| !h.scheduler.is_running(JobName::Collect)).await;
    }

    #[tokio::test]
    async fn jobs_have_independent_guards() {
        let h = harness(Duration::from_secs(5)).await;
        h.source.hold();

        assert!(h.scheduler.trigger(JobName::Collect));
        assert!(h.scheduler.trigger(JobName::Process));
        wait_until(|| !h.scheduler.is_running(JobName::Process)).await;
        assert!(h.scheduler.is_running(JobName::Collect));

        h.source.release();
        wait_until(|| !h.scheduler.is_running(JobName::Collect)).await;
    }

    #[tokio::test]
    async fn guard_is_released_after_a_failed_run() {
        let h = harness(Duration::from_secs(5)).await;
        h.source
            .fail_with(ExternalError::Transient("connection reset".to_string()));

        assert!(h.scheduler.trigger(JobName::Collect));
        wait_until(|| h.source.call_count() == 1).await;
        wait_until(|| !h.scheduler.is_running(JobName::Collect)).await;

        assert!(h.scheduler.trigger(JobName::Collect));
        wait_until(|| h.source.call_count() == 2).await;
        wait_until(|| !h.scheduler.is_running(JobName::Collect)).await;
    }

    #[tokio::test]
    async fn busy_job_rejects_inline_runs() {
        let h = harness(Duration::from_secs(5)).await;
        h.source.hold();
        assert!(h.scheduler.trigger(JobName::Collect));
        wait_until(|| h.source.call_count() == 1).await;

        let now = Utc::now();
        let err = h
            .scheduler
            .collect_window(now - chrono::Duration::hours(1), now)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Busy(JobName::Collect)));

        h.source.release();
        wait_until(|| !h.scheduler.is_running(JobName::Collect)).await;
    }

    #[tokio::test]
    async fn scheduled_ticks_collect_then_process() {
        let h = harness(Duration::from_secs(5)).await;
        ConfigRepository::update(
            &h.db,
            &ConfigPatch {
                enabled: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        h.scheduler.start();
        let mut seen = false;
        for _ in 0..200 {
            let runs = JobRunRepository::recent(&h.db, 10).await.unwrap();
            let collected = runs
                .iter()
                .any(|r| r.job_name == "collect" && r.trigger == "scheduled" && r.success);
            let processed = runs.iter().any(|r| r.job_name == "process");
            if collected && processed {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen, "both jobs should run on the first tick");
        assert!(h.scheduler.stop().await);
    }

    #[tokio::test]
    async fn disabled_engine_only_sleeps() {
        let h = harness(Duration::from_secs(5)).await;
        h.scheduler.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.source.call_count(), 0);
        assert_eq!(h.executor.searches.load(Ordering::SeqCst), 0);

        assert!(h.scheduler.stop().await);
        // 停止后不再接受触发
        assert!(!h.scheduler.trigger(JobName::Collect));
    }

    #[tokio::test]
    async fn stop_times_out_on_a_hung_run() {
        let h = harness(Duration::from_millis(100)).await;
        h.source.hold();
        assert!(h.scheduler.trigger(JobName::Collect));
        wait_until(|| h.source.call_count() == 1).await;

        assert!(!h.scheduler.stop().await);
        // 被中止的运行同样释放单飞标记
        wait_until(|| !h.scheduler.is_running(JobName::Collect)).await;
    }

    async fn enable(db: &DatabaseConnection, patch: ConfigPatch) -> EngineConfig {
        ConfigRepository::update(
            db,
            &ConfigPatch {
                enabled: Some(true),
                ..patch
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn stop_waits_for_inline_collect() {
        let h = harness(Duration::from_secs(5)).await;
        h.source.hold();

        let now = Utc::now();
        let s = h.scheduler.clone();
        let inline = tokio::spawn(async move {
            s.collect_window(now - chrono::Duration::hours(1), now).await
        });
        wait_until(|| h.source.call_count() == 1).await;

        let s = h.scheduler.clone();
        let stopping = tokio::spawn(async move { s.stop().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stopping.is_finished());
        assert!(h.scheduler.is_running(JobName::Collect));

        h.source.release();
        assert!(stopping.await.unwrap());
        assert!(inline.await.unwrap().is_ok());
        assert!(!h.scheduler.is_running(JobName::Collect));

        // 停止后拒绝新的同步运行
        let err = h.scheduler.process_now().await.unwrap_err();
        assert!(matches!(err, EngineError::Stopping));
    }

    #[tokio::test]
    async fn stop_aborts_a_hung_inline_process() {
        let h = harness(Duration::from_millis(100)).await;
        let now = Utc::now();
        h.scheduler
            .collect_window(now - chrono::Duration::hours(1), now)
            .await
            .unwrap();
        h.executor.hold();

        let s = h.scheduler.clone();
        let inline = tokio::spawn(async move { s.process_now().await });
        wait_until(|| h.executor.searches.load(Ordering::SeqCst) == 1).await;

        assert!(!h.scheduler.stop().await);
        let err = inline.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::Stopping));
        wait_until(|| !h.scheduler.is_running(JobName::Process)).await;
        h.executor.release();
    }

    #[tokio::test]
    async fn tick_rereads_config_every_time() {
        let h = harness(Duration::from_secs(5)).await;

        // 默认停用：不运行，复查间隔被截短
        let (outcome, wait) = tick(&h.scheduler.inner, JobName::Collect).await;
        assert_eq!(outcome, TickOutcome::Inactive);
        assert_eq!(wait, DISABLED_RECHECK_INTERVAL);
        assert_eq!(h.source.call_count(), 0);

        enable(
            &h.db,
            ConfigPatch {
                fetch_interval: Some(Duration::from_secs(120)),
                ..Default::default()
            },
        )
        .await;
        let (outcome, wait) = tick(&h.scheduler.inner, JobName::Collect).await;
        assert_eq!(outcome, TickOutcome::Spawned);
        assert_eq!(wait, Duration::from_secs(120));
        wait_until(|| h.source.call_count() == 1).await;
        wait_until(|| !h.scheduler.is_running(JobName::Collect)).await;

        // 间隔与开关的修改在下一次调度生效
        enable(
            &h.db,
            ConfigPatch {
                fetch_interval: Some(Duration::from_secs(300)),
                fetch_enabled: Some(false),
                ..Default::default()
            },
        )
        .await;
        let (outcome, wait) = tick(&h.scheduler.inner, JobName::Collect).await;
        assert_eq!(outcome, TickOutcome::Inactive);
        assert_eq!(wait, DISABLED_RECHECK_INTERVAL);
        let (outcome, wait) = tick(&h.scheduler.inner, JobName::Process).await;
        assert_eq!(outcome, TickOutcome::Spawned);
        assert_eq!(wait, EngineConfig::default().process_interval);
        wait_until(|| !h.scheduler.is_running(JobName::Process)).await;
        assert_eq!(h.source.call_count(), 1);
    }

    #[tokio::test]
    async fn disabled_recheck_keeps_short_intervals() {
        let h = harness(Duration::from_secs(5)).await;
        ConfigRepository::update(
            &h.db,
            &ConfigPatch {
                process_interval: Some(Duration::from_secs(5)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let (outcome, wait) = tick(&h.scheduler.inner, JobName::Process).await;
        assert_eq!(outcome, TickOutcome::Inactive);
        assert_eq!(wait, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn tick_skips_while_previous_run_is_busy() {
        let h = harness(Duration::from_secs(5)).await;
        let cfg = enable(&h.db, ConfigPatch::default()).await;
        h.source.hold();

        let (outcome, _) = tick(&h.scheduler.inner, JobName::Collect).await;
        assert_eq!(outcome, TickOutcome::Spawned);
        wait_until(|| h.source.call_count() == 1).await;

        let (outcome, wait) = tick(&h.scheduler.inner, JobName::Collect).await;
        assert_eq!(outcome, TickOutcome::Busy);
        assert_eq!(wait, cfg.fetch_interval);
        assert_eq!(h.source.call_count(), 1);

        h.source.release();
        wait_until(|| !h.scheduler.is_running(JobName::Collect)).await;
        let (outcome, _) = tick(&h.scheduler.inner, JobName::Collect).await;
        assert_eq!(outcome, TickOutcome::Spawned);
        wait_until(|| h.source.call_count() == 2).await;
        wait_until(|| !h.scheduler.is_running(JobName::Collect)).await;

        // 停止后调度不再启动运行
        assert!(h.scheduler.stop().await);
        let (outcome, _) = tick(&h.scheduler.inner, JobName::Collect).await;
        assert_eq!(outcome, TickOutcome::Stopping);
        assert!(!h.scheduler.is_running(JobName::Collect));
    }
}
