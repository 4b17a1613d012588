use crate::reconcile::error::ExternalError;
use crate::reconcile::traits::{ActionExecutor, ActionOutcome, Candidate};
use crate::storage::entity::return_record;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

/// 串行化的执行器。
///
/// 外部会话（浏览器/API 会话）不支持并发，所有调用都必须先拿到 `ExecutorSession`，
/// 持有期间其他调用方等待。每次调用都有超时，超时按可重试错误处理。
pub struct SerializedExecutor {
    inner: Arc<dyn ActionExecutor>,
    lock: Mutex<()>,
    call_timeout: Duration,
}

impl SerializedExecutor {
    pub fn new(inner: Arc<dyn ActionExecutor>, call_timeout: Duration) -> Self {
        Self {
            inner,
            lock: Mutex::new(()),
            call_timeout,
        }
    }

    pub async fn session(&self) -> ExecutorSession<'_> {
        ExecutorSession {
            exec: self,
            _guard: self.lock.lock().await,
        }
    }

    pub async fn open(&self) -> Result<(), ExternalError> {
        let _guard = self.lock.lock().await;
        bounded(self.call_timeout, self.inner.open()).await
    }

    pub async fn close(&self) -> Result<(), ExternalError> {
        let _guard = self.lock.lock().await;
        bounded(self.call_timeout, self.inner.close()).await
    }
}

pub struct ExecutorSession<'a> {
    exec: &'a SerializedExecutor,
    _guard: MutexGuard<'a, ()>,
}

impl ExecutorSession<'_> {
    pub async fn search(&self, query: &str) -> Result<Vec<Candidate>, ExternalError> {
        bounded(self.exec.call_timeout, self.exec.inner.search(query)).await
    }

    pub async fn act(
        &self,
        handle: &str,
        record: &return_record::Model,
    ) -> Result<ActionOutcome, ExternalError> {
        bounded(self.exec.call_timeout, self.exec.inner.act(handle, record)).await
    }
}

async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, ExternalError>
where
    F: Future<Output = Result<T, ExternalError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(ExternalError::Timeout(limit)),
    }
}
