// Storage for finished job results.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use proctor_common::redis;
use proctor_common::types::ExecutionResult;
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn put(&self, result: &ExecutionResult) -> Result<()>;
    async fn get(&self, job_id: &Uuid) -> Result<Option<ExecutionResult>>;
}

#[derive(Debug)]
struct MemoryInner {
    results: HashMap<Uuid, ExecutionResult>,
    order: VecDeque<Uuid>,
}

/// In-process store bounded by entry count; the oldest result is evicted
/// first.
#[derive(Debug)]
pub struct MemoryResultStore {
    capacity: usize,
    inner: Mutex<MemoryInner>,
}

impl MemoryResultStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(MemoryInner {
                results: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn put(&self, result: &ExecutionResult) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.results.insert(result.job_id, result.clone()).is_none() {
            inner.order.push_back(result.job_id);
        }
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.results.remove(&oldest);
            }
        }
        Ok(())
    }

    async fn get(&self, job_id: &Uuid) -> Result<Option<ExecutionResult>> {
        Ok(self.inner.lock().results.get(job_id).cloned())
    }
}

/// Results kept in Redis with a TTL
pub struct RedisResultStore {
    conn: ::redis::aio::ConnectionManager,
}

impl RedisResultStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = ::redis::Client::open(url)?;
        let conn = ::redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl ResultStore for RedisResultStore {
    async fn put(&self, result: &ExecutionResult) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::store_result(&mut conn, result).await?;
        Ok(())
    }

    async fn get(&self, job_id: &Uuid) -> Result<Option<ExecutionResult>> {
        let mut conn = self.conn.clone();
        Ok(redis::get_result(&mut conn, job_id).await?)
    }
}
