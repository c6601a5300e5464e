//! Per-request usage records and the stores that persist them.
//!
//! The database store mirrors a batched writer: records go through an MPSC
//! channel into a task that issues multi-row INSERTs, flushing every 50 records
//! or every 2 seconds. Appending never blocks the request path.

use crate::core::error::{AppError, Result};
use crate::core::metrics::get_metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const CHANNEL_CAPACITY: usize = 1000;
const BATCH_SIZE: usize = 50;
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const INSERT_COLUMNS: usize = 15;

/// One row of usage accounting, written once per request or per stream.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub user_id: String,
    pub model_name: String,
    pub provider: String,
    pub instance_id: Option<String>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    pub cost: f64,
    pub response_time_ms: u64,
    pub status_code: u16,
    pub success: bool,
    pub streaming: bool,
    pub error_detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new(
        request_id: impl Into<String>,
        user_id: impl Into<String>,
        model_name: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            user_id: user_id.into(),
            model_name: model_name.into(),
            provider: provider.into(),
            instance_id: None,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            cost: 0.0,
            response_time_ms: 0,
            status_code: 200,
            success: true,
            streaming: false,
            error_detail: None,
            timestamp: Utc::now(),
        }
    }
}

/// Sink for usage records.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn append(&self, record: UsageRecord) -> Result<()>;
}

/// Append `record`, logging and counting any failure instead of returning it.
pub async fn append_best_effort(store: &dyn UsageStore, record: UsageRecord) {
    let request_id = record.request_id.clone();
    if let Err(e) = store.append(record).await {
        get_metrics().usage_records_dropped.inc();
        tracing::warn!(
            request_id = %request_id,
            error = %e,
            "Failed to persist usage record"
        );
    }
}

/// PostgreSQL-backed store with a background batch writer.
pub struct DatabaseUsageStore {
    // Option so shutdown can drop the sender and let the writer drain
    tx: Mutex<Option<mpsc::Sender<UsageRecord>>>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl DatabaseUsageStore {
    pub fn new(pool: PgPool) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(Self::writer_task(rx, pool, done_tx));
        tracing::info!("Usage logger initialized (batch_size={})", BATCH_SIZE);
        Self {
            tx: Mutex::new(Some(tx)),
            done_rx: Mutex::new(Some(done_rx)),
        }
    }

    async fn writer_task(
        mut rx: mpsc::Receiver<UsageRecord>,
        pool: PgPool,
        done_tx: oneshot::Sender<()>,
    ) {
        let mut buffer: Vec<UsageRecord> = Vec::with_capacity(BATCH_SIZE);
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(record) => {
                        buffer.push(record);
                        if buffer.len() >= BATCH_SIZE {
                            Self::flush(&pool, &mut buffer).await;
                        }
                    }
                    // Every sender is gone: drain and stop
                    None => {
                        Self::flush(&pool, &mut buffer).await;
                        break;
                    }
                },
                _ = interval.tick() => {
                    Self::flush(&pool, &mut buffer).await;
                }
            }
        }

        tracing::info!("Usage logger writer task stopped");
        let _ = done_tx.send(());
    }

    async fn flush(pool: &PgPool, buffer: &mut Vec<UsageRecord>) {
        if buffer.is_empty() {
            return;
        }

        let count = buffer.len();
        let sql = build_insert_sql(count);
        let mut query = sqlx::query(&sql);

        for record in buffer.drain(..) {
            query = query
                .bind(record.timestamp)
                .bind(record.request_id)
                .bind(record.user_id)
                .bind(record.model_name)
                .bind(record.provider)
                .bind(record.instance_id)
                .bind(record.input_tokens as i32)
                .bind(record.output_tokens as i32)
                .bind(record.total_tokens as i32)
                .bind(record.cost)
                .bind(record.response_time_ms as i64)
                .bind(record.status_code as i32)
                .bind(record.success)
                .bind(record.streaming)
                .bind(record.error_detail);
        }

        match query.execute(pool).await {
            Ok(_) => tracing::debug!("Flushed {} usage records", count),
            Err(e) => {
                get_metrics().usage_records_dropped.inc_by(count as u64);
                tracing::error!("Failed to flush usage records to database: {}", e);
            }
        }
    }

    /// Close the channel and wait (bounded) for the writer to drain.
    pub async fn shutdown(&self) {
        let sender = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let done_rx = self
            .done_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if sender.is_some() {
            drop(sender);
            if let Some(rx) = done_rx {
                let _ = tokio::time::timeout(Duration::from_secs(5), rx).await;
            }
            tracing::info!("Usage logger shut down");
        }
    }
}

#[async_trait]
impl UsageStore for DatabaseUsageStore {
    async fn append(&self, record: UsageRecord) -> Result<()> {
        let sender = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(sender) = sender else {
            return Err(AppError::Persistence("usage logger is shut down".into()));
        };
        sender
            .try_send(record)
            .map_err(|e| AppError::Persistence(format!("usage channel rejected record: {}", e)))
    }
}

fn build_insert_sql(rows: usize) -> String {
    let mut sql = String::from(
        "INSERT INTO usage_logs (\
         created_at, request_id, user_id, model_name, provider, instance_id, \
         input_tokens, output_tokens, total_tokens, cost, response_time_ms, \
         status_code, success, streaming, error_detail\
         ) VALUES ",
    );

    for i in 0..rows {
        if i > 0 {
            sql.push_str(", ");
        }
        let base = i * INSERT_COLUMNS + 1;
        let placeholders: Vec<String> = (base..base + INSERT_COLUMNS)
            .map(|n| format!("${}", n))
            .collect();
        sql.push('(');
        sql.push_str(&placeholders.join(", "));
        sql.push(')');
    }
    sql
}

/// Bounded in-memory store; the oldest record is evicted when full.
pub struct MemoryUsageStore {
    records: Mutex<VecDeque<UsageRecord>>,
    capacity: usize,
}

impl MemoryUsageStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryUsageStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn append(&self, record: UsageRecord) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
        Ok(())
    }
}
