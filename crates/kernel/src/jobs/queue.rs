//! FIFO-per-kind job execution with independent concurrency limits,
//! cancellation at every await, and log streaming through the event bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::events::EventBus;

/// Queue depth per kind; overflow is a `busy` error to the submitter.
const QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Build,
    Deploy,
    CertRenew,
    Reindex,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::Build,
        JobKind::Deploy,
        JobKind::CertRenew,
        JobKind::Reindex,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Build => "build",
            JobKind::Deploy => "deploy",
            JobKind::CertRenew => "cert_renew",
            JobKind::Reindex => "reindex",
        }
    }

    /// Independent concurrency limit per kind.
    fn concurrency(&self) -> usize {
        match self {
            JobKind::Build => 1,
            JobKind::Deploy => 2,
            JobKind::CertRenew => 1,
            JobKind::Reindex => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: i64,
    pub kind: JobKind,
    pub label: String,
    pub status: JobStatus,
    /// 0–100.
    pub progress: u8,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Handed to a job body: identity, cancellation, progress, and the log
/// topic subscribers watch.
#[derive(Clone)]
pub struct JobContext {
    pub id: i64,
    pub cancel: CancellationToken,
    bus: Arc<EventBus>,
    records: Arc<DashMap<i64, JobRecord>>,
}

impl JobContext {
    pub fn log(&self, line: impl Into<String>) {
        let mut line = line.into();
        line.push('\n');
        self.bus.publish_job_log(self.id, Bytes::from(line));
    }

    pub fn set_progress(&self, progress: u8) {
        if let Some(mut record) = self.records.get_mut(&self.id) {
            record.progress = progress.min(100);
        }
    }
}

type JobBody = Box<dyn FnOnce(JobContext) -> BoxFuture<'static, Result<()>> + Send>;

struct QueuedJob {
    id: i64,
    body: JobBody,
}

pub struct JobQueue {
    bus: Arc<EventBus>,
    records: Arc<DashMap<i64, JobRecord>>,
    cancels: Arc<DashMap<i64, CancellationToken>>,
    senders: HashMap<JobKind, mpsc::Sender<QueuedJob>>,
    next_id: AtomicI64,
    shutdown: CancellationToken,
}

impl JobQueue {
    pub fn new(bus: Arc<EventBus>, shutdown: CancellationToken) -> Arc<JobQueue> {
        let records: Arc<DashMap<i64, JobRecord>> = Arc::new(DashMap::new());
        let cancels: Arc<DashMap<i64, CancellationToken>> = Arc::new(DashMap::new());
        let mut senders = HashMap::new();

        for kind in JobKind::ALL {
            let (tx, rx) = mpsc::channel::<QueuedJob>(QUEUE_CAPACITY);
            senders.insert(kind, tx);
            tokio::spawn(dispatcher(
                kind,
                rx,
                Arc::clone(&records),
                Arc::clone(&cancels),
                Arc::clone(&bus),
                shutdown.clone(),
            ));
        }

        Arc::new(JobQueue {
            bus,
            records,
            cancels,
            senders,
            next_id: AtomicI64::new(1),
            shutdown,
        })
    }

    /// Enqueue a job. FIFO within its kind; runs when a worker slot frees.
    pub fn submit<F>(&self, kind: JobKind, label: &str, body: F) -> Result<JobRecord>
    where
        F: FnOnce(JobContext) -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(Error::LockedDown("shutting down".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = JobRecord {
            id,
            kind,
            label: label.to_string(),
            status: JobStatus::Pending,
            progress: 0,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        self.records.insert(id, record.clone());
        self.cancels.insert(id, self.shutdown.child_token());

        let sender = self
            .senders
            .get(&kind)
            .expect("queue exists for every kind");
        match sender.try_send(QueuedJob {
            id,
            body: Box::new(body),
        }) {
            Ok(()) => {
                tracing::debug!(job_id = id, kind = kind.as_str(), label, "job enqueued");
                Ok(record)
            }
            Err(_) => {
                self.records.remove(&id);
                self.cancels.remove(&id);
                Err(Error::Busy)
            }
        }
    }

    pub fn get(&self, id: i64) -> Option<JobRecord> {
        self.records.get(&id).map(|r| r.clone())
    }

    pub fn list(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self.records.iter().map(|r| r.clone()).collect();
        jobs.sort_by_key(|j| std::cmp::Reverse(j.id));
        jobs
    }

    /// Fire a job's cancellation token. Running jobs observe it at their
    /// next await; pending jobs settle as `cancelled` when dequeued.
    pub fn cancel(&self, id: i64) -> Result<()> {
        match self.cancels.get(&id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(Error::NotFound(format!("job {id}"))),
        }
    }

    /// Shutdown drain: wait (bounded) for in-flight jobs, then cancel the
    /// rest.
    pub async fn drain(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let active = self
                .records
                .iter()
                .filter(|r| matches!(r.status, JobStatus::Pending | JobStatus::Running))
                .count();
            if active == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(active, "job drain grace elapsed; cancelling remainder");
                for entry in self.cancels.iter() {
                    entry.value().cancel();
                }
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }
}

async fn dispatcher(
    kind: JobKind,
    mut rx: mpsc::Receiver<QueuedJob>,
    records: Arc<DashMap<i64, JobRecord>>,
    cancels: Arc<DashMap<i64, CancellationToken>>,
    bus: Arc<EventBus>,
    shutdown: CancellationToken,
) {
    let limit = Arc::new(Semaphore::new(kind.concurrency()));
    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => return,
            job = rx.recv() => match job {
                Some(job) => job,
                None => return,
            },
        };

        // Acquiring before spawning preserves FIFO start order.
        let permit = tokio::select! {
            _ = shutdown.cancelled() => return,
            permit = Arc::clone(&limit).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let records = Arc::clone(&records);
        let cancels = Arc::clone(&cancels);
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            let _permit = permit;
            run_job(job, records, cancels, bus).await;
        });
    }
}

async fn run_job(
    job: QueuedJob,
    records: Arc<DashMap<i64, JobRecord>>,
    cancels: Arc<DashMap<i64, CancellationToken>>,
    bus: Arc<EventBus>,
) {
    let id = job.id;
    let cancel = cancels
        .get(&id)
        .map(|t| t.clone())
        .unwrap_or_default();

    let settle = |status: JobStatus, error: Option<String>| {
        if let Some(mut record) = records.get_mut(&id) {
            record.status = status;
            record.error = error;
            record.finished_at = Some(Utc::now());
            if status == JobStatus::Succeeded {
                record.progress = 100;
            }
        }
        cancels.remove(&id);
    };

    if cancel.is_cancelled() {
        settle(JobStatus::Cancelled, None);
        return;
    }

    if let Some(mut record) = records.get_mut(&id) {
        record.status = JobStatus::Running;
        record.started_at = Some(Utc::now());
    }

    let context = JobContext {
        id,
        cancel: cancel.clone(),
        bus: Arc::clone(&bus),
        records: Arc::clone(&records),
    };

    let body = (job.body)(context);
    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            tracing::info!(job_id = id, "job cancelled");
            settle(JobStatus::Cancelled, None);
            bus.drop_job_topic(id);
            return;
        }
        outcome = body => outcome,
    };

    match outcome {
        Ok(()) => {
            tracing::info!(job_id = id, "job succeeded");
            settle(JobStatus::Succeeded, None);
        }
        Err(err) => {
            // Task failure never crashes the process; it lands on the
            // record and the queue moves on.
            tracing::warn!(job_id = id, error = %err, "job failed");
            settle(JobStatus::Failed, Some(err.to_string()));
        }
    }
    bus.drop_job_topic(id);
}
