//! Periodic background sync
//!
//! [`spawn`] starts a task that calls [`Durable::sync`] on a fixed period
//! until its [`SyncHandle`] is shut down, then runs one final pass.
//!
//! A sync only makes the target's own data durable. It says nothing about
//! buffers owned by other layers: a server that flushes responses and relies
//! on the periodic sync for the data behind them is racing two independent
//! flushes, and ordering them is the caller's job. [`SyncHandle::wait_for_sync`]
//! lets a caller hold a response until a pass that started after its writes
//! has completed.

use crate::block::Block;
use crate::segment::SegmentStore;
use crate::storage::{Database, StorageEngine};
use crate::{Result, TallyError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Something that can be flushed to durable storage
pub trait Durable: Send + Sync + 'static {
    fn sync(&self) -> Result<()>;
}

impl<S: SegmentStore> Durable for Block<S> {
    fn sync(&self) -> Result<()> {
        Block::sync(self)
    }
}

impl Durable for Database {
    fn sync(&self) -> Result<()> {
        Database::sync(self)
    }
}

impl Durable for StorageEngine {
    fn sync(&self) -> Result<()> {
        self.sync_all()
    }
}

/// Outcome of the latest completed sync pass
#[derive(Debug, Clone, Default)]
pub struct SyncPass {
    /// Number of completed passes
    pub completed: u64,
    /// Error of the latest pass, if it failed
    pub error: Option<String>,
}

/// Handle to a running sync task
pub struct SyncHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
    waiter: SyncWaiter,
}

/// Cloneable way to wait for sync passes of a running task
#[derive(Clone)]
pub struct SyncWaiter {
    started: Arc<AtomicU64>,
    passes: watch::Receiver<SyncPass>,
}

/// Start syncing `target` every `period`
pub fn spawn<T: Durable>(target: Arc<T>, period: Duration) -> SyncHandle {
    let token = CancellationToken::new();
    let started = Arc::new(AtomicU64::new(0));
    let (tx, rx) = watch::channel(SyncPass::default());

    let task_token = token.clone();
    let task_started = started.clone();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let last = tokio::select! {
                _ = task_token.cancelled() => true,
                _ = ticker.tick() => false,
            };

            let completed = task_started.fetch_add(1, Ordering::SeqCst) + 1;
            let error = match run_pass(target.clone()).await {
                Ok(()) => None,
                Err(e) => {
                    warn!("Sync pass {} failed: {}", completed, e);
                    Some(e.to_string())
                }
            };
            tx.send_replace(SyncPass { completed, error });

            if last {
                break;
            }
        }

        debug!("Sync task stopped");
    });

    SyncHandle {
        token,
        task,
        waiter: SyncWaiter {
            started,
            passes: rx,
        },
    }
}

async fn run_pass<T: Durable>(target: Arc<T>) -> Result<()> {
    match tokio::task::spawn_blocking(move || target.sync()).await {
        Ok(result) => result,
        Err(e) => Err(TallyError::Internal(format!("sync task failed: {}", e))),
    }
}

impl SyncHandle {
    /// Token cancelling the task; a final pass still runs
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Waiter that can be shared with request handlers
    pub fn waiter(&self) -> SyncWaiter {
        self.waiter.clone()
    }

    /// Watch completed passes
    pub fn subscribe(&self) -> watch::Receiver<SyncPass> {
        self.waiter.passes.clone()
    }

    /// Wait until a pass that started after this call has completed
    pub async fn wait_for_sync(&self) -> Result<()> {
        self.waiter.wait_for_sync().await
    }

    /// Stop the task after one final pass
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!("Sync task ended abnormally: {}", e);
        }
    }
}

impl SyncWaiter {
    /// Wait until a pass that started after this call has completed.
    ///
    /// A pass already running when this is called may have missed writes
    /// made just before the call, so it does not count.
    pub async fn wait_for_sync(&self) -> Result<()> {
        let target = self.started.load(Ordering::SeqCst) + 1;
        let mut rx = self.passes.clone();

        loop {
            {
                let pass = rx.borrow_and_update();
                if pass.completed >= target {
                    return match &pass.error {
                        Some(e) => Err(TallyError::Storage(e.clone())),
                        None => Ok(()),
                    };
                }
            }

            rx.changed()
                .await
                .map_err(|_| TallyError::Internal("sync task stopped".into()))?;
        }
    }
}
