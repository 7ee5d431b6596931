//! In-process dispatcher backed by the tokio runtime.
//!
//! Stands in for a durable shared queue. If the process dies, queued items
//! and armed timers die with it; the startup re-arm pass and the periodic
//! sweeps recover whatever was lost.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{DroverError, Result};

use super::{WorkDispatcher, WorkHandler, WorkItem};

/// Unbounded intake queue feeding a bounded handler pool.
pub struct TokioDispatcher {
    tx: mpsc::UnboundedSender<WorkItem>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<WorkItem>>>,
    /// Armed delay timers by item key; inserting aborts the previous timer
    timers: Arc<DashMap<String, JoinHandle<()>>>,
    limit: Arc<Semaphore>,
    running: Arc<AtomicBool>,
}

impl TokioDispatcher {
    pub fn new(workers: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: Mutex::new(Some(rx)),
            timers: Arc::new(DashMap::new()),
            limit: Arc::new(Semaphore::new(workers.max(1))),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Number of delayed items currently armed.
    pub fn pending_delayed(&self) -> usize {
        self.timers.len()
    }

    /// Drive the dispatch loop until shutdown. Call at most once.
    pub async fn run(&self, handler: Arc<dyn WorkHandler>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Dispatcher already running");
            return;
        }
        let mut rx = match self.rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                warn!("Dispatcher receiver already consumed");
                return;
            }
        };
        info!(
            "Work dispatcher started with {} workers",
            self.limit.available_permits()
        );

        while self.running.load(Ordering::SeqCst) {
            let item = tokio::select! {
                received = rx.recv() => match received {
                    Some(item) => item,
                    None => break,
                },
                // Wake periodically so a shutdown with an idle queue is seen.
                _ = tokio::time::sleep(std::time::Duration::from_millis(250)) => continue,
            };

            let permit = match self.limit.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let key = item.key();
                if let Err(e) = handler.handle(item).await {
                    error!("Work item {} failed: {}", key, e);
                }
                drop(permit);
            });
        }
        info!("Work dispatcher stopped");
    }

    /// Stop the loop and drop every armed timer.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        for entry in self.timers.iter() {
            entry.value().abort();
        }
        self.timers.clear();
    }
}

impl WorkDispatcher for TokioDispatcher {
    fn enqueue(&self, item: WorkItem) -> Result<()> {
        // An immediate enqueue supersedes any armed timer for the same key.
        if let Some((_, old)) = self.timers.remove(&item.key()) {
            old.abort();
        }
        self.tx
            .send(item)
            .map_err(|e| DroverError::Internal(format!("dispatch queue closed: {}", e)))
    }

    fn schedule(&self, item: WorkItem, fire_at: DateTime<Utc>) -> Result<()> {
        let key = item.key();
        let tx = self.tx.clone();
        let timers = self.timers.clone();
        let timer_key = key.clone();
        let handle = tokio::spawn(async move {
            // A fire_at in the past collapses to an immediate send.
            let delay = (fire_at - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(delay).await;
            timers.remove(&timer_key);
            if tx.send(item).is_err() {
                warn!("Dispatch queue closed; dropped {}", timer_key);
            }
        });
        if let Some(old) = self.timers.insert(key, handle) {
            old.abort();
        }
        Ok(())
    }
}
