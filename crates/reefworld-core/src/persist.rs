//! Debounced persistence — mutations mark a dirty flag, the flush task
//! coalesces marks and writes at most one snapshot per window. A failed
//! write is logged and the next mutation retries it; the in-memory state is
//! the source of truth for the request that triggered the save.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error};

#[derive(Clone)]
pub struct SaveHandle {
    tx: mpsc::UnboundedSender<()>,
    flushes: Arc<AtomicU64>,
}

impl SaveHandle {
    /// Mark the world dirty. Cheap; bursts coalesce into one write.
    pub fn mark_dirty(&self) {
        let _ = self.tx.send(());
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

pub struct FlushTask {
    rx: mpsc::UnboundedReceiver<()>,
    flushes: Arc<AtomicU64>,
    path: PathBuf,
    debounce: Duration,
}

pub fn saver(path: PathBuf, debounce: Duration) -> (SaveHandle, FlushTask) {
    let (tx, rx) = mpsc::unbounded_channel();
    let flushes = Arc::new(AtomicU64::new(0));
    (
        SaveHandle {
            tx,
            flushes: Arc::clone(&flushes),
        },
        FlushTask {
            rx,
            flushes,
            path,
            debounce,
        },
    )
}

impl FlushTask {
    /// Run until every `SaveHandle` is dropped. `snapshot` serializes the
    /// current aggregate and is called once per coalesced window; returning
    /// `None` skips the write.
    pub async fn run<F, Fut>(mut self, snapshot: F)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Option<String>>,
    {
        while self.rx.recv().await.is_some() {
            tokio::time::sleep(self.debounce).await;
            // Everything marked during the window rides on this write.
            while self.rx.try_recv().is_ok() {}

            let Some(doc) = snapshot().await else {
                continue;
            };
            let tmp = self.path.with_extension("json.tmp");
            let result = async {
                tokio::fs::write(&tmp, &doc).await?;
                tokio::fs::rename(&tmp, &self.path).await
            }
            .await;
            match result {
                Ok(()) => {
                    self.flushes.fetch_add(1, Ordering::Relaxed);
                    debug!("World state saved ({} bytes)", doc.len());
                }
                Err(e) => error!("Failed to save world state: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_snapshot(calls: Arc<AtomicU64>) -> impl Fn() -> std::future::Ready<Option<String>> {
        move || {
            calls.fetch_add(1, Ordering::Relaxed);
            std::future::ready(Some("{}".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_into_one_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world_state.json");
        let (handle, task) = saver(path.clone(), Duration::from_secs(5));

        let calls = Arc::new(AtomicU64::new(0));
        let worker = tokio::spawn(task.run(counting_snapshot(Arc::clone(&calls))));

        for _ in 0..10 {
            handle.mark_dirty();
        }
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(handle.flush_count(), 1);
        assert!(path.is_file());

        drop(handle);
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_mark_after_flush_schedules_another() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world_state.json");
        let (handle, task) = saver(path, Duration::from_secs(5));

        let calls = Arc::new(AtomicU64::new(0));
        let worker = tokio::spawn(task.run(counting_snapshot(Arc::clone(&calls))));

        handle.mark_dirty();
        tokio::time::sleep(Duration::from_secs(6)).await;
        handle.mark_dirty();
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(handle.flush_count(), 2);

        drop(handle);
        worker.await.unwrap();
    }
}
