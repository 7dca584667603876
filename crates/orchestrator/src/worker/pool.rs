use super::{SubrequestClient, Worker};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// A fixed set of [`Worker`]s shared by every request of a process.
///
/// Borrowing waits until a worker is free. Workers are handed back with [`WorkerPool::give`].
#[derive(Debug)]
pub struct WorkerPool {
    size: usize,
    tx: mpsc::Sender<Worker>,
    rx: Mutex<mpsc::Receiver<Worker>>,
}

impl WorkerPool {
    /// Creates a pool of `size` workers, all using `client`. A zero size is raised to one.
    pub fn new(client: Arc<dyn SubrequestClient>, size: usize) -> Self {
        let size = size.max(1);
        let (tx, rx) = mpsc::channel(size);
        for id in 0..size {
            // capacity is exactly `size`, this cannot fail
            let _ = tx.try_send(Worker::new(id, client.clone()));
        }
        Self { size, tx, rx: Mutex::new(rx) }
    }

    /// Number of workers of the pool.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Number of workers currently idle.
    pub fn available(&self) -> usize {
        self.size - self.tx.capacity()
    }

    /// Waits for an idle worker.
    ///
    /// Cancel safe: dropping the future before it resolves does not lose a worker.
    pub async fn borrow(&self) -> Option<Worker> {
        self.rx.lock().await.recv().await
    }

    /// Returns a borrowed worker to the pool.
    pub fn give(&self, worker: Worker) {
        let _ = self.tx.try_send(worker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{Subrequest, SubrequestStream, WorkerError};
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Debug)]
    struct NoopClient;

    #[async_trait]
    impl SubrequestClient for NoopClient {
        async fn open(&self, _request: Subrequest) -> Result<SubrequestStream, WorkerError> {
            Err(WorkerError::Transport("unused".into()))
        }
    }

    #[tokio::test]
    async fn borrow_and_give() {
        let pool = WorkerPool::new(Arc::new(NoopClient), 2);
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.available(), 2);

        let a = pool.borrow().await.unwrap();
        let b = pool.borrow().await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.available(), 0);

        // no worker left
        assert!(tokio::time::timeout(Duration::from_millis(20), pool.borrow()).await.is_err());

        pool.give(a);
        assert_eq!(pool.available(), 1);
        let c = pool.borrow().await.unwrap();
        assert_ne!(c.id(), b.id());
    }
}
