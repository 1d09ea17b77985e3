//! Single-worker engine queue.
//!
//! The engine lives on one dedicated OS thread. Every operation is a boxed job
//! sent over a bounded channel and run to completion in arrival order; the
//! result comes back on a oneshot channel.
//!
//! A job that made it into the channel always runs. Dropping the caller's
//! future only discards the result.

use tokio::sync::{mpsc, oneshot};

use crate::error::ClientError;

type Job<E> = Box<dyn FnOnce(&mut E) + Send>;

/// Handle to the engine worker. Clones share the worker.
pub(crate) struct EngineQueue<E> {
    sender: mpsc::Sender<Job<E>>,
}

impl<E> Clone for EngineQueue<E> {
    fn clone(&self) -> Self {
        Self { sender: self.sender.clone() }
    }
}

impl<E: Send + 'static> EngineQueue<E> {
    /// Move `engine` onto a new worker thread.
    ///
    /// The worker stops once every handle has been dropped and the queue has
    /// drained.
    pub(crate) fn spawn(engine: E, capacity: usize, thread_name: &str) -> Result<Self, ClientError> {
        let (sender, mut receiver) = mpsc::channel::<Job<E>>(capacity);

        std::thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                let mut engine = engine;
                while let Some(job) = receiver.blocking_recv() {
                    job(&mut engine);
                }
                tracing::debug!("engine worker stopped");
            })
            .map_err(|e| ClientError::Worker(e.to_string()))?;

        tracing::debug!(thread = thread_name, capacity, "engine worker started");
        Ok(Self { sender })
    }

    /// Run `job` on the worker and wait for its result.
    ///
    /// # Errors
    ///
    /// `EngineUnavailable` if the worker has stopped or panicked.
    pub(crate) async fn run<T, F>(&self, job: F) -> Result<T, ClientError>
    where
        T: Send + 'static,
        F: FnOnce(&mut E) -> T + Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        let job: Job<E> = Box::new(move |engine| {
            // The caller may have stopped waiting.
            let _ = reply.send(job(engine));
        });

        self.sender.send(job).await.map_err(|_| ClientError::EngineUnavailable)?;
        result.await.map_err(|_| ClientError::EngineUnavailable)
    }
}
