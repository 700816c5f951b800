//! Bounded translation worker pool.
//!
//! One pool serves every in-flight stream in the process. Workers only run
//! the pure translation step; ordering is preserved by the per-request
//! emitter, which awaits results in submission order. Submission uses a
//! short timeout so a saturated pool never head-of-line-blocks a scanner;
//! the caller translates inline instead.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};

use super::translate::{FrameMeta, TranslateInput, translate};

pub(crate) const DEFAULT_WORKERS: usize = 4;
pub(crate) const DEFAULT_QUEUE_DEPTH: usize = 256;
const SUBMIT_TIMEOUT: Duration = Duration::from_millis(50);

struct Job {
    meta: FrameMeta,
    input: TranslateInput,
    reply: oneshot::Sender<String>,
}

/// Shared translation pool. Construct once per process (the subsystem owns
/// it); tests build their own.
pub struct TranslatePool {
    tx: mpsc::Sender<Job>,
}

impl TranslatePool {
    pub fn new(workers: usize, queue_depth: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<Job>(queue_depth.max(1));
        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    let job = rx.lock().await.recv().await;
                    match job {
                        Some(job) => {
                            let frame = translate(&job.meta, job.input);
                            // Receiver dropped means the request was cancelled.
                            let _ = job.reply.send(frame);
                        }
                        None => break,
                    }
                }
            });
        }
        Arc::new(Self { tx })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(DEFAULT_WORKERS, DEFAULT_QUEUE_DEPTH)
    }

    /// Submits a job, falling back to inline translation when the pool is
    /// saturated past the submit timeout or shut down.
    pub(crate) async fn submit(&self, meta: &FrameMeta, input: TranslateInput) -> Pending {
        let (reply, rx) = oneshot::channel();
        let job = Job {
            meta: meta.clone(),
            input,
            reply,
        };
        match self.tx.send_timeout(job, SUBMIT_TIMEOUT).await {
            Ok(()) => Pending::Queued(rx),
            Err(err) => {
                let job = match err {
                    mpsc::error::SendTimeoutError::Timeout(job)
                    | mpsc::error::SendTimeoutError::Closed(job) => job,
                };
                Pending::Ready(translate(&job.meta, job.input))
            }
        }
    }
}

/// A frame that is either already rendered or still in a worker's hands.
pub(crate) enum Pending {
    Ready(String),
    Queued(oneshot::Receiver<String>),
}

impl Pending {
    /// Resolves the frame; `None` when the worker was torn down mid-job.
    pub(crate) async fn resolve(self) -> Option<String> {
        match self {
            Pending::Ready(frame) => Some(frame),
            Pending::Queued(rx) => rx.await.ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> FrameMeta {
        FrameMeta {
            id: "chatcmpl-pool".to_string(),
            created: 1,
            model: "m".to_string(),
        }
    }

    #[tokio::test]
    async fn pool_translates_submitted_jobs() {
        let pool = TranslatePool::new(2, 8);
        let pending = pool
            .submit(
                &meta(),
                TranslateInput::Text {
                    text: "x".to_string(),
                },
            )
            .await;
        let frame = pending.resolve().await.unwrap();
        assert!(frame.contains("\"content\":\"x\""));
    }

    #[tokio::test]
    async fn many_jobs_resolve_in_submission_order() {
        let pool = TranslatePool::new(4, 16);
        let mut pendings = Vec::new();
        for i in 0..32 {
            pendings.push(
                pool.submit(
                    &meta(),
                    TranslateInput::Text {
                        text: format!("t{i}"),
                    },
                )
                .await,
            );
        }
        for (i, pending) in pendings.into_iter().enumerate() {
            let frame = pending.resolve().await.unwrap();
            assert!(frame.contains(&format!("t{i}")));
        }
    }
}
