//! The queue enforcing single ownership of the statistics engine.

use std::future::Future;
use std::time::Instant;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::metric;

use super::{ComputeEngine, ComputeError};

type TaskFn<E> =
    Box<dyn for<'a> FnOnce(&'a mut E) -> BoxFuture<'a, Result<Value, ComputeError>> + Send>;

struct ComputeTask<E> {
    work: TaskFn<E>,
    outcome: oneshot::Sender<Result<Value, ComputeError>>,
}

/// A strictly serial FIFO task queue owning the compute engine.
///
/// The engine is moved into a driver task at construction, making the driver
/// its single owner for the queue's lifetime. Tasks receive the engine by
/// mutable reference, so exclusive access is enforced by the borrow rather
/// than by convention. The driver awaits each task to full completion before
/// taking the next, in submission order, and a task's failure never stops
/// the queue.
///
/// Cloning is cheap; clones feed the same driver. The driver shuts down once
/// every clone of the queue has been dropped and the backlog has drained.
pub struct SerialComputeQueue<E> {
    tasks: mpsc::UnboundedSender<ComputeTask<E>>,
}

impl<E> Clone for SerialComputeQueue<E> {
    fn clone(&self) -> Self {
        Self {
            tasks: self.tasks.clone(),
        }
    }
}

impl<E: ComputeEngine> SerialComputeQueue<E> {
    pub fn new(engine: E) -> Self {
        let (tasks, backlog) = mpsc::unbounded_channel();
        tokio::spawn(drive(engine, backlog));
        Self { tasks }
    }

    /// Submits a task for exclusive access to the engine.
    ///
    /// Enqueueing happens synchronously, so of two consecutive `submit`
    /// calls the first is guaranteed to run first. The returned future
    /// resolves once the task has run; dropping it does not cancel the
    /// task, since its effects on engine state must still happen in order.
    pub fn submit<F>(&self, work: F) -> impl Future<Output = Result<Value, ComputeError>>
    where
        F: for<'a> FnOnce(&'a mut E) -> BoxFuture<'a, Result<Value, ComputeError>>
            + Send
            + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task = ComputeTask {
            work: Box::new(work),
            outcome: tx,
        };

        metric!(counter("compute.queue.submitted") += 1);
        let queued = self.tasks.send(task);

        async move {
            if queued.is_err() {
                return Err(ComputeError::QueueStopped);
            }
            match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(ComputeError::QueueStopped),
            }
        }
    }

    /// Runs one script through the queue.
    pub fn run_script(
        &self,
        source: String,
        input: Value,
    ) -> impl Future<Output = Result<Value, ComputeError>> {
        self.submit(move |engine| {
            Box::pin(async move { engine.run_script(&source, input).await })
        })
    }
}

/// Runs tasks one at a time for as long as the queue is alive.
async fn drive<E>(mut engine: E, mut backlog: mpsc::UnboundedReceiver<ComputeTask<E>>) {
    while let Some(task) = backlog.recv().await {
        let start = Instant::now();
        let result = (task.work)(&mut engine).await;

        let status = match result {
            Ok(_) => "ok",
            Err(ref e) => {
                // The next task runs regardless; one submission's failure
                // must not starve unrelated ones.
                let error: &dyn std::error::Error = e;
                tracing::warn!(error, "compute task failed");
                metric!(counter("compute.task.failed") += 1);
                "err"
            }
        };
        metric!(
            timer("compute.task.duration") = start.elapsed(),
            "status" => status,
        );

        // The submitter may have lost interest; the engine state change
        // already happened either way.
        task.outcome.send(result).ok();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    /// A fake interpreter that trips if it is ever entered concurrently.
    #[derive(Default)]
    struct FakeEngine {
        busy: Arc<AtomicBool>,
        overlapped: Arc<AtomicBool>,
    }

    impl ComputeEngine for FakeEngine {
        fn run_script(
            &mut self,
            source: &str,
            input: Value,
        ) -> BoxFuture<'_, Result<Value, ComputeError>> {
            let source = source.to_owned();
            Box::pin(async move {
                if self.busy.swap(true, Ordering::SeqCst) {
                    self.overlapped.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                self.busy.store(false, Ordering::SeqCst);

                if source.contains("raise") {
                    Err(ComputeError::Script("RuntimeError: raised".into()))
                } else {
                    Ok(json!({ "script": source, "input": input }))
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tasks_run_in_submission_order() {
        let queue = SerialComputeQueue::new(FakeEngine::default());

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for name in ["alpha", "beta", "gamma"] {
            let order = order.clone();
            handles.push(queue.submit(move |_engine| {
                Box::pin(async move {
                    order.lock().unwrap().push(format!("{name} start"));
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    order.lock().unwrap().push(format!("{name} end"));
                    Ok(Value::Null)
                })
            }));
        }

        futures::future::join_all(handles)
            .await
            .into_iter()
            .for_each(|r| {
                r.unwrap();
            });

        // Every task settles fully before the next one begins.
        assert_eq!(
            *order.lock().unwrap(),
            vec![
                "alpha start",
                "alpha end",
                "beta start",
                "beta end",
                "gamma start",
                "gamma end"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_never_entered_concurrently() {
        let engine = FakeEngine::default();
        let overlapped = engine.overlapped.clone();
        let queue = SerialComputeQueue::new(engine);

        let handles: Vec<_> = (0..10)
            .map(|i| queue.run_script(format!("compute({i})"), Value::Null))
            .collect();
        futures::future::join_all(handles)
            .await
            .into_iter()
            .for_each(|r| {
                r.unwrap();
            });

        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_does_not_stop_the_queue() {
        let queue = SerialComputeQueue::new(FakeEngine::default());

        let failing = queue.run_script("raise".into(), Value::Null);
        let ok = queue.submit(|_engine| Box::pin(async { Ok(json!("ok")) }));

        let (failed, succeeded) = tokio::join!(failing, ok);
        assert_eq!(
            failed.unwrap_err(),
            ComputeError::Script("RuntimeError: raised".into())
        );
        assert_eq!(succeeded.unwrap(), json!("ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_script_passes_input_through() {
        let queue = SerialComputeQueue::new(FakeEngine::default());

        let result = queue
            .run_script("alpha_beta()".into(), json!({ "returns": [0.1, -0.2] }))
            .await
            .unwrap();

        assert_eq!(result["script"], json!("alpha_beta()"));
        assert_eq!(result["input"], json!({ "returns": [0.1, -0.2] }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_submitter_still_runs_the_task() {
        let queue = SerialComputeQueue::new(FakeEngine::default());
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        drop(queue.submit(move |_engine| {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            })
        }));

        // The task's effects on engine state must happen even with nobody
        // waiting for the result. Run another task to fence on the first.
        queue
            .submit(|_engine| Box::pin(async { Ok(Value::Null) }))
            .await
            .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_queue_rejects_submissions() {
        let queue = SerialComputeQueue::new(FakeEngine::default());

        // A panicking task kills the driver; that is the one fault the
        // queue does not isolate.
        let poisoned = queue.submit(|_engine| Box::pin(async { panic!("interpreter crashed") }));
        assert_eq!(poisoned.await.unwrap_err(), ComputeError::QueueStopped);

        let result = queue
            .submit(|_engine| Box::pin(async { Ok(Value::Null) }))
            .await;
        assert_eq!(result.unwrap_err(), ComputeError::QueueStopped);
    }
}
