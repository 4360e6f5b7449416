//! What a user action sees: the step bindings, a place to store measured
//! values, and the promise machinery for concurrent acquisition.

use std::future::Future;
use std::sync::Arc;

use data_types::Value;
use observability_deps::tracing::warn;
use parking_lot::Mutex;
use scan_iter::{FeedbackPipes, Kwds};
use tokio::sync::Semaphore;

use crate::BoxError;

/// A value promised by a concurrently running task; the runner awaits it
/// before the step is emitted.
#[derive(Debug)]
pub struct Promise {
    handle: tokio::task::JoinHandle<Result<Value, BoxError>>,
}

impl std::future::Future for Promise {
    type Output = Result<Value, BoxError>;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        match std::pin::Pin::new(&mut self.handle).poll(cx) {
            std::task::Poll::Pending => std::task::Poll::Pending,
            std::task::Poll::Ready(Ok(r)) => std::task::Poll::Ready(r),
            std::task::Poll::Ready(Err(join)) => {
                std::task::Poll::Ready(Err(format!("promised task failed: {join}").into()))
            }
        }
    }
}

/// A stored step result: immediate or promised.
#[derive(Debug)]
pub enum Stored {
    /// Concrete value.
    Ready(Value),
    /// Awaited by the runner before emission.
    Pending(Promise),
}

/// Handed to user actions for one iteration body.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Iteration counter of the owning step.
    pub iteration: usize,
    /// Cartesian position of the owning step.
    pub pos: Vec<usize>,
    /// The bindings visible to this body.
    pub kwds: Kwds,
    stored: Arc<Mutex<Vec<(String, Stored)>>>,
    sem: Arc<Semaphore>,
    pipes: FeedbackPipes,
}

impl StepContext {
    pub(crate) fn new(
        iteration: usize,
        pos: Vec<usize>,
        kwds: Kwds,
        sem: Arc<Semaphore>,
        pipes: FeedbackPipes,
    ) -> Self {
        Self {
            iteration,
            pos,
            kwds,
            stored: Arc::new(Mutex::new(vec![])),
            sem,
            pipes,
        }
    }

    /// Store a measured value under a name; it is emitted with this step.
    pub fn store(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.stored
            .lock()
            .push((key.into(), Stored::Ready(value.into())));
    }

    /// Store a promised value; the runner awaits it before emission.
    pub fn store_promise(&self, key: impl Into<String>, promise: Promise) {
        self.stored
            .lock()
            .push((key.into(), Stored::Pending(promise)));
    }

    /// Schedule concurrent work, bounded by the scan-wide semaphore.
    /// Waits for a slot when too many promises are already in flight.
    pub async fn promise<F>(&self, fut: F) -> Promise
    where
        F: std::future::Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        let permit = Arc::clone(&self.sem)
            .acquire_owned()
            .await
            .expect("scan semaphore never closes");
        let handle = tokio::spawn(async move {
            let r = fut.await;
            drop(permit);
            r
        });
        Promise { handle }
    }

    /// Post optimizer feedback for a key group, using the step's bound
    /// values as the suggested coordinate.
    pub fn feedback(&self, keys: &[&str], observed: Value) {
        let suggested: Vec<Value> = keys
            .iter()
            .filter_map(|k| self.kwds.get(*k).cloned())
            .collect();
        if suggested.len() != keys.len() {
            warn!(?keys, "feedback keys not all bound at this step");
        }
        self.pipes.send(keys, suggested, observed);
    }

    pub(crate) fn take_stored(&self) -> Vec<(String, Stored)> {
        std::mem::take(&mut *self.stored.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> StepContext {
        StepContext::new(
            0,
            vec![0],
            Kwds::new(),
            Arc::new(Semaphore::new(4)),
            FeedbackPipes::new(),
        )
    }

    #[tokio::test]
    async fn stored_values_come_back_in_order() {
        let c = ctx();
        c.store("a", 1i64);
        c.store("b", 2i64);
        let stored = c.take_stored();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].0, "a");
        assert!(c.take_stored().is_empty());
    }

    #[tokio::test]
    async fn promises_resolve_through_the_semaphore() {
        let c = ctx();
        let p = c.promise(async { Ok(Value::Int(9)) }).await;
        assert_eq!(p.await.unwrap(), Value::Int(9));
    }

    #[tokio::test]
    async fn failed_promise_surfaces_the_error() {
        let c = ctx();
        let p = c.promise(async { Err("boom".into()) }).await;
        assert!(p.await.is_err());
    }
}
