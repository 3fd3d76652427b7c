//! Completion handles for asynchronous operations
//!
//! An [`IoFuture`] is fulfilled exactly once, by the [`Completion`] paired
//! with it, and can be awaited by any number of clones.

use crate::error::{RemotingError, RemotingResult};
use futures::future::BoxFuture;
use std::future::IntoFuture;
use std::time::Duration;
use tokio::sync::watch;

type Slot<T> = Option<RemotingResult<T>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Waiting,
    Done,
    Failed,
}

/// Observable result of an operation still in flight
#[derive(Debug)]
pub struct IoFuture<T> {
    rx: watch::Receiver<Slot<T>>,
}

impl<T> Clone for IoFuture<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

/// Write side of an [`IoFuture`]. Dropping it unfulfilled fails the future.
#[derive(Debug)]
pub struct Completion<T> {
    tx: Option<watch::Sender<Slot<T>>>,
}

impl<T: Clone + Send + Sync + 'static> IoFuture<T> {
    pub fn pair() -> (Completion<T>, IoFuture<T>) {
        let (tx, rx) = watch::channel(None);
        (Completion { tx: Some(tx) }, IoFuture { rx })
    }

    /// A future that already holds `result`
    pub fn ready(result: RemotingResult<T>) -> IoFuture<T> {
        let (completion, future) = Self::pair();
        completion.complete(result);
        future
    }

    pub fn status(&self) -> Status {
        match &*self.rx.borrow() {
            None => Status::Waiting,
            Some(Ok(_)) => Status::Done,
            Some(Err(_)) => Status::Failed,
        }
    }

    /// The result, if already available
    pub fn try_get(&self) -> Option<RemotingResult<T>> {
        self.rx.borrow().clone()
    }

    /// Wait for the result
    pub async fn get(&self) -> RemotingResult<T> {
        let mut rx = self.rx.clone();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        result.unwrap_or_else(|| {
            Err(RemotingError::ConnectionClosed(
                "operation abandoned".to_string(),
            ))
        })
    }

    /// Wait for the result for at most `timeout`. A timeout leaves the
    /// operation running; only the wait is abandoned.
    pub async fn await_timeout(&self, timeout: Duration) -> RemotingResult<T> {
        tokio::time::timeout(timeout, self.get())
            .await
            .map_err(|_| RemotingError::Timeout)?
    }
}

impl<T: Clone + Send + Sync + 'static> IntoFuture for IoFuture<T> {
    type Output = RemotingResult<T>;
    type IntoFuture = BoxFuture<'static, RemotingResult<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.get().await })
    }
}

impl<T> Completion<T> {
    /// Fulfil the paired future. Only the first call has any effect, and
    /// this consumes the completion, so there is no second call.
    pub fn complete(mut self, result: RemotingResult<T>) {
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(result));
        }
    }

    /// Whether anyone still holds the paired future
    pub fn is_observed(&self) -> bool {
        self.tx
            .as_ref()
            .map(|tx| tx.receiver_count() > 0)
            .unwrap_or(false)
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(Err(RemotingError::ConnectionClosed(
                "operation abandoned".to_string(),
            ))));
        }
    }
}
