use std::{future::Future, sync::Arc, time::Duration};

use futures::{future::BoxFuture, pin_mut, prelude::*};
use thiserror::Error;
use tokio::sync::watch;

/// Session-scoped cancellation handle
///
/// Cloning shares the same signal. [`Cancellation::child`] creates a handle that is cancelled when either it or its
/// parent is, which lets a single reconcile tick be abandoned without tearing down the whole session.
#[derive(Clone)]
pub struct Cancellation {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
    parent: Option<Box<Cancellation>>,
}

#[derive(Error, Clone, Copy, PartialEq, Eq, Debug)]
pub enum Interrupted {
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),
}

impl Cancellation {
    pub fn new() -> Cancellation {
        let (tx, rx) = watch::channel(false);
        Cancellation {
            tx: Arc::new(tx),
            rx,
            parent: None,
        }
    }

    pub fn child(&self) -> Cancellation {
        let mut child = Cancellation::new();
        child.parent = Some(Box::new(self.clone()));
        child
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.parent.as_ref().map(|parent| parent.is_cancelled()).unwrap_or(false)
    }

    /// Resolves once this handle (or any ancestor) is cancelled
    pub fn cancelled(&self) -> BoxFuture<'_, ()> {
        async move {
            let mut rx = self.rx.clone();
            let own = async move {
                loop {
                    if *rx.borrow_and_update() {
                        return;
                    }
                    if rx.changed().await.is_err() {
                        future::pending::<()>().await;
                    }
                }
            };
            match &self.parent {
                Some(parent) => {
                    pin_mut!(own);
                    let parent = parent.cancelled();
                    future::select(own, parent).await;
                }
                None => own.await,
            }
        }
        .boxed()
    }

    /// Runs `fut` until it completes or this handle is cancelled
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        if self.is_cancelled() {
            return Err(Interrupted::Cancelled);
        }
        pin_mut!(fut);
        match future::select(fut, self.cancelled()).await {
            future::Either::Left((output, _)) => Ok(output),
            future::Either::Right(((), _)) => Err(Interrupted::Cancelled),
        }
    }

    /// Runs `fut` until it completes, this handle is cancelled, or `deadline` elapses
    pub async fn run_with_deadline<F: Future>(&self, deadline: Duration, fut: F) -> Result<F::Output, Interrupted> {
        match tokio::time::timeout(deadline, self.run(fut)).await {
            Ok(result) => result,
            Err(_) => Err(Interrupted::TimedOut(deadline)),
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Cancellation::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn child_observes_parent() {
        let parent = Cancellation::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
        child.cancelled().await;
    }

    #[tokio::test]
    async fn parent_ignores_child() {
        let parent = Cancellation::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn run_interrupts_pending_future() {
        let cancel = Cancellation::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let result = cancel.run(future::pending::<()>()).await;
        assert_eq!(result, Err(Interrupted::Cancelled));
    }

    #[tokio::test]
    async fn deadline_elapses() {
        let cancel = Cancellation::new();
        let result = cancel
            .run_with_deadline(Duration::from_millis(5), future::pending::<()>())
            .await;
        assert_eq!(result, Err(Interrupted::TimedOut(Duration::from_millis(5))));
    }
}
