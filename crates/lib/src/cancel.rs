//! Cooperative cancellation for a build invocation.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::Notify;

/// Returned when an operation was abandoned because its token was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// A cloneable cancellation signal. All clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
  inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
  cancelled: AtomicBool,
  notify: Notify,
}

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  /// Signal cancellation and wake every waiter.
  pub fn cancel(&self) {
    self.inner.cancelled.store(true, Ordering::SeqCst);
    self.inner.notify.notify_waiters();
  }

  pub fn is_cancelled(&self) -> bool {
    self.inner.cancelled.load(Ordering::SeqCst)
  }

  /// Resolves once the token is cancelled.
  pub async fn cancelled(&self) {
    let notified = self.inner.notify.notified();
    tokio::pin!(notified);
    // Register before checking the flag so a concurrent cancel() is not missed.
    notified.as_mut().enable();
    if self.is_cancelled() {
      return;
    }
    notified.await;
  }

  /// Run `fut` to completion unless the token is cancelled first.
  pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Cancelled> {
    if self.is_cancelled() {
      return Err(Cancelled);
    }
    tokio::select! {
      biased;
      _ = self.cancelled() => Err(Cancelled),
      out = fut => Ok(out),
    }
  }
}
