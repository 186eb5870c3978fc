//! Per-call context.
//!
//! A [`Context`] travels with every pool, client and server operation. It
//! carries an optional deadline, a cancellation token and a set of logging
//! tags. Derived contexts (`with_timeout`, `child`, `with_tag`) inherit the
//! parent's deadline and are cancelled when the parent is cancelled.
//!
//! Permanent fields added with [`Context::add_permanent_field`] are shared by
//! every clone of a context and are attached to all log spans built from it
//! (see [`crate::logger::span`]).

use core::{future::Future, time::Duration};
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context stopped a pending operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context cancelled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Clone, Debug, Default)]
pub struct Context {
    deadline: Option<Instant>,
    token: CancellationToken,
    tags: Arc<BTreeMap<String, String>>,
    fields: Arc<Mutex<Vec<(String, String)>>>,
}

impl Context {
    /// A context with no deadline, no tags and its own cancellation token.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derives a context that is cancelled with `self` but can also be
    /// cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            token: self.token.child_token(),
            tags: Arc::clone(&self.tags),
            fields: Arc::clone(&self.fields),
        }
    }

    /// Derives a child context whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derives a child context with the earlier of `deadline` and the current
    /// deadline.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut ctx = self.child();
        ctx.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        ctx
    }

    /// Derives a context with an extra tag. Tags are copied, not shared.
    pub fn with_tag(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut ctx = self.clone();
        Arc::make_mut(&mut ctx.tags).insert(key.into(), value.into());
        ctx
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Adds a field logged with every span built from this context or any of
    /// its clones.
    pub fn add_permanent_field(&self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.lock().push((key.into(), value.into()));
    }

    pub fn permanent_fields(&self) -> Vec<(String, String)> {
        self.fields.lock().clone()
    }

    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, saturating at zero.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Returns the reason the context is done, if it is.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Drives `fut` until it completes, the context is cancelled or the
    /// deadline passes, whichever happens first.
    ///
    /// Cancellation wins over a deadline that elapses at the same instant.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, ContextError> {
        if let Some(err) = self.err() {
            return Err(err);
        }

        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => core::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(ContextError::Cancelled),
            () = deadline => Err(ContextError::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn run_times_out_at_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        let res = ctx
            .run(tokio::time::sleep(Duration::from_secs(1)))
            .await;
        assert_eq!(res, Err(ContextError::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn run_returns_output_before_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_secs(1));
        let res = ctx.run(async { 7 }).await;
        assert_eq!(res, Ok(7));
    }

    #[tokio::test]
    async fn parent_cancellation_reaches_child() {
        let parent = Context::background();
        let child = parent.with_timeout(Duration::from_secs(30));

        parent.cancel();
        assert!(child.is_cancelled());
        assert_eq!(
            child.run(core::future::pending::<()>()).await,
            Err(ContextError::Cancelled)
        );
    }

    #[tokio::test]
    async fn child_cancellation_does_not_reach_parent() {
        let parent = Context::background();
        let child = parent.child();

        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn nested_timeout_keeps_earliest_deadline() {
        let outer = Context::background().with_timeout(Duration::from_millis(10));
        let inner = outer.with_timeout(Duration::from_secs(10));
        assert_eq!(inner.deadline(), outer.deadline());
    }

    #[test]
    fn tags_are_copied_but_fields_are_shared() {
        let base = Context::background();
        let tagged = base.with_tag("grpc.request.method", "Check");
        assert_eq!(tagged.tag("grpc.request.method"), Some("Check"));
        assert_eq!(base.tag("grpc.request.method"), None);

        tagged.add_permanent_field("tenant", "acme");
        assert_eq!(
            base.permanent_fields(),
            vec![("tenant".to_string(), "acme".to_string())]
        );
    }
}
