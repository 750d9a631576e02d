//! # Filter pipeline (§4.10)
//!
//! Three phases: pre-execute, post-execute, exception. Pre-filters may
//! short-circuit with [`PreOutcome::Skip`] or request [`PreOutcome::Requeue`];
//! post-filters may replace the outcome; exception filters may mark an
//! exception handled and substitute an outcome. A `Properties` bag flows
//! across all phases for one invocation.

use std::collections::HashMap;
use std::time::Duration;

use crate::handler::{HandlerOutcome, TaskContext};

/// Free-form per-invocation state shared across pre/post/exception filters.
#[derive(Debug, Clone, Default)]
pub struct Properties(HashMap<String, serde_json::Value>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.0.insert(key.into(), value);
    }
}

/// What a pre-filter decided, beyond simply letting execution proceed.
#[derive(Debug)]
pub enum PreOutcome {
    /// Proceed to the handler.
    Continue,
    /// Short-circuit with a terminal outcome; the handler is never invoked.
    Skip(HandlerOutcome),
    /// Nack-and-requeue the delivery without producing any terminal state.
    Requeue { delay: Option<Duration> },
}

#[async_trait::async_trait]
pub trait PreFilter: Send + Sync {
    async fn before(&self, ctx: &TaskContext, properties: &mut Properties) -> PreOutcome;
}

#[async_trait::async_trait]
pub trait PostFilter: Send + Sync {
    /// May replace the handler's outcome (e.g. to redact a payload, or to
    /// swallow a captured exception and substitute a success).
    async fn after(
        &self,
        ctx: &TaskContext,
        properties: &mut Properties,
        outcome: HandlerOutcome,
    ) -> HandlerOutcome;
}

#[async_trait::async_trait]
pub trait ExceptionFilter: Send + Sync {
    /// Called only when `outcome` is [`HandlerOutcome::Failure`] or
    /// [`HandlerOutcome::SoftTimeLimitExceeded`]. May substitute a different
    /// outcome (e.g. marking the exception handled with a fallback result).
    async fn on_exception(
        &self,
        ctx: &TaskContext,
        properties: &mut Properties,
        outcome: HandlerOutcome,
    ) -> HandlerOutcome;
}

fn is_exception(outcome: &HandlerOutcome) -> bool {
    matches!(
        outcome,
        HandlerOutcome::Failure { .. } | HandlerOutcome::SoftTimeLimitExceeded
    )
}

/// Ordered set of filters for one registry-wide pipeline. Pre/post run in
/// registration order; exception filters run in *reverse* registration
/// order, so the outermost-registered exception filter wraps the innermost.
#[derive(Default)]
pub struct FilterPipeline {
    pre: Vec<Box<dyn PreFilter>>,
    post: Vec<Box<dyn PostFilter>>,
    exception: Vec<Box<dyn ExceptionFilter>>,
}

impl std::fmt::Debug for FilterPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterPipeline")
            .field("pre", &self.pre.len())
            .field("post", &self.post.len())
            .field("exception", &self.exception.len())
            .finish()
    }
}

impl FilterPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pre(&mut self, filter: Box<dyn PreFilter>) {
        self.pre.push(filter);
    }

    pub fn add_post(&mut self, filter: Box<dyn PostFilter>) {
        self.post.push(filter);
    }

    pub fn add_exception(&mut self, filter: Box<dyn ExceptionFilter>) {
        self.exception.push(filter);
    }

    /// Runs pre-filters in order; the first non-`Continue` short-circuits.
    pub async fn run_pre(&self, ctx: &TaskContext, properties: &mut Properties) -> PreOutcome {
        for filter in &self.pre {
            match filter.before(ctx, properties).await {
                PreOutcome::Continue => continue,
                other => return other,
            }
        }
        PreOutcome::Continue
    }

    /// Runs post-filters in order, then exception filters (if applicable)
    /// in reverse order, over the handler's outcome.
    pub async fn run_post(
        &self,
        ctx: &TaskContext,
        properties: &mut Properties,
        mut outcome: HandlerOutcome,
    ) -> HandlerOutcome {
        for filter in &self.post {
            outcome = filter.after(ctx, properties, outcome).await;
        }
        if is_exception(&outcome) {
            for filter in self.exception.iter().rev() {
                outcome = filter.on_exception(ctx, properties, outcome).await;
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    fn ctx() -> TaskContext {
        TaskContext {
            task_id: Uuid::now_v7(),
            task_name: "t".to_string(),
            retries: 0,
            correlation_id: None,
            tenant_id: None,
            cancellation: tokio_util::sync::CancellationToken::new(),
            soft_limit: tokio_util::sync::CancellationToken::new(),
        }
    }

    struct AlwaysSkip;
    #[async_trait::async_trait]
    impl PreFilter for AlwaysSkip {
        async fn before(&self, _ctx: &TaskContext, _properties: &mut Properties) -> PreOutcome {
            PreOutcome::Skip(HandlerOutcome::Success {
                bytes: b"skipped".to_vec(),
                content_type: "application/json".to_string(),
            })
        }
    }

    struct NeverReached(Arc<AtomicUsize>);
    #[async_trait::async_trait]
    impl PreFilter for NeverReached {
        async fn before(&self, _ctx: &TaskContext, _properties: &mut Properties) -> PreOutcome {
            self.0.fetch_add(1, Ordering::SeqCst);
            PreOutcome::Continue
        }
    }

    #[tokio::test]
    async fn pre_filter_skip_short_circuits_remaining_pre_filters() {
        let reached = Arc::new(AtomicUsize::new(0));
        let mut pipeline = FilterPipeline::new();
        pipeline.add_pre(Box::new(AlwaysSkip));
        pipeline.add_pre(Box::new(NeverReached(reached.clone())));

        let mut props = Properties::new();
        let outcome = pipeline.run_pre(&ctx(), &mut props).await;
        assert!(matches!(outcome, PreOutcome::Skip(_)));
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    struct MarkHandled;
    #[async_trait::async_trait]
    impl ExceptionFilter for MarkHandled {
        async fn on_exception(
            &self,
            _ctx: &TaskContext,
            _properties: &mut Properties,
            _outcome: HandlerOutcome,
        ) -> HandlerOutcome {
            HandlerOutcome::Success {
                bytes: b"recovered".to_vec(),
                content_type: "application/json".to_string(),
            }
        }
    }

    #[tokio::test]
    async fn exception_filter_only_runs_on_failure_outcomes() {
        let mut pipeline = FilterPipeline::new();
        pipeline.add_exception(Box::new(MarkHandled));

        let mut props = Properties::new();
        let success = HandlerOutcome::Success {
            bytes: vec![],
            content_type: "application/json".to_string(),
        };
        let unchanged = pipeline.run_post(&ctx(), &mut props, success).await;
        assert!(matches!(unchanged, HandlerOutcome::Success { .. }));

        let failure = HandlerOutcome::Failure {
            exception_type: "Boom".to_string(),
            message: "boom".to_string(),
            stack: None,
        };
        let recovered = pipeline.run_post(&ctx(), &mut props, failure).await;
        assert!(matches!(recovered, HandlerOutcome::Success { .. }));
    }
}
