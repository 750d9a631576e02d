//! # Time-limit enforcer (§4.11)
//!
//! Wraps a handler invocation with a soft and a hard timer, both started
//! together. On soft-limit expiry the handler's soft-limit channel is
//! cancelled so user code may clean up; on hard-limit expiry the handler's
//! cancellation channel is cancelled and a `TimedOut` outcome is
//! synthesized. External cancellation (already observed on `ctx.cancellation`
//! before either timer fires) always takes precedence over both.

use std::future::Future;
use std::time::Duration;

use crate::handler::{HandlerOutcome, TaskContext};

async fn sleep_or_pending(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// Races `handler_future` against the soft/hard limits and external
/// cancellation. Elapsed time is measured from the moment this function is
/// called, which the executor arranges to be the handler's start, not the
/// time of broker delivery.
pub async fn enforce<Fut>(
    ctx: &TaskContext,
    soft_time_limit: Option<Duration>,
    hard_time_limit: Option<Duration>,
    handler_future: Fut,
) -> HandlerOutcome
where
    Fut: Future<Output = HandlerOutcome> + Send,
{
    tokio::pin!(handler_future);
    let soft_sleep = sleep_or_pending(soft_time_limit);
    tokio::pin!(soft_sleep);
    let hard_sleep = sleep_or_pending(hard_time_limit);
    tokio::pin!(hard_sleep);

    let mut soft_fired = false;
    loop {
        tokio::select! {
            biased;

            _ = ctx.cancellation.cancelled() => {
                return HandlerOutcome::Cancelled;
            }
            outcome = &mut handler_future => {
                return outcome;
            }
            _ = &mut hard_sleep, if hard_time_limit.is_some() => {
                ctx.cancellation.cancel();
                return HandlerOutcome::TimedOut;
            }
            _ = &mut soft_sleep, if soft_time_limit.is_some() && !soft_fired => {
                soft_fired = true;
                ctx.soft_limit.cancel();
            }
        }
    }
}
