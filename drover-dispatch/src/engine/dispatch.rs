//! The per-message dispatch pipeline
//!
//! route -> reserve -> rewrite -> send -> record. The engine is the sole
//! owner of retry classification: adapters only type their failures, the
//! store only applies the transitions it is told.

use std::{collections::HashSet, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use drover_common::{
    Message, SenderAddress, dispatch_log,
    tracing::{debug, error},
};
use drover_providers::SendError;
use drover_store::{DeferKind, DeferOutcome};

use crate::{
    engine::{DispatchEngine, EngineRuntime},
    router::RouteError,
};

/// Drive one claimed message to a terminal or deferred state
pub(crate) async fn dispatch_message(engine: &DispatchEngine, message: Message) {
    let Ok(runtime) = engine.runtime() else {
        return;
    };

    let Ok(sender) = SenderAddress::parse(&message.from) else {
        mark_failed(runtime, &message, "unroutable sender address").await;
        return;
    };
    let sender_key = sender.to_string();

    let mut exclude = HashSet::new();
    let mut failover_used: u32 = 0;
    let mut last_send_error: Option<SendError> = None;

    loop {
        let route = match runtime.router.route(&message, &exclude) {
            Ok(route) => route,
            Err(RouteError::InvalidSender(e)) => {
                mark_failed(runtime, &message, &format!("unroutable sender: {e}")).await;
                return;
            }
            Err(RouteError::NoEligibleProvider { rate_limited, .. }) => {
                // Failover ran out of candidates: the send failure decides
                // the deferral, not the routing shortage
                match last_send_error {
                    Some(SendError::RateLimited {
                        retry_after,
                        message: detail,
                    }) => {
                        let delay = retry_after.map_or_else(
                            || delay_until_reset(engine, runtime, None),
                            |hint| hint.max(Duration::from_secs(engine.min_defer_secs)),
                        );
                        defer(
                            runtime,
                            &message,
                            &format!("provider rate limited: {detail}"),
                            delay,
                            DeferKind::RateLimit,
                        )
                        .await;
                    }
                    Some(error) => {
                        let delay = engine.retry.backoff_delay(message.retry_count);
                        defer(
                            runtime,
                            &message,
                            &error.to_string(),
                            delay,
                            DeferKind::Retry,
                        )
                        .await;
                    }
                    None if rate_limited => {
                        let delay = delay_until_reset(engine, runtime, None);
                        defer(
                            runtime,
                            &message,
                            "no eligible provider: rate limited",
                            delay,
                            DeferKind::RateLimit,
                        )
                        .await;
                    }
                    None => {
                        mark_failed(runtime, &message, "no eligible provider").await;
                    }
                }
                return;
            }
            Err(RouteError::InvalidConfiguration(e)) => {
                // A reload may repair this; burn a retry rather than the message
                let delay = engine.retry.backoff_delay(message.retry_count);
                defer(
                    runtime,
                    &message,
                    &format!("routing configuration error: {e}"),
                    delay,
                    DeferKind::Retry,
                )
                .await;
                return;
            }
        };

        let provider_id = route.provider.id.clone();
        let decision = runtime.limiter.check_and_reserve(
            &route.provider.rate_limits,
            &provider_id,
            &sender_key,
        );

        if !decision.admitted {
            debug!(
                message_id = %message.id,
                provider = %provider_id,
                scope = ?decision.limiting_scope,
                "limiter denied admission, deferring"
            );
            let delay = delay_until_reset(engine, runtime, Some(decision.resets_at));
            defer(
                runtime,
                &message,
                &format!("rate limited at {:?} scope", decision.limiting_scope),
                delay,
                DeferKind::RateLimit,
            )
            .await;
            return;
        }

        let mut outbound = message.clone();
        outbound.assigned_provider_id = Some(provider_id.clone());
        route.registered.rewrite_headers(&mut outbound);

        let deadline = Duration::from_secs(engine.send_timeout_secs);
        let sent = match tokio::time::timeout(deadline, route.registered.client.send(&outbound))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(SendError::Transient(format!(
                "send deadline of {}s exceeded",
                engine.send_timeout_secs
            ))),
        };

        match sent {
            Ok(receipt) => {
                runtime.breaker.record_success(&provider_id);
                dispatch_log!(
                    level = INFO,
                    "message {} sent via {} as {} in {}ms",
                    message.id,
                    provider_id,
                    receipt.provider_message_id,
                    receipt.latency.as_millis()
                );
                if let Err(e) = runtime
                    .store
                    .mark_sent(&message.id, Some(receipt.provider_message_id))
                    .await
                {
                    // The provider took the message; never hand it out again
                    error!(
                        message_id = %message.id,
                        error = %e,
                        "failed to record successful send"
                    );
                }
                return;
            }
            Err(e @ (SendError::Transient(_) | SendError::RateLimited { .. })) => {
                runtime.limiter.release(&provider_id, &sender_key);
                runtime.breaker.record_failure(&provider_id);
                exclude.insert(provider_id.clone());

                if failover_used < engine.max_failover_attempts {
                    failover_used += 1;
                    debug!(
                        message_id = %message.id,
                        provider = %provider_id,
                        error = %e,
                        attempt = failover_used,
                        "send failed, trying next-best provider"
                    );
                    last_send_error = Some(e);
                    continue;
                }

                match e {
                    SendError::RateLimited { retry_after, message: detail } => {
                        let delay = retry_after.map_or_else(
                            || delay_until_reset(engine, runtime, Some(decision.resets_at)),
                            |hint| hint.max(Duration::from_secs(engine.min_defer_secs)),
                        );
                        defer(
                            runtime,
                            &message,
                            &format!("provider rate limited: {detail}"),
                            delay,
                            DeferKind::RateLimit,
                        )
                        .await;
                    }
                    other => {
                        let delay = engine.retry.backoff_delay(message.retry_count);
                        defer(
                            runtime,
                            &message,
                            &other.to_string(),
                            delay,
                            DeferKind::Retry,
                        )
                        .await;
                    }
                }
                return;
            }
            Err(SendError::Auth(detail)) => {
                runtime.limiter.release(&provider_id, &sender_key);
                runtime.breaker.record_auth_failure(&provider_id);
                dispatch_log!(
                    level = WARN,
                    "message {} rejected by {} credentials, requires operator reset",
                    message.id,
                    provider_id
                );
                if let Err(e) = runtime.store.mark_auth_error(&message.id, &detail).await {
                    error!(message_id = %message.id, error = %e, "failed to record auth error");
                }
                return;
            }
            Err(SendError::Permanent(detail)) => {
                runtime.limiter.release(&provider_id, &sender_key);
                runtime.breaker.record_failure(&provider_id);
                mark_failed(runtime, &message, &detail).await;
                return;
            }
        }
    }
}

/// The longer of time-to-reset and the minimum deferral floor
fn delay_until_reset(
    engine: &DispatchEngine,
    runtime: &EngineRuntime,
    resets_at: Option<DateTime<Utc>>,
) -> Duration {
    let resets_at = resets_at.unwrap_or_else(|| runtime.clock.next_midnight());
    let until_reset = (resets_at - runtime.clock.now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    until_reset.max(Duration::from_secs(engine.min_defer_secs))
}

async fn defer(
    runtime: &EngineRuntime,
    message: &Message,
    reason: &str,
    delay: Duration,
    kind: DeferKind,
) {
    let next_visible_at =
        runtime.clock.now() + TimeDelta::from_std(delay).unwrap_or_else(|_| TimeDelta::days(3650));

    match runtime
        .store
        .mark_deferred(&message.id, reason, next_visible_at, kind)
        .await
    {
        Ok(DeferOutcome::Deferred) => {
            dispatch_log!(
                level = INFO,
                "message {} deferred for {}s: {reason}",
                message.id,
                delay.as_secs()
            );
        }
        Ok(DeferOutcome::Failed) => {
            dispatch_log!(
                level = WARN,
                "message {}: retry budget exhausted, failing: {reason}",
                message.id
            );
        }
        Err(e) => {
            error!(message_id = %message.id, error = %e, "failed to defer message");
        }
    }
}

async fn mark_failed(runtime: &EngineRuntime, message: &Message, reason: &str) {
    dispatch_log!(level = WARN, "message {} failed: {reason}", message.id);
    if let Err(e) = runtime.store.mark_failed(&message.id, reason).await {
        error!(message_id = %message.id, error = %e, "failed to record failure");
    }
}
