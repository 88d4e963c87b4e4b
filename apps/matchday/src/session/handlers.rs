use serde_json::Value;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

use super::Sinks;
use crate::connection::ConnectionManager;
use crate::normalize::Normalizer;
use crate::reconcile::{ApplyOutcome, StateReconciler};

pub const RECEIVE_STATE: &str = "ReceiveMatchState";
pub const RECEIVE_INFO: &str = "ReceiveMatchInfo";
pub const RECEIVE_EVENT: &str = "ReceiveMatchEvent";
pub const MATCH_PAUSED: &str = "MatchPaused";
pub const MATCH_RESUMED: &str = "MatchResumed";
pub const MATCH_FINISHED: &str = "MatchFinished";
pub const HUB_ERROR: &str = "Error";

/// Wires every inbound push to the session sinks. Handlers stop touching the
/// sinks once the session is closed.
pub(super) fn register(connection: &ConnectionManager, sinks: &Sinks, normalizer: Normalizer) {
    on(connection, sinks, RECEIVE_STATE, move |sinks, payload| {
        let outcome = apply_state(&sinks.reconciler, normalizer, payload);
        if let ApplyOutcome::Stale {
            current_tick,
            incoming_tick,
        } = outcome
        {
            debug!(
                target = "matchday::session",
                match_id = %sinks.match_id,
                tick = incoming_tick,
                current_tick,
                "stale state push"
            );
        }
        sinks.finish_if_done();
    });

    on(connection, sinks, RECEIVE_INFO, move |sinks, payload| {
        sinks.reconciler.apply_info(normalizer.info(payload));
    });

    on(connection, sinks, RECEIVE_EVENT, move |sinks, payload| {
        let clock = sinks
            .reconciler
            .with_info(|info| info.map_or(normalizer, |info| normalizer.for_info(info)));
        let event = clock.event(payload);
        sinks.events.lock().append(event);
    });

    on(connection, sinks, MATCH_PAUSED, |sinks, _| {
        sinks.reconciler.mark_paused();
    });

    on(connection, sinks, MATCH_RESUMED, |sinks, _| {
        sinks.reconciler.mark_resumed();
    });

    on(connection, sinks, MATCH_FINISHED, move |sinks, payload| {
        if payload.is_object() {
            apply_state(&sinks.reconciler, normalizer, payload);
        }
        sinks.reconciler.mark_finished();
        sinks.finish_if_done();
    });

    on(connection, sinks, HUB_ERROR, |sinks, payload| {
        let message = match payload {
            Value::String(text) => text.clone(),
            Value::Null => "unspecified hub error".to_string(),
            other => other.to_string(),
        };
        warn!(
            target = "matchday::session",
            match_id = %sinks.match_id,
            error = %message,
            "hub reported an error"
        );
        *sinks.last_error.lock() = Some(message);
    });
}

/// Pushes without a tick (result-only finish payloads) apply at the current
/// tick instead of being dropped as stale.
fn apply_state(
    reconciler: &StateReconciler,
    normalizer: Normalizer,
    payload: &Value,
) -> ApplyOutcome {
    let state = normalizer.state(payload);
    match normalizer.tick(payload) {
        Some(_) => reconciler.apply_state(state),
        None => reconciler.apply_untimed(state),
    }
}

fn on<F>(connection: &ConnectionManager, sinks: &Sinks, event: &'static str, apply: F)
where
    F: Fn(&Sinks, &Value) + Send + Sync + 'static,
{
    let sinks = sinks.clone();
    connection.on(event, move |arguments| {
        if sinks.closed.load(Ordering::SeqCst) {
            return;
        }
        match arguments.first() {
            Some(payload) => apply(&sinks, payload),
            None => apply(&sinks, &Value::Null),
        }
    });
}
