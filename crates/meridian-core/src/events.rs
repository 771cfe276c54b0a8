//! Cross-cutting event log helpers.
//!
//! Every component appends through this module rather than calling
//! `StoreGateway::append_event` directly, so the event shape stays
//! consistent — mirroring how the teacher's audit module is a single
//! cross-cutting concern called from many engines rather than something each
//! engine reimplements.

use std::sync::Arc;

use meridian_storage::model::{NewEvent, Severity};
use meridian_storage::StoreGateway;
use serde_json::json;
use tracing::warn;

/// Append an event, logging (rather than propagating) a store failure.
///
/// Event emission is best-effort observability, not part of the operation it
/// describes: a store outage must not fail the reconcile/scale/probe action
/// that triggered the event.
pub async fn emit(
    store: &Arc<dyn StoreGateway>,
    app_name: Option<&str>,
    container_id: Option<&str>,
    event_type: &str,
    severity: Severity,
    message: impl Into<String>,
    details: serde_json::Value,
) {
    let event = NewEvent {
        app_name: app_name.map(str::to_owned),
        container_id: container_id.map(str::to_owned),
        event_type: event_type.to_owned(),
        severity,
        message: message.into(),
        details,
    };
    if let Err(err) = store.append_event(event).await {
        warn!(error = %err, event_type, "failed to append event");
    }
}

/// Convenience wrapper for events with no structured detail payload.
pub async fn emit_simple(
    store: &Arc<dyn StoreGateway>,
    app_name: Option<&str>,
    event_type: &str,
    severity: Severity,
    message: impl Into<String>,
) {
    emit(store, app_name, None, event_type, severity, message, json!({})).await;
}
