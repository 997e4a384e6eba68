//! `/v1/realtime` websocket endpoint: bridges the caller's socket to a
//! provider duplex session, meters audio both ways, and settles billing
//! when either side hangs up.

use crate::AppState;
use crate::error_mapper::error_response;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use conduit_billing::UsageEvent;
use conduit_core::{
    AudioUsage, CapabilityFlags, GatewayError, OperationType, ProviderType, Result, Usage,
    VirtualKey,
};
use conduit_providers::ultravox::{CreateCallRequest, UltravoxClient};
use conduit_realtime::openai::OpenAiRealtimeSession;
use conduit_realtime::ultravox::UltravoxRealtimeSession;
use conduit_realtime::{ClientFrame, RealtimeConfig, RealtimeSession, SessionStats};
use conduit_router::RouteTarget;
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub(crate) struct RealtimeParams {
    model: String,
    #[serde(default)]
    voice: Option<String>,
}

pub(crate) async fn realtime_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<RealtimeParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let trace_id = uuid::Uuid::new_v4().to_string();
    let token = match headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        Some(token) => token.to_string(),
        None => {
            return error_response(
                &GatewayError::Unauthenticated("missing bearer token".to_string()),
                &trace_id,
            );
        }
    };

    let key = match state.keys.authenticate(&token).await {
        Ok(key) => key,
        Err(e) => return error_response(&e, &trace_id),
    };
    if let Err(e) = state.keys.authorize(&key, &params.model) {
        return error_response(&e, &trace_id);
    }
    if let Err(e) = state.limiter.check(&key) {
        return error_response(&e, &trace_id);
    }

    let required = CapabilityFlags {
        audio: true,
        ..Default::default()
    };
    let target = match state
        .router
        .resolve(&params.model, &required, &HashSet::new())
        .await
    {
        Ok(target) => target,
        Err(e) => return error_response(&e, &trace_id),
    };

    ws.on_upgrade(move |socket| async move {
        if let Err(e) = run_bridge(state, socket, key, target, params, trace_id).await {
            tracing::warn!(error = %e, "realtime bridge terminated with error");
        }
    })
}

async fn connect_provider(
    target: &RouteTarget,
    params: &RealtimeParams,
) -> Result<Arc<dyn RealtimeSession>> {
    let mut config = RealtimeConfig::new(target.mapping.provider_model_id.clone());
    config.voice = params.voice.clone();

    match target.provider.provider_type {
        ProviderType::Openai => {
            let session =
                OpenAiRealtimeSession::connect(&target.key.api_key, None, config).await?;
            Ok(Arc::new(session))
        }
        ProviderType::Ultravox => {
            let client = UltravoxClient::new(&target.provider, &target.key)?;
            let call = client
                .create_call(CreateCallRequest {
                    model: config.model.clone(),
                    system_prompt: config.system_prompt.clone(),
                    voice: config.voice.clone(),
                    first_speaker: None,
                })
                .await?;
            let session = UltravoxRealtimeSession::connect(&call.join_url, &config).await?;
            Ok(Arc::new(session))
        }
        other => Err(GatewayError::NotImplemented(format!(
            "realtime audio on {other}"
        ))),
    }
}

async fn run_bridge(
    state: AppState,
    mut socket: WebSocket,
    key: VirtualKey,
    target: RouteTarget,
    params: RealtimeParams,
    trace_id: String,
) -> Result<()> {
    let started = std::time::Instant::now();
    // A zero reservation admits the session while still refusing groups
    // already in the red; realtime usage is metered post-hoc.
    let handle = state.ledger.reserve(&key.group_id, Decimal::ZERO).await?;

    let session = match connect_provider(&target, &params).await {
        Ok(session) => session,
        Err(e) => {
            state.billing.abandon(handle).await.ok();
            let close = serde_json::json!({
                "type": "error",
                "message": e.to_string(),
            });
            let _ = socket.send(Message::Text(close.to_string().into())).await;
            return Err(e);
        }
    };

    state.sessions.insert(Arc::clone(&session));
    state
        .metrics
        .record_realtime_session(&target.provider.name);
    state.metrics.operation_started(OperationType::Realtime);
    let session_id = session.id().to_string();
    tracing::info!(
        session = %session_id,
        provider = %target.provider.name,
        "realtime session established"
    );

    // Independent halves: a stall on one direction never blocks the other.
    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(text.as_str()) {
                            Ok(frame) => {
                                if let Err(e) = session.send(frame).await {
                                    tracing::warn!(error = %e, "provider send failed");
                                    break;
                                }
                            }
                            Err(e) => {
                                let body = serde_json::json!({
                                    "type": "error",
                                    "message": format!("unrecognized frame: {e}"),
                                });
                                let _ = ws_tx
                                    .send(Message::Text(body.to_string().into()))
                                    .await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "client socket error");
                        break;
                    }
                }
            }
            outbound = session.receive() => {
                match outbound {
                    Ok(Some(response)) => {
                        let Ok(json) = serde_json::to_string(&response) else {
                            continue;
                        };
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "provider receive failed");
                        break;
                    }
                }
            }
        }
    }

    // Disposal on every exit path: close transport, meter, bill, emit.
    let stats = state
        .sessions
        .dispose(&session_id)
        .await
        .unwrap_or_default();
    settle_realtime(&state, handle, &target, &key, &params.model, stats, &trace_id, started)
        .await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn settle_realtime(
    state: &AppState,
    handle: conduit_auth::ReservationHandle,
    target: &RouteTarget,
    key: &VirtualKey,
    alias: &str,
    stats: SessionStats,
    trace_id: &str,
    started: std::time::Instant,
) {
    let cost_rule = state
        .store
        .cost_for_mapping(&target.mapping.id)
        .await
        .ok()
        .flatten();
    let usage = Usage::new(stats.input_tokens as u32, stats.output_tokens as u32);
    let event = UsageEvent {
        occurred_at: Utc::now(),
        operation: OperationType::Realtime,
        provider: target.provider.name.clone(),
        model_alias: alias.to_string(),
        virtual_key: key.id.to_string(),
        usage: Some(usage),
        audio_usage: Some(AudioUsage {
            audio_seconds: stats.input_audio_seconds + stats.output_audio_seconds,
            character_count: 0,
        }),
        image_count: None,
        cost: Decimal::ZERO,
        usage_missing: false,
    };

    match state.billing.settle(handle, cost_rule.as_ref(), event).await {
        Ok(settled) => {
            state
                .metrics
                .record_cost(OperationType::Realtime, settled.cost);
        }
        Err(e) => tracing::error!(error = %e, "realtime settlement failed"),
    }

    let duration = started.elapsed();
    state.metrics.operation_finished(OperationType::Realtime);
    state.metrics.record_realtime_latency(
        &target.provider.name,
        std::time::Duration::from_secs_f64(stats.average_latency_ms / 1000.0),
    );
    state.metrics.record_request(
        OperationType::Realtime,
        &target.provider.name,
        conduit_core::TraceStatus::Ok,
        duration,
    );
    state.traces.record(conduit_core::RequestTrace {
        trace_id: trace_id.to_string(),
        started_at: Utc::now(),
        duration_ms: duration.as_millis() as u64,
        operation: OperationType::Realtime,
        provider: Some(target.provider.name.clone()),
        virtual_key: Some(key.id.to_string()),
        status: conduit_core::TraceStatus::Ok,
        error_kind: None,
        tags: HashMap::from([
            ("turns".to_string(), stats.turn_count.to_string()),
            (
                "interruptions".to_string(),
                stats.interruption_count.to_string(),
            ),
        ]),
    });
}
