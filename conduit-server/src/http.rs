//! Route table and handlers for the OpenAI-compatible surface.

use crate::error_mapper::error_response;
use crate::pipeline::Pipeline;
use crate::realtime_ws;
use crate::AppState;
use axum::Json;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use conduit_core::{
    AudioFormat, ChatRequest, EmbeddingsRequest, GatewayError, ImageGenerationRequest,
    TimestampGranularity, TranscriptionFormat, TranscriptionRequest, TraceStatus, TtsRequest,
    VirtualKey, sanitize_for_log,
};
use conduit_telemetry::TraceQuery;
use futures::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use tower_http::trace::TraceLayer;

const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

pub fn router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/images/generations", post(image_generations))
        .route("/v1/audio/transcriptions", post(audio_transcriptions))
        .route("/v1/audio/speech", post(audio_speech))
        .route("/v1/models", get(list_models))
        .route("/v1/realtime", get(realtime_ws::realtime_upgrade))
        .route("/health", get(health))
        .route("/admin/traces", get(admin_traces))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn new_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, GatewayError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .ok_or_else(|| GatewayError::Unauthenticated("missing bearer token".to_string()))
}

async fn authenticate(state: AppState, headers: HeaderMap) -> Result<VirtualKey, GatewayError> {
    let token = bearer_token(&headers)?;
    state.keys.authenticate(token).await
}

fn with_request_id(mut response: Response, trace_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

pub(crate) async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Response {
    let trace_id = new_trace_id();
    let key = match authenticate(state.clone(), headers).await {
        Ok(key) => key,
        Err(e) => return error_response(&e, &trace_id),
    };

    let pipeline = Pipeline::new(state);
    if request.stream {
        match pipeline.chat_stream(&key, request, &trace_id).await {
            Ok(stream) => {
                let events = stream_to_sse(stream);
                let sse = Sse::new(events).keep_alive(KeepAlive::default());
                with_request_id(sse.into_response(), &trace_id)
            }
            Err(e) => error_response(&e, &trace_id),
        }
    } else {
        match pipeline.chat(&key, request, &trace_id).await {
            Ok(response) => with_request_id(Json(response).into_response(), &trace_id),
            Err(e) => error_response(&e, &trace_id),
        }
    }
}

/// Canonical chunks as `data:` frames, terminated by `data: [DONE]`.
/// Mid-stream failures surface as one error frame before the terminator.
fn stream_to_sse(
    stream: conduit_core::ChatChunkStream,
) -> impl futures::Stream<Item = Result<Event, Infallible>> + Send {
    async_stream::stream! {
        let mut stream = stream;
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => match serde_json::to_string(&chunk) {
                    Ok(json) => yield Ok(Event::default().data(json)),
                    Err(e) => {
                        tracing::error!(error = %e, "chunk serialization failed");
                        break;
                    }
                },
                Err(e) => {
                    let (_, error_type, code, _) = crate::error_mapper::mapping_for(&e);
                    let body = serde_json::json!({
                        "error": {
                            "message": e.to_string(),
                            "type": error_type,
                            "code": code,
                        }
                    });
                    yield Ok(Event::default().data(body.to_string()));
                    break;
                }
            }
        }
        yield Ok(Event::default().data("[DONE]"));
    }
}

pub(crate) async fn embeddings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<EmbeddingsRequest>,
) -> Response {
    let trace_id = new_trace_id();
    let key = match authenticate(state.clone(), headers.clone()).await {
        Ok(key) => key,
        Err(e) => return error_response(&e, &trace_id),
    };
    let pipeline = Pipeline::new(state);
    match pipeline.embeddings(&key, request, &trace_id).await {
        Ok(response) => with_request_id(Json(response).into_response(), &trace_id),
        Err(e) => error_response(&e, &trace_id),
    }
}

pub(crate) async fn image_generations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ImageGenerationRequest>,
) -> Response {
    let trace_id = new_trace_id();
    let key = match authenticate(state.clone(), headers.clone()).await {
        Ok(key) => key,
        Err(e) => return error_response(&e, &trace_id),
    };
    let pipeline = Pipeline::new(state);
    match pipeline.generate_images(&key, request, &trace_id).await {
        Ok(response) => with_request_id(Json(response).into_response(), &trace_id),
        Err(e) => error_response(&e, &trace_id),
    }
}

async fn parse_transcription_form(
    mut multipart: Multipart,
) -> Result<TranscriptionRequest, GatewayError> {
    let mut request = TranscriptionRequest {
        model: String::new(),
        audio_data: None,
        file_name: None,
        audio_url: None,
        language: None,
        prompt: None,
        temperature: None,
        response_format: TranscriptionFormat::default(),
        timestamp_granularity: TimestampGranularity::default(),
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| GatewayError::InvalidRequest(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                request.file_name = field.file_name().map(String::from);
                let bytes = field.bytes().await.map_err(|e| {
                    GatewayError::InvalidRequest(format!("unreadable audio upload: {e}"))
                })?;
                request.audio_data = Some(bytes);
            }
            "model" => request.model = text_field(field).await?,
            "language" => request.language = Some(text_field(field).await?),
            "prompt" => request.prompt = Some(text_field(field).await?),
            "temperature" => {
                let raw = text_field(field).await?;
                request.temperature = Some(raw.parse().map_err(|_| {
                    GatewayError::InvalidParameter {
                        name: "temperature".to_string(),
                        reason: "not a number".to_string(),
                    }
                })?);
            }
            "response_format" => {
                let raw = text_field(field).await?;
                request.response_format = serde_json::from_value(serde_json::json!(raw))
                    .map_err(|_| GatewayError::InvalidParameter {
                        name: "response_format".to_string(),
                        reason: format!("unsupported format {}", sanitize_for_log(&raw)),
                    })?;
            }
            "timestamp_granularities[]" => {
                let raw = text_field(field).await?;
                request.timestamp_granularity = match raw.as_str() {
                    "word" => TimestampGranularity::Word,
                    "segment" => TimestampGranularity::Segment,
                    _ => TimestampGranularity::None,
                };
            }
            _ => {}
        }
    }

    if request.model.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "model is required".to_string(),
        ));
    }
    Ok(request)
}

async fn text_field(field: axum::extract::multipart::Field<'_>) -> Result<String, GatewayError> {
    field
        .text()
        .await
        .map_err(|e| GatewayError::InvalidRequest(format!("unreadable form field: {e}")))
}

pub(crate) async fn audio_transcriptions(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Response {
    let trace_id = new_trace_id();
    let key = match authenticate(state.clone(), headers.clone()).await {
        Ok(key) => key,
        Err(e) => return error_response(&e, &trace_id),
    };
    let request = match parse_transcription_form(multipart).await {
        Ok(request) => request,
        Err(e) => return error_response(&e, &trace_id),
    };
    let pipeline = Pipeline::new(state);
    match pipeline.transcribe(&key, request, &trace_id).await {
        Ok(response) => with_request_id(Json(response).into_response(), &trace_id),
        Err(e) => error_response(&e, &trace_id),
    }
}

#[derive(Debug, Deserialize)]
struct SpeechBody {
    model: String,
    input: String,
    voice: String,
    #[serde(default)]
    response_format: Option<AudioFormat>,
    #[serde(default)]
    speed: Option<f64>,
}

pub(crate) async fn audio_speech(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SpeechBody>,
) -> Response {
    let trace_id = new_trace_id();
    let key = match authenticate(state.clone(), headers.clone()).await {
        Ok(key) => key,
        Err(e) => return error_response(&e, &trace_id),
    };

    let alias = body.model.clone();
    let format = body.response_format;
    let request = TtsRequest {
        model: None,
        input: body.input,
        voice: body.voice,
        response_format: format,
        speed: body.speed,
        pitch: None,
        volume: None,
        ssml: false,
        sample_rate: None,
    };

    let pipeline = Pipeline::new(state);
    match pipeline.speak(&key, request, &alias, &trace_id).await {
        Ok((audio, _usage)) => {
            let mime = format.unwrap_or(AudioFormat::Mp3).mime_type();
            let mut response = (
                StatusCode::OK,
                [(header::CONTENT_TYPE, mime)],
                audio,
            )
                .into_response();
            response = with_request_id(response, &trace_id);
            response
        }
        Err(e) => error_response(&e, &trace_id),
    }
}

pub(crate) async fn list_models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let trace_id = new_trace_id();
    let key = match authenticate(state.clone(), headers.clone()).await {
        Ok(key) => key,
        Err(e) => return error_response(&e, &trace_id),
    };

    let mappings = match state.store.enabled_mappings().await {
        Ok(mappings) => mappings,
        Err(e) => return error_response(&e, &trace_id),
    };

    let mut aliases: Vec<String> = mappings
        .into_iter()
        .map(|m| m.model_alias)
        .filter(|alias| state.keys.authorize(&key, alias).is_ok())
        .collect();
    aliases.sort();
    aliases.dedup();

    let created = chrono::Utc::now().timestamp();
    let body = serde_json::json!({
        "object": "list",
        "data": aliases
            .into_iter()
            .map(|id| serde_json::json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": "conduit",
            }))
            .collect::<Vec<_>>(),
    });
    with_request_id(Json(body).into_response(), &trace_id)
}

pub(crate) async fn health(State(state): State<AppState>) -> Response {
    let cache = state.cache.health();
    let alerts = state.alerts.active_alerts();
    let degraded = cache.degraded;
    let body = serde_json::json!({
        "status": if degraded { "degraded" } else { "ok" },
        "cache": {
            "distributed_configured": cache.distributed_configured,
            "degraded": cache.degraded,
        },
        "active_alerts": alerts.len(),
        "realtime_sessions": state.sessions.len(),
    });
    (StatusCode::OK, Json(body)).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct TraceSearchParams {
    provider: Option<String>,
    virtual_key: Option<String>,
    status: Option<String>,
    min_duration_ms: Option<u64>,
    max_duration_ms: Option<u64>,
    limit: Option<usize>,
}

/// Internal trace search, guarded by the admin key.
pub(crate) async fn admin_traces(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<TraceSearchParams>,
) -> Response {
    let trace_id = new_trace_id();
    let presented = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    match (&state.admin_key, presented) {
        (Some(expected), Some(given)) if expected == given => {}
        _ => {
            return error_response(
                &GatewayError::Unauthenticated("admin key required".to_string()),
                &trace_id,
            );
        }
    }

    let status = match params.status.as_deref() {
        Some("ok") => Some(TraceStatus::Ok),
        Some("error") => Some(TraceStatus::Error),
        Some("cancelled") => Some(TraceStatus::Cancelled),
        _ => None,
    };
    let results = state.traces.search(&TraceQuery {
        operation: None,
        provider: params.provider,
        virtual_key: params.virtual_key,
        status,
        min_duration_ms: params.min_duration_ms,
        max_duration_ms: params.max_duration_ms,
        limit: params.limit,
    });
    with_request_id(Json(results).into_response(), &trace_id)
}
