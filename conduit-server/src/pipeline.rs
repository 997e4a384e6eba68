//! Request pipeline: sanitize → authenticate → authorize/reserve → route
//! → translate/call → stream pump → meter → bill → emit. Every exit path
//! settles the reservation and emits a trace; cancellation mid-stream
//! bills only provider-reported usage.

use crate::AppState;
use chrono::Utc;
use conduit_billing::{UsageEvent, estimate_tokens};
use conduit_core::{
    AudioUsage, CapabilityFlags, ChatChunkStream, ChatRequest, ChatResponse, EmbeddingsRequest,
    EmbeddingsResponse, GatewayError, ImageGenerationRequest, ImageGenerationResponse, ModelCost,
    OperationType, RequestTrace, Result, TraceStatus, TranscriptionRequest, TranscriptionResponse,
    TtsRequest, Usage, VirtualKey, sanitize_for_log,
};
use conduit_core::store::ModelKind;
use conduit_auth::ReservationHandle;
use conduit_providers::ProviderClient;
use conduit_router::RouteTarget;
use futures::StreamExt;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// What one provider call consumed, as reported.
#[derive(Debug, Clone, Copy, Default)]
struct Metered {
    usage: Option<Usage>,
    audio: Option<AudioUsage>,
    images: Option<u32>,
    usage_missing: bool,
}

struct ResolvedCall {
    target: RouteTarget,
    client: Arc<dyn ProviderClient>,
    cost_rule: Option<ModelCost>,
}

pub struct Pipeline {
    state: AppState,
}

impl Pipeline {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    fn required_capabilities(request: &ChatRequest) -> CapabilityFlags {
        CapabilityFlags {
            chat: true,
            vision: request.wants_vision(),
            streaming: request.stream,
            function_calling: request.wants_tools(),
            audio: false,
        }
    }

    async fn resolve(
        &self,
        alias: &str,
        required: &CapabilityFlags,
        exclusions: &HashSet<(conduit_core::ProviderId, conduit_core::MappingId)>,
    ) -> Result<ResolvedCall> {
        let target = self.state.router.resolve(alias, required, exclusions).await?;
        let client = conduit_providers::build_client(&target.provider, &target.key)?;
        let cost_rule = self
            .state
            .store
            .cost_for_mapping(&target.mapping.id)
            .await?;
        Ok(ResolvedCall {
            target,
            client,
            cost_rule,
        })
    }

    /// Budget estimate for the reservation, per operation shape.
    fn estimate(
        &self,
        rule: Option<&ModelCost>,
        operation: OperationType,
        request: &EstimateInput<'_>,
        context_window: u32,
    ) -> Decimal {
        let Some(rule) = rule else {
            return Decimal::ZERO;
        };
        let calculator = self.state.billing.calculator();
        match (operation, request) {
            (OperationType::Chat, EstimateInput::Chat(req)) => calculator.estimate_chat_cost(
                rule,
                req.prompt_chars(),
                req.max_tokens,
                context_window,
            ),
            (OperationType::Embeddings, EstimateInput::Embeddings(req)) => {
                let tokens = estimate_tokens(req.input.total_chars());
                calculator.chat_cost(rule, &Usage::new(tokens, 0))
            }
            (OperationType::ImageGeneration, EstimateInput::Images(req)) => {
                calculator.image_cost(rule, req.count())
            }
            (OperationType::AudioTranscription, EstimateInput::Transcription(req)) => {
                calculator.transcription_cost(rule, req.estimated_duration_secs())
            }
            (OperationType::TextToSpeech, EstimateInput::Tts(req)) => {
                calculator.tts_cost(rule, req.input.chars().count() as u64)
            }
            _ => Decimal::ZERO,
        }
    }

    /// Allow-list and rate-limit checks. Runs before any routing so a
    /// denied model surfaces as denial, not as a routing miss.
    fn authorize(&self, key: &VirtualKey, alias: &str) -> Result<()> {
        self.state.keys.authorize(key, alias)?;
        self.state.limiter.check(key)
    }

    fn publish_provider_gauges(&self, resolved: &ResolvedCall) {
        let circuit = self.state.router.circuit();
        let provider_id = &resolved.target.provider.id;
        let name = resolved.target.provider.name.as_str();
        let uptime = match circuit.state(provider_id) {
            conduit_router::CircuitState::Closed => 1.0,
            _ => 0.0,
        };
        self.state.metrics.set_provider_uptime_ratio(name, uptime);
        self.state
            .metrics
            .set_provider_error_rate(name, circuit.error_rate(provider_id));
    }

    fn emit(
        &self,
        trace_id: &str,
        operation: OperationType,
        provider: Option<&str>,
        key: &VirtualKey,
        started: Instant,
        status: TraceStatus,
        error_kind: Option<String>,
    ) {
        let duration = started.elapsed();
        let provider_label = provider.unwrap_or("none");
        self.state.metrics.operation_finished(operation);
        self.state
            .metrics
            .record_request(operation, provider_label, status, duration);
        self.state.traces.record(RequestTrace {
            trace_id: trace_id.to_string(),
            started_at: Utc::now(),
            duration_ms: duration.as_millis() as u64,
            operation,
            provider: provider.map(String::from),
            virtual_key: Some(key.id.to_string()),
            status,
            error_kind,
            tags: HashMap::new(),
        });
    }

    async fn settle(
        &self,
        handle: ReservationHandle,
        rule: Option<&ModelCost>,
        operation: OperationType,
        provider: &str,
        alias: &str,
        key: &VirtualKey,
        metered: Metered,
    ) -> Result<Decimal> {
        let event = UsageEvent {
            occurred_at: Utc::now(),
            operation,
            provider: provider.to_string(),
            model_alias: alias.to_string(),
            virtual_key: key.id.to_string(),
            usage: metered.usage,
            audio_usage: metered.audio,
            image_count: metered.images,
            cost: Decimal::ZERO,
            usage_missing: metered.usage_missing,
        };
        let settled = self.state.billing.settle(handle, rule, event).await?;
        self.state.metrics.record_cost(operation, settled.cost);
        Ok(settled.cost)
    }

    /// Validate `max_tokens` against the model's context window when the
    /// capability service knows the alias.
    async fn validate_max_tokens(&self, request: &ChatRequest) -> Result<u32> {
        match self.state.capability.context_window(&request.model).await {
            Ok(window) => {
                if let Some(max_tokens) = request.max_tokens {
                    if max_tokens > window {
                        return Err(GatewayError::InvalidParameter {
                            name: "max_tokens".to_string(),
                            reason: format!("exceeds context window of {window}"),
                        });
                    }
                }
                Ok(window)
            }
            // Unmapped alias metadata: the router decides whether the
            // alias exists at all.
            Err(GatewayError::UnknownCapability { .. }) => Ok(4096),
            Err(e) => Err(e),
        }
    }

    /// Failover loop shared by the unary operations. The closure performs
    /// one translated provider call.
    async fn call_with_failover<T, F>(
        &self,
        operation: OperationType,
        alias: &str,
        required: &CapabilityFlags,
        mut call: F,
    ) -> Result<(T, ResolvedCall)>
    where
        F: AsyncFnMut(&ResolvedCall) -> Result<T>,
    {
        let mut exclusions = HashSet::new();
        let max_attempts = if operation.is_idempotent() {
            self.state.router.max_attempts()
        } else {
            1
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let resolved = self.resolve(alias, required, &exclusions).await?;
            let provider_id = resolved.target.provider.id.clone();
            let deadline = operation.deadline();

            let outcome = match tokio::time::timeout(deadline, call(&resolved)).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout {
                    seconds: deadline.as_secs(),
                }),
            };

            match outcome {
                Ok(value) => {
                    self.state.router.circuit().record_success(&provider_id);
                    self.publish_provider_gauges(&resolved);
                    return Ok((value, resolved));
                }
                Err(error) => {
                    let retryable = error.is_retryable();
                    if retryable {
                        self.state.router.circuit().record_failure(&provider_id);
                    }
                    self.publish_provider_gauges(&resolved);
                    self.state.metrics.record_request_error(
                        operation,
                        resolved.target.provider.name.as_str(),
                        error_metric_code(&error),
                    );
                    if retryable && attempt < max_attempts {
                        tracing::info!(
                            alias = %sanitize_for_log(alias),
                            provider = %resolved.target.provider.name,
                            attempt,
                            "failing over after retryable provider error"
                        );
                        exclusions.insert(resolved.target.exclusion_key());
                        continue;
                    }
                    return Err(error);
                }
            }
        }
    }

    pub async fn chat(
        &self,
        key: &VirtualKey,
        request: ChatRequest,
        trace_id: &str,
    ) -> Result<ChatResponse> {
        let started = Instant::now();
        let operation = OperationType::Chat;
        let alias = request.model.clone();
        tracing::debug!(
            model = %sanitize_for_log(&alias),
            key = %key.id,
            "chat request admitted"
        );

        self.authorize(key, &alias)?;
        let context_window = self.validate_max_tokens(&request).await?;
        let required = Self::required_capabilities(&request);

        // The estimate uses the best-priority mapping's rates; failover
        // keeps the original reservation.
        let first = self.resolve(&alias, &required, &HashSet::new()).await?;
        let estimate = self.estimate(
            first.cost_rule.as_ref(),
            operation,
            &EstimateInput::Chat(&request),
            context_window,
        );
        let handle = self.state.ledger.reserve(&key.group_id, estimate).await?;

        self.state
            .metrics
            .record_request_size(operation, request.prompt_chars());
        self.state.metrics.operation_started(operation);
        let result = self
            .call_with_failover(operation, &alias, &required, async |resolved| {
                let mut upstream = request.clone();
                upstream.model = resolved.target.mapping.provider_model_id.clone();
                upstream.stream = false;
                resolved.client.chat(upstream).await
            })
            .await;

        match result {
            Ok((mut response, resolved)) => {
                let metered = meter_chat(&request, &mut response);
                response.model = alias.clone();
                match self
                    .settle(
                        handle,
                        resolved.cost_rule.as_ref(),
                        operation,
                        &resolved.target.provider.name,
                        &alias,
                        key,
                        metered,
                    )
                    .await
                {
                    Ok(cost) => {
                        tracing::debug!(
                            %cost,
                            provider = %resolved.target.provider.name,
                            "chat billed"
                        );
                        self.emit(
                            trace_id,
                            operation,
                            Some(resolved.target.provider.name.as_str()),
                            key,
                            started,
                            TraceStatus::Ok,
                            None,
                        );
                        Ok(response)
                    }
                    Err(error) => {
                        self.emit(
                            trace_id,
                            operation,
                            Some(resolved.target.provider.name.as_str()),
                            key,
                            started,
                            TraceStatus::Error,
                            Some("billing_failed".to_string()),
                        );
                        Err(error)
                    }
                }
            }
            Err(error) => {
                self.state.billing.abandon(handle).await.ok();
                self.emit(
                    trace_id,
                    operation,
                    None,
                    key,
                    started,
                    TraceStatus::Error,
                    Some(error_metric_code(&error).to_string()),
                );
                Err(error)
            }
        }
    }

    /// Streaming chat. The returned stream forwards canonical chunks and
    /// settles billing on every exit path; dropping the stream before the
    /// terminal chunk counts as a cancellation and bills only the usage
    /// the provider actually reported.
    pub async fn chat_stream(
        &self,
        key: &VirtualKey,
        request: ChatRequest,
        trace_id: &str,
    ) -> Result<ChatChunkStream> {
        let started = Instant::now();
        let operation = OperationType::Chat;
        let alias = request.model.clone();

        self.authorize(key, &alias)?;
        let context_window = self.validate_max_tokens(&request).await?;
        let mut required = Self::required_capabilities(&request);
        required.streaming = true;

        let first = self.resolve(&alias, &required, &HashSet::new()).await?;
        let estimate = self.estimate(
            first.cost_rule.as_ref(),
            operation,
            &EstimateInput::Chat(&request),
            context_window,
        );
        let handle = self.state.ledger.reserve(&key.group_id, estimate).await?;

        self.state
            .metrics
            .record_request_size(operation, request.prompt_chars());
        self.state.metrics.operation_started(operation);
        let open_result = self
            .call_with_failover(operation, &alias, &required, async |resolved| {
                let mut upstream = request.clone();
                upstream.model = resolved.target.mapping.provider_model_id.clone();
                upstream.stream = true;
                resolved.client.chat_stream(upstream).await
            })
            .await;

        let (mut upstream, resolved) = match open_result {
            Ok(opened) => opened,
            Err(error) => {
                self.state.billing.abandon(handle).await.ok();
                self.emit(
                    trace_id,
                    operation,
                    None,
                    key,
                    started,
                    TraceStatus::Error,
                    Some(error_metric_code(&error).to_string()),
                );
                return Err(error);
            }
        };

        let settlement = Arc::new(StreamSettlement {
            pipeline_state: self.state.clone(),
            handle: Mutex::new(Some(handle)),
            cost_rule: resolved.cost_rule.clone(),
            operation,
            provider: resolved.target.provider.name.clone(),
            alias: alias.clone(),
            key: key.clone(),
            trace_id: trace_id.to_string(),
            started,
            reported_usage: Mutex::new(None),
            finished: AtomicBool::new(false),
        });

        let provider_id = resolved.target.provider.id.clone();
        let stream_alias = alias.clone();
        let guard = SettlementGuard(Arc::clone(&settlement));
        let circuit = Arc::clone(self.state.router.circuit());
        Ok(Box::pin(async_stream::stream! {
            let _guard = guard;
            // The pump runs to the upstream's end even after the terminal
            // chunk: providers that report usage do so in a trailing
            // frame with no choices.
            while let Some(chunk) = upstream.next().await {
                match chunk {
                    Ok(mut chunk) => {
                        if let Some(usage) = chunk.usage {
                            *settlement.reported_usage.lock() = Some(usage);
                        }
                        chunk.model = stream_alias.clone();
                        if chunk.is_terminal() {
                            circuit.record_success(&provider_id);
                        }
                        yield Ok(chunk);
                    }
                    Err(error) => {
                        if error.is_retryable() {
                            circuit.record_failure(&provider_id);
                        }
                        settlement.finish(TraceStatus::Error).await;
                        yield Err(error);
                        return;
                    }
                }
            }
            settlement.finish(TraceStatus::Ok).await;
        }))
    }

    pub async fn embeddings(
        &self,
        key: &VirtualKey,
        request: EmbeddingsRequest,
        trace_id: &str,
    ) -> Result<EmbeddingsResponse> {
        if request.input.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "input cannot be empty".to_string(),
            ));
        }
        let alias = request.model.clone();
        let required = CapabilityFlags::default();
        let estimate_input = EstimateInput::Embeddings(&request);

        self.unary_operation(
            key,
            OperationType::Embeddings,
            &alias,
            &required,
            estimate_input,
            trace_id,
            async |resolved| {
                let mut upstream = request.clone();
                upstream.model = resolved.target.mapping.provider_model_id.clone();
                let mut response = resolved.client.embeddings(upstream).await?;
                let metered = Metered {
                    usage: Some(response.usage),
                    usage_missing: response.usage.is_zero(),
                    ..Default::default()
                };
                response.model = alias.clone();
                Ok((response, metered))
            },
        )
        .await
    }

    pub async fn generate_images(
        &self,
        key: &VirtualKey,
        request: ImageGenerationRequest,
        trace_id: &str,
    ) -> Result<ImageGenerationResponse> {
        let alias = request.model.clone();
        let required = CapabilityFlags::default();

        self.unary_operation(
            key,
            OperationType::ImageGeneration,
            &alias,
            &required,
            EstimateInput::Images(&request),
            trace_id,
            async |resolved| {
                let mut upstream = request.clone();
                upstream.model = resolved.target.mapping.provider_model_id.clone();
                let response = resolved.client.generate_images(upstream).await?;
                let metered = Metered {
                    images: Some(response.data.len() as u32),
                    ..Default::default()
                };
                Ok((response, metered))
            },
        )
        .await
    }

    pub async fn transcribe(
        &self,
        key: &VirtualKey,
        request: TranscriptionRequest,
        trace_id: &str,
    ) -> Result<TranscriptionResponse> {
        request.validate()?;
        let alias = request.model.clone();
        let required = CapabilityFlags {
            audio: true,
            ..Default::default()
        };

        self.unary_operation(
            key,
            OperationType::AudioTranscription,
            &alias,
            &required,
            EstimateInput::Transcription(&request),
            trace_id,
            async |resolved| {
                let mut upstream = request.clone();
                upstream.model = resolved.target.mapping.provider_model_id.clone();
                let response = resolved.client.transcribe(upstream).await?;
                let metered = Metered {
                    audio: Some(response.usage),
                    ..Default::default()
                };
                Ok((response, metered))
            },
        )
        .await
    }

    pub async fn speak(
        &self,
        key: &VirtualKey,
        request: TtsRequest,
        alias: &str,
        trace_id: &str,
    ) -> Result<(bytes::Bytes, AudioUsage)> {
        request.validate()?;
        let required = CapabilityFlags {
            audio: true,
            ..Default::default()
        };

        let owned_alias = alias.to_string();
        self.unary_operation(
            key,
            OperationType::TextToSpeech,
            &owned_alias,
            &required,
            EstimateInput::Tts(&request),
            trace_id,
            async |resolved| {
                let mut upstream = request.clone();
                if upstream.model.is_none() {
                    // Prefer the mapping's target model; fall back to the
                    // configured default for the provider. Never a
                    // hard-coded name.
                    let mapped = resolved.target.mapping.provider_model_id.clone();
                    upstream.model = if mapped.is_empty() {
                        self.state
                            .capability
                            .default_model(
                                resolved.target.provider.provider_type,
                                ModelKind::Tts,
                            )
                            .await?
                    } else {
                        Some(mapped)
                    };
                }
                let (audio, usage) = resolved.client.speak(upstream).await?;
                let metered = Metered {
                    audio: Some(usage),
                    ..Default::default()
                };
                Ok(((audio, usage), metered))
            },
        )
        .await
    }

    /// Shared unary flow: admit, call with failover, settle, emit.
    async fn unary_operation<T, F>(
        &self,
        key: &VirtualKey,
        operation: OperationType,
        alias: &str,
        required: &CapabilityFlags,
        estimate_input: EstimateInput<'_>,
        trace_id: &str,
        mut call: F,
    ) -> Result<T>
    where
        F: AsyncFnMut(&ResolvedCall) -> Result<(T, Metered)>,
    {
        let started = Instant::now();

        self.authorize(key, alias)?;
        let first = self.resolve(alias, required, &HashSet::new()).await?;
        let estimate = self.estimate(first.cost_rule.as_ref(), operation, &estimate_input, 4096);
        let handle = self.state.ledger.reserve(&key.group_id, estimate).await?;

        self.state.metrics.operation_started(operation);
        let result = self
            .call_with_failover(operation, alias, required, async |resolved| {
                call(resolved).await
            })
            .await;

        match result {
            Ok(((value, metered), resolved)) => {
                match self
                    .settle(
                        handle,
                        resolved.cost_rule.as_ref(),
                        operation,
                        &resolved.target.provider.name,
                        alias,
                        key,
                        metered,
                    )
                    .await
                {
                    Ok(_cost) => {
                        self.emit(
                            trace_id,
                            operation,
                            Some(resolved.target.provider.name.as_str()),
                            key,
                            started,
                            TraceStatus::Ok,
                            None,
                        );
                        Ok(value)
                    }
                    Err(error) => {
                        self.emit(
                            trace_id,
                            operation,
                            Some(resolved.target.provider.name.as_str()),
                            key,
                            started,
                            TraceStatus::Error,
                            Some("billing_failed".to_string()),
                        );
                        Err(error)
                    }
                }
            }
            Err(error) => {
                self.state.billing.abandon(handle).await.ok();
                self.emit(
                    trace_id,
                    operation,
                    None,
                    key,
                    started,
                    TraceStatus::Error,
                    Some(error_metric_code(&error).to_string()),
                );
                Err(error)
            }
        }
    }
}

enum EstimateInput<'a> {
    Chat(&'a ChatRequest),
    Embeddings(&'a EmbeddingsRequest),
    Images(&'a ImageGenerationRequest),
    Transcription(&'a TranscriptionRequest),
    Tts(&'a TtsRequest),
}

/// Fill in estimated usage when the provider reported none.
fn meter_chat(request: &ChatRequest, response: &mut ChatResponse) -> Metered {
    if !response.usage_estimated {
        return Metered {
            usage: Some(response.usage),
            ..Default::default()
        };
    }
    let prompt = estimate_tokens(request.prompt_chars());
    let completion = estimate_tokens(
        response
            .first_text()
            .map(|t| t.chars().count())
            .unwrap_or(0),
    );
    let usage = Usage::new(prompt, completion);
    response.usage = usage;
    Metered {
        usage: Some(usage),
        usage_missing: true,
        ..Default::default()
    }
}

fn error_metric_code(error: &GatewayError) -> &'static str {
    match error {
        GatewayError::RateLimitExceeded { .. } => "rate_limit_error",
        GatewayError::Timeout { .. } => "timeout_error",
        GatewayError::ProviderUnavailable(_) | GatewayError::NoProviderAvailable { .. } => {
            "service_unavailable"
        }
        GatewayError::Cancelled => "cancelled",
        GatewayError::InsufficientBalance { .. } => "insufficient_quota",
        GatewayError::Unauthenticated(_)
        | GatewayError::KeyExpired
        | GatewayError::KeyDisabled => "unauthorized",
        GatewayError::ModelNotAllowed(_) => "authorization_required",
        GatewayError::ModelNotFound(_) => "model_not_found",
        GatewayError::InvalidRequest(_) | GatewayError::InvalidParameter { .. } => {
            "invalid_request"
        }
        _ => "internal_error",
    }
}

/// Billing and trace settlement shared between the stream pump and its
/// drop guard. Exactly one caller wins `finish`.
struct StreamSettlement {
    pipeline_state: AppState,
    handle: Mutex<Option<ReservationHandle>>,
    cost_rule: Option<ModelCost>,
    operation: OperationType,
    provider: String,
    alias: String,
    key: VirtualKey,
    trace_id: String,
    started: Instant,
    reported_usage: Mutex<Option<Usage>>,
    finished: AtomicBool,
}

impl StreamSettlement {
    async fn finish(&self, status: TraceStatus) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        let usage = *self.reported_usage.lock();

        let event = UsageEvent {
            occurred_at: Utc::now(),
            operation: self.operation,
            provider: self.provider.clone(),
            model_alias: self.alias.clone(),
            virtual_key: self.key.id.to_string(),
            usage,
            audio_usage: None,
            image_count: None,
            cost: Decimal::ZERO,
            // Cancelled or errored streams without reported usage bill
            // zero and record the gap.
            usage_missing: usage.is_none(),
        };
        match self
            .pipeline_state
            .billing
            .settle(handle, self.cost_rule.as_ref(), event)
            .await
        {
            Ok(settled) => {
                self.pipeline_state
                    .metrics
                    .record_cost(self.operation, settled.cost);
            }
            Err(e) => {
                tracing::error!(error = %e, "stream settlement failed");
            }
        }

        let duration = self.started.elapsed();
        self.pipeline_state.metrics.operation_finished(self.operation);
        self.pipeline_state.metrics.record_request(
            self.operation,
            &self.provider,
            status,
            duration,
        );
        self.pipeline_state.traces.record(RequestTrace {
            trace_id: self.trace_id.clone(),
            started_at: Utc::now(),
            duration_ms: duration.as_millis() as u64,
            operation: self.operation,
            provider: Some(self.provider.clone()),
            virtual_key: Some(self.key.id.to_string()),
            status,
            error_kind: None,
            tags: HashMap::new(),
        });
    }
}

/// Drop guard: a stream dropped before its terminal chunk is a client
/// cancellation. The provider call is aborted by the drop itself; here
/// the reservation is settled against reported usage and the trace is
/// marked cancelled.
struct SettlementGuard(Arc<StreamSettlement>);

impl Drop for SettlementGuard {
    fn drop(&mut self) {
        let settlement = Arc::clone(&self.0);
        if settlement.finished.load(Ordering::SeqCst) {
            return;
        }
        tokio::spawn(async move {
            settlement.finish(TraceStatus::Cancelled).await;
        });
    }
}
