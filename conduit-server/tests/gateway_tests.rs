//! End-to-end scenarios over the axum app with mock upstreams and the
//! in-memory store.

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use conduit_core::{
    CapabilityFlags, GroupId, MappingId, MemoryStore, ModelCost, ModelMapping, PricingModel,
    Provider, ProviderId, ProviderKey, ProviderKeyId, ProviderType, TraceStatus, VirtualKey,
    VirtualKeyGroup, VirtualKeyId,
};
use conduit_auth::hash_token;
use conduit_core::store::{GatewayStore, ModelMetadata};
use conduit_server::pipeline::Pipeline;
use conduit_server::{AppState, build_app};
use futures::StreamExt;
use http_body_util::BodyExt;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    store: Arc<MemoryStore>,
    state: AppState,
}

impl Harness {
    fn new() -> Self {
        let store = MemoryStore::new();
        let state = AppState::build(Arc::clone(&store) as Arc<dyn GatewayStore>, None);
        Self { store, state }
    }

    fn app(&self) -> axum::Router {
        build_app(self.state.clone())
    }

    fn add_groq_provider(&self, id: &str, base_url: &str) {
        self.store.add_provider(Provider {
            id: ProviderId::from(id.to_string()),
            name: format!("TEST_{id}"),
            provider_type: ProviderType::Groq,
            base_url: Some(base_url.to_string()),
            enabled: true,
        });
        self.store.add_key(ProviderKey {
            id: ProviderKeyId::from(format!("{id}-key")),
            provider_id: ProviderId::from(id.to_string()),
            api_key: SecretString::from("sk-upstream".to_string()),
            base_url_override: None,
            organization: None,
            is_primary: true,
            enabled: true,
            account_group: None,
        });
    }

    fn add_mapping(&self, id: &str, alias: &str, provider: &str, model: &str, priority: i32) {
        self.store.add_mapping(ModelMapping {
            id: MappingId::from(id.to_string()),
            model_alias: alias.to_string(),
            provider_id: ProviderId::from(provider.to_string()),
            provider_model_id: model.to_string(),
            capabilities: CapabilityFlags::chat_only(),
            priority,
            enabled: true,
        });
    }

    fn add_cost(&self, mapping_ids: &[&str], rate: Decimal) {
        self.store.add_cost(ModelCost {
            name: "standard".to_string(),
            mapping_ids: mapping_ids
                .iter()
                .map(|m| MappingId::from(m.to_string()))
                .collect(),
            pricing_model: PricingModel::Standard,
            input_cost_per_million: rate,
            output_cost_per_million: rate,
            per_second_rate: None,
            per_character_rate: None,
            per_image_rate: None,
            priority: 0,
        });
    }

    fn add_caller(&self, token: &str, balance: Decimal, allowed: Vec<&str>) {
        self.store.add_group(VirtualKeyGroup {
            id: GroupId::from("g1".to_string()),
            name: "test group".to_string(),
            balance,
            lifetime_credits_added: balance,
            lifetime_spent: Decimal::ZERO,
            external_group_id: None,
        });
        self.store.add_virtual_key(VirtualKey {
            id: VirtualKeyId::from("vk1".to_string()),
            token_hash: hash_token(token),
            name: "test key".to_string(),
            allowed_models: allowed.into_iter().map(String::from).collect(),
            group_id: GroupId::from("g1".to_string()),
            expires_at: None,
            rpm_limit: None,
            rpd_limit: None,
            enabled: true,
            metadata: serde_json::Value::Null,
        });
    }

    async fn group_balance(&self) -> Decimal {
        self.store
            .get_group(&GroupId::from("g1".to_string()))
            .await
            .unwrap()
            .unwrap()
            .balance
    }
}

fn groq_chat_body(prompt_tokens: u32, completion_tokens: u32, text: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-upstream",
        "object": "chat.completion",
        "created": 1,
        "model": "gemma2-9b-it",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens
        }
    })
}

fn chat_request_body() -> Body {
    Body::from(
        serde_json::json!({
            "model": "gemma2-9b_T1",
            "messages": [{"role": "user", "content": "What is the history of France?"}]
        })
        .to_string(),
    )
}

fn post_chat(token: &str, body: Body) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(body)
        .unwrap()
}

#[tokio::test]
async fn groq_chat_happy_path_debits_group_exactly() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(groq_chat_body(9, 120, "France has a long history.")),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let harness = Harness::new();
    harness.add_groq_provider("groq", &upstream.uri());
    harness.add_mapping("m1", "gemma2-9b_T1", "groq", "gemma2-9b-it", 10);
    harness.add_cost(&["m1"], dec!(0.20));
    harness.add_caller("k_1", dec!(100.00), vec![]);

    let response = harness
        .app()
        .oneshot(post_chat("k_1", chat_request_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-request-id").is_some());

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["model"], "gemma2-9b_T1");
    assert!(
        !parsed["choices"][0]["message"]["content"]
            .as_str()
            .unwrap()
            .is_empty()
    );
    assert!(parsed["usage"]["prompt_tokens"].as_u64().unwrap() >= 7);
    assert!(parsed["usage"]["completion_tokens"].as_u64().unwrap() >= 1);

    // balance decreases by exactly (9 + 120) / 1e6 × 0.20.
    let expected_debit = Decimal::from(9 + 120) / dec!(1000000) * dec!(0.20);
    let balance = harness.group_balance().await;
    assert!((dec!(100.00) - expected_debit - balance).abs() <= dec!(0.000001));

    let group = harness
        .store
        .get_group(&GroupId::from("g1".to_string()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        group.lifetime_spent,
        group.lifetime_credits_added - group.balance
    );
}

#[tokio::test]
async fn allow_list_denial_is_403_authorization_required() {
    let harness = Harness::new();
    harness.add_caller("k_1", dec!(100.00), vec!["gpt-*"]);

    let body = Body::from(
        serde_json::json!({
            "model": "claude-3-opus",
            "messages": [{"role": "user", "content": "hi"}]
        })
        .to_string(),
    );
    let response = harness.app().oneshot(post_chat("k_1", body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["error"]["type"], "invalid_request_error");
    assert_eq!(parsed["error"]["code"], "authorization_required");
}

#[tokio::test]
async fn rate_limited_provider_fails_over_to_next_mapping() {
    let primary = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "2")
                .set_body_json(serde_json::json!({
                    "error": {"message": "Rate limit reached", "type": "rate_limit_error"}
                })),
        )
        .expect(1)
        .mount(&primary)
        .await;

    let secondary = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(groq_chat_body(7, 3, "Hello")))
        .expect(1)
        .mount(&secondary)
        .await;

    let harness = Harness::new();
    harness.add_groq_provider("groq-a", &primary.uri());
    harness.add_groq_provider("groq-b", &secondary.uri());
    harness.add_mapping("m1", "gemma2-9b_T1", "groq-a", "gemma2-9b-it", 20);
    harness.add_mapping("m2", "gemma2-9b_T1", "groq-b", "gemma2-9b-it", 10);
    harness.add_cost(&["m1", "m2"], dec!(0.20));
    harness.add_caller("k_1", dec!(100.00), vec![]);

    let response = harness
        .app()
        .oneshot(post_chat("k_1", chat_request_body()))
        .await
        .unwrap();
    // A single 200 reaches the caller despite the primary's 429.
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["choices"][0]["message"]["content"], "Hello");
}

#[tokio::test]
async fn exhausted_balance_is_403_insufficient_quota() {
    let upstream = MockServer::start().await;
    let harness = Harness::new();
    harness.add_groq_provider("groq", &upstream.uri());
    harness.add_mapping("m1", "gemma2-9b_T1", "groq", "gemma2-9b-it", 10);
    harness.add_cost(&["m1"], dec!(0.20));
    // Not even the reservation estimate fits.
    harness.add_caller("k_1", dec!(0.0000001), vec![]);

    let response = harness
        .app()
        .oneshot(post_chat("k_1", chat_request_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["error"]["code"], "insufficient_quota");
}

#[tokio::test]
async fn missing_bearer_is_401_unauthorized() {
    let harness = Harness::new();
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(chat_request_body())
        .unwrap();
    let response = harness.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["error"]["code"], "unauthorized");
}

#[tokio::test]
async fn max_tokens_beyond_context_window_is_invalid_parameter() {
    let harness = Harness::new();
    harness.add_caller("k_1", dec!(100.00), vec![]);
    harness.store.add_metadata(ModelMetadata {
        model_alias: "gemma2-9b_T1".to_string(),
        context_window: 1000,
        supports_chat: true,
        supports_vision: false,
        supports_tools: false,
        supports_streaming: true,
        supports_audio_transcription: false,
        supports_text_to_speech: false,
        supports_realtime_audio: false,
        supported_formats: vec![],
        supported_languages: vec![],
    });

    let body = Body::from(
        serde_json::json!({
            "model": "gemma2-9b_T1",
            "max_tokens": 2000,
            "messages": [{"role": "user", "content": "hi"}]
        })
        .to_string(),
    );
    let response = harness.app().oneshot(post_chat("k_1", body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["error"]["code"], "invalid_parameter");
    assert_eq!(parsed["error"]["param"], "max_tokens");
}

#[tokio::test]
async fn oversized_tts_input_is_rejected() {
    let harness = Harness::new();
    harness.add_caller("k_1", dec!(100.00), vec![]);

    let body = Body::from(
        serde_json::json!({
            "model": "tts-1_T1",
            "input": "x".repeat(10_001),
            "voice": "alloy"
        })
        .to_string(),
    );
    let request = Request::builder()
        .method("POST")
        .uri("/v1/audio/speech")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, "Bearer k_1")
        .body(body)
        .unwrap();
    let response = harness.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn model_listing_respects_allow_list() {
    let harness = Harness::new();
    harness.add_groq_provider("groq", "http://localhost:9");
    harness.add_mapping("m1", "gpt-4o_T1", "groq", "x", 1);
    harness.add_mapping("m2", "claude-3_T1", "groq", "y", 1);
    harness.add_caller("k_1", dec!(1.00), vec!["gpt-*"]);

    let request = Request::builder()
        .method("GET")
        .uri("/v1/models")
        .header(header::AUTHORIZATION, "Bearer k_1")
        .body(Body::empty())
        .unwrap();
    let response = harness.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let ids: Vec<&str> = parsed["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["gpt-4o_T1"]);
}

#[tokio::test]
async fn stream_cancellation_releases_reservation_and_bills_reported_usage() {
    let upstream = MockServer::start().await;
    // Ten content frames; usage only arrives on the terminal frame, which
    // the cancelled client never consumes.
    let mut body = String::new();
    for i in 0..10 {
        body.push_str(&format!(
            "data: {{\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gemma2-9b-it\",\"choices\":[{{\"index\":0,\"delta\":{{\"content\":\"tok{i} \"}},\"finish_reason\":null}}]}}\n\n"
        ));
    }
    body.push_str("data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gemma2-9b-it\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":10,\"total_tokens\":19}}\n\n");
    body.push_str("data: [DONE]\n\n");
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&upstream)
        .await;

    let harness = Harness::new();
    harness.add_groq_provider("groq", &upstream.uri());
    harness.add_mapping("m1", "gemma2-9b_T1", "groq", "gemma2-9b-it", 10);
    harness.add_cost(&["m1"], dec!(0.20));
    harness.add_caller("k_1", dec!(100.00), vec![]);

    let pipeline = Pipeline::new(harness.state.clone());
    let key = harness
        .state
        .keys
        .authenticate("k_1")
        .await
        .unwrap();

    let mut request: conduit_core::ChatRequest = serde_json::from_value(serde_json::json!({
        "model": "gemma2-9b_T1",
        "stream": true,
        "messages": [{"role": "user", "content": "What is the history of France?"}]
    }))
    .unwrap();
    request.stream = true;

    let mut stream = pipeline
        .chat_stream(&key, request, "trace-cancel")
        .await
        .unwrap();

    // Consume three of the ten chunks, then disconnect.
    for _ in 0..3 {
        let chunk = stream.next().await.unwrap().unwrap();
        assert!(!chunk.is_terminal());
    }
    drop(stream);

    // The drop guard settles asynchronously.
    let mut released = false;
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        if harness
            .state
            .ledger
            .outstanding(&GroupId::from("g1".to_string()))
            .await
            == Decimal::ZERO
        {
            released = true;
            break;
        }
    }
    assert!(released, "reservation was not released after cancellation");

    // No usage reached the client before the disconnect, so nothing is
    // billed.
    assert_eq!(harness.group_balance().await, dec!(100.00));

    let trace = harness.state.traces.get("trace-cancel").unwrap();
    assert_eq!(trace.status, TraceStatus::Cancelled);
}

#[tokio::test]
async fn health_reports_cache_mode() {
    let harness = Harness::new();
    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = harness.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["cache"]["distributed_configured"], false);
}

#[tokio::test]
async fn admin_traces_require_api_key() {
    let harness = Harness::new();
    let request = Request::builder()
        .method("GET")
        .uri("/admin/traces")
        .body(Body::empty())
        .unwrap();
    let response = harness.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
