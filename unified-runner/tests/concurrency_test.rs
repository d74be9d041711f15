//! Accelerator serialization properties: mutual exclusion, swap ordering,
//! stream atomicity, and cancellation.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use unified_runner::config::{ApiConfig, Config, EmbeddingConfig, LlamaConfig};
use unified_runner::service::StreamEvent;
use unified_runner::state::AppState;
use unified_runner::test_util::{ActivityMeter, StubBackend, StubEncoder};
use unified_ai_common::{ChatCompletionRequest, ChatMessage};

fn test_config() -> Config {
    Config {
        api: ApiConfig::default(),
        llama: LlamaConfig::default(),
        embedding: EmbeddingConfig::default(),
    }
}

fn chat_request(model: &str, stream: bool) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: model.to_string(),
        messages: vec![ChatMessage::new("user", "hi")],
        max_tokens: None,
        temperature: None,
        top_p: None,
        stream: Some(stream),
    }
}

#[tokio::test]
async fn test_mutual_exclusion_under_concurrent_load() {
    let meter = ActivityMeter::new();
    let backend = Arc::new(
        StubBackend::with_deltas(vec!["a", "b", "c"]).with_meter(meter.clone()),
    );
    let encoder = Arc::new(StubEncoder::new().with_meter(meter.clone()));
    let state = Arc::new(AppState::new(test_config(), backend, encoder));

    let mut tasks = Vec::new();
    for i in 0..8 {
        let state = state.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                let model = if i % 4 == 0 { "m1" } else { "m2" };
                state.generation.complete(&chat_request(model, false)).await.unwrap();
            } else {
                state.embedding.embed(&["text".to_string()]).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // Never more than one operation inside the accelerator at once.
    assert_eq!(meter.high_water(), 1);
}

#[tokio::test]
async fn test_swap_correctness_a_b_a() {
    let backend = Arc::new(StubBackend::with_deltas(vec!["x"]));
    let encoder = Arc::new(StubEncoder::new());
    let state = Arc::new(AppState::new(test_config(), backend.clone(), encoder));

    state.generation.complete(&chat_request("a", false)).await.unwrap();
    state.generation.complete(&chat_request("a", false)).await.unwrap();
    state.generation.complete(&chat_request("b", false)).await.unwrap();
    state.generation.complete(&chat_request("a", false)).await.unwrap();

    // Repeat request for the resident model is a no-op fast path.
    assert_eq!(backend.loads_of("a"), 2);
    assert_eq!(backend.loads_of("b"), 1);
    assert_eq!(backend.total_loads(), 3);
}

#[tokio::test]
async fn test_stream_atomicity_under_concurrent_swap() {
    let pacing = Arc::new(Semaphore::new(0));
    let backend = Arc::new(
        StubBackend::with_deltas(vec!["c1", "c2", "c3"]).paced(pacing.clone()),
    );
    let encoder = Arc::new(StubEncoder::new());
    let state = Arc::new(AppState::new(test_config(), backend.clone(), encoder));

    // Stream for model A is open: the gate is held even though no chunk has
    // been produced yet.
    let mut events = state.generation.stream(chat_request("a", true)).await.unwrap();

    // A request for model B arrives mid-stream.
    let swap = {
        let state = state.clone();
        tokio::spawn(async move {
            state.generation.complete(&chat_request("b", false)).await.unwrap()
        })
    };

    // B's load must not begin while A's stream is live.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!swap.is_finished());
    assert_eq!(backend.loads_of("b"), 0);
    assert_eq!(backend.total_loads(), 1);

    // Let both generations produce their deltas and drain A's stream.
    pacing.add_permits(6);
    let mut chunks = Vec::new();
    while let Some(event) = events.next().await {
        if let StreamEvent::Chunk(chunk) = event {
            chunks.push(chunk);
        }
    }

    // Every chunk of A's stream came from the model loaded for A.
    assert_eq!(chunks.len(), 3);
    assert!(chunks.iter().all(|c| c.model == "a"));

    let response = timeout(Duration::from_secs(5), swap)
        .await
        .expect("swap must proceed once the stream ends")
        .unwrap();
    assert_eq!(response.model, "b");
    assert_eq!(backend.loads_of("b"), 1);
}

#[tokio::test]
async fn test_cancellation_releases_gate() {
    let pacing = Arc::new(Semaphore::new(0));
    let backend = Arc::new(
        StubBackend::with_deltas(vec!["c1", "c2", "c3", "c4"]).paced(pacing.clone()),
    );
    let encoder = Arc::new(StubEncoder::new());
    let state = Arc::new(AppState::new(test_config(), backend, encoder));

    let mut events = state.generation.stream(chat_request("a", true)).await.unwrap();

    // Consume 2 of 4 chunks, then disconnect.
    pacing.add_permits(2);
    for _ in 0..2 {
        match timeout(Duration::from_secs(5), events.next()).await.unwrap() {
            Some(StreamEvent::Chunk(_)) => {}
            other => panic!("expected a chunk, got {:?}", other),
        }
    }
    drop(events);

    // The producer notices on its next step and lets the guard go.
    pacing.add_permits(8);

    // An unrelated embedding request must proceed without deadlock.
    let vectors = timeout(
        Duration::from_secs(5),
        state.embedding.embed(&["after cancel".to_string()]),
    )
    .await
    .expect("embedding must not deadlock after a cancelled stream")
    .unwrap();
    assert_eq!(vectors.len(), 1);
}

#[tokio::test]
async fn test_models_listing_answers_while_stream_holds_gate() {
    let pacing = Arc::new(Semaphore::new(0));
    let backend = Arc::new(
        StubBackend::with_deltas(vec!["c1", "c2"]).paced(pacing.clone()),
    );
    let encoder = Arc::new(StubEncoder::new());
    let state = Arc::new(AppState::new(test_config(), backend, encoder));

    let mut events = state.generation.stream(chat_request("a", true)).await.unwrap();

    // The stream is holding the gate, yet the advertised identity is
    // readable immediately.
    let advertised = state.advertised_model.borrow().clone();
    assert_eq!(advertised.as_deref(), Some("a"));

    pacing.add_permits(2);
    while events.next().await.is_some() {}
}
