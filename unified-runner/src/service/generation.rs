//! Chat generation over the hot-swappable model.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use unified_ai_common::{
    chat::new_completion_id, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse,
    ChatMessage,
};

use crate::accel::AcceleratorGate;
use crate::error::{Error, Result};
use crate::model::{LoadedModel, SamplingParams};

const STREAM_CHANNEL_CAPACITY: usize = 32;

/// One event of a streamed completion: a content chunk, or the single
/// terminal marker after the last chunk.
#[derive(Debug)]
pub enum StreamEvent {
    Chunk(ChatCompletionChunk),
    Done,
}

pub type GenerationStream = ReceiverStream<StreamEvent>;

/// Serves chat completions against whichever model the request names,
/// swapping the resident model when necessary. Every step happens under the
/// accelerator gate; for streams the gate is held until the last chunk.
#[derive(Clone)]
pub struct GenerationService {
    gate: AcceleratorGate,
}

impl GenerationService {
    pub fn new(gate: AcceleratorGate) -> Self {
        Self { gate }
    }

    /// Generate the full response in one piece.
    pub async fn complete(&self, request: &ChatCompletionRequest) -> Result<ChatCompletionResponse> {
        let params = SamplingParams::from(request);

        let mut registry = self.gate.acquire().await;
        let model = registry.ensure_loaded(&request.model).await?;
        let prompt = render_prompt(model, &request.messages).await;

        let mut deltas = model
            .generate(&prompt, &params)
            .await
            .map_err(as_generation)?;
        let mut content = String::new();
        while let Some(delta) = deltas.next().await {
            content.push_str(&delta.map_err(as_generation)?);
        }

        Ok(ChatCompletionResponse::new(request.model.clone(), content))
    }

    /// Open a streamed completion.
    ///
    /// The gate is acquired and the model swapped (if needed) before this
    /// returns, so load failures surface as request-level errors. The guard
    /// then moves into the producer task and is not released until the
    /// stream is exhausted or its consumer goes away; a model swap requested
    /// meanwhile waits its turn.
    pub async fn stream(&self, request: ChatCompletionRequest) -> Result<GenerationStream> {
        let params = SamplingParams::from(&request);

        let mut registry = self.gate.acquire().await;
        let model = registry.ensure_loaded(&request.model).await?;
        let prompt = render_prompt(model, &request.messages).await;
        let mut deltas = model
            .generate(&prompt, &params)
            .await
            .map_err(as_generation)?;

        let stream_id = new_completion_id();
        let model_identity = request.model;
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            // The guard rides in here: the accelerator stays held until the
            // stream ends, on every exit path.
            let _registry = registry;

            while let Some(delta) = deltas.next().await {
                match delta {
                    Ok(text) => {
                        let chunk = ChatCompletionChunk::delta(&stream_id, &model_identity, text);
                        if tx.send(StreamEvent::Chunk(chunk)).await.is_err() {
                            // Consumer disconnected; stop generating.
                            return;
                        }
                    }
                    Err(e) => {
                        // Partial output stands; end the stream early.
                        tracing::warn!(id = %stream_id, error = %e, "generation failed mid-stream");
                        break;
                    }
                }
            }

            let _ = tx.send(StreamEvent::Done).await;
        });

        Ok(ReceiverStream::new(rx))
    }
}

/// Render messages into a single prompt: the model's own chat template when
/// it has one, else fixed `role: content` lines ending in an assistant cue.
async fn render_prompt(model: &dyn LoadedModel, messages: &[ChatMessage]) -> String {
    if let Some(prompt) = model.apply_chat_template(messages).await {
        return prompt;
    }

    let mut prompt = String::new();
    for message in messages {
        prompt.push_str(&message.role);
        prompt.push_str(": ");
        prompt.push_str(&message.content);
        prompt.push('\n');
    }
    prompt.push_str("assistant:");
    prompt
}

fn as_generation(e: Error) -> Error {
    match e {
        Error::Generation(_) => e,
        other => Error::Generation(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::accel::AcceleratorGate;
    use crate::model::ModelRegistry;
    use crate::test_util::StubBackend;

    fn service(backend: Arc<StubBackend>) -> GenerationService {
        let (registry, _watch_rx) = ModelRegistry::new(backend);
        GenerationService::new(AcceleratorGate::new(registry))
    }

    fn request(model: &str, stream: bool) -> ChatCompletionRequest {
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
    async fn test_complete_concatenates_deltas() {
        let backend = Arc::new(StubBackend::with_deltas(vec!["Hello", " there"]));
        let service = service(backend.clone());

        let response = service.complete(&request("m1", false)).await.unwrap();
        assert_eq!(response.content(), Some("Hello there"));
        assert_eq!(response.model, "m1");
        assert_eq!(
            response.choices[0].finish_reason,
            Some("stop".to_string())
        );
        assert_eq!(backend.loads_of("m1"), 1);
    }

    #[tokio::test]
    async fn test_fallback_prompt_rendering() {
        let backend = Arc::new(StubBackend::with_deltas(vec!["ok"]));
        let service = service(backend.clone());

        let mut req = request("m1", false);
        req.messages = vec![
            ChatMessage::new("system", "be brief"),
            ChatMessage::new("user", "hi"),
        ];
        service.complete(&req).await.unwrap();

        assert_eq!(
            backend.prompts(),
            vec!["system: be brief\nuser: hi\nassistant:".to_string()]
        );
    }

    #[tokio::test]
    async fn test_template_preferred_over_fallback() {
        let backend =
            Arc::new(StubBackend::with_deltas(vec!["ok"]).with_template("<templated>"));
        let service = service(backend.clone());

        service.complete(&request("m1", false)).await.unwrap();
        assert_eq!(backend.prompts(), vec!["<templated>".to_string()]);
    }

    #[tokio::test]
    async fn test_default_sampling_params_applied() {
        let backend = Arc::new(StubBackend::with_deltas(vec!["ok"]));
        let service = service(backend.clone());

        service.complete(&request("m1", false)).await.unwrap();

        let params = backend.params();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].max_tokens, 4096);
        assert_eq!(params[0].temperature, 0.1);
        assert_eq!(params[0].top_p, 1.0);
    }

    #[tokio::test]
    async fn test_mid_generation_error_fails_request() {
        let backend =
            Arc::new(StubBackend::with_deltas(vec!["part"]).with_trailing_error("backend died"));
        let service = service(backend);

        let err = service.complete(&request("m1", false)).await.unwrap_err();
        assert!(matches!(err, Error::Generation(_)));
    }

    #[tokio::test]
    async fn test_load_failure_surfaces_before_stream() {
        let backend = Arc::new(StubBackend::failing_loads());
        let service = service(backend);

        let err = service.stream(request("broken", true)).await.unwrap_err();
        assert!(matches!(err, Error::ModelLoad { .. }));
    }

    #[tokio::test]
    async fn test_stream_chunks_share_id_and_end_with_done() {
        let backend = Arc::new(StubBackend::with_deltas(vec!["Hello", " there"]));
        let service = service(backend);

        let mut events = service.stream(request("m1", true)).await.unwrap();
        let mut chunks = Vec::new();
        let mut done = 0;
        while let Some(event) = events.next().await {
            match event {
                StreamEvent::Chunk(chunk) => chunks.push(chunk),
                StreamEvent::Done => done += 1,
            }
        }

        assert_eq!(done, 1);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].id, chunks[1].id);
        assert_eq!(chunks[0].model, "m1");
        assert_eq!(
            chunks[0].choices[0].delta.content.as_deref(),
            Some("Hello")
        );
        assert!(chunks.iter().all(|c| c.choices[0].finish_reason.is_none()));
    }

    #[tokio::test]
    async fn test_mid_stream_error_ends_stream_after_partial_output() {
        let backend =
            Arc::new(StubBackend::with_deltas(vec!["part"]).with_trailing_error("backend died"));
        let service = service(backend);

        let mut events = service.stream(request("m1", true)).await.unwrap();
        let mut chunks = 0;
        let mut done = 0;
        while let Some(event) = events.next().await {
            match event {
                StreamEvent::Chunk(_) => chunks += 1,
                StreamEvent::Done => done += 1,
            }
        }

        assert_eq!(chunks, 1);
        assert_eq!(done, 1);
    }
}
