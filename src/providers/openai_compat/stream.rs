use futures::StreamExt;
use tokio::sync::mpsc;

use super::models::StreamChunk;
use crate::providers::sse::SseDecoder;
use crate::providers::types::{ProviderError, StreamEvent};

/// Forward chat-completion chunks as [`StreamEvent`]s until `[DONE]`.
///
/// A body that closes without `[DONE]` just returns; the gateway decides
/// whether what arrived counts as a finished reply.
pub async fn relay_chunks(response: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();
    let mut tokens_in = None;
    let mut tokens_out = None;

    while let Some(read) = body.next().await {
        let bytes = match read {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error(ProviderError::from_transport(&e)))
                    .await;
                return;
            }
        };

        for payload in decoder.push(&bytes) {
            if payload.trim() == "[DONE]" {
                let _ = tx
                    .send(StreamEvent::Done {
                        tokens_in,
                        tokens_out,
                    })
                    .await;
                return;
            }

            let chunk: StreamChunk = match serde_json::from_str(&payload) {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::warn!("Skipping unparseable completion chunk: {}", e);
                    continue;
                }
            };
            // Usage arrives on its own trailing chunk with empty choices
            if let Some(usage) = chunk.usage {
                tokens_in = usage.prompt_tokens.or(tokens_in);
                tokens_out = usage.completion_tokens.or(tokens_out);
            }

            for mut choice in chunk.choices.into_iter().take(1) {
                let mut events: Vec<StreamEvent> = choice
                    .delta
                    .artifacts()
                    .into_iter()
                    .map(StreamEvent::Artifact)
                    .collect();
                if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                    events.insert(0, StreamEvent::Token(text));
                }
                for event in events {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
