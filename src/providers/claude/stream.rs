use futures::StreamExt;
use tokio::sync::mpsc;

use super::models::{Delta, StreamPayload};
use crate::providers::sse::SseDecoder;
use crate::providers::types::{ProviderError, StreamEvent};

/// Forward Messages API stream payloads as [`StreamEvent`]s until `message_stop`.
pub async fn relay_events(response: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
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

        for data in decoder.push(&bytes) {
            let payload: StreamPayload = match serde_json::from_str(&data) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!("Skipping unparseable Claude stream payload: {}", e);
                    continue;
                }
            };

            let event = match payload {
                StreamPayload::MessageStart { message } => {
                    tokens_in = message.usage.and_then(|u| u.input_tokens);
                    continue;
                }
                StreamPayload::MessageDelta { usage } => {
                    tokens_out = usage.and_then(|u| u.output_tokens).or(tokens_out);
                    continue;
                }
                StreamPayload::ContentBlockDelta {
                    delta: Delta::TextDelta { text },
                } => StreamEvent::Token(text),
                StreamPayload::MessageStop => StreamEvent::Done {
                    tokens_in,
                    tokens_out,
                },
                StreamPayload::Error { error } => StreamEvent::Error(error.into_provider_error()),
                StreamPayload::ContentBlockDelta { .. } | StreamPayload::Other => continue,
            };

            let terminal = !matches!(event, StreamEvent::Token(_));
            if tx.send(event).await.is_err() || terminal {
                return;
            }
        }
    }
}
