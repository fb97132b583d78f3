#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use creditchat::config::AppConfig;
use creditchat::models::{AuthContext, Conversation, UserAccount, UserRole};
use creditchat::providers::{
    AiProvider, ChatRequest, ChatResponse, ProviderError, ProviderRouter, StreamEvent,
};
use creditchat::services::conversation::CreateConversation;
use creditchat::services::{ChatEvent, Database};
use creditchat::App;

pub enum Ending {
    Done,
    Fail(ProviderError),
    Hang,
}

/// In-process provider replaying a fixed script and recording what it was sent.
pub struct ScriptedProvider {
    pub tokens: Vec<String>,
    pub ending: Ending,
    pub batch: Result<String, ProviderError>,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn replying(text: &str) -> Self {
        Self {
            tokens: Vec::new(),
            ending: Ending::Done,
            batch: Ok(text.to_string()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn streaming(tokens: &[&str], ending: Ending) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            ending,
            batch: Ok(tokens.concat()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(err: ProviderError) -> Self {
        Self {
            tokens: Vec::new(),
            ending: Ending::Fail(err.clone()),
            batch: Err(err),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn last_request(&self) -> ChatRequest {
        self.requests.lock().unwrap().last().cloned().expect("no request recorded")
    }
}

#[async_trait]
impl AiProvider for ScriptedProvider {
    fn provider_id(&self) -> &str {
        "scripted"
    }

    async fn send_message(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        let content = self.batch.clone()?;
        Ok(ChatResponse {
            content,
            model: request.model,
            tokens_in: Some(7),
            tokens_out: Some(3),
            artifacts: Vec::new(),
        })
    }

    async fn stream_message(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        self.requests.lock().unwrap().push(request);
        for token in &self.tokens {
            if tx.send(StreamEvent::Token(token.clone())).await.is_err() {
                return Ok(());
            }
            tokio::task::yield_now().await;
        }
        match &self.ending {
            Ending::Done => {
                let _ = tx
                    .send(StreamEvent::Done {
                        tokens_in: Some(7),
                        tokens_out: Some(2),
                    })
                    .await;
            }
            Ending::Fail(e) => {
                let _ = tx.send(StreamEvent::Error(e.clone())).await;
            }
            Ending::Hang => tokio::time::sleep(Duration::from_secs(30)).await,
        }
        Ok(())
    }
}

pub struct Harness {
    pub app: App,
    pub db: Database,
    pub provider: Arc<ScriptedProvider>,
}

/// Models served by the scripted provider:
/// `stream-10` (streams, documents), `vision-10` (streams, images),
/// `batch-10` (no streaming).
pub async fn harness(provider: ScriptedProvider) -> Harness {
    harness_with(provider, |_| {}).await
}

/// [`harness`] with a hook to adjust the configuration before wiring.
pub async fn harness_with(provider: ScriptedProvider, tweak: impl FnOnce(&mut AppConfig)) -> Harness {
    let db = Database::new_in_memory().unwrap();
    db.conn_ref()
        .lock()
        .unwrap()
        .execute_batch(
            "INSERT INTO ai_models (name, provider, credits_per_chat, stream_enabled, image_upload_enabled, document_upload_enabled)
             VALUES ('stream-10', 'scripted', 10, 1, 0, 1),
                    ('vision-10', 'scripted', 10, 1, 1, 0),
                    ('batch-10', 'scripted', 10, 0, 0, 0);",
        )
        .unwrap();

    let provider = Arc::new(provider);
    let mut router = ProviderRouter::new();
    router.register(provider.clone());

    let mut config = AppConfig::default();
    config.chat.checkpoint_interval_ms = 0;
    config.chat.stream_idle_timeout_secs = 30;
    tweak(&mut config);

    Harness {
        app: App::new(config, db.clone(), router),
        db,
        provider,
    }
}

pub fn auth(user_id: &str) -> AuthContext {
    AuthContext {
        user_id: user_id.to_string(),
        role: UserRole::User,
        group_id: None,
    }
}

pub async fn add_user(db: &Database, id: &str, credits: i64) -> UserAccount {
    let mut user = UserAccount::new(id);
    user.credits = credits;
    db.insert_user(&user).await.unwrap();
    user
}

pub async fn balance(db: &Database, id: &str) -> i64 {
    db.get_user(id).await.unwrap().unwrap().credits
}

pub async fn new_conversation(app: &App, user_id: &str, model: &str) -> Conversation {
    app.conversations
        .create(
            &auth(user_id),
            CreateConversation {
                model: model.to_string(),
                ..CreateConversation::default()
            },
        )
        .await
        .unwrap()
}

pub async fn drain(mut rx: mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

/// Poll until `check` holds or a second passes.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
