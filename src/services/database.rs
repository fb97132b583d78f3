use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tokio::task;

use crate::models::{
    Artifact, Attachment, AvailableModel, CombinedContent, Conversation, LedgerEntry, LedgerLink,
    LedgerReason, Message, MessageStatus, PromptSource, Role, UserAccount, UserRole,
};

/// Outcome of the conditional debit behind a credit reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved { balance_after: i64 },
    Insufficient { available: i64 },
}

/// Terminal write for a message row.
#[derive(Debug, Clone)]
pub struct TerminalWrite {
    pub message_id: String,
    pub status: MessageStatus,
    pub content: String,
    pub tokens: i64,
    pub artifacts: Vec<Artifact>,
}

/// Credit entry written in the same transaction as a terminal write.
#[derive(Debug, Clone)]
pub struct CreditRefund {
    pub user_id: String,
    pub amount: i64,
    pub link: LedgerLink,
}

/// A `streaming` row forced to `failed` by the recovery scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredStream {
    pub message_id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub refunded: i64,
}

/// Rows removed by a message-pair deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletedPair {
    pub messages: i64,
    pub tokens: i64,
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, tokens, file_id, artifacts, model, status, parent_message_id, reserved_credits, created_at, updated_at";

const CONVERSATION_COLUMNS: &str = "id, user_id, title, model, system_prompt_id, module_combination_id, system_prompt, context_length, temperature, priority, message_count, total_tokens, created_at, last_message_at, cleared_at";

const USER_COLUMNS: &str =
    "id, role, group_id, credits, credits_expire_at, token_quota, tokens_used, created_at";

/// Fixed-width UTC timestamps so stored values also compare correctly as text.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

#[derive(Debug, Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn conn_ref(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }

    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;

        Ok(db)
    }

    /// Create an in-memory database (used for testing)
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| anyhow!("database connection mutex poisoned"))?;
            f(&mut conn)
        })
        .await?
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            );",
        )?;

        let version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if version < 1 {
            conn.execute_batch(
                "CREATE TABLE users (
                    id TEXT PRIMARY KEY,
                    role TEXT NOT NULL DEFAULT 'user',
                    group_id TEXT,
                    credits BIGINT NOT NULL DEFAULT 0,
                    credits_expire_at TEXT,
                    token_quota BIGINT,
                    tokens_used BIGINT NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE credit_ledger (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id TEXT NOT NULL,
                    delta BIGINT NOT NULL,
                    balance_after BIGINT NOT NULL,
                    reason TEXT NOT NULL,
                    model TEXT,
                    conversation_id TEXT,
                    memo TEXT,
                    created_at TEXT NOT NULL,
                    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
                );

                CREATE TABLE conversations (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    title TEXT NOT NULL,
                    model TEXT NOT NULL,
                    system_prompt_id TEXT,
                    module_combination_id TEXT,
                    system_prompt TEXT,
                    context_length INTEGER NOT NULL DEFAULT 20,
                    temperature REAL NOT NULL DEFAULT 0.7,
                    priority INTEGER NOT NULL DEFAULT 0,
                    message_count BIGINT NOT NULL DEFAULT 0,
                    total_tokens BIGINT NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    last_message_at TEXT,
                    cleared_at TEXT,
                    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
                );

                CREATE TABLE messages (
                    id TEXT PRIMARY KEY,
                    conversation_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    tokens BIGINT NOT NULL DEFAULT 0,
                    file_id TEXT,
                    artifacts TEXT,
                    model TEXT,
                    status TEXT NOT NULL,
                    parent_message_id TEXT,
                    reserved_credits BIGINT NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
                );

                CREATE INDEX idx_ledger_user ON credit_ledger(user_id);
                CREATE INDEX idx_conversations_user ON conversations(user_id);
                CREATE INDEX idx_messages_conversation ON messages(conversation_id, created_at);
                CREATE INDEX idx_messages_status ON messages(status);

                INSERT INTO schema_version (version) VALUES (1);",
            )?;
        }

        if version < 2 {
            conn.execute_batch(
                "CREATE TABLE ai_models (
                    name TEXT PRIMARY KEY,
                    provider TEXT NOT NULL,
                    credits_per_chat BIGINT NOT NULL DEFAULT 0,
                    stream_enabled INTEGER NOT NULL DEFAULT 1,
                    image_upload_enabled INTEGER NOT NULL DEFAULT 0,
                    document_upload_enabled INTEGER NOT NULL DEFAULT 0,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    sort_order INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE model_group_access (
                    model_name TEXT NOT NULL,
                    group_id TEXT NOT NULL,
                    PRIMARY KEY (model_name, group_id),
                    FOREIGN KEY (model_name) REFERENCES ai_models(name) ON DELETE CASCADE
                );

                CREATE TABLE system_prompts (
                    id TEXT PRIMARY KEY,
                    content TEXT NOT NULL,
                    is_active INTEGER NOT NULL DEFAULT 1
                );

                CREATE TABLE prompt_modules (
                    id TEXT PRIMARY KEY,
                    user_id TEXT,
                    kind TEXT NOT NULL,
                    content TEXT NOT NULL,
                    is_active INTEGER NOT NULL DEFAULT 1
                );

                CREATE TABLE module_combinations (
                    id TEXT PRIMARY KEY,
                    user_id TEXT,
                    name TEXT NOT NULL
                );

                CREATE TABLE module_combination_items (
                    combination_id TEXT NOT NULL,
                    module_id TEXT NOT NULL,
                    position INTEGER NOT NULL,
                    PRIMARY KEY (combination_id, module_id),
                    FOREIGN KEY (combination_id) REFERENCES module_combinations(id) ON DELETE CASCADE,
                    FOREIGN KEY (module_id) REFERENCES prompt_modules(id) ON DELETE CASCADE
                );

                CREATE TABLE attachments (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    mime_type TEXT NOT NULL,
                    filename TEXT,
                    url TEXT NOT NULL,
                    extracted_content TEXT,
                    created_at TEXT NOT NULL
                );

                UPDATE schema_version SET version = 2;",
            )?;
        }

        if version < 3 {
            conn.execute_batch(
                "CREATE TABLE usage_daily (
                    day TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    messages BIGINT NOT NULL DEFAULT 0,
                    tokens BIGINT NOT NULL DEFAULT 0,
                    PRIMARY KEY (day, user_id)
                );

                CREATE TABLE model_usage_daily (
                    day TEXT NOT NULL,
                    model TEXT NOT NULL,
                    requests BIGINT NOT NULL DEFAULT 0,
                    tokens BIGINT NOT NULL DEFAULT 0,
                    PRIMARY KEY (day, model)
                );

                UPDATE schema_version SET version = 3;",
            )?;
        }

        Ok(())
    }

    // --- Users ---

    pub async fn insert_user(&self, user: &UserAccount) -> Result<()> {
        let user = user.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO users (id, role, group_id, credits, credits_expire_at, token_quota, tokens_used, created_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?7)",
                params![
                    user.id,
                    user.role.as_str(),
                    user.group_id,
                    user.credits_expire_at.as_ref().map(ts),
                    user.token_quota,
                    user.tokens_used,
                    ts(&user.created_at),
                ],
            )?;
            // Opening balances go through the ledger like any other credit movement
            if user.credits != 0 {
                let tx = conn.transaction()?;
                apply_credit_delta(
                    &tx,
                    &user.id,
                    user.credits,
                    LedgerReason::Grant,
                    &LedgerLink {
                        memo: Some("opening balance".to_string()),
                        ..LedgerLink::default()
                    },
                )?;
                tx.commit()?;
            }
            Ok(())
        })
        .await
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<UserAccount>> {
        let id = id.to_string();
        self.run(move |conn| {
            let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
            let result = conn
                .query_row(&sql, params![id], |row| Ok(Self::row_to_user(row)))
                .optional()?;
            result.transpose()
        })
        .await
    }

    pub async fn add_tokens_used(&self, user_id: &str, tokens: i64) -> Result<()> {
        let user_id = user_id.to_string();
        self.run(move |conn| {
            conn.execute(
                "UPDATE users SET tokens_used = tokens_used + ?1 WHERE id = ?2",
                params![tokens, user_id],
            )?;
            Ok(())
        })
        .await
    }

    // --- Credit ledger ---

    pub async fn grant_credits(&self, user_id: &str, amount: i64, link: LedgerLink) -> Result<i64> {
        let user_id = user_id.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let balance = apply_credit_delta(&tx, &user_id, amount, LedgerReason::Grant, &link)?;
            tx.commit()?;
            Ok(balance)
        })
        .await
    }

    /// Debit `amount` only if the balance covers it. The floor check and the
    /// decrement are one statement, so concurrent reservations cannot overdraw.
    pub async fn reserve_credits(
        &self,
        user_id: &str,
        amount: i64,
        link: LedgerLink,
    ) -> Result<ReserveOutcome> {
        let user_id = user_id.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE users SET credits = credits - ?1 WHERE id = ?2 AND credits >= ?1",
                params![amount, user_id],
            )?;
            if changed == 0 {
                let available: Option<i64> = tx
                    .query_row(
                        "SELECT credits FROM users WHERE id = ?1",
                        params![user_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let available = available.ok_or_else(|| anyhow!("Unknown user: {}", user_id))?;
                return Ok(ReserveOutcome::Insufficient { available });
            }
            let balance_after = insert_ledger_row(
                &tx,
                &user_id,
                -amount,
                LedgerReason::ChatReserve,
                &link,
            )?;
            tx.commit()?;
            Ok(ReserveOutcome::Reserved { balance_after })
        })
        .await
    }

    pub async fn refund_credits(
        &self,
        user_id: &str,
        amount: i64,
        reason: LedgerReason,
        link: LedgerLink,
    ) -> Result<i64> {
        let user_id = user_id.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let balance = apply_credit_delta(&tx, &user_id, amount, reason, &link)?;
            tx.commit()?;
            Ok(balance)
        })
        .await
    }

    pub async fn list_ledger(&self, user_id: &str) -> Result<Vec<LedgerEntry>> {
        let user_id = user_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, delta, balance_after, reason, model, conversation_id, memo, created_at
                 FROM credit_ledger WHERE user_id = ?1 ORDER BY id ASC",
            )?;
            let entries = stmt
                .query_map(params![user_id], |row| Ok(Self::row_to_ledger_entry(row)))?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
        .await
    }

    /// `(granted, net_spent)` over the user's whole ledger.
    pub async fn credit_totals(&self, user_id: &str) -> Result<(i64, i64)> {
        let user_id = user_id.to_string();
        self.run(move |conn| {
            let totals = conn.query_row(
                "SELECT
                    COALESCE(SUM(CASE WHEN reason = 'grant' THEN delta ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN reason <> 'grant' THEN -delta ELSE 0 END), 0)
                 FROM credit_ledger WHERE user_id = ?1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(totals)
        })
        .await
    }

    // --- Conversation CRUD ---

    pub async fn insert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let conv = conversation.clone();
        self.run(move |conn| {
            let (prompt_id, combination_id, inline) = conv.prompt.to_columns();
            conn.execute(
                "INSERT INTO conversations (id, user_id, title, model, system_prompt_id, module_combination_id, system_prompt, context_length, temperature, priority, message_count, total_tokens, created_at, last_message_at, cleared_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    conv.id,
                    conv.user_id,
                    conv.title,
                    conv.model,
                    prompt_id,
                    combination_id,
                    inline,
                    conv.context_length,
                    conv.temperature as f64,
                    conv.priority,
                    conv.message_count,
                    conv.total_tokens,
                    ts(&conv.created_at),
                    conv.last_message_at.as_ref().map(ts),
                    conv.cleared_at.as_ref().map(ts),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let id = id.to_string();
        self.run(move |conn| {
            let sql = format!("SELECT {} FROM conversations WHERE id = ?1", CONVERSATION_COLUMNS);
            let result = conn
                .query_row(&sql, params![id], |row| Ok(Self::row_to_conversation(row)))
                .optional()?;
            result.transpose()
        })
        .await
    }

    pub async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let user_id = user_id.to_string();
        self.run(move |conn| {
            let sql = format!(
                "SELECT {} FROM conversations WHERE user_id = ?1
                 ORDER BY priority DESC, COALESCE(last_message_at, created_at) DESC",
                CONVERSATION_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let conversations = stmt
                .query_map(params![user_id], |row| Ok(Self::row_to_conversation(row)))?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;
            Ok(conversations)
        })
        .await
    }

    pub async fn update_conversation_settings(&self, conversation: &Conversation) -> Result<()> {
        let conv = conversation.clone();
        self.run(move |conn| {
            let (prompt_id, combination_id, inline) = conv.prompt.to_columns();
            conn.execute(
                "UPDATE conversations SET title = ?1, model = ?2, system_prompt_id = ?3, module_combination_id = ?4,
                    system_prompt = ?5, context_length = ?6, temperature = ?7, priority = ?8
                 WHERE id = ?9",
                params![
                    conv.title,
                    conv.model,
                    prompt_id,
                    combination_id,
                    inline,
                    conv.context_length,
                    conv.temperature as f64,
                    conv.priority,
                    conv.id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn update_conversation_title(&self, id: &str, title: &str) -> Result<()> {
        let id = id.to_string();
        let title = title.to_string();
        self.run(move |conn| {
            conn.execute(
                "UPDATE conversations SET title = ?1 WHERE id = ?2",
                params![title, id],
            )?;
            Ok(())
        })
        .await
    }

    /// Apply a turn's aggregate deltas. Negative deltas never take counters below zero.
    pub async fn record_conversation_activity(
        &self,
        id: &str,
        messages_delta: i64,
        tokens_delta: i64,
        touch: bool,
    ) -> Result<()> {
        let id = id.to_string();
        self.run(move |conn| {
            conn.execute(
                "UPDATE conversations SET
                    message_count = MAX(message_count + ?1, 0),
                    total_tokens = MAX(total_tokens + ?2, 0),
                    last_message_at = CASE WHEN ?3 THEN ?4 ELSE last_message_at END
                 WHERE id = ?5",
                params![messages_delta, tokens_delta, touch, ts(&Utc::now()), id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn clear_conversation(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let id = id.to_string();
        self.run(move |conn| {
            conn.execute(
                "UPDATE conversations SET message_count = 0, total_tokens = 0, cleared_at = ?1 WHERE id = ?2",
                params![ts(&at), id],
            )?;
            Ok(())
        })
        .await
    }

    /// Delete a conversation and its messages. Credits still held by open
    /// placeholders are refunded first; their ids are returned so the caller can
    /// stop the streams.
    pub async fn delete_conversation(&self, id: &str) -> Result<Vec<String>> {
        let id = id.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let open: Vec<(String, String, i64, Option<String>)> = {
                let mut stmt = tx.prepare(
                    "SELECT m.id, c.user_id, m.reserved_credits, m.model
                     FROM messages m JOIN conversations c ON c.id = m.conversation_id
                     WHERE m.conversation_id = ?1 AND m.status IN ('pending', 'streaming')",
                )?;
                let rows = stmt
                    .query_map(params![id], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };
            for (message_id, user_id, reserved, model) in &open {
                if *reserved > 0 {
                    apply_credit_delta(
                        &tx,
                        user_id,
                        *reserved,
                        LedgerReason::ChatRefund,
                        &LedgerLink {
                            model: model.clone(),
                            conversation_id: Some(id.clone()),
                            memo: Some(format!("conversation deleted during {}", message_id)),
                        },
                    )?;
                }
            }
            tx.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
            tx.commit()?;
            Ok(open.into_iter().map(|(message_id, ..)| message_id).collect())
        })
        .await
    }

    // --- Message CRUD ---

    pub async fn insert_message(&self, message: &Message) -> Result<()> {
        let msg = message.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO messages (id, conversation_id, role, content, tokens, file_id, artifacts, model, status, parent_message_id, reserved_credits, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    msg.id,
                    msg.conversation_id,
                    msg.role.as_str(),
                    msg.content,
                    msg.tokens,
                    msg.file_id,
                    artifacts_to_json(&msg.artifacts)?,
                    msg.model,
                    msg.status.as_str(),
                    msg.parent_message_id,
                    msg.reserved_credits,
                    ts(&msg.created_at),
                    ts(&msg.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let id = id.to_string();
        self.run(move |conn| {
            let sql = format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS);
            let result = conn
                .query_row(&sql, params![id], |row| Ok(Self::row_to_message(row)))
                .optional()?;
            result.transpose()
        })
        .await
    }

    /// Messages of a conversation created after the `since` watermark, oldest first.
    pub async fn list_messages(
        &self,
        conversation_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let conversation_id = conversation_id.to_string();
        self.run(move |conn| {
            let sql = format!(
                "SELECT {} FROM messages
                 WHERE conversation_id = ?1 AND (?2 IS NULL OR created_at > ?2)
                 ORDER BY created_at ASC, rowid ASC",
                MESSAGE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let messages = stmt
                .query_map(params![conversation_id, since.as_ref().map(ts)], |row| {
                    Ok(Self::row_to_message(row))
                })?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;
            Ok(messages)
        })
        .await
    }

    /// The `limit` most recent completed messages after the watermark, oldest first.
    pub async fn list_history(
        &self,
        conversation_id: &str,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Message>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let conversation_id = conversation_id.to_string();
        self.run(move |conn| {
            let sql = format!(
                "SELECT {} FROM messages
                 WHERE conversation_id = ?1 AND status = 'completed' AND (?2 IS NULL OR created_at > ?2)
                 ORDER BY created_at DESC, rowid DESC LIMIT ?3",
                MESSAGE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut messages = stmt
                .query_map(params![conversation_id, since.as_ref().map(ts), limit], |row| {
                    Ok(Self::row_to_message(row))
                })?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;
            messages.reverse();
            Ok(messages)
        })
        .await
    }

    /// Persist partial content of a streaming message. Refreshes `updated_at`,
    /// the liveness signal. Returns false once the row has left `streaming`.
    pub async fn checkpoint_message(&self, id: &str, content: &str) -> Result<bool> {
        let id = id.to_string();
        let content = content.to_string();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE messages SET content = ?1, updated_at = ?2 WHERE id = ?3 AND status = 'streaming'",
                params![content, ts(&Utc::now()), id],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// Move a message into a terminal state, optionally crediting a refund in the
    /// same transaction. Returns false (and writes nothing) when the row is
    /// already terminal.
    pub async fn finish_message(
        &self,
        write: TerminalWrite,
        refund: Option<CreditRefund>,
    ) -> Result<bool> {
        if !write.status.is_terminal() {
            return Err(anyhow!(
                "finish_message requires a terminal status, got {}",
                write.status.as_str()
            ));
        }
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE messages SET status = ?1, content = ?2, tokens = ?3, artifacts = ?4,
                    reserved_credits = 0, updated_at = ?5
                 WHERE id = ?6 AND status IN ('pending', 'streaming')",
                params![
                    write.status.as_str(),
                    write.content,
                    write.tokens,
                    artifacts_to_json(&write.artifacts)?,
                    ts(&Utc::now()),
                    write.message_id,
                ],
            )?;
            if changed == 0 {
                return Ok(false);
            }
            if let Some(refund) = refund {
                apply_credit_delta(
                    &tx,
                    &refund.user_id,
                    refund.amount,
                    LedgerReason::ChatRefund,
                    &refund.link,
                )?;
            }
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    /// Force `streaming` rows not updated since `cutoff` to `failed` and refund
    /// whatever credits they still hold. `conversation_id = None` scans all rows.
    pub async fn recover_stale_streams(
        &self,
        conversation_id: Option<&str>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<RecoveredStream>> {
        let conversation_id = conversation_id.map(|s| s.to_string());
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let stale: Vec<(String, String, String, i64, Option<String>)> = {
                let mut stmt = tx.prepare(
                    "SELECT m.id, m.conversation_id, c.user_id, m.reserved_credits, m.model
                     FROM messages m JOIN conversations c ON c.id = m.conversation_id
                     WHERE m.status = 'streaming' AND m.updated_at < ?1
                       AND (?2 IS NULL OR m.conversation_id = ?2)",
                )?;
                let rows = stmt
                    .query_map(params![ts(&cutoff), conversation_id], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };

            let mut recovered = Vec::new();
            for (message_id, conversation_id, user_id, reserved, model) in stale {
                let changed = tx.execute(
                    "UPDATE messages SET status = 'failed', reserved_credits = 0, updated_at = ?1
                     WHERE id = ?2 AND status = 'streaming'",
                    params![ts(&Utc::now()), message_id],
                )?;
                if changed == 0 {
                    continue;
                }
                if reserved > 0 {
                    apply_credit_delta(
                        &tx,
                        &user_id,
                        reserved,
                        LedgerReason::StaleStreamRefund,
                        &LedgerLink {
                            model,
                            conversation_id: Some(conversation_id.clone()),
                            memo: Some(format!("stale stream {}", message_id)),
                        },
                    )?;
                }
                recovered.push(RecoveredStream {
                    message_id,
                    conversation_id,
                    user_id,
                    refunded: reserved.max(0),
                });
            }
            tx.commit()?;
            Ok(recovered)
        })
        .await
    }

    /// Delete an assistant message together with the user turn it answers.
    pub async fn delete_message_pair(&self, assistant_id: &str) -> Result<DeletedPair> {
        let assistant_id = assistant_id.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let row: Option<(Option<String>, i64)> = tx
                .query_row(
                    "SELECT parent_message_id, tokens FROM messages WHERE id = ?1 AND role = 'assistant'",
                    params![assistant_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let (parent_id, mut tokens) =
                row.ok_or_else(|| anyhow!("Assistant message not found: {}", assistant_id))?;

            let mut messages = tx.execute("DELETE FROM messages WHERE id = ?1", params![assistant_id])? as i64;
            if let Some(parent_id) = parent_id {
                let parent_tokens: Option<i64> = tx
                    .query_row(
                        "SELECT tokens FROM messages WHERE id = ?1 AND role = 'user'",
                        params![parent_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(parent_tokens) = parent_tokens {
                    tokens += parent_tokens;
                    messages += tx.execute("DELETE FROM messages WHERE id = ?1", params![parent_id])? as i64;
                }
            }
            tx.commit()?;
            Ok(DeletedPair { messages, tokens })
        })
        .await
    }

    // --- Catalog (models, prompts, attachments) ---

    /// Active models with no group restriction, plus those granted to `group_id`.
    pub async fn list_available_models(&self, group_id: Option<&str>) -> Result<Vec<AvailableModel>> {
        let group_id = group_id.map(|s| s.to_string());
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT m.name, m.provider, m.credits_per_chat, m.stream_enabled, m.image_upload_enabled, m.document_upload_enabled
                 FROM ai_models m
                 WHERE m.is_active = 1 AND (
                    NOT EXISTS (SELECT 1 FROM model_group_access a WHERE a.model_name = m.name)
                    OR EXISTS (SELECT 1 FROM model_group_access a WHERE a.model_name = m.name AND a.group_id = ?1)
                 )
                 ORDER BY m.sort_order ASC, m.name ASC",
            )?;
            let models = stmt
                .query_map(params![group_id], |row| {
                    let stream: i32 = row.get(3)?;
                    let image: i32 = row.get(4)?;
                    let document: i32 = row.get(5)?;
                    Ok(AvailableModel {
                        name: row.get(0)?,
                        provider: row.get(1)?,
                        credits_per_chat: row.get(2)?,
                        stream_enabled: stream != 0,
                        image_upload_enabled: image != 0,
                        document_upload_enabled: document != 0,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(models)
        })
        .await
    }

    pub async fn get_prompt_content(&self, id: &str) -> Result<Option<String>> {
        let id = id.to_string();
        self.run(move |conn| {
            let content = conn
                .query_row(
                    "SELECT content FROM system_prompts WHERE id = ?1 AND is_active = 1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(content)
        })
        .await
    }

    /// Resolve a module combination visible to `user_id` into its system and
    /// conversational fragments, each joined in position order.
    pub async fn get_combined_content(
        &self,
        combination_id: &str,
        user_id: &str,
    ) -> Result<Option<CombinedContent>> {
        let combination_id = combination_id.to_string();
        let user_id = user_id.to_string();
        self.run(move |conn| {
            let exists: Option<i32> = conn
                .query_row(
                    "SELECT 1 FROM module_combinations WHERE id = ?1 AND (user_id IS NULL OR user_id = ?2)",
                    params![combination_id, user_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Ok(None);
            }

            let mut stmt = conn.prepare(
                "SELECT p.kind, p.content FROM module_combination_items i
                 JOIN prompt_modules p ON p.id = i.module_id
                 WHERE i.combination_id = ?1 AND p.is_active = 1
                 ORDER BY i.position ASC",
            )?;
            let fragments = stmt
                .query_map(params![combination_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let join = |kind: &str| {
                let parts: Vec<&str> = fragments
                    .iter()
                    .filter(|(k, c)| k == kind && !c.trim().is_empty())
                    .map(|(_, c)| c.as_str())
                    .collect();
                (!parts.is_empty()).then(|| parts.join("\n\n"))
            };

            Ok(Some(CombinedContent {
                system_prompt: join("system"),
                normal_prompt: join("normal"),
            }))
        })
        .await
    }

    pub async fn get_attachment(&self, id: &str) -> Result<Option<Attachment>> {
        let id = id.to_string();
        self.run(move |conn| {
            let attachment = conn
                .query_row(
                    "SELECT id, user_id, mime_type, filename, url, extracted_content FROM attachments WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok(Attachment {
                            id: row.get(0)?,
                            user_id: row.get(1)?,
                            mime_type: row.get(2)?,
                            filename: row.get(3)?,
                            url: row.get(4)?,
                            extracted_content: row.get(5)?,
                        })
                    },
                )
                .optional()?;
            Ok(attachment)
        })
        .await
    }

    // --- Usage counters ---

    pub async fn record_usage(
        &self,
        day: NaiveDate,
        user_id: &str,
        model: &str,
        messages: i64,
        tokens: i64,
    ) -> Result<()> {
        let user_id = user_id.to_string();
        let model = model.to_string();
        self.run(move |conn| {
            let day = day.to_string();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO usage_daily (day, user_id, messages, tokens) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(day, user_id) DO UPDATE SET messages = messages + ?3, tokens = tokens + ?4",
                params![day, user_id, messages, tokens],
            )?;
            tx.execute(
                "INSERT INTO model_usage_daily (day, model, requests, tokens) VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(day, model) DO UPDATE SET requests = requests + 1, tokens = tokens + ?3",
                params![day, model, tokens],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    // --- Row helpers ---

    fn row_to_user(row: &rusqlite::Row) -> Result<UserAccount> {
        let role_str: String = row.get(1)?;
        let expire_str: Option<String> = row.get(4)?;
        let created_str: String = row.get(7)?;

        Ok(UserAccount {
            id: row.get(0)?,
            role: UserRole::from_str(&role_str)
                .ok_or_else(|| anyhow!("Unknown role: {}", role_str))?,
            group_id: row.get(2)?,
            credits: row.get(3)?,
            credits_expire_at: parse_opt_ts(expire_str)?,
            token_quota: row.get(5)?,
            tokens_used: row.get(6)?,
            created_at: parse_ts(&created_str)?,
        })
    }

    fn row_to_ledger_entry(row: &rusqlite::Row) -> Result<LedgerEntry> {
        let reason_str: String = row.get(4)?;
        let created_str: String = row.get(8)?;

        Ok(LedgerEntry {
            id: row.get(0)?,
            user_id: row.get(1)?,
            delta: row.get(2)?,
            balance_after: row.get(3)?,
            reason: LedgerReason::from_str(&reason_str)
                .ok_or_else(|| anyhow!("Unknown ledger reason: {}", reason_str))?,
            model: row.get(5)?,
            conversation_id: row.get(6)?,
            memo: row.get(7)?,
            created_at: parse_ts(&created_str)?,
        })
    }

    fn row_to_conversation(row: &rusqlite::Row) -> Result<Conversation> {
        let temperature: f64 = row.get(8)?;
        let created_str: String = row.get(12)?;

        Ok(Conversation {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            model: row.get(3)?,
            prompt: PromptSource::from_columns(row.get(4)?, row.get(5)?, row.get(6)?),
            context_length: row.get(7)?,
            temperature: temperature as f32,
            priority: row.get(9)?,
            message_count: row.get(10)?,
            total_tokens: row.get(11)?,
            created_at: parse_ts(&created_str)?,
            last_message_at: parse_opt_ts(row.get(13)?)?,
            cleared_at: parse_opt_ts(row.get(14)?)?,
        })
    }

    fn row_to_message(row: &rusqlite::Row) -> Result<Message> {
        let role_str: String = row.get(2)?;
        let artifacts_json: Option<String> = row.get(6)?;
        let status_str: String = row.get(8)?;
        let created_str: String = row.get(11)?;
        let updated_str: String = row.get(12)?;

        Ok(Message {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            role: Role::from_str(&role_str)
                .ok_or_else(|| anyhow!("Unknown role: {}", role_str))?,
            content: row.get(3)?,
            tokens: row.get(4)?,
            file_id: row.get(5)?,
            artifacts: match artifacts_json {
                Some(json) if !json.is_empty() => serde_json::from_str(&json)?,
                _ => Vec::new(),
            },
            model: row.get(7)?,
            status: MessageStatus::from_str(&status_str)
                .ok_or_else(|| anyhow!("Unknown status: {}", status_str))?,
            parent_message_id: row.get(9)?,
            reserved_credits: row.get(10)?,
            created_at: parse_ts(&created_str)?,
            updated_at: parse_ts(&updated_str)?,
        })
    }
}

fn artifacts_to_json(artifacts: &[Artifact]) -> Result<Option<String>> {
    if artifacts.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::to_string(artifacts)?))
    }
}

/// Move the cached balance and append the matching ledger row.
fn apply_credit_delta(
    tx: &Transaction,
    user_id: &str,
    delta: i64,
    reason: LedgerReason,
    link: &LedgerLink,
) -> Result<i64> {
    let changed = tx.execute(
        "UPDATE users SET credits = credits + ?1 WHERE id = ?2",
        params![delta, user_id],
    )?;
    if changed == 0 {
        return Err(anyhow!("Unknown user: {}", user_id));
    }
    insert_ledger_row(tx, user_id, delta, reason, link)
}

/// Append a ledger row recording the balance already applied to `users.credits`.
fn insert_ledger_row(
    tx: &Transaction,
    user_id: &str,
    delta: i64,
    reason: LedgerReason,
    link: &LedgerLink,
) -> Result<i64> {
    let balance_after: i64 = tx.query_row(
        "SELECT credits FROM users WHERE id = ?1",
        params![user_id],
        |row| row.get(0),
    )?;
    tx.execute(
        "INSERT INTO credit_ledger (user_id, delta, balance_after, reason, model, conversation_id, memo, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            user_id,
            delta,
            balance_after,
            reason.as_str(),
            link.model,
            link.conversation_id,
            link.memo,
            ts(&Utc::now()),
        ],
    )?;
    Ok(balance_after)
}
