use chrono::Utc;

use crate::error::{ChatError, ChatResult};
use crate::models::{CreditStats, LedgerEntry, LedgerLink, LedgerReason, MessageStatus};
use crate::services::database::{CreditRefund, Database, ReserveOutcome, TerminalWrite};

/// Append-only credit ledger over the user's cached balance.
#[derive(Debug, Clone)]
pub struct CreditLedger {
    db: Database,
}

impl CreditLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Debit `amount` up front. Fails with `InsufficientCredits` without writing
    /// anything when the balance does not cover it.
    pub async fn reserve(
        &self,
        user_id: &str,
        amount: i64,
        link: LedgerLink,
    ) -> ChatResult<Reservation> {
        if amount < 0 {
            return Err(ChatError::validation("Tariff must not be negative"));
        }

        if amount == 0 {
            let user = self
                .db
                .get_user(user_id)
                .await?
                .ok_or(ChatError::NotFound("User"))?;
            return Ok(Reservation::new(self.db.clone(), user_id, 0, user.credits, link));
        }

        match self.db.reserve_credits(user_id, amount, link.clone()).await? {
            ReserveOutcome::Reserved { balance_after } => {
                tracing::debug!(user_id, amount, balance_after, "Reserved credits");
                Ok(Reservation::new(
                    self.db.clone(),
                    user_id,
                    amount,
                    balance_after,
                    link,
                ))
            }
            ReserveOutcome::Insufficient { available } => Err(ChatError::InsufficientCredits {
                required: amount,
                available,
            }),
        }
    }

    /// Append a refund entry. Callers guarantee at most one refund per reservation;
    /// the pipeline goes through [`Reservation`] for that.
    pub async fn refund(&self, user_id: &str, amount: i64, link: LedgerLink) -> ChatResult<i64> {
        Ok(self
            .db
            .refund_credits(user_id, amount, LedgerReason::ChatRefund, link)
            .await?)
    }

    pub async fn grant(&self, user_id: &str, amount: i64, memo: &str) -> ChatResult<i64> {
        if amount <= 0 {
            return Err(ChatError::validation("Grant amount must be positive"));
        }
        let link = LedgerLink {
            memo: Some(memo.to_string()),
            ..LedgerLink::default()
        };
        Ok(self.db.grant_credits(user_id, amount, link).await?)
    }

    pub async fn stats(&self, user_id: &str) -> ChatResult<CreditStats> {
        let user = self
            .db
            .get_user(user_id)
            .await?
            .ok_or(ChatError::NotFound("User"))?;
        let (quota, used) = self.db.credit_totals(user_id).await?;
        let expired = user.credits_expired(Utc::now());

        Ok(CreditStats {
            quota,
            used,
            remaining: if expired { 0 } else { user.credits.max(0) },
            expired,
            expires_at: user.credits_expire_at,
        })
    }

    pub async fn entries(&self, user_id: &str) -> ChatResult<Vec<LedgerEntry>> {
        Ok(self.db.list_ledger(user_id).await?)
    }
}

/// Credits debited for one turn and not yet settled.
///
/// Exactly one of `commit`, `refund` or `settle` consumes it. Once the amount is
/// recorded on a placeholder row (`attach_message`), an abandoned reservation is
/// left to the stale-stream scan instead of being refunded here, so the row and
/// the ledger never both pay back the same debit.
#[derive(Debug)]
pub struct Reservation {
    db: Database,
    user_id: String,
    amount: i64,
    balance_after: i64,
    link: LedgerLink,
    message_id: Option<String>,
    outstanding: bool,
}

impl Reservation {
    fn new(db: Database, user_id: &str, amount: i64, balance_after: i64, link: LedgerLink) -> Self {
        Self {
            db,
            user_id: user_id.to_string(),
            amount,
            balance_after,
            link,
            message_id: None,
            outstanding: amount > 0,
        }
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn balance_after(&self) -> i64 {
        self.balance_after
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Record that the placeholder row `message_id` now carries this reservation.
    pub fn attach_message(&mut self, message_id: &str) {
        self.message_id = Some(message_id.to_string());
    }

    /// Keep the debit.
    pub fn commit(mut self) {
        self.outstanding = false;
    }

    /// Pay the debit back. Only valid while no placeholder row carries it.
    pub async fn refund(mut self, memo: &str) -> ChatResult<i64> {
        if !self.outstanding {
            return Ok(self.balance_after);
        }
        let mut link = self.link.clone();
        link.memo = Some(memo.to_string());
        let balance = self
            .db
            .refund_credits(&self.user_id, self.amount, LedgerReason::ChatRefund, link)
            .await?;
        self.outstanding = false;
        tracing::info!(user_id = %self.user_id, amount = self.amount, "Refunded reservation");
        Ok(balance)
    }

    /// Write the terminal state of the carrying message and settle in the same
    /// transaction: `Completed` keeps the debit, `Failed` refunds it. Returns
    /// false when the row had already reached a terminal state elsewhere, in
    /// which case that path has already settled.
    pub async fn settle(mut self, write: TerminalWrite) -> ChatResult<bool> {
        let refund = (write.status == MessageStatus::Failed && self.outstanding).then(|| {
            CreditRefund {
                user_id: self.user_id.clone(),
                amount: self.amount,
                link: self.link.clone(),
            }
        });
        let message_id = write.message_id.clone();
        let won = self.db.finish_message(write, refund).await?;
        self.outstanding = false;
        if !won {
            tracing::warn!(
                message_id = %message_id,
                "Message already terminal; reservation was settled by recovery"
            );
        }
        Ok(won)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.outstanding {
            return;
        }
        if let Some(message_id) = &self.message_id {
            tracing::warn!(
                message_id = %message_id,
                amount = self.amount,
                "Reservation dropped while its message is open; leaving it to recovery"
            );
            return;
        }

        tracing::error!(
            user_id = %self.user_id,
            amount = self.amount,
            "Reservation dropped without settlement, refunding"
        );
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let db = self.db.clone();
        let user_id = self.user_id.clone();
        let amount = self.amount;
        let mut link = self.link.clone();
        link.memo = Some("unsettled reservation".to_string());
        handle.spawn(async move {
            if let Err(e) = db
                .refund_credits(&user_id, amount, LedgerReason::ChatRefund, link)
                .await
            {
                tracing::error!("Failed to refund dropped reservation: {}", e);
            }
        });
    }
}
