use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use relay_core::{DebitMeta, RelayError, Result, WalletLedger};

/// One wallet movement, kept for inspection.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub amount: f64,
    pub request_id: String,
    pub model: String,
    pub provider: String,
}

struct Account {
    balance: f64,
    transactions: Vec<Transaction>,
    /// Idempotency guard: request ids already debited.
    debited_requests: HashSet<String>,
}

/// In-memory wallet ledger. Debits are serialized per user by the per-entry
/// lock and idempotent on the request id.
pub struct InMemoryWallet {
    accounts: DashMap<String, Account>,
}

impl InMemoryWallet {
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
        }
    }

    pub fn with_user(self, user_id: impl Into<String>, balance: f64) -> Self {
        self.accounts.insert(
            user_id.into(),
            Account {
                balance,
                transactions: Vec::new(),
                debited_requests: HashSet::new(),
            },
        );
        self
    }

    /// Transactions recorded for a user, for assertions in tests.
    pub fn transactions(&self, user_id: &str) -> Vec<Transaction> {
        self.accounts
            .get(user_id)
            .map(|a| a.transactions.clone())
            .unwrap_or_default()
    }
}

impl Default for InMemoryWallet {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WalletLedger for InMemoryWallet {
    async fn balance(&self, user_id: &str) -> Result<f64> {
        Ok(self.accounts.get(user_id).map(|a| a.balance).unwrap_or(0.0))
    }

    async fn debit(&self, user_id: &str, amount: f64, meta: DebitMeta) -> Result<()> {
        let mut account = self
            .accounts
            .get_mut(user_id)
            .ok_or_else(|| RelayError::Authentication(format!("unknown user {user_id}")))?;

        if !account.debited_requests.insert(meta.request_id.clone()) {
            debug!(request_id = %meta.request_id, "debit already applied, skipping");
            return Ok(());
        }

        account.balance -= amount;
        account.transactions.push(Transaction {
            amount: -amount,
            request_id: meta.request_id,
            model: meta.model,
            provider: meta.provider,
        });
        Ok(())
    }

    async fn credit(&self, user_id: &str, amount: f64, meta: DebitMeta) -> Result<()> {
        let mut account = self
            .accounts
            .get_mut(user_id)
            .ok_or_else(|| RelayError::Authentication(format!("unknown user {user_id}")))?;
        account.balance += amount;
        account.transactions.push(Transaction {
            amount,
            request_id: meta.request_id,
            model: meta.model,
            provider: meta.provider,
        });
        Ok(())
    }
}
