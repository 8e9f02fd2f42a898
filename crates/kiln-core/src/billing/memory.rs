//! In-process billing ledger.
//!
//! Implements the full client contract, including idempotency-key replay,
//! against a mutex-guarded map. Used for local runs and as the billing
//! double in integration tests; `fail_unavailable` flips the adapter into
//! outage mode so callers can exercise their degradation paths.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{Balance, BillingClient, BillingError, CreditRequest, CreditTransaction};

#[derive(Default)]
struct Ledger {
    balances: HashMap<Uuid, Decimal>,
    /// Idempotency key -> original transaction.
    transactions: HashMap<String, CreditTransaction>,
    /// Every applied transaction, in order.
    log: Vec<CreditTransaction>,
}

/// Mutex-guarded ledger implementing [`BillingClient`].
#[derive(Default)]
pub struct MemoryBillingClient {
    ledger: Mutex<Ledger>,
    unavailable: AtomicBool,
}

impl MemoryBillingClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct with a single tenant balance preloaded.
    pub fn with_balance(tenant_id: Uuid, balance: Decimal) -> Self {
        let client = Self::new();
        client.set_balance(tenant_id, balance);
        client
    }

    /// Create or overwrite a tenant's balance.
    pub fn set_balance(&self, tenant_id: Uuid, balance: Decimal) {
        let mut ledger = self.ledger.lock().expect("ledger poisoned");
        ledger.balances.insert(tenant_id, balance);
    }

    /// Flip outage mode: every call fails with `Unavailable` while set.
    pub fn fail_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Snapshot of every applied transaction, in application order.
    pub fn transaction_log(&self) -> Vec<CreditTransaction> {
        self.ledger.lock().expect("ledger poisoned").log.clone()
    }

    /// Idempotency keys of applied consume transactions, in order.
    pub fn consumed_keys(&self) -> Vec<String> {
        self.ledger
            .lock()
            .expect("ledger poisoned")
            .log
            .iter()
            .filter(|t| t.transaction_type == "consume")
            .map(|t| t.idempotency_key.clone())
            .collect()
    }

    fn check_available(&self) -> Result<(), BillingError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BillingError::Unavailable("simulated outage".to_owned()));
        }
        Ok(())
    }

    fn apply(
        &self,
        request: &CreditRequest,
        kind: &str,
    ) -> Result<CreditTransaction, BillingError> {
        let mut ledger = self.ledger.lock().expect("ledger poisoned");

        // Idempotent replay returns the original transaction untouched.
        if let Some(existing) = ledger.transactions.get(&request.idempotency_key) {
            return Ok(existing.clone());
        }

        let balance_before = match ledger.balances.get(&request.tenant_id) {
            Some(b) => *b,
            None => {
                return Err(BillingError::Api {
                    status: 404,
                    message: format!("no ledger for tenant {}", request.tenant_id),
                });
            }
        };

        let balance_after = match kind {
            "consume" => {
                if balance_before < request.amount {
                    return Err(BillingError::InsufficientCredits(format!(
                        "balance {balance_before} < amount {}",
                        request.amount
                    )));
                }
                balance_before - request.amount
            }
            _ => balance_before + request.amount,
        };

        ledger.balances.insert(request.tenant_id, balance_after);

        let transaction = CreditTransaction {
            transaction_id: format!("txn_{}", Uuid::new_v4().simple()),
            tenant_id: request.tenant_id,
            transaction_type: kind.to_owned(),
            amount: request.amount,
            balance_before,
            balance_after,
            idempotency_key: request.idempotency_key.clone(),
            created_at: Utc::now(),
        };
        ledger
            .transactions
            .insert(request.idempotency_key.clone(), transaction.clone());
        ledger.log.push(transaction.clone());

        Ok(transaction)
    }
}

#[async_trait::async_trait]
impl BillingClient for MemoryBillingClient {
    async fn consume_credits(
        &self,
        request: &CreditRequest,
    ) -> Result<CreditTransaction, BillingError> {
        self.check_available()?;
        self.apply(request, "consume")
    }

    async fn refund_credits(
        &self,
        request: &CreditRequest,
    ) -> Result<CreditTransaction, BillingError> {
        self.check_available()?;
        self.apply(request, "refund")
    }

    async fn get_balance(&self, tenant_id: Uuid) -> Result<Balance, BillingError> {
        self.check_available()?;
        let ledger = self.ledger.lock().expect("ledger poisoned");
        match ledger.balances.get(&tenant_id) {
            Some(balance) => Ok(Balance {
                tenant_id,
                balance: *balance,
                last_updated: Utc::now(),
            }),
            None => Err(BillingError::Api {
                status: 404,
                message: format!("no ledger for tenant {tenant_id}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn consume_debits_and_replays_idempotently() {
        let tenant = Uuid::new_v4();
        let billing = MemoryBillingClient::with_balance(tenant, Decimal::from(100));

        let req = CreditRequest::new(tenant, Decimal::from(40), "run:step");
        let first = billing.consume_credits(&req).await.unwrap();
        assert_eq!(first.balance_after, Decimal::from(60));

        // Same key: original transaction, no second debit.
        let replay = billing.consume_credits(&req).await.unwrap();
        assert_eq!(replay.transaction_id, first.transaction_id);
        assert_eq!(
            billing.get_balance(tenant).await.unwrap().balance,
            Decimal::from(60)
        );
        assert_eq!(billing.consumed_keys(), vec!["run:step".to_owned()]);
    }

    #[tokio::test]
    async fn consume_rejects_insufficient_balance() {
        let tenant = Uuid::new_v4();
        let billing = MemoryBillingClient::with_balance(tenant, Decimal::from(10));

        let req = CreditRequest::new(tenant, Decimal::from(40), "k");
        let err = billing.consume_credits(&req).await.unwrap_err();
        assert!(matches!(err, BillingError::InsufficientCredits(_)));

        // Balance untouched by the failed attempt.
        assert_eq!(
            billing.get_balance(tenant).await.unwrap().balance,
            Decimal::from(10)
        );
    }

    #[tokio::test]
    async fn exact_balance_is_sufficient() {
        let tenant = Uuid::new_v4();
        let billing = MemoryBillingClient::with_balance(tenant, Decimal::from(50));

        let req = CreditRequest::new(tenant, Decimal::from(50), "k");
        let txn = billing.consume_credits(&req).await.unwrap();
        assert_eq!(txn.balance_after, Decimal::ZERO);
    }

    #[tokio::test]
    async fn refund_credits_back() {
        let tenant = Uuid::new_v4();
        let billing = MemoryBillingClient::with_balance(tenant, Decimal::from(100));

        let consume = CreditRequest::new(tenant, Decimal::from(30), "c");
        billing.consume_credits(&consume).await.unwrap();

        let refund = CreditRequest::new(tenant, Decimal::from(30), "refund:c");
        let txn = billing.refund_credits(&refund).await.unwrap();
        assert_eq!(txn.transaction_type, "refund");
        assert_eq!(txn.balance_after, Decimal::from(100));
    }

    #[tokio::test]
    async fn outage_mode_fails_everything() {
        let tenant = Uuid::new_v4();
        let billing = MemoryBillingClient::with_balance(tenant, Decimal::from(100));
        billing.fail_unavailable(true);

        let req = CreditRequest::new(tenant, Decimal::from(1), "k");
        assert!(matches!(
            billing.consume_credits(&req).await,
            Err(BillingError::Unavailable(_))
        ));
        assert!(matches!(
            billing.get_balance(tenant).await,
            Err(BillingError::Unavailable(_))
        ));

        billing.fail_unavailable(false);
        assert!(billing.consume_credits(&req).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_tenant_is_a_404() {
        let billing = MemoryBillingClient::new();
        let err = billing.get_balance(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, BillingError::Api { status: 404, .. }));
    }
}
