use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;

use super::{now_iso, JobRecord, JobStore, JobStoreError};

/// Account shape applied the first time an owner is seen. The limit is
/// deployment configuration, not code, so it rides on the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountDefaults {
    pub token_limit: i64,
    pub tier: String,
}

impl Default for AccountDefaults {
    fn default() -> Self {
        Self {
            token_limit: 100,
            tier: String::from("standard"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerBalance {
    pub owner_id: String,
    pub remaining: i64,
    pub limit: i64,
    pub used: i64,
    pub tier: String,
}

/// Result of a refund attempt. The ledger itself rejects a second refund for
/// the same job, so exactly-once does not depend on call-site discipline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundOutcome {
    Refunded { remaining: i64 },
    Duplicate,
}

impl JobStore {
    /// Read-only snapshot; may be stale relative to concurrent consumes. An
    /// owner the ledger has never charged gets a synthesized default snapshot
    /// without persisting an account row.
    pub fn get_balance(&self, owner_id: &str) -> Result<LedgerBalance, JobStoreError> {
        let defaults = self.account_defaults().clone();
        self.with_connection(|conn| {
            let row = conn
                .query_row(
                    "
                    SELECT remaining, token_limit, used, tier
                    FROM ledger_accounts
                    WHERE owner_id = ?1
                    LIMIT 1
                ",
                    [owner_id],
                    |row| {
                        Ok(LedgerBalance {
                            owner_id: String::from(owner_id),
                            remaining: row.get("remaining")?,
                            limit: row.get("token_limit")?,
                            used: row.get("used")?,
                            tier: row
                                .get::<_, Option<String>>("tier")?
                                .unwrap_or_else(|| String::from("standard")),
                        })
                    },
                )
                .optional()?;

            Ok(row.unwrap_or(LedgerBalance {
                owner_id: String::from(owner_id),
                remaining: defaults.token_limit,
                limit: defaults.token_limit,
                used: 0,
                tier: defaults.tier,
            }))
        })
    }

    /// Additive top-up used by the operator CLI; raises both remaining and
    /// the limit so the grant survives later refund accounting.
    pub fn grant_tokens(
        &self,
        owner_id: &str,
        amount: i64,
    ) -> Result<LedgerBalance, JobStoreError> {
        if amount <= 0 {
            return Err(JobStoreError::Validation(String::from(
                "Grant amount must be positive",
            )));
        }
        let defaults = self.account_defaults().clone();
        self.with_connection_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_account(&tx, owner_id, &defaults)?;
            tx.execute(
                "
                UPDATE ledger_accounts
                SET remaining = remaining + ?1,
                    token_limit = token_limit + ?1,
                    updated_at = ?2
                WHERE owner_id = ?3
            ",
                params![amount, now_iso(), owner_id],
            )?;
            tx.commit()?;
            Ok(())
        })?;
        self.get_balance(owner_id)
    }

    /// Returns the tokens for one job. The refund row is keyed by job id and
    /// inserted in the same transaction as the balance update, so a job can be
    /// refunded at most once no matter how many failure or cancel paths race.
    pub fn refund_job(
        &self,
        job: &JobRecord,
        reason: &str,
    ) -> Result<RefundOutcome, JobStoreError> {
        let defaults = self.account_defaults().clone();
        self.with_connection_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let inserted = tx.execute(
                "
                INSERT OR IGNORE INTO ledger_refunds
                  (job_id, owner_id, amount, reason, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
            ",
                params![job.id, job.owner_id, job.cost, reason, now_iso()],
            )?;
            if inserted == 0 {
                return Ok(RefundOutcome::Duplicate);
            }

            ensure_account(&tx, job.owner_id.as_str(), &defaults)?;
            tx.execute(
                "
                UPDATE ledger_accounts
                SET remaining = remaining + ?1,
                    used = MAX(used - ?1, 0),
                    updated_at = ?2
                WHERE owner_id = ?3
            ",
                params![job.cost, now_iso(), job.owner_id],
            )?;
            let remaining = tx.query_row(
                "SELECT remaining FROM ledger_accounts WHERE owner_id = ?1",
                [job.owner_id.as_str()],
                |row| row.get::<_, i64>(0),
            )?;
            tx.commit()?;
            Ok(RefundOutcome::Refunded { remaining })
        })
    }

    pub fn refund_recorded(&self, job_id: &str) -> Result<bool, JobStoreError> {
        self.with_connection(|conn| {
            let found = conn
                .query_row(
                    "SELECT job_id FROM ledger_refunds WHERE job_id = ?1 LIMIT 1",
                    [job_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
                .is_some();
            Ok(found)
        })
    }
}

pub(super) fn ensure_account(
    conn: &Connection,
    owner_id: &str,
    defaults: &AccountDefaults,
) -> Result<(), JobStoreError> {
    conn.execute(
        "
        INSERT OR IGNORE INTO ledger_accounts
          (owner_id, remaining, token_limit, used, tier, created_at, updated_at)
        VALUES (?1, ?2, ?2, 0, ?3, ?4, ?4)
    ",
        params![owner_id, defaults.token_limit, defaults.tier, now_iso()],
    )?;
    Ok(())
}

/// Conditional decrement: the balance check and the deduction are one SQL
/// statement, which is what closes the check-then-deduct double-spend race.
pub(super) fn consume_tokens(
    conn: &Connection,
    owner_id: &str,
    amount: i64,
) -> Result<i64, JobStoreError> {
    let changed = conn.execute(
        "
        UPDATE ledger_accounts
        SET remaining = remaining - ?1,
            used = used + ?1,
            updated_at = ?2
        WHERE owner_id = ?3 AND remaining >= ?1
    ",
        params![amount, now_iso(), owner_id],
    )?;
    if changed == 0 {
        let remaining = conn
            .query_row(
                "SELECT remaining FROM ledger_accounts WHERE owner_id = ?1",
                [owner_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .unwrap_or(0);
        return Err(JobStoreError::InsufficientBalance {
            needed: amount,
            remaining,
        });
    }
    conn.query_row(
        "SELECT remaining FROM ledger_accounts WHERE owner_id = ?1",
        [owner_id],
        |row| row.get::<_, i64>(0),
    )
    .map_err(JobStoreError::from)
}
