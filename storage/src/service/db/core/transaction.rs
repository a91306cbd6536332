//! Transaction management module
//!
//! A [`Tx`] wraps one native transaction plus an ordered list of non-database
//! participants that share its lifecycle. Commit runs participants in
//! registration order and stops at the first failure; rollback always visits
//! every participant and reports the last error. Once the native commit
//! succeeded, participants get an `after_commit` call. Once finished, a `Tx`
//! is stale and any further use panics.

use super::connection::ConnectionManager;
use super::dialect::Dialect;
use super::executor::{bind_args, DbExecutor, QueryTracer};
use super::statement::Statement;
use crate::tool::error::DbError;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use sqlx::any::AnyRow;
use sqlx::{Any, Transaction};
use std::any::Any as StdAny;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_PARTICIPANT_KEY: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique key for [`Tx::participant_or_insert_with`]
pub fn participant_key() -> u64 {
    NEXT_PARTICIPANT_KEY.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Open,
    Committed,
    RolledBack,
}

/// A non-database participant in a transaction's commit/rollback.
///
/// Participants must never open a native transaction of their own.
#[async_trait]
pub trait TxParticipant: Send + Sync {
    /// Runs before the native commit; an error aborts the whole transaction.
    async fn commit(&self) -> Result<(), DbError>;

    async fn rollback(&self) -> Result<(), DbError>;

    /// Runs once the native commit succeeded. Cannot fail the transaction.
    async fn after_commit(&self) {}
}

type Keyed = Arc<dyn StdAny + Send + Sync>;

/// A native transaction with cascading participants
pub struct Tx {
    id: u64,
    dialect: Dialect,
    tracer: QueryTracer,
    native: tokio::sync::Mutex<Option<Transaction<'static, Any>>>,
    participants: Mutex<Vec<Arc<dyn TxParticipant>>>,
    keyed: Mutex<HashMap<u64, Keyed>>,
    state: Mutex<TxState>,
}

impl Tx {
    pub(crate) fn new(
        dialect: Dialect,
        tracer: QueryTracer,
        native: Transaction<'static, Any>,
    ) -> Self {
        let id = NEXT_TX_ID.fetch_add(1, Ordering::Relaxed);
        debug!("Transaction #{} started", id);
        Self {
            id,
            dialect,
            tracer,
            native: tokio::sync::Mutex::new(Some(native)),
            participants: Mutex::new(Vec::new()),
            keyed: Mutex::new(HashMap::new()),
            state: Mutex::new(TxState::Open),
        }
    }

    /// Process-unique transaction id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TxState {
        *self.state.lock()
    }

    fn ensure_open(&self, op: &str) {
        let state = *self.state.lock();
        if state != TxState::Open {
            panic!("{} on stale transaction #{} (state {:?})", op, self.id, state);
        }
    }

    /// Moves the state out of `Open`, panicking if it already left it.
    fn finish(&self, op: &str, next: TxState) {
        let mut state = self.state.lock();
        if *state != TxState::Open {
            panic!("{} on stale transaction #{} (state {:?})", op, self.id, *state);
        }
        *state = next;
    }

    /// Registers a participant; it is committed/rolled back after those
    /// registered before it.
    pub fn add_participant(&self, participant: Arc<dyn TxParticipant>) {
        self.ensure_open("add_participant");
        self.participants.lock().push(participant);
    }

    /// Returns the participant registered under `key`, registering the one
    /// built by `make` on first use.
    pub fn participant_or_insert_with<P, F>(&self, key: u64, make: F) -> Arc<P>
    where
        P: TxParticipant + 'static,
        F: FnOnce() -> Arc<P>,
    {
        self.ensure_open("participant_or_insert_with");
        let mut keyed = self.keyed.lock();
        if let Some(existing) = keyed.get(&key).and_then(|p| p.clone().downcast::<P>().ok()) {
            return existing;
        }
        let participant = make();
        keyed.insert(key, participant.clone());
        self.participants.lock().push(participant.clone());
        participant
    }

    /// Participant registered under `key`, if any
    pub fn participant<P: TxParticipant + 'static>(&self, key: u64) -> Option<Arc<P>> {
        self.keyed
            .lock()
            .get(&key)
            .and_then(|p| p.clone().downcast::<P>().ok())
    }

    fn snapshot_participants(&self) -> Vec<Arc<dyn TxParticipant>> {
        self.participants.lock().clone()
    }

    /// Commits participants in order, then the native transaction, then
    /// runs every participant's `after_commit`.
    ///
    /// A failing participant stops the cascade: the native transaction is
    /// rolled back and every participant is told to roll back.
    pub async fn commit(&self) -> Result<(), DbError> {
        self.finish("commit", TxState::Committed);
        let participants = self.snapshot_participants();

        for (index, participant) in participants.iter().enumerate() {
            if let Err(err) = participant.commit().await {
                error!(
                    "Transaction #{}: participant {} failed to commit: {}",
                    self.id, index, err
                );
                *self.state.lock() = TxState::RolledBack;
                if let Err(rb) = self.rollback_inner(&participants).await {
                    error!("Transaction #{}: rollback after failed commit: {}", self.id, rb);
                }
                return Err(err);
            }
        }

        let native = self.native.lock().await.take();
        if let Some(native) = native {
            if let Err(err) = native.commit().await {
                error!("Transaction #{}: native commit failed: {}", self.id, err);
                *self.state.lock() = TxState::RolledBack;
                for participant in &participants {
                    if let Err(rb) = participant.rollback().await {
                        error!("Transaction #{}: participant rollback: {}", self.id, rb);
                    }
                }
                return Err(err.into());
            }
        }

        for participant in &participants {
            participant.after_commit().await;
        }

        debug!(
            "Transaction #{} committed ({} participants)",
            self.id,
            participants.len()
        );
        Ok(())
    }

    /// Rolls back every participant, then the native transaction; the last
    /// error encountered is returned.
    pub async fn rollback(&self) -> Result<(), DbError> {
        self.finish("rollback", TxState::RolledBack);
        let participants = self.snapshot_participants();
        self.rollback_inner(&participants).await?;
        debug!("Transaction #{} rolled back", self.id);
        Ok(())
    }

    async fn rollback_inner(&self, participants: &[Arc<dyn TxParticipant>]) -> Result<(), DbError> {
        let mut last_err = None;
        for (index, participant) in participants.iter().enumerate() {
            if let Err(err) = participant.rollback().await {
                warn!(
                    "Transaction #{}: participant {} failed to roll back: {}",
                    self.id, index, err
                );
                last_err = Some(err);
            }
        }

        let native = self.native.lock().await.take();
        if let Some(native) = native {
            if let Err(err) = native.rollback().await {
                warn!("Transaction #{}: native rollback failed: {}", self.id, err);
                last_err = Some(err.into());
            }
        }

        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Tx {
    /// An open transaction going out of scope is rolled back. The native side
    /// is handled by sqlx; participants are rolled back on a spawned task.
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if *state != TxState::Open {
            return;
        }
        *state = TxState::RolledBack;

        let id = self.id;
        let participants = std::mem::take(self.participants.get_mut());
        warn!(
            "Transaction #{} dropped while open, rolling back {} participant(s)",
            id,
            participants.len()
        );
        if participants.is_empty() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for participant in participants {
                        if let Err(err) = participant.rollback().await {
                            warn!("Transaction #{}: participant rollback on drop: {}", id, err);
                        }
                    }
                });
            }
            Err(_) => error!(
                "Transaction #{} dropped outside a runtime; participants not rolled back",
                id
            ),
        }
    }
}

#[async_trait]
impl DbExecutor for Tx {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn transaction(&self) -> Option<&Tx> {
        Some(self)
    }

    async fn execute(&self, stmt: &Statement) -> Result<u64, DbError> {
        self.ensure_open("execute");
        self.tracer.log_query(stmt);
        let started = Instant::now();
        let mut guard = self.native.lock().await;
        let Some(native) = guard.as_mut() else {
            panic!("execute on stale transaction #{}", self.id);
        };
        let result = bind_args(stmt).execute(&mut **native).await?;
        self.tracer.check_slow_query(&stmt.sql, started);
        Ok(result.rows_affected())
    }

    async fn fetch_all(&self, stmt: &Statement) -> Result<Vec<AnyRow>, DbError> {
        self.ensure_open("fetch_all");
        self.tracer.log_query(stmt);
        let started = Instant::now();
        let mut guard = self.native.lock().await;
        let Some(native) = guard.as_mut() else {
            panic!("fetch_all on stale transaction #{}", self.id);
        };
        let rows = bind_args(stmt).fetch_all(&mut **native).await?;
        self.tracer.check_slow_query(&stmt.sql, started);
        Ok(rows)
    }

    async fn fetch_optional(&self, stmt: &Statement) -> Result<Option<AnyRow>, DbError> {
        self.ensure_open("fetch_optional");
        self.tracer.log_query(stmt);
        let mut guard = self.native.lock().await;
        let Some(native) = guard.as_mut() else {
            panic!("fetch_optional on stale transaction #{}", self.id);
        };
        Ok(bind_args(stmt).fetch_optional(&mut **native).await?)
    }

    async fn execute_script(&self, script: &str) -> Result<(), DbError> {
        self.ensure_open("execute_script");
        let mut guard = self.native.lock().await;
        let Some(native) = guard.as_mut() else {
            panic!("execute_script on stale transaction #{}", self.id);
        };
        sqlx::Executor::execute(&mut **native, script).await?;
        Ok(())
    }
}

/// Transaction manager for database operations
#[derive(Clone)]
pub struct TransactionManager {
    /// Connection manager
    connection: ConnectionManager,
}

impl TransactionManager {
    /// Create new transaction manager
    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection }
    }

    /// Begins a new transaction
    pub async fn begin(&self) -> Result<Arc<Tx>, DbError> {
        Ok(Arc::new(self.connection.begin().await?))
    }

    /// Execute operation within a transaction
    ///
    /// Commits when `operation` succeeds, rolls back on error or panic; a
    /// panic is resumed after the rollback. `operation` must not finish the
    /// transaction itself.
    pub async fn with_transaction<T, F, Fut>(&self, operation: F) -> Result<T, DbError>
    where
        F: FnOnce(Arc<Tx>) -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        let tx = self.begin().await?;

        let outcome = AssertUnwindSafe(operation(tx.clone())).catch_unwind().await;

        match outcome {
            Ok(Ok(value)) => {
                tx.commit().await?;
                info!("Transaction #{} committed successfully", tx.id());
                Ok(value)
            }
            Ok(Err(err)) => {
                if let Err(rb) = tx.rollback().await {
                    error!("Failed to rollback transaction #{}: {}", tx.id(), rb);
                }
                warn!("Transaction #{} rolled back due to error: {}", tx.id(), err);
                Err(err)
            }
            Err(panic) => {
                if let Err(rb) = tx.rollback().await {
                    error!("Failed to rollback transaction #{} after panic: {}", tx.id(), rb);
                }
                error!("Transaction #{} rolled back due to panic", tx.id());
                std::panic::resume_unwind(panic)
            }
        }
    }
}
