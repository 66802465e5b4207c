use crate::config::GateConfig;
use crate::driver::{ConnectionRole, DriverError, RelationalDriver, StatementOutput};
use crate::error::{GateError, TransientFault};
use crate::query::plan::Statement;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Largest exponent used for deadlock backoff.
const MAX_BACKOFF_SHIFT: u32 = 16;

/// What a driver failure means for the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    DuplicateKey,
    ConnectionLost,
    Deadlock,
    Fatal,
}

pub fn classify(error: &DriverError) -> FaultClass {
    match error.code {
        Some(1062) => return FaultClass::DuplicateKey,
        Some(2006 | 2013) => return FaultClass::ConnectionLost,
        Some(1205 | 1213) => return FaultClass::Deadlock,
        _ => {}
    }
    let message = error.message.as_str();
    if error.sql_state.as_deref() == Some("23000") && message.contains("Duplicate entry") {
        FaultClass::DuplicateKey
    } else if message.contains("gone away") || message.contains("Lost connection") {
        FaultClass::ConnectionLost
    } else if message.contains("Deadlock found") || message.contains("Lock wait timeout") {
        FaultClass::Deadlock
    } else {
        FaultClass::Fatal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_reconnect_attempts: u32,
    pub max_deadlock_attempts: u32,
    pub backoff_unit: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &GateConfig) -> Self {
        Self {
            max_reconnect_attempts: config.max_reconnect_attempts,
            max_deadlock_attempts: config.max_deadlock_attempts,
            backoff_unit: config.deadlock_backoff_unit,
        }
    }

    /// `backoff_unit * 2^attempt`.
    pub fn deadlock_backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit
            .saturating_mul(1u32 << attempt.min(MAX_BACKOFF_SHIFT))
    }

    /// Transition taken after a failed attempt. The two counters are bounded
    /// independently; exhausting either one is terminal.
    pub fn on_failure(
        &self,
        counters: &mut RetryCounters,
        table: &str,
        error: DriverError,
    ) -> RetryState {
        match classify(&error) {
            FaultClass::DuplicateKey => RetryState::Failed(GateError::DuplicateKey {
                entity: table.to_string(),
                message: error.message,
            }),
            FaultClass::ConnectionLost => {
                counters.reconnects += 1;
                if counters.reconnects > self.max_reconnect_attempts {
                    RetryState::Failed(GateError::TransientStorageFault {
                        fault: TransientFault::ConnectionLost,
                        attempts: counters.executions,
                        message: error.message,
                    })
                } else {
                    RetryState::ReconnectWait
                }
            }
            FaultClass::Deadlock => {
                counters.deadlocks += 1;
                if counters.deadlocks > self.max_deadlock_attempts {
                    RetryState::Failed(GateError::TransientStorageFault {
                        fault: TransientFault::Deadlock,
                        attempts: counters.executions,
                        message: error.message,
                    })
                } else {
                    RetryState::DeadlockWait(self.deadlock_backoff(counters.deadlocks))
                }
            }
            FaultClass::Fatal => RetryState::Failed(GateError::FatalStorageFault {
                message: error.message,
            }),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&GateConfig::default())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryCounters {
    pub executions: u32,
    pub reconnects: u32,
    pub deadlocks: u32,
}

#[derive(Debug)]
pub enum RetryState {
    Attempting,
    ReconnectWait,
    DeadlockWait(Duration),
    Failed(GateError),
    Succeeded(StatementOutput),
}

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records requested sleeps and returns immediately.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    slept: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<Duration> {
        self.slept.lock().clone()
    }
}

impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().push(duration);
    }
}

/// Runs relational statements through the classified retry loop.
pub struct StatementExecutor<D, S = TokioSleeper> {
    driver: Arc<D>,
    sleeper: S,
    policy: RetryPolicy,
}

impl<D: RelationalDriver> StatementExecutor<D, TokioSleeper> {
    pub fn new(driver: Arc<D>, policy: RetryPolicy) -> Self {
        Self::with_sleeper(driver, policy, TokioSleeper)
    }
}

impl<D: RelationalDriver, S: Sleeper> StatementExecutor<D, S> {
    pub fn with_sleeper(driver: Arc<D>, policy: RetryPolicy, sleeper: S) -> Self {
        Self {
            driver,
            sleeper,
            policy,
        }
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn execute(
        &self,
        role: ConnectionRole,
        statement: &Statement,
    ) -> Result<StatementOutput, GateError> {
        let table = statement.table();
        let mut counters = RetryCounters::default();
        let mut state = RetryState::Attempting;
        loop {
            state = match state {
                RetryState::Attempting => {
                    counters.executions += 1;
                    debug!(
                        kind = statement.kind(),
                        table,
                        role = role.as_str(),
                        attempt = counters.executions,
                        "executing statement"
                    );
                    match self.driver.execute(role, statement).await {
                        Ok(output) => RetryState::Succeeded(output),
                        Err(err) => self.policy.on_failure(&mut counters, table, err),
                    }
                }
                RetryState::ReconnectWait => {
                    warn!(
                        table,
                        role = role.as_str(),
                        reconnects = counters.reconnects,
                        "connection lost, reconnecting"
                    );
                    match self.driver.reconnect(role).await {
                        Ok(()) => RetryState::Attempting,
                        Err(err) => self.policy.on_failure(&mut counters, table, err),
                    }
                }
                RetryState::DeadlockWait(backoff) => {
                    warn!(
                        table,
                        deadlocks = counters.deadlocks,
                        backoff_ms = backoff.as_millis() as u64,
                        "deadlock detected, retrying"
                    );
                    self.sleeper.sleep(backoff).await;
                    RetryState::Attempting
                }
                RetryState::Succeeded(output) => return Ok(output),
                RetryState::Failed(err) => return Err(err),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FaultClass, RetryCounters, RetryPolicy, RetryState, classify};
    use crate::driver::DriverError;
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_reconnect_attempts: 2,
            max_deadlock_attempts: 2,
            backoff_unit: Duration::from_secs(1),
        }
    }

    #[test]
    fn classification_uses_codes_then_messages() {
        assert_eq!(
            classify(&DriverError::duplicate_entry("A", "sku")),
            FaultClass::DuplicateKey
        );
        assert_eq!(
            classify(&DriverError::new("Lost connection to server")),
            FaultClass::ConnectionLost
        );
        assert_eq!(
            classify(&DriverError::lock_wait_timeout()),
            FaultClass::Deadlock
        );
        assert_eq!(
            classify(&DriverError::new("Unknown column 'x'").with_code(1054)),
            FaultClass::Fatal
        );
        assert_eq!(
            classify(&DriverError::new("Cannot add or update a child row").with_sql_state("23000")),
            FaultClass::Fatal
        );
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let p = policy();
        assert_eq!(p.deadlock_backoff(1), Duration::from_secs(2));
        assert_eq!(p.deadlock_backoff(2), Duration::from_secs(4));
        assert_eq!(p.deadlock_backoff(3), Duration::from_secs(8));
    }

    #[test]
    fn counters_are_independent_and_bounded() {
        let p = policy();
        let mut counters = RetryCounters::default();
        assert!(matches!(
            p.on_failure(&mut counters, "t", DriverError::deadlock()),
            RetryState::DeadlockWait(d) if d == Duration::from_secs(2)
        ));
        assert!(matches!(
            p.on_failure(&mut counters, "t", DriverError::server_gone_away()),
            RetryState::ReconnectWait
        ));
        assert!(matches!(
            p.on_failure(&mut counters, "t", DriverError::deadlock()),
            RetryState::DeadlockWait(d) if d == Duration::from_secs(4)
        ));
        match p.on_failure(&mut counters, "t", DriverError::deadlock()) {
            RetryState::Failed(err) => assert_eq!(err.code_str(), "transient_storage_fault"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(counters.reconnects, 1);
    }

    #[test]
    fn duplicate_key_is_not_retried() {
        let mut counters = RetryCounters::default();
        match policy().on_failure(
            &mut counters,
            "products",
            DriverError::duplicate_entry("A-1", "sku"),
        ) {
            RetryState::Failed(err) => assert_eq!(err.code_str(), "duplicate_key"),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
