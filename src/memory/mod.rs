//! In-process driver with scriptable faults.
//!
//! Sessions store nothing. Each call is recorded in a shared [`OperationLog`] (failed calls
//! included) and consults a shared [`FaultPlan`], which is how tests force a commit to fail
//! or a session to die without patching anything at runtime.

mod faults;
mod session;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::adapter::{Capabilities, NativeError, NativeSession, SessionFactory};

pub use faults::FaultPlan;
pub use session::{MemorySession, NativeOp, OperationLog};

/// Opens [`MemorySession`]s that share one log and one fault plan.
#[derive(Debug, Clone)]
pub struct MemoryFactory {
    capabilities: Capabilities,
    log: OperationLog,
    faults: FaultPlan,
    next_session: Arc<AtomicU64>,
}

impl Default for MemoryFactory {
    fn default() -> Self {
        Self {
            capabilities: Capabilities::all(),
            log: OperationLog::default(),
            faults: FaultPlan::default(),
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl MemoryFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn log(&self) -> OperationLog {
        self.log.clone()
    }

    #[must_use]
    pub fn faults(&self) -> FaultPlan {
        self.faults.clone()
    }

    /// Number of sessions opened so far.
    #[must_use]
    pub fn connections_opened(&self) -> u64 {
        self.next_session.load(Ordering::SeqCst) - 1
    }
}

#[async_trait]
impl SessionFactory for MemoryFactory {
    fn adapter_name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<Box<dyn NativeSession>, NativeError> {
        self.faults.pause().await;
        if self.faults.take_connect_failure() {
            return Err(NativeError::new("memory: connection refused"));
        }
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        self.log.push(id, NativeOp::Connect);
        Ok(Box::new(MemorySession::new(
            id,
            self.capabilities,
            self.log.clone(),
            self.faults.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sessions_share_log_and_faults() {
        let factory = MemoryFactory::new();
        let mut a = factory.connect().await.unwrap();
        let mut b = factory.connect().await.unwrap();
        a.begin().await.unwrap();
        b.execute("SELECT 1", &[]).await.unwrap();

        assert_eq!(factory.connections_opened(), 2);
        assert_eq!(factory.log().ops_for(1), vec![NativeOp::Connect, NativeOp::Begin]);

        factory.faults().kill_all();
        assert!(!a.is_alive().await);
        assert!(!b.is_alive().await);
        let mut c = factory.connect().await.unwrap();
        assert!(c.is_alive().await);
    }

    #[tokio::test]
    async fn connect_failure_is_one_shot() {
        let factory = MemoryFactory::new();
        factory.faults().fail_next_connect();
        assert!(factory.connect().await.is_err());
        assert!(factory.connect().await.is_ok());
    }
}
