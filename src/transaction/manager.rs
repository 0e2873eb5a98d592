use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use super::frame::TransactionFrame;
use super::options::TransactionOptions;
use crate::adapter::NativeSession;
use crate::callbacks::{
    ActionKind, DispatchReport, Participant, ParticipantId, TransactionCallbacks, dispatch,
};
use crate::error::SqlCoordinatorError;
use crate::tx_outcome::{CloseReport, FrameState, Outcome};

/// What a `begin_transaction` call did; hand it back to `close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a scope must be closed with commit or rollback"]
pub enum TransactionScope {
    /// A new frame was pushed at `depth`.
    Opened { depth: usize },
    /// The call reused the open frame at `depth`; closing it is a no-op.
    Joined { depth: usize },
}

impl TransactionScope {
    #[must_use]
    pub fn depth(self) -> usize {
        match self {
            TransactionScope::Opened { depth } | TransactionScope::Joined { depth } => depth,
        }
    }
}

/// Frame stack and participant bookkeeping for one connection.
///
/// Only the task holding the connection lease touches it, so nothing here is synchronised.
#[derive(Debug, Default)]
pub struct TransactionManager {
    frames: Vec<TransactionFrame>,
    /// Participants already told the outcome during the current outer transaction.
    notified: HashSet<ParticipantId>,
}

impl TransactionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn open_transactions(&self) -> usize {
        self.frames.len()
    }

    /// Depth of the innermost open frame.
    #[must_use]
    pub fn current_depth(&self) -> Option<usize> {
        self.frames.last().map(TransactionFrame::depth)
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.frames.is_empty()
    }

    #[must_use]
    pub fn current_frame(&self) -> Option<&TransactionFrame> {
        self.frames.last()
    }

    /// Open a frame, or join the innermost one.
    ///
    /// # Errors
    /// Returns `TransactionIsolation` for an isolation level that cannot apply here, and
    /// `StatementInvalid` when the native begin or savepoint call fails.
    pub async fn begin_transaction(
        &mut self,
        session: &mut dyn NativeSession,
        options: &TransactionOptions,
    ) -> Result<TransactionScope, SqlCoordinatorError> {
        let capabilities = session.capabilities();

        let Some(current) = self.frames.last() else {
            match options.isolation {
                Some(level) => {
                    if !capabilities.transaction_isolation {
                        return Err(SqlCoordinatorError::TransactionIsolation(format!(
                            "adapter does not support setting isolation level {level}"
                        )));
                    }
                    session.begin_isolated(level).await.map_err(|e| {
                        SqlCoordinatorError::statement_invalid(
                            format!("BEGIN ISOLATION LEVEL {level}"),
                            e,
                        )
                    })?;
                }
                None => session
                    .begin()
                    .await
                    .map_err(|e| SqlCoordinatorError::statement_invalid("BEGIN", e))?,
            }
            self.notified.clear();
            self.frames.push(TransactionFrame::new(0, options.joinable));
            debug!(depth = 0, "opened transaction");
            return Ok(TransactionScope::Opened { depth: 0 });
        };

        if !options.requires_new && current.is_joinable() {
            if options.isolation.is_some() {
                return Err(SqlCoordinatorError::TransactionIsolation(
                    "cannot set isolation when joining a transaction".into(),
                ));
            }
            return Ok(TransactionScope::Joined {
                depth: current.depth(),
            });
        }

        if options.isolation.is_some() {
            return Err(SqlCoordinatorError::TransactionIsolation(
                "cannot set transaction isolation in a nested transaction".into(),
            ));
        }
        if !capabilities.savepoints {
            return Err(SqlCoordinatorError::Unimplemented(
                "adapter does not support savepoints".into(),
            ));
        }

        let frame = TransactionFrame::new(self.frames.len(), options.joinable);
        let depth = frame.depth();
        if let Some(name) = frame.savepoint() {
            session.create_savepoint(name).await.map_err(|e| {
                SqlCoordinatorError::statement_invalid(format!("SAVEPOINT {name}"), e)
            })?;
        }
        self.frames.push(frame);
        debug!(depth, "opened savepoint");
        Ok(TransactionScope::Opened { depth })
    }

    /// Record that `id` took part in the innermost frame.
    ///
    /// A participant already present anywhere in the open lineage, or already notified during
    /// this outer transaction, is left as it is.
    ///
    /// # Errors
    /// Returns `NoActiveTransaction` when no frame is open.
    pub fn register_participant(
        &mut self,
        id: impl Into<ParticipantId>,
        action: ActionKind,
        callbacks: Arc<TransactionCallbacks>,
    ) -> Result<(), SqlCoordinatorError> {
        let id = id.into();
        if self.frames.is_empty() {
            return Err(SqlCoordinatorError::NoActiveTransaction);
        }
        if self.notified.contains(&id) || self.frames.iter().any(|f| f.contains(&id)) {
            debug!(participant = %id, "participant already registered");
            return Ok(());
        }
        if let Some(frame) = self.frames.last_mut() {
            frame.register(Participant::new(id, action, callbacks));
        }
        Ok(())
    }

    /// End the frame `scope` refers to.
    ///
    /// # Errors
    /// Returns `ExecutionError` when `scope` is not the innermost frame, and
    /// `StatementInvalid` when the native call fails. A failed commit or savepoint release
    /// has already been turned into a rollback, callbacks included, by the time it is
    /// returned.
    pub async fn close(
        &mut self,
        session: &mut dyn NativeSession,
        scope: TransactionScope,
        outcome: Outcome,
    ) -> Result<CloseReport, SqlCoordinatorError> {
        let depth = match scope {
            TransactionScope::Joined { depth } => {
                if depth >= self.frames.len() {
                    return Err(SqlCoordinatorError::ExecutionError(format!(
                        "joined transaction at depth {depth} is no longer open"
                    )));
                }
                return Ok(CloseReport::joined(depth));
            }
            TransactionScope::Opened { depth } => depth,
        };
        if depth + 1 != self.frames.len() {
            return Err(SqlCoordinatorError::ExecutionError(format!(
                "transaction at depth {depth} is not the innermost open frame ({} open)",
                self.frames.len()
            )));
        }
        let Some(mut frame) = self.frames.pop() else {
            return Err(SqlCoordinatorError::NoActiveTransaction);
        };

        match frame.savepoint().map(str::to_owned) {
            Some(name) => self.close_savepoint(session, frame, &name, outcome).await,
            None => {
                let result = self.close_outer(session, &mut frame, outcome).await;
                self.notified.clear();
                result
            }
        }
    }

    async fn close_savepoint(
        &mut self,
        session: &mut dyn NativeSession,
        mut frame: TransactionFrame,
        name: &str,
        outcome: Outcome,
    ) -> Result<CloseReport, SqlCoordinatorError> {
        let depth = frame.depth();
        if outcome == Outcome::Commit {
            match session.release_savepoint(name).await {
                Ok(()) => {
                    let participants = frame.finish(FrameState::Committed);
                    if let Some(parent) = self.frames.last_mut() {
                        parent.absorb(participants);
                    }
                    debug!(depth, "released savepoint");
                    return Ok(CloseReport {
                        depth,
                        state: FrameState::Committed,
                        notified: 0,
                        callback_failures: Vec::new(),
                    });
                }
                Err(e) => {
                    warn!(depth, error = %e, "release savepoint failed; rolling back to it");
                    if let Err(rollback_err) = session.rollback_to_savepoint(name).await {
                        warn!(depth, error = %rollback_err, "rollback to savepoint failed");
                    }
                    self.roll_back_frame(&mut frame);
                    return Err(SqlCoordinatorError::statement_invalid(
                        format!("RELEASE SAVEPOINT {name}"),
                        e,
                    ));
                }
            }
        }

        let native = session.rollback_to_savepoint(name).await;
        let report = self.roll_back_frame(&mut frame);
        debug!(depth, notified = report.notified, "rolled back savepoint");
        native.map_err(|e| {
            SqlCoordinatorError::statement_invalid(format!("ROLLBACK TO SAVEPOINT {name}"), e)
        })?;
        Ok(CloseReport {
            depth,
            state: FrameState::RolledBack,
            notified: report.notified,
            callback_failures: report.failures,
        })
    }

    async fn close_outer(
        &mut self,
        session: &mut dyn NativeSession,
        frame: &mut TransactionFrame,
        outcome: Outcome,
    ) -> Result<CloseReport, SqlCoordinatorError> {
        let native = match outcome {
            Outcome::Commit => session.commit().await.map_err(|e| ("COMMIT", e)),
            Outcome::Rollback => session.rollback().await.map_err(|e| ("ROLLBACK", e)),
        };

        match native {
            Ok(()) => {
                let state = match outcome {
                    Outcome::Commit => FrameState::Committed,
                    Outcome::Rollback => FrameState::RolledBack,
                };
                let participants = frame.finish(state);
                let report = dispatch(outcome, &participants);
                debug!(%outcome, notified = report.notified, "closed transaction");
                Ok(CloseReport {
                    depth: 0,
                    state,
                    notified: report.notified,
                    callback_failures: report.failures,
                })
            }
            Err((sql, e)) => {
                if outcome == Outcome::Commit {
                    warn!(error = %e, "commit failed; rolling back");
                    if let Err(rollback_err) = session.rollback().await {
                        warn!(error = %rollback_err, "rollback after failed commit also failed");
                    }
                }
                self.roll_back_frame(frame);
                Err(SqlCoordinatorError::statement_invalid(sql, e))
            }
        }
    }

    /// Mark `frame` rolled back and notify exactly its participants.
    fn roll_back_frame(&mut self, frame: &mut TransactionFrame) -> DispatchReport {
        let participants = frame.finish(FrameState::RolledBack);
        let report = dispatch(Outcome::Rollback, &participants);
        if frame.depth() > 0 {
            self.notified
                .extend(participants.into_iter().map(|p| p.id));
        }
        report
    }

    /// Drop every open frame without touching the session, telling all participants the
    /// work was rolled back. Used when a connection is discarded mid-transaction.
    pub fn abandon(&mut self) -> DispatchReport {
        let mut report = DispatchReport::default();
        while let Some(mut frame) = self.frames.pop() {
            report.merge(self.roll_back_frame(&mut frame));
        }
        self.notified.clear();
        report
    }
}
