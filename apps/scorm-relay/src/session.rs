use std::sync::{Arc, Weak};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::locator::{ApiDiscovery, LocateError};
use crate::tracking::{ApiCall, LessonStatus, TrackingApi, TrackingFault, LESSON_STATUS_KEY};

/// Lifecycle of a tracking session. Strictly linear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Initialized,
    AlreadyInitialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Recorded,
    AlreadyCompleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("SCORM API not found; content keeps working but progress is not tracked")]
    ApiNotFound,
    #[error("SCORM session is not initialized")]
    NotInitialized,
    #[error("SCORM session already terminated")]
    Terminated,
    #[error("tracking API was released by its host window")]
    ApiDetached,
    #[error("{call} failed: Error {code} - {message}")]
    ApiCallFailed {
        call: ApiCall,
        code: String,
        message: String,
    },
    #[error(transparent)]
    Fault(#[from] TrackingFault),
}

impl From<LocateError> for SessionError {
    fn from(value: LocateError) -> Self {
        match value {
            LocateError::NotFound => SessionError::ApiNotFound,
        }
    }
}

/// What happened while closing the session. Termination never fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// Nothing to close: never initialized, or already terminated.
    NotActive,
    Finished,
    Rejected { code: String },
    Faulted(TrackingFault),
    Detached,
}

/// One host page's tracking session.
pub struct Session {
    discovery: Box<dyn ApiDiscovery>,
    api: Option<Weak<dyn TrackingApi>>,
    state: SessionState,
    completed: bool,
}

impl Session {
    pub fn new(discovery: impl ApiDiscovery + 'static) -> Self {
        Self {
            discovery: Box::new(discovery),
            api: None,
            state: SessionState::Uninitialized,
            completed: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Whether discovery found a runtime that is still alive, regardless of
    /// whether it accepted the session.
    pub fn api_available(&self) -> bool {
        self.api
            .as_ref()
            .is_some_and(|api| api.strong_count() > 0)
    }

    pub fn initialize(&mut self) -> Result<InitOutcome, SessionError> {
        match self.state {
            SessionState::Initialized => {
                debug!("session already initialized");
                return Ok(InitOutcome::AlreadyInitialized);
            }
            SessionState::Terminated => return Err(SessionError::Terminated),
            SessionState::Uninitialized => {}
        }

        let located = self.discovery.discover()?;
        info!(
            global = located.global.name(),
            phase = ?located.phase,
            level = located.level,
            "tracking API located"
        );
        self.api = Some(Arc::downgrade(&located.api));
        let api = located.api;

        if !api.lms_initialize()?.is_true() {
            return Err(call_failed(api.as_ref(), ApiCall::Initialize));
        }
        self.state = SessionState::Initialized;
        info!("tracking session initialized");

        if let Err(err) = self.set_status(LessonStatus::Incomplete) {
            warn!(error = %err, "failed to record initial lesson status");
        }
        commit_logged(api.as_ref());

        Ok(InitOutcome::Initialized)
    }

    /// Writes the lesson status and commits it straight away.
    pub fn set_status(&mut self, status: LessonStatus) -> Result<(), SessionError> {
        match self.state {
            SessionState::Initialized => {}
            SessionState::Uninitialized => {
                debug!(%status, "cannot set status before initialization");
                return Err(SessionError::NotInitialized);
            }
            SessionState::Terminated => return Err(SessionError::Terminated),
        }
        let api = self.live_api()?;

        if !api.lms_set_value(LESSON_STATUS_KEY, status.as_str())?.is_true() {
            let err = call_failed(api.as_ref(), ApiCall::SetValue);
            warn!(%status, error = %err, "failed to set lesson status");
            return Err(err);
        }
        debug!(%status, "lesson status set");
        commit_logged(api.as_ref());
        Ok(())
    }

    /// Records completion once. Later calls succeed without touching the API.
    pub fn mark_complete(&mut self) -> Result<CompletionOutcome, SessionError> {
        if self.completed {
            debug!("course already marked as complete");
            return Ok(CompletionOutcome::AlreadyCompleted);
        }
        self.set_status(LessonStatus::Completed)?;
        self.completed = true;
        info!("course completion recorded");
        Ok(CompletionOutcome::Recorded)
    }

    /// Commits and ends the session. Moves to `Terminated` whatever the API
    /// reports, since this runs during teardown with no chance to retry.
    pub fn terminate(&mut self) -> TerminateOutcome {
        if self.state != SessionState::Initialized {
            debug!(state = ?self.state, "no active tracking session to terminate");
            return TerminateOutcome::NotActive;
        }
        self.state = SessionState::Terminated;

        let Ok(api) = self.live_api() else {
            warn!("tracking API released before termination");
            return TerminateOutcome::Detached;
        };

        commit_logged(api.as_ref());
        match api.lms_finish() {
            Ok(result) if result.is_true() => {
                info!("tracking session finished");
                TerminateOutcome::Finished
            }
            Ok(result) => {
                let code = api.lms_get_last_error();
                warn!(?result, code = %code, "LMSFinish did not succeed");
                TerminateOutcome::Rejected { code }
            }
            Err(fault) => {
                warn!(error = %fault, "LMSFinish raised");
                TerminateOutcome::Faulted(fault)
            }
        }
    }

    fn live_api(&self) -> Result<Arc<dyn TrackingApi>, SessionError> {
        self.api
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(SessionError::ApiDetached)
    }
}

fn call_failed(api: &dyn TrackingApi, call: ApiCall) -> SessionError {
    let code = api.lms_get_last_error();
    let message = api.lms_get_error_string(&code);
    SessionError::ApiCallFailed {
        call,
        code,
        message,
    }
}

fn commit_logged(api: &dyn TrackingApi) {
    match api.lms_commit() {
        Ok(result) if result.is_true() => debug!("data committed"),
        Ok(_) => {
            let code = api.lms_get_last_error();
            warn!(code = %code, "LMSCommit did not succeed");
        }
        Err(fault) => warn!(error = %fault, "LMSCommit raised"),
    }
}
