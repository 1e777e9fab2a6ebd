//! Capability interface for the host-provided tracking API (SCORM 1.2
//! runtime object). The relay never implements an LMS; it only drives one
//! that the host page exposes.

use std::{fmt, str::FromStr};

use thiserror::Error;

/// Data element holding the learner's completion state.
pub const LESSON_STATUS_KEY: &str = "cmi.core.lesson_status";

/// Values accepted for [`LESSON_STATUS_KEY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LessonStatus {
    Passed,
    Failed,
    Completed,
    Incomplete,
    Browsed,
    NotAttempted,
}

impl LessonStatus {
    pub const ALL: [LessonStatus; 6] = [
        LessonStatus::Passed,
        LessonStatus::Failed,
        LessonStatus::Completed,
        LessonStatus::Incomplete,
        LessonStatus::Browsed,
        LessonStatus::NotAttempted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LessonStatus::Passed => "passed",
            LessonStatus::Failed => "failed",
            LessonStatus::Completed => "completed",
            LessonStatus::Incomplete => "incomplete",
            LessonStatus::Browsed => "browsed",
            LessonStatus::NotAttempted => "not attempted",
        }
    }
}

impl fmt::Display for LessonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown lesson status {0:?}")]
pub struct UnknownLessonStatus(pub String);

impl FromStr for LessonStatus {
    type Err = UnknownLessonStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passed" => Ok(LessonStatus::Passed),
            "failed" => Ok(LessonStatus::Failed),
            "completed" => Ok(LessonStatus::Completed),
            "incomplete" => Ok(LessonStatus::Incomplete),
            "browsed" => Ok(LessonStatus::Browsed),
            "not attempted" | "not-attempted" => Ok(LessonStatus::NotAttempted),
            other => Err(UnknownLessonStatus(other.to_owned())),
        }
    }
}

/// Raw value returned by a tracking call. Runtimes answer with either a
/// boolean or the strings `"true"` / `"false"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiReturn {
    Bool(bool),
    Text(String),
}

impl ApiReturn {
    pub fn is_true(&self) -> bool {
        match self {
            ApiReturn::Bool(value) => *value,
            ApiReturn::Text(text) => text == "true",
        }
    }
}

impl From<bool> for ApiReturn {
    fn from(value: bool) -> Self {
        ApiReturn::Bool(value)
    }
}

impl From<&str> for ApiReturn {
    fn from(value: &str) -> Self {
        ApiReturn::Text(value.to_owned())
    }
}

/// Tracking calls the session makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiCall {
    Initialize,
    SetValue,
    Commit,
    Finish,
}

impl ApiCall {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiCall::Initialize => "LMSInitialize",
            ApiCall::SetValue => "LMSSetValue",
            ApiCall::Commit => "LMSCommit",
            ApiCall::Finish => "LMSFinish",
        }
    }
}

impl fmt::Display for ApiCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracking call that blew up instead of returning a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{call} raised: {message}")]
pub struct TrackingFault {
    pub call: ApiCall,
    pub message: String,
}

impl TrackingFault {
    pub fn new(call: ApiCall, message: impl Into<String>) -> Self {
        Self {
            call,
            message: message.into(),
        }
    }
}

/// Host tracking runtime. Owned by the host window; the relay only keeps
/// weak references to it.
pub trait TrackingApi: Send + Sync {
    fn lms_initialize(&self) -> Result<ApiReturn, TrackingFault>;
    fn lms_set_value(&self, element: &str, value: &str) -> Result<ApiReturn, TrackingFault>;
    fn lms_commit(&self) -> Result<ApiReturn, TrackingFault>;
    fn lms_finish(&self) -> Result<ApiReturn, TrackingFault>;
    fn lms_get_last_error(&self) -> String;
    fn lms_get_error_string(&self, code: &str) -> String;
}
