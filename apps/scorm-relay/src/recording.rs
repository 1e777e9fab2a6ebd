//! In-memory tracking runtime that behaves like a strict SCORM 1.2 LMS and
//! records every call. Backs the `demo` command and the test suites.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::tracking::{
    ApiCall, ApiReturn, LessonStatus, TrackingApi, TrackingFault, LESSON_STATUS_KEY,
};

pub const NO_ERROR: &str = "0";
pub const GENERAL_EXCEPTION: &str = "101";
pub const INVALID_ARGUMENT: &str = "201";
pub const NOT_INITIALIZED: &str = "301";
pub const INCORRECT_DATA_TYPE: &str = "405";

/// One call as observed by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    Initialize,
    SetValue { element: String, value: String },
    Commit,
    Finish,
}

impl RecordedCall {
    pub fn kind(&self) -> ApiCall {
        match self {
            RecordedCall::Initialize => ApiCall::Initialize,
            RecordedCall::SetValue { .. } => ApiCall::SetValue,
            RecordedCall::Commit => ApiCall::Commit,
            RecordedCall::Finish => ApiCall::Finish,
        }
    }
}

enum Scripted {
    Reject { code: String },
    Raise { message: String },
}

#[derive(Default)]
struct Runtime {
    calls: Vec<RecordedCall>,
    values: BTreeMap<String, String>,
    committed: BTreeMap<String, String>,
    running: bool,
    last_error: String,
    scripted: HashMap<ApiCall, Scripted>,
}

#[derive(Default)]
pub struct RecordingTrackingApi {
    runtime: Mutex<Runtime>,
}

impl RecordingTrackingApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `call` return `"false"` with `code` as last error.
    pub fn reject_next(&self, call: ApiCall, code: &str) {
        self.runtime.lock().scripted.insert(
            call,
            Scripted::Reject {
                code: code.to_owned(),
            },
        );
    }

    /// Makes the next `call` raise instead of returning.
    pub fn raise_next(&self, call: ApiCall, message: &str) {
        self.runtime.lock().scripted.insert(
            call,
            Scripted::Raise {
                message: message.to_owned(),
            },
        );
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.runtime.lock().calls.clone()
    }

    pub fn count(&self, call: ApiCall) -> usize {
        self.runtime
            .lock()
            .calls
            .iter()
            .filter(|recorded| recorded.kind() == call)
            .count()
    }

    /// Last value written for `element`, committed or not.
    pub fn value(&self, element: &str) -> Option<String> {
        self.runtime.lock().values.get(element).cloned()
    }

    /// Value for `element` as of the last successful commit.
    pub fn committed_value(&self, element: &str) -> Option<String> {
        self.runtime.lock().committed.get(element).cloned()
    }

    pub fn is_running(&self) -> bool {
        self.runtime.lock().running
    }

    fn call(
        &self,
        recorded: RecordedCall,
        apply: impl FnOnce(&mut Runtime) -> Result<(), &'static str>,
    ) -> Result<ApiReturn, TrackingFault> {
        let mut runtime = self.runtime.lock();
        let kind = recorded.kind();
        runtime.calls.push(recorded);

        match runtime.scripted.remove(&kind) {
            Some(Scripted::Raise { message }) => {
                runtime.last_error = GENERAL_EXCEPTION.to_owned();
                return Err(TrackingFault::new(kind, message));
            }
            Some(Scripted::Reject { code }) => {
                runtime.last_error = code;
                return Ok(ApiReturn::from("false"));
            }
            None => {}
        }

        match apply(&mut *runtime) {
            Ok(()) => {
                runtime.last_error = NO_ERROR.to_owned();
                Ok(ApiReturn::from("true"))
            }
            Err(code) => {
                runtime.last_error = code.to_owned();
                Ok(ApiReturn::from("false"))
            }
        }
    }
}

impl TrackingApi for RecordingTrackingApi {
    fn lms_initialize(&self) -> Result<ApiReturn, TrackingFault> {
        self.call(RecordedCall::Initialize, |runtime| {
            if runtime.running {
                return Err(GENERAL_EXCEPTION);
            }
            runtime.running = true;
            Ok(())
        })
    }

    fn lms_set_value(&self, element: &str, value: &str) -> Result<ApiReturn, TrackingFault> {
        let recorded = RecordedCall::SetValue {
            element: element.to_owned(),
            value: value.to_owned(),
        };
        self.call(recorded, |runtime| {
            if !runtime.running {
                return Err(NOT_INITIALIZED);
            }
            if element != LESSON_STATUS_KEY {
                return Err(INVALID_ARGUMENT);
            }
            if value.parse::<LessonStatus>().is_err() {
                return Err(INCORRECT_DATA_TYPE);
            }
            runtime.values.insert(element.to_owned(), value.to_owned());
            Ok(())
        })
    }

    fn lms_commit(&self) -> Result<ApiReturn, TrackingFault> {
        self.call(RecordedCall::Commit, |runtime| {
            if !runtime.running {
                return Err(NOT_INITIALIZED);
            }
            runtime.committed = runtime.values.clone();
            Ok(())
        })
    }

    fn lms_finish(&self) -> Result<ApiReturn, TrackingFault> {
        self.call(RecordedCall::Finish, |runtime| {
            if !runtime.running {
                return Err(NOT_INITIALIZED);
            }
            runtime.running = false;
            Ok(())
        })
    }

    fn lms_get_last_error(&self) -> String {
        self.runtime.lock().last_error.clone()
    }

    fn lms_get_error_string(&self, code: &str) -> String {
        match code {
            NO_ERROR | "" => "No error",
            GENERAL_EXCEPTION => "General exception",
            INVALID_ARGUMENT => "Invalid argument error",
            NOT_INITIALIZED => "Not initialized",
            INCORRECT_DATA_TYPE => "Incorrect data type",
            _ => "Unknown error",
        }
        .to_owned()
    }
}
