//! Completion relay between content in a cross-origin iframe and the SCORM
//! runtime of the LMS hosting it.
//!
//! The content side ([`content::ContentBridge`]) posts commands to its parent
//! window. The host side ([`host::HostBridge`]) checks the sender's origin,
//! drives the tracking [`session::Session`] and acknowledges each command.
//! The session finds the runtime by hunting through ancestor and opener
//! windows ([`locator`]).

pub mod config;
pub mod content;
pub mod demo;
pub mod host;
pub mod locator;
pub mod origin;
pub mod recording;
pub mod session;
pub mod tracking;
pub mod window;

pub use config::{ConfigError, RelayConfig};
pub use content::{AckOutcome, BridgeObserver, ContentBridge, PendingAck, SendError};
pub use host::{AckTarget, Dispatch, DropReason, HostBridge};
pub use origin::OriginAllowList;
pub use session::{Session, SessionError, SessionState};
pub use window::{channel_pair, MessageEvent, TargetOrigin, WindowPort};
