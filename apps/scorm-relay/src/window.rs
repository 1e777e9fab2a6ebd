//! Cross-window messaging primitive.
//!
//! A [`WindowPort`] posts into one window. Every delivered [`MessageEvent`]
//! carries the poster's origin and a port back to the poster, so replies go
//! to whoever asked. [`channel_pair`] wires two in-process windows together
//! over unbounded tokio channels.

use std::{fmt, str::FromStr, sync::Arc};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

/// `targetOrigin` argument of a post.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TargetOrigin {
    /// `"*"`: deliver whatever the receiving window's origin is.
    #[default]
    Any,
    Exact(String),
}

impl TargetOrigin {
    pub fn matches(&self, origin: &str) -> bool {
        match self {
            TargetOrigin::Any => true,
            TargetOrigin::Exact(expected) => expected == origin,
        }
    }
}

impl FromStr for TargetOrigin {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Ok(match trimmed {
            "*" | "" => TargetOrigin::Any,
            origin => TargetOrigin::Exact(origin.trim_end_matches('/').to_owned()),
        })
    }
}

impl fmt::Display for TargetOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetOrigin::Any => f.write_str("*"),
            TargetOrigin::Exact(origin) => f.write_str(origin),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PostError {
    #[error("target window is closed")]
    Closed,
}

/// Handle for posting into a window.
pub trait WindowPort: Send + Sync {
    /// Origin of the window this port posts into.
    fn origin(&self) -> &str;

    /// Posts `data`. A `target_origin` that does not match the receiving
    /// window is not an error; the message is silently discarded.
    fn post_message(&self, data: Value, target_origin: &TargetOrigin) -> Result<(), PostError>;
}

/// A message as seen by the receiving window.
#[derive(Clone)]
pub struct MessageEvent {
    pub origin: String,
    pub data: Value,
    /// Port back to the poster. `None` when the poster is gone or unknown.
    pub source: Option<Arc<dyn WindowPort>>,
}

impl MessageEvent {
    pub fn new(origin: impl Into<String>, data: Value) -> Self {
        Self {
            origin: origin.into(),
            data,
            source: None,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn WindowPort>) -> Self {
        self.source = Some(source);
        self
    }
}

impl fmt::Debug for MessageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageEvent")
            .field("origin", &self.origin)
            .field("data", &self.data)
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<MessageEvent>;

/// In-process port. Knows the inbox it posts into and the inbox of the
/// poster, so each delivered event can carry its own reply port.
#[derive(Clone)]
pub struct ChannelPort {
    window_origin: String,
    inbox: mpsc::UnboundedSender<MessageEvent>,
    poster_origin: String,
    poster_inbox: mpsc::UnboundedSender<MessageEvent>,
}

impl ChannelPort {
    fn reversed(&self) -> Self {
        Self {
            window_origin: self.poster_origin.clone(),
            inbox: self.poster_inbox.clone(),
            poster_origin: self.window_origin.clone(),
            poster_inbox: self.inbox.clone(),
        }
    }
}

impl WindowPort for ChannelPort {
    fn origin(&self) -> &str {
        &self.window_origin
    }

    fn post_message(&self, data: Value, target_origin: &TargetOrigin) -> Result<(), PostError> {
        if !target_origin.matches(&self.window_origin) {
            trace!(
                target_origin = %target_origin,
                window_origin = %self.window_origin,
                "target origin mismatch, message discarded"
            );
            return Ok(());
        }
        let event = MessageEvent {
            origin: self.poster_origin.clone(),
            data,
            source: Some(Arc::new(self.reversed())),
        };
        self.inbox.send(event).map_err(|_| PostError::Closed)
    }
}

/// A host window with one embedded content window.
pub struct WindowPair {
    /// Held by the content; posts into the host.
    pub parent: Arc<ChannelPort>,
    /// Held by the host; posts into the content.
    pub child: Arc<ChannelPort>,
    pub host_events: EventReceiver,
    pub content_events: EventReceiver,
}

pub fn channel_pair(host_origin: impl Into<String>, content_origin: impl Into<String>) -> WindowPair {
    let host_origin = host_origin.into();
    let content_origin = content_origin.into();
    let (host_tx, host_events) = mpsc::unbounded_channel();
    let (content_tx, content_events) = mpsc::unbounded_channel();

    let parent = ChannelPort {
        window_origin: host_origin,
        inbox: host_tx,
        poster_origin: content_origin,
        poster_inbox: content_tx,
    };
    let child = parent.reversed();

    WindowPair {
        parent: Arc::new(parent),
        child: Arc::new(child),
        host_events,
        content_events,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn target_origin_parsing() {
        assert_eq!("*".parse::<TargetOrigin>(), Ok(TargetOrigin::Any));
        assert_eq!(
            "https://lms.example/".parse::<TargetOrigin>(),
            Ok(TargetOrigin::Exact("https://lms.example".into()))
        );
        assert!(TargetOrigin::Any.matches("null"));
        assert!(!TargetOrigin::Exact("https://a.example".into()).matches("https://b.example"));
    }

    #[test]
    fn events_carry_origin_and_reply_port() {
        let mut pair = channel_pair("https://lms.example", "https://content.example");
        pair.parent
            .post_message(json!({"hello": 1}), &TargetOrigin::Any)
            .expect("post");

        let event = pair.host_events.try_recv().expect("delivered");
        assert_eq!(event.origin, "https://content.example");
        let source = event.source.expect("source");
        assert_eq!(source.origin(), "https://content.example");

        source
            .post_message(json!({"reply": true}), &TargetOrigin::Any)
            .expect("reply");
        let reply = pair.content_events.try_recv().expect("reply delivered");
        assert_eq!(reply.origin, "https://lms.example");
        assert_eq!(reply.data, json!({"reply": true}));
    }

    #[test]
    fn mismatched_target_is_discarded_silently() {
        let mut pair = channel_pair("https://lms.example", "https://content.example");
        let target = TargetOrigin::Exact("https://elsewhere.example".into());
        assert_eq!(pair.parent.post_message(json!({}), &target), Ok(()));
        assert!(pair.host_events.try_recv().is_err());
    }

    #[test]
    fn closed_window_reports_error() {
        let pair = channel_pair("https://lms.example", "https://content.example");
        let WindowPair {
            parent,
            host_events,
            ..
        } = pair;
        drop(host_events);
        assert_eq!(
            parent.post_message(json!({}), &TargetOrigin::Any),
            Err(PostError::Closed)
        );
    }
}
