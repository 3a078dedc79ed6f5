//! Message broker side of the node: capture requests come in, captured
//! frames go out.

pub mod packet;
pub mod session;

pub use session::{MqttSession, SessionOptions};

use tracing::warn;

use crate::frame::FrameGuard;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("could not resolve broker address `{host}:{port}`")]
    Resolve { host: String, port: u16 },

    #[error("broker refused connection with return code {code}")]
    Refused { code: u8 },

    #[error("broker protocol error: {reason}")]
    Protocol { reason: String },

    #[error("timed out waiting for {waiting_for}")]
    Timeout { waiting_for: &'static str },

    #[error("broker closed the connection")]
    Closed,

    #[error("not connected to broker")]
    NotConnected,
}

impl BrokerError {
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }
}

/// Sends one captured frame. Exactly one attempt per call; retry policy
/// belongs to the caller.
pub trait Publisher {
    /// Returns `true` only on confirmed delivery. The frame is released when
    /// the guard is dropped, whether or not the send succeeded.
    fn publish(&mut self, topic: &str, frame: FrameGuard<'_>) -> bool;
}

/// Publisher for nodes running without a broker.
#[derive(Debug, Default, Clone, Copy)]
pub struct Offline;

impl Publisher for Offline {
    fn publish(&mut self, topic: &str, _frame: FrameGuard<'_>) -> bool {
        warn!(topic, "no broker configured; dropping capture");
        false
    }
}

/// Builds `{base}/{side}/{request_id}`.
///
/// The request id is opaque and copied as-is except for the MQTT wildcard
/// characters and NUL, which are never valid in a topic name and become `_`.
pub fn capture_topic(base: &str, side: &str, request_id: &str) -> String {
    let mut topic = String::with_capacity(base.len() + side.len() + request_id.len() + 2);
    topic.push_str(base);
    topic.push('/');
    topic.push_str(side);
    topic.push('/');
    topic.extend(request_id.chars().map(|c| match c {
        '+' | '#' | '\0' => '_',
        c => c,
    }));
    topic
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("req-1", "capture/complete/top/req-1")]
    #[case("", "capture/complete/top/")]
    #[case("a b/c", "capture/complete/top/a b/c")]
    #[case("x+#y", "capture/complete/top/x__y")]
    #[case("nul\0id", "capture/complete/top/nul_id")]
    fn capture_topic_keeps_request_id_opaque(#[case] request_id: &str, #[case] expected: &str) {
        assert_eq!(capture_topic("capture/complete", "top", request_id), expected);
    }
}
