//! Control loop of a camera-equipped network sensor node.
//!
//! The node holds at most one pending [`Action`]. Each [`Scheduler`] tick
//! performs the one step that action authorizes: capture a frame, then either
//! publish it to the broker under a request id or upload it to the
//! classification backend. Publish requests are retried up to a bound;
//! classification is single shot.

pub mod agent;
pub mod broker;
pub mod camera;
pub mod classify;
pub mod config;
pub mod frame;
pub mod scheduler;
pub mod types;

pub use agent::{CaptureAgent, PublishPolicy};
pub use broker::{MqttSession, Offline, Publisher};
pub use camera::CommandCamera;
pub use classify::{HttpUploader, Uploader};
pub use config::{Mode, NodeConfig};
pub use frame::{Frame, FrameError, FrameGuard, FrameSource};
pub use scheduler::Scheduler;
pub use types::{Action, ActionSlot, Outcome, TickReport};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
