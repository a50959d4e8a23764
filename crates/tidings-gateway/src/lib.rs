//! Real-time side of tidings: one websocket session per user, relaying
//! message frames between online peers and replaying what offline peers
//! missed from the message store.

pub mod broker;
pub mod error;
pub mod presence;
pub mod processor;
pub mod registry;
mod session;
pub mod supervisor;
pub mod throttle;

pub use broker::{Broker, SessionConfig, Stores};
pub use error::{GatewayError, Result};
pub use registry::{Admission, CloseReason, Offer, Registry, SessionHandle};
pub use supervisor::Supervisor;
