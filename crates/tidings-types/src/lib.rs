//! Wire and HTTP types shared by the tidings crates.
//!
//! Nothing in here touches storage or sockets; `tidings-db` maps its rows
//! onto these types and `tidings-gateway` / `tidings-api` put them on the wire.

pub mod api;
pub mod frame;
pub mod page;

pub use frame::{Frame, MAX_BODY_BYTES, Operation, ServerFrame, UnknownOperation, ValidationError};
pub use page::{Filter, Metadata};
