pub mod cancel;
pub mod core;
pub mod handler;
pub mod outcome;

pub use self::core::{MeshCore, MeshHealth, ServiceHealth, ServiceMesh};
pub use cancel::{CancelHandle, Cancellation};
pub use handler::{Handler, HandlerError, RequestContext};
pub use outcome::{FailureReason, MeshRequest, Outcome, RejectReason};
