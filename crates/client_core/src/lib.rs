pub mod config;
pub mod error;
pub mod queue;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;

pub use crate::config::{ClientSettings, DeploymentMode};
pub use error::SyncError;
pub use session::{Session, SessionHandle, SessionOptions};
pub use transport::{ControllerTransport, Endpoints, WsTransport};
pub use types::{ConnectionState, Intent, MergedView};
