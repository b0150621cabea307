pub mod api;
pub mod connection;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;

pub use registry::{Membership, SessionRegistry};
pub use router::{Clock, MessageRouter, RouterError};
pub use server::{start, AppState, ServerConfig, ServerHandle};
