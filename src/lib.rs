//! Real-time conversation service for a business directory.
//!
//! Customers and businesses exchange messages over a persistent WebSocket
//! connection backed by a durable SQLite store. A synchronization HTTP API
//! serves history, unread counts and bulk read marking for clients that are
//! offline or reconnecting; both surfaces read and write through the same
//! [`store::MessageStore`], so they never diverge.

pub mod api;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod identity;
pub mod logging;
pub mod pagination;
pub mod presence;
pub mod server;
pub mod session;
pub mod store;

pub use config::ServerConfig;
pub use errors::{ChatError, ChatResult};
pub use gateway::Gateway;
pub use server::{build_router, build_state, AppState};
pub use session::SessionManager;
pub use store::MessageStore;
