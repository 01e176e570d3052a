//! Real-time collaboration backend for shared bill-splitting rooms
//!
//! Clients connect to a room over a websocket, edit a shared receipt
//! document and see each other's changes with sub-second latency. The
//! document is a last-writer-wins state materialized from a periodically
//! refreshed snapshot plus an ordered op log in Redis, so the process is
//! stateless across restarts and rooms expire on idle. A background task
//! derives participant presence from live connections and writes it back
//! into the log.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod apply;
pub mod config;
pub mod currency;
pub mod error;
pub mod fx;
pub mod hub;
pub mod model;
pub mod presence;
pub mod receipt;
pub mod server;
pub mod store;
pub mod token;

pub use apply::apply;
pub use config::Config;
pub use error::{AppError, AppResult};
pub use hub::Hub;
pub use model::{ClientFrame, Item, Op, OpKind, Participant, RoomDoc, SeqOp, ServerFrame};
pub use server::AppState;
pub use store::{MemoryStore, RedisStore, RoomStore};
