//! YUI server: Axum HTTP for the KOOK webhook plus a read-only session view.
//! Conversation logic lives in yui-core; this crate only wires it to the network.

mod web_server;

pub use web_server::{build_router, AppState};
