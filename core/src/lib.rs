//! YUI core: settings, logging, completion backend, KOOK IM and the per-channel session logic.
//! No HTTP server here; the server crate owns the webhook endpoint and process wiring.

pub mod completion;
pub mod config;
pub mod im;
pub mod logging;
