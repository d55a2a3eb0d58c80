//! Multi-client TCP text broadcast server.
//!
//! Every accepted connection gets a reader task that turns socket bytes
//! into [`event::Event`]s. All events funnel into a single
//! [`authority::Authority`] task, which owns the client table and the ban
//! set, applies per-client debounce / timeout / ban rules, and relays
//! accepted messages to every connected client.

pub mod authority;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod notice;
pub mod server;
