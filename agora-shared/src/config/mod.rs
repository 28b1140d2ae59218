//! # Configuration
//!
//! Process configuration shared by every Agora server instance. Values that
//! shape the key space (TTLs, caps, channel name) must match across all
//! processes sharing one store.

pub mod server;
