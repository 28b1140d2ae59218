#![cfg_attr(not(test), forbid(unsafe_code))]

//! Caching and coordination core of the Agora discussion platform: the room
//! cache in front of the store of record, cross-instance chat fan-out, and
//! proposal edit locks, all over one shared key-value store.

pub mod app_state;
pub mod bus;
pub mod cache;
pub mod db;
pub mod routes;
pub mod server;
pub mod services;
pub mod store;
mod tracer;

#[cfg(test)]
mod testing;
