//! Client library for the Fritz!Box web interface, call monitor and phonebooks.

pub mod backoff;
pub mod call_list;
pub mod client;
pub mod config;
pub mod error;
pub mod fonbook;
pub mod listener;
pub mod service;
pub mod session;
pub mod tools;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use call_list::{CallEntry, CallList, CallType};
pub use client::{FritzApi, FritzClient, SharedApi};
pub use config::{AppConfig, ConfigLoadResult};
pub use error::{FritzError, Result};
pub use fonbook::{Fonbook, FonbookEntry, FonbookManager, NumberType, ResolveResult, ReverseLookup};
pub use listener::{CallInfo, EventHandler, Listener};
pub use service::{FritzService, InitReport};
pub use session::Session;
