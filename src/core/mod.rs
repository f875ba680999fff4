//! Protocol core: contexts, reader monitoring, card sessions and transport.

mod attrib;
pub mod card;
pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod fake;
pub mod monitor;
pub mod native;
#[cfg(feature = "native")]
pub mod pcsc_lite;
pub mod transaction;
mod transport;
pub mod types;
pub mod utils;
