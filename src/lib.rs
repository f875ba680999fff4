/// scard-client - Client-side PC/SC resource manager protocol layer
///
/// This library wraps the smart card resource manager (winscard / pcsclite)
/// behind an injectable boundary, and provides the CLI used to drive readers.
pub mod cli;
pub mod core;

// Re-export commonly used types
pub use crate::core::{
    card::{Card, CardStatus},
    commands::{CommandExecutor, CommandResult, ControlResult, TransmitResult},
    config::ClientConfig,
    context::{Canceller, Context},
    error::{Error, ErrorKind, NativeError, Result, StatusCode},
    fake::{FakeCard, FakeResourceManager},
    monitor::{ReaderEvent, ReaderMonitor, ReaderState, Timeout},
    native::ResourceManager,
    transaction::Transaction,
    types::{Attrib, CardState, Disposition, Protocol, Protocols, Scope, ShareMode, StateFlags},
    utils::{format_hex_spaced, parse_hex},
};

#[cfg(feature = "native")]
pub use crate::core::pcsc_lite::PcscLite;
