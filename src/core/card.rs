//! Card connections.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;

use crate::core::context::Context;
use crate::core::error::{check, Error, Result, Target};
use crate::core::native::{RawHandle, ResourceManager};
use crate::core::types::{
    CardState, Disposition, Protocol, Protocols, ShareMode, ATR_BUFFER_SIZE, MAX_READERNAME,
};
use crate::core::utils::decode_multi_string;

/// Snapshot returned by [`Card::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CardStatus {
    pub reader: String,
    pub state: CardState,
    pub protocol: Protocol,
    pub atr: Vec<u8>,
}

/// A connection to the card in one reader.
///
/// Borrows the [`Context`] it was opened from, since releasing a context
/// invalidates its card handles. The connection is closed by
/// [`Card::disconnect`] or, if that was never called, on drop with
/// [`Disposition::Leave`].
///
/// `Card` is `Send` and `Sync`, but the resource manager does not order
/// commands issued on one handle from several threads at once. Callers
/// sharing a `&Card` across threads must serialise `transmit` and
/// `control` themselves, or use a transaction.
///
/// A context cannot be released while one of its cards is open:
///
/// ```compile_fail
/// use scard_client::{Context, FakeResourceManager, Protocols, Scope, ShareMode};
/// use std::sync::Arc;
///
/// let api = Arc::new(FakeResourceManager::demo());
/// let ctx = Context::establish(api, Scope::User).unwrap();
/// let card = ctx.connect("Reader A", ShareMode::Shared, Protocols::ANY).unwrap();
/// ctx.release().unwrap();
/// card.transmit(&[0x00, 0xA4, 0x04, 0x00]).unwrap();
/// ```
pub struct Card<'ctx> {
    api: Arc<dyn ResourceManager>,
    handle: RawHandle,
    protocol: Protocol,
    reader: String,
    live: bool,
    _context: PhantomData<&'ctx ()>,
}

impl fmt::Debug for Card<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Card")
            .field("reader", &self.reader)
            .field("handle", &self.handle)
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl Context {
    /// Open a connection to the card in `reader`.
    pub fn connect(
        &self,
        reader: &str,
        share_mode: ShareMode,
        protocols: Protocols,
    ) -> Result<Card<'_>> {
        if reader.is_empty() || reader.contains('\0') {
            return Err(Error::InvalidName(reader.to_string()));
        }

        let mut handle: RawHandle = 0;
        let mut active: u32 = 0;
        check(
            self.api().connect(
                self.raw(),
                reader,
                share_mode.to_native(),
                protocols.bits(),
                &mut handle,
                &mut active,
            ),
            Target::Context,
        )?;

        let protocol = Protocol::from_native(active);
        log::info!("Connected to {reader} ({share_mode:?}, protocol {protocol})");
        Ok(Card {
            api: Arc::clone(self.api()),
            handle,
            protocol,
            reader: reader.to_string(),
            live: true,
            _context: PhantomData,
        })
    }
}

impl Card<'_> {
    pub(crate) fn api(&self) -> &dyn ResourceManager {
        self.api.as_ref()
    }

    pub(crate) fn raw(&self) -> RawHandle {
        self.handle
    }

    /// Protocol negotiated at connect or the last reconnect.
    pub fn active_protocol(&self) -> Protocol {
        self.protocol
    }

    /// Reader this connection was opened on.
    pub fn reader(&self) -> &str {
        &self.reader
    }

    /// Close the connection, applying `disposition` to the card.
    pub fn disconnect(mut self, disposition: Disposition) -> Result<()> {
        self.live = false;
        log::debug!("Disconnecting from {} ({disposition:?})", self.reader);
        check(
            self.api.disconnect(self.handle, disposition.to_native()),
            Target::Card,
        )
    }

    /// Renegotiate the connection, e.g. after another session reset the card.
    pub fn reconnect(
        &mut self,
        share_mode: ShareMode,
        protocols: Protocols,
        initialization: Disposition,
    ) -> Result<()> {
        let mut active: u32 = 0;
        check(
            self.api.reconnect(
                self.handle,
                share_mode.to_native(),
                protocols.bits(),
                initialization.to_native(),
                &mut active,
            ),
            Target::Card,
        )?;
        self.protocol = Protocol::from_native(active);
        log::debug!("Reconnected to {} (protocol {})", self.reader, self.protocol);
        Ok(())
    }

    /// Current reader name, card state, protocol and ATR.
    pub fn status(&self) -> Result<CardStatus> {
        let mut reader = [0u8; MAX_READERNAME + 1];
        let mut reader_len = reader.len() as u32;
        let mut state: u32 = 0;
        let mut protocol: u32 = 0;
        let mut atr = [0u8; ATR_BUFFER_SIZE];
        let mut atr_len = atr.len() as u32;

        check(
            self.api.status(
                self.handle,
                &mut reader,
                &mut reader_len,
                &mut state,
                &mut protocol,
                &mut atr,
                &mut atr_len,
            ),
            Target::Card,
        )?;

        let reader_len = (reader_len as usize).min(reader.len());
        let atr_len = (atr_len as usize).min(atr.len());
        Ok(CardStatus {
            reader: decode_multi_string(&reader[..reader_len])
                .into_iter()
                .next()
                .unwrap_or_default(),
            state: CardState::from_native(state),
            protocol: Protocol::from_native(protocol),
            atr: atr[..atr_len].to_vec(),
        })
    }
}

impl Drop for Card<'_> {
    fn drop(&mut self) {
        if !self.live {
            return;
        }
        let code = self
            .api
            .disconnect(self.handle, Disposition::Leave.to_native());
        if !code.is_success() {
            log::warn!("Failed to disconnect from {}: {}", self.reader, code.message());
        }
    }
}
