//! Exclusive-access transactions on a card.

use std::ops::{Deref, DerefMut};

use crate::core::card::Card;
use crate::core::error::{check, Result, Target};
use crate::core::types::Disposition;

/// Exclusive access to a card for a sequence of commands.
///
/// Ended by [`Transaction::end`] or, if dropped first, with
/// [`Disposition::Leave`]. Every successful begin is paired with exactly
/// one end.
#[derive(Debug)]
pub struct Transaction<'card, 'ctx> {
    card: &'card mut Card<'ctx>,
    active: bool,
}

impl<'ctx> Card<'ctx> {
    /// Begin a transaction. Blocks while another session holds one.
    pub fn begin_transaction(&mut self) -> Result<Transaction<'_, 'ctx>> {
        check(self.api().begin_transaction(self.raw()), Target::Card)?;
        log::debug!("Transaction started on {}", self.reader());
        Ok(Transaction {
            card: self,
            active: true,
        })
    }

    /// Run `f` inside a transaction ended with `disposition`.
    ///
    /// An error from `f` takes precedence over an error ending the
    /// transaction.
    pub fn with_transaction<T, F>(&mut self, disposition: Disposition, f: F) -> Result<T>
    where
        F: FnOnce(&mut Card<'ctx>) -> Result<T>,
    {
        let mut transaction = self.begin_transaction()?;
        let result = f(&mut transaction);
        let ended = transaction.end(disposition);

        match (result, ended) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), ended) => {
                if let Err(end_err) = ended {
                    log::warn!("Ending transaction after failure also failed: {end_err}");
                }
                Err(e)
            }
        }
    }
}

impl Transaction<'_, '_> {
    pub fn end(mut self, disposition: Disposition) -> Result<()> {
        self.active = false;
        log::debug!("Transaction ended on {} ({disposition:?})", self.card.reader());
        check(
            self.card
                .api()
                .end_transaction(self.card.raw(), disposition.to_native()),
            Target::Card,
        )
    }
}

impl<'ctx> Deref for Transaction<'_, 'ctx> {
    type Target = Card<'ctx>;

    fn deref(&self) -> &Card<'ctx> {
        &*self.card
    }
}

impl<'ctx> DerefMut for Transaction<'_, 'ctx> {
    fn deref_mut(&mut self) -> &mut Card<'ctx> {
        &mut *self.card
    }
}

impl Drop for Transaction<'_, '_> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let code = self
            .card
            .api()
            .end_transaction(self.card.raw(), Disposition::Leave.to_native());
        if !code.is_success() {
            log::warn!("Failed to end transaction: {}", code.message());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::Context;
    use crate::core::error::{Error, ErrorKind};
    use crate::core::fake::{FakeCard, FakeResourceManager};
    use crate::core::types::{Protocols, Scope, ShareMode};
    use std::sync::Arc;

    fn setup() -> (Arc<FakeResourceManager>, Context) {
        let api = Arc::new(
            FakeResourceManager::new()
                .with_reader("Reader A")
                .with_card("Reader A", FakeCard::new(&[0x3B, 0x00])),
        );
        let ctx = Context::establish(api.clone(), Scope::User).unwrap();
        (api, ctx)
    }

    #[test]
    fn test_explicit_end() {
        let (api, ctx) = setup();
        let mut card = ctx
            .connect("Reader A", ShareMode::Shared, Protocols::ANY)
            .unwrap();
        let tx = card.begin_transaction().unwrap();
        assert!(format!("{tx:?}").contains("Reader A"));
        tx.transmit(&[0x00, 0xA4, 0x04, 0x00]).unwrap();
        tx.end(Disposition::Leave).unwrap();
        assert_eq!(api.call_count("SCardBeginTransaction"), 1);
        assert_eq!(api.call_count("SCardEndTransaction"), 1);
    }

    #[test]
    fn test_drop_ends_once() {
        let (api, ctx) = setup();
        let mut card = ctx
            .connect("Reader A", ShareMode::Shared, Protocols::ANY)
            .unwrap();
        {
            let _tx = card.begin_transaction().unwrap();
        }
        assert_eq!(api.call_count("SCardEndTransaction"), 1);

        // The reader is free again.
        card.begin_transaction()
            .unwrap()
            .end(Disposition::Leave)
            .unwrap();
        assert_eq!(api.call_count("SCardEndTransaction"), 2);
    }

    #[test]
    fn test_second_session_is_blocked() {
        let (_api, ctx) = setup();
        let mut first = ctx
            .connect("Reader A", ShareMode::Shared, Protocols::ANY)
            .unwrap();
        let mut second = ctx
            .connect("Reader A", ShareMode::Shared, Protocols::ANY)
            .unwrap();
        let _tx = first.begin_transaction().unwrap();
        let err = second.begin_transaction().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SharingViolation);
    }

    #[test]
    fn test_with_transaction_ends_on_error() {
        let (api, ctx) = setup();
        let mut card = ctx
            .connect("Reader A", ShareMode::Shared, Protocols::ANY)
            .unwrap();
        let result: Result<()> = card.with_transaction(Disposition::Reset, |_| {
            Err(Error::InvalidArgument("abort"))
        });
        assert!(matches!(result, Err(Error::InvalidArgument("abort"))));
        assert_eq!(api.call_count("SCardBeginTransaction"), 1);
        assert_eq!(api.call_count("SCardEndTransaction"), 1);
    }

    #[test]
    fn test_with_transaction_returns_value() {
        let (api, ctx) = setup();
        let mut card = ctx
            .connect("Reader A", ShareMode::Shared, Protocols::ANY)
            .unwrap();
        let response = card
            .with_transaction(Disposition::Leave, |card| {
                card.transmit(&[0x00, 0xA4, 0x04, 0x00])
            })
            .unwrap();
        assert_eq!(response, vec![0x6F, 0x00, 0x90, 0x00]);
        assert_eq!(api.call_count("SCardEndTransaction"), 1);
    }

    #[test]
    fn test_begin_on_removed_card() {
        let (api, ctx) = setup();
        let mut card = ctx
            .connect("Reader A", ShareMode::Shared, Protocols::ANY)
            .unwrap();
        api.remove_card("Reader A");
        assert_eq!(
            card.begin_transaction().unwrap_err().kind(),
            ErrorKind::CardAbsent
        );
        assert_eq!(api.call_count("SCardEndTransaction"), 0);
    }
}
