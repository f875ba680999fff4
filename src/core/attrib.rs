//! Reader and card attributes.

use crate::core::card::Card;
use crate::core::error::{check, Error, Result, Target};
use crate::core::native::query_two_phase;
use crate::core::types::Attrib;

impl Card<'_> {
    /// Read an attribute. Values are returned as raw bytes.
    pub fn get_attrib(&self, attrib: Attrib) -> Result<Vec<u8>> {
        let value = query_two_phase(Target::Card, |buf, len| {
            self.api().get_attrib(self.raw(), attrib.0, buf, len)
        })?;
        log::debug!("Attribute {attrib} is {} byte(s)", value.len());
        Ok(value)
    }

    pub fn set_attrib(&self, attrib: Attrib, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::InvalidArgument("empty attribute value"));
        }
        check(
            self.api().set_attrib(self.raw(), attrib.0, data),
            Target::Card,
        )
    }

    /// The card's ATR, read through [`Attrib::ATR_STRING`].
    pub fn atr(&self) -> Result<Vec<u8>> {
        self.get_attrib(Attrib::ATR_STRING)
    }
}
