//! APDU exchange and reader control.

use crate::core::card::Card;
use crate::core::error::{check, Error, Result, Target};
use crate::core::native::IoRequest;
use crate::core::types::{Protocol, MAX_BUFFER_SIZE_EXTENDED, MAX_CONTROL_BUFFER};
use crate::core::utils::format_hex_spaced;

impl Card<'_> {
    /// Send a command APDU and return the full response, status word included.
    ///
    /// Framing follows the negotiated protocol; only T=0 and T=1 can carry
    /// APDUs.
    pub fn transmit(&self, command: &[u8]) -> Result<Vec<u8>> {
        if command.is_empty() {
            return Err(Error::InvalidArgument("empty command APDU"));
        }
        let pci = match self.active_protocol() {
            Protocol::T0 => IoRequest::T0,
            Protocol::T1 => IoRequest::T1,
            other => return Err(Error::UnsupportedProtocol(other)),
        };

        log::trace!("Sending APDU: {}", format_hex_spaced(command));
        let mut response = vec![0u8; MAX_BUFFER_SIZE_EXTENDED];
        let mut len = response.len() as u32;
        check(
            self.api()
                .transmit(self.raw(), pci, command, &mut response, &mut len),
            Target::Card,
        )?;

        response.truncate(len as usize);
        log::trace!("Response: {}", format_hex_spaced(&response));
        Ok(response)
    }

    /// Send a vendor control code to the reader. `data` may be empty.
    pub fn control(&self, code: u32, data: &[u8]) -> Result<Vec<u8>> {
        log::debug!("Control {code:#010x} with {} byte(s)", data.len());
        let mut response = vec![0u8; MAX_CONTROL_BUFFER];
        let mut returned: u32 = 0;
        check(
            self.api()
                .control(self.raw(), code, data, &mut response, &mut returned),
            Target::Card,
        )?;

        response.truncate(returned as usize);
        Ok(response)
    }
}
