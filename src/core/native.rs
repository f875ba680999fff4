//! The resource-manager boundary.
//!
//! [`ResourceManager`] has one method per native entry point. Methods
//! return the raw [`StatusCode`] and write their outputs through `&mut`
//! parameters, exactly like the platform API, so that all translation
//! into typed results happens on the client side.

use crate::core::error::{check, Error, Result, StatusCode, Target};
use crate::core::types::ATR_BUFFER_SIZE;

/// Raw context or card handle as issued by the native layer.
pub type RawHandle = u64;

/// Framing descriptor passed to `Transmit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoRequest {
    T0,
    T1,
}

/// One reader-state entry in the layout `GetStatusChange` works on.
#[derive(Debug, Clone)]
pub struct ReaderStateRecord<'a> {
    pub reader: &'a str,
    pub current_state: u32,
    pub event_state: u32,
    pub atr_len: u32,
    pub atr: [u8; ATR_BUFFER_SIZE],
}

impl<'a> ReaderStateRecord<'a> {
    /// Builds a record, truncating the ATR to the fixed wire buffer.
    pub fn new(reader: &'a str, current_state: u32, atr: &[u8]) -> Self {
        let len = atr.len().min(ATR_BUFFER_SIZE);
        let mut buf = [0u8; ATR_BUFFER_SIZE];
        buf[..len].copy_from_slice(&atr[..len]);
        Self {
            reader,
            current_state,
            event_state: 0,
            atr_len: len as u32,
            atr: buf,
        }
    }

    /// ATR bytes reported by the native layer.
    pub fn atr(&self) -> &[u8] {
        let len = (self.atr_len as usize).min(ATR_BUFFER_SIZE);
        &self.atr[..len]
    }
}

/// Entry points of the platform smart-card resource manager.
///
/// Implementations must be safe to call from several threads; in
/// particular `cancel` may run while another thread is blocked in
/// `get_status_change` on the same context.
pub trait ResourceManager: Send + Sync {
    fn establish_context(&self, scope: u32, context: &mut RawHandle) -> StatusCode;

    fn release_context(&self, context: RawHandle) -> StatusCode;

    fn is_valid_context(&self, context: RawHandle) -> StatusCode;

    fn cancel(&self, context: RawHandle) -> StatusCode;

    /// With `buffer == None`, only writes the required length to `len`.
    fn list_readers(
        &self,
        context: RawHandle,
        buffer: Option<&mut [u8]>,
        len: &mut u32,
    ) -> StatusCode;

    /// Same convention as [`ResourceManager::list_readers`].
    fn list_reader_groups(
        &self,
        context: RawHandle,
        buffer: Option<&mut [u8]>,
        len: &mut u32,
    ) -> StatusCode;

    fn get_status_change(
        &self,
        context: RawHandle,
        timeout_ms: u32,
        states: &mut [ReaderStateRecord<'_>],
    ) -> StatusCode;

    fn connect(
        &self,
        context: RawHandle,
        reader: &str,
        share_mode: u32,
        preferred_protocols: u32,
        card: &mut RawHandle,
        active_protocol: &mut u32,
    ) -> StatusCode;

    fn reconnect(
        &self,
        card: RawHandle,
        share_mode: u32,
        preferred_protocols: u32,
        initialization: u32,
        active_protocol: &mut u32,
    ) -> StatusCode;

    fn disconnect(&self, card: RawHandle, disposition: u32) -> StatusCode;

    fn begin_transaction(&self, card: RawHandle) -> StatusCode;

    fn end_transaction(&self, card: RawHandle, disposition: u32) -> StatusCode;

    /// `reader_len` and `atr_len` hold the buffer capacities on input and
    /// the lengths written on output.
    #[allow(clippy::too_many_arguments)]
    fn status(
        &self,
        card: RawHandle,
        reader: &mut [u8],
        reader_len: &mut u32,
        state: &mut u32,
        protocol: &mut u32,
        atr: &mut [u8],
        atr_len: &mut u32,
    ) -> StatusCode;

    /// `recv_len` holds the capacity on input and the response length on output.
    fn transmit(
        &self,
        card: RawHandle,
        pci: IoRequest,
        send: &[u8],
        recv: &mut [u8],
        recv_len: &mut u32,
    ) -> StatusCode;

    /// `send` may be empty.
    fn control(
        &self,
        card: RawHandle,
        control_code: u32,
        send: &[u8],
        recv: &mut [u8],
        returned: &mut u32,
    ) -> StatusCode;

    /// Same two-phase convention as [`ResourceManager::list_readers`].
    fn get_attrib(
        &self,
        card: RawHandle,
        attr_id: u32,
        buffer: Option<&mut [u8]>,
        len: &mut u32,
    ) -> StatusCode;

    fn set_attrib(&self, card: RawHandle, attr_id: u32, data: &[u8]) -> StatusCode;
}

/// Query length, allocate, fill, verify.
///
/// `call` is invoked once with no buffer to learn the required length and
/// once more with a buffer of exactly that length. The result is trimmed
/// to what the fill phase reports.
pub(crate) fn query_two_phase<F>(target: Target, mut call: F) -> Result<Vec<u8>>
where
    F: FnMut(Option<&mut [u8]>, &mut u32) -> StatusCode,
{
    let mut needed: u32 = 0;
    check(call(None, &mut needed), target)?;

    let mut buffer = vec![0u8; needed as usize];
    if buffer.is_empty() {
        return Ok(buffer);
    }

    let mut written = needed;
    check(call(Some(buffer.as_mut_slice()), &mut written), target)?;
    if written > needed {
        return Err(Error::BufferChanged {
            expected: needed as usize,
            actual: written as usize,
        });
    }

    buffer.truncate(written as usize);
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;

    #[test]
    fn test_record_truncates_long_atr() {
        let atr = vec![0x3B; 40];
        let record = ReaderStateRecord::new("Reader", 0, &atr);
        assert_eq!(record.atr_len as usize, ATR_BUFFER_SIZE);
        assert_eq!(record.atr().len(), ATR_BUFFER_SIZE);
    }

    #[test]
    fn test_record_keeps_short_atr() {
        let record = ReaderStateRecord::new("Reader", 0, &[0x3B, 0x02, 0x14, 0x50]);
        assert_eq!(record.atr(), &[0x3B, 0x02, 0x14, 0x50]);
    }

    #[test]
    fn test_two_phase_fills_exact_length() {
        let data = b"abc\0\0".to_vec();
        let mut size_queries = 0;
        let result = query_two_phase(Target::Context, |buf, len| match buf {
            None => {
                size_queries += 1;
                *len = data.len() as u32;
                StatusCode::SUCCESS
            }
            Some(buf) => {
                assert_eq!(buf.len(), data.len());
                buf.copy_from_slice(&data);
                *len = data.len() as u32;
                StatusCode::SUCCESS
            }
        })
        .unwrap();
        assert_eq!(result, data);
        assert_eq!(size_queries, 1);
    }

    #[test]
    fn test_two_phase_trims_to_reported_length() {
        let result = query_two_phase(Target::Card, |buf, len| {
            if let Some(buf) = buf {
                buf[0] = 0;
                *len = 1;
            } else {
                *len = 8;
            }
            StatusCode::SUCCESS
        })
        .unwrap();
        assert_eq!(result, vec![0]);
    }

    #[test]
    fn test_two_phase_zero_length_skips_fill() {
        let mut calls = 0;
        let result = query_two_phase(Target::Context, |_, len| {
            calls += 1;
            *len = 0;
            StatusCode::SUCCESS
        })
        .unwrap();
        assert!(result.is_empty());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_two_phase_propagates_status() {
        let err = query_two_phase(Target::Context, |_, _| {
            StatusCode::E_NO_READERS_AVAILABLE
        })
        .unwrap_err();
        assert_eq!(err.code(), Some(StatusCode::E_NO_READERS_AVAILABLE));
        assert_eq!(err.kind(), ErrorKind::ReaderUnavailable);
    }

    #[test]
    fn test_two_phase_detects_growth() {
        let err = query_two_phase(Target::Card, |buf, len| {
            *len = if buf.is_some() { 10 } else { 4 };
            StatusCode::SUCCESS
        })
        .unwrap_err();
        assert!(matches!(
            err,
            Error::BufferChanged {
                expected: 4,
                actual: 10
            }
        ));
    }
}
