//! Resource manager backed by the platform PC/SC library.
//!
//! All `unsafe` in the crate lives here. Each method forwards to the
//! matching `SCard*` entry point and converts between the platform integer
//! widths (`DWORD`, `LONG`, handle types) and the fixed widths used by
//! [`ResourceManager`].

use std::ffi::CString;
use std::os::raw::c_char;
use std::ptr;

mod ffi {
    pub use pcsc_sys::*;

    // pcsc-sys does not bind SCardListReaderGroups; declare it here.
    extern "system" {
        #[cfg_attr(target_os = "windows", link_name = "SCardListReaderGroupsA")]
        pub fn SCardListReaderGroups(
            hContext: SCARDCONTEXT,
            mszGroups: *mut std::os::raw::c_char,
            pcchGroups: *mut DWORD,
        ) -> LONG;
    }
}

use crate::core::error::StatusCode;
use crate::core::native::{IoRequest, RawHandle, ReaderStateRecord, ResourceManager};

/// The system winscard / pcsclite service.
#[derive(Debug, Clone, Copy, Default)]
pub struct PcscLite;

fn status(code: ffi::LONG) -> StatusCode {
    StatusCode(code as u32)
}

fn context(handle: RawHandle) -> ffi::SCARDCONTEXT {
    handle as ffi::SCARDCONTEXT
}

fn card(handle: RawHandle) -> ffi::SCARDHANDLE {
    handle as ffi::SCARDHANDLE
}

fn out_buffer(buffer: Option<&mut [u8]>) -> (*mut u8, ffi::DWORD) {
    match buffer {
        Some(buf) => (buf.as_mut_ptr(), buf.len() as ffi::DWORD),
        None => (ptr::null_mut(), 0),
    }
}

impl ResourceManager for PcscLite {
    fn establish_context(&self, scope: u32, context: &mut RawHandle) -> StatusCode {
        let mut handle: ffi::SCARDCONTEXT = 0;
        let code = unsafe {
            ffi::SCardEstablishContext(scope as ffi::DWORD, ptr::null(), ptr::null(), &mut handle)
        };
        *context = handle as RawHandle;
        status(code)
    }

    fn release_context(&self, handle: RawHandle) -> StatusCode {
        status(unsafe { ffi::SCardReleaseContext(context(handle)) })
    }

    fn is_valid_context(&self, handle: RawHandle) -> StatusCode {
        status(unsafe { ffi::SCardIsValidContext(context(handle)) })
    }

    fn cancel(&self, handle: RawHandle) -> StatusCode {
        status(unsafe { ffi::SCardCancel(context(handle)) })
    }

    fn list_readers(
        &self,
        handle: RawHandle,
        buffer: Option<&mut [u8]>,
        len: &mut u32,
    ) -> StatusCode {
        let (buf, mut cch) = out_buffer(buffer);
        let code = unsafe {
            ffi::SCardListReaders(context(handle), ptr::null(), buf.cast::<c_char>(), &mut cch)
        };
        *len = cch as u32;
        status(code)
    }

    fn list_reader_groups(
        &self,
        handle: RawHandle,
        buffer: Option<&mut [u8]>,
        len: &mut u32,
    ) -> StatusCode {
        let (buf, mut cch) = out_buffer(buffer);
        let code =
            unsafe { ffi::SCardListReaderGroups(context(handle), buf.cast::<c_char>(), &mut cch) };
        *len = cch as u32;
        status(code)
    }

    fn get_status_change(
        &self,
        handle: RawHandle,
        timeout_ms: u32,
        states: &mut [ReaderStateRecord<'_>],
    ) -> StatusCode {
        let Ok(names) = states
            .iter()
            .map(|s| CString::new(s.reader))
            .collect::<Result<Vec<_>, _>>()
        else {
            return StatusCode::E_INVALID_VALUE;
        };

        let mut raw: Vec<ffi::SCARD_READERSTATE> = states
            .iter()
            .zip(&names)
            .map(|(state, name)| {
                // SAFETY: plain C struct; all-zero is a valid "no ATR" entry.
                let mut entry: ffi::SCARD_READERSTATE = unsafe { std::mem::zeroed() };
                entry.szReader = name.as_ptr();
                entry.dwCurrentState = state.current_state as ffi::DWORD;
                let atr = state.atr();
                let n = atr.len().min(entry.rgbAtr.len());
                entry.rgbAtr[..n].copy_from_slice(&atr[..n]);
                entry.cbAtr = n as ffi::DWORD;
                entry
            })
            .collect();

        let code = unsafe {
            ffi::SCardGetStatusChange(
                context(handle),
                timeout_ms as ffi::DWORD,
                raw.as_mut_ptr(),
                raw.len() as ffi::DWORD,
            )
        };

        for (state, entry) in states.iter_mut().zip(&raw) {
            state.event_state = entry.dwEventState as u32;
            let n = (entry.cbAtr as usize)
                .min(entry.rgbAtr.len())
                .min(state.atr.len());
            state.atr[..n].copy_from_slice(&entry.rgbAtr[..n]);
            state.atr_len = n as u32;
        }
        status(code)
    }

    fn connect(
        &self,
        handle: RawHandle,
        reader: &str,
        share_mode: u32,
        preferred_protocols: u32,
        card_out: &mut RawHandle,
        active_protocol: &mut u32,
    ) -> StatusCode {
        let Ok(reader) = CString::new(reader) else {
            return StatusCode::E_INVALID_VALUE;
        };
        let mut raw_card: ffi::SCARDHANDLE = 0;
        let mut protocol: ffi::DWORD = 0;
        let code = unsafe {
            ffi::SCardConnect(
                context(handle),
                reader.as_ptr(),
                share_mode as ffi::DWORD,
                preferred_protocols as ffi::DWORD,
                &mut raw_card,
                &mut protocol,
            )
        };
        *card_out = raw_card as RawHandle;
        *active_protocol = protocol as u32;
        status(code)
    }

    fn reconnect(
        &self,
        handle: RawHandle,
        share_mode: u32,
        preferred_protocols: u32,
        initialization: u32,
        active_protocol: &mut u32,
    ) -> StatusCode {
        let mut protocol: ffi::DWORD = 0;
        let code = unsafe {
            ffi::SCardReconnect(
                card(handle),
                share_mode as ffi::DWORD,
                preferred_protocols as ffi::DWORD,
                initialization as ffi::DWORD,
                &mut protocol,
            )
        };
        *active_protocol = protocol as u32;
        status(code)
    }

    fn disconnect(&self, handle: RawHandle, disposition: u32) -> StatusCode {
        status(unsafe { ffi::SCardDisconnect(card(handle), disposition as ffi::DWORD) })
    }

    fn begin_transaction(&self, handle: RawHandle) -> StatusCode {
        status(unsafe { ffi::SCardBeginTransaction(card(handle)) })
    }

    fn end_transaction(&self, handle: RawHandle, disposition: u32) -> StatusCode {
        status(unsafe { ffi::SCardEndTransaction(card(handle), disposition as ffi::DWORD) })
    }

    fn status(
        &self,
        handle: RawHandle,
        reader: &mut [u8],
        reader_len: &mut u32,
        state: &mut u32,
        protocol: &mut u32,
        atr: &mut [u8],
        atr_len: &mut u32,
    ) -> StatusCode {
        let mut cch = reader.len() as ffi::DWORD;
        let mut raw_state: ffi::DWORD = 0;
        let mut raw_protocol: ffi::DWORD = 0;
        let mut cb_atr = atr.len() as ffi::DWORD;
        let code = unsafe {
            ffi::SCardStatus(
                card(handle),
                reader.as_mut_ptr().cast::<c_char>(),
                &mut cch,
                &mut raw_state,
                &mut raw_protocol,
                atr.as_mut_ptr(),
                &mut cb_atr,
            )
        };
        *reader_len = cch as u32;
        *state = raw_state as u32;
        *protocol = raw_protocol as u32;
        *atr_len = cb_atr as u32;
        status(code)
    }

    fn transmit(
        &self,
        handle: RawHandle,
        pci: IoRequest,
        send: &[u8],
        recv: &mut [u8],
        recv_len: &mut u32,
    ) -> StatusCode {
        // SAFETY: the protocol control blocks are immutable statics exported
        // by the library.
        let send_pci: *const ffi::SCARD_IO_REQUEST = unsafe {
            match pci {
                IoRequest::T0 => &ffi::g_rgSCardT0Pci,
                IoRequest::T1 => &ffi::g_rgSCardT1Pci,
            }
        };
        let mut cb_recv = (*recv_len as usize).min(recv.len()) as ffi::DWORD;
        let code = unsafe {
            ffi::SCardTransmit(
                card(handle),
                send_pci,
                send.as_ptr(),
                send.len() as ffi::DWORD,
                ptr::null_mut(),
                recv.as_mut_ptr(),
                &mut cb_recv,
            )
        };
        *recv_len = cb_recv as u32;
        status(code)
    }

    fn control(
        &self,
        handle: RawHandle,
        control_code: u32,
        send: &[u8],
        recv: &mut [u8],
        returned: &mut u32,
    ) -> StatusCode {
        let send_ptr = if send.is_empty() {
            ptr::null()
        } else {
            send.as_ptr().cast()
        };
        let mut bytes_returned: ffi::DWORD = 0;
        let code = unsafe {
            ffi::SCardControl(
                card(handle),
                control_code as ffi::DWORD,
                send_ptr,
                send.len() as ffi::DWORD,
                recv.as_mut_ptr().cast(),
                recv.len() as ffi::DWORD,
                &mut bytes_returned,
            )
        };
        *returned = bytes_returned as u32;
        status(code)
    }

    fn get_attrib(
        &self,
        handle: RawHandle,
        attr_id: u32,
        buffer: Option<&mut [u8]>,
        len: &mut u32,
    ) -> StatusCode {
        let (buf, mut cb) = out_buffer(buffer);
        let code =
            unsafe { ffi::SCardGetAttrib(card(handle), attr_id as ffi::DWORD, buf, &mut cb) };
        *len = cb as u32;
        status(code)
    }

    fn set_attrib(&self, handle: RawHandle, attr_id: u32, data: &[u8]) -> StatusCode {
        status(unsafe {
            ffi::SCardSetAttrib(
                card(handle),
                attr_id as ffi::DWORD,
                data.as_ptr(),
                data.len() as ffi::DWORD,
            )
        })
    }
}
