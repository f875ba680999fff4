//! Resource manager context: lifecycle and reader enumeration.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::core::error::{check, Error, NativeError, Result, StatusCode, Target};
use crate::core::native::{query_two_phase, RawHandle, ResourceManager};
use crate::core::types::Scope;
use crate::core::utils::decode_multi_string;

/// A session with the smart-card resource manager.
///
/// Released by [`Context::release`] or, failing that, on drop. A context
/// can be moved to another thread but not shared; use
/// [`Context::canceller`] to interrupt a blocked wait from elsewhere.
pub struct Context {
    api: Arc<dyn ResourceManager>,
    handle: RawHandle,
    live: bool,
    _not_sync: PhantomData<Cell<()>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("handle", &self.handle)
            .field("live", &self.live)
            .finish()
    }
}

impl Context {
    /// Acquire a context from `api`.
    pub fn establish(api: Arc<dyn ResourceManager>, scope: Scope) -> Result<Self> {
        let mut handle: RawHandle = 0;
        let code = api.establish_context(scope.to_native(), &mut handle);
        if !code.is_success() {
            log::debug!("SCardEstablishContext failed: {code}");
            return Err(Error::EstablishFailed(NativeError::new(
                code,
                Target::Context,
            )));
        }

        log::debug!("Established context {handle:#x} ({scope:?})");
        Ok(Self {
            api,
            handle,
            live: true,
            _not_sync: PhantomData,
        })
    }

    /// Acquire a context from the platform PC/SC library.
    #[cfg(feature = "native")]
    pub fn establish_system(scope: Scope) -> Result<Self> {
        Self::establish(Arc::new(crate::core::pcsc_lite::PcscLite), scope)
    }

    pub(crate) fn api(&self) -> &Arc<dyn ResourceManager> {
        &self.api
    }

    pub(crate) fn raw(&self) -> RawHandle {
        self.handle
    }

    /// Liveness check. A stale handle yields `Ok(false)`.
    pub fn is_valid(&self) -> Result<bool> {
        let code = self.api.is_valid_context(self.handle);
        if code == StatusCode::E_INVALID_HANDLE {
            return Ok(false);
        }
        check(code, Target::Context)?;
        Ok(true)
    }

    /// Wake any thread blocked in `get_status_change` on this context.
    pub fn cancel(&self) -> Result<()> {
        self.canceller().cancel()
    }

    /// A handle that can cancel waits on this context from another thread.
    pub fn canceller(&self) -> Canceller<'_> {
        Canceller {
            api: self.api.as_ref(),
            handle: self.handle,
        }
    }

    /// Release the context. It cannot be used afterwards.
    pub fn release(mut self) -> Result<()> {
        self.live = false;
        log::debug!("Releasing context {:#x}", self.handle);
        check(self.api.release_context(self.handle), Target::Context)
    }

    /// Names of the readers currently known to the resource manager.
    ///
    /// No readers attached is an empty list, not an error.
    pub fn list_readers(&self) -> Result<Vec<String>> {
        let result = query_two_phase(Target::Context, |buf, len| {
            self.api.list_readers(self.handle, buf, len)
        });
        let buffer = match result {
            Ok(buffer) => buffer,
            Err(e) if e.code() == Some(StatusCode::E_NO_READERS_AVAILABLE) => {
                log::debug!("No readers available");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        let readers = decode_multi_string(&buffer);
        log::debug!("Found {} reader(s)", readers.len());
        Ok(readers)
    }

    /// Names of the reader groups.
    pub fn list_reader_groups(&self) -> Result<Vec<String>> {
        let buffer = query_two_phase(Target::Context, |buf, len| {
            self.api.list_reader_groups(self.handle, buf, len)
        })?;
        Ok(decode_multi_string(&buffer))
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if !self.live {
            return;
        }
        let code = self.api.release_context(self.handle);
        if !code.is_success() {
            log::warn!(
                "Failed to release context {:#x}: {}",
                self.handle,
                code.message()
            );
        }
    }
}

/// Cancels status-change waits on the context it was taken from.
#[derive(Clone, Copy)]
pub struct Canceller<'ctx> {
    api: &'ctx dyn ResourceManager,
    handle: RawHandle,
}

impl fmt::Debug for Canceller<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Canceller")
            .field("handle", &self.handle)
            .finish()
    }
}

impl Canceller<'_> {
    pub fn cancel(&self) -> Result<()> {
        log::debug!("Cancelling waits on context {:#x}", self.handle);
        check(self.api.cancel(self.handle), Target::Context)
    }
}
