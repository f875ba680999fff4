//! In-memory resource manager.
//!
//! Simulates readers, cards, groups and attributes behind the
//! [`ResourceManager`] boundary so the client can be exercised without
//! hardware. Every entry point is counted, and `GetStatusChange` really
//! blocks until a simulated insert/remove, a timeout, or `Cancel`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::core::error::StatusCode;
use crate::core::native::{IoRequest, RawHandle, ReaderStateRecord, ResourceManager};
use crate::core::types::{
    Attrib, CardState, Disposition, Protocol, Protocols, ShareMode, StateFlags, INFINITE_TIMEOUT,
    PNP_NOTIFICATION,
};
use crate::core::utils::encode_multi_string;

/// A simulated card.
#[derive(Debug, Clone)]
pub struct FakeCard {
    atr: Vec<u8>,
    protocols: Protocols,
    responses: HashMap<Vec<u8>, Vec<u8>>,
    attributes: HashMap<u32, Vec<u8>>,
}

impl FakeCard {
    pub fn new(atr: &[u8]) -> Self {
        Self {
            atr: atr.to_vec(),
            protocols: Protocols::ANY,
            responses: HashMap::new(),
            attributes: HashMap::new(),
        }
    }

    /// Protocols the card is able to negotiate.
    pub fn with_protocols(mut self, protocols: Protocols) -> Self {
        self.protocols = protocols;
        self
    }

    /// Scripted response for an exact command.
    pub fn with_response(mut self, command: &[u8], response: &[u8]) -> Self {
        self.responses.insert(command.to_vec(), response.to_vec());
        self
    }

    pub fn with_attribute(mut self, attrib: Attrib, value: &[u8]) -> Self {
        self.attributes.insert(attrib.0, value.to_vec());
        self
    }

    fn respond(&self, command: &[u8]) -> Vec<u8> {
        if let Some(response) = self.responses.get(command) {
            return response.clone();
        }
        match command {
            // SELECT: empty FCI
            [0x00, 0xA4, ..] => vec![0x6F, 0x00, 0x90, 0x00],
            // INS not supported
            _ => vec![0x6D, 0x00],
        }
    }
}

#[derive(Debug)]
struct FakeReader {
    name: String,
    card: Option<FakeCard>,
    event_count: u16,
    users: usize,
    exclusive_holder: Option<RawHandle>,
    transaction_holder: Option<RawHandle>,
    attributes: HashMap<u32, Vec<u8>>,
    control_responses: HashMap<u32, Vec<u8>>,
}

impl FakeReader {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            card: None,
            event_count: 0,
            users: 0,
            exclusive_holder: None,
            transaction_holder: None,
            attributes: HashMap::new(),
            control_responses: HashMap::new(),
        }
    }

    fn observed_state(&self) -> StateFlags {
        let mut state = if self.card.is_some() {
            StateFlags::PRESENT
        } else {
            StateFlags::EMPTY
        };
        if self.users > 0 {
            state |= StateFlags::INUSE;
        }
        if self.exclusive_holder.is_some() {
            state |= StateFlags::EXCLUSIVE;
        }
        state.with_event_count(self.event_count)
    }
}

#[derive(Debug)]
struct CardEntry {
    context: RawHandle,
    reader: String,
    protocol: u32,
}

#[derive(Debug, Default)]
struct ContextEntry {
    waiting: usize,
    cancel_pending: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    service_stopped: bool,
    readers: Vec<FakeReader>,
    groups: Vec<String>,
    pnp_events: u16,
    contexts: HashMap<RawHandle, ContextEntry>,
    cards: HashMap<RawHandle, CardEntry>,
    next_handle: RawHandle,
    calls: HashMap<&'static str, usize>,
    failures: HashMap<String, StatusCode>,
    last_timeout: Option<u32>,
    last_pci: Option<IoRequest>,
}

impl FakeState {
    /// Counts a call and returns the failure queued for it, if any.
    fn count(&mut self, entry_point: &'static str) -> Option<StatusCode> {
        *self.calls.entry(entry_point).or_default() += 1;
        self.failures.remove(entry_point)
    }

    fn allocate(&mut self) -> RawHandle {
        self.next_handle += 1;
        0x1000 + self.next_handle
    }

    fn reader(&self, name: &str) -> Option<&FakeReader> {
        self.readers.iter().find(|r| r.name == name)
    }

    fn reader_mut(&mut self, name: &str) -> Option<&mut FakeReader> {
        self.readers.iter_mut().find(|r| r.name == name)
    }

    fn card_reader_mut(&mut self, card: RawHandle) -> Result<&mut FakeReader, StatusCode> {
        let name = match self.cards.get(&card) {
            Some(entry) => entry.reader.clone(),
            None => return Err(StatusCode::E_INVALID_HANDLE),
        };
        self.reader_mut(&name)
            .ok_or(StatusCode::E_READER_UNAVAILABLE)
    }

    /// Drops a card handle along with everything it held on its reader.
    fn close_card(&mut self, card: RawHandle, disposition: u32) -> StatusCode {
        let reader = match self.card_reader_mut(card) {
            Ok(r) => r,
            Err(code) => return code,
        };
        reader.users = reader.users.saturating_sub(1);
        if reader.exclusive_holder == Some(card) {
            reader.exclusive_holder = None;
        }
        if reader.transaction_holder == Some(card) {
            reader.transaction_holder = None;
        }
        if disposition == Disposition::Eject.to_native() {
            reader.card = None;
        }
        reader.event_count = reader.event_count.wrapping_add(1);
        self.cards.remove(&card);
        StatusCode::SUCCESS
    }

    fn has_context(&self, context: RawHandle) -> bool {
        self.contexts.contains_key(&context)
    }

    /// Event state for one record, and whether it differs from the
    /// caller's assumption.
    fn evaluate(&self, reader: &str, current: StateFlags) -> (StateFlags, Vec<u8>, bool) {
        if reader == PNP_NOTIFICATION {
            let observed = StateFlags::UNAWARE.with_event_count(self.pnp_events);
            let changed = current.event_count() != self.pnp_events;
            return (observed, Vec::new(), changed);
        }

        let Some(r) = self.reader(reader) else {
            return (StateFlags::UNKNOWN | StateFlags::UNAVAILABLE, Vec::new(), true);
        };

        let observed = r.observed_state();
        let atr = r.card.as_ref().map(|c| c.atr.clone()).unwrap_or_default();
        let changed = current.flags() == StateFlags::UNAWARE
            || current.flags().without(StateFlags::CHANGED) != observed.flags()
            || (current.event_count() != 0 && current.event_count() != observed.event_count());
        (observed, atr, changed)
    }

    /// Writes event states into `states`; returns whether any changed.
    fn fill(&self, states: &mut [ReaderStateRecord<'_>]) -> bool {
        let mut any_changed = false;
        for record in states.iter_mut() {
            let current = StateFlags::from_bits_retain(record.current_state);
            if current.contains(StateFlags::IGNORE) {
                record.event_state = StateFlags::IGNORE.bits();
                continue;
            }
            let (mut observed, atr, changed) = self.evaluate(record.reader, current);
            if changed {
                observed |= StateFlags::CHANGED;
                any_changed = true;
            }
            record.event_state = observed.bits();
            let len = atr.len().min(record.atr.len());
            record.atr[..len].copy_from_slice(&atr[..len]);
            record.atr_len = len as u32;
        }
        any_changed
    }
}

/// Resource manager backed by in-memory state.
#[derive(Debug, Default)]
pub struct FakeResourceManager {
    state: Mutex<FakeState>,
    changed: Condvar,
}

impl FakeResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Two readers: the first holds a T=1 card, the second is empty.
    pub fn demo() -> Self {
        let card = FakeCard::new(&[
            0x3B, 0x8F, 0x80, 0x01, 0x80, 0x4F, 0x0C, 0xA0, 0x00, 0x00, 0x03, 0x06, 0x03, 0x00,
            0x01, 0x00, 0x00, 0x00, 0x00, 0x6A,
        ])
        .with_protocols(Protocols::T1)
        .with_response(
            &[0x00, 0xCA, 0x00, 0x00, 0x00],
            &[0x04, 0xA2, 0x3F, 0x19, 0x90, 0x00],
        );

        Self::new()
            .with_reader("Simulated Reader 0")
            .with_reader("Simulated Reader 1")
            .with_group("SCard$DefaultReaders")
            .with_card("Simulated Reader 0", card)
            .with_reader_attribute("Simulated Reader 0", Attrib::VENDOR_NAME, b"Simulated\0")
            .with_reader_attribute("Simulated Reader 1", Attrib::VENDOR_NAME, b"Simulated\0")
    }

    pub fn with_reader(self, name: &str) -> Self {
        self.state.lock().readers.push(FakeReader::new(name));
        self
    }

    pub fn with_group(self, group: &str) -> Self {
        self.state.lock().groups.push(group.to_string());
        self
    }

    pub fn with_card(self, reader: &str, card: FakeCard) -> Self {
        if let Some(r) = self.state.lock().reader_mut(reader) {
            r.card = Some(card);
        }
        self
    }

    pub fn with_reader_attribute(self, reader: &str, attrib: Attrib, value: &[u8]) -> Self {
        if let Some(r) = self.state.lock().reader_mut(reader) {
            r.attributes.insert(attrib.0, value.to_vec());
        }
        self
    }

    /// Response for a control code on a reader. Unknown codes echo the input.
    pub fn with_control_response(self, reader: &str, code: u32, response: &[u8]) -> Self {
        if let Some(r) = self.state.lock().reader_mut(reader) {
            r.control_responses.insert(code, response.to_vec());
        }
        self
    }

    /// Makes every `EstablishContext` fail as if the service were down.
    pub fn without_service(self) -> Self {
        self.state.lock().service_stopped = true;
        self
    }

    /// Put a card into a reader and wake any waiters.
    pub fn insert_card(&self, reader: &str, card: FakeCard) {
        let mut state = self.state.lock();
        if let Some(r) = state.reader_mut(reader) {
            r.card = Some(card);
            r.event_count = r.event_count.wrapping_add(1);
        }
        self.changed.notify_all();
    }

    /// Pull the card out of a reader and wake any waiters.
    pub fn remove_card(&self, reader: &str) {
        let mut state = self.state.lock();
        if let Some(r) = state.reader_mut(reader) {
            r.card = None;
            r.transaction_holder = None;
            r.event_count = r.event_count.wrapping_add(1);
        }
        self.changed.notify_all();
    }

    pub fn attach_reader(&self, name: &str) {
        let mut state = self.state.lock();
        state.readers.push(FakeReader::new(name));
        state.pnp_events = state.pnp_events.wrapping_add(1);
        self.changed.notify_all();
    }

    pub fn detach_reader(&self, name: &str) {
        let mut state = self.state.lock();
        state.readers.retain(|r| r.name != name);
        state.cards.retain(|_, c| c.reader != name);
        state.pnp_events = state.pnp_events.wrapping_add(1);
        self.changed.notify_all();
    }

    /// Makes the next call to `entry_point` fail with `code`.
    pub fn fail_next(&self, entry_point: &str, code: StatusCode) {
        self.state
            .lock()
            .failures
            .insert(entry_point.to_string(), code);
    }

    /// How often an entry point was called, by its native name.
    pub fn call_count(&self, entry_point: &str) -> usize {
        self.state
            .lock()
            .calls
            .get(entry_point)
            .copied()
            .unwrap_or(0)
    }

    /// Timeout passed to the most recent `GetStatusChange`.
    pub fn last_timeout(&self) -> Option<u32> {
        self.state.lock().last_timeout
    }

    /// Framing descriptor of the most recent `Transmit`.
    pub fn last_transmit_pci(&self) -> Option<IoRequest> {
        self.state.lock().last_pci
    }

    pub fn open_contexts(&self) -> usize {
        self.state.lock().contexts.len()
    }

    pub fn open_cards(&self) -> usize {
        self.state.lock().cards.len()
    }

    /// Threads currently blocked in `GetStatusChange`.
    pub fn pending_waits(&self) -> usize {
        self.state.lock().contexts.values().map(|c| c.waiting).sum()
    }

    /// Attribute value as last stored, for either the card or the reader.
    pub fn attribute(&self, reader: &str, attrib: Attrib) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let r = state.reader(reader)?;
        r.card
            .as_ref()
            .and_then(|c| c.attributes.get(&attrib.0))
            .or_else(|| r.attributes.get(&attrib.0))
            .cloned()
    }

    fn negotiate(card: &FakeCard, share_mode: u32, preferred: u32) -> Result<u32, StatusCode> {
        let offered = Protocols::from_bits_retain(preferred);
        if share_mode == ShareMode::Direct.to_native() && offered.is_empty() {
            return Ok(Protocol::Undefined.to_native());
        }
        for protocol in [Protocol::T1, Protocol::T0, Protocol::Raw] {
            let mask = Protocols::from(protocol);
            if offered.contains(mask) && card.protocols.contains(mask) {
                return Ok(protocol.to_native());
            }
        }
        Err(StatusCode::E_PROTO_MISMATCH)
    }
}

fn write_two_phase(data: &[u8], buffer: Option<&mut [u8]>, len: &mut u32) -> StatusCode {
    *len = data.len() as u32;
    match buffer {
        None => StatusCode::SUCCESS,
        Some(buf) if buf.len() < data.len() => StatusCode::E_INSUFFICIENT_BUFFER,
        Some(buf) => {
            buf[..data.len()].copy_from_slice(data);
            StatusCode::SUCCESS
        }
    }
}

impl ResourceManager for FakeResourceManager {
    fn establish_context(&self, _scope: u32, context: &mut RawHandle) -> StatusCode {
        let mut state = self.state.lock();
        if let Some(code) = state.count("SCardEstablishContext") {
            return code;
        }
        if state.service_stopped {
            return StatusCode::E_NO_SERVICE;
        }
        let handle = state.allocate();
        state.contexts.insert(handle, ContextEntry::default());
        *context = handle;
        StatusCode::SUCCESS
    }

    fn release_context(&self, context: RawHandle) -> StatusCode {
        let mut state = self.state.lock();
        if let Some(code) = state.count("SCardReleaseContext") {
            return code;
        }
        if state.contexts.remove(&context).is_none() {
            return StatusCode::E_INVALID_HANDLE;
        }

        // Card handles die with the context that opened them.
        let orphaned: Vec<RawHandle> = state
            .cards
            .iter()
            .filter(|(_, entry)| entry.context == context)
            .map(|(handle, _)| *handle)
            .collect();
        for card in orphaned {
            state.close_card(card, Disposition::Leave.to_native());
        }
        self.changed.notify_all();
        StatusCode::SUCCESS
    }

    fn is_valid_context(&self, context: RawHandle) -> StatusCode {
        let mut state = self.state.lock();
        if let Some(code) = state.count("SCardIsValidContext") {
            return code;
        }
        if state.has_context(context) {
            StatusCode::SUCCESS
        } else {
            StatusCode::E_INVALID_HANDLE
        }
    }

    fn cancel(&self, context: RawHandle) -> StatusCode {
        let mut state = self.state.lock();
        if let Some(code) = state.count("SCardCancel") {
            return code;
        }
        match state.contexts.get_mut(&context) {
            Some(entry) => {
                if entry.waiting > 0 {
                    entry.cancel_pending = true;
                    self.changed.notify_all();
                }
                StatusCode::SUCCESS
            }
            None => StatusCode::E_INVALID_HANDLE,
        }
    }

    fn list_readers(
        &self,
        context: RawHandle,
        buffer: Option<&mut [u8]>,
        len: &mut u32,
    ) -> StatusCode {
        let mut state = self.state.lock();
        if let Some(code) = state.count("SCardListReaders") {
            return code;
        }
        if !state.has_context(context) {
            return StatusCode::E_INVALID_HANDLE;
        }
        if state.readers.is_empty() {
            return StatusCode::E_NO_READERS_AVAILABLE;
        }
        let names: Vec<&str> = state.readers.iter().map(|r| r.name.as_str()).collect();
        let data: Vec<u8> = encode_multi_string(&names);
        write_two_phase(&data, buffer, len)
    }

    fn list_reader_groups(
        &self,
        context: RawHandle,
        buffer: Option<&mut [u8]>,
        len: &mut u32,
    ) -> StatusCode {
        let mut state = self.state.lock();
        if let Some(code) = state.count("SCardListReaderGroups") {
            return code;
        }
        if !state.has_context(context) {
            return StatusCode::E_INVALID_HANDLE;
        }
        let data: Vec<u8> = encode_multi_string(&state.groups);
        write_two_phase(&data, buffer, len)
    }

    fn get_status_change(
        &self,
        context: RawHandle,
        timeout_ms: u32,
        states: &mut [ReaderStateRecord<'_>],
    ) -> StatusCode {
        let mut state = self.state.lock();
        if let Some(code) = state.count("SCardGetStatusChange") {
            return code;
        }
        state.last_timeout = Some(timeout_ms);
        if !state.has_context(context) {
            return StatusCode::E_INVALID_HANDLE;
        }
        if states.is_empty() {
            return StatusCode::E_INVALID_VALUE;
        }
        if state.fill(states) {
            return StatusCode::SUCCESS;
        }

        let deadline = (timeout_ms != INFINITE_TIMEOUT)
            .then(|| Instant::now() + Duration::from_millis(u64::from(timeout_ms)));
        if let Some(entry) = state.contexts.get_mut(&context) {
            entry.waiting += 1;
        }

        let code = loop {
            let timed_out = match deadline {
                Some(deadline) => self.changed.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.changed.wait(&mut state);
                    false
                }
            };

            let cancelled = match state.contexts.get_mut(&context) {
                Some(entry) => std::mem::take(&mut entry.cancel_pending),
                None => break StatusCode::E_INVALID_HANDLE,
            };
            if cancelled {
                break StatusCode::E_CANCELLED;
            }
            if state.fill(states) {
                break StatusCode::SUCCESS;
            }
            if timed_out {
                break StatusCode::E_TIMEOUT;
            }
        };

        if let Some(entry) = state.contexts.get_mut(&context) {
            entry.waiting -= 1;
        }
        code
    }

    fn connect(
        &self,
        context: RawHandle,
        reader: &str,
        share_mode: u32,
        preferred_protocols: u32,
        card: &mut RawHandle,
        active_protocol: &mut u32,
    ) -> StatusCode {
        let mut state = self.state.lock();
        if let Some(code) = state.count("SCardConnect") {
            return code;
        }
        if !state.has_context(context) {
            return StatusCode::E_INVALID_HANDLE;
        }
        let handle = state.allocate();

        let Some(r) = state.reader_mut(reader) else {
            return StatusCode::E_UNKNOWN_READER;
        };
        if r.exclusive_holder.is_some()
            || (share_mode == ShareMode::Exclusive.to_native() && r.users > 0)
        {
            return StatusCode::E_SHARING_VIOLATION;
        }
        let protocol = match &r.card {
            Some(c) => match Self::negotiate(c, share_mode, preferred_protocols) {
                Ok(p) => p,
                Err(code) => return code,
            },
            None if share_mode == ShareMode::Direct.to_native() => Protocol::Undefined.to_native(),
            None => return StatusCode::E_NO_SMARTCARD,
        };

        r.users += 1;
        if share_mode == ShareMode::Exclusive.to_native() {
            r.exclusive_holder = Some(handle);
        }
        r.event_count = r.event_count.wrapping_add(1);

        state.cards.insert(
            handle,
            CardEntry {
                context,
                reader: reader.to_string(),
                protocol,
            },
        );
        *card = handle;
        *active_protocol = protocol;
        self.changed.notify_all();
        StatusCode::SUCCESS
    }

    fn reconnect(
        &self,
        card: RawHandle,
        share_mode: u32,
        preferred_protocols: u32,
        initialization: u32,
        active_protocol: &mut u32,
    ) -> StatusCode {
        let mut state = self.state.lock();
        if let Some(code) = state.count("SCardReconnect") {
            return code;
        }
        let reader = match state.card_reader_mut(card) {
            Ok(r) => r,
            Err(code) => return code,
        };
        if matches!(reader.exclusive_holder, Some(holder) if holder != card)
            || (share_mode == ShareMode::Exclusive.to_native() && reader.users > 1)
        {
            return StatusCode::E_SHARING_VIOLATION;
        }
        let protocol = match &reader.card {
            Some(c) => match Self::negotiate(c, share_mode, preferred_protocols) {
                Ok(p) => p,
                Err(code) => return code,
            },
            None => return StatusCode::W_REMOVED_CARD,
        };
        reader.exclusive_holder =
            (share_mode == ShareMode::Exclusive.to_native()).then_some(card);
        if initialization != Disposition::Leave.to_native() {
            reader.event_count = reader.event_count.wrapping_add(1);
        }
        if let Some(entry) = state.cards.get_mut(&card) {
            entry.protocol = protocol;
        }
        *active_protocol = protocol;
        self.changed.notify_all();
        StatusCode::SUCCESS
    }

    fn disconnect(&self, card: RawHandle, disposition: u32) -> StatusCode {
        let mut state = self.state.lock();
        if let Some(code) = state.count("SCardDisconnect") {
            return code;
        }
        let code = state.close_card(card, disposition);
        self.changed.notify_all();
        code
    }

    fn begin_transaction(&self, card: RawHandle) -> StatusCode {
        let mut state = self.state.lock();
        if let Some(code) = state.count("SCardBeginTransaction") {
            return code;
        }
        let reader = match state.card_reader_mut(card) {
            Ok(r) => r,
            Err(code) => return code,
        };
        if reader.card.is_none() {
            return StatusCode::W_REMOVED_CARD;
        }
        match reader.transaction_holder {
            Some(holder) if holder != card => StatusCode::E_SHARING_VIOLATION,
            _ => {
                reader.transaction_holder = Some(card);
                StatusCode::SUCCESS
            }
        }
    }

    fn end_transaction(&self, card: RawHandle, _disposition: u32) -> StatusCode {
        let mut state = self.state.lock();
        if let Some(code) = state.count("SCardEndTransaction") {
            return code;
        }
        let reader = match state.card_reader_mut(card) {
            Ok(r) => r,
            Err(code) => return code,
        };
        if reader.transaction_holder != Some(card) {
            return StatusCode::E_NOT_TRANSACTED;
        }
        reader.transaction_holder = None;
        StatusCode::SUCCESS
    }

    fn status(
        &self,
        card: RawHandle,
        reader_buf: &mut [u8],
        reader_len: &mut u32,
        card_state: &mut u32,
        protocol: &mut u32,
        atr_buf: &mut [u8],
        atr_len: &mut u32,
    ) -> StatusCode {
        let mut state = self.state.lock();
        if let Some(code) = state.count("SCardStatus") {
            return code;
        }
        let Some(entry) = state.cards.get(&card) else {
            return StatusCode::E_INVALID_HANDLE;
        };
        let negotiated = entry.protocol;
        let Some(reader) = state.reader(&entry.reader) else {
            return StatusCode::E_READER_UNAVAILABLE;
        };
        let Some(c) = &reader.card else {
            return StatusCode::W_REMOVED_CARD;
        };

        let name = reader.name.as_bytes();
        if reader_buf.len() < name.len() + 1 || atr_buf.len() < c.atr.len() {
            return StatusCode::E_INSUFFICIENT_BUFFER;
        }
        reader_buf[..name.len()].copy_from_slice(name);
        reader_buf[name.len()] = 0;
        *reader_len = (name.len() + 1) as u32;
        atr_buf[..c.atr.len()].copy_from_slice(&c.atr);
        *atr_len = c.atr.len() as u32;
        *card_state = CardState::Specific.to_native();
        *protocol = negotiated;
        StatusCode::SUCCESS
    }

    fn transmit(
        &self,
        card: RawHandle,
        pci: IoRequest,
        send: &[u8],
        recv: &mut [u8],
        recv_len: &mut u32,
    ) -> StatusCode {
        let mut state = self.state.lock();
        if let Some(code) = state.count("SCardTransmit") {
            return code;
        }
        state.last_pci = Some(pci);
        let Some(entry) = state.cards.get(&card) else {
            return StatusCode::E_INVALID_HANDLE;
        };
        let expected = match pci {
            IoRequest::T0 => Protocol::T0.to_native(),
            IoRequest::T1 => Protocol::T1.to_native(),
        };
        if entry.protocol != expected {
            return StatusCode::E_PROTO_MISMATCH;
        }
        let Some(c) = state.reader(&entry.reader).and_then(|r| r.card.as_ref()) else {
            return StatusCode::W_REMOVED_CARD;
        };

        let response = c.respond(send);
        if response.len() > recv.len() || response.len() > *recv_len as usize {
            return StatusCode::E_INSUFFICIENT_BUFFER;
        }
        recv[..response.len()].copy_from_slice(&response);
        *recv_len = response.len() as u32;
        StatusCode::SUCCESS
    }

    fn control(
        &self,
        card: RawHandle,
        control_code: u32,
        send: &[u8],
        recv: &mut [u8],
        returned: &mut u32,
    ) -> StatusCode {
        let mut state = self.state.lock();
        if let Some(code) = state.count("SCardControl") {
            return code;
        }
        let Some(entry) = state.cards.get(&card) else {
            return StatusCode::E_INVALID_HANDLE;
        };
        let Some(reader) = state.reader(&entry.reader) else {
            return StatusCode::E_READER_UNAVAILABLE;
        };

        let response = reader
            .control_responses
            .get(&control_code)
            .cloned()
            .unwrap_or_else(|| send.to_vec());
        if response.len() > recv.len() {
            return StatusCode::E_INSUFFICIENT_BUFFER;
        }
        recv[..response.len()].copy_from_slice(&response);
        *returned = response.len() as u32;
        StatusCode::SUCCESS
    }

    fn get_attrib(
        &self,
        card: RawHandle,
        attr_id: u32,
        buffer: Option<&mut [u8]>,
        len: &mut u32,
    ) -> StatusCode {
        let mut state = self.state.lock();
        if let Some(code) = state.count("SCardGetAttrib") {
            return code;
        }
        let Some(entry) = state.cards.get(&card) else {
            return StatusCode::E_INVALID_HANDLE;
        };
        let Some(reader) = state.reader(&entry.reader) else {
            return StatusCode::E_READER_UNAVAILABLE;
        };

        let value = match &reader.card {
            Some(c) if attr_id == Attrib::ATR_STRING.0 => Some(c.atr.clone()),
            Some(c) => c.attributes.get(&attr_id).cloned(),
            None => None,
        }
        .or_else(|| reader.attributes.get(&attr_id).cloned());

        match value {
            Some(value) => write_two_phase(&value, buffer, len),
            None => StatusCode::E_UNSUPPORTED_FEATURE,
        }
    }

    fn set_attrib(&self, card: RawHandle, attr_id: u32, data: &[u8]) -> StatusCode {
        let mut state = self.state.lock();
        if let Some(code) = state.count("SCardSetAttrib") {
            return code;
        }
        let reader = match state.card_reader_mut(card) {
            Ok(r) => r,
            Err(code) => return code,
        };
        match reader.card.as_mut() {
            Some(c) => {
                c.attributes.insert(attr_id, data.to_vec());
            }
            None => {
                reader.attributes.insert(attr_id, data.to_vec());
            }
        }
        StatusCode::SUCCESS
    }
}
