//! Reader monitoring on top of `GetStatusChange`.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::core::context::Context;
use crate::core::error::{check, Error, ErrorKind, Result, Target};
use crate::core::native::ReaderStateRecord;
use crate::core::types::{StateFlags, INFINITE_TIMEOUT, PNP_NOTIFICATION};
use crate::core::utils::format_hex_spaced;

/// How long `get_status_change` may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Infinite,
    After(Duration),
}

impl Timeout {
    /// Negative values mean "wait forever".
    pub fn from_millis_signed(ms: i64) -> Self {
        if ms < 0 {
            Self::Infinite
        } else {
            Self::After(Duration::from_millis(ms.unsigned_abs()))
        }
    }

    /// Milliseconds for the native call, rounded toward zero.
    ///
    /// A finite wait never maps onto the infinite sentinel: anything that
    /// would reach it is clamped to one millisecond less.
    pub fn to_native(self) -> u32 {
        match self {
            Self::Infinite => INFINITE_TIMEOUT,
            Self::After(duration) => {
                let ms = duration.as_millis();
                if ms >= u128::from(INFINITE_TIMEOUT) {
                    INFINITE_TIMEOUT - 1
                } else {
                    ms as u32
                }
            }
        }
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Self::After(duration)
    }
}

impl From<Option<Duration>> for Timeout {
    fn from(duration: Option<Duration>) -> Self {
        duration.map_or(Self::Infinite, Self::After)
    }
}

/// Polling record for one reader.
///
/// `current_state` is what the caller believes; `event_state` is what the
/// resource manager reported on the last call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderState {
    name: String,
    current_state: StateFlags,
    event_state: StateFlags,
    atr: Vec<u8>,
}

impl ReaderState {
    pub fn new(name: impl Into<String>, current_state: StateFlags) -> Self {
        Self {
            name: name.into(),
            current_state,
            event_state: StateFlags::UNAWARE,
            atr: Vec::new(),
        }
    }

    /// Record for the pseudo reader that signals reader attach/detach.
    pub fn pnp_notification() -> Self {
        Self::new(PNP_NOTIFICATION, StateFlags::UNAWARE)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_pnp_notification(&self) -> bool {
        self.name == PNP_NOTIFICATION
    }

    pub fn current_state(&self) -> StateFlags {
        self.current_state
    }

    pub fn set_current_state(&mut self, state: StateFlags) {
        self.current_state = state;
    }

    pub fn event_state(&self) -> StateFlags {
        self.event_state
    }

    pub fn atr(&self) -> &[u8] {
        &self.atr
    }

    /// Seed the ATR sent with the request (used with `ATRMATCH`).
    pub fn set_atr(&mut self, atr: &[u8]) {
        self.atr = atr.to_vec();
    }

    pub fn has_changed(&self) -> bool {
        self.event_state.contains(StateFlags::CHANGED)
    }

    /// Adopt the reported state as the assumption for the next wait.
    pub fn sync_current_state(&mut self) {
        self.current_state = self.event_state.without(StateFlags::CHANGED);
    }

    /// Transitions between `current_state` and `event_state`.
    pub fn events(&self) -> Vec<ReaderEvent> {
        if !self.has_changed() {
            return Vec::new();
        }
        if self.is_pnp_notification() {
            return vec![ReaderEvent::ReadersChanged];
        }

        let before = self.current_state;
        let now = self.event_state;
        let reader = self.name.clone();
        let mut events = Vec::new();

        let unavailable = StateFlags::UNKNOWN | StateFlags::UNAVAILABLE;
        if (now & unavailable).bits() != 0 && (before & unavailable).bits() == 0 {
            events.push(ReaderEvent::ReaderUnavailable {
                reader: reader.clone(),
            });
        }
        if now.contains(StateFlags::PRESENT) && !before.contains(StateFlags::PRESENT) {
            events.push(ReaderEvent::CardInserted {
                reader: reader.clone(),
                atr: self.atr.clone(),
            });
        }
        if before.contains(StateFlags::PRESENT) && !now.contains(StateFlags::PRESENT) {
            events.push(ReaderEvent::CardRemoved {
                reader: reader.clone(),
            });
        }
        if now.contains(StateFlags::EXCLUSIVE) && !before.contains(StateFlags::EXCLUSIVE) {
            events.push(ReaderEvent::ExclusiveAccess { reader });
        }
        events
    }
}

/// A transition observed while monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ReaderEvent {
    CardInserted { reader: String, atr: Vec<u8> },
    CardRemoved { reader: String },
    ReaderUnavailable { reader: String },
    ExclusiveAccess { reader: String },
    /// The PnP pseudo reader fired; the reader list should be refreshed.
    ReadersChanged,
    ReaderAdded(String),
    ReaderRemoved(String),
}

impl fmt::Display for ReaderEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CardInserted { reader, atr } => {
                write!(f, "Card inserted in {reader} (ATR: {})", format_hex_spaced(atr))
            }
            Self::CardRemoved { reader } => write!(f, "Card removed from {reader}"),
            Self::ReaderUnavailable { reader } => write!(f, "Reader unavailable: {reader}"),
            Self::ExclusiveAccess { reader } => {
                write!(f, "Reader {reader} held exclusively by another session")
            }
            Self::ReadersChanged => write!(f, "Reader list changed"),
            Self::ReaderAdded(reader) => write!(f, "Reader added: {reader}"),
            Self::ReaderRemoved(reader) => write!(f, "Reader removed: {reader}"),
        }
    }
}

impl Context {
    /// Block until a reader differs from its `current_state`, the timeout
    /// elapses, or [`Context::cancel`] is called.
    ///
    /// Every entry gets its `event_state` (and ATR, when a card is present)
    /// refreshed, changed or not. An empty slice is passed through to the
    /// native layer as is.
    pub fn get_status_change(
        &self,
        states: &mut [ReaderState],
        timeout: impl Into<Timeout>,
    ) -> Result<()> {
        validate_names(states)?;
        let timeout_ms = timeout.into().to_native();
        log::debug!(
            "SCardGetStatusChange: {} reader(s), timeout {timeout_ms} ms",
            states.len()
        );

        let results: Vec<(u32, Vec<u8>)> = {
            let mut records: Vec<ReaderStateRecord<'_>> = states
                .iter()
                .map(|s| ReaderStateRecord::new(&s.name, s.current_state.bits(), &s.atr))
                .collect();
            check(
                self.api()
                    .get_status_change(self.raw(), timeout_ms, &mut records),
                Target::Context,
            )?;
            records
                .iter()
                .map(|r| (r.event_state, r.atr().to_vec()))
                .collect()
        };

        for (state, (event, atr)) in states.iter_mut().zip(results) {
            state.event_state = StateFlags::from_bits_retain(event);
            if !atr.is_empty() {
                state.atr = atr;
            }
            log::trace!("{}: {} -> {}", state.name, state.current_state, state.event_state);
        }
        Ok(())
    }
}

fn validate_names(states: &[ReaderState]) -> Result<()> {
    let mut seen = HashSet::with_capacity(states.len());
    for state in states {
        if state.name.is_empty() || state.name.contains('\0') {
            return Err(Error::InvalidName(state.name.clone()));
        }
        if !seen.insert(state.name.as_str()) {
            return Err(Error::InvalidArgument("duplicate reader in state list"));
        }
    }
    Ok(())
}

/// Event-driven card presence loop over a set of readers.
#[derive(Debug, Clone, Default)]
pub struct ReaderMonitor {
    states: Vec<ReaderState>,
}

impl ReaderMonitor {
    /// Watch the named readers, starting from an unaware state.
    pub fn new<I, S>(readers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            states: readers
                .into_iter()
                .map(|name| ReaderState::new(name, StateFlags::UNAWARE))
                .collect(),
        }
    }

    /// Watch every current reader and follow attach/detach.
    pub fn for_all_readers(ctx: &Context) -> Result<Self> {
        Ok(Self::new(ctx.list_readers()?).with_pnp_notification())
    }

    pub fn with_pnp_notification(mut self) -> Self {
        if !self.states.iter().any(ReaderState::is_pnp_notification) {
            self.states.push(ReaderState::pnp_notification());
        }
        self
    }

    pub fn states(&self) -> &[ReaderState] {
        &self.states
    }

    pub fn readers(&self) -> impl Iterator<Item = &str> {
        self.states
            .iter()
            .filter(|s| !s.is_pnp_notification())
            .map(ReaderState::name)
    }

    /// Wait for the next round of changes and return them.
    ///
    /// A timeout is reported as an empty list. After a PnP notification
    /// the reader list is refreshed and added/removed readers are reported.
    /// If that refresh fails, the events seen so far are still returned and
    /// the refresh is retried on the next poll.
    pub fn poll(
        &mut self,
        ctx: &Context,
        timeout: impl Into<Timeout>,
    ) -> Result<Vec<ReaderEvent>> {
        if self.states.is_empty() {
            return Err(Error::InvalidArgument("no readers to monitor"));
        }

        match ctx.get_status_change(&mut self.states, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Timeout => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        let mut events: Vec<ReaderEvent> =
            self.states.iter().flat_map(ReaderState::events).collect();
        let readers_changed = events.contains(&ReaderEvent::ReadersChanged);

        // The PnP entry keeps its old state until the refresh succeeds.
        for state in &mut self.states {
            if !(readers_changed && state.is_pnp_notification()) {
                state.sync_current_state();
            }
        }

        if readers_changed {
            match self.refresh(ctx) {
                Ok(changes) => {
                    events.extend(changes);
                    for state in self.states.iter_mut().filter(|s| s.is_pnp_notification()) {
                        state.sync_current_state();
                    }
                }
                Err(e) => log::warn!("Failed to refresh reader list: {e}"),
            }
        }
        for event in &events {
            log::info!("{event}");
        }
        Ok(events)
    }

    fn refresh(&mut self, ctx: &Context) -> Result<Vec<ReaderEvent>> {
        let current = ctx.list_readers()?;
        let mut events = Vec::new();

        self.states.retain(|state| {
            let keep = state.is_pnp_notification() || current.contains(&state.name);
            if !keep {
                events.push(ReaderEvent::ReaderRemoved(state.name.clone()));
            }
            keep
        });

        for name in current {
            if !self.states.iter().any(|s| s.name == name) {
                events.push(ReaderEvent::ReaderAdded(name.clone()));
                self.states.push(ReaderState::new(name, StateFlags::UNAWARE));
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fake::{FakeCard, FakeResourceManager};
    use crate::core::error::StatusCode;
    use crate::core::types::Scope;
    use std::sync::Arc;

    const ATR: [u8; 4] = [0x3B, 0x02, 0x14, 0x50];

    fn setup() -> (Arc<FakeResourceManager>, Context) {
        let api = Arc::new(
            FakeResourceManager::new()
                .with_reader("Reader A")
                .with_reader("Reader B")
                .with_card("Reader A", FakeCard::new(&ATR)),
        );
        let ctx = Context::establish(api.clone(), Scope::User).unwrap();
        (api, ctx)
    }

    #[test]
    fn test_timeout_mapping() {
        assert_eq!(Timeout::from_millis_signed(-1).to_native(), INFINITE_TIMEOUT);
        assert_eq!(Timeout::from_millis_signed(0).to_native(), 0);
        assert_eq!(Timeout::from_millis_signed(2500).to_native(), 2500);
        assert_eq!(Timeout::from(None).to_native(), INFINITE_TIMEOUT);
        assert_eq!(Timeout::from(Duration::from_micros(2500_999)).to_native(), 2500);
        assert_eq!(
            Timeout::from(Duration::from_secs(60 * 60 * 24 * 365)).to_native(),
            INFINITE_TIMEOUT - 1
        );
        assert_eq!(
            Timeout::from(Duration::from_millis(u64::from(INFINITE_TIMEOUT))).to_native(),
            INFINITE_TIMEOUT - 1
        );
        assert_eq!(
            Timeout::from(Duration::from_millis(u64::from(INFINITE_TIMEOUT) - 1)).to_native(),
            INFINITE_TIMEOUT - 1
        );
    }

    #[test]
    fn test_unaware_states_return_immediately() {
        let (api, ctx) = setup();
        let mut states = vec![
            ReaderState::new("Reader A", StateFlags::UNAWARE),
            ReaderState::new("Reader B", StateFlags::UNAWARE),
        ];
        ctx.get_status_change(&mut states, Duration::from_millis(2500))
            .unwrap();
        assert_eq!(api.last_timeout(), Some(2500));

        assert!(states[0].event_state().contains(StateFlags::PRESENT));
        assert!(states[0].has_changed());
        assert_eq!(states[0].atr(), &ATR);
        assert!(states[1].event_state().contains(StateFlags::EMPTY));
        assert!(states[1].atr().is_empty());
    }

    #[test]
    fn test_no_change_times_out() {
        let (_api, ctx) = setup();
        let mut states = vec![ReaderState::new("Reader A", StateFlags::UNAWARE)];
        ctx.get_status_change(&mut states, Duration::ZERO).unwrap();
        states[0].sync_current_state();

        let err = ctx
            .get_status_change(&mut states, Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_events_for_insert_and_remove() {
        let mut state = ReaderState::new("Reader B", StateFlags::EMPTY);
        state.event_state = StateFlags::PRESENT | StateFlags::CHANGED;
        state.atr = ATR.to_vec();
        assert_eq!(
            state.events(),
            vec![ReaderEvent::CardInserted {
                reader: "Reader B".into(),
                atr: ATR.to_vec()
            }]
        );

        state.sync_current_state();
        assert_eq!(state.current_state(), StateFlags::PRESENT);
        state.event_state = StateFlags::EMPTY | StateFlags::CHANGED;
        assert_eq!(
            state.events(),
            vec![ReaderEvent::CardRemoved {
                reader: "Reader B".into()
            }]
        );
    }

    #[test]
    fn test_unchanged_entry_has_no_events() {
        let mut state = ReaderState::new("Reader A", StateFlags::PRESENT);
        state.event_state = StateFlags::PRESENT;
        assert!(state.events().is_empty());
    }

    #[test]
    fn test_invalid_names_rejected() {
        let (api, ctx) = setup();
        let mut empty = vec![ReaderState::new("", StateFlags::UNAWARE)];
        assert!(matches!(
            ctx.get_status_change(&mut empty, Timeout::Infinite),
            Err(Error::InvalidName(_))
        ));
        let mut dup = vec![
            ReaderState::new("Reader A", StateFlags::UNAWARE),
            ReaderState::new("Reader A", StateFlags::UNAWARE),
        ];
        assert!(ctx.get_status_change(&mut dup, Timeout::Infinite).is_err());
        assert_eq!(api.call_count("SCardGetStatusChange"), 0);
    }

    #[test]
    fn test_empty_list_is_forwarded() {
        let (api, ctx) = setup();
        let result = ctx.get_status_change(&mut [], Duration::ZERO);
        assert_eq!(api.call_count("SCardGetStatusChange"), 1);
        // The fake rejects it; a real service may behave differently.
        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidParameter);
    }

    #[test]
    fn test_monitor_reports_initial_card() {
        let (_api, ctx) = setup();
        let mut monitor = ReaderMonitor::new(["Reader A", "Reader B"]);
        let events = monitor.poll(&ctx, Duration::ZERO).unwrap();
        assert_eq!(
            events,
            vec![ReaderEvent::CardInserted {
                reader: "Reader A".into(),
                atr: ATR.to_vec()
            }]
        );

        // Nothing changed since: timeout maps to no events.
        assert!(monitor.poll(&ctx, Duration::from_millis(10)).unwrap().is_empty());
    }

    #[test]
    fn test_monitor_sees_removal() {
        let (api, ctx) = setup();
        let mut monitor = ReaderMonitor::new(["Reader A"]);
        monitor.poll(&ctx, Duration::ZERO).unwrap();

        api.remove_card("Reader A");
        let events = monitor.poll(&ctx, Duration::from_millis(100)).unwrap();
        assert_eq!(
            events,
            vec![ReaderEvent::CardRemoved {
                reader: "Reader A".into()
            }]
        );
    }

    #[test]
    fn test_monitor_follows_reader_attach() {
        let (api, ctx) = setup();
        let mut monitor = ReaderMonitor::for_all_readers(&ctx).unwrap();
        monitor.poll(&ctx, Duration::ZERO).unwrap();

        api.attach_reader("Reader C");
        let events = monitor.poll(&ctx, Duration::from_millis(100)).unwrap();
        assert!(events.contains(&ReaderEvent::ReadersChanged));
        assert!(events.contains(&ReaderEvent::ReaderAdded("Reader C".into())));
        assert_eq!(
            monitor.readers().collect::<Vec<_>>(),
            vec!["Reader A", "Reader B", "Reader C"]
        );
    }

    #[test]
    fn test_monitor_keeps_events_when_refresh_fails() {
        let (api, ctx) = setup();
        let mut monitor = ReaderMonitor::for_all_readers(&ctx).unwrap();
        monitor.poll(&ctx, Duration::ZERO).unwrap();

        api.detach_reader("Reader B");
        api.fail_next("SCardListReaders", StatusCode::E_NO_SERVICE);
        let events = monitor.poll(&ctx, Duration::from_millis(100)).unwrap();
        assert!(events.contains(&ReaderEvent::ReaderUnavailable {
            reader: "Reader B".into()
        }));
        assert!(events.contains(&ReaderEvent::ReadersChanged));
        assert!(!events.contains(&ReaderEvent::ReaderRemoved("Reader B".into())));

        // The reader list change is still pending and picked up next time.
        let events = monitor.poll(&ctx, Duration::ZERO).unwrap();
        assert!(events.contains(&ReaderEvent::ReaderRemoved("Reader B".into())));
        assert_eq!(monitor.readers().collect::<Vec<_>>(), vec!["Reader A"]);
    }

    #[test]
    fn test_monitor_without_readers() {
        let (_api, ctx) = setup();
        let mut monitor = ReaderMonitor::new(Vec::<String>::new());
        assert!(monitor.poll(&ctx, Duration::ZERO).is_err());
    }
}
