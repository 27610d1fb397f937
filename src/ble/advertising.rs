//! Advertising state.
//!
//! [`AdvState`] mirrors what the advertiser reports (advertising or idle).
//! [`AdvSequencer`] decides which advertising mode runs next: directed
//! advertising towards the last bonded peer first, then fast, then slow,
//! then idle, skipping every mode that is disabled or cannot run.

use super::connection::BleAddress;
use super::stack::Whitelist;
use crate::config::{
    ADV_DIRECTED_HIGH_DUTY_TIMEOUT, ADV_DIRECTED_INTERVAL, ADV_DIRECTED_TIMEOUT,
    ADV_FAST_INTERVAL, ADV_FAST_TIMEOUT, ADV_SLOW_INTERVAL, ADV_SLOW_TIMEOUT,
};

/// Advertising modes, in fallback order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdvMode {
    DirectedHighDuty,
    Directed,
    Fast,
    Slow,
    Idle,
}

impl AdvMode {
    /// Mode that follows when this one times out.
    pub fn next(self) -> AdvMode {
        match self {
            AdvMode::DirectedHighDuty => AdvMode::Directed,
            AdvMode::Directed => AdvMode::Fast,
            AdvMode::Fast => AdvMode::Slow,
            AdvMode::Slow | AdvMode::Idle => AdvMode::Idle,
        }
    }

    pub fn is_directed(self) -> bool {
        matches!(self, AdvMode::DirectedHighDuty | AdvMode::Directed)
    }
}

/// Events raised by the advertiser.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdvEvent {
    Idle,
    DirectedHighDuty,
    Directed,
    Fast,
    Slow,
    FastWhitelist,
    SlowWhitelist,
    /// The advertiser needs the whitelist before starting a filtered mode.
    WhitelistRequest,
    /// The advertiser needs the peer address before directed advertising.
    PeerAddrRequest,
}

/// Synchronous request the advertiser is waiting on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdvRequest {
    Whitelist,
    PeerAddress,
}

/// Published advertising flags. Never both set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdvState {
    advertising: bool,
    idle: bool,
}

impl AdvState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }

    /// A connection was established; the advertiser stopped.
    pub fn on_connected(&mut self) {
        self.advertising = false;
    }

    pub fn on_event(&mut self, event: AdvEvent) -> Option<AdvRequest> {
        match event {
            AdvEvent::DirectedHighDuty
            | AdvEvent::Directed
            | AdvEvent::Fast
            | AdvEvent::Slow
            | AdvEvent::FastWhitelist
            | AdvEvent::SlowWhitelist => {
                info!("advertising: {}", event);
                self.advertising = true;
                self.idle = false;
                None
            }
            AdvEvent::Idle => {
                info!("advertising stopped, idle");
                self.advertising = false;
                self.idle = true;
                None
            }
            AdvEvent::WhitelistRequest => {
                self.advertising = false;
                Some(AdvRequest::Whitelist)
            }
            AdvEvent::PeerAddrRequest => {
                self.advertising = false;
                Some(AdvRequest::PeerAddress)
            }
        }
    }
}

/// Advertiser configuration. Read once when advertising is set up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdvSettings {
    pub whitelist_enabled: bool,
    pub directed_high_duty_enabled: bool,
    pub directed_enabled: bool,
    pub fast_enabled: bool,
    pub slow_enabled: bool,
    /// Intervals in 0.625 ms units.
    pub directed_interval: u32,
    pub fast_interval: u32,
    pub slow_interval: u32,
    /// Timeouts in 10 ms units. Zero means no timeout.
    pub directed_high_duty_timeout: u16,
    pub directed_timeout: u16,
    pub fast_timeout: u16,
    pub slow_timeout: u16,
}

impl Default for AdvSettings {
    fn default() -> Self {
        Self {
            whitelist_enabled: false,
            directed_high_duty_enabled: true,
            directed_enabled: false,
            fast_enabled: true,
            slow_enabled: true,
            directed_interval: ADV_DIRECTED_INTERVAL,
            fast_interval: ADV_FAST_INTERVAL,
            slow_interval: ADV_SLOW_INTERVAL,
            directed_high_duty_timeout: ADV_DIRECTED_HIGH_DUTY_TIMEOUT,
            directed_timeout: ADV_DIRECTED_TIMEOUT,
            fast_timeout: ADV_FAST_TIMEOUT,
            slow_timeout: ADV_SLOW_TIMEOUT,
        }
    }
}

/// One advertising run decided by the sequencer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdvPlan {
    pub mode: AdvMode,
    /// Only whitelisted centrals may connect or scan.
    pub filtered: bool,
    /// Target of directed advertising.
    pub peer: Option<BleAddress>,
    pub interval: u32,
    pub timeout: u16,
    /// Event announcing this run.
    pub event: AdvEvent,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AdvSequencer {
    settings: AdvSettings,
}

impl AdvSequencer {
    pub fn new(settings: AdvSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &AdvSettings {
        &self.settings
    }

    /// The advertiser has to ask for the peer address before `mode`.
    pub fn needs_peer_address(&self, mode: AdvMode) -> bool {
        match mode {
            AdvMode::DirectedHighDuty => self.settings.directed_high_duty_enabled,
            AdvMode::Directed => self.settings.directed_enabled,
            _ => false,
        }
    }

    /// The advertiser has to ask for the whitelist before `mode`.
    pub fn needs_whitelist(&self, mode: AdvMode) -> bool {
        self.settings.whitelist_enabled && matches!(mode, AdvMode::Fast | AdvMode::Slow)
    }

    fn enabled(&self, mode: AdvMode) -> bool {
        match mode {
            AdvMode::DirectedHighDuty => self.settings.directed_high_duty_enabled,
            AdvMode::Directed => self.settings.directed_enabled,
            AdvMode::Fast => self.settings.fast_enabled,
            AdvMode::Slow => self.settings.slow_enabled,
            AdvMode::Idle => true,
        }
    }

    /// First runnable mode at or after `requested`.
    ///
    /// Directed modes need a peer address; whitelist variants are used
    /// when whitelisting is enabled and the whitelist is not empty.
    pub fn resolve(
        &self,
        requested: AdvMode,
        peer: Option<&BleAddress>,
        whitelist: Option<&Whitelist>,
    ) -> AdvPlan {
        let mut mode = requested;
        loop {
            let runnable = self.enabled(mode) && (!mode.is_directed() || peer.is_some());
            if runnable {
                break;
            }
            debug!("advertising mode {} skipped", mode);
            mode = mode.next();
        }

        let filtered = self.settings.whitelist_enabled
            && matches!(mode, AdvMode::Fast | AdvMode::Slow)
            && whitelist.is_some_and(|wl| !wl.is_empty());

        let s = &self.settings;
        let (interval, timeout, event) = match mode {
            AdvMode::DirectedHighDuty => {
                (0, s.directed_high_duty_timeout, AdvEvent::DirectedHighDuty)
            }
            AdvMode::Directed => (s.directed_interval, s.directed_timeout, AdvEvent::Directed),
            AdvMode::Fast if filtered => (s.fast_interval, s.fast_timeout, AdvEvent::FastWhitelist),
            AdvMode::Fast => (s.fast_interval, s.fast_timeout, AdvEvent::Fast),
            AdvMode::Slow if filtered => (s.slow_interval, s.slow_timeout, AdvEvent::SlowWhitelist),
            AdvMode::Slow => (s.slow_interval, s.slow_timeout, AdvEvent::Slow),
            AdvMode::Idle => (0, 0, AdvEvent::Idle),
        };

        AdvPlan {
            mode,
            filtered,
            peer: if mode.is_directed() { peer.copied() } else { None },
            interval,
            timeout,
            event,
        }
    }

    /// Mode to request after `current` ran out.
    pub fn next_on_timeout(&self, current: AdvMode) -> AdvMode {
        current.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::connection::AddressKind;

    const PEER: BleAddress = BleAddress::new(AddressKind::Public, [1, 2, 3, 4, 5, 6]);

    fn whitelist_of_one() -> Whitelist {
        let mut wl = Whitelist::default();
        wl.addrs.push(PEER).unwrap();
        wl
    }

    #[test]
    fn mode_events_set_advertising_and_clear_idle() {
        let mut state = AdvState::new();
        state.on_event(AdvEvent::Idle);
        for event in [
            AdvEvent::DirectedHighDuty,
            AdvEvent::Directed,
            AdvEvent::Fast,
            AdvEvent::Slow,
            AdvEvent::FastWhitelist,
            AdvEvent::SlowWhitelist,
        ] {
            state.on_event(AdvEvent::Idle);
            assert!(state.on_event(event).is_none());
            assert!(state.is_advertising());
            assert!(!state.is_idle());
        }
    }

    #[test]
    fn requests_clear_advertising() {
        let mut state = AdvState::new();
        state.on_event(AdvEvent::Fast);
        assert_eq!(
            state.on_event(AdvEvent::WhitelistRequest),
            Some(AdvRequest::Whitelist)
        );
        assert!(!state.is_advertising());

        state.on_event(AdvEvent::Fast);
        assert_eq!(
            state.on_event(AdvEvent::PeerAddrRequest),
            Some(AdvRequest::PeerAddress)
        );
        assert!(!state.is_advertising());
    }

    #[test]
    fn connection_ends_advertising() {
        let mut state = AdvState::new();
        state.on_event(AdvEvent::Slow);
        state.on_connected();
        assert!(!state.is_advertising());
        assert!(!state.is_idle());
    }

    #[test]
    fn default_sequence_without_peer_starts_fast() {
        let seq = AdvSequencer::default();
        let plan = seq.resolve(AdvMode::DirectedHighDuty, None, None);
        assert_eq!(plan.mode, AdvMode::Fast);
        assert_eq!(plan.event, AdvEvent::Fast);
        assert_eq!(plan.interval, ADV_FAST_INTERVAL);
        assert_eq!(plan.timeout, ADV_FAST_TIMEOUT);
        assert!(plan.peer.is_none());
    }

    #[test]
    fn bonded_peer_gets_high_duty_directed_first() {
        let seq = AdvSequencer::default();
        assert!(seq.needs_peer_address(AdvMode::DirectedHighDuty));
        let plan = seq.resolve(AdvMode::DirectedHighDuty, Some(&PEER), None);
        assert_eq!(plan.mode, AdvMode::DirectedHighDuty);
        assert_eq!(plan.peer, Some(PEER));

        // Low duty directed is disabled by default.
        let next = seq.next_on_timeout(plan.mode);
        let plan = seq.resolve(next, Some(&PEER), None);
        assert_eq!(plan.mode, AdvMode::Fast);
        assert!(plan.peer.is_none());
    }

    #[test]
    fn timeouts_walk_down_to_idle() {
        let seq = AdvSequencer::default();
        let mut mode = AdvMode::Fast;
        let mut seen = heapless::Vec::<AdvEvent, 4>::new();
        loop {
            let plan = seq.resolve(mode, None, None);
            seen.push(plan.event).unwrap();
            if plan.mode == AdvMode::Idle {
                break;
            }
            mode = seq.next_on_timeout(plan.mode);
        }
        assert_eq!(seen.as_slice(), &[AdvEvent::Fast, AdvEvent::Slow, AdvEvent::Idle]);
    }

    #[test]
    fn whitelist_variant_needs_enabled_and_non_empty_list() {
        let settings = AdvSettings {
            whitelist_enabled: true,
            ..AdvSettings::default()
        };
        let seq = AdvSequencer::new(settings);
        assert!(seq.needs_whitelist(AdvMode::Fast));
        assert!(!seq.needs_whitelist(AdvMode::DirectedHighDuty));

        let empty = Whitelist::default();
        let plan = seq.resolve(AdvMode::Fast, None, Some(&empty));
        assert_eq!(plan.event, AdvEvent::Fast);
        assert!(!plan.filtered);

        let wl = whitelist_of_one();
        let plan = seq.resolve(AdvMode::Slow, None, Some(&wl));
        assert_eq!(plan.event, AdvEvent::SlowWhitelist);
        assert!(plan.filtered);

        let unfiltered = AdvSequencer::default();
        let plan = unfiltered.resolve(AdvMode::Fast, None, Some(&wl));
        assert_eq!(plan.event, AdvEvent::Fast);
    }

    #[test]
    fn everything_disabled_resolves_to_idle() {
        let settings = AdvSettings {
            directed_high_duty_enabled: false,
            fast_enabled: false,
            slow_enabled: false,
            ..AdvSettings::default()
        };
        let plan = AdvSequencer::new(settings).resolve(AdvMode::DirectedHighDuty, Some(&PEER), None);
        assert_eq!(plan.mode, AdvMode::Idle);
        assert_eq!(plan.event, AdvEvent::Idle);
    }
}
