//! The BLE HID device: state, dispatch and control operations.
//!
//! [`BleDevice`] aggregates the per-component state, feeds every event
//! through the matching transition and performs the stack calls those
//! transitions request. The application polls its getters and calls its
//! control operations from the main loop.
//!
//! Blocking operations ([`BleDevice::disconnect`],
//! [`BleDevice::delete_peer_by_id`], [`BleDevice::delete_all_peers`])
//! drive the run step until their completion event was seen, for at most
//! a [`WaitBudget`] of steps. The async target uses the `request_*`
//! halves and awaits the completion with a timeout instead.

use super::advertising::{AdvEvent, AdvMode, AdvRequest, AdvSettings, AdvState};
use super::connection::{BleAddress, ConnAction, ConnHandle, ConnectionState, HciStatus};
use super::peer::{PeerAction, PeerEvent, PeerId, PeerSkip, PeerState};
use super::stack::{BleStack, EventSource, PeerIdList, PeerManager, Whitelist};
use super::BleEvent;
use crate::config::{
    LinkSettings, ADVERTISED_NAME_MAX_LEN, APPEARANCE_HID_KEYBOARD, BLOCKING_WAIT_MAX_STEPS,
    PASSKEY_LEN, PREFERRED_CONN_PARAMS,
};
use crate::error::{check, CallSite, Checked, Error, StatusCode, WaitTarget};
use crate::hid::{HidRouter, ProtocolMode};

/// Called once with the peer's device name after [`BleDevice::request_peer_name`].
pub type NameHandler = fn(&[u8]);

/// Upper bound on run steps a blocking operation may take.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WaitBudget(u32);

impl WaitBudget {
    pub const fn new(steps: u32) -> Self {
        Self(steps)
    }

    pub const fn steps(self) -> u32 {
        self.0
    }
}

impl Default for WaitBudget {
    fn default() -> Self {
        Self(BLOCKING_WAIT_MAX_STEPS)
    }
}

/// Snapshot of every polled flag.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkStatus {
    pub initialized: bool,
    pub connected: bool,
    pub advertising: bool,
    pub idle: bool,
    pub security_started: bool,
    pub security_failed: bool,
    pub name_changed: bool,
    pub handle: ConnHandle,
    pub peer: PeerId,
    pub led_state: u8,
    pub protocol_mode: ProtocolMode,
}

pub struct BleDevice<S: BleStack, P: PeerManager> {
    stack: S,
    peers: P,
    settings: LinkSettings,
    adv_settings: AdvSettings,
    initialized: bool,
    conn: ConnectionState,
    adv: AdvState,
    peer: PeerState,
    hid: HidRouter,
    name_handler: Option<NameHandler>,
}

impl<S: BleStack, P: PeerManager> BleDevice<S, P> {
    pub fn new(stack: S, peers: P, settings: LinkSettings) -> Self {
        Self::with_router(stack, peers, settings, HidRouter::new())
    }

    /// Device whose HID service uses `hid`'s lookup table and report map.
    pub fn with_router(stack: S, peers: P, settings: LinkSettings, hid: HidRouter) -> Self {
        Self {
            stack,
            peers,
            settings,
            adv_settings: AdvSettings::default(),
            initialized: false,
            conn: ConnectionState::new(),
            adv: AdvState::new(),
            peer: PeerState::new(),
            hid,
            name_handler: None,
        }
    }

    /// Apply the link settings to the stack and mark the device ready.
    ///
    /// Sets the GAP device name to the advertised name, the appearance
    /// and the preferred connection parameters, then moves the address
    /// to the selected channel. Name, channel and whitelist flag are
    /// captured here; later changes only take effect on the next init.
    pub fn init(&mut self) -> Result<(), Error> {
        self.adv_settings = AdvSettings {
            whitelist_enabled: self.settings.whitelist(),
            ..AdvSettings::default()
        };

        let name = self.settings.advertised_name();
        check(CallSite::GapDeviceName, self.stack.set_device_name(&name))?;
        check(
            CallSite::GapAppearance,
            self.stack.set_appearance(APPEARANCE_HID_KEYBOARD),
        )?;
        check(
            CallSite::GapConnParams,
            self.stack.set_preferred_conn_params(&PREFERRED_CONN_PARAMS),
        )?;

        self.update_current_channel();
        self.initialized = true;
        info!("BLE initialized as {}", name.as_str());
        Ok(())
    }

    // Accessors

    pub fn stack(&self) -> &S {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut S {
        &mut self.stack
    }

    pub fn peers(&self) -> &P {
        &self.peers
    }

    pub fn peers_mut(&mut self) -> &mut P {
        &mut self.peers
    }

    pub fn hid(&self) -> &HidRouter {
        &self.hid
    }

    pub fn hid_mut(&mut self) -> &mut HidRouter {
        &mut self.hid
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    /// Advertiser configuration captured by [`init`](Self::init).
    pub fn adv_settings(&self) -> &AdvSettings {
        &self.adv_settings
    }

    pub fn connection(&self) -> &ConnectionState {
        &self.conn
    }

    // Dispatch

    /// Feed one event through its transition and perform the resulting
    /// stack calls.
    pub fn dispatch(&mut self, event: BleEvent) -> Result<(), Error> {
        match event {
            BleEvent::Stack(event) => {
                for action in self.conn.on_stack_event(&event) {
                    self.perform(action)?;
                }
                Ok(())
            }
            BleEvent::Adv(event) => self.on_adv_event(event),
            BleEvent::Peer(event) => self.on_peer_event(event),
            BleEvent::Hids(event) => {
                self.hid.on_hids_event(&event);
                Ok(())
            }
        }
    }

    /// One run step: drain pending events, then sleep until the next one.
    pub fn run<E: EventSource + ?Sized>(&mut self, events: &mut E) -> Result<(), Error> {
        loop {
            if let Some(event) = events.next_event() {
                self.dispatch(event)?;
            } else if let Some(event) = self.peers.take_event() {
                self.on_peer_event(event)?;
            } else {
                break;
            }
        }
        self.stack.wait_for_event();
        Ok(())
    }

    fn perform(&mut self, action: ConnAction) -> Result<(), Error> {
        match action {
            ConnAction::AdvertisingEnded => self.adv.on_connected(),
            ConnAction::AssignQueuedWrites(handle) => {
                check(
                    CallSite::QueuedWriteAssign,
                    self.stack.assign_queued_writes(handle),
                )?;
            }
            ConnAction::PhyUpdate { handle, tx, rx } => {
                check(CallSite::PhyUpdate, self.stack.phy_update(handle, tx, rx))?;
            }
            ConnAction::Disconnect { handle, reason } => {
                check(CallSite::Disconnect, self.stack.disconnect(handle, reason))?;
            }
            ConnAction::PeerNameReady => {
                if let Some(handler) = self.name_handler.take() {
                    handler(self.conn.peer_name());
                }
            }
        }
        Ok(())
    }

    /// Advertiser event, answering whitelist and peer address requests.
    pub fn on_adv_event(&mut self, event: AdvEvent) -> Result<(), Error> {
        match self.adv.on_event(event) {
            Some(AdvRequest::Whitelist) => self.reply_whitelist(),
            Some(AdvRequest::PeerAddress) => self.reply_peer_address(),
            None => Ok(()),
        }
    }

    fn reply_whitelist(&mut self) -> Result<(), Error> {
        let whitelist = match self.peers.whitelist_get() {
            Ok(whitelist) => whitelist,
            Err(code) => {
                check(CallSite::WhitelistGet, code)?;
                debug!("no whitelisted peers");
                Whitelist::default()
            }
        };
        debug!(
            "whitelist: {} addresses, {} IRKs",
            whitelist.addrs.len(),
            whitelist.irks.len()
        );

        // Identities without an IRK cannot be resolved by the whitelist.
        self.identities_set(PeerSkip::NO_IRK)?;
        check(CallSite::WhitelistReply, self.stack.whitelist_reply(&whitelist))?;
        Ok(())
    }

    fn reply_peer_address(&mut self) -> Result<(), Error> {
        let current = self.peer.current();
        if !current.is_valid() {
            return Ok(());
        }
        let bonding = match self.peers.bonding_data(current) {
            Ok(bonding) => bonding,
            Err(code) => {
                check(CallSite::BondingDataLoad, code)?;
                debug!("peer {} has no bonding data", current.0);
                return Ok(());
            }
        };

        self.identities_set(PeerSkip::ALL)?;
        check(
            CallSite::PeerAddrReply,
            self.stack.peer_addr_reply(&bonding.identity),
        )?;
        Ok(())
    }

    fn peer_ids(&mut self, skip: PeerSkip) -> Result<PeerIdList, Error> {
        match self.peers.peer_ids(skip) {
            Ok(ids) => Ok(ids),
            Err(code) => {
                check(CallSite::PeerIdList, code)?;
                Ok(PeerIdList::new())
            }
        }
    }

    fn identities_set(&mut self, skip: PeerSkip) -> Result<(), Error> {
        let ids = self.peer_ids(skip)?;
        check(CallSite::IdentitiesSet, self.peers.device_identities_set(&ids))?;
        Ok(())
    }

    fn whitelist_set(&mut self, skip: PeerSkip) -> Result<(), Error> {
        let ids = self.peer_ids(skip)?;
        info!("whitelisting {} peers", ids.len());
        check(CallSite::WhitelistSet, self.peers.whitelist_set(&ids))?;
        Ok(())
    }

    /// Peer manager event.
    pub fn on_peer_event(&mut self, event: PeerEvent) -> Result<(), Error> {
        match self.peer.on_event(&event) {
            Some(PeerAction::LinkSecured(handle)) => {
                if handle != self.conn.handle() {
                    debug!("secured handle {} is not the current link", handle.0);
                }
                self.conn.mark_secured();
                Ok(())
            }
            Some(PeerAction::DropLink(handle)) => {
                if !handle.is_valid() || handle != self.conn.handle() {
                    return Ok(());
                }
                info!("dropping handle {} after security failure", handle.0);
                check(
                    CallSite::SecFailureDisconnect,
                    self.stack.disconnect(handle, HciStatus::RemoteUserTerminated),
                )?;
                Ok(())
            }
            Some(PeerAction::RebuildWhitelist(skip)) => self.whitelist_set(skip),
            None => Ok(()),
        }
    }

    // Advertising control

    /// Start fast advertising. A full connection table is tolerated.
    pub fn start_advertising(&mut self) -> Result<(), Error> {
        match check(
            CallSite::AdvertisingStart,
            self.stack.advertising_start(AdvMode::Fast),
        )? {
            Checked::Success => info!("advertising started"),
            Checked::Tolerated(_) => info!("maximum connection count reached"),
        }
        Ok(())
    }

    /// Rebuild the whitelist from peers with an identity address, then
    /// start advertising.
    pub fn start_whitelist_advertising(&mut self) -> Result<(), Error> {
        self.whitelist_set(PeerSkip::NO_ID_ADDR)?;
        self.start_advertising()
    }

    pub fn stop_advertising(&mut self) -> Result<(), Error> {
        check(CallSite::AdvertisingStop, self.stack.advertising_stop())?;
        Ok(())
    }

    // Blocking operations

    fn wait_until<E: EventSource + ?Sized>(
        &mut self,
        events: &mut E,
        budget: WaitBudget,
        target: WaitTarget,
        done: fn(&Self) -> bool,
    ) -> Result<(), Error> {
        for _ in 0..budget.steps() {
            if done(self) {
                return Ok(());
            }
            self.run(events)?;
        }
        if done(self) {
            Ok(())
        } else {
            warn!("gave up waiting for {}", target);
            Err(Error::Timeout(target))
        }
    }

    /// Ask the stack to drop the link. Returns whether a request was made.
    /// The stack's answer is only logged; the Disconnected event is what
    /// counts.
    pub fn request_disconnect(&mut self) -> bool {
        let handle = self.conn.handle();
        if !self.conn.is_connected() || !handle.is_valid() {
            return false;
        }
        let code = self
            .stack
            .disconnect(handle, HciStatus::RemoteUserTerminated);
        if !code.is_success() {
            debug!("disconnect request returned {}", code);
        }
        true
    }

    /// Disconnect and wait for the Disconnected event.
    pub fn disconnect<E: EventSource + ?Sized>(
        &mut self,
        events: &mut E,
        budget: WaitBudget,
    ) -> Result<(), Error> {
        if !self.request_disconnect() {
            return Ok(());
        }
        self.wait_until(events, budget, WaitTarget::Disconnected, |d| {
            !d.conn.is_connected()
        })
    }

    /// Start deleting one peer. Returns whether a request was made.
    pub fn request_peer_delete(&mut self, peer: PeerId) -> Result<bool, Error> {
        if !peer.is_valid() {
            return Ok(false);
        }
        info!("deleting peer {}", peer.0);
        self.peer.begin_peer_delete();
        check(CallSite::PeerDelete, self.peers.peer_delete(peer))?;
        Ok(true)
    }

    /// Delete one peer and wait for completion. An invalid id is a no-op.
    pub fn delete_peer_by_id<E: EventSource + ?Sized>(
        &mut self,
        peer: PeerId,
        events: &mut E,
        budget: WaitBudget,
    ) -> Result<(), Error> {
        if !self.request_peer_delete(peer)? {
            return Ok(());
        }
        self.wait_until(events, budget, WaitTarget::PeerDeleted, |d| {
            d.peer.peer_deleted()
        })
    }

    /// Start deleting all peers.
    pub fn request_all_peers_delete(&mut self) -> Result<(), Error> {
        info!("deleting all peers");
        self.peer.begin_peers_delete();
        check(CallSite::PeersDelete, self.peers.peers_delete())?;
        Ok(())
    }

    /// Delete all peers and wait for completion.
    pub fn delete_all_peers<E: EventSource + ?Sized>(
        &mut self,
        events: &mut E,
        budget: WaitBudget,
    ) -> Result<(), Error> {
        self.request_all_peers_delete()?;
        self.wait_until(events, budget, WaitTarget::AllPeersDeleted, |d| {
            d.peer.all_peers_deleted()
        })
    }

    // Peers and link

    /// Walk bonded peers: pass [`PeerId::INVALID`] to get the first one.
    pub fn next_peer_id(&self, after: PeerId) -> PeerId {
        self.peers.next_peer_id(after)
    }

    /// Read the connected peer's device name. `handler` runs once when
    /// the name arrives and replaces any handler still pending.
    pub fn request_peer_name(&mut self, handler: NameHandler) -> bool {
        let handle = self.conn.handle();
        if !handle.is_valid() {
            debug!("peer name requested without a link");
            return false;
        }
        self.name_handler = Some(handler);
        let code = self.stack.read_peer_device_name(handle);
        if !code.is_success() {
            warn!("peer name read failed: {}", code);
        }
        code.is_success()
    }

    /// Answer a pending passkey request.
    pub fn send_passkey(&mut self, passkey: &[u8; PASSKEY_LEN]) -> Result<(), Error> {
        check(
            CallSite::AuthKeyReply,
            self.stack.auth_key_reply(self.conn.handle(), passkey),
        )?;
        Ok(())
    }

    /// Send an input report, see [`HidRouter::send_report`]. Without a
    /// link nothing is sent and `Ok(false)` is returned.
    pub fn send_report(&mut self, report_id: u8, payload: &[u8]) -> Result<bool, Error> {
        let handle = self.conn.handle();
        if !handle.is_valid() {
            return Ok(false);
        }
        self.hid.send_report(&mut self.stack, handle, report_id, payload)
    }

    /// Push the battery level. No-op while not connected.
    pub fn battery_level_update(&mut self, level: u8) -> Result<(), Error> {
        if !self.conn.is_connected() {
            return Ok(());
        }
        check(
            CallSite::BatteryLevelUpdate,
            self.stack.battery_level_update(self.conn.handle(), level),
        )?;
        Ok(())
    }

    pub fn address(&mut self) -> Option<BleAddress> {
        match self.stack.address() {
            Ok(address) => Some(address),
            Err(code) => {
                warn!("address read failed: {}", code);
                None
            }
        }
    }

    pub fn set_address(&mut self, address: &BleAddress) -> bool {
        let code: StatusCode = self.stack.set_address(address);
        if !code.is_success() {
            warn!("address update failed: {}", code);
        }
        code.is_success()
    }

    /// Encode the channel in the first address byte so each channel shows
    /// up as a distinct device. Returns whether the address changed.
    pub fn update_current_channel(&mut self) -> bool {
        let Some(channel) = self.settings.channel() else {
            return false;
        };
        let Some(mut address) = self.address() else {
            return false;
        };
        if address.bytes[0] == channel {
            return false;
        }
        let previous = address.bytes[0];
        address.bytes[0] = channel;
        let changed = self.set_address(&address);
        if changed {
            debug!("channel {} -> {}", previous, channel);
        }
        changed
    }

    // Settings

    pub fn set_device_name(&mut self, name: &str) {
        self.settings.set_device_name(name);
    }

    pub fn set_channel(&mut self, channel: u8) {
        self.settings.set_channel(channel);
    }

    pub fn set_whitelist(&mut self, active: bool) {
        self.settings.set_whitelist(active);
    }

    pub fn advertised_name(&self) -> heapless::String<ADVERTISED_NAME_MAX_LEN> {
        self.settings.advertised_name()
    }

    // Polled state

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    pub fn is_advertising(&self) -> bool {
        self.adv.is_advertising()
    }

    pub fn is_idle(&self) -> bool {
        self.adv.is_idle()
    }

    pub fn security_started(&self) -> bool {
        self.peer.security_started()
    }

    pub fn clear_security_started(&mut self) {
        self.peer.clear_security_started();
    }

    pub fn security_failed(&self) -> bool {
        self.peer.security_failed()
    }

    pub fn clear_security_failed(&mut self) {
        self.peer.clear_security_failed();
    }

    /// Set once the peer store confirmed the last single-peer delete.
    pub fn peer_deleted(&self) -> bool {
        self.peer.peer_deleted()
    }

    pub fn all_peers_deleted(&self) -> bool {
        self.peer.all_peers_deleted()
    }

    pub fn name_changed(&self) -> bool {
        self.conn.name_changed()
    }

    pub fn set_name_changed(&mut self, changed: bool) {
        self.conn.set_name_changed(changed);
    }

    pub fn peer_name(&self) -> &[u8] {
        self.conn.peer_name()
    }

    pub fn peer_address(&self) -> &BleAddress {
        self.conn.peer_address()
    }

    pub fn current_peer(&self) -> PeerId {
        self.peer.current()
    }

    pub fn conn_handle(&self) -> ConnHandle {
        self.conn.handle()
    }

    pub fn led_state(&self) -> u8 {
        self.hid.led_state()
    }

    pub fn protocol_mode(&self) -> ProtocolMode {
        self.hid.protocol_mode()
    }

    pub fn status(&self) -> LinkStatus {
        LinkStatus {
            initialized: self.initialized,
            connected: self.conn.is_connected(),
            advertising: self.adv.is_advertising(),
            idle: self.adv.is_idle(),
            security_started: self.peer.security_started(),
            security_failed: self.peer.security_failed(),
            name_changed: self.conn.name_changed(),
            handle: self.conn.handle(),
            peer: self.peer.current(),
            led_state: self.hid.led_state(),
            protocol_mode: self.hid.protocol_mode(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::bond::{BondTable, EncryptionKey, MasterId, NewBond};
    use crate::ble::connection::{AddressKind, StackEvent};
    use crate::ble::peer::PeerDataId;
    use crate::ble::stack::Irk;
    use crate::ble::testing::{FakeStack, ScriptedEvents, StackCall};
    use core::sync::atomic::{AtomicUsize, Ordering};

    const HANDLE: ConnHandle = ConnHandle(5);
    const CENTRAL: BleAddress =
        BleAddress::new(AddressKind::Public, [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

    type Device = BleDevice<FakeStack, BondTable>;

    fn device() -> Device {
        let mut device = BleDevice::new(FakeStack::new(), BondTable::new(), LinkSettings::default());
        device.init().unwrap();
        device
    }

    fn bond(device: &mut Device, seed: u8) -> PeerId {
        device.peers_mut().bond(NewBond {
            identity: Some(BleAddress::new(AddressKind::RandomStatic, [seed, 2, 3, 4, 5, 0xC0])),
            irk: Some(Irk([seed; 16])),
            car: true,
            master: MasterId {
                ediv: u16::from(seed),
                rand: [seed; 8],
            },
            key: EncryptionKey::default(),
        })
    }

    fn connect(device: &mut Device) {
        device
            .dispatch(
                StackEvent::Connected {
                    handle: HANDLE,
                    peer: CENTRAL,
                }
                .into(),
            )
            .unwrap();
    }

    fn secure(device: &mut Device, peer: PeerId) {
        device
            .dispatch(PeerEvent::ConnSecSucceeded { handle: HANDLE, peer }.into())
            .unwrap();
    }

    // ════════════════════════════════════════════════════════════════
    // Init and channel
    // ════════════════════════════════════════════════════════════════

    #[test]
    fn init_without_channel_keeps_address() {
        let device = device();
        assert!(device.is_initialized());
        assert!(device.stack().calls.is_empty());
        assert!(!device.adv_settings().whitelist_enabled);
    }

    #[test]
    fn init_applies_channel_and_whitelist_flag() {
        let mut settings = LinkSettings::default();
        settings.set_channel(2);
        settings.set_whitelist(true);
        let mut device = BleDevice::new(FakeStack::new(), BondTable::new(), settings);
        device.init().unwrap();

        assert!(device.adv_settings().whitelist_enabled);
        assert_eq!(device.stack().address.bytes[0], 2);
        assert_eq!(device.advertised_name().as_str(), "hidlink - 3");

        // Changing the flag later does not touch the captured settings.
        device.set_whitelist(false);
        assert!(device.adv_settings().whitelist_enabled);
    }

    #[test]
    fn init_sets_gap_name_appearance_and_conn_params() {
        let mut settings = LinkSettings::default();
        settings.set_device_name("Keeb");
        settings.set_channel(0);
        let mut device = BleDevice::new(FakeStack::new(), BondTable::new(), settings);
        device.init().unwrap();

        assert_eq!(device.stack().device_name.as_str(), "Keeb - 1");
        assert_eq!(device.stack().appearance, APPEARANCE_HID_KEYBOARD);
        assert_eq!(device.stack().conn_params, Some(PREFERRED_CONN_PARAMS));
    }

    #[test]
    fn rejected_gap_setup_fails_init() {
        let mut stack = FakeStack::new();
        stack.gap_status = StatusCode::INVALID_LENGTH;
        let mut device = BleDevice::new(stack, BondTable::new(), LinkSettings::default());

        assert_eq!(
            device.init(),
            Err(Error::Fatal {
                site: CallSite::GapDeviceName,
                code: StatusCode::INVALID_LENGTH
            })
        );
        assert!(!device.is_initialized());
    }

    #[test]
    fn channel_update_is_skipped_when_unchanged() {
        let mut device = device();
        device.set_channel(0);
        assert!(!device.update_current_channel());
        device.set_channel(1);
        assert!(device.update_current_channel());
        assert!(!device.update_current_channel());
        assert_eq!(device.stack().count(|c| matches!(c, StackCall::SetAddress(_))), 1);
    }

    #[test]
    fn channel_update_reports_address_failure() {
        let mut device = device();
        device.stack_mut().set_address_status = StatusCode::INVALID_PARAM;
        device.set_channel(3);
        assert!(!device.update_current_channel());
        assert_eq!(device.stack().address, FakeStack::DEFAULT_ADDRESS);
    }

    // ════════════════════════════════════════════════════════════════
    // Connection lifecycle
    // ════════════════════════════════════════════════════════════════

    #[test]
    fn connected_only_after_link_is_secured() {
        let mut device = device();
        device.on_adv_event(AdvEvent::Fast).unwrap();
        connect(&mut device);

        assert!(!device.is_connected());
        assert!(!device.is_advertising());
        assert_eq!(device.conn_handle(), HANDLE);
        assert_eq!(
            device.stack().last(),
            Some(&StackCall::AssignQueuedWrites(HANDLE))
        );

        let peer = bond(&mut device, 1);
        secure(&mut device, peer);
        assert!(device.is_connected());
        assert_eq!(device.current_peer(), peer);
    }

    #[test]
    fn gatt_timeout_requests_disconnect() {
        let mut device = device();
        connect(&mut device);
        device
            .dispatch(StackEvent::GattServerTimeout { handle: HANDLE }.into())
            .unwrap();
        assert_eq!(
            device.stack().last(),
            Some(&StackCall::Disconnect(HANDLE, HciStatus::RemoteUserTerminated))
        );
        assert_eq!(device.conn_handle(), HANDLE);
    }

    #[test]
    fn failed_queued_write_assignment_is_fatal() {
        let mut device = device();
        device.stack_mut().queued_writes_status = StatusCode::INTERNAL;
        let err = device
            .dispatch(
                StackEvent::Connected {
                    handle: HANDLE,
                    peer: CENTRAL,
                }
                .into(),
            )
            .unwrap_err();
        assert_eq!(
            err,
            Error::Fatal {
                site: CallSite::QueuedWriteAssign,
                code: StatusCode::INTERNAL
            }
        );
    }

    #[test]
    fn blocking_disconnect_waits_for_event() {
        let mut device = device();
        connect(&mut device);
        let peer = bond(&mut device, 1);
        secure(&mut device, peer);

        let mut events = ScriptedEvents::new();
        events.push(StackEvent::Disconnected {
            handle: HANDLE,
            reason: HciStatus::LocalHostTerminated as u8,
        });
        device.disconnect(&mut events, WaitBudget::new(4)).unwrap();

        assert!(!device.is_connected());
        assert!(!device.conn_handle().is_valid());
        assert_eq!(device.current_peer(), peer);
    }

    #[test]
    fn blocking_disconnect_times_out() {
        let mut device = device();
        connect(&mut device);
        let peer = bond(&mut device, 1);
        secure(&mut device, peer);

        let mut events = ScriptedEvents::new();
        assert_eq!(
            device.disconnect(&mut events, WaitBudget::new(3)),
            Err(Error::Timeout(WaitTarget::Disconnected))
        );
        assert_eq!(device.stack().waits, 3);
    }

    #[test]
    fn disconnect_without_link_is_noop() {
        let mut device = device();
        let mut events = ScriptedEvents::new();
        device.disconnect(&mut events, WaitBudget::new(1)).unwrap();
        assert!(device.stack().calls.is_empty());
    }

    // ════════════════════════════════════════════════════════════════
    // Peers
    // ════════════════════════════════════════════════════════════════

    #[test]
    fn delete_peer_waits_for_store_completion() {
        let mut device = device();
        let first = bond(&mut device, 1);
        let second = bond(&mut device, 2);
        secure(&mut device, first);

        let mut events = ScriptedEvents::new();
        device
            .delete_peer_by_id(first, &mut events, WaitBudget::default())
            .unwrap();
        assert_eq!(device.current_peer(), PeerId::INVALID);
        assert_eq!(device.next_peer_id(PeerId::INVALID), second);
    }

    #[test]
    fn delete_invalid_peer_is_noop() {
        let mut device = device();
        bond(&mut device, 1);
        let mut events = ScriptedEvents::new();
        device
            .delete_peer_by_id(PeerId::INVALID, &mut events, WaitBudget::new(1))
            .unwrap();
        assert_eq!(device.peers().len(), 1);
    }

    #[test]
    fn delete_unknown_peer_is_fatal() {
        let mut device = device();
        let mut events = ScriptedEvents::new();
        let err = device
            .delete_peer_by_id(PeerId(3), &mut events, WaitBudget::new(1))
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn delete_all_peers_empties_store() {
        let mut device = device();
        bond(&mut device, 1);
        bond(&mut device, 2);

        let mut events = ScriptedEvents::new();
        device
            .delete_all_peers(&mut events, WaitBudget::default())
            .unwrap();
        assert!(device.peers().is_empty());
        assert_eq!(device.next_peer_id(PeerId::INVALID), PeerId::INVALID);
    }

    #[test]
    fn new_bond_rebuilds_whitelist() {
        let mut device = device();
        let peer = bond(&mut device, 1);
        let mut events = ScriptedEvents::new();
        device.run(&mut events).unwrap();
        assert_eq!(device.peers().whitelisted(), &[peer]);
    }

    #[test]
    fn security_failure_drops_the_current_link() {
        let mut device = device();
        connect(&mut device);
        let failed = |handle| PeerEvent::ConnSecFailed {
            handle,
            peer: PeerId::INVALID,
        };

        device.dispatch(failed(ConnHandle(9)).into()).unwrap();
        assert_eq!(device.stack().count(|c| matches!(c, StackCall::Disconnect(..))), 0);

        device.dispatch(failed(HANDLE).into()).unwrap();
        assert_eq!(
            device.stack().last(),
            Some(&StackCall::Disconnect(HANDLE, HciStatus::RemoteUserTerminated))
        );

        // The link may already be going down.
        device.stack_mut().disconnect_status = StatusCode::BLE_INVALID_CONN_HANDLE;
        device.dispatch(failed(HANDLE).into()).unwrap();
    }

    #[test]
    fn security_flags_are_cleared_by_caller() {
        let mut device = device();
        device
            .dispatch(
                PeerEvent::ConnSecFailed {
                    handle: HANDLE,
                    peer: PeerId(0),
                }
                .into(),
            )
            .unwrap();
        assert!(device.security_failed());
        assert!(device.status().security_failed);
        device.clear_security_failed();
        assert!(!device.security_failed());
    }

    // ════════════════════════════════════════════════════════════════
    // Advertiser requests
    // ════════════════════════════════════════════════════════════════

    #[test]
    fn whitelist_request_without_bonds_replies_empty() {
        let mut device = device();
        device.on_adv_event(AdvEvent::WhitelistRequest).unwrap();
        assert_eq!(
            device.stack().last(),
            Some(&StackCall::WhitelistReply { addrs: 0, irks: 0 })
        );
    }

    #[test]
    fn whitelist_request_replies_with_bonded_peers() {
        let mut device = device();
        let peer = bond(&mut device, 1);
        device.start_whitelist_advertising().unwrap();
        device.on_adv_event(AdvEvent::WhitelistRequest).unwrap();

        assert_eq!(device.peers().device_identities(), &[peer]);
        assert_eq!(
            device.stack().last(),
            Some(&StackCall::WhitelistReply { addrs: 1, irks: 1 })
        );
    }

    #[test]
    fn peer_address_request_needs_current_peer() {
        let mut device = device();
        bond(&mut device, 1);
        device.on_adv_event(AdvEvent::PeerAddrRequest).unwrap();
        assert!(device.stack().calls.is_empty());
    }

    #[test]
    fn peer_address_request_replies_with_identity() {
        let mut device = device();
        let peer = bond(&mut device, 9);
        secure(&mut device, peer);
        device.on_adv_event(AdvEvent::PeerAddrRequest).unwrap();

        let identity = device.peers().get(peer).unwrap().identity.unwrap();
        assert_eq!(device.stack().last(), Some(&StackCall::PeerAddrReply(identity)));
        assert!(!device.is_advertising());
    }

    #[test]
    fn advertising_start_tolerates_full_connection_table() {
        let mut device = device();
        device.stack_mut().adv_start_status = StatusCode::CONN_COUNT;
        device.start_advertising().unwrap();
        device.stack_mut().adv_start_status = StatusCode::BUSY;
        assert!(device.start_advertising().is_err());
    }

    #[test]
    fn advertising_stop_tolerates_inactive_advertiser() {
        let mut device = device();
        device.stack_mut().adv_stop_status = StatusCode::INVALID_STATE;
        device.stop_advertising().unwrap();
        device.stack_mut().adv_stop_status = StatusCode::INTERNAL;
        assert!(device.stop_advertising().is_err());
    }

    // ════════════════════════════════════════════════════════════════
    // Link services
    // ════════════════════════════════════════════════════════════════

    #[test]
    fn report_without_link_is_not_sent() {
        let mut device = device();
        assert_eq!(device.send_report(1, &[0; 8]), Ok(false));
        assert!(device.stack().calls.is_empty());
    }

    #[test]
    fn battery_update_requires_connection() {
        let mut device = device();
        device.battery_level_update(80).unwrap();
        assert!(device.stack().calls.is_empty());

        connect(&mut device);
        let peer = bond(&mut device, 1);
        secure(&mut device, peer);
        device.battery_level_update(80).unwrap();
        assert_eq!(device.stack().last(), Some(&StackCall::BatteryLevel(HANDLE, 80)));
    }

    #[test]
    fn passkey_reply_failure_is_fatal() {
        let mut device = device();
        connect(&mut device);
        device.send_passkey(b"123456").unwrap();
        device.stack_mut().auth_key_status = StatusCode::INVALID_STATE;
        assert!(device.send_passkey(b"123456").unwrap_err().is_fatal());
    }

    static NAME_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn on_name(name: &[u8]) {
        assert_eq!(name, b"Laptop");
        NAME_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn peer_name_handler_runs_once() {
        let mut device = device();
        connect(&mut device);
        assert!(device.request_peer_name(on_name));
        assert_eq!(device.stack().last(), Some(&StackCall::ReadPeerName(HANDLE)));

        let mut name = heapless::Vec::new();
        name.extend_from_slice(b"Laptop").unwrap();
        let response = StackEvent::NameReadResponse {
            handle: HANDLE,
            value: Some(name),
        };
        device.dispatch(response.clone().into()).unwrap();
        device.dispatch(response.into()).unwrap();

        assert_eq!(NAME_CALLS.load(Ordering::SeqCst), 1);
        assert!(device.name_changed());
        assert_eq!(device.peer_name(), b"Laptop");
    }

    static STALE_NAME_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn on_stale_name(_name: &[u8]) {
        STALE_NAME_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn peer_name_request_without_link_arms_nothing() {
        let mut device = device();
        assert!(!device.request_peer_name(on_stale_name));
        assert!(device.stack().calls.is_empty());

        connect(&mut device);
        let mut name = heapless::Vec::new();
        name.extend_from_slice(b"Phone").unwrap();
        device
            .dispatch(
                StackEvent::NameReadResponse {
                    handle: HANDLE,
                    value: Some(name),
                }
                .into(),
            )
            .unwrap();

        assert_eq!(STALE_NAME_CALLS.load(Ordering::SeqCst), 0);
        assert_eq!(device.peer_name(), b"Phone");
    }

    #[test]
    fn bonding_update_without_flash_change_is_ignored() {
        let mut device = device();
        device
            .dispatch(
                PeerEvent::PeerDataUpdateSucceeded {
                    peer: PeerId(0),
                    data: PeerDataId::Bonding,
                    flash_changed: false,
                }
                .into(),
            )
            .unwrap();
        assert!(device.peers().whitelisted().is_empty());
    }
}
