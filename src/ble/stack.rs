//! Seams to the BLE stack and the peer store.
//!
//! Every call returns the raw [`StatusCode`] of the underlying operation;
//! classification into tolerated and fatal codes happens in the caller
//! through [`crate::error::check`].

use heapless::Vec;

use super::advertising::AdvMode;
use super::connection::{BleAddress, ConnHandle, HciStatus, Phy};
use super::peer::{PeerEvent, PeerId, PeerSkip};
use super::BleEvent;
use crate::config::{ConnParams, MAX_PEERS, PASSKEY_LEN, WHITELIST_MAX_COUNT};
use crate::error::StatusCode;
use crate::hid::InputSlot;

/// Identity resolving key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Irk(pub [u8; 16]);

/// Addresses and IRKs handed to the stack for whitelist filtering.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Whitelist {
    pub addrs: Vec<BleAddress, WHITELIST_MAX_COUNT>,
    pub irks: Vec<Irk, WHITELIST_MAX_COUNT>,
}

impl Whitelist {
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty() && self.irks.is_empty()
    }
}

/// Identity part of a peer's bonding data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BondingData {
    pub identity: BleAddress,
    pub irk: Option<Irk>,
}

pub type PeerIdList = Vec<PeerId, MAX_PEERS>;

/// The BLE protocol stack.
pub trait BleStack {
    /// GAP Device Name characteristic value.
    fn set_device_name(&mut self, name: &str) -> StatusCode;

    fn set_appearance(&mut self, appearance: u16) -> StatusCode;

    /// Peripheral Preferred Connection Parameters.
    fn set_preferred_conn_params(&mut self, params: &ConnParams) -> StatusCode;

    fn disconnect(&mut self, handle: ConnHandle, reason: HciStatus) -> StatusCode;

    fn phy_update(&mut self, handle: ConnHandle, tx: Phy, rx: Phy) -> StatusCode;

    /// Bind the queued-write context to a new connection.
    fn assign_queued_writes(&mut self, handle: ConnHandle) -> StatusCode;

    fn auth_key_reply(&mut self, handle: ConnHandle, passkey: &[u8; PASSKEY_LEN]) -> StatusCode;

    fn address(&mut self) -> Result<BleAddress, StatusCode>;

    fn set_address(&mut self, address: &BleAddress) -> StatusCode;

    fn advertising_start(&mut self, mode: AdvMode) -> StatusCode;

    fn advertising_stop(&mut self) -> StatusCode;

    fn whitelist_reply(&mut self, whitelist: &Whitelist) -> StatusCode;

    fn peer_addr_reply(&mut self, address: &BleAddress) -> StatusCode;

    /// Read the peer's GAP Device Name characteristic by UUID.
    fn read_peer_device_name(&mut self, handle: ConnHandle) -> StatusCode;

    fn hid_input_report_send(
        &mut self,
        handle: ConnHandle,
        slot: InputSlot,
        data: &[u8],
    ) -> StatusCode;

    fn hid_boot_keyboard_send(&mut self, handle: ConnHandle, data: &[u8]) -> StatusCode;

    fn battery_level_update(&mut self, handle: ConnHandle, level: u8) -> StatusCode;

    /// Sleep until the next stack event. Part of the run step.
    fn wait_for_event(&mut self) {}
}

/// Flash-backed bond storage.
pub trait PeerManager {
    /// Peers in [`next_peer_id`](Self::next_peer_id) order, filtered by `skip`.
    fn peer_ids(&mut self, skip: PeerSkip) -> Result<PeerIdList, StatusCode>;

    /// Peer following `after`, or the first peer for [`PeerId::INVALID`].
    /// Returns [`PeerId::INVALID`] past the last peer.
    fn next_peer_id(&self, after: PeerId) -> PeerId;

    fn whitelist_set(&mut self, peers: &[PeerId]) -> StatusCode;

    fn whitelist_get(&self) -> Result<Whitelist, StatusCode>;

    fn device_identities_set(&mut self, peers: &[PeerId]) -> StatusCode;

    fn bonding_data(&self, peer: PeerId) -> Result<BondingData, StatusCode>;

    /// Start deleting one peer. Completion arrives as
    /// [`PeerEvent::PeerDeleteSucceeded`].
    fn peer_delete(&mut self, peer: PeerId) -> StatusCode;

    /// Start deleting all peers. Completion arrives as
    /// [`PeerEvent::PeersDeleteSucceeded`].
    fn peers_delete(&mut self) -> StatusCode;

    /// Completion events produced by the store itself, drained by the run step.
    fn take_event(&mut self) -> Option<PeerEvent> {
        None
    }
}

/// Pending events for the run step.
pub trait EventSource {
    fn next_event(&mut self) -> Option<BleEvent>;
}
