//! Host-side doubles for the stack seams.
//!
//! [`FakeStack`] records every call and answers with programmable status
//! codes. GAP setup values are stored instead of logged so the call log
//! starts empty after init. [`ScriptedEvents`] replays a fixed event
//! sequence. Together with
//! a [`BondTable`](super::BondTable) as peer manager they drive a
//! [`BleDevice`](super::BleDevice) without hardware.

use heapless::{Deque, String, Vec};

use super::advertising::AdvMode;
use super::connection::{AddressKind, BleAddress, ConnHandle, HciStatus, Phy};
use super::stack::{BleStack, EventSource, Whitelist};
use super::BleEvent;
use crate::config::{ConnParams, ADVERTISED_NAME_MAX_LEN, PASSKEY_LEN};
use crate::error::StatusCode;
use crate::hid::InputSlot;

const CALL_LOG_LEN: usize = 64;
const SCRIPT_LEN: usize = 16;

/// One recorded stack call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackCall {
    Disconnect(ConnHandle, HciStatus),
    PhyUpdate(ConnHandle, Phy, Phy),
    AssignQueuedWrites(ConnHandle),
    AuthKeyReply(ConnHandle, [u8; PASSKEY_LEN]),
    SetAddress(BleAddress),
    AdvertisingStart(AdvMode),
    AdvertisingStop,
    WhitelistReply { addrs: usize, irks: usize },
    PeerAddrReply(BleAddress),
    ReadPeerName(ConnHandle),
    InputReport { handle: ConnHandle, slot: InputSlot, len: usize },
    BootKeyboard { handle: ConnHandle, len: usize },
    BatteryLevel(ConnHandle, u8),
}

/// Recording stack. Every call succeeds unless its status field says
/// otherwise.
#[derive(Clone, Debug)]
pub struct FakeStack {
    pub calls: Vec<StackCall, CALL_LOG_LEN>,
    /// Calls beyond the log capacity.
    pub dropped: usize,
    pub waits: u32,

    pub address: BleAddress,
    pub address_status: StatusCode,

    pub device_name: String<ADVERTISED_NAME_MAX_LEN>,
    pub appearance: u16,
    pub conn_params: Option<ConnParams>,
    pub gap_status: StatusCode,

    pub disconnect_status: StatusCode,
    pub phy_status: StatusCode,
    pub queued_writes_status: StatusCode,
    pub auth_key_status: StatusCode,
    pub set_address_status: StatusCode,
    pub adv_start_status: StatusCode,
    pub adv_stop_status: StatusCode,
    pub whitelist_reply_status: StatusCode,
    pub peer_addr_reply_status: StatusCode,
    pub name_read_status: StatusCode,
    pub report_status: StatusCode,
    pub battery_status: StatusCode,
}

impl Default for FakeStack {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeStack {
    /// Local address the fake reports until changed.
    pub const DEFAULT_ADDRESS: BleAddress =
        BleAddress::new(AddressKind::RandomStatic, [0x00, 0x11, 0x22, 0x33, 0x44, 0xC5]);

    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            dropped: 0,
            waits: 0,
            address: Self::DEFAULT_ADDRESS,
            address_status: StatusCode::SUCCESS,
            device_name: String::new(),
            appearance: 0,
            conn_params: None,
            gap_status: StatusCode::SUCCESS,
            disconnect_status: StatusCode::SUCCESS,
            phy_status: StatusCode::SUCCESS,
            queued_writes_status: StatusCode::SUCCESS,
            auth_key_status: StatusCode::SUCCESS,
            set_address_status: StatusCode::SUCCESS,
            adv_start_status: StatusCode::SUCCESS,
            adv_stop_status: StatusCode::SUCCESS,
            whitelist_reply_status: StatusCode::SUCCESS,
            peer_addr_reply_status: StatusCode::SUCCESS,
            name_read_status: StatusCode::SUCCESS,
            report_status: StatusCode::SUCCESS,
            battery_status: StatusCode::SUCCESS,
        }
    }

    fn record(&mut self, call: StackCall, status: StatusCode) -> StatusCode {
        if self.calls.push(call).is_err() {
            self.dropped += 1;
        }
        status
    }

    /// Number of recorded calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&StackCall) -> bool) -> usize {
        self.calls.iter().filter(|call| pred(call)).count()
    }

    pub fn last(&self) -> Option<&StackCall> {
        self.calls.last()
    }

    pub fn clear(&mut self) {
        self.calls.clear();
        self.dropped = 0;
    }
}

impl BleStack for FakeStack {
    fn set_device_name(&mut self, name: &str) -> StatusCode {
        if self.gap_status.is_success() {
            self.device_name.clear();
            let _ = self.device_name.push_str(name);
        }
        self.gap_status
    }

    fn set_appearance(&mut self, appearance: u16) -> StatusCode {
        if self.gap_status.is_success() {
            self.appearance = appearance;
        }
        self.gap_status
    }

    fn set_preferred_conn_params(&mut self, params: &ConnParams) -> StatusCode {
        if self.gap_status.is_success() {
            self.conn_params = Some(*params);
        }
        self.gap_status
    }

    fn disconnect(&mut self, handle: ConnHandle, reason: HciStatus) -> StatusCode {
        self.record(StackCall::Disconnect(handle, reason), self.disconnect_status)
    }

    fn phy_update(&mut self, handle: ConnHandle, tx: Phy, rx: Phy) -> StatusCode {
        self.record(StackCall::PhyUpdate(handle, tx, rx), self.phy_status)
    }

    fn assign_queued_writes(&mut self, handle: ConnHandle) -> StatusCode {
        self.record(StackCall::AssignQueuedWrites(handle), self.queued_writes_status)
    }

    fn auth_key_reply(&mut self, handle: ConnHandle, passkey: &[u8; PASSKEY_LEN]) -> StatusCode {
        self.record(StackCall::AuthKeyReply(handle, *passkey), self.auth_key_status)
    }

    fn address(&mut self) -> Result<BleAddress, StatusCode> {
        if self.address_status.is_success() {
            Ok(self.address)
        } else {
            Err(self.address_status)
        }
    }

    fn set_address(&mut self, address: &BleAddress) -> StatusCode {
        let status = self.record(StackCall::SetAddress(*address), self.set_address_status);
        if status.is_success() {
            self.address = *address;
        }
        status
    }

    fn advertising_start(&mut self, mode: AdvMode) -> StatusCode {
        self.record(StackCall::AdvertisingStart(mode), self.adv_start_status)
    }

    fn advertising_stop(&mut self) -> StatusCode {
        self.record(StackCall::AdvertisingStop, self.adv_stop_status)
    }

    fn whitelist_reply(&mut self, whitelist: &Whitelist) -> StatusCode {
        let call = StackCall::WhitelistReply {
            addrs: whitelist.addrs.len(),
            irks: whitelist.irks.len(),
        };
        self.record(call, self.whitelist_reply_status)
    }

    fn peer_addr_reply(&mut self, address: &BleAddress) -> StatusCode {
        self.record(StackCall::PeerAddrReply(*address), self.peer_addr_reply_status)
    }

    fn read_peer_device_name(&mut self, handle: ConnHandle) -> StatusCode {
        self.record(StackCall::ReadPeerName(handle), self.name_read_status)
    }

    fn hid_input_report_send(
        &mut self,
        handle: ConnHandle,
        slot: InputSlot,
        data: &[u8],
    ) -> StatusCode {
        let call = StackCall::InputReport {
            handle,
            slot,
            len: data.len(),
        };
        self.record(call, self.report_status)
    }

    fn hid_boot_keyboard_send(&mut self, handle: ConnHandle, data: &[u8]) -> StatusCode {
        let call = StackCall::BootKeyboard {
            handle,
            len: data.len(),
        };
        self.record(call, self.report_status)
    }

    fn battery_level_update(&mut self, handle: ConnHandle, level: u8) -> StatusCode {
        self.record(StackCall::BatteryLevel(handle, level), self.battery_status)
    }

    fn wait_for_event(&mut self) {
        self.waits += 1;
    }
}

/// Fixed event script, drained front to back.
#[derive(Clone, Debug, Default)]
pub struct ScriptedEvents {
    queue: Deque<BleEvent, SCRIPT_LEN>,
}

impl ScriptedEvents {
    pub const fn new() -> Self {
        Self {
            queue: Deque::new(),
        }
    }

    /// Append an event. Returns `false` when the script is full.
    pub fn push(&mut self, event: impl Into<BleEvent>) -> bool {
        self.queue.push_back(event.into()).is_ok()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl EventSource for ScriptedEvents {
    fn next_event(&mut self) -> Option<BleEvent> {
        self.queue.pop_front()
    }
}
