//! [`BleStack`] on top of `nrf-softdevice`.
//!
//! Plain GAP calls go straight to the SoftDevice. Advertising is driven
//! by the async advertiser task, so `advertising_start`/`stop` only post
//! an [`AdvCommand`] and the whitelist/peer address replies are kept here
//! until the advertiser picks them up.

use defmt::{debug, warn};
use heapless::Vec;
use nrf_softdevice::ble::gatt_server::{self, NotifyValueError};
use nrf_softdevice::ble::security::PasskeyReply;
use nrf_softdevice::ble::{Address, AddressType, Connection};
use nrf_softdevice::raw;

use super::gatt::Server;
use super::{AdvCommand, ADV_CONTROL};
use crate::ble::advertising::AdvMode;
use crate::ble::connection::{AddressKind, BleAddress, ConnHandle, HciStatus, Phy};
use crate::ble::stack::{BleStack, Whitelist};
use crate::config::{ConnParams, PASSKEY_LEN, WHITELIST_MAX_COUNT};
use crate::error::StatusCode;
use crate::hid::InputSlot;

pub fn to_sd_address(address: &BleAddress) -> Address {
    let kind = match address.kind {
        AddressKind::Public => AddressType::Public,
        AddressKind::RandomStatic => AddressType::RandomStatic,
        AddressKind::RandomPrivateResolvable => AddressType::RandomPrivateResolvable,
        AddressKind::RandomPrivateNonResolvable => AddressType::RandomPrivateNonResolvable,
        AddressKind::Anonymous => AddressType::Anonymous,
    };
    Address::new(kind, address.bytes)
}

pub fn from_sd_address(address: &Address) -> BleAddress {
    BleAddress::new(
        AddressKind::from_raw(address.address_type() as u8),
        address.bytes(),
    )
}

pub fn to_sd_conn_params(params: &ConnParams) -> raw::ble_gap_conn_params_t {
    raw::ble_gap_conn_params_t {
        min_conn_interval: params.min_interval,
        max_conn_interval: params.max_interval,
        slave_latency: params.slave_latency,
        conn_sup_timeout: params.sup_timeout,
    }
}

fn status(ret: u32) -> StatusCode {
    StatusCode(ret)
}

fn phy_bits(phy: Phy) -> u8 {
    (match phy {
        Phy::Auto => raw::BLE_GAP_PHY_AUTO,
        Phy::OneMbps => raw::BLE_GAP_PHY_1MBPS,
        Phy::TwoMbps => raw::BLE_GAP_PHY_2MBPS,
        Phy::Coded => raw::BLE_GAP_PHY_CODED,
    }) as u8
}

fn notify_status(result: Result<(), NotifyValueError>) -> StatusCode {
    match result {
        Ok(()) => StatusCode::SUCCESS,
        Err(NotifyValueError::Disconnected) => StatusCode::BLE_INVALID_CONN_HANDLE,
        Err(NotifyValueError::Raw(err)) => StatusCode(err as u32),
    }
}

pub struct SoftDeviceStack {
    server: &'static Server,
    conn: Option<Connection>,
    passkey: Option<PasskeyReply>,
    advertising: bool,
    whitelist: Option<Whitelist>,
    peer_address: Option<BleAddress>,
}

impl SoftDeviceStack {
    pub fn new(server: &'static Server) -> Self {
        Self {
            server,
            conn: None,
            passkey: None,
            advertising: false,
            whitelist: None,
            peer_address: None,
        }
    }

    /// Bind the link established by the advertiser.
    pub fn attach(&mut self, conn: Connection) {
        self.advertising = false;
        self.conn = Some(conn);
    }

    pub fn detach(&mut self) {
        self.conn = None;
        self.passkey = None;
    }

    pub fn set_advertising(&mut self, advertising: bool) {
        self.advertising = advertising;
    }

    /// Keep the pending passkey request until the application answers.
    pub fn store_passkey_request(&mut self, reply: PasskeyReply) {
        self.passkey = Some(reply);
    }

    /// Whitelist handed over by the last whitelist request.
    pub fn take_whitelist(&mut self) -> Option<Whitelist> {
        self.whitelist.take()
    }

    /// Peer address handed over by the last peer address request.
    pub fn take_peer_address(&mut self) -> Option<BleAddress> {
        self.peer_address.take()
    }

    fn link(&self, handle: ConnHandle) -> Option<&Connection> {
        self.conn
            .as_ref()
            .filter(|conn| conn.handle() == Some(handle.0))
    }
}

impl BleStack for SoftDeviceStack {
    fn set_device_name(&mut self, name: &str) -> StatusCode {
        // No write access for centrals.
        let write_perm: raw::ble_gap_conn_sec_mode_t = unsafe { core::mem::zeroed() };
        status(unsafe {
            raw::sd_ble_gap_device_name_set(&write_perm, name.as_ptr(), name.len() as u16)
        })
    }

    fn set_appearance(&mut self, appearance: u16) -> StatusCode {
        status(unsafe { raw::sd_ble_gap_appearance_set(appearance) })
    }

    fn set_preferred_conn_params(&mut self, params: &ConnParams) -> StatusCode {
        let params = to_sd_conn_params(params);
        status(unsafe { raw::sd_ble_gap_ppcp_set(&params) })
    }

    fn disconnect(&mut self, handle: ConnHandle, reason: HciStatus) -> StatusCode {
        status(unsafe { raw::sd_ble_gap_disconnect(handle.0, reason as u8) })
    }

    fn phy_update(&mut self, handle: ConnHandle, tx: Phy, rx: Phy) -> StatusCode {
        let phys = raw::ble_gap_phys_t {
            tx_phys: phy_bits(tx),
            rx_phys: phy_bits(rx),
        };
        status(unsafe { raw::sd_ble_gap_phy_update(handle.0, &phys) })
    }

    fn assign_queued_writes(&mut self, handle: ConnHandle) -> StatusCode {
        // nrf-softdevice answers queued write requests itself.
        debug!("queued writes handled by the GATT server for {}", handle.0);
        StatusCode::SUCCESS
    }

    fn auth_key_reply(&mut self, handle: ConnHandle, passkey: &[u8; PASSKEY_LEN]) -> StatusCode {
        if self.link(handle).is_none() {
            return StatusCode::BLE_INVALID_CONN_HANDLE;
        }
        match self.passkey.take() {
            Some(reply) => match reply.reply(Some(passkey)) {
                Ok(()) => StatusCode::SUCCESS,
                Err(err) => StatusCode(err as u32),
            },
            None => StatusCode::INVALID_STATE,
        }
    }

    fn address(&mut self) -> Result<BleAddress, StatusCode> {
        let mut addr = Address::new(AddressType::Public, [0; 6]).into_raw();
        let code = status(unsafe { raw::sd_ble_gap_addr_get(&mut addr) });
        if !code.is_success() {
            return Err(code);
        }
        let addr = unsafe { Address::from_raw(addr) };
        Ok(from_sd_address(&addr))
    }

    fn set_address(&mut self, address: &BleAddress) -> StatusCode {
        let addr = to_sd_address(address).into_raw();
        status(unsafe { raw::sd_ble_gap_addr_set(&addr) })
    }

    fn advertising_start(&mut self, mode: AdvMode) -> StatusCode {
        if self.conn.is_some() {
            return StatusCode::CONN_COUNT;
        }
        ADV_CONTROL.signal(AdvCommand::Start(mode));
        StatusCode::SUCCESS
    }

    fn advertising_stop(&mut self) -> StatusCode {
        if !self.advertising {
            return StatusCode::INVALID_STATE;
        }
        ADV_CONTROL.signal(AdvCommand::Stop);
        StatusCode::SUCCESS
    }

    fn whitelist_reply(&mut self, whitelist: &Whitelist) -> StatusCode {
        let addrs: Vec<raw::ble_gap_addr_t, WHITELIST_MAX_COUNT> = whitelist
            .addrs
            .iter()
            .map(|addr| to_sd_address(addr).into_raw())
            .collect();
        let ptrs: Vec<*const raw::ble_gap_addr_t, WHITELIST_MAX_COUNT> =
            addrs.iter().map(|addr| addr as *const _).collect();
        let code = status(unsafe { raw::sd_ble_gap_whitelist_set(ptrs.as_ptr(), ptrs.len() as u8) });
        if code.is_success() {
            self.whitelist = Some(whitelist.clone());
        }
        code
    }

    fn peer_addr_reply(&mut self, address: &BleAddress) -> StatusCode {
        self.peer_address = Some(*address);
        StatusCode::SUCCESS
    }

    fn read_peer_device_name(&mut self, handle: ConnHandle) -> StatusCode {
        if self.link(handle).is_none() {
            return StatusCode::BLE_INVALID_CONN_HANDLE;
        }
        super::advertiser::NAME_READ.signal(handle);
        StatusCode::SUCCESS
    }

    fn hid_input_report_send(
        &mut self,
        handle: ConnHandle,
        slot: InputSlot,
        data: &[u8],
    ) -> StatusCode {
        let Some(conn) = self.link(handle) else {
            return StatusCode::BLE_INVALID_CONN_HANDLE;
        };
        let value_handle = self.server.hids.input_handle(slot);
        notify_status(gatt_server::notify_value(conn, value_handle, data))
    }

    fn hid_boot_keyboard_send(&mut self, handle: ConnHandle, data: &[u8]) -> StatusCode {
        let Some(conn) = self.link(handle) else {
            return StatusCode::BLE_INVALID_CONN_HANDLE;
        };
        let value_handle = self.server.hids.boot_keyboard_handle();
        notify_status(gatt_server::notify_value(conn, value_handle, data))
    }

    fn battery_level_update(&mut self, handle: ConnHandle, level: u8) -> StatusCode {
        let Some(conn) = self.link(handle) else {
            return StatusCode::BLE_INVALID_CONN_HANDLE;
        };
        match self.server.bas.battery_level_notify(conn, &level) {
            Ok(()) => StatusCode::SUCCESS,
            Err(err) => {
                warn!("battery notify failed");
                notify_status(Err(err))
            }
        }
    }
}
