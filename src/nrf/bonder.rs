//! Pairing/bonding handler and the shared bond table.
//!
//! The [`BondTable`] lives in a critical-section mutex so the SoftDevice
//! security callbacks and the device logic see the same bonds. Every
//! change raises [`PERSIST`]; the storage task writes the table to flash
//! and only then forwards the table's completion events.
//!
//! Each bond also keeps the peer's GATT system attributes, so CCCD
//! subscriptions survive a reconnection.

use core::cell::{Cell, RefCell};

use defmt::{debug, info, warn, Debug2Format};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use heapless::Vec;
use nrf_softdevice::ble::gatt_server::{get_sys_attrs, set_sys_attrs};
use nrf_softdevice::ble::security::{IoCapabilities, PasskeyReply, SecurityHandler};
use nrf_softdevice::ble::{Connection, EncryptionInfo, IdentityKey, MasterId, SecurityMode};
use nrf_softdevice::raw;

use super::stack::{from_sd_address, to_sd_address};
use super::{post, with_device};
use crate::ble::bond::{self, BondTable, NewBond};
use crate::ble::connection::{ConnHandle, StackEvent};
use crate::ble::peer::{PeerId, PeerSkip, SecurityTracker};
use crate::ble::stack::{BondingData, Irk, PeerIdList, PeerManager, Whitelist};
use crate::config::{DEVICE_IDENTITIES_MAX_COUNT, SEC_PARAM_BOND, SYS_ATTRS_MAX_LEN};
use crate::error::StatusCode;

pub static BONDS: Mutex<CriticalSectionRawMutex, RefCell<BondTable>> =
    Mutex::new(RefCell::new(BondTable::new()));

/// Raised whenever the bond table changed and must be written to flash.
pub static PERSIST: Signal<CriticalSectionRawMutex, ()> = Signal::new();

pub fn with_bonds<R>(f: impl FnOnce(&mut BondTable) -> R) -> R {
    BONDS.lock(|table| f(&mut table.borrow_mut()))
}

fn link_handle(conn: &Connection) -> ConnHandle {
    conn.handle().map(ConnHandle).unwrap_or_default()
}

/// [`PeerManager`] handle over [`BONDS`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SharedBonds;

impl PeerManager for SharedBonds {
    fn peer_ids(&mut self, skip: PeerSkip) -> Result<PeerIdList, StatusCode> {
        with_bonds(|table| table.peer_ids(skip))
    }

    fn next_peer_id(&self, after: PeerId) -> PeerId {
        with_bonds(|table| table.next_peer_id(after))
    }

    fn whitelist_set(&mut self, peers: &[PeerId]) -> StatusCode {
        with_bonds(|table| table.whitelist_set(peers))
    }

    fn whitelist_get(&self) -> Result<Whitelist, StatusCode> {
        with_bonds(|table| table.whitelist_get())
    }

    fn device_identities_set(&mut self, peers: &[PeerId]) -> StatusCode {
        with_bonds(|table| {
            let code = table.device_identities_set(peers);
            if !code.is_success() {
                return code;
            }

            let keys: Vec<raw::ble_gap_id_key_t, DEVICE_IDENTITIES_MAX_COUNT> = table
                .device_identities()
                .iter()
                .filter_map(|peer| table.get(*peer))
                .filter_map(|record| Some((record.identity?, record.irk?)))
                .map(|(identity, irk)| raw::ble_gap_id_key_t {
                    id_info: raw::ble_gap_irk_t { irk: irk.0 },
                    id_addr_info: to_sd_address(&identity).into_raw(),
                })
                .collect();
            let ptrs: Vec<*const raw::ble_gap_id_key_t, DEVICE_IDENTITIES_MAX_COUNT> =
                keys.iter().map(|key| key as *const _).collect();
            let ret = unsafe {
                raw::sd_ble_gap_device_identities_set(
                    ptrs.as_ptr(),
                    core::ptr::null(),
                    ptrs.len() as u8,
                )
            };
            StatusCode(ret)
        })
    }

    fn bonding_data(&self, peer: PeerId) -> Result<BondingData, StatusCode> {
        with_bonds(|table| table.bonding_data(peer))
    }

    fn peer_delete(&mut self, peer: PeerId) -> StatusCode {
        let code = with_bonds(|table| table.peer_delete(peer));
        if code.is_success() {
            PERSIST.signal(());
        }
        code
    }

    fn peers_delete(&mut self) -> StatusCode {
        let code = with_bonds(|table| table.peers_delete());
        if code.is_success() {
            PERSIST.signal(());
        }
        code
    }
}

#[derive(Default)]
pub struct Bonder {
    security: Cell<SecurityTracker>,
}

impl Bonder {
    fn track<R>(&self, f: impl FnOnce(&mut SecurityTracker) -> R) -> R {
        let mut tracker = self.security.get();
        let result = f(&mut tracker);
        self.security.set(tracker);
        result
    }

    fn start(&self, conn: &Connection, peer: PeerId) {
        post(self.track(|t| t.start(link_handle(conn), peer)));
    }

    /// Report the end of a link. Call after the `Disconnected` event was
    /// posted; a security procedure still running on it has failed.
    pub fn link_closed(&self, handle: ConnHandle) {
        if let Some(event) = self.track(|t| t.link_closed(handle)) {
            post(event);
        }
    }

    /// Bonded peer on `conn`: the one that secured the link, or the one
    /// whose identity address the stack resolved.
    fn peer_of(&self, conn: &Connection) -> Option<PeerId> {
        let peer = self.security.get().peer();
        if peer.is_valid() {
            return Some(peer);
        }
        let address = from_sd_address(&conn.peer_address());
        with_bonds(|table| table.find_by_identity(&address).map(|record| record.peer))
    }
}

impl SecurityHandler for Bonder {
    fn io_capabilities(&self) -> IoCapabilities {
        IoCapabilities::None
    }

    fn can_bond(&self, conn: &Connection) -> bool {
        self.start(conn, PeerId::INVALID);
        SEC_PARAM_BOND
    }

    fn enter_passkey(&self, reply: PasskeyReply) {
        let handle = with_device(|device| {
            device.stack_mut().store_passkey_request(reply);
            device.conn_handle()
        });
        post(StackEvent::AuthKeyRequest { handle });
    }

    fn on_bonded(
        &self,
        conn: &Connection,
        master_id: MasterId,
        key: EncryptionInfo,
        peer_id: IdentityKey,
    ) {
        let irk = Irk(peer_id.irk.as_raw().irk);
        let peer = with_bonds(|table| {
            table.bond(NewBond {
                identity: Some(from_sd_address(&peer_id.addr)),
                irk: Some(irk),
                car: true,
                master: bond::MasterId {
                    ediv: master_id.ediv,
                    rand: master_id.rand,
                },
                key: bond::EncryptionKey {
                    ltk: key.ltk,
                    flags: key.flags,
                },
            })
        });
        info!("bonded as peer {}", peer.0);
        post(self.track(|t| t.bonded(link_handle(conn), peer)));
        PERSIST.signal(());
    }

    fn get_key(&self, conn: &Connection, master_id: MasterId) -> Option<EncryptionInfo> {
        let master = bond::MasterId {
            ediv: master_id.ediv,
            rand: master_id.rand,
        };
        let record = with_bonds(|table| table.find_by_master(&master).copied());
        match record {
            Some(record) => {
                debug!("LTK found for peer {}", record.peer.0);
                self.start(conn, record.peer);
                Some(EncryptionInfo {
                    ltk: record.key.ltk,
                    flags: record.key.flags,
                })
            }
            None => {
                warn!("no LTK for ediv {}", master_id.ediv);
                None
            }
        }
    }

    fn on_security_update(&self, conn: &Connection, security_mode: SecurityMode) {
        let encrypted = !matches!(security_mode, SecurityMode::NoAccess | SecurityMode::Open);
        post(self.track(|t| t.secured(link_handle(conn), encrypted)));
    }

    fn save_sys_attrs(&self, conn: &Connection) {
        let Some(peer) = self.peer_of(conn) else {
            debug!("link closed without a bonded peer, CCCDs not kept");
            return;
        };
        let mut buf = [0u8; SYS_ATTRS_MAX_LEN];
        let len = match get_sys_attrs(conn, &mut buf) {
            Ok(len) => len,
            Err(err) => {
                warn!("reading system attributes failed: {:?}", Debug2Format(&err));
                return;
            }
        };
        match with_bonds(|table| table.set_sys_attrs(peer, &buf[..len])) {
            Ok(true) => {
                debug!("system attributes of peer {} changed", peer.0);
                PERSIST.signal(());
            }
            Ok(false) => {}
            Err(_) => warn!("system attributes of peer {} too long", peer.0),
        }
    }

    fn load_sys_attrs(&self, conn: &Connection) {
        let mut buf = [0u8; SYS_ATTRS_MAX_LEN];
        let len = self
            .peer_of(conn)
            .and_then(|peer| {
                with_bonds(|table| {
                    let attrs = table.sys_attrs(peer)?;
                    buf[..attrs.len()].copy_from_slice(attrs);
                    Some(attrs.len())
                })
            });
        let attrs = len.map(|len| &buf[..len]);
        if let Err(err) = set_sys_attrs(conn, attrs) {
            warn!("restoring system attributes failed: {:?}", Debug2Format(&err));
        }
    }
}
