//! Connection state and the stack event dispatcher.
//!
//! [`ConnectionState::on_stack_event`] is a pure transition: it updates the
//! single-link state and returns the stack calls the caller has to make.

use heapless::Vec;

use crate::config::PEER_NAME_MAX_LEN;

/// Opaque connection handle assigned by the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnHandle(pub u16);

impl ConnHandle {
    pub const INVALID: Self = Self(0xFFFF);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl Default for ConnHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

/// GAP address type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddressKind {
    #[default]
    Public,
    RandomStatic,
    RandomPrivateResolvable,
    RandomPrivateNonResolvable,
    Anonymous,
}

impl AddressKind {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => AddressKind::Public,
            0x01 => AddressKind::RandomStatic,
            0x02 => AddressKind::RandomPrivateResolvable,
            0x03 => AddressKind::RandomPrivateNonResolvable,
            _ => AddressKind::Anonymous,
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            AddressKind::Public => 0x00,
            AddressKind::RandomStatic => 0x01,
            AddressKind::RandomPrivateResolvable => 0x02,
            AddressKind::RandomPrivateNonResolvable => 0x03,
            AddressKind::Anonymous => 0x7F,
        }
    }
}

/// 48-bit Bluetooth device address, least significant byte first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BleAddress {
    pub kind: AddressKind,
    pub bytes: [u8; 6],
}

impl BleAddress {
    pub const fn new(kind: AddressKind, bytes: [u8; 6]) -> Self {
        Self { kind, bytes }
    }
}

/// HCI status codes used as disconnect reasons.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum HciStatus {
    RemoteUserTerminated = 0x13,
    RemoteDevTerminationLowResources = 0x14,
    RemoteDevTerminationPowerOff = 0x15,
    LocalHostTerminated = 0x16,
}

/// PHY preference for a PHY update reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phy {
    Auto,
    OneMbps,
    TwoMbps,
    Coded,
}

/// Outcome of a GAP authentication procedure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AuthStatus {
    Success,
    /// The central ignored our security request.
    Timeout,
    Failed(u8),
}

/// Events delivered by the BLE stack (GAP, GATT client, GATT server).
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackEvent {
    Connected {
        handle: ConnHandle,
        peer: BleAddress,
    },
    Disconnected {
        handle: ConnHandle,
        reason: u8,
    },
    PhyUpdateRequest {
        handle: ConnHandle,
    },
    GattClientTimeout {
        handle: ConnHandle,
    },
    GattServerTimeout {
        handle: ConnHandle,
    },
    /// Response to the peer device-name read. `None` when the peer
    /// returned no matching characteristic.
    NameReadResponse {
        handle: ConnHandle,
        value: Option<Vec<u8, PEER_NAME_MAX_LEN>>,
    },
    AuthStatus {
        handle: ConnHandle,
        status: AuthStatus,
    },
    AuthKeyRequest {
        handle: ConnHandle,
    },
    HvnTxComplete {
        handle: ConnHandle,
        count: u8,
    },
}

/// Stack calls requested by a connection event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnAction {
    /// Connecting ended advertising.
    AdvertisingEnded,
    AssignQueuedWrites(ConnHandle),
    PhyUpdate {
        handle: ConnHandle,
        tx: Phy,
        rx: Phy,
    },
    Disconnect {
        handle: ConnHandle,
        reason: HciStatus,
    },
    /// The peer device name arrived; notify the registered handler.
    PeerNameReady,
}

pub type ConnActions = Vec<ConnAction, 2>;

/// State of the single BLE link.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionState {
    handle: ConnHandle,
    connected: bool,
    peer_address: BleAddress,
    peer_name: Vec<u8, PEER_NAME_MAX_LEN>,
    name_changed: bool,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> ConnHandle {
        self.handle
    }

    /// True once the link is secured, false again after disconnect.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Address of the most recently connected peer.
    pub fn peer_address(&self) -> &BleAddress {
        &self.peer_address
    }

    /// Device name read from the peer. Only meaningful after
    /// [`name_changed`](Self::name_changed) was raised.
    pub fn peer_name(&self) -> &[u8] {
        &self.peer_name
    }

    pub fn name_changed(&self) -> bool {
        self.name_changed
    }

    pub fn set_name_changed(&mut self, changed: bool) {
        self.name_changed = changed;
    }

    /// The security procedure succeeded on the current link.
    pub fn mark_secured(&mut self) {
        self.connected = true;
    }

    pub fn on_stack_event(&mut self, event: &StackEvent) -> ConnActions {
        let mut actions = ConnActions::new();
        match event {
            StackEvent::Connected { handle, peer } => {
                info!("connected: handle {}", handle.0);
                self.handle = *handle;
                self.peer_address = *peer;
                debug!("peer address {}", peer);
                let _ = actions.push(ConnAction::AdvertisingEnded);
                let _ = actions.push(ConnAction::AssignQueuedWrites(*handle));
            }
            StackEvent::Disconnected { handle, reason } => {
                info!("disconnected: handle {} reason {=u8:#04x}", handle.0, *reason);
                self.connected = false;
                self.handle = ConnHandle::INVALID;
            }
            StackEvent::PhyUpdateRequest { handle } => {
                debug!("PHY update request");
                let _ = actions.push(ConnAction::PhyUpdate {
                    handle: *handle,
                    tx: Phy::Auto,
                    rx: Phy::Auto,
                });
            }
            StackEvent::GattClientTimeout { handle } | StackEvent::GattServerTimeout { handle } => {
                warn!("GATT timeout on handle {}, disconnecting", handle.0);
                let _ = actions.push(ConnAction::Disconnect {
                    handle: *handle,
                    reason: HciStatus::RemoteUserTerminated,
                });
            }
            StackEvent::NameReadResponse { value, .. } => {
                if let Some(name) = value {
                    self.peer_name.clear();
                    let len = name.len().min(PEER_NAME_MAX_LEN);
                    let _ = self.peer_name.extend_from_slice(&name[..len]);
                    self.name_changed = true;
                    debug!("peer name {=[u8]:a}", self.peer_name.as_slice());
                    let _ = actions.push(ConnAction::PeerNameReady);
                }
            }
            StackEvent::AuthStatus { status, .. } => match status {
                AuthStatus::Timeout => debug!("security request ignored by central"),
                _ => debug!("auth status {}", status),
            },
            StackEvent::AuthKeyRequest { handle } => {
                info!("auth key requested on handle {}", handle.0);
            }
            StackEvent::HvnTxComplete { count, .. } => {
                trace!("{} notifications sent", count);
            }
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: BleAddress =
        BleAddress::new(AddressKind::Public, [0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);

    #[test]
    fn connect_records_handle_and_address() {
        let mut conn = ConnectionState::new();
        let actions = conn.on_stack_event(&StackEvent::Connected {
            handle: ConnHandle(5),
            peer: PEER,
        });
        assert_eq!(conn.handle(), ConnHandle(5));
        assert_eq!(conn.peer_address(), &PEER);
        assert!(!conn.is_connected());
        assert_eq!(
            actions.as_slice(),
            &[
                ConnAction::AdvertisingEnded,
                ConnAction::AssignQueuedWrites(ConnHandle(5))
            ]
        );
    }

    #[test]
    fn disconnect_resets_link() {
        let mut conn = ConnectionState::new();
        conn.on_stack_event(&StackEvent::Connected {
            handle: ConnHandle(1),
            peer: PEER,
        });
        conn.mark_secured();
        let actions = conn.on_stack_event(&StackEvent::Disconnected {
            handle: ConnHandle(1),
            reason: 0x13,
        });
        assert!(actions.is_empty());
        assert!(!conn.is_connected());
        assert_eq!(conn.handle(), ConnHandle::INVALID);
    }

    #[test]
    fn gatt_timeouts_request_disconnect() {
        let mut conn = ConnectionState::new();
        for event in [
            StackEvent::GattClientTimeout {
                handle: ConnHandle(3),
            },
            StackEvent::GattServerTimeout {
                handle: ConnHandle(3),
            },
        ] {
            let actions = conn.on_stack_event(&event);
            assert_eq!(
                actions.as_slice(),
                &[ConnAction::Disconnect {
                    handle: ConnHandle(3),
                    reason: HciStatus::RemoteUserTerminated
                }]
            );
        }
    }

    #[test]
    fn phy_request_answers_auto() {
        let mut conn = ConnectionState::new();
        let actions = conn.on_stack_event(&StackEvent::PhyUpdateRequest {
            handle: ConnHandle(2),
        });
        assert_eq!(
            actions.as_slice(),
            &[ConnAction::PhyUpdate {
                handle: ConnHandle(2),
                tx: Phy::Auto,
                rx: Phy::Auto
            }]
        );
    }

    #[test]
    fn empty_name_response_is_ignored() {
        let mut conn = ConnectionState::new();
        let actions = conn.on_stack_event(&StackEvent::NameReadResponse {
            handle: ConnHandle(0),
            value: None,
        });
        assert!(actions.is_empty());
        assert!(!conn.name_changed());
        assert!(conn.peer_name().is_empty());
    }

    #[test]
    fn name_response_replaces_previous_name() {
        let mut conn = ConnectionState::new();
        for name in [&b"Desktop of Someone"[..], &b"Phone"[..]] {
            let actions = conn.on_stack_event(&StackEvent::NameReadResponse {
                handle: ConnHandle(0),
                value: Some(Vec::from_slice(name).unwrap()),
            });
            assert_eq!(actions.as_slice(), &[ConnAction::PeerNameReady]);
        }
        assert_eq!(conn.peer_name(), b"Phone");
        assert!(conn.name_changed());
        conn.set_name_changed(false);
        assert!(!conn.name_changed());
    }

    #[test]
    fn logged_only_events_leave_state_alone() {
        let mut conn = ConnectionState::new();
        let before = conn.clone();
        for event in [
            StackEvent::AuthStatus {
                handle: ConnHandle(0),
                status: AuthStatus::Timeout,
            },
            StackEvent::AuthKeyRequest {
                handle: ConnHandle(0),
            },
            StackEvent::HvnTxComplete {
                handle: ConnHandle(0),
                count: 1,
            },
        ] {
            assert!(conn.on_stack_event(&event).is_empty());
        }
        assert_eq!(conn, before);
    }
}
