//! Peer identity and security procedure tracking.
//!
//! Driven by peer manager events. The polling side reads the security
//! flags and clears them explicitly once consumed; nothing here clears a
//! flag behind the caller's back except a new procedure starting.
//!
//! [`SecurityTracker`] turns the callbacks of a stack that reports pairing
//! piecewise (procedure start, link security change, bond stored, link
//! closed) into those events.

use super::connection::ConnHandle;

/// Bonded peer reference, stable across reboots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PeerId(pub u16);

impl PeerId {
    pub const INVALID: Self = Self(0xFFFF);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Kind of peer data written by the peer manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PeerDataId {
    Bonding,
    ServiceChanged,
    GattLocal,
    GattRemote,
    Application,
}

/// Filter for peer enumeration. Bits combine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PeerSkip(u8);

impl PeerSkip {
    pub const NONE: Self = Self(0);
    /// Skip peers without an identity address.
    pub const NO_ID_ADDR: Self = Self(1 << 0);
    /// Skip peers without an identity resolving key.
    pub const NO_IRK: Self = Self(1 << 1);
    /// Skip peers that do not support central address resolution.
    pub const NO_CAR: Self = Self(1 << 2);
    pub const ALL: Self = Self(Self::NO_ID_ADDR.0 | Self::NO_IRK.0 | Self::NO_CAR.0);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Events raised by the peer manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PeerEvent {
    ConnSecStart {
        handle: ConnHandle,
        peer: PeerId,
    },
    ConnSecFailed {
        handle: ConnHandle,
        peer: PeerId,
    },
    ConnSecSucceeded {
        handle: ConnHandle,
        peer: PeerId,
    },
    PeerDeleteSucceeded {
        peer: PeerId,
    },
    PeersDeleteSucceeded,
    PeerDataUpdateSucceeded {
        peer: PeerId,
        data: PeerDataId,
        flash_changed: bool,
    },
}

/// Security procedure on the current link.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SecurityProcedure {
    #[default]
    Idle,
    Started,
    Failed,
}

/// Work requested by a peer manager event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PeerAction {
    /// The link on `handle` is now secured.
    LinkSecured(ConnHandle),
    /// Security failed on `handle`; the link must be dropped.
    DropLink(ConnHandle),
    /// Rebuild the whitelist from all peers matching the filter.
    RebuildWhitelist(PeerSkip),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PeerState {
    current: PeerId,
    security: SecurityProcedure,
    peer_deleted: bool,
    all_peers_deleted: bool,
}

impl PeerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peer of the last successful security procedure.
    pub fn current(&self) -> PeerId {
        self.current
    }

    pub fn security(&self) -> SecurityProcedure {
        self.security
    }

    pub fn security_started(&self) -> bool {
        self.security == SecurityProcedure::Started
    }

    pub fn security_failed(&self) -> bool {
        self.security == SecurityProcedure::Failed
    }

    pub fn clear_security_started(&mut self) {
        if self.security == SecurityProcedure::Started {
            self.security = SecurityProcedure::Idle;
        }
    }

    pub fn clear_security_failed(&mut self) {
        if self.security == SecurityProcedure::Failed {
            self.security = SecurityProcedure::Idle;
        }
    }

    pub fn peer_deleted(&self) -> bool {
        self.peer_deleted
    }

    pub fn all_peers_deleted(&self) -> bool {
        self.all_peers_deleted
    }

    /// Arm the completion flag before issuing a single-peer delete.
    pub fn begin_peer_delete(&mut self) {
        self.peer_deleted = false;
    }

    /// Arm the completion flag before issuing a delete-all.
    pub fn begin_peers_delete(&mut self) {
        self.all_peers_deleted = false;
    }

    pub fn on_event(&mut self, event: &PeerEvent) -> Option<PeerAction> {
        match *event {
            PeerEvent::ConnSecStart { peer, .. } => {
                debug!("security procedure started (peer {})", peer.0);
                self.security = SecurityProcedure::Started;
                None
            }
            PeerEvent::ConnSecFailed { handle, peer } => {
                warn!("security procedure failed (peer {})", peer.0);
                self.security = SecurityProcedure::Failed;
                Some(PeerAction::DropLink(handle))
            }
            PeerEvent::ConnSecSucceeded { handle, peer } => {
                info!("link secured with peer {}", peer.0);
                self.current = peer;
                Some(PeerAction::LinkSecured(handle))
            }
            PeerEvent::PeerDeleteSucceeded { peer } => {
                debug!("peer {} deleted", peer.0);
                self.peer_deleted = true;
                if peer == self.current {
                    self.current = PeerId::INVALID;
                }
                None
            }
            PeerEvent::PeersDeleteSucceeded => {
                debug!("all peers deleted");
                self.all_peers_deleted = true;
                self.current = PeerId::INVALID;
                None
            }
            PeerEvent::PeerDataUpdateSucceeded {
                data: PeerDataId::Bonding,
                flash_changed: true,
                peer,
            } => {
                info!("new bond with peer {}, updating whitelist", peer.0);
                Some(PeerAction::RebuildWhitelist(PeerSkip::NO_ID_ADDR))
            }
            PeerEvent::PeerDataUpdateSucceeded { .. } => None,
        }
    }
}

/// Security procedure of the current link, as seen through the stack's
/// security callbacks.
///
/// A first-time bond reports the link security change before the keys are
/// stored, so success is reported twice: once from [`secured`](Self::secured)
/// with the peer known so far, and again from [`bonded`](Self::bonded) with
/// the new peer id. A procedure that never completes fails when the link
/// closes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SecurityTracker {
    handle: ConnHandle,
    peer: PeerId,
    pending: bool,
}

impl Default for SecurityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityTracker {
    pub const fn new() -> Self {
        Self {
            handle: ConnHandle::INVALID,
            peer: PeerId::INVALID,
            pending: false,
        }
    }

    /// Peer of the procedure in progress or last completed.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Pairing (`peer` is [`PeerId::INVALID`] until bonded) or encryption
    /// with a known peer started on `handle`.
    pub fn start(&mut self, handle: ConnHandle, peer: PeerId) -> PeerEvent {
        self.handle = handle;
        self.peer = peer;
        self.pending = true;
        PeerEvent::ConnSecStart { handle, peer }
    }

    /// The link security level changed; `encrypted` is false when the link
    /// fell back to no security.
    pub fn secured(&mut self, handle: ConnHandle, encrypted: bool) -> PeerEvent {
        self.handle = handle;
        self.pending = false;
        let peer = self.peer;
        if encrypted {
            PeerEvent::ConnSecSucceeded { handle, peer }
        } else {
            PeerEvent::ConnSecFailed { handle, peer }
        }
    }

    /// The keys of a new bond were stored as `peer`.
    pub fn bonded(&mut self, handle: ConnHandle, peer: PeerId) -> PeerEvent {
        self.handle = handle;
        self.peer = peer;
        self.pending = false;
        PeerEvent::ConnSecSucceeded { handle, peer }
    }

    /// The link closed and its peer is forgotten. A procedure still
    /// pending on it has failed.
    pub fn link_closed(&mut self, handle: ConnHandle) -> Option<PeerEvent> {
        if handle != self.handle {
            return None;
        }
        let failed = self.pending.then_some(PeerEvent::ConnSecFailed {
            handle,
            peer: self.peer,
        });
        *self = Self::new();
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: ConnHandle = ConnHandle(0);

    #[test]
    fn security_procedure_transitions() {
        let mut state = PeerState::new();
        state.on_event(&PeerEvent::ConnSecStart {
            handle: H,
            peer: PeerId(0),
        });
        assert!(state.security_started());
        assert!(!state.security_failed());

        state.on_event(&PeerEvent::ConnSecFailed {
            handle: H,
            peer: PeerId(0),
        });
        assert!(!state.security_started());
        assert!(state.security_failed());
    }

    #[test]
    fn new_attempt_clears_stale_failure() {
        let mut state = PeerState::new();
        state.on_event(&PeerEvent::ConnSecFailed {
            handle: H,
            peer: PeerId(0),
        });
        state.on_event(&PeerEvent::ConnSecStart {
            handle: H,
            peer: PeerId(0),
        });
        assert!(!state.security_failed());
        assert!(state.security_started());
    }

    #[test]
    fn clearing_only_touches_the_named_flag() {
        let mut state = PeerState::new();
        state.on_event(&PeerEvent::ConnSecFailed {
            handle: H,
            peer: PeerId(0),
        });
        state.clear_security_started();
        assert!(state.security_failed());
        state.clear_security_failed();
        assert_eq!(state.security(), SecurityProcedure::Idle);
    }

    #[test]
    fn success_records_peer_and_secures_link() {
        let mut state = PeerState::new();
        let action = state.on_event(&PeerEvent::ConnSecSucceeded {
            handle: ConnHandle(4),
            peer: PeerId(2),
        });
        assert_eq!(action, Some(PeerAction::LinkSecured(ConnHandle(4))));
        assert_eq!(state.current(), PeerId(2));
    }

    #[test]
    fn deleting_current_peer_invalidates_it() {
        let mut state = PeerState::new();
        state.on_event(&PeerEvent::ConnSecSucceeded {
            handle: H,
            peer: PeerId(1),
        });

        state.begin_peer_delete();
        state.on_event(&PeerEvent::PeerDeleteSucceeded { peer: PeerId(3) });
        assert!(state.peer_deleted());
        assert_eq!(state.current(), PeerId(1));

        state.begin_peer_delete();
        assert!(!state.peer_deleted());
        state.on_event(&PeerEvent::PeerDeleteSucceeded { peer: PeerId(1) });
        assert_eq!(state.current(), PeerId::INVALID);
    }

    #[test]
    fn deleting_all_peers_invalidates_current() {
        let mut state = PeerState::new();
        state.on_event(&PeerEvent::ConnSecSucceeded {
            handle: H,
            peer: PeerId(1),
        });
        state.begin_peers_delete();
        state.on_event(&PeerEvent::PeersDeleteSucceeded);
        assert!(state.all_peers_deleted());
        assert!(!state.current().is_valid());
    }

    #[test]
    fn only_flash_backed_bond_updates_rebuild_whitelist() {
        let mut state = PeerState::new();
        let update = |data, flash_changed| PeerEvent::PeerDataUpdateSucceeded {
            peer: PeerId(0),
            data,
            flash_changed,
        };
        assert_eq!(
            state.on_event(&update(PeerDataId::Bonding, true)),
            Some(PeerAction::RebuildWhitelist(PeerSkip::NO_ID_ADDR))
        );
        assert_eq!(state.on_event(&update(PeerDataId::Bonding, false)), None);
        assert_eq!(state.on_event(&update(PeerDataId::GattLocal, true)), None);
    }

    #[test]
    fn failure_asks_to_drop_the_link() {
        let mut state = PeerState::new();
        let action = state.on_event(&PeerEvent::ConnSecFailed {
            handle: ConnHandle(2),
            peer: PeerId::INVALID,
        });
        assert_eq!(action, Some(PeerAction::DropLink(ConnHandle(2))));
    }

    #[test]
    fn tracker_reports_new_bond_after_security_update() {
        let mut tracker = SecurityTracker::new();
        assert_eq!(
            tracker.start(H, PeerId::INVALID),
            PeerEvent::ConnSecStart {
                handle: H,
                peer: PeerId::INVALID
            }
        );
        assert!(tracker.is_pending());

        tracker.secured(H, true);
        assert_eq!(
            tracker.bonded(H, PeerId(3)),
            PeerEvent::ConnSecSucceeded {
                handle: H,
                peer: PeerId(3)
            }
        );
        assert_eq!(tracker.peer(), PeerId(3));
        assert_eq!(tracker.link_closed(H), None);
        assert_eq!(tracker.peer(), PeerId::INVALID);
    }

    #[test]
    fn tracker_fails_a_procedure_cut_short() {
        let mut tracker = SecurityTracker::new();
        tracker.start(H, PeerId(1));
        assert_eq!(tracker.link_closed(ConnHandle(9)), None);
        assert_eq!(
            tracker.link_closed(H),
            Some(PeerEvent::ConnSecFailed {
                handle: H,
                peer: PeerId(1)
            })
        );
        assert_eq!(tracker.link_closed(H), None);
    }

    #[test]
    fn tracker_reports_downgrade_as_failure() {
        let mut tracker = SecurityTracker::new();
        tracker.start(H, PeerId(0));
        assert_eq!(
            tracker.secured(H, false),
            PeerEvent::ConnSecFailed {
                handle: H,
                peer: PeerId(0)
            }
        );
        assert!(!tracker.is_pending());
    }

    #[test]
    fn skip_flags_combine() {
        assert!(PeerSkip::ALL.contains(PeerSkip::NO_IRK));
        assert!(PeerSkip::NO_ID_ADDR
            .union(PeerSkip::NO_CAR)
            .contains(PeerSkip::NO_CAR));
        assert!(!PeerSkip::NO_IRK.contains(PeerSkip::NO_ID_ADDR));
        assert!(PeerSkip::NO_IRK.contains(PeerSkip::NONE));
    }
}
