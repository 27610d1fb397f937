//! In-memory bond table.
//!
//! Holds the keys and identities of bonded centrals, assigns stable
//! [`PeerId`]s, and serves the whitelist and device identity lists.
//! Mutations queue the matching completion [`PeerEvent`]; the owner drains
//! them with [`BondTable::take_event`] once the change is durable.
//!
//! Record layout in flash (little-endian, [`RECORD_LEN`] bytes):
//! ```text
//! [0..2]   peer id
//! [2]      flags: bit0 identity address, bit1 IRK, bit2 central address resolution
//! [3]      identity address type
//! [4..10]  identity address
//! [10..26] IRK
//! [26..28] EDIV
//! [28..36] Rand
//! [36..52] LTK
//! [52]     key flags
//! [53]     GATT system attributes length
//! [54..]   GATT system attributes (CCCD state), zero padded
//! ```

use heapless::{Deque, Vec};

use super::connection::{AddressKind, BleAddress};
use super::peer::{PeerDataId, PeerEvent, PeerId, PeerSkip};
use super::stack::{BondingData, Irk, PeerIdList, PeerManager, Whitelist};
use crate::config::{
    DEVICE_IDENTITIES_MAX_COUNT, MAX_PEERS, SYS_ATTRS_MAX_LEN, WHITELIST_MAX_COUNT,
};
use crate::error::{Error, StatusCode};

/// Serialized size of one [`BondRecord`].
pub const RECORD_LEN: usize = SYS_ATTRS_OFFSET + 1 + SYS_ATTRS_MAX_LEN;

const SYS_ATTRS_OFFSET: usize = 53;

/// Serialized size of a full table: count byte plus records.
pub const TABLE_LEN: usize = 1 + MAX_PEERS * RECORD_LEN;

const FLAG_IDENTITY: u8 = 1 << 0;
const FLAG_IRK: u8 = 1 << 1;
const FLAG_CAR: u8 = 1 << 2;

const MAX_PENDING_EVENTS: usize = 8;

/// Identifies the long term key a central presents on reconnection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MasterId {
    pub ediv: u16,
    pub rand: [u8; 8],
}

/// Long term key plus the SoftDevice key flags (auth, LESC, length).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EncryptionKey {
    pub ltk: [u8; 16],
    pub flags: u8,
}

/// GATT server system attributes of one peer: the CCCD values it wrote,
/// as exported by the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SysAttrs {
    len: u8,
    data: [u8; SYS_ATTRS_MAX_LEN],
}

impl Default for SysAttrs {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl SysAttrs {
    pub const EMPTY: Self = Self {
        len: 0,
        data: [0; SYS_ATTRS_MAX_LEN],
    };

    pub fn from_slice(attrs: &[u8]) -> Result<Self, Error> {
        if attrs.len() > SYS_ATTRS_MAX_LEN {
            return Err(Error::BufferOverflow);
        }
        let mut data = [0; SYS_ATTRS_MAX_LEN];
        data[..attrs.len()].copy_from_slice(attrs);
        Ok(Self {
            len: attrs.len() as u8,
            data,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// One bonded central.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BondRecord {
    pub peer: PeerId,
    /// Identity address distributed during bonding.
    pub identity: Option<BleAddress>,
    pub irk: Option<Irk>,
    /// Central address resolution supported.
    pub car: bool,
    pub master: MasterId,
    pub key: EncryptionKey,
    /// Empty until the peer's first link closes.
    pub sys_attrs: SysAttrs,
}

impl BondRecord {
    fn skipped_by(&self, skip: PeerSkip) -> bool {
        (skip.contains(PeerSkip::NO_ID_ADDR) && self.identity.is_none())
            || (skip.contains(PeerSkip::NO_IRK) && self.irk.is_none())
            || (skip.contains(PeerSkip::NO_CAR) && !self.car)
    }

    /// Serialize into `buf`. Returns the number of bytes written.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.len() < RECORD_LEN {
            return Err(Error::BufferOverflow);
        }
        let buf = &mut buf[..RECORD_LEN];
        buf.fill(0);

        buf[0..2].copy_from_slice(&self.peer.0.to_le_bytes());
        let mut flags = 0;
        if let Some(identity) = &self.identity {
            flags |= FLAG_IDENTITY;
            buf[3] = identity.kind.raw();
            buf[4..10].copy_from_slice(&identity.bytes);
        }
        if let Some(irk) = &self.irk {
            flags |= FLAG_IRK;
            buf[10..26].copy_from_slice(&irk.0);
        }
        if self.car {
            flags |= FLAG_CAR;
        }
        buf[2] = flags;
        buf[26..28].copy_from_slice(&self.master.ediv.to_le_bytes());
        buf[28..36].copy_from_slice(&self.master.rand);
        buf[36..52].copy_from_slice(&self.key.ltk);
        buf[52] = self.key.flags;
        let attrs = self.sys_attrs.as_slice();
        buf[SYS_ATTRS_OFFSET] = attrs.len() as u8;
        buf[SYS_ATTRS_OFFSET + 1..][..attrs.len()].copy_from_slice(attrs);
        Ok(RECORD_LEN)
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.len() < RECORD_LEN {
            return Err(Error::CorruptRecord);
        }

        let peer = PeerId(u16::from_le_bytes([data[0], data[1]]));
        if !peer.is_valid() {
            return Err(Error::CorruptRecord);
        }
        let flags = data[2];
        if flags & !(FLAG_IDENTITY | FLAG_IRK | FLAG_CAR) != 0 {
            return Err(Error::CorruptRecord);
        }

        let identity = (flags & FLAG_IDENTITY != 0).then(|| {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&data[4..10]);
            BleAddress::new(AddressKind::from_raw(data[3]), bytes)
        });
        let irk = (flags & FLAG_IRK != 0).then(|| {
            let mut key = [0u8; 16];
            key.copy_from_slice(&data[10..26]);
            Irk(key)
        });

        let mut rand = [0u8; 8];
        rand.copy_from_slice(&data[28..36]);
        let mut ltk = [0u8; 16];
        ltk.copy_from_slice(&data[36..52]);

        let attrs_len = usize::from(data[SYS_ATTRS_OFFSET]);
        if attrs_len > SYS_ATTRS_MAX_LEN {
            return Err(Error::CorruptRecord);
        }
        let sys_attrs = SysAttrs::from_slice(&data[SYS_ATTRS_OFFSET + 1..][..attrs_len])?;

        Ok(Self {
            peer,
            identity,
            irk,
            car: flags & FLAG_CAR != 0,
            master: MasterId {
                ediv: u16::from_le_bytes([data[26], data[27]]),
                rand,
            },
            key: EncryptionKey {
                ltk,
                flags: data[52],
            },
            sys_attrs,
        })
    }
}

/// Keys obtained from a completed bonding procedure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NewBond {
    pub identity: Option<BleAddress>,
    pub irk: Option<Irk>,
    pub car: bool,
    pub master: MasterId,
    pub key: EncryptionKey,
}

pub struct BondTable {
    bonds: Vec<BondRecord, MAX_PEERS>,
    whitelist: PeerIdList,
    identities: PeerIdList,
    pending: Deque<PeerEvent, MAX_PENDING_EVENTS>,
    dirty: bool,
}

impl Default for BondTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BondTable {
    pub const fn new() -> Self {
        Self {
            bonds: Vec::new(),
            whitelist: Vec::new(),
            identities: Vec::new(),
            pending: Deque::new(),
            dirty: false,
        }
    }

    pub fn len(&self) -> usize {
        self.bonds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bonds.is_empty()
    }

    pub fn records(&self) -> &[BondRecord] {
        &self.bonds
    }

    pub fn get(&self, peer: PeerId) -> Option<&BondRecord> {
        self.bonds.iter().find(|b| b.peer == peer)
    }

    pub fn find_by_master(&self, master: &MasterId) -> Option<&BondRecord> {
        self.bonds.iter().find(|b| b.master == *master)
    }

    pub fn find_by_identity(&self, address: &BleAddress) -> Option<&BondRecord> {
        self.bonds
            .iter()
            .find(|b| b.identity.as_ref() == Some(address))
    }

    /// Peer ids mirrored into the stack's device identity list.
    pub fn device_identities(&self) -> &[PeerId] {
        &self.identities
    }

    /// Peer ids currently on the whitelist.
    pub fn whitelisted(&self) -> &[PeerId] {
        &self.whitelist
    }

    /// The table changed since the last [`mark_clean`](Self::mark_clean).
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Next queued completion event.
    pub fn take_event(&mut self) -> Option<PeerEvent> {
        self.pending.pop_front()
    }

    /// Next queued completion event, held back while the table has
    /// unsaved changes.
    pub fn take_saved_event(&mut self) -> Option<PeerEvent> {
        if self.dirty {
            return None;
        }
        self.take_event()
    }

    fn queue(&mut self, event: PeerEvent) {
        if self.pending.is_full() {
            warn!("bond table: dropping oldest completion event");
            let _ = self.pending.pop_front();
        }
        let _ = self.pending.push_back(event);
    }

    fn free_id(&self) -> PeerId {
        let mut id = 0u16;
        while self.bonds.iter().any(|b| b.peer.0 == id) {
            id += 1;
        }
        PeerId(id)
    }

    fn forget(&mut self, peer: PeerId) {
        self.bonds.retain(|b| b.peer != peer);
        self.whitelist.retain(|p| *p != peer);
        self.identities.retain(|p| *p != peer);
    }

    /// Store the keys of a new bond. A central that bonds again (same
    /// master id or identity address) keeps its peer id. When the table
    /// is full the lowest peer id is evicted.
    pub fn bond(&mut self, bond: NewBond) -> PeerId {
        let existing = self.bonds.iter().position(|b| {
            b.master == bond.master || (bond.identity.is_some() && b.identity == bond.identity)
        });

        let peer = match existing {
            Some(pos) => {
                let peer = self.bonds[pos].peer;
                self.bonds[pos] = BondRecord {
                    peer,
                    identity: bond.identity,
                    irk: bond.irk,
                    car: bond.car,
                    master: bond.master,
                    key: bond.key,
                    sys_attrs: SysAttrs::EMPTY,
                };
                info!("bond table: updated peer {}", peer.0);
                peer
            }
            None => {
                if self.bonds.is_full() {
                    let oldest = self.bonds.iter().map(|b| b.peer).min().unwrap_or_default();
                    warn!("bond table full, evicting peer {}", oldest.0);
                    self.forget(oldest);
                }
                let peer = self.free_id();
                let _ = self.bonds.push(BondRecord {
                    peer,
                    identity: bond.identity,
                    irk: bond.irk,
                    car: bond.car,
                    master: bond.master,
                    key: bond.key,
                    sys_attrs: SysAttrs::EMPTY,
                });
                info!("bond table: added peer {} ({} bonds)", peer.0, self.bonds.len());
                peer
            }
        };

        self.dirty = true;
        self.queue(PeerEvent::PeerDataUpdateSucceeded {
            peer,
            data: PeerDataId::Bonding,
            flash_changed: true,
        });
        peer
    }

    /// System attributes stored for `peer`, if any.
    pub fn sys_attrs(&self, peer: PeerId) -> Option<&[u8]> {
        self.get(peer)
            .map(|record| record.sys_attrs.as_slice())
            .filter(|attrs| !attrs.is_empty())
    }

    /// Store the system attributes of `peer`. Returns whether the stored
    /// value changed; only a change marks the table dirty.
    pub fn set_sys_attrs(&mut self, peer: PeerId, attrs: &[u8]) -> Result<bool, Error> {
        let attrs = SysAttrs::from_slice(attrs)?;
        let Some(record) = self.bonds.iter_mut().find(|b| b.peer == peer) else {
            return Ok(false);
        };
        if record.sys_attrs == attrs {
            return Ok(false);
        }
        record.sys_attrs = attrs;
        self.dirty = true;
        self.queue(PeerEvent::PeerDataUpdateSucceeded {
            peer,
            data: PeerDataId::GattLocal,
            flash_changed: true,
        });
        Ok(true)
    }

    /// Serialize the whole table. Returns the number of bytes written.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Err(Error::BufferOverflow);
        }
        buf[0] = self.bonds.len() as u8;
        let mut offset = 1;
        for record in &self.bonds {
            offset += record.encode(&mut buf[offset..])?;
        }
        Ok(offset)
    }

    /// Replace the table with serialized records. Whitelist and identity
    /// lists are cleared; the stack rebuilds them on demand.
    pub fn decode(&mut self, data: &[u8]) -> Result<(), Error> {
        let (&count, mut rest) = data.split_first().ok_or(Error::CorruptRecord)?;
        let count = usize::from(count);
        if count > MAX_PEERS {
            return Err(Error::CorruptRecord);
        }

        let mut bonds: Vec<BondRecord, MAX_PEERS> = Vec::new();
        for _ in 0..count {
            let record = BondRecord::decode(rest)?;
            if bonds.iter().any(|b| b.peer == record.peer) {
                return Err(Error::CorruptRecord);
            }
            let _ = bonds.push(record);
            rest = &rest[RECORD_LEN..];
        }

        self.bonds = bonds;
        self.whitelist.clear();
        self.identities.clear();
        self.dirty = false;
        Ok(())
    }

    fn collect(&self, peers: &[PeerId], max: usize) -> Result<PeerIdList, StatusCode> {
        if peers.len() > max {
            return Err(StatusCode::DATA_SIZE);
        }
        let mut list = PeerIdList::new();
        for &peer in peers {
            if self.get(peer).is_none() {
                return Err(StatusCode::NOT_FOUND);
            }
            list.push(peer).map_err(|_| StatusCode::DATA_SIZE)?;
        }
        Ok(list)
    }
}

impl PeerManager for BondTable {
    fn peer_ids(&mut self, skip: PeerSkip) -> Result<PeerIdList, StatusCode> {
        let mut ids: PeerIdList = self
            .bonds
            .iter()
            .filter(|b| !b.skipped_by(skip))
            .map(|b| b.peer)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn next_peer_id(&self, after: PeerId) -> PeerId {
        self.bonds
            .iter()
            .map(|b| b.peer)
            .filter(|p| !after.is_valid() || *p > after)
            .min()
            .unwrap_or(PeerId::INVALID)
    }

    fn whitelist_set(&mut self, peers: &[PeerId]) -> StatusCode {
        match self.collect(peers, WHITELIST_MAX_COUNT) {
            Ok(list) => {
                debug!("whitelist: {} peers", list.len());
                self.whitelist = list;
                StatusCode::SUCCESS
            }
            Err(code) => code,
        }
    }

    fn whitelist_get(&self) -> Result<Whitelist, StatusCode> {
        if self.whitelist.is_empty() {
            return Err(StatusCode::NOT_FOUND);
        }
        let mut whitelist = Whitelist::default();
        for record in self.whitelist.iter().filter_map(|p| self.get(*p)) {
            if let Some(identity) = record.identity {
                let _ = whitelist.addrs.push(identity);
            }
            if let Some(irk) = record.irk {
                let _ = whitelist.irks.push(irk);
            }
        }
        Ok(whitelist)
    }

    fn device_identities_set(&mut self, peers: &[PeerId]) -> StatusCode {
        match self.collect(peers, DEVICE_IDENTITIES_MAX_COUNT) {
            Ok(list) => {
                self.identities = list;
                StatusCode::SUCCESS
            }
            Err(code) => code,
        }
    }

    fn bonding_data(&self, peer: PeerId) -> Result<BondingData, StatusCode> {
        let record = self.get(peer).ok_or(StatusCode::NOT_FOUND)?;
        let identity = record.identity.ok_or(StatusCode::NOT_FOUND)?;
        Ok(BondingData {
            identity,
            irk: record.irk,
        })
    }

    fn peer_delete(&mut self, peer: PeerId) -> StatusCode {
        if self.get(peer).is_none() {
            return StatusCode::INVALID_PARAM;
        }
        self.forget(peer);
        self.dirty = true;
        self.queue(PeerEvent::PeerDeleteSucceeded { peer });
        StatusCode::SUCCESS
    }

    fn peers_delete(&mut self) -> StatusCode {
        self.bonds.clear();
        self.whitelist.clear();
        self.identities.clear();
        self.dirty = true;
        self.queue(PeerEvent::PeersDeleteSucceeded);
        StatusCode::SUCCESS
    }

    fn take_event(&mut self) -> Option<PeerEvent> {
        BondTable::take_event(self)
    }
}
