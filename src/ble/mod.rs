//! Bluetooth Low Energy peripheral link.
//!
//! The link runs in the **Peripheral** role on the Nordic SoftDevice S140:
//!
//! 1. **Connection** - single-link state and the stack event dispatcher.
//! 2. **Advertising** - advertising flags and the mode sequencer.
//! 3. **Peer** - bonded peer identity and security procedure tracking,
//!    backed by the [`bond::BondTable`].
//! 4. **Device** - [`device::BleDevice`] owns all of the above and
//!    performs the stack calls the transitions ask for.
//!
//! Stack and peer store are reached through the traits in [`stack`], so
//! everything here runs on the host against [`testing`] fakes.

pub mod advertising;
pub mod bond;
pub mod connection;
pub mod device;
pub mod peer;
pub mod stack;
pub mod testing;

use crate::hid::HidsEvent;

pub use advertising::{AdvEvent, AdvMode, AdvSequencer, AdvSettings, AdvState};
pub use bond::BondTable;
pub use connection::{BleAddress, ConnHandle, ConnectionState, StackEvent};
pub use device::{BleDevice, LinkStatus, WaitBudget};
pub use peer::{PeerEvent, PeerId, PeerState, SecurityProcedure, SecurityTracker};
pub use stack::{BleStack, EventSource, PeerManager};

/// Everything the dispatcher consumes.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BleEvent {
    Stack(StackEvent),
    Adv(AdvEvent),
    Peer(PeerEvent),
    Hids(HidsEvent),
}

impl From<StackEvent> for BleEvent {
    fn from(event: StackEvent) -> Self {
        BleEvent::Stack(event)
    }
}

impl From<AdvEvent> for BleEvent {
    fn from(event: AdvEvent) -> Self {
        BleEvent::Adv(event)
    }
}

impl From<PeerEvent> for BleEvent {
    fn from(event: PeerEvent) -> Self {
        BleEvent::Peer(event)
    }
}

impl From<HidsEvent> for BleEvent {
    fn from(event: HidsEvent) -> Self {
        BleEvent::Hids(event)
    }
}
