//! SoftDevice S140 bindings for [`BleDevice`].
//!
//! The host-testable device logic is shared between tasks through a
//! critical-section mutex. Stack events reach it through
//! [`EVENT_CHANNEL`]; the dispatcher task is the only consumer.
//!
//! ```text
//!  SoftDevice ──► advertiser / gatt::run ──┐
//!  Bonder (SecurityHandler) ───────────────┼──► EVENT_CHANNEL ──► dispatcher ──► BleDevice
//!  storage task (bond completions) ────────┘
//! ```

pub mod advertiser;
pub mod bonder;
pub mod gatt;
pub mod stack;

use core::cell::RefCell;

use defmt::{error, warn};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{with_timeout, Duration};

use crate::ble::advertising::AdvMode;
use crate::ble::{BleDevice, BleEvent};
use crate::config::BLOCKING_WAIT_TIMEOUT_MS;
use crate::error::{Error, WaitTarget};

use self::bonder::SharedBonds;
use self::stack::SoftDeviceStack;

/// The device as bound on the target.
pub type Device = BleDevice<SoftDeviceStack, SharedBonds>;

/// Pending events for the dispatcher task.
pub static EVENT_CHANNEL: Channel<CriticalSectionRawMutex, BleEvent, 16> = Channel::new();

/// Advertiser control, written by [`SoftDeviceStack`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum AdvCommand {
    Start(AdvMode),
    Stop,
}

pub static ADV_CONTROL: Signal<CriticalSectionRawMutex, AdvCommand> = Signal::new();

/// Raised by the dispatcher whenever a completion flag may have changed.
pub static STATE_CHANGED: Signal<CriticalSectionRawMutex, ()> = Signal::new();

static DEVICE: Mutex<CriticalSectionRawMutex, RefCell<Option<Device>>> =
    Mutex::new(RefCell::new(None));

/// Install the device. Must run before any task touches it.
pub fn install(device: Device) {
    DEVICE.lock(|cell| cell.replace(Some(device)));
}

/// Run `f` with exclusive access to the device.
///
/// Panics when called before [`install`]; that is a startup ordering bug.
pub fn with_device<R>(f: impl FnOnce(&mut Device) -> R) -> R {
    DEVICE.lock(|cell| {
        let mut device = cell.borrow_mut();
        match device.as_mut() {
            Some(device) => f(device),
            None => defmt::panic!("BLE device used before install"),
        }
    })
}

/// Queue an event from interrupt-free context. Dropped with a warning
/// when the dispatcher falls behind.
pub fn post(event: impl Into<BleEvent>) {
    if EVENT_CHANNEL.try_send(event.into()).is_err() {
        warn!("event channel full, event dropped");
    }
}

/// Halt on an error the firmware cannot recover from.
pub fn fatal(err: Error) -> ! {
    error!("fatal: {}", err);
    defmt::panic!("unrecoverable BLE error")
}

/// Apply an operation result, halting on fatal errors.
pub fn or_fatal<T>(result: Result<T, Error>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) if err.is_fatal() => fatal(err),
        Err(err) => {
            warn!("BLE operation failed: {}", err);
            None
        }
    }
}

/// Feed events to the device, one at a time.
#[embassy_executor::task]
pub async fn dispatcher_task() -> ! {
    loop {
        let event = EVENT_CHANNEL.receive().await;
        or_fatal(with_device(|device| device.dispatch(event)));
        STATE_CHANGED.signal(());
    }
}

/// Wait until `done` holds, bounded by [`BLOCKING_WAIT_TIMEOUT_MS`].
pub async fn wait_until(target: WaitTarget, done: fn(&Device) -> bool) -> Result<(), Error> {
    let wait = async {
        while !with_device(|device| done(device)) {
            STATE_CHANGED.wait().await;
        }
    };
    with_timeout(Duration::from_millis(BLOCKING_WAIT_TIMEOUT_MS), wait)
        .await
        .map_err(|_| Error::Timeout(target))
}

/// Disconnect the current link and wait for the Disconnected event.
pub async fn disconnect() -> Result<(), Error> {
    if !with_device(|device| device.request_disconnect()) {
        return Ok(());
    }
    wait_until(WaitTarget::Disconnected, |device| !device.is_connected()).await
}

/// Delete one bonded peer and wait for the store to confirm.
pub async fn delete_peer(peer: crate::ble::PeerId) -> Result<(), Error> {
    if !with_device(|device| device.request_peer_delete(peer))? {
        return Ok(());
    }
    wait_until(WaitTarget::PeerDeleted, |device| device.peer_deleted()).await
}

/// Delete every bonded peer and wait for the store to confirm.
pub async fn delete_all_peers() -> Result<(), Error> {
    with_device(|device| device.request_all_peers_delete())?;
    wait_until(WaitTarget::AllPeersDeleted, |device| {
        device.all_peers_deleted()
    })
    .await
}
