//! Application-wide constants and compile-time configuration.
//!
//! All GAP, advertising, security and HID parameters live here so they
//! can be tuned in one place. Runtime settings that the firmware may
//! change before init (device name, channel, whitelist) are grouped in
//! [`LinkSettings`].

use core::fmt::Write;
use heapless::String;

// GAP

/// Default device name, included in the advertising data.
pub const DEVICE_NAME: &str = "hidlink";

/// Maximum length of the base device name.
pub const DEVICE_NAME_MAX_LEN: usize = 32;

/// Base name plus `" - NN"` channel suffix.
pub const ADVERTISED_NAME_MAX_LEN: usize = DEVICE_NAME_MAX_LEN + 6;

/// Manufacturer, exposed through the Device Information Service.
pub const MANUFACTURER_NAME: &str = "hidlink contributors";

/// GAP appearance: HID keyboard.
pub const APPEARANCE_HID_KEYBOARD: u16 = 0x03C1;

/// Channel value meaning "no channel selected".
pub const CHANNEL_UNSET: u8 = 0xFF;

/// PnP ID - vendor id source (0x02 = USB Implementer's Forum).
pub const PNP_ID_VENDOR_ID_SOURCE: u8 = 0x02;
/// PnP ID - the "pid.codes" open-source test VID.
/// Replace with your own allocated VID/PID for production.
pub const PNP_ID_VENDOR_ID: u16 = 0x1209;
pub const PNP_ID_PRODUCT_ID: u16 = 0x0001;
pub const PNP_ID_PRODUCT_VERSION: u16 = 0x0001;

// Advertising

/// Fast advertising interval (0.625 ms units). 0x28 = 25 ms.
pub const ADV_FAST_INTERVAL: u32 = 0x0028;

/// Slow advertising interval (0.625 ms units). 0x0C80 = 2 s.
pub const ADV_SLOW_INTERVAL: u32 = 0x0C80;

/// Time spent in fast advertising (10 ms units). 3000 = 30 s.
pub const ADV_FAST_TIMEOUT: u16 = 3000;

/// Time spent in slow advertising after fast advertising ends (10 ms units).
pub const ADV_SLOW_TIMEOUT: u16 = 1;

/// Low duty cycle directed advertising interval (0.625 ms units).
pub const ADV_DIRECTED_INTERVAL: u32 = 0;

/// Low duty cycle directed advertising timeout (10 ms units).
pub const ADV_DIRECTED_TIMEOUT: u16 = 0;

/// High duty cycle directed advertising is capped at 1.28 s by the core spec.
pub const ADV_DIRECTED_HIGH_DUTY_TIMEOUT: u16 = 128;

/// Maximum number of whitelist entries (addresses and IRKs each).
pub const WHITELIST_MAX_COUNT: usize = 8;

/// Maximum number of device identities handed to the stack.
pub const DEVICE_IDENTITIES_MAX_COUNT: usize = 8;

// Connection parameters

/// Connection parameters in SoftDevice units.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnParams {
    /// Interval range (1.25 ms units).
    pub min_interval: u16,
    pub max_interval: u16,
    /// Connection events the peripheral may skip.
    pub slave_latency: u16,
    /// Supervision timeout (10 ms units).
    pub sup_timeout: u16,
}

/// Preferred parameters: 7.5 ms interval, latency 6, 430 ms supervision timeout.
pub const PREFERRED_CONN_PARAMS: ConnParams = ConnParams {
    min_interval: 6,
    max_interval: 6,
    slave_latency: 6,
    sup_timeout: 43,
};

/// Delay after connecting before the peripheral asks for its preferred
/// connection parameters (ms).
pub const FIRST_CONN_PARAMS_UPDATE_DELAY_MS: u64 = 5_000;

// Security

/// Accept bonding requests from centrals.
pub const SEC_PARAM_BOND: bool = true;

/// Length of a pairing passkey (ASCII digits).
pub const PASSKEY_LEN: usize = 6;

// HID service

/// HID specification version implemented (bcdHID).
pub const BASE_USB_HID_SPEC_VERSION: u16 = 0x0101;

pub const INPUT_REPORT_LEN_KEYBOARD: usize = 29;
pub const OUTPUT_REPORT_LEN_KEYBOARD: usize = 1;
pub const INPUT_REPORT_LEN_MOUSE: usize = 5;
pub const INPUT_REPORT_LEN_SYSTEM: usize = 1;
pub const INPUT_REPORT_LEN_CONSUMER: usize = 8;
pub const INPUT_REPORT_LEN_RAW: usize = 200;
pub const OUTPUT_REPORT_LEN_RAW: usize = 200;

/// Boot protocol keyboard input report length.
pub const BOOT_KEYBOARD_REPORT_LEN: usize = 8;

/// Length of the connected peer's device name buffer.
pub const PEER_NAME_MAX_LEN: usize = 32;

/// Battery level reported before the first measurement (percent).
pub const INITIAL_BATTERY_LEVEL: u8 = 100;

// Blocking operations

/// Run-loop steps a blocking call waits for its completion event.
pub const BLOCKING_WAIT_MAX_STEPS: u32 = 10_000;

/// Upper bound for asynchronous completions on the target (ms).
pub const BLOCKING_WAIT_TIMEOUT_MS: u64 = 5_000;

// Paired-device storage

/// Maximum number of bonded peers kept in the bond table.
pub const MAX_PEERS: usize = 8;

/// GATT system attributes (CCCD values) kept per bonded peer.
pub const SYS_ATTRS_MAX_LEN: usize = 62;

/// Flash page index where bond storage starts (4 KB per page on nRF52840).
pub const STORAGE_FLASH_PAGE_START: u32 = 240;

/// Number of flash pages reserved for bond storage.
pub const STORAGE_FLASH_PAGE_COUNT: u32 = 4;

/// Delay before a failed bond table write is retried (ms).
pub const STORAGE_RETRY_DELAY_MS: u64 = 1_000;

/// Runtime link settings, applied before the BLE stack is initialised.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkSettings {
    name: String<DEVICE_NAME_MAX_LEN>,
    channel: u8,
    whitelist: bool,
}

impl Default for LinkSettings {
    fn default() -> Self {
        let mut settings = Self {
            name: String::new(),
            channel: CHANNEL_UNSET,
            whitelist: false,
        };
        settings.set_device_name(DEVICE_NAME);
        settings
    }
}

impl LinkSettings {
    /// Set the base device name. Names longer than
    /// [`DEVICE_NAME_MAX_LEN`] bytes are truncated on a char boundary.
    pub fn set_device_name(&mut self, name: &str) {
        self.name.clear();
        for c in name.chars() {
            if self.name.push(c).is_err() {
                break;
            }
        }
    }

    pub fn device_name(&self) -> &str {
        self.name.as_str()
    }

    pub fn set_channel(&mut self, channel: u8) {
        self.channel = channel;
    }

    /// Selected channel, `None` while unset.
    pub fn channel(&self) -> Option<u8> {
        (self.channel != CHANNEL_UNSET).then_some(self.channel)
    }

    /// Raw channel byte as written into the GAP address.
    pub fn channel_byte(&self) -> u8 {
        self.channel
    }

    pub fn set_whitelist(&mut self, active: bool) {
        self.whitelist = active;
    }

    pub fn whitelist(&self) -> bool {
        self.whitelist
    }

    /// Name used in GAP and advertising data: `"<name> - <channel + 1>"`,
    /// or the bare name while no channel is selected.
    pub fn advertised_name(&self) -> String<ADVERTISED_NAME_MAX_LEN> {
        let mut out = String::new();
        // Capacity covers the longest name plus suffix.
        let _ = out.push_str(self.name.as_str());
        if let Some(channel) = self.channel() {
            let _ = write!(&mut out, " - {}", u16::from(channel) + 1);
        }
        out
    }
}
