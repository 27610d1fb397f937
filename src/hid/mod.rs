//! HID report routing between the application and the HID-over-GATT service.
//!
//! Outbound reports are addressed by their report id (as declared in the
//! report map) and resolved to an input report slot of the HID service.
//! Inbound output report writes are identified by their output slot.

pub mod descriptor;
pub mod router;

#[cfg(test)]
mod tests;

use heapless::Vec;

use crate::config::{
    INPUT_REPORT_LEN_CONSUMER, INPUT_REPORT_LEN_KEYBOARD, INPUT_REPORT_LEN_MOUSE,
    INPUT_REPORT_LEN_RAW, INPUT_REPORT_LEN_SYSTEM, OUTPUT_REPORT_LEN_KEYBOARD,
    OUTPUT_REPORT_LEN_RAW,
};

pub use router::{HidRouter, RawOutputHandler};

/// Report ids declared by the composite report map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ReportId {
    Keyboard = 1,
    Mouse = 2,
    Consumer = 3,
    System = 4,
    Raw = 5,
}

impl ReportId {
    pub const fn id(self) -> u8 {
        self as u8
    }
}

/// Input report characteristics of the HID service, in registration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InputSlot {
    Keyboard,
    Mouse,
    Consumer,
    System,
    Raw,
}

impl InputSlot {
    pub const ALL: [InputSlot; 5] = [
        InputSlot::Keyboard,
        InputSlot::Mouse,
        InputSlot::Consumer,
        InputSlot::System,
        InputSlot::Raw,
    ];

    /// Characteristic index inside the HID service.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Report id carried in the Report Reference descriptor.
    pub const fn report_id(self) -> ReportId {
        match self {
            InputSlot::Keyboard => ReportId::Keyboard,
            InputSlot::Mouse => ReportId::Mouse,
            InputSlot::Consumer => ReportId::Consumer,
            InputSlot::System => ReportId::System,
            InputSlot::Raw => ReportId::Raw,
        }
    }

    /// Characteristic value length in bytes.
    pub const fn max_len(self) -> usize {
        match self {
            InputSlot::Keyboard => INPUT_REPORT_LEN_KEYBOARD,
            InputSlot::Mouse => INPUT_REPORT_LEN_MOUSE,
            InputSlot::Consumer => INPUT_REPORT_LEN_CONSUMER,
            InputSlot::System => INPUT_REPORT_LEN_SYSTEM,
            InputSlot::Raw => INPUT_REPORT_LEN_RAW,
        }
    }
}

/// Output report characteristics of the HID service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OutputSlot {
    /// Keyboard LED state (Num/Caps/Scroll Lock...).
    KeyboardLeds,
    /// Vendor-defined raw HID output.
    Raw,
}

impl OutputSlot {
    pub const ALL: [OutputSlot; 2] = [OutputSlot::KeyboardLeds, OutputSlot::Raw];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn report_id(self) -> ReportId {
        match self {
            OutputSlot::KeyboardLeds => ReportId::Keyboard,
            OutputSlot::Raw => ReportId::Raw,
        }
    }

    pub const fn max_len(self) -> usize {
        match self {
            OutputSlot::KeyboardLeds => OUTPUT_REPORT_LEN_KEYBOARD,
            OutputSlot::Raw => OUTPUT_REPORT_LEN_RAW,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// Number of entries in the report id lookup table.
pub const REPORT_MAP_LEN: usize = 6;

/// Report id → input slot. Id 0 is reserved by the HID spec and disabled.
pub type ReportMapTable = [Option<InputSlot>; REPORT_MAP_LEN];

/// Default lookup table for [`descriptor::COMPOSITE_REPORT_DESCRIPTOR`].
pub const DEFAULT_REPORT_MAP: ReportMapTable = [
    None,
    Some(InputSlot::Keyboard),
    Some(InputSlot::Mouse),
    Some(InputSlot::Consumer),
    Some(InputSlot::System),
    Some(InputSlot::Raw),
];

/// Resolve a report id in `table`. Out-of-range and disabled ids yield `None`.
pub fn lookup_slot(table: &ReportMapTable, report_id: u8) -> Option<InputSlot> {
    table.get(usize::from(report_id)).copied().flatten()
}

/// Protocol mode selected by the host through the Protocol Mode characteristic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolMode {
    Boot,
    #[default]
    Report,
}

/// Events raised by the HID service.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HidsEvent {
    BootModeEntered,
    ReportModeEntered,
    /// The host wrote an output report characteristic.
    OutputReportWritten {
        slot: OutputSlot,
        data: Vec<u8, OUTPUT_REPORT_LEN_RAW>,
    },
    NotificationsEnabled,
}
