//! Composite HID report descriptor and a small report layout parser.
//!
//! ## Report map
//!
//! | Id | Report   | Input | Output |
//! |----|----------|-------|--------|
//! | 1  | Keyboard | 29    | 1      |
//! | 2  | Mouse    | 5     | -      |
//! | 3  | Consumer | 8     | -      |
//! | 4  | System   | 1     | -      |
//! | 5  | Raw      | 200   | 200    |
//!
//! The keyboard input report is NKRO: one modifier byte followed by a
//! 224-bit key bitmap (usages 0x00-0xDF).
//!
//! ## Parsing
//!
//! [`ReportLayout::parse`] walks the short items of a descriptor and sums
//! the Input/Output bit sizes per report id.
//! [`HidRouter::report_layout`](super::HidRouter::report_layout) checks
//! the result against the report slots, and the HID service sizes its
//! report characteristics from it. Long items, Push/Pop and Delimiter are
//! not supported.

use heapless::Vec;

/// Maximum number of distinct report ids tracked by [`ReportLayout`].
pub const MAX_REPORTS: usize = 8;

pub const COMPOSITE_REPORT_DESCRIPTOR: &[u8] = &[
    // - Keyboard (id 1) -
    0x05, 0x01, // Usage Page (Generic Desktop)
    0x09, 0x06, // Usage (Keyboard)
    0xA1, 0x01, // Collection (Application)
    0x85, 0x01, //   Report ID (1)
    0x05, 0x07, //   Usage Page (Keyboard/Keypad)
    0x19, 0xE0, //   Usage Minimum (Left Control)
    0x29, 0xE7, //   Usage Maximum (Right GUI)
    0x15, 0x00, //   Logical Minimum (0)
    0x25, 0x01, //   Logical Maximum (1)
    0x75, 0x01, //   Report Size (1)
    0x95, 0x08, //   Report Count (8)
    0x81, 0x02, //   Input (Data, Variable, Absolute)
    0x19, 0x00, //   Usage Minimum (0)
    0x29, 0xDF, //   Usage Maximum (0xDF)
    0x95, 0xE0, //   Report Count (224)
    0x81, 0x02, //   Input (Data, Variable, Absolute) - key bitmap
    0x05, 0x08, //   Usage Page (LEDs)
    0x19, 0x01, //   Usage Minimum (Num Lock)
    0x29, 0x05, //   Usage Maximum (Kana)
    0x95, 0x05, //   Report Count (5)
    0x75, 0x01, //   Report Size (1)
    0x91, 0x02, //   Output (Data, Variable, Absolute)
    0x95, 0x01, //   Report Count (1)
    0x75, 0x03, //   Report Size (3)
    0x91, 0x01, //   Output (Constant) - padding
    0xC0, // End Collection
    //
    // - Mouse (id 2) -
    0x05, 0x01, // Usage Page (Generic Desktop)
    0x09, 0x02, // Usage (Mouse)
    0xA1, 0x01, // Collection (Application)
    0x85, 0x02, //   Report ID (2)
    0x09, 0x01, //   Usage (Pointer)
    0xA1, 0x00, //   Collection (Physical)
    0x05, 0x09, //     Usage Page (Button)
    0x19, 0x01, //     Usage Minimum (1)
    0x29, 0x08, //     Usage Maximum (8)
    0x15, 0x00, //     Logical Minimum (0)
    0x25, 0x01, //     Logical Maximum (1)
    0x95, 0x08, //     Report Count (8)
    0x75, 0x01, //     Report Size (1)
    0x81, 0x02, //     Input (Data, Variable, Absolute)
    0x05, 0x01, //     Usage Page (Generic Desktop)
    0x09, 0x30, //     Usage (X)
    0x09, 0x31, //     Usage (Y)
    0x09, 0x38, //     Usage (Wheel)
    0x15, 0x81, //     Logical Minimum (-127)
    0x25, 0x7F, //     Logical Maximum (127)
    0x75, 0x08, //     Report Size (8)
    0x95, 0x03, //     Report Count (3)
    0x81, 0x06, //     Input (Data, Variable, Relative)
    0x05, 0x0C, //     Usage Page (Consumer)
    0x0A, 0x38, 0x02, // Usage (AC Pan)
    0x95, 0x01, //     Report Count (1)
    0x81, 0x06, //     Input (Data, Variable, Relative)
    0xC0, //   End Collection
    0xC0, // End Collection
    //
    // - Consumer control (id 3) -
    0x05, 0x0C, // Usage Page (Consumer)
    0x09, 0x01, // Usage (Consumer Control)
    0xA1, 0x01, // Collection (Application)
    0x85, 0x03, //   Report ID (3)
    0x15, 0x00, //   Logical Minimum (0)
    0x26, 0xFF, 0x03, // Logical Maximum (0x3FF)
    0x19, 0x00, //   Usage Minimum (0)
    0x2A, 0xFF, 0x03, // Usage Maximum (0x3FF)
    0x75, 0x10, //   Report Size (16)
    0x95, 0x04, //   Report Count (4)
    0x81, 0x00, //   Input (Data, Array)
    0xC0, // End Collection
    //
    // - System control (id 4) -
    0x05, 0x01, // Usage Page (Generic Desktop)
    0x09, 0x80, // Usage (System Control)
    0xA1, 0x01, // Collection (Application)
    0x85, 0x04, //   Report ID (4)
    0x15, 0x01, //   Logical Minimum (1)
    0x26, 0xB7, 0x00, // Logical Maximum (0xB7)
    0x19, 0x01, //   Usage Minimum (1)
    0x2A, 0xB7, 0x00, // Usage Maximum (0xB7)
    0x75, 0x08, //   Report Size (8)
    0x95, 0x01, //   Report Count (1)
    0x81, 0x00, //   Input (Data, Array)
    0xC0, // End Collection
    //
    // - Raw vendor (id 5) -
    0x06, 0x00, 0xFF, // Usage Page (Vendor 0xFF00)
    0x09, 0x01, // Usage (1)
    0xA1, 0x01, // Collection (Application)
    0x85, 0x05, //   Report ID (5)
    0x15, 0x00, //   Logical Minimum (0)
    0x26, 0xFF, 0x00, // Logical Maximum (255)
    0x75, 0x08, //   Report Size (8)
    0x95, 0xC8, //   Report Count (200)
    0x09, 0x01, //   Usage (1)
    0x81, 0x02, //   Input (Data, Variable, Absolute)
    0x95, 0xC8, //   Report Count (200)
    0x09, 0x02, //   Usage (2)
    0x91, 0x02, //   Output (Data, Variable, Absolute)
    0xC0, // End Collection
];

/// Input/output size of one report id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReportSizes {
    pub report_id: u8,
    pub input_bits: u32,
    pub output_bits: u32,
}

impl ReportSizes {
    pub fn input_len(&self) -> usize {
        bits_to_bytes(self.input_bits)
    }

    pub fn output_len(&self) -> usize {
        bits_to_bytes(self.output_bits)
    }
}

fn bits_to_bytes(bits: u32) -> usize {
    bits.div_ceil(8) as usize
}

/// Per-report-id sizes found in a report descriptor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReportLayout {
    reports: Vec<ReportSizes, MAX_REPORTS>,
}

impl ReportLayout {
    /// Parse a HID report descriptor.
    ///
    /// Returns `None` when the descriptor declares no Input or Output
    /// item, is truncated mid-item, or uses more than [`MAX_REPORTS`]
    /// report ids.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut layout = ReportLayout::default();

        // Global state.
        let mut report_id: u8 = 0;
        let mut report_size: u32 = 0;
        let mut report_count: u32 = 0;

        let mut i = 0;
        while i < data.len() {
            let prefix = data[i];
            if prefix == 0xFE {
                debug!("HID descriptor: long items are not supported");
                return None;
            }
            let tag = (prefix >> 4) & 0x0F;
            let item_type = (prefix >> 2) & 0x03;
            let size = match prefix & 0x03 {
                0 => 0,
                1 => 1,
                2 => 2,
                _ => 4,
            };

            if i + 1 + size > data.len() {
                debug!("HID descriptor: truncated item at {}", i);
                return None;
            }

            let value: u32 = match size {
                0 => 0,
                1 => u32::from(data[i + 1]),
                2 => u32::from(u16::from_le_bytes([data[i + 1], data[i + 2]])),
                _ => u32::from_le_bytes([data[i + 1], data[i + 2], data[i + 3], data[i + 4]]),
            };

            match (item_type, tag) {
                // Main: Input
                (0, 0x08) => {
                    layout.entry(report_id)?.input_bits += report_size * report_count;
                }
                // Main: Output
                (0, 0x09) => {
                    layout.entry(report_id)?.output_bits += report_size * report_count;
                }
                // Global: Report Size
                (1, 0x07) => report_size = value,
                // Global: Report ID
                (1, 0x08) => report_id = value as u8,
                // Global: Report Count
                (1, 0x09) => report_count = value,
                _ => {}
            }

            i += 1 + size;
        }

        if layout.reports.is_empty() {
            debug!("HID descriptor: no input or output items");
            None
        } else {
            Some(layout)
        }
    }

    fn entry(&mut self, report_id: u8) -> Option<&mut ReportSizes> {
        let pos = match self.reports.iter().position(|r| r.report_id == report_id) {
            Some(pos) => pos,
            None => {
                self.reports
                    .push(ReportSizes {
                        report_id,
                        input_bits: 0,
                        output_bits: 0,
                    })
                    .ok()?;
                self.reports.len() - 1
            }
        };
        self.reports.get_mut(pos)
    }

    pub fn report(&self, report_id: u8) -> Option<&ReportSizes> {
        self.reports.iter().find(|r| r.report_id == report_id)
    }

    /// Input report length in bytes, `None` when the id has no input.
    pub fn input_len(&self, report_id: u8) -> Option<usize> {
        self.report(report_id)
            .map(ReportSizes::input_len)
            .filter(|&len| len > 0)
    }

    /// Output report length in bytes, `None` when the id has no output.
    pub fn output_len(&self, report_id: u8) -> Option<usize> {
        self.report(report_id)
            .map(ReportSizes::output_len)
            .filter(|&len| len > 0)
    }

    pub fn reports(&self) -> &[ReportSizes] {
        &self.reports
    }
}
