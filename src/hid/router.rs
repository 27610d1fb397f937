//! Report id → HID service slot routing.

use super::descriptor::{ReportLayout, COMPOSITE_REPORT_DESCRIPTOR};
use super::{
    lookup_slot, HidsEvent, InputSlot, OutputSlot, ProtocolMode, ReportMapTable,
    DEFAULT_REPORT_MAP,
};
use crate::ble::connection::ConnHandle;
use crate::ble::stack::BleStack;
use crate::config::BOOT_KEYBOARD_REPORT_LEN;
use crate::error::{check, CallSite, Error, StatusCode};

/// Receives raw HID output reports written by the host.
pub type RawOutputHandler = fn(&[u8]);

pub struct HidRouter {
    table: ReportMapTable,
    report_descriptor: &'static [u8],
    protocol_mode: ProtocolMode,
    led_state: u8,
    raw_handler: Option<RawOutputHandler>,
}

impl Default for HidRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl HidRouter {
    pub const fn new() -> Self {
        Self::with_report_map(DEFAULT_REPORT_MAP)
    }

    /// Router over a custom lookup table. `None` entries disable their id.
    pub const fn with_report_map(table: ReportMapTable) -> Self {
        Self::with_descriptor(table, COMPOSITE_REPORT_DESCRIPTOR)
    }

    /// Router over a custom lookup table and report map.
    pub const fn with_descriptor(table: ReportMapTable, descriptor: &'static [u8]) -> Self {
        Self {
            table,
            report_descriptor: descriptor,
            protocol_mode: ProtocolMode::Report,
            led_state: 0,
            raw_handler: None,
        }
    }

    /// Report map exposed by the HID service.
    pub fn report_descriptor(&self) -> &'static [u8] {
        self.report_descriptor
    }

    /// Parse the report map and check it against the slots.
    ///
    /// Every mapped id needs an Input report that fits its slot, and
    /// output reports must fit their slot. The HID service sizes its
    /// report characteristics from the returned layout.
    pub fn report_layout(&self) -> Result<ReportLayout, Error> {
        let Some(layout) = ReportLayout::parse(self.report_descriptor) else {
            return Err(Error::ReportMap { report_id: 0 });
        };
        for report_id in 0..self.table.len() as u8 {
            let Some(slot) = self.slot(report_id) else {
                continue;
            };
            match layout.input_len(report_id) {
                Some(len) if len <= slot.max_len() => {}
                _ => {
                    warn!(
                        "report id {}: no input report within slot size {}",
                        report_id,
                        slot.max_len()
                    );
                    return Err(Error::ReportMap { report_id });
                }
            }
        }
        for slot in OutputSlot::ALL {
            let report_id = slot.report_id().id();
            if layout.output_len(report_id).is_some_and(|len| len > slot.max_len()) {
                warn!("report id {}: output exceeds slot size {}", report_id, slot.max_len());
                return Err(Error::ReportMap { report_id });
            }
        }
        Ok(layout)
    }

    pub fn slot(&self, report_id: u8) -> Option<InputSlot> {
        lookup_slot(&self.table, report_id)
    }

    pub fn protocol_mode(&self) -> ProtocolMode {
        self.protocol_mode
    }

    /// Keyboard LED bitmap last written by the host.
    pub fn led_state(&self) -> u8 {
        self.led_state
    }

    /// Install the raw output handler, returning the one it replaces.
    /// There is a single subscriber; `None` removes it.
    pub fn register_raw_output_handler(
        &mut self,
        handler: Option<RawOutputHandler>,
    ) -> Option<RawOutputHandler> {
        core::mem::replace(&mut self.raw_handler, handler)
    }

    /// Send an input report.
    ///
    /// `Ok(false)` means the report was not sent: the id is unmapped or
    /// disabled, the payload does not fit the slot, or the stack ran out
    /// of notification buffers (retry later). `Ok(true)` covers both a
    /// sent report and a transient state where retrying is pointless.
    pub fn send_report<S: BleStack>(
        &self,
        stack: &mut S,
        handle: ConnHandle,
        report_id: u8,
        payload: &[u8],
    ) -> Result<bool, Error> {
        let Some(slot) = self.slot(report_id) else {
            debug!("report id {} is not mapped", report_id);
            return Ok(false);
        };
        if payload.len() > slot.max_len() {
            warn!(
                "report id {}: {} bytes exceed slot size {}",
                report_id,
                payload.len(),
                slot.max_len()
            );
            return Ok(false);
        }

        let code = match self.protocol_mode {
            ProtocolMode::Boot if slot == InputSlot::Keyboard => {
                let len = payload.len().min(BOOT_KEYBOARD_REPORT_LEN);
                stack.hid_boot_keyboard_send(handle, &payload[..len])
            }
            // Boot hosts only understand the keyboard report.
            ProtocolMode::Boot => return Ok(true),
            ProtocolMode::Report => stack.hid_input_report_send(handle, slot, payload),
        };

        if code == StatusCode::RESOURCES {
            trace!("report id {}: no TX buffers", report_id);
            return Ok(false);
        }
        check(CallSite::SendReport, code)?;
        Ok(true)
    }

    pub fn on_hids_event(&mut self, event: &HidsEvent) {
        match event {
            HidsEvent::BootModeEntered => {
                info!("HID: boot protocol");
                self.protocol_mode = ProtocolMode::Boot;
            }
            HidsEvent::ReportModeEntered => {
                info!("HID: report protocol");
                self.protocol_mode = ProtocolMode::Report;
            }
            HidsEvent::OutputReportWritten { slot, data } => match slot {
                OutputSlot::KeyboardLeds => {
                    if let Some(&leds) = data.first() {
                        debug!("HID: LED state {=u8:#04x}", leds);
                        self.led_state = leds;
                    }
                }
                OutputSlot::Raw => match self.raw_handler {
                    Some(handler) => handler(data),
                    None => debug!("HID: raw output dropped, no handler"),
                },
            },
            HidsEvent::NotificationsEnabled => {}
        }
    }
}
