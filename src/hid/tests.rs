//! Unit tests for report routing and the report descriptor.
//!
//! These tests run on the host against the recording stack in
//! [`crate::ble::testing`].

use core::sync::atomic::{AtomicUsize, Ordering};

use heapless::Vec;

use super::descriptor::{ReportLayout, COMPOSITE_REPORT_DESCRIPTOR};
use super::*;
use crate::ble::connection::ConnHandle;
use crate::ble::testing::{FakeStack, StackCall};
use crate::config::*;
use crate::error::{CallSite, Error, StatusCode};

const HANDLE: ConnHandle = ConnHandle(1);

fn output(slot: OutputSlot, bytes: &[u8]) -> HidsEvent {
    let mut data = Vec::new();
    data.extend_from_slice(bytes).unwrap();
    HidsEvent::OutputReportWritten { slot, data }
}

// ═══════════════════════════════════════════════════════════════════════════
// Report Id Lookup
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn default_map_routes_every_report_id() {
    let router = HidRouter::new();
    for slot in InputSlot::ALL {
        assert_eq!(router.slot(slot.report_id().id()), Some(slot));
    }
}

#[test]
fn report_id_zero_and_out_of_range_are_unmapped() {
    let router = HidRouter::new();
    assert_eq!(router.slot(0), None);
    assert_eq!(router.slot(REPORT_MAP_LEN as u8), None);
    assert_eq!(router.slot(0xFF), None);
}

#[test]
fn unmapped_id_is_not_sent() {
    let router = HidRouter::new();
    let mut stack = FakeStack::new();
    assert_eq!(router.send_report(&mut stack, HANDLE, 9, &[1, 2, 3]), Ok(false));
    assert!(stack.calls.is_empty());
}

#[test]
fn disabled_slot_is_not_sent() {
    let mut table = DEFAULT_REPORT_MAP;
    table[ReportId::Consumer.id() as usize] = None;
    let router = HidRouter::with_report_map(table);
    let mut stack = FakeStack::new();

    assert_eq!(router.send_report(&mut stack, HANDLE, 3, &[0; 8]), Ok(false));
    assert_eq!(router.send_report(&mut stack, HANDLE, 2, &[0; 5]), Ok(true));
    assert_eq!(stack.calls.len(), 1);
}

#[test]
fn remapped_id_reaches_other_slot() {
    let mut table = DEFAULT_REPORT_MAP;
    table[1] = Some(InputSlot::Mouse);
    let router = HidRouter::with_report_map(table);
    let mut stack = FakeStack::new();

    router.send_report(&mut stack, HANDLE, 1, &[0; 5]).unwrap();
    assert_eq!(
        stack.last(),
        Some(&StackCall::InputReport {
            handle: HANDLE,
            slot: InputSlot::Mouse,
            len: 5
        })
    );
}

// ═══════════════════════════════════════════════════════════════════════════
// Report Sending
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn report_mode_sends_to_slot() {
    let router = HidRouter::new();
    let mut stack = FakeStack::new();
    let keys = [0u8; INPUT_REPORT_LEN_KEYBOARD];

    assert_eq!(router.send_report(&mut stack, HANDLE, 1, &keys), Ok(true));
    assert_eq!(
        stack.last(),
        Some(&StackCall::InputReport {
            handle: HANDLE,
            slot: InputSlot::Keyboard,
            len: INPUT_REPORT_LEN_KEYBOARD
        })
    );
}

#[test]
fn oversized_payload_is_rejected() {
    let router = HidRouter::new();
    let mut stack = FakeStack::new();
    assert_eq!(
        router.send_report(&mut stack, HANDLE, 4, &[0; INPUT_REPORT_LEN_SYSTEM + 1]),
        Ok(false)
    );
    assert!(stack.calls.is_empty());
}

#[test]
fn out_of_buffers_asks_for_retry() {
    let router = HidRouter::new();
    let mut stack = FakeStack::new();
    stack.report_status = StatusCode::RESOURCES;
    assert_eq!(router.send_report(&mut stack, HANDLE, 2, &[0; 5]), Ok(false));
}

#[test]
fn transient_link_states_count_as_sent() {
    let router = HidRouter::new();
    let mut stack = FakeStack::new();
    for code in [
        StatusCode::INVALID_STATE,
        StatusCode::BUSY,
        StatusCode::BLE_GATTS_SYS_ATTR_MISSING,
        StatusCode::FORBIDDEN,
    ] {
        stack.report_status = code;
        assert_eq!(router.send_report(&mut stack, HANDLE, 2, &[0; 5]), Ok(true));
    }
}

#[test]
fn unexpected_status_is_fatal() {
    let router = HidRouter::new();
    let mut stack = FakeStack::new();
    stack.report_status = StatusCode::BLE_INVALID_CONN_HANDLE;
    assert_eq!(
        router.send_report(&mut stack, HANDLE, 2, &[0; 5]),
        Err(Error::Fatal {
            site: CallSite::SendReport,
            code: StatusCode::BLE_INVALID_CONN_HANDLE
        })
    );
}

// ═══════════════════════════════════════════════════════════════════════════
// Protocol Mode
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn boot_mode_sends_keyboard_to_boot_characteristic() {
    let mut router = HidRouter::new();
    router.on_hids_event(&HidsEvent::BootModeEntered);
    assert_eq!(router.protocol_mode(), ProtocolMode::Boot);

    let mut stack = FakeStack::new();
    let keys = [0u8; INPUT_REPORT_LEN_KEYBOARD];
    assert_eq!(router.send_report(&mut stack, HANDLE, 1, &keys), Ok(true));
    assert_eq!(
        stack.last(),
        Some(&StackCall::BootKeyboard {
            handle: HANDLE,
            len: BOOT_KEYBOARD_REPORT_LEN
        })
    );
}

#[test]
fn boot_mode_swallows_other_reports() {
    let mut router = HidRouter::new();
    router.on_hids_event(&HidsEvent::BootModeEntered);
    let mut stack = FakeStack::new();

    assert_eq!(router.send_report(&mut stack, HANDLE, 2, &[0; 5]), Ok(true));
    assert_eq!(router.send_report(&mut stack, HANDLE, 5, &[0; 16]), Ok(true));
    assert!(stack.calls.is_empty());
}

#[test]
fn report_mode_restored() {
    let mut router = HidRouter::new();
    router.on_hids_event(&HidsEvent::BootModeEntered);
    router.on_hids_event(&HidsEvent::ReportModeEntered);
    assert_eq!(router.protocol_mode(), ProtocolMode::Report);
}

// ═══════════════════════════════════════════════════════════════════════════
// Output Reports
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn led_output_updates_state() {
    let mut router = HidRouter::new();
    router.on_hids_event(&output(OutputSlot::KeyboardLeds, &[0x02]));
    assert_eq!(router.led_state(), 0x02);

    // Empty writes leave the state alone.
    router.on_hids_event(&output(OutputSlot::KeyboardLeds, &[]));
    assert_eq!(router.led_state(), 0x02);
}

static RAW_BYTES: AtomicUsize = AtomicUsize::new(0);

fn on_raw(data: &[u8]) {
    RAW_BYTES.fetch_add(data.len(), Ordering::SeqCst);
}

#[test]
fn raw_output_reaches_single_handler() {
    let mut router = HidRouter::new();
    router.on_hids_event(&output(OutputSlot::Raw, &[1, 2, 3]));
    assert_eq!(RAW_BYTES.load(Ordering::SeqCst), 0);

    assert!(router.register_raw_output_handler(Some(on_raw)).is_none());
    router.on_hids_event(&output(OutputSlot::Raw, &[1, 2, 3, 4]));
    assert_eq!(RAW_BYTES.load(Ordering::SeqCst), 4);

    assert!(router.register_raw_output_handler(None).is_some());
    router.on_hids_event(&output(OutputSlot::Raw, &[1]));
    assert_eq!(RAW_BYTES.load(Ordering::SeqCst), 4);
    assert_eq!(router.led_state(), 0);
}

// ═══════════════════════════════════════════════════════════════════════════
// Report Descriptor
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn composite_descriptor_matches_slot_sizes() {
    let layout = ReportLayout::parse(COMPOSITE_REPORT_DESCRIPTOR).unwrap();
    assert_eq!(layout.reports().len(), 5);
    for slot in InputSlot::ALL {
        assert_eq!(layout.input_len(slot.report_id().id()), Some(slot.max_len()));
    }
    for slot in OutputSlot::ALL {
        assert_eq!(layout.output_len(slot.report_id().id()), Some(slot.max_len()));
    }
    assert_eq!(layout.output_len(ReportId::Mouse.id()), None);
}

#[test]
fn default_router_validates_its_report_map() {
    let router = HidRouter::new();
    assert_eq!(router.report_descriptor(), COMPOSITE_REPORT_DESCRIPTOR);
    let layout = router.report_layout().unwrap();
    assert_eq!(layout.input_len(ReportId::Raw.id()), Some(INPUT_REPORT_LEN_RAW));
}

#[test]
fn report_map_missing_a_mapped_id_is_rejected() {
    // Keyboard only, one byte of input.
    static KEYBOARD_ONLY: &[u8] = &[0x85, 0x01, 0x75, 0x08, 0x95, 0x01, 0x81, 0x02];
    let router = HidRouter::with_descriptor(DEFAULT_REPORT_MAP, KEYBOARD_ONLY);
    assert_eq!(router.report_layout(), Err(Error::ReportMap { report_id: 2 }));

    let mut table = [None; REPORT_MAP_LEN];
    table[1] = Some(InputSlot::Keyboard);
    let router = HidRouter::with_descriptor(table, KEYBOARD_ONLY);
    assert_eq!(router.report_layout().unwrap().input_len(1), Some(1));
}

#[test]
fn oversized_report_in_map_is_rejected() {
    // Report id 4 (system) declares 2 bytes for a 1-byte slot.
    static WIDE_SYSTEM: &[u8] = &[0x85, 0x04, 0x75, 0x08, 0x95, 0x02, 0x81, 0x00];
    let mut table = [None; REPORT_MAP_LEN];
    table[4] = Some(InputSlot::System);
    let router = HidRouter::with_descriptor(table, WIDE_SYSTEM);
    assert_eq!(router.report_layout(), Err(Error::ReportMap { report_id: 4 }));

    static GARBAGE: &[u8] = &[0xFE, 0x00];
    let router = HidRouter::with_descriptor(table, GARBAGE);
    assert_eq!(router.report_layout(), Err(Error::ReportMap { report_id: 0 }));
}

#[test]
fn descriptor_without_report_ids_uses_id_zero() {
    // Boot keyboard style: modifiers, reserved, 6 keys.
    let data = [
        0x75, 0x08, // Report Size (8)
        0x95, 0x08, // Report Count (8)
        0x81, 0x00, // Input
    ];
    let layout = ReportLayout::parse(&data).unwrap();
    assert_eq!(layout.input_len(0), Some(BOOT_KEYBOARD_REPORT_LEN));
}

#[test]
fn truncated_descriptor_is_rejected() {
    let data = [0x75, 0x08, 0x96, 0x01];
    assert!(ReportLayout::parse(&data).is_none());
}

#[test]
fn long_item_is_rejected() {
    let data = [0xFE, 0x00, 0x00];
    assert!(ReportLayout::parse(&data).is_none());
}

#[test]
fn descriptor_without_main_items_is_rejected() {
    let data = [0x05, 0x01, 0x09, 0x06];
    assert!(ReportLayout::parse(&data).is_none());
}
