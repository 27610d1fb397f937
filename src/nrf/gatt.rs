//! GATT server: HID, Battery and Device Information services.
//!
//! The HID service is built at runtime with `ServiceBuilder` because its
//! report map comes from the [`HidRouter`](crate::hid::HidRouter) and its
//! input/output characteristics follow [`InputSlot`]/[`OutputSlot`], sized
//! by the parsed [`ReportLayout`].

use defmt::debug;
use heapless::Vec;
use nrf_softdevice::ble::gatt_server::builder::ServiceBuilder;
use nrf_softdevice::ble::gatt_server::characteristic::{Attribute, Metadata, Properties};
use nrf_softdevice::ble::gatt_server::{self, RegisterError, Service, WriteOp};
use nrf_softdevice::ble::{Connection, SecurityMode, Uuid};
use nrf_softdevice::Softdevice;

use crate::config::{
    BASE_USB_HID_SPEC_VERSION, BOOT_KEYBOARD_REPORT_LEN, INITIAL_BATTERY_LEVEL, MANUFACTURER_NAME,
    PNP_ID_PRODUCT_ID, PNP_ID_PRODUCT_VERSION, PNP_ID_VENDOR_ID, PNP_ID_VENDOR_ID_SOURCE,
};
use crate::hid::descriptor::ReportLayout;
use crate::hid::{HidsEvent, InputSlot, OutputSlot};

const SERVICE_HID: u16 = 0x1812;
const SERVICE_DEVICE_INFORMATION: u16 = 0x180A;

const CHAR_HID_INFO: u16 = 0x2A4A;
const CHAR_REPORT_MAP: u16 = 0x2A4B;
const CHAR_HID_CONTROL_POINT: u16 = 0x2A4C;
const CHAR_REPORT: u16 = 0x2A4D;
const CHAR_PROTOCOL_MODE: u16 = 0x2A4E;
const CHAR_BOOT_KEYBOARD_INPUT: u16 = 0x2A22;
const CHAR_BOOT_KEYBOARD_OUTPUT: u16 = 0x2A32;
const CHAR_MANUFACTURER_NAME: u16 = 0x2A29;
const CHAR_PNP_ID: u16 = 0x2A50;
const DESC_REPORT_REFERENCE: u16 = 0x2908;

const REPORT_TYPE_INPUT: u8 = 0x01;
const REPORT_TYPE_OUTPUT: u8 = 0x02;

/// HID Information flags: remote wake, normally connectable.
const HID_INFO_FLAGS: u8 = 0b11;

static ZEROS: [u8; 200] = [0; 200];

#[nrf_softdevice::gatt_service(uuid = "180f")]
pub struct BatteryService {
    #[characteristic(uuid = "2a19", read, notify, security = "justworks")]
    pub battery_level: u8,
}

pub struct DeviceInformationService {
    _manufacturer_name: u16,
    _pnp_id: u16,
}

impl DeviceInformationService {
    pub fn new(sd: &mut Softdevice) -> Result<Self, RegisterError> {
        let mut sb = ServiceBuilder::new(sd, Uuid::new_16(SERVICE_DEVICE_INFORMATION))?;

        let manufacturer_name = sb
            .add_characteristic(
                Uuid::new_16(CHAR_MANUFACTURER_NAME),
                Attribute::new(MANUFACTURER_NAME.as_bytes()).read_security(SecurityMode::Open),
                Metadata::new(Properties::new().read()),
            )?
            .build();

        let vid = PNP_ID_VENDOR_ID.to_le_bytes();
        let pid = PNP_ID_PRODUCT_ID.to_le_bytes();
        let version = PNP_ID_PRODUCT_VERSION.to_le_bytes();
        let pnp_id = [
            PNP_ID_VENDOR_ID_SOURCE,
            vid[0],
            vid[1],
            pid[0],
            pid[1],
            version[0],
            version[1],
        ];
        let pnp_id = sb
            .add_characteristic(
                Uuid::new_16(CHAR_PNP_ID),
                Attribute::new(pnp_id).read_security(SecurityMode::Open),
                Metadata::new(Properties::new().read()),
            )?
            .build();

        sb.build();

        Ok(Self {
            _manufacturer_name: manufacturer_name.value_handle,
            _pnp_id: pnp_id.value_handle,
        })
    }
}

#[derive(Clone, Copy)]
struct InputHandles {
    value: u16,
    cccd: u16,
}

pub struct HidService {
    protocol_mode: u16,
    control_point: u16,
    inputs: [InputHandles; InputSlot::ALL.len()],
    outputs: [u16; OutputSlot::ALL.len()],
    boot_input: InputHandles,
    boot_output: u16,
}

impl HidService {
    pub fn new(
        sd: &mut Softdevice,
        report_map: &'static [u8],
        layout: &ReportLayout,
    ) -> Result<Self, RegisterError> {
        let mut sb = ServiceBuilder::new(sd, Uuid::new_16(SERVICE_HID))?;

        let protocol_mode = sb
            .add_characteristic(
                Uuid::new_16(CHAR_PROTOCOL_MODE),
                Attribute::new([1u8]).security(SecurityMode::JustWorks),
                Metadata::new(Properties::new().read().write_without_response()),
            )?
            .build();

        let mut inputs = [InputHandles { value: 0, cccd: 0 }; InputSlot::ALL.len()];
        for slot in InputSlot::ALL {
            // Slots disabled in the lookup table are not checked against the map.
            let len = layout
                .input_len(slot.report_id().id())
                .filter(|&len| len <= slot.max_len())
                .unwrap_or(slot.max_len());
            let mut cb = sb.add_characteristic(
                Uuid::new_16(CHAR_REPORT),
                Attribute::new(&ZEROS[..len]).security(SecurityMode::JustWorks),
                Metadata::with_security(Properties::new().read().notify(), SecurityMode::JustWorks),
            )?;
            cb.add_descriptor(
                Uuid::new_16(DESC_REPORT_REFERENCE),
                Attribute::new([slot.report_id().id(), REPORT_TYPE_INPUT])
                    .security(SecurityMode::JustWorks),
            )?;
            let handles = cb.build();
            inputs[slot.index()] = InputHandles {
                value: handles.value_handle,
                cccd: handles.cccd_handle,
            };
        }

        let mut outputs = [0u16; OutputSlot::ALL.len()];
        for slot in OutputSlot::ALL {
            let len = layout
                .output_len(slot.report_id().id())
                .filter(|&len| len <= slot.max_len())
                .unwrap_or(slot.max_len());
            let mut cb = sb.add_characteristic(
                Uuid::new_16(CHAR_REPORT),
                Attribute::new(&ZEROS[..len]).security(SecurityMode::JustWorks),
                Metadata::new(Properties::new().read().write().write_without_response()),
            )?;
            cb.add_descriptor(
                Uuid::new_16(DESC_REPORT_REFERENCE),
                Attribute::new([slot.report_id().id(), REPORT_TYPE_OUTPUT])
                    .security(SecurityMode::JustWorks),
            )?;
            outputs[slot.index()] = cb.build().value_handle;
        }

        let boot_input = sb
            .add_characteristic(
                Uuid::new_16(CHAR_BOOT_KEYBOARD_INPUT),
                Attribute::new(&ZEROS[..BOOT_KEYBOARD_REPORT_LEN]).security(SecurityMode::JustWorks),
                Metadata::with_security(Properties::new().read().notify(), SecurityMode::JustWorks),
            )?
            .build();

        let boot_output = sb
            .add_characteristic(
                Uuid::new_16(CHAR_BOOT_KEYBOARD_OUTPUT),
                Attribute::new([0u8]).security(SecurityMode::JustWorks),
                Metadata::new(Properties::new().read().write().write_without_response()),
            )?
            .build();

        let version = BASE_USB_HID_SPEC_VERSION.to_le_bytes();
        sb.add_characteristic(
            Uuid::new_16(CHAR_HID_INFO),
            Attribute::new([version[0], version[1], 0x00, HID_INFO_FLAGS])
                .read_security(SecurityMode::JustWorks),
            Metadata::new(Properties::new().read()),
        )?
        .build();

        sb.add_characteristic(
            Uuid::new_16(CHAR_REPORT_MAP),
            Attribute::new(report_map).read_security(SecurityMode::JustWorks),
            Metadata::new(Properties::new().read()),
        )?
        .build();

        let control_point = sb
            .add_characteristic(
                Uuid::new_16(CHAR_HID_CONTROL_POINT),
                Attribute::new([0u8]).write_security(SecurityMode::JustWorks),
                Metadata::new(Properties::new().write_without_response()),
            )?
            .build();

        sb.build();

        Ok(Self {
            protocol_mode: protocol_mode.value_handle,
            control_point: control_point.value_handle,
            inputs,
            outputs,
            boot_input: InputHandles {
                value: boot_input.value_handle,
                cccd: boot_input.cccd_handle,
            },
            boot_output: boot_output.value_handle,
        })
    }

    pub fn input_handle(&self, slot: InputSlot) -> u16 {
        self.inputs[slot.index()].value
    }

    pub fn boot_keyboard_handle(&self) -> u16 {
        self.boot_input.value
    }

    fn output_written(slot: OutputSlot, data: &[u8]) -> HidsEvent {
        let len = data.len().min(slot.max_len());
        let mut bytes = Vec::new();
        // Capacity is the largest output report.
        let _ = bytes.extend_from_slice(&data[..len]);
        HidsEvent::OutputReportWritten { slot, data: bytes }
    }
}

impl Service for HidService {
    type Event = HidsEvent;

    fn on_write(&self, handle: u16, data: &[u8]) -> Option<Self::Event> {
        if handle == self.protocol_mode {
            return match data.first() {
                Some(0) => Some(HidsEvent::BootModeEntered),
                Some(1) => Some(HidsEvent::ReportModeEntered),
                _ => None,
            };
        }
        if handle == self.control_point {
            debug!("HID control point: {=[u8]:x}", data);
            return None;
        }
        if handle == self.boot_output {
            return Some(Self::output_written(OutputSlot::KeyboardLeds, data));
        }
        if let Some(index) = self.outputs.iter().position(|&h| h == handle) {
            return OutputSlot::from_index(index).map(|slot| Self::output_written(slot, data));
        }
        let cccd_write = self
            .inputs
            .iter()
            .chain(core::iter::once(&self.boot_input))
            .any(|input| input.cccd == handle);
        if cccd_write && data.first().is_some_and(|flags| flags & 0x01 != 0) {
            return Some(HidsEvent::NotificationsEnabled);
        }
        None
    }
}

pub enum ServerEvent {
    Battery(BatteryServiceEvent),
    Hids(HidsEvent),
}

pub struct Server {
    pub bas: BatteryService,
    pub dis: DeviceInformationService,
    pub hids: HidService,
}

impl Server {
    /// Register all services. `layout` must come from
    /// [`HidRouter::report_layout`](crate::hid::HidRouter::report_layout)
    /// so every length fits its slot.
    pub fn new(
        sd: &mut Softdevice,
        report_map: &'static [u8],
        layout: &ReportLayout,
    ) -> Result<Self, RegisterError> {
        let bas = BatteryService::new(sd)?;
        let dis = DeviceInformationService::new(sd)?;
        let hids = HidService::new(sd, report_map, layout)?;
        // The initial value only fails on an invalid handle.
        let _ = bas.battery_level_set(&INITIAL_BATTERY_LEVEL);
        Ok(Self { bas, dis, hids })
    }
}

impl gatt_server::Server for Server {
    type Event = ServerEvent;

    fn on_write(
        &self,
        _conn: &Connection,
        handle: u16,
        _op: WriteOp,
        _offset: usize,
        data: &[u8],
    ) -> Option<Self::Event> {
        if let Some(event) = self.bas.on_write(handle, data) {
            return Some(ServerEvent::Battery(event));
        }
        self.hids.on_write(handle, data).map(ServerEvent::Hids)
    }
}
