//! hidlink firmware: composite BLE keyboard/mouse on nRF52840 + S140.
//!
//! Boot order matters: the SoftDevice is enabled and the GATT table is
//! registered before any task runs, bonds are loaded before the device
//! builds its whitelist, and the device is installed before advertising
//! starts.

#![no_std]
#![no_main]

use defmt::{info, unwrap};
use embassy_executor::Spawner;
use embassy_nrf::{config::Config, interrupt};
use nrf_softdevice::{raw, Flash, Softdevice};
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

use hidlink::ble::BleDevice;
use hidlink::config::{LinkSettings, ADVERTISED_NAME_MAX_LEN, DEVICE_NAME};
use hidlink::hid::HidRouter;
use hidlink::nrf::advertiser::advertiser_task;
use hidlink::nrf::bonder::{Bonder, SharedBonds};
use hidlink::nrf::gatt::Server;
use hidlink::nrf::stack::SoftDeviceStack;
use hidlink::nrf::{self, dispatcher_task, with_device, STATE_CHANGED};
use hidlink::storage::{self, storage_task};

/// Negotiated ATT MTU; large enough for the raw report.
const ATT_MTU: u16 = 247;

#[embassy_executor::task]
async fn softdevice_task(sd: &'static Softdevice) -> ! {
    sd.run().await
}

fn softdevice_config() -> nrf_softdevice::Config {
    nrf_softdevice::Config {
        clock: Some(raw::nrf_clock_lf_cfg_t {
            source: raw::NRF_CLOCK_LF_SRC_RC as u8,
            rc_ctiv: 16,
            rc_temp_ctiv: 2,
            accuracy: raw::NRF_CLOCK_LF_ACCURACY_500_PPM as u8,
        }),
        conn_gap: Some(raw::ble_gap_conn_cfg_t {
            conn_count: 1,
            event_length: 24,
        }),
        conn_gatt: Some(raw::ble_gatt_conn_cfg_t { att_mtu: ATT_MTU }),
        gatts_attr_tab_size: Some(raw::ble_gatts_cfg_attr_tab_size_t {
            attr_tab_size: raw::BLE_GATTS_ATTR_TAB_SIZE_DEFAULT,
        }),
        gap_role_count: Some(raw::ble_gap_cfg_role_count_t {
            adv_set_count: 1,
            periph_role_count: 1,
            central_role_count: 0,
            central_sec_count: 0,
            _bitfield_1: raw::ble_gap_cfg_role_count_t::new_bitfield_1(0),
        }),
        gap_device_name: Some(raw::ble_gap_cfg_device_name_t {
            p_value: DEVICE_NAME.as_ptr() as _,
            current_len: DEVICE_NAME.len() as u16,
            max_len: ADVERTISED_NAME_MAX_LEN as u16,
            write_perm: unsafe { core::mem::zeroed() },
            _bitfield_1: raw::ble_gap_cfg_device_name_t::new_bitfield_1(
                raw::BLE_GATTS_VLOC_STACK as u8,
            ),
        }),
        ..Default::default()
    }
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("hidlink starting");

    // The SoftDevice reserves interrupt priorities 0, 1 and 4.
    let mut config = Config::default();
    config.gpiote_interrupt_priority = interrupt::Priority::P2;
    config.time_interrupt_priority = interrupt::Priority::P2;
    let _p = embassy_nrf::init(config);

    let sd = Softdevice::enable(&softdevice_config());

    let hid = HidRouter::new();
    let layout = match hid.report_layout() {
        Ok(layout) => layout,
        Err(err) => nrf::fatal(err),
    };
    static SERVER: StaticCell<Server> = StaticCell::new();
    let server: &'static Server =
        SERVER.init(unwrap!(Server::new(sd, hid.report_descriptor(), &layout)));
    let sd: &'static Softdevice = sd;
    unwrap!(spawner.spawn(softdevice_task(sd)));

    let mut flash = Flash::take(sd);
    if storage::load(&mut flash).await.is_err() {
        info!("starting with an empty bond table");
    }

    let mut device = BleDevice::with_router(
        SoftDeviceStack::new(server),
        SharedBonds,
        LinkSettings::default(),
        hid,
    );
    nrf::or_fatal(device.init());
    nrf::install(device);

    static BONDER: StaticCell<Bonder> = StaticCell::new();
    let bonder: &'static Bonder = BONDER.init(Bonder::default());

    unwrap!(spawner.spawn(dispatcher_task()));
    unwrap!(spawner.spawn(storage_task(flash)));
    unwrap!(spawner.spawn(advertiser_task(sd, server, bonder)));

    nrf::or_fatal(with_device(|device| device.start_advertising()));
    info!("advertising as {}", with_device(|device| device.advertised_name()).as_str());

    // Application side: surface link changes and advertise again once a
    // central leaves.
    let mut linked = false;
    let mut secured = false;
    loop {
        STATE_CHANGED.wait().await;
        let status = with_device(|device| device.status());
        if status.connected != secured {
            secured = status.connected;
            info!("link secured: {}", secured);
        }
        if status.name_changed {
            with_device(|device| {
                info!("central name: {=[u8]:a}", device.peer_name());
                device.set_name_changed(false);
            });
        }
        let has_link = status.handle.is_valid();
        if linked && !has_link {
            nrf::or_fatal(with_device(|device| device.start_advertising()));
        }
        linked = has_link;
    }
}
