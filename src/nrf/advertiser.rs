//! Advertising and link task.
//!
//! Runs the advertising modes chosen by [`AdvSequencer`], and once a
//! central connects, serves the GATT server until the link drops. The
//! peer device-name read and a one-shot connection parameter request run
//! next to the server on the same link.

use defmt::{debug, info, warn, Debug2Format};
use embassy_futures::select::{select, select3, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer};
use heapless::Vec;
use nrf_softdevice::ble::advertisement_builder::{
    AdvertisementDataType, Flag, LegacyAdvertisementBuilder, LegacyAdvertisementPayload,
    ServiceList, ServiceUuid16,
};
use nrf_softdevice::ble::peripheral::{
    self, advertise_pairable, AdvertiseError, ConnectableAdvertisement, FilterPolicy,
};
use nrf_softdevice::ble::{gatt_client, gatt_server, Connection};
use nrf_softdevice::{raw, Softdevice};

use super::bonder::Bonder;
use super::gatt::{BatteryServiceEvent, Server, ServerEvent};
use super::stack::{from_sd_address, to_sd_address, to_sd_conn_params};
use super::{or_fatal, post, with_device, AdvCommand, ADV_CONTROL};
use crate::ble::advertising::{AdvEvent, AdvMode, AdvPlan, AdvSequencer};
use crate::ble::connection::{ConnHandle, HciStatus, StackEvent};
use crate::config::{
    APPEARANCE_HID_KEYBOARD, FIRST_CONN_PARAMS_UPDATE_DELAY_MS, PEER_NAME_MAX_LEN,
    PREFERRED_CONN_PARAMS,
};
use crate::error::StatusCode;

/// Set by [`SoftDeviceStack`](super::stack::SoftDeviceStack) when the
/// application asks for the peer's device name.
pub static NAME_READ: Signal<CriticalSectionRawMutex, ConnHandle> = Signal::new();

/// Room for a name in an otherwise empty legacy payload.
const SCAN_NAME_MAX_LEN: usize = 29;

#[nrf_softdevice::gatt_client(uuid = "1800")]
struct GapClient {
    #[characteristic(uuid = "2a00", read)]
    device_name: Vec<u8, PEER_NAME_MAX_LEN>,
}

enum Outcome {
    Connected(Connection),
    TimedOut(AdvMode),
    Command(AdvCommand),
    Idle,
}

fn adv_data() -> LegacyAdvertisementPayload {
    LegacyAdvertisementBuilder::new()
        .flags(&[Flag::GeneralDiscovery, Flag::LE_Only])
        .services_16(
            ServiceList::Incomplete,
            &[ServiceUuid16::HUMAN_INTERFACE_DEVICE, ServiceUuid16::BATTERY],
        )
        .raw(
            AdvertisementDataType::APPEARANCE,
            &APPEARANCE_HID_KEYBOARD.to_le_bytes(),
        )
        .build()
}

fn scan_data(name: &str) -> LegacyAdvertisementPayload {
    let builder = LegacyAdvertisementBuilder::new();
    if name.len() <= SCAN_NAME_MAX_LEN {
        return builder.full_name(name).build();
    }
    let mut cut = SCAN_NAME_MAX_LEN;
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    builder.short_name(&name[..cut]).build()
}

fn dispatch(event: AdvEvent) {
    or_fatal(with_device(|device| device.dispatch(event.into())));
}

/// Ask the device for whatever `mode` needs, then pick the mode to run.
fn plan(mode: AdvMode) -> (AdvSequencer, AdvPlan) {
    let sequencer = AdvSequencer::new(with_device(|device| *device.adv_settings()));

    let peer = if sequencer.needs_peer_address(mode) {
        dispatch(AdvEvent::PeerAddrRequest);
        with_device(|device| device.stack_mut().take_peer_address())
    } else {
        None
    };
    let whitelist = if sequencer.needs_whitelist(mode) {
        dispatch(AdvEvent::WhitelistRequest);
        with_device(|device| device.stack_mut().take_whitelist())
    } else {
        None
    };

    let plan = sequencer.resolve(mode, peer.as_ref(), whitelist.as_ref());
    (sequencer, plan)
}

async fn advertise(sd: &'static Softdevice, bonder: &'static Bonder, mode: AdvMode) -> Outcome {
    let (sequencer, plan) = plan(mode);
    dispatch(plan.event);
    if plan.mode == AdvMode::Idle {
        with_device(|device| device.stack_mut().set_advertising(false));
        return Outcome::Idle;
    }
    with_device(|device| device.stack_mut().set_advertising(true));
    info!("advertising: {}", plan.mode);

    let name = with_device(|device| device.advertised_name());
    let adv_data = adv_data();
    let scan_data = scan_data(&name);
    let advertisement = match (plan.mode, plan.peer) {
        (AdvMode::DirectedHighDuty, Some(peer)) => {
            ConnectableAdvertisement::NonscannableDirectedHighDuty {
                peer: to_sd_address(&peer),
            }
        }
        (AdvMode::Directed, Some(peer)) => ConnectableAdvertisement::NonscannableDirected {
            peer: to_sd_address(&peer),
        },
        _ => ConnectableAdvertisement::ScannableUndirected {
            adv_data: &adv_data,
            scan_data: &scan_data,
        },
    };
    let config = peripheral::Config {
        interval: plan.interval,
        timeout: (plan.timeout != 0).then_some(plan.timeout),
        filter_policy: if plan.filtered {
            FilterPolicy::Both
        } else {
            FilterPolicy::Any
        },
        ..Default::default()
    };

    let result = select(
        advertise_pairable(sd, advertisement, &config, bonder),
        ADV_CONTROL.wait(),
    )
    .await;
    with_device(|device| device.stack_mut().set_advertising(false));

    match result {
        Either::First(Ok(conn)) => Outcome::Connected(conn),
        Either::First(Err(AdvertiseError::Timeout)) => {
            Outcome::TimedOut(sequencer.next_on_timeout(plan.mode))
        }
        Either::First(Err(err)) => {
            warn!("advertising failed: {}", Debug2Format(&err));
            Outcome::TimedOut(sequencer.next_on_timeout(plan.mode))
        }
        Either::Second(command) => Outcome::Command(command),
    }
}

async fn read_peer_name(conn: &Connection) {
    loop {
        let handle = NAME_READ.wait().await;
        let client: GapClient = match gatt_client::discover(conn).await {
            Ok(client) => client,
            Err(gatt_client::DiscoverError::ServiceNotFound) => {
                post(StackEvent::NameReadResponse {
                    handle,
                    value: None,
                });
                continue;
            }
            Err(err) => {
                warn!("GAP service discovery failed: {}", Debug2Format(&err));
                continue;
            }
        };
        match client.device_name_read().await {
            Ok(name) => post(StackEvent::NameReadResponse {
                handle,
                value: Some(name),
            }),
            Err(gatt_client::ReadError::Timeout) => {
                post(StackEvent::GattClientTimeout { handle });
            }
            Err(err) => {
                warn!("peer name read failed: {}", Debug2Format(&err));
                post(StackEvent::NameReadResponse {
                    handle,
                    value: None,
                });
            }
        }
    }
}

/// Ask the central once for the preferred connection parameters, after it
/// had time to finish service discovery.
async fn request_conn_params(handle: ConnHandle) {
    Timer::after(Duration::from_millis(FIRST_CONN_PARAMS_UPDATE_DELAY_MS)).await;
    let params = to_sd_conn_params(&PREFERRED_CONN_PARAMS);
    let code = StatusCode(unsafe { raw::sd_ble_gap_conn_param_update(handle.0, &params) });
    if !code.is_success() {
        warn!("connection parameter update not requested: {}", code.0);
    }
    core::future::pending::<()>().await
}

async fn serve(conn: Connection, server: &'static Server, bonder: &'static Bonder) {
    let Some(handle) = conn.handle().map(ConnHandle) else {
        return;
    };
    NAME_READ.reset();
    let peer = from_sd_address(&conn.peer_address());
    with_device(|device| device.stack_mut().attach(conn.clone()));
    post(StackEvent::Connected { handle, peer });

    let gatt = gatt_server::run(&conn, server, |event| match event {
        ServerEvent::Battery(BatteryServiceEvent::BatteryLevelCccdWrite { notifications }) => {
            debug!("battery level notifications: {}", notifications)
        }
        ServerEvent::Hids(event) => post(event),
    });
    let _ = select3(gatt, read_peer_name(&conn), request_conn_params(handle)).await;
    debug!("link closed: handle {}", handle.0);

    with_device(|device| device.stack_mut().detach());
    post(StackEvent::Disconnected {
        handle,
        reason: HciStatus::RemoteUserTerminated as u8,
    });
    bonder.link_closed(handle);
}

#[embassy_executor::task]
pub async fn advertiser_task(
    sd: &'static Softdevice,
    server: &'static Server,
    bonder: &'static Bonder,
) -> ! {
    let mut command = ADV_CONTROL.wait().await;
    loop {
        let AdvCommand::Start(mode) = command else {
            command = ADV_CONTROL.wait().await;
            continue;
        };
        command = match advertise(sd, bonder, mode).await {
            Outcome::Connected(conn) => {
                serve(conn, server, bonder).await;
                ADV_CONTROL.wait().await
            }
            Outcome::TimedOut(next) => {
                debug!("advertising timed out, next {}", next);
                AdvCommand::Start(next)
            }
            Outcome::Command(command) => command,
            Outcome::Idle => ADV_CONTROL.wait().await,
        };
    }
}
