//! Bond persistence in the nRF52840's internal flash.
//!
//! The whole [`BondTable`](crate::ble::bond::BondTable) is one item of a
//! `sequential-storage` map. The map pages handle wear levelling and
//! garbage collection, so a save is a single `store_item`.
//!
//! Bond changes are only reported to the device once they are on flash:
//! the task saves first, then forwards the table's queued completion
//! events (peer deleted, bond updated) to the dispatcher. A failed write
//! keeps the events queued and is retried after
//! [`STORAGE_RETRY_DELAY_MS`].

use defmt::{debug, error, info, warn, Debug2Format};
use embassy_time::{Duration, Timer};
use embedded_storage_async::nor_flash::NorFlash;
use sequential_storage::cache::NoCache;
use sequential_storage::map::{fetch_item, store_item};

use crate::ble::bond::TABLE_LEN;
use crate::config::{STORAGE_FLASH_PAGE_COUNT, STORAGE_FLASH_PAGE_START, STORAGE_RETRY_DELAY_MS};
use crate::error::Error;
use crate::nrf::bonder::{with_bonds, PERSIST};
use crate::nrf::post;

/// Flash page size for nRF52840 (4 KB).
const FLASH_PAGE_SIZE: u32 = 4096;

const STORAGE_START: u32 = STORAGE_FLASH_PAGE_START * FLASH_PAGE_SIZE;
const STORAGE_END: u32 = (STORAGE_FLASH_PAGE_START + STORAGE_FLASH_PAGE_COUNT) * FLASH_PAGE_SIZE;

/// Map key of the bond table item.
const KEY_BONDS: u8 = 0x01;

/// Serialized table plus map item header.
const ITEM_BUF_LEN: usize = TABLE_LEN + 32;

/// Load the bond table. A missing item leaves the table empty; an
/// unreadable one is reported and also leaves it empty.
pub async fn load(flash: &mut impl NorFlash) -> Result<usize, Error> {
    let mut buf = [0u8; ITEM_BUF_LEN];
    let item = fetch_item::<u8, &[u8], _>(
        flash,
        STORAGE_START..STORAGE_END,
        &mut NoCache::new(),
        &mut buf,
        &KEY_BONDS,
    )
    .await
    .map_err(|e| {
        error!("bond table read failed: {:?}", Debug2Format(&e));
        Error::Storage
    })?;

    let Some(data) = item else {
        info!("no bonds in flash");
        return Ok(0);
    };
    with_bonds(|table| {
        table.decode(data)?;
        info!("loaded {} bonds from flash", table.len());
        Ok(table.len())
    })
}

/// Write the bond table if it changed since the last save.
pub async fn save(flash: &mut impl NorFlash) -> Result<(), Error> {
    let mut data = [0u8; TABLE_LEN];
    let encoded = with_bonds(|table| {
        if !table.is_dirty() {
            return Ok(None);
        }
        table.encode(&mut data).map(Some)
    })?;
    let Some(len) = encoded else {
        debug!("bond table unchanged");
        return Ok(());
    };

    let mut buf = [0u8; ITEM_BUF_LEN];
    store_item::<u8, &[u8], _>(
        flash,
        STORAGE_START..STORAGE_END,
        &mut NoCache::new(),
        &mut buf,
        &KEY_BONDS,
        &&data[..len],
    )
    .await
    .map_err(|e| {
        error!("bond table write failed: {:?}", Debug2Format(&e));
        Error::Storage
    })?;

    with_bonds(|table| table.mark_clean());
    info!("saved bond table ({} bytes)", len);
    Ok(())
}

#[embassy_executor::task]
pub async fn storage_task(mut flash: nrf_softdevice::Flash) -> ! {
    loop {
        PERSIST.wait().await;
        match save(&mut flash).await {
            Ok(()) => {
                while let Some(event) = with_bonds(|table| table.take_saved_event()) {
                    post(event);
                }
            }
            Err(_) => {
                warn!("bond table not saved, retrying in {} ms", STORAGE_RETRY_DELAY_MS);
                Timer::after(Duration::from_millis(STORAGE_RETRY_DELAY_MS)).await;
                PERSIST.signal(());
            }
        }
    }
}
