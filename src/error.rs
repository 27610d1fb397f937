//! Unified error type for hidlink.
//!
//! We avoid `alloc` - all error variants carry only fixed-size data.
//! Implements `defmt::Format` for efficient on-target logging.
//!
//! SoftDevice calls return raw status codes. Every call site owns a small
//! allow-list of codes that are expected and recoverable; those are
//! absorbed by [`check`]. Anything else is [`Error::Fatal`] and halts the
//! firmware in the binary's fatal handler.

/// Raw status code returned by the BLE stack or the peer store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub const SUCCESS: Self = Self(0);
    pub const INTERNAL: Self = Self(3);
    pub const NO_MEM: Self = Self(4);
    pub const NOT_FOUND: Self = Self(5);
    pub const INVALID_PARAM: Self = Self(7);
    pub const INVALID_STATE: Self = Self(8);
    pub const INVALID_LENGTH: Self = Self(9);
    pub const DATA_SIZE: Self = Self(12);
    pub const TIMEOUT: Self = Self(13);
    pub const FORBIDDEN: Self = Self(15);
    pub const BUSY: Self = Self(17);
    pub const CONN_COUNT: Self = Self(18);
    pub const RESOURCES: Self = Self(19);

    /// Invalid connection handle.
    pub const BLE_INVALID_CONN_HANDLE: Self = Self(0x3001);
    /// Invalid advertising handle.
    pub const BLE_INVALID_ADV_HANDLE: Self = Self(0x3003);
    /// A whitelist is in use and cannot be replaced.
    pub const BLE_WHITELIST_IN_USE: Self = Self(0x3200);
    /// System attributes of the connected peer are missing.
    pub const BLE_GATTS_SYS_ATTR_MISSING: Self = Self(0x3401);

    pub const fn is_success(self) -> bool {
        self.0 == Self::SUCCESS.0
    }
}

impl From<u32> for StatusCode {
    fn from(raw: u32) -> Self {
        StatusCode(raw)
    }
}

/// Stack call sites with their own tolerance policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CallSite {
    // Report path
    SendReport,
    BatteryLevelUpdate,

    // Advertising
    AdvertisingStart,
    AdvertisingStop,
    WhitelistGet,
    WhitelistSet,
    WhitelistReply,
    PeerAddrReply,
    IdentitiesSet,
    PeerIdList,
    BondingDataLoad,

    // GAP setup
    GapDeviceName,
    GapAppearance,
    GapConnParams,

    // Connection
    QueuedWriteAssign,
    PhyUpdate,
    Disconnect,
    SecFailureDisconnect,
    AuthKeyReply,
    PeerNameRead,

    // Peer store
    PeerDelete,
    PeersDelete,
}

impl CallSite {
    /// Codes this call site absorbs instead of treating as fatal.
    pub const fn tolerated(self) -> &'static [StatusCode] {
        match self {
            CallSite::SendReport | CallSite::BatteryLevelUpdate => &[
                StatusCode::INVALID_STATE,
                StatusCode::RESOURCES,
                StatusCode::BUSY,
                StatusCode::BLE_GATTS_SYS_ATTR_MISSING,
                StatusCode::FORBIDDEN,
            ],
            CallSite::AdvertisingStart => &[StatusCode::CONN_COUNT],
            CallSite::AdvertisingStop => {
                &[StatusCode::INVALID_STATE, StatusCode::BLE_INVALID_ADV_HANDLE]
            }
            CallSite::WhitelistGet | CallSite::BondingDataLoad => &[StatusCode::NOT_FOUND],
            CallSite::SecFailureDisconnect => {
                &[StatusCode::INVALID_STATE, StatusCode::BLE_INVALID_CONN_HANDLE]
            }
            _ => &[],
        }
    }
}

/// Outcome of a stack call that did not fail fatally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Checked {
    /// The call succeeded.
    Success,
    /// The call failed with a code on the call site's allow-list.
    Tolerated(StatusCode),
}

impl Checked {
    pub fn is_success(self) -> bool {
        matches!(self, Checked::Success)
    }
}

/// Classify a raw status code for a call site.
pub fn check(site: CallSite, code: StatusCode) -> Result<Checked, Error> {
    if code.is_success() {
        return Ok(Checked::Success);
    }
    if site.tolerated().contains(&code) {
        debug!("{}: tolerated status {}", site, code);
        return Ok(Checked::Tolerated(code));
    }
    error!("{}: fatal status {}", site, code);
    Err(Error::Fatal { site, code })
}

/// What a bounded wait was waiting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WaitTarget {
    PeerDeleted,
    AllPeersDeleted,
    Disconnected,
}

/// Top-level error type used across the crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The stack returned a code the call site does not tolerate.
    /// The firmware must halt.
    Fatal { site: CallSite, code: StatusCode },

    /// An asynchronous completion did not arrive within its budget.
    Timeout(WaitTarget),

    /// A bond record in flash could not be decoded.
    CorruptRecord,

    /// Buffer too small for the requested operation.
    BufferOverflow,

    /// Flash read/write/erase failed.
    Storage,

    /// The HID report map does not match the report slots.
    ReportMap { report_id: u8 },
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_is_never_fatal() {
        for site in [CallSite::SendReport, CallSite::Disconnect, CallSite::PeerDelete] {
            assert_eq!(check(site, StatusCode::SUCCESS), Ok(Checked::Success));
        }
    }

    #[test]
    fn send_report_absorbs_transient_codes() {
        for code in [
            StatusCode::INVALID_STATE,
            StatusCode::RESOURCES,
            StatusCode::BUSY,
            StatusCode::BLE_GATTS_SYS_ATTR_MISSING,
            StatusCode::FORBIDDEN,
        ] {
            assert_eq!(
                check(CallSite::SendReport, code),
                Ok(Checked::Tolerated(code))
            );
        }
    }

    #[test]
    fn unexpected_code_is_fatal() {
        let err = check(CallSite::SendReport, StatusCode::INTERNAL).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(
            err,
            Error::Fatal {
                site: CallSite::SendReport,
                code: StatusCode::INTERNAL
            }
        );
    }

    #[test]
    fn advertising_start_only_tolerates_conn_count() {
        assert!(check(CallSite::AdvertisingStart, StatusCode::CONN_COUNT).is_ok());
        assert!(check(CallSite::AdvertisingStart, StatusCode::BUSY).is_err());
    }

    #[test]
    fn sites_without_allow_list_fail_on_everything() {
        assert!(check(CallSite::PhyUpdate, StatusCode::INVALID_STATE).is_err());
        assert!(check(CallSite::Disconnect, StatusCode::BLE_INVALID_CONN_HANDLE).is_err());
        assert!(check(CallSite::PeersDelete, StatusCode::BUSY).is_err());
    }
}
