//! Command IDs for the SSP command set used by this daemon (§6).
//!
//! Values recovered from `payoutd.c`'s `SSP_CMD_*` defines where the
//! original source was retrieved, and from the published SSP manual
//! otherwise (noted per-constant). See DESIGN.md for the full grounding
//! table.

#![allow(dead_code)]

/// SYNC - resets sequence flag (manual value, not present in retrieved source).
pub const SYNC: u8 = 0x11;
/// SET GENERATOR - key exchange (manual value).
pub const SET_GENERATOR: u8 = 0x4A;
/// SET MODULUS - key exchange (manual value).
pub const SET_MODULUS: u8 = 0x4B;
/// REQUEST KEY EXCHANGE (manual value).
pub const REQUEST_KEY_EXCHANGE: u8 = 0x4C;
/// HOST PROTOCOL VERSION (manual value).
pub const HOST_PROTOCOL: u8 = 0x06;
/// SETUP REQUEST (manual value).
pub const SETUP_REQUEST: u8 = 0x05;
/// SET INHIBITS (manual value, used both for channel and coin-mech inhibits).
pub const SET_INHIBITS: u8 = 0x02;
/// ENABLE (manual value).
pub const ENABLE: u8 = 0x0A;
/// DISABLE (manual value).
pub const DISABLE: u8 = 0x09;
/// ENABLE PAYOUT (manual value).
pub const ENABLE_PAYOUT: u8 = 0x5C;
/// SET COIN MECH INHIBITS (manual value).
pub const SET_COIN_MECH_INHIBITS: u8 = 0x2B;
/// SET ROUTE (manual value).
pub const SET_ROUTE: u8 = 0x31;
/// POLL (manual value).
pub const POLL: u8 = 0x07;
/// PAYOUT AMOUNT (manual value).
pub const PAYOUT: u8 = 0x33;
/// FLOAT AMOUNT (manual value).
pub const FLOAT: u8 = 0x3F;
/// EMPTY (`SSP_CMD_EMPTY`, recovered from `payoutd.c`).
pub const EMPTY: u8 = 0x3C;
/// SMART EMPTY, `SSP_CMD_SMART_EMPTY` in `payoutd.c`.
pub const SMART_EMPTY: u8 = 0x52;
/// LAST REJECT NOTE, `SSP_CMD_LAST_REJECT_NOTE` in `payoutd.c`.
pub const LAST_REJECT_NOTE: u8 = 0x17;
/// SET DENOMINATION LEVEL, `SSP_CMD_SET_DENOMINATION_LEVEL` in `payoutd.c`.
pub const SET_DENOMINATION_LEVEL: u8 = 0x34;
/// GET ALL LEVELS, `SSP_CMD_GET_ALL_LEVELS` in `payoutd.c`.
pub const GET_ALL_LEVELS: u8 = 0x22;
/// SET REFILL MODE, `SSP_CMD_SET_REFILL_MODE` in `payoutd.c`.
pub const SET_REFILL_MODE: u8 = 0x30;
/// GET FIRMWARE VERSION, `SSP_CMD_GET_FIRMWARE_VERSION` in `payoutd.c`.
pub const GET_FIRMWARE_VERSION: u8 = 0x20;
/// GET DATASET VERSION, `SSP_CMD_GET_DATASET_VERSION` in `payoutd.c`.
pub const GET_DATASET_VERSION: u8 = 0x21;
/// CHANNEL SECURITY DATA (manual value).
pub const CHANNEL_SECURITY_DATA: u8 = 0x19;
/// RUN CALIBRATION (manual value).
pub const RUN_CALIBRATION: u8 = 0x16;
/// CONFIGURE BEZEL, `SSP_CMD_CONFIGURE_BEZEL` in `payoutd.c`.
pub const CONFIGURE_BEZEL: u8 = 0x54;

/// Option byte requesting a dry-run (§4.C).
pub const OPTION_TEST: u8 = 0x19;
/// Option byte requesting the real operation (§4.C).
pub const OPTION_DO: u8 = 0x58;

/// Route: notes routed to the cashbox (no payout possible).
pub const ROUTE_CASHBOX: u8 = 0x01;
/// Route: notes routed to the payout/storage unit.
pub const ROUTE_STORAGE: u8 = 0x00;

/// Generic status bytes in a command reply (first byte after the frame
/// payload), per `libitlssp/port_win32_ssp.h`'s `SSP_RESPONSE_ENUM`.
pub mod status {
    pub const OK: u8 = 0xF0;
    pub const UNKNOWN_COMMAND: u8 = 0xF2;
    pub const INCORRECT_PARAMETERS: u8 = 0xF3;
    pub const INVALID_PARAMETER: u8 = 0xF4;
    pub const COMMAND_NOT_PROCESSED: u8 = 0xF5;
    pub const SOFTWARE_ERROR: u8 = 0xF6;
    pub const CHECKSUM_ERROR: u8 = 0xF7;
    pub const FAILURE: u8 = 0xF8;
    pub const HEADER_FAILURE: u8 = 0xF9;
    pub const KEY_NOT_SET: u8 = 0xFA;
}

/// Sub-codes for `command_not_processed` on payout/float (§7, §8 scenario 5).
pub mod payout_subcode {
    pub const NOT_ENOUGH_VALUE: u8 = 0x01;
    pub const CANNOT_PAY_EXACT: u8 = 0x02;
    pub const PAYOUT_BUSY: u8 = 0x03;
    pub const PAYOUT_DISABLED: u8 = 0x04;
}

/// Poll event IDs (§4.E), shared between Hopper and Validator plus the
/// device-specific ones, as listed in `payoutd.c`'s `hopperEventHandler`
/// and `validatorEventHandler`.
pub mod poll_event {
    pub const RESET: u8 = 0xF1;
    pub const READ: u8 = 0xEF;
    pub const CREDIT: u8 = 0xEE;
    pub const REJECTING: u8 = 0xED;
    pub const REJECTED: u8 = 0xEC;
    pub const STACKING: u8 = 0xCC;
    pub const STORED: u8 = 0xEB;
    pub const STACKED: u8 = 0xEA;
    pub const SAFE_JAM: u8 = 0xE9;
    pub const UNSAFE_JAM: u8 = 0xE8;
    pub const DISABLED: u8 = 0xE6;
    pub const FRAUD_ATTEMPT: u8 = 0xE4;
    pub const STACKER_FULL: u8 = 0xDF;
    pub const CASH_BOX_REMOVED: u8 = 0xE3;
    pub const CASH_BOX_REPLACED: u8 = 0xE2;
    pub const CLEARED_FROM_FRONT: u8 = 0xE1;
    pub const CLEARED_INTO_CASHBOX: u8 = 0xE0;
    pub const CALIBRATION_FAIL: u8 = 0xE7;
    pub const DISPENSING: u8 = 0xDA;
    pub const DISPENSED: u8 = 0xD2;
    pub const FLOATING: u8 = 0xD6;
    pub const FLOATED: u8 = 0xD7;
    pub const CASHBOX_PAID: u8 = 0xD1;
    pub const JAMMED: u8 = 0xD5;
    pub const COIN_CREDIT: u8 = 0xD3;
    pub const EMPTY: u8 = 0xD8;
    pub const EMPTYING: u8 = 0xD9;
    pub const SMART_EMPTYING: u8 = 0xDD;
    pub const SMART_EMPTIED: u8 = 0xDE;
    pub const INCOMPLETE_PAYOUT: u8 = 0xDC;
    pub const INCOMPLETE_FLOAT: u8 = 0xDB;

    /// Calibration failure sub-reasons (`data1` when `event == CALIBRATION_FAIL`).
    pub mod calibration_fail {
        pub const NO_FAILURE: u8 = 0x00;
        pub const SENSOR_FLAP: u8 = 0x01;
        pub const SENSOR_EXIT: u8 = 0x02;
        pub const SENSOR_COIL1: u8 = 0x03;
        pub const SENSOR_COIL2: u8 = 0x04;
        pub const NOT_INITIALISED: u8 = 0x05;
        pub const CHECKSUM_ERROR: u8 = 0x06;
        pub const COMMAND_RECAL: u8 = 0x07;
    }
}
