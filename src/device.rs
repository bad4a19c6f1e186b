//! Device model and init sequences for the hopper and validator (§3/§4.D).
//!
//! `Device` replaces the original's function-pointer dispatch with an
//! [`EventHandler`] enum (spec.md §9 REDESIGN FLAG) so the poll loop can
//! match on device kind instead of calling through an opaque pointer.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::commands::{self, CommandError, SetupInfo};
use crate::poll::EventHandler;
use crate::session::{Session, SessionError};
use crate::wire::command_ids::{ROUTE_CASHBOX, ROUTE_STORAGE};
use crate::wire::ModExpKeyAgreement;

/// Device bus address of the coin hopper.
pub const HOPPER_ADDRESS: u8 = 0x10;
/// Device bus address of the banknote validator.
pub const VALIDATOR_ADDRESS: u8 = 0x00;

/// Default fixed key used before per-unit keys are provisioned, carried
/// over from `payoutd.c`'s `DEFAULT_KEY`.
pub const DEFAULT_KEY: u64 = 0x0123_4567_0123_4567;

/// DH generator/modulus the host proposes during key negotiation. The real
/// values are vendor-specific and out of scope (§1); these are plausible
/// stand-ins consistent with the 64-bit field width the protocol uses.
const DH_GENERATOR: u64 = 0x7FFF_FFFF_FFFF_FFF1;
const DH_MODULUS: u64 = 0xFFFF_FFFF_FFFF_FFC5;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("device did not return setup info before init completed")]
    MissingSetupInfo,
}

pub struct Device<T> {
    pub id: u8,
    pub display_name: &'static str,
    pub session: Session<T>,
    pub channel_inhibit_mask: u16,
    pub setup_info: Option<SetupInfo>,
    pub event_handler: EventHandler,
    pub fixed_key: u64,
}

impl<T> Device<T>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    pub fn new_hopper(transport: Arc<Mutex<T>>) -> Self {
        Self {
            id: HOPPER_ADDRESS,
            display_name: "hopper",
            session: Session::new(transport, HOPPER_ADDRESS),
            channel_inhibit_mask: 0,
            setup_info: None,
            event_handler: EventHandler::Hopper,
            fixed_key: DEFAULT_KEY,
        }
    }

    pub fn new_validator(transport: Arc<Mutex<T>>) -> Self {
        Self {
            id: VALIDATOR_ADDRESS,
            display_name: "validator",
            session: Session::new(transport, VALIDATOR_ADDRESS),
            channel_inhibit_mask: 0,
            setup_info: None,
            event_handler: EventHandler::Validator,
            fixed_key: DEFAULT_KEY,
        }
    }

    /// Common bring-up sequence shared by both devices, grounded on
    /// `mcSspInitializeDevice`: sync, negotiate encryption, announce host
    /// protocol version 6, fetch setup/firmware/dataset info, enable.
    async fn bring_up(&mut self) -> Result<(), DeviceError> {
        self.session.sync().await?;
        let mut ka = ModExpKeyAgreement;
        self.session
            .negotiate_encryption(&mut ka, DH_GENERATOR, DH_MODULUS)
            .await?;
        commands::host_protocol(&mut self.session, 6).await?;
        let info = commands::setup_request(&mut self.session).await?;
        let _ = commands::get_firmware_version(&mut self.session).await?;
        let _ = commands::get_dataset_version(&mut self.session).await?;
        commands::enable(&mut self.session).await?;
        self.setup_info = Some(info);
        Ok(())
    }

    /// Full init for the hopper: common bring-up, then inhibit-enable
    /// every denomination the setup request reported, keyed by the coin's
    /// own value and currency (`payoutd.c`'s "SMART Hopper configuration"
    /// loop over `ChannelData[i].value`/`.cc`).
    pub async fn init_hopper(&mut self) -> Result<(), DeviceError> {
        self.bring_up().await?;
        let channels = self
            .setup_info
            .as_ref()
            .ok_or(DeviceError::MissingSetupInfo)?
            .channels
            .clone();
        for ch in channels {
            commands::set_coin_mech_inhibits(
                &mut self.session,
                ch.value,
                &commands::currency_string(&ch.currency),
                true,
            )
            .await?;
        }
        Ok(())
    }

    /// Full init for the validator: common bring-up, refill mode, a fixed
    /// routing table (5/10/20 EUR to the cashbox, 50/100/200/500 EUR to
    /// storage — the "final version" spec.md §9 names and leaves
    /// non-configurable), channel inhibits cleared, payout enabled. The
    /// routing table is issued as fixed value/currency pairs exactly as
    /// `payoutd.c` does (`ssp6_set_route(sspC, 500, CURRENCY, ROUTE_CASHBOX)`
    /// etc.) rather than derived from the reported channel list.
    pub async fn init_validator(&mut self) -> Result<(), DeviceError> {
        self.bring_up().await?;
        commands::set_refill_mode(&mut self.session, 0).await?;

        const ROUTES: [(u32, u8); 7] = [
            (500, ROUTE_CASHBOX),    // 5 EUR
            (1000, ROUTE_CASHBOX),   // 10 EUR
            (2000, ROUTE_CASHBOX),   // 20 EUR
            (5000, ROUTE_STORAGE),   // 50 EUR
            (10000, ROUTE_STORAGE),  // 100 EUR
            (20000, ROUTE_STORAGE),  // 200 EUR
            (50000, ROUTE_STORAGE),  // 500 EUR
        ];
        for (value, route) in ROUTES {
            commands::set_route(&mut self.session, value, "EUR", route).await?;
        }

        self.channel_inhibit_mask = 0x0000;
        commands::set_channel_inhibits(&mut self.session, self.channel_inhibit_mask).await?;
        let unit_type = self
            .setup_info
            .as_ref()
            .ok_or(DeviceError::MissingSetupInfo)?
            .unit_type;
        commands::enable_payout(&mut self.session, unit_type).await?;
        Ok(())
    }

    /// Re-issues host protocol negotiation after a `SSP_POLL_RESET` event,
    /// mirroring `payoutd.c`'s reaction to a device reporting it has
    /// rebooted mid-session (§4.E). Callers treat failure here as fatal.
    pub async fn reannounce_host_protocol(&mut self) -> Result<(), DeviceError> {
        commands::host_protocol(&mut self.session, 6).await?;
        Ok(())
    }

    /// Re-enters the `key-exchanging` state (§4.F state machine) without
    /// repeating the rest of bring-up, in reaction to a `KEY_NOT_SET` reply
    /// on an otherwise-established session.
    pub async fn renegotiate_key(&mut self) -> Result<(), DeviceError> {
        self.session.sync().await?;
        let mut ka = ModExpKeyAgreement;
        self.session
            .negotiate_encryption(&mut ka, DH_GENERATOR, DH_MODULUS)
            .await?;
        Ok(())
    }
}
