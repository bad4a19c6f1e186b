//! Typed wrappers over [`Session::transact`] for each SSP command this
//! daemon issues (§4.C). Each function encodes its own argument layout
//! (little-endian multi-byte integers, 3-byte ASCII currency codes) and
//! decodes the reply into a typed result instead of leaving callers to
//! pick apart raw bytes.

use thiserror::Error;

use crate::session::{Session, SessionError};
use crate::wire::command_ids::{self, payout_subcode, status};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("reply too short: expected at least {expected} bytes, got {got}")]
    ShortReply { expected: usize, got: usize },
    #[error("command not processed: {0}")]
    NotProcessed(PayoutFailure),
    #[error("command rejected with status {status:#04x}")]
    Rejected { status: u8 },
}

/// Sub-reasons a payout/float can be refused with (§8 scenario 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutFailure {
    NotEnoughValue,
    CannotPayExact,
    Busy,
    Disabled,
    Unknown(u8),
}

impl std::fmt::Display for PayoutFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PayoutFailure::NotEnoughValue => "not enough value in smart payout",
            PayoutFailure::CannotPayExact => "can't pay exact amount",
            PayoutFailure::Busy => "smart payout busy",
            PayoutFailure::Disabled => "smart payout disabled",
            PayoutFailure::Unknown(_) => "unknown",
        };
        write!(f, "{s}")
    }
}

impl From<u8> for PayoutFailure {
    fn from(b: u8) -> Self {
        match b {
            payout_subcode::NOT_ENOUGH_VALUE => PayoutFailure::NotEnoughValue,
            payout_subcode::CANNOT_PAY_EXACT => PayoutFailure::CannotPayExact,
            payout_subcode::PAYOUT_BUSY => PayoutFailure::Busy,
            payout_subcode::PAYOUT_DISABLED => PayoutFailure::Disabled,
            other => PayoutFailure::Unknown(other),
        }
    }
}

/// Checks the status byte of a reply, mapping `COMMAND_NOT_PROCESSED` on a
/// payout/float reply into [`PayoutFailure`] and anything else non-OK into
/// [`CommandError::Rejected`]. Returns the data following the status byte.
fn expect_ok(reply: Vec<u8>) -> Result<Vec<u8>, CommandError> {
    let status_byte = *reply
        .first()
        .ok_or(CommandError::ShortReply { expected: 1, got: 0 })?;
    if status_byte == status::OK {
        return Ok(reply[1..].to_vec());
    }
    if status_byte == status::COMMAND_NOT_PROCESSED {
        let subcode = reply.get(1).copied().unwrap_or(0);
        return Err(CommandError::NotProcessed(subcode.into()));
    }
    Err(CommandError::Rejected { status: status_byte })
}

/// Device/channel metadata returned by `setup_request`, populated once at
/// device init and treated as immutable afterward.
#[derive(Debug, Clone)]
pub struct SetupInfo {
    pub unit_type: u8,
    pub firmware_version: String,
    pub country_code: [u8; 3],
    pub protocol_version: u8,
    pub channels: Vec<ChannelInfo>,
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelInfo {
    pub channel: u8,
    pub value: u32,
    pub currency: [u8; 3],
}

#[derive(Debug, Clone, Copy)]
pub struct LevelEntry {
    pub amount: u32,
    pub level: u16,
    pub currency: [u8; 3],
}

/// One event drained from a `POLL` reply. `data1`/`data2` and `cc` mirror
/// the fields the original daemon reads off its vendor library's decoded
/// event struct (`poll->events[i].data1/.data2/.cc`, see `payoutd.c`'s
/// `hopperEventHandler`/`validatorEventHandler`); the vendor library's own
/// wire encoding of a poll reply is not part of the retrieved source, so
/// this implementation fixes its own 12-byte-per-event layout (event id,
/// `data1` u32 LE, `data2` u32 LE, 3-byte ASCII currency) documented in
/// DESIGN.md.
#[derive(Debug, Clone, Copy)]
pub struct PollEvent {
    pub event: u8,
    pub data1: u32,
    pub data2: u32,
    pub cc: [u8; 3],
}

fn currency_bytes(code: &str) -> [u8; 3] {
    let mut out = [b' '; 3];
    for (slot, b) in out.iter_mut().zip(code.as_bytes()) {
        *slot = *b;
    }
    out
}

/// Inverse of [`currency_bytes`]: a 3-byte ASCII currency code as a trimmed
/// `String`, for JSON output.
pub fn currency_string(code: &[u8; 3]) -> String {
    String::from_utf8_lossy(code).trim().to_string()
}

pub async fn sync<T>(session: &mut Session<T>) -> Result<(), CommandError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    session.sync().await?;
    Ok(())
}

pub async fn host_protocol<T>(session: &mut Session<T>, version: u8) -> Result<(), CommandError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let reply = session.transact(command_ids::HOST_PROTOCOL, &[version]).await?;
    expect_ok(reply)?;
    Ok(())
}

pub async fn setup_request<T>(session: &mut Session<T>) -> Result<SetupInfo, CommandError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let reply = session.transact(command_ids::SETUP_REQUEST, &[]).await?;
    let data = expect_ok(reply)?;
    if data.len() < 6 {
        return Err(CommandError::ShortReply {
            expected: 6,
            got: data.len(),
        });
    }
    let unit_type = data[0];
    let firmware_version = String::from_utf8_lossy(&data[1..5]).trim().to_string();
    let country_code = [data[5], data.get(6).copied().unwrap_or(0), data.get(7).copied().unwrap_or(0)];
    let protocol_version = data.get(8).copied().unwrap_or(0);

    let mut channels = Vec::new();
    let mut offset = 9usize;
    let mut channel = 1u8;
    while offset + 7 <= data.len() {
        let value = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap());
        let currency = [data[offset + 4], data[offset + 5], data[offset + 6]];
        channels.push(ChannelInfo {
            channel,
            value,
            currency,
        });
        offset += 7;
        channel += 1;
    }

    Ok(SetupInfo {
        unit_type,
        firmware_version,
        country_code,
        protocol_version,
        channels,
    })
}

pub async fn set_channel_inhibits<T>(session: &mut Session<T>, mask: u16) -> Result<(), CommandError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let reply = session
        .transact(command_ids::SET_INHIBITS, &mask.to_le_bytes())
        .await?;
    expect_ok(reply)?;
    Ok(())
}

pub async fn enable<T>(session: &mut Session<T>) -> Result<(), CommandError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    expect_ok(session.transact(command_ids::ENABLE, &[]).await?)?;
    Ok(())
}

pub async fn disable<T>(session: &mut Session<T>) -> Result<(), CommandError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    expect_ok(session.transact(command_ids::DISABLE, &[]).await?)?;
    Ok(())
}

/// Enables the payout unit, announcing the device's own reported unit type
/// back to it (`ssp6_enable_payout(sspC, setup_req.UnitType)`).
pub async fn enable_payout<T>(session: &mut Session<T>, unit_type: u8) -> Result<(), CommandError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    expect_ok(
        session
            .transact(command_ids::ENABLE_PAYOUT, &[unit_type])
            .await?,
    )?;
    Ok(())
}

/// Sets whether the hopper accepts a given coin denomination, keyed by the
/// coin's own value and currency rather than a channel index
/// (`ssp6_set_coinmech_inhibits(sspC, value, cc, enabled)` in `payoutd.c`).
pub async fn set_coin_mech_inhibits<T>(
    session: &mut Session<T>,
    value: u32,
    currency: &str,
    enabled: bool,
) -> Result<(), CommandError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&value.to_le_bytes());
    data.extend_from_slice(&currency_bytes(currency));
    data.push(enabled as u8);
    expect_ok(
        session
            .transact(command_ids::SET_COIN_MECH_INHIBITS, &data)
            .await?,
    )?;
    Ok(())
}

/// Routes banknotes of a given value/currency to the cashbox or the
/// storage/payout unit (`ssp6_set_route(sspC, value, cc, route)`).
pub async fn set_route<T>(
    session: &mut Session<T>,
    value: u32,
    currency: &str,
    route: u8,
) -> Result<(), CommandError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&value.to_le_bytes());
    data.extend_from_slice(&currency_bytes(currency));
    data.push(route);
    expect_ok(session.transact(command_ids::SET_ROUTE, &data).await?)?;
    Ok(())
}

/// Size in bytes of one fixed-layout poll event entry (see [`PollEvent`]).
const POLL_EVENT_SIZE: usize = 1 + 4 + 4 + 3;

pub async fn poll<T>(session: &mut Session<T>) -> Result<Vec<PollEvent>, CommandError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let reply = session.transact(command_ids::POLL, &[]).await?;
    let data = expect_ok(reply)?;
    let mut events = Vec::new();
    let mut offset = 0usize;
    while offset + POLL_EVENT_SIZE <= data.len() {
        let event = data[offset];
        let data1 = u32::from_le_bytes(data[offset + 1..offset + 5].try_into().unwrap());
        let data2 = u32::from_le_bytes(data[offset + 5..offset + 9].try_into().unwrap());
        let cc = [data[offset + 9], data[offset + 10], data[offset + 11]];
        events.push(PollEvent {
            event,
            data1,
            data2,
            cc,
        });
        offset += POLL_EVENT_SIZE;
    }
    Ok(events)
}

pub async fn payout<T>(
    session: &mut Session<T>,
    amount: u32,
    currency: &str,
    option: u8,
) -> Result<(), CommandError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&amount.to_le_bytes());
    data.extend_from_slice(&currency_bytes(currency));
    data.push(option);
    expect_ok(session.transact(command_ids::PAYOUT, &data).await?)?;
    Ok(())
}

pub async fn float<T>(
    session: &mut Session<T>,
    amount: u32,
    currency: &str,
    option: u8,
) -> Result<(), CommandError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&amount.to_le_bytes());
    data.extend_from_slice(&currency_bytes(currency));
    data.push(option);
    expect_ok(session.transact(command_ids::FLOAT, &data).await?)?;
    Ok(())
}

pub async fn empty<T>(session: &mut Session<T>) -> Result<(), CommandError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    expect_ok(session.transact(command_ids::EMPTY, &[]).await?)?;
    Ok(())
}

pub async fn smart_empty<T>(session: &mut Session<T>) -> Result<(), CommandError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    expect_ok(session.transact(command_ids::SMART_EMPTY, &[]).await?)?;
    Ok(())
}

pub async fn last_reject_note<T>(session: &mut Session<T>) -> Result<u8, CommandError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let data = expect_ok(session.transact(command_ids::LAST_REJECT_NOTE, &[]).await?)?;
    data.first().copied().ok_or(CommandError::ShortReply {
        expected: 1,
        got: 0,
    })
}

/// Sets a denomination's payout level. When `level` is non-zero this
/// reproduces the original daemon's two-step quirk: a throwaway call with
/// `level = 0` is issued first and its result discarded (`payoutd.c`'s
/// `handleSetDenominationLevels`: "we could not do much anyway now"),
/// then the real call is made and its result returned.
pub async fn set_denomination_level<T>(
    session: &mut Session<T>,
    amount: u32,
    level: u16,
    currency: &str,
) -> Result<(), CommandError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    if level != 0 {
        let mut throwaway = Vec::with_capacity(9);
        throwaway.extend_from_slice(&amount.to_le_bytes());
        throwaway.extend_from_slice(&0u16.to_le_bytes());
        throwaway.extend_from_slice(&currency_bytes(currency));
        let _ = session
            .transact(command_ids::SET_DENOMINATION_LEVEL, &throwaway)
            .await;
    }

    let mut data = Vec::with_capacity(9);
    data.extend_from_slice(&amount.to_le_bytes());
    data.extend_from_slice(&level.to_le_bytes());
    data.extend_from_slice(&currency_bytes(currency));
    expect_ok(
        session
            .transact(command_ids::SET_DENOMINATION_LEVEL, &data)
            .await?,
    )?;
    Ok(())
}

pub async fn get_all_levels<T>(session: &mut Session<T>) -> Result<Vec<LevelEntry>, CommandError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let data = expect_ok(session.transact(command_ids::GET_ALL_LEVELS, &[]).await?)?;
    let mut levels = Vec::new();
    let mut offset = 0usize;
    while offset + 9 <= data.len() {
        let amount = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap());
        let level = u16::from_le_bytes([data[offset + 4], data[offset + 5]]);
        let currency = [data[offset + 6], data[offset + 7], data[offset + 8]];
        levels.push(LevelEntry {
            amount,
            level,
            currency,
        });
        offset += 9;
    }
    Ok(levels)
}

pub async fn set_refill_mode<T>(session: &mut Session<T>, mode: u8) -> Result<(), CommandError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    expect_ok(
        session
            .transact(command_ids::SET_REFILL_MODE, &[mode])
            .await?,
    )?;
    Ok(())
}

pub async fn get_firmware_version<T>(session: &mut Session<T>) -> Result<String, CommandError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let data = expect_ok(
        session
            .transact(command_ids::GET_FIRMWARE_VERSION, &[])
            .await?,
    )?;
    Ok(String::from_utf8_lossy(&data).trim().to_string())
}

pub async fn get_dataset_version<T>(session: &mut Session<T>) -> Result<String, CommandError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let data = expect_ok(
        session
            .transact(command_ids::GET_DATASET_VERSION, &[])
            .await?,
    )?;
    Ok(String::from_utf8_lossy(&data).trim().to_string())
}

pub async fn channel_security_data<T>(session: &mut Session<T>) -> Result<Vec<u8>, CommandError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    expect_ok(
        session
            .transact(command_ids::CHANNEL_SECURITY_DATA, &[])
            .await?,
    )
}

pub async fn run_calibration<T>(session: &mut Session<T>) -> Result<(), CommandError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    expect_ok(session.transact(command_ids::RUN_CALIBRATION, &[]).await?)?;
    Ok(())
}

pub async fn configure_bezel<T>(
    session: &mut Session<T>,
    rgb: (u8, u8, u8),
    volatile: bool,
) -> Result<(), CommandError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let data = [rgb.0, rgb.1, rgb.2, volatile as u8];
    expect_ok(session.transact(command_ids::CONFIGURE_BEZEL, &data).await?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payout_failure_subcode_mapping() {
        assert_eq!(PayoutFailure::from(0x01), PayoutFailure::NotEnoughValue);
        assert_eq!(PayoutFailure::from(0x02), PayoutFailure::CannotPayExact);
        assert_eq!(PayoutFailure::from(0x03), PayoutFailure::Busy);
        assert_eq!(PayoutFailure::from(0x04), PayoutFailure::Disabled);
        assert_eq!(PayoutFailure::from(0x7E), PayoutFailure::Unknown(0x7E));
    }

    #[test]
    fn expect_ok_extracts_status_and_data() {
        let data = expect_ok(vec![status::OK, 0xAA, 0xBB]).unwrap();
        assert_eq!(data, vec![0xAA, 0xBB]);
    }

    #[test]
    fn expect_ok_maps_command_not_processed() {
        let err = expect_ok(vec![status::COMMAND_NOT_PROCESSED, 0x03]).unwrap_err();
        assert!(matches!(
            err,
            CommandError::NotProcessed(PayoutFailure::Busy)
        ));
    }

    #[test]
    fn currency_bytes_pads_short_codes() {
        assert_eq!(currency_bytes("EUR"), *b"EUR");
    }
}
