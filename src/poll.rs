//! Poll loop and event-to-JSON translation (§4.E).
//!
//! Each device is polled roughly once a second, hopper before validator
//! (fixed order, §5). Raw poll events are translated into JSON documents
//! and published to the device's `*-event` topic. [`EventHandler`] replaces
//! the original's per-device function pointer with a plain enum match
//! (spec.md §9 REDESIGN FLAG).

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, warn};

use crate::bus::{Bus, BusError};
use crate::commands::{self, currency_string, ChannelInfo, CommandError, PollEvent};
use crate::device::Device;
use crate::wire::command_ids::poll_event;

#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Which event vocabulary a device's poll results should be translated
/// with. Carries no behavior of its own; `translate` dispatches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventHandler {
    Hopper,
    Validator,
}

impl EventHandler {
    /// `channels` is the device's own setup-reported denomination list;
    /// only the validator vocabulary uses it (to turn a channel index into
    /// a note's minor-unit value, per `payoutd.c`'s `ChannelData[i].value
    /// * 100`).
    pub fn translate(&self, ev: PollEvent, channels: &[ChannelInfo]) -> Value {
        match self {
            EventHandler::Hopper => translate_hopper_event(ev),
            EventHandler::Validator => translate_validator_event(ev, channels),
        }
    }
}

/// Polls one device, translates and publishes every event it reports.
///
/// Two events get special handling before reaching [`EventHandler::translate`],
/// exactly as `payoutd.c`'s handlers do:
///   - `RESET`: publish `{event:"unit reset"}`, then re-announce the host
///     protocol version; a failure there is unrecoverable and exits the
///     process with status 3 (§6/§7).
///   - `CALIBRATION_FAIL` with the `COMMAND_RECAL` sub-reason: publish
///     `{event:"recalibrating"}` and re-issue `RUN CALIBRATION`, instead of
///     reporting it as a failure.
pub async fn poll_device<T>(device: &mut Device<T>, bus: &dyn Bus) -> Result<(), PollError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let topic = format!("{}-event", device.display_name);
    let events = commands::poll(&mut device.session).await?;
    let channels = device
        .setup_info
        .as_ref()
        .map(|info| info.channels.clone())
        .unwrap_or_default();

    for ev in events {
        if ev.event == poll_event::RESET {
            bus.publish(&topic, json!({ "event": "unit reset" }))?;
            if let Err(e) = device.reannounce_host_protocol().await {
                error!(device = device.display_name, error = %e, "host protocol re-negotiation failed after unit reset");
                std::process::exit(3);
            }
            continue;
        }

        if ev.event == poll_event::CALIBRATION_FAIL
            && ev.data1 as u8 == poll_event::calibration_fail::COMMAND_RECAL
        {
            bus.publish(&topic, json!({ "event": "recalibrating" }))?;
            if let Err(e) = commands::run_calibration(&mut device.session).await {
                warn!(device = device.display_name, error = %e, "re-running calibration failed");
            }
            continue;
        }

        let doc = device.event_handler.translate(ev, &channels);
        bus.publish(&topic, doc)?;
    }
    Ok(())
}

fn calibration_fail_reason(code: u8) -> &'static str {
    use poll_event::calibration_fail::*;
    match code {
        NO_FAILURE => "no error",
        SENSOR_FLAP => "sensor flap",
        SENSOR_EXIT => "sensor exit",
        SENSOR_COIL1 => "sensor coil 1",
        SENSOR_COIL2 => "sensor coil 2",
        NOT_INITIALISED => "not initialized",
        CHECKSUM_ERROR => "checksum error",
        _ => "undefined in API",
    }
}

fn translate_hopper_event(ev: PollEvent) -> Value {
    use poll_event::*;
    let cc = currency_string(&ev.cc);
    match ev.event {
        READ if ev.data1 > 0 => json!({ "event": "read", "channel": ev.data1 }),
        READ => json!({ "event": "reading" }),
        DISPENSING => json!({ "event": "dispensing", "amount": ev.data1 }),
        DISPENSED => json!({ "event": "dispensed", "amount": ev.data1 }),
        FLOATING => json!({ "event": "floating", "amount": ev.data1, "cc": cc }),
        FLOATED => json!({ "event": "floated", "amount": ev.data1, "cc": cc }),
        CASHBOX_PAID => json!({ "event": "cashbox paid", "amount": ev.data1, "cc": cc }),
        JAMMED => json!({ "event": "jammed" }),
        FRAUD_ATTEMPT => json!({ "event": "fraud attempt" }),
        COIN_CREDIT => json!({ "event": "coin credit", "amount": ev.data1, "cc": cc }),
        EMPTY => json!({ "event": "empty" }),
        EMPTYING => json!({ "event": "emptying" }),
        SMART_EMPTYING => json!({ "event": "smart emptying", "amount": ev.data1, "cc": cc }),
        SMART_EMPTIED => json!({ "event": "smart emptied", "amount": ev.data1, "cc": cc }),
        CREDIT => json!({ "event": "credit", "channel": ev.data1, "cc": cc }),
        INCOMPLETE_PAYOUT => json!({
            "event": "incomplete payout",
            "dispensed": ev.data1,
            "requested": ev.data2,
            "cc": cc,
        }),
        INCOMPLETE_FLOAT => json!({
            "event": "incomplete float",
            "dispensed": ev.data1,
            "requested": ev.data2,
            "cc": cc,
        }),
        DISABLED => json!({ "event": "disabled" }),
        CALIBRATION_FAIL => json!({
            "event": "calibration fail",
            "error": calibration_fail_reason(ev.data1 as u8),
        }),
        other => json!({ "event": "unknown", "id": format!("{other:#04x}") }),
    }
}

/// Looks up a 1-based channel index into the device's reported denomination
/// table and returns its value scaled to the minor unit
/// (`ChannelData[channel - 1].value * 100`). Falls back to zero if the
/// index is out of range (hardware desync).
fn channel_value_minor(channels: &[ChannelInfo], channel: u32) -> u64 {
    match channels.get(channel.saturating_sub(1) as usize) {
        Some(ch) => u64::from(ch.value) * 100,
        None => 0,
    }
}

fn translate_validator_event(ev: PollEvent, channels: &[ChannelInfo]) -> Value {
    use poll_event::*;
    match ev.event {
        READ if ev.data1 > 0 => {
            let amount = channel_value_minor(channels, ev.data1);
            json!({ "event": "read", "amount": amount, "channel": ev.data1 })
        }
        READ => json!({ "event": "reading" }),
        EMPTY => json!({ "event": "empty" }),
        EMPTYING => json!({ "event": "emptying" }),
        SMART_EMPTYING => json!({ "event": "smart emptying" }),
        CREDIT => {
            let amount = channel_value_minor(channels, ev.data1);
            json!({ "event": "credit", "amount": amount, "channel": ev.data1 })
        }
        INCOMPLETE_PAYOUT => json!({
            "event": "incomplete payout",
            "dispensed": ev.data1,
            "requested": ev.data2,
            "cc": currency_string(&ev.cc),
        }),
        INCOMPLETE_FLOAT => json!({
            "event": "incomplete float",
            "dispensed": ev.data1,
            "requested": ev.data2,
            "cc": currency_string(&ev.cc),
        }),
        REJECTING => json!({ "event": "rejecting" }),
        REJECTED => json!({ "event": "rejected" }),
        STACKING => json!({ "event": "stacking" }),
        STORED => json!({ "event": "stored" }),
        STACKED => json!({ "event": "stacked" }),
        SAFE_JAM => json!({ "event": "safe jam" }),
        UNSAFE_JAM => json!({ "event": "unsafe jam" }),
        DISABLED => json!({ "event": "disabled" }),
        FRAUD_ATTEMPT => json!({ "event": "fraud attempt", "dispensed": ev.data1 }),
        STACKER_FULL => json!({ "event": "stacker full" }),
        CASH_BOX_REMOVED => json!({ "event": "cashbox removed" }),
        CASH_BOX_REPLACED => json!({ "event": "cashbox replaced" }),
        CLEARED_FROM_FRONT => json!({ "event": "cleared from front" }),
        CLEARED_INTO_CASHBOX => json!({ "event": "cleared into cashbox" }),
        CALIBRATION_FAIL => json!({
            "event": "calibration fail",
            "error": calibration_fail_reason(ev.data1 as u8),
        }),
        other => json!({ "event": "unknown", "id": format!("{other:#04x}") }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(event: u8, data1: u32, data2: u32, cc: [u8; 3]) -> PollEvent {
        PollEvent {
            event,
            data1,
            data2,
            cc,
        }
    }

    fn eur(channel: u8, value: u32) -> ChannelInfo {
        ChannelInfo {
            channel,
            value,
            currency: *b"EUR",
        }
    }

    #[test]
    fn hopper_coin_credit_carries_amount_and_currency() {
        let doc = translate_hopper_event(ev(poll_event::COIN_CREDIT, 100, 0, *b"EUR"));
        assert_eq!(doc["event"], "coin credit");
        assert_eq!(doc["amount"], 100);
        assert_eq!(doc["cc"], "EUR");
    }

    #[test]
    fn hopper_read_with_zero_data_is_reading() {
        let doc = translate_hopper_event(ev(poll_event::READ, 0, 0, *b"   "));
        assert_eq!(doc["event"], "reading");
    }

    #[test]
    fn hopper_read_with_channel_is_read() {
        let doc = translate_hopper_event(ev(poll_event::READ, 3, 0, *b"   "));
        assert_eq!(doc["event"], "read");
        assert_eq!(doc["channel"], 3);
    }

    #[test]
    fn hopper_calibration_fail_names_the_reason() {
        let doc = translate_hopper_event(ev(
            poll_event::CALIBRATION_FAIL,
            u32::from(poll_event::calibration_fail::SENSOR_COIL1),
            0,
            *b"   ",
        ));
        assert_eq!(doc["error"], "sensor coil 1");
    }

    #[test]
    fn hopper_incomplete_payout_carries_both_amounts() {
        let doc = translate_hopper_event(ev(poll_event::INCOMPLETE_PAYOUT, 500, 1000, *b"EUR"));
        assert_eq!(doc["dispensed"], 500);
        assert_eq!(doc["requested"], 1000);
        assert_eq!(doc["cc"], "EUR");
    }

    #[test]
    fn validator_read_scales_channel_value_to_minor_units() {
        let channels = vec![eur(1, 5), eur(2, 10)];
        let doc = translate_validator_event(ev(poll_event::READ, 2, 0, *b"   "), &channels);
        assert_eq!(doc["event"], "read");
        assert_eq!(doc["amount"], 1000);
        assert_eq!(doc["channel"], 2);
        assert!(doc.get("cc").is_none());
    }

    #[test]
    fn validator_credit_scales_channel_value() {
        let channels = vec![eur(1, 50)];
        let doc = translate_validator_event(ev(poll_event::CREDIT, 1, 0, *b"   "), &channels);
        assert_eq!(doc["amount"], 5000);
    }

    #[test]
    fn validator_cashbox_events_use_single_word_spelling() {
        let doc = translate_validator_event(ev(poll_event::CASH_BOX_REMOVED, 0, 0, *b"   "), &[]);
        assert_eq!(doc["event"], "cashbox removed");
        let doc = translate_validator_event(ev(poll_event::CASH_BOX_REPLACED, 0, 0, *b"   "), &[]);
        assert_eq!(doc["event"], "cashbox replaced");
    }

    #[test]
    fn validator_fraud_attempt_carries_dispensed() {
        let doc = translate_validator_event(ev(poll_event::FRAUD_ATTEMPT, 250, 0, *b"   "), &[]);
        assert_eq!(doc["dispensed"], 250);
    }

    #[test]
    fn validator_unknown_event_is_tagged_with_hex_id() {
        let doc = translate_validator_event(ev(0x01, 0, 0, *b"   "), &[]);
        assert_eq!(doc["event"], "unknown");
        assert_eq!(doc["id"], "0x01");
    }

    #[test]
    fn event_handler_dispatches_by_device_kind() {
        let hopper_doc = EventHandler::Hopper.translate(ev(poll_event::DISPENSED, 0, 0, *b"   "), &[]);
        assert_eq!(hopper_doc["event"], "dispensed");
        let validator_doc =
            EventHandler::Validator.translate(ev(poll_event::STACKED, 0, 0, *b"   "), &[]);
        assert_eq!(validator_doc["event"], "stacked");
    }
}
