//! Layered error stack (§7): `FrameError` → `SessionError` → `ProtocolError`
//! → `DispatchError`. The first three propagate as `Result`s the way the
//! teacher's `FrameError`/`ProtocolError` do; `DispatchError` is the one
//! layer that never propagates past the dispatcher — it always becomes a
//! JSON error envelope instead (§4 Dispatcher algorithm, §8 scenarios 1-3).

use thiserror::Error;

use crate::commands::CommandError;
use crate::device::DeviceError;
use crate::session::SessionError;

/// Everything that can go wrong talking to a device, above the raw wire
/// layer (`wire::FrameError` is already wrapped by [`SessionError`]).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Envelope-level failures the dispatcher turns into a JSON error reply
/// rather than letting propagate to the event loop.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("could not parse json: {reason}")]
    MalformedJson { reason: String },
    #[error("Property '{0}' missing or of wrong type")]
    MissingProperty(&'static str),
    #[error("unknown command")]
    UnknownCommand,
    #[error("unknown topic")]
    UnknownTopic,
    #[error("hardware unavailable")]
    HardwareUnavailable,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
