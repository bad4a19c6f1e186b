//! Serial transport adapter (§2 item H).
//!
//! Wraps `tokio_serial::SerialStream` so the rest of the daemon only deals
//! with a plain `AsyncRead + AsyncWrite` type. Opening the device is
//! non-fatal: a missing or busy serial port means the daemon still starts,
//! still answers `quit`/`test` on the bus, and replies "hardware
//! unavailable" to every other request, mirroring the original's
//! `metacash.deviceAvailable` flag (§4 Failure semantics).

use tokio_serial::SerialPortBuilderExt;
use tracing::{error, info};

/// Baud rate fixed by the protocol/hardware (`mcSspSetupCommand`'s
/// `BaudRate = 9600`).
pub const BAUD_RATE: u32 = 9600;

/// Attempts to open `path` as the shared serial bus. Returns `None` (and
/// logs) on failure instead of propagating an error, since the caller
/// treats an absent device as a degraded-but-running daemon, not a fatal
/// startup error.
pub fn open(path: &str) -> Option<tokio_serial::SerialStream> {
    match tokio_serial::new(path, BAUD_RATE).open_native_async() {
        Ok(port) => {
            info!(path, baud = BAUD_RATE, "opened serial device");
            Some(port)
        }
        Err(e) => {
            error!(path, error = %e, "failed to open serial device, continuing without hardware");
            None
        }
    }
}
