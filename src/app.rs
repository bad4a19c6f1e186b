//! Application-scoped context (§9 REDESIGN FLAG): the original daemon kept
//! its devices, bus handle and shutdown flag in static globals reachable
//! from anywhere; here they live in one [`App`] value threaded explicitly
//! through the event loop instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_serial::SerialStream;
use tracing::warn;

use crate::bus::RedisBus;
use crate::device::Device;

/// Everything the event loop needs each tick. Either device is `None` when
/// its bring-up never completed (missing serial port, or a hardware
/// handshake failure that isn't itself fatal) — the dispatcher answers
/// `hardware unavailable` for that device's requests until restarted.
pub struct App {
    pub bus: RedisBus,
    pub hopper: Option<Device<SerialStream>>,
    pub validator: Option<Device<SerialStream>>,
    pub shutdown: Arc<AtomicBool>,
}

impl App {
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Brings up both devices on the shared multi-drop transport, logging
    /// and leaving a device `None` rather than failing the whole daemon if
    /// its particular init sequence doesn't complete (§4 Failure semantics:
    /// only a mid-session `RESET`-recovery failure is fatal, not a
    /// first-bring-up failure).
    pub async fn bring_up_devices(transport: Arc<Mutex<SerialStream>>) -> (Option<Device<SerialStream>>, Option<Device<SerialStream>>) {
        let mut hopper = Device::new_hopper(Arc::clone(&transport));
        let hopper = match hopper.init_hopper().await {
            Ok(()) => Some(hopper),
            Err(e) => {
                warn!(error = %e, "hopper init failed, continuing without hopper hardware");
                None
            }
        };

        let mut validator = Device::new_validator(transport);
        let validator = match validator.init_validator().await {
            Ok(()) => Some(validator),
            Err(e) => {
                warn!(error = %e, "validator init failed, continuing without validator hardware");
                None
            }
        };

        (hopper, validator)
    }
}
