//! CLI surface (§6/§2 item K).

use clap::Parser;

/// Bridges a coin hopper and banknote validator to a pub/sub bus over the
/// SSP serial protocol.
#[derive(Debug, Parser)]
#[command(name = "cashbridged", version)]
pub struct Args {
    /// Serial device the hopper and validator are multi-dropped on.
    #[arg(short = 'd', long = "device", default_value = "/dev/ttyACM0")]
    pub device: String,

    /// Pub/sub broker host.
    #[arg(short = 'h', long = "host", default_value = "127.0.0.1")]
    pub host: String,

    /// Pub/sub broker port.
    #[arg(short = 'p', long = "port", default_value_t = 6379)]
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_original_daemon() {
        let args = Args::parse_from(["cashbridged"]);
        assert_eq!(args.device, "/dev/ttyACM0");
        assert_eq!(args.host, "127.0.0.1");
        assert_eq!(args.port, 6379);
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from(["cashbridged", "-d", "/dev/ttyUSB0", "-h", "10.0.0.5", "-p", "7000"]);
        assert_eq!(args.device, "/dev/ttyUSB0");
        assert_eq!(args.host, "10.0.0.5");
        assert_eq!(args.port, 7000);
    }
}
