//! BH1750 ambient light sensor
//!
//! Each sample is a two byte big-endian block read, with the measurement mode
//! as the command byte. The raw count divided by 1.2 is the illuminance in
//! lux. The mode can be switched at runtime through `<root>/lux/set`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::SharedBus;
use crate::registry::{CommandContext, Commandable, EntityError, Publishable};

/// Counts per lux at the default measurement time
const COUNTS_PER_LUX: f64 = 1.2;

/// Measurement modes accepted by the sensor
pub const MODES: [u8; 6] = [0x10, 0x11, 0x13, 0x20, 0x21, 0x23];

pub fn decode_lux(raw: [u8; 2]) -> f64 {
    f64::from(u16::from_be_bytes(raw)) / COUNTS_PER_LUX
}

pub fn format_lux(lux: f64) -> String {
    format!("{lux:.2}")
}

/// Parse an integer the way config files write them: `32`, `0x20`, `0o40`
/// or `0b100000`.
pub fn parse_int(text: &str) -> Option<u32> {
    let text = text.trim();
    let lower = text.to_ascii_lowercase();
    let (digits, radix) = if let Some(hex) = lower.strip_prefix("0x") {
        (hex, 16)
    } else if let Some(oct) = lower.strip_prefix("0o") {
        (oct, 8)
    } else if let Some(bin) = lower.strip_prefix("0b") {
        (bin, 2)
    } else {
        (lower.as_str(), 10)
    };
    u32::from_str_radix(digits, radix).ok()
}

/// Current measurement mode, shared between sensor and command handler
#[derive(Clone, Debug)]
pub struct ModeHandle(Arc<AtomicU8>);

impl ModeHandle {
    pub fn new(mode: u8) -> Self {
        Self(Arc::new(AtomicU8::new(mode)))
    }

    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, mode: u8) {
        self.0.store(mode, Ordering::Relaxed);
    }
}

pub struct LuxSensor {
    bus: SharedBus,
    address: u16,
    mode: ModeHandle,
}

impl LuxSensor {
    pub fn new(bus: SharedBus, address: u16, mode: ModeHandle) -> Self {
        Self { bus, address, mode }
    }

    pub fn read_lux(&self) -> Result<f64, EntityError> {
        let mut raw = [0u8; 2];
        self.bus.lock().block_read(self.address, self.mode.get(), &mut raw)?;
        let lux = decode_lux(raw);
        debug!("BH1750 raw {:02x?} -> {} lx", raw, lux);
        Ok(lux)
    }
}

impl Publishable for LuxSensor {
    fn sample(&mut self) -> Result<String, EntityError> {
        self.read_lux().map(format_lux)
    }
}

/// Handles `<root>/lux/set`: payload is a measurement mode byte
pub struct LuxModeCommand {
    mode: ModeHandle,
}

impl LuxModeCommand {
    pub fn new(mode: ModeHandle) -> Self {
        Self { mode }
    }
}

impl Commandable for LuxModeCommand {
    fn command(&self, payload: &str, ctx: &CommandContext) -> Result<(), EntityError> {
        let mode = parse_int(payload)
            .and_then(|value| u8::try_from(value).ok())
            .filter(|mode| MODES.contains(mode))
            .ok_or_else(|| {
                EntityError::InvalidCommand(format!("'{}' is not a BH1750 mode", payload.trim()))
            })?;

        let previous = self.mode.get();
        self.mode.set(mode);
        info!("BH1750 mode {:#04x} -> {:#04x}", previous, mode);
        ctx.request_refresh();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::I2cBus;
    use crate::session::state::SharedState;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct FakeBus {
        reads: Arc<Mutex<Vec<(u16, u8)>>>,
        response: Option<[u8; 2]>,
    }

    impl I2cBus for FakeBus {
        fn block_read(
            &mut self,
            address: u16,
            command: u8,
            buffer: &mut [u8],
        ) -> Result<(), EntityError> {
            self.reads.lock().unwrap().push((address, command));
            match self.response {
                Some(bytes) => {
                    buffer.copy_from_slice(&bytes);
                    Ok(())
                }
                None => Err(EntityError::Bus("remote I/O error".into())),
            }
        }
    }

    #[test]
    fn decodes_big_endian_counts() {
        assert_eq!(decode_lux([0x00, 0x00]), 0.0);
        assert_eq!(decode_lux([0x00, 0x78]), 100.0);
        assert_eq!(decode_lux([0x01, 0x00]), 256.0 / 1.2);
        assert_eq!(format_lux(decode_lux([0xff, 0xff])), "54612.50");
    }

    #[test]
    fn parses_prefixed_integers() {
        assert_eq!(parse_int("32"), Some(32));
        assert_eq!(parse_int(" 0x20\n"), Some(0x20));
        assert_eq!(parse_int("0X23"), Some(0x23));
        assert_eq!(parse_int("0o20"), Some(0o20));
        assert_eq!(parse_int("0b10000"), Some(16));
        assert_eq!(parse_int("high"), None);
        assert_eq!(parse_int(""), None);
    }

    #[test]
    fn samples_with_configured_address_and_mode() {
        let bus = FakeBus {
            response: Some([0x00, 0x78]),
            ..FakeBus::default()
        };
        let reads = bus.reads.clone();
        let mut sensor = LuxSensor::new(SharedBus::new(bus), 0x23, ModeHandle::new(0x20));

        assert_eq!(sensor.sample().unwrap(), "100.00");
        assert_eq!(*reads.lock().unwrap(), vec![(0x23, 0x20)]);
    }

    #[test]
    fn bus_failure_is_reported() {
        let bus = SharedBus::new(FakeBus::default());
        let mut sensor = LuxSensor::new(bus, 0x23, ModeHandle::new(0x20));
        assert!(matches!(sensor.sample(), Err(EntityError::Bus(_))));
    }

    #[test]
    fn mode_command_switches_mode_and_requests_refresh() {
        let bus = FakeBus {
            response: Some([0x00, 0x01]),
            ..FakeBus::default()
        };
        let reads = bus.reads.clone();
        let mode = ModeHandle::new(0x20);
        let mut sensor = LuxSensor::new(SharedBus::new(bus), 0x23, mode.clone());
        let command = LuxModeCommand::new(mode);

        let state = SharedState::new();
        state.with(|s| s.dirty = false);
        command.command("0x11", &CommandContext::new(state.clone())).unwrap();
        assert!(state.is_dirty());

        sensor.sample().unwrap();
        assert_eq!(*reads.lock().unwrap(), vec![(0x23, 0x11)]);
    }

    #[test]
    fn mode_command_rejects_unknown_modes() {
        let mode = ModeHandle::new(0x20);
        let command = LuxModeCommand::new(mode.clone());
        let state = SharedState::new();
        state.with(|s| s.dirty = false);
        let ctx = CommandContext::new(state.clone());

        for payload in ["0x42", "300", "bright"] {
            assert!(matches!(
                command.command(payload, &ctx),
                Err(EntityError::InvalidCommand(_))
            ));
        }
        assert_eq!(mode.get(), 0x20);
        assert!(!state.is_dirty());
    }
}
