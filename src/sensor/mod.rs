//! Entities backed by local hardware
//!
//! - [`bh1750`] - ambient light sensor on the I2C bus
//! - [`status`] - `online` beacon and refresh command
//!
//! Sensors talk to the bus through [`I2cBus`] so they can be exercised without
//! a Raspberry Pi attached.

pub mod bh1750;
pub mod status;

use rppal::i2c::I2c;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;

use crate::registry::EntityError;

/// Minimal I2C operations the sensors need
pub trait I2cBus: Send {
    /// Write `command` to `address`, then read `buffer.len()` bytes back
    fn block_read(
        &mut self,
        address: u16,
        command: u8,
        buffer: &mut [u8],
    ) -> Result<(), EntityError>;
}

/// Bus handle that serializes access between entities sharing one bus
#[derive(Clone)]
pub struct SharedBus {
    inner: Arc<Mutex<dyn I2cBus>>,
}

impl SharedBus {
    pub fn new(bus: impl I2cBus + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(bus)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, dyn I2cBus + 'static> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Linux `/dev/i2c-N` bus via rppal
pub struct RppalBus {
    i2c: I2c,
}

impl RppalBus {
    pub fn open(bus: u8) -> Result<Self, EntityError> {
        let i2c = I2c::with_bus(bus).map_err(|e| EntityError::Bus(e.to_string()))?;
        info!("Opened I2C bus {}", bus);
        Ok(Self { i2c })
    }
}

impl I2cBus for RppalBus {
    fn block_read(
        &mut self,
        address: u16,
        command: u8,
        buffer: &mut [u8],
    ) -> Result<(), EntityError> {
        self.i2c
            .set_slave_address(address)
            .map_err(|e| EntityError::Bus(format!("address {address:#04x}: {e}")))?;
        self.i2c
            .block_read(command, buffer)
            .map_err(|e| EntityError::Bus(format!("read {address:#04x}/{command:#04x}: {e}")))
    }
}
