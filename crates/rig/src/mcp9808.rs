//! MCP9808 ambient temperature sensor over I2C.
//!
//! The ambient register holds a 13-bit two's-complement reading in 1/16 °C
//! steps; the top three bits are alert flags and are masked off.

#![cfg_attr(not(feature = "gpio"), allow(dead_code))]

/// Default 7-bit address with A0–A2 tied low.
pub const DEFAULT_ADDR: u16 = 0x18;

// ── Register addresses ──────────────────────────────────────────────────────

/// Ambient temperature register (read-only, 16-bit).
const REG_AMBIENT: u8 = 0x05;
/// Manufacturer ID register; reads 0x0054 on a genuine part.
const REG_MANUFACTURER: u8 = 0x06;
const MANUFACTURER_ID: u16 = 0x0054;

// ── Decoding ────────────────────────────────────────────────────────────────

const FLAG_MASK: u8 = 0x1F;
const SIGN_BIT: u8 = 0x10;

/// Decode the two ambient-register bytes (MSB first) into °C.
pub fn decode_ambient(raw: [u8; 2]) -> f64 {
    let upper = raw[0] & FLAG_MASK;
    let lower = raw[1];
    let magnitude = f64::from(upper & 0x0F) * 16.0 + f64::from(lower) / 16.0;
    if upper & SIGN_BIT != 0 {
        magnitude - 256.0
    } else {
        magnitude
    }
}

// ── Driver ──────────────────────────────────────────────────────────────────

#[cfg(feature = "gpio")]
pub use driver::Mcp9808;

#[cfg(feature = "gpio")]
mod driver {
    use super::*;
    use crate::sensors::TemperatureSensor;
    use rppal::i2c::I2c;

    /// MCP9808 driver backed by `rppal::i2c` on bus 1.
    pub struct Mcp9808 {
        i2c: I2c,
    }

    impl Mcp9808 {
        pub fn new(addr: u16) -> anyhow::Result<Self> {
            let mut i2c = I2c::new()?;
            i2c.set_slave_address(addr)?;

            let mut buf = [0u8; 2];
            i2c.block_read(REG_MANUFACTURER, &mut buf)?;
            let id = u16::from_be_bytes(buf);
            if id != MANUFACTURER_ID {
                tracing::warn!(
                    addr = format_args!("0x{addr:02x}"),
                    id = format_args!("0x{id:04x}"),
                    "unexpected mcp9808 manufacturer id"
                );
            }

            tracing::info!(addr = format_args!("0x{addr:02x}"), "mcp9808 initialised");
            Ok(Self { i2c })
        }
    }

    impl TemperatureSensor for Mcp9808 {
        fn read_celsius(&mut self) -> anyhow::Result<f64> {
            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_AMBIENT, &mut buf)?;
            Ok(decode_ambient(buf))
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
