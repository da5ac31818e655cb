//! BME280 grow-room climate sensor over I2C: relative humidity and
//! barometric pressure.
//!
//! Readings are compensated with the factory trim stored on the chip, using
//! the datasheet's floating-point formulas. Temperature is compensated too,
//! since humidity and pressure both depend on it.

#![cfg_attr(not(feature = "gpio"), allow(dead_code))]

/// Default 7-bit address with SDO tied low.
pub const DEFAULT_ADDR: u16 = 0x76;

// ── Register addresses ──────────────────────────────────────────────────────

const REG_CHIP_ID: u8 = 0xD0;
const CHIP_ID: u8 = 0x60;
const REG_RESET: u8 = 0xE0;
const RESET_WORD: u8 = 0xB6;
const REG_CTRL_HUM: u8 = 0xF2;
const REG_CTRL_MEAS: u8 = 0xF4;
const REG_CONFIG: u8 = 0xF5;
/// Burst read start: press_msb .. hum_lsb.
const REG_DATA: u8 = 0xF7;
/// dig_T1 .. dig_P9, 26 bytes including one reserved trailing pair.
const REG_CALIB_TP: u8 = 0x88;
const REG_DIG_H1: u8 = 0xA1;
/// dig_H2 .. dig_H6, 7 bytes.
const REG_CALIB_H: u8 = 0xE1;

/// Humidity oversampling x1. Takes effect on the next ctrl_meas write.
const CTRL_HUM_X1: u8 = 0x01;
/// Temperature and pressure oversampling x1, normal mode.
const CTRL_MEAS_NORMAL: u8 = 0x27;
const CONFIG_FILTER_OFF: u8 = 0x00;

// ── Compensation ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Climate {
    pub temperature: f64,
    /// Relative humidity, percent.
    pub humidity: f64,
    /// Pascal.
    pub pressure: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    t1: u16,
    t2: i16,
    t3: i16,
    p1: u16,
    /// dig_P2 .. dig_P9.
    p: [i16; 8],
    h1: u8,
    h2: i16,
    h3: u8,
    h4: i16,
    h5: i16,
    h6: i8,
}

impl Calibration {
    /// Parse the three trim blocks as read from 0x88, 0xA1 and 0xE1.
    pub fn parse(tp: &[u8; 26], h1: u8, h: &[u8; 7]) -> Self {
        let le_i16 = |i: usize| i16::from_le_bytes([tp[i], tp[i + 1]]);
        let mut p = [0i16; 8];
        for (i, slot) in p.iter_mut().enumerate() {
            *slot = le_i16(8 + 2 * i);
        }
        Self {
            t1: u16::from_le_bytes([tp[0], tp[1]]),
            t2: le_i16(2),
            t3: le_i16(4),
            p1: u16::from_le_bytes([tp[6], tp[7]]),
            p,
            h1,
            h2: i16::from_le_bytes([h[0], h[1]]),
            h3: h[2],
            // 12-bit values sharing the nibbles of 0xE5.
            h4: (i16::from(h[3] as i8) << 4) | i16::from(h[4] & 0x0F),
            h5: (i16::from(h[5] as i8) << 4) | i16::from(h[4] >> 4),
            h6: h[6] as i8,
        }
    }

    /// Compensate one burst read of the data registers.
    pub fn compensate(&self, data: &[u8; 8]) -> Climate {
        let (adc_p, adc_t, adc_h) = split_raw(data);
        let t_fine = self.t_fine(adc_t);
        Climate {
            temperature: t_fine / 5120.0,
            humidity: self.humidity(adc_h, t_fine),
            pressure: self.pressure(adc_p, t_fine),
        }
    }

    fn t_fine(&self, adc_t: u32) -> f64 {
        let adc = f64::from(adc_t);
        let t1 = f64::from(self.t1);
        let var1 = (adc / 16384.0 - t1 / 1024.0) * f64::from(self.t2);
        let d = adc / 131072.0 - t1 / 8192.0;
        let var2 = d * d * f64::from(self.t3);
        var1 + var2
    }

    fn pressure(&self, adc_p: u32, t_fine: f64) -> f64 {
        let p = |n: usize| f64::from(self.p[n - 2]);
        let mut var1 = t_fine / 2.0 - 64000.0;
        let mut var2 = var1 * var1 * p(6) / 32768.0;
        var2 += var1 * p(5) * 2.0;
        var2 = var2 / 4.0 + p(4) * 65536.0;
        var1 = (p(3) * var1 * var1 / 524288.0 + p(2) * var1) / 524288.0;
        var1 = (1.0 + var1 / 32768.0) * f64::from(self.p1);
        if var1 == 0.0 {
            return 0.0;
        }
        let mut pa = 1048576.0 - f64::from(adc_p);
        pa = (pa - var2 / 4096.0) * 6250.0 / var1;
        let var1 = p(9) * pa * pa / 2147483648.0;
        let var2 = pa * p(8) / 32768.0;
        pa + (var1 + var2 + p(7)) / 16.0
    }

    fn humidity(&self, adc_h: u32, t_fine: f64) -> f64 {
        let v = t_fine - 76800.0;
        let v = (f64::from(adc_h) - (f64::from(self.h4) * 64.0 + f64::from(self.h5) / 16384.0 * v))
            * (f64::from(self.h2) / 65536.0
                * (1.0 + f64::from(self.h6) / 67108864.0 * v * (1.0 + f64::from(self.h3) / 67108864.0 * v)));
        let v = v * (1.0 - f64::from(self.h1) * v / 524288.0);
        v.clamp(0.0, 100.0)
    }
}

/// (pressure, temperature, humidity) ADC values: 20, 20 and 16 bits.
fn split_raw(d: &[u8; 8]) -> (u32, u32, u32) {
    let twenty = |msb: u8, lsb: u8, xlsb: u8| (u32::from(msb) << 12) | (u32::from(lsb) << 4) | (u32::from(xlsb) >> 4);
    (
        twenty(d[0], d[1], d[2]),
        twenty(d[3], d[4], d[5]),
        (u32::from(d[6]) << 8) | u32::from(d[7]),
    )
}

// ── Driver ──────────────────────────────────────────────────────────────────

#[cfg(feature = "gpio")]
pub use driver::Bme280;

#[cfg(feature = "gpio")]
mod driver {
    use super::*;
    use crate::sensors::ClimateSensor;
    use anyhow::bail;
    use rppal::i2c::I2c;
    use std::thread;
    use std::time::Duration;

    const SETTLE: Duration = Duration::from_millis(100);

    /// BME280 driver backed by `rppal::i2c` on bus 1.
    pub struct Bme280 {
        i2c: I2c,
        calibration: Calibration,
    }

    impl Bme280 {
        pub fn new(addr: u16) -> anyhow::Result<Self> {
            let mut i2c = I2c::new()?;
            i2c.set_slave_address(addr)?;

            let mut id = [0u8; 1];
            i2c.write_read(&[REG_CHIP_ID], &mut id)?;
            if id[0] != CHIP_ID {
                bail!("not a bme280 at 0x{addr:02x}: chip id 0x{:02x}", id[0]);
            }

            i2c.write(&[REG_RESET, RESET_WORD])?;
            thread::sleep(SETTLE);

            let mut tp = [0u8; 26];
            i2c.write_read(&[REG_CALIB_TP], &mut tp)?;
            let mut h1 = [0u8; 1];
            i2c.write_read(&[REG_DIG_H1], &mut h1)?;
            let mut h = [0u8; 7];
            i2c.write_read(&[REG_CALIB_H], &mut h)?;
            let calibration = Calibration::parse(&tp, h1[0], &h);

            i2c.write(&[REG_CTRL_HUM, CTRL_HUM_X1])?;
            i2c.write(&[REG_CTRL_MEAS, CTRL_MEAS_NORMAL])?;
            i2c.write(&[REG_CONFIG, CONFIG_FILTER_OFF])?;
            thread::sleep(SETTLE);

            tracing::info!(addr = format_args!("0x{addr:02x}"), "bme280 initialised");
            Ok(Self { i2c, calibration })
        }
    }

    impl ClimateSensor for Bme280 {
        fn read_climate(&mut self) -> anyhow::Result<Climate> {
            let mut data = [0u8; 8];
            self.i2c.write_read(&[REG_DATA], &mut data)?;
            let climate = self.calibration.compensate(&data);
            tracing::debug!(
                temperature = climate.temperature,
                humidity = climate.humidity,
                pressure = climate.pressure,
                "bme280 reading"
            );
            Ok(climate)
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Datasheet example trim with humidity values from a bench part.
    fn calibration() -> Calibration {
        let words: [i32; 12] = [
            27504, 26435, -1000, 36477, -10685, 3024, 2855, 140, -7, 15500, -14600, 6000,
        ];
        let mut tp = [0u8; 26];
        for (i, w) in words.iter().enumerate() {
            let bytes = (*w as u16).to_le_bytes();
            tp[2 * i] = bytes[0];
            tp[2 * i + 1] = bytes[1];
        }
        // dig_H2 = 357, dig_H3 = 0, dig_H4 = 332, dig_H5 = 0, dig_H6 = 30
        Calibration::parse(&tp, 75, &[101, 1, 0, 20, 12, 0, 30])
    }

    /// Data registers for adc_P = 415148, adc_T = 519888, adc_H = `hum`.
    fn data(hum: u16) -> [u8; 8] {
        let p: u32 = 415148;
        let t: u32 = 519888;
        let [h_msb, h_lsb] = hum.to_be_bytes();
        [
            (p >> 12) as u8,
            (p >> 4) as u8,
            ((p & 0x0F) << 4) as u8,
            (t >> 12) as u8,
            (t >> 4) as u8,
            ((t & 0x0F) << 4) as u8,
            h_msb,
            h_lsb,
        ]
    }

    #[test]
    fn parse_trim_words() {
        let c = calibration();
        assert_eq!(c.t1, 27504);
        assert_eq!(c.t3, -1000);
        assert_eq!(c.p1, 36477);
        assert_eq!(c.p[0], -10685);
        assert_eq!(c.p[4], -7);
        assert_eq!(c.p[7], 6000);
        assert_eq!((c.h2, c.h3, c.h4, c.h5, c.h6), (357, 0, 332, 0, 30));
    }

    #[test]
    fn negative_humidity_nibbles_sign_extend() {
        let c = Calibration::parse(&[0; 26], 0, &[0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(c.h4, -1);
        assert_eq!(c.h5, -1);
        assert_eq!(c.h6, -1);
    }

    #[test]
    fn split_raw_reassembles_adc_values() {
        assert_eq!(split_raw(&data(32768)), (415148, 519888, 32768));
    }

    #[test]
    fn datasheet_temperature_and_pressure() {
        let climate = calibration().compensate(&data(32768));
        assert!((climate.temperature - 25.08).abs() < 0.01, "{climate:?}");
        assert!((climate.pressure - 100653.26).abs() < 0.1, "{climate:?}");
    }

    #[test]
    fn humidity_from_trim() {
        let climate = calibration().compensate(&data(32768));
        assert!((climate.humidity - 63.61).abs() < 0.01, "{climate:?}");
    }

    #[test]
    fn humidity_is_clamped() {
        let c = calibration();
        assert_eq!(c.compensate(&data(0)).humidity, 0.0);
        assert_eq!(c.compensate(&data(u16::MAX)).humidity, 100.0);
    }
}
