//! # VL53L0X Time-of-Flight Distance Sensor Driver
//!
//! This crate provides an async-capable, `no_std` driver for ST-Microelectronics'
//! VL53L0X time-of-flight distance sensor.
//!
//! The sensor speaks a register protocol over I2C that must be driven in an
//! exact order: reference SPAD configuration, a vendor tuning program, and two
//! reference calibration passes, all before the first measurement. [`VL53L0x::init`]
//! performs that whole sequence; afterwards single-shot and continuous ranging
//! are available.
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use vl53l0x::{Millimeters, VL53L0x};
//!
//! let i2c = embedded_hal_mock::eh1::i2c::Mock::new(&[]);
//! let delay = embedded_hal_mock::eh1::delay::NoopDelay;
//! let mut sensor = VL53L0x::new(i2c, delay);
//!
//! sensor.init().unwrap();
//!
//! let distance = sensor.read_single_distance().unwrap();
//! println!("{}", Millimeters(distance)); // e.g. "123.4 cm "
//! ```
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod fmt; // <-- must be first module!

#[cfg(not(feature = "async"))]
use embedded_hal::{delay::DelayNs, i2c::I2c};
#[cfg(feature = "async")]
use embedded_hal_async::{delay::DelayNs, i2c::I2c};

/// Default I2C address of the VL53L0X.
pub const DEFAULT_ADDRESS: u8 = 0x29;

/// Poll attempts before a hardware-readiness wait is declared timed out.
/// One attempt per millisecond, so roughly a one second budget.
const POLL_LIMIT: u16 = 1000;

// Vendor tuning program applied during init. The values are empirically
// determined by ST and shipped as-is in every reference driver; the exact
// bytes and their order are load-bearing, including the interleaved bank
// switches through the page-select register 0xFF.
const TUNING_SETTINGS: &[(u8, u8)] = &[
    (0xFF, 0x01),
    (0x00, 0x00),
    // range sequencing, bank 0
    (0xFF, 0x00),
    (0x09, 0x00),
    (0x10, 0x00),
    (0x11, 0x00),
    (0x24, 0x01),
    (0x25, 0xFF),
    (0x75, 0x00),
    // dynamic SPAD block, bank 1
    (0xFF, 0x01),
    (0x4E, 0x2C),
    (0x48, 0x00),
    (0x30, 0x20),
    // MSRC and pre-range timing, bank 0
    (0xFF, 0x00),
    (0x30, 0x09),
    (0x54, 0x00),
    (0x31, 0x04),
    (0x32, 0x03),
    (0x40, 0x83),
    (0x46, 0x25),
    (0x60, 0x00),
    (0x27, 0x00),
    (0x50, 0x06),
    (0x51, 0x00),
    (0x52, 0x96),
    (0x56, 0x08),
    (0x57, 0x30),
    (0x61, 0x00),
    (0x62, 0x00),
    (0x64, 0x00),
    (0x65, 0x00),
    (0x66, 0xA0),
    // ambient and count-rate filtering, bank 1
    (0xFF, 0x01),
    (0x22, 0x32),
    (0x47, 0x14),
    (0x49, 0xFF),
    (0x4A, 0x00),
    // final-range VCSEL tuning
    (0xFF, 0x00),
    (0x7A, 0x0A),
    (0x7B, 0x00),
    (0x78, 0x21),
    (0xFF, 0x01),
    (0x23, 0x34),
    (0x42, 0x00),
    (0x44, 0xFF),
    (0x45, 0x26),
    (0x46, 0x05),
    (0x40, 0x40),
    (0x0E, 0x06),
    (0x20, 0x1A),
    (0x43, 0x40),
    (0xFF, 0x00),
    (0x34, 0x03),
    (0x35, 0x44),
    (0xFF, 0x01),
    (0x31, 0x04),
    (0x4B, 0x09),
    (0x4C, 0x05),
    (0x4D, 0x04),
    // timeout and limit-check defaults, bank 0
    (0xFF, 0x00),
    (0x44, 0x00),
    (0x45, 0x20),
    (0x47, 0x08),
    (0x48, 0x28),
    (0x67, 0x00),
    (0x70, 0x04),
    (0x71, 0x01),
    (0x72, 0xFE),
    (0x76, 0x00),
    (0x77, 0x00),
    // power management handshake
    (0xFF, 0x01),
    (0x0D, 0x01),
    (0xFF, 0x00),
    (0x80, 0x01),
    (0x01, 0xF8),
    (0xFF, 0x01),
    (0x8E, 0x01),
    (0x00, 0x01),
    (0xFF, 0x00),
    (0x80, 0x00),
];

/// Register addresses for the VL53L0X sensor.
///
/// Only the registers with documented names appear here; the init and SPAD
/// sequences additionally touch a number of vendor-internal addresses that
/// are kept as raw literals at their call sites, matching ST's reference
/// driver.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::doc_markdown)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Register {
    /// Ranging start/stop register (0x00); bit 0 is the start pulse
    SysrangeStart = 0x00,
    /// Sequence step enable register (0x01)
    SystemSequenceConfig = 0x01,
    /// 32-bit inter-measurement period register (0x04)
    SystemIntermeasurementPeriod = 0x04,
    /// GPIO interrupt mode register (0x0A); 0x04 = new sample ready
    SystemInterruptConfigGpio = 0x0A,
    /// Interrupt clear register (0x0B)
    SystemInterruptClear = 0x0B,
    /// Interrupt status register (0x13); low 3 bits nonzero = data ready
    ResultInterruptStatus = 0x13,
    /// Base of the ranging result block (0x14)
    ResultRangeStatus = 0x14,
    /// Final-range minimum count rate limit, Q9.7 MCPS (0x44)
    FinalRangeConfigMinCountRateRtnLimit = 0x44,
    /// Requested reference SPAD count register (0x4E)
    DynamicSpadNumRequestedRefSpad = 0x4E,
    /// Reference SPAD enable start offset register (0x4F)
    DynamicSpadRefEnStartOffset = 0x4F,
    /// MSRC configuration register (0x60)
    MsrcConfigControl = 0x60,
    /// GPIO interrupt polarity register (0x84); bit 4 = active high
    GpioHvMuxActiveHigh = 0x84,
    /// Pad supply configuration register (0x89); bit 0 = 2V8 I/O mode
    VhvConfigPadSclSdaExtsupHv = 0x89,
    /// First of the six factory reference SPAD enable registers (0xB0)
    GlobalConfigSpadEnablesRef0 = 0xB0,
    /// Reference SPAD enable start select register (0xB6)
    GlobalConfigRefEnStartSelect = 0xB6,
    /// Model identification register (0xC0), reads 0xEE
    IdentificationModelId = 0xC0,
    /// Revision identification register (0xC1), reads 0xAA
    IdentificationRevisionId = 0xC1,
    /// Module identification register (0xC2), reads 0x10
    IdentificationModuleId = 0xC2,
    /// Oscillator calibration word (0xF8), scales timed-mode periods
    OscCalibrateVal = 0xF8,
}

impl From<Register> for u8 {
    fn from(r: Register) -> Self {
        r as u8
    }
}

/// The two reference calibration passes run during [`VL53L0x::init`].
///
/// They calibrate different internal analog paths and must run in order,
/// VHV first, phase second; neither replaces the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CalibrationPass {
    /// Reference voltage (VHV) calibration, started with mode bit 0x40
    Vhv,
    /// Ranging phase calibration, started with mode bit 0x00
    Phase,
}

/// A millimeter reading that formats itself as centimeters.
///
/// The output is `"<whole>.<tenths> cm "` with a single tenths digit and a
/// trailing space; the tenths digit is the integer remainder, not a rounded
/// decimal.
///
/// # Examples
///
/// ```rust
/// use vl53l0x::Millimeters;
///
/// assert_eq!(Millimeters(1234).to_string(), "123.4 cm ");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Millimeters(pub u16);

impl core::fmt::Display for Millimeters {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{} cm ", self.0 / 10, self.0 % 10)
    }
}

/// VL53L0X time-of-flight distance sensor driver.
///
/// The driver owns the bus and delay implementations and is generic over
/// both, so it works with any embedded-hal (or, with the `async` feature,
/// embedded-hal-async) compatible hardware. It assumes exclusive ownership
/// of the device at the fixed default address for its entire lifetime.
pub struct VL53L0x<I2C, D> {
    /// I2C interface for communication with the sensor
    i2c: I2C,
    /// 7-bit I2C address of the sensor
    address: u8,
    /// Delay implementation pacing the poll loops
    delay: D,
    /// Whether a continuous ranging session is active
    started: bool,
    /// Internal calibration byte captured from register 0x91 during init.
    /// The sensor's state machine expects it replayed verbatim before every
    /// ranging start and stop; a corrupted value silently produces
    /// wrong-mode operation rather than an error.
    stop_variable: u8,
}

#[maybe_async_cfg::maybe(
    sync(cfg(not(feature = "async")), keep_self),
    async(feature = "async", keep_self)
)]
impl<I2C, E, D> VL53L0x<I2C, D>
where
    I2C: I2c<Error = E>,
    E: core::fmt::Debug,
    D: DelayNs,
{
    /// Creates a new driver instance at the default address (0x29).
    ///
    /// No commands are sent; the sensor must be brought up with
    /// [`init`](Self::init) before any ranging call.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use vl53l0x::VL53L0x;
    ///
    /// let i2c = embedded_hal_mock::eh1::i2c::Mock::new(&[]);
    /// let delay = embedded_hal_mock::eh1::delay::NoopDelay;
    ///
    /// let mut sensor = VL53L0x::new(i2c, delay);
    /// ```
    pub fn new(i2c: I2C, delay: D) -> Self {
        Self {
            i2c,
            address: DEFAULT_ADDRESS,
            delay,
            started: false,
            stop_variable: 0,
        }
    }

    /// Whether a continuous ranging session is currently active.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Initializes the sensor for ranging.
    ///
    /// This runs the full bring-up program: identity check, I/O voltage
    /// configuration, stop-variable capture, reference SPAD configuration,
    /// the vendor tuning program, interrupt setup and both reference
    /// calibration passes. The steps are strictly ordered and the sequence
    /// must complete once before any ranging call; it is not re-entrant.
    ///
    /// # Errors
    ///
    /// * [`Error::IdentityMismatch`] - The device did not report the
    ///   VL53L0X identification signature; nothing beyond the three ID
    ///   reads was sent.
    /// * [`Error::SpadDiscoveryTimeout`] - SPAD discovery never signalled
    ///   completion within ~1 s.
    /// * [`Error::CalibrationTimeout`] - One of the calibration passes
    ///   never signalled completion within ~1 s.
    /// * [`Error::I2cError`] - An I2C transfer failed.
    ///
    /// On any error the device is left not-ready (no partial-state
    /// cleanup); the only recovery is calling `init` again.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use vl53l0x::VL53L0x;
    ///
    /// let i2c = embedded_hal_mock::eh1::i2c::Mock::new(&[]);
    /// let delay = embedded_hal_mock::eh1::delay::NoopDelay;
    /// let mut sensor = VL53L0x::new(i2c, delay);
    ///
    /// sensor.init().unwrap();
    /// ```
    pub async fn init(&mut self) -> Result<(), Error<E>> {
        let model = self.read_byte(Register::IdentificationModelId).await?;
        let revision = self.read_byte(Register::IdentificationRevisionId).await?;
        let module = self.read_byte(Register::IdentificationModuleId).await?;
        if model != 0xEE || revision != 0xAA || module != 0x10 {
            error!(
                "unrecognized device identity: {:x} {:x} {:x}",
                model, revision, module
            );
            return Err(Error::IdentityMismatch {
                model,
                revision,
                module,
            });
        }

        // 2V8 I/O mode, then I2C standard mode
        self.write_flag(Register::VhvConfigPadSclSdaExtsupHv, 0, true)
            .await?;
        self.write_byte(0x88u8, 0x00).await?;

        // Capture the stop variable from its page-selected home
        self.write_byte(0x80u8, 0x01).await?;
        self.write_byte(0xFFu8, 0x01).await?;
        self.write_byte(0x00u8, 0x00).await?;
        self.stop_variable = self.read_byte(0x91u8).await?;
        self.write_byte(0x00u8, 0x01).await?;
        self.write_byte(0xFFu8, 0x00).await?;
        self.write_byte(0x80u8, 0x00).await?;
        debug!("stop variable: {:x}", self.stop_variable);

        self.write_flag(Register::MsrcConfigControl, 1, true).await?;
        self.write_flag(Register::MsrcConfigControl, 4, true).await?;

        // Final-range signal rate limit, 0.25 MCPS
        self.set_signal_rate_limit(0.25).await?;

        // Enable every sequence step for the calibration runs below
        self.write_byte(Register::SystemSequenceConfig, 0xFF).await?;

        info!("configuring reference spads");
        self.configure_reference_spads().await?;

        info!("loading tuning settings");
        self.load_tuning_settings().await?;

        // Interrupt on new sample, active low, nothing pending
        self.write_byte(Register::SystemInterruptConfigGpio, 0x04)
            .await?;
        self.write_flag(Register::GpioHvMuxActiveHigh, 4, false)
            .await?;
        self.write_byte(Register::SystemInterruptClear, 0x01).await?;

        info!("running reference calibration");
        self.write_byte(Register::SystemSequenceConfig, 0x01).await?;
        self.perform_ref_calibration(CalibrationPass::Vhv).await?;
        self.write_byte(Register::SystemSequenceConfig, 0x02).await?;
        self.perform_ref_calibration(CalibrationPass::Phase).await?;

        // Steady state: VHV, phase, DSS, MSRC, pre-range and final-range on
        self.write_byte(Register::SystemSequenceConfig, 0xE8).await?;

        info!("sensor initialized");
        Ok(())
    }

    /// Performs a single-shot measurement and returns the distance in
    /// millimeters.
    ///
    /// If no continuous session is active this replays the stop variable,
    /// issues a start pulse and waits for the sensor to accept it, then in
    /// either mode waits for the result, reads it and clears the interrupt
    /// so the next poll does not see stale data.
    ///
    /// # Errors
    ///
    /// * [`Error::RangingTimeout`] - The sensor did not accept the start
    ///   pulse or did not produce a result within ~1 s.
    /// * [`Error::I2cError`] - An I2C transfer failed.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use vl53l0x::VL53L0x;
    ///
    /// let i2c = embedded_hal_mock::eh1::i2c::Mock::new(&[]);
    /// let delay = embedded_hal_mock::eh1::delay::NoopDelay;
    /// let mut sensor = VL53L0x::new(i2c, delay);
    ///
    /// sensor.init().unwrap();
    /// let distance = sensor.read_single_distance().unwrap();
    /// println!("{} mm", distance);
    /// ```
    pub async fn read_single_distance(&mut self) -> Result<u16, Error<E>> {
        if !self.started {
            self.write_byte(0x80u8, 0x01).await?;
            self.restore_stop_variable().await?;
            self.write_byte(0x80u8, 0x00).await?;

            self.write_byte(Register::SysrangeStart, 0x01).await?;

            // Wait for the start bit to clear
            let mut attempts = 0u16;
            loop {
                if self.read_byte(Register::SysrangeStart).await? & 0x01 == 0 {
                    break;
                }
                attempts += 1;
                if attempts >= POLL_LIMIT {
                    warn!("single-shot start was not accepted");
                    return Err(Error::RangingTimeout);
                }
                self.delay.delay_ms(1).await;
            }
        }

        self.read_ranging_result().await
    }

    /// Starts a continuous ranging session.
    ///
    /// With `period_ms == 0` the sensor free-runs in back-to-back mode,
    /// starting each measurement as soon as the previous one completes.
    /// With a nonzero period the sensor runs in timed mode; the period is
    /// scaled by the device's oscillator calibration word before being
    /// programmed. Subsequent readings come from
    /// [`read_continuous_distance`](Self::read_continuous_distance) until
    /// [`stop_continuous`](Self::stop_continuous) is called.
    ///
    /// # Errors
    ///
    /// * [`Error::I2cError`] - An I2C transfer failed.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use vl53l0x::VL53L0x;
    ///
    /// let i2c = embedded_hal_mock::eh1::i2c::Mock::new(&[]);
    /// let delay = embedded_hal_mock::eh1::delay::NoopDelay;
    /// let mut sensor = VL53L0x::new(i2c, delay);
    ///
    /// sensor.init().unwrap();
    /// sensor.start_continuous(100).unwrap();
    /// for _ in 0..10 {
    ///     let distance = sensor.read_continuous_distance().unwrap();
    ///     println!("{} mm", distance);
    /// }
    /// sensor.stop_continuous().unwrap();
    /// ```
    #[allow(clippy::cast_possible_truncation)]
    pub async fn start_continuous(&mut self, period_ms: u32) -> Result<(), Error<E>> {
        self.write_byte(0x80u8, 0x01).await?;
        self.restore_stop_variable().await?;
        self.write_byte(0x80u8, 0x00).await?;

        let oscillator = if period_ms == 0 {
            0
        } else {
            self.read_word(Register::OscCalibrateVal).await?
        };

        if oscillator == 0 {
            // Free-running back-to-back mode
            self.write_byte(Register::SysrangeStart, 0x02).await?;
        } else {
            let period = period_ms * u32::from(oscillator);
            // The 32-bit period register is written pointer-first: the
            // register pointer is set once and both halves stream through
            // the device's auto-increment.
            self.i2c
                .write(
                    self.address,
                    &[u8::from(Register::SystemIntermeasurementPeriod)],
                )
                .await?;
            self.i2c
                .write(
                    self.address,
                    &(((period >> 16) & 0xFFFF) as u16).to_be_bytes(),
                )
                .await?;
            self.i2c
                .write(self.address, &((period & 0xFFFF) as u16).to_be_bytes())
                .await?;
            self.write_byte(Register::SysrangeStart, 0x04).await?;
        }
        self.started = true;
        Ok(())
    }

    /// Stops a continuous ranging session.
    ///
    /// Issues a single stop-request pulse and replays the stop variable so
    /// the sensor's internal state machine settles back into single-shot
    /// territory.
    ///
    /// # Errors
    ///
    /// * [`Error::I2cError`] - An I2C transfer failed.
    pub async fn stop_continuous(&mut self) -> Result<(), Error<E>> {
        self.write_byte(Register::SysrangeStart, 0x01).await?;
        self.restore_stop_variable().await?;
        self.started = false;
        Ok(())
    }

    /// Waits for the next continuous-mode result and returns the distance
    /// in millimeters.
    ///
    /// # Errors
    ///
    /// * [`Error::RangingTimeout`] - No result became ready within ~1 s.
    /// * [`Error::I2cError`] - An I2C transfer failed.
    pub async fn read_continuous_distance(&mut self) -> Result<u16, Error<E>> {
        self.read_ranging_result().await
    }

    /// Waits for the interrupt status to report a result, reads the 16-bit
    /// distance and re-arms the interrupt.
    async fn read_ranging_result(&mut self) -> Result<u16, Error<E>> {
        let mut attempts = 0u16;
        loop {
            if self.read_byte(Register::ResultInterruptStatus).await? & 0x07 != 0 {
                break;
            }
            attempts += 1;
            if attempts >= POLL_LIMIT {
                warn!("no measurement became ready");
                return Err(Error::RangingTimeout);
            }
            self.delay.delay_ms(1).await;
        }

        // The millimeter value lives 10 bytes into the result block
        let distance = self
            .read_word(Register::ResultRangeStatus as u8 + 10)
            .await?;
        // Reading does not clear the ready condition; without this write
        // the next poll would immediately report stale data.
        self.write_byte(Register::SystemInterruptClear, 0x01).await?;
        Ok(distance)
    }

    /// Replays the stop variable captured during init. The sensor expects
    /// this byte before every ranging start or stop; the page is restored
    /// before returning.
    async fn restore_stop_variable(&mut self) -> Result<(), Error<E>> {
        self.write_byte(0xFFu8, 0x01).await?;
        self.write_byte(0x00u8, 0x00).await?;
        self.write_byte(0x91u8, self.stop_variable).await?;
        self.write_byte(0x00u8, 0x01).await?;
        self.write_byte(0xFFu8, 0x00).await?;
        Ok(())
    }

    /// Runs one reference calibration pass: start with the pass's mode bit,
    /// wait for the interrupt status, then stop the sequencer.
    ///
    /// The sequencer stop (0x00 to the ranging-start register) is issued
    /// whether or not the pass completed; the interrupt is only cleared on
    /// success.
    async fn perform_ref_calibration(&mut self, pass: CalibrationPass) -> Result<(), Error<E>> {
        let mode: u8 = match pass {
            CalibrationPass::Vhv => 0x40,
            CalibrationPass::Phase => 0x00,
        };
        self.write_byte(Register::SysrangeStart, 0x01 | mode).await?;

        let mut attempts = 0u16;
        let polled = loop {
            if self.read_byte(Register::ResultInterruptStatus).await? & 0x07 != 0 {
                break Ok(());
            }
            attempts += 1;
            if attempts >= POLL_LIMIT {
                break Err(Error::CalibrationTimeout(pass));
            }
            self.delay.delay_ms(1).await;
        };

        if polled.is_ok() {
            self.write_byte(Register::SystemInterruptClear, 0x01).await?;
        } else {
            warn!("calibration pass did not signal completion");
        }
        self.write_byte(Register::SysrangeStart, 0x00).await?;
        polled
    }

    /// Reads the factory SPAD count and aperture flag from the device's
    /// calibration area.
    ///
    /// The area is only reachable through a vendor test mode entered and
    /// left by a fixed sequence of bank switches; on the timeout path the
    /// device is left as-is, matching the reference driver.
    async fn read_spad_info(&mut self) -> Result<(u8, bool), Error<E>> {
        self.write_byte(0x80u8, 0x01).await?;
        self.write_byte(0xFFu8, 0x01).await?;
        self.write_byte(0x00u8, 0x00).await?;
        self.write_byte(0xFFu8, 0x06).await?;
        self.write_flag(0x83u8, 3, true).await?;
        self.write_byte(0xFFu8, 0x07).await?;
        self.write_byte(0x81u8, 0x01).await?;
        self.write_byte(0x80u8, 0x01).await?;
        self.write_byte(0x94u8, 0x6B).await?;
        self.write_byte(0x83u8, 0x00).await?;

        let mut attempts = 0u16;
        loop {
            if self.read_byte(0x83u8).await? != 0 {
                break;
            }
            attempts += 1;
            if attempts >= POLL_LIMIT {
                warn!("spad discovery did not complete");
                return Err(Error::SpadDiscoveryTimeout);
            }
            self.delay.delay_ms(1).await;
        }

        self.write_byte(0x83u8, 0x01).await?;
        let value = self.read_byte(0x92u8).await?;

        self.write_byte(0x81u8, 0x00).await?;
        self.write_byte(0xFFu8, 0x06).await?;
        self.write_flag(0x83u8, 3, false).await?;
        self.write_byte(0xFFu8, 0x01).await?;
        self.write_byte(0x00u8, 0x01).await?;
        self.write_byte(0xFFu8, 0x00).await?;
        self.write_byte(0x80u8, 0x00).await?;

        Ok((value & 0x7F, value & 0x80 != 0))
    }

    /// Reads the factory reference SPAD map, trims it to the discovered
    /// count and aperture type, and writes it back to the device.
    async fn configure_reference_spads(&mut self) -> Result<(), Error<E>> {
        let (spad_count, is_aperture) = self.read_spad_info().await?;
        debug!("reference spads: {} aperture: {}", spad_count, is_aperture);

        // Factory enable pattern: three consecutive 16-bit reads streamed
        // from the first enable register.
        let mut spad_map = [0u8; 6];
        self.i2c
            .write(
                self.address,
                &[u8::from(Register::GlobalConfigSpadEnablesRef0)],
            )
            .await?;
        for half in spad_map.chunks_mut(2) {
            self.i2c.read(self.address, half).await?;
        }

        self.write_byte(0xFFu8, 0x01).await?;
        self.write_byte(Register::DynamicSpadRefEnStartOffset, 0x00)
            .await?;
        self.write_byte(Register::DynamicSpadNumRequestedRefSpad, 0x2C)
            .await?;
        self.write_byte(0xFFu8, 0x00).await?;
        self.write_byte(Register::GlobalConfigRefEnStartSelect, 0xB4)
            .await?;

        trim_reference_spads(&mut spad_map, spad_count, is_aperture);

        let mut buffer = [0u8; 7];
        buffer[0] = Register::GlobalConfigSpadEnablesRef0.into();
        buffer[1..].copy_from_slice(&spad_map);
        self.i2c.write(self.address, &buffer).await?;
        Ok(())
    }

    /// Applies the vendor tuning program in order.
    async fn load_tuning_settings(&mut self) -> Result<(), Error<E>> {
        for &(register, value) in TUNING_SETTINGS {
            self.write_byte(register, value).await?;
        }
        Ok(())
    }

    /// Sets the final-range minimum signal rate limit in MCPS.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    async fn set_signal_rate_limit(&mut self, limit_mcps: f32) -> Result<(), Error<E>> {
        // Q9.7 fixed point: 9 integer bits, 7 fractional bits
        let raw = (limit_mcps * f32::from(1u16 << 7)) as u16;
        self.write_word(Register::FinalRangeConfigMinCountRateRtnLimit, raw)
            .await
    }

    /// Writes a single byte to a sensor register.
    ///
    /// This is a low-level function; most applications should use the
    /// higher-level operations instead. It accepts either a [`Register`]
    /// or a raw address.
    ///
    /// # Errors
    ///
    /// * [`Error::I2cError`] - If the I2C transfer failed.
    pub async fn write_byte<R>(&mut self, register: R, value: u8) -> Result<(), Error<E>>
    where
        R: Into<u8>,
    {
        let buffer = [register.into(), value];
        self.i2c.write(self.address, &buffer).await?;
        Ok(())
    }

    /// Reads a single byte from a sensor register.
    ///
    /// # Errors
    ///
    /// * [`Error::I2cError`] - If the I2C transfer failed.
    pub async fn read_byte<R>(&mut self, register: R) -> Result<u8, Error<E>>
    where
        R: Into<u8>,
    {
        let mut buffer = [0u8; 1];
        self.i2c
            .write_read(self.address, &[register.into()], &mut buffer)
            .await?;
        Ok(buffer[0])
    }

    /// Writes a big-endian 16-bit word to a sensor register as a single
    /// combined transaction.
    ///
    /// # Errors
    ///
    /// * [`Error::I2cError`] - If the I2C transfer failed.
    pub async fn write_word<R>(&mut self, register: R, value: u16) -> Result<(), Error<E>>
    where
        R: Into<u8>,
    {
        let mut buffer = [0u8; 3];
        buffer[0] = register.into();
        buffer[1..].copy_from_slice(&value.to_be_bytes());
        self.i2c.write(self.address, &buffer).await?;
        Ok(())
    }

    /// Reads a big-endian 16-bit word from a sensor register in a single
    /// transaction.
    ///
    /// # Errors
    ///
    /// * [`Error::I2cError`] - If the I2C transfer failed.
    pub async fn read_word<R>(&mut self, register: R) -> Result<u16, Error<E>>
    where
        R: Into<u8>,
    {
        let mut buffer = [0u8; 2];
        self.i2c
            .write_read(self.address, &[register.into()], &mut buffer)
            .await?;
        Ok(u16::from_be_bytes(buffer))
    }

    /// Reads a single bit of a sensor register.
    ///
    /// # Errors
    ///
    /// * [`Error::I2cError`] - If the I2C transfer failed.
    pub async fn read_flag<R>(&mut self, register: R, bit: u8) -> Result<bool, Error<E>>
    where
        R: Into<u8>,
    {
        let value = self.read_byte(register).await?;
        Ok(value & (1 << bit) != 0)
    }

    /// Sets or clears a single bit of a sensor register, leaving the other
    /// bits unchanged.
    ///
    /// This is a read-modify-write of two bus transactions, not atomic at
    /// the bus level; the driver's single-owner model makes that safe.
    ///
    /// # Errors
    ///
    /// * [`Error::I2cError`] - If either I2C transfer failed.
    pub async fn write_flag<R>(&mut self, register: R, bit: u8, on: bool) -> Result<(), Error<E>>
    where
        R: Into<u8>,
    {
        let register: u8 = register.into();
        let mut value = self.read_byte(register).await?;
        let mask = 1u8 << bit;
        if on {
            value |= mask;
        } else {
            value &= !mask;
        }
        self.write_byte(register, value).await
    }
}

/// Trims a factory reference SPAD map to the discovered count and aperture
/// type, in place.
///
/// The byte and bit positions use the vendor's physical-to-logical pixel
/// mapping (`i >> 3` and `1 << (i >> 2)`), which is not a plain bitmap
/// index; bit positions past 7 fall outside the byte and are no-ops, as in
/// the reference driver. For aperture devices the first 12 indices are
/// cleared unconditionally, and no further pixels are enabled once the
/// running count reaches `spad_count`.
#[allow(clippy::cast_possible_truncation)]
fn trim_reference_spads(map: &mut [u8; 6], spad_count: u8, is_aperture: bool) {
    let mut enabled: u8 = 0;
    for i in 0u8..48 {
        let byte = usize::from(i >> 3);
        let mask = (1u32 << (i >> 2)) as u8;
        if (is_aperture && i < 12) || enabled >= spad_count {
            map[byte] &= !mask;
        } else if map[byte] & mask != 0 {
            enabled += 1;
        }
    }
}

/// Error type for VL53L0X sensor operations.
///
/// Each failure point of the bring-up and ranging protocol has its own
/// variant, so callers can tell an absent device from a calibration that
/// never completed, and a timeout from a true zero-distance reading.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E: core::fmt::Debug> {
    /// I2C communication error from the underlying hardware
    I2cError(E),
    /// The identification registers did not match the VL53L0X signature
    /// (0xEE, 0xAA, 0x10); the device is absent or a different part
    IdentityMismatch {
        /// Value read from the model identification register
        model: u8,
        /// Value read from the revision identification register
        revision: u8,
        /// Value read from the module identification register
        module: u8,
    },
    /// SPAD discovery never signalled completion
    SpadDiscoveryTimeout,
    /// A reference calibration pass never signalled completion
    CalibrationTimeout(CalibrationPass),
    /// No measurement became ready, or a single-shot start pulse was never
    /// accepted
    RangingTimeout,
}

impl<E: core::fmt::Debug> core::fmt::Display for Error<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl<E: core::fmt::Debug> From<E> for Error<E> {
    fn from(error: E) -> Self {
        Error::I2cError(error)
    }
}

#[cfg(all(test, not(feature = "async")))]
mod tests {
    use embedded_hal_mock::eh1::delay::NoopDelay;
    use embedded_hal_mock::eh1::i2c::{Mock, Transaction};

    use super::*;

    const ADDR: u8 = DEFAULT_ADDRESS;

    fn sensor(expectations: &[Transaction]) -> (VL53L0x<Mock, NoopDelay>, Mock) {
        let i2c = Mock::new(expectations);
        let handle = i2c.clone();
        (VL53L0x::new(i2c, NoopDelay), handle)
    }

    fn write(bytes: &[u8]) -> Transaction {
        Transaction::write(ADDR, bytes.to_vec())
    }

    fn read_reg(register: u8, value: u8) -> Transaction {
        Transaction::write_read(ADDR, vec![register], vec![value])
    }

    #[test]
    fn identity_mismatch_aborts_init_before_any_spad_traffic() {
        let expectations = [
            read_reg(0xC0, 0xEE),
            read_reg(0xC1, 0xAB), // wrong revision
            read_reg(0xC2, 0x10),
        ];
        let (mut sensor, mut handle) = sensor(&expectations);

        let err = sensor.init().unwrap_err();
        assert!(matches!(
            err,
            Error::IdentityMismatch {
                model: 0xEE,
                revision: 0xAB,
                module: 0x10
            }
        ));
        // done() panics if any expectation beyond the three ID reads was
        // consumed or left over
        handle.done();
    }

    #[test]
    fn spad_info_runs_test_mode_dance_and_decodes_status_byte() {
        let expectations = [
            // test mode entry
            write(&[0x80, 0x01]),
            write(&[0xFF, 0x01]),
            write(&[0x00, 0x00]),
            write(&[0xFF, 0x06]),
            read_reg(0x83, 0x00), // read-modify-write, set bit 3
            write(&[0x83, 0x08]),
            write(&[0xFF, 0x07]),
            write(&[0x81, 0x01]),
            write(&[0x80, 0x01]),
            write(&[0x94, 0x6B]),
            write(&[0x83, 0x00]),
            // ready after three polls
            read_reg(0x83, 0x00),
            read_reg(0x83, 0x00),
            read_reg(0x83, 0x01),
            write(&[0x83, 0x01]),
            read_reg(0x92, 0xAC), // aperture device, 44 spads
            // test mode exit
            write(&[0x81, 0x00]),
            write(&[0xFF, 0x06]),
            read_reg(0x83, 0x08), // read-modify-write, clear bit 3
            write(&[0x83, 0x00]),
            write(&[0xFF, 0x01]),
            write(&[0x00, 0x01]),
            write(&[0xFF, 0x00]),
            write(&[0x80, 0x00]),
        ];
        let (mut sensor, mut handle) = sensor(&expectations);

        assert_eq!(sensor.read_spad_info().unwrap(), (44, true));
        handle.done();
    }

    #[test]
    fn spad_discovery_timeout_gives_up_after_exact_poll_budget() {
        let mut expectations = vec![
            write(&[0x80, 0x01]),
            write(&[0xFF, 0x01]),
            write(&[0x00, 0x00]),
            write(&[0xFF, 0x06]),
            read_reg(0x83, 0x00),
            write(&[0x83, 0x08]),
            write(&[0xFF, 0x07]),
            write(&[0x81, 0x01]),
            write(&[0x80, 0x01]),
            write(&[0x94, 0x6B]),
            write(&[0x83, 0x00]),
        ];
        expectations.extend((0..1000).map(|_| read_reg(0x83, 0x00)));
        let (mut sensor, mut handle) = sensor(&expectations);

        let err = sensor.read_spad_info().unwrap_err();
        assert!(matches!(err, Error::SpadDiscoveryTimeout));
        handle.done();
    }

    #[test]
    fn calibration_timeout_polls_exact_budget_then_stops_sequencer() {
        let mut expectations = vec![write(&[0x00, 0x41])];
        expectations.extend((0..1000).map(|_| read_reg(0x13, 0x00)));
        // no interrupt clear on the timeout path, but the sequencer is
        // still stopped
        expectations.push(write(&[0x00, 0x00]));
        let (mut sensor, mut handle) = sensor(&expectations);

        let err = sensor
            .perform_ref_calibration(CalibrationPass::Vhv)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::CalibrationTimeout(CalibrationPass::Vhv)
        ));
        handle.done();
    }

    #[test]
    fn calibration_success_clears_interrupt_then_stops_sequencer() {
        let expectations = [
            write(&[0x00, 0x01]), // phase pass, mode bit 0x00
            read_reg(0x13, 0x02),
            write(&[0x0B, 0x01]),
            write(&[0x00, 0x00]),
        ];
        let (mut sensor, mut handle) = sensor(&expectations);

        sensor
            .perform_ref_calibration(CalibrationPass::Phase)
            .unwrap();
        handle.done();
    }

    #[test]
    fn single_shot_replays_stop_variable_then_starts_and_reads() {
        let expectations = [
            // stop variable replay, power-bracketed
            write(&[0x80, 0x01]),
            write(&[0xFF, 0x01]),
            write(&[0x00, 0x00]),
            write(&[0x91, 0x3C]),
            write(&[0x00, 0x01]),
            write(&[0xFF, 0x00]),
            write(&[0x80, 0x00]),
            // start pulse, accepted on the first poll
            write(&[0x00, 0x01]),
            read_reg(0x00, 0x00),
            // result ready, read and re-arm
            read_reg(0x13, 0x07),
            Transaction::write_read(ADDR, vec![0x1E], vec![0x04, 0xD2]),
            write(&[0x0B, 0x01]),
        ];
        let (mut sensor, mut handle) = sensor(&expectations);
        sensor.stop_variable = 0x3C;

        assert_eq!(sensor.read_single_distance().unwrap(), 1234);
        handle.done();
    }

    #[test]
    fn continuous_round_trip_issues_one_stop_pulse() {
        let expectations = [
            // start: replay then back-to-back mode
            write(&[0x80, 0x01]),
            write(&[0xFF, 0x01]),
            write(&[0x00, 0x00]),
            write(&[0x91, 0x3C]),
            write(&[0x00, 0x01]),
            write(&[0xFF, 0x00]),
            write(&[0x80, 0x00]),
            write(&[0x00, 0x02]),
            // stop: one stop pulse then an unbracketed replay
            write(&[0x00, 0x01]),
            write(&[0xFF, 0x01]),
            write(&[0x00, 0x00]),
            write(&[0x91, 0x3C]),
            write(&[0x00, 0x01]),
            write(&[0xFF, 0x00]),
        ];
        let (mut sensor, mut handle) = sensor(&expectations);
        sensor.stop_variable = 0x3C;

        sensor.start_continuous(0).unwrap();
        assert!(sensor.is_started());
        sensor.stop_continuous().unwrap();
        assert!(!sensor.is_started());
        handle.done();
    }

    #[test]
    fn timed_continuous_scales_period_by_oscillator_calibration() {
        let expectations = [
            write(&[0x80, 0x01]),
            write(&[0xFF, 0x01]),
            write(&[0x00, 0x00]),
            write(&[0x91, 0x00]),
            write(&[0x00, 0x01]),
            write(&[0xFF, 0x00]),
            write(&[0x80, 0x00]),
            Transaction::write_read(ADDR, vec![0xF8], vec![0x00, 0x64]),
            // 10 ms * 100 = 1000 = 0x03E8, pointer then two halves
            write(&[0x04]),
            write(&[0x00, 0x00]),
            write(&[0x03, 0xE8]),
            write(&[0x00, 0x04]),
        ];
        let (mut sensor, mut handle) = sensor(&expectations);

        sensor.start_continuous(10).unwrap();
        assert!(sensor.is_started());
        handle.done();
    }

    #[test]
    fn write_flag_modifies_exactly_one_bit() {
        let expectations = [
            read_reg(0x60, 0x20),
            write(&[0x60, 0x22]), // bit 1 set, others untouched
            read_reg(0x60, 0x32),
            write(&[0x60, 0x22]), // bit 4 cleared, others untouched
        ];
        let (mut sensor, mut handle) = sensor(&expectations);

        sensor
            .write_flag(Register::MsrcConfigControl, 1, true)
            .unwrap();
        sensor
            .write_flag(Register::MsrcConfigControl, 4, false)
            .unwrap();
        handle.done();
    }

    #[test]
    fn aperture_devices_never_enable_the_first_twelve_spads() {
        let mut map = [0xFF; 6];
        trim_reference_spads(&mut map, 20, true);
        // indices 0..12 map onto byte 0 bits 0-1 and byte 1 bit 2
        assert_eq!(map, [0xFC, 0xFB, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn trim_stops_enabling_once_count_is_reached() {
        let mut map = [0x0F; 6];
        trim_reference_spads(&mut map, 3, false);
        assert_eq!(map, [0x0C, 0x03, 0x0F, 0x0F, 0x0F, 0x0F]);
    }

    #[test]
    fn trim_with_zero_count_clears_every_reachable_bit() {
        let mut map = [0xFF; 6];
        trim_reference_spads(&mut map, 0, false);
        // bit positions past 7 fall outside their byte, so bytes 4 and 5
        // are untouched by the vendor mapping
        assert_eq!(map, [0xFC, 0xF3, 0xCF, 0x3F, 0xFF, 0xFF]);
    }

    #[test]
    fn millimeters_formats_as_centimeters_with_tenths() {
        assert_eq!(Millimeters(1234).to_string(), "123.4 cm ");
        assert_eq!(Millimeters(5).to_string(), "0.5 cm ");
        assert_eq!(Millimeters(0).to_string(), "0.0 cm ");
    }
}
