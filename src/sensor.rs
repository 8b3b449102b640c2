/// Ultrasonic rangefinder driver and occupancy state machine.
///
/// [`RangeSensor`] turns raw echo durations from an [`EchoProbe`] into
/// validated readings, keeps the last valid reading for occupancy queries and
/// counts failures. [`HcSr04`] is the probe for HC-SR04 class sensors over
/// `embedded-hal` pins.
///
/// `measure()` busy-waits on the echo line for up to [`ECHO_TIMEOUT_US`];
/// nothing else runs on the node while it does.
use core::fmt;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};

use crate::config::{check_threshold, ConfigError, MAX_DISTANCE_CM, MIN_DISTANCE_CM};

/// Speed of sound at ~20 °C in cm/µs
pub const SOUND_SPEED_CM_PER_US: f32 = 0.0343;

/// Echo wait bound. 30 ms is a ~515 cm round trip, past the rated range.
pub const ECHO_TIMEOUT_US: u32 = 30_000;

/// Trigger pulse width
pub const TRIGGER_PULSE_US: u32 = 10;

/// Low time before the trigger pulse so the sensor sees a clean edge
const TRIGGER_SETTLE_US: u32 = 2;

const CM_PER_INCH: f32 = 2.54;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorError {
    /// No echo within [`ECHO_TIMEOUT_US`]
    Timeout,
    /// Echo converted to a distance outside the rated range
    OutOfRange { distance_cm: f32 },
    /// Pin read/write failed
    Hardware,
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorError::Timeout => f.write_str("echo timeout"),
            SensorError::OutOfRange { distance_cm } => write!(
                f,
                "distance {:.1} cm outside {}-{} cm",
                distance_cm, MIN_DISTANCE_CM, MAX_DISTANCE_CM
            ),
            SensorError::Hardware => f.write_str("sensor pin failure"),
        }
    }
}

/// Result of one echo cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub distance_cm: f32,
    /// False when the echo timed out or the distance is out of range
    pub valid: bool,
    /// Raw echo duration in microseconds, 0 on timeout
    pub echo_us: u32,
}

impl SensorReading {
    /// Reading recorded for a cycle that produced no usable echo.
    pub const fn timed_out() -> Self {
        Self {
            distance_cm: 0.0,
            valid: false,
            echo_us: 0,
        }
    }

    pub fn distance_in(&self) -> f32 {
        self.distance_cm / CM_PER_INCH
    }

    pub fn distance_mm(&self) -> f32 {
        self.distance_cm * 10.0
    }
}

/// Convert an echo duration to a one-way distance.
pub fn echo_to_distance_cm(echo_us: u32) -> f32 {
    echo_us as f32 * SOUND_SPEED_CM_PER_US / 2.0
}

fn in_range(distance_cm: f32) -> bool {
    distance_cm >= f32::from(MIN_DISTANCE_CM) && distance_cm <= f32::from(MAX_DISTANCE_CM)
}

/// One ping of a time-of-flight sensor.
pub trait EchoProbe {
    /// Fire the sensor and return the echo pulse width in microseconds, or
    /// `Ok(None)` if no complete echo arrived within `timeout_us`.
    fn ping(&mut self, timeout_us: u32) -> Result<Option<u32>, SensorError>;
}

/// Free-running microsecond counter used to time the echo pulse.
pub trait MicrosClock {
    fn now_us(&mut self) -> u64;
}

/// HC-SR04 wired to a trigger output and an echo input.
pub struct HcSr04<T, E, D, C> {
    trig: T,
    echo: E,
    delay: D,
    clock: C,
}

impl<T, E, D, C> HcSr04<T, E, D, C>
where
    T: OutputPin,
    E: InputPin,
    D: DelayNs,
    C: MicrosClock,
{
    /// Take the pins and drive the trigger low.
    pub fn new(mut trig: T, echo: E, mut delay: D, clock: C) -> Result<Self, SensorError> {
        trig.set_low().map_err(|_| SensorError::Hardware)?;
        delay.delay_us(TRIGGER_SETTLE_US);
        Ok(Self {
            trig,
            echo,
            delay,
            clock,
        })
    }

    fn echo_high(&mut self) -> Result<bool, SensorError> {
        self.echo.is_high().map_err(|_| SensorError::Hardware)
    }
}

impl<T, E, D, C> EchoProbe for HcSr04<T, E, D, C>
where
    T: OutputPin,
    E: InputPin,
    D: DelayNs,
    C: MicrosClock,
{
    fn ping(&mut self, timeout_us: u32) -> Result<Option<u32>, SensorError> {
        self.trig.set_low().map_err(|_| SensorError::Hardware)?;
        self.delay.delay_us(TRIGGER_SETTLE_US);
        self.trig.set_high().map_err(|_| SensorError::Hardware)?;
        self.delay.delay_us(TRIGGER_PULSE_US);
        self.trig.set_low().map_err(|_| SensorError::Hardware)?;

        // One window covers both the wait for the rising edge and the pulse.
        let deadline = self.clock.now_us().saturating_add(u64::from(timeout_us));
        while !self.echo_high()? {
            if self.clock.now_us() > deadline {
                return Ok(None);
            }
        }

        let rise = self.clock.now_us();
        while self.echo_high()? {
            if self.clock.now_us() > deadline {
                return Ok(None);
            }
        }
        let fall = self.clock.now_us();

        Ok(Some(fall.saturating_sub(rise) as u32))
    }
}

/// Diagnostics snapshot of a [`RangeSensor`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorStatus {
    pub threshold_cm: u16,
    pub last: Option<SensorReading>,
    pub last_valid_cm: Option<f32>,
    pub occupied: bool,
    pub measurements: u32,
    pub errors: u32,
    pub success_rate: f32,
}

/// Validating wrapper around an [`EchoProbe`] with occupancy detection.
pub struct RangeSensor<P> {
    probe: P,
    threshold_cm: u16,
    /// Most recent attempt, valid or not
    last: Option<SensorReading>,
    /// Most recent valid reading; drives occupancy
    last_valid: Option<SensorReading>,
    measurements: u32,
    errors: u32,
}

impl<P: EchoProbe> RangeSensor<P> {
    pub fn new(probe: P, threshold_cm: u16) -> Result<Self, ConfigError> {
        let threshold_cm = check_threshold(threshold_cm)?;
        log::info!("Rangefinder ready, occupancy threshold {} cm", threshold_cm);
        Ok(Self {
            probe,
            threshold_cm,
            last: None,
            last_valid: None,
            measurements: 0,
            errors: 0,
        })
    }

    /// Run one echo cycle.
    ///
    /// Failures are counted and leave the last valid reading untouched, so
    /// a single bad echo never flips the reported occupancy.
    pub fn measure(&mut self) -> Result<SensorReading, SensorError> {
        self.measurements = self.measurements.wrapping_add(1);

        let echo_us = match self.probe.ping(ECHO_TIMEOUT_US) {
            Ok(Some(us)) if us > 0 => us,
            Ok(_) => return self.fail(SensorError::Timeout, SensorReading::timed_out()),
            Err(e) => return self.fail(e, SensorReading::timed_out()),
        };

        let distance_cm = echo_to_distance_cm(echo_us);
        let valid = in_range(distance_cm);
        let reading = SensorReading {
            distance_cm,
            valid,
            echo_us,
        };

        if !valid {
            return self.fail(SensorError::OutOfRange { distance_cm }, reading);
        }

        log::debug!("Echo {} us, distance {:.2} cm", echo_us, distance_cm);
        self.last = Some(reading);
        self.last_valid = Some(reading);
        Ok(reading)
    }

    fn fail(
        &mut self,
        err: SensorError,
        reading: SensorReading,
    ) -> Result<SensorReading, SensorError> {
        self.errors = self.errors.wrapping_add(1);
        self.last = Some(reading);
        log::warn!("Measurement failed: {}", err);
        Err(err)
    }

    /// Occupancy from the last valid reading; vacant if there is none.
    pub fn is_occupied(&self) -> bool {
        self.last_valid
            .map(|r| r.distance_cm < f32::from(self.threshold_cm))
            .unwrap_or(false)
    }

    pub fn set_occupied_threshold(&mut self, cm: u16) -> Result<(), ConfigError> {
        match check_threshold(cm) {
            Ok(cm) => {
                self.threshold_cm = cm;
                log::info!("Occupancy threshold set to {} cm", cm);
                Ok(())
            }
            Err(e) => {
                log::warn!("Rejected occupancy threshold: {}", e);
                Err(e)
            }
        }
    }

    pub fn occupied_threshold(&self) -> u16 {
        self.threshold_cm
    }

    /// Most recent attempt, including failed ones.
    pub fn last_reading(&self) -> Option<SensorReading> {
        self.last
    }

    pub fn last_valid(&self) -> Option<SensorReading> {
        self.last_valid
    }

    pub fn measurements(&self) -> u32 {
        self.measurements
    }

    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// Fraction of measurements that succeeded, 0 before the first one.
    pub fn success_rate(&self) -> f32 {
        if self.measurements == 0 {
            return 0.0;
        }
        // Counters wrap independently, so errors can briefly exceed measurements.
        self.measurements.saturating_sub(self.errors) as f32 / self.measurements as f32
    }

    pub fn status(&self) -> SensorStatus {
        SensorStatus {
            threshold_cm: self.threshold_cm,
            last: self.last,
            last_valid_cm: self.last_valid.map(|r| r.distance_cm),
            occupied: self.is_occupied(),
            measurements: self.measurements,
            errors: self.errors,
            success_rate: self.success_rate(),
        }
    }

    pub fn probe_mut(&mut self) -> &mut P {
        &mut self.probe
    }
}

/// Probe replaying a fixed script of echoes, for unit tests.
#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    pub struct ScriptedProbe {
        pub echoes: VecDeque<Result<Option<u32>, SensorError>>,
        pub pings: usize,
    }

    impl ScriptedProbe {
        pub fn new(echoes: &[Option<u32>]) -> Self {
            Self {
                echoes: echoes.iter().map(|e| Ok(*e)).collect(),
                pings: 0,
            }
        }

        pub fn push(&mut self, echo: Option<u32>) {
            self.echoes.push_back(Ok(echo));
        }
    }

    impl EchoProbe for ScriptedProbe {
        fn ping(&mut self, _timeout_us: u32) -> Result<Option<u32>, SensorError> {
            self.pings += 1;
            self.echoes.pop_front().unwrap_or(Ok(None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::scripted::ScriptedProbe;
    use super::*;

    use core::convert::Infallible;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Echo duration giving `cm` centimeters
    fn echo_for(cm: f32) -> u32 {
        (cm * 2.0 / SOUND_SPEED_CM_PER_US) as u32
    }

    fn sensor(echoes: &[Option<u32>]) -> RangeSensor<ScriptedProbe> {
        RangeSensor::new(ScriptedProbe::new(echoes), 100).unwrap()
    }

    // ── Conversion and validation ───────────────────────────────────

    #[test]
    fn echo_converts_to_centimeters() {
        assert!((echo_to_distance_cm(2915) - 49.99).abs() < 0.01);
        assert!((echo_to_distance_cm(0)).abs() < f32::EPSILON);
    }

    #[test]
    fn in_range_echoes_are_valid() {
        for us in [117u32, 1_000, 2_915, 10_000, 23_300] {
            let mut s = sensor(&[Some(us)]);
            let r = s.measure().unwrap();
            assert!(r.valid);
            assert_eq!(r.echo_us, us);
            assert!((r.distance_cm - us as f32 * SOUND_SPEED_CM_PER_US / 2.0).abs() < 1e-3);
        }
    }

    #[test]
    fn too_close_is_out_of_range() {
        let mut s = sensor(&[Some(100)]); // 1.7 cm
        match s.measure() {
            Err(SensorError::OutOfRange { distance_cm }) => assert!(distance_cm < 2.0),
            other => panic!("expected OutOfRange, got {other:?}"),
        }
        assert!(!s.last_reading().unwrap().valid);
    }

    #[test]
    fn too_far_is_out_of_range() {
        let mut s = sensor(&[Some(24_000)]); // 411.6 cm
        assert!(matches!(
            s.measure(),
            Err(SensorError::OutOfRange { .. })
        ));
    }

    #[test]
    fn missing_or_zero_echo_is_timeout() {
        let mut s = sensor(&[None, Some(0)]);
        assert_eq!(s.measure(), Err(SensorError::Timeout));
        assert_eq!(s.measure(), Err(SensorError::Timeout));
        assert_eq!(s.last_reading(), Some(SensorReading::timed_out()));
    }

    #[test]
    fn probe_hardware_error_is_counted() {
        let mut probe = ScriptedProbe::default();
        probe.echoes.push_back(Err(SensorError::Hardware));
        let mut s = RangeSensor::new(probe, 100).unwrap();
        assert_eq!(s.measure(), Err(SensorError::Hardware));
        assert_eq!(s.errors(), 1);
    }

    // ── Occupancy ───────────────────────────────────────────────────

    #[test]
    fn vacant_before_any_valid_reading() {
        let mut s = sensor(&[None]);
        assert!(!s.is_occupied());
        let _ = s.measure();
        assert!(!s.is_occupied());
    }

    #[test]
    fn occupied_below_threshold() {
        let mut s = sensor(&[Some(echo_for(50.0)), Some(echo_for(150.0))]);
        s.measure().unwrap();
        assert!(s.is_occupied());
        s.measure().unwrap();
        assert!(!s.is_occupied());
    }

    #[test]
    fn failed_measurement_keeps_last_valid_state() {
        let mut s = sensor(&[Some(echo_for(50.0)), None, Some(100), Some(24_000)]);
        s.measure().unwrap();
        assert!(s.is_occupied());
        for _ in 0..3 {
            assert!(s.measure().is_err());
            assert!(s.is_occupied());
        }
        assert!((s.last_valid().unwrap().distance_cm - 50.0).abs() < 0.1);
    }

    #[test]
    fn threshold_setter_validates() {
        let mut s = sensor(&[Some(echo_for(120.0))]);
        s.measure().unwrap();
        assert!(!s.is_occupied());

        assert_eq!(s.set_occupied_threshold(150), Ok(()));
        assert!(s.is_occupied());

        assert_eq!(
            s.set_occupied_threshold(1),
            Err(ConfigError::ThresholdOutOfRange(1))
        );
        assert_eq!(
            s.set_occupied_threshold(401),
            Err(ConfigError::ThresholdOutOfRange(401))
        );
        assert_eq!(s.occupied_threshold(), 150);
    }

    #[test]
    fn constructor_rejects_bad_threshold() {
        assert!(RangeSensor::new(ScriptedProbe::default(), 0).is_err());
    }

    // ── Statistics ──────────────────────────────────────────────────

    #[test]
    fn statistics_track_every_attempt() {
        let mut s = sensor(&[Some(1_000), None, Some(1_000), Some(50)]);
        assert_eq!(s.success_rate(), 0.0);
        for _ in 0..4 {
            let _ = s.measure();
        }
        assert_eq!(s.measurements(), 4);
        assert_eq!(s.errors(), 2);
        assert!((s.success_rate() - 0.5).abs() < f32::EPSILON);

        let status = s.status();
        assert_eq!(status.measurements, 4);
        assert_eq!(status.threshold_cm, 100);
        assert!(status.occupied);
    }

    #[test]
    fn success_rate_survives_counter_wrap() {
        let mut s = sensor(&[]);
        // measurements wrapped past zero while errors has not yet
        s.measurements = 3;
        s.errors = u32::MAX - 1;
        assert_eq!(s.success_rate(), 0.0);

        s.errors = 1;
        assert!((s.success_rate() - 2.0 / 3.0).abs() < f32::EPSILON);
    }

    #[test]
    fn unit_conversions() {
        let r = SensorReading {
            distance_cm: 254.0,
            valid: true,
            echo_us: 0,
        };
        assert!((r.distance_in() - 100.0).abs() < 1e-3);
        assert!((r.distance_mm() - 2540.0).abs() < 1e-3);
    }

    // ── HC-SR04 probe over mock pins ────────────────────────────────

    /// Clock advancing one microsecond per read
    struct FakeClock(Rc<Cell<u64>>);

    impl MicrosClock for FakeClock {
        fn now_us(&mut self) -> u64 {
            let t = self.0.get();
            self.0.set(t + 1);
            t
        }
    }

    /// Echo line high during `[rise, rise + width)`
    struct FakeEcho {
        clock: Rc<Cell<u64>>,
        rise: u64,
        width: u64,
    }

    impl embedded_hal::digital::ErrorType for FakeEcho {
        type Error = Infallible;
    }

    impl InputPin for FakeEcho {
        fn is_high(&mut self) -> Result<bool, Infallible> {
            let t = self.clock.get();
            Ok(t >= self.rise && t < self.rise + self.width)
        }

        fn is_low(&mut self) -> Result<bool, Infallible> {
            self.is_high().map(|h| !h)
        }
    }

    #[derive(Default)]
    struct FakeTrig {
        pulses: usize,
        high: bool,
    }

    impl embedded_hal::digital::ErrorType for FakeTrig {
        type Error = Infallible;
    }

    impl OutputPin for FakeTrig {
        fn set_low(&mut self) -> Result<(), Infallible> {
            self.high = false;
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            self.high = true;
            self.pulses += 1;
            Ok(())
        }
    }

    struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    fn hcsr04(rise: u64, width: u64) -> HcSr04<FakeTrig, FakeEcho, NoDelay, FakeClock> {
        let t = Rc::new(Cell::new(0));
        let echo = FakeEcho {
            clock: t.clone(),
            rise,
            width,
        };
        HcSr04::new(FakeTrig::default(), echo, NoDelay, FakeClock(t)).unwrap()
    }

    #[test]
    fn hcsr04_measures_pulse_width() {
        let mut probe = hcsr04(50, 2_915);
        assert_eq!(probe.ping(ECHO_TIMEOUT_US), Ok(Some(2_915)));
        assert_eq!(probe.trig.pulses, 1);
        assert!(!probe.trig.high);
    }

    #[test]
    fn hcsr04_times_out_without_echo() {
        let mut probe = hcsr04(u64::MAX / 2, 10);
        assert_eq!(probe.ping(ECHO_TIMEOUT_US), Ok(None));
    }

    #[test]
    fn hcsr04_times_out_on_stuck_echo() {
        let mut probe = hcsr04(10, 100_000);
        assert_eq!(probe.ping(ECHO_TIMEOUT_US), Ok(None));
    }

    #[test]
    fn hcsr04_late_rise_and_long_pulse_share_one_window() {
        // each phase fits the timeout alone, together they do not
        let mut probe = hcsr04(29_990, 29_990);
        assert_eq!(probe.ping(ECHO_TIMEOUT_US), Ok(None));
    }

    #[test]
    fn range_sensor_over_hcsr04() {
        let mut s = RangeSensor::new(hcsr04(20, 2_915), 100).unwrap();
        let r = s.measure().unwrap();
        assert!((r.distance_cm - 49.99).abs() < 0.01);
        assert!(s.is_occupied());
    }
}
