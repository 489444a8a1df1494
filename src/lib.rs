#![cfg_attr(not(test), no_std)]

//! Bounded-memory heart-rate tracking for interrupt-driven pulse sensors.
//!
//! A sensor ISR feeds time-stamped optical pulse samples into
//! [`PulseTracker::push`]; the main loop reads the latest rate with
//! [`PulseTracker::get_heartrate`]. All storage is pre-allocated at startup,
//! the ingest path never blocks and runs the whole pipeline to completion, so
//! readout has as little work to do as possible.
//!
//! The pipeline detects peaks from a sliding slope window, stamps each peak
//! with its width and the local width statistics, validates peaks against
//! those statistics (resolving false double-peaks by amplitude parity),
//! derives inter-pulse deltas and aggregates them into a rate with a
//! confidence band. The result is latched in a single slot which the observer
//! snapshots inside a critical section.

#[macro_use]
mod fmt;

pub mod detect;
pub mod log;
pub mod pool;
pub mod ring;
pub mod stream;

use core::cell::RefCell;

use critical_section::Mutex;
use static_assertions as sa;

use detect::PeakDetector;
use pool::{Idx, Pool};
use stream::delta::DeltaCalc;
use stream::hr::HrCalc;
use stream::stats::WidthStats;
use stream::validate::Validation;
use stream::width::WidthCalc;
use stream::{Peak, Pulse};

/// Samples per second delivered by the sensor ISR.
pub const SAMPLE_RATE: u32 = 40;

/// Span of the slope-regression window.
pub const SLOPE_WINDOW_MS: u32 = 225;

/// Slope window in samples.
pub const SLOPE_WINDOW: usize = (SLOPE_WINDOW_MS * SAMPLE_RATE / 1000) as usize;

/// Width statistics are taken over this window centered on the stamped peak.
pub const VALIDATION_WINDOW_MS: i64 = 10_000;

/// Running sums are recomputed from the window when older than this.
pub const SMART_SUM_MAX_AGE_MS: i64 = 10_000;

/// Deltas are aggregated over this much pulse time.
pub const HR_SAMPLE_WINDOW_MS: i64 = 5_000;

/// Minimum input time between two publications.
pub const MAX_HR_STALENESS_MS: i64 = 900;

/// Confidence band wider than this raises the variance fault, absolute [bpm]
/// and relative to the rate.
pub const MAX_ABS_HR_VARIANCE: f32 = 5.0;
pub const MAX_PCT_HR_VARIANCE: f32 = 0.1;

/// 15 s of beats at 250 bpm plus 50 % false peaks.
pub const PEAK_POOL: usize = (15 * 250 * 3 + 2 * 60 - 1) / (2 * 60);

/// 10 s of beats at 250 bpm.
pub const PULSE_POOL: usize = (10 * 250 + 60 - 1) / 60;

/// One record latched, one in flight, one for the observer.
pub const HR_POOL: usize = 3;

sa::const_assert_eq!(SLOPE_WINDOW, 9);
sa::const_assert_eq!(PEAK_POOL, 94);
sa::const_assert_eq!(PULSE_POOL, 42);
sa::const_assert!(PEAK_POOL <= 256 && PULSE_POOL <= 256);

pub const ERR_NO_HR: &str = "No HR yet.";
pub const ERR_VARIANCE: &str = "Variance Too High";

/// A published heart-rate estimate. `err` is empty when the record is good;
/// the numeric fields stay populated on a variance fault.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HeartRate {
    /// Center of the aggregation window, ms on the sample clock.
    pub time: i64,
    pub hr: f32,
    pub hr_lb: f32,
    pub hr_ub: f32,
    pub err: &'static str,
}

impl HeartRate {
    /// Sentinel returned before the first publication.
    pub const fn none() -> HeartRate {
        HeartRate {
            time: -1,
            hr: -1.0,
            hr_lb: -1.0,
            hr_ub: -1.0,
            err: ERR_NO_HR,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.err.is_empty()
    }
}

impl Default for HeartRate {
    fn default() -> HeartRate {
        HeartRate::none()
    }
}

pub struct PulseTracker {
    detector: PeakDetector,

    peaks: Pool<Peak, PEAK_POOL>,
    pulses: Pool<Pulse, PULSE_POOL>,
    rates: Pool<HeartRate, HR_POOL>,

    width: WidthCalc,
    stats: WidthStats,
    validate: Validation,
    delta: DeltaCalc,
    hr: HrCalc,

    cur_hr: Option<Idx>,
}

impl PulseTracker {
    pub fn new() -> PulseTracker {
        PulseTracker {
            detector: PeakDetector::new(),
            peaks: Pool::new(),
            pulses: Pool::new(),
            rates: Pool::new(),
            width: WidthCalc::new(),
            stats: WidthStats::new(),
            validate: Validation::new(),
            delta: DeltaCalc::new(),
            hr: HrCalc::new(),
            cur_hr: None,
        }
    }

    /// Fast path: feed one sensor sample. Timestamps must be non-decreasing.
    /// The whole pipeline runs synchronously in here, so this is the only
    /// function that must not be interrupted by itself.
    pub fn push(&mut self, sample: i32, t_ms: i64) {
        let Some((t, amp)) = self.detector.sample(sample, t_ms) else {
            return;
        };
        trace!("peak at t={} amp={}", t, amp);

        let p = self.alloc_peak();
        {
            let pk = self.peaks.get_mut(p);
            pk.t = t;
            pk.amp = amp;
        }

        let fwd = self.width.push(&mut self.peaks, p);
        self.peaks.release(p);
        let Some(mid) = fwd else { return };

        self.stats.absorb(&mut self.peaks, mid);
        while let Some(w) = self.stats.try_emit(&mut self.peaks) {
            self.validate.push(&mut self.peaks, w);
            while let Some(t) = self.validate.next_pulse(&mut self.peaks) {
                self.beat(t);
            }
        }
    }

    /// Safe to be interrupted by the producer when wrapped in
    /// [`SharedPulseTracker`].
    pub fn get_heartrate(&self, out: &mut HeartRate) {
        *out = match self.cur_hr {
            Some(i) => *self.rates.get(i),
            None => HeartRate::none(),
        };
    }

    /// A validated beat leaves the peak stages and enters the pulse stages.
    fn beat(&mut self, t: i64) {
        trace!("pulse at t={}", t);

        let p = self.alloc_pulse();
        self.pulses.get_mut(p).t = t;

        let fwd = self.delta.push(&mut self.pulses, p);
        self.pulses.release(p);
        let Some(b) = fwd else { return };

        let rate = self.hr.push(&mut self.pulses, b);
        self.pulses.release(b);

        if let Some(rate) = rate {
            self.publish(rate);
        }
    }

    fn publish(&mut self, rate: HeartRate) {
        debug!(
            "hr: {} [{}, {}] at t={} err={}",
            rate.hr, rate.hr_lb, rate.hr_ub, rate.time, rate.err
        );

        let i = match self.rates.alloc() {
            Some(i) => i,
            None => {
                // the latch holds the only long-lived record
                if let Some(old) = self.cur_hr.take() {
                    self.rates.release(old);
                }
                match self.rates.alloc() {
                    Some(i) => i,
                    None => {
                        log::log("hr pool exhausted, dropping publication");
                        return;
                    }
                }
            }
        };

        *self.rates.get_mut(i) = rate;
        if let Some(old) = self.cur_hr.replace(i) {
            self.rates.release(old);
        }
    }

    fn alloc_peak(&mut self) -> Idx {
        loop {
            if let Some(i) = self.peaks.alloc() {
                return i;
            }
            warn!("peak pool full, reclaiming oldest");
            log::log("peak pool full, reclaiming oldest");
            if !self.reclaim_peak() {
                panic!("peak pool exhausted");
            }
        }
    }

    /// Upstream outran downstream: drop the globally oldest peak from the
    /// stage holding it. Repeated by the caller until a slot frees up.
    fn reclaim_peak(&mut self) -> bool {
        let mut best: Option<(i64, u8)> = None;
        for (t, stage) in [
            (self.validate.oldest_t(&self.peaks), 0),
            (self.stats.oldest_t(&self.peaks), 1),
            (self.width.oldest_t(&self.peaks), 2),
        ] {
            if let Some(t) = t {
                if best.map_or(true, |(bt, _)| t < bt) {
                    best = Some((t, stage));
                }
            }
        }

        match best {
            Some((_, 0)) => self.validate.pop_oldest(&mut self.peaks),
            Some((_, 1)) => self.stats.pop_oldest(&mut self.peaks),
            Some((_, _)) => self.width.pop_oldest(&mut self.peaks),
            None => false,
        }
    }

    fn alloc_pulse(&mut self) -> Idx {
        loop {
            if let Some(i) = self.pulses.alloc() {
                return i;
            }
            warn!("pulse pool full, reclaiming oldest");
            log::log("pulse pool full, reclaiming oldest");
            if !self.reclaim_pulse() {
                panic!("pulse pool exhausted");
            }
        }
    }

    fn reclaim_pulse(&mut self) -> bool {
        let h = self.hr.oldest_t(&self.pulses);
        let d = self.delta.oldest_t(&self.pulses);

        match (h, d) {
            (Some(ht), Some(dt)) if dt < ht => self.delta.pop_oldest(&mut self.pulses),
            (Some(_), _) => self.hr.pop_oldest(&mut self.pulses),
            (None, Some(_)) => self.delta.pop_oldest(&mut self.pulses),
            (None, None) => false,
        }
    }
}

impl Default for PulseTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracker shared between the sampling interrupt and the main loop, in the
/// usual `Mutex<RefCell<Option<…>>>` arrangement: the main thread constructs
/// the tracker and moves it in, the ISR borrows it inside a critical section.
pub type SharedPulseTracker = Mutex<RefCell<Option<PulseTracker>>>;

pub const fn shared() -> SharedPulseTracker {
    Mutex::new(RefCell::new(None))
}

/// Access to a [`SharedPulseTracker`] from either context.
pub trait Tracker {
    fn push(&self, sample: i32, t_ms: i64);
    fn get_heartrate(&self, out: &mut HeartRate);
}

impl Tracker for SharedPulseTracker {
    fn push(&self, sample: i32, t_ms: i64) {
        critical_section::with(|cs| {
            if let Some(t) = self.borrow_ref_mut(cs).as_mut() {
                t.push(sample, t_ms);
            }
        })
    }

    fn get_heartrate(&self, out: &mut HeartRate) {
        critical_section::with(|cs| match self.borrow_ref(cs).as_ref() {
            Some(t) => t.get_heartrate(out),
            None => *out = HeartRate::none(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_reading_before_warmup() {
        let tracker = PulseTracker::new();
        let mut hr = HeartRate::default();
        tracker.get_heartrate(&mut hr);

        assert_eq!(hr.time, -1);
        assert_eq!(hr.hr, -1.0);
        assert_eq!(hr.hr_lb, -1.0);
        assert_eq!(hr.hr_ub, -1.0);
        assert_eq!(hr.err, ERR_NO_HR);
        assert!(!hr.is_ok());
    }

    #[test]
    fn pools_do_not_leak_under_noise() {
        let mut tracker = PulseTracker::new();

        // deterministic junk input for ten minutes of sample time
        let mut state = 0x2f6e_2b1du32;
        let mut t = 0i64;
        for _ in 0..(10 * 60 * SAMPLE_RATE) {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let sig = 50 + (state >> 16) as i32 % 150;
            tracker.push(sig, t);
            t += (1000 / SAMPLE_RATE) as i64;
        }

        // in-flight plus free always accounts for every slot; the stages keep
        // their windows bounded well under the pool sizes
        assert!(tracker.peaks.num_free() > 0);
        assert!(tracker.pulses.num_free() > 0);
        assert!(tracker.rates.num_free() > 0);

        let mut hr = HeartRate::default();
        tracker.get_heartrate(&mut hr);
        assert!(hr.time >= -1);
    }

    #[test]
    fn shared_wrapper_round_trip() {
        let shared = shared();
        critical_section::with(|cs| {
            shared.borrow_ref_mut(cs).replace(PulseTracker::new());
        });

        let mut t = 0i64;
        for _ in 0..(20 * SAMPLE_RATE) {
            let phase = t as f64 / 1000.0 * core::f64::consts::TAU;
            Tracker::push(&shared, (100.0 + 100.0 * phase.sin()) as i32, t);
            t += (1000 / SAMPLE_RATE) as i64;
        }

        let mut hr = HeartRate::default();
        Tracker::get_heartrate(&shared, &mut hr);
        assert!(hr.is_ok());
        assert_eq!(hr.hr, 60.0);
    }
}
