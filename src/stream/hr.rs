//! Heart-rate aggregation over a sliding window of inter-pulse deltas, with
//! bounded-staleness publication.

#[allow(unused_imports)]
use micromath::F32Ext;

use super::{Heads, Pulse};
use crate::pool::{Idx, Pool};
use crate::{
    HeartRate, ERR_VARIANCE, HR_SAMPLE_WINDOW_MS, MAX_ABS_HR_VARIANCE, MAX_HR_STALENESS_MS,
    MAX_PCT_HR_VARIANCE,
};

const BACK: usize = 0;
const FRONT: usize = 1;

pub struct HrCalc {
    heads: Heads<2>,
    last_calc: i64,
}

impl HrCalc {
    pub const fn new() -> HrCalc {
        HrCalc {
            heads: Heads::new(),
            last_calc: 0,
        }
    }

    /// Accept the next delta-stamped pulse and compute a rate when the window
    /// spans enough time and the last publication is stale enough.
    pub fn push<const N: usize>(&mut self, pool: &mut Pool<Pulse, N>, p: Idx) -> Option<HeartRate> {
        if self.heads.get(FRONT).is_none() {
            self.heads.set(pool, BACK, Some(p));
        }
        self.heads.set(pool, FRONT, Some(p));

        let front = p;
        let ft = pool.get(front).t;

        // keep the window just over HR_SAMPLE_WINDOW_MS long
        while let Some(back) = self.heads.get(BACK) {
            if back == front {
                break;
            }
            let Some(nb) = pool.next(back) else { break };
            if ft - pool.get(nb).t > HR_SAMPLE_WINDOW_MS {
                self.heads.advance(pool, BACK);
            } else {
                break;
            }
        }

        if ft - self.last_calc < MAX_HR_STALENESS_MS {
            return None;
        }

        let back = self.heads.get(BACK)?;
        let bt = pool.get(back).t;
        let span = ft - bt;
        if span < HR_SAMPLE_WINDOW_MS {
            return None;
        }

        let mut n = 0u32;
        let mut d_sum = 0.0f32;
        let mut d2_sum = 0.0f32;
        let mut i = back;
        loop {
            let d = pool.get(i).d;
            d_sum += d;
            d2_sum += d * d;
            n += 1;
            if i == front {
                break;
            }
            let Some(nx) = pool.next(i) else {
                debug_assert!(false, "FRONT not reachable from BACK");
                break;
            };
            i = nx;
        }

        let nf = n as f32;
        let d_avg = d_sum / nf;
        let d2_avg = d2_sum / nf;
        let var = d2_avg - d_avg * d_avg;
        let std = if var > 0.0 { var.sqrt() / nf } else { 0.0 };

        let hr = 60_000.0 / d_avg;
        let hr_lb = 60_000.0 / (d_avg + 2.0 * std);
        let hr_ub = if d_avg > 2.0 * std {
            60_000.0 / (d_avg - 2.0 * std)
        } else {
            f32::INFINITY
        };

        let err = if hr_ub - hr_lb > MAX_ABS_HR_VARIANCE || (hr_ub - hr_lb) / hr > MAX_PCT_HR_VARIANCE
        {
            ERR_VARIANCE
        } else {
            ""
        };

        self.last_calc = ft;

        Some(HeartRate {
            time: bt + span / 2,
            hr,
            hr_lb,
            hr_ub,
            err,
        })
    }

    pub fn oldest_t<const N: usize>(&self, pool: &Pool<Pulse, N>) -> Option<i64> {
        self.heads.get(BACK).map(|i| pool.get(i).t)
    }

    pub fn pop_oldest<const N: usize>(&mut self, pool: &mut Pool<Pulse, N>) -> bool {
        if self.heads.get(BACK).is_none() {
            return false;
        }
        if self.heads.advance(pool, BACK).is_none() {
            self.heads.clear(pool);
        }
        true
    }
}
