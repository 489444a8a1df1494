//! Local width statistics: running mean and standard deviation of peak widths
//! over a time window centered on the peak being stamped.

#[allow(unused_imports)]
use micromath::F32Ext;

use super::{Heads, Peak};
use crate::pool::{Idx, Pool};
use crate::{SMART_SUM_MAX_AGE_MS, VALIDATION_WINDOW_MS};

const BACK: usize = 0;
const WRITE: usize = 1;
const FRONT: usize = 2;
const AVAILABLE: usize = 3;

/// Half-window on each side of the WRITE peak.
const HALF: i64 = VALIDATION_WINDOW_MS / 2;

pub struct WidthStats {
    heads: Heads<4>,

    /// Running sums over BACK..=FRONT, adjusted in O(1) as the heads move.
    w_sum: f32,
    w2_sum: f32,

    /// Link distances BACK→WRITE and WRITE→FRONT.
    n_back: u16,
    n_front: u16,

    /// Timestamp of the last full recompute of the running sums.
    sums_since: i64,
}

impl WidthStats {
    pub const fn new() -> WidthStats {
        WidthStats {
            heads: Heads::new(),
            w_sum: 0.0,
            w2_sum: 0.0,
            n_back: 0,
            n_front: 0,
            sums_since: 0,
        }
    }

    /// Accept the next width-stamped peak. The peak is already on the chain;
    /// AVAILABLE marks how far FRONT may advance.
    pub fn absorb<const N: usize>(&mut self, pool: &mut Pool<Peak, N>, p: Idx) {
        if self.heads.get(AVAILABLE).is_none() {
            for h in [BACK, WRITE, FRONT, AVAILABLE] {
                self.heads.set(pool, h, Some(p));
            }
            let pk = pool.get(p);
            self.w_sum = pk.w;
            self.w2_sum = pk.w * pk.w;
            self.n_back = 0;
            self.n_front = 0;
            self.sums_since = pk.t;
            return;
        }

        self.heads.set(pool, AVAILABLE, Some(p));

        // running sums accumulate float error; refresh them from the live
        // window now and then
        if pool.get(p).t - self.sums_since > SMART_SUM_MAX_AGE_MS {
            self.rebuild(pool);
        }
    }

    /// Stamp and forward the WRITE peak if enough of the window is present on
    /// both sides. Call until it returns `None`.
    pub fn try_emit<const N: usize>(&mut self, pool: &mut Pool<Peak, N>) -> Option<Idx> {
        let write = self.heads.get(WRITE)?;
        let wt = pool.get(write).t;

        // drop trailing peaks the back half no longer needs
        while self.n_back > 0 {
            let back = self.heads.get(BACK)?;
            let Some(nb) = pool.next(back) else { break };
            if wt - pool.get(nb).t < HALF {
                break;
            }
            let w = pool.get(back).w;
            self.w_sum -= w;
            self.w2_sum -= w * w;
            self.heads.advance(pool, BACK);
            self.n_back -= 1;
        }

        // grow the leading half up to the newest accepted peak
        loop {
            let front = self.heads.get(FRONT)?;
            if pool.get(front).t - wt >= HALF {
                break;
            }
            if Some(front) == self.heads.get(AVAILABLE) {
                // not enough lead yet
                return None;
            }
            let Some(nf) = self.heads.advance(pool, FRONT) else {
                debug_assert!(false, "chain ends before AVAILABLE");
                return None;
            };
            let w = pool.get(nf).w;
            self.w_sum += w;
            self.w2_sum += w * w;
            self.n_front += 1;
        }

        let n = (self.n_back + self.n_front + 1) as f32;
        let avg = self.w_sum / n;
        let var = self.w2_sum / n - avg * avg;
        let std = if var > 0.0 { var.sqrt() } else { 0.0 };

        {
            let pk = pool.get_mut(write);
            pk.avg = avg;
            pk.std = std;
        }

        self.heads.advance(pool, WRITE);
        self.n_back += 1;
        self.n_front -= 1;

        Some(write)
    }

    pub fn oldest_t<const N: usize>(&self, pool: &Pool<Peak, N>) -> Option<i64> {
        self.heads.get(BACK).map(|i| pool.get(i).t)
    }

    /// Reclaim path: drop the oldest held peak, keeping WRITE and FRONT on
    /// the chain, then refresh the sums.
    pub fn pop_oldest<const N: usize>(&mut self, pool: &mut Pool<Peak, N>) -> bool {
        let Some(back) = self.heads.get(BACK) else {
            return false;
        };

        if self.n_back > 0 {
            self.heads.advance(pool, BACK);
            self.n_back -= 1;
        } else if self.n_front > 0 {
            // WRITE sits on the popped peak and moves with BACK; the peak is
            // dropped without being stamped
            self.heads.advance(pool, WRITE);
            self.heads.advance(pool, BACK);
            self.n_front -= 1;
        } else if Some(back) != self.heads.get(AVAILABLE) {
            self.heads.advance(pool, FRONT);
            self.heads.advance(pool, WRITE);
            self.heads.advance(pool, BACK);
        } else {
            self.heads.clear(pool);
            self.w_sum = 0.0;
            self.w2_sum = 0.0;
            return true;
        }

        self.rebuild(pool);
        true
    }

    fn rebuild<const N: usize>(&mut self, pool: &mut Pool<Peak, N>) {
        let (Some(back), Some(front)) = (self.heads.get(BACK), self.heads.get(FRONT)) else {
            self.w_sum = 0.0;
            self.w2_sum = 0.0;
            return;
        };

        let mut w_sum = 0.0;
        let mut w2_sum = 0.0;
        let mut i = back;
        loop {
            let w = pool.get(i).w;
            w_sum += w;
            w2_sum += w * w;
            if i == front {
                break;
            }
            let Some(n) = pool.next(i) else {
                debug_assert!(false, "FRONT not reachable from BACK");
                break;
            };
            i = n;
        }

        self.w_sum = w_sum;
        self.w2_sum = w2_sum;
        if let Some(a) = self.heads.get(AVAILABLE) {
            self.sums_since = pool.get(a).t;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn feed(
        pool: &mut Pool<Peak, 32>,
        stream: &mut WidthStats,
        prev: &mut Option<Idx>,
        t: i64,
        w: f32,
    ) -> Vec<(i64, f32, f32)> {
        let p = pool.alloc().unwrap();
        {
            let pk = pool.get_mut(p);
            pk.t = t;
            pk.w = w;
        }
        if let Some(q) = *prev {
            pool.link(q, p);
        }
        stream.absorb(pool, p);

        let mut out = Vec::new();
        while let Some(i) = stream.try_emit(pool) {
            let pk = pool.get(i);
            out.push((pk.t, pk.avg, pk.std));
        }

        pool.release(p);
        *prev = Some(p);
        out
    }

    #[test]
    fn uniform_widths_give_exact_stats() {
        let mut pool: Pool<Peak, 32> = Pool::new();
        let mut stream = WidthStats::new();
        let mut prev = None;
        let mut stamped = Vec::new();

        // a peak every second for twice the validation window
        for t in (0..2 * VALIDATION_WINDOW_MS).step_by(1000) {
            stamped.extend(feed(&mut pool, &mut stream, &mut prev, t, 2000.0));
        }

        assert!(stamped.len() >= (VALIDATION_WINDOW_MS / 1000) as usize);
        for (_, avg, std) in &stamped {
            assert_eq!(*avg, 2000.0);
            assert_eq!(*std, 0.0);
        }
    }

    #[test]
    fn window_is_centered_on_write() {
        let mut pool: Pool<Peak, 32> = Pool::new();
        let mut stream = WidthStats::new();
        let mut prev = None;
        let mut stamped = Vec::new();

        // widths step from 1000 to 2000 at t=6000
        for t in (0..22_000).step_by(1000) {
            let w = if t < 6000 { 1000.0 } else { 2000.0 };
            stamped.extend(feed(&mut pool, &mut stream, &mut prev, t, w));
        }

        // the peak at t=0 is stamped once the lead reaches HALF; its window
        // [0, 5000] still lies entirely before the step
        assert_eq!(stamped[0], (0, 1000.0, 0.0));

        // at the step the window [1000, 11000] mixes five old and six new
        // widths
        let (_, avg, std) = *stamped.iter().find(|(t, _, _)| *t == 6000).unwrap();
        assert_abs_diff_eq!(avg, 17_000.0 / 11.0, epsilon = 0.1);
        assert!(std > 0.0);

        // the last stamped peak sees only new widths again
        assert_eq!(*stamped.last().unwrap(), (16_000, 2000.0, 0.0));
    }

    #[test]
    fn no_emit_until_lead_covers_half_window() {
        let mut pool: Pool<Peak, 32> = Pool::new();
        let mut stream = WidthStats::new();
        let mut prev = None;

        for t in (0..HALF).step_by(1000) {
            let out = feed(&mut pool, &mut stream, &mut prev, t, 800.0);
            assert!(out.is_empty());
        }
    }

    #[test]
    fn pop_oldest_keeps_accounting() {
        let mut pool: Pool<Peak, 32> = Pool::new();
        let mut stream = WidthStats::new();
        let mut prev = None;

        for t in (0..8000).step_by(1000) {
            feed(&mut pool, &mut stream, &mut prev, t, 1500.0);
        }

        let free = pool.num_free();
        assert!(stream.pop_oldest(&mut pool));
        assert_eq!(pool.num_free(), free + 1);

        while stream.pop_oldest(&mut pool) {}
        assert_eq!(pool.num_free(), pool.capacity());
        assert!(stream.oldest_t(&pool).is_none());
    }
}
