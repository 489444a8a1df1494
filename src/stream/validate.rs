//! Pulse validation: classifies stats-stamped peaks and resolves runs of
//! suspect peaks by amplitude parity.
//!
//! Photoplethysmographic dicrotic notches show up as alternating
//! amp-high/amp-low false doubles between real beats; picking the parity with
//! the higher mean amplitude recovers the true beat train.

use super::{Heads, Peak};
use crate::pool::{Idx, Pool};

const BACK: usize = 0;
const FRONT: usize = 1;

/// A peak is assumed valid when its width is no more than one standard
/// deviation below the local mean, or at least 70 % of it. Written without
/// the division so a perfectly periodic signal (std == 0) falls through to
/// the ratio check.
fn assumed_valid(p: &Peak) -> bool {
    p.w > p.avg - p.std || p.w >= 0.7 * p.avg
}

struct EmitState {
    cursor: Idx,
    front: Idx,
    /// Group index parity to keep; 2 when only FRONT is emitted.
    parity: u8,
    k: u8,
}

pub struct Validation {
    heads: Heads<2>,
    /// Links BACK→FRONT.
    gap: u16,
    emit: Option<EmitState>,
}

impl Validation {
    pub const fn new() -> Validation {
        Validation {
            heads: Heads::new(),
            gap: 0,
            emit: None,
        }
    }

    /// Accept the next stamped peak. Any resulting pulses are drained with
    /// [`Self::next_pulse`] before the next push.
    pub fn push<const N: usize>(&mut self, pool: &mut Pool<Peak, N>, p: Idx) {
        debug_assert!(self.emit.is_none(), "pulses not drained before push");

        if self.heads.get(BACK).is_none() {
            self.heads.set(pool, BACK, Some(p));
            self.heads.set(pool, FRONT, Some(p));
            self.gap = 0;
        } else {
            self.heads.set(pool, FRONT, Some(p));
            self.gap += 1;
        }

        if !assumed_valid(pool.get(p)) {
            // suspect; wait for a later valid anchor
            return;
        }

        if self.gap <= 2 {
            // no suspect run: at most one in-between peak, which is dropped
            self.emit = Some(EmitState {
                cursor: p,
                front: p,
                parity: 2,
                k: 0,
            });
            return;
        }

        // questionable group strictly between BACK and FRONT; the parity with
        // the higher mean amplitude wins, ties go to even
        let Some(start) = self.heads.get(BACK).and_then(|b| pool.next(b)) else {
            debug_assert!(false, "gap > 2 but no group");
            return;
        };

        let mut sum = [0.0f32; 2];
        let mut cnt = [0u16; 2];
        let mut i = start;
        let mut k = 0usize;
        while i != p {
            sum[k % 2] += pool.get(i).amp as f32;
            cnt[k % 2] += 1;
            k += 1;
            let Some(n) = pool.next(i) else {
                debug_assert!(false, "FRONT not reachable from BACK");
                return;
            };
            i = n;
        }
        debug_assert!(cnt[0] > 0 && cnt[1] > 0);

        let parity = if sum[0] / (cnt[0] as f32) < sum[1] / cnt[1] as f32 {
            1
        } else {
            0
        };

        self.emit = Some(EmitState {
            cursor: start,
            front: p,
            parity,
            k: 0,
        });
    }

    /// Next pending pulse timestamp, oldest first. FRONT becomes the new
    /// anchor once it is emitted.
    pub fn next_pulse<const N: usize>(&mut self, pool: &mut Pool<Peak, N>) -> Option<i64> {
        let st = self.emit.as_mut()?;

        loop {
            if st.cursor == st.front {
                let front = st.front;
                let t = pool.get(front).t;
                self.emit = None;
                self.heads.set(pool, BACK, Some(front));
                self.gap = 0;
                return Some(t);
            }

            let i = st.cursor;
            let keep = st.k % 2 == st.parity;
            st.k = st.k.wrapping_add(1);
            let Some(n) = pool.next(i) else {
                debug_assert!(false, "emit cursor fell off the chain");
                self.emit = None;
                return None;
            };
            st.cursor = n;

            if keep {
                return Some(pool.get(i).t);
            }
        }
    }

    pub fn oldest_t<const N: usize>(&self, pool: &Pool<Peak, N>) -> Option<i64> {
        self.heads.get(BACK).map(|i| pool.get(i).t)
    }

    /// Reclaim path: the anchor moves one peak forward, dropping the oldest
    /// suspect.
    pub fn pop_oldest<const N: usize>(&mut self, pool: &mut Pool<Peak, N>) -> bool {
        debug_assert!(self.emit.is_none());

        if self.heads.get(BACK).is_none() {
            return false;
        }

        if self.gap == 0 {
            self.heads.clear(pool);
            return true;
        }

        self.heads.advance(pool, BACK);
        self.gap -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(
        pool: &mut Pool<Peak, 16>,
        stream: &mut Validation,
        prev: &mut Option<Idx>,
        peak: Peak,
    ) -> Vec<i64> {
        let p = pool.alloc().unwrap();
        *pool.get_mut(p) = peak;
        if let Some(q) = *prev {
            pool.link(q, p);
        }
        stream.push(pool, p);

        let mut out = Vec::new();
        while let Some(t) = stream.next_pulse(pool) {
            out.push(t);
        }

        pool.release(p);
        *prev = Some(p);
        out
    }

    #[test]
    fn uniform_valid_peaks_all_pass() {
        let mut pool: Pool<Peak, 16> = Pool::new();
        let mut stream = Validation::new();
        let mut prev = None;
        let mut pulses = Vec::new();

        for i in 0..20 {
            pulses.extend(feed(
                &mut pool,
                &mut stream,
                &mut prev,
                Peak {
                    t: i * 1000,
                    amp: 150,
                    w: 2000.0,
                    avg: 2000.0,
                    std: 0.0,
                },
            ));
        }

        // periodic input: std == 0 must not reject anything
        assert_eq!(pulses.len(), 20);
        assert_eq!(pulses, (0..20).map(|i| i * 1000).collect::<Vec<_>>());
    }

    #[test]
    fn parity_resolves_questionable_groups() {
        let mut pool: Pool<Peak, 16> = Pool::new();
        let mut stream = Validation::new();
        let mut prev = None;
        let mut pulses = Vec::new();

        // f: low-amp false double, q: high-amp but narrow, v: real beat
        for (i, c) in "fvfqfvqfv".chars().enumerate() {
            pulses.extend(feed(
                &mut pool,
                &mut stream,
                &mut prev,
                Peak {
                    t: i as i64 * 1000,
                    amp: if c == 'f' { 50 } else { 150 },
                    w: if c == 'v' { 2000.0 } else { 1000.0 },
                    avg: 2000.0,
                    std: 10.0,
                },
            ));
        }

        // peaks 1, 5, 8 are valid anchors; 3 and 6 win their group's parity
        assert_eq!(pulses, vec![1000, 3000, 5000, 6000, 8000]);
    }

    #[test]
    fn trailing_suspects_stay_queued() {
        let mut pool: Pool<Peak, 16> = Pool::new();
        let mut stream = Validation::new();
        let mut prev = None;
        let mut pulses = Vec::new();

        let peak = |t: i64, valid: bool| Peak {
            t,
            amp: 100,
            w: if valid { 2000.0 } else { 1000.0 },
            avg: 2000.0,
            std: 10.0,
        };

        pulses.extend(feed(&mut pool, &mut stream, &mut prev, peak(0, true)));
        for i in 1..5 {
            pulses.extend(feed(&mut pool, &mut stream, &mut prev, peak(i * 1000, false)));
        }

        // a run with no closing anchor emits nothing past the first beat
        assert_eq!(pulses, vec![0]);
    }
}
