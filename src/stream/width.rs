//! Width calculation: slides a three-peak window over the chain and stamps
//! the middle peak with the span from its predecessor to its successor.

use super::{Heads, Peak};
use crate::pool::{Idx, Pool};

const BACK: usize = 0;
const FRONT: usize = 1;

pub struct WidthCalc {
    heads: Heads<2>,
    len: u8,
}

impl WidthCalc {
    pub const fn new() -> WidthCalc {
        WidthCalc {
            heads: Heads::new(),
            len: 0,
        }
    }

    /// Append a freshly allocated peak to the chain. Once three peaks are
    /// held the middle one gets its width and is forwarded.
    pub fn push<const N: usize>(&mut self, pool: &mut Pool<Peak, N>, p: Idx) -> Option<Idx> {
        match self.heads.get(FRONT) {
            None => {
                self.heads.set(pool, BACK, Some(p));
                self.heads.set(pool, FRONT, Some(p));
                self.len = 1;
            }
            Some(front) => {
                pool.link(front, p);
                self.heads.set(pool, FRONT, Some(p));
                self.len += 1;
            }
        }

        if self.len > 3 {
            self.heads.advance(pool, BACK);
            self.len -= 1;
        }
        debug_assert!(self.len <= 3, "width window grew past three peaks");

        if self.len != 3 {
            return None;
        }

        let back = self.heads.get(BACK)?;
        let front = self.heads.get(FRONT)?;
        let mid = pool.next(back)?;

        pool.get_mut(mid).w = (pool.get(front).t - pool.get(back).t) as f32;
        Some(mid)
    }

    pub fn oldest_t<const N: usize>(&self, pool: &Pool<Peak, N>) -> Option<i64> {
        self.heads.get(BACK).map(|i| pool.get(i).t)
    }

    /// Reclaim path: drop the oldest held peak.
    pub fn pop_oldest<const N: usize>(&mut self, pool: &mut Pool<Peak, N>) -> bool {
        match self.len {
            0 => false,
            1 => {
                self.heads.clear(pool);
                self.len = 0;
                true
            }
            _ => {
                self.heads.advance(pool, BACK);
                self.len -= 1;
                true
            }
        }
    }
}
