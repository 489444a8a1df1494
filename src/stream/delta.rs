//! Inter-pulse deltas: each pulse is completed with the time to its
//! successor, then forwarded.

use super::{Heads, Pulse};
use crate::pool::{Idx, Pool};

const BACK: usize = 0;
const FRONT: usize = 1;

pub struct DeltaCalc {
    heads: Heads<2>,
}

impl DeltaCalc {
    pub const fn new() -> DeltaCalc {
        DeltaCalc {
            heads: Heads::new(),
        }
    }

    /// Append a freshly allocated pulse to the chain. The previous pulse gets
    /// its delta and is forwarded; the returned index carries a reference the
    /// caller releases once it is handed downstream.
    pub fn push<const N: usize>(&mut self, pool: &mut Pool<Pulse, N>, p: Idx) -> Option<Idx> {
        let Some(front) = self.heads.get(FRONT) else {
            self.heads.set(pool, BACK, Some(p));
            self.heads.set(pool, FRONT, Some(p));
            return None;
        };

        pool.link(front, p);
        self.heads.set(pool, FRONT, Some(p));

        let back = self.heads.get(BACK)?;
        pool.get_mut(back).d = (pool.get(p).t - pool.get(back).t) as f32;
        pool.retain(back);
        self.heads.advance(pool, BACK);

        Some(back)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_between_consecutive_pulses() {
        let mut pool: Pool<Pulse, 4> = Pool::new();
        let mut stream = DeltaCalc::new();
        let mut deltas = Vec::new();

        // a pulse every second for 20 s
        for i in 0..20 {
            let p = pool.alloc().unwrap();
            pool.get_mut(p).t = i * 1000;
            if let Some(b) = stream.push(&mut pool, p) {
                deltas.push(pool.get(b).d);
                pool.release(b);
            }
            pool.release(p);
        }

        assert_eq!(deltas.len(), 19);
        for d in deltas {
            assert_eq!(d, 1000.0);
        }
    }

    #[test]
    fn holds_at_most_two() {
        let mut pool: Pool<Pulse, 4> = Pool::new();
        let mut stream = DeltaCalc::new();

        for i in 0..10 {
            let p = pool.alloc().unwrap();
            pool.get_mut(p).t = i * 700;
            if let Some(b) = stream.push(&mut pool, p) {
                pool.release(b);
            }
            pool.release(p);
        }

        // only the newest pulse is still waiting for its delta
        assert_eq!(pool.num_free(), pool.capacity() - 1);
    }
}
