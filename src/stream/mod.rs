//! Pipeline stages over chains of pooled records.
//!
//! All peak stages share one chain through the peak arena, and all pulse
//! stages share one chain through the pulse arena. A stage is a set of named
//! head cursors into its chain plus the bookkeeping it needs; forwarding an
//! item downstream just moves the downstream stage's cursors onto it. The
//! entry stage of each chain is the one that links freshly allocated records
//! in.

use crate::pool::{Idx, Pool};

pub mod delta;
pub mod hr;
pub mod stats;
pub mod validate;
pub mod width;

/// A detected local maximum of the sampled signal. Width and the local width
/// statistics are -1 until the corresponding stage has computed them.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Peak {
    pub t: i64,
    pub amp: i32,
    /// Span from the previous to the next peak, ms.
    pub w: f32,
    pub avg: f32,
    pub std: f32,
}

impl Default for Peak {
    fn default() -> Peak {
        Peak {
            t: -1,
            amp: -1,
            w: -1.0,
            avg: -1.0,
            std: -1.0,
        }
    }
}

/// A peak judged to correspond to a real cardiac beat. `d` is the time until
/// the next valid pulse, -1 until known.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Pulse {
    pub t: i64,
    pub d: f32,
}

impl Default for Pulse {
    fn default() -> Pulse {
        Pulse { t: -1, d: -1.0 }
    }
}

/// Named head cursors of one stage. Every occupied head owns a reference on
/// the record it sits on; the chain links keep everything between the
/// earliest head and the newest record alive.
pub struct Heads<const H: usize> {
    idx: [Option<Idx>; H],
}

impl<const H: usize> Heads<H> {
    pub const fn new() -> Heads<H> {
        Heads { idx: [None; H] }
    }

    pub fn get(&self, h: usize) -> Option<Idx> {
        self.idx[h]
    }

    /// Move head `h`, retaining the new position before releasing the old one
    /// so a chain shared between them is never dropped in between.
    pub fn set<T: Default, const N: usize>(
        &mut self,
        pool: &mut Pool<T, N>,
        h: usize,
        to: Option<Idx>,
    ) {
        if let Some(i) = to {
            pool.retain(i);
        }
        let old = core::mem::replace(&mut self.idx[h], to);
        if let Some(o) = old {
            pool.release(o);
        }
    }

    /// Follow the chain one link. The head stays put at the chain end.
    pub fn advance<T: Default, const N: usize>(
        &mut self,
        pool: &mut Pool<T, N>,
        h: usize,
    ) -> Option<Idx> {
        let cur = self.idx[h]?;
        let next = pool.next(cur)?;
        self.set(pool, h, Some(next));
        Some(next)
    }

    pub fn clear<T: Default, const N: usize>(&mut self, pool: &mut Pool<T, N>) {
        for h in 0..H {
            self.set(pool, h, None);
        }
    }
}
