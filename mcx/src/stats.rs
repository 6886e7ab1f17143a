//! Counters and the emitter contract for context stats passes.

use crate::context::ContextHeader;

/// Aggregate memory counters accumulated across contexts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    /// Number of live blocks.
    pub nblocks: usize,
    /// Number of free chunks across all blocks.
    pub freechunks: usize,
    /// Total attributed space, including context headers.
    pub totalspace: usize,
    /// Space held by free chunks.
    pub freespace: usize,
}

impl Counters {
    /// Adds another set of counters into this one.
    pub fn absorb(&mut self, other: &Counters) {
        self.nblocks += other.nblocks;
        self.freechunks += other.freechunks;
        self.totalspace += other.totalspace;
        self.freespace += other.freespace;
    }
}

/// Callback receiving one formatted stats line per context.
///
/// Implementations format the line themselves and hand it over whole, so the
/// emitter decides the destination without any intermediate buffer.
pub type StatsEmit<'a> = &'a mut dyn FnMut(&ContextHeader, &str, bool);

/// Default emitter: stderr when `to_stderr` is set, the log otherwise.
pub fn default_emitter(cx: &ContextHeader, line: &str, to_stderr: bool) {
    if to_stderr {
        eprintln!("{}: {}", cx.name(), line);
    } else {
        log::info!("{}: {}", cx.name(), line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absorb_sums_fields() {
        let mut total = Counters::default();
        total.absorb(&Counters {
            nblocks: 1,
            freechunks: 2,
            totalspace: 1024,
            freespace: 144,
        });
        total.absorb(&Counters {
            nblocks: 2,
            freechunks: 3,
            totalspace: 2048,
            freespace: 72,
        });
        assert_eq!(
            total,
            Counters {
                nblocks: 3,
                freechunks: 5,
                totalspace: 3072,
                freespace: 216,
            }
        );
    }
}
