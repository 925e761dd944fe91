//! Dense position identifiers for ordered sequence fields.
//!
//! A position is a path of `(digit, actor, seq)` identifiers compared
//! lexicographically. A new position between two neighbours is generated
//! from the authoring change's `(actor, seq)`, so concurrent inserts at the
//! same place get distinct positions with a deterministic order and no
//! existing element ever moves.

use serde::{Deserialize, Serialize};
use std::fmt;

use tandem_core::ActorId;

/// Largest gap left between consecutive appends at one level.
const BOUNDARY: u64 = 1 << 16;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ident {
    pub digit: u32,
    pub actor: ActorId,
    pub seq: u64,
}

impl Ident {
    /// Smallest possible identifier; pads levels that carry no choice.
    fn filler() -> Self {
        Ident {
            digit: 0,
            actor: ActorId::new(""),
            seq: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(Vec<Ident>);

impl Position {
    /// Generate a position strictly between `left` and `right`
    /// (`None` = start / end of the sequence).
    ///
    /// The last identifier always carries `(actor, seq)` and a digit >= 1.
    pub fn between(
        left: Option<&Position>,
        right: Option<&Position>,
        actor: &ActorId,
        seq: u64,
    ) -> Position {
        let empty = Vec::new();
        let l = left.map(|p| &p.0).unwrap_or(&empty);
        let r = right.map(|p| &p.0);

        let mut out = Vec::new();
        let mut left_bound = true;
        let mut right_bound = r.is_some();

        let mut level = 0;
        loop {
            let lo = if left_bound {
                l.get(level).map_or(0, |i| u64::from(i.digit))
            } else {
                0
            };
            let right_ident = match r {
                Some(r) if right_bound => r.get(level),
                _ => None,
            };
            let hi = right_ident.map_or(u64::from(u32::MAX) + 1, |i| u64::from(i.digit));

            if hi > lo + 1 {
                let step = ((hi - lo) / 2).clamp(1, BOUNDARY);
                out.push(Ident {
                    // lo + step < hi <= u32::MAX + 1
                    digit: (lo + step) as u32,
                    actor: actor.clone(),
                    seq,
                });
                return Position(out);
            }

            let copied = match l.get(level) {
                Some(ident) if left_bound => ident.clone(),
                _ => {
                    left_bound = false;
                    Ident::filler()
                }
            };
            if let Some(ri) = right_ident {
                if copied < *ri {
                    right_bound = false;
                }
            }
            out.push(copied);
            level += 1;
        }
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// The identifier that made this position unique.
    pub fn origin(&self) -> Option<&Ident> {
        self.0.last()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, ident) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}@{}:{}", ident.digit, ident.actor, ident.seq)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod proptest_suite {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Random insertion indices always produce a strictly ordered list.
        #[test]
        fn inserts_stay_ordered(picks in prop::collection::vec((0usize..64, 0u8..3), 1..120)) {
            let actors = [ActorId::new("a"), ActorId::new("b"), ActorId::new("c")];
            let mut list: Vec<Position> = Vec::new();
            for (seq, (pick, who)) in picks.into_iter().enumerate() {
                let idx = pick % (list.len() + 1);
                let left = idx.checked_sub(1).map(|i| &list[i]);
                let right = list.get(idx);
                let p = Position::between(left, right, &actors[who as usize], seq as u64 + 1);
                if let Some(l) = left {
                    prop_assert!(*l < p, "{} !< {}", l, p);
                }
                if let Some(r) = right {
                    prop_assert!(p < *r, "{} !< {}", p, r);
                }
                prop_assert!(p.origin().unwrap().digit >= 1);
                list.insert(idx, p);
            }
        }
    }
}
