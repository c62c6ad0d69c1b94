use ahash::RandomState;
use indexmap::IndexMap;

use crate::stack::Stack;

/// Occurrence counts per distinct stack, in the order each stack was first captured.
pub type Counts<'a> = IndexMap<&'a Stack, usize, RandomState>;

/// Counts how often each structurally distinct stack occurs.
///
/// The counts always sum to the number of stacks given.
pub fn aggregate<'a, I>(stacks: I) -> Counts<'a>
where
    I: IntoIterator<Item = &'a Stack>,
{
    let mut counts = Counts::default();
    for stack in stacks {
        *counts.entry(stack).or_insert(0) += 1;
    }
    counts
}

/// Keeps the `k` most frequent stacks, ordered by descending count.
///
/// Stacks with equal counts keep the order of `counts`, which for [`aggregate`] output is
/// first-capture order. When several stacks tie at the cut-off, the ones captured first are
/// kept and the rest are dropped.
pub fn top_k<'a>(counts: Counts<'a>, k: usize) -> Counts<'a> {
    let mut entries: Vec<_> = counts.into_iter().collect();
    // stable, so ties stay in first-capture order
    entries.sort_by(|(_, a), (_, b)| b.cmp(a));
    entries.truncate(k);
    entries.into_iter().collect()
}
