// THEORY:
// The Filter stage: a pluggable boolean predicate over a decoded frame.
//
// The stage writes the literal PASS or FAIL value into the vector region's
// flag field and returns the boolean so the Feature stage can be predicated
// on it.

use std::fmt::Debug;

use crate::core_modules::region::{FilterFlag, Frame, ItemRegion, ItemState, VectorRegion};
use crate::error::Result;

pub trait FilterPredicate: Send + Sync + Debug {
    fn passes(&self, frame: &Frame) -> bool;
}

/// Passes frames whose first byte is even. A stand-in for a real quality or
/// content filter; the pipeline only relies on it returning a boolean.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstByteParity;

impl FilterPredicate for FirstByteParity {
    fn passes(&self, frame: &Frame) -> bool {
        frame.as_bytes().first().is_some_and(|byte| byte % 2 == 0)
    }
}

/// Wraps a closure as a predicate.
pub struct FnPredicate<F>(pub F);

impl<F> Debug for FnPredicate<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnPredicate")
    }
}

impl<F> FilterPredicate for FnPredicate<F>
where
    F: Fn(&Frame) -> bool + Send + Sync,
{
    fn passes(&self, frame: &Frame) -> bool {
        (self.0)(frame)
    }
}

/// Runs `predicate` over item `index`, records the flag and advances the item
/// to `Filtered`. A failing item moves on to `Skipped` and drops its frame.
pub fn filter_item(
    predicate: &dyn FilterPredicate,
    items: &ItemRegion,
    vectors: &VectorRegion,
    index: usize,
) -> Result<bool> {
    let passed = items.with_frame(index, |frame| predicate.passes(frame))?;
    vectors.write_flag(index, FilterFlag::from_passed(passed))?;
    items.advance(index, ItemState::Filtered)?;
    if !passed {
        items.advance(index, ItemState::Skipped)?;
    }
    Ok(passed)
}
