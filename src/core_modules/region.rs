// THEORY:
// A region is a field-bearing container over an index domain 0..N-1. The
// pipeline owns two of them for the length of one run:
//
// 1.  **ItemRegion**: one slot per manifest entry holding the decoded, fixed
//     shape pixel buffer and the item's lifecycle state. A slot's buffer is
//     allocated when Load fills it and released as soon as the item has been
//     packed into a feature batch or dropped by the filter, so only in-flight
//     items are resident.
// 2.  **VectorRegion**: one feature vector and one filter flag per entry. Both
//     fields are write-once: Filter writes the flag, Feature writes the vector,
//     and nothing mutates them afterwards. The vector field is a single dense
//     N x dim buffer so the hand-off to the downstream consumer can copy
//     contiguous rows.
//
// Partition colors own disjoint index ranges, and the worker pool never runs
// two tasks with conflicting access sets, so the per-slot locks are never
// contended. They exist so the regions can be shared behind an `Arc`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{PipelineError, Result};

/// Width x height x channels of a decoded frame. Elements are single bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameShape {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl FrameShape {
    pub const fn new(width: u32, height: u32, channels: u32) -> Self {
        Self {
            width,
            height,
            channels,
        }
    }

    /// Number of bytes in one frame.
    pub const fn len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }

    /// Bytes between the starts of two consecutive rows.
    pub const fn row_stride(&self) -> usize {
        self.width as usize * self.channels as usize
    }
}

/// A decoded, fixed-shape raw pixel buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    shape: FrameShape,
    data: Vec<u8>,
}

impl Frame {
    pub fn zeroed(shape: FrameShape) -> Self {
        Self {
            shape,
            data: vec![0u8; shape.len()],
        }
    }

    /// Wraps `data` if its length matches `shape`.
    pub fn from_raw(shape: FrameShape, data: Vec<u8>) -> Option<Self> {
        (data.len() == shape.len()).then_some(Self { shape, data })
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

}

/// Lifecycle of one item through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemState {
    Created,
    Loaded,
    Filtered,
    /// Filter passed and the feature vector has been written.
    Featured,
    /// Filter failed; the item never reaches Feature.
    Skipped,
    /// Load or decode failed, or the load outlived its timeout, and the
    /// failure was isolated to this item.
    Failed,
}

impl ItemState {
    pub fn can_advance_to(self, next: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (self, next),
            (Created, Loaded)
                | (Created, Failed)
                | (Loaded, Filtered)
                | (Loaded, Failed)
                | (Filtered, Featured)
                | (Filtered, Skipped)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Featured | ItemState::Skipped | ItemState::Failed)
    }
}

/// Whether a region's storage must be materialised up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Residency {
    Resident,
    /// Storage is only allocated once a task actually writes to it.
    Virtual,
}

#[derive(Debug)]
struct ItemSlot {
    state: ItemState,
    frame: Option<Frame>,
}

/// N slots of decoded frames plus per-item lifecycle state.
#[derive(Debug)]
pub struct ItemRegion {
    shape: FrameShape,
    slots: Vec<Mutex<ItemSlot>>,
}

impl ItemRegion {
    pub fn new(len: usize, shape: FrameShape) -> Self {
        let slots = (0..len)
            .map(|_| {
                Mutex::new(ItemSlot {
                    state: ItemState::Created,
                    frame: None,
                })
            })
            .collect();
        Self { shape, slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    fn slot(&self, index: usize) -> Result<MutexGuard<'_, ItemSlot>> {
        let slot = self.slots.get(index).ok_or(PipelineError::OutOfBounds {
            index,
            len: self.slots.len(),
        })?;
        Ok(slot.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn transition(slot: &mut ItemSlot, index: usize, to: ItemState) -> Result<()> {
        if !slot.state.can_advance_to(to) {
            return Err(PipelineError::InvalidTransition {
                index,
                from: slot.state,
                to,
            });
        }
        slot.state = to;
        Ok(())
    }

    pub fn state(&self, index: usize) -> Result<ItemState> {
        Ok(self.slot(index)?.state)
    }

    /// Stores a decoded frame and moves the item to `Loaded`.
    pub fn store_frame(&self, index: usize, frame: Frame) -> Result<()> {
        if frame.shape() != self.shape {
            return Err(PipelineError::ShapeMismatch {
                index,
                expected: self.shape,
                actual: frame.shape(),
            });
        }
        let mut slot = self.slot(index)?;
        Self::transition(&mut slot, index, ItemState::Loaded)?;
        slot.frame = Some(frame);
        Ok(())
    }

    /// Runs `f` over the slot's frame without copying it.
    pub fn with_frame<R>(&self, index: usize, f: impl FnOnce(&Frame) -> R) -> Result<R> {
        let slot = self.slot(index)?;
        let frame = slot
            .frame
            .as_ref()
            .ok_or(PipelineError::MissingFrame { index })?;
        Ok(f(frame))
    }

    pub fn advance(&self, index: usize, to: ItemState) -> Result<()> {
        let mut slot = self.slot(index)?;
        Self::transition(&mut slot, index, to)?;
        if to.is_terminal() {
            slot.frame = None;
        }
        Ok(())
    }

    /// Moves the frame out of its slot, releasing the slot's storage.
    pub fn take_frame(&self, index: usize) -> Result<Frame> {
        self.slot(index)?
            .frame
            .take()
            .ok_or(PipelineError::MissingFrame { index })
    }

    /// Number of slots currently holding a decoded frame.
    pub fn resident_frames(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| {
                slot.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .frame
                    .is_some()
            })
            .count()
    }

    /// Number of slots currently in `state`.
    pub fn count_in(&self, state: ItemState) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).state == state)
            .count()
    }
}

/// The two values a filter flag may hold. The discriminants are the literal
/// values stored in the flag field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum FilterFlag {
    Pass = 0,
    Fail = -1,
}

impl FilterFlag {
    pub const fn raw(self) -> i32 {
        self as i32
    }

    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(FilterFlag::Pass),
            -1 => Some(FilterFlag::Fail),
            _ => None,
        }
    }

    pub const fn from_passed(passed: bool) -> Self {
        if passed { FilterFlag::Pass } else { FilterFlag::Fail }
    }
}

// Stored in the flag field until Filter runs.
const FLAG_UNSET: i32 = i32::MIN;

/// N slots of `dim`-wide feature vectors plus one filter flag each.
#[derive(Debug)]
pub struct VectorRegion {
    dim: usize,
    len: usize,
    flags: Vec<AtomicI32>,
    written: Vec<AtomicBool>,
    vectors: Mutex<Vec<f32>>,
}

impl VectorRegion {
    pub fn new(len: usize, dim: usize, residency: Residency) -> Self {
        let vectors = match residency {
            Residency::Resident => vec![0.0; len * dim],
            Residency::Virtual => Vec::new(),
        };
        Self {
            dim,
            len,
            flags: (0..len).map(|_| AtomicI32::new(FLAG_UNSET)).collect(),
            written: (0..len).map(|_| AtomicBool::new(false)).collect(),
            vectors: Mutex::new(vectors),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn check(&self, index: usize) -> Result<()> {
        if index >= self.len {
            return Err(PipelineError::OutOfBounds {
                index,
                len: self.len,
            });
        }
        Ok(())
    }

    /// Writes the filter flag. A slot's flag can be written exactly once.
    pub fn write_flag(&self, index: usize, flag: FilterFlag) -> Result<()> {
        self.check(index)?;
        self.flags[index]
            .compare_exchange(FLAG_UNSET, flag.raw(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| PipelineError::SlotRewritten {
                field: "filter",
                index,
            })
    }

    /// The flag of `index`, or `None` while Filter has not run for it.
    pub fn flag(&self, index: usize) -> Result<Option<FilterFlag>> {
        self.check(index)?;
        Ok(FilterFlag::from_raw(self.flags[index].load(Ordering::Acquire)))
    }

    /// Literal flag values for every slot, `None` where Filter has not run.
    pub fn raw_flags(&self) -> Vec<Option<i32>> {
        self.flags
            .iter()
            .map(|flag| match flag.load(Ordering::Acquire) {
                FLAG_UNSET => None,
                raw => Some(raw),
            })
            .collect()
    }

    /// Writes several vectors under one lock. Each slot may be written once.
    /// Every row is checked before any is written, so a rejected batch leaves
    /// the region untouched.
    pub fn write_vectors<'a>(
        &self,
        rows: impl IntoIterator<Item = (usize, &'a [f32])>,
    ) -> Result<usize> {
        let rows: Vec<(usize, &[f32])> = rows.into_iter().collect();
        let mut vectors = self.vectors.lock().unwrap_or_else(PoisonError::into_inner);
        let mut seen = HashSet::with_capacity(rows.len());
        for &(index, row) in &rows {
            self.check(index)?;
            if row.len() != self.dim {
                return Err(PipelineError::BatchShape(format!(
                    "vector for item {index} has {} values, region dimension is {}",
                    row.len(),
                    self.dim
                )));
            }
            if !seen.insert(index) || self.has_vector(index) {
                return Err(PipelineError::SlotRewritten {
                    field: "vector",
                    index,
                });
            }
        }

        if vectors.is_empty() && self.len > 0 {
            vectors.resize(self.len * self.dim, 0.0);
        }
        for &(index, row) in &rows {
            let start = index * self.dim;
            vectors[start..start + self.dim].copy_from_slice(row);
            self.written[index].store(true, Ordering::Release);
        }
        Ok(rows.len())
    }

    pub fn write_vector(&self, index: usize, row: &[f32]) -> Result<()> {
        self.write_vectors([(index, row)]).map(|_| ())
    }

    pub fn has_vector(&self, index: usize) -> bool {
        self.written
            .get(index)
            .is_some_and(|written| written.load(Ordering::Acquire))
    }

    pub fn vector(&self, index: usize) -> Result<Option<Vec<f32>>> {
        self.check(index)?;
        if !self.has_vector(index) {
            return Ok(None);
        }
        let start = index * self.dim;
        Ok(Some(self.with_dense_vectors(|dense| {
            dense[start..start + self.dim].to_vec()
        })))
    }

    /// Runs `f` over the dense N x dim vector buffer. The buffer is empty if
    /// the region is virtual and nothing has been written yet.
    pub fn with_dense_vectors<R>(&self, f: impl FnOnce(&[f32]) -> R) -> R {
        let vectors = self.vectors.lock().unwrap_or_else(PoisonError::into_inner);
        f(&vectors)
    }

    /// True once the dense vector buffer has been materialised.
    pub fn is_resident(&self) -> bool {
        self.with_dense_vectors(|dense| !dense.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHAPE: FrameShape = FrameShape::new(4, 2, 3);

    #[test]
    fn item_slots_follow_the_lifecycle() {
        let items = ItemRegion::new(2, SHAPE);
        assert_eq!(items.state(0).unwrap(), ItemState::Created);

        items.store_frame(0, Frame::zeroed(SHAPE)).unwrap();
        assert_eq!(items.state(0).unwrap(), ItemState::Loaded);
        assert_eq!(items.resident_frames(), 1);

        items.advance(0, ItemState::Filtered).unwrap();
        items.advance(0, ItemState::Skipped).unwrap();
        assert_eq!(items.resident_frames(), 0, "skipped items release their frame");

        let err = items.advance(1, ItemState::Filtered).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidTransition {
                index: 1,
                from: ItemState::Created,
                to: ItemState::Filtered
            }
        ));
    }

    #[test]
    fn frames_of_the_wrong_shape_are_refused() {
        let items = ItemRegion::new(1, SHAPE);
        let err = items
            .store_frame(0, Frame::zeroed(FrameShape::new(1, 1, 3)))
            .unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { index: 0, .. }));
    }

    #[test]
    fn take_frame_releases_the_slot() {
        let items = ItemRegion::new(1, SHAPE);
        items.store_frame(0, Frame::zeroed(SHAPE)).unwrap();
        let frame = items.take_frame(0).unwrap();
        assert_eq!(frame.as_bytes().len(), SHAPE.len());
        assert!(matches!(
            items.take_frame(0),
            Err(PipelineError::MissingFrame { index: 0 })
        ));
    }

    #[test]
    fn flags_are_write_once() {
        let vectors = VectorRegion::new(3, 2, Residency::Virtual);
        assert_eq!(vectors.flag(1).unwrap(), None);
        vectors.write_flag(1, FilterFlag::Pass).unwrap();
        assert_eq!(vectors.flag(1).unwrap(), Some(FilterFlag::Pass));
        assert!(matches!(
            vectors.write_flag(1, FilterFlag::Fail),
            Err(PipelineError::SlotRewritten { field: "filter", index: 1 })
        ));
        assert_eq!(vectors.raw_flags(), vec![None, Some(0), None]);
    }

    #[test]
    fn virtual_vector_storage_materialises_on_first_write() {
        let vectors = VectorRegion::new(2, 3, Residency::Virtual);
        assert!(!vectors.is_resident());
        vectors.write_vector(1, &[1.0, 2.0, 3.0]).unwrap();
        assert!(vectors.is_resident());
        assert_eq!(vectors.vector(1).unwrap(), Some(vec![1.0, 2.0, 3.0]));
        assert_eq!(vectors.vector(0).unwrap(), None);
        vectors.with_dense_vectors(|dense| assert_eq!(dense, &[0.0, 0.0, 0.0, 1.0, 2.0, 3.0]));
    }

    #[test]
    fn vectors_are_write_once_and_dimension_checked() {
        let vectors = VectorRegion::new(1, 2, Residency::Resident);
        assert!(matches!(
            vectors.write_vector(0, &[1.0]),
            Err(PipelineError::BatchShape(_))
        ));
        vectors.write_vector(0, &[1.0, 1.0]).unwrap();
        assert!(matches!(
            vectors.write_vector(0, &[2.0, 2.0]),
            Err(PipelineError::SlotRewritten { field: "vector", index: 0 })
        ));
    }

    #[test]
    fn a_rejected_batch_writes_nothing() {
        let vectors = VectorRegion::new(3, 2, Residency::Virtual);
        let good = [1.0, 2.0];
        let short = [3.0];
        let err = vectors
            .write_vectors([(0, &good[..]), (1, &short[..])])
            .unwrap_err();
        assert!(matches!(err, PipelineError::BatchShape(_)));
        assert!(!vectors.has_vector(0));
        assert!(!vectors.is_resident());

        let err = vectors
            .write_vectors([(2, &good[..]), (2, &good[..])])
            .unwrap_err();
        assert!(matches!(err, PipelineError::SlotRewritten { index: 2, .. }));
        assert!(!vectors.has_vector(2));

        assert_eq!(vectors.write_vectors([(0, &good[..]), (2, &good[..])]).unwrap(), 2);
        assert_eq!(vectors.vector(2).unwrap(), Some(vec![1.0, 2.0]));
    }

    #[test]
    fn a_late_load_can_still_be_failed() {
        let items = ItemRegion::new(2, SHAPE);
        items.store_frame(0, Frame::zeroed(SHAPE)).unwrap();
        items.advance(0, ItemState::Failed).unwrap();
        assert_eq!(items.resident_frames(), 0);

        items.advance(1, ItemState::Failed).unwrap();
        assert!(matches!(
            items.store_frame(1, Frame::zeroed(SHAPE)),
            Err(PipelineError::InvalidTransition { from: ItemState::Failed, .. })
        ));
        assert_eq!(items.count_in(ItemState::Failed), 2);
        assert_eq!(items.count_in(ItemState::Loaded), 0);
    }

    #[test]
    fn raw_flag_values_round_trip() {
        assert_eq!(FilterFlag::Pass.raw(), 0);
        assert_eq!(FilterFlag::Fail.raw(), -1);
        assert_eq!(FilterFlag::from_raw(7), None);
        assert_eq!(FilterFlag::from_passed(false), FilterFlag::Fail);
    }
}
