//! Live intervals: where in a method a value (or part of a value, after splitting) needs to be
//! held in a register.
//!
//! Every SSA value starts with exactly one [LiveIntervals], its "split parent". When the linear
//! scan needs a value to be in different registers at different points, it splits an interval
//! into a shorter interval and a "split child". All intervals live in an [IntervalArena] and are
//! referred to by [IntervalIdx].

use crate::ir::{Ty, ValueIdx, U16BIT_MAX, U8BIT_MAX};
use index_vec::IndexVec;
use std::{
    collections::BTreeSet,
    fmt,
    ops::{Index, IndexMut},
};

index_vec::define_index_type! {
    /// An index into an [IntervalArena].
    pub struct IntervalIdx = u32;
    DISPLAY_FORMAT = "i{}";
}

/// Round `pos` down to the nearest gap (i.e. odd) position.
pub fn to_gap_position(pos: u32) -> u32 {
    if pos % 2 == 0 {
        pos.saturating_sub(1)
    } else {
        pos
    }
}

/// A half-open range of positions `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct LiveRange {
    pub start: u32,
    pub end: u32,
}

impl LiveRange {
    pub fn new(start: u32, end: u32) -> Self {
        debug_assert!(start < end);
        Self { start, end }
    }

    pub fn contains(&self, pos: u32) -> bool {
        self.start <= pos && pos < self.end
    }

    pub fn overlaps(&self, other: &LiveRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for LiveRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// A position at which a value is read or written, and the highest register the instruction at
/// that position can encode the value in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct LiveIntervalsUse {
    pub position: u32,
    pub limit: u32,
}

impl LiveIntervalsUse {
    pub fn new(position: u32, limit: u32) -> Self {
        Self { position, limit }
    }

    /// Does this use constrain the register its value can be in?
    pub fn is_constrained(&self) -> bool {
        self.limit < U16BIT_MAX
    }
}

#[derive(Clone, Debug)]
pub struct LiveIntervals {
    pub value: ValueIdx,
    pub ty: Ty,
    /// Sorted, non-overlapping, non-adjacent ranges.
    ranges: Vec<LiveRange>,
    uses: BTreeSet<LiveIntervalsUse>,
    /// The register assigned in the allocator's register space, before compaction.
    pub register: Option<u32>,
    register_limit: u32,
    /// Was this interval spilled? A spilled interval either holds a spill register or, if it is
    /// rematerialisable, no register at all.
    pub spilled: bool,
    split_parent: IntervalIdx,
    /// Only populated on split parents. Sorted by start position.
    split_children: Vec<IntervalIdx>,
    pub prev_consecutive: Option<IntervalIdx>,
    pub next_consecutive: Option<IntervalIdx>,
    /// A register that, if free, would avoid a move.
    pub hint: Option<u32>,
    pub is_argument: bool,
    pub is_receiver: bool,
    pub const_value: Option<i64>,
    pub used_in_monitor: bool,
    /// Is this interval's register fixed before the scan starts (and thus impossible to evict)?
    pub pinned: bool,
}

impl LiveIntervals {
    pub fn new(value: ValueIdx, ty: Ty) -> Self {
        Self {
            value,
            ty,
            ranges: Vec::new(),
            uses: BTreeSet::new(),
            register: None,
            register_limit: U16BIT_MAX,
            spilled: false,
            split_parent: IntervalIdx::new(0),
            split_children: Vec::new(),
            prev_consecutive: None,
            next_consecutive: None,
            hint: None,
            is_argument: false,
            is_receiver: false,
            const_value: None,
            used_in_monitor: false,
            pinned: false,
        }
    }

    /// # Panics
    ///
    /// If this interval has no ranges.
    pub fn start(&self) -> u32 {
        self.ranges[0].start
    }

    /// # Panics
    ///
    /// If this interval has no ranges.
    pub fn end(&self) -> u32 {
        self.ranges[self.ranges.len() - 1].end
    }

    pub fn ranges(&self) -> &[LiveRange] {
        &self.ranges
    }

    pub fn uses(&self) -> &BTreeSet<LiveIntervalsUse> {
        &self.uses
    }

    pub fn register_limit(&self) -> u32 {
        self.register_limit
    }

    pub fn split_parent(&self) -> IntervalIdx {
        self.split_parent
    }

    pub fn split_children(&self) -> &[IntervalIdx] {
        &self.split_children
    }

    pub fn required_registers(&self) -> u32 {
        self.ty.required_registers()
    }

    pub fn is_linked(&self) -> bool {
        self.prev_consecutive.is_some() || self.next_consecutive.is_some()
    }

    /// A spilled constant with no register: restoring it means re-materialising the constant.
    pub fn is_rematerializable(&self) -> bool {
        self.spilled && self.register.is_none() && self.const_value.is_some()
    }

    /// Add `range`, which must start no later than any existing range, merging it with the first
    /// existing range if they overlap or touch. Intervals are built by walking the method
    /// backwards, so this is the only order ranges arrive in.
    pub fn add_range(&mut self, range: LiveRange) {
        match self.ranges.first_mut() {
            Some(first) if range.end >= first.start => {
                debug_assert!(range.start <= first.start || range.end <= first.end);
                first.start = first.start.min(range.start);
                first.end = first.end.max(range.end);
            }
            _ => self.ranges.insert(0, range),
        }
    }

    /// Move the start of the first range to `pos`, which is where the value is defined.
    pub fn set_start(&mut self, pos: u32) {
        if let Some(first) = self.ranges.first_mut() {
            debug_assert!(pos < first.end);
            first.start = pos;
        }
    }

    pub fn add_use(&mut self, u: LiveIntervalsUse) {
        self.uses.insert(u);
        self.register_limit = self.register_limit.min(u.limit);
    }

    fn recompute_limit(&mut self) {
        self.register_limit = self
            .uses
            .iter()
            .map(|u| u.limit)
            .min()
            .unwrap_or(U16BIT_MAX);
        if self.const_value.is_some() {
            // A restored constant is re-materialised with a `const` whose destination field is
            // 8 bits.
            self.register_limit = self.register_limit.min(U8BIT_MAX);
        }
    }

    /// Does any range contain `pos`?
    pub fn covers(&self, pos: u32) -> bool {
        self.ranges.iter().any(|r| r.contains(pos))
    }

    pub fn overlaps(&self, other: &LiveIntervals) -> bool {
        self.next_overlap(other).is_some()
    }

    /// The first position at which both `self` and `other` are live.
    pub fn next_overlap(&self, other: &LiveIntervals) -> Option<u32> {
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let (a, b) = (&self.ranges[i], &other.ranges[j]);
            if a.overlaps(b) {
                return Some(a.start.max(b.start));
            }
            if a.end <= b.start {
                i += 1;
            } else {
                j += 1;
            }
        }
        None
    }

    pub fn first_use(&self) -> Option<LiveIntervalsUse> {
        self.uses.iter().next().cloned()
    }

    /// The first use at or after `pos`.
    pub fn first_use_after(&self, pos: u32) -> Option<LiveIntervalsUse> {
        self.uses
            .range(LiveIntervalsUse::new(pos, 0)..)
            .next()
            .cloned()
    }

    /// The first use whose limit is lower than `U16BIT_MAX`.
    pub fn first_constrained_use(&self) -> Option<LiveIntervalsUse> {
        self.uses.iter().find(|u| u.is_constrained()).cloned()
    }
}

impl fmt::Display for LiveIntervals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)?;
        for r in &self.ranges {
            write!(f, " {r}")?;
        }
        if !self.uses.is_empty() {
            let uses = self
                .uses
                .iter()
                .map(|u| format!("{}:{}", u.position, u.limit))
                .collect::<Vec<_>>();
            write!(f, " uses {}", uses.join(" "))?;
        }
        match (self.register, self.spilled) {
            (Some(r), false) => write!(f, " r{r}"),
            (Some(r), true) => write!(f, " r{r} spilled"),
            (None, true) => write!(f, " remat"),
            (None, false) => Ok(()),
        }
    }
}

/// Every interval of one allocation attempt.
#[derive(Clone, Debug, Default)]
pub struct IntervalArena {
    intervals: IndexVec<IntervalIdx, LiveIntervals>,
    by_value: IndexVec<ValueIdx, IntervalIdx>,
}

impl IntervalArena {
    /// Create an arena with one empty split parent per value. `values` must be in [ValueIdx]
    /// order.
    pub fn new(values: impl Iterator<Item = (ValueIdx, Ty)>) -> Self {
        let mut arena = Self::default();
        for (vidx, ty) in values {
            debug_assert_eq!(vidx, arena.by_value.len_idx());
            let iidx = arena.push(LiveIntervals::new(vidx, ty));
            arena.by_value.push(iidx);
        }
        arena
    }

    fn push(&mut self, mut iv: LiveIntervals) -> IntervalIdx {
        let idx = self.intervals.len_idx();
        iv.split_parent = idx;
        self.intervals.push(iv)
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// The split parent of `vidx`.
    pub fn for_value(&self, vidx: ValueIdx) -> IntervalIdx {
        self.by_value[vidx]
    }

    /// Iterate over every split parent, in value order.
    pub fn parents(&self) -> impl Iterator<Item = IntervalIdx> + '_ {
        self.by_value.iter().cloned()
    }

    /// `iidx`'s split parent followed by all of its split children, in position order.
    pub fn sorted_splits(&self, iidx: IntervalIdx) -> Vec<IntervalIdx> {
        let parent = self.intervals[iidx].split_parent;
        let mut splits = vec![parent];
        splits.extend(self.intervals[parent].split_children.iter().cloned());
        splits
    }

    /// Iterate over every interval reachable from a value, in value then position order.
    pub fn all_splits(&self) -> impl Iterator<Item = IntervalIdx> + '_ {
        self.parents().flat_map(move |p| self.sorted_splits(p))
    }

    /// Split `iidx` at the gap at or before `pos`, returning the new child. If that gap is the
    /// start of `iidx`, nothing is split: `iidx` is returned with its register cleared.
    pub fn split_before(&mut self, iidx: IntervalIdx, pos: u32) -> IntervalIdx {
        let pos = to_gap_position(pos);
        let iv = &mut self.intervals[iidx];
        if pos <= iv.start() {
            iv.register = None;
            return iidx;
        }
        debug_assert!(pos < iv.end());

        let mut child_ranges = Vec::new();
        let mut i = 0;
        while i < iv.ranges.len() {
            let r = iv.ranges[i];
            if r.start >= pos {
                child_ranges.extend(iv.ranges.drain(i..));
                break;
            } else if r.end > pos {
                iv.ranges[i].end = pos;
                child_ranges.push(LiveRange::new(pos, r.end));
                child_ranges.extend(iv.ranges.drain(i + 1..));
                break;
            }
            i += 1;
        }
        let child_uses = iv.uses.split_off(&LiveIntervalsUse::new(pos, 0));
        iv.recompute_limit();

        let mut child = LiveIntervals::new(iv.value, iv.ty);
        child.ranges = child_ranges;
        child.uses = child_uses;
        child.is_argument = iv.is_argument;
        child.is_receiver = iv.is_receiver;
        child.const_value = iv.const_value;
        child.used_in_monitor = iv.used_in_monitor;
        child.recompute_limit();
        let parent = iv.split_parent;
        let cidx = self.push(child);
        self.intervals[cidx].split_parent = parent;

        let start = self.intervals[cidx].start();
        let ivs = &self.intervals;
        let at = self.intervals[parent]
            .split_children
            .iter()
            .position(|x| ivs[*x].start() > start)
            .unwrap_or(self.intervals[parent].split_children.len());
        self.intervals[parent].split_children.insert(at, cidx);
        cidx
    }

    /// The split of `iidx`'s value live at `pos`. A split whose last range ends at `pos` is only
    /// returned if no split contains `pos`: that happens when `pos` is the split's final use.
    pub fn split_covering(&self, iidx: IntervalIdx, pos: u32) -> Option<IntervalIdx> {
        let splits = self.sorted_splits(iidx);
        splits
            .iter()
            .find(|x| {
                let iv = &self.intervals[**x];
                iv.start() <= pos && pos < iv.end()
            })
            .or_else(|| splits.iter().find(|x| self.intervals[**x].end() == pos))
            .cloned()
    }

    /// The split of `iidx`'s value which has a range containing `pos`. Unlike
    /// [Self::split_covering], a split merely ending at `pos` does not count.
    pub fn split_live_at(&self, iidx: IntervalIdx, pos: u32) -> Option<IntervalIdx> {
        self.sorted_splits(iidx)
            .into_iter()
            .find(|x| self.intervals[*x].covers(pos))
    }

    /// Merge all of `parent`'s split children back into it.
    pub fn unsplit(&mut self, parent: IntervalIdx) {
        debug_assert_eq!(self.intervals[parent].split_parent, parent);
        let children = std::mem::take(&mut self.intervals[parent].split_children);
        for c in children {
            let (ranges, uses) = {
                let child = &mut self.intervals[c];
                (
                    std::mem::take(&mut child.ranges),
                    std::mem::take(&mut child.uses),
                )
            };
            let iv = &mut self.intervals[parent];
            for r in ranges {
                match iv.ranges.last_mut() {
                    Some(last) if last.end == r.start => last.end = r.end,
                    _ => iv.ranges.push(r),
                }
            }
            iv.uses.extend(uses);
        }
        self.intervals[parent].recompute_limit();
    }
}

impl Index<IntervalIdx> for IntervalArena {
    type Output = LiveIntervals;

    fn index(&self, idx: IntervalIdx) -> &Self::Output {
        &self.intervals[idx]
    }
}

impl IndexMut<IntervalIdx> for IntervalArena {
    fn index_mut(&mut self, idx: IntervalIdx) -> &mut Self::Output {
        &mut self.intervals[idx]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn arena(ranges: &[(u32, u32)], uses: &[(u32, u32)]) -> (IntervalArena, IntervalIdx) {
        let mut a = IntervalArena::new([(ValueIdx::new(0), Ty::Int)].into_iter());
        let iidx = a.for_value(ValueIdx::new(0));
        for (s, e) in ranges.iter().rev() {
            a[iidx].add_range(LiveRange::new(*s, *e));
        }
        for (p, l) in uses {
            a[iidx].add_use(LiveIntervalsUse::new(*p, *l));
        }
        (a, iidx)
    }

    fn all_ranges(a: &IntervalArena, iidx: IntervalIdx) -> Vec<LiveRange> {
        a.sorted_splits(iidx)
            .into_iter()
            .flat_map(|x| a[x].ranges().to_vec())
            .collect()
    }

    #[test]
    fn gap_positions() {
        assert_eq!(to_gap_position(4), 3);
        assert_eq!(to_gap_position(3), 3);
        assert_eq!(to_gap_position(0), 0);
    }

    #[test]
    fn add_range_merges() {
        let (a, iidx) = arena(&[(0, 4), (4, 10), (14, 20)], &[]);
        assert_eq!(
            a[iidx].ranges(),
            &[LiveRange::new(0, 10), LiveRange::new(14, 20)]
        );
        assert!(a[iidx].covers(9));
        assert!(!a[iidx].covers(10));
        assert_eq!((a[iidx].start(), a[iidx].end()), (0, 20));
    }

    #[test]
    fn split_roundtrip() {
        let (mut a, iidx) = arena(
            &[(0, 10), (14, 20), (24, 40)],
            &[(0, U16BIT_MAX), (8, 15), (16, U8BIT_MAX), (30, U16BIT_MAX)],
        );
        let before = a[iidx].ranges().to_vec();
        assert_eq!(a[iidx].register_limit(), 15);
        let c1 = a.split_before(iidx, 16);
        let c2 = a.split_before(c1, 26);
        // Splitting in a lifetime hole.
        let c3 = a.split_before(iidx, 12);
        assert_eq!(a[iidx].ranges(), &[LiveRange::new(0, 10)]);
        assert_eq!(a[c3].ranges(), &[LiveRange::new(14, 15)]);
        assert_eq!(a[c1].ranges(), &[LiveRange::new(15, 20), LiveRange::new(24, 25)]);
        assert_eq!(a[c2].ranges(), &[LiveRange::new(25, 40)]);
        assert_eq!(a.sorted_splits(c2), vec![iidx, c3, c1, c2]);
        assert_eq!(all_ranges(&a, iidx).len(), 5);
        assert_eq!(a[iidx].register_limit(), 15);
        assert_eq!(a[c1].register_limit(), U8BIT_MAX);
        assert_eq!(a[c2].register_limit(), U16BIT_MAX);

        a.unsplit(iidx);
        assert_eq!(a[iidx].ranges(), &before[..]);
        assert_eq!(a[iidx].uses().len(), 4);
        assert!(a[iidx].split_children().is_empty());
    }

    #[test]
    fn split_at_start() {
        let (mut a, iidx) = arena(&[(3, 10)], &[(4, U16BIT_MAX)]);
        a[iidx].register = Some(2);
        assert_eq!(a.split_before(iidx, 4), iidx);
        assert_eq!(a[iidx].register, None);
        assert!(a[iidx].split_children().is_empty());
    }

    #[test]
    fn covering() {
        let (mut a, iidx) = arena(&[(0, 8)], &[(0, U16BIT_MAX), (6, 15), (8, 15)]);
        let c = a.split_before(iidx, 6);
        assert_eq!(a.split_covering(iidx, 4), Some(iidx));
        assert_eq!(a.split_covering(iidx, 5), Some(c));
        assert_eq!(a.split_covering(c, 8), Some(c));
        assert_eq!(a.split_covering(iidx, 9), None);
        assert_eq!(a.split_live_at(iidx, 5), Some(c));
        assert_eq!(a.split_live_at(iidx, 8), None);
        assert_eq!(a[c].first_use(), Some(LiveIntervalsUse::new(6, 15)));
        assert_eq!(a[iidx].first_use_after(1), None);
    }

    #[test]
    fn overlaps() {
        let mut a = IntervalArena::new(
            [(ValueIdx::new(0), Ty::Int), (ValueIdx::new(1), Ty::Long)].into_iter(),
        );
        let (i0, i1) = (a.for_value(ValueIdx::new(0)), a.for_value(ValueIdx::new(1)));
        a[i0].add_range(LiveRange::new(10, 20));
        a[i0].add_range(LiveRange::new(0, 6));
        a[i1].add_range(LiveRange::new(4, 12));
        assert_eq!(a[i0].next_overlap(&a[i1]), Some(4));
        assert_eq!(a[i1].next_overlap(&a[i0]), Some(4));
        a[i1].set_start(6);
        assert_eq!(a[i0].next_overlap(&a[i1]), Some(10));
        assert_eq!(a[i1].required_registers(), 2);
        assert_eq!(a[i0].to_string(), "%0 [0, 6) [10, 20)");
    }
}
