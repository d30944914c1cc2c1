//! Per-register positions used while choosing a register for one interval.
//!
//! For free register allocation the position is how long a register stays free; for blocked
//! register allocation it is when a register's current occupants are next used. Either way, the
//! best candidate is the one with the largest position.

use vob::Vob;

/// What kind of values occupy a register. Blocked allocation prefers to evict constants (which
/// can be re-materialised cheaply) over other values, and other values over objects used by
/// monitor instructions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterKind {
    ConstNumber,
    Other,
    Monitor,
    Any,
}

pub struct RegisterPositions {
    positions: Vec<u32>,
    const_occupied: Vob,
    other_occupied: Vob,
    monitor_occupied: Vob,
    /// Registers that must not be chosen at all.
    blocked: Vob,
}

impl RegisterPositions {
    /// Create positions for registers `0..num_registers`, all initially free forever.
    pub fn new(num_registers: usize) -> Self {
        Self {
            positions: vec![u32::MAX; num_registers],
            const_occupied: Vob::from_elem(false, num_registers),
            other_occupied: Vob::from_elem(false, num_registers),
            monitor_occupied: Vob::from_elem(false, num_registers),
            blocked: Vob::from_elem(false, num_registers),
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// The position of `reg`. Registers beyond the tracked range are free forever.
    pub fn get(&self, reg: u32) -> u32 {
        self.positions
            .get(reg as usize)
            .cloned()
            .unwrap_or(u32::MAX)
    }

    /// The smallest position of the `width` registers starting at `reg`.
    pub fn get_wide(&self, reg: u32, width: u32) -> u32 {
        (reg..reg + width).map(|r| self.get(r)).min().unwrap_or(u32::MAX)
    }

    /// Lower the position of `reg` to `pos` (if `pos` is smaller), recording that it is occupied by
    /// a value of `kind`.
    pub fn set(&mut self, reg: u32, pos: u32, kind: RegisterKind) {
        let r = reg as usize;
        if r >= self.positions.len() {
            return;
        }
        self.positions[r] = self.positions[r].min(pos);
        match kind {
            RegisterKind::ConstNumber => {
                self.const_occupied.set(r, true);
            }
            RegisterKind::Monitor => {
                self.monitor_occupied.set(r, true);
            }
            RegisterKind::Other | RegisterKind::Any => {
                self.other_occupied.set(r, true);
            }
        }
    }

    pub fn block(&mut self, reg: u32) {
        if (reg as usize) < self.blocked.len() {
            self.blocked.set(reg as usize, true);
        }
    }

    pub fn is_blocked(&self, reg: u32) -> bool {
        self.blocked.get(reg as usize).unwrap_or(false)
    }

    /// The kind of the values occupying the `width` registers starting at `reg`: a register run
    /// is only [RegisterKind::ConstNumber] if every occupant is a constant.
    pub fn kind(&self, reg: u32, width: u32) -> RegisterKind {
        let mut kind = RegisterKind::ConstNumber;
        for r in (reg..reg + width).map(|x| x as usize) {
            if self.monitor_occupied.get(r).unwrap_or(false) {
                return RegisterKind::Monitor;
            }
            if self.other_occupied.get(r).unwrap_or(false)
                || !self.const_occupied.get(r).unwrap_or(false)
            {
                kind = RegisterKind::Other;
            }
        }
        kind
    }

    /// Return the unblocked register `r` (with `lo <= r` and `r + width - 1 <= hi`) of `kind`
    /// whose position is largest. Ties go to the lowest register. `accept` can reject further
    /// candidates.
    pub fn largest_candidate(
        &self,
        lo: u32,
        hi: u32,
        width: u32,
        kind: RegisterKind,
        accept: impl Fn(u32) -> bool,
    ) -> Option<u32> {
        let mut best: Option<(u32, u32)> = None;
        if hi + 1 < lo + width {
            return None;
        }
        for r in lo..=hi + 1 - width {
            if (r..r + width).any(|x| self.is_blocked(x)) {
                continue;
            }
            if kind != RegisterKind::Any && self.kind(r, width) != kind {
                continue;
            }
            let pos = self.get_wide(r, width);
            if best.map(|(_, best_pos)| pos > best_pos).unwrap_or(true) && accept(r) {
                best = Some((r, pos));
            }
        }
        best.map(|(r, _)| r)
    }

    /// Return the lowest unblocked register `r` (with `lo <= r` and `r + width - 1 <= hi`) whose
    /// position is at least `until`.
    pub fn lowest_free_until(
        &self,
        lo: u32,
        hi: u32,
        width: u32,
        until: u32,
        accept: impl Fn(u32) -> bool,
    ) -> Option<u32> {
        if hi + 1 < lo + width {
            return None;
        }
        (lo..=hi + 1 - width).find(|r| {
            !(*r..*r + width).any(|x| self.is_blocked(x))
                && self.get_wide(*r, width) >= until
                && accept(*r)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn largest() {
        let mut p = RegisterPositions::new(6);
        p.set(0, 0, RegisterKind::Other);
        p.set(1, 10, RegisterKind::ConstNumber);
        p.set(2, 10, RegisterKind::Other);
        p.set(3, 12, RegisterKind::Other);
        p.set(3, 20, RegisterKind::Other);
        p.set(4, 8, RegisterKind::Monitor);
        p.set(5, 8, RegisterKind::ConstNumber);
        assert_eq!(p.get(3), 12);
        assert_eq!(p.get(17), u32::MAX);
        assert_eq!(p.largest_candidate(0, 5, 1, RegisterKind::Any, |_| true), Some(3));
        assert_eq!(
            p.largest_candidate(0, 5, 1, RegisterKind::ConstNumber, |_| true),
            Some(1)
        );
        assert_eq!(p.largest_candidate(0, 2, 1, RegisterKind::Any, |_| true), Some(1));
        assert_eq!(p.largest_candidate(0, 5, 1, RegisterKind::Any, |r| r != 3), Some(1));
        p.block(1);
        assert_eq!(p.largest_candidate(0, 2, 1, RegisterKind::Any, |_| true), Some(2));
        assert_eq!(p.largest_candidate(4, 5, 1, RegisterKind::Monitor, |_| true), Some(4));
    }

    #[test]
    fn wide() {
        let mut p = RegisterPositions::new(5);
        p.set(0, 4, RegisterKind::Other);
        p.set(2, 6, RegisterKind::ConstNumber);
        p.set(3, 6, RegisterKind::ConstNumber);
        assert_eq!(p.get_wide(1, 2), 6);
        assert_eq!(p.kind(2, 2), RegisterKind::ConstNumber);
        assert_eq!(p.kind(1, 2), RegisterKind::Other);
        assert_eq!(p.largest_candidate(0, 4, 2, RegisterKind::Any, |_| true), Some(1));
        assert_eq!(p.largest_candidate(0, 0, 2, RegisterKind::Any, |_| true), None);
        p.block(4);
        assert_eq!(p.largest_candidate(3, 4, 2, RegisterKind::Any, |_| true), None);
    }

    #[test]
    fn lowest_free() {
        let mut p = RegisterPositions::new(4);
        p.set(0, 3, RegisterKind::Other);
        p.set(1, 9, RegisterKind::Other);
        p.set(2, 20, RegisterKind::Other);
        assert_eq!(p.lowest_free_until(0, 3, 1, 8, |_| true), Some(1));
        assert_eq!(p.lowest_free_until(0, 3, 1, 10, |_| true), Some(2));
        assert_eq!(p.lowest_free_until(0, 3, 2, 10, |_| true), Some(2));
        assert_eq!(p.lowest_free_until(0, 3, 1, 10, |r| r != 2), Some(3));
        assert_eq!(p.lowest_free_until(0, 1, 1, 10, |_| true), None);
    }
}
