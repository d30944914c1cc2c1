//! The scan itself: intervals are visited in order of their start positions and each is given a
//! register, splitting or spilling intervals when the registers it could use are taken.

use super::{workarounds::WORKAROUNDS, AllocError, ArgumentReuseMode};
use crate::{
    config::Config,
    errors::CompilationError,
    ir::{InstKind, Method, ValueDef, ValueIdx, INSTRUCTION_NUMBER_DELTA, U4BIT_MAX, U8BIT_MAX},
    log::Verbosity,
    regalloc::{
        live_intervals::{to_gap_position, IntervalArena, IntervalIdx, LiveIntervals},
        liveness::Liveness,
        register_positions::{RegisterKind, RegisterPositions},
        Restart,
    },
    LOG,
};
use index_vec::IndexVec;
use smallvec::SmallVec;
use std::{cmp::Reverse, collections::BinaryHeap, mem};
use vob::Vob;

/// A constant whose consecutive uses are further apart than this is rematerialised between them
/// rather than kept in a register.
const MAX_CONSTANT_GAP: u32 = 11 * INSTRUCTION_NUMBER_DELTA;

pub(super) struct Scan<'a> {
    pub(super) m: &'a Method,
    pub(super) config: &'a Config,
    pub(super) liveness: &'a Liveness,
    pub(super) mode: ArgumentReuseMode,
    pub(super) arena: IntervalArena,
    /// Registers `[0, num_arg_registers)` hold the incoming arguments.
    pub(super) num_arg_registers: u32,
    pub(super) receiver_register: Option<u32>,
    /// Ordered by start position, with the value and interval index breaking ties so that the
    /// order is deterministic.
    unhandled: BinaryHeap<Reverse<(u32, ValueIdx, IntervalIdx)>>,
    /// Intervals with a register which are live at `position`.
    active: Vec<IntervalIdx>,
    /// Intervals with a register which are in a lifetime hole at `position`.
    inactive: Vec<IntervalIdx>,
    handled: Vec<IntervalIdx>,
    position: u32,
    /// One more than the highest register assigned so far.
    top: u32,
    phi_users: IndexVec<ValueIdx, Vec<ValueIdx>>,
    /// For each value, the range invoke argument moves it is the source of.
    group_moves: IndexVec<ValueIdx, SmallVec<[ValueIdx; 1]>>,
}

impl<'a> Scan<'a> {
    pub(super) fn new(
        m: &'a Method,
        config: &'a Config,
        liveness: &'a Liveness,
        mode: ArgumentReuseMode,
    ) -> Self {
        let mut group_moves = index_vec::index_vec![SmallVec::new(); m.values.len()];
        for b in m.blocks.iter() {
            for iidx in &b.insts {
                let inst = &m.insts[*iidx];
                if let (InstKind::Move, Some(out), Some(src)) =
                    (&inst.kind, inst.out, inst.ins.first())
                {
                    let v = &m.values[out];
                    if v.prev_consecutive.is_some() || v.next_consecutive.is_some() {
                        group_moves[*src].push(out);
                    }
                }
            }
        }

        let mut s = Self {
            m,
            config,
            liveness,
            mode,
            arena: liveness.build_intervals(m),
            num_arg_registers: 0,
            receiver_register: None,
            unhandled: BinaryHeap::new(),
            active: Vec::new(),
            inactive: Vec::new(),
            handled: Vec::new(),
            position: 0,
            top: 0,
            phi_users: m.phi_users(),
            group_moves,
        };
        s.place_arguments();
        for p in s.arena.parents().collect::<Vec<_>>() {
            let iv = &s.arena[p];
            if !iv.ranges().is_empty() && !iv.is_argument {
                s.push_unhandled(p);
            }
        }
        s
    }

    /// Put every argument in its incoming register. Without argument reuse, each argument is
    /// first split around every use which needs a low register: those short pieces are
    /// allocated like any other interval, while the rest stays pinned in the argument's register.
    fn place_arguments(&mut self) {
        let mut reg = 0;
        for v in self.m.args() {
            let p = self.arena.for_value(v);
            let w = self.arena[p].required_registers();
            let mut middles = Vec::new();
            if self.mode == ArgumentReuseMode::DisallowArgumentReuse {
                let mut constrained = self.arena[p]
                    .uses()
                    .iter()
                    .filter(|u| u.is_constrained())
                    .map(|u| u.position)
                    .collect::<Vec<_>>();
                constrained.dedup();
                let mut tail = p;
                for pos in constrained {
                    let mid = self.arena.split_before(tail, pos);
                    middles.push(mid);
                    if pos + 1 >= self.arena[mid].end() {
                        break;
                    }
                    tail = self.arena.split_before(mid, pos + 1);
                }
            }
            for i in self.arena.sorted_splits(p) {
                if middles.contains(&i) {
                    self.push_unhandled(i);
                } else {
                    let iv = &mut self.arena[i];
                    iv.register = Some(reg);
                    iv.pinned = true;
                    self.inactive.push(i);
                }
            }
            if self.arena[p].is_receiver {
                self.receiver_register = Some(reg);
            }
            reg += w;
        }
        self.num_arg_registers = reg;
        self.top = reg;
    }

    fn push_unhandled(&mut self, iidx: IntervalIdx) {
        let iv = &self.arena[iidx];
        self.unhandled.push(Reverse((iv.start(), iv.value, iidx)));
    }

    pub(super) fn run(&mut self) -> Result<(), AllocError> {
        while let Some(Reverse((start, _, cur))) = self.unhandled.pop() {
            let iv = &self.arena[cur];
            if iv.register.is_some() || iv.is_rematerializable() {
                continue;
            }
            self.migrate(start);
            LOG.log(Verbosity::Verbose, &format!("allocating {}", self.arena[cur]));
            if self.arena[cur].is_linked() {
                self.allocate_group(cur)?;
                continue;
            }
            self.place_group_moves(cur)?;
            self.allocate_free(cur)?;
        }
        Ok(())
    }

    /// The intervals, with their registers, and the number of argument registers.
    pub(super) fn finish(self) -> (IntervalArena, u32) {
        (self.arena, self.num_arg_registers)
    }

    /// Move the scan to `pos`, refiling intervals which have ended or entered or left a lifetime
    /// hole.
    fn migrate(&mut self, pos: u32) {
        self.position = pos;
        let active = mem::take(&mut self.active);
        let inactive = mem::take(&mut self.inactive);
        for iidx in active.into_iter().chain(inactive) {
            self.file(iidx);
        }
    }

    /// Put `iidx`, which has a register, into the list matching its state at the current
    /// position.
    fn file(&mut self, iidx: IntervalIdx) {
        let iv = &self.arena[iidx];
        if iv.end() <= self.position {
            self.handled.push(iidx);
        } else if iv.covers(self.position) {
            self.active.push(iidx);
        } else {
            self.inactive.push(iidx);
        }
    }

    fn assign(&mut self, iidx: IntervalIdx, reg: u32) {
        let iv = &mut self.arena[iidx];
        iv.register = Some(reg);
        self.top = self.top.max(reg + iv.required_registers());
        LOG.log(Verbosity::Verbose, &format!("assigned {}", self.arena[iidx]));
        self.file(iidx);
    }

    /// The registers `[lo, hi]` that `iv` may be given, in the allocator's register space.
    pub(super) fn candidate_range(&self, iv: &LiveIntervals) -> (u32, u32) {
        let a = self.num_arg_registers;
        let limit = iv.register_limit();
        match self.mode {
            ArgumentReuseMode::AllowArgumentReuseU4 => (0, U4BIT_MAX),
            // Registers below `a` are the arguments', which end up at the top of the frame.
            ArgumentReuseMode::AllowArgumentReuseU8 if limit < U8BIT_MAX => {
                (a, (limit + a).min(U8BIT_MAX))
            }
            ArgumentReuseMode::AllowArgumentReuseU8 => (0, U8BIT_MAX),
            ArgumentReuseMode::DisallowArgumentReuse => (a, limit.saturating_add(a)),
        }
    }

    /// Can `cur` be put in `reg`?
    fn acceptable(&self, cur: IntervalIdx, reg: u32) -> bool {
        let a = self.num_arg_registers;
        if reg < a && reg + self.arena[cur].required_registers() > a {
            // Half in the argument registers, which are rotated to the end of the frame.
            return false;
        }
        match WORKAROUNDS.iter().find(|(_, rejects)| rejects(self, cur, reg)) {
            Some((name, _)) => {
                LOG.log(
                    Verbosity::Verbose,
                    &format!("r{reg} rejected for {}: {name}", self.arena[cur].value),
                );
                false
            }
            None => true,
        }
    }

    /// The register holding `vidx` at `pos`, if it has been allocated one yet.
    pub(super) fn register_at(&self, vidx: ValueIdx, pos: u32) -> Option<u32> {
        self.arena
            .split_covering(self.arena.for_value(vidx), pos)
            .and_then(|i| self.arena[i].register)
    }

    /// A register which, if `cur` were given it, would make a move unnecessary.
    fn hint(&self, cur: IntervalIdx) -> Option<u32> {
        let iv = &self.arena[cur];
        if iv.hint.is_some() {
            return iv.hint;
        }
        if iv.split_parent() != cur {
            let splits = self.arena.sorted_splits(cur);
            let i = splits.iter().position(|x| *x == cur)?;
            return splits[..i]
                .iter()
                .rev()
                .find_map(|x| self.arena[*x].register);
        }
        let v = iv.value;
        match &self.m.values[v].def {
            ValueDef::Phi { args, .. } => {
                let r = args
                    .iter()
                    .find_map(|(pred, op)| self.register_at(*op, self.m.exit_number(*pred)));
                if r.is_some() {
                    return r;
                }
            }
            ValueDef::Inst(iidx) => {
                let inst = &self.m.insts[*iidx];
                if matches!(
                    inst.kind,
                    InstKind::Move | InstKind::BinOp(_) | InstKind::BinOpLit(..) | InstKind::UnOp(_)
                ) {
                    let r = inst
                        .ins
                        .first()
                        .and_then(|x| self.register_at(*x, inst.number));
                    if r.is_some() {
                        return r;
                    }
                }
            }
        }
        self.phi_users[v]
            .iter()
            .find_map(|phi| self.arena[self.arena.for_value(*phi)].register)
    }

    fn allocate_free(&mut self, cur: IntervalIdx) -> Result<(), AllocError> {
        let iv = &self.arena[cur];
        let (start, end, w) = (iv.start(), iv.end(), iv.required_registers());
        let (lo, hi) = self.candidate_range(iv);
        let hi = hi.min(self.top + w - 1);
        let mut free = RegisterPositions::new((self.top + w) as usize);
        for i in &self.active {
            let x = &self.arena[*i];
            if let Some(r) = x.register {
                occupy(&mut free, r, x, 0);
            }
        }
        for i in &self.inactive {
            let x = &self.arena[*i];
            if let (Some(r), Some(o)) = (x.register, iv.next_overlap(x)) {
                occupy(&mut free, r, x, o);
            }
        }

        let choice = self
            .hint(cur)
            .filter(|h| {
                *h >= lo
                    && *h + w - 1 <= hi
                    && free.get_wide(*h, w) >= end
                    && self.acceptable(cur, *h)
            })
            .or_else(|| free.lowest_free_until(lo, hi, w, end, |r| self.acceptable(cur, r)));
        if let Some(r) = choice {
            self.assign(cur, r);
            return Ok(());
        }

        if self.mode.allows_argument_reuse() {
            return Err(AllocError::Restart(Restart::NeedsSpillOrSplit));
        }
        // No register is free for all of `cur`: use the one free for longest, if that covers
        // `cur`'s first use.
        if let Some(r) = free.largest_candidate(lo, hi, w, RegisterKind::Any, |r| {
            self.acceptable(cur, r)
        }) {
            let until = free.get_wide(r, w);
            let first_use = self.arena[cur].first_use().map(|u| u.position);
            if to_gap_position(until) > start && first_use.map_or(false, |u| u < until) {
                let tail = self.arena.split_before(cur, until);
                self.assign(cur, r);
                self.push_unhandled(tail);
                return Ok(());
            }
        }
        self.allocate_spilled_or_blocked(cur)
    }

    fn allocate_spilled_or_blocked(&mut self, cur: IntervalIdx) -> Result<(), AllocError> {
        let iv = &self.arena[cur];
        let start = iv.start();
        if iv.const_value.is_some() {
            match iv.first_use_after(start + 1) {
                Some(u) if to_gap_position(u.position) > start => {
                    self.spill_constant(cur);
                    return Ok(());
                }
                None => {
                    self.spill_constant(cur);
                    return Ok(());
                }
                Some(_) => (),
            }
        }
        match (iv.first_use(), iv.first_constrained_use()) {
            (Some(u), Some(c)) if !u.is_constrained() => {
                // Nothing before `c` needs a low register.
                let tail = self.arena.split_before(cur, c.position);
                if tail == cur {
                    return self.allocate_blocked(cur);
                }
                self.push_unhandled(tail);
                self.assign_spill_register(cur)
            }
            (_, None) => self.assign_spill_register(cur),
            _ => self.allocate_blocked(cur),
        }
    }

    /// Make the constant interval `cur` rematerialisable up to its first use, and between any two
    /// uses more than [MAX_CONSTANT_GAP] apart. The pieces around uses are queued for
    /// allocation.
    fn spill_constant(&mut self, cur: IntervalIdx) {
        let start = self.arena[cur].start();
        let uses = self.arena[cur]
            .uses()
            .iter()
            .map(|u| u.position)
            .filter(|p| *p > start)
            .collect::<Vec<_>>();
        let iv = &mut self.arena[cur];
        iv.register = None;
        iv.spilled = true;
        LOG.log(Verbosity::Verbose, &format!("rematerialising {iv}"));
        let (Some(first), Some(last)) = (uses.first(), uses.last()) else {
            return;
        };
        let mut piece = self.arena.split_before(cur, *first);
        debug_assert_ne!(piece, cur);
        for pair in uses.windows(2) {
            if pair[1] - pair[0] > MAX_CONSTANT_GAP {
                let between = self.arena.split_before(piece, pair[0] + 1);
                let next = self.arena.split_before(between, pair[1]);
                self.arena[between].spilled = true;
                self.push_unhandled(piece);
                piece = next;
            }
        }
        if *last + 1 < self.arena[piece].end() {
            let rest = self.arena.split_before(piece, *last + 1);
            self.arena[rest].spilled = true;
        }
        self.push_unhandled(piece);
    }

    /// Give `cur`, which has no uses needing a low register, the lowest register not used by
    /// anything it overlaps. A constant is still restored with an 8-bit `const`: if nothing under
    /// its limit is free, a use-free piece is rematerialised and any other piece takes a register
    /// from its occupants.
    fn assign_spill_register(&mut self, cur: IntervalIdx) -> Result<(), AllocError> {
        let iv = &self.arena[cur];
        let w = iv.required_registers();
        let (_, hi) = self.candidate_range(iv);
        let mut taken = Vob::from_elem(false, self.top as usize);
        for i in self
            .active
            .iter()
            .chain(self.inactive.iter())
            .chain(self.handled.iter())
        {
            let x = &self.arena[*i];
            if x.end() <= iv.start() {
                continue;
            }
            if let Some(r) = x.register {
                if x.overlaps(iv) {
                    for k in r..r + x.required_registers() {
                        taken.set(k as usize, true);
                    }
                }
            }
        }
        let reg = (self.num_arg_registers..(hi + 2).saturating_sub(w)).find(|r| {
            (*r..*r + w).all(|k| !taken.get(k as usize).unwrap_or(false))
                && self.acceptable(cur, *r)
        });
        match reg {
            Some(r) => {
                self.arena[cur].spilled = true;
                self.assign(cur, r);
                Ok(())
            }
            None if iv.const_value.is_some() && iv.first_use().is_none() => {
                let iv = &mut self.arena[cur];
                iv.spilled = true;
                LOG.log(Verbosity::Verbose, &format!("rematerialising {iv}"));
                Ok(())
            }
            None => self.allocate_blocked(cur),
        }
    }

    /// Every candidate register is occupied at `cur`'s first use. Take the register whose
    /// occupants are next used furthest away, evicting them.
    fn allocate_blocked(&mut self, cur: IntervalIdx) -> Result<(), AllocError> {
        let iv = &self.arena[cur];
        let (start, end, w) = (iv.start(), iv.end(), iv.required_registers());
        let Some(first_use) = iv.first_use().map(|u| u.position) else {
            return Err(AllocError::Fatal(CompilationError::InternalError(format!(
                "{iv} has no uses but cannot be spilled"
            ))));
        };
        let (lo, hi) = self.candidate_range(iv);
        let hi = hi.min(self.top + w - 1);
        let size = (self.top + w) as usize;
        let mut use_pos = RegisterPositions::new(size);
        let mut block_pos = RegisterPositions::new(size);
        for i in &self.active {
            let x = &self.arena[*i];
            let Some(r) = x.register else { continue };
            if x.pinned {
                // Pinned intervals are never evicted.
                for k in r..r + x.required_registers() {
                    use_pos.block(k);
                }
                occupy(&mut block_pos, r, x, 0);
            } else {
                let next = x.first_use_after(start).map_or(u32::MAX, |u| u.position);
                occupy(&mut use_pos, r, x, next);
            }
        }
        for i in &self.inactive {
            let x = &self.arena[*i];
            let (Some(r), Some(o)) = (x.register, iv.next_overlap(x)) else {
                continue;
            };
            if x.pinned {
                occupy(&mut use_pos, r, x, o);
                occupy(&mut block_pos, r, x, o);
            } else {
                let next = x.first_use_after(start).map_or(u32::MAX, |u| u.position);
                occupy(&mut use_pos, r, x, next);
            }
        }

        let accept = |r: u32| {
            use_pos.get_wide(r, w) > first_use
                && block_pos.get_wide(r, w) > first_use
                && self.acceptable(cur, r)
        };
        let choice = [
            RegisterKind::ConstNumber,
            RegisterKind::Other,
            RegisterKind::Monitor,
        ]
        .into_iter()
        .find_map(|kind| use_pos.largest_candidate(lo, hi, w, kind, accept));
        let Some(reg) = choice else {
            // Everything is needed before `cur` is: `cur` waits in a spill register until then.
            let tail = self.arena.split_before(cur, first_use);
            if tail == cur {
                return Err(AllocError::Fatal(CompilationError::InternalError(format!(
                    "No register available for {}",
                    self.arena[cur]
                ))));
            }
            self.push_unhandled(tail);
            return self.assign_spill_register(cur);
        };

        let blocked_at = block_pos.get_wide(reg, w);
        if blocked_at < end {
            let tail = self.arena.split_before(cur, blocked_at);
            self.push_unhandled(tail);
        }
        self.assign(cur, reg);
        self.evict(cur, reg, w)
    }

    /// Take the registers `[reg, reg + w)` from everything other than `cur` which overlaps `cur`.
    fn evict(&mut self, cur: IntervalIdx, reg: u32, w: u32) -> Result<(), AllocError> {
        let start = self.arena[cur].start();
        let clashes = |x: &LiveIntervals| {
            x.register
                .map_or(false, |r| r < reg + w && reg < r + x.required_registers())
        };
        let victims = self
            .active
            .iter()
            .filter(|i| **i != cur && clashes(&self.arena[**i]))
            .cloned()
            .collect::<Vec<_>>();
        for a in victims {
            self.active.retain(|x| *x != a);
            LOG.log(
                Verbosity::Verbose,
                &format!("evicting {} from r{reg}", self.arena[a]),
            );
            let child = self.arena.split_before(a, start);
            if child != a {
                self.handled.push(a);
            }
            self.spill_evicted(child)?;
        }

        let victims = self
            .inactive
            .iter()
            .filter(|i| **i != cur && clashes(&self.arena[**i]))
            .cloned()
            .collect::<Vec<_>>();
        for x in victims {
            let Some(o) = self.arena[cur].next_overlap(&self.arena[x]) else {
                continue;
            };
            let child = self.arena.split_before(x, o);
            if child == x {
                self.inactive.retain(|y| *y != x);
            }
            self.push_unhandled(child);
        }
        Ok(())
    }

    /// `child` has just lost its register. Until its next use it waits in a spill register or,
    /// if it is a constant, is rematerialised.
    fn spill_evicted(&mut self, child: IntervalIdx) -> Result<(), AllocError> {
        let iv = &self.arena[child];
        let start = iv.start();
        match iv.first_use().map(|u| u.position) {
            Some(u) if to_gap_position(u) > start => {
                if iv.const_value.is_some() {
                    self.spill_constant(child);
                } else {
                    let tail = self.arena.split_before(child, u);
                    self.push_unhandled(tail);
                    return self.assign_spill_register(child);
                }
            }
            Some(_) => self.push_unhandled(child),
            None if iv.const_value.is_some() => self.spill_constant(child),
            None => return self.assign_spill_register(child),
        }
        Ok(())
    }

    /// If `cur`'s value is copied into a range invoke's consecutive registers, place that group
    /// now and hint `cur` into the register its copy goes to.
    fn place_group_moves(&mut self, cur: IntervalIdx) -> Result<(), AllocError> {
        let v = self.arena[cur].value;
        for i in 0..self.group_moves[v].len() {
            let member = self.arena.for_value(self.group_moves[v][i]);
            if self.arena[member].register.is_none() {
                self.allocate_group(member)?;
            }
        }
        if self.arena[cur].hint.is_none() {
            if let Some(first) = self.group_moves[v].first() {
                self.arena[cur].hint = self.arena[self.arena.for_value(*first)].register;
            }
        }
        Ok(())
    }

    /// Place every member of the consecutive-register group `any` is in, at the lowest base
    /// register where the whole group fits.
    fn allocate_group(&mut self, any: IntervalIdx) -> Result<(), AllocError> {
        let mut head = any;
        while let Some(p) = self.arena[head].prev_consecutive {
            head = p;
        }
        let mut members = Vec::new();
        let mut next = Some(head);
        while let Some(i) = next {
            members.push(i);
            next = self.arena[i].next_consecutive;
        }

        let mut taken = Vob::from_elem(false, self.top as usize);
        for i in self.active.iter().chain(self.inactive.iter()) {
            let x = &self.arena[*i];
            let Some(r) = x.register else { continue };
            if members.iter().any(|m| self.arena[*m].overlaps(x)) {
                for k in r..r + x.required_registers() {
                    taken.set(k as usize, true);
                }
            }
        }

        // The highest base at which every member is within its limit.
        let mut max_base = i64::MAX;
        let mut total = 0;
        for m in &members {
            let iv = &self.arena[*m];
            let (_, hi) = self.candidate_range(iv);
            total += iv.required_registers();
            max_base = max_base.min(i64::from(hi) + 1 - i64::from(total));
        }
        let mut base = self.num_arg_registers;
        while (base..base + total).any(|k| taken.get(k as usize).unwrap_or(false)) {
            base += 1;
        }
        if i64::from(base) > max_base {
            if self.mode.allows_argument_reuse() {
                return Err(AllocError::Restart(Restart::RegisterCeiling));
            }
            return Err(AllocError::Fatal(CompilationError::LimitExceeded(format!(
                "No room for a range of {total} consecutive registers"
            ))));
        }

        let mut reg = base;
        for m in members {
            let iv = &mut self.arena[m];
            iv.register = Some(reg);
            iv.pinned = true;
            reg += iv.required_registers();
            LOG.log(Verbosity::Verbose, &format!("assigned {} in group", self.arena[m]));
            self.inactive.push(m);
        }
        self.top = self.top.max(reg);
        let pos = self.position;
        self.migrate(pos);
        Ok(())
    }
}

/// Record in `p` that `iv` occupies the registers starting at `reg` from `pos`.
fn occupy(p: &mut RegisterPositions, reg: u32, iv: &LiveIntervals, pos: u32) {
    let kind = if iv.const_value.is_some() {
        RegisterKind::ConstNumber
    } else if iv.used_in_monitor {
        RegisterKind::Monitor
    } else {
        RegisterKind::Other
    };
    for r in reg..reg + iv.required_registers() {
        p.set(r, pos, kind);
    }
}
