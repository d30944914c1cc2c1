//! A linear scan register allocator.
//!
//! Registers are allocated in the allocator's own register space, in which the incoming
//! arguments occupy registers `[0, A)`. Each attempt runs in an [ArgumentReuseMode], from the
//! most optimistic to the most general: an attempt that cannot succeed in its mode is abandoned
//! and everything is rebuilt from liveness in the next mode. Once an attempt has succeeded,
//! moves are inserted and the allocator's registers are mapped onto the method's final
//! registers, which put the arguments at the top of the frame and leave no unused registers.

#[cfg(test)]
mod check;
mod resolution;
mod scan;
mod workarounds;

use super::{
    debug_info::DebugInfo, live_intervals::IntervalArena, liveness::Liveness,
    spill_moves::InsertedMoves, AllocatedMethod, RegisterAllocator, Restart,
};
use crate::{
    config::Config,
    errors::CompilationError,
    ir::{Inst, InstKind, Method, Value, ValueDef, ValueIdx, U16BIT_MAX, U4BIT_MAX, U8BIT_MAX},
    log::{log_ir, should_log_ir, IRPhase, Verbosity},
    LOG, STATS,
};
use scan::Scan;
use smallvec::{smallvec, SmallVec};
use std::time::Instant;
use strum::Display;
use vob::Vob;

/// How incoming arguments are treated by an allocation attempt.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
pub enum ArgumentReuseMode {
    /// Arguments stay in their incoming registers for the whole method, nothing may be split or
    /// spilled, and the method must fit in 16 registers.
    AllowArgumentReuseU4,
    /// As [Self::AllowArgumentReuseU4], but the method may use up to 256 registers.
    AllowArgumentReuseU8,
    /// Arguments are split around the uses which need a low register and anything may be split
    /// or spilled. This mode cannot fail for want of registers.
    DisallowArgumentReuse,
}

impl ArgumentReuseMode {
    fn initial(config: &Config, num_arg_registers: u32) -> Self {
        if !config.allow_argument_reuse {
            Self::DisallowArgumentReuse
        } else if num_arg_registers <= U4BIT_MAX + 1 {
            Self::AllowArgumentReuseU4
        } else if num_arg_registers <= U8BIT_MAX + 1 {
            Self::AllowArgumentReuseU8
        } else {
            Self::DisallowArgumentReuse
        }
    }

    fn next(self) -> Option<Self> {
        match self {
            Self::AllowArgumentReuseU4 => Some(Self::AllowArgumentReuseU8),
            Self::AllowArgumentReuseU8 => Some(Self::DisallowArgumentReuse),
            Self::DisallowArgumentReuse => None,
        }
    }

    pub fn allows_argument_reuse(self) -> bool {
        !matches!(self, Self::DisallowArgumentReuse)
    }

    /// The most registers an attempt in this mode may use.
    fn ceiling(self) -> Option<u32> {
        match self {
            Self::AllowArgumentReuseU4 => Some(U4BIT_MAX + 1),
            Self::AllowArgumentReuseU8 => Some(U8BIT_MAX + 1),
            Self::DisallowArgumentReuse => None,
        }
    }
}

/// Why an allocation attempt failed.
#[derive(Debug)]
enum AllocError {
    /// The attempt's mode was too optimistic: try again in the next mode.
    Restart(Restart),
    Fatal(CompilationError),
}

impl From<CompilationError> for AllocError {
    fn from(e: CompilationError) -> Self {
        AllocError::Fatal(e)
    }
}

/// Maps the allocator's registers onto the method's final registers.
///
/// The VM passes arguments in the last `A` registers of the frame, so the allocator's register
/// space is rotated: registers `[0, A)` move to the top and everything else down by `A`.
/// Registers which nothing uses are then squeezed out.
#[derive(Clone, Debug)]
struct RegisterMap {
    num_arg_registers: u32,
    /// Registers in the allocator's space, including temporaries.
    num_allocated: u32,
    /// For each rotated register, how many registers at or below it are unused.
    unused: Vec<u32>,
    num_registers: u32,
}

impl RegisterMap {
    fn new(
        arena: &IntervalArena,
        num_arg_registers: u32,
        num_allocated: u32,
        temporaries: u32,
    ) -> Self {
        let ns = num_allocated + temporaries;
        let mut used = Vob::from_elem(false, ns as usize);
        let mut mark = |r: u32| {
            used.set(rotate(r, num_arg_registers, ns) as usize, true);
        };
        for r in 0..num_arg_registers {
            mark(r);
        }
        for r in num_allocated..ns {
            mark(r);
        }
        for i in arena.all_splits() {
            let iv = &arena[i];
            if let Some(r) = iv.register {
                for k in r..r + iv.required_registers() {
                    mark(k);
                }
            }
        }

        let mut unused = Vec::with_capacity(ns as usize);
        let mut n = 0;
        for u in used.iter() {
            if !u {
                n += 1;
            }
            unused.push(n);
        }
        Self {
            num_arg_registers,
            num_allocated: ns,
            unused,
            num_registers: ns - n,
        }
    }

    fn final_register(&self, reg: u32) -> u32 {
        let r = rotate(reg, self.num_arg_registers, self.num_allocated);
        r - self.unused.get(r as usize).copied().unwrap_or(0)
    }
}

fn rotate(reg: u32, num_arg_registers: u32, ns: u32) -> u32 {
    if reg < num_arg_registers {
        ns - num_arg_registers + reg
    } else {
        reg - num_arg_registers
    }
}

/// A successful attempt.
struct Allocation {
    arena: IntervalArena,
    map: RegisterMap,
    mode: ArgumentReuseMode,
    moves: InsertedMoves,
    num_arg_registers: u32,
    arguments_unsplit: u64,
}

pub struct LinearScanRegisterAllocator<'a> {
    m: &'a mut Method,
    config: Config,
    allocation: Option<Allocation>,
    restarts: u32,
}

impl<'a> LinearScanRegisterAllocator<'a> {
    pub fn new(m: &'a mut Method, config: Config) -> Self {
        Self {
            m,
            config,
            allocation: None,
            restarts: 0,
        }
    }

    /// The mode of the successful attempt, if registers have been allocated.
    pub fn mode(&self) -> Option<ArgumentReuseMode> {
        self.allocation.as_ref().map(|a| a.mode)
    }

    /// How many times allocation had to start again in a more general mode.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn inserted_moves(&self) -> Option<InsertedMoves> {
        self.allocation.as_ref().map(|a| a.moves)
    }

    /// Where each source-level local lives. Only available when allocating in debug mode.
    pub fn debug_info(&self) -> Option<DebugInfo> {
        let a = self.allocation.as_ref()?;
        if !self.config.debug {
            return None;
        }
        Some(DebugInfo::compute(&*self.m, &a.arena, &|r| {
            a.map.final_register(r)
        }))
    }

    pub fn allocated(&self) -> AllocatedMethod<'_, Self> {
        AllocatedMethod::new(self)
    }

    fn allocate(&mut self) -> Result<(), CompilationError> {
        if self.allocation.is_some() {
            return Err(CompilationError::General(
                "Registers have already been allocated".to_owned(),
            ));
        }
        self.m.assert_well_formed()?;
        prepare_range_invokes(self.m);
        self.m.number_instructions();
        if should_log_ir(IRPhase::PreAlloc) {
            log_ir(&format!(
                "--- Begin pre-alloc ---\n{}--- End pre-alloc ---\n",
                self.m
            ));
        }

        let liveness = Liveness::compute(self.m, &self.config)?;
        let num_arg_registers = self.m.registers_for(&self.m.args());
        let mut mode = ArgumentReuseMode::initial(&self.config, num_arg_registers);
        let a = loop {
            LOG.log(Verbosity::AllocEvent, &format!("Allocating in {mode} mode"));
            match self.attempt(&liveness, mode) {
                Ok(a) => break a,
                Err(AllocError::Restart(why)) => {
                    self.m.remove_inserted_insts();
                    let Some(next) = mode.next() else {
                        return Err(CompilationError::InternalError(format!(
                            "Asked to restart in {mode} mode: {why}"
                        )));
                    };
                    LOG.log(
                        Verbosity::AllocEvent,
                        &format!("Restarting ({why} in {mode} mode)"),
                    );
                    STATS.restart();
                    self.restarts += 1;
                    mode = next;
                }
                Err(AllocError::Fatal(e)) => return Err(e),
            }
        };

        self.finalize(&a);
        STATS.moves_inserted(
            a.moves.spill_moves,
            a.moves.rematerializations,
            u64::from(a.moves.temporaries),
        );
        STATS.arguments_unsplit(a.arguments_unsplit);
        STATS.registers(u64::from(a.map.num_registers));
        self.allocation = Some(a);
        if should_log_ir(IRPhase::PostAlloc) {
            log_ir(&format!(
                "--- Begin post-alloc ---\n{}--- End post-alloc ---\n",
                self.allocated()
            ));
        }
        Ok(())
    }

    fn attempt(
        &mut self,
        liveness: &Liveness,
        mode: ArgumentReuseMode,
    ) -> Result<Allocation, AllocError> {
        let (arena, num_arg_registers) = {
            let mut scan = Scan::new(&*self.m, &self.config, liveness, mode);
            scan.run()?;
            scan.finish()
        };
        if should_log_ir(IRPhase::Intervals) {
            let ivs = arena
                .all_splits()
                .map(|i| format!("{}\n", arena[i]))
                .collect::<String>();
            log_ir(&format!(
                "--- Begin intervals ({mode}) ---\n{ivs}--- End intervals ---\n"
            ));
        }

        let (map, moves) = insert_moves(self.m, &arena, liveness, num_arg_registers)?;
        check_limits(&arena, &map, mode)?;
        let mut a = Allocation {
            arena,
            map,
            mode,
            moves,
            num_arg_registers,
            arguments_unsplit: 0,
        };
        if mode == ArgumentReuseMode::DisallowArgumentReuse {
            self.unsplit_arguments(&mut a, liveness)?;
        }
        Ok(a)
    }

    /// Arguments which, once registers are final, turn out to be in a register low enough for
    /// all of their uses did not need splitting. Merge them back together and redo move
    /// insertion, keeping the result if it is no worse.
    fn unsplit_arguments(
        &mut self,
        a: &mut Allocation,
        liveness: &Liveness,
    ) -> Result<(), AllocError> {
        let mut candidates = Vec::new();
        let mut reg = 0;
        for v in self.m.args() {
            let p = a.arena.for_value(v);
            let w = a.arena[p].required_registers();
            if !a.arena[p].split_children().is_empty() {
                let limit = a
                    .arena
                    .sorted_splits(p)
                    .into_iter()
                    .map(|i| a.arena[i].register_limit())
                    .min()
                    .unwrap_or(U16BIT_MAX);
                if a.map.final_register(reg) + w - 1 <= limit {
                    candidates.push(p);
                }
            }
            reg += w;
        }
        if candidates.is_empty() {
            return Ok(());
        }

        let mut arena = a.arena.clone();
        for p in &candidates {
            arena.unsplit(*p);
        }
        self.m.remove_inserted_insts();
        let (map, moves) = insert_moves(self.m, &arena, liveness, a.num_arg_registers)?;
        if map.num_registers <= a.map.num_registers && check_limits(&arena, &map, a.mode).is_ok()
        {
            LOG.log(
                Verbosity::AllocEvent,
                &format!("Unsplit {} arguments", candidates.len()),
            );
            a.arena = arena;
            a.map = map;
            a.moves = moves;
            a.arguments_unsplit = candidates.len() as u64;
            return Ok(());
        }

        self.m.remove_inserted_insts();
        let (map, moves) = insert_moves(self.m, &a.arena, liveness, a.num_arg_registers)?;
        a.map = map;
        a.moves = moves;
        Ok(())
    }

    /// Rewrite inserted instructions to final registers and remove instructions made redundant
    /// by allocation.
    fn finalize(&mut self, a: &Allocation) {
        let insts = self
            .m
            .blocks
            .iter()
            .flat_map(|b| b.insts.iter().cloned())
            .collect::<Vec<_>>();
        let mut dead = Vec::new();
        for iidx in insts {
            let inst = &mut self.m.insts[iidx];
            match &mut inst.kind {
                InstKind::SpillMove { dst, src, .. } => {
                    *dst = a.map.final_register(*dst);
                    *src = a.map.final_register(*src);
                }
                InstKind::Remat { dst, .. } => *dst = a.map.final_register(*dst),
                InstKind::Const(_) => {
                    // Every use of a rematerialised constant gets its own copy.
                    if let Some(out) = inst.out {
                        if a.arena[a.arena.for_value(out)].is_rematerializable() {
                            dead.push(iidx);
                        }
                    }
                }
                InstKind::Move => {
                    let reg = |v| {
                        a.arena
                            .split_covering(a.arena.for_value(v), inst.number)
                            .and_then(|i| a.arena[i].register)
                    };
                    if let (Some(out), Some(src)) = (inst.out, inst.ins.first()) {
                        let r = reg(out);
                        if r.is_some() && r == reg(*src) {
                            dead.push(iidx);
                        }
                    }
                }
                _ => (),
            }
        }
        for iidx in dead {
            self.m.tombstone(iidx);
        }
    }
}

impl RegisterAllocator for LinearScanRegisterAllocator<'_> {
    fn allocate_registers(&mut self) -> Result<(), CompilationError> {
        let start = Instant::now();
        let r = self.allocate();
        if let Err(e) = &r {
            LOG.log(Verbosity::Warning, &format!("Allocation failed: {e}"));
        }
        STATS.method_allocated(r.is_ok(), start);
        r
    }

    fn method(&self) -> &Method {
        &*self.m
    }

    fn registers_used(&self) -> u32 {
        match &self.allocation {
            Some(a) => a.map.num_registers,
            None => panic!("Registers have not been allocated"),
        }
    }

    fn try_register_for_value(&self, value: ValueIdx, position: u32) -> Option<u32> {
        let Some(a) = &self.allocation else {
            panic!("Registers have not been allocated")
        };
        let i = a.arena.split_covering(a.arena.for_value(value), position)?;
        a.arena[i].register.map(|r| a.map.final_register(r))
    }
}

/// Collect and insert every move `arena` needs, returning the register map the moves imply.
fn insert_moves(
    m: &mut Method,
    arena: &IntervalArena,
    liveness: &Liveness,
    num_arg_registers: u32,
) -> Result<(RegisterMap, InsertedMoves), CompilationError> {
    let moves = resolution::resolve(m, arena, liveness)?;
    let num_allocated = arena
        .all_splits()
        .filter_map(|i| arena[i].register.map(|r| r + arena[i].required_registers()))
        .max()
        .unwrap_or(0)
        .max(num_arg_registers);
    let inserted = moves.insert_moves(m, arena, num_allocated)?;
    Ok((
        RegisterMap::new(arena, num_arg_registers, num_allocated, inserted.temporaries),
        inserted,
    ))
}

/// Check that every interval's final register is within its limit.
fn check_limits(
    arena: &IntervalArena,
    map: &RegisterMap,
    mode: ArgumentReuseMode,
) -> Result<(), AllocError> {
    match mode.ceiling() {
        Some(c) if map.num_registers > c => {
            return Err(AllocError::Restart(Restart::RegisterCeiling));
        }
        None if map.num_registers > U16BIT_MAX + 1 => {
            return Err(AllocError::Fatal(CompilationError::LimitExceeded(format!(
                "{} registers needed but only {} are addressable",
                map.num_registers,
                U16BIT_MAX + 1
            ))));
        }
        _ => (),
    }
    for i in arena.all_splits() {
        let iv = &arena[i];
        let Some(r) = iv.register else { continue };
        let f = map.final_register(r);
        if f + iv.required_registers() - 1 > iv.register_limit() {
            if mode.allows_argument_reuse() {
                return Err(AllocError::Restart(Restart::RegisterCeiling));
            }
            return Err(AllocError::Fatal(CompilationError::InternalError(format!(
                "{iv} ends up in r{f}, beyond its limit of r{}",
                iv.register_limit()
            ))));
        }
    }
    Ok(())
}

/// Give each range invoke's arguments values of their own, defined by moves immediately before
/// the invoke and linked into a consecutive-register group.
fn prepare_range_invokes(m: &mut Method) {
    for bidx in m.blocks.indices() {
        let mut i = 0;
        while i < m.blocks[bidx].insts.len() {
            let iidx = m.blocks[bidx].insts[i];
            let inst = &m.insts[iidx];
            if !inst.is_range_invoke(m)
                || inst.ins.iter().any(|v| {
                    m.values[*v].prev_consecutive.is_some()
                        || m.values[*v].next_consecutive.is_some()
                })
            {
                i += 1;
                continue;
            }
            let ins = inst.ins.clone();
            let mut args: SmallVec<[ValueIdx; 3]> = SmallVec::new();
            let mut prev: Option<ValueIdx> = None;
            for (k, v) in ins.iter().enumerate() {
                let move_iidx = m.insts.len_idx();
                let out = m
                    .values
                    .push(Value::new(m.values[*v].ty, ValueDef::Inst(move_iidx)));
                let mut mv = Inst::new(InstKind::Move, Some(out), smallvec![*v]);
                mv.block = bidx;
                m.insts.push(mv);
                m.blocks[bidx].insts.insert(i + k, move_iidx);
                if let Some(p) = prev {
                    m.values[p].next_consecutive = Some(out);
                    m.values[out].prev_consecutive = Some(p);
                }
                prev = Some(out);
                args.push(out);
            }
            m.insts[iidx].ins = args;
            i += ins.len() + 1;
        }
    }
}
