//! Liveness analysis and the construction of live intervals from it.

use super::live_intervals::{IntervalArena, LiveIntervalsUse, LiveRange};
use crate::{
    config::Config,
    errors::CompilationError,
    ir::{BlockIdx, InstKind, Method, ValueDef, ValueIdx, INSTRUCTION_NUMBER_DELTA},
};
use index_vec::IndexVec;
use vob::Vob;

/// The values live on entry to, and exit from, each block. Liveness depends only on the method and
/// the configuration, so it is computed once and reused by every allocation attempt.
pub struct Liveness {
    live_in: IndexVec<BlockIdx, Vob>,
    live_out: IndexVec<BlockIdx, Vob>,
}

impl Liveness {
    pub fn compute(m: &Method, config: &Config) -> Result<Self, CompilationError> {
        let nvals = m.values.len();
        let mut live_in = index_vec::index_vec![Vob::from_elem(false, nvals); m.blocks.len()];
        let mut live_out = live_in.clone();
        let receiver = if config.keep_receiver_alive() {
            m.receiver()
        } else {
            None
        };

        // Iterate in reverse linear order until nothing changes: loops need more than one pass.
        let mut changed = true;
        while changed {
            changed = false;
            for (bidx, b) in m.blocks.iter_enumerated().rev() {
                let mut live = Vob::from_elem(false, nvals);
                for succ in b.all_succs() {
                    live.or(&live_in[succ]);
                    for phi in &m.blocks[succ].phis {
                        if let ValueDef::Phi { args, .. } = &m.values[*phi].def {
                            for (_, v) in args.iter().filter(|(pred, _)| *pred == bidx) {
                                live.set(v.index(), true);
                            }
                        }
                    }
                }
                if let Some(r) = receiver {
                    live.set(r.index(), true);
                }
                live_out[bidx] = live.clone();

                for iidx in b.insts.iter().rev() {
                    let inst = &m.insts[*iidx];
                    if let Some(out) = inst.out {
                        live.set(out.index(), false);
                    }
                    for v in &inst.ins {
                        live.set(v.index(), true);
                    }
                }
                for phi in &b.phis {
                    live.set(phi.index(), false);
                }
                if config.debug {
                    for v in &b.locals_at_entry {
                        if !m.values[*v].is_phi() {
                            live.set(v.index(), true);
                        }
                    }
                }
                if live != live_in[bidx] {
                    live_in[bidx] = live;
                    changed = true;
                }
            }
        }

        if let Some(v) = live_in.iter().next().and_then(|x| x.iter_set_bits(..).next()) {
            return Err(CompilationError::IncompletePhi(format!(
                "{} is used without being defined on every path to its use",
                ValueIdx::new(v)
            )));
        }
        Ok(Self { live_in, live_out })
    }

    pub fn live_in(&self, bidx: BlockIdx) -> impl Iterator<Item = ValueIdx> + '_ {
        self.live_in[bidx].iter_set_bits(..).map(ValueIdx::new)
    }

    pub fn live_out(&self, bidx: BlockIdx) -> impl Iterator<Item = ValueIdx> + '_ {
        self.live_out[bidx].iter_set_bits(..).map(ValueIdx::new)
    }

    pub fn is_live_in(&self, bidx: BlockIdx, vidx: ValueIdx) -> bool {
        self.live_in[bidx].get(vidx.index()).unwrap_or(false)
    }

    /// Build one split parent per value, walking the method backwards.
    ///
    /// A value live out of a block is live from the gap before the block's first instruction to
    /// the gap after its last. Definitions shorten ranges; uses start them. A definition without
    /// a use still occupies its register for the defining instruction.
    pub fn build_intervals(&self, m: &Method) -> IntervalArena {
        let mut arena = IntervalArena::new(m.values.iter_enumerated().map(|(v, x)| (v, x.ty)));
        for (bidx, b) in m.blocks.iter_enumerated().rev() {
            let entry = m.entry_number(bidx);
            let start = entry.saturating_sub(1);
            let end = m.exit_number(bidx) + 1;
            let mut live = self.live_out[bidx].clone();
            for v in self.live_out(bidx) {
                let iidx = arena.for_value(v);
                arena[iidx].add_range(LiveRange::new(start, end));
            }

            for iidx in b.insts.iter().rev() {
                let inst = &m.insts[*iidx];
                let n = inst.number;
                if let Some(out) = inst.out {
                    let i = arena.for_value(out);
                    let iv = &mut arena[i];
                    if live[out.index()] {
                        iv.set_start(n);
                    } else {
                        iv.add_range(LiveRange::new(n, n + INSTRUCTION_NUMBER_DELTA));
                    }
                    iv.add_use(LiveIntervalsUse::new(n, inst.max_out_register()));
                    live.set(out.index(), false);
                }
                let limit = inst.max_in_register(m);
                for v in &inst.ins {
                    let i = arena.for_value(*v);
                    let iv = &mut arena[i];
                    iv.add_use(LiveIntervalsUse::new(n, limit));
                    if matches!(inst.kind, InstKind::MonitorEnter | InstKind::MonitorExit) {
                        iv.used_in_monitor = true;
                    }
                    if !live[v.index()] {
                        iv.add_range(LiveRange::new(start, n));
                        live.set(v.index(), true);
                    }
                }
            }

            for phi in &b.phis {
                let i = arena.for_value(*phi);
                let iv = &mut arena[i];
                if live[phi.index()] {
                    iv.set_start(start);
                } else {
                    iv.add_range(LiveRange::new(start, start + 1));
                }
                live.set(phi.index(), false);
            }

            // Locals kept alive for the debugger need not be used in the block.
            for v in &b.locals_at_entry {
                if !self.is_live_in(bidx, *v) {
                    continue;
                }
                let i = arena.for_value(*v);
                let iv = &mut arena[i];
                if iv.ranges().first().map(|r| r.start) != Some(start) {
                    iv.add_range(LiveRange::new(start, start + 1));
                }
            }
        }

        for (vidx, v) in m.values.iter_enumerated() {
            let iidx = arena.for_value(vidx);
            match v.def_inst().map(|x| &m.insts[x].kind) {
                Some(InstKind::Arg { receiver }) => {
                    // Arguments are in their registers from method entry.
                    arena[iidx].set_start(0);
                    arena[iidx].is_argument = true;
                    arena[iidx].is_receiver = *receiver;
                }
                Some(InstKind::Const(c)) => arena[iidx].const_value = Some(*c),
                _ => (),
            }
            let prev = v.prev_consecutive.map(|x| arena.for_value(x));
            let next = v.next_consecutive.map(|x| arena.for_value(x));
            arena[iidx].prev_consecutive = prev;
            arena[iidx].next_consecutive = next;
        }
        arena
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::parser::str_to_method;

    const LOOP: &str = "
      bb0:
        %0: int = arg
        %1: int = const 0
        goto bb1
      bb1:
        %2: int = phi [%1, bb0], [%3, bb2]
        %3: int = add %2, %0
        if_lt %3, %0, bb2, bb3
      bb2:
        goto bb1
      bb3:
        return %3
    ";

    #[test]
    fn loop_liveness() {
        let m = str_to_method(LOOP);
        let l = Liveness::compute(&m, &Config::default()).unwrap();
        let set = |x: Vec<ValueIdx>| x.into_iter().map(|v| v.index()).collect::<Vec<_>>();
        assert_eq!(set(l.live_in(BlockIdx::new(0)).collect()), Vec::<usize>::new());
        assert_eq!(set(l.live_out(BlockIdx::new(0)).collect()), vec![0, 1]);
        assert_eq!(set(l.live_in(BlockIdx::new(1)).collect()), vec![0]);
        assert_eq!(set(l.live_in(BlockIdx::new(2)).collect()), vec![0, 3]);
        assert_eq!(set(l.live_in(BlockIdx::new(3)).collect()), vec![3]);
    }

    #[test]
    fn loop_intervals() {
        let m = str_to_method(LOOP);
        let l = Liveness::compute(&m, &Config::default()).unwrap();
        let a = l.build_intervals(&m);
        let s = (0..4)
            .map(|i| a[a.for_value(ValueIdx::new(i))].to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            s,
            vec![
                "%0 [0, 11) uses 0:65535 6:255 8:15",
                "%1 [2, 5) uses 2:255",
                "%2 [5, 6) uses 6:255",
                "%3 [6, 12) uses 6:255 8:15 12:255",
            ]
        );
        let i0 = a.for_value(ValueIdx::new(0));
        assert!(a[i0].is_argument);
        assert_eq!(a[i0].register_limit(), 15);
        assert_eq!(a[a.for_value(ValueIdx::new(1))].const_value, Some(0));
    }

    #[test]
    fn unused_def() {
        let m = str_to_method(
            "
          bb0:
            %0: obj = new_instance Foo
            %1: int = const 4
            return %1
        ",
        );
        let a = Liveness::compute(&m, &Config::default())
            .unwrap()
            .build_intervals(&m);
        assert_eq!(a[a.for_value(ValueIdx::new(0))].to_string(), "%0 [0, 2) uses 0:255");
        assert_eq!(a[a.for_value(ValueIdx::new(1))].to_string(), "%1 [2, 4) uses 2:255 4:255");
    }

    #[test]
    fn keep_receiver_alive() {
        let m = str_to_method(
            "
          bb0:
            %0: obj = arg this
            %1: int = const 1
            if_eqz %1, bb1, bb2
          bb1:
            return
          bb2:
            return
        ",
        );
        let c = Config::new(19, true, true);
        let a = Liveness::compute(&m, &c).unwrap().build_intervals(&m);
        let r = a.for_value(ValueIdx::new(0));
        assert_eq!(a[r].to_string(), "%0 [0, 9) uses 0:65535");
        assert!(a[r].is_receiver);
        let a = Liveness::compute(&m, &Config::default())
            .unwrap()
            .build_intervals(&m);
        assert_eq!(a[a.for_value(ValueIdx::new(0))].to_string(), "%0 [0, 2) uses 0:65535");
    }

    #[test]
    fn incomplete_phi() {
        let m = str_to_method(
            "
          bb0:
            %0: int = arg
            if_eqz %0, bb1, bb2
          bb1:
            %1: int = const 1
            goto bb2
          bb2:
            return %1
        ",
        );
        match Liveness::compute(&m, &Config::default()) {
            Err(CompilationError::IncompletePhi(e)) => {
                assert_eq!(e, "%1 is used without being defined on every path to its use")
            }
            _ => panic!(),
        }
    }
}
