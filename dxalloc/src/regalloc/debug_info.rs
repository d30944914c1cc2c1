//! Where source-level locals live after allocation.
//!
//! Debuggers need to know which register holds each local. A local keeps the same register
//! until its value is split, so it is enough to record the registers on entry to each block and
//! every point at which a local changes register.

use super::live_intervals::IntervalArena;
use crate::ir::{BlockIdx, Method, ValueIdx};
use index_vec::IndexVec;
use std::{collections::BTreeMap, fmt};

/// A local moving between registers. `None` means the local is not in any register (it is a
/// rematerialised constant).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalChange {
    pub position: u32,
    pub name: String,
    pub from: Option<u32>,
    pub to: Option<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct DebugInfo {
    /// For each block, the registers holding locals on entry, mapped to the locals' names.
    pub locals_at_entry: IndexVec<BlockIdx, BTreeMap<u32, String>>,
    /// In position order.
    pub local_changes: Vec<LocalChange>,
}

fn local_name(m: &Method, v: ValueIdx) -> String {
    m.values[v].local.clone().unwrap_or_else(|| v.to_string())
}

impl DebugInfo {
    /// `final_register` maps the registers in `arena` onto the method's final registers.
    pub(crate) fn compute(
        m: &Method,
        arena: &IntervalArena,
        final_register: &dyn Fn(u32) -> u32,
    ) -> Self {
        let mut locals_at_entry = IndexVec::with_capacity(m.blocks.len());
        for (bidx, b) in m.blocks.iter_enumerated() {
            let pos = m.entry_number(bidx).saturating_sub(1);
            let mut regs = BTreeMap::new();
            for v in &b.locals_at_entry {
                let reg = arena
                    .split_live_at(arena.for_value(*v), pos)
                    .and_then(|i| arena[i].register);
                if let Some(r) = reg {
                    regs.insert(final_register(r), local_name(m, *v));
                }
            }
            locals_at_entry.push(regs);
        }

        let mut local_changes = Vec::new();
        for p in arena.parents() {
            let v = arena[p].value;
            if m.values[v].local.is_none() {
                continue;
            }
            for pair in arena.sorted_splits(p).windows(2) {
                let from = arena[pair[0]].register.map(final_register);
                let to = arena[pair[1]].register.map(final_register);
                if from != to {
                    local_changes.push(LocalChange {
                        position: arena[pair[1]].start(),
                        name: local_name(m, v),
                        from,
                        to,
                    });
                }
            }
        }
        local_changes.sort_by(|a, b| (a.position, &a.name).cmp(&(b.position, &b.name)));
        Self {
            locals_at_entry,
            local_changes,
        }
    }
}

impl fmt::Display for DebugInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reg = |r: Option<u32>| r.map_or_else(|| "remat".to_owned(), |r| format!("r{r}"));
        for (bidx, regs) in self.locals_at_entry.iter_enumerated() {
            if regs.is_empty() {
                continue;
            }
            let locals = regs
                .iter()
                .map(|(r, name)| format!("{name}=r{r}"))
                .collect::<Vec<_>>();
            writeln!(f, "{bidx}: {}", locals.join(", "))?;
        }
        for c in &self.local_changes {
            writeln!(
                f,
                "{}: {} {} -> {}",
                c.position,
                c.name,
                reg(c.from),
                reg(c.to)
            )?;
        }
        Ok(())
    }
}
