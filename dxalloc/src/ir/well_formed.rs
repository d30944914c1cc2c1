//! Check that a [Method] is well-formed enough to allocate registers for.
//!
//! The parser guarantees that a method is syntactically sensible (e.g. every block ends with a
//! terminator), but not that it is semantically sensible. Methods built by other producers
//! guarantee neither. Allocating registers for a malformed method would silently produce wrong
//! code, so these checks are fatal.

use super::{BlockIdx, InstKind, Method, Ty, ValueDef};
use crate::errors::CompilationError;

impl Method {
    /// Check that this method is well-formed, returning the first problem found.
    pub fn assert_well_formed(&self) -> Result<(), CompilationError> {
        if let Some(entry) = self.blocks.iter().next() {
            if !entry.preds.is_empty() {
                return Err(CompilationError::General(
                    "The entry block cannot be the target of a branch".to_owned(),
                ));
            }
            if !entry.phis.is_empty() {
                return Err(CompilationError::IncompletePhi(
                    "The entry block cannot contain phis".to_owned(),
                ));
            }
        }

        let mut args_done = false;
        for (bidx, b) in self.blocks.iter_enumerated() {
            if b.insts.is_empty() {
                return Err(CompilationError::General(format!("{bidx} is empty")));
            }
            for (i, iidx) in b.insts.iter().enumerate() {
                let inst = &self.insts[*iidx];
                match &inst.kind {
                    InstKind::Arg { .. } => {
                        if bidx != BlockIdx::new(0) || args_done {
                            return Err(CompilationError::General(format!(
                                "{bidx}: arguments must be the first instructions of the entry \
                                 block"
                            )));
                        }
                    }
                    InstKind::MoveException if i != 0 => {
                        return Err(CompilationError::MisplacedMoveException(format!(
                            "{bidx}: move_exception is instruction {i}, not the first"
                        )));
                    }
                    InstKind::Invoke { target, shorty, .. } => {
                        self.check_invoke(bidx, target, shorty, inst)?
                    }
                    _ => (),
                }
                if !matches!(inst.kind, InstKind::Arg { .. }) {
                    args_done = true;
                }
            }

            for phi in &b.phis {
                let ValueDef::Phi { block, args } = &self.values[*phi].def else {
                    return Err(CompilationError::InternalError(format!(
                        "{phi} is listed as a phi of {bidx} but is not a phi"
                    )));
                };
                debug_assert_eq!(*block, bidx);
                let mut incoming = args.iter().map(|(pred, _)| *pred).collect::<Vec<_>>();
                incoming.sort();
                let mut preds = b.preds.clone();
                preds.sort();
                if incoming != preds {
                    return Err(CompilationError::IncompletePhi(format!(
                        "{phi} in {bidx} has operands for [{}] but the block's predecessors \
                         are [{}]",
                        join(&incoming),
                        join(&preds)
                    )));
                }
                for (_, v) in args {
                    if self.values[*v].ty.is_wide() != self.values[*phi].ty.is_wide() {
                        return Err(CompilationError::IncompletePhi(format!(
                            "{phi} in {bidx} mixes wide and non-wide operands"
                        )));
                    }
                }
            }

            // Moves for an edge go before the predecessor's `goto` or, failing that, at the start
            // of a successor with a single predecessor. Any other edge must be split by the
            // producer.
            for pred in &b.preds {
                let by_goto = self.blocks[*pred].succs.contains(&bidx)
                    && matches!(self.exit_inst(*pred).map(|x| &x.kind), Some(InstKind::Goto));
                if !by_goto && b.preds.len() > 1 {
                    return Err(CompilationError::General(format!(
                        "The edge {pred} -> {bidx} is critical"
                    )));
                }
            }

            if !b.catch_handlers.is_empty()
                && b.insts
                    .iter()
                    .filter(|x| self.insts[**x].can_throw())
                    .count()
                    > 1
            {
                return Err(CompilationError::General(format!(
                    "{bidx} has catch handlers but more than one throwing instruction"
                )));
            }

            for v in &b.locals_at_entry {
                if matches!(self.values[*v].def_inst(), Some(x) if self.insts[x].block == bidx) {
                    return Err(CompilationError::General(format!(
                        "{v} is a local on entry to {bidx} but is defined in {bidx}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_invoke(
        &self,
        bidx: BlockIdx,
        target: &str,
        shorty: &str,
        inst: &super::Inst,
    ) -> Result<(), CompilationError> {
        let InstKind::Invoke { kind, .. } = inst.kind else {
            unreachable!()
        };
        let mut chars = shorty.chars();
        let ret = chars.next();
        let mut expected = u32::from(kind.has_receiver());
        for c in chars {
            match Ty::from_shorty_char(c) {
                Some(ty) => expected += ty.required_registers(),
                None => {
                    return Err(CompilationError::InvokeArgumentMismatch(format!(
                        "{bidx}: invalid shorty '{shorty}' for {target}"
                    )))
                }
            }
        }
        let actual = self.registers_for(&inst.ins);
        if actual != expected {
            return Err(CompilationError::InvokeArgumentMismatch(format!(
                "{bidx}: {target} with shorty '{shorty}' needs {expected} argument registers but \
                 is passed {actual}"
            )));
        }
        match (ret, inst.out) {
            (Some('V'), Some(v)) => Err(CompilationError::InvokeArgumentMismatch(format!(
                "{bidx}: {target} returns void but defines {v}"
            ))),
            (Some(c), Some(v)) if c != 'V' => {
                let ty = Ty::from_shorty_char(c);
                if ty.map(|x| x.is_wide()) != Some(self.values[v].ty.is_wide()) {
                    return Err(CompilationError::InvokeArgumentMismatch(format!(
                        "{bidx}: {target} returns '{c}' which cannot be held in {v}"
                    )));
                }
                Ok(())
            }
            (None, _) => Err(CompilationError::InvokeArgumentMismatch(format!(
                "{bidx}: empty shorty for {target}"
            ))),
            _ => Ok(()),
        }
    }
}

fn join(bs: &[BlockIdx]) -> String {
    bs.iter()
        .map(|x| x.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod test {
    use crate::{errors::CompilationError, ir::parser::str_to_method};

    #[test]
    fn well_formed() {
        str_to_method(
            "
          bb0:
            %0: obj = arg this
            %1: long = arg
            %2: long = invoke_virtual f, JJ, %0, %1
            if_eqz %0, bb1, bb2
          bb1:
            goto bb3
          bb2:
            goto bb3
          bb3:
            %3: long = phi [%1, bb1], [%2, bb2]
            return %3
        ",
        )
        .assert_well_formed()
        .unwrap();
    }

    #[test]
    fn critical_edge() {
        let m = str_to_method(
            "
          bb0:
            %0: int = arg
            if_eqz %0, bb1, bb2
          bb1:
            goto bb2
          bb2:
            %1: int = phi [%0, bb0], [%0, bb1]
            return %1
        ",
        );
        match m.assert_well_formed() {
            Err(CompilationError::General(e)) => {
                assert_eq!(e, "The edge bb0 -> bb2 is critical")
            }
            x => panic!("{x:?}"),
        }
    }

    #[test]
    fn move_exception_not_first() {
        let m = str_to_method(
            "
          bb0 catch bb1:
            %0: obj = arg
            throw %0
          bb1:
            %1: int = const 0
            %2: obj = move_exception
            throw %2
        ",
        );
        match m.assert_well_formed() {
            Err(CompilationError::MisplacedMoveException(e)) => assert!(e.contains("bb1"), "{e}"),
            x => panic!("{x:?}"),
        }
    }

    #[test]
    fn invoke_mismatch() {
        for s in [
            "bb0:\n  %0: int = arg\n  invoke_static f, VJ, %0\n  return\n",
            "bb0:\n  %0: obj = arg\n  invoke_virtual f, V, %0, %0\n  return\n",
            "bb0:\n  %0: int = arg\n  %1: int = invoke_static f, VI, %0\n  return\n",
            "bb0:\n  %0: int = arg\n  invoke_static f, VQ, %0\n  return\n",
        ] {
            assert!(matches!(
                str_to_method(s).assert_well_formed(),
                Err(CompilationError::InvokeArgumentMismatch(_))
            ));
        }
    }

    #[test]
    fn incomplete_phi() {
        let m = str_to_method(
            "
          bb0:
            %0: int = arg
            if_eqz %0, bb1, bb2
          bb1:
            goto bb2
          bb2:
            %1: int = phi [%0, bb1]
            return %1
        ",
        );
        match m.assert_well_formed() {
            Err(CompilationError::IncompletePhi(e)) => {
                assert_eq!(
                    e,
                    "%1 in bb2 has operands for [bb1] but the block's predecessors are [bb0, bb1]"
                )
            }
            x => panic!("{x:?}"),
        }
    }

    #[test]
    fn one_throwing_instruction() {
        let m = str_to_method(
            "
          bb0 catch bb1:
            %0: obj = new_instance Foo
            throw %0
          bb1:
            %1: obj = move_exception
            throw %1
        ",
        );
        match m.assert_well_formed() {
            Err(CompilationError::General(e)) => assert_eq!(
                e,
                "bb0 has catch handlers but more than one throwing instruction"
            ),
            x => panic!("{x:?}"),
        }
    }
}
