/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Structural checks on a `Func` before it is handed to an allocator.

use rustc_hash::FxHashSet;

use olive_regalloc::{BlockIx, Function, InstIx, VirtualReg};

use crate::test_framework::{Func, Inst, Label};

struct Context<'a> {
  func: &'a Func,
  preds: Vec<FxHashSet<BlockIx>>,
}

impl<'a> Context<'a> {
  fn new(func: &'a Func) -> Self {
    Self { func, preds: vec![] }
  }

  /// Only once the blocks are known to lie within the instructions.
  fn compute_preds(&mut self) {
    let func = self.func;
    let mut preds = vec![FxHashSet::default(); func.blocks.len() as usize];
    for bix in func.blocks() {
      for succ in func.block_succs(bix) {
        if let Some(set) = preds.get_mut(succ.get() as usize) {
          set.insert(bix);
        }
      }
    }
    self.preds = preds;
  }

  fn check_label(&self, label: &Label) -> Result<BlockIx, String> {
    match label.block_ix() {
      Some(bix) if bix.get() < self.func.blocks.len() => Ok(bix),
      _ => Err(format!("invalid or unresolved label {:?}", label)),
    }
  }

  fn check_vreg(&self, vreg: VirtualReg) -> Result<(), String> {
    if vreg.get_index() < self.func.num_virtual_regs as usize {
      Ok(())
    } else {
      Err(format!("{:?} out of range", vreg))
    }
  }
}

pub fn validate(func: &Func) -> Result<(), String> {
  // Function entry must exist and point to a valid block.
  let mut cx = Context::new(func);
  match &func.entry {
    None => return Err("missing entry label".into()),
    Some(label) => {
      cx.check_label(label)?;
    }
  }

  // Blocks must be nonempty, contiguous, and end in exactly one control
  // flow instruction. Phis come first.
  let mut next_start = 0;
  for bix in func.blocks() {
    let b = &func.blocks[bix];
    if b.len == 0 {
      return Err(format!("block {} is empty", b.name));
    }
    if b.start.get() != next_start {
      return Err(format!("block {} does not follow its predecessor", b.name));
    }
    next_start = match b.start.get().checked_add(b.len) {
      Some(end) if end <= func.insns.len() => end,
      _ => return Err(format!("block {} runs past the end", b.name)),
    };

    let mut in_phis = true;
    for iix in func.block_insns(bix) {
      let insn = &func.insns[iix];
      let is_last = iix.get() == next_start - 1;
      if insn.is_control_flow() != is_last {
        return Err(format!("block {} is not terminated by {:?}", b.name, iix));
      }
      if insn.is_phi() && !in_phis {
        return Err(format!("phi after other instructions at {:?}", iix));
      }
      in_phis = insn.is_phi();
      for label in insn.targets() {
        cx.check_label(label)?;
      }
    }
  }
  if next_start != func.insns.len() {
    return Err("instructions outside any block".into());
  }
  cx.compute_preds();

  // Every value has one def. Operands read in the block stream must be
  // defined earlier in layout order; phi operands just somewhere.
  let mut all_defs = FxHashSet::default();
  for insn in func.insns.iter() {
    if let Some(def) = insn.get_reg_usage().defined {
      cx.check_vreg(def)?;
      if !all_defs.insert(def) {
        return Err(format!("{:?} is defined twice", def));
      }
    }
  }

  let mut defined = FxHashSet::default();
  for bix in func.blocks() {
    for iix in func.block_insns(bix) {
      let insn = &func.insns[iix];
      let reg_uses = insn.get_reg_usage();
      for &used in reg_uses.used.iter() {
        cx.check_vreg(used)?;
        if !defined.contains(&used) {
          return Err(format!("{:?} is used at {:?} before any def", used, iix));
        }
      }
      if let Inst::Phi { srcs, .. } = insn {
        check_phi(&cx, bix, iix, srcs, &all_defs)?;
      }
      if let Some(def) = reg_uses.defined {
        defined.insert(def);
      }
    }
  }

  Ok(())
}

fn check_phi(
  cx: &Context, bix: BlockIx, iix: InstIx, srcs: &[(Label, VirtualReg)],
  all_defs: &FxHashSet<VirtualReg>,
) -> Result<(), String> {
  let preds = &cx.preds[bix.get() as usize];
  for (label, src) in srcs.iter() {
    let pred = cx.check_label(label)?;
    if !preds.contains(&pred) {
      return Err(format!("phi at {:?} names {:?}, which is not a predecessor", iix, pred));
    }
    cx.check_vreg(*src)?;
    if !all_defs.contains(src) {
      return Err(format!("phi at {:?} reads {:?}, which is never defined", iix, src));
    }
  }
  Ok(())
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::test_framework::*;

  fn v(n: u32) -> VirtualReg {
    VirtualReg::new(n)
  }

  fn func_of(blocks: Vec<(&str, Vec<Inst>)>, num_virtual_regs: u32) -> Func {
    let mut func = Func::new("f");
    func.set_entry(blocks[0].0);
    for (name, insns) in blocks {
      func.block(name, insns);
    }
    func.num_virtual_regs = num_virtual_regs;
    func.finish().unwrap();
    func
  }

  #[test]
  fn accepts_a_loop() {
    let func = func_of(
      vec![
        ("entry", vec![i_imm(v(0), 0), i_goto("loop")]),
        ("loop", vec![i_phi(v(1), &[("entry", v(0)), ("loop", v(2))]), i_add(v(2), v(1), v(1)), i_goto("loop")]),
      ],
      3,
    );
    assert_eq!(validate(&func), Ok(()));
  }

  #[test]
  fn rejects_use_before_def() {
    let func = func_of(vec![("entry", vec![i_print(v(0)), i_imm(v(0), 1), i_ret(None)])], 1);
    assert!(validate(&func).is_err());
  }

  #[test]
  fn rejects_unterminated_block() {
    let func = func_of(vec![("entry", vec![i_imm(v(0), 1)])], 1);
    assert!(validate(&func).is_err());
  }

  #[test]
  fn rejects_phi_from_non_predecessor() {
    let func = func_of(
      vec![
        ("entry", vec![i_imm(v(0), 1), i_goto("a")]),
        ("a", vec![i_goto("b")]),
        ("b", vec![i_phi(v(1), &[("entry", v(0))]), i_ret(Some(v(1)))]),
      ],
      2,
    );
    assert!(validate(&func).is_err());
  }

  #[test]
  fn rejects_second_def() {
    let func = func_of(vec![("entry", vec![i_imm(v(0), 1), i_imm(v(0), 2), i_ret(None)])], 1);
    assert!(validate(&func).is_err());
  }
}
