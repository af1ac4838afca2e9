/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Find the CFG edges across which linear scan left a value in two
//! different places.
//!
//! Linear scan assigns locations in position order and never looks at
//! control flow, so a value live into a block may sit somewhere else at the
//! end of one of that block's predecessors. This pass only reports such
//! edges; it inserts no moves.

use log::debug;

use std::fmt;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

use crate::analysis::AnalysisInfo;
use crate::data_structures::{BlockIx, Location, VirtualReg};
use crate::interface::{Function, LinearScanResult};

/// A value that must travel from `from` to `to` along the edge
/// `pred -> succ`. For a merge node `from_vreg` is the incoming operand and
/// `to_vreg` the merge result; otherwise both are the same register.
#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct EdgeMove {
  pub pred: BlockIx,
  pub succ: BlockIx,
  pub from_vreg: VirtualReg,
  pub to_vreg: VirtualReg,
  pub from: Location,
  pub to: Location,
}

impl fmt::Debug for EdgeMove {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(
      fmt,
      "{:?}->{:?}: {:?} {:?} => {:?} {:?}",
      self.pred, self.succ, self.from_vreg, self.from, self.to_vreg, self.to
    )
  }
}

#[inline(never)]
pub fn find_edge_moves<F: Function>(
  func: &F, info: &AnalysisInfo, result: &LinearScanResult,
) -> Vec<EdgeMove> {
  let mut moves = vec![];

  for succ in func.blocks() {
    let entry = info.block_ranges[succ].from;

    let mut live: Vec<VirtualReg> = info.livein[succ].iter().cloned().collect();
    live.sort();

    let mut phis = vec![];
    for iix in func.block_insns(succ) {
      let insn = &func.insns()[iix.get() as usize];
      if let Some(ops) = func.phi_operands(insn) {
        if let Some(def) = func.get_regs(insn).defined {
          phis.push((def, ops));
        }
      }
    }

    for &pred in info.preds[succ].iter() {
      let exit = info.block_ranges[pred].edge_position();

      let mut check = |from_vreg: VirtualReg, to_vreg: VirtualReg| {
        let from = result.location_at(from_vreg, exit);
        let to = result.location_at(to_vreg, entry);
        if from != to && !from.is_none() && !to.is_none() {
          let mv = EdgeMove { pred, succ, from_vreg, to_vreg, from, to };
          debug!("resolve: {:?}", mv);
          moves.push(mv);
        }
      };

      for &vreg in live.iter() {
        check(vreg, vreg);
      }
      for (def, ops) in phis.iter() {
        for &(from_block, operand) in ops.iter() {
          if from_block == pred {
            check(operand, *def);
          }
        }
      }
    }
  }

  moves
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::interface::{allocate_linear_scan, Options};
  use crate::test_utils::{op, phi, TestFunc};

  fn v(n: u32) -> VirtualReg {
    VirtualReg::new(n)
  }

  // b0: v0 = op; v1 = op; goto_ctf b1 b2
  // b1: v2 = op v0; goto b3
  // b2: v3 = op v1; goto b3
  // b3: v4 = phi [b1: v2, b2: v3]; op v4, v0
  fn diamond() -> TestFunc {
    TestFunc::new()
      .block(vec![op(Some(0), &[]), op(Some(1), &[]), op(None, &[])], &[1, 2])
      .block(vec![op(Some(2), &[0]), op(None, &[])], &[3])
      .block(vec![op(Some(3), &[1]), op(None, &[])], &[3])
      .block(vec![phi(4, &[(1, 2), (2, 3)]), op(None, &[4, 0])], &[])
  }

  #[test]
  fn off_by_default() {
    let opts = Options { num_regs: 4, ..Options::default() };
    let result = allocate_linear_scan(&diamond(), &opts).unwrap();
    assert!(result.edge_moves.is_empty());
  }

  #[test]
  fn phi_edges_are_reported() {
    let opts = Options { num_regs: 4, resolve_edges: true, run_checker: true, ..Options::default() };
    let result = allocate_linear_scan(&diamond(), &opts).unwrap();
    for mv in result.edge_moves.iter() {
      assert_ne!(mv.from, mv.to);
      assert!(mv.from.reg().is_some() || mv.from.spill().is_some());
    }
    // A merge edge is reported exactly when the incoming value and the
    // merge result were given different registers.
    let in_b1 = result.interval(v(2)).unwrap().ranges[0].location;
    let in_b2 = result.interval(v(3)).unwrap().ranges[0].location;
    let merged = result.interval(v(4)).unwrap().ranges[0].location;
    let expected = [in_b1, in_b2].iter().filter(|&&loc| loc != merged).count();
    let phi_moves = result.edge_moves.iter().filter(|mv| mv.to_vreg == v(4)).count();
    assert_eq!(phi_moves, expected);
    assert!(merged.reg().map_or(false, |reg| reg.get_index() < 4));
  }
}
