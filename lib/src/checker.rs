/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Checkers: validate the output of both allocators.
//!
//! For linear scan the result is a set of annotated intervals, and checking
//! it is structural: every range has a register, every hole a spill slot,
//! and no two ranges sharing a register overlap.
//!
//! For the online allocator the result is an instruction stream, and we
//! track symbolic values as they flow through spills and reloads. Each
//! storage slot (real register or spill slot) holds either `Unknown` or the
//! virtual register whose value it currently contains. The transfer
//! functions are:
//!
//!   - spill (inserted by RA):    [ store spill_i, R_j ]
//!
//!       S[spill_i] := R[R_j]
//!
//!   - reload (inserted by RA):   [ load R_i, spill_j ]
//!
//!       R[R_i] := S[spill_j]
//!
//!   - statement in pre-regalloc function [ V_i := op V_j, V_k, ... ]
//!     with allocated form                [ R_i := op R_j, R_k, ... ]
//!
//!       R[R_i] := `V_i`
//!
//! and at each statement the register of each use must hold the symbol of
//! the virtual register it stands for. The stream is checked in emission
//! order; the online allocator carries its state straight through block
//! boundaries, so that is also the order its decisions are made in.

use std::fmt;

use crate::data_structures::{
  Interval, LiveRange, Map, Position, RealReg, SpillSlot, VirtualReg,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckerError {
  /// Ranges or holes out of order, or a hole overlapping a range.
  MalformedInterval { vreg: VirtualReg },
  /// A range without a register.
  UnassignedRange { vreg: VirtualReg, start: Position },
  /// A hole without a spill slot.
  HoleNotOnStack { vreg: VirtualReg, start: Position },
  /// A register outside `0 .. num_regs`.
  BadRegister { vreg: VirtualReg, reg: RealReg },
  /// Two values in the same register at the same time.
  Overlap { reg: RealReg, first: VirtualReg, second: VirtualReg, at: Position },
  /// An instruction reads `reg` for `vreg`, but `reg` holds something else.
  WrongValue {
    inst: usize,
    vreg: VirtualReg,
    reg: RealReg,
    found: CheckerValue,
  },
}

#[derive(Clone, Debug, Default)]
pub struct CheckerErrors {
  pub errors: Vec<CheckerError>,
}

impl fmt::Display for CheckerErrors {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    for err in self.errors.iter() {
      writeln!(fmt, "{:?}", err)?;
    }
    Ok(())
  }
}

//=============================================================================
// Linear scan

/// Check the annotated intervals produced by linear scan.
pub fn check_linear_scan(
  intervals: &[Interval], num_regs: usize,
) -> Result<(), CheckerErrors> {
  let mut errors = vec![];
  let mut per_reg = Map::<RealReg, Vec<(&LiveRange, VirtualReg)>>::default();

  for int in intervals.iter() {
    let vreg = int.vreg;
    if !int.is_well_formed() {
      errors.push(CheckerError::MalformedInterval { vreg });
    }
    for range in int.ranges.iter() {
      match range.location.reg() {
        Some(reg) if reg.get_index() < num_regs => {
          per_reg.entry(reg).or_default().push((range, vreg));
        }
        Some(reg) => errors.push(CheckerError::BadRegister { vreg, reg }),
        None => errors.push(CheckerError::UnassignedRange { vreg, start: range.start }),
      }
    }
    for hole in int.holes.iter() {
      if hole.location.spill().is_none() {
        errors.push(CheckerError::HoleNotOnStack { vreg, start: hole.start });
      }
    }
  }

  let mut per_reg: Vec<_> = per_reg.into_iter().collect();
  per_reg.sort_by_key(|(reg, _)| *reg);
  for (reg, mut ranges) in per_reg {
    // Empty ranges occupy no position.
    ranges.retain(|(range, _)| !range.is_empty());
    ranges.sort_by_key(|(range, vreg)| (range.start, range.end, *vreg));
    let mut furthest: Option<(Position, VirtualReg)> = None;
    for &(range, vreg) in ranges.iter() {
      if let Some((end, owner)) = furthest {
        if range.start < end {
          errors.push(CheckerError::Overlap { reg, first: owner, second: vreg, at: range.start });
        }
        if range.end > end {
          furthest = Some((range.end, vreg));
        }
      } else {
        furthest = Some((range.end, vreg));
      }
    }
  }

  if errors.is_empty() {
    Ok(())
  } else {
    Err(CheckerErrors { errors })
  }
}

//=============================================================================
// Online allocator

/// Abstract state for a storage slot (real register or spill slot).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckerValue {
  /// This storage slot has no known value.
  Unknown,
  /// This storage slot holds the value defined into the given register.
  Reg(VirtualReg),
}

/// State that steps through program points as we scan over the instruction
/// stream.
#[derive(Clone, Debug, Default)]
pub struct CheckerState {
  reg_values: Map<RealReg, CheckerValue>,
  spill_slots: Map<SpillSlot, CheckerValue>,
}

impl CheckerState {
  pub fn new() -> CheckerState {
    Self::default()
  }

  /// Update with a RegAlloc-inserted reload.
  pub fn process_reload(&mut self, into_reg: RealReg, from_slot: SpillSlot) {
    let val = self.spill_slots.get(&from_slot).cloned().unwrap_or(CheckerValue::Unknown);
    self.reg_values.insert(into_reg, val);
  }

  /// Update with a RegAlloc-inserted spill.
  pub fn process_spill(&mut self, into_slot: SpillSlot, from_reg: RealReg) {
    let val = self.get_reg_value(from_reg);
    self.spill_slots.insert(into_slot, val);
  }

  /// Update with a def by an original instruction.
  pub fn process_def(&mut self, vreg: VirtualReg, reg: RealReg) {
    self.reg_values.insert(reg, CheckerValue::Reg(vreg));
  }

  /// Get the checker value in a given real register.
  pub fn get_reg_value(&self, reg: RealReg) -> CheckerValue {
    self.reg_values.get(&reg).cloned().unwrap_or(CheckerValue::Unknown)
  }
}

/// An instruction as the checker sees it.
#[derive(Clone, Debug)]
pub enum CheckerInst {
  /// An original instruction with its operands resolved to registers.
  Op {
    uses: Vec<(VirtualReg, RealReg)>,
    def: Option<(VirtualReg, RealReg)>,
  },
  Spill { into_slot: SpillSlot, from_reg: RealReg },
  Reload { into_reg: RealReg, from_slot: SpillSlot },
}

/// Collects an allocated instruction stream and checks it.
#[derive(Default)]
pub struct Checker {
  insts: Vec<CheckerInst>,
}

impl Checker {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&mut self, inst: CheckerInst) {
    self.insts.push(inst);
  }

  pub fn len(&self) -> usize {
    self.insts.len()
  }

  pub fn is_empty(&self) -> bool {
    self.insts.is_empty()
  }

  pub fn run(&self) -> Result<(), CheckerErrors> {
    let mut state = CheckerState::new();
    let mut errors = vec![];
    for (ix, inst) in self.insts.iter().enumerate() {
      match inst {
        CheckerInst::Op { uses, def } => {
          for &(vreg, reg) in uses.iter() {
            let found = state.get_reg_value(reg);
            if found != CheckerValue::Reg(vreg) {
              errors.push(CheckerError::WrongValue { inst: ix, vreg, reg, found });
            }
          }
          if let Some((vreg, reg)) = *def {
            state.process_def(vreg, reg);
          }
        }
        CheckerInst::Spill { into_slot, from_reg } => {
          state.process_spill(*into_slot, *from_reg)
        }
        CheckerInst::Reload { into_reg, from_slot } => {
          state.process_reload(*into_reg, *from_slot)
        }
      }
    }
    if errors.is_empty() {
      Ok(())
    } else {
      Err(CheckerErrors { errors })
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::data_structures::Location;

  fn p(n: u32) -> Position {
    Position::new(n)
  }

  fn v(n: u32) -> VirtualReg {
    VirtualReg::new(n)
  }

  fn r(n: usize) -> RealReg {
    RealReg::new(n)
  }

  fn in_reg(vreg: u32, from: u32, to: u32, reg: usize) -> Interval {
    let mut int = Interval::new(v(vreg), p(from), p(to));
    int.ranges[0].location = Location::Reg(r(reg));
    int
  }

  #[test]
  fn disjoint_ranges_pass() {
    let ints = vec![in_reg(0, 0, 6, 0), in_reg(1, 6, 10, 0), in_reg(2, 2, 8, 1)];
    assert!(check_linear_scan(&ints, 2).is_ok());
  }

  #[test]
  fn overlap_is_reported() {
    let ints = vec![in_reg(0, 0, 12, 0), in_reg(1, 2, 4, 1), in_reg(2, 6, 8, 0)];
    let errs = check_linear_scan(&ints, 2).unwrap_err();
    assert_eq!(
      errs.errors,
      vec![CheckerError::Overlap { reg: r(0), first: v(0), second: v(2), at: p(6) }]
    );
  }

  #[test]
  fn unassigned_and_bad_registers() {
    let ints = vec![Interval::new(v(0), p(0), p(2)), in_reg(1, 0, 2, 5)];
    let errs = check_linear_scan(&ints, 2).unwrap_err();
    assert_eq!(errs.errors.len(), 2);
  }

  #[test]
  fn spill_reload_round_trip() {
    let mut checker = Checker::new();
    checker.push(CheckerInst::Op { uses: vec![], def: Some((v(0), r(0))) });
    checker.push(CheckerInst::Spill { into_slot: SpillSlot::new(0), from_reg: r(0) });
    checker.push(CheckerInst::Op { uses: vec![], def: Some((v(1), r(0))) });
    checker.push(CheckerInst::Reload { into_reg: r(1), from_slot: SpillSlot::new(0) });
    checker.push(CheckerInst::Op { uses: vec![(v(0), r(1)), (v(1), r(0))], def: None });
    assert!(checker.run().is_ok());
  }

  #[test]
  fn clobbered_value_is_reported() {
    let mut checker = Checker::new();
    checker.push(CheckerInst::Op { uses: vec![], def: Some((v(0), r(0))) });
    checker.push(CheckerInst::Op { uses: vec![], def: Some((v(1), r(0))) });
    checker.push(CheckerInst::Op { uses: vec![(v(0), r(0))], def: None });
    let errs = checker.run().unwrap_err();
    assert_eq!(
      errs.errors,
      vec![CheckerError::WrongValue {
        inst: 2,
        vreg: v(0),
        reg: r(0),
        found: CheckerValue::Reg(v(1)),
      }]
    );
  }
}
