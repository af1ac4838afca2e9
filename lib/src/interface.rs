/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! This is the top level interface for the regalloc library.

use log::info;
use smallvec::SmallVec;

use std::error::Error;
use std::fmt;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

// Stuff that is defined by the library

// Sets and maps of things.

pub use crate::data_structures::Map;
pub use crate::data_structures::Set;

// Registers, positions and spill slots.

pub use crate::data_structures::{
  Location, Position, RealReg, SpillSlot, VirtualReg,
};

// Live ranges, intervals and the use lists that drive splitting.

pub use crate::data_structures::{Interval, LiveRange, UseContext};

// TypedIxVector, so that the interface can speak about vectors of blocks and
// instructions.

pub use crate::data_structures::TypedIxVec;
pub use crate::data_structures::{BlockIx, InstIx, MyRange};

// The interval builder and its results.

pub use crate::analysis::{
  run_analysis as build_intervals, AnalysisError, AnalysisInfo, BlockRange,
};

// The two allocators.

pub use crate::linear_scan::{IntervalState, LinearScanAllocator};
pub use crate::simple::SimpleRegisterAllocator;

// Validators for both allocators' output.

pub use crate::checker::{
  check_linear_scan, Checker, CheckerError, CheckerErrors, CheckerInst,
};

pub use crate::resolve::EdgeMove;

/// Register uses for a given instruction.
#[derive(Clone, Debug, Default)]
pub struct InstRegUses {
  /// The value written by the instruction, if any.
  pub defined: Option<VirtualReg>,
  /// Values read by the instruction, in operand order. May repeat.
  pub used: SmallVec<[VirtualReg; 4]>,
}

/// A trait defined by the regalloc client to provide access to its
/// instruction / CFG representation.
pub trait Function {
  /// Regalloc is parameterized on F: Function and so can use the projected
  /// type F::Inst.
  type Inst;

  // -------------
  // CFG traversal
  // -------------

  /// Allow access to the underlying vector of instructions.
  fn insns(&self) -> &[Self::Inst];

  /// Allow iteration over basic blocks (in instruction order).
  fn blocks(&self) -> MyRange<BlockIx>;

  /// Get the index of the entry block.
  fn entry_block(&self) -> BlockIx;

  /// Provide the range of instruction indices contained in each block.
  fn block_insns(&self, block: BlockIx) -> MyRange<InstIx>;

  /// Get CFG successors for a given block.
  fn block_succs(&self, block: BlockIx) -> Vec<BlockIx>;

  // --------------------------
  // Instruction register slots
  // --------------------------

  /// Provide the defined and used registers for an instruction. For a merge
  /// node this is only its def; its operands come from `phi_operands`.
  fn get_regs(&self, insn: &Self::Inst) -> InstRegUses;

  /// If the instruction is a merge node (PHI), the value it takes from each
  /// predecessor block. Merge nodes sit at the top of their block and get no
  /// position.
  fn phi_operands(
    &self, insn: &Self::Inst,
  ) -> Option<SmallVec<[(BlockIx, VirtualReg); 2]>>;

  /// Function name, for logging.
  fn func_name(&self) -> String {
    "<function>".to_string()
  }
}

/// Spill storage, as offered by the function being emitted. The online
/// allocator never lays out the stack itself.
pub trait SpillContext {
  /// Store `from_reg`, currently holding `vreg`, into a fresh stack slot and
  /// return the slot.
  fn create_spill(&mut self, from_reg: RealReg, vreg: VirtualReg) -> SpillSlot;

  /// Load `vreg` back from `slot` into `to_reg`.
  fn restore_spill(&mut self, to_reg: RealReg, slot: SpillSlot, vreg: VirtualReg);
}

//=============================================================================
// Options

/// Which allocator to run. Only one is used per compilation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Algorithm {
  Simple,
  LinearScan,
}

impl Default for Algorithm {
  fn default() -> Self {
    Algorithm::LinearScan
  }
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Options {
  /// How many physical registers are available. Fixed for a run.
  pub num_regs: usize,
  /// Registers reserved while call arguments are being set up.
  pub call_arg_regs: Vec<RealReg>,
  pub algorithm: Algorithm,
  /// Run the validator on the allocation before returning it.
  pub run_checker: bool,
  /// Report the location mismatches on CFG edges after linear scan.
  pub resolve_edges: bool,
}

impl Options {
  pub const DEFAULT_NUM_REGS: usize = 16;
}

impl Default for Options {
  fn default() -> Self {
    Self {
      num_regs: Self::DEFAULT_NUM_REGS,
      call_arg_regs: vec![],
      algorithm: Algorithm::default(),
      run_checker: false,
      resolve_edges: false,
    }
  }
}

//=============================================================================
// Errors

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegAllocError {
  /// The interval builder rejected the function.
  Analysis(AnalysisError),

  /// Every register is needed at `position` and none may be spilled.
  OutOfRegisters { position: Position },

  /// A value occupying a register has no known live range.
  MissingLiveness(VirtualReg),

  /// A value still holding a register has no use after `after`.
  MissingNextUse { vreg: VirtualReg, after: Position },

  /// A value was scheduled for allocation without an interval.
  MissingInterval(VirtualReg),

  /// A register budget of zero.
  NoRegisters,

  /// More registers than a `RealReg` can name.
  TooManyRegisters(usize),

  /// The post-allocation checker rejected the result.
  Checker(String),
}

impl fmt::Display for RegAllocError {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      RegAllocError::Analysis(err) => write!(fmt, "analysis error: {}", err),
      RegAllocError::OutOfRegisters { position } => {
        write!(fmt, "not enough registers at {:?}", position)
      }
      RegAllocError::MissingLiveness(vreg) => {
        write!(fmt, "no live range recorded for {:?}", vreg)
      }
      RegAllocError::MissingNextUse { vreg, after } => {
        write!(fmt, "{:?} is live but has no use after {:?}", vreg, after)
      }
      RegAllocError::MissingInterval(vreg) => {
        write!(fmt, "no interval for {:?}", vreg)
      }
      RegAllocError::NoRegisters => write!(fmt, "no registers available"),
      RegAllocError::TooManyRegisters(n) => {
        write!(fmt, "{} registers requested, at most {} supported", n, RealReg::MAX_NUM_REGS)
      }
      RegAllocError::Checker(msg) => write!(fmt, "checker error: {}", msg),
    }
  }
}

impl Error for RegAllocError {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    match self {
      RegAllocError::Analysis(err) => Some(err),
      _ => None,
    }
  }
}

impl From<AnalysisError> for RegAllocError {
  fn from(err: AnalysisError) -> Self {
    RegAllocError::Analysis(err)
  }
}

//=============================================================================
// Linear scan entry point

/// The result of linear scan allocation.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct LinearScanResult {
  /// One interval per virtual register, sorted by register. Every range
  /// carries its register and every hole its spill slot.
  pub intervals: Vec<Interval>,

  /// How many spill slots were used?
  pub num_spill_slots: u32,

  /// Location mismatches across CFG edges. Only computed on request.
  pub edge_moves: Vec<EdgeMove>,
}

impl LinearScanResult {
  pub fn interval(&self, vreg: VirtualReg) -> Option<&Interval> {
    self
      .intervals
      .binary_search_by_key(&vreg, |int| int.vreg)
      .ok()
      .map(|ix| &self.intervals[ix])
  }

  pub fn location_at(&self, vreg: VirtualReg, pos: Position) -> Location {
    self.interval(vreg).map_or(Location::None, |int| int.location_at(pos))
  }
}

/// Run the interval builder and then linear scan over `func`.
#[inline(never)]
pub fn allocate_linear_scan<F: Function>(
  func: &F, opts: &Options,
) -> Result<LinearScanResult, RegAllocError> {
  info!("allocate_linear_scan: {} with {} registers", func.func_name(), opts.num_regs);

  let info = build_intervals(func)?;
  let allocator = LinearScanAllocator::new(
    info.intervals.clone(),
    info.use_contexts.clone(),
    opts.num_regs,
  )?;
  let (intervals, num_spill_slots) = allocator.run()?;

  let mut result =
    LinearScanResult { intervals, num_spill_slots, edge_moves: vec![] };

  if opts.run_checker {
    check_linear_scan(&result.intervals, opts.num_regs)
      .map_err(|errs| RegAllocError::Checker(format!("{:?}", errs)))?;
  }

  if opts.resolve_edges {
    result.edge_moves = crate::resolve::find_edge_moves(func, &info, &result);
  }

  info!(
    "allocate_linear_scan: done, {} spill slots, {} edge moves",
    result.num_spill_slots,
    result.edge_moves.len()
  );
  Ok(result)
}
