/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Liveness analysis: numbers the instructions and builds one interval and
//! one use list per virtual register.

use log::{debug, info, trace};

use std::error::Error;
use std::fmt;

use crate::data_structures::{
  BlockIx, InstIx, Interval, Map, Position, Set, TypedIxVec, UseContext,
  VirtualReg,
};
use crate::interface::Function;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnalysisError {
  /// A block mentioned by the CFG does not exist.
  UnknownBlock(BlockIx),

  /// The function has no blocks.
  EmptyFunction,

  /// A merge node in `block` takes a value from `pred`, which does not
  /// branch to `block`.
  BadPhiPredecessor { block: BlockIx, pred: BlockIx },
}

impl fmt::Display for AnalysisError {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      AnalysisError::UnknownBlock(block) => {
        write!(fmt, "reference to unknown block {:?}", block)
      }
      AnalysisError::EmptyFunction => write!(fmt, "function has no blocks"),
      AnalysisError::BadPhiPredecessor { block, pred } => write!(
        fmt,
        "phi in {:?} names {:?}, which is not a predecessor",
        block, pred
      ),
    }
  }
}

impl Error for AnalysisError {}

/// The positions owned by a block: `[from, to)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRange {
  pub from: Position,
  pub to: Position,
}

impl BlockRange {
  /// Where the block's outgoing edges happen: the odd position after its
  /// last instruction.
  pub fn edge_position(&self) -> Position {
    if self.to > self.from {
      self.to.prev_gap()
    } else {
      self.from
    }
  }
}

/// Everything the analysis computes for a function.
#[derive(Clone, Debug)]
pub struct AnalysisInfo {
  pub intervals: Map<VirtualReg, Interval>,
  pub use_contexts: Map<VirtualReg, UseContext>,
  /// Position span of each block.
  pub block_ranges: TypedIxVec<BlockIx, BlockRange>,
  /// Position of each instruction; `None` for merge nodes.
  pub inst_positions: TypedIxVec<InstIx, Option<Position>>,
  /// Values live on entry to each block.
  pub livein: TypedIxVec<BlockIx, Set<VirtualReg>>,
  pub preds: TypedIxVec<BlockIx, Vec<BlockIx>>,
  /// The linear order in which blocks received their positions.
  pub order: Vec<BlockIx>,
}

//=============================================================================
// Block order

struct CFGInfo {
  succ_map: TypedIxVec<BlockIx, Vec<BlockIx>>,
  pred_map: TypedIxVec<BlockIx, Vec<BlockIx>>,
  // Reverse postorder from the entry, then any unreachable blocks.
  order: Vec<BlockIx>,
}

impl CFGInfo {
  #[inline(never)]
  fn create<F: Function>(func: &F) -> Result<Self, AnalysisError> {
    let num_blocks = func.blocks().into_iter().count() as u32;
    if num_blocks == 0 {
      return Err(AnalysisError::EmptyFunction);
    }
    let in_range = |b: BlockIx| -> Result<BlockIx, AnalysisError> {
      if b.get() < num_blocks {
        Ok(b)
      } else {
        Err(AnalysisError::UnknownBlock(b))
      }
    };

    let mut succ_map = TypedIxVec::<BlockIx, Vec<BlockIx>>::new();
    for b in func.blocks() {
      let mut succs = Vec::new();
      for s in func.block_succs(b) {
        let s = in_range(s)?;
        if !succs.contains(&s) {
          succs.push(s);
        }
      }
      succ_map.push(succs);
    }

    let mut pred_map = TypedIxVec::<BlockIx, Vec<BlockIx>>::new();
    pred_map.resize(num_blocks, vec![]);
    for b in func.blocks() {
      for &s in succ_map[b].iter() {
        pred_map[s].push(b);
      }
    }

    let entry = in_range(func.entry_block())?;

    let mut post_ord = Vec::<BlockIx>::new();
    let mut visited = TypedIxVec::<BlockIx, bool>::new();
    visited.resize(num_blocks, false);

    // Iterative DFS; the second stack element is the next successor to visit.
    let dfs = |root: BlockIx,
                   visited: &mut TypedIxVec<BlockIx, bool>,
                   post_ord: &mut Vec<BlockIx>| {
      let mut stack = vec![(root, 0usize)];
      visited[root] = true;
      while let Some((bix, next)) = stack.pop() {
        if let Some(&succ) = succ_map[bix].get(next) {
          stack.push((bix, next + 1));
          if !visited[succ] {
            visited[succ] = true;
            stack.push((succ, 0));
          }
        } else {
          post_ord.push(bix);
        }
      }
    };

    dfs(entry, &mut visited, &mut post_ord);
    let mut order: Vec<BlockIx> = post_ord.drain(..).rev().collect();

    // Blocks unreachable from the entry still need positions.
    for bix in BlockIx::new(0).dotdot(BlockIx::new(num_blocks)) {
      if !visited[bix] {
        dfs(bix, &mut visited, &mut post_ord);
        order.extend(post_ord.drain(..).rev());
      }
    }
    debug_assert!(order.len() == num_blocks as usize);

    Ok(Self { succ_map, pred_map, order })
  }
}

//=============================================================================
// Interval construction

fn check_phis<F: Function>(
  func: &F, cfg: &CFGInfo,
) -> Result<(), AnalysisError> {
  for b in func.blocks() {
    for iix in func.block_insns(b) {
      let insn = &func.insns()[iix.get() as usize];
      if let Some(ops) = func.phi_operands(insn) {
        for &(pred, _) in ops.iter() {
          if !cfg.pred_map[b].contains(&pred) {
            return Err(AnalysisError::BadPhiPredecessor { block: b, pred });
          }
        }
      }
    }
  }
  Ok(())
}

/// Build the intervals and use lists of `func`.
///
/// Blocks are numbered in reverse postorder, two positions per instruction,
/// merge nodes excluded. Liveness is then propagated backwards over that
/// order in a single pass: a block sees the live-in sets of the successors
/// already visited, so a value only kept alive by a loop back edge is not
/// extended over the loop body.
#[inline(never)]
pub fn run_analysis<F: Function>(func: &F) -> Result<AnalysisInfo, AnalysisError> {
  info!("run_analysis: begin {}", func.func_name());

  let cfg = CFGInfo::create(func)?;
  check_phis(func, &cfg)?;

  let num_blocks = cfg.order.len() as u32;
  let num_insts = func.insns().len() as u32;

  // === Positions ===
  let mut inst_positions = TypedIxVec::<InstIx, Option<Position>>::new();
  inst_positions.resize(num_insts, None);
  let mut block_ranges = TypedIxVec::<BlockIx, BlockRange>::new();
  block_ranges.resize(
    num_blocks,
    BlockRange { from: Position::new(0), to: Position::new(0) },
  );

  let mut counter = Position::new(0);
  for &b in cfg.order.iter() {
    let from = counter;
    for iix in func.block_insns(b) {
      let insn = &func.insns()[iix.get() as usize];
      if func.phi_operands(insn).is_none() {
        inst_positions[iix] = Some(counter);
        counter = counter.next_inst();
      }
    }
    block_ranges[b] = BlockRange { from, to: counter };
    trace!("{:?} spans [{:?}, {:?})", b, from, counter);
  }

  // === Backward liveness ===
  let mut intervals = Map::<VirtualReg, Interval>::default();
  let mut use_contexts = Map::<VirtualReg, UseContext>::default();
  let mut livein = TypedIxVec::<BlockIx, Set<VirtualReg>>::new();
  livein.resize(num_blocks, Set::default());

  for &b in cfg.order.iter().rev() {
    let BlockRange { from, to } = block_ranges[b];
    let edge = block_ranges[b].edge_position();

    let mut live = Set::<VirtualReg>::default();
    for &s in cfg.succ_map[b].iter() {
      live.extend(livein[s].iter().cloned());
    }

    // Merge-node operands flowing along our edges are read on the edge.
    for &s in cfg.succ_map[b].iter() {
      for iix in func.block_insns(s) {
        let insn = &func.insns()[iix.get() as usize];
        if let Some(ops) = func.phi_operands(insn) {
          for &(pred, vreg) in ops.iter() {
            if pred == b {
              live.insert(vreg);
              use_contexts.entry(vreg).or_default().push_backward(edge);
            }
          }
        }
      }
    }

    for &vreg in live.iter() {
      match intervals.get_mut(&vreg) {
        Some(int) => int.add_range(from, to),
        None => {
          intervals.insert(vreg, Interval::new(vreg, from, to));
        }
      }
    }

    let insts: Vec<InstIx> = func.block_insns(b).into_iter().collect();
    let mut phi_defs = vec![];
    for &iix in insts.iter().rev() {
      let insn = &func.insns()[iix.get() as usize];
      let reg_uses = func.get_regs(insn);
      let pos = match inst_positions[iix] {
        Some(pos) => pos,
        None => {
          phi_defs.extend(reg_uses.defined);
          continue;
        }
      };

      if let Some(def) = reg_uses.defined {
        match intervals.get_mut(&def) {
          Some(int) => int.set_from(pos, to),
          None => {
            intervals.insert(def, Interval::new(def, pos, to));
          }
        }
        live.remove(&def);
      }

      for &used in reg_uses.used.iter() {
        match intervals.get_mut(&used) {
          Some(int) => int.add_range(from, pos),
          None => {
            intervals.insert(used, Interval::new(used, from, pos));
          }
        }
        use_contexts.entry(used).or_default().push_backward(pos);
        live.insert(used);
      }
    }

    for def in phi_defs {
      live.remove(&def);
    }

    debug!("{:?} livein {:?}", b, {
      let mut v: Vec<_> = live.iter().cloned().collect();
      v.sort();
      v
    });
    livein[b] = live;
  }

  for uses in use_contexts.values_mut() {
    uses.finish();
  }

  if log::log_enabled!(log::Level::Trace) {
    let mut vregs: Vec<_> = intervals.keys().cloned().collect();
    vregs.sort();
    for vreg in vregs {
      trace!("{:?} uses {:?}", intervals[&vreg], use_contexts.get(&vreg));
    }
  }

  info!("run_analysis: {} intervals", intervals.len());

  Ok(AnalysisInfo {
    intervals,
    use_contexts,
    block_ranges,
    inst_positions,
    livein,
    preds: cfg.pred_map,
    order: cfg.order,
  })
}
