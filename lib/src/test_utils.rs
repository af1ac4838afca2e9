/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! A minimal `Function` for the unit tests.

use smallvec::SmallVec;

use crate::data_structures::{BlockIx, InstIx, MyRange, VirtualReg};
use crate::interface::{Function, InstRegUses};

#[derive(Clone, Debug)]
pub struct TestInst {
  pub def: Option<u32>,
  pub uses: Vec<u32>,
  pub phi: Option<Vec<(u32, u32)>>,
}

/// `v<def> = op v<uses..>`
pub fn op(def: Option<u32>, uses: &[u32]) -> TestInst {
  TestInst { def, uses: uses.to_vec(), phi: None }
}

/// `v<def> = phi [(block, vreg), ..]`
pub fn phi(def: u32, ops: &[(u32, u32)]) -> TestInst {
  TestInst { def: Some(def), uses: vec![], phi: Some(ops.to_vec()) }
}

pub struct TestFunc {
  insts: Vec<TestInst>,
  blocks: Vec<(u32, u32, Vec<BlockIx>)>,
}

impl TestFunc {
  pub fn new() -> Self {
    Self { insts: vec![], blocks: vec![] }
  }

  pub fn block(mut self, insts: Vec<TestInst>, succs: &[u32]) -> Self {
    let start = self.insts.len() as u32;
    self.insts.extend(insts);
    let end = self.insts.len() as u32;
    self.blocks.push((start, end, succs.iter().map(|&b| BlockIx::new(b)).collect()));
    self
  }
}

impl Function for TestFunc {
  type Inst = TestInst;

  fn insns(&self) -> &[TestInst] {
    &self.insts
  }

  fn blocks(&self) -> MyRange<BlockIx> {
    BlockIx::new(0).dotdot(BlockIx::new(self.blocks.len() as u32))
  }

  fn entry_block(&self) -> BlockIx {
    BlockIx::new(0)
  }

  fn block_insns(&self, block: BlockIx) -> MyRange<InstIx> {
    let (start, end, _) = self.blocks[block.get() as usize];
    InstIx::new(start).dotdot(InstIx::new(end))
  }

  fn block_succs(&self, block: BlockIx) -> Vec<BlockIx> {
    self.blocks[block.get() as usize].2.clone()
  }

  fn get_regs(&self, insn: &TestInst) -> InstRegUses {
    InstRegUses {
      defined: insn.def.map(VirtualReg::new),
      used: insn.uses.iter().map(|&u| VirtualReg::new(u)).collect(),
    }
  }

  fn phi_operands(
    &self, insn: &TestInst,
  ) -> Option<SmallVec<[(BlockIx, VirtualReg); 2]>> {
    insn.phi.as_ref().map(|ops| {
      ops.iter().map(|&(b, v)| (BlockIx::new(b), VirtualReg::new(v))).collect()
    })
  }
}
