/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Implements fuzzing primitives: well-formed SSA functions out of raw bytes.
//!
//! Every value is defined once. Values defined in the entry block may be
//! read anywhere, since the entry dominates every other block; everything
//! else is only read later in its own block. The entry block is never a
//! branch target, so it has no phis.

use arbitrary::{Arbitrary, Result, Unstructured};

use olive_regalloc::{BlockIx, InstIx, TypedIxVec, VirtualReg};

use crate::test_framework::{self as ir, Block, Callee, Func, Inst, Label};

/// Most arguments a generated call has.
pub const MAX_CALL_ARGS: usize = 3;

/// Registers the fuzz targets allocate with: a call's arguments plus its
/// result, which is what the online allocator needs at the worst point.
pub const NUM_REGS: usize = MAX_CALL_ARGS + 1;

const MAX_BLOCKS: u8 = 8;
const MAX_BLOCK_INSTS: u8 = 24;
const MAX_PHIS: u8 = 3;

/// How a block ends, decided before any block is filled in so that the
/// predecessors of every block are known when its phis are generated.
#[derive(Clone, Copy)]
enum Exit {
  Goto(u32),
  Branch(u32, u32),
  Ret,
}

impl Exit {
  fn targets(self) -> Vec<u32> {
    match self {
      Exit::Goto(target) => vec![target],
      Exit::Branch(target_true, target_false) => vec![target_true, target_false],
      Exit::Ret => vec![],
    }
  }
}

struct FuzzingEnv {
  num_blocks: u32,
  num_virtual_regs: u32,
  /// Values defined in the entry block.
  globals: Vec<VirtualReg>,
  /// Values defined so far in the block being generated.
  locals: Vec<VirtualReg>,
}

impl FuzzingEnv {
  fn label(&self, bix: u32) -> Label {
    Label::Resolved { name: format!("b{}", bix), bix: BlockIx::new(bix) }
  }

  fn def_reg(&mut self) -> VirtualReg {
    let vreg = VirtualReg::new(self.num_virtual_regs);
    self.num_virtual_regs += 1;
    vreg
  }

  fn has_reg(&self) -> bool {
    !self.globals.is_empty() || !self.locals.is_empty()
  }

  fn get_reg(&self, u: &mut Unstructured) -> Result<VirtualReg> {
    debug_assert!(self.has_reg());
    let num_globals = self.globals.len();
    let ix = usize::arbitrary(u)? % (num_globals + self.locals.len());
    Ok(if ix < num_globals { self.globals[ix] } else { self.locals[ix - num_globals] })
  }

  fn get_global(&self, u: &mut Unstructured) -> Result<VirtualReg> {
    debug_assert!(!self.globals.is_empty());
    Ok(self.globals[usize::arbitrary(u)? % self.globals.len()])
  }

  /// Any block but the entry.
  fn target(&self, u: &mut Unstructured) -> Result<u32> {
    Ok(1 + u32::arbitrary(u)? % (self.num_blocks - 1))
  }

  fn exit(&self, bix: u32, u: &mut Unstructured) -> Result<Exit> {
    if bix + 1 == self.num_blocks {
      return Ok(Exit::Ret);
    }
    Ok(match u8::arbitrary(u)? % 3 {
      0 => Exit::Goto(self.target(u)?),
      1 => {
        let target_true = self.target(u)?;
        let target_false = self.target(u)?;
        if target_true == target_false {
          Exit::Goto(target_true)
        } else {
          Exit::Branch(target_true, target_false)
        }
      }
      _ => Exit::Ret,
    })
  }

  fn inst(&mut self, u: &mut Unstructured) -> Result<Inst> {
    use Inst::*;

    const NUM_VARIANTS: u8 = 5;

    if !self.has_reg() {
      let imm = u32::arbitrary(u)?;
      let inst = Imm { dst: self.def_reg(), imm };
      self.locals.extend(inst.get_reg_usage().defined);
      return Ok(inst);
    }

    // Operands are picked before the def is made visible.
    let inst = match u8::arbitrary(u)? % NUM_VARIANTS {
      0 => {
        let imm = u32::arbitrary(u)?;
        Imm { dst: self.def_reg(), imm }
      }
      1 => {
        let src = self.get_reg(u)?;
        Copy { dst: self.def_reg(), src }
      }
      2 => {
        let op = ir::BinOp::arbitrary(u)?;
        let src_left = self.get_reg(u)?;
        let src_right = self.get_reg(u)?;
        BinOp { op, dst: self.def_reg(), src_left, src_right }
      }
      3 => Print { src: self.get_reg(u)? },
      4 => {
        let callee = Callee::arbitrary(u)?;
        let num_args = 1 + usize::arbitrary(u)? % MAX_CALL_ARGS;
        let mut args = Vec::with_capacity(num_args);
        for _ in 0..num_args {
          args.push(self.get_reg(u)?);
        }
        Call { callee, dst: self.def_reg(), args }
      }
      x => {
        debug_assert!(x < NUM_VARIANTS, "update NUM_VARIANTS above");
        unreachable!()
      }
    };
    self.locals.extend(inst.get_reg_usage().defined);
    Ok(inst)
  }

  fn inst_control_flow(&self, exit: Exit, u: &mut Unstructured) -> Result<Inst> {
    Ok(match exit {
      Exit::Goto(target) => Inst::Goto { target: self.label(target) },
      Exit::Branch(target_true, target_false) => Inst::GotoCTF {
        cond: self.get_reg(u)?,
        target_true: self.label(target_true),
        target_false: self.label(target_false),
      },
      Exit::Ret => {
        let src = if bool::arbitrary(u)? { Some(self.get_reg(u)?) } else { None };
        Inst::Ret { src }
      }
    })
  }
}

impl<'a> Arbitrary<'a> for Func {
  fn arbitrary(u: &mut Unstructured<'a>) -> Result<Func> {
    let num_blocks = 1 + (u8::arbitrary(u)? % MAX_BLOCKS) as u32;

    let mut env = FuzzingEnv {
      num_blocks,
      num_virtual_regs: 0,
      globals: vec![],
      locals: vec![],
    };

    let mut exits = Vec::with_capacity(num_blocks as usize);
    for bix in 0..num_blocks {
      exits.push(env.exit(bix, u)?);
    }

    let mut preds = vec![Vec::<u32>::new(); num_blocks as usize];
    for (bix, exit) in exits.iter().enumerate() {
      for target in exit.targets() {
        let preds = &mut preds[target as usize];
        if !preds.contains(&(bix as u32)) {
          preds.push(bix as u32);
        }
      }
    }

    let mut insns = TypedIxVec::new();
    let mut blocks = TypedIxVec::new();

    for (bix, &exit) in exits.iter().enumerate() {
      let start = insns.len();
      env.locals.clear();

      if !preds[bix].is_empty() {
        for _ in 0..(u8::arbitrary(u)? % MAX_PHIS) {
          let mut srcs = vec![];
          for &pred in preds[bix].iter() {
            srcs.push((env.label(pred), env.get_global(u)?));
          }
          let dst = env.def_reg();
          env.locals.push(dst);
          insns.push(Inst::Phi { dst, srcs });
        }
      }

      let num_block_insts = 1 + u8::arbitrary(u)? % MAX_BLOCK_INSTS;
      for _ in 0..num_block_insts {
        let inst = env.inst(u)?;
        insns.push(inst);
      }
      insns.push(env.inst_control_flow(exit, u)?);

      let len = insns.len() - start;
      blocks.push(Block::new(format!("b{}", bix), InstIx::new(start), len));

      if bix == 0 {
        env.globals = std::mem::take(&mut env.locals);
      }
    }

    Ok(Func {
      name: "fuzz".to_string(),
      entry: Some(env.label(0)),
      num_virtual_regs: env.num_virtual_regs,
      insns,
      blocks,
    })
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::validator::validate;

  /// xorshift; only needs to spread the bytes around.
  fn bytes(seed: u32, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2654435761) | 1;
    (0..len)
      .map(|_| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        (state >> 24) as u8
      })
      .collect()
  }

  #[test]
  fn generated_functions_are_valid() {
    for seed in 0..256 {
      let data = bytes(seed, 1024);
      let func = Func::arbitrary(&mut Unstructured::new(&data)).unwrap();
      if let Err(err) = validate(&func) {
        func.print("invalid");
        panic!("seed {}: {}", seed, err);
      }
    }
  }

  #[test]
  fn empty_input_gives_a_trivial_function() {
    let func = Func::arbitrary(&mut Unstructured::new(&[])).unwrap();
    assert_eq!(func.blocks.len(), 1);
    assert_eq!(validate(&func), Ok(()));
  }
}
