/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

/// As part of this set of test cases, we define a mini IR and implement the
/// `Function` trait for it so that we can use the allocators' public
/// interface. The IR is in SSA form: every virtual register has one def, and
/// values meet at the top of a block through `phi`.
use arbitrary::Arbitrary;
use smallvec::SmallVec;

use olive_regalloc::{
  BlockIx, Function, InstIx, InstRegUses, Map, MyRange, RealReg, TypedIxVec,
  VirtualReg,
};

use std::fmt;

//=============================================================================
// Definition of: Label, BinOp, Callee and Inst. Destinations are on the
// left.

#[derive(Clone)]
pub enum Label {
  Unresolved { name: String },
  Resolved { name: String, bix: BlockIx },
}
impl fmt::Debug for Label {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Label::Unresolved { name } => write!(fmt, "??:{}", &name),
      Label::Resolved { name, bix } => write!(fmt, "{:?}:{}", bix, name),
    }
  }
}
impl Label {
  pub fn new_unresolved(name: &str) -> Label {
    Label::Unresolved { name: name.to_string() }
  }
  pub fn block_ix(&self) -> Option<BlockIx> {
    match self {
      Label::Resolved { bix, .. } => Some(*bix),
      Label::Unresolved { .. } => None,
    }
  }
  fn resolve<F>(&mut self, lookup: F) -> Result<(), String>
  where
    F: Fn(&str) -> Option<BlockIx>,
  {
    if let Label::Unresolved { name } = self {
      let name = name.clone();
      let bix =
        lookup(&name).ok_or_else(|| format!("can't resolve label '{}'", name))?;
      *self = Label::Resolved { name, bix };
    }
    Ok(())
  }
}

#[derive(Copy, Clone, PartialEq, Eq, Arbitrary)]
pub enum BinOp {
  Add,
  Sub,
  Mul,
  CmpLt,
}
impl fmt::Debug for BinOp {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(
      fmt,
      "{}",
      match self {
        BinOp::Add => "add",
        BinOp::Sub => "sub",
        BinOp::Mul => "mul",
        BinOp::CmpLt => "cmplt",
      }
    )
  }
}
impl BinOp {
  pub fn calc(self, left: u32, right: u32) -> u32 {
    match self {
      BinOp::Add => left.wrapping_add(right),
      BinOp::Sub => left.wrapping_sub(right),
      BinOp::Mul => left.wrapping_mul(right),
      BinOp::CmpLt => (left < right) as u32,
    }
  }
}

/// Routines a `call` can reach. They only read their arguments.
#[derive(Copy, Clone, PartialEq, Eq, Arbitrary)]
pub enum Callee {
  Sum,
  Max,
}
impl fmt::Debug for Callee {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Callee::Sum => write!(fmt, "sum"),
      Callee::Max => write!(fmt, "max"),
    }
  }
}
impl Callee {
  pub fn call(self, args: &[u32]) -> u32 {
    match self {
      Callee::Sum => args.iter().fold(0u32, |acc, &a| acc.wrapping_add(a)),
      Callee::Max => args.iter().cloned().max().unwrap_or(0),
    }
  }
}

#[derive(Clone)]
pub enum Inst {
  Imm { dst: VirtualReg, imm: u32 },
  Copy { dst: VirtualReg, src: VirtualReg },
  BinOp { op: BinOp, dst: VirtualReg, src_left: VirtualReg, src_right: VirtualReg },
  Phi { dst: VirtualReg, srcs: Vec<(Label, VirtualReg)> },
  Goto { target: Label },
  GotoCTF { cond: VirtualReg, target_true: Label, target_false: Label },
  Print { src: VirtualReg },
  Call { callee: Callee, dst: VirtualReg, args: Vec<VirtualReg> },
  Ret { src: Option<VirtualReg> },
}

pub fn i_imm(dst: VirtualReg, imm: u32) -> Inst {
  Inst::Imm { dst, imm }
}
pub fn i_copy(dst: VirtualReg, src: VirtualReg) -> Inst {
  Inst::Copy { dst, src }
}
pub fn i_add(dst: VirtualReg, src_left: VirtualReg, src_right: VirtualReg) -> Inst {
  Inst::BinOp { op: BinOp::Add, dst, src_left, src_right }
}
pub fn i_sub(dst: VirtualReg, src_left: VirtualReg, src_right: VirtualReg) -> Inst {
  Inst::BinOp { op: BinOp::Sub, dst, src_left, src_right }
}
pub fn i_mul(dst: VirtualReg, src_left: VirtualReg, src_right: VirtualReg) -> Inst {
  Inst::BinOp { op: BinOp::Mul, dst, src_left, src_right }
}
pub fn i_cmp_lt(
  dst: VirtualReg, src_left: VirtualReg, src_right: VirtualReg,
) -> Inst {
  Inst::BinOp { op: BinOp::CmpLt, dst, src_left, src_right }
}
pub fn i_phi(dst: VirtualReg, srcs: &[(&str, VirtualReg)]) -> Inst {
  Inst::Phi {
    dst,
    srcs: srcs.iter().map(|&(name, src)| (Label::new_unresolved(name), src)).collect(),
  }
}
pub fn i_goto(target: &str) -> Inst {
  Inst::Goto { target: Label::new_unresolved(target) }
}
pub fn i_goto_ctf(cond: VirtualReg, target_true: &str, target_false: &str) -> Inst {
  Inst::GotoCTF {
    cond,
    target_true: Label::new_unresolved(target_true),
    target_false: Label::new_unresolved(target_false),
  }
}
pub fn i_print(src: VirtualReg) -> Inst {
  Inst::Print { src }
}
pub fn i_call(callee: Callee, dst: VirtualReg, args: &[VirtualReg]) -> Inst {
  Inst::Call { callee, dst, args: args.to_vec() }
}
pub fn i_ret(src: Option<VirtualReg>) -> Inst {
  Inst::Ret { src }
}

impl fmt::Debug for Inst {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    fn ljustify(s: String, w: usize) -> String {
      if s.len() >= w {
        s
      } else {
        let mut s = s;
        while s.len() < w {
          s.push(' ');
        }
        s
      }
    }
    match self {
      Inst::Imm { dst, imm } => write!(fmt, "imm     {:?}, {}", dst, imm),
      Inst::Copy { dst, src } => write!(fmt, "copy    {:?}, {:?}", dst, src),
      Inst::BinOp { op, dst, src_left, src_right } => write!(
        fmt,
        "{} {:?}, {:?}, {:?}",
        ljustify(format!("{:?}", op), 7),
        dst,
        src_left,
        src_right
      ),
      Inst::Phi { dst, srcs } => write!(fmt, "phi     {:?}, {:?}", dst, srcs),
      Inst::Goto { target } => write!(fmt, "goto    {:?}", target),
      Inst::GotoCTF { cond, target_true, target_false } => write!(
        fmt,
        "if ({:?}) goto {:?} else goto {:?}",
        cond, target_true, target_false
      ),
      Inst::Print { src } => write!(fmt, "print   {:?}", src),
      Inst::Call { callee, dst, args } => write!(
        fmt,
        "{:?} = call {:?}{:?}",
        dst, callee, args
      ),
      Inst::Ret { src: Some(src) } => write!(fmt, "ret     {:?}", src),
      Inst::Ret { src: None } => write!(fmt, "ret"),
    }
  }
}

impl Inst {
  pub fn is_control_flow(&self) -> bool {
    match self {
      Inst::Goto { .. } | Inst::GotoCTF { .. } | Inst::Ret { .. } => true,
      _ => false,
    }
  }

  pub fn is_phi(&self) -> bool {
    match self {
      Inst::Phi { .. } => true,
      _ => false,
    }
  }

  /// The registers this instruction reads and writes. A phi's operands are
  /// read on the incoming edges, not here.
  pub fn get_reg_usage(&self) -> InstRegUses {
    let mut ret = InstRegUses::default();
    match self {
      Inst::Imm { dst, .. } => ret.defined = Some(*dst),
      Inst::Copy { dst, src } => {
        ret.defined = Some(*dst);
        ret.used.push(*src);
      }
      Inst::BinOp { dst, src_left, src_right, .. } => {
        ret.defined = Some(*dst);
        ret.used.push(*src_left);
        ret.used.push(*src_right);
      }
      Inst::Phi { dst, .. } => ret.defined = Some(*dst),
      Inst::Goto { .. } => {}
      Inst::GotoCTF { cond, .. } => ret.used.push(*cond),
      Inst::Print { src } => ret.used.push(*src),
      Inst::Call { dst, args, .. } => {
        ret.defined = Some(*dst);
        ret.used.extend(args.iter().cloned());
      }
      Inst::Ret { src } => ret.used.extend(src.iter().cloned()),
    }
    ret
  }

  pub fn targets(&self) -> Vec<&Label> {
    match self {
      Inst::Goto { target } => vec![target],
      Inst::GotoCTF { target_true, target_false, .. } => {
        vec![target_true, target_false]
      }
      _ => vec![],
    }
  }

  fn labels_mut(&mut self) -> Vec<&mut Label> {
    match self {
      Inst::Goto { target } => vec![target],
      Inst::GotoCTF { target_true, target_false, .. } => {
        vec![target_true, target_false]
      }
      Inst::Phi { srcs, .. } => srcs.iter_mut().map(|(label, _)| label).collect(),
      _ => vec![],
    }
  }
}

//=============================================================================
// Definition of Block and Func, and printing thereof.

#[derive(Clone, Debug)]
pub struct Block {
  pub name: String,
  pub start: InstIx,
  pub len: u32,
}
impl Block {
  pub fn new(name: String, start: InstIx, len: u32) -> Self {
    Self { name, start, len }
  }
}

#[derive(Clone, Debug)]
pub struct Func {
  pub name: String,
  pub entry: Option<Label>,
  pub num_virtual_regs: u32,
  pub insns: TypedIxVec<InstIx, Inst>,

  // Blocks are in order of increasing `Block::start`; together they cover
  // `insns` exactly.
  pub blocks: TypedIxVec<BlockIx, Block>,
}

impl Func {
  pub fn new(name: &str) -> Self {
    Func {
      name: name.to_string(),
      entry: None,
      num_virtual_regs: 0,
      insns: TypedIxVec::new(),
      blocks: TypedIxVec::new(),
    }
  }

  pub fn set_entry(&mut self, name: &str) {
    self.entry = Some(Label::new_unresolved(name));
  }

  // Get a new VirtualReg name
  pub fn new_virtual_reg(&mut self) -> VirtualReg {
    let v = VirtualReg::new(self.num_virtual_regs);
    self.num_virtual_regs += 1;
    v
  }

  // Add a block to the Func
  pub fn block(&mut self, name: &str, insns: Vec<Inst>) {
    let start = self.insns.len();
    let len = insns.len() as u32;
    for insn in insns {
      self.insns.push(insn);
    }
    self.blocks.push(Block::new(name.to_string(), InstIx::new(start), len));
  }

  /// All blocks have been added: resolve the labels.
  pub fn finish(&mut self) -> Result<(), String> {
    let names: Map<String, BlockIx> = self
      .blocks()
      .into_iter()
      .map(|bix| (self.blocks[bix].name.clone(), bix))
      .collect();
    let lookup = |name: &str| names.get(name).cloned();
    for insn in self.insns.iter_mut() {
      for label in insn.labels_mut() {
        label.resolve(lookup)?;
      }
    }
    match self.entry.as_mut() {
      Some(entry) => entry.resolve(lookup),
      None => Err("missing entry label".to_string()),
    }
  }

  /// Whether running the blocks in layout order is the same as following
  /// the control flow: every block returns or falls through to the next, and
  /// nothing merges.
  pub fn runs_in_emission_order(&self) -> bool {
    self.blocks().into_iter().all(|bix| {
      self.block_insns(bix).into_iter().all(|iix| match &self.insns[iix] {
        Inst::Phi { .. } | Inst::GotoCTF { .. } => false,
        Inst::Goto { target } => target.block_ix() == Some(bix.plus(1)),
        _ => true,
      })
    })
  }

  pub fn print(&self, who: &str) {
    println!("");
    println!("Func {}: name='{}' entry='{:?}' {{", who, self.name, self.entry);
    for bix in self.blocks() {
      let b = &self.blocks[bix];
      if bix.get() > 0 {
        println!("");
      }
      println!("  {:?}:{}", bix, b.name);
      for iix in b.start.dotdot(b.start.plus(b.len)) {
        println!("      {:<3?}   {:?}", iix, self.insns[iix]);
      }
    }
    println!("}}");
  }
}

impl Function for Func {
  type Inst = Inst;

  fn insns(&self) -> &[Inst] {
    self.insns.as_slice()
  }

  fn blocks(&self) -> MyRange<BlockIx> {
    BlockIx::new(0).dotdot(BlockIx::new(self.blocks.len()))
  }

  fn entry_block(&self) -> BlockIx {
    self.entry.as_ref().and_then(|label| label.block_ix()).unwrap_or(BlockIx::new(0))
  }

  fn block_insns(&self, block: BlockIx) -> MyRange<InstIx> {
    let b = &self.blocks[block];
    b.start.dotdot(b.start.plus(b.len))
  }

  fn block_succs(&self, block: BlockIx) -> Vec<BlockIx> {
    let b = &self.blocks[block];
    if b.len == 0 {
      return vec![];
    }
    let last = &self.insns[b.start.plus(b.len - 1)];
    last.targets().iter().filter_map(|label| label.block_ix()).collect()
  }

  fn get_regs(&self, insn: &Inst) -> InstRegUses {
    insn.get_reg_usage()
  }

  fn phi_operands(
    &self, insn: &Inst,
  ) -> Option<SmallVec<[(BlockIx, VirtualReg); 2]>> {
    match insn {
      Inst::Phi { srcs, .. } => Some(
        srcs
          .iter()
          .filter_map(|(label, src)| label.block_ix().map(|bix| (bix, *src)))
          .collect(),
      ),
      _ => None,
    }
  }

  fn func_name(&self) -> String {
    self.name.clone()
  }
}

//=============================================================================
// The interpreter

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunResult {
  pub num_steps: u32,
  pub stdout: String,
  pub ret_value: Option<u32>,
}

/// Generated functions may loop forever.
pub const MAX_STEPS: u32 = 100_000;

struct IState<'a> {
  func: &'a Func,
  vregs: Map<VirtualReg, u32>,
  num_steps: u32,
  stdout: String,
}

impl<'a> IState<'a> {
  fn get(&self, vreg: VirtualReg) -> Result<u32, String> {
    self
      .vregs
      .get(&vreg)
      .cloned()
      .ok_or_else(|| format!("use of undefined {:?}", vreg))
  }

  fn tick(&mut self) -> Result<(), String> {
    self.num_steps += 1;
    if self.num_steps > MAX_STEPS {
      return Err(format!("more than {} steps", MAX_STEPS));
    }
    Ok(())
  }

  fn jump(&self, label: &Label) -> Result<BlockIx, String> {
    label.block_ix().ok_or_else(|| format!("unresolved label {:?}", label))
  }

  /// Run `bix`, entered from `pred`. Returns the next block, or the return
  /// value.
  fn run_block(
    &mut self, bix: BlockIx, pred: Option<BlockIx>,
  ) -> Result<Result<BlockIx, Option<u32>>, String> {
    let func = self.func;

    // All phis read their operands before any of them writes.
    let mut merged = vec![];
    for iix in func.block_insns(bix) {
      if let Inst::Phi { dst, srcs } = &func.insns[iix] {
        let pred = pred.ok_or_else(|| format!("phi in entry block {:?}", bix))?;
        let src = srcs
          .iter()
          .find(|(label, _)| label.block_ix() == Some(pred))
          .map(|(_, src)| *src)
          .ok_or_else(|| format!("{:?} has no operand for {:?}", dst, pred))?;
        merged.push((*dst, self.get(src)?));
      }
    }
    for (dst, value) in merged {
      self.vregs.insert(dst, value);
    }

    for iix in func.block_insns(bix) {
      let insn = &func.insns[iix];
      if insn.is_phi() {
        continue;
      }
      self.tick()?;
      match insn {
        Inst::Imm { dst, imm } => {
          self.vregs.insert(*dst, *imm);
        }
        Inst::Copy { dst, src } => {
          let value = self.get(*src)?;
          self.vregs.insert(*dst, value);
        }
        Inst::BinOp { op, dst, src_left, src_right } => {
          let value = op.calc(self.get(*src_left)?, self.get(*src_right)?);
          self.vregs.insert(*dst, value);
        }
        Inst::Phi { .. } => {}
        Inst::Goto { target } => return Ok(Ok(self.jump(target)?)),
        Inst::GotoCTF { cond, target_true, target_false } => {
          let target = if self.get(*cond)? != 0 { target_true } else { target_false };
          return Ok(Ok(self.jump(target)?));
        }
        Inst::Print { src } => {
          let value = self.get(*src)?;
          self.stdout.push_str(&format!("{}\n", value));
        }
        Inst::Call { callee, dst, args } => {
          let args = args.iter().map(|&a| self.get(a)).collect::<Result<Vec<_>, _>>()?;
          self.vregs.insert(*dst, callee.call(&args));
        }
        Inst::Ret { src } => {
          let value = match src {
            Some(src) => Some(self.get(*src)?),
            None => None,
          };
          return Ok(Err(value));
        }
      }
    }
    Err(format!("fell off the end of {:?}", bix))
  }
}

/// Run `func` on the virtual registers.
pub fn run_func(func: &Func, who: &str) -> Result<RunResult, String> {
  println!("");
  println!("Running stage '{}': Func: name='{}' entry='{:?}'", who, func.name, func.entry);

  let mut bix = func
    .entry
    .as_ref()
    .and_then(|label| label.block_ix())
    .ok_or_else(|| "missing entry label".to_string())?;
  let mut istate =
    IState { func, vregs: Map::default(), num_steps: 0, stdout: String::new() };
  let mut pred = None;
  let ret_value = loop {
    match istate.run_block(bix, pred)? {
      Ok(next) => {
        pred = Some(bix);
        bix = next;
      }
      Err(value) => break value,
    }
  };

  println!("Running stage '{}': done.  {} insns", who, istate.num_steps);
  Ok(RunResult { num_steps: istate.num_steps, stdout: istate.stdout, ret_value })
}

//=============================================================================
// Machine code, as produced by the emitter

/// Offsets are relative to the frame pointer and negative.
#[derive(Clone, PartialEq, Eq)]
pub enum MInst {
  Label { label: u32 },
  Imm { dst: RealReg, imm: u32 },
  Copy { dst: RealReg, src: RealReg },
  BinOp { op: BinOp, dst: RealReg, src_left: RealReg, src_right: RealReg },
  /// The value merged into a block. Only meaningful along a real edge.
  Phi { dst: RealReg },
  Goto { label: u32 },
  GotoCTF { cond: RealReg, label_true: u32, label_false: u32 },
  Print { src: RealReg },
  Call { callee: Callee, dst: RealReg, args: Vec<RealReg> },
  Ret { src: Option<RealReg> },
  Spill { offset: i32, src: RealReg },
  Reload { dst: RealReg, offset: i32 },
}

impl fmt::Debug for MInst {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      MInst::Label { label } => write!(fmt, ".L{}:", label),
      MInst::Imm { dst, imm } => write!(fmt, "    mov   {:?}, ${}", dst, imm),
      MInst::Copy { dst, src } => write!(fmt, "    mov   {:?}, {:?}", dst, src),
      MInst::BinOp { op, dst, src_left, src_right } => write!(
        fmt,
        "    {:<5?} {:?}, {:?}, {:?}",
        op, dst, src_left, src_right
      ),
      MInst::Phi { dst } => write!(fmt, "    phi   {:?}", dst),
      MInst::Goto { label } => write!(fmt, "    jmp   .L{}", label),
      MInst::GotoCTF { cond, label_true, label_false } => write!(
        fmt,
        "    jnz   {:?}, .L{}, .L{}",
        cond, label_true, label_false
      ),
      MInst::Print { src } => write!(fmt, "    print {:?}", src),
      MInst::Call { callee, dst, args } => {
        write!(fmt, "    call  {:?}, {:?}{:?}", dst, callee, args)
      }
      MInst::Ret { src: Some(src) } => write!(fmt, "    ret   {:?}", src),
      MInst::Ret { src: None } => write!(fmt, "    ret"),
      MInst::Spill { offset, src } => write!(fmt, "    store [fp{}], {:?}", offset, src),
      MInst::Reload { dst, offset } => write!(fmt, "    load  {:?}, [fp{}]", dst, offset),
    }
  }
}

/// Run machine code produced by the online allocator. The allocator carries
/// its state through the code in emission order, so the result only agrees
/// with `run_func` when control flows that way too; merge nodes can't be
/// run at all.
pub fn run_machine(
  code: &[MInst], num_regs: usize, who: &str,
) -> Result<RunResult, String> {
  println!("");
  println!("Running stage '{}': {} machine insns", who, code.len());

  let labels: Map<u32, usize> = code
    .iter()
    .enumerate()
    .filter_map(|(ix, minst)| match minst {
      MInst::Label { label } => Some((*label, ix)),
      _ => None,
    })
    .collect();
  let target = |label: &u32| {
    labels.get(label).cloned().ok_or_else(|| format!("unknown label .L{}", label))
  };

  let mut regs: Vec<Option<u32>> = vec![None; num_regs];
  let mut stack = Map::<i32, u32>::default();
  let mut stdout = String::new();
  let mut num_steps = 0;
  let mut pc = 0;

  fn get(regs: &[Option<u32>], reg: RealReg) -> Result<u32, String> {
    regs
      .get(reg.get_index())
      .cloned()
      .flatten()
      .ok_or_else(|| format!("read of unset register {:?}", reg))
  }
  fn set(regs: &mut [Option<u32>], reg: RealReg, value: u32) -> Result<(), String> {
    let slot = regs
      .get_mut(reg.get_index())
      .ok_or_else(|| format!("no register {:?}", reg))?;
    *slot = Some(value);
    Ok(())
  }

  let ret_value = loop {
    let minst = code.get(pc).ok_or_else(|| "fell off the end of the code".to_string())?;
    pc += 1;
    if let MInst::Label { .. } = minst {
      continue;
    }
    num_steps += 1;
    if num_steps > MAX_STEPS {
      return Err(format!("more than {} steps", MAX_STEPS));
    }
    match minst {
      MInst::Label { .. } => {}
      MInst::Imm { dst, imm } => set(&mut regs, *dst, *imm)?,
      MInst::Copy { dst, src } => {
        let value = get(&regs, *src)?;
        set(&mut regs, *dst, value)?
      }
      MInst::BinOp { op, dst, src_left, src_right } => {
        let value = op.calc(get(&regs, *src_left)?, get(&regs, *src_right)?);
        set(&mut regs, *dst, value)?
      }
      MInst::Phi { dst } => {
        return Err(format!("can't run the merge into {:?}", dst));
      }
      MInst::Goto { label } => pc = target(label)?,
      MInst::GotoCTF { cond, label_true, label_false } => {
        pc = if get(&regs, *cond)? != 0 {
          target(label_true)?
        } else {
          target(label_false)?
        }
      }
      MInst::Print { src } => {
        let value = get(&regs, *src)?;
        stdout.push_str(&format!("{}\n", value));
      }
      MInst::Call { callee, dst, args } => {
        let args =
          args.iter().map(|&a| get(&regs, a)).collect::<Result<Vec<_>, _>>()?;
        set(&mut regs, *dst, callee.call(&args))?
      }
      MInst::Ret { src } => {
        break match src {
          Some(src) => Some(get(&regs, *src)?),
          None => None,
        };
      }
      MInst::Spill { offset, src } => {
        let value = get(&regs, *src)?;
        stack.insert(*offset, value);
      }
      MInst::Reload { dst, offset } => {
        let value = stack
          .get(offset)
          .cloned()
          .ok_or_else(|| format!("reload from unwritten [fp{}]", offset))?;
        set(&mut regs, *dst, value)?
      }
    }
  };

  println!("Running stage '{}': done.  {} insns", who, num_steps);
  Ok(RunResult { num_steps, stdout, ret_value })
}

#[cfg(test)]
mod test {
  use super::*;

  fn v(n: u32) -> VirtualReg {
    VirtualReg::new(n)
  }

  #[test]
  fn interpreter_merges_along_the_taken_edge() {
    let mut func = Func::new("merge");
    func.set_entry("start");
    func.block(
      "start",
      vec![i_imm(v(0), 3), i_imm(v(1), 4), i_cmp_lt(v(2), v(0), v(1)), i_goto_ctf(v(2), "yes", "no")],
    );
    func.block("yes", vec![i_add(v(3), v(0), v(1)), i_goto("join")]);
    func.block("no", vec![i_mul(v(4), v(0), v(1)), i_goto("join")]);
    func.block(
      "join",
      vec![i_phi(v(5), &[("yes", v(3)), ("no", v(4))]), i_print(v(5)), i_ret(Some(v(5)))],
    );
    func.num_virtual_regs = 6;
    func.finish().unwrap();

    let result = run_func(&func, "test").unwrap();
    assert_eq!(result.ret_value, Some(7));
    assert_eq!(result.stdout, "7\n");
    assert_eq!(result.num_steps, 8);
    assert_eq!(func.block_succs(BlockIx::new(0)), vec![BlockIx::new(1), BlockIx::new(2)]);
  }

  #[test]
  fn unknown_label_is_an_error() {
    let mut func = Func::new("bad");
    func.set_entry("start");
    func.block("start", vec![i_goto("nowhere")]);
    assert!(func.finish().is_err());
  }

  #[test]
  fn machine_spill_and_reload() {
    let r = RealReg::new;
    let code = vec![
      MInst::Label { label: 0 },
      MInst::Imm { dst: r(0), imm: 5 },
      MInst::Spill { offset: -4, src: r(0) },
      MInst::Imm { dst: r(0), imm: 6 },
      MInst::Reload { dst: r(1), offset: -4 },
      MInst::BinOp { op: BinOp::Sub, dst: r(0), src_left: r(0), src_right: r(1) },
      MInst::Ret { src: Some(r(0)) },
    ];
    let result = run_machine(&code, 2, "test").unwrap();
    assert_eq!(result.ret_value, Some(1));
    assert_eq!(result.num_steps, 6);
  }

  #[test]
  fn machine_rejects_unset_registers() {
    let code = vec![MInst::Ret { src: Some(RealReg::new(1)) }];
    assert!(run_machine(&code, 2, "test").is_err());
  }
}
