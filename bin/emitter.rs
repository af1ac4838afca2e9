/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Single-pass code emission driving the online allocator.
//!
//! Instructions are emitted in layout order. Each one gets an even
//! position; before emitting it, its operands and then its def are given
//! registers, and any spill or reload the allocator needs is emitted in
//! front of it.

use log::{debug, info, trace};

use olive_regalloc::{
  Checker, CheckerInst, Function, LiveRange, Map, Options, Position, RealReg,
  RegAllocError, SimpleRegisterAllocator, SpillContext, SpillSlot, VirtualReg,
};

use std::fmt;

use crate::test_framework::{Func, Inst, Label, MInst};

/// Bytes per spill slot.
pub const SLOT_SIZE: u32 = 4;

//=============================================================================
// The compilation session

/// State shared by all the functions of one program: the function and label
/// counters and the table of global names. Lives as long as the compilation.
#[derive(Default)]
pub struct Session {
  next_function_id: u32,
  next_label_id: u32,
  globals: Map<String, u32>,
}

impl Session {
  pub fn new() -> Self {
    Self::default()
  }

  /// Enter `name` in the global table and give it the next function ID.
  pub fn declare_function(&mut self, name: &str) -> Result<u32, EmitError> {
    if self.globals.contains_key(name) {
      return Err(EmitError::DuplicateFunction(name.to_string()));
    }
    let id = self.next_function_id;
    self.next_function_id += 1;
    self.globals.insert(name.to_string(), id);
    Ok(id)
  }

  pub fn global(&self, name: &str) -> Option<u32> {
    self.globals.get(name).cloned()
  }

  pub fn num_functions(&self) -> u32 {
    self.next_function_id
  }

  /// Labels are unique across the whole program.
  pub fn new_label(&mut self) -> u32 {
    let label = self.next_label_id;
    self.next_label_id += 1;
    label
  }
}

//=============================================================================
// Errors and results

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EmitError {
  DuplicateFunction(String),
  UnresolvedLabel(String),
  RegAlloc(RegAllocError),
}

impl fmt::Display for EmitError {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      EmitError::DuplicateFunction(name) => {
        write!(fmt, "function '{}' is defined twice", name)
      }
      EmitError::UnresolvedLabel(label) => {
        write!(fmt, "unresolved label {}", label)
      }
      EmitError::RegAlloc(err) => write!(fmt, "{}", err),
    }
  }
}

impl std::error::Error for EmitError {}

impl From<RegAllocError> for EmitError {
  fn from(err: RegAllocError) -> Self {
    EmitError::RegAlloc(err)
  }
}

pub struct MachineFunc {
  pub name: String,
  pub id: u32,
  pub code: Vec<MInst>,
  /// Bytes of spill storage below the frame pointer.
  pub frame_size: u32,
  pub num_spills: u32,
  pub num_reloads: u32,
}

impl MachineFunc {
  pub fn print(&self, who: &str) {
    println!("");
    println!(
      "MachineFunc {}: name='{}' id={} frame={} {{",
      who, self.name, self.id, self.frame_size
    );
    for minst in self.code.iter() {
      println!("{:?}", minst);
    }
    println!("}}");
  }
}

//=============================================================================
// Liveness

/// The position of the instruction at `ix` in layout order.
fn position_of(ix: u32) -> Position {
  Position::new(ix * Position::STRIDE)
}

/// One range per value, from its first def or use to its last use, with the
/// uses as inner points. A phi's operands are not read in the block stream
/// and add nothing.
pub fn compute_liveness(func: &Func) -> Map<VirtualReg, LiveRange> {
  let mut seen = Map::<VirtualReg, (Position, Vec<Position>)>::default();
  for (ix, insn) in func.insns.iter().enumerate() {
    let pos = position_of(ix as u32);
    let reg_uses = insn.get_reg_usage();
    for &used in reg_uses.used.iter() {
      let entry = seen.entry(used).or_insert((pos, vec![]));
      if entry.1.last() != Some(&pos) {
        entry.1.push(pos);
      }
    }
    if let Some(def) = reg_uses.defined {
      seen.entry(def).or_insert((pos, vec![]));
    }
  }

  seen
    .into_iter()
    .map(|(vreg, (start, uses))| {
      let end = uses.last().cloned().unwrap_or(start);
      (vreg, LiveRange::with_uses(start, end, &uses))
    })
    .collect()
}

//=============================================================================
// The frame: spill storage and the output stream

struct Frame {
  code: Vec<MInst>,
  checker: Checker,
  /// Offset of each spill slot, indexed by slot number.
  offsets: Vec<i32>,
  frame_size: u32,
  num_reloads: u32,
}

impl SpillContext for Frame {
  fn create_spill(&mut self, from_reg: RealReg, vreg: VirtualReg) -> SpillSlot {
    self.frame_size += SLOT_SIZE;
    let offset = -(self.frame_size as i32);
    let slot = SpillSlot::new(self.offsets.len() as u32);
    self.offsets.push(offset);
    trace!("emit: spill {:?} from {:?} to [fp{}]", vreg, from_reg, offset);
    self.code.push(MInst::Spill { offset, src: from_reg });
    self.checker.push(CheckerInst::Spill { into_slot: slot, from_reg });
    slot
  }

  fn restore_spill(&mut self, to_reg: RealReg, slot: SpillSlot, vreg: VirtualReg) {
    let offset = self.offsets[slot.get() as usize];
    trace!("emit: reload {:?} from [fp{}] into {:?}", vreg, offset, to_reg);
    self.num_reloads += 1;
    self.code.push(MInst::Reload { dst: to_reg, offset });
    self.checker.push(CheckerInst::Reload { into_reg: to_reg, from_slot: slot });
  }
}

//=============================================================================
// Emission

struct Emitter<'a> {
  ra: SimpleRegisterAllocator,
  frame: Frame,
  labels: &'a [u32],
}

impl<'a> Emitter<'a> {
  fn reg(&mut self, vreg: VirtualReg, pos: Position) -> Result<RealReg, EmitError> {
    Ok(self.ra.allocate(&mut self.frame, vreg, pos)?)
  }

  fn label(&self, label: &Label) -> Result<u32, EmitError> {
    label
      .block_ix()
      .map(|bix| self.labels[bix.get() as usize])
      .ok_or_else(|| EmitError::UnresolvedLabel(format!("{:?}", label)))
  }

  fn op(&mut self, minst: MInst, uses: Vec<(VirtualReg, RealReg)>, def: Option<(VirtualReg, RealReg)>) {
    self.frame.code.push(minst);
    self.frame.checker.push(CheckerInst::Op { uses, def });
  }

  fn emit(&mut self, insn: &Inst, pos: Position) -> Result<(), EmitError> {
    self.ra.clear_nospills();
    match insn {
      Inst::Imm { dst, imm } => {
        let d = self.reg(*dst, pos)?;
        self.op(MInst::Imm { dst: d, imm: *imm }, vec![], Some((*dst, d)));
      }
      Inst::Copy { dst, src } => {
        let s = self.reg(*src, pos)?;
        let d = self.reg(*dst, pos)?;
        self.op(MInst::Copy { dst: d, src: s }, vec![(*src, s)], Some((*dst, d)));
      }
      Inst::BinOp { op, dst, src_left, src_right } => {
        let l = self.reg(*src_left, pos)?;
        let r = self.reg(*src_right, pos)?;
        let d = self.reg(*dst, pos)?;
        self.op(
          MInst::BinOp { op: *op, dst: d, src_left: l, src_right: r },
          vec![(*src_left, l), (*src_right, r)],
          Some((*dst, d)),
        );
      }
      Inst::Phi { dst, .. } => {
        let d = self.reg(*dst, pos)?;
        self.op(MInst::Phi { dst: d }, vec![], Some((*dst, d)));
      }
      Inst::Goto { target } => {
        let label = self.label(target)?;
        self.frame.code.push(MInst::Goto { label });
      }
      Inst::GotoCTF { cond, target_true, target_false } => {
        let label_true = self.label(target_true)?;
        let label_false = self.label(target_false)?;
        let c = self.reg(*cond, pos)?;
        self.op(
          MInst::GotoCTF { cond: c, label_true, label_false },
          vec![(*cond, c)],
          None,
        );
      }
      Inst::Print { src } => {
        let s = self.reg(*src, pos)?;
        self.op(MInst::Print { src: s }, vec![(*src, s)], None);
      }
      Inst::Call { callee, dst, args } => {
        // Argument setup: the call registers are held back until the
        // arguments are in place.
        self.ra.disable_spill();
        let mut arg_regs = vec![];
        let mut setup = Ok(());
        for &arg in args.iter() {
          match self.ra.allocate(&mut self.frame, arg, pos) {
            Ok(reg) => arg_regs.push(reg),
            Err(err) => {
              setup = Err(err);
              break;
            }
          }
        }
        self.ra.enable_spill();
        setup?;

        let d = self.reg(*dst, pos)?;
        let uses = args.iter().cloned().zip(arg_regs.iter().cloned()).collect();
        self.op(
          MInst::Call { callee: *callee, dst: d, args: arg_regs },
          uses,
          Some((*dst, d)),
        );
      }
      Inst::Ret { src } => {
        let s = match src {
          Some(src) => Some(self.reg(*src, pos)?),
          None => None,
        };
        let uses = src.iter().cloned().zip(s.iter().cloned()).collect();
        self.op(MInst::Ret { src: s }, uses, None);
      }
    }
    Ok(())
  }
}

/// Emit `func` with the online allocator. With `opts.run_checker` the
/// emitted stream is checked before it is returned.
#[inline(never)]
pub fn emit_func(
  session: &mut Session, func: &Func, opts: &Options,
) -> Result<MachineFunc, EmitError> {
  info!("emit_func: {} with {} registers", func.name, opts.num_regs);

  let id = session.declare_function(&func.name)?;
  let labels: Vec<u32> = func.blocks().into_iter().map(|_| session.new_label()).collect();

  let mut ra = SimpleRegisterAllocator::new(opts)?;
  for (vreg, range) in compute_liveness(func) {
    trace!("emit: {:?} live {:?}", vreg, range);
    ra.set_liveness(vreg, range);
  }

  let frame = Frame {
    code: vec![],
    checker: Checker::new(),
    offsets: vec![],
    frame_size: 0,
    num_reloads: 0,
  };
  let mut emitter = Emitter { ra, frame, labels: &labels };

  for bix in func.blocks() {
    emitter.frame.code.push(MInst::Label { label: labels[bix.get() as usize] });
    for iix in func.block_insns(bix) {
      let pos = position_of(iix.get());
      emitter.emit(&func.insns[iix], pos)?;
    }
  }

  let Frame { code, checker, offsets, frame_size, num_reloads } = emitter.frame;

  if opts.run_checker {
    checker
      .run()
      .map_err(|errs| RegAllocError::Checker(format!("{:?}", errs)))?;
  }

  debug!(
    "emit_func: {} done, {} insns, {} spills, {} reloads",
    func.name,
    code.len(),
    offsets.len(),
    num_reloads
  );
  Ok(MachineFunc {
    name: func.name.clone(),
    id,
    code,
    frame_size,
    num_spills: offsets.len() as u32,
    num_reloads,
  })
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::test_framework::*;

  fn v(n: u32) -> VirtualReg {
    VirtualReg::new(n)
  }

  fn p(n: u32) -> Position {
    Position::new(n)
  }

  fn tiny(name: &str) -> Func {
    let mut func = Func::new(name);
    func.set_entry("start");
    let a = func.new_virtual_reg();
    let b = func.new_virtual_reg();
    let c = func.new_virtual_reg();
    func.block(
      "start",
      vec![i_imm(a, 1), i_imm(b, 2), i_add(c, a, b), i_print(c), i_ret(Some(a))],
    );
    func.finish().unwrap();
    func
  }

  #[test]
  fn liveness_runs_from_def_to_last_use() {
    let live = compute_liveness(&tiny("f"));
    assert_eq!((live[&v(0)].start, live[&v(0)].end), (p(0), p(8)));
    assert_eq!(live[&v(0)].uses.to_vec(), vec![p(4), p(8)]);
    assert_eq!((live[&v(1)].start, live[&v(1)].end), (p(2), p(4)));
    assert_eq!((live[&v(2)].start, live[&v(2)].end), (p(4), p(6)));
  }

  #[test]
  fn session_numbers_functions_and_labels() {
    let mut session = Session::new();
    let opts = Options { num_regs: 3, run_checker: true, ..Options::default() };
    let f = emit_func(&mut session, &tiny("f"), &opts).unwrap();
    let g = emit_func(&mut session, &tiny("g"), &opts).unwrap();
    assert_eq!((f.id, g.id), (0, 1));
    assert_eq!(f.code[0], MInst::Label { label: 0 });
    assert_eq!(g.code[0], MInst::Label { label: 1 });
    assert_eq!(session.global("g"), Some(1));
    assert_eq!(session.num_functions(), 2);
    assert_eq!(
      emit_func(&mut session, &tiny("f"), &opts).err(),
      Some(EmitError::DuplicateFunction("f".to_string()))
    );
  }

  #[test]
  fn spill_offsets_descend() {
    let mut session = Session::new();
    let mut func = Func::new("offsets");
    func.set_entry("start");
    let vs: Vec<VirtualReg> = (0..5).map(|_| func.new_virtual_reg()).collect();
    let s0 = func.new_virtual_reg();
    let s1 = func.new_virtual_reg();
    let s2 = func.new_virtual_reg();
    let s3 = func.new_virtual_reg();
    func.block(
      "start",
      vec![
        i_imm(vs[0], 1),
        i_imm(vs[1], 2),
        i_imm(vs[2], 3),
        i_imm(vs[3], 4),
        i_imm(vs[4], 5),
        i_add(s0, vs[4], vs[3]),
        i_add(s1, s0, vs[2]),
        i_add(s2, s1, vs[1]),
        i_sub(s3, s2, vs[0]),
        i_ret(Some(s3)),
      ],
    );
    func.finish().unwrap();
    let opts = Options { num_regs: 3, run_checker: true, ..Options::default() };
    let mfunc = emit_func(&mut session, &func, &opts).unwrap();
    let offsets: Vec<i32> = mfunc
      .code
      .iter()
      .filter_map(|minst| match minst {
        MInst::Spill { offset, .. } => Some(*offset),
        _ => None,
      })
      .collect();
    assert!(!offsets.is_empty());
    assert_eq!(offsets[0], -4);
    assert!(offsets.windows(2).all(|w| w[1] < w[0]));
    assert_eq!(mfunc.frame_size, SLOT_SIZE * offsets.len() as u32);
  }

  #[test]
  fn operand_read_here_stays_in_its_register() {
    let mut func = Func::new("last_read");
    func.set_entry("start");
    let a = func.new_virtual_reg();
    let x = func.new_virtual_reg();
    let y = func.new_virtual_reg();
    let b = func.new_virtual_reg();
    let s = func.new_virtual_reg();
    let t = func.new_virtual_reg();
    let u = func.new_virtual_reg();
    func.block(
      "start",
      vec![
        i_imm(a, 1),
        i_imm(x, 2),
        i_imm(y, 3),
        i_imm(b, 4),
        i_print(x),
        i_print(y),
        // a is on the stack here and b is read for the last time.
        i_add(s, a, b),
        i_add(t, s, x),
        i_add(u, t, y),
        i_ret(Some(u)),
      ],
    );
    func.finish().unwrap();

    let opts = Options { num_regs: 3, run_checker: true, ..Options::default() };
    let mfunc = emit_func(&mut Session::new(), &func, &opts).unwrap();

    // a spills at the def of b; y and x make room at the first add. b is
    // never evicted, so nothing is reloaded besides a, x and y.
    assert_eq!(mfunc.num_spills, 3);
    assert_eq!(mfunc.num_reloads, 3);
    let reloads: Vec<i32> = mfunc
      .code
      .iter()
      .filter_map(|minst| match minst {
        MInst::Reload { offset, .. } => Some(*offset),
        _ => None,
      })
      .collect();
    assert_eq!(reloads, vec![-4, -12, -8]);

    let run = run_machine(&mfunc.code, opts.num_regs, "last_read").unwrap();
    assert_eq!(run.ret_value, Some(10));
    assert_eq!(run.stdout, "2\n3\n");
  }
}
