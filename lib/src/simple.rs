/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Online register allocation, driven by the emitter one operand at a time.
//!
//! The emitter tells the allocator the position of the instruction being
//! emitted and the live range of every value it has defined so far. When a
//! register is needed and none is free, the occupant whose next use is the
//! furthest away is spilled, which approximates Belady's offline policy with
//! the use points known locally.

use log::{debug, trace};
use smallvec::SmallVec;

use crate::data_structures::{LiveRange, Location, Map, Position, RealReg, VirtualReg};
use crate::interface::{Options, RegAllocError, SpillContext};

pub struct SimpleRegisterAllocator {
  num_regs: usize,
  virtual2machine: Map<VirtualReg, Location>,
  register_status: Vec<Option<VirtualReg>>,
  liveness: Map<VirtualReg, LiveRange>,
  /// Operands of the instruction being emitted. Never evicted.
  nospills: SmallVec<[VirtualReg; 4]>,
  /// Odd while call arguments are being set up.
  spillable: i32,
  /// Registers excluded from the free scan while `spillable` is odd.
  disabled: Vec<RealReg>,
}

impl SimpleRegisterAllocator {
  pub fn new(opts: &Options) -> Result<Self, RegAllocError> {
    if opts.num_regs == 0 {
      return Err(RegAllocError::NoRegisters);
    }
    if opts.num_regs > RealReg::MAX_NUM_REGS {
      return Err(RegAllocError::TooManyRegisters(opts.num_regs));
    }
    Ok(Self {
      num_regs: opts.num_regs,
      virtual2machine: Map::default(),
      register_status: vec![None; opts.num_regs],
      liveness: Map::default(),
      nospills: SmallVec::new(),
      spillable: 0,
      disabled: opts
        .call_arg_regs
        .iter()
        .cloned()
        .filter(|r| r.get_index() < opts.num_regs)
        .collect(),
    })
  }

  pub fn num_regs(&self) -> usize {
    self.num_regs
  }

  /// Record the live range of `vreg`. The emitter owns liveness; this must
  /// happen before the value is allocated.
  pub fn set_liveness(&mut self, vreg: VirtualReg, range: LiveRange) {
    self.liveness.insert(vreg, range);
  }

  pub fn liveness(&self, vreg: VirtualReg) -> Option<&LiveRange> {
    self.liveness.get(&vreg)
  }

  /// Current home of `vreg`.
  pub fn lookup(&self, vreg: VirtualReg) -> Location {
    self.virtual2machine.get(&vreg).cloned().unwrap_or(Location::None)
  }

  pub fn occupant(&self, reg: RealReg) -> Option<VirtualReg> {
    self.register_status[reg.get_index()]
  }

  /// Forget the operands of the previous instruction.
  pub fn clear_nospills(&mut self) {
    self.nospills.clear();
  }

  pub fn in_arg_setup(&self) -> bool {
    self.spillable & 1 == 1
  }

  /// Leave an argument-setup window.
  pub fn enable_spill(&mut self) {
    self.spillable -= 1;
  }

  /// Enter an argument-setup window: the call argument registers stop being
  /// handed out until the matching `enable_spill`.
  pub fn disable_spill(&mut self) {
    self.spillable += 1;
  }

  /// Make sure `vreg` is in a register at `position` and return it. The
  /// value is protected from eviction until `clear_nospills`.
  #[inline(never)]
  pub fn allocate<C: SpillContext + ?Sized>(
    &mut self, ctx: &mut C, vreg: VirtualReg, position: Position,
  ) -> Result<RealReg, RegAllocError> {
    if !self.nospills.contains(&vreg) {
      self.nospills.push(vreg);
    }

    match self.lookup(vreg) {
      Location::Reg(reg) => {
        debug_assert_eq!(self.register_status[reg.get_index()], Some(vreg));
        Ok(reg)
      }
      Location::None => {
        let reg = self.get_free_reg(ctx, position)?;
        debug!("simple: {:?} -> {:?} at {:?}", vreg, reg, position);
        self.assign(vreg, reg);
        Ok(reg)
      }
      Location::Stack(slot) => {
        let reg = self.get_free_reg(ctx, position)?;
        debug!("simple: restore {:?} from {:?} into {:?} at {:?}", vreg, slot, reg, position);
        ctx.restore_spill(reg, slot, vreg);
        self.assign(vreg, reg);
        Ok(reg)
      }
    }
  }

  fn assign(&mut self, vreg: VirtualReg, reg: RealReg) {
    debug_assert!(self.register_status[reg.get_index()].is_none());
    self.virtual2machine.insert(vreg, Location::Reg(reg));
    self.register_status[reg.get_index()] = Some(vreg);
    trace!("simple: registers {:?}", self.register_status);
  }

  /// Find a register that can take a new value at `position`, spilling if
  /// nothing is free. The returned register is unoccupied.
  pub fn get_free_reg<C: SpillContext + ?Sized>(
    &mut self, ctx: &mut C, position: Position,
  ) -> Result<RealReg, RegAllocError> {
    let arg_setup = self.in_arg_setup();
    for ix in 0..self.num_regs {
      let reg = RealReg::new(ix);
      if arg_setup && self.disabled.contains(&reg) {
        continue;
      }
      match self.register_status[ix] {
        None => return Ok(reg),
        Some(occupant) => {
          if self.nospills.contains(&occupant) {
            continue;
          }
          let range = self
            .liveness
            .get(&occupant)
            .ok_or(RegAllocError::MissingLiveness(occupant))?;
          if position > range.end {
            trace!("simple: {:?} expired, reclaiming {:?}", occupant, reg);
            self.virtual2machine.insert(occupant, Location::None);
            self.register_status[ix] = None;
            return Ok(reg);
          }
        }
      }
    }
    self.get_reg_to_spill(ctx, position)
  }

  /// Spill the occupant whose next use at or after `position` is the
  /// furthest away, and return its register. A use at `position` is at
  /// distance zero. On a tie the higher register wins.
  pub fn get_reg_to_spill<C: SpillContext + ?Sized>(
    &mut self, ctx: &mut C, position: Position,
  ) -> Result<RealReg, RegAllocError> {
    let mut best: Option<(usize, VirtualReg, u32)> = None;
    for ix in 0..self.num_regs {
      let occupant = match self.register_status[ix] {
        Some(vreg) if !self.nospills.contains(&vreg) => vreg,
        _ => continue,
      };
      let range = self
        .liveness
        .get(&occupant)
        .ok_or(RegAllocError::MissingLiveness(occupant))?;
      // Without a recorded use the range end bounds the next read.
      let next = range.next_use_from(position).unwrap_or(range.end).max(position);
      let distance = position.distance_to(next);
      if best.map_or(true, |(_, _, best_distance)| distance >= best_distance) {
        best = Some((ix, occupant, distance));
      }
    }

    let (ix, victim, distance) =
      best.ok_or(RegAllocError::OutOfRegisters { position })?;
    let reg = RealReg::new(ix);
    let slot = ctx.create_spill(reg, victim);
    debug!(
      "simple: spill {:?} from {:?} to {:?} at {:?} (next use in {})",
      victim, reg, slot, position, distance
    );
    self.virtual2machine.insert(victim, Location::Stack(slot));
    self.register_status[ix] = None;
    Ok(reg)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::data_structures::SpillSlot;

  #[derive(Debug, PartialEq, Eq)]
  enum Event {
    Spill(RealReg, VirtualReg, SpillSlot),
    Restore(RealReg, SpillSlot, VirtualReg),
  }

  #[derive(Default)]
  struct Frame {
    next_offset: u32,
    events: Vec<Event>,
  }

  impl SpillContext for Frame {
    fn create_spill(&mut self, from_reg: RealReg, vreg: VirtualReg) -> SpillSlot {
      let slot = SpillSlot::new(self.next_offset);
      self.next_offset += 8;
      self.events.push(Event::Spill(from_reg, vreg, slot));
      slot
    }
    fn restore_spill(&mut self, to_reg: RealReg, slot: SpillSlot, vreg: VirtualReg) {
      self.events.push(Event::Restore(to_reg, slot, vreg));
    }
  }

  fn p(n: u32) -> Position {
    Position::new(n)
  }

  fn v(n: u32) -> VirtualReg {
    VirtualReg::new(n)
  }

  fn r(n: usize) -> RealReg {
    RealReg::new(n)
  }

  fn allocator(num_regs: usize) -> SimpleRegisterAllocator {
    let opts = Options { num_regs, call_arg_regs: vec![r(0)], ..Options::default() };
    SimpleRegisterAllocator::new(&opts).unwrap()
  }

  // v0 used at {0, 4}, v1 at {2, 6}, v2 at {4, 8}.
  fn three_values(ra: &mut SimpleRegisterAllocator) {
    ra.set_liveness(v(0), LiveRange::with_uses(p(0), p(4), &[p(0), p(4)]));
    ra.set_liveness(v(1), LiveRange::with_uses(p(2), p(6), &[p(2), p(6)]));
    ra.set_liveness(v(2), LiveRange::with_uses(p(4), p(8), &[p(4), p(8)]));
  }

  #[test]
  fn furthest_use_is_spilled() {
    let mut ra = allocator(2);
    let mut frame = Frame::default();
    three_values(&mut ra);

    assert_eq!(ra.allocate(&mut frame, v(0), p(0)).unwrap(), r(0));
    ra.clear_nospills();
    assert_eq!(ra.allocate(&mut frame, v(1), p(2)).unwrap(), r(1));
    ra.clear_nospills();

    // The instruction at 4 reads v0; v1 is not needed until 6.
    assert_eq!(ra.allocate(&mut frame, v(2), p(4)).unwrap(), r(1));
    assert_eq!(ra.allocate(&mut frame, v(0), p(4)).unwrap(), r(0));
    assert_eq!(frame.events, vec![Event::Spill(r(1), v(1), SpillSlot::new(0))]);
    assert_eq!(ra.lookup(v(1)), Location::Stack(SpillSlot::new(0)));
    assert_eq!(ra.lookup(v(2)), Location::Reg(r(1)));
  }

  #[test]
  fn spill_choice_follows_next_use() {
    let mut ra = allocator(4);
    let mut frame = Frame::default();
    ra.set_liveness(v(0), LiveRange::with_uses(p(0), p(10), &[p(0), p(10)]));
    ra.set_liveness(v(1), LiveRange::with_uses(p(2), p(14), &[p(2), p(14)]));
    ra.set_liveness(v(2), LiveRange::with_uses(p(4), p(12), &[p(4), p(12)]));
    ra.set_liveness(v(3), LiveRange::with_uses(p(6), p(8), &[p(6), p(8)]));
    ra.set_liveness(v(4), LiveRange::with_uses(p(8), p(16), &[p(8), p(16)]));

    for (ix, pos) in [0, 2, 4, 6].iter().enumerate() {
      assert_eq!(ra.allocate(&mut frame, v(ix as u32), p(*pos)).unwrap(), r(ix));
      ra.clear_nospills();
    }

    // At 8: v0 is next read at 10, v1 at 14, v2 at 12 and v3 right here.
    assert_eq!(ra.allocate(&mut frame, v(4), p(8)).unwrap(), r(1));
    assert_eq!(ra.allocate(&mut frame, v(3), p(8)).unwrap(), r(3));
    assert_eq!(frame.events, vec![Event::Spill(r(1), v(1), SpillSlot::new(0))]);
    ra.clear_nospills();

    // At 10 v3 has expired; nothing else is spilled.
    assert_eq!(ra.allocate(&mut frame, v(0), p(10)).unwrap(), r(0));
    assert_eq!(ra.allocate(&mut frame, v(1), p(10)).unwrap(), r(3));
    assert_eq!(frame.events.len(), 2);
    assert_eq!(frame.events[1], Event::Restore(r(3), SpillSlot::new(0), v(1)));
  }

  #[test]
  fn operands_are_not_evicted() {
    let mut ra = allocator(2);
    let mut frame = Frame::default();
    three_values(&mut ra);

    ra.allocate(&mut frame, v(0), p(0)).unwrap();
    ra.clear_nospills();
    ra.allocate(&mut frame, v(1), p(2)).unwrap();
    ra.clear_nospills();

    // Instruction at 4 reads v0 and writes v2: v1 has to go.
    assert_eq!(ra.allocate(&mut frame, v(0), p(4)).unwrap(), r(0));
    assert_eq!(ra.allocate(&mut frame, v(2), p(4)).unwrap(), r(1));
    assert_eq!(frame.events, vec![Event::Spill(r(1), v(1), SpillSlot::new(0))]);
    ra.clear_nospills();

    // v1 comes back at 6 into the register v0 no longer needs.
    assert_eq!(ra.allocate(&mut frame, v(1), p(6)).unwrap(), r(0));
    assert_eq!(
      frame.events[1],
      Event::Restore(r(0), SpillSlot::new(0), v(1))
    );
    assert_eq!(ra.lookup(v(0)), Location::None);
    assert_eq!(ra.occupant(r(0)), Some(v(1)));
  }

  #[test]
  fn spill_and_restore_pair_up() {
    let mut ra = allocator(1);
    let mut frame = Frame::default();
    ra.set_liveness(v(0), LiveRange::with_uses(p(0), p(6), &[p(0), p(6)]));
    ra.set_liveness(v(1), LiveRange::with_uses(p(2), p(4), &[p(2), p(4)]));

    ra.allocate(&mut frame, v(0), p(0)).unwrap();
    ra.clear_nospills();
    ra.allocate(&mut frame, v(1), p(2)).unwrap();
    ra.clear_nospills();
    ra.allocate(&mut frame, v(1), p(4)).unwrap();
    ra.clear_nospills();
    let reg = ra.allocate(&mut frame, v(0), p(6)).unwrap();

    let spilled = match frame.events[0] {
      Event::Spill(_, vreg, slot) => (vreg, slot),
      _ => panic!("expected a spill first"),
    };
    assert_eq!(spilled, (v(0), SpillSlot::new(0)));
    assert_eq!(frame.events[1], Event::Restore(reg, SpillSlot::new(0), v(0)));
    assert_eq!(frame.events.len(), 2);
  }

  #[test]
  fn exhaustion_is_an_error() {
    let mut ra = allocator(1);
    let mut frame = Frame::default();
    ra.set_liveness(v(0), LiveRange::with_uses(p(0), p(4), &[p(4)]));
    ra.set_liveness(v(1), LiveRange::with_uses(p(0), p(4), &[p(4)]));
    ra.allocate(&mut frame, v(0), p(0)).unwrap();
    assert_eq!(
      ra.allocate(&mut frame, v(1), p(0)),
      Err(RegAllocError::OutOfRegisters { position: p(0) })
    );
  }

  #[test]
  fn missing_liveness_is_an_error() {
    let mut ra = allocator(1);
    let mut frame = Frame::default();
    ra.allocate(&mut frame, v(0), p(0)).unwrap();
    ra.clear_nospills();
    assert_eq!(
      ra.allocate(&mut frame, v(1), p(2)),
      Err(RegAllocError::MissingLiveness(v(0)))
    );
  }

  #[test]
  fn call_registers_are_held_back_in_arg_setup() {
    let mut ra = allocator(2);
    let mut frame = Frame::default();
    ra.set_liveness(v(0), LiveRange::with_uses(p(0), p(8), &[p(8)]));
    ra.set_liveness(v(1), LiveRange::with_uses(p(2), p(8), &[p(8)]));

    ra.disable_spill();
    assert!(ra.in_arg_setup());
    assert_eq!(ra.allocate(&mut frame, v(0), p(0)).unwrap(), r(1));
    ra.clear_nospills();
    ra.enable_spill();
    assert!(!ra.in_arg_setup());
    assert_eq!(ra.allocate(&mut frame, v(1), p(2)).unwrap(), r(0));

    // Nested windows keep the parity rule.
    ra.disable_spill();
    ra.disable_spill();
    assert!(!ra.in_arg_setup());
    ra.enable_spill();
    assert!(ra.in_arg_setup());
    ra.enable_spill();
  }

  #[test]
  fn no_registers() {
    let opts = Options { num_regs: 0, ..Options::default() };
    assert_eq!(
      SimpleRegisterAllocator::new(&opts).err(),
      Some(RegAllocError::NoRegisters)
    );
  }

  #[test]
  fn register_count_is_bounded() {
    let mut opts = Options { num_regs: RealReg::MAX_NUM_REGS, ..Options::default() };
    let ra = SimpleRegisterAllocator::new(&opts).unwrap();
    assert_eq!(ra.num_regs(), 256);
    opts.num_regs += 1;
    assert_eq!(
      SimpleRegisterAllocator::new(&opts).err(),
      Some(RegAllocError::TooManyRegisters(257))
    );
  }
}
