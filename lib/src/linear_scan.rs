/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Implementation of the linear scan allocator algorithm.
//!
//! This follows the interval-splitting variant described in:
//!   Linear Scan Register Allocation for the Java HotSpot Client Compiler,
//!     by Wimmer, 2004
//!
//! Intervals are visited in order of the start of the range being processed.
//! A value that loses its register is split: it keeps its register up to the
//! split point, waits in a spill slot (a hole) until its next use, and is
//! visited again from there.

use log::{debug, info, trace};

use std::cmp::{max, min};
use std::fmt;

use crate::data_structures::{
  Interval, LiveRange, Location, Map, Position, RealReg, Set, SpillSlot,
  UseContext, VirtualReg,
};
use crate::interface::RegAllocError;

/// Where an interval is in the scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntervalState {
  /// Not reached yet.
  Unhandled,
  /// Holds a register and is live now.
  Active,
  /// Split off its register; waits for its next use.
  Inactive,
  /// Done.
  Handled,
}

/// One entry of the scan order: an interval, the start of the range to
/// allocate, and the register it got.
#[derive(Clone, Copy)]
struct Visit {
  vreg: VirtualReg,
  start: Position,
  reg: Option<RealReg>,
}

impl fmt::Debug for Visit {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{:?}@{:?}", self.vreg, self.start)?;
    if let Some(reg) = self.reg {
      write!(fmt, "->{:?}", reg)?;
    }
    Ok(())
  }
}

pub struct LinearScanAllocator {
  num_regs: usize,
  intervals: Map<VirtualReg, Interval>,
  use_contexts: Map<VirtualReg, UseContext>,

  unhandled: Set<VirtualReg>,
  active: Vec<VirtualReg>,
  inactive: Vec<VirtualReg>,
  handled: Set<VirtualReg>,

  /// Last interval given each register.
  register_map: Vec<Option<VirtualReg>>,
  /// Last register given each interval.
  current_reg: Map<VirtualReg, RealReg>,

  /// Sorted by (start, vreg). Entries before `next_visit` are done.
  visits: Vec<Visit>,
  next_visit: usize,

  spill_map: Map<VirtualReg, SpillSlot>,
  num_spill_slots: u32,
}

impl LinearScanAllocator {
  pub fn new(
    intervals: Map<VirtualReg, Interval>,
    use_contexts: Map<VirtualReg, UseContext>, num_regs: usize,
  ) -> Result<Self, RegAllocError> {
    if num_regs == 0 {
      return Err(RegAllocError::NoRegisters);
    }
    if num_regs > RealReg::MAX_NUM_REGS {
      return Err(RegAllocError::TooManyRegisters(num_regs));
    }
    debug_assert!(intervals.values().all(|int| int.is_well_formed()));

    let mut visits: Vec<Visit> = intervals
      .values()
      .map(|int| Visit { vreg: int.vreg, start: int.start(), reg: None })
      .collect();
    visits.sort_by_key(|visit| (visit.start, visit.vreg));

    let unhandled = intervals.keys().cloned().collect();

    Ok(Self {
      num_regs,
      intervals,
      use_contexts,
      unhandled,
      active: vec![],
      inactive: vec![],
      handled: Set::default(),
      register_map: vec![None; num_regs],
      current_reg: Map::default(),
      visits,
      next_visit: 0,
      spill_map: Map::default(),
      num_spill_slots: 0,
    })
  }

  /// Allocate every interval. Returns the intervals, sorted by virtual
  /// register and annotated with their locations, and the number of spill
  /// slots used.
  #[inline(never)]
  pub fn run(mut self) -> Result<(Vec<Interval>, u32), RegAllocError> {
    info!(
      "linear_scan: {} intervals, {} registers",
      self.intervals.len(),
      self.num_regs
    );
    while self.step()? {}
    let result = self.finish();
    info!("linear_scan: done, {} spill slots", result.1);
    Ok(result)
  }

  pub fn interval_state(&self, vreg: VirtualReg) -> Option<IntervalState> {
    if self.unhandled.contains(&vreg) {
      Some(IntervalState::Unhandled)
    } else if self.active.contains(&vreg) {
      Some(IntervalState::Active)
    } else if self.inactive.contains(&vreg) {
      Some(IntervalState::Inactive)
    } else if self.handled.contains(&vreg) {
      Some(IntervalState::Handled)
    } else {
      None
    }
  }

  pub fn interval(&self, vreg: VirtualReg) -> Result<&Interval, RegAllocError> {
    self.intervals.get(&vreg).ok_or(RegAllocError::MissingInterval(vreg))
  }

  /// Every interval is in exactly one of the four sets, and no two active
  /// intervals share a register.
  pub fn is_partitioned(&self) -> bool {
    let count = self.unhandled.len()
      + self.active.len()
      + self.inactive.len()
      + self.handled.len();
    let each_once = self.intervals.keys().all(|vreg| {
      let n = self.unhandled.contains(vreg) as usize
        + self.active.iter().filter(|&v| v == vreg).count()
        + self.inactive.iter().filter(|&v| v == vreg).count()
        + self.handled.contains(vreg) as usize;
      n == 1
    });
    let mut regs: Vec<RealReg> =
      self.active.iter().filter_map(|v| self.current_reg.get(v).cloned()).collect();
    regs.sort();
    regs.dedup();
    count == self.intervals.len() && each_once && regs.len() == self.active.len()
  }

  /// Process the next visit. Returns false when there is none left.
  #[inline(never)]
  pub fn step(&mut self) -> Result<bool, RegAllocError> {
    let ix = self.next_visit;
    let Visit { vreg: cur, start, .. } = match self.visits.get(ix) {
      Some(visit) => *visit,
      None => return Ok(false),
    };
    let cur_end = self.interval(cur)?.end();

    match self.interval_state(cur) {
      Some(IntervalState::Unhandled) => {
        self.unhandled.remove(&cur);
      }
      Some(IntervalState::Inactive) => self.inactive.retain(|&v| v != cur),
      state => unreachable!("{:?} visited while {:?}", cur, state),
    }
    // A resumed tail that already reaches the end needs its register at
    // `start` only.
    let expire_after = cur_end <= start;

    self.update_state(start);

    let reg = if self.active.len() >= self.num_regs {
      let reg = self.allocate_blocked_reg(cur, start)?;
      let victim = self.register_map[reg.get_index()]
        .ok_or(RegAllocError::OutOfRegisters { position: start })?;
      debug_assert!(self.active.contains(&victim));
      debug!("lsra: {:?} takes {:?} from {:?} at {:?}", cur, reg, victim, start);
      self.active.retain(|&v| v != victim);
      self.inactive.push(victim);
      self.split_interval(victim, start, reg)?;
      reg
    } else {
      let reg = self.try_allocate_free_reg(cur, start);
      debug!("lsra: {:?} gets {:?} at {:?}", cur, reg, start);
      reg
    };

    self.visits[ix].reg = Some(reg);
    self.register_map[reg.get_index()] = Some(cur);
    self.current_reg.insert(cur, reg);
    if expire_after {
      self.handled.insert(cur);
    } else {
      self.active.push(cur);
    }
    self.next_visit += 1;

    trace!(
      "lsra: active {:?} inactive {:?} registers {:?}",
      self.active,
      self.inactive,
      self.register_map
    );
    debug_assert!(self.is_partitioned());
    Ok(true)
  }

  /// Move active intervals that have ended by `pos` to handled.
  fn update_state(&mut self, pos: Position) {
    let intervals = &self.intervals;
    let handled = &mut self.handled;
    self.active.retain(|vreg| {
      if intervals[vreg].end() <= pos {
        trace!("lsra: {:?} expires at {:?}", vreg, pos);
        handled.insert(*vreg);
        false
      } else {
        true
      }
    });
  }

  /// Pick the register that stays free for the longest time from `start`.
  fn try_allocate_free_reg(&self, cur: VirtualReg, start: Position) -> RealReg {
    let mut free_until = vec![Position::MAX; self.num_regs];
    for vreg in self.active.iter() {
      free_until[self.current_reg[vreg].get_index()] = Position::new(0);
    }

    let cur_int = &self.intervals[&cur];
    for vreg in self.inactive.iter() {
      if let Some(reg) = self.current_reg.get(vreg) {
        if let Some(pos) = self.intervals[vreg].next_intersection(cur_int, start) {
          let slot = &mut free_until[reg.get_index()];
          *slot = min(*slot, pos);
        }
      }
    }
    trace!("lsra: free until {:?}", free_until);

    let reg = RealReg::new(max_index(&free_until));
    debug_assert!(free_until[reg.get_index()] > Position::new(0));
    reg
  }

  /// Pick the register whose occupant is needed again the latest.
  fn allocate_blocked_reg(
    &self, cur: VirtualReg, start: Position,
  ) -> Result<RealReg, RegAllocError> {
    let mut next_use = vec![Position::MAX; self.num_regs];
    for &vreg in self.active.iter() {
      let reg = self.current_reg[&vreg];
      let pos = self.find_next_use(vreg, start, false)?;
      let slot = &mut next_use[reg.get_index()];
      *slot = min(*slot, pos);
    }

    let cur_int = &self.intervals[&cur];
    for &vreg in self.inactive.iter() {
      if !self.intervals[&vreg].intersects(cur_int) {
        continue;
      }
      if let Some(reg) = self.current_reg.get(&vreg) {
        // A tail resuming exactly at `start` needs its register right away.
        let pos = self.find_next_use(vreg, start, true)?;
        let slot = &mut next_use[reg.get_index()];
        *slot = min(*slot, pos);
      }
    }
    trace!("lsra: next use {:?}", next_use);

    Ok(RealReg::new(max_index(&next_use)))
  }

  /// The next use of `vreg` after `pos` (at or after, if `inclusive`). A
  /// value that is never read is never needed. A value whose last read is
  /// exactly at `pos` (two merge operands read on the same edge) is needed
  /// at `pos`.
  fn find_next_use(
    &self, vreg: VirtualReg, pos: Position, inclusive: bool,
  ) -> Result<Position, RegAllocError> {
    match self.use_contexts.get(&vreg) {
      Some(uses) if !uses.is_empty() => {
        let next = if inclusive {
          uses.next_use_from(pos)
        } else {
          uses.next_use_after(pos).or_else(|| uses.next_use_from(pos))
        };
        next.ok_or(RegAllocError::MissingNextUse { vreg, after: pos })
      }
      _ => Ok(Position::MAX),
    }
  }

  fn spill_slot_for(&mut self, vreg: VirtualReg) -> SpillSlot {
    let next = &mut self.num_spill_slots;
    *self.spill_map.entry(vreg).or_insert_with(|| {
      let slot = SpillSlot::new(*next);
      *next += 1;
      slot
    })
  }

  /// Split `vreg`, which has just been moved to inactive, at `pos`. It
  /// keeps `reg` until `pos`. With no use after `pos` it is finished;
  /// otherwise it waits in a spill slot until its next use and is visited
  /// again from there.
  fn split_interval(
    &mut self, vreg: VirtualReg, pos: Position, reg: RealReg,
  ) -> Result<(), RegAllocError> {
    let next_use = self.use_contexts.get(&vreg).and_then(|uses| uses.next_use_after(pos));
    let slot = match next_use {
      Some(_) => Some(self.spill_slot_for(vreg)),
      None => None,
    };

    let int = self.intervals.get_mut(&vreg).ok_or(RegAllocError::MissingInterval(vreg))?;
    debug_assert!(int.start() <= pos);

    let ranges = std::mem::replace(&mut int.ranges, vec![]);
    let mut head = vec![];
    let mut tail = vec![];
    for range in ranges {
      if range.start <= pos {
        let mut part = range.clone();
        part.end = min(part.end, pos);
        head.push(part);
      }
      if let Some(nu) = next_use {
        if range.end >= nu {
          let mut part = range;
          part.start = max(part.start, nu);
          tail.push(part);
        }
      }
    }

    match (next_use, slot) {
      (Some(nu), Some(slot)) => {
        if !tail.first().map_or(false, |first| first.covers(nu)) {
          tail.insert(0, LiveRange::new(nu, nu));
        }
        tail[0].set_in_register(reg);

        let mut hole = LiveRange::new(pos, nu);
        hole.set_on_stack(slot);
        let at = int.holes.iter().position(|h| h.start > pos).unwrap_or(int.holes.len());
        int.holes.insert(at, hole);

        int.ranges = head;
        int.ranges.extend(tail);
        debug!("lsra: split {:?} at {:?}, resumes at {:?} via {:?}", vreg, pos, nu, slot);
        debug_assert!(int.is_well_formed());

        let visit = Visit { vreg, start: nu, reg: None };
        let at = self.visits.partition_point(|v| (v.start, v.vreg) < (nu, vreg));
        debug_assert!(at > self.next_visit);
        self.visits.insert(at, visit);
      }
      _ => {
        if let Some(last) = head.last_mut() {
          last.set_in_register(reg);
        }
        int.ranges = head;
        debug!("lsra: truncate {:?} at {:?}, no further use", vreg, pos);
        debug_assert!(int.is_well_formed());

        self.inactive.retain(|&v| v != vreg);
        self.handled.insert(vreg);
      }
    }
    Ok(())
  }

  /// Retire the remaining intervals and write each visit's register onto
  /// the ranges it covers. Ranges without a visit of their own (a gap in
  /// the liveness) keep the register of the range before them.
  fn finish(mut self) -> (Vec<Interval>, u32) {
    for vreg in self.active.drain(..).chain(self.inactive.drain(..)) {
      self.handled.insert(vreg);
    }
    debug_assert!(self.unhandled.is_empty());

    let mut assigned = Map::<VirtualReg, Vec<(Position, RealReg)>>::default();
    for visit in self.visits.iter() {
      if let Some(reg) = visit.reg {
        assigned.entry(visit.vreg).or_default().push((visit.start, reg));
      }
    }

    let mut intervals: Vec<Interval> = self.intervals.drain().map(|(_, int)| int).collect();
    intervals.sort_by_key(|int| int.vreg);

    for int in intervals.iter_mut() {
      let visits = assigned.get(&int.vreg).map_or(&[][..], |v| &v[..]);
      let mut ix = 0;
      let mut location = Location::None;
      for range in int.ranges.iter_mut() {
        while ix < visits.len() && visits[ix].0 <= range.end {
          location = Location::Reg(visits[ix].1);
          ix += 1;
        }
        range.location = location;
      }
      trace!("lsra: {:?}", int);
    }

    (intervals, self.num_spill_slots)
  }
}

/// Index of the first maximal element.
fn max_index(v: &[Position]) -> usize {
  let mut best = 0;
  for ix in 1..v.len() {
    if v[ix] > v[best] {
      best = ix;
    }
  }
  best
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::analysis::run_analysis;
  use crate::checker::check_linear_scan;
  use crate::test_utils::{op, TestFunc};

  fn p(n: u32) -> Position {
    Position::new(n)
  }

  fn v(n: u32) -> VirtualReg {
    VirtualReg::new(n)
  }

  fn r(n: usize) -> RealReg {
    RealReg::new(n)
  }

  fn uses(positions: &[u32]) -> UseContext {
    let mut ctx = UseContext::new();
    for &n in positions.iter().rev() {
      ctx.push_backward(p(n));
    }
    ctx.finish();
    ctx
  }

  fn setup(
    ints: &[(u32, u32, u32, &[u32])],
  ) -> (Map<VirtualReg, Interval>, Map<VirtualReg, UseContext>) {
    let mut intervals = Map::default();
    let mut use_contexts = Map::default();
    for &(vreg, from, to, positions) in ints {
      intervals.insert(v(vreg), Interval::new(v(vreg), p(from), p(to)));
      if !positions.is_empty() {
        use_contexts.insert(v(vreg), uses(positions));
      }
    }
    (intervals, use_contexts)
  }

  fn interval(ints: &[Interval], vreg: u32) -> &Interval {
    ints.iter().find(|int| int.vreg == v(vreg)).unwrap()
  }

  #[test]
  fn one_register_forces_a_split() {
    // A = [0, 10), B = [5, 15).
    let (intervals, use_contexts) =
      setup(&[(0, 0, 10, &[2, 8, 10]), (1, 5, 15, &[12, 14])]);
    let lsra = LinearScanAllocator::new(intervals, use_contexts, 1).unwrap();
    let (ints, num_slots) = lsra.run().unwrap();

    let a = interval(&ints, 0);
    assert_eq!(a.holes.len(), 1);
    assert_eq!((a.holes[0].start, a.holes[0].end), (p(5), p(8)));
    assert_eq!(a.holes[0].location, Location::Stack(SpillSlot::new(0)));
    assert_eq!(a.ranges[1].start, p(8));

    // B loses the register when A resumes and is back at its first use
    // after 5.
    let b = interval(&ints, 1);
    assert_eq!(b.holes.len(), 1);
    assert_eq!(b.ranges.last().unwrap().start, p(12));

    assert_eq!(num_slots, 2);
    for int in ints.iter() {
      assert!(int.ranges.iter().all(|range| range.location == Location::Reg(r(0))));
    }
    check_linear_scan(&ints, 1).unwrap();
  }

  #[test]
  fn two_registers_no_split() {
    let (intervals, use_contexts) =
      setup(&[(0, 0, 10, &[10]), (1, 5, 15, &[15])]);
    let lsra = LinearScanAllocator::new(intervals, use_contexts, 2).unwrap();
    let (ints, num_slots) = lsra.run().unwrap();
    assert_eq!(num_slots, 0);
    assert_eq!(interval(&ints, 0).ranges[0].location, Location::Reg(r(0)));
    assert_eq!(interval(&ints, 1).ranges[0].location, Location::Reg(r(1)));
  }

  #[test]
  fn expired_register_is_reused() {
    let (intervals, use_contexts) =
      setup(&[(0, 0, 4, &[4]), (1, 2, 8, &[8]), (2, 4, 10, &[10])]);
    let lsra = LinearScanAllocator::new(intervals, use_contexts, 2).unwrap();
    let (ints, num_slots) = lsra.run().unwrap();
    assert_eq!(num_slots, 0);
    assert_eq!(interval(&ints, 2).ranges[0].location, Location::Reg(r(0)));
  }

  #[test]
  fn unused_value_is_truncated() {
    let (intervals, use_contexts) =
      setup(&[(0, 0, 10, &[]), (1, 4, 8, &[6, 8])]);
    let mut lsra = LinearScanAllocator::new(intervals, use_contexts, 1).unwrap();
    while lsra.step().unwrap() {}
    assert_eq!(lsra.interval_state(v(0)), Some(IntervalState::Handled));
    let a = lsra.interval(v(0)).unwrap();
    assert_eq!((a.start(), a.end()), (p(0), p(4)));
    assert!(a.holes.is_empty());
  }

  #[test]
  fn partition_holds_and_handled_is_final() {
    let (intervals, use_contexts) = setup(&[
      (0, 0, 20, &[6, 14, 20]),
      (1, 2, 12, &[4, 12]),
      (2, 4, 16, &[10, 16]),
      (3, 6, 8, &[8]),
      (4, 8, 22, &[18, 22]),
    ]);
    let mut lsra = LinearScanAllocator::new(intervals, use_contexts, 2).unwrap();
    let vregs: Vec<VirtualReg> = (0..5).map(v).collect();
    let mut handled = Set::<VirtualReg>::default();
    loop {
      assert!(lsra.is_partitioned());
      for &vreg in vregs.iter() {
        let state = lsra.interval_state(vreg).unwrap();
        if handled.contains(&vreg) {
          assert_eq!(state, IntervalState::Handled);
        } else if state == IntervalState::Handled {
          handled.insert(vreg);
        }
        assert!(lsra.interval(vreg).unwrap().is_well_formed());
      }
      if !lsra.step().unwrap() {
        break;
      }
    }
    let (ints, _) = lsra.run().unwrap();
    check_linear_scan(&ints, 2).unwrap();
  }

  #[test]
  fn live_value_without_later_use_is_an_error() {
    // v0 is still live at 4 but its last recorded use is 2.
    let (intervals, use_contexts) =
      setup(&[(0, 0, 10, &[2]), (1, 4, 8, &[8])]);
    let lsra = LinearScanAllocator::new(intervals, use_contexts, 1).unwrap();
    assert_eq!(
      lsra.run().unwrap_err(),
      RegAllocError::MissingNextUse { vreg: v(0), after: p(4) }
    );
  }

  #[test]
  fn builder_output_allocates_cleanly() {
    // b0: v0 = op; v1 = op; v2 = op v0, v1; goto b1
    // b1: v3 = op v0, v2; op v1, v3; ret
    let func = TestFunc::new()
      .block(
        vec![
          op(Some(0), &[]),
          op(Some(1), &[]),
          op(Some(2), &[0, 1]),
          op(None, &[]),
        ],
        &[1],
      )
      .block(vec![op(Some(3), &[0, 2]), op(None, &[1, 3]), op(None, &[])], &[]);
    let info = run_analysis(&func).unwrap();
    for &num_regs in &[1, 2, 3, 4] {
      let lsra = LinearScanAllocator::new(
        info.intervals.clone(),
        info.use_contexts.clone(),
        num_regs,
      )
      .unwrap();
      let (ints, _) = lsra.run().unwrap();
      assert_eq!(ints.len(), 4);
      check_linear_scan(&ints, num_regs).unwrap();
    }
  }

  #[test]
  fn operands_read_on_the_same_edge() {
    // b0: v0 = op; v1 = op; v2 = op; v3 = op v2; goto b1
    // b1: v4 = phi [b0: v0]; v5 = phi [b0: v1]; op v4, v5; ret
    //
    // v0 and v1 are both read at the edge position 9. With one register
    // one of them resumes there while the other still holds it.
    let func = TestFunc::new()
      .block(
        vec![
          op(Some(0), &[]),
          op(Some(1), &[]),
          op(Some(2), &[]),
          op(Some(3), &[2]),
          op(None, &[]),
        ],
        &[1],
      )
      .block(
        vec![
          crate::test_utils::phi(4, &[(0, 0)]),
          crate::test_utils::phi(5, &[(0, 1)]),
          op(None, &[4, 5]),
          op(None, &[]),
        ],
        &[],
      );
    let info = run_analysis(&func).unwrap();
    for &num_regs in &[1, 2, 3] {
      let lsra = LinearScanAllocator::new(
        info.intervals.clone(),
        info.use_contexts.clone(),
        num_regs,
      )
      .unwrap();
      let (ints, _) = lsra.run().unwrap();
      check_linear_scan(&ints, num_regs).unwrap();
    }
  }

  #[test]
  fn no_registers() {
    assert_eq!(
      LinearScanAllocator::new(Map::default(), Map::default(), 0).err(),
      Some(RegAllocError::NoRegisters)
    );
    assert_eq!(
      LinearScanAllocator::new(Map::default(), Map::default(), 257).err(),
      Some(RegAllocError::TooManyRegisters(257))
    );
  }
}
