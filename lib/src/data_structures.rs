/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Data structures shared by the analysis and both allocators.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use std::cmp::{max, min};
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};
use std::slice::{Iter, IterMut};

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

//=============================================================================
// Maps and sets

pub type Map<K, V> = FxHashMap<K, V>;
pub type Set<T> = FxHashSet<T>;

//=============================================================================
// Iteration boilerplate for entities.  The only purpose of this is to support
// constructions of the form
//
//   for ent in start_ent.dotdot(end_plus1_ent) {
//   }
//
// since |trait Step| is not available in stable Rust.

pub trait PlusOne {
  fn plus_one(&self) -> Self;
}

#[derive(Clone, Copy)]
pub struct MyRange<T> {
  first: T,
  last_plus1: T,
}

impl<T: Copy + PartialOrd + PlusOne> IntoIterator for MyRange<T> {
  type Item = T;
  type IntoIter = MyIterator<T>;
  fn into_iter(self) -> Self::IntoIter {
    MyIterator { range: self, next: self.first }
  }
}

pub struct MyIterator<T> {
  range: MyRange<T>,
  next: T,
}

impl<T: Copy + PartialOrd + PlusOne> Iterator for MyIterator<T> {
  type Item = T;
  fn next(&mut self) -> Option<Self::Item> {
    if self.next >= self.range.last_plus1 {
      None
    } else {
      let res = Some(self.next);
      self.next = self.next.plus_one();
      res
    }
  }
}

//=============================================================================
// Vectors where both the index and element types can be specified (and at
// most 2^32-1 elems can be stored).

pub struct TypedIxVec<TyIx, Ty> {
  vek: Vec<Ty>,
  ty_ix: PhantomData<TyIx>,
}

impl<TyIx, Ty> TypedIxVec<TyIx, Ty> {
  pub fn new() -> Self {
    Self { vek: Vec::new(), ty_ix: PhantomData::<TyIx> }
  }
  pub fn iter(&self) -> Iter<Ty> {
    self.vek.iter()
  }
  pub fn iter_mut(&mut self) -> IterMut<Ty> {
    self.vek.iter_mut()
  }
  pub fn as_slice(&self) -> &[Ty] {
    &self.vek
  }
  pub fn len(&self) -> u32 {
    self.vek.len() as u32
  }
  pub fn is_empty(&self) -> bool {
    self.vek.is_empty()
  }
  pub fn push(&mut self, item: Ty) {
    self.vek.push(item);
  }
}

impl<TyIx, Ty: Clone> TypedIxVec<TyIx, Ty> {
  pub fn resize(&mut self, new_len: u32, value: Ty) {
    self.vek.resize(new_len as usize, value);
  }
}

impl<TyIx, Ty> Index<TyIx> for TypedIxVec<TyIx, Ty>
where
  TyIx: Into<u32>,
{
  type Output = Ty;
  fn index(&self, ix: TyIx) -> &Ty {
    &self.vek[ix.into() as usize]
  }
}

impl<TyIx, Ty> IndexMut<TyIx> for TypedIxVec<TyIx, Ty>
where
  TyIx: Into<u32>,
{
  fn index_mut(&mut self, ix: TyIx) -> &mut Ty {
    &mut self.vek[ix.into() as usize]
  }
}

impl<TyIx, Ty: Clone> Clone for TypedIxVec<TyIx, Ty> {
  fn clone(&self) -> Self {
    Self { vek: self.vek.clone(), ty_ix: PhantomData::<TyIx> }
  }
}

impl<TyIx, Ty: fmt::Debug> fmt::Debug for TypedIxVec<TyIx, Ty> {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{:?}", self.vek)
  }
}

//=============================================================================

macro_rules! generate_boilerplate {
  ($TypeIx:ident, $PrintingPrefix:expr) => {
    #[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
    #[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
    pub struct $TypeIx(u32);

    impl $TypeIx {
      #[inline(always)]
      pub fn new(n: u32) -> Self {
        Self(n)
      }
      #[inline(always)]
      pub fn get(self) -> u32 {
        self.0
      }
      pub fn plus(self, delta: u32) -> Self {
        Self(self.0 + delta)
      }
      pub fn dotdot(&self, last_plus1: Self) -> MyRange<Self> {
        MyRange { first: *self, last_plus1 }
      }
    }
    impl fmt::Debug for $TypeIx {
      fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}{}", $PrintingPrefix, self.0)
      }
    }
    impl PlusOne for $TypeIx {
      fn plus_one(&self) -> Self {
        self.plus(1)
      }
    }
    impl Into<u32> for $TypeIx {
      fn into(self) -> u32 {
        self.0
      }
    }
  };
}

generate_boilerplate!(InstIx, "i");

generate_boilerplate!(BlockIx, "b");

//=============================================================================
// Registers and spill slots

/// A value produced by the instruction selector. Unlimited in number.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct VirtualReg(u32);

impl VirtualReg {
  #[inline(always)]
  pub fn new(index: u32) -> Self {
    Self(index)
  }
  #[inline(always)]
  pub fn get_index(self) -> usize {
    self.0 as usize
  }
}

impl fmt::Debug for VirtualReg {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "v{}", self.0)
  }
}

/// A machine register, identified by its index in `0 .. num_regs`.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct RealReg(u8);

impl RealReg {
  /// One past the largest register index.
  pub const MAX_NUM_REGS: usize = u8::MAX as usize + 1;

  #[inline(always)]
  pub fn new(index: usize) -> Self {
    debug_assert!(index <= u8::MAX as usize);
    Self(index as u8)
  }
  #[inline(always)]
  pub fn get_index(self) -> usize {
    self.0 as usize
  }
}

impl fmt::Debug for RealReg {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "r{}", self.0)
  }
}

/// A stack slot. Its meaning (a frame offset, a slot number) belongs to
/// whoever hands it out.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct SpillSlot(u32);

impl SpillSlot {
  #[inline(always)]
  pub fn new(n: u32) -> Self {
    Self(n)
  }
  #[inline(always)]
  pub fn get(self) -> u32 {
    self.0
  }
}

impl fmt::Debug for SpillSlot {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "S{}", self.0)
  }
}

/// Where a value lives. Used both for the online allocator's
/// virtual-to-machine table and for live range residency.
#[derive(Copy, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Location {
  None,
  Reg(RealReg),
  Stack(SpillSlot),
}

impl Location {
  pub fn reg(self) -> Option<RealReg> {
    match self {
      Location::Reg(reg) => Some(reg),
      _ => None,
    }
  }
  pub fn spill(self) -> Option<SpillSlot> {
    match self {
      Location::Stack(slot) => Some(slot),
      _ => None,
    }
  }
  pub fn is_none(self) -> bool {
    match self {
      Location::None => true,
      _ => false,
    }
  }
}

impl fmt::Debug for Location {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Location::None => write!(fmt, "none"),
      Location::Reg(reg) => write!(fmt, "{:?}", reg),
      Location::Stack(slot) => write!(fmt, "{:?}", slot),
    }
  }
}

//=============================================================================
// Program positions

/// A point in the linearized function. Every instruction gets an even
/// position; odd positions sit between instructions and are used for block
/// edges and split points.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Position(u32);

impl Position {
  /// Distance between two consecutive instructions.
  pub const STRIDE: u32 = 2;

  /// Stands for "never", e.g. a value that is not used again.
  pub const MAX: Position = Position(u32::MAX);

  #[inline(always)]
  pub fn new(n: u32) -> Self {
    Self(n)
  }
  #[inline(always)]
  pub fn get(self) -> u32 {
    self.0
  }
  pub fn next_inst(self) -> Self {
    Self(self.0 + Self::STRIDE)
  }
  /// The odd position right before `self`.
  pub fn prev_gap(self) -> Self {
    debug_assert!(self.0 > 0);
    Self(self.0 - 1)
  }
  pub fn distance_to(self, later: Position) -> u32 {
    debug_assert!(self <= later);
    later.0 - self.0
  }
}

impl fmt::Debug for Position {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    if *self == Position::MAX {
      write!(fmt, "p∞")
    } else {
      write!(fmt, "p{}", self.0)
    }
  }
}

//=============================================================================
// Live ranges

/// A contiguous stretch of positions over which a value is live. `start` is
/// inclusive. For overlap and expiry the range is treated as `[start, end)`;
/// when asking which range a position belongs to, `end` counts too, because a
/// range built from a use ends exactly at that use.
#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct LiveRange {
  pub start: Position,
  pub end: Position,
  /// Use positions inside the range, in increasing order. Only the online
  /// allocator relies on these; the interval builder keeps its uses in
  /// `UseContext` instead.
  pub uses: SmallVec<[Position; 4]>,
  pub location: Location,
}

impl LiveRange {
  pub fn new(start: Position, end: Position) -> Self {
    debug_assert!(start <= end);
    Self { start, end, uses: SmallVec::new(), location: Location::None }
  }

  pub fn with_uses(start: Position, end: Position, uses: &[Position]) -> Self {
    debug_assert!(uses.windows(2).all(|w| w[0] < w[1]));
    let mut range = Self::new(start, end);
    range.uses.extend_from_slice(uses);
    range
  }

  pub fn is_empty(&self) -> bool {
    self.start == self.end
  }

  /// Inclusive membership test, see the type documentation.
  pub fn covers(&self, pos: Position) -> bool {
    self.start <= pos && pos <= self.end
  }

  /// Half-open overlap: ranges that merely touch do not overlap.
  pub fn overlaps(&self, other: &LiveRange) -> bool {
    max(self.start, other.start) < min(self.end, other.end)
  }

  /// First recorded use at or after `pos`. A read by the instruction at
  /// `pos` itself counts.
  pub fn next_use_from(&self, pos: Position) -> Option<Position> {
    self.uses.iter().cloned().find(|&u| u >= pos)
  }

  pub fn set_in_register(&mut self, reg: RealReg) {
    self.location = Location::Reg(reg);
  }

  pub fn set_on_stack(&mut self, slot: SpillSlot) {
    self.location = Location::Stack(slot);
  }
}

impl fmt::Debug for LiveRange {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "[{:?}, {:?})", self.start, self.end)?;
    if !self.location.is_none() {
      write!(fmt, "@{:?}", self.location)?;
    }
    if !self.uses.is_empty() {
      write!(fmt, " uses {:?}", self.uses)?;
    }
    Ok(())
  }
}

//=============================================================================
// Intervals

/// Everything known about the lifetime of one virtual register: the ranges
/// during which it lives in a register, and the holes during which it waits
/// on the stack after a split.
#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Interval {
  pub vreg: VirtualReg,
  /// Sorted by start, pairwise non-overlapping.
  pub ranges: Vec<LiveRange>,
  /// Sorted by start; each hole lies between two ranges or after the last.
  pub holes: Vec<LiveRange>,
}

impl Interval {
  pub fn new(vreg: VirtualReg, from: Position, to: Position) -> Self {
    Self { vreg, ranges: vec![LiveRange::new(from, to)], holes: vec![] }
  }

  pub fn start(&self) -> Position {
    self.ranges[0].start
  }

  /// The last range endpoint. Expiry is decided against this.
  pub fn end(&self) -> Position {
    self.ranges[self.ranges.len() - 1].end
  }

  /// Extend the interval so that `[from, to]` is covered, merging with
  /// every range it overlaps or touches.
  pub fn add_range(&mut self, from: Position, to: Position) {
    debug_assert!(from <= to);
    let mut start = from;
    let mut end = to;
    for r in &self.ranges {
      if r.end >= from && r.start <= to {
        start = min(start, r.start);
        end = max(end, r.end);
      }
    }
    self.ranges.retain(|r| r.end < start || r.start > end);
    let ix = self.ranges.iter().position(|r| r.start > start).unwrap_or(self.ranges.len());
    self.ranges.insert(ix, LiveRange::new(start, end));
  }

  /// Narrow the earliest boundary to a definition at `from`. A definition
  /// the interval does not reach yet (nobody reads it) gets its own range up
  /// to `block_end`.
  pub fn set_from(&mut self, from: Position, block_end: Position) {
    match self.ranges.first_mut() {
      Some(first) if first.covers(from) => first.start = from,
      _ => self.add_range(from, block_end),
    }
  }

  /// Index of the first range containing `pos`, endpoints included.
  pub fn range_index_at(&self, pos: Position) -> Option<usize> {
    self.ranges.iter().position(|r| r.covers(pos))
  }

  /// Where the value lives at `pos`. Ranges win over holes when a split
  /// point is shared by both.
  pub fn location_at(&self, pos: Position) -> Location {
    if let Some(ix) = self.range_index_at(pos) {
      return self.ranges[ix].location;
    }
    self.holes.iter().find(|h| h.start <= pos && pos < h.end).map_or(Location::None, |h| h.location)
  }

  /// Do any two ranges of `self` and `other` overlap?
  pub fn intersects(&self, other: &Interval) -> bool {
    self.next_intersection(other, Position::new(0)).is_some()
  }

  /// The earliest position at or after `pos` at which a range of `self` and
  /// a range of `other` overlap.
  pub fn next_intersection(&self, other: &Interval, pos: Position) -> Option<Position> {
    let mut i = 0;
    let mut j = 0;
    while i < self.ranges.len() && j < other.ranges.len() {
      let a = &self.ranges[i];
      let b = &other.ranges[j];
      let lo = max(max(a.start, b.start), pos);
      if lo < min(a.end, b.end) {
        return Some(lo);
      }
      if a.end <= b.end {
        i += 1;
      } else {
        j += 1;
      }
    }
    None
  }

  /// Check the structural invariants: ranges and holes are ordered and
  /// disjoint, and no hole overlaps a range.
  pub fn is_well_formed(&self) -> bool {
    let ordered = |v: &[LiveRange]| {
      v.iter().all(|r| r.start <= r.end) && v.windows(2).all(|w| w[0].end <= w[1].start)
    };
    !self.ranges.is_empty()
      && ordered(&self.ranges)
      && ordered(&self.holes)
      && self.holes.iter().all(|h| self.ranges.iter().all(|r| !r.overlaps(h)))
  }
}

impl fmt::Debug for Interval {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{:?}: {:?}", self.vreg, self.ranges)?;
    if !self.holes.is_empty() {
      write!(fmt, " holes {:?}", self.holes)?;
    }
    Ok(())
  }
}

//=============================================================================
// Use contexts

/// The positions at which a virtual register is read, in strictly
/// increasing order once the analysis is finished.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct UseContext {
  positions: Vec<Position>,
}

impl UseContext {
  pub fn new() -> Self {
    Self { positions: Vec::new() }
  }

  /// Record a use while walking the function backwards. Positions arrive in
  /// non-increasing order; repeats (an instruction reading the same register
  /// twice) are dropped.
  pub fn push_backward(&mut self, pos: Position) {
    match self.positions.last() {
      Some(&last) if last == pos => {}
      Some(&last) => {
        debug_assert!(pos < last);
        self.positions.push(pos)
      }
      None => self.positions.push(pos),
    }
  }

  /// Turn the backward-collected list into increasing order.
  pub fn finish(&mut self) {
    self.positions.reverse();
  }

  pub fn positions(&self) -> &[Position] {
    &self.positions
  }

  pub fn is_empty(&self) -> bool {
    self.positions.is_empty()
  }

  /// The first use strictly after `pos`.
  pub fn next_use_after(&self, pos: Position) -> Option<Position> {
    let ix = self.positions.partition_point(|&u| u <= pos);
    self.positions.get(ix).cloned()
  }

  /// The first use at or after `pos`.
  pub fn next_use_from(&self, pos: Position) -> Option<Position> {
    let ix = self.positions.partition_point(|&u| u < pos);
    self.positions.get(ix).cloned()
  }
}

impl fmt::Debug for UseContext {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{:?}", self.positions)
  }
}
