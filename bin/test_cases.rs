/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

/// Test cases.  The list of them is right at the bottom, function |find_func|.
/// Add new ones there.
use crate::test_framework::*;

/// A handful of values, one add, no control flow.
fn test_straight_line() -> Func {
  let mut func = Func::new("straight_line");
  func.set_entry("start");

  let a = func.new_virtual_reg();
  let b = func.new_virtual_reg();
  let c = func.new_virtual_reg();
  let d = func.new_virtual_reg();
  let e = func.new_virtual_reg();

  func.block(
    "start",
    vec![
      i_imm(a, 1),
      i_imm(b, 2),
      i_add(c, a, b),
      i_print(c),
      i_mul(d, c, b),
      i_sub(e, d, a),
      i_print(e),
      i_ret(Some(e)),
    ],
  );
  func
}

/// Six values live at once, summed in reverse order of definition. The
/// first one defined is needed last, so it is the first to be spilled.
fn test_pressure() -> Func {
  let mut func = Func::new("pressure");
  func.set_entry("start");

  let vals: Vec<_> = (0..6).map(|_| func.new_virtual_reg()).collect();
  let sums: Vec<_> = (0..5).map(|_| func.new_virtual_reg()).collect();

  let mut insns = vec![];
  for (i, &val) in vals.iter().enumerate() {
    insns.push(i_imm(val, 10 * (i as u32 + 1)));
  }
  insns.push(i_add(sums[0], vals[5], vals[4]));
  insns.push(i_sub(sums[1], sums[0], vals[3]));
  insns.push(i_add(sums[2], sums[1], vals[2]));
  insns.push(i_mul(sums[3], sums[2], vals[1]));
  insns.push(i_sub(sums[4], sums[3], vals[0]));
  insns.push(i_print(sums[4]));
  insns.push(i_ret(Some(sums[4])));

  func.block("start", insns);
  func
}

/// Calls whose arguments are set up while the call registers are held back.
fn test_call_args() -> Func {
  let mut func = Func::new("call_args");
  func.set_entry("start");

  let a = func.new_virtual_reg();
  let b = func.new_virtual_reg();
  let c = func.new_virtual_reg();
  let sum = func.new_virtual_reg();
  let max = func.new_virtual_reg();
  let t = func.new_virtual_reg();

  func.block(
    "start",
    vec![
      i_imm(a, 3),
      i_imm(b, 4),
      i_imm(c, 5),
      i_call(Callee::Sum, sum, &[a, b, c]),
      i_call(Callee::Max, max, &[a, sum]),
      i_print(sum),
      i_sub(t, max, c),
      i_print(t),
      i_ret(Some(t)),
    ],
  );
  func
}

/// Calls surrounded by more live values than there are registers, so
/// arguments have to come back from the stack during argument setup.
fn test_call_pressure() -> Func {
  let mut func = Func::new("call_pressure");
  func.set_entry("start");

  let vals: Vec<_> = (0..5).map(|_| func.new_virtual_reg()).collect();
  let r0 = func.new_virtual_reg();
  let r1 = func.new_virtual_reg();
  let r2 = func.new_virtual_reg();
  let r3 = func.new_virtual_reg();

  let mut insns = vec![];
  for (i, &val) in vals.iter().enumerate() {
    insns.push(i_imm(val, i as u32 + 2));
  }
  insns.push(i_call(Callee::Sum, r0, &[vals[0], vals[1]]));
  insns.push(i_call(Callee::Max, r1, &[vals[2], r0]));
  insns.push(i_mul(r2, r1, vals[3]));
  insns.push(i_call(Callee::Sum, r3, &[r2, vals[4], vals[0]]));
  insns.push(i_print(r3));
  insns.push(i_ret(Some(r3)));

  func.block("start", insns);
  func
}

/// A value crossing into a second block.
fn test_two_blocks() -> Func {
  let mut func = Func::new("two_blocks");
  func.set_entry("start");

  let a = func.new_virtual_reg();
  let b = func.new_virtual_reg();
  let c = func.new_virtual_reg();

  func.block("start", vec![i_imm(a, 7), i_imm(b, 5), i_goto("next")]);
  func.block("next", vec![i_add(c, a, b), i_print(c), i_ret(Some(c))]);
  func
}

/// if/else merging into a phi.
fn test_diamond() -> Func {
  let mut func = Func::new("diamond");
  func.set_entry("start");

  let a = func.new_virtual_reg();
  let b = func.new_virtual_reg();
  let cond = func.new_virtual_reg();
  let then_val = func.new_virtual_reg();
  let else_val = func.new_virtual_reg();
  let merged = func.new_virtual_reg();
  let res = func.new_virtual_reg();

  func.block(
    "start",
    vec![
      i_imm(a, 10),
      i_imm(b, 20),
      i_cmp_lt(cond, a, b),
      i_goto_ctf(cond, "then", "else"),
    ],
  );
  func.block("then", vec![i_add(then_val, a, b), i_goto("join")]);
  func.block("else", vec![i_sub(else_val, b, a), i_goto("join")]);
  func.block(
    "join",
    vec![
      i_phi(merged, &[("then", then_val), ("else", else_val)]),
      i_print(merged),
      i_mul(res, merged, a),
      i_ret(Some(res)),
    ],
  );
  func
}

/// Sum of 0 .. 10 in a loop.
fn test_simple_loop() -> Func {
  let mut func = Func::new("simple_loop");
  func.set_entry("start");

  let i0 = func.new_virtual_reg();
  let s0 = func.new_virtual_reg();
  let n = func.new_virtual_reg();
  let i = func.new_virtual_reg();
  let s = func.new_virtual_reg();
  let cond = func.new_virtual_reg();
  let one = func.new_virtual_reg();
  let i1 = func.new_virtual_reg();
  let s1 = func.new_virtual_reg();

  func.block("start", vec![i_imm(i0, 0), i_imm(s0, 0), i_imm(n, 10), i_goto("header")]);
  func.block(
    "header",
    vec![
      i_phi(i, &[("start", i0), ("body", i1)]),
      i_phi(s, &[("start", s0), ("body", s1)]),
      i_cmp_lt(cond, i, n),
      i_goto_ctf(cond, "body", "exit"),
    ],
  );
  func.block(
    "body",
    vec![i_imm(one, 1), i_add(i1, i, one), i_add(s1, s, i), i_goto("header")],
  );
  func.block("exit", vec![i_print(s), i_ret(Some(s))]);
  func
}

/// The tenth Fibonacci number. Three values rotate through the loop.
fn test_fib() -> Func {
  let mut func = Func::new("fib");
  func.set_entry("start");

  let a0 = func.new_virtual_reg();
  let b0 = func.new_virtual_reg();
  let k0 = func.new_virtual_reg();
  let n = func.new_virtual_reg();
  let one = func.new_virtual_reg();
  let a = func.new_virtual_reg();
  let b = func.new_virtual_reg();
  let k = func.new_virtual_reg();
  let cond = func.new_virtual_reg();
  let a1 = func.new_virtual_reg();
  let b1 = func.new_virtual_reg();
  let k1 = func.new_virtual_reg();

  func.block(
    "start",
    vec![
      i_imm(a0, 0),
      i_imm(b0, 1),
      i_imm(k0, 0),
      i_imm(n, 10),
      i_imm(one, 1),
      i_goto("header"),
    ],
  );
  func.block(
    "header",
    vec![
      i_phi(a, &[("start", a0), ("body", a1)]),
      i_phi(b, &[("start", b0), ("body", b1)]),
      i_phi(k, &[("start", k0), ("body", k1)]),
      i_cmp_lt(cond, k, n),
      i_goto_ctf(cond, "body", "exit"),
    ],
  );
  func.block(
    "body",
    vec![i_copy(a1, b), i_add(b1, a, b), i_add(k1, k, one), i_goto("header")],
  );
  func.block("exit", vec![i_print(a), i_ret(Some(a))]);
  func
}

/// Two loops, one inside the other, with a value defined in the outer loop
/// used by the inner one.
fn test_nested_loops() -> Func {
  let mut func = Func::new("nested_loops");
  func.set_entry("start");

  let zero = func.new_virtual_reg();
  let one = func.new_virtual_reg();
  let n = func.new_virtual_reg();
  let i = func.new_virtual_reg();
  let acc = func.new_virtual_reg();
  let c_outer = func.new_virtual_reg();
  let sq = func.new_virtual_reg();
  let j = func.new_virtual_reg();
  let acc_in = func.new_virtual_reg();
  let c_inner = func.new_virtual_reg();
  let acc_next = func.new_virtual_reg();
  let j1 = func.new_virtual_reg();
  let i1 = func.new_virtual_reg();

  func.block(
    "start",
    vec![i_imm(zero, 0), i_imm(one, 1), i_imm(n, 4), i_goto("outer")],
  );
  func.block(
    "outer",
    vec![
      i_phi(i, &[("start", zero), ("outer_latch", i1)]),
      i_phi(acc, &[("start", zero), ("outer_latch", acc_in)]),
      i_cmp_lt(c_outer, i, n),
      i_goto_ctf(c_outer, "outer_body", "exit"),
    ],
  );
  func.block("outer_body", vec![i_mul(sq, i, i), i_goto("inner")]);
  func.block(
    "inner",
    vec![
      i_phi(j, &[("outer_body", zero), ("inner_body", j1)]),
      i_phi(acc_in, &[("outer_body", acc), ("inner_body", acc_next)]),
      i_cmp_lt(c_inner, j, i),
      i_goto_ctf(c_inner, "inner_body", "outer_latch"),
    ],
  );
  func.block(
    "inner_body",
    vec![i_add(acc_next, acc_in, sq), i_add(j1, j, one), i_goto("inner")],
  );
  func.block("outer_latch", vec![i_add(i1, i, one), i_goto("outer")]);
  func.block("exit", vec![i_print(acc), i_ret(Some(acc))]);
  func
}

pub fn find_func(name: &str) -> Result<Func, Vec<String>> {
  let all_funcs = vec![
    test_straight_line(),
    test_pressure(),
    test_call_args(),
    test_call_pressure(),
    test_two_blocks(),
    test_diamond(),
    test_simple_loop(),
    test_fib(),
    test_nested_loops(),
  ];

  let all_names = all_funcs.iter().map(|func| func.name.clone()).collect();

  for mut cand in all_funcs {
    if cand.name == *name {
      // The cases above are all well formed.
      return match cand.finish() {
        Ok(()) => Ok(cand),
        Err(_) => Err(all_names),
      };
    }
  }

  Err(all_names)
}

pub fn all_names() -> Vec<String> {
  find_func("").err().unwrap_or_default()
}
