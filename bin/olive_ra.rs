/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Driver for the olive allocators: pick a named test function, allocate it
//! with one of the two allocators, and compare what comes out against the
//! interpreter.

use olive_ra::emitter::{emit_func, Session};
use olive_ra::test_cases;
use olive_ra::test_framework::{run_func, run_machine, Func, RunResult};
use olive_ra::validator::validate;
use olive_regalloc::{
  allocate_linear_scan, Algorithm, LinearScanResult, Options, RealReg,
};

use clap;
use log::{error, info};
use pretty_env_logger;
use serde::Serialize;

//=============================================================================
// Top level

/// What `-o` writes out.
#[derive(Serialize)]
enum AllocSummary {
  Simple { name: String, frame_size: u32, num_spills: u32, num_reloads: u32, code_len: usize },
  LinearScan(LinearScanResult),
}

fn main() {
  pretty_env_logger::init();

  let app = clap::App::new("olive-ra")
    .about("a simple program to allow separate testing of the olive allocators")
    .arg(
      clap::Arg::new("num-regs")
        .short('n')
        .long("num-regs")
        .takes_value(true)
        .help("number of registers available (16 if not set)"),
    )
    .arg(
      clap::Arg::new("algorithm")
        .short('a')
        .long("algorithm")
        .takes_value(true)
        .possible_values(["simple", "lsra"])
        .default_value("lsra")
        .help("algorithm name"),
    )
    .arg(
      clap::Arg::new("test")
        .short('t')
        .long("test")
        .takes_value(true)
        .required(true)
        .help("test case name"),
    )
    .arg(
      clap::Arg::new("check")
        .short('c')
        .long("check")
        .help("run the checker on the allocation"),
    )
    .arg(
      clap::Arg::new("resolve")
        .short('r')
        .long("resolve")
        .help("report location mismatches on CFG edges (linear scan)"),
    )
    .arg(
      clap::Arg::new("output")
        .short('o')
        .long("output")
        .takes_value(true)
        .help("write the allocation summary to this file (bincode)"),
    );
  let matches = app.get_matches();

  let func_name = matches.value_of("test").unwrap_or_default();
  let func = match test_cases::find_func(func_name) {
    Ok(func) => func,
    Err(available_func_names) => {
      error!("can't find Func with name '{}'", func_name);
      println!("available func names are:");
      for name in available_func_names {
        println!("     {}", name);
      }
      return;
    }
  };

  let num_regs = match matches.value_of("num-regs").map(|n| n.parse::<usize>()) {
    None => Options::DEFAULT_NUM_REGS,
    Some(Ok(num_regs)) => num_regs,
    Some(Err(err)) => {
      println!("invalid num-regs value: {}", err);
      return;
    }
  };

  let algorithm = match matches.value_of("algorithm") {
    Some("simple") => {
      info!("Using the simple allocator");
      Algorithm::Simple
    }
    _ => {
      info!("Using the linear scan allocator.");
      Algorithm::LinearScan
    }
  };

  let opts = Options {
    num_regs,
    call_arg_regs: vec![RealReg::new(0)],
    algorithm,
    run_checker: matches.is_present("check"),
    resolve_edges: matches.is_present("resolve"),
  };

  if let Err(err) = validate(&func) {
    println!("invalid function: {}", err);
    return;
  }
  func.print("before allocation");

  let summary = match algorithm {
    Algorithm::Simple => simple(&func, &opts),
    Algorithm::LinearScan => linear_scan(&func, &opts),
  };
  let summary = match summary {
    Ok(summary) => summary,
    Err(err) => {
      println!("allocation failed: {}", err);
      return;
    }
  };

  if let Some(path) = matches.value_of("output") {
    let written = bincode::serialize(&summary)
      .map_err(|err| err.to_string())
      .and_then(|bytes| std::fs::write(path, bytes).map_err(|err| err.to_string()));
    if let Err(err) = written {
      println!("can't write '{}': {}", path, err);
    }
  }
}

fn simple(func: &Func, opts: &Options) -> Result<AllocSummary, String> {
  let mut session = Session::new();
  let mfunc = emit_func(&mut session, func, opts).map_err(|err| err.to_string())?;
  mfunc.print("after allocation");
  println!(
    "{} spills, {} reloads, frame size {}",
    mfunc.num_spills, mfunc.num_reloads, mfunc.frame_size
  );

  if func.runs_in_emission_order() {
    let before_regalloc_result = run_func(func, "Before allocation");
    let after_regalloc_result =
      run_machine(&mfunc.code, opts.num_regs, "After allocation");
    println!("");
    check_results(before_regalloc_result, after_regalloc_result)?;
  } else {
    println!("(control flow leaves emission order; not running the machine code)");
  }

  Ok(AllocSummary::Simple {
    name: mfunc.name.clone(),
    frame_size: mfunc.frame_size,
    num_spills: mfunc.num_spills,
    num_reloads: mfunc.num_reloads,
    code_len: mfunc.code.len(),
  })
}

fn linear_scan(func: &Func, opts: &Options) -> Result<AllocSummary, String> {
  let result = allocate_linear_scan(func, opts).map_err(|err| err.to_string())?;
  println!("");
  println!("Intervals after allocation ({} spill slots) {{", result.num_spill_slots);
  for int in result.intervals.iter() {
    println!("  {:?}", int);
  }
  println!("}}");
  for edge_move in result.edge_moves.iter() {
    println!("edge move: {:?}", edge_move);
  }

  let before_regalloc_result = run_func(func, "Before allocation");
  match before_regalloc_result {
    Ok(run) => print!("{}", run.stdout),
    Err(err) => println!("interpreter: {}", err),
  }

  Ok(AllocSummary::LinearScan(result))
}

fn check_results(
  before_regalloc_result: Result<RunResult, String>,
  after_regalloc_result: Result<RunResult, String>,
) -> Result<(), String> {
  match (before_regalloc_result, after_regalloc_result) {
    (Ok(before), Ok(after)) => {
      // Spills and reloads only add steps.
      if before.num_steps > after.num_steps {
        return Err("inconsistent trace".to_string());
      }
      if before.ret_value != after.ret_value {
        return Err(format!(
          "Incorrect interpreter result: expected {:?}, observed {:?}",
          before.ret_value, after.ret_value
        ));
      }
      if before.stdout != after.stdout {
        return Err(format!(
          "Different stdout values before/after regalloc:\n- before:\n{}\n- after:\n{}",
          before.stdout, after.stdout
        ));
      }
      Ok(())
    }
    (Err(before), Err(after)) if before == after => Ok(()),
    (before, after) => Err(format!("runs disagree: {:?} vs {:?}", before, after)),
  }
}

#[cfg(test)]
mod test_utils {
  use super::*;
  use olive_ra::emitter::{EmitError, MachineFunc};
  use olive_regalloc::RegAllocError;

  fn opts(num_regs: usize, algorithm: Algorithm) -> Options {
    Options {
      num_regs,
      call_arg_regs: vec![RealReg::new(0)],
      algorithm,
      run_checker: true,
      resolve_edges: algorithm == Algorithm::LinearScan,
    }
  }

  pub fn run_simple(func_name: &str, num_regs: usize) -> Result<MachineFunc, EmitError> {
    let _ = pretty_env_logger::try_init();
    let func = test_cases::find_func(func_name).unwrap();
    emit_func(&mut Session::new(), &func, &opts(num_regs, Algorithm::Simple))
  }

  pub fn check_simple(func_name: &str, num_regs: usize) {
    let _ = pretty_env_logger::try_init();
    let func = test_cases::find_func(func_name).unwrap();
    validate(&func).unwrap();
    let opts = opts(num_regs, Algorithm::Simple);
    let mfunc = emit_func(&mut Session::new(), &func, &opts).unwrap_or_else(|err| {
      panic!("allocation failed: {}", err);
    });
    mfunc.print("AFTER");
    if func.runs_in_emission_order() {
      check_results(
        run_func(&func, "Before allocation"),
        run_machine(&mfunc.code, num_regs, "After allocation"),
      )
      .unwrap();
    }
  }

  pub fn run_lsra(
    func_name: &str, num_regs: usize,
  ) -> Result<LinearScanResult, RegAllocError> {
    let _ = pretty_env_logger::try_init();
    let func = test_cases::find_func(func_name).unwrap();
    allocate_linear_scan(&func, &opts(num_regs, Algorithm::LinearScan))
  }

  pub fn check_lsra(func_name: &str, num_regs: usize) {
    let result = run_lsra(func_name, num_regs).unwrap_or_else(|err| {
      panic!("allocation failed: {}", err);
    });
    for int in result.intervals.iter() {
      assert!(int.ranges.iter().all(|range| range.location.reg().is_some()));
    }
  }
}

#[test]
fn interpreter_results() {
  let expected: &[(&str, Option<u32>, &str)] = &[
    ("straight_line", Some(5), "3\n5\n"),
    ("pressure", Some(1990), "1990\n"),
    ("call_args", Some(7), "12\n7\n"),
    ("call_pressure", Some(33), "33\n"),
    ("two_blocks", Some(12), "12\n"),
    ("diamond", Some(300), "30\n"),
    ("simple_loop", Some(45), "45\n"),
    ("fib", Some(55), "55\n"),
    ("nested_loops", Some(36), "36\n"),
  ];
  for &(name, ret_value, stdout) in expected {
    let func = test_cases::find_func(name).unwrap();
    validate(&func).unwrap();
    let result = run_func(&func, "interpreter").unwrap();
    assert_eq!((result.ret_value, result.stdout.as_str()), (ret_value, stdout), "{}", name);
  }
}

#[test]
fn emission_order() {
  for name in &["straight_line", "call_args", "two_blocks"] {
    assert!(test_cases::find_func(name).unwrap().runs_in_emission_order(), "{}", name);
  }
  for name in &["diamond", "simple_loop"] {
    assert!(!test_cases::find_func(name).unwrap().runs_in_emission_order(), "{}", name);
  }
}

#[test]
fn unknown_test_lists_the_names() {
  let names = test_cases::find_func("no_such_test").unwrap_err();
  assert!(names.iter().any(|name| name == "fib"));
  assert_eq!(names, test_cases::all_names());
}

#[test]
fn simple_straight_line() {
  assert!(test_utils::run_simple("straight_line", 2).is_err());
  for i in 3..7 {
    test_utils::check_simple("straight_line", i);
  }
}

#[test]
fn simple_pressure() {
  for i in 3..9 {
    test_utils::check_simple("pressure", i);
  }
  // Everything fits.
  let mfunc = test_utils::run_simple("pressure", 8).unwrap();
  assert_eq!(mfunc.num_spills, 0);
  let mfunc = test_utils::run_simple("pressure", 3).unwrap();
  assert!(mfunc.num_spills > 0);
  assert_eq!(mfunc.frame_size, 4 * mfunc.num_spills);
}

#[test]
fn simple_call_args() {
  assert!(test_utils::run_simple("call_args", 3).is_err());
  for i in 4..7 {
    test_utils::check_simple("call_args", i);
  }
}

#[test]
fn simple_call_pressure() {
  for i in 4..8 {
    test_utils::check_simple("call_pressure", i);
  }
}

#[test]
fn simple_two_blocks() {
  for i in 3..6 {
    test_utils::check_simple("two_blocks", i);
  }
}

#[test]
fn simple_merges_pass_the_checker() {
  for name in &["diamond", "simple_loop", "fib", "nested_loops"] {
    for i in 3..7 {
      test_utils::check_simple(name, i);
    }
  }
}

#[test]
fn simple_no_registers() {
  match test_utils::run_simple("straight_line", 0) {
    Err(olive_ra::emitter::EmitError::RegAlloc(
      olive_regalloc::RegAllocError::NoRegisters,
    )) => {}
    Err(err) => panic!("unexpected error {}", err),
    Ok(_) => panic!("allocated with no registers"),
  }
}

#[test]
fn lsra_straight_line() {
  for i in 1..7 {
    test_utils::check_lsra("straight_line", i);
  }
}

#[test]
fn lsra_pressure() {
  for i in 1..9 {
    test_utils::check_lsra("pressure", i);
  }
  let result = test_utils::run_lsra("pressure", 8).unwrap();
  assert_eq!(result.num_spill_slots, 0);
}

#[test]
fn lsra_calls() {
  for name in &["call_args", "call_pressure"] {
    for i in 1..7 {
      test_utils::check_lsra(name, i);
    }
  }
}

#[test]
fn lsra_control_flow() {
  for name in &["two_blocks", "diamond", "simple_loop", "fib", "nested_loops"] {
    for i in 1..7 {
      test_utils::check_lsra(name, i);
    }
  }
}

#[test]
fn lsra_no_registers() {
  assert_eq!(
    test_utils::run_lsra("fib", 0).err(),
    Some(olive_regalloc::RegAllocError::NoRegisters)
  );
}
