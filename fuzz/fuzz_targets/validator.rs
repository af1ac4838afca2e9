#![no_main]
use libfuzzer_sys::fuzz_target;

use olive_ra::{self, test_framework as ir};

fuzz_target!(|func: ir::Func| {
    // The generator only builds well-formed functions.
    if let Err(err) = olive_ra::validator::validate(&func) {
        func.print("func:");
        panic!("validator.rs: generated function is invalid: {}", err);
    }
    let _ = ir::run_func(&func, "fuzz");
});
