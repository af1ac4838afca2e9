#![no_main]
use libfuzzer_sys::fuzz_target;

use olive_ra::{self, test_framework as ir};
use olive_regalloc;

static mut COUNTER_GEN: usize = 0;
static mut COUNTER_OK: usize = 0;

fuzz_target!(|func: ir::Func| {
    let (num_gen, num_ok) = unsafe {
        COUNTER_GEN += 1;
        (COUNTER_GEN, COUNTER_OK)
    };

    println!(
        "=== status: #ok/#total: {}/{} == {} ",
        num_ok,
        num_gen,
        100.0 * (num_ok as f64) / (num_gen as f64)
    );

    if olive_ra::validator::validate(&func).is_err() {
        return;
    }

    let opts = olive_regalloc::Options {
        num_regs: olive_ra::fuzzing::NUM_REGS,
        algorithm: olive_regalloc::Algorithm::LinearScan,
        run_checker: true,
        resolve_edges: true,
        ..Default::default()
    };

    match olive_regalloc::allocate_linear_scan(&func, &opts) {
        Ok(_) => unsafe {
            COUNTER_OK += 1;
        },
        Err(err) => {
            if let olive_regalloc::RegAllocError::Checker(_) = &err {
                func.print("func:");
                panic!("lsra.rs: checker error: {}", err);
            }
            println!("allocation error: {}", err);
        }
    }
});
