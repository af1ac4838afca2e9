#![no_main]
use libfuzzer_sys::fuzz_target;

use olive_ra::{self, emitter, test_framework as ir};
use olive_regalloc;

fuzz_target!(|func: ir::Func| {
    if olive_ra::validator::validate(&func).is_err() {
        return;
    }

    let opts = olive_regalloc::Options {
        num_regs: olive_ra::fuzzing::NUM_REGS,
        call_arg_regs: vec![olive_regalloc::RealReg::new(0)],
        algorithm: olive_regalloc::Algorithm::Simple,
        run_checker: true,
        ..Default::default()
    };

    let mut session = emitter::Session::new();
    if let Err(err) = emitter::emit_func(&mut session, &func, &opts) {
        match &err {
            emitter::EmitError::RegAlloc(olive_regalloc::RegAllocError::Checker(_)) => {
                func.print("func:");
                panic!("simple.rs: checker error: {}", err);
            }
            _ => println!("allocation error: {}", err),
        }
    }
});
