#![no_main]
use libfuzzer_sys::fuzz_target;

use olive_ra::{self, emitter, test_framework as ir};
use olive_regalloc;

fuzz_target!(|func: ir::Func| {
    if olive_ra::validator::validate(&func).is_err() || !func.runs_in_emission_order() {
        return;
    }

    let before = match ir::run_func(&func, "Before allocation") {
        Ok(result) => result,
        Err(_) => return,
    };

    let opts = olive_regalloc::Options {
        num_regs: olive_ra::fuzzing::NUM_REGS,
        call_arg_regs: vec![olive_regalloc::RealReg::new(0)],
        algorithm: olive_regalloc::Algorithm::Simple,
        ..Default::default()
    };

    let mut session = emitter::Session::new();
    let mfunc = match emitter::emit_func(&mut session, &func, &opts) {
        Ok(mfunc) => mfunc,
        Err(err) => {
            println!("allocation error: {}", err);
            return;
        }
    };

    let after = ir::run_machine(&mfunc.code, opts.num_regs, "After allocation")
        .expect("machine code should run wherever the function does");

    assert!(before.num_steps <= after.num_steps, "inconsistent trace");
    assert_eq!(
        before.ret_value, after.ret_value,
        "Incorrect interpreter result: expected {:?}, observed {:?}",
        before.ret_value, after.ret_value
    );
    assert_eq!(before.stdout, after.stdout);
});
