// Register allocation has to finish on every valid program, however many values a loop keeps
// live. These tests compile generated counted loops that keep all eight integer and all eight
// pointer registers live, mixing arithmetic, loads and stores through the pointers, forward
// conditional branches and switches, and compare every compilation against the interpreter.
// Both the default palette and a reduced palette of eight registers must allocate.

//! Spill convergence tests.

mod common;

use common::{int_abi, random_program, run_both, Shape};
use hirc::compile;
use hirc::core::{CompileOptions, RegBitSet};
use hirc::hir::{CallTable, Memory};
use rand::rngs::StdRng;
use rand::SeedableRng;

const ARGS: [[u64; 2]; 4] = [[0, 0], [3, 1], [9, u64::MAX], [u64::MAX, 5]];

fn every_register_live(switches: bool) -> Shape {
    Shape { segments: 6, ints: 8, ptrs: 8, trips: Some(3), switches }
}

fn check_seeds(seeds: std::ops::Range<u64>, shape: Shape, options: CompileOptions) {
    common::init_logging();
    let abi = int_abi(2, 2);
    for seed in seeds {
        let prog = random_program(&mut StdRng::seed_from_u64(seed), shape);
        let f = match compile(&prog, &abi, &options.clone().with_verify(true)) {
            Ok(f) => f,
            Err(e) => panic!("seed {}: {}", seed, e),
        };
        for args in &ARGS {
            let (want, got) = run_both(&prog, &f, &abi, args, &Memory::new(), CallTable::new);
            assert_eq!(got.outcome.rets, want.outcome.rets, "seed {} args {:?}", seed, args);
            assert_eq!(got.memory.snapshot(), want.memory.snapshot(), "seed {} args {:?}", seed, args);
        }
    }
}

#[test]
fn test_loops_under_full_pressure_allocate() {
    check_seeds(0..200, every_register_live(false), CompileOptions::new());
}

#[test]
fn test_loops_with_switches_allocate_with_eight_registers() {
    let palette = RegBitSet::from_ids(&[0, 1, 2, 3, 6, 7, 8, 9]);
    check_seeds(0..200, every_register_live(true), CompileOptions::new().with_palette(palette));
}
