//! Shared helpers for the integration tests.

#![allow(dead_code)]

use bumpalo::Bump;
use hirc::core::{CompilationSession, CompileOptions, Reg, RegClass};
use hirc::hir::{
    Builder, CallTable, Cond, Interpreter, Label, Memory, Outcome, Program, NIL, P0, P1, P2, P3, P4, P5, P6,
    P7, R0, R1, R2, R3, R4, R5, R6, R7,
};
use hirc::ssa::{build, construct, BinaryOp, Cfg};
use hirc::{compile, AbiDescriptor, CompiledFunction, Emulator};
use rand::rngs::StdRng;
use rand::Rng;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Integer arguments and results.
pub fn int_abi(args: usize, rets: usize) -> AbiDescriptor {
    AbiDescriptor::sysv(&vec![RegClass::Int; args], &vec![RegClass::Int; rets])
        .expect("signature fits in registers")
}

/// Build the CFG of `program` and put it into SSA form.
pub fn ssa_of(program: &Program) -> Cfg {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena, CompileOptions::new().with_verify(true));
    let mut cfg = build::build_cfg(program).expect("program builds");
    construct::construct_ssa(&mut cfg, &session).expect("ssa construction succeeds");
    cfg
}

pub fn compile_with(program: &Program, abi: &AbiDescriptor, options: CompileOptions) -> CompiledFunction {
    compile(program, abi, &options.with_verify(true)).expect("program compiles")
}

/// Final memory state and outcome of one execution.
pub struct Run {
    pub outcome: Outcome,
    pub memory: Memory,
}

/// Run `program` in the interpreter and `compiled` in the emulator with the
/// same arguments, initial memory and external functions.
pub fn run_both(
    program: &Program,
    compiled: &CompiledFunction,
    abi: &AbiDescriptor,
    args: &[u64],
    memory: &Memory,
    calls: impl Fn() -> CallTable,
) -> (Run, Run) {
    let mut want_mem = memory.clone();
    let want = Interpreter::new(program)
        .run(args, &mut want_mem, &mut calls())
        .expect("interpreter finishes");
    let mut got_mem = memory.clone();
    let got = Emulator::new(compiled, abi)
        .run(args, &mut got_mem, &mut calls())
        .expect("emulator finishes");
    (Run { outcome: want, memory: want_mem }, Run { outcome: got, memory: got_mem })
}

/// Assert that interpreter and emulator agree on results and memory.
pub fn assert_equivalent(
    program: &Program,
    compiled: &CompiledFunction,
    abi: &AbiDescriptor,
    args: &[u64],
    memory: &Memory,
    calls: impl Fn() -> CallTable,
) {
    let (want, got) = run_both(program, compiled, abi, args, memory, calls);
    assert_eq!(got.outcome.rets, want.outcome.rets, "results for {:?}", args);
    assert_eq!(got.memory.snapshot(), want.memory.snapshot(), "memory for {:?}", args);
}

/// What [`random_program`] generates.
#[derive(Debug, Clone, Copy)]
pub struct Shape {
    /// Straight-line segments, each ending in a forward branch.
    pub segments: usize,
    /// Integer registers in play, at least four, the two arguments included.
    pub ints: usize,
    /// Pointer registers in play. The upper quarter may hold nil and is
    /// only compared with nil or dereferenced behind such a compare.
    pub ptrs: usize,
    /// Run the segments as a loop body this many times; the counter takes
    /// the last integer register.
    pub trips: Option<i64>,
    /// Let segments end in a switch.
    pub switches: bool,
}

const CONDS: [Cond; 6] = [Cond::Eq, Cond::Ne, Cond::Lt, Cond::Gt, Cond::Ltu, Cond::Geu];
const OPS: [BinaryOp; 6] =
    [BinaryOp::Add, BinaryOp::Sub, BinaryOp::Mul, BinaryOp::And, BinaryOp::Or, BinaryOp::Xor];
const INTS: [Reg; 8] = [R0, R1, R2, R3, R4, R5, R6, R7];
const PTRS: [Reg; 8] = [P0, P1, P2, P3, P4, P5, P6, P7];

/// A terminating program over two integer arguments returning two
/// integers. Every branch inside the body goes forward; the only back edge
/// is the loop latch.
pub fn random_program(rng: &mut StdRng, shape: Shape) -> Program {
    assert!((4..=8).contains(&shape.ints) && shape.ptrs <= 8);
    let ints = &INTS[..shape.ints];
    let ptrs = &PTRS[..shape.ptrs];
    let counter = shape.trips.map(|_| ints[ints.len() - 1]);
    let written = &ints[2..ints.len() - counter.map_or(0, |_| 1)];
    assert!(!written.is_empty());
    let solid = &ptrs[..shape.ptrs - (shape.ptrs + 2) / 4];
    let maybe_nil = &ptrs[solid.len()..];

    let mut b = Builder::new();
    b.load_arg(0, R0);
    b.load_arg(1, R1);
    for &r in &ints[2..] {
        b.iconst(rng.gen_range(-4..8), r);
    }
    for (i, &p) in ptrs.iter().enumerate() {
        b.pconst(0x1000 + 0x100 * i as u64, false, p);
    }
    for &p in maybe_nil {
        let keep = b.label();
        b.br(CONDS[rng.gen_range(0..CONDS.len())], R0, rng.gen_range(0i64..6), keep);
        b.mov(NIL, p);
        b.bind(keep);
    }

    let top = b.label();
    if let (Some(trips), Some(c)) = (shape.trips, counter) {
        b.iconst(trips, c);
        b.bind(top);
    }
    let labels: Vec<Label> = (0..=shape.segments).map(|_| b.label()).collect();
    for k in 0..shape.segments {
        if k > 0 {
            b.bind(labels[k]);
        }
        for _ in 0..rng.gen_range(1..4) {
            let rd = written[rng.gen_range(0..written.len())];
            match rng.gen_range(0..6) {
                0 if !solid.is_empty() => {
                    let p = solid[rng.gen_range(0..solid.len())];
                    b.ld(p, 8 * rng.gen_range(0..4), 8, rd)
                }
                1 if !solid.is_empty() => {
                    let p = solid[rng.gen_range(0..solid.len())];
                    b.st(ints[rng.gen_range(0..ints.len())], p, 8 * rng.gen_range(0..4), 8)
                }
                2 => {
                    let x = ints[rng.gen_range(0..ints.len())];
                    b.alu(OPS[rng.gen_range(0..OPS.len())], x, rng.gen_range(-3i64..6), rd)
                }
                _ => b.alu(
                    OPS[rng.gen_range(0..OPS.len())],
                    ints[rng.gen_range(0..ints.len())],
                    ints[rng.gen_range(0..ints.len())],
                    rd,
                ),
            };
        }
        let to = labels[rng.gen_range(k + 1..=shape.segments)];
        match rng.gen_range(0..4) {
            0 if shape.switches => {
                let v = ints[rng.gen_range(0..ints.len())];
                let table: Vec<(i64, Label)> = (0..rng.gen_range(1..4))
                    .map(|key| (key, labels[rng.gen_range(k + 1..=shape.segments)]))
                    .collect();
                b.bsw(v, &table, to);
            }
            1 if !maybe_nil.is_empty() => {
                let p = maybe_nil[rng.gen_range(0..maybe_nil.len())];
                b.br(if rng.gen_bool(0.5) { Cond::Eq } else { Cond::Ne }, p, 0, to);
            }
            _ => {
                let x = ints[rng.gen_range(0..ints.len())];
                b.br(CONDS[rng.gen_range(0..CONDS.len())], x, rng.gen_range(-2i64..10), to);
            }
        }
    }
    b.bind(labels[shape.segments]);
    if let Some(c) = counter {
        b.sub(c, 1, c);
        b.br(Cond::Ne, c, 0, top);
    }

    // Read every register once more so all of them stay live to the end.
    for &p in solid {
        b.lea(p, 8, p);
        b.ld(p, 0, 8, R3);
        b.add(R2, R3, R2);
    }
    for &p in maybe_nil {
        let skip = b.label();
        b.br(Cond::Eq, p, 0, skip);
        b.ld(p, 0, 8, R3);
        b.add(R2, R3, R2);
        b.bind(skip);
    }
    for &r in ints.iter().filter(|&&r| r != R2) {
        b.alu(BinaryOp::Xor, R2, r, R2);
    }
    b.ret(&[R2, R3]);
    b.finish().expect("generated program is well formed")
}
