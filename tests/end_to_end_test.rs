// These tests drive complete compilations and check the result by execution. Every program is
// run twice: once by the HIR interpreter, once by compiling it through the whole pipeline and
// running the flat x86-64 stream on the emulator. The two runs must agree on the returned
// values and on the final memory contents. The programs cover loops with loop-invariant
// constants, register pressure that forces spilling under a reduced palette, calls that
// clobber the caller-saved registers, pointer stores through the write barrier in both flag
// states, and the shape cache in front of the compiler.

//! End-to-end compilation tests.

mod common;

use common::{assert_equivalent, compile_with, init_logging, int_abi};
use hirc::core::{CompileOptions, RegBitSet, RegClass};
use hirc::hir::{Builder, CallTable, Cond, Memory, Program, P0, P1, P2, R0, R1, R2, R3, R4, R5, R6, R7};
use hirc::linearize::Flat;
use hirc::ssa::{CallHandle, IrNode, SpillOp};
use hirc::{compile, compile_cached, AbiDescriptor, ShapeCache};
use std::sync::Arc;

fn no_calls() -> CallTable {
    CallTable::new()
}

/// `r = 0; while n != 0 { r += n * 1 + 2 + 3 + 4 + 5; n -= 1 }`
fn countdown_with_constants() -> Program {
    let mut b = Builder::new();
    let top = b.label();
    b.load_arg(0, R0);
    b.iconst(1, R1);
    b.iconst(2, R2);
    b.iconst(3, R3);
    b.iconst(4, R4);
    b.iconst(5, R5);
    b.iconst(0, R6);
    b.bind(top);
    b.alu(hirc::ssa::BinaryOp::Mul, R0, R1, R7);
    b.add(R7, R2, R7);
    b.add(R7, R3, R7);
    b.add(R7, R4, R7);
    b.add(R7, R5, R7);
    b.add(R6, R7, R6);
    b.sub(R0, 1, R0);
    b.br(Cond::Ne, R0, 0, top);
    b.ret(&[R6]);
    b.finish().unwrap()
}

/// Eight values live at once, combined pairwise.
fn pressure() -> Program {
    let mut b = Builder::new();
    let regs = [R0, R1, R2, R3, R4, R5, R6, R7];
    b.load_arg(0, R0);
    b.load_arg(1, R1);
    for (i, &r) in regs.iter().enumerate().skip(2) {
        b.alu(hirc::ssa::BinaryOp::Mul, R0, R1, r);
        b.add(r, i as i64, r);
        b.alu(hirc::ssa::BinaryOp::Xor, r, R0, r);
    }
    b.pconst(0x2000, false, P0);
    b.st(R1, P0, 0, 8);
    b.lea(P0, 16, P1);
    for w in regs.windows(2) {
        b.alu(hirc::ssa::BinaryOp::Add, w[0], w[1], w[0]);
    }
    b.st(R6, P1, 0, 8);
    b.ld(P0, 0, 8, R7);
    b.ret(&[R0, R7]);
    b.finish().unwrap()
}

#[test]
fn test_countdown_loop_matches_interpreter() {
    init_logging();
    let prog = countdown_with_constants();
    let abi = int_abi(1, 1);
    let f = compile_with(&prog, &abi, CompileOptions::new());
    for n in [1u64, 2, 5, 13] {
        assert_equivalent(&prog, &f, &abi, &[n], &Memory::new(), no_calls);
    }
    // The loop keeps the constants in registers; nothing needs a slot.
    assert_eq!(f.stats.spill_stores, 0);
    assert!(f.frame.spill_slots.is_empty());
}

#[test]
fn test_small_palette_forces_spills() {
    init_logging();
    let prog = pressure();
    let abi = int_abi(2, 2);
    let options = CompileOptions::new().with_palette(RegBitSet::from_ids(&[0, 1, 2, 3]));
    let f = compile_with(&prog, &abi, options);

    assert!(f.stats.spill_stores > 0);
    assert!(!f.frame.spill_slots.is_empty());
    let stores = f
        .code
        .iter()
        .filter(|i| matches!(i, Flat::Ins(IrNode::Spill { op: SpillOp::Store, .. })))
        .count();
    let reloads = f
        .code
        .iter()
        .filter(|i| matches!(i, Flat::Ins(IrNode::Spill { op: SpillOp::Reload, .. })))
        .count();
    assert!(stores > 0 && reloads > 0);

    // Every live pointer slot at a point must be a slot some store fills.
    let ptr_slots: Vec<_> = f
        .code
        .iter()
        .filter_map(|i| match i {
            Flat::Ins(IrNode::Spill { op: SpillOp::Store, slot, .. }) if slot.ptr => Some(*slot),
            _ => None,
        })
        .collect();
    for live in f.pointer_liveness.values() {
        assert!(!live.is_empty());
        assert!(live.iter().all(|s| s.ptr && ptr_slots.contains(s)));
    }
    for pc in 0..f.code.len() {
        assert!(f.slots_live_at(pc).iter().all(|s| s.ptr));
    }

    for args in [[0u64, 0], [3, 4], [u64::MAX, 7]] {
        assert_equivalent(&prog, &f, &abi, &args, &Memory::new(), no_calls);
    }
}

#[test]
fn test_values_survive_calls() {
    let callee = CallHandle::new(1, "mix", int_abi(2, 1));
    let mut b = Builder::new();
    b.load_arg(0, R0);
    b.load_arg(1, R1);
    b.add(R0, 100, R2);
    b.call(callee.clone(), &[R0, R1], &[R3]);
    b.call(callee, &[R3, R2], &[R4]);
    b.add(R4, R2, R4);
    b.add(R4, R1, R4);
    b.ret(&[R4, R3]);
    let prog = b.finish().unwrap();
    let abi = int_abi(2, 2);
    let f = compile_with(&prog, &abi, CompileOptions::new());

    let calls = || {
        let mut t = CallTable::new();
        t.register(1, |args: &[u64], _: &mut Memory| vec![args[0].wrapping_mul(3).wrapping_add(args[1])]);
        t
    };
    for args in [[1u64, 2], [40, 2], [7, u64::MAX]] {
        assert_equivalent(&prog, &f, &abi, &args, &Memory::new(), calls);
    }
}

#[test]
fn test_write_barrier_paths() {
    const FLAG: u64 = 0x500;
    let barrier = CallHandle::new(9, "barrier", AbiDescriptor::sysv(&[RegClass::Ptr, RegClass::Ptr], &[]).unwrap());
    let mut b = Builder::new();
    b.load_arg(0, P0);
    b.load_arg(1, P1);
    b.sp(P1, P0, 8, FLAG, barrier.clone());
    b.sp(P0, P1, 0, FLAG, barrier);
    b.iconst(1, R0);
    b.ret(&[R0]);
    let prog = b.finish().unwrap();
    let abi = AbiDescriptor::sysv(&[RegClass::Ptr, RegClass::Ptr], &[RegClass::Int]).unwrap();
    let f = compile_with(&prog, &abi, CompileOptions::new());

    // The slow path performs the store and counts itself.
    let calls = || {
        let mut t = CallTable::new();
        t.register(9, |args: &[u64], mem: &mut Memory| {
            mem.write(args[1], 8, args[0]);
            let seen = mem.read(0x600, 8);
            mem.write(0x600, 8, seen + 1);
            Vec::new()
        });
        t
    };
    let clear = Memory::new();
    let mut set = Memory::new();
    set.write(FLAG, 1, 1);
    for mem in [&clear, &set] {
        assert_equivalent(&prog, &f, &abi, &[0x1000, 0x3000], mem, calls);
    }
    let (_, got) = common::run_both(&prog, &f, &abi, &[0x1000, 0x3000], &set, calls);
    assert_eq!(got.memory.read(0x600, 8), 2);
    assert_eq!(got.memory.read(0x1008, 8), 0x3000);
}

#[test]
fn test_memory_operations() {
    let mut b = Builder::new();
    let len = R2;
    b.load_arg(0, P0);
    b.load_arg(1, R0);
    b.st(R0, P0, 0, 4);
    b.st(R0, P0, 6, 2);
    b.ld(P0, 0, 1, R1);
    b.lea(P0, 32, P1);
    b.iconst(8, len);
    b.bcopy(P0, P1, len);
    b.bzero(P0, 2);
    b.ld(P1, 6, 2, R3);
    b.add(R1, R3, R1);
    b.brk();
    b.lp(P0, 48, P2);
    b.ld(P2, 0, 8, R4);
    b.add(R1, R4, R1);
    b.ret(&[R1]);
    let prog = b.finish().unwrap();
    let abi = AbiDescriptor::sysv(&[RegClass::Ptr, RegClass::Int], &[RegClass::Int]).unwrap();
    let f = compile_with(&prog, &abi, CompileOptions::new());
    let mut mem = Memory::new();
    mem.write(0x4000 + 40, 8, 0xffff_ffff_ffff_ffff);
    mem.write(0x4000 + 48, 8, 0x5000);
    mem.write(0x5000, 8, 77);
    for v in [0u64, 0x1234_5678, u64::MAX] {
        assert_equivalent(&prog, &f, &abi, &[0x4000, v], &mem, no_calls);
    }
}

#[test]
fn test_switch_dispatch() {
    let mut b = Builder::new();
    let (one, two, five, other, done) = (b.label(), b.label(), b.label(), b.label(), b.label());
    b.load_arg(0, R0);
    b.bsw(R0, &[(1, one), (2, two), (5, five)], other);
    b.bind(one);
    b.iconst(10, R1);
    b.jmp(done);
    b.bind(two);
    b.iconst(20, R1);
    b.jmp(done);
    b.bind(five);
    b.iconst(50, R1);
    b.jmp(done);
    b.bind(other);
    b.add(R0, 1000, R1);
    b.bind(done);
    b.ret(&[R1]);
    let prog = b.finish().unwrap();
    let abi = int_abi(1, 1);
    let f = compile_with(&prog, &abi, CompileOptions::new());
    for n in [0u64, 1, 2, 3, 5, u64::MAX] {
        assert_equivalent(&prog, &f, &abi, &[n], &Memory::new(), no_calls);
    }
}

#[test]
fn test_pointer_nil_checks_compile() {
    // p == nil ? 2 : (p == q ? 1 : 0)
    let mut b = Builder::new();
    let (nil, same) = (b.label(), b.label());
    b.load_arg(0, P0);
    b.load_arg(1, P1);
    b.br(Cond::Eq, P0, 0, nil);
    b.br(Cond::Eq, P0, P1, same);
    b.iconst(0, R0);
    b.ret(&[R0]);
    b.bind(same);
    b.iconst(1, R0);
    b.ret(&[R0]);
    b.bind(nil);
    b.iconst(2, R0);
    b.ret(&[R0]);
    let prog = b.finish().unwrap();

    let abi = AbiDescriptor::sysv(&[RegClass::Ptr, RegClass::Ptr], &[RegClass::Int]).unwrap();
    let f = compile_with(&prog, &abi, CompileOptions::new());
    for args in [[0u64, 0], [0x1000, 0x1000], [0x1000, 0x2000], [0x1000, 0]] {
        assert_equivalent(&prog, &f, &abi, &args, &Memory::new(), no_calls);
    }
}

#[test]
fn test_compilation_is_deterministic() {
    let prog = countdown_with_constants();
    let abi = int_abi(1, 1);
    let a = compile(&prog, &abi, &CompileOptions::new()).unwrap();
    let b = compile(&prog, &abi, &CompileOptions::new()).unwrap();
    assert_eq!(a.code, b.code);
    assert_eq!(a.block_offsets, b.block_offsets);
    assert_eq!(a.frame.frame_size, b.frame.frame_size);
}

#[test]
fn test_shape_cache_shares_results() {
    let cache: ShapeCache<(&str, usize), _> = ShapeCache::new();
    let abi = int_abi(1, 1);
    let prog = countdown_with_constants();
    let first = compile_cached(&cache, &("countdown", 1), &prog, &abi, &CompileOptions::new()).unwrap();
    let again = compile_cached(&cache, &("countdown", 1), &prog, &abi, &CompileOptions::new()).unwrap();
    let other = compile_cached(&cache, &("countdown", 2), &prog, &abi, &CompileOptions::new()).unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert!(!Arc::ptr_eq(&first, &other));
    assert_eq!(cache.len(), 2);
    assert_eq!(first.code, other.code);
}
