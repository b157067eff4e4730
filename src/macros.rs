//! Compound instructions. Each builder returns a `Macro` node whose body is
//! a sequence of primitive (or further macro) instructions; `expand`
//! flattens a program until no `Macro` remains, before execution starts.
//!
//! Builders take explicit operand views plus a scratch view `tmp` with unit
//! step. Scratch is carved up with a single accumulated cursor, so nested
//! builders never overlap; the `*_tmp_len` functions give the exact number
//! of scratch slots a builder consumes. Operand and scratch regions must
//! not overlap.
//!
//! Shared bits are field elements constrained to {0, 1}. The truncation
//! family (`mod2m`, `truncate`, `ltz`, `less_than`) works on values
//! embedded from `(-2^(k-1), 2^(k-1))` for a caller-chosen bit length `k`,
//! blinded by `KAPPA` extra random bits.

use crate::algebra::{modulus, Fq};
use crate::process::{Addr, Inst, Value};

/// Statistical blinding bits for the truncation family.
pub const KAPPA: usize = 8;

/// Splice every `Macro` node in place until none remain. Running the result
/// through `expand` again is a no-op.
pub fn expand(insts: Vec<Inst>) -> Vec<Inst> {
    let mut out = insts;
    while out.iter().any(|i| matches!(i, Inst::Macro(_))) {
        out = out
            .into_iter()
            .flat_map(|i| match i {
                Inst::Macro(body) => body,
                other => vec![other],
            })
            .collect();
    }
    out
}

fn alloc(cursor: &mut usize, len: usize) -> Addr {
    let addr = Addr::new(*cursor);
    *cursor += len;
    addr
}

/// Single-slot view of element `i` of a strided operand.
fn slot(addr: Addr, i: usize) -> Addr {
    Addr::new(addr.at(i))
}

fn public(x: u64) -> Value {
    Value::Public(Fq::from(x))
}

fn pow2(i: usize) -> Fq {
    Fq::from(1u64 << i)
}

/// Unused tuple operand for multiplications that stay local.
fn no_tuple() -> Addr {
    Addr::new(0)
}

/// `dst_i = 1 - src_i` for each of `bits` shared bits.
pub fn bitwise_not(dst: Addr, src: Addr, bits: usize) -> Inst {
    Inst::Macro(vec![
        Inst::Move(dst, vec![public(1); bits]),
        Inst::Sub(dst, dst, src, bits),
    ])
}

pub fn bitwise_and_tmp_len(bits: usize) -> usize {
    2 * bits
}

/// `dst_i = lhs_i * rhs_i`, one consumed tuple per bit.
pub fn bitwise_and(dst: Addr, lhs: Addr, rhs: Addr, bits: usize, tmp: Addr) -> Inst {
    let mut cursor = tmp.offset;
    let rho = alloc(&mut cursor, bits);
    let sigma = alloc(&mut cursor, bits);
    Inst::Macro(vec![
        Inst::GenerateRnTuple(rho, sigma, bits),
        Inst::Mul(dst, lhs, rhs, rho, sigma, bits),
    ])
}

pub fn bitwise_or_tmp_len(bits: usize) -> usize {
    3 * bits
}

/// `dst_i = lhs_i + rhs_i - lhs_i * rhs_i`.
pub fn bitwise_or(dst: Addr, lhs: Addr, rhs: Addr, bits: usize, tmp: Addr) -> Inst {
    let mut cursor = tmp.offset;
    let and_tmp = alloc(&mut cursor, bitwise_and_tmp_len(bits));
    let prod = alloc(&mut cursor, bits);
    Inst::Macro(vec![
        bitwise_and(prod, lhs, rhs, bits, and_tmp),
        Inst::Add(dst, lhs, rhs, bits),
        Inst::Sub(dst, dst, prod, bits),
    ])
}

pub fn bitwise_xor_tmp_len(bits: usize) -> usize {
    3 * bits
}

/// `dst_i = lhs_i + rhs_i - 2 * lhs_i * rhs_i`.
pub fn bitwise_xor(dst: Addr, lhs: Addr, rhs: Addr, bits: usize, tmp: Addr) -> Inst {
    let mut cursor = tmp.offset;
    let and_tmp = alloc(&mut cursor, bitwise_and_tmp_len(bits));
    let prod = alloc(&mut cursor, bits);
    Inst::Macro(vec![
        bitwise_and(prod, lhs, rhs, bits, and_tmp),
        Inst::Add(dst, lhs, rhs, bits),
        Inst::Sub(dst, dst, prod, bits),
        Inst::Sub(dst, dst, prod, bits),
    ])
}

pub fn propagate_generate_tmp_len(bits: usize) -> usize {
    bitwise_xor_tmp_len(bits) + bitwise_and_tmp_len(bits)
}

/// Carry-lookahead pairs: `props_i = lhs_i XOR rhs_i`, `gens_i = lhs_i AND
/// rhs_i`.
pub fn propagate_generate(
    props: Addr,
    gens: Addr,
    lhs: Addr,
    rhs: Addr,
    bits: usize,
    tmp: Addr,
) -> Inst {
    let mut cursor = tmp.offset;
    let xor_tmp = alloc(&mut cursor, bitwise_xor_tmp_len(bits));
    let and_tmp = alloc(&mut cursor, bitwise_and_tmp_len(bits));
    Inst::Macro(vec![
        bitwise_xor(props, lhs, rhs, bits, xor_tmp),
        bitwise_and(gens, lhs, rhs, bits, and_tmp),
    ])
}

pub fn carry_out_tmp_len(bits: usize) -> usize {
    1 + 3 * bits
}

/// Fold `(props, gens)` pairs from bit 0 upward into the adder carry-out:
/// `c_i = gens_i + props_i * c_(i-1)`, with `c_(-1)` the carry-in.
pub fn carry_out(
    dst: Addr,
    props: Addr,
    gens: Addr,
    bits: usize,
    carry_in: bool,
    tmp: Addr,
) -> Inst {
    let mut cursor = tmp.offset;
    let carry = alloc(&mut cursor, 1);

    let mut body = vec![Inst::Move(carry, vec![public(carry_in as u64)])];
    for i in 0..bits {
        let rho = alloc(&mut cursor, 1);
        let sigma = alloc(&mut cursor, 1);
        let prod = alloc(&mut cursor, 1);
        body.push(Inst::GenerateRnTuple(rho, sigma, 1));
        body.push(Inst::Mul(prod, slot(props, i), carry, rho, sigma, 1));
        body.push(Inst::Add(carry, slot(gens, i), prod, 1));
    }
    body.push(Inst::Copy(dst, carry, 1));
    Inst::Macro(body)
}

pub fn bitwise_lt_tmp_len(bits: usize) -> usize {
    3 * bits + propagate_generate_tmp_len(bits) + 1 + carry_out_tmp_len(bits) + 1
}

/// Strict comparison of two bit-decomposed values, least significant bit
/// first: `dst = [lhs < rhs]`. Computed as the complemented carry-out of
/// `lhs + NOT(rhs) + 1`.
pub fn bitwise_lt(dst: Addr, lhs: Addr, rhs: Addr, bits: usize, tmp: Addr) -> Inst {
    let mut cursor = tmp.offset;
    let not_rhs = alloc(&mut cursor, bits);
    let props = alloc(&mut cursor, bits);
    let gens = alloc(&mut cursor, bits);
    let pg_tmp = alloc(&mut cursor, propagate_generate_tmp_len(bits));
    let carry = alloc(&mut cursor, 1);
    let carry_tmp = alloc(&mut cursor, carry_out_tmp_len(bits));
    let one = alloc(&mut cursor, 1);
    Inst::Macro(vec![
        bitwise_not(not_rhs, rhs, bits),
        propagate_generate(props, gens, lhs, not_rhs, bits, pg_tmp),
        carry_out(carry, props, gens, bits, true, carry_tmp),
        Inst::Move(one, vec![public(1)]),
        Inst::Sub(dst, one, carry, 1),
    ])
}

pub fn bit_decompose_tmp_len() -> usize {
    3
}

/// Decompose a public value into `bits` public bits, least significant
/// first, by repeated reduction modulo two.
pub fn bit_decompose(dst: Addr, src: Addr, bits: usize, tmp: Addr) -> Inst {
    let mut cursor = tmp.offset;
    let current = alloc(&mut cursor, 1);
    let two = alloc(&mut cursor, 1);
    let half = alloc(&mut cursor, 1);

    let mut body = vec![
        Inst::Copy(current, src, 1),
        Inst::Move(two, vec![public(2)]),
        Inst::Move(half, vec![Value::Public(Fq::from(2).inv())]),
    ];
    for i in 0..bits {
        body.push(Inst::Mod(slot(dst, i), current, two, 1));
        body.push(Inst::Sub(current, current, slot(dst, i), 1));
        body.push(Inst::Mul(current, current, half, no_tuple(), no_tuple(), 1));
    }
    Inst::Macro(body)
}

pub fn rand_bit_tmp_len() -> usize {
    11
}

/// A uniformly random shared bit. The parties square a random share, open
/// the square, take the public root (the modulus is 3 mod 4) and map
/// `r / sqrt(r^2)` from {-1, 1} to {0, 1}. Fails on the negligible chance
/// that the random value is zero.
pub fn rand_bit(dst: Addr, tmp: Addr) -> Inst {
    let mut cursor = tmp.offset;
    let r = alloc(&mut cursor, 1);
    let rho = alloc(&mut cursor, 1);
    let sigma = alloc(&mut cursor, 1);
    let square = alloc(&mut cursor, 1);
    let exponent = alloc(&mut cursor, 1);
    let root = alloc(&mut cursor, 1);
    let root_inv = alloc(&mut cursor, 1);
    let unit = alloc(&mut cursor, 1);
    let one = alloc(&mut cursor, 1);
    let half = alloc(&mut cursor, 1);
    let shifted = alloc(&mut cursor, 1);

    let sqrt_exp = Fq::new((modulus() + 1u32) / 4u32);
    Inst::Macro(vec![
        Inst::GenerateRn(r, 1),
        Inst::GenerateRnTuple(rho, sigma, 1),
        Inst::Mul(square, r, r, rho, sigma, 1),
        Inst::Open(square, square, 1),
        Inst::Move(exponent, vec![Value::Public(sqrt_exp)]),
        Inst::Exp(root, square, exponent, 1),
        Inst::Inv(root_inv, root, 1),
        Inst::Mul(unit, r, root_inv, no_tuple(), no_tuple(), 1),
        Inst::Move(one, vec![public(1)]),
        Inst::Move(half, vec![Value::Public(Fq::from(2).inv())]),
        Inst::Add(shifted, unit, one, 1),
        Inst::Mul(dst, shifted, half, no_tuple(), no_tuple(), 1),
    ])
}

pub fn mod2m_tmp_len(k: usize, m: usize) -> usize {
    12 * m + k + KAPPA + 29
}

/// `dst = src mod 2^m` for a private `src` in `[0, 2^k)`. The source is
/// blinded with `m` random low bits and `k + KAPPA - m` random high bits,
/// opened, reduced in public, and the borrow is repaired with a bitwise
/// comparison against the low random bits.
pub fn mod2m(dst: Addr, src: Addr, k: usize, m: usize, tmp: Addr) -> Inst {
    assert!(m >= 1 && m < k, "mod2m needs 1 <= m < k");
    assert!(k + KAPPA <= 62, "mod2m blinding must stay below the modulus");
    let high_bits = k + KAPPA - m;

    let mut cursor = tmp.offset;
    let low = alloc(&mut cursor, m);
    let high = alloc(&mut cursor, high_bits);
    let rb_tmp = alloc(&mut cursor, rand_bit_tmp_len());
    let acc_low = alloc(&mut cursor, 1);
    let acc_high = alloc(&mut cursor, 1);
    let power = alloc(&mut cursor, 1);
    let term = alloc(&mut cursor, 1);
    let two_m = alloc(&mut cursor, 1);
    let high_term = alloc(&mut cursor, 1);
    let sum = alloc(&mut cursor, 1);
    let opened = alloc(&mut cursor, 1);
    let opened_low = alloc(&mut cursor, 1);
    let opened_bits = alloc(&mut cursor, m);
    let decomp_tmp = alloc(&mut cursor, bit_decompose_tmp_len());
    let borrow = alloc(&mut cursor, 1);
    let lt_tmp = alloc(&mut cursor, bitwise_lt_tmp_len(m));
    let unfixed = alloc(&mut cursor, 1);
    let fix = alloc(&mut cursor, 1);

    let mut body = Vec::new();
    for i in 0..m {
        body.push(rand_bit(slot(low, i), rb_tmp));
    }
    for i in 0..high_bits {
        body.push(rand_bit(slot(high, i), rb_tmp));
    }

    // r_low = sum 2^i * low_i, r_high = sum 2^i * high_i
    body.push(Inst::Move(acc_low, vec![public(0)]));
    for i in 0..m {
        body.push(Inst::Move(power, vec![Value::Public(pow2(i))]));
        body.push(Inst::Mul(term, slot(low, i), power, no_tuple(), no_tuple(), 1));
        body.push(Inst::Add(acc_low, acc_low, term, 1));
    }
    body.push(Inst::Move(acc_high, vec![public(0)]));
    for i in 0..high_bits {
        body.push(Inst::Move(power, vec![Value::Public(pow2(i))]));
        body.push(Inst::Mul(term, slot(high, i), power, no_tuple(), no_tuple(), 1));
        body.push(Inst::Add(acc_high, acc_high, term, 1));
    }

    // c = open(src + r_low + 2^m * r_high), all below the modulus
    body.push(Inst::Move(two_m, vec![Value::Public(pow2(m))]));
    body.push(Inst::Mul(high_term, acc_high, two_m, no_tuple(), no_tuple(), 1));
    body.push(Inst::Add(sum, src, acc_low, 1));
    body.push(Inst::Add(sum, sum, high_term, 1));
    body.push(Inst::Open(opened, sum, 1));

    // dst = (c mod 2^m) - r_low + 2^m * [c mod 2^m < r_low]
    body.push(Inst::Mod(opened_low, opened, two_m, 1));
    body.push(bit_decompose(opened_bits, opened_low, m, decomp_tmp));
    body.push(bitwise_lt(borrow, opened_bits, low, m, lt_tmp));
    body.push(Inst::Sub(unfixed, opened_low, acc_low, 1));
    body.push(Inst::Mul(fix, borrow, two_m, no_tuple(), no_tuple(), 1));
    body.push(Inst::Add(dst, unfixed, fix, 1));
    Inst::Macro(body)
}

pub fn truncate_tmp_len(k: usize, m: usize) -> usize {
    3 + mod2m_tmp_len(k, m)
}

/// `dst = floor(src / 2^m)` for a private `src` in `[0, 2^k)`.
pub fn truncate(dst: Addr, src: Addr, k: usize, m: usize, tmp: Addr) -> Inst {
    let mut cursor = tmp.offset;
    let low = alloc(&mut cursor, 1);
    let diff = alloc(&mut cursor, 1);
    let scale = alloc(&mut cursor, 1);
    let mod_tmp = alloc(&mut cursor, mod2m_tmp_len(k, m));
    Inst::Macro(vec![
        mod2m(low, src, k, m, mod_tmp),
        Inst::Sub(diff, src, low, 1),
        Inst::Move(scale, vec![Value::Public(pow2(m).inv())]),
        Inst::Mul(dst, diff, scale, no_tuple(), no_tuple(), 1),
    ])
}

pub fn ltz_tmp_len(k: usize) -> usize {
    4 + truncate_tmp_len(k, k - 1)
}

/// `dst = [src < 0]` for a private `src` embedded from
/// `(-2^(k-1), 2^(k-1))`: shift into `[0, 2^k)` and read the sign bit.
pub fn ltz(dst: Addr, src: Addr, k: usize, tmp: Addr) -> Inst {
    let mut cursor = tmp.offset;
    let shifted = alloc(&mut cursor, 1);
    let offset = alloc(&mut cursor, 1);
    let sign = alloc(&mut cursor, 1);
    let one = alloc(&mut cursor, 1);
    let trunc_tmp = alloc(&mut cursor, truncate_tmp_len(k, k - 1));
    Inst::Macro(vec![
        Inst::Move(offset, vec![Value::Public(pow2(k - 1))]),
        Inst::Add(shifted, src, offset, 1),
        truncate(sign, shifted, k, k - 1, trunc_tmp),
        Inst::Move(one, vec![public(1)]),
        Inst::Sub(dst, one, sign, 1),
    ])
}

pub fn less_than_tmp_len(k: usize) -> usize {
    1 + ltz_tmp_len(k + 1)
}

/// Signed comparison `dst = [lhs < rhs]` of private values embedded from
/// `(-2^(k-1), 2^(k-1))`.
pub fn less_than(dst: Addr, lhs: Addr, rhs: Addr, k: usize, tmp: Addr) -> Inst {
    let mut cursor = tmp.offset;
    let diff = alloc(&mut cursor, 1);
    let ltz_tmp = alloc(&mut cursor, ltz_tmp_len(k + 1));
    Inst::Macro(vec![
        Inst::Sub(diff, lhs, rhs, 1),
        ltz(dst, diff, k + 1, ltz_tmp),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_macros(insts: &[Inst]) -> usize {
        insts.iter().filter(|i| matches!(i, Inst::Macro(_))).count()
    }

    #[test]
    fn test_expand_flattens_nested_macros() {
        let inner = Inst::Macro(vec![
            Inst::Move(Addr::new(0), vec![public(1)]),
            Inst::Macro(vec![Inst::Move(Addr::new(1), vec![public(2)])]),
        ]);
        let program = vec![inner, Inst::Exit(Addr::new(0), 1)];
        let expanded = expand(program);
        assert_eq!(count_macros(&expanded), 0);
        assert_eq!(
            expanded,
            vec![
                Inst::Move(Addr::new(0), vec![public(1)]),
                Inst::Move(Addr::new(1), vec![public(2)]),
                Inst::Exit(Addr::new(0), 1),
            ]
        );
    }

    #[test]
    fn test_expand_is_idempotent() {
        let program = vec![
            bitwise_lt(Addr::new(0), Addr::new(1), Addr::new(3), 2, Addr::new(10)),
            Inst::Exit(Addr::new(0), 1),
        ];
        let once = expand(program);
        assert_eq!(count_macros(&once), 0);
        let twice = expand(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_carry_out_shape() {
        let bits = 4;
        let expanded = expand(vec![carry_out(
            Addr::new(0),
            Addr::new(1),
            Addr::new(5),
            bits,
            false,
            Addr::new(20),
        )]);
        // one tuple and one engine multiplication per folded bit
        let tuples = expanded
            .iter()
            .filter(|i| matches!(i, Inst::GenerateRnTuple(_, _, _)))
            .count();
        assert_eq!(tuples, bits);
        let muls = expanded
            .iter()
            .filter(|i| matches!(i, Inst::Mul(_, _, _, _, _, _)))
            .count();
        assert_eq!(muls, bits);
    }

    #[test]
    fn test_scratch_regions_do_not_overlap() {
        let bits = 3;
        let tmp = Addr::new(100);
        let expanded = expand(vec![bitwise_lt(
            Addr::new(0),
            Addr::new(1),
            Addr::new(4),
            bits,
            tmp,
        )]);
        let limit = tmp.offset + bitwise_lt_tmp_len(bits);
        let mut max_seen = 0;
        for inst in &expanded {
            let addrs: Vec<(Addr, usize)> = match inst {
                Inst::Move(dst, vals) => vec![(*dst, vals.len())],
                Inst::Copy(d, s, n) => vec![(*d, *n), (*s, *n)],
                Inst::Add(d, l, r, n) | Inst::Sub(d, l, r, n) => {
                    vec![(*d, *n), (*l, *n), (*r, *n)]
                }
                Inst::Mul(d, l, r, rho, sigma, n) => {
                    vec![(*d, *n), (*l, *n), (*r, *n), (*rho, *n), (*sigma, *n)]
                }
                Inst::GenerateRnTuple(rho, sigma, n) => vec![(*rho, *n), (*sigma, *n)],
                _ => vec![],
            };
            for (addr, n) in addrs {
                if addr.offset >= tmp.offset {
                    max_seen = max_seen.max(addr.at(n.saturating_sub(1)));
                }
            }
        }
        assert!(max_seen < limit, "scratch ran past its stated length");
    }

    #[test]
    #[should_panic(expected = "mod2m")]
    fn test_mod2m_rejects_bad_split() {
        mod2m(Addr::new(0), Addr::new(1), 2, 2, Addr::new(10));
    }
}
