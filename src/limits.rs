//! Fixed engine limits.
//!
//! These are compile-time constants rather than a config layer: nothing in
//! this spec is meant to be runtime-tunable, and the wire format (bytecode
//! operand widths) is derived directly from them.

/// Maximum local variable slots per function activation.
///
/// The spec's compiler error text says "too many locals (>1024)", but also
/// pins the `Closure` upvalue descriptor wire format to exactly two bytes
/// per descriptor (one `is_local` byte, one index byte). A one-byte index
/// can only address 256 distinct slots, so the two numbers are in tension.
/// We keep the byte-for-byte wire format (it's the more load-bearing of the
/// two, since it's reused by the round-trip disassembly property) and bind
/// `MAX_LOCALS` to what that format can actually address. See DESIGN.md.
pub const MAX_LOCALS: usize = 256;

/// Maximum upvalues captured by a single function.
pub const MAX_UPVALUES: usize = 255;

/// Maximum positional arguments in a single call.
pub const MAX_ARGS: usize = 255;

/// Maximum entries in a chunk's constant pool before the 24-bit `*Long`
/// opcode variants are required (and beyond which compilation fails).
pub const MAX_CONSTANTS: usize = 1 << 24;

/// Maximum live call frames; exceeding this raises a runtime stack overflow.
pub const MAX_CALL_DEPTH: usize = 64;

/// Maximum forward/backward jump distance encodable in a 16-bit operand.
pub const MAX_JUMP: usize = u16::MAX as usize;

/// Bit width of the hidden per-activation `once` tracker.
pub const ONCE_BITS: u32 = 64;
