//! A minimal x86 / x86-64 encoder. Instructions are staged in a
//! 15-byte buffer (the maximum x86 instruction length) and flushed into
//! the code vector one at a time; branch and relocation sites hand back
//! the offset of their trailing 32-bit field for later patching.
//!
//! In 64-bit mode operations carry REX prefixes as needed; in 32-bit
//! mode the same opcode map applies with no REX and no extended
//! registers.

use arrayvec::ArrayVec;

/// rax / eax.
pub(crate) const RAX: u8 = 0;
/// rcx / ecx.
pub(crate) const RCX: u8 = 1;
/// rdx / edx.
pub(crate) const RDX: u8 = 2;
/// rsp / esp.
pub(crate) const RSP: u8 = 4;
/// rbp / ebp.
pub(crate) const RBP: u8 = 5;
/// r8 (64-bit only).
pub(crate) const R8: u8 = 8;
/// r9 (64-bit only).
pub(crate) const R9: u8 = 9;
/// xmm0.
pub(crate) const XMM0: u8 = 0;
/// xmm1.
pub(crate) const XMM1: u8 = 1;

/// A condition code, encoded as the low nibble of `setcc`/`jcc`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum CC {
  /// equal / zero
  E = 0x4,
  /// not equal
  Ne = 0x5,
  /// signed less
  L = 0xC,
  /// signed greater or equal
  Ge = 0xD,
  /// signed less or equal
  Le = 0xE,
  /// signed greater
  G = 0xF,
  /// unsigned below
  B = 0x2,
  /// unsigned above or equal
  Ae = 0x3,
  /// unsigned below or equal
  Be = 0x6,
  /// unsigned above
  A = 0x7,
}

/// The operation width of an integer instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum OpSize {
  /// 32-bit operation.
  W4,
  /// 64-bit operation (REX.W); invalid on the 32-bit target.
  W8,
}

impl OpSize {
  fn wide(self) -> bool { self == OpSize::W8 }
}

/// The access width and extension of a memory load.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum LoadKind {
  /// Zero-extending byte load (`bool`).
  Zx8,
  /// Sign-extending byte load (`char`).
  Sx8,
  /// Doubleword load.
  W4,
  /// Quadword load.
  W8,
}

/// A two-operand ALU operation, named by its `r/m, r` opcode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Alu {
  /// `add`
  Add = 0x01,
  /// `or`
  Or = 0x09,
  /// `and`
  And = 0x21,
  /// `sub`
  Sub = 0x29,
  /// `xor`
  Xor = 0x31,
  /// `cmp`
  Cmp = 0x39,
}

/// A scalar SSE arithmetic operation (`addss`-family opcode byte).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Sse {
  /// `adds[sd]`
  Add = 0x58,
  /// `muls[sd]`
  Mul = 0x59,
  /// `subs[sd]`
  Sub = 0x5C,
  /// `divs[sd]`
  Div = 0x5E,
}

/// The instruction sink: encoded bytes plus the staging buffer.
pub(crate) struct Emitter {
  /// The encoded code.
  pub code: Vec<u8>,
  /// True when encoding for x86-64.
  pub x64: bool,
  buf: ArrayVec<u8, 15>,
}

impl Emitter {
  pub fn new(x64: bool) -> Self {
    Self { code: vec![], x64, buf: ArrayVec::new() }
  }

  /// The current code offset.
  pub fn pos(&self) -> u32 {
    u32::try_from(self.code.len()).expect("code too large")
  }

  fn push_u8(&mut self, b: u8) { self.buf.push(b) }

  fn push_u32(&mut self, n: u32) {
    self.buf.try_extend_from_slice(&n.to_le_bytes()).expect("instruction overflow");
  }

  fn push_i32(&mut self, n: i32) { self.push_u32(n as u32) }

  fn flush(&mut self) {
    self.code.extend_from_slice(&self.buf);
    self.buf.clear();
  }

  /// Patch a previously returned 32-bit field.
  pub fn patch_i32(&mut self, at: u32, val: i32) {
    let at = at as usize;
    self.code[at..at + 4].copy_from_slice(&val.to_le_bytes());
  }

  fn rex(&mut self, w: bool, reg: u8, rm: u8) {
    if !self.x64 {
      debug_assert!(!w && reg < 8 && rm < 8, "extended encoding on x86");
      return;
    }
    let b = 0x40 | u8::from(w) << 3 | (reg >> 3) << 2 | (rm >> 3);
    if b != 0x40 { self.push_u8(b) }
  }

  fn modrm(&mut self, md: u8, reg: u8, rm: u8) {
    self.push_u8(md << 6 | (reg & 7) << 3 | (rm & 7));
  }

  /// A `[base + disp32]` memory operand. `rsp` bases take the SIB form.
  fn mem(&mut self, reg: u8, base: u8, disp: i32) {
    if base & 7 == RSP {
      self.modrm(0b10, reg, 0b100);
      self.push_u8(0x24); // SIB: no index, base = rsp
    } else {
      self.modrm(0b10, reg, base);
    }
    self.push_i32(disp);
  }

  // -- prologue / epilogue ------------------------------------------------

  pub fn push_r(&mut self, reg: u8) {
    if reg >= 8 { self.push_u8(0x41) }
    self.push_u8(0x50 + (reg & 7));
    self.flush();
  }

  pub fn mov_rbp_rsp(&mut self) {
    self.rex(self.x64, RSP, RBP);
    self.push_u8(0x89);
    self.modrm(0b11, RSP, RBP);
    self.flush();
  }

  pub fn sub_rsp(&mut self, n: u32) {
    self.rex(self.x64, 0, RSP);
    self.push_u8(0x81);
    self.modrm(0b11, 5, RSP); // /5 = sub
    self.push_u32(n);
    self.flush();
  }

  /// `mov rsp, rbp; pop rbp`.
  pub fn leave(&mut self) {
    self.push_u8(0xC9);
    self.flush();
  }

  pub fn ret(&mut self) {
    self.push_u8(0xC3);
    self.flush();
  }

  /// `ret imm16`, for `__stdcall` callee cleanup.
  pub fn ret_imm(&mut self, n: u16) {
    self.push_u8(0xC2);
    self.buf.try_extend_from_slice(&n.to_le_bytes()).expect("instruction overflow");
    self.flush();
  }

  // -- moves --------------------------------------------------------------

  pub fn mov_ri(&mut self, reg: u8, imm: i64, sz: OpSize) {
    if sz.wide() {
      if i64::from(imm as i32) == imm {
        self.rex(true, 0, reg);
        self.push_u8(0xC7);
        self.modrm(0b11, 0, reg);
        self.push_i32(imm as i32);
      } else {
        self.rex(true, 0, reg);
        self.push_u8(0xB8 + (reg & 7));
        self.buf.try_extend_from_slice(&imm.to_le_bytes()).expect("instruction overflow");
      }
    } else {
      self.rex(false, 0, reg);
      self.push_u8(0xB8 + (reg & 7));
      self.push_u32(imm as u32);
    }
    self.flush();
  }

  pub fn load(&mut self, dst: u8, base: u8, disp: i32, kind: LoadKind) {
    match kind {
      LoadKind::Zx8 => {
        self.rex(false, dst, base);
        self.push_u8(0x0F);
        self.push_u8(0xB6);
      }
      LoadKind::Sx8 => {
        self.rex(false, dst, base);
        self.push_u8(0x0F);
        self.push_u8(0xBE);
      }
      LoadKind::W4 => {
        self.rex(false, dst, base);
        self.push_u8(0x8B);
      }
      LoadKind::W8 => {
        self.rex(true, dst, base);
        self.push_u8(0x8B);
      }
    }
    self.mem(dst, base, disp);
    self.flush();
  }

  /// Store the low `size` bytes of `src` to `[base + disp]`.
  pub fn store(&mut self, base: u8, disp: i32, src: u8, size: u32) {
    match size {
      1 => {
        debug_assert!(src < 4, "byte store needs al/cl/dl/bl");
        self.rex(false, src, base);
        self.push_u8(0x88);
      }
      4 => {
        self.rex(false, src, base);
        self.push_u8(0x89);
      }
      8 => {
        self.rex(true, src, base);
        self.push_u8(0x89);
      }
      _ => panic!("unsupported store size {size}"),
    }
    self.mem(src, base, disp);
    self.flush();
  }

  pub fn lea(&mut self, dst: u8, base: u8, disp: i32) {
    self.rex(self.x64, dst, base);
    self.push_u8(0x8D);
    self.mem(dst, base, disp);
    self.flush();
  }

  /// `lea dst, [rip + disp32]` (64-bit only). Returns the offset of the
  /// displacement field for relocation.
  pub fn lea_rip(&mut self, dst: u8) -> u32 {
    debug_assert!(self.x64);
    self.rex(true, dst, 0);
    self.push_u8(0x8D);
    self.modrm(0b00, dst, 0b101);
    self.push_i32(0);
    self.flush();
    self.pos() - 4
  }

  /// `mov dst, imm32` whose immediate is an absolute data address
  /// (32-bit target). Returns the offset of the immediate for
  /// relocation.
  pub fn mov_ri_reloc(&mut self, dst: u8) -> u32 {
    debug_assert!(!self.x64);
    self.push_u8(0xB8 + (dst & 7));
    self.push_i32(0);
    self.flush();
    self.pos() - 4
  }

  // -- integer arithmetic -------------------------------------------------

  pub fn alu_rr(&mut self, op: Alu, dst: u8, src: u8, sz: OpSize) {
    self.rex(sz.wide(), src, dst);
    self.push_u8(op as u8);
    self.modrm(0b11, src, dst);
    self.flush();
  }

  pub fn alu_ri(&mut self, op: Alu, dst: u8, imm: i32, sz: OpSize) {
    let ext = match op {
      Alu::Add => 0,
      Alu::Or => 1,
      Alu::And => 4,
      Alu::Sub => 5,
      Alu::Xor => 6,
      Alu::Cmp => 7,
    };
    self.rex(sz.wide(), 0, dst);
    self.push_u8(0x81);
    self.modrm(0b11, ext, dst);
    self.push_i32(imm);
    self.flush();
  }

  pub fn imul_rr(&mut self, dst: u8, src: u8, sz: OpSize) {
    self.rex(sz.wide(), dst, src);
    self.push_u8(0x0F);
    self.push_u8(0xAF);
    self.modrm(0b11, dst, src);
    self.flush();
  }

  pub fn imul_ri(&mut self, dst: u8, imm: i32, sz: OpSize) {
    self.rex(sz.wide(), dst, dst);
    self.push_u8(0x69);
    self.modrm(0b11, dst, dst);
    self.push_i32(imm);
    self.flush();
  }

  /// `cdq` / `cqo`: sign-extend the accumulator into rdx.
  pub fn cdq(&mut self, sz: OpSize) {
    self.rex(sz.wide(), 0, 0);
    self.push_u8(0x99);
    self.flush();
  }

  pub fn idiv(&mut self, reg: u8, sz: OpSize) {
    self.rex(sz.wide(), 0, reg);
    self.push_u8(0xF7);
    self.modrm(0b11, 7, reg);
    self.flush();
  }

  pub fn test_rr(&mut self, a: u8, b: u8, sz: OpSize) {
    self.rex(sz.wide(), b, a);
    self.push_u8(0x85);
    self.modrm(0b11, b, a);
    self.flush();
  }

  pub fn setcc(&mut self, cc: CC, reg: u8) {
    debug_assert!(reg < 4, "setcc needs al/cl/dl/bl");
    self.push_u8(0x0F);
    self.push_u8(0x90 + cc as u8);
    self.modrm(0b11, 0, reg);
    self.flush();
  }

  /// `movsxd dst64, src32` (64-bit only): sign-extend a doubleword.
  pub fn movsxd(&mut self, dst: u8, src: u8) {
    debug_assert!(self.x64);
    self.rex(true, dst, src);
    self.push_u8(0x63);
    self.modrm(0b11, dst, src);
    self.flush();
  }

  /// `movzx dst32, src8` (register form).
  pub fn movzx8_rr(&mut self, dst: u8, src: u8) {
    self.rex(false, dst, src);
    self.push_u8(0x0F);
    self.push_u8(0xB6);
    self.modrm(0b11, dst, src);
    self.flush();
  }

  // -- SSE ----------------------------------------------------------------

  pub fn movss_load(&mut self, dst: u8, base: u8, disp: i32, dbl: bool) {
    self.push_u8(if dbl { 0xF2 } else { 0xF3 });
    self.rex(false, dst, base);
    self.push_u8(0x0F);
    self.push_u8(0x10);
    self.mem(dst, base, disp);
    self.flush();
  }

  pub fn movss_store(&mut self, base: u8, disp: i32, src: u8, dbl: bool) {
    self.push_u8(if dbl { 0xF2 } else { 0xF3 });
    self.rex(false, src, base);
    self.push_u8(0x0F);
    self.push_u8(0x11);
    self.mem(src, base, disp);
    self.flush();
  }

  pub fn sse_arith(&mut self, op: Sse, dst: u8, src: u8, dbl: bool) {
    self.push_u8(if dbl { 0xF2 } else { 0xF3 });
    self.push_u8(0x0F);
    self.push_u8(op as u8);
    self.modrm(0b11, dst, src);
    self.flush();
  }

  /// `ucomis[sd] a, b`.
  pub fn ucomis(&mut self, a: u8, b: u8, dbl: bool) {
    if dbl { self.push_u8(0x66) }
    self.push_u8(0x0F);
    self.push_u8(0x2E);
    self.modrm(0b11, a, b);
    self.flush();
  }

  /// `movd`/`movq xmm, gpr`.
  pub fn movd_xr(&mut self, x: u8, gpr: u8, wide: bool) {
    self.push_u8(0x66);
    self.rex(wide, x, gpr);
    self.push_u8(0x0F);
    self.push_u8(0x6E);
    self.modrm(0b11, x, gpr);
    self.flush();
  }

  // -- control transfer ---------------------------------------------------

  /// `call rel32` with a zero displacement; returns the patch offset.
  pub fn call_rel32(&mut self) -> u32 {
    self.push_u8(0xE8);
    self.push_i32(0);
    self.flush();
    self.pos() - 4
  }

  pub fn call_r(&mut self, reg: u8) {
    if reg >= 8 { self.push_u8(0x41) }
    self.push_u8(0xFF);
    self.modrm(0b11, 2, reg);
    self.flush();
  }

  /// `jmp rel32` with a zero displacement; returns the patch offset.
  pub fn jmp_rel32(&mut self) -> u32 {
    self.push_u8(0xE9);
    self.push_i32(0);
    self.flush();
    self.pos() - 4
  }

  /// `jcc rel32` with a zero displacement; returns the patch offset.
  pub fn jcc_rel32(&mut self, cc: CC) -> u32 {
    self.push_u8(0x0F);
    self.push_u8(0x80 + cc as u8);
    self.push_i32(0);
    self.flush();
    self.pos() - 4
  }

  pub fn add_rsp(&mut self, n: u32) {
    self.rex(self.x64, 0, RSP);
    self.push_u8(0x81);
    self.modrm(0b11, 0, RSP); // /0 = add
    self.push_u32(n);
    self.flush();
  }

  pub fn push_imm32(&mut self, n: i32) {
    self.push_u8(0x68);
    self.push_i32(n);
    self.flush();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn prologue_bytes() {
    let mut e = Emitter::new(true);
    e.push_r(RBP);
    e.mov_rbp_rsp();
    assert_eq!(e.code, vec![0x55, 0x48, 0x89, 0xE5]);

    let mut e = Emitter::new(false);
    e.push_r(RBP);
    e.mov_rbp_rsp();
    assert_eq!(e.code, vec![0x55, 0x89, 0xE5]);
  }

  #[test]
  fn add_rax_rcx() {
    let mut e = Emitter::new(true);
    e.alu_rr(Alu::Add, RAX, RCX, OpSize::W8);
    assert_eq!(e.code, vec![0x48, 0x01, 0xC8]);
  }

  #[test]
  fn mov_imm() {
    let mut e = Emitter::new(true);
    e.mov_ri(RAX, 5, OpSize::W8);
    assert_eq!(e.code, vec![0x48, 0xC7, 0xC0, 5, 0, 0, 0]);

    let mut e = Emitter::new(false);
    e.mov_ri(RAX, 2, OpSize::W4);
    assert_eq!(e.code, vec![0xB8, 2, 0, 0, 0]);
  }

  #[test]
  fn load_store_frame_slot() {
    let mut e = Emitter::new(true);
    e.load(RAX, RBP, -8, LoadKind::W4);
    assert_eq!(e.code, vec![0x8B, 0x85, 0xF8, 0xFF, 0xFF, 0xFF]);
    e.code.clear();
    e.store(RBP, -8, RAX, 4);
    assert_eq!(e.code, vec![0x89, 0x85, 0xF8, 0xFF, 0xFF, 0xFF]);
  }

  #[test]
  fn rsp_base_uses_sib() {
    let mut e = Emitter::new(true);
    e.store(RSP, 0, RCX, 8);
    assert_eq!(e.code, vec![0x48, 0x89, 0x8C, 0x24, 0, 0, 0, 0]);
  }

  #[test]
  fn call_and_patch() {
    let mut e = Emitter::new(true);
    let at = e.call_rel32();
    assert_eq!(e.code, vec![0xE8, 0, 0, 0, 0]);
    e.patch_i32(at, -5);
    assert_eq!(e.code, vec![0xE8, 0xFB, 0xFF, 0xFF, 0xFF]);
  }

  #[test]
  fn setcc_sete_al() {
    let mut e = Emitter::new(true);
    e.setcc(CC::E, RAX);
    assert_eq!(e.code, vec![0x0F, 0x94, 0xC0]);
  }

  #[test]
  fn extended_registers_take_rex() {
    let mut e = Emitter::new(true);
    // mov [rbp-16], r8  and  add rax, r9
    e.store(RBP, -16, R8, 8);
    assert_eq!(e.code, vec![0x4C, 0x89, 0x85, 0xF0, 0xFF, 0xFF, 0xFF]);
    e.code.clear();
    e.alu_rr(Alu::Add, RAX, R9, OpSize::W8);
    assert_eq!(e.code, vec![0x4C, 0x01, 0xC8]);
  }
}
