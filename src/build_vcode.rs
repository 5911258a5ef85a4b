//! The translation pass from [IR](crate::types::ir) to machine code.
//!
//! Instruction selection is deliberately simple: every SSA value gets a
//! stack slot in the frame, operands are loaded into two scratch
//! registers (rax/rcx, or xmm0/xmm1 for floats), and results are stored
//! back. Control transfers all use rel32 forms, so each function is
//! encoded in one pass with a patch list for forward branches.
//! References to functions and data are recorded as [`VReloc`]s and
//! resolved (or turned into COFF relocations) during object assembly.

use hashbrown::HashMap;
use log::trace;

use crate::Target;
use crate::arch::{self, Alu, CC, Emitter, LoadKind, OpSize, Sse};
use crate::types::Idx;
use crate::types::ir::{
  BinOp, BlockId, CConv, Callee, CastKind, Const, FloatCC, FuncId, Function, GepKind, GlobalId,
  Inst, IntCC, Linkage, Module, Operand, Term, ValueId,
};
use crate::types::ty::{Ty, TyKind};

/// The finished machine code of one function.
pub(crate) struct PCode {
  /// The symbol name.
  pub name: String,
  /// The symbol linkage.
  pub linkage: Linkage,
  /// The encoded bytes.
  pub code: Vec<u8>,
  /// Unresolved references into other symbols.
  pub relocs: Vec<VReloc>,
}

/// What a relocation site refers to.
#[derive(Copy, Clone, Debug)]
pub(crate) enum VTarget {
  /// A function in the module (defined or external).
  Func(FuncId),
  /// A data global.
  Data(GlobalId),
}

/// How the 32-bit field at the site is to be filled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum VRelocKind {
  /// PC-relative to the end of the field.
  Rel32,
  /// Absolute 32-bit address (32-bit target only).
  Abs32,
}

/// One relocation site within a function's code.
#[derive(Debug)]
pub(crate) struct VReloc {
  /// The offset of the 32-bit field in the function's code.
  pub offset: u32,
  /// The referenced symbol.
  pub target: VTarget,
  /// The fill kind.
  pub kind: VRelocKind,
}

#[derive(Copy, Clone, Debug)]
enum Home {
  /// The value lives in the slot at `[rbp + off]`.
  Slot(i32),
  /// An `alloca` region starting at `[rbp + off]`; the value is the
  /// region's address.
  Region(i32),
}

const ARG_REGS: [u8; 4] = [arch::RCX, arch::RDX, arch::R8, arch::R9];

struct VCtx<'a> {
  m: &'a Module,
  f: &'a Function,
  e: Emitter,
  word: u32,
  homes: HashMap<ValueId, Home>,
  arg_homes: Vec<i32>,
  labels: Vec<Option<u32>>,
  fixups: Vec<(u32, BlockId)>,
  relocs: Vec<VReloc>,
  /// An 8-byte scratch slot, used to materialize f64 constants on x86.
  scratch: i32,
  outgoing: u32,
}

/// Lower one defined function to machine code.
pub(crate) fn build_pcode(m: &Module, fid: FuncId, target: Target) -> Result<PCode, String> {
  let f = &m.funcs[fid];
  assert!(!f.is_decl(), "cannot emit a declaration");
  trace!("emitting function '{}' ({} blocks)", f.name, f.blocks.len());
  let word = target.word();
  let x64 = target.x64();

  let mut cx = VCtx {
    m,
    f,
    e: Emitter::new(x64),
    word,
    homes: HashMap::new(),
    arg_homes: vec![],
    labels: vec![None; f.blocks.len()],
    fixups: vec![],
    relocs: vec![],
    scratch: 0,
    outgoing: 0,
  };
  cx.layout_frame()?;
  cx.emit_body()?;
  let VCtx { e, relocs, .. } = cx;
  Ok(PCode { name: f.name.clone(), linkage: f.linkage, code: e.code, relocs })
}

fn align_to(n: u32, align: u32) -> u32 { (n + align - 1) & !(align - 1) }

impl<'a> VCtx<'a> {
  fn sizeof(&self, ty: &TyKind) -> u32 { self.m.sizeof(ty, self.word) }

  /// The width class of a scalar value type.
  fn opsize(&self, ty: &TyKind) -> Result<OpSize, String> {
    let sz = self.sizeof(ty);
    if sz == 8 && !matches!(ty, TyKind::F64) {
      if !self.e.x64 {
        return Err("64-bit integers are not supported on the 32-bit target".to_owned());
      }
      return Ok(OpSize::W8);
    }
    Ok(OpSize::W4)
  }

  fn load_kind(&self, ty: &TyKind) -> Result<LoadKind, String> {
    Ok(match ty {
      TyKind::I1 => LoadKind::Zx8,
      TyKind::I8 => LoadKind::Sx8,
      TyKind::I64 => {
        if !self.e.x64 {
          return Err("64-bit integers are not supported on the 32-bit target".to_owned());
        }
        LoadKind::W8
      }
      TyKind::Ptr(_) | TyKind::Fn(_) => if self.e.x64 { LoadKind::W8 } else { LoadKind::W4 },
      _ => LoadKind::W4,
    })
  }

  fn layout_frame(&mut self) -> Result<(), String> {
    let mut cursor = 0_u32;
    let mut alloc = |size: u32| -> i32 {
      cursor += align_to(size.max(8), 8);
      -(cursor as i32)
    };

    for ty in &self.f.params {
      let off = alloc(self.sizeof(ty));
      self.arg_homes.push(off);
    }
    for (v, inst) in self.f.insts.enum_iter() {
      match inst {
        Inst::Alloca { ty } => {
          let off = alloc(self.sizeof(ty));
          self.homes.insert(v, Home::Region(off));
        }
        Inst::Store { .. } => {}
        Inst::Call { sig, .. } if *sig.ret == TyKind::Void => {}
        _ => {
          let ty = self.f.val_ty(v);
          let off = alloc(self.sizeof(&ty));
          self.homes.insert(v, Home::Slot(off));
        }
      }
    }
    self.scratch = alloc(8);

    // outgoing argument area for the largest call, shadow space included
    if self.e.x64 {
      let mut out = 0_u32;
      for inst in self.f.insts.iter() {
        if let Inst::Call { args, .. } = inst {
          out = out.max(8 * (args.len() as u32).max(4));
        }
      }
      self.outgoing = out;
    }

    let frame = align_to(cursor + self.outgoing, 16);
    self.e.push_r(arch::RBP);
    self.e.mov_rbp_rsp();
    if frame > 0 { self.e.sub_rsp(frame) }
    self.copy_incoming()?;
    Ok(())
  }

  /// The rbp-relative offsets of the incoming arguments in the caller's
  /// frame.
  fn incoming_offsets(&self) -> Vec<i32> {
    if self.e.x64 {
      (0..self.f.params.len()).map(|i| 16 + 8 * i as i32).collect()
    } else {
      let mut off = 8_i32;
      self.f.params.iter().map(|ty| {
        let cur = off;
        off += align_to(self.sizeof(ty), 4) as i32;
        cur
      }).collect()
    }
  }

  fn copy_incoming(&mut self) -> Result<(), String> {
    let incoming = self.incoming_offsets();
    for (i, ty) in self.f.params.iter().enumerate() {
      let home = self.arg_homes[i];
      let dbl = **ty == TyKind::F64;
      if self.e.x64 && i < 4 {
        if ty.is_float() {
          self.e.movss_store(arch::RBP, home, i as u8, dbl);
        } else {
          self.e.store(arch::RBP, home, ARG_REGS[i], 8);
        }
      } else if ty.is_float() {
        self.e.movss_load(arch::XMM0, arch::RBP, incoming[i], dbl);
        self.e.movss_store(arch::RBP, home, arch::XMM0, dbl);
      } else {
        let kind = self.load_kind(ty)?;
        self.e.load(arch::RAX, arch::RBP, incoming[i], kind);
        self.e.store(arch::RBP, home, arch::RAX, self.slot_store_size(ty));
      }
    }
    Ok(())
  }

  /// The store width used when writing a value of this type to a slot.
  fn slot_store_size(&self, ty: &TyKind) -> u32 {
    match self.sizeof(ty) {
      1 => 1,
      8 => 8,
      _ => 4,
    }
  }

  /// Load an integer or pointer operand into `dst`.
  fn load_op(&mut self, o: &Operand, dst: u8) -> Result<(), String> {
    match o {
      Operand::Val(v) => match self.homes.get(v) {
        Some(&Home::Slot(off)) => {
          let ty = self.f.val_ty(*v);
          let kind = self.load_kind(&ty)?;
          self.e.load(dst, arch::RBP, off, kind);
        }
        Some(&Home::Region(off)) => self.e.lea(dst, arch::RBP, off),
        None => return Err("use of a value with no storage".to_owned()),
      },
      &Operand::Arg(i) => {
        let ty = self.f.params[i as usize].clone();
        let kind = self.load_kind(&ty)?;
        self.e.load(dst, arch::RBP, self.arg_homes[i as usize], kind);
      }
      Operand::Const(c) => match c {
        Const::Int(ty, n) => {
          let sz = self.opsize(ty)?;
          self.e.mov_ri(dst, *n, sz);
        }
        Const::Null(_) => {
          let sz = if self.e.x64 { OpSize::W8 } else { OpSize::W4 };
          self.e.mov_ri(dst, 0, sz);
        }
        Const::Zero(ty) => {
          let sz = self.opsize(ty).unwrap_or(OpSize::W4);
          self.e.mov_ri(dst, 0, sz);
        }
        Const::GlobalAddr(g) => self.load_data_addr(*g, dst),
        Const::F32(_) | Const::F64(_) =>
          return Err("float constant in integer position".to_owned()),
        Const::Bytes(_) | Const::Array(..) =>
          return Err("aggregate constant in operand position".to_owned()),
      },
      Operand::Global(g) => self.load_data_addr(*g, dst),
      Operand::Func(fid) => {
        if self.e.x64 {
          let at = self.e.lea_rip(dst);
          self.relocs.push(VReloc {
            offset: at,
            target: VTarget::Func(*fid),
            kind: VRelocKind::Rel32,
          });
        } else {
          let at = self.e.mov_ri_reloc(dst);
          self.relocs.push(VReloc {
            offset: at,
            target: VTarget::Func(*fid),
            kind: VRelocKind::Abs32,
          });
        }
      }
    }
    Ok(())
  }

  /// Load the address of a data global into `dst`.
  fn load_data_addr(&mut self, g: GlobalId, dst: u8) {
    if self.e.x64 {
      let at = self.e.lea_rip(dst);
      self.relocs.push(VReloc { offset: at, target: VTarget::Data(g), kind: VRelocKind::Rel32 });
    } else {
      let at = self.e.mov_ri_reloc(dst);
      self.relocs.push(VReloc { offset: at, target: VTarget::Data(g), kind: VRelocKind::Abs32 });
    }
  }

  /// Load a float operand into an xmm register.
  fn load_fop(&mut self, o: &Operand, xmm: u8, dbl: bool) -> Result<(), String> {
    match o {
      Operand::Val(v) => match self.homes.get(v) {
        Some(&Home::Slot(off)) => self.e.movss_load(xmm, arch::RBP, off, dbl),
        _ => return Err("float value with no slot".to_owned()),
      },
      &Operand::Arg(i) => self.e.movss_load(xmm, arch::RBP, self.arg_homes[i as usize], dbl),
      Operand::Const(Const::F32(x)) => {
        self.e.mov_ri(arch::RAX, i64::from(x.to_bits() as i32), OpSize::W4);
        self.e.movd_xr(xmm, arch::RAX, false);
      }
      Operand::Const(Const::F64(x)) => {
        let bits = x.to_bits();
        if self.e.x64 {
          self.e.mov_ri(arch::RAX, bits as i64, OpSize::W8);
          self.e.movd_xr(xmm, arch::RAX, true);
        } else {
          // no 64-bit gpr path on x86: stage the halves in the scratch slot
          self.e.mov_ri(arch::RAX, i64::from(bits as u32 as i32), OpSize::W4);
          self.e.store(arch::RBP, self.scratch, arch::RAX, 4);
          self.e.mov_ri(arch::RAX, i64::from((bits >> 32) as u32 as i32), OpSize::W4);
          self.e.store(arch::RBP, self.scratch + 4, arch::RAX, 4);
          self.e.movss_load(xmm, arch::RBP, self.scratch, true);
        }
      }
      Operand::Const(Const::Zero(_)) => {
        self.e.mov_ri(arch::RAX, 0, OpSize::W4);
        self.e.movd_xr(xmm, arch::RAX, false);
      }
      _ => return Err("non-float operand in float position".to_owned()),
    }
    Ok(())
  }

  fn store_result(&mut self, v: ValueId, src: u8) {
    if let Some(&Home::Slot(off)) = self.homes.get(&v) {
      let ty = self.f.val_ty(v);
      self.e.store(arch::RBP, off, src, self.slot_store_size(&ty));
    }
  }

  fn store_fresult(&mut self, v: ValueId, xmm: u8, dbl: bool) {
    if let Some(&Home::Slot(off)) = self.homes.get(&v) {
      self.e.movss_store(arch::RBP, off, xmm, dbl);
    }
  }

  fn emit_body(&mut self) -> Result<(), String> {
    for (b, _) in self.f.blocks.enum_iter() {
      self.labels[b.into_usize()] = Some(self.e.pos());
      let block = &self.f.blocks[b];
      for &v in &block.insts {
        self.emit_inst(v)?;
      }
      let term = block.term.clone()
        .ok_or_else(|| format!("unterminated block '{}' in '{}'", block.name, self.f.name))?;
      self.emit_term(&term, b)?;
    }
    let fixups = std::mem::take(&mut self.fixups);
    for (at, target) in fixups {
      let label = self.labels[target.into_usize()].expect("emitted");
      let rel = i64::from(label) - (i64::from(at) + 4);
      self.e.patch_i32(at, i32::try_from(rel).expect("jump out of range"));
    }
    Ok(())
  }

  fn emit_inst(&mut self, v: ValueId) -> Result<(), String> {
    let inst = self.f.insts[v].clone();
    match inst {
      Inst::Bin { op, ty, lhs, rhs } => {
        if ty.is_float() {
          let dbl = *ty == TyKind::F64;
          let sse = match op {
            BinOp::Fadd => Sse::Add,
            BinOp::Fsub => Sse::Sub,
            BinOp::Fmul => Sse::Mul,
            BinOp::Fdiv => Sse::Div,
            _ => return Err("integer op on float type".to_owned()),
          };
          self.load_fop(&lhs, arch::XMM0, dbl)?;
          self.load_fop(&rhs, arch::XMM1, dbl)?;
          self.e.sse_arith(sse, arch::XMM0, arch::XMM1, dbl);
          self.store_fresult(v, arch::XMM0, dbl);
          return Ok(());
        }
        let sz = self.opsize(&ty)?;
        self.load_op(&lhs, arch::RAX)?;
        self.load_op(&rhs, arch::RCX)?;
        match op {
          BinOp::Add => self.e.alu_rr(Alu::Add, arch::RAX, arch::RCX, sz),
          BinOp::Sub => self.e.alu_rr(Alu::Sub, arch::RAX, arch::RCX, sz),
          BinOp::Mul => self.e.imul_rr(arch::RAX, arch::RCX, sz),
          BinOp::Sdiv => {
            self.e.cdq(sz);
            self.e.idiv(arch::RCX, sz);
          }
          BinOp::And => self.e.alu_rr(Alu::And, arch::RAX, arch::RCX, sz),
          BinOp::Or => self.e.alu_rr(Alu::Or, arch::RAX, arch::RCX, sz),
          BinOp::Fadd | BinOp::Fsub | BinOp::Fmul | BinOp::Fdiv =>
            return Err("float op on integer type".to_owned()),
        }
        self.store_result(v, arch::RAX);
        Ok(())
      }
      Inst::Icmp { cc, ty, lhs, rhs } => {
        let sz = self.opsize(&ty)?;
        self.load_op(&lhs, arch::RAX)?;
        self.load_op(&rhs, arch::RCX)?;
        self.e.alu_rr(Alu::Cmp, arch::RAX, arch::RCX, sz);
        let cond = match cc {
          IntCC::Eq => CC::E,
          IntCC::Ne => CC::Ne,
          IntCC::Lt => CC::L,
          IntCC::Le => CC::Le,
          IntCC::Gt => CC::G,
          IntCC::Ge => CC::Ge,
        };
        self.e.setcc(cond, arch::RAX);
        self.e.movzx8_rr(arch::RAX, arch::RAX);
        self.store_result(v, arch::RAX);
        Ok(())
      }
      Inst::Fcmp { cc, ty, lhs, rhs } => {
        let dbl = *ty == TyKind::F64;
        self.load_fop(&lhs, arch::XMM0, dbl)?;
        self.load_fop(&rhs, arch::XMM1, dbl)?;
        self.e.ucomis(arch::XMM0, arch::XMM1, dbl);
        let cond = match cc {
          FloatCC::Oeq => CC::E,
          FloatCC::One => CC::Ne,
          FloatCC::Olt => CC::B,
          FloatCC::Ole => CC::Be,
          FloatCC::Ogt => CC::A,
          FloatCC::Oge => CC::Ae,
        };
        self.e.setcc(cond, arch::RAX);
        self.e.movzx8_rr(arch::RAX, arch::RAX);
        self.store_result(v, arch::RAX);
        Ok(())
      }
      Inst::Not { arg } => {
        self.load_op(&arg, arch::RAX)?;
        self.e.alu_ri(Alu::Xor, arch::RAX, 1, OpSize::W4);
        self.store_result(v, arch::RAX);
        Ok(())
      }
      Inst::Load { ty, ptr } => {
        self.load_op(&ptr, arch::RCX)?;
        if ty.is_float() {
          let dbl = *ty == TyKind::F64;
          self.e.movss_load(arch::XMM0, arch::RCX, 0, dbl);
          self.store_fresult(v, arch::XMM0, dbl);
          return Ok(());
        }
        if matches!(&*ty, TyKind::Array(..) | TyKind::Struct(_)) {
          return Err(format!("aggregate load of type '{ty}'"));
        }
        let kind = self.load_kind(&ty)?;
        self.e.load(arch::RAX, arch::RCX, 0, kind);
        self.store_result(v, arch::RAX);
        Ok(())
      }
      Inst::Store { ty, val, ptr } => {
        if ty.is_float() {
          let dbl = *ty == TyKind::F64;
          self.load_fop(&val, arch::XMM0, dbl)?;
          self.load_op(&ptr, arch::RCX)?;
          self.e.movss_store(arch::RCX, 0, arch::XMM0, dbl);
          return Ok(());
        }
        if matches!(&*ty, TyKind::Array(..) | TyKind::Struct(_)) {
          return Err(format!("aggregate store of type '{ty}'"));
        }
        self.load_op(&val, arch::RAX)?;
        self.load_op(&ptr, arch::RCX)?;
        self.e.store(arch::RCX, 0, arch::RAX, self.slot_store_size(&ty));
        Ok(())
      }
      Inst::Alloca { .. } => Ok(()),
      Inst::Gep { base, pointee, kind, .. } => {
        self.load_op(&base, arch::RAX)?;
        let word_sz = if self.e.x64 { OpSize::W8 } else { OpSize::W4 };
        match kind {
          GepKind::Field(k) => {
            let TyKind::Struct(name) = &*pointee else {
              return Err("field gep through non-struct".to_owned());
            };
            let off = self.m.field_offset(name, k, self.word);
            if off != 0 {
              self.e.alu_ri(Alu::Add, arch::RAX, off as i32, word_sz);
            }
          }
          GepKind::Offset(ref i) | GepKind::Index(ref i) => {
            let elem = match (&kind, &*pointee) {
              (GepKind::Offset(_), t) => self.sizeof(t),
              (GepKind::Index(_), TyKind::Array(el, _)) => self.sizeof(el),
              _ => return Err("index gep through non-array".to_owned()),
            };
            if let Operand::Const(Const::Int(_, n)) = i {
              let off = n * i64::from(elem);
              if off != 0 {
                let off = i32::try_from(off).map_err(|_| "offset out of range".to_owned())?;
                self.e.alu_ri(Alu::Add, arch::RAX, off, word_sz);
              }
            } else {
              self.load_op(i, arch::RCX)?;
              if self.e.x64 { self.e.movsxd(arch::RCX, arch::RCX) }
              if elem != 1 {
                let elem = i32::try_from(elem).map_err(|_| "element too large".to_owned())?;
                self.e.imul_ri(arch::RCX, elem, word_sz);
              }
              self.e.alu_rr(Alu::Add, arch::RAX, arch::RCX, word_sz);
            }
          }
        }
        self.store_result(v, arch::RAX);
        Ok(())
      }
      Inst::Cast { kind, from, arg, .. } => {
        match kind {
          CastKind::Bitcast | CastKind::IntToPtr | CastKind::Trunc => {
            self.load_op(&arg, arch::RAX)?;
          }
          CastKind::Zext => match &arg {
            // zero-extension: byte sources reload with movzx
            Operand::Val(val) if matches!(&*from, TyKind::I1 | TyKind::I8) => {
              let Some(&Home::Slot(off)) = self.homes.get(val) else {
                return Err("use of a value with no storage".to_owned());
              };
              self.e.load(arch::RAX, arch::RBP, off, LoadKind::Zx8);
            }
            _ => self.load_op(&arg, arch::RAX)?,
          },
        }
        self.store_result(v, arch::RAX);
        Ok(())
      }
      Inst::Call { f, sig, conv, args } => {
        let arg_tys: Vec<Ty> = args.iter().map(|a| self.m.operand_ty(self.f, a)).collect();

        let mut cleanup = 0_u32;
        if self.e.x64 {
          // stage everything in the outgoing area, then fill the
          // argument registers from it
          for (i, a) in args.iter().enumerate() {
            let off = 8 * i as i32;
            let ty = &arg_tys[i];
            if ty.is_float() {
              let dbl = **ty == TyKind::F64;
              self.load_fop(a, arch::XMM0, dbl)?;
              self.e.movss_store(arch::RSP, off, arch::XMM0, dbl);
            } else {
              self.load_op(a, arch::RAX)?;
              self.e.store(arch::RSP, off, arch::RAX, 8);
            }
          }
          for i in (0..args.len().min(4)).rev() {
            let off = 8 * i as i32;
            let ty = &arg_tys[i];
            if ty.is_float() {
              let dbl = **ty == TyKind::F64;
              self.e.movss_load(i as u8, arch::RSP, off, dbl);
            }
            // integer registers are always filled so variadic callees
            // can spill their register area uniformly
            self.e.load(ARG_REGS[i], arch::RSP, off, LoadKind::W8);
          }
        } else {
          // push right to left; the caller cleans unless stdcall
          for (i, a) in args.iter().enumerate().rev() {
            let ty = &arg_tys[i];
            if **ty == TyKind::F64 {
              self.load_fop(a, arch::XMM0, true)?;
              self.e.sub_rsp(8);
              self.e.movss_store(arch::RSP, 0, arch::XMM0, true);
              cleanup += 8;
            } else if **ty == TyKind::F32 {
              self.load_fop(a, arch::XMM0, false)?;
              self.e.sub_rsp(4);
              self.e.movss_store(arch::RSP, 0, arch::XMM0, false);
              cleanup += 4;
            } else if let Operand::Const(Const::Int(_, n)) = a {
              self.e.push_imm32(*n as i32);
              cleanup += 4;
            } else {
              self.load_op(a, arch::RAX)?;
              self.e.push_r(arch::RAX);
              cleanup += 4;
            }
          }
        }

        match f {
          Callee::Func(fid) => {
            let at = self.e.call_rel32();
            self.relocs.push(VReloc {
              offset: at,
              target: VTarget::Func(fid),
              kind: VRelocKind::Rel32,
            });
          }
          Callee::Ptr(p) => {
            self.load_op(&p, arch::RAX)?;
            self.e.call_r(arch::RAX);
          }
        }
        if !self.e.x64 && cleanup > 0 && conv != CConv::Std {
          self.e.add_rsp(cleanup);
        }

        match &*sig.ret {
          TyKind::Void => {}
          t if t.is_float() => self.store_fresult(v, arch::XMM0, *t == TyKind::F64),
          _ => self.store_result(v, arch::RAX),
        }
        Ok(())
      }
    }
  }

  fn emit_term(&mut self, term: &Term, cur: BlockId) -> Result<(), String> {
    match term {
      Term::Ret(val) => {
        if let Some(o) = val {
          let ty = self.m.operand_ty(self.f, o);
          if ty.is_float() {
            self.load_fop(o, arch::XMM0, *ty == TyKind::F64)?;
          } else {
            self.load_op(o, arch::RAX)?;
          }
        }
        self.e.leave();
        if !self.e.x64 && self.f.conv == CConv::Std {
          let bytes: u32 = self.f.params.iter()
            .map(|t| align_to(self.sizeof(t), 4))
            .sum();
          self.e.ret_imm(u16::try_from(bytes).expect("argument area too large"));
        } else {
          self.e.ret();
        }
        Ok(())
      }
      &Term::Br(b) => {
        if b.into_usize() != cur.into_usize() + 1 {
          let at = self.e.jmp_rel32();
          self.fixups.push((at, b));
        }
        Ok(())
      }
      Term::CondBr(c, t, f) => {
        let (t, f) = (*t, *f);
        self.load_op(c, arch::RAX)?;
        self.e.test_rr(arch::RAX, arch::RAX, OpSize::W4);
        let at = self.e.jcc_rel32(CC::Ne);
        self.fixups.push((at, t));
        if f.into_usize() != cur.into_usize() + 1 {
          let at = self.e.jmp_rel32();
          self.fixups.push((at, f));
        }
        Ok(())
      }
    }
  }
}
