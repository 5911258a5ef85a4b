//! The in-memory representation of a compilation unit: named globals,
//! functions made of basic blocks, typed instructions, and identified
//! struct types. The lowering passes build one [`Module`] per
//! translation unit and the machine backend consumes it.

use hashbrown::HashMap;
use smallvec::SmallVec;

use super::ty::{FnTy, Ty, TyKind, prim};
use super::{IdxVec, mk_id};

mk_id! {
  /// An index into [`Module::funcs`].
  FuncId,
  /// An index into [`Module::globals`].
  GlobalId,
  /// An index into [`Module::structs`].
  StructId,
  /// A basic block within a function.
  BlockId,
  /// An instruction result within a function.
  ValueId,
}

impl BlockId {
  /// The entry block of a function, where all `alloca`s live.
  pub const ENTRY: Self = Self(0);
}

/// The linkage of a function or global.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Linkage {
  /// Exported: visible to the linker under its name.
  Public,
  /// A `private` declaration: emitted as a static symbol.
  Private,
  /// Compiler-synthesized data (vtables, string constants): static.
  Internal,
}

/// A calling convention, keyed from the source spellings
/// `__cdecl`/`__fastcall`/`__stdcall`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CConv {
  /// `ccc`
  C,
  /// `fastcc`
  Fast,
  /// `stdcc`
  Std,
}

impl CConv {
  /// The IR-level name of the convention.
  #[must_use] pub fn name(self) -> &'static str {
    match self {
      CConv::C => "ccc",
      CConv::Fast => "fastcc",
      CConv::Std => "stdcc",
    }
  }
}

impl From<crate::types::ast::Conv> for CConv {
  fn from(c: crate::types::ast::Conv) -> Self {
    use crate::types::ast::Conv;
    match c {
      Conv::Cdecl => CConv::C,
      Conv::Fastcall => CConv::Fast,
      Conv::Stdcall => CConv::Std,
    }
  }
}

/// An identified struct type. The body may be absent while the type is
/// opaque (forward declarations, imported objects before their layout
/// is seen); it is set exactly once.
#[derive(Clone, Debug)]
pub struct StructDef {
  /// The struct name, unique within the module.
  pub name: String,
  /// The element types, or `None` while opaque.
  pub body: Option<Box<[Ty]>>,
}

/// A constant value, used for operands and global initializers.
#[derive(Clone, Debug, PartialEq)]
pub enum Const {
  /// An integer of the given type.
  Int(Ty, i64),
  /// A `float` constant.
  F32(f32),
  /// A `double` constant.
  F64(f64),
  /// A null pointer of the given type.
  Null(Ty),
  /// A zero-initialized value of the given type.
  Zero(Ty),
  /// Raw bytes, typed as `char[len]`; used for string literals.
  Bytes(Vec<u8>),
  /// A constant array with the given element type.
  Array(Ty, Vec<Const>),
  /// The address of another global.
  GlobalAddr(GlobalId),
}

/// A global variable.
#[derive(Clone, Debug)]
pub struct Global {
  /// The symbol name.
  pub name: String,
  /// The value type (not the pointer type).
  pub ty: Ty,
  /// The linkage.
  pub linkage: Linkage,
  /// True if the global is read-only.
  pub konst: bool,
  /// The initializer; `None` means zero-initialized.
  pub init: Option<Const>,
}

/// An instruction or constant operand.
#[derive(Clone, Debug)]
pub enum Operand {
  /// The result of an instruction in the same function.
  Val(ValueId),
  /// The `i`th function argument. Only read in the entry block, before
  /// any call; lowering copies every argument into a stack home first.
  Arg(u32),
  /// A constant.
  Const(Const),
  /// The address of a global variable.
  Global(GlobalId),
  /// The address of a function.
  Func(FuncId),
}

impl From<ValueId> for Operand {
  fn from(v: ValueId) -> Self { Operand::Val(v) }
}

/// A two-operand arithmetic or logical operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinOp {
  /// Integer addition.
  Add,
  /// Integer subtraction.
  Sub,
  /// Integer multiplication.
  Mul,
  /// Signed integer division.
  Sdiv,
  /// Float addition.
  Fadd,
  /// Float subtraction.
  Fsub,
  /// Float multiplication.
  Fmul,
  /// Float division.
  Fdiv,
  /// Bitwise and (used on `bool`).
  And,
  /// Bitwise or (used on `bool`).
  Or,
}

/// A signed integer comparison predicate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IntCC {
  /// `==`
  Eq,
  /// `!=`
  Ne,
  /// `<` (signed)
  Lt,
  /// `<=` (signed)
  Le,
  /// `>` (signed)
  Gt,
  /// `>=` (signed)
  Ge,
}

/// An ordered float comparison predicate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FloatCC {
  /// `==`
  Oeq,
  /// `!=`
  One,
  /// `<`
  Olt,
  /// `<=`
  Ole,
  /// `>`
  Ogt,
  /// `>=`
  Oge,
}

/// A value conversion kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CastKind {
  /// Reinterpret a pointer as another pointer type.
  Bitcast,
  /// Truncate an integer to a narrower width.
  Trunc,
  /// Zero-extend an integer to a wider width.
  Zext,
  /// Reinterpret an integer as a pointer.
  IntToPtr,
}

/// The addressing form of a [`Inst::Gep`].
#[derive(Clone, Debug)]
pub enum GepKind {
  /// `gep T* p, [i]`: advance the pointer by `i` elements of the pointee.
  Offset(Operand),
  /// `gep S* p, [0, k]`: the address of field `k` of a struct pointee.
  Field(u32),
  /// `gep [N x T]* p, [0, i]`: the address of element `i` of an array pointee.
  Index(Operand),
}

/// The target of a call.
#[derive(Clone, Debug)]
pub enum Callee {
  /// A direct call to a function in this module (defined or declared).
  Func(FuncId),
  /// An indirect call through a function-pointer value.
  Ptr(Operand),
}

/// An instruction. Every instruction is identified by the [`ValueId`]
/// of its result; instructions without a meaningful result (stores)
/// still occupy an id.
#[derive(Clone, Debug)]
pub enum Inst {
  /// A two-operand operation on values of type `ty`.
  Bin {
    /// The operation.
    op: BinOp,
    /// The operand (and result) type.
    ty: Ty,
    /// Left operand.
    lhs: Operand,
    /// Right operand.
    rhs: Operand,
  },
  /// Signed integer comparison; result is `bool`.
  Icmp {
    /// The predicate.
    cc: IntCC,
    /// The operand type.
    ty: Ty,
    /// Left operand.
    lhs: Operand,
    /// Right operand.
    rhs: Operand,
  },
  /// Ordered float comparison; result is `bool`.
  Fcmp {
    /// The predicate.
    cc: FloatCC,
    /// The operand type.
    ty: Ty,
    /// Left operand.
    lhs: Operand,
    /// Right operand.
    rhs: Operand,
  },
  /// Complement of a `bool`.
  Not {
    /// The operand, of type `bool`.
    arg: Operand,
  },
  /// Load a value of type `ty` through a pointer.
  Load {
    /// The loaded type.
    ty: Ty,
    /// The address.
    ptr: Operand,
  },
  /// Store a value of type `ty` through a pointer.
  Store {
    /// The stored type.
    ty: Ty,
    /// The stored value.
    val: Operand,
    /// The address.
    ptr: Operand,
  },
  /// Reserve a stack slot for a value of type `ty`; result is `ty*`.
  /// Always placed in the entry block.
  Alloca {
    /// The slot type.
    ty: Ty,
  },
  /// Address arithmetic.
  Gep {
    /// The base address.
    base: Operand,
    /// The pointee type of `base`.
    pointee: Ty,
    /// The addressing form.
    kind: GepKind,
    /// The result pointer type.
    res: Ty,
  },
  /// A value conversion.
  Cast {
    /// The conversion kind.
    kind: CastKind,
    /// The source type.
    from: Ty,
    /// The destination type (and result type).
    to: Ty,
    /// The converted value.
    arg: Operand,
  },
  /// A direct or indirect call.
  Call {
    /// The callee.
    f: Callee,
    /// The callee signature.
    sig: FnTy,
    /// The calling convention.
    conv: CConv,
    /// The actual arguments.
    args: SmallVec<[Operand; 4]>,
  },
}

/// A block terminator.
#[derive(Clone, Debug)]
pub enum Term {
  /// Return, with a value for non-void functions.
  Ret(Option<Operand>),
  /// Unconditional branch.
  Br(BlockId),
  /// Conditional branch on a `bool` operand.
  CondBr(Operand, BlockId, BlockId),
}

/// A basic block: an ordered list of instructions plus a terminator.
/// A finished function terminates every block.
#[derive(Clone, Debug, Default)]
pub struct Block {
  /// The block label, for logging and tests.
  pub name: String,
  /// The instructions, in emission order.
  pub insts: Vec<ValueId>,
  /// The terminator; `None` only while the block is being built.
  pub term: Option<Term>,
}

/// A function, defined or declared.
#[derive(Clone, Debug)]
pub struct Function {
  /// The symbol name.
  pub name: String,
  /// The calling convention.
  pub conv: CConv,
  /// The linkage.
  pub linkage: Linkage,
  /// The parameter types.
  pub params: Vec<Ty>,
  /// The return type.
  pub ret: Ty,
  /// True if the function accepts additional untyped arguments.
  pub vararg: bool,
  /// The basic blocks; empty for a declaration.
  pub blocks: IdxVec<BlockId, Block>,
  /// The instruction pool, indexed by result id.
  pub insts: IdxVec<ValueId, Inst>,
}

impl Function {
  /// Construct a declaration with no body.
  #[must_use] pub fn decl(name: String, sig: &FnTy, conv: CConv) -> Self {
    Self {
      name,
      conv,
      linkage: Linkage::Public,
      params: sig.params.to_vec(),
      ret: sig.ret.clone(),
      vararg: sig.vararg,
      blocks: IdxVec::new(),
      insts: IdxVec::new(),
    }
  }

  /// True if this function has no body.
  #[must_use] pub fn is_decl(&self) -> bool { self.blocks.is_empty() }

  /// The function signature as a [`FnTy`].
  #[must_use] pub fn sig(&self) -> FnTy {
    FnTy { params: self.params.clone().into(), ret: self.ret.clone(), vararg: self.vararg }
  }

  /// The type of an instruction result.
  #[must_use] pub fn val_ty(&self, v: ValueId) -> Ty {
    match &self.insts[v] {
      Inst::Bin { ty, .. } => ty.clone(),
      Inst::Icmp { .. } | Inst::Fcmp { .. } | Inst::Not { .. } => prim::i1(),
      Inst::Load { ty, .. } => ty.clone(),
      Inst::Store { .. } => prim::void(),
      Inst::Alloca { ty } => prim::ptr(ty.clone()),
      Inst::Gep { res, .. } => res.clone(),
      Inst::Cast { to, .. } => to.clone(),
      Inst::Call { sig, .. } => sig.ret.clone(),
    }
  }
}

/// A compilation unit in IR form.
#[derive(Debug, Default)]
pub struct Module {
  /// The module name.
  pub name: String,
  /// The identified struct types.
  pub structs: IdxVec<StructId, StructDef>,
  struct_names: HashMap<String, StructId>,
  /// The global variables, in creation order.
  pub globals: IdxVec<GlobalId, Global>,
  global_names: HashMap<String, GlobalId>,
  /// The functions, in creation order.
  pub funcs: IdxVec<FuncId, Function>,
  func_names: HashMap<String, FuncId>,
}

impl Module {
  /// Construct an empty module.
  #[must_use] pub fn new(name: String) -> Self { Self { name, ..Self::default() } }

  /// Get or create an opaque identified struct with the given name.
  pub fn ident_struct(&mut self, name: &str) -> StructId {
    if let Some(&id) = self.struct_names.get(name) { return id }
    let id = self.structs.push(StructDef { name: name.to_owned(), body: None });
    self.struct_names.insert(name.to_owned(), id);
    id
  }

  /// Set the body of an identified struct. The body is write-once.
  pub fn set_struct_body(&mut self, id: StructId, body: Box<[Ty]>) {
    let def = &mut self.structs[id];
    assert!(def.body.is_none(), "struct body set twice for '{}'", def.name);
    def.body = Some(body);
  }

  /// Look up an identified struct by name.
  #[must_use] pub fn struct_by_name(&self, name: &str) -> Option<StructId> {
    self.struct_names.get(name).copied()
  }

  /// Add a function. No two functions share a name.
  pub fn add_func(&mut self, f: Function) -> FuncId {
    assert!(
      !self.func_names.contains_key(&f.name),
      "function '{}' defined twice", f.name
    );
    let name = f.name.clone();
    let id = self.funcs.push(f);
    self.func_names.insert(name, id);
    id
  }

  /// Look up a function by symbol name.
  #[must_use] pub fn func_by_name(&self, name: &str) -> Option<FuncId> {
    self.func_names.get(name).copied()
  }

  /// Get a declaration for an external function, creating it on first use.
  pub fn extern_func(&mut self, name: &str, sig: &FnTy, conv: CConv) -> FuncId {
    if let Some(&id) = self.func_names.get(name) { return id }
    self.add_func(Function::decl(name.to_owned(), sig, conv))
  }

  /// Add a global variable. No two globals share a name.
  pub fn add_global(&mut self, g: Global) -> GlobalId {
    assert!(
      !self.global_names.contains_key(&g.name),
      "global '{}' defined twice", g.name
    );
    let name = g.name.clone();
    let id = self.globals.push(g);
    self.global_names.insert(name, id);
    id
  }

  /// Look up a global by symbol name.
  #[must_use] pub fn global_by_name(&self, name: &str) -> Option<GlobalId> {
    self.global_names.get(name).copied()
  }

  /// The byte size of a type for the given word (pointer) size, using
  /// the packed layout: `{i1, i8} → 1`, `i32/f32 → 4`, `i64/f64 → 8`,
  /// pointers and function pointers → word, arrays and structs by sum.
  #[must_use] pub fn sizeof(&self, ty: &TyKind, word: u32) -> u32 {
    match ty {
      TyKind::Void => 0,
      TyKind::I1 | TyKind::I8 => 1,
      TyKind::I32 | TyKind::F32 => 4,
      TyKind::I64 | TyKind::F64 => 8,
      TyKind::Ptr(_) | TyKind::Fn(_) => word,
      TyKind::Array(t, n) => self.sizeof(t, word) * n,
      TyKind::Struct(name) => {
        let id = self.struct_by_name(name).expect("unknown struct");
        let body = self.structs[id].body.as_deref().expect("opaque struct has no size");
        body.iter().map(|t| self.sizeof(t, word)).sum()
      }
    }
  }

  /// The byte offset of field `k` of an identified struct.
  #[must_use] pub fn field_offset(&self, name: &str, k: u32, word: u32) -> u32 {
    let id = self.struct_by_name(name).expect("unknown struct");
    let body = self.structs[id].body.as_deref().expect("opaque struct has no layout");
    body[..k as usize].iter().map(|t| self.sizeof(t, word)).sum()
  }

  /// The element type of field `k` of an identified struct.
  #[must_use] pub fn field_ty(&self, name: &str, k: u32) -> Ty {
    let id = self.struct_by_name(name).expect("unknown struct");
    self.structs[id].body.as_deref().expect("opaque struct")[k as usize].clone()
  }

  /// The type of an operand in the context of a function.
  #[must_use] pub fn operand_ty(&self, f: &Function, o: &Operand) -> Ty {
    match o {
      Operand::Val(v) => f.val_ty(*v),
      &Operand::Arg(i) => f.params[i as usize].clone(),
      Operand::Const(c) => self.const_ty(c),
      Operand::Global(g) => prim::ptr(self.globals[*g].ty.clone()),
      Operand::Func(id) => {
        let f = &self.funcs[*id];
        std::rc::Rc::new(TyKind::Ptr(std::rc::Rc::new(TyKind::Fn(f.sig()))))
      }
    }
  }

  /// The type of a constant.
  #[must_use] pub fn const_ty(&self, c: &Const) -> Ty {
    match c {
      Const::Int(ty, _) => ty.clone(),
      Const::F32(_) => prim::f32(),
      Const::F64(_) => prim::f64(),
      Const::Null(ty) | Const::Zero(ty) => ty.clone(),
      Const::Bytes(b) => {
        std::rc::Rc::new(TyKind::Array(prim::i8(), u32::try_from(b.len()).expect("overflow")))
      }
      Const::Array(elem, v) => {
        std::rc::Rc::new(TyKind::Array(elem.clone(), u32::try_from(v.len()).expect("overflow")))
      }
      Const::GlobalAddr(g) => prim::ptr(self.globals[*g].ty.clone()),
    }
  }
}

/// An instruction builder positioned at the end of a block. All
/// `alloca`s are routed to the entry block regardless of the insertion
/// point, so the stack frame is fixed on function entry.
pub struct Builder<'a> {
  /// The function being built.
  pub f: &'a mut Function,
  /// The current insertion block.
  pub block: BlockId,
}

impl<'a> Builder<'a> {
  /// Open a builder on a function, creating the entry block if needed.
  pub fn new(f: &'a mut Function) -> Self {
    if f.blocks.is_empty() {
      f.blocks.push(Block { name: "entry".to_owned(), ..Block::default() });
    }
    Self { f, block: BlockId::ENTRY }
  }

  /// Append a new (empty, unterminated) block.
  pub fn new_block(&mut self, name: &str) -> BlockId {
    self.f.blocks.push(Block { name: name.to_owned(), ..Block::default() })
  }

  /// Move the insertion point to the end of `b`.
  pub fn position_at_end(&mut self, b: BlockId) { self.block = b }

  /// True if the current block already has a terminator.
  #[must_use] pub fn is_terminated(&self) -> bool {
    self.f.blocks[self.block].term.is_some()
  }

  /// Emit an instruction at the insertion point.
  pub fn emit(&mut self, inst: Inst) -> ValueId {
    debug_assert!(!self.is_terminated(), "emission into a terminated block");
    let v = self.f.insts.push(inst);
    self.f.blocks[self.block].insts.push(v);
    v
  }

  /// Terminate the current block. Does nothing if already terminated.
  pub fn terminate(&mut self, t: Term) {
    let bl = &mut self.f.blocks[self.block];
    if bl.term.is_none() { bl.term = Some(t) }
  }

  /// Reserve a stack slot in the entry block.
  pub fn alloca(&mut self, ty: Ty) -> ValueId {
    let v = self.f.insts.push(Inst::Alloca { ty });
    self.f.blocks[BlockId::ENTRY].insts.push(v);
    v
  }

  /// Emit a load.
  pub fn load(&mut self, ty: Ty, ptr: impl Into<Operand>) -> ValueId {
    self.emit(Inst::Load { ty, ptr: ptr.into() })
  }

  /// Emit a store.
  pub fn store(&mut self, ty: Ty, val: impl Into<Operand>, ptr: impl Into<Operand>) -> ValueId {
    self.emit(Inst::Store { ty, val: val.into(), ptr: ptr.into() })
  }

  /// Emit a binary operation.
  pub fn bin(&mut self, op: BinOp, ty: Ty, lhs: impl Into<Operand>, rhs: impl Into<Operand>)
    -> ValueId {
    self.emit(Inst::Bin { op, ty, lhs: lhs.into(), rhs: rhs.into() })
  }

  /// Emit a signed integer comparison.
  pub fn icmp(&mut self, cc: IntCC, ty: Ty, lhs: impl Into<Operand>, rhs: impl Into<Operand>)
    -> ValueId {
    self.emit(Inst::Icmp { cc, ty, lhs: lhs.into(), rhs: rhs.into() })
  }

  /// The address of field `k` of a struct pointee: `gep p, [0, k]`.
  /// `base` must have type `S*` for an identified struct `S` whose
  /// field types are known to the module.
  pub fn gep_field(&mut self, m: &Module, base: impl Into<Operand>, pointee: Ty, k: u32)
    -> ValueId {
    let TyKind::Struct(name) = &*pointee else { panic!("gep_field on non-struct") };
    let res = prim::ptr(m.field_ty(name, k));
    self.emit(Inst::Gep { base: base.into(), pointee, kind: GepKind::Field(k), res })
  }

  /// The address of element `i` of an array pointee: `gep p, [0, i]`.
  pub fn gep_index(&mut self, base: impl Into<Operand>, pointee: Ty, i: impl Into<Operand>)
    -> ValueId {
    let TyKind::Array(elem, _) = &*pointee else { panic!("gep_index on non-array") };
    let res = prim::ptr(elem.clone());
    self.emit(Inst::Gep { base: base.into(), pointee: pointee.clone(), kind: GepKind::Index(i.into()), res })
  }

  /// Advance a pointer by `i` elements: `gep p, [i]`.
  pub fn gep_offset(&mut self, base: impl Into<Operand>, pointee: Ty, i: impl Into<Operand>)
    -> ValueId {
    let res = prim::ptr(pointee.clone());
    self.emit(Inst::Gep { base: base.into(), pointee, kind: GepKind::Offset(i.into()), res })
  }

  /// Emit a conversion.
  pub fn cast(&mut self, kind: CastKind, from: Ty, to: Ty, arg: impl Into<Operand>) -> ValueId {
    self.emit(Inst::Cast { kind, from, to, arg: arg.into() })
  }

  /// Emit a direct call.
  pub fn call(&mut self, f: FuncId, sig: FnTy, conv: CConv, args: SmallVec<[Operand; 4]>)
    -> ValueId {
    self.emit(Inst::Call { f: Callee::Func(f), sig, conv, args })
  }

  /// Emit an indirect call through a function pointer.
  pub fn call_ptr(&mut self, p: impl Into<Operand>, sig: FnTy, conv: CConv,
    args: SmallVec<[Operand; 4]>) -> ValueId {
    self.emit(Inst::Call { f: Callee::Ptr(p.into()), sig, conv, args })
  }
}

/// A 32-bit integer constant operand.
#[must_use] pub fn int32(v: i64) -> Operand { Operand::Const(Const::Int(prim::i32(), v)) }

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn allocas_go_to_entry() {
    let sig = FnTy { params: Box::new([]), ret: prim::void(), vararg: false };
    let mut f = Function::decl("f".into(), &sig, CConv::C);
    let mut b = Builder::new(&mut f);
    let later = b.new_block("later");
    b.terminate(Term::Br(later));
    b.position_at_end(later);
    let slot = b.alloca(prim::i32());
    b.terminate(Term::Ret(None));
    assert!(f.blocks[BlockId::ENTRY].insts.contains(&slot));
    assert!(!f.blocks[later].insts.contains(&slot));
    assert_eq!(f.val_ty(slot), prim::ptr(prim::i32()));
  }

  #[test]
  fn packed_struct_layout() {
    let mut m = Module::new("t".into());
    let id = m.ident_struct("Pair");
    let vt = prim::ptr(prim::strukt("PairVt"));
    m.ident_struct("PairVt");
    m.set_struct_body(id, Box::new([vt, prim::i32(), prim::i32(), prim::i32()]));
    // word + refcount + two int fields
    assert_eq!(m.sizeof(&TyKind::Struct("Pair".into()), 8), 8 + 4 + 4 + 4);
    assert_eq!(m.field_offset("Pair", 2, 8), 12);
    assert_eq!(m.sizeof(&TyKind::Struct("Pair".into()), 4), 4 + 4 + 4 + 4);
  }

  #[test]
  fn struct_registration_is_idempotent() {
    let mut m = Module::new("t".into());
    let a = m.ident_struct("S");
    let b = m.ident_struct("S");
    assert_eq!(a, b);
  }
}
