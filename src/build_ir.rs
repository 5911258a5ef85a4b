//! The translation pass from the AST to the [IR](crate::types::ir).
//!
//! Statements and expressions are lowered by [`LowerCtx`], which also
//! owns the cross-cutting reference-count policy: object-pointer locals
//! are retained when bound, object-pointer parameters are retained on
//! entry, and both are released (a virtual destructor call through
//! vtable slot 0) on every return path and at the natural end of their
//! scope. Semantic errors are accumulated in the compilation context so
//! one run can surface many diagnostics; a failed statement aborts only
//! its own lowering.

use hashbrown::{HashMap, HashSet};
use if_chain::if_chain;
use itertools::Itertools;
use log::{debug, trace};
use smallvec::SmallVec;
use std::rc::Rc;

use crate::types::Span;
use crate::types::ast::{
  self, AssignOp, Binop, Call, Expr, ExprKind, FuncDef, GlobalDef, Stmt, StmtKind, Storage,
  VarDecl,
};
use crate::types::entity::Entities;
use crate::types::ir::{
  self, BinOp, BlockId, Builder, CConv, Callee, CastKind, Const, FloatCC, FuncId, Function,
  GepKind, GlobalId, Inst, IntCC, Linkage, Operand, Term, ValueId,
};
use crate::types::ty::{FnTy, Ty, TyKind, TypeError, TypeTable, prim};
use crate::{CompilerConfig, Diag, ErrorKind};

/// The result of lowering one construct. `Err` means a diagnostic was
/// already recorded and the enclosing statement should stop.
pub(crate) type Res<T> = Result<T, Aborted>;

/// Marker that a diagnostic has been emitted for the current statement.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Aborted;

/// Per-invocation compilation state shared by every lowering pass.
pub(crate) struct Cx<'a> {
  /// The compiler configuration.
  pub config: &'a CompilerConfig,
  /// The type-name table.
  pub types: &'a mut TypeTable,
  /// The IR module under construction.
  pub ir: ir::Module,
  /// Processed object and import tables.
  pub ents: Entities,
  /// String-literal globals, interned by content.
  pub strings: HashMap<Vec<u8>, GlobalId>,
  /// Names already taken by string-literal globals.
  pub string_names: HashSet<String>,
  /// Accumulated diagnostics.
  pub diags: Vec<Diag>,
  /// Modules currently being imported, for cycle detection.
  pub importing: Vec<String>,
  /// Modules whose import already completed.
  pub imported: HashSet<String>,
  alloc_fn: Option<FuncId>,
  free_fn: Option<FuncId>,
}

impl<'a> Cx<'a> {
  /// Construct a fresh context for one translation unit.
  pub fn new(config: &'a CompilerConfig, types: &'a mut TypeTable, module: &str) -> Self {
    Self {
      config,
      types,
      ir: ir::Module::new(module.to_owned()),
      ents: Entities::default(),
      strings: HashMap::new(),
      string_names: HashSet::new(),
      diags: vec![],
      importing: vec![],
      imported: HashSet::new(),
      alloc_fn: None,
      free_fn: None,
    }
  }

  /// The pointer size of the configured target.
  pub fn word(&self) -> u32 { self.config.target.word() }

  /// Record a diagnostic and continue.
  pub fn err(&mut self, kind: ErrorKind, span: Span, msg: String) {
    trace!("diagnostic at {span}: {msg}");
    self.diags.push(Diag { kind, msg, span: Some(span) });
  }

  /// Resolve a type spelling, diagnosing failures.
  pub fn get_ty(&mut self, spelling: &str, span: Span) -> Res<(Ty, bool)> {
    match self.types.get(spelling) {
      Ok(t) => Ok(t),
      Err(e) => {
        let kind = match e {
          TypeError::Unknown(_) => ErrorKind::Unresolved,
          TypeError::MissingDimension | TypeError::Empty => ErrorKind::InvalidShape,
        };
        self.err(kind, span, e.to_string());
        Err(Aborted)
      }
    }
  }

  /// The external allocator, declared on first use.
  pub fn allocator(&mut self) -> FuncId {
    if let Some(f) = self.alloc_fn { return f }
    let sig = FnTy { params: Box::new([prim::i32()]), ret: prim::pi8(), vararg: false };
    let f = self.ir.extern_func(&self.config.allocator, &sig, CConv::C);
    self.alloc_fn = Some(f);
    f
  }

  /// The external deallocator, declared on first use.
  pub fn deallocator(&mut self) -> FuncId {
    if let Some(f) = self.free_fn { return f }
    let sig = FnTy { params: Box::new([prim::pi8()]), ret: prim::void(), vararg: false };
    let f = self.ir.extern_func(&self.config.deallocator, &sig, CConv::C);
    self.free_fn = Some(f);
    f
  }

  /// Intern a string literal, returning the constant global holding its
  /// bytes plus terminator. One global per distinct content.
  pub fn intern_string(&mut self, s: &str) -> GlobalId {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    if let Some(&g) = self.strings.get(&bytes) { return g }
    let name = self.str2name(s);
    let n = u32::try_from(bytes.len()).expect("overflow");
    let g = self.ir.add_global(ir::Global {
      name,
      ty: Rc::new(TyKind::Array(prim::i8(), n)),
      linkage: Linkage::Internal,
      konst: true,
      init: Some(Const::Bytes(bytes.clone())),
    });
    self.strings.insert(bytes, g);
    g
  }

  /// Derive a symbol name from string content: punctuation becomes
  /// words, words are camel-cased, and the leading alphanumeric run
  /// (capped at 16 characters) is prefixed with `a`. Collisions get a
  /// `.N` suffix.
  fn str2name(&mut self, s: &str) -> String {
    const MAX_LEN: usize = 16;
    let mut expanded = String::new();
    for c in s.chars() {
      match c {
        '*' => expanded.push_str("Star "),
        '.' => expanded.push_str("Dot "),
        '%' => expanded.push_str("Percent "),
        '/' => expanded.push_str("Slash "),
        '\n' => expanded.push_str("Newline "),
        '\\' => expanded.push_str("Backslash "),
        '+' => expanded.push_str("Plus "),
        ';' => expanded.push_str("Semicolon "),
        ':' => expanded.push_str("Colon "),
        '!' => expanded.push_str("Exclamation "),
        '?' => expanded.push_str("Question "),
        '-' => expanded.push_str("Minus "),
        c if (' '..='~').contains(&c) => expanded.push(c),
        _ => {}
      }
    }
    let mut cased = String::new();
    let mut upper = true;
    for c in expanded.chars() {
      if c == ' ' {
        upper = true;
        continue;
      }
      if upper {
        cased.extend(c.to_uppercase());
        upper = false;
      } else {
        cased.push(c);
      }
    }
    let run: String = cased.chars().take_while(char::is_ascii_alphanumeric).take(MAX_LEN).collect();
    let basename = if s.is_empty() {
      "aEmpty".to_owned()
    } else if run.is_empty() {
      "string".to_owned()
    } else {
      format!("a{run}")
    };
    let mut name = basename.clone();
    let mut count = 1;
    while self.string_names.contains(&name) {
      name = format!("{basename}.{count}");
      count += 1;
    }
    self.string_names.insert(name.clone());
    name
  }
}

/// A visible local binding (parameters are entered as locals bound to
/// their stack homes; `this` is a constant local).
#[derive(Clone, Debug)]
struct Local {
  /// The address of the binding's storage.
  slot: Operand,
  /// The value type.
  ty: Ty,
  /// True if assignment is forbidden.
  konst: bool,
}

/// An object-pointer binding to be released on scope exit.
#[derive(Clone, Debug)]
struct Owned {
  name: String,
  slot: Operand,
  ty: Ty,
}

/// The per-function lowering context.
pub(crate) struct LowerCtx<'a, 'b> {
  /// The shared compilation state.
  pub cx: &'a mut Cx<'b>,
  /// The id under which the function is registered.
  pub fid: FuncId,
  /// The function body being built (swapped out of the module).
  pub func: Function,
  /// The current insertion block.
  pub block: BlockId,
  /// True until an explicit return type (or the first `return`) fixes
  /// the signature.
  pub ret_inferred: bool,
  /// True once any `return` has been lowered.
  pub returned: bool,
  /// The object whose method body is being lowered, for storage checks.
  pub cur_object: Option<String>,
  locals: HashMap<String, Local>,
  owned: Vec<Owned>,
  retained_params: Vec<(Operand, Ty)>,
  brk: Option<BlockId>,
  cont: Option<BlockId>,
  loop_mark: usize,
}

impl<'a, 'b> LowerCtx<'a, 'b> {
  /// Open a lowering context on a function that was just added to the
  /// module. The function is swapped out so the module stays usable for
  /// declaring externs and globals while the body is built.
  pub fn new(cx: &'a mut Cx<'b>, fid: FuncId, ret_inferred: bool) -> Self {
    // leave a declaration with the same signature in the slot, so calls
    // to this function (recursion included) resolve while the body is
    // out of the module
    let decl = {
      let f = &cx.ir.funcs[fid];
      let mut d = Function::decl(f.name.clone(), &f.sig(), f.conv);
      d.linkage = f.linkage;
      d
    };
    let mut func = std::mem::replace(&mut cx.ir.funcs[fid], decl);
    Builder::new(&mut func);
    Self {
      cx,
      fid,
      func,
      block: BlockId::ENTRY,
      ret_inferred,
      returned: false,
      cur_object: None,
      locals: HashMap::new(),
      owned: vec![],
      retained_params: vec![],
      brk: None,
      cont: None,
      loop_mark: 0,
    }
  }

  /// Write the finished function back into the module.
  pub fn finish(self) {
    self.cx.ir.funcs[self.fid] = self.func;
  }

  pub(crate) fn emit(&mut self, inst: Inst) -> ValueId {
    Builder { f: &mut self.func, block: self.block }.emit(inst)
  }

  pub(crate) fn alloca(&mut self, ty: Ty) -> ValueId {
    Builder { f: &mut self.func, block: self.block }.alloca(ty)
  }

  pub(crate) fn new_block(&mut self, name: &str) -> BlockId {
    Builder { f: &mut self.func, block: self.block }.new_block(name)
  }

  pub(crate) fn terminate(&mut self, t: Term) {
    Builder { f: &mut self.func, block: self.block }.terminate(t)
  }

  pub(crate) fn is_terminated(&self) -> bool {
    self.func.blocks[self.block].term.is_some()
  }

  pub(crate) fn load(&mut self, ty: Ty, ptr: impl Into<Operand>) -> ValueId {
    self.emit(Inst::Load { ty, ptr: ptr.into() })
  }

  pub(crate) fn store(&mut self, ty: Ty, val: impl Into<Operand>, ptr: impl Into<Operand>) {
    self.emit(Inst::Store { ty, val: val.into(), ptr: ptr.into() });
  }

  /// The address of field `k` of a pointer to the identified struct
  /// `sname`.
  pub(crate) fn gep_field(&mut self, base: impl Into<Operand>, sname: &str, k: u32) -> ValueId {
    let res = prim::ptr(self.cx.ir.field_ty(sname, k));
    self.emit(Inst::Gep {
      base: base.into(),
      pointee: prim::strukt(sname),
      kind: GepKind::Field(k),
      res,
    })
  }

  pub(crate) fn gep_index(&mut self, base: impl Into<Operand>, arr: Ty, i: impl Into<Operand>) -> ValueId {
    let TyKind::Array(elem, _) = &*arr else { unreachable!("gep_index on non-array") };
    let res = prim::ptr(elem.clone());
    self.emit(Inst::Gep { base: base.into(), pointee: arr.clone(), kind: GepKind::Index(i.into()), res })
  }

  pub(crate) fn gep_offset(&mut self, base: impl Into<Operand>, pointee: Ty, i: impl Into<Operand>) -> ValueId {
    let res = prim::ptr(pointee.clone());
    self.emit(Inst::Gep { base: base.into(), pointee, kind: GepKind::Offset(i.into()), res })
  }

  /// Enter the function parameters: every parameter is copied into a
  /// stack home and bound as a local; object-pointer parameters other
  /// than `this` are retained and recorded for release on exit.
  pub fn enter_params(&mut self, names: &[(String, bool)], this_idx: Option<u32>) {
    let mut retained = 0_usize;
    for (i, (name, konst)) in names.iter().enumerate() {
      let idx = u32::try_from(i).expect("overflow");
      let ty = self.func.params[i].clone();
      let home = self.alloca(ty.clone());
      self.store(ty.clone(), Operand::Arg(idx), home);
      let is_this = this_idx == Some(idx);
      self.locals.insert(name.clone(), Local {
        slot: Operand::Val(home),
        ty: ty.clone(),
        konst: *konst || is_this,
      });
      if is_this { continue }
      if ty.as_object().is_some() {
        self.retain(Operand::Arg(idx), &ty);
        self.retained_params.push((Operand::Val(home), ty));
        retained += 1;
      }
    }
    debug!("{retained} object(s) retained");
  }

  /// Bind `this` inside a constructor, where it is a computed value
  /// rather than a parameter.
  pub fn bind_this_value(&mut self, ty: Ty, val: Operand) {
    let home = self.alloca(ty.clone());
    self.store(ty.clone(), val, home);
    self.locals.insert("this".to_owned(), Local { slot: Operand::Val(home), ty, konst: true });
  }

  /// Load the current `this` binding from its stack home.
  pub(crate) fn load_this(&mut self) -> Operand {
    let l = self.locals.get("this").cloned().expect("no 'this' in scope");
    let v = self.load(l.ty, l.slot);
    v.into()
  }

  /// Increment the reference count of an object pointer.
  fn retain(&mut self, obj: Operand, ty: &Ty) {
    let sname = ty.as_object().expect("retain of non-object").to_owned();
    let p = self.gep_field(obj, &sname, 1);
    let n = self.load(prim::i32(), p);
    let n1 = self.emit(Inst::Bin { op: BinOp::Add, ty: prim::i32(), lhs: n.into(), rhs: ir::int32(1) });
    self.store(prim::i32(), n1, p);
  }

  /// Release an object pointer: load its vtable, load the destructor
  /// from slot 0, and call it virtually with `this = obj`.
  pub fn release(&mut self, obj: Operand, ty: &Ty) {
    let sname = ty.as_object().expect("release of non-object").to_owned();
    let vt_ty = self.cx.ir.field_ty(&sname, 0);
    let TyKind::Ptr(vt_struct) = &*vt_ty else { unreachable!("vtable slot is a pointer") };
    let TyKind::Struct(vt_name) = &**vt_struct else { unreachable!("vtable is identified") };
    let vt_name = vt_name.clone();
    let pp = self.gep_field(obj.clone(), &sname, 0);
    let vt = self.load(vt_ty.clone(), pp);
    let slot = self.gep_field(vt, &vt_name, 0);
    let raw_ty = self.cx.ir.field_ty(&vt_name, 0);
    let fnp = self.load(raw_ty.clone(), slot);
    let sig = FnTy { params: Box::new([ty.clone()]), ret: prim::void(), vararg: false };
    let cast_ty = prim::ptr(Rc::new(TyKind::Fn(sig.clone())));
    let cast = self.emit(Inst::Cast {
      kind: CastKind::Bitcast,
      from: raw_ty,
      to: cast_ty,
      arg: fnp.into(),
    });
    self.emit(Inst::Call {
      f: Callee::Ptr(cast.into()),
      sig,
      conv: CConv::C,
      args: SmallVec::from_iter([obj]),
    });
  }

  fn release_range(&mut self, start: usize) {
    let slots: Vec<Owned> = self.owned[start..].to_vec();
    for o in &slots {
      let v = self.load(o.ty.clone(), o.slot.clone());
      self.release(v.into(), &o.ty);
    }
    if !slots.is_empty() { debug!("{} object(s) released", slots.len()) }
  }

  /// Release everything visible on a return path: owned locals in
  /// insertion order (except a local being returned by value), then the
  /// retained parameters.
  fn release_for_return(&mut self, moved: Option<&str>) {
    let locals: Vec<Owned> = self.owned.clone();
    let mut released = 0_usize;
    for o in &locals {
      if moved == Some(&*o.name) { continue }
      let v = self.load(o.ty.clone(), o.slot.clone());
      self.release(v.into(), &o.ty);
      released += 1;
    }
    let params: Vec<(Operand, Ty)> = self.retained_params.clone();
    for (slot, ty) in &params {
      let v = self.load(ty.clone(), slot.clone());
      self.release(v.into(), ty);
      released += 1;
    }
    if released != 0 { debug!("{released} object(s) released") }
  }

  /// Release the retained parameters only; used by the constructor
  /// skeleton, whose exit path is synthesized outside [`finish_body`].
  pub(crate) fn release_params(&mut self) {
    let params: Vec<(Operand, Ty)> = self.retained_params.clone();
    for (slot, ty) in &params {
      let v = self.load(ty.clone(), slot.clone());
      self.release(v.into(), ty);
    }
  }

  /// Coerce a value to an expected type per the conversion lattice:
  /// identity, pointer bitcasts, truthiness to `bool`, integer
  /// widening/narrowing, and 32-bit-or-wider integer to pointer.
  /// Returns `None` if no conversion applies.
  fn coerce(&mut self, expected: &Ty, got: &Ty, val: Operand) -> Option<Operand> {
    if expected == got { return Some(val) }
    if expected.is_pointer() && got.is_pointer() {
      let v = self.emit(Inst::Cast {
        kind: CastKind::Bitcast,
        from: got.clone(),
        to: expected.clone(),
        arg: val,
      });
      return Some(v.into());
    }
    if **expected == TyKind::I1 {
      if got.is_pointer() {
        let v = self.emit(Inst::Icmp {
          cc: IntCC::Ne,
          ty: got.clone(),
          lhs: val,
          rhs: Operand::Const(Const::Null(got.clone())),
        });
        return Some(v.into());
      }
      if got.is_int() {
        let v = self.emit(Inst::Icmp {
          cc: IntCC::Ne,
          ty: got.clone(),
          lhs: val,
          rhs: Operand::Const(Const::Int(got.clone(), 0)),
        });
        return Some(v.into());
      }
      return None;
    }
    if let (Some(eb), Some(gb)) = (expected.int_bits(), got.int_bits()) {
      if let Operand::Const(Const::Int(_, n)) = val {
        return Some(Operand::Const(Const::Int(expected.clone(), n)));
      }
      let kind = if gb <= eb { CastKind::Zext } else { CastKind::Trunc };
      let v = self.emit(Inst::Cast { kind, from: got.clone(), to: expected.clone(), arg: val });
      return Some(v.into());
    }
    if expected.is_pointer() && got.int_bits().is_some_and(|b| b >= 32) {
      let v = self.emit(Inst::Cast {
        kind: CastKind::IntToPtr,
        from: got.clone(),
        to: expected.clone(),
        arg: val,
      });
      return Some(v.into());
    }
    None
  }

  fn coerce_or_err(&mut self, expected: &Ty, got: &Ty, val: Operand, span: Span, what: &str)
    -> Res<Operand> {
    match self.coerce(expected, got, val) {
      Some(v) => Ok(v),
      None => {
        self.cx.err(ErrorKind::TypeMismatch, span,
          format!("unable to cast '{got}' to '{expected}' in {what}"));
        Err(Aborted)
      }
    }
  }

  fn lower_cond(&mut self, e: &Expr) -> Res<Operand> {
    let (ty, v) = self.lower_expr(e)?;
    self.coerce_or_err(&prim::i1(), &ty, v, e.span, "condition")
  }

  /// Lower an expression to a `(type, value)` pair.
  pub fn lower_expr(&mut self, e: &Expr) -> Res<(Ty, Operand)> {
    let span = e.span;
    match &e.k {
      &ExprKind::Int(n) => Ok((prim::i32(), Operand::Const(Const::Int(prim::i32(), n)))),
      &ExprKind::Float(x) => Ok((prim::f32(), Operand::Const(Const::F32(x)))),
      &ExprKind::Double(x) => Ok((prim::f64(), Operand::Const(Const::F64(x)))),
      &ExprKind::Char(c) => Ok((prim::i8(), Operand::Const(Const::Int(prim::i8(), i64::from(c))))),
      &ExprKind::Bool(b) => Ok((prim::i1(), Operand::Const(Const::Int(prim::i1(), i64::from(b))))),
      ExprKind::Str(s) => {
        let g = self.cx.intern_string(s);
        let from = self.cx.ir.operand_ty(&self.func, &Operand::Global(g));
        let v = self.emit(Inst::Cast {
          kind: CastKind::Bitcast,
          from,
          to: prim::pi8(),
          arg: Operand::Global(g),
        });
        Ok((prim::pi8(), v.into()))
      }
      ExprKind::Ident(name) => self.lower_ident(name, span),
      ExprKind::Ref(name) => self.lower_ref(name, span),
      ExprKind::Deref(inner) => {
        let (ty, v) = self.lower_expr(inner)?;
        let Some(pointee) = ty.pointee() else {
          self.cx.err(ErrorKind::InvalidShape, span,
            format!("cannot dereference non-pointer type '{ty}'"));
          return Err(Aborted);
        };
        let pointee = pointee.clone();
        let l = self.load(pointee.clone(), v);
        Ok((pointee, l.into()))
      }
      ExprKind::Binop(op, lhs, rhs) => self.lower_binop(*op, lhs, rhs, span),
      ExprKind::Not(inner) => {
        let (ty, v) = self.lower_expr(inner)?;
        let v = self.coerce_or_err(&prim::i1(), &ty, v, span, "logical not")?;
        let r = self.emit(Inst::Not { arg: v });
        Ok((prim::i1(), r.into()))
      }
      ExprKind::Cast(spelling, inner) => {
        let (target, _) = self.cx.get_ty(spelling, span)?;
        let (ty, v) = self.lower_expr(inner)?;
        let v = self.coerce_or_err(&target, &ty, v, span, "cast")?;
        Ok((target, v))
      }
      ExprKind::Index(base, index) => {
        let (addr, elem) = self.lower_index_addr(base, index, span)?;
        let l = self.load(elem.clone(), addr);
        Ok((elem, l.into()))
      }
      ExprKind::Field(base, fname) => {
        let (addr, fty, _) = self.lower_field_addr(base, fname, span)?;
        // array fields decay to a pointer to their first element
        if let TyKind::Array(elem, _) = &*fty {
          let elem = elem.clone();
          let v = self.gep_index(addr, fty.clone(), ir::int32(0));
          return Ok((prim::ptr(elem), v.into()));
        }
        let l = self.load(fty.clone(), addr);
        Ok((fty, l.into()))
      }
      ExprKind::Array(elems) => self.lower_array(elems, span),
      ExprKind::New(name, args) => self.lower_new(name, args, span),
      ExprKind::Call(call) => self.lower_call(call, span),
      ExprKind::MethodCall { recv, name, args } => self.lower_method_call(recv, name, args, span),
    }
  }

  fn lower_ident(&mut self, name: &str, span: Span) -> Res<(Ty, Operand)> {
    if let Some(local) = self.locals.get(name).cloned() {
      // arrays decay to a pointer to their first element
      if let TyKind::Array(elem, _) = &*local.ty {
        let elem = elem.clone();
        let v = self.gep_index(local.slot, local.ty.clone(), ir::int32(0));
        return Ok((prim::ptr(elem), v.into()));
      }
      let l = self.load(local.ty.clone(), local.slot);
      return Ok((local.ty, l.into()));
    }
    if let Some(g) = self.cx.ir.global_by_name(name) {
      let ty = self.cx.ir.globals[g].ty.clone();
      if let TyKind::Array(elem, _) = &*ty {
        let elem = elem.clone();
        let v = self.gep_index(Operand::Global(g), ty.clone(), ir::int32(0));
        return Ok((prim::ptr(elem), v.into()));
      }
      let l = self.load(ty.clone(), Operand::Global(g));
      return Ok((ty, l.into()));
    }
    if let Some(f) = self.cx.ir.func_by_name(name) {
      let ty = self.cx.ir.operand_ty(&self.func, &Operand::Func(f));
      return Ok((ty, Operand::Func(f)));
    }
    self.cx.err(ErrorKind::Unresolved, span,
      format!("undefined reference to '{name}' in expression"));
    Err(Aborted)
  }

  fn lower_ref(&mut self, name: &str, span: Span) -> Res<(Ty, Operand)> {
    if let Some(local) = self.locals.get(name).cloned() {
      return Ok((prim::ptr(local.ty), local.slot));
    }
    if let Some(g) = self.cx.ir.global_by_name(name) {
      let ty = self.cx.ir.globals[g].ty.clone();
      return Ok((prim::ptr(ty), Operand::Global(g)));
    }
    if let Some(f) = self.cx.ir.func_by_name(name) {
      let ty = self.cx.ir.operand_ty(&self.func, &Operand::Func(f));
      return Ok((ty, Operand::Func(f)));
    }
    self.cx.err(ErrorKind::Unresolved, span,
      format!("undefined reference to '{name}' in expression"));
    Err(Aborted)
  }

  fn lower_binop(&mut self, op: Binop, lhs: &Expr, rhs: &Expr, span: Span) -> Res<(Ty, Operand)> {
    if op.is_cmp() { return self.lower_cmp(op, lhs, rhs, span) }
    if matches!(op, Binop::And | Binop::Or) {
      let (lt, lv) = self.lower_expr(lhs)?;
      let lv = self.coerce_or_err(&prim::i1(), &lt, lv, span, "logical operand")?;
      let (rt, rv) = self.lower_expr(rhs)?;
      let rv = self.coerce_or_err(&prim::i1(), &rt, rv, span, "logical operand")?;
      let bop = if op == Binop::And { BinOp::And } else { BinOp::Or };
      let v = self.emit(Inst::Bin { op: bop, ty: prim::i1(), lhs: lv, rhs: rv });
      return Ok((prim::i1(), v.into()));
    }

    let (lt, lv) = self.lower_expr(lhs)?;
    let (rt, rv) = self.lower_expr(rhs)?;

    // pointer arithmetic: the GEP index is in elements, so the backend
    // applies the ABI-size scaling exactly once
    if matches!(op, Binop::Add | Binop::Sub) {
      if let Some(pointee) = lt.pointee() {
        if *rt == TyKind::I32 {
          let pointee = pointee.clone();
          let idx = if op == Binop::Add {
            rv
          } else {
            let neg = self.emit(Inst::Bin {
              op: BinOp::Sub,
              ty: prim::i32(),
              lhs: ir::int32(0),
              rhs: rv,
            });
            neg.into()
          };
          let v = self.gep_offset(lv, pointee, idx);
          return Ok((lt, v.into()));
        }
      } else if rt.is_pointer() && *lt == TyKind::I32 {
        if op == Binop::Sub {
          self.cx.err(ErrorKind::TypeMismatch, span, "invalid operation".to_owned());
          return Err(Aborted);
        }
        let pointee = rt.pointee().expect("pointer").clone();
        let v = self.gep_offset(rv, pointee, lv);
        return Ok((rt, v.into()));
      }
    }

    if lt != rt {
      self.cx.err(ErrorKind::TypeMismatch, span, format!(
        "invalid operands to '{}': '{lt}' and '{rt}'", op.name()));
      return Err(Aborted);
    }
    let bop = if lt.is_float() {
      match op {
        Binop::Add => BinOp::Fadd,
        Binop::Sub => BinOp::Fsub,
        Binop::Mul => BinOp::Fmul,
        Binop::Div => BinOp::Fdiv,
        _ => unreachable!(),
      }
    } else if lt.is_int() {
      match op {
        Binop::Add => BinOp::Add,
        Binop::Sub => BinOp::Sub,
        Binop::Mul => BinOp::Mul,
        Binop::Div => BinOp::Sdiv,
        _ => unreachable!(),
      }
    } else {
      self.cx.err(ErrorKind::TypeMismatch, span, format!(
        "invalid operands to '{}': '{lt}' and '{rt}'", op.name()));
      return Err(Aborted);
    };
    let v = self.emit(Inst::Bin { op: bop, ty: lt.clone(), lhs: lv, rhs: rv });
    Ok((lt, v.into()))
  }

  fn lower_cmp(&mut self, op: Binop, lhs: &Expr, rhs: &Expr, span: Span) -> Res<(Ty, Operand)> {
    let (lt, lv) = self.lower_expr(lhs)?;
    let (rt, rv) = self.lower_expr(rhs)?;
    if lt != rt {
      self.cx.err(ErrorKind::TypeMismatch, span, format!(
        "comparison operands have different types '{lt}' and '{rt}'; use an explicit cast"));
      return Err(Aborted);
    }
    if lt.is_float() {
      let cc = match op {
        Binop::Eq => FloatCC::Oeq,
        Binop::Ne => FloatCC::One,
        Binop::Lt => FloatCC::Olt,
        Binop::Le => FloatCC::Ole,
        Binop::Gt => FloatCC::Ogt,
        Binop::Ge => FloatCC::Oge,
        _ => unreachable!(),
      };
      let v = self.emit(Inst::Fcmp { cc, ty: lt, lhs: lv, rhs: rv });
      return Ok((prim::i1(), v.into()));
    }
    if matches!(&*lt, TyKind::I8 | TyKind::I32 | TyKind::I64) || lt.is_pointer() {
      let cc = match op {
        Binop::Eq => IntCC::Eq,
        Binop::Ne => IntCC::Ne,
        Binop::Lt => IntCC::Lt,
        Binop::Le => IntCC::Le,
        Binop::Gt => IntCC::Gt,
        Binop::Ge => IntCC::Ge,
        _ => unreachable!(),
      };
      let v = self.emit(Inst::Icmp { cc, ty: lt, lhs: lv, rhs: rv });
      return Ok((prim::i1(), v.into()));
    }
    self.cx.err(ErrorKind::TypeMismatch, span,
      format!("invalid lhs type '{lt}' in expression"));
    Err(Aborted)
  }

  /// The address and element type of an `a[i]` access.
  fn lower_index_addr(&mut self, base: &Expr, index: &Expr, span: Span) -> Res<(Operand, Ty)> {
    let (ity, iv) = self.lower_expr(index)?;
    if !ity.is_int() {
      self.cx.err(ErrorKind::TypeMismatch, span, format!("'{ity}' is not a valid index"));
      return Err(Aborted);
    }
    let (bty, bv) = self.lower_expr(base)?;
    match &*bty {
      TyKind::Array(elem, _) => {
        // array literals evaluate to their backing allocation
        let elem = elem.clone();
        let v = self.gep_index(bv, bty.clone(), iv);
        Ok((v.into(), elem))
      }
      TyKind::Ptr(elem) => {
        let elem = elem.clone();
        let v = self.gep_offset(bv, elem.clone(), iv);
        Ok((v.into(), elem))
      }
      _ => {
        self.cx.err(ErrorKind::TypeMismatch, span, format!("'{bty}' is not an indexable type"));
        Err(Aborted)
      }
    }
  }

  /// The address, type, and constness of an `o.f` access.
  fn lower_field_addr(&mut self, base: &Expr, fname: &str, span: Span)
    -> Res<(Operand, Ty, bool)> {
    let (bty, bv) = self.lower_expr(base)?;
    let Some(sname) = bty.as_object().map(str::to_owned) else {
      self.cx.err(ErrorKind::Unresolved, span, format!("'{bty}' is not an object"));
      return Err(Aborted);
    };
    let Some(obj) = self.cx.ents.object(&sname) else {
      self.cx.err(ErrorKind::Unresolved, span, format!("'{sname}' is not an object"));
      return Err(Aborted);
    };
    let Some((idx, field)) = obj.field(fname) else {
      self.cx.err(ErrorKind::Unresolved, span,
        format!("'{fname}' is not a valid member of object '{sname}'"));
      return Err(Aborted);
    };
    let (fty, konst, storage) = (field.ty.clone(), field.konst, field.storage);
    if storage == Storage::Private && self.cur_object.as_deref() != Some(&*sname) {
      self.cx.err(ErrorKind::Storage, span, "storage type violation".to_owned());
      return Err(Aborted);
    }
    let v = self.gep_field(bv, &sname, idx + 2);
    Ok((v.into(), fty, konst))
  }

  fn lower_array(&mut self, elems: &[Expr], span: Span) -> Res<(Ty, Operand)> {
    if elems.is_empty() {
      self.cx.err(ErrorKind::InvalidShape, span, "can't create an empty array".to_owned());
      return Err(Aborted);
    }
    let mut vals = Vec::with_capacity(elems.len());
    let mut elem_ty: Option<Ty> = None;
    for e in elems {
      let (ty, v) = self.lower_expr(e)?;
      if let Some(expected) = &elem_ty {
        if *expected != ty {
          self.cx.err(ErrorKind::TypeMismatch, e.span, format!(
            "invalid element type: expected '{expected}', got '{ty}'"));
          return Err(Aborted);
        }
      } else {
        elem_ty = Some(ty);
      }
      vals.push(v);
    }
    let elem_ty = elem_ty.expect("nonempty");
    let n = u32::try_from(vals.len()).expect("overflow");
    let arr_ty = Rc::new(TyKind::Array(elem_ty.clone(), n));
    let slot = self.alloca(arr_ty.clone());
    for (i, v) in vals.into_iter().enumerate() {
      let p = self.gep_index(slot, arr_ty.clone(), ir::int32(i as i64));
      self.store(elem_ty.clone(), v, p);
    }
    Ok((arr_ty, Operand::Val(slot)))
  }

  fn lower_new(&mut self, name: &str, args: &[Expr], span: Span) -> Res<(Ty, Operand)> {
    let Some(obj) = self.cx.ents.object(name) else {
      self.cx.err(ErrorKind::Unresolved, span, format!("'{name}' is not an object"));
      return Err(Aborted);
    };
    let (ctor, ty) = (obj.ctor, obj.ty.clone());
    let sig = self.cx.ir.funcs[ctor].sig();
    let conv = self.cx.ir.funcs[ctor].conv;
    let vals = self.lower_args(&sig, None, args, span)?;
    let v = self.emit(Inst::Call { f: Callee::Func(ctor), sig, conv, args: vals });
    Ok((ty, v.into()))
  }

  /// Typecheck and coerce a call's actual arguments against a
  /// signature. `prepend` is an already-computed `this` argument.
  fn lower_args(&mut self, sig: &FnTy, prepend: Option<Operand>, args: &[Expr], span: Span)
    -> Res<SmallVec<[Operand; 4]>> {
    let skip = usize::from(prepend.is_some());
    let fixed = sig.params.len() - skip;
    if sig.vararg {
      if args.len() < fixed {
        self.cx.err(ErrorKind::Arity, span, format!(
          "argument count mismatch. expected at least {fixed}, got {}", args.len()));
        return Err(Aborted);
      }
    } else if args.len() != fixed {
      self.cx.err(ErrorKind::Arity, span, format!(
        "argument count mismatch. expected {fixed}, got {}", args.len()));
      return Err(Aborted);
    }
    let mut out = SmallVec::new();
    if let Some(this) = prepend { out.push(this) }
    for (i, a) in args.iter().enumerate() {
      let (ty, v) = self.lower_expr(a)?;
      if i < fixed {
        let expected = sig.params[i + skip].clone();
        match self.coerce(&expected, &ty, v) {
          Some(v) => out.push(v),
          None => {
            self.cx.err(ErrorKind::TypeMismatch, a.span, format!(
              "argument {i}: expected type {expected}, got {ty}"));
            return Err(Aborted);
          }
        }
      } else {
        out.push(v);
      }
    }
    Ok(out)
  }

  fn lower_call(&mut self, call: &Call, span: Span) -> Res<(Ty, Operand)> {
    let fid = if call.scope.is_empty() {
      match self.cx.ir.func_by_name(&call.name) {
        Some(f) => f,
        None => {
          self.cx.err(ErrorKind::Unresolved, span, format!(
            "reference to undefined function '{}'", call.name));
          return Err(Aborted);
        }
      }
    } else {
      let Some(scope) = self.cx.ents.modules.walk(&call.scope) else {
        let bad = call.scope.iter().format("::");
        self.cx.err(ErrorKind::Unresolved, span,
          format!("'{bad}' does not name a valid scope"));
        return Err(Aborted);
      };
      match scope.funcs.get(&call.name) {
        Some(imp) => {
          let (name, sig, conv) = (imp.extern_name.clone(), imp.sig.clone(), imp.conv);
          self.cx.ir.extern_func(&name, &sig, conv)
        }
        None => {
          let fqn = crate::mangle::scoped(&call.scope, &call.name);
          self.cx.err(ErrorKind::Unresolved, span,
            format!("reference to undefined function '{fqn}'"));
          return Err(Aborted);
        }
      }
    };
    let sig = self.cx.ir.funcs[fid].sig();
    let conv = self.cx.ir.funcs[fid].conv;
    let vals = self.lower_args(&sig, None, &call.args, span)?;
    let ret = sig.ret.clone();
    let v = self.emit(Inst::Call { f: Callee::Func(fid), sig, conv, args: vals });
    Ok((ret, v.into()))
  }

  fn lower_method_call(&mut self, recv: &Expr, name: &str, args: &[Expr], span: Span)
    -> Res<(Ty, Operand)> {
    let (rty, robj) = self.lower_expr(recv)?;
    let Some(sname) = rty.as_object().map(str::to_owned) else {
      self.cx.err(ErrorKind::Unresolved, span, format!("'{rty}' is not an object"));
      return Err(Aborted);
    };
    let Some(obj) = self.cx.ents.object(&sname) else {
      self.cx.err(ErrorKind::Unresolved, span, format!("'{sname}' is not an object"));
      return Err(Aborted);
    };
    let Some(m) = obj.method(name) else {
      self.cx.err(ErrorKind::Unresolved, span,
        format!("'{name}' is not a valid member of '{sname}'"));
      return Err(Aborted);
    };
    let (slot, sig, storage) = (m.slot, m.sig.clone(), m.storage);
    let vt_name = self.cx.ir.structs[obj.vtable_struct].name.clone();
    if storage == Storage::Private && self.cur_object.as_deref() != Some(&*sname) {
      self.cx.err(ErrorKind::Storage, span, "storage type violation".to_owned());
      return Err(Aborted);
    }

    let vt_ty = self.cx.ir.field_ty(&sname, 0);
    let pp = self.gep_field(robj.clone(), &sname, 0);
    let vt = self.load(vt_ty, pp);
    let slot_pp = self.gep_field(vt, &vt_name, slot);
    let raw_ty = self.cx.ir.field_ty(&vt_name, slot);
    let fnp = self.load(raw_ty.clone(), slot_pp);
    let fn_ptr_ty = prim::ptr(Rc::new(TyKind::Fn(sig.clone())));
    let cast = self.emit(Inst::Cast {
      kind: CastKind::Bitcast,
      from: raw_ty,
      to: fn_ptr_ty,
      arg: fnp.into(),
    });
    let vals = self.lower_args(&sig, Some(robj), args, span)?;
    let ret = sig.ret.clone();
    let v = self.emit(Inst::Call { f: Callee::Ptr(cast.into()), sig, conv: CConv::C, args: vals });
    Ok((ret, v.into()))
  }

  /// The place (address, type, constness) denoted by an assignment lhs.
  fn lower_place(&mut self, e: &Expr) -> Res<(Operand, Ty, bool)> {
    let span = e.span;
    match &e.k {
      ExprKind::Ident(name) => {
        if let Some(local) = self.locals.get(name).cloned() {
          return Ok((local.slot, local.ty, local.konst));
        }
        if let Some(g) = self.cx.ir.global_by_name(name) {
          let (ty, konst) = {
            let g = &self.cx.ir.globals[g];
            (g.ty.clone(), g.konst)
          };
          return Ok((Operand::Global(g), ty, konst));
        }
        self.cx.err(ErrorKind::Unresolved, span,
          format!("undefined reference to '{name}' in assignment"));
        Err(Aborted)
      }
      ExprKind::Deref(inner) => {
        let (ty, v) = self.lower_expr(inner)?;
        let Some(pointee) = ty.pointee() else {
          self.cx.err(ErrorKind::InvalidShape, span,
            format!("cannot dereference non-pointer type '{ty}'"));
          return Err(Aborted);
        };
        Ok((v, pointee.clone(), false))
      }
      ExprKind::Field(base, fname) => {
        let (addr, fty, konst) = self.lower_field_addr(base, fname, span)?;
        Ok((addr, fty, konst))
      }
      ExprKind::Index(base, index) => {
        let (addr, elem) = self.lower_index_addr(base, index, span)?;
        Ok((addr, elem, false))
      }
      _ => {
        self.cx.err(ErrorKind::InvalidShape, span,
          format!("invalid lhs operator '{}' in assignment", e.k.name()));
        Err(Aborted)
      }
    }
  }

  fn lower_assign(&mut self, lhs: &Expr, op: Option<AssignOp>, rhs: &Expr, span: Span) -> Res<()> {
    let (addr, ty, konst) = self.lower_place(lhs)?;
    if konst {
      if let ExprKind::Ident(name) = &lhs.k {
        self.cx.err(ErrorKind::ConstMutation, span,
          format!("assignment to a constant variable '{name}'"));
      } else {
        self.cx.err(ErrorKind::ConstMutation, span,
          "assignment to a constant variable".to_owned());
      }
      return Err(Aborted);
    }
    let (rty, mut rv) = self.lower_expr(rhs)?;
    if rty != ty {
      self.cx.err(ErrorKind::TypeMismatch, span, format!(
        "value type ({rty}) does not match variable type ({ty})"));
      return Err(Aborted);
    }
    if let Some(op) = op {
      let cur = self.load(ty.clone(), addr.clone());
      let bop = if ty.is_float() {
        match op {
          AssignOp::Add => BinOp::Fadd,
          AssignOp::Sub => BinOp::Fsub,
          AssignOp::Mul => BinOp::Fmul,
          AssignOp::Div => BinOp::Fdiv,
        }
      } else if ty.is_int() {
        match op {
          AssignOp::Add => BinOp::Add,
          AssignOp::Sub => BinOp::Sub,
          AssignOp::Mul => BinOp::Mul,
          AssignOp::Div => BinOp::Sdiv,
        }
      } else {
        self.cx.err(ErrorKind::TypeMismatch, span,
          format!("invalid operator in assignment to '{ty}'"));
        return Err(Aborted);
      };
      let v = self.emit(Inst::Bin { op: bop, ty: ty.clone(), lhs: cur.into(), rhs: rv });
      rv = v.into();
    }
    self.store(ty, rv, addr);
    Ok(())
  }

  fn lower_var(&mut self, v: &VarDecl, declared: &mut HashSet<String>) -> Res<()> {
    if !declared.insert(v.name.clone()) {
      self.cx.err(ErrorKind::InvalidShape, v.span,
        format!("local '{}' is already defined", v.name));
      return Err(Aborted);
    }
    let decl_ty = match &v.ty {
      Some(sp) => Some(self.cx.get_ty(sp, v.span)?),
      None => None,
    };
    debug!("emitting local '{}' of type '{}' (initialized = {})",
      v.name,
      decl_ty.as_ref().map_or("Unknown".to_owned(), |(t, _)| t.to_string()),
      v.init.is_some());

    let Some(init) = &v.init else {
      let Some((ty, konst)) = decl_ty else {
        self.cx.err(ErrorKind::InvalidShape, v.span, format!(
          "local '{}' has neither a type nor an initializer", v.name));
        return Err(Aborted);
      };
      let slot = self.alloca(ty.clone());
      self.locals.insert(v.name.clone(), Local { slot: Operand::Val(slot), ty, konst });
      return Ok(());
    };

    let (ity, ival) = self.lower_expr(init)?;

    // array initializers hand over their backing allocation
    if let TyKind::Array(ielem, in_) = &*ity {
      if decl_ty.as_ref().is_none_or(|(t, _)| *t == ity) {
        let konst = decl_ty.as_ref().is_some_and(|&(_, k)| k);
        if v.ty.is_none() {
          debug!("guessed type for variable '{}': {}", v.name, ity);
        }
        self.locals.insert(v.name.clone(), Local { slot: ival, ty: ity.clone(), konst });
        return Ok(());
      }
      if_chain! {
        if let Some((dty, konst)) = &decl_ty;
        if let TyKind::Array(delem, dn) = &**dty;
        if delem == ielem && dn == in_;
        then {
          // same shape spelled differently: copy elementwise into a
          // fresh allocation of the declared type
          let slot = self.alloca((*dty).clone());
          for i in 0..*dn {
            let src = self.gep_index(ival.clone(), ity.clone(), ir::int32(i64::from(i)));
            let val = self.load(delem.clone(), src);
            let dst = self.gep_index(slot, (*dty).clone(), ir::int32(i64::from(i)));
            self.store(delem.clone(), val, dst);
          }
          self.locals.insert(v.name.clone(),
            Local { slot: Operand::Val(slot), ty: (*dty).clone(), konst: *konst });
          return Ok(());
        }
      }
      let (dty, _) = decl_ty.expect("checked");
      self.cx.err(ErrorKind::TypeMismatch, v.span, format!(
        "variable value type ({ity}) is incompatible with variable type ({dty})"));
      return Err(Aborted);
    }

    let (ty, konst, val) = match decl_ty {
      None => {
        debug!("guessed type for variable '{}': {}", v.name, ity);
        (ity.clone(), false, ival)
      }
      Some((dty, konst)) => {
        let Some(val) = self.coerce(&dty, &ity, ival) else {
          self.cx.err(ErrorKind::TypeMismatch, v.span, format!(
            "variable value type ({ity}) is incompatible with variable type ({dty})"));
          return Err(Aborted);
        };
        (dty, konst, val)
      }
    };
    let slot = self.alloca(ty.clone());
    let bound_to_this = matches!(&init.k, ExprKind::Ident(n) if n == "this");
    if ty.as_object().is_some() && !bound_to_this {
      self.retain(val.clone(), &ty);
      self.owned.push(Owned { name: v.name.clone(), slot: Operand::Val(slot), ty: ty.clone() });
    }
    self.store(ty.clone(), val, slot);
    self.locals.insert(v.name.clone(), Local { slot: Operand::Val(slot), ty, konst });
    Ok(())
  }

  fn lower_return(&mut self, val: Option<&Expr>, span: Span) -> Res<()> {
    self.returned = true;
    let moved = val.and_then(|e| match &e.k {
      ExprKind::Ident(n) if self.owned.iter().any(|o| o.name == *n) => Some(n.clone()),
      _ => None,
    });

    if self.ret_inferred {
      self.ret_inferred = false;
      match val {
        Some(e) => {
          let (ty, v) = self.lower_expr(e)?;
          debug!("guessed return type for function '{}': {}", self.func.name, ty);
          self.func.ret = ty;
          self.release_for_return(moved.as_deref());
          self.terminate(Term::Ret(Some(v)));
        }
        None => {
          self.func.ret = prim::void();
          self.release_for_return(None);
          self.terminate(Term::Ret(None));
        }
      }
      return Ok(());
    }

    let expected = self.func.ret.clone();
    match val {
      Some(e) => {
        let (ty, v) = self.lower_expr(e)?;
        let v = match self.coerce(&expected, &ty, v.clone()) {
          Some(v) => v,
          None => {
            self.cx.err(ErrorKind::TypeMismatch, span, format!(
              "return value ({ty}) is incompatible with function return type ({expected})"));
            v
          }
        };
        self.release_for_return(moved.as_deref());
        self.terminate(Term::Ret(Some(v)));
      }
      None => {
        if *expected != TyKind::Void {
          self.cx.err(ErrorKind::TypeMismatch, span, format!(
            "return value (void) is incompatible with function return type ({expected})"));
        }
        self.release_for_return(None);
        self.terminate(Term::Ret(None));
      }
    }
    Ok(())
  }

  fn lower_if(&mut self, cond: &Expr, then: &[Stmt], elifs: &[(Expr, Vec<Stmt>)],
    els: Option<&[Stmt]>) -> Res<()> {
    let merge = self.new_block("endif");
    let mut arms: Vec<(&Expr, &[Stmt])> = vec![(cond, then)];
    for (c, body) in elifs { arms.push((c, body)) }

    for (i, &(c, body)) in arms.iter().enumerate() {
      let cv = self.lower_cond(c)?;
      let then_bb = self.new_block("then");
      let last = i + 1 == arms.len();
      let next = if !last {
        self.new_block("elseif")
      } else if els.is_some() {
        self.new_block("else")
      } else {
        merge
      };
      self.terminate(Term::CondBr(cv, then_bb, next));
      self.block = then_bb;
      let terminated = self.lower_block(body, "then");
      if !terminated { self.terminate(Term::Br(merge)) }
      self.block = next;
    }
    if let Some(body) = els {
      let terminated = self.lower_block(body, "else");
      if !terminated { self.terminate(Term::Br(merge)) }
      self.block = merge;
    }
    Ok(())
  }

  fn lower_while(&mut self, cond: &Expr, body: &[Stmt]) -> Res<()> {
    let cond_bb = self.new_block("loop.cond");
    let body_bb = self.new_block("loop.body");
    let merge_bb = self.new_block("loop.merge");

    self.terminate(Term::Br(cond_bb));
    self.block = cond_bb;
    let cv = self.lower_cond(cond)?;
    self.terminate(Term::CondBr(cv, body_bb, merge_bb));

    let (old_brk, old_cont, old_mark) = (self.brk, self.cont, self.loop_mark);
    self.brk = Some(merge_bb);
    self.cont = Some(cond_bb);
    self.loop_mark = self.owned.len();

    self.block = body_bb;
    let terminated = self.lower_block(body, "loop.body");
    if !terminated { self.terminate(Term::Br(cond_bb)) }

    self.brk = old_brk;
    self.cont = old_cont;
    self.loop_mark = old_mark;
    self.block = merge_bb;
    Ok(())
  }

  fn lower_for(&mut self, vars: &[VarDecl], cond: &Expr, steps: &[Stmt], body: &[Stmt])
    -> Res<()> {
    let saved_locals = self.locals.clone();
    let scope_start = self.owned.len();
    let mut declared = HashSet::new();
    for v in vars {
      let _ = self.lower_var(v, &mut declared);
    }

    let cond_bb = self.new_block("loop.cond");
    let body_bb = self.new_block("loop.body");
    let merge_bb = self.new_block("merge");

    self.terminate(Term::Br(cond_bb));
    self.block = cond_bb;
    let cv = self.lower_cond(cond)?;
    self.terminate(Term::CondBr(cv, body_bb, merge_bb));

    let (old_brk, old_cont, old_mark) = (self.brk, self.cont, self.loop_mark);
    self.brk = Some(merge_bb);
    self.cont = Some(cond_bb);
    self.loop_mark = self.owned.len();

    self.block = body_bb;
    let terminated = self.lower_block(body, "loop.body");
    if !terminated {
      for step in steps {
        let _ = self.lower_stmt(step, &mut HashSet::new());
      }
      self.terminate(Term::Br(cond_bb));
    }

    self.brk = old_brk;
    self.cont = old_cont;
    self.loop_mark = old_mark;
    self.block = merge_bb;
    self.release_range(scope_start);
    self.owned.truncate(scope_start);
    self.locals = saved_locals;
    Ok(())
  }

  /// Lower one statement. Returns `true` if it terminated the block.
  fn lower_stmt(&mut self, stmt: &Stmt, declared: &mut HashSet<String>) -> Res<bool> {
    let span = stmt.span;
    match &stmt.k {
      StmtKind::Return(val) => {
        self.lower_return(val.as_ref(), span)?;
        Ok(true)
      }
      StmtKind::Expr(e) => {
        match &e.k {
          ExprKind::Call(_) | ExprKind::MethodCall { .. } => {
            self.lower_expr(e)?;
          }
          ExprKind::New(..) => {
            // a discarded construction is released immediately, like a
            // C++ temporary
            let (ty, v) = self.lower_expr(e)?;
            self.release(v, &ty);
          }
          _ => {
            self.cx.err(ErrorKind::InvalidShape, span,
              format!("invalid statement '{}' in block", e.k.name()));
            return Err(Aborted);
          }
        }
        Ok(false)
      }
      StmtKind::Var(v) => {
        self.lower_var(v, declared)?;
        Ok(false)
      }
      StmtKind::Assign { lhs, op, rhs } => {
        self.lower_assign(lhs, *op, rhs, span)?;
        Ok(false)
      }
      StmtKind::If { cond, then, elifs, els } => {
        self.lower_if(cond, then, elifs, els.as_deref())?;
        Ok(false)
      }
      StmtKind::While { cond, body } => {
        self.lower_while(cond, body)?;
        Ok(false)
      }
      StmtKind::For { vars, cond, steps, body } => {
        self.lower_for(vars, cond, steps, body)?;
        Ok(false)
      }
      StmtKind::Break => {
        let Some(brk) = self.brk else {
          self.cx.err(ErrorKind::InvalidShape, span, "break outside of a loop".to_owned());
          return Err(Aborted);
        };
        self.release_range(self.loop_mark);
        self.terminate(Term::Br(brk));
        Ok(true)
      }
      StmtKind::Continue => {
        let Some(cont) = self.cont else {
          self.cx.err(ErrorKind::InvalidShape, span, "continue outside of a loop".to_owned());
          return Err(Aborted);
        };
        self.release_range(self.loop_mark);
        self.terminate(Term::Br(cont));
        Ok(true)
      }
    }
  }

  /// Lower a statement list as one scope. Returns `true` if the block
  /// was terminated (by return/break/continue); otherwise the scope's
  /// owned locals are released at the natural end.
  pub fn lower_block(&mut self, stmts: &[Stmt], name: &str) -> bool {
    let saved_locals = self.locals.clone();
    let scope_start = self.owned.len();
    let mut declared = HashSet::new();
    let mut terminated = false;
    for stmt in stmts {
      match self.lower_stmt(stmt, &mut declared) {
        Ok(true) => {
          terminated = true;
          break;
        }
        Ok(false) | Err(Aborted) => {}
      }
    }
    if !terminated {
      self.release_range(scope_start);
    }
    trace!("leaving block '{}:{}' ({} local(s))",
      self.func.name, name, self.locals.len() - saved_locals.len());
    self.owned.truncate(scope_start);
    self.locals = saved_locals;
    terminated
  }

  /// Finish a plain function body: close the fall-through path, check
  /// the missing-return rule, and write the function back.
  pub fn finish_body(mut self, span: Span) {
    if !self.is_terminated() {
      if self.ret_inferred || *self.func.ret == TyKind::Void {
        if self.ret_inferred {
          self.func.ret = prim::void();
        }
        self.release_for_return(None);
        self.terminate(Term::Ret(None));
      } else if self.returned {
        // the tail block is unreachable (every arm above returned), but
        // the IR requires a terminator
        let z = Operand::Const(Const::Zero(self.func.ret.clone()));
        self.terminate(Term::Ret(Some(z)));
      } else {
        self.cx.err(ErrorKind::InvalidShape, span,
          "missing return statement in non-void function".to_owned());
      }
    } else if !self.returned && *self.func.ret != TyKind::Void && !self.ret_inferred {
      // terminated by break/continue misuse; still no return seen
      self.cx.err(ErrorKind::InvalidShape, span,
        "missing return statement in non-void function".to_owned());
    }
    self.finish();
  }
}

/// Lower a top-level function definition.
pub(crate) fn lower_function(cx: &mut Cx<'_>, node: &FuncDef) {
  debug!("entering function '{} {:?} func {}(...)' ({} arguments)",
    if node.storage == Storage::Public { "public" } else { "private" },
    node.conv, node.name, node.params.len());

  if cx.ir.func_by_name(&node.name).is_some() {
    cx.err(ErrorKind::InvalidShape, node.span,
      format!("function '{}' is already defined", node.name));
    return;
  }

  let ret_inferred = node.ret.is_none();
  let mut ret = prim::void();
  if let Some(sp) = &node.ret {
    match cx.get_ty(sp, node.span) {
      Ok((t, _)) => ret = t,
      Err(Aborted) => return,
    }
  }
  let mut params = Vec::with_capacity(node.params.len());
  let mut names = Vec::with_capacity(node.params.len());
  for p in &node.params {
    match cx.get_ty(&p.ty, node.span) {
      Ok((t, konst)) => {
        params.push(t);
        names.push((p.name.clone(), konst));
      }
      Err(Aborted) => return,
    }
  }

  let f = Function {
    name: node.name.clone(),
    conv: node.conv.into(),
    linkage: if node.storage == Storage::Private { Linkage::Private } else { Linkage::Public },
    params,
    ret,
    vararg: node.vararg,
    blocks: Default::default(),
    insts: Default::default(),
  };
  let fid = cx.ir.add_func(f);
  let mut ctx = LowerCtx::new(cx, fid, ret_inferred);
  ctx.enter_params(&names, None);
  ctx.lower_block(&node.body, "entry");
  ctx.finish_body(node.span);
}

/// Declare a top-level external function under its plain name.
pub(crate) fn lower_function_import(cx: &mut Cx<'_>, node: &ast::FuncImport) {
  let Ok((ret, _)) = cx.get_ty(&node.ret, node.span) else { return };
  let mut params = Vec::with_capacity(node.params.len());
  for p in &node.params {
    match cx.get_ty(&p.ty, node.span) {
      Ok((t, _)) => params.push(t),
      Err(Aborted) => return,
    }
  }
  let sig = FnTy { params: params.into(), ret, vararg: node.vararg };
  cx.ir.extern_func(&node.name, &sig, node.conv.into());
}

/// Lower a global variable definition with a constant initializer.
pub(crate) fn lower_global(cx: &mut Cx<'_>, node: &GlobalDef) {
  if cx.ir.global_by_name(&node.name).is_some() {
    cx.err(ErrorKind::InvalidShape, node.span,
      format!("global '{}' is already defined", node.name));
    return;
  }
  let Ok((ty, konst)) = cx.get_ty(&node.ty, node.span) else { return };
  let init = match &node.init {
    None => None,
    Some(e) => match const_value(cx, e) {
      Err(Aborted) => return,
      Ok((ity, c)) => match adapt_const(&ty, &ity, c) {
        Some(c) => Some(c),
        None => {
          cx.err(ErrorKind::TypeMismatch, node.span, format!(
            "global initializer type ({ity}) is incompatible with variable type ({ty})"));
          return;
        }
      },
    },
  };
  cx.ir.add_global(ir::Global {
    name: node.name.clone(),
    ty,
    linkage: if node.storage == Storage::Private { Linkage::Private } else { Linkage::Public },
    konst,
    init,
  });
}

/// Evaluate a constant expression for a global initializer.
fn const_value(cx: &mut Cx<'_>, e: &Expr) -> Res<(Ty, Const)> {
  match &e.k {
    &ExprKind::Int(n) => Ok((prim::i32(), Const::Int(prim::i32(), n))),
    &ExprKind::Float(x) => Ok((prim::f32(), Const::F32(x))),
    &ExprKind::Double(x) => Ok((prim::f64(), Const::F64(x))),
    &ExprKind::Char(c) => Ok((prim::i8(), Const::Int(prim::i8(), i64::from(c)))),
    &ExprKind::Bool(b) => Ok((prim::i1(), Const::Int(prim::i1(), i64::from(b)))),
    ExprKind::Str(s) => {
      let g = cx.intern_string(s);
      Ok((prim::pi8(), Const::GlobalAddr(g)))
    }
    ExprKind::Array(elems) => {
      if elems.is_empty() {
        cx.err(ErrorKind::InvalidShape, e.span, "can't create an empty array".to_owned());
        return Err(Aborted);
      }
      let mut vals = Vec::with_capacity(elems.len());
      let mut elem_ty: Option<Ty> = None;
      for el in elems {
        let (ty, c) = const_value(cx, el)?;
        if let Some(expected) = &elem_ty {
          if *expected != ty {
            cx.err(ErrorKind::TypeMismatch, el.span, format!(
              "invalid element type: expected '{expected}', got '{ty}'"));
            return Err(Aborted);
          }
        } else {
          elem_ty = Some(ty);
        }
        vals.push(c);
      }
      let elem_ty = elem_ty.expect("nonempty");
      let n = u32::try_from(vals.len()).expect("overflow");
      Ok((Rc::new(TyKind::Array(elem_ty.clone(), n)), Const::Array(elem_ty, vals)))
    }
    _ => {
      cx.err(ErrorKind::InvalidShape, e.span, format!(
        "'{}' can not be a constant expression", e.k.name()));
      Err(Aborted)
    }
  }
}

/// Adapt a constant to a declared type where that is possible without
/// emitting code: integer width changes and pointer reinterpretation.
fn adapt_const(expected: &Ty, got: &Ty, c: Const) -> Option<Const> {
  if expected == got { return Some(c) }
  match (&**expected, &c) {
    (_, Const::Int(_, n)) if expected.int_bits().is_some() =>
      Some(Const::Int(expected.clone(), *n)),
    (TyKind::Ptr(_), Const::GlobalAddr(_)) | (TyKind::Ptr(_), Const::Null(_)) if got.is_pointer() =>
      Some(c),
    _ => None,
  }
}
