//! Object codegen: for each declared object this pass materializes the
//! instance struct `{ vtable*, i32 refcount, fields… }` and the vtable
//! struct `{ dtor, methods… }`, synthesizes the constructor and
//! destructor skeletons, splices the user's `.ctor`/`.dtor` bodies into
//! them, and emits every method as a plain function taking `this`.
//!
//! The constructor and destructor reference each other (the vtable
//! written by the constructor holds the destructor), so both are
//! declared before any body is lowered; the method pointers are written
//! into the vtable by constructor code appended after all methods
//! exist.

use log::debug;
use std::rc::Rc;

use crate::build_ir::{Cx, LowerCtx};
use crate::mangle;
use crate::types::ast::{FuncDef, ObjectDef, ObjectImportDef, Storage};
use crate::types::entity::{FieldInfo, MethodInfo, ObjectInfo};
use crate::types::ir::{
  self, BinOp, Callee, CastKind, Const, FuncId, Function, Inst, IntCC, Linkage, Operand, Term,
};
use crate::types::ty::{FnTy, TyKind, prim};
use crate::ErrorKind;
use smallvec::SmallVec;

/// Register an object type name ahead of its definition, so bodies and
/// signatures anywhere in the unit can spell it. Idempotent.
pub(crate) fn predeclare(cx: &mut Cx<'_>, name: &str) {
  cx.ir.ident_struct(name);
  cx.types.register(name, prim::ptr(prim::strukt(name)));
}

struct Layout {
  fields: Vec<FieldInfo>,
  /// `(def, sig)` for every non-`.ctor`/`.dtor` method, slot order.
  method_sigs: Vec<(String, Storage, FnTy)>,
  ctor_params: Vec<(String, bool)>,
  ctor_sig: FnTy,
}

/// Resolve field and method types and set the struct and vtable bodies.
/// Returns `None` if a spelling failed (already diagnosed) or if the
/// object was defined twice.
fn build_layout(
  cx: &mut Cx<'_>, name: &str, span: crate::types::Span,
  fields: &[crate::types::ast::FieldDef],
  methods: impl Iterator<Item = (String, Storage, Option<String>, Vec<crate::types::ast::Param>, bool)>,
  ctor_args: &[crate::types::ast::Param],
) -> Option<Layout> {
  let sid = cx.ir.ident_struct(name);
  if cx.ir.structs[sid].body.is_some() {
    cx.err(ErrorKind::InvalidShape, span, format!("object '{name}' is already defined"));
    return None;
  }
  let vt_name = mangle::vtable(name);
  let vt_sid = cx.ir.ident_struct(&vt_name);
  let this_ty = prim::ptr(prim::strukt(name));

  let mut finfos = vec![];
  for f in fields {
    let (ty, konst) = cx.get_ty(&f.ty, f.span).ok()?;
    finfos.push(FieldInfo { name: f.name.clone(), storage: f.storage, ty, konst });
  }

  let mut method_sigs = vec![];
  for (mname, storage, ret, params, vararg) in methods {
    let ret = match ret {
      Some(sp) => cx.get_ty(&sp, span).ok()?.0,
      None => prim::void(),
    };
    let mut ps = vec![this_ty.clone()];
    for p in &params {
      ps.push(cx.get_ty(&p.ty, span).ok()?.0);
    }
    method_sigs.push((mname, storage, FnTy { params: ps.into(), ret, vararg }));
  }

  let mut ctor_params = vec![];
  let mut ctor_ps = vec![];
  for p in ctor_args {
    let (ty, konst) = cx.get_ty(&p.ty, span).ok()?;
    ctor_ps.push(ty);
    ctor_params.push((p.name.clone(), konst));
  }
  let ctor_sig = FnTy { params: ctor_ps.into(), ret: this_ty.clone(), vararg: false };

  // vtable: destructor at slot 0, then the methods in declaration order
  let dtor_slot = prim::fn_ptr(Box::new([this_ty.clone()]), prim::void(), false);
  let mut vt_body = vec![dtor_slot];
  for (_, _, sig) in &method_sigs {
    vt_body.push(prim::ptr(Rc::new(TyKind::Fn(sig.clone()))));
  }
  cx.ir.set_struct_body(vt_sid, vt_body.into());

  // instance: vtable pointer, refcount, then the fields
  let mut body = vec![prim::ptr(prim::strukt(&vt_name)), prim::i32()];
  body.extend(finfos.iter().map(|f| f.ty.clone()));
  cx.ir.set_struct_body(sid, body.into());

  Some(Layout { fields: finfos, method_sigs, ctor_params, ctor_sig })
}

/// Lower an object definition.
pub(crate) fn lower_object(cx: &mut Cx<'_>, node: &ObjectDef) {
  let name = &node.name;
  predeclare(cx, name);
  let vt_name = mangle::vtable(name);
  let this_ty = prim::ptr(prim::strukt(name));

  let ctor_node = node.methods.iter().find(|m| m.name == ".ctor");
  let dtor_node = node.methods.iter().find(|m| m.name == ".dtor");
  let user_methods: Vec<&FuncDef> =
    node.methods.iter().filter(|m| !m.name.starts_with('.')).collect();

  let Some(layout) = build_layout(
    cx, name, node.span, &node.fields,
    user_methods.iter().map(|m| {
      (m.name.clone(), m.storage, m.ret.clone(), m.params.clone(), m.vararg)
    }),
    ctor_node.map_or(&[][..], |c| &c.params),
  ) else { return };

  let sizeof = cx.ir.sizeof(&TyKind::Struct(name.clone()), cx.word());
  let vt_size = cx.ir.sizeof(&TyKind::Struct(vt_name.clone()), cx.word());
  debug!("creating object '{name}' ({sizeof} bytes, vtable: {vt_size} bytes), \
    {} method(s), {} field(s)", node.methods.len(), node.fields.len());

  let vtable = cx.ir.add_global(ir::Global {
    name: vt_name.clone(),
    ty: prim::strukt(&vt_name),
    linkage: Linkage::Internal,
    konst: false,
    init: None,
  });

  let dtor_sig = FnTy { params: Box::new([this_ty.clone()]), ret: prim::void(), vararg: false };
  let dtor = cx.ir.add_func(Function::decl(mangle::dtor(name), &dtor_sig, ir::CConv::C));
  let ctor = cx.ir.add_func(Function::decl(
    mangle::ctor(name, &layout.ctor_sig.params), &layout.ctor_sig, ir::CConv::C));

  let sid = cx.ir.struct_by_name(name).expect("registered");
  let vt_sid = cx.ir.struct_by_name(&vt_name).expect("registered");
  cx.ents.objects.insert(name.clone(), ObjectInfo {
    name: name.clone(),
    struct_id: sid,
    vtable_struct: vt_sid,
    vtable: Some(vtable),
    ctor,
    dtor: Some(dtor),
    ty: this_ty.clone(),
    fields: layout.fields,
    methods: layout.method_sigs.iter().enumerate().map(|(i, (mname, storage, sig))| {
      MethodInfo {
        name: mname.clone(),
        storage: *storage,
        slot: u32::try_from(i).expect("overflow") + 1,
        sig: sig.clone(),
        func: None,
      }
    }).collect(),
  });

  // constructor prologue: allocate, zero the refcount, wire the vtable.
  // The parameters are homed first, while the argument registers are
  // still live.
  let alloc = cx.allocator();
  let alloc_sig = cx.ir.funcs[alloc].sig();
  let mut ctx = LowerCtx::new(cx, ctor, false);
  ctx.cur_object = Some(name.clone());
  ctx.enter_params(&layout.ctor_params, None);
  let raw = ctx.emit(Inst::Call {
    f: Callee::Func(alloc),
    sig: alloc_sig,
    conv: ir::CConv::C,
    args: SmallVec::from_iter([Operand::Const(Const::Int(prim::i32(), i64::from(sizeof)))]),
  });
  let this = ctx.emit(Inst::Cast {
    kind: CastKind::Bitcast,
    from: prim::pi8(),
    to: this_ty.clone(),
    arg: raw.into(),
  });
  let refcount = ctx.gep_field(this, name, 1);
  ctx.store(prim::i32(), ir::int32(0), refcount);
  let dtor_slot = ctx.gep_field(Operand::Global(vtable), &vt_name, 0);
  let dtor_slot_ty = ctx.cx.ir.field_ty(&vt_name, 0);
  ctx.store(dtor_slot_ty, Operand::Func(dtor), dtor_slot);
  let vt_slot = ctx.gep_field(this, name, 0);
  ctx.store(prim::ptr(prim::strukt(&vt_name)), Operand::Global(vtable), vt_slot);
  ctx.bind_this_value(this_ty.clone(), this.into());
  if let Some(body) = ctor_node {
    ctx.lower_block(&body.body, "entry");
    if ctx.returned {
      ctx.cx.err(ErrorKind::InvalidShape, body.span, "constructor can not return".to_owned());
    }
  }
  if !ctx.is_terminated() { ctx.release_params() }
  let ctor_tail = ctx.block;
  ctx.finish();

  // destructor: decrement, and free (after the user body) at zero
  lower_dtor(cx, name, dtor, dtor_node);

  // methods are ordinary functions with `this` prepended
  let mut method_funcs = vec![];
  for (i, m) in user_methods.iter().enumerate() {
    let (_, storage, sig) = &layout.method_sigs[i];
    let mut f = Function::decl(mangle::method(name, &m.name, &sig.ret, &sig.params[1..]),
      sig, m.conv.into());
    f.linkage = if *storage == Storage::Private { Linkage::Private } else { Linkage::Public };
    let fid = cx.ir.add_func(f);
    method_funcs.push(fid);

    let mut names = vec![("this".to_owned(), false)];
    names.extend(m.params.iter().map(|p| {
      let konst = cx.types.get(&p.ty).map(|t| t.1).unwrap_or(false);
      (p.name.clone(), konst)
    }));
    let mut ctx = LowerCtx::new(cx, fid, false);
    ctx.cur_object = Some(name.clone());
    ctx.enter_params(&names, Some(0));
    ctx.lower_block(&m.body, "entry");
    ctx.finish_body(m.span);
  }
  for (i, fid) in method_funcs.iter().enumerate() {
    let obj = cx.ents.objects.get_mut(name).expect("registered");
    obj.methods[i].func = Some(*fid);
  }

  // back in the constructor: populate the vtable and return this
  let mut ctx = LowerCtx::new(cx, ctor, false);
  ctx.block = ctor_tail;
  if ctx.func.blocks[ctor_tail].term.is_none() {
    for (i, fid) in method_funcs.iter().enumerate() {
      let slot = u32::try_from(i).expect("overflow") + 1;
      let p = ctx.gep_field(Operand::Global(vtable), &vt_name, slot);
      let slot_ty = ctx.cx.ir.field_ty(&vt_name, slot);
      ctx.store(slot_ty, Operand::Func(*fid), p);
    }
    ctx.terminate(Term::Ret(Some(this.into())));
  }
  ctx.finish();
}

/// Emit the destructor skeleton: decrement the refcount, and when it
/// reaches zero run the user `.dtor` body (if any) and then free the
/// allocation. Virtual calls always come through vtable slot 0, so this
/// is the only place an object dies.
fn lower_dtor(cx: &mut Cx<'_>, name: &str, dtor: FuncId, dtor_node: Option<&FuncDef>) {
  let this_ty = prim::ptr(prim::strukt(name));
  let free = cx.deallocator();
  let free_sig = cx.ir.funcs[free].sig();

  let mut ctx = LowerCtx::new(cx, dtor, false);
  ctx.cur_object = Some(name.to_owned());
  ctx.enter_params(&[("this".to_owned(), false)], Some(0));
  let this = Operand::Arg(0);
  let pp = ctx.gep_field(this.clone(), name, 1);
  let n = ctx.load(prim::i32(), pp);
  let n1 = ctx.emit(Inst::Bin {
    op: BinOp::Sub,
    ty: prim::i32(),
    lhs: n.into(),
    rhs: ir::int32(1),
  });
  ctx.store(prim::i32(), n1, pp);
  let dead = ctx.emit(Inst::Icmp {
    cc: IntCC::Le,
    ty: prim::i32(),
    lhs: n1.into(),
    rhs: ir::int32(0),
  });
  let usercode = ctx.new_block("usercode");
  let merge = ctx.new_block("endif");
  ctx.terminate(Term::CondBr(dead.into(), usercode, merge));

  ctx.block = usercode;
  if let Some(body) = dtor_node {
    ctx.lower_block(&body.body, "usercode");
    if ctx.returned {
      ctx.cx.err(ErrorKind::InvalidShape, body.span, "deconstructor can not return".to_owned());
    }
  }
  if !ctx.is_terminated() {
    let this_val = ctx.load_this();
    let raw = ctx.emit(Inst::Cast {
      kind: CastKind::Bitcast,
      from: this_ty,
      to: prim::pi8(),
      arg: this_val,
    });
    ctx.emit(Inst::Call {
      f: Callee::Func(free),
      sig: free_sig,
      conv: ir::CConv::C,
      args: SmallVec::from_iter([Operand::Val(raw)]),
    });
    ctx.terminate(Term::Br(merge));
  }

  ctx.block = merge;
  ctx.terminate(Term::Ret(None));
  ctx.finish();
}

/// Lower an external object declaration: opaque layout plus the method
/// slot table, mirroring the local protocol, and a declaration of the
/// defining module's constructor.
pub(crate) fn lower_object_import(cx: &mut Cx<'_>, node: &ObjectImportDef) {
  let name = &node.name;
  predeclare(cx, name);
  let sid = cx.ir.ident_struct(name);
  if cx.ir.structs[sid].body.is_some() {
    // already materialized by an earlier import of the same module
    return;
  }
  let this_ty = prim::ptr(prim::strukt(name));

  let ctor_node = node.methods.iter().find(|m| m.name == ".ctor");
  let user_methods: Vec<_> = node.methods.iter().filter(|m| !m.name.starts_with('.')).collect();

  let Some(layout) = build_layout(
    cx, name, node.span, &node.fields,
    user_methods.iter().map(|m| {
      (m.name.clone(), m.storage, Some(m.ret.clone()), m.params.clone(), m.vararg)
    }),
    ctor_node.map_or(&[][..], |c| &c.params),
  ) else { return };

  debug!("importing object '{name}': {} method(s), {} field(s)",
    node.methods.len(), node.fields.len());

  let ctor = cx.ir.extern_func(
    &mangle::ctor(name, &layout.ctor_sig.params), &layout.ctor_sig, ir::CConv::C);

  let vt_sid = cx.ir.struct_by_name(&mangle::vtable(name)).expect("registered");
  cx.ents.objects.insert(name.clone(), ObjectInfo {
    name: name.clone(),
    struct_id: sid,
    vtable_struct: vt_sid,
    vtable: None,
    ctor,
    dtor: None,
    ty: this_ty,
    fields: layout.fields,
    methods: layout.method_sigs.iter().enumerate().map(|(i, (mname, storage, sig))| {
      MethodInfo {
        name: mname.clone(),
        storage: *storage,
        slot: u32::try_from(i).expect("overflow") + 1,
        sig: sig.clone(),
        func: None,
      }
    }).collect(),
  });
}
