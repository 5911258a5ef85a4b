//! MSVC-compatible symbol decoration for constructors, destructors,
//! methods, and vtables, so the emitted objects link the way Microsoft
//! tooling expects.

use std::fmt::Write;

use crate::types::ty::{Ty, TyKind};

/// The single-type code: `X` void, `_N` bool, `C` char, `H` int,
/// `_J` long, `D` float, `N` double, `PE<T>` pointer. Types with no
/// decoration of their own (identified structs in argument position)
/// fall back to `?`.
#[must_use] pub fn type_code(ty: &TyKind) -> String {
  match ty {
    TyKind::Void => "X".into(),
    TyKind::I1 => "_N".into(),
    TyKind::I8 => "C".into(),
    TyKind::I32 => "H".into(),
    TyKind::I64 => "_J".into(),
    TyKind::F32 => "D".into(),
    TyKind::F64 => "N".into(),
    TyKind::Ptr(t) => format!("PE{}", type_code(t)),
    TyKind::Array(t, _) => format!("PE{}", type_code(t)),
    TyKind::Struct(_) | TyKind::Fn(_) => "?".into(),
  }
}

/// The argument-list code: each argument's type code in order, then the
/// `@Z` terminator. An empty list is just `@Z`.
#[must_use] pub fn args_code(params: &[Ty]) -> String {
  let mut out = String::new();
  for p in params {
    out.push_str(&type_code(p));
  }
  out.push_str("@Z");
  out
}

/// The constructor symbol: `??0<Class>@@QEAA@<argcodes>@Z`, with the
/// argument codes excluding `this`.
#[must_use] pub fn ctor(class: &str, params: &[Ty]) -> String {
  let mut s = format!("??0{class}@@QEAA@");
  s.push_str(&args_code(params));
  s
}

/// The destructor symbol: `??1<Class>@@QEAA@XZ`. Destructors never take
/// user arguments.
#[must_use] pub fn dtor(class: &str) -> String {
  format!("??1{class}@@QEAA@XZ")
}

/// The vtable symbol: `??_7<Class>@@6B@`.
#[must_use] pub fn vtable(class: &str) -> String {
  format!("??_7{class}@@6B@")
}

/// A method symbol: `?<Name>@<Class>@@QEAA<RetCode><argcodes>@Z`, with
/// the argument codes excluding `this`.
#[must_use] pub fn method(class: &str, name: &str, ret: &TyKind, params: &[Ty]) -> String {
  let mut s = String::new();
  write!(s, "?{name}@{class}@@QEAA{}", type_code(ret)).expect("infallible");
  s.push_str(&args_code(params));
  s
}

/// The symbol of a function imported from module `m`: `_<m>__<name>`,
/// nesting as `_a___b__f` for `a::b::f`.
#[must_use] pub fn scoped(scope: &[String], name: &str) -> String {
  let mut s = String::new();
  for m in scope {
    write!(s, "_{m}__").expect("infallible");
  }
  s.push_str(name);
  s
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::ty::prim;

  #[test]
  fn pair_ctor_dtor() {
    assert_eq!(ctor("Pair", &[prim::i32(), prim::i32()]), "??0Pair@@QEAA@HH@Z");
    assert_eq!(dtor("Pair"), "??1Pair@@QEAA@XZ");
    assert_eq!(vtable("Pair"), "??_7Pair@@6B@");
  }

  #[test]
  fn empty_args_encode_as_terminator_only() {
    assert_eq!(ctor("Counter", &[]), "??0Counter@@QEAA@@Z");
    assert_eq!(method("Counter", "inc", &TyKind::Void, &[]), "?inc@Counter@@QEAAX@Z");
  }

  #[test]
  fn pointer_codes_nest() {
    assert_eq!(type_code(&*prim::ptr(prim::pi8())), "PEPEC");
    assert_eq!(type_code(&*prim::i64()), "_J");
    assert_eq!(type_code(&*prim::i1()), "_N");
  }

  #[test]
  fn scoped_names() {
    assert_eq!(scoped(&["stdio".into()], "puts"), "_stdio__puts");
    assert_eq!(scoped(&["a".into(), "b".into()], "f"), "_a___b__f");
    assert_eq!(scoped(&[], "main"), "main");
  }
}
