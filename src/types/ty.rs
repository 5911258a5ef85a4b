//! The surface type system: scalar base types, pointers, arrays, and
//! named object types, plus the spelling parser used everywhere a type
//! is written in source.
//!
//! Type spellings parse in a fixed order: a `const` qualifier, trailing
//! pointer stars, the base identifier, and optional array dimensions.
//! Array dimensions apply innermost-first and pointer stars outermost,
//! so `int[2][3]*` is a pointer to a 2-array of 3-arrays of `int`.

use std::fmt;
use std::rc::Rc;

use hashbrown::HashMap;

/// A reference-counted type. Types are compared structurally.
pub type Ty = Rc<TyKind>;

/// A function signature, used for vtable slots and indirect calls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FnTy {
  /// The argument types, in order. For methods this includes `this`.
  pub params: Box<[Ty]>,
  /// The return type.
  pub ret: Ty,
  /// True if the function accepts additional untyped arguments.
  pub vararg: bool,
}

/// The type of a value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TyKind {
  /// The void type, only valid as a return type.
  Void,
  /// The boolean type, a 1-bit integer.
  I1,
  /// 8 bit signed integers (`char`).
  I8,
  /// 32 bit signed integers (`int`).
  I32,
  /// 64 bit signed integers (`long`).
  I64,
  /// IEEE-754 single precision (`float`).
  F32,
  /// IEEE-754 double precision (`double`).
  F64,
  /// A pointer to a value of the inner type.
  Ptr(Ty),
  /// An array of `N` values of the inner type.
  Array(Ty, u32),
  /// A named identified struct, declared in the IR module. Object types
  /// register their instance type as a pointer to one of these.
  Struct(String),
  /// A function type; only ever used behind [`TyKind::Ptr`].
  Fn(FnTy),
}

impl TyKind {
  /// True if this is a pointer type.
  #[must_use] pub fn is_pointer(&self) -> bool { matches!(self, TyKind::Ptr(_)) }

  /// The pointee of a pointer type, if it is one.
  #[must_use] pub fn pointee(&self) -> Option<&Ty> {
    if let TyKind::Ptr(t) = self { Some(t) } else { None }
  }

  /// True for the signed integer types (including `bool`).
  #[must_use] pub fn is_int(&self) -> bool {
    matches!(self, TyKind::I1 | TyKind::I8 | TyKind::I32 | TyKind::I64)
  }

  /// The bit width of an integer type.
  #[must_use] pub fn int_bits(&self) -> Option<u32> {
    match self {
      TyKind::I1 => Some(1),
      TyKind::I8 => Some(8),
      TyKind::I32 => Some(32),
      TyKind::I64 => Some(64),
      _ => None,
    }
  }

  /// True for `float` and `double`.
  #[must_use] pub fn is_float(&self) -> bool { matches!(self, TyKind::F32 | TyKind::F64) }

  /// If this is a pointer to a named struct (an object instance type),
  /// the name of the object.
  #[must_use] pub fn as_object(&self) -> Option<&str> {
    if let TyKind::Ptr(t) = self {
      if let TyKind::Struct(name) = &**t { return Some(name) }
    }
    None
  }
}

impl fmt::Display for TyKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TyKind::Void => write!(f, "void"),
      TyKind::I1 => write!(f, "bool"),
      TyKind::I8 => write!(f, "char"),
      TyKind::I32 => write!(f, "int"),
      TyKind::I64 => write!(f, "long"),
      TyKind::F32 => write!(f, "float"),
      TyKind::F64 => write!(f, "double"),
      // an object name is registered as a pointer to its struct, so the
      // instance type spells as the bare name
      TyKind::Ptr(t) if matches!(&**t, TyKind::Struct(_)) => write!(f, "{t}"),
      TyKind::Ptr(t) => write!(f, "{t}*"),
      TyKind::Array(..) => {
        // dimensions print outermost-first, matching the spelling order
        let mut t = self;
        let mut dims = vec![];
        while let TyKind::Array(inner, n) = t {
          dims.push(*n);
          t = &**inner;
        }
        write!(f, "{t}")?;
        for n in dims {
          write!(f, "[{n}]")?;
        }
        Ok(())
      }
      TyKind::Struct(name) => write!(f, "{name}"),
      TyKind::Fn(sig) => {
        write!(f, "{}(", sig.ret)?;
        for (i, a) in sig.params.iter().enumerate() {
          if i != 0 { write!(f, ", ")? }
          write!(f, "{a}")?;
        }
        if sig.vararg { write!(f, ", ...")? }
        write!(f, ")")
      }
    }
  }
}

/// An error from the type spelling parser.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeError {
  /// The base identifier does not name a registered type.
  Unknown(String),
  /// An array dimension was written as `[]`.
  MissingDimension,
  /// The spelling has no base identifier at all.
  Empty,
}

impl fmt::Display for TypeError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TypeError::Unknown(name) => write!(f, "unknown type '{name}'"),
      TypeError::MissingDimension => write!(f, "array size not specified"),
      TypeError::Empty => write!(f, "empty type spelling"),
    }
  }
}

/// The per-invocation table of named types. Seeded with the scalar base
/// types; object declarations register their instance pointer type as
/// they are discovered. There is no process-wide state: a fresh compiler
/// invocation starts from a fresh table.
#[derive(Debug)]
pub struct TypeTable {
  names: HashMap<String, Ty>,
}

impl Default for TypeTable {
  fn default() -> Self { Self::new() }
}

impl TypeTable {
  /// Construct a table holding the built-in scalar types.
  #[must_use] pub fn new() -> Self {
    let mut names = HashMap::new();
    for (name, ty) in [
      ("int", TyKind::I32),
      ("float", TyKind::F32),
      ("double", TyKind::F64),
      ("char", TyKind::I8),
      ("void", TyKind::Void),
      ("bool", TyKind::I1),
      ("long", TyKind::I64),
    ] {
      names.insert(name.to_owned(), Rc::new(ty));
    }
    names.insert("string".to_owned(), Rc::new(TyKind::Ptr(Rc::new(TyKind::I8))));
    Self { names }
  }

  /// Register a named type. Re-registration with the same body is
  /// idempotent; object pre-declaration relies on this.
  pub fn register(&mut self, name: &str, ty: Ty) {
    self.names.entry(name.to_owned()).or_insert(ty);
  }

  /// Look up a registered name without parsing a full spelling.
  #[must_use] pub fn lookup(&self, name: &str) -> Option<&Ty> { self.names.get(name) }

  /// Parse a type spelling into a `(type, is_const)` pair.
  pub fn get(&self, spelling: &str) -> Result<(Ty, bool), TypeError> {
    let konst = spelling.contains("const");
    let stripped = spelling.replace("const", "");
    let nptr = stripped.chars().filter(|&c| c == '*').count();
    let stripped = stripped.replace('*', "");
    let s = stripped.trim();

    let base_end = s
      .char_indices()
      .find(|&(i, c)| !(c.is_ascii_alphanumeric() || c == '_') || (i == 0 && c.is_ascii_digit()))
      .map_or(s.len(), |(i, _)| i);
    let basename = &s[..base_end];
    if basename.is_empty() { return Err(TypeError::Empty) }
    let rest = s[base_end..].trim();

    let mut ty = self
      .names
      .get(basename)
      .ok_or_else(|| TypeError::Unknown(basename.to_owned()))?
      .clone();

    // a pointer to void is really a pointer to bytes
    if *ty == TyKind::Void && nptr > 0 { ty = Rc::new(TyKind::I8) }

    let mut dims = vec![];
    let mut it = rest.chars().peekable();
    while let Some(c) = it.next() {
      if c != '[' { continue }
      let mut digits = String::new();
      for c in it.by_ref() {
        if c == ']' { break }
        if c.is_ascii_digit() { digits.push(c) }
      }
      if digits.is_empty() { return Err(TypeError::MissingDimension) }
      dims.push(digits.parse::<u32>().map_err(|_| TypeError::MissingDimension)?);
    }
    for &dim in dims.iter().rev() {
      ty = Rc::new(TyKind::Array(ty, dim));
    }

    for _ in 0..nptr {
      ty = Rc::new(TyKind::Ptr(ty));
    }
    Ok((ty, konst))
  }
}

/// Convenience constructors for the common scalar types.
pub mod prim {
  use super::{FnTy, Ty, TyKind};
  use std::rc::Rc;

  /// The `void` type.
  #[must_use] pub fn void() -> Ty { Rc::new(TyKind::Void) }
  /// The `bool` type.
  #[must_use] pub fn i1() -> Ty { Rc::new(TyKind::I1) }
  /// The `char` type.
  #[must_use] pub fn i8() -> Ty { Rc::new(TyKind::I8) }
  /// The `int` type.
  #[must_use] pub fn i32() -> Ty { Rc::new(TyKind::I32) }
  /// The `long` type.
  #[must_use] pub fn i64() -> Ty { Rc::new(TyKind::I64) }
  /// The `float` type.
  #[must_use] pub fn f32() -> Ty { Rc::new(TyKind::F32) }
  /// The `double` type.
  #[must_use] pub fn f64() -> Ty { Rc::new(TyKind::F64) }
  /// A pointer to `t`.
  #[must_use] pub fn ptr(t: Ty) -> Ty { Rc::new(TyKind::Ptr(t)) }
  /// A `char*`.
  #[must_use] pub fn pi8() -> Ty { ptr(i8()) }
  /// A named struct reference.
  #[must_use] pub fn strukt(name: &str) -> Ty { Rc::new(TyKind::Struct(name.to_owned())) }
  /// A pointer to a function with the given signature.
  #[must_use] pub fn fn_ptr(params: Box<[Ty]>, ret: Ty, vararg: bool) -> Ty {
    ptr(Rc::new(TyKind::Fn(FnTy { params, ret, vararg })))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn scalar_spellings() {
    let t = TypeTable::new();
    assert_eq!(t.get("int").unwrap(), (prim::i32(), false));
    assert_eq!(t.get("long").unwrap(), (prim::i64(), false));
    assert_eq!(t.get("const char").unwrap(), (prim::i8(), true));
    assert_eq!(t.get("bool").unwrap(), (prim::i1(), false));
  }

  #[test]
  fn void_pointer_is_byte_pointer() {
    let t = TypeTable::new();
    assert_eq!(t.get("void*").unwrap(), (prim::pi8(), false));
    assert_eq!(t.get("void").unwrap().0, prim::void());
  }

  #[test]
  fn arrays_innermost_first_pointers_outermost() {
    let t = TypeTable::new();
    let (ty, _) = t.get("int[2][3]*").unwrap();
    // pointer to a 2-array of 3-arrays of int
    let TyKind::Ptr(inner) = &*ty else { panic!("expected pointer") };
    let TyKind::Array(inner, 2) = &**inner else { panic!("expected [2]") };
    let TyKind::Array(inner, 3) = &**inner else { panic!("expected [3]") };
    assert_eq!(**inner, TyKind::I32);
  }

  #[test]
  fn spelling_round_trip() {
    let t = TypeTable::new();
    for s in ["int", "char*", "long[4]", "double", "bool*", "int[2][3]", "float*"] {
      let (ty, konst) = t.get(s).unwrap();
      let respelled = ty.to_string();
      assert_eq!(t.get(&respelled).unwrap(), (ty, konst), "round trip of {s} via {respelled}");
    }
    // void* normalizes to char* and is stable from there on
    let (ty, _) = t.get("void*").unwrap();
    assert_eq!(t.get(&ty.to_string()).unwrap().0, ty);
  }

  #[test]
  fn errors() {
    let t = TypeTable::new();
    assert_eq!(t.get("intt"), Err(TypeError::Unknown("intt".into())));
    assert_eq!(t.get("int[]"), Err(TypeError::MissingDimension));
    assert_eq!(t.get(""), Err(TypeError::Empty));
  }

  #[test]
  fn registration_is_idempotent() {
    let mut t = TypeTable::new();
    let obj = prim::ptr(prim::strukt("Pair"));
    t.register("Pair", obj.clone());
    t.register("Pair", prim::i32());
    assert_eq!(t.get("Pair").unwrap().0, obj);
  }
}
