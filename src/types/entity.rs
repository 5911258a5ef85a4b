//! Tables describing processed declarations: the layout and method
//! protocol of every object seen so far, and the tree of imported
//! modules consulted by scoped calls.

use hashbrown::HashMap;

use super::ast::Storage;
use super::ir::{CConv, FuncId, GlobalId, StructId};
use super::ty::{FnTy, Ty};

/// A field of an object, in declaration order. The struct slot of field
/// `i` is `2 + i`: slots 0 and 1 are reserved for the vtable pointer
/// and the reference count.
#[derive(Clone, Debug)]
pub struct FieldInfo {
  /// The field name.
  pub name: String,
  /// The storage class; `private` fields are only accessible from the
  /// owning object's methods.
  pub storage: Storage,
  /// The field type.
  pub ty: Ty,
  /// True if the field was declared `const`.
  pub konst: bool,
}

/// A method of an object. Slot 0 of the vtable is the destructor, so
/// user methods occupy slots `1..`.
#[derive(Clone, Debug)]
pub struct MethodInfo {
  /// The method name.
  pub name: String,
  /// The storage class.
  pub storage: Storage,
  /// The vtable slot.
  pub slot: u32,
  /// The full signature, with `this` as the first parameter.
  pub sig: FnTy,
  /// The emitted function, absent for imported objects.
  pub func: Option<FuncId>,
}

/// Everything known about a declared or imported object type.
#[derive(Clone, Debug)]
pub struct ObjectInfo {
  /// The object name.
  pub name: String,
  /// The identified struct holding the instance layout.
  pub struct_id: StructId,
  /// The identified struct holding the vtable layout.
  pub vtable_struct: StructId,
  /// The vtable global; absent for imported objects, whose vtable lives
  /// in the defining module.
  pub vtable: Option<GlobalId>,
  /// The synthesized (or imported) constructor.
  pub ctor: FuncId,
  /// The synthesized destructor; absent for imported objects, which are
  /// only ever destroyed through vtable slot 0.
  pub dtor: Option<FuncId>,
  /// The instance type, a pointer to the object struct.
  pub ty: Ty,
  /// The fields, in declaration order.
  pub fields: Vec<FieldInfo>,
  /// The methods, in vtable-slot order.
  pub methods: Vec<MethodInfo>,
}

impl ObjectInfo {
  /// Look up a field and its declaration position.
  #[must_use] pub fn field(&self, name: &str) -> Option<(u32, &FieldInfo)> {
    self.fields.iter().enumerate().find_map(|(i, f)| {
      (f.name == name).then(|| (u32::try_from(i).expect("overflow"), f))
    })
  }

  /// Look up a method by name.
  #[must_use] pub fn method(&self, name: &str) -> Option<&MethodInfo> {
    self.methods.iter().find(|m| m.name == name)
  }
}

/// A function exported by an imported module.
#[derive(Clone, Debug)]
pub struct ImportedFn {
  /// The symbol the linker will resolve, e.g. `_stdio__puts`.
  pub extern_name: String,
  /// The signature.
  pub sig: FnTy,
  /// The calling convention.
  pub conv: CConv,
}

/// A node in the tree of imported modules, addressed by scoped calls
/// like `a::b::f`.
#[derive(Clone, Debug, Default)]
pub struct ModuleTree {
  /// Nested module scopes.
  pub children: HashMap<String, ModuleTree>,
  /// Functions exported at this scope.
  pub funcs: HashMap<String, ImportedFn>,
}

impl ModuleTree {
  /// Walk a scope path from this node.
  #[must_use] pub fn walk(&self, scope: &[String]) -> Option<&ModuleTree> {
    let mut cur = self;
    for s in scope {
      cur = cur.children.get(s)?;
    }
    Some(cur)
  }

  /// Get or create the child scope with the given name.
  pub fn child_mut(&mut self, name: &str) -> &mut ModuleTree {
    self.children.entry(name.to_owned()).or_default()
  }
}

/// The full set of processed declarations for one compilation.
#[derive(Debug, Default)]
pub struct Entities {
  /// Object types by name, local and imported alike.
  pub objects: HashMap<String, ObjectInfo>,
  /// The root of the imported-module tree.
  pub modules: ModuleTree,
}

impl Entities {
  /// The object owning the given instance struct name, if registered.
  #[must_use] pub fn object(&self, name: &str) -> Option<&ObjectInfo> {
    self.objects.get(name)
  }
}
