//! The parse tree handed to the compiler by the (external) parser.
//!
//! Type references are carried as unresolved spellings so the tree does
//! not depend on any compiler state; the lowering passes resolve them
//! through [`TypeTable::get`](super::ty::TypeTable::get).

use super::{Span, Spanned};

/// An unresolved type spelling, e.g. `"const char*"` or `"int[4]"`.
pub type TypeExpr = String;

/// The storage class of a declaration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Storage {
  /// Visible to other translation units.
  Public,
  /// Local to this translation unit (or, for members, to the owning object).
  Private,
}

/// A source calling convention.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Conv {
  /// `__cdecl`: all arguments pushed right-to-left, caller cleans.
  Cdecl,
  /// `__fastcall`: register arguments, caller-reserved shadow space on x64.
  Fastcall,
  /// `__stdcall`: pushed right-to-left, callee cleans (x86 only).
  Stdcall,
}

/// A complete translation unit.
#[derive(Clone, Debug)]
pub struct Module {
  /// The module name, used for diagnostics and import prefixes.
  pub name: String,
  /// The ordered top-level declarations.
  pub body: Vec<Item>,
}

/// A top-level declaration.
#[derive(Clone, Debug)]
pub enum Item {
  /// A function definition.
  Function(FuncDef),
  /// An external function declaration.
  FunctionImport(FuncImport),
  /// A module import: `using "name";`.
  Using(Spanned<String>),
  /// A global variable definition.
  Global(GlobalDef),
  /// An object definition.
  Object(ObjectDef),
  /// An external object declaration.
  ObjectImport(ObjectImportDef),
  /// A macro definition. Macros are substituted by the parser and never
  /// reach the compiler core; the variant exists so imported files
  /// containing one can be rejected as non-importable.
  Macro(Spanned<String>),
}

/// A named, typed parameter.
#[derive(Clone, Debug)]
pub struct Param {
  /// The parameter name.
  pub name: String,
  /// The parameter type spelling.
  pub ty: TypeExpr,
}

/// A function definition, also used for object methods. The special
/// method names `.ctor` and `.dtor` mark the constructor and destructor
/// bodies of an object.
#[derive(Clone, Debug)]
pub struct FuncDef {
  /// The storage class.
  pub storage: Storage,
  /// The calling convention.
  pub conv: Conv,
  /// The function name.
  pub name: String,
  /// The return type, or `None` if it is to be inferred from the first
  /// `return` statement.
  pub ret: Option<TypeExpr>,
  /// The fixed parameters.
  pub params: Vec<Param>,
  /// True if the function accepts additional untyped arguments.
  pub vararg: bool,
  /// The body statements.
  pub body: Vec<Stmt>,
  /// The source position of the definition.
  pub span: Span,
}

/// An external function declaration.
#[derive(Clone, Debug)]
pub struct FuncImport {
  /// The calling convention.
  pub conv: Conv,
  /// The function name.
  pub name: String,
  /// The return type spelling.
  pub ret: TypeExpr,
  /// The fixed parameters.
  pub params: Vec<Param>,
  /// True if the function accepts additional untyped arguments.
  pub vararg: bool,
  /// The source position of the declaration.
  pub span: Span,
}

/// A global variable definition.
#[derive(Clone, Debug)]
pub struct GlobalDef {
  /// The storage class.
  pub storage: Storage,
  /// The variable name.
  pub name: String,
  /// The variable type spelling.
  pub ty: TypeExpr,
  /// The initializer, which must be a constant expression.
  pub init: Option<Expr>,
  /// The source position of the definition.
  pub span: Span,
}

/// A field in an object body.
#[derive(Clone, Debug)]
pub struct FieldDef {
  /// The storage class; `private` fields are inaccessible outside the object.
  pub storage: Storage,
  /// The field name.
  pub name: String,
  /// The field type spelling.
  pub ty: TypeExpr,
  /// The source position of the field.
  pub span: Span,
}

/// An object definition.
#[derive(Clone, Debug)]
pub struct ObjectDef {
  /// The object name.
  pub name: String,
  /// The fields, in declaration order.
  pub fields: Vec<FieldDef>,
  /// The methods, in declaration order, including `.ctor`/`.dtor` if present.
  pub methods: Vec<FuncDef>,
  /// The source position of the definition.
  pub span: Span,
}

/// An external object declaration: the layout and method protocol of an
/// object compiled in another module.
#[derive(Clone, Debug)]
pub struct ObjectImportDef {
  /// The object name.
  pub name: String,
  /// The fields, in declaration order.
  pub fields: Vec<FieldDef>,
  /// The method signatures, in declaration order.
  pub methods: Vec<MethodImport>,
  /// The source position of the declaration.
  pub span: Span,
}

/// A method signature inside an [`ObjectImportDef`]. `this` is implicit.
#[derive(Clone, Debug)]
pub struct MethodImport {
  /// The storage class.
  pub storage: Storage,
  /// The calling convention.
  pub conv: Conv,
  /// The method name (`.ctor` for the constructor).
  pub name: String,
  /// The return type spelling.
  pub ret: TypeExpr,
  /// The fixed parameters, excluding `this`.
  pub params: Vec<Param>,
  /// True if the method accepts additional untyped arguments.
  pub vararg: bool,
  /// The source position of the declaration.
  pub span: Span,
}

/// A statement.
pub type Stmt = Spanned<StmtKind>;

/// A local variable declaration.
#[derive(Clone, Debug)]
pub struct VarDecl {
  /// The variable name.
  pub name: String,
  /// The declared type, or `None` to take the initializer's type.
  pub ty: Option<TypeExpr>,
  /// The initializer.
  pub init: Option<Expr>,
  /// The source position of the declaration.
  pub span: Span,
}

/// A compound assignment operator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AssignOp {
  /// `+=`
  Add,
  /// `-=`
  Sub,
  /// `*=`
  Mul,
  /// `/=`
  Div,
}

/// The payload of a statement.
#[derive(Clone, Debug)]
pub enum StmtKind {
  /// `return;` or `return e;`
  Return(Option<Expr>),
  /// A call, method call, or `new` whose result is discarded.
  Expr(Expr),
  /// A local variable declaration.
  Var(VarDecl),
  /// A plain or compound assignment.
  Assign {
    /// The assigned place.
    lhs: Expr,
    /// The compound operator, if any.
    op: Option<AssignOp>,
    /// The assigned value.
    rhs: Expr,
  },
  /// An `if`/`else if`/`else` cascade.
  If {
    /// The first condition.
    cond: Expr,
    /// The first arm.
    then: Vec<Stmt>,
    /// The `else if` arms.
    elifs: Vec<(Expr, Vec<Stmt>)>,
    /// The `else` arm.
    els: Option<Vec<Stmt>>,
  },
  /// A `while` loop.
  While {
    /// The loop condition.
    cond: Expr,
    /// The loop body.
    body: Vec<Stmt>,
  },
  /// A `for` loop.
  For {
    /// The loop-scoped variable declarations.
    vars: Vec<VarDecl>,
    /// The loop condition.
    cond: Expr,
    /// The step assignments, re-emitted at the end of every iteration.
    steps: Vec<Stmt>,
    /// The loop body.
    body: Vec<Stmt>,
  },
  /// Jump to the current loop's merge block.
  Break,
  /// Jump to the current loop's condition block.
  Continue,
}

/// An expression.
pub type Expr = Spanned<ExprKind>;

/// A binary operator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Binop {
  /// `+`
  Add,
  /// `-`
  Sub,
  /// `*`
  Mul,
  /// `/` (signed division)
  Div,
  /// `==`
  Eq,
  /// `!=`
  Ne,
  /// `<`
  Lt,
  /// `<=`
  Le,
  /// `>`
  Gt,
  /// `>=`
  Ge,
  /// logical `and`
  And,
  /// logical `or`
  Or,
}

impl Binop {
  /// The operator's source spelling, for diagnostics.
  #[must_use] pub fn name(self) -> &'static str {
    match self {
      Binop::Add => "+",
      Binop::Sub => "-",
      Binop::Mul => "*",
      Binop::Div => "/",
      Binop::Eq => "==",
      Binop::Ne => "!=",
      Binop::Lt => "<",
      Binop::Le => "<=",
      Binop::Gt => ">",
      Binop::Ge => ">=",
      Binop::And => "and",
      Binop::Or => "or",
    }
  }

  /// True for the six comparison operators.
  #[must_use] pub fn is_cmp(self) -> bool {
    matches!(self, Binop::Eq | Binop::Ne | Binop::Lt | Binop::Le | Binop::Gt | Binop::Ge)
  }
}

/// An unscoped or scoped function call.
#[derive(Clone, Debug)]
pub struct Call {
  /// The qualifying module scopes, outermost first; empty for a direct call.
  pub scope: Vec<String>,
  /// The callee name.
  pub name: String,
  /// The actual arguments.
  pub args: Vec<Expr>,
}

/// The payload of an expression.
#[derive(Clone, Debug)]
pub enum ExprKind {
  /// An integer literal (type `int`).
  Int(i64),
  /// A `float` literal.
  Float(f32),
  /// A `double` literal.
  Double(f64),
  /// A character literal (type `char`).
  Char(u8),
  /// A boolean literal.
  Bool(bool),
  /// A string literal; yields a `char*` to an interned constant.
  Str(String),
  /// A reference to a local, parameter, `this`, global, or function.
  Ident(String),
  /// A binary operation.
  Binop(Binop, Box<Expr>, Box<Expr>),
  /// Logical negation.
  Not(Box<Expr>),
  /// An explicit cast to a spelled type.
  Cast(TypeExpr, Box<Expr>),
  /// Array indexing: `a[i]`.
  Index(Box<Expr>, Box<Expr>),
  /// Object field access: `o.f` (or `p->f` with a [`ExprKind::Deref`] base).
  Field(Box<Expr>, String),
  /// An array literal.
  Array(Vec<Expr>),
  /// Object construction: `new O(args)`.
  New(String, Vec<Expr>),
  /// A function call.
  Call(Call),
  /// A virtual method call: `o.m(args)`.
  MethodCall {
    /// The receiver object expression.
    recv: Box<Expr>,
    /// The method name.
    name: String,
    /// The actual arguments, excluding `this`.
    args: Vec<Expr>,
  },
  /// Address-of: `&x` for a local, global, or function.
  Ref(String),
  /// Pointer load: `*p`.
  Deref(Box<Expr>),
}

impl ExprKind {
  /// A short node name for diagnostics.
  #[must_use] pub fn name(&self) -> &'static str {
    match self {
      ExprKind::Int(_) => "Int",
      ExprKind::Float(_) => "Float",
      ExprKind::Double(_) => "Double",
      ExprKind::Char(_) => "Char",
      ExprKind::Bool(_) => "Bool",
      ExprKind::Str(_) => "String",
      ExprKind::Ident(_) => "Identifier",
      ExprKind::Binop(op, ..) => op.name(),
      ExprKind::Not(_) => "Not",
      ExprKind::Cast(..) => "Cast",
      ExprKind::Index(..) => "Index",
      ExprKind::Field(..) => "Field",
      ExprKind::Array(_) => "Array",
      ExprKind::New(..) => "New",
      ExprKind::Call(_) => "Call",
      ExprKind::MethodCall { .. } => "MethodCall",
      ExprKind::Ref(_) => "Reference",
      ExprKind::Deref(_) => "Dereference",
    }
  }
}
