//! Tea compiler core: semantic analysis and code generation from a
//! parsed AST to a PE/COFF relocatable object for 32-bit or 64-bit x86
//! under the Microsoft ABI.
//!
//! The pipeline, in dependency order: the [type system](types::ty)
//! resolves spellings; [`build_ir`] lowers statements and expressions
//! into the [IR](types::ir), inserting reference-count operations at
//! binding, entry, and exit points; [`build_object`] synthesizes
//! constructors, destructors, and vtables; [`build_vcode`] selects
//! x86 instructions per function; [`codegen`] assembles the object
//! file. The lexer/parser and the CLI live outside this crate; imports
//! are fed back through [`ParseImport`].

use std::fmt;
use std::path::PathBuf;

use log::{debug, trace};

mod arch;
mod build_ir;
mod build_object;
mod build_vcode;
mod codegen;
pub mod import;
pub mod mangle;
pub mod types;

pub use import::{NoImports, ParseImport};
pub use types::Span;

use build_ir::Cx;
use types::ast::{Item, Module};
use types::ty::TypeTable;

/// The compilation target.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Target {
  /// `x86_64-pc-windows-msvc`.
  X64,
  /// `i386-pc-windows-msvc`.
  X86,
}

impl Target {
  /// The pointer size in bytes.
  #[must_use] pub fn word(self) -> u32 {
    match self {
      Target::X64 => 8,
      Target::X86 => 4,
    }
  }

  /// True for the 64-bit target.
  #[must_use] pub fn x64(self) -> bool { self == Target::X64 }

  /// The LLVM-style target triple.
  #[must_use] pub fn triple(self) -> &'static str {
    match self {
      Target::X64 => "x86_64-pc-windows-msvc",
      Target::X86 => "i386-pc-windows-msvc",
    }
  }
}

/// Compiler configuration. The defaults match the CLI's defaults: the
/// 64-bit target, the `_mem__alloc`/`_mem__free` allocator pair, and
/// the `stdlib` and current directories on the import path.
#[derive(Clone, Debug)]
pub struct CompilerConfig {
  /// The compilation target.
  pub target: Target,
  /// The symbol of the object allocator, `i8*(i32)`.
  pub allocator: String,
  /// The symbol of the object deallocator, `void(i8*)`.
  pub deallocator: String,
  /// Directories searched for `<name>.tea` / `<name>.json` imports.
  pub module_paths: Vec<PathBuf>,
}

impl Default for CompilerConfig {
  fn default() -> Self {
    Self {
      target: Target::X64,
      allocator: "_mem__alloc".to_owned(),
      deallocator: "_mem__free".to_owned(),
      module_paths: vec![PathBuf::from("stdlib"), PathBuf::from(".")],
    }
  }
}

/// The category of a diagnostic.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
  /// A parse failure reported by the external parser.
  Parse,
  /// Undefined function, identifier, scope, field, or method.
  Unresolved,
  /// Incompatible types at an assignment, argument, return, comparison,
  /// or indexing position.
  TypeMismatch,
  /// Access to a `private` member from non-owning code.
  Storage,
  /// Assignment to a `const` binding.
  ConstMutation,
  /// Wrong number of call arguments.
  Arity,
  /// A structurally invalid construct (return in a constructor, missing
  /// return, empty array literal, and the like).
  InvalidShape,
  /// A failed module import.
  Import,
  /// A failure in the machine backend or object writer.
  Backend,
}

/// One accumulated diagnostic.
#[derive(Clone, Debug)]
pub struct Diag {
  /// The category.
  pub kind: ErrorKind,
  /// The message.
  pub msg: String,
  /// The source position, if known.
  pub span: Option<Span>,
}

impl fmt::Display for Diag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.span {
      Some(span) => write!(f, "{}. {span}", self.msg),
      None => write!(f, "{}", self.msg),
    }
  }
}

/// Every diagnostic accumulated over one translation unit.
#[derive(Clone, Debug, Default)]
pub struct Diags(pub Vec<Diag>);

impl fmt::Display for Diags {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "{} error(s):", self.0.len())?;
    for (i, d) in self.0.iter().enumerate() {
      writeln!(f, "({}) {d}", i + 1)?;
    }
    Ok(())
  }
}

impl std::error::Error for Diags {}

/// The compiler for one translation unit.
pub struct Compiler {
  config: CompilerConfig,
}

impl Compiler {
  /// Construct a compiler with the given configuration.
  #[must_use] pub fn new(config: CompilerConfig) -> Self { Self { config } }

  /// The active configuration.
  #[must_use] pub fn config(&self) -> &CompilerConfig { &self.config }

  /// Compile a parsed module to a COFF object. On any accumulated
  /// diagnostic no object is produced and the full list is returned.
  pub fn compile(&self, module: &Module, imports: &mut dyn ParseImport)
    -> Result<Vec<u8>, Diags> {
    debug!("compiling module '{}' for {}", module.name, self.config.target.triple());
    let mut table = TypeTable::new();
    let mut cx = Cx::new(&self.config, &mut table, &module.name);
    lower_module(&mut cx, module, imports);
    if !cx.diags.is_empty() {
      return Err(Diags(cx.diags));
    }

    let mut pcodes = vec![];
    for (fid, f) in cx.ir.funcs.enum_iter() {
      if f.is_decl() { continue }
      match build_vcode::build_pcode(&cx.ir, fid, self.config.target) {
        Ok(pc) => pcodes.push((fid, pc)),
        Err(msg) => {
          return Err(Diags(vec![Diag {
            kind: ErrorKind::Backend,
            msg: format!("in function '{}': {msg}", f.name),
            span: None,
          }]));
        }
      }
    }
    codegen::write_object(&cx.ir, &pcodes, self.config.target).map_err(|e| {
      Diags(vec![Diag {
        kind: ErrorKind::Backend,
        msg: format!("object write failure: {e}"),
        span: None,
      }])
    })
  }
}

/// Walk the top-level declarations in source order. Object type names
/// are pre-registered so signatures anywhere in the unit can spell any
/// object declared in it.
pub(crate) fn lower_module(cx: &mut Cx<'_>, module: &Module, imports: &mut dyn ParseImport) {
  for item in &module.body {
    match item {
      Item::Object(o) => build_object::predeclare(cx, &o.name),
      Item::ObjectImport(o) => build_object::predeclare(cx, &o.name),
      _ => {}
    }
  }
  for item in &module.body {
    match item {
      Item::Using(u) => import::resolve_using(cx, &u.k, u.span, imports),
      Item::Function(f) => build_ir::lower_function(cx, f),
      Item::FunctionImport(fi) => build_ir::lower_function_import(cx, fi),
      Item::Global(g) => build_ir::lower_global(cx, g),
      Item::Object(o) => build_object::lower_object(cx, o),
      Item::ObjectImport(o) => build_object::lower_object_import(cx, o),
      Item::Macro(m) => trace!("macro '{}' already substituted by the parser", m.k),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::Spanned;
  use crate::types::ast::*;
  use crate::types::ir::{Callee, Inst, Operand};

  fn e(k: ExprKind) -> Expr { Spanned::new(Span::default(), k) }
  fn boxed(k: ExprKind) -> Box<Expr> { Box::new(e(k)) }
  fn stmt(k: StmtKind) -> Stmt { Spanned::new(Span::default(), k) }

  fn func(storage: Storage, name: &str, params: &[(&str, &str)], ret: Option<&str>,
    body: Vec<Stmt>) -> FuncDef {
    FuncDef {
      storage,
      conv: Conv::Cdecl,
      name: name.to_owned(),
      ret: ret.map(str::to_owned),
      params: params.iter().map(|&(n, t)| Param { name: n.into(), ty: t.into() }).collect(),
      vararg: false,
      body,
      span: Span::default(),
    }
  }

  fn module(name: &str, body: Vec<Item>) -> Module {
    Module { name: name.to_owned(), body }
  }

  /// A parsed view of the symbol table of an emitted object.
  fn symbols(obj: &[u8]) -> Vec<(String, u32, i16, u8)> {
    let symtab = u32::from_le_bytes(obj[8..12].try_into().unwrap()) as usize;
    let n = u32::from_le_bytes(obj[12..16].try_into().unwrap()) as usize;
    let strtab = symtab + 18 * n;
    let mut out = vec![];
    for i in 0..n {
      let at = symtab + 18 * i;
      let name = if obj[at..at + 4] == [0, 0, 0, 0] {
        let off = strtab + u32::from_le_bytes(obj[at + 4..at + 8].try_into().unwrap()) as usize;
        let end = obj[off..].iter().position(|&b| b == 0).unwrap() + off;
        String::from_utf8_lossy(&obj[off..end]).into_owned()
      } else {
        let end = obj[at..at + 8].iter().position(|&b| b == 0).unwrap_or(8) + at;
        String::from_utf8_lossy(&obj[at..end]).into_owned()
      };
      let value = u32::from_le_bytes(obj[at + 8..at + 12].try_into().unwrap());
      let section = i16::from_le_bytes(obj[at + 12..at + 14].try_into().unwrap());
      let class = obj[at + 16];
      out.push((name, value, section, class));
    }
    out
  }

  fn compile(m: &Module) -> Vec<u8> {
    Compiler::new(CompilerConfig::default()).compile(m, &mut NoImports).unwrap()
  }

  fn analyze(m: &Module) -> (types::ir::Module, types::entity::Entities, Vec<Diag>) {
    let config = CompilerConfig::default();
    let mut table = TypeTable::new();
    let mut cx = Cx::new(&config, &mut table, &m.name);
    lower_module(&mut cx, m, &mut NoImports);
    (cx.ir, cx.ents, cx.diags)
  }

  #[test]
  fn public_add_function() {
    let m = module("t", vec![Item::Function(func(Storage::Public, "add",
      &[("a", "int"), ("b", "int")], Some("int"),
      vec![stmt(StmtKind::Return(Some(e(ExprKind::Binop(
        Binop::Add,
        boxed(ExprKind::Ident("a".into())),
        boxed(ExprKind::Ident("b".into())),
      )))))]))]);
    let obj = compile(&m);
    let syms = symbols(&obj);
    assert_eq!(syms.len(), 1);
    let (name, _, section, class) = &syms[0];
    assert_eq!(name, "add");
    assert_eq!(*section, 1);
    assert_eq!(*class, 2);
    // the text section is non-empty and ends in ret
    let text_size = u32::from_le_bytes(obj[28..32].try_into().unwrap());
    assert!(text_size > 0);
  }

  #[test]
  fn private_function_is_static() {
    let m = module("t", vec![Item::Function(func(Storage::Private, "two", &[], Some("int"),
      vec![stmt(StmtKind::Return(Some(e(ExprKind::Binop(
        Binop::Add,
        boxed(ExprKind::Int(1)),
        boxed(ExprKind::Int(1)),
      )))))]))]);
    let syms = symbols(&compile(&m));
    assert_eq!(syms[0].0, "two");
    assert_eq!(syms[0].3, 3);
  }

  #[test]
  fn pair_object_exports_mangled_ctor_and_dtor() {
    let ctor = FuncDef {
      storage: Storage::Public,
      conv: Conv::Cdecl,
      name: ".ctor".into(),
      ret: None,
      params: vec![
        Param { name: "a".into(), ty: "int".into() },
        Param { name: "b".into(), ty: "int".into() },
      ],
      vararg: false,
      body: vec![
        stmt(StmtKind::Assign {
          lhs: e(ExprKind::Field(boxed(ExprKind::Ident("this".into())), "x".into())),
          op: None,
          rhs: e(ExprKind::Ident("a".into())),
        }),
        stmt(StmtKind::Assign {
          lhs: e(ExprKind::Field(boxed(ExprKind::Ident("this".into())), "y".into())),
          op: None,
          rhs: e(ExprKind::Ident("b".into())),
        }),
      ],
      span: Span::default(),
    };
    let m = module("t", vec![Item::Object(ObjectDef {
      name: "Pair".into(),
      fields: vec![
        FieldDef { storage: Storage::Public, name: "x".into(), ty: "int".into(),
          span: Span::default() },
        FieldDef { storage: Storage::Public, name: "y".into(), ty: "int".into(),
          span: Span::default() },
      ],
      methods: vec![ctor],
      span: Span::default(),
    })]);
    let syms = symbols(&compile(&m));
    let names: Vec<&str> = syms.iter().map(|s| &*s.0).collect();
    assert!(names.contains(&"??0Pair@@QEAA@HH@Z"), "ctor missing from {names:?}");
    assert!(names.contains(&"??1Pair@@QEAA@XZ"), "dtor missing from {names:?}");
    assert!(names.contains(&"??_7Pair@@6B@"), "vtable missing from {names:?}");
  }

  #[test]
  fn pair_struct_layout() {
    let m = module("t", vec![Item::Object(ObjectDef {
      name: "Pair".into(),
      fields: vec![
        FieldDef { storage: Storage::Public, name: "x".into(), ty: "int".into(),
          span: Span::default() },
        FieldDef { storage: Storage::Public, name: "y".into(), ty: "int".into(),
          span: Span::default() },
      ],
      methods: vec![],
      span: Span::default(),
    })]);
    let (ir, ents, diags) = analyze(&m);
    assert!(diags.is_empty(), "{diags:?}");
    // sizeof(struct) = word + 4 + sum of field sizes
    assert_eq!(ir.sizeof(&types::ty::TyKind::Struct("Pair".into()), 8), 8 + 4 + 4 + 4);
    let obj = &ents.objects["Pair"];
    // vtable slot 0 is the destructor: the ctor stores its address there
    let ctor = &ir.funcs[obj.ctor];
    let stores_dtor = ctor.insts.iter().any(|i| matches!(i,
      Inst::Store { val: Operand::Func(f), .. } if Some(*f) == obj.dtor));
    assert!(stores_dtor, "constructor must write the destructor into the vtable");
  }

  #[test]
  fn while_loop_block_shape() {
    // func f(): void { var i: int = 0; while (i < 3) { i += 1; } return; }
    let body = vec![
      stmt(StmtKind::Var(VarDecl {
        name: "i".into(),
        ty: Some("int".into()),
        init: Some(e(ExprKind::Int(0))),
        span: Span::default(),
      })),
      stmt(StmtKind::While {
        cond: e(ExprKind::Binop(Binop::Lt, boxed(ExprKind::Ident("i".into())),
          boxed(ExprKind::Int(3)))),
        body: vec![stmt(StmtKind::Assign {
          lhs: e(ExprKind::Ident("i".into())),
          op: Some(AssignOp::Add),
          rhs: e(ExprKind::Int(1)),
        })],
      }),
      stmt(StmtKind::Return(None)),
    ];
    let m = module("t", vec![Item::Function(func(Storage::Public, "f", &[], Some("void"), body))]);
    let (ir, _, diags) = analyze(&m);
    assert!(diags.is_empty(), "{diags:?}");
    let f = &ir.funcs[ir.func_by_name("f").unwrap()];
    let names: Vec<&str> = f.blocks.iter().map(|b| &*b.name).collect();
    assert_eq!(names, ["entry", "loop.cond", "loop.body", "loop.merge"]);
  }

  #[test]
  fn string_literals_are_interned_by_content() {
    let body = vec![
      stmt(StmtKind::Var(VarDecl {
        name: "a".into(), ty: None,
        init: Some(e(ExprKind::Str("hi".into()))), span: Span::default(),
      })),
      stmt(StmtKind::Var(VarDecl {
        name: "b".into(), ty: None,
        init: Some(e(ExprKind::Str("hi".into()))), span: Span::default(),
      })),
      stmt(StmtKind::Var(VarDecl {
        name: "c".into(), ty: None,
        init: Some(e(ExprKind::Str("ho".into()))), span: Span::default(),
      })),
      stmt(StmtKind::Return(None)),
    ];
    let m = module("t", vec![Item::Function(func(Storage::Public, "f", &[], Some("void"), body))]);
    let (ir, _, diags) = analyze(&m);
    assert!(diags.is_empty(), "{diags:?}");
    let strings: Vec<_> = ir.globals.iter().filter(|g| {
      matches!(&g.init, Some(types::ir::Const::Bytes(_)))
    }).collect();
    assert_eq!(strings.len(), 2);
    assert!(strings.iter().all(|g| g.linkage == types::ir::Linkage::Internal && g.konst));
  }

  #[test]
  fn return_type_is_inferred_from_first_return() {
    let m = module("t", vec![Item::Function(func(Storage::Public, "g", &[], None,
      vec![stmt(StmtKind::Return(Some(e(ExprKind::Double(1.5)))))]))]);
    let (ir, _, diags) = analyze(&m);
    assert!(diags.is_empty(), "{diags:?}");
    let f = &ir.funcs[ir.func_by_name("g").unwrap()];
    assert_eq!(*f.ret, types::ty::TyKind::F64);
  }

  #[test]
  fn counter_releases_once_on_return() {
    // object Counter { public n: int; public func inc(): void { this.n += 1; } }
    let inc = func(Storage::Public, "inc", &[], Some("void"), vec![
      stmt(StmtKind::Assign {
        lhs: e(ExprKind::Field(boxed(ExprKind::Ident("this".into())), "n".into())),
        op: Some(AssignOp::Add),
        rhs: e(ExprKind::Int(1)),
      }),
      stmt(StmtKind::Return(None)),
    ]);
    let main = func(Storage::Public, "main", &[], Some("void"), vec![
      stmt(StmtKind::Var(VarDecl {
        name: "c".into(),
        ty: Some("Counter".into()),
        init: Some(e(ExprKind::New("Counter".into(), vec![]))),
        span: Span::default(),
      })),
      stmt(StmtKind::Expr(e(ExprKind::MethodCall {
        recv: boxed(ExprKind::Ident("c".into())),
        name: "inc".into(),
        args: vec![],
      }))),
      stmt(StmtKind::Expr(e(ExprKind::MethodCall {
        recv: boxed(ExprKind::Ident("c".into())),
        name: "inc".into(),
        args: vec![],
      }))),
      stmt(StmtKind::Return(None)),
    ]);
    let m = module("t", vec![
      Item::Object(ObjectDef {
        name: "Counter".into(),
        fields: vec![FieldDef { storage: Storage::Public, name: "n".into(), ty: "int".into(),
          span: Span::default() }],
        methods: vec![inc],
        span: Span::default(),
      }),
      Item::Function(main),
    ]);
    let (ir, _, diags) = analyze(&m);
    assert!(diags.is_empty(), "{diags:?}");
    let f = &ir.funcs[ir.func_by_name("main").unwrap()];
    // three virtual calls: two `inc` dispatches and exactly one release
    let virtual_calls = f.insts.iter().filter(|i| {
      matches!(i, Inst::Call { f: Callee::Ptr(_), .. })
    }).count();
    assert_eq!(virtual_calls, 3);
  }

  #[test]
  fn errors_accumulate_across_statements() {
    let body = vec![
      stmt(StmtKind::Expr(e(ExprKind::Call(Call {
        scope: vec![],
        name: "missing1".into(),
        args: vec![],
      })))),
      stmt(StmtKind::Expr(e(ExprKind::Call(Call {
        scope: vec![],
        name: "missing2".into(),
        args: vec![],
      })))),
      stmt(StmtKind::Return(None)),
    ];
    let m = module("t", vec![Item::Function(func(Storage::Public, "f", &[], Some("void"), body))]);
    let (_, _, diags) = analyze(&m);
    assert_eq!(diags.len(), 2);
    assert!(diags.iter().all(|d| d.kind == ErrorKind::Unresolved));
  }

  #[test]
  fn const_mutation_is_rejected() {
    let body = vec![
      stmt(StmtKind::Var(VarDecl {
        name: "x".into(),
        ty: Some("const int".into()),
        init: Some(e(ExprKind::Int(1))),
        span: Span::default(),
      })),
      stmt(StmtKind::Assign {
        lhs: e(ExprKind::Ident("x".into())),
        op: None,
        rhs: e(ExprKind::Int(2)),
      }),
      stmt(StmtKind::Return(None)),
    ];
    let m = module("t", vec![Item::Function(func(Storage::Public, "f", &[], Some("void"), body))]);
    let (_, _, diags) = analyze(&m);
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].kind, ErrorKind::ConstMutation);
  }

  #[test]
  fn missing_return_in_non_void_function() {
    let m = module("t", vec![Item::Function(func(Storage::Public, "f", &[], Some("int"),
      vec![]))]);
    let (_, _, diags) = analyze(&m);
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].kind, ErrorKind::InvalidShape);
  }

  #[test]
  fn private_field_access_from_outside_is_rejected() {
    let m = module("t", vec![
      Item::Object(ObjectDef {
        name: "Box".into(),
        fields: vec![FieldDef { storage: Storage::Private, name: "v".into(), ty: "int".into(),
          span: Span::default() }],
        methods: vec![],
        span: Span::default(),
      }),
      Item::Function(func(Storage::Public, "peek", &[("b", "Box")], Some("int"), vec![
        stmt(StmtKind::Return(Some(e(ExprKind::Field(
          boxed(ExprKind::Ident("b".into())), "v".into()))))),
      ])),
    ]);
    let (_, _, diags) = analyze(&m);
    assert!(diags.iter().any(|d| d.kind == ErrorKind::Storage), "{diags:?}");
  }
}
