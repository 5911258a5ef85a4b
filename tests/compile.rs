//! End-to-end scenarios: build a parse tree by hand, compile it to a
//! COFF object on disk, and check the emitted headers, symbols, and
//! relocations.

use std::fs;
use std::io::Write;

use pretty_assertions::assert_eq;

use teac::types::Spanned;
use teac::types::ast::*;
use teac::{Compiler, CompilerConfig, NoImports, Span, Target};

fn e(k: ExprKind) -> Expr { Spanned::new(Span::default(), k) }
fn stmt(k: StmtKind) -> Stmt { Spanned::new(Span::default(), k) }

fn module(name: &str, body: Vec<Item>) -> Module {
  Module { name: name.to_owned(), body }
}

struct Coff {
  bytes: Vec<u8>,
}

#[derive(Debug, PartialEq)]
struct Section {
  name: String,
  vsize: u32,
  raw_off: u32,
  reloc_off: u32,
  nrelocs: u16,
  flags: u32,
}

impl Coff {
  fn machine(&self) -> u16 { u16::from_le_bytes(self.bytes[0..2].try_into().unwrap()) }

  fn nsections(&self) -> u16 { u16::from_le_bytes(self.bytes[2..4].try_into().unwrap()) }

  fn section(&self, i: usize) -> Section {
    let at = 20 + 40 * i;
    let b = &self.bytes;
    let name_end = b[at..at + 8].iter().position(|&c| c == 0).unwrap_or(8) + at;
    Section {
      name: String::from_utf8_lossy(&b[at..name_end]).into_owned(),
      vsize: u32::from_le_bytes(b[at + 8..at + 12].try_into().unwrap()),
      raw_off: u32::from_le_bytes(b[at + 20..at + 24].try_into().unwrap()),
      reloc_off: u32::from_le_bytes(b[at + 24..at + 28].try_into().unwrap()),
      nrelocs: u16::from_le_bytes(b[at + 32..at + 34].try_into().unwrap()),
      flags: u32::from_le_bytes(b[at + 36..at + 40].try_into().unwrap()),
    }
  }

  /// `(name, value, section, class)` for every symbol.
  fn symbols(&self) -> Vec<(String, u32, i16, u8)> {
    let b = &self.bytes;
    let symtab = u32::from_le_bytes(b[8..12].try_into().unwrap()) as usize;
    let n = u32::from_le_bytes(b[12..16].try_into().unwrap()) as usize;
    let strtab = symtab + 18 * n;
    (0..n).map(|i| {
      let at = symtab + 18 * i;
      let name = if b[at..at + 4] == [0, 0, 0, 0] {
        let off = strtab + u32::from_le_bytes(b[at + 4..at + 8].try_into().unwrap()) as usize;
        let end = b[off..].iter().position(|&c| c == 0).unwrap() + off;
        String::from_utf8_lossy(&b[off..end]).into_owned()
      } else {
        let end = b[at..at + 8].iter().position(|&c| c == 0).unwrap_or(8) + at;
        String::from_utf8_lossy(&b[at..end]).into_owned()
      };
      (
        name,
        u32::from_le_bytes(b[at + 8..at + 12].try_into().unwrap()),
        i16::from_le_bytes(b[at + 12..at + 14].try_into().unwrap()),
        b[at + 16],
      )
    }).collect()
  }

  /// `(va, symbol index, type)` for the relocations of section `i`.
  fn relocs(&self, i: usize) -> Vec<(u32, u32, u16)> {
    let sec = self.section(i);
    let at = sec.reloc_off as usize;
    (0..sec.nrelocs as usize).map(|r| {
      let at = at + 10 * r;
      let b = &self.bytes;
      (
        u32::from_le_bytes(b[at..at + 4].try_into().unwrap()),
        u32::from_le_bytes(b[at + 4..at + 8].try_into().unwrap()),
        u16::from_le_bytes(b[at + 8..at + 10].try_into().unwrap()),
      )
    }).collect()
  }
}

fn compile_to_disk(m: &Module, config: CompilerConfig) -> Coff {
  let compiler = Compiler::new(config);
  let bytes = compiler.compile(m, &mut NoImports).expect("compilation failed");
  // round trip through a real file, as the CLI does
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join(format!("{}.o", m.name));
  fs::write(&path, &bytes).unwrap();
  Coff { bytes: fs::read(&path).unwrap() }
}

fn add_module() -> Module {
  module("add", vec![Item::Function(FuncDef {
    storage: Storage::Public,
    conv: Conv::Cdecl,
    name: "add".into(),
    ret: Some("int".into()),
    params: vec![
      Param { name: "a".into(), ty: "int".into() },
      Param { name: "b".into(), ty: "int".into() },
    ],
    vararg: false,
    body: vec![stmt(StmtKind::Return(Some(e(ExprKind::Binop(
      Binop::Add,
      Box::new(e(ExprKind::Ident("a".into()))),
      Box::new(e(ExprKind::Ident("b".into()))),
    )))))],
    span: Span::default(),
  })])
}

#[test]
fn add_emits_a_linkable_object() {
  let coff = compile_to_disk(&add_module(), CompilerConfig::default());
  assert_eq!(coff.machine(), 0x8664);
  assert_eq!(coff.nsections(), 1);
  let text = coff.section(0);
  assert_eq!(text.name, ".text");
  assert_eq!(text.flags, 0x6000_0020);
  assert!(text.vsize > 0);
  assert_eq!(text.nrelocs, 0);
  // one public symbol in section 1
  assert_eq!(coff.symbols(), vec![("add".to_owned(), 0, 1, 2)]);
  // the function body ends in leave; ret
  let code = &coff.bytes[text.raw_off as usize..(text.raw_off + text.vsize) as usize];
  assert_eq!(&code[code.len() - 2..], &[0xC9, 0xC3]);
}

#[test]
fn add_32_bit_variant() {
  let config = CompilerConfig { target: Target::X86, ..CompilerConfig::default() };
  let coff = compile_to_disk(&add_module(), config);
  assert_eq!(coff.machine(), 0x14C);
  assert_eq!(coff.symbols()[0].0, "add");
}

#[test]
fn scoped_call_declares_the_import_and_relocates_through_it() {
  // using stdio; func main(): int { stdio::puts("hi"); return 0; }
  let dir = tempfile::tempdir().unwrap();
  let mut f = fs::File::create(dir.path().join("stdio.json")).unwrap();
  write!(f, r#"{{
    "format": 2,
    "namespace": "stdio",
    "functions": {{
      "puts": {{"name": "_stdio__puts", "args": ["char*"], "return": "int", "vararg": false}}
    }}
  }}"#).unwrap();
  drop(f);

  let m = module("hi", vec![
    Item::Using(Spanned::new(Span::default(), "stdio".into())),
    Item::Function(FuncDef {
      storage: Storage::Public,
      conv: Conv::Cdecl,
      name: "main".into(),
      ret: Some("int".into()),
      params: vec![],
      vararg: false,
      body: vec![
        stmt(StmtKind::Expr(e(ExprKind::Call(Call {
          scope: vec!["stdio".into()],
          name: "puts".into(),
          args: vec![e(ExprKind::Str("hi".into()))],
        })))),
        stmt(StmtKind::Return(Some(e(ExprKind::Int(0))))),
      ],
      span: Span::default(),
    }),
  ]);
  let config = CompilerConfig {
    module_paths: vec![dir.path().to_path_buf()],
    ..CompilerConfig::default()
  };
  let coff = compile_to_disk(&m, config);

  let syms = coff.symbols();
  let puts = syms.iter().position(|s| s.0 == "_stdio__puts").expect("extern declared");
  // undefined external: section 0, class 2
  assert_eq!((syms[puts].2, syms[puts].3), (0, 2));
  // the interned "hi" constant is a static in .rdata
  let hi = syms.iter().find(|s| s.0 == "aHi").expect("interned string");
  assert_eq!(hi.3, 3);

  // the call site relocates against the import with REL32 (type 4)
  let text_relocs = coff.relocs(0);
  assert!(
    text_relocs.iter().any(|&(_, sym, typ)| sym == puts as u32 && typ == 4),
    "missing call relocation: {text_relocs:?}"
  );
  // "hi" bytes (with terminator) land in .rdata
  let rdata = (0..coff.nsections() as usize)
    .map(|i| coff.section(i))
    .find(|s| s.name == ".rdata")
    .expect("rdata present");
  let raw = &coff.bytes[rdata.raw_off as usize..(rdata.raw_off + rdata.vsize) as usize];
  assert!(raw.windows(3).any(|w| w == b"hi\0"));
}

#[test]
fn import_only_module_has_empty_text_and_extern_symbols_only() {
  let dir = tempfile::tempdir().unwrap();
  fs::write(dir.path().join("stdio.json"), r#"{
    "format": 2,
    "namespace": "stdio",
    "functions": {
      "puts": {"name": "_stdio__puts", "args": ["char*"], "return": "int"}
    }
  }"#).unwrap();

  let m = module("empty", vec![Item::Using(Spanned::new(Span::default(), "stdio".into()))]);
  let config = CompilerConfig {
    module_paths: vec![dir.path().to_path_buf()],
    ..CompilerConfig::default()
  };
  let coff = compile_to_disk(&m, config);
  assert_eq!(coff.section(0).vsize, 0);
  let syms = coff.symbols();
  assert_eq!(syms.len(), 1);
  assert_eq!(syms[0], ("_stdio__puts".to_owned(), 0, 0, 2));
}

#[test]
fn missing_module_fails_with_import_diagnostic() {
  let m = module("bad", vec![Item::Using(Spanned::new(Span::default(), "nosuch".into()))]);
  let compiler = Compiler::new(CompilerConfig {
    module_paths: vec![],
    ..CompilerConfig::default()
  });
  let err = compiler.compile(&m, &mut NoImports).unwrap_err();
  assert_eq!(err.0.len(), 1);
  assert_eq!(err.0[0].kind, teac::ErrorKind::Import);
  assert!(err.to_string().contains("1 error(s)"));
}

#[test]
fn counter_object_links_methods_through_the_vtable() {
  // object Counter { public n: int; public func inc(): void { this.n += 1; } }
  // func main(): void { var c: Counter = new Counter(); c.inc(); c.inc(); return; }
  let inc = FuncDef {
    storage: Storage::Public,
    conv: Conv::Cdecl,
    name: "inc".into(),
    ret: Some("void".into()),
    params: vec![],
    vararg: false,
    body: vec![
      stmt(StmtKind::Assign {
        lhs: e(ExprKind::Field(Box::new(e(ExprKind::Ident("this".into()))), "n".into())),
        op: Some(AssignOp::Add),
        rhs: e(ExprKind::Int(1)),
      }),
      stmt(StmtKind::Return(None)),
    ],
    span: Span::default(),
  };
  let m = module("counter", vec![
    Item::Object(ObjectDef {
      name: "Counter".into(),
      fields: vec![FieldDef {
        storage: Storage::Public,
        name: "n".into(),
        ty: "int".into(),
        span: Span::default(),
      }],
      methods: vec![inc],
      span: Span::default(),
    }),
    Item::Function(FuncDef {
      storage: Storage::Public,
      conv: Conv::Cdecl,
      name: "main".into(),
      ret: Some("void".into()),
      params: vec![],
      vararg: false,
      body: vec![
        stmt(StmtKind::Var(VarDecl {
          name: "c".into(),
          ty: Some("Counter".into()),
          init: Some(e(ExprKind::New("Counter".into(), vec![]))),
          span: Span::default(),
        })),
        stmt(StmtKind::Expr(e(ExprKind::MethodCall {
          recv: Box::new(e(ExprKind::Ident("c".into()))),
          name: "inc".into(),
          args: vec![],
        }))),
        stmt(StmtKind::Expr(e(ExprKind::MethodCall {
          recv: Box::new(e(ExprKind::Ident("c".into()))),
          name: "inc".into(),
          args: vec![],
        }))),
        stmt(StmtKind::Return(None)),
      ],
      span: Span::default(),
    }),
  ]);
  let coff = compile_to_disk(&m, CompilerConfig::default());
  let syms = coff.symbols();
  let names: Vec<&str> = syms.iter().map(|s| &*s.0).collect();
  assert!(names.contains(&"??0Counter@@QEAA@@Z"));
  assert!(names.contains(&"??1Counter@@QEAA@XZ"));
  assert!(names.contains(&"?inc@Counter@@QEAAX@Z"));
  assert!(names.contains(&"??_7Counter@@6B@"));
  // the allocator pair is referenced
  assert!(names.contains(&"_mem__alloc"));
  assert!(names.contains(&"_mem__free"));
  // the vtable is a static in a writable data section
  let vt = syms.iter().find(|s| s.0 == "??_7Counter@@6B@").unwrap();
  assert_eq!(vt.3, 3);
  let vt_sec = coff.section((vt.2 - 1) as usize);
  assert_eq!(vt_sec.name, ".data");
}
