//! Import resolution. A `using "name"` searches the configured module
//! directories for `<name>.tea` (handed back to the embedder's parser
//! and scanned for importable declarations) or a precompiled `<name>.json`
//! descriptor. Imported functions land in the module tree under their
//! scope and are declared into the IR module with their extern names;
//! imported objects materialize their layout and method protocol.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use log::debug;
use serde::Deserialize;

use crate::ErrorKind;
use crate::build_ir::Cx;
use crate::build_object;
use crate::mangle;
use crate::types::Span;
use crate::types::ast::{Item, Module};
use crate::types::entity::ImportedFn;
use crate::types::ty::{FnTy, prim};

/// The embedder-supplied parser used to compile `.tea` imports. The
/// grammar front end is outside the compiler core, so module sources
/// are handed back through this trait.
pub trait ParseImport {
  /// Parse `source` (the contents of `<name>.tea`) into a module tree.
  fn parse(&mut self, source: &str, name: &str) -> Result<Module, String>;
}

/// A [`ParseImport`] that refuses every source import. Descriptor
/// (`.json`) imports still work without a parser.
pub struct NoImports;

impl ParseImport for NoImports {
  fn parse(&mut self, _source: &str, name: &str) -> Result<Module, String> {
    Err(format!("no parser available to import '{name}'"))
  }
}

/// The newest descriptor format this compiler understands.
const MAX_FORMAT: u32 = 2;

#[derive(Debug, Deserialize)]
struct Descriptor {
  format: u32,
  #[serde(default)]
  namespace: Option<String>,
  functions: BTreeMap<String, Entry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Entry {
  /// Format-1 shorthand: just the extern symbol, unchecked signature.
  Short(String),
  Full(FullEntry),
}

#[derive(Debug, Deserialize)]
struct FullEntry {
  #[serde(default)]
  name: Option<String>,
  #[serde(default)]
  args: Vec<String>,
  #[serde(rename = "return", default)]
  ret: Option<String>,
  #[serde(default)]
  vararg: bool,
}

/// Resolve one `using "name"` against the configured search paths.
pub(crate) fn resolve_using(cx: &mut Cx<'_>, name: &str, span: Span,
  parse: &mut dyn ParseImport) {
  if cx.imported.contains(name) { return }
  if cx.importing.iter().any(|m| m == name) {
    cx.err(ErrorKind::Import, span, format!("import cycle detected while importing '{name}'"));
    return;
  }
  for dir in &cx.config.module_paths {
    let tea: PathBuf = dir.join(format!("{name}.tea"));
    if tea.exists() {
      load_tea(cx, name, span, &tea, parse);
      return;
    }
    let json: PathBuf = dir.join(format!("{name}.json"));
    if json.exists() {
      load_descriptor(cx, name, span, &json);
      return;
    }
  }
  cx.err(ErrorKind::Import, span, format!("failed to resolve module '{name}'"));
}

fn load_tea(cx: &mut Cx<'_>, name: &str, span: Span, path: &PathBuf,
  parse: &mut dyn ParseImport) {
  debug!("importing module '{name}' from {}", path.display());
  let src = match fs::read_to_string(path) {
    Ok(s) => s,
    Err(e) => {
      cx.err(ErrorKind::Import, span, format!("'{}': {e}", path.display()));
      return;
    }
  };
  let module = match parse.parse(&src, name) {
    Ok(m) => m,
    Err(e) => {
      cx.err(ErrorKind::Parse, span, format!("parse error in module '{name}': {e}"));
      return;
    }
  };
  cx.importing.push(name.to_owned());
  for item in &module.body {
    match item {
      Item::FunctionImport(fi) => {
        let Ok((ret, _)) = cx.get_ty(&fi.ret, span) else { continue };
        let mut params = Vec::with_capacity(fi.params.len());
        let mut ok = true;
        for p in &fi.params {
          match cx.get_ty(&p.ty, span) {
            Ok((t, _)) => params.push(t),
            Err(_) => ok = false,
          }
        }
        if !ok { continue }
        let sig = FnTy { params: params.into(), ret, vararg: fi.vararg };
        register(cx, name, &fi.name, mangle::scoped(&[name.to_owned()], &fi.name), sig,
          fi.conv.into());
      }
      Item::ObjectImport(oi) => build_object::lower_object_import(cx, oi),
      other => {
        let what = match other {
          Item::Function(f) => format!("function '{}'", f.name),
          Item::Using(u) => format!("using '{}'", u.k),
          Item::Global(g) => format!("global '{}'", g.name),
          Item::Object(o) => format!("object '{}'", o.name),
          Item::Macro(m) => format!("macro '{}'", m.k),
          Item::FunctionImport(_) | Item::ObjectImport(_) => unreachable!(),
        };
        cx.err(ErrorKind::Import, span, format!("{what} is not a valid import"));
      }
    }
  }
  cx.importing.pop();
  cx.imported.insert(name.to_owned());
}

fn load_descriptor(cx: &mut Cx<'_>, name: &str, span: Span, path: &PathBuf) {
  debug!("importing descriptor '{name}' from {}", path.display());
  let data = match fs::read_to_string(path) {
    Ok(s) => s,
    Err(e) => {
      cx.err(ErrorKind::Import, span, format!("'{}': {e}", path.display()));
      return;
    }
  };
  let desc: Descriptor = match serde_json::from_str(&data) {
    Ok(d) => d,
    Err(e) => {
      cx.err(ErrorKind::Import, span, format!("invalid module descriptor '{name}': {e}"));
      return;
    }
  };
  if desc.format == 0 || desc.format > MAX_FORMAT {
    cx.err(ErrorKind::Import, span,
      format!("unknown descriptor format {} in module '{name}'", desc.format));
    return;
  }
  let namespace = desc.namespace.as_deref().unwrap_or(name).to_owned();
  for (key, entry) in &desc.functions {
    let (extern_name, sig, conv) = match entry {
      Entry::Short(sym) => {
        if desc.format >= 2 {
          cx.err(ErrorKind::Import, span, format!(
            "descriptor format {} requires dict entries, but '{key}' is a string", desc.format));
          continue;
        }
        let sig = FnTy { params: Box::new([]), ret: prim::void(), vararg: true };
        (sym.clone(), sig, crate::types::ir::CConv::C)
      }
      Entry::Full(full) => {
        let mut params = Vec::with_capacity(full.args.len());
        let mut ok = true;
        for spelling in &full.args {
          match cx.get_ty(spelling, span) {
            Ok((t, _)) => params.push(t),
            Err(_) => ok = false,
          }
        }
        let ret = match &full.ret {
          Some(sp) => match cx.get_ty(sp, span) {
            Ok((t, _)) => t,
            Err(_) => {
              ok = false;
              prim::void()
            }
          },
          None => prim::void(),
        };
        if !ok { continue }
        let extern_name = full.name.clone()
          .unwrap_or_else(|| mangle::scoped(&[namespace.clone()], key));
        (extern_name, FnTy { params: params.into(), ret, vararg: full.vararg },
          crate::types::ir::CConv::C)
      }
    };
    register(cx, name, key, extern_name, sig, conv);
  }
  cx.imported.insert(name.to_owned());
}

/// Record an imported function in the module tree and declare it into
/// the IR module, so every referenced import is present in the final
/// symbol table.
fn register(cx: &mut Cx<'_>, module: &str, local: &str, extern_name: String, sig: FnTy,
  conv: crate::types::ir::CConv) {
  cx.ir.extern_func(&extern_name, &sig, conv);
  cx.ents.modules.child_mut(module).funcs.insert(local.to_owned(), ImportedFn {
    extern_name,
    sig,
    conv,
  });
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse(s: &str) -> Result<Descriptor, serde_json::Error> { serde_json::from_str(s) }

  #[test]
  fn full_entries() {
    let d = parse(r#"{
      "format": 2,
      "namespace": "stdio",
      "functions": {
        "puts": {"name": "_stdio__puts", "args": ["char*"], "return": "int", "vararg": false},
        "printf": {"name": "_stdio__printf", "args": ["char*"], "return": "int", "vararg": true}
      }
    }"#).unwrap();
    assert_eq!(d.format, 2);
    assert_eq!(d.namespace.as_deref(), Some("stdio"));
    assert!(matches!(d.functions["puts"], Entry::Full(_)));
  }

  #[test]
  fn format1_shorthand() {
    let d = parse(r#"{"format": 1, "functions": {"exit": "_proc__exit"}}"#).unwrap();
    assert!(matches!(&d.functions["exit"], Entry::Short(s) if s == "_proc__exit"));
  }

  #[test]
  fn missing_format_is_rejected() {
    assert!(parse(r#"{"functions": {}}"#).is_err());
  }
}
