//! COFF object assembly. Takes the machine code of every defined
//! function plus the module's data globals and lays out a relocatable
//! object: COFF header, section table (`.text`, and `.rdata`/`.data`
//! when non-empty), raw section data, relocation tables, the symbol
//! table, and the length-prefixed string table.
//!
//! Calls between functions defined in this module are patched in place;
//! only references to externals and to data survive as relocations.

use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use byteorder::{LE, WriteBytesExt};
use hashbrown::HashMap;
use log::debug;

use crate::Target;
use crate::build_vcode::{PCode, VRelocKind, VTarget};
use crate::types::ir::{Const, FuncId, GlobalId, Linkage, Module};

/// Function starts are aligned within `.text`.
pub(crate) const FUNCTION_ALIGN: u32 = 16;

fn align_to(n: u32, align: u32) -> u32 { (n + align - 1) & !(align - 1) }

bitflags! {
  /// COFF section characteristics.
  #[derive(Copy, Clone, Debug)]
  pub(crate) struct SectionFlags: u32 {
    /// The section contains executable code.
    const CNT_CODE = 0x20;
    /// The section contains initialized data.
    const CNT_INITIALIZED_DATA = 0x40;
    /// The section can be executed.
    const MEM_EXECUTE = 0x2000_0000;
    /// The section can be read.
    const MEM_READ = 0x4000_0000;
    /// The section can be written.
    const MEM_WRITE = 0x8000_0000;
  }
}

/// `.text`: code, execute, read.
const TEXT_FLAGS: u32 = SectionFlags::CNT_CODE
  .union(SectionFlags::MEM_EXECUTE)
  .union(SectionFlags::MEM_READ)
  .bits();
/// `.rdata`: initialized data, read.
const RDATA_FLAGS: u32 = SectionFlags::CNT_INITIALIZED_DATA
  .union(SectionFlags::MEM_READ)
  .bits();
/// `.data`: initialized data, read, write.
const DATA_FLAGS: u32 = SectionFlags::CNT_INITIALIZED_DATA
  .union(SectionFlags::MEM_READ)
  .union(SectionFlags::MEM_WRITE)
  .bits();

/// IMAGE_REL_AMD64_REL32.
const AMD64_REL32: u16 = 4;
/// IMAGE_REL_AMD64_ADDR64.
const AMD64_ADDR64: u16 = 1;
/// IMAGE_REL_I386_DIR32.
const I386_DIR32: u16 = 6;
/// IMAGE_REL_I386_REL32.
const I386_REL32: u16 = 0x14;

#[derive(Debug)]
struct Reloc {
  va: u32,
  sym: u32,
  typ: u16,
}

#[derive(Debug)]
struct Sym {
  name: String,
  value: u32,
  /// 1-based section number, 0 for undefined externals.
  section: i16,
  /// 0x20 for functions, 0 otherwise.
  typ: u16,
  /// 2 = external, 3 = static.
  class: u8,
}

/// Assemble the final object file.
pub(crate) fn write_object(m: &Module, pcodes: &[(FuncId, PCode)], target: Target)
  -> io::Result<Vec<u8>> {
  let x64 = target.x64();
  let word = target.word();

  // lay out .text
  let mut text = vec![];
  let mut func_off: HashMap<FuncId, u32> = HashMap::new();
  for (fid, pc) in pcodes {
    let at = align_to(u32::try_from(text.len()).expect("overflow"), FUNCTION_ALIGN);
    text.resize(at as usize, 0xCC);
    func_off.insert(*fid, at);
    text.extend_from_slice(&pc.code);
  }

  // lay out the data sections; pointer fields in initializers become
  // (offset, target) pairs fixed up once symbol indices exist
  let mut rdata: Vec<u8> = vec![];
  let mut data: Vec<u8> = vec![];
  let mut rdata_ptr_relocs: Vec<(u32, GlobalId)> = vec![];
  let mut data_ptr_relocs: Vec<(u32, GlobalId)> = vec![];
  let mut global_home: HashMap<GlobalId, (bool, u32)> = HashMap::new();
  for (g, global) in m.globals.enum_iter() {
    let (sec, ptr_relocs, in_rdata) = if global.konst {
      (&mut rdata, &mut rdata_ptr_relocs, true)
    } else {
      (&mut data, &mut data_ptr_relocs, false)
    };
    let at = align_to(u32::try_from(sec.len()).expect("overflow"), 8);
    sec.resize(at as usize, 0);
    global_home.insert(g, (in_rdata, at));
    match &global.init {
      None => {
        let sz = m.sizeof(&global.ty, word);
        sec.resize(sec.len() + sz as usize, 0);
      }
      Some(c) => const_bytes(m, c, word, sec, ptr_relocs),
    }
  }

  // section numbering: .text first, data sections only when non-empty
  let mut nsections = 1_u16;
  let rdata_section = (!rdata.is_empty()).then(|| {
    nsections += 1;
    nsections
  });
  let data_section = (!data.is_empty()).then(|| {
    nsections += 1;
    nsections
  });

  // the symbol table: functions in source order, then data globals
  let mut syms: Vec<Sym> = vec![];
  let mut func_sym: HashMap<FuncId, u32> = HashMap::new();
  let mut global_sym: HashMap<GlobalId, u32> = HashMap::new();
  for (fid, f) in m.funcs.enum_iter() {
    let idx = u32::try_from(syms.len()).expect("overflow");
    func_sym.insert(fid, idx);
    if let Some(&off) = func_off.get(&fid) {
      syms.push(Sym {
        name: f.name.clone(),
        value: off,
        section: 1,
        typ: 0x20,
        class: if f.linkage == Linkage::Public { 2 } else { 3 },
      });
    } else {
      syms.push(Sym { name: f.name.clone(), value: 0, section: 0, typ: 0x20, class: 2 });
    }
  }
  for (g, global) in m.globals.enum_iter() {
    let idx = u32::try_from(syms.len()).expect("overflow");
    global_sym.insert(g, idx);
    let &(in_rdata, off) = &global_home[&g];
    let section = if in_rdata { rdata_section } else { data_section }.expect("section exists");
    syms.push(Sym {
      name: global.name.clone(),
      value: off,
      section: section as i16,
      typ: 0,
      class: if global.linkage == Linkage::Public { 2 } else { 3 },
    });
  }

  // resolve code relocations: local calls are patched, the rest become
  // section relocations against the symbol table
  let mut text_relocs: Vec<Reloc> = vec![];
  for (fid, pc) in pcodes {
    let base = func_off[fid];
    for r in &pc.relocs {
      let site = base + r.offset;
      match r.target {
        VTarget::Func(f2) if func_off.contains_key(&f2) && r.kind == VRelocKind::Rel32 => {
          let rel = i64::from(func_off[&f2]) - (i64::from(site) + 4);
          let rel = i32::try_from(rel).expect("call out of range");
          text[site as usize..site as usize + 4].copy_from_slice(&rel.to_le_bytes());
        }
        VTarget::Func(f2) => {
          let typ = match r.kind {
            VRelocKind::Rel32 => if x64 { AMD64_REL32 } else { I386_REL32 },
            VRelocKind::Abs32 => I386_DIR32,
          };
          text_relocs.push(Reloc { va: site, sym: func_sym[&f2], typ });
        }
        VTarget::Data(g) => {
          let typ = match r.kind {
            VRelocKind::Rel32 => AMD64_REL32,
            VRelocKind::Abs32 => I386_DIR32,
          };
          text_relocs.push(Reloc { va: site, sym: global_sym[&g], typ });
        }
      }
    }
  }
  let ptr_typ = if x64 { AMD64_ADDR64 } else { I386_DIR32 };
  let rdata_relocs: Vec<Reloc> = rdata_ptr_relocs.iter()
    .map(|&(va, g)| Reloc { va, sym: global_sym[&g], typ: ptr_typ })
    .collect();
  let data_relocs: Vec<Reloc> = data_ptr_relocs.iter()
    .map(|&(va, g)| Reloc { va, sym: global_sym[&g], typ: ptr_typ })
    .collect();

  debug!("writing object: {} symbol(s), {} text reloc(s), .text {} bytes",
    syms.len(), text_relocs.len(), text.len());

  // file layout
  let header_size = 20 + 40 * u32::from(nsections);
  let text_off = header_size;
  let text_reloc_off = text_off + u32::try_from(text.len()).expect("overflow");
  let rdata_off = text_reloc_off + 10 * u32::try_from(text_relocs.len()).expect("overflow");
  let rdata_reloc_off = rdata_off + u32::try_from(rdata.len()).expect("overflow");
  let data_off = rdata_reloc_off + 10 * u32::try_from(rdata_relocs.len()).expect("overflow");
  let data_reloc_off = data_off + u32::try_from(data.len()).expect("overflow");
  let symtab_off = data_reloc_off + 10 * u32::try_from(data_relocs.len()).expect("overflow");

  let timestamp = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map_or(0, |d| (d.as_secs() & 0xFFFF_FFFF) as u32);

  let mut w = vec![];
  // COFF header
  w.write_u16::<LE>(if x64 { 0x8664 } else { 0x14C })?; // machine
  w.write_u16::<LE>(nsections)?; // number of sections
  w.write_u32::<LE>(timestamp)?; // time date stamp
  w.write_u32::<LE>(symtab_off)?; // pointer to symbol table
  w.write_u32::<LE>(u32::try_from(syms.len()).expect("overflow"))?; // number of symbols
  w.write_u16::<LE>(0)?; // size of optional header
  w.write_u16::<LE>(0)?; // characteristics

  write_section_header(&mut w, b".text\0\0\0", &text, text_off, text_reloc_off,
    u16::try_from(text_relocs.len()).expect("too many relocations"), TEXT_FLAGS)?;
  if rdata_section.is_some() {
    write_section_header(&mut w, b".rdata\0\0", &rdata, rdata_off, rdata_reloc_off,
      u16::try_from(rdata_relocs.len()).expect("too many relocations"), RDATA_FLAGS)?;
  }
  if data_section.is_some() {
    write_section_header(&mut w, b".data\0\0\0", &data, data_off, data_reloc_off,
      u16::try_from(data_relocs.len()).expect("too many relocations"), DATA_FLAGS)?;
  }

  w.write_all(&text)?;
  write_relocs(&mut w, &text_relocs)?;
  w.write_all(&rdata)?;
  write_relocs(&mut w, &rdata_relocs)?;
  w.write_all(&data)?;
  write_relocs(&mut w, &data_relocs)?;

  // symbol table, with long names spilled to the string table
  let mut strtab: Vec<u8> = vec![0; 4];
  for s in &syms {
    if s.name.len() <= 8 {
      let mut name = [0_u8; 8];
      name[..s.name.len()].copy_from_slice(s.name.as_bytes());
      w.write_all(&name)?;
    } else {
      let off = u32::try_from(strtab.len()).expect("overflow");
      strtab.extend_from_slice(s.name.as_bytes());
      strtab.push(0);
      w.write_u32::<LE>(0)?;
      w.write_u32::<LE>(off)?;
    }
    w.write_u32::<LE>(s.value)?;
    w.write_i16::<LE>(s.section)?;
    w.write_u16::<LE>(s.typ)?;
    w.write_u8(s.class)?;
    w.write_u8(0)?; // auxiliary records
  }

  let strtab_len = u32::try_from(strtab.len()).expect("overflow");
  strtab[0..4].copy_from_slice(&strtab_len.to_le_bytes());
  w.write_all(&strtab)?;
  Ok(w)
}

fn write_section_header(w: &mut Vec<u8>, name: &[u8; 8], raw: &[u8], raw_off: u32,
  reloc_off: u32, nrelocs: u16, flags: u32) -> io::Result<()> {
  let size = u32::try_from(raw.len()).expect("overflow");
  w.write_all(name)?; // section name
  w.write_u32::<LE>(size)?; // virtual size
  w.write_u32::<LE>(0)?; // virtual address
  w.write_u32::<LE>(size)?; // size of raw data
  w.write_u32::<LE>(raw_off)?; // pointer to raw data
  w.write_u32::<LE>(if nrelocs != 0 { reloc_off } else { 0 })?; // pointer to relocations
  w.write_u32::<LE>(0)?; // pointer to line numbers
  w.write_u16::<LE>(nrelocs)?; // number of relocations
  w.write_u16::<LE>(0)?; // number of line numbers
  w.write_u32::<LE>(flags)?; // characteristics
  Ok(())
}

fn write_relocs(w: &mut Vec<u8>, relocs: &[Reloc]) -> io::Result<()> {
  for r in relocs {
    w.write_u32::<LE>(r.va)?;
    w.write_u32::<LE>(r.sym)?;
    w.write_u16::<LE>(r.typ)?;
  }
  Ok(())
}

/// Serialize a constant into a data section. Pointer fields referencing
/// other globals emit a zeroed word and record a relocation site.
fn const_bytes(m: &Module, c: &Const, word: u32, out: &mut Vec<u8>,
  ptr_relocs: &mut Vec<(u32, GlobalId)>) {
  match c {
    Const::Int(ty, v) => {
      let sz = m.sizeof(ty, word) as usize;
      out.extend_from_slice(&v.to_le_bytes()[..sz]);
    }
    Const::F32(x) => out.extend_from_slice(&x.to_bits().to_le_bytes()),
    Const::F64(x) => out.extend_from_slice(&x.to_bits().to_le_bytes()),
    Const::Null(_) => out.extend(std::iter::repeat(0).take(word as usize)),
    Const::Zero(ty) => {
      let sz = m.sizeof(ty, word) as usize;
      out.extend(std::iter::repeat(0).take(sz));
    }
    Const::Bytes(b) => out.extend_from_slice(b),
    Const::Array(_, vals) => {
      for v in vals {
        const_bytes(m, v, word, out, ptr_relocs);
      }
    }
    Const::GlobalAddr(g) => {
      ptr_relocs.push((u32::try_from(out.len()).expect("overflow"), *g));
      out.extend(std::iter::repeat(0).take(word as usize));
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn section_flag_values() {
    // the exact characteristics words the linker expects
    assert_eq!(TEXT_FLAGS, 0x6000_0020);
    assert_eq!(RDATA_FLAGS, 0x4000_0040);
    assert_eq!(DATA_FLAGS, 0xC000_0040);
  }

  #[test]
  fn empty_module_object_shape() {
    let m = Module::new("empty".into());
    let obj = write_object(&m, &[], Target::X64).unwrap();
    assert_eq!(&obj[..2], &0x8664_u16.to_le_bytes());
    assert_eq!(&obj[2..4], &1_u16.to_le_bytes());
    let symtab_off = u32::from_le_bytes(obj[8..12].try_into().unwrap());
    let nsyms = u32::from_le_bytes(obj[12..16].try_into().unwrap());
    assert_eq!(nsyms, 0);
    assert_eq!(symtab_off, 20 + 40);
    // an empty .text section with zero virtual and raw size
    assert_eq!(&obj[20..28], b".text\0\0\0");
    assert_eq!(u32::from_le_bytes(obj[28..32].try_into().unwrap()), 0);
    // the string table is just its own length field
    assert_eq!(&obj[60..64], &4_u32.to_le_bytes());
  }

  #[test]
  fn x86_machine_field() {
    let m = Module::new("empty".into());
    let obj = write_object(&m, &[], Target::X86).unwrap();
    assert_eq!(&obj[..2], &0x14C_u16.to_le_bytes());
  }
}
