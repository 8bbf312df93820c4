//! Function name to address resolution for ELF images.
//!
//! The image is treated purely as data: nothing here looks at the running
//! program, so this works just as well on another process' executable.

use std::{
    collections::{hash_map::Entry, HashMap},
    fs,
    path::Path,
};

use elf::{
    abi::{ET_DYN, PT_LOAD, STB_GLOBAL, STB_WEAK, STT_FUNC},
    endian::AnyEndian,
    ElfBytes, ParseError,
};

/// Lower bound of the reserved section index range (gABI); not exported by `elf` 0.7.
const SHN_LORESERVE: u16 = 0xff00;

use crate::{
    error::{Error, Result},
    maps::MemoryMap,
};

/// Raw bytes of an executable or shared object.
pub struct BinaryImage {
    data: Vec<u8>,
}

impl BinaryImage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            data: fs::read(path)?,
        })
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionSymbol {
    pub name: String,
    /// Link-time entry address.
    pub entry: u64,
    pub size: u64,
    /// Where the entry lives inside the file.
    pub file_offset: u64,
    global: bool,
}

/// Functions defined by one image, keyed by exact name.
#[derive(Debug)]
pub struct SymbolTable {
    text_start: u64,
    image_base: u64,
    position_independent: bool,
    functions: HashMap<String, FunctionSymbol>,
}

fn malformed(err: ParseError) -> Error {
    Error::MalformedImage(err.to_string())
}

impl SymbolTable {
    pub fn parse(image: &BinaryImage) -> Result<Self> {
        let file = ElfBytes::<AnyEndian>::minimal_parse(image.as_bytes()).map_err(malformed)?;

        let text = file
            .section_header_by_name(".text")
            .map_err(malformed)?
            .ok_or_else(|| Error::MalformedImage("missing .text section".into()))?;
        let shdrs = file
            .section_headers()
            .ok_or_else(|| Error::MalformedImage("missing section headers".into()))?;

        let tables = [
            file.symbol_table().map_err(malformed)?,
            file.dynamic_symbol_table().map_err(malformed)?,
        ];
        if tables.iter().all(Option::is_none) {
            return Err(Error::MalformedImage("no symbol table".into()));
        }

        let mut functions = HashMap::new();
        for (symtab, strtab) in tables.into_iter().flatten() {
            for sym in symtab.iter() {
                if sym.st_symtype() != STT_FUNC
                    || sym.is_undefined()
                    || sym.st_name == 0
                    || sym.st_shndx >= SHN_LORESERVE
                {
                    continue;
                }
                let name = strtab.get(sym.st_name as usize).map_err(malformed)?;
                let section = shdrs.get(sym.st_shndx as usize).map_err(malformed)?;
                let Some(file_offset) = sym
                    .st_value
                    .checked_sub(section.sh_addr)
                    .and_then(|delta| delta.checked_add(section.sh_offset))
                else {
                    log::debug!(
                        "skipping {name}: 0x{:x} lies outside its section",
                        sym.st_value
                    );
                    continue;
                };
                let symbol = FunctionSymbol {
                    name: name.to_owned(),
                    entry: sym.st_value,
                    size: sym.st_size,
                    file_offset,
                    global: matches!(sym.st_bind(), STB_GLOBAL | STB_WEAK),
                };
                match functions.entry(symbol.name.clone()) {
                    Entry::Vacant(slot) => {
                        slot.insert(symbol);
                    }
                    // local duplicates (static functions) lose to exported ones
                    Entry::Occupied(mut slot) if !slot.get().global && symbol.global => {
                        slot.insert(symbol);
                    }
                    Entry::Occupied(_) => {}
                }
            }
        }

        let image_base = file
            .segments()
            .map(|phdrs| {
                phdrs
                    .iter()
                    .filter(|phdr| phdr.p_type == PT_LOAD)
                    .map(|phdr| phdr.p_vaddr.saturating_sub(phdr.p_offset))
                    .min()
                    .unwrap_or(0)
            })
            .unwrap_or(0);

        log::debug!(
            "indexed {} functions, .text at 0x{:x}",
            functions.len(),
            text.sh_addr
        );
        Ok(Self {
            text_start: text.sh_addr,
            image_base,
            position_independent: file.ehdr.e_type == ET_DYN,
            functions,
        })
    }

    pub fn lookup(&self, name: &str) -> Option<&FunctionSymbol> {
        self.functions.get(name)
    }

    pub fn text_start(&self) -> u64 {
        self.text_start
    }

    /// Whether the image is relocated as a whole when loaded (PIE or shared object).
    pub fn is_position_independent(&self) -> bool {
        self.position_independent
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Entry address of `symbol` once the image at `path` is loaded as in `map`.
    pub fn runtime_address(
        &self,
        symbol: &FunctionSymbol,
        map: &MemoryMap,
        path: &Path,
    ) -> Result<u64> {
        if !self.position_independent {
            return Ok(symbol.entry);
        }
        let base = map
            .load_base(path)
            .ok_or_else(|| Error::ObjectNotLoaded(path.to_path_buf()))?;
        Ok(base as u64 + symbol.entry.saturating_sub(self.image_base))
    }

    fn get(&self, name: &str) -> Result<&FunctionSymbol> {
        self.lookup(name)
            .ok_or_else(|| Error::SymbolNotFound(name.to_owned()))
    }
}

/// Link-time entry address of the function called `name`.
pub fn resolve(image: &BinaryImage, name: &str) -> Result<u64> {
    Ok(SymbolTable::parse(image)?.get(name)?.entry)
}

/// File offset of the function called `name`.
pub fn resolve_file_offset(image: &BinaryImage, name: &str) -> Result<u64> {
    Ok(SymbolTable::parse(image)?.get(name)?.file_offset)
}

/// Address of `name` inside the process described by `map`, where the
/// image at `path` is loaded.
pub fn resolve_in(map: &MemoryMap, path: &Path, name: &str) -> Result<u64> {
    let path = fs::canonicalize(path)?;
    let table = SymbolTable::parse(&BinaryImage::open(&path)?)?;
    let symbol = table.get(name)?;
    let addr = table.runtime_address(symbol, map, &path)?;
    log::debug!(
        "{name}: link address 0x{:x}, runtime address 0x{addr:x}",
        symbol.entry
    );
    Ok(addr)
}
