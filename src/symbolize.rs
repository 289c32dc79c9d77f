//! Maps captured return addresses back to functions and source lines.

use std::{
    cell::RefCell,
    collections::{hash_map::Entry, HashMap},
    ffi::CStr,
    ops::Range,
};

use backtrace::SymbolName;
use libc::{c_int, c_void, dl_iterate_phdr, dl_phdr_info, size_t, PT_LOAD};

use crate::error::Error;

/// A loaded object (executable or shared library).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Module {
    pub path: String,
    pub ranges: Vec<Range<usize>>,
}

impl Module {
    pub fn contains(&self, addr: usize) -> bool {
        self.ranges.iter().any(|range| range.contains(&addr))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

/// Debug-information resolver.
pub trait Symbolizer {
    fn module_for(&self, addr: usize) -> Option<&Module>;

    /// Linkage name of the function containing `addr`, possibly mangled.
    fn name_for(&self, module: &Module, addr: usize) -> Option<String>;

    fn source_location_for(&self, module: &Module, addr: usize) -> Option<SourceLocation>;
}

pub trait Demangler {
    /// Human-readable form of `name`, or `None` to keep it unchanged.
    fn demangle(&self, name: &str) -> Option<String>;
}

#[derive(Clone, Default)]
struct Resolved {
    name: Option<String>,
    location: Option<SourceLocation>,
}

/// Resolver for the current process, backed by [`backtrace::resolve`].
pub struct ProcessSymbolizer {
    modules: Vec<Module>,
    cache: RefCell<HashMap<usize, Resolved>>,
}

impl ProcessSymbolizer {
    /// Enumerate the modules currently loaded into the process.
    pub fn open() -> Result<Self, Error> {
        let mut modules: Vec<Module> = Vec::new();
        unsafe {
            dl_iterate_phdr(
                Some(push_module),
                &mut modules as *mut Vec<Module> as *mut c_void,
            )
        };
        if modules.is_empty() {
            return Err(Error::Symbolizer(
                "no loaded modules reported by dl_iterate_phdr".to_string(),
            ));
        }
        Ok(Self::with_modules(modules))
    }

    pub fn with_modules(modules: Vec<Module>) -> Self {
        ProcessSymbolizer {
            modules,
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    // Must be called while running in the context of the target program.
    fn resolve(&self, addr: usize) -> Resolved {
        let mut cache = self.cache.borrow_mut();
        match cache.entry(addr) {
            Entry::Occupied(oe) => oe.get().clone(),
            Entry::Vacant(ve) => {
                let mut resolved = Resolved::default();
                backtrace::resolve(addr as *mut c_void, |s| {
                    if resolved.name.is_none() {
                        resolved.name = s
                            .name()
                            .map(|name| String::from_utf8_lossy(name.as_bytes()).into_owned());
                    }
                    if resolved.location.is_none() {
                        if let (Some(file), Some(line)) = (s.filename(), s.lineno()) {
                            resolved.location = Some(SourceLocation {
                                file: file.display().to_string(),
                                line,
                            });
                        }
                    }
                });
                ve.insert(resolved).clone()
            }
        }
    }
}

unsafe extern "C" fn push_module(
    info: *mut dl_phdr_info,
    _size: size_t,
    data: *mut c_void,
) -> c_int {
    let modules = &mut *(data as *mut Vec<Module>);
    let info = &*info;
    let path = if info.dlpi_name.is_null() {
        String::new()
    } else {
        CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
    };
    let base = info.dlpi_addr as usize;
    let ranges = (0..info.dlpi_phnum as usize)
        .map(|i| &*info.dlpi_phdr.add(i))
        .filter(|phdr| phdr.p_type == PT_LOAD)
        .map(|phdr| {
            let start = base.wrapping_add(phdr.p_vaddr as usize);
            start..start.wrapping_add(phdr.p_memsz as usize)
        })
        .collect();
    modules.push(Module { path, ranges });
    0
}

impl Symbolizer for ProcessSymbolizer {
    fn module_for(&self, addr: usize) -> Option<&Module> {
        self.modules.iter().find(|module| module.contains(addr))
    }

    fn name_for(&self, _module: &Module, addr: usize) -> Option<String> {
        self.resolve(addr).name
    }

    fn source_location_for(&self, _module: &Module, addr: usize) -> Option<SourceLocation> {
        self.resolve(addr).location
    }
}

/// Demangles Itanium C++ and Rust linkage names.
pub struct SymbolDemangler;

impl SymbolDemangler {
    pub fn is_mangled(name: &str) -> bool {
        name.starts_with("_Z") || name.starts_with("__Z") || name.starts_with("_R")
    }
}

impl Demangler for SymbolDemangler {
    fn demangle(&self, name: &str) -> Option<String> {
        if !Self::is_mangled(name) {
            return None;
        }
        Some(format!("{:#}", SymbolName::new(name.as_bytes())))
    }
}
