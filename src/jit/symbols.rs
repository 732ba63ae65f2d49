//! External symbol lookup.

use std::collections::HashMap;

use log::trace;

/// Name to address map for symbols outside the batch.
///
/// Host-defined symbols win; otherwise the process namespace is searched
/// with `dlsym` when enabled.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    defined: HashMap<String, u64>,
    search_process: bool,
}

impl SymbolTable {
    pub fn new(search_process: bool) -> Self {
        Self {
            defined: HashMap::new(),
            search_process,
        }
    }

    pub fn define(&mut self, name: &str, addr: u64) {
        self.defined.insert(name.to_string(), addr);
    }

    pub fn lookup(&self, name: &str) -> Option<u64> {
        if let Some(&addr) = self.defined.get(name) {
            return Some(addr);
        }
        if self.search_process {
            let addr = process_symbol(name);
            trace!("dlsym({}) = {:?}", name, addr);
            return addr;
        }
        None
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(unix)]
fn process_symbol(name: &str) -> Option<u64> {
    let name = std::ffi::CString::new(name).ok()?;
    let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
    if addr.is_null() {
        None
    } else {
        Some(addr as u64)
    }
}

#[cfg(not(unix))]
fn process_symbol(_name: &str) -> Option<u64> {
    None
}
