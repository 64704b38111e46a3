//! Address to symbol lookup over every loaded module's export table.

use std::fmt;

use fxhash::FxHashMap;

use crate::snapshot::ModuleExports;
use crate::types::Address;

/// An exported function identified by module and name or ordinal
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedSymbol
{
    /// Implementing module file name (lower case).
    pub module: String,
    /// Export name, `None` when exported by ordinal only.
    pub name: Option<String>,
    /// Biased ordinal.
    pub ordinal: u32,
    /// Address of the function.
    pub address: Address,
}

impl fmt::Display for ResolvedSymbol
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match &self.name {
            Some(name) => write!(f, "{}!{name}", self.module),
            None => write!(f, "{}!#{}", self.module, self.ordinal),
        }
    }
}

/// Index of exported function addresses
///
/// When two modules export the same address the first one in load order wins.
#[derive(Debug, Clone, Default)]
pub struct ExportIndex
{
    by_address: FxHashMap<u64, ResolvedSymbol>,
}

impl ExportIndex
{
    /// Build the index from captured module exports.
    #[must_use]
    pub fn build(modules: &[ModuleExports]) -> Self
    {
        let mut by_address = FxHashMap::default();
        for module in modules {
            for export in &module.exports {
                by_address.entry(export.address.value()).or_insert_with(|| ResolvedSymbol {
                    module: module.module.name.clone(),
                    name: export.name.clone(),
                    ordinal: export.ordinal,
                    address: export.address,
                });
            }
        }
        Self { by_address }
    }

    /// Symbol exported at exactly `address`.
    #[must_use]
    pub fn get(&self, address: Address) -> Option<&ResolvedSymbol>
    {
        self.by_address.get(&address.value())
    }

    /// Check whether `address` is an export.
    #[must_use]
    pub fn contains(&self, address: Address) -> bool
    {
        self.by_address.contains_key(&address.value())
    }

    /// Find an export by module and name (case-insensitive module match).
    #[must_use]
    pub fn find(&self, module: &str, name: &str) -> Option<&ResolvedSymbol>
    {
        self.by_address
            .values()
            .find(|symbol| symbol.module.eq_ignore_ascii_case(module) && symbol.name.as_deref() == Some(name))
    }

    /// Number of indexed exports.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.by_address.len()
    }

    /// Check whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.by_address.is_empty()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::pe::ExportEntry;
    use crate::types::ModuleInfo;

    fn module(name: &str, base: u64, exports: &[(&str, u64)]) -> ModuleExports
    {
        ModuleExports {
            module: ModuleInfo::new(name, Address::new(base), 0x10000),
            exports: exports
                .iter()
                .enumerate()
                .map(|(i, (export, address))| ExportEntry {
                    name: Some((*export).to_string()),
                    ordinal: i as u32 + 1,
                    address: Address::new(*address),
                })
                .collect(),
        }
    }

    #[test]
    fn test_first_module_wins()
    {
        let index = ExportIndex::build(&[
            module("kernelbase.dll", 0x1000_0000, &[("Sleep", 0x1000_1000)]),
            module("kernel32.dll", 0x2000_0000, &[("Sleep", 0x1000_1000), ("ExitProcess", 0x2000_2000)]),
        ]);
        assert_eq!(index.len(), 2);
        let sleep = index.get(Address::new(0x1000_1000)).unwrap();
        assert_eq!(sleep.module, "kernelbase.dll");
        assert_eq!(sleep.to_string(), "kernelbase.dll!Sleep");
        assert!(index.find("KERNEL32.dll", "ExitProcess").is_some());
        assert!(!index.contains(Address::new(0x2000_2001)));
    }
}
