// Symbol table mapping labels to byte addresses.

use std::collections::BTreeMap;
use std::io::{self, Write};

/// What to do when a label is defined a second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedefinePolicy {
    /// Second definition is rejected and reported.
    #[default]
    Reject,
    /// Last definition wins.
    Overwrite,
}

/// Result of adding a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolTableResult {
    Ok,
    Duplicate,
}

/// Labels bound to byte addresses. Populated during pass 1, read-only
/// afterwards.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    entries: BTreeMap<String, u32>,
    policy: RedefinePolicy,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::with_policy(RedefinePolicy::Reject)
    }

    pub fn with_policy(policy: RedefinePolicy) -> Self {
        Self {
            entries: BTreeMap::new(),
            policy,
        }
    }

    /// Bind `name` to `addr`. Honors the table's redefinition policy.
    pub fn add(&mut self, name: &str, addr: u32) -> SymbolTableResult {
        if self.entries.contains_key(name) && self.policy == RedefinePolicy::Reject {
            return SymbolTableResult::Duplicate;
        }
        self.entries.insert(name.to_string(), addr);
        SymbolTableResult::Ok
    }

    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.entries.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write all symbols in name order, one per line.
    pub fn dump<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for (name, addr) in &self.entries {
            writeln!(out, "{name:<24} {addr:08X}")?;
        }
        Ok(())
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}
