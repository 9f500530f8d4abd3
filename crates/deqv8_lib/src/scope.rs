//! Lexical scope numbering.
//!
//! Every scope-info address seen in the run becomes a node whose parent is
//! the outer scope-info address printed next to it. Ids are handed out by
//! ascending address, so the numbering does not depend on the order in which
//! functions were parsed.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::trace;

use crate::function::{FunctionRecord, FunctionRegistry};

fn address_value(addr: &str) -> u64 {
    let s = addr.trim();
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u64::from_str_radix(s, 16).unwrap_or(0)
}

#[derive(Debug, Clone, Default)]
pub struct ScopeForest {
    /// scope info -> outer scope info (`None` for a root).
    parents: HashMap<String, Option<String>>,
    ids: HashMap<String, usize>,
    addresses: BTreeMap<usize, String>,
    /// Function identity -> resolved id of its own scope.
    bound: HashMap<String, usize>,
}

impl ScopeForest {
    pub fn build<'a>(functions: impl IntoIterator<Item = &'a FunctionRecord>) -> Self {
        let mut forest = Self::default();
        let mut seen = HashSet::new();
        for f in functions {
            if let Some(si) = &f.scope_info {
                forest.parents.insert(si.clone(), f.outer_scope_info.clone());
                seen.insert(si.clone());
            }
            if let Some(outer) = &f.outer_scope_info {
                seen.insert(outer.clone());
            }
        }
        let mut sorted: Vec<String> = seen.into_iter().collect();
        sorted.sort_by(|a, b| address_value(a).cmp(&address_value(b)).then_with(|| a.cmp(b)));
        for (i, addr) in sorted.into_iter().enumerate() {
            forest.ids.insert(addr.clone(), i + 1);
            forest.addresses.insert(i + 1, addr);
        }
        forest
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn get(&self, addr: &str) -> Option<usize> {
        self.ids.get(addr).copied()
    }

    /// Id of `addr`; an address never seen before gets the next free id.
    pub fn id_of(&mut self, addr: &str) -> usize {
        if let Some(&id) = self.ids.get(addr) {
            return id;
        }
        let id = self.addresses.keys().next_back().map_or(1, |max| max + 1);
        trace!(addr, id, "late scope id");
        self.ids.insert(addr.to_string(), id);
        self.addresses.insert(id, addr.to_string());
        id
    }

    pub fn address_of(&self, id: usize) -> Option<&str> {
        self.addresses.get(&id).map(String::as_str)
    }

    /// The scope `steps` levels above `addr`.
    pub fn ascend(&self, addr: &str, steps: usize) -> Option<String> {
        let mut cur = addr.to_string();
        for _ in 0..steps {
            cur = self.parents.get(&cur)?.clone()?;
        }
        Some(cur)
    }

    /// Number of links from `addr` up to a root; zero for no scope.
    pub fn depth(&self, addr: Option<&str>) -> usize {
        let mut depth = 0;
        let mut seen = HashSet::new();
        let mut cur = addr.map(str::to_string);
        while let Some(a) = cur {
            depth += 1;
            if !seen.insert(a.clone()) {
                break;
            }
            cur = self.parents.get(&a).cloned().flatten();
        }
        depth
    }

    /// Functions ordered so that shallower outer scopes come first. Ties keep
    /// registry order.
    pub fn processing_order(&self, registry: &FunctionRegistry) -> Vec<String> {
        let mut order: Vec<(usize, String)> = registry
            .iter()
            .map(|f| (self.depth(f.outer_scope_info.as_deref()), f.name.clone()))
            .collect();
        order.sort_by_key(|(depth, _)| *depth);
        order.into_iter().map(|(_, name)| name).collect()
    }

    /// Id of the scope `CURRENT` denotes inside `name`: its own scope info,
    /// or else the id bound to the nearest declarer.
    pub fn function_scope(&mut self, registry: &FunctionRegistry, name: &str) -> Option<usize> {
        if let Some(&id) = self.bound.get(name) {
            return Some(id);
        }
        let record = registry.get(name)?;
        if let Some(si) = record.scope_info.clone() {
            let id = self.id_of(&si);
            self.bound.insert(name.to_string(), id);
            return Some(id);
        }
        let mut seen = HashSet::new();
        let mut cur = record.declarer.clone();
        while let Some(declarer) = cur {
            if !seen.insert(declarer.clone()) {
                break;
            }
            if let Some(&id) = self.bound.get(&declarer) {
                self.bound.insert(name.to_string(), id);
                return Some(id);
            }
            cur = registry.get(&declarer).and_then(|d| d.declarer.clone());
        }
        None
    }
}
