use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Largest constant pool or literal array length accepted from a dump.
pub const MAX_DECLARED_LEN: usize = 1 << 20;
/// Largest bytecode offset accepted from a dump.
pub const MAX_CODE_OFFSET: usize = 1 << 20;

/// One statement of a function body.
///
/// Lines parsed from the dump carry an offset. Lines inserted while
/// structuring control flow (braces, `else`, ...) do not.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodeLine {
    pub offset: Option<usize>,
    pub opcode: String,
    pub instruction: String,
    pub translated: String,
    pub decompiled: String,
    pub visible: bool,
}

impl CodeLine {
    pub fn new(offset: usize, opcode: &str, instruction: &str) -> Self {
        Self {
            offset: Some(offset),
            opcode: opcode.to_string(),
            instruction: instruction.to_string(),
            visible: true,
            ..Self::default()
        }
    }

    /// Inert filler for an offset the dump did not print.
    pub fn placeholder(offset: usize) -> Self {
        Self::new(offset, "", "// placeholder")
    }

    pub fn synthetic(translated: &str) -> Self {
        Self { translated: translated.to_string(), visible: true, ..Self::default() }
    }

    pub fn is_placeholder(&self) -> bool {
        self.instruction.is_empty() || self.instruction.starts_with("//")
    }
}

/// A protected region `[start, end)` and the offset of its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerRange {
    pub start: usize,
    pub end: usize,
    pub handler: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionRecord {
    pub name: String,
    pub declarer: Option<String>,
    pub address: Option<String>,
    pub argument_count: usize,
    pub register_count: usize,
    pub const_pool: Vec<String>,
    /// Keyed by the start of the protected region.
    pub exception_table: BTreeMap<usize, HandlerRange>,
    pub scope_info: Option<String>,
    pub outer_scope_info: Option<String>,
    pub code: Vec<CodeLine>,
}

impl FunctionRecord {
    pub fn new(declarer: Option<&str>) -> Self {
        Self {
            name: "func_unknown".to_string(),
            declarer: declarer.map(str::to_string),
            ..Self::default()
        }
    }

    /// Sorts the code by offset, keeps the first line seen per offset and
    /// fills every gap between the first and last offset with a placeholder.
    pub fn normalize_code(&mut self) {
        let mut code = std::mem::take(&mut self.code);
        code.sort_by_key(|c| c.offset);
        code.dedup_by_key(|c| c.offset);
        let (Some(first), Some(last)) = (
            code.first().and_then(|c| c.offset),
            code.last().and_then(|c| c.offset),
        ) else {
            self.code = code;
            return;
        };
        if last - first > MAX_CODE_OFFSET {
            self.code = code;
            return;
        }
        let mut filled = Vec::with_capacity(last - first + 1);
        let mut it = code.into_iter().peekable();
        for off in first..=last {
            if matches!(it.peek(), Some(c) if c.offset == Some(off)) {
                filled.extend(it.next());
            } else {
                filled.push(CodeLine::placeholder(off));
            }
        }
        self.code = filled;
    }

    pub fn parameter_names(&self) -> Vec<String> {
        (0..self.argument_count.saturating_sub(1)).map(|i| format!("a{i}")).collect()
    }
}

/// Flat registry of every parsed function, in the order parsing finished.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: Vec<FunctionRecord>,
    by_name: HashMap<String, usize>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a record; a record with the same identity is replaced in place.
    pub fn insert(&mut self, record: FunctionRecord) {
        match self.by_name.get(&record.name) {
            Some(&idx) => self.functions[idx] = record,
            None => {
                self.by_name.insert(record.name.clone(), self.functions.len());
                self.functions.push(record);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&FunctionRecord> {
        self.by_name.get(name).map(|&i| &self.functions[i])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut FunctionRecord> {
        self.by_name.get(name).map(|&i| &mut self.functions[i])
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FunctionRecord> {
        self.functions.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.functions.iter().map(|f| f.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_code_sorts_dedups_and_fills_gaps() {
        let mut f = FunctionRecord::new(None);
        f.code = vec![
            CodeLine::new(3, "aa", "Return"),
            CodeLine::new(0, "0b 03", "Ldar a0"),
            CodeLine::new(0, "0c", "LdaZero"),
        ];
        f.normalize_code();
        let offs: Vec<_> = f.code.iter().map(|c| c.offset).collect();
        assert_eq!(offs, vec![Some(0), Some(1), Some(2), Some(3)]);
        assert_eq!(f.code[0].instruction, "Ldar a0");
        assert!(f.code[1].is_placeholder());
        assert!(f.code[2].is_placeholder());
        assert!(!f.code[3].is_placeholder());
    }

    #[test]
    fn registry_replaces_same_identity_in_place() {
        let mut reg = FunctionRegistry::new();
        let mut a = FunctionRecord::new(None);
        a.name = "func_a".into();
        let mut b = FunctionRecord::new(None);
        b.name = "func_b".into();
        reg.insert(a.clone());
        reg.insert(b);
        a.argument_count = 3;
        reg.insert(a);
        assert_eq!(reg.names(), vec!["func_a", "func_b"]);
        assert_eq!(reg.get("func_a").map(|f| f.argument_count), Some(3));
    }

    #[test]
    fn parameter_names_skip_receiver() {
        let mut f = FunctionRecord::new(None);
        f.argument_count = 3;
        assert_eq!(f.parameter_names(), vec!["a0", "a1"]);
        f.argument_count = 0;
        assert!(f.parameter_names().is_empty());
    }
}
