//! Opcode semantics.
//!
//! The translator only knows the [`OpcodeTable`] trait. The default
//! [`TemplateTable`] is generated at build time from `data/v8-bytecodes.def`,
//! so a newer bytecode revision only needs a different data file.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::jumps::{JumpEdge, JumpKind, JumpTable};

mod tables {
    include!(concat!(env!("OUT_DIR"), "/bytecode_tables.rs"));
}

pub use tables::{Flow, OpTemplate};

static JUMP_TARGET: Lazy<Regex> = Lazy::new(|| Regex::new(r"@\s*(\d+)\s*\)\s*$").unwrap());
static SWITCH_TABLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{([^}]*)\}\s*$").unwrap());
static SWITCH_CASE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(-?\d+)\s*:\s*@\s*(\d+)").unwrap());
static TRAILING_TARGET: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*\([^()]*@[^()]*\)\s*$").unwrap());
static REGISTER_LIST: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([ra])(\d+)-[ra]?(\d+)$").unwrap());

/// Translates one instruction. `None` means the mnemonic is unknown.
pub trait OpcodeTable {
    fn translate(&self, mnemonic: &str, op: &mut Operation<'_>) -> Option<String>;
}

/// The instruction being translated, plus the jump registrations it may make.
pub struct Operation<'a> {
    pub offset: usize,
    /// Operand text as printed, jump targets and switch tables included.
    pub operands: &'a str,
    /// Operands split on commas, jump target and switch table removed.
    pub args: Vec<&'a str>,
    pub const_pool: &'a [String],
    jumps: &'a mut JumpTable,
}

impl<'a> Operation<'a> {
    pub fn new(offset: usize, operands: &'a str, const_pool: &'a [String], jumps: &'a mut JumpTable) -> Self {
        let mut plain = operands;
        if let Some(i) = plain.find(" {") {
            plain = &plain[..i];
        }
        if let Some(m) = TRAILING_TARGET.find(plain) {
            plain = &plain[..m.start()];
        }
        let args = plain.split(',').map(str::trim).filter(|a| !a.is_empty()).collect();
        Self { offset, operands, args, const_pool, jumps }
    }

    pub fn add_jump(&mut self, kind: JumpKind, start: usize, end: usize) {
        self.jumps.add(JumpEdge::new(kind, start, end));
    }

    pub fn add_int_switch(&mut self, start: usize, end: usize, label: &str, last_case: usize) {
        let mut edge = JumpEdge::new(JumpKind::IntSwitch, start, end);
        edge.case_label = Some(label.to_string());
        edge.last_case_start = Some(last_case);
        self.jumps.add(edge);
    }

    /// Target of a jump printed as `[n] (0x… @ target)`.
    pub fn jump_target(&self) -> Option<usize> {
        JUMP_TARGET.captures(self.operands)?.get(1)?.as_str().parse().ok()
    }

    /// `(case value, target)` pairs of a `{ 0: @20, 1: @24 }` jump table.
    pub fn switch_targets(&self) -> Vec<(i64, usize)> {
        let Some(table) = SWITCH_TABLE.captures(self.operands).and_then(|c| c.get(1)) else {
            return Vec::new();
        };
        SWITCH_CASE
            .captures_iter(table.as_str())
            .filter_map(|c| Some((c[1].parse().ok()?, c[2].parse().ok()?)))
            .collect()
    }

    pub fn arg(&self, idx: usize) -> String {
        self.args.get(idx).map(|a| normalize_operand(a)).unwrap_or_default()
    }

    /// Constant pool entry named by operand `idx`.
    pub fn constant(&self, idx: usize) -> String {
        let Ok(ci) = self.arg(idx).parse::<usize>() else {
            return format!("ConstPool[{}]", self.arg(idx));
        };
        match self.const_pool.get(ci) {
            Some(v) if !v.is_empty() => v.clone(),
            _ => format!("ConstPool[{ci}]"),
        }
    }

    pub fn register_list(&self, idx: usize) -> Vec<String> {
        let Some(raw) = self.args.get(idx) else {
            return Vec::new();
        };
        expand_register_list(raw)
    }
}

fn normalize_operand(raw: &str) -> String {
    let raw = raw.trim();
    match raw {
        "<context>" => return "CURRENT".to_string(),
        "<this>" => return "this".to_string(),
        _ => {}
    }
    if let Some(inner) = raw.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        return inner.trim().to_string();
    }
    if let Some(flags) = raw.strip_prefix('#') {
        return flags.to_string();
    }
    raw.to_string()
}

fn expand_register_list(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if let Some(c) = REGISTER_LIST.captures(raw) {
        let (Ok(a), Ok(b)) = (c[2].parse::<usize>(), c[3].parse::<usize>()) else {
            return vec![raw.to_string()];
        };
        let prefix = &c[1];
        return (a..=b).map(|i| format!("{prefix}{i}")).collect();
    }
    vec![normalize_operand(raw)]
}

fn unquote(s: &str) -> &str {
    s.strip_prefix('"').and_then(|s| s.strip_suffix('"')).unwrap_or(s)
}

/// Expands `{N}`, `{cN}`, `{nN}`, `{lN}` and `{tN}`. Braces that do not
/// form a placeholder are copied through.
pub fn render_template(template: &str, op: &Operation<'_>) -> String {
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let placeholder = after.find('}').and_then(|close| {
            let body = &after[..close];
            let (kind, digits) = match body.chars().next() {
                Some(k @ ('c' | 'n' | 'l' | 't')) => (Some(k), &body[1..]),
                _ => (None, body),
            };
            let idx = digits.parse::<usize>().ok()?;
            let text = match kind {
                None => op.arg(idx),
                Some('c') => op.constant(idx),
                Some('n') => unquote(&op.constant(idx)).to_string(),
                Some('l') => op.register_list(idx).join(", "),
                Some(_) => op.register_list(idx).into_iter().skip(1).collect::<Vec<_>>().join(", "),
            };
            Some((text, close))
        });
        match placeholder {
            Some((text, close)) => {
                out.push_str(&text);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// [`OpcodeTable`] over the generated template table.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateTable;

impl TemplateTable {
    pub fn lookup(mnemonic: &str) -> Option<&'static OpTemplate> {
        tables::OPCODE_TEMPLATES
            .binary_search_by(|t| t.name.cmp(mnemonic))
            .ok()
            .map(|i| &tables::OPCODE_TEMPLATES[i])
    }

    fn register_switch(op: &mut Operation<'_>, head: &str) {
        let base: i64 = op.arg(2).parse().unwrap_or(0);
        let mut by_target: BTreeMap<usize, Vec<i64>> = BTreeMap::new();
        for (value, target) in op.switch_targets() {
            let Some(case) = base.checked_add(value) else { continue };
            by_target.entry(target).or_default().push(case);
        }
        let targets: Vec<(usize, Vec<i64>)> = by_target.into_iter().collect();
        let (Some(first), Some(last)) = (targets.first(), targets.last()) else {
            return;
        };
        let (first, last) = (first.0, last.0);
        let offset = op.offset;
        op.add_int_switch(offset, first, head, last);
        for (i, (start, values)) in targets.iter().enumerate() {
            let end = targets.get(i + 1).map_or(offset, |t| t.0);
            let label = values.iter().map(|v| format!("case {v}:")).collect::<Vec<_>>().join("\n");
            op.add_int_switch(*start, end, &label, last);
        }
    }
}

impl OpcodeTable for TemplateTable {
    fn translate(&self, mnemonic: &str, op: &mut Operation<'_>) -> Option<String> {
        let t = Self::lookup(mnemonic)?;
        let text = render_template(t.template, op);
        let offset = op.offset;
        match t.flow {
            Flow::None => {}
            Flow::If | Flow::Jump | Flow::Loop | Flow::Receiver => {
                if let Some(target) = op.jump_target() {
                    match t.flow {
                        Flow::If => op.add_jump(JumpKind::If, offset, target),
                        Flow::Jump => op.add_jump(JumpKind::Jump, offset, target),
                        Flow::Loop => op.add_jump(JumpKind::Loop, target, offset),
                        _ => op.add_jump(JumpKind::IfJsReceiver, offset, target),
                    }
                }
            }
            // The switch head is emitted by the reconstructor from the edge label.
            Flow::Switch => {
                Self::register_switch(op, &text);
                return Some(String::new());
            }
        }
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op<'a>(offset: usize, operands: &'a str, pool: &'a [String], jumps: &'a mut JumpTable) -> Operation<'a> {
        Operation::new(offset, operands, pool, jumps)
    }

    #[test]
    fn generated_table_is_sorted_and_knows_core_opcodes() {
        let names: Vec<_> = tables::OPCODE_TEMPLATES.iter().map(|t| t.name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(TemplateTable::lookup("Ldar").is_some());
        assert!(TemplateTable::lookup("JumpLoop").is_some());
        assert!(TemplateTable::lookup("NoSuchOpcode").is_none());
    }

    #[test]
    fn operands_are_normalized() {
        let mut jt = JumpTable::new();
        let pool = vec!["\"name\"".to_string()];
        let o = op(0, "<context>, [2], [0]", &pool, &mut jt);
        assert_eq!(render_template("Scope[{0}-{2}][{1}]", &o), "Scope[CURRENT-0][2]");
    }

    #[test]
    fn constants_and_names_resolve_through_the_pool() {
        let mut jt = JumpTable::new();
        let pool = vec!["\"log\"".to_string(), String::new()];
        let o = op(0, "r1, [0], [4]", &pool, &mut jt);
        assert_eq!(render_template("ACCU = {0}.{n1}", &o), "ACCU = r1.log");
        assert_eq!(render_template("ACCU = {c1}", &o), "ACCU = \"log\"");
        let o = op(0, "[1]", &pool, &mut jt);
        assert_eq!(render_template("ACCU = {c0}", &o), "ACCU = ConstPool[1]");
    }

    #[test]
    fn register_lists_expand() {
        let mut jt = JumpTable::new();
        let o = op(0, "r0, r1-r3, [5]", &[], &mut jt);
        assert_eq!(render_template("ACCU = {0}({l1})", &o), "ACCU = r0(r1, r2, r3)");
        assert_eq!(render_template("ACCU = {0}({t1})", &o), "ACCU = r0(r2, r3)");
    }

    #[test]
    fn literal_braces_pass_through() {
        let mut jt = JumpTable::new();
        let o = op(0, "r4, [0], #41", &[], &mut jt);
        assert_eq!(render_template("ACCU = {}", &o), "ACCU = {}");
        assert_eq!(render_template("ACCU = {...{0}}", &o), "ACCU = {...r4}");
    }

    #[test]
    fn conditional_jump_registers_if_edge() {
        let mut jt = JumpTable::new();
        let text = {
            let mut o = op(16, "[9] (0x2ba20829a2d0 @ 25)", &[], &mut jt);
            assert_eq!(o.args, vec!["[9]"]);
            TemplateTable.translate("JumpIfFalse", &mut o)
        };
        assert_eq!(text.as_deref(), Some("if (!ACCU)"));
        assert_eq!(jt.edges(), &[JumpEdge::new(JumpKind::If, 16, 25)]);
    }

    #[test]
    fn jump_loop_registers_backward_loop_edge() {
        let mut jt = JumpTable::new();
        {
            let mut o = op(30, "[26], [0] (0x2ba20829a2c0 @ 4)", &[], &mut jt);
            TemplateTable.translate("JumpLoop", &mut o);
        }
        assert_eq!(jt.edges(), &[JumpEdge::new(JumpKind::Loop, 4, 30)]);
    }

    #[test]
    fn switch_registers_case_chain() {
        let mut jt = JumpTable::new();
        {
            let mut o = op(5, "[0], [3], [1] { 0: @20, 1: @24, 2: @24 }", &[], &mut jt);
            assert_eq!(TemplateTable.translate("SwitchOnSmiNoFeedback", &mut o).as_deref(), Some(""));
        }
        let e = jt.edges();
        assert_eq!(e.len(), 3);
        assert_eq!((e[0].start, e[0].end), (5, 20));
        assert_eq!(e[0].case_label.as_deref(), Some("switch (ACCU)"));
        assert_eq!((e[1].start, e[1].end), (20, 24));
        assert_eq!(e[1].case_label.as_deref(), Some("case 1:"));
        assert_eq!((e[2].start, e[2].end), (24, 5));
        assert_eq!(e[2].case_label.as_deref(), Some("case 2:\ncase 3:"));
        assert!(e.iter().all(|e| e.last_case_start == Some(24)));
    }

    #[test]
    fn switch_case_overflowing_base_is_dropped() {
        let mut jt = JumpTable::new();
        {
            let mut o = op(5, "[0], [2], [1] { 0: @20, 9223372036854775807: @24 }", &[], &mut jt);
            TemplateTable.translate("SwitchOnSmiNoFeedback", &mut o);
        }
        let e = jt.edges();
        assert_eq!(e.len(), 2);
        assert_eq!((e[0].start, e[0].end), (5, 20));
        assert_eq!((e[1].start, e[1].end), (20, 5));
        assert_eq!(e[1].case_label.as_deref(), Some("case 1:"));
    }

    #[test]
    fn unknown_mnemonic_translates_to_none() {
        let mut jt = JumpTable::new();
        let mut o = op(0, "", &[], &mut jt);
        assert_eq!(TemplateTable.translate("StackCheck", &mut o), None);
    }
}
