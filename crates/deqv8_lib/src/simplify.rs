//! Register and scope simplification.
//!
//! Walks the brace-structured statement list of one function, numbering
//! scope references, substituting registers that hold simple values and
//! inlining scope slots written by functions simplified earlier in the run.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{trace, warn};

use crate::Deqv8Error;
use crate::function::CodeLine;
use crate::scope::ScopeForest;

static SCOPE_REF: Lazy<Regex> = Lazy::new(|| Regex::new(r"Scope\[([^\]]+)\](\[(\d+)\])?").unwrap());
static SCOPE_LHS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*Scope\[([^\]]+)\]\[(\d+)\]\s*=").unwrap());
static SCOPE_SLOT: Lazy<Regex> = Lazy::new(|| Regex::new(r"Scope\[(\d+)\]\[(\d+)\]").unwrap());
static SCOPE_VALUE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Scope\[(\d+)\]$").unwrap());
static REGISTER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(ACCU|CASE_\d+|[ra]\d+)\b").unwrap());
static REGISTER_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(ACCU|CASE_\d+|[ra]\d+)$").unwrap());
static ASSIGNMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(ACCU|CASE_\d+|[ra]\d+|Scope\[\d+\]\[\d+\])\s*=(.*)$").unwrap());
static CALL_SHAPED: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\w\]]\(").unwrap());
static LITERAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\(*(Scope|ConstPool|<|"|\[|\{|true|false|undefined|null|this|[+-]?\d)"#).unwrap()
});
static CONST_INDEXED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[ra]\d+\[\(*ConstPool\[\d+\]").unwrap());
static SIMPLE_SLOT_VALUE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^[A-Za-z0-9_\[\]\."'$:<>-]+$"#).unwrap());

/// Whether a right-hand side may stand in for the register it was assigned to.
pub fn is_substitutable(value: &str) -> bool {
    if CALL_SHAPED.is_match(value) {
        return false;
    }
    LITERAL.is_match(value) || CONST_INDEXED.is_match(value)
}

fn is_simple_slot_value(value: &str) -> bool {
    let value = value.trim();
    !value.is_empty()
        && !value.contains(['(', ')'])
        && !REGISTER_NAME.is_match(value)
        && SIMPLE_SLOT_VALUE.is_match(value)
}

/// `name` occurs in `value` and is not the prefix of a longer register.
fn mentions(name: &str, value: &str) -> bool {
    value.match_indices(name).any(|(i, _)| {
        !value[i + name.len()..].starts_with(|c: char| c.is_ascii_digit())
    })
}

/// Last simple value written to each `(scope id, slot)`, shared by every
/// function of a run.
#[derive(Debug, Clone, Default)]
pub struct SlotEnvironment {
    slots: HashMap<(usize, usize), String>,
}

impl SlotEnvironment {
    pub fn get(&self, scope: usize, slot: usize) -> Option<&str> {
        self.slots.get(&(scope, slot)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Records `value` if it is simple enough to inline elsewhere, and
    /// forgets the slot otherwise.
    pub fn write(&mut self, scope: usize, slot: usize, value: &str) {
        if is_simple_slot_value(value) {
            self.slots.insert((scope, slot), value.trim().to_string());
        } else if self.slots.remove(&(scope, slot)).is_some() {
            trace!(scope, slot, "slot value forgotten");
        }
    }

    /// Replaces every known `Scope[id][slot]` read in `text`.
    pub fn inline(&self, text: &str) -> String {
        SCOPE_SLOT
            .replace_all(text, |c: &regex::Captures<'_>| {
                let key: (usize, usize) = (c[1].parse().unwrap_or(0), c[2].parse().unwrap_or(0));
                self.slots.get(&key).cloned().unwrap_or_else(|| c[0].to_string())
            })
            .into_owned()
    }
}

#[derive(Debug, Clone)]
struct Register {
    value: String,
    overwritten: bool,
    /// Lines that (re)defined the register, first definition first.
    inits: Vec<usize>,
}

/// Register name -> index into [`Simplifier::regs`]. Nested blocks copy the
/// map, so an update through a shared index is seen by every block holding it.
type RegScope = HashMap<String, usize>;

pub struct Simplifier<'a> {
    function: &'a str,
    code: &'a mut [CodeLine],
    line: usize,
    depth: usize,
    regs: Vec<Register>,
    forest: &'a mut ScopeForest,
    slots: &'a mut SlotEnvironment,
    own_scope: Option<String>,
    outer_scope: Option<String>,
    current: Option<usize>,
}

impl<'a> Simplifier<'a> {
    pub fn new(
        function: &'a str,
        code: &'a mut [CodeLine],
        forest: &'a mut ScopeForest,
        slots: &'a mut SlotEnvironment,
    ) -> Self {
        Self {
            function,
            code,
            line: 0,
            depth: 0,
            regs: Vec::new(),
            forest,
            slots,
            own_scope: None,
            outer_scope: None,
            current: None,
        }
    }

    /// Scope addresses of the function and the id `CURRENT` resolves to.
    pub fn with_scope(mut self, own: Option<&str>, outer: Option<&str>, current: Option<usize>) -> Self {
        self.own_scope = own.map(str::to_string);
        self.outer_scope = outer.map(str::to_string);
        self.current = current;
        self
    }

    /// Fills in `decompiled` and `visible` for every line.
    pub fn run(mut self) -> Result<(), Deqv8Error> {
        if self.code.is_empty() {
            return Ok(());
        }
        self.block(&RegScope::new())?;
        let last = self.code.len() - 1;
        if self.line != last {
            warn!(function = self.function, stopped = self.line, last, "simplification stopped early");
        }
        Ok(())
    }

    fn next_line(&mut self) -> Result<String, Deqv8Error> {
        self.line += 1;
        match self.code.get(self.line) {
            Some(c) => Ok(c.translated.clone()),
            None => Err(Deqv8Error::UnbalancedBlock {
                function: self.function.to_string(),
                consumed: self.line,
                total: self.code.len(),
            }),
        }
    }

    fn emit(&mut self, text: &str) {
        let out = if text.is_empty() { String::new() } else { format!("{}{text}", "\t".repeat(self.depth)) };
        self.code[self.line].decompiled = out;
    }

    fn fresh(&mut self, value: String, overwritten: bool, init: usize) -> usize {
        self.regs.push(Register { value, overwritten, inits: vec![init] });
        self.regs.len() - 1
    }

    fn block(&mut self, prev: &RegScope) -> Result<(), Deqv8Error> {
        let is_loop = self.line > 0 && self.code[self.line - 1].decompiled.trim_start().starts_with("while");
        let mut scope = if is_loop {
            // A loop body may run again after any of its assignments.
            let mut names: Vec<(&String, &usize)> = prev.iter().collect();
            names.sort();
            let mut scope = RegScope::new();
            for (name, &id) in names {
                let init = self.regs[id].inits[0];
                let copy = self.fresh(String::new(), true, init);
                scope.insert(name.clone(), copy);
            }
            scope
        } else {
            prev.clone()
        };
        let mut overwritten: Vec<(String, usize)> = Vec::new();

        self.emit("{");
        self.depth += 1;
        loop {
            let text = self.next_line()?;
            if text.trim() == "}" {
                break;
            }
            if text.trim() == "{" {
                let mut merged = prev.clone();
                merged.extend(scope.iter().map(|(k, v)| (k.clone(), *v)));
                self.block(&merged)?;
                continue;
            }
            let simplified = self.simplify_line(&text, &mut scope, prev, &mut overwritten);
            self.emit(&simplified);
        }
        self.depth -= 1;
        self.emit("}");

        if is_loop {
            for (name, &id) in &scope {
                let Some(&outer) = prev.get(name) else { continue };
                let reg = &self.regs[id];
                if reg.overwritten && reg.inits.len() > 1 && !self.regs[outer].overwritten {
                    let extra = reg.inits[1..].to_vec();
                    self.regs[outer].overwritten = true;
                    self.regs[outer].inits.extend(extra);
                }
            }
        }
        for (name, line) in overwritten {
            if let Some(&id) = prev.get(&name) {
                self.regs[id].inits.push(line);
            }
        }
        Ok(())
    }

    fn simplify_line(
        &mut self,
        text: &str,
        scope: &mut RegScope,
        prev: &RegScope,
        overwritten: &mut Vec<(String, usize)>,
    ) -> String {
        let text = if text.contains("PushContext") {
            "ACCU = Scope[CURRENT-1]"
        } else if text.contains("PopContext") {
            "ACCU = Scope[CURRENT]"
        } else {
            text
        };
        let line = self.resolve_scopes(text, scope);

        let Some((lhs, rhs)) = ASSIGNMENT
            .captures(&line)
            .filter(|c| !c[2].starts_with('=') && !c[2].trim().is_empty())
            .map(|c| (c[1].to_string(), c[2].trim().to_string()))
        else {
            let inlined = self.slots.inline(&line);
            return self.substitute(&inlined, scope);
        };

        let rhs = self.slots.inline(&rhs);
        let rhs = self.substitute(&rhs, scope);

        scope.remove(&lhs);
        if let Some(&id) = prev.get(&lhs) {
            self.regs[id].overwritten = true;
            overwritten.push((lhs.clone(), self.line));
        }
        for &id in scope.values() {
            if mentions(&lhs, &self.regs[id].value) {
                self.regs[id].overwritten = true;
            }
        }
        if REGISTER_NAME.is_match(&lhs) && is_substitutable(&rhs) {
            let id = self.fresh(rhs.clone(), false, self.line);
            scope.insert(lhs.clone(), id);
        }
        if let Some(c) = SCOPE_SLOT.captures(&lhs) {
            if let (Ok(ctx), Ok(slot)) = (c[1].parse(), c[2].parse()) {
                self.slots.write(ctx, slot, &rhs);
            }
        }
        format!("{lhs} = {rhs}")
    }

    /// Replaces register reads with their recorded values. A read of a
    /// register that was overwritten since makes its definitions visible
    /// again instead.
    fn substitute(&mut self, text: &str, scope: &RegScope) -> String {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for m in REGISTER.find_iter(text) {
            out.push_str(&text[last..m.start()]);
            last = m.end();
            let Some(&id) = scope.get(m.as_str()) else {
                out.push_str(m.as_str());
                continue;
            };
            let reg = &self.regs[id];
            if reg.overwritten {
                for &init in &reg.inits {
                    if let Some(c) = self.code.get_mut(init) {
                        c.visible = true;
                    }
                }
                out.push_str(m.as_str());
            } else {
                if let Some(c) = self.code.get_mut(reg.inits[0]) {
                    c.visible = false;
                }
                out.push_str(&reg.value);
            }
        }
        out.push_str(&text[last..]);
        out
    }

    /// Numbers every `Scope[expr]` in `text`. The slot written by a line of
    /// the form `Scope[…][n] = …` is resolved as a write; every other slot
    /// access prefers the enclosing scope.
    fn resolve_scopes(&mut self, text: &str, scope: &RegScope) -> String {
        let lhs_start = SCOPE_LHS.find(text).map(|m| m.start() + (m.as_str().len() - m.as_str().trim_start().len()));
        let found: Vec<(usize, usize, String, String)> = SCOPE_REF
            .captures_iter(text)
            .filter_map(|c| {
                let whole = c.get(0)?;
                let slot = c.get(2).map_or("", |m| m.as_str()).to_string();
                Some((whole.start(), whole.end(), c[1].to_string(), slot))
            })
            .collect();
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for (start, end, expr, slot) in found {
            out.push_str(&text[last..start]);
            last = end;
            let has_slot = !slot.is_empty();
            let is_lhs = has_slot && lhs_start == Some(start);
            match self.resolve_expr(&expr, has_slot && !is_lhs, scope) {
                Some(id) => out.push_str(&format!("Scope[{id}]{slot}")),
                None => out.push_str(&text[start..end]),
            }
        }
        out.push_str(&text[last..]);
        out
    }

    fn resolve_expr(&mut self, expr: &str, prefer_outer: bool, scope: &RegScope) -> Option<usize> {
        let expr = expr.trim();
        if !expr.is_empty() && expr.bytes().all(|b| b.is_ascii_digit()) {
            return expr.parse().ok();
        }
        let (base, steps) = match expr.split_once('-') {
            Some((base, steps)) => (base.trim(), steps.trim().parse::<usize>().ok()?),
            None => (expr, 0),
        };
        if base == "CURRENT" {
            if steps == 0 {
                if prefer_outer {
                    if let Some(outer) = &self.outer_scope {
                        return Some(self.forest.id_of(outer));
                    }
                }
                return self.current;
            }
            let target = self.forest.ascend(self.own_scope.as_deref()?, steps)?;
            return Some(self.forest.id_of(&target));
        }
        // A register holding a context read earlier in the function.
        let reg = &self.regs[*scope.get(base)?];
        if reg.overwritten {
            return None;
        }
        let ctx: usize = SCOPE_VALUE.captures(&reg.value)?[1].parse().ok()?;
        if steps == 0 {
            return Some(ctx);
        }
        let addr = self.forest.address_of(ctx)?.to_string();
        let target = self.forest.ascend(&addr, steps)?;
        Some(self.forest.id_of(&target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{FunctionRecord, FunctionRegistry};

    fn lines(texts: &[&str]) -> Vec<CodeLine> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let mut c = CodeLine::new(i, "", "Op");
                c.translated = t.to_string();
                c
            })
            .collect()
    }

    fn visible(code: &[CodeLine]) -> Vec<String> {
        code.iter().filter(|c| c.visible && !c.decompiled.is_empty()).map(|c| c.decompiled.clone()).collect()
    }

    fn forest() -> ScopeForest {
        let mut reg = FunctionRegistry::new();
        for (name, si, outer) in [("outer", "0x10", None), ("inner", "0x20", Some("0x10"))] {
            let mut f = FunctionRecord::new(None);
            f.name = name.to_string();
            f.scope_info = Some(si.to_string());
            f.outer_scope_info = outer.map(str::to_string);
            reg.insert(f);
        }
        ScopeForest::build(reg.iter())
    }

    #[test]
    fn literal_values_are_substituted_and_hidden() {
        let mut code = lines(&["{", "ACCU = 5", "r0 = ACCU", "ACCU = r0.x", "return ACCU", "}"]);
        let mut f = ScopeForest::default();
        let mut slots = SlotEnvironment::default();
        Simplifier::new("f", &mut code, &mut f, &mut slots).run().unwrap();
        assert_eq!(visible(&code), vec!["{", "\treturn 5.x", "}"]);
    }

    #[test]
    fn call_results_are_not_substituted() {
        let mut code = lines(&["{", "ACCU = r1(a0)", "return ACCU", "}"]);
        let mut f = ScopeForest::default();
        let mut slots = SlotEnvironment::default();
        Simplifier::new("f", &mut code, &mut f, &mut slots).run().unwrap();
        assert_eq!(visible(&code), vec!["{", "\tACCU = r1(a0)", "\treturn ACCU", "}"]);
    }

    #[test]
    fn loop_reassignment_keeps_register_names() {
        let mut code = lines(&[
            "{", "ACCU = 0", "r0 = ACCU", "while (true)", "{", "ACCU = r0 + 1", "r0 = ACCU", "}", "return r0", "}",
        ]);
        let mut f = ScopeForest::default();
        let mut slots = SlotEnvironment::default();
        Simplifier::new("f", &mut code, &mut f, &mut slots).run().unwrap();
        let out = visible(&code);
        assert!(out.contains(&"\t\tACCU = r0 + 1".to_string()), "{out:?}");
        assert!(out.contains(&"\treturn r0".to_string()), "{out:?}");
        assert!(out.contains(&"\tr0 = 0".to_string()), "{out:?}");
    }

    #[test]
    fn scope_references_are_numbered() {
        let mut code = lines(&[
            "{",
            "Scope[CURRENT][2] = ACCU",
            "ACCU = Scope[CURRENT][3]",
            "ACCU = Scope[CURRENT-1][0]",
            "ACCU = Scope[CURRENT-5][0]",
            "}",
        ]);
        let mut f = forest();
        let mut slots = SlotEnvironment::default();
        Simplifier::new("inner", &mut code, &mut f, &mut slots)
            .with_scope(Some("0x20"), Some("0x10"), Some(2))
            .run()
            .unwrap();
        let out: Vec<&str> = code.iter().map(|c| c.decompiled.trim()).collect();
        assert_eq!(out[1], "Scope[2][2] = ACCU");
        assert_eq!(out[2], "ACCU = Scope[1][3]");
        assert_eq!(out[3], "ACCU = Scope[1][0]");
        assert_eq!(out[4], "ACCU = Scope[CURRENT-5][0]");
    }

    #[test]
    fn slot_writes_inline_into_later_functions() {
        let mut f = forest();
        let mut slots = SlotEnvironment::default();
        let mut outer = lines(&["{", "ACCU = \"hi\"", "Scope[CURRENT][0] = ACCU", "}"]);
        Simplifier::new("outer", &mut outer, &mut f, &mut slots)
            .with_scope(Some("0x10"), None, Some(1))
            .run()
            .unwrap();
        assert_eq!(slots.get(1, 0), Some("\"hi\""));

        let mut inner = lines(&["{", "ACCU = Scope[CURRENT][0]", "return ACCU", "}"]);
        Simplifier::new("inner", &mut inner, &mut f, &mut slots)
            .with_scope(Some("0x20"), Some("0x10"), Some(2))
            .run()
            .unwrap();
        assert_eq!(visible(&inner), vec!["{", "\treturn \"hi\"", "}"]);
    }

    #[test]
    fn call_shaped_slot_write_forgets_value() {
        let mut slots = SlotEnvironment::default();
        slots.write(1, 0, "5");
        slots.write(1, 0, "r0(a0)");
        assert_eq!(slots.get(1, 0), None);
        slots.write(1, 0, "ACCU");
        assert_eq!(slots.get(1, 0), None);
        assert_eq!(slots.inline("x = Scope[1][0]"), "x = Scope[1][0]");
    }

    #[test]
    fn register_holding_context_resolves_relative_reads() {
        let mut code = lines(&["{", "ACCU = Scope[CURRENT-1]", "r1 = ACCU", "ACCU = Scope[r1][4]", "}"]);
        let mut f = forest();
        let mut slots = SlotEnvironment::default();
        Simplifier::new("inner", &mut code, &mut f, &mut slots)
            .with_scope(Some("0x20"), Some("0x10"), Some(2))
            .run()
            .unwrap();
        assert_eq!(code[3].decompiled.trim(), "ACCU = Scope[1][4]");
    }

    #[test]
    fn missing_close_brace_is_an_error() {
        let mut code = lines(&["{", "ACCU = 1"]);
        let mut f = ScopeForest::default();
        let mut slots = SlotEnvironment::default();
        let err = Simplifier::new("f", &mut code, &mut f, &mut slots).run().unwrap_err();
        assert!(matches!(err, Deqv8Error::UnbalancedBlock { .. }));
    }

    #[test]
    fn substitutable_values() {
        assert!(is_substitutable("5"));
        assert!(is_substitutable("\"s\""));
        assert!(is_substitutable("Scope[1][2]"));
        assert!(is_substitutable("r0[ConstPool[3]]"));
        assert!(!is_substitutable("a0"));
        assert!(!is_substitutable("r0(1)"));
        assert!(mentions("r1", "r1 + 2"));
        assert!(!mentions("r1", "r10 + 2"));
    }
}
