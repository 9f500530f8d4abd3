//! Control-flow reconstruction.
//!
//! Rewrites the translated text of a function so that the flat instruction
//! list, read top to bottom, forms brace-delimited loops, conditionals,
//! switches and try/catch blocks. Structure is only ever added as text:
//! braces and keywords are appended or prepended to existing lines with
//! embedded newlines, and [`JumpBlocks::expand`] finally splits those lines
//! apart.
//!
//! Offset arithmetic steps over placeholder lines. "One instruction back"
//! from a branch target is the last real instruction before it. The window
//! that turns a branch into `continue` is measured in bytes instead.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use tracing::{debug, trace};

use crate::function::CodeLine;
use crate::jumps::{JumpKind, JumpTable};

const BREAK: &str = "break";
const CONTINUE: &str = "continue";

/// Structures `code` in place and wraps it in one outer pair of braces.
pub fn reconstruct(function: &str, code: &mut Vec<CodeLine>, jumps: JumpTable) {
    let mut blocks = JumpBlocks::new(function, code, jumps);
    blocks.convert();
}

fn opens_block(text: &str) -> bool {
    text.split('\n').any(|l| l.trim() == "{")
}

/// Attaches `statement` to a branch line.
fn attach(text: &mut String, kind: JumpKind, statement: &str) {
    if kind == JumpKind::If {
        text.push(' ');
        text.push_str(statement);
    } else if text.is_empty() {
        text.push_str(statement);
    } else if text.starts_with('\n') {
        text.insert_str(0, statement);
    } else {
        text.push('\n');
        text.push_str(statement);
    }
}

/// Negates a rendered `if (…)` condition.
fn invert_condition(text: &str) -> String {
    for (from, to) in [(" !== ", " === "), (" === ", " !== "), (" != ", " == "), (" == ", " != ")] {
        if text.contains(from) {
            return text.replacen(from, to, 1);
        }
    }
    if text.contains("(!") {
        return text.replacen("(!", "(", 1);
    }
    text.replacen('(', "(!", 1)
}

pub struct JumpBlocks<'a> {
    function: &'a str,
    code: &'a mut Vec<CodeLine>,
    /// Offsets of real instructions, ascending.
    offsets: Vec<usize>,
    index: HashMap<usize, usize>,
    jumps: JumpTable,
    /// Edge index -> branch target as printed, before ends are pulled back.
    targets: HashMap<usize, usize>,
}

impl<'a> JumpBlocks<'a> {
    pub fn new(function: &'a str, code: &'a mut Vec<CodeLine>, jumps: JumpTable) -> Self {
        let mut real: Vec<(usize, usize)> = code
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_placeholder())
            .filter_map(|(i, c)| c.offset.map(|o| (o, i)))
            .collect();
        real.sort_unstable();
        let offsets = real.iter().map(|&(o, _)| o).collect();
        let index = real.into_iter().collect();
        Self { function, code, offsets, index, jumps, targets: HashMap::new() }
    }

    /// Closest instruction offset at or before `offset`, clamped to the
    /// first and last instruction.
    fn snap(&self, offset: usize) -> Option<usize> {
        let first = *self.offsets.first()?;
        let pos = self.offsets.partition_point(|&o| o <= offset);
        Some(if pos == 0 { first } else { self.offsets[pos - 1] })
    }

    /// The instruction `n` steps away from `offset` (snapped), clamped.
    fn relative(&self, offset: usize, n: isize) -> usize {
        let Some(snapped) = self.snap(offset) else {
            return offset;
        };
        let pos = self.offsets.partition_point(|&o| o < snapped) as isize;
        let last = self.offsets.len() as isize - 1;
        self.offsets[(pos + n).clamp(0, last) as usize]
    }

    fn text(&mut self, offset: usize) -> Option<&mut String> {
        let snapped = self.snap(offset)?;
        let idx = *self.index.get(&snapped)?;
        Some(&mut self.code[idx].translated)
    }

    fn done(&mut self, idx: usize) {
        self.jumps.mark_done(idx);
    }

    fn convert(&mut self) {
        if self.offsets.is_empty() {
            for idx in 0..self.jumps.len() {
                self.done(idx);
            }
        } else {
            let order = self.sorted_edges();
            self.remove_receiver_guards();
            for idx in order {
                if self.jumps.get(idx).done {
                    continue;
                }
                match self.jumps.get(idx).kind {
                    JumpKind::Loop => self.handle_loop(idx),
                    JumpKind::Exception => self.handle_exception(idx),
                    JumpKind::IntSwitch => self.handle_int_switch(idx),
                    JumpKind::If => {
                        if !self.handle_value_switch(idx) {
                            self.handle_if(idx);
                        }
                    }
                    JumpKind::Jump | JumpKind::Catch | JumpKind::IfJsReceiver => {}
                }
            }
            let left = (0..self.jumps.len()).filter(|&i| !self.jumps.get(i).done).count();
            if left > 0 {
                debug!(function = self.function, left, "edges left unstructured");
            }
        }
        self.expand();
    }

    /// Consumes zero-width edges, pulls branch ends back onto the last guarded
    /// instruction and returns every edge index ordered by `(start, end)`.
    fn sorted_edges(&mut self) -> Vec<usize> {
        for idx in 0..self.jumps.len() {
            let (kind, start, end) = {
                let e = self.jumps.get(idx);
                (e.kind, e.start, e.end)
            };
            if start == end {
                self.done(idx);
                continue;
            }
            if !matches!(kind, JumpKind::Loop | JumpKind::IntSwitch) {
                self.targets.insert(idx, end);
                let shifted = self.relative(end, -1);
                self.jumps.get_mut(idx).end = shifted;
            }
        }
        let mut order: Vec<usize> = (0..self.jumps.len()).collect();
        order.sort_by_key(|&i| {
            let e = self.jumps.get(i);
            (e.start, e.end)
        });
        order
    }

    /// Blanks receiver-coercion guards together with the code they skip.
    fn remove_receiver_guards(&mut self) {
        for idx in self.jumps.pending(JumpKind::IfJsReceiver) {
            let (start, end) = {
                let e = self.jumps.get(idx);
                (e.start, e.end)
            };
            let (Some(mut at), Some(end)) = (self.snap(start), self.snap(end)) else {
                self.done(idx);
                continue;
            };
            if at <= end {
                while at != end {
                    if let Some(t) = self.text(at) {
                        t.clear();
                    }
                    let next = self.relative(at, 1);
                    if next == at {
                        break;
                    }
                    at = next;
                    for inner in 0..self.jumps.len() {
                        let e = self.jumps.get(inner);
                        if !e.done && e.start == at {
                            self.done(inner);
                        }
                    }
                }
                if let Some(t) = self.text(end) {
                    t.clear();
                }
            }
            self.done(idx);
        }
    }

    /// Closes a block after `end`, or before the catch handler it would run
    /// into. Returns the offset the brace landed on.
    fn close_section(&mut self, start: usize, end: usize) -> usize {
        let mut end = end;
        let catch_starts: Vec<usize> = self.jumps.catches().map(|c| c.start).collect();
        for catch in catch_starts {
            if start < catch && catch <= end {
                end = catch;
            }
        }
        let Some(at) = self.snap(end) else {
            return end;
        };
        if let Some(t) = self.text(at) {
            if opens_block(t) {
                t.insert_str(0, "\n}\n");
            } else {
                t.push_str("\n}\n");
            }
        }
        at
    }

    /// Pending branches leaving `[range_start, range_end]` become `break`.
    /// Returns the (snapped) offsets they jumped to.
    fn handle_break(&mut self, range_start: usize, range_end: usize) -> BTreeSet<usize> {
        let mut ends = BTreeSet::new();
        for idx in self.jumps.pending_branches() {
            let (kind, start, end) = {
                let e = self.jumps.get(idx);
                (e.kind, e.start, e.end)
            };
            if !(range_start <= start && start <= range_end && range_end < end) {
                continue;
            }
            let Some(target) = self.snap(end) else { continue };
            if let Some(t) = self.text(start) {
                attach(t, kind, BREAK);
            }
            ends.insert(target);
            self.done(idx);
        }
        ends
    }

    /// Pending branches that target one of the last four bytes before the
    /// loop's back jump, or the back jump itself, become `continue`.
    fn handle_continue(&mut self, range_start: usize, range_end: usize, loop_end: usize) {
        let first = self.offsets.first().copied().unwrap_or(0);
        let near_end = loop_end.saturating_sub(4).max(first);
        for idx in self.jumps.pending_branches() {
            let (kind, start, end) = {
                let e = self.jumps.get(idx);
                (e.kind, e.start, e.end)
            };
            let target = self.targets.get(&idx).copied().unwrap_or(end);
            if !(range_start <= start && near_end <= target && end <= range_end) {
                continue;
            }
            if kind == JumpKind::If && self.jumps.find(JumpKind::Jump, end).is_some() {
                continue;
            }
            if let Some(t) = self.text(start) {
                attach(t, kind, CONTINUE);
            }
            self.done(idx);
        }
    }

    fn handle_loop(&mut self, idx: usize) {
        let (start, end) = {
            let e = self.jumps.get(idx);
            (e.start, e.end)
        };
        if let Some(t) = self.text(start) {
            t.insert_str(0, "while (true)\n{\n");
        }
        self.close_section(start, end);
        self.done(idx);
        let inner_end = self.relative(end, -1);
        self.handle_break(start, inner_end);
        self.handle_continue(start, inner_end, end);
    }

    fn handle_exception(&mut self, idx: usize) {
        let (start, end) = {
            let e = self.jumps.get(idx);
            (e.start, e.end)
        };
        if let Some(t) = self.text(start) {
            t.insert_str(0, "try\n{\n");
        }
        match self.jumps.find(JumpKind::Jump, end) {
            Some(catch) => {
                let (c_start, c_end) = {
                    let e = self.jumps.get(catch);
                    (e.start, e.end)
                };
                if let Some(t) = self.text(c_start) {
                    t.push_str("\n}\ncatch\n{");
                }
                if let Some(t) = self.text(c_end) {
                    t.push_str("\n}\n");
                }
                self.jumps.get_mut(catch).kind = JumpKind::Catch;
                self.done(catch);
            }
            None => {
                if let Some(t) = self.text(end) {
                    t.push_str("\n}\ncatch {}\n");
                }
            }
        }
        self.done(idx);
    }

    /// Jump-table switch: the head edge names the first case, every case edge
    /// names the next one.
    fn handle_int_switch(&mut self, idx: usize) {
        let head = self.jumps.get(idx).clone();
        let Some(label) = head.case_label.as_deref().filter(|l| l.contains("switch")) else {
            return;
        };
        let last_case = head.last_case_start.unwrap_or(head.end);
        if let Some(t) = self.text(head.start) {
            t.push_str(&format!("\n{label}\n{{\n"));
        }
        self.done(idx);

        let mut switch_end = BTreeSet::new();
        let mut prev_start = head.start;
        let mut next = self.jumps.find(JumpKind::IntSwitch, head.end);
        while let Some(case_idx) = next {
            let case = self.jumps.get(case_idx).clone();
            let case_label = case.case_label.unwrap_or_default();
            if let Some(t) = self.text(case.start) {
                t.insert_str(0, &format!("\n}}\n{case_label}\n{{\n"));
            }
            let before_case = self.relative(case.start, -1);
            switch_end.extend(self.handle_break(prev_start, before_case));
            prev_start = case.start;
            self.done(case_idx);
            next = self.jumps.find(JumpKind::IntSwitch, case.end);
        }

        if let Some(&first_end) = switch_end.iter().next() {
            let limit = self.relative(first_end, -1);
            switch_end.extend(self.handle_break(last_case, limit));
        }
        let ends: Vec<usize> = switch_end.into_iter().filter(|&e| e > last_case).collect();
        self.finish_switch(last_case, &ends);
    }

    fn finish_switch(&mut self, last_case: usize, ends: &[usize]) {
        match ends {
            [] => {
                if let Some(t) = self.text(last_case) {
                    *t = t.replace("\n{\n", "\n{}\n");
                }
            }
            [only] => {
                self.close_section(last_case, *only);
            }
            [first, second] => {
                if let Some(t) = self.text(*first) {
                    t.push_str("\n}\ndefault:\n{\n");
                }
                let end = self.close_section(*first, *second);
                let inner_end = self.relative(end, -1);
                self.handle_break(*first, inner_end);
            }
            [.., penultimate, last] => {
                if let Some(t) = self.text(*penultimate) {
                    t.push_str("\n}\ndefault:\n{\n");
                }
                let end = self.close_section(*penultimate, *last);
                self.handle_break(*penultimate, end);
            }
        }
    }

    /// A run of comparisons against one value that all fall through to a
    /// shared default jump, rebuilt as a `switch` over `CASE_n` temporaries.
    fn handle_value_switch(&mut self, idx: usize) -> bool {
        let (sw_start, sw_end) = {
            let e = self.jumps.get(idx);
            (e.start, e.end)
        };
        let cases: Vec<usize> = self
            .jumps
            .pending(JumpKind::If)
            .into_iter()
            .filter(|&c| {
                let e = self.jumps.get(c);
                sw_start <= e.start && e.start <= sw_end && sw_end <= e.end
            })
            .collect();
        let Some(&last) = cases.last() else {
            return false;
        };
        let after_last = self.relative(self.jumps.get(last).start, 1);
        let Some(default) = self.jumps.find(JumpKind::Jump, after_last) else {
            return false;
        };
        let distinct_ends: HashSet<usize> = cases.iter().map(|&c| self.jumps.get(c).end).collect();
        if distinct_ends.len() < 2 || sw_end < self.jumps.get(default).start {
            return false;
        }
        trace!(function = self.function, start = sw_start, cases = cases.len(), "value switch");

        let mut ordered = cases;
        ordered.push(default);
        ordered.sort_by_key(|&c| self.jumps.get(c).end);

        let mut label = String::from("switch ()\n");
        let mut switch_end = BTreeSet::new();
        let mut prev_case_start: Option<usize> = None;
        for (n, &case) in ordered.iter().enumerate() {
            let (start, end) = {
                let e = self.jumps.get(case);
                (e.start, e.end)
            };
            if case == default {
                label.push_str("default:\n");
            } else {
                label.push_str(&format!("case CASE_{n}:\n"));
                if let Some(t) = self.text(start) {
                    *t = format!("CASE_{n} = ACCU");
                }
            }
            self.done(case);
            if ordered.get(n + 1).is_some_and(|&next| self.jumps.get(next).end == end) {
                continue;
            }
            if let Some(prev) = prev_case_start {
                let from = self.relative(prev, 1);
                switch_end.extend(self.handle_break(from, end));
            }
            if let Some(t) = self.text(end) {
                t.push_str(&label);
                t.push_str("{\n");
            }
            prev_case_start = Some(end);
            label = String::from("\n}\n");
        }

        let (last_start, last_end) = {
            let e = self.jumps.get(ordered[ordered.len() - 1]);
            (e.start, e.end)
        };
        let default_end = self.jumps.get(default).end;
        match switch_end.iter().next_back().copied() {
            Some(max_end) if max_end != default_end => {
                let end = self.close_section(last_start, max_end);
                let inner_end = self.relative(end, -1);
                self.handle_break(last_start, inner_end);
            }
            _ => {
                if let Some(t) = self.text(last_end) {
                    *t = t.replace("\n{\n", "\n{}\n");
                }
            }
        }
        true
    }

    /// Follows conditionals chained end to start to the last link of a
    /// possibly fused condition.
    fn last_if_in_statement(&mut self, first: usize) -> usize {
        let mut last = first;
        let mut seen = HashSet::from([first]);
        while let Some(next) = self.jumps.find(JumpKind::If, self.jumps.get(last).end) {
            let e = self.jumps.get(next);
            if e.start == e.end || !seen.insert(next) {
                break;
            }
            last = next;
        }

        if let Some(else_jump) = self.jumps.find(JumpKind::Jump, self.jumps.get(last).end) {
            let else_start = self.jumps.get(else_jump).start;
            if let Some(latest) = self
                .jumps
                .pending(JumpKind::If)
                .into_iter()
                .filter(|&i| self.jumps.get(i).end == else_start)
                .max_by_key(|&i| self.jumps.get(i).start)
            {
                last = latest;
            }
        }

        let after = self.relative(self.jumps.get(last).start, 1);
        if let Some(far) = self.jumps.find(JumpKind::Jump, after) {
            let far_end = self.jumps.get(far).end;
            self.jumps.get_mut(last).end = far_end;
            self.done(far);
        }
        last
    }

    /// Colors every link `&&` or `||`, keyed by offset: the instruction after
    /// the last link is `||`, its end `&&`, and each edge ending on a colored
    /// offset gets the opposite color at its start.
    fn and_or_table(&self, links: &[usize], last: usize) -> HashMap<usize, &'static str> {
        let (last_start, last_end) = {
            let e = self.jumps.get(last);
            (e.start, e.end)
        };
        let after = self.relative(last_start, 1);
        let mut table = HashMap::from([(after, "||"), (last_end, "&&")]);
        let mut queue = VecDeque::from([(after, "||"), (last_end, "&&")]);
        while let Some((known, op)) = queue.pop_front() {
            for &link in links {
                let e = self.jumps.get(link);
                if e.end == known && !table.contains_key(&e.start) {
                    let other = if op == "&&" { "||" } else { "&&" };
                    table.insert(e.start, other);
                    queue.push_back((e.start, other));
                }
            }
        }
        table
    }

    fn handle_if(&mut self, first: usize) {
        let (start, end) = {
            let e = self.jumps.get(first);
            (e.start, e.end)
        };
        if start == end {
            if let Some(t) = self.text(start) {
                if let Some(close) = t.rfind(')') {
                    t.replace_range(close..=close, ") {}\n");
                }
            }
            self.done(first);
            return;
        }

        let last = self.last_if_in_statement(first);
        let last_start = self.jumps.get(last).start;
        let links: Vec<usize> = self
            .jumps
            .pending(JumpKind::If)
            .into_iter()
            .filter(|&i| {
                let e = self.jumps.get(i);
                start <= e.start && e.start <= last_start && e.start != e.end
            })
            .collect();
        let ops = self.and_or_table(&links, last);

        let mut keyword = String::from("if");
        for &link in &links {
            let (l_start, l_end) = {
                let e = self.jumps.get(link);
                (e.start, e.end)
            };
            let Some(&op) = ops.get(&l_end) else { continue };
            if let Some(t) = self.text(l_start) {
                if op == "&&" {
                    *t = invert_condition(t);
                }
                *t = t.replacen("if", &keyword, 1);
            }
            keyword = format!("\t{op}");
            self.done(link);
        }

        if let Some(t) = self.text(last_start) {
            t.push_str("\n{");
        }
        let last_end = self.jumps.get(last).end;
        match self.jumps.find(JumpKind::Jump, last_end) {
            Some(else_jump) if self.jumps.get(else_jump).start != self.jumps.get(else_jump).end => {
                let (e_start, e_end) = {
                    let e = self.jumps.get(else_jump);
                    (e.start, e.end)
                };
                if let Some(t) = self.text(e_start) {
                    t.push_str("\n}\nelse\n{");
                }
                self.close_section(e_start, e_end);
                self.done(else_jump);
            }
            _ => {
                self.close_section(last_start, last_end);
            }
        }
    }

    /// Splits every multi-line statement into one line per statement and
    /// wraps the function in braces.
    fn expand(&mut self) {
        let mut out = Vec::with_capacity(self.code.len() + 2);
        out.push(CodeLine::synthetic("{"));
        for mut line in self.code.drain(..) {
            if !line.translated.contains('\n') {
                out.push(line);
                continue;
            }
            let text = std::mem::take(&mut line.translated);
            let mut pieces = text.split('\n');
            line.translated = pieces.next().unwrap_or_default().to_string();
            out.push(line);
            out.extend(pieces.filter(|p| !p.is_empty()).map(CodeLine::synthetic));
        }
        out.push(CodeLine::synthetic("}"));
        *self.code = out;
    }
}
