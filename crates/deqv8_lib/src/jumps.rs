use std::fmt;

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JumpKind {
    Loop,
    If,
    Jump,
    IntSwitch,
    Exception,
    Catch,
    IfJsReceiver,
}

impl fmt::Display for JumpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JumpKind::Loop => "Loop",
            JumpKind::If => "If",
            JumpKind::Jump => "Jump",
            JumpKind::IntSwitch => "IntSwitch",
            JumpKind::Exception => "Exception",
            JumpKind::Catch => "Catch",
            JumpKind::IfJsReceiver => "IfJSReceiver",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpEdge {
    pub kind: JumpKind,
    pub start: usize,
    pub end: usize,
    pub done: bool,
    /// Switch edges only: the label opened at `start`.
    pub case_label: Option<String>,
    /// Switch edges only: start of the last case of the chain.
    pub last_case_start: Option<usize>,
}

impl JumpEdge {
    pub fn new(kind: JumpKind, start: usize, end: usize) -> Self {
        Self { kind, start, end, done: false, case_label: None, last_case_start: None }
    }
}

/// Every edge of one function in registration order.
///
/// Edges are never removed; consuming one sets `done`. Lookups by
/// `(kind, start)` only see edges that are still pending, except for
/// [`JumpKind::Catch`], whose edges are consumed the moment they are
/// reclassified and still have to be visible when closing sections.
#[derive(Debug, Clone, Default)]
pub struct JumpTable {
    edges: Vec<JumpEdge>,
}

impl JumpTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an edge. A second pending edge of the same kind at the same
    /// start is dropped.
    pub fn add(&mut self, edge: JumpEdge) -> bool {
        if self.find(edge.kind, edge.start).is_some() {
            debug!(kind = %edge.kind, start = edge.start, "duplicate jump registration ignored");
            return false;
        }
        self.edges.push(edge);
        true
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn edges(&self) -> &[JumpEdge] {
        &self.edges
    }

    pub fn get(&self, idx: usize) -> &JumpEdge {
        &self.edges[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut JumpEdge {
        &mut self.edges[idx]
    }

    /// Index of the pending edge of `kind` starting at `start`.
    pub fn find(&self, kind: JumpKind, start: usize) -> Option<usize> {
        self.edges.iter().position(|e| e.kind == kind && e.start == start && !e.done)
    }

    /// Indices of every pending edge of `kind`, in registration order.
    pub fn pending(&self, kind: JumpKind) -> Vec<usize> {
        self.edges
            .iter()
            .enumerate()
            .filter(|(_, e)| e.kind == kind && !e.done)
            .map(|(i, _)| i)
            .collect()
    }

    /// Indices of pending conditional and unconditional edges, conditionals first.
    pub fn pending_branches(&self) -> Vec<usize> {
        let mut out = self.pending(JumpKind::If);
        out.extend(self.pending(JumpKind::Jump));
        out
    }

    /// Catch edges, consumed or not.
    pub fn catches(&self) -> impl Iterator<Item = &JumpEdge> {
        self.edges.iter().filter(|e| e.kind == JumpKind::Catch)
    }

    pub fn mark_done(&mut self, idx: usize) {
        self.edges[idx].done = true;
    }
}
