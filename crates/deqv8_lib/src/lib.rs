use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod cursor;
pub mod export;
pub mod function;
pub mod jump_blocks;
pub mod jumps;
pub mod opcodes;
pub mod parser;
pub mod scope;
pub mod simplify;
pub mod translate;

use crate::function::{FunctionRecord, FunctionRegistry};
use crate::opcodes::{OpcodeTable, TemplateTable};
use crate::parser::{LiteralArrays, Parser};
use crate::scope::ScopeForest;
use crate::simplify::{Simplifier, SlotEnvironment};

/// Which renderings of each function end up in the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFormat {
    /// The parsed instructions (`v8_opcode` in a format list).
    pub raw: bool,
    pub translated: bool,
    pub decompiled: bool,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self { raw: false, translated: false, decompiled: true }
    }
}

impl OutputFormat {
    /// Parses a comma separated list such as `decompiled,translated`. An
    /// empty list selects the decompiled output only.
    pub fn parse_list(list: &str) -> Result<Self, Deqv8Error> {
        let mut format = Self { raw: false, translated: false, decompiled: false };
        let mut any = false;
        for name in list.split(',').map(|s| s.trim().to_ascii_lowercase()).filter(|s| !s.is_empty()) {
            match name.as_str() {
                "v8_opcode" | "raw" => format.raw = true,
                "translated" => format.translated = true,
                "decompiled" => format.decompiled = true,
                _ => {
                    return Err(Deqv8Error::Malformed {
                        what: "output format (decompiled, translated or v8_opcode)".to_string(),
                        line: 0,
                        text: name,
                    });
                }
            }
            any = true;
        }
        Ok(if any { format } else { Self::default() })
    }

    pub fn selected(&self) -> usize {
        [self.raw, self.translated, self.decompiled].into_iter().filter(|b| *b).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DecompileOptions {
    pub format: OutputFormat,
    /// Name of the input, used in diagnostics.
    pub source_name: Option<String>,
}

#[derive(Debug, Error)]
pub enum Deqv8Error {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("expected {what} at line {line}: {text:?}")]
    Malformed { what: String, line: usize, text: String },

    #[error("unexpected end of input inside {0} block")]
    UnexpectedEof(&'static str),

    #[error("unbalanced block in {function}: stopped after {consumed}/{total} lines")]
    UnbalancedBlock { function: String, consumed: usize, total: usize },

    #[error("unknown function: {0}")]
    UnknownFunction(String),
}

/// Counters for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub parsed: usize,
    pub decompiled: usize,
    pub failed: usize,
}

/// State shared by every function of one run.
#[derive(Debug, Default)]
pub struct RunContext {
    pub arrays: LiteralArrays,
    pub registry: FunctionRegistry,
    pub forest: ScopeForest,
    pub slots: SlotEnvironment,
}

impl RunContext {
    pub fn function(&self, name: &str) -> Result<&FunctionRecord, Deqv8Error> {
        self.registry.get(name).ok_or_else(|| Deqv8Error::UnknownFunction(name.to_string()))
    }
}

pub struct Decompiler<'t> {
    options: DecompileOptions,
    table: &'t dyn OpcodeTable,
    context: RunContext,
}

impl Decompiler<'static> {
    pub fn new(options: DecompileOptions) -> Self {
        Self::with_table(options, &TemplateTable)
    }
}

impl<'t> Decompiler<'t> {
    pub fn with_table(options: DecompileOptions, table: &'t dyn OpcodeTable) -> Self {
        Self { options, table, context: RunContext::default() }
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    /// Decompiles a whole dump. Every call starts from an empty context.
    pub fn run(&mut self, text: &str) -> (String, RunSummary) {
        self.context = RunContext { arrays: LiteralArrays::collect(text), ..RunContext::default() };
        debug!(arrays = self.context.arrays.len(), "literal arrays collected");

        let RunContext { arrays, registry, .. } = &mut self.context;
        Parser::new(text, arrays, registry).with_source(self.options.source_name.as_deref()).parse_all();

        let mut summary = RunSummary { parsed: self.context.registry.len(), ..RunSummary::default() };
        info!(functions = summary.parsed, "decompiling");

        self.structure_all();
        self.context.forest = ScopeForest::build(self.context.registry.iter());
        self.bind_scopes();
        let order = self.context.forest.processing_order(&self.context.registry);
        for name in order {
            match self.simplify(&name) {
                Ok(()) => summary.decompiled += 1,
                Err(err) => {
                    warn!(function = %name, error = %err, "failed to decompile");
                    summary.failed += 1;
                    if let Some(func) = self.context.registry.get_mut(&name) {
                        for line in func.code.iter_mut() {
                            line.decompiled = line.translated.clone();
                            line.visible = true;
                        }
                    }
                }
            }
        }

        let out = export::render_all(&self.context.registry, self.options.format);
        (out, summary)
    }

    fn structure_all(&mut self) {
        for name in self.context.registry.names() {
            let Some(func) = self.context.registry.get_mut(&name) else { continue };
            let jumps = translate::translate_function(func, self.table);
            debug!(function = %name, edges = jumps.len(), "translated");
            jump_blocks::reconstruct(&func.name, &mut func.code, jumps);
        }
    }

    /// Binds functions with their own scope info first so that scopeless
    /// functions can borrow a declarer's id regardless of registry order.
    fn bind_scopes(&mut self) {
        let RunContext { registry, forest, .. } = &mut self.context;
        let (own, borrowed): (Vec<&FunctionRecord>, Vec<&FunctionRecord>) =
            registry.iter().partition(|f| f.scope_info.is_some());
        for func in own.into_iter().chain(borrowed) {
            forest.function_scope(registry, &func.name);
        }
    }

    fn simplify(&mut self, name: &str) -> Result<(), Deqv8Error> {
        let RunContext { registry, forest, slots, .. } = &mut self.context;
        let current = forest.function_scope(registry, name);
        let func = registry.get_mut(name).ok_or_else(|| Deqv8Error::UnknownFunction(name.to_string()))?;
        let own = func.scope_info.clone();
        let outer = func.outer_scope_info.clone();
        Simplifier::new(&func.name, &mut func.code, forest, slots)
            .with_scope(own.as_deref(), outer.as_deref(), current)
            .run()
    }
}

/// Reads a dump from disk. Bytes that are not valid UTF-8 are replaced.
pub fn read_dump(path: &Path) -> Result<String, Deqv8Error> {
    let bytes = std::fs::read(path).map_err(|source| Deqv8Error::Io { path: path.to_path_buf(), source })?;
    match String::from_utf8(bytes) {
        Ok(text) => Ok(text),
        Err(err) => {
            warn!(path = %path.display(), "input is not valid UTF-8, decoding lossily");
            Ok(String::from_utf8_lossy(err.as_bytes()).into_owned())
        }
    }
}

pub fn decompile_with_table(text: &str, options: DecompileOptions, table: &dyn OpcodeTable) -> String {
    Decompiler::with_table(options, table).run(text).0
}

pub fn decompile_with_options(text: &str, options: DecompileOptions) -> String {
    Decompiler::new(options).run(text).0
}

pub fn decompile(text: &str) -> String {
    decompile_with_options(text, DecompileOptions::default())
}
