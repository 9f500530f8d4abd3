//! Disassembly parser.
//!
//! Two passes over the dump: [`LiteralArrays::collect`] indexes every
//! `FixedArray` block by address, then [`Parser`] walks the
//! `SharedFunctionInfo` blocks and fills the [`FunctionRegistry`].
//! Nested blocks are parsed recursively and stored flat; the parent only
//! keeps the nested function's identity in its constant pool.

use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::Deqv8Error;
use crate::cursor::LineCursor;
use crate::function::{CodeLine, FunctionRecord, FunctionRegistry, HandlerRange, MAX_CODE_OFFSET, MAX_DECLARED_LEN};

static FIXED_ARRAY_ADDR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^((?:0x)?[0-9a-fA-F]+):\s*\[FixedArray\]").unwrap());
static FIXED_ARRAY_LEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-\s*length:\s*(\d+)\s*$").unwrap());
static FIXED_ARRAY_SINGLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)\s*:\s*(-?\d+)\s*$").unwrap());
static FIXED_ARRAY_RANGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)\s*-\s*(\d+)\s*:\s*(-?\d+)\s*$").unwrap());

static OUTER_SCOPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bouter scope info:\s*(0x[0-9a-fA-F]+)").unwrap());
static SCOPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bscope info:\s*(0x[0-9a-fA-F]+)").unwrap());
static FUNCTION_ADDR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\S+):\s*\[(?:SharedFunctionInfo|BytecodeArray)\]").unwrap());
static PARAMETER_COUNT: Lazy<Regex> = Lazy::new(|| Regex::new(r"Parameter count\s+(\d+)").unwrap());
static REGISTER_COUNT: Lazy<Regex> = Lazy::new(|| Regex::new(r"Register count\s+(\d+)").unwrap());
static POOL_SIZE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Constant pool\s*\(size\s*=\s*(\d+)\)").unwrap());
static POOL_RANGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)\s*-\s*(\d+)\s*:\s*(.+)$").unwrap());
static POOL_SINGLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)\s*:\s*(0x[0-9a-fA-F]+\s+)?(.+)$").unwrap());
static INLINE_FIXED_ARRAY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(0x[0-9a-fA-F]+)\s*<FixedArray\[\d+\]>").unwrap());
static HANDLER_SIZE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Handler Table\s*\(size\s*=\s*(\d+)\)").unwrap());
static HANDLER_ENTRY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(\s*(\d+)\s*,\s*(\d+)\s*\)\s*->\s*(\d+)").unwrap());
static BYTECODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^@]*@\s*(\d+)\s*:\s*((?:[0-9a-fA-F]{2}\s+)*)([A-Za-z_][\w.]*.*)$").unwrap()
});
static BYTECODE_OFFSET: Lazy<Regex> = Lazy::new(|| Regex::new(r"@\s*(\d+)").unwrap());

const FUNCTION_BLOCK: &str = "SharedFunctionInfo";
const SKIPPED_BLOCKS: [&str; 3] = ["ObjectBoilerplateDescription", "ArrayBoilerplateDescription", "FixedArray"];

fn parse_address(addr: &str) -> Option<u64> {
    let s = addr.trim().to_ascii_lowercase();
    let s = s.strip_prefix("0x").unwrap_or(&s);
    if s.is_empty() {
        return Some(0);
    }
    u64::from_str_radix(s, 16).ok()
}

/// Every `FixedArray` block of the dump, by address. Only integer elements
/// are kept; missing indices read as zero.
#[derive(Debug, Clone, Default)]
pub struct LiteralArrays {
    arrays: HashMap<u64, Vec<i64>>,
}

impl LiteralArrays {
    pub fn collect(text: &str) -> Self {
        let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        let mut arrays = HashMap::new();
        let mut i = 0;
        while i < lines.len() {
            if lines[i] != "Start FixedArray" {
                i += 1;
                continue;
            }
            i += 1;
            let Some((at, addr)) = (i..(i + 3).min(lines.len()))
                .find_map(|j| FIXED_ARRAY_ADDR.captures(lines[j]).map(|c| (j, c[1].to_string())))
            else {
                debug!(line = i + 1, "FixedArray block without address skipped");
                i = skip_to_end(&lines, i);
                continue;
            };
            i = at + 1;
            let Some(len_at) = (i..lines.len())
                .take_while(|&j| lines[j] != "End FixedArray")
                .find(|&j| FIXED_ARRAY_LEN.is_match(lines[j]))
            else {
                i = skip_to_end(&lines, i);
                continue;
            };
            let length: usize = FIXED_ARRAY_LEN
                .captures(lines[len_at])
                .and_then(|c| c[1].parse().ok())
                .unwrap_or(0);
            if length > MAX_DECLARED_LEN {
                warn!(line = len_at + 1, length, "FixedArray length out of range, block skipped");
                i = skip_to_end(&lines, len_at);
                continue;
            }
            let mut values = vec![0i64; length];
            let mut j = len_at + 1;
            while j < lines.len() && lines[j] != "End FixedArray" {
                if let Some(c) = FIXED_ARRAY_RANGE.captures(lines[j]) {
                    if let (Ok(s), Ok(e), Ok(v)) = (c[1].parse::<usize>(), c[2].parse::<usize>(), c[3].parse::<i64>()) {
                        for slot in values.iter_mut().take(e.saturating_add(1)).skip(s) {
                            *slot = v;
                        }
                    }
                } else if let Some(c) = FIXED_ARRAY_SINGLE.captures(lines[j]) {
                    if let (Ok(idx), Ok(v)) = (c[1].parse::<usize>(), c[2].parse::<i64>()) {
                        if let Some(slot) = values.get_mut(idx) {
                            *slot = v;
                        }
                    }
                }
                j += 1;
            }
            if let Some(addr) = parse_address(&addr) {
                arrays.insert(addr, values);
            }
            i = j + 1;
        }
        Self { arrays }
    }

    pub fn get(&self, addr: &str) -> Option<&[i64]> {
        self.arrays.get(&parse_address(addr)?).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    /// The array referenced by `text` (`0x… <FixedArray[n]>`) as a literal.
    fn inline(&self, text: &str) -> Option<String> {
        let caps = INLINE_FIXED_ARRAY.captures(text)?;
        let values = self.get(&caps[1])?;
        let items: Vec<String> = values.iter().map(i64::to_string).collect();
        Some(format!("[{}]", items.join(", ")))
    }
}

fn skip_to_end(lines: &[&str], from: usize) -> usize {
    let mut i = from;
    while i < lines.len() && lines[i] != "End FixedArray" {
        i += 1;
    }
    i + 1
}

fn quote_string(value: &str) -> String {
    let t = value.trim().trim_end_matches('>');
    let t = match t.split_once('#') {
        Some((_, rest)) => rest.trim(),
        None => t.split_once(':').map_or(t, |(_, rest)| rest.trim()),
    };
    format!("\"{}\"", t.replace('"', "\\\""))
}

fn is_pool_sibling(line: &str) -> bool {
    line.starts_with("Start BytecodeArray")
        || line.starts_with("Handler Table")
        || line.starts_with("Source Position Table")
        || line == "End SharedFunctionInfo"
}

pub struct Parser<'a> {
    cursor: LineCursor,
    arrays: &'a LiteralArrays,
    registry: &'a mut FunctionRegistry,
    source: Option<&'a str>,
}

impl<'a> Parser<'a> {
    pub fn new(text: &str, arrays: &'a LiteralArrays, registry: &'a mut FunctionRegistry) -> Self {
        Self { cursor: LineCursor::new(text), arrays, registry, source: None }
    }

    /// Name of the input, used in diagnostics.
    pub fn with_source(mut self, source: Option<&'a str>) -> Self {
        self.source = source;
        self
    }

    /// Parses every top-level function block; returns their identities.
    pub fn parse_all(mut self) -> Vec<String> {
        let mut roots = Vec::new();
        while let Some(line) = self.cursor.next_line() {
            if line == "Start SharedFunctionInfo" {
                roots.push(self.parse_function("start", None));
            }
        }
        roots
    }

    fn next_owned(&mut self) -> Option<String> {
        self.cursor.next_line().map(str::to_string)
    }

    fn malformed(&self, what: &str, text: &str) -> Deqv8Error {
        Deqv8Error::Malformed { what: what.to_string(), line: self.cursor.line_number(), text: text.to_string() }
    }

    /// Parses the block after a `Start SharedFunctionInfo` line. The record
    /// is stored even when parsing fails part way.
    fn parse_function(&mut self, label: &str, declarer: Option<&str>) -> String {
        let mut record = FunctionRecord::new(declarer);
        if let Err(err) = self.parse_function_body(&mut record, label) {
            warn!(
                source = self.source.unwrap_or("<input>"),
                line = self.cursor.line_number(),
                function = %record.name,
                error = %err,
                "keeping partial function record\n{}",
                self.cursor.context()
            );
            if !matches!(err, Deqv8Error::UnexpectedEof(_)) {
                self.cursor.skip_block(FUNCTION_BLOCK);
            }
        }
        record.normalize_code();
        debug!(function = %record.name, lines = record.code.len(), consts = record.const_pool.len(), "function parsed");
        let name = record.name.clone();
        self.registry.insert(record);
        name
    }

    fn parse_function_body(&mut self, record: &mut FunctionRecord, label: &str) -> Result<(), Deqv8Error> {
        loop {
            let Some(line) = self.next_owned() else {
                return Err(Deqv8Error::UnexpectedEof(FUNCTION_BLOCK));
            };
            if line == "End SharedFunctionInfo" {
                return Ok(());
            }
            if let Some(c) = OUTER_SCOPE.captures(&line) {
                record.outer_scope_info = Some(c[1].to_string());
                continue;
            }
            if let Some(c) = SCOPE.captures(&line) {
                record.scope_info = Some(c[1].to_string());
                continue;
            }
            if line == "Start SharedFunctionInfo" {
                let nested = format!("nested_{}", self.registry.len());
                let declarer = record.name.clone();
                self.parse_function(&nested, Some(&declarer));
                continue;
            }
            if let Some(kind) = line.strip_prefix("Start ").filter(|k| SKIPPED_BLOCKS.contains(k)) {
                let kind = kind.to_string();
                self.cursor.skip_block(&kind);
                continue;
            }
            if line.contains("Parameter count") {
                record.argument_count = self.count(&PARAMETER_COUNT, &line, "parameter count")?;
                continue;
            }
            if line.contains("Register count") {
                record.register_count = self.count(&REGISTER_COUNT, &line, "register count")?;
                continue;
            }
            if line.contains("Constant pool") {
                record.const_pool = self.parse_const_pool(&line, &record.name)?;
                continue;
            }
            if line.contains("Handler Table") {
                record.exception_table = self.parse_handler_table(&line)?;
                continue;
            }
            if BYTECODE.is_match(&line) {
                record.code = self.parse_bytecode(line)?;
                continue;
            }
            if line.contains("[SharedFunctionInfo]") || line.contains("[BytecodeArray]") {
                let caps = FUNCTION_ADDR.captures(&line).ok_or_else(|| self.malformed("function address", &line))?;
                if record.address.is_none() {
                    let label = if label.is_empty() { "unknown" } else { label };
                    record.name = format!("func_{label}_{}", &caps[1]);
                    record.address = Some(caps[1].to_string());
                }
            }
        }
    }

    fn count(&self, re: &Regex, line: &str, what: &str) -> Result<usize, Deqv8Error> {
        re.captures(line)
            .and_then(|c| c[1].parse().ok())
            .ok_or_else(|| self.malformed(what, line))
    }

    /// Reads entries until all `size` slots are assigned or a sibling marker
    /// shows up; the line that ends the pool is pushed back.
    fn parse_const_pool(&mut self, header: &str, owner: &str) -> Result<Vec<String>, Deqv8Error> {
        let size: usize = self.count(&POOL_SIZE, header, "constant pool size")?;
        if size > MAX_DECLARED_LEN {
            return Err(self.malformed("constant pool size", header));
        }
        let mut pool: Vec<Option<String>> = vec![None; size];
        let mut assigned = 0;
        while size > 0 {
            let Some(line) = self.next_owned() else { break };
            if assigned >= size || is_pool_sibling(&line) {
                self.cursor.push_back();
                break;
            }
            if line == "Start SharedFunctionInfo" {
                let nested = format!("nested_{}", self.registry.len());
                self.parse_function(&nested, Some(owner));
                continue;
            }
            if let Some(kind) = line.strip_prefix("Start ").filter(|k| SKIPPED_BLOCKS.contains(k)) {
                let kind = kind.to_string();
                self.cursor.skip_block(&kind);
                continue;
            }
            if let Some(c) = POOL_RANGE.captures(&line) {
                let (Ok(from), Ok(to)) = (c[1].parse::<usize>(), c[2].parse::<usize>()) else { continue };
                let value = c[3].trim();
                for slot in pool.iter_mut().take(to.saturating_add(1)).skip(from) {
                    if slot.is_none() {
                        *slot = Some(value.to_string());
                        assigned += 1;
                    }
                }
                continue;
            }
            if let Some(c) = POOL_SINGLE.captures(&line) {
                let Ok(idx) = c[1].parse::<usize>() else { continue };
                if !matches!(pool.get(idx), Some(None)) {
                    continue;
                }
                let addr = c.get(2).map(|m| m.as_str().trim().to_string());
                let value = c[3].trim().to_string();
                pool[idx] = Some(self.classify_constant(addr.as_deref(), &value, owner));
                assigned += 1;
            }
        }
        Ok(pool.into_iter().map(Option::unwrap_or_default).collect())
    }

    fn classify_constant(&mut self, addr: Option<&str>, value: &str, owner: &str) -> String {
        let Some(addr) = addr else {
            return value.to_string();
        };
        if value.starts_with("<String") {
            return quote_string(value);
        }
        let referenced = format!("{addr} {value}");
        if let Some(inline) = self.arrays.inline(&referenced) {
            return inline;
        }
        if value.starts_with("<SharedFunctionInfo") {
            // Only a block that follows immediately belongs to this entry.
            match self.cursor.next_line().map(|l| l == "Start SharedFunctionInfo") {
                Some(true) => {
                    let label = value.split_once(' ').map_or("", |(_, l)| l.trim_end_matches(['>', ' ']));
                    return self.parse_function(label, Some(owner));
                }
                Some(false) => self.cursor.push_back(),
                None => {}
            }
            let short = match value.split_once(' ') {
                Some(_) => value.split_whitespace().last().unwrap_or("unknown").trim_end_matches('>'),
                None => "unknown",
            };
            return format!("func_ref_{short}");
        }
        if value.starts_with("<ArrayBoilerplateDescription") || value.starts_with("<FixedArray") {
            return "[]".to_string();
        }
        if value.starts_with("<ObjectBoilerplateDescription") {
            return "{}".to_string();
        }
        if value.starts_with("<Odd") {
            return "null".to_string();
        }
        let trimmed = value.trim_end_matches('>');
        trimmed.split_once(' ').map_or(trimmed, |(_, rest)| rest).to_string()
    }

    fn parse_handler_table(&mut self, header: &str) -> Result<BTreeMap<usize, HandlerRange>, Deqv8Error> {
        let mut table = BTreeMap::new();
        if self.count(&HANDLER_SIZE, header, "handler table size")? == 0 {
            return Ok(table);
        }
        // Column header line.
        if let Some(line) = self.cursor.next_line() {
            if line.contains("->") {
                self.cursor.push_back();
            }
        }
        while let Some(line) = self.next_owned() {
            if !line.contains("->") {
                self.cursor.push_back();
                break;
            }
            let c = HANDLER_ENTRY.captures(&line).ok_or_else(|| self.malformed("handler table entry", &line))?;
            let parse = |i: usize| c[i].parse::<usize>().map_err(|_| self.malformed("handler table entry", &line));
            let range = HandlerRange { start: parse(1)?, end: parse(2)?, handler: parse(3)? };
            table.insert(range.start, range);
        }
        Ok(table)
    }

    /// Consumes contiguous bytecode lines starting with `first`.
    fn parse_bytecode(&mut self, first: String) -> Result<Vec<CodeLine>, Deqv8Error> {
        let mut code = Vec::new();
        let mut current = Some(first);
        while let Some(line) = current.take() {
            if !line.contains('@') {
                self.cursor.push_back();
                break;
            }
            let parsed = match BYTECODE.captures(&line) {
                Some(c) => c[1].parse().ok().map(|offset| CodeLine::new(offset, c[2].trim(), c[3].trim())),
                None => match BYTECODE_OFFSET.captures(&line).and_then(|c| c[1].parse().ok()) {
                    Some(offset) => Some(CodeLine::new(offset, "", &format!("// placeholder: {line}"))),
                    None => {
                        self.cursor.push_back();
                        break;
                    }
                },
            };
            if let Some(parsed) = parsed {
                if parsed.offset.is_some_and(|o| o > MAX_CODE_OFFSET) {
                    return Err(self.malformed("bytecode offset", &line));
                }
                code.push(parsed);
            }
            current = self.next_owned();
        }
        Ok(code)
    }
}
