use tracing::trace;

use crate::function::FunctionRecord;
use crate::jumps::{JumpEdge, JumpKind, JumpTable};
use crate::opcodes::{OpcodeTable, Operation};

/// Fills in `translated` for every instruction the table knows and collects
/// the jump edges those instructions register.
///
/// Exception regions are registered first, one edge per protected region
/// running from its start to its handler.
pub fn translate_function(func: &mut FunctionRecord, table: &dyn OpcodeTable) -> JumpTable {
    let mut jumps = JumpTable::new();
    for range in func.exception_table.values() {
        jumps.add(JumpEdge::new(JumpKind::Exception, range.start, range.handler));
    }

    let FunctionRecord { name, const_pool, code, .. } = func;
    for line in code.iter_mut() {
        let Some(offset) = line.offset else { continue };
        if line.is_placeholder() {
            continue;
        }
        let inst = line.instruction.trim();
        let (mnemonic, operands) = match inst.split_once(char::is_whitespace) {
            Some((m, rest)) => (m, rest.trim()),
            None => (inst, ""),
        };
        if !mnemonic.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
            continue;
        }
        let mut op = Operation::new(offset, operands, const_pool, &mut jumps);
        match table.translate(mnemonic, &mut op) {
            Some(text) => line.translated = text,
            None => trace!(function = %name, offset, mnemonic, "unknown opcode left untranslated"),
        }
    }
    jumps
}
