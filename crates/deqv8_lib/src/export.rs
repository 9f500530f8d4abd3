use std::fmt::Write;

use crate::OutputFormat;
use crate::function::{FunctionRecord, FunctionRegistry};

/// Renders every function of `registry` in registry order.
pub fn render_all(registry: &FunctionRegistry, format: OutputFormat) -> String {
    let mut out = String::new();
    for func in registry.iter() {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&render_function(func, format));
    }
    out
}

pub fn render_function(func: &FunctionRecord, format: OutputFormat) -> String {
    let mut out = format!("function {}({})\n", func.name, func.parameter_names().join(", "));
    let labelled = format.selected() > 1;

    if format.raw {
        if labelled {
            out.push_str("// raw\n");
        }
        for line in func.code.iter() {
            let Some(offset) = line.offset else { continue };
            let _ = writeln!(out, "@ {offset} : {} {}", line.opcode, line.instruction);
        }
    }
    if format.translated {
        if labelled {
            out.push_str("// translated\n");
        }
        let mut depth = 0usize;
        for line in func.code.iter() {
            let text = line.translated.trim();
            if text.is_empty() {
                continue;
            }
            if text == "}" {
                depth = depth.saturating_sub(1);
            }
            let _ = writeln!(out, "{}{text}", "\t".repeat(depth));
            if text == "{" {
                depth += 1;
            }
        }
    }
    if format.decompiled {
        if labelled {
            out.push_str("// decompiled\n");
        }
        for line in func.code.iter().filter(|l| l.visible && !l.decompiled.is_empty()) {
            out.push_str(&line.decompiled);
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::CodeLine;

    fn function() -> FunctionRecord {
        let mut f = FunctionRecord::new(None);
        f.name = "func_start_0x10".into();
        f.argument_count = 2;
        let mut ldar = CodeLine::new(0, "0b 03", "Ldar a0");
        ldar.translated = "ACCU = a0".into();
        ldar.decompiled = "\tACCU = a0".into();
        ldar.visible = false;
        let mut ret = CodeLine::new(2, "aa", "Return");
        ret.translated = "return ACCU".into();
        ret.decompiled = "\treturn a0".into();
        let mut open = CodeLine::synthetic("{");
        open.decompiled = "{".into();
        let mut close = CodeLine::synthetic("}");
        close.decompiled = "}".into();
        f.code = vec![open, ldar, CodeLine::placeholder(1), ret, close];
        f
    }

    #[test]
    fn decompiled_only_has_no_section_labels() {
        let out = render_function(&function(), OutputFormat::default());
        assert_eq!(out, "function func_start_0x10(a0)\n{\n\treturn a0\n}\n");
    }

    #[test]
    fn every_section_is_labelled_when_several_are_selected() {
        let format = OutputFormat { raw: true, translated: true, decompiled: true };
        let out = render_function(&function(), format);
        let expected = "function func_start_0x10(a0)\n\
            // raw\n\
            @ 0 : 0b 03 Ldar a0\n\
            @ 1 :  // placeholder\n\
            @ 2 : aa Return\n\
            // translated\n\
            {\n\
            \tACCU = a0\n\
            \treturn ACCU\n\
            }\n\
            // decompiled\n\
            {\n\
            \treturn a0\n\
            }\n";
        assert_eq!(out, expected);
    }

    #[test]
    fn functions_are_separated_by_a_blank_line() {
        let mut reg = FunctionRegistry::new();
        let mut a = FunctionRecord::new(None);
        a.name = "func_a".into();
        let mut b = FunctionRecord::new(None);
        b.name = "func_b".into();
        reg.insert(a);
        reg.insert(b);
        assert_eq!(render_all(&reg, OutputFormat::default()), "function func_a()\n\nfunction func_b()\n");
    }
}
