use std::env;
use std::fs;
use std::path::{Path, PathBuf};

fn workspace_root(crate_dir: &Path) -> PathBuf {
    crate_dir
        .parent()
        .and_then(|p| p.parent())
        .expect("crate directory should be <root>/crates/<name>")
        .to_path_buf()
}

fn take_until_paren_close(s: &str) -> Option<&str> {
    let s = s.trim();
    let j = s.rfind(')')?;
    Some(s[..j].trim())
}

fn flow_ident(flow: &str) -> Option<&'static str> {
    match flow {
        "none" => Some("None"),
        "if" => Some("If"),
        "jump" => Some("Jump"),
        "loop" => Some("Loop"),
        "receiver" => Some("Receiver"),
        "switch" => Some("Switch"),
        _ => None,
    }
}

fn main() {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let root = workspace_root(&manifest_dir);

    let def_path = root.join("data").join("v8-bytecodes.def");
    println!("cargo:rerun-if-changed={}", def_path.display());

    let def_src = fs::read_to_string(&def_path).expect("read data/v8-bytecodes.def");

    let mut ops: Vec<(String, &'static str, String)> = Vec::new();
    for line in def_src.lines() {
        let l = line.trim();
        let rest = match l.strip_prefix("DEF(") {
            Some(v) => v,
            None => continue,
        };
        let inner = match take_until_paren_close(rest) {
            Some(v) => v,
            None => continue,
        };
        let mut parts = inner.splitn(3, ',');
        let name = parts.next().unwrap_or("").trim().to_string();
        let flow = parts.next().unwrap_or("").trim();
        let template = parts.next().unwrap_or("").trim();
        if name.is_empty() || !template.starts_with('"') || !template.ends_with('"') || template.len() < 2 {
            continue;
        }
        let flow = flow_ident(flow).unwrap_or_else(|| panic!("unknown flow `{flow}` for {name}"));
        let template = template[1..template.len() - 1].to_string();
        ops.push((name, flow, template));
    }
    ops.sort_by(|a, b| a.0.cmp(&b.0));
    ops.dedup_by(|a, b| a.0 == b.0);

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let out_path = out_dir.join("bytecode_tables.rs");

    let mut out = String::new();

    out.push_str("#[derive(Debug, Clone, Copy, PartialEq, Eq)]\n");
    out.push_str("pub enum Flow {\n");
    for f in ["None", "If", "Jump", "Loop", "Receiver", "Switch"] {
        out.push_str(&format!("    {f},\n"));
    }
    out.push_str("}\n\n");

    out.push_str("#[derive(Debug, Clone, Copy)]\n");
    out.push_str("pub struct OpTemplate {\n");
    out.push_str("    pub name: &'static str,\n");
    out.push_str("    pub flow: Flow,\n");
    out.push_str("    pub template: &'static str,\n");
    out.push_str("}\n\n");

    out.push_str("/// Sorted by mnemonic.\n");
    out.push_str("pub const OPCODE_TEMPLATES: &[OpTemplate] = &[\n");
    for (name, flow, template) in &ops {
        out.push_str(&format!(
            "    OpTemplate {{ name: \"{}\", flow: Flow::{}, template: \"{}\" }},\n",
            name,
            flow,
            template.replace('\\', "\\\\").replace('"', "\\\"")
        ));
    }
    out.push_str("];\n");

    fs::write(out_path, out).expect("write generated bytecode tables");
}
