use std::path::PathBuf;

use clap::{Parser, Subcommand, builder::{Styles, styling::{AnsiColor, Effects}}, crate_description, crate_name, crate_version};
use clap_complete::Shell;

#[derive(Parser)]
#[command(name = crate_name!(),
    version = crate_version!(),
    about = crate_description!(),
    styles = Styles::styled()
        .header(AnsiColor::BrightGreen.on_default() | Effects::BOLD | Effects::UNDERLINE)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::BrightCyan.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Cyan.on_default()))]
pub struct Cli {
    /// Log every stage (same as RUST_LOG=debug)
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<TopLevel>,
}

#[derive(Subcommand)]
pub enum TopLevel {
    /// Decompiles a V8 bytecode disassembly dump
    Decompile {
        #[command(subcommand)]
        command: DecompileCommand,
    },
    /// Generate shell completion
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum DecompileCommand {
    /// Decompiles a disassembly dump read from a file
    File {
        /// Path to the disassembly dump
        path: PathBuf,

        /// Write the result here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Comma separated sections: decompiled, translated, v8_opcode
        #[arg(long, default_value = "decompiled")]
        format: String,
    },
}
