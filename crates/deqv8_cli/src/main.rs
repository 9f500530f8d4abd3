use std::path::Path;

use clap::{CommandFactory, Parser};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, DecompileCommand, TopLevel};

mod cli;

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn decompile_file(path: &Path, output: Option<&Path>, format: &str) -> Result<(), String> {
    let format = deqv8_lib::OutputFormat::parse_list(format).map_err(|e| e.to_string())?;
    let text = deqv8_lib::read_dump(path).map_err(|e| e.to_string())?;
    let options = deqv8_lib::DecompileOptions { format, source_name: Some(path.display().to_string()) };

    let mut decompiler = deqv8_lib::Decompiler::new(options);
    let (out, summary) = decompiler.run(&text);
    info!(parsed = summary.parsed, decompiled = summary.decompiled, failed = summary.failed, "done");

    match output {
        Some(dest) => {
            std::fs::write(dest, out).map_err(|e| format!("failed to write {dest:?}: {e}"))?;
            info!(path = %dest.display(), "exported");
        }
        None => print!("{out}"),
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Some(TopLevel::Decompile { command }) => match command {
            DecompileCommand::File { path, output, format } => {
                if let Err(e) = decompile_file(&path, output.as_deref(), &format) {
                    error!("{e}");
                    std::process::exit(1);
                }
            }
        },
        Some(TopLevel::Completion { shell }) => {
            let mut cmd = Cli::command();
            let bin_name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
        }
        None => {
            let _ = Cli::command().print_help();
        }
    }
}
