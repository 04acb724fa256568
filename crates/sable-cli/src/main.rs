//! Sable command-line driver
//!
//! Reads a rewritten program tree, runs the code generator and writes
//! the assembly. Warnings and errors go to stderr with severity colors;
//! a failed compilation exits non-zero and leaves no output file.

use anyhow::{Context, Result};
use clap::Parser;
use sable_compiler::{CompileError, CompileOptions, Compiler, Warning};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

#[derive(Parser)]
#[command(name = "sable")]
#[command(about = "Sable ahead-of-time compiler", long_about = None)]
#[command(version)]
struct Cli {
    /// Input tree file
    input: PathBuf,

    /// Output assembly file (defaults to the input with a .s extension)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Annotate the assembly with source positions
    #[arg(short = 'g', long)]
    debug_info: bool,

    /// Entry-point label
    #[arg(long, default_value = "main")]
    entry: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let file_name = cli.input.display().to_string();
    let source = fs::read_to_string(&cli.input)
        .with_context(|| format!("cannot read {}", file_name))?;
    let program = sable_sexpr::parse(&source, &file_name)?;

    let options = CompileOptions {
        debug_info: cli.debug_info,
        entry: cli.entry.clone(),
    };
    let output_path = cli
        .output
        .clone()
        .unwrap_or_else(|| cli.input.with_extension("s"));

    let file = fs::File::create(&output_path)
        .with_context(|| format!("cannot create {}", output_path.display()))?;
    let mut out = BufWriter::new(file);

    match Compiler::new(options).compile(&program, &mut out) {
        Ok(warnings) => {
            out.flush()
                .with_context(|| format!("cannot write {}", output_path.display()))?;
            for warning in &warnings {
                print_warning(warning)?;
            }
            Ok(())
        }
        Err(err) => {
            drop(out);
            let _ = fs::remove_file(&output_path);
            print_error(&err)?;
            std::process::exit(1);
        }
    }
}

fn print_warning(warning: &Warning) -> Result<()> {
    let mut stderr = StandardStream::stderr(ColorChoice::Auto);
    stderr.set_color(ColorSpec::new().set_fg(Some(Color::Yellow)).set_bold(true))?;
    write!(stderr, "warning")?;
    stderr.reset()?;
    match warning.pos() {
        Some(pos) => writeln!(stderr, ": {} ({})", warning, pos)?,
        None => writeln!(stderr, ": {}", warning)?,
    }
    Ok(())
}

fn print_error(err: &CompileError) -> Result<()> {
    let mut stderr = StandardStream::stderr(ColorChoice::Auto);
    stderr.set_color(ColorSpec::new().set_fg(Some(Color::Red)).set_bold(true))?;
    write!(stderr, "error")?;
    stderr.reset()?;
    writeln!(stderr, ": {}", err)?;
    Ok(())
}
