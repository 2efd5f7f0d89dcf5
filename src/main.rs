use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use sable::lang::tokenizer::{dump, tokenize};
use sable::lang::{CompileError, Compilation, format_error};

const USAGE: &str = "Usage: sable <input.sb> [-o <path>] [-tokenize] [--help]

  -o <path>    write assembly to <path> (default: <input>.asm, e.g. prog.sb.asm)
  -tokenize    print the token stream and exit
  --help       show this message";

struct Options {
    input: PathBuf,
    output: Option<PathBuf>,
    tokenize: bool,
    notes: Vec<String>,
}

fn parse_args(args: &[String]) -> Option<Options> {
    let mut input = None;
    let mut output = None;
    let mut tokenize = false;
    let mut notes = Vec::new();

    let mut iter = args.iter().skip(1).peekable();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                println!("{USAGE}");
                process::exit(0);
            }
            "-tokenize" => tokenize = true,
            "-o" => match iter.next_if(|next| !next.starts_with('-')) {
                Some(path) => output = Some(PathBuf::from(path)),
                None => notes.push("-o given without a path, using the default".to_string()),
            },
            other if input.is_none() => input = Some(PathBuf::from(other)),
            other => notes.push(format!("ignoring extra argument '{other}'")),
        }
    }

    Some(Options {
        input: input?,
        output,
        tokenize,
        notes,
    })
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let Some(opts) = parse_args(&args) else {
        eprintln!("{USAGE}");
        process::exit(2);
    };
    for note in &opts.notes {
        eprintln!("info: {note}");
    }

    let source = match fs::read_to_string(&opts.input) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to read {}: {e}", opts.input.display());
            process::exit(1);
        }
    };

    if opts.tokenize {
        match tokenize(&source) {
            Ok(tokens) => {
                println!("{}", dump(&tokens));
                process::exit(0);
            }
            Err(e) => {
                eprintln!("{}", format_error(&source, &CompileError::from(e)));
                process::exit(1);
            }
        }
    }

    let mut comp = Compilation::new();
    let result = comp.compile_unit(&source, Some(opts.input.as_path()));
    for diag in &comp.diagnostics {
        eprintln!("info: {diag}");
    }
    if let Err(e) = result {
        eprintln!("{}", render(&source, &e));
        process::exit(1);
    }

    let out_path = opts.output.unwrap_or_else(|| default_output(&opts.input));
    if let Err(e) = fs::write(&out_path, comp.output()) {
        eprintln!("Failed to write {}: {e}", out_path.display());
        process::exit(1);
    }
}

/// `prog.sb` compiles to `prog.sb.asm` next to it.
fn default_output(input: &Path) -> PathBuf {
    let mut path = input.as_os_str().to_owned();
    path.push(".asm");
    PathBuf::from(path)
}

/// Errors inside an imported unit are shown against that unit's source.
fn render(source: &str, err: &CompileError) -> String {
    match err {
        CompileError::Import {
            path,
            line,
            source: inner,
        } => {
            let imported = fs::read_to_string(path).unwrap_or_default();
            format!(
                "{}\n  in {} (imported at line {line})",
                render(&imported, inner),
                path.display()
            )
        }
        _ => format_error(source, err),
    }
}
