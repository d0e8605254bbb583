use std::fs;
use std::path::PathBuf;
use std::process::exit;

use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

use minicc_core::{ast, codegen, interpret, Target};

#[derive(Debug, StructOpt)]
#[structopt(name = "minicc", about = "Compiler for a tiny integer-only C subset")]
struct Opt {
    /// Source file to compile
    #[structopt(parse(from_os_str))]
    input: PathBuf,

    /// Output target: x86_64-linux, x86_64-windows, aarch64, or bytecode
    #[structopt(short, long, default_value = "x86_64-linux")]
    target: Target,

    /// Write here instead of stdout
    #[structopt(short, long, parse(from_os_str))]
    output: Option<PathBuf>,

    /// Run the program in the interpreter and exit with its return value
    #[structopt(long)]
    interpret: bool,

    /// Disable constant folding
    #[structopt(long)]
    no_fold: bool,

    /// Dump the parsed (and validated) tree instead of compiling
    #[structopt(long)]
    print_ast: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::from_args();
    exit(run(&opt));
}

fn run(opt: &Opt) -> i32 {
    let source = match fs::read_to_string(&opt.input) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("minicc: cannot read {}: {}", opt.input.display(), err);
            return 1;
        }
    };
    let name = opt
        .input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "program".to_string());

    let program = match minicc_core::frontend(&source, &name, !opt.no_fold) {
        Ok(program) => program,
        Err(err) => {
            eprintln!("minicc: {err}");
            return 1;
        }
    };

    if opt.print_ast {
        print!("{}", ast::dump(&program));
        return 0;
    }

    if opt.interpret {
        return match interpret::interpret(&program) {
            Ok(value) => value,
            Err(err) => {
                eprintln!("minicc: {err}");
                1
            }
        };
    }

    let text = match codegen::generate(&program, opt.target) {
        Ok(text) => text,
        Err(err) => {
            eprintln!("minicc: {err}");
            return 1;
        }
    };

    match &opt.output {
        Some(path) => {
            if let Err(err) = fs::write(path, text) {
                eprintln!("minicc: cannot write {}: {}", path.display(), err);
                return 1;
            }
        }
        None => print!("{text}"),
    }
    0
}
