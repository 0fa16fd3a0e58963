//! Command-line surface.
//!
//! The trailing arguments carry two kinds of words: leading non-dash words
//! are box ids, everything from the first dash-word on is passed through to
//! the sandbox tool (`boxlock -l 4 -- --cg`). Options therefore come before
//! positionals; `--` ends option parsing as usual.

use clap::Parser;

const AFTER_HELP: &str = "\
Examples:
  boxlock -l 4 6         acquire locks on box 4 and box 6
  boxlock -f 4 6         release previous locks on box 4 and box 6
  boxlock > box_id.txt   acquire any unused box, saving its id
  boxlock -- --cg        acquire a box, initialising it with --cg
  boxlock -n 4           acquire four boxes, blocking indefinitely
  boxlock -n4 -t=-1      acquire four boxes without blocking";

/// Lock broker for isolate sandbox boxes.
#[derive(Parser, Debug)]
#[command(name = "boxlock", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Acquire locks; prints each acquired box id to stdout (default mode)
    #[arg(short = 'l', long = "lock")]
    pub lock: bool,

    /// Release locks; prints each released box id to stdout
    #[arg(short = 'f', long = "free", conflicts_with = "lock")]
    pub free: bool,

    /// Acquire locks for N boxes (only when no box ids are given)
    #[arg(short = 'n', value_name = "N", default_value_t = 1)]
    pub count: u32,

    /// Timeout in seconds for acquiring N boxes; 0 blocks indefinitely,
    /// negative never blocks
    #[arg(
        short = 't',
        long = "timeout",
        value_name = "T",
        default_value_t = 0.0,
        allow_negative_numbers = true
    )]
    pub timeout: f64,

    /// Do not initialise boxes with the sandbox tool after locking
    #[arg(long = "noinit")]
    pub noinit: bool,

    /// Box ids, then options passed through to the sandbox tool
    #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// Splits the trailing words into `(box ids, pass-through options)`.
#[must_use]
pub fn split_trailing(args: &[String]) -> (&[String], &[String]) {
    let id_end = args
        .iter()
        .position(|arg| arg.starts_with('-'))
        .unwrap_or(args.len());
    args.split_at(id_end)
}
