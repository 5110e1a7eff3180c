//! Command line of the external transfer tool.

use crate::state::{Endpoint, TransferOptions};

/// Arguments for `<program> mirror <flags> <source> <destination>`.
pub fn mirror_args(
    options: &TransferOptions,
    source: &Endpoint,
    destination: &Endpoint,
) -> Vec<String> {
    let mut args = vec!["mirror".to_string()];

    if options.overwrite {
        args.push("--overwrite".to_string());
    }
    if options.remove {
        args.push("--remove".to_string());
    }
    for pattern in &options.exclude {
        args.push("--exclude".to_string());
        args.push(pattern.clone());
    }
    if let Some(alg) = options.checksum.as_deref().filter(|a| !a.is_empty()) {
        args.push("--checksum".to_string());
        args.push(alg.to_string());
    }
    if options.preserve {
        args.push("--preserve".to_string());
    }
    if options.retry {
        args.push("--retry".to_string());
    }
    if options.dry_run {
        args.push("--dry-run".to_string());
    }
    if options.watch {
        args.push("--watch".to_string());
    }

    args.push(source.to_string());
    args.push(destination.to_string());
    args
}

/// Shell-style rendering for logs.
pub fn display_command(program: &str, args: &[String]) -> String {
    let mut out = program.to_string();
    for arg in args {
        out.push(' ');
        if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || c == '*' || c == '?') {
            out.push('\'');
            out.push_str(&arg.replace('\'', "'\\''"));
            out.push('\'');
        } else {
            out.push_str(arg);
        }
    }
    out
}
