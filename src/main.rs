// CLI entrypoint for sbasm.

use std::process;

use clap::Parser;
use serde_json::json;

use sbasm::assembler::{run_with_cli, Cli, OutputFormat};
use sbasm::error::{Diagnostic, Severity};

fn severity_to_str(severity: Severity) -> &'static str {
    match severity {
        Severity::Warning => "warning",
        Severity::Error => "error",
    }
}

fn format_diagnostic_line(
    diag: &Diagnostic,
    source_lines: Option<&[String]>,
    use_color: bool,
    format: OutputFormat,
) -> String {
    if format == OutputFormat::Json {
        json!({
            "severity": severity_to_str(diag.severity()),
            "message": diag.message(),
            "file": diag.file(),
            "line": diag.line(),
            "column": diag.column(),
        })
        .to_string()
    } else {
        diag.format_with_context(source_lines, use_color)
    }
}

fn emit_diagnostics(
    diagnostics: &[Diagnostic],
    source_lines: &[String],
    use_color: bool,
    format: OutputFormat,
) {
    for diag in diagnostics {
        eprintln!(
            "{}",
            format_diagnostic_line(diag, Some(source_lines), use_color, format)
        );
    }
}

fn main() {
    let cli = Cli::parse();
    let use_color = std::env::var("NO_COLOR").is_err();

    match run_with_cli(&cli) {
        Ok(reports) => {
            if cli.quiet {
                return;
            }
            for report in &reports {
                emit_diagnostics(
                    report.diagnostics(),
                    report.source_lines(),
                    use_color,
                    cli.format,
                );
            }
        }
        Err(err) => {
            emit_diagnostics(err.diagnostics(), err.source_lines(), use_color, cli.format);
            if cli.format != OutputFormat::Json {
                eprintln!("{err}");
            }
            process::exit(1);
        }
    }
}
