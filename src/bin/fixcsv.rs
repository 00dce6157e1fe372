use std::path::PathBuf;

use clap::Parser;
use fehlerreport_csv::{fix_csv_file, load_settings, CsvError, Settings};

/// Realign a drifted semicolon export onto the 19-column rejection layout.
#[derive(Debug, Parser)]
#[command(name = "fixcsv", version)]
struct Args {
    input: PathBuf,
    output: PathBuf,
    /// YAML settings file (delimiter)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    // clap exits with status 2 on a usage error
    let args = Args::parse();

    let settings = match &args.config {
        Some(path) => match load_settings(path) {
            Ok(s) => s,
            Err(e) => {
                eprintln!(
                    "{}",
                    serde_json::json!({
                        "tool": "load_settings",
                        "file": path.display().to_string(),
                        "error": e.to_string(),
                        "error_code": 3
                    })
                );
                std::process::exit(3);
            }
        },
        None => Settings::default(),
    };

    if !args.input.exists() {
        eprintln!("Input not found: {}", args.input.display());
        std::process::exit(1);
    }

    match fix_csv_file(&args.input, &args.output, settings.delimiter_byte()) {
        Ok(rows) => {
            eprintln!(
                "{}",
                serde_json::json!({
                    "tool":"fix_csv",
                    "file": args.input.display().to_string(),
                    "out": args.output.display().to_string(),
                    "rows": rows
                })
            );
        }
        Err(err) => {
            let code = match err {
                CsvError::ReadFailed(_) => 1,
                CsvError::WriteFailed(_) => 6,
            };
            eprintln!(
                "{}",
                serde_json::json!({
                    "tool":"fix_csv",
                    "file": args.input.display().to_string(),
                    "error": err.to_string(),
                    "error_code": code
                })
            );
            std::process::exit(code);
        }
    }
}
