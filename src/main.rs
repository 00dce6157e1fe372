use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use fehlerreport_csv::{check_deps, enumerate_pdfs, extract_text_lines, install_help_for, load_settings, parse_records, write_records, CsvError, EnumerateError, PopplerError, Settings};

/// Extract ARMANDA/NETRON Fehlerreport PDFs to CSV.
#[derive(Debug, Parser)]
#[command(name = "fehler2csv", version)]
struct Args {
    /// Path to an input PDF file or a directory containing PDFs
    input: PathBuf,
    /// Output CSV path (single input only)
    #[arg(long)]
    out: Option<PathBuf>,
    /// Directory to write CSVs when processing a directory
    #[arg(long)]
    out_dir: Option<PathBuf>,
    /// Write the extracted text lines here (single input only)
    #[arg(long)]
    dump_text: Option<PathBuf>,
    /// YAML settings file (merchant, delimiter)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
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

    let deps = check_deps();
    if !deps.ok {
        eprintln!(
            "{}",
            serde_json::json!({
                "tool":"check_deps",
                "missing": deps.missing,
                "error_code": 2
            })
        );
        let help = install_help_for(&deps.missing);
        if !help.is_empty() {
            eprintln!("{}", help);
        }
        std::process::exit(2);
    }
    eprintln!(
        "{}",
        serde_json::json!({
            "tool":"check_deps",
            "status":"ok",
            "missing": deps.missing
        })
    );

    if args.input.is_dir() {
        let out_dir = args.out_dir.clone().unwrap_or_else(|| args.input.clone());
        if let Err(e) = fs::create_dir_all(&out_dir) {
            eprintln!(
                "{}",
                serde_json::json!({
                    "tool":"write_records",
                    "file": out_dir.display().to_string(),
                    "error": e.to_string(),
                    "error_code": 6
                })
            );
            std::process::exit(6);
        }
        let files = match enumerate_pdfs(&args.input) {
            Ok(files) => files,
            Err(EnumerateError::NoFilesFound { dir }) => {
                // nothing to convert is not a failure
                eprintln!(
                    "{}",
                    serde_json::json!({
                        "tool":"enumerate_pdfs",
                        "dir": dir,
                        "count": 0
                    })
                );
                Vec::new()
            }
        };
        if !files.is_empty() {
            eprintln!(
                "{}",
                serde_json::json!({
                    "tool":"enumerate_pdfs",
                    "dir": args.input.display().to_string(),
                    "count": files.len()
                })
            );
        }
        for pdf in files {
            let name = pdf.with_extension("csv");
            let out = out_dir.join(name.file_name().unwrap_or(name.as_os_str()));
            process_single(&pdf, &out, None, &settings);
        }
    } else {
        let out = args.out.clone().unwrap_or_else(|| args.input.with_extension("csv"));
        process_single(&args.input, &out, args.dump_text.as_deref(), &settings);
    }
}

fn process_single(pdf: &Path, out: &Path, dump_text: Option<&Path>, settings: &Settings) {
    let lines = match extract_text_lines(pdf) {
        Ok(lines) => lines,
        Err(err) => {
            let label = match err {
                PopplerError::FileNotFound(_) => "FileNotFound",
                PopplerError::EncryptedPDF(_) => "EncryptedPDF",
                PopplerError::Other(_) => "PopplerError",
            };
            eprintln!(
                "{}",
                serde_json::json!({
                    "tool":"poppler_extract",
                    "file": pdf.display().to_string(),
                    "error": label,
                    "detail": err.to_string(),
                    "error_code": 1
                })
            );
            std::process::exit(1);
        }
    };
    eprintln!(
        "{}",
        serde_json::json!({
            "tool":"poppler_extract",
            "file": pdf.display().to_string(),
            "lines": lines.len()
        })
    );

    if let Some(dump_path) = dump_text {
        match fs::write(dump_path, lines.join("\n")) {
            Ok(()) => println!("Wrote text dump to {}", dump_path.display()),
            Err(e) => {
                eprintln!(
                    "{}",
                    serde_json::json!({
                        "tool":"dump_text",
                        "file": dump_path.display().to_string(),
                        "error": e.to_string(),
                        "error_code": 6
                    })
                );
                std::process::exit(6);
            }
        }
    }

    let records = parse_records(&lines, settings);
    eprintln!(
        "{}",
        serde_json::json!({
            "tool":"parse_records",
            "file": pdf.display().to_string(),
            "lines": lines.len(),
            "records": records.len()
        })
    );

    match write_records(&records, out, settings.delimiter_byte()) {
        Ok(n) => println!("Wrote CSV to {} with {} records", out.display(), n),
        Err(CsvError::WriteFailed(e)) | Err(CsvError::ReadFailed(e)) => {
            eprintln!(
                "{}",
                serde_json::json!({
                    "tool":"write_records",
                    "file": out.display().to_string(),
                    "error": e,
                    "error_code": 6
                })
            );
            std::process::exit(6);
        }
    }
}
