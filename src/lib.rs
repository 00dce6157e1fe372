use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::NaiveDate;
use globwalk::GlobWalkerBuilder;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DepsResult {
    pub ok: bool,
    pub missing: Vec<String>,
}

/// Check CLI dependencies of the PDF pipeline.
/// - Required: pdftotext (Poppler)
/// - Optional: pdfinfo (per-page extraction)
/// Returns a DepsResult. `ok` is true iff required deps are present.
pub fn check_deps() -> DepsResult {
    let mut missing = Vec::new();

    let has_pdftotext = which::which("pdftotext").is_ok();
    if !has_pdftotext {
        missing.push("pdftotext".to_string());
    }

    // optional
    if which::which("pdfinfo").is_err() {
        missing.push("pdfinfo".to_string());
    }

    DepsResult { ok: has_pdftotext, missing }
}

/// Render apt installation help for missing deps.
pub fn install_help_for(missing: &[String]) -> String {
    if !missing.iter().any(|m| m == "pdftotext" || m == "pdfinfo") {
        return String::new();
    }
    "Dependency missing. Install Poppler:\n  sudo apt install poppler-utils".to_string()
}

#[derive(Debug, Error)]
pub enum EnumerateError {
    #[error("NoFilesFound")]
    NoFilesFound { dir: String },
}

/// List the PDFs directly inside `dir` (extension match is case-insensitive).
/// Returns a sorted list of paths.
pub fn enumerate_pdfs(dir: &Path) -> Result<Vec<PathBuf>, EnumerateError> {
    let no_files = || EnumerateError::NoFilesFound { dir: dir.display().to_string() };
    let mut paths: Vec<PathBuf> = GlobWalkerBuilder::from_patterns(dir, &["*.pdf"])
        .case_insensitive(true)
        .follow_links(false)
        .max_depth(1)
        .build()
        .map_err(|_| no_files())?
        .filter_map(|e| e.ok())
        .map(|e| e.path().to_path_buf())
        .collect();

    paths.retain(|p| p.is_file());
    paths.sort();

    if paths.is_empty() {
        return Err(no_files());
    }

    Ok(paths)
}

pub const DEFAULT_MERCHANT: &str = "PPS Perfunctio Payment Services GmbH";
pub const DEFAULT_DELIMITER: &str = ";";

/// Output settings, optionally loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub merchant: String,
    pub delimiter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self { merchant: DEFAULT_MERCHANT.to_string(), delimiter: DEFAULT_DELIMITER.to_string() }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.merchant.trim().is_empty() {
            return Err(ConfigError::Invalid("merchant must not be blank".into()));
        }
        match self.delimiter.as_bytes() {
            [b'"'] | [b'\r'] | [b'\n'] => Err(ConfigError::Invalid(format!("unusable delimiter {:?}", self.delimiter))),
            [b] if b.is_ascii() => Ok(()),
            _ => Err(ConfigError::Invalid(format!("delimiter must be one ASCII character, got {:?}", self.delimiter))),
        }
    }

    pub fn delimiter_byte(&self) -> u8 {
        self.delimiter.as_bytes().first().copied().unwrap_or(b';')
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(String),
    #[error("Failed to parse config: {0}")]
    Parse(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Read and validate a settings file. Missing keys fall back to the defaults.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    // an empty document deserializes to unit, not to a map
    let settings: Settings = if raw.trim().is_empty() {
        Settings::default()
    } else {
        serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?
    };
    settings.validate()?;
    Ok(settings)
}

#[derive(Debug, Error)]
pub enum PopplerError {
    #[error("FileNotFound: {0}")]
    FileNotFound(String),
    #[error("EncryptedPDF: {0}")]
    EncryptedPDF(String),
    #[error("PopplerError: {0}")]
    Other(String),
}

fn is_encryption_failure(stderr: &[u8]) -> bool {
    let err = String::from_utf8_lossy(stderr).to_lowercase();
    err.contains("encrypt") || err.contains("password")
}

fn page_count(path: &Path) -> Result<Option<usize>, PopplerError> {
    if which::which("pdfinfo").is_err() {
        return Ok(None);
    }
    let out = match Command::new("pdfinfo").arg(path).output() {
        Ok(out) => out,
        Err(_) => return Ok(None),
    };
    if !out.status.success() {
        if is_encryption_failure(&out.stderr) {
            return Err(PopplerError::EncryptedPDF(path.display().to_string()));
        }
        return Ok(None);
    }
    let s = String::from_utf8_lossy(&out.stdout);
    Ok(s.lines()
        .find_map(|line| line.strip_prefix("Pages:"))
        .and_then(|rest| rest.trim().parse::<usize>().ok()))
}

fn run_pdftotext(path: &Path, page: Option<usize>) -> Result<String, PopplerError> {
    let mut cmd = Command::new("pdftotext");
    // keep table rows on one line
    cmd.arg("-layout");
    if let Some(i) = page {
        cmd.arg("-nopgbrk");
        cmd.arg("-f").arg(i.to_string());
        cmd.arg("-l").arg(i.to_string());
    }
    cmd.arg("-q");
    cmd.arg(path);
    cmd.arg("-");

    let out = cmd.output().map_err(|e| PopplerError::Other(e.to_string()))?;
    if !out.status.success() {
        if is_encryption_failure(&out.stderr) {
            return Err(PopplerError::EncryptedPDF(path.display().to_string()));
        }
        return Err(PopplerError::Other(match page {
            Some(i) => format!("pdftotext failed on page {}", i),
            None => "pdftotext failed".into(),
        }));
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// Extract text pages using Poppler's pdftotext in layout mode.
/// Extracts page by page when pdfinfo reports a page count, otherwise runs a
/// single pass and splits on form feeds.
pub fn poppler_extract(path: &Path) -> Result<Vec<String>, PopplerError> {
    if !path.exists() {
        return Err(PopplerError::FileNotFound(path.display().to_string()));
    }

    if let Some(n_pages) = page_count(path)? {
        return (1..=n_pages).map(|i| run_pdftotext(path, Some(i))).collect();
    }

    let text = run_pdftotext(path, None)?;
    let mut pages: Vec<String> = text.split('\u{000C}').map(|x| x.to_string()).collect();
    while matches!(pages.last(), Some(last) if last.trim().is_empty()) {
        pages.pop();
    }
    Ok(pages)
}

/// Flatten pages into trimmed, non-empty lines in reading order.
pub fn text_lines(pages: &[String]) -> Vec<String> {
    pages
        .iter()
        .flat_map(|page| page.lines())
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Extract the text lines of a PDF.
pub fn extract_text_lines(path: &Path) -> Result<Vec<String>, PopplerError> {
    Ok(text_lines(&poppler_extract(path)?))
}

pub const CSV_HEADER: [&str; 19] = [
    "STATUS",
    "END TO END ID",
    "MERCHANT",
    "AMOUNT",
    "DUE DATE",
    "CUSTOMER BIC",
    "CUSTOMER IBAN",
    "CUSTOMER NAME",
    "CUSTOMER ID",
    "ADDITIONAL INFO 1",
    "ADDITIONAL INFO 2",
    "IMPORTED DATE",
    "MANDATE REFERENCE",
    "TRANSACTION INFORMATION",
    "TRANSACTION TYPE NAME",
    "ERROR CODE",
    "ERROR REASON",
    "MERCHANT PRODUCT NAME",
    "HAS CHARGEBACK",
];

/// STATUS through CUSTOMER ID.
pub const STABLE_PREFIX_LEN: usize = 9;
pub const TRANSACTION_INFORMATION_IDX: usize = 13;
pub const ERROR_CODE_IDX: usize = 15;
pub const ERROR_REASON_IDX: usize = 16;

// a single trailing newline is tolerated, as quoted CSV fields may carry one
static MANDATE_LIKE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{6,}-\d{4}-\d{2}-\d{2}\n?$").unwrap());

/// True for `<customerId>-YYYY-MM-DD` shaped values.
pub fn is_mandate_like(value: &str) -> bool {
    MANDATE_LIKE_RE.is_match(value)
}

/// Realign a row into the 19-column layout.
///
/// Rows that already have 19 fields are returned as they are, even if their
/// columns are shifted. Any other width is rebuilt best-effort:
/// - the first 9 fields are copied verbatim;
/// - the first mandate-like value goes to TRANSACTION INFORMATION;
/// - the last two non-empty values go to ERROR CODE / ERROR REASON (a single
///   non-empty value goes to ERROR CODE).
pub fn normalize_row(fields: Vec<String>) -> Vec<String> {
    if fields.len() == CSV_HEADER.len() {
        return fields;
    }

    let mut fixed = vec![String::new(); CSV_HEADER.len()];

    let prefix = fields.len().min(STABLE_PREFIX_LEN);
    fixed[..prefix].clone_from_slice(&fields[..prefix]);

    if let Some(id_date) = fields.iter().find(|v| is_mandate_like(v)) {
        fixed[TRANSACTION_INFORMATION_IDX] = id_date.clone();
    }

    let tail: Vec<&String> = fields.iter().filter(|v| !v.is_empty()).collect();
    match tail.as_slice() {
        [] => {}
        [only] => fixed[ERROR_CODE_IDX] = (*only).clone(),
        [.., code, reason] => {
            fixed[ERROR_CODE_IDX] = (*code).clone();
            fixed[ERROR_REASON_IDX] = (*reason).clone();
        }
    }

    fixed
}

/// One rejected payment, in output column order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "STATUS")]
    pub status: String,
    #[serde(rename = "END TO END ID")]
    pub end_to_end_id: String,
    #[serde(rename = "MERCHANT")]
    pub merchant: String,
    #[serde(rename = "AMOUNT")]
    pub amount: String,
    #[serde(rename = "DUE DATE")]
    pub due_date: String,
    #[serde(rename = "CUSTOMER BIC")]
    pub customer_bic: String,
    #[serde(rename = "CUSTOMER IBAN")]
    pub customer_iban: String,
    #[serde(rename = "CUSTOMER NAME")]
    pub customer_name: String,
    #[serde(rename = "CUSTOMER ID")]
    pub customer_id: String,
    #[serde(rename = "ADDITIONAL INFO 1")]
    pub additional_info_1: String,
    #[serde(rename = "ADDITIONAL INFO 2")]
    pub additional_info_2: String,
    #[serde(rename = "IMPORTED DATE")]
    pub imported_date: String,
    #[serde(rename = "MANDATE REFERENCE")]
    pub mandate_reference: String,
    #[serde(rename = "TRANSACTION INFORMATION")]
    pub transaction_information: String,
    #[serde(rename = "TRANSACTION TYPE NAME")]
    pub transaction_type_name: String,
    #[serde(rename = "ERROR CODE")]
    pub error_code: String,
    #[serde(rename = "ERROR REASON")]
    pub error_reason: String,
    #[serde(rename = "MERCHANT PRODUCT NAME")]
    pub merchant_product_name: String,
    #[serde(rename = "HAS CHARGEBACK")]
    pub has_chargeback: String,
}

impl Record {
    pub fn into_row(self) -> Vec<String> {
        vec![
            self.status,
            self.end_to_end_id,
            self.merchant,
            self.amount,
            self.due_date,
            self.customer_bic,
            self.customer_iban,
            self.customer_name,
            self.customer_id,
            self.additional_info_1,
            self.additional_info_2,
            self.imported_date,
            self.mandate_reference,
            self.transaction_information,
            self.transaction_type_name,
            self.error_code,
            self.error_reason,
            self.merchant_product_name,
            self.has_chargeback,
        ]
    }
}

pub const STATUS_REJECTED: &str = "REJECTED";

/// Known error codes of the report, consulted in order.
pub const ERROR_REASONS: &[(&str, &str)] = &[("KC2-BL001", "User in the Blacklist")];

/// Product names recognised by filename prefix. Checked before the `NNnew` codes.
pub const AMOUNT_BY_PREFIX: &[(&str, &str)] = &[
    ("PPS_DB_VPLUS1new", "54.90"),
    ("PPS_DB_VPLUS2new", "39.90"),
    ("PPS_DB_VPLUS3", "39.90"),
];

pub const AMOUNT_BY_TWO_DIGIT: &[(&str, &str)] = &[("35", "39.90"), ("15", "54.90"), ("25", "54.90")];

static HEADER_LINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Dateiname\s+Name\s+Kundennummer\s+Fehler$").unwrap());
static FILENAME_DATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"20\d{6}").unwrap());
static TWO_DIGIT_NEW_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{2})new").unwrap());
static CUSTOMER_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").unwrap());

fn lookup(table: &[(&str, &'static str)], key: &str) -> Option<&'static str> {
    table.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// Human-readable reason for an error code, if the code is known.
pub fn error_reason_for(code: &str) -> Option<&'static str> {
    lookup(ERROR_REASONS, code)
}

/// First `20YYMMDD` run in a filename.
pub fn find_date_in_filename(filename: &str) -> Option<&str> {
    FILENAME_DATE_RE.find(filename).map(|m| m.as_str())
}

/// `YYYYMMDD` -> `YYYY-MM-01`. None when the digits are not a calendar date.
pub fn first_of_month(yyyymmdd: &str) -> Option<String> {
    let date = NaiveDate::parse_from_str(yyyymmdd, "%Y%m%d").ok()?;
    Some(date.format("%Y-%m-01").to_string())
}

/// Product amount encoded in a filename.
/// Exact product prefixes win over a generic `NNnew` code.
pub fn detect_amount_from_filename(filename: &str) -> Option<&'static str> {
    if let Some((_, amount)) = AMOUNT_BY_PREFIX.iter().find(|(prefix, _)| filename.starts_with(prefix)) {
        return Some(*amount);
    }
    let caps = TWO_DIGIT_NEW_RE.captures(filename)?;
    lookup(AMOUNT_BY_TWO_DIGIT, &caps[1])
}

/// Parse one `<file> <name ...> <customerId> <errorCode>` line.
/// Returns None for noise: fewer than four tokens or a non-numeric customer id.
/// Any Unicode decimal digits count as numeric.
pub fn parse_line(line: &str, merchant: &str) -> Option<Record> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 4 {
        return None;
    }
    let filename = parts[0];
    let error_code = parts[parts.len() - 1];
    let customer_id = parts[parts.len() - 2];
    let customer_name = parts[1..parts.len() - 2].join(" ");

    if !CUSTOMER_ID_RE.is_match(customer_id) {
        return None;
    }

    let transaction_information = match find_date_in_filename(filename).and_then(first_of_month) {
        Some(mandate_date) => format!("{}-{}", customer_id, mandate_date),
        None => customer_id.to_string(),
    };

    Some(Record {
        status: STATUS_REJECTED.to_string(),
        merchant: merchant.to_string(),
        amount: detect_amount_from_filename(filename).unwrap_or_default().to_string(),
        customer_name,
        customer_id: customer_id.to_string(),
        transaction_information,
        error_code: error_code.to_string(),
        error_reason: error_reason_for(error_code).unwrap_or_default().to_string(),
        ..Record::default()
    })
}

/// Turn extracted report lines into records, in input order.
/// A leading `Dateiname Name Kundennummer Fehler` caption is skipped.
pub fn parse_records(lines: &[String], settings: &Settings) -> Vec<Record> {
    let body = match lines.first() {
        Some(first) if HEADER_LINE_RE.is_match(first) => &lines[1..],
        _ => lines,
    };
    body.iter().filter_map(|line| parse_line(line, &settings.merchant)).collect()
}

#[derive(Debug, Error)]
pub enum CsvError {
    #[error("ReadFailed: {0}")]
    ReadFailed(String),
    #[error("WriteFailed: {0}")]
    WriteFailed(String),
}

fn write_failed(e: &dyn std::fmt::Display) -> CsvError {
    CsvError::WriteFailed(e.to_string())
}

fn write_csv_to<F>(path: &Path, delimiter: u8, fill: F) -> Result<usize, CsvError>
where
    F: FnOnce(&mut csv::Writer<std::fs::File>) -> Result<usize, csv::Error>,
{
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .terminator(csv::Terminator::CRLF)
        .has_headers(false)
        .from_path(path)
        .map_err(|e| write_failed(&e))?;
    wtr.write_record(CSV_HEADER).map_err(|e| write_failed(&e))?;
    let count = fill(&mut wtr).map_err(|e| write_failed(&e))?;
    wtr.flush().map_err(|e| write_failed(&e))?;
    Ok(count)
}

/// Write the header and the rows produced by `fill` to `<out_path>.tmp.<pid>`,
/// then rename it into place. The temp file is removed on failure.
fn write_csv_atomic<F>(out_path: &Path, delimiter: u8, fill: F) -> Result<usize, CsvError>
where
    F: FnOnce(&mut csv::Writer<std::fs::File>) -> Result<usize, csv::Error>,
{
    if let Some(dir) = out_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| write_failed(&e))?;
    }

    let mut tmp_name = out_path.as_os_str().to_owned();
    tmp_name.push(format!(".tmp.{}", std::process::id()));
    let tmp_path = PathBuf::from(tmp_name);

    let written = write_csv_to(&tmp_path, delimiter, fill)
        .and_then(|count| std::fs::rename(&tmp_path, out_path).map(|()| count).map_err(|e| write_failed(&e)));
    if written.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    written
}

/// Write a header row followed by `rows`. Returns the number of data rows.
pub fn write_rows<I>(rows: I, out_path: &Path, delimiter: u8) -> Result<usize, CsvError>
where
    I: IntoIterator<Item = Vec<String>>,
{
    write_csv_atomic(out_path, delimiter, |wtr| {
        let mut n = 0;
        for row in rows {
            wtr.write_record(&row)?;
            n += 1;
        }
        Ok(n)
    })
}

/// Write a header row followed by one row per record.
pub fn write_records(records: &[Record], out_path: &Path, delimiter: u8) -> Result<usize, CsvError> {
    write_csv_atomic(out_path, delimiter, |wtr| {
        for rec in records {
            wtr.serialize(rec)?;
        }
        Ok(records.len())
    })
}

fn is_line_break(b: &u8) -> bool {
    *b == b'\r' || *b == b'\n'
}

/// Number of line breaks in a run of `\r`/`\n` bytes; `\r\n` counts once.
fn count_line_breaks(run: &[u8]) -> usize {
    let mut n = 0;
    let mut i = 0;
    while i < run.len() {
        i += if run[i] == b'\r' && run.get(i + 1) == Some(&b'\n') { 2 } else { 1 };
        n += 1;
    }
    n
}

/// Blank lines in the line-break run around byte `at`. The first break of a
/// run closes the preceding record, unless there is none.
fn blank_lines_around(bytes: &[u8], at: usize, after_record: bool) -> usize {
    let at = at.min(bytes.len());
    let start = at - bytes[..at].iter().rev().take_while(|b| is_line_break(b)).count();
    let end = at + bytes[at..].iter().take_while(|b| is_line_break(b)).count();
    let breaks = count_line_breaks(&bytes[start..end]);
    if after_record {
        breaks.saturating_sub(1)
    } else {
        breaks
    }
}

/// Read every row of a delimited file, header included, tolerating ragged widths.
/// A blank line yields an empty row.
pub fn read_rows(path: &Path, delimiter: u8) -> Result<Vec<Vec<String>>, CsvError> {
    let read_failed = |e: &dyn std::fmt::Display| CsvError::ReadFailed(e.to_string());
    let bytes = std::fs::read(path).map_err(|e| read_failed(&e))?;
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes.as_slice());

    // the csv reader drops blank lines, so they are recovered from the byte
    // run preceding each record
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut record = csv::StringRecord::new();
    let mut seen_record = false;
    loop {
        let at = rdr.position().byte() as usize;
        let more = rdr.read_record(&mut record).map_err(|e| read_failed(&e))?;
        let blanks = blank_lines_around(&bytes, at, seen_record);
        rows.extend(std::iter::repeat_with(Vec::new).take(blanks));
        if !more {
            break;
        }
        rows.push(record.iter().map(str::to_string).collect());
        seen_record = true;
    }
    Ok(rows)
}

/// Read records back from a file written by [`write_records`].
pub fn read_records(path: &Path, delimiter: u8) -> Result<Vec<Record>, CsvError> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .from_path(path)
        .map_err(|e| CsvError::ReadFailed(e.to_string()))?;
    rdr.deserialize()
        .map(|r| r.map_err(|e: csv::Error| CsvError::ReadFailed(e.to_string())))
        .collect()
}

/// Repair a drifted export: drop its header, realign every row, write the
/// fixed header and the realigned rows. Returns the number of rows written.
pub fn fix_csv_file(src: &Path, dst: &Path, delimiter: u8) -> Result<usize, CsvError> {
    let rows = read_rows(src, delimiter)?;
    write_rows(rows.into_iter().skip(1).map(normalize_row), dst, delimiter)
}
