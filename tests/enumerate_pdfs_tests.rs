use std::fs;
use std::path::PathBuf;

use fehlerreport_csv::{enumerate_pdfs, EnumerateError};

#[test]
fn enumerate_pdfs_lists_top_level_pdfs_sorted() {
    let td = tempfile::tempdir().unwrap();
    let base = td.path();
    fs::write(base.join("b_20240301.pdf"), b"%PDF-1.4\n").unwrap();
    fs::write(base.join("A_20240201.PDF"), b"%PDF-1.4\n").unwrap();
    fs::write(base.join("notes.txt"), b"not a pdf").unwrap();
    fs::create_dir_all(base.join("nested")).unwrap();
    fs::write(base.join("nested/deep.pdf"), b"%PDF-1.4\n").unwrap();
    fs::create_dir_all(base.join("folder.pdf")).unwrap();

    let files = enumerate_pdfs(base).expect("should find files");
    let files: Vec<PathBuf> = files.into_iter().map(|p| p.strip_prefix(base).unwrap().to_path_buf()).collect();
    assert_eq!(files, vec![PathBuf::from("A_20240201.PDF"), PathBuf::from("b_20240301.pdf")]);
}

#[test]
fn enumerate_pdfs_empty_dir_is_no_files_found() {
    let td = tempfile::tempdir().unwrap();
    fs::write(td.path().join("report.csv"), b"x").unwrap();
    let err = enumerate_pdfs(td.path()).err().expect("should be error");
    assert_eq!(format!("{}", err), "NoFilesFound");
    match err {
        EnumerateError::NoFilesFound { dir } => assert_eq!(dir, td.path().display().to_string()),
    }
}
