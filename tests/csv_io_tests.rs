use std::fs;

use fehlerreport_csv::{fix_csv_file, parse_records, read_records, read_rows, write_records, write_rows, CsvError, Settings, CSV_HEADER};

fn header_row() -> Vec<String> {
    CSV_HEADER.iter().map(|h| h.to_string()).collect()
}

#[test]
fn records_round_trip_through_csv() {
    let lines: Vec<String> = vec![
        "PPS_DB_VPLUS1new_20240301.pdf Jane Doe 123456 KC2-BL001".into(),
        "ARMANDA_25new.pdf O'Neil \"Quote\" 42 AB-1".into(),
    ];
    let settings = Settings { merchant: "Semi;Colon GmbH".into(), ..Settings::default() };
    let records = parse_records(&lines, &settings);
    assert_eq!(records.len(), 2);

    let td = tempfile::tempdir().unwrap();
    let out = td.path().join("out.csv");
    let n = write_records(&records, &out, b';').expect("write ok");
    assert_eq!(n, 2);

    let rows = read_rows(&out, b';').unwrap();
    assert_eq!(rows[0], header_row());
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.len() == 19));
    assert_eq!(rows[1][2], "Semi;Colon GmbH");

    let back = read_records(&out, b';').unwrap();
    assert_eq!(back, records);
}

#[test]
fn values_are_quoted_only_when_needed() {
    let td = tempfile::tempdir().unwrap();
    let out = td.path().join("q.csv");
    let mut row = vec![String::new(); 19];
    row[0] = "REJECTED".into();
    row[7] = "a;b".into();
    write_rows(vec![row], &out, b';').unwrap();

    let raw = fs::read_to_string(&out).unwrap();
    let mut lines = raw.split("\r\n");
    assert_eq!(lines.next().unwrap(), CSV_HEADER.join(";"));
    assert_eq!(lines.next().unwrap(), "REJECTED;;;;;;;\"a;b\";;;;;;;;;;;");
}

#[test]
fn header_is_written_even_without_records() {
    let td = tempfile::tempdir().unwrap();
    let out = td.path().join("nested/dir/empty.csv");
    assert_eq!(write_records(&[], &out, b';').unwrap(), 0);
    let rows = read_rows(&out, b';').unwrap();
    assert_eq!(rows, vec![header_row()]);
}

#[test]
fn fix_csv_replaces_header_and_realigns_rows() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("in.csv");
    let dst = td.path().join("fixed.csv");

    let full: Vec<String> = (0..19).map(|i| format!("c{}", i)).collect();
    let input = format!(
        "old;header;only\n{}\nA;B;C;D;E;F;G;H;I;X;99999999-2024-01-01;Y\nR;\"quoted;value\";M\n",
        full.join(";")
    );
    fs::write(&src, input).unwrap();

    let n = fix_csv_file(&src, &dst, b';').expect("fix ok");
    assert_eq!(n, 3);

    let rows = read_rows(&dst, b';').unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0], header_row());
    assert_eq!(rows[1], full);

    assert_eq!(&rows[2][..9], &["A", "B", "C", "D", "E", "F", "G", "H", "I"]);
    assert_eq!(rows[2][13], "99999999-2024-01-01");
    assert_eq!(rows[2][15], "99999999-2024-01-01");
    assert_eq!(rows[2][16], "Y");

    assert_eq!(rows[3][1], "quoted;value");
    assert_eq!(rows[3][15], "quoted;value");
    assert_eq!(rows[3][16], "M");
    assert!(rows.iter().all(|r| r.len() == 19));
}

#[test]
fn fix_csv_header_only_input_writes_header() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("in.csv");
    let dst = td.path().join("out.csv");
    fs::write(&src, "STATUS;END TO END ID\n").unwrap();
    assert_eq!(fix_csv_file(&src, &dst, b';').unwrap(), 0);
    assert_eq!(read_rows(&dst, b';').unwrap(), vec![header_row()]);
}

#[test]
fn missing_input_is_read_failure() {
    let td = tempfile::tempdir().unwrap();
    let err = fix_csv_file(&td.path().join("absent.csv"), &td.path().join("out.csv"), b';').unwrap_err();
    assert!(matches!(err, CsvError::ReadFailed(_)));
    assert!(!td.path().join("out.csv").exists());
}

#[test]
fn custom_delimiter_is_honoured() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("in.csv");
    let dst = td.path().join("out.csv");
    fs::write(&src, "h\nS,E,M\n").unwrap();
    fix_csv_file(&src, &dst, b',').unwrap();
    let raw = fs::read_to_string(&dst).unwrap();
    assert!(raw.starts_with("STATUS,END TO END ID,MERCHANT,"));
    let rows = read_rows(&dst, b',').unwrap();
    assert_eq!(rows[1][0], "S");
    assert_eq!(rows[1][15], "E");
    assert_eq!(rows[1][16], "M");
}

#[test]
fn blank_lines_become_empty_rows() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("in.csv");
    fs::write(&src, "h\nA;B\n\nC;D\n").unwrap();
    let rows = read_rows(&src, b';').unwrap();
    let expected: Vec<Vec<String>> = vec![vec!["h".into()], vec!["A".into(), "B".into()], vec![], vec!["C".into(), "D".into()]];
    assert_eq!(rows, expected);

    fs::write(&src, "\r\nh\r\nA\r\n\r\n\r\nB\r\n\r\n").unwrap();
    let rows = read_rows(&src, b';').unwrap();
    let widths: Vec<usize> = rows.iter().map(|r| r.len()).collect();
    assert_eq!(widths, vec![0, 1, 1, 0, 0, 1, 0]);
}

#[test]
fn blank_line_inside_quoted_field_is_not_a_row() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("in.csv");
    fs::write(&src, "h\n\"multi\n\nline\";x\nB\n").unwrap();
    let rows = read_rows(&src, b';').unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[1], vec!["multi\n\nline".to_string(), "x".to_string()]);
}

#[test]
fn fix_csv_keeps_blank_rows_as_empty_records() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("in.csv");
    let dst = td.path().join("out.csv");
    fs::write(&src, "h\nA;B\n\nC;D\n").unwrap();
    assert_eq!(fix_csv_file(&src, &dst, b';').unwrap(), 3);

    let rows = read_rows(&dst, b';').unwrap();
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|r| r.len() == 19));
    assert_eq!(rows[1][15], "A");
    assert!(rows[2].iter().all(|v| v.is_empty()));
    assert_eq!(rows[3][16], "D");
}

#[cfg(unix)]
#[test]
fn output_mode_follows_umask() {
    use std::os::unix::fs::PermissionsExt;

    let td = tempfile::tempdir().unwrap();
    let plain = td.path().join("plain.txt");
    fs::write(&plain, "x").unwrap();
    let out = td.path().join("out.csv");
    write_records(&[], &out, b';').unwrap();

    let mode = |p: &std::path::Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode(&out), mode(&plain));
}

#[test]
fn failed_write_leaves_no_temp_file() {
    let td = tempfile::tempdir().unwrap();
    let out = td.path().join("taken");
    fs::create_dir_all(out.join("child")).unwrap();
    let err = write_rows(Vec::<Vec<String>>::new(), &out, b';').unwrap_err();
    assert!(matches!(err, CsvError::WriteFailed(_)));
    let names: Vec<String> = fs::read_dir(td.path()).unwrap().map(|e| e.unwrap().file_name().to_string_lossy().into_owned()).collect();
    assert_eq!(names, vec!["taken".to_string()]);
}
