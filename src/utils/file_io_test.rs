use std::fs;
use std::io::Write;

use tempfile::tempdir;

use super::file_io::open_file_for_append;
use crate::Error;
use crate::SystemError;

#[test]
fn test_open_file_for_append_creates_missing_parents() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("svc-a").join("fleet.log");

    let mut file = open_file_for_append(&path).unwrap();
    writeln!(file, "first").unwrap();
    drop(file);
    let mut file = open_file_for_append(&path).unwrap();
    writeln!(file, "second").unwrap();

    assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");
}

#[test]
fn test_open_file_for_append_reports_io_error() {
    let dir = tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    fs::write(&blocker, b"").unwrap();

    let result = open_file_for_append(&blocker.join("fleet.log"));

    assert!(matches!(result, Err(Error::System(SystemError::IoError(_)))));
}
