use std::fs::create_dir_all;
use std::fs::File;
use std::fs::OpenOptions;
use std::path::Path;

use crate::Result;
use crate::SystemError;

/// Opens `path` for appending, creating it and any missing parent directory.
pub fn open_file_for_append(path: &Path) -> Result<File> {
    if let Some(parent_dir) = path.parent() {
        if !parent_dir.exists() {
            create_dir_all(parent_dir).map_err(SystemError::IoError)?;
        }
    }
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .map_err(SystemError::IoError)?;
    Ok(file)
}
