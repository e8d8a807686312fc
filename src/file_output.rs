//! Output-file handling for the driver's `--out` path.

use crate::compiler::compiler_errors::CompileError;
use std::fs;
use std::path::Path;

/// Write serialized WAT text to a file, creating parent directories.
pub fn write_wat_file(path: &Path, wat_text: &str) -> Result<(), CompileError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|error| CompileError::file_error(parent, error.to_string()))?;
        }
    }
    fs::write(path, wat_text).map_err(|error| CompileError::file_error(path, error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_into_fresh_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/nested/program.wat");
        write_wat_file(&path, "(module)").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "(module)");
    }
}
