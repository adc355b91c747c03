use std::path::{Component, Path};

use crate::UploadError;

/// Validates a file name given to [`File::rename`](crate::File::rename).
///
/// Rejects:
/// - Empty or whitespace-only names
/// - Path separators (`/` or `\`)
/// - `.` and `..`
/// - Control characters
pub fn validate_file_name(name: &str) -> Result<(), UploadError> {
    if name.trim().is_empty() {
        return Err(UploadError::InvalidName("empty name".into()));
    }

    if name.contains(['/', '\\']) {
        return Err(UploadError::InvalidName(format!(
            "path separators not allowed: {name}"
        )));
    }

    if name.chars().any(char::is_control) {
        return Err(UploadError::InvalidName(format!(
            "control characters not allowed: {name:?}"
        )));
    }

    match Path::new(name).components().next() {
        Some(Component::Normal(_)) => Ok(()),
        _ => Err(UploadError::InvalidName(format!(
            "not a plain file name: {name}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        assert!(validate_file_name("report.pdf").is_ok());
        assert!(validate_file_name("archive.tar.gz").is_ok());
        assert!(validate_file_name("notes (final).txt").is_ok());
        assert!(validate_file_name(".hidden").is_ok());
    }

    #[test]
    fn rejects_empty_name() {
        assert!(validate_file_name("").is_err());
        assert!(validate_file_name("   ").is_err());
    }

    #[test]
    fn rejects_separators() {
        assert!(validate_file_name("sub/file.txt").is_err());
        assert!(validate_file_name("sub\\file.txt").is_err());
    }

    #[test]
    fn rejects_dot_components() {
        assert!(validate_file_name("..").is_err());
        assert!(validate_file_name(".").is_err());
    }

    #[test]
    fn rejects_control_characters() {
        assert!(validate_file_name("bad\nname").is_err());
    }
}
