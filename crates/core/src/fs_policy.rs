//! Path policy for file attachments.
//!
//! Attachment names are caller-controlled and end up joined under a working
//! directory inside the sandbox, so they must be validated against path
//! traversal and absolute paths before use.

use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// Validate an attachment name as a safe relative path.
///
/// Rejects absolute paths (POSIX and Windows-style) and any `..` that would
/// escape the working directory; `.` components are dropped. Returns the
/// normalized relative path.
pub fn validate_attachment_name(name: &str) -> Result<PathBuf> {
    if name.is_empty() {
        return Err(Error::validation("file name must not be empty"));
    }

    // Windows-style absolute path, rejected on any host OS.
    if name.len() >= 2 && name.as_bytes()[1] == b':' && name.as_bytes()[0].is_ascii_alphabetic() {
        return Err(Error::validation(format!(
            "file name '{}' must be a relative path",
            name
        )));
    }

    let mut normalized = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(c) => normalized.push(c),
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(Error::validation(format!(
                        "file name '{}' traverses outside the working directory",
                        name
                    )));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::validation(format!(
                    "file name '{}' must be a relative path",
                    name
                )));
            }
            Component::CurDir => {}
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(Error::validation(format!(
            "file name '{}' resolves to nothing",
            name
        )));
    }

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert_eq!(
            validate_attachment_name("data.csv").unwrap(),
            PathBuf::from("data.csv")
        );
        assert_eq!(
            validate_attachment_name("inputs/run1.json").unwrap(),
            PathBuf::from("inputs/run1.json")
        );
        assert_eq!(
            validate_attachment_name("./notes.txt").unwrap(),
            PathBuf::from("notes.txt")
        );
    }

    #[test]
    fn test_traversal_rejected() {
        assert!(validate_attachment_name("../etc/passwd").is_err());
        assert!(validate_attachment_name("a/../../b").is_err());
    }

    #[test]
    fn test_absolute_rejected() {
        assert!(validate_attachment_name("/etc/passwd").is_err());
        assert!(validate_attachment_name("C:\\Windows\\system.ini").is_err());
    }

    #[test]
    fn test_degenerate_rejected() {
        assert!(validate_attachment_name("").is_err());
        assert!(validate_attachment_name(".").is_err());
    }
}
