// Host path → container mount path translation
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VolumeError {
    #[error("invalid path format '{path}': {reason}")]
    InvalidPathFormat { path: String, reason: &'static str },
}

/// How host paths are written in a `docker run -v` argument
///
/// - `Identity`: host and container runtime share a path namespace (Linux, macOS)
/// - `DriveLetter`: the runtime wants `/c/Users/...` for `C:\Users\...`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeTranslator {
    Identity,
    DriveLetter,
}

impl VolumeTranslator {
    /// Translator matching the platform this binary was built for
    pub fn for_host() -> Self {
        if cfg!(windows) {
            VolumeTranslator::DriveLetter
        } else {
            VolumeTranslator::Identity
        }
    }

    pub fn translate(&self, path: &str) -> Result<String, VolumeError> {
        match self {
            VolumeTranslator::Identity => Ok(path.to_string()),
            VolumeTranslator::DriveLetter => drive_letter_path(path),
        }
    }

    pub fn translate_path(&self, path: &Path) -> Result<String, VolumeError> {
        let raw = path.to_str().ok_or_else(|| VolumeError::InvalidPathFormat {
            path: path.display().to_string(),
            reason: "path is not valid UTF-8",
        })?;
        self.translate(raw)
    }
}

fn drive_letter_path(path: &str) -> Result<String, VolumeError> {
    let invalid = |reason| VolumeError::InvalidPathFormat {
        path: path.to_string(),
        reason,
    };

    let bytes = path.as_bytes();
    match bytes.first() {
        Some(b) if b.is_ascii_alphabetic() => {}
        _ => return Err(invalid("not a valid disk designator")),
    }
    if bytes.get(1) != Some(&b':') {
        return Err(invalid("missing colon after disk designator"));
    }
    if bytes.get(2) != Some(&b'\\') {
        return Err(invalid("cannot deal with relative paths (backslash expected)"));
    }

    // First three bytes are ASCII, so slicing at 1 and 2 stays on char boundaries
    let drive = path[..1].to_ascii_lowercase();
    Ok(format!("/{}{}", drive, path[2..].replace('\\', "/")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_letter_translation() {
        let t = VolumeTranslator::DriveLetter;
        assert_eq!(t.translate(r"C:\Users\Foo").unwrap(), "/c/Users/Foo");
        assert_eq!(t.translate(r"C:\Users\Foo\Bar.txt").unwrap(), "/c/Users/Foo/Bar.txt");
        assert_eq!(t.translate(r"d:\tmp").unwrap(), "/d/tmp");
        assert_eq!(t.translate(r"C:\").unwrap(), "/c/");
    }

    #[test]
    fn test_drive_letter_rejects_bad_prefix() {
        let t = VolumeTranslator::DriveLetter;
        for bad in [
            "",
            "C",
            "C:",
            r"1:\Users",
            r"[:\Users",
            r"C;\Users",
            "C:/Users/Foo",
            r"C:Users\Foo",
            "/home/foo",
            r"\\server\share",
            r"é:\Users",
        ] {
            match t.translate(bad) {
                Err(VolumeError::InvalidPathFormat { path, .. }) => assert_eq!(path, bad),
                Ok(out) => panic!("expected {:?} to be rejected, got {:?}", bad, out),
            }
        }
    }

    #[test]
    fn test_identity_returns_input() {
        let t = VolumeTranslator::Identity;
        assert_eq!(t.translate("/home/user/tmp/abc").unwrap(), "/home/user/tmp/abc");
        assert_eq!(t.translate(r"C:\Users\Foo").unwrap(), r"C:\Users\Foo");
    }

    #[test]
    fn test_translation_is_deterministic() {
        let t = VolumeTranslator::DriveLetter;
        let path = r"E:\work\run\42";
        assert_eq!(t.translate(path), t.translate(path));
    }

    #[test]
    fn test_host_default() {
        let expected = if cfg!(windows) {
            VolumeTranslator::DriveLetter
        } else {
            VolumeTranslator::Identity
        };
        assert_eq!(VolumeTranslator::for_host(), expected);
    }
}
