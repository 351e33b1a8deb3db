//! Filesystem and naming helpers

use std::path::{Path, PathBuf};

/// Free bytes available to unprivileged users on the filesystem holding `path`
pub fn get_available_space(path: &Path) -> std::io::Result<u64> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: c_path is NUL-terminated and `stat` is only read after statvfs succeeds.
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            #[allow(clippy::unnecessary_cast)]
            Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::fileapi::GetDiskFreeSpaceExW;

        let wide_path: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        // SAFETY: wide_path is NUL-terminated; out pointers refer to live u64 locals.
        unsafe {
            let mut free_bytes_available: u64 = 0;
            let mut total_bytes: u64 = 0;
            let mut total_free_bytes: u64 = 0;
            if GetDiskFreeSpaceExW(
                wide_path.as_ptr(),
                &mut free_bytes_available as *mut u64 as *mut _,
                &mut total_bytes as *mut u64 as *mut _,
                &mut total_free_bytes as *mut u64 as *mut _,
            ) == 0
            {
                return Err(std::io::Error::last_os_error());
            }
            Ok(free_bytes_available)
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = path;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "free-space check not supported on this platform",
        ))
    }
}

/// `ENOSPC` (or the platform's "disk full" code)
pub fn is_disk_full(err: &std::io::Error) -> bool {
    if err.kind() == std::io::ErrorKind::StorageFull {
        return true;
    }
    #[cfg(windows)]
    {
        // ERROR_HANDLE_DISK_FULL, ERROR_DISK_FULL
        matches!(err.raw_os_error(), Some(39) | Some(112))
    }
    #[cfg(not(windows))]
    {
        err.raw_os_error() == Some(28)
    }
}

/// File name from a post subject: the first quoted string, else the first token
/// that looks like `name.ext`, else a stable hash of the subject
pub fn filename_from_subject(subject: &str) -> String {
    if let Some(start) = subject.find('"')
        && let Some(end) = subject[start + 1..].find('"')
    {
        let filename = &subject[start + 1..start + 1 + end];
        if !filename.trim().is_empty() {
            return sanitize_filename(filename);
        }
    }

    let looks_like_file = |token: &&str| {
        token
            .rsplit_once('.')
            .is_some_and(|(stem, ext)| !stem.is_empty() && (1..=5).contains(&ext.len()))
            && !token.starts_with('(')
    };
    if let Some(token) = subject.split_whitespace().find(looks_like_file) {
        return sanitize_filename(token);
    }

    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    subject.hash(&mut hasher);
    format!("file_{:x}", hasher.finish())
}

/// Strip path separators and characters that are illegal on common filesystems
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

/// Lowercased extension without the dot
pub fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Recovery (par2) set member
pub fn is_recovery_file(name: &str) -> bool {
    extension_of(name).as_deref() == Some("par2")
}

/// Container archive the inspector understands: `.rar`, `.r00`..`.r99`, `.zip`
pub fn is_container_archive(name: &str) -> bool {
    match extension_of(name).as_deref() {
        Some("rar") | Some("zip") => true,
        Some(ext) if ext.len() == 3 && ext.starts_with('r') => {
            ext[1..].chars().all(|c| c.is_ascii_digit())
        }
        _ => false,
    }
}

/// `path`, or `path` with a numeric suffix when it already exists
pub fn get_unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file")
        .to_string();
    let ext = path.extension().and_then(|e| e.to_str());
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    (1u32..)
        .map(|n| match ext {
            Some(ext) => parent.join(format!("{stem}.{n}.{ext}")),
            None => parent.join(format!("{stem}.{n}")),
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_subject_wins() {
        assert_eq!(
            filename_from_subject(r#"[1/5] - "movie.part01.rar" yEnc (1/100)"#),
            "movie.part01.rar"
        );
    }

    #[test]
    fn unquoted_subject_uses_first_file_like_token() {
        assert_eq!(
            filename_from_subject("holiday photos.zip yEnc (01/20)"),
            "photos.zip"
        );
    }

    #[test]
    fn subject_without_name_gets_stable_hash() {
        let a = filename_from_subject("no name here");
        let b = filename_from_subject("no name here");
        assert_eq!(a, b);
        assert!(a.starts_with("file_"));
    }

    #[test]
    fn sanitize_removes_separators_and_leading_dots() {
        assert_eq!(sanitize_filename("../etc/passwd"), "_etc_passwd");
        assert_eq!(sanitize_filename("a:b?.txt"), "a_b_.txt");
        assert_eq!(sanitize_filename("..."), "unnamed");
    }

    #[test]
    fn archive_and_recovery_classification() {
        assert!(is_container_archive("x.rar"));
        assert!(is_container_archive("x.R07"));
        assert!(is_container_archive("x.zip"));
        assert!(!is_container_archive("x.rtf"));
        assert!(is_recovery_file("x.vol00+01.PAR2"));
        assert!(!is_recovery_file("x.nfo"));
    }

    #[test]
    fn unique_path_appends_counter() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("a.bin");
        assert_eq!(get_unique_path(&p), p);
        std::fs::write(&p, b"x").unwrap();
        assert_eq!(get_unique_path(&p), dir.path().join("a.1.bin"));
    }

    #[test]
    fn disk_full_matches_enospc() {
        #[cfg(unix)]
        assert!(is_disk_full(&std::io::Error::from_raw_os_error(28)));
        assert!(!is_disk_full(&std::io::Error::from_raw_os_error(2)));
    }

    #[cfg(unix)]
    #[test]
    fn available_space_of_tempdir_is_positive() {
        let dir = tempfile::tempdir().unwrap();
        assert!(get_available_space(dir.path()).unwrap() > 0);
    }
}
