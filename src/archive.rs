//! Encrypted and banned-content detection for assembled archives
//!
//! Only the first volume of a RAR set is opened. Listing and password tests run
//! on the blocking pool since both `unrar` and `zip` do synchronous file I/O.

use crate::error::{Error, Result};
use crate::utils::extension_of;
use async_trait::async_trait;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Extensions that never hide a password hint
const MEDIA_EXTENSIONS: &[&str] = &[
    "mkv", "avi", "mp4", "m4v", "mov", "wmv", "mpg", "mpeg", "ts", "vob", "mp3", "flac", "m4a",
    "aac", "ogg", "jpg", "jpeg", "png", "gif", "srt", "sub", "idx", "nfo",
];

/// Supported container formats
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveKind {
    Rar,
    Zip,
}

/// Format of `name` when it is the volume to inspect: `.zip`, a plain `.rar`,
/// or the first `.partNN.rar`. Later volumes and `.rNN` return `None`.
pub fn inspectable_kind(name: &str) -> Option<ArchiveKind> {
    match extension_of(name).as_deref() {
        Some("zip") => Some(ArchiveKind::Zip),
        Some("rar") => {
            let stem = name[..name.len() - 4].to_ascii_lowercase();
            match stem.rsplit_once(".part") {
                Some((_, num)) if !num.is_empty() && num.chars().all(|c| c.is_ascii_digit()) => {
                    (num.trim_start_matches('0') == "1").then_some(ArchiveKind::Rar)
                }
                _ => Some(ArchiveKind::Rar),
            }
        }
        _ => None,
    }
}

/// Member names and whether any member (or the header block) is encrypted
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArchiveListing {
    pub encrypted: bool,
    pub members: Vec<String>,
}

/// Result of checking one assembled archive
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    /// No known password opens it (or it is cloaked)
    pub encrypted: bool,
    /// Looks like a disguised encrypted post
    pub cloaked: bool,
    /// Password that opened it
    pub password: Option<String>,
    /// First member with a banned extension
    pub unwanted: Option<String>,
}

/// Archive access seam
#[async_trait]
pub trait ArchiveInspector: Send + Sync {
    /// List members without extracting anything
    async fn list(&self, path: &Path) -> Result<ArchiveListing>;

    /// Does `password` open the archive
    async fn try_password(&self, path: &Path, password: &str) -> Result<bool>;
}

/// Inspector backed by `unrar` and `zip`
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalArchiveInspector;

#[async_trait]
impl ArchiveInspector for LocalArchiveInspector {
    async fn list(&self, path: &Path) -> Result<ArchiveListing> {
        let path = path.to_path_buf();
        blocking(move || match kind_of(&path)? {
            ArchiveKind::Rar => list_rar(&path),
            ArchiveKind::Zip => list_zip(&path),
        })
        .await
    }

    async fn try_password(&self, path: &Path, password: &str) -> Result<bool> {
        let path = path.to_path_buf();
        let password = password.to_string();
        blocking(move || match kind_of(&path)? {
            ArchiveKind::Rar => Ok(rar_password_ok(&path, &password)),
            ArchiveKind::Zip => zip_password_ok(&path, &password),
        })
        .await
    }
}

async fn blocking<T: Send + 'static>(f: impl FnOnce() -> Result<T> + Send + 'static) -> Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Other(format!("archive task failed: {e}")))?
}

fn kind_of(path: &Path) -> Result<ArchiveKind> {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    match extension_of(name).as_deref() {
        Some("zip") => Ok(ArchiveKind::Zip),
        Some("rar") => Ok(ArchiveKind::Rar),
        _ => Err(Error::Other(format!("not an archive: {}", path.display()))),
    }
}

fn is_password_error(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("password") || message.contains("encrypted")
}

fn list_rar(path: &Path) -> Result<ArchiveListing> {
    let listing = match unrar::Archive::new(path).open_for_listing_split() {
        Ok(listing) => listing,
        // header-encrypted: nothing is visible without the password
        Err(e) if is_password_error(&e.to_string()) => {
            return Ok(ArchiveListing {
                encrypted: true,
                members: Vec::new(),
            });
        }
        Err(e) => {
            return Err(Error::Other(format!(
                "cannot open {}: {e}",
                path.display()
            )));
        }
    };

    let mut out = ArchiveListing::default();
    for header in listing {
        let header = match header {
            Ok(header) => header,
            Err(e) if is_password_error(&e.to_string()) => {
                out.encrypted = true;
                break;
            }
            Err(e) => {
                return Err(Error::Other(format!(
                    "cannot list {}: {e}",
                    path.display()
                )));
            }
        };
        if header.is_encrypted() {
            out.encrypted = true;
        }
        if !header.is_directory() {
            out.members.push(header.filename.to_string_lossy().into_owned());
        }
    }
    Ok(out)
}

fn rar_password_ok(path: &Path, password: &str) -> bool {
    let Ok(mut cursor) = unrar::Archive::with_password(path, password.as_bytes()).open_for_processing()
    else {
        return false;
    };
    loop {
        let entry = match cursor.read_header() {
            Ok(Some(entry)) => entry,
            Ok(None) => return true,
            Err(_) => return false,
        };
        if entry.entry().is_directory() {
            match entry.skip() {
                Ok(next) => cursor = next,
                Err(_) => return false,
            }
            continue;
        }
        // one file is enough: a wrong password fails its CRC
        return entry.test().is_ok();
    }
}

fn open_zip(path: &Path) -> Result<zip::ZipArchive<std::fs::File>> {
    let file = std::fs::File::open(path)?;
    zip::ZipArchive::new(file)
        .map_err(|e| Error::Other(format!("cannot open {}: {e}", path.display())))
}

/// Index of the first entry that needs a password
fn first_encrypted_zip_entry(archive: &mut zip::ZipArchive<std::fs::File>) -> Option<usize> {
    (0..archive.len()).find(|&i| match archive.by_index(i) {
        Ok(_) => false,
        Err(e) => is_password_error(&e.to_string()),
    })
}

fn list_zip(path: &Path) -> Result<ArchiveListing> {
    let mut archive = open_zip(path)?;
    let members = archive
        .file_names()
        .filter(|n| !n.ends_with('/'))
        .map(str::to_string)
        .collect();
    Ok(ArchiveListing {
        encrypted: first_encrypted_zip_entry(&mut archive).is_some(),
        members,
    })
}

fn zip_password_ok(path: &Path, password: &str) -> Result<bool> {
    let mut archive = open_zip(path)?;
    let Some(index) = first_encrypted_zip_entry(&mut archive) else {
        return Ok(true);
    };
    match archive.by_index_decrypt(index, password.as_bytes()) {
        Ok(Ok(mut entry)) => {
            // the header check byte lets 1 in 256 wrong passwords through; the CRC does not
            let mut sink = Vec::new();
            Ok(entry.read_to_end(&mut sink).is_ok())
        }
        Ok(Err(_invalid)) => Ok(false),
        Err(e) => Err(Error::Other(format!(
            "cannot read {}: {e}",
            path.display()
        ))),
    }
}

fn base_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(name)
        .to_lowercase()
}

/// Archive name without volume and archive extensions (`show.part01.rar` -> `show`)
fn volume_stem(name: &str) -> String {
    let mut stem = base_name(name);
    for suffix in [".rar", ".zip", ".7z"] {
        if let Some(s) = stem.strip_suffix(suffix) {
            stem = s.to_string();
            break;
        }
    }
    if let Some((head, num)) = stem.rsplit_once(".part")
        && !num.is_empty()
        && num.chars().all(|c| c.is_ascii_digit())
    {
        stem = head.to_string();
    }
    stem
}

/// Disguised encrypted post: the only member is another archive with nearly
/// the same name, or some non-media member advertises a password.
pub fn is_cloaked(archive_name: &str, members: &[String]) -> bool {
    if let [only] = members {
        let member = base_name(only);
        let is_archive = matches!(
            extension_of(&member).as_deref(),
            Some("rar") | Some("zip") | Some("7z")
        );
        if is_archive {
            let outer = volume_stem(archive_name);
            let inner = volume_stem(&member);
            let (long, short) = if outer.len() >= inner.len() {
                (&outer, &inner)
            } else {
                (&inner, &outer)
            };
            if !short.is_empty() && long.starts_with(short.as_str()) && long.len() - short.len() < 8
            {
                return true;
            }
        }
    }
    members.iter().any(|m| {
        let name = base_name(m);
        name.contains("password")
            && !extension_of(&name).is_some_and(|ext| MEDIA_EXTENSIONS.contains(&ext.as_str()))
    })
}

/// First member whose extension is banned
pub fn find_unwanted(members: &[String], banned: &[String]) -> Option<String> {
    members
        .iter()
        .find(|m| {
            extension_of(m)
                .is_some_and(|ext| banned.iter().any(|b| b.trim_start_matches('.').eq_ignore_ascii_case(&ext)))
        })
        .cloned()
}

/// Check one assembled archive: banned members, then passwords in order.
/// The first password that works is recorded in the report.
pub async fn check_archive(
    inspector: &dyn ArchiveInspector,
    path: &Path,
    passwords: &[String],
    banned: &[String],
) -> Result<ArchiveReport> {
    let listing = inspector.list(path).await?;
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let mut report = ArchiveReport {
        unwanted: find_unwanted(&listing.members, banned),
        ..Default::default()
    };

    if listing.encrypted {
        for password in passwords.iter().filter(|p| !p.is_empty()) {
            if inspector.try_password(path, password).await? {
                debug!(archive = %name, "archive password found");
                report.password = Some(password.clone());
                break;
            }
        }
        report.encrypted = report.password.is_none();
    } else if is_cloaked(name, &listing.members) {
        report.encrypted = true;
        report.cloaked = true;
    }
    Ok(report)
}

/// Paths of the archives in `files` worth inspecting
pub fn inspectable(workdir: &Path, files: &[String]) -> Vec<PathBuf> {
    files
        .iter()
        .filter(|f| inspectable_kind(f).is_some())
        .map(|f| workdir.join(f))
        .collect()
}
