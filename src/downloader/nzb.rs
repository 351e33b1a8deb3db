//! NZB manifest parsing and job intake.

use crate::error::{Error, Result};
use crate::model::{Article, Job, NzbFile, PreQueueResult};
use crate::queue::{resolve_category, resolve_priority};
use crate::types::{JobId, Priority};
use crate::utils::{filename_from_subject, get_unique_path, sanitize_filename};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::Ordering;

use super::UsenetDownloader;
use super::command::Command;

/// Options for adding a job
#[derive(Clone, Debug)]
pub struct AddOptions {
    /// Category tag; overrides the one carried by the manifest
    pub category: Option<String>,
    /// Requested priority; `Default` defers to the pre-queue result and the category
    pub priority: Priority,
    /// Archive password; overrides the one carried by the manifest
    pub password: Option<String>,
    /// Verdict of an external pre-queue script
    pub pre_queue: Option<PreQueueResult>,
    /// Post date, for retention and the propagation delay
    pub posted_at: Option<DateTime<Utc>>,
    /// Add the job paused
    pub paused: bool,
    /// Run the availability pass first; `None` follows the configuration
    pub pre_check: Option<bool>,
}

impl Default for AddOptions {
    fn default() -> Self {
        Self {
            category: None,
            priority: Priority::Default,
            password: None,
            pre_queue: None,
            posted_at: None,
            paused: false,
            pre_check: None,
        }
    }
}

/// A parsed manifest
#[derive(Clone, Debug)]
pub struct Manifest {
    /// `title` meta entry
    pub title: Option<String>,
    /// `password` meta entry
    pub password: Option<String>,
    /// `category` meta entry
    pub category: Option<String>,
    /// Files in manifest order, articles sorted by part number
    pub files: Vec<NzbFile>,
}

/// Parse and validate NZB content.
///
/// File names come from the post subjects; a name that repeats within the
/// manifest gets the file's index appended so every file has its own target.
pub fn parse_manifest(content: &[u8]) -> Result<Manifest> {
    let text = std::str::from_utf8(content)
        .map_err(|e| Error::InvalidNzb(format!("NZB content is not valid UTF-8: {}", e)))?;
    let nzb = nntp_rs::parse_nzb(text)
        .map_err(|e| Error::InvalidNzb(format!("Failed to parse NZB: {}", e)))?;
    nzb.validate()
        .map_err(|e| Error::InvalidNzb(format!("NZB validation failed: {}", e)))?;

    let mut seen = HashSet::new();
    let mut files = Vec::with_capacity(nzb.files.len());
    for (index, file) in nzb.files.iter().enumerate() {
        if file.segments.is_empty() {
            continue;
        }
        let mut name = filename_from_subject(&file.subject);
        if !seen.insert(name.clone()) {
            name = format!("{name}.{index}");
            seen.insert(name.clone());
        }
        let articles = file
            .segments
            .iter()
            .map(|segment| {
                Article::new(
                    segment.message_id.trim_matches(['<', '>']),
                    segment.bytes as u64,
                    segment.number as u32,
                )
            })
            .collect();
        files.push(NzbFile::new(file.subject.clone(), name, articles));
    }
    if files.is_empty() {
        return Err(Error::InvalidNzb("NZB contains no files with segments".into()));
    }

    Ok(Manifest {
        title: nzb.meta.get("title").map(|s| s.to_string()),
        password: nzb.meta.get("password").map(|s| s.to_string()),
        category: nzb.meta.get("category").map(|s| s.to_string()),
        files,
    })
}

impl UsenetDownloader {
    /// Add an NZB to the queue from raw bytes
    ///
    /// Parses the manifest, creates the job's working directory and admin
    /// state, and queues it. Downloading starts as soon as a connection is free.
    ///
    /// # Arguments
    ///
    /// * `content` - Raw NZB file content (XML)
    /// * `name` - Job name when the manifest carries no title
    /// * `options` - Category, priority, password and intake flags
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - the content is empty, not XML, or has no segments (`InvalidNzb`)
    /// - the admin state cannot be written
    /// - the engine is shutting down
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use usenet_engine::{AddOptions, Config, UsenetDownloader};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let downloader = UsenetDownloader::new(Config::default()).await?;
    ///
    ///     let nzb_content = std::fs::read("example.nzb")?;
    ///     let id = downloader
    ///         .add_nzb_content(&nzb_content, "example", AddOptions::default())
    ///         .await?;
    ///
    ///     println!("queued as {id}");
    ///     Ok(())
    /// }
    /// ```
    pub async fn add_nzb_content(
        &self,
        content: &[u8],
        name: &str,
        options: AddOptions,
    ) -> Result<JobId> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        if content.iter().all(u8::is_ascii_whitespace) {
            return Err(Error::InvalidNzb("NZB content is empty".into()));
        }

        let manifest = parse_manifest(content)?;
        let job = self.build_job(manifest, name, options).await?;
        let id = job.id.clone();

        // Admin state first, so a crash right after the add still finds the job
        self.store.save_manifest(&id, content).await?;
        self.store.save_job(&job).await?;

        tracing::info!(job_id = %id, name = %job.name, files = job.files.len(), size = job.size_bytes, "NZB accepted");
        self.request(|reply| Command::Add {
            job: Box::new(job),
            reply,
        })
        .await?;
        Ok(id)
    }

    /// Add an NZB to the queue from a file
    ///
    /// Reads the file and delegates to [`add_nzb_content`](Self::add_nzb_content);
    /// the file name without extension is the fallback job name.
    pub async fn add_nzb(&self, path: &std::path::Path, options: AddOptions) -> Result<JobId> {
        let content = tokio::fs::read(path).await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read NZB file '{}': {}", path.display(), e),
            ))
        })?;
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .map(Self::extract_job_name)
            .unwrap_or_else(|| "unknown".to_string());
        self.add_nzb_content(&content, &name, options).await
    }

    /// Job name from an NZB file name
    ///
    /// # Example
    ///
    /// ```
    /// # use usenet_engine::UsenetDownloader;
    /// let job_name = UsenetDownloader::extract_job_name("My.Movie.2024.nzb");
    /// assert_eq!(job_name, "My.Movie.2024");
    /// ```
    pub fn extract_job_name(name: &str) -> String {
        let lower = name.to_ascii_lowercase();
        match lower.strip_suffix(".nzb") {
            Some(stem) => name[..stem.len()].to_string(),
            None => name.to_string(),
        }
    }

    /// Turn a parsed manifest into a queued-to-be job with its working directory
    async fn build_job(&self, manifest: Manifest, name: &str, options: AddOptions) -> Result<Job> {
        let Manifest {
            title,
            password,
            category,
            files,
        } = manifest;

        let job_name = title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| Self::extract_job_name(name));
        let category = resolve_category(options.category.or(category), options.pre_queue.as_ref());
        let resolved = resolve_priority(
            self.config.category_priority(category.as_deref()),
            options.priority,
            options.pre_queue.as_ref().and_then(|p| p.priority),
        );

        let workdir = self.workdir_for(&job_name);
        tokio::fs::create_dir_all(&workdir).await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("failed to create working directory {}: {}", workdir.display(), e),
            ))
        })?;

        let mut job = Job::new(JobId::generate(), job_name, files, workdir);
        job.category = category;
        job.priority = resolved.rank;
        job.paused = resolved.paused || options.paused;
        job.duplicate = resolved.duplicate;
        job.password = options.password.or(password);
        job.posted_at = options.posted_at;
        job.precheck = options.pre_check.unwrap_or(self.config.download.pre_check);
        Ok(job)
    }

    /// Unique working directory in the incomplete area
    fn workdir_for(&self, job_name: &str) -> std::path::PathBuf {
        let base = &self.config.download.incomplete_dir;
        get_unique_path(&base.join(sanitize_filename(job_name)))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::test_helpers::nzb_xml;

    #[test]
    fn manifest_files_follow_subjects() {
        let xml = nzb_xml(&[
            ("first.bin", vec![("a1@test", 100), ("a2@test", 100)]),
            ("second.bin", vec![("b1@test", 50)]),
        ]);
        let manifest = parse_manifest(xml.as_bytes()).unwrap();
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.files[0].filename, "first.bin");
        assert_eq!(manifest.files[0].articles[0].message_id, "a1@test");
        assert_eq!(manifest.files[0].declared_bytes, 200);
        assert!(manifest.files[0].articles[0].lowest_partnum);
        assert_eq!(manifest.files[1].articles[0].message_id, "b1@test");
    }

    #[test]
    fn repeated_names_get_distinct_targets() {
        let xml = nzb_xml(&[
            ("same.bin", vec![("x1@test", 10)]),
            ("same.bin", vec![("x2@test", 10)]),
        ]);
        let manifest = parse_manifest(xml.as_bytes()).unwrap();
        assert_eq!(manifest.files[0].filename, "same.bin");
        assert_eq!(manifest.files[1].filename, "same.bin.1");
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            parse_manifest(b"this is not xml"),
            Err(Error::InvalidNzb(_))
        ));
    }

    #[test]
    fn job_name_drops_the_extension() {
        assert_eq!(UsenetDownloader::extract_job_name("Show.S01E01.nzb"), "Show.S01E01");
        assert_eq!(UsenetDownloader::extract_job_name("UPPER.NZB"), "UPPER");
        assert_eq!(UsenetDownloader::extract_job_name("plain"), "plain");
    }
}
