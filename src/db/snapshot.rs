//! Per-job admin directory: job snapshot and manifest copy.

use crate::error::DatabaseError;
use crate::model::Job;
use crate::types::JobId;
use crate::{Error, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};
use std::path::Path;

use super::{AdminStore, JOB_FILE, MANIFEST_FILE};

fn snapshot_error(path: &Path, reason: impl ToString) -> Error {
    Error::Database(DatabaseError::Snapshot {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    })
}

impl AdminStore {
    /// Write `job.json` through a temp file and rename
    pub async fn save_job(&self, job: &Job) -> Result<()> {
        let dir = self.job_dir(&job.id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(JOB_FILE);
        let tmp = dir.join(format!("{JOB_FILE}.tmp"));
        let json = serde_json::to_vec(job)?;
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| snapshot_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| snapshot_error(&path, e))?;
        Ok(())
    }

    /// Read a job snapshot
    pub async fn load_job(&self, id: &JobId) -> Result<Job> {
        let path = self.job_dir(id).join(JOB_FILE);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| snapshot_error(&path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| snapshot_error(&path, e))
    }

    /// Keep a gzipped copy of the manifest
    pub async fn save_manifest(&self, id: &JobId, manifest: &[u8]) -> Result<()> {
        let dir = self.job_dir(id);
        tokio::fs::create_dir_all(&dir).await?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(manifest)?;
        let gz = encoder.finish()?;
        tokio::fs::write(dir.join(MANIFEST_FILE), gz).await?;
        Ok(())
    }

    /// The stored manifest, decompressed
    pub async fn load_manifest(&self, id: &JobId) -> Result<Vec<u8>> {
        let path = self.job_dir(id).join(MANIFEST_FILE);
        let gz = tokio::fs::read(&path)
            .await
            .map_err(|e| snapshot_error(&path, e))?;
        let mut out = Vec::new();
        GzDecoder::new(gz.as_slice())
            .read_to_end(&mut out)
            .map_err(|e| snapshot_error(&path, e))?;
        Ok(out)
    }

    /// Remove a job's admin directory (snapshot, manifest, spill files)
    pub async fn remove_job_dir(&self, id: &JobId) -> Result<()> {
        match tokio::fs::remove_dir_all(self.job_dir(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
