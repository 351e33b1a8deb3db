use super::TryList;
use crate::decoder::{DecodedMeta, Encoding};
use crate::types::ServerId;
use serde::{Deserialize, Serialize};

/// One fetch unit
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Article {
    /// Message-id as carried on the wire, without angle brackets
    pub message_id: String,
    /// Size declared by the manifest
    pub bytes: u64,
    /// Declared part number
    pub partnum: u32,
    /// The article whose decode names the file and yields its 16K-signature
    pub lowest_partnum: bool,
    /// Servers that failed to deliver it
    pub try_list: TryList,
    /// Backup servers may be asked
    pub allow_backup_server: bool,
    /// Server currently fetching it
    #[serde(skip)]
    pub fetcher: Option<ServerId>,
    /// Payload written into the target file
    pub on_disk: bool,
    /// Payload sits in the cache awaiting assembly
    pub decoded: bool,
    /// Offset in the target file (from the framing)
    pub data_begin: Option<u64>,
    /// Decoded size
    pub data_size: Option<u64>,
    /// CRC32 of the decoded bytes
    pub crc: Option<u32>,
    /// Encoding the payload came in
    pub encoding: Option<Encoding>,
    /// Transport failures on the current server
    pub tries: u32,
    /// The saved bytes failed their CRC check
    pub bad_data: bool,
    /// No server is left to try; counted in the job's bad articles
    pub failed: bool,
    /// Availability confirmed by a pre-check pass
    #[serde(default)]
    pub checked: bool,
}

impl Article {
    /// Fresh article from the manifest
    pub fn new(message_id: impl Into<String>, bytes: u64, partnum: u32) -> Self {
        Self {
            message_id: message_id.into(),
            bytes,
            partnum,
            lowest_partnum: false,
            try_list: TryList::default(),
            allow_backup_server: false,
            fetcher: None,
            on_disk: false,
            decoded: false,
            data_begin: None,
            data_size: None,
            crc: None,
            encoding: None,
            tries: 0,
            bad_data: false,
            failed: false,
            checked: false,
        }
    }

    /// Ready for dispatch: idle, not fetched, not given up on
    pub fn is_runnable(&self, precheck: bool) -> bool {
        self.fetcher.is_none()
            && !self.on_disk
            && !self.decoded
            && !self.failed
            && !(precheck && self.checked)
    }

    /// Nothing more will happen to it in the download phase
    pub fn is_settled(&self) -> bool {
        self.on_disk || self.decoded || self.failed
    }

    /// Record a decoder result
    pub fn apply_decoded(&mut self, meta: &DecodedMeta, bad_data: bool) {
        self.fetcher = None;
        self.decoded = true;
        self.tries = 0;
        self.data_begin = meta.data_begin;
        self.data_size = Some(meta.data_size);
        self.crc = Some(meta.crc);
        self.encoding = meta.encoding;
        self.bad_data = bad_data;
    }

    /// Back to the fetchable state, keeping the try-list
    pub fn reset_for_refetch(&mut self) {
        self.fetcher = None;
        self.decoded = false;
        self.on_disk = false;
        self.data_begin = None;
        self.data_size = None;
        self.crc = None;
        self.bad_data = false;
    }
}

/// One file of a job
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NzbFile {
    /// Post subject from the manifest
    pub subject: String,
    /// Name derived from the subject
    pub declared_name: String,
    /// Name on disk: the declared name until a decode confirms or rewrites it
    pub filename: String,
    /// The lowest-partnum article has decoded
    pub filename_checked: bool,
    /// Sum of the declared article sizes
    pub declared_bytes: u64,
    /// Whole-file size from the framing
    pub actual_bytes: Option<u64>,
    /// Articles in declared part order
    pub articles: Vec<Article>,
    /// MD5 of the first 16 KiB
    pub signature: Option<[u8; 16]>,
    /// Articles the assembler has moved past (written or skipped)
    pub assembled_upto: usize,
    /// Running CRC of everything written, reported by the assembler
    pub crc: Option<u32>,
    /// Finalized on disk
    pub assembled: bool,
    /// Articles arrived so far are all known (always true after intake)
    pub import_finished: bool,
    /// Every article before this index is settled
    #[serde(skip)]
    settled_upto: usize,
}

impl NzbFile {
    /// File with its articles sorted by part number; flags the lowest one
    pub fn new(subject: impl Into<String>, declared_name: String, mut articles: Vec<Article>) -> Self {
        articles.sort_by_key(|a| a.partnum);
        if let Some(first) = articles.first_mut() {
            first.lowest_partnum = true;
        }
        Self {
            subject: subject.into(),
            filename: declared_name.clone(),
            declared_name,
            filename_checked: false,
            declared_bytes: articles.iter().map(|a| a.bytes).sum(),
            actual_bytes: None,
            articles,
            signature: None,
            assembled_upto: 0,
            crc: None,
            assembled: false,
            import_finished: true,
            settled_upto: 0,
        }
    }

    /// Index of the first article that is not settled, if any.
    /// Moves the cursor past the settled prefix.
    pub fn first_unsettled(&mut self) -> Option<usize> {
        while self
            .articles
            .get(self.settled_upto)
            .is_some_and(Article::is_settled)
        {
            self.settled_upto += 1;
        }
        (self.settled_upto < self.articles.len()).then_some(self.settled_upto)
    }

    /// Article `index` may no longer be settled
    pub fn rewind(&mut self, index: usize) {
        self.settled_upto = self.settled_upto.min(index);
    }

    /// Every article is written, cached or given up on
    pub fn is_download_done(&self) -> bool {
        self.articles.iter().all(Article::is_settled)
    }

    /// Articles counted as bad
    pub fn bad_articles(&self) -> u32 {
        self.articles.iter().filter(|a| a.failed).count() as u32
    }

    /// Bytes fetched so far (decoded or written)
    pub fn downloaded_bytes(&self) -> u64 {
        self.articles
            .iter()
            .filter(|a| a.decoded || a.on_disk)
            .map(|a| a.data_size.unwrap_or(a.bytes))
            .sum()
    }
}
