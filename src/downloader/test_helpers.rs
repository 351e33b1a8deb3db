//! Shared test helpers: a scripted news server, manifests and downloader setup.

use crate::archive::{ArchiveInspector, ArchiveListing};
use crate::assembler::{FileStore, LocalFileStore};
use crate::config::{Config, ServerConfig};
use crate::decoder::yenc;
use crate::downloader::{Collaborators, UsenetDownloader};
use crate::types::Event;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::{TempDir, tempdir};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// How the mock server answers for one article
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Script {
    Serve,
    Missing,
    Removed,
    CorruptCrc,
    Drop,
}

#[derive(Default)]
struct MockState {
    scripts: Mutex<HashMap<String, Script>>,
    fetches: Mutex<HashMap<String, usize>>,
    served: AtomicUsize,
    connections: AtomicUsize,
    credentials: Option<(String, String)>,
}

/// News server on localhost that serves articles described by their message id
///
/// Message ids built by [`article_id`] carry the file name, part number and byte
/// range, so the server encodes the right slice of [`file_bytes`] on demand.
pub(crate) struct MockServer {
    pub port: u16,
    state: Arc<MockState>,
    hold: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub(crate) async fn start() -> Self {
        Self::spawn(MockState::default()).await
    }

    /// Server that insists on `AUTHINFO` with these credentials
    pub(crate) async fn with_credentials(user: &str, pass: &str) -> Self {
        Self::spawn(MockState {
            credentials: Some((user.into(), pass.into())),
            ..MockState::default()
        })
        .await
    }

    async fn spawn(state: MockState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(state);
        let (hold, _) = watch::channel(false);
        let task = {
            let state = Arc::clone(&state);
            let hold = hold.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    state.connections.fetch_add(1, Ordering::SeqCst);
                    let state = Arc::clone(&state);
                    let hold = hold.subscribe();
                    tokio::spawn(async move {
                        let _ = serve(stream, state, hold).await;
                    });
                }
            })
        };
        Self {
            port,
            state,
            hold,
            task,
        }
    }

    /// Server entry pointing at this mock
    pub(crate) fn config(&self, name: &str) -> ServerConfig {
        let mut server = ServerConfig::new("127.0.0.1", self.port);
        server.name = name.into();
        server.connections = 2;
        server.timeout = Duration::from_secs(5);
        server.backoff.initial_delay = Duration::from_millis(100);
        server.backoff.jitter = false;
        if let Some((user, pass)) = &self.state.credentials {
            server.username = Some(user.clone());
            server.password = Some(pass.clone());
        }
        server
    }

    pub(crate) fn script(&self, message_id: &str, script: Script) {
        self.state
            .scripts
            .lock()
            .unwrap()
            .insert(message_id.to_string(), script);
    }

    /// Hold every article request until [`release`](Self::release)
    pub(crate) fn hold(&self) {
        self.hold.send_replace(true);
    }

    pub(crate) fn release(&self) {
        self.hold.send_replace(false);
    }

    /// `BODY` and `ARTICLE` requests seen for one article
    pub(crate) fn fetches_for(&self, message_id: &str) -> usize {
        self.state
            .fetches
            .lock()
            .unwrap()
            .get(message_id)
            .copied()
            .unwrap_or(0)
    }

    /// `BODY` and `ARTICLE` requests seen in total
    pub(crate) fn fetches(&self) -> usize {
        self.state.fetches.lock().unwrap().values().sum()
    }

    /// Articles actually transferred
    pub(crate) fn served(&self) -> usize {
        self.state.served.load(Ordering::SeqCst)
    }

    pub(crate) fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    stream: TcpStream,
    state: Arc<MockState>,
    mut hold: watch::Receiver<bool>,
) -> io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    write.write_all(b"200 mock news server ready\r\n").await?;
    let mut user = None;

    while let Some(line) = lines.next_line().await? {
        let (verb, arg) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        let id = arg.trim().trim_matches(['<', '>']).to_string();
        let reply: Vec<u8> = match verb.to_ascii_uppercase().as_str() {
            "AUTHINFO" => match arg.split_once(' ') {
                Some((kind, value)) if kind.eq_ignore_ascii_case("USER") => {
                    user = Some(value.to_string());
                    b"381 password required\r\n".to_vec()
                }
                Some((kind, value)) if kind.eq_ignore_ascii_case("PASS") => {
                    let accepted = match &state.credentials {
                        Some((u, p)) => user.as_deref() == Some(u.as_str()) && value == p,
                        None => true,
                    };
                    if accepted {
                        b"281 authentication accepted\r\n".to_vec()
                    } else {
                        b"481 authentication rejected\r\n".to_vec()
                    }
                }
                _ => b"501 syntax error\r\n".to_vec(),
            },
            "CAPABILITIES" => {
                b"101 capability list follows\r\nVERSION 2\r\nREADER\r\nAUTHINFO USER\r\n.\r\n"
                    .to_vec()
            }
            "MODE" => b"200 reader mode\r\n".to_vec(),
            "BODY" | "ARTICLE" => {
                *state.fetches.lock().unwrap().entry(id.clone()).or_default() += 1;
                loop {
                    let held = *hold.borrow_and_update();
                    if !held || hold.changed().await.is_err() {
                        break;
                    }
                }
                let script = state
                    .scripts
                    .lock()
                    .unwrap()
                    .get(&id)
                    .copied()
                    .unwrap_or(Script::Serve);
                match script {
                    Script::Drop => return Ok(()),
                    Script::Missing => b"430 no such article\r\n".to_vec(),
                    Script::Removed => b"451 article removed (DMCA)\r\n".to_vec(),
                    Script::Serve | Script::CorruptCrc => {
                        match article_body(&id, script == Script::CorruptCrc) {
                            Some(body) => {
                                state.served.fetch_add(1, Ordering::SeqCst);
                                let mut out = if verb.eq_ignore_ascii_case("ARTICLE") {
                                    format!(
                                        "220 0 <{id}>\r\nMessage-ID: <{id}>\r\nSubject: mock\r\n\r\n"
                                    )
                                    .into_bytes()
                                } else {
                                    format!("222 0 <{id}>\r\n").into_bytes()
                                };
                                dot_stuff(&body, &mut out);
                                out.extend_from_slice(b".\r\n");
                                out
                            }
                            None => b"430 no such article\r\n".to_vec(),
                        }
                    }
                }
            }
            "QUIT" => {
                write.write_all(b"205 bye\r\n").await?;
                return Ok(());
            }
            _ => b"500 unknown command\r\n".to_vec(),
        };
        write.write_all(&reply).await?;
    }
    Ok(())
}

fn dot_stuff(body: &[u8], out: &mut Vec<u8>) {
    for line in body.split_inclusive(|&b| b == b'\n') {
        if line.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(line);
    }
}

/// Message id that names `len` bytes at `begin` of `name` (whose size is `total`)
pub(crate) fn article_id(name: &str, part: u32, begin: u64, len: u64, total: u64) -> String {
    format!("{name}.{part}.{begin}.{len}.{total}@mock")
}

fn parse_article_id(id: &str) -> Option<(String, u32, u64, u64, u64)> {
    let (local, _) = id.split_once('@')?;
    let mut fields = local.rsplitn(5, '.');
    let total = fields.next()?.parse().ok()?;
    let len = fields.next()?.parse().ok()?;
    let begin = fields.next()?.parse().ok()?;
    let part = fields.next()?.parse().ok()?;
    let name = fields.next()?.to_string();
    Some((name, part, begin, len, total))
}

fn article_body(id: &str, corrupt_crc: bool) -> Option<Vec<u8>> {
    let (name, part, begin, len, total) = parse_article_id(id)?;
    let data = file_bytes(&name, total);
    let start = usize::try_from(begin).ok()?;
    let end = start + usize::try_from(len).ok()?;
    let slice = data.get(start..end)?;
    let mut body = yenc::encode_part(slice, &name, part, total, begin, 128);
    if corrupt_crc {
        let marker = b"pcrc32=";
        let pos = body
            .windows(marker.len())
            .rposition(|w| w == marker)?
            + marker.len();
        let wrong = format!("{:08x}", crc32fast::hash(slice) ^ 1);
        body[pos..pos + 8].copy_from_slice(wrong.as_bytes());
    }
    Some(body)
}

/// Deterministic content of a posted file
pub(crate) fn file_bytes(name: &str, total: u64) -> Vec<u8> {
    let seed = name.bytes().map(u64::from).sum::<u64>();
    (0..total).map(|i| ((i * 7 + seed) % 251) as u8).collect()
}

/// Articles of a posted file: message ids and sizes, `part_size` bytes each
pub(crate) fn posted_file(name: &str, total: u64, part_size: u64) -> Vec<(String, u64)> {
    let mut parts = Vec::new();
    let mut begin = 0;
    let mut part = 1;
    while begin < total {
        let len = part_size.min(total - begin);
        parts.push((article_id(name, part, begin, len, total), len));
        begin += len;
        part += 1;
    }
    parts
}

/// NZB document for `(file name, [(message id, bytes)])` entries
pub(crate) fn nzb_xml<S: AsRef<str>>(files: &[(&str, Vec<(S, u64)>)]) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <nzb xmlns=\"http://www.newzbin.com/DTD/2003/nzb\">\n",
    );
    for (name, segments) in files {
        xml.push_str(&format!(
            "  <file poster=\"tester@example.com\" date=\"1700000000\" subject=\"{name} [1/{}]\">\n",
            segments.len()
        ));
        xml.push_str("    <groups><group>alt.binaries.test</group></groups>\n    <segments>\n");
        for (number, (id, bytes)) in segments.iter().enumerate() {
            xml.push_str(&format!(
                "      <segment bytes=\"{bytes}\" number=\"{}\">{}</segment>\n",
                number + 1,
                id.as_ref()
            ));
        }
        xml.push_str("    </segments>\n  </file>\n");
    }
    xml.push_str("</nzb>\n");
    xml
}

/// Configuration rooted in `dir`
pub(crate) fn test_config(dir: &Path, servers: Vec<ServerConfig>) -> Config {
    let mut config = Config::default();
    config.servers = servers;
    config.download.incomplete_dir = dir.join("incomplete");
    config.download.complete_dir = dir.join("complete");
    config.download.admin_dir = dir.join("admin");
    config.download.decoder_workers = 2;
    config.download.shutdown_timeout = Duration::from_secs(5);
    config.persistence.database_path = dir.join("admin.db");
    config.cache.cache_limit = 4 << 20;
    config
}

/// Downloader with no servers, for queue and control tests
pub(crate) async fn create_test_downloader() -> (UsenetDownloader, TempDir) {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path(), vec![]);
    let downloader = UsenetDownloader::new(config).await.unwrap();
    (downloader, dir)
}

/// Downloader on `config` with custom collaborators
pub(crate) async fn downloader_with(config: Config, collaborators: Collaborators) -> UsenetDownloader {
    UsenetDownloader::with_collaborators(config, collaborators)
        .await
        .unwrap()
}

/// Wait for the first event that satisfies `pred`
pub(crate) async fn wait_for<F>(rx: &mut broadcast::Receiver<Event>, mut pred: F) -> Event
where
    F: FnMut(&Event) -> bool,
{
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Archive inspector that reports every archive with the given listing
pub(crate) struct StubInspector {
    pub encrypted: bool,
    pub members: Vec<String>,
    pub password: Option<String>,
}

#[async_trait]
impl ArchiveInspector for StubInspector {
    async fn list(&self, _path: &Path) -> crate::Result<ArchiveListing> {
        Ok(ArchiveListing {
            encrypted: self.encrypted,
            members: self.members.clone(),
        })
    }

    async fn try_password(&self, _path: &Path, password: &str) -> crate::Result<bool> {
        Ok(self.password.as_deref() == Some(password))
    }
}

/// Local store whose writes fail with `ENOSPC` while armed
#[derive(Default)]
pub(crate) struct FullDisk {
    pub armed: AtomicBool,
    pub failures: AtomicUsize,
}

#[async_trait]
impl FileStore for FullDisk {
    async fn len(&self, path: &Path) -> io::Result<u64> {
        LocalFileStore.len(path).await
    }

    async fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> io::Result<()> {
        if self.armed.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(io::Error::from_raw_os_error(28));
        }
        LocalFileStore.write_at(path, offset, data).await
    }

    async fn truncate(&self, path: &Path, len: u64) -> io::Result<()> {
        LocalFileStore.truncate(path, len).await
    }

    async fn finalize(&self, path: &Path) -> io::Result<()> {
        LocalFileStore.finalize(path).await
    }
}

