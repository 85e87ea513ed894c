//! Content-addressed blob store backing the HTTP surface.
//!
//! Blobs live as flat files named `<sha256>[.<ext>]` under the configured
//! directory. Uploads and downloads stage through a temp file in the same
//! directory and are renamed into place only once the hash is known.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{info, warn};
use url::Url;

use crate::event::Event;

/// How much of a blob's head is kept for content-type sniffing.
const SNIFF_LEN: usize = 16;

/// Flat directory of content-addressed blobs.
#[derive(Clone)]
pub struct BlobStore {
    dir: PathBuf,
}

/// A blob persisted into the store.
#[derive(Debug)]
pub struct StoredBlob {
    pub sha256: String,
    pub size: u64,
    pub content_type: &'static str,
    pub path: PathBuf,
}

impl BlobStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Ensure the blob directory exists.
    pub fn init(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)
    }

    /// Resolve `<hash>` or `<hash>.<ext>` to the stored file, regardless of
    /// which extension (if any) it was persisted with.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let (hash, _ext) = split_name(name)?;
        let exact = self.dir.join(name);
        if exact.is_file() {
            return Some(exact);
        }
        for entry in std::fs::read_dir(&self.dir).ok()?.flatten() {
            let fname = entry.file_name();
            let fname = fname.to_string_lossy();
            if fname == hash || fname.strip_prefix(hash).is_some_and(|r| r.starts_with('.')) {
                return Some(entry.path());
            }
        }
        None
    }

    /// Begin staging a blob into the store.
    pub fn writer(&self) -> std::io::Result<BlobWriter> {
        Ok(BlobWriter {
            tmp: NamedTempFile::new_in(&self.dir)?,
            hasher: Sha256::new(),
            size: 0,
            head: Vec::with_capacity(SNIFF_LEN),
        })
    }
}

/// Incremental writer hashing a blob while it streams to a temp file.
pub struct BlobWriter {
    tmp: NamedTempFile,
    hasher: Sha256,
    size: u64,
    head: Vec<u8>,
}

impl BlobWriter {
    pub fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        if self.head.len() < SNIFF_LEN {
            let take = (SNIFF_LEN - self.head.len()).min(chunk.len());
            self.head.extend_from_slice(&chunk[..take]);
        }
        self.hasher.update(chunk);
        self.size += chunk.len() as u64;
        self.tmp.write_all(chunk)
    }

    /// Finish the blob: verify the expected hash when given, sniff a content
    /// type, and atomically rename into the store.
    pub fn finish(self, store: &BlobStore, expect: Option<&str>) -> Result<StoredBlob> {
        let sha256 = hex::encode(self.hasher.finalize());
        if let Some(expect) = expect {
            if sha256 != expect {
                bail!("hash mismatch: got {sha256}, expected {expect}");
            }
        }
        let content_type = sniff(&self.head);
        let name = match ext_for(content_type) {
            Some(ext) => format!("{sha256}.{ext}"),
            None => sha256.clone(),
        };
        let path = store.dir.join(name);
        self.tmp.persist(&path).context("persisting blob")?;
        Ok(StoredBlob {
            sha256,
            size: self.size,
            content_type,
            path,
        })
    }
}

/// Split `<64-hex>[.<ext>]`, rejecting anything that is not a blob name.
pub fn split_name(name: &str) -> Option<(&str, Option<&str>)> {
    let (hash, ext) = match name.split_once('.') {
        Some((h, e)) => (h, Some(e)),
        None => (name, None),
    };
    let ok = hash.len() == 64
        && hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if ok {
        Some((hash, ext))
    } else {
        None
    }
}

/// Sniff a content type from leading magic bytes.
pub fn sniff(head: &[u8]) -> &'static str {
    match head {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xff, 0xd8, 0xff, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        [b'P', b'K', 0x03, 0x04, ..] => "application/zip",
        [0x1f, 0x8b, ..] => "application/gzip",
        [b'%', b'P', b'D', b'F', ..] => "application/pdf",
        [0x7f, b'E', b'L', b'F', ..] => "application/x-executable",
        _ => "application/octet-stream",
    }
}

/// File extension used when persisting a sniffed blob.
pub fn ext_for(content_type: &str) -> Option<&'static str> {
    match content_type {
        "image/png" => Some("png"),
        "image/jpeg" => Some("jpg"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "application/zip" => Some("zip"),
        "application/gzip" => Some("gz"),
        "application/pdf" => Some("pdf"),
        _ => None,
    }
}

/// Download the artifact referenced by an accepted file-metadata event.
///
/// Best effort: failures are logged and never affect the write path.
pub async fn fetch_event_blob(store: BlobStore, ev: Event) {
    let Some(url) = ev.tag_value("url").map(str::to_string) else {
        return;
    };
    let Some(expect) = ev.tag_value("x").map(str::to_string) else {
        return;
    };
    if store.resolve(&expect).is_some() {
        return;
    }
    match fetch_blob(&store, &url, &expect).await {
        Ok(blob) => info!(sha256 = %blob.sha256, size = blob.size, "fetched blob"),
        Err(e) => warn!(url = %url, error = %e, "blob fetch failed"),
    }
}

async fn fetch_blob(store: &BlobStore, url: &str, expect: &str) -> Result<StoredBlob> {
    let parsed = Url::parse(url).context("parsing blob url")?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(anyhow!("unsupported scheme {}", parsed.scheme()));
    }
    let resp = reqwest::get(parsed).await?.error_for_status()?;
    let mut writer = store.writer()?;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        writer.write(&chunk?)?;
    }
    writer.finish(store, Some(expect))
}
