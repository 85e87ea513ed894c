//! Configuration loading from `.env` files.

use std::{collections::HashMap, env, fs, path::PathBuf};

use anyhow::{Context, Result};

/// Kinds served by default when `ALLOWED_KINDS` is not set.
pub const DEFAULT_ALLOWED_KINDS: [u16; 5] = [0, 3, 1063, 30063, 32267];

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// HTTP bind address, e.g. `127.0.0.1:7777`.
    pub bind_http: String,
    /// WebSocket bind address, e.g. `127.0.0.1:7778`.
    pub bind_ws: String,
    /// Directory holding content-addressed blobs.
    pub blossom_dir: PathBuf,
    /// Enable Schnorr signature verification on submitted events.
    pub verify_sig: bool,
    /// Kinds a subscription must name to be admitted.
    pub allowed_kinds: Vec<u16>,
    /// Publisher allow-list: pubkey to `d`-tag prefixes, empty vec meaning
    /// unrestricted. An empty map admits every publisher.
    pub allow_list: HashMap<String, Vec<String>>,
    /// Download blob artifacts referenced by accepted file-metadata events.
    pub fetch_blobs: bool,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let db_path = PathBuf::from(env::var("DB_PATH")?);
        let bind_http = env::var("BIND_HTTP")?;
        let bind_ws = env::var("BIND_WS")?;
        let blossom_dir = PathBuf::from(env::var("BLOSSOM_DIR")?);
        let verify_sig = env::var("VERIFY_SIG").unwrap_or_else(|_| "0".into()) == "1";
        let allowed_kinds = match env::var("ALLOWED_KINDS") {
            Ok(s) if !csv_u16(&s).is_empty() => csv_u16(&s),
            _ => DEFAULT_ALLOWED_KINDS.to_vec(),
        };
        let allow_list = match env::var("ALLOW_LIST") {
            Ok(p) if !p.is_empty() => {
                let data = fs::read_to_string(&p).context("reading allow list")?;
                serde_json::from_str(&data).context("parsing allow list")?
            }
            _ => HashMap::new(),
        };
        let fetch_blobs = env::var("FETCH_BLOBS").unwrap_or_else(|_| "0".into()) == "1";
        Ok(Self {
            db_path,
            bind_http,
            bind_ws,
            blossom_dir,
            verify_sig,
            allowed_kinds,
            allow_list,
            fetch_blobs,
        })
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}

/// Split a comma-separated string into `u16` values, skipping invalid entries.
pub fn csv_u16(input: impl AsRef<str>) -> Vec<u16> {
    let s = input.as_ref();
    s.split(',').filter_map(|s| s.trim().parse().ok()).collect()
}
