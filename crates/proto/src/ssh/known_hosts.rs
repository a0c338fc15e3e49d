//! SSH known_hosts store (OpenSSH format).
//!
//! Keeps trusted host keys in memory, reads and writes them in the OpenSSH
//! file format and checks a server's host key against them.
//!
//! # Format
//!
//! Each line in a known_hosts file has the format:
//! ```text
//! [hostnames] keytype base64-key [comment]
//! ```
//!
//! Hostnames can be:
//! - Standard: `example.com` or `[example.com]:2222`
//! - Hashed: `|1|salt|hash` (HMAC-SHA1 hashed hostname)
//! - Wildcard: `*.example.com`
//! - Multiple: `host1,host2,host3`
//! - Negated: `*.example.com,!bad.example.com`
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::known_hosts::{
//!     KnownHostCheck, KnownHosts, KEYENC_RAW, KEY_ED25519, TYPE_PLAIN,
//! };
//!
//! let key = b"\x00\x00\x00\x0bssh-ed25519\x00\x00\x00\x01\x07".to_vec();
//! let mut store = KnownHosts::new();
//! store
//!     .addc("example.com", &key, TYPE_PLAIN | KEYENC_RAW | KEY_ED25519, None)
//!     .unwrap();
//!
//! let status = store.checkp("example.com", 22, &key, TYPE_PLAIN | KEYENC_RAW).unwrap();
//! assert!(matches!(status, KnownHostCheck::Match(_)));
//! ```

use crate::ssh::wire::Reader;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use std::path::Path;
use subtle::ConstantTimeEq;
use tether_platform::{KnownHostsFailure, TetherError, TetherResult};
use tracing::{debug, warn};

type HmacSha1 = Hmac<Sha1>;

/// Mask selecting the host name encoding.
pub const TYPE_MASK: u32 = 0xffff;
/// Host name stored as written
pub const TYPE_PLAIN: u32 = 1;
/// Host name stored as `|1|salt|hash`
pub const TYPE_SHA1: u32 = 2;
/// Host name stored verbatim without interpretation
pub const TYPE_CUSTOM: u32 = 3;

/// Mask selecting the key encoding.
pub const KEYENC_MASK: u32 = 3 << 16;
/// Key given as a raw blob
pub const KEYENC_RAW: u32 = 1 << 16;
/// Key given as base64 text
pub const KEYENC_BASE64: u32 = 2 << 16;

/// Mask selecting the key type.
pub const KEY_MASK: u32 = 15 << 18;
/// Bit offset of the key type.
pub const KEY_SHIFT: u32 = 18;
/// SSH-1 RSA key
pub const KEY_RSA1: u32 = 1 << 18;
/// ssh-rsa
pub const KEY_SSHRSA: u32 = 2 << 18;
/// ssh-dss
pub const KEY_SSHDSS: u32 = 3 << 18;
/// ecdsa-sha2-nistp256
pub const KEY_ECDSA_256: u32 = 4 << 18;
/// ecdsa-sha2-nistp384
pub const KEY_ECDSA_384: u32 = 5 << 18;
/// ecdsa-sha2-nistp521
pub const KEY_ECDSA_521: u32 = 6 << 18;
/// ssh-ed25519
pub const KEY_ED25519: u32 = 7 << 18;
/// Key type taken from the key blob
pub const KEY_UNKNOWN: u32 = 15 << 18;

const SALT_LEN: usize = 20;

fn format_error(message: impl Into<String>) -> TetherError {
    TetherError::KnownHosts {
        kind: KnownHostsFailure::Format,
        message: message.into(),
    }
}

fn file_error(path: &Path, err: std::io::Error) -> TetherError {
    TetherError::KnownHosts {
        kind: KnownHostsFailure::File,
        message: format!("{}: {}", path.display(), err),
    }
}

fn b64() -> base64::engine::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

/// Key type name for a typemask, if it names one.
fn key_type_name(typemask: u32) -> Option<&'static str> {
    match typemask & KEY_MASK {
        KEY_SSHRSA => Some("ssh-rsa"),
        KEY_SSHDSS => Some("ssh-dss"),
        KEY_ECDSA_256 => Some("ecdsa-sha2-nistp256"),
        KEY_ECDSA_384 => Some("ecdsa-sha2-nistp384"),
        KEY_ECDSA_521 => Some("ecdsa-sha2-nistp521"),
        KEY_ED25519 => Some("ssh-ed25519"),
        _ => None,
    }
}

fn key_type_bits(name: &str) -> u32 {
    match name {
        "ssh-rsa" => KEY_SSHRSA,
        "ssh-dss" => KEY_SSHDSS,
        "ecdsa-sha2-nistp256" => KEY_ECDSA_256,
        "ecdsa-sha2-nistp384" => KEY_ECDSA_384,
        "ecdsa-sha2-nistp521" => KEY_ECDSA_521,
        "ssh-ed25519" => KEY_ED25519,
        _ => KEY_UNKNOWN,
    }
}

/// Decodes a key argument according to its typemask encoding.
fn decode_key(key: &[u8], typemask: u32) -> TetherResult<Vec<u8>> {
    match typemask & KEYENC_MASK {
        KEYENC_BASE64 => b64()
            .decode(key)
            .map_err(|e| format_error(format!("invalid base64 key: {}", e))),
        KEYENC_RAW | 0 => Ok(key.to_vec()),
        other => Err(format_error(format!("unknown key encoding {:#x}", other))),
    }
}

/// One trusted host key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownHostEntry {
    id: u64,
    /// Host pattern as stored (plain list, or `|1|salt|hash`)
    pub name: String,
    /// Key type name (e.g. "ssh-ed25519")
    pub key_type: String,
    /// Base64 encoded key blob
    pub key: String,
    /// Host encoding, key encoding (always base64 here) and key type bits
    pub typemask: u32,
    /// Optional trailing comment
    pub comment: Option<String>,
}

impl KnownHostEntry {
    /// Identity used by [`KnownHosts::delete`].
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Decoded key blob.
    pub fn key_blob(&self) -> TetherResult<Vec<u8>> {
        decode_key(self.key.as_bytes(), KEYENC_BASE64)
    }

    /// Checks if this entry matches a host as written in known_hosts
    /// (`host` or `[host]:port`).
    ///
    /// A matching negated pattern (`!host`) excludes the entry even if
    /// another pattern in the list matches.
    pub fn matches(&self, host: &str) -> bool {
        if self.typemask & TYPE_MASK == TYPE_SHA1 {
            return match verify_hashed_hostname(&self.name, host) {
                Ok(matched) => matched,
                Err(err) => {
                    debug!(error = %err, "unusable hashed host entry");
                    false
                }
            };
        }
        if self.typemask & TYPE_MASK == TYPE_CUSTOM {
            return self.name == host;
        }

        let mut matched = false;
        for pattern in self.name.split(',') {
            let pattern = pattern.trim();
            if let Some(negated) = pattern.strip_prefix('!') {
                if wildcard_match(negated, host) {
                    return false;
                }
                continue;
            }
            if wildcard_match(pattern, host) {
                matched = true;
            }
        }
        matched
    }
}

/// Verifies a hashed hostname using HMAC-SHA1.
///
/// Format: |1|salt|hash
/// Where hash = Base64(HMAC-SHA1(salt, hostname))
fn verify_hashed_hostname(hashed: &str, hostname: &str) -> TetherResult<bool> {
    let parts: Vec<&str> = hashed.split('|').collect();

    // Validate format: |1|salt|hash
    if parts.len() != 4 || !parts[0].is_empty() || parts[1] != "1" {
        return Err(format_error(format!("malformed hashed host '{}'", hashed)));
    }

    let salt = b64()
        .decode(parts[2])
        .map_err(|e| format_error(format!("invalid base64 salt: {}", e)))?;
    let expected_hash = b64()
        .decode(parts[3])
        .map_err(|e| format_error(format!("invalid base64 hash: {}", e)))?;

    let computed_hash = hash_host(&salt, hostname)?;

    // Constant-time comparison
    Ok(computed_hash.ct_eq(&expected_hash[..]).into())
}

fn hash_host(salt: &[u8], hostname: &str) -> TetherResult<Vec<u8>> {
    let mut hmac = HmacSha1::new_from_slice(salt)
        .map_err(|e| format_error(format!("HMAC creation failed: {}", e)))?;
    hmac.update(hostname.as_bytes());
    Ok(hmac.finalize().into_bytes().to_vec())
}

/// Simple wildcard matching (* and ?).
///
/// - `*` matches any number of characters
/// - `?` matches exactly one character
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern_chars: Vec<char> = pattern.chars().collect();
    let text_chars: Vec<char> = text.chars().collect();

    wildcard_match_impl(&pattern_chars, &text_chars, 0, 0)
}

fn wildcard_match_impl(pattern: &[char], text: &[char], p_idx: usize, t_idx: usize) -> bool {
    if p_idx == pattern.len() {
        return t_idx == text.len();
    }

    if pattern[p_idx] == '*' {
        // Zero characters, or one more and stay on the star
        return wildcard_match_impl(pattern, text, p_idx + 1, t_idx)
            || (t_idx < text.len() && wildcard_match_impl(pattern, text, p_idx, t_idx + 1));
    }

    if t_idx == text.len() {
        return false;
    }

    if pattern[p_idx] == '?' || pattern[p_idx] == text[t_idx] {
        return wildcard_match_impl(pattern, text, p_idx + 1, t_idx + 1);
    }

    false
}

/// Result of a host key check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KnownHostCheck {
    /// Host and key match this entry
    Match(KnownHostEntry),
    /// Host matches this entry but the key differs
    Mismatch(KnownHostEntry),
    /// No entry for the host
    NotFound,
}

/// In-memory collection of known host keys.
#[derive(Debug, Clone, Default)]
pub struct KnownHosts {
    entries: Vec<KnownHostEntry>,
    next_id: u64,
}

impl KnownHosts {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, mut entry: KnownHostEntry) -> KnownHostEntry {
        entry.id = self.next_id;
        self.next_id += 1;
        self.entries.push(entry.clone());
        entry
    }

    /// Snapshot of every entry, in file order.
    pub fn get(&self) -> Vec<KnownHostEntry> {
        self.entries.clone()
    }

    /// Parses one known_hosts line and adds it.
    ///
    /// Blank lines and `#` comments are accepted and add nothing.
    pub fn readline(&mut self, line: &str) -> TetherResult<()> {
        let line = line.trim_end_matches(['\r', '\n']);
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return Ok(());
        }
        if trimmed.starts_with('@') {
            return Err(format_error("marker lines (@cert-authority, @revoked) are not supported"));
        }

        let (name, rest) = split_field(trimmed);
        let (key_type, rest) = split_field(rest);
        let (key, rest) = split_field(rest);
        if name.is_empty() || key_type.is_empty() || key.is_empty() {
            return Err(format_error("too few fields (need at least 3)"));
        }
        if key_type.chars().all(|c| c.is_ascii_digit()) {
            return Err(format_error("SSH-1 host keys are not supported"));
        }
        b64()
            .decode(key)
            .map_err(|e| format_error(format!("invalid base64 key data: {}", e)))?;

        let host_type = if name.starts_with("|1|") {
            TYPE_SHA1
        } else {
            TYPE_PLAIN
        };
        let comment = (!rest.is_empty()).then(|| rest.to_string());
        self.push(KnownHostEntry {
            id: 0,
            name: name.to_string(),
            key_type: key_type.to_string(),
            key: key.to_string(),
            typemask: host_type | KEYENC_BASE64 | key_type_bits(key_type),
            comment,
        });
        Ok(())
    }

    /// Reads a known_hosts file, returning how many entries were added.
    ///
    /// Lines that fail to parse are skipped.
    pub fn readfile<P: AsRef<Path>>(&mut self, path: P) -> TetherResult<usize> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| file_error(path, e))?;
        let before = self.entries.len();
        for (line_num, line) in content.lines().enumerate() {
            if let Err(err) = self.readline(line) {
                warn!(line = line_num + 1, error = %err, "skipping known_hosts line");
            }
        }
        let added = self.entries.len() - before;
        debug!(path = %path.display(), added, "known_hosts loaded");
        Ok(added)
    }

    /// Formats an entry as a known_hosts line, without the newline.
    pub fn writeline(&self, entry: &KnownHostEntry) -> TetherResult<String> {
        if !self.entries.iter().any(|e| e.id == entry.id) {
            return Err(TetherError::KnownHosts {
                kind: KnownHostsFailure::EntryNotFound,
                message: "entry is not in this store".to_string(),
            });
        }
        let mut line = format!("{} {} {}", entry.name, entry.key_type, entry.key);
        if let Some(comment) = &entry.comment {
            line.push(' ');
            line.push_str(comment);
        }
        Ok(line)
    }

    /// Writes every entry to `path`, replacing its contents.
    pub fn writefile<P: AsRef<Path>>(&self, path: P) -> TetherResult<()> {
        let path = path.as_ref();
        let mut content = String::new();
        for entry in &self.entries {
            content.push_str(&self.writeline(entry)?);
            content.push('\n');
        }
        std::fs::write(path, content).map_err(|e| file_error(path, e))
    }

    /// Adds a host key.
    ///
    /// `typemask` names the host encoding (`TYPE_*`), the key encoding
    /// (`KEYENC_*`) and the key type (`KEY_*`). With `TYPE_SHA1` the host
    /// must already be in `|1|salt|hash` form.
    pub fn addc(
        &mut self,
        host: &str,
        key: &[u8],
        typemask: u32,
        comment: Option<&str>,
    ) -> TetherResult<KnownHostEntry> {
        let host_type = match typemask & TYPE_MASK {
            TYPE_PLAIN | TYPE_CUSTOM => typemask & TYPE_MASK,
            TYPE_SHA1 => {
                if host.split('|').count() != 4 || !host.starts_with("|1|") {
                    return Err(format_error("hashed host must look like |1|salt|hash"));
                }
                TYPE_SHA1
            }
            other => return Err(format_error(format!("unknown host type {}", other))),
        };
        let blob = decode_key(key, typemask)?;
        let key_type = match key_type_name(typemask) {
            Some(name) => name.to_string(),
            None => {
                if typemask & KEY_MASK == KEY_RSA1 {
                    return Err(format_error("SSH-1 host keys are not supported"));
                }
                Reader::new(&blob)
                    .string()
                    .map_err(|_| format_error("key blob does not name its type"))?
            }
        };
        let entry = self.push(KnownHostEntry {
            id: 0,
            name: host.to_string(),
            key_type: key_type.clone(),
            key: b64().encode(&blob),
            typemask: host_type | KEYENC_BASE64 | key_type_bits(&key_type),
            comment: comment.map(str::to_string),
        });
        debug!(host = %entry.name, key_type = %entry.key_type, "known host added");
        Ok(entry)
    }

    /// Adds a host key under a freshly salted HMAC-SHA1 hash of `host`.
    pub fn add_hashed(
        &mut self,
        host: &str,
        key: &[u8],
        typemask: u32,
        comment: Option<&str>,
    ) -> TetherResult<KnownHostEntry> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let hash = hash_host(&salt, host)?;
        let hashed = format!("|1|{}|{}", b64().encode(salt), b64().encode(hash));
        self.addc(&hashed, key, (typemask & !TYPE_MASK) | TYPE_SHA1, comment)
    }

    /// Removes an entry previously returned by this store.
    pub fn delete(&mut self, entry: &KnownHostEntry) -> TetherResult<()> {
        let position = self
            .entries
            .iter()
            .position(|e| e.id == entry.id)
            .ok_or_else(|| TetherError::KnownHosts {
                kind: KnownHostsFailure::EntryNotFound,
                message: format!("no entry for '{}'", entry.name),
            })?;
        self.entries.remove(position);
        Ok(())
    }

    /// Checks `host` on the default port.
    pub fn check(&self, host: &str, key: &[u8], typemask: u32) -> TetherResult<KnownHostCheck> {
        self.checkp(host, 22, key, typemask)
    }

    /// Checks a host key for `host` on `port`.
    ///
    /// Non-default ports are looked up as `[host]:port`. Entries for other
    /// key types are ignored when `typemask` names a key type.
    pub fn checkp(
        &self,
        host: &str,
        port: u16,
        key: &[u8],
        typemask: u32,
    ) -> TetherResult<KnownHostCheck> {
        let blob = decode_key(key, typemask)?;
        let lookup = if port == 22 {
            host.to_string()
        } else {
            format!("[{}]:{}", host, port)
        };
        let wanted_type = typemask & KEY_MASK;

        let mut mismatch = None;
        for entry in self.entries.iter().filter(|e| e.matches(&lookup)) {
            let entry_type = entry.typemask & KEY_MASK;
            if wanted_type != 0
                && wanted_type != KEY_UNKNOWN
                && entry_type != KEY_UNKNOWN
                && entry_type != wanted_type
            {
                continue;
            }
            match entry.key_blob() {
                Ok(stored) if stored == blob => return Ok(KnownHostCheck::Match(entry.clone())),
                Ok(_) => {
                    mismatch.get_or_insert_with(|| entry.clone());
                }
                Err(err) => debug!(error = %err, "skipping undecodable entry"),
            }
        }
        Ok(mismatch.map_or(KnownHostCheck::NotFound, KnownHostCheck::Mismatch))
    }
}

/// Splits off the first whitespace separated field.
fn split_field(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    match text.find(char::is_whitespace) {
        Some(end) => (&text[..end], text[end..].trim_start()),
        None => (text, ""),
    }
}
