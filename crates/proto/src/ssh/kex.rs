//! Algorithm negotiation (RFC 4253 Section 7.1).
//!
//! The engine owns the KEXINIT exchange and negotiation; the cryptographic
//! exchange that follows is delegated to the transport collaborator. This
//! module provides:
//! - [`MethodType`], the ten method categories
//! - [`MethodPreferences`], caller preference lists validated at handshake
//! - [`KexInit`] encoding and parsing
//! - [`negotiate`], which picks one algorithm per category
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::kex::{negotiate_algorithm, MethodType};
//!
//! let client = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
//! let server = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
//! assert_eq!(negotiate_algorithm(&client, &server).unwrap(), "aes256-ctr");
//! assert_eq!(MethodType::try_from(1).unwrap(), MethodType::HostKey);
//! ```

use crate::ssh::message::MessageType;
use crate::ssh::wire::{Reader, Writer};
use rand::RngCore;
use tether_platform::{ErrorCode, TetherError, TetherResult};

/// Method category, numbered as in the classic C client API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MethodType {
    /// Key exchange
    Kex = 0,
    /// Server host key
    HostKey = 1,
    /// Cipher client to server
    CryptCs = 2,
    /// Cipher server to client
    CryptSc = 3,
    /// MAC client to server
    MacCs = 4,
    /// MAC server to client
    MacSc = 5,
    /// Compression client to server
    CompCs = 6,
    /// Compression server to client
    CompSc = 7,
    /// Language client to server
    LangCs = 8,
    /// Language server to client
    LangSc = 9,
}

impl MethodType {
    /// All categories in KEXINIT order.
    pub const ALL: [MethodType; 10] = [
        MethodType::Kex,
        MethodType::HostKey,
        MethodType::CryptCs,
        MethodType::CryptSc,
        MethodType::MacCs,
        MethodType::MacSc,
        MethodType::CompCs,
        MethodType::CompSc,
        MethodType::LangCs,
        MethodType::LangSc,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// True for the language categories, which may be empty.
    pub fn is_language(self) -> bool {
        matches!(self, MethodType::LangCs | MethodType::LangSc)
    }

    /// Algorithms the engine accepts in preference lists.
    pub fn supported(self) -> &'static [&'static str] {
        match self {
            MethodType::Kex => KEX_ALGORITHMS,
            MethodType::HostKey => HOSTKEY_ALGORITHMS,
            MethodType::CryptCs | MethodType::CryptSc => CIPHER_ALGORITHMS,
            MethodType::MacCs | MethodType::MacSc => MAC_ALGORITHMS,
            MethodType::CompCs | MethodType::CompSc => COMPRESSION_ALGORITHMS,
            MethodType::LangCs | MethodType::LangSc => &[],
        }
    }
}

impl TryFrom<i32> for MethodType {
    type Error = TetherError;

    fn try_from(value: i32) -> TetherResult<Self> {
        MethodType::ALL
            .iter()
            .copied()
            .find(|m| *m as i32 == value)
            .ok_or_else(|| TetherError::MethodNotSupported {
                message: format!("unknown method category {}", value),
            })
    }
}

const KEX_ALGORITHMS: &[&str] = &[
    "curve25519-sha256",
    "curve25519-sha256@libssh.org",
    "ecdh-sha2-nistp256",
    "ecdh-sha2-nistp384",
    "ecdh-sha2-nistp521",
    "diffie-hellman-group-exchange-sha256",
    "diffie-hellman-group16-sha512",
    "diffie-hellman-group18-sha512",
    "diffie-hellman-group14-sha256",
    "diffie-hellman-group14-sha1",
    "diffie-hellman-group1-sha1",
    "diffie-hellman-group-exchange-sha1",
];

const HOSTKEY_ALGORITHMS: &[&str] = &[
    "ssh-ed25519",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "rsa-sha2-512",
    "rsa-sha2-256",
    "ssh-rsa",
    "ssh-dss",
];

const CIPHER_ALGORITHMS: &[&str] = &[
    "chacha20-poly1305@openssh.com",
    "aes128-gcm@openssh.com",
    "aes256-gcm@openssh.com",
    "aes128-ctr",
    "aes192-ctr",
    "aes256-ctr",
    "aes256-cbc",
    "aes192-cbc",
    "aes128-cbc",
    "3des-cbc",
];

const MAC_ALGORITHMS: &[&str] = &[
    "hmac-sha2-256-etm@openssh.com",
    "hmac-sha2-512-etm@openssh.com",
    "hmac-sha1-etm@openssh.com",
    "umac-64-etm@openssh.com",
    "umac-128-etm@openssh.com",
    "umac-64@openssh.com",
    "umac-128@openssh.com",
    "hmac-sha2-256",
    "hmac-sha2-512",
    "hmac-sha1",
    "hmac-sha1-96",
];

const COMPRESSION_ALGORITHMS: &[&str] = &["none", "zlib@openssh.com", "zlib"];

/// Caller preference lists, one per category.
#[derive(Debug, Clone, Default)]
pub struct MethodPreferences {
    lists: [Option<String>; 10],
}

impl MethodPreferences {
    /// Stores a comma-separated preference list; names are checked later.
    pub fn set(&mut self, method: MethodType, prefs: &str) {
        self.lists[method.index()] = Some(prefs.to_string());
    }

    /// Raw preference string, if one was set.
    pub fn get(&self, method: MethodType) -> Option<&str> {
        self.lists[method.index()].as_deref()
    }

    /// Resolves the list sent for one category.
    ///
    /// Fails with `MethodNotSupported` when a name is not supported or a
    /// non-language category ends up empty.
    pub fn resolve(&self, method: MethodType, compress: bool) -> TetherResult<Vec<String>> {
        let names: Vec<String> = match self.get(method) {
            Some(prefs) => prefs
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect(),
            None => default_list(method, compress),
        };

        if let Some(bad) = names.iter().find(|n| !method.supported().contains(&n.as_str())) {
            return Err(TetherError::MethodNotSupported {
                message: format!("unsupported {:?} algorithm '{}'", method, bad),
            });
        }
        if names.is_empty() && !method.is_language() {
            return Err(TetherError::MethodNotSupported {
                message: format!("empty {:?} preference list", method),
            });
        }
        Ok(names)
    }

    /// Builds the client KEXINIT from these preferences.
    pub fn kexinit(&self, compress: bool) -> TetherResult<KexInit> {
        let mut lists: [Vec<String>; 10] = Default::default();
        for method in MethodType::ALL {
            lists[method.index()] = self.resolve(method, compress)?;
        }
        Ok(KexInit::new(lists))
    }
}

fn default_list(method: MethodType, compress: bool) -> Vec<String> {
    match method {
        MethodType::CompCs | MethodType::CompSc if compress => {
            vec!["zlib@openssh.com".into(), "zlib".into(), "none".into()]
        }
        MethodType::CompCs | MethodType::CompSc => vec!["none".into()],
        other => other.supported().iter().map(|s| s.to_string()).collect(),
    }
}

/// SSH_MSG_KEXINIT (RFC 4253 Section 7.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    lists: [Vec<String>; 10],
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Creates a KEXINIT with a random cookie.
    pub fn new(lists: [Vec<String>; 10]) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);
        Self {
            cookie,
            lists,
            first_kex_packet_follows: false,
        }
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the name-list for one category.
    pub fn list(&self, method: MethodType) -> &[String] {
        &self.lists[method.index()]
    }

    /// Returns whether a guessed KEX packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::message(MessageType::KexInit as u8).raw(&self.cookie);
        for list in &self.lists {
            w = w.name_list(list);
        }
        w.bool(self.first_kex_packet_follows).u32(0).finish()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        let mut r = Reader::expect(data, MessageType::KexInit as u8)?;
        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(r.raw(16)?);

        let mut lists: [Vec<String>; 10] = Default::default();
        for list in lists.iter_mut() {
            *list = r.name_list()?;
        }
        let first_kex_packet_follows = r.bool()?;
        let _reserved = r.u32()?;

        Ok(Self {
            cookie,
            lists,
            first_kex_packet_follows,
        })
    }
}

/// One algorithm chosen per category.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiatedMethods {
    chosen: [String; 10],
}

impl NegotiatedMethods {
    /// Algorithm chosen for a category; `None` for an empty language choice.
    pub fn get(&self, method: MethodType) -> Option<&str> {
        let chosen = &self.chosen[method.index()];
        if chosen.is_empty() {
            None
        } else {
            Some(chosen)
        }
    }
}

/// Picks the first client algorithm the server also offers.
pub fn negotiate_algorithm(client_list: &[String], server_list: &[String]) -> TetherResult<String> {
    client_list
        .iter()
        .find(|alg| server_list.contains(alg))
        .cloned()
        .ok_or_else(|| TetherError::Protocol {
            code: ErrorCode::KexFailure,
            message: format!(
                "no common algorithm: client={:?}, server={:?}",
                client_list, server_list
            ),
        })
}

/// Negotiates every category of two KEXINIT messages.
pub fn negotiate(client: &KexInit, server: &KexInit) -> TetherResult<NegotiatedMethods> {
    let mut chosen: [String; 10] = Default::default();
    for method in MethodType::ALL {
        let (ours, theirs) = (client.list(method), server.list(method));
        chosen[method.index()] = if method.is_language() && (ours.is_empty() || theirs.is_empty()) {
            String::new()
        } else {
            negotiate_algorithm(ours, theirs).map_err(|e| TetherError::Protocol {
                code: ErrorCode::KexFailure,
                message: format!("{:?}: {}", method, e.message()),
            })?
        };
    }
    Ok(NegotiatedMethods { chosen })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_platform::ErrorKind;

    fn server_kexinit(hostkeys: &[&str]) -> KexInit {
        let prefs = MethodPreferences::default();
        let mut lists: [Vec<String>; 10] = Default::default();
        for method in MethodType::ALL {
            lists[method as usize] = prefs.resolve(method, true).unwrap();
        }
        lists[MethodType::HostKey as usize] = hostkeys.iter().map(|s| s.to_string()).collect();
        KexInit::new(lists)
    }

    #[test]
    fn test_kexinit_wire_round_trip() {
        let kexinit = MethodPreferences::default().kexinit(false).unwrap();
        let parsed = KexInit::from_bytes(&kexinit.to_bytes()).unwrap();
        assert_eq!(parsed, kexinit);
        assert!(parsed.list(MethodType::LangCs).is_empty());
    }

    #[test]
    fn test_unknown_preference_fails_at_resolve() {
        let mut prefs = MethodPreferences::default();
        prefs.set(MethodType::HostKey, "blah");
        let err = prefs.kexinit(false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MethodNotSupported);
    }

    #[test]
    fn test_compress_flag_prefers_zlib() {
        let prefs = MethodPreferences::default();
        assert_eq!(prefs.resolve(MethodType::CompCs, false).unwrap(), vec!["none"]);
        assert_eq!(prefs.resolve(MethodType::CompSc, true).unwrap()[0], "zlib@openssh.com");
    }

    #[test]
    fn test_negotiate_picks_client_order() {
        let mut prefs = MethodPreferences::default();
        prefs.set(MethodType::HostKey, "rsa-sha2-256,ssh-ed25519");
        let client = prefs.kexinit(false).unwrap();
        let server = server_kexinit(&["ssh-ed25519", "rsa-sha2-256"]);
        let negotiated = negotiate(&client, &server).unwrap();
        assert_eq!(negotiated.get(MethodType::HostKey), Some("rsa-sha2-256"));
        assert_eq!(negotiated.get(MethodType::CompCs), Some("none"));
        assert_eq!(negotiated.get(MethodType::LangSc), None);
    }

    #[test]
    fn test_negotiate_without_overlap() {
        let mut prefs = MethodPreferences::default();
        prefs.set(MethodType::HostKey, "ssh-dss");
        let client = prefs.kexinit(false).unwrap();
        let server = server_kexinit(&["ssh-ed25519"]);
        let err = negotiate(&client, &server).unwrap_err();
        assert_eq!(err.code(), ErrorCode::KexFailure);
    }

    #[test]
    fn test_method_category_validation() {
        assert!(MethodType::try_from(9).is_ok());
        assert_eq!(
            MethodType::try_from(2222).unwrap_err().kind(),
            ErrorKind::MethodNotSupported
        );
    }
}
