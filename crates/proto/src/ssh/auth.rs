//! SSH authentication protocol messages (RFC 4252, RFC 4256).
//!
//! Codecs for the client side of user authentication and the collaborator
//! traits the strategies depend on:
//! - [`IdentitySigner`]: something that can sign with a private key the engine never sees
//! - [`KeyDecoder`]: turns raw private key material (plus passphrase) into a signer
//! - [`KeyboardInteractivePrompt`]: answers keyboard-interactive prompt sets
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::auth::{AuthMethod, AuthRequest};
//!
//! let request = AuthRequest::new(
//!     "user",
//!     "ssh-connection",
//!     AuthMethod::Password("secret".to_string()),
//! );
//! assert_eq!(request.to_bytes()[0], 50);
//! ```

use crate::ssh::message::MessageType;
use crate::ssh::wire::{Reader, Writer};
use base64::Engine;
use tether_platform::{ErrorCode, TetherError, TetherResult};
use zeroize::Zeroize;

/// Service requested before authentication.
pub const SERVICE_USERAUTH: &str = "ssh-userauth";

/// Service authenticated for.
pub const SERVICE_CONNECTION: &str = "ssh-connection";

/// Signs authentication data with a private key held elsewhere.
pub trait IdentitySigner: Send {
    /// Public key algorithm name, e.g. `ssh-ed25519`.
    fn algorithm(&self) -> &str;

    /// Public key blob in SSH wire format.
    fn public_key(&self) -> &[u8];

    /// Signs `data`, returning an SSH signature blob.
    fn sign(&self, data: &[u8]) -> TetherResult<Vec<u8>>;
}

/// Decodes private key material supplied from a file or from memory.
pub trait KeyDecoder: Send + Sync {
    /// Builds a signer. `public_key` is the optional matching public key
    /// blob; `passphrase` unlocks encrypted keys.
    fn decode(
        &self,
        private_key: &[u8],
        public_key: Option<&[u8]>,
        passphrase: Option<&str>,
    ) -> TetherResult<Box<dyn IdentitySigner>>;
}

/// One keyboard-interactive prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Text shown to the user
    pub text: String,
    /// Whether the answer may be echoed
    pub echo: bool,
}

/// Answers keyboard-interactive prompt sets.
pub trait KeyboardInteractivePrompt {
    /// Returns one response per prompt, in order.
    fn prompt(&mut self, username: &str, instructions: &str, prompts: &[Prompt]) -> Vec<String>;
}

/// Authentication method carried in a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Query the allowed methods.
    None,
    /// Password authentication.
    Password(String),
    /// Public key authentication.
    PublicKey {
        /// Algorithm name (e.g., "ssh-ed25519", "rsa-sha2-256")
        algorithm: String,
        /// Public key blob
        public_key: Vec<u8>,
        /// Signature (if present)
        signature: Option<Vec<u8>>,
    },
    /// Keyboard-interactive authentication.
    KeyboardInteractive,
}

impl AuthMethod {
    /// Returns the method name.
    pub fn name(&self) -> &str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
            AuthMethod::PublicKey { .. } => "publickey",
            AuthMethod::KeyboardInteractive => "keyboard-interactive",
        }
    }
}

impl Drop for AuthMethod {
    fn drop(&mut self) {
        if let AuthMethod::Password(ref mut password) = self {
            password.zeroize();
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    user_name: String,
    service_name: String,
    method: AuthMethod,
}

impl AuthRequest {
    /// Creates a request.
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Returns the method.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let w = Writer::message(MessageType::UserauthRequest as u8)
            .string(&self.user_name)
            .string(&self.service_name)
            .string(self.method.name());

        let w = match &self.method {
            AuthMethod::None => w,
            AuthMethod::Password(password) => w.bool(false).string(password),
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                let w = w
                    .bool(signature.is_some())
                    .string(algorithm)
                    .bytes(public_key);
                match signature {
                    Some(sig) => w.bytes(sig),
                    None => w,
                }
            }
            // language tag, submethods
            AuthMethod::KeyboardInteractive => w.string("").string(""),
        };
        w.finish()
    }
}

/// Builds the data a public key signature covers (RFC 4252 Section 7).
pub fn construct_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key_blob: &[u8],
) -> Vec<u8> {
    Writer::new()
        .bytes(session_id)
        .u8(MessageType::UserauthRequest as u8)
        .string(user_name)
        .string(service_name)
        .string("publickey")
        .bool(true)
        .string(algorithm)
        .bytes(public_key_blob)
        .finish()
}

/// SSH_MSG_SERVICE_REQUEST.
pub fn service_request(service: &str) -> Vec<u8> {
    Writer::message(MessageType::ServiceRequest as u8)
        .string(service)
        .finish()
}

/// Keyboard-interactive challenge (RFC 4256 Section 3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRequest {
    /// Challenge name
    pub name: String,
    /// Instructions for the user
    pub instruction: String,
    /// Prompts to answer
    pub prompts: Vec<Prompt>,
}

impl InfoRequest {
    fn read(r: &mut Reader<'_>) -> TetherResult<Self> {
        let name = r.string()?;
        let instruction = r.string()?;
        let _language = r.string()?;
        let count = r.u32()?;
        // Each prompt needs at least 5 bytes; reject absurd counts up front.
        if count as usize > r.remaining() / 5 {
            return Err(TetherError::protocol(format!(
                "INFO_REQUEST claims {} prompts",
                count
            )));
        }
        let mut prompts = Vec::with_capacity(count as usize);
        for _ in 0..count {
            prompts.push(Prompt {
                text: r.string()?,
                echo: r.bool()?,
            });
        }
        Ok(Self {
            name,
            instruction,
            prompts,
        })
    }
}

/// SSH_MSG_USERAUTH_INFO_RESPONSE.
pub fn info_response(responses: &[String]) -> Vec<u8> {
    let mut w = Writer::message(MessageType::UserauthInfoResponse as u8).u32(responses.len() as u32);
    for response in responses {
        w = w.string(response);
    }
    w.finish()
}

/// Server replies during authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthReply {
    /// Authenticated
    Success,
    /// Rejected; lists the methods that can continue
    Failure {
        /// Methods that may continue
        methods: Vec<String>,
        /// True when this step succeeded but more are required
        partial_success: bool,
    },
    /// Text to show the user
    Banner(String),
    /// Public key acceptable (reply to an unsigned query)
    PkOk,
    /// Password expired; carries the server's prompt
    PasswordChangeRequest(String),
    /// Keyboard-interactive challenge
    InfoRequest(InfoRequest),
}

impl AuthReply {
    /// Parses a reply; `method` names the method in progress, which decides
    /// how message 60 is read.
    pub fn parse(payload: &[u8], method: &str) -> TetherResult<Self> {
        let mut r = Reader::new(payload);
        let msg = r.u8()?;
        match MessageType::from_u8(msg) {
            Some(MessageType::UserauthSuccess) => Ok(AuthReply::Success),
            Some(MessageType::UserauthFailure) => Ok(AuthReply::Failure {
                methods: r.name_list()?,
                partial_success: r.bool()?,
            }),
            Some(MessageType::UserauthBanner) => Ok(AuthReply::Banner(r.string()?)),
            Some(MessageType::UserauthInfoRequest) => match method {
                "publickey" => Ok(AuthReply::PkOk),
                "password" => Ok(AuthReply::PasswordChangeRequest(r.string()?)),
                "keyboard-interactive" => Ok(AuthReply::InfoRequest(InfoRequest::read(&mut r)?)),
                other => Err(TetherError::protocol(format!(
                    "unexpected message 60 during '{}' authentication",
                    other
                ))),
            },
            _ => Err(TetherError::protocol(format!(
                "unexpected message {} during authentication",
                msg
            ))),
        }
    }
}

/// Reads an OpenSSH public key line (`<type> <base64> [comment]`).
///
/// Returns the key type name and the decoded blob.
pub fn parse_public_key_line(contents: &[u8]) -> TetherResult<(String, Vec<u8>)> {
    let text = String::from_utf8_lossy(contents);
    let mut fields = text.split_whitespace();
    let (Some(key_type), Some(encoded)) = (fields.next(), fields.next()) else {
        return Err(TetherError::Authentication {
            code: ErrorCode::File,
            message: "public key file is not in '<type> <base64>' form".to_string(),
        });
    };
    let blob = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| TetherError::Authentication {
            code: ErrorCode::File,
            message: format!("invalid base64 in public key: {}", e),
        })?;
    Ok((key_type.to_string(), blob))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_request_layout() {
        let bytes = AuthRequest::new("foo", SERVICE_CONNECTION, AuthMethod::Password("pw".into()))
            .to_bytes();
        let mut r = Reader::expect(&bytes, 50).unwrap();
        assert_eq!(r.string().unwrap(), "foo");
        assert_eq!(r.string().unwrap(), "ssh-connection");
        assert_eq!(r.string().unwrap(), "password");
        assert!(!r.bool().unwrap());
        assert_eq!(r.string().unwrap(), "pw");
    }

    #[test]
    fn test_signature_data_matches_request_prefix() {
        let data = construct_signature_data(b"sid", "u", SERVICE_CONNECTION, "ssh-ed25519", b"blob");
        let request = AuthRequest::new(
            "u",
            SERVICE_CONNECTION,
            AuthMethod::PublicKey {
                algorithm: "ssh-ed25519".into(),
                public_key: b"blob".to_vec(),
                signature: Some(b"sig".to_vec()),
            },
        )
        .to_bytes();
        // data = string(session id) || request without the trailing signature
        let unsigned = &data[4 + 3..];
        assert_eq!(&request[..unsigned.len()], unsigned);
    }

    #[test]
    fn test_failure_reply() {
        let payload = Writer::message(51)
            .name_list(&["publickey", "password"])
            .bool(false)
            .finish();
        assert_eq!(
            AuthReply::parse(&payload, "password").unwrap(),
            AuthReply::Failure {
                methods: vec!["publickey".into(), "password".into()],
                partial_success: false
            }
        );
    }

    #[test]
    fn test_message_60_depends_on_method() {
        let payload = Writer::message(60)
            .string("")
            .string("Enter code")
            .string("")
            .u32(1)
            .string("Code: ")
            .bool(false)
            .finish();
        match AuthReply::parse(&payload, "keyboard-interactive").unwrap() {
            AuthReply::InfoRequest(req) => {
                assert_eq!(req.instruction, "Enter code");
                assert_eq!(req.prompts.len(), 1);
                assert!(!req.prompts[0].echo);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(AuthReply::parse(&payload, "publickey").unwrap(), AuthReply::PkOk);
    }

    #[test]
    fn test_info_request_with_huge_count_rejected() {
        let payload = Writer::message(60)
            .string("")
            .string("")
            .string("")
            .u32(u32::MAX)
            .finish();
        assert!(AuthReply::parse(&payload, "keyboard-interactive").is_err());
    }

    #[test]
    fn test_public_key_line() {
        let (key_type, blob) = parse_public_key_line(b"ssh-ed25519 AQID user@host\n").unwrap();
        assert_eq!(key_type, "ssh-ed25519");
        assert_eq!(blob, vec![1, 2, 3]);
        assert!(parse_public_key_line(b"garbage").is_err());
    }
}
