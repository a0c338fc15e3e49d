//! Client authentication strategies (RFC 4252, RFC 4256).
//!
//! Each strategy is a resumable step function on the session state. One
//! attempt may be in flight at a time; the `ssh-userauth` service request is
//! made once and shared by every later attempt.

use super::inner::SessionInner;
use crate::ssh::auth::{
    construct_signature_data, info_response, parse_public_key_line, service_request, AuthMethod,
    AuthReply, AuthRequest, IdentitySigner, KeyboardInteractivePrompt, SERVICE_CONNECTION,
    SERVICE_USERAUTH,
};
use crate::ssh::message::MessageType;
use crate::ssh::nonblocking::{Halt, Step};
use crate::ssh::wire::Reader;
use std::path::Path;
use tether_platform::{ErrorCode, TetherError, TetherResult};
use tracing::{debug, info};
use zeroize::Zeroize;

#[derive(Debug, Default)]
pub(crate) struct AuthProgress {
    service_requested: bool,
    service_accepted: bool,
    pub(crate) authenticated: bool,
    pub(crate) banner: Option<String>,
    pending: Option<PendingAuth>,
    /// Agent identities already rejected in the current agent attempt.
    pub(crate) agent_tried: usize,
}

#[derive(Debug, PartialEq, Eq)]
struct PendingAuth {
    method: &'static str,
    user: String,
    key: Option<Vec<u8>>,
    /// Set when our prompt answers were withheld; reported once the server replies.
    withheld: Option<String>,
}

fn rejected(method: &str, methods: &[String], partial_success: bool) -> TetherError {
    let message = if partial_success {
        format!(
            "{} accepted but more authentication is required; continue with: {}",
            method,
            methods.join(",")
        )
    } else {
        format!("{} rejected; continue with: {}", method, methods.join(","))
    };
    TetherError::Authentication {
        code: ErrorCode::AuthenticationFailed,
        message,
    }
}

fn file_error(path: &Path, err: std::io::Error) -> TetherError {
    TetherError::Authentication {
        code: ErrorCode::File,
        message: format!("unable to read {}: {}", path.display(), err),
    }
}

impl SessionInner {
    /// Checks that `method` for `user` may start or resume now.
    fn begin_auth(&mut self, method: &'static str, user: &str, key: Option<&[u8]>) -> Step<()> {
        self.require_ready()?;
        if self.auth.authenticated {
            return Err(TetherError::invalid_use("session is already authenticated").into());
        }
        match &self.auth.pending {
            Some(p) if p.method != method || p.user != user || p.key.as_deref() != key => {
                Err(TetherError::invalid_use(format!(
                    "{} authentication is in progress",
                    p.method
                ))
                .into())
            }
            _ => Ok(()),
        }
    }

    /// Requests the `ssh-userauth` service once.
    fn userauth_service(&mut self) -> Step<()> {
        if self.auth.service_accepted {
            return Ok(());
        }
        if !self.auth.service_requested {
            self.queue(service_request(SERVICE_USERAUTH));
            self.auth.service_requested = true;
        }
        loop {
            let Some(payload) = self.pump()? else {
                continue;
            };
            match MessageType::peek(&payload) {
                Some(MessageType::ServiceAccept) => {
                    self.auth.service_accepted = true;
                    debug!("userauth service accepted");
                    return Ok(());
                }
                Some(MessageType::UserauthBanner) => {
                    let mut r = Reader::new(&payload[1..]);
                    self.auth.banner = Some(r.string()?);
                }
                _ => {
                    return Err(TetherError::protocol(format!(
                        "expected SERVICE_ACCEPT, got message {}",
                        payload[0]
                    ))
                    .into())
                }
            }
        }
    }

    /// Queues the request once per attempt.
    fn send_auth<F>(
        &mut self,
        method: &'static str,
        user: &str,
        key: Option<&[u8]>,
        request: F,
    ) -> Step<()>
    where
        F: FnOnce() -> TetherResult<Vec<u8>>,
    {
        if self.auth.pending.is_none() {
            let payload = request()?;
            self.queue(payload);
            self.auth.pending = Some(PendingAuth {
                method,
                user: user.to_string(),
                key: key.map(<[u8]>::to_vec),
                withheld: None,
            });
            debug!(method, user, "authentication request sent");
        }
        Ok(())
    }

    /// Next reply for `method`, storing banners on the way.
    fn auth_reply(&mut self, method: &str) -> Step<AuthReply> {
        loop {
            let Some(payload) = self.pump()? else {
                continue;
            };
            match AuthReply::parse(&payload, method)? {
                AuthReply::Banner(text) => self.auth.banner = Some(text),
                reply => return Ok(reply),
            }
        }
    }

    /// Clears the in-flight attempt unless the step only blocked.
    fn settle_auth<T>(&mut self, result: Step<T>) -> Step<T> {
        if !matches!(result, Err(Halt::Block(_))) {
            self.auth.pending = None;
        }
        result
    }

    fn authenticated(&mut self, method: &str) {
        self.auth.authenticated = true;
        self.auth.agent_tried = 0;
        info!(method, "authenticated");
    }

    pub(crate) fn userauth_list(&mut self, user: &str) -> Step<Option<Vec<String>>> {
        if self.auth.authenticated {
            return Ok(None);
        }
        self.begin_auth("none", user, None)?;
        let result = self.list_steps(user);
        self.settle_auth(result)
    }

    fn list_steps(&mut self, user: &str) -> Step<Option<Vec<String>>> {
        self.userauth_service()?;
        self.send_auth("none", user, None, || {
            Ok(AuthRequest::new(user, SERVICE_CONNECTION, AuthMethod::None).to_bytes())
        })?;
        loop {
            match self.auth_reply("none")? {
                AuthReply::Success => {
                    self.authenticated("none");
                    return Ok(None);
                }
                AuthReply::Failure { methods, .. } => return Ok(Some(methods)),
                other => debug!(?other, "ignoring reply to none request"),
            }
        }
    }

    pub(crate) fn userauth_password(&mut self, user: &str, password: &str) -> Step<()> {
        self.begin_auth("password", user, None)?;
        let result = self.password_steps(user, password);
        self.settle_auth(result)
    }

    fn password_steps(&mut self, user: &str, password: &str) -> Step<()> {
        self.userauth_service()?;
        self.send_auth("password", user, None, || {
            let method = AuthMethod::Password(password.to_string());
            Ok(AuthRequest::new(user, SERVICE_CONNECTION, method).to_bytes())
        })?;
        loop {
            match self.auth_reply("password")? {
                AuthReply::Success => {
                    self.authenticated("password");
                    return Ok(());
                }
                AuthReply::Failure {
                    methods,
                    partial_success,
                } => return Err(rejected("password", &methods, partial_success).into()),
                AuthReply::PasswordChangeRequest(prompt) => {
                    return Err(TetherError::Authentication {
                        code: ErrorCode::PasswordExpired,
                        message: format!("password expired: {}", prompt),
                    }
                    .into())
                }
                other => debug!(?other, "ignoring reply to password request"),
            }
        }
    }

    pub(crate) fn userauth_publickey(&mut self, user: &str, signer: &dyn IdentitySigner) -> Step<()> {
        let blob = signer.public_key().to_vec();
        self.begin_auth("publickey", user, Some(&blob))?;
        let result = self.publickey_steps(user, signer, &blob);
        self.settle_auth(result)
    }

    fn publickey_steps(&mut self, user: &str, signer: &dyn IdentitySigner, blob: &[u8]) -> Step<()> {
        self.userauth_service()?;
        let session_id = self.session_id.clone();
        self.send_auth("publickey", user, Some(blob), || {
            let algorithm = signer.algorithm();
            let data =
                construct_signature_data(&session_id, user, SERVICE_CONNECTION, algorithm, blob);
            let signature = signer.sign(&data)?;
            let method = AuthMethod::PublicKey {
                algorithm: algorithm.to_string(),
                public_key: blob.to_vec(),
                signature: Some(signature),
            };
            Ok(AuthRequest::new(user, SERVICE_CONNECTION, method).to_bytes())
        })?;
        loop {
            match self.auth_reply("publickey")? {
                AuthReply::Success => {
                    self.authenticated("publickey");
                    return Ok(());
                }
                AuthReply::Failure {
                    methods,
                    partial_success,
                } => return Err(rejected("publickey", &methods, partial_success).into()),
                other => debug!(?other, "ignoring reply to publickey request"),
            }
        }
    }

    pub(crate) fn userauth_publickey_frommemory(
        &mut self,
        user: &str,
        public_key: Option<&[u8]>,
        private_key: &[u8],
        passphrase: Option<&str>,
    ) -> Step<()> {
        let decoder = self
            .config
            .key_decoder
            .clone()
            .ok_or_else(|| TetherError::MethodNotSupported {
                message: "no private key decoder configured".to_string(),
            })?;
        let public_blob = match public_key {
            Some(contents) => Some(parse_public_key_line(contents)?.1),
            None => None,
        };
        let signer = decoder.decode(private_key, public_blob.as_deref(), passphrase)?;
        self.userauth_publickey(user, signer.as_ref())
    }

    pub(crate) fn userauth_publickey_fromfile(
        &mut self,
        user: &str,
        public_key: Option<&Path>,
        private_key: &Path,
        passphrase: Option<&str>,
    ) -> Step<()> {
        let mut private = std::fs::read(private_key).map_err(|e| file_error(private_key, e))?;
        let public = match public_key {
            Some(path) => Some(std::fs::read(path).map_err(|e| file_error(path, e))?),
            None => None,
        };
        let result =
            self.userauth_publickey_frommemory(user, public.as_deref(), &private, passphrase);
        private.zeroize();
        result
    }

    pub(crate) fn userauth_keyboard_interactive(
        &mut self,
        user: &str,
        prompt: &mut dyn KeyboardInteractivePrompt,
    ) -> Step<()> {
        self.begin_auth("keyboard-interactive", user, None)?;
        let result = self.keyboard_interactive_steps(user, prompt);
        self.settle_auth(result)
    }

    fn keyboard_interactive_steps(
        &mut self,
        user: &str,
        prompt: &mut dyn KeyboardInteractivePrompt,
    ) -> Step<()> {
        self.userauth_service()?;
        self.send_auth("keyboard-interactive", user, None, || {
            let method = AuthMethod::KeyboardInteractive;
            Ok(AuthRequest::new(user, SERVICE_CONNECTION, method).to_bytes())
        })?;
        loop {
            match self.auth_reply("keyboard-interactive")? {
                AuthReply::Success => {
                    self.authenticated("keyboard-interactive");
                    return Ok(());
                }
                AuthReply::Failure {
                    methods,
                    partial_success,
                } => {
                    let withheld = self.auth.pending.as_mut().and_then(|p| p.withheld.take());
                    if let Some(message) = withheld {
                        return Err(TetherError::invalid_argument(message).into());
                    }
                    return Err(rejected("keyboard-interactive", &methods, partial_success).into());
                }
                AuthReply::InfoRequest(request) => {
                    debug!(prompts = request.prompts.len(), "keyboard-interactive challenge");
                    let mut responses = prompt.prompt(user, &request.instruction, &request.prompts);
                    if responses.len() != request.prompts.len() {
                        let message = format!(
                            "{} responses for {} prompts",
                            responses.len(),
                            request.prompts.len()
                        );
                        responses.zeroize();
                        // The server still expects an answer; an empty one ends the exchange.
                        debug!(%message, "withholding keyboard-interactive responses");
                        self.queue(info_response(&[]));
                        if let Some(pending) = self.auth.pending.as_mut() {
                            pending.withheld = Some(message);
                        }
                        continue;
                    }
                    self.queue(info_response(&responses));
                    responses.zeroize();
                }
                other => debug!(?other, "ignoring reply to keyboard-interactive request"),
            }
        }
    }
}
