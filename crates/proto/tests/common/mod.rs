//! Scripted in-memory SSH server for integration tests.
//!
//! [`FakeTransport`] implements the transport seam. Every payload the
//! client sends is answered synchronously by [`ServerState::handle`], so the
//! answer is already queued when the client next receives. WouldBlock can be
//! injected on either direction with the `block_*` counters.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tether_platform::TetherResult;
use tether_proto::ssh::kex::{KexInit, MethodType};
use tether_proto::ssh::message::MessageType;
use tether_proto::ssh::nonblocking::{BlockDirections, Progress};
use tether_proto::ssh::session::{Session, SessionConfig};
use tether_proto::ssh::sftp::{AttrFlags, SftpAttributes};
use tether_proto::ssh::transport::{KexContext, KexOutcome, Transport};
use tether_proto::ssh::wire::{Reader, Writer};

pub const SERVER_BANNER: &str = "SSH-2.0-OpenSSH_9.6 scripted";
pub const USER: &str = "alice";
pub const PASSWORD: &str = "correct horse";
pub const SESSION_ID: [u8; 32] = [7; 32];
pub const HOME: &str = "/home/alice";

/// Ed25519 host key blob presented by the server.
pub fn host_key_blob() -> Vec<u8> {
    Writer::new().string("ssh-ed25519").bytes(&[0x42; 32]).finish()
}

/// Installs a test subscriber once; repeated calls are harmless.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tether_proto=trace")
        .with_test_writer()
        .try_init();
}

/// Server behaviour knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub password: String,
    pub expired_password: bool,
    pub allow_none: bool,
    pub accepted_key: Option<Vec<u8>>,
    pub auth_banner: Option<String>,
    /// Prompts sent for keyboard-interactive; the first answer must be the password
    pub kbd_prompts: Vec<(String, bool)>,
    pub exec_output: Vec<u8>,
    pub exec_stderr: Vec<u8>,
    pub exit_status: u32,
    pub exit_signal: Option<String>,
    pub refuse_open: bool,
    /// Channel request names the server refuses
    pub deny_requests: Vec<String>,
    pub answer_keepalive: bool,
    /// Window and packet size granted to the client
    pub window: u32,
    pub max_packet: u32,
    /// When set the server never sends WINDOW_ADJUST
    pub hold_window: bool,
    pub server_kexinit: Option<Vec<u8>>,
    /// Port reported when the client asks to listen on port 0
    pub forward_port: u32,
    pub deny_forward: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            password: PASSWORD.to_string(),
            expired_password: false,
            allow_none: false,
            accepted_key: None,
            auth_banner: None,
            kbd_prompts: vec![("Password: ".to_string(), false)],
            exec_output: b"hello from exec\n".to_vec(),
            exec_stderr: Vec::new(),
            exit_status: 0,
            exit_signal: None,
            refuse_open: false,
            deny_requests: Vec::new(),
            answer_keepalive: true,
            window: 2 * 1024 * 1024,
            max_packet: 32768,
            hold_window: false,
            server_kexinit: None,
            forward_port: 40022,
            deny_forward: false,
        }
    }
}

#[derive(Debug)]
enum ScpSource {
    AwaitStart,
    AwaitTimesAck,
    AwaitFileAck,
    Done,
}

#[derive(Debug)]
struct ScpSink {
    path: String,
    line: Vec<u8>,
    expected: Option<u64>,
    content: Vec<u8>,
}

#[derive(Debug, Default)]
struct SftpServer {
    inbound: Vec<u8>,
    handles: HashMap<Vec<u8>, (String, bool, bool)>,
    next_handle: u32,
}

#[derive(Debug)]
enum Process {
    None,
    Exec,
    Echo,
    Sftp(SftpServer),
    ScpSource { path: String, times: bool, stage: ScpSource },
    ScpSink(ScpSink),
}

#[derive(Debug)]
struct ServerChannel {
    client_id: u32,
    process: Process,
    closed: bool,
}

/// Everything the scripted server knows, shared with the test body.
#[derive(Debug)]
pub struct ServerState {
    pub config: ServerConfig,
    pub to_client: VecDeque<Vec<u8>>,
    pub from_client: Vec<Vec<u8>>,
    pub block_sends: usize,
    pub block_recvs: usize,
    pub block_banner: usize,
    pub kex: Option<KexContext>,
    pub files: BTreeMap<String, Vec<u8>>,
    pub dirs: BTreeSet<String>,
    pub links: BTreeMap<String, String>,
    /// Permission bits applied through SETSTAT
    pub modes: BTreeMap<String, u32>,
    pub exec_log: Vec<String>,
    pub env: Vec<(String, String)>,
    pub scp_times: Vec<String>,
    pub forwards: Vec<(String, u32)>,
    pub cancelled: Vec<u32>,
    pub refused_forwards: u32,
    pub keepalives: u32,
    pub disconnected: bool,
    channels: HashMap<u32, ServerChannel>,
    next_channel: u32,
}

impl ServerState {
    fn new(config: ServerConfig) -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert("/".to_string());
        dirs.insert(HOME.to_string());
        Self {
            config,
            to_client: VecDeque::new(),
            from_client: Vec::new(),
            block_sends: 0,
            block_recvs: 0,
            block_banner: 0,
            kex: None,
            files: BTreeMap::new(),
            dirs,
            links: BTreeMap::new(),
            modes: BTreeMap::new(),
            exec_log: Vec::new(),
            env: Vec::new(),
            scp_times: Vec::new(),
            forwards: Vec::new(),
            cancelled: Vec::new(),
            refused_forwards: 0,
            keepalives: 0,
            disconnected: false,
            channels: HashMap::new(),
            next_channel: 100,
        }
    }

    fn push(&mut self, payload: Vec<u8>) {
        self.to_client.push_back(payload);
    }

    /// Messages the client sent with this message number.
    pub fn sent_of(&self, msg: MessageType) -> Vec<Vec<u8>> {
        self.from_client
            .iter()
            .filter(|p| p.first() == Some(&(msg as u8)))
            .cloned()
            .collect()
    }

    /// Channels the server still holds open.
    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }

    /// Channel request names the client sent, in order.
    pub fn channel_requests(&self) -> Vec<String> {
        self.sent_of(MessageType::ChannelRequest)
            .iter()
            .map(|p| {
                let mut r = Reader::new(&p[1..]);
                r.u32().unwrap();
                r.string().unwrap()
            })
            .collect()
    }

    /// Server channel id for a client channel id.
    pub fn server_id(&self, client_id: u32) -> Option<u32> {
        self.channels
            .iter()
            .find(|(_, ch)| ch.client_id == client_id)
            .map(|(id, _)| *id)
    }

    fn simple(&mut self, msg: MessageType, client_id: u32) {
        self.push(Writer::message(msg as u8).u32(client_id).finish());
    }

    /// Sends data to the client on one of its channels.
    pub fn channel_data(&mut self, client_id: u32, data: &[u8]) {
        for chunk in data.chunks(16 * 1024) {
            self.push(
                Writer::message(MessageType::ChannelData as u8)
                    .u32(client_id)
                    .bytes(chunk)
                    .finish(),
            );
        }
    }

    fn channel_stderr(&mut self, client_id: u32, data: &[u8]) {
        self.push(
            Writer::message(MessageType::ChannelExtendedData as u8)
                .u32(client_id)
                .u32(1)
                .bytes(data)
                .finish(),
        );
    }

    /// Grants the client more outbound window.
    pub fn window_adjust(&mut self, client_id: u32, bytes: u32) {
        self.push(
            Writer::message(MessageType::ChannelWindowAdjust as u8)
                .u32(client_id)
                .u32(bytes)
                .finish(),
        );
    }

    /// Ends the remote process: exit status or signal, EOF, CLOSE.
    fn finish(&mut self, server_id: u32, status: u32) {
        let Some(ch) = self.channels.get_mut(&server_id) else {
            return;
        };
        if ch.closed {
            return;
        }
        ch.closed = true;
        let client_id = ch.client_id;
        let exit = match self.config.exit_signal.clone() {
            Some(signal) if matches!(ch.process, Process::Exec) => Writer::message(MessageType::ChannelRequest as u8)
                .u32(client_id)
                .string("exit-signal")
                .bool(false)
                .string(&signal)
                .bool(false)
                .string("killed by test")
                .string("")
                .finish(),
            _ => Writer::message(MessageType::ChannelRequest as u8)
                .u32(client_id)
                .string("exit-status")
                .bool(false)
                .u32(status)
                .finish(),
        };
        self.push(exit);
        self.simple(MessageType::ChannelEof, client_id);
        self.simple(MessageType::ChannelClose, client_id);
    }

    /// Opens a `forwarded-tcpip` channel towards the client.
    pub fn open_forwarded(&mut self, port: u32, originator: &str) -> u32 {
        let server_id = self.next_channel;
        self.next_channel += 1;
        self.push(
            Writer::message(MessageType::ChannelOpen as u8)
                .string("forwarded-tcpip")
                .u32(server_id)
                .u32(self.config.window)
                .u32(self.config.max_packet)
                .string("127.0.0.1")
                .u32(port)
                .string(originator)
                .u32(51000)
                .finish(),
        );
        server_id
    }

    /// Sends SSH_MSG_DISCONNECT.
    pub fn disconnect(&mut self, description: &str) {
        self.push(
            Writer::message(MessageType::Disconnect as u8)
                .u32(11)
                .string(description)
                .string("")
                .finish(),
        );
    }

    fn kexinit(&self) -> Vec<u8> {
        if let Some(custom) = &self.config.server_kexinit {
            return custom.clone();
        }
        server_kexinit(|method| method.supported().iter().map(|s| s.to_string()).collect())
    }

    /// Reacts to one client payload.
    fn handle(&mut self, payload: &[u8]) -> io::Result<()> {
        self.from_client.push(payload.to_vec());
        let mut r = Reader::new(&payload[1..]);
        let bad = |e: tether_platform::TetherError| io::Error::new(io::ErrorKind::InvalidData, e);
        match MessageType::from_u8(payload[0]) {
            Some(MessageType::KexInit) => {
                let reply = self.kexinit();
                self.push(reply);
            }
            Some(MessageType::ServiceRequest) => {
                let service = r.string().map_err(bad)?;
                self.push(
                    Writer::message(MessageType::ServiceAccept as u8)
                        .string(&service)
                        .finish(),
                );
            }
            Some(MessageType::UserauthRequest) => self.userauth(&mut r).map_err(bad)?,
            Some(MessageType::UserauthInfoResponse) => {
                let count = r.u32().map_err(bad)?;
                let first = if count > 0 { r.string().map_err(bad)? } else { String::new() };
                if count as usize == self.config.kbd_prompts.len() && first == self.config.password {
                    self.push(vec![MessageType::UserauthSuccess as u8]);
                } else {
                    self.auth_failure();
                }
            }
            Some(MessageType::GlobalRequest) => self.global(&mut r).map_err(bad)?,
            Some(MessageType::ChannelOpen) => self.channel_open(&mut r).map_err(bad)?,
            Some(MessageType::ChannelOpenConfirmation) => {
                let server_id = r.u32().map_err(bad)?;
                let client_id = r.u32().map_err(bad)?;
                self.channels.insert(
                    server_id,
                    ServerChannel {
                        client_id,
                        process: Process::Echo,
                        closed: false,
                    },
                );
            }
            Some(MessageType::ChannelOpenFailure) => self.refused_forwards += 1,
            Some(MessageType::ChannelRequest) => self.channel_request(&mut r).map_err(bad)?,
            Some(MessageType::ChannelData) => {
                let server_id = r.u32().map_err(bad)?;
                let data = r.bytes().map_err(bad)?.to_vec();
                self.channel_input(server_id, &data);
            }
            Some(MessageType::ChannelEof) => {
                let server_id = r.u32().map_err(bad)?;
                let status = match self.channels.get(&server_id).map(|c| &c.process) {
                    Some(Process::Exec) => self.config.exit_status,
                    _ => 0,
                };
                self.finish(server_id, status);
            }
            Some(MessageType::ChannelClose) => {
                let server_id = r.u32().map_err(bad)?;
                if let Some(ch) = self.channels.remove(&server_id) {
                    if !ch.closed {
                        self.simple(MessageType::ChannelClose, ch.client_id);
                    }
                }
            }
            Some(MessageType::Disconnect) => self.disconnected = true,
            _ => {}
        }
        Ok(())
    }

    fn auth_failure(&mut self) {
        self.push(
            Writer::message(MessageType::UserauthFailure as u8)
                .name_list(&["publickey", "password", "keyboard-interactive"])
                .bool(false)
                .finish(),
        );
    }

    fn userauth(&mut self, r: &mut Reader<'_>) -> TetherResult<()> {
        let user = r.string()?;
        let _service = r.string()?;
        let method = r.string()?;
        if let Some(banner) = self.config.auth_banner.take() {
            self.push(
                Writer::message(MessageType::UserauthBanner as u8)
                    .string(&banner)
                    .string("")
                    .finish(),
            );
        }
        let ok = user == USER;
        match method.as_str() {
            "none" if ok && self.config.allow_none => self.push(vec![MessageType::UserauthSuccess as u8]),
            "password" => {
                let _change = r.bool()?;
                let password = r.string()?;
                if ok && password == self.config.password && self.config.expired_password {
                    self.push(
                        Writer::message(MessageType::UserauthInfoRequest as u8)
                            .string("Password expired, change it now")
                            .string("")
                            .finish(),
                    );
                } else if ok && password == self.config.password {
                    self.push(vec![MessageType::UserauthSuccess as u8]);
                } else {
                    self.auth_failure();
                }
            }
            "publickey" => {
                let signed = r.bool()?;
                let _algorithm = r.string()?;
                let blob = r.bytes()?.to_vec();
                let signature = if signed { r.bytes()?.to_vec() } else { Vec::new() };
                let accepted = self.config.accepted_key.as_deref() == Some(&blob[..]);
                if ok && signed && accepted && !signature.is_empty() {
                    self.push(vec![MessageType::UserauthSuccess as u8]);
                } else {
                    self.auth_failure();
                }
            }
            "keyboard-interactive" => {
                let mut w = Writer::message(MessageType::UserauthInfoRequest as u8)
                    .string("scripted")
                    .string("answer the prompts")
                    .string("")
                    .u32(self.config.kbd_prompts.len() as u32);
                for (prompt, echo) in &self.config.kbd_prompts {
                    w = w.string(prompt).bool(*echo);
                }
                self.push(w.finish());
            }
            _ => self.auth_failure(),
        }
        Ok(())
    }

    fn global(&mut self, r: &mut Reader<'_>) -> TetherResult<()> {
        let name = r.string()?;
        let want_reply = r.bool()?;
        match name.as_str() {
            "keepalive@openssh.com" => {
                self.keepalives += 1;
                if want_reply && self.config.answer_keepalive {
                    self.push(vec![MessageType::RequestFailure as u8]);
                }
            }
            "tcpip-forward" => {
                let host = r.string()?;
                let port = r.u32()?;
                if self.config.deny_forward {
                    if want_reply {
                        self.push(vec![MessageType::RequestFailure as u8]);
                    }
                    return Ok(());
                }
                let bound = if port == 0 { self.config.forward_port } else { port };
                self.forwards.push((host, bound));
                if want_reply {
                    let reply = if port == 0 {
                        Writer::message(MessageType::RequestSuccess as u8).u32(bound).finish()
                    } else {
                        vec![MessageType::RequestSuccess as u8]
                    };
                    self.push(reply);
                }
            }
            "cancel-tcpip-forward" => {
                let _host = r.string()?;
                let port = r.u32()?;
                self.cancelled.push(port);
                if want_reply {
                    self.push(vec![MessageType::RequestSuccess as u8]);
                }
            }
            _ => {
                if want_reply {
                    self.push(vec![MessageType::RequestFailure as u8]);
                }
            }
        }
        Ok(())
    }

    fn channel_open(&mut self, r: &mut Reader<'_>) -> TetherResult<()> {
        let _kind = r.string()?;
        let client_id = r.u32()?;
        let _window = r.u32()?;
        let _packet = r.u32()?;
        if self.config.refuse_open {
            self.push(
                Writer::message(MessageType::ChannelOpenFailure as u8)
                    .u32(client_id)
                    .u32(1)
                    .string("administratively prohibited")
                    .string("")
                    .finish(),
            );
            return Ok(());
        }
        let server_id = self.next_channel;
        self.next_channel += 1;
        self.channels.insert(
            server_id,
            ServerChannel {
                client_id,
                process: Process::None,
                closed: false,
            },
        );
        self.push(
            Writer::message(MessageType::ChannelOpenConfirmation as u8)
                .u32(client_id)
                .u32(server_id)
                .u32(self.config.window)
                .u32(self.config.max_packet)
                .finish(),
        );
        Ok(())
    }

    fn channel_request(&mut self, r: &mut Reader<'_>) -> TetherResult<()> {
        let server_id = r.u32()?;
        let name = r.string()?;
        let want_reply = r.bool()?;
        let Some(client_id) = self.channels.get(&server_id).map(|c| c.client_id) else {
            return Ok(());
        };
        if self.config.deny_requests.contains(&name) {
            if want_reply {
                self.simple(MessageType::ChannelFailure, client_id);
            }
            return Ok(());
        }

        let process = match name.as_str() {
            "env" => {
                let key = r.string()?;
                let value = r.string()?;
                self.env.push((key, value));
                None
            }
            "exec" => {
                let command = r.string()?;
                self.exec_log.push(command.clone());
                Some(self.exec_process(&command))
            }
            "shell" => Some(Process::Echo),
            "subsystem" => {
                let subsystem = r.string()?;
                if subsystem != "sftp" {
                    if want_reply {
                        self.simple(MessageType::ChannelFailure, client_id);
                    }
                    return Ok(());
                }
                Some(Process::Sftp(SftpServer::default()))
            }
            _ => None,
        };
        if want_reply {
            self.simple(MessageType::ChannelSuccess, client_id);
        }

        let Some(process) = process else {
            return Ok(());
        };
        let starts_exec = matches!(process, Process::Exec);
        let starts_sink = matches!(process, Process::ScpSink(_));
        if let Some(ch) = self.channels.get_mut(&server_id) {
            ch.process = process;
        }
        if starts_exec {
            let output = self.config.exec_output.clone();
            let stderr = self.config.exec_stderr.clone();
            self.channel_data(client_id, &output);
            if !stderr.is_empty() {
                self.channel_stderr(client_id, &stderr);
            }
            let status = self.config.exit_status;
            self.finish(server_id, status);
        }
        if starts_sink {
            self.channel_data(client_id, &[0]);
        }
        Ok(())
    }

    fn exec_process(&self, command: &str) -> Process {
        let mut words = command.splitn(3, ' ');
        let (first, flags, rest) = (words.next(), words.next(), words.next());
        match (first, flags, rest) {
            (Some("scp"), Some(flags), Some(path)) => {
                let path = path.trim_matches('\'').to_string();
                if flags.ends_with('f') {
                    Process::ScpSource {
                        path,
                        times: flags.contains('p'),
                        stage: ScpSource::AwaitStart,
                    }
                } else {
                    Process::ScpSink(ScpSink {
                        path,
                        line: Vec::new(),
                        expected: None,
                        content: Vec::new(),
                    })
                }
            }
            _ => Process::Exec,
        }
    }

    fn channel_input(&mut self, server_id: u32, data: &[u8]) {
        let Some(mut ch) = self.channels.remove(&server_id) else {
            return;
        };
        let client_id = ch.client_id;
        if !self.config.hold_window {
            self.window_adjust(client_id, data.len() as u32);
        }
        let mut finish = None;
        match &mut ch.process {
            Process::Echo => self.channel_data(client_id, data),
            Process::Sftp(sftp) => {
                sftp.inbound.extend_from_slice(data);
                while sftp.inbound.len() >= 4 {
                    let len = u32::from_be_bytes([
                        sftp.inbound[0],
                        sftp.inbound[1],
                        sftp.inbound[2],
                        sftp.inbound[3],
                    ]) as usize;
                    if sftp.inbound.len() < 4 + len {
                        break;
                    }
                    let packet: Vec<u8> = sftp.inbound.drain(..4 + len).skip(4).collect();
                    let reply = self.sftp_packet(sftp, &packet);
                    let framed = Writer::new().bytes(&reply).finish();
                    self.channel_data(client_id, &framed);
                }
            }
            Process::ScpSource { .. } if data != [0] => {}
            Process::ScpSource { path, times, stage } => {
                let mtime_line = b"T1700000000 0 1700000100 0\n".to_vec();
                match stage {
                    ScpSource::AwaitStart => match self.files.get(path.as_str()).cloned() {
                        None => {
                            let line = format!("\x01scp: {}: No such file or directory\n", path);
                            self.channel_data(client_id, line.as_bytes());
                            finish = Some(1);
                            *stage = ScpSource::Done;
                        }
                        Some(_) if *times => {
                            self.channel_data(client_id, &mtime_line);
                            *stage = ScpSource::AwaitTimesAck;
                        }
                        Some(content) => {
                            let name = path.rsplit('/').next().unwrap_or_default().to_string();
                            let line = format!("C0644 {} {}\n", content.len(), name);
                            self.channel_data(client_id, line.as_bytes());
                            *stage = ScpSource::AwaitFileAck;
                        }
                    },
                    ScpSource::AwaitTimesAck => {
                        let content = self.files.get(path.as_str()).cloned().unwrap_or_default();
                        let name = path.rsplit('/').next().unwrap_or_default().to_string();
                        let line = format!("C0644 {} {}\n", content.len(), name);
                        self.channel_data(client_id, line.as_bytes());
                        *stage = ScpSource::AwaitFileAck;
                    }
                    ScpSource::AwaitFileAck => {
                        let mut content = self.files.get(path.as_str()).cloned().unwrap_or_default();
                        content.push(0);
                        self.channel_data(client_id, &content);
                        finish = Some(0);
                        *stage = ScpSource::Done;
                    }
                    ScpSource::Done => {}
                }
            }
            Process::ScpSink(sink) => {
                for &byte in data {
                    match sink.expected {
                        None => {
                            if byte != b'\n' {
                                sink.line.push(byte);
                                continue;
                            }
                            let line = String::from_utf8_lossy(&sink.line).into_owned();
                            sink.line.clear();
                            if line.starts_with('T') {
                                self.scp_times.push(line);
                            } else if let Some(size) = line.split(' ').nth(1) {
                                sink.expected = size.parse().ok();
                                if sink.expected == Some(0) {
                                    self.files.insert(sink.path.clone(), Vec::new());
                                }
                                self.scp_times.push(line.clone());
                            }
                            self.channel_data(client_id, &[0]);
                        }
                        Some(size) if (sink.content.len() as u64) < size => {
                            sink.content.push(byte);
                            if sink.content.len() as u64 == size {
                                self.files.insert(sink.path.clone(), sink.content.clone());
                            }
                        }
                        Some(_) => {
                            // Trailing zero after the file body.
                            self.channel_data(client_id, &[0]);
                        }
                    }
                }
            }
            Process::Exec | Process::None => {}
        }
        self.reinsert(server_id, ch);
        if let Some(status) = finish {
            self.finish(server_id, status);
        }
    }

    fn reinsert(&mut self, server_id: u32, ch: ServerChannel) {
        self.channels.insert(server_id, ch);
    }

    fn attrs_of(&self, path: &str) -> Option<Vec<u8>> {
        if self.dirs.contains(path) {
            return Some(SftpAttributes::new().with_permissions(0o040755).to_bytes());
        }
        self.files.get(path).map(|content| {
            SftpAttributes::new()
                .with_size(content.len() as u64)
                .with_permissions(0o100000 | self.modes.get(path).copied().unwrap_or(0o644))
                .with_times(1_700_000_100, 1_700_000_000)
                .to_bytes()
        })
    }

    fn sftp_packet(&mut self, sftp: &mut SftpServer, packet: &[u8]) -> Vec<u8> {
        let kind = packet[0];
        let mut r = Reader::new(&packet[1..]);
        if kind == 1 {
            return Writer::new()
                .u8(2)
                .u32(3)
                .string("posix-rename@openssh.com")
                .string("1")
                .string("statvfs@openssh.com")
                .string("2")
                .string("fsync@openssh.com")
                .string("1")
                .finish();
        }
        let id = r.u32().unwrap_or(0);
        match self.sftp_request(sftp, kind, id, &mut r) {
            Ok(reply) => reply,
            Err(_) => status(id, 5, "bad message"),
        }
    }

    fn sftp_request(
        &mut self,
        sftp: &mut SftpServer,
        kind: u8,
        id: u32,
        r: &mut Reader<'_>,
    ) -> TetherResult<Vec<u8>> {
        const OK: u32 = 0;
        const EOF: u32 = 1;
        const NO_SUCH_FILE: u32 = 2;
        const FAILURE: u32 = 4;
        const UNSUPPORTED: u32 = 8;

        let reply = match kind {
            // OPEN
            3 => {
                let path = r.string()?;
                let flags = r.u32()?;
                let exists = self.files.contains_key(&path);
                if !exists && flags & 0x08 == 0 {
                    return Ok(status(id, NO_SUCH_FILE, "No such file"));
                }
                if !exists || flags & 0x10 != 0 {
                    self.files.insert(path.clone(), Vec::new());
                }
                let append = flags & 0x04 != 0;
                sftp.next_handle += 1;
                let handle = format!("h{}", sftp.next_handle).into_bytes();
                sftp.handles.insert(handle.clone(), (path, false, append));
                Writer::new().u8(102).u32(id).bytes(&handle).finish()
            }
            // CLOSE
            4 => {
                let handle = r.bytes()?.to_vec();
                match sftp.handles.remove(&handle) {
                    Some(_) => status(id, OK, ""),
                    None => status(id, FAILURE, "invalid handle"),
                }
            }
            // READ
            5 => {
                let handle = r.bytes()?.to_vec();
                let offset = r.u64()? as usize;
                let len = r.u32()? as usize;
                let Some((path, _, _)) = sftp.handles.get(&handle) else {
                    return Ok(status(id, FAILURE, "invalid handle"));
                };
                let content = self.files.get(path).cloned().unwrap_or_default();
                if offset >= content.len() {
                    status(id, EOF, "")
                } else {
                    let end = content.len().min(offset + len);
                    Writer::new().u8(103).u32(id).bytes(&content[offset..end]).finish()
                }
            }
            // WRITE
            6 => {
                let handle = r.bytes()?.to_vec();
                let offset = r.u64()? as usize;
                let data = r.bytes()?.to_vec();
                let Some((path, _, append)) = sftp.handles.get(&handle).cloned() else {
                    return Ok(status(id, FAILURE, "invalid handle"));
                };
                let content = self.files.entry(path).or_default();
                let offset = if append { content.len() } else { offset };
                if content.len() < offset + data.len() {
                    content.resize(offset + data.len(), 0);
                }
                content[offset..offset + data.len()].copy_from_slice(&data);
                status(id, OK, "")
            }
            // LSTAT, STAT
            7 | 17 => {
                let path = r.string()?;
                let path = if kind == 17 {
                    self.links.get(&path).cloned().unwrap_or(path)
                } else {
                    path
                };
                match self.attrs_of(&path) {
                    Some(attrs) => Writer::new().u8(105).u32(id).raw(&attrs).finish(),
                    None => status(id, NO_SUCH_FILE, "No such file"),
                }
            }
            // FSTAT
            8 => {
                let handle = r.bytes()?.to_vec();
                let attrs = sftp
                    .handles
                    .get(&handle)
                    .and_then(|(path, _, _)| self.attrs_of(path));
                match attrs {
                    Some(attrs) => Writer::new().u8(105).u32(id).raw(&attrs).finish(),
                    None => status(id, FAILURE, "invalid handle"),
                }
            }
            // SETSTAT, FSETSTAT
            9 | 10 => {
                let path = if kind == 9 {
                    Some(r.string()?)
                } else {
                    let handle = r.bytes()?.to_vec();
                    sftp.handles.get(&handle).map(|(path, _, _)| path.clone())
                };
                let attrs = SftpAttributes::from_bytes(r.rest())?;
                let Some(path) = path.filter(|p| self.files.contains_key(p) || self.dirs.contains(p)) else {
                    return Ok(status(id, NO_SUCH_FILE, "No such file"));
                };
                if attrs.flags & AttrFlags::PERMISSIONS != 0 {
                    self.modes.insert(path.clone(), attrs.permissions & 0o7777);
                }
                if attrs.flags & AttrFlags::SIZE != 0 {
                    if let Some(content) = self.files.get_mut(&path) {
                        content.resize(attrs.size as usize, 0);
                    }
                }
                status(id, OK, "")
            }
            // OPENDIR
            11 => {
                let path = r.string()?;
                if !self.dirs.contains(&path) {
                    return Ok(status(id, NO_SUCH_FILE, "No such directory"));
                }
                sftp.next_handle += 1;
                let handle = format!("d{}", sftp.next_handle).into_bytes();
                sftp.handles.insert(handle.clone(), (path, false, false));
                Writer::new().u8(102).u32(id).bytes(&handle).finish()
            }
            // READDIR
            12 => {
                let handle = r.bytes()?.to_vec();
                let Some((dir, listed, _)) = sftp.handles.get_mut(&handle) else {
                    return Ok(status(id, FAILURE, "invalid handle"));
                };
                if *listed {
                    return Ok(status(id, EOF, ""));
                }
                *listed = true;
                let prefix = if dir.ends_with('/') { dir.clone() } else { format!("{}/", dir) };
                let names: Vec<String> = self
                    .files
                    .keys()
                    .chain(self.dirs.iter())
                    .filter_map(|p| p.strip_prefix(&prefix))
                    .filter(|rest| !rest.is_empty() && !rest.contains('/'))
                    .map(str::to_string)
                    .collect();
                let mut w = Writer::new().u8(104).u32(id).u32(names.len() as u32);
                for name in &names {
                    let full = format!("{}{}", prefix, name);
                    let attrs = self.attrs_of(&full).unwrap_or_default();
                    w = w
                        .string(name)
                        .string(&format!("-rw-r--r-- 1 alice alice {}", name))
                        .raw(&attrs);
                }
                w.finish()
            }
            // REMOVE
            13 => {
                let path = r.string()?;
                match self.files.remove(&path) {
                    Some(_) => status(id, OK, ""),
                    None => status(id, NO_SUCH_FILE, "No such file"),
                }
            }
            // MKDIR
            14 => {
                let path = r.string()?;
                if self.dirs.contains(&path) || self.files.contains_key(&path) {
                    status(id, FAILURE, "File exists")
                } else {
                    self.dirs.insert(path);
                    status(id, OK, "")
                }
            }
            // RMDIR
            15 => {
                let path = r.string()?;
                if self.dirs.remove(&path) {
                    status(id, OK, "")
                } else {
                    status(id, NO_SUCH_FILE, "No such directory")
                }
            }
            // REALPATH
            16 => {
                let path = r.string()?;
                let resolved = match path.as_str() {
                    "." | "" => HOME.to_string(),
                    p if p.starts_with('/') => p.to_string(),
                    p => format!("{}/{}", HOME, p),
                };
                name_reply(id, &resolved)
            }
            // RENAME
            18 => {
                let from = r.string()?;
                let to = r.string()?;
                if self.files.contains_key(&to) {
                    status(id, FAILURE, "target exists")
                } else {
                    self.rename(id, from, to)
                }
            }
            // READLINK
            19 => {
                let path = r.string()?;
                match self.links.get(&path) {
                    Some(target) => name_reply(id, &target.clone()),
                    None => status(id, NO_SUCH_FILE, "not a link"),
                }
            }
            // SYMLINK
            20 => {
                let path = r.string()?;
                let target = r.string()?;
                self.links.insert(path, target);
                status(id, OK, "")
            }
            // EXTENDED
            200 => {
                let name = r.string()?;
                match name.as_str() {
                    "posix-rename@openssh.com" => {
                        let from = r.string()?;
                        let to = r.string()?;
                        self.rename(id, from, to)
                    }
                    "statvfs@openssh.com" | "fstatvfs@openssh.com" => {
                        let mut w = Writer::new().u8(201).u32(id);
                        for value in [4096u64, 4096, 1000, 400, 300, 100, 50, 40, 7, 0, 255] {
                            w = w.u64(value);
                        }
                        w.finish()
                    }
                    "fsync@openssh.com" => status(id, OK, ""),
                    _ => status(id, UNSUPPORTED, "unsupported extension"),
                }
            }
            _ => status(id, UNSUPPORTED, "unsupported"),
        };
        Ok(reply)
    }

    fn rename(&mut self, id: u32, from: String, to: String) -> Vec<u8> {
        match self.files.remove(&from) {
            Some(content) => {
                self.files.insert(to, content);
                status(id, 0, "")
            }
            None => status(id, 2, "No such file"),
        }
    }
}

fn status(id: u32, code: u32, message: &str) -> Vec<u8> {
    Writer::new()
        .u8(101)
        .u32(id)
        .u32(code)
        .string(message)
        .string("")
        .finish()
}

fn name_reply(id: u32, name: &str) -> Vec<u8> {
    let attrs = SftpAttributes::new().to_bytes();
    Writer::new()
        .u8(104)
        .u32(id)
        .u32(1)
        .string(name)
        .string(name)
        .raw(&attrs)
        .finish()
}

/// Builds a server KEXINIT with the given list per category.
pub fn server_kexinit<F>(mut list: F) -> Vec<u8>
where
    F: FnMut(MethodType) -> Vec<String>,
{
    let mut lists: [Vec<String>; 10] = Default::default();
    for (index, slot) in lists.iter_mut().enumerate() {
        let method = MethodType::try_from(index as i32).expect("ten method categories");
        *slot = list(method);
    }
    KexInit::new(lists).to_bytes()
}

/// Transport half handed to the session.
pub struct FakeTransport {
    state: Arc<Mutex<ServerState>>,
}

fn would_block() -> io::Error {
    io::ErrorKind::WouldBlock.into()
}

impl Transport for FakeTransport {
    fn exchange_banner(&mut self, _ours: &str) -> io::Result<String> {
        let mut state = self.state.lock();
        if state.block_banner > 0 {
            state.block_banner -= 1;
            return Err(would_block());
        }
        Ok(SERVER_BANNER.to_string())
    }

    fn key_exchange(&mut self, ctx: &KexContext) -> io::Result<KexOutcome> {
        let mut state = self.state.lock();
        state.kex = Some(ctx.clone());
        Ok(KexOutcome {
            host_key: host_key_blob(),
            session_id: SESSION_ID.to_vec(),
        })
    }

    fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if state.block_sends > 0 {
            state.block_sends -= 1;
            return Err(would_block());
        }
        state.handle(payload)
    }

    fn receive(&mut self) -> io::Result<Vec<u8>> {
        let mut state = self.state.lock();
        if state.block_recvs > 0 {
            state.block_recvs -= 1;
            return Err(would_block());
        }
        match state.to_client.pop_front() {
            Some(payload) => Ok(payload),
            None if state.disconnected => Err(io::ErrorKind::UnexpectedEof.into()),
            None => Err(would_block()),
        }
    }

    fn wait(&mut self, directions: BlockDirections, _timeout: Option<Duration>) -> io::Result<bool> {
        let state = self.state.lock();
        let ready = (directions.inbound()
            && (!state.to_client.is_empty() || state.block_recvs > 0))
            || (directions.outbound() && state.block_sends > 0)
            || state.block_banner > 0;
        Ok(ready)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.state.lock().disconnected = true;
        Ok(())
    }
}

/// Test-side handle on the scripted server.
#[derive(Clone)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState::new(config))),
        }
    }

    pub fn transport(&self) -> Box<dyn Transport> {
        Box::new(FakeTransport {
            state: Arc::clone(&self.state),
        })
    }

    pub fn state(&self) -> parking_lot::MutexGuard<'_, ServerState> {
        self.state.lock()
    }
}

/// A session that has completed its handshake against a fresh server.
pub fn connected(config: ServerConfig) -> (Session, FakeServer) {
    connected_with(config, SessionConfig::default())
}

pub fn connected_with(config: ServerConfig, session_config: SessionConfig) -> (Session, FakeServer) {
    init_tracing();
    let server = FakeServer::new(config);
    let session = Session::with_config(session_config);
    session.set_transport(server.transport());
    complete(session.handshake()).expect("handshake");
    (session, server)
}

/// An authenticated session.
pub fn authenticated(config: ServerConfig) -> (Session, FakeServer) {
    let (session, server) = connected(config);
    complete(session.userauth_password(USER, PASSWORD)).expect("password auth");
    (session, server)
}

/// Unwraps a result that must have completed.
pub fn complete<T>(result: TetherResult<Progress<T>>) -> TetherResult<T> {
    match result? {
        Progress::Complete(value) => Ok(value),
        Progress::WouldBlock(dirs) => panic!("unexpected WouldBlock({:?})", dirs),
    }
}

/// Repeats a non-blocking call until it completes, counting WouldBlocks.
pub fn retry<T, F>(mut op: F) -> (TetherResult<T>, usize)
where
    F: FnMut() -> TetherResult<Progress<T>>,
{
    let mut blocks = 0;
    loop {
        match op() {
            Ok(Progress::Complete(value)) => return (Ok(value), blocks),
            Ok(Progress::WouldBlock(_)) => {
                blocks += 1;
                assert!(blocks < 10_000, "operation never completed");
            }
            Err(err) => return (Err(err), blocks),
        }
    }
}

/// Reads a channel to EOF.
pub fn read_to_end(channel: &mut tether_proto::ssh::channel::Channel) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = complete(channel.read(&mut buf)).expect("read");
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..n]);
    }
}
