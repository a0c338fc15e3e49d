//! SCP file transfer bootstrap.
//!
//! SCP runs the remote `scp` program over an exec channel and speaks its
//! line protocol: `T<mtime> 0 <atime> 0` carries timestamps, `C<mode> <size>
//! <name>` announces a file, and every record is acknowledged with a single
//! zero byte. A `\x01` or `\x02` byte instead of the zero starts an error
//! line. These helpers run the exchange up to the file contents and hand
//! back the channel; the caller then reads or writes exactly `size` bytes.

use crate::ssh::channel::OpenKind;
use crate::ssh::connection::{ChannelRequestType, ChannelType};
use crate::ssh::nonblocking::{Halt, Step};
use crate::ssh::session::inner::SessionInner;
use tether_platform::{TetherError, TetherResult};
use tracing::debug;

/// Longest protocol line accepted from the remote scp.
const MAX_LINE: usize = 4096;

/// Metadata of a file being transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScpFileStat {
    /// Permission bits
    pub mode: u32,
    /// File size in bytes
    pub size: u64,
    /// Modification time (seconds since the epoch), when sent
    pub mtime: u64,
    /// Access time (seconds since the epoch), when sent
    pub atime: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Recv { times: bool },
    Send,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScpStep {
    Open,
    Exec,
    /// Writing `out`; the step that follows once it is sent
    Write(After),
    ReadRecord,
    ReadAck(After),
    AckError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum After {
    ReadRecord,
    TimesAck,
    FileAck,
    SendTimes,
    SendFile,
    Done,
}

#[derive(Debug)]
pub(crate) struct ScpProgress {
    direction: Direction,
    path: String,
    channel: u32,
    step: ScpStep,
    out: Vec<u8>,
    sent: usize,
    stat: ScpFileStat,
    times: Option<(u64, u64)>,
}

fn scp_error(message: impl Into<String>) -> TetherError {
    TetherError::Scp {
        message: message.into(),
    }
}

/// Quotes a path for the remote shell.
fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', "'\\''"))
}

fn parse_number<T>(field: Option<&str>, what: &str, radix_octal: bool) -> TetherResult<T>
where
    T: TryFrom<u64>,
{
    let text = field.ok_or_else(|| scp_error(format!("record is missing the {}", what)))?;
    let value = if radix_octal {
        u64::from_str_radix(text, 8)
    } else {
        text.parse::<u64>()
    }
    .map_err(|_| scp_error(format!("invalid {} '{}'", what, text)))?;
    T::try_from(value).map_err(|_| scp_error(format!("{} out of range", what)))
}

/// Parses `T<mtime> 0 <atime> 0`.
fn parse_times(line: &str) -> TetherResult<(u64, u64)> {
    let mut fields = line[1..].split(' ');
    let mtime = parse_number::<u64>(fields.next(), "modification time", false)?;
    let _mtime_usec = fields.next();
    let atime = parse_number::<u64>(fields.next(), "access time", false)?;
    Ok((mtime, atime))
}

/// Parses `C<mode> <size> <name>`.
fn parse_file(line: &str) -> TetherResult<(u32, u64)> {
    let mut fields = line[1..].splitn(3, ' ');
    let mode = parse_number::<u32>(fields.next(), "mode", true)?;
    let size = parse_number::<u64>(fields.next(), "size", false)?;
    match fields.next() {
        Some(name) if !name.is_empty() => Ok((mode, size)),
        _ => Err(scp_error("file record has no name")),
    }
}

impl SessionInner {
    pub(crate) fn scp_recv(&mut self, path: &str, times: bool) -> Step<(u32, ScpFileStat)> {
        self.scp_begin(Direction::Recv { times }, path)?;
        let result = self.scp_steps();
        self.scp_settle(result)
    }

    pub(crate) fn scp_send(
        &mut self,
        path: &str,
        mode: u32,
        size: u64,
        times: Option<(u64, u64)>,
    ) -> Step<u32> {
        self.scp_begin(Direction::Send, path)?;
        if let Some(progress) = self.scp.as_mut() {
            if progress.step == ScpStep::Open {
                progress.stat.mode = mode & 0o777;
                progress.stat.size = size;
                progress.times = times;
            }
        }
        let result = self.scp_steps();
        self.scp_settle(result).map(|(id, _)| id)
    }

    fn scp_begin(&mut self, direction: Direction, path: &str) -> Step<()> {
        match &self.scp {
            Some(p) if p.direction != direction || p.path != path => Err(TetherError::invalid_use(
                format!("SCP transfer of '{}' is in progress", p.path),
            )
            .into()),
            Some(_) => Ok(()),
            None => {
                self.scp = Some(ScpProgress {
                    direction,
                    path: path.to_string(),
                    channel: 0,
                    step: ScpStep::Open,
                    out: Vec::new(),
                    sent: 0,
                    stat: ScpFileStat::default(),
                    times: None,
                });
                Ok(())
            }
        }
    }

    fn scp_settle<T>(&mut self, result: Step<T>) -> Step<T> {
        match &result {
            Err(Halt::Block(_)) => {}
            Ok(_) => self.scp = None,
            Err(Halt::Fail(_)) => {
                if let Some(progress) = self.scp.take() {
                    if progress.step != ScpStep::Open {
                        self.channel_release(progress.channel);
                    }
                }
            }
        }
        result
    }

    fn scp_progress(&mut self) -> Step<&mut ScpProgress> {
        self.scp
            .as_mut()
            .ok_or_else(|| TetherError::invalid_use("no SCP transfer in progress").into())
    }

    fn scp_steps(&mut self) -> Step<(u32, ScpFileStat)> {
        loop {
            let progress = self.scp_progress()?;
            let (direction, id, step) = (progress.direction, progress.channel, progress.step);
            match step {
                ScpStep::Open => {
                    let id = self.open_channel(OpenKind::Scp, || ChannelType::Session)?;
                    let progress = self.scp_progress()?;
                    progress.channel = id;
                    progress.step = ScpStep::Exec;
                }
                ScpStep::Exec => {
                    let command = {
                        let progress = self.scp_progress()?;
                        let quoted = shell_quote(&progress.path);
                        match direction {
                            Direction::Recv { times: false } => format!("scp -f {}", quoted),
                            Direction::Recv { times: true } => format!("scp -pf {}", quoted),
                            Direction::Send if progress.times.is_some() => {
                                format!("scp -pt {}", quoted)
                            }
                            Direction::Send => format!("scp -t {}", quoted),
                        }
                    };
                    debug!(channel = id, %command, "starting scp");
                    self.channel_start(id, ChannelRequestType::Exec { command })?;
                    let progress = self.scp_progress()?;
                    progress.step = match direction {
                        Direction::Recv { .. } => {
                            progress.out = vec![0];
                            progress.sent = 0;
                            ScpStep::Write(After::ReadRecord)
                        }
                        Direction::Send => ScpStep::ReadAck(After::SendTimes),
                    };
                }
                ScpStep::Write(after) => {
                    let (out, mut sent) = {
                        let progress = self.scp_progress()?;
                        (std::mem::take(&mut progress.out), progress.sent)
                    };
                    let written = self.channel_write_all(id, &out, &mut sent);
                    let progress = self.scp_progress()?;
                    progress.sent = sent;
                    if written.is_err() {
                        progress.out = out;
                    }
                    written?;
                    progress_after(self.scp_progress()?, after);
                }
                ScpStep::ReadAck(after) => {
                    let mut byte = [0u8; 1];
                    if self.channel_read(id, 0, &mut byte)? == 0 {
                        return Err(scp_error("remote scp ended before acknowledging").into());
                    }
                    match byte[0] {
                        0 => progress_after(self.scp_progress()?, after),
                        1 | 2 => self.scp_progress()?.step = ScpStep::AckError,
                        other => {
                            return Err(scp_error(format!("unexpected acknowledgement {}", other))
                                .into())
                        }
                    }
                }
                ScpStep::AckError => {
                    let line = self.channel_read_line(id, MAX_LINE)?;
                    return Err(scp_error(String::from_utf8_lossy(&line).into_owned()).into());
                }
                ScpStep::ReadRecord => {
                    let line = self.channel_read_line(id, MAX_LINE)?;
                    let text = String::from_utf8_lossy(&line).into_owned();
                    let progress = self.scp_progress()?;
                    match text.as_bytes().first() {
                        Some(1) | Some(2) => return Err(scp_error(text[1..].to_string()).into()),
                        Some(b'T') if direction == (Direction::Recv { times: true }) => {
                            let (mtime, atime) = parse_times(&text)?;
                            progress.stat.mtime = mtime;
                            progress.stat.atime = atime;
                            progress.out = vec![0];
                            progress.sent = 0;
                            progress.step = ScpStep::Write(After::ReadRecord);
                        }
                        Some(b'C') => {
                            let (mode, size) = parse_file(&text)?;
                            progress.stat.mode = mode;
                            progress.stat.size = size;
                            progress.out = vec![0];
                            progress.sent = 0;
                            progress.step = ScpStep::Write(After::Done);
                        }
                        _ => return Err(scp_error(format!("unexpected record '{}'", text)).into()),
                    }
                }
            }

            let progress = self.scp_progress()?;
            if progress.step == ScpStep::Write(After::Done) && progress.out.is_empty() {
                return Ok((progress.channel, progress.stat));
            }
        }
    }
}

/// Moves to the step that follows a completed write or acknowledgement.
fn progress_after(progress: &mut ScpProgress, after: After) {
    progress.step = match after {
        After::ReadRecord => ScpStep::ReadRecord,
        After::TimesAck => ScpStep::ReadAck(After::SendFile),
        After::FileAck => ScpStep::ReadAck(After::Done),
        After::SendTimes => match progress.times {
            Some((mtime, atime)) => {
                progress.out = format!("T{} 0 {} 0\n", mtime, atime).into_bytes();
                progress.sent = 0;
                ScpStep::Write(After::TimesAck)
            }
            None => return progress_after(progress, After::SendFile),
        },
        After::SendFile => {
            let name = progress
                .path
                .rsplit('/')
                .next()
                .filter(|n| !n.is_empty())
                .unwrap_or(&progress.path)
                .to_string();
            progress.out =
                format!("C0{:o} {} {}\n", progress.stat.mode, progress.stat.size, name).into_bytes();
            progress.sent = 0;
            ScpStep::Write(After::FileAck)
        }
        After::Done => {
            progress.out.clear();
            ScpStep::Write(After::Done)
        }
    };
}
