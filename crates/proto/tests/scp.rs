//! SCP transfers against the scripted remote `scp`.

mod common;

use common::*;
use std::io::{Read, Write};
use tether_platform::ErrorKind;

#[test]
fn test_scp_recv_reads_announced_file() {
    let (session, server) = authenticated(ServerConfig::default());
    server
        .state()
        .files
        .insert("/etc/motd".to_string(), b"Welcome!\n".to_vec());

    let (mut channel, stat) = complete(session.scp_recv("/etc/motd")).unwrap();
    assert_eq!(stat.size, 9);
    assert_eq!(stat.mode, 0o644);
    assert_eq!(stat.mtime, 0);

    let mut contents = vec![0u8; stat.size as usize];
    channel.read_exact(&mut contents).unwrap();
    assert_eq!(contents, b"Welcome!\n");
    assert_eq!(server.state().exec_log, vec!["scp -f '/etc/motd'"]);
}

#[test]
fn test_scp_recv2_reports_times() {
    let (session, server) = authenticated(ServerConfig::default());
    server
        .state()
        .files
        .insert("/var/log/app.log".to_string(), b"line\n".to_vec());

    let (mut channel, stat) = complete(session.scp_recv2("/var/log/app.log")).unwrap();
    assert_eq!(stat.mtime, 1_700_000_000);
    assert_eq!(stat.atime, 1_700_000_100);
    assert_eq!(stat.size, 5);

    let mut contents = vec![0u8; 5];
    channel.read_exact(&mut contents).unwrap();
    assert_eq!(contents, b"line\n");
    assert_eq!(server.state().exec_log, vec!["scp -pf '/var/log/app.log'"]);
}

#[test]
fn test_scp_recv_missing_file() {
    let (session, _server) = authenticated(ServerConfig::default());
    let err = complete(session.scp_recv("/missing")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ScpProtocol);
    assert!(err.message().contains("No such file or directory"));

    // The failed transfer does not block the next one.
    let err = complete(session.scp_recv("/missing")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ScpProtocol);
}

#[test]
fn test_scp_send_uploads_file() {
    let (session, server) = authenticated(ServerConfig::default());
    let body = b"#!/bin/sh\necho hi\n";

    let mut channel = complete(session.scp_send("/usr/local/bin/hi", 0o755, body.len() as u64, None)).unwrap();
    channel.write_all(body).unwrap();
    complete(channel.send_eof()).unwrap();
    complete(channel.wait_eof()).unwrap();
    complete(channel.close()).unwrap();
    complete(channel.wait_closed()).unwrap();

    let state = server.state();
    assert_eq!(state.exec_log, vec!["scp -t '/usr/local/bin/hi'"]);
    assert_eq!(state.scp_times, vec![format!("C0755 {} hi", body.len())]);
    assert_eq!(state.files["/usr/local/bin/hi"], body);
}

#[test]
fn test_scp_send_with_times() {
    let (session, server) = authenticated(ServerConfig::default());
    let channel = complete(session.scp_send("/tmp/empty", 0o100600, 0, Some((1_600_000_000, 1_600_000_500)))).unwrap();
    drop(channel);

    let state = server.state();
    assert_eq!(state.exec_log, vec!["scp -pt '/tmp/empty'"]);
    // File type bits are stripped from the mode.
    assert_eq!(
        state.scp_times,
        vec!["T1600000000 0 1600000500 0".to_string(), "C0600 0 empty".to_string()]
    );
    assert_eq!(state.files["/tmp/empty"], b"");
}

#[test]
fn test_scp_path_is_quoted() {
    let (session, server) = authenticated(ServerConfig::default());
    server
        .state()
        .files
        .insert("/tmp/it's here".to_string(), b"x".to_vec());
    let _ = complete(session.scp_recv("/tmp/it's here"));
    assert_eq!(server.state().exec_log, vec![r"scp -f '/tmp/it'\''s here'"]);
}
