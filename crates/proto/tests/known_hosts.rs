//! Host key verification with the known-hosts store.

mod common;

use common::*;
use proptest::prelude::*;
use tether_proto::ssh::known_hosts::{
    KnownHostCheck, KnownHosts, KEYENC_RAW, KEY_ED25519, KEY_SSHRSA, TYPE_PLAIN,
};
use tether_proto::ssh::wire::Writer;

fn ed25519_blob(seed: &[u8]) -> Vec<u8> {
    let mut key = [0u8; 32];
    for (dst, src) in key.iter_mut().zip(seed.iter().cycle()) {
        *dst = *src;
    }
    Writer::new().string("ssh-ed25519").bytes(&key).finish()
}

#[test]
fn test_verify_session_host_key() {
    let (session, _server) = connected(ServerConfig::default());
    let host_key = session.host_key().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("known_hosts");

    let mut store = session.knownhost_init();
    assert_eq!(
        store.check("build.example.com", host_key.blob(), TYPE_PLAIN | KEYENC_RAW).unwrap(),
        KnownHostCheck::NotFound
    );

    // Trust on first use, then persist.
    store
        .addc(
            "build.example.com,10.0.0.12",
            host_key.blob(),
            TYPE_PLAIN | KEYENC_RAW | KEY_ED25519,
            Some("ci runner"),
        )
        .unwrap();
    store.writefile(&path).unwrap();

    let mut reloaded = KnownHosts::new();
    assert_eq!(reloaded.readfile(&path).unwrap(), 1);
    for host in ["build.example.com", "10.0.0.12"] {
        match reloaded.check(host, host_key.blob(), TYPE_PLAIN | KEYENC_RAW).unwrap() {
            KnownHostCheck::Match(entry) => assert_eq!(entry.comment.as_deref(), Some("ci runner")),
            other => panic!("expected a match for {}, got {:?}", host, other),
        }
    }

    let imposter = ed25519_blob(b"imposter");
    assert!(matches!(
        reloaded.check("build.example.com", &imposter, TYPE_PLAIN | KEYENC_RAW).unwrap(),
        KnownHostCheck::Mismatch(_)
    ));
}

#[test]
fn test_file_written_in_openssh_format() {
    let mut store = KnownHosts::new();
    let blob = host_key_blob();
    store
        .addc("[git.example.com]:2222", &blob, TYPE_PLAIN | KEYENC_RAW, None)
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("known_hosts");
    store.writefile(&path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("[git.example.com]:2222 ssh-ed25519 AAAA"));
    assert!(text.ends_with('\n'));
    assert_eq!(
        store.checkp("git.example.com", 2222, &blob, TYPE_PLAIN | KEYENC_RAW).unwrap(),
        KnownHostCheck::Match(store.get()[0].clone())
    );
    assert_eq!(
        store.check("git.example.com", &blob, TYPE_PLAIN | KEYENC_RAW).unwrap(),
        KnownHostCheck::NotFound
    );
}

#[test]
fn test_rsa_lookup_ignores_ed25519_entry() {
    let mut store = KnownHosts::new();
    store
        .addc("db", &host_key_blob(), TYPE_PLAIN | KEYENC_RAW, None)
        .unwrap();
    let rsa = Writer::new().string("ssh-rsa").bytes(&[1, 0, 1]).bytes(&[0xab; 64]).finish();
    assert_eq!(
        store.check("db", &rsa, TYPE_PLAIN | KEYENC_RAW | KEY_SSHRSA).unwrap(),
        KnownHostCheck::NotFound
    );
}

fn hostname() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,20}(\\.[a-z][a-z0-9-]{0,10}){0,3}"
}

proptest! {
    #[test]
    fn prop_written_line_reads_back(host in hostname(), seed in proptest::collection::vec(any::<u8>(), 1..32)) {
        let blob = ed25519_blob(&seed);
        let mut store = KnownHosts::new();
        let entry = store.addc(&host, &blob, TYPE_PLAIN | KEYENC_RAW, None).unwrap();
        let line = store.writeline(&entry).unwrap();

        let mut reloaded = KnownHosts::new();
        reloaded.readline(&line).unwrap();
        let found = reloaded.check(&host, &blob, TYPE_PLAIN | KEYENC_RAW).unwrap();
        prop_assert!(matches!(found, KnownHostCheck::Match(_)));
    }

    #[test]
    fn prop_hashed_entry_only_matches_its_host(host in hostname(), other in hostname()) {
        prop_assume!(host != other);
        let blob = host_key_blob();
        let mut store = KnownHosts::new();
        let entry = store.add_hashed(&host, &blob, TYPE_PLAIN | KEYENC_RAW, None).unwrap();
        prop_assert!(entry.name.starts_with("|1|"));

        prop_assert!(matches!(
            store.check(&host, &blob, TYPE_PLAIN | KEYENC_RAW).unwrap(),
            KnownHostCheck::Match(_)
        ));
        prop_assert_eq!(
            store.check(&other, &blob, TYPE_PLAIN | KEYENC_RAW).unwrap(),
            KnownHostCheck::NotFound
        );
    }

    #[test]
    fn prop_empty_store_never_matches(host in hostname(), port in any::<u16>(), seed in proptest::collection::vec(any::<u8>(), 1..32)) {
        let store = KnownHosts::new();
        prop_assert_eq!(
            store.checkp(&host, port, &ed25519_blob(&seed), TYPE_PLAIN | KEYENC_RAW).unwrap(),
            KnownHostCheck::NotFound
        );
    }

    #[test]
    fn prop_file_round_trip(hosts in proptest::collection::vec(hostname(), 0..6)) {
        let mut store = KnownHosts::new();
        for (i, host) in hosts.iter().enumerate() {
            let comment = format!("key {}", i);
            store
                .addc(host, &ed25519_blob(&[i as u8 + 1]), TYPE_PLAIN | KEYENC_RAW, Some(&comment))
                .unwrap();
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        store.writefile(&path).unwrap();

        let mut reloaded = KnownHosts::new();
        prop_assert_eq!(reloaded.readfile(&path).unwrap(), hosts.len());
        let summary = |s: &KnownHosts| {
            s.get()
                .into_iter()
                .map(|e| (e.name, e.key, e.typemask, e.comment))
                .collect::<Vec<_>>()
        };
        prop_assert_eq!(summary(&reloaded), summary(&store));
    }
}
