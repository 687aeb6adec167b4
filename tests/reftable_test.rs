use reftable::{
    BufSource, Error, FileSource, LogRecord, Reader, RefRecord, Stats, WriteOptions, Writer,
    HEADER_SIZE,
};

fn test_hash(hash_size: usize, v: u8) -> Vec<u8> {
    let mut h = vec![0u8; hash_size];
    h[0] = v;
    h
}

/// Deterministic pseudo-random bytes for compression-resistant payloads.
fn scrambled(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

/// Write `n` refs and `n` logs named `refs/heads/branchNN`, all at update
/// index 5, and return the file bytes, the names, and the writer stats.
fn write_table(n: usize, block_size: u32, hash_size: usize) -> (Vec<u8>, Vec<String>, Stats) {
    let names: Vec<String> = (0..n).map(|i| format!("refs/heads/branch{i:02}")).collect();
    let mut buf = Vec::new();
    let mut w = Writer::new(
        &mut buf,
        WriteOptions {
            block_size,
            hash_size,
            ..Default::default()
        },
    );
    w.set_limits(5, 5).unwrap();
    for (i, name) in names.iter().enumerate() {
        w.add_ref(&RefRecord {
            ref_name: name.clone(),
            update_index: 5,
            value: Some(test_hash(hash_size, i as u8)),
            ..Default::default()
        })
        .unwrap();
    }
    for (i, name) in names.iter().enumerate() {
        w.add_log(&LogRecord {
            ref_name: name.clone(),
            update_index: 5,
            new_hash: Some(test_hash(hash_size, i as u8)),
            message: "message\n".into(),
            ..Default::default()
        })
        .unwrap();
    }
    w.close().unwrap();
    let stats = w.stats().clone();
    drop(w);
    (buf, names, stats)
}

#[test]
fn table_read_write_sequential() {
    let n = 50;
    let (buf, names, stats) = write_table(n, 256, 20);

    // Every ref block starts on a block boundary and carries its tag.
    assert!(stats.ref_stats.blocks > 1);
    for i in 0..stats.ref_stats.blocks {
        let mut off = (i * 256) as usize;
        if off == 0 {
            off = HEADER_SIZE;
        }
        assert_eq!(buf[off], b'r', "ref block {i}");
    }
    assert!(stats.log_stats.blocks > 0);

    let rd = Reader::new(BufSource::new(buf), "file.ref").unwrap();
    let mut it = rd.seek_ref("").unwrap();
    let mut j = 0;
    while let Some(r) = it.next_ref().unwrap() {
        assert_eq!(r.ref_name, names[j]);
        assert_eq!(r.update_index, 5);
        j += 1;
    }
    assert_eq!(j, n);
}

#[test]
fn table_write_small_table() {
    let mut buf = Vec::new();
    let mut w = Writer::new(&mut buf, WriteOptions::default());
    w.set_limits(5, 5).unwrap();
    w.add_ref(&RefRecord {
        ref_name: "refs/heads/branch00".into(),
        update_index: 5,
        value: Some(test_hash(20, 0)),
        ..Default::default()
    })
    .unwrap();
    let bytes = w.close().unwrap();
    drop(w);
    assert_eq!(bytes, buf.len() as u64);
    assert!(buf.len() < 200, "got {}", buf.len());
}

#[test]
fn table_read_write_seek() {
    for hash_size in [20usize, 32] {
        for use_index in [true, false] {
            let n = 50;
            let (buf, names, stats) = write_table(n, 256, hash_size);
            assert!(stats.ref_stats.index_start > 0);

            let mut rd = Reader::new(BufSource::new(buf), "file.ref").unwrap();
            assert_eq!(rd.hash_size(), hash_size);
            if !use_index {
                rd.ref_offsets.index_offset = 0;
            }

            for (i, name) in names.iter().enumerate().skip(1) {
                let mut it = rd.seek_ref(name).unwrap();
                let r = it.next_ref().unwrap().unwrap();
                assert_eq!(&r.ref_name, name);
                assert_eq!(r.value.as_ref().unwrap()[0], i as u8);
            }
        }
    }
}

#[test]
fn table_read_api() {
    let (buf, names, _) = write_table(50, 256, 20);
    let rd = Reader::new(BufSource::new(buf), "file.ref").unwrap();
    let mut it = rd.seek_ref(&names[0]).unwrap();
    match it.next_log() {
        Err(Error::Api(_)) => {}
        other => panic!("expected an API error, got {other:?}"),
    }
    // The iterator is still usable for its own kind.
    assert!(it.next_ref().unwrap().is_some());
}

#[test]
fn log_write_read() {
    let n = 2usize;
    let names: Vec<String> = (0..n).map(|i| format!("b{i:02}{:0130}", 7)).collect();

    let mut buf = Vec::new();
    let mut w = Writer::new(
        &mut buf,
        WriteOptions {
            block_size: 256,
            ..Default::default()
        },
    );
    w.set_limits(0, n as u64).unwrap();
    for (i, name) in names.iter().enumerate() {
        w.add_ref(&RefRecord {
            ref_name: name.clone(),
            update_index: i as u64,
            ..Default::default()
        })
        .unwrap();
    }
    for (i, name) in names.iter().enumerate() {
        w.add_log(&LogRecord {
            ref_name: name.clone(),
            update_index: i as u64,
            old_hash: Some(test_hash(20, i as u8)),
            new_hash: Some(test_hash(20, i as u8 + 1)),
            ..Default::default()
        })
        .unwrap();
    }
    w.close().unwrap();
    let stats = w.stats().clone();
    drop(w);
    assert!(stats.log_stats.blocks > 0);

    let rd = Reader::new(BufSource::new(buf), "file.log").unwrap();

    let mut it = rd.seek_ref(&names[n - 1]).unwrap();
    assert!(it.next_ref().unwrap().is_some());
    assert!(it.next_ref().unwrap().is_none());

    let mut it = rd.seek_log("").unwrap();
    let mut i = 0;
    while let Some(log) = it.next_log().unwrap() {
        assert_eq!(log.ref_name, names[i]);
        assert_eq!(log.update_index, i as u64);
        i += 1;
    }
    assert_eq!(i, n);
}

#[test]
fn log_newest_first_and_seek_at() {
    let mut buf = Vec::new();
    let mut w = Writer::new(&mut buf, WriteOptions::default());
    w.set_limits(0, 10).unwrap();
    for update in [3u64, 2, 1] {
        // Later updates sort earlier, so adds run newest-to-oldest.
        w.add_log(&LogRecord {
            ref_name: "refs/heads/main".into(),
            update_index: update,
            new_hash: Some(test_hash(20, update as u8)),
            message: format!("update {update}\n"),
            ..Default::default()
        })
        .unwrap();
    }
    w.close().unwrap();
    drop(w);

    let rd = Reader::new(BufSource::new(buf), "file.log").unwrap();

    let mut it = rd.seek_log("refs/heads/main").unwrap();
    let updates: Vec<u64> = std::iter::from_fn(|| it.next_log().unwrap())
        .map(|l| l.update_index)
        .collect();
    assert_eq!(updates, vec![3, 2, 1]);

    let mut it = rd.seek_log_at("refs/heads/main", 2).unwrap();
    assert_eq!(it.next_log().unwrap().unwrap().update_index, 2);
}

#[test]
fn log_buffer_size() {
    // Incompressible hashes: the deflated block may exceed its input.
    let mut buf = Vec::new();
    let mut w = Writer::new(&mut buf, WriteOptions::default());
    w.set_limits(5, 5).unwrap();
    let log = LogRecord {
        ref_name: "refs/heads/master".into(),
        update_index: 0xa,
        old_hash: Some(scrambled(1, 20)),
        new_hash: Some(scrambled(2, 20)),
        name: "Han-Wen Nienhuys".into(),
        email: "hanwen@google.com".into(),
        time: 0x5e43_0672,
        tz_offset: 100,
        message: "commit: 9\n".into(),
    };
    w.add_log(&log).unwrap();
    w.close().unwrap();
    drop(w);

    let rd = Reader::new(BufSource::new(buf), "file.log").unwrap();
    let mut it = rd.seek_log("").unwrap();
    assert_eq!(it.next_log().unwrap().unwrap(), log);
    assert!(it.next_log().unwrap().is_none());
}

#[test]
fn log_oversized_record_grows_block() {
    // A record whose payload stays larger than the block even deflated.
    let mut buf = Vec::new();
    let mut w = Writer::new(&mut buf, WriteOptions::default());
    w.set_limits(0, 1).unwrap();
    let big = scrambled(42, 8 * 1024);
    let log = LogRecord {
        ref_name: "refs/heads/huge".into(),
        update_index: 1,
        old_hash: Some(scrambled(3, 20)),
        new_hash: Some(scrambled(4, 20)),
        name: "A U Thor".into(),
        email: "author@example.com".into(),
        time: 1234,
        tz_offset: -60,
        message: format!("{}\n", hex::encode(&big)),
    };
    w.add_log(&log).unwrap();
    w.close().unwrap();
    let stats = w.stats().clone();
    drop(w);
    assert_eq!(stats.log_stats.blocks, 1);
    assert!(stats.log_stats.max_block_size > 4096);

    let rd = Reader::new(BufSource::new(buf), "file.log").unwrap();
    let mut it = rd.seek_log("").unwrap();
    assert_eq!(it.next_log().unwrap().unwrap(), log);
    assert!(it.next_log().unwrap().is_none());
}

#[test]
fn table_refs_for() {
    let n = 50usize;
    let want_hash = test_hash(20, 4);

    for mode in ["obj_index", "ignored_obj_index", "skip_index_objects"] {
        let names: Vec<String> = (0..n)
            .map(|i| {
                let fill = "x".repeat(50);
                let name = format!("br{i:02}{fill}");
                name[..40].to_owned()
            })
            .collect();

        let mut buf = Vec::new();
        let mut w = Writer::new(
            &mut buf,
            WriteOptions {
                block_size: 256,
                skip_index_objects: mode == "skip_index_objects",
                ..Default::default()
            },
        );
        let mut want_names = Vec::new();
        for (i, name) in names.iter().enumerate() {
            let hash1 = test_hash(20, (i / 4) as u8);
            let hash2 = test_hash(20, 3 + (i / 4) as u8);
            if hash1 == want_hash || hash2 == want_hash {
                want_names.push(name.clone());
            }
            w.add_ref(&RefRecord {
                ref_name: name.clone(),
                update_index: 0,
                value: Some(hash1),
                target_value: Some(hash2),
                ..Default::default()
            })
            .unwrap();
        }
        w.close().unwrap();
        drop(w);
        assert!(!want_names.is_empty());

        let mut rd = Reader::new(BufSource::new(buf), "file.ref").unwrap();
        assert_eq!(rd.obj_offsets.present, mode != "skip_index_objects");
        if mode == "ignored_obj_index" {
            rd.obj_offsets.present = false;
        }

        let mut it = rd.refs_for(&want_hash).unwrap();
        let mut got = Vec::new();
        while let Some(r) = it.next_ref().unwrap() {
            got.push(r.ref_name);
        }
        assert_eq!(got, want_names, "mode={mode}");
    }
}

#[test]
fn symref_and_peeled_round_trip() {
    let mut buf = Vec::new();
    let mut w = Writer::new(&mut buf, WriteOptions::default());
    w.set_limits(1, 3).unwrap();
    let head = RefRecord {
        ref_name: "HEAD".into(),
        update_index: 1,
        target: Some("refs/heads/main".into()),
        ..Default::default()
    };
    let deleted = RefRecord {
        ref_name: "refs/heads/gone".into(),
        update_index: 3,
        ..Default::default()
    };
    let tag = RefRecord {
        ref_name: "refs/tags/v1.0".into(),
        update_index: 2,
        value: Some(test_hash(20, 7)),
        target_value: Some(test_hash(20, 8)),
        ..Default::default()
    };
    w.add_ref(&head).unwrap();
    w.add_ref(&deleted).unwrap();
    w.add_ref(&tag).unwrap();
    w.close().unwrap();
    drop(w);

    let rd = Reader::new(BufSource::new(buf), "file.ref").unwrap();
    let mut it = rd.seek_ref("").unwrap();
    assert_eq!(it.next_ref().unwrap().unwrap(), head);
    assert_eq!(it.next_ref().unwrap().unwrap(), deleted);
    assert_eq!(it.next_ref().unwrap().unwrap(), tag);
    assert!(it.next_ref().unwrap().is_none());
}

#[test]
fn footer_is_stable_across_mounts() {
    let (buf, _, _) = write_table(10, 256, 20);
    let footer_bytes = &buf[buf.len() - reftable::FOOTER_SIZE..];
    let f1 = reftable::Footer::decode(footer_bytes).unwrap();
    let f2 = reftable::Footer::decode(footer_bytes).unwrap();
    assert_eq!(f1, f2);

    let rd1 = Reader::new(BufSource::new(buf.clone()), "a").unwrap();
    let rd2 = Reader::new(BufSource::new(buf), "b").unwrap();
    assert_eq!(rd1.ref_offsets.offset, rd2.ref_offsets.offset);
    assert_eq!(rd1.ref_offsets.index_offset, rd2.ref_offsets.index_offset);
    assert_eq!(rd1.log_offsets.offset, rd2.log_offsets.offset);
}

#[test]
fn corrupt_footer_rejected() {
    let (mut buf, _, _) = write_table(5, 256, 20);
    let last = buf.len() - 1;
    buf[last] ^= 0xff;
    match Reader::new(BufSource::new(buf), "file.ref") {
        Err(Error::Format(_)) => {}
        other => panic!("expected a format error, got {other:?}"),
    }
}

#[test]
fn seek_log_without_log_section() {
    let mut buf = Vec::new();
    let mut w = Writer::new(&mut buf, WriteOptions::default());
    w.add_ref(&RefRecord {
        ref_name: "refs/heads/only".into(),
        ..Default::default()
    })
    .unwrap();
    w.close().unwrap();
    drop(w);

    let rd = Reader::new(BufSource::new(buf), "file.ref").unwrap();
    match rd.seek_log("refs/heads/only") {
        Err(Error::NotExist) => {}
        other => panic!("expected NotExist, got {other:?}"),
    }
}

#[test]
fn file_backed_source() {
    let (buf, names, _) = write_table(20, 256, 20);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("table.ref");
    std::fs::write(&path, &buf).unwrap();

    let rd = Reader::new(FileSource::open(&path).unwrap(), "table.ref").unwrap();
    let mut it = rd.seek_ref(&names[7]).unwrap();
    assert_eq!(it.next_ref().unwrap().unwrap().ref_name, names[7]);

    let mut it = rd.seek_log("").unwrap();
    let mut count = 0;
    while it.next_log().unwrap().is_some() {
        count += 1;
    }
    assert_eq!(count, names.len());
}
