//! Property tests for the wire primitives, the block codec, and whole-table
//! round trips.

use proptest::collection::btree_set;
use proptest::prelude::*;

use reftable::block::{BlockReader, BlockWriter};
use reftable::coding::{binsearch, get_u24, get_varint, put_u24, put_varint};
use reftable::record::{BlockKind, Record, RecordCtx, RefRecord};
use reftable::{BufSource, Reader, WriteOptions, Writer};

const CTX: RecordCtx = RecordCtx {
    hash_size: 20,
    min_update_index: 0,
};

fn ref_name() -> impl Strategy<Value = String> {
    "(refs/(heads|tags)/)?[a-z][a-z0-9/._-]{0,30}"
}

fn ref_rec(name: &str, fill: u8) -> Record {
    Record::Ref(RefRecord {
        ref_name: name.to_owned(),
        update_index: 0,
        value: Some(vec![fill; 20]),
        ..Default::default()
    })
}

proptest! {
    #[test]
    fn varint_round_trips(v in any::<u64>()) {
        let mut buf = Vec::new();
        put_varint(&mut buf, v);
        let (got, n) = get_varint(&buf).unwrap();
        prop_assert_eq!(got, v);
        prop_assert_eq!(n, buf.len());
    }

    #[test]
    fn u24_round_trips(v in 0u32..=0xff_ffff) {
        let mut buf = [0u8; 3];
        put_u24(&mut buf, v);
        prop_assert_eq!(get_u24(&buf), v);
    }

    #[test]
    fn binsearch_finds_the_pivot(mut pivot in 0usize..=100, n in 0usize..=100) {
        pivot = pivot.min(n);
        let mut calls = 0usize;
        let got = binsearch(n, |i| {
            calls += 1;
            i >= pivot
        });
        prop_assert_eq!(got, pivot);
        // Logarithmic probe count.
        prop_assert!(calls <= n.max(2).ilog2() as usize + 2);
    }

    #[test]
    fn block_round_trips_at_any_restart_interval(
        names in btree_set(ref_name(), 1..60),
        interval in 1usize..=64,
    ) {
        let names: Vec<String> = names.into_iter().collect();
        let mut bw = BlockWriter::new(BlockKind::Ref, 1 << 16, 0, interval, CTX);
        for (i, name) in names.iter().enumerate() {
            prop_assert!(bw.add(&ref_rec(name, i as u8)));
        }
        bw.finish().unwrap();

        let br = BlockReader::new(bw.data(), 0, 1 << 16, CTX).unwrap();
        let mut it = br.start();
        let mut got = Vec::new();
        while let Some(Record::Ref(r)) = br.next_record(&mut it).unwrap() {
            got.push(r.ref_name);
        }
        prop_assert_eq!(got, names);
    }

    #[test]
    fn block_seek_finds_first_at_or_after(
        names in btree_set(ref_name(), 1..40),
        target in ref_name(),
    ) {
        let names: Vec<String> = names.into_iter().collect();
        let mut bw = BlockWriter::new(BlockKind::Ref, 1 << 16, 0, 4, CTX);
        for (i, name) in names.iter().enumerate() {
            prop_assert!(bw.add(&ref_rec(name, i as u8)));
        }
        bw.finish().unwrap();
        let br = BlockReader::new(bw.data(), 0, 1 << 16, CTX).unwrap();

        let mut it = br.seek(target.as_bytes()).unwrap();
        let got = br.next_record(&mut it).unwrap().map(|rec| match rec {
            Record::Ref(r) => r.ref_name,
            _ => unreachable!(),
        });
        let want = names.iter().find(|n| n.as_str() >= target.as_str()).cloned();
        prop_assert_eq!(got, want);
    }

    #[test]
    fn table_round_trips_with_and_without_index(
        names in btree_set(ref_name(), 1..80),
        block_size in 128u32..1024,
        use_index in any::<bool>(),
    ) {
        let names: Vec<String> = names.into_iter().collect();
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, WriteOptions {
            block_size,
            ..Default::default()
        });
        for (i, name) in names.iter().enumerate() {
            w.add_ref(&RefRecord {
                ref_name: name.clone(),
                update_index: 0,
                value: Some(vec![i as u8; 20]),
                ..Default::default()
            }).unwrap();
        }
        w.close().unwrap();
        drop(w);

        let mut rd = Reader::new(BufSource::new(buf), "prop.ref").unwrap();
        if !use_index {
            rd.ref_offsets.index_offset = 0;
        }

        // Full scan preserves order and content.
        let mut it = rd.seek_ref("").unwrap();
        let mut got = Vec::new();
        while let Some(r) = it.next_ref().unwrap() {
            got.push(r.ref_name);
        }
        prop_assert_eq!(&got, &names);

        // Every name is seekable and yields itself.
        for name in &names {
            let mut it = rd.seek_ref(name).unwrap();
            let r = it.next_ref().unwrap().unwrap();
            prop_assert_eq!(&r.ref_name, name);
        }
    }
}
