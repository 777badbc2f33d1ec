//! Property tests: the trie against a `BTreeMap` model.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;

use patrie::{ConcurrentLevel, Patricia};

/// Short keys over a tiny alphabet maximise edge-label collisions, which is
/// where fork/split/mark-final live.
fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(prop_oneof![Just(b'a'), Just(b'b'), Just(b'c'), Just(0u8)], 0..10)
}

fn build(keys: &[Vec<u8>]) -> (Arc<Patricia>, BTreeMap<Vec<u8>, u32>) {
    let trie = Patricia::new(4, 16 << 20, ConcurrentLevel::OneWriteMultiRead).unwrap();
    let mut model = BTreeMap::new();
    let mut w = trie.writer_token();
    w.acquire();
    for (i, key) in keys.iter().enumerate() {
        let v = i as u32;
        let newly = w.insert(key, &v.to_le_bytes()).unwrap();
        assert!(w.has_value());
        assert_eq!(newly, !model.contains_key(key));
        model.entry(key.clone()).or_insert(v);
    }
    w.release();
    (trie, model)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn lookups_match_model(keys in proptest::collection::vec(key_strategy(), 0..200)) {
        let (trie, model) = build(&keys);
        prop_assert_eq!(trie.num_words(), model.len());

        let mut r = trie.reader_token();
        r.acquire();
        for (key, v) in &model {
            prop_assert!(r.lookup(key));
            prop_assert_eq!(r.value().unwrap(), v.to_le_bytes());
        }
        // Nearby non-members miss.
        for key in &keys {
            let mut probe = key.clone();
            probe.push(b'z');
            prop_assert_eq!(r.lookup(&probe), model.contains_key(&probe));
        }
        r.release();
    }

    #[test]
    fn iteration_matches_model_order(keys in proptest::collection::vec(key_strategy(), 0..200)) {
        let (trie, model) = build(&keys);
        let mut cur = trie.cursor();
        cur.acquire();
        let mut got = Vec::new();
        if cur.seek_begin() {
            loop {
                got.push(cur.word().to_vec());
                if !cur.incr() {
                    break;
                }
            }
        }
        cur.release();
        let expected: Vec<Vec<u8>> = model.keys().cloned().collect();
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn incr_decr_inverse_at_every_position(keys in proptest::collection::vec(key_strategy(), 1..60)) {
        let (trie, model) = build(&keys);
        let mut cur = trie.cursor();
        cur.acquire();
        prop_assert!(cur.seek_begin());
        let mut count = 1usize;
        loop {
            let here = cur.word().to_vec();
            if !cur.incr() {
                break;
            }
            count += 1;
            let next = cur.word().to_vec();
            prop_assert!(cur.decr());
            prop_assert_eq!(cur.word(), here.as_slice());
            prop_assert!(cur.incr());
            prop_assert_eq!(cur.word(), next.as_slice());
        }
        prop_assert_eq!(count, model.len());
        cur.release();
    }

    #[test]
    fn lower_bound_matches_model(
        keys in proptest::collection::vec(key_strategy(), 0..120),
        probes in proptest::collection::vec(key_strategy(), 1..40),
    ) {
        let (trie, model) = build(&keys);
        let mut cur = trie.cursor();
        cur.acquire();
        for probe in &probes {
            let expected = model.range(probe.clone()..).next().map(|(k, _)| k.clone());
            let found = cur.seek_lower_bound(probe);
            match expected {
                Some(k) => {
                    prop_assert!(found, "expected {:?} for probe {:?}", k, probe);
                    prop_assert_eq!(cur.word(), k.as_slice());
                }
                None => prop_assert!(!found),
            }
        }
        cur.release();
    }
}
