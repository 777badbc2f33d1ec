//! Multi-threaded trie behaviour: concurrent writers, pinned readers,
//! retirement draining.

mod common;

use patrie::{ConcurrentLevel, Patricia};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

#[test]
fn two_writers_disjoint_key_sets() {
    common::init_tracing();
    let trie = Patricia::new(4, 64 << 20, ConcurrentLevel::MultiWriteMultiRead).unwrap();

    let mut handles = Vec::new();
    for prefix in [b'k', b'm'] {
        let trie = Arc::clone(&trie);
        handles.push(thread::spawn(move || {
            let mut w = trie.writer_token();
            w.acquire();
            for i in 0..1000u32 {
                let key = format!("{}{i}", prefix as char);
                let newly = w.insert(key.as_bytes(), &i.to_le_bytes()).unwrap();
                assert!(newly, "disjoint keys cannot collide");
                assert!(w.has_value(), "arena exhausted");
            }
            w.release();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(trie.num_words(), 2000);
    let mut r = trie.reader_token();
    r.acquire();
    for prefix in ['k', 'm'] {
        for i in 0..1000u32 {
            let key = format!("{prefix}{i}");
            assert!(r.lookup(key.as_bytes()), "missing {key}");
            assert_eq!(r.value().unwrap(), i.to_le_bytes());
        }
    }
    r.release();

    // Fragmentation stays bounded: within a quarter of used memory.
    assert!(trie.mem_frag_size() * 4 <= trie.mem_size());
}

#[test]
fn pinned_reader_sees_old_keys_then_queue_drains() {
    common::init_tracing();
    let trie = Patricia::new(4, 64 << 20, ConcurrentLevel::OneWriteMultiRead).unwrap();

    // Phase 1: baseline keys.
    let mut w = trie.writer_token();
    w.acquire();
    for i in 0..500u32 {
        let key = format!("pre{i:04}");
        assert!(w.insert(key.as_bytes(), &i.to_le_bytes()).unwrap());
    }
    w.release();

    // Phase 2: pin a reader, then churn 1000 more keys underneath it.
    let mut r = trie.reader_token();
    r.acquire();
    for i in 0..1000u32 {
        let key = format!("post{i:04}");
        w.acquire();
        assert!(w.insert(key.as_bytes(), &i.to_le_bytes()).unwrap());
        w.release();
    }

    // The pinned reader still finds every pre-existing key.
    for i in 0..500u32 {
        let key = format!("pre{i:04}");
        assert!(r.lookup(key.as_bytes()), "pinned reader lost {key}");
        assert_eq!(r.value().unwrap(), i.to_le_bytes());
    }
    assert!(r.is_valid());

    // While the reader is pinned, retirements accumulate.
    let pinned = trie.mem_get_stat();
    assert!(pinned.lazy_free_cnt > 0, "edits must have retired nodes");

    // Releasing the reader lets the queue drain completely.
    r.release();
    w.acquire();
    assert!(w.insert(b"final", &0u32.to_le_bytes()).unwrap());
    w.release();
    let drained = trie.mem_get_stat();
    assert_eq!(drained.lazy_free_cnt, 0);
    assert_eq!(drained.lazy_free_sum, 0);
}

#[test]
fn concurrent_readers_with_single_writer() {
    common::init_tracing();
    let trie = Patricia::new(8, 64 << 20, ConcurrentLevel::OneWriteMultiRead).unwrap();
    let written = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicUsize::new(0));

    let writer = {
        let trie = Arc::clone(&trie);
        let written = Arc::clone(&written);
        thread::spawn(move || {
            let mut w = trie.writer_token();
            for i in 0..3000u64 {
                let key = format!("w{i:06}");
                w.acquire();
                assert!(w.insert(key.as_bytes(), &i.to_le_bytes()).unwrap());
                w.release();
                written.store(i as usize + 1, Ordering::Release);
            }
        })
    };

    let mut readers = Vec::new();
    for _ in 0..4 {
        let trie = Arc::clone(&trie);
        let written = Arc::clone(&written);
        let stop = Arc::clone(&stop);
        readers.push(thread::spawn(move || {
            let mut r = trie.reader_token();
            let mut checked = 0usize;
            while stop.load(Ordering::Acquire) == 0 {
                let upto = written.load(Ordering::Acquire);
                if upto == 0 {
                    continue;
                }
                r.acquire();
                // Everything the writer published before our acquire must
                // be visible.
                for i in (0..upto).step_by(97) {
                    let key = format!("w{i:06}");
                    assert!(r.lookup(key.as_bytes()), "lost {key}");
                    let v = u64::from_le_bytes(r.value().unwrap().try_into().unwrap());
                    assert_eq!(v, i as u64);
                    checked += 1;
                }
                r.release();
            }
            // Final full pass once the writer is done.
            r.acquire();
            for i in 0..3000u64 {
                let key = format!("w{i:06}");
                assert!(r.lookup(key.as_bytes()), "lost {key}");
                checked += 1;
            }
            r.release();
            checked
        }));
    }

    writer.join().unwrap();
    stop.store(1, Ordering::Release);
    for h in readers {
        assert!(h.join().unwrap() > 0, "reader did no work");
    }
    assert_eq!(trie.num_words(), 3000);
}

#[test]
fn multi_writer_same_keys_agree() {
    common::init_tracing();
    let trie = Patricia::new(4, 64 << 20, ConcurrentLevel::MultiWriteMultiRead).unwrap();
    let new_counts = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for t in 0..4u32 {
        let trie = Arc::clone(&trie);
        let new_counts = Arc::clone(&new_counts);
        handles.push(thread::spawn(move || {
            let mut w = trie.writer_token();
            w.acquire();
            // All threads fight over the same 500 keys.
            for i in 0..500u32 {
                let key = format!("shared{i:04}");
                let newly = w.insert(key.as_bytes(), &(t * 10_000 + i).to_le_bytes()).unwrap();
                assert!(w.has_value(), "arena exhausted");
                if newly {
                    new_counts.fetch_add(1, Ordering::Relaxed);
                }
            }
            w.release();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // Each key was newly inserted exactly once across all threads.
    assert_eq!(new_counts.load(Ordering::Relaxed), 500);
    assert_eq!(trie.num_words(), 500);

    let mut r = trie.reader_token();
    r.acquire();
    for i in 0..500u32 {
        let key = format!("shared{i:04}");
        assert!(r.lookup(key.as_bytes()));
        // The winning value is one of the contenders' writes.
        let v = u32::from_le_bytes(r.value().unwrap().try_into().unwrap());
        assert_eq!(v % 10_000, i);
    }
    r.release();
}

#[test]
fn iterator_stays_valid_across_unrelated_edits() {
    common::init_tracing();
    let trie = Patricia::new(4, 64 << 20, ConcurrentLevel::OneWriteMultiRead).unwrap();
    let mut w = trie.writer_token();
    w.acquire();
    for i in 0..100u32 {
        let key = format!("stable{i:03}");
        assert!(w.insert(key.as_bytes(), &i.to_le_bytes()).unwrap());
    }
    w.release();

    let mut cur = trie.cursor();
    cur.acquire();
    assert!(cur.seek_begin());
    let first = cur.word().to_vec();

    // Edits land in a disjoint part of the key space.
    w.acquire();
    for i in 0..100u32 {
        let key = format!("zother{i:03}");
        assert!(w.insert(key.as_bytes(), &i.to_le_bytes()).unwrap());
    }
    w.release();

    // The cursor still walks its snapshot's keys in order.
    assert_eq!(cur.word(), first.as_slice());
    let mut count = 1;
    while cur.incr() {
        count += 1;
    }
    assert!(count >= 100, "cursor saw {count} keys");
    cur.release();
}

#[test]
fn tls_tokens_are_reused_per_thread() {
    let trie = Patricia::new(4, 16 << 20, ConcurrentLevel::OneWriteMultiRead).unwrap();
    {
        let mut w = trie.tls_writer_token();
        w.acquire();
        assert!(w.insert(b"one", &1u32.to_le_bytes()).unwrap());
        w.release();
    }
    {
        // Same thread: the cached core comes back.
        let mut w = trie.tls_writer_token();
        w.acquire();
        assert!(!w.insert(b"one", &2u32.to_le_bytes()).unwrap());
        w.release();
    }
    let trie2 = Arc::clone(&trie);
    thread::spawn(move || {
        let mut r = trie2.tls_reader_token();
        r.acquire();
        assert!(r.lookup(b"one"));
        r.release();
    })
    .join()
    .unwrap();
}
