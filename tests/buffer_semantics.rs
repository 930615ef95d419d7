//! Integration tests for stage buffers and bindings
//!
//! These tests validate the exchange guarantees readers rely on:
//! - FIFO, exactly-once delivery to consume readers
//! - Latest-value reads never block after the first publish
//! - Rendezvous (capacity 0) hand-off and producer serialization
//! - Timeout degradation to stale values

mod common;

use boidstream::pipeline::{Binding, BindingCursor, Freshness, ReadMode, StageBuffer};
use common::{test_timeout, wait_for};
use crossbeam_channel::bounded;
use proptest::prelude::*;
use serial_test::serial;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_consume_reader_sees_every_value_in_order(
        capacity in 0usize..4,
        values in prop::collection::vec(any::<u32>(), 0..60),
    ) {
        let buf = Arc::new(StageBuffer::new("fifo", capacity));
        let producer = {
            let buf = buf.clone();
            let values = values.clone();
            thread::spawn(move || {
                for v in values {
                    buf.publish_enqueue(v).unwrap();
                }
            })
        };
        let seen: Vec<u32> = (0..values.len()).map(|_| buf.dequeue().unwrap()).collect();
        producer.join().unwrap();

        prop_assert_eq!(&seen, &values);
        let stats = buf.stats();
        prop_assert_eq!(stats.total_enqueues, values.len() as u64);
        prop_assert_eq!(stats.total_dequeues, values.len() as u64);
        prop_assert_eq!(stats.queue_length, 0);
    }

    #[test]
    fn prop_peek_returns_most_recent_publish(
        ops in prop::collection::vec((any::<bool>(), any::<u32>()), 1..40),
    ) {
        let buf = StageBuffer::new("latest", ops.len());
        for (overwrite, v) in &ops {
            if *overwrite {
                buf.publish_overwrite(*v).unwrap();
            } else {
                buf.publish_enqueue(*v).unwrap();
            }
            let start = Instant::now();
            prop_assert_eq!(buf.peek().unwrap(), *v);
            prop_assert_eq!(buf.try_peek(Duration::ZERO).unwrap(), Some(*v));
            prop_assert!(start.elapsed() < Duration::from_millis(50));
        }
    }
}

#[test]
fn test_rendezvous_serializes_concurrent_producers() {
    let buf = Arc::new(StageBuffer::new("sync", 0));
    let returns = Arc::new(AtomicU64::new(0));
    let per_producer = 25u64;

    let producers: Vec<_> = (0..2u64)
        .map(|p| {
            let buf = buf.clone();
            let returns = returns.clone();
            thread::spawn(move || {
                for i in 0..per_producer {
                    buf.publish_enqueue(p * 1000 + i).unwrap();
                    let returned = returns.fetch_add(1, Ordering::SeqCst) + 1;
                    // Every returned publish was handed to the consumer.
                    assert!(buf.stats().total_dequeues >= returned);
                }
            })
        })
        .collect();

    let mut seen = Vec::new();
    for _ in 0..2 * per_producer {
        let stats = buf.stats();
        assert!(stats.total_enqueues - stats.total_dequeues <= 1);
        seen.push(buf.dequeue().unwrap());
        thread::sleep(Duration::from_micros(200));
    }
    for producer in producers {
        producer.join().unwrap();
    }

    for p in 0..2u64 {
        let mine: Vec<u64> = seen.iter().copied().filter(|v| v / 1000 == p).collect();
        assert_eq!(mine, (0..per_producer).map(|i| p * 1000 + i).collect::<Vec<_>>());
    }
}

#[test]
fn test_capacity_two_blocks_third_publish_until_dequeue() {
    let buf = Arc::new(StageBuffer::new("cap2", 2));
    let third_returned = Arc::new(AtomicBool::new(false));
    let producer = {
        let buf = buf.clone();
        let third_returned = third_returned.clone();
        thread::spawn(move || {
            buf.publish_enqueue("v1".to_string()).unwrap();
            buf.publish_enqueue("v2".to_string()).unwrap();
            buf.publish_enqueue("v3".to_string()).unwrap();
            third_returned.store(true, Ordering::SeqCst);
        })
    };

    assert!(wait_for(test_timeout(), || buf.queue_len() == 2));
    thread::sleep(Duration::from_millis(50));
    assert!(!third_returned.load(Ordering::SeqCst));

    assert_eq!(buf.dequeue().unwrap(), "v1");
    assert!(wait_for(test_timeout(), || third_returned.load(Ordering::SeqCst)));
    producer.join().unwrap();
    assert_eq!(buf.dequeue().unwrap(), "v2");
    assert_eq!(buf.dequeue().unwrap(), "v3");
}

#[test]
fn test_on_publish_reader_wakes_with_first_value() {
    let buf = Arc::new(StageBuffer::<u32>::new("events", 1));
    let (_stop, shutdown) = bounded::<()>(0);
    let binding = Binding::on(&buf).mode(ReadMode::OnPublish).build().unwrap();
    let mut cursor = BindingCursor::new(binding);

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let done = done.clone();
        thread::spawn(move || {
            let captured = cursor.next(&shutdown).unwrap();
            done.store(true, Ordering::SeqCst);
            captured
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!done.load(Ordering::SeqCst), "reader must block before any publish");
    buf.publish_enqueue(11).unwrap();

    let captured = reader.join().unwrap();
    assert_eq!(captured.value, 11);
    assert_eq!(captured.freshness, Freshness::Fresh);
}

#[test]
#[serial]
fn test_consume_timeout_serves_last_known_value() {
    let buf = Arc::new(StageBuffer::<u64>::new("slow", 4));
    let (_stop, shutdown) = bounded::<()>(0);
    let binding = Binding::on(&buf)
        .timeout(Duration::from_millis(50))
        .allow_stale_on_timeout(true)
        .build()
        .unwrap();
    let mut cursor = BindingCursor::new(binding);

    let running = Arc::new(AtomicBool::new(true));
    let producer = {
        let buf = buf.clone();
        let running = running.clone();
        thread::spawn(move || {
            let mut v = 1u64;
            while running.load(Ordering::SeqCst) {
                if buf.publish_enqueue(v).is_err() {
                    break;
                }
                v += 1;
                thread::sleep(Duration::from_millis(200));
            }
        })
    };

    let mut last_fresh = None;
    let mut stale_reads = 0;
    let deadline = Instant::now() + Duration::from_millis(900);
    while Instant::now() < deadline {
        let captured = cursor.next(&shutdown).unwrap();
        match captured.freshness {
            Freshness::Fresh => last_fresh = Some(captured.value),
            Freshness::Stale => {
                stale_reads += 1;
                assert_eq!(Some(captured.value), last_fresh);
                assert_ne!(captured.value, 0);
            }
            Freshness::Missing if last_fresh.is_none() => {}
            other => panic!("unexpected read {:?} after {:?}", other, last_fresh),
        }
    }
    running.store(false, Ordering::SeqCst);
    buf.close();
    producer.join().unwrap();

    assert!(last_fresh.unwrap_or(0) >= 3);
    assert!(stale_reads >= 6, "only {} stale reads", stale_reads);
}
