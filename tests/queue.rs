use std::collections::HashSet;
use std::thread;

use rand::Rng;
use traffic_inspector::api::FlowRecord;
use traffic_inspector::queue;

const PRODUCERS: usize = 4;
const PER_PRODUCER: usize = 10_000;

#[test]
fn concurrent_producers_lose_and_duplicate_nothing() {
    let (tx, rx) = queue::channel();
    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let tx = tx.clone();
            thread::spawn(move || {
                let mut rng = rand::rng();
                for i in 0..PER_PRODUCER {
                    tx.enqueue(FlowRecord::from(format!("{p}-{i}")));
                    if rng.random_ratio(1, 500) {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();
    drop(tx);

    let mut seen = HashSet::with_capacity(PRODUCERS * PER_PRODUCER);
    let mut last_per_producer = vec![None::<usize>; PRODUCERS];
    while seen.len() < PRODUCERS * PER_PRODUCER {
        let Some(record) = rx.dequeue() else {
            thread::sleep(queue::IDLE_BACKOFF);
            continue;
        };
        let tag = String::from_utf8(record.into_bytes().into_vec()).unwrap();
        let (p, i) = tag.split_once('-').unwrap();
        let (p, i): (usize, usize) = (p.parse().unwrap(), i.parse().unwrap());
        // a single producer's records come out in the order it pushed them
        if let Some(prev) = last_per_producer[p] {
            assert!(i > prev);
        }
        last_per_producer[p] = Some(i);
        assert!(seen.insert(tag), "duplicate record");
    }
    for producer in producers {
        producer.join().unwrap();
    }

    assert!(rx.dequeue().is_none());
    let stats = rx.destroy().ok().unwrap();
    assert_eq!(stats.enqueued, (PRODUCERS * PER_PRODUCER) as u64);
    assert_eq!(stats.dequeued, stats.enqueued);
    assert_eq!(stats.freed, 0);
}

#[test]
fn destroy_frees_what_was_never_dequeued() {
    let (tx, rx) = queue::channel();
    for i in 0..100 {
        tx.enqueue(FlowRecord::from(format!("{i}")));
    }
    for _ in 0..40 {
        rx.dequeue().unwrap();
    }
    drop(tx);
    let stats = rx.destroy().ok().unwrap();
    assert_eq!(stats.dequeued + stats.freed, stats.enqueued);
    assert_eq!(stats.freed, 60);
}
