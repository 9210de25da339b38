//! Cross-thread behavior of the bulk queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use nexus_bulk::{
    Blocking, BlockingQueue, DroppingQueue, Queue, StopSource, Unbounded, UnboundedQueue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Item {
    writer: usize,
    batch: usize,
    index: usize,
}

fn batch(writer: usize, batch: usize, len: usize) -> impl Iterator<Item = Item> {
    (0..len).map(move |index| Item {
        writer,
        batch,
        index,
    })
}

// ============================================================================
// Atomicity and Ordering
// ============================================================================

#[test]
fn batches_are_never_split() {
    const WRITERS: usize = 4;
    const BATCHES: usize = 500;
    const LEN: usize = 37;

    let queue = UnboundedQueue::<Item>::new();

    thread::scope(|s| {
        for writer in 0..WRITERS {
            let queue = &queue;
            s.spawn(move || {
                for b in 0..BATCHES {
                    queue.append(batch(writer, b, LEN));
                }
            });
        }

        let mut next_batch = [0usize; WRITERS];
        let mut seen = 0;
        let mut storage = Vec::new();
        while seen < WRITERS * BATCHES * LEN {
            storage = queue.pop_all(storage);
            assert_eq!(storage.len() % LEN, 0, "drain split a batch");

            for chunk in storage.chunks_exact(LEN) {
                let first = chunk[0];
                assert_eq!(first.batch, next_batch[first.writer], "writer order broken");
                next_batch[first.writer] += 1;

                for (i, item) in chunk.iter().enumerate() {
                    assert_eq!(item.writer, first.writer);
                    assert_eq!(item.batch, first.batch);
                    assert_eq!(item.index, i);
                }
            }
            seen += storage.len();
        }

        assert_eq!(next_batch, [BATCHES; WRITERS]);
    });

    assert!(queue.is_empty());
}

#[test]
fn single_pushes_keep_producer_order() {
    const WRITERS: usize = 3;
    const PER_WRITER: usize = 10_000;

    let queue = UnboundedQueue::<(usize, usize)>::new();

    thread::scope(|s| {
        for writer in 0..WRITERS {
            let queue = &queue;
            s.spawn(move || {
                for seq in 0..PER_WRITER {
                    queue.push((writer, seq));
                }
            });
        }

        let mut next = [0usize; WRITERS];
        let mut storage = Vec::new();
        while next.iter().sum::<usize>() < WRITERS * PER_WRITER {
            storage = queue.pop_all(storage);
            for &(writer, seq) in &storage {
                assert_eq!(seq, next[writer]);
                next[writer] += 1;
            }
        }
    });
}

#[test]
fn try_pop_all_sees_whole_batch_or_nothing() {
    const K: usize = 1000;
    let queue = UnboundedQueue::<usize>::new();

    thread::scope(|s| {
        s.spawn(|| queue.append(0..K));

        let mut storage = Vec::new();
        loop {
            storage = queue.try_pop_all(storage);
            if !storage.is_empty() {
                assert_eq!(storage, (0..K).collect::<Vec<_>>());
                break;
            }
            std::hint::spin_loop();
        }
    });
}

#[test]
fn cross_thread_pushes_arrive_in_order() {
    let queue = UnboundedQueue::<u32>::new();

    let received = thread::scope(|s| {
        s.spawn(|| {
            queue.push(0);
            queue.push(7);
        });

        let mut received = Vec::new();
        while received.len() < 2 {
            received.extend(queue.pop_all(Vec::new()));
        }
        received
    });

    assert_eq!(received, vec![0, 7]);
}

// ============================================================================
// No Loss
// ============================================================================

fn assert_no_loss<P>(queue: &Queue<Vec<usize>, P>, writers: usize, readers: usize, per_writer: usize)
where
    P: nexus_bulk::Backpressure + Sync,
{
    let stop = StopSource::new();
    let read = AtomicUsize::new(0);
    let sum = AtomicUsize::new(0);

    thread::scope(|s| {
        for _ in 0..readers {
            let token = stop.token();
            let (read, sum) = (&read, &sum);
            s.spawn(move || {
                let mut storage = Vec::new();
                loop {
                    storage = queue.pop_all_or_stop(&token, storage);
                    if storage.is_empty() {
                        break;
                    }
                    read.fetch_add(storage.len(), Ordering::Relaxed);
                    sum.fetch_add(storage.iter().sum::<usize>(), Ordering::Relaxed);
                }
            });
        }

        let producers: Vec<_> = (0..writers)
            .map(|_| {
                s.spawn(move || {
                    for chunk in (0..per_writer).collect::<Vec<_>>().chunks(64) {
                        queue.append(chunk.iter().copied());
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        stop.request_stop();
    });

    let leftover = queue.try_pop_all(Vec::new());
    let total_read = read.load(Ordering::Relaxed) + leftover.len();
    let total_sum = sum.load(Ordering::Relaxed) + leftover.iter().sum::<usize>();

    assert_eq!(total_read, writers * per_writer);
    assert_eq!(total_sum, writers * per_writer * (per_writer - 1) / 2);
}

#[test]
fn unbounded_delivers_everything_exactly_once() {
    let queue = UnboundedQueue::<usize>::new();
    assert_no_loss(&queue, 4, 3, 20_000);
}

#[test]
fn blocking_delivers_everything_exactly_once() {
    let queue = BlockingQueue::<usize>::new(256);
    assert_no_loss(&queue, 4, 3, 20_000);
}

// ============================================================================
// Backpressure
// ============================================================================

#[test]
fn blocking_single_pushes_never_exceed_capacity() {
    const CAP: usize = 16;
    const WRITERS: usize = 4;
    const PER_WRITER: usize = 5_000;

    let queue = BlockingQueue::<usize>::new(CAP);

    thread::scope(|s| {
        for _ in 0..WRITERS {
            s.spawn(|| {
                for i in 0..PER_WRITER {
                    queue.push(i);
                }
            });
        }

        let mut seen = 0;
        let mut storage = Vec::new();
        while seen < WRITERS * PER_WRITER {
            storage = queue.pop_all(storage);
            assert!(storage.len() <= CAP, "drained {} > {CAP}", storage.len());
            seen += storage.len();
        }
    });
}

#[test]
fn blocking_producer_waits_for_consumer() {
    const CAP: usize = 4;
    let queue = BlockingQueue::<usize>::new(CAP);
    queue.append(0..CAP);

    let pushed = AtomicUsize::new(0);

    thread::scope(|s| {
        s.spawn(|| {
            queue.push(CAP);
            pushed.store(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(100));
        assert_eq!(pushed.load(Ordering::SeqCst), 0, "push returned while full");

        let drained = queue.pop_all(Vec::new());
        assert_eq!(drained.len(), CAP);
    });

    assert_eq!(pushed.load(Ordering::SeqCst), 1);
    assert_eq!(queue.try_pop_all(Vec::new()), vec![CAP]);
}

#[test]
fn dropping_keeps_latest_under_overflow() {
    const CAP: usize = 8;
    let queue = DroppingQueue::<usize>::new(CAP);

    let mut dropped = 0;
    for i in 0..1000 {
        dropped += queue.push(i);
    }
    let remaining = queue.try_pop_all(Vec::new());

    assert_eq!(dropped + remaining.len(), 1000);
    assert!(remaining.len() <= CAP);
    assert_eq!(remaining.last(), Some(&999));
}

// ============================================================================
// Cancellation
// ============================================================================

#[test]
fn stop_wakes_every_blocked_consumer() {
    let queue = UnboundedQueue::<u32>::new();
    let source = StopSource::new();

    thread::scope(|s| {
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let token = source.token();
                let queue = &queue;
                s.spawn(move || queue.pop_all_or_stop(&token, Vec::new()))
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        source.request_stop();

        for c in consumers {
            assert!(c.join().unwrap().is_empty());
        }
        assert!(start.elapsed() < Duration::from_secs(5));
    });
}

#[test]
fn stop_wakes_single_element_consumers() {
    let queue: Queue<VecDeque<u32>> = Queue::with_policy(Unbounded);
    let source = StopSource::new();

    thread::scope(|s| {
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let token = source.token();
                let queue = &queue;
                s.spawn(move || queue.pop_one_or_stop(&token))
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        source.request_stop();

        for c in consumers {
            assert_eq!(c.join().unwrap(), None);
        }
    });
}

#[test]
fn stop_racing_with_data_never_strands_items() {
    for _ in 0..50 {
        let queue = UnboundedQueue::<u32>::new();
        let source = StopSource::new();
        let token = source.token();

        let got = thread::scope(|s| {
            let consumer = s.spawn(|| {
                let mut total = 0;
                let mut storage = Vec::new();
                loop {
                    storage = queue.pop_all_or_stop(&token, storage);
                    if storage.is_empty() {
                        return total;
                    }
                    total += storage.len();
                }
            });

            queue.append(0..100);
            source.request_stop();
            consumer.join().unwrap()
        });

        assert_eq!(got + queue.len(), 100);
    }
}

// ============================================================================
// Single-element Consumers
// ============================================================================

#[test]
fn batch_wakes_every_single_element_consumer() {
    const CONSUMERS: usize = 4;
    let queue: Queue<VecDeque<usize>> = Queue::with_policy(Unbounded);

    thread::scope(|s| {
        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let queue = &queue;
                s.spawn(move || queue.pop_one())
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        queue.append(0..CONSUMERS);

        let mut got: Vec<_> = consumers.into_iter().map(|c| c.join().unwrap()).collect();
        got.sort_unstable();
        assert_eq!(got, (0..CONSUMERS).collect::<Vec<_>>());
    });
}

#[test]
fn mixed_consumers_split_the_work() {
    const TOTAL: usize = 50_000;
    let queue: Queue<VecDeque<usize>> = Queue::with_policy(Unbounded);
    let taken = AtomicUsize::new(0);

    thread::scope(|s| {
        s.spawn(|| {
            for chunk in (0..TOTAL).collect::<Vec<_>>().chunks(100) {
                queue.append(chunk.iter().copied());
            }
        });

        for _ in 0..2 {
            s.spawn(|| {
                while taken.load(Ordering::SeqCst) < TOTAL {
                    if queue.pop_one_for(Duration::from_millis(10)).is_some() {
                        taken.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });
        }

        s.spawn(|| {
            while taken.load(Ordering::SeqCst) < TOTAL {
                let drained = queue.pop_all_for(Duration::from_millis(10), VecDeque::new());
                taken.fetch_add(drained.len(), Ordering::SeqCst);
            }
        });
    });

    assert_eq!(taken.load(Ordering::SeqCst), TOTAL);
    assert!(queue.is_empty());
}

#[test]
fn single_pushes_feed_every_pop_one_consumer() {
    const CONSUMERS: usize = 4;
    const PER_CONSUMER: usize = 2_000;

    let queue: Queue<VecDeque<usize>> = Queue::with_policy(Unbounded);

    let sum: usize = thread::scope(|s| {
        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let queue = &queue;
                s.spawn(move || (0..PER_CONSUMER).map(|_| queue.pop_one()).sum::<usize>())
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        for i in 0..CONSUMERS * PER_CONSUMER {
            queue.push(i);
        }

        consumers.into_iter().map(|c| c.join().unwrap()).sum()
    });

    let n = CONSUMERS * PER_CONSUMER;
    assert_eq!(sum, n * (n - 1) / 2);
    assert!(queue.is_empty());
}

#[test]
fn pop_one_releases_many_blocked_producers() {
    const CAP: usize = 2;
    const PRODUCERS: usize = 4;

    let queue: Queue<VecDeque<usize>, Blocking> = Queue::with_policy(Blocking::new(CAP));
    queue.append(0..CAP);

    let mut got = thread::scope(|s| {
        for value in CAP..CAP + PRODUCERS {
            let queue = &queue;
            s.spawn(move || queue.push(value));
        }

        thread::sleep(Duration::from_millis(50));
        (0..CAP + PRODUCERS).map(|_| queue.pop_one()).collect::<Vec<_>>()
    });

    got.sort_unstable();
    assert_eq!(got, (0..CAP + PRODUCERS).collect::<Vec<_>>());
}
