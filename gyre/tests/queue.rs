//! Ring-protocol scenarios against private queues.
//!
//! Private queues run the exact same mapping paths as named ones (double
//! mapping included), so everything here exercises the real layout.

use std::thread;

use gyre::{QueueFactory, RingItem, ShmQueueError};
use rustix::io::Errno;
use rustix::param::page_size;

macro_rules! unwrap_or_skip {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(ShmQueueError::Posix { source, .. }) if source == Errno::ACCESS => {
                eprintln!("Skipping test: shared memory namespace denied access");
                return;
            }
            Err(err) => panic!("unexpected shared memory error: {err}"),
        }
    };
}

#[test]
fn test_create_push_peek() {
    let mut factory = QueueFactory::create_private(10 * page_size());
    let queue = unwrap_or_skip!(factory.get());

    assert!(queue.is_empty());
    assert_eq!(queue.available(), 0);

    // SAFETY: this test is the queue's only producer.
    assert!(unsafe { queue.push_bytes(b"Hello World!") });

    assert!(!queue.is_empty());
    assert_eq!(queue.available(), 12);
    assert_eq!(queue.peek().expect("non-empty"), b"Hello World!");
}

#[test]
fn test_wrap_stress() {
    let mut factory = QueueFactory::create_private(10 * page_size());
    let queue = unwrap_or_skip!(factory.get());

    // SAFETY: this test is the queue's only producer and only consumer.
    unsafe {
        for _ in 0..100_000 {
            assert!(queue.push_bytes(b"Hello World!"));
            assert_eq!(queue.peek().expect("just pushed").len(), 12);
            queue.pop(12);
        }
        assert!(queue.push_bytes(b"Bye!"));
    }

    assert_eq!(queue.available(), 4);
    assert_eq!(queue.peek().expect("non-empty"), b"Bye!");
}

#[test]
fn test_peek_is_contiguous_across_the_wrap() {
    let capacity = page_size();
    let mut factory = QueueFactory::create_private(capacity);
    let queue = unwrap_or_skip!(factory.get());

    let pattern: Vec<u8> = (0..capacity - 1).map(|i| (i % 251) as u8).collect();

    // SAFETY: this test is the queue's only producer and only consumer.
    unsafe {
        // Park the indices just shy of the wrap point, then write a span
        // that crosses it.
        assert!(queue.push_bytes(&pattern));
        queue.pop(pattern.len());
        assert!(queue.push_bytes(&pattern));
    }

    // The span wraps through the overlay mapping and still reads back as
    // one unbroken slice.
    assert_eq!(queue.peek().expect("non-empty"), &pattern[..]);
}

#[test]
fn test_full_and_empty_boundaries() {
    let capacity = page_size();
    let mut factory = QueueFactory::create_private(capacity);
    let queue = unwrap_or_skip!(factory.get());

    // An empty queue offers every byte but the reserved one.
    assert_eq!(queue.space(), capacity - 1);

    // SAFETY: this test is the queue's only producer and only consumer.
    unsafe {
        // A reservation of exactly the advertised space succeeds.
        assert!(queue.alloc(queue.space()).is_some());

        assert!(queue.push_bytes(b"x"));
        // One byte more than the remaining space does not fit.
        assert!(queue.alloc(queue.space() + 1).is_none());

        // Fill to the brim.
        let fill = vec![0u8; queue.space()];
        assert!(queue.push_bytes(&fill));
        assert_eq!(queue.available(), capacity - 1);
        assert_eq!(queue.space(), 0);

        // Full means not a single byte more.
        assert!(!queue.push_bytes(b"y"));

        // Freeing one byte reopens exactly one byte.
        queue.pop(1);
        assert_eq!(queue.space(), 1);
        assert!(queue.push_bytes(b"y"));
        assert!(!queue.push_bytes(b"z"));
    }
}

#[test]
fn test_space_available_law_holds_throughout() {
    let capacity = page_size();
    let mut factory = QueueFactory::create_private(capacity);
    let queue = unwrap_or_skip!(factory.get());

    let check = |queue: &gyre::Queue| {
        assert_eq!(queue.space() + queue.available(), capacity - 1);
        assert_eq!(queue.is_empty(), queue.available() == 0);
    };

    check(queue);
    // SAFETY: this test is the queue's only producer and only consumer.
    unsafe {
        for round in 0..64 {
            let n = 1 + (round * 37) % 300;
            assert!(queue.push_bytes(&vec![round as u8; n]));
            check(queue);
            queue.pop(n / 2 + 1);
            check(queue);
            let rest = n - n / 2 - 1;
            if rest > 0 {
                queue.pop(rest);
                check(queue);
            }
        }
    }
    assert!(queue.is_empty());
}

#[derive(Clone, Copy, Debug, PartialEq, RingItem)]
#[repr(C)]
struct Sample {
    timestamp: u64,
    channel: u32,
    reading: f32,
}

#[test]
fn test_typed_push_and_front() {
    let mut factory = QueueFactory::create_private(page_size());
    let queue = unwrap_or_skip!(factory.get());

    let sample = Sample {
        timestamp: 0x1122_3344_5566_7788,
        channel: 7,
        reading: 21.5,
    };

    // SAFETY: this test is the queue's only producer and only consumer.
    unsafe {
        assert!(queue.push(sample));
        assert_eq!(queue.available(), size_of::<Sample>());
        assert_eq!(queue.front::<Sample>(), Some(sample));

        // front does not consume.
        assert_eq!(queue.front::<Sample>(), Some(sample));
        queue.pop(size_of::<Sample>());
    }
    assert!(queue.is_empty());
    assert_eq!(queue.front::<Sample>(), None);
}

#[test]
fn test_front_needs_a_whole_element() {
    let mut factory = QueueFactory::create_private(page_size());
    let queue = unwrap_or_skip!(factory.get());

    // SAFETY: this test is the queue's only producer.
    unsafe {
        assert!(queue.push(0xABu8));
    }
    // One byte is readable; an eight-byte element is not.
    assert_eq!(queue.front::<u8>(), Some(0xAB));
    assert_eq!(queue.front::<u64>(), None);
}

#[test]
fn test_concurrent_producer_consumer_visibility() {
    const COUNT: u64 = 100_000;

    let mut factory = QueueFactory::create_private(page_size());
    let queue = unwrap_or_skip!(factory.get());

    thread::scope(|s| {
        s.spawn(move || {
            for i in 0..COUNT {
                loop {
                    // SAFETY: this thread is the queue's only producer.
                    if unsafe { queue.push(i) } {
                        break;
                    }
                    std::hint::spin_loop();
                }
            }
        });

        s.spawn(move || {
            for expected in 0..COUNT {
                let value = loop {
                    if let Some(value) = queue.front::<u64>() {
                        break value;
                    }
                    std::hint::spin_loop();
                };
                assert_eq!(value, expected);
                // SAFETY: this thread is the queue's only consumer.
                unsafe { queue.pop(size_of::<u64>()) };
            }
        });
    });

    assert!(queue.is_empty());
}
