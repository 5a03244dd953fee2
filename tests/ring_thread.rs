use std::sync::Arc;
use std::thread;

use lumahost::ring::RingBuffer;

#[test]
fn bytes_cross_threads_in_fifo_order() {
    let ring = Arc::new(RingBuffer::new(256));
    let producer = {
        let ring = ring.clone();
        thread::spawn(move || {
            for value in 0..50_000u32 {
                let bytes = value.to_ne_bytes();
                while !ring.write(&bytes) {
                    thread::yield_now();
                }
            }
        })
    };

    let mut bytes = [0u8; 4];
    for expected in 0..50_000u32 {
        while !ring.read(&mut bytes) {
            thread::yield_now();
        }
        assert_eq!(u32::from_ne_bytes(bytes), expected);
    }
    producer.join().expect("producer thread panicked");
    assert_eq!(ring.read_space(), 0);
}

#[test]
fn framed_messages_survive_transit_bit_identical() {
    let ring = Arc::new(RingBuffer::new(1024));
    let messages: Vec<Vec<u8>> = (0..500u32)
        .map(|i| {
            let len = (i % 40 + 1) as usize;
            (0..len).map(|j| (i as u8).wrapping_add(j as u8)).collect()
        })
        .collect();

    let producer = {
        let ring = ring.clone();
        let messages = messages.clone();
        thread::spawn(move || {
            for message in &messages {
                let header = (message.len() as u32).to_ne_bytes();
                loop {
                    if ring.write_space() >= header.len() + message.len() {
                        assert!(ring.write(&header));
                        assert!(ring.write(message));
                        break;
                    }
                    thread::yield_now();
                }
            }
        })
    };

    let mut received = Vec::new();
    while received.len() < messages.len() {
        let mut header = [0u8; 4];
        if !ring.peek(&mut header) {
            thread::yield_now();
            continue;
        }
        let size = u32::from_ne_bytes(header) as usize;
        if ring.read_space() < header.len() + size {
            thread::yield_now();
            continue;
        }
        assert!(ring.read(&mut header));
        let mut payload = vec![0u8; size];
        assert!(ring.read(&mut payload));
        received.push(payload);
    }
    producer.join().expect("producer thread panicked");
    assert_eq!(received, messages);
}

#[test]
fn space_never_exceeds_capacity_minus_one() {
    // Interleaved on one thread: the space queries are only coherent
    // from a thread that owns one end of the buffer.
    let ring = RingBuffer::new(128);
    let mut out = [0u8; 3];
    for step in 0..10_000u32 {
        if step % 3 != 2 {
            let _ = ring.write(&[1, 2, 3]);
        } else {
            let _ = ring.read(&mut out);
        }
        assert!(ring.write_space() + ring.read_space() <= ring.capacity() - 1);
    }
}
