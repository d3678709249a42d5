//! Integration tests: SerialChannel over the virtual null-modem bus
//!
//! These drive the public API the way a polling loop would, with no real
//! hardware. Port pairs are created on a `VirtualBus`, which also records
//! every write call, open, close and discard for verification.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use superio_com::adapters::virtual_port::VirtualBus;
use superio_com::{ChannelError, ChannelEvent, ComConfig, SerialChannel};

fn config(read_buffer: usize, write_buffer: usize) -> ComConfig {
    ComConfig {
        com_read_buffer_size: read_buffer,
        com_read_timeout: 50,
        com_write_buffer_size: write_buffer,
        com_write_timeout: 50,
        com_loop_interval: 0,
    }
}

fn open_on(bus: &Arc<VirtualBus>, port: u32, config: &ComConfig) -> SerialChannel {
    let channel = SerialChannel::new(port, 9600, bus.clone());
    channel.initialize(config).unwrap();
    channel.open().unwrap();
    channel
}

/// 1000 bytes through a 256-byte write buffer: four ordered chunks, and the
/// peer sees every byte exactly once in order.
#[test]
fn chunked_write_reaches_peer_in_order() {
    let bus = VirtualBus::new();
    bus.create_pair(3, 4);
    let com = config(256, 256);
    let channel = open_on(&bus, 3, &com);
    let peer = open_on(&bus, 4, &com);

    let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(channel.write(&payload).unwrap(), 1000);
    assert_eq!(bus.stats(3).unwrap().writes, vec![256, 256, 256, 232]);

    let mut received = Vec::new();
    for _ in 0..10 {
        received.extend(peer.read().unwrap());
        if received.len() >= payload.len() {
            break;
        }
    }
    assert_eq!(received, payload);
}

/// Payload at exactly the write-buffer size is one call.
#[test]
fn write_at_buffer_size_is_one_call() {
    let bus = VirtualBus::new();
    bus.create_pair(3, 4);
    let channel = open_on(&bus, 3, &config(256, 256));

    assert_eq!(channel.write(&[0xAA; 256]).unwrap(), 256);
    assert_eq!(bus.stats(3).unwrap().writes, vec![256]);
}

/// Chunk sizes always partition the payload, whatever the sizes.
#[test]
fn chunk_sizes_partition_payload() {
    for (len, chunk) in [(1usize, 1usize), (7, 3), (9, 3), (10, 1), (513, 256)] {
        let bus = VirtualBus::new();
        bus.create_pair(1, 2);
        let channel = open_on(&bus, 1, &config(64, chunk));

        let sent = channel.write(&vec![1u8; len]).unwrap();
        let writes = bus.stats(1).unwrap().writes;
        assert_eq!(sent, len);
        assert_eq!(writes.iter().sum::<usize>(), len);
        assert!(writes.iter().all(|&w| w > 0 && w <= chunk), "{writes:?}");
    }
}

#[test]
fn open_on_missing_port_fires_one_error() {
    let bus = VirtualBus::new();
    let channel = SerialChannel::new(42, 19200, bus.clone());
    channel.initialize(&config(64, 64)).unwrap();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    channel.on_error(move |_, port, baud, message| {
        sink.lock().unwrap().push((port, baud, message.to_string()));
    });
    let opened = Arc::new(AtomicUsize::new(0));
    let opened_count = Arc::clone(&opened);
    channel.on_opened(move |_, _, _, _| {
        opened_count.fetch_add(1, Ordering::SeqCst);
    });

    let result = channel.open();
    assert!(matches!(result, Err(ChannelError::Serial(_))));
    assert!(!channel.is_open());

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, 42);
    assert_eq!(errors[0].1, 19200);
    assert_eq!(opened.load(Ordering::SeqCst), 0);
}

#[test]
fn busy_port_fails_until_holder_closes() {
    let bus = VirtualBus::new();
    bus.create_pair(1, 2);
    let com = config(64, 64);
    let holder = open_on(&bus, 1, &com);

    let contender = SerialChannel::new(1, 9600, bus.clone());
    contender.initialize(&com).unwrap();
    assert!(contender.open().is_err());
    assert!(!contender.is_open());

    holder.close();
    contender.open().unwrap();
    assert!(contender.is_open());
}

#[test]
fn concurrent_dispose_closes_hardware_once() {
    let bus = VirtualBus::new();
    bus.create_pair(1, 2);
    let channel = Arc::new(open_on(&bus, 1, &config(64, 64)));
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let channel = Arc::clone(&channel);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                channel.dispose();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(channel.is_disposed());
    assert!(!channel.is_open());
    assert_eq!(bus.stats(1).unwrap().closes, 1);

    drop(channel);
    assert_eq!(bus.stats(1).unwrap().closes, 1);
}

#[test]
fn event_receiver_sees_lifecycle_in_order() {
    let bus = VirtualBus::new();
    bus.create_pair(1, 2);
    let channel = SerialChannel::new(1, 9600, bus.clone());
    channel.initialize(&config(64, 64)).unwrap();
    let events = channel.event_receiver();

    channel.open().unwrap();
    channel.close();
    assert!(channel.open().is_err());

    let id = channel.session_id().to_string();
    let received: Vec<ChannelEvent> = events.try_iter().collect();
    assert_eq!(received.len(), 3);
    assert_eq!(
        received[0],
        ChannelEvent::Opened {
            session_id: id.clone(),
            port: 1,
            baud: 9600,
            is_open: true,
        }
    );
    assert_eq!(
        received[1],
        ChannelEvent::Closed {
            session_id: id.clone(),
            port: 1,
            baud: 9600,
            is_closed: true,
        }
    );
    assert!(matches!(&received[2], ChannelEvent::Error { session_id, .. } if *session_id == id));
}

#[test]
fn handlers_fire_in_subscription_order() {
    let bus = VirtualBus::new();
    bus.create_pair(1, 2);
    let channel = SerialChannel::new(1, 9600, bus.clone());
    channel.initialize(&config(64, 64)).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    for tag in ["first", "second", "third"] {
        let order = Arc::clone(&order);
        channel.on_opened(move |_, _, _, _| order.lock().unwrap().push(tag));
    }
    channel.open().unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
}

#[test]
fn handler_can_inspect_channel_during_dispatch() {
    let bus = VirtualBus::new();
    bus.create_pair(1, 2);
    let channel = SerialChannel::new(1, 9600, bus.clone());
    channel.initialize(&config(64, 64)).unwrap();

    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    channel.on_opened(move |channel, _, _, _| {
        // Querying the channel from a handler must not deadlock.
        *sink.lock().unwrap() = Some((channel.is_open(), channel.key()));
        channel.on_closed(|_, _, _, _| {});
    });
    channel.open().unwrap();
    assert_eq!(*seen.lock().unwrap(), Some((true, channel.key())));
}

#[test]
fn read_paces_by_loop_interval() {
    let bus = VirtualBus::new();
    bus.create_pair(1, 2);
    let com = ComConfig {
        com_loop_interval: 30,
        ..config(64, 64)
    };
    let channel = open_on(&bus, 1, &com);

    let started = std::time::Instant::now();
    assert!(channel.read().unwrap().is_empty());
    assert!(started.elapsed() >= Duration::from_millis(30));
}

/// The sync lock is never taken by the channel itself, so a caller holding it
/// can still drive the channel from the same thread.
#[test]
fn sync_lock_is_for_callers_only() {
    let bus = VirtualBus::new();
    bus.create_pair(1, 2);
    let channel = open_on(&bus, 1, &config(64, 64));
    let peer = open_on(&bus, 2, &config(64, 64));

    let lock = channel.sync_lock();
    let _guard = lock.lock().unwrap();
    channel.write(b"ping").unwrap();
    assert_eq!(peer.read().unwrap(), b"ping".to_vec());
    channel.clear_buffer().unwrap();
    assert!(Arc::ptr_eq(&lock, &channel.sync_lock()));
}

/// Two polling loops sharing one channel serialize a write-then-read exchange
/// through the exposed lock.
#[test]
fn shared_channel_exchange_under_sync_lock() {
    let bus = VirtualBus::new();
    bus.create_pair(1, 2);
    let channel = Arc::new(open_on(&bus, 1, &config(64, 64)));
    let echo = open_on(&bus, 2, &config(64, 64));

    let workers: Vec<_> = (0..4u8)
        .map(|id| {
            let channel = Arc::clone(&channel);
            thread::spawn(move || {
                let lock = channel.sync_lock();
                let _guard = lock.lock().unwrap();
                channel.write(&[id; 3]).unwrap()
            })
        })
        .collect();
    let sent: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
    assert_eq!(sent, 12);

    let received = echo.read().unwrap();
    assert_eq!(received.len(), 12);
    // Each locked write lands contiguously.
    for frame in received.chunks(3) {
        assert!(frame.iter().all(|&b| b == frame[0]));
    }
}
