//! Directory queue persistence and sharing between instances.
//!
//! Needs a writable `/dev/shm`; tests return early when shared memory is
//! not permitted in the sandbox.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

use quay::{BuildError, DirQueue, DirQueueConfig, Dequeue, Enqueue, TextCodec};

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        quay::init_tracing();
    });
}

static COUNTER: AtomicUsize = AtomicUsize::new(0);

struct Scratch {
    name: String,
    dir: PathBuf,
}

impl Scratch {
    fn new(tag: &str) -> Self {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let name = format!("it-{tag}-{}-{n}", std::process::id());
        let dir = std::env::temp_dir().join(&name);
        std::fs::create_dir_all(&dir).unwrap();
        Self { name, dir }
    }

    fn config(&self, capacity: usize) -> DirQueueConfig {
        DirQueueConfig {
            name: self.name.clone(),
            dir: self.dir.clone(),
            capacity,
            remove_locks: false,
            rescan_interval: Duration::from_millis(50),
        }
    }

    /// `None` when the sandbox forbids shared memory.
    fn open(&self, capacity: usize) -> Option<DirQueue<String, TextCodec<String>>> {
        match DirQueue::new(self.config(capacity), TextCodec::new()) {
            Ok(q) => Some(q),
            Err(BuildError::Shm(e)) if e.errno() == Some(rustix::io::Errno::ACCESS) => None,
            Err(e) => panic!("cannot open dir queue: {e}"),
        }
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = DirQueue::<String, TextCodec<String>>::remove_locks(&self.name);
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

#[test]
#[serial_test::serial]
fn messages_survive_the_instance_that_wrote_them() {
    init_test_tracing();
    let scratch = Scratch::new("durable");
    let Some(writer) = scratch.open(0) else {
        return;
    };
    for i in 0..5 {
        writer.enqueue(format!("msg-{i}")).unwrap();
    }
    drop(writer);

    let reader = scratch.open(0).unwrap();
    assert_eq!(reader.len().unwrap(), 5);
    // Writes this close together may share a modification time, so only the
    // multiset is stable.
    let mut got: Vec<_> = (0..5)
        .map(|_| reader.dequeue_timeout(Duration::from_secs(1)).unwrap())
        .collect();
    got.sort();
    let expected: Vec<_> = (0..5).map(|i| format!("msg-{i}")).collect();
    assert_eq!(got, expected);
    assert!(reader.is_empty().unwrap());
    let leftovers = std::fs::read_dir(&scratch.dir).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[test]
#[serial_test::serial]
fn two_instances_share_one_directory() {
    init_test_tracing();
    let scratch = Scratch::new("shared");
    let Some(producer) = scratch.open(4) else {
        return;
    };
    let consumer = Arc::new(scratch.open(4).unwrap());

    let reader = {
        let consumer = Arc::clone(&consumer);
        thread::spawn(move || {
            (0..20)
                .map(|_| consumer.dequeue_timeout(Duration::from_secs(10)).unwrap())
                .collect::<Vec<_>>()
        })
    };
    for i in 0..20 {
        producer.enqueue_timeout(i.to_string(), Duration::from_secs(10)).unwrap();
    }
    let mut got: Vec<u32> = reader
        .join()
        .unwrap()
        .iter()
        .map(|s| s.parse().unwrap())
        .collect();
    got.sort_unstable();
    assert_eq!(got, (0..20).collect::<Vec<_>>());
}

#[test]
#[serial_test::serial]
fn full_directory_times_out_producers() {
    init_test_tracing();
    let scratch = Scratch::new("full");
    let Some(queue) = scratch.open(1) else {
        return;
    };
    queue.enqueue("only".to_string()).unwrap();
    assert!(queue.is_full().unwrap());
    let err = queue
        .enqueue_timeout("overflow".to_string(), Duration::from_millis(120))
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(queue.len().unwrap(), 1);
}

#[test]
#[serial_test::serial]
fn foreign_files_are_delivered_in_modification_order() {
    init_test_tracing();
    let scratch = Scratch::new("foreign");
    let Some(queue) = scratch.open(0) else {
        return;
    };
    let base = std::time::SystemTime::now() - Duration::from_secs(60);
    for (i, name) in ["zz", "aa", "mm"].into_iter().enumerate() {
        let path = scratch.dir.join(name);
        std::fs::write(&path, format!("{name}\n")).unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(base + Duration::from_secs(i as u64)).unwrap();
    }
    let order: Vec<_> = (0..3)
        .map(|_| queue.dequeue_timeout(Duration::from_secs(1)).unwrap())
        .collect();
    assert_eq!(order, ["zz", "aa", "mm"]);
}
