//! Thread A takes and releases an object thin; threads B and C then race for it.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Barrier,
};

use thinlock::{prelude::*, sync::lock_word};

const ROUNDS: usize = 5_000;

fn racer(
    name: &str,
    locks: Arc<ThinLocks>,
    obj: ObjectRef,
    start: Arc<Barrier>,
    inside: Arc<AtomicUsize>,
) -> std::thread::JoinHandle<()> {
    Thread::spawn(name, move || {
        start.wait();
        for _ in 0..ROUNDS {
            locks.enter(obj);
            assert_eq!(inside.fetch_add(1, Ordering::Relaxed), 0);
            unsafe { obj.write_field(0, obj.read_field(0) + 1) };
            inside.fetch_sub(1, Ordering::Relaxed);
            locks.exit(obj);
        }
    })
    .unwrap()
}

#[test]
fn released_object_survives_a_race() {
    let _ = env_logger::builder().is_test(true).try_init();
    let heap = Heap::new(1024);
    let obj = heap.allocate(1, 0).unwrap();
    let locks = Arc::new(ThinLocks::new());

    let a = {
        let locks = locks.clone();
        Thread::spawn("A", move || {
            for _ in 0..3 {
                locks.enter(obj);
            }
            assert_eq!(locks.lock_state(obj), LockState::ThinOwnedBySelf);
            assert_eq!(lock_word::recursion(locks.lock_word(obj)), 2);
            for _ in 0..3 {
                locks.exit(obj);
            }
        })
        .unwrap()
    };
    a.join().unwrap();
    assert_eq!(locks.lock_word(obj), 0);

    let start = Arc::new(Barrier::new(2));
    let inside = Arc::new(AtomicUsize::new(0));
    let b = racer("B", locks.clone(), obj, start.clone(), inside.clone());
    let c = racer("C", locks.clone(), obj, start, inside);
    b.join().unwrap();
    c.join().unwrap();

    assert_eq!(obj.load_field(0, Ordering::Acquire), 2 * ROUNDS);
    let word = locks.lock_word(obj);
    if lock_word::is_fat(word) {
        assert_eq!(locks.owner(obj), None);
        assert_eq!(lock_word::recursion(word), 0);
    } else {
        assert_eq!(word, 0, "stale thin owner left behind: {:?}", LockWord(word));
    }
}
