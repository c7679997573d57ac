use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Barrier,
    },
    time::{Duration, Instant},
};

use thinlock::{
    prelude::*,
    sync::lock_word::{self, RECURSION_BOUND},
    threading::thread_manager,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn setup(objects: usize) -> (Arc<Heap>, Arc<ThinLocks>, Vec<ObjectRef>) {
    let heap = Arc::new(Heap::new(4096));
    let objects = (0..objects).map(|i| heap.allocate(2, i).unwrap()).collect();
    (heap, Arc::new(ThinLocks::new()), objects)
}

#[test]
fn at_most_one_thread_inside() {
    init();
    let (_heap, locks, objects) = setup(1);
    let obj = objects[0];
    let inside = Arc::new(AtomicUsize::new(0));
    let threads = 4;
    let rounds = 2_000;

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let locks = locks.clone();
            let inside = inside.clone();
            Thread::spawn(format!("mutex-{i}"), move || {
                for round in 0..rounds {
                    // Mix of nesting depths, including some past the thin bound.
                    let depth = 1 + (i + round) % 3 + if round % 500 == 0 { RECURSION_BOUND } else { 0 };
                    for _ in 0..depth {
                        locks.enter(obj);
                    }
                    assert_eq!(inside.fetch_add(1, Ordering::Relaxed), 0);
                    unsafe { obj.write_field(0, obj.read_field(0) + 1) };
                    inside.fetch_sub(1, Ordering::Relaxed);
                    for _ in 0..depth {
                        locks.exit(obj);
                    }
                }
            })
            .unwrap()
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(obj.load_field(0, Ordering::Acquire), threads * rounds);
}

#[test]
fn nested_holds_release_to_another_thread() {
    init();
    let (_heap, locks, objects) = setup(1);
    let obj = objects[0];
    let depth = 5;

    Thread::main(|| {
        for _ in 0..depth {
            locks.enter(obj);
        }
        assert_eq!(lock_word::recursion(locks.lock_word(obj)), depth - 1);

        let other = {
            let locks = locks.clone();
            Thread::spawn("late", move || {
                locks.enter(obj);
                let me = ThreadIdentity::current_id();
                assert_eq!(locks.owner(obj), Some(me));
                locks.exit(obj);
            })
            .unwrap()
        };

        std::thread::sleep(Duration::from_millis(10));
        assert!(locks.holds_lock(obj));
        for _ in 0..depth {
            locks.exit(obj);
        }
        other.join().unwrap();
    })
    .unwrap();
}

#[test]
fn uncontended_reservation_round_trips() {
    init();
    let (_heap, locks, objects) = setup(2);

    Thread::main(|| {
        let me = ThreadIdentity::current_id();
        for &obj in &objects {
            for _ in 0..100 {
                locks.enter(obj);
                assert_eq!(locks.lock_word(obj), lock_word::encode_owner(me));
                locks.exit(obj);
                assert_eq!(locks.lock_word(obj), 0);
            }
        }
        assert_eq!(locks.fat_monitor().count(), 0);
    })
    .unwrap();
}

#[test]
fn contention_falls_back_without_losing_updates() {
    init();
    let (_heap, locks, objects) = setup(3);
    let objects = Arc::new(objects);
    let threads = 6;
    let rounds = 1_000;
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let locks = locks.clone();
            let objects = objects.clone();
            let start = start.clone();
            Thread::spawn(format!("contend-{i}"), move || {
                start.wait();
                for round in 0..rounds {
                    let obj = objects[(i + round) % objects.len()];
                    locks.synchronized(obj, || unsafe {
                        obj.write_field(1, obj.read_field(1) + 1);
                    });
                }
            })
            .unwrap()
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let total: usize = objects.iter().map(|obj| obj.load_field(1, Ordering::Acquire)).sum();
    assert_eq!(total, threads * rounds);
    for &obj in objects.iter() {
        let word = locks.lock_word(obj);
        assert!(lock_word::has_no_locks(word) || lock_word::is_fat(word), "{:?}", LockWord(word));
        assert_eq!(locks.owner(obj), None);
    }
}

#[test]
fn contender_parks_behind_thin_owner() {
    init();
    let (_heap, locks, objects) = setup(1);
    let obj = objects[0];
    let entered = Arc::new(AtomicBool::new(false));

    Thread::main(|| {
        let me = ThreadIdentity::current_id();
        locks.enter(obj);

        let contender = Thread::new(Some("contender".into())).unwrap();
        let handle = {
            let locks = locks.clone();
            let entered = entered.clone();
            contender.start(move || {
                locks.enter(obj);
                entered.store(true, Ordering::Release);
                locks.exit(obj);
            })
        };

        let start = Instant::now();
        while !contender.is_blocked() {
            assert!(start.elapsed() < Duration::from_secs(10), "contender never parked");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!entered.load(Ordering::Acquire));
        assert!(thread_manager().blocked_count() >= 1);
        // Parking does not touch the owner's thin word.
        assert_eq!(locks.lock_word(obj), lock_word::encode_owner(me));

        locks.exit(obj);
        handle.join().unwrap();
        assert!(entered.load(Ordering::Acquire));
    })
    .unwrap();
}

#[test]
fn notify_wakes_waiter() {
    init();
    let (_heap, locks, objects) = setup(1);
    let obj = objects[0];
    let waiting = Arc::new(AtomicBool::new(false));

    let waiter = {
        let locks = locks.clone();
        let waiting = waiting.clone();
        Thread::spawn("waiter", move || {
            let guard = locks.lock(obj);
            waiting.store(true, Ordering::Release);
            while unsafe { obj.read_field(0) } == 0 {
                guard.wait_for(Duration::from_millis(50)).unwrap();
            }
            assert!(locks.holds_lock(obj));
        })
        .unwrap()
    };

    Thread::main(|| {
        while !waiting.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        let guard = locks.lock(obj);
        unsafe { obj.write_field(0, 1) };
        guard.notify_all().unwrap();
    })
    .unwrap();

    waiter.join().unwrap();
    assert_eq!(locks.owner(obj), None);
}

#[test]
fn wait_requires_ownership() {
    init();
    let (_heap, locks, objects) = setup(1);
    let obj = objects[0];

    Thread::main(|| {
        assert!(matches!(
            locks.wait(obj, Some(Duration::from_millis(1))),
            Err(Error::IllegalMonitorState { .. })
        ));

        locks.enter(obj);
        let other = {
            let locks = locks.clone();
            Thread::spawn("intruder", move || {
                assert!(matches!(locks.notify_all(obj), Err(Error::IllegalMonitorState { .. })));
                assert!(!locks.holds_lock(obj));
                assert_eq!(locks.lock_state(obj), LockState::ThinOwnedByOther);
            })
            .unwrap()
        };
        other.join().unwrap();
        locks.exit(obj);
    })
    .unwrap();
}
