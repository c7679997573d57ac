use std::{process::ExitCode, sync::Arc, time::Instant};

use rand::{rngs::StdRng, Rng, SeedableRng};
use thinlock::{
    logger,
    object_model::{heap::Heap, object::ObjectRef},
    options::{Options, OPTIONS},
    sync::{lock_word, LockWord, ThinLocks},
    threading::{thread_manager, Thread},
    Result,
};

const COUNTER: usize = 0;

/// One worker: pick an object, enter it a random number of times, bump its
/// counter with plain loads and stores, leave. Returns increments per object.
fn worker(index: usize, options: Options, locks: Arc<ThinLocks>, objects: Arc<Vec<ObjectRef>>) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(options.seed.wrapping_add(index as u64));
    let mut increments = vec![0; objects.len()];

    for _ in 0..options.iterations {
        let which = rng.random_range(0..objects.len());
        let object = objects[which];
        let depth = rng.random_range(1..=options.max_recursion.max(1));

        for _ in 0..depth {
            locks.enter(object);
        }
        unsafe {
            let value = object.read_field(COUNTER);
            object.write_field(COUNTER, value + 1);
        }
        for _ in 0..depth {
            locks.exit(object);
        }
        increments[which] += 1;
    }
    increments
}

fn run(options: &Options) -> Result<bool> {
    let objects_count = options.objects.max(1);
    let heap = Heap::new(objects_count * 64 + 4096);
    let objects = (0..objects_count)
        .map(|class_id| heap.allocate(1, class_id))
        .collect::<Result<Vec<_>>>()?;
    let objects = Arc::new(objects);
    let locks = Arc::new(ThinLocks::new());

    log::info!(
        "{} threads x {} rounds on {} objects, nesting up to {}",
        options.threads,
        options.iterations,
        objects_count,
        options.max_recursion
    );
    let start = Instant::now();

    let handles = (0..options.threads)
        .map(|index| {
            let options = options.clone();
            let locks = locks.clone();
            let objects = objects.clone();
            Thread::spawn(format!("worker-{index}"), move || {
                worker(index, options, locks, objects)
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut expected = vec![0usize; objects_count];
    for handle in handles {
        let increments = handle
            .join()
            .unwrap_or_else(|payload| std::panic::resume_unwind(payload));
        for (total, count) in expected.iter_mut().zip(increments) {
            *total += count;
        }
    }

    log::info!(
        "finished in {:?}, {} objects inflated into {} monitors, {} threads still registered",
        start.elapsed(),
        objects
            .iter()
            .filter(|obj| lock_word::is_fat(locks.lock_word(**obj)))
            .count(),
        locks.fat_monitor().count(),
        thread_manager().live_count()
    );

    if !options.verify {
        return Ok(true);
    }

    let mut ok = true;
    for (object, expected) in heap.objects().zip(expected) {
        let counter = object.load_field(COUNTER, std::sync::atomic::Ordering::Acquire);
        let word = locks.lock_word(object);
        if counter != expected {
            log::error!("{object}: counter is {counter}, expected {expected}");
            ok = false;
        }
        if !lock_word::has_no_locks(word) && !lock_word::is_fat(word) {
            log::error!("{object} still locked thin: {:?}", LockWord(word));
            ok = false;
        }
        if let Some(owner) = locks.owner(object) {
            log::error!("{object} still owned by thread {owner}");
            ok = false;
        }
    }
    if ok {
        log::info!("verified {} objects", objects_count);
    }
    Ok(ok)
}

fn main() -> ExitCode {
    // Nothing to do if a logger is already in place.
    let _ = logger::try_init();

    let options = OPTIONS.clone();
    match Thread::main(|| run(&options)).and_then(|result| result) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
