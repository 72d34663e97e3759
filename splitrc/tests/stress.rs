use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::thread::scope;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use splitrc::{Pool, Queue, Stack};

// Each test owns its counter; the harness runs tests in parallel.
struct Payload {
    live: &'static AtomicUsize,
    #[allow(dead_code)]
    v: usize,
}

impl Payload {
    fn new(live: &'static AtomicUsize, v: usize) -> Self {
        live.fetch_add(1, Ordering::Relaxed);
        Payload { live, v }
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

#[test]
fn stack_mixed_stress() {
    const THREADS: usize = 8;
    const OPS_PER_THREAD: usize = 50_000;
    static LIVE: AtomicUsize = AtomicUsize::new(0);

    let stack = Stack::new();
    let popped = AtomicUsize::new(0);
    let pushed = AtomicUsize::new(0);

    scope(|s| {
        for t in 0..THREADS {
            let stack = &stack;
            let popped = &popped;
            let pushed = &pushed;
            s.spawn(move |_| {
                let mut rng = SmallRng::seed_from_u64(t as u64);
                for i in 0..OPS_PER_THREAD {
                    if rng.gen_bool(0.5) {
                        stack.push(Payload::new(&LIVE, i));
                        pushed.fetch_add(1, Ordering::Relaxed);
                    } else if stack.try_pop().is_some() {
                        popped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    })
    .unwrap();

    let remaining = pushed.load(Ordering::Relaxed) - popped.load(Ordering::Relaxed);
    assert_eq!(LIVE.load(Ordering::Relaxed), remaining);
    drop(stack);
    assert_eq!(LIVE.load(Ordering::Relaxed), 0);
}

#[test]
fn queue_mixed_stress() {
    const THREADS: usize = 8;
    const OPS_PER_THREAD: usize = 50_000;
    static LIVE: AtomicUsize = AtomicUsize::new(0);

    let queue = Queue::new();
    let dequeued = AtomicUsize::new(0);
    let enqueued = AtomicUsize::new(0);

    scope(|s| {
        for t in 0..THREADS {
            let queue = &queue;
            let dequeued = &dequeued;
            let enqueued = &enqueued;
            s.spawn(move |_| {
                let mut rng = SmallRng::seed_from_u64(t as u64);
                for i in 0..OPS_PER_THREAD {
                    if rng.gen_bool(0.5) {
                        queue.enqueue(Payload::new(&LIVE, i));
                        enqueued.fetch_add(1, Ordering::Relaxed);
                    } else if queue.try_dequeue().is_some() {
                        dequeued.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    })
    .unwrap();

    let remaining = enqueued.load(Ordering::Relaxed) - dequeued.load(Ordering::Relaxed);
    assert_eq!(LIVE.load(Ordering::Relaxed), remaining);
    drop(queue);
    assert_eq!(LIVE.load(Ordering::Relaxed), 0);
}

// With a single consumer, each producer's elements must come out in the
// order that producer put them in.
#[test]
fn queue_per_producer_order() {
    const PRODUCERS: usize = 4;
    const ELEMENTS_PER_PRODUCER: usize = 20_000;

    let queue = Queue::new();

    scope(|s| {
        for t in 0..PRODUCERS {
            let queue = &queue;
            s.spawn(move |_| {
                for i in 0..ELEMENTS_PER_PRODUCER {
                    queue.enqueue((t, i));
                }
            });
        }

        let queue = &queue;
        s.spawn(move |_| {
            let mut last = [None; PRODUCERS];
            let mut taken = 0;
            while taken < PRODUCERS * ELEMENTS_PER_PRODUCER {
                if let Some((t, i)) = queue.try_dequeue() {
                    assert!(last[t].map_or(true, |prev| prev < i));
                    last[t] = Some(i);
                    taken += 1;
                }
            }
        });
    })
    .unwrap();

    assert_eq!(queue.try_dequeue(), None);
}

#[test]
fn pool_churn() {
    const THREADS: usize = 8;
    const CAPACITY: usize = 32;
    const OPS_PER_THREAD: usize = 50_000;
    static LIVE: AtomicUsize = AtomicUsize::new(0);

    let pool = Pool::<Payload>::new(CAPACITY);

    scope(|s| {
        for t in 0..THREADS {
            let pool = &pool;
            s.spawn(move |_| {
                let mut rng = SmallRng::seed_from_u64(t as u64);
                let mut held = Vec::new();
                for i in 0..OPS_PER_THREAD {
                    if held.is_empty() || rng.gen_bool(0.6) {
                        if let Some(p) = pool.try_allocate() {
                            unsafe { p.as_ptr().write(Payload::new(&LIVE, i)) };
                            held.push(p);
                        }
                    } else {
                        let p = held.swap_remove(rng.gen_range(0..held.len()));
                        unsafe { pool.destroy(p) };
                    }
                }
                for p in held {
                    unsafe { pool.destroy(p) };
                }
            });
        }
    })
    .unwrap();

    assert_eq!(LIVE.load(Ordering::Relaxed), 0);
    let mut taken = Vec::new();
    while let Some(p) = pool.try_allocate() {
        taken.push(p);
    }
    assert_eq!(taken.len(), CAPACITY);
    for p in taken {
        unsafe { pool.deallocate(p) };
    }
}
