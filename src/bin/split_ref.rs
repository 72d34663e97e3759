extern crate clap;
extern crate csv;

use crossbeam_utils::thread::scope;
use rand::distributions::Uniform;
use rand::prelude::*;
use std::cmp::max;
use std::sync::atomic::{compiler_fence, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::time::Instant;

use splitrc::{Pool, Queue, Stack};
use splitrc_benchmark::config::{setup, BenchWriter, Config, Perf, DS};

fn main() {
    let (config, output) = setup("splitrc-benchmark".to_string());
    bench(&config, output);
}

fn bench(config: &Config, output: BenchWriter) {
    println!("{}", config);
    let perf = match config.ds {
        DS::Stack => bench_stack(config),
        DS::Queue => bench_queue(config),
        DS::Pool => bench_pool(config),
    };
    output.write_record(config, &perf);
    println!("{}", perf);
}

// The sampling & interference thread; joins through `mem_sender`.
fn spawn_sampler<'a>(
    s: &crossbeam_utils::thread::Scope<'a>,
    config: &'a Config,
    barrier: &'a Arc<Barrier>,
    mem_sender: mpsc::Sender<(usize, usize)>,
) {
    if config.aux_thread > 0 {
        s.spawn(move |_| {
            let mut samples = 0usize;
            let mut acc = 0usize;
            let mut peak = 0usize;
            barrier.clone().wait();

            let start = Instant::now();
            let mut next_sampling = start + config.sampling_period;
            while start.elapsed() < config.duration {
                let now = Instant::now();
                if now > next_sampling {
                    let allocated = config.mem_sampler.sample();
                    samples += 1;

                    acc += allocated;
                    peak = max(peak, allocated);

                    next_sampling = now + config.sampling_period;
                }
                std::thread::sleep(config.aux_thread_period);
            }

            if config.sampling {
                mem_sender.send((peak, acc / samples)).unwrap();
            } else {
                mem_sender.send((0, 0)).unwrap();
            }
        });
    } else {
        mem_sender.send((0, 0)).unwrap();
    }
}

fn collect(config: &Config, ops_receiver: mpsc::Receiver<u64>) -> u64 {
    let mut ops = 0;
    for _ in 0..config.threads {
        let local_ops = ops_receiver.recv().unwrap();
        ops += local_ops;
    }
    ops / config.interval
}

fn bench_stack(config: &Config) -> Perf {
    let stack = Stack::new();
    let key_dist = Uniform::from(0..100000usize);
    for _ in 0..config.prefill {
        stack.push(key_dist.sample(&mut rand::thread_rng()).to_string());
    }

    let barrier = &Arc::new(Barrier::new(config.threads + config.aux_thread));
    let (ops_sender, ops_receiver) = mpsc::channel();
    let (mem_sender, mem_receiver) = mpsc::channel();

    scope(|s| {
        spawn_sampler(s, config, barrier, mem_sender);

        for _ in 0..config.threads {
            let ops_sender = ops_sender.clone();
            let stack = &stack;
            s.spawn(move |_| {
                let mut ops: u64 = 0;
                let rng = &mut rand::thread_rng();
                barrier.clone().wait();
                let start = Instant::now();

                while start.elapsed() < config.duration {
                    let item = key_dist.sample(rng).to_string();
                    stack.push(item);
                    compiler_fence(Ordering::SeqCst);
                    stack.try_pop().unwrap();
                    compiler_fence(Ordering::SeqCst);

                    ops += 1;
                }
                ops_sender.send(ops).unwrap();
            });
        }
    })
    .unwrap();
    println!("end");

    let ops_per_sec = collect(config, ops_receiver);
    let (peak_mem, avg_mem) = mem_receiver.recv().unwrap();
    Perf {
        ops_per_sec,
        peak_mem,
        avg_mem,
    }
}

fn bench_queue(config: &Config) -> Perf {
    let queue = Queue::new();
    let key_dist = Uniform::from(0..100000usize);
    for _ in 0..config.prefill {
        queue.enqueue(key_dist.sample(&mut rand::thread_rng()).to_string());
    }

    let barrier = &Arc::new(Barrier::new(config.threads + config.aux_thread));
    let (ops_sender, ops_receiver) = mpsc::channel();
    let (mem_sender, mem_receiver) = mpsc::channel();

    scope(|s| {
        spawn_sampler(s, config, barrier, mem_sender);

        for _ in 0..config.threads {
            let ops_sender = ops_sender.clone();
            let queue = &queue;
            s.spawn(move |_| {
                let mut ops: u64 = 0;
                let rng = &mut rand::thread_rng();
                barrier.clone().wait();
                let start = Instant::now();

                while start.elapsed() < config.duration {
                    let item = key_dist.sample(rng).to_string();
                    queue.enqueue(item);
                    compiler_fence(Ordering::SeqCst);
                    queue.try_dequeue().unwrap();
                    compiler_fence(Ordering::SeqCst);

                    ops += 1;
                }
                ops_sender.send(ops).unwrap();
            });
        }
    })
    .unwrap();
    println!("end");

    let ops_per_sec = collect(config, ops_receiver);
    let (peak_mem, avg_mem) = mem_receiver.recv().unwrap();
    Perf {
        ops_per_sec,
        peak_mem,
        avg_mem,
    }
}

fn bench_pool(config: &Config) -> Perf {
    // enough slots that exhaustion reflects contention, not sizing
    let pool = Pool::<String>::new(config.threads * 2 + config.prefill);
    let key_dist = Uniform::from(0..100000usize);

    let barrier = &Arc::new(Barrier::new(config.threads + config.aux_thread));
    let (ops_sender, ops_receiver) = mpsc::channel();
    let (mem_sender, mem_receiver) = mpsc::channel();

    scope(|s| {
        spawn_sampler(s, config, barrier, mem_sender);

        for _ in 0..config.threads {
            let ops_sender = ops_sender.clone();
            let pool = &pool;
            s.spawn(move |_| {
                let mut ops: u64 = 0;
                let rng = &mut rand::thread_rng();
                barrier.clone().wait();
                let start = Instant::now();

                while start.elapsed() < config.duration {
                    if let Some(p) = pool.try_allocate() {
                        unsafe { p.as_ptr().write(key_dist.sample(rng).to_string()) };
                        compiler_fence(Ordering::SeqCst);
                        unsafe { pool.destroy(p) };
                        compiler_fence(Ordering::SeqCst);

                        ops += 1;
                    }
                }
                ops_sender.send(ops).unwrap();
            });
        }
    })
    .unwrap();
    println!("end");

    let ops_per_sec = collect(config, ops_receiver);
    let (peak_mem, avg_mem) = mem_receiver.recv().unwrap();
    Perf {
        ops_per_sec,
        peak_mem,
        avg_mem,
    }
}
