use clap::Parser as ClapParser;
use std::{process, sync::Arc, thread, time::Instant};

use managed_heap::{
    AllocatorType, CollectorType, Heap, HeapDaemon, HeapSettings, Mutator, ObjectRef,
    ProcessState, Runtime, logger,
    settings::{parse_size, parse_verify_flags},
    testing::{
        CLASS_SIZE, KIND_NORMAL, KIND_WEAK, TestModel, TestRuntime, init_class, init_object,
        object_size, ref_slot,
    },
};

#[derive(ClapParser, Debug)]
#[command(author, version, about = "Allocates object graphs on the managed heap", long_about = None)]
struct Cli {
    /// Mutator threads allocating at the same time
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Allocations per thread
    #[arg(long, default_value_t = 200_000)]
    iterations: usize,

    /// Objects every thread keeps reachable from the roots
    #[arg(long, default_value_t = 512)]
    retain: usize,

    /// Largest payload of an object in bytes
    #[arg(long, default_value_t = 256)]
    max_payload: usize,

    #[arg(long, help = "Heap growth limit and capacity, e.g. 64m")]
    heap_size: Option<String>,

    #[arg(long, help = "Collector while in the foreground: ms, cms, ss or gss")]
    collector: Option<CollectorType>,

    #[arg(long, help = "Collector while in the background")]
    background_collector: Option<CollectorType>,

    /// Flip the process state every this many allocations of thread 0
    #[arg(long, default_value_t = 0)]
    flip_every: usize,

    #[arg(long, help = "Verification passes, e.g. pre_gc,post_gc,cards")]
    verify: Option<String>,

    /// Seed of the allocation pattern
    #[arg(long, default_value_t = 0x5eed)]
    seed: u64,
}

/// Deterministic allocation pattern.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, bound: usize) -> usize {
        (self.next() % bound.max(1) as u64) as usize
    }
}

struct Classes {
    normal: ObjectRef,
    weak: ObjectRef,
}

fn settings_from(cli: &Cli) -> HeapSettings {
    let mut settings = HeapSettings::from_env();
    if let Some(size) = &cli.heap_size {
        let Some(bytes) = parse_size(size) else {
            eprintln!("invalid heap size {size:?}");
            process::exit(2);
        };
        settings.growth_limit = bytes;
        settings.capacity = bytes;
        settings.bump_pointer_capacity = settings.bump_pointer_capacity.max(bytes);
        settings.initial_size = settings.initial_size.min(bytes);
    }
    if let Some(collector) = cli.collector {
        settings.foreground_collector = collector;
    }
    if let Some(collector) = cli.background_collector {
        settings.background_collector = collector;
    }
    if let Some(verify) = &cli.verify {
        settings.verify = parse_verify_flags(verify);
    }
    settings
}

fn alloc_class(mutator: &mut Mutator, metaclass: Option<ObjectRef>, kind: usize) -> ObjectRef {
    let class = mutator
        .alloc_raw(CLASS_SIZE, AllocatorType::NonMoving)
        .unwrap_or_else(|err| {
            eprintln!("failed to allocate a class: {err}");
            process::exit(1);
        });
    // SAFETY: freshly allocated CLASS_SIZE bytes
    unsafe { init_class(class, metaclass.unwrap_or(class), kind) };
    class
}

fn run_mutator(
    heap: &Heap,
    runtime: &TestRuntime,
    classes: &Classes,
    cli: &Cli,
    index: usize,
) -> usize {
    let mut mutator = heap.mutator(&format!("stress {index}"));
    let mut rng = Lcg(cli.seed ^ (index as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15));
    let base = index * cli.retain;
    let mut failures = 0;
    for iteration in 0..cli.iterations {
        if index == 0 && cli.flip_every > 0 && iteration % cli.flip_every == 0 && iteration > 0 {
            let state = if heap.care_about_pause_times() {
                ProcessState::JankImperceptible
            } else {
                ProcessState::JankPerceptible
            };
            heap.update_process_state(state);
        }
        let refs = rng.below(4);
        let weak = refs > 0 && rng.below(16) == 0;
        let size = object_size(refs, rng.below(cli.max_payload));
        let class = if weak { classes.weak } else { classes.normal };
        let obj = match mutator.alloc_object_with(class, size, |obj, _| {
            // SAFETY: the allocation is at least `size` bytes
            unsafe { init_object(obj, size, refs) };
        }) {
            Ok(obj) => obj,
            Err(oom) => {
                log::warn!(target: "heap", "stress {index}: {oom}, dropping its roots");
                failures += 1;
                let mut roots = runtime.roots.lock();
                roots[base..base + cli.retain].fill(classes.normal);
                continue;
            }
        };
        for field in 0..refs {
            let target = runtime.root(base + rng.below(cli.retain));
            // SAFETY: obj has `refs` reference slots
            mutator.write_field(obj, unsafe { ref_slot(obj, field) }, Some(target));
        }
        if rng.below(4) == 0 {
            runtime.roots.lock()[base + rng.below(cli.retain)] = obj;
        }
        if iteration % 64 == 0 {
            mutator.safepoint();
        }
    }
    failures
}

fn main() {
    logger::try_init();
    let cli = Cli::parse();
    if cli.threads == 0 || cli.retain == 0 {
        eprintln!("--threads and --retain must be positive");
        process::exit(2);
    }

    let runtime = Arc::new(TestRuntime::new());
    let heap = match Heap::new(
        settings_from(&cli),
        Box::new(TestModel),
        runtime.clone() as Arc<dyn Runtime>,
    ) {
        Ok(heap) => heap,
        Err(err) => {
            eprintln!("failed to create the heap: {err}");
            process::exit(1);
        }
    };
    let daemon = HeapDaemon::start(&heap);

    let classes = {
        let mut mutator = heap.mutator("stress setup");
        let metaclass = alloc_class(&mut mutator, None, KIND_NORMAL);
        let classes = Classes {
            normal: alloc_class(&mut mutator, Some(metaclass), KIND_NORMAL),
            weak: alloc_class(&mut mutator, Some(metaclass), KIND_WEAK),
        };
        let mut roots = runtime.roots.lock();
        // thread slots first, each pointing at a class until replaced
        roots.resize(cli.threads * cli.retain, classes.normal);
        roots.extend([metaclass, classes.normal, classes.weak]);
        classes
    };

    let start = Instant::now();
    let failures: usize = thread::scope(|scope| {
        let handles = (0..cli.threads)
            .map(|index| {
                let (heap, runtime, classes, cli) = (&heap, &*runtime, &classes, &cli);
                scope.spawn(move || run_mutator(heap, runtime, classes, cli, index))
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    eprintln!("a stress thread panicked");
                    process::exit(1);
                })
            })
            .sum()
    });
    let elapsed = start.elapsed();
    drop(daemon);

    let broken = heap.verify_heap();
    println!(
        "{} threads allocated {} objects in {elapsed:?}, {failures} allocation failures",
        cli.threads,
        cli.threads * cli.iterations
    );
    print!("{}", heap.dump_for_sigquit());
    if broken > 0 {
        eprintln!("heap verification found {broken} broken references");
        process::exit(1);
    }
}
