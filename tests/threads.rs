//! Thread lifecycle and scheduling scenarios.
//!
//! Scheduling here is cooperative, FIFO within a priority and strictly
//! prioritized across them, so every interleaving is deterministic and the
//! tests can assert exact event sequences.

use std::sync::{Arc, Mutex};

use teide_os::Kernel;

type EventLog = Arc<Mutex<Vec<String>>>;

fn record(log: &EventLog, event: impl Into<String>) {
    log.lock().unwrap().push(event.into());
}

/// Ten threads loop ten times each, yielding the CPU every pass. All equal
/// priority: round-robin, every thread's iterations in ascending order, and
/// every thread runs to completion.
#[test]
fn ten_cooperative_threads() {
    let kernel = Kernel::new();
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));

    let mut children = Vec::new();
    for t in 1..=10 {
        children.push(kernel.fork_joinable(&format!("thread {t}"), 0, {
            let kernel = kernel.clone();
            let events = events.clone();
            move || {
                for n in 0..10 {
                    record(&events, format!("thread {t} looped {n} times"));
                    kernel.yield_now();
                }
                record(&events, format!("Thread {t} has finished"));
            }
        }));
    }
    for child in children {
        assert_eq!(kernel.join(child), 0);
    }

    let events = events.lock().unwrap();
    let loops: Vec<&String> = events.iter().filter(|e| e.contains("looped")).collect();
    let finishes: Vec<&String> = events.iter().filter(|e| e.contains("finished")).collect();
    assert_eq!(loops.len(), 100);
    assert_eq!(finishes.len(), 10);

    // Each thread's own messages appear in ascending iteration order.
    for t in 1..=10 {
        let prefix = format!("thread {t} looped");
        let iterations: Vec<usize> = events
            .iter()
            .filter(|e| e.starts_with(&prefix))
            .map(|e| {
                e.trim_start_matches(&prefix)
                    .trim()
                    .trim_end_matches(" times")
                    .parse()
                    .unwrap()
            })
            .collect();
        assert_eq!(iterations, (0..10).collect::<Vec<_>>(), "thread {t} ran out of order");
    }

    // Equal priorities round-robin: the first ten loop messages are
    // iteration 0 of threads 1..=10 in fork order.
    for (t, event) in (1..=10).zip(loops.iter()) {
        assert_eq!(**event, format!("thread {t} looped 0 times"));
    }
}

/// A higher-priority thread forked mid-loop runs to completion before the
/// forking thread resumes a single further iteration.
#[test]
fn strict_priority_ordering() {
    let kernel = Kernel::new();
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));

    let a = kernel.fork_joinable("A", 1, {
        let kernel = kernel.clone();
        let events = events.clone();
        move || {
            for n in 0..3 {
                record(&events, format!("A {n}"));
                kernel.yield_now();
            }
            kernel.fork("B", 3, {
                let kernel = kernel.clone();
                let events = events.clone();
                move || {
                    for n in 0..3 {
                        record(&events, format!("B {n}"));
                        kernel.yield_now();
                    }
                    record(&events, "B finished");
                }
            });
            for n in 3..6 {
                record(&events, format!("A {n}"));
                kernel.yield_now();
            }
        }
    });
    assert_eq!(kernel.join(a), 0);

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "A 0", "A 1", "A 2", // A alone on the queue keeps the CPU
            "B 0", "B 1", "B 2", "B finished", // B preempts at A's next yield and runs dry
            "A 3", "A 4", "A 5",
        ]
    );
}

/// Join: the parent's join returns the child's exit status, and only after
/// the child's last words.
#[test]
fn join_collects_the_exit_status() {
    let kernel = Kernel::new();
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));

    let joinee = kernel.fork_joinable("joinee", 0, {
        let kernel = kernel.clone();
        let events = events.clone();
        move || {
            for _ in 0..5 {
                kernel.yield_now();
            }
            record(&events, "Done smelling the roses!");
        }
    });

    let status = kernel.join(joinee);
    record(&events, "Joinee has finished executing, we can continue.");

    assert_eq!(status, 0);
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "Done smelling the roses!",
            "Joinee has finished executing, we can continue.",
        ]
    );
}

/// Join on a thread that never existed, or that has already been joined,
/// reports −1 instead of blocking.
#[test]
fn join_on_a_missing_thread_returns_minus_one() {
    let kernel = Kernel::new();
    let child = kernel.fork_joinable("short-lived", 0, || {});
    assert_eq!(kernel.join(child), 0);
    // Already joined and reclaimed.
    assert_eq!(kernel.join(child), -1);
}

/// Yield with an empty ready queue returns immediately.
#[test]
fn yield_with_nothing_ready_keeps_running() {
    let kernel = Kernel::new();
    kernel.yield_now();
    kernel.yield_now();
    assert_eq!(kernel.current_priority(), 0);
}

/// A yielding thread keeps the CPU when only strictly lower-priority
/// threads are ready.
#[test]
fn yield_ignores_lower_priority_threads() {
    let kernel = Kernel::new();
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));

    let high = kernel.fork_joinable("high", 2, {
        let kernel = kernel.clone();
        let events = events.clone();
        move || {
            let low = kernel.fork_joinable("low", 1, {
                let events = events.clone();
                move || record(&events, "low ran")
            });
            record(&events, "high yielding");
            kernel.yield_now();
            record(&events, "high still running");
            assert_eq!(kernel.join(low), 0);
        }
    });
    assert_eq!(kernel.join(high), 0);

    assert_eq!(
        *events.lock().unwrap(),
        vec!["high yielding", "high still running", "low ran"]
    );
}
