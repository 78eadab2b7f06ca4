use async_sanitizer::{frame, Config, Scope};
use criterion::{
    black_box, criterion_group, criterion_main, measurement::Measurement, BenchmarkGroup,
    Criterion,
};
use futures::task;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

macro_rules! parbench {
    ($b:expr; setup { $($setup:tt)* } bench { $($bench:tt)* }) => {
        $b.iter_custom(|iters| {
            use std::sync::{Arc, Barrier};
            use std::time::{Duration, Instant};

            let core_ids = core_affinity::get_core_ids().unwrap();
            let num_cpus = core_ids.len();
            let start = &Arc::new(Barrier::new(num_cpus + 1));
            let stop = &Arc::new(Barrier::new(num_cpus + 1));
            let mut workers: Vec<_> = core_ids.into_iter().map(|core_id| {
                let (start, stop) = (start.clone(), stop.clone());
                std::thread::spawn(move || {
                    core_affinity::set_for_current(core_id);
                    $($setup)*
                    start.wait();
                    let start_time = Instant::now();
                    for _i in 0..iters {
                        $($bench)*
                    }
                    let stop_time = Instant::now();
                    stop.wait();
                    stop_time - start_time
                })
            }).collect();

            start.wait();
            stop.wait();

            let elapsed: Duration = workers.drain(..).map(|w| w.join().unwrap()).sum();

            elapsed / (num_cpus as u32)
        });
    }
}

/// Never finishes, so every bench iteration measures one steady-state poll.
pub struct SpinFuture;

impl Future for SpinFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// A scope with every detector off isolates the cost of the root wrapper
/// itself; no runtime is needed to poll it.
fn unmonitored() -> Config {
    Config::builder()
        .detect_tasks(false)
        .detect_threads(false)
        .detect_blocking(false)
        .build()
        .unwrap()
}

fn bench_poll_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("poll overhead");
    bench_poll_baseline(&mut group);
    bench_frame_outside_scope(&mut group);
    bench_scope_root(&mut group);
    bench_frame_inside_scope(&mut group);
    group.finish();
}

fn bench_poll_baseline<M: Measurement<Value = Duration>>(c: &mut BenchmarkGroup<'_, M>) {
    c.bench_function("poll (baseline)", move |b| {
        parbench! {
            b;
            setup {
                let waker = task::noop_waker();
                let mut cx = Context::from_waker(&waker);
                let mut future = Box::pin(SpinFuture);
            }
            bench {
                let _ = black_box(future.as_mut().poll(&mut cx));
            }
        }
    });
}

fn bench_frame_outside_scope<M: Measurement<Value = Duration>>(c: &mut BenchmarkGroup<'_, M>) {
    // No enclosing root, so the frame takes its disabled fast path.
    c.bench_function("poll frame (outside scope)", move |b| {
        parbench! {
            b;
            setup {
                let waker = task::noop_waker();
                let mut cx = Context::from_waker(&waker);
                let mut future = Box::pin(frame!(SpinFuture));
            }
            bench {
                let _ = black_box(future.as_mut().poll(&mut cx));
            }
        }
    });
}

fn bench_scope_root<M: Measurement<Value = Duration>>(c: &mut BenchmarkGroup<'_, M>) {
    c.bench_function("poll scope root", move |b| {
        parbench! {
            b;
            setup {
                let waker = task::noop_waker();
                let mut cx = Context::from_waker(&waker);
                let mut future = Box::pin(Scope::new(unmonitored()).run(SpinFuture));
            }
            bench {
                let _ = black_box(future.as_mut().poll(&mut cx));
            }
        }
    });
}

fn bench_frame_inside_scope<M: Measurement<Value = Duration>>(c: &mut BenchmarkGroup<'_, M>) {
    // Root bookkeeping plus one pushed frame per poll: the full price of
    // an instrumented await inside a monitored scope.
    c.bench_function("poll frame (inside scope)", move |b| {
        parbench! {
            b;
            setup {
                let waker = task::noop_waker();
                let mut cx = Context::from_waker(&waker);
                let mut future = Box::pin(Scope::new(unmonitored()).run(frame!(SpinFuture)));
            }
            bench {
                let _ = black_box(future.as_mut().poll(&mut cx));
            }
        }
    });
}

criterion_group!(benches, bench_poll_overhead);
criterion_main!(benches);
