//! Fixed-tickrate cooperative scheduler.
//!
//! Converts variable frame deltas into a fixed simulation tickrate. Every
//! frame fires three phases in order:
//!
//! 1. early-update, once per frame with the raw frame delta
//! 2. fixed-tick, once per whole tickrate accumulated (possibly several
//!    times after a long frame, possibly zero times)
//! 3. late-update, once per frame, after the fixed ticks
//!
//! Nothing fires while the scheduler is stopped. Tasks can suspend until N
//! fixed ticks have elapsed with [`Lifecycle::wait_ticks`]; destroying the
//! scheduler cancels those waits and aborts any task it spawned.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    sync::oneshot::{self, error::TryRecvError},
    task::JoinSet,
    time::Instant,
};
use tracing::{trace, warn};

use crate::signal::{Connection, Signal};

/// Upper bound on fixed ticks fired in one frame. Time beyond this is
/// dropped so a long stall cannot snowball into ever longer frames.
pub const MAX_CATCHUP_TICKS: u32 = 8;

/// Scheduler errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("scheduler was destroyed before the wait completed")]
    Cancelled,
}

/// Payload of the fixed-tick phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedTick {
    /// Tick number, starting at 1.
    pub tick: u64,
    /// Seconds per tick.
    pub dt: f64,
}

/// Receives the three phases in order. The owning system implements this;
/// everything else subscribes through the phase signals.
pub trait TickHandler {
    fn early_update(&mut self, _dt: f64) {}
    fn fixed_tick(&mut self, _tick: FixedTick) {}
    fn late_update(&mut self, _dt: f64) {}
}

impl TickHandler for () {}

/// The scheduler.
pub struct Lifecycle {
    tickrate: f64,
    accumulator: f64,
    running: bool,
    destroyed: bool,
    tick: u64,

    early: Signal<f64>,
    fixed: Signal<FixedTick>,
    late: Signal<f64>,

    waiters: Vec<(u64, oneshot::Sender<()>)>,
    tasks: JoinSet<()>,
}

impl Lifecycle {
    /// Creates a stopped scheduler ticking `tick_hz` times per second.
    pub fn new(tick_hz: u32) -> Self {
        Self::with_tickrate(1.0 / tick_hz.max(1) as f64)
    }

    /// Creates a stopped scheduler with an explicit seconds-per-tick.
    pub fn with_tickrate(tickrate: f64) -> Self {
        Self {
            tickrate,
            accumulator: 0.0,
            running: false,
            destroyed: false,
            tick: 0,
            early: Signal::new("early_update"),
            fixed: Signal::new("fixed_tick"),
            late: Signal::new("late_update"),
            waiters: Vec::new(),
            tasks: JoinSet::new(),
        }
    }

    pub fn start(&mut self) {
        if self.destroyed {
            warn!("Ignoring start on a destroyed scheduler");
            return;
        }
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Seconds per fixed tick.
    pub fn tickrate(&self) -> f64 {
        self.tickrate
    }

    /// Number of fixed ticks fired so far.
    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    /// Fraction of the next tick already accumulated, in `[0, 1)`.
    pub fn alpha(&self) -> f64 {
        self.accumulator / self.tickrate
    }

    pub fn on_early_update<F>(&self, f: F) -> Connection
    where
        F: Fn(f64) + Send + Sync + 'static,
    {
        self.early.connect(f)
    }

    pub fn on_fixed_tick<F>(&self, f: F) -> Connection
    where
        F: Fn(FixedTick) + Send + Sync + 'static,
    {
        self.fixed.connect(f)
    }

    pub fn on_late_update<F>(&self, f: F) -> Connection
    where
        F: Fn(f64) + Send + Sync + 'static,
    {
        self.late.connect(f)
    }

    /// Advances one host frame by `dt` seconds and returns how many fixed
    /// ticks fired.
    pub fn step(&mut self, dt: f64, handler: &mut impl TickHandler) -> u32 {
        if !self.running {
            return 0;
        }
        let dt = if dt.is_finite() && dt >= 0.0 {
            dt
        } else {
            warn!(dt, "Ignoring invalid frame delta");
            0.0
        };

        handler.early_update(dt);
        self.early.fire(dt);

        self.accumulator += dt;
        let mut fired = 0;
        while self.accumulator >= self.tickrate {
            if fired == MAX_CATCHUP_TICKS {
                let dropped = self.accumulator - self.accumulator % self.tickrate;
                warn!(dropped_secs = dropped, "Fixed tick catch-up limit reached");
                self.accumulator %= self.tickrate;
                break;
            }
            self.accumulator -= self.tickrate;
            self.tick += 1;
            fired += 1;

            let tick = FixedTick {
                tick: self.tick,
                dt: self.tickrate,
            };
            handler.fixed_tick(tick);
            self.fixed.fire(tick);
            self.resume_waiters();
        }

        handler.late_update(dt);
        self.late.fire(dt);

        while self.tasks.try_join_next().is_some() {}
        fired
    }

    fn resume_waiters(&mut self) {
        let now = self.tick;
        let mut i = 0;
        while i < self.waiters.len() {
            if self.waiters[i].0 <= now {
                let (_, tx) = self.waiters.swap_remove(i);
                let _ = tx.send(());
            } else {
                i += 1;
            }
        }
    }

    /// Returns a future that completes once `ticks` more fixed ticks have
    /// fired, or fails with [`LifecycleError::Cancelled`] if the scheduler is
    /// destroyed first.
    pub fn wait_ticks(&mut self, ticks: u64) -> TickWait {
        let (tx, rx) = oneshot::channel();
        if self.destroyed {
            drop(tx);
        } else if ticks == 0 {
            let _ = tx.send(());
        } else {
            self.waiters.push((self.tick + ticks, tx));
        }
        TickWait { rx }
    }

    /// Number of tasks currently suspended in [`Lifecycle::wait_ticks`].
    pub fn pending_waits(&self) -> usize {
        self.waiters.len()
    }

    /// Spawns a cooperative task owned by this scheduler. It is aborted when
    /// the scheduler is destroyed. Must be called within a tokio runtime.
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.destroyed {
            warn!("Refusing to spawn a task on a destroyed scheduler");
            return;
        }
        self.tasks.spawn(task);
    }

    /// Stops every phase, clears every registration, cancels suspended waits
    /// and aborts owned tasks. Safe to call more than once.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.running = false;
        self.destroyed = true;
        self.early.clear();
        self.fixed.clear();
        self.late.clear();
        let cancelled = self.waiters.len();
        self.waiters.clear();
        self.tasks.abort_all();
        trace!(cancelled, "Scheduler destroyed");
    }

    /// Drives the scheduler from the wall clock for `frames` frames spaced
    /// `frame` apart.
    pub async fn run_for_frames(
        &mut self,
        frame: Duration,
        frames: u32,
        handler: &mut impl TickHandler,
    ) {
        let mut last = Instant::now();
        let mut next = last;
        for _ in 0..frames {
            next += frame;
            tokio::time::sleep_until(next).await;
            let now = Instant::now();
            self.step(now.duration_since(last).as_secs_f64(), handler);
            last = now;
        }
    }
}

/// Future returned by [`Lifecycle::wait_ticks`].
#[derive(Debug)]
pub struct TickWait {
    rx: oneshot::Receiver<()>,
}

impl TickWait {
    /// Non-blocking check: `None` while still waiting.
    pub fn try_ready(&mut self) -> Option<Result<(), LifecycleError>> {
        match self.rx.try_recv() {
            Ok(()) => Some(Ok(())),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(LifecycleError::Cancelled)),
        }
    }
}

impl Future for TickWait {
    type Output = Result<(), LifecycleError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| LifecycleError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    #[derive(Default)]
    struct Recorder {
        log: Vec<&'static str>,
    }

    impl TickHandler for Recorder {
        fn early_update(&mut self, _dt: f64) {
            self.log.push("early");
        }
        fn fixed_tick(&mut self, _tick: FixedTick) {
            self.log.push("fixed");
        }
        fn late_update(&mut self, _dt: f64) {
            self.log.push("late");
        }
    }

    #[test]
    fn long_frame_fires_whole_ticks_and_carries_remainder() {
        let mut lc = Lifecycle::with_tickrate(0.25);
        lc.start();
        let mut rec = Recorder::default();

        assert_eq!(lc.step(0.625, &mut rec), 2);
        assert_eq!(rec.log, vec!["early", "fixed", "fixed", "late"]);
        assert_eq!(lc.alpha(), 0.5);

        // The carried half tick completes with the next half.
        assert_eq!(lc.step(0.125, &mut rec), 1);
        assert_eq!(lc.tick_count(), 3);
    }

    #[test]
    fn stopped_scheduler_fires_nothing() {
        let mut lc = Lifecycle::with_tickrate(0.25);
        let mut rec = Recorder::default();
        assert_eq!(lc.step(1.0, &mut rec), 0);
        assert!(rec.log.is_empty());
    }

    #[test]
    fn catch_up_is_bounded() {
        let mut lc = Lifecycle::with_tickrate(0.25);
        lc.start();
        assert_eq!(lc.step(100.0, &mut ()), MAX_CATCHUP_TICKS);
        assert!(lc.alpha() < 1.0);
    }

    #[test]
    fn phase_signals_fire_and_unsubscribe() {
        let mut lc = Lifecycle::with_tickrate(0.25);
        lc.start();
        let ticks = Arc::new(AtomicU32::new(0));
        let t = ticks.clone();
        let conn = lc.on_fixed_tick(move |_| {
            t.fetch_add(1, Ordering::SeqCst);
        });
        lc.step(0.5, &mut ());
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        conn.disconnect();
        lc.step(0.5, &mut ());
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn wait_ticks_resumes_after_target() {
        let mut lc = Lifecycle::with_tickrate(0.25);
        lc.start();
        let mut wait = lc.wait_ticks(2);
        lc.step(0.25, &mut ());
        assert!(wait.try_ready().is_none());
        lc.step(0.25, &mut ());
        assert_eq!(wait.try_ready(), Some(Ok(())));
        assert_eq!(lc.pending_waits(), 0);
    }

    #[tokio::test]
    async fn destroy_cancels_waits_and_tasks() {
        let mut lc = Lifecycle::with_tickrate(0.25);
        lc.start();
        let wait = lc.wait_ticks(5);

        let token = Arc::new(());
        let held = token.clone();
        lc.spawn(async move {
            let _held = held;
            std::future::pending::<()>().await;
        });

        lc.destroy();
        assert_eq!(wait.await, Err(LifecycleError::Cancelled));
        tokio::time::timeout(Duration::from_secs(1), async {
            while Arc::strong_count(&token) > 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("aborted task should drop its state");

        assert_eq!(lc.step(1.0, &mut ()), 0);
        assert_eq!(
            lc.wait_ticks(1).try_ready(),
            Some(Err(LifecycleError::Cancelled))
        );
    }
}
