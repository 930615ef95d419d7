//! Stage runner: the live actor executing one stage specification.
//!
//! Each runner owns one thread per input binding plus one compute thread.
//!
//! ```text
//!  input thread i:   gate ──► assimilate (binding read) ──► ready(i)
//!                     ▲                                        │
//!  compute thread:    └── re-gate ◄── publish ◄── evaluate ◄── wait all ready
//!                                                             (or deadline)
//! ```
//!
//! Input threads only read again after the compute thread has consumed their
//! previous value, so a slow upstream never delays the reads of the others.
//!
//! Shutdown is cooperative. Dropping the shutdown sender disconnects a
//! channel every select waits on; blocking buffer waits are released by the
//! engine closing its buffers.

use crate::pipeline::binding::Freshness;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::StageId;
use crate::pipeline::metrics::{CycleReport, MetricsCell, Phase, StageObserver};
use crate::pipeline::rate::RateLimiter;
use crate::pipeline::stage::{CycleContext, InputPort, PublishOutcome, StageBody, StageParts};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Lifecycle of a runner. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RunState {
    NotStarted,
    Running,
    Paused,
    Stopped,
}

impl RunState {
    pub fn label(self) -> &'static str {
        match self {
            RunState::NotStarted => "not started",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Stopped => "stopped",
        }
    }
}

/// Run state shared between the runner handle and its compute thread.
struct Control {
    state: Mutex<RunState>,
    changed: Condvar,
}

impl Control {
    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn get(&self) -> RunState {
        *self.lock()
    }

    fn is_stopped(&self) -> bool {
        self.get() == RunState::Stopped
    }

    /// Move `from` → `to`; returns false if the runner was in another state.
    fn transition(&self, from: RunState, to: RunState) -> bool {
        let mut state = self.lock();
        if *state != from {
            return false;
        }
        *state = to;
        drop(state);
        self.changed.notify_all();
        true
    }

    /// Block while paused. Returns false once stopped.
    fn wait_while_paused(&self) -> bool {
        let mut state = self.lock();
        while *state == RunState::Paused {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(|p| p.into_inner());
        }
        *state != RunState::Stopped
    }
}

type Observers = Arc<[Arc<dyn StageObserver>]>;

/// Handle to the threads executing one stage.
pub struct StageRunner {
    id: StageId,
    name: String,
    control: Arc<Control>,
    shutdown: Mutex<Option<Sender<()>>>,
    threads: Mutex<Vec<(String, JoinHandle<()>)>>,
    /// Disconnects once every runner thread has exited.
    exited: Receiver<()>,
    metrics: Arc<MetricsCell>,
    observers: Observers,
    disposed: AtomicBool,
}

impl StageRunner {
    /// Spawn the input and compute threads for `parts`.
    pub fn start(
        id: StageId,
        parts: StageParts,
        metrics: Arc<MetricsCell>,
        observers: Vec<Arc<dyn StageObserver>>,
    ) -> PipelineResult<Self> {
        let StageParts {
            name,
            ports,
            body,
            rate,
            input_timeout,
        } = parts;

        let control = Arc::new(Control {
            state: Mutex::new(RunState::Running),
            changed: Condvar::new(),
        });
        let observers: Observers = observers.into();
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let (exit_tx, exit_rx) = bounded::<()>(0);
        let (ready_tx, ready_rx) = unbounded::<(usize, Freshness)>();

        metrics.update(|m| m.set_state(RunState::Running));
        for observer in observers.iter() {
            observer.on_state_change(&name, RunState::Running);
        }

        let runner = Self {
            id,
            name: name.clone(),
            control: control.clone(),
            shutdown: Mutex::new(Some(shutdown_tx)),
            threads: Mutex::new(Vec::new()),
            exited: exit_rx,
            metrics: metrics.clone(),
            observers: observers.clone(),
            disposed: AtomicBool::new(false),
        };

        let mut gates = Vec::with_capacity(ports.len());
        for (index, port) in ports.into_iter().enumerate() {
            let (gate_tx, gate_rx) = bounded::<()>(1);
            gates.push(gate_tx);
            let thread_name = format!("{}/in{}:{}", name, index, port.source());
            let ctx = InputThread {
                stage: name.clone(),
                index,
                port,
                gate: gate_rx,
                ready: ready_tx.clone(),
                shutdown: shutdown_rx.clone(),
                _exit: exit_tx.clone(),
            };
            runner.spawn(thread_name, move || ctx.run())?;
        }
        drop(ready_tx);

        let compute = ComputeThread {
            name: name.clone(),
            body,
            rate,
            input_timeout,
            gates,
            ready: ready_rx,
            shutdown: shutdown_rx,
            control,
            metrics,
            observers,
            _exit: exit_tx,
        };
        runner.spawn(format!("{}/compute", name), move || compute.run())?;

        tracing::debug!("Stage '{}' started", runner.name);
        Ok(runner)
    }

    fn spawn(&self, thread_name: String, f: impl FnOnce() + Send + 'static) -> PipelineResult<()> {
        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(f)
            .map_err(|e| {
                self.stop();
                PipelineError::ThreadSpawn {
                    stage: self.name.clone(),
                    message: e.to_string(),
                }
            })?;
        self.threads
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((thread_name, handle));
        Ok(())
    }

    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RunState {
        self.control.get()
    }

    pub fn is_paused(&self) -> bool {
        self.state() == RunState::Paused
    }

    /// Pause before the next cycle. Returns false if not running.
    pub fn pause(&self) -> bool {
        let changed = self.control.transition(RunState::Running, RunState::Paused);
        if changed {
            self.notify_state(RunState::Paused);
        }
        changed
    }

    /// Resume a paused runner. Returns false if not paused.
    pub fn resume(&self) -> bool {
        let changed = self.control.transition(RunState::Paused, RunState::Running);
        if changed {
            self.notify_state(RunState::Running);
        }
        changed
    }

    fn notify_state(&self, state: RunState) {
        self.metrics.update(|m| m.set_state(state));
        for observer in self.observers.iter() {
            observer.on_state_change(&self.name, state);
        }
    }

    /// Signal every thread to exit without waiting for them.
    pub fn stop(&self) {
        let was = {
            let mut state = self.control.lock();
            std::mem::replace(&mut *state, RunState::Stopped)
        };
        self.control.changed.notify_all();
        // Disconnecting the shutdown channel nudges every select.
        self.shutdown
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if was != RunState::Stopped {
            self.notify_state(RunState::Stopped);
        }
    }

    /// Stop and join the threads, abandoning any still running after
    /// `grace`. Safe to call more than once.
    pub fn dispose(&self, grace: Duration) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop();

        let deadline = Instant::now() + grace;
        // Every thread holds an exit sender; disconnect means all are gone.
        let _ = self.exited.recv_deadline(deadline);

        let threads = std::mem::take(&mut *self.threads.lock().unwrap_or_else(|p| p.into_inner()));
        for (thread_name, handle) in threads {
            if handle.is_finished() {
                if handle.join().is_err() {
                    tracing::error!("Thread '{}' panicked", thread_name);
                }
            } else {
                tracing::warn!(
                    "Thread '{}' did not exit within {:?}; abandoning it",
                    thread_name,
                    grace
                );
            }
        }
        tracing::debug!("Stage '{}' disposed", self.name);
    }
}

impl Drop for StageRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

struct InputThread {
    stage: String,
    index: usize,
    port: Box<dyn InputPort>,
    gate: Receiver<()>,
    ready: Sender<(usize, Freshness)>,
    shutdown: Receiver<()>,
    _exit: Sender<()>,
}

impl InputThread {
    fn run(mut self) {
        loop {
            select! {
                recv(self.gate) -> msg => if msg.is_err() { break },
                recv(self.shutdown) -> _ => break,
            }
            match self.port.assimilate(&self.shutdown) {
                Ok(freshness) => {
                    if self.ready.send((self.index, freshness)).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        tracing::trace!(
            "Stage '{}' input {} ({}) exiting",
            self.stage,
            self.index,
            self.port.source()
        );
    }
}

struct ComputeThread {
    name: String,
    body: Box<dyn StageBody>,
    rate: Option<Box<dyn RateLimiter>>,
    input_timeout: Option<Duration>,
    gates: Vec<Sender<()>>,
    ready: Receiver<(usize, Freshness)>,
    shutdown: Receiver<()>,
    control: Arc<Control>,
    metrics: Arc<MetricsCell>,
    observers: Observers,
    _exit: Sender<()>,
}

/// Outcome of waiting for a cycle's inputs.
enum Assimilation {
    Complete,
    TimedOut,
    Shutdown,
}

impl ComputeThread {
    fn run(mut self) {
        let n = self.gates.len();
        let mut in_flight = vec![false; n];
        let mut completed: u64 = 0;

        loop {
            if !self.control.wait_while_paused() {
                break;
            }

            // Release every input whose previous value has been consumed.
            for (gate, flying) in self.gates.iter().zip(in_flight.iter_mut()) {
                if !*flying {
                    let _ = gate.try_send(());
                    *flying = true;
                }
            }

            let iteration_start = Instant::now();
            let mut freshness: Vec<Option<Freshness>> = vec![None; n];
            let punctual = match self.assimilate(&mut in_flight, &mut freshness) {
                Assimilation::Complete => true,
                Assimilation::TimedOut => false,
                Assimilation::Shutdown => break,
            };
            let assimilation = iteration_start.elapsed();
            self.phase(Phase::Assimilate, assimilation);

            let wait_start = Instant::now();
            if let Some(rate) = &mut self.rate {
                rate.synchronize();
            }
            let rate_wait = wait_start.elapsed();
            self.phase(Phase::RateWait, rate_wait);
            if self.control.is_stopped() {
                break;
            }

            let compute_start = Instant::now();
            self.metrics.update(|m| m.begin_compute());
            let ctx = CycleContext {
                stage: &self.name,
                cycle: completed,
                punctual,
                inputs: &freshness,
            };
            let body = &mut self.body;
            let result = catch_unwind(AssertUnwindSafe(|| body.compute(&ctx)));
            self.metrics.update(|m| m.end_compute());
            if result.is_err() {
                tracing::error!(
                    "Stage '{}' evaluator panicked on cycle {}; stage stops producing",
                    self.name,
                    completed
                );
                self.halt();
                break;
            }
            let compute = compute_start.elapsed();
            self.phase(Phase::Compute, compute);
            if self.control.is_stopped() {
                break;
            }

            let publish_start = Instant::now();
            let outcome = match self.body.publish(completed) {
                Ok(outcome) => outcome,
                Err(_) => break,
            };
            self.phase(Phase::Publish, publish_start.elapsed());
            if outcome == PublishOutcome::Skipped {
                self.metrics.update(|m| m.record_skipped_publish());
            }

            if outcome == PublishOutcome::Enqueued
                && self.body.awaits_release()
            {
                let release_start = Instant::now();
                if self.body.wait_release(&self.shutdown).is_err() {
                    break;
                }
                self.phase(Phase::Release, release_start.elapsed());
            }

            let report = CycleReport {
                cycle: completed,
                punctual,
                published: outcome.published(),
                assimilation,
                rate_wait,
                compute,
                iteration: iteration_start.elapsed(),
                inputs: freshness,
            };
            self.metrics.update(|m| m.record(&report));
            for observer in self.observers.iter() {
                observer.on_cycle(&self.name, &report);
            }
            completed += 1;
        }

        tracing::debug!("Stage '{}' compute loop exiting after {} cycles", self.name, completed);
    }

    /// Wait until every in-flight input reports ready, the aggregate
    /// deadline passes, or shutdown.
    fn assimilate(
        &self,
        in_flight: &mut [bool],
        freshness: &mut [Option<Freshness>],
    ) -> Assimilation {
        let deadline = self.input_timeout.map(|t| Instant::now() + t);
        while in_flight.iter().any(|f| *f) {
            let msg = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    select! {
                        recv(self.ready) -> msg => msg,
                        recv(self.shutdown) -> _ => return Assimilation::Shutdown,
                        default(remaining) => return Assimilation::TimedOut,
                    }
                }
                None => select! {
                    recv(self.ready) -> msg => msg,
                    recv(self.shutdown) -> _ => return Assimilation::Shutdown,
                },
            };
            match msg {
                Ok((index, fresh)) => {
                    in_flight[index] = false;
                    freshness[index] = Some(fresh);
                }
                // Every input thread is gone.
                Err(_) => return Assimilation::Shutdown,
            }
        }
        Assimilation::Complete
    }

    /// Mark the stage stopped from inside the compute thread.
    fn halt(&self) {
        let was = {
            let mut state = self.control.lock();
            std::mem::replace(&mut *state, RunState::Stopped)
        };
        self.control.changed.notify_all();
        if was != RunState::Stopped {
            self.metrics.update(|m| m.set_state(RunState::Stopped));
            for observer in self.observers.iter() {
                observer.on_state_change(&self.name, RunState::Stopped);
            }
        }
    }

    fn phase(&self, phase: Phase, elapsed: Duration) {
        for observer in self.observers.iter() {
            observer.on_phase(&self.name, phase, elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::binding::{Binding, ReadMode};
    use crate::pipeline::buffer::StageBuffer;
    use crate::pipeline::metrics::MetricsRegistry;
    use crate::pipeline::rate::MockRateLimiter;
    use crate::pipeline::stage::{StageDefinition, StageSpec};
    use std::sync::atomic::AtomicU64;

    fn start(spec: impl StageDefinition + 'static) -> (StageRunner, Arc<MetricsRegistry>) {
        let registry = Arc::new(MetricsRegistry::new(0.5));
        let cell = registry.register(spec.name());
        let parts = Box::new(spec).into_parts();
        let runner = StageRunner::start(StageId(0), parts, cell, Vec::new()).unwrap();
        (runner, registry)
    }

    #[test]
    fn test_source_to_consumer_in_order() {
        let input = Arc::new(StageBuffer::new("in", 2));
        let output = Arc::new(StageBuffer::new("out", 16));
        let spec = StageSpec::builder("inc")
            .inputs((Binding::on(&input).build().unwrap(),))
            .output(&output, false)
            .evaluate(|_, (x,): (u32,)| x + 1)
            .unwrap();
        let (runner, registry) = start(spec);

        for i in 0..10u32 {
            input.publish_enqueue(i).unwrap();
        }
        let seen: Vec<u32> = (0..10).map(|_| output.dequeue().unwrap()).collect();
        assert_eq!(seen, (1..=10).collect::<Vec<_>>());

        input.close();
        output.close();
        runner.dispose(Duration::from_secs(1));
        assert_eq!(runner.state(), RunState::Stopped);
        assert!(registry.get("inc").unwrap().completed >= 10);
    }

    #[test]
    fn test_pause_and_resume() {
        let output = Arc::new(StageBuffer::new("ticks", 1));
        let counter = Arc::new(AtomicU64::new(0));
        let spec = {
            let counter = counter.clone();
            StageSpec::builder("ticker")
                .output(&output, true)
                .rate_limiter(Box::new(crate::pipeline::rate::Deadline::new(
                    Duration::from_millis(2),
                )))
                .evaluate(move |_, ()| counter.fetch_add(1, Ordering::SeqCst))
                .unwrap()
        };
        let (runner, _registry) = start(spec);
        std::thread::sleep(Duration::from_millis(30));

        assert!(runner.pause());
        assert!(!runner.pause(), "already paused");
        std::thread::sleep(Duration::from_millis(20));
        let frozen = counter.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(40));
        // At most the cycle in flight when pausing completes.
        assert!(counter.load(Ordering::SeqCst) <= frozen + 1);

        assert!(runner.resume());
        std::thread::sleep(Duration::from_millis(40));
        assert!(counter.load(Ordering::SeqCst) > frozen + 1);

        runner.dispose(Duration::from_secs(1));
        runner.dispose(Duration::from_secs(1));
        assert!(!runner.resume());
    }

    #[test]
    fn test_input_timeout_marks_stall() {
        let slow = Arc::new(StageBuffer::<u32>::new("slow", 1));
        let spec = StageSpec::builder("watch")
            .inputs((Binding::on(&slow).build().unwrap(),))
            .input_timeout(Duration::from_millis(5))
            .rate_limiter(Box::new(crate::pipeline::rate::Deadline::new(
                Duration::from_millis(5),
            )))
            .evaluate(|ctx, (_v,): (u32,)| {
                assert!(!ctx.punctual);
            })
            .unwrap();
        let (runner, registry) = start(spec);
        std::thread::sleep(Duration::from_millis(60));

        let stats = registry.get("watch").unwrap();
        assert!(stats.completed > 0);
        assert_eq!(stats.stalls, stats.completed);

        slow.close();
        runner.dispose(Duration::from_secs(1));
    }

    #[test]
    fn test_rate_limiter_called_every_cycle() {
        let calls = Arc::new(AtomicU64::new(0));
        let mut limiter = MockRateLimiter::new();
        {
            let calls = calls.clone();
            limiter.expect_synchronize().returning(move || {
                calls.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(1));
            });
        }
        limiter
            .expect_target_interval()
            .return_const(Duration::from_millis(1));

        let cycles = Arc::new(AtomicU64::new(0));
        let spec = {
            let cycles = cycles.clone();
            StageSpec::builder("paced")
                .rate_limiter(Box::new(limiter))
                .evaluate(move |_, ()| {
                    cycles.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
        };
        let (runner, _registry) = start(spec);
        std::thread::sleep(Duration::from_millis(30));
        runner.dispose(Duration::from_secs(1));

        let cycles = cycles.load(Ordering::SeqCst);
        let calls = calls.load(Ordering::SeqCst);
        assert!(cycles > 0);
        // The limiter runs before every evaluation.
        assert!(calls >= cycles);
    }

    #[test]
    fn test_output_subsampling() {
        let output = Arc::new(StageBuffer::new("sub", 64));
        let mut n = 0u64;
        let spec = StageSpec::builder("counter")
            .output(&output, false)
            .output_every_skip(2)
            .evaluate(move |_, ()| {
                n += 1;
                n
            })
            .unwrap();
        let (runner, _registry) = start(spec);
        let seen: Vec<u64> = (0..4).map(|_| output.dequeue().unwrap()).collect();
        output.close();
        runner.dispose(Duration::from_secs(1));
        assert_eq!(seen, vec![1, 4, 7, 10]);
    }

    #[test]
    fn test_await_release_lockstep() {
        let output = Arc::new(StageBuffer::new("lockstep", 4));
        let mut n = 0u32;
        let spec = StageSpec::builder("producer")
            .output(&output, false)
            .await_release(true)
            .evaluate(move |_, ()| {
                n += 1;
                n
            })
            .unwrap();
        let (runner, _registry) = start(spec);
        std::thread::sleep(Duration::from_millis(30));
        // Without a consumer the producer parks after its first enqueue.
        assert_eq!(output.queue_len(), 1);
        assert_eq!(output.dequeue().unwrap(), 1);
        assert_eq!(output.dequeue().unwrap(), 2);

        output.close();
        runner.dispose(Duration::from_secs(1));
    }

    #[test]
    fn test_evaluator_panic_stops_stage() {
        let output = Arc::new(StageBuffer::<u32>::new("never", 1));
        let spec = StageSpec::builder("faulty")
            .output(&output, true)
            .evaluate(|_, ()| -> u32 { panic!("evaluator failure") })
            .unwrap();
        let (runner, registry) = start(spec);

        let deadline = Instant::now() + Duration::from_secs(2);
        while runner.state() != RunState::Stopped && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(runner.state(), RunState::Stopped);
        let stats = registry.get("faulty").unwrap();
        assert_eq!(stats.state, "stopped");
        assert_eq!(stats.completed, 0);
        assert!(!stats.is_computing);
        assert_eq!(output.current(), None);

        // A stopped runner cannot be paused or resumed.
        assert!(!runner.pause());
        assert!(!runner.resume());
        runner.dispose(Duration::from_secs(1));
    }

    #[test]
    fn test_dispose_unblocks_on_publish_reader() {
        let source = Arc::new(StageBuffer::<u32>::new("quiet", 1));
        let spec = StageSpec::builder("listener")
            .inputs((Binding::on(&source).mode(ReadMode::OnPublish).build().unwrap(),))
            .evaluate(|_, (_v,): (u32,)| ())
            .unwrap();
        let (runner, _registry) = start(spec);
        std::thread::sleep(Duration::from_millis(10));

        let start = Instant::now();
        runner.dispose(Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(runner.threads.lock().unwrap().is_empty());
    }
}
