//! Consumption bindings: declarative read policies attaching one stage input
//! to one upstream buffer.
//!
//! A [`Binding`] is immutable once built. The per-thread mutable part
//! (last captured value, reuse counters, refresh listener) lives in a
//! [`BindingCursor`], owned by the input thread that assimilates the input.
//!
//! | Mode         | Blocks                         | Buffer effect        |
//! |--------------|--------------------------------|----------------------|
//! | `Consume`    | until an item (or timeout)     | dequeues one item    |
//! | `OnPublish`  | until the next publish         | reads `current`      |
//! | `ReadLatest` | only before the first publish  | reads `current`      |
//! | `ReadDirty`  | never                          | reads `current`/default |

use crate::pipeline::buffer::{Payload, Signal, StageBuffer};
use crate::pipeline::error::{Closed, PipelineError, PipelineResult};
use crossbeam_channel::{Receiver, Select};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Read semantics a binding applies to its upstream buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// See every value exactly once, in order.
    #[default]
    Consume,
    /// Wake on each publish and take the freshest value.
    OnPublish,
    /// Take whatever is newest.
    ReadLatest,
    /// Never block; may return a default.
    ReadDirty,
}

impl ReadMode {
    pub fn label(self) -> &'static str {
        match self {
            ReadMode::Consume => "consume",
            ReadMode::OnPublish => "on_publish",
            ReadMode::ReadLatest => "read_latest",
            ReadMode::ReadDirty => "read_dirty",
        }
    }
}

/// How a captured value was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Read from the buffer this cycle.
    Fresh,
    /// Served from the previous capture because of `reuse_count`.
    Reused,
    /// Previous capture served after a timeout.
    Stale,
    /// Nothing usable was available; the payload default was served.
    Missing,
}

/// A value handed to the compute thread, tagged with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Captured<T> {
    pub value: T,
    pub freshness: Freshness,
}

impl<T> Captured<T> {
    fn new(value: T, freshness: Freshness) -> Self {
        Self { value, freshness }
    }

    pub fn is_fresh(&self) -> bool {
        self.freshness == Freshness::Fresh
    }
}

/// Immutable read policy against one buffer.
pub struct Binding<T> {
    buffer: Arc<StageBuffer<T>>,
    mode: ReadMode,
    timeout: Option<Duration>,
    allow_stale_on_timeout: bool,
    reuse_count: u32,
    reuse_tolerance: Option<u32>,
}

impl<T> Clone for Binding<T> {
    fn clone(&self) -> Self {
        Self {
            buffer: self.buffer.clone(),
            mode: self.mode,
            timeout: self.timeout,
            allow_stale_on_timeout: self.allow_stale_on_timeout,
            reuse_count: self.reuse_count,
            reuse_tolerance: self.reuse_tolerance,
        }
    }
}

impl<T: Payload> Binding<T> {
    /// Start building a binding against `buffer`.
    pub fn on(buffer: &Arc<StageBuffer<T>>) -> BindingBuilder<T> {
        BindingBuilder::new(buffer.clone())
    }

    pub fn buffer(&self) -> &Arc<StageBuffer<T>> {
        &self.buffer
    }

    pub fn buffer_name(&self) -> &str {
        self.buffer.name()
    }

    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn allow_stale_on_timeout(&self) -> bool {
        self.allow_stale_on_timeout
    }

    pub fn reuse_count(&self) -> u32 {
        self.reuse_count
    }

    pub fn reuse_tolerance(&self) -> Option<u32> {
        self.reuse_tolerance
    }
}

/// Validating builder for [`Binding`].
///
/// Counts and timeouts are taken as signed integers so values coming from
/// configuration files can be rejected instead of wrapped.
pub struct BindingBuilder<T> {
    buffer: Arc<StageBuffer<T>>,
    mode: ReadMode,
    timeout: Option<Duration>,
    timeout_ms: Option<i64>,
    allow_stale_on_timeout: bool,
    reuse_count: Option<i64>,
    reuse_tolerance: Option<i64>,
}

impl<T: Payload> BindingBuilder<T> {
    fn new(buffer: Arc<StageBuffer<T>>) -> Self {
        Self {
            buffer,
            mode: ReadMode::Consume,
            timeout: None,
            timeout_ms: None,
            allow_stale_on_timeout: false,
            reuse_count: None,
            reuse_tolerance: None,
        }
    }

    pub fn mode(mut self, mode: ReadMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self.timeout_ms = None;
        self
    }

    /// Timeout in milliseconds; negative values fail at `build`.
    pub fn timeout_ms(mut self, millis: i64) -> Self {
        self.timeout_ms = Some(millis);
        self.timeout = None;
        self
    }

    pub fn allow_stale_on_timeout(mut self, allow: bool) -> Self {
        self.allow_stale_on_timeout = allow;
        self
    }

    /// Reuse the captured value for `count` cycles between reads.
    pub fn reuse_count(mut self, count: i64) -> Self {
        self.reuse_count = Some(count);
        self
    }

    /// Maximum consecutive reused/stale cycles before a real read is forced.
    pub fn reuse_tolerance(mut self, tolerance: i64) -> Self {
        self.reuse_tolerance = Some(tolerance);
        self
    }

    pub fn build(self) -> PipelineResult<Binding<T>> {
        let buffer_name = self.buffer.name().to_string();

        let timeout = match self.timeout_ms {
            Some(millis) if millis < 0 => {
                return Err(PipelineError::InvalidTimeout {
                    context: format!("Binding on '{}'", buffer_name),
                    millis,
                })
            }
            Some(millis) => Some(Duration::from_millis(millis as u64)),
            None => self.timeout,
        };

        let reuse_count = match self.reuse_count {
            Some(count) if count <= 0 || count > u32::MAX as i64 => {
                return Err(PipelineError::InvalidReuseCount { buffer: buffer_name, count })
            }
            Some(count) => count as u32,
            None => 0,
        };

        let reuse_tolerance = match self.reuse_tolerance {
            Some(tolerance) if tolerance <= 0 || tolerance > u32::MAX as i64 => {
                return Err(PipelineError::InvalidReuseTolerance {
                    buffer: buffer_name,
                    tolerance,
                })
            }
            Some(tolerance) => Some(tolerance as u32),
            None => None,
        };

        if self.allow_stale_on_timeout && timeout.is_none() {
            tracing::debug!(
                "Binding on '{}' allows stale reads but has no timeout; flag has no effect",
                buffer_name
            );
        }

        Ok(Binding {
            buffer: self.buffer,
            mode: self.mode,
            timeout,
            allow_stale_on_timeout: self.allow_stale_on_timeout,
            reuse_count,
            reuse_tolerance,
        })
    }
}

/// Per-thread read state for one binding.
pub struct BindingCursor<T> {
    binding: Binding<T>,
    refresh: Option<Signal>,
    last: Option<T>,
    reuses_left: u32,
    consecutive_reuses: u32,
}

impl<T: Payload> BindingCursor<T> {
    /// Create the cursor. `OnPublish` bindings register their refresh
    /// listener here, so only publishes after this point wake the reader.
    pub fn new(binding: Binding<T>) -> Self {
        let refresh = (binding.mode == ReadMode::OnPublish)
            .then(|| binding.buffer.add_refresh_listener());
        Self {
            binding,
            refresh,
            last: None,
            reuses_left: 0,
            consecutive_reuses: 0,
        }
    }

    pub fn binding(&self) -> &Binding<T> {
        &self.binding
    }

    fn within_tolerance(&self) -> bool {
        self.binding
            .reuse_tolerance
            .map_or(true, |tolerance| self.consecutive_reuses < tolerance)
    }

    /// Produce the value for the next cycle.
    ///
    /// `shutdown` is a channel that disconnects when the owning runner stops;
    /// it interrupts waits on refresh signals. Buffer waits are interrupted by
    /// closing the buffer.
    pub fn next(&mut self, shutdown: &Receiver<()>) -> Result<Captured<T>, Closed> {
        if let Some(last) = &self.last {
            if self.reuses_left > 0 && self.within_tolerance() {
                self.reuses_left -= 1;
                self.consecutive_reuses += 1;
                return Ok(Captured::new(last.clone(), Freshness::Reused));
            }
        }

        let forced = !self.within_tolerance();
        let captured = self.read(forced, shutdown)?;
        match captured.freshness {
            Freshness::Fresh => {
                self.consecutive_reuses = 0;
                self.reuses_left = self.binding.reuse_count;
                self.last = Some(captured.value.clone());
            }
            Freshness::Stale | Freshness::Missing => {
                self.consecutive_reuses += 1;
            }
            Freshness::Reused => {}
        }
        Ok(captured)
    }

    fn read(&mut self, forced: bool, shutdown: &Receiver<()>) -> Result<Captured<T>, Closed> {
        let timeout = if forced { None } else { self.binding.timeout };
        let buffer = &self.binding.buffer;

        match self.binding.mode {
            ReadMode::Consume => match timeout {
                None => buffer.dequeue().map(|v| Captured::new(v, Freshness::Fresh)),
                Some(timeout) => match buffer.try_dequeue(timeout)? {
                    Some(v) => Ok(Captured::new(v, Freshness::Fresh)),
                    None => Ok(self.degrade()),
                },
            },
            ReadMode::OnPublish => {
                let Some(refresh) = &self.refresh else {
                    return Err(Closed);
                };
                if wait_signal(refresh, shutdown, timeout)? {
                    Ok(match buffer.current() {
                        Some(v) => Captured::new(v, Freshness::Fresh),
                        None => Captured::new(T::default(), Freshness::Missing),
                    })
                } else {
                    Ok(self.degrade())
                }
            }
            ReadMode::ReadLatest => match timeout {
                None => buffer.peek().map(|v| Captured::new(v, Freshness::Fresh)),
                Some(timeout) => match buffer.try_peek(timeout)? {
                    Some(v) => Ok(Captured::new(v, Freshness::Fresh)),
                    None => Ok(self.degrade()),
                },
            },
            ReadMode::ReadDirty => {
                if buffer.is_closed() {
                    return Err(Closed);
                }
                Ok(match buffer.current() {
                    Some(v) => Captured::new(v, Freshness::Fresh),
                    None => Captured::new(T::default(), Freshness::Missing),
                })
            }
        }
    }

    /// Timed-out read: previous capture if allowed, otherwise the default.
    fn degrade(&self) -> Captured<T> {
        match (&self.last, self.binding.allow_stale_on_timeout) {
            (Some(last), true) => Captured::new(last.clone(), Freshness::Stale),
            _ => Captured::new(T::default(), Freshness::Missing),
        }
    }
}

/// Wait for a refresh signal. `Ok(false)` means the timeout elapsed.
fn wait_signal(
    signal: &Signal,
    shutdown: &Receiver<()>,
    timeout: Option<Duration>,
) -> Result<bool, Closed> {
    let mut sel = Select::new();
    let signal_idx = sel.recv(signal);
    let shutdown_idx = sel.recv(shutdown);

    let op = match timeout {
        Some(timeout) => match sel.select_deadline(Instant::now() + timeout) {
            Ok(op) => op,
            Err(_) => return Ok(false),
        },
        None => sel.select(),
    };

    let idx = op.index();
    if idx == signal_idx {
        op.recv(signal).map(|_| true).map_err(|_| Closed)
    } else {
        debug_assert_eq!(idx, shutdown_idx);
        let _ = op.recv(shutdown);
        Err(Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{bounded, Sender};
    use std::thread;

    fn shutdown_pair() -> (Sender<()>, Receiver<()>) {
        bounded(0)
    }

    #[test]
    fn test_builder_rejects_bad_values() {
        let buf = Arc::new(StageBuffer::<u32>::new("b", 1));
        assert!(matches!(
            Binding::on(&buf).reuse_count(0).build(),
            Err(PipelineError::InvalidReuseCount { count: 0, .. })
        ));
        assert!(matches!(
            Binding::on(&buf).reuse_tolerance(-3).build(),
            Err(PipelineError::InvalidReuseTolerance { tolerance: -3, .. })
        ));
        assert!(matches!(
            Binding::on(&buf).timeout_ms(-1).build(),
            Err(PipelineError::InvalidTimeout { millis: -1, .. })
        ));

        let ok = Binding::on(&buf)
            .mode(ReadMode::OnPublish)
            .timeout_ms(25)
            .reuse_count(2)
            .build()
            .unwrap();
        assert_eq!(ok.timeout(), Some(Duration::from_millis(25)));
        assert_eq!(ok.reuse_count(), 2);
        assert_eq!(ok.mode(), ReadMode::OnPublish);
    }

    #[test]
    fn test_consume_reads_in_order() {
        let (_tx, shutdown) = shutdown_pair();
        let buf = Arc::new(StageBuffer::new("b", 8));
        for i in 0..5u32 {
            buf.publish_enqueue(i).unwrap();
        }
        let mut cursor = BindingCursor::new(Binding::on(&buf).build().unwrap());
        let seen: Vec<u32> = (0..5).map(|_| cursor.next(&shutdown).unwrap().value).collect();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_reuse_count_pattern() {
        let (_tx, shutdown) = shutdown_pair();
        let buf = Arc::new(StageBuffer::new("b", 1));
        buf.publish_overwrite(1u32).unwrap();
        let binding = Binding::on(&buf)
            .mode(ReadMode::ReadLatest)
            .reuse_count(2)
            .build()
            .unwrap();
        let mut cursor = BindingCursor::new(binding);

        let pattern: Vec<Freshness> = (0..6)
            .map(|_| cursor.next(&shutdown).unwrap().freshness)
            .collect();
        assert_eq!(
            pattern,
            vec![
                Freshness::Fresh,
                Freshness::Reused,
                Freshness::Reused,
                Freshness::Fresh,
                Freshness::Reused,
                Freshness::Reused,
            ]
        );
    }

    #[test]
    fn test_reuse_tolerance_caps_reuse() {
        let (_tx, shutdown) = shutdown_pair();
        let buf = Arc::new(StageBuffer::new("b", 1));
        buf.publish_overwrite(1u32).unwrap();
        let binding = Binding::on(&buf)
            .mode(ReadMode::ReadLatest)
            .reuse_count(5)
            .reuse_tolerance(1)
            .build()
            .unwrap();
        let mut cursor = BindingCursor::new(binding);

        let pattern: Vec<Freshness> = (0..4)
            .map(|_| cursor.next(&shutdown).unwrap().freshness)
            .collect();
        assert_eq!(
            pattern,
            vec![Freshness::Fresh, Freshness::Reused, Freshness::Fresh, Freshness::Reused]
        );
    }

    #[test]
    fn test_consume_timeout_serves_stale_value() {
        let (_tx, shutdown) = shutdown_pair();
        let buf = Arc::new(StageBuffer::new("b", 2));
        buf.publish_enqueue(42u32).unwrap();
        let binding = Binding::on(&buf)
            .timeout(Duration::from_millis(10))
            .allow_stale_on_timeout(true)
            .build()
            .unwrap();
        let mut cursor = BindingCursor::new(binding);

        assert_eq!(cursor.next(&shutdown).unwrap(), Captured::new(42, Freshness::Fresh));
        assert_eq!(cursor.next(&shutdown).unwrap(), Captured::new(42, Freshness::Stale));
    }

    #[test]
    fn test_consume_timeout_without_stale_serves_default() {
        let (_tx, shutdown) = shutdown_pair();
        let buf = Arc::new(StageBuffer::new("b", 2));
        buf.publish_enqueue(42u32).unwrap();
        let binding = Binding::on(&buf).timeout(Duration::from_millis(10)).build().unwrap();
        let mut cursor = BindingCursor::new(binding);

        cursor.next(&shutdown).unwrap();
        assert_eq!(cursor.next(&shutdown).unwrap(), Captured::new(0, Freshness::Missing));
    }

    #[test]
    fn test_tolerance_forces_blocking_read_after_stale_streak() {
        let (_tx, shutdown) = shutdown_pair();
        let buf = Arc::new(StageBuffer::new("b", 2));
        buf.publish_enqueue(1u32).unwrap();
        let binding = Binding::on(&buf)
            .timeout(Duration::from_millis(5))
            .allow_stale_on_timeout(true)
            .reuse_tolerance(1)
            .build()
            .unwrap();
        let mut cursor = BindingCursor::new(binding);
        assert!(cursor.next(&shutdown).unwrap().is_fresh());
        assert_eq!(cursor.next(&shutdown).unwrap().freshness, Freshness::Stale);

        let producer = {
            let buf = buf.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(40));
                buf.publish_enqueue(2).unwrap();
            })
        };
        // Tolerance reached: this read ignores the timeout and blocks.
        assert_eq!(cursor.next(&shutdown).unwrap(), Captured::new(2, Freshness::Fresh));
        producer.join().unwrap();
    }

    #[test]
    fn test_on_publish_waits_for_first_publish() {
        let (_tx, shutdown) = shutdown_pair();
        let buf = Arc::new(StageBuffer::new("b", 1));
        let mut cursor =
            BindingCursor::new(Binding::on(&buf).mode(ReadMode::OnPublish).build().unwrap());

        let producer = {
            let buf = buf.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                buf.publish_enqueue(5u32).unwrap();
            })
        };
        assert_eq!(cursor.next(&shutdown).unwrap(), Captured::new(5, Freshness::Fresh));
        producer.join().unwrap();
        // Non-destructive.
        assert_eq!(buf.queue_len(), 1);
    }

    #[test]
    fn test_on_publish_interrupted_by_shutdown() {
        let (tx, shutdown) = shutdown_pair();
        let buf = Arc::new(StageBuffer::<u32>::new("b", 1));
        let mut cursor =
            BindingCursor::new(Binding::on(&buf).mode(ReadMode::OnPublish).build().unwrap());
        let waiter = thread::spawn(move || cursor.next(&shutdown));
        thread::sleep(Duration::from_millis(10));
        drop(tx);
        assert_eq!(waiter.join().unwrap(), Err(Closed));
    }

    #[test]
    fn test_read_dirty_never_blocks() {
        let (_tx, shutdown) = shutdown_pair();
        let buf = Arc::new(StageBuffer::<u32>::new("b", 1));
        let mut cursor =
            BindingCursor::new(Binding::on(&buf).mode(ReadMode::ReadDirty).build().unwrap());
        assert_eq!(cursor.next(&shutdown).unwrap(), Captured::new(0, Freshness::Missing));
        buf.publish_overwrite(3).unwrap();
        assert_eq!(cursor.next(&shutdown).unwrap(), Captured::new(3, Freshness::Fresh));
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_reuse_count_reads_every_k_plus_one_cycles(k in 1i64..6, cycles in 1usize..40) {
            let (_tx, shutdown) = shutdown_pair();
            let buf = Arc::new(StageBuffer::new("b", 1));
            buf.publish_overwrite(1u32).unwrap();
            let binding = Binding::on(&buf)
                .mode(ReadMode::ReadLatest)
                .reuse_count(k)
                .build()
                .unwrap();
            let mut cursor = BindingCursor::new(binding);

            for cycle in 0..cycles {
                let fresh = cursor.next(&shutdown).unwrap().is_fresh();
                prop_assert_eq!(fresh, cycle % (k as usize + 1) == 0, "cycle {}", cycle);
            }
        }
    }
}
