//! Stage specifications: what a pipeline node computes, where it reads and
//! where it publishes.
//!
//! Inputs are a tuple of [`Binding`]s. The [`InputSet`] trait turns that
//! tuple into one type-erased [`InputPort`] per binding (each driven by its
//! own input thread) plus a typed set of slots the compute thread assembles
//! into the evaluator's argument tuple. Arity and payload types are therefore
//! checked when the topology is built, not on every call.

use crate::pipeline::binding::{Binding, BindingCursor, Captured, Freshness};
use crate::pipeline::buffer::{BufferControl, Payload, Signal, StageBuffer};
use crate::pipeline::error::{Closed, PipelineError, PipelineResult};
use crate::pipeline::rate::RateLimiter;
use crossbeam_channel::{select, Receiver};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Per-cycle information passed to evaluators.
#[derive(Debug, Clone, Copy)]
pub struct CycleContext<'a> {
    pub stage: &'a str,
    /// Number of cycles completed before this one.
    pub cycle: u64,
    /// False when the aggregate input timeout elapsed.
    pub punctual: bool,
    /// Provenance of each input in binding order; `None` if still pending.
    pub inputs: &'a [Option<Freshness>],
}

impl CycleContext<'_> {
    pub fn is_fresh(&self, index: usize) -> bool {
        matches!(self.inputs.get(index), Some(Some(Freshness::Fresh)))
    }

    pub fn any_fresh(&self) -> bool {
        self.inputs.iter().any(|f| *f == Some(Freshness::Fresh))
    }
}

/// Latest captured value of one input, shared by its input thread and the
/// compute thread.
pub struct InputSlot<T> {
    value: Mutex<Captured<T>>,
}

impl<T: Payload> InputSlot<T> {
    fn new() -> Self {
        Self {
            value: Mutex::new(Captured {
                value: T::default(),
                freshness: Freshness::Missing,
            }),
        }
    }

    fn store(&self, captured: Captured<T>) {
        *self.value.lock().unwrap_or_else(|p| p.into_inner()) = captured;
    }

    fn get(&self) -> T {
        self.value
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .value
            .clone()
    }
}

/// Type-erased input driven by one input thread.
pub trait InputPort: Send {
    /// Name of the upstream buffer.
    fn source(&self) -> &str;

    /// Perform one read per the binding policy and store it in the slot.
    fn assimilate(&mut self, shutdown: &Receiver<()>) -> Result<Freshness, Closed>;
}

struct BoundPort<T> {
    cursor: BindingCursor<T>,
    slot: Arc<InputSlot<T>>,
}

impl<T: Payload> InputPort for BoundPort<T> {
    fn source(&self) -> &str {
        self.cursor.binding().buffer_name()
    }

    fn assimilate(&mut self, shutdown: &Receiver<()>) -> Result<Freshness, Closed> {
        let captured = self.cursor.next(shutdown)?;
        let freshness = captured.freshness;
        self.slot.store(captured);
        Ok(freshness)
    }
}

fn port<T: Payload>(binding: Binding<T>, slot: &Arc<InputSlot<T>>) -> Box<dyn InputPort> {
    Box::new(BoundPort {
        cursor: BindingCursor::new(binding),
        slot: slot.clone(),
    })
}

/// A tuple of bindings forming a stage's inputs.
pub trait InputSet: Send + 'static {
    /// Evaluator argument tuple.
    type Values: Send + 'static;
    /// Typed slots the compute thread reads from.
    type Slots: Send + 'static;

    const ARITY: usize;

    fn split(self) -> (Vec<Box<dyn InputPort>>, Self::Slots);

    fn assemble(slots: &Self::Slots) -> Self::Values;
}

impl InputSet for () {
    type Values = ();
    type Slots = ();

    const ARITY: usize = 0;

    fn split(self) -> (Vec<Box<dyn InputPort>>, Self::Slots) {
        (Vec::new(), ())
    }

    fn assemble(_slots: &Self::Slots) -> Self::Values {}
}

macro_rules! impl_input_set {
    ($arity:expr; $($name:ident : $idx:tt),+) => {
        impl<$($name: Payload),+> InputSet for ($(Binding<$name>,)+) {
            type Values = ($($name,)+);
            type Slots = ($(Arc<InputSlot<$name>>,)+);

            const ARITY: usize = $arity;

            fn split(self) -> (Vec<Box<dyn InputPort>>, Self::Slots) {
                let slots = ($(Arc::new(InputSlot::<$name>::new()),)+);
                let ports = vec![$(port(self.$idx, &slots.$idx)),+];
                (ports, slots)
            }

            fn assemble(slots: &Self::Slots) -> Self::Values {
                ($(slots.$idx.get(),)+)
            }
        }
    };
}

impl_input_set!(1; A: 0);
impl_input_set!(2; A: 0, B: 1);
impl_input_set!(3; A: 0, B: 1, C: 2);
impl_input_set!(4; A: 0, B: 1, C: 2, D: 3);

/// Where and how a stage publishes its result.
pub struct OutputSpec<O> {
    buffer: Arc<StageBuffer<O>>,
    overwrite: bool,
    every_skip: u32,
    await_release: bool,
}

impl<O> Clone for OutputSpec<O> {
    fn clone(&self) -> Self {
        Self {
            buffer: self.buffer.clone(),
            overwrite: self.overwrite,
            every_skip: self.every_skip,
            await_release: self.await_release,
        }
    }
}

/// Result of the publish step of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The stage has no output buffer.
    NoOutput,
    /// Suppressed by output subsampling.
    Skipped,
    Overwritten,
    Enqueued,
}

impl PublishOutcome {
    pub fn published(self) -> bool {
        matches!(self, PublishOutcome::Overwritten | PublishOutcome::Enqueued)
    }
}

/// Compute-side half of a stage, driven by the runner's compute thread.
pub trait StageBody: Send {
    /// Assemble the inputs and run the evaluator.
    fn compute(&mut self, ctx: &CycleContext<'_>);

    /// Publish the last result, honoring subsampling. `completed` is the
    /// number of cycles completed before this one.
    fn publish(&mut self, completed: u64) -> Result<PublishOutcome, Closed>;

    /// Whether the runner must wait for a release signal after enqueueing.
    fn awaits_release(&self) -> bool;

    /// Block until a consumer has taken the last enqueued value.
    fn wait_release(&self, shutdown: &Receiver<()>) -> Result<(), Closed>;
}

type Evaluator<V, O> = Box<dyn for<'a> FnMut(&CycleContext<'a>, V) -> O + Send>;

struct TypedBody<I: InputSet, O> {
    slots: I::Slots,
    evaluator: Evaluator<I::Values, O>,
    output: Option<OutputSpec<O>>,
    release: Option<Signal>,
    pending: Option<O>,
}

impl<I: InputSet, O: Payload> StageBody for TypedBody<I, O> {
    fn compute(&mut self, ctx: &CycleContext<'_>) {
        let values = I::assemble(&self.slots);
        self.pending = Some((self.evaluator)(ctx, values));
    }

    fn publish(&mut self, completed: u64) -> Result<PublishOutcome, Closed> {
        let Some(output) = &self.output else {
            self.pending = None;
            return Ok(PublishOutcome::NoOutput);
        };
        let Some(value) = self.pending.take() else {
            return Ok(PublishOutcome::Skipped);
        };
        if completed % (output.every_skip as u64 + 1) != 0 {
            return Ok(PublishOutcome::Skipped);
        }
        if output.overwrite {
            output.buffer.publish_overwrite(value)?;
            Ok(PublishOutcome::Overwritten)
        } else {
            output.buffer.publish_enqueue(value)?;
            Ok(PublishOutcome::Enqueued)
        }
    }

    fn awaits_release(&self) -> bool {
        self.release.is_some()
    }

    fn wait_release(&self, shutdown: &Receiver<()>) -> Result<(), Closed> {
        let Some(release) = &self.release else {
            return Ok(());
        };
        select! {
            recv(release) -> msg => msg.map_err(|_| Closed),
            recv(shutdown) -> _ => Err(Closed),
        }
    }
}

/// Everything a runner needs to execute one stage.
pub struct StageParts {
    pub name: String,
    pub ports: Vec<Box<dyn InputPort>>,
    pub body: Box<dyn StageBody>,
    pub rate: Option<Box<dyn RateLimiter>>,
    pub input_timeout: Option<Duration>,
}

/// Type-erased stage specification as stored by the engine.
pub trait StageDefinition: Send {
    fn name(&self) -> &str;

    fn arity(&self) -> usize;

    fn input_sources(&self) -> Vec<String>;

    fn output_buffer(&self) -> Option<&str>;

    /// Every buffer this stage touches: inputs in binding order, then the
    /// output.
    fn buffers(&self) -> Vec<Arc<dyn BufferControl>>;

    /// Register this stage as the single writer of its output buffer.
    fn claim_output(&self) -> PipelineResult<()>;

    fn into_parts(self: Box<Self>) -> StageParts;
}

/// Description of one pipeline node.
pub struct StageSpec<I: InputSet, O> {
    name: String,
    inputs: I,
    output: Option<OutputSpec<O>>,
    rate: Option<Box<dyn RateLimiter>>,
    input_timeout: Option<Duration>,
    evaluator: Evaluator<I::Values, O>,
    sources: Vec<Arc<dyn BufferControl>>,
}

impl StageSpec<(), ()> {
    /// Start describing a stage.
    pub fn builder(name: impl Into<String>) -> StageBuilder<(), ()> {
        StageBuilder {
            name: name.into(),
            inputs: (),
            sources: Vec::new(),
            output: None,
            rate: None,
            input_timeout: None,
            input_timeout_ms: None,
            every_skip: 0,
            await_release: false,
        }
    }
}

impl<I: InputSet, O: Payload> StageDefinition for StageSpec<I, O> {
    fn name(&self) -> &str {
        &self.name
    }

    fn arity(&self) -> usize {
        I::ARITY
    }

    fn input_sources(&self) -> Vec<String> {
        self.sources.iter().map(|b| b.name().to_string()).collect()
    }

    fn output_buffer(&self) -> Option<&str> {
        self.output.as_ref().map(|o| o.buffer.name())
    }

    fn buffers(&self) -> Vec<Arc<dyn BufferControl>> {
        let output = self
            .output
            .as_ref()
            .map(|o| o.buffer.clone() as Arc<dyn BufferControl>);
        self.sources.iter().cloned().chain(output).collect()
    }

    fn claim_output(&self) -> PipelineResult<()> {
        match &self.output {
            Some(output) => output.buffer.claim_writer(&self.name),
            None => Ok(()),
        }
    }

    fn into_parts(self: Box<Self>) -> StageParts {
        let spec = *self;
        let (ports, slots) = spec.inputs.split();
        // Rendezvous buffers already hand off inside `publish_enqueue`.
        let release = spec
            .output
            .as_ref()
            .filter(|o| o.await_release && !o.overwrite && o.buffer.capacity() > 0)
            .map(|o| o.buffer.add_release_listener());
        StageParts {
            name: spec.name,
            ports,
            body: Box::new(TypedBody::<I, O> {
                slots,
                evaluator: spec.evaluator,
                output: spec.output,
                release,
                pending: None,
            }),
            rate: spec.rate,
            input_timeout: spec.input_timeout,
        }
    }
}

/// Typestate builder for [`StageSpec`].
pub struct StageBuilder<I, O> {
    name: String,
    inputs: I,
    sources: Vec<Arc<dyn BufferControl>>,
    output: Option<OutputSpec<O>>,
    rate: Option<Box<dyn RateLimiter>>,
    input_timeout: Option<Duration>,
    input_timeout_ms: Option<i64>,
    every_skip: u32,
    await_release: bool,
}

/// Buffers behind a binding tuple, in binding order.
pub trait BindingSources {
    fn sources(&self) -> Vec<Arc<dyn BufferControl>>;
}

impl BindingSources for () {
    fn sources(&self) -> Vec<Arc<dyn BufferControl>> {
        Vec::new()
    }
}

macro_rules! impl_binding_sources {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: Payload),+> BindingSources for ($(Binding<$name>,)+) {
            fn sources(&self) -> Vec<Arc<dyn BufferControl>> {
                vec![$(self.$idx.buffer().clone() as Arc<dyn BufferControl>),+]
            }
        }
    };
}

impl_binding_sources!(A: 0);
impl_binding_sources!(A: 0, B: 1);
impl_binding_sources!(A: 0, B: 1, C: 2);
impl_binding_sources!(A: 0, B: 1, C: 2, D: 3);

impl<I, O> StageBuilder<I, O> {
    /// Bind the stage inputs, in evaluator argument order.
    pub fn inputs<J: InputSet + BindingSources>(self, inputs: J) -> StageBuilder<J, O> {
        StageBuilder {
            name: self.name,
            sources: inputs.sources(),
            inputs,
            output: self.output,
            rate: self.rate,
            input_timeout: self.input_timeout,
            input_timeout_ms: self.input_timeout_ms,
            every_skip: self.every_skip,
            await_release: self.await_release,
        }
    }

    /// Publish into `buffer`; `overwrite` selects publish-latest over enqueue.
    pub fn output<P: Payload>(self, buffer: &Arc<StageBuffer<P>>, overwrite: bool) -> StageBuilder<I, P> {
        StageBuilder {
            name: self.name,
            inputs: self.inputs,
            sources: self.sources,
            output: Some(OutputSpec {
                buffer: buffer.clone(),
                overwrite,
                every_skip: self.every_skip,
                await_release: self.await_release,
            }),
            rate: self.rate,
            input_timeout: self.input_timeout,
            input_timeout_ms: self.input_timeout_ms,
            every_skip: self.every_skip,
            await_release: self.await_release,
        }
    }

    /// Publish only every `skip + 1` completed cycles.
    pub fn output_every_skip(mut self, skip: u32) -> Self {
        self.every_skip = skip;
        if let Some(output) = &mut self.output {
            output.every_skip = skip;
        }
        self
    }

    /// After each enqueue, wait until a consumer has dequeued it.
    pub fn await_release(mut self, await_release: bool) -> Self {
        self.await_release = await_release;
        if let Some(output) = &mut self.output {
            output.await_release = await_release;
        }
        self
    }

    pub fn rate_limiter(mut self, limiter: Box<dyn RateLimiter>) -> Self {
        self.rate = Some(limiter);
        self
    }

    /// Aggregate deadline for all inputs of one cycle.
    pub fn input_timeout(mut self, timeout: Duration) -> Self {
        self.input_timeout = Some(timeout);
        self.input_timeout_ms = None;
        self
    }

    /// Aggregate input deadline in milliseconds; negative fails at `evaluate`.
    pub fn input_timeout_ms(mut self, millis: i64) -> Self {
        self.input_timeout_ms = Some(millis);
        self.input_timeout = None;
        self
    }
}

impl<I: InputSet, O: Payload> StageBuilder<I, O> {
    /// Finish the specification with its evaluator.
    pub fn evaluate<F>(self, evaluator: F) -> PipelineResult<StageSpec<I, O>>
    where
        F: for<'a> FnMut(&CycleContext<'a>, I::Values) -> O + Send + 'static,
    {
        let input_timeout = match self.input_timeout_ms {
            Some(millis) if millis < 0 => {
                return Err(PipelineError::InvalidTimeout {
                    context: format!("Stage '{}' inputs", self.name),
                    millis,
                })
            }
            Some(millis) => Some(Duration::from_millis(millis as u64)),
            None => self.input_timeout,
        };
        Ok(StageSpec {
            name: self.name,
            inputs: self.inputs,
            output: self.output,
            rate: self.rate,
            input_timeout,
            evaluator: Box::new(evaluator),
            sources: self.sources,
        })
    }
}
