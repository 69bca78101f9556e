// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! The execution node: the per-operator runtime wrapper.
//!
//! Responsibilities:
//! - Owns one operator instance and its generator, buffers batches on both
//!   ends, and negotiates demand with its neighbors via pull/push.
//! - Schedules its own coalesced run steps, advances the generator under a
//!   bounded budget, and honors the abort latch at every safe point.
//! - Handles completion, demand rejection, upstream loss, and downstream
//!   failure with the shutdown semantics the pipeline driver relies on.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use futures::Stream;
use futures::stream::BoxStream;
use futures::task::ArcWake;
use tokio::sync::{mpsc, watch};

use crate::exec::context::EngineContext;
use crate::exec::diagnostics::DiagnosticSender;
use crate::exec::element::{
    ByteChunk, Element, ElementKind, EventBatch, Payload, Void, buffer_prefix, split_buffer,
};
use crate::exec::error::{Error, Result};
use crate::exec::operator::{Operator, OperatorInput, OperatorLocation, OperatorOutput};
use crate::exec::pipeline::control_plane::ControlPlane;
use crate::exec::pipeline::handle::{ExitStatus, Lifecycle, NodeHandle, NodeMsg, ReplySender};
use crate::exec::pipeline::metrics::NodeMetrics;
use crate::sluice_logging::{debug, trace};

/// Upper bound for the batch timeout used when requesting a batch from the
/// previous execution node.
pub const MAX_BATCH_TIMEOUT: Duration = Duration::from_millis(250);

/// Upper bound for how often an operator's generator may be advanced within
/// one run before yielding to the scheduler. Values above 1 starve operators
/// that issue request/await style calls between yields.
pub const MAX_ADVANCES_PER_RUN: usize = 1;

/// Binds an element type to the operator instantiation surface.
pub(crate) trait Port: Element {
    fn make_input(shared: &Arc<InboundShared<Self>>) -> OperatorInput;

    fn output_stream(
        output: OperatorOutput,
        op_name: &str,
    ) -> Result<BoxStream<'static, Self::Step>>;
}

impl Port for EventBatch {
    fn make_input(shared: &Arc<InboundShared<Self>>) -> OperatorInput {
        OperatorInput::Events(Box::pin(InputAdapter {
            shared: Arc::clone(shared),
        }))
    }

    fn output_stream(
        output: OperatorOutput,
        op_name: &str,
    ) -> Result<BoxStream<'static, Self::Step>> {
        match output {
            OperatorOutput::Events(stream) => Ok(stream),
            other => Err(Error::Logic(format!(
                "`{}` expected an events generator, got {}",
                op_name,
                other.kind()
            ))),
        }
    }
}

impl Port for ByteChunk {
    fn make_input(shared: &Arc<InboundShared<Self>>) -> OperatorInput {
        OperatorInput::Bytes(Box::pin(InputAdapter {
            shared: Arc::clone(shared),
        }))
    }

    fn output_stream(
        output: OperatorOutput,
        op_name: &str,
    ) -> Result<BoxStream<'static, Self::Step>> {
        match output {
            OperatorOutput::Bytes(stream) => Ok(stream),
            other => Err(Error::Logic(format!(
                "`{}` expected a bytes generator, got {}",
                op_name,
                other.kind()
            ))),
        }
    }
}

impl Port for Void {
    fn make_input(_shared: &Arc<InboundShared<Self>>) -> OperatorInput {
        OperatorInput::Void
    }

    fn output_stream(
        output: OperatorOutput,
        op_name: &str,
    ) -> Result<BoxStream<'static, Self::Step>> {
        match output {
            OperatorOutput::Void(stream) => Ok(stream),
            other => Err(Error::Logic(format!(
                "`{}` runs a sink but returned a {} generator",
                op_name,
                other.kind()
            ))),
        }
    }
}

struct InboundQueue<I> {
    batches: VecDeque<I>,
    size: u64,
}

/// Inbound state shared between the node and the input adapter held inside
/// the operator's generator. The node and the generator never run
/// concurrently, so the mutex is uncontended.
pub(crate) struct InboundShared<I> {
    queue: Mutex<InboundQueue<I>>,
    upstream_live: AtomicBool,
    signaled_demand: AtomicBool,
    stalled: AtomicBool,
}

impl<I: Element> InboundShared<I> {
    fn new() -> Self {
        Self {
            queue: Mutex::new(InboundQueue {
                batches: VecDeque::new(),
                size: 0,
            }),
            upstream_live: AtomicBool::new(false),
            signaled_demand: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
        }
    }

    fn push_batches(&self, batches: Vec<I>) {
        let mut queue = self.queue.lock().expect("inbound queue lock");
        for batch in batches {
            queue.size += batch.size();
            queue.batches.push_back(batch);
        }
    }

    fn size(&self) -> u64 {
        self.queue.lock().expect("inbound queue lock").size
    }

    fn upstream_live(&self) -> bool {
        self.upstream_live.load(Ordering::Acquire)
    }

    fn set_upstream_live(&self, value: bool) {
        self.upstream_live.store(value, Ordering::Release);
    }

    fn signaled_demand(&self) -> bool {
        self.signaled_demand.load(Ordering::Acquire)
    }

    fn set_signaled_demand(&self, value: bool) {
        self.signaled_demand.store(value, Ordering::Release);
    }

    fn stalled(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }
}

/// The generator fed to a consuming operator. Drains the inbound buffer,
/// yields a single zero-size placeholder while the buffer is empty but more
/// input is possible, and ends once the upstream is gone, the buffer is
/// drained, and no pull is outstanding.
struct InputAdapter<I: Element> {
    shared: Arc<InboundShared<I>>,
}

impl<I: Element> Stream for InputAdapter<I> {
    type Item = I;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let shared = &self.get_mut().shared;
        {
            let mut queue = shared.queue.lock().expect("inbound queue lock");
            if let Some(next) = queue.batches.pop_front() {
                queue.size -= next.size();
                shared.stalled.store(false, Ordering::Release);
                return Poll::Ready(Some(next));
            }
        }
        if shared.upstream_live() || shared.signaled_demand() {
            shared.stalled.store(true, Ordering::Release);
            Poll::Ready(Some(I::empty()))
        } else {
            shared.stalled.store(false, Ordering::Release);
            Poll::Ready(None)
        }
    }
}

/// Wakes the node by mail rather than by task handle, so an operator that
/// awaits an external event re-schedules a run instead of spinning a task
/// that no longer polls it.
struct NodeWaker {
    tx: mpsc::UnboundedSender<NodeMsg>,
}

impl ArcWake for NodeWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let _ = arc_self.tx.send(NodeMsg::Wake);
    }
}

/// The currently open downstream demand.
struct Demand {
    reply: ReplySender,
    sink: NodeHandle,
    batch_size: u64,
    deadline: Instant,
    ongoing: bool,
}

struct Outbound<O> {
    buffer: VecDeque<O>,
    buffer_size: u64,
    current_demand: Option<Demand>,
    reject_demand: bool,
}

struct Instance<O: Element> {
    gen: BoxStream<'static, O::Step>,
    ended: bool,
}

enum Advance {
    /// The generator may be advanced again within this run.
    Continue,
    /// Progress was made or nothing can be produced right now.
    Stop,
    /// The abort latch fired.
    Abort(Error),
}

pub(crate) struct ExecNode<I: Port, O: Port> {
    op: Box<dyn Operator>,
    ctrl: ControlPlane,
    self_tx: mpsc::UnboundedSender<NodeMsg>,
    self_handle: NodeHandle,
    lifecycle: watch::Sender<Lifecycle>,
    inbound: Arc<InboundShared<I>>,
    upstream: Option<NodeHandle>,
    outbound: Outbound<O>,
    instance: Option<Instance<O>>,
    pending_start_reply: Option<ReplySender>,
    run_scheduled: bool,
    waker: Waker,
    metrics: NodeMetrics,
    exit: Option<ExitStatus>,
}

impl<I: Port, O: Port> ExecNode<I, O> {
    async fn run_actor(mut self, mut rx: mpsc::UnboundedReceiver<NodeMsg>) {
        while self.exit.is_none() {
            let Some(msg) = rx.recv().await else {
                // Every handle is gone; nothing can reach this node anymore.
                self.exit = Some(ExitStatus::Failed(Error::ReceiverDown));
                break;
            };
            self.handle_msg(msg).await;
        }
        let status = self.exit.take().unwrap_or(ExitStatus::Failed(Error::ReceiverDown));
        self.lifecycle.send_replace(Lifecycle::Ended(status));
    }

    async fn handle_msg(&mut self, msg: NodeMsg) {
        let scheduled_at = Instant::now();
        match msg {
            NodeMsg::Start { chain, reply } => self.handle_start(chain, reply),
            NodeMsg::Pull {
                sink,
                batch_size,
                batch_timeout,
                reply,
            } => self.handle_pull(sink, batch_size, batch_timeout, reply),
            NodeMsg::Push { payload, reply } => self.handle_push(payload, reply),
            NodeMsg::Shutdown { status } => self.finish(status),
            NodeMsg::UpstreamDown { status } => self.handle_upstream_down(status),
            NodeMsg::UpstreamStarted { result } => self.handle_upstream_started(result),
            NodeMsg::PullReplied { result } => self.handle_pull_replied(result),
            NodeMsg::PushReplied { result, delivered } => self.complete_push(result, delivered),
            NodeMsg::Run => {
                self.run_scheduled = false;
                self.run().await;
            }
            NodeMsg::Wake => self.schedule_run(),
        }
        self.metrics.time_scheduled += scheduled_at.elapsed();
    }

    fn handle_start(&mut self, mut chain: Vec<NodeHandle>, reply: ReplySender) {
        let started_at = Instant::now();
        debug!("`{}` received start request", self.op.name());
        if self.instance.is_some() {
            let _ = reply.send(Err(Error::Logic(format!(
                "`{}` was already started",
                self.op.name()
            ))));
            return;
        }
        if I::KIND == ElementKind::Void {
            if !chain.is_empty() {
                let _ = reply.send(Err(Error::Logic(format!(
                    "`{}` runs a source operator and must not have a previous execution node",
                    self.op.name()
                ))));
                return;
            }
        } else {
            let Some(upstream) = chain.pop() else {
                let _ = reply.send(Err(Error::Logic(format!(
                    "`{}` runs a transformation/sink operator and must have a previous \
                     execution node",
                    self.op.name()
                ))));
                return;
            };
            self.monitor_upstream(&upstream);
            self.inbound.set_upstream_live(true);
            self.upstream = Some(upstream);
        }
        // Instantiate the operator against its input adapter.
        let running_at = Instant::now();
        let input = I::make_input(&self.inbound);
        let output = match self.op.instantiate(input, self.ctrl.clone()) {
            Ok(output) => output,
            Err(error) => {
                debug!("`{}` could not instantiate operator: {}", self.op.name(), error);
                let _ = reply.send(Err(Error::Unspecified(format!(
                    "`{}` failed to instantiate operator: {}",
                    self.op.name(),
                    error
                ))));
                return;
            }
        };
        let gen = match O::output_stream(output, self.op.name()) {
            Ok(gen) => gen,
            Err(error) => {
                let _ = reply.send(Err(error));
                return;
            }
        };
        self.instance = Some(Instance { gen, ended: false });
        self.metrics.time_running += running_at.elapsed();
        if let Some(error) = self.ctrl.latched() {
            debug!("`{}` was aborted during instantiation", self.op.name());
            let _ = reply.send(Err(error));
            self.metrics.time_starting += started_at.elapsed();
            return;
        }
        if O::KIND == ElementKind::Void {
            // The sink awaits its upstream's start, then begins pulling.
            let Some(upstream) = self.upstream.clone() else {
                let _ = reply.send(Err(Error::Logic(format!(
                    "`{}` runs a sink operator without an upstream",
                    self.op.name()
                ))));
                return;
            };
            trace!("`{}` requests start from its upstream", self.op.name());
            self.pending_start_reply = Some(reply);
            let self_tx = self.self_tx.clone();
            tokio::spawn(async move {
                let result = upstream.start(chain).await;
                let _ = self_tx.send(NodeMsg::UpstreamStarted { result });
            });
        } else if I::KIND != ElementKind::Void {
            // Transformations delegate the remaining chain upstream.
            let Some(upstream) = self.upstream.clone() else {
                let _ = reply.send(Err(Error::Logic(format!(
                    "`{}` lost its upstream during start",
                    self.op.name()
                ))));
                return;
            };
            debug!("`{}` delegates start to its upstream", self.op.name());
            tokio::spawn(async move {
                let result = upstream.start(chain).await;
                let _ = reply.send(result);
            });
        } else {
            let _ = reply.send(Ok(()));
        }
        self.metrics.time_starting += started_at.elapsed();
    }

    fn monitor_upstream(&self, upstream: &NodeHandle) {
        let peer = upstream.clone();
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let status = peer.wait_ended().await;
            let _ = self_tx.send(NodeMsg::UpstreamDown { status });
        });
    }

    fn handle_upstream_started(&mut self, result: Result<()>) {
        let Some(reply) = self.pending_start_reply.take() else {
            return;
        };
        match result {
            Ok(()) => {
                debug!(
                    "`{}` schedules run of sink after successful startup",
                    self.op.name()
                );
                self.schedule_run();
                let _ = reply.send(Ok(()));
            }
            Err(error) => {
                debug!("`{}` forwards error during startup: {}", self.op.name(), error);
                let _ = reply.send(Err(error));
            }
        }
    }

    fn handle_upstream_down(&mut self, status: ExitStatus) {
        debug!(
            "`{}` got down from previous execution node: {:?}",
            self.op.name(),
            status
        );
        self.upstream = None;
        self.inbound.set_upstream_live(false);
        // A down notification can arrive without an error reply to an
        // outstanding pull; clear the demand flag so shutdown can proceed.
        self.inbound.set_signaled_demand(false);
        self.schedule_run();
        if let ExitStatus::Failed(error) = status {
            self.ctrl.abort(Error::Unspecified(format!(
                "`{}` shuts down because of irregular exit of previous operator: {}",
                self.op.name(),
                error
            )));
        }
    }

    fn handle_pull(
        &mut self,
        sink: NodeHandle,
        batch_size: u64,
        batch_timeout: Duration,
        reply: ReplySender,
    ) {
        if O::KIND == ElementKind::Void {
            let _ = reply.send(Err(Error::Logic(format!(
                "`{}` is a sink and must not be pulled from",
                self.op.name()
            ))));
            return;
        }
        if self.outbound.reject_demand {
            tokio::spawn(async move {
                tokio::time::sleep(batch_timeout).await;
                let _ = reply.send(Ok(()));
            });
            return;
        }
        self.schedule_run();
        if self.outbound.current_demand.is_some() {
            let _ = reply.send(Err(Error::Logic("concurrent pull".to_string())));
            return;
        }
        self.outbound.current_demand = Some(Demand {
            reply,
            sink,
            batch_size,
            deadline: Instant::now() + batch_timeout,
            ongoing: false,
        });
    }

    fn handle_push(&mut self, payload: Payload, reply: ReplySender) {
        if I::KIND == ElementKind::Void {
            let _ = reply.send(Err(Error::Logic(format!(
                "`{}` runs a source operator and does not accept input",
                self.op.name()
            ))));
            return;
        }
        self.schedule_run();
        let batches = match I::from_payload(payload) {
            Ok(batches) => batches,
            Err(error) => {
                let _ = reply.send(Err(error));
                return;
            }
        };
        let input_size: u64 = batches.iter().map(Element::size).sum();
        self.metrics.num_inbound_batches += batches.len() as u64;
        if input_size == 0 {
            let _ = reply.send(Err(Error::Logic("received an empty batch".to_string())));
            return;
        }
        if self.inbound.size() + input_size > I::MAX_BUFFERED {
            let _ = reply.send(Err(Error::Logic("inbound buffer full".to_string())));
            return;
        }
        self.inbound.push_batches(batches);
        self.metrics.inbound_total += input_size;
        let _ = reply.send(Ok(()));
    }

    fn handle_pull_replied(&mut self, result: Result<()>) {
        self.inbound.set_signaled_demand(false);
        self.schedule_run();
        if let Err(error) = result {
            if error == Error::ReceiverDown {
                self.upstream = None;
                self.inbound.set_upstream_live(false);
            } else if self.upstream.is_some() {
                self.ctrl.warn(Error::Unspecified(format!(
                    "failed to pull from previous execution node: {}",
                    error
                )));
            }
        }
    }

    fn schedule_run(&mut self) {
        if self.instance.is_none() || self.run_scheduled {
            return;
        }
        // Always dispatch through the mailbox: the run lands behind queued
        // messages, yielding the scheduler turn that operators with pending
        // requests depend on.
        self.run_scheduled = true;
        let _ = self.self_tx.send(NodeMsg::Run);
    }

    async fn run(&mut self) {
        trace!("`{}` enters run loop", self.op.name());
        let now = Instant::now();
        let ended = match &self.instance {
            Some(instance) => instance.ended,
            None => return,
        };
        if ended {
            debug!("`{}` is at the end of its generator", self.op.name());
            // Shutting down the upstream immediately is an optimization; the
            // lifecycle announcement would reach it anyway, but this keeps
            // finished operators from running unnecessarily.
            if I::KIND != ElementKind::Void {
                if let Some(upstream) = &self.upstream {
                    debug!("`{}` shuts down previous operator", self.op.name());
                    upstream.shutdown(ExitStatus::Normal);
                }
            }
            if O::KIND != ElementKind::Void {
                if self.outbound.current_demand.is_some() && self.outbound.buffer_size == 0 {
                    debug!("`{}` rejects further demand from next operator", self.op.name());
                    self.outbound.reject_demand = true;
                }
                if self.outbound.current_demand.is_some() || self.outbound.buffer_size > 0 {
                    debug!("`{}` forcibly delivers batches", self.op.name());
                    self.deliver_batches(now, true).await;
                    self.schedule_run();
                    return;
                }
            }
            self.finish(ExitStatus::Normal);
            return;
        }
        if O::KIND != ElementKind::Void {
            self.deliver_batches(now, false).await;
        }
        if I::KIND != ElementKind::Void {
            self.request_more_input();
        }
        for _ in 0..MAX_ADVANCES_PER_RUN {
            match self.advance_generator() {
                Advance::Continue => continue,
                Advance::Stop => break,
                Advance::Abort(error) => {
                    debug!("`{}` quits with error: {}", self.op.name(), error);
                    self.finish(ExitStatus::Failed(error));
                    return;
                }
            }
        }
        // Decide whether another run could make progress.
        let stalled = self.inbound.stalled();
        let gen_ended = self.instance.as_ref().map(|i| i.ended).unwrap_or(true);
        if O::KIND == ElementKind::Void {
            if !stalled {
                self.schedule_run();
            }
        } else if I::KIND == ElementKind::Void {
            let can_generate = self.outbound.buffer_size < O::MAX_BUFFERED && !gen_ended;
            if !stalled && (self.outbound.current_demand.is_some() || can_generate) {
                self.schedule_run();
            }
        } else {
            let can_generate = self.outbound.buffer_size < O::MAX_BUFFERED && !gen_ended;
            let should_produce = self.outbound.current_demand.is_some();
            let upstream_down = self.upstream.is_none();
            if upstream_down || (!stalled && (should_produce || can_generate)) {
                self.schedule_run();
            }
        }
    }

    fn request_more_input(&mut self) {
        debug_assert!(self.inbound.size() <= I::MAX_BUFFERED);
        let batch_size = (I::MAX_BUFFERED - self.inbound.size()).min(I::MAX_BATCH_SIZE);
        let Some(upstream) = self.upstream.clone() else {
            return;
        };
        if self.inbound.signaled_demand() || batch_size < I::MIN_BATCH_SIZE {
            return;
        }
        self.inbound.set_signaled_demand(true);
        let sink = self.self_handle.clone();
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = upstream.pull(sink, batch_size, MAX_BATCH_TIMEOUT).await;
            let _ = self_tx.send(NodeMsg::PullReplied { result });
        });
    }

    fn advance_generator(&mut self) -> Advance {
        let running_at = Instant::now();
        if O::KIND != ElementKind::Void && self.outbound.buffer_size >= O::MAX_BUFFERED {
            return Advance::Stop;
        }
        let Some(instance) = self.instance.as_mut() else {
            return Advance::Stop;
        };
        debug_assert!(!instance.ended);
        let waker = self.waker.clone();
        let mut cx = Context::from_waker(&waker);
        let outcome = match instance.gen.as_mut().poll_next(&mut cx) {
            Poll::Ready(Some(step)) => match O::from_step(step) {
                Some(batch) => {
                    let size = batch.size();
                    if size > 0 {
                        self.outbound.buffer_size += size;
                        self.outbound.buffer.push_back(batch);
                        Advance::Stop
                    } else {
                        Advance::Continue
                    }
                }
                // A sink advanced without producing output.
                None => Advance::Continue,
            },
            Poll::Ready(None) => {
                instance.ended = true;
                Advance::Stop
            }
            // The operator awaits an external event; its waker re-schedules
            // this node.
            Poll::Pending => Advance::Stop,
        };
        self.metrics.time_running += running_at.elapsed();
        if let Some(error) = self.ctrl.latched() {
            return Advance::Abort(error);
        }
        outcome
    }

    async fn deliver_batches(&mut self, now: Instant, force: bool) {
        let (batch_size, deadline, ongoing) = match &self.outbound.current_demand {
            Some(demand) => (demand.batch_size, demand.deadline, demand.ongoing),
            None => return,
        };
        if ongoing {
            return;
        }
        let gen_ended = self.instance.as_ref().map(|i| i.ended).unwrap_or(false);
        if !force
            && !gen_ended
            && self.outbound.buffer_size < batch_size
            && now < deadline
        {
            return;
        }
        let capped = self.outbound.buffer_size.min(batch_size);
        if capped == 0 {
            debug!(
                "`{}` short-circuits delivery of zero batches",
                self.op.name()
            );
            if let Some(demand) = self.outbound.current_demand.take() {
                let _ = demand.reply.send(Ok(()));
            }
            self.schedule_run();
            return;
        }
        let sink = {
            let demand = self
                .outbound
                .current_demand
                .as_mut()
                .expect("demand checked above");
            demand.ongoing = true;
            demand.sink.clone()
        };
        let payload = O::into_payload(buffer_prefix(&self.outbound.buffer, capped));
        if force || self.outbound.buffer_size >= O::MAX_BUFFERED {
            trace!(
                "`{}` pushes {}/{} buffered elements and suspends execution",
                self.op.name(),
                capped,
                self.outbound.buffer_size
            );
            let result = sink.push(payload).await;
            self.complete_push(result, capped);
        } else {
            trace!(
                "`{}` pushes {}/{} buffered elements",
                self.op.name(),
                capped,
                self.outbound.buffer_size
            );
            let self_tx = self.self_tx.clone();
            tokio::spawn(async move {
                let result = sink.push(payload).await;
                let _ = self_tx.send(NodeMsg::PushReplied {
                    result,
                    delivered: capped,
                });
            });
        }
    }

    fn complete_push(&mut self, result: Result<()>, delivered: u64) {
        match result {
            Ok(()) => {
                trace!("`{}` pushed successfully", self.op.name());
                self.metrics.outbound_total += delivered;
                // The buffer may have grown while the push was in flight;
                // re-split at the delivered size and keep the remainder.
                let buffer = std::mem::take(&mut self.outbound.buffer);
                let (prefix, rest) = split_buffer(buffer, delivered);
                self.metrics.num_outbound_batches += prefix.len() as u64;
                self.outbound.buffer_size = rest.iter().map(Element::size).sum();
                self.outbound.buffer = rest;
                if let Some(demand) = self.outbound.current_demand.take() {
                    let _ = demand.reply.send(Ok(()));
                }
                self.schedule_run();
            }
            Err(error) => {
                debug!("`{}` failed to push: {}", self.op.name(), error);
                if let Some(demand) = self.outbound.current_demand.take() {
                    let _ = demand.reply.send(Err(error.clone()));
                }
                if error == Error::ReceiverDown {
                    // The downstream is gone; treat the push like teardown.
                    self.finish(ExitStatus::Normal);
                } else {
                    self.ctrl.abort(error);
                    let latched = self
                        .ctrl
                        .latched()
                        .unwrap_or(Error::Unspecified("push failed".to_string()));
                    self.finish(ExitStatus::Failed(latched));
                }
            }
        }
    }

    fn finish(&mut self, status: ExitStatus) {
        if self.exit.is_some() {
            return;
        }
        if let Some(demand) = self.outbound.current_demand.take() {
            let error = match &status {
                ExitStatus::Failed(error) => error.clone(),
                ExitStatus::Normal => Error::ReceiverDown,
            };
            let _ = demand.reply.send(Err(error));
        }
        if let Some(reply) = self.pending_start_reply.take() {
            let error = match &status {
                ExitStatus::Failed(error) => error.clone(),
                ExitStatus::Normal => Error::ReceiverDown,
            };
            let _ = reply.send(Err(error));
        }
        match &status {
            ExitStatus::Normal => {
                debug!("`{}` is done", self.op.name());
                self.metrics.report(self.op.name(), I::KIND, O::KIND);
            }
            ExitStatus::Failed(_) => {
                // Propagate the exit upstream so the rest of the chain stops
                // producing.
                if let Some(upstream) = &self.upstream {
                    upstream.shutdown(ExitStatus::Normal);
                }
            }
        }
        self.exit = Some(status);
    }
}

/// Builds and schedules one execution node for `op`, given the element kind
/// arriving from upstream. Returns the node's handle and its output kind.
pub fn spawn_exec_node(
    op: Box<dyn Operator>,
    input_kind: ElementKind,
    ctx: Arc<EngineContext>,
    diagnostics: DiagnosticSender,
) -> Result<(NodeHandle, ElementKind)> {
    let output_kind = op.output_kind(input_kind)?;
    if op.location() == OperatorLocation::Remote && ctx.cluster().is_none() {
        return Err(Error::Logic(format!(
            "`{}` runs a remote operator and requires a cluster handle",
            op.name()
        )));
    }
    let handle = match (input_kind, output_kind) {
        (ElementKind::Void, ElementKind::Void) => {
            return Err(Error::Logic(format!(
                "`{}` maps void to void and cannot be executed",
                op.name()
            )));
        }
        (ElementKind::Void, ElementKind::Events) => launch::<Void, EventBatch>(op, ctx, diagnostics),
        (ElementKind::Void, ElementKind::Bytes) => launch::<Void, ByteChunk>(op, ctx, diagnostics),
        (ElementKind::Events, ElementKind::Void) => launch::<EventBatch, Void>(op, ctx, diagnostics),
        (ElementKind::Events, ElementKind::Events) => {
            launch::<EventBatch, EventBatch>(op, ctx, diagnostics)
        }
        (ElementKind::Events, ElementKind::Bytes) => {
            launch::<EventBatch, ByteChunk>(op, ctx, diagnostics)
        }
        (ElementKind::Bytes, ElementKind::Void) => launch::<ByteChunk, Void>(op, ctx, diagnostics),
        (ElementKind::Bytes, ElementKind::Events) => {
            launch::<ByteChunk, EventBatch>(op, ctx, diagnostics)
        }
        (ElementKind::Bytes, ElementKind::Bytes) => {
            launch::<ByteChunk, ByteChunk>(op, ctx, diagnostics)
        }
    };
    Ok((handle, output_kind))
}

fn launch<I: Port, O: Port>(
    op: Box<dyn Operator>,
    ctx: Arc<EngineContext>,
    diagnostics: DiagnosticSender,
) -> NodeHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (lifecycle_tx, lifecycle_rx) = watch::channel(Lifecycle::Running);
    let handle = NodeHandle {
        tx: tx.clone(),
        lifecycle: lifecycle_rx,
        name: op.name().into(),
    };
    let ctrl = ControlPlane::new(op.name().to_string(), ctx, diagnostics, tx.clone());
    let waker = futures::task::waker(Arc::new(NodeWaker { tx: tx.clone() }));
    let detached = op.detached();
    let node = ExecNode::<I, O> {
        op,
        ctrl,
        self_tx: tx,
        self_handle: handle.clone(),
        lifecycle: lifecycle_tx,
        inbound: Arc::new(InboundShared::new()),
        upstream: None,
        outbound: Outbound {
            buffer: VecDeque::new(),
            buffer_size: 0,
            current_demand: None,
            reject_demand: false,
        },
        instance: None,
        pending_start_reply: None,
        run_scheduled: false,
        waker,
        metrics: NodeMetrics::new(),
        exit: None,
    };
    if detached {
        let thread_name = format!("sluice-exec-{}", handle.name());
        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                    .expect("detached execution node runtime");
                runtime.block_on(node.run_actor(rx));
            })
            .expect("spawn detached execution node thread");
    } else {
        tokio::spawn(node.run_actor(rx));
    }
    handle
}
