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
//! End-to-end tests for the execution engine: demand-driven delivery,
//! buffering bounds, shutdown semantics, and protocol errors.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;

use common::{
    AbortingTransform, ChunkSource, CollectSink, NeverSource, PassOperator, TickingSource,
    ValuesSource, batch_values, make_batch, payload_bytes, payload_values,
};
use sluice::exec::context::EngineContext;
use sluice::exec::diagnostics::{Severity, diagnostic_channel};
use sluice::exec::element::{ByteChunk, Element, ElementKind, EventBatch, Payload};
use sluice::exec::error::{Error, Result};
use sluice::exec::operator::{Operator, OperatorInput, OperatorLocation, OperatorOutput};
use sluice::exec::pipeline::Pipeline;
use sluice::exec::pipeline::control_plane::ControlPlane;
use sluice::exec::pipeline::driver::PipelineDriver;
use sluice::exec::pipeline::handle::{ExitStatus, NodeHandle, push_receiver};
use sluice::exec::pipeline::node::spawn_exec_node;

fn driver() -> PipelineDriver {
    PipelineDriver::new(Arc::new(EngineContext::default()))
}

fn spawn_node(op: Box<dyn Operator>, input: ElementKind) -> (NodeHandle, ElementKind) {
    let (diag_tx, _diag_rx) = diagnostic_channel();
    spawn_exec_node(op, input, Arc::new(EngineContext::default()), diag_tx).expect("spawn node")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn events_are_split_to_match_demand() {
    // Source yields 10, 20, and 30 rows; pulls of 25 receive 25, 25, 10.
    let pipeline = Pipeline::new(vec![Box::new(ValuesSource::new(vec![
        make_batch(0..10),
        make_batch(10..30),
        make_batch(30..60),
    ]))])
    .expect("pipeline");
    let mut payloads = Vec::new();
    let diagnostics = driver()
        .run_with_output(pipeline, 25, Duration::from_secs(1), &mut |payload| {
            payloads.push(payload)
        })
        .await
        .expect("pipeline run");
    assert!(diagnostics.is_empty());
    let sizes: Vec<u64> = payloads.iter().map(Payload::total_size).collect();
    assert_eq!(sizes, vec![25, 25, 10]);
    let values: Vec<i64> = payloads.iter().flat_map(|p| payload_values(p)).collect();
    assert_eq!(values, (0..60).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn byte_slices_align_with_demand() {
    // One 1 MiB chunk through an identity transform, pulled in 256 KiB
    // slices: four pushes, byte-for-byte identical content.
    let content: Vec<u8> = (0..1_048_576usize).map(|i| (i % 251) as u8).collect();
    let pipeline = Pipeline::new(vec![
        Box::new(ChunkSource::new(vec![ByteChunk::new(Bytes::from(
            content.clone(),
        ))])),
        Box::new(PassOperator::bytes()),
    ])
    .expect("pipeline");
    let mut payloads = Vec::new();
    driver()
        .run_with_output(pipeline, 262_144, Duration::from_secs(1), &mut |payload| {
            payloads.push(payload)
        })
        .await
        .expect("pipeline run");
    let sizes: Vec<u64> = payloads.iter().map(Payload::total_size).collect();
    assert_eq!(sizes, vec![262_144, 262_144, 262_144, 262_144]);
    let delivered: Vec<u8> = payloads.iter().flat_map(|p| payload_bytes(p)).collect();
    assert_eq!(delivered, content);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn identity_chain_conserves_events() {
    let pipeline = Pipeline::new(vec![
        Box::new(ValuesSource::new(vec![
            make_batch(0..10),
            make_batch(10..30),
            make_batch(30..60),
        ])),
        Box::new(PassOperator::events()),
        Box::new(PassOperator::events()),
    ])
    .expect("pipeline");
    let mut values = Vec::new();
    driver()
        .run_with_output(
            pipeline,
            EventBatch::MAX_BATCH_SIZE,
            Duration::from_millis(250),
            &mut |payload| values.extend(payload_values(&payload)),
        )
        .await
        .expect("pipeline run");
    assert_eq!(values, (0..60).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn closed_pipeline_collects_everything() {
    let (sink, collected) = CollectSink::new();
    let pipeline = Pipeline::new(vec![
        Box::new(ValuesSource::new(vec![make_batch(0..40), make_batch(40..50)])),
        Box::new(PassOperator::events()),
        Box::new(sink),
    ])
    .expect("pipeline");
    let diagnostics = driver().run(pipeline).await.expect("pipeline run");
    assert!(diagnostics.is_empty());
    let collected: Vec<i64> = collected
        .lock()
        .expect("collected lock")
        .iter()
        .flat_map(batch_values)
        .collect();
    assert_eq!(collected, (0..50).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn detached_source_runs_on_its_own_thread() {
    let (sink, collected) = CollectSink::new();
    let pipeline = Pipeline::new(vec![
        Box::new(ValuesSource::detached(vec![make_batch(0..100)])),
        Box::new(sink),
    ])
    .expect("pipeline");
    driver().run(pipeline).await.expect("pipeline run");
    let rows: usize = collected
        .lock()
        .expect("collected lock")
        .iter()
        .map(|b| b.rows())
        .sum();
    assert_eq!(rows, 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finite_source_rejects_further_demand() {
    // 100 rows against pulls of 1000: one payload, then clean exit.
    let pipeline =
        Pipeline::new(vec![Box::new(ValuesSource::new(vec![make_batch(0..100)]))])
            .expect("pipeline");
    let mut payloads = Vec::new();
    let diagnostics = driver()
        .run_with_output(pipeline, 1000, Duration::from_millis(100), &mut |payload| {
            payloads.push(payload)
        })
        .await
        .expect("pipeline run");
    assert!(diagnostics.is_empty());
    let sizes: Vec<u64> = payloads.iter().map(Payload::total_size).collect();
    assert_eq!(sizes, vec![100]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timeout_bounds_every_pull() {
    // A source emitting one row every 500 ms: each pull completes within
    // its 250 ms timeout plus scheduling slack, with at most one row.
    let (handle, _kind) = spawn_node(
        Box::new(TickingSource {
            interval: Duration::from_millis(500),
            count: 6,
        }),
        ElementKind::Void,
    );
    handle.start(vec![]).await.expect("start");
    let (pump, mut payloads) = push_receiver("test-sink");
    let mut rows = 0u64;
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let pull_started = Instant::now();
        match handle
            .pull(pump.clone(), 1000, Duration::from_millis(250))
            .await
        {
            Ok(()) => {
                assert!(
                    pull_started.elapsed() < Duration::from_secs(2),
                    "pull exceeded its timeout by too much"
                );
                while let Ok(payload) = payloads.try_recv() {
                    assert!(payload.total_size() <= 1);
                    rows += payload.total_size();
                }
            }
            Err(_) => break,
        }
        assert!(Instant::now() < deadline, "ticking source never finished");
    }
    while let Ok(payload) = payloads.try_recv() {
        rows += payload.total_size();
    }
    assert_eq!(rows, 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn demand_times_out_without_upstream_progress() {
    let (handle, _kind) = spawn_node(Box::new(NeverSource), ElementKind::Void);
    handle.start(vec![]).await.expect("start");
    let (pump, mut payloads) = push_receiver("test-sink");
    let pull_started = Instant::now();
    handle
        .pull(pump.clone(), 1000, Duration::from_millis(250))
        .await
        .expect("pull");
    let elapsed = pull_started.elapsed();
    assert!(elapsed >= Duration::from_millis(200), "completed too early");
    assert!(elapsed < Duration::from_secs(2), "completed too late");
    assert!(payloads.try_recv().is_err(), "no rows were available");
    handle.shutdown(ExitStatus::Normal);
    assert_eq!(handle.wait_ended().await, ExitStatus::Normal);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abort_fails_the_pipeline_and_spares_the_source() {
    let source_batches: Vec<EventBatch> = (0..5).map(|i| make_batch(i * 10..(i + 1) * 10)).collect();
    let (source, _kind) = spawn_node(Box::new(ValuesSource::new(source_batches)), ElementKind::Void);
    let (transform, _kind) = spawn_node(
        Box::new(AbortingTransform {
            abort_on: 3,
            message: "boom",
        }),
        ElementKind::Events,
    );
    transform
        .start(vec![source.clone()])
        .await
        .expect("start chain");
    let (pump, mut payloads) = push_receiver("test-sink");
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        match transform
            .pull(pump.clone(), 1000, Duration::from_millis(100))
            .await
        {
            Ok(()) => {
                while payloads.try_recv().is_ok() {}
            }
            Err(_) => break,
        }
        assert!(Instant::now() < deadline, "abort never surfaced");
    }
    match transform.wait_ended().await {
        ExitStatus::Failed(error) => {
            assert!(error.to_string().contains("boom"), "error was {error}");
        }
        ExitStatus::Normal => panic!("transform must fail"),
    }
    // The early-exit cascade shuts the source down normally.
    assert_eq!(source.wait_ended().await, ExitStatus::Normal);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abort_surfaces_through_the_driver() {
    let (sink, collected) = CollectSink::new();
    let pipeline = Pipeline::new(vec![
        Box::new(ValuesSource::new(
            (0..5).map(|i| make_batch(i * 10..(i + 1) * 10)).collect(),
        )),
        Box::new(AbortingTransform {
            abort_on: 3,
            message: "boom",
        }),
        Box::new(sink),
    ])
    .expect("pipeline");
    let failure = driver().run(pipeline).await.expect_err("pipeline fails");
    assert!(
        failure.error.to_string().contains("boom"),
        "error was {}",
        failure.error
    );
    assert!(
        failure
            .diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error && d.message.contains("boom")),
        "diagnostics were {:?}",
        failure.diagnostics
    );
    // Nothing from the fourth or later batch reaches the sink.
    let collected = collected.lock().expect("collected lock");
    assert!(
        collected.iter().flat_map(batch_values).all(|v| v < 30),
        "late rows leaked past the abort"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backpressure_bounds_the_outbound_buffer() {
    let produced = Arc::new(AtomicU64::new(0));
    let batches: Vec<EventBatch> = (0..100).map(|_| make_batch(0..10_000)).collect();
    let (handle, _kind) = spawn_node(
        Box::new(ValuesSource::counting(batches, Arc::clone(&produced))),
        ElementKind::Void,
    );
    handle.start(vec![]).await.expect("start");
    let (pump, mut payloads) = push_receiver("test-sink");
    let mut delivered = 0u64;
    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        match handle
            .pull(pump.clone(), 1000, Duration::from_millis(250))
            .await
        {
            Ok(()) => {
                while let Ok(payload) = payloads.try_recv() {
                    delivered += payload.total_size();
                }
                // The buffer itself stays under MAX_BUFFERED plus the batch
                // that crossed the bound; allow for deliveries still in
                // flight toward this test.
                let in_flight = produced.load(Ordering::Relaxed).saturating_sub(delivered);
                assert!(
                    in_flight <= EventBatch::MAX_BUFFERED + 20_000,
                    "outbound buffer overran its bound: {in_flight}"
                );
            }
            Err(_) => break,
        }
        assert!(Instant::now() < deadline, "drain did not finish in time");
    }
    while let Ok(payload) = payloads.try_recv() {
        delivered += payload.total_size();
    }
    assert_eq!(delivered, 1_000_000, "rows were dropped under backpressure");
    assert_eq!(produced.load(Ordering::Relaxed), 1_000_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_pull_is_a_protocol_error() {
    let (handle, _kind) = spawn_node(Box::new(NeverSource), ElementKind::Void);
    handle.start(vec![]).await.expect("start");
    let (pump, _payloads) = push_receiver("test-sink");
    let first = {
        let handle = handle.clone();
        let pump = pump.clone();
        tokio::spawn(async move { handle.pull(pump, 1000, Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    let err = handle
        .pull(pump.clone(), 1000, Duration::from_secs(5))
        .await
        .expect_err("second pull must fail");
    assert!(
        matches!(&err, Error::Logic(message) if message.contains("concurrent pull")),
        "error was {err}"
    );
    handle.shutdown(ExitStatus::Normal);
    let _ = first.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sinks_must_not_be_pulled() {
    let (source, _kind) = spawn_node(Box::new(NeverSource), ElementKind::Void);
    let (sink_op, _collected) = CollectSink::new();
    let (sink, kind) = spawn_node(Box::new(sink_op), ElementKind::Events);
    assert_eq!(kind, ElementKind::Void);
    sink.start(vec![source.clone()]).await.expect("start");
    let (pump, _payloads) = push_receiver("test-sink");
    let err = sink
        .pull(pump, 1000, Duration::from_millis(100))
        .await
        .expect_err("pulling a sink must fail");
    assert!(matches!(err, Error::Logic(_)), "error was {err}");
    sink.shutdown(ExitStatus::Normal);
    source.shutdown(ExitStatus::Normal);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn push_protocol_violations_are_logic_errors() {
    let (source, _kind) = spawn_node(Box::new(NeverSource), ElementKind::Void);
    let (transform, _kind) = spawn_node(Box::new(PassOperator::events()), ElementKind::Events);
    transform
        .start(vec![source.clone()])
        .await
        .expect("start chain");

    // Sources accept no input at all.
    let err = source
        .push(Payload::Events(vec![make_batch(0..1)]))
        .await
        .expect_err("pushing a source must fail");
    assert!(matches!(err, Error::Logic(_)));

    // An empty batch list carries no data.
    let err = transform
        .push(Payload::Events(Vec::new()))
        .await
        .expect_err("empty push must fail");
    assert!(
        matches!(&err, Error::Logic(message) if message.contains("empty batch")),
        "error was {err}"
    );

    // Element kinds must match the receiving endpoint.
    let err = transform
        .push(Payload::Bytes(vec![ByteChunk::new(Bytes::from_static(
            b"xyz",
        ))]))
        .await
        .expect_err("kind mismatch must fail");
    assert!(matches!(err, Error::Logic(_)));

    // Overflowing the inbound buffer is rejected, not absorbed.
    let oversized = make_batch(0..(EventBatch::MAX_BUFFERED as i64 + 1));
    let err = transform
        .push(Payload::Events(vec![oversized]))
        .await
        .expect_err("overflow must fail");
    assert!(
        matches!(&err, Error::Logic(message) if message.contains("inbound buffer full")),
        "error was {err}"
    );

    transform.shutdown(ExitStatus::Normal);
    source.shutdown(ExitStatus::Normal);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn start_protocol_violations_are_logic_errors() {
    // Starting twice.
    let (source, _kind) = spawn_node(Box::new(NeverSource), ElementKind::Void);
    source.start(vec![]).await.expect("first start");
    let err = source.start(vec![]).await.expect_err("second start");
    assert!(
        matches!(&err, Error::Logic(message) if message.contains("already started")),
        "error was {err}"
    );

    // A source must not be handed an upstream.
    let (other, _kind) = spawn_node(Box::new(NeverSource), ElementKind::Void);
    let (stray, _kind) = spawn_node(Box::new(NeverSource), ElementKind::Void);
    let err = other
        .start(vec![stray.clone()])
        .await
        .expect_err("source with upstream");
    assert!(matches!(err, Error::Logic(_)));

    // A transformation needs one.
    let (transform, _kind) = spawn_node(Box::new(PassOperator::events()), ElementKind::Events);
    let err = transform.start(vec![]).await.expect_err("no upstream");
    assert!(matches!(err, Error::Logic(_)));

    for handle in [&source, &other, &stray, &transform] {
        handle.shutdown(ExitStatus::Normal);
    }
}

struct RemoteSource;

impl Operator for RemoteSource {
    fn name(&self) -> &str {
        "remote-values"
    }

    fn input_kind(&self) -> ElementKind {
        ElementKind::Void
    }

    fn output_kind(&self, _input: ElementKind) -> Result<ElementKind> {
        Ok(ElementKind::Events)
    }

    fn location(&self) -> OperatorLocation {
        OperatorLocation::Remote
    }

    fn instantiate(&self, _input: OperatorInput, _ctrl: ControlPlane) -> Result<OperatorOutput> {
        Ok(OperatorOutput::Events(Box::pin(futures::stream::empty())))
    }
}

struct FailingInstantiate;

impl Operator for FailingInstantiate {
    fn name(&self) -> &str {
        "fail-setup"
    }

    fn input_kind(&self) -> ElementKind {
        ElementKind::Void
    }

    fn output_kind(&self, _input: ElementKind) -> Result<ElementKind> {
        Ok(ElementKind::Events)
    }

    fn instantiate(&self, _input: OperatorInput, ctrl: ControlPlane) -> Result<OperatorOutput> {
        ctrl.abort(Error::Unspecified("bad configuration".to_string()));
        Ok(OperatorOutput::Events(Box::pin(futures::stream::empty())))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_operators_require_a_cluster_handle() {
    let (diag_tx, _diag_rx) = diagnostic_channel();
    let err = spawn_exec_node(
        Box::new(RemoteSource),
        ElementKind::Void,
        Arc::new(EngineContext::default()),
        diag_tx,
    )
    .expect_err("remote without cluster");
    assert!(matches!(err, Error::Logic(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abort_during_instantiation_fails_start() {
    let (handle, _kind) = spawn_node(Box::new(FailingInstantiate), ElementKind::Void);
    let err = handle.start(vec![]).await.expect_err("start must fail");
    assert!(
        err.to_string().contains("bad configuration"),
        "error was {err}"
    );
}
