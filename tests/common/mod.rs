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
//! Dummy operators and batch helpers shared by the execution tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use arrow::array::{Int64Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema};
use futures::StreamExt;
use futures::stream;

use sluice::exec::element::{ByteChunk, Element, ElementKind, EventBatch, Payload};
use sluice::exec::error::{Error, Result};
use sluice::exec::operator::{Operator, OperatorInput, OperatorOutput};
use sluice::exec::pipeline::control_plane::ControlPlane;

pub fn make_batch(values: std::ops::Range<i64>) -> EventBatch {
    let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
    let array = Int64Array::from_iter_values(values);
    EventBatch::new(RecordBatch::try_new(schema, vec![Arc::new(array)]).expect("record batch"))
}

pub fn batch_values(batch: &EventBatch) -> Vec<i64> {
    batch
        .record_batch()
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("int64 column")
        .values()
        .to_vec()
}

pub fn payload_values(payload: &Payload) -> Vec<i64> {
    match payload {
        Payload::Events(batches) => batches.iter().flat_map(batch_values).collect(),
        Payload::Bytes(_) => panic!("expected events payload"),
    }
}

pub fn payload_bytes(payload: &Payload) -> Vec<u8> {
    match payload {
        Payload::Bytes(chunks) => chunks.iter().flat_map(|c| c.bytes().to_vec()).collect(),
        Payload::Events(_) => panic!("expected bytes payload"),
    }
}

/// A source that yields a fixed list of event batches, optionally counting
/// the rows it has produced so far.
pub struct ValuesSource {
    batches: Vec<EventBatch>,
    produced_rows: Option<Arc<AtomicU64>>,
    detached: bool,
}

impl ValuesSource {
    pub fn new(batches: Vec<EventBatch>) -> Self {
        Self {
            batches,
            produced_rows: None,
            detached: false,
        }
    }

    pub fn counting(batches: Vec<EventBatch>, produced_rows: Arc<AtomicU64>) -> Self {
        Self {
            batches,
            produced_rows: Some(produced_rows),
            detached: false,
        }
    }

    pub fn detached(batches: Vec<EventBatch>) -> Self {
        Self {
            batches,
            produced_rows: None,
            detached: true,
        }
    }
}

impl Operator for ValuesSource {
    fn name(&self) -> &str {
        "values"
    }

    fn input_kind(&self) -> ElementKind {
        ElementKind::Void
    }

    fn output_kind(&self, _input: ElementKind) -> Result<ElementKind> {
        Ok(ElementKind::Events)
    }

    fn detached(&self) -> bool {
        self.detached
    }

    fn instantiate(&self, _input: OperatorInput, _ctrl: ControlPlane) -> Result<OperatorOutput> {
        let counter = self.produced_rows.clone();
        let stream = stream::iter(self.batches.clone()).inspect(move |batch| {
            if let Some(counter) = &counter {
                counter.fetch_add(batch.size(), Ordering::Relaxed);
            }
        });
        Ok(OperatorOutput::Events(Box::pin(stream)))
    }
}

/// A source that yields a fixed list of byte chunks.
pub struct ChunkSource {
    chunks: Vec<ByteChunk>,
}

impl ChunkSource {
    pub fn new(chunks: Vec<ByteChunk>) -> Self {
        Self { chunks }
    }
}

impl Operator for ChunkSource {
    fn name(&self) -> &str {
        "chunks"
    }

    fn input_kind(&self) -> ElementKind {
        ElementKind::Void
    }

    fn output_kind(&self, _input: ElementKind) -> Result<ElementKind> {
        Ok(ElementKind::Bytes)
    }

    fn instantiate(&self, _input: OperatorInput, _ctrl: ControlPlane) -> Result<OperatorOutput> {
        Ok(OperatorOutput::Bytes(Box::pin(stream::iter(
            self.chunks.clone(),
        ))))
    }
}

/// A source that never produces a row; every advance is a cooperative empty
/// yield. Keeps downstream nodes alive for protocol tests.
pub struct NeverSource;

impl Operator for NeverSource {
    fn name(&self) -> &str {
        "never"
    }

    fn input_kind(&self) -> ElementKind {
        ElementKind::Void
    }

    fn output_kind(&self, _input: ElementKind) -> Result<ElementKind> {
        Ok(ElementKind::Events)
    }

    fn instantiate(&self, _input: OperatorInput, _ctrl: ControlPlane) -> Result<OperatorOutput> {
        let stream = stream::unfold((), |()| async move { Some((EventBatch::default(), ())) });
        Ok(OperatorOutput::Events(Box::pin(stream)))
    }
}

/// A source emitting one single-row batch per interval, suspending with
/// empty yields in between.
pub struct TickingSource {
    pub interval: Duration,
    pub count: usize,
}

impl Operator for TickingSource {
    fn name(&self) -> &str {
        "tick"
    }

    fn input_kind(&self) -> ElementKind {
        ElementKind::Void
    }

    fn output_kind(&self, _input: ElementKind) -> Result<ElementKind> {
        Ok(ElementKind::Events)
    }

    fn instantiate(&self, _input: OperatorInput, _ctrl: ControlPlane) -> Result<OperatorOutput> {
        let interval = self.interval;
        let count = self.count;
        let state = (Instant::now() + interval, 0usize);
        let stream = stream::unfold(state, move |(next_at, emitted)| async move {
            if emitted == count {
                return None;
            }
            if Instant::now() < next_at {
                return Some((EventBatch::default(), (next_at, emitted)));
            }
            let batch = make_batch(emitted as i64..emitted as i64 + 1);
            Some((batch, (next_at + interval, emitted + 1)))
        });
        Ok(OperatorOutput::Events(Box::pin(stream)))
    }
}

/// Identity transform over either element kind.
pub struct PassOperator {
    kind: ElementKind,
}

impl PassOperator {
    pub fn events() -> Self {
        Self {
            kind: ElementKind::Events,
        }
    }

    pub fn bytes() -> Self {
        Self {
            kind: ElementKind::Bytes,
        }
    }
}

impl Operator for PassOperator {
    fn name(&self) -> &str {
        "pass"
    }

    fn input_kind(&self) -> ElementKind {
        self.kind
    }

    fn output_kind(&self, input: ElementKind) -> Result<ElementKind> {
        if input != self.kind {
            return Err(Error::Logic(format!(
                "`pass` configured for {} cannot accept {}",
                self.kind, input
            )));
        }
        Ok(input)
    }

    fn instantiate(&self, input: OperatorInput, _ctrl: ControlPlane) -> Result<OperatorOutput> {
        match input {
            OperatorInput::Events(stream) => Ok(OperatorOutput::Events(stream)),
            OperatorInput::Bytes(stream) => Ok(OperatorOutput::Bytes(stream)),
            OperatorInput::Void => Err(Error::Logic("`pass` requires an input".to_string())),
        }
    }
}

/// Passes events through and aborts on the nth non-empty input batch.
pub struct AbortingTransform {
    pub abort_on: usize,
    pub message: &'static str,
}

impl Operator for AbortingTransform {
    fn name(&self) -> &str {
        "abort-after"
    }

    fn input_kind(&self) -> ElementKind {
        ElementKind::Events
    }

    fn output_kind(&self, _input: ElementKind) -> Result<ElementKind> {
        Ok(ElementKind::Events)
    }

    fn instantiate(&self, input: OperatorInput, ctrl: ControlPlane) -> Result<OperatorOutput> {
        let OperatorInput::Events(input) = input else {
            return Err(Error::Logic("`abort-after` expects events".to_string()));
        };
        let abort_on = self.abort_on;
        let message = self.message;
        let state = (input, ctrl, 0usize);
        let stream = stream::unfold(state, move |(mut input, ctrl, mut seen)| async move {
            let batch = input.next().await?;
            if batch.size() > 0 {
                seen += 1;
                if seen == abort_on {
                    ctrl.abort(Error::Unspecified(message.to_string()));
                }
            }
            Some((batch, (input, ctrl, seen)))
        });
        Ok(OperatorOutput::Events(Box::pin(stream)))
    }
}

/// A sink that stores every non-empty batch it consumes.
pub struct CollectSink {
    collected: Arc<Mutex<Vec<EventBatch>>>,
}

impl CollectSink {
    pub fn new() -> (Self, Arc<Mutex<Vec<EventBatch>>>) {
        let collected = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                collected: Arc::clone(&collected),
            },
            collected,
        )
    }
}

impl Operator for CollectSink {
    fn name(&self) -> &str {
        "collect"
    }

    fn input_kind(&self) -> ElementKind {
        ElementKind::Events
    }

    fn output_kind(&self, _input: ElementKind) -> Result<ElementKind> {
        Ok(ElementKind::Void)
    }

    fn instantiate(&self, input: OperatorInput, _ctrl: ControlPlane) -> Result<OperatorOutput> {
        let OperatorInput::Events(input) = input else {
            return Err(Error::Logic("`collect` expects events".to_string()));
        };
        let collected = Arc::clone(&self.collected);
        let stream = stream::unfold(input, move |mut input| {
            let collected = Arc::clone(&collected);
            async move {
                let batch = input.next().await?;
                if batch.size() > 0 {
                    collected.lock().expect("collected lock").push(batch);
                }
                Some(((), input))
            }
        });
        Ok(OperatorOutput::Void(Box::pin(stream)))
    }
}
