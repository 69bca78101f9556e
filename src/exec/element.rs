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
//! The element model for data in transit between execution nodes.
//!
//! Responsibilities:
//! - Defines the two batch types that flow through pipelines: columnar event
//!   batches and opaque byte chunks, plus the uninhabited `Void` endpoint.
//! - Provides size measurement and zero-copy splitting for batches and for
//!   whole batch queues.
//! - Carries the per-kind scheduling tunables consumed by execution nodes.
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::{Schema, SchemaRef};
use bytes::Bytes;

use crate::exec::error::{Error, Result};

/// What crosses a node boundary: nothing, event batches, or byte chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementKind {
    Void,
    Events,
    Bytes,
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementKind::Void => write!(f, "void"),
            ElementKind::Events => write!(f, "events"),
            ElementKind::Bytes => write!(f, "bytes"),
        }
    }
}

/// A unit of data exchanged between execution nodes.
///
/// Splitting must not copy payload; both batch types are backed by
/// reference-counted buffers and slice cheaply.
pub trait Element: Clone + fmt::Debug + Send + Sync + 'static {
    const KIND: ElementKind;

    /// Upper bound for the batch size used when requesting a batch from the
    /// previous execution node.
    const MAX_BATCH_SIZE: u64;

    /// How much free capacity must be in the inbound buffer before the node
    /// requests further data.
    const MIN_BATCH_SIZE: u64;

    /// Upper bound for the inbound and outbound buffer of an execution node.
    const MAX_BUFFERED: u64;

    /// What the operator generator yields per advance: the element itself
    /// for data kinds, `()` for sinks.
    type Step: Send + 'static;

    /// Size in rows or bytes.
    fn size(&self) -> u64;

    /// A zero-size batch, used by the input adapter as a cooperative
    /// suspension marker.
    fn empty() -> Self;

    /// Partitions the batch at `at` without copying payload. `at` is clamped
    /// to `[0, size]`.
    fn split_at(&self, at: u64) -> (Self, Self);

    fn from_step(step: Self::Step) -> Option<Self>;

    fn into_payload(batches: Vec<Self>) -> Payload;

    fn from_payload(payload: Payload) -> Result<Vec<Self>>;
}

/// An immutable column-oriented set of rows with an associated schema.
#[derive(Clone, Debug)]
pub struct EventBatch {
    batch: RecordBatch,
}

impl EventBatch {
    pub fn new(batch: RecordBatch) -> Self {
        Self { batch }
    }

    pub fn rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn record_batch(&self) -> &RecordBatch {
        &self.batch
    }

    /// Rows in `[begin, end)`, sharing the underlying column buffers.
    pub fn subslice(&self, begin: usize, end: usize) -> Self {
        let end = end.min(self.rows());
        let begin = begin.min(end);
        Self {
            batch: self.batch.slice(begin, end - begin),
        }
    }
}

impl Default for EventBatch {
    fn default() -> Self {
        Self {
            batch: RecordBatch::new_empty(Arc::new(Schema::empty())),
        }
    }
}

impl Element for EventBatch {
    const KIND: ElementKind = ElementKind::Events;
    const MAX_BATCH_SIZE: u64 = 64 * 1024;
    const MIN_BATCH_SIZE: u64 = 8 * 1024;
    const MAX_BUFFERED: u64 = 254 * 1024;

    type Step = EventBatch;

    fn size(&self) -> u64 {
        self.rows() as u64
    }

    fn empty() -> Self {
        Self::default()
    }

    fn split_at(&self, at: u64) -> (Self, Self) {
        let at = (at as usize).min(self.rows());
        (self.subslice(0, at), self.subslice(at, self.rows()))
    }

    fn from_step(step: Self::Step) -> Option<Self> {
        Some(step)
    }

    fn into_payload(batches: Vec<Self>) -> Payload {
        Payload::Events(batches)
    }

    fn from_payload(payload: Payload) -> Result<Vec<Self>> {
        match payload {
            Payload::Events(batches) => Ok(batches),
            other => Err(Error::Logic(format!(
                "expected events batches, got {}",
                other.kind()
            ))),
        }
    }
}

/// An immutable reference-counted byte buffer.
#[derive(Clone, Debug, Default)]
pub struct ByteChunk {
    data: Bytes,
}

impl ByteChunk {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    /// `length` bytes starting at `offset`, sharing the underlying buffer.
    pub fn slice(&self, offset: usize, length: usize) -> Self {
        let offset = offset.min(self.len());
        let length = length.min(self.len() - offset);
        Self {
            data: self.data.slice(offset..offset + length),
        }
    }
}

impl Element for ByteChunk {
    const KIND: ElementKind = ElementKind::Bytes;
    const MAX_BATCH_SIZE: u64 = 1024 * 1024;
    const MIN_BATCH_SIZE: u64 = 128 * 1024;
    const MAX_BUFFERED: u64 = 4 * 1024 * 1024;

    type Step = ByteChunk;

    fn size(&self) -> u64 {
        self.len() as u64
    }

    fn empty() -> Self {
        Self::default()
    }

    fn split_at(&self, at: u64) -> (Self, Self) {
        let at = (at as usize).min(self.len());
        (self.slice(0, at), self.slice(at, self.len() - at))
    }

    fn from_step(step: Self::Step) -> Option<Self> {
        Some(step)
    }

    fn into_payload(batches: Vec<Self>) -> Payload {
        Payload::Bytes(batches)
    }

    fn from_payload(payload: Payload) -> Result<Vec<Self>> {
        match payload {
            Payload::Bytes(chunks) => Ok(chunks),
            other => Err(Error::Logic(format!(
                "expected byte chunks, got {}",
                other.kind()
            ))),
        }
    }
}

/// The absent side of a source's input or a sink's output. Uninhabited, so a
/// void endpoint provably never carries a batch.
#[derive(Clone, Debug)]
pub enum Void {}

impl Element for Void {
    const KIND: ElementKind = ElementKind::Void;
    const MAX_BATCH_SIZE: u64 = 0;
    const MIN_BATCH_SIZE: u64 = 0;
    const MAX_BUFFERED: u64 = 0;

    type Step = ();

    fn size(&self) -> u64 {
        match *self {}
    }

    fn empty() -> Self {
        unreachable!("void elements cannot be constructed")
    }

    fn split_at(&self, _at: u64) -> (Self, Self) {
        match *self {}
    }

    fn from_step(_step: Self::Step) -> Option<Self> {
        None
    }

    fn into_payload(mut batches: Vec<Self>) -> Payload {
        match batches.pop() {
            Some(batch) => match batch {},
            None => unreachable!("void endpoints cannot carry batches"),
        }
    }

    fn from_payload(_payload: Payload) -> Result<Vec<Self>> {
        Err(Error::Logic(
            "void endpoints cannot carry batches".to_string(),
        ))
    }
}

/// The dynamically typed batch list carried by a push between nodes.
#[derive(Clone, Debug)]
pub enum Payload {
    Events(Vec<EventBatch>),
    Bytes(Vec<ByteChunk>),
}

impl Payload {
    pub fn kind(&self) -> ElementKind {
        match self {
            Payload::Events(_) => ElementKind::Events,
            Payload::Bytes(_) => ElementKind::Bytes,
        }
    }

    pub fn batch_count(&self) -> usize {
        match self {
            Payload::Events(batches) => batches.len(),
            Payload::Bytes(chunks) => chunks.len(),
        }
    }

    pub fn total_size(&self) -> u64 {
        match self {
            Payload::Events(batches) => batches.iter().map(Element::size).sum(),
            Payload::Bytes(chunks) => chunks.iter().map(Element::size).sum(),
        }
    }
}

/// Partitions a batch queue at `at` total size, splitting the straddling
/// batch if the boundary falls inside one. Batch order and content are
/// preserved; no payload is copied.
pub fn split_buffer<T: Element>(mut buffer: VecDeque<T>, at: u64) -> (VecDeque<T>, VecDeque<T>) {
    let mut prefix = VecDeque::new();
    let mut remaining = at;
    while remaining > 0 {
        let Some(next) = buffer.pop_front() else {
            break;
        };
        let size = next.size();
        if remaining >= size {
            remaining -= size;
            prefix.push_back(next);
        } else {
            let (lhs, rhs) = next.split_at(remaining);
            prefix.push_back(lhs);
            buffer.push_front(rhs);
            remaining = 0;
        }
    }
    (prefix, buffer)
}

/// The first `at` total size of a batch queue, without consuming it. Used to
/// assemble a push while the buffer stays in place until the reply arrives.
pub fn buffer_prefix<T: Element>(buffer: &VecDeque<T>, at: u64) -> Vec<T> {
    let mut prefix = Vec::new();
    let mut remaining = at;
    for next in buffer {
        if remaining == 0 {
            break;
        }
        let size = next.size();
        if remaining >= size {
            remaining -= size;
            prefix.push(next.clone());
        } else {
            let (lhs, _) = next.split_at(remaining);
            prefix.push(lhs);
            remaining = 0;
        }
    }
    prefix
}
