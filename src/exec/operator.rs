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
//! The contract every pipeline operator implements.
//!
//! Responsibilities:
//! - Declares an operator's endpoint kinds, placement, and scheduling hints.
//! - Defines the instantiation surface: input and output generators are lazy
//!   streams that suspend cooperatively by yielding empty batches.
//! - Defines the pre-execution optimization handshake used by the driver.
use std::fmt;
use std::sync::Arc;

use futures::stream::BoxStream;

use crate::exec::element::{ByteChunk, ElementKind, EventBatch};
use crate::exec::error::Result;
use crate::exec::pipeline::control_plane::ControlPlane;

/// Where an operator prefers to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatorLocation {
    Local,
    Remote,
}

/// Whether downstream consumers depend on event order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventOrder {
    Ordered,
    Unordered,
}

/// An opaque filter expression. The core never interprets predicates; they
/// travel through the optimization pass so operators that understand them can
/// absorb them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Predicate {
    text: Arc<str>,
}

impl Predicate {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into().into(),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

/// What becomes of an operator during the driver's optimization pass.
pub enum Replacement {
    /// Keep the operator as-is.
    Keep,
    /// The operator is a no-op under the given filter and order; drop it.
    Elide,
    /// Substitute a different operator, e.g. one that absorbed the filter.
    Replace(Box<dyn Operator>),
}

/// Result of asking an operator to absorb a downstream filter and observe
/// the requested ordering. `filter` is what remains to be applied upstream
/// of the (possibly replaced) operator.
pub struct OptimizeResult {
    pub filter: Option<Predicate>,
    pub order: EventOrder,
    pub replacement: Replacement,
}

impl OptimizeResult {
    /// The conservative default: absorb nothing, demand ordered input, keep
    /// the operator.
    pub fn keep() -> Self {
        Self {
            filter: None,
            order: EventOrder::Ordered,
            replacement: Replacement::Keep,
        }
    }
}

pub type ElementStream<T> = BoxStream<'static, T>;

/// The input side handed to an operator at instantiation. Empty for sources.
/// Data streams yield a zero-size batch when the node has no input buffered
/// but more may arrive; they end when the upstream is gone and the buffer is
/// drained.
pub enum OperatorInput {
    Void,
    Events(ElementStream<EventBatch>),
    Bytes(ElementStream<ByteChunk>),
}

impl OperatorInput {
    pub fn kind(&self) -> ElementKind {
        match self {
            OperatorInput::Void => ElementKind::Void,
            OperatorInput::Events(_) => ElementKind::Events,
            OperatorInput::Bytes(_) => ElementKind::Bytes,
        }
    }
}

/// The generator returned by an operator. Sinks yield unit steps so the node
/// can drive them under the same advance budget as producing operators.
/// Yielding a zero-size batch (or a unit step without consuming input) is a
/// legitimate cooperative suspension; ending the stream means the operator
/// has no more output given its input.
pub enum OperatorOutput {
    Void(ElementStream<()>),
    Events(ElementStream<EventBatch>),
    Bytes(ElementStream<ByteChunk>),
}

impl OperatorOutput {
    pub fn kind(&self) -> ElementKind {
        match self {
            OperatorOutput::Void(_) => ElementKind::Void,
            OperatorOutput::Events(_) => ElementKind::Events,
            OperatorOutput::Bytes(_) => ElementKind::Bytes,
        }
    }
}

/// A pipeline operator. Implementations are values; the execution node owns
/// one instance and calls `instantiate` at most once.
pub trait Operator: Send + 'static {
    fn name(&self) -> &str;

    /// The element kind this operator consumes. `Void` marks a source.
    fn input_kind(&self) -> ElementKind;

    /// The element kind this operator produces for the given concrete input
    /// kind. Fails if the input kind is unsupported. `Void` marks a sink.
    fn output_kind(&self, input: ElementKind) -> Result<ElementKind>;

    fn location(&self) -> OperatorLocation {
        OperatorLocation::Local
    }

    /// Operators that request their own scheduling thread.
    fn detached(&self) -> bool {
        false
    }

    /// Creates the operator's output generator over the given input. Setup
    /// work runs here; a failure (returned or latched through `ctrl.abort`)
    /// fails the pipeline's start.
    fn instantiate(&self, input: OperatorInput, ctrl: ControlPlane) -> Result<OperatorOutput>;

    /// Lets the operator absorb a succeeding filter or declare itself a
    /// no-op. Called by the pipeline driver before execution, never by the
    /// execution node.
    fn optimize(&self, filter: Option<&Predicate>, order: EventOrder) -> OptimizeResult {
        let _ = (filter, order);
        OptimizeResult::keep()
    }
}
