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
//! Pipeline structure and the pre-execution optimization pass.
//!
//! Responsibilities:
//! - Represents one pipeline as an ordered operator sequence whose adjacent
//!   endpoint kinds agree.
//! - Runs the right-to-left optimization handshake that lets operators
//!   absorb downstream filters and elides optimized no-ops.
use crate::exec::element::ElementKind;
use crate::exec::error::{Error, Result};
use crate::exec::operator::{EventOrder, Operator, Predicate, Replacement};

/// An ordered sequence of operators. The first operator's input kind is
/// `void`; a pipeline whose final output kind is also `void` is closed and
/// can run on its own.
pub struct Pipeline {
    operators: Vec<Box<dyn Operator>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("operators", &self.operators.iter().map(|op| op.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl Pipeline {
    pub fn new(operators: Vec<Box<dyn Operator>>) -> Result<Self> {
        if operators.is_empty() {
            return Err(Error::Logic(
                "pipeline must contain at least one operator".to_string(),
            ));
        }
        let mut kind = ElementKind::Void;
        for op in &operators {
            if op.input_kind() != kind {
                return Err(Error::Logic(format!(
                    "`{}` expects {} input, but its upstream produces {}",
                    op.name(),
                    op.input_kind(),
                    kind
                )));
            }
            kind = op.output_kind(kind)?;
        }
        Ok(Self { operators })
    }

    pub fn operators(&self) -> &[Box<dyn Operator>] {
        &self.operators
    }

    pub(crate) fn into_operators(self) -> Vec<Box<dyn Operator>> {
        self.operators
    }

    /// The element kind leaving the last operator.
    pub fn output_kind(&self) -> Result<ElementKind> {
        let mut kind = ElementKind::Void;
        for op in &self.operators {
            kind = op.output_kind(kind)?;
        }
        Ok(kind)
    }

    /// Whether the pipeline ends in a sink and can run without an external
    /// consumer.
    pub fn is_closed(&self) -> bool {
        matches!(self.output_kind(), Ok(ElementKind::Void))
    }

    /// Walks the operators from sink to source, offering each the filter and
    /// ordering requested by its downstream neighbor. Elided no-ops are
    /// dropped, replacements substituted. Returns the optimized pipeline
    /// together with any predicate no operator absorbed; with the expression
    /// language external to this crate, materializing a residual filter is
    /// the caller's concern.
    pub fn optimize(
        self,
        filter: Option<Predicate>,
        order: EventOrder,
    ) -> (Self, Option<Predicate>, EventOrder) {
        let mut filter = filter;
        let mut order = order;
        let mut kept: Vec<Box<dyn Operator>> = Vec::with_capacity(self.operators.len());
        for op in self.operators.into_iter().rev() {
            let result = op.optimize(filter.as_ref(), order);
            match result.replacement {
                Replacement::Keep => kept.push(op),
                Replacement::Elide => {}
                Replacement::Replace(replacement) => kept.push(replacement),
            }
            filter = result.filter;
            order = result.order;
        }
        kept.reverse();
        (Self { operators: kept }, filter, order)
    }
}
