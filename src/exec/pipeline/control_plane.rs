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
//! The per-node control plane handed to an operator at instantiation.
//!
//! Responsibilities:
//! - Carries the abort latch: a single-shot error cell written once by the
//!   operator or the node and read by the run loop at safe points.
//! - Forwards diagnostics to the pipeline's collector, latching an abort on
//!   the first error-severity diagnostic.
//! - Exposes the ambient typing context and configuration.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use arrow::datatypes::SchemaRef;
use tokio::sync::mpsc;

use crate::exec::context::{ClusterHandle, ConceptMap, EngineContext};
use crate::exec::diagnostics::{Diagnostic, DiagnosticHandler, DiagnosticSender, Severity};
use crate::exec::error::Error;
use crate::exec::pipeline::handle::NodeMsg;
use crate::sluice_logging::warn;

struct ControlPlaneInner {
    op_name: String,
    ctx: Arc<EngineContext>,
    abort: OnceLock<Error>,
    diagnostics: DiagnosticSender,
    seen_error: AtomicBool,
    wake: mpsc::UnboundedSender<NodeMsg>,
}

impl DiagnosticHandler for ControlPlaneInner {
    fn emit(&self, diagnostic: Diagnostic) {
        let severity = diagnostic.severity;
        let message = diagnostic.message.clone();
        if self.diagnostics.send(diagnostic).is_err() {
            warn!("`{}` failed to send diagnostic", self.op_name);
        }
        if severity == Severity::Error && !self.seen_error.swap(true, Ordering::AcqRel) {
            let _ = self.abort.set(Error::Silent(message));
            let _ = self.wake.send(NodeMsg::Wake);
        }
    }

    fn has_seen_error(&self) -> bool {
        self.seen_error.load(Ordering::Acquire)
    }
}

/// Escape hatch from an operator back into its execution node. Owned by the
/// node; cheap to clone into the operator's generator.
#[derive(Clone)]
pub struct ControlPlane {
    inner: Arc<ControlPlaneInner>,
}

impl ControlPlane {
    pub(crate) fn new(
        op_name: String,
        ctx: Arc<EngineContext>,
        diagnostics: DiagnosticSender,
        wake: mpsc::UnboundedSender<NodeMsg>,
    ) -> Self {
        Self {
            inner: Arc::new(ControlPlaneInner {
                op_name,
                ctx,
                abort: OnceLock::new(),
                diagnostics,
                seen_error: AtomicBool::new(false),
                wake,
            }),
        }
    }

    /// Latches the node's abort error. The first latched error wins; later
    /// calls are no-ops. Non-silent errors are also reported as an
    /// error-severity diagnostic annotated with the operator's name.
    pub fn abort(&self, error: Error) {
        let message = error.to_string();
        if !error.is_silent() {
            self.diagnostics().emit(
                Diagnostic::error(message.clone())
                    .with_note(format!("from `{}`", self.inner.op_name)),
            );
        }
        let _ = self.inner.abort.set(Error::Silent(message));
        let _ = self.inner.wake.send(NodeMsg::Wake);
    }

    /// Emits a warning-severity diagnostic annotated with the operator's
    /// name. Warnings never alter control flow.
    pub fn warn(&self, error: Error) {
        if !error.is_silent() {
            self.diagnostics().emit(
                Diagnostic::warning(error.to_string())
                    .with_note(format!("from `{}`", self.inner.op_name)),
            );
        }
    }

    pub fn diagnostics(&self) -> &dyn DiagnosticHandler {
        self.inner.as_ref()
    }

    pub fn schemas(&self) -> &[SchemaRef] {
        self.inner.ctx.schemas()
    }

    pub fn concepts(&self) -> &ConceptMap {
        self.inner.ctx.concepts()
    }

    pub fn allow_unsafe_pipelines(&self) -> bool {
        self.inner.ctx.options().allow_unsafe_pipelines
    }

    /// The cluster control handle, present when the pipeline runs against a
    /// cluster. Required only by operators declared `remote`.
    pub fn node(&self) -> Option<&ClusterHandle> {
        self.inner.ctx.cluster()
    }

    pub(crate) fn latched(&self) -> Option<Error> {
        self.inner.abort.get().cloned()
    }
}
