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
//! The pipeline driver: assembles, starts, pumps, and tears down one
//! pipeline run.
//!
//! Responsibilities:
//! - Applies the optimization pass, spawns one execution node per operator,
//!   and initiates the start cascade from the sink end.
//! - Awaits a closed pipeline's sink, or acts as the consumer of an open
//!   pipeline by pumping pulls against its terminal node.
//! - Sweeps shutdown across remaining nodes, drains diagnostics, and
//!   surfaces a single success/error result.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::exec::context::EngineContext;
use crate::exec::diagnostics::{Diagnostic, DiagnosticReceiver, diagnostic_channel};
use crate::exec::element::{ByteChunk, Element, ElementKind, EventBatch, Payload};
use crate::exec::error::{Error, Result};
use crate::exec::operator::EventOrder;
use crate::exec::pipeline::handle::{ExitStatus, NodeHandle, push_receiver};
use crate::exec::pipeline::node::{MAX_BATCH_TIMEOUT, spawn_exec_node};
use crate::exec::pipeline::pipeline::Pipeline;
use crate::sluice_logging::debug;

/// Terminal failure of one pipeline run: the first error plus everything the
/// diagnostic collector gathered along the way.
#[derive(Debug)]
pub struct PipelineError {
    pub error: Error,
    pub diagnostics: Vec<Diagnostic>,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for PipelineError {}

/// Executes pipelines against one engine context.
pub struct PipelineDriver {
    ctx: Arc<EngineContext>,
}

impl PipelineDriver {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Runs a pipeline to completion. A closed pipeline's sink drives its
    /// own demand; for an open pipeline the driver pumps the terminal node
    /// with the default batch size for its element kind, discarding the
    /// delivered payloads.
    pub async fn run(&self, pipeline: Pipeline) -> Result<Vec<Diagnostic>, PipelineError> {
        match pipeline.output_kind().map_err(|error| PipelineError {
            error,
            diagnostics: Vec::new(),
        })? {
            ElementKind::Void => self.execute(pipeline, None).await,
            kind => {
                let batch_size = default_pump_batch_size(kind);
                self.execute(
                    pipeline,
                    Some((batch_size, MAX_BATCH_TIMEOUT, &mut |_payload| {})),
                )
                .await
            }
        }
    }

    /// Runs an open pipeline, handing every delivered payload to
    /// `on_payload`. Fails with a logic error for closed pipelines, whose
    /// sink leaves nothing to pump.
    pub async fn run_with_output(
        &self,
        pipeline: Pipeline,
        batch_size: u64,
        batch_timeout: Duration,
        on_payload: &mut dyn FnMut(Payload),
    ) -> Result<Vec<Diagnostic>, PipelineError> {
        let kind = pipeline.output_kind().map_err(|error| PipelineError {
            error,
            diagnostics: Vec::new(),
        })?;
        if kind == ElementKind::Void {
            return Err(PipelineError {
                error: Error::Logic(
                    "closed pipelines deliver no output; use `run`".to_string(),
                ),
                diagnostics: Vec::new(),
            });
        }
        self.execute(pipeline, Some((batch_size, batch_timeout, on_payload)))
            .await
    }

    async fn execute(
        &self,
        pipeline: Pipeline,
        pump: Option<(u64, Duration, &mut dyn FnMut(Payload))>,
    ) -> Result<Vec<Diagnostic>, PipelineError> {
        let mut pre_diagnostics = Vec::new();
        let (pipeline, residual, _order) = pipeline.optimize(None, EventOrder::Ordered);
        if let Some(residual) = residual {
            // No operator absorbed this predicate and the core cannot
            // materialize filters itself.
            pre_diagnostics.push(
                Diagnostic::warning(format!("unabsorbed filter `{}` was ignored", residual))
                    .with_note("the optimization pass returned a residual predicate"),
            );
        }

        let (diag_tx, diag_rx) = diagnostic_channel();
        let mut handles: Vec<NodeHandle> = Vec::new();
        let mut kind = ElementKind::Void;
        for op in pipeline.into_operators() {
            match spawn_exec_node(op, kind, Arc::clone(&self.ctx), diag_tx.clone()) {
                Ok((handle, output_kind)) => {
                    handles.push(handle);
                    kind = output_kind;
                }
                Err(error) => {
                    drop(diag_tx);
                    let diagnostics =
                        teardown_and_drain(&handles, diag_rx, pre_diagnostics).await;
                    return Err(PipelineError { error, diagnostics });
                }
            }
        }
        // The driver keeps only the receiver; every node owns a sender.
        drop(diag_tx);

        // The optimization pass may have elided the whole pipeline.
        let Some(last) = handles.last().cloned() else {
            return Ok(teardown_and_drain(&handles, diag_rx, pre_diagnostics).await);
        };
        let chain = handles[..handles.len() - 1].to_vec();
        debug!("driver starts pipeline of {} nodes", handles.len());
        if let Err(error) = last.start(chain).await {
            let diagnostics = teardown_and_drain(&handles, diag_rx, pre_diagnostics).await;
            return Err(PipelineError { error, diagnostics });
        }

        let terminal_status = match pump {
            None => last.wait_ended().await,
            Some((batch_size, batch_timeout, on_payload)) => {
                pump_terminal(&last, batch_size, batch_timeout, on_payload).await
            }
        };
        debug!("driver observed terminal node exit: {:?}", terminal_status);

        let diagnostics = teardown_and_drain(&handles, diag_rx, pre_diagnostics).await;
        match terminal_status {
            ExitStatus::Normal => Ok(diagnostics),
            ExitStatus::Failed(error) => Err(PipelineError { error, diagnostics }),
        }
    }
}

fn default_pump_batch_size(kind: ElementKind) -> u64 {
    match kind {
        ElementKind::Bytes => ByteChunk::MAX_BATCH_SIZE,
        _ => EventBatch::MAX_BATCH_SIZE,
    }
}

/// The driver-side pump: repeatedly pulls the terminal node of an open
/// pipeline, forwarding payloads as they are pushed, until the node exits.
async fn pump_terminal(
    last: &NodeHandle,
    batch_size: u64,
    batch_timeout: Duration,
    on_payload: &mut dyn FnMut(Payload),
) -> ExitStatus {
    let (pump_handle, mut payloads) = push_receiver("pipeline-driver");
    let status = loop {
        match last.pull(pump_handle.clone(), batch_size, batch_timeout).await {
            Ok(()) => {
                while let Ok(payload) = payloads.try_recv() {
                    on_payload(payload);
                }
            }
            Err(error) => {
                debug!("driver pump stops after pull failure: {}", error);
                break last.wait_ended().await;
            }
        }
    };
    while let Ok(payload) = payloads.try_recv() {
        on_payload(payload);
    }
    status
}

/// Best-effort shutdown of every node, then a full drain of the diagnostic
/// channel. The drain terminates because node exits drop their senders.
async fn teardown_and_drain(
    handles: &[NodeHandle],
    mut diag_rx: DiagnosticReceiver,
    mut diagnostics: Vec<Diagnostic>,
) -> Vec<Diagnostic> {
    for handle in handles {
        handle.shutdown(ExitStatus::Normal);
    }
    for handle in handles {
        let _ = handle.wait_ended().await;
    }
    while let Some(diagnostic) = diag_rx.recv().await {
        diagnostics.push(diagnostic);
    }
    diagnostics
}
