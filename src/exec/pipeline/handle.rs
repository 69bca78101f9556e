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
//! The asynchronous protocol between neighboring execution nodes.
//!
//! Responsibilities:
//! - Defines the node mailbox messages (`start`, `pull`, `push`, shutdown,
//!   and the node-internal completions).
//! - Provides `NodeHandle`, the cloneable address of a node, with request
//!   helpers that map a vanished peer to `Error::ReceiverDown`.
//! - Publishes node termination through a lifecycle watch, the supervision
//!   channel peers monitor instead of holding strong references.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use crate::exec::element::Payload;
use crate::exec::error::{Error, Result};

/// How a node ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    Normal,
    Failed(Error),
}

#[derive(Clone, Debug)]
pub enum Lifecycle {
    Running,
    Ended(ExitStatus),
}

pub(crate) type ReplySender = oneshot::Sender<Result<()>>;

pub(crate) enum NodeMsg {
    /// Initiates the chain from sink toward source. `chain` holds the
    /// upstream nodes in dependency order; the receiver takes the last one
    /// as its upstream.
    Start {
        chain: Vec<NodeHandle>,
        reply: ReplySender,
    },
    /// Downstream requests up to `batch_size` elements, delivered as pushes
    /// to `sink` within roughly `batch_timeout`.
    Pull {
        sink: NodeHandle,
        batch_size: u64,
        batch_timeout: Duration,
        reply: ReplySender,
    },
    /// Upstream delivers batches.
    Push {
        payload: Payload,
        reply: ReplySender,
    },
    /// Best-effort request to stop, e.g. early shutdown from a completed
    /// downstream node.
    Shutdown { status: ExitStatus },
    /// The monitored upstream node ended.
    UpstreamDown { status: ExitStatus },
    /// A sink's deferred start of its upstream finished.
    UpstreamStarted { result: Result<()> },
    /// The reply to an outstanding upstream pull arrived.
    PullReplied { result: Result<()> },
    /// The reply to an asynchronously delivered push arrived.
    PushReplied { result: Result<()>, delivered: u64 },
    /// A coalesced run step.
    Run,
    /// Re-schedule request from the operator's waker or the control plane.
    Wake,
}

/// The address of an execution node: its mailbox plus the lifecycle watch
/// used for monitoring. Holding a handle does not keep the node running.
#[derive(Clone)]
pub struct NodeHandle {
    pub(crate) tx: mpsc::UnboundedSender<NodeMsg>,
    pub(crate) lifecycle: watch::Receiver<Lifecycle>,
    pub(crate) name: Arc<str>,
}

impl NodeHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn start(&self, chain: Vec<NodeHandle>) -> Result<()> {
        self.request(|reply| NodeMsg::Start { chain, reply }).await
    }

    pub async fn pull(
        &self,
        sink: NodeHandle,
        batch_size: u64,
        batch_timeout: Duration,
    ) -> Result<()> {
        self.request(|reply| NodeMsg::Pull {
            sink,
            batch_size,
            batch_timeout,
            reply,
        })
        .await
    }

    pub async fn push(&self, payload: Payload) -> Result<()> {
        self.request(|reply| NodeMsg::Push { payload, reply }).await
    }

    pub fn shutdown(&self, status: ExitStatus) {
        let _ = self.tx.send(NodeMsg::Shutdown { status });
    }

    /// Resolves once the node has ended. A node that vanished without an
    /// announcement counts as receiver-down.
    pub async fn wait_ended(&self) -> ExitStatus {
        let mut lifecycle = self.lifecycle.clone();
        loop {
            if let Lifecycle::Ended(status) = &*lifecycle.borrow_and_update() {
                return status.clone();
            }
            if lifecycle.changed().await.is_err() {
                return match &*lifecycle.borrow() {
                    Lifecycle::Ended(status) => status.clone(),
                    Lifecycle::Running => ExitStatus::Failed(Error::ReceiverDown),
                };
            }
        }
    }

    pub fn ended(&self) -> Option<ExitStatus> {
        match &*self.lifecycle.borrow() {
            Lifecycle::Ended(status) => Some(status.clone()),
            Lifecycle::Running => None,
        }
    }

    async fn request(&self, make: impl FnOnce(ReplySender) -> NodeMsg) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .map_err(|_| Error::ReceiverDown)?;
        reply_rx.await.unwrap_or(Err(Error::ReceiverDown))
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Creates a consumer endpoint that looks like a node to its upstream. Used
/// by the pipeline driver when it acts as the sink of an open pipeline, and
/// by tests.
///
/// Each push is acknowledged only after its payload is queued on the
/// returned receiver, so a resolved pull implies its deliveries are already
/// observable.
pub fn push_receiver(name: &str) -> (NodeHandle, mpsc::UnboundedReceiver<Payload>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (lifecycle_tx, lifecycle_rx) = watch::channel(Lifecycle::Running);
    let handle = NodeHandle {
        tx,
        lifecycle: lifecycle_rx,
        name: name.into(),
    };
    let (payload_tx, payload_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let _lifecycle = lifecycle_tx;
        while let Some(msg) = rx.recv().await {
            match msg {
                NodeMsg::Push { payload, reply } => {
                    let forwarded = payload_tx.send(payload).is_ok();
                    let _ = reply.send(Ok(()));
                    if !forwarded {
                        break;
                    }
                }
                NodeMsg::Start { reply, .. } | NodeMsg::Pull { reply, .. } => {
                    let _ = reply.send(Err(Error::Logic(
                        "push receivers only accept pushes".to_string(),
                    )));
                }
                _ => {}
            }
        }
    });
    (handle, payload_rx)
}
