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
use thiserror::Error as ThisError;

/// Errors produced by the pipeline execution core.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum Error {
    /// A violation of the execution protocol, e.g. a concurrent pull, an
    /// empty push, or a push that would overflow the inbound buffer. Fatal
    /// at the offending node.
    #[error("logic error: {0}")]
    Logic(String),

    /// Carries an error that has already been reported through the
    /// diagnostic channel, so observers must not report it again. Displays
    /// as the bare message.
    #[error("{0}")]
    Silent(String),

    /// A failure without a more specific classification, e.g. a wrapped
    /// upstream exit reason.
    #[error("{0}")]
    Unspecified(String),

    /// The peer's mailbox is gone. On the pull path this is end-of-stream,
    /// not a failure.
    #[error("receiver down")]
    ReceiverDown,
}

impl Error {
    pub fn is_silent(&self) -> bool {
        matches!(self, Error::Silent(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
