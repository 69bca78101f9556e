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
//! Out-of-band diagnostics emitted by operators and execution nodes.
use std::fmt;

use tokio::sync::mpsc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// A structured message flowing out of band to the diagnostic collector.
/// Diagnostics never alter control flow themselves; an error-severity
/// diagnostic additionally latches an abort on the emitting node.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub notes: Vec<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            notes: Vec::new(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
            notes: Vec::new(),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)?;
        for note in &self.notes {
            write!(f, "; {}", note)?;
        }
        Ok(())
    }
}

/// Receiver side of the diagnostic sink interface: anything that accepts a
/// diagnostic. The per-node handler tracks whether an error passed through.
pub trait DiagnosticHandler: Send + Sync {
    fn emit(&self, diagnostic: Diagnostic);

    fn has_seen_error(&self) -> bool {
        false
    }
}

pub type DiagnosticSender = mpsc::UnboundedSender<Diagnostic>;
pub type DiagnosticReceiver = mpsc::UnboundedReceiver<Diagnostic>;

/// The channel connecting all nodes of one pipeline to the collector owned
/// by the driver.
pub fn diagnostic_channel() -> (DiagnosticSender, DiagnosticReceiver) {
    mpsc::unbounded_channel()
}
