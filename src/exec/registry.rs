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
//! Operator plugin registration.
//!
//! Responsibilities:
//! - Maps operator names to plugins that can parse a textual pipeline
//!   fragment into an operator instance.
//! - Declares per-plugin capabilities (source/transformation/sink).
use std::collections::HashMap;
use std::sync::Arc;

use crate::exec::error::{Error, Result};
use crate::exec::operator::Operator;
use crate::exec::pipeline::pipeline::Pipeline;

/// What positions an operator may occupy in a pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OperatorSignature {
    pub source: bool,
    pub transformation: bool,
    pub sink: bool,
}

/// A named operator factory. `parse` maps the textual arguments of one
/// pipeline fragment to an operator instance.
pub trait OperatorPlugin: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn signature(&self) -> OperatorSignature;

    fn parse(&self, args: &str) -> Result<Box<dyn Operator>>;
}

#[derive(Default)]
pub struct OperatorRegistry {
    plugins: HashMap<&'static str, Arc<dyn OperatorPlugin>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn OperatorPlugin>) -> Result<()> {
        let name = plugin.name();
        if self.plugins.contains_key(name) {
            return Err(Error::Logic(format!(
                "operator `{}` is already registered",
                name
            )));
        }
        self.plugins.insert(name, plugin);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn OperatorPlugin>> {
        self.plugins.get(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.plugins.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Parses a `|`-separated textual pipeline. Each fragment starts with an
    /// operator name followed by that operator's arguments.
    pub fn parse_pipeline(&self, text: &str) -> Result<Pipeline> {
        let mut operators = Vec::new();
        for fragment in text.split('|') {
            let fragment = fragment.trim();
            if fragment.is_empty() {
                return Err(Error::Logic("empty pipeline fragment".to_string()));
            }
            let (name, args) = match fragment.split_once(char::is_whitespace) {
                Some((name, args)) => (name, args.trim()),
                None => (fragment, ""),
            };
            let plugin = self
                .get(name)
                .ok_or_else(|| Error::Logic(format!("unknown operator `{}`", name)))?;
            operators.push(plugin.parse(args)?);
        }
        Pipeline::new(operators)
    }
}
