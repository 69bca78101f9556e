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
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

fn default_log_level() -> String {
    "info".to_string()
}

/// Engine configuration, loaded from a TOML file. Operators read the
/// pipeline safety flag through their control plane.
#[derive(Clone, Debug, Deserialize)]
pub struct EngineOptions {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression. If set, this takes
    /// precedence over `log_level`.
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(rename = "allow-unsafe-pipelines", default)]
    pub allow_unsafe_pipelines: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            allow_unsafe_pipelines: false,
        }
    }
}

impl EngineOptions {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        Self::load_from_str(&s).with_context(|| format!("parse toml: {}", path.display()))
    }

    pub fn load_from_str(s: &str) -> Result<Self> {
        let options: EngineOptions = toml::from_str(s)?;
        Ok(options)
    }

    /// Resolves the config path from `$SLUICE_CONFIG` or `./sluice.toml`;
    /// falls back to defaults when neither exists.
    pub fn from_env_or_default() -> Result<Self> {
        if let Ok(p) = std::env::var("SLUICE_CONFIG") {
            if !p.trim().is_empty() {
                return Self::load_from_file(&PathBuf::from(p));
            }
        }
        let candidate = PathBuf::from("sluice.toml");
        if candidate.exists() {
            return Self::load_from_file(&candidate);
        }
        Ok(Self::default())
    }

    pub fn tracing_filter(&self) -> String {
        self.log_filter
            .clone()
            .unwrap_or_else(|| self.log_level.clone())
    }
}
