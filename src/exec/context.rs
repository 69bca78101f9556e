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
//! Ambient read-only state shared by all nodes of a pipeline.
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;

use crate::common::config::EngineOptions;

/// Concept name to the field names it resolves to.
pub type ConceptMap = BTreeMap<String, Vec<String>>;

/// An opaque capability handed to operators declared `remote`. The core does
/// not interpret it.
#[derive(Clone)]
pub struct ClusterHandle {
    inner: Arc<dyn Any + Send + Sync>,
}

impl ClusterHandle {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref()
    }
}

impl fmt::Debug for ClusterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterHandle").finish_non_exhaustive()
    }
}

/// Typing context, configuration, and the optional cluster handle. One
/// context serves a whole pipeline run; nodes read it through their control
/// plane.
#[derive(Debug, Default)]
pub struct EngineContext {
    schemas: Vec<SchemaRef>,
    concepts: ConceptMap,
    options: EngineOptions,
    cluster: Option<ClusterHandle>,
}

impl EngineContext {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub fn with_schemas(mut self, schemas: Vec<SchemaRef>) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn with_concepts(mut self, concepts: ConceptMap) -> Self {
        self.concepts = concepts;
        self
    }

    pub fn with_cluster(mut self, cluster: ClusterHandle) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn schemas(&self) -> &[SchemaRef] {
        &self.schemas
    }

    pub fn concepts(&self) -> &ConceptMap {
        &self.concepts
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn cluster(&self) -> Option<&ClusterHandle> {
        self.cluster.as_ref()
    }
}
