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
//! Per-node execution counters, reported once on clean shutdown.
use std::time::{Duration, Instant};

use crate::exec::element::ElementKind;
use crate::sluice_logging::debug;

pub(crate) struct NodeMetrics {
    start_time: Instant,
    pub time_starting: Duration,
    pub time_running: Duration,
    pub time_scheduled: Duration,
    pub inbound_total: u64,
    pub num_inbound_batches: u64,
    pub outbound_total: u64,
    pub num_outbound_batches: u64,
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            time_starting: Duration::ZERO,
            time_running: Duration::ZERO,
            time_scheduled: Duration::ZERO,
            inbound_total: 0,
            num_inbound_batches: 0,
            outbound_total: 0,
            num_outbound_batches: 0,
        }
    }

    pub fn report(&self, op_name: &str, input: ElementKind, output: ElementKind) {
        let elapsed = self.start_time.elapsed();
        debug!(
            "`{}` was scheduled for {:.2}% of total runtime",
            op_name,
            percentage(self.time_scheduled, elapsed)
        );
        debug!(
            "`{}` spent {:.2}% of scheduled time starting",
            op_name,
            percentage(self.time_starting, self.time_scheduled)
        );
        debug!(
            "`{}` spent {:.2}% of scheduled time running",
            op_name,
            percentage(self.time_running, self.time_scheduled)
        );
        if input != ElementKind::Void {
            report_side(
                op_name,
                "inbound",
                input,
                self.inbound_total,
                self.num_inbound_batches,
                elapsed,
            );
        }
        if output != ElementKind::Void {
            report_side(
                op_name,
                "outbound",
                output,
                self.outbound_total,
                self.num_outbound_batches,
                elapsed,
            );
        }
    }
}

fn percentage(num: Duration, den: Duration) -> f64 {
    if den.is_zero() {
        return 0.0;
    }
    num.as_secs_f64() / den.as_secs_f64() * 100.0
}

fn report_side(
    op_name: &str,
    side: &str,
    kind: ElementKind,
    total: u64,
    batches: u64,
    elapsed: Duration,
) {
    let (unit, ratio) = match kind {
        ElementKind::Bytes => ("MiB", 1_048_576.0),
        _ => ("events", 1.0),
    };
    let scaled = total as f64 / ratio;
    let seconds = elapsed.as_secs_f64().max(f64::EPSILON);
    let avg_batch = if batches == 0 {
        0.0
    } else {
        scaled / batches as f64
    };
    debug!(
        "`{}` {} {:.0} {} in {:?} rate = {:.2} {}/s avg batch size = {:.2} {}",
        op_name,
        side,
        scaled,
        unit,
        elapsed,
        scaled / seconds,
        unit,
        avg_batch,
        unit
    );
}
