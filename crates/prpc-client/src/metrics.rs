// Copyright 2025 prpc Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::atomic::{AtomicU64, Ordering};

use prpc_common::Result;
use serde::{Deserialize, Serialize};

/// Snapshot of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointMetrics {
    pub key: String,
    pub index: u32,
    pub addr: String,
    pub weight: u32,
    pub version: String,
    /// Calls issued on this endpoint, retries included
    pub call_count: u64,
}

/// Snapshot of one service client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMetrics {
    pub service: String,
    pub group: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    /// Calls that ran and failed
    pub failed_requests: u64,
    /// Calls refused by the circuit breaker without running
    pub rejected_requests: u64,
    pub endpoints: Vec<EndpointMetrics>,
}

/// Lock-free request counters of a service client.
#[derive(Debug, Default)]
pub(crate) struct RequestCounters {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

impl RequestCounters {
    pub(crate) fn record<T>(&self, result: &Result<T>) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let counter = match result {
            Ok(_) => &self.success,
            Err(err) if err.is_breaker_rejection() => &self.rejected,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(
        &self,
        service: &str,
        group: &str,
        endpoints: Vec<EndpointMetrics>,
    ) -> ServiceMetrics {
        ServiceMetrics {
            service: service.to_string(),
            group: group.to_string(),
            total_requests: self.total.load(Ordering::Relaxed),
            successful_requests: self.success.load(Ordering::Relaxed),
            failed_requests: self.failed.load(Ordering::Relaxed),
            rejected_requests: self.rejected.load(Ordering::Relaxed),
            endpoints,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prpc_common::PrpcError;

    #[test]
    fn test_counters() {
        let counters = RequestCounters::default();
        counters.record(&Ok(()));
        counters.record(&Ok(()));
        counters.record::<()>(&Err(PrpcError::NoAvailableServers));
        counters.record::<()>(&Err(PrpcError::CircuitOpen("g.s.m".into())));

        let snapshot = counters.snapshot("Arith", "zone1", Vec::new());
        assert_eq!(snapshot.total_requests, 4);
        assert_eq!(snapshot.successful_requests, 2);
        assert_eq!(snapshot.failed_requests, 1);
        assert_eq!(snapshot.rejected_requests, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let snapshot = RequestCounters::default().snapshot(
            "Arith",
            "zone1",
            vec![EndpointMetrics {
                key: "/__PRPC__/Arith@zone1/zone1.1".to_string(),
                index: 1,
                addr: "127.0.0.1:9000".to_string(),
                weight: 10,
                version: "v1.0".to_string(),
                call_count: 3,
            }],
        );
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["service"], "Arith");
        assert_eq!(json["endpoints"][0]["call_count"], 3);

        let back: ServiceMetrics = serde_json::from_value(json).unwrap();
        assert_eq!(back, snapshot);
    }
}
