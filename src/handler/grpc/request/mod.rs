// Copyright 2024 Quiver Labs Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

pub mod data;
pub mod master;

use config::metrics;

/// Record one gRPC call's counters the way every handler does.
pub(crate) fn observe(endpoint: &str, ok: bool, started: std::time::Instant) {
    let status = if ok { "200" } else { "500" };
    metrics::GRPC_RESPONSE_TIME
        .with_label_values(&[endpoint, status])
        .observe(started.elapsed().as_secs_f64());
    metrics::GRPC_INCOMING_REQUESTS
        .with_label_values(&[endpoint, status])
        .inc();
}
