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

//! The coordinator query pipeline: parser, optional rewrite hook, routing
//! lookup, plan construction and optimization behind a two-level cache,
//! fan-out execution and merging.

pub mod cache;
pub mod exec;
pub mod merge;
pub mod optimizer;
pub mod parser;
pub mod pipeline;
pub mod plan;
pub mod planner;
pub mod udf;

use std::sync::Arc;

use config::{meta::search::SearchResponse, utils::json};
use infra::errors::{Error, Result};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::service::clients::data::DataClient;

pub use exec::SearchService;

static SEARCH_SERVICE: OnceCell<Arc<SearchService>> = OnceCell::const_new();

pub async fn init(client: Arc<dyn DataClient>) {
    _ = SEARCH_SERVICE
        .get_or_init(|| async { Arc::new(SearchService::new(client)) })
        .await;
}

/// Coordinator entry point: search `index` with a raw request body.
pub async fn search(
    index: &str,
    raw: &json::Value,
    cancel: CancellationToken,
) -> Result<SearchResponse> {
    let service = SEARCH_SERVICE
        .get()
        .ok_or_else(|| Error::Internal("search service not initialized".to_string()))?;
    service.search(index, raw, cancel).await
}
