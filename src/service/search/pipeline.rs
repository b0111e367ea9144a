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

//! Optional per-index query pipelines. A pipeline may only rewrite the
//! request (synonym expansion and the like) and always runs before planning,
//! never after physical planning.

use std::sync::Arc;

use config::{meta::search::SearchRequest, RwHashMap};
use infra::errors::{Error, Result};
use once_cell::sync::Lazy;

pub static QUERY_PIPELINES: Lazy<PipelineRegistry> = Lazy::new(PipelineRegistry::new);

/// What to do when a pipeline stage fails.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailurePolicy {
    /// Keep the original request.
    Continue,
    /// Fail the whole search.
    Abort,
    /// Re-run the stage up to the given number of times, then keep the
    /// original request.
    Retry(u32),
}

type StageFn = dyn Fn(SearchRequest) -> Result<SearchRequest> + Send + Sync;

pub struct PipelineStage {
    pub name: String,
    pub policy: FailurePolicy,
    rewrite: Box<StageFn>,
}

impl PipelineStage {
    pub fn new<F>(name: &str, policy: FailurePolicy, rewrite: F) -> Self
    where
        F: Fn(SearchRequest) -> Result<SearchRequest> + Send + Sync + 'static,
    {
        PipelineStage {
            name: name.to_string(),
            policy,
            rewrite: Box::new(rewrite),
        }
    }
}

#[derive(Default)]
pub struct PipelineRegistry {
    pipelines: RwHashMap<String, Arc<Vec<PipelineStage>>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, index: &str, stages: Vec<PipelineStage>) {
        self.pipelines.insert(index.to_string(), Arc::new(stages));
    }

    pub fn remove(&self, index: &str) {
        self.pipelines.remove(index);
    }

    /// Run the index's pipeline over the request, honoring each stage's
    /// failure policy.
    pub fn apply(&self, index: &str, req: SearchRequest) -> Result<SearchRequest> {
        let Some(stages) = self.pipelines.get(index).map(|s| s.clone()) else {
            return Ok(req);
        };
        let mut current = req;
        for stage in stages.iter() {
            current = match run_stage(stage, &current) {
                Ok(rewritten) => rewritten,
                Err(e) => match stage.policy {
                    FailurePolicy::Continue | FailurePolicy::Retry(_) => {
                        log::warn!(
                            "[SEARCH] query pipeline stage {} failed on {index}, keeping original: {e}",
                            stage.name
                        );
                        current
                    }
                    FailurePolicy::Abort => {
                        return Err(Error::FailedPrecondition(format!(
                            "query pipeline stage {} failed: {e}",
                            stage.name
                        )))
                    }
                },
            };
        }
        Ok(current)
    }
}

fn run_stage(stage: &PipelineStage, req: &SearchRequest) -> Result<SearchRequest> {
    let attempts = match stage.policy {
        FailurePolicy::Retry(n) => n.max(1),
        _ => 1,
    };
    let mut last_err = None;
    for _ in 0..attempts {
        match (stage.rewrite)(req.clone()) {
            Ok(rewritten) => return Ok(rewritten),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| Error::Internal("pipeline stage ran zero times".to_string())))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use config::meta::query::Query;
    use config::utils::json::json;

    fn req() -> SearchRequest {
        crate::service::search::parser::parse(&json!({
            "query": {"match": {"title": "fast"}}
        }))
        .unwrap()
    }

    fn synonym_stage() -> PipelineStage {
        PipelineStage::new("synonyms", FailurePolicy::Continue, |mut req| {
            if let Query::Match { text, .. } = &mut req.query {
                if text == "fast" {
                    *text = "fast quick".to_string();
                }
            }
            Ok(req)
        })
    }

    #[test]
    fn test_rewrite_applies() {
        let registry = PipelineRegistry::new();
        registry.set("products", vec![synonym_stage()]);
        let out = registry.apply("products", req()).unwrap();
        match out.query {
            Query::Match { text, .. } => assert_eq!(text, "fast quick"),
            other => panic!("unexpected query: {other:?}"),
        }
    }

    #[test]
    fn test_no_pipeline_is_identity() {
        let registry = PipelineRegistry::new();
        let before = req();
        let after = registry.apply("products", before.clone()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_continue_policy_keeps_original() {
        let registry = PipelineRegistry::new();
        registry.set(
            "products",
            vec![PipelineStage::new("boom", FailurePolicy::Continue, |_| {
                Err(Error::Internal("boom".to_string()))
            })],
        );
        let out = registry.apply("products", req()).unwrap();
        assert_eq!(out, req());
    }

    #[test]
    fn test_abort_policy_fails_request() {
        let registry = PipelineRegistry::new();
        registry.set(
            "products",
            vec![PipelineStage::new("boom", FailurePolicy::Abort, |_| {
                Err(Error::Internal("boom".to_string()))
            })],
        );
        assert!(registry.apply("products", req()).is_err());
    }

    #[test]
    fn test_retry_policy_bounded() {
        static CALLS: AtomicU32 = AtomicU32::new(0);
        let registry = PipelineRegistry::new();
        registry.set(
            "products",
            vec![PipelineStage::new("flaky", FailurePolicy::Retry(3), |_| {
                CALLS.fetch_add(1, Ordering::SeqCst);
                Err(Error::Internal("still broken".to_string()))
            })],
        );
        let out = registry.apply("products", req()).unwrap();
        assert_eq!(out, req());
        assert_eq!(CALLS.load(Ordering::SeqCst), 3);
    }
}
