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

//! User-defined filter callbacks. The sandbox that hosts them is external;
//! here they are an opaque `doc -> bool` interface, applied by the
//! coordinator as a post-filter on final hits.

use std::sync::Arc;

use config::{meta::query::Query, utils::json, RwHashMap};
use infra::errors::{Error, Result};
use once_cell::sync::Lazy;

pub static UDF_REGISTRY: Lazy<UdfRegistry> = Lazy::new(UdfRegistry::new);

pub trait UdfFilter: Send + Sync {
    fn name(&self) -> &str;
    /// Filter verdict for one document.
    fn eval(&self, params: &json::Value, doc: &json::Value) -> Result<bool>;
}

#[derive(Default)]
pub struct UdfRegistry {
    filters: RwHashMap<String, Arc<dyn UdfFilter>>,
}

impl UdfRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, filter: Arc<dyn UdfFilter>) {
        self.filters.insert(filter.name().to_string(), filter);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn UdfFilter>> {
        self.filters
            .get(name)
            .map(|f| f.clone())
            .ok_or_else(|| Error::NotFound(format!("udf filter {name}")))
    }

    /// Apply the extracted UDF nodes to one document; all must pass.
    pub fn matches(&self, udfs: &[Query], doc: &json::Value) -> Result<bool> {
        for udf in udfs {
            let Query::Udf { name, params, .. } = udf else {
                return Err(Error::Internal(
                    "non-udf query in udf post-filter".to_string(),
                ));
            };
            let filter = self.get(name)?;
            if !filter.eval(params, doc)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::utils::json::json;

    struct MinPrice;

    impl UdfFilter for MinPrice {
        fn name(&self) -> &str {
            "min_price"
        }

        fn eval(&self, params: &json::Value, doc: &json::Value) -> Result<bool> {
            let min = params.get("min").and_then(|v| v.as_f64()).unwrap_or(0.0);
            Ok(doc.get("price").and_then(|v| v.as_f64()).unwrap_or(0.0) >= min)
        }
    }

    #[test]
    fn test_post_filter() {
        let registry = UdfRegistry::new();
        registry.register(Arc::new(MinPrice));
        let udfs = vec![Query::Udf {
            name: "min_price".to_string(),
            version: "1".to_string(),
            params: json!({"min": 15.0}),
        }];
        assert!(registry.matches(&udfs, &json!({"price": 20.0})).unwrap());
        assert!(!registry.matches(&udfs, &json!({"price": 10.0})).unwrap());
    }

    #[test]
    fn test_unknown_udf() {
        let registry = UdfRegistry::new();
        let udfs = vec![Query::Udf {
            name: "missing".to_string(),
            version: "".to_string(),
            params: json!(null),
        }];
        assert!(matches!(
            registry.matches(&udfs, &json!({})),
            Err(Error::NotFound(_))
        ));
    }
}
