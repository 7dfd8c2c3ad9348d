//! Flattened API spec listing of one environment.
//!
//! The ordering is consumed by other tools and must stay stable: entries with a service
//! reference come first, sorted by service reference, then by URL. Duplicates are kept.

use std::cmp::Ordering;

use kube::ResourceExt;
use serde::Serialize;

use crate::operator::crd::Frontend;
use crate::operator::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub frontend: String,
    pub url: String,
    pub bundle_labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_ref: Option<String>,
}

impl CatalogEntry {
    fn service_ref(&self) -> &str {
        self.service_ref.as_deref().unwrap_or_default()
    }
}

fn compare(a: &CatalogEntry, b: &CatalogEntry) -> Ordering {
    let (sa, sb) = (a.service_ref(), b.service_ref());
    sa.is_empty()
        .cmp(&sb.is_empty())
        .then_with(|| sa.cmp(sb))
        .then_with(|| a.url.cmp(&b.url))
        .then_with(|| a.bundle_labels.cmp(&b.bundle_labels))
        .then_with(|| a.frontend.cmp(&b.frontend))
}

/// Collect the API specs of every frontend running in `environment`
pub fn build_catalog(environment: &str, frontends: &[Frontend]) -> Vec<CatalogEntry> {
    let mut entries: Vec<CatalogEntry> = frontends
        .iter()
        .filter(|frontend| frontend.spec.environment == environment)
        .flat_map(|frontend| {
            let name = frontend.name_any();
            frontend.spec.api_specs.iter().map(move |spec| CatalogEntry {
                frontend: name.clone(),
                url: spec.url.clone(),
                bundle_labels: spec.bundle_labels.clone(),
                service_ref: spec.service_ref.clone().filter(|s| !s.is_empty()),
            })
        })
        .collect();
    entries.sort_by(compare);
    entries
}

pub fn render(entries: &[CatalogEntry]) -> Result<String> {
    Ok(serde_json::to_string(entries)?)
}
