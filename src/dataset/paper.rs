//! Paper specification records.
//!
//! A [`Paper`] describes one research manuscript and the resources needed
//! to reproduce it: declared source languages, Python dependencies, GPU
//! needs, and dataset descriptors. Papers are immutable once loaded and
//! own their tasks keyed by task id.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::task::Task;

/// Declared execution needs for reproducing a paper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionRequirements {
    /// Source languages of the original analysis (e.g. "python").
    #[serde(default)]
    pub code_language: Vec<String>,
    /// Package specifications to install into the sandbox.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Whether the analysis requires GPU-grade numerics.
    #[serde(default)]
    pub needs_gpu: bool,
}

/// Where a dataset is hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// Hosted on HuggingFace; materialized into the workspace before a run.
    Huggingface,
    /// Already present on the host; only instructions are surfaced.
    Local,
    /// Anything else; access instructions are surfaced to the agent.
    #[serde(other)]
    Other,
}

impl Default for DatasetKind {
    fn default() -> Self {
        Self::Other
    }
}

/// Descriptor for one dataset a paper's tasks rely on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    /// Human-readable dataset name, used as the workspace subdirectory.
    pub dataset_name: String,
    /// Hosting kind.
    #[serde(default)]
    pub kind: DatasetKind,
    /// HuggingFace repo names.
    #[serde(default)]
    pub hf_name: Vec<String>,
    /// HuggingFace repo types (e.g. "dataset").
    #[serde(default)]
    pub hf_type: Vec<String>,
    /// Splits of interest.
    #[serde(default)]
    pub hf_split: Vec<String>,
    /// Direct file URLs to materialize.
    #[serde(default)]
    pub hf_link: Vec<String>,
    /// Free-text access instructions surfaced to the agent.
    #[serde(default)]
    pub data_instructions: Option<String>,
}

/// One research manuscript and the resources needed to reproduce it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paper {
    /// Unique paper identifier.
    pub paper_id: String,
    /// Paper title.
    pub title: String,
    /// Abstract text.
    #[serde(rename = "abstract", default)]
    pub abstract_text: String,
    /// Publication date (YYYY-MM-DD).
    pub publication_date: NaiveDate,
    /// Link to the published paper.
    #[serde(default)]
    pub paper_link: String,
    /// Whether the original analysis code is public.
    #[serde(default)]
    pub code_available: bool,
    /// Link to the original code, if public.
    #[serde(default)]
    pub code_link: Option<String>,
    /// Provenance of the task set (e.g. "expert", "showyourwork").
    #[serde(default)]
    pub source: String,
    /// Declared execution needs.
    #[serde(default)]
    pub execution_requirements: ExecutionRequirements,
    /// Datasets the tasks rely on.
    #[serde(default, rename = "dataset")]
    pub datasets: Vec<DatasetDescriptor>,
    /// Free-text supplementary instructions for the agent.
    #[serde(default)]
    pub other_instructions: Option<String>,
    /// Manuscript text (masked or unmasked), loaded separately.
    #[serde(default)]
    pub full_text: Option<String>,
    /// Tasks keyed by task id. Insertion order is irrelevant; the
    /// dependency resolver produces the run order.
    #[serde(default)]
    pub tasks: HashMap<String, Task>,
}

impl Paper {
    /// Whether this paper requires a GPU-enabled backend.
    pub fn needs_gpu(&self) -> bool {
        self.execution_requirements.needs_gpu
    }

    /// HuggingFace datasets that must be materialized before a run.
    pub fn huggingface_datasets(&self) -> impl Iterator<Item = &DatasetDescriptor> {
        self.datasets
            .iter()
            .filter(|d| d.kind == DatasetKind::Huggingface)
    }

    /// Matches this paper against metadata criteria (field name, value).
    ///
    /// Supported fields mirror the top-level scalar metadata; an unknown
    /// field never matches, so an unmatched filter yields an empty load
    /// result rather than an error.
    pub fn matches_filter(&self, field: &str, value: &str) -> bool {
        match field {
            "paper_id" => self.paper_id == value,
            "title" => self.title == value,
            "source" => self.source == value,
            "code_available" => self.code_available.to_string() == value,
            "needs_gpu" => self.needs_gpu().to_string() == value,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_paper_json() -> serde_json::Value {
        json!({
            "paper_id": "gw_nsbh",
            "title": "Neutron star-black hole mergers",
            "abstract": "We analyze gravitational-wave events.",
            "publication_date": "2021-06-29",
            "paper_link": "https://arxiv.org/abs/2106.15745",
            "code_available": true,
            "code_link": "https://github.com/example/gw-nsbh",
            "source": "expert",
            "execution_requirements": {
                "code_language": ["python"],
                "dependencies": ["bilby", "astropy"],
                "needs_gpu": false
            },
            "dataset": [{
                "dataset_name": "posterior_samples",
                "kind": "huggingface",
                "hf_name": ["example/gw-nsbh-posteriors"],
                "hf_link": ["https://huggingface.co/datasets/example/gw-nsbh-posteriors/resolve/main/samples.h5"],
                "data_instructions": "Posterior sample files in HDF5 format."
            }],
            "other_instructions": "Use the provided samples, do not re-run inference."
        })
    }

    #[test]
    fn test_paper_deserializes() {
        let paper: Paper = serde_json::from_value(sample_paper_json()).unwrap();
        assert_eq!(paper.paper_id, "gw_nsbh");
        assert_eq!(paper.publication_date.to_string(), "2021-06-29");
        assert_eq!(paper.execution_requirements.dependencies.len(), 2);
        assert!(!paper.needs_gpu());
        assert_eq!(paper.huggingface_datasets().count(), 1);
        assert!(paper.tasks.is_empty());
    }

    #[test]
    fn test_unknown_dataset_kind_maps_to_other() {
        let mut value = sample_paper_json();
        value["dataset"][0]["kind"] = json!("wget");
        let paper: Paper = serde_json::from_value(value).unwrap();
        assert_eq!(paper.datasets[0].kind, DatasetKind::Other);
        assert_eq!(paper.huggingface_datasets().count(), 0);
    }

    #[test]
    fn test_matches_filter() {
        let paper: Paper = serde_json::from_value(sample_paper_json()).unwrap();
        assert!(paper.matches_filter("source", "expert"));
        assert!(paper.matches_filter("code_available", "true"));
        assert!(!paper.matches_filter("source", "showyourwork"));
        assert!(!paper.matches_filter("no_such_field", "x"));
    }
}
