//! Hand-off of a finished embedding to an external store.
//!
//! An export bundles one column per embedding dimension (`V1`, `V2`, `V3`),
//! the optional observation grouping and the fidelity statistics of the
//! exported iteration. Where the export ends up is up to the [`ResultSink`].

use crate::fidelity::FidelityReport;
use crate::history::EmbeddingSnapshot;
use std::collections::BTreeMap;

/// Observations sharing one label.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Group {
    /// Label shared by every member
    pub label: String,

    /// Row indices of the members, ascending
    pub members: Vec<usize>,
}

/// Partition of the observations into labelled groups, ordered by label.
///
/// Grouping is an annotation for consumers of the results; it never
/// influences the optimization.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Grouping {
    groups: Vec<Group>,
    n_points: usize,
}

impl Grouping {
    /// Groups observations by their label, one label per observation.
    ///
    /// Groups are ordered by the natural order of the labels, not by first
    /// appearance.
    #[must_use]
    pub fn from_labels<L>(labels: &[L]) -> Self
    where
        L: Ord + ToString,
    {
        let mut by_label: BTreeMap<&L, Vec<usize>> = BTreeMap::new();
        for (i, label) in labels.iter().enumerate() {
            by_label.entry(label).or_default().push(i);
        }

        let groups = by_label
            .into_iter()
            .map(|(label, members)| Group {
                label: label.to_string(),
                members,
            })
            .collect();

        Self {
            groups,
            n_points: labels.len(),
        }
    }

    /// Groups in label order.
    #[must_use]
    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    /// Number of labelled observations.
    #[must_use]
    pub fn n_points(&self) -> usize {
        self.n_points
    }
}

/// One output column.
#[derive(Clone, Debug, PartialEq)]
pub struct ExportColumn {
    /// Column name, `V1` for the first embedding dimension
    pub label: String,

    /// One coordinate per observation
    pub values: Vec<f64>,

    /// Undefined-value flags parallel to `values`; embeddings are always
    /// fully defined
    pub undefined: Vec<bool>,
}

/// Everything handed to a [`ResultSink`] for one saved iteration.
#[derive(Clone, Debug, PartialEq)]
pub struct EmbeddingExport {
    /// One column per embedding dimension
    pub columns: Vec<ExportColumn>,

    /// Grouping supplied with the run, if any
    pub grouping: Option<Grouping>,

    /// Fidelity statistics of the exported iteration
    pub report: FidelityReport,
}

impl EmbeddingExport {
    pub(crate) fn new(
        snapshot: &EmbeddingSnapshot,
        grouping: Option<Grouping>,
        report: FidelityReport,
    ) -> Self {
        let columns = snapshot
            .positions()
            .columns()
            .into_iter()
            .enumerate()
            .map(|(j, column)| ExportColumn {
                label: format!("V{}", j + 1),
                values: column.to_vec(),
                undefined: vec![false; column.len()],
            })
            .collect();

        Self {
            columns,
            grouping,
            report,
        }
    }

    /// Named summary values in display order: final cost, rank correlation,
    /// iterations.
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn summary(&self) -> [(&'static str, f64); 3] {
        [
            ("final cost", self.report.final_cost),
            ("rank correlation", self.report.rank_correlation),
            ("iterations", self.report.iterations_completed as f64),
        ]
    }
}

/// Receiver for exported embeddings, typically a table or file writer.
pub trait ResultSink {
    /// Takes ownership of one export.
    fn accept(&mut self, export: EmbeddingExport);
}

impl ResultSink for Vec<EmbeddingExport> {
    fn accept(&mut self, export: EmbeddingExport) {
        self.push(export);
    }
}
