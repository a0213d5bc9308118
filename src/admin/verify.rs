use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::storage::{
    read_header, read_label_index, DatabaseLayout, EdgeRecord, LabelIndex,
    MetaRecord, NodeRecord, PropRecord, Record, RecordFile, StoreFile, StoreVersion,
    CURRENT_GENERATION, LEGACY_GENERATION,
};
use crate::types::{LabelId, NodeId, Result, SombraError};

const MAX_FINDINGS: usize = 32;

/// Specifies the depth of verification checks to perform.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyLevel {
    /// Headers, versions, and file sizes only.
    Fast,
    /// Everything in `Fast` plus referential checks across all records.
    #[default]
    Full,
}

/// Indicates the severity level of a verification finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Informational message about the verification process.
    Info,
    /// Non-critical issue that may indicate a problem.
    Warning,
    /// Critical issue indicating data corruption or integrity failure.
    Error,
}

/// Represents a single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// The severity level of this finding.
    pub severity: VerifySeverity,
    /// Human-readable description of the issue.
    pub message: String,
}

impl VerifyFinding {
    /// An error-level finding.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Warning,
            message: message.into(),
        }
    }
}

/// Statistics collected during the verification process.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyCounts {
    /// Store files found on disk.
    pub store_files: u64,
    /// Live node records.
    pub nodes_in_use: u64,
    /// Live relationship records.
    pub edges_in_use: u64,
    /// Live property records.
    pub props_in_use: u64,
    /// Postings in the label index.
    pub label_postings: u64,
}

/// Complete report of a verification operation.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    /// The verification level that was performed.
    pub level: VerifyLevel,
    /// Format shared by all store files, when they agree.
    pub version: Option<StoreVersion>,
    /// Whether verification passed without error findings.
    pub success: bool,
    /// List of issues discovered during verification.
    pub findings: Vec<VerifyFinding>,
    /// Statistics about the data structures examined.
    pub counts: VerifyCounts,
}

impl VerifyReport {
    /// Error-level findings only.
    pub fn errors(&self) -> impl Iterator<Item = &VerifyFinding> {
        self.findings
            .iter()
            .filter(|finding| finding.severity == VerifySeverity::Error)
    }
}

/// A consistency check run over a store directory.
///
/// The upgrader runs one over the staged output before committing it.
pub trait ConsistencyCheck: Send + Sync {
    /// Checks the store at `layout`.
    fn verify(&self, layout: &DatabaseLayout) -> Result<VerifyReport>;
}

/// The built-in checker backed by [`verify`].
#[derive(Clone, Copy, Debug, Default)]
pub struct StoreVerifier {
    level: VerifyLevel,
}

impl StoreVerifier {
    /// Checker running at `level`.
    pub fn new(level: VerifyLevel) -> Self {
        Self { level }
    }
}

impl ConsistencyCheck for StoreVerifier {
    fn verify(&self, layout: &DatabaseLayout) -> Result<VerifyReport> {
        verify(layout, self.level)
    }
}

/// Verifies the integrity of the store files in `layout`.
///
/// Works on stores of any supported generation and never takes the store
/// lock, so it can inspect a staging directory mid-upgrade.
///
/// - `VerifyLevel::Fast`: headers, a single shared version, and file sizes
/// - `VerifyLevel::Full`: also relationship endpoints, node degrees, property
///   chains, and label index contents
///
/// # Errors
///
/// Returns an error only if the directory itself cannot be inspected; damaged
/// files are reported as findings.
pub fn verify(layout: &DatabaseLayout, level: VerifyLevel) -> Result<VerifyReport> {
    if !layout.dir().is_dir() {
        return Err(SombraError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} is not a directory", layout.dir().display()),
        )));
    }
    let mut findings = Vec::new();
    let mut counts = VerifyCounts::default();
    let version = check_headers(layout, &mut findings, &mut counts);

    if level == VerifyLevel::Full && !has_errors(&findings) {
        let meta = load::<MetaRecord>(layout, &mut findings);
        if let Some(meta) = &meta {
            if meta.len() != 1 {
                push_error(
                    &mut findings,
                    format!("meta store holds {} records, expected 1", meta.len()),
                );
            }
        }
        let nodes = load::<NodeRecord>(layout, &mut findings);
        let edges = load::<EdgeRecord>(layout, &mut findings);
        let props = load::<PropRecord>(layout, &mut findings);
        if let (Some(nodes), Some(edges), Some(props)) = (nodes, edges, props) {
            counts.nodes_in_use = nodes.iter().filter(|n| n.in_use).count() as u64;
            counts.edges_in_use = edges.iter().filter(|e| e.in_use).count() as u64;
            counts.props_in_use = props.iter().filter(|p| p.in_use).count() as u64;
            check_edges_and_degrees(&nodes, &edges, &mut findings);
            check_property_chains(&nodes, &props, &mut findings);
            check_label_index(layout, &nodes, &mut findings, &mut counts);
        }
    }

    Ok(VerifyReport {
        level,
        version,
        success: !has_errors(&findings),
        findings,
        counts,
    })
}

fn check_headers(
    layout: &DatabaseLayout,
    findings: &mut Vec<VerifyFinding>,
    counts: &mut VerifyCounts,
) -> Option<StoreVersion> {
    let mut versions: BTreeMap<StoreFile, StoreVersion> = BTreeMap::new();
    for file in StoreFile::ALL {
        let path = layout.store_file(file);
        if !path.exists() {
            if !file.is_optional() {
                push_error(findings, format!("missing store file {file}"));
            }
            continue;
        }
        counts.store_files += 1;
        match read_header(&path) {
            Ok(header) => {
                if header.kind != file {
                    push_error(
                        findings,
                        format!("{file} carries a {} header", header.kind),
                    );
                }
                let generation = header.version.generation;
                if generation != LEGACY_GENERATION && generation != CURRENT_GENERATION {
                    push_error(
                        findings,
                        format!("{file} is in unsupported format {}", header.version),
                    );
                } else if file != StoreFile::LabelIndex {
                    if let Err(err) = check_file_size(layout, file) {
                        push_error(findings, format!("{file}: {err}"));
                    }
                }
                versions.insert(file, header.version);
            }
            Err(err) => push_error(findings, format!("unreadable header in {file}: {err}")),
        }
    }

    let mut distinct: Vec<&StoreVersion> = versions.values().collect();
    distinct.sort_by_key(|v| (v.format.clone(), v.generation));
    distinct.dedup();
    match distinct.as_slice() {
        [] => None,
        [single] => {
            if !single.is_current() {
                findings.push(VerifyFinding::warning(format!(
                    "store is in format {single}, not the current format {}",
                    StoreVersion::current()
                )));
            }
            Some((*single).clone())
        }
        _ => {
            let listing = versions
                .iter()
                .map(|(file, version)| format!("{file}={version}"))
                .collect::<Vec<_>>()
                .join(", ");
            push_error(findings, format!("mixed store versions: {listing}"));
            None
        }
    }
}

fn check_file_size(layout: &DatabaseLayout, file: StoreFile) -> Result<()> {
    let path = layout.store_file(file);
    match file {
        StoreFile::Meta => RecordFile::<MetaRecord>::open(&path).map(|_| ()),
        StoreFile::Nodes => RecordFile::<NodeRecord>::open(&path).map(|_| ()),
        StoreFile::Edges => RecordFile::<EdgeRecord>::open(&path).map(|_| ()),
        StoreFile::Props => RecordFile::<PropRecord>::open(&path).map(|_| ()),
        StoreFile::LabelIndex => Ok(()),
    }
}

fn load<R: Record>(layout: &DatabaseLayout, findings: &mut Vec<VerifyFinding>) -> Option<Vec<R>> {
    let path = layout.store_file(R::FILE);
    let result = RecordFile::<R>::open(&path).and_then(|file| file.read_all());
    match result {
        Ok(records) => Some(records),
        Err(err) => {
            push_error(findings, format!("failed to read {}: {err}", R::FILE));
            None
        }
    }
}

fn check_edges_and_degrees(
    nodes: &[NodeRecord],
    edges: &[EdgeRecord],
    findings: &mut Vec<VerifyFinding>,
) {
    let mut degrees = vec![0u64; nodes.len()];
    for (id, edge) in edges.iter().enumerate() {
        if !edge.in_use {
            continue;
        }
        for (end, node) in [("start", edge.src), ("end", edge.dst)] {
            match nodes.get(node.0 as usize) {
                Some(record) if record.in_use => degrees[node.0 as usize] += 1,
                _ => push_error(
                    findings,
                    format!("relationship {id} references missing {end} node {node}"),
                ),
            }
        }
        if findings.len() >= MAX_FINDINGS {
            return;
        }
    }
    for (id, node) in nodes.iter().enumerate() {
        if node.in_use && node.degree != degrees[id] {
            push_error(
                findings,
                format!(
                    "node {id} records degree {}, relationships give {}",
                    node.degree, degrees[id]
                ),
            );
        }
        if findings.len() >= MAX_FINDINGS {
            return;
        }
    }
}

fn check_property_chains(
    nodes: &[NodeRecord],
    props: &[PropRecord],
    findings: &mut Vec<VerifyFinding>,
) {
    let mut visited = vec![false; props.len()];
    for (id, node) in nodes.iter().enumerate() {
        if !node.in_use {
            continue;
        }
        let mut cursor = node.first_prop;
        while let Some(ptr) = cursor {
            let Some(prop) = props.get(ptr as usize) else {
                push_error(
                    findings,
                    format!("node {id} property chain points past the property store ({ptr})"),
                );
                break;
            };
            if visited[ptr as usize] {
                push_error(
                    findings,
                    format!("property {ptr} reached twice while walking node {id}'s chain"),
                );
                break;
            }
            if !prop.in_use {
                push_error(
                    findings,
                    format!("node {id} property chain reaches free slot {ptr}"),
                );
                break;
            }
            visited[ptr as usize] = true;
            cursor = prop.next;
        }
        if findings.len() >= MAX_FINDINGS {
            return;
        }
    }
}

fn check_label_index(
    layout: &DatabaseLayout,
    nodes: &[NodeRecord],
    findings: &mut Vec<VerifyFinding>,
    counts: &mut VerifyCounts,
) {
    let path = layout.store_file(StoreFile::LabelIndex);
    if !path.exists() {
        return;
    }
    let actual = match read_label_index(&path) {
        Ok((_, index)) => index,
        Err(err) => {
            push_error(findings, format!("failed to read label index: {err}"));
            return;
        }
    };
    counts.label_postings = actual.posting_count() as u64;
    let expected = LabelIndex::from_nodes(0, nodes);
    report_missing(&expected, &actual, findings, |label, node| {
        format!("label index is missing node {node} under label {label}")
    });
    report_missing(&actual, &expected, findings, |label, node| {
        format!("label index lists node {node} under label {label}, node store disagrees")
    });
}

fn report_missing(
    from: &LabelIndex,
    within: &LabelIndex,
    findings: &mut Vec<VerifyFinding>,
    message: impl Fn(LabelId, NodeId) -> String,
) {
    for (label, nodes) in from.iter() {
        let present = within.nodes(label);
        for node in nodes {
            if present.binary_search(node).is_err() {
                push_error(findings, message(label, *node));
                if findings.len() >= MAX_FINDINGS {
                    return;
                }
            }
        }
    }
}

fn has_errors(findings: &[VerifyFinding]) -> bool {
    findings
        .iter()
        .any(|finding| finding.severity == VerifySeverity::Error)
}

fn push_error(findings: &mut Vec<VerifyFinding>, message: impl Into<String>) {
    if findings.len() < MAX_FINDINGS {
        findings.push(VerifyFinding::error(message.into()));
    }
}
