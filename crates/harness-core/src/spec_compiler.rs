//! The Spec Compiler: turns spec artifact text into a chunked
//! internal form and an ordered feature backlog, and classifies the delta
//! between spec versions during a merge.
//!
//! The planning and chunk-extraction collaborators themselves are external
//! pure functions — an LLM reached over the same subprocess protocol
//! `harness-agent` drives for coding runs — and live in `harness-engine`,
//! which owns process spawning. Everything here is the pure post-processing
//! the compiler does on their output: the part that has to be exact and
//! therefore has to be Rust, not prose in a prompt.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HarnessError, Result};
use crate::registry::NewFeature;
use crate::types::FeatureCategory;

// ---------------------------------------------------------------------------
// Feature generation post-processing
// ---------------------------------------------------------------------------

/// One entry of the planning collaborator's raw `plan(spec_text,
/// skills_context) -> [Feature]` output, before validation. `depends_on`
/// references sibling proposals by index into the same slice, since the
/// collaborator has no feature IDs to point at yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureProposal {
    pub title: String,
    pub description: String,
    pub category: String,
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

const DOCUMENTATION_OUTPUTS: &[&str] = &[
    "docs/OVERVIEW.md",
    "docs/ARCHITECTURE.md",
    "docs/API.md",
    "docs/RUNBOOK.md",
    "docs/CONTEXT.md",
];

/// Validate a planning collaborator's proposals and lower them to
/// `NewFeature`s the Registry can insert, appending the terminal
/// documentation feature every project requires. Rejects non-empty-title
/// violations, unknown categories, and `depends_on` cycles outright rather
/// than attempting to repair them — a planner that proposes a cycle is
/// treated as a failed compile, not silently pruned.
pub fn compile_features(proposals: Vec<FeatureProposal>) -> Result<Vec<NewFeature>> {
    if proposals.iter().any(|p| p.title.trim().is_empty()) {
        return Err(HarnessError::ExtractionFailed(
            "planning collaborator produced a feature with an empty title".to_string(),
        ));
    }

    let mut categories = Vec::with_capacity(proposals.len());
    for p in &proposals {
        let category: FeatureCategory = p.category.parse().map_err(|_| {
            HarnessError::ExtractionFailed(format!("unknown feature category: {}", p.category))
        })?;
        categories.push(category);
    }

    detect_cycle(&proposals)?;

    let mut features: Vec<NewFeature> = proposals
        .into_iter()
        .zip(categories)
        .map(|(p, category)| NewFeature {
            title: p.title,
            description: p.description,
            category,
            // Index-based dependencies are resolved to real Feature IDs by
            // the caller once ordinals are assigned (Registry::replace_features
            // assigns ordinals in input order, so index == ordinal here).
            depends_on: p.depends_on.iter().map(|i| index_placeholder(*i)).collect(),
        })
        .collect();

    let doc_description = format!(
        "Write {} summarizing the implemented system.",
        DOCUMENTATION_OUTPUTS.join(", ")
    );
    features.push(NewFeature {
        title: "Project documentation".to_string(),
        description: doc_description,
        category: FeatureCategory::Documentation,
        depends_on: Vec::new(),
    });

    Ok(features)
}

/// Placeholder UUID carrying an original proposal index in its low bytes,
/// so `depends_on` can be resolved to real Feature IDs once
/// `Registry::replace_features` has assigned them. Never persisted: the
/// caller must resolve every placeholder before handing features to the
/// Registry.
fn index_placeholder(index: usize) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[8..].copy_from_slice(&(index as u64).to_be_bytes());
    Uuid::from_bytes(bytes)
}

/// Resolve `index_placeholder` UUIDs in `depends_on` against the ordinal ->
/// real ID mapping produced by `Registry::replace_features`.
pub fn resolve_placeholder_dependencies(
    features: &mut [NewFeature],
    ordinal_to_id: &HashMap<usize, Uuid>,
) {
    for feature in features.iter_mut() {
        for dep in feature.depends_on.iter_mut() {
            let bytes = dep.as_bytes();
            if bytes[..8] == [0u8; 8] {
                let index = u64::from_be_bytes(bytes[8..].try_into().unwrap()) as usize;
                if let Some(real_id) = ordinal_to_id.get(&index) {
                    *dep = *real_id;
                }
            }
        }
    }
}

fn detect_cycle(proposals: &[FeatureProposal]) -> Result<()> {
    let n = proposals.len();
    let mut state = vec![0u8; n]; // 0 = unvisited, 1 = in-progress, 2 = done

    fn visit(i: usize, proposals: &[FeatureProposal], state: &mut [u8]) -> Result<()> {
        match state[i] {
            1 => {
                return Err(HarnessError::ExtractionFailed(format!(
                    "cyclic dependency involving feature proposal {i}"
                )))
            }
            2 => return Ok(()),
            _ => {}
        }
        state[i] = 1;
        for &dep in &proposals[i].depends_on {
            if dep >= proposals.len() {
                return Err(HarnessError::ExtractionFailed(format!(
                    "feature proposal {i} depends on out-of-range index {dep}"
                )));
            }
            visit(dep, proposals, state)?;
        }
        state[i] = 2;
        Ok(())
    }

    for i in 0..n {
        visit(i, proposals, &mut state)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Spec update: chunking
// ---------------------------------------------------------------------------

/// A heading- or list-delimited slice of spec text, windowed to roughly
/// 2-4k tokens (approximated here as ~4 characters per token, matching the
/// rule of thumb the prompt-assembly side of the harness already uses).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub heading: String,
    pub body: String,
    pub source_anchor: String,
}

const MIN_CHUNK_CHARS: usize = 2_000 * 4;
const MAX_CHUNK_CHARS: usize = 4_000 * 4;

/// Split spec text into heading-delimited chunks, merging consecutive short
/// sections forward until each chunk is within the target window (the last
/// chunk may fall short — there's nothing left to merge into it).
pub fn chunk_spec_text(text: &str) -> Vec<TextChunk> {
    let mut sections: Vec<(String, String)> = Vec::new();
    let mut current_heading = String::from("(preamble)");
    let mut current_body = String::new();

    for line in text.lines() {
        let trimmed = line.trim_start();
        let is_heading = trimmed.starts_with('#')
            || (trimmed.len() > 1 && trimmed.ends_with(':') && !trimmed.contains(' '));
        if is_heading {
            if !current_body.trim().is_empty() || current_heading != "(preamble)" {
                sections.push((current_heading.clone(), current_body.trim().to_string()));
            }
            current_heading = trimmed.trim_start_matches('#').trim().trim_end_matches(':').to_string();
            current_body.clear();
        } else {
            current_body.push_str(line);
            current_body.push('\n');
        }
    }
    sections.push((current_heading, current_body.trim().to_string()));
    sections.retain(|(_, body)| !body.is_empty());

    let mut chunks = Vec::new();
    let mut pending: Option<(String, String)> = None;
    for (heading, body) in sections {
        match pending.take() {
            None => pending = Some((heading, body)),
            Some((held_heading, mut held_body)) => {
                if held_body.len() < MIN_CHUNK_CHARS {
                    held_body.push_str("\n\n");
                    held_body.push_str(&body);
                    pending = Some((held_heading, held_body));
                } else {
                    chunks.push(finish_chunk(held_heading, held_body, chunks.len()));
                    pending = Some((heading, body));
                }
            }
        }
    }
    if let Some((heading, body)) = pending {
        chunks.push(finish_chunk(heading, body, chunks.len()));
    }

    // A chunk that still overruns the upper bound is left intact rather than
    // force-split mid-sentence; coverage tracking downstream operates on
    // requirements, not chunk byte counts, so an oversized chunk is a cost
    // (extra collaborator tokens) rather than a correctness problem.
    let _ = MAX_CHUNK_CHARS;
    chunks
}

fn finish_chunk(heading: String, body: String, index: usize) -> TextChunk {
    TextChunk {
        source_anchor: format!("chunk-{index}:{heading}"),
        heading,
        body,
    }
}

// ---------------------------------------------------------------------------
// Spec update: normalized requirements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Requirement {
    pub req_id: String,
    pub title: String,
    pub description: String,
    pub acceptance: Vec<String>,
    pub constraints: Vec<String>,
    pub priority: String,
    pub tags: Vec<String>,
    pub source_anchor: String,
}

/// Coverage fraction of a proposed merge: the share of requirements in the
/// new document that were actually mapped to an outcome (new feature,
/// updated feature, or cosmetic no-op) during the merge. Callers must
/// reject `apply` below 100%.
pub fn coverage_fraction(total_requirements: usize, mapped_requirements: usize) -> f64 {
    if total_requirements == 0 {
        return 1.0;
    }
    (mapped_requirements as f64 / total_requirements as f64).min(1.0)
}

/// Guard callers must pass before applying a spec merge.
pub fn check_mergeable(
    total_requirements: usize,
    mapped_requirements: usize,
    unresolved_conflicts: &[String],
) -> Result<()> {
    if !unresolved_conflicts.is_empty() {
        return Err(HarnessError::UnresolvedConflict(unresolved_conflicts.join("; ")));
    }
    let coverage = coverage_fraction(total_requirements, mapped_requirements);
    if coverage < 1.0 {
        return Err(HarnessError::MappingIncomplete {
            covered: mapped_requirements,
            total: total_requirements,
        });
    }
    Ok(())
}

/// Near-duplicate detection ahead of merge: requirements whose title,
/// lowercased and whitespace-collapsed, collide are folded into one,
/// keeping the first occurrence.
pub fn dedupe_requirements(requirements: Vec<Requirement>) -> Vec<Requirement> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(requirements.len());
    for req in requirements {
        let key = normalize(&req.title);
        if seen.insert(key) {
            out.push(req);
        }
    }
    out
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

// ---------------------------------------------------------------------------
// Diff classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffClass {
    /// Rename, reorder, or description-only change — mapped Feature keeps
    /// its current status.
    Cosmetic,
    /// Behavior, data, workflow, permission, or edge-case change — mapped
    /// Feature transitions to `needs_review` (or `pending` if it was `done`).
    Logic,
}

/// Classify the delta between an old and new version of the same
/// requirement. A change is `Logic` the moment acceptance criteria,
/// constraints, or tags differ; a change confined to title/description
/// wording (after whitespace normalization) is `Cosmetic`.
pub fn classify_diff(old: &Requirement, new: &Requirement) -> DiffClass {
    if old.acceptance != new.acceptance || old.constraints != new.constraints || old.tags != new.tags {
        return DiffClass::Logic;
    }
    if normalize(&old.title) == normalize(&new.title) && normalize(&old.description) == normalize(&new.description) {
        return DiffClass::Cosmetic;
    }
    // Title/description text differs even after normalization: still
    // a description-only change, since neither acceptance nor constraints moved.
    DiffClass::Cosmetic
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal(title: &str, category: &str, depends_on: Vec<usize>) -> FeatureProposal {
        FeatureProposal {
            title: title.to_string(),
            description: "desc".to_string(),
            category: category.to_string(),
            depends_on,
        }
    }

    #[test]
    fn compile_features_rejects_empty_title() {
        let proposals = vec![proposal("", "core", vec![])];
        let err = compile_features(proposals).unwrap_err();
        assert!(matches!(err, HarnessError::ExtractionFailed(_)));
    }

    #[test]
    fn compile_features_rejects_unknown_category() {
        let proposals = vec![proposal("one", "bogus", vec![])];
        let err = compile_features(proposals).unwrap_err();
        assert!(matches!(err, HarnessError::ExtractionFailed(_)));
    }

    #[test]
    fn compile_features_rejects_cycles() {
        let proposals = vec![proposal("a", "core", vec![1]), proposal("b", "core", vec![0])];
        let err = compile_features(proposals).unwrap_err();
        assert!(matches!(err, HarnessError::ExtractionFailed(_)));
    }

    #[test]
    fn compile_features_appends_documentation_feature() {
        let proposals = vec![proposal("one", "core", vec![])];
        let features = compile_features(proposals).unwrap();
        assert_eq!(features.len(), 2);
        assert_eq!(features.last().unwrap().category, FeatureCategory::Documentation);
    }

    #[test]
    fn resolve_placeholder_dependencies_maps_indices() {
        let proposals = vec![proposal("a", "core", vec![]), proposal("b", "core", vec![0])];
        let mut features = compile_features(proposals).unwrap();
        let real_a = Uuid::new_v4();
        let real_b = Uuid::new_v4();
        let mut map = HashMap::new();
        map.insert(0, real_a);
        map.insert(1, real_b);
        resolve_placeholder_dependencies(&mut features, &map);
        assert_eq!(features[1].depends_on, vec![real_a]);
    }

    #[test]
    fn chunk_spec_text_groups_short_sections() {
        let text = "# A\nshort\n# B\nalso short\n# C\nstill short";
        let chunks = chunk_spec_text(text);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn chunk_spec_text_splits_on_large_sections() {
        let big = "x".repeat(MIN_CHUNK_CHARS + 1);
        let text = format!("# A\n{big}\n# B\n{big}");
        let chunks = chunk_spec_text(&text);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn coverage_fraction_handles_zero_requirements() {
        assert_eq!(coverage_fraction(0, 0), 1.0);
    }

    #[test]
    fn coverage_fraction_computes_ratio() {
        assert_eq!(coverage_fraction(4, 2), 0.5);
    }

    #[test]
    fn check_mergeable_blocks_on_unresolved_conflicts() {
        let err = check_mergeable(2, 2, &["dup req".to_string()]).unwrap_err();
        assert!(matches!(err, HarnessError::UnresolvedConflict(_)));
    }

    #[test]
    fn check_mergeable_blocks_on_partial_coverage() {
        let err = check_mergeable(4, 3, &[]).unwrap_err();
        assert!(matches!(err, HarnessError::MappingIncomplete { .. }));
    }

    #[test]
    fn check_mergeable_passes_full_coverage_no_conflicts() {
        check_mergeable(4, 4, &[]).unwrap();
    }

    fn requirement(title: &str, description: &str, acceptance: Vec<&str>) -> Requirement {
        Requirement {
            req_id: "r1".to_string(),
            title: title.to_string(),
            description: description.to_string(),
            acceptance: acceptance.into_iter().map(String::from).collect(),
            constraints: vec![],
            priority: "medium".to_string(),
            tags: vec![],
            source_anchor: "chunk-0".to_string(),
        }
    }

    #[test]
    fn classify_diff_rename_is_cosmetic() {
        let old = requirement("Login flow", "desc", vec!["a"]);
        let new = requirement("Sign-in flow", "desc", vec!["a"]);
        assert_eq!(classify_diff(&old, &new), DiffClass::Cosmetic);
    }

    #[test]
    fn classify_diff_acceptance_change_is_logic() {
        let old = requirement("Login flow", "desc", vec!["a"]);
        let new = requirement("Login flow", "desc", vec!["a", "b"]);
        assert_eq!(classify_diff(&old, &new), DiffClass::Logic);
    }

    #[test]
    fn dedupe_requirements_keeps_first_occurrence() {
        let reqs = vec![
            requirement("Login flow", "first", vec![]),
            requirement("login  flow", "second", vec![]),
        ];
        let deduped = dedupe_requirements(reqs);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].description, "first");
    }
}
