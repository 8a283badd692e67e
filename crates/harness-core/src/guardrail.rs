//! The Guardrail Enforcer: a pure function that renders a base
//! prompt template into the text an agent subprocess actually receives,
//! injecting the obligations the harness cannot enforce by sandboxing
//! (env/config policy, TDD, model selection, documentation) as prose
//! instead. Grounded on `sdlc-core::directive::build_directive`'s
//! string-assembly shape, generalized from a single `Classification` input
//! to `AgentSettings` + `AgentMode` + a loaded skill manifest.

use std::fmt;
use std::path::Path;

use crate::entities::AgentSettings;
use crate::types::AgentMode;

// ---------------------------------------------------------------------------
// Skill packs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillCategory {
    SpecCreation,
    Coding,
    Testing,
    Redesign,
}

impl SkillCategory {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "spec_creation" => Some(SkillCategory::SpecCreation),
            "coding" => Some(SkillCategory::Coding),
            "testing" => Some(SkillCategory::Testing),
            "redesign" => Some(SkillCategory::Redesign),
            _ => None,
        }
    }
}

impl fmt::Display for SkillCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkillCategory::SpecCreation => "spec_creation",
            SkillCategory::Coding => "coding",
            SkillCategory::Testing => "testing",
            SkillCategory::Redesign => "redesign",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct SkillEntry {
    pub category: SkillCategory,
    pub name: String,
    pub content: String,
}

/// Flat manifest produced by a read-only scan of `skills/<category>/*.md`.
/// Subdirectories whose name isn't a known `SkillCategory` are skipped with
/// a warning rather than failing the load.
#[derive(Debug, Clone, Default)]
pub struct SkillManifest {
    pub entries: Vec<SkillEntry>,
    pub warnings: Vec<String>,
}

impl SkillManifest {
    pub fn for_category(&self, category: SkillCategory) -> impl Iterator<Item = &SkillEntry> {
        self.entries.iter().filter(move |e| e.category == category)
    }
}

/// Scan `skills_dir` for category subdirectories, each
/// holding one file per skill. Missing `skills_dir` yields an empty,
/// warning-free manifest — skill packs are optional.
pub fn load_skills(skills_dir: &Path) -> SkillManifest {
    let mut manifest = SkillManifest::default();
    let Ok(category_dirs) = std::fs::read_dir(skills_dir) else {
        return manifest;
    };

    for category_entry in category_dirs.flatten() {
        let Ok(file_type) = category_entry.file_type() else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }
        let dir_name = category_entry.file_name().to_string_lossy().to_string();
        let Some(category) = SkillCategory::parse(&dir_name) else {
            manifest
                .warnings
                .push(format!("unknown skill category directory: {dir_name}"));
            continue;
        };

        let Ok(files) = std::fs::read_dir(category_entry.path()) else {
            continue;
        };
        for file_entry in files.flatten() {
            let path = file_entry.path();
            if !path.is_file() {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(&path) else {
                manifest
                    .warnings
                    .push(format!("could not read skill file: {}", path.display()));
                continue;
            };
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            manifest.entries.push(SkillEntry { category, name, content });
        }
    }

    manifest
}

// ---------------------------------------------------------------------------
// Prompt rendering
// ---------------------------------------------------------------------------

const DOCUMENTATION_OUTPUTS: &[&str] = &[
    "docs/OVERVIEW.md",
    "docs/ARCHITECTURE.md",
    "docs/API.md",
    "docs/RUNBOOK.md",
    "docs/CONTEXT.md",
];

/// Render `base_prompt` with every guardrail obligation appended as its own
/// section. The obligations are text, not executable sandboxing — the
/// agent subprocess is trusted to honor them, the same trust relationship
/// every prompt-driven harness has with its child process.
pub fn render_prompt(
    base_prompt: &str,
    settings: &AgentSettings,
    mode: AgentMode,
    skills: &SkillManifest,
) -> String {
    let mut doc = String::new();

    doc.push_str(base_prompt.trim_end());
    doc.push_str("\n\n");

    doc.push_str("## Guardrails\n\n");
    doc.push_str(&format!("- **Mode:** {mode}\n"));
    doc.push_str(&format!("- **Model:** {} (already selected; do not request a different one)\n", settings.model_id));
    doc.push_str(
        "- **Config policy:** never hardcode URLs, API keys, or credentials. Read configuration \
         from the project's config layer and reference it by name.\n",
    );
    if settings.require_tdd {
        doc.push_str(
            "- **TDD policy:** write a failing test for any code-level logic change before \
             implementing it. Do not implement first and backfill tests.\n",
        );
    }

    if mode == AgentMode::Initializer {
        doc.push_str(
            "- **Coverage review:** before emitting the final feature plan, review it against \
             the input spec and confirm every requirement maps to at least one feature.\n",
        );
        doc.push_str(&format!(
            "- **Documentation feature:** the plan must include a terminal feature of category \
             `documentation` that writes {}.\n",
            DOCUMENTATION_OUTPUTS.join(", ")
        ));
        for skill in skills.for_category(SkillCategory::SpecCreation) {
            doc.push_str(&format!("\n### Skill: {}\n\n{}\n", skill.name, skill.content.trim_end()));
        }
    }

    let category = match mode {
        AgentMode::Initializer => None,
        AgentMode::Coding | AgentMode::Regression => Some(SkillCategory::Coding),
        AgentMode::Redesign => Some(SkillCategory::Redesign),
    };
    if let Some(category) = category {
        for skill in skills.for_category(category) {
            doc.push_str(&format!("\n### Skill: {}\n\n{}\n", skill.name, skill.content.trim_end()));
        }
    }

    if !doc.ends_with('\n') {
        doc.push('\n');
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_skill(dir: &Path, category: &str, name: &str, content: &str) {
        let category_dir = dir.join(category);
        std::fs::create_dir_all(&category_dir).unwrap();
        std::fs::write(category_dir.join(format!("{name}.md")), content).unwrap();
    }

    #[test]
    fn load_skills_handles_missing_directory() {
        let manifest = load_skills(Path::new("/nonexistent/skills"));
        assert!(manifest.entries.is_empty());
        assert!(manifest.warnings.is_empty());
    }

    #[test]
    fn load_skills_groups_by_category() {
        let dir = TempDir::new().unwrap();
        write_skill(dir.path(), "coding", "error-handling", "Use Result everywhere.");
        write_skill(dir.path(), "spec_creation", "coverage-review", "Check coverage.");
        let manifest = load_skills(dir.path());
        assert_eq!(manifest.entries.len(), 2);
        assert_eq!(manifest.for_category(SkillCategory::Coding).count(), 1);
    }

    #[test]
    fn load_skills_warns_on_unknown_category() {
        let dir = TempDir::new().unwrap();
        write_skill(dir.path(), "mystery", "x", "content");
        let manifest = load_skills(dir.path());
        assert!(manifest.entries.is_empty());
        assert_eq!(manifest.warnings.len(), 1);
    }

    #[test]
    fn render_prompt_includes_tdd_when_required() {
        let settings = AgentSettings {
            require_tdd: true,
            ..AgentSettings::default()
        };
        let rendered = render_prompt("Implement feature X.", &settings, AgentMode::Coding, &SkillManifest::default());
        assert!(rendered.contains("TDD policy"));
    }

    #[test]
    fn render_prompt_omits_tdd_when_not_required() {
        let settings = AgentSettings {
            require_tdd: false,
            ..AgentSettings::default()
        };
        let rendered = render_prompt("Implement feature X.", &settings, AgentMode::Coding, &SkillManifest::default());
        assert!(!rendered.contains("TDD policy"));
    }

    #[test]
    fn render_prompt_initializer_includes_documentation_and_coverage() {
        let settings = AgentSettings::default();
        let rendered = render_prompt("Plan the project.", &settings, AgentMode::Initializer, &SkillManifest::default());
        assert!(rendered.contains("Coverage review"));
        assert!(rendered.contains("docs/OVERVIEW.md"));
    }

    #[test]
    fn render_prompt_includes_matching_skill_pack() {
        let dir = TempDir::new().unwrap();
        write_skill(dir.path(), "redesign", "token-extraction", "Extract tokens carefully.");
        let manifest = load_skills(dir.path());
        let settings = AgentSettings::default();
        let rendered = render_prompt("Redesign the UI.", &settings, AgentMode::Redesign, &manifest);
        assert!(rendered.contains("token-extraction"));
        assert!(rendered.contains("Extract tokens carefully."));
    }

    #[test]
    fn render_prompt_never_mixes_skill_categories() {
        let dir = TempDir::new().unwrap();
        write_skill(dir.path(), "testing", "coverage", "Write unit tests.");
        let manifest = load_skills(dir.path());
        let settings = AgentSettings::default();
        let rendered = render_prompt("Do the work.", &settings, AgentMode::Coding, &manifest);
        assert!(!rendered.contains("coverage"));
    }
}
