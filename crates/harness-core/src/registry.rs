//! The Registry Store: a single-writer, transactional catalog
//! of projects, features, runs, redesign sessions, and references.
//!
//! Grounded on `orchestrator::db::ActionDb`: one `redb::Database` handle,
//! JSON-encoded values, composite keys chosen so that range scans fall out
//! of key ordering for free. Generalized from ActionDb's single table to
//! the full entity set this crate tracks, with every multi-entity mutation (e.g.
//! transitioning a Feature to `done` while finishing its Run) wrapped in one
//! `WriteTransaction` so it is atomic by construction rather than by
//! convention.

use std::path::Path;

use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use uuid::Uuid;

use crate::entities::{
    ChangePlan, DesignTokens, Feature, Project, Reference, RedesignSession, Run, SpecVersion,
};
use crate::error::{HarnessError, Result};
use crate::types::{ExitReason, FeatureCategory, FeatureStatus, RedesignPhase, RedesignStatus, RunKind, RunStatus};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const PROJECTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("projects");
const PROJECT_NAMES: TableDefinition<&str, &[u8]> = TableDefinition::new("project_names");
const SPEC_VERSIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("spec_versions");
const FEATURES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("features");
const FEATURE_ORDINALS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("feature_ordinals");
const RUNS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("runs");
const PROJECT_ACTIVE_RUN: TableDefinition<&[u8], &[u8]> = TableDefinition::new("project_active_run");
const REDESIGN_SESSIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("redesign_sessions");
const PROJECT_ACTIVE_REDESIGN: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("project_active_redesign");
const REFERENCES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("references");

const SCHEMA_VERSION: &[u8] = b"1";

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn spec_version_key(project_id: Uuid, version_id: u32) -> [u8; 20] {
    let mut key = [0u8; 20];
    key[..16].copy_from_slice(project_id.as_bytes());
    key[16..].copy_from_slice(&version_id.to_be_bytes());
    key
}

fn ordinal_key(project_id: Uuid, ordinal: u32) -> [u8; 20] {
    let mut key = [0u8; 20];
    key[..16].copy_from_slice(project_id.as_bytes());
    key[16..].copy_from_slice(&ordinal.to_be_bytes());
    key
}

fn db_err(e: impl std::fmt::Display) -> HarnessError {
    HarnessError::Registry(e.to_string())
}

/// Input for `replace_features`: everything the Spec Compiler decides,
/// minus the identity/bookkeeping fields the Registry assigns.
#[derive(Debug, Clone)]
pub struct NewFeature {
    pub title: String,
    pub description: String,
    pub category: FeatureCategory,
    pub depends_on: Vec<Uuid>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct Registry {
    db: Database,
}

impl Registry {
    /// Open or create the registry database at `path`, running forward-only
    /// migrations if the on-disk schema is older than `SCHEMA_VERSION`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        {
            wt.open_table(META).map_err(db_err)?;
            wt.open_table(PROJECTS).map_err(db_err)?;
            wt.open_table(PROJECT_NAMES).map_err(db_err)?;
            wt.open_table(SPEC_VERSIONS).map_err(db_err)?;
            wt.open_table(FEATURES).map_err(db_err)?;
            wt.open_table(FEATURE_ORDINALS).map_err(db_err)?;
            wt.open_table(RUNS).map_err(db_err)?;
            wt.open_table(PROJECT_ACTIVE_RUN).map_err(db_err)?;
            wt.open_table(REDESIGN_SESSIONS).map_err(db_err)?;
            wt.open_table(PROJECT_ACTIVE_REDESIGN).map_err(db_err)?;
            wt.open_table(REFERENCES).map_err(db_err)?;
            let mut meta = wt.open_table(META).map_err(db_err)?;
            if meta.get("schema_version").map_err(db_err)?.is_none() {
                meta.insert("schema_version", SCHEMA_VERSION)
                    .map_err(db_err)?;
            }
        }
        wt.commit().map_err(db_err)?;
        Ok(Registry { db })
    }

    // -----------------------------------------------------------------
    // Project
    // -----------------------------------------------------------------

    pub fn create_project(&self, name: &str, workspace_path: &str) -> Result<Project> {
        let project = Project::new(name, workspace_path);
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut names = wt.open_table(PROJECT_NAMES).map_err(db_err)?;
            if names.get(name).map_err(db_err)?.is_some() {
                return Err(HarnessError::ProjectExists(name.to_string()));
            }
            names
                .insert(name, project.id.as_bytes().as_slice())
                .map_err(db_err)?;

            let mut projects = wt.open_table(PROJECTS).map_err(db_err)?;
            let value = serde_json::to_vec(&project)?;
            projects
                .insert(project.id.as_bytes().as_slice(), value.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(project)
    }

    pub fn delete_project(&self, id: Uuid) -> Result<()> {
        let project = self.get_project(id)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut projects = wt.open_table(PROJECTS).map_err(db_err)?;
            projects.remove(id.as_bytes().as_slice()).map_err(db_err)?;
            let mut names = wt.open_table(PROJECT_NAMES).map_err(db_err)?;
            names.remove(project.name.as_str()).map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn get_project(&self, id: Uuid) -> Result<Project> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(PROJECTS).map_err(db_err)?;
        let value = table
            .get(id.as_bytes().as_slice())
            .map_err(db_err)?
            .ok_or_else(|| HarnessError::ProjectNotFound(id.to_string()))?;
        Ok(serde_json::from_slice(value.value())?)
    }

    pub fn get_project_by_name(&self, name: &str) -> Result<Project> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let names = rt.open_table(PROJECT_NAMES).map_err(db_err)?;
        let id_bytes = names
            .get(name)
            .map_err(db_err)?
            .ok_or_else(|| HarnessError::ProjectNotFound(name.to_string()))?;
        let id = Uuid::from_slice(id_bytes.value()).map_err(|e| db_err(e))?;
        drop(names);
        drop(rt);
        self.get_project(id)
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(PROJECTS).map_err(db_err)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            out.push(serde_json::from_slice(v.value())?);
        }
        out.sort_by(|a: &Project, b: &Project| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    fn put_project(&self, wt: &redb::WriteTransaction, project: &Project) -> Result<()> {
        let mut table = wt.open_table(PROJECTS).map_err(db_err)?;
        let value = serde_json::to_vec(project)?;
        table
            .insert(project.id.as_bytes().as_slice(), value.as_slice())
            .map_err(db_err)?;
        Ok(())
    }

    /// Mutate a project's `AgentSettings`. Rejected with `SettingsLocked`
    /// while `locked` is true (spec.md §4.9: "`AgentSettings.locked` is true
    /// during any active run; attempts to mutate settings while locked are
    /// rejected at the Registry boundary") — `start_run`/`finish_run` are
    /// the only other writers of `locked` itself.
    pub fn update_agent_settings(
        &self,
        project_id: Uuid,
        edit: impl FnOnce(&mut crate::entities::AgentSettings),
    ) -> Result<Project> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let project = {
            let mut projects = wt.open_table(PROJECTS).map_err(db_err)?;
            let value = projects
                .get(project_id.as_bytes().as_slice())
                .map_err(db_err)?
                .ok_or_else(|| HarnessError::ProjectNotFound(project_id.to_string()))?;
            let mut project: Project = serde_json::from_slice(value.value())?;
            drop(value);

            if project.agent_settings.locked {
                return Err(HarnessError::SettingsLocked);
            }

            edit(&mut project.agent_settings);
            project.updated_at = Utc::now();
            let v = serde_json::to_vec(&project)?;
            projects
                .insert(project.id.as_bytes().as_slice(), v.as_slice())
                .map_err(db_err)?;
            project
        };
        wt.commit().map_err(db_err)?;
        Ok(project)
    }

    // -----------------------------------------------------------------
    // SpecArtifact
    // -----------------------------------------------------------------

    /// Append a new spec version, bumping `Project.spec_version`. Atomic:
    /// the version record and the project's counter update in one
    /// transaction, so a reader never observes a bumped counter without
    /// the corresponding version text.
    pub fn append_spec_version(&self, project_id: Uuid, text: &str) -> Result<SpecVersion> {
        let mut project = self.get_project(project_id)?;
        let version_id = project.spec_version + 1;
        let diff_from_prev = if version_id > 1 {
            self.get_spec_version(project_id, version_id - 1)
                .ok()
                .map(|prev| diff_summary(&prev.source_text, text))
        } else {
            None
        };
        let version = SpecVersion {
            project_id,
            version_id,
            source_text: text.to_string(),
            created_at: Utc::now(),
            diff_from_prev,
        };

        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(SPEC_VERSIONS).map_err(db_err)?;
            let key = spec_version_key(project_id, version_id);
            let value = serde_json::to_vec(&version)?;
            table.insert(key.as_slice(), value.as_slice()).map_err(db_err)?;
            project.spec_version = version_id;
            project.updated_at = Utc::now();
            self.put_project(&wt, &project)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(version)
    }

    pub fn get_spec_version(&self, project_id: Uuid, version_id: u32) -> Result<SpecVersion> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(SPEC_VERSIONS).map_err(db_err)?;
        let key = spec_version_key(project_id, version_id);
        let value = table
            .get(key.as_slice())
            .map_err(db_err)?
            .ok_or_else(|| HarnessError::Internal(format!("spec version not found: {version_id}")))?;
        Ok(serde_json::from_slice(value.value())?)
    }

    pub fn latest_spec_version(&self, project_id: Uuid) -> Result<Option<SpecVersion>> {
        let project = self.get_project(project_id)?;
        if project.spec_version == 0 {
            return Ok(None);
        }
        Ok(Some(self.get_spec_version(project_id, project.spec_version)?))
    }

    // -----------------------------------------------------------------
    // Feature
    // -----------------------------------------------------------------

    /// Atomic replace of a project's entire feature backlog. Used only by
    /// the Spec Compiler's initial generation — later calls are rejected by
    /// the Run Orchestrator once `INITIALIZING` has completed (enforced by
    /// the caller, not here; see `harness-engine::orchestrator`).
    pub fn replace_features(&self, project_id: Uuid, inputs: Vec<NewFeature>) -> Result<Vec<Feature>> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let mut created = Vec::with_capacity(inputs.len());
        {
            let mut features = wt.open_table(FEATURES).map_err(db_err)?;
            let mut ordinals = wt.open_table(FEATURE_ORDINALS).map_err(db_err)?;

            // Remove the project's existing features and ordinal index
            // entries before inserting the replacement set.
            let existing: Vec<Feature> = {
                let mut out = Vec::new();
                for entry in features.iter().map_err(db_err)? {
                    let (_, v) = entry.map_err(db_err)?;
                    let f: Feature = serde_json::from_slice(v.value())?;
                    if f.project_id == project_id {
                        out.push(f);
                    }
                }
                out
            };
            for f in &existing {
                features.remove(f.id.as_bytes().as_slice()).map_err(db_err)?;
                let key = ordinal_key(project_id, f.ordinal);
                ordinals.remove(key.as_slice()).map_err(db_err)?;
            }

            for (ordinal, input) in inputs.into_iter().enumerate() {
                let feature = Feature::new(
                    project_id,
                    ordinal as u32,
                    input.title,
                    input.description,
                    input.category,
                    input.depends_on,
                );
                let key = ordinal_key(project_id, feature.ordinal);
                ordinals
                    .insert(key.as_slice(), feature.id.as_bytes().as_slice())
                    .map_err(db_err)?;
                let value = serde_json::to_vec(&feature)?;
                features
                    .insert(feature.id.as_bytes().as_slice(), value.as_slice())
                    .map_err(db_err)?;
                created.push(feature);
            }
        }
        wt.commit().map_err(db_err)?;
        Ok(created)
    }

    pub fn get_feature(&self, id: Uuid) -> Result<Feature> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(FEATURES).map_err(db_err)?;
        let value = table
            .get(id.as_bytes().as_slice())
            .map_err(db_err)?
            .ok_or_else(|| HarnessError::FeatureNotFound(id.to_string()))?;
        Ok(serde_json::from_slice(value.value())?)
    }

    pub fn list_features(&self, project_id: Uuid) -> Result<Vec<Feature>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(FEATURES).map_err(db_err)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            let f: Feature = serde_json::from_slice(v.value())?;
            if f.project_id == project_id {
                out.push(f);
            }
        }
        out.sort_by_key(|f| f.ordinal);
        Ok(out)
    }

    fn put_feature(&self, wt: &redb::WriteTransaction, feature: &Feature) -> Result<()> {
        let mut table = wt.open_table(FEATURES).map_err(db_err)?;
        let value = serde_json::to_vec(feature)?;
        table
            .insert(feature.id.as_bytes().as_slice(), value.as_slice())
            .map_err(db_err)?;
        Ok(())
    }

    /// Transition a Feature's status, enforcing the feature status machine.
    /// Admission to `in_progress` fails with `conflict` if another
    /// feature in the same project already holds that status.
    pub fn transition_feature(
        &self,
        feature_id: Uuid,
        new_status: FeatureStatus,
        reason: Option<&str>,
    ) -> Result<Feature> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let feature = {
            let mut features = wt.open_table(FEATURES).map_err(db_err)?;
            let value = features
                .get(feature_id.as_bytes().as_slice())
                .map_err(db_err)?
                .ok_or_else(|| HarnessError::FeatureNotFound(feature_id.to_string()))?;
            let mut feature: Feature = serde_json::from_slice(value.value())?;
            drop(value);

            if !feature.status.can_transition_to(new_status) {
                return Err(HarnessError::InvalidTransition {
                    from: feature.status.to_string(),
                    to: new_status.to_string(),
                    reason: reason.unwrap_or("no edge in the feature state machine").to_string(),
                });
            }

            if new_status == FeatureStatus::InProgress {
                for entry in features.iter().map_err(db_err)? {
                    let (_, v) = entry.map_err(db_err)?;
                    let other: Feature = serde_json::from_slice(v.value())?;
                    if other.project_id == feature.project_id
                        && other.id != feature.id
                        && other.status == FeatureStatus::InProgress
                    {
                        return Err(HarnessError::FeatureAlreadyClaimed(other.id.to_string()));
                    }
                }
            }

            feature.status = new_status;
            feature.updated_at = Utc::now();
            if new_status == FeatureStatus::Blocked || new_status == FeatureStatus::NeedsReview {
                feature.last_error = reason.map(str::to_string);
            }
            if new_status == FeatureStatus::Pending && feature.last_error.is_some() {
                // returning from Blocked clears the error that caused it
                feature.last_error = None;
            }
            let value = serde_json::to_vec(&feature)?;
            features
                .insert(feature.id.as_bytes().as_slice(), value.as_slice())
                .map_err(db_err)?;
            feature
        };
        wt.commit().map_err(db_err)?;
        Ok(feature)
    }

    /// Increment `attempt_count` on a feature (a run exited without
    /// completing it). Does not change status — the caller decides whether
    /// to retry (`pending`, via `transition_feature`) or escalate to
    /// `needs_review`.
    pub fn record_feature_attempt_failure(&self, feature_id: Uuid, error: &str) -> Result<Feature> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let feature = {
            let mut features = wt.open_table(FEATURES).map_err(db_err)?;
            let value = features
                .get(feature_id.as_bytes().as_slice())
                .map_err(db_err)?
                .ok_or_else(|| HarnessError::FeatureNotFound(feature_id.to_string()))?;
            let mut feature: Feature = serde_json::from_slice(value.value())?;
            drop(value);
            feature.attempt_count += 1;
            feature.last_error = Some(error.to_string());
            feature.updated_at = Utc::now();
            let v = serde_json::to_vec(&feature)?;
            features
                .insert(feature.id.as_bytes().as_slice(), v.as_slice())
                .map_err(db_err)?;
            feature
        };
        wt.commit().map_err(db_err)?;
        Ok(feature)
    }

    // -----------------------------------------------------------------
    // Run
    // -----------------------------------------------------------------

    /// Admit a new run for `project_id`. Fails with `conflict` if the
    /// project already has a non-terminal run. Locks the project's
    /// `AgentSettings` for the run's duration (spec.md §4.9) in the same
    /// transaction, so a settings write racing a run admission can never
    /// land in the gap between the two.
    pub fn start_run(&self, project_id: Uuid, kind: RunKind, feature_id: Option<Uuid>, model_id: &str) -> Result<Run> {
        let run = Run::new(project_id, kind, feature_id, model_id);
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut active = wt.open_table(PROJECT_ACTIVE_RUN).map_err(db_err)?;
            if active.get(project_id.as_bytes().as_slice()).map_err(db_err)?.is_some() {
                return Err(HarnessError::RunAlreadyActive);
            }
            active
                .insert(project_id.as_bytes().as_slice(), run.id.as_bytes().as_slice())
                .map_err(db_err)?;

            let mut runs = wt.open_table(RUNS).map_err(db_err)?;
            let value = serde_json::to_vec(&run)?;
            runs.insert(run.id.as_bytes().as_slice(), value.as_slice()).map_err(db_err)?;

            let mut projects = wt.open_table(PROJECTS).map_err(db_err)?;
            let pvalue = projects
                .get(project_id.as_bytes().as_slice())
                .map_err(db_err)?
                .ok_or_else(|| HarnessError::ProjectNotFound(project_id.to_string()))?;
            let mut project: Project = serde_json::from_slice(pvalue.value())?;
            drop(pvalue);
            project.agent_settings.locked = true;
            let pv = serde_json::to_vec(&project)?;
            projects.insert(project.id.as_bytes().as_slice(), pv.as_slice()).map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(run)
    }

    pub fn get_run(&self, id: Uuid) -> Result<Run> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(RUNS).map_err(db_err)?;
        let value = table
            .get(id.as_bytes().as_slice())
            .map_err(db_err)?
            .ok_or_else(|| HarnessError::RunNotFound(id.to_string()))?;
        Ok(serde_json::from_slice(value.value())?)
    }

    pub fn active_run(&self, project_id: Uuid) -> Result<Option<Run>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let active = rt.open_table(PROJECT_ACTIVE_RUN).map_err(db_err)?;
        let Some(id_bytes) = active.get(project_id.as_bytes().as_slice()).map_err(db_err)? else {
            return Ok(None);
        };
        let id = Uuid::from_slice(id_bytes.value()).map_err(db_err)?;
        drop(active);
        drop(rt);
        Ok(Some(self.get_run(id)?))
    }

    pub fn update_run_status(&self, run_id: Uuid, status: RunStatus, pid: Option<u32>) -> Result<Run> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let run = {
            let mut runs = wt.open_table(RUNS).map_err(db_err)?;
            let value = runs
                .get(run_id.as_bytes().as_slice())
                .map_err(db_err)?
                .ok_or_else(|| HarnessError::RunNotFound(run_id.to_string()))?;
            let mut run: Run = serde_json::from_slice(value.value())?;
            drop(value);
            run.status = status;
            if pid.is_some() {
                run.pid = pid;
            }
            let v = serde_json::to_vec(&run)?;
            runs.insert(run.id.as_bytes().as_slice(), v.as_slice()).map_err(db_err)?;
            run
        };
        wt.commit().map_err(db_err)?;
        Ok(run)
    }

    /// Finish a run and release the project's active-run slot in one
    /// transaction.
    pub fn finish_run(&self, run_id: Uuid, exit_reason: ExitReason, last_error: Option<&str>) -> Result<Run> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let run = {
            let mut runs = wt.open_table(RUNS).map_err(db_err)?;
            let value = runs
                .get(run_id.as_bytes().as_slice())
                .map_err(db_err)?
                .ok_or_else(|| HarnessError::RunNotFound(run_id.to_string()))?;
            let mut run: Run = serde_json::from_slice(value.value())?;
            drop(value);
            run.status = if matches!(exit_reason, ExitReason::Clean) {
                RunStatus::Finished
            } else {
                RunStatus::Failed
            };
            run.exit_reason = Some(exit_reason);
            run.finished_at = Some(Utc::now());
            run.last_error = last_error.map(str::to_string);
            let v = serde_json::to_vec(&run)?;
            runs.insert(run.id.as_bytes().as_slice(), v.as_slice()).map_err(db_err)?;

            let mut active = wt.open_table(PROJECT_ACTIVE_RUN).map_err(db_err)?;
            if let Some(current) = active.get(run.project_id.as_bytes().as_slice()).map_err(db_err)? {
                if current.value() == run.id.as_bytes().as_slice() {
                    drop(current);
                    active.remove(run.project_id.as_bytes().as_slice()).map_err(db_err)?;

                    let mut projects = wt.open_table(PROJECTS).map_err(db_err)?;
                    if let Some(pvalue) = projects.get(run.project_id.as_bytes().as_slice()).map_err(db_err)? {
                        let mut project: Project = serde_json::from_slice(pvalue.value())?;
                        drop(pvalue);
                        project.agent_settings.locked = false;
                        let pv = serde_json::to_vec(&project)?;
                        projects
                            .insert(project.id.as_bytes().as_slice(), pv.as_slice())
                            .map_err(db_err)?;
                    }
                }
            }
            run
        };
        wt.commit().map_err(db_err)?;
        Ok(run)
    }

    /// Atomically mark a Feature `done` and finish its Run — transitioning
    /// the feature to done and appending a Run outcome in one unit.
    /// Idempotent: if the feature is already `done` and was completed by
    /// this run, returns the current state without error.
    pub fn complete_feature_and_finish_run(
        &self,
        feature_id: Uuid,
        run_id: Uuid,
    ) -> Result<(Feature, Run)> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let (feature, run) = {
            let mut features = wt.open_table(FEATURES).map_err(db_err)?;
            let fvalue = features
                .get(feature_id.as_bytes().as_slice())
                .map_err(db_err)?
                .ok_or_else(|| HarnessError::FeatureNotFound(feature_id.to_string()))?;
            let mut feature: Feature = serde_json::from_slice(fvalue.value())?;
            drop(fvalue);

            let mut runs = wt.open_table(RUNS).map_err(db_err)?;
            let rvalue = runs
                .get(run_id.as_bytes().as_slice())
                .map_err(db_err)?
                .ok_or_else(|| HarnessError::RunNotFound(run_id.to_string()))?;
            let mut run: Run = serde_json::from_slice(rvalue.value())?;
            drop(rvalue);

            if feature.status == FeatureStatus::Done {
                // idempotent re-entry from the same run
                return Ok((feature, run));
            }

            if !feature.status.can_transition_to(FeatureStatus::Done) {
                return Err(HarnessError::InvalidTransition {
                    from: feature.status.to_string(),
                    to: FeatureStatus::Done.to_string(),
                    reason: "feature must be in_progress to complete".to_string(),
                });
            }

            feature.status = FeatureStatus::Done;
            feature.updated_at = Utc::now();
            let fv = serde_json::to_vec(&feature)?;
            features
                .insert(feature.id.as_bytes().as_slice(), fv.as_slice())
                .map_err(db_err)?;

            run.status = RunStatus::Finished;
            run.exit_reason = Some(ExitReason::Clean);
            run.finished_at = Some(Utc::now());
            let rv = serde_json::to_vec(&run)?;
            runs.insert(run.id.as_bytes().as_slice(), rv.as_slice()).map_err(db_err)?;

            let mut active = wt.open_table(PROJECT_ACTIVE_RUN).map_err(db_err)?;
            if let Some(current) = active.get(run.project_id.as_bytes().as_slice()).map_err(db_err)? {
                if current.value() == run.id.as_bytes().as_slice() {
                    drop(current);
                    active.remove(run.project_id.as_bytes().as_slice()).map_err(db_err)?;
                }
            }

            (feature, run)
        };
        wt.commit().map_err(db_err)?;
        Ok((feature, run))
    }

    // -----------------------------------------------------------------
    // RedesignSession
    // -----------------------------------------------------------------

    pub fn create_redesign_session(&self, project_id: Uuid, style_brief: &str) -> Result<RedesignSession> {
        let session = RedesignSession::new(project_id, style_brief);
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut active = wt.open_table(PROJECT_ACTIVE_REDESIGN).map_err(db_err)?;
            if active.get(project_id.as_bytes().as_slice()).map_err(db_err)?.is_some() {
                return Err(HarnessError::RedesignSessionAlreadyActive);
            }
            active
                .insert(project_id.as_bytes().as_slice(), session.id.as_bytes().as_slice())
                .map_err(db_err)?;
            let mut sessions = wt.open_table(REDESIGN_SESSIONS).map_err(db_err)?;
            let value = serde_json::to_vec(&session)?;
            sessions
                .insert(session.id.as_bytes().as_slice(), value.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(session)
    }

    pub fn get_redesign_session(&self, id: Uuid) -> Result<RedesignSession> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(REDESIGN_SESSIONS).map_err(db_err)?;
        let value = table
            .get(id.as_bytes().as_slice())
            .map_err(db_err)?
            .ok_or_else(|| HarnessError::RedesignSessionNotFound(id.to_string()))?;
        Ok(serde_json::from_slice(value.value())?)
    }

    fn with_session<F>(&self, id: Uuid, f: F) -> Result<RedesignSession>
    where
        F: FnOnce(&mut RedesignSession) -> Result<()>,
    {
        let wt = self.db.begin_write().map_err(db_err)?;
        let session = {
            let mut sessions = wt.open_table(REDESIGN_SESSIONS).map_err(db_err)?;
            let value = sessions
                .get(id.as_bytes().as_slice())
                .map_err(db_err)?
                .ok_or_else(|| HarnessError::RedesignSessionNotFound(id.to_string()))?;
            let mut session: RedesignSession = serde_json::from_slice(value.value())?;
            drop(value);
            f(&mut session)?;
            let v = serde_json::to_vec(&session)?;
            sessions
                .insert(session.id.as_bytes().as_slice(), v.as_slice())
                .map_err(db_err)?;
            session
        };
        if session.status.is_terminal() {
            let mut active = wt.open_table(PROJECT_ACTIVE_REDESIGN).map_err(db_err)?;
            if let Some(current) = active
                .get(session.project_id.as_bytes().as_slice())
                .map_err(db_err)?
            {
                if current.value() == session.id.as_bytes().as_slice() {
                    drop(current);
                    active
                        .remove(session.project_id.as_bytes().as_slice())
                        .map_err(db_err)?;
                }
            }
        }
        wt.commit().map_err(db_err)?;
        Ok(session)
    }

    /// Advance status forward-only, or force `Cancelled` from any
    /// non-terminal state.
    pub fn update_redesign_status(&self, id: Uuid, status: RedesignStatus) -> Result<RedesignSession> {
        self.with_session(id, |session| {
            if session.status.is_terminal() {
                return Err(HarnessError::InvalidPhase(format!(
                    "session already in terminal state {}",
                    session.status
                )));
            }
            if status != RedesignStatus::Cancelled && session.status.next() != Some(status) {
                return Err(HarnessError::InvalidPhase(format!(
                    "cannot advance session from {} to {status}",
                    session.status
                )));
            }
            session.status = status;
            Ok(())
        })
    }

    pub fn record_phase_approval(&self, id: Uuid, phase: RedesignPhase) -> Result<RedesignSession> {
        self.with_session(id, |session| {
            session.phase_approvals.set(phase);
            Ok(())
        })
    }

    pub fn set_design_tokens(&self, id: Uuid, tokens: DesignTokens) -> Result<RedesignSession> {
        self.with_session(id, |session| {
            session.extracted_tokens = Some(tokens);
            Ok(())
        })
    }

    pub fn set_change_plan(&self, id: Uuid, plan: ChangePlan) -> Result<RedesignSession> {
        self.with_session(id, |session| {
            session.change_plan = Some(plan);
            Ok(())
        })
    }

    pub fn attach_reference(&self, session_id: Uuid, reference_id: Uuid) -> Result<RedesignSession> {
        self.with_session(session_id, |session| {
            session.references.push(reference_id);
            Ok(())
        })
    }

    // -----------------------------------------------------------------
    // Reference
    // -----------------------------------------------------------------

    pub fn create_reference(&self, reference: Reference) -> Result<Reference> {
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(REFERENCES).map_err(db_err)?;
            let value = serde_json::to_vec(&reference)?;
            table
                .insert(reference.id.as_bytes().as_slice(), value.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(reference)
    }

    pub fn get_reference(&self, id: Uuid) -> Result<Reference> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(REFERENCES).map_err(db_err)?;
        let value = table
            .get(id.as_bytes().as_slice())
            .map_err(db_err)?
            .ok_or_else(|| HarnessError::ReferenceNotFound(id.to_string()))?;
        Ok(serde_json::from_slice(value.value())?)
    }

    pub fn list_references(&self, session_id: Uuid) -> Result<Vec<Reference>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(REFERENCES).map_err(db_err)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            let r: Reference = serde_json::from_slice(v.value())?;
            if r.session_id == session_id {
                out.push(r);
            }
        }
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }
}

fn diff_summary(old: &str, new: &str) -> String {
    if old == new {
        return "no textual change".to_string();
    }
    format!(
        "{} -> {} chars",
        old.chars().count(),
        new.chars().count()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, Registry) {
        let dir = TempDir::new().unwrap();
        let db = Registry::open(&dir.path().join("registry.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn create_project_enforces_unique_name() {
        let (_dir, reg) = open_tmp();
        reg.create_project("alpha", "/ws/alpha").unwrap();
        let err = reg.create_project("alpha", "/ws/other").unwrap_err();
        assert!(matches!(err, HarnessError::ProjectExists(_)));
    }

    #[test]
    fn get_project_by_name_round_trips() {
        let (_dir, reg) = open_tmp();
        let created = reg.create_project("alpha", "/ws/alpha").unwrap();
        let found = reg.get_project_by_name("alpha").unwrap();
        assert_eq!(found.id, created.id);
    }

    #[test]
    fn list_projects_sorted_by_creation() {
        let (_dir, reg) = open_tmp();
        reg.create_project("a", "/ws/a").unwrap();
        reg.create_project("b", "/ws/b").unwrap();
        let all = reg.list_projects().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "a");
    }

    #[test]
    fn append_spec_version_bumps_project_counter() {
        let (_dir, reg) = open_tmp();
        let project = reg.create_project("alpha", "/ws/alpha").unwrap();
        let v1 = reg.append_spec_version(project.id, "hello").unwrap();
        assert_eq!(v1.version_id, 1);
        assert!(v1.diff_from_prev.is_none());
        let v2 = reg.append_spec_version(project.id, "hello world").unwrap();
        assert_eq!(v2.version_id, 2);
        assert!(v2.diff_from_prev.is_some());

        let reloaded = reg.get_project(project.id).unwrap();
        assert_eq!(reloaded.spec_version, 2);
    }

    #[test]
    fn replace_features_assigns_dense_ordinals() {
        let (_dir, reg) = open_tmp();
        let project = reg.create_project("alpha", "/ws/alpha").unwrap();
        let features = reg
            .replace_features(
                project.id,
                vec![
                    NewFeature {
                        title: "one".into(),
                        description: "".into(),
                        category: FeatureCategory::Core,
                        depends_on: vec![],
                    },
                    NewFeature {
                        title: "two".into(),
                        description: "".into(),
                        category: FeatureCategory::Documentation,
                        depends_on: vec![],
                    },
                ],
            )
            .unwrap();
        assert_eq!(features[0].ordinal, 0);
        assert_eq!(features[1].ordinal, 1);
        let listed = reg.list_features(project.id).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].title, "one");
    }

    #[test]
    fn replace_features_is_atomic_replace() {
        let (_dir, reg) = open_tmp();
        let project = reg.create_project("alpha", "/ws/alpha").unwrap();
        reg.replace_features(
            project.id,
            vec![NewFeature {
                title: "old".into(),
                description: "".into(),
                category: FeatureCategory::Core,
                depends_on: vec![],
            }],
        )
        .unwrap();
        reg.replace_features(
            project.id,
            vec![NewFeature {
                title: "new".into(),
                description: "".into(),
                category: FeatureCategory::Core,
                depends_on: vec![],
            }],
        )
        .unwrap();
        let listed = reg.list_features(project.id).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title, "new");
    }

    #[test]
    fn transition_feature_enforces_state_machine() {
        let (_dir, reg) = open_tmp();
        let project = reg.create_project("alpha", "/ws/alpha").unwrap();
        let features = reg
            .replace_features(
                project.id,
                vec![NewFeature {
                    title: "one".into(),
                    description: "".into(),
                    category: FeatureCategory::Core,
                    depends_on: vec![],
                }],
            )
            .unwrap();
        let feature_id = features[0].id;

        let err = reg
            .transition_feature(feature_id, FeatureStatus::Done, None)
            .unwrap_err();
        assert!(matches!(err, HarnessError::InvalidTransition { .. }));

        let claimed = reg
            .transition_feature(feature_id, FeatureStatus::InProgress, None)
            .unwrap();
        assert_eq!(claimed.status, FeatureStatus::InProgress);
    }

    #[test]
    fn only_one_feature_in_progress_per_project() {
        let (_dir, reg) = open_tmp();
        let project = reg.create_project("alpha", "/ws/alpha").unwrap();
        let features = reg
            .replace_features(
                project.id,
                vec![
                    NewFeature {
                        title: "one".into(),
                        description: "".into(),
                        category: FeatureCategory::Core,
                        depends_on: vec![],
                    },
                    NewFeature {
                        title: "two".into(),
                        description: "".into(),
                        category: FeatureCategory::Core,
                        depends_on: vec![],
                    },
                ],
            )
            .unwrap();
        reg.transition_feature(features[0].id, FeatureStatus::InProgress, None)
            .unwrap();
        let err = reg
            .transition_feature(features[1].id, FeatureStatus::InProgress, None)
            .unwrap_err();
        assert!(matches!(err, HarnessError::FeatureAlreadyClaimed(_)));
    }

    #[test]
    fn start_run_rejects_second_concurrent_run() {
        let (_dir, reg) = open_tmp();
        let project = reg.create_project("alpha", "/ws/alpha").unwrap();
        reg.start_run(project.id, RunKind::Coding, None, "claude-opus-4-1")
            .unwrap();
        let err = reg
            .start_run(project.id, RunKind::Coding, None, "claude-opus-4-1")
            .unwrap_err();
        assert!(matches!(err, HarnessError::RunAlreadyActive));
    }

    #[test]
    fn finish_run_releases_active_slot() {
        let (_dir, reg) = open_tmp();
        let project = reg.create_project("alpha", "/ws/alpha").unwrap();
        let run = reg
            .start_run(project.id, RunKind::Coding, None, "claude-opus-4-1")
            .unwrap();
        reg.finish_run(run.id, ExitReason::Clean, None).unwrap();
        assert!(reg.active_run(project.id).unwrap().is_none());
        // A new run can now be admitted.
        reg.start_run(project.id, RunKind::Coding, None, "claude-opus-4-1")
            .unwrap();
    }

    #[test]
    fn start_run_locks_agent_settings_and_finish_run_unlocks_them() {
        let (_dir, reg) = open_tmp();
        let project = reg.create_project("alpha", "/ws/alpha").unwrap();
        assert!(!reg.get_project(project.id).unwrap().agent_settings.locked);

        let run = reg
            .start_run(project.id, RunKind::Coding, None, "claude-opus-4-1")
            .unwrap();
        assert!(reg.get_project(project.id).unwrap().agent_settings.locked);

        reg.finish_run(run.id, ExitReason::Clean, None).unwrap();
        assert!(!reg.get_project(project.id).unwrap().agent_settings.locked);
    }

    #[test]
    fn update_agent_settings_rejected_while_locked() {
        let (_dir, reg) = open_tmp();
        let project = reg.create_project("alpha", "/ws/alpha").unwrap();
        reg.start_run(project.id, RunKind::Coding, None, "claude-opus-4-1")
            .unwrap();

        let err = reg
            .update_agent_settings(project.id, |settings| settings.model_id = "other-model".into())
            .unwrap_err();
        assert!(matches!(err, HarnessError::SettingsLocked));
        assert_eq!(err.kind(), "invariant_violation");
    }

    #[test]
    fn update_agent_settings_applies_when_unlocked() {
        let (_dir, reg) = open_tmp();
        let project = reg.create_project("alpha", "/ws/alpha").unwrap();
        let updated = reg
            .update_agent_settings(project.id, |settings| settings.model_id = "claude-sonnet-4-5".into())
            .unwrap();
        assert_eq!(updated.agent_settings.model_id, "claude-sonnet-4-5");
    }

    #[test]
    fn complete_feature_and_finish_run_is_atomic() {
        let (_dir, reg) = open_tmp();
        let project = reg.create_project("alpha", "/ws/alpha").unwrap();
        let features = reg
            .replace_features(
                project.id,
                vec![NewFeature {
                    title: "one".into(),
                    description: "".into(),
                    category: FeatureCategory::Core,
                    depends_on: vec![],
                }],
            )
            .unwrap();
        let feature_id = features[0].id;
        reg.transition_feature(feature_id, FeatureStatus::InProgress, None)
            .unwrap();
        let run = reg
            .start_run(project.id, RunKind::Coding, Some(feature_id), "claude-opus-4-1")
            .unwrap();

        let (feature, finished_run) = reg
            .complete_feature_and_finish_run(feature_id, run.id)
            .unwrap();
        assert_eq!(feature.status, FeatureStatus::Done);
        assert_eq!(finished_run.status, RunStatus::Finished);
        assert!(reg.active_run(project.id).unwrap().is_none());
    }

    #[test]
    fn complete_feature_and_finish_run_is_idempotent() {
        let (_dir, reg) = open_tmp();
        let project = reg.create_project("alpha", "/ws/alpha").unwrap();
        let features = reg
            .replace_features(
                project.id,
                vec![NewFeature {
                    title: "one".into(),
                    description: "".into(),
                    category: FeatureCategory::Core,
                    depends_on: vec![],
                }],
            )
            .unwrap();
        let feature_id = features[0].id;
        reg.transition_feature(feature_id, FeatureStatus::InProgress, None)
            .unwrap();
        let run = reg
            .start_run(project.id, RunKind::Coding, Some(feature_id), "claude-opus-4-1")
            .unwrap();
        reg.complete_feature_and_finish_run(feature_id, run.id).unwrap();
        // Second call with identical arguments must not error or re-transition.
        let (feature, _) = reg.complete_feature_and_finish_run(feature_id, run.id).unwrap();
        assert_eq!(feature.status, FeatureStatus::Done);
    }

    #[test]
    fn redesign_session_forward_only_transitions() {
        let (_dir, reg) = open_tmp();
        let project = reg.create_project("alpha", "/ws/alpha").unwrap();
        let session = reg.create_redesign_session(project.id, "brief").unwrap();
        let advanced = reg
            .update_redesign_status(session.id, RedesignStatus::Extracting)
            .unwrap();
        assert_eq!(advanced.status, RedesignStatus::Extracting);

        let err = reg
            .update_redesign_status(session.id, RedesignStatus::Done)
            .unwrap_err();
        assert!(matches!(err, HarnessError::InvalidPhase(_)));
    }

    #[test]
    fn redesign_session_cancellable_from_any_state() {
        let (_dir, reg) = open_tmp();
        let project = reg.create_project("alpha", "/ws/alpha").unwrap();
        let session = reg.create_redesign_session(project.id, "brief").unwrap();
        let cancelled = reg
            .update_redesign_status(session.id, RedesignStatus::Cancelled)
            .unwrap();
        assert_eq!(cancelled.status, RedesignStatus::Cancelled);
        assert!(reg.active_run(project.id).unwrap().is_none());
    }

    #[test]
    fn only_one_active_redesign_session_per_project() {
        let (_dir, reg) = open_tmp();
        let project = reg.create_project("alpha", "/ws/alpha").unwrap();
        reg.create_redesign_session(project.id, "brief").unwrap();
        let err = reg.create_redesign_session(project.id, "brief2").unwrap_err();
        assert!(matches!(err, HarnessError::RedesignSessionAlreadyActive));
    }

    #[test]
    fn record_phase_approval_is_per_phase() {
        let (_dir, reg) = open_tmp();
        let project = reg.create_project("alpha", "/ws/alpha").unwrap();
        let session = reg.create_redesign_session(project.id, "brief").unwrap();
        let updated = reg
            .record_phase_approval(session.id, RedesignPhase::Globals)
            .unwrap();
        assert!(updated.phase_approvals.globals);
        assert!(!updated.phase_approvals.config);
    }

    #[test]
    fn references_scoped_to_session() {
        let (_dir, reg) = open_tmp();
        let project = reg.create_project("alpha", "/ws/alpha").unwrap();
        let session = reg.create_redesign_session(project.id, "brief").unwrap();
        let reference = Reference {
            id: Uuid::new_v4(),
            session_id: session.id,
            kind: crate::types::ReferenceType::Image,
            payload: vec![1, 2, 3],
            metadata: crate::entities::ReferenceMetadata {
                filename: Some("a.png".into()),
                original_url: None,
                page_identifier: None,
                component_manifest: None,
            },
            created_at: Utc::now(),
        };
        reg.create_reference(reference.clone()).unwrap();
        let listed = reg.list_references(session.id).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, reference.id);
    }

    #[test]
    fn registry_reopen_preserves_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.db");
        {
            let reg = Registry::open(&path).unwrap();
            reg.create_project("alpha", "/ws/alpha").unwrap();
        }
        let reg = Registry::open(&path).unwrap();
        let found = reg.get_project_by_name("alpha").unwrap();
        assert_eq!(found.name, "alpha");
    }
}
