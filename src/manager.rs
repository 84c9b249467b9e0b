//! Lease orchestration: request, release, and expiry over the coordination
//! database and the project archive.
//!
//! Every durable batch runs with the archive lock held: conflict evaluation,
//! lease persistence, and the claim-record commit are a single critical
//! section, so two overlapping exclusive batches cannot both succeed.

use chrono::{Duration, Utc};
use tracing::{debug, info};

use crate::archive::{Archive, ArchiveLock, MessageBundle};
use crate::attachments::AttachmentStore;
use crate::config::Settings;
use crate::conflict::{lease_conflicts, validate_pattern};
use crate::error::{Result, WardenError};
use crate::model::{
    Agent, BatchOutcome, ClaimRecord, ConflictHolder, EmbedPolicy, Lease, LeaseGrant,
    PathConflict, Project, ReleaseReceipt,
};
use crate::naming::{generate_agent_name, sanitize_agent_name};
use crate::store::CoordinationDb;

pub struct LeaseManager {
    db: CoordinationDb,
    settings: Settings,
}

impl LeaseManager {
    pub fn new(settings: Settings) -> Result<Self> {
        let db = CoordinationDb::from_settings(&settings)?;
        Ok(Self { db, settings })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn db(&self) -> &CoordinationDb {
        &self.db
    }

    /// Register (or refresh) an agent under a project and persist its
    /// profile to the archive. A missing name hint gets a generated
    /// adjective+noun codename.
    pub fn register_agent(
        &self,
        project_key: &str,
        name_hint: Option<&str>,
        program: &str,
        model: &str,
        task_description: &str,
    ) -> Result<(Project, Agent)> {
        let name = match name_hint {
            Some(hint) => sanitize_agent_name(hint)
                .ok_or_else(|| WardenError::InvalidAgentName(hint.to_string()))?,
            None => generate_agent_name(),
        };

        let project = self.db.upsert_project(project_key)?;
        let agent = self
            .db
            .register_agent(&project, &name, program, model, task_description)?;

        let archive = Archive::ensure(&self.settings, &project.slug)?;
        let lock = archive.lock()?;
        archive.write_agent_profile(&lock, &agent, &project.human_key)?;
        info!(project = %project.slug, agent = %agent.name, "agent registered");
        Ok((project, agent))
    }

    /// Request leases on a batch of path patterns.
    ///
    /// Validation happens before any lock or write. Paths are processed in
    /// request order; each is checked against active leases including those
    /// granted earlier in the same batch. Conflicting paths are reported and
    /// skipped, granted paths are persisted, and all granted claim records
    /// land in one archive commit.
    pub fn request(
        &self,
        project_key: &str,
        agent_name: &str,
        paths: &[String],
        ttl_seconds: i64,
        exclusive: bool,
        reason: &str,
    ) -> Result<BatchOutcome> {
        if ttl_seconds <= 0 {
            return Err(WardenError::InvalidTtl(ttl_seconds));
        }
        for path in paths {
            validate_pattern(path)?;
        }

        let project = self.db.get_project(project_key)?;
        let agent = self.db.get_agent(&project, agent_name)?;
        let archive = Archive::ensure(&self.settings, &project.slug)?;
        let lock = archive.lock()?;

        let now = Utc::now();
        self.expire_under_lock(&project, &archive, &lock)?;

        let mut active = self.db.list_active_leases(project.id, now)?;
        let mut outcome = BatchOutcome::default();
        let mut claim_files = Vec::new();

        for path in paths {
            let holders: Vec<ConflictHolder> = active
                .iter()
                .filter(|l| lease_conflicts(l, agent.id, path, exclusive, now))
                .map(|l| ConflictHolder {
                    agent: l.agent_name.clone(),
                    path_pattern: l.path_pattern.clone(),
                    exclusive: l.exclusive,
                    expires_ts: l.expires_ts,
                })
                .collect();

            if !holders.is_empty() {
                debug!(%path, blockers = holders.len(), "lease request blocked");
                outcome.conflicts.push(PathConflict {
                    path: path.clone(),
                    holders,
                });
                continue;
            }

            let lease = self.db.insert_lease(
                project.id,
                agent.id,
                path,
                exclusive,
                reason,
                now,
                now + Duration::seconds(ttl_seconds),
            )?;
            claim_files.push(Archive::claim_file(&claim_record(&project, &lease))?);
            outcome.granted.push(LeaseGrant {
                id: lease.id,
                path_pattern: lease.path_pattern.clone(),
                exclusive: lease.exclusive,
                reason: lease.reason.clone(),
                expires_ts: lease.expires_ts,
            });
            active.push(lease);
        }

        self.db.touch_agent(agent.id)?;
        if !claim_files.is_empty() {
            let subject = format!(
                "claim: {} pattern(s) for {}",
                claim_files.len(),
                agent.name
            );
            archive.append(&lock, &claim_files, &subject)?;
        }
        info!(
            project = %project.slug,
            agent = %agent.name,
            granted = outcome.granted.len(),
            conflicts = outcome.conflicts.len(),
            "lease batch processed"
        );
        Ok(outcome)
    }

    /// Release an agent's leases, optionally filtered to lease ids and/or
    /// exact path patterns. With no filters, everything active for the agent
    /// is released. One commit covers the whole batch; releasing nothing
    /// commits nothing.
    pub fn release(
        &self,
        project_key: &str,
        agent_name: &str,
        ids: &[i64],
        paths: &[String],
    ) -> Result<ReleaseReceipt> {
        let project = self.db.get_project(project_key)?;
        let agent = self.db.get_agent(&project, agent_name)?;
        let archive = Archive::ensure(&self.settings, &project.slug)?;
        let lock = archive.lock()?;

        let now = Utc::now();
        let released = self.db.release_leases(project.id, agent.id, ids, paths, now)?;
        self.db.touch_agent(agent.id)?;

        if !released.is_empty() {
            let files = released
                .iter()
                .map(|l| Archive::claim_file(&claim_record(&project, l)))
                .collect::<Result<Vec<_>>>()?;
            let subject = format!("release: {} lease(s) for {}", released.len(), agent.name);
            archive.append(&lock, &files, &subject)?;
        }
        info!(project = %project.slug, agent = %agent.name, released = released.len(), "leases released");
        Ok(ReleaseReceipt {
            released: released.len(),
            released_at: now,
        })
    }

    /// Mark every overdue lease released and audit the batch with one commit.
    /// Returns how many leases were newly expired; a second call right after
    /// returns zero and commits nothing.
    pub fn expire_stale(&self, project_key: &str) -> Result<usize> {
        let project = self.db.get_project(project_key)?;
        let archive = Archive::ensure(&self.settings, &project.slug)?;
        let lock = archive.lock()?;
        self.expire_under_lock(&project, &archive, &lock)
    }

    fn expire_under_lock(
        &self,
        project: &Project,
        archive: &Archive,
        lock: &ArchiveLock,
    ) -> Result<usize> {
        let now = Utc::now();
        let expired = self.db.mark_expired_batch(project.id, now)?;
        if expired.is_empty() {
            return Ok(0);
        }
        let files = expired
            .iter()
            .map(|l| Archive::claim_file(&claim_record(project, l)))
            .collect::<Result<Vec<_>>>()?;
        let subject = format!("chore: expire {} stale lease(s)", expired.len());
        archive.append(lock, &files, &subject)?;
        info!(project = %project.slug, expired = expired.len(), "stale leases expired");
        Ok(expired.len())
    }

    /// Active leases for a project. Expiry is lazy: anything past its
    /// expires_ts is excluded by the timestamp comparison alone, whether or
    /// not a sweeper has marked it yet.
    pub fn list_active(&self, project_key: &str) -> Result<Vec<Lease>> {
        let project = self.db.get_project(project_key)?;
        self.db.list_active_leases(project.id, Utc::now())
    }

    /// Send a message from one registered agent to others, storing any image
    /// attachments content-addressed and folding everything into one commit.
    pub fn send_message(
        &self,
        project_key: &str,
        sender: &str,
        recipients: &[String],
        subject: &str,
        body_markdown: &str,
        attachments: &[(Vec<u8>, String)],
        policy: EmbedPolicy,
    ) -> Result<Option<String>> {
        let project = self.db.get_project(project_key)?;
        let agent = self.db.get_agent(&project, sender)?;
        let archive = Archive::ensure(&self.settings, &project.slug)?;
        let lock = archive.lock()?;

        let store = AttachmentStore::new(&self.settings);
        let mut message = MessageBundle::new(
            agent.name.clone(),
            recipients.to_vec(),
            subject,
            body_markdown,
        );
        let mut extra_paths = Vec::new();
        for (bytes, ext) in attachments {
            let (descriptor, touched) = store.store(&archive, &lock, bytes, ext, policy)?;
            message.attachments.push(descriptor);
            extra_paths.extend(touched);
        }

        self.db.touch_agent(agent.id)?;
        archive.write_message_bundle(&lock, &message, &extra_paths)
    }
}

fn claim_record(project: &Project, lease: &Lease) -> ClaimRecord {
    ClaimRecord {
        id: lease.id,
        agent: lease.agent_name.clone(),
        project: project.human_key.clone(),
        path_pattern: lease.path_pattern.clone(),
        exclusive: lease.exclusive,
        reason: lease.reason.clone(),
        created_ts: lease.created_ts,
        expires_ts: lease.expires_ts,
        released_ts: lease.released_ts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LeaseManager) {
        let dir = TempDir::new().unwrap();
        let manager = LeaseManager::new(Settings::with_root(dir.path())).unwrap();
        manager
            .register_agent("/work/backend", Some("GreenCastle"), "cli", "m", "t")
            .unwrap();
        manager
            .register_agent("/work/backend", Some("BlueLake"), "cli", "m", "t")
            .unwrap();
        (dir, manager)
    }

    #[test]
    fn request_validates_before_touching_anything() {
        let (_dir, manager) = setup();
        let err = manager
            .request("/work/backend", "GreenCastle", &["src/*.rs".into()], 0, true, "")
            .unwrap_err();
        assert!(matches!(err, WardenError::InvalidTtl(0)));

        let err = manager
            .request("/work/backend", "GreenCastle", &["".into()], 60, true, "")
            .unwrap_err();
        assert!(matches!(err, WardenError::InvalidPattern(_, _)));
    }

    #[test]
    fn unknown_project_and_agent_are_client_errors() {
        let (_dir, manager) = setup();
        let err = manager
            .request("/nowhere", "GreenCastle", &["a".into()], 60, true, "")
            .unwrap_err();
        assert!(matches!(err, WardenError::ProjectNotFound(_)));

        let err = manager
            .request("/work/backend", "Ghost", &["a".into()], 60, true, "")
            .unwrap_err();
        assert!(matches!(err, WardenError::AgentNotFound(_, _)));
    }

    #[test]
    fn overlapping_exclusive_request_reports_holder() {
        let (_dir, manager) = setup();
        let first = manager
            .request("/work/backend", "GreenCastle", &["src/*.py".into()], 3600, true, "refactor")
            .unwrap();
        assert_eq!(first.granted.len(), 1);

        let second = manager
            .request("/work/backend", "BlueLake", &["src/app.py".into()], 3600, true, "")
            .unwrap();
        assert!(second.granted.is_empty());
        assert_eq!(second.conflicts.len(), 1);
        let conflict = &second.conflicts[0];
        assert_eq!(conflict.path, "src/app.py");
        assert_eq!(conflict.holders[0].agent, "GreenCastle");
        assert_eq!(conflict.holders[0].path_pattern, "src/*.py");
    }

    #[test]
    fn batch_is_partial_not_all_or_nothing() {
        let (_dir, manager) = setup();
        manager
            .request("/work/backend", "GreenCastle", &["src/*.py".into()], 3600, true, "")
            .unwrap();

        let outcome = manager
            .request(
                "/work/backend",
                "BlueLake",
                &["docs/*.md".into(), "src/main.py".into(), "lib/*.rs".into()],
                3600,
                true,
                "",
            )
            .unwrap();
        let granted: Vec<&str> = outcome.granted.iter().map(|g| g.path_pattern.as_str()).collect();
        assert_eq!(granted, vec!["docs/*.md", "lib/*.rs"]);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].path, "src/main.py");
    }

    #[test]
    fn shared_leases_coexist() {
        let (_dir, manager) = setup();
        let a = manager
            .request("/work/backend", "GreenCastle", &["src/*.py".into()], 3600, false, "")
            .unwrap();
        let b = manager
            .request("/work/backend", "BlueLake", &["src/*.py".into()], 3600, false, "")
            .unwrap();
        assert_eq!(a.granted.len(), 1);
        assert_eq!(b.granted.len(), 1);
    }

    #[test]
    fn release_then_retry_succeeds() {
        let (_dir, manager) = setup();
        manager
            .request("/work/backend", "GreenCastle", &["src/*.py".into()], 3600, true, "")
            .unwrap();

        let receipt = manager
            .release("/work/backend", "GreenCastle", &[], &["src/*.py".into()])
            .unwrap();
        assert_eq!(receipt.released, 1);

        let retry = manager
            .request("/work/backend", "BlueLake", &["src/app.py".into()], 3600, true, "")
            .unwrap();
        assert_eq!(retry.granted.len(), 1);
        assert!(retry.conflicts.is_empty());
    }

    #[test]
    fn release_nothing_is_a_quiet_success() {
        let (_dir, manager) = setup();
        let receipt = manager
            .release("/work/backend", "GreenCastle", &[], &[])
            .unwrap();
        assert_eq!(receipt.released, 0);
    }

    #[test]
    fn expire_stale_is_idempotent_in_commits() {
        let (_dir, manager) = setup();
        manager
            .request("/work/backend", "GreenCastle", &["a/*".into()], 1, true, "")
            .unwrap();
        // Force the lease overdue without waiting
        manager
            .db()
            .conn()
            .execute(
                "UPDATE leases SET expires_ts = '2000-01-01T00:00:00.000000Z'",
                [],
            )
            .unwrap();

        let archive = Archive::ensure(manager.settings(), "work-backend").unwrap();
        let before = archive.commit_count().unwrap();

        assert_eq!(manager.expire_stale("/work/backend").unwrap(), 1);
        let after_first = archive.commit_count().unwrap();
        assert_eq!(after_first, before + 1);

        assert_eq!(manager.expire_stale("/work/backend").unwrap(), 0);
        assert_eq!(archive.commit_count().unwrap(), after_first);
    }

    #[test]
    fn claim_artifact_lands_in_archive() {
        let (_dir, manager) = setup();
        manager
            .request("/work/backend", "GreenCastle", &["src/*.py".into()], 3600, true, "migration")
            .unwrap();

        let archive = Archive::ensure(manager.settings(), "work-backend").unwrap();
        let rel = Archive::claim_rel_path("src/*.py");
        let record: ClaimRecord =
            serde_json::from_slice(&archive.read_bytes(&rel).unwrap()).unwrap();
        assert_eq!(record.agent, "GreenCastle");
        assert_eq!(record.reason, "migration");
        assert!(record.released_ts.is_none());
    }

    #[test]
    fn release_rewrites_claim_artifact() {
        let (_dir, manager) = setup();
        manager
            .request("/work/backend", "GreenCastle", &["src/*.py".into()], 3600, true, "")
            .unwrap();
        manager
            .release("/work/backend", "GreenCastle", &[], &[])
            .unwrap();

        let archive = Archive::ensure(manager.settings(), "work-backend").unwrap();
        let record: ClaimRecord = serde_json::from_slice(
            &archive
                .read_bytes(&Archive::claim_rel_path("src/*.py"))
                .unwrap(),
        )
        .unwrap();
        assert!(record.released_ts.is_some());
    }

    #[test]
    fn register_rejects_unusable_names() {
        let (_dir, manager) = setup();
        let err = manager
            .register_agent("/work/backend", Some("!!!"), "", "", "")
            .unwrap_err();
        assert!(matches!(err, WardenError::InvalidAgentName(_)));
    }

    #[test]
    fn register_without_hint_generates_codename() {
        let (_dir, manager) = setup();
        let (_, agent) = manager
            .register_agent("/work/backend", None, "", "", "")
            .unwrap();
        assert!(agent.name.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(!agent.name.is_empty());
    }
}
