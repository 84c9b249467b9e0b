//! Git-backed durable archive.
//!
//! One repository lives at the storage root; each project owns the subtree
//! `projects/<slug>/`. Durable writes go through [`Archive::append`] while
//! holding the [`ArchiveLock`], and every append produces at most one commit.
//! The lock lives at the repository root: the index and HEAD are shared by
//! every project subtree, so writes from different projects must serialize
//! too. Appending content identical to what is already committed produces no
//! commit at all.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};
use git2::{Repository, Signature};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{Result, WardenError};
use crate::model::{Agent, AttachmentDescriptor, ClaimRecord};
use crate::naming::slugify;
use crate::store::lock::acquire_lock;

const GITATTRIBUTES: &str = "* text=auto\n*.webp -text\n*.png -text\n*.jpg -text\n";
const GITIGNORE: &str = "*.lock\n*.sqlite3\n*.sqlite3-wal\n*.sqlite3-shm\n";

/// Held for the duration of a durable archive write. Unlocks on drop.
#[derive(Debug)]
pub struct ArchiveLock {
    file: Option<File>,
}

impl Drop for ArchiveLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fs2::FileExt::unlock(&file);
        }
    }
}

/// Per-project handle into the shared archive repository.
pub struct Archive {
    slug: String,
    repo_root: PathBuf,
    project_root: PathBuf,
    lock_path: PathBuf,
    author_name: String,
    author_email: String,
    lock_timeout: std::time::Duration,
}

impl Archive {
    /// Open the archive for a project, initializing the shared repository on
    /// first touch. Initialization is guarded by an advisory lock and
    /// re-checked after acquisition, so concurrent first callers race safely.
    pub fn ensure(settings: &Settings, slug: &str) -> Result<Self> {
        let repo_root = settings.storage_root.clone();
        fs::create_dir_all(&repo_root)?;

        if !repo_root.join(".git").exists() {
            let guard = acquire_lock(&repo_root.join(".init.lock"), settings.lock_timeout)?;
            if !repo_root.join(".git").exists() {
                Self::init_repo(&repo_root, settings)?;
            }
            drop(guard);
        }

        let project_root = repo_root.join("projects").join(slug);
        fs::create_dir_all(&project_root)?;

        Ok(Self {
            slug: slug.to_string(),
            lock_path: repo_root.join(".archive.lock"),
            repo_root,
            project_root,
            author_name: settings.git_author_name.clone(),
            author_email: settings.git_author_email.clone(),
            lock_timeout: settings.lock_timeout,
        })
    }

    fn init_repo(root: &Path, settings: &Settings) -> Result<()> {
        let repo = Repository::init(root)?;
        {
            let mut config = repo.config()?;
            config.set_bool("commit.gpgsign", false)?;
        }
        fs::write(root.join(".gitattributes"), GITATTRIBUTES)?;
        fs::write(root.join(".gitignore"), GITIGNORE)?;

        let mut index = repo.index()?;
        index.add_path(Path::new(".gitattributes"))?;
        index.add_path(Path::new(".gitignore"))?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Signature::now(&settings.git_author_name, &settings.git_author_email)?;
        repo.commit(Some("HEAD"), &sig, &sig, "chore: initialize archive", &tree, &[])?;
        Ok(())
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    /// Absolute path of the project subtree inside the repository.
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Acquire the archive write lock, waiting at most the configured
    /// timeout. The lock covers the whole repository, so holders from
    /// different projects exclude each other as well. Nothing durable
    /// happens without holding this.
    pub fn lock(&self) -> Result<ArchiveLock> {
        let file = acquire_lock(&self.lock_path, self.lock_timeout)?;
        Ok(ArchiveLock { file: Some(file) })
    }

    /// Resolve a project-relative path, rejecting anything that would land
    /// outside the project subtree.
    fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let rel_path = Path::new(rel);
        let escapes = rel_path.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes || rel.is_empty() {
            return Err(WardenError::PathOutsideArchive(rel.to_string()));
        }
        Ok(self.project_root.join(rel_path))
    }

    /// Write bytes to a project-relative path without committing. Callers
    /// fold the path into a later [`Archive::append`] while still holding the
    /// same lock.
    pub fn write_bytes(&self, _lock: &ArchiveLock, rel: &str, bytes: &[u8]) -> Result<()> {
        let full = self.resolve(rel)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(full, bytes)?;
        Ok(())
    }

    /// Read back a project-relative file.
    pub fn read_bytes(&self, rel: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.resolve(rel)?)?)
    }

    pub fn exists(&self, rel: &str) -> Result<bool> {
        Ok(self.resolve(rel)?.exists())
    }

    /// Append one line to a project-relative log file, creating it on first
    /// use. Existing content is never read or rewritten.
    pub fn append_line(&self, _lock: &ArchiveLock, rel: &str, line: &str) -> Result<()> {
        let full = self.resolve(rel)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new().create(true).append(true).open(full)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Write a batch of text files and commit them atomically.
    ///
    /// Exactly one commit covers the whole batch; any write error aborts
    /// before a commit is created. Returns the commit id, or `None` when the
    /// resulting tree is identical to HEAD (idempotent re-append).
    pub fn append(
        &self,
        lock: &ArchiveLock,
        files: &[(String, String)],
        subject: &str,
    ) -> Result<Option<String>> {
        self.append_with_extra(lock, files, &[], subject)
    }

    /// Like [`Archive::append`], also staging `extra_paths` already placed on
    /// disk via [`Archive::write_bytes`] under the same lock.
    pub fn append_with_extra(
        &self,
        lock: &ArchiveLock,
        files: &[(String, String)],
        extra_paths: &[String],
        subject: &str,
    ) -> Result<Option<String>> {
        for (rel, contents) in files {
            self.write_bytes(lock, rel, contents.as_bytes())?;
        }

        let repo = Repository::open(&self.repo_root)?;
        let mut index = repo.index()?;
        for rel in files
            .iter()
            .map(|(rel, _)| rel)
            .chain(extra_paths.iter())
        {
            self.resolve(rel)?;
            let repo_rel = PathBuf::from("projects").join(&self.slug).join(rel);
            index.add_path(&repo_rel)?;
        }
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;

        let parent = repo.head()?.peel_to_commit()?;
        if parent.tree_id() == tree_id {
            return Ok(None);
        }

        let sig = Signature::now(&self.author_name, &self.author_email)?;
        let oid = repo.commit(Some("HEAD"), &sig, &sig, subject, &tree, &[&parent])?;
        Ok(Some(oid.to_string()))
    }

    /// Number of commits on HEAD (tests and diagnostics).
    pub fn commit_count(&self) -> Result<usize> {
        let repo = Repository::open(&self.repo_root)?;
        let mut revwalk = repo.revwalk()?;
        revwalk.push_head()?;
        let mut count = 0;
        for oid in revwalk {
            oid?;
            count += 1;
        }
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Domain artifacts
    // -----------------------------------------------------------------------

    /// Deterministic location for a claim record: the pattern's content hash
    /// names the file, so re-granting the same pattern overwrites in place.
    pub fn claim_rel_path(path_pattern: &str) -> String {
        let digest = Sha256::digest(path_pattern.as_bytes());
        format!("claims/{}.json", hex::encode(digest))
    }

    /// Render a claim record as its on-disk artifact.
    pub fn claim_file(record: &ClaimRecord) -> Result<(String, String)> {
        let rel = Self::claim_rel_path(&record.path_pattern);
        let body = serde_json::to_string_pretty(record)?;
        Ok((rel, body))
    }

    /// Persist an agent profile and commit it.
    pub fn write_agent_profile(
        &self,
        lock: &ArchiveLock,
        agent: &Agent,
        project_key: &str,
    ) -> Result<Option<String>> {
        let profile = serde_json::json!({
            "name": agent.name,
            "project": project_key,
            "program": agent.program,
            "model": agent.model,
            "task_description": agent.task_description,
            "inception_ts": agent.inception_ts,
            "last_active_ts": agent.last_active_ts,
        });
        let rel = format!("agents/{}/profile.json", agent.name);
        let body = serde_json::to_string_pretty(&profile)?;
        let subject = format!("chore: update agent profile {}", agent.name);
        self.append(lock, &[(rel, body)], &subject)
    }

    /// Persist a message into the canonical log, the sender's outbox, every
    /// recipient's inbox, and the thread digest. One commit covers the whole
    /// fan-out plus any attachment paths already staged under the same lock.
    pub fn write_message_bundle(
        &self,
        lock: &ArchiveLock,
        message: &MessageBundle,
        attachment_paths: &[String],
    ) -> Result<Option<String>> {
        let body = message.render();
        let file_name = message.file_name();
        let year = message.sent_ts.year();
        let month = message.sent_ts.month();

        let mut files = vec![(
            format!("messages/{year:04}/{month:02}/{file_name}"),
            body.clone(),
        )];
        files.push((
            format!(
                "agents/{}/outbox/{year:04}/{month:02}/{file_name}",
                message.sender
            ),
            body.clone(),
        ));
        for recipient in &message.recipients {
            files.push((
                format!("agents/{recipient}/inbox/{year:04}/{month:02}/{file_name}"),
                body.clone(),
            ));
        }

        if let Some(thread_id) = &message.thread_id {
            let rel = format!("messages/threads/{}.md", slugify(thread_id));
            let mut digest = match self.read_bytes(&rel) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(_) => format!("# Thread {thread_id}\n"),
            };
            digest.push_str(&format!(
                "\n- {} | {} -> {} | {}\n",
                message.sent_ts.to_rfc3339(),
                message.sender,
                message.recipients.join(", "),
                message.subject,
            ));
            files.push((rel, digest));
        }

        let subject = format!("mail: {} from {}", message.subject, message.sender);
        self.append_with_extra(lock, &files, attachment_paths, &subject)
    }
}

/// A message fanned out to agent mailboxes and the canonical log.
#[derive(Debug, Clone)]
pub struct MessageBundle {
    pub id: String,
    pub thread_id: Option<String>,
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body_markdown: String,
    pub sent_ts: DateTime<Utc>,
    pub attachments: Vec<AttachmentDescriptor>,
}

impl MessageBundle {
    pub fn new(
        sender: impl Into<String>,
        recipients: Vec<String>,
        subject: impl Into<String>,
        body_markdown: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            thread_id: None,
            sender: sender.into(),
            recipients,
            subject: subject.into(),
            body_markdown: body_markdown.into(),
            sent_ts: Utc::now(),
            attachments: Vec::new(),
        }
    }

    /// `<iso-ts>__<subject-slug>__<id8>.md`, filesystem-safe and sortable.
    fn file_name(&self) -> String {
        let ts = self.sent_ts.format("%Y%m%dT%H%M%SZ");
        let short_id = &self.id[..8.min(self.id.len())];
        format!("{ts}__{}__{short_id}.md", slugify(&self.subject))
    }

    /// Markdown with a `---json` frontmatter block carrying the envelope.
    fn render(&self) -> String {
        let envelope = serde_json::json!({
            "id": self.id,
            "thread_id": self.thread_id,
            "from": self.sender,
            "to": self.recipients,
            "subject": self.subject,
            "sent_ts": self.sent_ts,
            "attachments": self.attachments,
        });
        format!(
            "---json\n{}\n---\n\n{}\n",
            serde_json::to_string_pretty(&envelope).unwrap_or_default(),
            self.body_markdown,
        )
    }
}
