//! Concurrent append behavior over the shared repository.
//!
//! The repository index and HEAD are shared by every project subtree, so
//! appends from different projects must serialize behind the archive lock.
//! Every append that reported a commit must still be reachable from HEAD
//! after the dust settles.

use std::sync::{Arc, Barrier};
use std::thread;

use git2::Repository;
use tempfile::TempDir;
use warden::Settings;
use warden::archive::Archive;

const APPENDS_PER_PROJECT: usize = 20;

#[test]
fn cross_project_appends_all_survive_in_head() {
    let dir = TempDir::new().unwrap();
    let settings = Settings::with_root(dir.path());
    Archive::ensure(&settings, "alpha").unwrap();
    Archive::ensure(&settings, "beta").unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let mut handles = Vec::new();
    for slug in ["alpha", "beta"] {
        let settings = settings.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            let archive = Archive::ensure(&settings, slug).unwrap();
            barrier.wait();
            for i in 0..APPENDS_PER_PROJECT {
                let lock = archive.lock().unwrap();
                let files = vec![(
                    format!("claims/{slug}-{i}.json"),
                    format!("{{\"seq\":{i}}}"),
                )];
                let oid = archive.append(&lock, &files, "claim batch").unwrap();
                assert!(oid.is_some(), "{slug}-{i} should commit");
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // Reported-durable files must be in HEAD's tree, not just on disk
    let repo = Repository::open(dir.path()).unwrap();
    let tree = repo.head().unwrap().peel_to_tree().unwrap();
    for slug in ["alpha", "beta"] {
        for i in 0..APPENDS_PER_PROJECT {
            let path = format!("projects/{slug}/claims/{slug}-{i}.json");
            assert!(
                tree.get_path(std::path::Path::new(&path)).is_ok(),
                "{path} missing from HEAD"
            );
        }
    }

    // One init commit plus exactly one commit per append
    let archive = Archive::ensure(&settings, "alpha").unwrap();
    assert_eq!(archive.commit_count().unwrap(), 1 + 2 * APPENDS_PER_PROJECT);
}

#[test]
fn lock_is_shared_across_projects() {
    let dir = TempDir::new().unwrap();
    let mut settings = Settings::with_root(dir.path());
    settings.lock_timeout = std::time::Duration::from_millis(100);

    let alpha = Archive::ensure(&settings, "alpha").unwrap();
    let beta = Archive::ensure(&settings, "beta").unwrap();

    // A holder in one project excludes writers in every other project
    let _held = alpha.lock().unwrap();
    let err = beta.lock().unwrap_err();
    assert!(err.is_retryable());
}
