//! Messaging and attachment flow over the durable archive.

use std::io::Cursor;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use tempfile::TempDir;
use warden::archive::Archive;
use warden::manager::LeaseManager;
use warden::model::{AttachmentDescriptor, EmbedPolicy};
use warden::Settings;

fn png(seed: u8) -> Vec<u8> {
    let mut img = RgbImage::new(8, 8);
    for p in img.pixels_mut() {
        *p = Rgb([seed, seed.wrapping_add(40), 90]);
    }
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

fn setup() -> (TempDir, LeaseManager) {
    let dir = TempDir::new().unwrap();
    let manager = LeaseManager::new(Settings::with_root(dir.path())).unwrap();
    for name in ["GreenCastle", "BlueLake"] {
        manager
            .register_agent("/repos/backend", Some(name), "", "", "")
            .unwrap();
    }
    (dir, manager)
}

#[test]
fn message_with_attachment_is_one_commit() {
    let (_dir, manager) = setup();
    let archive = Archive::ensure(manager.settings(), "repos-backend").unwrap();
    let before = archive.commit_count().unwrap();

    let commit = manager
        .send_message(
            "/repos/backend",
            "GreenCastle",
            &["BlueLake".to_string()],
            "screenshot of the failure",
            "See attached.",
            &[(png(1), "png".to_string())],
            EmbedPolicy::File,
        )
        .unwrap();
    assert!(commit.is_some());
    assert_eq!(archive.commit_count().unwrap(), before + 1);
}

#[test]
fn identical_attachment_bytes_are_stored_once() {
    let (_dir, manager) = setup();
    let bytes = png(7);

    for subject in ["first", "second"] {
        manager
            .send_message(
                "/repos/backend",
                "GreenCastle",
                &["BlueLake".to_string()],
                subject,
                "",
                &[(bytes.clone(), "png".to_string())],
                EmbedPolicy::File,
            )
            .unwrap();
    }

    let archive = Archive::ensure(manager.settings(), "repos-backend").unwrap();
    // Exactly one blob under the sharded tree
    let attachments_root = archive.project_root().join("attachments");
    let mut blobs = Vec::new();
    for shard in std::fs::read_dir(&attachments_root).unwrap() {
        let shard = shard.unwrap();
        if shard.file_name().to_string_lossy().starts_with('_') {
            continue;
        }
        for entry in std::fs::read_dir(shard.path()).unwrap() {
            blobs.push(entry.unwrap().path());
        }
    }
    assert_eq!(blobs.len(), 1);
}

#[test]
fn inline_descriptor_round_trips_through_frontmatter() {
    let (_dir, manager) = setup();
    manager
        .send_message(
            "/repos/backend",
            "GreenCastle",
            &["BlueLake".to_string()],
            "tiny image",
            "",
            &[(png(3), "png".to_string())],
            EmbedPolicy::Inline,
        )
        .unwrap();

    let archive = Archive::ensure(manager.settings(), "repos-backend").unwrap();
    let inbox = archive.project_root().join("agents/BlueLake/inbox");
    let mut found = None;
    for entry in walk(&inbox) {
        found = Some(std::fs::read_to_string(entry).unwrap());
    }
    let body = found.expect("inbox copy missing");
    let json = body
        .strip_prefix("---json\n")
        .and_then(|rest| rest.split("\n---\n").next())
        .expect("frontmatter missing");
    let envelope: serde_json::Value = serde_json::from_str(json).unwrap();
    let attachment: AttachmentDescriptor =
        serde_json::from_value(envelope["attachments"][0].clone()).unwrap();
    assert!(matches!(attachment, AttachmentDescriptor::Inline { .. }));
}

fn walk(root: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out
}
