//! Content-addressed attachment blobs.
//!
//! Attachments are addressed by the sha256 of the bytes as supplied by the
//! caller, sharded by the first two hex characters, and canonicalized to
//! lossless WebP. Storing the same bytes twice writes no second blob; the
//! side manifest is rewritten and the per-hash audit log grows by one line on
//! every store call.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use image::DynamicImage;
use image::codecs::webp::WebPEncoder;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::archive::{Archive, ArchiveLock};
use crate::config::Settings;
use crate::error::Result;
use crate::model::{AttachmentDescriptor, EmbedPolicy};

pub struct AttachmentStore {
    inline_image_max_bytes: usize,
    keep_original_images: bool,
}

impl AttachmentStore {
    pub fn new(settings: &Settings) -> Self {
        Self {
            inline_image_max_bytes: settings.inline_image_max_bytes,
            keep_original_images: settings.keep_original_images,
        }
    }

    /// Store an image under the project's attachment tree.
    ///
    /// Returns the descriptor for the owning message plus the repo-relative
    /// paths written, which the caller folds into its own commit while still
    /// holding `lock`. Nothing here commits.
    pub fn store(
        &self,
        archive: &Archive,
        lock: &ArchiveLock,
        original: &[u8],
        original_ext: &str,
        policy: EmbedPolicy,
    ) -> Result<(AttachmentDescriptor, Vec<String>)> {
        let hash = hex::encode(Sha256::digest(original));
        let shard = &hash[..2];
        let webp_rel = format!("attachments/{shard}/{hash}.webp");

        let decoded = image::load_from_memory(original)?;
        let (width, height) = (decoded.width(), decoded.height());

        let mut touched = Vec::new();
        let encoded = if archive.exists(&webp_rel)? {
            debug!(%hash, "attachment blob already present, skipping encode");
            archive.read_bytes(&webp_rel)?
        } else {
            let encoded = encode_webp(&decoded)?;
            archive.write_bytes(lock, &webp_rel, &encoded)?;
            touched.push(webp_rel.clone());
            encoded
        };

        let original_rel = if self.keep_original_images {
            let ext = normalize_ext(original_ext);
            let rel = format!("attachments/originals/{shard}/{hash}.{ext}");
            if !archive.exists(&rel)? {
                archive.write_bytes(lock, &rel, original)?;
                touched.push(rel.clone());
            }
            Some(rel)
        } else {
            None
        };

        let manifest_rel = format!("attachments/_manifests/{hash}.json");
        let manifest = serde_json::json!({
            "sha256": hash,
            "webp_path": webp_rel,
            "bytes_webp": encoded.len(),
            "width": width,
            "height": height,
            "original_path": original_rel,
            "bytes_original": original.len(),
            "original_ext": normalize_ext(original_ext),
        });
        archive.write_bytes(lock, &manifest_rel, serde_json::to_string_pretty(&manifest)?.as_bytes())?;
        touched.push(manifest_rel);

        let inline = match policy {
            EmbedPolicy::Inline => true,
            EmbedPolicy::File => false,
            EmbedPolicy::Auto => encoded.len() <= self.inline_image_max_bytes,
        };

        let audit_rel = format!("attachments/_audit/{hash}.log");
        let line = serde_json::json!({
            "ts": Utc::now(),
            "bytes_webp": encoded.len(),
            "inline": inline,
        });
        archive.append_line(lock, &audit_rel, &serde_json::to_string(&line)?)?;
        touched.push(audit_rel);

        let descriptor = if inline {
            AttachmentDescriptor::Inline {
                media_type: "image/webp".to_string(),
                bytes: encoded.len(),
                width,
                height,
                sha256: hash,
                data_base64: BASE64.encode(&encoded),
            }
        } else {
            AttachmentDescriptor::File {
                media_type: "image/webp".to_string(),
                bytes: encoded.len(),
                path: webp_rel,
                width,
                height,
                sha256: hash,
                original_path: original_rel,
            }
        };
        Ok((descriptor, touched))
    }
}

/// Lossless WebP, alpha preserved only when the source carries it.
fn encode_webp(image: &DynamicImage) -> Result<Vec<u8>> {
    let canonical = if image.color().has_alpha() {
        DynamicImage::ImageRgba8(image.to_rgba8())
    } else {
        DynamicImage::ImageRgb8(image.to_rgb8())
    };
    let mut buf = Vec::new();
    canonical.write_with_encoder(WebPEncoder::new_lossless(&mut buf))?;
    Ok(buf)
}

fn normalize_ext(ext: &str) -> String {
    let cleaned: String = ext
        .trim_start_matches('.')
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    if cleaned.is_empty() {
        "bin".to_string()
    } else {
        cleaned.to_ascii_lowercase()
    }
}
