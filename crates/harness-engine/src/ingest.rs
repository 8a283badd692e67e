//! Reference Ingest: three branches behind a common
//! `Reference` output — image validation, URL screenshot capture via an
//! external collaborator, and archive expansion with framework detection.
//!
//! Grounded on `sdlc-server::proxy` for the "treat an external HTTP
//! service as an opaque collaborator, fetch with `reqwest`, forward bytes"
//! shape, generalized from proxying a dev server's HTML to capturing a
//! screenshot PNG. Zip expansion and framework detection are new code
//! against the entity model in `harness_core::entities`.

use std::io::{Cursor, Read};
use std::path::Path;
use std::time::Duration;

use harness_core::config::IngestConfig;
use harness_core::entities::{ComponentManifest, ComponentManifestEntry, Reference, ReferenceMetadata};
use harness_core::types::{ComponentKind, Framework};

use crate::error::{EngineError, Result};

// ---------------------------------------------------------------------------
// Image
// ---------------------------------------------------------------------------

const ALLOWED_IMAGE_FORMATS: &[image::ImageFormat] =
    &[image::ImageFormat::Png, image::ImageFormat::Jpeg, image::ImageFormat::WebP];

/// Validate an image reference: size ceiling, then a real decode (not just
/// a magic-byte sniff) against the allowed format list.
pub fn ingest_image(bytes: Vec<u8>, filename: Option<String>, cfg: &IngestConfig) -> Result<(Vec<u8>, ReferenceMetadata)> {
    if bytes.len() as u64 > cfg.image_max_bytes {
        return Err(EngineError::InvalidReference(format!(
            "image is {} bytes, exceeds the {} byte ceiling",
            bytes.len(),
            cfg.image_max_bytes
        )));
    }

    let format = image::guess_format(&bytes).map_err(|_| EngineError::InvalidReference("unrecognized image format".into()))?;
    if !ALLOWED_IMAGE_FORMATS.contains(&format) {
        return Err(EngineError::InvalidReference(format!("image format {format:?} is not one of png/jpeg/webp")));
    }
    // Decode to confirm the bytes aren't merely format-tagged but corrupt.
    image::load_from_memory_with_format(&bytes, format)?;

    Ok((
        bytes,
        ReferenceMetadata {
            filename,
            original_url: None,
            page_identifier: None,
            component_manifest: None,
        },
    ))
}

// ---------------------------------------------------------------------------
// URL capture
// ---------------------------------------------------------------------------

/// Client for the external headless-browser screenshot service — an
/// opaque `capture(url, viewport) -> image_bytes` service. The
/// harness does not run a browser itself.
pub struct ScreenshotCollaborator {
    client: reqwest::Client,
    endpoint: String,
}

impl ScreenshotCollaborator {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        ScreenshotCollaborator {
            client: reqwest::Client::builder().timeout(timeout).build().unwrap_or_default(),
            endpoint: endpoint.into(),
        }
    }

    /// Capture a screenshot of `url` at `viewport`, returning the raw image
    /// bytes. A non-success response or a transport error is a retryable
    /// failure — the caller decides whether to retry.
    pub async fn capture(&self, url: &str, viewport: (u32, u32)) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "url": url,
                "viewport": { "width": viewport.0, "height": viewport.1 },
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EngineError::InvalidReference(format!(
                "screenshot collaborator returned {}",
                response.status()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Render one component from an already-ingested archive reference in
    /// isolation, returning a screenshot of it.
    /// Same collaborator, different payload shape — the service is expected
    /// to mount the archive and screenshot just the element at `selector`.
    pub async fn render_component(&self, archive_ref: &str, selector: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "archive_ref": archive_ref,
                "selector": selector,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EngineError::InvalidReference(format!(
                "screenshot collaborator returned {}",
                response.status()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Capture and validate a URL reference. Delegates size/format checks to
/// [`ingest_image`] since the collaborator always returns an image.
pub async fn ingest_url(
    collaborator: &ScreenshotCollaborator,
    url: &str,
    viewport: (u32, u32),
    cfg: &IngestConfig,
) -> Result<(Vec<u8>, ReferenceMetadata)> {
    let bytes = collaborator.capture(url, viewport).await?;
    let (bytes, mut metadata) = ingest_image(bytes, None, cfg)?;
    metadata.original_url = Some(url.to_string());
    Ok((bytes, metadata))
}

// ---------------------------------------------------------------------------
// Archive
// ---------------------------------------------------------------------------

/// Expand a `.zip` archive in memory, detect its frontend framework, and
/// build a component manifest from its file listing.
pub fn ingest_archive(bytes: Vec<u8>, page_identifier: Option<String>, cfg: &IngestConfig) -> Result<(Vec<u8>, ReferenceMetadata)> {
    if bytes.len() as u64 > cfg.archive_max_bytes {
        return Err(EngineError::InvalidReference(format!(
            "archive is {} bytes, exceeds the {} byte ceiling",
            bytes.len(),
            cfg.archive_max_bytes
        )));
    }

    let mut archive = zip::ZipArchive::new(Cursor::new(&bytes))?;
    let mut names = Vec::with_capacity(archive.len());
    let mut import_hints = String::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if looks_like_source_file(&name) && entry.size() < 256 * 1024 {
            let mut buf = String::new();
            if entry.read_to_string(&mut buf).is_ok() {
                import_hints.push_str(&buf);
                import_hints.push('\n');
            }
        }
        names.push(name);
    }

    let framework = detect_framework(&names, &import_hints);
    let entries = build_component_manifest_entries(&names, framework);

    let manifest = framework.map(|framework| ComponentManifest { framework, entries });

    Ok((
        bytes,
        ReferenceMetadata {
            filename: None,
            original_url: None,
            page_identifier,
            component_manifest: manifest,
        },
    ))
}

fn looks_like_source_file(name: &str) -> bool {
    matches!(
        Path::new(name).extension().and_then(|e| e.to_str()),
        Some("tsx" | "jsx" | "ts" | "js" | "vue" | "svelte" | "swift" | "dart" | "html")
    )
}

/// Detect the frontend framework by file extension and, where ambiguous,
/// by import statements sampled from source files.
fn detect_framework(file_names: &[String], import_hints: &str) -> Option<Framework> {
    let has_ext = |ext: &str| file_names.iter().any(|n| n.ends_with(ext));
    let has_file = |name: &str| file_names.iter().any(|n| n.ends_with(name));

    if has_ext(".svelte") {
        return Some(Framework::Svelte);
    }
    if has_ext(".vue") {
        return Some(Framework::Vue);
    }
    if has_file("pubspec.yaml") && has_ext(".dart") {
        return Some(Framework::Flutter);
    }
    if has_ext(".swift") && (import_hints.contains("import SwiftUI") || has_file("Package.swift")) {
        return Some(Framework::SwiftUi);
    }
    if has_ext(".tsx") || has_ext(".jsx") || import_hints.contains("from \"react\"") || import_hints.contains("from 'react'") {
        return Some(Framework::React);
    }
    if has_ext(".html") && (import_hints.contains("tailwindcss") || has_file("tailwind.config.js")) {
        return Some(Framework::HtmlTailwind);
    }
    None
}

/// Classify each source file as a page, layout, or plain component by path
/// convention, and guess its route from a framework-idiomatic file-based
/// routing layout where one applies.
fn build_component_manifest_entries(file_names: &[String], framework: Option<Framework>) -> Vec<ComponentManifestEntry> {
    file_names
        .iter()
        .filter(|n| looks_like_source_file(n))
        .map(|path| {
            let lower = path.to_lowercase();
            let kind = if lower.contains("layout") {
                ComponentKind::Layout
            } else if lower.contains("/pages/") || lower.contains("/routes/") || lower.contains("/app/") {
                ComponentKind::Page
            } else {
                ComponentKind::Component
            };
            let route = if kind == ComponentKind::Page {
                file_based_route(path, framework)
            } else {
                None
            };
            ComponentManifestEntry {
                path: path.clone(),
                kind,
                route,
            }
        })
        .collect()
}

fn file_based_route(path: &str, _framework: Option<Framework>) -> Option<String> {
    let stem = Path::new(path).file_stem()?.to_str()?;
    if matches!(stem, "index" | "page" | "+page") {
        let dir = Path::new(path).parent()?.file_name()?.to_str()?;
        return Some(format!("/{dir}"));
    }
    Some(format!("/{stem}"))
}

/// Reference-to-page binding (spec.md §4.7): build the pages-phase
/// candidate set from a session's references. A reference whose
/// `page_identifier` is set only contributes the `Page` entries of its own
/// manifest that match that identifier; a reference with no
/// `page_identifier` contributes all of its `Page` entries as candidates
/// for every page.
pub fn page_phase_candidates(references: &[Reference]) -> Vec<ComponentManifestEntry> {
    references
        .iter()
        .filter_map(|r| r.metadata.component_manifest.as_ref().map(|manifest| (r, manifest)))
        .flat_map(|(r, manifest)| {
            manifest
                .entries
                .iter()
                .filter(|entry| entry.kind == ComponentKind::Page)
                .filter(|entry| match r.metadata.page_identifier.as_deref() {
                    Some(page_identifier) => entry_matches_page(entry, page_identifier),
                    None => true,
                })
                .cloned()
        })
        .collect()
}

fn entry_matches_page(entry: &ComponentManifestEntry, page_identifier: &str) -> bool {
    entry.route.as_deref() == Some(page_identifier) || entry.path.contains(page_identifier)
}

/// Scan a project workspace for an initial `detected_pages` list,
/// used to populate UI selectors before any archive is ingested.
pub fn scan_workspace_pages(workspace: &Path) -> Vec<String> {
    const CANDIDATE_DIRS: &[&str] = &["src/pages", "pages", "src/routes", "app"];
    let mut pages = Vec::new();
    for dir in CANDIDATE_DIRS {
        let full = workspace.join(dir);
        if !full.is_dir() {
            continue;
        }
        if let Ok(entries) = std::fs::read_dir(&full) {
            for entry in entries.flatten() {
                if let Some(name) = entry.path().file_stem().and_then(|s| s.to_str()) {
                    if looks_like_source_file(&entry.file_name().to_string_lossy()) {
                        pages.push(format!("/{name}"));
                    }
                }
            }
        }
    }
    pages
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn one_pixel_png() -> Vec<u8> {
        // Smallest valid PNG: 1x1 transparent pixel.
        vec![
            0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52, 0x00,
            0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F, 0x15, 0xC4, 0x89, 0x00,
            0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x62, 0x00, 0x01, 0x00, 0x00, 0x05, 0x00, 0x01,
            0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
        ]
    }

    #[test]
    fn ingest_image_accepts_valid_png() {
        let cfg = IngestConfig::default();
        let (bytes, meta) = ingest_image(one_pixel_png(), Some("icon.png".into()), &cfg).unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(meta.filename.as_deref(), Some("icon.png"));
    }

    #[test]
    fn ingest_image_rejects_oversized() {
        let mut cfg = IngestConfig::default();
        cfg.image_max_bytes = 4;
        let err = ingest_image(one_pixel_png(), None, &cfg).unwrap_err();
        assert!(matches!(err, EngineError::InvalidReference(_)));
    }

    #[test]
    fn ingest_image_rejects_non_image_bytes() {
        let cfg = IngestConfig::default();
        let err = ingest_image(b"not an image".to_vec(), None, &cfg).unwrap_err();
        assert!(matches!(err, EngineError::InvalidReference(_)));
    }

    fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let cursor = Cursor::new(&mut buf);
            let mut writer = zip::ZipWriter::new(cursor);
            let options = zip::write::SimpleFileOptions::default();
            for (name, content) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        buf
    }

    #[test]
    fn ingest_archive_detects_react_and_builds_manifest() {
        let cfg = IngestConfig::default();
        let archive = zip_with(&[
            ("src/pages/Home.tsx", "import React from 'react';\nexport default function Home() {}"),
            ("src/components/Button.tsx", "export function Button() {}"),
            ("src/layouts/MainLayout.tsx", "export function MainLayout() {}"),
        ]);
        let (_, meta) = ingest_archive(archive, Some("home".into()), &cfg).unwrap();
        let manifest = meta.component_manifest.unwrap();
        assert_eq!(manifest.framework, Framework::React);
        assert_eq!(manifest.entries.len(), 3);
        let home = manifest.entries.iter().find(|e| e.path.contains("Home.tsx")).unwrap();
        assert_eq!(home.kind, ComponentKind::Page);
        assert_eq!(home.route.as_deref(), Some("/Home"));
        let layout = manifest.entries.iter().find(|e| e.path.contains("MainLayout")).unwrap();
        assert_eq!(layout.kind, ComponentKind::Layout);
        assert_eq!(meta.page_identifier.as_deref(), Some("home"));
    }

    #[test]
    fn ingest_archive_detects_vue_by_extension() {
        let cfg = IngestConfig::default();
        let archive = zip_with(&[("src/pages/Home.vue", "<template></template>")]);
        let (_, meta) = ingest_archive(archive, None, &cfg).unwrap();
        assert_eq!(meta.component_manifest.unwrap().framework, Framework::Vue);
    }

    #[test]
    fn ingest_archive_rejects_oversized() {
        let mut cfg = IngestConfig::default();
        cfg.archive_max_bytes = 1;
        let archive = zip_with(&[("a.tsx", "x")]);
        let err = ingest_archive(archive, None, &cfg).unwrap_err();
        assert!(matches!(err, EngineError::InvalidReference(_)));
    }

    #[test]
    fn ingest_archive_with_no_recognizable_framework_leaves_manifest_none() {
        let cfg = IngestConfig::default();
        let archive = zip_with(&[("README.md", "hello")]);
        let (_, meta) = ingest_archive(archive, None, &cfg).unwrap();
        assert!(meta.component_manifest.is_none());
    }

    #[tokio::test]
    async fn capture_posts_url_and_viewport_and_returns_bytes() {
        let mut server = mockito::Server::new_async().await;
        let png = one_pixel_png();
        let mock = server
            .mock("POST", "/capture")
            .with_status(200)
            .with_header("content-type", "image/png")
            .with_body(png.clone())
            .create_async()
            .await;

        let collaborator = ScreenshotCollaborator::new(format!("{}/capture", server.url()), Duration::from_secs(5));
        let bytes = collaborator.capture("https://example.com", (1280, 720)).await.unwrap();
        assert_eq!(bytes, png);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn capture_surfaces_error_on_non_success_status() {
        let mut server = mockito::Server::new_async().await;
        server.mock("POST", "/capture").with_status(502).create_async().await;

        let collaborator = ScreenshotCollaborator::new(format!("{}/capture", server.url()), Duration::from_secs(5));
        let err = collaborator.capture("https://example.com", (1280, 720)).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidReference(_)));
    }

    #[tokio::test]
    async fn render_component_posts_archive_ref_and_selector() {
        let mut server = mockito::Server::new_async().await;
        let png = one_pixel_png();
        let mock = server
            .mock("POST", "/capture")
            .with_status(200)
            .with_body(png.clone())
            .create_async()
            .await;

        let collaborator = ScreenshotCollaborator::new(format!("{}/capture", server.url()), Duration::from_secs(5));
        let bytes = collaborator.render_component("ref-123", "#hero").await.unwrap();
        assert_eq!(bytes, png);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn ingest_url_attaches_original_url_metadata() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/capture")
            .with_status(200)
            .with_body(one_pixel_png())
            .create_async()
            .await;

        let collaborator = ScreenshotCollaborator::new(format!("{}/capture", server.url()), Duration::from_secs(5));
        let cfg = IngestConfig::default();
        let (_, meta) = ingest_url(&collaborator, "https://example.com", (1280, 720), &cfg).await.unwrap();
        assert_eq!(meta.original_url.as_deref(), Some("https://example.com"));
    }

    #[test]
    fn scan_workspace_pages_finds_page_files() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src/pages")).unwrap();
        std::fs::write(dir.path().join("src/pages/Home.tsx"), "").unwrap();
        std::fs::write(dir.path().join("src/pages/About.tsx"), "").unwrap();
        let pages = scan_workspace_pages(dir.path());
        assert_eq!(pages.len(), 2);
        assert!(pages.contains(&"/Home".to_string()));
    }

    fn archive_reference(page_identifier: Option<&str>, manifest: ComponentManifest) -> Reference {
        Reference {
            id: uuid::Uuid::new_v4(),
            session_id: uuid::Uuid::new_v4(),
            kind: harness_core::types::ReferenceType::Archive,
            payload: vec![],
            metadata: ReferenceMetadata {
                filename: None,
                original_url: None,
                page_identifier: page_identifier.map(str::to_string),
                component_manifest: Some(manifest),
            },
            created_at: chrono::Utc::now(),
        }
    }

    fn manifest(entries: Vec<(&str, ComponentKind, Option<&str>)>) -> ComponentManifest {
        ComponentManifest {
            framework: Framework::React,
            entries: entries
                .into_iter()
                .map(|(path, kind, route)| ComponentManifestEntry {
                    path: path.to_string(),
                    kind,
                    route: route.map(str::to_string),
                })
                .collect(),
        }
    }

    #[test]
    fn page_phase_candidates_scopes_to_bound_page_identifier() {
        let home_ref = archive_reference(
            Some("home"),
            manifest(vec![
                ("src/pages/Home.tsx", ComponentKind::Page, Some("/home")),
                ("src/components/Button.tsx", ComponentKind::Component, None),
            ]),
        );
        let about_ref = archive_reference(
            Some("about"),
            manifest(vec![("src/pages/About.tsx", ComponentKind::Page, Some("/about"))]),
        );

        let home_only = page_phase_candidates(std::slice::from_ref(&home_ref));
        assert_eq!(home_only.len(), 1);
        assert_eq!(home_only[0].path, "src/pages/Home.tsx");

        let both = page_phase_candidates(&[home_ref, about_ref]);
        assert_eq!(both.len(), 2);
    }

    #[test]
    fn page_phase_candidates_includes_unbound_reference_entries_for_every_page() {
        let unbound = archive_reference(
            None,
            manifest(vec![("src/pages/Home.tsx", ComponentKind::Page, Some("/home"))]),
        );
        let candidates = page_phase_candidates(&[unbound]);
        assert_eq!(candidates.len(), 1);
    }
}
