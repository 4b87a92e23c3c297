//! Change detection and directory synchronization.
//!
//! Pipeline:
//!   1. Walk the filesystem (`scanner::scan_directory`)
//!   2. Fetch stored `updated_at` values once per directory
//!   3. Classify every file as needing processing or up to date
//!   4. Extract, parse and thumbnail stale files on a rayon pool, chunk by chunk
//!   5. Upsert results on the calling thread, one identity at a time

use crate::config::AppConfig;
use crate::database::{Database, NewImageAttributes};
use crate::error::{CatalogError, ExtractError, FileError};
use crate::image_processing::{ThumbnailBounds, ThumbnailGenerator};
use crate::parser::{self, GenerationAttributes};
use crate::scanner::{self, ScannedFile};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Outcome of comparing a stored record against the file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    NeedsProcessing,
    UpToDate,
}

/// Unknown identities and records older than the file need processing.
pub fn classify(stored_updated_at: Option<i64>, file_mtime_ms: i64) -> SyncDecision {
    match stored_updated_at {
        None => SyncDecision::NeedsProcessing,
        Some(updated_at) if updated_at < file_mtime_ms => SyncDecision::NeedsProcessing,
        Some(_) => SyncDecision::UpToDate,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStage {
    Scanning,
    Indexing,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncProgress {
    pub current: usize,
    pub total: usize,
    pub stage: SyncStage,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub total_files: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: bool,
}

impl SyncReport {
    /// `(processed, skipped, failed)`.
    pub fn counts(&self) -> (usize, usize, usize) {
        (self.processed, self.skipped, self.failed)
    }
}

/// Stops a running sync from launching new file work. Upserts already
/// committed are kept.
#[derive(Debug, Clone, Default)]
pub struct SyncHandle {
    cancelled: Arc<AtomicBool>,
}

impl SyncHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.cancelled.store(false, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// `None` uses half of each image's native resolution.
    pub thumbnail_bounds: Option<ThumbnailBounds>,
    pub jpeg_quality: u8,
    pub worker_threads: usize,
    pub chunk_size: usize,
}

impl From<&AppConfig> for SyncOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            thumbnail_bounds: config.thumbnail.max_size,
            jpeg_quality: config.thumbnail.jpeg_quality,
            worker_threads: config.sync.resolved_worker_threads(),
            chunk_size: config.sync.chunk_size,
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

enum FileOutcome {
    Ready(Box<NewImageAttributes>),
    Failed(FileError),
    NotStarted,
}

/// Reads and parses the embedded generation metadata of one file. Files
/// without a recognised payload yield empty attributes.
pub fn extract_attributes(path: &Path) -> Result<GenerationAttributes, ExtractError> {
    let payload = scanner::extract_payload(path)?;
    Ok(payload
        .as_ref()
        .map(parser::parse_payload)
        .unwrap_or_default())
}

/// Drives scanner, extractor, parser and thumbnail generator and writes the
/// results to the store.
pub struct SyncOrchestrator {
    db: Database,
    thumbnails: ThumbnailGenerator,
    thumbnail_bounds: Option<ThumbnailBounds>,
    chunk_size: usize,
    pool: rayon::ThreadPool,
    handle: SyncHandle,
}

impl SyncOrchestrator {
    pub fn new(db: Database, options: SyncOptions) -> Result<Self, CatalogError> {
        let threads = options.worker_threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("gencat-sync-{index}"))
            .build()?;
        log::debug!("Sync worker pool ready with {} threads", threads);

        Ok(Self {
            db,
            thumbnails: ThumbnailGenerator::new(options.jpeg_quality),
            thumbnail_bounds: options.thumbnail_bounds,
            chunk_size: options.chunk_size.max(1),
            pool,
            handle: SyncHandle::default(),
        })
    }

    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    pub fn sync_directory(&self, root: &Path) -> Result<SyncReport, CatalogError> {
        self.sync_directory_with_progress(root, &|_| {})
    }

    /// Brings every supported image under `root` up to date.
    ///
    /// Per-file failures are logged and counted; only store connectivity
    /// failures abort the run. The cancellation flag is cleared on entry.
    pub fn sync_directory_with_progress(
        &self,
        root: &Path,
        progress: &dyn Fn(&SyncProgress),
    ) -> Result<SyncReport, CatalogError> {
        if !root.is_dir() {
            return Err(CatalogError::InvalidDirectory(root.to_path_buf()));
        }
        self.handle.reset();
        let total_timer = std::time::Instant::now();

        // ── Stage 1: Walk filesystem ─────────────────────────────────
        progress(&SyncProgress {
            current: 0,
            total: 0,
            stage: SyncStage::Scanning,
        });
        let discovery_timer = std::time::Instant::now();
        let files = scanner::scan_directory(root);
        let discovery_elapsed = discovery_timer.elapsed();

        let mut report = SyncReport {
            total_files: files.len(),
            ..Default::default()
        };

        // ── Stage 2/3: Batch lookup + classification ─────────────────
        let filter_timer = std::time::Instant::now();
        let pending = self.stale_files(files)?;
        report.skipped = report.total_files - pending.len();
        let filter_elapsed = filter_timer.elapsed();

        log::info!(
            "Sync {}: {} total files, {} up to date, {} to process",
            root.display(),
            report.total_files,
            report.skipped,
            pending.len()
        );

        // ── Stage 4/5: Chunked parallel processing + serialized upserts ──
        let process_timer = std::time::Instant::now();
        let total_pending = pending.len();
        let mut done = 0usize;
        progress(&SyncProgress {
            current: 0,
            total: total_pending,
            stage: SyncStage::Indexing,
        });

        for chunk in pending.chunks(self.chunk_size) {
            if self.handle.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let outcomes: Vec<(&ScannedFile, FileOutcome)> = self.pool.install(|| {
                chunk
                    .par_iter()
                    .map(|file| {
                        if self.handle.is_cancelled() {
                            return (file, FileOutcome::NotStarted);
                        }
                        match self.process_file(file) {
                            Ok(record) => (file, FileOutcome::Ready(Box::new(record))),
                            Err(err) => (file, FileOutcome::Failed(err)),
                        }
                    })
                    .collect()
            });

            for (file, outcome) in outcomes {
                match outcome {
                    FileOutcome::Ready(record) => match self.db.upsert_attributes(&record) {
                        Ok(id) => {
                            report.processed += 1;
                            log::debug!("Indexed {} as #{}", file.path.display(), id);
                        }
                        Err(err) if err.is_fatal() => return Err(err.into()),
                        Err(err) => {
                            report.failed += 1;
                            log::warn!("Failed to store {}: {}", file.path.display(), err);
                        }
                    },
                    FileOutcome::Failed(err) => {
                        report.failed += 1;
                        log::warn!("Skipping {}: {}", file.path.display(), err);
                    }
                    FileOutcome::NotStarted => {
                        report.cancelled = true;
                        continue;
                    }
                }
                done += 1;
                progress(&SyncProgress {
                    current: done,
                    total: total_pending,
                    stage: SyncStage::Indexing,
                });
            }
        }
        let process_elapsed = process_timer.elapsed();

        progress(&SyncProgress {
            current: done,
            total: total_pending,
            stage: SyncStage::Complete,
        });

        let throughput = if process_elapsed.as_secs_f64() > 0.0 {
            done as f64 / process_elapsed.as_secs_f64()
        } else {
            done as f64
        };
        log::info!(
            "Sync complete: {} total, {} processed, {} failed, {} skipped (unchanged){}",
            report.total_files,
            report.processed,
            report.failed,
            report.skipped,
            if report.cancelled { ", cancelled" } else { "" }
        );
        log::info!(
            "Sync timings: discovery={:.1}ms, filter={:.1}ms, process={:.1}ms ({:.1} files/s, chunk={}), total={:.1}ms",
            discovery_elapsed.as_secs_f64() * 1000.0,
            filter_elapsed.as_secs_f64() * 1000.0,
            process_elapsed.as_secs_f64() * 1000.0,
            throughput,
            self.chunk_size,
            total_timer.elapsed().as_secs_f64() * 1000.0
        );

        Ok(report)
    }

    /// Keeps the files whose stored record is missing or older than the
    /// file, using one store query per directory.
    fn stale_files(&self, files: Vec<ScannedFile>) -> Result<Vec<ScannedFile>, CatalogError> {
        let mut by_directory: HashMap<String, HashMap<String, i64>> = HashMap::new();
        let mut pending = Vec::new();

        for file in files {
            let directory = file.directory();
            if !by_directory.contains_key(&directory) {
                let stored = self.db.updated_at_by_directory(&directory)?;
                by_directory.insert(directory.clone(), stored);
            }
            let stored_updated_at = by_directory
                .get(&directory)
                .and_then(|stored| stored.get(&file.file_name()))
                .copied();

            match classify(stored_updated_at, file.modified_ms) {
                SyncDecision::NeedsProcessing => pending.push(file),
                SyncDecision::UpToDate => {
                    log::debug!("Up to date: {}", file.path.display());
                }
            }
        }

        Ok(pending)
    }

    fn process_file(&self, file: &ScannedFile) -> Result<NewImageAttributes, FileError> {
        let attributes = extract_attributes(&file.path)?;
        let thumbnail = self.thumbnails.generate(&file.path, self.thumbnail_bounds)?;

        Ok(NewImageAttributes {
            directory_path: file.directory(),
            file_name: file.file_name(),
            extension: file.extension(),
            attributes,
            thumbnail,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::{hold_connection, open_single_connection_db, open_test_db};
    use crate::error::ThumbnailError;
    use crate::scanner::tests::build_test_png;
    use filetime::FileTime;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::cell::RefCell;
    use std::io::Cursor;
    use std::path::PathBuf;

    const SD_PARAMETERS: &str =
        "a cat, detailed\nNegative prompt: blurry\nSteps: 20, Sampler: Euler, CFG scale: 7";

    /// Real PNG with a correctly checksummed tEXt chunk after IHDR.
    fn png_with_text(width: u32, height: u32, keyword: &str, text: &str) -> Vec<u8> {
        let mut encoded = Vec::new();
        RgbImage::from_pixel(width, height, Rgb([120, 60, 30]))
            .write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)
            .unwrap();

        let mut body = b"tEXt".to_vec();
        body.extend_from_slice(keyword.as_bytes());
        body.push(0);
        body.extend_from_slice(text.as_bytes());
        let mut crc = flate2::Crc::new();
        crc.update(&body);

        // signature (8) + IHDR chunk (4 + 4 + 13 + 4)
        let ihdr_end = 33;
        let mut out = encoded[..ihdr_end].to_vec();
        out.extend_from_slice(&((body.len() - 4) as u32).to_be_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(&crc.sum().to_be_bytes());
        out.extend_from_slice(&encoded[ihdr_end..]);
        out
    }

    fn write_file(path: &Path, bytes: &[u8]) -> PathBuf {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, bytes).unwrap();
        set_mtime_offset(path, -60);
        path.to_path_buf()
    }

    fn set_mtime_offset(path: &Path, seconds: i64) {
        let now = FileTime::now();
        let shifted = FileTime::from_unix_time(now.unix_seconds() + seconds, 0);
        filetime::set_file_mtime(path, shifted).unwrap();
    }

    fn orchestrator(db: &Database, chunk_size: usize) -> SyncOrchestrator {
        SyncOrchestrator::new(
            db.clone(),
            SyncOptions {
                thumbnail_bounds: None,
                jpeg_quality: 80,
                worker_threads: 2,
                chunk_size,
            },
        )
        .unwrap()
    }

    fn identity(path: &Path) -> (String, String) {
        let file = ScannedFile {
            path: std::path::absolute(path).unwrap(),
            modified_ms: 0,
        };
        (file.directory(), file.file_name())
    }

    #[test]
    fn test_classify_state_transitions() {
        assert_eq!(classify(None, 100), SyncDecision::NeedsProcessing);
        assert_eq!(classify(Some(99), 100), SyncDecision::NeedsProcessing);
        assert_eq!(classify(Some(100), 100), SyncDecision::UpToDate);
        assert_eq!(classify(Some(101), 100), SyncDecision::UpToDate);
    }

    #[test]
    fn test_first_sync_creates_records_with_equal_timestamps() {
        let images = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let db = open_test_db(store.path());

        let png = write_file(
            &images.path().join("cat.png"),
            &png_with_text(40, 20, "parameters", SD_PARAMETERS),
        );
        let jpg = images.path().join("nested").join("plain.jpg");
        std::fs::create_dir_all(jpg.parent().unwrap()).unwrap();
        RgbImage::from_pixel(10, 10, Rgb([0, 0, 0])).save(&jpg).unwrap();
        set_mtime_offset(&jpg, -60);

        let report = orchestrator(&db, 64).sync_directory(images.path()).unwrap();
        assert_eq!(report.counts(), (2, 0, 0));
        assert_eq!(report.total_files, 2);
        assert!(!report.cancelled);

        let (dir, name) = identity(&png);
        let record = db.get_by_identity(&dir, &name).unwrap().expect("png record");
        assert_eq!(record.created_at, record.updated_at);
        assert_eq!(record.software, "Stable Diffusion");
        assert_eq!(record.prompt, "a cat, detailed");
        assert_eq!(record.negative_prompt, "blurry");
        assert_eq!(record.description, "Steps: 20, Sampler: Euler, CFG scale: 7");
        assert_eq!(record.extension, ".png");
        let thumb = image::load_from_memory(&record.thumbnail).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (20, 10));

        let (dir, name) = identity(&jpg);
        let plain = db.get_by_identity(&dir, &name).unwrap().expect("jpg record");
        assert!(dir.ends_with("nested"));
        assert_eq!(plain.attributes(), GenerationAttributes::default());
        assert!(!plain.thumbnail.is_empty());
    }

    #[test]
    fn test_second_sync_is_idempotent() {
        let images = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let db = open_test_db(store.path());
        let png = write_file(
            &images.path().join("cat.png"),
            &png_with_text(16, 16, "parameters", SD_PARAMETERS),
        );

        let sync = orchestrator(&db, 64);
        assert_eq!(sync.sync_directory(images.path()).unwrap().counts(), (1, 0, 0));
        let (dir, name) = identity(&png);
        let before = db.get_by_identity(&dir, &name).unwrap().unwrap();

        assert_eq!(sync.sync_directory(images.path()).unwrap().counts(), (0, 1, 0));
        let after = db.get_by_identity(&dir, &name).unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_stale_file_is_rewritten_and_keeps_created_at() {
        let images = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let db = open_test_db(store.path());
        let path = images.path().join("cat.png");
        write_file(&path, &png_with_text(16, 16, "parameters", SD_PARAMETERS));

        let sync = orchestrator(&db, 64);
        sync.sync_directory(images.path()).unwrap();
        let (dir, name) = identity(&path);
        let before = db.get_by_identity(&dir, &name).unwrap().unwrap();
        db.toggle_flag(before.id, crate::database::ImageFlag::Favorite)
            .unwrap();

        std::fs::write(&path, png_with_text(16, 16, "parameters", "a dog\nSteps: 30")).unwrap();
        set_mtime_offset(&path, 3600);

        assert_eq!(sync.sync_directory(images.path()).unwrap().counts(), (1, 0, 0));
        let after = db.get_by_identity(&dir, &name).unwrap().unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!(after.created_at, before.created_at);
        assert!(after.updated_at > before.updated_at);
        assert_eq!(after.prompt, "a dog");
        assert_eq!(after.negative_prompt, "");
        assert_eq!(after.description, "Steps: 30");
        assert!(!after.fav_flag);
    }

    #[test]
    fn test_thumbnail_failure_leaves_no_record_and_sync_continues() {
        let images = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let db = open_test_db(store.path());

        let mut data = b"parameters\0".to_vec();
        data.extend_from_slice(b"broken but tagged");
        let broken = write_file(
            &images.path().join("broken.png"),
            &build_test_png(vec![(*b"tEXt", data)]),
        );
        let good = write_file(
            &images.path().join("good.png"),
            &png_with_text(8, 8, "parameters", SD_PARAMETERS),
        );

        let report = orchestrator(&db, 64).sync_directory(images.path()).unwrap();
        assert_eq!(report.counts(), (1, 0, 1));

        let (dir, name) = identity(&broken);
        assert!(db.get_by_identity(&dir, &name).unwrap().is_none());
        let (dir, name) = identity(&good);
        assert!(db.get_by_identity(&dir, &name).unwrap().is_some());
    }

    #[test]
    fn test_failed_file_keeps_previous_record() {
        let images = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let db = open_test_db(store.path());
        let path = write_file(
            &images.path().join("cat.png"),
            &png_with_text(8, 8, "parameters", SD_PARAMETERS),
        );

        let sync = orchestrator(&db, 64);
        sync.sync_directory(images.path()).unwrap();
        let (dir, name) = identity(&path);
        let before = db.get_by_identity(&dir, &name).unwrap().unwrap();

        std::fs::write(&path, b"\x89PNG\r\n\x1a\ntruncated").unwrap();
        set_mtime_offset(&path, 3600);

        assert_eq!(sync.sync_directory(images.path()).unwrap().counts(), (0, 0, 1));
        let after = db.get_by_identity(&dir, &name).unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_novelai_payload_is_stored() {
        let images = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let db = open_test_db(store.path());

        let json = r#"{"prompt":"a cat","uc":"blurry","steps":20,"height":512,"width":512,"scale":7,"seed":42,"sampler":"k_euler"}"#;
        let mut bytes = png_with_text(8, 8, "Comment", json);
        // Software must precede Comment, so splice it in right after IHDR.
        let software = png_with_text(8, 8, "Software", "NovelAI");
        let software_chunk_len = 4 + 4 + "Software\0NovelAI".len() + 4;
        let chunk = software[33..33 + software_chunk_len].to_vec();
        bytes.splice(33..33, chunk);
        let path = write_file(&images.path().join("nai.png"), &bytes);

        orchestrator(&db, 64).sync_directory(images.path()).unwrap();
        let (dir, name) = identity(&path);
        let record = db.get_by_identity(&dir, &name).unwrap().unwrap();
        assert_eq!(record.software, "NovelAI");
        assert_eq!(record.prompt, "a cat");
        assert_eq!(record.negative_prompt, "blurry");
        assert_eq!(
            record.description,
            "steps: 20, height: 512, width: 512, scale: 7, seed: 42, sampler: k_euler"
        );
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let db = open_test_db(store.path());
        let file = ScannedFile {
            path: dir.path().join("vanished.png"),
            modified_ms: 0,
        };

        match orchestrator(&db, 1).process_file(&file) {
            Err(FileError::Extract(ExtractError::NotFound(_))) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("processing a missing file should fail"),
        }

        let jpg = dir.path().join("vanished.jpg");
        let file = ScannedFile {
            path: jpg,
            modified_ms: 0,
        };
        assert!(matches!(
            orchestrator(&db, 1).process_file(&file),
            Err(FileError::Thumbnail(ThumbnailError::NotFound(_)))
                | Err(FileError::Extract(ExtractError::NotFound(_)))
        ));
    }

    #[test]
    fn test_cancel_stops_new_work_and_keeps_committed_rows() {
        let images = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let db = open_test_db(store.path());
        for name in ["a.png", "b.png", "c.png"] {
            write_file(
                &images.path().join(name),
                &png_with_text(8, 8, "parameters", SD_PARAMETERS),
            );
        }

        let sync = orchestrator(&db, 1);
        let handle = sync.handle();
        let seen = RefCell::new(Vec::new());
        let report = sync
            .sync_directory_with_progress(images.path(), &|event| {
                seen.borrow_mut().push(event.stage);
                if event.stage == SyncStage::Indexing && event.current == 1 {
                    handle.cancel();
                }
            })
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.counts(), (1, 0, 0));
        assert_eq!(db.count().unwrap(), 1);
        assert_eq!(seen.borrow().first(), Some(&SyncStage::Scanning));
        assert_eq!(seen.borrow().last(), Some(&SyncStage::Complete));

        let resumed = sync.sync_directory(images.path()).unwrap();
        assert_eq!(resumed.counts(), (2, 1, 0));
        assert!(!resumed.cancelled);
    }

    #[test]
    fn test_invalid_root_is_rejected() {
        let store = tempfile::tempdir().unwrap();
        let db = open_test_db(store.path());
        let err = orchestrator(&db, 1)
            .sync_directory(&store.path().join("missing"))
            .unwrap_err();
        assert!(matches!(err, CatalogError::InvalidDirectory(_)));
    }

    #[test]
    fn test_jpeg_saved_with_png_extension_is_indexed() {
        let images = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let db = open_test_db(store.path());

        let path = images.path().join("actually_jpeg.png");
        RgbImage::from_pixel(16, 8, Rgb([90, 90, 90]))
            .save_with_format(&path, ImageFormat::Jpeg)
            .unwrap();
        set_mtime_offset(&path, -60);

        let report = orchestrator(&db, 4).sync_directory(images.path()).unwrap();
        assert_eq!(report.counts(), (1, 0, 0));

        let (dir, name) = identity(&path);
        let record = db.get_by_identity(&dir, &name).unwrap().expect("record");
        assert_eq!(record.extension, ".png");
        assert_eq!(record.software, "");
        let thumb = image::load_from_memory(&record.thumbnail).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (8, 4));
    }

    #[test]
    fn test_store_lost_mid_run_aborts_and_keeps_committed_rows() {
        let images = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let db = open_single_connection_db(store.path(), std::time::Duration::from_millis(200));
        for name in ["a.png", "b.png", "c.png"] {
            write_file(
                &images.path().join(name),
                &png_with_text(8, 8, "parameters", SD_PARAMETERS),
            );
        }

        let held = RefCell::new(None);
        let result = orchestrator(&db, 1).sync_directory_with_progress(images.path(), &|event| {
            if event.stage == SyncStage::Indexing && event.current == 1 {
                held.borrow_mut().get_or_insert_with(|| hold_connection(&db));
            }
        });

        assert!(held.borrow().is_some());
        match result {
            Err(CatalogError::Store(err)) => assert!(err.is_fatal()),
            other => panic!("expected a store failure, got {other:?}"),
        }

        drop(held.into_inner());
        assert_eq!(db.count().unwrap(), 1);
        let names: Vec<String> = db
            .list_attributes(None)
            .unwrap()
            .into_iter()
            .map(|record| record.file_name)
            .collect();
        assert_eq!(names, vec!["a.png"]);
    }
}
