//! Downloaded ROM manifests.
//!
//! Every ROM saved locally lives in `<roms>/<Platform>/<ROM name>/` next to a
//! `.metadata.json` sidecar. The directory tree is the source of truth; there is
//! no separate index to fall out of sync.

use crate::config::write_atomic;
use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

const METADATA_FILE: &str = ".metadata.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadedRomFile {
    pub file_name: String,
    pub file_size_bytes: u64,
    /// Lowercase hex SHA-256
    #[serde(default)]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadedRom {
    pub rom_id: i64,
    pub rom_name: String,
    pub platform_name: String,
    pub platform_slug: Option<String>,
    pub downloaded_at: DateTime<Utc>,
    /// Relative to the ROMs directory
    pub local_directory: PathBuf,
    pub files: Vec<DownloadedRomFile>,
}

impl DownloadedRom {
    pub fn new(
        rom_id: i64,
        rom_name: impl Into<String>,
        platform_name: impl Into<String>,
        platform_slug: Option<String>,
        files: Vec<DownloadedRomFile>,
    ) -> Self {
        let rom_name = rom_name.into();
        let platform_name = platform_name.into();
        let local_directory = Path::new(&sanitize_component(&platform_name)).join(sanitize_component(&rom_name));
        Self {
            rom_id,
            rom_name,
            platform_name,
            platform_slug,
            downloaded_at: Utc::now(),
            local_directory,
            files,
        }
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.file_size_bytes).sum()
    }
}

/// Sidecar layout on disk
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RomMetadata {
    rom_id: i64,
    rom_name: String,
    platform_name: String,
    #[serde(default)]
    platform_slug: Option<String>,
    downloaded_at: DateTime<Utc>,
    #[serde(default)]
    files: Vec<DownloadedRomFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlatformDownloads {
    pub platform_name: String,
    pub platform_slug: Option<String>,
    pub roms: Vec<DownloadedRom>,
    pub total_size_bytes: u64,
}

pub struct LocalLedger {
    roms_dir: PathBuf,
}

impl LocalLedger {
    pub fn new(roms_dir: impl Into<PathBuf>) -> Self {
        Self {
            roms_dir: roms_dir.into(),
        }
    }

    pub fn roms_dir(&self) -> &Path {
        &self.roms_dir
    }

    /// Absolute directory for a ROM
    pub fn rom_dir(&self, rom: &DownloadedRom) -> AppResult<PathBuf> {
        let relative = &rom.local_directory;
        let contained = !relative.as_os_str().is_empty()
            && relative.components().all(|c| matches!(c, Component::Normal(_)));
        if !contained {
            return Err(AppError::InvalidPath(relative.display().to_string()));
        }
        Ok(self.roms_dir.join(relative))
    }

    /// Scan the ROMs directory, newest download first
    pub fn list_downloaded(&self) -> AppResult<Vec<DownloadedRom>> {
        let mut roms = Vec::new();
        if !self.roms_dir.is_dir() {
            return Ok(roms);
        }

        for platform in visible_dirs(&self.roms_dir)? {
            for rom_dir in visible_dirs(&platform)? {
                if let Some(rom) = self.read_rom(&rom_dir) {
                    roms.push(rom);
                }
            }
        }

        roms.sort_by(|a, b| b.downloaded_at.cmp(&a.downloaded_at));
        Ok(roms)
    }

    /// Grouped by platform name, groups sorted by name
    pub fn downloaded_by_platform(&self) -> AppResult<Vec<PlatformDownloads>> {
        let mut buckets: BTreeMap<String, Vec<DownloadedRom>> = BTreeMap::new();
        for rom in self.list_downloaded()? {
            buckets.entry(rom.platform_name.clone()).or_default().push(rom);
        }

        Ok(buckets
            .into_iter()
            .map(|(platform_name, roms)| PlatformDownloads {
                platform_slug: roms.iter().find_map(|r| r.platform_slug.clone()),
                total_size_bytes: roms.iter().map(DownloadedRom::total_size_bytes).sum(),
                platform_name,
                roms,
            })
            .collect())
    }

    pub fn get_downloaded(&self, rom_id: i64) -> AppResult<Option<DownloadedRom>> {
        Ok(self.list_downloaded()?.into_iter().find(|r| r.rom_id == rom_id))
    }

    /// Write the sidecar for `rom`, creating its directory if needed
    pub fn save_downloaded(&self, rom: &DownloadedRom) -> AppResult<PathBuf> {
        let dir = self.rom_dir(rom)?;
        if let Some(bad) = rom.files.iter().find(|f| !is_plain_file_name(&f.file_name)) {
            return Err(AppError::InvalidPath(bad.file_name.clone()));
        }
        fs::create_dir_all(&dir)?;

        let metadata = RomMetadata {
            rom_id: rom.rom_id,
            rom_name: rom.rom_name.clone(),
            platform_name: rom.platform_name.clone(),
            platform_slug: rom.platform_slug.clone(),
            downloaded_at: rom.downloaded_at,
            files: rom.files.clone(),
        };
        let path = dir.join(METADATA_FILE);
        write_atomic(&path, &serde_json::to_vec_pretty(&metadata)?)?;

        tracing::debug!("Saved manifest for ROM {} ({})", rom.rom_id, rom.rom_name);
        Ok(path)
    }

    /// Remove the ROM's files and manifest. The platform directory stays.
    pub fn delete_downloaded(&self, rom: &DownloadedRom) -> AppResult<()> {
        let dir = self.rom_dir(rom)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::info!("Deleted local ROM {} ({})", rom.rom_id, rom.rom_name);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AppError::LocalFile(format!("ROM directory not found: {}", dir.display())))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn total_downloaded_size(&self) -> AppResult<u64> {
        Ok(self.list_downloaded()?.iter().map(DownloadedRom::total_size_bytes).sum())
    }

    pub fn downloaded_count(&self) -> AppResult<usize> {
        Ok(self.list_downloaded()?.len())
    }

    /// Check every manifest entry against the files on disk
    pub fn verify_files(&self, rom: &DownloadedRom) -> AppResult<()> {
        let dir = self.rom_dir(rom)?;
        for file in &rom.files {
            if !is_plain_file_name(&file.file_name) {
                return Err(AppError::InvalidPath(file.file_name.clone()));
            }
            let path = dir.join(&file.file_name);
            let meta = fs::metadata(&path)
                .map_err(|_| AppError::LocalFile(format!("Missing file: {}", path.display())))?;

            if meta.len() != file.file_size_bytes {
                return Err(AppError::Validation(format!(
                    "{}: expected {} bytes, found {}",
                    file.file_name,
                    file.file_size_bytes,
                    meta.len()
                )));
            }

            if let Some(expected) = &file.checksum {
                let actual = compute_checksum(&path)?;
                if !actual.eq_ignore_ascii_case(expected) {
                    return Err(AppError::Validation(format!("{}: checksum mismatch", file.file_name)));
                }
            }
        }
        Ok(())
    }

    fn read_rom(&self, rom_dir: &Path) -> Option<DownloadedRom> {
        let sidecar = rom_dir.join(METADATA_FILE);
        let content = fs::read_to_string(&sidecar).ok()?;
        let metadata: RomMetadata = match serde_json::from_str(&content) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Skipping unreadable manifest {}: {}", sidecar.display(), e);
                return None;
            }
        };
        if let Some(bad) = metadata.files.iter().find(|f| !is_plain_file_name(&f.file_name)) {
            tracing::warn!(
                "Skipping manifest {}: file name {:?} leaves the ROM directory",
                sidecar.display(),
                bad.file_name
            );
            return None;
        }

        let files = metadata
            .files
            .into_iter()
            .map(|mut file| {
                if let Ok(meta) = fs::metadata(rom_dir.join(&file.file_name)) {
                    file.file_size_bytes = meta.len();
                }
                file
            })
            .collect();

        Some(DownloadedRom {
            rom_id: metadata.rom_id,
            rom_name: metadata.rom_name,
            platform_name: metadata.platform_name,
            platform_slug: metadata.platform_slug,
            downloaded_at: metadata.downloaded_at,
            local_directory: rom_dir.strip_prefix(&self.roms_dir).ok()?.to_path_buf(),
            files,
        })
    }
}

/// True when `name` is exactly one normal path component
fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn visible_dirs(dir: &Path) -> AppResult<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

/// Make a name safe to use as a single path component
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| if matches!(c, '/' | '\\') { '-' } else { c })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".into(),
        _ => cleaned,
    }
}

/// Streaming SHA-256 of a file, lowercase hex
pub fn compute_checksum(path: &Path) -> AppResult<String> {
    let file = fs::File::open(path)
        .map_err(|e| AppError::LocalFile(format!("Cannot open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
