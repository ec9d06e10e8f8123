//! Registry of pre-upscaler networks and their weight files.
//!
//! The built-in entries carry no download URL; a `catalog.json` next to the
//! weights can add URLs, hashes or further networks.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

pub const DEFAULT_UPSCALER: &str = "4x_NMKD-Siax_200k";
pub const CATALOG_FILE_NAME: &str = "catalog.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpscalerEntry {
    pub name: String,
    pub filename: String,
    pub url: Option<String>,
    pub sha256: Option<String>,
    /// Native scale of the network.
    pub scale: u32,
    /// Value range the network expects/produces: `(0.0, 1.0)` or `(0.0, 255.0)`.
    pub normalization_range: (f32, f32),
    /// Spatial dimensions must be multiples of this.
    pub pad_align: u32,
    pub description: String,
}

fn builtin_catalog() -> Vec<UpscalerEntry> {
    vec![
        UpscalerEntry {
            name: DEFAULT_UPSCALER.into(),
            filename: "4x_NMKD-Siax_200k.onnx".into(),
            url: None,
            sha256: None,
            scale: 4,
            normalization_range: (0.0, 1.0),
            pad_align: 4,
            description: "4x ESRGAN, general photo restoration".into(),
        },
        UpscalerEntry {
            name: "4xSSDIRDAT".into(),
            filename: "4xSSDIRDAT.onnx".into(),
            url: None,
            sha256: None,
            scale: 4,
            normalization_range: (0.0, 1.0),
            pad_align: 4,
            description: "4x ESRGAN, anime / digital art".into(),
        },
    ]
}

pub struct UpscalerCatalog {
    models_dir: PathBuf,
    entries: Vec<UpscalerEntry>,
}

impl UpscalerCatalog {
    pub fn new(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: Vec::new(),
        }
    }

    pub fn with_builtin_models(models_dir: PathBuf) -> Self {
        let mut catalog = Self::new(models_dir);
        catalog.entries = builtin_catalog();
        catalog
    }

    /// Built-in entries merged with `<models_dir>/catalog.json` when present.
    pub fn load(models_dir: PathBuf) -> Result<Self> {
        let mut catalog = Self::with_builtin_models(models_dir);
        let path = catalog.models_dir.join(CATALOG_FILE_NAME);
        if path.is_file() {
            let json = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            catalog
                .load_json(&json)
                .with_context(|| format!("Invalid catalog {}", path.display()))?;
            info!(path = %path.display(), entries = catalog.entries.len(), "Loaded upscaler catalog");
        }
        Ok(catalog)
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn get(&self, name: &str) -> Option<&UpscalerEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn list(&self) -> &[UpscalerEntry] {
        &self.entries
    }

    pub fn is_downloaded(&self, name: &str) -> bool {
        self.get(name)
            .map(|e| self.models_dir.join(&e.filename).is_file())
            .unwrap_or(false)
    }

    pub fn model_path(&self, name: &str) -> Option<PathBuf> {
        self.get(name).map(|e| self.models_dir.join(&e.filename))
    }

    pub fn download(&self, name: &str) -> Result<PathBuf> {
        let entry = self
            .get(name)
            .with_context(|| format!("Unknown upscaler: {name}"))?;

        let url = entry
            .url
            .as_deref()
            .with_context(|| format!("No download URL for upscaler: {name}"))?;

        fs::create_dir_all(&self.models_dir).with_context(|| {
            format!(
                "Failed to create models directory: {}",
                self.models_dir.display()
            )
        })?;

        let final_path = self.models_dir.join(&entry.filename);
        let tmp_path = self.models_dir.join(format!("{}.part", entry.filename));

        info!(model = %name, url = %url, "Downloading upscaler weights");

        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(30 * 60))
            .build()
            .context("Failed to build HTTP client for model download")?;

        let mut response = client
            .get(url)
            .send()
            .with_context(|| format!("Failed to start download for upscaler {name}"))?;

        if !response.status().is_success() {
            bail!(
                "Download request for upscaler {name} returned HTTP {}",
                response.status().as_u16()
            );
        }

        let result = write_part_file(&mut response, &tmp_path)
            .with_context(|| format!("Failed while downloading {name} from {url}"))
            .and_then(|()| verify_sha256(name, entry.sha256.as_deref(), &tmp_path));
        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }

        fs::rename(&tmp_path, &final_path).with_context(|| {
            format!(
                "Failed to move {} → {}",
                tmp_path.display(),
                final_path.display()
            )
        })?;

        info!(model = %name, path = %final_path.display(), "Download complete");
        Ok(final_path)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.entries).context("Failed to serialize upscaler catalog")
    }

    /// Merge entries from JSON. Entries with a known name replace the
    /// existing one.
    pub fn load_json(&mut self, json: &str) -> Result<()> {
        let loaded: Vec<UpscalerEntry> =
            serde_json::from_str(json).context("Failed to parse upscaler catalog JSON")?;
        for entry in loaded {
            match self.entries.iter_mut().find(|e| e.name == entry.name) {
                Some(existing) => *existing = entry,
                None => self.entries.push(entry),
            }
        }
        Ok(())
    }
}

fn write_part_file(response: &mut reqwest::blocking::Response, tmp_path: &Path) -> Result<()> {
    let mut tmp_file = fs::File::create(tmp_path)
        .with_context(|| format!("Failed to create temp file: {}", tmp_path.display()))?;
    response.copy_to(&mut tmp_file)?;
    tmp_file
        .sync_all()
        .with_context(|| format!("Failed to flush temp file: {}", tmp_path.display()))
}

fn verify_sha256(name: &str, expected: Option<&str>, path: &Path) -> Result<()> {
    let Some(expected) = expected else {
        warn!(model = %name, "No SHA256 hash configured, skipping verification");
        return Ok(());
    };
    let actual = sha256_file(path)?;
    if !actual.eq_ignore_ascii_case(expected) {
        bail!("SHA256 mismatch for {name}: expected {expected}, got {actual}");
    }
    info!(model = %name, "Hash verified OK");
    Ok(())
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.write_all(&buf[..n])?;
    }
    let hash = hasher.finalize();
    Ok(format!("{hash:x}"))
}
