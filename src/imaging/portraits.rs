//! Character portraits stored on disk
//!
//! Files are named `{user|assistant}_{timestamp}.png` for uploads and
//! `{user|assistant}_generated_{timestamp}.png` for generated ones. The most
//! recent file of each type is the active portrait.

use super::{encode_base64, to_png};
use crate::{ParleyError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::SystemTime;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CharacterType {
    User,
    Assistant,
}

impl CharacterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CharacterType::User => "user",
            CharacterType::Assistant => "assistant",
        }
    }
}

impl fmt::Display for CharacterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CharacterType {
    type Err = ParleyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(CharacterType::User),
            "assistant" => Ok(CharacterType::Assistant),
            other => Err(ParleyError::ProtocolError(format!(
                "character_type must be 'user' or 'assistant', got '{}'",
                other
            ))),
        }
    }
}

/// A stored portrait, as returned to clients
#[derive(Clone, Debug, Serialize)]
pub struct Portrait {
    pub filename: String,
    pub path: String,
    /// Base64 PNG
    pub image: String,
}

#[derive(Clone, Debug)]
pub struct PortraitStore {
    dir: PathBuf,
}

impl PortraitStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store an uploaded image, converted to PNG
    pub async fn save_upload(&self, kind: CharacterType, bytes: &[u8]) -> Result<Portrait> {
        let png = to_png(bytes)?;
        let filename = format!("{}_{}.png", kind, timestamp());
        self.write(&filename, &png).await
    }

    pub async fn save_generated(&self, kind: CharacterType, png: &[u8]) -> Result<Portrait> {
        let filename = format!("{}_generated_{}.png", kind, timestamp());
        self.write(&filename, png).await
    }

    async fn write(&self, filename: &str, png: &[u8]) -> Result<Portrait> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(filename);
        tokio::fs::write(&path, png).await?;
        info!("Saved character portrait {}", path.display());

        Ok(Portrait {
            filename: filename.to_string(),
            path: path.display().to_string(),
            image: encode_base64(png),
        })
    }

    /// The most recent portrait of `kind`, if any
    pub async fn latest(&self, kind: CharacterType) -> Result<Option<Portrait>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let prefix = format!("{}_", kind);
        let mut newest: Option<(SystemTime, String, PathBuf)> = None;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(&prefix) || !name.ends_with(".png") {
                continue;
            }
            let modified = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let newer = match &newest {
                Some((time, existing, _)) => (modified, &name) > (*time, existing),
                None => true,
            };
            if newer {
                newest = Some((modified, name, entry.path()));
            }
        }

        let Some((_, filename, path)) = newest else {
            return Ok(None);
        };
        debug!("Latest {} portrait: {}", kind, filename);
        let png = tokio::fs::read(&path).await?;
        Ok(Some(Portrait {
            filename,
            path: path.display().to_string(),
            image: encode_base64(&png),
        }))
    }
}

fn timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S%3f").to_string()
}
