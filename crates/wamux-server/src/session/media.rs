//! Local storage for downloaded inbound media.
//!
//! Files are named `<message_id>_<unix_secs><ext>` under the media root and
//! exposed as `<url_prefix>/<file>`.

use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Map a mime type to a file extension. Unknown types get `.bin`.
pub fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/webp" => ".webp",
        "audio/ogg; codecs=opus" => ".ogg",
        "audio/mpeg" => ".mp3",
        "video/mp4" => ".mp4",
        "application/pdf" => ".pdf",
        _ => ".bin",
    }
}

pub struct MediaStorage {
    dir: PathBuf,
    url_prefix: String,
}

impl MediaStorage {
    pub fn new(dir: PathBuf, url_prefix: impl Into<String>) -> Self {
        Self {
            dir,
            url_prefix: url_prefix.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `data` for `message_id` and return its public URL.
    pub async fn save(&self, message_id: &str, mime: &str, data: &[u8]) -> std::io::Result<String> {
        let file_name = media_file_name(message_id, mime, chrono::Utc::now().timestamp());
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.dir.join(&file_name);
        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(data).await?;
        file.flush().await?;

        debug!(path = %path.display(), bytes = data.len(), "media saved");
        Ok(format!("{}/{}", self.url_prefix, file_name))
    }
}

fn media_file_name(message_id: &str, mime: &str, unix_secs: i64) -> String {
    // Message ids are engine-assigned; keep only path-safe characters.
    let safe: String = message_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        .collect();
    format!("{safe}_{unix_secs}{}", extension_for_mime(mime))
}
