//! Firmware update client
//!
//! The device asks an HTTP update server whether newer firmware exists,
//! streams the image into a staging directory and marks it ready for the
//! bootloader. Writing the image to flash is left to the platform.

use crate::config::OtaSection;
use crate::error::DeviceError;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Largest image the staging area accepts
pub const MAX_IMAGE_BYTES: u64 = 16 * 1024 * 1024;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum OtaError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP Error: {0}")]
    Status(u16),

    #[error("Invalid update response: {0}")]
    InvalidResponse(String),

    #[error("No update available")]
    NoUpdate,

    #[error("No update URL available")]
    MissingDownloadUrl,

    #[error("Image size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Image of {0} bytes exceeds the staging limit")]
    TooLarge(u64),

    #[error("No staged image to install")]
    NothingStaged,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<OtaError> for DeviceError {
    fn from(err: OtaError) -> Self {
        DeviceError::ota(err.to_string())
    }
}

pub type OtaResult<T> = Result<T, OtaError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaState {
    Idle,
    Checking,
    Downloading,
    Installing,
    Success,
    Error(String),
}

/// Update advertised by the server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    pub version: String,
    pub download_url: String,
    pub release_notes: String,
    pub required: bool,
    pub file_size: u64,
    pub checksum: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckUpdateResponse {
    #[serde(default)]
    update_available: bool,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    download_url: Option<String>,
    #[serde(default)]
    release_notes: Option<String>,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    file_size: u64,
    #[serde(default)]
    checksum: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckUpdateRequest<'a> {
    device_id: &'a str,
    current_version: &'a str,
    platform: String,
    free_space: u64,
}

/// Marker written next to a staged image once it is ready to boot
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StagedImage {
    version: String,
    file_size: u64,
    checksum: String,
    staged_at: i64,
}

pub struct OtaManager {
    device_id: String,
    current_version: String,
    server_url: String,
    check_interval_ms: i64,
    auto_install_required: bool,
    staging_dir: PathBuf,
    client: Client,
    state: OtaState,
    latest: Option<UpdateInfo>,
    staged: Option<PathBuf>,
    progress: u8,
    last_check: Option<i64>,
}

impl OtaManager {
    pub fn new(
        device_id: impl Into<String>,
        current_version: impl Into<String>,
        config: &OtaSection,
        staging_dir: impl Into<PathBuf>,
    ) -> OtaResult<Self> {
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;

        Ok(Self {
            device_id: device_id.into(),
            current_version: current_version.into(),
            server_url: config.server_url.trim_end_matches('/').to_string(),
            check_interval_ms: (config.check_interval_secs as i64).saturating_mul(1000),
            auto_install_required: config.auto_install_required,
            staging_dir: staging_dir.into(),
            client,
            state: OtaState::Idle,
            latest: None,
            staged: None,
            progress: 0,
            last_check: None,
        })
    }

    pub fn state(&self) -> &OtaState {
        &self.state
    }

    pub fn latest_update(&self) -> Option<&UpdateInfo> {
        self.latest.as_ref()
    }

    /// Download progress, 0 to 100
    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    fn fail(&mut self, err: OtaError) -> OtaError {
        warn!(device_id = %self.device_id, error = %err, "OTA operation failed");
        self.state = OtaState::Error(err.to_string());
        err
    }

    /// Ask the update server for newer firmware
    ///
    /// Returns true when an update is available.
    pub async fn check_for_updates(&mut self) -> OtaResult<bool> {
        self.state = OtaState::Checking;
        info!(
            device_id = %self.device_id,
            server = %self.server_url,
            "Checking for firmware updates"
        );

        match self.request_update_info().await {
            Ok(info) => {
                self.latest = info;
                self.state = OtaState::Idle;
                let available = self.is_update_available();
                if let Some(update) = self.latest.as_ref().filter(|_| available) {
                    info!(
                        version = %update.version,
                        required = update.required,
                        file_size = update.file_size,
                        "Firmware update available"
                    );
                } else {
                    debug!("No firmware update available");
                }
                Ok(available)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn request_update_info(&self) -> OtaResult<Option<UpdateInfo>> {
        let request = CheckUpdateRequest {
            device_id: &self.device_id,
            current_version: &self.current_version,
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            free_space: MAX_IMAGE_BYTES,
        };

        let response = self
            .client
            .post(format!("{}/check-update", self.server_url))
            .json(&request)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(OtaError::Status(response.status().as_u16()));
        }

        let body: CheckUpdateResponse = response
            .json()
            .await
            .map_err(|e| OtaError::InvalidResponse(e.to_string()))?;

        if !body.update_available {
            return Ok(None);
        }

        Ok(Some(UpdateInfo {
            version: body.version.unwrap_or_default(),
            download_url: body.download_url.unwrap_or_default(),
            release_notes: body.release_notes.unwrap_or_default(),
            required: body.required,
            file_size: body.file_size,
            checksum: body.checksum.unwrap_or_default(),
        }))
    }

    pub fn is_update_available(&self) -> bool {
        self.latest
            .as_ref()
            .map_or(false, |u| !u.version.is_empty() && u.version != self.current_version)
    }

    pub fn is_update_required(&self) -> bool {
        self.latest.as_ref().map_or(false, |u| u.required)
    }

    /// Stream the advertised image to `dest`
    ///
    /// The file is written under a temporary name and only renamed into place
    /// once its size matches the advertised `fileSize`.
    pub async fn download_update(&mut self, dest: &Path) -> OtaResult<u64> {
        let update = match self.latest.clone().filter(|_| self.is_update_available()) {
            Some(update) => update,
            None => return Err(self.fail(OtaError::NoUpdate)),
        };
        if update.download_url.is_empty() {
            return Err(self.fail(OtaError::MissingDownloadUrl));
        }
        if update.file_size > MAX_IMAGE_BYTES {
            return Err(self.fail(OtaError::TooLarge(update.file_size)));
        }

        self.state = OtaState::Downloading;
        self.progress = 0;
        info!(
            version = %update.version,
            file_size = update.file_size,
            checksum = %update.checksum,
            "Downloading firmware image"
        );

        match self.stream_to_file(&update, dest).await {
            Ok(written) => {
                self.staged = Some(dest.to_path_buf());
                self.progress = 100;
                self.state = OtaState::Idle;
                info!(bytes = written, path = %dest.display(), "Firmware image downloaded");
                Ok(written)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn stream_to_file(&mut self, update: &UpdateInfo, dest: &Path) -> OtaResult<u64> {
        let mut response = self.client.get(&update.download_url).send().await?;
        if !response.status().is_success() {
            return Err(OtaError::Status(response.status().as_u16()));
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = dest.with_extension("part");
        let mut file = tokio::fs::File::create(&partial).await?;

        let total = update.file_size;
        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            written += chunk.len() as u64;
            if written > MAX_IMAGE_BYTES || (total > 0 && written > total) {
                drop(file);
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(OtaError::SizeMismatch {
                    expected: total,
                    actual: written,
                });
            }
            file.write_all(&chunk).await?;

            if total > 0 {
                let progress = ((written * 100) / total).min(100) as u8;
                if progress / 10 > self.progress / 10 {
                    debug!(progress, "Download progress");
                }
                self.progress = progress;
            }
        }
        file.flush().await?;
        drop(file);

        if total > 0 && written != total {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(OtaError::SizeMismatch {
                expected: total,
                actual: written,
            });
        }

        tokio::fs::rename(&partial, dest).await?;
        Ok(written)
    }

    /// Mark the staged image ready to boot
    pub async fn install_update(&mut self) -> OtaResult<()> {
        let (Some(path), Some(update)) = (self.staged.clone(), self.latest.clone()) else {
            return Err(self.fail(OtaError::NothingStaged));
        };

        self.state = OtaState::Installing;
        let marker = StagedImage {
            version: update.version.clone(),
            file_size: update.file_size,
            checksum: update.checksum.clone(),
            staged_at: crate::protocol::now_millis(),
        };

        let result = async {
            let body = serde_json::to_vec_pretty(&marker)
                .map_err(|e| OtaError::InvalidResponse(e.to_string()))?;
            tokio::fs::write(path.with_extension("ready"), body).await?;
            Ok::<(), OtaError>(())
        }
        .await;

        match result {
            Ok(()) => {
                self.state = OtaState::Success;
                info!(version = %update.version, "Firmware update staged for next boot");
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Periodic check; installs required updates when configured to
    ///
    /// Returns true when an update was installed during this call.
    pub async fn handle_auto_updates(&mut self, now_ms: i64) -> OtaResult<bool> {
        let due = self
            .last_check
            .map_or(true, |last| now_ms - last >= self.check_interval_ms);
        if !due {
            return Ok(false);
        }
        self.last_check = Some(now_ms);

        if !self.check_for_updates().await? {
            return Ok(false);
        }
        if !(self.is_update_required() && self.auto_install_required) {
            debug!("Optional update left for operator approval");
            return Ok(false);
        }

        info!("Required update found, installing automatically");
        let dest = self.image_path();
        self.download_update(&dest).await?;
        self.install_update().await?;
        Ok(true)
    }

    /// Staging path for the advertised version
    pub fn image_path(&self) -> PathBuf {
        let version = self
            .latest
            .as_ref()
            .map(|u| u.version.as_str())
            .unwrap_or("unknown");
        self.staging_dir.join(format!("firmware-{version}.bin"))
    }

    /// Probe the update server's `/ping` endpoint
    pub async fn perform_self_test(&self) -> OtaResult<()> {
        let response = self
            .client
            .get(format!("{}/ping", self.server_url))
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(OtaError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    pub fn status_string(&self) -> String {
        match &self.state {
            OtaState::Idle => "Idle".to_string(),
            OtaState::Checking => "Checking for updates".to_string(),
            OtaState::Downloading => "Downloading update".to_string(),
            OtaState::Installing => "Installing update".to_string(),
            OtaState::Success => "Update successful".to_string(),
            OtaState::Error(message) => format!("Error: {message}"),
        }
    }
}
