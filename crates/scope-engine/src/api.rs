//! Client for the Citra task-dispatch API.
//!
//! Everything the daemon says to the server goes through [`CitraApi`]; the
//! HTTP implementation is [`CitraClient`]. Tests substitute an in-memory
//! implementation, so the trait is the authoritative contract.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Errors from the dispatch API.
///
/// Every variant is treated as transient by callers: failed work items
/// re-enter the retry path, never a crash.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("http {status}: {body}")]
    Status { status: u16, body: String },
    /// 4xx/5xx with an HTML body, typically a proxy error page rather than
    /// API itself. Logged without the body to keep the noise down.
    #[error("http {status}: HTML error page (likely proxy or gateway)")]
    HtmlErrorPage { status: u16 },
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{0}")]
    Invalid(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Task record as listed by `GET /telescopes/{id}/tasks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDto {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub satellite_id: String,
    #[serde(default)]
    pub satellite_name: String,
    #[serde(default)]
    pub task_start: String,
    #[serde(default)]
    pub task_stop: String,
    #[serde(default)]
    pub telescope_id: String,
    #[serde(default)]
    pub telescope_name: String,
    #[serde(default)]
    pub ground_station_id: String,
    #[serde(default)]
    pub ground_station_name: String,
    #[serde(default)]
    pub assigned_filter_name: Option<String>,
}

/// Two-line element set attached to a satellite record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElsetDto {
    pub tle: Vec<String>,
    #[serde(default)]
    pub creation_epoch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SatelliteDto {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub elsets: Vec<ElsetDto>,
}

impl SatelliteDto {
    /// The freshest elset by creation epoch; ties broken arbitrarily.
    pub fn most_recent_elset(&self) -> Option<&ElsetDto> {
        self.elsets.iter().max_by(|a, b| {
            let ka = citrascope_core::task::parse_epoch(&a.creation_epoch).unwrap_or(0);
            let kb = citrascope_core::task::parse_epoch(&b.creation_epoch).unwrap_or(0);
            ka.cmp(&kb)
        })
    }
}

/// Telescope record with the hardware constants the pipeline consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelescopeDto {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ground_station_id: String,
    #[serde(default)]
    pub automated_scheduling: bool,
    #[serde(default)]
    pub max_slew_rate: Option<f64>,
    #[serde(default)]
    pub angular_noise: Option<f64>,
    #[serde(default)]
    pub spectral_min_wavelength_nm: Option<f64>,
    #[serde(default)]
    pub spectral_max_wavelength_nm: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundStationDto {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub altitude: f64,
}

/// Response of `POST /my/images`: a server-signed multipart target.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUploadDto {
    pub upload_url: String,
    #[serde(default)]
    pub fields: HashMap<String, String>,
    #[serde(default)]
    pub results_url: Option<String>,
}

/// One record for `POST /observations/optical`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpticalObservationDto {
    pub satellite_id: String,
    pub telescope_id: String,
    pub epoch: String,
    pub right_ascension: f64,
    pub declination: f64,
    pub sensor_latitude: f64,
    pub sensor_longitude: f64,
    pub sensor_altitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub angular_noise: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visual_magnitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_wavelength: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_wavelength: Option<f64>,
}

/// Terminal task states the daemon reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Succeeded,
    Failed,
}

impl TerminalStatus {
    fn as_str(self) -> &'static str {
        match self {
            TerminalStatus::Succeeded => "Succeeded",
            TerminalStatus::Failed => "Failed",
        }
    }
}

/// The dispatch-API surface the engine consumes.
#[async_trait]
pub trait CitraApi: Send + Sync {
    /// True when the configured access token authenticates.
    async fn check_token(&self) -> bool;

    async fn telescope(&self, telescope_id: &str) -> ApiResult<TelescopeDto>;
    async fn ground_station(&self, ground_station_id: &str) -> ApiResult<GroundStationDto>;
    async fn satellite(&self, satellite_id: &str) -> ApiResult<SatelliteDto>;
    async fn telescope_tasks(&self, telescope_id: &str) -> ApiResult<Vec<TaskDto>>;

    /// `PUT /tasks/{id}` with a terminal status.
    async fn set_task_status(&self, task_id: &str, status: TerminalStatus) -> ApiResult<()>;

    /// `PATCH /telescopes` toggling automated scheduling.
    async fn set_automated_scheduling(&self, telescope_id: &str, enabled: bool) -> ApiResult<()>;

    /// Online heartbeat (`PUT /telescopes`).
    async fn put_telescope_status(&self, body: &serde_json::Value) -> ApiResult<()>;

    /// Signed multipart image upload; returns the results URL when the
    /// server provides one.
    async fn upload_image(
        &self,
        task_id: &str,
        telescope_id: &str,
        filepath: &Path,
    ) -> ApiResult<Option<String>>;

    async fn post_optical_observations(
        &self,
        observations: &[OpticalObservationDto],
    ) -> ApiResult<()>;

    /// `PUT /ground-stations/{id}` with a new lat/long/alt (mobile
    /// stations).
    async fn update_ground_station_location(
        &self,
        ground_station_id: &str,
        latitude: f64,
        longitude: f64,
        altitude: f64,
    ) -> ApiResult<()>;
}

/// HTTP implementation of [`CitraApi`].
pub struct CitraClient {
    http: reqwest::Client,
    base_url: String,
}

impl CitraClient {
    pub fn new(base_url: impl Into<String>, token: &str) -> ApiResult<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| ApiError::Invalid("access token is not a valid header value".into()))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{endpoint}", self.base_url)
    }

    async fn check_response(res: reqwest::Response) -> ApiResult<reqwest::Response> {
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }

        let content_type = res
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = res.text().await.unwrap_or_default();

        // Proxies in front of the API answer with HTML error pages; don't
        // drag full markup into the logs.
        if content_type.contains("text/html") || body.trim_start().starts_with('<') {
            return Err(ApiError::HtmlErrorPage {
                status: status.as_u16(),
            });
        }
        Err(ApiError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, endpoint: &str) -> ApiResult<T> {
        let res = self.http.get(self.url(endpoint)).send().await?;
        let res = Self::check_response(res).await?;
        Ok(res.json().await?)
    }
}

#[async_trait]
impl CitraApi for CitraClient {
    async fn check_token(&self) -> bool {
        match self.http.get(self.url("/auth/personal-access-tokens")).send().await {
            Ok(res) => Self::check_response(res).await.is_ok(),
            Err(err) => {
                tracing::error!("token check request failed: {err:#}");
                false
            }
        }
    }

    async fn telescope(&self, telescope_id: &str) -> ApiResult<TelescopeDto> {
        self.get_json(&format!("/telescopes/{telescope_id}")).await
    }

    async fn ground_station(&self, ground_station_id: &str) -> ApiResult<GroundStationDto> {
        self.get_json(&format!("/ground-stations/{ground_station_id}")).await
    }

    async fn satellite(&self, satellite_id: &str) -> ApiResult<SatelliteDto> {
        self.get_json(&format!("/satellites/{satellite_id}")).await
    }

    async fn telescope_tasks(&self, telescope_id: &str) -> ApiResult<Vec<TaskDto>> {
        self.get_json(&format!("/telescopes/{telescope_id}/tasks")).await
    }

    async fn set_task_status(&self, task_id: &str, status: TerminalStatus) -> ApiResult<()> {
        let res = self
            .http
            .put(self.url(&format!("/tasks/{task_id}")))
            .json(&serde_json::json!({ "status": status.as_str() }))
            .send()
            .await?;
        Self::check_response(res).await?;
        tracing::debug!(task_id, status = status.as_str(), "reported terminal task status");
        Ok(())
    }

    async fn set_automated_scheduling(&self, telescope_id: &str, enabled: bool) -> ApiResult<()> {
        let payload =
            serde_json::json!([{ "id": telescope_id, "automatedScheduling": enabled }]);
        let res = self.http.patch(self.url("/telescopes")).json(&payload).send().await?;
        Self::check_response(res).await?;
        Ok(())
    }

    async fn put_telescope_status(&self, body: &serde_json::Value) -> ApiResult<()> {
        let res = self.http.put(self.url("/telescopes")).json(body).send().await?;
        Self::check_response(res).await?;
        Ok(())
    }

    async fn upload_image(
        &self,
        task_id: &str,
        telescope_id: &str,
        filepath: &Path,
    ) -> ApiResult<Option<String>> {
        let file_size = std::fs::metadata(filepath)
            .map_err(|err| ApiError::Invalid(format!("stat {}: {err}", filepath.display())))?
            .len();

        let endpoint = format!(
            "/my/images?filename=citra_task_{task_id}_image.fits\
             &telescope_id={telescope_id}&task_id={task_id}&file_size={file_size}"
        );
        let res = self.http.post(self.url(&endpoint)).send().await?;
        let res = Self::check_response(res).await?;
        let signed: SignedUploadDto = res.json().await?;

        let bytes = {
            let path = filepath.to_path_buf();
            tokio::task::spawn_blocking(move || std::fs::read(&path))
                .await
                .map_err(|err| ApiError::Invalid(format!("read join: {err}")))?
                .map_err(|err| ApiError::Invalid(format!("read {}: {err}", filepath.display())))?
        };

        let filename = filepath
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image.fits".to_string());

        let mut form = reqwest::multipart::Form::new();
        for (key, value) in &signed.fields {
            form = form.text(key.clone(), value.clone());
        }
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename)
            .mime_str("application/fits")?;
        form = form.part("file", part);

        let res = self.http.post(&signed.upload_url).multipart(form).send().await?;
        Self::check_response(res).await?;

        tracing::debug!(task_id, "image upload accepted");
        Ok(signed.results_url)
    }

    async fn post_optical_observations(
        &self,
        observations: &[OpticalObservationDto],
    ) -> ApiResult<()> {
        if observations.is_empty() {
            return Err(ApiError::Invalid("no observations to upload".into()));
        }
        let res = self
            .http
            .post(self.url("/observations/optical"))
            .json(observations)
            .send()
            .await?;
        Self::check_response(res).await?;
        tracing::info!(count = observations.len(), "uploaded optical observations");
        Ok(())
    }

    async fn update_ground_station_location(
        &self,
        ground_station_id: &str,
        latitude: f64,
        longitude: f64,
        altitude: f64,
    ) -> ApiResult<()> {
        let body = serde_json::json!({
            "latitude": latitude,
            "longitude": longitude,
            "altitude": altitude,
        });
        let res = self
            .http
            .put(self.url(&format!("/ground-stations/{ground_station_id}")))
            .json(&body)
            .send()
            .await?;
        Self::check_response(res).await?;
        Ok(())
    }
}
