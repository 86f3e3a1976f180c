//! GitHub release lookup and artifact download.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Default GitHub REST endpoint.
pub const GITHUB_API_URL: &str = "https://api.github.com";

/// Suffix of a checksum companion asset.
const CHECKSUM_SUFFIX: &str = ".sha256";

/// Error type for release operations.
#[derive(Debug, Error)]
pub enum ReleaseError {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error
    #[error("GitHub API error: {message} (status: {status})")]
    Api { status: u16, message: String },

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Repository or release not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Nothing in the release targets this platform
    #[error("Release {tag} has no asset for {os}")]
    NoAsset { tag: String, os: String },

    /// Downloaded bytes do not match the published digest
    #[error("Checksum mismatch for {asset}: expected {expected}, got {actual}")]
    Checksum { asset: String, expected: String, actual: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for release operations.
pub type ReleaseResult<T> = Result<T, ReleaseError>;

/// A published release.
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

/// One downloadable file attached to a release.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    /// API URL; serves the bytes when asked for `application/octet-stream`.
    pub url: String,
    #[serde(default)]
    pub size: u64,
}

impl ReleaseAsset {
    fn is_checksum(&self) -> bool {
        self.name.to_lowercase().ends_with(CHECKSUM_SUFFIX)
    }
}

/// Name fragments identifying an OS in asset names.
fn os_aliases(os: &str) -> &'static [&'static str] {
    match os {
        "linux" => &["linux"],
        "macos" => &["darwin", "macos", "apple", "osx"],
        "windows" => &["windows", "win64", "win32"],
        "freebsd" => &["freebsd"],
        _ => &[],
    }
}

fn arch_aliases(arch: &str) -> &'static [&'static str] {
    match arch {
        "x86_64" => &["x86_64", "amd64", "x64"],
        "aarch64" => &["aarch64", "arm64"],
        "x86" => &["i386", "i686", "386"],
        _ => &[],
    }
}

/// Pick the asset built for `os`/`arch`.
///
/// Assets naming both win over assets naming only the OS. Checksum files
/// are never selected.
pub fn select_asset<'a>(assets: &'a [ReleaseAsset], os: &str, arch: &str) -> Option<&'a ReleaseAsset> {
    let os_names = os_aliases(os);
    let arch_names = arch_aliases(arch);

    let for_os: Vec<&ReleaseAsset> = assets
        .iter()
        .filter(|asset| !asset.is_checksum())
        .filter(|asset| {
            let name = asset.name.to_lowercase();
            os_names.iter().any(|alias| name.contains(alias))
        })
        .collect();

    for_os
        .iter()
        .find(|asset| {
            let name = asset.name.to_lowercase();
            arch_names.iter().any(|alias| name.contains(alias))
        })
        .or_else(|| for_os.first())
        .copied()
}

/// Blocking client for a repository's releases.
pub struct GitHubReleases {
    client: reqwest::blocking::Client,
    base_url: String,
    token: Option<String>,
}

impl GitHubReleases {
    /// Create a client against another API root.
    pub fn with_base_url(base_url: impl Into<String>, token: Option<String>) -> ReleaseResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(300))
            .user_agent(format!("sprig/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_string(), token })
    }

    fn request(&self, url: &str, accept: &str) -> reqwest::blocking::RequestBuilder {
        let mut request = self
            .client
            .get(url)
            .header("Accept", accept)
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        request
    }

    fn send(&self, url: &str, accept: &str) -> ReleaseResult<reqwest::blocking::Response> {
        let response = self.request(url, accept).send()?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().unwrap_or_else(|_| "Unknown error".to_string());
        match status.as_u16() {
            401 | 403 => Err(ReleaseError::Auth(message)),
            404 => Err(ReleaseError::NotFound(url.to_string())),
            code => Err(ReleaseError::Api { status: code, message }),
        }
    }

    /// Latest published release of `owner/repo`.
    pub fn latest(&self, owner: &str, repo: &str) -> ReleaseResult<Release> {
        let url = format!("{}/repos/{}/{}/releases/latest", self.base_url, owner, repo);
        tracing::debug!("Fetching {}", url);
        Ok(self.send(&url, "application/vnd.github+json")?.json()?)
    }

    fn fetch_bytes(&self, asset: &ReleaseAsset) -> ReleaseResult<Vec<u8>> {
        tracing::debug!("Downloading {} ({} bytes)", asset.name, asset.size);
        Ok(self.send(&asset.url, "application/octet-stream")?.bytes()?.to_vec())
    }

    /// Download the asset for this platform into `dest_dir`.
    ///
    /// When the release carries `<asset>.sha256`, the download is verified
    /// against it.
    pub fn download(&self, release: &Release, dest_dir: &Path) -> ReleaseResult<PathBuf> {
        let os = std::env::consts::OS;
        let asset = select_asset(&release.assets, os, std::env::consts::ARCH).ok_or_else(|| {
            ReleaseError::NoAsset { tag: release.tag_name.clone(), os: os.to_string() }
        })?;

        let bytes = self.fetch_bytes(asset)?;

        let checksum_name = format!("{}{}", asset.name, CHECKSUM_SUFFIX);
        if let Some(checksum) = release.assets.iter().find(|a| a.name == checksum_name) {
            let published = String::from_utf8_lossy(&self.fetch_bytes(checksum)?).into_owned();
            verify_checksum(&asset.name, &bytes, &published)?;
        }

        std::fs::create_dir_all(dest_dir)?;
        let dest = dest_dir.join(&asset.name);
        std::fs::write(&dest, bytes)?;
        Ok(dest)
    }
}

/// Compare `bytes` with the first token of a `sha256sum`-style file.
fn verify_checksum(asset: &str, bytes: &[u8], published: &str) -> ReleaseResult<()> {
    let expected = published.split_whitespace().next().unwrap_or_default().to_lowercase();

    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let actual = format!("{:x}", hasher.finalize());

    if actual != expected {
        return Err(ReleaseError::Checksum { asset: asset.to_string(), expected, actual });
    }
    Ok(())
}
