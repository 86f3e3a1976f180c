//! Plugin installation, listing and removal.
//!
//! The plugin directory is the only state: installing copies executables
//! into it, removing deletes one. Changes take effect on the next start.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tempfile::{NamedTempFile, TempDir};
use thiserror::Error;

use super::archive::{self, ArchiveError};
use super::loader::PluginDescriptor;
use super::release::{GitHubReleases, ReleaseError, GITHUB_API_URL};

static REPO_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^github\.com/(?P<owner>[[:alnum:]\-]+)/(?P<repo>[[:alnum:]\._\-]+)$")
        .expect("repository URL pattern is valid")
});

/// Column gap in the plugin table.
const TABLE_PADDING: usize = 4;

/// Errors from install and remove.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("{0} is not a valid Github repo URL")]
    InvalidUrl(String),

    #[error("No access token named '{0}'. Add one with 'sprig plugins auth add {0}'")]
    UnknownToken(String),

    #[error("Artifact not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to fetch release: {0}")]
    Release(#[from] ReleaseError),

    #[error("Failed to unpack artifact: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Failed to remove plugin file {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid selection: {0}")]
    InvalidSelection(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for lifecycle operations.
pub type InstallResult<T> = Result<T, InstallError>;

/// Where a plugin is installed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallSource {
    /// Latest release of a GitHub repository.
    GitHub { owner: String, repo: String, token: Option<String> },
    /// A local archive or executable.
    File(PathBuf),
}

/// Split `github.com/<owner>/<repo>` into its parts.
pub fn parse_repo_url(url: &str) -> InstallResult<(String, String)> {
    let caps = REPO_URL.captures(url.trim()).ok_or_else(|| InstallError::InvalidUrl(url.to_string()))?;
    Ok((caps["owner"].to_string(), caps["repo"].to_string()))
}

/// Look up a named access token.
pub fn resolve_token(tokens: &BTreeMap<String, String>, name: &str) -> InstallResult<String> {
    tokens.get(name).cloned().ok_or_else(|| InstallError::UnknownToken(name.to_string()))
}

/// Write the `PLUGIN VERSION DESCRIPTION` table.
pub fn render_list(descriptors: &[&PluginDescriptor], mut out: impl Write) -> io::Result<()> {
    let mut rows = vec![["PLUGIN", "VERSION", "DESCRIPTION"]];
    rows.extend(
        descriptors
            .iter()
            .map(|d| [d.name.as_str(), d.version.as_str(), d.description.as_str()]),
    );

    let name_width = rows.iter().map(|r| r[0].len()).max().unwrap_or(0) + TABLE_PADDING;
    let version_width = rows.iter().map(|r| r[1].len()).max().unwrap_or(0) + TABLE_PADDING;

    writeln!(out)?;
    for [name, version, description] in rows {
        let line = format!("{name:<name_width$}{version:<version_width$}{description}");
        writeln!(out, "{}", line.trim_end())?;
    }
    writeln!(out)?;
    Ok(())
}

/// Numbered prompt over `descriptors`. `Ok(None)` means the user cancelled.
pub fn select_plugin(
    descriptors: &[&PluginDescriptor],
    mut input: impl BufRead,
    mut out: impl Write,
) -> InstallResult<Option<usize>> {
    writeln!(out, "Plugin to remove:")?;
    for (i, d) in descriptors.iter().enumerate() {
        writeln!(out, "  {}) {} {} - {}", i + 1, d.name, d.version, d.description)?;
    }
    write!(out, "Select [1-{}] (empty to cancel): ", descriptors.len())?;
    out.flush()?;

    let mut line = String::new();
    input.read_line(&mut line)?;
    let choice = line.trim();
    if choice.is_empty() {
        return Ok(None);
    }

    match choice.parse::<usize>() {
        Ok(n) if (1..=descriptors.len()).contains(&n) => Ok(Some(n - 1)),
        _ => Err(InstallError::InvalidSelection(choice.to_string())),
    }
}

/// Installs into and removes from one plugin directory.
#[derive(Debug, Clone)]
pub struct PluginManager {
    plugins_dir: PathBuf,
    api_url: String,
}

impl PluginManager {
    pub fn new(plugins_dir: impl Into<PathBuf>) -> Self {
        Self { plugins_dir: plugins_dir.into(), api_url: GITHUB_API_URL.to_string() }
    }

    /// Use another GitHub API root.
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    /// Install every executable from `source`. Returns the installed paths.
    ///
    /// All work happens in a staging directory; the plugin directory is
    /// only touched once every file is ready.
    pub fn install(&self, source: &InstallSource) -> InstallResult<Vec<PathBuf>> {
        let staging = TempDir::new()?;

        let artifact = match source {
            InstallSource::GitHub { owner, repo, token } => {
                let client = GitHubReleases::with_base_url(&self.api_url, token.clone())?;
                let release = client.latest(owner, repo)?;
                tracing::info!(
                    "Installing {}/{} {}",
                    owner,
                    repo,
                    release.name.as_deref().unwrap_or(&release.tag_name)
                );
                client.download(&release, &staging.path().join("download"))?
            }
            InstallSource::File(path) => {
                if !path.is_file() {
                    return Err(InstallError::NotFound(path.clone()));
                }
                path.clone()
            }
        };

        let executables = archive::extract(&artifact, &staging.path().join("extract"))?;
        self.place(&executables)
    }

    /// Copy staged executables into the plugin directory, all or nothing.
    fn place(&self, executables: &[PathBuf]) -> InstallResult<Vec<PathBuf>> {
        fs::create_dir_all(&self.plugins_dir)?;

        let mut ready = Vec::with_capacity(executables.len());
        for source in executables {
            let Some(name) = source.file_name() else { continue };
            let mut temp = NamedTempFile::new_in(&self.plugins_dir)?;
            io::copy(&mut fs::File::open(source)?, temp.as_file_mut())?;
            make_executable(temp.path())?;
            ready.push((temp, self.plugins_dir.join(name)));
        }

        let mut installed = Vec::with_capacity(ready.len());
        for (temp, dest) in ready {
            temp.persist(&dest).map_err(|e| InstallError::Io(e.error))?;
            tracing::info!("Installed plugin file {}", dest.display());
            installed.push(dest);
        }
        Ok(installed)
    }

    /// Delete a plugin file.
    pub fn remove(&self, path: &Path) -> InstallResult<()> {
        fs::remove_file(path)
            .map_err(|source| InstallError::Remove { path: path.to_path_buf(), source })
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, version: &str, description: &str) -> PluginDescriptor {
        PluginDescriptor {
            name: name.to_string(),
            description: description.to_string(),
            version: version.to_string(),
            path: PathBuf::from("/plugins").join(name),
        }
    }

    #[test]
    fn test_parse_repo_url() {
        assert_eq!(
            parse_repo_url("github.com/acme/sprig-foo_plugin.v2").unwrap(),
            ("acme".to_string(), "sprig-foo_plugin.v2".to_string())
        );
        for bad in [
            "https://github.com/acme/foo",
            "github.com/acme",
            "gitlab.com/acme/foo",
            "github.com/acme/foo/bar",
            "github.com/ac_me/foo",
        ] {
            assert!(matches!(parse_repo_url(bad), Err(InstallError::InvalidUrl(_))), "{bad}");
        }
    }

    #[test]
    fn test_resolve_token() {
        let mut tokens = BTreeMap::new();
        tokens.insert("work".to_string(), "ghp_x".to_string());

        assert_eq!(resolve_token(&tokens, "work").unwrap(), "ghp_x");
        assert!(matches!(resolve_token(&tokens, "home"), Err(InstallError::UnknownToken(_))));
    }

    #[test]
    fn test_render_list() {
        let foo = descriptor("foo", "1.0", "Foo things");
        let longer = descriptor("longer-name", "0.10.2", "Other things");
        let mut out = Vec::new();

        render_list(&[&foo, &longer], &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "");
        assert_eq!(lines[1], "PLUGIN         VERSION    DESCRIPTION");
        assert_eq!(lines[2], "foo            1.0        Foo things");
        assert_eq!(lines[3], "longer-name    0.10.2     Other things");
    }

    #[test]
    fn test_select_plugin() {
        let foo = descriptor("foo", "1.0", "Foo");
        let bar = descriptor("bar", "2.0", "Bar");
        let list = [&foo, &bar];

        let mut out = Vec::new();
        assert_eq!(select_plugin(&list, "2\n".as_bytes(), &mut out).unwrap(), Some(1));
        assert!(String::from_utf8(out).unwrap().contains("  2) bar 2.0 - Bar"));

        assert_eq!(select_plugin(&list, "\n".as_bytes(), io::sink()).unwrap(), None);
        assert!(matches!(
            select_plugin(&list, "3\n".as_bytes(), io::sink()),
            Err(InstallError::InvalidSelection(_))
        ));
        assert!(matches!(
            select_plugin(&list, "foo\n".as_bytes(), io::sink()),
            Err(InstallError::InvalidSelection(_))
        ));
    }

    #[test]
    fn test_install_from_file() {
        let temp = TempDir::new().unwrap();
        let artifact = temp.path().join("foo");
        fs::write(&artifact, "#!/bin/sh\n").unwrap();
        let manager = PluginManager::new(temp.path().join("plugins"));

        let installed = manager.install(&InstallSource::File(artifact)).unwrap();
        assert_eq!(installed, vec![temp.path().join("plugins").join("foo")]);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&installed[0]).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }

        let entries = fs::read_dir(manager.plugins_dir()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_failed_install_leaves_dir_untouched() {
        let temp = TempDir::new().unwrap();
        let plugins = temp.path().join("plugins");
        fs::create_dir(&plugins).unwrap();
        fs::write(plugins.join("existing"), "x").unwrap();

        let broken = temp.path().join("broken.tar.gz");
        fs::write(&broken, "not gzip").unwrap();

        let manager = PluginManager::new(&plugins);
        assert!(manager.install(&InstallSource::File(broken)).is_err());
        assert!(matches!(
            manager.install(&InstallSource::File(temp.path().join("missing"))),
            Err(InstallError::NotFound(_))
        ));

        let names: Vec<_> = fs::read_dir(&plugins).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(names, vec!["existing"]);
    }

    #[test]
    fn test_remove() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("foo");
        fs::write(&path, "x").unwrap();
        let manager = PluginManager::new(temp.path());

        manager.remove(&path).unwrap();
        assert!(!path.exists());
        assert!(matches!(manager.remove(&path), Err(InstallError::Remove { .. })));
    }
}
