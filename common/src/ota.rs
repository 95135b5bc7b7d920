//! Over-the-air file update from a GitHub repository.
//!
//! The file list is resolved by a pure pipeline (parse → normalize → filter
//! preserved → order) and then downloaded one file at a time, stopping at
//! the first failure.

use std::{
    collections::HashSet,
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    clock::Clock,
    config::{BoardConfig, ConfigStore},
    error::ConfigError,
    http::{BodySink, HttpClient, Request, Transport},
    wifi::{ConnectionManager, ConnectionOutcome, FailureReason, WifiDriver},
};

pub const RAW_HOST: &str = "raw.githubusercontent.com";
pub const API_HOST: &str = "api.github.com";

const MANIFEST_LIMIT: usize = 60_000;
const TREE_LIMIT: usize = 200_000;
const MANIFEST_TIMEOUT: Duration = Duration::from_secs(15);
const TREE_TIMEOUT: Duration = Duration::from_secs(20);
const FILE_TIMEOUT: Duration = Duration::from_secs(25);
const INTER_FILE_PAUSE: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("missing config key {key}")]
    MissingConfig { key: &'static str },

    #[error("bad config value for {key}: `{value}`")]
    BadConfig { key: &'static str, value: String },

    #[error("config store unavailable: {0}")]
    Store(#[from] ConfigError),

    #[error(
        "network not usable for update ({})",
        .0.failure_reason.map(FailureReason::as_str).unwrap_or("unknown")
    )]
    NoInternet(ConnectionOutcome),

    #[error("wifi error: {0}")]
    Wifi(String),

    #[error("could not resolve the update file list")]
    NoFileList,

    #[error("download of {file} failed after {updated} file(s): {error}")]
    DownloadFailed {
        updated: usize,
        file: String,
        error: String,
    },
}

impl UpdateError {
    /// Stable machine-readable reason.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingConfig { .. } => "missing_config",
            Self::BadConfig { .. } | Self::Store(_) => "bad_config",
            Self::NoInternet(_) => "no_internet",
            Self::Wifi(_) => "wifi_error",
            Self::NoFileList => "no_file_list",
            Self::DownloadFailed { .. } => "download_failed",
        }
    }

    pub fn display_message(&self) -> &'static str {
        match self {
            Self::MissingConfig { .. } | Self::BadConfig { .. } | Self::Store(_) => "Update Config ERR",
            Self::NoInternet(outcome) => outcome
                .failure_reason
                .map(FailureReason::display_message)
                .unwrap_or("No Internet"),
            Self::Wifi(_) => "WiFi ERR",
            Self::NoFileList => "No File List",
            Self::DownloadFailed { .. } => "Update Failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateSummary {
    pub files_updated: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedFile {
    pub file: String,
    pub error: String,
}

/// Terminal, serializable view of an update run for the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateResult {
    pub succeeded: bool,
    #[serde(rename = "filesUpdated")]
    pub files_updated: usize,
    pub reason: Option<&'static str>,
    pub failure: Option<FailedFile>,
}

impl From<&Result<UpdateSummary, UpdateError>> for UpdateResult {
    fn from(result: &Result<UpdateSummary, UpdateError>) -> Self {
        match result {
            Ok(summary) => Self {
                succeeded: true,
                files_updated: summary.files_updated,
                reason: None,
                failure: None,
            },
            Err(UpdateError::DownloadFailed {
                updated,
                file,
                error,
            }) => Self {
                succeeded: false,
                files_updated: *updated,
                reason: Some("download_failed"),
                failure: Some(FailedFile {
                    file: file.clone(),
                    error: error.clone(),
                }),
            },
            Err(err) => Self {
                succeeded: false,
                files_updated: 0,
                reason: Some(err.reason()),
                failure: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoId {
    pub owner: String,
    pub name: String,
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Accepts `owner/name` or a full `https://github.com/owner/name(.git)` URL.
pub fn parse_repo_id(raw: &str) -> Option<RepoId> {
    let mut repo = raw.trim();
    repo = repo.strip_prefix("https://github.com/").unwrap_or(repo);
    repo = repo.trim_matches('/');
    repo = repo.strip_suffix(".git").unwrap_or(repo);
    let repo = repo.trim_matches('/');

    let (owner, name) = repo.split_once('/')?;
    let (owner, name) = (owner.trim(), name.trim());
    if owner.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some(RepoId {
        owner: owner.to_string(),
        name: name.to_string(),
    })
}

/// Update coordinates resolved from the config document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSettings {
    pub repo: RepoId,
    pub branch: String,
    pub subdir: String,
    pub manifest_path: String,
    pub extensions: Vec<String>,
    pub preserve: Vec<String>,
    pub entry_file: String,
    pub updater_file: String,
}

impl UpdateSettings {
    pub fn from_config(config: &BoardConfig) -> Result<Self, UpdateError> {
        let raw = config
            .github_repo
            .as_deref()
            .map(str::trim)
            .filter(|repo| !repo.is_empty())
            .ok_or(UpdateError::MissingConfig { key: "GITHUB_REPO" })?;
        let repo = parse_repo_id(raw).ok_or_else(|| UpdateError::BadConfig {
            key: "GITHUB_REPO",
            value: raw.to_string(),
        })?;

        Ok(Self {
            repo,
            branch: config.github_branch.trim().to_string(),
            subdir: normalize_subdir(&config.github_subdir),
            manifest_path: config.manifest_path.trim().to_string(),
            extensions: config.file_extensions.clone(),
            preserve: config.preserve_files.clone(),
            entry_file: config.entry_file.trim_start_matches('/').to_string(),
            updater_file: config.updater_file.trim_start_matches('/').to_string(),
        })
    }

    /// Path of `relpath` on the raw content host.
    pub fn raw_path(&self, relpath: &str) -> String {
        format!(
            "/{}/{}/{}",
            self.repo,
            self.branch,
            join_repo_path(&self.subdir, relpath)
        )
    }

    pub fn tree_path(&self) -> String {
        format!(
            "/repos/{}/{}/git/trees/{}?recursive=1",
            self.repo.owner, self.repo.name, self.branch
        )
    }
}

pub fn normalize_subdir(subdir: &str) -> String {
    subdir.trim().trim_matches('/').to_string()
}

fn join_repo_path(subdir: &str, relpath: &str) -> String {
    let relpath = relpath.trim_start_matches('/');
    if subdir.is_empty() {
        relpath.to_string()
    } else {
        format!("{subdir}/{relpath}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub path: String,
    pub sha256: Option<String>,
}

impl ManifestEntry {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            sha256: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ManifestDoc {
    List(Vec<RawEntry>),
    Object { files: Vec<RawEntry> },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Path(String),
    Detailed {
        path: String,
        #[serde(default)]
        sha256: Option<String>,
    },
}

impl From<RawEntry> for ManifestEntry {
    fn from(raw: RawEntry) -> Self {
        match raw {
            RawEntry::Path(path) => Self::new(path),
            RawEntry::Detailed { path, sha256 } => Self { path, sha256 },
        }
    }
}

/// A manifest is either a JSON list or an object with a `files` list; each
/// item is a path or `{"path": .., "sha256": ..}`.
pub fn parse_manifest(body: &[u8]) -> Option<Vec<ManifestEntry>> {
    let files = match serde_json::from_slice::<ManifestDoc>(body).ok()? {
        ManifestDoc::List(files) | ManifestDoc::Object { files } => files,
    };
    Some(files.into_iter().map(ManifestEntry::from).collect())
}

#[derive(Deserialize)]
struct TreeListing {
    #[serde(default)]
    tree: Vec<TreeItem>,
}

#[derive(Deserialize)]
struct TreeItem {
    #[serde(default)]
    path: String,
    #[serde(rename = "type", default)]
    kind: String,
}

/// Blobs under `subdir` (made relative to it) whose name ends with one of
/// `extensions`. An empty extension list accepts everything.
pub fn parse_tree_listing(
    body: &[u8],
    subdir: &str,
    extensions: &[String],
) -> Option<Vec<ManifestEntry>> {
    let listing: TreeListing = serde_json::from_slice(body).ok()?;
    let subdir = normalize_subdir(subdir);
    let prefix = format!("{subdir}/");

    let files = listing
        .tree
        .into_iter()
        .filter(|item| item.kind == "blob" && !item.path.is_empty())
        .filter_map(|item| {
            if subdir.is_empty() {
                Some(item.path)
            } else {
                item.path.strip_prefix(&prefix).map(str::to_string)
            }
        })
        .filter(|path| extensions.is_empty() || extensions.iter().any(|ext| path.ends_with(ext.as_str())))
        .map(ManifestEntry::new)
        .collect();
    Some(files)
}

/// Strips leading slashes, drops empty or `..` paths, keeps the first of
/// any duplicates.
pub fn normalize_entries(entries: Vec<ManifestEntry>) -> Vec<ManifestEntry> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter_map(|mut entry| {
            let path = entry.path.trim().trim_start_matches('/');
            if path.is_empty()
                || path.ends_with('/')
                || path.split('/').any(|segment| segment == "..")
            {
                warn!("skipping unsafe update path `{}`", entry.path);
                return None;
            }
            entry.path = path.to_string();
            Some(entry)
        })
        .filter(|entry| seen.insert(entry.path.clone()))
        .collect()
}

pub fn filter_preserved(entries: Vec<ManifestEntry>, preserve: &[String]) -> Vec<ManifestEntry> {
    let preserve: HashSet<&str> = preserve
        .iter()
        .map(|path| path.trim().trim_start_matches('/'))
        .collect();
    entries
        .into_iter()
        .filter(|entry| {
            let keep = !preserve.contains(entry.path.as_str());
            if !keep {
                info!("preserving local {}", entry.path);
            }
            keep
        })
        .collect()
}

/// Ordinary files first, then the updater, then the entry point. Stable.
pub fn order_for_update(
    mut entries: Vec<ManifestEntry>,
    updater_file: &str,
    entry_file: &str,
) -> Vec<ManifestEntry> {
    entries.sort_by_key(|entry| {
        if entry.path == entry_file {
            2
        } else if entry.path == updater_file {
            1
        } else {
            0
        }
    });
    entries
}

/// The full resolve pipeline applied to a raw list.
pub fn plan_updates(entries: Vec<ManifestEntry>, settings: &UpdateSettings) -> Vec<ManifestEntry> {
    let entries = filter_preserved(normalize_entries(entries), &settings.preserve);
    order_for_update(entries, &settings.updater_file, &settings.entry_file)
}

fn fetch_manifest<T: Transport>(
    http: &mut HttpClient<T>,
    settings: &UpdateSettings,
) -> Option<Vec<ManifestEntry>> {
    let path = settings.raw_path(&settings.manifest_path);
    let request = Request::get(RAW_HOST, &path).timeout(MANIFEST_TIMEOUT);
    match http.get_bytes(&request, MANIFEST_LIMIT) {
        Ok((200, body)) if !body.is_empty() => {
            let files = parse_manifest(&body);
            if files.is_none() {
                warn!("manifest {} is malformed", settings.manifest_path);
            }
            files
        }
        Ok((status, _)) => {
            info!("no manifest at {path} (status {status})");
            None
        }
        Err(err) => {
            warn!("manifest fetch failed: {err}");
            None
        }
    }
}

fn fetch_tree_listing<T: Transport>(
    http: &mut HttpClient<T>,
    settings: &UpdateSettings,
) -> Option<Vec<ManifestEntry>> {
    let path = settings.tree_path();
    let headers = [("Accept", "application/vnd.github+json")];
    let request = Request::get(API_HOST, &path)
        .timeout(TREE_TIMEOUT)
        .headers(&headers);
    match http.get_bytes(&request, TREE_LIMIT) {
        Ok((200, body)) if !body.is_empty() => {
            parse_tree_listing(&body, &settings.subdir, &settings.extensions)
        }
        Ok((status, _)) => {
            warn!("tree listing returned status {status}");
            None
        }
        Err(err) => {
            warn!("tree listing fetch failed: {err}");
            None
        }
    }
}

/// Manifest first, repository tree listing as the fallback.
pub fn resolve_file_list<T: Transport>(
    http: &mut HttpClient<T>,
    settings: &UpdateSettings,
) -> Result<Vec<ManifestEntry>, UpdateError> {
    if let Some(files) = fetch_manifest(http, settings).filter(|files| !files.is_empty()) {
        info!(
            "using manifest file list {} count={}",
            settings.manifest_path,
            files.len()
        );
        return Ok(files);
    }

    let files = fetch_tree_listing(http, settings)
        .filter(|files| !files.is_empty())
        .ok_or(UpdateError::NoFileList)?;
    info!("using repository tree file list count={}", files.len());
    Ok(files)
}

/// Downloads every planned file below `root`, stopping at the first failure.
pub fn download_files<T: Transport, C: Clock>(
    http: &mut HttpClient<T>,
    clock: &mut C,
    settings: &UpdateSettings,
    files: &[ManifestEntry],
    root: &Path,
) -> Result<UpdateSummary, UpdateError> {
    let total = files.len();
    let mut updated = 0;

    for (index, entry) in files.iter().enumerate() {
        let remote = settings.raw_path(&entry.path);
        let dest: PathBuf = root.join(&entry.path);
        info!("[{} / {total}] GET {remote} -> {}", index + 1, entry.path);

        let request = Request::get(RAW_HOST, &remote).timeout(FILE_TIMEOUT);
        let sink = BodySink::File {
            dest: &dest,
            sha256: entry.sha256.as_deref(),
        };
        if let Err(err) = http.fetch(&request, sink) {
            warn!("update failed at {}: {err}", entry.path);
            return Err(UpdateError::DownloadFailed {
                updated,
                file: entry.path.clone(),
                error: err.short_code(),
            });
        }
        updated += 1;

        if index + 1 < total {
            clock.sleep(INTER_FILE_PAUSE);
        }
    }

    info!("update complete, files_updated={updated}");
    Ok(UpdateSummary {
        files_updated: updated,
    })
}

/// Runs one complete update against files rooted at `root`.
///
/// With `connect_wifi` the network is reset and re-established first and
/// the run aborts unless the internet is reachable. The caller decides
/// whether to reboot afterwards.
pub fn run_update<D, T, C, S>(
    manager: &mut ConnectionManager<D, T, C>,
    store: &S,
    root: &Path,
    connect_wifi: bool,
) -> Result<UpdateSummary, UpdateError>
where
    D: WifiDriver,
    T: Transport,
    C: Clock,
    S: ConfigStore,
{
    let mut config = store.load()?;
    config.sanitize();
    let settings = UpdateSettings::from_config(&config)?;

    if connect_wifi {
        manager.set_settings(config.wifi_settings());
        manager
            .reset()
            .map_err(|err| UpdateError::Wifi(err.to_string()))?;
        let outcome = manager
            .connect()
            .map_err(|err| UpdateError::Wifi(err.to_string()))?;
        if !outcome.is_usable() {
            return Err(UpdateError::NoInternet(outcome));
        }
    }

    info!(
        "update starting: repo={} branch={} subdir={}",
        settings.repo, settings.branch, settings.subdir
    );

    let (http, clock) = manager.http_and_clock();
    let files = plan_updates(resolve_file_list(http, &settings)?, &settings);
    download_files(http, clock, &settings, &files, root)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use sha2::{Digest, Sha256};

    use super::*;
    use crate::{
        http::hex_digest,
        testing::{FakeClock, MemoryStore, MockTransport, MockWifi, Reply},
    };

    fn paths(entries: &[ManifestEntry]) -> Vec<&str> {
        entries.iter().map(|entry| entry.path.as_str()).collect()
    }

    fn entries(paths: &[&str]) -> Vec<ManifestEntry> {
        paths.iter().copied().map(ManifestEntry::new).collect()
    }

    fn config() -> BoardConfig {
        BoardConfig {
            github_repo: Some("pilot/board".to_string()),
            ..BoardConfig::default()
        }
    }

    fn manager(
        transport: MockTransport,
    ) -> ConnectionManager<MockWifi, MockTransport, FakeClock> {
        ConnectionManager::new(
            MockWifi::new(),
            HttpClient::new(transport),
            FakeClock::new(),
            config().wifi_settings(),
        )
    }

    #[test]
    fn repo_ids_accept_urls_and_reject_garbage() {
        let expected = RepoId {
            owner: "pilot".to_string(),
            name: "board".to_string(),
        };
        assert_eq!(parse_repo_id("pilot/board"), Some(expected.clone()));
        assert_eq!(
            parse_repo_id(" https://github.com/pilot/board.git/ "),
            Some(expected)
        );
        assert_eq!(
            parse_repo_id("https://github.com/pilot/board/"),
            Some(RepoId {
                owner: "pilot".to_string(),
                name: "board".to_string(),
            })
        );
        assert_eq!(parse_repo_id("board"), None);
        assert_eq!(parse_repo_id("pilot/"), None);
        assert_eq!(parse_repo_id("a/b/c"), None);
    }

    #[test]
    fn manifest_accepts_list_object_and_digests() {
        let list = parse_manifest(br#"["a.py", "lib/b.py"]"#).unwrap();
        assert_eq!(paths(&list), ["a.py", "lib/b.py"]);

        let object = parse_manifest(
            br#"{"version": 3, "files": ["a.py", {"path": "main.py", "sha256": "ab12"}]}"#,
        )
        .unwrap();
        assert_eq!(paths(&object), ["a.py", "main.py"]);
        assert_eq!(object[1].sha256.as_deref(), Some("ab12"));

        assert_eq!(parse_manifest(br#"{"version": 3}"#), None);
        assert_eq!(parse_manifest(b"<html>"), None);
    }

    #[test]
    fn tree_listing_keeps_blobs_under_subdir_with_allowed_extensions() {
        let body = br#"{"tree": [
            {"path": "fw", "type": "tree"},
            {"path": "fw/main.py", "type": "blob"},
            {"path": "fw/utils/wifi.py", "type": "blob"},
            {"path": "fw/README.md", "type": "blob"},
            {"path": "docs/index.py", "type": "blob"}
        ]}"#;
        let exts = vec![".py".to_string(), ".json".to_string()];

        let files = parse_tree_listing(body, "/fw/", &exts).unwrap();
        assert_eq!(paths(&files), ["main.py", "utils/wifi.py"]);

        let all = parse_tree_listing(body, "", &[]).unwrap();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn normalize_strips_slashes_drops_traversal_and_dedupes() {
        let files = normalize_entries(entries(&[
            "/a.py", "a.py", "../etc/passwd", "", "lib/", "lib/x.py",
        ]));
        assert_eq!(paths(&files), ["a.py", "lib/x.py"]);
    }

    #[test]
    fn updater_goes_second_to_last_and_entry_point_last() {
        let ordered = order_for_update(
            entries(&["a.py", "updates.py", "main.py", "b.json"]),
            "updates.py",
            "main.py",
        );
        assert_eq!(paths(&ordered), ["a.py", "b.json", "updates.py", "main.py"]);
    }

    #[test]
    fn plan_filters_preserved_files() {
        let settings = UpdateSettings::from_config(&config()).unwrap();
        let planned = plan_updates(
            entries(&["main.py", "/config.json", "a.py"]),
            &settings,
        );
        assert_eq!(paths(&planned), ["a.py", "main.py"]);
    }

    #[test]
    fn missing_and_malformed_repo_are_config_errors() {
        let err = UpdateSettings::from_config(&BoardConfig::default()).unwrap_err();
        assert_eq!(err.reason(), "missing_config");

        let bad = BoardConfig {
            github_repo: Some("not-a-repo".to_string()),
            ..BoardConfig::default()
        };
        let err = UpdateSettings::from_config(&bad).unwrap_err();
        assert_eq!(err.reason(), "bad_config");
    }

    #[test]
    fn manifest_run_updates_files_and_never_touches_preserved_ones() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("config.json"), b"{\"local\":true}").unwrap();

        let transport = MockTransport::new()
            .route(
                "/pilot/board/main/update_manifest.json",
                Reply::ok(br#"{"files": ["main.py", "config.json", "lib/util.py"]}"#),
            )
            .route("/pilot/board/main/main.py", Reply::ok(b"print('main')"))
            .route("/pilot/board/main/lib/util.py", Reply::ok(b"X = 1"))
            .route("/pilot/board/main/config.json", Reply::ok(b"{}"));
        let stats = transport.stats();
        let mut mgr = manager(transport);
        let store = MemoryStore::new(config());

        let summary = run_update(&mut mgr, &store, root.path(), false).unwrap();

        assert_eq!(summary.files_updated, 2);
        assert_eq!(
            stats.paths(),
            [
                "/pilot/board/main/update_manifest.json",
                "/pilot/board/main/lib/util.py",
                "/pilot/board/main/main.py",
            ]
        );
        assert_eq!(
            std::fs::read(root.path().join("config.json")).unwrap(),
            b"{\"local\":true}"
        );
        assert_eq!(
            std::fs::read(root.path().join("lib/util.py")).unwrap(),
            b"X = 1"
        );
        assert_eq!(stats.opened(), stats.dropped());
    }

    #[test]
    fn third_of_five_failing_stops_the_run() {
        let root = tempfile::tempdir().unwrap();
        let transport = MockTransport::new()
            .route(
                "/pilot/board/main/update_manifest.json",
                Reply::ok(br#"["a.py", "b.py", "c.py", "d.py", "e.py"]"#),
            )
            .route("/pilot/board/main/a.py", Reply::ok(b"a"))
            .route("/pilot/board/main/b.py", Reply::ok(b"b"))
            .route("/pilot/board/main/d.py", Reply::ok(b"d"))
            .route("/pilot/board/main/e.py", Reply::ok(b"e"));
        let stats = transport.stats();
        let mut mgr = manager(transport);

        let result = run_update(&mut mgr, &MemoryStore::new(config()), root.path(), false);

        let report = UpdateResult::from(&result);
        assert_eq!(
            report,
            UpdateResult {
                succeeded: false,
                files_updated: 2,
                reason: Some("download_failed"),
                failure: Some(FailedFile {
                    file: "c.py".to_string(),
                    error: "http_404".to_string(),
                }),
            }
        );
        // manifest + a, b, c; d and e never requested
        assert_eq!(stats.opened(), 4);
        assert!(!root.path().join("d.py").exists());
    }

    #[test]
    fn falls_back_to_tree_listing_when_manifest_missing() {
        let root = tempfile::tempdir().unwrap();
        let config = BoardConfig {
            github_subdir: "fw".to_string(),
            ..config()
        };
        let transport = MockTransport::new()
            .route(
                "/repos/pilot/board/git/trees/main?recursive=1",
                Reply::ok(br#"{"tree": [
                    {"path": "fw/main.py", "type": "blob"},
                    {"path": "fw/notes.txt", "type": "blob"},
                    {"path": "fw/updates.py", "type": "blob"}
                ]}"#),
            )
            .route("/pilot/board/main/fw/main.py", Reply::ok(b"m"))
            .route("/pilot/board/main/fw/updates.py", Reply::ok(b"u"));
        let stats = transport.stats();
        let mut mgr = manager(transport);

        let summary = run_update(&mut mgr, &MemoryStore::new(config), root.path(), false).unwrap();

        assert_eq!(summary.files_updated, 2);
        let requests = stats.requests();
        assert!(requests[1].contains("Host: api.github.com\r\n"));
        assert!(requests[1].contains("Accept: application/vnd.github+json\r\n"));
        assert_eq!(
            &stats.paths()[2..],
            ["/pilot/board/main/fw/updates.py", "/pilot/board/main/fw/main.py"]
        );
    }

    #[test]
    fn no_manifest_and_no_tree_is_no_file_list() {
        let root = tempfile::tempdir().unwrap();
        let mut mgr = manager(MockTransport::new());

        let err = run_update(&mut mgr, &MemoryStore::new(config()), root.path(), false).unwrap_err();
        assert_eq!(err.reason(), "no_file_list");
    }

    #[test]
    fn manifest_digest_is_enforced() {
        let root = tempfile::tempdir().unwrap();
        let good = hex_digest(&Sha256::digest(b"good"));
        let manifest = format!(
            r#"{{"files": [{{"path": "a.py", "sha256": "{good}"}}, {{"path": "b.py", "sha256": "{good}"}}]}}"#
        );
        let transport = MockTransport::new()
            .route(
                "/pilot/board/main/update_manifest.json",
                Reply::ok(manifest.as_bytes()),
            )
            .route("/pilot/board/main/a.py", Reply::ok(b"good"))
            .route("/pilot/board/main/b.py", Reply::ok(b"evil"));
        let mut mgr = manager(transport);

        let err = run_update(&mut mgr, &MemoryStore::new(config()), root.path(), false).unwrap_err();

        match err {
            UpdateError::DownloadFailed { updated, file, .. } => {
                assert_eq!(updated, 1);
                assert_eq!(file, "b.py");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!root.path().join("b.py").exists());
    }

    #[test]
    fn unreachable_network_aborts_before_any_download() {
        let root = tempfile::tempdir().unwrap();
        let transport = MockTransport::new().route(
            "/pilot/board/main/update_manifest.json",
            Reply::ok(br#"["a.py"]"#),
        );
        let stats = transport.stats();
        let mut mgr = manager(transport);

        // no ssid configured
        let err = run_update(&mut mgr, &MemoryStore::new(config()), root.path(), true).unwrap_err();

        assert_eq!(err.reason(), "no_internet");
        assert_eq!(err.display_message(), "No WiFi Set");
        assert_eq!(stats.opened(), 0);
    }
}
