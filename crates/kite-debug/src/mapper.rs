use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use kite_vmservice::{LibraryRef, OutputStream, Script, ScriptRef, VmServiceClient};
use parking_lot::Mutex;
use url::Url;

/// A position in a local source file. Lines are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalPosition {
    pub file: PathBuf,
    pub line: u32,
    pub column: Option<u32>,
}

impl LocalPosition {
    pub fn new(file: impl Into<PathBuf>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column: None,
        }
    }
}

/// Translates between local files and the script URIs the runtime uses.
#[async_trait]
pub trait PositionMapper: Send + Sync {
    /// Every URI that currently resolves to `file`. A runtime may load the
    /// same file under several library URIs.
    fn uris_for_file(&self, file: &Path) -> BTreeSet<String>;

    async fn source_position(
        &self,
        client: &VmServiceClient,
        isolate_id: &str,
        script: &ScriptRef,
        token_pos: i64,
    ) -> Option<LocalPosition>;

    fn on_libraries_downloaded(&self, libraries: &[LibraryRef]);

    /// Drop anything cached for an isolate that exited.
    fn forget_isolate(&self, _isolate_id: &str) {}

    fn shutdown(&self);
}

/// Receives application output forwarded from the runtime.
pub trait OutputSink: Send + Sync {
    fn write(&self, stream: OutputStream, text: &str);
}

/// Maps files to `file://` URIs and, for configured package roots, to
/// `package:<name>/<path>` URIs.
#[derive(Default)]
pub struct FileUriMapper {
    packages: Vec<(String, PathBuf)>,
    libraries: Mutex<BTreeSet<String>>,
    scripts: Mutex<HashMap<(String, String), Script>>,
}

impl FileUriMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files under `lib_dir` are also reachable as `package:<name>/...`.
    pub fn with_package_root(mut self, name: impl Into<String>, lib_dir: impl Into<PathBuf>) -> Self {
        self.packages.push((name.into(), lib_dir.into()));
        self
    }

    pub fn known_libraries(&self) -> BTreeSet<String> {
        self.libraries.lock().clone()
    }

    /// Reverse of [`PositionMapper::uris_for_file`].
    pub fn file_for_uri(&self, uri: &str) -> Option<PathBuf> {
        if let Some(rest) = uri.strip_prefix("package:") {
            let (name, path) = rest.split_once('/')?;
            let (_, lib_dir) = self.packages.iter().find(|(pkg, _)| pkg == name)?;
            return Some(lib_dir.join(path));
        }
        Url::parse(uri).ok()?.to_file_path().ok()
    }

    async fn script(
        &self,
        client: &VmServiceClient,
        isolate_id: &str,
        script: &ScriptRef,
    ) -> Option<Script> {
        let key = (isolate_id.to_string(), script.id.clone());
        if let Some(cached) = self.scripts.lock().get(&key) {
            return Some(cached.clone());
        }

        match client.get_script(isolate_id, &script.id).await {
            Ok(loaded) => {
                self.scripts.lock().insert(key, loaded.clone());
                Some(loaded)
            }
            Err(err) => {
                tracing::debug!(
                    target: "kite.debug",
                    script = %script.uri,
                    error = %err,
                    "failed to load script"
                );
                None
            }
        }
    }
}

#[async_trait]
impl PositionMapper for FileUriMapper {
    fn uris_for_file(&self, file: &Path) -> BTreeSet<String> {
        let mut uris = BTreeSet::new();
        if let Ok(url) = Url::from_file_path(file) {
            uris.insert(url.to_string());
        }
        for (name, lib_dir) in &self.packages {
            let Ok(relative) = file.strip_prefix(lib_dir) else {
                continue;
            };
            let relative: Vec<_> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            uris.insert(format!("package:{name}/{}", relative.join("/")));
        }
        uris
    }

    async fn source_position(
        &self,
        client: &VmServiceClient,
        isolate_id: &str,
        script: &ScriptRef,
        token_pos: i64,
    ) -> Option<LocalPosition> {
        let file = self.file_for_uri(&script.uri)?;
        let loaded = self.script(client, isolate_id, script).await?;
        let (line, column) = loaded.line_column(token_pos)?;
        Some(LocalPosition {
            file,
            line,
            column: Some(column),
        })
    }

    fn on_libraries_downloaded(&self, libraries: &[LibraryRef]) {
        self.libraries
            .lock()
            .extend(libraries.iter().map(|lib| lib.uri.clone()));
    }

    fn forget_isolate(&self, isolate_id: &str) {
        self.scripts
            .lock()
            .retain(|(isolate, _), _| isolate != isolate_id);
    }

    fn shutdown(&self) {
        self.scripts.lock().clear();
        self.libraries.lock().clear();
    }
}
