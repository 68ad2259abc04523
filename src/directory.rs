use std::path::{Path, PathBuf};
use std::sync::Arc;

use color_eyre::eyre::WrapErr;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// One username/password pair from the backing file.
///
/// Matched by plain equality against what the client sends; the directory
/// enforces no uniqueness beyond the file's own content.
#[derive(Debug, Clone, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

/// Maps a client-supplied logical domain name to an upstream base URL.
/// `from` is an opaque identifier, not a DNS name.
#[derive(Debug, Clone, Deserialize)]
pub struct DomainMapping {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Default, Deserialize)]
struct DirectoryState {
    #[serde(default)]
    user_credentials: Vec<Credential>,
    #[serde(default)]
    domain_mappings: Vec<DomainMapping>,
}

/// Credential and domain-mapping directory, replaced wholesale when the
/// backing file changes.
///
/// Readers never observe a half-replaced directory: a reload parses the
/// whole file first and swaps the state under a single write lock. Both
/// front-ends authenticate against the same instance.
#[derive(Debug)]
pub struct Directory {
    path: PathBuf,
    state: RwLock<DirectoryState>,
}

impl Directory {
    /// Load the directory from `path`. An unreadable or unparsable file at
    /// startup is fatal; later reload failures are not.
    pub async fn load(path: impl Into<PathBuf>) -> color_eyre::Result<Arc<Self>> {
        let path = path.into();
        let state = Self::parse_file(&path)
            .await
            .wrap_err_with(|| format!("failed to load config from {}", path.display()))?;
        info!(
            "configuration loaded: {} credential(s), {} domain mapping(s)",
            state.user_credentials.len(),
            state.domain_mappings.len()
        );
        Ok(Arc::new(Self {
            path,
            state: RwLock::new(state),
        }))
    }

    async fn parse_file(path: &Path) -> color_eyre::Result<DirectoryState> {
        let data = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Plain-text credential check against the current directory contents.
    pub async fn authenticate_user(&self, username: &str, password: &str) -> bool {
        self.state
            .read()
            .await
            .user_credentials
            .iter()
            .any(|cred| cred.username == username && cred.password == password)
    }

    /// Resolve a logical domain name to its target base URL. Lookup is
    /// first match over the file's ordered mapping list.
    pub async fn resolve_domain(&self, name: &str) -> Option<String> {
        self.state
            .read()
            .await
            .domain_mappings
            .iter()
            .find(|mapping| mapping.from == name)
            .map(|mapping| mapping.to.clone())
    }

    /// Re-read the backing file and swap the directory state. On a read or
    /// parse error the previous state stays in effect.
    pub async fn reload(&self) -> color_eyre::Result<()> {
        let fresh = Self::parse_file(&self.path).await?;
        let mut state = self.state.write().await;
        *state = fresh;
        info!(
            "configuration reloaded: {} credential(s), {} domain mapping(s)",
            state.user_credentials.len(),
            state.domain_mappings.len()
        );
        Ok(())
    }

    /// Watch the backing file's directory and reload on change. The watcher
    /// task runs for the lifetime of the process.
    pub fn spawn_watcher(self: &Arc<Self>) -> color_eyre::Result<()> {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<notify::Result<Event>>(16);
        let mut watcher = RecommendedWatcher::new(
            // notify delivers on its own thread; block rather than drop.
            move |event| {
                let _ = tx.blocking_send(event);
            },
            notify::Config::default(),
        )?;
        let watch_dir = match self.path.parent() {
            Some(parent) if parent != Path::new("") => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

        let directory = Arc::clone(self);
        tokio::spawn(async move {
            // Moved in so the watcher lives as long as the task.
            let _watcher = watcher;
            while let Some(event) = rx.recv().await {
                match event {
                    Ok(event) if is_config_change(&event, &directory.path) => {
                        info!("config file changed, reloading...");
                        if let Err(err) = directory.reload().await {
                            warn!("failed to reload config: {err:#}");
                        }
                    }
                    Ok(_) => {}
                    Err(err) => warn!("config watcher error: {err}"),
                }
            }
        });
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn from_parts(
        credentials: Vec<Credential>,
        mappings: Vec<DomainMapping>,
    ) -> Arc<Self> {
        Arc::new(Self {
            path: PathBuf::new(),
            state: RwLock::new(DirectoryState {
                user_credentials: credentials,
                domain_mappings: mappings,
            }),
        })
    }
}

fn is_config_change(event: &Event, config_path: &Path) -> bool {
    matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
        && event
            .paths
            .iter()
            .any(|path| path.file_name() == config_path.file_name())
}
