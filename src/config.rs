use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

const CONFIG_FILENAME: &str = "grove.toml";
const DEFAULT_NODES_DIR: &str = ".grove/nodes";
const DEFAULT_INDEX_DIR: &str = ".grove/index";

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GroveConfig {
    /// Project root (directory containing grove.toml). Not read from TOML.
    #[serde(skip)]
    pub root: PathBuf,

    pub name: String,
    pub nodes_dir: String,
    pub index_dir: String,
    pub server: ServerConfig,
    pub embeddings: EmbeddingsConfig,
    pub search: SearchConfig,
    pub review: ReviewConfig,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub vector_port: u16,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingsConfig {
    /// Provider-prefixed model string: `fastembed:<model>` (or a bare
    /// fastembed model name), `gemini:<model>`, `openai:<model>`.
    pub model: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SearchConfig {
    pub fts_weight: f64,
    pub vector_weight: f64,
    pub dual_match_bonus: f64,
    pub use_reranker: bool,
    pub reranker_model: String,
    /// Fraction of bullets touched since the last calibration that triggers
    /// a recalibration.
    pub auto_calibrate_threshold: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReviewConfig {
    /// Served-chars-per-bullet above which a node is flagged for review.
    pub budget_threshold: f64,
}

/// A `[[sources]]` entry: a directory of files indexed as `_doc-` nodes.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SourceConfig {
    pub name: String,
    pub path: String,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub use_git: bool,
    pub max_size_kb: u64,
}

impl Default for GroveConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            name: String::new(),
            nodes_dir: DEFAULT_NODES_DIR.into(),
            index_dir: DEFAULT_INDEX_DIR.into(),
            server: ServerConfig::default(),
            embeddings: EmbeddingsConfig::default(),
            search: SearchConfig::default(),
            review: ReviewConfig::default(),
            sources: Vec::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 7343,
            vector_port: 7344,
            log_level: "info".into(),
        }
    }
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            model: "fastembed:bge-small-en-v1.5".into(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            fts_weight: 0.5,
            vector_weight: 0.5,
            dual_match_bonus: 0.1,
            use_reranker: true,
            reranker_model: "jinaai/jina-reranker-v1-turbo-en".into(),
            auto_calibrate_threshold: 0.05,
        }
    }
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            budget_threshold: 3000.0,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            path: ".".into(),
            include: vec!["**/*.md".into(), "**/*.rs".into(), "**/*.toml".into()],
            exclude: vec![".grove/**".into(), "**/.git/**".into(), "**/target/**".into()],
            use_git: true,
            max_size_kb: 512,
        }
    }
}

impl GroveConfig {
    /// Load config by walking upward from `start` (or the cwd) for grove.toml.
    pub fn load(start: Option<&Path>) -> Result<Self> {
        let cwd = std::env::current_dir().context("cannot determine working directory")?;
        let root = find_root(start.unwrap_or(&cwd));
        Self::load_from_root(&root)
    }

    /// Load config from a known project root.
    pub fn load_from_root(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILENAME);
        let mut config: GroveConfig = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            info!("no {} at {}, using defaults", CONFIG_FILENAME, root.display());
            GroveConfig::default()
        };

        config.root = root.to_path_buf();
        if config.name.is_empty() {
            config.name = root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("GROVE_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("GROVE_EMBED_MODEL") {
            self.embeddings.model = val;
        }
    }

    /// Resolve a configured path: `~/` expands to the home directory,
    /// absolute paths stand alone, relative paths hang off the root.
    fn resolve(&self, path: &str) -> PathBuf {
        // join replaces the base entirely when the expanded path is absolute
        self.root.join(expand_tilde(path))
    }

    pub fn nodes_dir(&self) -> PathBuf {
        self.resolve(&self.nodes_dir)
    }

    pub fn index_dir(&self) -> PathBuf {
        self.resolve(&self.index_dir)
    }

    pub fn db_path(&self) -> PathBuf {
        self.index_dir().join("graph.db")
    }

    /// Status file written by the watcher, read by `grove status`.
    pub fn status_path(&self) -> PathBuf {
        self.index_dir().join("status.json")
    }

    /// Lock file guaranteeing a single derived-store writer.
    pub fn writer_lock_path(&self) -> PathBuf {
        self.index_dir().join("writer.lock")
    }

    /// Shared cross-project embedding cache: `~/.cache/grove/embeddings`.
    pub fn embedding_cache_dir(&self) -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| self.root.join(".grove/cache"))
            .join("grove")
            .join("embeddings")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(self.nodes_dir())?;
        std::fs::create_dir_all(self.index_dir())?;
        // Keep the derived index out of version control.
        let gitignore = self.root.join(".grove/.gitignore");
        if !gitignore.exists() {
            if let Some(parent) = gitignore.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&gitignore, "index/\n")?;
        }
        Ok(())
    }

    /// Resolve a source path relative to the project root.
    pub fn source_root(&self, source: &SourceConfig) -> PathBuf {
        self.resolve(&source.path)
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}

/// Write a default grove.toml at `root`. Fails if one already exists.
pub fn init_config(root: &Path, name: Option<&str>) -> Result<PathBuf> {
    let path = root.join(CONFIG_FILENAME);
    anyhow::ensure!(!path.exists(), "grove.toml already exists at {}", path.display());

    let project = name
        .map(str::to_owned)
        .or_else(|| root.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "project".into());

    let content = format!(
        r#"name = "{project}"
# nodes_dir = ".grove/nodes"   # default
# index_dir = ".grove/index"   # default — derived, keep out of git

# [embeddings]
# model = "fastembed:bge-small-en-v1.5"   # or gemini:<model>, openai:<model>

# [search]
# fts_weight = 0.5
# vector_weight = 0.5
# dual_match_bonus = 0.1
# use_reranker = true
# auto_calibrate_threshold = 0.05

# [review]
# budget_threshold = 3000

# [server]
# port = 7343
# vector_port = 7344

# Index plain files for keyword search (chunked into _doc- nodes):
# [[sources]]
# name = "docs"
# path = "docs"
# include = ["**/*.md"]
# exclude = ["**/drafts/**"]
"#
    );
    std::fs::write(&path, content)?;
    Ok(path)
}

/// Walk upward from `start` looking for grove.toml; falls back to `start`.
fn find_root(start: &Path) -> PathBuf {
    let mut dir = start.to_path_buf();
    loop {
        if dir.join(CONFIG_FILENAME).exists() {
            return dir;
        }
        if !dir.pop() {
            return start.to_path_buf();
        }
    }
}
