//! Configuration loader and path helpers.
//!
//! Uses Figment to merge `config.toml` + `config.<env>.toml` + `GENTAB_*`
//! env vars. Provides helpers to expand `~` and `${VAR}` and to resolve
//! relative paths against a known base directory.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

pub struct Config {
    figment: Figment,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());

        let mut figment = Figment::new().merge(Toml::file("config.toml"));
        match env_name.as_str() {
            "dev" | "development" => figment = figment.merge(Toml::file("config.dev.toml")),
            "prod" | "production" => figment = figment.merge(Toml::file("config.prod.toml")),
            "test" | "testing" => figment = figment.merge(Toml::file("config.test.toml")),
            _ => {}
        }
        figment = figment.merge(Env::prefixed("GENTAB_").split("__"));

        Ok(Self { figment })
    }

    pub fn get<T>(&self, key: &str) -> anyhow::Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| anyhow::anyhow!("Failed to get '{}': {}", key, e))
    }

    /// Engine tunables from the `[engine]` table, falling back to defaults
    /// for anything unset.
    pub fn engine(&self) -> EngineTuning {
        self.figment
            .extract_inner("engine")
            .unwrap_or_else(|_| EngineTuning::default())
    }
}

/// Tunables for retrieval and generation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineTuning {
    /// LanceDB database URI.
    pub db_uri: String,
    /// Root directory for per-table tantivy indexes.
    pub index_dir: String,
    /// RRF rank constant: contribution is `1 / (rank_constant + rank)`.
    pub rank_constant: f32,
    /// Each source list is capped at `top_k * fusion_overfetch` candidates.
    pub fusion_overfetch: usize,
    /// ANN refine factor. Kept low for speed; RRF compensates for rank
    /// noise.
    pub refine_factor: u32,
    /// Bounded attempts for queries against a transiently-unavailable
    /// index.
    pub retry_attempts: usize,
    pub retry_base_ms: u64,
    /// Maximum turns of reconstructed history for multi-turn columns.
    pub chat_window: usize,
    /// Token budget for LLM-rewritten search queries, separate from the
    /// main completion budget.
    pub query_rewrite_max_tokens: u32,
    /// Exclusive schema-mutation window length in milliseconds.
    pub lock_window_ms: i64,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            db_uri: "./data/db".to_string(),
            index_dir: "./data/indexes".to_string(),
            rank_constant: 60.0,
            fusion_overfetch: 4,
            refine_factor: 2,
            retry_attempts: 3,
            retry_base_ms: 100,
            chat_window: 16,
            query_rewrite_max_tokens: 128,
            lock_window_ms: 30_000,
        }
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}

/// Resolve a possibly relative path against a given base directory after
/// expansion. If `p` is absolute, it's returned as-is.
pub fn resolve_with_base<S: AsRef<str>>(base: &Path, p: S) -> PathBuf {
    let p = expand_path(p);
    if p.is_absolute() {
        p
    } else {
        base.join(p)
    }
}
