// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/maestro/config.yaml"));
    paths.push(PathBuf::from("/etc/maestro/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/maestro/config.yaml"));
        paths.push(home.join(".config/maestro/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("maestro/config.yaml"));
        paths.push(cfg.join("maestro/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".maestro/config.yaml"));
    paths.push(PathBuf::from(".maestro/config.yml"));
    paths.push(PathBuf::from("maestro.yaml"));
    paths.push(PathBuf::from("maestro.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files, then applying
/// environment overrides.  `extra` may provide an explicit path (`--config`).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let mut config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty())
    {
        Config::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Apply the environment variables recognised by deployments on top of the
/// file-derived config.  Environment always wins over files.
pub fn apply_env_overrides(config: &mut Config) {
    let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

    if let Some(v) = var("DEFAULT_CHAT_MODEL") {
        config.pipeline.default_chat_model = Some(v);
    }
    if let Some(v) = var("VISION_CAPABLE_MODELS") {
        config.pipeline.vision_capable_models = v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Some(v) = var("ROUTE_SIMPLE_TO_OLLAMA") {
        config.pipeline.route_simple_to_ollama = parse_bool(&v);
    }
    if let Some(v) = var("TOOL_LIMIT").and_then(|v| v.parse().ok()) {
        config.pipeline.tool_limit = v;
    }
    if let Some(v) = var("MAX_TOOL_ROUNDS").and_then(|v| v.parse().ok()) {
        config.pipeline.max_tool_rounds = v;
    }
    if let Some(v) = var("TOOL_PROXY_URL") {
        config.tools.proxy_url = Some(v);
    }
    if let Some(v) = var("API_INTERNAL_KEY") {
        config.tools.api_internal_key = Some(v);
    }
    if let Some(v) = var("TOOL_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        config.tools.tool_timeout_ms = v;
    }
    if let Some(v) = var("SEMANTIC_CACHE_SIMILARITY_MIN").and_then(|v| v.parse().ok()) {
        config.cache.semantic_similarity_min = v;
    }
    if let Some(v) = var("RAG_MIN_RELEVANCE").and_then(|v| v.parse().ok()) {
        config.rag.min_relevance_score = v;
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes" | "on")
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = val("x: 1");
        let src = val("x: 2");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["x"].as_i64(), Some(2));
    }

    #[test]
    fn merge_preserves_keys_not_in_src() {
        let mut dst = val("a: 1\nb: 2");
        let src = val("b: 99");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["a"].as_i64(), Some(1));
        assert_eq!(dst["b"].as_i64(), Some(99));
    }

    #[test]
    fn merge_nested_tables() {
        let mut dst = val("pipeline:\n  default_chat_model: gpt-4o\n  tool_limit: 127");
        let src = val("pipeline:\n  tool_limit: 64");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["pipeline"]["default_chat_model"].as_str(), Some("gpt-4o"));
        assert_eq!(dst["pipeline"]["tool_limit"].as_i64(), Some(64));
    }

    #[test]
    fn load_returns_error_when_explicit_path_missing() {
        let result = load(Some(Path::new("/tmp/maestro_nonexistent_config_xyz.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_explicit_file_overrides_defaults() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "pipeline:\n  default_chat_model: claude-sonnet").unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(
            cfg.pipeline.default_chat_model.as_deref(),
            Some("claude-sonnet")
        );
    }

    #[test]
    fn env_override_vision_models_splits_csv() {
        let mut cfg = Config::default();
        std::env::set_var("VISION_CAPABLE_MODELS", "gpt-4o, gemini-2.5-pro ,");
        apply_env_overrides(&mut cfg);
        std::env::remove_var("VISION_CAPABLE_MODELS");
        assert_eq!(
            cfg.pipeline.vision_capable_models,
            vec!["gpt-4o".to_string(), "gemini-2.5-pro".to_string()]
        );
    }

    #[test]
    fn env_override_numeric_keys() {
        let mut cfg = Config::default();
        std::env::set_var("MAX_TOOL_ROUNDS", "12");
        std::env::set_var("SEMANTIC_CACHE_SIMILARITY_MIN", "0.95");
        apply_env_overrides(&mut cfg);
        std::env::remove_var("MAX_TOOL_ROUNDS");
        std::env::remove_var("SEMANTIC_CACHE_SIMILARITY_MIN");
        assert_eq!(cfg.pipeline.max_tool_rounds, 12);
        assert!((cfg.cache.semantic_similarity_min - 0.95).abs() < f32::EPSILON);
    }

    #[test]
    fn parse_bool_accepts_common_forms() {
        assert!(parse_bool("1"));
        assert!(parse_bool("true"));
        assert!(parse_bool("on"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("off"));
    }
}
