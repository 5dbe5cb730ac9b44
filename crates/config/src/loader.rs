use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::schema::RoostConfig;

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["roost.toml", "roost.yaml", "roost.yml", "roost.json"];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<RoostConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = expand_env(&raw);
    let mut config = parse_config(&raw, path)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `$ROOST_CONFIG` (explicit path)
/// 2. `./roost.{toml,yaml,yml,json}` (project-local)
///
/// Returns `RoostConfig::default()` (plus env overrides) if no file is found.
pub fn discover_and_load() -> RoostConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    let mut config = RoostConfig::default();
    apply_env_overrides(&mut config);
    config
}

fn find_config_file() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var("ROOST_CONFIG") {
        let p = PathBuf::from(explicit);
        if p.exists() {
            return Some(p);
        }
        warn!(path = %p.display(), "ROOST_CONFIG points at a missing file");
    }

    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    None
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<RoostConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

/// `ROOST_*` environment variables override file values. Unparseable values
/// are logged and skipped.
fn apply_env_overrides(config: &mut RoostConfig) {
    if let Ok(bind) = std::env::var("ROOST_BIND") {
        config.server.bind = bind;
    }
    override_parsed("ROOST_PORT", &mut config.server.port);
    if let Ok(url) = std::env::var("ROOST_BUS_URL") {
        config.bus.url = url;
    }
    override_parsed("ROOST_BUS_STRICT", &mut config.bus.strict);
    override_parsed(
        "ROOST_INACTIVITY_TIMEOUT_SECS",
        &mut config.cleanup.inactivity_timeout_secs,
    );
    override_parsed(
        "ROOST_CLEANUP_INTERVAL_SECS",
        &mut config.cleanup.cleanup_interval_secs,
    );
    override_parsed(
        "ROOST_HEARTBEAT_INTERVAL_SECS",
        &mut config.cleanup.heartbeat_interval_secs,
    );
    override_parsed("ROOST_MAX_FRAME_BYTES", &mut config.session.max_frame_bytes);
    override_parsed(
        "ROOST_MESSAGE_RATE_LIMIT",
        &mut config.rate_limit.message_limit,
    );
}

fn override_parsed<T: std::str::FromStr>(name: &str, slot: &mut T) {
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *slot = value,
        Err(_) => warn!(var = name, value = %raw, "ignoring unparseable override"),
    }
}

// ── Placeholder expansion ────────────────────────────────────────────────────

/// Expand `${VAR}` placeholders in the raw config text against the process
/// environment. Unset variables and empty names stay as written; a
/// placeholder that never closes leaves the remainder untouched.
fn expand_env(raw: &str) -> String {
    expand_with(raw, |name| std::env::var(name).ok())
}

fn expand_with(raw: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let Some(end) = tail.find('}') else {
            // Unterminated: nothing after this point can be a placeholder.
            out.push_str(&rest[start..]);
            return out;
        };
        let name = &tail[..end];
        match lookup(name) {
            Some(value) if !name.is_empty() => out.push_str(&value),
            _ => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &tail[end + 1..];
    }

    out.push_str(rest);
    out
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn load_toml_config() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "[server]\nport = 9001\n\n[rate_limit]\nmessage_limit = 3\n"
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.rate_limit.message_limit, 3);
        // Untouched sections keep their defaults.
        assert_eq!(config.cleanup.cleanup_interval_secs, 60);
    }

    #[test]
    fn load_yaml_config() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(file, "bus:\n  url: redis://bus:6379\n  strict: true\n").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.bus.url, "redis://bus:6379");
        assert!(config.bus.strict);
    }

    #[test]
    fn expansion_resolves_known_placeholders() {
        let lookup = |name: &str| match name {
            "BUS_HOST" => Some("bus.internal".to_string()),
            "BUS_PORT" => Some("6380".to_string()),
            _ => None,
        };
        assert_eq!(
            expand_with("url = \"redis://${BUS_HOST}:${BUS_PORT}\"", lookup),
            "url = \"redis://bus.internal:6380\""
        );
    }

    #[test]
    fn expansion_keeps_unknown_and_empty_placeholders() {
        let lookup = |_: &str| None;
        assert_eq!(expand_with("${NOT_SET}", lookup), "${NOT_SET}");
        assert_eq!(expand_with("a ${} b", lookup), "a ${} b");
        assert_eq!(expand_with("no placeholders", lookup), "no placeholders");
    }

    #[test]
    fn expansion_stops_at_unterminated_placeholder() {
        let lookup = |name: &str| (name == "SET").then(|| "v".to_string());
        assert_eq!(expand_with("${SET} then ${broken", lookup), "v then ${broken");
    }

    #[test]
    fn defaults_match_protocol_constants() {
        let config = RoostConfig::default();
        assert_eq!(config.session.pong_wait_secs, 60);
        assert_eq!(config.session.outbound_capacity, 256);
        assert_eq!(config.rate_limit.message_limit, 10);
        assert_eq!(config.rate_limit.message_window_secs, 60);
        assert_eq!(config.session.ping_period().as_secs(), 54);
    }
}
