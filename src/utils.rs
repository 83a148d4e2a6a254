use regex::{Captures, Regex};
use resolve_path::PathResolveExt;
use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};

pub fn get_tqdm_style() -> indicatif::ProgressStyle {
    indicatif::ProgressStyle::with_template(
        "{percent:>3}% |{wide_bar}| {pos}/{len} [{elapsed_precise}<{eta_precise}, {msg}]",
    )
    .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
    .progress_chars("██ ")
}

/// Run tag used for output roots and file prefixes, e.g. 20251002T020050Z
pub fn now_utc_tag() -> String {
    chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("valid env var pattern")
});

// expand {timestamp} and $VAR/${VAR}, unknown variables are left untouched
pub fn expand_string(s: &str, timestamp: &str) -> String {
    expand_with(s, timestamp, |name| std::env::var(name).ok())
}

/// Same as [`expand_string`], with variables looked up through `lookup`
pub fn expand_with<F>(s: &str, timestamp: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let s = s.replace("{timestamp}", timestamp);
    ENV_VAR
        .replace_all(&s, |caps: &Captures<'_>| {
            let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
            lookup(name).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Expand a configured path: placeholders, environment and leading `~`
pub fn expand_path<P: AsRef<Path>>(path: P, timestamp: &str) -> std::io::Result<PathBuf> {
    let expanded = PathBuf::from(expand_string(&path.as_ref().to_string_lossy(), timestamp));
    Ok(expanded.try_resolve()?.into_owned())
}

/// File name of a path as an owned string, empty if there is none
pub fn file_name_string<P: AsRef<Path>>(path: P) -> String {
    path.as_ref()
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_with() {
        let lookup = |name: &str| (name == "SCRATCH").then(|| "/scratch".to_string());
        assert_eq!(
            expand_with("${SCRATCH}/run_{timestamp}", "20250101T000000Z", lookup),
            "/scratch/run_20250101T000000Z"
        );
        assert_eq!(expand_with("$SCRATCH/x", "t", lookup), "/scratch/x");
        assert_eq!(expand_with("$UNSET_VAR/x", "t", lookup), "$UNSET_VAR/x");
    }

    #[test]
    fn test_expand_string_reads_environment() {
        // HOME is set for the whole test run and never modified
        let Ok(home) = std::env::var("HOME") else {
            return;
        };
        assert_eq!(expand_string("$HOME/x", "t"), format!("{}/x", home));
        assert_eq!(
            expand_string("$MEMTECH_SURELY_UNSET_VAR/x", "t"),
            "$MEMTECH_SURELY_UNSET_VAR/x"
        );
    }

    #[test]
    fn test_file_name_string() {
        assert_eq!(file_name_string("/a/b/mcf_r_base.x"), "mcf_r_base.x");
        assert_eq!(file_name_string("/"), "");
    }
}
