//! Input checks applied before anything reaches a subprocess.
//!
//! Unsafe input is rejected, never rewritten: a caller either gets back the
//! exact value it supplied or an error describing why it was refused.

use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Characters that carry meaning to a shell. Commands never go through one,
/// but arguments containing them are still refused.
pub const SHELL_METACHARACTERS: [char; 11] =
    [';', '&', '|', '`', '$', '<', '>', '(', ')', '\n', '\r'];

static DOMAIN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?)*$",
    )
    .expect("domain regex should compile")
});

static URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.\-]*://[^\s/?#@]+(:[0-9]{1,5})?([/?#]\S*)?$")
        .expect("url regex should compile")
});

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("tool '{0}' is not allowed")]
    ToolNotAllowed(String),

    #[error("tool '{0}' is not in the tool catalog")]
    UnknownTool(String),

    #[error("target is empty")]
    EmptyTarget,

    #[error("invalid target '{0}': expected an IP address, CIDR range, domain name or URL")]
    InvalidTarget(String),

    #[error("{field} contains shell metacharacters: {value}")]
    ShellMetacharacters { field: &'static str, value: String },

    #[error("options could not be split into arguments (unbalanced quotes): {0}")]
    UnbalancedQuotes(String),

    #[error("path {} is outside the output directory", .0.display())]
    PathOutsideOutputDir(PathBuf),
}

pub fn contains_shell_metacharacters(value: &str) -> bool {
    value.contains(SHELL_METACHARACTERS)
}

fn reject_metacharacters(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if contains_shell_metacharacters(value) {
        return Err(ValidationError::ShellMetacharacters {
            field,
            value: value.to_owned(),
        });
    }
    Ok(())
}

/// Accept an IP address, a CIDR range, a domain name or a URL.
///
/// Returns the trimmed target.
pub fn validate_target(target: &str) -> Result<&str, ValidationError> {
    let target = target.trim();
    if target.is_empty() {
        return Err(ValidationError::EmptyTarget);
    }
    reject_metacharacters("target", target)?;

    if is_ip_or_cidr(target) || DOMAIN_REGEX.is_match(target) || URL_REGEX.is_match(target) {
        Ok(target)
    } else {
        Err(ValidationError::InvalidTarget(target.to_owned()))
    }
}

/// Free-text search input for tools such as searchsploit.
pub fn validate_query(query: &str) -> Result<&str, ValidationError> {
    let query = query.trim();
    if query.is_empty() {
        return Err(ValidationError::EmptyTarget);
    }
    reject_metacharacters("query", query)?;
    if query.chars().any(char::is_control) {
        return Err(ValidationError::InvalidTarget(query.to_owned()));
    }
    Ok(query)
}

fn is_ip_or_cidr(value: &str) -> bool {
    match value.split_once('/') {
        None => value.parse::<IpAddr>().is_ok(),
        Some((addr, prefix)) => {
            let Ok(addr) = addr.parse::<IpAddr>() else {
                return false;
            };
            let max = if addr.is_ipv4() { 32 } else { 128 };
            prefix.parse::<u8>().is_ok_and(|p| p <= max)
        }
    }
}

/// Split an option string into argument tokens, refusing shell syntax.
pub fn split_options(options: &str) -> Result<Vec<String>, ValidationError> {
    reject_metacharacters("options", options)?;
    shlex::split(options).ok_or_else(|| ValidationError::UnbalancedQuotes(options.to_owned()))
}

/// Every element of a resolved argument vector must be free of metacharacters.
pub fn check_argv(argv: &[String]) -> Result<(), ValidationError> {
    argv.iter()
        .try_for_each(|arg| reject_metacharacters("command argument", arg))
}

/// Lexical containment check: `path` must not climb with `..` and must sit
/// under `base` once both are made absolute.
pub fn ensure_within(path: &Path, base: &Path) -> Result<(), ValidationError> {
    let outside = || ValidationError::PathOutsideOutputDir(path.to_path_buf());
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(outside());
    }
    let path_abs = std::path::absolute(path).map_err(|_| outside())?;
    let base_abs = std::path::absolute(base).map_err(|_| outside())?;
    if path_abs.starts_with(&base_abs) && path_abs != base_abs {
        Ok(())
    } else {
        Err(outside())
    }
}

/// Containment check after symlinks are resolved. The parent directory of
/// `path` and `base` must both exist.
pub fn ensure_within_resolved(path: &Path, base: &Path) -> Result<(), ValidationError> {
    let outside = || ValidationError::PathOutsideOutputDir(path.to_path_buf());
    ensure_within(path, base)?;
    let parent = path.parent().ok_or_else(outside)?;
    let parent = parent.canonicalize().map_err(|_| outside())?;
    let base = base.canonicalize().map_err(|_| outside())?;
    if parent.starts_with(&base) {
        Ok(())
    } else {
        Err(outside())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn accepts_common_target_shapes() {
        for target in [
            "10.0.0.1",
            "192.168.0.0/24",
            "::1",
            "fe80::/10",
            "scanme.example.com",
            "localhost",
            "https://example.com:8443/login?next=/",
            "  10.0.0.2  ",
        ] {
            assert!(validate_target(target).is_ok(), "{target} should be accepted");
        }
        assert_eq!(validate_target("  10.0.0.2 ").unwrap(), "10.0.0.2");
    }

    #[test]
    fn rejects_malformed_targets() {
        assert_eq!(validate_target("   "), Err(ValidationError::EmptyTarget));
        for target in ["bad..target", "10.0.0.0/33", "-oX", "exa mple.com", "http://"] {
            assert!(
                matches!(validate_target(target), Err(ValidationError::InvalidTarget(_))),
                "{target} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_injection_attempts() {
        for value in ["1.1.1.1; rm -rf /", "a.com && id", "`id`", "$(id)", "x | nc", "a\nb"] {
            assert!(matches!(
                validate_target(value),
                Err(ValidationError::ShellMetacharacters { .. })
            ));
            assert!(split_options(value).is_err());
        }
    }

    #[test]
    fn options_split_like_a_shell_without_running_one() {
        assert_eq!(
            split_options(r#"-sV -p 1-1000 --script "http-title,ssl-cert""#).unwrap(),
            vec!["-sV", "-p", "1-1000", "--script", "http-title,ssl-cert"]
        );
        assert!(split_options("").unwrap().is_empty());
        assert!(matches!(
            split_options("--data 'unterminated"),
            Err(ValidationError::UnbalancedQuotes(_))
        ));
    }

    #[test]
    fn queries_allow_spaces_but_not_shell_syntax() {
        assert_eq!(validate_query(" apache 2.4 ").unwrap(), "apache 2.4");
        assert!(validate_query("apache; id").is_err());
    }

    #[test]
    fn paths_must_stay_inside_base() {
        let base = Path::new("/srv/scanbay/output");
        assert!(ensure_within(&base.join("nmap_adhoc.txt"), base).is_ok());
        assert!(ensure_within(&base.join("../escape.txt"), base).is_err());
        assert!(ensure_within(Path::new("/etc/passwd"), base).is_err());
        assert!(ensure_within(base, base).is_err());
    }

    #[test]
    fn resolved_check_follows_the_real_directory() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("output");
        std::fs::create_dir_all(&base).unwrap();
        assert!(ensure_within_resolved(&base.join("a.txt"), &base).is_ok());
        assert!(ensure_within_resolved(&base.join("missing/a.txt"), &base).is_err());
    }
}
