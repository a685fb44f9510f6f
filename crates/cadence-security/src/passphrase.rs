//! Vault passphrase resolution.
//!
//! Unless a passphrase is configured explicitly, the vault is keyed to the
//! machine: a SHA-256 over stable host attributes. Anything that changes
//! one of those attributes invalidates stored sessions, which the vault
//! treats as an integrity failure and purges.

use directories::BaseDirs;
use ring::digest;
use std::fmt;

#[derive(Clone)]
pub enum PassphraseSource {
    Explicit(String),
    Machine,
}

impl PassphraseSource {
    pub fn from_config(passphrase: Option<&str>) -> Self {
        match passphrase {
            Some(p) if !p.is_empty() => PassphraseSource::Explicit(p.to_string()),
            _ => PassphraseSource::Machine,
        }
    }

    pub fn resolve(&self) -> String {
        match self {
            PassphraseSource::Explicit(p) => p.clone(),
            PassphraseSource::Machine => machine_passphrase(),
        }
    }
}

impl fmt::Debug for PassphraseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassphraseSource::Explicit(_) => f.write_str("Explicit([REDACTED])"),
            PassphraseSource::Machine => f.write_str("Machine"),
        }
    }
}

/// Deterministic per-machine, per-user passphrase (64 hex chars).
pub fn machine_passphrase() -> String {
    let fingerprint = machine_fingerprint();
    let hash = digest::digest(&digest::SHA256, fingerprint.as_bytes());
    hex::encode(hash.as_ref())
}

fn machine_fingerprint() -> String {
    let home = BaseDirs::new()
        .map(|dirs| dirs.home_dir().display().to_string())
        .unwrap_or_default();

    [
        std::env::consts::OS.to_string(),
        std::env::consts::ARCH.to_string(),
        std::env::consts::FAMILY.to_string(),
        hostname(),
        cpu_model(),
        username(),
        home,
    ]
    .join("|")
}

fn hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn cpu_model() -> String {
    std::fs::read_to_string("/proc/cpuinfo")
        .ok()
        .and_then(|info| {
            info.lines()
                .find(|line| line.starts_with("model name"))
                .and_then(|line| line.split_once(':'))
                .map(|(_, model)| model.trim().to_string())
        })
        .unwrap_or_default()
}

fn username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_passphrase_is_stable() {
        let first = machine_passphrase();
        let second = machine_passphrase();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_explicit_passphrase_wins() {
        let source = PassphraseSource::from_config(Some("s3cret"));
        assert_eq!(source.resolve(), "s3cret");
        assert!(!format!("{:?}", source).contains("s3cret"));
    }

    #[test]
    fn test_empty_passphrase_falls_back_to_machine() {
        let source = PassphraseSource::from_config(Some(""));
        assert!(matches!(source, PassphraseSource::Machine));
        assert_eq!(source.resolve(), machine_passphrase());
    }
}
