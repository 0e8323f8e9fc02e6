//! DVH-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, DvhError>;

/// Top-level error type for the deploy validation harness.
#[derive(Debug, Error)]
pub enum DvhError {
    #[error("[DVH-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[DVH-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[DVH-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[DVH-1101] invalid channel {value:?}: expected \"release\" or \"nightly\"")]
    InvalidChannel { value: String },

    #[error("[DVH-1102] invalid command template {template:?}: {details}")]
    Template { template: String, details: String },

    #[error("[DVH-2001] failed to spawn {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("[DVH-2002] command {command:?} exceeded its {timeout_ms} ms bound")]
    TimeoutExceeded { command: String, timeout_ms: u64 },

    #[error("[DVH-2003] command {command:?} interrupted")]
    Interrupted { command: String },

    #[error("[DVH-2004] device {host}:{port} unreachable after {waited_ms} ms")]
    UnreachableDevice {
        host: String,
        port: u16,
        waited_ms: u64,
    },

    #[error("[DVH-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[DVH-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[DVH-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[DVH-3004] report missing: {path}")]
    ReportMissing { path: PathBuf },

    #[error("[DVH-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl DvhError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "DVH-1001",
            Self::MissingConfig { .. } => "DVH-1002",
            Self::ConfigParse { .. } => "DVH-1003",
            Self::InvalidChannel { .. } => "DVH-1101",
            Self::Template { .. } => "DVH-1102",
            Self::Spawn { .. } => "DVH-2001",
            Self::TimeoutExceeded { .. } => "DVH-2002",
            Self::Interrupted { .. } => "DVH-2003",
            Self::UnreachableDevice { .. } => "DVH-2004",
            Self::Serialization { .. } => "DVH-2101",
            Self::Io { .. } => "DVH-3002",
            Self::ChannelClosed { .. } => "DVH-3003",
            Self::ReportMissing { .. } => "DVH-3004",
            Self::Runtime { .. } => "DVH-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::UnreachableDevice { .. }
                | Self::TimeoutExceeded { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for DvhError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for DvhError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<DvhError> {
        vec![
            DvhError::InvalidConfig {
                details: String::new(),
            },
            DvhError::MissingConfig {
                path: PathBuf::new(),
            },
            DvhError::ConfigParse {
                context: "",
                details: String::new(),
            },
            DvhError::InvalidChannel {
                value: String::new(),
            },
            DvhError::Template {
                template: String::new(),
                details: String::new(),
            },
            DvhError::Spawn {
                command: String::new(),
                source: std::io::Error::other("test"),
            },
            DvhError::TimeoutExceeded {
                command: String::new(),
                timeout_ms: 0,
            },
            DvhError::Interrupted {
                command: String::new(),
            },
            DvhError::UnreachableDevice {
                host: String::new(),
                port: 22,
                waited_ms: 0,
            },
            DvhError::Serialization {
                context: "",
                details: String::new(),
            },
            DvhError::Io {
                path: PathBuf::new(),
                source: std::io::Error::other("test"),
            },
            DvhError::ChannelClosed { component: "" },
            DvhError::ReportMissing {
                path: PathBuf::new(),
            },
            DvhError::Runtime {
                details: String::new(),
            },
        ]
    }

    #[test]
    fn error_codes_are_unique() {
        let errors = all_variants();
        let codes: Vec<&str> = errors.iter().map(DvhError::code).collect();
        let unique: std::collections::HashSet<&&str> = codes.iter().collect();
        assert_eq!(
            codes.len(),
            unique.len(),
            "error codes must be unique: {codes:?}"
        );
    }

    #[test]
    fn every_display_carries_its_code() {
        for err in all_variants() {
            let msg = err.to_string();
            assert!(err.code().starts_with("DVH-"));
            assert!(
                msg.contains(err.code()),
                "display should contain error code: {msg}"
            );
        }
    }

    #[test]
    fn invalid_channel_names_the_offending_value() {
        let err = DvhError::InvalidChannel {
            value: "beta".to_string(),
        };
        assert!(err.to_string().contains("\"beta\""));
    }

    #[test]
    fn retryable_errors_are_correct() {
        assert!(
            DvhError::UnreachableDevice {
                host: "10.0.0.2".into(),
                port: 22,
                waited_ms: 10_000,
            }
            .is_retryable()
        );
        assert!(
            DvhError::TimeoutExceeded {
                command: "deploy".into(),
                timeout_ms: 1
            }
            .is_retryable()
        );
        assert!(
            !DvhError::InvalidChannel {
                value: "beta".into()
            }
            .is_retryable()
        );
        assert!(
            !DvhError::Interrupted {
                command: "deploy".into()
            }
            .is_retryable()
        );
        assert!(
            !DvhError::ReportMissing {
                path: PathBuf::new()
            }
            .is_retryable()
        );
    }

    #[test]
    fn io_convenience_constructor() {
        let err = DvhError::io(
            "/tmp/reports/a.tap",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.code(), "DVH-3002");
        assert!(err.to_string().contains("/tmp/reports/a.tap"));
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: DvhError = json_err.into();
        assert_eq!(err.code(), "DVH-2101");
    }

    #[test]
    fn from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        let err: DvhError = toml_err.into();
        assert_eq!(err.code(), "DVH-1003");
    }
}
