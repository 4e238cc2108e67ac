//! Tracing subscriber setup shared by the `jvdr` binary and embedding tools.

use std::fmt;
use std::io;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// ロギング設定の解析・初期化時に発生するエラー。
#[derive(Debug, Error)]
pub enum LoggingConfigError {
    #[error(
        "未対応のログレベル: {invalid}. 利用可能候補: {choices}",
        choices = .available.join(", ")
    )]
    UnknownLogLevel {
        invalid: String,
        available: &'static [&'static str],
    },
    #[error("ログフィルタを構築できません: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    #[error("トレーシングは既に初期化されています: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

/// ログレベル。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    #[default]
    Warn,
    Error,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    pub const fn variants() -> &'static [&'static str] {
        &["TRACE", "DEBUG", "INFO", "WARN", "ERROR"]
    }

    fn directive(self) -> String {
        format!("jv_resolve={},jvdr={}", self.filter_name(), self.filter_name())
    }

    const fn filter_name(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = LoggingConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalised = s.trim().to_ascii_lowercase();
        match normalised.as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(LoggingConfigError::UnknownLogLevel {
                invalid: other.to_string(),
                available: LogLevel::variants(),
            }),
        }
    }
}

impl Serialize for LogLevel {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        LogLevel::from_str(&value).map_err(serde::de::Error::custom)
    }
}

/// `RUST_LOG` が設定されていればそれを優先し、なければ `level` からフィルタを作る。
pub fn env_filter(level: LogLevel) -> Result<EnvFilter, LoggingConfigError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(level.directive())?),
    }
}

/// 標準エラー出力へ向けたサブスクライバを登録する。`json` なら1行1イベントのJSON形式。
pub fn init_tracing(level: LogLevel, json: bool) -> Result<(), LoggingConfigError> {
    let registry = tracing_subscriber::registry().with(env_filter(level)?);
    if json {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(io::stderr)
            .with_current_span(true);
        registry.with(layer).try_init()?;
    } else {
        let layer = tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(io::stderr)
            .with_target(false);
        registry.with(layer).try_init()?;
    }
    tracing::debug!(level = %level, json, "トレーシングを初期化");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels_case_insensitively() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!(" WARNING ".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("Error".parse::<LogLevel>().unwrap(), LogLevel::Error);
        let error = "verbose".parse::<LogLevel>().unwrap_err();
        assert!(error.to_string().contains("TRACE, DEBUG, INFO, WARN, ERROR"));
    }

    #[test]
    fn serializes_as_upper_case_string() {
        let json = serde_json::to_string(&LogLevel::Info).unwrap();
        assert_eq!(json, "\"INFO\"");
        let level: LogLevel = serde_json::from_str("\"trace\"").unwrap();
        assert_eq!(level, LogLevel::Trace);
    }

    #[test]
    fn directive_covers_library_and_binary() {
        assert_eq!(LogLevel::Info.directive(), "jv_resolve=info,jvdr=info");
        assert!(EnvFilter::try_new(LogLevel::Trace.directive()).is_ok());
    }
}
