//! Diagnostics attached to dependency graph nodes.
//!
//! Dependency-level problems never abort a resolution. They are recorded as
//! [`Message`]s on the node they concern and surfaced through a
//! [`DiagnosticsReport`] once the graph is complete.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 診断メッセージの種別。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticKind {
    InvalidCoordinates,
    UnspecifiedDependencyVersion,
    UnresolvedVersionRange,
    UnableToResolveDependency,
    UnableToDownloadChecksums,
    UnableToDownloadFile,
    ChecksumMismatch,
    MetadataUnreadable,
    PomResolvedWithMetadataErrors,
    ParentPomUnresolved,
    PlatformsAreNotSupported,
    MoreThanOneVariant,
    BomDeclaredAsRegularDependency,
    RegularDependencyDeclaredAsBom,
    ConstraintSourcesDisagree,
    VersionOverridden,
    KotlinMetadataMissing,
    SourceSetUnavailable,
    SourcesUnavailable,
    ResolutionDidNotConverge,
}

impl DiagnosticKind {
    pub fn code(&self) -> &'static str {
        match self {
            DiagnosticKind::InvalidCoordinates => "invalid-coordinates",
            DiagnosticKind::UnspecifiedDependencyVersion => "unspecified-dependency-version",
            DiagnosticKind::UnresolvedVersionRange => "unresolved-version-range",
            DiagnosticKind::UnableToResolveDependency => "unable-to-resolve-dependency",
            DiagnosticKind::UnableToDownloadChecksums => "unable-to-download-checksums",
            DiagnosticKind::UnableToDownloadFile => "unable-to-download-file",
            DiagnosticKind::ChecksumMismatch => "checksum-mismatch",
            DiagnosticKind::MetadataUnreadable => "metadata-unreadable",
            DiagnosticKind::PomResolvedWithMetadataErrors => "pom-resolved-with-metadata-errors",
            DiagnosticKind::ParentPomUnresolved => "parent-pom-unresolved",
            DiagnosticKind::PlatformsAreNotSupported => "platforms-are-not-supported",
            DiagnosticKind::MoreThanOneVariant => "more-than-one-variant",
            DiagnosticKind::BomDeclaredAsRegularDependency => "bom-declared-as-regular-dependency",
            DiagnosticKind::RegularDependencyDeclaredAsBom => "regular-dependency-declared-as-bom",
            DiagnosticKind::ConstraintSourcesDisagree => "constraint-sources-disagree",
            DiagnosticKind::VersionOverridden => "version-overridden",
            DiagnosticKind::KotlinMetadataMissing => "kotlin-metadata-missing",
            DiagnosticKind::SourceSetUnavailable => "source-set-unavailable",
            DiagnosticKind::SourcesUnavailable => "sources-unavailable",
            DiagnosticKind::ResolutionDidNotConverge => "resolution-did-not-converge",
        }
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// 診断に付随する構造化データ。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Payload {
    Platforms {
        unsupported: BTreeSet<Platform>,
        supported: BTreeSet<String>,
    },
    VersionOverride {
        from: String,
        to: String,
    },
    ConstraintSources {
        module_metadata: String,
        pom: String,
    },
    Variants {
        names: Vec<String>,
    },
    Locations {
        urls: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Message>,
    /// 通信障害など、再実行で解消し得る原因か。
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub transient: bool,
}

impl Message {
    pub fn new(severity: Severity, kind: DiagnosticKind, text: impl Into<String>) -> Self {
        Self {
            severity,
            kind,
            text: text.into(),
            payload: None,
            children: Vec::new(),
            transient: false,
        }
    }

    pub fn info(kind: DiagnosticKind, text: impl Into<String>) -> Self {
        Self::new(Severity::Info, kind, text)
    }

    pub fn warning(kind: DiagnosticKind, text: impl Into<String>) -> Self {
        Self::new(Severity::Warning, kind, text)
    }

    pub fn error(kind: DiagnosticKind, text: impl Into<String>) -> Self {
        Self::new(Severity::Error, kind, text)
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_children(mut self, children: Vec<Message>) -> Self {
        self.children = children;
        self
    }

    pub fn with_transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }

    /// 自身または子メッセージのいずれかが一時的な失敗に由来するか。
    pub fn is_transient(&self) -> bool {
        self.transient || self.children.iter().any(Message::is_transient)
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    fn render(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        out.push_str(&format!(
            "{indent}{} [{}] {}\n",
            self.severity, self.kind, self.text
        ));
        for child in &self.children {
            child.render(out, depth + 1);
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.severity, self.kind, self.text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEntry {
    /// メッセージが付与されたノードの表示名。
    pub subject: String,
    pub message: Message,
}

/// 解決結果の診断をノード単位でまとめたもの。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticsReport {
    entries: Vec<ReportEntry>,
}

impl DiagnosticsReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, subject: impl Into<String>, message: Message) {
        self.entries.push(ReportEntry {
            subject: subject.into(),
            message,
        });
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(|entry| entry.message.is_error())
    }

    pub fn errors(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries.iter().filter(|entry| entry.message.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.message.severity == Severity::Warning)
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.message.kind == kind)
            .count()
    }

    /// 指定重大度以上のメッセージを対象ごとにまとめて文字列化する。
    pub fn render(&self, minimum: Severity) -> String {
        let mut out = String::new();
        let mut current: Option<&str> = None;
        let mut sorted: Vec<&ReportEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.message.severity >= minimum)
            .collect();
        sorted.sort_by(|left, right| left.subject.cmp(&right.subject));
        for entry in sorted {
            if current != Some(entry.subject.as_str()) {
                out.push_str(&format!("{}:\n", entry.subject));
                current = Some(entry.subject.as_str());
            }
            entry.message.render(&mut out, 1);
        }
        out
    }
}
