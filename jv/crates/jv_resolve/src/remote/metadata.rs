use quick_xml::de::from_reader;
use serde::Deserialize;
use thiserror::Error;

/// Mavenリポジトリが提供する `maven-metadata.xml` の表現。
///
/// アーティファクト単位 (バージョン一覧) とバージョン単位 (スナップショット一覧) の両方を扱う。
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MavenMetadata {
    #[serde(rename = "groupId", default)]
    pub group_id: Option<String>,
    #[serde(rename = "artifactId", default)]
    pub artifact_id: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub versioning: Option<Versioning>,
}

impl MavenMetadata {
    /// 利用可能なバージョン一覧を返す（空の場合は空スライス）。
    pub fn versions(&self) -> &[String] {
        self.versioning
            .as_ref()
            .map(|versioning| versioning.versions.items.as_slice())
            .unwrap_or_default()
    }

    pub fn latest_release(&self) -> Option<&str> {
        self.versioning
            .as_ref()
            .and_then(|versioning| versioning.release.as_deref())
    }

    /// スナップショットの実ファイル名に使うバージョン値 (`1.0-20240101.120000-3` など)。
    ///
    /// `snapshotVersions` が拡張子ごとの値を持つ場合はそれを優先し、
    /// 無ければ `snapshot` 要素のタイムスタンプとビルド番号から組み立てる。
    pub fn snapshot_value(
        &self,
        base_version: &str,
        extension: &str,
        classifier: Option<&str>,
    ) -> Option<String> {
        let versioning = self.versioning.as_ref()?;
        let listed = versioning
            .snapshot_versions
            .items
            .iter()
            .filter(|entry| {
                entry.extension == extension && entry.classifier.as_deref() == classifier
            })
            .max_by(|left, right| left.updated.cmp(&right.updated))
            .map(|entry| entry.value.clone());
        if listed.is_some() {
            return listed;
        }

        let snapshot = versioning.snapshot.as_ref()?;
        if snapshot.local_copy.unwrap_or(false) {
            return Some(base_version.to_string());
        }
        let timestamp = snapshot.timestamp.as_deref()?;
        let build = snapshot.build_number?;
        let prefix = base_version.strip_suffix("-SNAPSHOT").unwrap_or(base_version);
        Some(format!("{prefix}-{timestamp}-{build}"))
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Versioning {
    pub latest: Option<String>,
    pub release: Option<String>,
    #[serde(default)]
    pub versions: Versions,
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<String>,
    #[serde(default)]
    pub snapshot: Option<Snapshot>,
    #[serde(rename = "snapshotVersions", default)]
    pub snapshot_versions: SnapshotVersions,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Versions {
    #[serde(default)]
    #[serde(rename = "version")]
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub timestamp: Option<String>,
    #[serde(rename = "buildNumber")]
    pub build_number: Option<u32>,
    #[serde(rename = "localCopy")]
    pub local_copy: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct SnapshotVersions {
    #[serde(default)]
    #[serde(rename = "snapshotVersion")]
    pub items: Vec<SnapshotVersion>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SnapshotVersion {
    #[serde(default)]
    pub classifier: Option<String>,
    pub extension: String,
    pub value: String,
    #[serde(default)]
    pub updated: Option<String>,
}

/// `maven-metadata.xml` のパースエラー。
#[derive(Debug, Error)]
pub enum MetadataParseError {
    #[error("maven-metadata.xmlの解析に失敗しました: {0}")]
    Xml(#[from] quick_xml::DeError),
}

pub fn parse_metadata(bytes: &[u8]) -> Result<MavenMetadata, MetadataParseError> {
    from_reader(bytes).map_err(MetadataParseError::from)
}
