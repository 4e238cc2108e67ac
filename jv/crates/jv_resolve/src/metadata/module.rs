//! Gradle module metadata (`.module`) documents and variant matching.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::MetadataError;
use crate::checksum::{Checksum, HashAlgorithm};
use crate::context::{Platform, PlatformType, Scope};
use crate::coordinates::{Coordinates, ModuleKey};

pub const ATTR_CATEGORY: &str = "org.gradle.category";
pub const ATTR_USAGE: &str = "org.gradle.usage";
pub const ATTR_PLATFORM_TYPE: &str = "org.jetbrains.kotlin.platform.type";
pub const ATTR_NATIVE_TARGET: &str = "org.jetbrains.kotlin.native.target";
pub const ATTR_JVM_ENVIRONMENT: &str = "org.gradle.jvm.environment";

const KNOWN_ATTRIBUTES: [&str; 4] = [
    ATTR_CATEGORY,
    ATTR_USAGE,
    ATTR_NATIVE_TARGET,
    ATTR_PLATFORM_TYPE,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleMetadata {
    #[serde(default)]
    pub format_version: Option<String>,
    #[serde(default)]
    pub component: Option<Component>,
    #[serde(default)]
    pub variants: Vec<Variant>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub group: String,
    pub module: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default, rename = "available-at")]
    pub available_at: Option<AvailableAt>,
    #[serde(default)]
    pub dependencies: Vec<ModuleDependency>,
    #[serde(default)]
    pub dependency_constraints: Vec<ModuleDependency>,
    #[serde(default)]
    pub files: Vec<VariantFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableAt {
    #[serde(default)]
    pub url: Option<String>,
    pub group: String,
    pub module: String,
    pub version: String,
}

impl AvailableAt {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(&self.group, &self.module, &self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDependency {
    pub group: String,
    pub module: String,
    #[serde(default)]
    pub version: Option<VersionConstraint>,
    #[serde(default)]
    pub excludes: Vec<ExcludeRule>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default)]
    pub endorse_strict_versions: bool,
}

impl ModuleDependency {
    pub fn key(&self) -> ModuleKey {
        ModuleKey::new(&self.group, &self.module)
    }

    /// `strictly` → `requires` → `prefers` の順で採用するバージョン。
    pub fn resolved_version(&self) -> Option<&str> {
        self.version.as_ref().and_then(VersionConstraint::resolved)
    }

    pub fn is_strict(&self) -> bool {
        self.version
            .as_ref()
            .is_some_and(|version| version.strictly.is_some())
    }

    /// `platform(...)` として宣言された依存 (BOM の取り込み) か。
    pub fn is_platform(&self) -> bool {
        matches!(
            attribute_string(&self.attributes, ATTR_CATEGORY).as_deref(),
            Some("platform" | "enforced-platform")
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionConstraint {
    #[serde(default)]
    pub strictly: Option<String>,
    #[serde(default)]
    pub requires: Option<String>,
    #[serde(default)]
    pub prefers: Option<String>,
    #[serde(default)]
    pub rejects: Vec<String>,
}

impl VersionConstraint {
    pub fn resolved(&self) -> Option<&str> {
        self.strictly
            .as_deref()
            .or(self.requires.as_deref())
            .or(self.prefers.as_deref())
            .filter(|value| !value.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludeRule {
    pub group: String,
    pub module: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantFile {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub sha512: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub sha1: Option<String>,
    #[serde(default)]
    pub md5: Option<String>,
}

impl VariantFile {
    /// メタデータに記載されたハッシュ (強い順)。
    pub fn checksums(&self) -> Vec<Checksum> {
        [
            (HashAlgorithm::Sha512, &self.sha512),
            (HashAlgorithm::Sha256, &self.sha256),
            (HashAlgorithm::Sha1, &self.sha1),
            (HashAlgorithm::Md5, &self.md5),
        ]
        .into_iter()
        .filter_map(|(algorithm, value)| {
            value
                .as_deref()
                .map(|value| Checksum::new(algorithm, value))
        })
        .collect()
    }

    pub fn extension(&self) -> &str {
        self.name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("jar")
    }
}

fn attribute_string(attributes: &BTreeMap<String, Value>, key: &str) -> Option<String> {
    match attributes.get(key)? {
        Value::String(value) => Some(value.clone()),
        Value::Bool(value) => Some(value.to_string()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    }
}

impl Variant {
    pub fn attribute(&self, key: &str) -> Option<String> {
        attribute_string(&self.attributes, key)
    }

    pub fn category(&self) -> Option<String> {
        self.attribute(ATTR_CATEGORY)
    }

    pub fn usage(&self) -> Option<String> {
        self.attribute(ATTR_USAGE)
    }

    /// 明示的な `platform.type` が無い場合、Java の usage を持つバリアントは JVM 向けとみなす。
    pub fn platform_type(&self) -> Option<PlatformType> {
        if let Some(value) = self.attribute(ATTR_PLATFORM_TYPE) {
            return PlatformType::from_value(&value);
        }
        self.usage()
            .filter(|usage| usage.starts_with("java-"))
            .map(|_| PlatformType::Jvm)
    }

    pub fn is_documentation(&self) -> bool {
        self.category().as_deref() == Some("documentation")
    }

    pub fn is_platform(&self) -> bool {
        matches!(
            self.category().as_deref(),
            Some("platform" | "enforced-platform")
        )
    }

    /// 共通ソースセットをまとめた `kotlin-metadata` バリアントか。
    pub fn is_kotlin_metadata(&self) -> bool {
        self.usage().as_deref() == Some("kotlin-metadata")
            || self.platform_type() == Some(PlatformType::Common)
    }

    /// `-published` 接尾辞を除いた名前。
    pub fn base_name(&self) -> &str {
        self.name.strip_suffix("-published").unwrap_or(&self.name)
    }

    fn unknown_attribute_count(&self) -> usize {
        self.attributes
            .keys()
            .filter(|key| !KNOWN_ATTRIBUTES.contains(&key.as_str()))
            .count()
    }
}

impl ModuleMetadata {
    pub fn parse(bytes: &[u8]) -> Result<Self, MetadataError> {
        serde_json::from_slice(bytes).map_err(|source| MetadataError::Json { source })
    }

    /// すべての実質的なバリアントが `platform` カテゴリで成果物を持たない (BOM) か。
    pub fn is_platform(&self) -> bool {
        let mut relevant = self
            .variants
            .iter()
            .filter(|variant| !variant.is_documentation())
            .peekable();
        relevant.peek().is_some()
            && relevant.all(|variant| variant.is_platform() && variant.files.is_empty())
    }

    pub fn is_multiplatform(&self) -> bool {
        self.kotlin_metadata_variant().is_some()
    }

    pub fn kotlin_metadata_variant(&self) -> Option<&Variant> {
        self.variants
            .iter()
            .filter(|variant| !variant.is_documentation())
            .find(|variant| variant.is_kotlin_metadata())
    }

    /// BOM として取り込む際に使うバリアント。
    pub fn platform_variant(&self, scope: Scope) -> Option<&Variant> {
        let platforms: Vec<&Variant> = self
            .variants
            .iter()
            .filter(|variant| variant.is_platform())
            .collect();
        [scope, scope.fallback()]
            .into_iter()
            .find_map(|scope| {
                platforms.iter().copied().find(|variant| {
                    variant
                        .usage()
                        .is_some_and(|usage| scope.usages().contains(&usage.as_str()))
                })
            })
            .or_else(|| platforms.first().copied())
    }

    /// ライブラリが対応するプラットフォーム種別の表示名。
    pub fn supported_platforms(&self) -> BTreeSet<String> {
        self.variants
            .iter()
            .filter(|variant| !variant.is_documentation() && !variant.is_kotlin_metadata())
            .filter_map(|variant| {
                let platform_type = variant.platform_type()?;
                Some(match variant.attribute(ATTR_NATIVE_TARGET) {
                    Some(target) => target,
                    None => platform_type.value().to_string(),
                })
            })
            .collect()
    }

    /// 指定プラットフォーム・スコープに合うバリアントを絞り込む。
    ///
    /// プラットフォーム種別 (Android は JVM へフォールバック)、ネイティブターゲット、
    /// usage (反対スコープへフォールバック) の順に絞り、複数残れば未知属性の少ないものを残す。
    pub fn select_variants(&self, platform: Platform, scope: Scope) -> Vec<&Variant> {
        let candidates: Vec<&Variant> = self
            .variants
            .iter()
            .filter(|variant| !variant.is_documentation() && !variant.is_kotlin_metadata())
            .filter(|variant| !variant.is_platform())
            .collect();

        let requested_type = platform.platform_type();
        let mut by_platform: Vec<&Variant> = candidates
            .iter()
            .copied()
            .filter(|variant| variant.platform_type() == Some(requested_type))
            .collect();
        if by_platform.is_empty() {
            if let Some(fallback) = requested_type.fallback() {
                by_platform = candidates
                    .iter()
                    .copied()
                    .filter(|variant| variant.platform_type() == Some(fallback))
                    .collect();
            }
        }

        if let Some(target) = platform.native_target() {
            by_platform.retain(|variant| {
                variant.attribute(ATTR_NATIVE_TARGET).as_deref() == Some(target)
            });
        }

        if matches!(requested_type, PlatformType::Jvm | PlatformType::AndroidJvm) {
            let wanted = if requested_type == PlatformType::AndroidJvm {
                "android"
            } else {
                "standard-jvm"
            };
            let matching: Vec<&Variant> = by_platform
                .iter()
                .copied()
                .filter(|variant| {
                    variant.attribute(ATTR_JVM_ENVIRONMENT).as_deref() == Some(wanted)
                })
                .collect();
            if !matching.is_empty() {
                by_platform = matching;
            }
        }

        let by_usage = |scope: Scope| -> Vec<&Variant> {
            by_platform
                .iter()
                .copied()
                .filter(|variant| {
                    variant
                        .usage()
                        .is_some_and(|usage| scope.usages().contains(&usage.as_str()))
                })
                .collect()
        };
        let mut selected = by_usage(scope);
        if selected.is_empty() {
            selected = by_usage(scope.fallback());
        }

        if selected.len() > 1 {
            let minimum = selected
                .iter()
                .map(|variant| variant.unknown_attribute_count())
                .min()
                .unwrap_or(0);
            selected.retain(|variant| variant.unknown_attribute_count() == minimum);
        }
        selected
    }
}
