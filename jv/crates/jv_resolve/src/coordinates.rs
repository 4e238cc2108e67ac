//! Library coordinates, Maven version ordering and version ranges.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 座標文字列の解析エラー。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordinateError {
    #[error("座標文字列が空です")]
    Empty,
    #[error("座標 '{input}' の形式が不正です (期待値: group:artifact[:version[:classifier]][@extension])")]
    Malformed { input: String },
    #[error("座標 '{input}' の {part} が空です")]
    EmptyPart { input: String, part: &'static str },
    #[error("座標 '{input}' に使用できない文字 '{character}' が含まれています")]
    InvalidCharacter { input: String, character: char },
}

/// グループID+アーティファクトIDの組み合わせ。競合解決のグルーピングキー。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleKey {
    pub group_id: String,
    pub artifact_id: String,
}

impl ModuleKey {
    pub fn new(group_id: impl Into<String>, artifact_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            artifact_id: artifact_id.into(),
        }
    }

    pub fn group_path(&self) -> String {
        self.group_id.replace('.', "/")
    }

    /// `group/path/artifact` 形式の相対パス。
    pub fn path(&self) -> String {
        format!("{}/{}", self.group_path(), self.artifact_id)
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group_id, self.artifact_id)
    }
}

/// バージョン・分類子・拡張子を含むライブラリ座標。バージョンは未指定でもよい。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Coordinates {
    pub group_id: String,
    pub artifact_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
}

impl Coordinates {
    pub fn new(
        group_id: impl Into<String>,
        artifact_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        let version = version.into();
        Self {
            group_id: group_id.into(),
            artifact_id: artifact_id.into(),
            version: Some(version).filter(|value| !value.trim().is_empty()),
            classifier: None,
            extension: None,
        }
    }

    pub fn unversioned(group_id: impl Into<String>, artifact_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            artifact_id: artifact_id.into(),
            version: None,
            classifier: None,
            extension: None,
        }
    }

    /// `group:artifact[:version[:classifier]][@extension]` を解析する。
    pub fn parse(input: &str) -> Result<Self, CoordinateError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(CoordinateError::Empty);
        }

        if let Some(character) = trimmed
            .chars()
            .find(|ch| ch.is_whitespace() || matches!(ch, '/' | '\\'))
        {
            return Err(CoordinateError::InvalidCharacter {
                input: trimmed.to_string(),
                character,
            });
        }

        let (body, extension) = match trimmed.split_once('@') {
            Some((body, extension)) => (body, Some(extension)),
            None => (trimmed, None),
        };

        let parts: Vec<&str> = body.split(':').collect();
        if parts.len() < 2 || parts.len() > 4 {
            return Err(CoordinateError::Malformed {
                input: trimmed.to_string(),
            });
        }

        let require = |value: &str, part: &'static str| {
            if value.is_empty() {
                Err(CoordinateError::EmptyPart {
                    input: trimmed.to_string(),
                    part,
                })
            } else {
                Ok(value.to_string())
            }
        };

        let group_id = require(parts[0], "groupId")?;
        let artifact_id = require(parts[1], "artifactId")?;
        let version = parts
            .get(2)
            .map(|value| value.to_string())
            .filter(|value| !value.is_empty());
        let classifier = match parts.get(3) {
            Some(value) => Some(require(value, "classifier")?),
            None => None,
        };
        let extension = match extension {
            Some(value) => Some(require(value, "extension")?),
            None => None,
        };

        Ok(Self {
            group_id,
            artifact_id,
            version,
            classifier,
            extension,
        })
    }

    pub fn with_version(&self, version: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.version = Some(version.into()).filter(|value| !value.trim().is_empty());
        copy
    }

    pub fn with_classifier(mut self, classifier: impl Into<String>) -> Self {
        self.classifier = Some(classifier.into());
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    pub fn key(&self) -> ModuleKey {
        ModuleKey::new(self.group_id.clone(), self.artifact_id.clone())
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn classifier(&self) -> Option<&str> {
        self.classifier.as_deref()
    }

    pub fn is_snapshot(&self) -> bool {
        self.version
            .as_deref()
            .is_some_and(|version| version.ends_with("-SNAPSHOT"))
    }

    pub fn is_range(&self) -> bool {
        self.version
            .as_deref()
            .is_some_and(|version| VersionRange::parse(version).is_some())
    }

    /// `group/path/artifact/version` 形式の相対ディレクトリ。バージョン未指定なら `None`。
    pub fn version_dir(&self) -> Option<String> {
        let version = self.version.as_deref()?;
        Some(format!("{}/{}", self.key().path(), version))
    }

    /// 指定拡張子のファイル名 (`artifact-version[-classifier].ext`)。
    pub fn file_name(&self, extension: &str) -> Option<String> {
        let version = self.version.as_deref()?;
        Some(self.file_name_for_version(version, extension))
    }

    /// スナップショットのタイムスタンプ版など、ディレクトリと異なるバージョン値でファイル名を組み立てる。
    pub fn file_name_for_version(&self, version: &str, extension: &str) -> String {
        match self.classifier() {
            Some(classifier) => format!(
                "{}-{}-{}.{}",
                self.artifact_id, version, classifier, extension
            ),
            None => format!("{}-{}.{}", self.artifact_id, version, extension),
        }
    }

    /// リポジトリルートからの相対パス。
    pub fn artifact_path(&self, extension: &str) -> Option<String> {
        Some(format!(
            "{}/{}",
            self.version_dir()?,
            self.file_name(extension)?
        ))
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group_id, self.artifact_id)?;
        if let Some(version) = &self.version {
            write!(f, ":{version}")?;
        }
        if let Some(classifier) = &self.classifier {
            if self.version.is_none() {
                f.write_str(":")?;
            }
            write!(f, ":{classifier}")?;
        }
        if let Some(extension) = &self.extension {
            write!(f, "@{extension}")?;
        }
        Ok(())
    }
}

impl FromStr for Coordinates {
    type Err = CoordinateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum VersionItem {
    Number(String),
    Qualifier(String),
}

impl VersionItem {
    fn qualifier_rank(value: &str) -> u8 {
        match value {
            "alpha" => 0,
            "beta" => 1,
            "milestone" => 2,
            "rc" => 3,
            "snapshot" => 4,
            "" => 5,
            "sp" => 6,
            _ => 7,
        }
    }

    fn compare_numbers(left: &str, right: &str) -> Ordering {
        left.len().cmp(&right.len()).then_with(|| left.cmp(right))
    }

    fn compare(left: Option<&Self>, right: Option<&Self>) -> Ordering {
        match (left, right) {
            (None, None) => Ordering::Equal,
            (Some(item), None) => item.compare_to_absent(),
            (None, Some(item)) => item.compare_to_absent().reverse(),
            (Some(VersionItem::Number(l)), Some(VersionItem::Number(r))) => {
                Self::compare_numbers(l, r)
            }
            (Some(VersionItem::Number(_)), Some(VersionItem::Qualifier(_))) => Ordering::Greater,
            (Some(VersionItem::Qualifier(_)), Some(VersionItem::Number(_))) => Ordering::Less,
            (Some(VersionItem::Qualifier(l)), Some(VersionItem::Qualifier(r))) => {
                let (lr, rr) = (Self::qualifier_rank(l), Self::qualifier_rank(r));
                lr.cmp(&rr).then_with(|| if lr == 7 { l.cmp(r) } else { Ordering::Equal })
            }
        }
    }

    fn compare_to_absent(&self) -> Ordering {
        match self {
            VersionItem::Number(value) if value == "0" => Ordering::Equal,
            VersionItem::Number(_) => Ordering::Greater,
            VersionItem::Qualifier(value) => {
                Self::qualifier_rank(value).cmp(&Self::qualifier_rank(""))
            }
        }
    }
}

/// Mavenの比較規則に従うバージョン値。`1.0` と `1.0.0` は等価。
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    items: Vec<VersionItem>,
}

impl Version {
    pub fn parse(raw: &str) -> Self {
        Self {
            raw: raw.trim().to_string(),
            items: tokenize(raw.trim()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_snapshot(&self) -> bool {
        self.raw.ends_with("-SNAPSHOT")
    }
}

fn normalize_qualifier(token: &str, followed_by_digit: bool) -> String {
    let lower = token.to_ascii_lowercase();
    match lower.as_str() {
        "a" if followed_by_digit => "alpha".to_string(),
        "b" if followed_by_digit => "beta".to_string(),
        "m" if followed_by_digit => "milestone".to_string(),
        "cr" => "rc".to_string(),
        "ga" | "final" | "release" => String::new(),
        _ => lower,
    }
}

fn tokenize(raw: &str) -> Vec<VersionItem> {
    let mut tokens: Vec<(String, bool)> = Vec::new();
    let mut current = String::new();
    let mut current_digit = false;

    for ch in raw.chars() {
        if matches!(ch, '.' | '-' | '_' | '+') {
            if !current.is_empty() {
                tokens.push((std::mem::take(&mut current), current_digit));
            }
            continue;
        }
        let is_digit = ch.is_ascii_digit();
        if !current.is_empty() && is_digit != current_digit {
            tokens.push((std::mem::take(&mut current), current_digit));
        }
        current_digit = is_digit;
        current.push(ch);
    }
    if !current.is_empty() {
        tokens.push((current, current_digit));
    }

    let mut items = Vec::with_capacity(tokens.len());
    for (index, (token, digit)) in tokens.iter().enumerate() {
        if *digit {
            let trimmed = token.trim_start_matches('0');
            items.push(VersionItem::Number(if trimmed.is_empty() {
                "0".to_string()
            } else {
                trimmed.to_string()
            }));
        } else {
            let followed_by_digit = tokens.get(index + 1).is_some_and(|(_, next)| *next);
            items.push(VersionItem::Qualifier(normalize_qualifier(
                token,
                followed_by_digit,
            )));
        }
    }

    while items
        .last()
        .is_some_and(|item| item.compare_to_absent() == Ordering::Equal)
    {
        items.pop();
    }
    items
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.items.len().max(other.items.len());
        for index in 0..len {
            let ordering = VersionItem::compare(self.items.get(index), other.items.get(index));
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.items.hash(state);
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Bound {
    version: Version,
    inclusive: bool,
}

/// `[1.0,2.0)` 形式のバージョン範囲。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    lower: Option<Bound>,
    upper: Option<Bound>,
}

impl VersionRange {
    /// 範囲表記でなければ `None` を返す。
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let open = trimmed.chars().next()?;
        let close = trimmed.chars().last()?;
        if !matches!(open, '[' | '(') || !matches!(close, ']' | ')') || trimmed.len() < 2 {
            return None;
        }
        let inner = &trimmed[1..trimmed.len() - 1];
        let lower_inclusive = open == '[';
        let upper_inclusive = close == ']';

        let bound = |value: &str, inclusive: bool| {
            let value = value.trim();
            (!value.is_empty()).then(|| Bound {
                version: Version::parse(value),
                inclusive,
            })
        };

        match inner.split_once(',') {
            None => {
                let exact = bound(inner, true)?;
                if !lower_inclusive || !upper_inclusive {
                    return None;
                }
                Some(Self {
                    lower: Some(exact.clone()),
                    upper: Some(exact),
                })
            }
            Some((lower, upper)) => {
                if upper.contains(',') {
                    return None;
                }
                Some(Self {
                    lower: bound(lower, lower_inclusive),
                    upper: bound(upper, upper_inclusive),
                })
            }
        }
    }

    pub fn contains(&self, version: &Version) -> bool {
        let above_lower = match &self.lower {
            Some(bound) if bound.inclusive => version >= &bound.version,
            Some(bound) => version > &bound.version,
            None => true,
        };
        let below_upper = match &self.upper {
            Some(bound) if bound.inclusive => version <= &bound.version,
            Some(bound) => version < &bound.version,
            None => true,
        };
        above_lower && below_upper
    }

    /// 候補の中から範囲内で最も高いバージョンを選ぶ。
    pub fn select_highest<'a, I>(&self, candidates: I) -> Option<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        candidates
            .into_iter()
            .map(|raw| (raw, Version::parse(raw)))
            .filter(|(_, version)| !version.is_snapshot() && self.contains(version))
            .max_by(|(_, left), (_, right)| left.cmp(right))
            .map(|(raw, _)| raw)
    }
}
