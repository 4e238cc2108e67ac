//! Kotlin Multiplatform project structure metadata and source-set extraction.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tempfile::NamedTempFile;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::MetadataError;

pub const PROJECT_STRUCTURE_ENTRY: &str = "META-INF/kotlin-project-structure-metadata.json";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectStructureDocument {
    project_structure: ProjectStructure,
}

/// `kotlin-project-structure-metadata.json` の内容。
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStructure {
    #[serde(default)]
    pub format_version: Option<String>,
    #[serde(default)]
    pub is_published_as_root: Option<Value>,
    #[serde(default)]
    pub variants: Vec<StructureVariant>,
    #[serde(default)]
    pub source_sets: Vec<SourceSet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StructureVariant {
    pub name: String,
    #[serde(default, rename = "sourceSet")]
    pub source_sets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSet {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// `group:module` 形式。バージョンは metadata バリアントの依存から引く。
    #[serde(default)]
    pub module_dependency: Vec<String>,
    #[serde(default)]
    pub binary_layout: Option<String>,
    #[serde(default)]
    pub host_specific: Option<Value>,
}

impl SourceSet {
    pub fn module_keys(&self) -> impl Iterator<Item = (&str, &str)> {
        self.module_dependency
            .iter()
            .filter_map(|entry| entry.split_once(':'))
    }
}

impl ProjectStructure {
    pub fn parse(bytes: &[u8]) -> Result<Self, MetadataError> {
        let document: ProjectStructureDocument =
            serde_json::from_slice(bytes).map_err(|source| MetadataError::Json { source })?;
        Ok(document.project_structure)
    }

    pub fn variant(&self, name: &str) -> Option<&StructureVariant> {
        let base = name.strip_suffix("-published").unwrap_or(name);
        self.variants.iter().find(|variant| {
            variant.name == base || variant.name.strip_suffix("-published") == Some(base)
        })
    }

    pub fn source_set(&self, name: &str) -> Option<&SourceSet> {
        self.source_sets.iter().find(|set| set.name == name)
    }

    /// 指定バリアントすべてに共通するソースセット。どれかが未知なら `None`。
    pub fn common_source_sets<'a, I>(&self, variant_names: I) -> Option<BTreeSet<String>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut common: Option<BTreeSet<String>> = None;
        for name in variant_names {
            let sets: BTreeSet<String> =
                self.variant(name)?.source_sets.iter().cloned().collect();
            common = Some(match common {
                Some(current) => current.intersection(&sets).cloned().collect(),
                None => sets,
            });
        }
        common
    }
}

fn open_archive(path: &Path) -> Result<ZipArchive<BufReader<File>>, MetadataError> {
    let file = File::open(path).map_err(|source| MetadataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    ZipArchive::new(BufReader::new(file)).map_err(|error| MetadataError::Archive {
        path: path.to_path_buf(),
        message: error.to_string(),
    })
}

/// metadata jar からプロジェクト構造を読む。エントリが無ければ `None`。
pub fn read_project_structure(jar: &Path) -> Result<Option<ProjectStructure>, MetadataError> {
    let mut archive = open_archive(jar)?;
    let mut entry = match archive.by_name(PROJECT_STRUCTURE_ENTRY) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(error) => {
            return Err(MetadataError::Archive {
                path: jar.to_path_buf(),
                message: error.to_string(),
            });
        }
    };
    let mut bytes = Vec::new();
    entry
        .read_to_end(&mut bytes)
        .map_err(|source| MetadataError::Io {
            path: jar.to_path_buf(),
            source,
        })?;
    ProjectStructure::parse(&bytes).map(Some)
}

/// アーカイブに含まれるソースセットディレクトリ名。
pub fn archived_source_sets(jar: &Path) -> Result<BTreeSet<String>, MetadataError> {
    let archive = open_archive(jar)?;
    Ok(archive
        .file_names()
        .filter_map(|name| name.split_once('/').map(|(root, _)| root))
        .filter(|root| !root.is_empty() && *root != "META-INF")
        .map(str::to_string)
        .collect())
}

/// `source_set/` 配下を取り出し、独立した klib として `target` に書き出す。
///
/// 該当エントリが無い場合は何も書かずに `false` を返す。
pub fn extract_source_set(jar: &Path, source_set: &str, target: &Path) -> Result<bool, MetadataError> {
    let mut archive = open_archive(jar)?;
    let prefix = format!("{source_set}/");
    let names: Vec<String> = archive
        .file_names()
        .filter(|name| name.starts_with(&prefix) && name.len() > prefix.len())
        .map(str::to_string)
        .collect();
    if names.is_empty() {
        return Ok(false);
    }

    let io_error = |source: io::Error| MetadataError::Io {
        path: target.to_path_buf(),
        source,
    };
    let archive_error = |error: zip::result::ZipError| MetadataError::Archive {
        path: target.to_path_buf(),
        message: error.to_string(),
    };

    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(io_error)?;
    let temp = NamedTempFile::new_in(parent).map_err(io_error)?;
    let mut writer = ZipWriter::new(temp.reopen().map_err(io_error)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut sorted = names;
    sorted.sort();
    for name in sorted {
        let relative = &name[prefix.len()..];
        let mut entry = archive.by_name(&name).map_err(archive_error)?;
        if entry.is_dir() {
            writer
                .add_directory(relative, options)
                .map_err(archive_error)?;
            continue;
        }
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).map_err(io_error)?;
        writer.start_file(relative, options).map_err(archive_error)?;
        writer.write_all(&contents).map_err(io_error)?;
    }
    writer.finish().map_err(archive_error)?;
    temp.persist(target)
        .map_err(|error| io_error(error.error))?;
    Ok(true)
}
