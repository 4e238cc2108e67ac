//! Local "install" sink.
//!
//! Copies artifacts into a flat Maven layout together with a generated POM and
//! `.sha1`/`.sha256`/`.md5` sidecars. The repository exposed by the sink is
//! marked trusted, so files read back from it skip remote checksum lookups.

use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

use crate::checksum::HashAlgorithm;
use crate::coordinates::Coordinates;
use crate::files::FileOrigin;
use crate::graph::{DependencyGraph, NodeKind};
use crate::metadata::DeclarationKind;
use crate::repository::LocalRepository;

/// インストール先に添えるチェックサム。
const SIDECAR_ALGORITHMS: [HashAlgorithm; 3] = [HashAlgorithm::Sha1, HashAlgorithm::Sha256, HashAlgorithm::Md5];

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("{coordinates} はバージョンが指定されていないためインストールできません")]
    UnversionedCoordinates { coordinates: String },
    #[error("{path:?} への書き込み中にIOエラーが発生しました: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("pom.xml の書き込み中にIOエラーが発生しました: {0}")]
    PomIo(#[from] std::io::Error),
    #[error("pom.xml のXML生成に失敗しました: {0}")]
    Writer(#[from] quick_xml::Error),
    #[error("pom.xml をUTF-8文字列へ変換できません: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// 1ライブラリ分のインストール要求。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub coordinates: Coordinates,
    /// 主成果物。`None` なら POM のみを置く。
    pub artifact: Option<PathBuf>,
    pub packaging: String,
    pub dependencies: Vec<Coordinates>,
}

impl InstallRequest {
    pub fn new(coordinates: Coordinates) -> Self {
        Self {
            coordinates,
            artifact: None,
            packaging: "jar".to_string(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_artifact(mut self, artifact: impl Into<PathBuf>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }

    pub fn with_packaging(mut self, packaging: impl Into<String>) -> Self {
        self.packaging = packaging.into();
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Coordinates>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledArtifact {
    pub coordinates: Coordinates,
    /// 書き込んだファイル (チェックサムを除く)。
    pub files: Vec<PathBuf>,
}

/// エンジン自身が書き込むローカルリポジトリ。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInstallSink {
    repository: LocalRepository,
}

impl LocalInstallSink {
    pub const REPOSITORY_NAME: &'static str = "jv-install";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            repository: LocalRepository::maven_flat(Self::REPOSITORY_NAME, root).trusted(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.repository.root
    }

    pub fn repository(&self) -> &LocalRepository {
        &self.repository
    }

    fn target(&self, coordinates: &Coordinates, file_name: &str) -> Result<PathBuf, InstallError> {
        self.repository
            .target_path(coordinates, file_name, None)
            .ok_or_else(|| InstallError::UnversionedCoordinates {
                coordinates: coordinates.to_string(),
            })
    }

    pub fn install(&self, request: &InstallRequest) -> Result<InstalledArtifact, InstallError> {
        let coordinates = &request.coordinates;
        let mut files = Vec::new();

        if let Some(artifact) = &request.artifact {
            let extension = artifact
                .extension()
                .and_then(|extension| extension.to_str())
                .unwrap_or("jar");
            let bytes = fs::read(artifact).map_err(|source| InstallError::Io {
                path: artifact.clone(),
                source,
            })?;
            let name = coordinates.file_name_for_version(
                coordinates.version().unwrap_or_default(),
                extension,
            );
            let target = self.target(coordinates, &name)?;
            write_with_sidecars(&target, &bytes)?;
            files.push(target);
        }

        let pom = PomWriter::new(coordinates, &request.packaging, &request.dependencies).generate()?;
        let pom_coordinates = Coordinates {
            classifier: None,
            extension: None,
            ..coordinates.clone()
        };
        let pom_name = pom_coordinates
            .file_name("pom")
            .ok_or_else(|| InstallError::UnversionedCoordinates {
                coordinates: coordinates.to_string(),
            })?;
        let pom_path = self.target(&pom_coordinates, &pom_name)?;
        write_with_sidecars(&pom_path, pom.as_bytes())?;
        files.push(pom_path);

        info!(artifact = %coordinates, root = %self.root().display(), "ローカルにインストールしました");
        Ok(InstalledArtifact {
            coordinates: coordinates.clone(),
            files,
        })
    }

    /// 取得済みグラフの生存ノードをインストールする。展開元のアーカイブから取り出したファイルは対象外。
    pub fn install_graph(&self, graph: &DependencyGraph) -> Result<Vec<InstalledArtifact>, InstallError> {
        let mut installed = Vec::new();
        for id in graph.live_nodes() {
            let node = graph.node(id);
            let NodeKind::Maven(maven) = &node.kind else {
                continue;
            };
            if maven.coordinates.version().is_none() || maven.coordinates.is_range() {
                continue;
            }

            let mut files = Vec::new();
            for file in &maven.files {
                let (FileOrigin::Download, Some(source)) = (&file.origin, &file.path) else {
                    continue;
                };
                let bytes = fs::read(source).map_err(|error| InstallError::Io {
                    path: source.clone(),
                    source: error,
                })?;
                let target = self.target(&file.coordinates, &file.file_name)?;
                write_with_sidecars(&target, &bytes)?;
                files.push(target);
            }

            let dependencies: Vec<Coordinates> = node
                .children
                .iter()
                .filter(|edge| edge.kind == DeclarationKind::Regular)
                .filter_map(|edge| graph.maven(graph.winner(edge.target)))
                .filter(|child| child.coordinates.version().is_some())
                .map(|child| child.coordinates.clone())
                .collect();
            let packaging = if maven.files.is_empty() { "pom" } else { "jar" };
            let pom = PomWriter::new(&maven.coordinates, packaging, &dependencies).generate()?;
            if let Some(name) = maven.coordinates.file_name("pom") {
                let pom_path = self.target(&maven.coordinates, &name)?;
                write_with_sidecars(&pom_path, pom.as_bytes())?;
                files.push(pom_path);
            }
            debug!(artifact = %maven.coordinates, files = files.len(), "インストール");
            installed.push(InstalledArtifact {
                coordinates: maven.coordinates.clone(),
                files,
            });
        }
        Ok(installed)
    }
}

fn write_with_sidecars(target: &Path, bytes: &[u8]) -> Result<(), InstallError> {
    write_atomically(target, bytes)?;
    for algorithm in SIDECAR_ALGORITHMS {
        let mut sidecar = target.as_os_str().to_owned();
        sidecar.push(format!(".{}", algorithm.extension()));
        write_atomically(Path::new(&sidecar), algorithm.compute(bytes).as_bytes())?;
    }
    Ok(())
}

fn write_atomically(target: &Path, bytes: &[u8]) -> Result<(), InstallError> {
    let io_error = |source: std::io::Error| InstallError::Io {
        path: target.to_path_buf(),
        source,
    };
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(io_error)?;
    let mut temp = NamedTempFile::new_in(parent).map_err(io_error)?;
    temp.write_all(bytes).map_err(io_error)?;
    temp.persist(target).map_err(|error| io_error(error.error))?;
    Ok(())
}

/// インストールする POM を組み立てる。
struct PomWriter<'a> {
    coordinates: &'a Coordinates,
    packaging: &'a str,
    dependencies: &'a [Coordinates],
}

impl<'a> PomWriter<'a> {
    fn new(coordinates: &'a Coordinates, packaging: &'a str, dependencies: &'a [Coordinates]) -> Self {
        Self {
            coordinates,
            packaging,
            dependencies,
        }
    }

    fn generate(&self) -> Result<String, InstallError> {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 4);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let mut project = BytesStart::new("project");
        project.push_attribute(("xmlns", "http://maven.apache.org/POM/4.0.0"));
        project.push_attribute(("xmlns:xsi", "http://www.w3.org/2001/XMLSchema-instance"));
        project.push_attribute((
            "xsi:schemaLocation",
            "http://maven.apache.org/POM/4.0.0 http://maven.apache.org/xsd/maven-4.0.0.xsd",
        ));
        writer.write_event(Event::Start(project))?;

        self.write_simple(&mut writer, "modelVersion", "4.0.0")?;
        self.write_simple(&mut writer, "groupId", &self.coordinates.group_id)?;
        self.write_simple(&mut writer, "artifactId", &self.coordinates.artifact_id)?;
        self.write_simple(&mut writer, "version", self.coordinates.version().unwrap_or_default())?;
        self.write_simple(&mut writer, "packaging", self.packaging)?;

        if !self.dependencies.is_empty() {
            writer.write_event(Event::Start(BytesStart::new("dependencies")))?;
            for dependency in self.dependencies {
                writer.write_event(Event::Start(BytesStart::new("dependency")))?;
                self.write_simple(&mut writer, "groupId", &dependency.group_id)?;
                self.write_simple(&mut writer, "artifactId", &dependency.artifact_id)?;
                if let Some(version) = dependency.version() {
                    self.write_simple(&mut writer, "version", version)?;
                }
                if let Some(classifier) = dependency.classifier() {
                    self.write_simple(&mut writer, "classifier", classifier)?;
                }
                writer.write_event(Event::End(BytesEnd::new("dependency")))?;
            }
            writer.write_event(Event::End(BytesEnd::new("dependencies")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("project")))?;

        let bytes = writer.into_inner().into_inner();
        let mut xml = String::from_utf8(bytes)?;
        if !xml.ends_with('\n') {
            xml.push('\n');
        }
        Ok(xml)
    }

    fn write_simple(
        &self,
        writer: &mut Writer<Cursor<Vec<u8>>>,
        tag: &str,
        value: &str,
    ) -> Result<(), InstallError> {
        writer.write_event(Event::Start(BytesStart::new(tag)))?;
        writer.write_event(Event::Text(BytesText::new(value)))?;
        writer.write_event(Event::End(BytesEnd::new(tag)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CacheSettings, Context, Platform, ResolutionLevel, Scope};
    use crate::graph::RootDependency;
    use crate::resolver::Resolver;
    use crate::tests::FixtureRepository;

    #[test]
    fn install_writes_artifact_pom_and_sidecars() {
        let dir = tempfile::tempdir().expect("tempdir");
        let artifact = dir.path().join("build/demo.jar");
        fs::create_dir_all(artifact.parent().expect("parent")).expect("mkdir");
        fs::write(&artifact, b"demo-bytes").expect("write");

        let sink = LocalInstallSink::new(dir.path().join("repo"));
        let installed = sink
            .install(
                &InstallRequest::new(Coordinates::new("org.example", "demo", "1.0"))
                    .with_artifact(&artifact)
                    .with_dependencies(vec![Coordinates::new("org.example", "util", "2.0")]),
            )
            .expect("install");

        let jar = dir.path().join("repo/org/example/demo/1.0/demo-1.0.jar");
        let pom = dir.path().join("repo/org/example/demo/1.0/demo-1.0.pom");
        assert_eq!(installed.files, vec![jar.clone(), pom.clone()]);
        assert_eq!(fs::read(&jar).expect("jar"), b"demo-bytes");
        for algorithm in SIDECAR_ALGORITHMS {
            let sidecar = format!("{}.{}", jar.display(), algorithm.extension());
            assert_eq!(
                fs::read_to_string(sidecar).expect("sidecar"),
                algorithm.compute(b"demo-bytes")
            );
        }

        let xml = fs::read_to_string(&pom).expect("pom");
        let document = roxmltree::Document::parse(&xml).expect("valid xml");
        let artifact_ids: Vec<&str> = document
            .descendants()
            .filter(|node| node.has_tag_name("artifactId"))
            .filter_map(|node| node.text())
            .collect();
        assert_eq!(artifact_ids, vec!["demo", "util"]);
    }

    #[test]
    fn unversioned_coordinates_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = LocalInstallSink::new(dir.path());
        let error = sink
            .install(&InstallRequest::new(Coordinates::unversioned("org.example", "demo")))
            .expect_err("unversioned");
        assert!(matches!(error, InstallError::UnversionedCoordinates { .. }));
    }

    #[tokio::test]
    async fn installed_artifacts_resolve_without_remote_checksums() {
        let dir = tempfile::tempdir().expect("tempdir");
        let artifact = dir.path().join("demo.jar");
        fs::write(&artifact, b"installed").expect("write");
        let sink = LocalInstallSink::new(dir.path().join("installed"));
        sink.install(&InstallRequest::new(Coordinates::new("org.example", "demo", "1.0")).with_artifact(&artifact))
            .expect("install");
        // 信頼済みでなければ拒否されることを確かめるため、サイドカーを消しておく。
        for algorithm in SIDECAR_ALGORITHMS {
            let sidecar = dir
                .path()
                .join(format!("installed/org/example/demo/1.0/demo-1.0.jar.{}", algorithm.extension()));
            fs::remove_file(sidecar).expect("remove sidecar");
        }

        let empty_remote = FixtureRepository::new();
        let context = Context::builder()
            .scope(Scope::Compile)
            .platform(Platform::Jvm)
            .cache(CacheSettings::new(dir.path().join("cache")))
            .repository(empty_remote.remote())
            .install_sink(sink)
            .build()
            .expect("context");
        let graph = Resolver::new(context)
            .resolve(
                vec![RootDependency::regular(Coordinates::new("org.example", "demo", "1.0"))],
                ResolutionLevel::Network,
            )
            .await
            .expect("resolve");
        assert!(!graph.report().has_errors());
        let classpath = graph.classpath();
        assert_eq!(classpath.len(), 1);
        assert_eq!(fs::read(&classpath[0]).expect("read"), b"installed");
    }
}
