//! Shared `file://` Maven repository fixture for integration tests.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use tempfile::TempDir;

use jv_resolve::remote::BoxFuture;
use jv_resolve::{
    CacheSettings, Context, ContextBuilder, Coordinates, DependencyGraph, HashAlgorithm,
    HttpTransport, LocalRepository, Platform, RemoteError, RemoteRepository, RetryConfig,
    RootDependency, Scope, Transport,
};

pub struct MavenFixture {
    remote: TempDir,
    cache: TempDir,
}

impl MavenFixture {
    pub fn new() -> Self {
        Self {
            remote: tempfile::tempdir().expect("remote tempdir"),
            cache: tempfile::tempdir().expect("cache tempdir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.remote.path()
    }

    pub fn cache_root(&self) -> PathBuf {
        self.cache.path().to_path_buf()
    }

    pub fn remote_repository(&self) -> RemoteRepository {
        RemoteRepository::from_directory("fixture", self.remote.path()).expect("fixture repository")
    }

    /// ファイルと `.sha1` サイドカーを書き込む。
    pub fn publish(&self, relative: &str, bytes: &[u8]) {
        write_with_sha1(self.remote.path(), relative, bytes);
    }

    pub fn pom(&self, coords: &str, body: &str) {
        self.pom_with_packaging(coords, "jar", body);
    }

    pub fn pom_with_packaging(&self, coords: &str, packaging: &str, body: &str) {
        let parsed = coordinates(coords);
        let xml = format!(
            "<project><modelVersion>4.0.0</modelVersion><groupId>{}</groupId><artifactId>{}</artifactId><version>{}</version><packaging>{packaging}</packaging>{body}</project>",
            parsed.group_id,
            parsed.artifact_id,
            parsed.version().unwrap_or_default(),
        );
        self.publish(&artifact_path(coords, "pom"), xml.as_bytes());
    }

    /// `dependencies` の各座標を compile スコープで宣言する POM と jar を公開する。
    pub fn library(&self, coords: &str, dependencies: &[&str]) {
        let body: String = dependencies
            .iter()
            .map(|dependency| {
                let parsed = coordinates(dependency);
                format!(
                    "<dependency><groupId>{}</groupId><artifactId>{}</artifactId><version>{}</version></dependency>",
                    parsed.group_id,
                    parsed.artifact_id,
                    parsed.version().unwrap_or_default()
                )
            })
            .collect();
        self.pom(coords, &format!("<dependencies>{body}</dependencies>"));
        self.jar(coords);
    }

    /// `dependencyManagement` だけを持つ従来型 BOM。
    pub fn legacy_bom(&self, coords: &str, managed: &[&str]) {
        let body: String = managed
            .iter()
            .map(|entry| {
                let parsed = coordinates(entry);
                format!(
                    "<dependency><groupId>{}</groupId><artifactId>{}</artifactId><version>{}</version></dependency>",
                    parsed.group_id,
                    parsed.artifact_id,
                    parsed.version().unwrap_or_default()
                )
            })
            .collect();
        self.pom_with_packaging(
            coords,
            "pom",
            &format!("<dependencyManagement><dependencies>{body}</dependencies></dependencyManagement>"),
        );
    }

    pub fn module(&self, coords: &str, json: &str) {
        self.publish(&artifact_path(coords, "module"), json.as_bytes());
    }

    pub fn jar(&self, coords: &str) {
        self.publish(&artifact_path(coords, "jar"), jar_contents(coords).as_bytes());
    }

    pub fn builder(&self) -> ContextBuilder {
        Context::builder()
            .scope(Scope::Compile)
            .platform(Platform::Jvm)
            .cache(CacheSettings::new(self.cache.path()))
            .repository(self.remote_repository())
    }

    pub fn context(&self) -> Context {
        self.builder().build().expect("context")
    }
}

pub fn write_with_sha1(root: &Path, relative: &str, bytes: &[u8]) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(&path, bytes).expect("write file");
    fs::write(
        root.join(format!("{relative}.sha1")),
        HashAlgorithm::Sha1.compute(bytes),
    )
    .expect("write sha1");
}

/// `~/.m2/repository` と同じ平坦レイアウトのローカルリポジトリ。
pub fn maven_local(root: &Path) -> LocalRepository {
    LocalRepository::maven_flat("m2", root)
}

pub fn coordinates(coords: &str) -> Coordinates {
    Coordinates::parse(coords).expect("coordinates")
}

pub fn artifact_path(coords: &str, extension: &str) -> String {
    coordinates(coords)
        .artifact_path(extension)
        .expect("versioned coordinates")
}

pub fn jar_contents(coords: &str) -> String {
    format!("jar:{coords}")
}

pub fn regular(coords: &str) -> RootDependency {
    RootDependency::regular(coordinates(coords))
}

pub fn bom(coords: &str) -> RootDependency {
    RootDependency::bom(coordinates(coords))
}

/// クラスパスのファイル名 (ディレクトリを除く) を並び順のまま返す。
pub fn classpath_names(paths: &[PathBuf]) -> Vec<String> {
    paths
        .iter()
        .filter_map(|path| path.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .collect()
}

pub fn version_of(graph: &DependencyGraph, coords: &str) -> Option<String> {
    let id = graph.find(&coordinates(coords))?;
    let winner = graph.winner(id);
    graph
        .maven(winner)?
        .coordinates
        .version()
        .map(str::to_string)
}

/// 要求された相対パスを記録しながら通常のトランスポートへ委ねる。
pub struct RecordingTransport {
    inner: HttpTransport,
    requests: Mutex<Vec<String>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            inner: HttpTransport::new(RetryConfig::default()).expect("transport"),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("requests").clone()
    }

    pub fn requested(&self, path: &str) -> bool {
        self.requests().iter().any(|request| request == path)
    }
}

impl Transport for RecordingTransport {
    fn get<'a>(
        &'a self,
        repository: &'a RemoteRepository,
        path: &'a str,
    ) -> BoxFuture<'a, Result<Bytes, RemoteError>> {
        self.requests.lock().expect("requests").push(path.to_string());
        self.inner.get(repository, path)
    }
}
