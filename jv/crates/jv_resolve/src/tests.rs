use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::checksum::HashAlgorithm;
use crate::context::{CacheSettings, Context, Platform, Scope};
use crate::coordinates::Coordinates;
use crate::metadata::kmp::tests::{STRUCTURE_JSON, write_jar};
use crate::metadata::kmp::PROJECT_STRUCTURE_ENTRY;
use crate::repository::RemoteRepository;

pub(crate) const COROUTINES_MODULE: &str = r#"{
  "formatVersion": "1.1",
  "component": {"group": "org.jetbrains.kotlinx", "module": "kotlinx-coroutines-core", "version": "1.6.4"},
  "variants": [
    {
      "name": "metadataApiElements",
      "attributes": {"org.gradle.category": "library", "org.gradle.usage": "kotlin-metadata", "org.jetbrains.kotlin.platform.type": "common"},
      "dependencies": [
        {"group": "org.jetbrains.kotlin", "module": "kotlin-stdlib-common", "version": {"requires": "1.6.21"}}
      ],
      "files": [{"name": "kotlinx-coroutines-core-metadata-1.6.4-all.jar", "url": "kotlinx-coroutines-core-1.6.4-all.jar"}]
    },
    {
      "name": "jvmApiElements-published",
      "attributes": {"org.gradle.category": "library", "org.gradle.usage": "java-api", "org.jetbrains.kotlin.platform.type": "jvm"},
      "available-at": {"url": "../../kotlinx-coroutines-core-jvm/1.6.4/kotlinx-coroutines-core-jvm-1.6.4.module", "group": "org.jetbrains.kotlinx", "module": "kotlinx-coroutines-core-jvm", "version": "1.6.4"}
    },
    {
      "name": "iosArm64ApiElements-published",
      "attributes": {"org.gradle.category": "library", "org.gradle.usage": "kotlin-api", "org.jetbrains.kotlin.native.target": "ios_arm64", "org.jetbrains.kotlin.platform.type": "native"},
      "available-at": {"url": "../../kotlinx-coroutines-core-iosarm64/1.6.4/kotlinx-coroutines-core-iosarm64-1.6.4.module", "group": "org.jetbrains.kotlinx", "module": "kotlinx-coroutines-core-iosarm64", "version": "1.6.4"}
    },
    {
      "name": "iosX64ApiElements-published",
      "attributes": {"org.gradle.category": "library", "org.gradle.usage": "kotlin-api", "org.jetbrains.kotlin.native.target": "ios_x64", "org.jetbrains.kotlin.platform.type": "native"},
      "available-at": {"url": "../../kotlinx-coroutines-core-iosx64/1.6.4/kotlinx-coroutines-core-iosx64-1.6.4.module", "group": "org.jetbrains.kotlinx", "module": "kotlinx-coroutines-core-iosx64", "version": "1.6.4"}
    }
  ]
}"#;

const COROUTINES_IOS_ARM64_MODULE: &str = r#"{
  "formatVersion": "1.1",
  "variants": [
    {
      "name": "iosArm64ApiElements-published",
      "attributes": {"org.gradle.category": "library", "org.gradle.usage": "kotlin-api", "org.jetbrains.kotlin.native.target": "ios_arm64", "org.jetbrains.kotlin.platform.type": "native"},
      "files": [{"name": "kotlinx-coroutines-core.klib", "url": "kotlinx-coroutines-core-iosarm64-1.6.4.klib"}]
    },
    {
      "name": "iosArm64MetadataElements-published",
      "attributes": {"org.gradle.category": "library", "org.gradle.usage": "kotlin-metadata", "org.jetbrains.kotlin.native.target": "ios_arm64", "org.jetbrains.kotlin.platform.type": "native"},
      "files": [{"name": "kotlinx-coroutines-core-iosarm64-1.6.4-metadata.jar", "url": "kotlinx-coroutines-core-iosarm64-1.6.4-metadata.jar"}]
    }
  ]
}"#;

/// `file://` で参照できる Maven 形式のテスト用リポジトリ。公開物には `.sha1` を添える。
pub(crate) struct FixtureRepository {
    root: TempDir,
    cache: TempDir,
}

impl FixtureRepository {
    pub(crate) fn new() -> Self {
        Self {
            root: tempfile::tempdir().expect("repository tempdir"),
            cache: tempfile::tempdir().expect("cache tempdir"),
        }
    }

    pub(crate) fn root(&self) -> &Path {
        self.root.path()
    }

    pub(crate) fn cache_root(&self) -> PathBuf {
        self.cache.path().to_path_buf()
    }

    pub(crate) fn publish(&self, relative: &str, bytes: &[u8]) {
        let path = self.root.path().join(relative);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, bytes).expect("write artifact");
        fs::write(
            self.root.path().join(format!("{relative}.sha1")),
            HashAlgorithm::Sha1.compute(bytes),
        )
        .expect("write sha1");
    }

    fn path_of(coords: &str, extension: &str) -> String {
        Coordinates::parse(coords)
            .expect("coordinates")
            .artifact_path(extension)
            .expect("versioned coordinates")
    }

    pub(crate) fn pom(&self, coords: &str, body: &str) {
        self.pom_with_packaging(coords, "jar", body);
    }

    pub(crate) fn pom_with_packaging(&self, coords: &str, packaging: &str, body: &str) {
        let parsed = Coordinates::parse(coords).expect("coordinates");
        let xml = format!(
            "<project><modelVersion>4.0.0</modelVersion><groupId>{}</groupId><artifactId>{}</artifactId><version>{}</version><packaging>{packaging}</packaging>{body}</project>",
            parsed.group_id,
            parsed.artifact_id,
            parsed.version().unwrap_or_default(),
        );
        self.publish(&Self::path_of(coords, "pom"), xml.as_bytes());
    }

    pub(crate) fn module(&self, coords: &str, json: &str) {
        self.publish(&Self::path_of(coords, "module"), json.as_bytes());
    }

    pub(crate) fn jar(&self, coords: &str) {
        self.publish(&Self::path_of(coords, "jar"), coords.as_bytes());
    }

    pub(crate) fn remote(&self) -> RemoteRepository {
        RemoteRepository::from_directory("fixture", self.root.path()).expect("fixture repository")
    }

    pub(crate) fn context(&self, scope: Scope, platforms: &[Platform]) -> Context {
        Context::builder()
            .scope(scope)
            .platforms(platforms.iter().copied())
            .cache(CacheSettings::new(self.cache.path()))
            .repository(self.remote())
            .build()
            .expect("context")
    }

    fn jar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("entries.jar");
        write_jar(&path, entries);
        fs::read(&path).expect("read jar")
    }

    /// ルートモジュールの metadata jar と、ホスト固有ソースセットを持つ iosArm64 モジュール。
    pub(crate) fn coroutines_multiplatform(&self) {
        let root = "org.jetbrains.kotlinx:kotlinx-coroutines-core:1.6.4";
        self.module(root, COROUTINES_MODULE);
        self.publish(
            "org/jetbrains/kotlinx/kotlinx-coroutines-core/1.6.4/kotlinx-coroutines-core-1.6.4-all.jar",
            &Self::jar_bytes(&[
                (PROJECT_STRUCTURE_ENTRY, STRUCTURE_JSON.as_bytes()),
                ("commonMain/default/manifest", b"unique_name=common"),
                ("concurrentMain/default/manifest", b"unique_name=concurrent"),
                ("nativeMain/default/manifest", b"unique_name=native"),
            ]),
        );

        let ios = "org.jetbrains.kotlinx:kotlinx-coroutines-core-iosarm64:1.6.4";
        self.module(ios, COROUTINES_IOS_ARM64_MODULE);
        self.publish(
            "org/jetbrains/kotlinx/kotlinx-coroutines-core-iosarm64/1.6.4/kotlinx-coroutines-core-iosarm64-1.6.4-metadata.jar",
            &Self::jar_bytes(&[("iosMain/default/manifest", b"unique_name=ios")]),
        );
    }
}

#[test]
fn fixture_repository_publishes_checksums() {
    let repo = FixtureRepository::new();
    repo.jar("org.example:demo:1.0");
    let jar = repo.root().join("org/example/demo/1.0/demo-1.0.jar");
    assert!(jar.is_file());
    let sha1 = fs::read_to_string(repo.root().join("org/example/demo/1.0/demo-1.0.jar.sha1"))
        .expect("sha1");
    assert_eq!(sha1, HashAlgorithm::Sha1.compute(b"org.example:demo:1.0"));
    assert!(repo.cache_root().is_dir());
}
