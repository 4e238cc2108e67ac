//! End-to-end resolution scenarios against `file://` fixture repositories.

mod support;

use std::collections::BTreeSet;

use jv_resolve::repository::config::FilterConfig;
use jv_resolve::{
    CacheSettings, Context, DiagnosticKind, ModuleKey, ResolutionLevel, Resolver, Severity,
};

use support::{MavenFixture, bom, classpath_names, regular, version_of};

const KTOR_BOM_MODULE: &str = r#"{
  "formatVersion": "1.1",
  "component": {"group": "io.ktor", "module": "ktor-bom", "version": "3.0.0"},
  "variants": [
    {
      "name": "apiElements",
      "attributes": {"org.gradle.category": "platform", "org.gradle.usage": "java-api"},
      "dependencyConstraints": [
        {"group": "io.ktor", "module": "ktor-client-core", "version": {"requires": "3.0.0"}}
      ]
    },
    {
      "name": "runtimeElements",
      "attributes": {"org.gradle.category": "platform", "org.gradle.usage": "java-runtime"},
      "dependencyConstraints": [
        {"group": "io.ktor", "module": "ktor-client-core", "version": {"requires": "3.0.0"}}
      ]
    }
  ]
}"#;

const JACKSON_ANNOTATIONS_MODULE: &str = r#"{
  "formatVersion": "1.1",
  "component": {"group": "com.fasterxml.jackson.core", "module": "jackson-annotations", "version": "2.18.3"},
  "variants": [
    {
      "name": "apiElements",
      "attributes": {"org.gradle.category": "library", "org.gradle.usage": "java-api", "org.gradle.jvm.environment": "standard-jvm"},
      "dependencies": [
        {"group": "com.fasterxml.jackson", "module": "jackson-bom", "version": {"requires": "2.18.3"}, "attributes": {"org.gradle.category": "platform"}}
      ],
      "files": [{"name": "jackson-annotations-2.18.3.jar", "url": "jackson-annotations-2.18.3.jar"}]
    },
    {
      "name": "runtimeElements",
      "attributes": {"org.gradle.category": "library", "org.gradle.usage": "java-runtime", "org.gradle.jvm.environment": "standard-jvm"},
      "dependencies": [
        {"group": "com.fasterxml.jackson", "module": "jackson-bom", "version": {"requires": "2.18.3"}, "attributes": {"org.gradle.category": "platform"}}
      ],
      "files": [{"name": "jackson-annotations-2.18.3.jar", "url": "jackson-annotations-2.18.3.jar"}]
    }
  ]
}"#;

fn jackson(fixture: &MavenFixture) {
    for version in ["2.18.2", "2.18.3"] {
        let core = format!("com.fasterxml.jackson.core:jackson-core:{version}");
        let annotations = format!("com.fasterxml.jackson.core:jackson-annotations:{version}");
        let databind = format!("com.fasterxml.jackson.core:jackson-databind:{version}");
        fixture.library(&core, &[]);
        fixture.library(&annotations, &[]);
        fixture.library(&databind, &[annotations.as_str(), core.as_str()]);
    }
    fixture.legacy_bom(
        "com.fasterxml.jackson:jackson-bom:2.18.3",
        &[
            "com.fasterxml.jackson.core:jackson-core:2.18.3",
            "com.fasterxml.jackson.core:jackson-annotations:2.18.3",
            "com.fasterxml.jackson.core:jackson-databind:2.18.3",
        ],
    );
}

#[tokio::test]
async fn bom_import_overrides_transitive_jackson_versions() {
    let fixture = MavenFixture::new();
    jackson(&fixture);

    let resolver = Resolver::new(fixture.context());
    let graph = resolver
        .resolve(
            vec![
                bom("com.fasterxml.jackson:jackson-bom:2.18.3"),
                regular("com.fasterxml.jackson.core:jackson-databind:2.18.2"),
            ],
            ResolutionLevel::Network,
        )
        .await
        .expect("resolve");

    let report = graph.report();
    assert!(!report.has_errors(), "{}", report.render(Severity::Info));
    assert_eq!(
        version_of(&graph, "com.fasterxml.jackson.core:jackson-databind:2.18.2").as_deref(),
        Some("2.18.3")
    );

    let names: BTreeSet<String> = classpath_names(&graph.classpath()).into_iter().collect();
    assert_eq!(
        names,
        BTreeSet::from([
            "jackson-annotations-2.18.3.jar".to_string(),
            "jackson-core-2.18.3.jar".to_string(),
            "jackson-databind-2.18.3.jar".to_string(),
        ])
    );

    let overrides: Vec<String> = report
        .entries()
        .iter()
        .filter(|entry| entry.message.kind == DiagnosticKind::VersionOverridden)
        .map(|entry| entry.message.text.clone())
        .collect();
    assert!(
        overrides.iter().any(|text| text.contains("2.18.2 -> 2.18.3")),
        "{overrides:?}"
    );
    assert!(graph.render_tree().contains("jackson-databind:2.18.2 -> 2.18.3"));
}

#[tokio::test]
async fn bom_reached_through_module_metadata_overrides_databind() {
    let fixture = MavenFixture::new();
    jackson(&fixture);
    fixture.module(
        "com.fasterxml.jackson.core:jackson-annotations:2.18.3",
        JACKSON_ANNOTATIONS_MODULE,
    );

    let graph = Resolver::new(fixture.context())
        .resolve(
            vec![
                regular("com.fasterxml.jackson.core:jackson-annotations:2.18.3"),
                regular("com.fasterxml.jackson.core:jackson-databind:2.18.2"),
            ],
            ResolutionLevel::Network,
        )
        .await
        .expect("resolve");

    let report = graph.report();
    assert!(!report.has_errors(), "{}", report.render(Severity::Info));
    assert_eq!(
        version_of(&graph, "com.fasterxml.jackson.core:jackson-databind:2.18.2").as_deref(),
        Some("2.18.3")
    );
    assert!(
        report
            .entries()
            .iter()
            .filter(|entry| entry.message.kind == DiagnosticKind::VersionOverridden)
            .any(|entry| entry.message.text.contains("2.18.2 -> 2.18.3"))
    );
    let names: BTreeSet<String> = classpath_names(&graph.classpath()).into_iter().collect();
    assert_eq!(
        names,
        BTreeSet::from([
            "jackson-annotations-2.18.3.jar".to_string(),
            "jackson-core-2.18.3.jar".to_string(),
            "jackson-databind-2.18.3.jar".to_string(),
        ])
    );

    let insight = graph
        .filter(
            &ModuleKey::new("com.fasterxml.jackson.core", "jackson-databind"),
            true,
        )
        .render_tree();
    assert!(insight.contains("jackson-databind:2.18.2 -> 2.18.3"), "{insight}");
    assert!(insight.contains("jackson-databind:2.18.3 (c)"), "{insight}");
    assert!(insight.contains("jackson-bom:2.18.3"), "{insight}");
    assert!(!insight.contains("jackson-core"), "{insight}");
}

#[tokio::test]
async fn unversioned_dependency_reports_one_error_and_siblings_still_resolve() {
    let fixture = MavenFixture::new();
    fixture.library("org.example:other:1.0", &[]);

    let resolver = Resolver::new(fixture.context());
    let graph = resolver
        .resolve(
            vec![regular("org.example:lib"), regular("org.example:other:1.0")],
            ResolutionLevel::Network,
        )
        .await
        .expect("resolve");

    let report = graph.report();
    assert!(report.has_errors());
    assert_eq!(report.count(DiagnosticKind::UnspecifiedDependencyVersion), 1);
    let error = report.errors().next().expect("error entry");
    assert_eq!(error.subject, "org.example:lib");
    assert_eq!(classpath_names(&graph.classpath()), vec!["other-1.0.jar"]);
}

#[tokio::test]
async fn transitive_pom_dependency_without_version_is_reported() {
    let fixture = MavenFixture::new();
    fixture.pom(
        "org.example:app:1.0",
        "<dependencies><dependency><groupId>org.example</groupId><artifactId>lib</artifactId></dependency></dependencies>",
    );
    fixture.jar("org.example:app:1.0");

    let graph = Resolver::new(fixture.context())
        .resolve(vec![regular("org.example:app:1.0")], ResolutionLevel::Network)
        .await
        .expect("resolve");

    let report = graph.report();
    assert_eq!(report.count(DiagnosticKind::UnspecifiedDependencyVersion), 1);
    let error = report.errors().next().expect("error entry");
    assert_eq!(error.subject, "org.example:lib");
    assert_eq!(classpath_names(&graph.classpath()), vec!["app-1.0.jar"]);
}

#[tokio::test]
async fn bom_fills_transitive_pom_dependency_without_version() {
    let fixture = MavenFixture::new();
    fixture.pom(
        "org.example:app:1.0",
        "<dependencies><dependency><groupId>org.example</groupId><artifactId>lib</artifactId></dependency></dependencies>",
    );
    fixture.jar("org.example:app:1.0");
    fixture.library("org.example:lib:2.0", &[]);
    fixture.legacy_bom("org.example:example-bom:1.0", &["org.example:lib:2.0"]);

    let graph = Resolver::new(fixture.context())
        .resolve(
            vec![bom("org.example:example-bom:1.0"), regular("org.example:app:1.0")],
            ResolutionLevel::Network,
        )
        .await
        .expect("resolve");

    let report = graph.report();
    assert!(!report.has_errors(), "{}", report.render(Severity::Info));
    assert_eq!(version_of(&graph, "org.example:lib").as_deref(), Some("2.0"));
    let mut names = classpath_names(&graph.classpath());
    names.sort();
    assert_eq!(names, vec!["app-1.0.jar", "lib-2.0.jar"]);
}

#[tokio::test]
async fn platform_declared_as_regular_dependency_is_rejected() {
    let fixture = MavenFixture::new();
    fixture.module("io.ktor:ktor-bom:3.0.0", KTOR_BOM_MODULE);
    fixture.library("io.ktor:ktor-client-core:3.0.0", &[]);

    let resolver = Resolver::new(fixture.context());
    let graph = resolver
        .resolve(
            vec![
                regular("io.ktor:ktor-bom:3.0.0"),
                regular("io.ktor:ktor-client-core"),
            ],
            ResolutionLevel::Network,
        )
        .await
        .expect("resolve");

    let report = graph.report();
    assert_eq!(report.count(DiagnosticKind::BomDeclaredAsRegularDependency), 1);
    assert_eq!(report.count(DiagnosticKind::UnspecifiedDependencyVersion), 1);
    let ktor_bom = graph
        .find(&support::coordinates("io.ktor:ktor-bom:3.0.0"))
        .expect("bom node");
    assert!(graph.node(ktor_bom).children.is_empty());
    assert!(graph.maven(ktor_bom).expect("maven").files.is_empty());
    assert!(graph.classpath().is_empty());
}

#[tokio::test]
async fn platform_imported_as_bom_constrains_unversioned_dependency() {
    let fixture = MavenFixture::new();
    fixture.module("io.ktor:ktor-bom:3.0.0", KTOR_BOM_MODULE);
    fixture.library("io.ktor:ktor-client-core:3.0.0", &[]);

    let resolver = Resolver::new(fixture.context());
    let graph = resolver
        .resolve(
            vec![
                bom("io.ktor:ktor-bom:3.0.0"),
                regular("io.ktor:ktor-client-core"),
            ],
            ResolutionLevel::Network,
        )
        .await
        .expect("resolve");

    let report = graph.report();
    assert!(!report.has_errors(), "{}", report.render(Severity::Info));
    assert_eq!(
        version_of(&graph, "io.ktor:ktor-client-core").as_deref(),
        Some("3.0.0")
    );
    assert_eq!(
        classpath_names(&graph.classpath()),
        vec!["ktor-client-core-3.0.0.jar"]
    );
}

#[tokio::test]
async fn diamond_dependencies_share_a_node_and_stay_connected() {
    let fixture = MavenFixture::new();
    fixture.library("org.example:app:1.0", &["org.example:left:1.0", "org.example:right:1.0"]);
    fixture.library("org.example:left:1.0", &["org.example:base:1.0"]);
    fixture.library("org.example:right:1.0", &["org.example:base:1.0"]);
    fixture.library("org.example:base:1.0", &[]);

    let resolver = Resolver::new(fixture.context());
    let graph = resolver
        .resolve(vec![regular("org.example:app:1.0")], ResolutionLevel::Network)
        .await
        .expect("resolve");

    assert!(graph.is_consistent());
    assert_eq!(graph.len(), 5);
    let base = graph
        .find(&support::coordinates("org.example:base:1.0"))
        .expect("base");
    assert_eq!(graph.node(base).parents.len(), 2);
    assert_eq!(graph.reachable().len(), graph.len());
    assert_eq!(
        classpath_names(&graph.classpath()),
        vec!["app-1.0.jar", "left-1.0.jar", "right-1.0.jar", "base-1.0.jar"]
    );
}

#[tokio::test]
async fn resolution_is_independent_of_download_concurrency() {
    let fixture = MavenFixture::new();
    jackson(&fixture);
    fixture.library(
        "org.example:app:1.0",
        &[
            "com.fasterxml.jackson.core:jackson-databind:2.18.2",
            "com.fasterxml.jackson.core:jackson-core:2.18.3",
        ],
    );
    let roots = || {
        vec![
            regular("org.example:app:1.0"),
            regular("com.fasterxml.jackson.core:jackson-annotations:2.18.2"),
        ]
    };

    let serial = Resolver::new(fixture.builder().max_concurrent(1).build().expect("context"))
        .resolve(roots(), ResolutionLevel::Network)
        .await
        .expect("serial");
    let parallel = Resolver::new(fixture.builder().max_concurrent(16).build().expect("context"))
        .resolve(roots(), ResolutionLevel::Network)
        .await
        .expect("parallel");

    assert_eq!(serial.render_tree(), parallel.render_tree());
    assert_eq!(serial.classpath(), parallel.classpath());
    assert_eq!(serial.report(), parallel.report());
    assert_eq!(
        version_of(&serial, "com.fasterxml.jackson.core:jackson-databind:2.18.2").as_deref(),
        Some("2.18.2")
    );
    assert_eq!(
        version_of(&serial, "com.fasterxml.jackson.core:jackson-core:2.18.2").as_deref(),
        Some("2.18.3")
    );
}

#[tokio::test]
async fn missing_artifacts_are_reported_without_aborting() {
    let fixture = MavenFixture::new();
    fixture.pom("org.example:ghost:1.0", "");
    fixture.library("org.example:real:1.0", &[]);

    let resolver = Resolver::new(fixture.context());
    let graph = resolver
        .resolve(
            vec![regular("org.example:ghost:1.0"), regular("org.example:real:1.0")],
            ResolutionLevel::Network,
        )
        .await
        .expect("resolve");

    let report = graph.report();
    assert!(report.has_errors());
    assert!(report.errors().all(|entry| entry.subject == "org.example:ghost:1.0"));
    assert_eq!(classpath_names(&graph.classpath()), vec!["real-1.0.jar"]);
}

#[tokio::test]
async fn group_filters_keep_repositories_out_of_foreign_lookups() {
    let fixture = MavenFixture::new();
    fixture.library("org.example:lib:1.0", &[]);
    let corp_only = fixture.remote_repository().with_group_filter(FilterConfig {
        include_groups: vec!["com.corp.*".to_string()],
        exclude_groups: Vec::new(),
    });
    let context = Context::builder()
        .cache(CacheSettings::new(fixture.cache_root()))
        .repository(corp_only)
        .build()
        .expect("context");

    let graph = Resolver::new(context)
        .resolve(vec![regular("org.example:lib:1.0")], ResolutionLevel::Network)
        .await
        .expect("resolve");

    let report = graph.report();
    assert!(report.has_errors());
    assert!(report.errors().all(|entry| entry.subject == "org.example:lib:1.0"));
    assert!(graph.classpath().is_empty());
}
