//! Library metadata: Gradle module metadata first, Maven POM as the fallback.
//!
//! [`MetadataResolver`] turns one set of coordinates into the declarations,
//! constraints and files a graph node needs for the current [`Context`].

pub mod kmp;
pub mod module;
pub mod pom;

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::context::{Context, Platform};
use crate::coordinates::{Coordinates, ModuleKey, VersionRange};
use crate::diagnostics::{DiagnosticKind, Message, Payload};
use crate::files::{DependencyFile, FileError, FileOrigin, FileResolver};
use crate::remote::{BoxFuture, fetch_artifact_metadata};
use crate::repository::LocalRepository;

use self::kmp::ProjectStructure;
use self::module::{ModuleDependency, ModuleMetadata, Variant};
use self::pom::{EffectivePom, EffectivePomLoader, Exclusion, PomSource};

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("XML の解析に失敗しました: {message}")]
    Xml { message: String },
    #[error("必須要素 <{element}> がありません")]
    MissingElement { element: &'static str },
    #[error("JSON の解析に失敗しました: {source}")]
    Json {
        #[source]
        source: serde_json::Error,
    },
    #[error("親POMが循環しています: {coordinates}")]
    ParentCycle { coordinates: String },
    #[error("親POMの階層が上限 {limit} を超えました: {coordinates}")]
    ParentChainTooDeep { coordinates: String, limit: usize },
    #[error("{child} の親POM {parent} を解決できません")]
    ParentUnresolved {
        parent: String,
        child: String,
        #[source]
        source: Box<MetadataError>,
    },
    #[error("{coordinates} はどのリポジトリにも見つかりません")]
    NotFound { coordinates: String },
    #[error("{coordinates} を取得できません")]
    Unavailable {
        coordinates: String,
        messages: Vec<Message>,
    },
    #[error("アーカイブ {path:?} を読めません: {message}")]
    Archive { path: PathBuf, message: String },
    #[error("{path:?} の読み込みに失敗しました: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("解決がキャンセルされました")]
    Cancelled,
}

impl MetadataError {
    fn from_file(coordinates: &Coordinates, error: FileError) -> Self {
        match error {
            FileError::Cancelled => MetadataError::Cancelled,
            FileError::NotFound { .. } => MetadataError::NotFound {
                coordinates: coordinates.to_string(),
            },
            other => {
                let messages = if other.attempts().is_empty() {
                    vec![other.to_message()]
                } else {
                    other.attempts().to_vec()
                };
                MetadataError::Unavailable {
                    coordinates: coordinates.to_string(),
                    messages,
                }
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MetadataError::NotFound { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, MetadataError::Cancelled)
    }

    pub fn is_transient(&self) -> bool {
        match self {
            MetadataError::Unavailable { messages, .. } => messages.iter().any(Message::is_transient),
            MetadataError::ParentUnresolved { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    pub fn kind(&self) -> DiagnosticKind {
        match self {
            MetadataError::ParentUnresolved { .. }
            | MetadataError::ParentCycle { .. }
            | MetadataError::ParentChainTooDeep { .. } => DiagnosticKind::ParentPomUnresolved,
            MetadataError::Xml { .. }
            | MetadataError::MissingElement { .. }
            | MetadataError::Json { .. }
            | MetadataError::Archive { .. } => DiagnosticKind::MetadataUnreadable,
            _ => DiagnosticKind::UnableToResolveDependency,
        }
    }

    pub fn to_message(&self) -> Message {
        let children = match self {
            MetadataError::Unavailable { messages, .. } => messages.clone(),
            MetadataError::ParentUnresolved { source, .. } => vec![source.to_message()],
            _ => Vec::new(),
        };
        Message::error(self.kind(), self.to_string()).with_children(children)
    }
}

/// 依存の宣言方法。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeclarationKind {
    Regular,
    /// `platform(...)` / `<scope>import</scope>` による BOM の取り込み。
    BomImport,
}

/// メタデータから得た子依存の宣言。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declaration {
    pub coordinates: Coordinates,
    pub kind: DeclarationKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclusions: Vec<Exclusion>,
    #[serde(default)]
    pub strict: bool,
}

impl Declaration {
    pub fn regular(coordinates: Coordinates) -> Self {
        Self {
            coordinates,
            kind: DeclarationKind::Regular,
            exclusions: Vec::new(),
            strict: false,
        }
    }

    pub fn bom(coordinates: Coordinates) -> Self {
        Self {
            kind: DeclarationKind::BomImport,
            ..Self::regular(coordinates)
        }
    }

    fn from_module_dependency(dependency: &ModuleDependency) -> Self {
        let coordinates = match dependency.resolved_version() {
            Some(version) => Coordinates::new(&dependency.group, &dependency.module, version),
            None => Coordinates::unversioned(&dependency.group, &dependency.module),
        };
        Self {
            coordinates,
            kind: if dependency.is_platform() {
                DeclarationKind::BomImport
            } else {
                DeclarationKind::Regular
            },
            exclusions: dependency
                .excludes
                .iter()
                .map(|rule| Exclusion::new(&rule.group, &rule.module))
                .collect(),
            strict: dependency.is_strict(),
        }
    }
}

/// BOM やライブラリが公開するバージョン制約。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintDeclaration {
    pub key: ModuleKey,
    pub version: String,
    #[serde(default)]
    pub strict: bool,
}

impl ConstraintDeclaration {
    fn from_module_dependency(dependency: &ModuleDependency) -> Option<Self> {
        Some(Self {
            key: dependency.key(),
            version: dependency.resolved_version()?.to_string(),
            strict: dependency.is_strict(),
        })
    }
}

/// 公開物の種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Publication {
    Library,
    /// モジュールメタデータで `platform` として公開された BOM。
    Platform,
    /// `pom` パッケージングで dependencyManagement を持つ従来型 BOM。
    LegacyBom,
    /// 成果物も dependencyManagement も持たない `pom` パッケージング。
    Aggregator,
}

impl Publication {
    pub fn is_bom(&self) -> bool {
        matches!(self, Publication::Platform | Publication::LegacyBom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetadataSource {
    ModuleMetadata,
    Pom,
}

/// 1ノード分の解決結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMetadata {
    pub coordinates: Coordinates,
    pub source: Option<MetadataSource>,
    pub publication: Publication,
    pub dependencies: Vec<Declaration>,
    pub constraints: Vec<ConstraintDeclaration>,
    pub files: Vec<DependencyFile>,
    pub messages: Vec<Message>,
}

impl ResolvedMetadata {
    fn empty(coordinates: &Coordinates, source: Option<MetadataSource>, publication: Publication) -> Self {
        Self {
            coordinates: coordinates.clone(),
            source,
            publication,
            dependencies: Vec::new(),
            constraints: Vec::new(),
            files: Vec::new(),
            messages: Vec::new(),
        }
    }

    fn failed(coordinates: &Coordinates, message: Message) -> Self {
        let mut resolved = Self::empty(coordinates, None, Publication::Library);
        resolved.messages.push(message);
        resolved
    }

    pub fn has_errors(&self) -> bool {
        self.messages.iter().any(Message::is_error)
    }
}

fn base_coordinates(coords: &Coordinates) -> Coordinates {
    Coordinates {
        classifier: None,
        extension: None,
        ..coords.clone()
    }
}

/// POM の packaging から主成果物の拡張子を決める。`pom` は成果物なし。
fn packaging_extension(packaging: &str) -> Option<&str> {
    match packaging {
        "pom" => None,
        "" | "jar" | "bundle" | "maven-plugin" | "eclipse-plugin" => Some("jar"),
        other => Some(other),
    }
}

/// `-sources.jar` を主成果物の隣に置く。
fn sources_for(files: &[DependencyFile]) -> Option<DependencyFile> {
    let main = files
        .iter()
        .find(|file| file.extension == "jar" && file.origin == FileOrigin::Download)?;
    let stem = main.file_name.strip_suffix(".jar")?;
    Some(DependencyFile {
        coordinates: main.coordinates.clone().with_classifier("sources"),
        file_name: format!("{stem}-sources.jar"),
        extension: "jar".to_string(),
        expected: Vec::new(),
        optional: true,
        origin: FileOrigin::Download,
        path: None,
    })
}

/// メタデータ解決器。同一解決内で POM の展開結果を共有する。
pub struct MetadataResolver {
    context: Context,
    files: FileResolver,
    poms: EffectivePomLoader,
}

impl PomSource for MetadataResolver {
    fn load_pom<'a>(&'a self, coords: &'a Coordinates) -> BoxFuture<'a, Result<String, MetadataError>> {
        Box::pin(async move {
            let bytes = self.fetch_metadata_file(coords, "pom").await?;
            String::from_utf8(bytes).map_err(|error| MetadataError::Xml {
                message: error.to_string(),
            })
        })
    }
}

impl MetadataResolver {
    pub fn new(context: Context) -> Self {
        let files = FileResolver::new(context.clone());
        Self {
            context,
            files,
            poms: EffectivePomLoader::new(),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn files(&self) -> &FileResolver {
        &self.files
    }

    async fn fetch_metadata_file(
        &self,
        coords: &Coordinates,
        extension: &str,
    ) -> Result<Vec<u8>, MetadataError> {
        let base = base_coordinates(coords);
        let file = DependencyFile::artifact(&base, extension).ok_or_else(|| {
            MetadataError::NotFound {
                coordinates: base.to_string(),
            }
        })?;
        let path = self
            .files
            .fetch(&file)
            .await
            .map_err(|error| MetadataError::from_file(&base, error))?;
        tokio::fs::read(&path)
            .await
            .map_err(|source| MetadataError::Io { path, source })
    }

    /// `.module` を読む。公開されていなければ `None`。
    pub async fn load_module(&self, coords: &Coordinates) -> Result<Option<ModuleMetadata>, MetadataError> {
        match self.fetch_metadata_file(coords, "module").await {
            Ok(bytes) => ModuleMetadata::parse(&bytes).map(Some),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error),
        }
    }

    pub async fn load_pom(&self, coords: &Coordinates) -> Result<Arc<EffectivePom>, MetadataError> {
        self.poms.load(self, &base_coordinates(coords)).await
    }

    /// 座標のメタデータを解決する。取得失敗は診断として結果に載せ、キャンセルのみ `Err` を返す。
    pub async fn resolve(&self, coords: &Coordinates) -> Result<ResolvedMetadata, MetadataError> {
        if self.context.is_cancelled() {
            return Err(MetadataError::Cancelled);
        }
        let module = self.load_module(coords).await;
        match module {
            Err(MetadataError::Cancelled) => Err(MetadataError::Cancelled),
            Ok(Some(module)) => {
                let pom = if module.is_platform() {
                    match self.load_pom(coords).await {
                        Ok(pom) => Some(pom),
                        Err(MetadataError::Cancelled) => return Err(MetadataError::Cancelled),
                        Err(error) => {
                            debug!(coordinates = %coords, %error, "BOM の POM を読めないためモジュールメタデータのみ使用します");
                            None
                        }
                    }
                } else {
                    None
                };
                self.from_module(coords, &module, pom.as_deref()).await
            }
            Ok(None) => match self.load_pom(coords).await {
                Ok(pom) => Ok(self.from_pom(coords, &pom)),
                Err(MetadataError::Cancelled) => Err(MetadataError::Cancelled),
                Err(error) => Ok(ResolvedMetadata::failed(coords, error.to_message())),
            },
            Err(module_error) => match self.load_pom(coords).await {
                Ok(pom) => {
                    warn!(coordinates = %coords, error = %module_error, "モジュールメタデータを読めないため POM で解決します");
                    let mut resolved = self.from_pom(coords, &pom);
                    resolved.messages.insert(
                        0,
                        Message::warning(
                            DiagnosticKind::PomResolvedWithMetadataErrors,
                            format!("{coords} はモジュールメタデータを読めなかったため POM から解決しました"),
                        )
                        .with_children(vec![module_error.to_message()]),
                    );
                    Ok(resolved)
                }
                Err(MetadataError::Cancelled) => Err(MetadataError::Cancelled),
                Err(pom_error) => Ok(ResolvedMetadata::failed(
                    coords,
                    Message::error(
                        DiagnosticKind::UnableToResolveDependency,
                        format!("{coords} のメタデータを解決できません"),
                    )
                    .with_children(vec![module_error.to_message(), pom_error.to_message()]),
                )),
            },
        }
    }

    fn from_pom(&self, coords: &Coordinates, pom: &EffectivePom) -> ResolvedMetadata {
        let publication = match (pom.packaging.as_str(), pom.dependency_management.is_empty()) {
            ("pom", false) => Publication::LegacyBom,
            ("pom", true) => Publication::Aggregator,
            _ => Publication::Library,
        };
        let mut resolved = ResolvedMetadata::empty(coords, Some(MetadataSource::Pom), publication);

        if publication == Publication::LegacyBom {
            resolved.constraints = pom
                .dependency_management
                .iter()
                .map(|(key, managed)| ConstraintDeclaration {
                    key: key.clone(),
                    version: managed.version.clone(),
                    strict: false,
                })
                .collect();
        }

        let Some(extension) = packaging_extension(&pom.packaging) else {
            resolved.dependencies = self.pom_dependencies(pom);
            return resolved;
        };

        let unsupported: BTreeSet<Platform> = self
            .context
            .platforms()
            .iter()
            .copied()
            .filter(|platform| !is_jvm(*platform))
            .collect();
        let payload = Payload::Platforms {
            unsupported: unsupported.clone(),
            supported: BTreeSet::from(["jvm".to_string()]),
        };
        if unsupported.len() == self.context.platforms().len() {
            resolved.messages.push(
                Message::error(
                    DiagnosticKind::PlatformsAreNotSupported,
                    format!("{coords} は要求されたプラットフォームをサポートしていません"),
                )
                .with_payload(payload),
            );
            return resolved;
        }
        if !unsupported.is_empty() {
            resolved.messages.push(
                Message::warning(
                    DiagnosticKind::PlatformsAreNotSupported,
                    format!("{coords} は一部のプラットフォームをサポートしていません"),
                )
                .with_payload(payload),
            );
        }

        resolved.dependencies = self.pom_dependencies(pom);
        let extension = coords.extension.as_deref().unwrap_or(extension);
        if let Some(file) = DependencyFile::artifact(coords, extension) {
            resolved.files.push(file);
        }
        self.push_sources(coords, &mut resolved.files);
        resolved
    }

    fn pom_dependencies(&self, pom: &EffectivePom) -> Vec<Declaration> {
        let scope = self.context.scope();
        pom.dependencies
            .iter()
            .filter(|dependency| {
                scope.includes_pom_scope(dependency.scope.as_deref())
                    && !dependency.optional
                    && !dependency.is_bom_import()
            })
            .map(|dependency| {
                if dependency.coordinates.version().is_none() {
                    debug!(
                        pom = %pom.coordinates,
                        dependency = %dependency.coordinates,
                        "バージョンの無い POM 依存は制約で補われなければエラーになります"
                    );
                }
                Declaration {
                    coordinates: dependency.coordinates.clone(),
                    kind: DeclarationKind::Regular,
                    exclusions: dependency.exclusions.clone(),
                    strict: false,
                }
            })
            .collect()
    }

    fn push_sources(&self, coords: &Coordinates, files: &mut Vec<DependencyFile>) {
        if self.context.download_sources() && coords.classifier().is_none() {
            if let Some(sources) = sources_for(files) {
                files.push(sources);
            }
        }
    }

    async fn from_module(
        &self,
        coords: &Coordinates,
        module: &ModuleMetadata,
        pom: Option<&EffectivePom>,
    ) -> Result<ResolvedMetadata, MetadataError> {
        if module.is_platform() {
            return Ok(self.from_platform_module(coords, module, pom));
        }

        let scope = self.context.scope();
        let selections: Vec<(Platform, Vec<&Variant>)> = self
            .context
            .platforms()
            .iter()
            .map(|platform| (*platform, module.select_variants(*platform, scope)))
            .collect();
        let unsupported: BTreeSet<Platform> = selections
            .iter()
            .filter(|(_, variants)| variants.is_empty())
            .map(|(platform, _)| *platform)
            .collect();
        let payload = Payload::Platforms {
            unsupported: unsupported.clone(),
            supported: module.supported_platforms(),
        };

        let multiplatform_library = module.is_multiplatform() && self.context.is_multiplatform();
        if unsupported.len() == selections.len() || (multiplatform_library && !unsupported.is_empty()) {
            return Ok(ResolvedMetadata::failed(
                coords,
                Message::error(
                    DiagnosticKind::PlatformsAreNotSupported,
                    format!("{coords} は要求されたプラットフォームをサポートしていません"),
                )
                .with_payload(payload),
            ));
        }
        if multiplatform_library {
            return self.from_multiplatform(coords, module, &selections).await;
        }

        let mut messages = Vec::new();
        if !unsupported.is_empty() {
            messages.push(
                Message::warning(
                    DiagnosticKind::PlatformsAreNotSupported,
                    format!("{coords} は一部のプラットフォームをサポートしていません"),
                )
                .with_payload(payload),
            );
        }
        let Some(variants) = selections
            .iter()
            .map(|(_, variants)| variants)
            .find(|variants| !variants.is_empty())
        else {
            return Ok(ResolvedMetadata::failed(
                coords,
                Message::error(
                    DiagnosticKind::PlatformsAreNotSupported,
                    format!("{coords} に利用可能なバリアントがありません"),
                ),
            ));
        };
        if variants.len() > 1 {
            let names: Vec<String> = variants.iter().map(|variant| variant.name.clone()).collect();
            messages.push(
                Message::warning(
                    DiagnosticKind::MoreThanOneVariant,
                    format!("{coords} で複数のバリアントが一致したため {} を使用します", names[0]),
                )
                .with_payload(Payload::Variants { names }),
            );
        }

        let mut resolved = self.from_variant(coords, variants[0]);
        messages.append(&mut resolved.messages);
        resolved.messages = messages;
        Ok(resolved)
    }

    fn from_variant(&self, coords: &Coordinates, variant: &Variant) -> ResolvedMetadata {
        let base = base_coordinates(coords);
        let mut resolved = ResolvedMetadata::empty(
            coords,
            Some(MetadataSource::ModuleMetadata),
            Publication::Library,
        );
        if let Some(available_at) = &variant.available_at {
            debug!(coordinates = %coords, target = %available_at.coordinates(), "available-at へ委譲");
            resolved
                .dependencies
                .push(Declaration::regular(available_at.coordinates()));
            return resolved;
        }
        resolved.dependencies = variant
            .dependencies
            .iter()
            .map(Declaration::from_module_dependency)
            .collect();
        resolved.constraints = variant
            .dependency_constraints
            .iter()
            .filter_map(ConstraintDeclaration::from_module_dependency)
            .collect();
        resolved.files = variant
            .files
            .iter()
            .map(|file| DependencyFile::from_variant_file(&base, file))
            .collect();
        self.push_sources(coords, &mut resolved.files);
        resolved
    }

    fn from_platform_module(
        &self,
        coords: &Coordinates,
        module: &ModuleMetadata,
        pom: Option<&EffectivePom>,
    ) -> ResolvedMetadata {
        let mut resolved = ResolvedMetadata::empty(
            coords,
            Some(MetadataSource::ModuleMetadata),
            Publication::Platform,
        );
        if let Some(variant) = module.platform_variant(self.context.scope()) {
            resolved.dependencies = variant
                .dependencies
                .iter()
                .map(Declaration::from_module_dependency)
                .collect();
            resolved.constraints = variant
                .dependency_constraints
                .iter()
                .filter_map(ConstraintDeclaration::from_module_dependency)
                .collect();
        }

        let Some(pom) = pom else {
            return resolved;
        };
        for (key, managed) in &pom.dependency_management {
            match resolved.constraints.iter().find(|constraint| &constraint.key == key) {
                Some(existing) if existing.version != managed.version => {
                    warn!(
                        bom = %coords,
                        module = %key,
                        module_metadata = %existing.version,
                        pom = %managed.version,
                        "BOM の制約がモジュールメタデータと POM で一致しません"
                    );
                    resolved.messages.push(
                        Message::warning(
                            DiagnosticKind::ConstraintSourcesDisagree,
                            format!(
                                "{key}: モジュールメタデータ {} と POM {} が一致しないため前者を採用します",
                                existing.version, managed.version
                            ),
                        )
                        .with_payload(Payload::ConstraintSources {
                            module_metadata: existing.version.clone(),
                            pom: managed.version.clone(),
                        }),
                    );
                }
                Some(_) => {}
                None => resolved.constraints.push(ConstraintDeclaration {
                    key: key.clone(),
                    version: managed.version.clone(),
                    strict: false,
                }),
            }
        }
        resolved
    }

    async fn from_multiplatform(
        &self,
        coords: &Coordinates,
        module: &ModuleMetadata,
        selections: &[(Platform, Vec<&Variant>)],
    ) -> Result<ResolvedMetadata, MetadataError> {
        let base = base_coordinates(coords);
        let missing = |detail: String, children: Vec<Message>| {
            ResolvedMetadata::failed(
                coords,
                Message::error(DiagnosticKind::KotlinMetadataMissing, detail).with_children(children),
            )
        };

        let Some((metadata_variant, metadata_file)) = module
            .kotlin_metadata_variant()
            .and_then(|variant| variant.files.first().map(|file| (variant, file)))
        else {
            return Ok(missing(
                format!("{coords} に kotlin-metadata バリアントのファイルがありません"),
                Vec::new(),
            ));
        };
        let archive = DependencyFile::from_variant_file(&base, metadata_file);
        let jar = match self.files.fetch(&archive).await {
            Ok(path) => path,
            Err(FileError::Cancelled) => return Err(MetadataError::Cancelled),
            Err(error) => {
                return Ok(missing(
                    format!("{coords} の metadata jar を取得できません"),
                    vec![error.to_message()],
                ));
            }
        };

        let structure = match read_structure(&jar).await {
            Ok(Some(structure)) => structure,
            Ok(None) => {
                return Ok(missing(
                    format!("{coords} の metadata jar にプロジェクト構造がありません"),
                    Vec::new(),
                ));
            }
            Err(error) => {
                return Ok(missing(
                    format!("{coords} のプロジェクト構造を読めません"),
                    vec![error.to_message()],
                ));
            }
        };

        let variant_names: Vec<&str> = selections
            .iter()
            .filter_map(|(_, variants)| variants.first().map(|variant| variant.base_name()))
            .collect();
        let Some(common) = structure.common_source_sets(variant_names.iter().copied()) else {
            return Ok(missing(
                format!("{coords} のプロジェクト構造にバリアント {variant_names:?} の記述がありません"),
                Vec::new(),
            ));
        };

        let mut resolved = ResolvedMetadata::empty(
            coords,
            Some(MetadataSource::ModuleMetadata),
            Publication::Library,
        );
        resolved.dependencies = common_dependencies(&structure, &common, metadata_variant);
        resolved.constraints = metadata_variant
            .dependency_constraints
            .iter()
            .filter_map(ConstraintDeclaration::from_module_dependency)
            .collect();

        let archived = archived_sets(&jar).await.unwrap_or_default();
        for source_set in &common {
            let layout = structure
                .source_set(source_set)
                .and_then(|set| set.binary_layout.as_deref());
            if layout.is_some_and(|layout| layout != "klib") {
                continue;
            }
            if archived.contains(source_set) {
                resolved
                    .files
                    .push(DependencyFile::extracted(&base, archive.clone(), source_set));
                continue;
            }
            match self
                .host_specific_archive(&structure, selections, source_set)
                .await?
            {
                Some(platform_archive) => resolved
                    .files
                    .push(DependencyFile::extracted(&base, platform_archive, source_set)),
                None => resolved.messages.push(Message::error(
                    DiagnosticKind::SourceSetUnavailable,
                    format!("{coords} のソースセット {source_set} を取得できません"),
                )),
            }
        }
        Ok(resolved)
    }

    /// ホスト固有のソースセットは、対応するプラットフォームモジュールの metadata jar にある。
    async fn host_specific_archive(
        &self,
        structure: &ProjectStructure,
        selections: &[(Platform, Vec<&Variant>)],
        source_set: &str,
    ) -> Result<Option<DependencyFile>, MetadataError> {
        for (_, variants) in selections {
            let Some(variant) = variants.first() else {
                continue;
            };
            let described = structure
                .variant(&variant.name)
                .is_some_and(|entry| entry.source_sets.iter().any(|name| name == source_set));
            let Some(available_at) = variant.available_at.as_ref().filter(|_| described) else {
                continue;
            };
            let platform_coords = available_at.coordinates();
            let platform_module = match self.load_module(&platform_coords).await {
                Ok(Some(platform_module)) => platform_module,
                Err(MetadataError::Cancelled) => return Err(MetadataError::Cancelled),
                Ok(None) => continue,
                Err(error) => {
                    debug!(module = %platform_coords, %error, "プラットフォームモジュールを読めません");
                    continue;
                }
            };
            let file = platform_module
                .variants
                .iter()
                .filter(|candidate| {
                    candidate.is_kotlin_metadata()
                        || candidate
                            .files
                            .iter()
                            .any(|file| file.name.ends_with("-metadata.jar"))
                })
                .find_map(|candidate| candidate.files.first());
            if let Some(file) = file {
                return Ok(Some(DependencyFile::from_variant_file(&platform_coords, file)));
            }
        }
        Ok(None)
    }

    /// バージョン範囲を各リポジトリの公開バージョンから解決する。
    pub async fn resolve_range(&self, coords: &Coordinates) -> Result<Option<String>, MetadataError> {
        let Some(range) = coords.version().and_then(VersionRange::parse) else {
            return Ok(coords.version().map(str::to_string));
        };
        let key = coords.key();
        let mut versions: BTreeSet<String> = BTreeSet::new();
        for local in self.context.local_repositories() {
            versions.extend(local_versions(local, coords));
        }

        let mut failures = Vec::new();
        for remote in self.context.remote_repositories_for(&coords.group_id) {
            if self.context.is_cancelled() {
                return Err(MetadataError::Cancelled);
            }
            match fetch_artifact_metadata(self.context.transport(), remote, &key).await {
                Ok(metadata) => versions.extend(metadata.versions().iter().cloned()),
                Err(error) if error.is_not_found() => {}
                Err(error) => {
                    let transient = error.is_transient();
                    failures.push(
                        Message::warning(
                            DiagnosticKind::UnresolvedVersionRange,
                            format!("{}: {error}", remote.name),
                        )
                        .with_transient(transient),
                    );
                }
            }
        }

        let selected = range
            .select_highest(versions.iter().map(String::as_str))
            .map(str::to_string);
        debug!(coordinates = %coords, selected = ?selected, candidates = versions.len(), "バージョン範囲を解決");
        match selected {
            None if !failures.is_empty() => Err(MetadataError::Unavailable {
                coordinates: coords.to_string(),
                messages: failures,
            }),
            selected => Ok(selected),
        }
    }
}

fn is_jvm(platform: Platform) -> bool {
    matches!(platform, Platform::Jvm | Platform::Android)
}

/// 共通ソースセットの moduleDependency を、metadata バリアントの宣言でバージョン付けする。
fn common_dependencies(
    structure: &ProjectStructure,
    common: &BTreeSet<String>,
    metadata_variant: &Variant,
) -> Vec<Declaration> {
    let declared: HashMap<ModuleKey, &ModuleDependency> = metadata_variant
        .dependencies
        .iter()
        .map(|dependency| (dependency.key(), dependency))
        .collect();
    let mut seen = BTreeSet::new();
    let mut dependencies = Vec::new();
    for source_set in common.iter().filter_map(|name| structure.source_set(name)) {
        for (group, module) in source_set.module_keys() {
            let key = ModuleKey::new(group, module);
            if !seen.insert(key.clone()) {
                continue;
            }
            dependencies.push(match declared.get(&key) {
                Some(dependency) => Declaration::from_module_dependency(dependency),
                None => Declaration::regular(Coordinates::unversioned(group, module)),
            });
        }
    }
    for dependency in metadata_variant
        .dependencies
        .iter()
        .filter(|dependency| dependency.is_platform())
    {
        if seen.insert(dependency.key()) {
            dependencies.push(Declaration::from_module_dependency(dependency));
        }
    }
    dependencies
}

fn local_versions(local: &LocalRepository, coords: &Coordinates) -> Vec<String> {
    let Some(module_dir) = local
        .version_dir(&coords.with_version("_"))
        .and_then(|dir| dir.parent().map(Path::to_path_buf))
    else {
        return Vec::new();
    };
    let Ok(entries) = std::fs::read_dir(&module_dir) else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .collect()
}

async fn read_structure(jar: &Path) -> Result<Option<ProjectStructure>, MetadataError> {
    let owned = jar.to_path_buf();
    tokio::task::spawn_blocking(move || kmp::read_project_structure(&owned))
        .await
        .map_err(|error| MetadataError::Archive {
            path: jar.to_path_buf(),
            message: error.to_string(),
        })?
}

async fn archived_sets(jar: &Path) -> Result<BTreeSet<String>, MetadataError> {
    let owned = jar.to_path_buf();
    tokio::task::spawn_blocking(move || kmp::archived_source_sets(&owned))
        .await
        .map_err(|error| MetadataError::Archive {
            path: jar.to_path_buf(),
            message: error.to_string(),
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Scope;
    use crate::tests::FixtureRepository;

    #[tokio::test]
    async fn pom_library_yields_jar_and_runtime_filtered_dependencies() {
        let repo = FixtureRepository::new();
        repo.pom(
            "org.example:app:1.0",
            r#"<dependencies>
                 <dependency><groupId>org.example</groupId><artifactId>api</artifactId><version>2.0</version></dependency>
                 <dependency><groupId>org.example</groupId><artifactId>rt</artifactId><version>2.0</version><scope>runtime</scope></dependency>
                 <dependency><groupId>org.example</groupId><artifactId>test</artifactId><version>2.0</version><scope>test</scope></dependency>
                 <dependency><groupId>org.example</groupId><artifactId>opt</artifactId><version>2.0</version><optional>true</optional></dependency>
               </dependencies>"#,
        );

        let compile = MetadataResolver::new(repo.context(Scope::Compile, &[Platform::Jvm]));
        let resolved = compile
            .resolve(&Coordinates::new("org.example", "app", "1.0"))
            .await
            .expect("resolve");
        assert_eq!(resolved.source, Some(MetadataSource::Pom));
        assert_eq!(resolved.publication, Publication::Library);
        let names: Vec<&str> = resolved
            .dependencies
            .iter()
            .map(|declaration| declaration.coordinates.artifact_id.as_str())
            .collect();
        assert_eq!(names, vec!["api"]);
        assert_eq!(resolved.files.len(), 1);
        assert_eq!(resolved.files[0].file_name, "app-1.0.jar");

        let runtime = MetadataResolver::new(repo.context(Scope::Runtime, &[Platform::Jvm]));
        let resolved = runtime
            .resolve(&Coordinates::new("org.example", "app", "1.0"))
            .await
            .expect("resolve");
        assert_eq!(resolved.dependencies.len(), 2);
    }

    #[tokio::test]
    async fn unmanaged_pom_dependency_keeps_an_unversioned_declaration() {
        let repo = FixtureRepository::new();
        repo.pom(
            "org.example:app:1.0",
            r#"<dependencies>
                 <dependency><groupId>org.example</groupId><artifactId>lib</artifactId></dependency>
               </dependencies>"#,
        );
        let resolver = MetadataResolver::new(repo.context(Scope::Compile, &[Platform::Jvm]));
        let resolved = resolver
            .resolve(&Coordinates::new("org.example", "app", "1.0"))
            .await
            .expect("resolve");
        assert_eq!(resolved.dependencies.len(), 1);
        assert_eq!(
            resolved.dependencies[0].coordinates,
            Coordinates::unversioned("org.example", "lib")
        );
        assert!(!resolved.has_errors());
    }

    #[tokio::test]
    async fn legacy_bom_exposes_dependency_management() {
        let repo = FixtureRepository::new();
        repo.pom_with_packaging(
            "org.example:example-bom:1.0",
            "pom",
            r#"<dependencyManagement><dependencies>
                 <dependency><groupId>org.example</groupId><artifactId>core</artifactId><version>1.5</version></dependency>
               </dependencies></dependencyManagement>"#,
        );
        let resolver = MetadataResolver::new(repo.context(Scope::Compile, &[Platform::Jvm]));
        let resolved = resolver
            .resolve(&Coordinates::new("org.example", "example-bom", "1.0"))
            .await
            .expect("resolve");
        assert_eq!(resolved.publication, Publication::LegacyBom);
        assert!(resolved.files.is_empty());
        assert_eq!(resolved.constraints.len(), 1);
        assert_eq!(resolved.constraints[0].version, "1.5");
    }

    #[tokio::test]
    async fn platform_module_prefers_module_metadata_over_pom() {
        let repo = FixtureRepository::new();
        repo.module(
            "io.ktor:ktor-bom:2.3.9",
            r#"{"formatVersion": "1.1", "variants": [
                 {"name": "apiElements", "attributes": {"org.gradle.category": "platform", "org.gradle.usage": "java-api"},
                  "dependencyConstraints": [{"group": "io.ktor", "module": "ktor-io", "version": {"requires": "2.3.9"}}]}
               ]}"#,
        );
        repo.pom_with_packaging(
            "io.ktor:ktor-bom:2.3.9",
            "pom",
            r#"<dependencyManagement><dependencies>
                 <dependency><groupId>io.ktor</groupId><artifactId>ktor-io</artifactId><version>2.3.8</version></dependency>
                 <dependency><groupId>io.ktor</groupId><artifactId>ktor-http</artifactId><version>2.3.9</version></dependency>
               </dependencies></dependencyManagement>"#,
        );
        let resolver = MetadataResolver::new(repo.context(Scope::Compile, &[Platform::Jvm]));
        let resolved = resolver
            .resolve(&Coordinates::new("io.ktor", "ktor-bom", "2.3.9"))
            .await
            .expect("resolve");
        assert_eq!(resolved.publication, Publication::Platform);
        let versions: Vec<(&str, &str)> = resolved
            .constraints
            .iter()
            .map(|constraint| (constraint.key.artifact_id.as_str(), constraint.version.as_str()))
            .collect();
        assert_eq!(versions, vec![("ktor-io", "2.3.9"), ("ktor-http", "2.3.9")]);
        assert_eq!(resolved.messages.len(), 1);
        assert_eq!(resolved.messages[0].kind, DiagnosticKind::ConstraintSourcesDisagree);
    }

    #[tokio::test]
    async fn broken_module_metadata_falls_back_to_pom_with_warning() {
        let repo = FixtureRepository::new();
        repo.publish("org/example/lib/1.0/lib-1.0.module", b"{ broken");
        repo.pom("org.example:lib:1.0", "");
        let resolver = MetadataResolver::new(repo.context(Scope::Compile, &[Platform::Jvm]));
        let resolved = resolver
            .resolve(&Coordinates::new("org.example", "lib", "1.0"))
            .await
            .expect("resolve");
        assert_eq!(resolved.source, Some(MetadataSource::Pom));
        assert_eq!(
            resolved.messages[0].kind,
            DiagnosticKind::PomResolvedWithMetadataErrors
        );
        assert_eq!(
            resolved.messages[0].children[0].kind,
            DiagnosticKind::MetadataUnreadable
        );
        assert!(!resolved.has_errors());
    }

    #[tokio::test]
    async fn missing_library_is_reported_once() {
        let repo = FixtureRepository::new();
        let resolver = MetadataResolver::new(repo.context(Scope::Compile, &[Platform::Jvm]));
        let resolved = resolver
            .resolve(&Coordinates::new("org.example", "missing", "1.0"))
            .await
            .expect("resolve");
        assert_eq!(resolved.messages.len(), 1);
        assert_eq!(
            resolved.messages[0].kind,
            DiagnosticKind::UnableToResolveDependency
        );
        assert!(!resolved.messages[0].is_transient());
    }

    #[tokio::test]
    async fn jvm_library_in_native_context_is_unsupported() {
        let repo = FixtureRepository::new();
        repo.pom("org.example:jvm-only:1.0", "");
        repo.jar("org.example:jvm-only:1.0");
        let resolver = MetadataResolver::new(repo.context(Scope::Compile, &[Platform::IosArm64]));
        let resolved = resolver
            .resolve(&Coordinates::new("org.example", "jvm-only", "1.0"))
            .await
            .expect("resolve");
        assert!(resolved.files.is_empty());
        assert_eq!(resolved.messages[0].kind, DiagnosticKind::PlatformsAreNotSupported);
        assert!(resolved.messages[0].is_error());

        let mixed = MetadataResolver::new(
            repo.context(Scope::Compile, &[Platform::Jvm, Platform::IosArm64]),
        );
        let resolved = mixed
            .resolve(&Coordinates::new("org.example", "jvm-only", "1.0"))
            .await
            .expect("resolve");
        assert_eq!(resolved.files.len(), 1);
        assert!(!resolved.messages[0].is_error());
        match &resolved.messages[0].payload {
            Some(Payload::Platforms { unsupported, .. }) => {
                assert_eq!(unsupported, &BTreeSet::from([Platform::IosArm64]));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn single_platform_follows_available_at() {
        let repo = FixtureRepository::new();
        repo.module("org.jetbrains.kotlinx:kotlinx-coroutines-core:1.6.4", crate::tests::COROUTINES_MODULE);
        let resolver = MetadataResolver::new(repo.context(Scope::Compile, &[Platform::Jvm]));
        let resolved = resolver
            .resolve(&Coordinates::new("org.jetbrains.kotlinx", "kotlinx-coroutines-core", "1.6.4"))
            .await
            .expect("resolve");
        assert!(resolved.files.is_empty());
        assert_eq!(
            resolved.dependencies,
            vec![Declaration::regular(Coordinates::new(
                "org.jetbrains.kotlinx",
                "kotlinx-coroutines-core-jvm",
                "1.6.4"
            ))]
        );
    }

    #[tokio::test]
    async fn multiplatform_context_uses_common_source_sets() {
        let repo = FixtureRepository::new();
        repo.coroutines_multiplatform();
        let resolver = MetadataResolver::new(
            repo.context(Scope::Compile, &[Platform::IosArm64, Platform::IosX64]),
        );
        let resolved = resolver
            .resolve(&Coordinates::new("org.jetbrains.kotlinx", "kotlinx-coroutines-core", "1.6.4"))
            .await
            .expect("resolve");
        assert!(!resolved.has_errors(), "{:?}", resolved.messages);
        let files: Vec<&str> = resolved.files.iter().map(|file| file.file_name.as_str()).collect();
        assert_eq!(
            files,
            vec![
                "kotlinx-coroutines-core-1.6.4-commonMain.klib",
                "kotlinx-coroutines-core-1.6.4-concurrentMain.klib",
                "kotlinx-coroutines-core-1.6.4-iosMain.klib",
                "kotlinx-coroutines-core-1.6.4-nativeMain.klib",
            ]
        );
        let ios_main = &resolved.files[2];
        match &ios_main.origin {
            FileOrigin::Extracted { archive, .. } => {
                assert_eq!(archive.coordinates.artifact_id, "kotlinx-coroutines-core-iosarm64");
            }
            other => panic!("unexpected origin: {other:?}"),
        }
        assert_eq!(
            resolved.dependencies[0].coordinates,
            Coordinates::new("org.jetbrains.kotlin", "kotlin-stdlib-common", "1.6.21")
        );

        let mut files = resolved.files.clone();
        let messages = resolver.files().materialize(&mut files).await.expect("materialize");
        assert!(messages.is_empty(), "{messages:?}");
        assert!(files.iter().all(|file| file.path.is_some()));
    }

    #[tokio::test]
    async fn multiplatform_context_rejects_partially_supported_library() {
        let repo = FixtureRepository::new();
        repo.coroutines_multiplatform();
        let resolver = MetadataResolver::new(
            repo.context(Scope::Compile, &[Platform::IosArm64, Platform::Js]),
        );
        let resolved = resolver
            .resolve(&Coordinates::new("org.jetbrains.kotlinx", "kotlinx-coroutines-core", "1.6.4"))
            .await
            .expect("resolve");
        assert!(resolved.files.is_empty());
        assert_eq!(resolved.messages[0].kind, DiagnosticKind::PlatformsAreNotSupported);
        assert!(resolved.messages[0].is_error());
    }

    #[tokio::test]
    async fn version_ranges_pick_highest_published_version() {
        let repo = FixtureRepository::new();
        repo.publish(
            "org/example/lib/maven-metadata.xml",
            br#"<metadata><versioning><versions>
                 <version>1.0</version><version>1.4</version><version>2.0</version><version>1.9-SNAPSHOT</version>
               </versions></versioning></metadata>"#,
        );
        let resolver = MetadataResolver::new(repo.context(Scope::Compile, &[Platform::Jvm]));
        let selected = resolver
            .resolve_range(&Coordinates::new("org.example", "lib", "[1.0,2.0)"))
            .await
            .expect("range");
        assert_eq!(selected.as_deref(), Some("1.4"));
        let none = resolver
            .resolve_range(&Coordinates::new("org.example", "lib", "[3.0,)"))
            .await
            .expect("range");
        assert!(none.is_none());
    }
}
