use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use roxmltree::{Document, Node};
use tracing::{debug, warn};

use super::MetadataError;
use crate::coordinates::{Coordinates, ModuleKey};
use crate::remote::BoxFuture;

/// Gradle が POM に埋め込む、モジュールメタデータ公開済みを示すマーカー。
pub const GRADLE_METADATA_MARKER: &str = "do_not_remove: published-with-gradle-metadata";

/// 親POMを辿る上限。
pub const MAX_PARENT_DEPTH: usize = 10;

const PROPERTY_PASSES: usize = 8;

/// 除外指定。`*` はワイルドカード。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Exclusion {
    pub group_id: String,
    pub artifact_id: String,
}

impl Exclusion {
    pub fn new(group_id: impl Into<String>, artifact_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            artifact_id: artifact_id.into(),
        }
    }

    pub fn matches(&self, key: &ModuleKey) -> bool {
        (self.group_id == "*" || self.group_id == key.group_id)
            && (self.artifact_id == "*" || self.artifact_id == key.artifact_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PomModel {
    pub group_id: Option<String>,
    pub artifact_id: Option<String>,
    pub version: Option<String>,
    pub packaging: Option<String>,
    pub parent: Option<PomParent>,
    pub properties: HashMap<String, String>,
    pub dependency_management: Vec<PomDependency>,
    pub dependencies: Vec<PomDependency>,
    pub published_with_gradle_metadata: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PomParent {
    pub group_id: String,
    pub artifact_id: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PomDependency {
    pub group_id: Option<String>,
    pub artifact_id: Option<String>,
    pub version: Option<String>,
    pub scope: Option<String>,
    pub optional: bool,
    pub exclusions: Vec<Exclusion>,
    pub classifier: Option<String>,
    pub dep_type: Option<String>,
}

impl PomDependency {
    fn is_bom_import(&self) -> bool {
        matches!(
            self.dep_type.as_deref(),
            Some(dep_type) if dep_type.eq_ignore_ascii_case("pom")
        ) && matches!(
            self.scope.as_deref(),
            Some(scope) if scope.eq_ignore_ascii_case("import")
        )
    }
}

impl PomModel {
    pub fn parse(xml: &str) -> Result<Self, MetadataError> {
        let normalized = normalize_xml_entities(xml);
        let document = Document::parse(normalized.as_ref()).map_err(|error| MetadataError::Xml {
            message: error.to_string(),
        })?;
        let project = document
            .descendants()
            .find(|node| node.has_tag_name("project"))
            .ok_or(MetadataError::MissingElement { element: "project" })?;

        let parent = project
            .children()
            .find(|node| node.is_element() && node.tag_name().name() == "parent")
            .map(parse_parent)
            .transpose()?;

        Ok(Self {
            group_id: node_text(&project, "groupId"),
            artifact_id: node_text(&project, "artifactId"),
            version: node_text(&project, "version"),
            packaging: node_text(&project, "packaging"),
            parent,
            properties: parse_properties(&project),
            dependency_management: parse_dependency_group(&project, "dependencyManagement")?,
            dependencies: parse_dependency_group(&project, "dependencies")?,
            published_with_gradle_metadata: xml.contains(GRADLE_METADATA_MARKER),
        })
    }
}

fn parse_parent(node: Node<'_, '_>) -> Result<PomParent, MetadataError> {
    let group_id = node_text(&node, "groupId").ok_or(MetadataError::MissingElement {
        element: "parent.groupId",
    })?;
    let artifact_id = node_text(&node, "artifactId").ok_or(MetadataError::MissingElement {
        element: "parent.artifactId",
    })?;
    let version = node_text(&node, "version").ok_or(MetadataError::MissingElement {
        element: "parent.version",
    })?;
    Ok(PomParent {
        group_id,
        artifact_id,
        version,
    })
}

fn parse_properties(node: &Node<'_, '_>) -> HashMap<String, String> {
    node.children()
        .find(|child| child.is_element() && child.tag_name().name() == "properties")
        .map(|props| {
            props
                .children()
                .filter(|child| child.is_element())
                .filter_map(|prop| {
                    let key = prop.tag_name().name().to_string();
                    let value = prop.text().map(|text| text.trim().to_string())?;
                    Some((key, value))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_dependency_group(
    node: &Node<'_, '_>,
    group_tag: &str,
) -> Result<Vec<PomDependency>, MetadataError> {
    let Some(group) = node
        .children()
        .find(|child| child.is_element() && child.tag_name().name() == group_tag)
    else {
        return Ok(Vec::new());
    };

    let deps_parent = if group.tag_name().name() == "dependencies" {
        group
    } else {
        match group
            .children()
            .find(|child| child.is_element() && child.tag_name().name() == "dependencies")
        {
            Some(dependencies) => dependencies,
            None => return Ok(Vec::new()),
        }
    };

    Ok(deps_parent
        .children()
        .filter(|child| child.is_element() && child.tag_name().name() == "dependency")
        .map(parse_dependency)
        .collect())
}

fn parse_dependency(node: Node<'_, '_>) -> PomDependency {
    let exclusions = node
        .children()
        .find(|child| child.is_element() && child.tag_name().name() == "exclusions")
        .map(|exclusions_node| {
            exclusions_node
                .children()
                .filter(|child| child.is_element() && child.tag_name().name() == "exclusion")
                .filter_map(|ex_node| {
                    let group = node_text(&ex_node, "groupId")?;
                    let artifact = node_text(&ex_node, "artifactId").unwrap_or_else(|| "*".into());
                    Some(Exclusion::new(group, artifact))
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    PomDependency {
        group_id: node_text(&node, "groupId"),
        artifact_id: node_text(&node, "artifactId"),
        version: node_text(&node, "version"),
        scope: node_text(&node, "scope"),
        optional: node_text(&node, "optional")
            .map(|value| value.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
        exclusions,
        classifier: node_text(&node, "classifier"),
        dep_type: node_text(&node, "type"),
    }
}

fn node_text(node: &Node<'_, '_>, tag: &str) -> Option<String> {
    node.children()
        .find(|child| child.is_element() && child.tag_name().name() == tag)
        .and_then(|child| child.text())
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

/// roxmltree が受け付けない未定義の実体参照を空白に置き換える。
fn normalize_xml_entities(input: &str) -> Cow<'_, str> {
    if !input.contains('&') {
        return Cow::Borrowed(input);
    }

    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '&' {
            output.push(ch);
            continue;
        }
        let mut entity = String::new();
        while let Some(&next) = chars.peek() {
            entity.push(next);
            chars.next();
            if next == ';' || entity.len() > 32 {
                break;
            }
        }
        match entity.strip_suffix(';') {
            Some(name)
                if ["lt", "gt", "amp", "quot", "apos"]
                    .iter()
                    .any(|known| name.eq_ignore_ascii_case(known))
                    || name.starts_with('#') =>
            {
                output.push('&');
                output.push_str(&entity);
            }
            Some(_) => output.push(' '),
            None => {
                output.push('&');
                output.push_str(&entity);
            }
        }
    }
    Cow::Owned(output)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedDependency {
    pub version: String,
    pub scope: Option<String>,
    pub optional: bool,
    pub classifier: Option<String>,
}

/// 親POMとプロパティを適用した後の依存宣言。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PomDeclaration {
    pub coordinates: Coordinates,
    pub scope: Option<String>,
    pub optional: bool,
    pub exclusions: Vec<Exclusion>,
    pub dep_type: Option<String>,
}

impl PomDeclaration {
    pub fn is_bom_import(&self) -> bool {
        self.dep_type
            .as_deref()
            .is_some_and(|dep_type| dep_type.eq_ignore_ascii_case("pom"))
            && self
                .scope
                .as_deref()
                .is_some_and(|scope| scope.eq_ignore_ascii_case("import"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectivePom {
    pub coordinates: Coordinates,
    pub packaging: String,
    pub properties: HashMap<String, String>,
    pub dependency_management: IndexMap<ModuleKey, ManagedDependency>,
    pub dependencies: Vec<PomDeclaration>,
    pub published_with_gradle_metadata: bool,
}

impl EffectivePom {
    pub fn from_model(
        coords: Coordinates,
        model: PomModel,
        parent: Option<&EffectivePom>,
    ) -> Result<Self, MetadataError> {
        let properties = property_context(&coords, &model, parent);

        let mut dependency_management = parent
            .map(|parent| parent.dependency_management.clone())
            .unwrap_or_default();
        for entry in model.dependency_management {
            let (Some(group), Some(artifact)) = (
                resolve_property(entry.group_id.as_deref(), &properties),
                resolve_property(entry.artifact_id.as_deref(), &properties),
            ) else {
                warn!(pom = %coords, "dependencyManagement に groupId/artifactId の無いエントリがあります。スキップします。");
                continue;
            };
            let Some(version) = resolve_property(entry.version.as_deref(), &properties) else {
                warn!(
                    group = %group,
                    artifact = %artifact,
                    "dependencyManagement エントリに version がありません。スキップします。"
                );
                continue;
            };
            dependency_management.insert(
                ModuleKey::new(group, artifact),
                ManagedDependency {
                    version,
                    scope: entry.scope,
                    optional: entry.optional,
                    classifier: entry.classifier,
                },
            );
        }

        let mut dependencies = Vec::new();
        for dependency in model.dependencies {
            let (Some(group), Some(artifact)) = (
                resolve_property(dependency.group_id.as_deref(), &properties),
                resolve_property(dependency.artifact_id.as_deref(), &properties),
            ) else {
                continue;
            };
            let key = ModuleKey::new(group.clone(), artifact.clone());
            let managed = dependency_management.get(&key);
            let version = resolve_property(dependency.version.as_deref(), &properties)
                .or_else(|| managed.map(|managed| managed.version.clone()));

            let mut coordinates = match version {
                Some(version) => Coordinates::new(group, artifact, version),
                None => Coordinates::unversioned(group, artifact),
            };
            if let Some(classifier) = dependency
                .classifier
                .clone()
                .or_else(|| managed.and_then(|value| value.classifier.clone()))
            {
                coordinates = coordinates.with_classifier(classifier);
            }

            dependencies.push(PomDeclaration {
                coordinates,
                scope: dependency
                    .scope
                    .clone()
                    .or_else(|| managed.and_then(|value| value.scope.clone())),
                optional: dependency.optional || managed.is_some_and(|value| value.optional),
                exclusions: dependency.exclusions.clone(),
                dep_type: dependency.dep_type.clone(),
            });
        }

        Ok(Self {
            coordinates: coords,
            packaging: model.packaging.unwrap_or_else(|| "jar".to_string()),
            properties,
            dependency_management,
            dependencies,
            published_with_gradle_metadata: model.published_with_gradle_metadata,
        })
    }

    /// BOM として利用できる (依存を持たず dependencyManagement を公開する) POM か。
    pub fn is_legacy_bom(&self) -> bool {
        self.packaging == "pom" && !self.dependency_management.is_empty()
    }
}

fn property_context(
    coords: &Coordinates,
    model: &PomModel,
    parent: Option<&EffectivePom>,
) -> HashMap<String, String> {
    let mut properties = parent
        .map(|parent| parent.properties.clone())
        .unwrap_or_default();
    properties.extend(model.properties.clone());
    properties.insert("project.groupId".to_string(), coords.group_id.clone());
    properties.insert("project.artifactId".to_string(), coords.artifact_id.clone());
    if let Some(version) = coords.version() {
        properties.insert("project.version".to_string(), version.to_string());
    }
    if let Some(parent_pom) = parent {
        let parent_coords = &parent_pom.coordinates;
        properties.insert(
            "project.parent.groupId".to_string(),
            parent_coords.group_id.clone(),
        );
        properties.insert(
            "project.parent.artifactId".to_string(),
            parent_coords.artifact_id.clone(),
        );
        if let Some(version) = parent_coords.version() {
            properties.insert("project.parent.version".to_string(), version.to_string());
        }
    }
    properties
}

/// `${...}` を解決する。未定義の参照が残る場合は `None`。
pub fn resolve_property(value: Option<&str>, properties: &HashMap<String, String>) -> Option<String> {
    let mut current = value?.trim().to_string();
    if current.is_empty() {
        return None;
    }

    let mut attempts = 0;
    while current.contains("${") {
        attempts += 1;
        if attempts > PROPERTY_PASSES {
            return None;
        }
        current = resolve_placeholders(&current, properties)?;
    }
    Some(current)
}

fn resolve_placeholders(raw: &str, properties: &HashMap<String, String>) -> Option<String> {
    let mut result = String::new();
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let suffix = &rest[start + 2..];
        let end = suffix.find('}')?;
        let key = &suffix[..end];
        let replacement = properties
            .get(key)
            .or_else(|| key.strip_prefix("pom.").and_then(|legacy| {
                properties.get(&format!("project.{legacy}"))
            }))?;
        result.push_str(replacement);
        rest = &suffix[end + 1..];
    }
    result.push_str(rest);
    Some(result)
}

/// POM 本文の取得元。
pub trait PomSource: Send + Sync {
    fn load_pom<'a>(&'a self, coords: &'a Coordinates) -> BoxFuture<'a, Result<String, MetadataError>>;
}

/// 親チェーンと import を展開した POM を組み立てる。1回の解決の間、結果を共有する。
#[derive(Debug, Default)]
pub struct EffectivePomLoader {
    memo: Mutex<HashMap<Coordinates, Arc<EffectivePom>>>,
}

impl EffectivePomLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(
        &self,
        source: &dyn PomSource,
        coords: &Coordinates,
    ) -> Result<Arc<EffectivePom>, MetadataError> {
        let mut stack = HashSet::new();
        self.load_inner(source, coords.clone(), &mut stack, 0).await
    }

    fn memoized(&self, coords: &Coordinates) -> Option<Arc<EffectivePom>> {
        self.memo
            .lock()
            .ok()
            .and_then(|memo| memo.get(coords).cloned())
    }

    fn remember(&self, coords: Coordinates, pom: Arc<EffectivePom>) {
        if let Ok(mut memo) = self.memo.lock() {
            memo.insert(coords, pom);
        }
    }

    fn load_inner<'a>(
        &'a self,
        source: &'a dyn PomSource,
        coords: Coordinates,
        stack: &'a mut HashSet<Coordinates>,
        depth: usize,
    ) -> BoxFuture<'a, Result<Arc<EffectivePom>, MetadataError>> {
        Box::pin(async move {
            if let Some(existing) = self.memoized(&coords) {
                return Ok(existing);
            }
            if depth > MAX_PARENT_DEPTH {
                return Err(MetadataError::ParentChainTooDeep {
                    coordinates: coords.to_string(),
                    limit: MAX_PARENT_DEPTH,
                });
            }
            if !stack.insert(coords.clone()) {
                return Err(MetadataError::ParentCycle {
                    coordinates: coords.to_string(),
                });
            }

            let text = source.load_pom(&coords).await?;
            let mut model = PomModel::parse(&text)?;

            let parent_effective = match &model.parent {
                Some(parent) => {
                    let parent_coords =
                        Coordinates::new(&parent.group_id, &parent.artifact_id, &parent.version);
                    let loaded = self
                        .load_inner(source, parent_coords.clone(), stack, depth + 1)
                        .await
                        .map_err(|error| MetadataError::ParentUnresolved {
                            parent: parent_coords.to_string(),
                            child: coords.to_string(),
                            source: Box::new(error),
                        })?;
                    Some(loaded)
                }
                None => None,
            };

            let properties = property_context(&coords, &model, parent_effective.as_deref());
            self.expand_imports(source, &mut model, &properties, stack, depth)
                .await?;

            stack.remove(&coords);

            let effective = Arc::new(EffectivePom::from_model(
                coords.clone(),
                model,
                parent_effective.as_deref(),
            )?);
            self.remember(coords, effective.clone());
            Ok(effective)
        })
    }

    async fn expand_imports(
        &self,
        source: &dyn PomSource,
        model: &mut PomModel,
        properties: &HashMap<String, String>,
        stack: &mut HashSet<Coordinates>,
        depth: usize,
    ) -> Result<(), MetadataError> {
        let mut retained = Vec::new();
        for entry in std::mem::take(&mut model.dependency_management) {
            if !entry.is_bom_import() {
                retained.push(entry);
                continue;
            }

            let (Some(group), Some(artifact), Some(version)) = (
                resolve_property(entry.group_id.as_deref(), properties),
                resolve_property(entry.artifact_id.as_deref(), properties),
                resolve_property(entry.version.as_deref(), properties),
            ) else {
                warn!("dependencyManagement import の座標を解決できません。スキップします。");
                continue;
            };

            let import_coords = Coordinates::new(group, artifact, version);
            debug!(bom = %import_coords, "dependencyManagement import を展開");
            let imported = self
                .load_inner(source, import_coords, stack, depth + 1)
                .await?;
            for (key, managed) in imported.dependency_management.iter() {
                retained.push(PomDependency {
                    group_id: Some(key.group_id.clone()),
                    artifact_id: Some(key.artifact_id.clone()),
                    version: Some(managed.version.clone()),
                    scope: managed.scope.clone(),
                    optional: managed.optional,
                    exclusions: Vec::new(),
                    classifier: managed.classifier.clone(),
                    dep_type: None,
                });
            }
        }
        model.dependency_management = retained;
        Ok(())
    }
}
