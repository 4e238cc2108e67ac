//! jv_resolve - Maven / Gradle module metadata dependency resolution for jv projects.
//!
//! Builds a deduplicated dependency graph for a resolution context (scope and
//! target platforms), resolves version conflicts, and materializes checksum
//! verified artifacts into a local cache. Kotlin Multiplatform libraries are
//! resolved per platform, with source-set metadata extracted for common code.

pub mod checksum;
pub mod conflict;
pub mod context;
pub mod coordinates;
pub mod diagnostics;
pub mod files;
pub mod graph;
pub mod incremental;
pub mod insights;
pub mod install;
pub mod logging;
pub mod metadata;
pub mod remote;
pub mod repository;
pub mod resolver;

pub use checksum::{Checksum, ChecksumError, HashAlgorithm};
pub use conflict::{ConflictStrategy, HighestVersionStrategy, resolve_conflicts};
pub use context::{
    CacheSettings, Context, ContextBuilder, ContextError, ContextKey, Platform, PlatformType,
    ResolutionLevel, Scope,
};
pub use coordinates::{CoordinateError, Coordinates, ModuleKey, Version, VersionRange};
pub use diagnostics::{DiagnosticKind, DiagnosticsReport, Message, Payload, Severity};
pub use files::{DependencyFile, FileError, FileOrigin, FileResolver};
pub use graph::{DependencyGraph, DependencyNode, NodeId, NodeKind, NodeState, RootDependency};
pub use incremental::{CacheError, CacheKey, CachedGraph, IncrementalCache, ResolvedGraph};
pub use insights::filter_graph;
pub use install::{InstallError, InstallRequest, InstalledArtifact, LocalInstallSink};
pub use logging::{LogLevel, LoggingConfigError, init_tracing};
pub use metadata::{MetadataError, MetadataResolver, Publication};
pub use remote::{HttpTransport, RemoteError, RetryConfig, Transport};
pub use repository::config::ResolveConfig;
pub use repository::{LocalRepository, RemoteRepository, Repository, RepositoryError};
pub use resolver::{ResolveError, Resolver};

#[cfg(test)]
mod tests;
