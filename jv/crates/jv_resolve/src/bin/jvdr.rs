// jvdr - jv dependency resolver front end
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context as _, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use jv_resolve::{
    CacheSettings, Context, ContextBuilder, Coordinates, DiagnosticsReport, InstallRequest,
    LocalInstallSink, LogLevel, Platform, ResolutionLevel, ResolveConfig, Resolver,
    RootDependency, Scope, Severity, init_tracing,
};

#[derive(Parser)]
#[command(name = "jvdr")]
#[command(about = "Resolve Maven / Kotlin Multiplatform dependencies for jv projects")]
struct Cli {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "WARN")]
    log_level: LogLevel,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    /// Resolver configuration file (defaults to ~/.jv/resolve.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve dependencies and print the classpath
    Resolve {
        #[command(flatten)]
        request: RequestArgs,
        /// Stop after metadata resolution without downloading artifacts
        #[arg(long, value_enum, default_value = "network")]
        level: LevelArg,
        /// Bypass the resolved graph cache
        #[arg(long)]
        no_cache: bool,
    },
    /// Print the resolved dependency tree
    Tree {
        #[command(flatten)]
        request: RequestArgs,
        /// Only show the paths leading to this module (group:artifact)
        #[arg(long, value_parser = Coordinates::parse)]
        filter: Option<Coordinates>,
        /// With --filter, only explain the resolved version
        #[arg(long, requires = "filter")]
        resolved_only: bool,
    },
    /// Install an artifact and a generated POM into the local install repository
    Install {
        /// Coordinates of the published artifact (group:artifact:version)
        #[arg(value_parser = Coordinates::parse)]
        coordinates: Coordinates,
        /// Artifact file to copy into the repository
        #[arg(long)]
        artifact: Option<PathBuf>,
        #[arg(long, default_value = "jar")]
        packaging: String,
        /// Dependencies recorded in the generated POM
        #[arg(long = "dependency", value_parser = Coordinates::parse)]
        dependencies: Vec<Coordinates>,
        #[arg(long)]
        install_root: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RequestArgs {
    /// Root dependencies (group:artifact[:version][:classifier])
    #[arg(value_parser = Coordinates::parse, required = true)]
    dependencies: Vec<Coordinates>,
    /// BOM / platform imports applied to the whole graph
    #[arg(long = "bom", value_parser = Coordinates::parse)]
    boms: Vec<Coordinates>,
    #[arg(long, default_value = "compile")]
    scope: Scope,
    /// Target platforms; repeat for multiplatform resolution
    #[arg(long = "platform", default_value = "jvm")]
    platforms: Vec<Platform>,
    /// Include artifacts installed with `jvdr install`
    #[arg(long)]
    use_installed: bool,
    #[arg(long)]
    install_root: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LevelArg {
    Partial,
    Network,
}

impl From<LevelArg> for ResolutionLevel {
    fn from(level: LevelArg) -> Self {
        match level {
            LevelArg::Partial => ResolutionLevel::Partial,
            LevelArg::Network => ResolutionLevel::Network,
        }
    }
}

impl RequestArgs {
    fn roots(&self) -> Vec<RootDependency> {
        self.boms
            .iter()
            .cloned()
            .map(RootDependency::bom)
            .chain(self.dependencies.iter().cloned().map(RootDependency::regular))
            .collect()
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match real_main().await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error:?}");
            ExitCode::FAILURE
        }
    }
}

async fn real_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_level, cli.log_json).context("ロギングの初期化に失敗しました")?;
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Resolve {
            request,
            level,
            no_cache,
        } => {
            let context = build_context(&config, &request, no_cache)?;
            let resolver = Resolver::new(context);
            let resolved = resolver
                .resolve_cached(request.roots(), level.into())
                .await
                .context("依存関係の解決に失敗しました")?;
            debug!(cached = resolved.is_cached(), "解決完了");
            if matches!(level, LevelArg::Network) {
                for path in resolved.classpath() {
                    println!("{}", path.display());
                }
            }
            Ok(report(&resolved.report()))
        }
        Commands::Tree {
            request,
            filter,
            resolved_only,
        } => {
            let context = build_context(&config, &request, true)?;
            let resolver = Resolver::new(context);
            let graph = resolver
                .resolve(request.roots(), ResolutionLevel::Partial)
                .await
                .context("依存関係の解決に失敗しました")?;
            match &filter {
                Some(module) => print!("{}", graph.filter(&module.key(), resolved_only).render_tree()),
                None => print!("{}", graph.render_tree()),
            }
            Ok(report(&graph.report()))
        }
        Commands::Install {
            coordinates,
            artifact,
            packaging,
            dependencies,
            install_root,
        } => {
            let sink = LocalInstallSink::new(install_root_or_default(install_root)?);
            let mut install = InstallRequest::new(coordinates)
                .with_packaging(packaging)
                .with_dependencies(dependencies);
            if let Some(artifact) = artifact {
                if !artifact.is_file() {
                    bail!("成果物ファイルが見つかりません: {}", artifact.display());
                }
                install = install.with_artifact(artifact);
            }
            let installed = sink
                .install(&install)
                .context("ローカルリポジトリへのインストールに失敗しました")?;
            for file in &installed.files {
                println!("{}", file.display());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ResolveConfig> {
    match path {
        Some(path) => ResolveConfig::load(path)
            .with_context(|| format!("設定ファイルを読み込めません: {}", path.display())),
        None => ResolveConfig::load_default().context("既定の設定ファイルを読み込めません"),
    }
}

fn install_root_or_default(root: Option<PathBuf>) -> Result<PathBuf> {
    match root {
        Some(root) => Ok(root),
        None => {
            let home = dirs::home_dir().context("ホームディレクトリを特定できません")?;
            Ok(home.join(".jv").join("install"))
        }
    }
}

fn build_context(config: &ResolveConfig, request: &RequestArgs, no_cache: bool) -> Result<Context> {
    let cancellation = CancellationToken::new();
    let on_interrupt = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("割り込みを受信したため解決を中断します");
            on_interrupt.cancel();
        }
    });

    let mut builder = ContextBuilder::from_config(config)
        .context("リポジトリ設定が不正です")?
        .scope(request.scope)
        .platforms(request.platforms.iter().copied())
        .cancellation(cancellation);
    if request.use_installed {
        let root = install_root_or_default(request.install_root.clone())?;
        builder = builder.install_sink(LocalInstallSink::new(root));
    }
    if no_cache {
        let root = match &config.cache_dir {
            Some(dir) => dir.clone(),
            None => CacheSettings::default_root()?,
        };
        let mut cache = CacheSettings::new(root);
        cache.incremental = false;
        builder = builder.cache(cache);
    }
    builder.build().context("解決コンテキストを構築できません")
}

fn report(report: &DiagnosticsReport) -> ExitCode {
    let rendered = report.render(Severity::Warning);
    if !rendered.is_empty() {
        eprint!("{rendered}");
    }
    if report.has_errors() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
