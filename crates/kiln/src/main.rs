use clap::Parser;
use colored::Colorize;
use kiln_build::{
    BuildOrchestrator, DockerEngine, FileStatusReporter, ProcessAssemblyStrategy, RegistryAuth,
    TokioProcessRunner,
};
use std::path::PathBuf;

/// コンテナ内で 1 回のビルドリクエストを実行するランナー
#[derive(Parser)]
#[command(name = "kiln")]
#[command(version)]
#[command(about = "Runs a containerized source-to-image build", long_about = None)]
struct Cli {
    /// ビルドリクエスト (JSON) のパス
    #[arg(long, env = "KILN_BUILD_REQUEST", default_value = "/tmp/build/request.json")]
    request: PathBuf,

    /// 前段のクローン処理が書き出したソースメタデータ (JSON) のパス
    #[arg(long, env = "KILN_SOURCE_INFO", default_value = "/tmp/build/source-info.json")]
    source_info: PathBuf,

    /// 最終ステータスを書き出すファイル。未指定ならログのみ
    #[arg(long, env = "KILN_STATUS_FILE")]
    status_file: Option<PathBuf>,

    /// アセンブリデリゲートのコマンド
    #[arg(long, default_value = "kiln-assemble")]
    assemble_command: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{} {}", "✗ Build failed:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let request = kiln_core::loader::load_build_request(&cli.request)?;
    let source_info = kiln_core::loader::load_source_info(&cli.source_info)?;

    println!(
        "{} {}/{}",
        "● Starting build".cyan().bold(),
        request.namespace,
        request.name
    );

    let docker = bollard::Docker::connect_with_local_defaults()
        .map_err(|e| anyhow::anyhow!("failed to connect to the container daemon: {}", e))?;

    let orchestrator = BuildOrchestrator::new(
        DockerEngine::new(docker),
        ProcessAssemblyStrategy::new(cli.assemble_command),
        TokioProcessRunner,
        FileStatusReporter::new(cli.status_file),
    )
    .with_auth(RegistryAuth::from_env());

    let status = orchestrator.run(&request, source_info.as_ref()).await?;

    match &status.output_digest {
        Some(digest) => println!(
            "{} {}",
            "✓ Build complete, pushed digest".green().bold(),
            digest
        ),
        None => println!("{}", "✓ Build complete".green().bold()),
    }
    Ok(())
}
