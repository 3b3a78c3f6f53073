use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use manager_runner::{
    AccessCommandInvocation, AccessConfig, ArchiveInput, AwsCredentials, ClusterConfig,
    ClusterConfigInvocation, ContainerSpec, CopyFromContainer, CopyToContainer, EnvList,
    ExitState, RunError, RunResult, RunnerConfig,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Exit status used when the operator interrupts a run.
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Parser)]
#[command(name = "managerctl", version, about = "Run a managed container to completion")]
struct Cli {
    #[command(flatten)]
    runner: RunnerConfig,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an arbitrary image with a shell command
    Run {
        /// Image reference
        image: String,
        /// Command evaluated by the entrypoint shell
        command: String,
        /// Entrypoint, one element per flag (default: /bin/sh -c)
        #[arg(long = "entrypoint", value_name = "ARG")]
        entrypoint: Vec<String>,
        /// Environment entry KEY=VALUE; later entries win
        #[arg(long = "env", short = 'e', value_name = "KEY=VALUE")]
        env: Vec<String>,
        /// Copy a local file or directory into the container before start
        #[arg(long = "copy-in", value_name = "SRC:DEST")]
        copy_in: Vec<String>,
        /// Copy a container path to a local directory after a zero exit
        #[arg(long = "copy-out", value_name = "SRC:DIR")]
        copy_out: Vec<String>,
        /// Allocate a TTY
        #[arg(long)]
        tty: bool,
    },
    /// Run the manager image against a cluster configuration file
    Cluster {
        /// Path to cluster configuration YAML
        #[arg(value_name = "FILE")]
        config: PathBuf,
        /// Command run once the cluster environment is loaded
        #[arg(long, default_value = "/root/install.sh")]
        entrypoint: String,
        /// Extra environment entry KEY=VALUE
        #[arg(long = "env", short = 'e', value_name = "KEY=VALUE")]
        env: Vec<String>,
        /// Copy a container path to a local directory after a zero exit
        #[arg(long = "copy-out", value_name = "SRC:DIR")]
        copy_out: Vec<String>,
    },
    /// Run a lightweight access command against an existing cluster
    Access {
        /// Manager image reference
        #[arg(long)]
        image: String,
        #[arg(long)]
        cluster_name: String,
        #[arg(long)]
        region: String,
        /// Command to run inside the manager image
        command: String,
    },
    /// Print version and exit
    Version,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let runner = cli.runner.managed_run();
    let quiet = cli.runner.quiet;

    let outcome = match cli.cmd {
        Commands::Run {
            image,
            command,
            entrypoint,
            env,
            copy_in,
            copy_out,
            tty,
        } => {
            let mut builder = ContainerSpec::builder(image, command)
                .tty(tty)
                .envs(parse_env(&env));
            if !entrypoint.is_empty() {
                builder = builder.entrypoint(entrypoint);
            }
            let copy_in = copy_in
                .iter()
                .map(|arg| parse_copy_in(arg))
                .collect::<Result<Vec<_>>>()?;
            let copy_out = copy_out
                .iter()
                .map(|arg| parse_copy_out(arg))
                .collect::<Result<Vec<_>>>()?;

            runner.run(&builder.build(), &copy_in, &copy_out).await
        }
        Commands::Cluster {
            config,
            entrypoint,
            env,
            copy_out,
        } => {
            let cluster = load_cluster_config(&config)?;
            let credentials = AwsCredentials::from_env()?;
            let copy_out = copy_out
                .iter()
                .map(|arg| parse_copy_out(arg))
                .collect::<Result<Vec<_>>>()?;
            let cache_dir = cli.runner.cache_dir();
            info!(
                cluster = %cluster.cluster_name,
                region = %cluster.region,
                cache_dir = %cache_dir.display(),
                "running manager against cluster configuration"
            );

            ClusterConfigInvocation {
                entrypoint: &entrypoint,
                config: &cluster,
                credentials: &credentials,
                cache_dir: &cache_dir,
                extra_env: parse_env(&env),
            }
            .run(&runner, &[], &copy_out)
            .await
        }
        Commands::Access {
            image,
            cluster_name,
            region,
            command,
        } => {
            let credentials = AwsCredentials::from_env()?;
            let access = AccessConfig {
                cluster_name,
                region,
                image_manager: image,
            };

            AccessCommandInvocation {
                entrypoint: &command,
                access: &access,
                credentials: &credentials,
            }
            .run(&runner, &[], &[])
            .await
        }
        Commands::Version => {
            println!("{}", manager_runner::VERSION);
            return Ok(());
        }
    };

    if quiet {
        match &outcome {
            Ok(result) => print_captured(&result.output)?,
            Err(RunError::ResultRetrieval { output, .. }) => print_captured(output)?,
            Err(_) => {}
        }
    }

    match outcome {
        Ok(result) => std::process::exit(exit_status(&result)),
        Err(RunError::Cancelled) => {
            eprintln!("{}", RunError::Cancelled);
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
        Err(err) => {
            let code = err.code();
            Err(err).with_context(|| format!("managed run failed [{}]", code))
        }
    }
}

/// Quiet runs stream nothing live, so the captured output is written once
/// the run has ended.
fn print_captured(output: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(output.as_bytes())
        .and_then(|()| stdout.flush())
        .context("Failed to write captured container output")
}

fn exit_status(result: &RunResult) -> i32 {
    match result.exit {
        ExitState::Exited(code) => i32::try_from(code).unwrap_or(1),
        ExitState::StillRunning => {
            warn!("container was still running when its output ended; no exit code available");
            1
        }
    }
}

fn parse_env(entries: &[String]) -> EnvList {
    let mut env = EnvList::new();
    for entry in entries {
        env.push_pair(entry);
    }
    env
}

fn split_directive<'a>(arg: &'a str, flag: &str) -> Result<(&'a str, &'a str)> {
    match arg.split_once(':') {
        Some((src, dest)) if !src.is_empty() && !dest.is_empty() => Ok((src, dest)),
        _ => bail!("{} expects SRC:DEST, got '{}'", flag, arg),
    }
}

/// `SRC:DEST` copies the local `SRC` into the container directory `DEST`,
/// keeping its file name.
fn parse_copy_in(arg: &str) -> Result<CopyToContainer> {
    let (src, dest) = split_directive(arg, "--copy-in")?;
    let name = Path::new(src)
        .file_name()
        .with_context(|| format!("--copy-in source '{}' has no file name", src))?;

    Ok(CopyToContainer::new(
        ArchiveInput::new().file(src, name.to_string_lossy().to_string()),
        dest,
    ))
}

fn parse_copy_out(arg: &str) -> Result<CopyFromContainer> {
    let (src, dir) = split_directive(arg, "--copy-out")?;
    Ok(CopyFromContainer::new(src, dir))
}

fn load_cluster_config(path: &Path) -> Result<ClusterConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read cluster configuration {}", path.display()))?;
    serde_yaml::from_str(&raw)
        .with_context(|| format!("Failed to parse cluster configuration {}", path.display()))
}
