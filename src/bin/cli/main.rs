//! coldctr: offline exploration of containerd and Docker state on a dead
//! disk.
//!
//! The binary is a thin shell over the library's explorer contract: it
//! parses flags, picks the backend, and renders whatever the explorer
//! returns. Soft failures (missing optional files, per-container errors)
//! are reported as warnings and keep exit code 0; hard input errors
//! (unreadable databases, bad roots) exit non-zero.

mod output;

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use coldctr::{
    mount::parse_label_filter, ContainerExplorer, ContainerdExplorer, ContainerdOptions,
    DockerExplorer, DockerOptions, ExportOptions, SupportContainerPolicy,
};
use output::OutputFormat;

#[derive(Parser)]
#[command(name = "coldctr")]
#[command(version, about = "Explore container metadata on a dead disk", long_about = None)]
struct Cli {
    /// Mount point of the captured disk image
    #[arg(short, long, global = true)]
    image_root: Option<PathBuf>,

    /// containerd root directory (default: <image-root>/var/lib/containerd)
    #[arg(short, long, global = true)]
    containerd_root: Option<PathBuf>,

    /// docker root directory (default: <image-root>/var/lib/docker)
    #[arg(long, global = true)]
    docker_root: Option<PathBuf>,

    /// Path to the containerd metadata file (meta.db)
    #[arg(short, long, global = true)]
    metadata_file: Option<PathBuf>,

    /// Path to the snapshotter metadata file (metadata.db)
    #[arg(short, long, global = true)]
    snapshot_metadata_file: Option<PathBuf>,

    /// Only show records of this namespace
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    /// The containers are managed by Docker
    #[arg(long, global = true)]
    docker_managed: bool,

    /// YAML file describing Kubernetes support containers
    #[arg(long, global = true)]
    support_container_data: Option<PathBuf>,

    /// Resolve lower layers through cached layer symlinks when present
    #[arg(long, global = true)]
    use_layer_cache: bool,

    /// Cached layer directory within the snapshot root
    #[arg(long, global = true, default_value = "layers")]
    layer_cache: String,

    /// Output format
    #[arg(long, global = true, value_enum, default_value = "table")]
    output: OutputFormat,

    /// Write JSON output to this file instead of stdout
    #[arg(short, long, global = true)]
    output_file: Option<PathBuf>,

    /// Enable debug messages
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List namespaces, containers, images, content, snapshots, or tasks
    List {
        #[command(subcommand)]
        what: ListCommands,
    },

    /// Show detailed information about a container
    Info {
        /// Container id
        container_id: String,
        /// Only show the OCI runtime spec
        #[arg(long)]
        spec: bool,
    },

    /// Mount a container read-only
    Mount {
        /// Container id
        container_id: String,
        /// Mount point
        mountpoint: PathBuf,
    },

    /// Mount all containers under a directory
    MountAll {
        /// Mount point; each container mounts at <mountpoint>/<id>
        mountpoint: PathBuf,
        /// Comma-separated key=value label filter
        #[arg(long, default_value = "")]
        filter: String,
        /// Also mount Kubernetes support containers
        #[arg(long)]
        mount_support_containers: bool,
    },

    /// Identify container filesystem changes
    #[command(visible_alias = "diff")]
    Drift {
        /// Only this container
        #[arg(long)]
        container_id: Option<String>,
        /// Comma-separated key=value label filter
        #[arg(long, default_value = "")]
        filter: String,
        /// Also examine Kubernetes support containers
        #[arg(long)]
        mount_support_containers: bool,
    },

    /// Export a container as an archive or raw image
    Export {
        /// Container id
        container_id: String,
        /// Output directory
        output_dir: PathBuf,
        /// Produce a raw ext4 image (<id>.img)
        #[arg(long)]
        image: bool,
        /// Produce a gzip archive (<id>.tar.gz)
        #[arg(long)]
        archive: bool,
    },

    /// Export all containers
    ExportAll {
        /// Output directory
        output_dir: PathBuf,
        /// Comma-separated key=value label filter
        #[arg(long, default_value = "")]
        filter: String,
        /// Produce raw ext4 images
        #[arg(long)]
        image: bool,
        /// Produce gzip archives
        #[arg(long)]
        archive: bool,
        /// Also export Kubernetes support containers
        #[arg(long)]
        export_support_containers: bool,
    },
}

#[derive(Subcommand)]
enum ListCommands {
    Namespaces,
    Containers,
    Images,
    Content,
    Snapshots,
    Tasks,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(std::io::stderr)
        .init();

    let explorer = build_explorer(&cli)?;
    let result = run(&cli, explorer.as_ref());
    explorer.close();
    result
}

/// Pick and open the backend from the global flags.
fn build_explorer(cli: &Cli) -> Result<Box<dyn ContainerExplorer>> {
    let image_root = cli.image_root.clone().unwrap_or_default();
    let policy = match &cli.support_container_data {
        Some(path) => Some(
            SupportContainerPolicy::load(path)
                .with_context(|| format!("loading support container data {}", path.display()))?,
        ),
        None => None,
    };

    if cli.docker_managed {
        let docker_root = cli
            .docker_root
            .clone()
            .unwrap_or_else(|| image_root.join("var/lib/docker"));
        let explorer = DockerExplorer::open(DockerOptions {
            image_root,
            docker_root,
            containerd_root: cli.containerd_root.clone(),
            metadata_file: cli.metadata_file.clone(),
            policy,
        })
        .context("opening docker explorer")?;
        Ok(Box::new(explorer))
    } else {
        let containerd_root = cli
            .containerd_root
            .clone()
            .unwrap_or_else(|| image_root.join("var/lib/containerd"));
        let explorer = ContainerdExplorer::open(ContainerdOptions {
            image_root,
            containerd_root,
            metadata_file: cli.metadata_file.clone(),
            snapshot_metadata_file: cli.snapshot_metadata_file.clone(),
            policy,
            layer_cache: cli.use_layer_cache.then(|| cli.layer_cache.clone()),
        })
        .context("opening containerd explorer")?;
        Ok(Box::new(explorer))
    }
}

/// Privileged operations need a Linux host to execute mount/losetup/mkfs.
fn require_linux(operation: &str) -> Result<()> {
    if cfg!(target_os = "linux") {
        Ok(())
    } else {
        bail!("{operation} is only supported on Linux");
    }
}

fn run(cli: &Cli, explorer: &dyn ContainerExplorer) -> Result<()> {
    let format = cli.output;
    let output_file = cli.output_file.as_deref();

    match &cli.command {
        Commands::List { what } => match what {
            ListCommands::Namespaces => {
                let namespaces = match explorer.list_namespaces() {
                    Ok(n) => n,
                    Err(e) => return handle_list_failure(e, format, output_file),
                };
                output::output_records(&namespaces, format, output_file, |n| {
                    output::namespaces_table(n)
                })
            }
            ListCommands::Containers => {
                let mut containers = match explorer.list_containers() {
                    Ok(c) => c,
                    Err(e) => return handle_list_failure(e, format, output_file),
                };
                if let Some(ns) = &cli.namespace {
                    containers.retain(|c| &c.namespace == ns);
                }
                output::output_records(&containers, format, output_file, |c| {
                    output::containers_table(c)
                })
            }
            ListCommands::Images => {
                let mut images = match explorer.list_images() {
                    Ok(i) => i,
                    Err(e) => return handle_list_failure(e, format, output_file),
                };
                if let Some(ns) = &cli.namespace {
                    images.retain(|i| &i.namespace == ns);
                }
                output::output_records(&images, format, output_file, |i| {
                    output::images_table(i)
                })
            }
            ListCommands::Content => {
                let mut content = match explorer.list_content() {
                    Ok(c) => c,
                    Err(e) => return handle_list_failure(e, format, output_file),
                };
                if let Some(ns) = &cli.namespace {
                    content.retain(|c| &c.namespace == ns);
                }
                output::output_records(&content, format, output_file, |c| {
                    output::content_table(c)
                })
            }
            ListCommands::Snapshots => {
                let mut snapshots = match explorer.list_snapshots() {
                    Ok(s) => s,
                    Err(e) => return handle_list_failure(e, format, output_file),
                };
                if let Some(ns) = &cli.namespace {
                    snapshots.retain(|s| &s.namespace == ns);
                }
                output::output_records(&snapshots, format, output_file, |s| {
                    output::snapshots_table(s)
                })
            }
            ListCommands::Tasks => {
                let mut tasks = match explorer.list_tasks() {
                    Ok(t) => t,
                    Err(e) => return handle_list_failure(e, format, output_file),
                };
                if let Some(ns) = &cli.namespace {
                    tasks.retain(|t| &t.namespace == ns);
                }
                output::output_records(&tasks, format, output_file, |t| {
                    output::tasks_table(t)
                })
            }
        },

        Commands::Info { container_id, spec } => {
            let value = explorer
                .info_container(container_id, *spec)
                .with_context(|| format!("getting information for container {container_id}"))?;
            let json = serde_json::to_string_pretty(&value)?;
            match output_file {
                Some(path) => std::fs::write(path, json)
                    .with_context(|| format!("writing output file {}", path.display()))?,
                None => println!("{json}"),
            }
            Ok(())
        }

        Commands::Mount {
            container_id,
            mountpoint,
        } => {
            require_linux("mounting a container")?;
            explorer
                .mount_container(container_id, mountpoint)
                .with_context(|| format!("mounting container {container_id}"))?;
            println!(
                "container {} mounted read-only at {}",
                container_id,
                mountpoint.display()
            );
            Ok(())
        }

        Commands::MountAll {
            mountpoint,
            filter,
            mount_support_containers,
        } => {
            require_linux("mounting containers")?;
            let filter = parse_label_filter(filter);
            explorer
                .mount_all_containers(mountpoint, &filter, !mount_support_containers)
                .context("mounting all containers")?;
            println!("containers mounted under {}", mountpoint.display());
            Ok(())
        }

        Commands::Drift {
            container_id,
            filter,
            mount_support_containers,
        } => {
            require_linux("computing container drift")?;
            let filter = parse_label_filter(filter);
            let drifts = match explorer.container_drift(
                &filter,
                !mount_support_containers,
                container_id.as_deref(),
            ) {
                Ok(d) => d,
                Err(e) => return handle_list_failure(e, format, output_file),
            };
            output::output_records(&drifts, format, output_file, |d| output::drift_table(d))
        }

        Commands::Export {
            container_id,
            output_dir,
            image,
            archive,
        } => {
            require_linux("exporting a container")?;
            let options = export_options(*image, *archive);
            explorer
                .export_container(container_id, output_dir, options)
                .with_context(|| format!("exporting container {container_id}"))?;
            println!("container {} exported to {}", container_id, output_dir.display());
            Ok(())
        }

        Commands::ExportAll {
            output_dir,
            filter,
            image,
            archive,
            export_support_containers,
        } => {
            require_linux("exporting containers")?;
            let options = export_options(*image, *archive);
            let filter: BTreeMap<String, String> = parse_label_filter(filter);
            explorer
                .export_all_containers(output_dir, options, &filter, *export_support_containers)
                .context("exporting all containers")?;
            println!("containers exported to {}", output_dir.display());
            Ok(())
        }
    }
}

/// Archive is the default artifact when neither flag is given.
fn export_options(image: bool, archive: bool) -> ExportOptions {
    if !image && !archive {
        ExportOptions {
            image: false,
            archive: true,
        }
    } else {
        ExportOptions { image, archive }
    }
}

/// A failed listing is a soft error: warn, keep the output contract, and
/// exit 0.
fn handle_list_failure(
    error: coldctr::ExplorerError,
    format: OutputFormat,
    output_file: Option<&std::path::Path>,
) -> Result<()> {
    tracing::error!(error = %error, "listing failed");
    match format {
        OutputFormat::Table => eprintln!("[FAILED] {error}"),
        OutputFormat::Json | OutputFormat::JsonLine => output::write_empty_json(output_file),
    }
    Ok(())
}
