use std::{
	io::{self, BufWriter, Write},
	path::PathBuf,
	sync::Arc,
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use fixture_apply::{
	Applier, DirBundle, HarnessConfig, KubeStore, LiveStore, NamespaceLabels, Resource,
};
use kube::config::Kubeconfig;
use tracing::Level;

mod telemetry;

#[derive(Parser)]
#[command(name = "fixturectl")]
#[command(about = "Reconcile test fixture manifests against a cluster", long_about = None)]
#[command(version)]
struct Cli {
	#[command(flatten)]
	global: GlobalArgs,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
	/// Config file to use instead of searching for .fixture-config.yaml
	#[arg(long, global = true)]
	config: Option<PathBuf>,

	/// Directory that manifest paths are resolved against
	#[arg(long, global = true, default_value = ".")]
	bundle_dir: PathBuf,

	/// Label added to every Namespace in the manifest (Format: key=value)
	#[arg(long = "label", global = true, value_parser = parse_label)]
	labels: Vec<(String, String)>,

	/// Log level. Overrides RUST_LOG
	#[arg(long, global = true)]
	log_level: Option<Level>,

	/// Kubeconfig context to use instead of the current one
	#[arg(long, global = true)]
	context: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
	/// Print the decoded manifest as a YAML stream, labels applied
	Show { location: String },

	/// Create or update every resource of the manifest in the cluster
	Apply { location: String },

	/// Delete every resource of the manifest from the cluster
	Delete { location: String },
}

fn parse_label(raw: &str) -> Result<(String, String), String> {
	match raw.split_once('=') {
		Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
		_ => Err(format!("expected key=value, got `{raw}`")),
	}
}

fn load_config(global: &GlobalArgs) -> Result<HarnessConfig> {
	let mut config = match &global.config {
		Some(path) => HarnessConfig::load_from_file(path)?,
		None => {
			let cwd = std::env::current_dir().context("resolving current directory")?;
			HarnessConfig::load_from_directory(&cwd)?.unwrap_or_default()
		}
	};
	config
		.namespace_labels
		.extend(global.labels.iter().cloned());
	Ok(config)
}

async fn connect(context: Option<String>) -> Result<Arc<dyn LiveStore>> {
	let store = match context {
		Some(context) => {
			let kubeconfig = Kubeconfig::read().context("reading kubeconfig")?;
			KubeStore::from_kubeconfig(kubeconfig, Some(context)).await?
		}
		None => KubeStore::infer().await?,
	};
	Ok(Arc::new(store))
}

fn write_stream(out: &mut impl Write, resources: &[Resource]) -> Result<()> {
	for resource in resources {
		writeln!(out, "---")?;
		out.write_all(serde_yaml::to_string(resource)?.as_bytes())?;
	}
	out.flush()?;
	Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	telemetry::init(cli.global.log_level);

	let config = load_config(&cli.global)?;
	let labels: &NamespaceLabels = &config.namespace_labels;
	tracing::debug!(?labels, timeouts = ?config.timeouts, "loaded configuration");

	let bundle = DirBundle::new(&cli.global.bundle_dir);
	let applier = Applier::from_config(&config, Arc::new(bundle));
	let mut stdout = BufWriter::new(io::stdout().lock());

	match cli.command {
		Commands::Show { location } => {
			let resources = applier.load(&location).await?;
			write_stream(&mut stdout, &resources)?;
		}
		Commands::Apply { location } => {
			let store = connect(cli.global.context).await?;
			let applied = applier.apply_with_cleanup(&store, None, &location).await?;
			for entry in &applied {
				writeln!(stdout, "{} {:?}", entry.key, entry.outcome)?;
			}
			stdout.flush()?;
		}
		Commands::Delete { location } => {
			let store = connect(cli.global.context).await?;
			let deleted = applier.delete(&store, &location).await?;
			if deleted.is_empty() {
				bail!("manifest {location} contains no resources");
			}
			for key in &deleted {
				writeln!(stdout, "{key} deleted")?;
			}
			stdout.flush()?;
		}
	}

	Ok(())
}
