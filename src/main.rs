use std::path::PathBuf;

use bifrost::{config, logging, pseudonym};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "bifrost", about = "Bifrost - openEHR to FHIR ETL bridge")]
struct Cli {
	#[command(subcommand)]
	command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
	/// Run the ETL pipeline (default)
	Run,
	/// Create the AES pseudonymisation key if it does not exist yet
	GenKey {
		/// Where to store the key; defaults to pseudonymization.key_path
		#[arg(long)]
		path: Option<PathBuf>,
	},
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();

	let settings = match config::load() {
		Ok(s) => s,
		Err(e) => {
			eprintln!("configuration error: {e}");
			std::process::exit(2);
		}
	};

	if let Err(e) = logging::init(&settings.log_level, &settings.paths.log_folder) {
		eprintln!("warning: failed to initialize logging: {e}");
	}

	match cli.command.unwrap_or(Commands::Run) {
		Commands::GenKey { path } => {
			let path = path.unwrap_or_else(|| settings.pseudonymization.key_path.clone());
			match pseudonym::key::load_or_generate(&path) {
				Ok(_) => println!("AES key ready at {}", path.display()),
				Err(e) => {
					eprintln!("failed to prepare AES key: {e:#}");
					std::process::exit(1);
				}
			}
		}
		Commands::Run => {
			if let Err(e) = bifrost::run(settings).await {
				log::error!("fatal: {e:#}");
				std::process::exit(1);
			}
		}
	}
}
