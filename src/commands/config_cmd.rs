use clap::{Args, Subcommand, ValueEnum};

use tabsync::config::Config;

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl ConfigCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(config)?);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        if let Some(path) = &config.config_file {
                            println!("Config file: {}", path.display());
                        } else {
                            println!(
                                "Config file: {} (not found)",
                                Config::default_config_path().display()
                            );
                        }
                        println!();

                        println!("data_dir: {}", config.data_dir.value.display());
                        println!("  source: {}", config.data_dir.source);
                        println!();

                        println!("server_url: {}", config.server_url.value);
                        println!("  source: {}", config.server_url.source);
                        println!();

                        println!("port: {}", config.port.value);
                        println!("  source: {}", config.port.source);
                        println!();

                        match config.request_timeout_secs.value {
                            Some(secs) => println!("request_timeout_secs: {}", secs),
                            None => println!("request_timeout_secs: (unset)"),
                        }
                        println!("  source: {}", config.request_timeout_secs.source);
                        println!();

                        println!(
                            "replica_id: {}",
                            config.replica_id.value.as_deref().unwrap_or("(random)")
                        );
                        println!("  source: {}", config.replica_id.source);
                    }
                }
                Ok(())
            }
        }
    }
}
