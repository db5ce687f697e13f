use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "spillway", version, about = "Overflow log ingestion and retrieval service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the HTTP server (default)
    Serve,
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Load the configuration from the environment and report problems
    Validate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_subcommand_defaults_to_serve() {
        let cli = Cli::parse_from(["spillway"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_parse_config_validate() {
        let cli = Cli::parse_from(["spillway", "config", "validate"]);
        assert!(matches!(
            cli.command,
            Some(Commands::Config {
                action: ConfigCommands::Validate
            })
        ));
    }
}
