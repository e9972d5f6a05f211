use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "llama-switchboard",
    version,
    about = "Capability detection and process switching for local llama-server instances"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,

    /// Directory containing `llama-server`/`llama-cli`. Auto-detected under
    /// the current directory when omitted.
    #[arg(long, global = true)]
    pub install_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run capability detection for a model and print the resulting spec
    /// as JSON.
    Detect {
        model_path: PathBuf,
        /// Aliases to register the detected spec under.
        #[arg(long = "alias")]
        aliases: Vec<String>,
    },
    /// Run the process switcher, resolving newline-delimited JSON requests
    /// read from stdin against a spec registry. `bind` is informational
    /// only: this command is a line protocol, not a bound HTTP listener —
    /// a caller fronting it with a real HTTP server logs it as context.
    Serve {
        #[arg(long, default_value = "127.0.0.1:11535")]
        bind: String,
        /// Path to a spec registry JSON file produced by `detect`.
        #[arg(long)]
        registry: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_detect_command() {
        let cli = Cli::try_parse_from(["llama-switchboard", "detect", "/models/m.gguf"]).unwrap();
        match cli.cmd {
            Command::Detect { model_path, aliases } => {
                assert_eq!(model_path, PathBuf::from("/models/m.gguf"));
                assert!(aliases.is_empty());
            }
            _ => panic!("expected Detect command"),
        }
    }

    #[test]
    fn parses_detect_command_with_aliases() {
        let cli = Cli::try_parse_from([
            "llama-switchboard",
            "detect",
            "/models/m.gguf",
            "--alias",
            "mini",
            "--alias",
            "m7b",
        ])
        .unwrap();
        match cli.cmd {
            Command::Detect { aliases, .. } => {
                assert_eq!(aliases, vec!["mini".to_string(), "m7b".to_string()]);
            }
            _ => panic!("expected Detect command"),
        }
    }

    #[test]
    fn parses_serve_command_default_bind() {
        let cli = Cli::try_parse_from([
            "llama-switchboard",
            "serve",
            "--registry",
            "spec.json",
        ])
        .unwrap();
        match cli.cmd {
            Command::Serve { bind, registry } => {
                assert_eq!(bind, "127.0.0.1:11535");
                assert_eq!(registry, PathBuf::from("spec.json"));
            }
            _ => panic!("expected Serve command"),
        }
    }

    #[test]
    fn parses_serve_command_explicit_bind() {
        let cli = Cli::try_parse_from([
            "llama-switchboard",
            "serve",
            "--bind",
            "0.0.0.0:9000",
            "--registry",
            "spec.json",
        ])
        .unwrap();
        match cli.cmd {
            Command::Serve { bind, .. } => assert_eq!(bind, "0.0.0.0:9000"),
            _ => panic!("expected Serve command"),
        }
    }

    #[test]
    fn install_dir_is_global_and_optional() {
        let cli = Cli::try_parse_from([
            "llama-switchboard",
            "--install-dir",
            "/opt/llama",
            "detect",
            "/models/m.gguf",
        ])
        .unwrap();
        assert_eq!(cli.install_dir, Some(PathBuf::from("/opt/llama")));
    }
}
