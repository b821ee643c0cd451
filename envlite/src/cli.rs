use clap::{Parser, Subcommand};

/// envlite - isolated Python environment provisioning for ML providers
#[derive(Parser, Debug)]
#[command(name = "envlite")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ensure the provider's environment exists and is ready
    Ensure {
        /// Provider name (e.g. "phi", "meta-llama", "openai")
        #[arg(value_name = "PROVIDER")]
        provider: String,

        /// Model name, used under the per-model naming strategy
        #[arg(long)]
        model: Option<String>,
    },

    /// Show per-package install status for a provider
    Status {
        /// Provider name
        #[arg(value_name = "PROVIDER")]
        provider: String,

        /// Emit JSON instead of a table
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Detect the host's acceleration backend (cuda/rocm/vulkan/cpu)
    Detect,

    /// List registered environments
    List,

    /// Execute code in a provider's environment
    Exec {
        /// Provider name
        #[arg(value_name = "PROVIDER")]
        provider: String,

        /// Code to run. Use "-" to read from stdin
        #[arg(short = 'c', long)]
        code: String,

        /// Model name, used under the per-model naming strategy
        #[arg(long)]
        model: Option<String>,

        /// User the session is attributed to
        #[arg(long, default_value = "cli")]
        user: String,
    },

    /// Serve the collaborator API
    Serve {
        /// JSON-RPC 2.0 over stdio, one request per line
        #[arg(long)]
        stdio: bool,
    },
}
