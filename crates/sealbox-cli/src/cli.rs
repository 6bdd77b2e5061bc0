use clap::{Parser, Subcommand, ValueEnum};

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "sealbox",
    about = "Typed key-value storage with per-key encryption backed by the OS keychain",
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Read a value, printing the default when it is absent or unreadable.
    Get {
        key: String,
        #[arg(long = "type", value_enum, default_value_t = ValueKind::String)]
        kind: ValueKind,
        /// Read from the encrypted store.
        #[arg(long)]
        encrypted: bool,
        /// Value printed when nothing usable is stored.
        #[arg(long)]
        default: Option<String>,
    },
    /// Write a value.
    Put {
        key: String,
        value: String,
        #[arg(long = "type", value_enum, default_value_t = ValueKind::String)]
        kind: ValueKind,
        /// Encrypt the value with a per-key secret held in the OS keychain.
        #[arg(long)]
        encrypted: bool,
    },
    /// Delete a value and its key material.
    Delete { key: String },
    /// Delete every value and every managed key.
    Clear,
    /// Run an encrypted round-trip against the configured storage.
    Health,
    /// Print version and exit.
    Version,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

/// How a value is typed in storage.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    I32,
    I64,
    F32,
    F64,
    String,
    /// Arbitrary JSON stored as a structured value.
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}
