use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Returns the version string, including git hash and commit date for non-release builds.
/// Format: "0.3.0" for releases, "0.3.0@abc1234 2026-01-15 14:30" for dev builds
fn get_version() -> &'static str {
    const VERSION: &str = env!("CARGO_PKG_VERSION");
    const GIT_HASH: &str = env!("GIT_HASH");
    const GIT_COMMIT_DATE: &str = env!("GIT_COMMIT_DATE");
    const IS_RELEASE: &str = env!("IS_RELEASE");

    use std::sync::OnceLock;
    static VERSION_STRING: OnceLock<String> = OnceLock::new();

    VERSION_STRING.get_or_init(|| {
        if IS_RELEASE == "true" || GIT_HASH.is_empty() {
            VERSION.to_string()
        } else {
            format!("{}@{} {}", VERSION, GIT_HASH, GIT_COMMIT_DATE)
        }
    })
}

#[derive(Parser, Debug)]
#[command(name = "keyminder", bin_name = "keyminder", version = get_version())]
#[command(about = "Headless access to KeyMinder credential files", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// The KeyMinder file to work on
    #[arg(short, long, global = true)]
    pub file: Option<PathBuf>,

    /// Password for encrypted files (asked interactively when omitted)
    #[arg(long, global = true)]
    pub password: Option<String>,

    /// Storage format identifier, overriding the file extension
    #[arg(long, global = true)]
    pub format: Option<String>,

    /// Directory holding config.json and settings.json
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum MoveDirection {
    Up,
    Down,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a new, empty file
    New {
        /// Protect the file with a password
        #[arg(long)]
        encrypt: bool,
    },

    /// Print the node tree
    Tree {
        /// Show node ids
        #[arg(long)]
        ids: bool,
    },

    /// Add a node below PARENT (a path like /Servers)
    Add {
        parent: String,
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },

    /// Remove a node and everything below it
    Rm { path: String },

    /// Move a node among its siblings
    Move {
        path: String,
        #[arg(value_enum)]
        direction: MoveDirection,
    },

    /// Sort the children of a node by text
    Sort {
        #[arg(default_value = "/")]
        path: String,
        #[arg(short, long)]
        recursive: bool,
    },

    /// Set an attribute (use "text" to rename)
    Set {
        path: String,
        key: String,
        value: String,
    },

    /// Print a node's attributes, or a single one
    Get { path: String, key: Option<String> },

    /// List or edit quicklinks
    Link {
        /// Quicklink name
        name: Option<String>,
        /// Node path to link; omit to remove the quicklink
        path: Option<String>,
    },

    /// Set or change the file password
    Passwd {
        /// New password, for non-interactive use
        #[arg(long)]
        new: Option<String>,
        /// Store the file without encryption
        #[arg(long, conflicts_with = "new")]
        remove: bool,
    },

    /// Show the cipher in use, or switch to NAME
    Cipher { name: Option<String> },

    /// Write the document to OUTPUT, optionally in another format
    Convert {
        output: PathBuf,
        #[arg(long = "to")]
        to_format: Option<String>,
    },

    /// List the registered storage formats
    Formats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_options_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "keyminder",
            "get",
            "/Mail",
            "user",
            "--file",
            "vault.keymind",
            "--password",
            "pw",
        ])
        .unwrap();
        assert_eq!(cli.file, Some(PathBuf::from("vault.keymind")));
        assert_eq!(cli.password.as_deref(), Some("pw"));
        match cli.command {
            Commands::Get { path, key } => {
                assert_eq!(path, "/Mail");
                assert_eq!(key.as_deref(), Some("user"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn add_joins_words() {
        let cli = Cli::try_parse_from(["keyminder", "add", "/", "Online", "Banking"]).unwrap();
        match cli.command {
            Commands::Add { parent, text } => {
                assert_eq!(parent, "/");
                assert_eq!(text.join(" "), "Online Banking");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
