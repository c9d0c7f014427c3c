use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "opkssh",
    version,
    about = "SSH with short-lived certificates backed by OpenID Connect"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Log in via an OpenID provider and write an SSH key + certificate
    Login {
        /// Stay resident and refresh the certificate before each expiry
        #[arg(long)]
        auto_refresh: bool,
        /// Client config path (default ~/.opk/config.yml)
        #[arg(long, env = "OPKSSH_CONFIG")]
        config_path: Option<PathBuf>,
        /// Write the default client config and exit
        #[arg(long)]
        create_config: bool,
        /// Also write logs to <dir>/opkssh.log
        #[arg(long)]
        log_dir: Option<PathBuf>,
        /// Print the login URL instead of opening a browser
        #[arg(long)]
        disable_browser_open: bool,
        /// Pretty-print the ID token claims after login
        #[arg(long)]
        print_id_token: bool,
        /// Write the secret key here (certificate goes to <path>.pub)
        #[arg(long)]
        output_key: Option<PathBuf>,
        /// One-off provider: "<issuer>,<client_id>[,<client_secret>],<expiration_policy>"
        #[arg(long)]
        provider: Option<String>,
        /// Use the configured provider with this alias
        #[arg(long)]
        provider_alias: Option<String>,
    },
    /// AuthorizedKeysCommand hook: verify an offered certificate
    /// (sshd invokes this as `verify %u %k %t`)
    Verify {
        /// Principal the connection wants to assume
        user: String,
        /// Base64-encoded certificate offered as a public key
        cert_b64: String,
        /// Public key type reported by sshd
        key_type: String,
    },
    /// Append a policy row (re-execs under sudo for the system policy)
    Add {
        /// Local username being granted
        principal: String,
        /// Email or subject of the identity
        identity: String,
        /// Issuer URL of the identity's provider
        issuer: String,
    },
    /// Privileged helper: print a user's policy file (root only)
    Readhome {
        /// User whose ~/.opk/auth_id to read
        user: String,
    },
}
