pub mod cli;
pub mod config;
pub mod errors;
pub mod jose;
pub mod keys;
pub mod logging;
pub mod login;
pub mod pktoken;
pub mod policy;
pub mod providers;
pub mod sshcert;
pub mod verify;

/// Well-known on-disk locations. The verifier trusts these paths only after
/// the ownership and mode checks in `policy::files` pass.
pub mod paths {
    /// System-wide policy file mapping identities to principals.
    pub const SYSTEM_POLICY: &str = "/etc/opk/auth_id";
    /// Directory of per-provider YAML files.
    pub const PROVIDERS_DIR: &str = "/etc/opk/providers.d";
    /// Optional server configuration consumed by the verifier.
    pub const SERVER_CONFIG: &str = "/etc/opk/server_config.yml";
    /// Verifier log file. stdout is reserved for the authority line,
    /// so everything else goes here.
    pub const VERIFY_LOG: &str = "/var/log/opkssh.log";
    /// Root of user home directories, for per-user policy files.
    pub const HOME_ROOT: &str = "/home";
    /// Group that must own the system policy and provider files.
    pub const SYSTEM_GROUP: &str = "opksshuser";
}
