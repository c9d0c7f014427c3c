use clap::Parser;
use tracing::{error, info, warn};

use opkssh::cli::{Cli, Command};
use opkssh::login::LoginCmd;
use opkssh::policy::files::OwnerSpec;
use opkssh::policy::helper::{read_home, AddCmd};
use opkssh::policy::PolicyLoader;
use opkssh::{logging, paths, verify};

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = Cli::parse();

    match cli.command {
        Command::Login {
            auto_refresh,
            config_path,
            create_config,
            log_dir,
            disable_browser_open,
            print_id_token,
            output_key,
            provider,
            provider_alias,
        } => {
            logging::setup_cli_logging(log_dir.as_deref());
            let cmd = LoginCmd {
                auto_refresh,
                config_path,
                create_config,
                disable_browser_open,
                print_id_token,
                output_key,
                provider_arg: provider,
                provider_alias,
            };

            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("Error: failed to start runtime: {e}");
                    return 1;
                }
            };
            match rt.block_on(cmd.run()) {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("Error logging in: {e:#}");
                    1
                }
            }
        }

        Command::Verify {
            user,
            cert_b64,
            key_type,
        } => {
            // stdout belongs to sshd; everything else goes to the log file.
            logging::setup_verify_logging(std::path::Path::new(paths::VERIFY_LOG));
            info!(user, key_type, "AuthorizedKeysCommand invoked");

            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    error!(error = %e, "Failed to start runtime");
                    return 1;
                }
            };
            match rt.block_on(verify::run(&user, &cert_b64, &key_type)) {
                Ok(authority_line) => {
                    // The single line sshd is waiting for. Anything else on
                    // stdout would break the exchange.
                    println!("{authority_line}");
                    0
                }
                Err(e) => {
                    error!(kind = e.kind(), error = %e, user, "Verification denied");
                    1
                }
            }
        }

        Command::Add {
            principal,
            identity,
            issuer,
        } => {
            logging::setup_cli_logging(None);
            let loader = match PolicyLoader::system_defaults() {
                Ok(loader) => loader,
                Err(e) => {
                    // Without the system group only the user tier is
                    // reachable; keep going so `add` for oneself works.
                    warn!(error = %e, "System policy group unavailable");
                    PolicyLoader {
                        system_path: paths::SYSTEM_POLICY.into(),
                        home_root: paths::HOME_ROOT.into(),
                        system_owner: OwnerSpec { uid: 0, gid: None },
                    }
                }
            };
            let cmd = AddCmd {
                principal,
                identity,
                issuer,
                loader,
            };
            match cmd.run() {
                Ok(path) => {
                    info!(path = %path.display(), "Policy updated");
                    0
                }
                Err(e) => {
                    eprintln!("Error adding policy row: {e}");
                    1
                }
            }
        }

        Command::Readhome { user } => {
            match read_home(&user, std::path::Path::new(paths::HOME_ROOT)) {
                Ok(content) => {
                    print!("{content}");
                    0
                }
                Err(e) => {
                    eprintln!("Error: {e}");
                    1
                }
            }
        }
    }
}
