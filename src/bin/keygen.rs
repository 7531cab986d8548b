//! ghostknock-keygen — Ed25519 keypair generator.
//!
//! Writes `<base>` (64 raw bytes: seed || public, mode 0600) and
//! `<base>.pub` (32 raw bytes, mode 0644), then prints the base64 public
//! key ready to paste into the `users` section of the server config.
//! Existing files are never overwritten.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::Parser;
use ghostknock::protocol::KnockKeypair;
use std::fs;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "ghostknock-keygen", version, about = "Generate a GhostKnock Ed25519 keypair")]
struct Args {
    /// Base path for the key pair (writes BASE and BASE.pub)
    #[arg(short = 'o', long = "output", default_value = "id_ed25519")]
    output: PathBuf,
}

fn write_with_mode(path: &Path, bytes: &[u8], mode: u32) -> Result<(), String> {
    use std::io::Write;
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .mode(mode)
        .open(path)
        .map_err(|err| format!("could not create '{}': {err}", path.display()))?;
    file.write_all(bytes)
        .map_err(|err| format!("could not write '{}': {err}", path.display()))
}

fn run(args: Args) -> Result<(), String> {
    let private_path = args.output.clone();
    let public_path = {
        let mut name = args.output.as_os_str().to_os_string();
        name.push(".pub");
        PathBuf::from(name)
    };

    if private_path.exists() || public_path.exists() {
        return Err(format!(
            "'{}' or '{}' already exists; refusing to overwrite. Remove them or pick another path with -o.",
            private_path.display(),
            public_path.display()
        ));
    }

    if let Some(parent) = private_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)
                .map_err(|err| format!("could not create '{}': {err}", parent.display()))?;
        }
    }

    let keypair = KnockKeypair::generate();
    write_with_mode(&private_path, &keypair.to_keypair_bytes(), 0o600)?;
    if let Err(err) = write_with_mode(&public_path, &keypair.public_bytes(), 0o644) {
        // Do not leave a half-written pair behind.
        let _ = fs::remove_file(&private_path);
        return Err(err);
    }

    println!("private key saved to: {}", private_path.display());
    println!("public key saved to:  {}", public_path.display());
    println!();
    println!("Add this public key to the 'users' section of the server config.yaml:");
    println!();
    println!("{}", BASE64.encode(keypair.public_bytes()));
    Ok(())
}

fn main() -> ExitCode {
    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("ghostknock-keygen: {message}");
            ExitCode::FAILURE
        }
    }
}
