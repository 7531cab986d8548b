//! ghostknock — the knock client.
//!
//! Builds a signed and encrypted authorization request and sends it as a
//! single UDP datagram. No reply ever comes back; the server is silent by
//! design. Success here only means the packet left this machine.

use clap::Parser;
use ed25519_dalek::VerifyingKey;
use ghostknock::protocol::{seal_v2, KnockKeypair, Payload, PUBLIC_KEY_SIZE};
use std::collections::HashMap;
use std::net::UdpSocket;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "ghostknock", version, about = "Send a single authorization knock")]
struct Args {
    /// Server host or IP address (required)
    #[arg(long)]
    host: Option<String>,

    /// Server UDP port
    #[arg(long, default_value_t = 3001)]
    port: u16,

    /// Action id to request (required)
    #[arg(long)]
    action: Option<String>,

    /// Path to the client private key
    #[arg(long, default_value = "id_ed25519")]
    key: PathBuf,

    /// Path to the server public key (raw 32 bytes, as written by keygen)
    #[arg(long = "server-key", default_value = "server_ed25519.pub")]
    server_key: PathBuf,

    /// Action parameters as k=v,k2=v2
    #[arg(long)]
    args: Option<String>,
}

fn parse_args_list(list: &str) -> Result<HashMap<String, String>, String> {
    let mut params = HashMap::new();
    for pair in list.split(',').filter(|pair| !pair.is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(format!("malformed parameter '{pair}', expected k=v"));
        };
        if key.is_empty() {
            return Err(format!("empty parameter name in '{pair}'"));
        }
        params.insert(key.to_string(), value.to_string());
    }
    Ok(params)
}

fn run(args: Args) -> Result<(), String> {
    let host = args.host.ok_or("the --host argument is required")?;
    let action = args.action.ok_or("the --action argument is required")?;

    let key_bytes = std::fs::read(&args.key).map_err(|err| {
        format!(
            "could not read private key '{}' (run ghostknock-keygen first?): {err}",
            args.key.display()
        )
    })?;
    let keypair = KnockKeypair::from_keypair_bytes(&key_bytes)
        .map_err(|_| format!("private key '{}' is malformed", args.key.display()))?;

    let server_bytes = std::fs::read(&args.server_key).map_err(|err| {
        format!("could not read server public key '{}': {err}", args.server_key.display())
    })?;
    let server_raw: [u8; PUBLIC_KEY_SIZE] = server_bytes
        .as_slice()
        .try_into()
        .map_err(|_| format!("server public key '{}' is malformed", args.server_key.display()))?;
    let server_key = VerifyingKey::from_bytes(&server_raw)
        .map_err(|_| format!("server public key '{}' is malformed", args.server_key.display()))?;

    let mut payload = Payload::new(action.clone());
    if let Some(list) = &args.args {
        payload.params = parse_args_list(list)?;
    }

    let datagram =
        seal_v2(&payload, &keypair, &server_key).map_err(|err| format!("sealing failed: {err}"))?;

    let target = format!("{host}:{}", args.port);
    let socket = UdpSocket::bind("0.0.0.0:0").map_err(|err| format!("socket: {err}"))?;
    socket
        .connect(&target)
        .map_err(|err| format!("could not resolve '{target}': {err}"))?;
    let sent = socket.send(&datagram).map_err(|err| format!("send failed: {err}"))?;

    println!("knock sent: action '{action}' to {target} ({sent} bytes)");
    Ok(())
}

fn main() -> ExitCode {
    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("ghostknock: {message}");
            ExitCode::FAILURE
        }
    }
}
