use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use gateway_auth::keys::{DEFAULT_PRIVATE_KEY_ENV, DEFAULT_SHARED_SECRET_ENV};
use gateway_auth::{
    Body, CanonicalRequest, KeySource, ProcessEnv, RsaSigner, base64_to_hex, query_from_pairs,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(about = "Offline signing for the token handshake and the HMAC gateway")]
struct Args {
    #[clap(long, env = "GATEWAY_AUTH_PRIVATE_KEY_PATH", default_value = "./certs/private_key.pem")]
    private_key_path: PathBuf,
    #[clap(long, env = "GATEWAY_AUTH_SHARED_SECRET_PATH", default_value = "./certs/access.key")]
    shared_secret_path: PathBuf,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the handshake signature (Base64) and secret (hex).
    Secret {
        #[clap(long, env = "GATEWAY_AUTH_IDENTITY")]
        identity: String,
        /// Milliseconds since the Unix epoch; defaults to now.
        #[clap(long)]
        timestamp: Option<u64>,
    },
    /// Print the canonical content and HMAC signature of a gateway request.
    Sign {
        #[clap(long)]
        path: String,
        /// `name=value`; repeatable.
        #[clap(long = "header")]
        headers: Vec<String>,
        /// `name=value`; repeat a name for multi-valued parameters.
        #[clap(long = "query")]
        query: Vec<String>,
        /// Raw body text.
        #[clap(long, conflicts_with = "json")]
        body: Option<String>,
        /// JSON body; re-serialized compactly before signing.
        #[clap(long)]
        json: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Command::Secret {
            identity,
            timestamp,
        } => {
            let source = KeySource::new(DEFAULT_PRIVATE_KEY_ENV, args.private_key_path);
            let pem = gateway_auth::keys::load_private_key(&source, &ProcessEnv)
                .context("loading private key")?;
            let signer = RsaSigner::from_pem(&pem).context("importing private key")?;

            let timestamp = match timestamp {
                Some(timestamp) => timestamp,
                None => SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .context("reading system clock")?
                    .as_millis() as u64,
            };
            let signature = signer
                .sign_identity(&identity, timestamp)
                .context("signing identity")?;
            let secret = base64_to_hex(&signature)?;

            println!("time      {timestamp}");
            println!("signature {signature}");
            println!("secret    {secret}");
        }
        Command::Sign {
            path,
            headers,
            query,
            body,
            json,
        } => {
            let shared_secret = KeySource::new(DEFAULT_SHARED_SECRET_ENV, args.shared_secret_path)
                .resolve(&ProcessEnv)
                .context("loading shared secret")?;

            let headers = headers
                .iter()
                .map(|pair| split_pair(pair))
                .collect::<Result<Vec<_>>>()?;
            let query = query
                .iter()
                .map(|pair| split_pair(pair))
                .collect::<Result<Vec<_>>>()?;
            let query = query_from_pairs(query);
            let body = match (body, json) {
                (Some(text), _) => Body::Text(text),
                (None, Some(json)) => {
                    let value: serde_json::Value =
                        serde_json::from_str(&json).context("parsing --json body")?;
                    Body::json(&value)?
                }
                (None, None) => Body::Empty,
            };

            let canonical = CanonicalRequest::build(&path, headers, &query, &body)
                .context("canonicalizing request")?;
            let signature = canonical.sign(&shared_secret).context("signing request")?;

            println!("content   {}", String::from_utf8_lossy(&canonical.to_bytes()));
            println!("signature {signature}");
        }
    }
    Ok(())
}

fn split_pair(pair: &str) -> Result<(String, String)> {
    let (name, value) = pair
        .split_once('=')
        .ok_or_else(|| anyhow!("expected name=value, got {pair:?}"))?;
    Ok((name.to_string(), value.to_string()))
}
