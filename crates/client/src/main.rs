use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use gateway_auth::gateway::{HttpClient, Method};
use gateway_auth::keys::load_private_key;
use gateway_auth::{
    GatewayClient, GatewayConfig, HandshakeConfig, HttpHandshake, KeyConfig, ProcessEnv,
    QueryParams, RsaSigner, TokenConfig, TokenManager, query_from_pairs, send_with_bearer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(about = "Talks to the handshake service and the HMAC gateway")]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Obtain a bearer token through the RSA handshake.
    Token {
        #[clap(long, env = "GATEWAY_AUTH_REST_URL")]
        rest_url: String,
        #[clap(long, env = "GATEWAY_AUTH_IDENTITY")]
        identity: String,
    },
    /// POST a JSON body to a token-protected endpoint.
    Call {
        #[clap(long, env = "GATEWAY_AUTH_REST_URL")]
        rest_url: String,
        #[clap(long, env = "GATEWAY_AUTH_IDENTITY")]
        identity: String,
        #[clap(long)]
        path: String,
        #[clap(long, default_value = "{}")]
        json: String,
    },
    /// Send an HMAC-signed GET to the gateway.
    Query {
        #[clap(long, env = "GATEWAY_AUTH_GATEWAY_URL")]
        gateway_url: String,
        #[clap(long, env = "GATEWAY_AUTH_ACCESS_KEY_ID")]
        access_key_id: String,
        #[clap(long, env = "GATEWAY_AUTH_TENANT_ID")]
        tenant_id: Option<String>,
        #[clap(long)]
        path: String,
        /// `name=value`; repeat a name for multi-valued parameters.
        #[clap(long = "query")]
        query: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let keys = KeyConfig::default();

    match args.command {
        Command::Token { rest_url, identity } => {
            let tokens = token_manager(&rest_url, identity, &keys)?;
            match tokens.get_token(false).await? {
                Some(token) => println!("{token}"),
                None => bail!("handshake did not return a token"),
            }
        }
        Command::Call {
            rest_url,
            identity,
            path,
            json,
        } => {
            let tokens = token_manager(&rest_url, identity, &keys)?;
            let body: serde_json::Value = serde_json::from_str(&json).context("parsing --json")?;
            let url = format!("{}{}", rest_url.trim_end_matches('/'), path);
            let client = HttpClient::builder()
                .timeout(gateway_auth::config::DEFAULT_TIMEOUT)
                .build()
                .context("building http client")?;
            let response = send_with_bearer(&client, &tokens, Method::POST, &url, Some(&body))
                .await
                .context("calling token-protected endpoint")?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Query {
            gateway_url,
            access_key_id,
            tenant_id,
            path,
            query,
        } => {
            let mut config = GatewayConfig::new(gateway_url, access_key_id);
            config.tenant_id = tenant_id;
            let shared_secret = keys
                .shared_secret
                .resolve(&ProcessEnv)
                .context("loading shared secret")?;
            let client = GatewayClient::new(config, shared_secret)?;
            let response = client
                .get(&path, &parse_query(&query)?)
                .await
                .context("calling gateway")?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }
    Ok(())
}

fn token_manager(
    rest_url: &str,
    identity: String,
    keys: &KeyConfig,
) -> Result<TokenManager<HttpHandshake>> {
    let pem = load_private_key(&keys.private_key, &ProcessEnv).context("loading private key")?;
    let signer = RsaSigner::from_pem(&pem).context("importing private key")?;
    let transport = HttpHandshake::new(&HandshakeConfig::new(rest_url))?;
    let manager = TokenManager::new(TokenConfig::new(identity), signer, transport)?;
    info!(identity = manager.identity(), "token manager ready");
    Ok(manager)
}

fn parse_query(pairs: &[String]) -> Result<QueryParams> {
    let pairs = pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .ok_or_else(|| anyhow!("expected name=value, got {pair:?}"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(query_from_pairs(pairs))
}
