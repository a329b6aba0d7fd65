//! Command-line client for ferry.

mod api_client;

use anyhow::{Context, Result};
use api_client::{
    ApiClient, ExportAccepted, ExportStatusResponse, FileExportRequest, ImageExportRequest,
    ImportDetail, ImportResponse,
};
use clap::{Args, Parser, Subcommand};
use ferry_core::{ContentHash, ExportSignature};
use ferry_signer::{KeyPair, PublicKey, digest_reader, verify_export_signature};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8080";
const SIGNING_KEY_ENV: &str = "FERRY_SIGNING_KEY";

#[derive(Parser)]
#[command(name = "ferryctl")]
#[command(about = "Request artefact exports and imports from a ferry server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ApiArgs {
    /// Server API URL
    #[arg(long, global = true, env = "FERRY_SERVER", default_value = DEFAULT_SERVER)]
    server: String,

    /// Bearer token of the acting principal
    #[arg(long, global = true, env = "FERRY_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Export a model file or release image
    Export {
        #[command(subcommand)]
        command: ExportCommands,
        #[command(flatten)]
        api: ApiArgs,
    },
    /// Import a published archive by its object key
    Import {
        /// Object key in the exports bucket (e.g. "<exportId>/<fileId>.tar.gz")
        key: String,
        #[command(flatten)]
        api: ApiArgs,
    },
    /// Check server health and version
    Health {
        #[command(flatten)]
        api: ApiArgs,
    },
    /// Show the principal the token resolves to
    Whoami {
        #[command(flatten)]
        api: ApiArgs,
    },
    /// Signing key management
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },
    /// Generate a bearer token for a principal (outputs secret + hash)
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
    /// Verify an archive against its detached signature
    Verify {
        /// Path to the archive
        #[arg(long)]
        archive: PathBuf,
        /// Expected digest (`sha256:<hex>`)
        #[arg(long)]
        digest: String,
        /// Base64 signature over the digest
        #[arg(long)]
        signature: String,
        /// Trusted public key (`name:base64`)
        #[arg(long)]
        public_key: String,
    },
}

#[derive(Subcommand)]
enum ExportCommands {
    /// Export one model file
    File {
        /// Source model id
        #[arg(long)]
        model: String,
        /// File id
        #[arg(long)]
        file: String,
        /// Wait until the archive is published
        #[arg(long, default_value_t = false)]
        wait: bool,
    },
    /// Export one image of a release
    Image {
        /// Source model id
        #[arg(long)]
        model: String,
        /// Release semver
        #[arg(long)]
        release: String,
        /// Image name
        #[arg(long)]
        image: String,
        /// Image tag
        #[arg(long)]
        tag: String,
        /// Wait until the archive is published
        #[arg(long, default_value_t = false)]
        wait: bool,
    },
    /// Show the status of an export
    Status {
        /// Export id returned when the export was requested
        export_id: String,
        /// Wait until the export finishes
        #[arg(long, default_value_t = false)]
        wait: bool,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Generate a new signing key pair
    Generate {
        /// Key name (e.g., "ferry.example.com-1")
        #[arg(short, long)]
        name: String,
        /// Output file for secret key
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show the public key for a secret key
    Public {
        /// Path to secret key file
        #[arg(short, long, group = "key_source")]
        file: Option<PathBuf>,
        /// Secret key value directly
        #[arg(short, long, group = "key_source")]
        value: Option<String>,
        /// Read secret key from FERRY_SIGNING_KEY env var
        #[arg(short, long, group = "key_source")]
        env: bool,
    },
}

#[derive(Subcommand)]
enum TokenCommands {
    /// Generate a token offline
    Generate {
        /// Principal name the token will act as
        #[arg(short, long)]
        principal: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let Cli { command } = Cli::parse();

    match command {
        Commands::Export { command, api } => handle_export_command(command, &api).await,
        Commands::Import { key, api } => handle_import_command(&key, &api).await,
        Commands::Health { api } => handle_health_command(&api).await,
        Commands::Whoami { api } => handle_whoami_command(&api).await,
        Commands::Key { command } => handle_key_command(command).await,
        Commands::Token { command } => handle_token_command(command),
        Commands::Verify {
            archive,
            digest,
            signature,
            public_key,
        } => handle_verify_command(&archive, &digest, &signature, &public_key).await,
    }
}

fn get_api_client(api: &ApiArgs) -> Result<ApiClient> {
    let base_url = normalize_base_url(&api.server)?;
    ApiClient::new(&base_url, api.token.as_deref())
}

fn require_token(api: &ApiArgs) -> Result<()> {
    if api.token.as_deref().is_none_or(|t| t.trim().is_empty()) {
        anyhow::bail!("a token is required: pass --token or set FERRY_TOKEN");
    }
    Ok(())
}

async fn handle_export_command(command: ExportCommands, api: &ApiArgs) -> Result<()> {
    require_token(api)?;
    let client = get_api_client(api)?;

    match command {
        ExportCommands::File { model, file, wait } => {
            let accepted = client
                .export_file(FileExportRequest {
                    model_id: model,
                    file_id: file,
                })
                .await?;
            print_accepted(&accepted);
            if wait {
                let status = wait_for_export(&client, &accepted.export_id).await?;
                finish_status(&status)?;
            }
        }
        ExportCommands::Image {
            model,
            release,
            image,
            tag,
            wait,
        } => {
            let accepted = client
                .export_image(ImageExportRequest {
                    model_id: model,
                    release,
                    image_name: image,
                    tag,
                })
                .await?;
            print_accepted(&accepted);
            if wait {
                let status = wait_for_export(&client, &accepted.export_id).await?;
                finish_status(&status)?;
            }
        }
        ExportCommands::Status { export_id, wait } => {
            let status = if wait {
                wait_for_export(&client, &export_id).await?
            } else {
                client.export_status(&export_id).await?
            };
            finish_status(&status)?;
        }
    }
    Ok(())
}

fn print_accepted(accepted: &ExportAccepted) {
    println!("Export accepted");
    println!("  Export ID: {}", accepted.export_id);
    println!("  Kind: {}", accepted.import_kind);
    println!("  Key: {}", accepted.key);
    println!("  Signed: {}", accepted.signed);
}

/// Poll the export status with a capped backoff until it finishes.
async fn wait_for_export(client: &ApiClient, export_id: &str) -> Result<ExportStatusResponse> {
    let mut delay = Duration::from_millis(200);
    loop {
        let status = client.export_status(export_id).await?;
        if status.is_finished() {
            return Ok(status);
        }
        tracing::debug!(export_id, ?delay, "export still running");
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_secs(5));
    }
}

/// Print a status; failed and abandoned exports are an error exit.
fn finish_status(status: &ExportStatusResponse) -> Result<()> {
    println!("Export {}: {}", status.export_id, status.state);
    println!("  Kind: {}", status.import_kind);
    println!("  Key: {}", status.key);
    if let Some(size) = status.size {
        println!("  Size: {}", format_bytes(size));
    }
    if let Some(stage) = &status.stage {
        println!("  Stage: {stage}");
    }
    if let Some(error) = &status.error {
        println!("  Error: {error}");
    }
    match status.state.as_str() {
        "failed" | "abandoned" => anyhow::bail!("export {} {}", status.export_id, status.state),
        _ => Ok(()),
    }
}

async fn handle_import_command(key: &str, api: &ApiArgs) -> Result<()> {
    require_token(api)?;
    let client = get_api_client(api)?;
    let outcome = client.import(key).await?;
    print_import(&outcome);
    Ok(())
}

fn print_import(outcome: &ImportResponse) {
    println!("Imported {}", outcome.metadata.export_id);
    println!("  Source: {}", outcome.source);
    println!("  Destination: {}", outcome.destination);
    println!("  Exporter: {}", outcome.metadata.exporter);
    match &outcome.detail {
        ImportDetail::File {
            size,
            already_complete,
        } => {
            println!("  Size: {}", format_bytes(*size));
            if *already_complete {
                println!("  Destination was already complete, nothing written");
            }
        }
        ImportDetail::Image {
            blobs_uploaded,
            blobs_skipped,
            media_type,
        } => {
            println!("  Blobs uploaded: {blobs_uploaded}");
            println!("  Blobs already present: {blobs_skipped}");
            println!("  Manifest: {media_type}");
        }
    }
    match outcome.metadata.signature() {
        Some(sig) => println!(
            "  Signature: {} by {}",
            sig.digest.to_digest(),
            sig.key_name
        ),
        None => println!("  Signature: none"),
    }
}

async fn handle_health_command(api: &ApiArgs) -> Result<()> {
    let client = get_api_client(api)?;
    let health = client.health().await.context("health check failed")?;

    println!("Status: {}", health.status);
    println!("Server version: {}", health.version);
    println!("Client version: {}", env!("CARGO_PKG_VERSION"));

    if health.version != env!("CARGO_PKG_VERSION") {
        eprintln!(
            "Warning: version mismatch (server: {}, client: {})",
            health.version,
            env!("CARGO_PKG_VERSION")
        );
    }
    Ok(())
}

async fn handle_whoami_command(api: &ApiArgs) -> Result<()> {
    require_token(api)?;
    let client = get_api_client(api)?;
    let whoami = client.whoami().await?;
    println!("Principal: {}", whoami.principal);

    if whoami.signing_enabled {
        let key = client.signing_key().await?;
        if key.enabled
            && let Some(public_key) = key.public_key
        {
            println!(
                "Signing key: {} ({public_key})",
                key.key_name.as_deref().unwrap_or("unnamed")
            );
        }
    } else {
        println!("Signing key: none (exports are unsigned)");
    }
    Ok(())
}

async fn handle_key_command(command: KeyCommands) -> Result<()> {
    match command {
        KeyCommands::Generate { name, output } => {
            let keypair = KeyPair::generate(&name);
            let secret_key = keypair.secret_key_string();
            let public_key = keypair.public_key_string();

            if let Some(path) = output {
                tokio::fs::write(&path, format!("{secret_key}\n"))
                    .await
                    .with_context(|| format!("failed to write key to {}", path.display()))?;
                println!("Secret key written to: {}", path.display());
            } else {
                println!("Secret key:");
                println!("{secret_key}");
            }

            println!("\nPublic key:");
            println!("{public_key}");
            println!("\nPeers verify exports from this server with:");
            println!("  ferryctl verify --public-key {public_key} ...");
        }
        KeyCommands::Public { file, value, env } => {
            let secret_key = if let Some(path) = file {
                tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("failed to read key file: {}", path.display()))?
            } else if let Some(key) = value {
                key
            } else if env {
                std::env::var(SIGNING_KEY_ENV)
                    .with_context(|| format!("{SIGNING_KEY_ENV} environment variable not set"))?
            } else {
                anyhow::bail!("one of --file, --value, or --env is required");
            };

            let keypair =
                KeyPair::from_secret_key(secret_key.trim()).context("failed to parse secret key")?;

            println!("{}", keypair.public_key_string());
        }
    }
    Ok(())
}

fn handle_token_command(command: TokenCommands) -> Result<()> {
    match command {
        TokenCommands::Generate { principal } => {
            let token_secret = generate_token_secret();
            let token_hash = hash_token(&token_secret);

            println!("Token generated (save the secret - it cannot be recovered):\n");
            println!("  Secret: {token_secret}");
            println!("  Hash:   {token_hash}");
            println!("\nAdd to server.toml:");
            println!("  [[auth.principals]]");
            println!("  name = \"{principal}\"");
            println!("  token_hash = \"{token_hash}\"");
        }
    }
    Ok(())
}

async fn handle_verify_command(
    archive: &std::path::Path,
    digest: &str,
    signature: &str,
    public_key: &str,
) -> Result<()> {
    let (key_name, key) =
        PublicKey::parse(public_key.trim()).context("failed to parse public key")?;
    let expected = ContentHash::from_digest(digest.trim()).context("invalid digest")?;

    let mut file = tokio::fs::File::open(archive)
        .await
        .with_context(|| format!("failed to open archive: {}", archive.display()))?;
    let actual = digest_reader(&mut file)
        .await
        .context("failed to read archive")?;

    let envelope_signature = ExportSignature {
        digest: expected,
        signature: signature.trim().to_string(),
        key_name: key_name.clone(),
    };
    verify_export_signature(&envelope_signature, &actual, &[(key_name.clone(), key)])
        .context("signature verification failed")?;

    println!("Signature OK");
    println!("  Digest: {}", actual.to_digest());
    println!("  Key: {key_name}");
    Ok(())
}

fn normalize_base_url(url: &str) -> Result<String> {
    let trimmed = url.trim().trim_end_matches('/');
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        anyhow::bail!("server URL must start with http:// or https://, got {url:?}");
    }
    Ok(trimmed.to_string())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn generate_token_secret() -> String {
    use base64::Engine;
    use rand_core::{OsRng, RngCore};
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Hex SHA-256 of a token, the form the server stores.
fn hash_token(token: &str) -> String {
    use sha2::{Digest, Sha256};
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_base_url_trims_and_validates() {
        assert_eq!(
            normalize_base_url("https://ferry.example.com/").unwrap(),
            "https://ferry.example.com"
        );
        assert!(normalize_base_url("ferry.example.com").is_err());
    }

    #[test]
    fn format_bytes_uses_binary_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.0 MiB");
    }

    #[test]
    fn token_hash_matches_server_form() {
        // SHA-256 of "test-token", the hash AuthConfig::for_testing() uses.
        assert_eq!(
            hash_token("test-token"),
            "4c5dc9b7708905f77f5e5d16316b5dfb425e68cb326dcd55a860e90a7707031e"
        );
        let secret = generate_token_secret();
        assert_eq!(secret.len(), 43);
        assert_ne!(secret, generate_token_secret());
    }

    #[test]
    fn failed_status_is_an_error() {
        let status = ExportStatusResponse {
            export_id: "e1".to_string(),
            key: "e1/f.tar.gz".to_string(),
            import_kind: "File".to_string(),
            state: "abandoned".to_string(),
            size: None,
            stage: Some("Stage".to_string()),
            error: Some("staging write failed".to_string()),
        };
        assert!(finish_status(&status).is_err());

        let committed = ExportStatusResponse {
            state: "committed".to_string(),
            size: Some(10),
            stage: None,
            error: None,
            ..status
        };
        assert!(finish_status(&committed).is_ok());
    }
}
