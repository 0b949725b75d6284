//! Countersign CLI - operator utilities for keys, credentials and the audit chain.
//!
//! ```bash
//! # Generate a signing key pair
//! countersign keygen --name grid_ops
//!
//! # Produce a credential proof for a request
//! countersign sign --key $GRID_OPS_PRIVATE_KEY --request req_0190... \
//!     --subject incident-42 --authority grid-ops-lead
//!
//! # Verify a database offline
//! countersign verify-chain --db /var/lib/countersign/countersign.db
//! ```

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use countersign::{
    audit::ChainVerifier,
    config::CountersignConfig,
    credential::SigningClaim,
    store::AUDIT_PAGE_SIZE,
    AuditAction, AuditFilter, AuthorityId, CredentialAction, CredentialClass, CredentialProof,
    RequestId, SigningKey, SqliteStore, Store,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "countersign")]
#[command(about = "Countersign operator utilities", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an Ed25519 key pair
    Keygen {
        /// Prefix of the printed variable names
        #[arg(short, long, default_value = "key")]
        name: String,

        /// Also write the private key as PKCS#8 PEM to this path, and the
        /// public key beside it (`alpha.pem` -> `alpha.pub.pem`)
        #[arg(long)]
        pem: Option<PathBuf>,

        /// Overwrite an existing PEM file
        #[arg(short, long)]
        force: bool,
    },

    /// Produce a credential proof (JSON) for a request
    Sign {
        /// Private key: hex string, or path to a hex or PEM file
        #[arg(short, long, env = "COUNTERSIGN_SIGNING_KEY", hide_env_values = true)]
        key: String,

        /// Request ID (req_...)
        #[arg(short, long)]
        request: String,

        /// Subject reference of the request
        #[arg(short, long)]
        subject: String,

        /// Authority the proof is made for
        #[arg(short, long)]
        authority: String,

        #[arg(long, value_enum, default_value_t = Action::Sign)]
        action: Action,

        /// Emergency override credential (sign with the override key)
        #[arg(long = "override")]
        emergency_override: bool,
    },

    /// Verify the audit chain of a SQLite database from genesis
    VerifyChain {
        #[arg(long, env = "COUNTERSIGN_DB")]
        db: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print audit entries as JSON lines
    Audit {
        #[arg(long, env = "COUNTERSIGN_DB")]
        db: PathBuf,

        /// Only entries with this action (e.g. sign, authorize, expire)
        #[arg(long)]
        action: Option<String>,

        #[arg(long)]
        actor: Option<String>,

        #[arg(long)]
        request: Option<String>,

        /// First sequence number to print
        #[arg(long)]
        from: Option<u64>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Validate a configuration file
    CheckConfig {
        #[arg(short, long, env = "COUNTERSIGN_CONFIG")]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Action {
    Sign,
    Reject,
}

impl From<Action> for CredentialAction {
    fn from(action: Action) -> Self {
        match action {
            Action::Sign => CredentialAction::Sign,
            Action::Reject => CredentialAction::Reject,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli.command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match command {
        Commands::Keygen { name, pem, force } => {
            let key = SigningKey::generate();
            if let Some(path) = pem {
                if path.exists() && !force {
                    return Err(
                        format!("{} exists (use --force to overwrite)", path.display()).into(),
                    );
                }
                let public = path.with_extension("pub.pem");
                fs::write(&path, key.to_pem()?)?;
                fs::write(&public, key.public_key().to_pem()?)?;
                eprintln!("wrote {} and {}", path.display(), public.display());
            }
            let prefix = name.to_uppercase();
            println!("export {}_PRIVATE_KEY={}", prefix, hex::encode(key.secret_key_bytes()));
            println!("export {}_PUBLIC_KEY={}", prefix, key.public_key().to_hex());
            Ok(ExitCode::SUCCESS)
        }

        Commands::Sign {
            key,
            request,
            subject,
            authority,
            action,
            emergency_override,
        } => {
            let key = load_key(&key)?;
            let request_id = RequestId::parse(request)?;
            let authority_id = AuthorityId::new(authority);
            let class = if emergency_override {
                CredentialClass::EmergencyOverride
            } else {
                CredentialClass::Standard
            };
            let claim = SigningClaim {
                action: action.into(),
                request_id: &request_id,
                subject_ref: &subject,
                authority_id: &authority_id,
            };
            let proof = CredentialProof::create(&key, class, &claim, Utc::now());
            println!("{}", serde_json::to_string_pretty(&proof)?);
            Ok(ExitCode::SUCCESS)
        }

        Commands::VerifyChain { db, json } => {
            let store = SqliteStore::open_read_only(&db)?;
            let head = store.chain_head()?;

            let mut verifier = ChainVerifier::from_genesis();
            let mut next = 1;
            'pages: loop {
                let page = store.audit_page(next, AUDIT_PAGE_SIZE)?;
                if page.is_empty() {
                    break;
                }
                for entry in &page {
                    if !verifier.push(entry) {
                        break 'pages;
                    }
                    next = entry.sequence_number + 1;
                }
            }
            verifier.expect_through(head.last_sequence);
            let verification = verifier.finish();

            if json {
                println!("{}", serde_json::to_string_pretty(&verification)?);
            } else if verification.valid {
                println!(
                    "OK: {} entries verified, head {} ({})",
                    verification.entries_checked, head.last_sequence, head.last_hash
                );
            } else {
                println!(
                    "CORRUPT at sequence {}: {}",
                    verification.first_invalid_sequence.unwrap_or_default(),
                    verification.details.as_deref().unwrap_or("hash mismatch")
                );
            }
            Ok(if verification.valid {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Commands::Audit {
            db,
            action,
            actor,
            request,
            from,
            limit,
        } => {
            let store = SqliteStore::open_read_only(&db)?;
            let filter = AuditFilter {
                action: action.as_deref().map(str::parse::<AuditAction>).transpose()?,
                actor,
                subject_ref: None,
                request_id: request.map(RequestId::parse).transpose()?,
                from_sequence: from,
                limit,
            };
            for entry in store.audit_entries(&filter)? {
                println!("{}", serde_json::to_string(&entry)?);
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::CheckConfig { config } => {
            let parsed = CountersignConfig::from_file(&config)?;
            match parsed.validate() {
                Ok(()) => {
                    println!(
                        "{}: OK ({} authorities, request TTL {}s)",
                        config.display(),
                        parsed.authorities.len(),
                        parsed.settings.request_ttl_secs
                    );
                    Ok(ExitCode::SUCCESS)
                }
                Err(errors) => {
                    for e in &errors {
                        println!("{}: {}", config.display(), e);
                    }
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}

/// Accept a hex key inline, or a file holding hex or PKCS#8 PEM.
fn load_key(input: &str) -> Result<SigningKey, Box<dyn std::error::Error>> {
    let path = Path::new(input);
    if !path.is_file() {
        return Ok(SigningKey::from_hex(input.trim())?);
    }
    let content = fs::read_to_string(path)?;
    let content = content.trim();
    if content.starts_with("-----BEGIN") {
        Ok(SigningKey::from_pem(content)?)
    } else {
        Ok(SigningKey::from_hex(content)?)
    }
}
