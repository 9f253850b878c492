//! CMS envelope command-line interface.
//!
//! Streams files through the envelope engine: password-based sealing and
//! opening, Ed25519 signing and verification, and digest envelopes.

use clap::{Parser, Subcommand};
use miette::{miette, Context, IntoDiagnostic, Result};
use std::fs;
use std::path::PathBuf;

use cms_envelope::crypto::software::{Ed25519SignContext, Ed25519VerifyContext, KekContext};
use cms_envelope::{
    deenvelope_data, envelope_data, handle, ActionKind, ConfigManager, EnvelopeContext,
    EnvelopeError, EnvelopeOptions, RequiredResource, Usage,
};

#[derive(Parser)]
#[command(name = "cmsenv")]
#[command(about = "Streaming CMS/PKCS#7 envelope tool")]
#[command(long_about = "
cmsenv - CMS envelope tool

EXAMPLES:
    # Password-protect a file (EnvelopedData)
    cmsenv seal secret.txt secret.cms --password hunter2

    # Open it again
    cmsenv open secret.cms secret.txt --password hunter2

    # Sign a file (SignedData); prints the verification key
    cmsenv sign report.pdf report.cms

    # Verify and extract
    cmsenv verify report.cms report.pdf --public-key <hex>

    # Digest envelope (DigestedData)
    cmsenv digest data.bin data.cms

ENVIRONMENT VARIABLES:
    RUST_LOG        Logging level (debug, info, warn, error)
")]
#[command(version)]
struct Cli {
    /// Configuration file path (defaults to the per-user config)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seal a file into a password-protected EnvelopedData envelope
    Seal {
        input: PathBuf,
        output: PathBuf,

        /// Password protecting the content
        #[arg(short, long)]
        password: String,

        /// Recipient identifier written into the envelope
        #[arg(short, long, default_value = "recipient-1")]
        recipient: String,
    },

    /// Open any envelope, recovering the payload
    Open {
        input: PathBuf,
        output: PathBuf,

        /// Password for password-protected envelopes
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Sign a file into a SignedData envelope
    Sign {
        input: PathBuf,
        output: PathBuf,

        /// Ed25519 seed as 64 hex characters (generated when omitted)
        #[arg(short, long)]
        key: Option<String>,

        /// Emit a detached signature (content stays external)
        #[arg(long)]
        detached: bool,
    },

    /// Verify a SignedData envelope and extract its payload
    Verify {
        input: PathBuf,
        output: Option<PathBuf>,

        /// Ed25519 public key as 64 hex characters
        #[arg(short = 'k', long)]
        public_key: String,

        /// External content file, for detached signatures
        #[arg(long)]
        content: Option<PathBuf>,
    },

    /// Wrap a file into a DigestedData envelope
    Digest { input: PathBuf, output: PathBuf },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let options = load_options(cli.config.as_deref())?;

    match cli.command {
        Commands::Seal {
            input,
            output,
            password,
            recipient,
        } => seal(&input, &output, &password, &recipient, options),
        Commands::Open {
            input,
            output,
            password,
        } => open(&input, &output, password.as_deref(), options),
        Commands::Sign {
            input,
            output,
            key,
            detached,
        } => sign(&input, &output, key.as_deref(), detached, options),
        Commands::Verify {
            input,
            output,
            public_key,
            content,
        } => verify(
            &input,
            output.as_deref(),
            &public_key,
            content.as_deref(),
            options,
        ),
        Commands::Digest { input, output } => digest(&input, &output, options),
    }
}

fn load_options(path: Option<&std::path::Path>) -> Result<EnvelopeOptions> {
    let manager = match path {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new().into_diagnostic()?,
    };
    let configuration = manager
        .load_or_create_default()
        .into_diagnostic()
        .context("loading configuration")?;
    configuration.options().into_diagnostic()
}

fn seal(
    input: &std::path::Path,
    output: &std::path::Path,
    password: &str,
    recipient: &str,
    options: EnvelopeOptions,
) -> Result<()> {
    let payload = fs::read(input)
        .into_diagnostic()
        .with_context(|| format!("reading {}", input.display()))?;

    let mut ctx = EnvelopeContext::new_enveloping(Usage::Encrypt, options).into_diagnostic()?;
    let kek = KekContext::from_password(recipient.as_bytes().to_vec(), password.as_bytes())
        .into_diagnostic()?;
    ctx.add_action(ActionKind::KeyExchangeConventional, handle(kek))
        .into_diagnostic()?;

    let wire = envelope_data(&mut ctx, &payload).into_diagnostic()?;
    fs::write(output, &wire)
        .into_diagnostic()
        .with_context(|| format!("writing {}", output.display()))?;
    log::info!(
        "sealed {} bytes into {} ({} bytes on the wire)",
        payload.len(),
        output.display(),
        wire.len()
    );
    Ok(())
}

fn open(
    input: &std::path::Path,
    output: &std::path::Path,
    password: Option<&str>,
    options: EnvelopeOptions,
) -> Result<()> {
    let wire = fs::read(input)
        .into_diagnostic()
        .with_context(|| format!("reading {}", input.display()))?;

    let mut ctx = EnvelopeContext::new_deenveloping(options).into_diagnostic()?;
    let payload = deenvelope_data(&mut ctx, &wire, |entry| match entry.required {
        RequiredResource::Password => {
            let password = password.ok_or_else(|| {
                EnvelopeError::ResourceRequired(format!(
                    "a password for recipient {}",
                    String::from_utf8_lossy(&entry.key_id)
                ))
            })?;
            let kek = KekContext::from_password(entry.key_id.clone(), password.as_bytes())?;
            Ok(Some(handle(kek)))
        }
        _ => Ok(None),
    })
    .into_diagnostic()
    .context("opening envelope")?;

    fs::write(output, &payload)
        .into_diagnostic()
        .with_context(|| format!("writing {}", output.display()))?;
    log::info!("recovered {} bytes from {}", payload.len(), input.display());
    Ok(())
}

fn sign(
    input: &std::path::Path,
    output: &std::path::Path,
    key: Option<&str>,
    detached: bool,
    options: EnvelopeOptions,
) -> Result<()> {
    let payload = fs::read(input)
        .into_diagnostic()
        .with_context(|| format!("reading {}", input.display()))?;

    let signer = match key {
        Some(hex_seed) => {
            let seed = hex::decode(hex_seed)
                .into_diagnostic()
                .context("decoding signing seed")?;
            Ed25519SignContext::from_seed(&seed).into_diagnostic()?
        }
        None => Ed25519SignContext::generate(),
    };
    let verifier = signer.verifier();
    println!(
        "verification key: {}",
        hex::encode(verifier.public_key_bytes())
    );

    let options = EnvelopeOptions {
        detached_signature: detached,
        ..options
    };
    let mut ctx = EnvelopeContext::new_enveloping(Usage::Sign, options).into_diagnostic()?;
    ctx.add_action(ActionKind::Sign, handle(signer))
        .into_diagnostic()?;

    let wire = envelope_data(&mut ctx, &payload).into_diagnostic()?;
    fs::write(output, &wire)
        .into_diagnostic()
        .with_context(|| format!("writing {}", output.display()))?;
    log::info!("signed {} into {}", input.display(), output.display());
    Ok(())
}

fn verify(
    input: &std::path::Path,
    output: Option<&std::path::Path>,
    public_key: &str,
    content: Option<&std::path::Path>,
    options: EnvelopeOptions,
) -> Result<()> {
    let wire = fs::read(input)
        .into_diagnostic()
        .with_context(|| format!("reading {}", input.display()))?;
    let key_bytes = hex::decode(public_key)
        .into_diagnostic()
        .context("decoding public key")?;

    let mut ctx = EnvelopeContext::new_deenveloping(options).into_diagnostic()?;
    // Parse the whole structure first; signer entries stay pending.
    let payload = deenvelope_data(&mut ctx, &wire, |_| Ok(None))
        .into_diagnostic()
        .context("parsing envelope")?;

    if ctx.is_detached_signature() {
        let content = content.ok_or_else(|| {
            miette!("this envelope carries a detached signature; pass --content <FILE>")
        })?;
        let external = fs::read(content)
            .into_diagnostic()
            .with_context(|| format!("reading {}", content.display()))?;
        use sha2::{Digest, Sha256};
        ctx.supply_detached_digest(Sha256::digest(&external).as_slice())
            .into_diagnostic()?;
    }

    let mut verified = 0usize;
    let mut pending = ctx.first_pending_resource();
    while let Some(id) = pending {
        let next = ctx.next_pending_resource(id);
        if ctx.entry(id).into_diagnostic()?.required == RequiredResource::Signature {
            let verifier = Ed25519VerifyContext::from_public_key(&key_bytes).into_diagnostic()?;
            ctx.supply_resource(id, handle(verifier))
                .into_diagnostic()
                .context("signature verification failed")?;
            verified += 1;
        }
        pending = next;
    }
    if verified == 0 {
        return Err(miette!("the envelope contains no signatures to verify"));
    }
    println!("{verified} signature(s) verified");

    if let Some(output) = output {
        fs::write(output, &payload)
            .into_diagnostic()
            .with_context(|| format!("writing {}", output.display()))?;
    }
    Ok(())
}

fn digest(
    input: &std::path::Path,
    output: &std::path::Path,
    options: EnvelopeOptions,
) -> Result<()> {
    let payload = fs::read(input)
        .into_diagnostic()
        .with_context(|| format!("reading {}", input.display()))?;

    let mut ctx = EnvelopeContext::new_enveloping(Usage::Hash, options).into_diagnostic()?;
    let wire = envelope_data(&mut ctx, &payload).into_diagnostic()?;
    fs::write(output, &wire)
        .into_diagnostic()
        .with_context(|| format!("writing {}", output.display()))?;
    log::info!("digested {} into {}", input.display(), output.display());
    Ok(())
}
