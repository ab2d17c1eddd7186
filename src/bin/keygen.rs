//! ML-DSA-65 keypair generator for paygate-node feed signing.
//!
//! Writes `feed-signing-key.secret` and `feed-signing-key.pub` into the
//! output directory and prints the public key so consumers can pin it.
//!
//! Usage:
//!   cargo run --bin paygate-keygen -- [output-dir]

use clap::Parser;
use color_eyre::eyre::{eyre, WrapErr};
use paygate_node::FeedSigner;
use saorsa_pqc::api::sig::ml_dsa_65;
use std::fs;
use std::path::PathBuf;

/// Generate a feed signing keypair.
#[derive(Parser, Debug)]
#[command(name = "paygate-keygen")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory to write the key files into.
    #[arg(default_value = ".")]
    output_dir: PathBuf,

    /// Overwrite existing key files.
    #[arg(long)]
    force: bool,
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    println!("ML-DSA-65 Keypair Generator for paygate-node feeds\n");

    // Create output directory if it doesn't exist
    fs::create_dir_all(&args.output_dir).wrap_err("failed to create output directory")?;

    let sk_path = args.output_dir.join("feed-signing-key.secret");
    let pk_path = args.output_dir.join("feed-signing-key.pub");
    if !args.force && (sk_path.exists() || pk_path.exists()) {
        return Err(eyre!(
            "key files already exist in {} (use --force to overwrite)",
            args.output_dir.display()
        ));
    }

    println!("Generating ML-DSA-65 keypair...");
    let (public_key, secret_key) = ml_dsa_65()
        .generate_keypair()
        .map_err(|e| eyre!("failed to generate keypair: {e}"))?;

    let pk_bytes = public_key.to_bytes();
    let sk_bytes = secret_key.to_bytes();

    println!("  Public key size: {} bytes", pk_bytes.len());
    println!("  Secret key size: {} bytes", sk_bytes.len());

    // Save secret key to file (KEEP THIS SECURE!)
    fs::write(&sk_path, &sk_bytes).wrap_err("failed to write secret key")?;
    println!("\nSecret key saved to: {}", sk_path.display());
    println!("  WARNING: Keep this file secure! It signs every feed packet.");

    fs::write(&pk_path, &pk_bytes).wrap_err("failed to write public key")?;
    println!("Public key saved to: {}", pk_path.display());

    // Load the pair back the way the node will
    let signer = FeedSigner::from_files(&sk_path, &pk_path)?;

    println!(
        "\nGenerated: {}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("Fingerprint: {}", signer.public_key_fingerprint());
    println!("Public key (hex):\n{}", signer.public_key_hex());
    println!("\nSet in config.toml:");
    println!("  [feeds]");
    println!("  signing_key_path = \"{}\"", sk_path.display());
    println!("  public_key_path = \"{}\"", pk_path.display());
    Ok(())
}
