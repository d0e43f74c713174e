use std::{
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
};

use anyhow::Context;
use clap::Parser;
use p11probe_core::{
    config::DEFAULT_CONFIG_FILE,
    driver::{DEFAULT_ALIAS, DEFAULT_KEY_BITS, DEFAULT_PIN},
    run, run_loaded, Outcome, Pin, Pkcs11Provider, ProbeSettings, SoftProvider,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "p11probe PKCS#11 smoke test",
    long_about = "Smoke-test a PKCS#11 provider: SHA-256 digest, random bytes, \
                  keystore persistence, AES block ciphers and AES-GCM."
)]
struct Cli {
    /// Provider configuration file (env: P11PROBE_CONFIG).
    #[arg(long, env = "P11PROBE_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Keystore and key entry PIN (env: P11PROBE_PIN).
    #[arg(long, env = "P11PROBE_PIN", default_value = DEFAULT_PIN, hide_env_values = true)]
    pin: String,

    /// Alias of the AES key entry.
    #[arg(long, default_value = DEFAULT_ALIAS)]
    alias: String,

    /// AES key size in bits.
    #[arg(long, default_value_t = DEFAULT_KEY_BITS, value_parser = parse_key_bits)]
    key_bits: usize,

    /// Use the built-in software provider instead of a PKCS#11 module.
    #[arg(long)]
    software: bool,

    /// Print the mechanisms the token makes available.
    #[arg(long)]
    list_mechanisms: bool,

    /// Delete the key entry after the cipher tests.
    #[arg(long)]
    remove_key: bool,
}

fn parse_key_bits(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(bits @ (128 | 192 | 256)) => Ok(bits),
        _ => Err(format!("expected 128, 192 or 256, got {value}")),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_target(false),
        )
        .init();
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing();

    let settings = ProbeSettings {
        pin: Pin::new(cli.pin.clone()),
        alias: cli.alias.clone(),
        key_bits: cli.key_bits,
        list_mechanisms: cli.list_mechanisms,
        remove_key: cli.remove_key,
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let outcome = if cli.software {
        let provider = SoftProvider::new(settings.pin.clone());
        run(&provider, &settings, &mut out)
    } else {
        info!(config = %cli.config.display(), "configuring PKCS#11 provider");
        run_loaded(
            Pkcs11Provider::from_config_file(&cli.config),
            &settings,
            &mut out,
        )
    }
    .context("failed to write the probe report")?;
    out.flush().context("failed to flush stdout")?;

    if let Outcome::Mismatch { transformation } = &outcome {
        error!(%transformation, "round trip failed");
    }
    Ok(ExitCode::from(outcome.exit_code()))
}
