use anyhow::{anyhow, bail, Context, Result};
use clap::{Arg, ArgAction, Command};
use std::fs;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use audit_anchor::audit::{compute_root, verify_inclusion, AuditEvent, Digest};
use audit_anchor::config::AppConfig;
use audit_anchor::database::Database;
use audit_anchor::service::{AnchoredProof, AuditQuery};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("verify-anchor")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Independently verify anchored audit events")
        .arg(
            Arg::new("proof-file")
                .short('p')
                .long("proof-file")
                .value_name("PATH")
                .help("Anchored proof JSON as served by GET /events/{id}/proof"),
        )
        .arg(
            Arg::new("event-file")
                .short('e')
                .long("event-file")
                .value_name("PATH")
                .help("Original audit event JSON to check against the proof"),
        )
        .arg(
            Arg::new("root")
                .short('r')
                .long("root")
                .value_name("DIGEST")
                .help("Root read from the ledger (sha256:<hex>); defaults to the proof's root"),
        )
        .arg(
            Arg::new("database")
                .short('d')
                .long("database")
                .value_name("URL")
                .help("Anchor database to verify against"),
        )
        .arg(
            Arg::new("event-id")
                .short('i')
                .long("event-id")
                .value_name("UUID")
                .help("Event to verify against the anchor database"),
        )
        .arg(
            Arg::new("print-default-config")
                .long("print-default-config")
                .help("Print the default service configuration as TOML")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose output")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Suppress output except errors")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    let quiet = matches.get_flag("quiet");

    // Set log level based on flags
    let level = if quiet {
        tracing::Level::ERROR
    } else if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    if matches.get_flag("print-default-config") {
        print!("{}", AppConfig::default().to_toml()?);
        return Ok(());
    }

    let outcome = if let Some(proof_file) = matches.get_one::<String>("proof-file") {
        verify_proof_file(
            proof_file,
            matches.get_one::<String>("event-file").map(String::as_str),
            matches.get_one::<String>("root").map(String::as_str),
            verbose,
        )
    } else if let Some(event_id) = matches.get_one::<String>("event-id") {
        let database_url = match matches.get_one::<String>("database") {
            Some(url) => url.clone(),
            None => AppConfig::load()?.database_url,
        };
        verify_stored_event(&database_url, event_id, verbose).await
    } else {
        bail!("Nothing to verify: pass --proof-file or --event-id");
    };

    if let Err(e) = outcome {
        error!("Verification failed: {:#}", e);
        std::process::exit(1);
    }

    if !quiet {
        println!("✓ Anchor verification completed successfully");
    }

    Ok(())
}

fn verify_proof_file(
    proof_file: &str,
    event_file: Option<&str>,
    ledger_root: Option<&str>,
    verbose: bool,
) -> Result<()> {
    info!("Verifying proof file: {}", proof_file);

    let contents = fs::read_to_string(proof_file)
        .with_context(|| format!("Failed to read {}", proof_file))?;
    let anchored: AnchoredProof =
        serde_json::from_str(&contents).with_context(|| format!("Invalid proof file {}", proof_file))?;

    let expected_root: Digest = match ledger_root {
        Some(root) => root.parse().map_err(|e| anyhow!("Invalid --root: {}", e))?,
        None => anchored.merkle_root,
    };
    if expected_root != anchored.merkle_root {
        bail!(
            "Proof was issued for root {} but the ledger holds {}",
            anchored.merkle_root,
            expected_root
        );
    }

    let event_hash = match event_file {
        Some(path) => {
            let contents =
                fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;
            let event: AuditEvent =
                serde_json::from_str(&contents).with_context(|| format!("Invalid event file {}", path))?;
            if !event.verify_payload_hash() {
                bail!("Event {} payload does not match its payload hash", event.id);
            }
            if event.id != anchored.event_id {
                bail!("Event file is {} but the proof is for {}", event.id, anchored.event_id);
            }
            event.event_hash()
        }
        None => anchored.proof.event_hash,
    };

    if verbose {
        println!("Event:       {}", anchored.event_id);
        println!("Batch:       {} (#{})", anchored.batch_id, anchored.sequence_number);
        println!("Event hash:  {}", event_hash);
        println!("Proof:       {}", anchored.proof.summary());
        println!("Computed:    {}", compute_root(&event_hash, &anchored.proof));
        println!("Anchored:    {}", expected_root);
        println!(
            "Ledger tx:   {}",
            anchored.ledger_tx_ref.as_deref().unwrap_or("(not submitted)")
        );
    }

    if !verify_inclusion(&event_hash, &anchored.proof, &expected_root) {
        bail!(
            "Event {} is not included under root {}",
            anchored.event_id,
            expected_root
        );
    }
    if !anchored.is_confirmed() {
        info!("Proof is valid but the batch is not confirmed on the ledger yet");
    }

    info!("Inclusion of {} under {} verified", anchored.event_id, expected_root);
    Ok(())
}

async fn verify_stored_event(database_url: &str, event_id: &str, verbose: bool) -> Result<()> {
    let event_id = Uuid::parse_str(event_id).with_context(|| format!("Invalid event id {}", event_id))?;
    info!("Verifying event {} against {}", event_id, database_url);

    let database = Database::new(database_url).await?;
    let query = AuditQuery::new(Arc::new(database));

    let anchored = query.get_proof(event_id).await?;
    if verbose {
        println!("{}", serde_json::to_string_pretty(&anchored)?);
    }

    if !query.verify(event_id).await? {
        bail!(
            "Event {} is committed to batch {} but not anchored yet",
            event_id,
            anchored.batch_id
        );
    }

    info!(
        "Event {} verified: root {} in ledger tx {}",
        event_id,
        anchored.merkle_root,
        anchored.ledger_tx_ref.as_deref().unwrap_or("-")
    );
    Ok(())
}
