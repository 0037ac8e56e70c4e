use std::env;
use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use rusqlite::Connection;

use ledger_recon::{
    load_statement_rows, setup_database, BusinessMergeEngine, ReconciliationEngine,
};

const DEFAULT_DB: &str = "ledger.db";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("import") => {
            let Some(csv_path) = args.get(2) else {
                eprintln!("Usage: ledger-recon import <statement.csv> [db]");
                std::process::exit(1);
            };
            let db_path = args.get(3).map(|s| s.as_str()).unwrap_or(DEFAULT_DB);
            run_import(Path::new(csv_path), Path::new(db_path))
        }
        Some("detect-merges") => {
            let db_path = args.get(2).map(|s| s.as_str()).unwrap_or(DEFAULT_DB);
            run_detect_merges(Path::new(db_path))
        }
        _ => {
            eprintln!("Usage: ledger-recon <import|detect-merges> ...");
            eprintln!("  import <statement.csv> [db]   ingest a parsed statement file");
            eprintln!("  detect-merges [db]            scan businesses for near-duplicates");
            std::process::exit(1);
        }
    }
}

fn run_import(csv_path: &Path, db_path: &Path) -> Result<()> {
    println!("📂 Loading statement rows from {}...", csv_path.display());
    let rows = load_statement_rows(csv_path)?;
    println!("✓ Loaded {} rows", rows.len());

    let conn = Connection::open(db_path)?;
    setup_database(&conn)?;

    let engine = ReconciliationEngine::default();
    let summary = engine.ingest_batch(&conn, &rows, Utc::now().date_naive())?;

    println!("✓ Batch {} ingested", summary.batch_id);
    println!("  new:          {}", summary.new);
    println!("  duplicates:   {}", summary.duplicates);
    println!("  group joined: {}", summary.group_joined);
    println!("  completed:    {}", summary.completed);
    if !summary.unresolved.is_empty() {
        println!("⚠ {} row(s) need attention:", summary.unresolved.len());
        for row in &summary.unresolved {
            println!("  row {}: {}", row.row_index, row.reason);
        }
    }

    Ok(())
}

fn run_detect_merges(db_path: &Path) -> Result<()> {
    let conn = Connection::open(db_path)?;
    setup_database(&conn)?;

    let engine = BusinessMergeEngine::default();
    let result = engine.detect_merges(&conn)?;

    println!(
        "✓ Compared {} businesses, created {} suggestion(s)",
        result.businesses_compared, result.suggestions_created
    );

    Ok(())
}
