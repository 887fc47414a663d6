//! `berth demo` — Run one of the reference workloads with timings.

use std::time::Instant;

use berth_common::config::HarnessConfig;
use berth_sdk::presets::{self, Postgres, Solr};
use berth_sdk::{Harness, ReadySet};
use chrono::{DateTime, TimeDelta, Utc};
use clap::{Args, ValueEnum};
use serde::Serialize;

use crate::output::{BOLD, DIM, GREEN, RESET, format_duration, print_header, print_ready};

/// Documents sent per `/update` request.
const BATCH_SIZE: usize = 10_000;

const NAME_ADJECTIVES: [&str; 8] = [
    "Ergonomic", "Rustic", "Sleek", "Refined", "Handcrafted", "Practical", "Small", "Gorgeous",
];
const NAME_MATERIALS: [&str; 6] = ["Steel", "Wooden", "Cotton", "Granite", "Plastic", "Rubber"];
const NAME_NOUNS: [&str; 8] = ["Chair", "Table", "Keyboard", "Lamp", "Shoes", "Gloves", "Bike", "Clock"];
const MANUFACTURERS: [&str; 5] = ["Acme Corp", "Globex", "Initech", "Umbrella", "Hooli"];
const CATEGORIES: [&str; 10] = [
    "electronics", "books", "garden", "toys", "sports", "home", "tools", "music", "games", "outdoors",
];
const COLORS: [&str; 7] = ["red", "green", "blue", "black", "white", "orange", "purple"];

/// Arguments for the `demo` command.
#[derive(Args, Debug)]
pub struct DemoArgs {
    /// Workload to run.
    #[arg(value_enum)]
    pub workload: Workload,

    /// Number of products to index (solr only).
    #[arg(long, default_value_t = 100_000)]
    pub products: usize,
}

/// Reference workloads.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Workload {
    /// GET / against nginx.
    Nginx,
    /// `SELECT 1` against PostgreSQL.
    Postgres,
    /// Index generated products into Solr and count them.
    Solr,
}

/// Executes the `demo` command.
///
/// # Errors
///
/// Returns an error if the workload's container fails to become ready, a
/// request against it fails, or teardown fails.
pub async fn execute(args: DemoArgs, config: HarnessConfig) -> anyhow::Result<()> {
    print_header();
    let harness = Harness::docker(config)?;
    match args.workload {
        Workload::Nginx => nginx(&harness).await,
        Workload::Postgres => postgres(&harness).await,
        Workload::Solr => solr(&harness, args.products).await,
    }
}

async fn nginx(harness: &Harness) -> anyhow::Result<()> {
    let definition = presets::nginx().name("berth-demo-nginx").build()?;
    let began = Instant::now();
    harness
        .run(vec![definition], |ready| async move {
            report_ready(&ready, began);
            let url = ready.require("berth-demo-nginx")?.endpoint(80)?.http_url("/");
            let sent = Instant::now();
            let response = reqwest::get(&url).await?;
            tracing::info!(status = %response.status(), %url, "got response from nginx");
            eprintln!(
                "  GET {url} {DIM}->{RESET} {BOLD}{}{RESET} in {}",
                response.status(),
                format_duration(sent.elapsed())
            );
            Ok::<_, anyhow::Error>(())
        })
        .await?;
    report_done(began);
    Ok(())
}

async fn postgres(harness: &Harness) -> anyhow::Result<()> {
    let postgres = Postgres::default();
    let definition = postgres.builder().name("berth-demo-postgres").build()?;
    let began = Instant::now();
    harness
        .run(vec![definition], |ready| async move {
            report_ready(&ready, began);
            let container = ready.require("berth-demo-postgres")?;
            eprintln!(
                "  {DIM}connection{RESET} {}",
                postgres.connection_string(&container.endpoint(Postgres::PORT)?)
            );

            let sent = Instant::now();
            let output = container.exec(&postgres.psql("SELECT 1")).await?;
            if !output.success() {
                anyhow::bail!("psql exited with {}: {}", output.exit_code, output.stderr.trim());
            }
            let result = output.stdout.trim();
            tracing::info!(result, "got result from postgres");
            eprintln!(
                "  SELECT 1 {DIM}->{RESET} {BOLD}{result}{RESET} in {}",
                format_duration(sent.elapsed())
            );
            Ok::<_, anyhow::Error>(())
        })
        .await?;
    report_done(began);
    Ok(())
}

async fn solr(harness: &Harness, count: usize) -> anyhow::Result<()> {
    let solr = Solr::default();
    let definition = solr.builder().name("berth-demo-solr").build()?;
    let began = Instant::now();
    harness
        .run(vec![definition], |ready| async move {
            report_ready(&ready, began);
            let core_url = solr.core_url(&ready.require("berth-demo-solr")?.endpoint(Solr::PORT)?);
            let client = reqwest::Client::new();

            let step = Instant::now();
            let products = generate_products(count, Utc::now());
            tracing::info!(count, elapsed = ?step.elapsed(), "products generated");
            eprintln!("  generated {BOLD}{count}{RESET} products in {}", format_duration(step.elapsed()));

            let step = Instant::now();
            for batch in products.chunks(BATCH_SIZE) {
                let _ = client
                    .post(format!("{core_url}/update"))
                    .json(batch)
                    .send()
                    .await?
                    .error_for_status()?;
            }
            let _ = client
                .post(format!("{core_url}/update?commit=true"))
                .json(&serde_json::json!({ "commit": {} }))
                .send()
                .await?
                .error_for_status()?;
            tracing::info!(elapsed = ?step.elapsed(), "products added to solr index");
            eprintln!("  indexed and committed in {}", format_duration(step.elapsed()));

            let step = Instant::now();
            let body: serde_json::Value = client
                .get(format!("{core_url}/select?q=*:*&rows=0"))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            let found = num_found(&body)?;
            tracing::info!(found, "got results from solr");
            eprintln!(
                "  q=*:* {DIM}->{RESET} {BOLD}{found}{RESET} documents in {}",
                format_duration(step.elapsed())
            );
            Ok::<_, anyhow::Error>(())
        })
        .await?;
    report_done(began);
    Ok(())
}

fn report_ready(ready: &ReadySet, began: Instant) {
    eprintln!("  {GREEN}ready{RESET} after {}:", format_duration(began.elapsed()));
    for container in ready {
        print_ready(container);
    }
    eprintln!();
}

fn report_done(began: Instant) {
    eprintln!();
    eprintln!("  {GREEN}done{RESET} in {} {DIM}(container removed){RESET}", format_duration(began.elapsed()));
}

/// A document in the `techproducts` schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Product {
    id: String,
    sku: String,
    name: String,
    manu_str: Vec<String>,
    cat: Vec<String>,
    color: String,
    price: f64,
    popularity: u32,
    #[serde(rename = "inStock")]
    in_stock: bool,
    timestamp: DateTime<Utc>,
}

/// Generates `count` products with unique ids. The same `count` and `base`
/// always produce the same documents.
#[must_use]
pub fn generate_products(count: usize, base: DateTime<Utc>) -> Vec<Product> {
    (0..count).map(|i| product(i, base)).collect()
}

fn product(i: usize, base: DateTime<Utc>) -> Product {
    // Knuth multiplicative hash spreads consecutive indexes across the tables.
    let h = i.wrapping_mul(2_654_435_761);
    let pick = |table: &[&str], shift: u32| table[(h >> shift) % table.len()].to_string();
    let categories = 1 + (h >> 7) % 3;
    let cents = u32::try_from(500 + (h >> 3) % 99_500).unwrap_or(u32::MAX);

    Product {
        id: format!("P{i:09}"),
        sku: format!("{:013}", 4_000_000_000_000 + u64::try_from(i).unwrap_or(0)),
        name: format!(
            "{} {} {}",
            pick(&NAME_ADJECTIVES, 2),
            pick(&NAME_MATERIALS, 5),
            pick(&NAME_NOUNS, 9)
        ),
        manu_str: vec![pick(&MANUFACTURERS, 4)],
        cat: (0..categories)
            .map(|c| CATEGORIES[(h >> 11).wrapping_add(c * 3) % CATEGORIES.len()].to_string())
            .collect(),
        color: pick(&COLORS, 6),
        price: f64::from(cents) / 100.0,
        popularity: u32::try_from((h >> 13) % 11).unwrap_or(0),
        in_stock: (h >> 8) % 5 != 0,
        timestamp: base + TimeDelta::minutes(i64::try_from(i % 525_600).unwrap_or(0)),
    }
}

/// Extracts `response.numFound` from a Solr select response.
///
/// # Errors
///
/// Returns an error if the field is missing or not a number.
pub fn num_found(body: &serde_json::Value) -> anyhow::Result<u64> {
    body.pointer("/response/numFound")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| anyhow::anyhow!("solr response has no numFound: {body}"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn base() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn generated_ids_are_unique() {
        let products = generate_products(5_000, base());
        let ids: HashSet<_> = products.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids.len(), 5_000);
    }

    #[test]
    fn generation_is_deterministic() {
        assert_eq!(generate_products(50, base()), generate_products(50, base()));
    }

    #[test]
    fn products_satisfy_schema_ranges() {
        for product in generate_products(1_000, base()) {
            assert_eq!(product.sku.len(), 13);
            assert!((1..=3).contains(&product.cat.len()));
            assert!((5.0..1000.0).contains(&product.price));
            assert!(product.popularity <= 10);
            assert!(product.timestamp >= base());
        }
    }

    #[test]
    fn products_serialize_with_solr_field_names() {
        let json = serde_json::to_value(&generate_products(1, base())[0]).expect("json");
        assert_eq!(json["id"], "P000000000");
        assert!(json.get("inStock").is_some());
        assert!(json["manu_str"].is_array());
        assert_eq!(json["timestamp"], "2026-01-01T00:00:00Z");
    }

    #[test]
    fn num_found_reads_select_response() {
        let body = serde_json::json!({
            "responseHeader": { "status": 0 },
            "response": { "numFound": 100_000, "start": 0, "docs": [] }
        });
        assert_eq!(num_found(&body).expect("count"), 100_000);
        assert!(num_found(&serde_json::json!({ "error": "no core" })).is_err());
    }
}
