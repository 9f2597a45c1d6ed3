// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic stamps-data usage example.
//!
//! Demonstrates:
//! 1. Connecting to MySQL and Redis
//! 2. Writing a few balance rows
//! 3. Cached reads (second read is served from cache)
//! 4. Category invalidation after a write
//! 5. Displaying pool, breaker and cache state plus raw metrics
//! 6. Clean shutdown
//!
//! # Prerequisites
//!
//! A MySQL and a Redis reachable on localhost:
//! ```bash
//! docker run -d -p 3306:3306 -e MYSQL_ROOT_PASSWORD=test -e MYSQL_DATABASE=test mysql:8
//! docker run -d -p 6379:6379 redis:7
//! ```
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde::Deserialize;
use stamps_data::{sql_params, DataAccess, DataAccessConfig, Environment, Ttl};

#[derive(Debug, Deserialize)]
struct Balance {
    address: String,
    tick: String,
    amt: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt().with_target(false).compact().init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           stamps-data: Basic Usage Example                    ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the service
    // ─────────────────────────────────────────────────────────────────────────
    let config = DataAccessConfig {
        db_host: "127.0.0.1".into(),
        db_user: "root".into(),
        db_password: "test".into(),
        db_name: "test".into(),
        elasticache_endpoint: Some("127.0.0.1".into()),
        elasticache_tls: false,
        cache_key_prefix: Some("demo:".into()),
        // Development bypasses the cache entirely
        environment: Environment::Production,
        ..Default::default()
    };
    let service = DataAccess::connect(config).await?;
    println!("✅ Service {} (caching: {})\n", service.state(), service.caching_enabled());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Write some rows
    // ─────────────────────────────────────────────────────────────────────────
    service
        .execute_query(
            "CREATE TABLE IF NOT EXISTS balances (address VARCHAR(64), tick VARCHAR(16), amt DECIMAL(38,8), PRIMARY KEY (address, tick))",
            &[],
        )
        .await?;
    for (tick, amt) in [("KEVIN", "1000.5"), ("STAMP", "42"), ("PEPE", "0.00000001")] {
        let out = service
            .execute_query(
                "REPLACE INTO balances (address, tick, amt) VALUES (?, ?, ?)",
                &sql_params!["bc1qdemo", tick, amt],
            )
            .await?;
        println!("   wrote {tick} ({} row(s))", out.affected());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Cached reads
    // ─────────────────────────────────────────────────────────────────────────
    let sql = "SELECT address, tick, CAST(amt AS CHAR) AS amt FROM balances WHERE address = ? ORDER BY tick";
    for pass in 1..=2 {
        let balances: Vec<Balance> = service
            .query_as_cached(sql, &sql_params!["bc1qdemo"], Ttl::secs(60))
            .await?;
        println!("\n📖 Read pass {pass}: {} balances", balances.len());
        for b in &balances {
            println!("   {} {} = {}", b.address, b.tick, b.amt);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Invalidate after a write
    // ─────────────────────────────────────────────────────────────────────────
    service
        .execute_query(
            "UPDATE balances SET amt = amt + 1 WHERE address = ? AND tick = ?",
            &sql_params!["bc1qdemo", "STAMP"],
        )
        .await?;
    let dropped = service.invalidate_cache_by_category("balance").await;
    println!("\n🧹 Invalidated {dropped} cached balance quer(ies)");

    // ─────────────────────────────────────────────────────────────────────────
    // 5. State and metrics
    // ─────────────────────────────────────────────────────────────────────────
    let health = service.health();
    println!("\n📊 Health:\n{}", serde_json::to_string_pretty(&health)?);
    println!("\n📈 Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Shutdown
    // ─────────────────────────────────────────────────────────────────────────
    service.shutdown().await;
    println!("\n👋 Service {}", service.state());
    Ok(())
}

/// Dump all captured metrics
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
            let rendered = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
                DebugValue::Histogram(samples) => {
                    let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                    format!("count={} sum={sum:.4}", samples.len())
                }
            };
            format!("{}{} = {}", key.name(), label_str, rendered)
        })
        .collect();
    lines.sort();

    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in lines {
        println!("   └─ {line}");
    }
}
