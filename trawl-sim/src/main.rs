// ABOUTME: Simulated discovery run wiring the full trawl core in-process.
// ABOUTME: Builds the service over the memory store and prints reports and alerts.

use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use trawl::prelude::*;

const AGENTS: [(&str, &str); 4] = [
    ("agent-roofing", "roof repair"),
    ("agent-gutters", "gutter cleaning"),
    ("agent-siding", "siding replacement"),
    ("agent-windows", "window install"),
];

async fn seed(store: &MemoryStore) -> Result<()> {
    store
        .save_account(&Account::new("acct-demo", "Demo Contracting"))
        .await?;
    for (id, keyword) in AGENTS {
        store
            .save_agent(
                &Agent::new(id, "acct-demo", format!("{} leads", keyword))
                    .keywords(vec![keyword.to_string()]),
            )
            .await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "trawl=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = TrawlConfig::from_env()?;
    let store = MemoryStore::shared();
    seed(&store).await?;

    let hooks = HookRegistry::shared();
    hooks
        .on_alert(|alert| {
            println!(
                "ALERT {:?}/{:?} on {}: {}",
                alert.alert_type, alert.severity, alert.identifier, alert.message
            );
        })
        .await;

    let sim = Simulation::new();
    // one flaky search so the retry path shows up in the logs
    sim.push_outcome(ScriptedOutcome::Transient("page crashed".into()));

    let service = DiscoveryService::start(
        config,
        store.clone(),
        &AutomationKind::Simulated(sim.clone()),
        Arc::new(PlaintextCipher),
        Arc::new(SystemClock),
        Some(hooks),
    )
    .await?;

    for n in 0..2 {
        let session = service
            .sessions()
            .create("acct-demo", format!("cookie=demo-{}", n).as_bytes(), "trawl-sim/0.1")
            .await?;
        println!("Session {} ready ({})", session.id, session.status);
    }
    let refresh = service.sessions().spawn_refresh_loop();

    let runs = AGENTS.iter().map(|(id, _)| {
        service.run_discovery(DiscoveryRequest::new(*id).priority(Priority::High))
    });
    for result in join_all(runs).await {
        match result {
            Ok(report) => println!("{}", serde_json::to_string_pretty(&report)?),
            Err(e) => println!("Run failed (retryable: {}): {}", e.is_retryable(), e),
        }
    }

    // same searches again: answered from the result cache
    let again = service
        .run_discovery(DiscoveryRequest::new(AGENTS[0].0).priority(Priority::High))
        .await?;
    println!(
        "Repeat run for {}: from_cache={} duplicates={}",
        again.agent_id, again.from_cache, again.duplicates_skipped
    );

    let stats = service.pool().stats();
    println!(
        "Pool: {} slots, {} completed, {} failed, avg {:.1}ms",
        stats.size, stats.completed, stats.failed, stats.avg_duration_ms
    );
    let sessions = service.sessions().stats().await;
    println!("Sessions: {:?}", sessions);
    println!("Searches performed: {}", sim.searches());

    refresh.shutdown().await;
    service.shutdown().await;
    Ok(())
}
