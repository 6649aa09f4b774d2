//! Self-contained demo of a persistent projection and an emitter over the
//! in-memory chronicler, persisted to a temporary JSON-file repository.
//!
//! Run with: `cargo run --example balances`
//!
//! Set `RUST_LOG=eventfold_projector=debug` to watch the cycles.

use std::sync::Arc;

use eventfold_projector::{
    Chronicler, InMemoryChronicler, JsonFileRepository, Projection, ProjectorManager, ProposedEvent,
    ReactionError, ReactionScope, SystemClock,
};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Domain events
// ---------------------------------------------------------------------------

/// Events of an `account-*` stream, adjacently tagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum AccountEvent {
    Opened { owner: String },
    Deposited { amount: i64 },
    Withdrawn { amount: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum LargeMovement {
    Flagged { account: String, amount: i64 },
}

// ---------------------------------------------------------------------------
// Balances projection (read model over every account)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Balances {
    accounts: u64,
    total: i64,
}

impl Projection for Balances {
    type Event = AccountEvent;

    fn react(&mut self, event: AccountEvent, _scope: &mut ReactionScope<'_>) -> Result<(), ReactionError> {
        match event {
            AccountEvent::Opened { .. } => self.accounts += 1,
            AccountEvent::Deposited { amount } => self.total += amount,
            AccountEvent::Withdrawn { amount } => self.total -= amount,
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Large-movement emitter
// ---------------------------------------------------------------------------

/// Emits a `Flagged` event to its own stream for every movement above 500.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LargeMovements {
    flagged: u64,
}

impl Projection for LargeMovements {
    type Event = AccountEvent;

    fn react(&mut self, event: AccountEvent, scope: &mut ReactionScope<'_>) -> Result<(), ReactionError> {
        let amount = match event {
            AccountEvent::Deposited { amount } | AccountEvent::Withdrawn { amount } => amount,
            AccountEvent::Opened { .. } => return Ok(()),
        };
        if amount > 500 {
            let account = scope.stream_name().to_owned();
            scope.emit(&LargeMovement::Flagged { account, amount })?;
            self.flagged += 1;
        }
        Ok(())
    }
}

fn event<E: Serialize>(event: &E) -> Result<ProposedEvent, serde_json::Error> {
    ProposedEvent::from_domain(event)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let tmp = tempfile::tempdir()?;
    let chronicler = Arc::new(InMemoryChronicler::new(Arc::new(SystemClock)));

    chronicler
        .create_stream(
            "account-alice",
            vec![
                event(&AccountEvent::Opened { owner: "alice".into() })?,
                event(&AccountEvent::Deposited { amount: 1200 })?,
                event(&AccountEvent::Withdrawn { amount: 200 })?,
            ],
        )
        .await?;
    chronicler
        .create_stream(
            "account-bob",
            vec![
                event(&AccountEvent::Opened { owner: "bob".into() })?,
                event(&AccountEvent::Deposited { amount: 300 })?,
            ],
        )
        .await?;

    let manager = ProjectorManager::new(
        chronicler.clone(),
        Arc::new(JsonFileRepository::new(tmp.path())),
    );

    let mut balances = manager
        .projection::<Balances>("balances")
        .from_categories(["account"])
        .build()?;
    balances.run(false).await?;

    let mut flags = manager
        .emitter::<LargeMovements>("large-movements")
        .from_categories(["account"])
        .build()?;
    flags.run(false).await?;

    let state = manager.state_of::<Balances>("balances").await?;
    println!("accounts = {}, total = {}", state.accounts, state.total);
    println!("flagged  = {}", flags.state().flagged);
    for checkpoint in manager.checkpoints_of("balances").await? {
        println!("  {} @ {}", checkpoint.stream_name, checkpoint.position);
    }

    assert_eq!(state.accounts, 2);
    assert_eq!(state.total, 1300);
    assert_eq!(chronicler.len("large-movements").await, Some(1));

    // Rebuild from scratch on the next start.
    manager.reset("balances").await?;
    balances.run(false).await?;
    assert_eq!(manager.state_of::<Balances>("balances").await?.total, 1300);

    println!("all assertions passed");
    Ok(())
}
