//! Minimal end-to-end illustration of the handler runtime: a single
//! strongly-consistent projector subscribes to `all`, folds bank account
//! events into a balance table, and a "command dispatcher" waits for it to
//! catch up before reporting back to its caller.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventually_handlers::{
    resolve_options, start, Callbacks, Consistency, ConsistencyRegistry, EnrichedMetadata, HandleOutcome, Identity, InMemory, Metadata, RawHandlerOptions,
};
use tokio::sync::Mutex;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

#[derive(Debug, Clone)]
enum BankAccountEvent {
    Opened { account: String, initial_balance: i64 },
    Deposited { account: String, amount: i64 },
}

struct BalanceProjector {
    balances: Mutex<HashMap<String, i64>>,
}

#[async_trait]
impl Callbacks<BankAccountEvent> for BalanceProjector {
    type Error = Infallible;

    async fn handle(&self, payload: BankAccountEvent, metadata: &EnrichedMetadata) -> HandleOutcome<Self::Error> {
        let mut balances = self.balances.lock().await;
        match payload {
            BankAccountEvent::Opened { account, initial_balance } => {
                balances.insert(account, initial_balance);
            }
            BankAccountEvent::Deposited { account, amount } => {
                *balances.entry(account).or_insert(0) += amount;
            }
        }
        tracing::info!(event_number = metadata.event_number, "projected event");
        HandleOutcome::Ok
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()))
        .init();

    let store = Arc::new(InMemory::<BankAccountEvent>::default());
    let registry = ConsistencyRegistry::default();

    let projector = BalanceProjector { balances: Mutex::new(HashMap::new()) };

    let options = resolve_options(
        RawHandlerOptions {
            application: Some("bank".to_string()),
            name: Some("balance-projector".to_string()),
            ..Default::default()
        },
        Consistency::Strong,
        &projector,
    )
    .await?;

    let handler = start(Arc::clone(&store), options, Identity, projector, registry.clone());

    let event_number = store
        .append(
            "acc-1",
            "BankAccountOpened",
            BankAccountEvent::Opened {
                account: "acc-1".to_string(),
                initial_balance: 1000,
            },
            Metadata::new(),
        )
        .await;

    registry
        .wait_for("bank", &["balance-projector".to_string()], event_number, Duration::from_secs(1))
        .await
        .expect("projector should catch up within the timeout");

    println!("balance-projector has acked event {event_number}");

    handler.shutdown().await;
    Ok(())
}
