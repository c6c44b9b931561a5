//! Multi-agent simulator for the liquidation station
//!
//! Runs every participant in-process: each agent owns an `AbciApp` replica
//! and a `RoundBehaviour` driven by its own tick loop, while the main task
//! plays the consensus layer and cuts one block per interval out of the shared
//! `LocalTransport`. Lending market and subgraph are simulated. After every
//! block the replica digests are compared.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::Utc;
use clap::{value_parser, Arg, Command};
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use aea_skills::liquidation_station;
use round_abci::{
    AbciApp, AbciParams, AgentContext, ContractApi, ContractCall, ExternalCallError, HttpClient, HttpRequest,
    HttpResponse, LocalTransport, RawTransaction,
};

/// Shortfall of every under-water borrower, 250 tokens at 18 decimals
const SHORTFALL: u128 = 250_000_000_000_000_000_000;

/// Lending market with a fixed borrower book
struct SimulatedMarket {
    borrowers: Vec<(String, u128)>,
}

impl SimulatedMarket {
    fn new(borrowers: usize, underwater: usize) -> Self {
        let borrowers = (0..borrowers)
            .map(|i| {
                let shortfall = if i < underwater { SHORTFALL } else { 0 };
                (format!("0x{:040x}", i + 1), shortfall)
            })
            .collect();
        Self { borrowers }
    }

    fn shortfall(&self, account: &str) -> Option<u128> {
        self.borrowers
            .iter()
            .find(|(address, _)| address == account)
            .map(|(_, shortfall)| *shortfall)
    }
}

#[async_trait]
impl ContractApi for SimulatedMarket {
    async fn get_state(&self, call: ContractCall) -> Result<Value, ExternalCallError> {
        match call.callable.as_str() {
            "get_account_liquidity" => {
                let account = call.kwargs.get("account").and_then(Value::as_str).unwrap_or_default();
                match self.shortfall(account) {
                    Some(shortfall) => Ok(json!({"error": 0, "liquidity": "0", "shortfall": shortfall.to_string()})),
                    None => Ok(json!({"error": 13, "liquidity": "0", "shortfall": "0"})),
                }
            }
            "liquidate_borrow_allowed" => Ok(json!({"error": 0})),
            other => Err(ExternalCallError::Contract {
                callable: other.to_string(),
                message: "unknown callable".to_string(),
            }),
        }
    }

    async fn get_raw_transaction(&self, call: ContractCall) -> Result<RawTransaction, ExternalCallError> {
        Ok(RawTransaction {
            ledger_id: "ethereum".to_string(),
            body: json!({
                "to": call.contract_address,
                "method": call.callable,
                "kwargs": call.kwargs,
            }),
        })
    }
}

#[async_trait]
impl HttpClient for SimulatedMarket {
    async fn request(&self, _request: HttpRequest) -> Result<HttpResponse, ExternalCallError> {
        let accounts: Vec<Value> = self
            .borrowers
            .iter()
            .map(|(address, _)| json!({ "id": address }))
            .collect();
        let body = json!({"data": {"accounts": accounts}});
        Ok(HttpResponse::new(200, body.to_string()))
    }
}

fn default_params(participants: Vec<String>) -> AbciParams {
    AbciParams::new(participants[0].clone(), participants)
        .with_service_id("liquidation_station_sim")
        .with_round_timeout_seconds(30.0)
        .with_reset_timeout_seconds(60.0)
        .with_tick_interval_ms(50)
        .with_skill_param("comptroller_address", json!("0x8849f1a0cB6b5D6076aB150546EddEe193754F1C"))
        .with_skill_param("subgraph_url", json!("http://localhost:8000/subgraphs/name/0vix"))
        .with_skill_param("debt_market", json!("0xEBb865Bf286e6eA8aBf5ac97e1b56A76530F3fBe"))
        .with_skill_param("collateral_market", json!("0xee1727f5074E747716637e1776B7F7C7133f16b1"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = Command::new("agent-sim")
        .version("0.1.0")
        .author("Round ABCI Team")
        .about("Run N liquidation station agents in-process and check that their replicas agree")
        .arg(Arg::new("agents")
            .short('n')
            .long("agents")
            .value_name("N")
            .help("Number of participating agents")
            .value_parser(value_parser!(usize))
            .default_value("4"))
        .arg(Arg::new("blocks")
            .short('b')
            .long("blocks")
            .value_name("N")
            .help("Number of blocks to produce")
            .value_parser(value_parser!(u64))
            .default_value("40"))
        .arg(Arg::new("block-interval")
            .long("block-interval-ms")
            .value_name("MS")
            .help("Wall time between two blocks")
            .value_parser(value_parser!(u64))
            .default_value("200"))
        .arg(Arg::new("borrowers")
            .long("borrowers")
            .value_name("N")
            .help("Borrower accounts in the simulated market")
            .value_parser(value_parser!(usize))
            .default_value("5"))
        .arg(Arg::new("underwater")
            .long("underwater")
            .value_name("N")
            .help("How many of the borrowers are under water")
            .value_parser(value_parser!(usize))
            .default_value("2"))
        .arg(Arg::new("config")
            .short('c')
            .long("config")
            .value_name("FILE")
            .help("Agent TOML file providing timeouts and skill parameters"))
        .get_matches();

    let nb_agents = matches.get_one::<usize>("agents").copied().unwrap_or(4);
    let blocks = matches.get_one::<u64>("blocks").copied().unwrap_or(40);
    let block_interval = Duration::from_millis(matches.get_one::<u64>("block-interval").copied().unwrap_or(200));
    let borrowers = matches.get_one::<usize>("borrowers").copied().unwrap_or(5);
    let underwater = matches.get_one::<usize>("underwater").copied().unwrap_or(2);
    if nb_agents == 0 {
        bail!("at least one agent is required");
    }

    let addresses: Vec<String> = (0..nb_agents).map(|i| format!("agent_{i}")).collect();
    let base = match matches.get_one::<String>("config") {
        Some(path) => AbciParams::load(path).with_context(|| format!("loading {path}"))?,
        None => default_params(addresses.clone()),
    };

    let spec = Arc::new(liquidation_station::abci_app_spec(&base)?);
    let transport = LocalTransport::new();
    let market = Arc::new(SimulatedMarket::new(borrowers, underwater));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    info!(agents = nb_agents, blocks, borrowers, underwater, "Starting simulation");

    let mut apps = Vec::with_capacity(nb_agents);
    let mut drivers = Vec::with_capacity(nb_agents);
    let genesis = Utc::now();
    for address in &addresses {
        let params = AbciParams {
            agent_address: address.clone(),
            participants: addresses.clone(),
            ..base.clone()
        };
        params.validate()?;

        let app = Arc::new(Mutex::new(AbciApp::with_options(
            Arc::clone(&spec),
            params.setup_data(),
            genesis,
            params.app_options(),
        )?));
        let agent = AgentContext::new(address.clone(), Arc::new(transport.clone()))
            .with_contract_api(market.clone())
            .with_http_client(market.clone())
            .with_params(params.skill.clone());
        let mut driver = liquidation_station::round_behaviour(&spec, agent)?;

        let (driver_app, tick, shutdown) = (Arc::clone(&app), params.tick_interval(), shutdown_rx.clone());
        drivers.push(tokio::spawn(async move { driver.run(driver_app, tick, shutdown).await }));
        apps.push(app);
    }

    let mut interval = tokio::time::interval(block_interval);
    interval.tick().await;
    for _ in 0..blocks {
        interval.tick().await;
        let block = transport.next_block(Utc::now());
        debug!(height = block.height, payloads = block.payloads.len(), "Delivering block");

        let mut digests = Vec::with_capacity(apps.len());
        for (i, app) in apps.iter().enumerate() {
            let mut app = app.lock().await;
            let transitions = app.process_block(&block)?;
            if i == 0 {
                for transition in &transitions {
                    info!(
                        height = block.height,
                        period = transition.period_count,
                        from = transition.from,
                        event = %transition.event,
                        to = transition.to,
                        "Transition"
                    );
                }
            }
            digests.push(app.digest());
        }
        if digests.windows(2).any(|pair| pair[0] != pair[1]) {
            bail!("replicas diverged at height {}", block.height);
        }
    }

    shutdown_tx.send(true).context("stopping behaviour drivers")?;
    for driver in drivers {
        driver.await??;
    }

    let app = apps[0].lock().await;
    let submitted = app
        .synchronized_data()
        .get(liquidation_station::SUBMITTED_TRANSACTIONS_KEY)
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    info!(
        periods = app.period_count(),
        rounds = app.round_count(),
        round = app.current_round_id(),
        submitted,
        digest = %app.digest(),
        "Simulation finished"
    );
    Ok(())
}
