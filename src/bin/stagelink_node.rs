use clap::{App, Arg};
use stagelink::agent::TransportAgent;
use stagelink::clock::SoftwareClock;
use stagelink::config::NodeConfig;
use stagelink::node::MeshNode;
use stagelink::registry::{ServiceRecord, ServiceType};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("stagelink-node")
        .version("0.1.0")
        .about("🎚  StageLink mesh node - discovery, service registry, and transport agent")
        .arg(
            Arg::with_name("name")
                .long("name")
                .value_name("NAME")
                .help("Node display name (defaults to the hostname)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("host")
                .long("host")
                .value_name("ADDR")
                .help("Address peers should reach this node at")
                .takes_value(true)
                .default_value("127.0.0.1"),
        )
        .arg(
            Arg::with_name("agent-port")
                .long("agent-port")
                .value_name("PORT")
                .help("UDP port for transport commands")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("sample-rate")
                .long("sample-rate")
                .value_name("HZ")
                .help("Software clock sample rate")
                .takes_value(true)
                .default_value("48000"),
        )
        .arg(
            Arg::with_name("db")
                .long("db")
                .value_name("PATH")
                .help("Registry database path (omit to disable persistence)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("broadcast")
                .long("broadcast")
                .value_name("ADDR")
                .help("Discovery broadcast address")
                .takes_value(true)
                .default_value("255.255.255.255"),
        )
        .get_matches();

    let mut config = NodeConfig::default();
    if let Some(name) = matches.value_of("name") {
        config.node_name = name.to_string();
    }
    if let Some(host) = matches.value_of("host") {
        config.host = host.to_string();
    }
    if let Some(port) = matches.value_of("agent-port") {
        config.agent_port = port.parse()?;
    }
    if let Some(addr) = matches.value_of("broadcast") {
        config.broadcast_addr = addr.to_string();
    }
    config.db_path = matches.value_of("db").map(PathBuf::from);
    let sample_rate: u32 = matches.value_of("sample-rate").unwrap_or("48000").parse()?;

    println!("🎚  StageLink Node");
    println!("==================");

    let node = MeshNode::start(config.clone()).await?;

    let clock = Arc::new(SoftwareClock::new(sample_rate));
    let agent = TransportAgent::bind(
        &format!("0.0.0.0:{}", config.agent_port),
        config.node_id.clone(),
        clock,
    )
    .await?;
    let mut agent_handle = agent.spawn();

    let mut record = ServiceRecord::new(ServiceType::Transport, "transport-agent");
    record.endpoint = Some(config.host.clone());
    record.port = Some(config.agent_port);
    record
        .capabilities
        .insert("sample_rate".to_string(), serde_json::json!(sample_rate));
    if let Err(e) = node.registry().register_service(record) {
        error!("transport service registration failed: {}", e);
    }

    loop {
        tokio::select! {
            Some(snapshot) = agent_handle.states.recv() => {
                info!(
                    "transport {} at frame {}",
                    snapshot.state.as_str(),
                    snapshot.frame
                );
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("shutting down");
                break;
            }
        }
    }

    node.shutdown();
    agent_handle.shutdown();
    Ok(())
}
