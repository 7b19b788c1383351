use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use replog::config::{NodeConfig, PeerConfig};
use replog::node::Node;
use replog::proto::log_service_client::LogServiceClient;
use replog::proto::{GetLeaderRequest, SubmitCommandRequest, SubmitStatus};
use replog::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "replog")]
#[command(version)]
#[command(about = "A replicated log server built on Raft consensus")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a replog server node
    Server(ServerArgs),

    /// Submit a command to the replicated log
    Send {
        #[command(flatten)]
        client: ClientArgs,

        /// The command to append (e.g. "x=1")
        command: String,
    },

    /// Ask a node which peer it believes is the leader
    Leader {
        #[command(flatten)]
        client: ClientArgs,
    },
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Node ID (unique identifier for this node)
    #[arg(long, default_value = "node1")]
    node_id: String,

    /// Port to listen on for gRPC
    #[arg(long, default_value = "7201")]
    port: u16,

    /// Peer addresses (comma-separated, format: "id:host:port")
    /// Example: "node2:127.0.0.1:7202,node3:127.0.0.1:7203"
    #[arg(long, default_value = "")]
    peers: String,

    /// Directory for the durable state file
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
}

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Address of any cluster node
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:7201")]
    addr: String,

    /// Known cluster members (comma-separated, format: "id:host:port"),
    /// used to follow leader redirects
    #[arg(long, default_value = "")]
    cluster: String,
}

const MAX_REDIRECTS: usize = 3;

fn parse_peers(peers_str: &str) -> Vec<PeerConfig> {
    if peers_str.is_empty() {
        return Vec::new();
    }

    peers_str
        .split(',')
        .filter_map(|peer| {
            let mut parts = peer.trim().splitn(2, ':');
            let node_id = parts.next()?.to_string();
            let addr = parts.next()?.to_string();
            if node_id.is_empty() || !addr.contains(':') {
                tracing::warn!(peer, "Invalid peer format, expected id:host:port");
                return None;
            }
            Some(PeerConfig { node_id, addr })
        })
        .collect()
}

// =============================================================================
// Server
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let peers = parse_peers(&args.peers);

    let config = NodeConfig {
        node_id: args.node_id,
        listen_addr,
        peers,
        data_dir: Some(args.data_dir),
        ..NodeConfig::default()
    };

    tracing::info!(
        node_id = %config.node_id,
        listen_addr = %config.listen_addr,
        peers = ?config.peers.iter().map(|p| format!("{}:{}", p.node_id, p.addr)).collect::<Vec<_>>(),
        "Starting replog node"
    );

    let shutdown = install_shutdown_handler();
    let (node, raft_rx) = Node::new(config)?;
    node.run(raft_rx, shutdown).await?;

    Ok(())
}

// =============================================================================
// Client commands
// =============================================================================

async fn handle_send(
    client_args: ClientArgs,
    command: String,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cluster = parse_peers(&client_args.cluster);
    let mut target = client_args.addr.clone();

    for _ in 0..=MAX_REDIRECTS {
        let mut client = LogServiceClient::connect(target.clone()).await?;
        let response = client
            .submit_command(SubmitCommandRequest {
                command: command.clone(),
            })
            .await?
            .into_inner();

        match SubmitStatus::try_from(response.status) {
            Ok(SubmitStatus::Ok) => {
                println!("{}", response.message);
                return Ok(ExitCode::SUCCESS);
            }
            Ok(SubmitStatus::Redirect) => {
                if response.leader.is_empty() || response.leader == "unknown" {
                    eprintln!("Error: no leader known yet, retry shortly");
                    return Ok(ExitCode::FAILURE);
                }
                match cluster.iter().find(|p| p.node_id == response.leader) {
                    Some(peer) => {
                        eprintln!("Redirecting to leader {} at {}...", peer.node_id, peer.addr);
                        target = format!("http://{}", peer.addr);
                    }
                    None => {
                        eprintln!("Error: leader is {}", response.leader);
                        eprintln!(
                            "Hint: pass --cluster \"id:host:port,...\" to follow redirects, \
                             or -a with the leader's address"
                        );
                        return Ok(ExitCode::FAILURE);
                    }
                }
            }
            _ => {
                eprintln!("Error: {}", response.message);
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    eprintln!("Error: too many redirects");
    Ok(ExitCode::FAILURE)
}

async fn handle_leader(client_args: ClientArgs) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut client = LogServiceClient::connect(client_args.addr).await?;
    let response = client.get_leader(GetLeaderRequest {}).await?.into_inner();
    println!("{}", response.leader_id);
    Ok(ExitCode::SUCCESS)
}

// =============================================================================
// Main entry point
// =============================================================================

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Send { client, command } => handle_send(client, command).await,
        Commands::Leader { client } => handle_leader(client).await,
    }
}
