// Operator tool for the signaling relay: health, configuration, watching an
// identity and scripted relay checks.

use clap::{Parser, Subcommand};
use colored::*;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "proctor-cli")]
#[command(about = "Proctoring signaling relay tool", long_about = None)]
struct Cli {
    /// Relay address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:9000")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check relay health endpoint
    Health,

    /// Print the client configuration served by the relay
    Config,

    /// Register an identity and print every message it receives
    Watch {
        /// Participant id to register
        #[arg(short, long)]
        id: String,
    },

    /// Run relay checks (registration, duplicate ids, routing)
    Validate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Health => check_health(&cli.server).await,
        Commands::Config => check_config(&cli.server).await,
        Commands::Watch { id } => watch_identity(&cli.server, id).await,
        Commands::Validate => run_validations(&cli.server).await,
    }
}

async fn get_json(server: &str, path: &str) -> Result<Value, String> {
    let url = format!("http://{}/{}", server, path);
    let resp = reqwest::get(&url)
        .await
        .map_err(|e| format!("Cannot connect to relay: {}", e))?;
    if !resp.status().is_success() {
        return Err(format!("{} returned {}", url, resp.status()));
    }
    resp.json::<Value>()
        .await
        .map_err(|e| format!("Invalid response body: {}", e))
}

async fn check_health(server: &str) {
    println!("{}", "Checking relay health...".cyan());

    match get_json(server, "health").await {
        Ok(body) => {
            println!("{} Health check passed", "✓".green());
            println!("  Status: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("  Service: {}", body["service"].as_str().unwrap_or("unknown"));
            println!("  Version: {}", body["version"].as_str().unwrap_or("unknown"));
            println!("  Identities online: {}", body["identities"]);
        }
        Err(e) => {
            println!("{} {}", "✗".red(), e);
            println!("  Make sure the relay is running on {}", server);
        }
    }
}

async fn check_config(server: &str) {
    println!("{}", "Fetching relay configuration...".cyan());

    match get_json(server, "config").await {
        Ok(body) => {
            println!("{} Config endpoint accessible", "✓".green());
            match serde_json::to_string_pretty(&body) {
                Ok(pretty) => println!("\n{}", pretty),
                Err(_) => println!("\n{}", body),
            }
        }
        Err(e) => println!("{} {}", "✗".red(), e),
    }
}

/// Connect as `id` and wait for the relay's verdict.
async fn open_identity(server: &str, id: &str) -> Result<(WsStream, Value), String> {
    let url = format!("ws://{}/signal/{}", server, urlencoding::encode(id));
    let (mut ws, _) = connect_async(&url)
        .await
        .map_err(|e| format!("WebSocket connection failed: {}", e))?;
    let first = next_json(&mut ws).await?;
    Ok((ws, first))
}

async fn next_json(ws: &mut WsStream) -> Result<Value, String> {
    loop {
        match timeout(RESPONSE_TIMEOUT, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return serde_json::from_str(&text).map_err(|e| format!("Invalid JSON: {}", e))
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                return Err("Connection closed by relay".to_string())
            }
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => return Err(format!("Error receiving message: {}", e)),
            Err(_) => return Err("Timeout waiting for relay".to_string()),
        }
    }
}

async fn send_json(ws: &mut WsStream, message: Value) -> Result<(), String> {
    ws.send(Message::Text(message.to_string()))
        .await
        .map_err(|e| format!("Failed to send message: {}", e))
}

async fn watch_identity(server: &str, id: &str) {
    println!("{} {}", "Registering identity".cyan(), id.bold());

    let (mut ws, first) = match open_identity(server, id).await {
        Ok(opened) => opened,
        Err(e) => {
            println!("{} {}", "✗".red(), e);
            return;
        }
    };
    if first["type"] != "Open" {
        println!("{} Relay refused identity: {}", "✗".red(), first);
        return;
    }
    println!("{} Identity open, press Ctrl+C to exit", "✓".green());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                let _ = ws.close(None).await;
                println!("\n{} Identity closed", "✓".green());
                return;
            }
            message = ws.next() => match message {
                Some(Ok(Message::Text(text))) => print_message(&text),
                Some(Ok(Message::Close(_))) | None => {
                    println!("{} Connection closed by relay", "✗".yellow());
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    println!("{} {}", "✗".red(), e);
                    return;
                }
            }
        }
    }
}

fn print_message(text: &str) {
    let Ok(message) = serde_json::from_str::<Value>(text) else {
        println!("{} {}", "?".yellow(), text);
        return;
    };
    let kind = message["type"].as_str().unwrap_or("unknown");
    let from = message["from"].as_str().unwrap_or("-");
    let call_id = message["call_id"].as_str().unwrap_or("-");
    println!(
        "{} {} from={} call_id={}",
        "←".blue(),
        kind.bold(),
        from,
        call_id
    );
}

async fn run_validations(server: &str) {
    println!("{}", "Running relay validations".cyan().bold());
    let checks: [(&str, Result<(), String>); 3] = [
        ("duplicate identity rejected", validate_duplicate_identity(server).await),
        ("offline peer reported", validate_peer_unavailable(server).await),
        ("messages routed by id", validate_routing(server).await),
    ];

    let mut failed = 0;
    for (name, result) in checks {
        match result {
            Ok(()) => println!("{} {}", "✓".green(), name),
            Err(e) => {
                failed += 1;
                println!("{} {}: {}", "✗".red(), name, e);
            }
        }
    }

    if failed == 0 {
        println!("\n{}", "All validations passed".green().bold());
    } else {
        println!("\n{} {}", failed.to_string().red().bold(), "validation(s) failed".red());
        std::process::exit(1);
    }
}

fn unique_id(prefix: &str) -> String {
    format!("{}-{}", prefix, rand::random::<u32>())
}

async fn validate_duplicate_identity(server: &str) -> Result<(), String> {
    let id = unique_id("cli-dup");
    let (_first, opened) = open_identity(server, &id).await?;
    if opened["type"] != "Open" {
        return Err(format!("expected Open, got {}", opened));
    }
    let (_second, refused) = open_identity(server, &id).await?;
    if refused["type"] != "IdTaken" {
        return Err(format!("expected IdTaken, got {}", refused));
    }
    Ok(())
}

async fn validate_peer_unavailable(server: &str) -> Result<(), String> {
    let (mut ws, _) = open_identity(server, &unique_id("cli-lonely")).await?;
    send_json(
        &mut ws,
        json!({ "type": "Hangup", "to": unique_id("cli-nobody"), "call_id": "mc_cli" }),
    )
    .await?;
    let reply = next_json(&mut ws).await?;
    if reply["type"] != "PeerUnavailable" {
        return Err(format!("expected PeerUnavailable, got {}", reply));
    }
    Ok(())
}

async fn validate_routing(server: &str) -> Result<(), String> {
    let caller = unique_id("cli-caller");
    let callee = unique_id("cli-callee");
    let (mut caller_ws, _) = open_identity(server, &caller).await?;
    let (mut callee_ws, _) = open_identity(server, &callee).await?;

    send_json(
        &mut caller_ws,
        json!({ "type": "Hangup", "to": callee, "call_id": "mc_cli" }),
    )
    .await?;
    let routed = next_json(&mut callee_ws).await?;
    if routed["type"] != "Hangup" || routed["from"] != caller.as_str() {
        return Err(format!("unexpected routed message {}", routed));
    }
    Ok(())
}
