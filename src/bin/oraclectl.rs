//! Operator CLI for a running oracle node
//!
//! Talks to the node's status API.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::time::Duration;

const DEFAULT_API: &str = "http://127.0.0.1:7777";

#[tokio::main]
async fn main() -> Result<()> {
    let mut args: Vec<String> = std::env::args().collect();
    let program = args.remove(0);

    let mut api = std::env::var("ORACLE_API").unwrap_or_else(|_| DEFAULT_API.to_string());
    if args.first().map(String::as_str) == Some("--api") {
        if args.len() < 2 {
            print_usage(&program);
            return Ok(());
        }
        api = args.remove(1);
        args.remove(0);
    }

    let Some(command) = args.first() else {
        print_usage(&program);
        return Ok(());
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create HTTP client")?;
    let api = api.trim_end_matches('/');

    match command.as_str() {
        "status" => {
            let data = call(&client, reqwest::Method::GET, &format!("{}/api/status", api)).await?;
            print_status(&data);
        }
        "leader" => {
            let data = call(&client, reqwest::Method::GET, &format!("{}/api/leader", api)).await?;
            println!("Round:    {}", data["round_id"]);
            println!("Attempt:  {}", data["attempt"]);
            println!("Leader:   {}", display(&data["leader"]));
            if data["is_self"].as_bool() == Some(true) {
                println!("          (this node)");
            }
        }
        "last-commit" => {
            let data =
                call(&client, reqwest::Method::GET, &format!("{}/api/last-commit", api)).await?;
            println!("Round:       {}", data["round_id"]);
            println!("Leader:      {}", display(&data["leader"]));
            println!("Merkle root: {}", display(&data["merkle_root"]));
            println!("Feeds:       {}", data["feed_count"]);
            println!("Ledger tx:   {}", display(&data["ledger_tx_id"]));
            println!("Finalized:   {}", display(&data["finalized_at"]));
        }
        "health" => {
            let data = call(&client, reqwest::Method::GET, &format!("{}/api/health", api)).await?;
            println!(
                "Exchanges: {} healthy, {} unhealthy",
                data["healthy_exchanges"], data["unhealthy_exchanges"]
            );
        }
        "metrics" => {
            let data = call(&client, reqwest::Method::GET, &format!("{}/api/metrics", api)).await?;
            println!("Rounds:       {} started, {} committed, {} failed",
                data["rounds_started"], data["rounds_committed"], data["rounds_failed"]);
            println!("Batches:      {} built, {} submitted", data["batches_built"], data["submissions"]);
            println!("Observations: {}", data["price_observations"]);
            println!("Faults:       {}", data["consensus_faults"]);
            println!("Uptime:       {}s", data["uptime_secs"]);
        }
        "restart" => {
            let data = call(
                &client,
                reqwest::Method::POST,
                &format!("{}/api/round/restart", api),
            )
            .await?;
            println!("🔄 Round {} abandoned; a new round starts now", data["restarted_round"]);
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage(&program);
            std::process::exit(2);
        }
    }

    Ok(())
}

/// Send one request and unwrap the `{success, data, error}` envelope
async fn call(client: &reqwest::Client, method: reqwest::Method, url: &str) -> Result<Value> {
    let body: Value = client
        .request(method, url)
        .send()
        .await
        .with_context(|| format!("Node API unreachable at {}", url))?
        .json()
        .await
        .context("Malformed API response")?;

    if body["success"].as_bool() != Some(true) {
        bail!("{}", body["error"].as_str().unwrap_or("request failed"));
    }
    Ok(body["data"].clone())
}

fn print_status(data: &Value) {
    println!("Node: {}", display(&data["node_id"]));
    let round = &data["round"];
    if round.is_object() {
        println!(
            "Round {} {} (attempt {}/{})",
            round["round_id"],
            display(&round["status"]),
            round["attempt"],
            round["max_attempts"]
        );
        println!("  Leader:     {}", display(&round["leader"]));
        println!("  Local root: {}", display(&round["local_root"]));
        println!(
            "  Agreement:  {}/{} stake from {} announcements",
            round["agreement"]["matching_stake"],
            round["agreement"]["total_stake"],
            round["agreement"]["announcements"]
        );
    } else {
        println!("No round started yet");
    }
    let last = &data["last_commit"];
    if last.is_object() {
        println!(
            "Last commit: round {} by {}",
            last["round_id"],
            display(&last["leader"])
        );
    } else {
        println!("Last commit: none");
    }
    println!("Faults: {}", data["faults"]["total"]);
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn print_usage(program: &str) {
    eprintln!("Usage: {} [--api URL] <command>", program);
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  status        Live round, last commit and fault counts");
    eprintln!("  leader        Acting leader of the live round");
    eprintln!("  last-commit   Most recently committed round");
    eprintln!("  health        Exchange health summary");
    eprintln!("  metrics       Round, batch and fault counters");
    eprintln!("  restart       Abandon the live round and start a new one");
    eprintln!();
    eprintln!("The API address defaults to $ORACLE_API or {}", DEFAULT_API);
}
