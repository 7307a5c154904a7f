//! Terminal chat against a running crawl-crew server.
//!
//! Usage: `crawl-chat [agent] [--url URL]`. The server URL defaults to
//! `CRAWL_CREW_URL` or `http://127.0.0.1:8000`.
//!
//! Commands: `/new` starts a new thread, `/agent NAME` switches agent,
//! `/quit` exits.

use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use crawl_crew::agents::AgentRole;
use crawl_crew::client::{Activity, AgentClient, Segment, StreamAggregator};

const DEFAULT_URL: &str = "http://127.0.0.1:8000";

struct Args {
    agent: AgentRole,
    url: String,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut agent = AgentRole::Supervisor;
    let mut url = std::env::var("CRAWL_CREW_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--url" => {
                url = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--url needs a value"))?;
            }
            "-h" | "--help" => {
                println!("Usage: crawl-chat [supervisor|navigator|coder|analyst] [--url URL]");
                std::process::exit(0);
            }
            name => {
                agent = AgentRole::parse(name)
                    .ok_or_else(|| anyhow::anyhow!("Unknown agent '{}'", name))?;
            }
        }
    }
    Ok(Args { agent, url })
}

fn new_thread() -> String {
    Uuid::new_v4().to_string()
}

fn print_activity(activity: &Activity) {
    match activity {
        Activity::ToolStarted { name, input } => eprintln!("\n  [{}] {}", name, input),
        Activity::ToolFinished { name, output } => {
            let first = output.lines().next().unwrap_or_default();
            eprintln!("  [{} done] {}", name, first.chars().take(120).collect::<String>());
        }
        Activity::Error(message) => eprintln!("  [error] {}", message),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    let client = AgentClient::new(args.url);
    let mut agent = args.agent;
    let mut thread_id = new_thread();

    match client.health().await {
        Ok(health) => println!(
            "Connected to {} (v{}, {} pipeline). Talking to {}.",
            client.base_url(),
            health.version,
            health.stages,
            agent
        ),
        Err(e) => anyhow::bail!("Server at {} is not reachable: {}", client.base_url(), e),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{}> ", agent);
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();

        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/new" => {
                if let Err(e) = client.reset(agent.as_str(), &thread_id).await {
                    eprintln!("  [warning] reset failed: {}", e);
                }
                thread_id = new_thread();
                println!("New thread {}", thread_id);
                continue;
            }
            _ => {}
        }
        if let Some(name) = line.strip_prefix("/agent ") {
            match AgentRole::parse(name) {
                Some(role) => {
                    agent = role;
                    thread_id = new_thread();
                    println!("Talking to {} on thread {}", agent, thread_id);
                }
                None => eprintln!("  [warning] unknown agent '{}'", name.trim()),
            }
            continue;
        }

        let mut aggregator = StreamAggregator::new();
        let mut printed = 0;
        let mut seen_activity = 0;
        let result = client
            .stream(agent.as_str(), line, Some(&thread_id), &mut aggregator, |agg| {
                for activity in &agg.activity()[seen_activity..] {
                    print_activity(activity);
                }
                seen_activity = agg.activity().len();
                let text = agg.text();
                if text.len() > printed {
                    print!("{}", &text[printed..]);
                    let _ = std::io::stdout().flush();
                    printed = text.len();
                }
            })
            .await;
        println!();

        if let Err(e) = result {
            eprintln!("  [error] {}", e);
            continue;
        }

        let rendered = aggregator.finish();
        for segment in &rendered.segments {
            if let Segment::Artifact(path) = segment {
                println!("  [image] {}", path.display());
            }
        }
        for warning in &rendered.warnings {
            eprintln!("  [warning] {}", warning);
        }
    }

    Ok(())
}
