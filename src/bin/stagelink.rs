use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use stagelink::clock::TransportState;
use stagelink::coordinator::TransportCoordinator;
use std::time::Duration;

const DEFAULT_PRE_ROLL: &str = "0.5";
const QUERY_REPLY_WINDOW_MS: u64 = 750;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("stagelink")
        .version("0.1.0")
        .about("🎛  StageLink transport control - synchronized start/stop across the mesh")
        .arg(
            Arg::with_name("agents")
                .short("a")
                .long("agents")
                .value_name("HOST[:PORT],...")
                .help("Comma-separated agent endpoints")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("pre-roll")
                .long("pre-roll")
                .value_name("SECONDS")
                .help("Delay before the scheduled instant, shared by every agent")
                .takes_value(true)
                .default_value(DEFAULT_PRE_ROLL)
                .global(true)
                .validator(|v| {
                    v.parse::<f64>()
                        .map(|_| ())
                        .map_err(|_| "pre-roll must be a number of seconds".to_string())
                }),
        )
        .subcommand(
            SubCommand::with_name("start")
                .about("▶  Start all agents at the same wall-clock instant"),
        )
        .subcommand(
            SubCommand::with_name("stop")
                .about("⏹  Stop all agents (pre-roll 0 stops immediately)"),
        )
        .subcommand(
            SubCommand::with_name("locate")
                .about("⏮  Relocate all agents to a frame without starting")
                .arg(frame_arg()),
        )
        .subcommand(
            SubCommand::with_name("locate-start")
                .about("⏯  Relocate, then start at the same wall-clock instant")
                .arg(frame_arg()),
        )
        .subcommand(
            SubCommand::with_name("query").about("📊 Query every agent's transport state"),
        )
        .get_matches();

    // Global flags placed after the subcommand land in the subcommand's
    // matches, so look there first.
    let (name, sub) = matches.subcommand();
    let global = |key: &str| {
        sub.and_then(|s| s.value_of(key))
            .or_else(|| matches.value_of(key))
    };

    let coordinator = TransportCoordinator::bind().await?;
    for endpoint in global("agents").unwrap_or_default().split(',') {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            continue;
        }
        match endpoint.rsplit_once(':') {
            Some((host, port)) => coordinator.add_agent(host, Some(port.parse()?), None),
            None => coordinator.add_agent(endpoint, None, None),
        }
    }
    if coordinator.agents().is_empty() {
        eprintln!("{}", "no agents given".red());
        std::process::exit(1);
    }

    let pre_roll: f64 = global("pre-roll").unwrap_or(DEFAULT_PRE_ROLL).parse()?;

    match (name, sub) {
        ("start", Some(_)) => {
            let sent = coordinator.start_all(pre_roll).await;
            report_fan_out("start", sent, &coordinator);
        }
        ("stop", Some(_)) => {
            let sent = coordinator.stop_all(pre_roll).await;
            report_fan_out("stop", sent, &coordinator);
        }
        ("locate", Some(sub)) => {
            let frame = parse_frame(sub)?;
            let sent = coordinator.locate_all(frame).await;
            report_fan_out("locate", sent, &coordinator);
        }
        ("locate-start", Some(sub)) => {
            let frame = parse_frame(sub)?;
            let sent = coordinator.locate_and_start_all(frame, pre_roll).await;
            report_fan_out("locate-start", sent, &coordinator);
        }
        ("query", Some(_)) => {
            coordinator.query_all().await;
            tokio::time::sleep(Duration::from_millis(QUERY_REPLY_WINDOW_MS)).await;
            print_roster(&coordinator);
        }
        _ => {
            eprintln!("{}", "no command given, try --help".yellow());
            std::process::exit(1);
        }
    }

    Ok(())
}

fn frame_arg() -> Arg<'static, 'static> {
    Arg::with_name("frame")
        .help("Target frame position")
        .required(true)
        .validator(|v| {
            v.parse::<u64>()
                .map(|_| ())
                .map_err(|_| "frame must be a non-negative integer".to_string())
        })
}

fn parse_frame(sub: &ArgMatches) -> Result<u64, std::num::ParseIntError> {
    sub.value_of("frame").unwrap_or("0").parse()
}

fn report_fan_out(command: &str, sent: usize, coordinator: &TransportCoordinator) {
    let total = coordinator.agents().len();
    if sent == total {
        println!("{} {} sent to {} agent(s)", "✓".green(), command, sent);
    } else {
        println!(
            "{} {} sent to {}/{} agent(s)",
            "!".yellow(),
            command,
            sent,
            total
        );
    }
}

fn print_roster(coordinator: &TransportCoordinator) {
    println!(
        "{:<24} {:<12} {:<12} {:<12}",
        "AGENT".bold(),
        "STATE".bold(),
        "FRAME".bold(),
        "NODE".bold()
    );
    for agent in coordinator.agents() {
        let endpoint = format!("{}:{}", agent.host, agent.port);
        match agent.last_state {
            Some(snapshot) => {
                let state = match snapshot.state {
                    TransportState::Rolling => snapshot.state.as_str().green(),
                    TransportState::Starting => snapshot.state.as_str().yellow(),
                    TransportState::Stopped => snapshot.state.as_str().normal(),
                };
                println!(
                    "{:<24} {:<12} {:<12} {:<12}",
                    endpoint,
                    state,
                    snapshot.frame,
                    agent.node_id.as_deref().unwrap_or("-")
                );
            }
            None => {
                println!(
                    "{:<24} {:<12} {:<12} {:<12}",
                    endpoint,
                    "no reply".red(),
                    "-",
                    "-"
                );
            }
        }
    }
}
