use anyhow::{Context, bail};
use chrono::Local;
use clap::{Parser, Subcommand};
use log::{info, warn};
use meshcall::calls::{
    CallConfig, CallCoordinator, DEFAULT_MAX_PARTICIPANTS, LocalRelay, LoopbackDevices,
    LoopbackNetwork,
};
use meshcall::types::{CallStatus, ChatId, Participant, UserId};
use std::sync::Arc;
use std::time::Duration;

// Runs group calls between in-process users over the loopback relay and media
// layer, logging every step.
//
// Usage:
//   cargo run                                    # 3-way call
//   cargo run -- call --participants 4 --talk 2  # 4-way call, 2s of talking
//   cargo run -- unanswered --ring-timeout 3     # nobody picks up

#[derive(Parser)]
#[command(name = "meshcall")]
#[command(about = "Simulated full-mesh group calls")]
struct Cli {
    /// Seconds an outgoing call rings before it is hung up
    #[arg(short, long, default_value_t = 30, global = true)]
    ring_timeout: u64,

    /// Print the final session state of each user as JSON
    #[arg(short, long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Everyone in the chat answers, talks, then hangs up in turn
    Call {
        #[arg(short, long, default_value_t = 3)]
        participants: usize,

        /// Seconds to stay connected
        #[arg(short, long, default_value_t = 1)]
        talk: u64,
    },
    /// The callee never answers
    Unanswered,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let cli = Cli::parse();
    let ring_timeout = Duration::from_secs(cli.ring_timeout);
    let command = cli.command.unwrap_or(Commands::Call {
        participants: 3,
        talk: 1,
    });

    let users = match command {
        Commands::Call { participants, talk } => {
            if !(2..=DEFAULT_MAX_PARTICIPANTS).contains(&participants) {
                bail!("participants must be between 2 and {DEFAULT_MAX_PARTICIPANTS}");
            }
            let users = spawn_users(participants, ring_timeout);
            run_call(&users, Duration::from_secs(talk)).await?;
            users
        }
        Commands::Unanswered => {
            let users = spawn_users(2, ring_timeout);
            run_unanswered(&users, ring_timeout).await?;
            users
        }
    };

    if cli.json {
        for user in &users {
            let state = user.store().snapshot();
            println!(
                "{}: {}",
                user.local_user().id,
                serde_json::to_string(&state).context("serializing session state")?
            );
        }
    }
    for user in &users {
        user.shutdown().await;
    }
    Ok(())
}

fn chat_id() -> ChatId {
    ChatId::new("demo-chat")
}

fn spawn_users(count: usize, ring_timeout: Duration) -> Vec<Arc<CallCoordinator>> {
    let relay = LocalRelay::new(DEFAULT_MAX_PARTICIPANTS);
    let network = LoopbackNetwork::new();
    let people: Vec<Participant> = (1..=count)
        .map(|n| Participant::new(format!("user-{n}"), format!("User {n}")))
        .collect();
    let members: Vec<UserId> = people.iter().map(|p| p.id.clone()).collect();
    relay.add_chat(chat_id(), &members);

    people
        .into_iter()
        .map(|person| {
            let channel = relay.connect(person.id.clone());
            let devices =
                LoopbackDevices::with_delay(person.id.as_str(), Duration::from_millis(50));
            CallCoordinator::new(
                CallConfig::new(person).with_ring_timeout(ring_timeout),
                channel,
                devices,
                Arc::new(network.clone()),
            )
        })
        .collect()
}

async fn run_call(users: &[Arc<CallCoordinator>], talk: Duration) -> anyhow::Result<()> {
    let (caller, callees) = users.split_first().context("no users")?;
    let call_id = caller.start_call(chat_id())?;
    info!("{} is calling ({})", caller.local_user().name, call_id);

    for callee in callees {
        tokio::time::sleep(Duration::from_millis(200)).await;
        callee.accept_call()?;
    }

    let everyone = users.len();
    let connected = wait_for(Duration::from_secs(5), || {
        users.iter().all(|u| {
            u.session().is_some_and(|c| {
                c.call_status == CallStatus::Connected && c.participants.len() == everyone
            }) && u.streams().get_streams().len() == everyone
        })
    })
    .await;
    if !connected {
        bail!("mesh did not converge");
    }
    for user in users {
        let mesh = user.manager().inspect().await?;
        info!(
            "{} connected to {:?} after {} dials",
            user.local_user().id,
            mesh.connections,
            mesh.dials
        );
    }

    tokio::time::sleep(talk).await;

    for user in users {
        if user.session().is_none() {
            continue;
        }
        user.hang_up()?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let remaining = users.iter().filter(|u| u.session().is_some()).count();
        info!("{} hung up, {} still in a call", user.local_user().id, remaining);
    }

    let cleared = wait_for(Duration::from_secs(2), || {
        users
            .iter()
            .all(|u| u.session().is_none() && u.streams().get_streams().is_empty())
    })
    .await;
    if !cleared {
        warn!("Some sessions were not cleared");
    }
    Ok(())
}

async fn run_unanswered(
    users: &[Arc<CallCoordinator>],
    ring_timeout: Duration,
) -> anyhow::Result<()> {
    let (caller, _) = users.split_first().context("no users")?;
    let call_id = caller.start_call(chat_id())?;
    info!("{} is calling ({}), nobody will answer", caller.local_user().name, call_id);

    let cleared = wait_for(ring_timeout + Duration::from_secs(2), || {
        users.iter().all(|u| u.session().is_none())
    })
    .await;
    if !cleared {
        bail!("ringing call was not cleared");
    }
    info!("Call {} timed out after {:?}", call_id, ring_timeout);
    Ok(())
}

async fn wait_for(limit: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while !done() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    true
}
