use cudagent::constants::ERROR_TAG;
use cudagent::health;
use cudagent::logging::{init_tracing, setup_panic_hook};
use cudagent::main_helper::build_http_client;
use cudagent::*;

use clap::Parser;
use colored::*;
use std::io::Write;
use std::future::Future;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::broadcast;

type CoachSession = Session<HttpTransport>;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let _guard = match init_tracing(&args.log_dir) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialise logging in {}: {}", args.log_dir.display(), e);
            std::process::exit(1);
        }
    };
    setup_panic_hook();

    let config = CoachConfig::from(&args);
    let client = match build_http_client(&config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            eprintln!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    match health::probe(&client, &config.base_url).await {
        Ok(liveness) if liveness.is_ok() => {
            tracing::info!("Coach service at {} is up", config.base_url);
        }
        Ok(liveness) => {
            tracing::warn!("Coach service reports status {:?}", liveness.status);
        }
        Err(e) => {
            tracing::warn!("Health probe failed: {}", e);
            eprintln!(
                "{}",
                format!("warning: coach service at {} unreachable: {}", config.base_url, e).yellow()
            );
        }
    }

    let transport = HttpTransport::new(client, &config);
    tracing::info!("Streaming turns from {}", transport.endpoint());
    let session = Session::new(transport, config.generation());

    if let Some(prompt) = args.prompt.as_deref() {
        run_turn(&session, prompt).await;
        return;
    }

    repl(&session).await;
}

async fn repl(session: &CoachSession) {
    let params = session.params();
    println!(
        "{}",
        format!(
            "model {} | temperature {}",
            params.model.as_deref().unwrap_or("service default"),
            params.temperature
        )
        .dimmed()
    );
    println!(
        "{}",
        "cudagent: type a message, /history to show the transcript, /quit to exit. Ctrl-C cancels a running turn."
            .dimmed()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{} ", ">".bold().green());
        let _ = std::io::stdout().flush();

        // Once a turn has listened for Ctrl-C the default SIGINT handler is
        // gone, so the idle prompt has to listen for it as well.
        let interrupt = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        let Some(line) = next_command(&mut lines, interrupt).await else {
            break;
        };

        match line.trim() {
            "/quit" | "/exit" => break,
            "/history" => print_history(session),
            _ => run_turn(session, &line).await,
        }
    }
}

/// Next input line, or `None` on end of input, a read error or `interrupt`.
async fn next_command<R>(lines: &mut Lines<R>, interrupt: impl Future<Output = ()>) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    tokio::select! {
        line = lines.next_line() => match line {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Failed to read stdin: {}", e);
                None
            }
        },
        _ = interrupt => {
            println!();
            None
        }
    }
}

async fn run_turn(session: &CoachSession, text: &str) {
    let mut updates = session.subscribe();
    let dispatch = session.dispatch(text);
    tokio::pin!(dispatch);

    let result = loop {
        tokio::select! {
            result = &mut dispatch => break result,
            event = updates.recv() => render_event(event),
            _ = tokio::signal::ctrl_c() => {
                if session.cancel() {
                    eprintln!("{}", "\n[cancelled]".yellow());
                }
            }
        }
    };

    // Deltas applied in the final poll of the turn are still queued.
    while let Ok(event) = updates.try_recv() {
        render_event(Ok(event));
    }

    match result {
        Ok(Some(report)) => {
            println!();
            tracing::debug!(
                "Turn {} ended {} ({} deltas)",
                report.turn_id.short(),
                report.state,
                report.metrics.deltas
            );
            if report.state != TurnState::Completed {
                println!("{}", format!("[turn {}]", report.state).dimmed());
            }
        }
        Ok(None) => {}
        // The terminal surface drops rejected dispatches.
        Err(e) => tracing::warn!("Dispatch rejected: {}", e),
    }
}

fn render_event(event: std::result::Result<SessionEvent, broadcast::error::RecvError>) {
    match event {
        Ok(SessionEvent::ContentAppended { delta, .. }) => {
            if delta.trim_start_matches('\n').starts_with(ERROR_TAG) {
                print!("{}", delta.red());
            } else {
                print!("{}", delta);
            }
            let _ = std::io::stdout().flush();
        }
        Ok(_) => {}
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            tracing::warn!("Renderer lagged, {} updates skipped", skipped);
        }
        Err(broadcast::error::RecvError::Closed) => {}
    }
}

fn print_history(session: &CoachSession) {
    for message in session.transcript() {
        let label = match message.role {
            Role::System => "system".dimmed(),
            Role::User => "user".bold().green(),
            Role::Assistant => "assistant".bold().cyan(),
        };
        println!("{} {}", label, message.created_at.format("%H:%M:%S").to_string().dimmed());
        println!("{}\n", message.content);
    }
}
