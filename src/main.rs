use anyhow::{Context, Result};
use parley::audio::{CpalCapture, RodioOutput};
use parley::dialogue::HttpDialogueClient;
use parley::orchestrator::Backends;
use parley::{ParleyConfig, TurnEvent, TurnStateMachine};
use std::io::BufRead;
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CONTROLS: &str = "[Enter] toggle  [i] interrupt  [e] end  [q] quit";

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ParleyConfig::load(&path).with_context(|| format!("loading {}", path))?,
        None => ParleyConfig::new(),
    };

    info!(
        "Starting Parley: session {}, agent at {}",
        config.session, config.dialogue.endpoint
    );

    let dialogue = HttpDialogueClient::new(&config.dialogue.endpoint, config.dialogue.timeout())?;
    let backends = Backends::new(
        Arc::new(CpalCapture::default()),
        Arc::new(RodioOutput::default()),
        Arc::new(dialogue),
        &config.vad,
    );

    let (machine, handle) = TurnStateMachine::new(config, backends)?;
    let events = handle.subscribe();
    let machine_thread = machine.start()?;

    let status = handle.clone();
    thread::Builder::new()
        .name("parley-status".into())
        .spawn(move || {
            for event in events.iter() {
                match event {
                    TurnEvent::StateChanged { to, .. } => {
                        println!("{} | {}", to, status.toggle_action().label());
                    }
                    TurnEvent::BusyChanged(true) => println!("waiting for the agent..."),
                    TurnEvent::Recovered(e) => println!("{} Listening again.", e.user_message()),
                    TurnEvent::Halted(e) => println!("{} Press Enter to start.", e.user_message()),
                    TurnEvent::Shutdown => break,
                    _ => {}
                }
            }
        })?;

    println!("{}", CONTROLS);
    println!("{}", handle.toggle_action().label());

    for line in std::io::stdin().lock().lines() {
        let line = line?;
        match line.trim() {
            "" => handle.toggle()?,
            "i" => handle.interrupt()?,
            "e" => handle.end()?,
            "q" => break,
            other => warn!("Unknown control {:?}; {}", other, CONTROLS),
        }
    }

    handle.shutdown()?;
    if machine_thread.join().is_err() {
        warn!("Turn state machine panicked");
    }

    info!("Parley stopped");
    Ok(())
}
