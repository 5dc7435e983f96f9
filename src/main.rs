use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use madski::channel::{
    ChannelState, FrameBatcher, ListenerEvent, PushChannelListener, ResultSet, Subscription,
    MIN_FRAME_SAMPLES,
};
use madski::classify::ClassifierClient;
use madski::config::{AppConfig, ENV_CHATBOT_URL, ENV_CLASSIFIER_URL, ENV_CONFIG_PATH};
use madski::session::ConversationSession;
use madski::transport::ChatClient;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const CONNECT_WAIT: Duration = Duration::from_secs(30);
const RESULT_WAIT: Duration = Duration::from_secs(3);

#[derive(Parser, Debug)]
#[command(name = "madski", version, about = "MADSKI assistant and genre classifier client")]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = ENV_CONFIG_PATH)]
    config: Option<PathBuf>,

    /// Base URL of the chat service
    #[arg(long, env = ENV_CHATBOT_URL)]
    chatbot_url: Option<String>,

    /// Base URL of the classification service
    #[arg(long, env = ENV_CLASSIFIER_URL)]
    classifier_url: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive chat with the assistant (default)
    Chat,
    /// Upload an audio file and print its genre predictions
    Classify { file: PathBuf },
    /// Stream a WAV file over the live channel and print predictions as they arrive
    Listen {
        wav: PathBuf,
        /// Pace frames at playback speed
        #[arg(long)]
        realtime: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "madski=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => run_chat(config),
        Command::Classify { file } => run_classify(config, file),
        Command::Listen { wav, realtime } => run_listen(config, wav, realtime),
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(url) = &cli.chatbot_url {
        config = config.with_chatbot_url(url.clone());
    }
    if let Some(url) = &cli.classifier_url {
        config = config.with_classifier_url(url.clone());
    }
    config.validate()?;
    Ok(config)
}

fn run_chat(config: AppConfig) -> Result<()> {
    info!("Starting chat against {}", config.chat.endpoint());

    let client = ChatClient::new(config.chat.clone());
    let handle = client.handle();
    let events = client.event_receiver();
    let worker = client.start_worker()?;

    let mut session = ConversationSession::new().with_greeting(config.greeting.clone());
    session.attach(Box::new(handle.clone()), events);

    for entry in session.entries() {
        println!("assistant> {}", entry.content);
    }
    println!("Type a message, /reset to start over or /quit to exit.");

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("you> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next() else {
            break;
        };
        let line = line.context("Failed to read input")?;
        match line.trim() {
            "/quit" => break,
            "/reset" => {
                session.reset();
                for entry in session.entries() {
                    println!("assistant> {}", entry.content);
                }
                continue;
            }
            _ => {}
        }

        let placeholder = match session.send(&line) {
            Ok(id) => id,
            Err(e) => {
                println!("{}", e.user_message());
                continue;
            }
        };

        print!("assistant> ");
        let mut printed = 0;
        loop {
            session.poll_events();
            if let Some(entry) = session.entry(placeholder) {
                if let Some(fresh) = entry.content.get(printed..) {
                    if !fresh.is_empty() {
                        print!("{}", fresh);
                        std::io::stdout().flush()?;
                        printed = entry.content.len();
                    }
                }
            }
            if !session.is_busy() {
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        println!();
    }

    session.cancel();
    handle.shutdown();
    if worker.join().is_err() {
        warn!("Chat worker panicked");
    }
    Ok(())
}

fn run_classify(config: AppConfig, file: PathBuf) -> Result<()> {
    let client = ClassifierClient::new(&config.channel);
    info!("Classifying {} via {}", file.display(), client.endpoint());

    let runtime = tokio::runtime::Runtime::new()?;
    let results = runtime
        .block_on(client.classify_file(&file))
        .with_context(|| format!("Classification of {} failed", file.display()))?;

    print_results(&results);
    Ok(())
}

fn run_listen(config: AppConfig, wav: PathBuf, realtime: bool) -> Result<()> {
    let clip = madski::audio::read_wav(&wav)?;
    info!(
        "Streaming {} ({:.1}s at {} Hz)",
        wav.display(),
        clip.duration_seconds(),
        clip.sample_rate
    );

    let frame_len = config.channel.frame_samples;
    let mut listener = PushChannelListener::from_config(config.channel.clone());
    let subscription = listener.subscribe();
    listener.connect()?;

    wait_for_connection(&subscription)?;

    let mut batcher = FrameBatcher::new(frame_len, clip.sample_rate, 4);

    for block in clip.samples.chunks(frame_len) {
        batcher.push(block);
        while let Some(frame) = batcher.next_frame() {
            let pace = Duration::from_secs_f32(frame.duration_seconds());
            listener.send_frame(frame)?;
            drain_results(&subscription);
            if realtime {
                std::thread::sleep(pace);
            }
        }
    }
    if let Some(frame) = batcher.flush() {
        if frame.chunk.len() >= MIN_FRAME_SAMPLES {
            listener.send_frame(frame)?;
        }
    }

    let deadline = Instant::now() + RESULT_WAIT;
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match subscription.recv_timeout(remaining) {
            Some(event) => handle_listener_event(event),
            None => break,
        }
    }

    listener.disconnect();
    let results = listener.results();
    if results.is_empty() {
        println!("No predictions received");
    } else {
        println!("Final predictions:");
        print_results(&results);
    }
    Ok(())
}

fn wait_for_connection(subscription: &Subscription) -> Result<()> {
    let deadline = Instant::now() + CONNECT_WAIT;
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match subscription.recv_timeout(remaining) {
            Some(ListenerEvent::StateChanged(ChannelState::Connected)) => return Ok(()),
            Some(ListenerEvent::StateChanged(ChannelState::Failed(reason))) => {
                bail!("Live channel failed: {}", reason)
            }
            Some(ListenerEvent::StateChanged(state)) => info!("Channel {:?}", state),
            Some(ListenerEvent::Results(_)) => {}
            None => break,
        }
    }
    bail!("Timed out waiting for the live channel")
}

fn drain_results(subscription: &Subscription) {
    while let Some(event) = subscription.try_next() {
        handle_listener_event(event);
    }
}

fn handle_listener_event(event: ListenerEvent) {
    match event {
        ListenerEvent::Results(results) => {
            if let Some(top) = results.top() {
                println!("now: {} ({}%)", top.label, top.percent());
            }
        }
        ListenerEvent::StateChanged(state) => info!("Channel {:?}", state),
    }
}

fn print_results(results: &ResultSet) {
    for prediction in results.iter() {
        println!("{:>16}  {:>3}%", prediction.label, prediction.percent());
    }
}
