use brokerlink::mqtt::broker::BrokerDescriptor;
use brokerlink::mqtt::message_manager::MessageRecord;
use brokerlink::mqtt::mqtt_handler::{ConnectionSnapshot, ConnectionState, MqttHandle};
use brokerlink::mqtt::rumqtt_transport::RumqttConnector;
use brokerlink::persistence::preference_store::PreferenceStore;
use brokerlink::persistence::{restore_session, Preferences};
use clap::{Args, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "brokerlink")]
#[command(about = "Keep a single MQTT broker connection and watch its traffic")]
#[command(version)]
struct Cli {
    /// Directory holding preferences.toml and settings.toml
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Without a command the preferred broker is restored and monitored
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and print every message until Ctrl+C
    Monitor {
        #[command(flatten)]
        broker: BrokerArgs,
    },
    /// Connect, publish one message and disconnect
    Publish {
        topic: String,
        payload: String,
        #[command(flatten)]
        broker: BrokerArgs,
    },
    /// Check whether a broker echoes a test message
    Test {
        #[command(flatten)]
        broker: BrokerArgs,
    },
    /// Remember a broker as the preferred one
    Prefer {
        #[command(flatten)]
        broker: BrokerArgs,

        /// Store the broker without testing it first
        #[arg(long)]
        no_test: bool,

        /// Do not connect to it automatically on startup
        #[arg(long)]
        no_auto_connect: bool,
    },
    /// Drop the preferred broker
    Forget,
    /// Print stored preferences and settings
    Show,
}

#[derive(Args, Debug, Clone)]
struct BrokerArgs {
    /// Broker hostname or address; the preferred broker is used when omitted
    #[arg(short = 'H', long)]
    host: Option<String>,

    #[arg(short = 'p', long, default_value = "1883")]
    port: u16,

    /// DNS-SD service type, selects the transport (e.g. _mqtts._tcp., _mqtt-ws._tcp.)
    #[arg(short = 's', long, default_value = "_mqtt._tcp.")]
    service_type: String,

    /// Display name, defaults to the host
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// WebSocket path
    #[arg(long)]
    path: Option<String>,

    #[arg(short = 'u', long)]
    username: Option<String>,

    #[arg(short = 'P', long)]
    password: Option<String>,

    /// Accept any TLS certificate
    #[arg(long)]
    insecure: bool,
}

impl BrokerArgs {
    fn resolve(&self, prefs: &Preferences) -> Result<BrokerDescriptor> {
        let Some(host) = &self.host else {
            return prefs
                .preferred_broker
                .clone()
                .ok_or_else(|| eyre!("No --host given and no preferred broker stored"));
        };

        let name = self.name.clone().unwrap_or_else(|| host.clone());
        let mut broker = BrokerDescriptor::new(name, self.service_type.clone(), host.clone(), self.port)
            .with_tls_verify(!self.insecure);
        if let Some(path) = &self.path {
            broker = broker.with_path(path.clone());
        }
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                broker = broker.with_credentials(username.clone(), password.clone());
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(eyre!("--username and --password must be given together"));
            }
            (None, None) => {}
        }
        Ok(broker)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup(cli.verbose)?;

    let store = PreferenceStore::new(cli.config_dir.unwrap_or_else(PreferenceStore::default_dir));
    let settings = store.load_settings().await;
    let mut prefs = store.load_preferences().await;

    let (handle, worker) = MqttHandle::spawn(Arc::new(RumqttConnector::new()), settings.clone());

    match cli.command {
        None => {
            if restore_session(&handle, &prefs).await? {
                monitor(&handle).await?;
            } else {
                info!("Nothing to restore, run `brokerlink monitor --host <broker>` or `brokerlink prefer`");
            }
        }
        Some(Command::Monitor { broker }) => {
            handle.connect(broker.resolve(&prefs)?).await?;
            monitor(&handle).await?;
        }
        Some(Command::Publish {
            topic,
            payload,
            broker,
        }) => {
            handle.connect(broker.resolve(&prefs)?).await?;
            let snapshot = handle.wait_until_settled().await?;
            if !snapshot.is_connected() {
                return Err(eyre!(
                    "{}",
                    snapshot.error.unwrap_or_else(|| "Connection closed".to_string())
                ));
            }
            handle.publish(topic, payload).await?;
            if let Some(record) = handle.snapshot().messages.first() {
                println!("{}", record.payload);
            }
            handle.disconnect().await?;
        }
        Some(Command::Test { broker }) => {
            let candidate = broker.resolve(&prefs)?;
            if handle.test_connect(&candidate).await {
                println!("{} is reachable", candidate);
            } else {
                return Err(eyre!("{} did not echo the test message", candidate));
            }
        }
        Some(Command::Prefer {
            broker,
            no_test,
            no_auto_connect,
        }) => {
            let candidate = broker.resolve(&prefs)?;
            if !no_test && !handle.test_connect(&candidate).await {
                return Err(eyre!(
                    "{} did not echo the test message, pass --no-test to store it anyway",
                    candidate
                ));
            }
            prefs.auto_connect = !no_auto_connect;
            prefs.remember(candidate.clone());
            store.save_preferences(&prefs).await?;
            println!("Preferred broker: {}", candidate);
        }
        Some(Command::Forget) => {
            match prefs.forget() {
                Some(broker) => println!("Forgot {}", broker),
                None => println!("No preferred broker stored"),
            }
            store.save_preferences(&prefs).await?;
        }
        Some(Command::Show) => {
            println!("# {}", store.dir().display());
            println!("\n# preferences.toml");
            println!(
                "{}",
                toml::to_string_pretty(&prefs)
                    .map_err(|e| eyre!("Failed to serialize preferences: {}", e))?
            );
            println!("# settings.toml");
            println!(
                "{}",
                toml::to_string_pretty(&settings)
                    .map_err(|e| eyre!("Failed to serialize settings: {}", e))?
            );
        }
    }

    handle.shutdown().await?;
    worker.await?;
    Ok(())
}

/// Prints state changes and new messages until Ctrl+C or until the
/// connection ends.
async fn monitor(handle: &MqttHandle) -> Result<()> {
    let mut updates = handle.watch();
    let mut printer = SnapshotPrinter::default();
    let initial = updates.borrow_and_update().clone();
    printer.print(&initial);
    if initial.state == ConnectionState::Disconnected {
        return match initial.error {
            Some(error) => Err(eyre!("{}", error)),
            None => Ok(()),
        };
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                eprintln!("\nDisconnecting...");
                handle.disconnect().await?;
                return Ok(());
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    warn!("Connection manager stopped");
                    return Ok(());
                }
                let snapshot = updates.borrow_and_update().clone();
                printer.print(&snapshot);
                if snapshot.state == ConnectionState::Disconnected {
                    return match snapshot.error {
                        Some(error) => Err(eyre!("{}", error)),
                        None => Ok(()),
                    };
                }
            }
        }
    }
}

#[derive(Default)]
struct SnapshotPrinter {
    state: Option<ConnectionState>,
    error: Option<String>,
    newest_id: Option<String>,
}

impl SnapshotPrinter {
    fn print(&mut self, snapshot: &ConnectionSnapshot) {
        if self.state != Some(snapshot.state) {
            eprintln!("[{:?}] {}", snapshot.state, snapshot.broker_url());
            self.state = Some(snapshot.state);
        }
        if snapshot.error.is_some() && self.error != snapshot.error {
            eprintln!("error: {}", snapshot.error.as_deref().unwrap_or_default());
        }
        self.error = snapshot.error.clone();

        let fresh: Vec<&MessageRecord> = snapshot
            .messages
            .iter()
            .take_while(|m| Some(&m.id) != self.newest_id.as_ref())
            .collect();
        for record in fresh.iter().rev() {
            println!("{}\n", record.render());
        }
        if let Some(newest) = snapshot.messages.first() {
            self.newest_id = Some(newest.id.clone());
        }
    }
}

fn setup(verbose: bool) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging_env(if verbose { Level::DEBUG } else { Level::INFO });
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();
}
