use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::info;
use tokio::sync::{mpsc, Mutex};

use obsdaemon::clock::AstronomicalClock;
use obsdaemon::config::Config;
use obsdaemon::coordinator::Coordinator;
use obsdaemon::net::{ListenerPorts, Registry};
use obsdaemon::notify::database::{DbReporter, HttpDbReporter, NullDbReporter};
use obsdaemon::notify::ntp;
use obsdaemon::pidfile::PidFile;
use obsdaemon::plan::PlanStore;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the XML configuration file.
    #[arg(short, long, env = "OBSDAEMON_CONFIG", default_value = "obsdaemon.xml")]
    config: PathBuf,

    /// Write a fully-populated default configuration to `config` and exit.
    #[arg(short = 'd', long)]
    write_default_config: bool,

    /// Path to the PID file guarding against a second running instance.
    #[arg(long, env = "OBSDAEMON_PIDFILE", default_value = "/var/run/obsdaemon.pid")]
    pidfile: PathBuf,
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = Args::parse();

    if args.write_default_config {
        Config::write_default(&args.config)
            .await
            .expect("failed to write default config");
        info!("wrote default configuration to {}", args.config.display());
        return;
    }

    let config = Config::load(&args.config)
        .await
        .expect("failed to load configuration");

    let _pidfile = PidFile::acquire(&args.pidfile).expect("failed to acquire pidfile");

    let (session_tx, session_rx) = mpsc::unbounded_channel();
    let ports = ListenerPorts {
        client: config.network_server.client,
        mount: config.network_server.mount,
        camera: config.network_server.camera,
        telescope_generic: config.network_server.telescope_generic,
        annex: config.network_server.annex,
    };
    let registry = Registry::bind(ports, session_tx)
        .await
        .expect("failed to bind listeners");

    let clock = Arc::new(Mutex::new(AstronomicalClock::new(config.clock_sites())));
    let (clock_tx, clock_rx) = mpsc::unbounded_channel();
    obsdaemon::clock::spawn(clock.clone(), clock_tx);

    let plans = Arc::new(PlanStore::new(config.obs_plan.path.clone()));
    let registered = config
        .registered_systems()
        .into_iter()
        .map(|(id, _)| id)
        .collect::<Vec<_>>();
    plans
        .load_day(chrono::Utc::now().date_naive(), &registered)
        .await
        .expect("failed to load today's observation plans");
    obsdaemon::plan::spawn_sweep(plans.clone());

    if config.ntp.enabled {
        ntp::spawn(config.ntp.host.clone(), std::time::Duration::from_millis(config.ntp.max_diff_ms));
    }

    let db: Arc<dyn DbReporter> = if config.database.enabled {
        Arc::new(HttpDbReporter::new(config.database.url.clone()))
    } else {
        Arc::new(NullDbReporter)
    };

    let default_elevation_limit = 20.0;
    let coordinator = Arc::new(Coordinator::new(registry, clock, plans, db, default_elevation_limit));
    for (id, elevation_limit) in config.registered_systems() {
        coordinator.register_system(id, Some(elevation_limit)).await;
    }

    info!("obsdaemon starting with config {}", args.config.display());
    coordinator.run(session_rx, clock_rx).await;
}
