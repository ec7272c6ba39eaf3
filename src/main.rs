#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]

//! mavhub binary: CLI parsing, thread wiring and shutdown.

use anyhow::{Context, Result};
use clap::Parser;
use mavhub::config::{Configuration, LogLevel, UartEndpointConfig, UdpEndpointConfig, UdpMode};
use mavhub::controller::{
    Controller, Operation, OperationStatus, SpawnedThread, Target, HTTP_SERVER, MAINLOOP,
    STATISTICS,
};
use mavhub::error::RouterError;
use mavhub::extensions::ExtensionManager;
use mavhub::management::ManagementContext;
use mavhub::router::RouterInstance;
use mavhub::stats::{self, StatsRegistry};
use mavhub::threads::{ThreadContext, ThreadManager};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "mavhub",
    version,
    about = "MAVLink message router with a runtime management plane"
)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short = 'c', long = "conf-file")]
    conf_file: Option<PathBuf>,

    /// Path to a JSON configuration file
    #[arg(short = 'j', long = "json-conf-file")]
    json_conf_file: Option<PathBuf>,

    /// TCP listen port of the router-owned server
    #[arg(short = 't', long = "tcp-port")]
    tcp_port: Option<u16>,

    /// Report endpoint statistics periodically
    #[arg(short = 'r', long = "report-stats")]
    report_stats: bool,

    /// Log level: error, warning, info, debug, trace
    #[arg(short = 'g', long = "log-level")]
    log_level: Option<LogLevel>,

    /// Shortcut for --log-level debug
    #[arg(short = 'v', long)]
    verbose: bool,

    /// System id whose endpoints receive all traffic
    #[arg(short = 's', long = "sniffer-sysid")]
    sniffer_sysid: Option<u8>,

    /// Directory for persisted extension configurations
    #[arg(short = 'x', long = "extension-conf-dir")]
    extension_conf_dir: Option<PathBuf>,

    /// Management socket path
    #[arg(long = "management-socket", default_value = "/tmp/mavhub.sock")]
    management_socket: PathBuf,

    /// Extra endpoints: <address>:<port> (UDP server) or <device>[:<baud>] (UART)
    endpoints: Vec<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match build_configuration(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("mavhub: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&args, &config);

    match run(args, Arc::new(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(args: &Args, config: &Configuration) {
    let level = if args.verbose {
        LogLevel::Debug
    } else {
        args.log_level.unwrap_or(config.general.debug_log_level)
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.as_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Loads the config file (JSON wins over TOML) and folds CLI overrides
/// and positional endpoints into it.
fn build_configuration(args: &Args) -> Result<Configuration> {
    let mut config = if let Some(path) = &args.json_conf_file {
        Configuration::load_json(path).context("loading JSON configuration")?
    } else if let Some(path) = &args.conf_file {
        Configuration::load_toml(path).context("loading configuration")?
    } else {
        Configuration::default()
    };

    if let Some(port) = args.tcp_port {
        config.general.tcp_server_port = Some(port);
    }
    if args.report_stats {
        config.general.report_stats = true;
    }
    if let Some(sysid) = args.sniffer_sysid {
        config.general.sniffer_sysid = Some(sysid);
    }
    if let Some(dir) = &args.extension_conf_dir {
        config.general.extension_conf_dir = Some(dir.clone());
    }

    for (i, arg) in args.endpoints.iter().enumerate() {
        add_positional_endpoint(&mut config, arg, i)?;
    }

    config.validate().context("validating configuration")?;
    Ok(config)
}

/// `<device>[:<baud>]` becomes a UART endpoint, `<address>:<port>` a UDP
/// server endpoint.
fn add_positional_endpoint(config: &mut Configuration, arg: &str, index: usize) -> Result<()> {
    if arg.starts_with('/') {
        let (device, baud) = match arg.rsplit_once(':') {
            Some((device, baud)) => {
                let baud: u32 = baud
                    .parse()
                    .with_context(|| format!("invalid baudrate in '{arg}'"))?;
                (device.to_string(), vec![baud])
            }
            None => (arg.to_string(), vec![57600]),
        };
        config.uart_endpoints.push(UartEndpointConfig {
            name: format!("cli-uart-{index}"),
            device,
            baudrates: baud,
            flow_control: false,
            group: None,
            filters: Default::default(),
        });
        return Ok(());
    }

    let (address, port) = arg
        .rsplit_once(':')
        .with_context(|| format!("'{arg}' is neither <device>[:<baud>] nor <address>:<port>"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in '{arg}'"))?;
    config.udp_endpoints.push(UdpEndpointConfig {
        name: format!("cli-udp-{index}"),
        address: address.to_string(),
        port,
        mode: UdpMode::Server,
        group: None,
        filters: Default::default(),
    });
    Ok(())
}

fn run(args: Args, config: Arc<Configuration>) -> Result<()> {
    info!(
        uart = config.uart_endpoints.len(),
        udp = config.udp_endpoints.len(),
        tcp = config.tcp_endpoints.len(),
        "configuration loaded"
    );

    let thread_manager = Arc::new(ThreadManager::new());
    let controller = Arc::new(Controller::new(thread_manager.clone()));
    let extension_manager = Arc::new(ExtensionManager::new(thread_manager.clone()));
    extension_manager.set_global_config(config.clone());
    if let Some(dir) = &config.general.extension_conf_dir {
        extension_manager.set_conf_dir(dir.clone());
    }

    // The statistics worker reads whatever registry the current primary
    // router publishes; restarts swap it out here.
    let registry_slot: Arc<RwLock<Option<StatsRegistry>>> = Arc::new(RwLock::new(None));

    register_mainloop_callback(
        &controller,
        thread_manager.clone(),
        config.clone(),
        registry_slot.clone(),
    );
    register_statistics_callback(
        &controller,
        thread_manager.clone(),
        config.clone(),
        registry_slot.clone(),
    );
    register_management_callback(
        &controller,
        thread_manager.clone(),
        controller.clone(),
        extension_manager.clone(),
        args.management_socket.clone(),
    );

    let has_endpoints = !config.uart_endpoints.is_empty()
        || !config.udp_endpoints.is_empty()
        || !config.tcp_endpoints.is_empty()
        || config.general.tcp_server_port.is_some();

    if has_endpoints {
        let response = controller.execute(Operation::Start, Target::Mainloop);
        if response.status != OperationStatus::Success {
            anyhow::bail!("could not start primary router: {}", response.message);
        }
    } else {
        info!("no endpoints configured, waiting for management commands");
    }

    if config.general.report_stats {
        let response = controller.execute(Operation::Start, Target::Statistics);
        if response.status != OperationStatus::Success {
            warn!("statistics thread did not start: {}", response.message);
        }
    }

    #[cfg(unix)]
    {
        let response = controller.execute(Operation::Start, Target::HttpServer);
        if response.status != OperationStatus::Success {
            warn!("management plane did not start: {}", response.message);
        }
    }

    if let Some(dir) = &config.general.extension_conf_dir {
        match extension_manager.load_extension_configs(dir) {
            Ok(count) if count > 0 => info!(count, "extensions restored from {}", dir.display()),
            Ok(_) => {}
            Err(e) => warn!("extension autoload failed: {e}"),
        }
    }

    wait_for_shutdown()?;

    info!("shutting down");
    extension_manager.stop_all();
    controller.execute(Operation::Stop, Target::All);

    // Bounded wait for the primary router, then release the management
    // plane last
    if let Some(snapshot) = controller.snapshot(MAINLOOP) {
        if !thread_manager
            .join_thread(snapshot.thread_id, Duration::from_secs(5))
            .unwrap_or(true)
        {
            warn!("primary router did not exit within timeout");
        }
    }
    if let Some(snapshot) = controller.snapshot(HTTP_SERVER) {
        let _ = thread_manager.stop_thread(snapshot.thread_id);
        let _ = thread_manager.join_thread(snapshot.thread_id, Duration::from_secs(2));
    }

    info!("shutdown complete");
    Ok(())
}

fn wait_for_shutdown() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building signal runtime")?;
    runtime.block_on(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("signal wait failed: {e}");
        } else {
            info!("interrupt received");
        }
    });
    Ok(())
}

fn register_mainloop_callback(
    controller: &Controller,
    thread_manager: Arc<ThreadManager>,
    config: Arc<Configuration>,
    registry_slot: Arc<RwLock<Option<StatsRegistry>>>,
) {
    controller.register_restart_callback(MAINLOOP, move || {
        let mut router = RouterInstance::new(MAINLOOP, &config.general);
        let control = router.control();
        *registry_slot.write() = Some(router.stats_registry());

        let config = config.clone();
        let thread_id = thread_manager
            .create_thread(move |ctx| run_router_thread(router, config, ctx))?;
        Ok(SpawnedThread {
            thread_id,
            attachment: format!("router_{MAINLOOP}"),
            control: Some(control),
        })
    });
}

/// Body of the primary router thread: open, add endpoints, loop. The
/// outer scope force-closes every tracked handle no matter how the inner
/// body ended.
fn run_router_thread(mut router: RouterInstance, config: Arc<Configuration>, ctx: ThreadContext) {
    let control = router.control();
    let tracked = router.tracked_handles();

    let result = (|| -> mavhub::error::Result<i32> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| RouterError::internal(format!("runtime build failed: {e}")))?;

        runtime.block_on(async {
            router.open()?;
            router.add_endpoints(&config).await?;

            // Mirror the thread-manager stop flag onto this instance
            let watcher_control = control.clone();
            let watcher = tokio::spawn(async move {
                loop {
                    if ctx.should_stop() {
                        watcher_control.request_exit(0);
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            });

            let retcode = router.run().await;
            watcher.abort();
            Ok(retcode)
        })
    })();

    match result {
        Ok(retcode) => info!(retcode, "primary router exited"),
        Err(e) => error!("primary router failed: {e}"),
    }
    tracked.force_close_all();
}

fn register_statistics_callback(
    controller: &Controller,
    thread_manager: Arc<ThreadManager>,
    config: Arc<Configuration>,
    registry_slot: Arc<RwLock<Option<StatsRegistry>>>,
) {
    controller.register_restart_callback(STATISTICS, move || {
        let config = config.clone();
        let registry_slot = registry_slot.clone();
        let thread_id = thread_manager
            .create_thread(move |ctx| run_statistics_thread(config, registry_slot, ctx))?;
        Ok(SpawnedThread {
            thread_id,
            attachment: "statistics_reporter".to_string(),
            control: None,
        })
    });
}

fn run_statistics_thread(
    config: Arc<Configuration>,
    registry_slot: Arc<RwLock<Option<StatsRegistry>>>,
    ctx: ThreadContext,
) {
    let report_every = Duration::from_secs(config.statistics.report_interval_secs.max(1));
    let json_every = Duration::from_secs(config.statistics.json_interval_secs.max(1));
    let mut last_report = Instant::now();
    let mut last_json = Instant::now();

    while !ctx.should_stop() {
        ctx.wait_if_paused();
        std::thread::sleep(Duration::from_millis(200));

        let registry = registry_slot.read().clone();
        let Some(registry) = registry else { continue };

        if last_report.elapsed() >= report_every {
            stats::log_summary(&registry);
            last_report = Instant::now();
        }
        if let Some(path) = &config.statistics.json_output_path {
            if last_json.elapsed() >= json_every {
                if let Err(e) = stats::write_json_snapshot(&registry, path) {
                    warn!("stats snapshot failed: {e}");
                }
                last_json = Instant::now();
            }
        }
    }
}

#[cfg(unix)]
fn register_management_callback(
    controller: &Controller,
    thread_manager: Arc<ThreadManager>,
    controller_arc: Arc<Controller>,
    extension_manager: Arc<ExtensionManager>,
    socket_path: PathBuf,
) {
    controller.register_restart_callback(HTTP_SERVER, move || {
        let context = Arc::new(ManagementContext {
            controller: controller_arc.clone(),
            extensions: extension_manager.clone(),
        });
        let socket_path = socket_path.clone();
        let thread_id = thread_manager
            .create_thread(move |ctx| run_management_thread(context, socket_path, ctx))?;
        Ok(SpawnedThread {
            thread_id,
            attachment: "management_socket".to_string(),
            control: None,
        })
    });
}

#[cfg(not(unix))]
fn register_management_callback(
    _controller: &Controller,
    _thread_manager: Arc<ThreadManager>,
    _controller_arc: Arc<Controller>,
    _extension_manager: Arc<ExtensionManager>,
    _socket_path: PathBuf,
) {
    warn!("management socket is only available on unix platforms");
}

#[cfg(unix)]
fn run_management_thread(
    context: Arc<ManagementContext>,
    socket_path: PathBuf,
    ctx: ThreadContext,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("management runtime build failed: {e}");
            return;
        }
    };

    runtime.block_on(async {
        let token = tokio_util::sync::CancellationToken::new();
        let watcher_token = token.clone();
        let watcher = tokio::spawn(async move {
            loop {
                if ctx.should_stop() {
                    watcher_token.cancel();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });

        if let Err(e) = mavhub::management::serve_unix(context, socket_path, token).await {
            error!("management socket failed: {e}");
        }
        watcher.abort();
    });
}
