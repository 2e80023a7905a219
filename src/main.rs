use clap::Parser;
use env_logger::Env;
use log::warn;
use rscout::{
    brute_force::{BruteForceEngine, BruteForceRequest, BruteForceTarget},
    cli::{Cli, Commands, DictArgs, ScanArgs},
    config::Config,
    control::{Channel, EventBus, ScanController},
    dir_scan::{DirScanRequest, DirectoryScanner},
    discovery::{NetworkDiscovery, ScanRequest},
    display::{spawn_event_printer, DisplayManager},
    js_finder::{JsFinder, JsFinderOptions},
    persistence::{PersistenceQueue, SqliteStore},
    utils::{time::format_duration, wordlist::create_default_wordlists},
    Result,
};
use std::process;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Everything a command needs at runtime.
struct Runtime {
    config: Config,
    display: DisplayManager,
    persistence: PersistenceQueue,
    scan: Arc<ScanController>,
    dir_scan: Arc<ScanController>,
    js_finder: Arc<ScanController>,
    brute_force: Arc<BruteForceEngine>,
    interrupted: CancellationToken,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    let display = DisplayManager::with_quiet(cli.quiet).with_json_events(cli.json);
    display.print_banner("RSCOUT - Internal Network Reconnaissance", Some("Authorized Testing Only"));

    let mut config = match &cli.config {
        Some(path) => match Config::load_from_file(&path.to_string_lossy()) {
            Ok(config) => {
                display.print_success(&format!("Loaded configuration from {}", path.display()));
                config
            }
            Err(e) => {
                display.print_warning(&format!("Failed to load configuration: {}, using defaults", e));
                Config::default()
            }
        },
        None => Config::default(),
    };
    apply_overrides(&mut config, &cli);

    let start_time = Instant::now();
    let result = match &cli.command {
        Commands::InitConfig { output } => init_config(&display, output),
        Commands::InitDicts => init_dicts(&config, &display).await,
        command => run_engines(config, display, command).await,
    };

    match result {
        Ok(()) => display.print_success(&format!("Done in {}", format_duration(start_time.elapsed()))),
        Err(e) => {
            display.print_error(&format!("Failed: {}", e));
            process::exit(1);
        }
    }
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(threads) = cli.threads {
        config.scan.threads = threads;
        config.web_scan.threads = threads;
        config.js_finder.concurrency = threads;
        config.brute_force.threads = threads;
    }
    if let Some(timeout) = cli.timeout {
        config.scan.timeout = timeout;
        config.web_scan.request_timeout = timeout;
        config.js_finder.request_timeout = timeout;
        config.brute_force.connection_timeout = timeout;
    }
    if let Some(database) = &cli.database {
        config.storage.database_path = database.clone();
    }
    if let Some(dict_dir) = &cli.dict_dir {
        config.wordlists.dict_dir = dict_dir.clone();
    }
}

fn init_config(display: &DisplayManager, output: &std::path::Path) -> Result<()> {
    Config::default().save_to_file(&output.to_string_lossy())?;
    display.print_success(&format!("Wrote default configuration to {}", output.display()));
    Ok(())
}

async fn init_dicts(config: &Config, display: &DisplayManager) -> Result<()> {
    create_default_wordlists(
        &config.wordlists.dict_dir,
        &config.brute_force.user_dict,
        &config.brute_force.pass_dict,
        &config.web_scan.default_wordlist,
    )
    .await?;
    display.print_success(&format!("Wrote dictionaries to {}", config.wordlists.dict_dir.display()));
    Ok(())
}

async fn run_engines(config: Config, display: DisplayManager, command: &Commands) -> Result<()> {
    if let Some(parent) = config.storage.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = SqliteStore::open(&config.storage.database_path, config.busy_timeout())?;
    let persistence = PersistenceQueue::spawn(store, config.storage.queue_capacity)?;

    let events = Arc::new(EventBus::new());
    let printer = spawn_event_printer(display, events.subscribe());

    let interrupted = CancellationToken::new();
    let controller =
        |channel| Arc::new(ScanController::new(channel, events.clone()).with_parent(interrupted.clone()));
    let runtime = Runtime {
        display,
        persistence: persistence.clone(),
        scan: controller(Channel::Scan),
        dir_scan: controller(Channel::DirScan),
        js_finder: controller(Channel::JsFinder),
        brute_force: Arc::new(BruteForceEngine::new(&config, persistence.clone(), events.clone())),
        interrupted,
        config,
    };

    let interrupted = runtime.interrupted.clone();
    let controllers = [runtime.scan.clone(), runtime.dir_scan.clone(), runtime.js_finder.clone()];
    let brute_force = runtime.brute_force.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted, stopping workers...");
            interrupted.cancel();
            for controller in &controllers {
                controller.stop();
            }
            brute_force.stop();
        }
    });

    let result = match command {
        Commands::Scan(args) => execute_scan(&runtime, args).await.map(|_| ()),
        Commands::DirScan {
            target,
            wordlist,
            extensions,
            depth,
            follow_redirects,
            include_404,
        } => {
            let mut request = DirScanRequest::from_config(&runtime.config, target);
            request.wordlist = wordlist.clone();
            if let Some(extensions) = extensions {
                request.extensions = extensions.clone();
            }
            if let Some(depth) = depth {
                request.recursion_depth = *depth;
            }
            request.follow_redirects |= *follow_redirects;
            request.exclude_404 &= !*include_404;
            execute_dir_scan(&runtime, &request).await
        }
        Commands::JsFind {
            target,
            deep,
            active,
            no_danger_filter,
        } => {
            let mut options = JsFinderOptions::from_config(&runtime.config);
            options.deep_scan |= *deep;
            options.active_scan |= *active;
            options.danger_filter &= !*no_danger_filter;
            execute_js_find(&runtime, target, &options).await
        }
        Commands::Brute {
            targets,
            dicts,
            protocols,
        } => {
            let mut request = brute_request(&runtime.config, dicts);
            request.targets = targets
                .iter()
                .map(|t| t.parse::<BruteForceTarget>())
                .collect::<Result<Vec<_>>>()?;
            if let Some(protocols) = protocols {
                request.protocols = protocols.clone();
            }
            execute_brute_force(&runtime, &request).await
        }
        Commands::Full { scan, dicts, no_brute } => execute_full_scan(&runtime, scan, dicts, *no_brute).await,
        Commands::InitDicts | Commands::InitConfig { .. } => Ok(()),
    };

    if let Err(e) = persistence.flush().await {
        warn!("Failed to flush pending writes: {}", e);
    }
    persistence.shutdown().await;
    events.close();
    let _ = printer.await;

    result
}

async fn execute_scan(runtime: &Runtime, args: &ScanArgs) -> Result<rscout::discovery::ScanSummary> {
    runtime.display.print_section_header("HOST DISCOVERY & PORT SCAN");

    let mut config = runtime.config.clone();
    config.discovery.skip_alive_check |= args.no_ping;
    config.discovery.enable_udp |= args.udp;
    config.discovery.grab_banners |= args.banners;

    let request = ScanRequest::from_config(&config, &args.target, &args.ports);
    let discovery = NetworkDiscovery::new(config, runtime.persistence.clone());
    let session = runtime.scan.begin();
    let summary = discovery.run_scan(&session, &request).await?;

    runtime.display.print_scan_summary(&summary);
    Ok(summary)
}

async fn execute_dir_scan(runtime: &Runtime, request: &DirScanRequest) -> Result<()> {
    runtime.display.print_section_header("DIRECTORY SCAN");

    let scanner = DirectoryScanner::new(&runtime.config, runtime.persistence.clone());
    let session = runtime.dir_scan.begin();
    let report = scanner.run(&session, request).await?;

    runtime.display.print_dir_report(&report);
    Ok(())
}

async fn execute_js_find(runtime: &Runtime, target: &str, options: &JsFinderOptions) -> Result<()> {
    runtime.display.print_section_header("JS FINDER");

    let finder = JsFinder::new(runtime.persistence.clone());
    let session = runtime.js_finder.begin();
    let result = finder.find(&session, target, options).await?;

    runtime.display.print_js_result(&result);
    Ok(())
}

fn brute_request(config: &Config, dicts: &DictArgs) -> BruteForceRequest {
    let mut request = BruteForceRequest::from_config(config);
    if let Some(users) = &dicts.users {
        request.user_dict = users.clone();
    }
    if let Some(passwords) = &dicts.passwords {
        request.pass_dict = passwords.clone();
    }
    request
}

async fn execute_brute_force(runtime: &Runtime, request: &BruteForceRequest) -> Result<()> {
    runtime.display.print_section_header("CREDENTIAL BRUTE FORCE");

    match runtime.brute_force.run(request).await? {
        Some(report) => runtime.display.print_brute_report(&report),
        None => runtime.display.print_warning("Brute force is already running"),
    }
    Ok(())
}

async fn execute_full_scan(runtime: &Runtime, args: &ScanArgs, dicts: &DictArgs, no_brute: bool) -> Result<()> {
    runtime.display.print_info("Phase 1: Discovery");
    let summary = execute_scan(runtime, args).await?;
    if summary.cancelled {
        return Ok(());
    }

    let web_targets = summary.web_targets();
    if !web_targets.is_empty() {
        runtime
            .display
            .print_info(&format!("Phase 2: Crawling {} web services", web_targets.len()));
    }
    let js_options = JsFinderOptions::from_config(&runtime.config);
    for target in &web_targets {
        if runtime.interrupted.is_cancelled() {
            return Ok(());
        }
        let request = DirScanRequest::from_config(&runtime.config, target);
        if let Err(e) = execute_dir_scan(runtime, &request).await {
            runtime.display.print_warning(&format!("Directory scan of {} failed: {}", target, e));
        }
        if runtime.interrupted.is_cancelled() {
            return Ok(());
        }
        if let Err(e) = execute_js_find(runtime, target, &js_options).await {
            runtime.display.print_warning(&format!("JS finder on {} failed: {}", target, e));
        }
    }

    if no_brute || runtime.interrupted.is_cancelled() {
        return Ok(());
    }
    let registry = runtime.brute_force.registry();
    let mut request = brute_request(&runtime.config, dicts);
    request.targets = summary
        .service_targets()
        .into_iter()
        .filter(|target| registry.supports(&target.service))
        .collect();
    if request.targets.is_empty() {
        runtime.display.print_info("No services to brute force");
        return Ok(());
    }
    runtime
        .display
        .print_info(&format!("Phase 3: Brute forcing {} services", request.targets.len()));
    execute_brute_force(runtime, &request).await
}
