// Copyright (C) 2025-2026 The readmark developers
//
// This file is part of readmark.
//
// readmark is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// readmark is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with readmark.  If not,
// see <http://www.gnu.org/licenses/>.

//! # readmarkd
//!
//! The readmark daemon: two axum listeners (the public Action API and the internal Counter
//! Adjustment API) plus the background propagation dispatcher, all wired to a single storage
//! backend chosen at startup.
//!
//! readmarkd is built to run in the foreground, under a supervisor or in a container; it logs to
//! stdout (JSON by default, human-readable with `--plain`) and exports metrics over OTLP when so
//! configured.

use std::{
    collections::HashMap,
    env,
    future::IntoFuture,
    io,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use clap::{crate_authors, crate_version, value_parser, Arg, ArgAction, Command};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use secrecy::SecretString;
use serde::Deserialize;
use snafu::{prelude::*, IntoError};
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
    sync::Notify,
};
use tracing::{error, info, Level};
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, Layer, Registry};
use url::Url;
use uuid::Uuid;

use readmark::{
    actions::{make_ops_router, make_router as make_action_router},
    client::HttpDeliver,
    counters::make_router as make_counter_router,
    dispatcher,
    entities::DestinationName,
    http::Readmark,
    metrics::{check_metric_registrations, Instruments},
    recorder::Recorder,
    storage::Backend as StorageBackend,
};

/// The readmarkd application error type
///
/// Contra the usual approach of keeping a module's error type small, at the application level this
/// offers a fairly rich set of errors in the hopes of helping operators.
///
/// Note that [Debug] is implemented by hand: `main()` returns `Result<(), Error>`, and on the
/// `Err` path the Rust runtime prints the `Debug` rendition to stderr; the derived implementation
/// is not very readable, and in the presence of a backtrace, verbose as well.
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind to {addr}: {source}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("Failed to create the delivery client: {source}"))]
    Client { source: readmark::client::Error },
    #[snafu(display("Unable to read configuration file: {source}"))]
    ConfigNotFound {
        pth: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Error parsing configuration file: {source}"))]
    ConfigParse {
        pth: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("Couldn't resolve the present working directory: {source}"))]
    CurrentDir { source: std::io::Error },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("While building the OTLP exporter, {source}"))]
    OtlpExporter {
        source: opentelemetry_otlp::ExporterBuildError,
    },
    #[snafu(display("Failed to connect to ScyllaDB: {source}"))]
    Scylla {
        #[snafu(source(from(readmark::scylla::Error, Box::new)))]
        source: Box<readmark::scylla::Error>,
    },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          configuration                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Logging-related options read from the command line or the environment
struct LogOpts {
    pub plain: bool,
    pub level: Level,
}

impl LogOpts {
    fn new(matches: &clap::ArgMatches) -> LogOpts {
        LogOpts {
            plain: matches.get_flag("plain"),
            level: match (
                matches.get_flag("debug"),
                matches.get_flag("verbose"),
                matches.get_flag("quiet"),
            ) {
                (true, _, _) => Level::TRACE,
                (false, true, _) => Level::DEBUG,
                (false, false, true) => Level::ERROR,
                (_, _, _) => Level::INFO,
            },
        }
    }
}

/// Configuration options read from the CLI (or the environment)
struct CliOpts {
    pub instance_id: Uuid,
    pub log_opts: LogOpts,
    pub cfg: Option<PathBuf>,
}

impl CliOpts {
    fn new(matches: clap::ArgMatches) -> Result<CliOpts> {
        let here = env::current_dir().context(CurrentDirSnafu)?;
        Ok(CliOpts {
            instance_id: matches
                .get_one::<Uuid>("instance-id")
                .cloned()
                .unwrap_or(Uuid::new_v4()),
            log_opts: LogOpts::new(&matches),
            cfg: matches
                .get_one::<PathBuf>("config")
                .cloned()
                .map(|p| here.join(p)),
        })
    }
}

/// Datastore credentials
// Nb that we can only deserialize (i.e. not serialize) due to the presence of secrets in the
// struct
#[derive(Clone, Debug, Deserialize)]
pub struct Credentials {
    pub username: SecretString,
    pub password: SecretString,
}

/// readmark datastore configuration
///
/// Most of readmark writes to a generic API ([Backend]); at startup a particular *implementation*
/// of that API is chosen, according to this configuration.
///
/// [Backend]: readmark::storage::Backend
#[derive(Clone, Debug, Deserialize)]
pub enum StorageConfig {
    /// Keep everything in process memory; suitable for development & demos only
    Memory,
    /// Use ScyllaDB/CQL interface
    Scylla {
        /// ScyllaDB credentials, if authentication is to be used
        credentials: Option<Credentials>,
        /// ScyllaDB hosts; specify as "host:port"
        hosts: Vec<String>,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Scylla {
            credentials: None,
            hosts: vec!["localhost:9042".to_string()],
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct OtelExportConfig {
    /// Endpoint that will receive metric data in OTLP format
    endpoint: Url,
    /// Interval at which metrics will be pushed to `endpoint`; defaults to 60 seconds
    interval: Option<Duration>,
}

/// readmark configuration, version one
#[derive(Clone, Debug, Deserialize)]
struct ConfigV1 {
    /// OTLP export target; None means don't export
    #[serde(rename = "otlp-export")]
    otlp_export: Option<OtelExportConfig>,
    /// Local address at which to listen for public requests; specify as "address:port". This is
    /// the address to which readmarkd will bind a listening socket for the Action API.
    #[serde(rename = "public-address")]
    public_address: SocketAddr,
    /// Address at which to listen for service-to-service requests (the Counter Adjustment API &
    /// the operator endpoints); specify as "address:port"
    #[serde(rename = "internal-address")]
    internal_address: SocketAddr,
    #[serde(rename = "storage-config")]
    storage_config: StorageConfig,
    /// Shared secret demanded of (and presented to) peer services on internal requests
    #[serde(rename = "service-token")]
    service_token: SecretString,
    /// Peer base URLs, by destination name ("content-service", "user-service")
    destinations: HashMap<String, Url>,
    dispatcher: dispatcher::Config,
}

impl ConfigV1 {
    pub fn public_address(&self) -> &SocketAddr {
        &self.public_address
    }
    pub fn internal_address(&self) -> &SocketAddr {
        &self.internal_address
    }
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            otlp_export: None,
            public_address: "0.0.0.0:20750".parse::<SocketAddr>().unwrap(/* known good */),
            internal_address: "127.0.0.1:20751".parse::<SocketAddr>().unwrap(/* known good */),
            storage_config: StorageConfig::default(),
            // Development default; any real deployment sets this in config.
            service_token: SecretString::from("readmark-dev-token"),
            destinations: HashMap::new(),
            dispatcher: dispatcher::Config::default(),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")] // tag "internally"
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse the readmark configuration file
fn parse_config(cfg: &Option<PathBuf>) -> Result<ConfigV1> {
    let (pth, defaulted): (PathBuf, bool) = cfg.as_ref().map_or_else(
        || (PathBuf::from_str("/etc/readmark.toml").unwrap(), true),
        |p| (p.clone(), false),
    );
    match std::fs::read_to_string(&pth) {
        Ok(text) => match toml::from_str::<Configuration>(&text) {
            Ok(cfg) => match cfg {
                Configuration::V1(cfg) => Ok(cfg),
            },
            Err(err) => Err(ConfigParseSnafu { pth }.into_error(err)),
        },
        Err(err) => {
            if defaulted {
                Ok(ConfigV1::default())
            } else {
                Err(ConfigNotFoundSnafu { pth }.into_error(err))
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       logging & telemetry                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Configure readmark logging
///
/// readmarkd always logs to stdout (the expected case being a container whose runtime collects
/// it); `--plain` selects human-readable output over JSON.
///
/// This method can only be invoked once (as it, in turn, calls tracing's
/// [set_global_default](tracing::subscriber::set_global_default)).
fn configure_logging(logopts: &LogOpts) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(logopts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;

    // `json()` & `compact()` produce `Layer` instances *of different types*; it is for this
    // reason that `Box<dyn Layer<S> + Send + Sync>` implements `Layer`:
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = if logopts.plain {
        Box::new(fmt::Layer::default().compact().with_writer(io::stdout))
    } else {
        Box::new(
            fmt::Layer::default()
                .json()
                .with_current_span(true)
                .with_writer(io::stdout),
        )
    };

    tracing::subscriber::set_global_default(Registry::default().with(formatter).with(filter))
        .context(SubscriberSnafu)
}

/// Initialize telemetry
///
/// <div class="warning">
///
/// This method must be invoked from inside the Tokio runtime, but before any instruments are
/// accessed.
///
/// </div>
fn init_telemetry(collector_config: Option<&OtelExportConfig>) -> Result<()> {
    check_metric_registrations();

    let mut provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder().with_resource(
        opentelemetry_sdk::Resource::builder_empty()
            .with_attribute(KeyValue::new("service.name", "readmark"))
            .build(),
    );

    if let Some(config) = collector_config {
        let otlp_exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_http()
            .with_endpoint(config.endpoint.as_str())
            .with_protocol(opentelemetry_otlp::Protocol::HttpBinary)
            .build()
            .context(OtlpExporterSnafu)?;

        let mut reader = opentelemetry_sdk::metrics::PeriodicReader::builder(otlp_exporter);
        if let Some(interval) = config.interval {
            reader = reader.with_interval(interval);
        }
        let reader = reader.build();

        provider = provider.with_reader(reader);
    }

    global::set_meter_provider(provider.build());

    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the server                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn healthcheck() -> &'static str {
    "GOOD"
}

pub async fn select_storage(
    config: &StorageConfig,
    ledger_retention: Duration,
) -> Result<Arc<dyn StorageBackend + Send + Sync>> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(readmark::memory::InMemory::new())),
        StorageConfig::Scylla { credentials, hosts } => {
            let credentials = credentials
                .as_ref()
                .map(|c| (c.username.clone(), c.password.clone()));
            Ok(Arc::new(
                readmark::scylla::Session::new(hosts, &credentials, ledger_retention)
                    .await
                    .context(ScyllaSnafu)?,
            ))
        }
    }
}

/// Serve readmark API requests
#[tracing::instrument(skip(opts, cfg), fields(instance_id = %opts.instance_id))]
async fn serve(opts: CliOpts, mut cfg: ConfigV1) -> Result<()> {
    // Produce a future which can be used to signal graceful shutdown, below.
    async fn shutdown_signal(nfy: Arc<Notify>) {
        nfy.notified().await
    }

    let mut sighup = signal(SignalKind::hangup()).unwrap();
    let mut sigint = signal(SignalKind::interrupt()).unwrap();
    let mut sigterm = signal(SignalKind::terminate()).unwrap();

    init_telemetry(cfg.otlp_export.as_ref())?;

    let instruments = Arc::new(Instruments::new("readmark"));

    // Loop forever, handling SIGHUPs, until asked to terminate:
    loop {
        // Re-build our database connections each pass, in case configuration values have changed:
        let storage =
            select_storage(&cfg.storage_config, cfg.dispatcher.ledger_retention).await?;

        let deliver = Arc::new(
            HttpDeliver::new(
                cfg.destinations
                    .iter()
                    .map(|(name, url)| (DestinationName::new(name.clone()), url.clone()))
                    .collect(),
                cfg.service_token.clone(),
                cfg.dispatcher.delivery_timeout,
            )
            .context(ClientSnafu)?,
        );

        // Move the dispatch loop into a `Processor`, which lets us shut it down in an orderly
        // manner:
        let processor = dispatcher::new(
            storage.clone(),
            deliver,
            Some(cfg.dispatcher.clone()),
            instruments.clone(),
        );

        let state = Arc::new(Readmark {
            storage: storage.clone(),
            recorder: Recorder::new(storage),
            service_token: cfg.service_token.clone(),
            instruments: instruments.clone(),
        });

        let public_nfy = Arc::new(Notify::new());
        let internal_nfy = Arc::new(Notify::new());

        let public_router = axum::Router::new()
            .route("/healthcheck", axum::routing::get(healthcheck))
            .merge(make_action_router(state.clone()))
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(state.clone());

        let internal_router = axum::Router::new()
            .merge(make_counter_router(state.clone()))
            .merge(make_ops_router(state.clone()))
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(state.clone());

        let public_server = axum::serve(
            TcpListener::bind(cfg.public_address())
                .await
                .context(BindSnafu {
                    addr: *cfg.public_address(),
                })?,
            public_router,
        )
        .with_graceful_shutdown(shutdown_signal(public_nfy.clone()));

        let internal_server = axum::serve(
            TcpListener::bind(cfg.internal_address())
                .await
                .context(BindSnafu {
                    addr: *cfg.internal_address(),
                })?,
            internal_router,
        )
        .with_graceful_shutdown(shutdown_signal(internal_nfy.clone()));

        let (mut processor_join_handle, processor_shutdown) = processor.into_parts();

        let mut public_server = public_server.into_future();
        let mut internal_server = internal_server.into_future();

        fn log_on_err<T, E>(x: StdResult<T, E>)
        where
            E: std::error::Error + std::fmt::Debug,
        {
            if let Err(err) = x {
                error!("{:?}", err);
            }
        }

        tokio::select! {
            // Intentionally not handling these-- the servers *should* never shutdown on their own.
            // That said, if I don't move `public_server` into a Future, it never gets polled.
            _ = &mut public_server => unimplemented!(),
            _ = &mut internal_server => unimplemented!(),
            _ = sighup.recv() => { // Future<Output = Option<()>>
                info!("Received SIGHUP; closing DB connections to re-read configuration.");
                // Signal our axum servers to shut-down...
                public_nfy.notify_one();
                internal_nfy.notify_one();
                // & wait for them to complete.
                log_on_err(public_server.await);
                log_on_err(internal_server.await);
                // Shut-down the dispatcher, too; its leases expire on their own, so a botched
                // shutdown here costs us nothing but a delayed redelivery.
                processor_shutdown.notify_one();
                match tokio::time::timeout(Duration::from_secs(5), processor_join_handle).await {
                    Ok(Err(err)) => error!("Failed to shut-down the dispatcher: {:?}", err),
                    Err(err) => error!("Failed waiting to shut-down the dispatcher: {:?}", err),
                    _ => (),
                };
                // Cool! Now re-read our configuration:
                cfg = match parse_config(&opts.cfg) {
                    Ok(cfg) => cfg,
                    Err(_) => cfg
                };
            }
            signal = async {
                tokio::select! {
                    _ = sigint.recv() => "SIGINT",
                    _ = sigterm.recv() => "SIGTERM",
                }
            } => {
                info!("Received {signal}; terminating.");
                // That's it-- we're outta here. Signal our axum servers to shut-down...
                public_nfy.notify_one();
                internal_nfy.notify_one();
                // wait for our axum servers to complete...
                log_on_err(public_server.await);
                log_on_err(internal_server.await);
                // and shut-down the dispatcher:
                processor_shutdown.notify_one();
                // There's not much to be done on failure here, but if there is a problem, I'd
                // like to at least know:
                match tokio::time::timeout(Duration::from_secs(5), processor_join_handle).await {
                    Ok(Err(err)) => error!("Failed to shut-down the dispatcher: {:?}", err),
                    Err(err) => error!("Failed waiting to shut-down the dispatcher: {:?}", err),
                    _ => (),
                };
                break;
            }
            res = &mut processor_join_handle => {
                // This shouldn't happen!
                error!("The propagation dispatcher exited early with {:?}; shutting-down.", res);
                // 🤷 OK, well, not much to be done, here, except to signal our axum servers to
                // shutdown...
                public_nfy.notify_one();
                internal_nfy.notify_one();
                // wait for them...
                log_on_err(public_server.await);
                log_on_err(internal_server.await);
                // and bail.
                break;
            },
        }; // End tokio::select!.
    } // End loop.

    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    main() & process startup                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn go_async(opts: CliOpts) -> Result<()> {
    // Failure to parse at this point is fatal; in `serve()`, on SIGHUP, we fall back to the last
    // "known-good" configuration & keep going.
    let cfg = parse_config(&opts.cfg)?;

    info!(
        "readmark version {}, instance {} starting.",
        crate_version!(),
        opts.instance_id
    );

    serve(opts, cfg).await
}

fn main() -> Result<()> {
    // Most of readmarkd's configuration options are read from file; the few command-line options
    // that it accepts govern 1) where to find the configuration file, 2) logging, which needs to
    // be configured before the configuration file is parsed. They all have corresponding
    // environment variables for the sake of convenience when running readmark in a container.
    let opts = CliOpts::new(
        Command::new("readmarkd")
            .version(crate_version!())
            .author(crate_authors!())
            .about("Reading actions, propagated")
            .long_about(
                "`readmark` records per-user reading actions & reliably propagates the \
                 corresponding counter adjustments to its peer services.",
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("READMARK_CONFIG")
                    .help(
                        "path (absolute or relative to the process' current directory) to a \
                       configuration file",
                    ),
            )
            .arg(
                Arg::new("debug")
                    .short('D')
                    .long("debug")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("READMARK_DEBUG")
                    .help("produce debug output"),
            )
            .arg(
                // I'm not sure if I want to allow this to be set in config. For now, just CLI and
                // env.
                Arg::new("instance-id")
                    .short('I')
                    .long("instance-id")
                    .num_args(1)
                    .value_parser(value_parser!(Uuid))
                    .env("READMARK_INSTANCE_ID")
                    .help("Instance ID (only salient when running in a cluster)")
                    .long_help(
                        "Instance ID
A UUID identifying this readmark instance in a cluster. If not given, a random UUID will be used.",
                    ),
            )
            .arg(
                Arg::new("plain")
                    .short('p')
                    .long("plain")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("READMARK_PLAIN")
                    .help("log in human-readable format, not JSON/structured logging"),
            )
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("READMARK_QUIET")
                    .help("produce only error output"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("READMARK_VERBOSE")
                    .help("produce prolix output"),
            )
            .get_matches(),
    )?;

    configure_logging(&opts.log_opts)?;

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(go_async(opts)) // and start our server!
}
