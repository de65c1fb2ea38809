//! The central router/grouper process.
//!
//! Accepts planner, compute-unit, and monitor connections; batches
//! incoming query plans into time windows; clusters and rewrites each
//! sealed window into query groups; and forwards everything else between
//! its clients.

use clap::Parser;
use gridflow::dag::PlanDag;
use gridflow::net::frame::{
    self, PackageType, ServerConfiguration, ServerConfigurationResponse, UnitType,
    UuidForUnitRequest, UuidForUnitResponse,
};
use gridflow::net::{MetaHeader, RouterServer};
use gridflow::plan::QueryPlan;
use gridflow::router::collection::{CollectionManager, PlanCollection};
use gridflow::router::schema::ColumnSizes;
use gridflow::router::{Grouper, GroupingConfig};
use gridflow::ident::UniqueId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gridflow-router", about = "Gridflow central router and grouper")]
struct Args {
    /// Listen port.
    #[arg(long, default_value_t = 23232)]
    port: u16,

    /// Verbose logging (debug level unless RUST_LOG overrides).
    #[arg(short, long)]
    verbose: bool,

    /// Grouping window in milliseconds.
    #[arg(long, default_value_t = 100)]
    window_ms: u64,

    /// Maximum merge-overhead ratio for group merging.
    #[arg(long, default_value_t = 2.0)]
    max_overhead: f32,

    /// Schema file for base-column sizes (schema.txt format).
    #[arg(long)]
    schema: Option<PathBuf>,

    /// Per-table row counts for the size table, as `table=rows`.
    #[arg(long = "rows", value_parser = parse_rows)]
    rows: Vec<(String, u64)>,
}

fn parse_rows(s: &str) -> Result<(String, u64), String> {
    let (table, rows) = s
        .split_once('=')
        .ok_or_else(|| format!("expected table=rows, got {s:?}"))?;
    Ok((
        table.to_string(),
        rows.parse().map_err(|e| format!("bad row count: {e}"))?,
    ))
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Rebuild the original frame bytes from a received header and payload.
fn reframe(header: &MetaHeader, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; frame::META_SIZE + payload.len()];
    header.write_to(&mut out[..frame::META_SIZE]);
    out[frame::META_SIZE..].copy_from_slice(payload);
    out
}

fn make_manager(
    server: &Arc<RouterServer>,
    grouper: &Arc<Grouper>,
    window: Duration,
) -> CollectionManager {
    let server = Arc::clone(server);
    let grouper = Arc::clone(grouper);
    CollectionManager::new(
        window,
        Box::new(move || {
            let server = Arc::clone(&server);
            let grouper = Arc::clone(&grouper);
            PlanCollection::new(Box::new(move |dags| {
                let compute_units: Vec<u64> = server
                    .uuids_for_type(UnitType::ComputeUnit)
                    .into_iter()
                    .map(|(_, uuid)| uuid)
                    .collect();
                let planners = server.uuids_for_type(UnitType::QueryPlanner);
                if planners.is_empty() {
                    error!("no query planner connected, cannot dispatch groups");
                    return;
                }
                let src_uuid = planners[0].1;

                for (target, group) in grouper.analyze(dags, &compute_units) {
                    match frame::encode_frame(PackageType::QueryGroup, src_uuid, target, &group) {
                        Ok(bytes) => {
                            if let Some(client) = server.get_client(target) {
                                server.send_to(&client, &bytes);
                                server.send_to_all_of_type(UnitType::Monitor, &bytes);
                            } else {
                                error!(target, "group target not found");
                            }
                        }
                        Err(err) => error!(%err, "failed to encode query group"),
                    }
                }
            }))
        }),
    )
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut sizes = ColumnSizes::new();
    if let Some(schema) = &args.schema {
        let row_counts: HashMap<String, u64> = args.rows.iter().cloned().collect();
        sizes = ColumnSizes::from_schema_file(schema, &row_counts)?;
        info!(columns = sizes.len(), "loaded base-column size table");
    } else if !args.rows.is_empty() {
        warn!("--rows without --schema has no effect");
    }

    let server = Arc::new(RouterServer::bind(args.port)?);
    let ids = Arc::new(UniqueId::new());
    let mut grouper = Grouper::new(sizes, ids);
    grouper.grouping = GroupingConfig {
        max_merge_overhead: args.max_overhead,
    };
    let grouper = Arc::new(grouper);

    let manager = Arc::new(RwLock::new(make_manager(
        &server,
        &grouper,
        Duration::from_millis(args.window_ms),
    )));

    // Forwarding: targeted frames go to their target, untargeted work to a
    // random compute unit; monitors see a copy of everything forwarded.
    let forward_server = Arc::clone(&server);
    let forward_cb: gridflow::net::FrameCallback = Arc::new(move |header, payload| {
        let bytes = reframe(header, payload);
        if header.tgt_uuid != 0 {
            match forward_server.get_client(header.tgt_uuid) {
                Some(target) => {
                    forward_server.send_to(&target, &bytes);
                }
                None => {
                    error!(uuid = header.tgt_uuid, "forward target not found");
                    return;
                }
            }
        } else {
            forward_server.send_to_any_of_type(UnitType::ComputeUnit, &bytes);
        }
        forward_server.send_to_all_of_type(UnitType::Monitor, &bytes);
    });

    for package in [
        PackageType::Work,
        PackageType::TaskFinished,
        PackageType::PlanResponse,
        PackageType::ConnectAction,
        PackageType::ConnectActionInfo,
        PackageType::ConfigurationAction,
    ] {
        server.add_callback(package, Arc::clone(&forward_cb));
    }

    // Text addressed to the router is logged, anything else forwarded.
    let text_forward = Arc::clone(&forward_cb);
    server.add_callback(
        PackageType::Text,
        Arc::new(move |header, payload| {
            if header.tgt_uuid == 0 {
                match frame::decode_payload::<String>(payload) {
                    Ok(text) => info!(src = header.src_uuid, text, "text message"),
                    Err(err) => warn!(%err, "undecodable text message"),
                }
            } else {
                text_forward(header, payload);
            }
        }),
    );

    // Plans enter the grouping window.
    let plan_manager = Arc::clone(&manager);
    server.add_callback(
        PackageType::QueryPlan,
        Arc::new(move |header, payload| {
            match frame::decode_payload::<QueryPlan>(payload) {
                Ok(plan) => {
                    let dag = PlanDag::build(plan, header.src_uuid, header.tgt_uuid);
                    for issue in &dag.report().warnings {
                        warn!(%issue, "plan validation warning");
                    }
                    if !dag.report().is_ok() {
                        for issue in &dag.report().errors {
                            error!(%issue, "plan validation error");
                        }
                    }
                    plan_manager.read().add_dag(dag);
                }
                Err(err) => error!(%err, "undecodable query plan"),
            }
        }),
    );

    // A draining compute unit pushes work back; reroute it elsewhere.
    let reroute_server = Arc::clone(&server);
    server.add_callback(
        PackageType::RerouteWork,
        Arc::new(move |header, payload| {
            info!(src = header.src_uuid, "rerouting forwarded work");
            let mut fresh = MetaHeader::new(PackageType::RerouteWork, header.tgt_uuid, 0);
            fresh.payload_size = payload.len() as u32;
            let bytes = reframe(&fresh, payload);
            reroute_server.reroute_to_any_of_type(
                UnitType::ComputeUnit,
                Some(header.src_uuid),
                &bytes,
            );
            reroute_server.send_to_all_of_type(UnitType::Monitor, &bytes);
        }),
    );

    // Client discovery for planners.
    let uuid_server = Arc::clone(&server);
    server.add_callback(
        PackageType::UuidForUnitRequest,
        Arc::new(move |header, payload| {
            let Ok(request) = frame::decode_payload::<UuidForUnitRequest>(payload) else {
                warn!("undecodable uuid-for-unit request");
                return;
            };
            let members = uuid_server.uuids_for_type(request.unit_type);
            let response = UuidForUnitResponse {
                unit_type: request.unit_type,
                names: members.iter().map(|(name, _)| name.clone()).collect(),
                uuids: members.iter().map(|(_, uuid)| *uuid).collect(),
            };
            let Ok(bytes) = frame::encode_frame(
                PackageType::UuidForUnitResponse,
                header.src_uuid,
                header.tgt_uuid,
                &response,
            ) else {
                return;
            };
            match uuid_server.get_client(header.src_uuid) {
                Some(requester) => {
                    uuid_server.send_to(&requester, &bytes);
                    uuid_server.send_to_all_of_type(UnitType::Monitor, &bytes);
                }
                None => warn!(uuid = header.src_uuid, "uuid request from unknown client"),
            }
        }),
    );

    // Monitor snapshot of the client registry.
    let monitor_server = Arc::clone(&server);
    server.add_callback(
        PackageType::MonitorRequest,
        Arc::new(move |header, _payload| {
            let info = monitor_server.monitor_info();
            let Ok(bytes) =
                frame::encode_frame(PackageType::Text, header.src_uuid, header.tgt_uuid, &info)
            else {
                return;
            };
            if let Some(monitor) = monitor_server.get_client(header.src_uuid) {
                monitor_server.send_to(&monitor, &bytes);
            }
        }),
    );

    // Live reconfiguration of the grouping window.
    let config_server = Arc::clone(&server);
    let config_manager = Arc::clone(&manager);
    let config_grouper = Arc::clone(&grouper);
    let config_base = Arc::clone(&server);
    server.add_callback(
        PackageType::ServerConfiguration,
        Arc::new(move |header, payload| {
            let mut success = true;
            match frame::decode_payload::<ServerConfiguration>(payload) {
                Ok(config) => {
                    if config.window_ms.is_some() || config.max_merge_overhead.is_some() {
                        let window =
                            Duration::from_millis(config.window_ms.unwrap_or(100));
                        let mut grouper = Grouper::new(
                            config_grouper.sizes.clone(),
                            Arc::clone(&config_grouper.ids),
                        );
                        grouper.grouping = GroupingConfig {
                            max_merge_overhead: config.max_merge_overhead.unwrap_or(2.0),
                        };
                        *config_manager.write() =
                            make_manager(&config_base, &Arc::new(grouper), window);
                        info!(?config, "rebuilt collection manager");
                    }
                }
                Err(err) => {
                    error!(%err, "undecodable server configuration");
                    success = false;
                }
            }
            let Ok(bytes) = frame::encode_frame(
                PackageType::ServerConfigurationResponse,
                header.tgt_uuid,
                header.src_uuid,
                &ServerConfigurationResponse { success },
            ) else {
                return;
            };
            if let Some(requester) = config_server.get_client(header.src_uuid) {
                config_server.send_to(&requester, &bytes);
            }
        }),
    );

    server.start();
    info!(port = args.port, window_ms = args.window_ms, "router running");

    // Runs until killed; all servicing happens on the receiver threads.
    loop {
        std::thread::park();
    }
}
