//! A compute unit: executes physical operators over in-memory columns.
//!
//! Connects to the router, optionally ingests base data, and then serves
//! work items, query plans, and query groups until the connection closes.

use clap::Parser;
use gridflow::catalog::Catalog;
use gridflow::ingest::{self, BaseDataFormat};
use gridflow::net::frame::{self, ConfigurationAction, PackageType, UnitType};
use gridflow::net::UnitClient;
use gridflow::orchestrator::OrchestratorConfig;
use gridflow::plan::{ClientUuid, PlanResponse, QueryGroup, QueryPlan, WorkItem};
use gridflow::unit::{ResponseSink, UnitFrontend};
use gridflow::worker::{Topology, WorkerPool};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gridflow-unit", about = "Gridflow compute unit")]
struct Args {
    /// Router address.
    #[arg(long, default_value = "127.0.0.1")]
    ip: String,

    /// Router port.
    #[arg(long, default_value_t = 23232)]
    port: u16,

    /// Display name announced to the router.
    #[arg(long, default_value = "ComputeUnit")]
    name: String,

    /// Initial worker count; defaults to the logical cores of one node.
    #[arg(long)]
    worker: Option<usize>,

    /// Base-data ingest root (contains schema.txt).
    #[arg(long)]
    path: Option<PathBuf>,

    /// Base-data layout.
    #[arg(long, default_value = "bin")]
    basedata: BaseDataFormat,

    /// NUMA node to pin workers to; -1 means all nodes.
    #[arg(long, default_value_t = -1)]
    node: i64,

    /// NUMA node holding ingested base data; -1 means unbound.
    #[arg(long, default_value_t = -1)]
    cxl_node: i64,

    /// Number of NUMA nodes to split the cores into.
    #[arg(long, default_value_t = 1)]
    numa_nodes: usize,

    /// Verbose logging (debug level unless RUST_LOG overrides).
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn optional_node(value: i64) -> Option<usize> {
    (value >= 0).then_some(value as usize)
}

/// Routes front-end responses over the live router connection.
struct TcpSink {
    client: Arc<UnitClient>,
}

impl ResponseSink for TcpSink {
    fn send_plan_response(&self, target: ClientUuid, response: &PlanResponse) {
        if let Err(err) = self.client.send(PackageType::PlanResponse, target, response) {
            error!(%err, "failed to send plan response");
        }
    }

    fn forward_work(&self, target: ClientUuid, item: &WorkItem) {
        if let Err(err) = self.client.send(PackageType::RerouteWork, target, item) {
            error!(%err, "failed to forward work item");
        }
    }

    fn send_text(&self, target: ClientUuid, text: &str) {
        if let Err(err) = self.client.text_response(text, target) {
            error!(%err, "failed to send text response");
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let topology = Topology::detect(args.numa_nodes);
    let workers = args.worker.unwrap_or_else(|| topology.cores_per_node().max(1));

    let catalog = Arc::new(Catalog::new());
    if let Some(path) = &args.path {
        info!(path = %path.display(), format = %args.basedata, "ingesting base data");
        ingest::ingest(path, args.basedata, &catalog, optional_node(args.cxl_node))?;
        info!(
            columns = catalog.column_count(),
            bytes = catalog.total_size(),
            "base data ingested"
        );
    }

    let client = Arc::new(UnitClient::connect(
        &args.ip,
        args.port,
        UnitType::ComputeUnit,
        &args.name,
    )?);

    let pool = WorkerPool::new(workers, optional_node(args.node), topology);
    let sink = Arc::new(TcpSink {
        client: Arc::clone(&client),
    });
    let frontend = UnitFrontend::install(
        Arc::clone(&catalog),
        Arc::clone(&pool),
        sink,
        OrchestratorConfig::default(),
    );

    let work_frontend = Arc::clone(&frontend);
    let work_cb: gridflow::net::FrameCallback = Arc::new(move |header, payload| {
        match frame::decode_payload::<WorkItem>(payload) {
            Ok(item) => work_frontend.handle_work(header.src_uuid, item),
            Err(err) => error!(%err, "undecodable work item"),
        }
    });
    client.add_callback(PackageType::Work, Arc::clone(&work_cb));
    client.add_callback(PackageType::RerouteWork, work_cb);

    let plan_frontend = Arc::clone(&frontend);
    client.add_callback(
        PackageType::QueryPlan,
        Arc::new(move |header, payload| match frame::decode_payload::<QueryPlan>(payload) {
            Ok(plan) => plan_frontend.handle_query_plan(header.src_uuid, plan),
            Err(err) => error!(%err, "undecodable query plan"),
        }),
    );

    let group_frontend = Arc::clone(&frontend);
    client.add_callback(
        PackageType::QueryGroup,
        Arc::new(move |header, payload| match frame::decode_payload::<QueryGroup>(payload) {
            Ok(group) => group_frontend.handle_query_group(header.src_uuid, group),
            Err(err) => error!(%err, "undecodable query group"),
        }),
    );

    let config_frontend = Arc::clone(&frontend);
    let config_name = args.name.clone();
    client.add_callback(
        PackageType::ConfigurationAction,
        Arc::new(move |header, payload| {
            match frame::decode_payload::<ConfigurationAction>(payload) {
                Ok(action) => {
                    config_frontend.handle_configuration(header.src_uuid, action, &config_name)
                }
                Err(err) => error!(%err, "undecodable configuration action"),
            }
        }),
    );

    client.add_callback(
        PackageType::Text,
        Arc::new(|header, payload| match frame::decode_payload::<String>(payload) {
            Ok(text) => info!(src = header.src_uuid, text, "text message"),
            Err(err) => warn!(%err, "undecodable text message"),
        }),
    );

    client.start()?;
    info!(name = args.name, workers, "compute unit running");
    client.wait_until_closed();
    Ok(())
}
